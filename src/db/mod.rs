//! The uniform database surface: everything the replicator (or any other
//! consumer) needs, implemented identically by local databases over any
//! backend and by remote CouchDB-compatible peers.

mod local;

pub use self::local::{BatchOp, LocalDatabase, MemoryDatabase, SqliteDatabase};

use crate::{
    error::Result,
    protocol::{Change, DocResult, Document, Missing, Rev, Revs},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Parameters of a bulk read.
#[derive(Debug)]
pub struct ReadRequest {
    pub id: String,
    pub revs: Revs,
    /// Revisions the caller already has. `Some` inlines the attachments
    /// changed since then (`Some(vec![])` inlines all of them); `None`
    /// returns stubs only.
    pub atts_since: Option<Vec<Rev>>,
}

impl ReadRequest {
    pub fn winner(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revs: Revs::Winner,
            atts_since: None,
        }
    }
}

/// A replication peer. Implemented by [`LocalDatabase`] for in-process
/// backends and by [`HttpDatabase`](crate::remote::HttpDatabase) for remote
/// ones; the replicator is written once against this trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Stable identifier used to derive replication ids.
    async fn id(&self) -> Result<String>;

    /// Creates the database. `Ok(false)` if it already existed.
    async fn create(&self) -> Result<bool>;

    /// The current update sequence. Fails with `NotFound` if the database
    /// does not exist.
    async fn update_seq(&self) -> Result<u64>;

    /// The changes feed, starting strictly after `since`. A continuous feed
    /// stays open and resumes whenever new writes commit.
    fn changes(&self, since: Option<u64>, continuous: bool) -> BoxStream<'static, Result<Change>>;

    /// For each `(id, revs)` pair of the input, which of those revisions
    /// this database is missing and which of its leaves could be extended.
    fn revs_diff(
        &self,
        input: BoxStream<'static, (String, Vec<Rev>)>,
    ) -> BoxStream<'static, Result<Missing>>;

    /// Reads the selected revisions of one document; unknown ids yield a
    /// [`DocResult::NotFound`] marker rather than an error.
    fn read(&self, request: ReadRequest) -> BoxStream<'static, Result<DocResult>>;

    /// Stores a document revision, replication style: the revision history
    /// in `doc.path` is merged as-is and conflicts are not an error.
    async fn write(&self, doc: Document) -> Result<()>;

    /// Reads the local (unreplicated) document `id`; no `_local/` prefix.
    async fn read_local(&self, id: &str) -> Result<Option<Value>>;

    /// Writes or, with `None`, deletes a local document.
    async fn write_local(&self, id: &str, value: Option<Value>) -> Result<()>;

    /// Makes sure everything written so far is durable.
    async fn ensure_full_commit(&self) -> Result<()>;
}
