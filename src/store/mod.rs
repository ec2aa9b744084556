//! Storage backends: persistence of `id -> (revision tree, seq)` plus the
//! local-document keyspace, behind a uniform transaction interface.
//!
//! The local keyspace doubles as storage for leaf bodies (`_body_<ptr>`),
//! attachment stores (`_att_store_<ptr>`), attachment chunks
//! (`_chunk_<att_id>_<index>`) and the revs limit (`_revs_limit`).

mod memory;
mod sqlite;

pub use self::{memory::MemoryBackend, sqlite::SqliteBackend};

use crate::{error::Result, protocol::RevTree};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;

pub const REVS_LIMIT_KEY: &str = "_revs_limit";
pub const DEFAULT_REVS_LIMIT: usize = 1000;

pub(crate) fn body_key(doc_ptr: &str) -> String {
    format!("_body_{doc_ptr}")
}

pub(crate) fn att_store_key(doc_ptr: &str) -> String {
    format!("_att_store_{doc_ptr}")
}

/// A value in the local keyspace: JSON for local documents, bodies and
/// bookkeeping, raw bytes for attachment chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalValue {
    Json(Value),
    Blob(Bytes),
}

impl LocalValue {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Blob(_) => None,
        }
    }

    pub fn into_blob(self) -> Option<Bytes> {
        match self {
            Self::Json(_) => None,
            Self::Blob(bytes) => Some(bytes),
        }
    }
}

/// A storage backend. Hands out snapshots for reading and serialized
/// transactions for writing.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Read: ReadTransaction + 'static;
    type Write: WriteTransaction + 'static;

    /// Stable identifier of this database, used to derive replication ids.
    fn id(&self) -> &str;

    /// Sets up the persistent structures. `Ok(false)` if they already
    /// existed.
    async fn create(&self) -> Result<bool>;

    /// A consistent snapshot; never blocks writers and is never affected by
    /// commits that happen after it was taken.
    async fn begin_read(&self) -> Result<Self::Read>;

    /// The single write transaction; competing writers wait. Dropping it
    /// without committing rolls everything back.
    async fn begin_write(&self) -> Result<Self::Write>;
}

#[async_trait]
pub trait ReadTransaction: Send {
    async fn update_seq(&mut self) -> Result<u64>;

    /// The revision tree of `id`, or `None` if the document was never
    /// written.
    async fn read(&mut self, id: &str) -> Result<Option<RevTree>>;

    async fn read_local(&mut self, id: &str) -> Result<Option<LocalValue>>;

    /// Documents ordered by id; bounds are inclusive.
    fn all_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, RevTree)>>;

    /// Local keyspace entries ordered by id; bounds are inclusive.
    fn all_local_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, LocalValue)>>;

    /// `(seq, id, tree)` for every document whose seq is strictly greater
    /// than `since`, in seq order.
    fn changes<'a>(&'a mut self, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>>;
}

#[async_trait]
pub trait WriteTransaction: ReadTransaction {
    /// Stores the revision tree of `id` and moves the document to the next
    /// update seq. Applied at commit.
    fn write(&mut self, id: String, tree: RevTree);

    /// Writes (`Some`) or deletes (`None`) a local keyspace entry. Applied
    /// at commit.
    fn write_local(&mut self, id: String, value: Option<LocalValue>);

    /// Atomically applies all buffered writes. The commit is the
    /// linearization point for every write in this transaction.
    async fn commit(self) -> Result<()>;
}

/// The configured revs limit, defaulting to 1000.
pub(crate) async fn read_revs_limit<T: ReadTransaction + ?Sized>(tx: &mut T) -> Result<usize> {
    let limit = tx
        .read_local(REVS_LIMIT_KEY)
        .await?
        .and_then(LocalValue::into_json)
        .and_then(|value| value.as_u64())
        .map(|limit| limit as usize)
        .unwrap_or(DEFAULT_REVS_LIMIT);
    Ok(limit.max(1))
}
