//! A CouchDB-compatible document database core: per-document revision
//! trees, transactional in-memory and SQLite storage backends, an HTTP
//! remote peer, and bidirectional replication between any two of them.

mod db;
mod error;
mod ids;
mod protocol;
mod remote;
mod replicate;
mod store;
mod view;

pub use self::{
    db::{BatchOp, Database, LocalDatabase, MemoryDatabase, ReadRequest, SqliteDatabase},
    error::{Error, Result},
    protocol::{
        byte_stream, collation, collect_stream, doc_to_json, json_to_doc, Attachment,
        AttachmentMetadata, AttachmentSelector, Branch, ByteStream, Change, DocResult, Document,
        MergeOutcome, Missing, NewAttachment, Rev, RevTree, Revs, StoredAttachment,
    },
    remote::HttpDatabase,
    replicate::{
        replicate, HistoryEntry, ReplicationOptions, ReplicationResult, REPLICATION_ID_VERSION,
    },
    store::{Backend, LocalValue, MemoryBackend, ReadTransaction, SqliteBackend, WriteTransaction},
    view::{View, ViewRow},
};
