//! Core data types of the document store: revisions, revision trees,
//! documents, attachments and key collation.

pub mod collation;

mod attachment;
mod document;
mod rev;
mod tree;

pub use self::{
    attachment::{
        byte_stream, Attachment, AttachmentMetadata, AttachmentRecord, AttachmentSelector,
        AttachmentStore, ByteStream, ChunkSlice, DataPtr, Digester, MergeEntry, NewAttachment,
        StoredAttachment,
    },
    document::{
        collect_stream, doc_to_json, json_to_doc, Change, DocResult, Document, FollowsAttachment,
        Missing, Revs,
    },
    rev::Rev,
    tree::{Branch, DocPtr, MergeOutcome, RevTree},
};

pub(crate) use self::attachment::chunk_key;
