//! Attachment metadata, the per-leaf attachment store and chunk arithmetic.
//!
//! Attachment bytes live in the backend as a sequence of chunk blobs. While
//! the chunks are streamed in, the cumulative byte count after each chunk is
//! recorded (`chunk_ends`), which later allows O(log n) byte-range reads by
//! bisection.

use super::{rev::Rev, tree::Branch};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, pin::Pin};

/// Lazily produced attachment bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

/// Wraps a fully materialized byte string as a [`ByteStream`].
pub fn byte_stream(data: impl Into<Bytes>) -> ByteStream {
    Box::pin(futures_util::stream::iter([Ok(data.into())]))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MetadataRepr", into = "MetadataRepr")]
pub struct AttachmentMetadata {
    /// Revision number at which this attachment was added.
    pub rev_pos: u64,
    pub content_type: String,
    pub length: u64,
    /// `"md5-"` + base64 of the md5 over the concatenated chunks.
    pub digest: String,
}

type MetadataRepr = (u64, String, u64, String);

impl From<MetadataRepr> for AttachmentMetadata {
    fn from((rev_pos, content_type, length, digest): MetadataRepr) -> Self {
        Self {
            rev_pos,
            content_type,
            length,
            digest,
        }
    }
}

impl From<AttachmentMetadata> for MetadataRepr {
    fn from(meta: AttachmentMetadata) -> Self {
        (meta.rev_pos, meta.content_type, meta.length, meta.digest)
    }
}

/// An attachment as it travels inside a [`Document`](super::Document).
pub enum Attachment {
    /// Metadata only: the bytes are unchanged from a known prior revision.
    Stub(AttachmentMetadata),
    /// Bytes to be written; length and digest are computed while the stream
    /// is consumed.
    New(NewAttachment),
    /// Bytes loaded from a database, with known metadata.
    Stored(StoredAttachment),
}

pub struct NewAttachment {
    pub rev_pos: u64,
    pub content_type: String,
    pub data: ByteStream,
}

pub struct StoredAttachment {
    pub meta: AttachmentMetadata,
    pub data: ByteStream,
}

impl Attachment {
    pub fn is_stub(&self) -> bool {
        matches!(self, Self::Stub(_))
    }

    /// Metadata, when already known (`New` attachments have none until their
    /// stream has been consumed).
    pub fn meta(&self) -> Option<&AttachmentMetadata> {
        match self {
            Self::Stub(meta) => Some(meta),
            Self::Stored(stored) => Some(&stored.meta),
            Self::New(_) => None,
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stub(meta) => f.debug_tuple("Stub").field(meta).finish(),
            Self::New(new) => f
                .debug_struct("New")
                .field("rev_pos", &new.rev_pos)
                .field("content_type", &new.content_type)
                .finish_non_exhaustive(),
            Self::Stored(stored) => f
                .debug_struct("Stored")
                .field("meta", &stored.meta)
                .finish_non_exhaustive(),
        }
    }
}

/// Incremental md5 + length over an attachment's chunk stream. Both are
/// computed exactly once, during the single write pass.
pub struct Digester {
    context: md5::Context,
    length: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
            length: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.context.consume(chunk);
        self.length += chunk.len() as u64;
    }

    pub fn finish(self) -> (u64, String) {
        let digest = format!("md5-{}", base64::encode(self.context.compute().0));
        (self.length, digest)
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

/// Location of an attachment's chunks in the backend's local keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DataPtrRepr", into = "DataPtrRepr")]
pub struct DataPtr {
    pub att_id: String,
    /// Cumulative byte count after each chunk: `[len1, len1 + len2, ..]`.
    pub chunk_ends: Vec<u64>,
}

type DataPtrRepr = (String, Vec<u64>);

impl From<DataPtrRepr> for DataPtr {
    fn from((att_id, chunk_ends): DataPtrRepr) -> Self {
        Self { att_id, chunk_ends }
    }
}

impl From<DataPtr> for DataPtrRepr {
    fn from(ptr: DataPtr) -> Self {
        (ptr.att_id, ptr.chunk_ends)
    }
}

/// Backend key of the `index`-th chunk of attachment `att_id`. The index is
/// zero padded to a fixed width so lexical key order equals chunk order.
pub fn chunk_key(att_id: &str, index: usize) -> String {
    format!("_chunk_{att_id}_{index:020}")
}

/// Key range plus edge offsets covering the byte range `[start, end)` of an
/// attachment, located by bisecting `chunk_ends`.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkSlice {
    pub start_key: String,
    pub end_key: String,
    pub start_offset: Option<u64>,
    pub end_offset: Option<u64>,
    pub last_index: usize,
}

impl DataPtr {
    pub fn total_length(&self) -> u64 {
        self.chunk_ends.last().copied().unwrap_or(0)
    }

    /// Slices the byte range `[start, end)`; `None` bounds extend to the
    /// respective edge. Returns `None` for an attachment with no chunks.
    pub fn slice(&self, start: Option<u64>, end: Option<u64>) -> Option<ChunkSlice> {
        if self.chunk_ends.is_empty() {
            return None;
        }

        let (start_chunk, start_offset) = match start {
            None => (0, None),
            Some(start) => {
                let i = self.chunk_ends.partition_point(|&e| e <= start);
                (i, Some(start - self.chunk_start(i)))
            }
        };
        let (end_chunk, end_offset) = match end {
            None => (self.chunk_ends.len() - 1, None),
            Some(end) => {
                let i = self.chunk_ends.partition_point(|&e| e < end);
                (i, Some(end - self.chunk_start(i)))
            }
        };

        Some(ChunkSlice {
            start_key: chunk_key(&self.att_id, start_chunk),
            end_key: chunk_key(&self.att_id, end_chunk),
            start_offset,
            end_offset,
            last_index: end_chunk - start_chunk,
        })
    }

    fn chunk_start(&self, chunk_index: usize) -> u64 {
        if chunk_index == 0 {
            0
        } else {
            self.chunk_ends[chunk_index - 1]
        }
    }
}

/// A record in the per-leaf attachment store: metadata plus chunk location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecordRepr", into = "RecordRepr")]
pub struct AttachmentRecord {
    pub meta: AttachmentMetadata,
    pub data_ptr: DataPtr,
}

type RecordRepr = (AttachmentMetadata, DataPtr);

impl From<RecordRepr> for AttachmentRecord {
    fn from((meta, data_ptr): RecordRepr) -> Self {
        Self { meta, data_ptr }
    }
}

impl From<AttachmentRecord> for RecordRepr {
    fn from(record: AttachmentRecord) -> Self {
        (record.meta, record.data_ptr)
    }
}

/// Selects which attachments of a read are inlined with their bodies.
///
/// `since_revs: Some([])` means "return all attachments"; `None` means
/// "return stubs only, except for those explicitly named".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentSelector {
    pub names: Vec<String>,
    pub since_revs: Option<Vec<Rev>>,
}

impl AttachmentSelector {
    pub fn all() -> Self {
        Self {
            names: Vec::new(),
            since_revs: Some(Vec::new()),
        }
    }

    pub fn named(names: Vec<String>) -> Self {
        Self {
            names,
            since_revs: None,
        }
    }
}

/// The attachments of one non-deleted leaf, keyed by name. Persisted next to
/// the leaf's body under its doc pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentStore(BTreeMap<String, AttachmentRecord>);

/// A resolved entry being merged into a store by a write.
pub enum MergeEntry {
    /// A stub sent by the client; must match an existing record.
    Stub(AttachmentMetadata),
    /// Freshly chunked bytes.
    Written(AttachmentMetadata, DataPtr),
}

impl AttachmentStore {
    /// Splits the store into ready stubs and records whose bodies the caller
    /// must materialize, according to `selector`.
    ///
    /// A record with `rev_pos = p` is unchanged since `since_revs` iff some
    /// `(n, h)` in it satisfies `p <= n` and the branch contains `(n, h)`.
    pub fn read(
        &self,
        branch: &Branch,
        selector: &AttachmentSelector,
    ) -> (
        BTreeMap<String, AttachmentMetadata>,
        Vec<(String, AttachmentRecord)>,
    ) {
        let mut stubs = BTreeMap::new();
        let mut todo = Vec::new();

        for (name, record) in &self.0 {
            let changed = changed_since(
                record.meta.rev_pos,
                selector.since_revs.as_deref(),
                branch,
            );
            if changed || selector.names.iter().any(|n| n == name) {
                todo.push((name.clone(), record.clone()));
            } else {
                stubs.insert(name.clone(), record.meta.clone());
            }
        }

        (stubs, todo)
    }

    /// Replaces the store contents with `entries`. Stubs must reuse an
    /// existing record with a matching `rev_pos` (the content type may
    /// change, like CouchDB allows). Returns the data pointers of records
    /// that were dropped, so their chunks can be released.
    pub fn merge(&mut self, entries: BTreeMap<String, MergeEntry>) -> Result<Vec<DataPtr>> {
        let mut merged = BTreeMap::new();

        // resolve stubs first so nothing changes when one fails
        for (name, entry) in entries {
            let record = match entry {
                MergeEntry::Stub(meta) => {
                    let old = self
                        .0
                        .get(&name)
                        .ok_or(Error::PreconditionFailed("stub without attachment"))?;
                    if meta.rev_pos != old.meta.rev_pos {
                        return Err(Error::PreconditionFailed("stub with wrong rev_pos"));
                    }
                    AttachmentRecord {
                        meta,
                        data_ptr: old.data_ptr.clone(),
                    }
                }
                MergeEntry::Written(meta, data_ptr) => AttachmentRecord { meta, data_ptr },
            };
            merged.insert(name, record);
        }

        let freed = self
            .0
            .iter()
            .filter(|(name, _)| !merged.contains_key(*name))
            .map(|(_, record)| record.data_ptr.clone())
            .collect();

        self.0 = merged;
        Ok(freed)
    }

    pub fn get(&self, name: &str) -> Option<&AttachmentRecord> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttachmentRecord)> {
        self.0.iter()
    }
}

fn changed_since(record_rev_pos: u64, since_revs: Option<&[Rev]>, branch: &Branch) -> bool {
    let Some(revs) = since_revs else {
        return false;
    };

    !revs
        .iter()
        .any(|rev| record_rev_pos <= rev.num && branch.contains(rev.num, &rev.hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn meta(rev_pos: u64, length: u64) -> AttachmentMetadata {
        AttachmentMetadata {
            rev_pos,
            content_type: "application/octet-stream".into(),
            length,
            digest: format!("md5-fake{length}"),
        }
    }

    fn record(rev_pos: u64, att_id: &str, chunk_ends: Vec<u64>) -> AttachmentRecord {
        AttachmentRecord {
            meta: meta(rev_pos, chunk_ends.last().copied().unwrap_or(0)),
            data_ptr: DataPtr {
                att_id: att_id.into(),
                chunk_ends,
            },
        }
    }

    fn store(entries: Vec<(&str, AttachmentRecord)>) -> AttachmentStore {
        AttachmentStore(
            entries
                .into_iter()
                .map(|(name, record)| (name.to_owned(), record))
                .collect(),
        )
    }

    #[test]
    fn digest_matches_known_value() {
        let mut digester = Digester::new();
        digester.update(b"Hello ");
        digester.update(b"World!");
        let (length, digest) = digester.finish();

        assert_eq!(length, 12);
        assert_eq!(digest, "md5-7Qdih1MuhjZehB6Sv8UNjA==");
    }

    #[test]
    fn chunk_keys_order_lexically() {
        let a = chunk_key("att", 2);
        let b = chunk_key("att", 10);
        assert!(a < b);
    }

    #[test]
    fn slice_without_bounds_covers_everything() {
        let ptr = DataPtr {
            att_id: "a".into(),
            chunk_ends: vec![4, 10, 12],
        };
        let slice = ptr.slice(None, None).unwrap();

        assert_eq!(slice.start_key, chunk_key("a", 0));
        assert_eq!(slice.end_key, chunk_key("a", 2));
        assert_eq!(slice.start_offset, None);
        assert_eq!(slice.end_offset, None);
        assert_eq!(slice.last_index, 2);
    }

    #[test]
    fn slice_bisects_into_the_middle() {
        // chunks: [0, 4), [4, 10), [10, 12)
        let ptr = DataPtr {
            att_id: "a".into(),
            chunk_ends: vec![4, 10, 12],
        };

        let slice = ptr.slice(Some(5), Some(11)).unwrap();
        assert_eq!(slice.start_key, chunk_key("a", 1));
        assert_eq!(slice.end_key, chunk_key("a", 2));
        assert_eq!(slice.start_offset, Some(1));
        assert_eq!(slice.end_offset, Some(1));
        assert_eq!(slice.last_index, 1);

        // a chunk boundary on both sides selects exactly one chunk
        let slice = ptr.slice(Some(4), Some(10)).unwrap();
        assert_eq!(slice.start_key, chunk_key("a", 1));
        assert_eq!(slice.end_key, chunk_key("a", 1));
        assert_eq!(slice.start_offset, Some(0));
        assert_eq!(slice.end_offset, Some(6));
        assert_eq!(slice.last_index, 0);
    }

    #[test]
    fn slice_of_empty_attachment_is_none() {
        let ptr = DataPtr {
            att_id: "a".into(),
            chunk_ends: vec![],
        };
        assert_eq!(ptr.slice(None, None), None);
    }

    #[test]
    fn merge_reuses_record_for_stub() {
        let mut store = store(vec![("file", record(1, "x", vec![3]))]);

        let mut meta2 = meta(1, 3);
        meta2.content_type = "text/plain".into();
        let freed = store
            .merge(BTreeMap::from([(
                "file".to_owned(),
                MergeEntry::Stub(meta2),
            )]))
            .unwrap();

        assert!(freed.is_empty());
        let kept = store.get("file").unwrap();
        assert_eq!(kept.data_ptr.att_id, "x");
        // content type may change on stub reuse
        assert_eq!(kept.meta.content_type, "text/plain");
    }

    #[test]
    fn merge_rejects_stub_without_record() {
        let mut store = AttachmentStore::default();
        let result = store.merge(BTreeMap::from([(
            "file".to_owned(),
            MergeEntry::Stub(meta(1, 3)),
        )]));
        assert_matches!(result, Err(Error::PreconditionFailed(_)));
    }

    #[test]
    fn merge_rejects_stub_with_wrong_rev_pos() {
        let mut store = store(vec![("file", record(1, "x", vec![3]))]);
        let result = store.merge(BTreeMap::from([(
            "file".to_owned(),
            MergeEntry::Stub(meta(2, 3)),
        )]));
        assert_matches!(result, Err(Error::PreconditionFailed(_)));
    }

    #[test]
    fn merge_drops_unnamed_records_and_frees_their_chunks() {
        let mut store = store(vec![
            ("keep", record(1, "x", vec![3])),
            ("drop", record(1, "y", vec![2, 4])),
        ]);

        let freed = store
            .merge(BTreeMap::from([(
                "keep".to_owned(),
                MergeEntry::Stub(meta(1, 3)),
            )]))
            .unwrap();

        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].att_id, "y");
        assert!(store.get("drop").is_none());
    }

    #[test]
    fn read_stubs_unchanged_records() {
        let branch = Branch::new(
            3,
            vec!["c".into(), "b".into(), "a".into()],
            Some("ptr".into()),
        );
        let store = store(vec![
            ("old", record(1, "x", vec![3])),
            ("new", record(3, "y", vec![2])),
        ]);

        // client has rev 2-b: "old" (rev_pos 1) is unchanged, "new" is not
        let selector = AttachmentSelector {
            names: vec![],
            since_revs: Some(vec![Rev::new(2, "b")]),
        };
        let (stubs, todo) = store.read(&branch, &selector);

        assert_eq!(stubs.len(), 1);
        assert!(stubs.contains_key("old"));
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].0, "new");
    }

    #[test]
    fn read_inlines_everything_for_empty_since_revs() {
        let branch = Branch::new(1, vec!["a".into()], Some("ptr".into()));
        let store = store(vec![("file", record(1, "x", vec![3]))]);

        let (stubs, todo) = store.read(&branch, &AttachmentSelector::all());
        assert!(stubs.is_empty());
        assert_eq!(todo.len(), 1);
    }

    #[test]
    fn read_inlines_named_attachments_only() {
        let branch = Branch::new(1, vec!["a".into()], Some("ptr".into()));
        let store = store(vec![
            ("wanted", record(1, "x", vec![3])),
            ("other", record(1, "y", vec![2])),
        ]);

        let selector = AttachmentSelector::named(vec!["wanted".into()]);
        let (stubs, todo) = store.read(&branch, &selector);

        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].0, "wanted");
        assert!(stubs.contains_key("other"));
    }

    #[test]
    fn store_serialization_round_trips() {
        let store = store(vec![("file", record(2, "x", vec![1, 5]))]);
        let encoded = serde_json::to_value(&store).unwrap();
        let decoded: AttachmentStore = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, store);
    }
}
