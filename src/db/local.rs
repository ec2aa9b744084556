//! The database facade: revision-tree and attachment logic applied on top
//! of a storage backend.

use super::{Database, ReadRequest};
use crate::{
    error::{Error, Result},
    ids,
    protocol::{
        chunk_key, Attachment, AttachmentMetadata, AttachmentSelector, AttachmentStore, Branch,
        ByteStream, Change, DataPtr, Digester, DocResult, Document, MergeEntry, MergeOutcome,
        Missing, Rev, RevTree, Revs, StoredAttachment,
    },
    store::{
        att_store_key, body_key, read_revs_limit, Backend, LocalValue, MemoryBackend,
        ReadTransaction, SqliteBackend, WriteTransaction, REVS_LIMIT_KEY,
    },
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

pub type MemoryDatabase = LocalDatabase<MemoryBackend>;
pub type SqliteDatabase = LocalDatabase<SqliteBackend>;

/// A CouchDB-compatible database over a local storage backend.
///
/// Bodies of non-leaf revisions are never kept, so the database effectively
/// auto-compacts continuously; revisions are a replication mechanism, not a
/// history one. Writing acts like `_bulk_docs` with `new_edits=false`:
/// revisions are supplied by the caller (see [`Document::update_rev`]) and
/// conflict checking is opt-in via [`LocalDatabase::write_checked`].
pub struct LocalDatabase<B: Backend> {
    backend: Arc<B>,
    update_tx: Arc<watch::Sender<u64>>,
}

impl<B: Backend> Clone for LocalDatabase<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            update_tx: self.update_tx.clone(),
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    /// An in-memory database with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::with_backend(MemoryBackend::with_id(id))
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDatabase {
    /// Opens the SQLite-backed database at `path`. Call
    /// [`Database::create`] before first use of a fresh file.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::with_backend(SqliteBackend::open(path).await?))
    }
}

impl<B: Backend> LocalDatabase<B> {
    pub fn with_backend(backend: B) -> Self {
        let (update_tx, _) = watch::channel(0);

        Self {
            backend: Arc::new(backend),
            update_tx: Arc::new(update_tx),
        }
    }

    /// Stores a document revision without conflict checking (replication
    /// semantics).
    pub async fn write(&self, doc: Document) -> Result<()> {
        self.write_with(doc, false).await
    }

    /// Stores a new edit; fails with [`Error::Conflict`] when it would fork
    /// the revision tree. Replaying an already-present revision is never a
    /// conflict.
    pub async fn write_checked(&self, doc: Document) -> Result<()> {
        self.write_with(doc, true).await
    }

    async fn write_with(&self, mut doc: Document, check_conflict: bool) -> Result<()> {
        if doc.rev_num == 0 || doc.path.is_empty() || doc.path.len() as u64 > doc.rev_num {
            return Err(Error::MalformedData);
        }

        // Stream attachment chunks into the backend first, one write
        // transaction per chunk, so the write lock is never held while a
        // (possibly slow) attachment producer runs. If the document write
        // below bails out, these chunks become unreferenced garbage.
        let mut stubs = BTreeMap::new();
        let mut written = BTreeMap::new();

        for (name, attachment) in doc.attachments.take().unwrap_or_default() {
            match attachment {
                Attachment::Stub(meta) => {
                    stubs.insert(name, meta);
                }
                Attachment::New(new) => {
                    let (meta, ptr) = self
                        .store_attachment(new.rev_pos, new.content_type, new.data)
                        .await?;
                    written.insert(name, (meta, ptr));
                }
                Attachment::Stored(stored) => {
                    let (meta, ptr) = self
                        .store_attachment(
                            stored.meta.rev_pos,
                            stored.meta.content_type.clone(),
                            stored.data,
                        )
                        .await?;
                    written.insert(name, (meta, ptr));
                }
            }
        }

        let mut tx = self.backend.begin_write().await?;
        let mut tree = tx.read(&doc.id).await?.unwrap_or_default();
        let outcome = tree.merge(doc.rev_num, &doc.path);

        let conflict = check_conflict && matches!(outcome, MergeOutcome::Fork { .. });
        if conflict || matches!(outcome, MergeOutcome::AlreadyPresent) {
            // the just-written chunks are redundant either way
            release_chunks(&mut tx, written.values().map(|(_, ptr)| ptr));
            tx.commit().await?;
            return if conflict { Err(Error::Conflict) } else { Ok(()) };
        }

        let (full_path, replaced_index) = outcome
            .into_insert()
            .expect("merge outcome handled above");

        // free the replaced leaf's body and attachment store; its chunks
        // are retained and may be re-referenced through stubs below
        let mut att_store = AttachmentStore::default();
        if let Some(index) = replaced_index {
            if let Some(old_ptr) = tree.branch(index).leaf_doc_ptr.clone() {
                tx.write_local(body_key(&old_ptr), None);
                let key = att_store_key(&old_ptr);
                if let Some(LocalValue::Json(value)) = tx.read_local(&key).await? {
                    att_store = serde_json::from_value(value)?;
                }
                tx.write_local(key, None);
            }
        }

        let doc_ptr = if doc.deleted {
            None
        } else {
            let body = doc.body.take().ok_or(Error::MalformedData)?;
            let mut entries: BTreeMap<String, MergeEntry> = BTreeMap::new();
            for (name, meta) in stubs {
                entries.insert(name, MergeEntry::Stub(meta));
            }
            for (name, (meta, ptr)) in written {
                entries.insert(name, MergeEntry::Written(meta, ptr));
            }
            let freed = att_store.merge(entries)?;
            release_chunks(&mut tx, freed.iter());

            let ptr = ids::random();
            tx.write_local(
                body_key(&ptr),
                Some(LocalValue::Json(Value::Object(body))),
            );
            tx.write_local(
                att_store_key(&ptr),
                Some(LocalValue::Json(serde_json::to_value(&att_store)?)),
            );
            Some(ptr)
        };

        let revs_limit = read_revs_limit(&mut tx).await?;
        tree.update(doc.rev_num, full_path, doc_ptr, replaced_index, revs_limit);
        tx.write(doc.id.clone(), tree);
        tx.commit().await?;

        tracing::debug!(id = %doc.id, rev = %doc.rev(), "document written");
        self.update_tx.send_modify(|version| *version += 1);

        Ok(())
    }

    async fn store_attachment(
        &self,
        rev_pos: u64,
        content_type: String,
        mut data: ByteStream,
    ) -> Result<(AttachmentMetadata, DataPtr)> {
        let att_id = ids::random();
        let mut digester = Digester::new();
        let mut chunk_ends = Vec::new();
        let mut index = 0;

        while let Some(chunk) = data.try_next().await? {
            let mut tx = self.backend.begin_write().await?;
            tx.write_local(chunk_key(&att_id, index), Some(LocalValue::Blob(chunk.clone())));
            tx.commit().await?;

            digester.update(&chunk);
            chunk_ends.push(chunk_ends.last().copied().unwrap_or(0) + chunk.len() as u64);
            index += 1;
        }

        let (length, digest) = digester.finish();
        let meta = AttachmentMetadata {
            rev_pos,
            content_type,
            length,
            digest,
        };

        Ok((meta, DataPtr { att_id, chunk_ends }))
    }

    /// Writes or deletes a local document, unconditionally.
    pub async fn write_local(&self, id: &str, value: Option<Value>) -> Result<()> {
        let mut tx = self.backend.begin_write().await?;
        tx.write_local(id.to_owned(), value.map(LocalValue::Json));
        tx.commit().await
    }

    pub async fn read_local(&self, id: &str) -> Result<Option<Value>> {
        let mut tx = self.backend.begin_read().await?;
        match tx.read_local(id).await? {
            None => Ok(None),
            Some(LocalValue::Json(value)) => Ok(Some(value)),
            Some(LocalValue::Blob(_)) => Err(Error::MalformedData),
        }
    }

    /// Applies several document and local-document writes in one backend
    /// transaction. The document ids should be distinct.
    pub async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut tx = self.backend.begin_write().await?;
        let mut wrote_docs = false;

        for op in ops {
            match op {
                BatchOp::WriteLocal(id, value) => {
                    tx.write_local(id, value.map(LocalValue::Json));
                }
                BatchOp::Write(mut doc) => {
                    if doc.rev_num == 0 || doc.path.is_empty() || doc.path.len() as u64 > doc.rev_num
                    {
                        return Err(Error::MalformedData);
                    }
                    wrote_docs = true;
                    let mut tree = tx.read(&doc.id).await?.unwrap_or_default();
                    let Some((full_path, replaced_index)) =
                        tree.merge(doc.rev_num, &doc.path).into_insert()
                    else {
                        continue;
                    };

                    if let Some(index) = replaced_index {
                        if let Some(old_ptr) = tree.branch(index).leaf_doc_ptr.clone() {
                            tx.write_local(body_key(&old_ptr), None);
                            tx.write_local(att_store_key(&old_ptr), None);
                        }
                    }

                    let doc_ptr = if doc.deleted {
                        None
                    } else {
                        let body = doc.body.take().ok_or(Error::MalformedData)?;
                        let ptr = ids::random();
                        tx.write_local(
                            body_key(&ptr),
                            Some(LocalValue::Json(Value::Object(body))),
                        );
                        tx.write_local(
                            att_store_key(&ptr),
                            Some(LocalValue::Json(serde_json::to_value(
                                AttachmentStore::default(),
                            )?)),
                        );
                        Some(ptr)
                    };

                    let revs_limit = read_revs_limit(&mut tx).await?;
                    tree.update(doc.rev_num, full_path, doc_ptr, replaced_index, revs_limit);
                    tx.write(doc.id.clone(), tree);
                }
            }
        }

        tx.commit().await?;
        if wrote_docs {
            self.update_tx.send_modify(|version| *version += 1);
        }
        Ok(())
    }

    /// Reads the selected revisions of `id`. `body: false` skips loading
    /// bodies; `atts: None` skips attachment metadata entirely.
    pub fn read_with(
        &self,
        id: String,
        revs: Revs,
        body: bool,
        atts: Option<AttachmentSelector>,
    ) -> BoxStream<'static, Result<DocResult>> {
        let backend = self.backend.clone();

        Box::pin(try_stream! {
            let mut tx = backend.begin_read().await?;

            let Some(tree) = tx.read(&id).await? else {
                yield DocResult::NotFound(id);
                return;
            };

            let branches: Vec<Branch> = match &revs {
                Revs::Winner => tree.winner().cloned().into_iter().collect(),
                Revs::All => tree.branches().cloned().collect(),
                Revs::These(revs) => revs
                    .iter()
                    .flat_map(|rev| tree.find(rev).cloned().collect::<Vec<_>>())
                    .collect(),
            };

            for branch in branches {
                let doc =
                    read_branch_doc(&backend, &mut tx, &id, &branch, body, atts.as_ref()).await?;
                yield DocResult::Found(doc);
            }
        })
    }

    /// The winning revision of `id`, body and attachment stubs included.
    pub async fn read_winner(&self, id: &str) -> Result<Document> {
        let result = self
            .read_with(
                id.to_owned(),
                Revs::Winner,
                true,
                Some(AttachmentSelector::default()),
            )
            .next()
            .await
            .ok_or_else(|| Error::NotFound(id.to_owned()))??;

        match result {
            DocResult::Found(doc) => Ok(doc),
            DocResult::NotFound(id) => Err(Error::NotFound(id)),
        }
    }

    /// A byte range of the winner's attachment `name`; `None` bounds extend
    /// to the respective edge.
    pub async fn read_attachment(
        &self,
        id: &str,
        name: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<(AttachmentMetadata, ByteStream)> {
        let mut tx = self.backend.begin_read().await?;

        let tree = tx
            .read(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        let branch = tree.winner().ok_or_else(|| Error::NotFound(id.to_owned()))?;
        let doc_ptr = branch
            .leaf_doc_ptr
            .clone()
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;

        let store: AttachmentStore = match tx.read_local(&att_store_key(&doc_ptr)).await? {
            Some(LocalValue::Json(value)) => serde_json::from_value(value)?,
            _ => AttachmentStore::default(),
        };
        let record = store
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;

        let total = record.data_ptr.total_length();
        if start.unwrap_or(0) >= total.max(1) || end.is_some_and(|end| end > total) {
            return Err(Error::PreconditionFailed("unsatisfiable byte range"));
        }

        Ok((
            record.meta.clone(),
            chunk_stream(self.backend.clone(), record.data_ptr.clone(), start, end),
        ))
    }

    /// Ordered iteration over non-deleted winners. Bounds are inclusive.
    pub fn all_docs(
        &self,
        start_key: Option<String>,
        end_key: Option<String>,
        descending: bool,
        with_body: bool,
    ) -> BoxStream<'static, Result<Document>> {
        let backend = self.backend.clone();

        Box::pin(try_stream! {
            let mut tx = backend.begin_read().await?;

            let mut winners = Vec::new();
            {
                let mut rows =
                    tx.all_docs(start_key.as_deref(), end_key.as_deref(), descending);
                while let Some((id, tree)) = rows.try_next().await? {
                    if let Some(winner) = tree.winner() {
                        if !winner.is_deleted() {
                            winners.push((id, winner.clone()));
                        }
                    }
                }
            }

            for (id, branch) in winners {
                let doc =
                    read_branch_doc(&backend, &mut tx, &id, &branch, with_body, None).await?;
                yield doc;
            }
        })
    }

    /// Ordered iteration over the raw local keyspace. Bounds are inclusive.
    pub fn all_local_docs(
        &self,
        start_key: Option<String>,
        end_key: Option<String>,
        descending: bool,
    ) -> BoxStream<'static, Result<(String, LocalValue)>> {
        let backend = self.backend.clone();

        Box::pin(try_stream! {
            let mut tx = backend.begin_read().await?;
            let mut rows =
                tx.all_local_docs(start_key.as_deref(), end_key.as_deref(), descending);
            while let Some(row) = rows.try_next().await? {
                yield row;
            }
        })
    }

    /// Which of `revs` this database is missing for `id`, plus candidate
    /// ancestors it could extend.
    pub async fn revs_diff_single(&self, id: &str, revs: &[Rev]) -> Result<Missing> {
        let mut tx = self.backend.begin_read().await?;
        let tree = tx.read(id).await?.unwrap_or_default();

        let mut missing_revs = std::collections::BTreeSet::new();
        let mut possible_ancestors = std::collections::BTreeSet::new();
        for rev in revs {
            let (is_missing, ancestors) = tree.diff(rev);
            if is_missing {
                missing_revs.insert(rev.clone());
                possible_ancestors.extend(ancestors);
            }
        }

        Ok(Missing {
            id: id.to_owned(),
            missing_revs,
            possible_ancestors,
        })
    }

    pub async fn revs_limit(&self) -> Result<usize> {
        let mut tx = self.backend.begin_read().await?;
        read_revs_limit(&mut tx).await
    }

    pub async fn set_revs_limit(&self, limit: usize) -> Result<()> {
        let mut tx = self.backend.begin_write().await?;
        tx.write_local(
            REVS_LIMIT_KEY.to_owned(),
            Some(LocalValue::Json(Value::from(limit as u64))),
        );
        tx.commit().await
    }
}

/// One operation of a [`LocalDatabase::write_batch`].
pub enum BatchOp {
    Write(Document),
    WriteLocal(String, Option<Value>),
}

fn release_chunks<'a, W: WriteTransaction>(
    tx: &mut W,
    ptrs: impl Iterator<Item = &'a DataPtr>,
) {
    for ptr in ptrs {
        for index in 0..ptr.chunk_ends.len() {
            tx.write_local(chunk_key(&ptr.att_id, index), None);
        }
    }
}

async fn read_branch_doc<B: Backend>(
    backend: &Arc<B>,
    tx: &mut B::Read,
    id: &str,
    branch: &Branch,
    body: bool,
    atts: Option<&AttachmentSelector>,
) -> Result<Document> {
    let Some(doc_ptr) = &branch.leaf_doc_ptr else {
        return Ok(Document::tombstone(
            id,
            branch.leaf_rev_num,
            branch.path.clone(),
        ));
    };

    let doc_body = if body {
        match tx.read_local(&body_key(doc_ptr)).await? {
            Some(LocalValue::Json(Value::Object(map))) => Some(map),
            _ => return Err(Error::MalformedData),
        }
    } else {
        None
    };

    let attachments = match atts {
        None => None,
        Some(selector) => {
            let store: AttachmentStore = match tx.read_local(&att_store_key(doc_ptr)).await? {
                Some(LocalValue::Json(value)) => serde_json::from_value(value)?,
                _ => AttachmentStore::default(),
            };

            let (stubs, todo) = store.read(branch, selector);
            let mut attachments = BTreeMap::new();
            for (name, meta) in stubs {
                attachments.insert(name, Attachment::Stub(meta));
            }
            for (name, record) in todo {
                attachments.insert(
                    name,
                    Attachment::Stored(StoredAttachment {
                        data: chunk_stream(
                            backend.clone(),
                            record.data_ptr.clone(),
                            None,
                            None,
                        ),
                        meta: record.meta,
                    }),
                );
            }
            Some(attachments)
        }
    };

    Ok(Document {
        id: id.to_owned(),
        rev_num: branch.leaf_rev_num,
        path: branch.path.clone(),
        body: doc_body,
        attachments,
        deleted: false,
    })
}

/// Lazily reads an attachment's chunks from their own backend snapshot,
/// slicing the edge chunks when a byte range was requested.
fn chunk_stream<B: Backend>(
    backend: Arc<B>,
    ptr: DataPtr,
    start: Option<u64>,
    end: Option<u64>,
) -> ByteStream {
    Box::pin(try_stream! {
        let Some(slice) = ptr.slice(start, end) else {
            return;
        };

        let mut tx = backend.begin_read().await?;
        let mut rows =
            tx.all_local_docs(Some(slice.start_key.as_str()), Some(slice.end_key.as_str()), false);
        let mut index = 0usize;

        while let Some((_, value)) = rows.try_next().await? {
            let chunk = value.into_blob().ok_or(Error::MalformedData)?;

            let from = if index == 0 {
                slice.start_offset.unwrap_or(0) as usize
            } else {
                0
            };
            let to = if index == slice.last_index {
                slice.end_offset.map(|end| end as usize).unwrap_or(chunk.len())
            } else {
                chunk.len()
            };

            yield chunk.slice(from..to);
            index += 1;
        }
    })
}

fn build_change(seq: u64, id: String, tree: &RevTree) -> Change {
    Change {
        id,
        seq,
        deleted: tree.winner().map(Branch::is_deleted).unwrap_or(true),
        leaf_revs: tree.branches().map(Branch::leaf_rev).collect(),
    }
}

#[async_trait]
impl<B: Backend> Database for LocalDatabase<B> {
    async fn id(&self) -> Result<String> {
        Ok(self.backend.id().to_owned())
    }

    async fn create(&self) -> Result<bool> {
        self.backend.create().await
    }

    async fn update_seq(&self) -> Result<u64> {
        let mut tx = self.backend.begin_read().await?;
        tx.update_seq().await
    }

    fn changes(&self, since: Option<u64>, continuous: bool) -> BoxStream<'static, Result<Change>> {
        let backend = self.backend.clone();
        let mut update_rx = self.update_tx.subscribe();

        Box::pin(try_stream! {
            let mut since = since.unwrap_or(0);

            loop {
                // mark the notification state before draining so a commit
                // that lands mid-drain re-runs the loop instead of being
                // missed
                let _ = update_rx.borrow_and_update();

                {
                    let mut tx = backend.begin_read().await?;
                    let mut rows = tx.changes(since);
                    while let Some((seq, id, tree)) = rows.try_next().await? {
                        since = seq;
                        yield build_change(seq, id, &tree);
                    }
                }

                if !continuous {
                    break;
                }
                if update_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn revs_diff(
        &self,
        mut input: BoxStream<'static, (String, Vec<Rev>)>,
    ) -> BoxStream<'static, Result<Missing>> {
        let this = self.clone();

        Box::pin(try_stream! {
            while let Some((id, revs)) = input.next().await {
                yield this.revs_diff_single(&id, &revs).await?;
            }
        })
    }

    fn read(&self, request: ReadRequest) -> BoxStream<'static, Result<DocResult>> {
        let selector = AttachmentSelector {
            names: Vec::new(),
            since_revs: request.atts_since,
        };
        self.read_with(request.id, request.revs, true, Some(selector))
    }

    async fn write(&self, doc: Document) -> Result<()> {
        self.write_with(doc, false).await
    }

    async fn read_local(&self, id: &str) -> Result<Option<Value>> {
        LocalDatabase::read_local(self, id).await
    }

    async fn write_local(&self, id: &str, value: Option<Value>) -> Result<()> {
        LocalDatabase::write_local(self, id, value).await
    }

    async fn ensure_full_commit(&self) -> Result<()> {
        // every committed write transaction is already durable
        Ok(())
    }
}
