//! Secondary indices: a map function applied incrementally over a source
//! database, materialized into an in-memory index database keyed by
//! collation-ordered complex keys.
//!
//! The view is a plain consumer of the database's public surface: it follows
//! the changes feed, reads winners, and applies its index updates through
//! write batches.

use crate::{
    db::{BatchOp, Database, LocalDatabase, MemoryDatabase},
    error::Result,
    protocol::{collation, Change, DocResult, Document, Revs},
    store::Backend,
};
use futures_util::TryStreamExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Emits zero or more `(key, value)` rows for one document.
pub type MapFn = Box<dyn Fn(&Document) -> Vec<(Value, Value)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    pub key: Value,
    pub value: Value,
    pub id: String,
}

pub struct View<B: Backend> {
    db: LocalDatabase<B>,
    index: MemoryDatabase,
    map: MapFn,
}

impl<B: Backend> View<B> {
    pub fn new(
        db: LocalDatabase<B>,
        map: impl Fn(&Document) -> Vec<(Value, Value)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            db,
            index: MemoryDatabase::new(),
            map: Box::new(map),
        }
    }

    /// Catches the index up with the source's changes feed.
    pub async fn build(&self) -> Result<()> {
        let meta = self.index.read_local("_meta").await?;
        let last_seq = meta.and_then(|meta| meta["local_seq"].as_u64());

        let mut changes = Database::changes(&self.db, last_seq, false);
        while let Some(change) = changes.try_next().await? {
            self.apply_change(change).await?;
        }
        Ok(())
    }

    /// The rows whose keys fall in the inclusive `[start_key, end_key]`
    /// range, in collation order.
    pub async fn query(
        &self,
        start_key: Option<Value>,
        end_key: Option<Value>,
        descending: bool,
    ) -> Result<Vec<ViewRow>> {
        self.build().await?;

        let start = start_key.map(|key| encode_key(&json!([key])));
        // an empty object sorts after every document id
        let end = end_key.map(|key| encode_key(&json!([key, {}])));

        let mut rows = Vec::new();
        let mut docs = self.index.all_docs(start, end, descending, true);
        while let Some(doc) = docs.try_next().await? {
            let body = doc.body.unwrap_or_default();
            rows.push(ViewRow {
                key: body.get("key").cloned().unwrap_or(Value::Null),
                value: body.get("value").cloned().unwrap_or(Value::Null),
                id: body
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        Ok(rows)
    }

    async fn apply_change(&self, change: Change) -> Result<()> {
        // which keys did this document map to last time?
        let old_keys: Vec<Value> = self
            .index
            .read_local(&change.id)
            .await?
            .and_then(|info| info.get("old_keys").cloned())
            .and_then(|keys| serde_json::from_value(keys).ok())
            .unwrap_or_default();

        let mut old_docs = BTreeMap::new();
        for key in &old_keys {
            let view_id = view_doc_id(key, &change.id);
            if let Some(doc) = self.read_index_doc(&view_id).await? {
                old_docs.insert(view_id, doc);
            }
        }

        let source_doc = self.read_source_winner(&change.id).await?;
        let emitted = match &source_doc {
            Some(doc) if !doc.deleted => (self.map)(doc),
            _ => Vec::new(),
        };

        let mut ops = Vec::new();
        let mut new_keys = Vec::new();

        for (key, value) in emitted {
            let view_id = view_doc_id(&key, &change.id);
            new_keys.push(key.clone());

            // reuse the current doc for this key when there is one, so the
            // index entry's revision history stays linear
            let mut doc = match old_docs.remove(&view_id) {
                Some(doc) => doc,
                None => match self.read_index_doc(&view_id).await? {
                    Some(doc) => doc,
                    None => Document::new(view_id.clone(), 0, Vec::new(), Map::new()),
                },
            };

            let mut body = Map::new();
            body.insert("key".into(), key);
            body.insert("value".into(), value);
            body.insert("id".into(), Value::String(change.id.clone()));
            doc.body = Some(body);
            doc.attachments = Some(BTreeMap::new());
            doc.deleted = false;
            doc.update_rev();
            ops.push(BatchOp::Write(doc));
        }

        // whatever keys were not re-emitted disappear from the index
        for (_, mut doc) in old_docs {
            doc.deleted = true;
            doc.body = None;
            doc.attachments = None;
            doc.update_rev();
            ops.push(BatchOp::Write(doc));
        }

        ops.push(BatchOp::WriteLocal(
            change.id.clone(),
            Some(json!({ "old_keys": new_keys })),
        ));
        ops.push(BatchOp::WriteLocal(
            "_meta".into(),
            Some(json!({ "local_seq": change.seq })),
        ));

        self.index.write_batch(ops).await
    }

    async fn read_index_doc(&self, view_id: &str) -> Result<Option<Document>> {
        let mut stream = self
            .index
            .read_with(view_id.to_owned(), Revs::Winner, false, None);
        match stream.try_next().await? {
            Some(DocResult::Found(doc)) => Ok(Some(doc)),
            _ => Ok(None),
        }
    }

    async fn read_source_winner(&self, id: &str) -> Result<Option<Document>> {
        let mut stream = self.db.read_with(id.to_owned(), Revs::Winner, true, None);
        match stream.try_next().await? {
            Some(DocResult::Found(doc)) => Ok(Some(doc)),
            _ => Ok(None),
        }
    }
}

fn encode_key(key: &Value) -> String {
    // hex preserves the byte ordering of the collation encoding while
    // staying a valid document id
    hex::encode(collation::encode(key))
}

fn view_doc_id(key: &Value, doc_id: &str) -> String {
    encode_key(&json!([key, doc_id]))
}
