//! In-memory backend: three sorted maps, copied on write so that readers
//! keep their snapshot for as long as they hold it.

use super::{Backend, LocalValue, ReadTransaction, WriteTransaction};
use crate::{error::Result, ids, protocol::RevTree};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Indexes {
    /// id -> value
    local: BTreeMap<String, LocalValue>,
    /// id -> (tree, last update seq)
    by_id: BTreeMap<String, (RevTree, u64)>,
    /// seq -> id
    by_seq: BTreeMap<u64, String>,
    update_seq: u64,
}

pub struct MemoryBackend {
    id: String,
    indexes: Arc<RwLock<Arc<Indexes>>>,
    write_lock: Arc<Mutex<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_id(ids::random())
    }

    /// A backend with a caller-chosen identifier, e.g. to get a stable
    /// replication id across test runs.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: format!("{}memory", id.into()),
            indexes: Arc::new(RwLock::new(Arc::new(Indexes::default()))),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn snapshot(&self) -> Arc<Indexes> {
        self.indexes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Read = MemoryReadTransaction;
    type Write = MemoryWriteTransaction;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Result<bool> {
        // an in-memory database exists from the moment it is constructed
        Ok(false)
    }

    async fn begin_read(&self) -> Result<Self::Read> {
        Ok(MemoryReadTransaction {
            snapshot: self.snapshot(),
        })
    }

    async fn begin_write(&self) -> Result<Self::Write> {
        let guard = self.write_lock.clone().lock_owned().await;
        // work on a deep copy; outstanding readers keep the old maps
        let indexes = (*self.snapshot()).clone();

        Ok(MemoryWriteTransaction {
            indexes,
            shared: self.indexes.clone(),
            _guard: guard,
        })
    }
}

pub struct MemoryReadTransaction {
    snapshot: Arc<Indexes>,
}

pub struct MemoryWriteTransaction {
    indexes: Indexes,
    shared: Arc<RwLock<Arc<Indexes>>>,
    _guard: OwnedMutexGuard<()>,
}

fn read_tree(indexes: &Indexes, id: &str) -> Option<RevTree> {
    indexes.by_id.get(id).map(|(tree, _)| tree.clone())
}

fn range_bounds<'a>(
    start_key: Option<&'a str>,
    end_key: Option<&'a str>,
) -> (Bound<&'a str>, Bound<&'a str>) {
    (
        start_key.map_or(Bound::Unbounded, Bound::Included),
        end_key.map_or(Bound::Unbounded, Bound::Included),
    )
}

fn all_docs_stream<'a>(
    indexes: &'a Indexes,
    start_key: Option<&'a str>,
    end_key: Option<&'a str>,
    descending: bool,
) -> BoxStream<'a, Result<(String, RevTree)>> {
    let rows = indexes
        .by_id
        .range::<str, _>(range_bounds(start_key, end_key))
        .map(|(id, (tree, _))| Ok((id.clone(), tree.clone())));
    Box::pin(stream::iter(iter_maybe_rev(rows, descending)))
}

fn all_local_docs_stream<'a>(
    indexes: &'a Indexes,
    start_key: Option<&'a str>,
    end_key: Option<&'a str>,
    descending: bool,
) -> BoxStream<'a, Result<(String, LocalValue)>> {
    let rows = indexes
        .local
        .range::<str, _>(range_bounds(start_key, end_key))
        .map(|(id, value)| Ok((id.clone(), value.clone())));
    Box::pin(stream::iter(iter_maybe_rev(rows, descending)))
}

fn iter_maybe_rev<'a, I>(iter: I, descending: bool) -> Box<dyn Iterator<Item = I::Item> + Send + 'a>
where
    I: DoubleEndedIterator + Send + 'a,
{
    if descending {
        Box::new(iter.rev())
    } else {
        Box::new(iter)
    }
}

fn changes_stream<'a>(indexes: &'a Indexes, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>> {
    let rows = indexes
        .by_seq
        .range((Bound::Excluded(since), Bound::Unbounded))
        .map(|(seq, id)| {
            let (tree, _) = &indexes.by_id[id];
            Ok((*seq, id.clone(), tree.clone()))
        });
    Box::pin(stream::iter(rows))
}

#[async_trait]
impl ReadTransaction for MemoryReadTransaction {
    async fn update_seq(&mut self) -> Result<u64> {
        Ok(self.snapshot.update_seq)
    }

    async fn read(&mut self, id: &str) -> Result<Option<RevTree>> {
        Ok(read_tree(&self.snapshot, id))
    }

    async fn read_local(&mut self, id: &str) -> Result<Option<LocalValue>> {
        Ok(self.snapshot.local.get(id).cloned())
    }

    fn all_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, RevTree)>> {
        all_docs_stream(&self.snapshot, start_key, end_key, descending)
    }

    fn all_local_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, LocalValue)>> {
        all_local_docs_stream(&self.snapshot, start_key, end_key, descending)
    }

    fn changes<'a>(&'a mut self, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>> {
        changes_stream(&self.snapshot, since)
    }
}

#[async_trait]
impl ReadTransaction for MemoryWriteTransaction {
    async fn update_seq(&mut self) -> Result<u64> {
        Ok(self.indexes.update_seq)
    }

    async fn read(&mut self, id: &str) -> Result<Option<RevTree>> {
        Ok(read_tree(&self.indexes, id))
    }

    async fn read_local(&mut self, id: &str) -> Result<Option<LocalValue>> {
        Ok(self.indexes.local.get(id).cloned())
    }

    fn all_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, RevTree)>> {
        all_docs_stream(&self.indexes, start_key, end_key, descending)
    }

    fn all_local_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, LocalValue)>> {
        all_local_docs_stream(&self.indexes, start_key, end_key, descending)
    }

    fn changes<'a>(&'a mut self, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>> {
        changes_stream(&self.indexes, since)
    }
}

#[async_trait]
impl WriteTransaction for MemoryWriteTransaction {
    fn write(&mut self, id: String, tree: RevTree) {
        self.indexes.update_seq += 1;
        if let Some((_, last_update_seq)) = self.indexes.by_id.get(&id) {
            self.indexes.by_seq.remove(last_update_seq);
        }
        self.indexes.by_seq.insert(self.indexes.update_seq, id.clone());
        self.indexes.by_id.insert(id, (tree, self.indexes.update_seq));
    }

    fn write_local(&mut self, id: String, value: Option<LocalValue>) {
        match value {
            Some(value) => {
                self.indexes.local.insert(id, value);
            }
            None => {
                self.indexes.local.remove(&id);
            }
        }
    }

    async fn commit(self) -> Result<()> {
        *self
            .shared
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(self.indexes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Branch;
    use futures_util::TryStreamExt;

    fn tree(leaf_rev_num: u64, hash: &str) -> RevTree {
        RevTree::new(vec![Branch::new(
            leaf_rev_num,
            vec![hash.to_owned()],
            Some("ptr".to_owned()),
        )])
    }

    #[tokio::test]
    async fn write_then_read() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        tx.write_local("check".into(), Some(LocalValue::Json(serde_json::json!(1))));
        tx.commit().await.unwrap();

        let mut tx = backend.begin_read().await.unwrap();
        assert_eq!(tx.update_seq().await.unwrap(), 1);
        assert_eq!(tx.read("doc").await.unwrap(), Some(tree(1, "a")));
        assert_eq!(tx.read("missing").await.unwrap(), None);
        assert_eq!(
            tx.read_local("check").await.unwrap(),
            Some(LocalValue::Json(serde_json::json!(1)))
        );
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        drop(tx);

        let mut tx = backend.begin_read().await.unwrap();
        assert_eq!(tx.read("doc").await.unwrap(), None);
        assert_eq!(tx.update_seq().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rewrite_reassigns_the_seq() {
        let backend = MemoryBackend::new();

        for hash in ["a", "b"] {
            let mut tx = backend.begin_write().await.unwrap();
            tx.write("doc".into(), tree(1, hash));
            tx.commit().await.unwrap();
        }

        let mut tx = backend.begin_read().await.unwrap();
        let rows: Vec<_> = tx.changes(0).try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 2);
        assert_eq!(rows[0].1, "doc");
    }

    #[tokio::test]
    async fn changes_skips_up_to_since() {
        let backend = MemoryBackend::new();

        for (id, hash) in [("one", "a"), ("two", "b"), ("three", "c")] {
            let mut tx = backend.begin_write().await.unwrap();
            tx.write(id.into(), tree(1, hash));
            tx.commit().await.unwrap();
        }

        let mut tx = backend.begin_read().await.unwrap();
        let rows: Vec<_> = tx.changes(1).try_collect().await.unwrap();
        let seqs: Vec<_> = rows.iter().map(|(seq, ..)| *seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_commits() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        tx.commit().await.unwrap();

        let mut reader = backend.begin_read().await.unwrap();

        let mut writer = backend.begin_write().await.unwrap();
        writer.write("doc".into(), tree(2, "b"));
        writer.write("other".into(), tree(1, "x"));
        writer.commit().await.unwrap();

        // the reader still sees the state from before the second commit
        assert_eq!(reader.update_seq().await.unwrap(), 1);
        assert_eq!(reader.read("doc").await.unwrap(), Some(tree(1, "a")));
        assert_eq!(reader.read("other").await.unwrap(), None);

        let mut fresh = backend.begin_read().await.unwrap();
        assert_eq!(fresh.update_seq().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn all_docs_respects_range_and_direction() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin_write().await.unwrap();
        for id in ["a", "b", "c", "d"] {
            tx.write(id.into(), tree(1, id));
        }
        tx.commit().await.unwrap();

        let mut tx = backend.begin_read().await.unwrap();
        let rows: Vec<_> = tx
            .all_docs(Some("b"), Some("c"), false)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let rows: Vec<_> = tx.all_docs(None, None, true).try_collect().await.unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }
}
