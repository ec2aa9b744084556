//! On-disk backend: two SQLite tables behind a WAL-journaled sqlx pool.
//!
//! `revision_trees` holds `id -> (rev_tree JSON, seq)`; the update seq is
//! derived as `MAX(seq)`. `local_documents` holds the local keyspace. Write
//! transactions buffer their changes and apply them as batched statements at
//! commit; read transactions ride on a WAL snapshot.

use super::{Backend, LocalValue, ReadTransaction, WriteTransaction};
use crate::{
    error::{Error, Result},
    protocol::RevTree,
};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, TryStreamExt};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqliteConnection, SqlitePool,
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA: &[&str] = &[
    "CREATE TABLE revision_trees (
         id TEXT PRIMARY KEY,
         rev_tree TEXT NOT NULL,
         seq INTEGER NOT NULL
     ) WITHOUT ROWID",
    "CREATE UNIQUE INDEX revision_trees_seq ON revision_trees (seq)",
    "CREATE TABLE local_documents (
         id TEXT PRIMARY KEY,
         is_json INTEGER NOT NULL,
         data BLOB
     ) WITHOUT ROWID",
];

const UPDATE_SEQ: &str = "SELECT COALESCE(MAX(seq), 0) FROM revision_trees";

pub struct SqliteBackend {
    pool: SqlitePool,
    id: String,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteBackend {
    /// Opens (creating the file if needed) the database at `path`. The
    /// schema is not set up until [`Backend::create`] is called.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(Error::ConnectToDb)?;

        Ok(Self {
            id: format!("{}sql", path.display()),
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    type Read = SqliteReadTransaction;
    type Write = SqliteWriteTransaction;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        for statement in SCHEMA {
            match sqlx::query(statement).execute(&mut *tx).await {
                Ok(_) => (),
                Err(error) if is_already_exists(&error) => return Ok(false),
                Err(error) => return Err(Error::CreateDbSchema(error)),
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn begin_read(&self) -> Result<Self::Read> {
        let mut tx = self.pool.begin().await?;
        // touching the table pins the WAL snapshot to this point and detects
        // a database whose schema was never created
        let update_seq = fetch_update_seq(&mut tx, &self.id).await?;

        Ok(SqliteReadTransaction { tx, update_seq })
    }

    async fn begin_write(&self) -> Result<Self::Write> {
        let guard = self.write_lock.clone().lock_owned().await;
        let mut tx = self.pool.begin().await?;
        let update_seq = fetch_update_seq(&mut tx, &self.id).await?;

        Ok(SqliteWriteTransaction {
            tx,
            update_seq,
            docs: Vec::new(),
            local_writes: Vec::new(),
            local_deletes: Vec::new(),
            _guard: guard,
        })
    }
}

pub struct SqliteReadTransaction {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    update_seq: u64,
}

pub struct SqliteWriteTransaction {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    update_seq: u64,
    docs: Vec<(String, RevTree)>,
    local_writes: Vec<(String, LocalValue)>,
    local_deletes: Vec<String>,
    _guard: OwnedMutexGuard<()>,
}

fn is_already_exists(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|e| e.message().contains("already exists"))
}

fn is_no_such_table(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|e| e.message().contains("no such table"))
}

async fn fetch_update_seq(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    match sqlx::query(UPDATE_SEQ).fetch_one(conn).await {
        Ok(row) => Ok(row.get::<i64, _>(0) as u64),
        Err(error) if is_no_such_table(&error) => Err(Error::NotFound(id.to_owned())),
        Err(error) => Err(error.into()),
    }
}

async fn read_tree(conn: &mut SqliteConnection, id: &str) -> Result<Option<RevTree>> {
    let row = sqlx::query("SELECT rev_tree FROM revision_trees WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.get(0);
            Ok(Some(serde_json::from_str(&raw)?))
        }
        None => Ok(None),
    }
}

async fn read_local_value(conn: &mut SqliteConnection, id: &str) -> Result<Option<LocalValue>> {
    let row = sqlx::query("SELECT is_json, data FROM local_documents WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;

    row.map(|row| decode_local(&row)).transpose()
}

fn decode_local(row: &sqlx::sqlite::SqliteRow) -> Result<LocalValue> {
    let is_json: bool = row.get(0);
    let data: Vec<u8> = row.get(1);

    if is_json {
        Ok(LocalValue::Json(serde_json::from_slice(&data)?))
    } else {
        Ok(LocalValue::Blob(Bytes::from(data)))
    }
}

/// `base [WHERE id >= ? [AND]] [id <= ?] ORDER BY id [DESC]`
fn range_query(base: &str, start_key: bool, end_key: bool, descending: bool) -> String {
    let mut parts = vec![base];
    if start_key || end_key {
        parts.push("WHERE");
    }
    if start_key {
        parts.push("id >= ?");
        if end_key {
            parts.push("AND");
        }
    }
    if end_key {
        parts.push("id <= ?");
    }
    parts.push(if descending {
        "ORDER BY id DESC"
    } else {
        "ORDER BY id ASC"
    });
    parts.join(" ")
}

fn stream_docs<'a>(
    conn: &'a mut SqliteConnection,
    start_key: Option<&str>,
    end_key: Option<&str>,
    descending: bool,
) -> BoxStream<'a, Result<(String, RevTree)>> {
    let sql = range_query(
        "SELECT id, rev_tree FROM revision_trees",
        start_key.is_some(),
        end_key.is_some(),
        descending,
    );
    let binds: Vec<String> = [start_key, end_key]
        .into_iter()
        .flatten()
        .map(str::to_owned)
        .collect();

    Box::pin(try_stream! {
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let mut rows = query.fetch(conn);
        while let Some(row) = rows.try_next().await? {
            let id: String = row.get(0);
            let raw: String = row.get(1);
            yield (id, serde_json::from_str(&raw)?);
        }
    })
}

fn stream_local_docs<'a>(
    conn: &'a mut SqliteConnection,
    start_key: Option<&str>,
    end_key: Option<&str>,
    descending: bool,
) -> BoxStream<'a, Result<(String, LocalValue)>> {
    let sql = range_query(
        "SELECT id, is_json, data FROM local_documents",
        start_key.is_some(),
        end_key.is_some(),
        descending,
    );
    let binds: Vec<String> = [start_key, end_key]
        .into_iter()
        .flatten()
        .map(str::to_owned)
        .collect();

    Box::pin(try_stream! {
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let mut rows = query.fetch(conn);
        while let Some(row) = rows.try_next().await? {
            let id: String = row.get(0);
            let value = decode_local(&row)?;
            yield (id, value);
        }
    })
}

fn stream_changes(
    conn: &mut SqliteConnection,
    since: u64,
) -> BoxStream<'_, Result<(u64, String, RevTree)>> {
    Box::pin(try_stream! {
        let mut rows = sqlx::query(
            "SELECT seq, id, rev_tree FROM revision_trees WHERE seq > ? ORDER BY seq",
        )
        .bind(since as i64)
        .fetch(conn);

        while let Some(row) = rows.try_next().await? {
            let seq: i64 = row.get(0);
            let id: String = row.get(1);
            let raw: String = row.get(2);
            yield (seq as u64, id, serde_json::from_str(&raw)?);
        }
    })
}

#[async_trait]
impl ReadTransaction for SqliteReadTransaction {
    async fn update_seq(&mut self) -> Result<u64> {
        Ok(self.update_seq)
    }

    async fn read(&mut self, id: &str) -> Result<Option<RevTree>> {
        read_tree(&mut self.tx, id).await
    }

    async fn read_local(&mut self, id: &str) -> Result<Option<LocalValue>> {
        read_local_value(&mut self.tx, id).await
    }

    fn all_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, RevTree)>> {
        stream_docs(&mut self.tx, start_key, end_key, descending)
    }

    fn all_local_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, LocalValue)>> {
        stream_local_docs(&mut self.tx, start_key, end_key, descending)
    }

    fn changes<'a>(&'a mut self, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>> {
        stream_changes(&mut self.tx, since)
    }
}

#[async_trait]
impl ReadTransaction for SqliteWriteTransaction {
    async fn update_seq(&mut self) -> Result<u64> {
        Ok(self.update_seq)
    }

    async fn read(&mut self, id: &str) -> Result<Option<RevTree>> {
        read_tree(&mut self.tx, id).await
    }

    async fn read_local(&mut self, id: &str) -> Result<Option<LocalValue>> {
        read_local_value(&mut self.tx, id).await
    }

    fn all_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, RevTree)>> {
        stream_docs(&mut self.tx, start_key, end_key, descending)
    }

    fn all_local_docs<'a>(
        &'a mut self,
        start_key: Option<&'a str>,
        end_key: Option<&'a str>,
        descending: bool,
    ) -> BoxStream<'a, Result<(String, LocalValue)>> {
        stream_local_docs(&mut self.tx, start_key, end_key, descending)
    }

    fn changes<'a>(&'a mut self, since: u64) -> BoxStream<'a, Result<(u64, String, RevTree)>> {
        stream_changes(&mut self.tx, since)
    }
}

#[async_trait]
impl WriteTransaction for SqliteWriteTransaction {
    fn write(&mut self, id: String, tree: RevTree) {
        self.docs.push((id, tree));
    }

    fn write_local(&mut self, id: String, value: Option<LocalValue>) {
        match value {
            Some(value) => self.local_writes.push((id, value)),
            None => self.local_deletes.push(id),
        }
    }

    async fn commit(mut self) -> Result<()> {
        for (id, value) in &self.local_writes {
            let (is_json, data) = match value {
                LocalValue::Json(value) => (true, serde_json::to_vec(value)?),
                LocalValue::Blob(bytes) => (false, bytes.to_vec()),
            };
            sqlx::query("INSERT OR REPLACE INTO local_documents VALUES (?, ?, ?)")
                .bind(id)
                .bind(is_json)
                .bind(data)
                .execute(&mut *self.tx)
                .await?;
        }

        for id in &self.local_deletes {
            sqlx::query("DELETE FROM local_documents WHERE id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
        }

        for (id, tree) in &self.docs {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO revision_trees VALUES (?, ?, ({UPDATE_SEQ}) + 1)"
            ))
            .bind(id)
            .bind(serde_json::to_string(tree)?)
            .execute(&mut *self.tx)
            .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Branch;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path().join("db.sqlite"))
            .await
            .unwrap();
        assert!(backend.create().await.unwrap());
        (dir, backend)
    }

    fn tree(leaf_rev_num: u64, hash: &str) -> RevTree {
        RevTree::new(vec![Branch::new(
            leaf_rev_num,
            vec![hash.to_owned()],
            Some("ptr".to_owned()),
        )])
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (_dir, backend) = setup().await;
        assert!(!backend.create().await.unwrap());
    }

    #[tokio::test]
    async fn uncreated_database_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path().join("db.sqlite"))
            .await
            .unwrap();

        assert!(matches!(backend.begin_read().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn write_then_read() {
        let (_dir, backend) = setup().await;

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        tx.write_local(
            "check".into(),
            Some(LocalValue::Json(serde_json::json!({"n": 1}))),
        );
        tx.write_local("chunk".into(), Some(LocalValue::Blob(Bytes::from_static(b"xyz"))));
        tx.commit().await.unwrap();

        let mut tx = backend.begin_read().await.unwrap();
        assert_eq!(tx.update_seq().await.unwrap(), 1);
        assert_eq!(tx.read("doc").await.unwrap(), Some(tree(1, "a")));
        assert_eq!(tx.read("missing").await.unwrap(), None);
        assert_eq!(
            tx.read_local("check").await.unwrap(),
            Some(LocalValue::Json(serde_json::json!({"n": 1})))
        );
        assert_eq!(
            tx.read_local("chunk").await.unwrap(),
            Some(LocalValue::Blob(Bytes::from_static(b"xyz")))
        );
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let (_dir, backend) = setup().await;

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        drop(tx);

        let mut tx = backend.begin_read().await.unwrap();
        assert_eq!(tx.read("doc").await.unwrap(), None);
        assert_eq!(tx.update_seq().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rewrite_reassigns_the_seq() {
        let (_dir, backend) = setup().await;

        for hash in ["a", "b"] {
            let mut tx = backend.begin_write().await.unwrap();
            tx.write("doc".into(), tree(1, hash));
            tx.commit().await.unwrap();
        }

        let mut tx = backend.begin_read().await.unwrap();
        let rows: Vec<_> = tx.changes(0).try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 2);
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_commits() {
        let (_dir, backend) = setup().await;

        let mut tx = backend.begin_write().await.unwrap();
        tx.write("doc".into(), tree(1, "a"));
        tx.commit().await.unwrap();

        let mut reader = backend.begin_read().await.unwrap();
        assert_eq!(reader.update_seq().await.unwrap(), 1);

        let mut writer = backend.begin_write().await.unwrap();
        writer.write("doc".into(), tree(2, "b"));
        writer.commit().await.unwrap();

        assert_eq!(reader.read("doc").await.unwrap(), Some(tree(1, "a")));

        drop(reader);
        let mut fresh = backend.begin_read().await.unwrap();
        assert_eq!(fresh.read("doc").await.unwrap(), Some(tree(2, "b")));
    }

    #[tokio::test]
    async fn local_deletes_apply_at_commit() {
        let (_dir, backend) = setup().await;

        let mut tx = backend.begin_write().await.unwrap();
        tx.write_local("gone".into(), Some(LocalValue::Json(serde_json::json!(true))));
        tx.commit().await.unwrap();

        let mut tx = backend.begin_write().await.unwrap();
        tx.write_local("gone".into(), None);
        tx.commit().await.unwrap();

        let mut tx = backend.begin_read().await.unwrap();
        assert_eq!(tx.read_local("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn all_local_docs_ranges_over_chunk_keys() {
        let (_dir, backend) = setup().await;

        let mut tx = backend.begin_write().await.unwrap();
        for (i, data) in [b"one" as &[u8], b"two", b"three"].iter().enumerate() {
            tx.write_local(
                crate::protocol::chunk_key("att", i),
                Some(LocalValue::Blob(Bytes::copy_from_slice(data))),
            );
        }
        tx.commit().await.unwrap();

        let mut tx = backend.begin_read().await.unwrap();
        let start = crate::protocol::chunk_key("att", 0);
        let end = crate::protocol::chunk_key("att", 2);
        let rows: Vec<_> = tx
            .all_local_docs(Some(&start), Some(&end), false)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].1, LocalValue::Blob(Bytes::from_static(b"one")));
        assert_eq!(rows[2].1, LocalValue::Blob(Bytes::from_static(b"three")));
    }
}
