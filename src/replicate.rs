//! Replication between two databases, local or remote, following CouchDB's
//! replication protocol: changes feed, revs diff, bulk read, write, and
//! checkpoint documents on both peers.
//!
//! <https://docs.couchdb.org/en/stable/replication/protocol.html>

use crate::{
    db::{Database, ReadRequest},
    error::{Error, Result},
    ids,
    protocol::{DocResult, Rev, Revs},
};
use futures_util::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub const REPLICATION_ID_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Create the target database if it does not exist yet.
    pub create_target: bool,
    /// Keep following the source's changes feed instead of stopping at the
    /// end; cancel by dropping the replication future.
    pub continuous: bool,
    /// How often a continuous replication records its progress in the
    /// checkpoint documents.
    pub checkpoint_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            create_target: false,
            continuous: false,
            checkpoint_interval: Duration::from_secs(30),
        }
    }
}

/// One session's worth of bookkeeping, kept in the checkpoint documents'
/// history and returned from [`replicate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    pub start_last_seq: u64,
    #[serde(default)]
    pub end_last_seq: u64,
    pub recorded_seq: u64,
    pub docs_read: u64,
    #[serde(default)]
    pub docs_written: u64,
    pub doc_write_failures: u64,
}

/// The `_local/<replication id>` checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointLog {
    replication_id_version: u64,
    session_id: String,
    source_last_seq: u64,
    history: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub struct ReplicationResult {
    pub ok: bool,
    pub session_id: String,
    pub source_last_seq: u64,
    pub history: Vec<HistoryEntry>,
}

/// Replicates `source` into `target` and checkpoints the progress on both
/// peers so future runs only transfer what is new.
pub async fn replicate(
    source: &dyn Database,
    target: &dyn Database,
    options: ReplicationOptions,
) -> Result<ReplicationResult> {
    let session_id = ids::random();
    let start_time = timestamp();

    // verify peers
    source.update_seq().await?;
    let start_last_seq = match target.update_seq().await {
        Ok(seq) => seq,
        Err(error) if error.is_not_found() && options.create_target => {
            target.create().await?;
            target.update_seq().await?
        }
        Err(error) => return Err(error),
    };

    // find common ancestry
    let replication_id = replication_id(source, target, &options).await?;
    let source_log = read_checkpoint(source, &replication_id).await?;
    let target_log = read_checkpoint(target, &replication_id).await?;
    let startup_checkpoint = compare_replication_logs(source_log.as_ref(), target_log.as_ref());
    tracing::debug!(
        replication_id,
        ?startup_checkpoint,
        "replication session starting"
    );

    // the four pipeline stages: changes -> revs_diff -> read -> write.
    // `recorded_seq` advances as changes enter the diff stage; since the
    // pipeline handles one change at a time, by then every earlier document
    // has been attempted at the target.
    let recorded_seq = Arc::new(AtomicU64::new(startup_checkpoint.unwrap_or(0)));
    let changes_failure = Arc::new(Mutex::new(None));

    let diff_input: BoxStream<'static, (String, Vec<Rev>)> = {
        let recorded_seq = recorded_seq.clone();
        let changes_failure = changes_failure.clone();
        Box::pin(
            source
                .changes(startup_checkpoint, options.continuous)
                .scan((), move |_, item| {
                    futures_util::future::ready(match item {
                        Ok(change) => {
                            recorded_seq.store(change.seq, Ordering::SeqCst);
                            Some((change.id, change.leaf_revs))
                        }
                        Err(error) => {
                            *changes_failure.lock().unwrap_or_else(|p| p.into_inner()) =
                                Some(error);
                            None
                        }
                    })
                }),
        )
    };
    let mut missing_stream = target.revs_diff(diff_input);

    let mut docs_read = 0u64;
    let mut doc_write_failures = 0u64;
    let mut checkpointed_seq = startup_checkpoint.unwrap_or(0);
    let mut checkpoint_timer = options.continuous.then(|| {
        tokio::time::interval_at(
            tokio::time::Instant::now() + options.checkpoint_interval,
            options.checkpoint_interval,
        )
    });

    loop {
        let next = match &mut checkpoint_timer {
            Some(timer) => tokio::select! {
                next = missing_stream.next() => next,
                _ = timer.tick() => {
                    let recorded = recorded_seq.load(Ordering::SeqCst);
                    if recorded != checkpointed_seq {
                        let entry = build_entry(
                            &session_id, &start_time, start_last_seq, recorded,
                            docs_read, doc_write_failures,
                        );
                        write_checkpoints(
                            source, target, &replication_id,
                            source_log.as_ref(), target_log.as_ref(), &entry,
                        )
                        .await?;
                        checkpointed_seq = recorded;
                    }
                    continue;
                }
            },
            None => missing_stream.next().await,
        };

        let Some(missing) = next else {
            break;
        };
        let missing = missing?;
        if missing.missing_revs.is_empty() {
            continue;
        }

        let request = ReadRequest {
            id: missing.id,
            revs: Revs::These(missing.missing_revs.into_iter().collect()),
            atts_since: Some(missing.possible_ancestors.into_iter().collect()),
        };
        let mut docs = source.read(request);

        while let Some(result) = docs.next().await {
            let doc = match result? {
                DocResult::Found(doc) => doc,
                // peers may report revisions they cannot serve; skip those
                DocResult::NotFound(_) => continue,
            };
            docs_read += 1;

            if let Err(error) = target.write(doc).await {
                tracing::warn!(%error, "failed to write document to target");
                doc_write_failures += 1;
            }
        }
    }

    if let Some(error) = changes_failure
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take()
    {
        return Err(error);
    }

    target.ensure_full_commit().await?;

    let recorded = recorded_seq.load(Ordering::SeqCst);
    let mut entry = build_entry(
        &session_id,
        &start_time,
        start_last_seq,
        recorded,
        docs_read,
        doc_write_failures,
    );
    entry.end_time = timestamp();

    if recorded != startup_checkpoint.unwrap_or(0) {
        write_checkpoints(
            source,
            target,
            &replication_id,
            source_log.as_ref(),
            target_log.as_ref(),
            &entry,
        )
        .await?;
    }

    tracing::debug!(
        replication_id,
        docs_read,
        doc_write_failures,
        recorded_seq = recorded,
        "replication session finished"
    );

    Ok(ReplicationResult {
        ok: true,
        session_id,
        source_last_seq: recorded,
        history: vec![entry],
    })
}

fn build_entry(
    session_id: &str,
    start_time: &str,
    start_last_seq: u64,
    recorded_seq: u64,
    docs_read: u64,
    doc_write_failures: u64,
) -> HistoryEntry {
    HistoryEntry {
        session_id: session_id.to_owned(),
        start_time: start_time.to_owned(),
        end_time: String::new(),
        start_last_seq,
        end_last_seq: recorded_seq,
        recorded_seq,
        docs_read,
        docs_written: docs_read - doc_write_failures,
        doc_write_failures,
    }
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc2822()
}

/// A stable digest of the two peer identities and the options, so the same
/// pairing reuses the same checkpoint documents.
async fn replication_id(
    source: &dyn Database,
    target: &dyn Database,
    options: &ReplicationOptions,
) -> Result<String> {
    let input = format!(
        "{}{}{}{}",
        source.id().await?,
        target.id().await?,
        options.create_target,
        options.continuous,
    );
    Ok(format!("{:x}", md5::compute(input)))
}

async fn read_checkpoint(db: &dyn Database, replication_id: &str) -> Result<Option<CheckpointLog>> {
    let value = db.read_local(replication_id).await?;
    // an unreadable log is the same as no log: start from scratch
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

fn compare_replication_logs(
    source: Option<&CheckpointLog>,
    target: Option<&CheckpointLog>,
) -> Option<u64> {
    let (source, target) = (source?, target?);

    if source.replication_id_version != REPLICATION_ID_VERSION
        || target.replication_id_version != REPLICATION_ID_VERSION
    {
        return None;
    }

    if source.session_id == target.session_id {
        return Some(source.source_last_seq);
    }

    // find the most recent session the diverged histories still share
    let source_sessions: HashSet<&str> = source
        .history
        .iter()
        .map(|entry| entry.session_id.as_str())
        .collect();
    target
        .history
        .iter()
        .find(|entry| source_sessions.contains(entry.session_id.as_str()))
        .map(|entry| entry.recorded_seq)
}

fn build_history(existing: Option<&CheckpointLog>, entry: &HistoryEntry) -> Vec<HistoryEntry> {
    let mut history = vec![entry.clone()];
    if let Some(log) = existing {
        history.extend(log.history.iter().take(4).cloned());
    }
    history
}

async fn write_checkpoints(
    source: &dyn Database,
    target: &dyn Database,
    replication_id: &str,
    source_log: Option<&CheckpointLog>,
    target_log: Option<&CheckpointLog>,
    entry: &HistoryEntry,
) -> Result<()> {
    for (db, existing) in [(source, source_log), (target, target_log)] {
        let log = CheckpointLog {
            replication_id_version: REPLICATION_ID_VERSION,
            session_id: entry.session_id.clone(),
            source_last_seq: entry.recorded_seq,
            history: build_history(existing, entry),
        };
        db.write_local(replication_id, Some(serde_json::to_value(&log)?))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::MemoryDatabase,
        protocol::{collect_stream, Attachment, Document},
    };
    use futures_util::TryStreamExt;
    use serde_json::{json, Map, Value};

    fn doc(id: &str, rev_num: u64, path: &[&str], value: Value) -> Document {
        let body: Map<String, Value> = match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        };
        Document::new(id, rev_num, path.iter().map(|h| h.to_string()).collect(), body)
    }

    #[tokio::test]
    async fn one_shot_replication_copies_everything() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        source.write(doc("one", 1, &["a"], json!({"n": 1}))).await.unwrap();
        source.write(doc("two", 2, &["c", "b"], json!({"n": 2}))).await.unwrap();

        let result = replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.history[0].docs_read, 2);
        assert_eq!(result.history[0].docs_written, 2);
        assert_eq!(result.history[0].doc_write_failures, 0);

        let one = target.read_winner("one").await.unwrap();
        assert_eq!(one.body.as_ref().unwrap()["n"], 1);
        let two = target.read_winner("two").await.unwrap();
        assert_eq!(two.rev(), Rev::new(2, "c"));
        assert_eq!(two.path, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn second_run_reads_nothing() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        source.write(doc("one", 1, &["a"], json!({}))).await.unwrap();
        source.write(doc("two", 1, &["b"], json!({}))).await.unwrap();

        let first = replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();
        assert_eq!(first.history[0].docs_read, 2);

        let second = replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();
        assert_eq!(second.history[0].docs_read, 0);
        assert_eq!(
            second.history[0].end_last_seq,
            second.history[0].start_last_seq
        );
    }

    #[tokio::test]
    async fn incremental_runs_transfer_only_new_writes() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        source.write(doc("one", 1, &["a"], json!({}))).await.unwrap();
        replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();

        source.write(doc("one", 2, &["b", "a"], json!({"v": 2}))).await.unwrap();
        source.write(doc("three", 1, &["c"], json!({}))).await.unwrap();

        let result = replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();
        assert_eq!(result.history[0].docs_read, 2);

        let one = target.read_winner("one").await.unwrap();
        assert_eq!(one.rev(), Rev::new(2, "b"));
    }

    #[tokio::test]
    async fn conflicts_replicate_as_sibling_branches() {
        let left = MemoryDatabase::with_id("left");
        let right = MemoryDatabase::with_id("right");

        left.write(doc("d", 1, &["a"], json!({"from": "left"}))).await.unwrap();
        right.write(doc("d", 1, &["b"], json!({"from": "right"}))).await.unwrap();

        replicate(&left, &right, ReplicationOptions::default()).await.unwrap();
        replicate(&right, &left, ReplicationOptions::default()).await.unwrap();

        // both replicas resolve the conflict the same way
        let left_winner = left.read_winner("d").await.unwrap();
        let right_winner = right.read_winner("d").await.unwrap();
        assert_eq!(left_winner.rev(), Rev::new(1, "b"));
        assert_eq!(right_winner.rev(), left_winner.rev());

        let changes: Vec<_> = right.changes(None, false).try_collect().await.unwrap();
        assert_eq!(changes[0].leaf_revs.len(), 2);
    }

    #[tokio::test]
    async fn attachments_travel_with_their_documents() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        let mut d = doc("d", 1, &["a"], json!({}));
        d.add_attachment("text.txt", "text/plain", &b"Hello World!"[..]);
        source.write(d).await.unwrap();

        replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();

        let (meta, stream) = target
            .read_attachment("d", "text.txt", None, None)
            .await
            .unwrap();
        assert_eq!(meta.digest, "md5-7Qdih1MuhjZehB6Sv8UNjA==");
        assert_eq!(collect_stream(stream).await.unwrap(), b"Hello World!");
    }

    #[tokio::test]
    async fn unchanged_attachments_replicate_as_stubs() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        let mut d = doc("d", 1, &["a"], json!({"v": 1}));
        d.add_attachment("text.txt", "text/plain", &b"Hello World!"[..]);
        source.write(d).await.unwrap();

        replicate(&source, &target, ReplicationOptions::default()).await.unwrap();

        // a new revision that keeps the attachment via a stub
        let mut update = doc("d", 2, &["b", "a"], json!({"v": 2}));
        update.attachments.as_mut().unwrap().insert(
            "text.txt".into(),
            Attachment::Stub(crate::protocol::AttachmentMetadata {
                rev_pos: 1,
                content_type: "text/plain".into(),
                length: 12,
                digest: "md5-7Qdih1MuhjZehB6Sv8UNjA==".into(),
            }),
        );
        source.write(update).await.unwrap();

        replicate(&source, &target, ReplicationOptions::default()).await.unwrap();

        let (_, stream) = target
            .read_attachment("d", "text.txt", None, None)
            .await
            .unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), b"Hello World!");
        let winner = target.read_winner("d").await.unwrap();
        assert_eq!(winner.rev(), Rev::new(2, "b"));
    }

    #[tokio::test]
    async fn tombstones_replicate() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        source.write(doc("d", 1, &["a"], json!({}))).await.unwrap();
        replicate(&source, &target, ReplicationOptions::default()).await.unwrap();

        source
            .write(Document::tombstone("d", 2, vec!["b".into(), "a".into()]))
            .await
            .unwrap();
        replicate(&source, &target, ReplicationOptions::default()).await.unwrap();

        let changes: Vec<_> = target.changes(None, false).try_collect().await.unwrap();
        assert!(changes[0].deleted);
    }

    #[tokio::test]
    async fn checkpoints_survive_unrelated_sessions() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");
        let other = MemoryDatabase::with_id("other");

        source.write(doc("one", 1, &["a"], json!({}))).await.unwrap();
        replicate(&source, &target, ReplicationOptions::default()).await.unwrap();

        // replicating elsewhere uses a different replication id
        replicate(&source, &other, ReplicationOptions::default()).await.unwrap();

        let result = replicate(&source, &target, ReplicationOptions::default())
            .await
            .unwrap();
        assert_eq!(result.history[0].docs_read, 0);
    }

    #[test]
    fn log_comparison_finds_shared_sessions() {
        let entry = |session: &str, seq: u64| HistoryEntry {
            session_id: session.into(),
            start_time: String::new(),
            end_time: String::new(),
            start_last_seq: 0,
            end_last_seq: seq,
            recorded_seq: seq,
            docs_read: 0,
            docs_written: 0,
            doc_write_failures: 0,
        };
        let log = |session: &str, seq: u64, history: Vec<HistoryEntry>| CheckpointLog {
            replication_id_version: REPLICATION_ID_VERSION,
            session_id: session.into(),
            source_last_seq: seq,
            history,
        };

        // same session: shortcut to the recorded seq
        let source = log("s1", 7, vec![entry("s1", 7)]);
        let target = log("s1", 7, vec![entry("s1", 7)]);
        assert_eq!(compare_replication_logs(Some(&source), Some(&target)), Some(7));

        // diverged: the shared older session wins
        let source = log("s3", 9, vec![entry("s3", 9), entry("s1", 5)]);
        let target = log("s2", 6, vec![entry("s2", 6), entry("s1", 5)]);
        assert_eq!(compare_replication_logs(Some(&source), Some(&target)), Some(5));

        // nothing shared: start over
        let source = log("s3", 9, vec![entry("s3", 9)]);
        let target = log("s2", 6, vec![entry("s2", 6)]);
        assert_eq!(compare_replication_logs(Some(&source), Some(&target)), None);

        // a missing side always means starting over
        assert_eq!(compare_replication_logs(Some(&source), None), None);

        // version mismatch invalidates the checkpoint
        let mut outdated = log("s1", 7, vec![entry("s1", 7)]);
        outdated.replication_id_version = 0;
        let current = log("s1", 7, vec![entry("s1", 7)]);
        assert_eq!(compare_replication_logs(Some(&outdated), Some(&current)), None);
    }

    #[tokio::test]
    async fn continuous_replication_follows_new_writes() {
        let source = MemoryDatabase::with_id("source");
        let target = MemoryDatabase::with_id("target");

        source.write(doc("one", 1, &["a"], json!({}))).await.unwrap();

        let handle = {
            let source = source.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let options = ReplicationOptions {
                    continuous: true,
                    checkpoint_interval: Duration::from_millis(50),
                    ..ReplicationOptions::default()
                };
                let _ = replicate(&source, &target, options).await;
            })
        };

        wait_for(&target, "one").await;
        source.write(doc("two", 1, &["b"], json!({}))).await.unwrap();
        wait_for(&target, "two").await;

        handle.abort();
        let _ = handle.await;
    }

    async fn wait_for(db: &MemoryDatabase, id: &str) {
        for _ in 0..200 {
            if db.read_winner(id).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {id} never arrived");
    }
}
