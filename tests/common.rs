#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spitestore::{
    CommitAttempt, CommitId, CommitSequence, EventMessage, InMemoryPersistence, Payload,
    PersistStreams, SqliteConfig, SqlitePersistence, StreamRev, WriterConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn test_config(path: &PathBuf) -> SqliteConfig {
    let mut config = SqliteConfig::new(path).with_reader_threads(2);
    config.writer = writer_config_with_batch_timeout(Duration::from_millis(2));
    config
}

pub async fn open_sqlite(name: &str) -> (tempfile::TempDir, Arc<SqlitePersistence>) {
    init_tracing();
    let (dir, path) = temp_db_path(name);
    let engine = SqlitePersistence::open(test_config(&path))
        .await
        .expect("open sqlite engine");
    engine.initialize().await.expect("initialize schema");
    (dir, Arc::new(engine))
}

pub async fn open_sqlite_with_page_size(
    name: &str,
    page_size: usize,
) -> (tempfile::TempDir, Arc<SqlitePersistence>) {
    init_tracing();
    let (dir, path) = temp_db_path(name);
    let engine = SqlitePersistence::open(test_config(&path).with_page_size(page_size))
        .await
        .expect("open sqlite engine");
    (dir, Arc::new(engine))
}

/// Both engines, so contract tests can run against each.
pub async fn engines(name: &str) -> (tempfile::TempDir, Vec<(&'static str, Arc<dyn PersistStreams>)>) {
    let (dir, sqlite) = open_sqlite(name).await;
    let memory: Arc<dyn PersistStreams> = Arc::new(InMemoryPersistence::new());
    (dir, vec![("sqlite", sqlite as Arc<dyn PersistStreams>), ("memory", memory)])
}

pub fn event(n: u64) -> EventMessage {
    EventMessage::new(Payload::new("TestEvent", json!({ "n": n })))
}

/// An attempt for commit `sequence` carrying `per_commit` events, assuming
/// every earlier commit carried the same number.
pub fn attempt(bucket: &str, stream: &str, sequence: u64, per_commit: u64) -> CommitAttempt {
    let first = (sequence - 1) * per_commit + 1;
    let events = (first..first + per_commit).map(event).collect();
    CommitAttempt::new(
        bucket,
        stream,
        StreamRev::from_raw(first + per_commit - 1),
        CommitId::new(),
        CommitSequence::from_raw(sequence),
        events,
    )
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn writer_config_with_batch_timeout(batch_timeout: Duration) -> WriterConfig {
    WriterConfig {
        batch_timeout,
        ..WriterConfig::default()
    }
}
