mod common;

use std::sync::Arc;

use spitestore::{
    BucketId, CheckpointToken, Error, PersistStreams, SqliteConfig, SqlitePersistence, StreamId,
    StreamRev,
};

#[tokio::test]
async fn commits_and_heads_survive_reopen() {
    common::init_tracing();
    let (_dir, path) = common::temp_db_path("restart.db");

    let first_attempt = common::attempt("default", "s", 1, 2);
    {
        let engine = SqlitePersistence::open(common::test_config(&path)).await.unwrap();
        engine.initialize().await.unwrap();
        engine.commit(first_attempt.clone()).await.unwrap();
        engine.commit(common::attempt("default", "s", 2, 2)).await.unwrap();
        engine.dispose().await;
    }

    let engine = SqlitePersistence::open(common::test_config(&path)).await.unwrap();

    // The writer's head cache starts cold; conflicts still come from disk
    let err = engine
        .commit(common::attempt("default", "s", 2, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Concurrency { .. }));

    let err = engine.commit(first_attempt).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateCommit { .. }));

    let next = engine
        .commit(common::attempt("default", "s", 3, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.checkpoint.as_raw(), 3);

    let commits = engine
        .get_from(&BucketId::default(), &StreamId::new("s"), StreamRev::FIRST, StreamRev::MAX)
        .await
        .unwrap();
    assert_eq!(commits.len(), 3);
    assert_eq!(commits.last().unwrap().stream_revision, StreamRev::from_raw(6));
}

#[tokio::test]
async fn purge_does_not_reuse_checkpoints() {
    let (_dir, engine) = common::open_sqlite("purge_checkpoints.db").await;

    let before = engine
        .commit(common::attempt("default", "s", 1, 1))
        .await
        .unwrap()
        .unwrap();
    engine.purge().await.unwrap();
    assert!(engine
        .get_from_checkpoint(CheckpointToken::START)
        .await
        .unwrap()
        .is_empty());

    let after = engine
        .commit(common::attempt("default", "s", 1, 1))
        .await
        .unwrap()
        .unwrap();
    assert!(after.checkpoint > before.checkpoint);
}

#[tokio::test]
async fn drop_all_then_reinitialize() {
    let (_dir, engine) = common::open_sqlite("drop_all.db").await;
    engine
        .commit(common::attempt("default", "s", 1, 1))
        .await
        .unwrap();

    engine.drop_all().await.unwrap();

    // The next operation recreates the schema
    let feed = engine.get_from_checkpoint(CheckpointToken::START).await.unwrap();
    assert!(feed.is_empty());
    engine
        .commit(common::attempt("default", "s", 1, 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_writers_have_one_winner() {
    let (_dir, engine) = common::open_sqlite("race.db").await;
    let engine: Arc<dyn PersistStreams> = engine;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine.commit(common::attempt("default", "contended", 1, 1)).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(Some(_)) => winners += 1,
            Err(Error::Concurrency { .. }) => conflicts += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn environment_overrides_apply() {
    let (_dir, path) = common::temp_db_path("env.db");
    let config = SqliteConfig::from_env(&path).unwrap();
    config.validate().unwrap();

    let engine = SqlitePersistence::open(config.with_reader_threads(1)).await.unwrap();
    assert_eq!(engine.reader_count(), 1);
    engine.dispose().await;
}
