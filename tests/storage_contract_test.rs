mod common;

use serde_json::json;
use spitestore::{
    BucketId, CheckpointToken, CommitId, Error, ErrorKind, Snapshot, StreamId, StreamRev,
};

#[tokio::test]
async fn replayed_attempt_is_a_duplicate() {
    let (_dir, engines) = common::engines("duplicate.db").await;

    for (name, engine) in engines {
        let attempt = common::attempt("default", "order-1", 1, 1);

        assert!(engine.commit(attempt.clone()).await.unwrap().is_some(), "{name}");
        let err = engine.commit(attempt).await.unwrap_err();

        assert!(matches!(err, Error::DuplicateCommit { .. }), "{name}: {err:?}");
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }
}

#[tokio::test]
async fn competing_sequence_is_a_conflict() {
    let (_dir, engines) = common::engines("conflict.db").await;

    for (name, engine) in engines {
        let winner = common::attempt("default", "order-1", 1, 1);
        let loser = common::attempt("default", "order-1", 1, 1);

        engine.commit(winner.clone()).await.unwrap();
        let err = engine.commit(loser).await.unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }), "{name}: {err:?}");
        assert!(err.is_recoverable());

        let commits = engine
            .get_from(&BucketId::default(), &StreamId::new("order-1"), StreamRev::FIRST, StreamRev::MAX)
            .await
            .unwrap();
        assert_eq!(commits.len(), 1, "{name}");
        assert_eq!(commits[0].commit_id, winner.commit_id);
    }
}

#[tokio::test]
async fn overlapping_revision_is_a_conflict() {
    let (_dir, engines) = common::engines("overlap_conflict.db").await;

    for (name, engine) in engines {
        engine.commit(common::attempt("default", "s", 1, 2)).await.unwrap();

        // Next sequence, but claims revision 2 which commit 1 already covers
        let mut stale = common::attempt("default", "s", 2, 2);
        stale.stream_revision = StreamRev::from_raw(3);

        let err = engine.commit(stale).await.unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }), "{name}: {err:?}");
    }
}

#[tokio::test]
async fn range_read_returns_overlapping_commits() {
    let (_dir, engines) = common::engines("range.db").await;

    for (name, engine) in engines {
        for sequence in 1..=4 {
            engine
                .commit(common::attempt("default", "s", sequence, 2))
                .await
                .unwrap();
        }

        let commits = engine
            .get_from(
                &BucketId::default(),
                &StreamId::new("s"),
                StreamRev::from_raw(3),
                StreamRev::from_raw(5),
            )
            .await
            .unwrap();

        let revisions: Vec<u64> = commits.iter().map(|c| c.stream_revision.as_raw()).collect();
        assert_eq!(revisions, vec![4, 6], "{name}");
    }
}

#[tokio::test]
async fn open_ended_range_beyond_storable_revision() {
    let (_dir, engines) = common::engines("huge_range.db").await;

    for (name, engine) in engines {
        engine.commit(common::attempt("default", "s", 1, 2)).await.unwrap();

        let commits = engine
            .get_from(
                &BucketId::default(),
                &StreamId::new("s"),
                StreamRev::FIRST,
                StreamRev::from_raw(u64::MAX),
            )
            .await
            .unwrap();
        assert_eq!(commits.len(), 1, "{name}");

        let snapshot = engine
            .get_snapshot(&BucketId::default(), &StreamId::new("s"), StreamRev::from_raw(u64::MAX))
            .await
            .unwrap();
        assert!(snapshot.is_none(), "{name}");
    }
}

#[tokio::test]
async fn revision_beyond_storable_range_is_rejected() {
    let (_dir, engines) = common::engines("huge_revision.db").await;

    for (name, engine) in engines {
        let mut attempt = common::attempt("default", "s", 1, 1);
        attempt.stream_revision = StreamRev::from_raw(u64::MAX);
        let err = engine.commit(attempt).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAttempt(_)), "{name}: {err:?}");

        engine.commit(common::attempt("default", "s", 1, 1)).await.unwrap();
        let added = engine
            .add_snapshot(Snapshot::new(
                "default",
                "s",
                StreamRev::from_raw(u64::MAX),
                json!({ "total": 1 }),
            ))
            .await
            .unwrap();
        assert!(!added, "{name}");
    }
}

#[tokio::test]
async fn checkpoints_strictly_increase_across_buckets() {
    let (_dir, engines) = common::engines("checkpoints.db").await;

    for (name, engine) in engines {
        for i in 0..6u64 {
            let bucket = if i % 2 == 0 { "a" } else { "b" };
            engine
                .commit(common::attempt(bucket, &format!("s{}", i / 2), 1, 1))
                .await
                .unwrap();
        }

        let feed = engine.get_from_checkpoint(CheckpointToken::START).await.unwrap();
        assert_eq!(feed.len(), 6, "{name}");
        for pair in feed.windows(2) {
            assert!(pair[0].checkpoint < pair[1].checkpoint, "{name}");
        }

        let after_second = engine
            .get_from_checkpoint(feed[1].checkpoint)
            .await
            .unwrap();
        assert_eq!(after_second.len(), 4, "{name}");

        let bounded = engine
            .get_from_to(feed[1].checkpoint, feed[3].checkpoint)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 2, "{name}");

        let only_a = engine
            .get_from_bucket_checkpoint(&BucketId::new("a"), CheckpointToken::START)
            .await
            .unwrap();
        assert_eq!(only_a.len(), 3, "{name}");
        assert!(only_a.iter().all(|c| c.bucket_id.as_str() == "a"));
    }
}

#[tokio::test]
async fn purging_one_bucket_leaves_the_other() {
    let (_dir, engines) = common::engines("buckets.db").await;
    let a = BucketId::new("a");
    let b = BucketId::new("b");
    let stream = StreamId::new("shared-id");

    for (name, engine) in engines {
        engine.commit(common::attempt("a", "shared-id", 1, 2)).await.unwrap();
        engine.commit(common::attempt("b", "shared-id", 1, 2)).await.unwrap();
        engine
            .add_snapshot(Snapshot::new("b", "shared-id", StreamRev::from_raw(2), json!("b-state")))
            .await
            .unwrap();

        // Same stream id, different bucket: never visible across
        let in_b = engine
            .get_from(&b, &stream, StreamRev::FIRST, StreamRev::MAX)
            .await
            .unwrap();
        assert_eq!(in_b.len(), 1, "{name}");
        assert!(in_b.iter().all(|c| c.bucket_id == b));

        engine.purge_bucket(&a).await.unwrap();

        assert!(engine
            .get_from(&a, &stream, StreamRev::FIRST, StreamRev::MAX)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .get_from(&b, &stream, StreamRev::FIRST, StreamRev::MAX)
                .await
                .unwrap()
                .len(),
            1,
            "{name}"
        );
        assert!(engine
            .get_snapshot(&b, &stream, StreamRev::MAX)
            .await
            .unwrap()
            .is_some());
        assert_eq!(engine.get_streams_to_snapshot(&b, 0).await.unwrap().len(), 1, "{name}");
        assert!(engine.get_streams_to_snapshot(&a, 0).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn snapshot_selection_picks_highest_at_or_below() {
    let (_dir, engines) = common::engines("snapshots.db").await;
    let bucket = BucketId::default();
    let stream = StreamId::new("s");

    for (name, engine) in engines {
        for sequence in 1..=5 {
            engine
                .commit(common::attempt("default", "s", sequence, 1))
                .await
                .unwrap();
        }
        for revision in [1u64, 3, 5] {
            let added = engine
                .add_snapshot(Snapshot::new("default", "s", StreamRev::from_raw(revision), json!(revision)))
                .await
                .unwrap();
            assert!(added, "{name}");
        }

        let snapshot = engine
            .get_snapshot(&bucket, &stream, StreamRev::from_raw(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.stream_revision, StreamRev::from_raw(3), "{name}");
        assert_eq!(snapshot.payload, json!(3));

        // Last write wins for the same revision
        engine
            .add_snapshot(Snapshot::new("default", "s", StreamRev::from_raw(3), json!("newer")))
            .await
            .unwrap();
        let replaced = engine
            .get_snapshot(&bucket, &stream, StreamRev::from_raw(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.payload, json!("newer"), "{name}");
    }
}

#[tokio::test]
async fn snapshot_for_unknown_stream_is_rejected() {
    let (_dir, engines) = common::engines("snapshot_unknown.db").await;

    for (name, engine) in engines {
        let added = engine
            .add_snapshot(Snapshot::new("default", "ghost", StreamRev::from_raw(3), json!({})))
            .await
            .unwrap();
        assert!(!added, "{name}");
    }
}

#[tokio::test]
async fn streams_to_snapshot_respect_threshold() {
    let (_dir, engines) = common::engines("heads.db").await;
    let bucket = BucketId::default();

    for (name, engine) in engines {
        for sequence in 1..=3 {
            engine.commit(common::attempt("default", "busy", sequence, 2)).await.unwrap();
        }
        engine.commit(common::attempt("default", "quiet", 1, 1)).await.unwrap();

        let due = engine.get_streams_to_snapshot(&bucket, 5).await.unwrap();
        assert_eq!(due.len(), 1, "{name}");
        assert_eq!(due[0].stream_id.as_str(), "busy");
        assert_eq!(due[0].head_revision, StreamRev::from_raw(6));

        engine
            .add_snapshot(Snapshot::new("default", "busy", StreamRev::from_raw(4), json!({})))
            .await
            .unwrap();
        assert!(engine.get_streams_to_snapshot(&bucket, 5).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn deleted_stream_disappears_everywhere() {
    let (_dir, engines) = common::engines("delete.db").await;
    let bucket = BucketId::default();
    let stream = StreamId::new("doomed");

    for (name, engine) in engines {
        engine.commit(common::attempt("default", "doomed", 1, 1)).await.unwrap();
        engine.commit(common::attempt("default", "kept", 1, 1)).await.unwrap();
        let before = engine.get_from_checkpoint(CheckpointToken::START).await.unwrap();
        let last = before.last().unwrap().checkpoint;

        engine.delete_stream(&bucket, &stream).await.unwrap();

        assert!(engine
            .get_from(&bucket, &stream, StreamRev::FIRST, StreamRev::MAX)
            .await
            .unwrap()
            .is_empty());
        let feed = engine.get_from_checkpoint(CheckpointToken::START).await.unwrap();
        assert_eq!(feed.len(), 1, "{name}");
        assert_eq!(feed[0].stream_id.as_str(), "kept");

        // The id can be reused, but its checkpoint is new
        let reused = engine
            .commit(common::attempt("default", "doomed", 1, 1))
            .await
            .unwrap()
            .unwrap();
        assert!(reused.checkpoint > last, "{name}");
    }
}

#[tokio::test]
async fn dispatch_markers_are_idempotent() {
    let (_dir, engines) = common::engines("dispatch.db").await;

    for (name, engine) in engines {
        let first = engine.commit(common::attempt("default", "s", 1, 1)).await.unwrap().unwrap();
        engine.commit(common::attempt("default", "s", 2, 1)).await.unwrap();
        assert_eq!(engine.get_undispatched_commits().await.unwrap().len(), 2, "{name}");

        engine.mark_commit_as_dispatched(&first).await.unwrap();
        engine.mark_commit_as_dispatched(&first).await.unwrap();

        let pending = engine.get_undispatched_commits().await.unwrap();
        assert_eq!(pending.len(), 1, "{name}");
        assert_eq!(pending[0].commit_sequence.as_raw(), 2);
    }
}

#[tokio::test]
async fn invalid_attempts_never_reach_storage() {
    let (_dir, engines) = common::engines("invalid.db").await;

    for (name, engine) in engines {
        let mut empty = common::attempt("default", "s", 1, 1);
        empty.events.clear();
        assert!(matches!(engine.commit(empty).await, Err(Error::InvalidAttempt(_))), "{name}");

        let mut nil = common::attempt("default", "s", 1, 1);
        nil.commit_id = CommitId::from_uuid(uuid_nil());
        assert!(matches!(engine.commit(nil).await, Err(Error::InvalidAttempt(_))), "{name}");

        assert!(engine
            .get_from_checkpoint(CheckpointToken::START)
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn disposed_engine_rejects_operations() {
    let (_dir, engines) = common::engines("disposed.db").await;

    for (name, engine) in engines {
        engine.dispose().await;
        engine.dispose().await;
        assert!(engine.is_disposed(), "{name}");

        let err = engine
            .commit(common::attempt("default", "s", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disposed(_)), "{name}: {err:?}");
        assert_eq!(err.kind(), ErrorKind::Disposed);
    }
}

fn uuid_nil() -> uuid::Uuid {
    uuid::Uuid::nil()
}
