mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spitestore::{
    AsyncDispatchScheduler, Commit, DispatchSchedulerHook, Dispatcher, Error, EventStore,
    PersistStreams, Pipeline, Result, ScheduleDispatches,
};

#[derive(Default)]
struct FlakyBus {
    down: AtomicBool,
    published: Mutex<Vec<i64>>,
}

#[async_trait]
impl Dispatcher for FlakyBus {
    async fn dispatch(&self, commit: &Commit) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("bus unreachable".into()));
        }
        self.published.lock().unwrap().push(commit.checkpoint.as_raw());
        Ok(())
    }
}

#[tokio::test]
async fn async_dispatch_never_blocks_the_writer() {
    let (_dir, engine) = common::open_sqlite("dispatch_async.db").await;
    let bus = Arc::new(FlakyBus::default());
    bus.down.store(true, Ordering::SeqCst);

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let scheduler = Arc::new(
        AsyncDispatchScheduler::new(bus.clone(), engine.clone()).with_error_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    scheduler.start().await.unwrap();

    let store = EventStore::with_pipeline(
        engine.clone(),
        Pipeline::default().with_hook(Arc::new(DispatchSchedulerHook::new(scheduler.clone()))),
    );
    for sequence in 1..=3 {
        store
            .commit(common::attempt("default", "s", sequence, 1))
            .await
            .unwrap();
    }

    common::eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (failures.load(Ordering::SeqCst) == 3).then_some(())
    })
    .await;
    scheduler.dispose().await;
    assert_eq!(engine.get_undispatched_commits().await.unwrap().len(), 3);

    // After a restart the backlog is recovered
    bus.down.store(false, Ordering::SeqCst);
    let recovery = AsyncDispatchScheduler::new(bus.clone(), engine.clone());
    recovery.start().await.unwrap();
    recovery.dispose().await;

    assert_eq!(*bus.published.lock().unwrap(), vec![1, 2, 3]);
    assert!(engine.get_undispatched_commits().await.unwrap().is_empty());
}
