//! Budget-driven eviction over a real cache directory.

mod common;

use bridge_desktop::TokioBackgroundExecutor;
use bridge_traits::background::{BackgroundExecutor, TaskId};
use bridge_traits::time::FixedClock;
use common::{next_purge_event, Env, OpenItems};
use core_cache::locks::ItemLocks;
use core_cache::{
    CacheItemRepository, CachePurger, CacheableItem, ItemId, PurgeOutcome, PurgeReport,
    PurgeTask,
};
use core_cache::purger::PURGE_TASK_ID;
use core_runtime::events::{EventBus, PurgeEvent};
use std::sync::Arc;
use std::time::Duration;

const DAY: i64 = 24 * 60 * 60;
const NOW: i64 = 1_700_000_000;
const FILE_SIZE: usize = 100;

struct Fixture {
    env: Env,
    purger: Arc<CachePurger>,
    playing: Arc<OpenItems>,
    events: EventBus,
}

async fn fixture(budget: u64) -> Fixture {
    let env = Env::new().await;
    let playing = Arc::new(OpenItems::default());
    let events = EventBus::new(64);
    let purger = Arc::new(CachePurger::new(
        env.repo.clone(),
        env.fs.clone(),
        env.layout.clone(),
        playing.clone(),
        Arc::new(FixedClock::at_unix(NOW)),
        events.clone(),
        Arc::new(ItemLocks::new()),
        budget,
        Duration::from_secs(2 * DAY as u64),
    ));

    Fixture {
        env,
        purger,
        playing,
        events,
    }
}

/// Register a cached item backed by a `FILE_SIZE`-byte file.
async fn cache_item(env: &Env, id: &str, age_days: i64) -> CacheableItem {
    let item = CacheableItem::new(
        id,
        format!("https://cdn.example.com/feed/{}.mp3", id),
        NOW - age_days * DAY,
    );
    env.repo.upsert(&item).await.unwrap();

    let filename = format!("{}.mp3", id);
    std::fs::write(env.layout.cached_path(&filename), vec![0u8; FILE_SIZE]).unwrap();
    env.repo
        .set_cached_filename(&item.id, Some(&filename))
        .await
        .unwrap();
    item
}

async fn is_cached(env: &Env, item: &CacheableItem) -> bool {
    let stored = env.repo.find_by_id(&item.id).await.unwrap().unwrap();
    let path = env.layout.cached_path(&format!("{}.mp3", item.id));
    stored.cached_filename.is_some() && path.exists()
}

#[core_async::test]
async fn test_purge_skips_queued_and_playing_items() {
    let f = fixture(5 * FILE_SIZE as u64).await;
    let mut rx = f.events.subscribe();

    let queued = cache_item(&f.env, "queued", 10).await;
    let playing = cache_item(&f.env, "playing", 9).await;
    let oldest_free = cache_item(&f.env, "old", 8).await;
    let mut rest = Vec::new();
    for (id, age) in [("mid", 7), ("newer", 1), ("newest", 0)] {
        rest.push(cache_item(&f.env, id, age).await);
    }
    f.env.repo.set_queued(&queued.id, true).await.unwrap();
    f.playing.open("playing");

    let outcome = f.purger.purge().await.unwrap();
    assert_eq!(
        outcome,
        PurgeOutcome::Completed(PurgeReport {
            bytes_used: 600,
            bytes_to_free: 100,
            bytes_freed: 100,
            items_evicted: 1,
            items_failed: 0,
            items_playing: 1,
        })
    );

    assert!(is_cached(&f.env, &queued).await);
    assert!(is_cached(&f.env, &playing).await);
    assert!(!is_cached(&f.env, &oldest_free).await);
    for item in &rest {
        assert!(is_cached(&f.env, item).await);
    }
    assert_eq!(f.purger.cache_usage().await.unwrap(), 500);

    assert_eq!(
        next_purge_event(&mut rx).await,
        PurgeEvent::Started {
            bytes_used: 600,
            bytes_to_free: 100,
        }
    );
    assert_eq!(
        next_purge_event(&mut rx).await,
        PurgeEvent::ItemEvicted {
            item_id: "old".to_string(),
            bytes_freed: 100,
        }
    );
    assert!(matches!(
        next_purge_event(&mut rx).await,
        PurgeEvent::Completed {
            items_evicted: 1,
            cancelled: false,
            ..
        }
    ));
}

#[core_async::test]
async fn test_stale_finished_items_go_first() {
    let f = fixture(2 * FILE_SIZE as u64).await;

    let old_unfinished = cache_item(&f.env, "old-unfinished", 30).await;
    let finished = cache_item(&f.env, "finished", 1).await;
    let recent = cache_item(&f.env, "recent", 0).await;
    f.env
        .repo
        .set_finished_at(&finished.id, Some(NOW - 3 * DAY))
        .await
        .unwrap();

    let outcome = f.purger.purge().await.unwrap();
    assert!(matches!(outcome, PurgeOutcome::Completed(ref report) if report.items_evicted == 1));
    assert!(!is_cached(&f.env, &finished).await);
    assert!(is_cached(&f.env, &old_unfinished).await);
    assert!(is_cached(&f.env, &recent).await);
}

#[core_async::test]
async fn test_pinned_items_survive_an_unreachable_budget() {
    let f = fixture(10).await;

    let pinned = cache_item(&f.env, "pinned", 30).await;
    let plain = cache_item(&f.env, "plain", 20).await;
    f.env.repo.set_pinned(&pinned.id, true).await.unwrap();

    match f.purger.purge().await.unwrap() {
        PurgeOutcome::Completed(report) => {
            assert_eq!(report.items_evicted, 1);
            assert!(!report.satisfied());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(is_cached(&f.env, &pinned).await);
    assert!(!is_cached(&f.env, &plain).await);
}

#[core_async::test]
async fn test_shared_file_survives_while_another_item_holds_it() {
    let f = fixture(FILE_SIZE as u64 + FILE_SIZE as u64 / 2).await;
    let shared = f.env.layout.cached_path("shared.mp3");
    std::fs::write(&shared, vec![0u8; FILE_SIZE]).unwrap();
    for (id, age, pinned) in [("a", 5, false), ("b", 4, true)] {
        let item = CacheableItem::new(
            id,
            "https://cdn.example.com/feed/shared.mp3",
            NOW - age * DAY,
        )
        .with_pinned(pinned);
        f.env.repo.upsert(&item).await.unwrap();
        f.env
            .repo
            .set_cached_filename(&item.id, Some("shared.mp3"))
            .await
            .unwrap();
    }
    let own = cache_item(&f.env, "c", 3).await;

    match f.purger.purge().await.unwrap() {
        PurgeOutcome::Completed(report) => {
            assert_eq!(report.items_evicted, 2);
            assert_eq!(report.bytes_freed, FILE_SIZE as u64);
            assert!(report.satisfied());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert!(shared.exists());
    let a = f.env.repo.find_by_id(&ItemId::from("a")).await.unwrap().unwrap();
    let b = f.env.repo.find_by_id(&ItemId::from("b")).await.unwrap().unwrap();
    assert!(a.cached_filename.is_none());
    assert_eq!(b.cached_filename.as_deref(), Some("shared.mp3"));
    assert!(!is_cached(&f.env, &own).await);
}

#[core_async::test]
async fn test_under_budget_is_a_no_op() {
    let f = fixture(1_000).await;
    let item = cache_item(&f.env, "only", 30).await;

    assert_eq!(
        f.purger.purge().await.unwrap(),
        PurgeOutcome::UnderBudget { bytes_used: 100 }
    );
    assert!(is_cached(&f.env, &item).await);
}

#[core_async::test]
async fn test_overlapping_purges_do_not_both_run() {
    let f = fixture(FILE_SIZE as u64).await;
    for (id, age) in [("a", 5), ("b", 4), ("c", 3)] {
        cache_item(&f.env, id, age).await;
    }

    let (first, second) = futures::join!(f.purger.purge(), f.purger.purge());
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == PurgeOutcome::AlreadyRunning)
            .count(),
        1
    );
    assert!(!f.purger.is_running());
    assert_eq!(f.purger.cache_usage().await.unwrap(), 100);
}

#[core_async::test]
async fn test_scheduled_purge_reschedules_itself() {
    let f = fixture(2 * FILE_SIZE as u64).await;
    let mut rx = f.events.subscribe();
    for (id, age) in [("a", 5), ("b", 4), ("c", 3)] {
        cache_item(&f.env, id, age).await;
    }

    let executor = Arc::new(TokioBackgroundExecutor::new());
    let task = PurgeTask::new(
        f.purger.clone(),
        executor.clone(),
        Duration::from_millis(30),
    );
    task.register().await.unwrap();

    assert!(matches!(
        next_purge_event(&mut rx).await,
        PurgeEvent::Started { .. }
    ));
    loop {
        if let PurgeEvent::Completed { items_evicted, .. } = next_purge_event(&mut rx).await {
            assert_eq!(items_evicted, 1);
            break;
        }
    }

    // The next run finds the cache within budget.
    assert_eq!(
        next_purge_event(&mut rx).await,
        PurgeEvent::Skipped {
            reason: "under budget".to_string(),
        }
    );

    executor
        .cancel_task(&TaskId::new(PURGE_TASK_ID))
        .await
        .unwrap();
}
