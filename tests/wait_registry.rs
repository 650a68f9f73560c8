//! Wait registry tests
//!
//! Ordering, removal and timeout behaviour of raw waits, independent of
//! the conversation engine.

use huddle::runtime::{
    Message, Scheduler, Scope, ScopeMatcher, WaitId, WaitRegistry, WaitResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn registry() -> WaitRegistry {
    WaitRegistry::new(Scheduler::current(Duration::from_millis(10)).unwrap(), 16)
}

#[tokio::test]
async fn most_recent_wait_wins_unless_it_passes() {
    let registry = registry();
    let scope = Scope::in_group(1, 2);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = calls.clone();
    let w1 = registry.register(ScopeMatcher::from_scope(&scope), move |_, _| {
        log.lock().push("w1");
        WaitResult::Suspend
    });
    let log = calls.clone();
    let passing = Arc::new(Mutex::new(false));
    let pass = passing.clone();
    let w2 = registry.register(ScopeMatcher::from_scope(&scope), move |_, _| {
        log.lock().push("w2");
        if *pass.lock() {
            WaitResult::PassThrough
        } else {
            WaitResult::Suspend
        }
    });

    assert_eq!(registry.dispatch(&scope, &Message::new("a")), Some(w2));
    assert_eq!(*calls.lock(), vec!["w2"]);

    *passing.lock() = true;
    assert_eq!(registry.dispatch(&scope, &Message::new("b")), Some(w1));
    assert_eq!(*calls.lock(), vec!["w2", "w2", "w1"]);
}

#[tokio::test]
async fn removing_results_leave_the_registry() {
    let registry = registry();
    // Registered oldest first; dispatch visits them in reverse.
    let results = [
        WaitResult::Complete,
        WaitResult::PassThrough,
        WaitResult::Reject,
        WaitResult::PassThrough,
        WaitResult::Reject,
    ];
    let ids: Vec<(WaitId, WaitResult)> = results
        .iter()
        .map(|&result| (registry.register(ScopeMatcher::All, move |_, _| result), result))
        .collect();

    let consumed = registry.dispatch(&Scope::private(1), &Message::new("x"));
    assert_eq!(consumed, Some(ids[0].0));

    for (id, result) in &ids {
        assert_eq!(registry.contains(*id), !result.removes(), "{id} after {result:?}");
    }

    // Dispatching again only reaches the pass-through waits.
    assert_eq!(registry.dispatch(&Scope::private(1), &Message::new("y")), None);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn suspend_resets_deadline_and_voids_old_timer() {
    tokio::time::pause();
    let registry = registry();
    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    let id = registry.register_with_timeout(
        ScopeMatcher::All,
        Duration::from_millis(100),
        |_, _| WaitResult::Suspend,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(registry.dispatch(&Scope::private(1), &Message::new("x")), Some(id));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 0, "stale timer must not fire");
    assert!(registry.contains(id));

    tokio::time::sleep(Duration::from_millis(55)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(!registry.contains(id));
}

#[tokio::test]
async fn pass_through_does_not_reset_deadline() {
    tokio::time::pause();
    let registry = registry();
    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    registry.register_with_timeout(
        ScopeMatcher::All,
        Duration::from_millis(100),
        |_, _| WaitResult::PassThrough,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    );

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.dispatch(&Scope::private(1), &Message::new("x")), None);
    }

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn resume_may_register_new_waits() {
    let registry = registry();
    let inner = registry.clone();
    let follow_up = Arc::new(Mutex::new(None));
    let slot = follow_up.clone();
    registry.register(ScopeMatcher::All, move |_, _| {
        let id = inner.register(ScopeMatcher::All, |_, _| WaitResult::Complete);
        *slot.lock() = Some(id);
        WaitResult::Complete
    });

    assert!(registry.dispatch(&Scope::private(1), &Message::new("x")).is_some());
    let id = follow_up.lock().unwrap();
    assert!(registry.contains(id));
    assert_eq!(registry.dispatch(&Scope::private(1), &Message::new("y")), Some(id));
    assert!(registry.is_empty());
}

#[test]
fn concurrent_dispatch_runs_one_resume_at_a_time() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = WaitRegistry::new(
        Scheduler::new(runtime.handle().clone(), Duration::from_millis(10)),
        16,
    );
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let (a, p, h) = (active.clone(), peak.clone(), handled.clone());
    registry.register(ScopeMatcher::All, move |_, _| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        a.fetch_sub(1, Ordering::SeqCst);
        h.fetch_add(1, Ordering::SeqCst);
        WaitResult::Suspend
    });

    std::thread::scope(|threads| {
        for user in 0..8 {
            let registry = registry.clone();
            threads.spawn(move || {
                for _ in 0..5 {
                    registry.dispatch(&Scope::private(user), &Message::new("x"));
                }
            });
        }
    });

    assert_eq!(handled.load(Ordering::SeqCst), 40);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
