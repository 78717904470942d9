mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn cache_reuses_backends_in_lifo_order() {
    let Some(manager) = common::manager() else {
        return;
    };

    let s1 = manager.session().await.unwrap();
    let s2 = manager.session().await.unwrap();
    let s3 = manager.session().await.unwrap();
    let p1 = s1.pid().unwrap();
    let p2 = s2.pid().unwrap();
    let p3 = s3.pid().unwrap();
    assert_ne!(p1, p2);
    assert_ne!(p2, p3);

    drop(s1);
    drop(s2);
    drop(s3);
    assert_eq!(manager.idle_count(), 3);

    // most recently returned comes back first
    let r1 = manager.session().await.unwrap();
    let r2 = manager.session().await.unwrap();
    let r3 = manager.session().await.unwrap();
    assert_eq!(r1.pid().unwrap(), p3);
    assert_eq!(r2.pid().unwrap(), p2);
    assert_eq!(r3.pid().unwrap(), p1);
}

#[tokio::test]
async fn capacity_one_holds_a_single_idle_backend() {
    let Some(manager) = common::manager_with(|s| s.max_idle(1)) else {
        return;
    };

    let a = manager.session().await.unwrap();
    let b = manager.session().await.unwrap();
    let pid_a = a.pid().unwrap();
    let pid_b = b.pid().unwrap();
    assert_ne!(pid_a, pid_b);

    drop(a);
    let c = manager.session().await.unwrap();
    assert_eq!(c.pid().unwrap(), pid_a);

    // b and c both dropping overflows the cache; only the newest survives
    drop(b);
    drop(c);
    assert_eq!(manager.idle_count(), 1);
    let d = manager.session().await.unwrap();
    assert_eq!(d.pid().unwrap(), pid_a);
}

#[tokio::test]
async fn max_connections_resize_evicts_idle_backends() {
    let Some(manager) = common::manager() else {
        return;
    };

    let sessions: Vec<_> = [
        manager.session().await.unwrap(),
        manager.session().await.unwrap(),
        manager.session().await.unwrap(),
    ]
    .into();
    for session in sessions {
        drop(session);
    }
    assert_eq!(manager.idle_count(), 3);

    manager.max_connections(1);
    assert_eq!(manager.idle_count(), 1);
}

#[tokio::test]
async fn process_change_discards_the_cache_and_reconnects() {
    let Some(manager) = common::manager() else {
        return;
    };
    let opened = Arc::new(AtomicUsize::new(0));
    {
        let opened = Arc::clone(&opened);
        manager.on_connection(move |_| {
            opened.fetch_add(1, Ordering::SeqCst);
        });
    }

    let s = manager.session().await.unwrap();
    let old_pid = s.pid().unwrap();
    drop(s);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(manager.idle_count(), 1);

    // pretend the cache was inherited from another process
    manager.reset_owner_pid(1);
    let s = manager.session().await.unwrap();
    assert_ne!(s.pid().unwrap(), old_pid);
    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dead_cached_backends_are_skipped() {
    let Some(manager) = common::manager() else {
        return;
    };

    let victim = manager.session().await.unwrap();
    let victim_pid = victim.pid().unwrap();
    let mut killer = manager.session().await.unwrap();
    drop(victim); // parked in the cache

    killer
        .query(
            "SELECT pg_terminate_backend(?)",
            &[pg_middleware::PgValue::Int(i64::from(victim_pid))],
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // the dead entry fails its ping and a fresh backend is opened
    let fresh = manager.session().await.unwrap();
    assert_ne!(fresh.pid().unwrap(), victim_pid);
}
