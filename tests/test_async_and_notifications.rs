mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pg_middleware::{PgMiddlewareError, PgValue};

#[tokio::test]
async fn only_one_async_query_at_a_time() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = Arc::clone(&done);
        db.query_async("SELECT pg_sleep(0.1)", &[], move |err, _| {
            assert!(err.is_none());
            done.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }
    assert!(db.is_watched());

    let err = db
        .query_async("SELECT 1", &[], |_, _| {})
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Non-blocking query already in progress");
    assert!(matches!(err, PgMiddlewareError::Busy));

    // blocking queries are refused too while one is in flight
    let err = db.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, PgMiddlewareError::Busy));

    db.drive().await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!db.is_watched());
}

#[tokio::test]
async fn concurrent_async_queries_on_separate_sessions() {
    let Some(manager) = common::manager() else {
        return;
    };

    let answers = Arc::new(Mutex::new(Vec::<i64>::new()));
    let mut sessions = Vec::new();
    for n in 1..=3i64 {
        let mut db = manager.session().await.unwrap();
        let answers = Arc::clone(&answers);
        db.query_async(
            &format!("SELECT {n}::bigint AS k"),
            &[],
            move |err, results| {
                assert!(err.is_none());
                let mut results = results.unwrap();
                let row = results.array().unwrap().unwrap();
                answers.lock().unwrap().push(row[0].as_int().unwrap());
            },
        )
        .await
        .unwrap();
        sessions.push(db);
    }

    for db in &mut sessions {
        db.drive().await.unwrap();
    }

    let mut seen = answers.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn notifications_deliver_before_async_completion() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut listener = manager.session().await.unwrap();
    let mut notifier = manager.session().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let order = Arc::clone(&order);
        listener.on_notification(move |n| {
            order
                .lock()
                .unwrap()
                .push(format!("notify:{}", n.payload()));
        });
    }
    listener.listen("ordering").await.unwrap();

    {
        let order = Arc::clone(&order);
        listener
            .query_async("SELECT pg_sleep(0.2)", &[], move |err, _| {
                assert!(err.is_none());
                order.lock().unwrap().push("complete".to_string());
            })
            .await
            .unwrap();
    }
    notifier.notify("ordering", Some("foo")).await.unwrap();

    while !order.lock().unwrap().iter().any(|e| e == "complete") {
        listener.step().await.unwrap();
    }
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["notify:foo".to_string(), "complete".to_string()]
    );
    // still subscribed, so the socket stays attended
    assert!(listener.is_watched());
}

#[tokio::test]
async fn listen_notify_between_sessions() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut a = manager.session().await.unwrap();
    let mut b = manager.session().await.unwrap();

    let seen_a = Arc::new(Mutex::new(Vec::<(String, i32, String)>::new()));
    let seen_b = Arc::new(Mutex::new(Vec::<(String, i32, String)>::new()));
    {
        let seen = Arc::clone(&seen_a);
        a.on_notification(move |n| {
            seen.lock().unwrap().push((
                n.channel().to_string(),
                n.process_id(),
                n.payload().to_string(),
            ));
        });
    }
    {
        let seen = Arc::clone(&seen_b);
        b.on_notification(move |n| {
            seen.lock().unwrap().push((
                n.channel().to_string(),
                n.process_id(),
                n.payload().to_string(),
            ));
        });
    }

    a.listen("dbtest").await.unwrap();
    b.listen("dbtest").await.unwrap();
    assert!(a.is_listening("dbtest"));
    assert!(!a.is_listening("other"));

    // b notifies itself and a
    b.notify("dbtest", Some("foo")).await.unwrap();
    while seen_a.lock().unwrap().is_empty() {
        a.step().await.unwrap();
    }

    let got_a = seen_a.lock().unwrap()[0].clone();
    assert_eq!(got_a.0, "dbtest");
    assert!(got_a.1 > 0);
    assert_eq!(got_a.2, "foo");
    let got_b = seen_b.lock().unwrap()[0].clone();
    assert_eq!(got_b.2, "foo");

    // after a unlistens, only b hears the next one; no payload reads empty
    a.unlisten("dbtest").await.unwrap();
    assert!(!a.is_listening("dbtest"));
    assert!(!a.is_watched());

    b.notify("dbtest", None).await.unwrap();
    assert_eq!(seen_b.lock().unwrap().len(), 2);
    assert_eq!(seen_b.lock().unwrap()[1].2, "");
    assert_eq!(seen_a.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn terminated_backend_emits_one_close_event() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut listener = manager.session().await.unwrap();
    let mut killer = manager.session().await.unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = Arc::clone(&closes);
        listener.on_close(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }
    listener.listen("doomed").await.unwrap();
    let pid = listener.pid().unwrap();

    killer
        .query(
            "SELECT pg_terminate_backend(?)",
            &[PgValue::Int(i64::from(pid))],
        )
        .await
        .unwrap();

    while closes.load(Ordering::SeqCst) == 0 {
        listener.step().await.unwrap();
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(!listener.is_watched());

    // drive() finds nothing left to do and the count stays at one
    listener.drive().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_a_session_aborts_the_inflight_continuation() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();

    let outcome = Arc::new(Mutex::new(None::<(String, bool)>));
    {
        let outcome = Arc::clone(&outcome);
        db.query_async("SELECT 1", &[], move |err, results| {
            *outcome.lock().unwrap() =
                Some((err.unwrap().to_string(), results.is_none()));
        })
        .await
        .unwrap();
    }
    drop(db);

    let got = outcome.lock().unwrap().clone().unwrap();
    assert_eq!(got.0, "Premature connection close");
    assert!(got.1);
}

#[tokio::test]
async fn async_server_errors_go_to_the_continuation() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();

    let outcome = Arc::new(Mutex::new(None::<(bool, Option<String>)>));
    {
        let outcome = Arc::clone(&outcome);
        db.query_async("SELECT 1/0", &[], move |err, results| {
            let results = results.unwrap();
            *outcome.lock().unwrap() =
                Some((err.is_some(), results.error().map(String::from)));
        })
        .await
        .unwrap();
    }
    db.drive().await.unwrap();

    let (had_error, message) = outcome.lock().unwrap().clone().unwrap();
    assert!(had_error);
    assert!(message.unwrap().contains("division by zero"));
}
