mod common;

use std::time::Duration;

use pg_middleware::{IsolationLevel, PgValue, TxState};

async fn count(db: &mut pg_middleware::Session, table: &str) -> i64 {
    let mut results = db
        .query(&format!("SELECT count(*)::bigint FROM {table}"), &[])
        .await
        .unwrap();
    results.array().unwrap().unwrap()[0].as_int().unwrap()
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();
    db.query("CREATE TEMPORARY TABLE tx_drop_probe (id BIGINT)", &[])
        .await
        .unwrap();

    {
        let tx = db.begin(None).await.unwrap();
        assert_eq!(tx.state(), TxState::Open);
        db.query("INSERT INTO tx_drop_probe (id) VALUES (?)", &[PgValue::Int(1)])
            .await
            .unwrap();
        assert_eq!(count(&mut db, "tx_drop_probe").await, 1);
        // tx dropped here without commit
    }
    // the rollback is issued from the drop hook; give it a beat
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count(&mut db, "tx_drop_probe").await, 0);
}

#[tokio::test]
async fn committed_transaction_persists() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();
    db.query("CREATE TEMPORARY TABLE tx_commit_probe (id BIGINT)", &[])
        .await
        .unwrap();

    let tx = db.begin(Some(IsolationLevel::Serializable)).await.unwrap();
    db.query(
        "INSERT INTO tx_commit_probe (id) VALUES (?)",
        &[PgValue::Int(7)],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count(&mut db, "tx_commit_probe").await, 1);
}

#[tokio::test]
async fn failed_statement_then_drop_rolls_back() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();
    db.query("CREATE TEMPORARY TABLE tx_fail_probe (id BIGINT)", &[])
        .await
        .unwrap();

    {
        let tx = db.begin(None).await.unwrap();
        db.query("INSERT INTO tx_fail_probe (id) VALUES (?)", &[PgValue::Int(1)])
            .await
            .unwrap();
        let err = db.query("SELECT no_such_column FROM tx_fail_probe", &[]).await;
        assert!(err.is_err());
        drop(tx);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count(&mut db, "tx_fail_probe").await, 0);
}

#[tokio::test]
async fn explicit_rollback_discards_changes() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();
    db.query("CREATE TEMPORARY TABLE tx_rollback_probe (id BIGINT)", &[])
        .await
        .unwrap();

    let tx = db.begin(None).await.unwrap();
    db.query(
        "INSERT INTO tx_rollback_probe (id) VALUES (?)",
        &[PgValue::Int(1)],
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(count(&mut db, "tx_rollback_probe").await, 0);
}

#[tokio::test]
async fn savepoints_scope_partial_rollback() {
    let Some(manager) = common::manager() else {
        return;
    };
    let mut db = manager.session().await.unwrap();
    db.query("CREATE TEMPORARY TABLE tx_sp_probe (id BIGINT)", &[])
        .await
        .unwrap();

    let mut tx = db.begin(None).await.unwrap();
    db.query("INSERT INTO tx_sp_probe (id) VALUES (?)", &[PgValue::Int(1)])
        .await
        .unwrap();
    tx.savepoint("sp1").await.unwrap();
    db.query("INSERT INTO tx_sp_probe (id) VALUES (?)", &[PgValue::Int(2)])
        .await
        .unwrap();
    tx.rollback_to("sp1").await.unwrap();
    tx.release("sp1").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(count(&mut db, "tx_sp_probe").await, 1);
}
