//! Integration tests for transactions.

mod common;

use common::{count_messages, insert_message, mail_db, sqlite_db_with_budget};
use maildb::db::ExecMode;
use maildb::{DbError, QueryParam, Transaction};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn test_commit_persists_and_releases() {
    let db = mail_db(2);
    let insert = db
        .executor
        .prepare("INSERT INTO messages (mailbox, subject) VALUES (?, ?)")
        .unwrap();
    let busy_before = db.pool.stats().busy;

    let tx = db.executor.begin().unwrap();
    assert!(tx.id().starts_with("tx_"));
    assert_eq!(db.pool.stats().busy, busy_before + 1);

    for subject in ["one", "two", "three"] {
        let uid = db
            .executor
            .exec_insert_tran(&insert, &[QueryParam::from("INBOX"), QueryParam::from(subject)], &tx)
            .unwrap();
        assert!(uid > 0);
    }
    tx.commit().unwrap();

    assert_eq!(db.pool.stats().busy, busy_before);
    assert_eq!(count_messages(&db), 3);
}

#[test]
fn test_rollback_discards_and_releases() {
    let db = mail_db(2);
    insert_message(&db, "INBOX", "kept");
    let busy_before = db.pool.stats().busy;

    let tx = db.executor.begin().unwrap();
    db.executor
        .exec_sql_tran("INSERT INTO messages (mailbox, subject) VALUES ('INBOX', 'gone')", &tx)
        .unwrap();
    let changed = db
        .executor
        .exec_write_sql_tran("UPDATE messages SET seen = 1", &tx)
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(
        db.executor
            .exec_rows_sql_tran("SELECT uid FROM messages", &tx)
            .unwrap(),
        2
    );
    tx.rollback();

    assert_eq!(db.pool.stats().busy, busy_before);
    assert_eq!(count_messages(&db), 1);
    let table = db
        .executor
        .exec_result_sql("SELECT seen FROM messages")
        .unwrap();
    assert_eq!(table.get_row(0).unwrap().get_bool(0).unwrap(), Some(false));
}

#[test]
fn test_drop_rolls_back() {
    let db = mail_db(1);
    {
        let tx = Transaction::begin(&db.pool).unwrap();
        tx.exec_text_in(
            "INSERT INTO messages (mailbox, subject) VALUES ('INBOX', 'dropped')",
            ExecMode::Status,
        )
        .unwrap();
        assert_eq!(db.pool.stats().busy, 1);
    }
    assert_eq!(db.pool.stats().busy, 0);
    assert_eq!(count_messages(&db), 0);
}

#[test]
fn test_transaction_sees_own_writes() {
    let db = mail_db(2);
    let select = db
        .executor
        .prepare("SELECT subject FROM messages WHERE mailbox = ?")
        .unwrap();

    let tx = db.executor.begin().unwrap();
    db.executor
        .exec_sql_tran("INSERT INTO messages (mailbox, subject) VALUES ('Drafts', 'wip')", &tx)
        .unwrap();
    let table = db
        .executor
        .exec_result_tran(&select, &[QueryParam::from("Drafts")], &tx)
        .unwrap();
    assert_eq!(table.get_row(0).unwrap().get_str(0).unwrap(), Some("wip"));
    tx.commit().unwrap();
}

#[test]
fn test_failed_statement_keeps_transaction_usable() {
    let db = mail_db(1);
    let tx = db.executor.begin().unwrap();
    let err = db
        .executor
        .exec_sql_tran("INSERT INTO no_such_table VALUES (1)", &tx)
        .unwrap_err();
    assert!(matches!(err, DbError::Driver { .. }));

    insert_message_in(&db.executor, &tx);
    tx.commit().unwrap();
    assert_eq!(count_messages(&db), 1);
    assert_eq!(db.pool.stats().busy, 0);
}

fn insert_message_in(executor: &maildb::Executor, tx: &Transaction) {
    executor
        .exec_sql_tran("INSERT INTO messages (mailbox) VALUES ('INBOX')", tx)
        .unwrap();
}

#[test]
fn test_commit_failure_still_releases() {
    let db = mail_db(1);
    let tx = db.executor.begin().unwrap();
    // Ending the transaction early makes COMMIT fail
    db.executor.exec_sql_tran("ROLLBACK", &tx).unwrap();
    assert!(tx.commit().is_err());
    assert_eq!(db.pool.stats().busy, 0);
}

#[test]
fn test_begin_fails_when_pool_exhausted() {
    let db = mail_db(1);
    let tx = db.executor.begin().unwrap();
    assert!(matches!(
        db.executor.begin(),
        Err(DbError::AcquireTimeout { .. })
    ));
    tx.rollback();
    assert_eq!(db.pool.stats().busy, 0);
}

/// Pool of two, both slots held by transactions: an ad-hoc call blocks until
/// one of them commits, then takes the freed slot.
#[test]
fn test_adhoc_call_waits_for_transaction_slot() {
    let db = sqlite_db_with_budget(2, 5_000);
    db.executor
        .exec_sql("CREATE TABLE mailboxes (id INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();

    let tx_a = db.executor.begin().unwrap();
    let tx_b = db.executor.begin().unwrap();
    assert_ne!(tx_a.slot(), tx_b.slot());
    let slot_a = tx_a.slot();

    let (sender, receiver) = mpsc::channel();
    let executor = db.executor.clone();
    let waiter = thread::spawn(move || {
        let rows = executor.exec_rows_sql("SELECT id FROM mailboxes");
        sender.send(rows).unwrap();
    });

    // The call itself is still blocked while both transactions are open
    assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(db.pool.stats().busy, 2);

    tx_a.commit().unwrap();
    let rows = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rows.unwrap(), 0);
    waiter.join().unwrap();

    // The ad-hoc call handed its slot back; only tx_b still holds one
    assert_eq!(db.pool.stats().busy, 1);
    let guard = db.pool.acquire_guard().unwrap();
    assert_eq!(guard.slot(), slot_a);
    guard.release().unwrap();

    tx_b.rollback();
    assert_eq!(db.pool.stats().busy, 0);
}
