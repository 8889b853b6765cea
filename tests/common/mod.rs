//! Shared fixtures for the SQLite-backed integration tests.

#![allow(dead_code)]

use maildb::{ConnectionPool, Executor, PoolConfig};
use tempfile::TempDir;

/// Schema used by most tests: a cut-down message index.
pub const SCHEMA: &str = "
    CREATE TABLE messages (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        mailbox TEXT NOT NULL,
        subject TEXT,
        size INTEGER,
        seen BOOLEAN,
        body BLOB,
        score REAL
    );
    CREATE TABLE mailboxes (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
";

/// A pool over a throwaway SQLite file. Keep `dir` alive as long as `pool`.
pub struct TestDb {
    pub dir: TempDir,
    pub pool: ConnectionPool,
    pub executor: Executor,
}

impl Drop for TestDb {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// SQLite config with an acquire budget of `max_attempts` milliseconds.
pub fn sqlite_config(dir: &TempDir, pool_size: usize, max_attempts: u32) -> PoolConfig {
    let path = dir.path().join("mail.db");
    let mut config = PoolConfig::sqlite(path.to_string_lossy(), pool_size);
    config.retry_interval_us = 1_000;
    config.max_attempts = max_attempts;
    config
}

/// Open a pool of `pool_size` slots with a short (50ms) acquire budget.
pub fn sqlite_db(pool_size: usize) -> TestDb {
    sqlite_db_with_budget(pool_size, 50)
}

pub fn sqlite_db_with_budget(pool_size: usize, max_attempts: u32) -> TestDb {
    let dir = tempfile::tempdir().expect("create temp dir");
    let pool = ConnectionPool::init(sqlite_config(&dir, pool_size, max_attempts))
        .expect("open sqlite pool");
    let executor = Executor::new(pool.clone());
    TestDb {
        dir,
        pool,
        executor,
    }
}

/// Open a pool and create the test schema.
pub fn mail_db(pool_size: usize) -> TestDb {
    mail_db_with_budget(pool_size, 50)
}

pub fn mail_db_with_budget(pool_size: usize, max_attempts: u32) -> TestDb {
    let db = sqlite_db_with_budget(pool_size, max_attempts);
    db.executor.exec_sql(SCHEMA).expect("create schema");
    db
}

/// Insert a message through raw SQL and return its uid.
pub fn insert_message(db: &TestDb, mailbox: &str, subject: &str) -> u64 {
    let sql = format!(
        "INSERT INTO messages (mailbox, subject, size, seen) VALUES ('{}', '{}', {}, 0)",
        db.executor.escape(mailbox),
        db.executor.escape(subject),
        subject.len()
    );
    db.executor.exec_insert_sql(&sql).expect("insert message")
}

pub fn count_messages(db: &TestDb) -> u64 {
    db.executor
        .exec_rows_sql("SELECT uid FROM messages")
        .expect("count messages")
}
