//! Statement execution surface.
//!
//! This module provides the call families used by the rest of the mail
//! server. Each family comes in four shapes:
//! - `f(group, params)`: prepared, ad-hoc (acquires and releases a slot)
//! - `f_tran(group, params, tx)`: prepared, on a transaction's slot
//! - `f_sql(sql)`: raw text, ad-hoc
//! - `f_sql_tran(sql, tx)`: raw text, on a transaction's slot
//!
//! Raw text is never bound; values interpolated into it must go through
//! `escape` first.
//!
//! An ad-hoc call releases its slot exactly once on every path. A failed
//! call is never retried; if it failed because the connection is gone, the
//! slot is rebuilt before release so the next caller gets a live connection.

use crate::db::driver::{ExecMode, ExecOutcome};
use crate::db::pool::{ConnectionPool, SlotGuard};
use crate::db::result::ResultTable;
use crate::db::statement::StatementGroup;
use crate::db::transaction::Transaction;
use crate::error::DbResult;
use crate::models::QueryParam;
use std::time::Instant;
use tracing::{debug, warn};

/// Generate the four shapes of one execution family.
macro_rules! exec_family {
    (
        $(#[$doc:meta])*
        $mode:path => $out:ty, $convert:ident;
        $plain:ident, $tran:ident, $sql:ident, $sql_tran:ident
    ) => {
        $(#[$doc])*
        pub fn $plain(&self, group: &StatementGroup, params: &[QueryParam]) -> DbResult<$out> {
            self.run_prepared(group, params, $mode)?.$convert()
        }

        $(#[$doc])*
        ///
        /// Runs on the transaction's slot.
        pub fn $tran(
            &self,
            group: &StatementGroup,
            params: &[QueryParam],
            tx: &Transaction,
        ) -> DbResult<$out> {
            tx.exec_in(group, params, $mode)?.$convert()
        }

        $(#[$doc])*
        ///
        /// Runs unprepared SQL text on an ad-hoc slot.
        pub fn $sql(&self, sql: &str) -> DbResult<$out> {
            self.run_text(sql, $mode)?.$convert()
        }

        $(#[$doc])*
        ///
        /// Runs unprepared SQL text on the transaction's slot.
        pub fn $sql_tran(&self, sql: &str, tx: &Transaction) -> DbResult<$out> {
            tx.exec_text_in(sql, $mode)?.$convert()
        }
    };
}

/// Executes statements against a pool.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: ConnectionPool,
}

impl Executor {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Prepare `sql` on every slot of the pool.
    pub fn prepare(&self, sql: impl Into<String>) -> DbResult<StatementGroup> {
        StatementGroup::prepare(&self.pool, sql)
    }

    /// Start a transaction on a freshly acquired slot.
    pub fn begin(&self) -> DbResult<Transaction> {
        Transaction::begin(&self.pool)
    }

    /// Escape text for a single-quoted literal in raw SQL.
    pub fn escape(&self, text: &str) -> String {
        self.pool.escape(text)
    }

    fn run_prepared(
        &self,
        group: &StatementGroup,
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let guard = self.pool.acquire_guard()?;
        let result = group.execute(&self.pool, guard.slot(), params, mode);
        finish(guard, result)
    }

    fn run_text(&self, sql: &str, mode: ExecMode) -> DbResult<ExecOutcome> {
        let start = Instant::now();
        let guard = self.pool.acquire_guard()?;
        let result = guard.with_connection(|driver, conn| driver.execute_text(conn, sql, mode));
        if result.is_ok() {
            debug!(
                slot = guard.slot(),
                mode = %mode,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Raw SQL finished"
            );
        }
        finish(guard, result)
    }

    exec_family! {
        /// Execute for status only.
        ExecMode::Status => (), into_done;
        exec, exec_tran, exec_sql, exec_sql_tran
    }

    exec_family! {
        /// Execute and return the number of rows the statement returned.
        ExecMode::Rows => u64, into_row_count;
        exec_rows, exec_rows_tran, exec_rows_sql, exec_rows_sql_tran
    }

    exec_family! {
        /// Execute and return the generated identifier (0 if none).
        ExecMode::Insert => u64, into_insert_id;
        exec_insert, exec_insert_tran, exec_insert_sql, exec_insert_sql_tran
    }

    exec_family! {
        /// Execute and return the full result as an owned table.
        ExecMode::Result => ResultTable, into_table;
        exec_result, exec_result_tran, exec_result_sql, exec_result_sql_tran
    }

    exec_family! {
        /// Execute and return the number of rows changed.
        ExecMode::Write => u64, into_affected;
        exec_write, exec_write_tran, exec_write_sql, exec_write_sql_tran
    }
}

/// Release an ad-hoc slot, rebuilding it first if its connection is gone.
fn finish<T>(guard: SlotGuard, result: DbResult<T>) -> DbResult<T> {
    if let Err(e) = &result {
        if e.is_connection_lost() {
            warn!(slot = guard.slot(), error = %e, "Connection lost, rebuilding slot");
            if let Err(rebuild_err) = guard.rebuild() {
                warn!(slot = guard.slot(), error = %rebuild_err, "Slot rebuild failed");
            }
        } else {
            debug!(slot = guard.slot(), error = %e, "Statement failed");
        }
    }
    let released = guard.release();
    let value = result?;
    released?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::models::QueryParam;

    fn sqlite_executor(size: usize) -> (tempfile::TempDir, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.db");
        let pool = ConnectionPool::init(PoolConfig::sqlite(path.to_string_lossy(), size)).unwrap();
        (dir, Executor::new(pool))
    }

    #[test]
    fn test_every_family_and_shape() {
        let (_dir, executor) = sqlite_executor(2);
        executor
            .exec_sql("CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let insert = executor
            .prepare("INSERT INTO folders (name) VALUES (?)")
            .unwrap();
        let select = executor.prepare("SELECT id, name FROM folders").unwrap();
        let rename = executor.prepare("UPDATE folders SET name = ?").unwrap();

        executor.exec(&insert, &[QueryParam::from("a")]).unwrap();
        assert_eq!(executor.exec_insert(&insert, &[QueryParam::from("b")]).unwrap(), 2);
        assert_eq!(executor.exec_rows(&select, &[]).unwrap(), 2);
        assert_eq!(executor.exec_result(&select, &[]).unwrap().row_count(), 2);
        assert_eq!(executor.exec_write(&rename, &[QueryParam::from("c")]).unwrap(), 2);

        let tx = executor.begin().unwrap();
        executor.exec_tran(&insert, &[QueryParam::from("d")], &tx).unwrap();
        assert_eq!(
            executor
                .exec_insert_tran(&insert, &[QueryParam::from("e")], &tx)
                .unwrap(),
            4
        );
        assert_eq!(executor.exec_rows_tran(&select, &[], &tx).unwrap(), 4);
        assert_eq!(executor.exec_result_tran(&select, &[], &tx).unwrap().row_count(), 4);
        assert_eq!(
            executor
                .exec_write_tran(&rename, &[QueryParam::from("f")], &tx)
                .unwrap(),
            4
        );
        executor
            .exec_sql_tran("INSERT INTO folders (name) VALUES ('g')", &tx)
            .unwrap();
        assert_eq!(
            executor
                .exec_insert_sql_tran("INSERT INTO folders (name) VALUES ('h')", &tx)
                .unwrap(),
            6
        );
        assert_eq!(executor.exec_rows_sql_tran("SELECT id FROM folders", &tx).unwrap(), 6);
        assert_eq!(
            executor
                .exec_result_sql_tran("SELECT id FROM folders", &tx)
                .unwrap()
                .row_count(),
            6
        );
        assert_eq!(
            executor
                .exec_write_sql_tran("DELETE FROM folders WHERE id > 4", &tx)
                .unwrap(),
            2
        );
        tx.commit().unwrap();

        assert_eq!(
            executor
                .exec_insert_sql("INSERT INTO folders (name) VALUES ('i')")
                .unwrap(),
            5
        );
        assert_eq!(executor.exec_write_sql("DELETE FROM folders").unwrap(), 5);
        assert_eq!(executor.pool().stats().busy, 0);
    }

    #[test]
    fn test_lost_connection_rebuilds_slot() {
        let (_dir, executor) = sqlite_executor(1);
        executor
            .exec_sql("CREATE TEMP TABLE marker (x INTEGER)")
            .unwrap();

        executor.pool().driver().faults.lose_next_call();
        let err = executor.exec_rows_sql("SELECT x FROM marker").unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(executor.pool().stats().busy, 0);
        assert_eq!(executor.pool().open_connections(), 1);

        // The slot holds a fresh connection, without the old temp table
        assert!(executor.exec_rows_sql("SELECT x FROM marker").is_err());
        assert_eq!(executor.exec_rows_sql("SELECT 1").unwrap(), 1);
    }

    #[test]
    fn test_lost_connection_reprepares_groups() {
        let (_dir, executor) = sqlite_executor(1);
        executor
            .exec_sql("CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let select = executor.prepare("SELECT id FROM folders").unwrap();

        executor.pool().driver().faults.lose_next_call();
        assert!(executor.exec_rows(&select, &[]).unwrap_err().is_connection_lost());
        assert_eq!(executor.exec_rows(&select, &[]).unwrap(), 0);
    }
}
