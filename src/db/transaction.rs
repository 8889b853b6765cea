//! Transaction guard.
//!
//! A `Transaction` holds one slot from `begin` until it is committed, rolled
//! back or dropped. Every statement run through it uses that slot's
//! connection. `commit` and `rollback` consume the guard, so a finished
//! transaction cannot be used again; dropping an open one rolls it back.

use crate::db::driver::{ExecMode, ExecOutcome};
use crate::db::pool::{ConnectionPool, SlotGuard, SlotId};
use crate::db::statement::StatementGroup;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An open transaction bound to one pool slot.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    started: Instant,
    /// `None` once committed or rolled back.
    guard: Option<SlotGuard>,
    slot: SlotId,
    pool: ConnectionPool,
}

impl Transaction {
    /// Acquire a slot and issue BEGIN. On failure no slot is held.
    pub fn begin(pool: &ConnectionPool) -> DbResult<Self> {
        let guard = pool.acquire_guard()?;
        let slot = guard.slot();
        let id = format!("tx_{}", Uuid::new_v4());

        if let Err(e) = guard.with_connection(|driver, conn| {
            driver.execute_text(conn, "BEGIN", ExecMode::Status)
        }) {
            warn!(transaction_id = %id, slot, error = %e, "Failed to begin transaction");
            if e.is_connection_lost() {
                rebuild_quietly(&guard, &id);
            }
            return Err(e);
        }

        info!(
            transaction_id = %id,
            pool_id = %pool.id(),
            slot,
            "Transaction started"
        );

        Ok(Self {
            id,
            started: Instant::now(),
            guard: Some(guard),
            slot,
            pool: pool.clone(),
        })
    }

    /// Identifier used in logs (`tx_<uuid>`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn guard(&self) -> DbResult<&SlotGuard> {
        self.guard
            .as_ref()
            .ok_or_else(|| DbError::internal(format!("transaction {} already finished", self.id)))
    }

    /// Execute a prepared statement on the transaction's slot.
    pub fn exec_in(
        &self,
        group: &StatementGroup,
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let guard = self.guard()?;
        debug!(transaction_id = %self.id, slot = self.slot, mode = %mode, "Executing in transaction");
        group.execute(guard.pool(), guard.slot(), params, mode)
    }

    /// Execute raw SQL text on the transaction's slot.
    pub fn exec_text_in(&self, sql: &str, mode: ExecMode) -> DbResult<ExecOutcome> {
        let guard = self.guard()?;
        debug!(transaction_id = %self.id, slot = self.slot, mode = %mode, "Executing raw SQL in transaction");
        guard.with_connection(|driver, conn| driver.execute_text(conn, sql, mode))
    }

    /// Issue COMMIT, then release the slot whatever the outcome.
    ///
    /// Returns COMMIT's own result; a release failure is only reported when
    /// COMMIT succeeded.
    pub fn commit(mut self) -> DbResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };

        let committed = guard
            .with_connection(|driver, conn| driver.execute_text(conn, "COMMIT", ExecMode::Status))
            .map(|_| ());

        match &committed {
            Ok(()) => info!(
                transaction_id = %self.id,
                slot = self.slot,
                duration_ms = self.started.elapsed().as_millis() as u64,
                "Transaction committed"
            ),
            Err(e) => {
                warn!(transaction_id = %self.id, slot = self.slot, error = %e, "Commit failed");
                if e.is_connection_lost() {
                    rebuild_quietly(&guard, &self.id);
                }
            }
        }

        let released = guard.release();
        committed?;
        released
    }

    /// Issue ROLLBACK best-effort, then release the slot.
    ///
    /// Rollback errors are logged, not returned. If the connection is gone,
    /// the slot is rebuilt before it is released.
    pub fn rollback(mut self) {
        self.finish_rollback("Transaction rolled back");
    }

    fn finish_rollback(&mut self, message: &'static str) {
        let Some(guard) = self.guard.take() else {
            return;
        };

        match guard.with_connection(|driver, conn| {
            driver.execute_text(conn, "ROLLBACK", ExecMode::Status)
        }) {
            Ok(_) => info!(
                transaction_id = %self.id,
                slot = self.slot,
                duration_ms = self.started.elapsed().as_millis() as u64,
                "{}",
                message
            ),
            Err(e) => {
                warn!(transaction_id = %self.id, slot = self.slot, error = %e, "Rollback failed");
                if e.is_connection_lost() {
                    rebuild_quietly(&guard, &self.id);
                }
            }
        }

        if let Err(e) = guard.release() {
            warn!(transaction_id = %self.id, slot = self.slot, error = %e, "Failed to release transaction slot");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(
                transaction_id = %self.id,
                slot = self.slot,
                "Transaction dropped while open, rolling back"
            );
            self.finish_rollback("Dropped transaction rolled back");
        }
    }
}

fn rebuild_quietly(guard: &SlotGuard, transaction_id: &str) {
    if let Err(e) = guard.rebuild() {
        warn!(
            transaction_id = %transaction_id,
            slot = guard.slot(),
            error = %e,
            "Failed to rebuild slot after lost connection"
        );
    }
}
