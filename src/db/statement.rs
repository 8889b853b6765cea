//! Prepared statement groups.
//!
//! A `StatementGroup` is one query text prepared once per pool slot. Handle
//! `i` belongs to slot `i`'s connection and is only used by whoever holds
//! slot `i`. Groups never acquire or release slots on their own, except
//! while preparing, when each slot is taken in turn so no holder is disturbed.

use crate::db::driver::{ExecMode, ExecOutcome, PreparedStatement};
use crate::db::pool::{ConnectionPool, SlotId};
use crate::db::result::Column;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) struct GroupInner {
    pool_id: Uuid,
    sql: String,
    param_count: Option<usize>,
    columns: Vec<Column>,
    handles: Vec<RwLock<Option<PreparedStatement>>>,
}

impl GroupInner {
    pub(crate) fn sql(&self) -> &str {
        &self.sql
    }

    /// Prepare the query again on `slot`'s current connection.
    pub(crate) fn prepare_slot(&self, pool: &ConnectionPool, slot: SlotId) -> DbResult<()> {
        let handle = self
            .handles
            .get(slot)
            .ok_or_else(|| DbError::slot(slot, "no statement handle for this slot"))?;
        pool.with_connection(slot, |driver, conn| {
            let stmt = driver.prepare(conn, &self.sql)?;
            *handle.write() = Some(stmt);
            Ok(())
        })?;
        debug!(pool_id = %self.pool_id, slot, sql = %self.sql, "Re-prepared statement");
        Ok(())
    }
}

/// One query text prepared on every slot of a pool.
///
/// Cloning is cheap; clones share the same handles.
#[derive(Clone)]
pub struct StatementGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for StatementGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementGroup")
            .field("pool_id", &self.inner.pool_id)
            .field("sql", &self.inner.sql)
            .field("param_count", &self.inner.param_count)
            .field("slots", &self.inner.handles.len())
            .finish()
    }
}

impl StatementGroup {
    /// Prepare `sql` on every slot of `pool`. All-or-nothing.
    pub fn prepare(pool: &ConnectionPool, sql: impl Into<String>) -> DbResult<Self> {
        let sql = sql.into();
        let start = Instant::now();
        let mut handles = Vec::with_capacity(pool.size());

        for slot in 0..pool.size() {
            let guard = pool.acquire_slot_guard(slot)?;
            let prepared = guard.with_connection(|driver, conn| driver.prepare(conn, &sql));
            guard.release()?;
            handles.push(prepared?);
        }

        let first = handles
            .first()
            .ok_or_else(|| DbError::internal("pool has no slots"))?;
        let param_count = first.param_count();
        let columns = first.columns();

        let inner = Arc::new(GroupInner {
            pool_id: pool.id(),
            sql,
            param_count,
            columns,
            handles: handles.into_iter().map(|h| RwLock::new(Some(h))).collect(),
        });
        pool.register_group(&inner);

        info!(
            pool_id = %inner.pool_id,
            sql = %inner.sql,
            slots = inner.handles.len(),
            params = ?inner.param_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prepared statement group"
        );
        Ok(Self { inner })
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Number of placeholders, if the backend reported it.
    pub fn param_count(&self) -> Option<usize> {
        self.inner.param_count
    }

    pub fn columns(&self) -> &[Column] {
        &self.inner.columns
    }

    pub fn pool_id(&self) -> Uuid {
        self.inner.pool_id
    }

    fn check_pool(&self, pool: &ConnectionPool) -> DbResult<()> {
        if pool.id() != self.inner.pool_id {
            return Err(DbError::internal(format!(
                "statement group of pool {} used with pool {}",
                self.inner.pool_id,
                pool.id()
            )));
        }
        Ok(())
    }

    /// Bind `params` and execute on `slot`, which the caller must hold.
    pub fn execute(
        &self,
        pool: &ConnectionPool,
        slot: SlotId,
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        self.check_pool(pool)?;
        match self.inner.param_count {
            Some(expected) if params.len() != expected => {
                return Err(DbError::driver(
                    format!(
                        "statement expects {} parameters, got {}",
                        expected,
                        params.len()
                    ),
                    None,
                ));
            }
            _ => {}
        }

        let start = Instant::now();
        debug!(
            pool_id = %self.inner.pool_id,
            slot,
            sql = %self.inner.sql,
            mode = %mode,
            params = ?params.iter().map(QueryParam::type_name).collect::<Vec<_>>(),
            "Executing prepared statement"
        );

        let handle = self
            .inner
            .handles
            .get(slot)
            .ok_or_else(|| DbError::slot(slot, "no statement handle for this slot"))?;
        let outcome = pool.with_connection(slot, |driver, conn| {
            let stmt = handle.read();
            let stmt = stmt
                .as_ref()
                .ok_or_else(|| DbError::slot(slot, "statement handle missing"))?;
            driver.execute(conn, stmt, &self.inner.columns, params, mode)
        });

        match &outcome {
            Ok(_) => debug!(
                slot,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Prepared statement finished"
            ),
            Err(e) => debug!(slot, error = %e, "Prepared statement failed"),
        }
        outcome
    }

    /// Prepare this group's query again on `slot`, which the caller must hold.
    pub fn rebuild(&self, pool: &ConnectionPool, slot: SlotId) -> DbResult<()> {
        self.check_pool(pool)?;
        self.inner.prepare_slot(pool, slot)
    }
}
