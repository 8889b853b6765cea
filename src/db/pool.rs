//! Bounded connection pool.
//!
//! The pool owns a fixed number of slots, each holding one live backend
//! connection. A slot is either Free or Busy; `acquire` marks a Free slot Busy
//! and hands its index to exactly one caller, `release` marks it Free again
//! and wakes waiters. When every slot is Busy, `acquire` waits on a condition
//! variable until a slot is released or the configured budget
//! (`max_attempts × retry_interval`) runs out. Waiters are not served in
//! arrival order.
//!
//! Slot states live under one mutex. Each slot's connection sits behind its
//! own mutex, locked by the slot holder for the duration of one driver call.

use crate::config::{Backend, PoolConfig};
use crate::db::driver::{Connection, Driver};
use crate::db::statement::GroupInner;
use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Index of a pool slot, in `0..pool.size()`.
pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Busy,
}

/// Point-in-time slot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    pub free: usize,
}

#[derive(Debug)]
struct SlotTable {
    states: Vec<SlotState>,
    closed: bool,
}

impl SlotTable {
    fn check_held(&self, slot: SlotId) -> DbResult<()> {
        match self.states.get(slot) {
            None => Err(DbError::slot(
                slot,
                format!("out of range (pool size {})", self.states.len()),
            )),
            Some(SlotState::Free) => Err(DbError::slot(slot, "not held by the caller")),
            Some(SlotState::Busy) => Ok(()),
        }
    }
}

struct PoolInner {
    id: Uuid,
    config: PoolConfig,
    table: Mutex<SlotTable>,
    available: Condvar,
    connections: Vec<Mutex<Option<Connection>>>,
    groups: Mutex<Vec<Weak<GroupInner>>>,
    // Dropped last: connections need the runtime.
    driver: Driver,
}

/// Handle to a connection pool. Clones share the same slots.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("driver", &self.inner.driver)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Validate the configuration and open every slot's connection.
    ///
    /// All-or-nothing: if any connection fails, the ones already opened are
    /// closed and the error is returned.
    pub fn init(config: PoolConfig) -> DbResult<Self> {
        config.validate()?;
        let driver = Driver::new(&config)?;
        let id = Uuid::new_v4();

        info!(
            pool_id = %id,
            backend = %config.backend,
            target = %driver.display_target(),
            pool_size = config.pool_size,
            "Opening connection pool"
        );

        let opened = connect_all(&driver, id, config.pool_size)?;
        let connections = opened.into_iter().map(|c| Mutex::new(Some(c))).collect();
        let table = SlotTable {
            states: vec![SlotState::Free; config.pool_size],
            closed: false,
        };

        info!(pool_id = %id, pool_size = config.pool_size, "Connection pool ready");

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                config,
                table: Mutex::new(table),
                available: Condvar::new(),
                connections,
                groups: Mutex::new(Vec::new()),
                driver,
            }),
        })
    }

    /// Unique id of this pool, used to tie statement groups to it.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn size(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn backend(&self) -> Backend {
        self.inner.driver.backend()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Backend connections currently open for this pool's slots.
    pub fn open_connections(&self) -> usize {
        self.inner.driver.live_connections()
    }

    #[cfg(test)]
    pub(crate) fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    pub fn is_closed(&self) -> bool {
        self.inner.table.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let table = self.inner.table.lock();
        let busy = table
            .states
            .iter()
            .filter(|s| **s == SlotState::Busy)
            .count();
        PoolStats {
            size: table.states.len(),
            busy,
            free: table.states.len() - busy,
        }
    }

    /// Mark a Free slot Busy and return its index.
    pub fn acquire(&self) -> DbResult<SlotId> {
        self.wait_for(None)
    }

    /// Mark slot `slot` Busy, waiting for it if another caller holds it.
    pub(crate) fn acquire_slot(&self, slot: SlotId) -> DbResult<SlotId> {
        if slot >= self.size() {
            return Err(DbError::slot(
                slot,
                format!("out of range (pool size {})", self.size()),
            ));
        }
        self.wait_for(Some(slot))
    }

    fn wait_for(&self, wanted: Option<SlotId>) -> DbResult<SlotId> {
        let inner = &self.inner;
        let started = Instant::now();
        // A budget too large to represent means waiting without a deadline.
        let deadline = started.checked_add(inner.config.acquire_budget());

        let mut table = inner.table.lock();
        loop {
            if table.closed {
                return Err(DbError::PoolClosed);
            }

            let found = match wanted {
                Some(slot) => (table.states[slot] == SlotState::Free).then_some(slot),
                None => table.states.iter().position(|s| *s == SlotState::Free),
            };
            if let Some(slot) = found {
                table.states[slot] = SlotState::Busy;
                debug!(pool_id = %inner.id, slot, "Acquired slot");
                return Ok(slot);
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(
                        pool_id = %inner.id,
                        attempts = inner.config.max_attempts,
                        waited_ms,
                        "Timed out waiting for a free slot"
                    );
                    return Err(DbError::acquire_timeout(inner.config.max_attempts, waited_ms));
                }
                Some(deadline) => {
                    inner.available.wait_until(&mut table, deadline);
                }
                None => inner.available.wait(&mut table),
            }
        }
    }

    /// Acquire a slot wrapped in a guard that releases it on drop.
    pub fn acquire_guard(&self) -> DbResult<SlotGuard> {
        let slot = self.acquire()?;
        Ok(SlotGuard::new(self.clone(), slot))
    }

    pub(crate) fn acquire_slot_guard(&self, slot: SlotId) -> DbResult<SlotGuard> {
        let slot = self.acquire_slot(slot)?;
        Ok(SlotGuard::new(self.clone(), slot))
    }

    /// Mark a Busy slot Free and wake waiters.
    ///
    /// Releasing a slot that is not Busy, or an index outside the pool, is
    /// rejected. After `shutdown`, the released slot's connection is closed.
    pub fn release(&self, slot: SlotId) -> DbResult<()> {
        let closed = {
            let mut table = self.inner.table.lock();
            if let Err(e) = table.check_held(slot) {
                warn!(pool_id = %self.inner.id, slot, error = %e, "Rejected slot release");
                return Err(e);
            }
            table.states[slot] = SlotState::Free;
            table.closed
        };

        if closed {
            warn!(
                pool_id = %self.inner.id,
                slot,
                "Slot released after shutdown, closing its connection"
            );
            self.close_slot(slot);
        } else {
            // Waiters may want a specific slot, so wake all of them.
            self.inner.available.notify_all();
        }
        debug!(pool_id = %self.inner.id, slot, "Released slot");
        Ok(())
    }

    /// Run `f` on the connection of a slot the caller holds.
    pub fn with_connection<T>(
        &self,
        slot: SlotId,
        f: impl FnOnce(&Driver, &mut Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        self.inner.table.lock().check_held(slot)?;
        let mut guard = self.inner.connections[slot].lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| DbError::slot(slot, "has no open connection"))?;
        f(&self.inner.driver, conn)
    }

    /// Check that a held slot's connection is alive.
    pub fn ping(&self, slot: SlotId) -> DbResult<()> {
        self.with_connection(slot, |driver, conn| driver.ping(conn))
    }

    /// Replace a held slot's connection with a fresh one.
    ///
    /// The old connection stays in place if the fresh connect fails. After
    /// the swap, every live statement group is prepared again on the slot;
    /// the first re-prepare failure is returned after all groups were tried.
    pub fn rebuild(&self, slot: SlotId) -> DbResult<()> {
        let inner = &self.inner;
        inner.table.lock().check_held(slot)?;
        info!(pool_id = %inner.id, slot, "Rebuilding slot connection");

        let fresh = inner.driver.connect(Some(slot))?;
        let old = inner.connections[slot].lock().replace(fresh);
        if let Some(old) = old {
            inner.driver.close(old);
        }

        let mut first_error = None;
        for group in self.live_groups() {
            if let Err(e) = group.prepare_slot(self, slot) {
                warn!(
                    pool_id = %inner.id,
                    slot,
                    sql = %group.sql(),
                    error = %e,
                    "Failed to re-prepare statement after rebuild"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(pool_id = %inner.id, slot, "Slot rebuilt");
                Ok(())
            }
        }
    }

    /// Escape text for a single-quoted literal in raw SQL.
    pub fn escape(&self, text: &str) -> String {
        self.inner.driver.escape(text)
    }

    pub(crate) fn register_group(&self, group: &Arc<GroupInner>) {
        let mut groups = self.inner.groups.lock();
        groups.retain(|g| g.strong_count() > 0);
        groups.push(Arc::downgrade(group));
    }

    fn live_groups(&self) -> Vec<Arc<GroupInner>> {
        let mut groups = self.inner.groups.lock();
        groups.retain(|g| g.strong_count() > 0);
        groups.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live statement groups bound to this pool.
    pub fn group_count(&self) -> usize {
        self.live_groups().len()
    }

    /// Close the pool. Idempotent.
    ///
    /// New acquires fail with `PoolClosed`. Free slots are closed now; a slot
    /// still Busy is closed when its holder releases it.
    pub fn shutdown(&self) {
        let free: Vec<SlotId> = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            let busy = table
                .states
                .iter()
                .filter(|s| **s == SlotState::Busy)
                .count();
            if busy > 0 {
                warn!(
                    pool_id = %self.inner.id,
                    busy,
                    "Shutting down with busy slots, they close on release"
                );
            }
            table
                .states
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == SlotState::Free)
                .map(|(slot, _)| slot)
                .collect()
        };
        self.inner.available.notify_all();

        for slot in free {
            self.close_slot(slot);
        }
        info!(pool_id = %self.inner.id, "Connection pool shut down");
    }

    fn close_slot(&self, slot: SlotId) {
        let conn = self.inner.connections[slot].lock().take();
        if let Some(conn) = conn {
            self.inner.driver.close(conn);
            debug!(pool_id = %self.inner.id, slot, "Closed slot connection");
        }
    }
}

/// Open `size` connections, closing the ones already open if any fails.
fn connect_all(driver: &Driver, pool_id: Uuid, size: usize) -> DbResult<Vec<Connection>> {
    let mut opened = Vec::with_capacity(size);
    for slot in 0..size {
        match driver.connect(Some(slot)) {
            Ok(conn) => opened.push(conn),
            Err(e) => {
                warn!(
                    pool_id = %pool_id,
                    slot,
                    opened = opened.len(),
                    error = %e,
                    "Pool initialization failed, closing opened connections"
                );
                for conn in opened {
                    driver.close(conn);
                }
                return Err(e);
            }
        }
    }
    Ok(opened)
}

/// RAII guard for one acquired slot.
///
/// Releases the slot when dropped. Prefer `release()` where the release
/// error matters; `Drop` can only log it.
pub struct SlotGuard {
    pool: ConnectionPool,
    slot: SlotId,
    released: bool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("pool_id", &self.pool.id())
            .field("slot", &self.slot)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    fn new(pool: ConnectionPool, slot: SlotId) -> Self {
        Self {
            pool,
            slot,
            released: false,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `f` on the guarded slot's connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Driver, &mut Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        self.pool.with_connection(self.slot, f)
    }

    /// Rebuild the guarded slot's connection.
    pub fn rebuild(&self) -> DbResult<()> {
        self.pool.rebuild(self.slot)
    }

    /// Explicitly release the slot.
    pub fn release(mut self) -> DbResult<()> {
        self.released = true;
        self.pool.release(self.slot)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.release(self.slot) {
            warn!(
                pool_id = %self.pool.id(),
                slot = self.slot,
                error = %e,
                "Failed to release slot from guard"
            );
        }
    }
}
