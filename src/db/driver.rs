//! Backend driver.
//!
//! `Driver` is the only part of the crate that talks to `sqlx`. It owns the
//! connect options of the configured backend and a private multi-thread tokio
//! runtime; every method blocks the calling thread on one driver future.
//!
//! The blocking surface must be called from ordinary threads. Async callers
//! go through `tokio::task::spawn_blocking`, since blocking on the driver
//! runtime from inside another runtime panics.
//!
//! # Architecture
//!
//! Backend-specific code lives in the `mysql` and `sqlite` submodules. The
//! code structure is intentionally parallel to make differences obvious.

use crate::config::{Backend, PoolConfig};
use crate::db::macros::{backend_dispatch, statement_dispatch};
use crate::db::result::{Column, ResultTable, ResultTableBuilder};
use crate::db::types::describe_columns;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlStatement};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteStatement};
use sqlx::{ConnectOptions, Connection as _, Either, Statement as _};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// How long a SQLite connection waits on a locked database file.
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// What a statement execution returns to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Success or failure only
    Status,
    /// Number of rows the statement returned
    Rows,
    /// Identifier generated by the statement
    Insert,
    /// Full result table
    Result,
    /// Number of rows the statement changed
    Write,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "exec",
            Self::Rows => "exec_rows",
            Self::Insert => "exec_insert",
            Self::Result => "exec_result",
            Self::Write => "exec_write",
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one execution, shaped by its `ExecMode`.
#[derive(Debug)]
pub enum ExecOutcome {
    Done,
    RowCount(u64),
    /// Zero when the statement generated no identifier
    InsertId(u64),
    Table(ResultTable),
    Affected(u64),
}

impl ExecOutcome {
    fn kind(&self) -> &'static str {
        match self {
            Self::Done => "status",
            Self::RowCount(_) => "row count",
            Self::InsertId(_) => "insert id",
            Self::Table(_) => "result table",
            Self::Affected(_) => "affected rows",
        }
    }

    fn mismatch(self, wanted: &str) -> DbError {
        DbError::internal(format!("expected {} outcome, got {}", wanted, self.kind()))
    }

    pub fn into_done(self) -> DbResult<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(other.mismatch("status")),
        }
    }

    pub fn into_row_count(self) -> DbResult<u64> {
        match self {
            Self::RowCount(n) => Ok(n),
            other => Err(other.mismatch("row count")),
        }
    }

    pub fn into_insert_id(self) -> DbResult<u64> {
        match self {
            Self::InsertId(id) => Ok(id),
            other => Err(other.mismatch("insert id")),
        }
    }

    pub fn into_table(self) -> DbResult<ResultTable> {
        match self {
            Self::Table(table) => Ok(table),
            other => Err(other.mismatch("result table")),
        }
    }

    pub fn into_affected(self) -> DbResult<u64> {
        match self {
            Self::Affected(n) => Ok(n),
            other => Err(other.mismatch("affected rows")),
        }
    }
}

/// One live backend connection.
#[derive(Debug)]
pub enum Connection {
    MySql(MySqlConnection),
    SQLite(SqliteConnection),
}

/// A statement prepared on one connection.
///
/// The handle carries the statement text and its metadata; the driver keeps
/// the server-side statement in the owning connection's statement cache.
#[derive(Debug)]
pub enum PreparedStatement {
    MySql(MySqlStatement<'static>),
    SQLite(SqliteStatement<'static>),
}

impl PreparedStatement {
    /// Number of placeholders, when the backend reports it.
    pub fn param_count(&self) -> Option<usize> {
        match self {
            Self::MySql(s) => count_parameters(s.parameters()),
            Self::SQLite(s) => count_parameters(s.parameters()),
        }
    }

    /// Result column metadata.
    pub fn columns(&self) -> Vec<Column> {
        match self {
            Self::MySql(s) => describe_columns(s.columns(), Backend::MySql),
            Self::SQLite(s) => describe_columns(s.columns(), Backend::SQLite),
        }
    }
}

fn count_parameters<T>(parameters: Option<Either<&[T], usize>>) -> Option<usize> {
    match parameters {
        Some(Either::Left(types)) => Some(types.len()),
        Some(Either::Right(count)) => Some(count),
        None => None,
    }
}

enum ConnectTarget {
    MySql(MySqlConnectOptions),
    SQLite(SqliteConnectOptions),
}

/// Blocking facade over the backend driver.
pub struct Driver {
    backend: Backend,
    target: ConnectTarget,
    display_target: String,
    runtime: Runtime,
    /// Connections opened by `connect` and not yet passed to `close`.
    live: AtomicUsize,
    #[cfg(test)]
    pub(crate) faults: faults::Faults,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("backend", &self.backend)
            .field("target", &self.display_target)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Build connect options and start the driver runtime. Does not connect.
    pub fn new(config: &PoolConfig) -> DbResult<Self> {
        let target = match config.backend {
            Backend::MySql => {
                let url = config.mysql_url()?;
                let mut options = MySqlConnectOptions::from_str(url.as_str())
                    .map_err(|e| {
                        DbError::config(format!("Invalid MySQL connection options: {}", e))
                    })?
                    .charset("utf8mb4")
                    .statement_cache_capacity(config.statement_cache_capacity);
                if let Some(socket) = &config.socket {
                    options = options.socket(socket);
                }
                ConnectTarget::MySql(options)
            }
            Backend::SQLite => ConnectTarget::SQLite(
                SqliteConnectOptions::new()
                    .filename(&config.schema)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT)
                    .statement_cache_capacity(config.statement_cache_capacity),
            ),
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.driver_threads)
            .thread_name("maildb-driver")
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start driver runtime: {}", e)))?;

        Ok(Self {
            backend: config.backend,
            target,
            display_target: config.display_target(),
            runtime,
            live: AtomicUsize::new(0),
            #[cfg(test)]
            faults: faults::Faults::default(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Connection target safe for logging.
    pub fn display_target(&self) -> &str {
        &self.display_target
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Number of connections opened and not yet closed through this driver.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Open one connection. `slot` only labels the error.
    pub fn connect(&self, slot: Option<usize>) -> DbResult<Connection> {
        #[cfg(test)]
        self.faults.check_connect(slot)?;

        let result = match &self.target {
            ConnectTarget::MySql(options) => self.block_on(options.connect()).map(Connection::MySql),
            ConnectTarget::SQLite(options) => {
                self.block_on(options.connect()).map(Connection::SQLite)
            }
        };
        let conn = result.map_err(|e| {
            DbError::connect(
                slot,
                format!("Failed to connect: {}", e),
                connection_suggestion(self.backend, &e),
            )
        })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    /// Close a connection gracefully; failures are only logged.
    pub fn close(&self, conn: Connection) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let result = backend_dispatch!(conn, {
            MySql(c) => self.block_on(c.close()),
            SQLite(c) => self.block_on(c.close()),
        });
        if let Err(e) = result {
            warn!(backend = %self.backend, error = %e, "Failed to close connection cleanly");
        }
    }

    /// Check that the connection is still alive.
    pub fn ping(&self, conn: &mut Connection) -> DbResult<()> {
        backend_dispatch!(conn, {
            MySql(c) => self.block_on(c.ping()),
            SQLite(c) => self.block_on(c.ping()),
        })
        .map_err(|e| DbError::connection_lost(format!("Ping failed: {}", e)))
    }

    /// Prepare `sql` on this connection.
    pub fn prepare(&self, conn: &mut Connection, sql: &str) -> DbResult<PreparedStatement> {
        let result = backend_dispatch!(conn, {
            MySql(c) => self
                .block_on(sqlx::Executor::prepare(&mut *c, sql))
                .map(|s| PreparedStatement::MySql(sqlx::Statement::to_owned(&s))),
            SQLite(c) => self
                .block_on(sqlx::Executor::prepare(&mut *c, sql))
                .map(|s| PreparedStatement::SQLite(sqlx::Statement::to_owned(&s))),
        });
        result.map_err(|e| match DbError::from(e) {
            lost @ DbError::Driver {
                connection_lost: true,
                ..
            } => lost,
            other => DbError::prepare(other.to_string(), sql),
        })
    }

    /// Bind `params` to a prepared handle and execute it on `conn`.
    pub fn execute(
        &self,
        conn: &mut Connection,
        stmt: &PreparedStatement,
        columns: &[Column],
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        #[cfg(test)]
        self.faults.check_call()?;

        statement_dispatch!(
            (conn, stmt),
            {
                MySql(c, s) => self.block_on(mysql::execute(c, s, columns, params, mode)),
                SQLite(c, s) => self.block_on(sqlite::execute(c, s, columns, params, mode)),
            },
            Err(DbError::internal(
                "prepared statement belongs to a different backend"
            ))
        )
    }

    /// Execute unprepared SQL text (one or more statements, no parameters).
    pub fn execute_text(
        &self,
        conn: &mut Connection,
        sql: &str,
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        #[cfg(test)]
        self.faults.check_call()?;

        debug!(sql = %sql, mode = %mode, "Executing raw SQL");
        backend_dispatch!(conn, {
            MySql(c) => self.block_on(mysql::execute_text(c, sql, mode)),
            SQLite(c) => self.block_on(sqlite::execute_text(c, sql, mode)),
        })
    }

    /// Escape `text` for interpolation inside a single-quoted SQL literal.
    pub fn escape(&self, text: &str) -> String {
        escape_literal(self.backend, text)
    }
}

/// Escape `text` for interpolation inside a single-quoted SQL literal.
///
/// MySQL follows `mysql_real_escape_string`; SQLite only doubles quotes.
pub fn escape_literal(backend: Backend, text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 8 + 2);
    match backend {
        Backend::MySql => {
            for ch in text.chars() {
                match ch {
                    '\0' => escaped.push_str("\\0"),
                    '\n' => escaped.push_str("\\n"),
                    '\r' => escaped.push_str("\\r"),
                    '\\' => escaped.push_str("\\\\"),
                    '\'' => escaped.push_str("\\'"),
                    '"' => escaped.push_str("\\\""),
                    '\x1a' => escaped.push_str("\\Z"),
                    _ => escaped.push(ch),
                }
            }
        }
        Backend::SQLite => {
            for ch in text.chars() {
                if ch == '\'' {
                    escaped.push('\'');
                }
                escaped.push(ch);
            }
        }
    }
    escaped
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(backend: Backend, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {} server is running and accessible", backend);
    }

    if error_str.contains("access denied") || error_str.contains("password") {
        return "Verify the configured user and password".to_string();
    }

    if error_str.contains("unknown database") {
        return "Check that the configured schema exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match backend {
        Backend::MySql => "Verify host, port or socket of the MySQL server".to_string(),
        Backend::SQLite => {
            "Verify the database file's directory exists and is writable".to_string()
        }
    }
}

// =============================================================================
// Backend-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use crate::db::types::mysql::encode_row;

    pub async fn execute(
        conn: &mut MySqlConnection,
        stmt: &MySqlStatement<'static>,
        columns: &[Column],
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let mut query = stmt.query();
        for param in params {
            query = bind_mysql_param(query, param);
        }

        match mode {
            ExecMode::Status => {
                query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Done)
            }
            ExecMode::Insert => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::InsertId(result.last_insert_id()))
            }
            ExecMode::Write => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Affected(result.rows_affected()))
            }
            ExecMode::Rows => Ok(ExecOutcome::RowCount(
                count_rows(query.fetch(&mut *conn)).await?,
            )),
            ExecMode::Result => {
                let table = materialize(
                    query.fetch(&mut *conn),
                    Some(columns.to_vec()),
                    Backend::MySql,
                    encode_row,
                )
                .await?;
                Ok(ExecOutcome::Table(table))
            }
        }
    }

    pub async fn execute_text(
        conn: &mut MySqlConnection,
        sql: &str,
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let query = sqlx::raw_sql(sql);
        match mode {
            ExecMode::Status => {
                query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Done)
            }
            ExecMode::Insert => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::InsertId(result.last_insert_id()))
            }
            ExecMode::Write => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Affected(result.rows_affected()))
            }
            ExecMode::Rows => Ok(ExecOutcome::RowCount(
                count_rows(query.fetch(&mut *conn)).await?,
            )),
            ExecMode::Result => {
                let table =
                    materialize(query.fetch(&mut *conn), None, Backend::MySql, encode_row).await?;
                Ok(ExecOutcome::Table(table))
            }
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use crate::db::types::sqlite::encode_row;

    pub async fn execute(
        conn: &mut SqliteConnection,
        stmt: &SqliteStatement<'static>,
        columns: &[Column],
        params: &[QueryParam],
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let mut query = stmt.query();
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        match mode {
            ExecMode::Status => {
                query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Done)
            }
            ExecMode::Insert => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::InsertId(rowid(result.last_insert_rowid())))
            }
            ExecMode::Write => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Affected(result.rows_affected()))
            }
            ExecMode::Rows => Ok(ExecOutcome::RowCount(
                count_rows(query.fetch(&mut *conn)).await?,
            )),
            ExecMode::Result => {
                let table = materialize(
                    query.fetch(&mut *conn),
                    Some(columns.to_vec()),
                    Backend::SQLite,
                    encode_row,
                )
                .await?;
                Ok(ExecOutcome::Table(table))
            }
        }
    }

    pub async fn execute_text(
        conn: &mut SqliteConnection,
        sql: &str,
        mode: ExecMode,
    ) -> DbResult<ExecOutcome> {
        let query = sqlx::raw_sql(sql);
        match mode {
            ExecMode::Status => {
                query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Done)
            }
            ExecMode::Insert => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::InsertId(rowid(result.last_insert_rowid())))
            }
            ExecMode::Write => {
                let result = query.execute(&mut *conn).await?;
                Ok(ExecOutcome::Affected(result.rows_affected()))
            }
            ExecMode::Rows => Ok(ExecOutcome::RowCount(
                count_rows(query.fetch(&mut *conn)).await?,
            )),
            ExecMode::Result => {
                let table =
                    materialize(query.fetch(&mut *conn), None, Backend::SQLite, encode_row).await?;
                Ok(ExecOutcome::Table(table))
            }
        }
    }

    /// SQLite rowids are signed; negative ones are reported as no id.
    fn rowid(id: i64) -> u64 {
        u64::try_from(id).unwrap_or(0)
    }
}

/// Fault switches for exercising failure paths in unit tests.
#[cfg(test)]
pub(crate) mod faults {
    use crate::error::{DbError, DbResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) struct Faults {
        connects_left: AtomicUsize,
        lose_next_call: AtomicBool,
    }

    impl Default for Faults {
        fn default() -> Self {
            Self {
                connects_left: AtomicUsize::new(usize::MAX),
                lose_next_call: AtomicBool::new(false),
            }
        }
    }

    impl Faults {
        /// Let `n` more connects succeed, then refuse every later one.
        pub(crate) fn fail_connects_after(&self, n: usize) {
            self.connects_left.store(n, Ordering::SeqCst);
        }

        /// Fail the next statement call as if the connection dropped.
        pub(crate) fn lose_next_call(&self) {
            self.lose_next_call.store(true, Ordering::SeqCst);
        }

        pub(super) fn check_connect(&self, slot: Option<usize>) -> DbResult<()> {
            self.connects_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| DbError::connect(slot, "connection refused", "server unreachable"))
        }

        pub(super) fn check_call(&self) -> DbResult<()> {
            if self.lose_next_call.swap(false, Ordering::SeqCst) {
                return Err(DbError::connection_lost("server closed the connection"));
            }
            Ok(())
        }
    }
}

/// Count the rows of a result stream without keeping them.
async fn count_rows<S, R>(mut stream: S) -> DbResult<u64>
where
    S: futures_util::Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    let mut count = 0u64;
    while stream.try_next().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Materialize a row stream into a table, a row at a time.
///
/// `columns` is `None` for unprepared text, whose metadata only arrives with
/// the first row; an empty unprepared result therefore has no fields. Any
/// fetch error drops the rows copied so far.
async fn materialize<S, R, F>(
    mut stream: S,
    mut columns: Option<Vec<Column>>,
    backend: Backend,
    encode: F,
) -> DbResult<ResultTable>
where
    S: futures_util::Stream<Item = Result<R, sqlx::Error>> + Unpin,
    R: sqlx::Row,
    F: Fn(&R, &[Column], &mut ResultTableBuilder) -> DbResult<()>,
{
    let mut builder = columns.clone().map(ResultTableBuilder::new);
    while let Some(row) = stream.try_next().await? {
        let columns = columns.get_or_insert_with(|| describe_columns(row.columns(), backend));
        let builder = builder.get_or_insert_with(|| ResultTableBuilder::new(columns.clone()));
        encode(&row, columns, builder)?;
    }
    builder
        .unwrap_or_else(|| ResultTableBuilder::new(Vec::new()))
        .finish()
}
