//! Mail database access core.
//!
//! This library provides the database layer of a mail server: a bounded pool
//! of backend connections (MySQL/MariaDB or SQLite), prepared statements
//! multiplexed over that pool, transactions, and result sets copied into
//! connection-independent tables.
//!
//! The API is blocking. Call it from ordinary threads; async code should go
//! through `tokio::task::spawn_blocking`.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Backend, Config, PoolConfig};
pub use db::{
    ConnectionPool, ExecMode, ExecOutcome, Executor, ResultTable, Row, StatementGroup,
    Transaction,
};
pub use error::{DbError, DbResult};
pub use models::QueryParam;
