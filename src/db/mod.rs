//! Database access layer.
//!
//! This module provides the pieces the mail server talks to its database through:
//! - Backend driver (blocking facade over `sqlx`)
//! - Bounded connection pool with slot guards
//! - Prepared statement groups, one handle per slot
//! - Owned result tables and typed row access
//! - Transaction guards
//! - The executor call families
//! - Backend dispatch macros for reducing code duplication

pub mod driver;
pub mod executor;
pub mod macros;
pub mod params;
pub mod pool;
pub mod result;
pub mod statement;
pub mod transaction;
pub mod types;

pub use driver::{Connection, Driver, ExecMode, ExecOutcome, PreparedStatement, escape_literal};
pub use executor::Executor;
pub use pool::{ConnectionPool, PoolStats, SlotGuard, SlotId};
pub use result::{Column, ResultTable, ResultTableBuilder, Row};
pub use statement::StatementGroup;
pub use transaction::Transaction;
pub use types::FieldKind;
