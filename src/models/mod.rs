//! Data models shared by the pool, statements and executor.

pub mod query;

pub use query::QueryParam;
