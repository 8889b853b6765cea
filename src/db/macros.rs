//! Backend dispatch macros for reducing code duplication.
//!
//! The driver keeps one enum variant per backend for connections and
//! prepared statements. These macros generate the repetitive match arms
//! while keeping each arm's body readable in place.

/// Generate match arms over `Connection` variants.
///
/// # Example
///
/// ```ignore
/// backend_dispatch!(conn, {
///     MySql(c) => driver.block_on(c.ping()),
///     SQLite(c) => driver.block_on(c.ping()),
/// });
/// ```
macro_rules! backend_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::driver::Connection::$variant($c) => $body,
            )+
        }
    };
}

/// Generate match arms over matching `(Connection, PreparedStatement)` pairs.
///
/// A connection and a handle of different backends cannot meet unless a
/// statement group is used with a foreign pool; that case yields `$mismatch`.
macro_rules! statement_dispatch {
    (
        ($conn:expr, $stmt:expr),
        { $($variant:ident($c:ident, $s:ident) => $body:expr),+ $(,)? },
        $mismatch:expr
    ) => {
        match ($conn, $stmt) {
            $(
                (
                    $crate::db::driver::Connection::$variant($c),
                    $crate::db::driver::PreparedStatement::$variant($s),
                ) => $body,
            )+
            #[allow(unreachable_patterns)]
            _ => $mismatch,
        }
    };
}

pub(crate) use backend_dispatch;
pub(crate) use statement_dispatch;
