//! maildb-probe - run one statement through the pool.
//!
//! Opens a pool from the command line (or `MAILDB_*` environment variables),
//! executes the query in the requested mode and prints the outcome as JSON
//! lines on stdout. Useful for checking credentials, schema and statement
//! text against a live backend before the mail server uses them.

use clap::Parser;
use maildb::config::{Config, ProbeMode};
use maildb::db::types::row_to_json;
use maildb::{ConnectionPool, DbError, DbResult, ExecMode, ExecOutcome, Executor, QueryParam};
use serde_json::json;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout carries only results
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn exec_mode(mode: ProbeMode) -> ExecMode {
    match mode {
        ProbeMode::Exec => ExecMode::Status,
        ProbeMode::Rows => ExecMode::Rows,
        ProbeMode::Insert => ExecMode::Insert,
        ProbeMode::Result => ExecMode::Result,
        ProbeMode::Write => ExecMode::Write,
    }
}

fn parse_params(raw: &[String]) -> DbResult<Vec<QueryParam>> {
    raw.iter()
        .enumerate()
        .map(|(idx, text)| {
            serde_json::from_str(text).map_err(|e| {
                DbError::config(format!("parameter {} is not a JSON value: {}", idx + 1, e))
            })
        })
        .collect()
}

/// Run the statement through the ad-hoc executor families.
fn run_adhoc(executor: &Executor, config: &Config, params: &[QueryParam]) -> DbResult<ExecOutcome> {
    let sql = config.query.as_str();
    if config.raw {
        return Ok(match config.mode {
            ProbeMode::Exec => {
                executor.exec_sql(sql)?;
                ExecOutcome::Done
            }
            ProbeMode::Rows => ExecOutcome::RowCount(executor.exec_rows_sql(sql)?),
            ProbeMode::Insert => ExecOutcome::InsertId(executor.exec_insert_sql(sql)?),
            ProbeMode::Result => ExecOutcome::Table(executor.exec_result_sql(sql)?),
            ProbeMode::Write => ExecOutcome::Affected(executor.exec_write_sql(sql)?),
        });
    }

    let group = executor.prepare(sql)?;
    Ok(match config.mode {
        ProbeMode::Exec => {
            executor.exec(&group, params)?;
            ExecOutcome::Done
        }
        ProbeMode::Rows => ExecOutcome::RowCount(executor.exec_rows(&group, params)?),
        ProbeMode::Insert => ExecOutcome::InsertId(executor.exec_insert(&group, params)?),
        ProbeMode::Result => ExecOutcome::Table(executor.exec_result(&group, params)?),
        ProbeMode::Write => ExecOutcome::Affected(executor.exec_write(&group, params)?),
    })
}

/// Run the statement inside a transaction and roll it back.
fn run_dry(executor: &Executor, config: &Config, params: &[QueryParam]) -> DbResult<ExecOutcome> {
    let mode = exec_mode(config.mode);
    // Prepare before BEGIN: preparing visits every slot, including the one
    // the transaction would hold.
    let group = if config.raw {
        None
    } else {
        Some(executor.prepare(config.query.as_str())?)
    };

    let tx = executor.begin()?;
    let outcome = match &group {
        Some(group) => tx.exec_in(group, params, mode),
        None => tx.exec_text_in(&config.query, mode),
    };
    info!(transaction_id = %tx.id(), "Dry run, rolling back");
    tx.rollback();
    outcome
}

fn print_outcome(mode: ExecMode, outcome: &ExecOutcome) -> DbResult<()> {
    let value = match outcome {
        ExecOutcome::Done => json!(null),
        ExecOutcome::RowCount(n) | ExecOutcome::InsertId(n) | ExecOutcome::Affected(n) => {
            json!(n)
        }
        ExecOutcome::Table(table) => {
            for row in table.rows() {
                let object = row_to_json(&row)?;
                println!("{}", serde_json::Value::Object(object));
            }
            return Ok(());
        }
    };
    println!("{}", json!({ "mode": mode.as_str(), "value": value }));
    Ok(())
}

fn run(pool: &ConnectionPool, config: &Config) -> DbResult<()> {
    let params = parse_params(&config.params)?;
    if config.raw && !params.is_empty() {
        return Err(DbError::config(
            "raw SQL takes no parameters; escape values into the text instead",
        ));
    }

    let executor = Executor::new(pool.clone());
    let start = Instant::now();
    let outcome = if config.dry_run {
        run_dry(&executor, config, &params)?
    } else {
        run_adhoc(&executor, config, &params)?
    };

    let mode = exec_mode(config.mode);
    let rows = match &outcome {
        ExecOutcome::Table(table) => table.row_count(),
        _ => 0,
    };
    info!(
        mode = %mode,
        rows,
        dry_run = config.dry_run,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Statement finished"
    );
    print_outcome(mode, &outcome)
}

// Not a tokio::main: the pool drives its own runtime and blocks on it.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        backend = %config.pool.backend,
        target = %config.pool.display_target(),
        pool_size = config.pool.pool_size,
        "Starting maildb-probe v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = match ConnectionPool::init(config.pool.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Failed to open connection pool");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {}", suggestion);
            }
            return Err(e.into());
        }
    };

    let result = run(&pool, &config);
    pool.shutdown();

    if let Err(e) = result {
        error!(error = %e, "Probe failed");
        return Err(e.into());
    }

    info!("Probe complete");
    Ok(())
}
