//! dbdrift - schema and row-content drift detection between two PostgreSQL
//! databases.
//!
//! Extracts both schemas, diffs table/column structure, then compares row
//! content per table through canonicalized fingerprints, so no primary keys
//! or consistent row ordering are required. Exits with status 1 when drift
//! was found.

mod compare;
mod config;
mod connection;
mod diff;
mod error;
mod hash;
mod introspection;
mod report;

use crate::compare::Comparator;
use crate::config::Settings;
use crate::connection::{DbHandle, DbSide};
use crate::report::{render_json, render_text, ReportFormat};
use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "dbdrift",
    version,
    about = "Detect schema and row-content drift between two PostgreSQL databases"
)]
struct Cli {
    /// Left (baseline) database connection string
    #[arg(long)]
    left: Option<String>,

    /// Right (candidate) database connection string
    #[arg(long)]
    right: Option<String>,

    /// Config file with connection strings and filters (TOML/YAML/JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the report to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "text")]
    format: ReportFormat,

    /// Worker pool size for per-table comparison
    #[arg(long)]
    workers: Option<usize>,

    /// Compare declared types by exact spelling instead of family
    #[arg(long)]
    strict_types: bool,

    /// Drop timestamp/date columns before comparing
    #[arg(long)]
    ignore_timestamps: bool,

    /// Differing fingerprints retained per direction per table
    #[arg(long)]
    sample_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(left) = cli.left {
        settings.left = left;
    }
    if let Some(right) = cli.right {
        settings.right = right;
    }
    if let Some(workers) = cli.workers {
        settings.options.workers = workers;
    }
    if let Some(sample_size) = cli.sample_size {
        settings.options.sample_size = sample_size;
    }
    if cli.strict_types {
        settings.options.strict_type_matching = true;
    }
    if cli.ignore_timestamps {
        settings.options.ignore_timestamps = true;
    }

    if settings.left.is_empty() || settings.right.is_empty() {
        bail!(
            "both connection strings are required: pass --left/--right, \
             set them in the config file, or export DBDRIFT_LEFT/DBDRIFT_RIGHT"
        );
    }
    settings.validate()?;

    // one slot per worker on each side, plus the introspection client
    let pool_size = settings.options.workers + 1;
    let (left, right) = tokio::try_join!(
        DbHandle::connect(DbSide::Left, &settings.left, pool_size),
        DbHandle::connect(DbSide::Right, &settings.right, pool_size),
    )?;

    let cancel = CancellationToken::new();
    spawn_cancel_on_signal(cancel.clone());

    let mut comparator = Comparator::new(left, right, settings.options.clone());
    let result = comparator.compare(&cancel).await?;

    let rendered = match cli.format {
        ReportFormat::Text => render_text(&result),
        ReportFormat::Json => render_json(&result)?,
    };

    match &cli.output {
        Some(path) => {
            std::fs::write(path, &rendered)?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{rendered}"),
    }

    if result.has_drift() {
        info!("drift detected");
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dbdrift=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}

/// Cancel the run on Ctrl+C or SIGTERM; in-flight table workers observe the
/// token and stop streaming, leaving completed tables in the partial result.
fn spawn_cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C, cancelling run");
            },
            _ = terminate => {
                info!("received terminate signal, cancelling run");
            },
        }

        cancel.cancel();
    });
}
