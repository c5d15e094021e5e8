//! Application configuration module
//!
//! Handles loading settings from an optional config file layered under
//! `DBDRIFT_*` environment variables, and holds the comparison options
//! (filters, strictness, worker count) threaded through the engine.

use crate::error::{configuration_error, CompareError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Default worker count: leave two cores for the tokio runtime and the
/// database driver, never fewer than two workers.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(2)
        .max(2)
}

fn default_sample_size() -> usize {
    20
}

/// Options recognized by the comparison engine.
///
/// Filters use exact table/column names. `include_tables` empty means
/// "compare everything not excluded".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareOptions {
    /// If non-empty, only these tables are compared
    pub include_tables: BTreeSet<String>,
    /// Tables to skip entirely
    pub exclude_tables: BTreeSet<String>,
    /// Per-table columns to ignore in both schema and data comparison
    pub exclude_columns: BTreeMap<String, BTreeSet<String>>,
    /// Compare declared types by exact normalized spelling instead of family
    pub strict_type_matching: bool,
    /// Drop timestamp/date columns from extracted schemas before diffing
    pub ignore_timestamps: bool,
    /// Bounded worker pool size for per-table data comparison
    pub workers: usize,
    /// Maximum differing fingerprints retained per direction per table
    pub sample_size: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            include_tables: BTreeSet::new(),
            exclude_tables: BTreeSet::new(),
            exclude_columns: BTreeMap::new(),
            strict_type_matching: false,
            ignore_timestamps: false,
            workers: default_workers(),
            sample_size: default_sample_size(),
        }
    }
}

impl CompareOptions {
    /// Whether the table filter lets this table through
    pub fn table_included(&self, table: &str) -> bool {
        if self.exclude_tables.contains(table) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.contains(table)
    }

    /// Columns excluded for this table, if any
    pub fn excluded_columns(&self, table: &str) -> Option<&BTreeSet<String>> {
        self.exclude_columns.get(table)
    }

    /// Whether a specific column of a table is filtered out
    pub fn column_excluded(&self, table: &str, column: &str) -> bool {
        self.excluded_columns(table)
            .map(|cols| cols.contains(column))
            .unwrap_or(false)
    }
}

/// Complete application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connection string for the left (baseline) database
    pub left: String,
    /// Connection string for the right (candidate) database
    pub right: String,
    #[serde(flatten)]
    pub options: CompareOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            left: String::new(),
            right: String::new(),
            options: CompareOptions::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional config file plus `DBDRIFT_*`
    /// environment variables. Environment wins over the file.
    pub fn load(path: Option<&Path>) -> Result<Self, CompareError> {
        // Load .env if present; absence is not an error
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("DBDRIFT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| configuration_error(format!("failed to load configuration: {e}")))?;

        let settings: Settings = loaded
            .try_deserialize()
            .map_err(|e| configuration_error(format!("invalid configuration: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Sanity checks that do not need database access. Existence of filtered
    /// tables/columns is validated by the orchestrator once schemas are known.
    pub fn validate(&self) -> Result<(), CompareError> {
        if self.options.workers == 0 {
            return Err(configuration_error("workers must be at least 1"));
        }
        let both: Vec<&String> = self
            .options
            .include_tables
            .intersection(&self.options.exclude_tables)
            .collect();
        if !both.is_empty() {
            return Err(configuration_error(format!(
                "tables both included and excluded: {}",
                both.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }
}
