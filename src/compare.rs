//! Comparison orchestrator
//!
//! Drives a full comparison run: extract both schemas, validate and apply
//! filters, diff schemas, then fan per-table data comparisons out over a
//! bounded worker pool. Per-table failures become skip reasons in the
//! result; only connection and configuration problems abort the run.

use crate::config::CompareOptions;
use crate::connection::{DbHandle, DbSide};
use crate::diff::data::{FingerprintAccumulator, RowSetDiff};
use crate::diff::schema::{diff_schemas, SchemaDiff, TableSchemaDiff, TypeRules};
use crate::error::{configuration_error, CompareError, Result, SkipReason};
use crate::hash::RowPlan;
use crate::introspection::{introspect_schema, SchemaSnapshot};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_postgres::types::ToSql;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Run phases. A run always reaches `Aggregated`, even when individual
/// tables were skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialized,
    ExtractingSchemas,
    DiffingSchemas,
    DiffingData,
    Aggregated,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Initialized => "initialized",
            Phase::ExtractingSchemas => "extracting_schemas",
            Phase::DiffingSchemas => "diffing_schemas",
            Phase::DiffingData => "diffing_data",
            Phase::Aggregated => "aggregated",
        };
        write!(f, "{name}")
    }
}

/// Data-comparison outcome for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum TableOutcome {
    Compared(RowSetDiff),
    Skipped(SkipReason),
}

/// Everything known about one discovered table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    /// Column-level schema drift, when the table exists on both sides and
    /// drifted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchemaDiff>,
    pub outcome: TableOutcome,
}

/// Aggregate counters for the whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonTotals {
    pub tables_discovered: u64,
    pub tables_compared: u64,
    pub tables_skipped: u64,
    pub tables_with_data_drift: u64,
    pub rows_added: u64,
    pub rows_removed: u64,
}

/// The aggregated, serializable result of one comparison run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub run_id: Uuid,
    /// Display string for the left database (password masked)
    pub left: String,
    pub right: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schema: SchemaDiff,
    /// Every discovered table, keyed by qualified name
    pub tables: BTreeMap<String, TableReport>,
    /// Exclusions that actually matched discovered tables
    pub excluded_tables: BTreeSet<String>,
    pub excluded_columns: BTreeMap<String, BTreeSet<String>>,
    pub totals: ComparisonTotals,
    pub cancelled: bool,
}

impl ComparisonResult {
    pub fn has_drift(&self) -> bool {
        !self.schema.is_empty()
            || self.tables.values().any(|t| match &t.outcome {
                TableOutcome::Compared(diff) => !diff.is_empty(),
                TableOutcome::Skipped(_) => false,
            })
    }
}

/// Orchestrates one comparison run. Owns both handles for the duration;
/// all configuration is threaded through explicitly.
pub struct Comparator {
    left: DbHandle,
    right: DbHandle,
    options: CompareOptions,
    rules: TypeRules,
    phase: Phase,
}

impl Comparator {
    pub fn new(left: DbHandle, right: DbHandle, options: CompareOptions) -> Self {
        let rules = TypeRules::new(options.strict_type_matching);
        Self {
            left,
            right,
            options,
            rules,
            phase: Phase::Initialized,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }

    /// Run the full comparison. Cancellation stops in-flight table workers
    /// promptly; completed tables stay in the partial result.
    pub async fn compare(&mut self, cancel: &CancellationToken) -> Result<ComparisonResult> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, left = %self.left.params.to_display_string(),
              right = %self.right.params.to_display_string(), "starting comparison");

        self.enter(Phase::ExtractingSchemas);
        let (left_snap, right_snap) = tokio::try_join!(
            introspect_schema(&self.left, self.options.ignore_timestamps),
            introspect_schema(&self.right, self.options.ignore_timestamps),
        )?;

        validate_filters(&self.options, &left_snap, &right_snap)?;

        self.enter(Phase::DiffingSchemas);
        let schema = diff_schemas(&left_snap, &right_snap, &self.options, &self.rules);

        self.enter(Phase::DiffingData);
        let mut tables: BTreeMap<String, TableReport> = BTreeMap::new();
        let mut excluded_tables = BTreeSet::new();
        let mut excluded_columns: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        let work = self.plan_tables(
            &left_snap,
            &right_snap,
            &schema,
            &mut tables,
            &mut excluded_tables,
            &mut excluded_columns,
        );

        let semaphore = Arc::new(Semaphore::new(self.options.workers));
        let mut join_set: JoinSet<(String, TableOutcome)> = JoinSet::new();

        for (name, plan) in work {
            // placeholder so the table stays accounted for even if its
            // worker dies; overwritten on join
            tables.insert(
                name.clone(),
                TableReport {
                    schema: None,
                    outcome: TableOutcome::Skipped(SkipReason::ReadError(
                        "comparison did not complete".to_string(),
                    )),
                },
            );

            let semaphore = Arc::clone(&semaphore);
            let left_pool = self.left.pool.clone();
            let right_pool = self.right.pool.clone();
            let cancel = cancel.clone();
            let sample_size = self.options.sample_size;

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                let outcome =
                    compare_table_data(&name, left_pool, right_pool, plan, sample_size, &cancel)
                        .await;
                (name, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    if let Some(entry) = tables.get_mut(&name) {
                        entry.outcome = outcome;
                    }
                }
                Err(e) => {
                    // a panicked worker keeps its placeholder skip entry
                    warn!(error = %e, "table comparison task failed");
                }
            }
        }

        // attach per-table schema drift to compared entries
        for (name, report) in tables.iter_mut() {
            if report.schema.is_none() {
                report.schema = schema.tables.get(name).cloned();
            }
        }

        self.enter(Phase::Aggregated);
        let totals = compute_totals(&tables);
        let cancelled = cancel.is_cancelled();
        let result = ComparisonResult {
            run_id,
            left: self.left.params.to_display_string(),
            right: self.right.params.to_display_string(),
            started_at,
            finished_at: Utc::now(),
            schema,
            tables,
            excluded_tables,
            excluded_columns,
            totals,
            cancelled,
        };

        info!(
            %run_id,
            compared = result.totals.tables_compared,
            skipped = result.totals.tables_skipped,
            drift = result.has_drift(),
            cancelled,
            "comparison finished"
        );
        Ok(result)
    }

    /// Classify every discovered table: record skips immediately, return the
    /// read plans for tables that proceed to data comparison.
    fn plan_tables(
        &self,
        left_snap: &SchemaSnapshot,
        right_snap: &SchemaSnapshot,
        schema: &SchemaDiff,
        tables: &mut BTreeMap<String, TableReport>,
        excluded_tables: &mut BTreeSet<String>,
        excluded_columns: &mut BTreeMap<String, BTreeSet<String>>,
    ) -> Vec<(String, RowPlan)> {
        let mut discovered: BTreeSet<String> = left_snap.table_names().collect();
        discovered.extend(right_snap.table_names());
        discovered.extend(left_snap.skipped.keys().cloned());
        discovered.extend(right_snap.skipped.keys().cloned());

        let mut work = Vec::new();

        for name in discovered {
            if !self.options.table_included(&name) {
                excluded_tables.insert(name.clone());
                tables.insert(
                    name,
                    TableReport {
                        schema: None,
                        outcome: TableOutcome::Skipped(SkipReason::Excluded),
                    },
                );
                continue;
            }

            if let Some(reason) = left_snap
                .skipped
                .get(&name)
                .or_else(|| right_snap.skipped.get(&name))
            {
                tables.insert(
                    name,
                    TableReport {
                        schema: None,
                        outcome: TableOutcome::Skipped(SkipReason::Introspection(reason.clone())),
                    },
                );
                continue;
            }

            if schema.missing_in_left.contains(&name) {
                tables.insert(
                    name,
                    TableReport {
                        schema: None,
                        outcome: TableOutcome::Skipped(SkipReason::MissingInLeft),
                    },
                );
                continue;
            }
            if schema.missing_in_right.contains(&name) {
                tables.insert(
                    name,
                    TableReport {
                        schema: None,
                        outcome: TableOutcome::Skipped(SkipReason::MissingInRight),
                    },
                );
                continue;
            }

            let (Some(left_table), Some(right_table)) =
                (left_snap.table(&name), right_snap.table(&name))
            else {
                continue;
            };

            if let Some(cols) = self.options.excluded_columns(&name) {
                let applied: BTreeSet<String> = cols
                    .iter()
                    .filter(|c| {
                        left_table.column(c).is_some() || right_table.column(c).is_some()
                    })
                    .cloned()
                    .collect();
                if !applied.is_empty() {
                    excluded_columns.insert(name.clone(), applied);
                }
            }

            let plan = RowPlan::build(left_table, right_table, &self.options);
            if plan.is_empty() {
                tables.insert(
                    name.clone(),
                    TableReport {
                        schema: schema.tables.get(&name).cloned(),
                        outcome: TableOutcome::Skipped(SkipReason::NoCommonColumns),
                    },
                );
                continue;
            }

            work.push((name, plan));
        }

        work
    }
}

fn compute_totals(tables: &BTreeMap<String, TableReport>) -> ComparisonTotals {
    let mut totals = ComparisonTotals {
        tables_discovered: tables.len() as u64,
        ..Default::default()
    };
    for report in tables.values() {
        match &report.outcome {
            TableOutcome::Compared(diff) => {
                totals.tables_compared += 1;
                totals.rows_added += diff.added_count;
                totals.rows_removed += diff.removed_count;
                if !diff.is_empty() {
                    totals.tables_with_data_drift += 1;
                }
            }
            TableOutcome::Skipped(_) => totals.tables_skipped += 1,
        }
    }
    totals
}

/// Reject filters naming tables/columns that exist on neither side. Runs
/// after extraction so the check covers what was actually discovered, and
/// before any diff work.
fn validate_filters(
    options: &CompareOptions,
    left: &SchemaSnapshot,
    right: &SchemaSnapshot,
) -> Result<()> {
    let mut known: BTreeSet<String> = left.table_names().collect();
    known.extend(right.table_names());
    known.extend(left.skipped.keys().cloned());
    known.extend(right.skipped.keys().cloned());

    for table in options.include_tables.iter().chain(&options.exclude_tables) {
        if !known.contains(table) {
            return Err(configuration_error(format!(
                "filter references unknown table: {table}"
            )));
        }
    }

    for (table, cols) in &options.exclude_columns {
        if !known.contains(table) {
            return Err(configuration_error(format!(
                "column filter references unknown table: {table}"
            )));
        }
        let (lt, rt) = (left.table(table), right.table(table));
        // introspection-skipped tables cannot be checked column by column
        if lt.is_none() && rt.is_none() {
            continue;
        }
        for col in cols {
            let in_left = lt.and_then(|t| t.column(col)).is_some();
            let in_right = rt.and_then(|t| t.column(col)).is_some();
            if !in_left && !in_right {
                return Err(configuration_error(format!(
                    "column filter references unknown column: {table}.{col}"
                )));
            }
        }
    }

    Ok(())
}

fn slice_iter<'a>(
    s: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    s.iter().map(|s| *s as _)
}

/// Stream one side's rows into the accumulator. Returns `Ok(false)` when the
/// run was cancelled mid-stream.
async fn stream_side(
    client: &deadpool_postgres::Client,
    plan: &RowPlan,
    side: DbSide,
    acc: &mut FingerprintAccumulator,
    cancel: &CancellationToken,
) -> Result<bool> {
    let read_error = |e: tokio_postgres::Error| CompareError::Read {
        table: plan.table.clone(),
        message: e.to_string(),
    };

    let query = plan.query();
    let stream = client
        .query_raw(query.as_str(), slice_iter(&[]))
        .await
        .map_err(read_error)?;
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            row = stream.try_next() => match row.map_err(read_error)? {
                Some(row) => {
                    let fp = plan.fingerprint_row(&row).map_err(read_error)?;
                    match side {
                        DbSide::Left => acc.record_left(fp),
                        DbSide::Right => acc.record_right(fp),
                    }
                }
                None => return Ok(true),
            },
        }
    }
}

/// Compare one table's row content. Every failure mode maps to a skip
/// reason; this function never aborts the run.
async fn compare_table_data(
    table: &str,
    left_pool: Pool,
    right_pool: Pool,
    plan: RowPlan,
    sample_size: usize,
    cancel: &CancellationToken,
) -> TableOutcome {
    if cancel.is_cancelled() {
        return TableOutcome::Skipped(SkipReason::Cancelled);
    }

    debug!(%table, columns = plan.columns.len(), "comparing table data");

    let left_client = match left_pool.get().await {
        Ok(c) => c,
        Err(e) => return TableOutcome::Skipped(SkipReason::ReadError(e.to_string())),
    };
    let right_client = match right_pool.get().await {
        Ok(c) => c,
        Err(e) => return TableOutcome::Skipped(SkipReason::ReadError(e.to_string())),
    };

    let mut acc = FingerprintAccumulator::new(sample_size);

    for (client, side) in [(&left_client, DbSide::Left), (&right_client, DbSide::Right)] {
        match stream_side(client, &plan, side, &mut acc, cancel).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%table, "cancelled mid-stream");
                return TableOutcome::Skipped(SkipReason::Cancelled);
            }
            Err(e) => {
                warn!(%table, %side, error = %e, "row streaming failed");
                let message = match e {
                    CompareError::Read { message, .. } => message,
                    other => other.to_string(),
                };
                return TableOutcome::Skipped(SkipReason::ReadError(message));
            }
        }
    }

    let diff = acc.finish();
    debug!(
        %table,
        added = diff.added_count,
        removed = diff.removed_count,
        common = diff.common_count,
        "table data compared"
    );
    TableOutcome::Compared(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ColumnDef, TableSchema};
    use pretty_assertions::assert_eq;

    fn snapshot(side: DbSide, tables: Vec<TableSchema>) -> SchemaSnapshot {
        let checksum = SchemaSnapshot::compute_checksum(&tables);
        SchemaSnapshot {
            side,
            captured_at: Utc::now(),
            tables,
            skipped: Default::default(),
            checksum,
        }
    }

    fn table(name: &str, cols: &[(&str, &str)]) -> TableSchema {
        TableSchema {
            schema: "public".to_string(),
            name: name.to_string(),
            columns: cols
                .iter()
                .map(|(n, t)| ColumnDef {
                    name: n.to_string(),
                    declared_type: t.to_string(),
                    nullable: true,
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_filters_accepts_known_names() {
        let left = snapshot(DbSide::Left, vec![table("users", &[("id", "integer")])]);
        let right = snapshot(DbSide::Right, vec![table("users", &[("id", "integer")])]);

        let mut options = CompareOptions::default();
        options.exclude_tables.insert("users".to_string());
        assert!(validate_filters(&options, &left, &right).is_ok());
    }

    #[test]
    fn test_validate_filters_rejects_unknown_table() {
        let left = snapshot(DbSide::Left, vec![table("users", &[("id", "integer")])]);
        let right = snapshot(DbSide::Right, vec![]);

        let mut options = CompareOptions::default();
        options.include_tables.insert("ghosts".to_string());
        let err = validate_filters(&options, &left, &right).unwrap_err();
        assert!(matches!(err, CompareError::Configuration(_)));
    }

    #[test]
    fn test_validate_filters_rejects_unknown_column() {
        let left = snapshot(DbSide::Left, vec![table("users", &[("id", "integer")])]);
        let right = snapshot(DbSide::Right, vec![table("users", &[("id", "integer")])]);

        let mut options = CompareOptions::default();
        options
            .exclude_columns
            .entry("users".to_string())
            .or_default()
            .insert("no_such_column".to_string());
        let err = validate_filters(&options, &left, &right).unwrap_err();
        assert!(err.to_string().contains("users.no_such_column"));
    }

    #[test]
    fn test_validate_filters_accepts_column_on_either_side() {
        let left = snapshot(DbSide::Left, vec![table("users", &[("id", "integer")])]);
        let right = snapshot(
            DbSide::Right,
            vec![table("users", &[("id", "integer"), ("extra", "text")])],
        );

        let mut options = CompareOptions::default();
        options
            .exclude_columns
            .entry("users".to_string())
            .or_default()
            .insert("extra".to_string());
        assert!(validate_filters(&options, &left, &right).is_ok());
    }

    #[test]
    fn test_totals_account_for_every_table() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "users".to_string(),
            TableReport {
                schema: None,
                outcome: TableOutcome::Compared(RowSetDiff {
                    row_count_left: 10,
                    row_count_right: 11,
                    added_count: 2,
                    removed_count: 1,
                    common_count: 9,
                    ..Default::default()
                }),
            },
        );
        tables.insert(
            "orders".to_string(),
            TableReport {
                schema: None,
                outcome: TableOutcome::Skipped(SkipReason::MissingInRight),
            },
        );

        let totals = compute_totals(&tables);
        assert_eq!(totals.tables_discovered, 2);
        assert_eq!(totals.tables_compared, 1);
        assert_eq!(totals.tables_skipped, 1);
        assert_eq!(totals.tables_with_data_drift, 1);
        assert_eq!(totals.rows_added, 2);
        assert_eq!(totals.rows_removed, 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::ExtractingSchemas.to_string(), "extracting_schemas");
        assert_eq!(Phase::Aggregated.to_string(), "aggregated");
    }

    #[test]
    fn test_result_drift_detection() {
        let result = ComparisonResult {
            run_id: Uuid::new_v4(),
            left: "postgres://a@h:5432/l".to_string(),
            right: "postgres://a@h:5432/r".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            schema: SchemaDiff::default(),
            tables: BTreeMap::new(),
            excluded_tables: BTreeSet::new(),
            excluded_columns: BTreeMap::new(),
            totals: ComparisonTotals::default(),
            cancelled: false,
        };
        assert!(!result.has_drift());

        let mut with_drift = result.clone();
        with_drift
            .schema
            .missing_in_right
            .insert("orders".to_string());
        assert!(with_drift.has_drift());
    }
}
