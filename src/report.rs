//! Report generation
//!
//! Renders a [`ComparisonResult`] as a readable text document or as JSON.
//! The renderer only reads the result structure; all comparison logic lives
//! upstream.

use crate::compare::{ComparisonResult, TableOutcome, TableReport};
use std::fmt::Write as _;

/// Output format selection for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

/// Serialize the result structure for machine consumption
pub fn render_json(result: &ComparisonResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(result)
}

/// Render the text report. Every discovered table is accounted for:
/// compared, or listed under skipped with its reason.
pub fn render_text(result: &ComparisonResult) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Database Comparison Report");
    let _ = writeln!(out, "==========================");
    let _ = writeln!(out);
    let _ = writeln!(out, "Left:  {}", result.left);
    let _ = writeln!(out, "Right: {}", result.right);
    let _ = writeln!(out, "Run:   {}", result.run_id);
    if result.cancelled {
        let _ = writeln!(out);
        let _ = writeln!(out, "NOTE: run was cancelled; results are partial.");
    }
    let _ = writeln!(out);

    if !result.schema.missing_in_right.is_empty() {
        let _ = writeln!(out, "Tables missing in right database:");
        for table in &result.schema.missing_in_right {
            let _ = writeln!(out, "- {table}");
        }
        let _ = writeln!(out);
    }

    if !result.schema.missing_in_left.is_empty() {
        let _ = writeln!(out, "Tables missing in left database:");
        for table in &result.schema.missing_in_left {
            let _ = writeln!(out, "- {table}");
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "Common Tables Analysis:");
    for (name, report) in &result.tables {
        if let TableOutcome::Compared(_) = report.outcome {
            render_table_section(&mut out, name, report);
        }
    }

    let skipped: Vec<(&String, &TableReport)> = result
        .tables
        .iter()
        .filter(|(_, r)| matches!(r.outcome, TableOutcome::Skipped(_)))
        .collect();
    if !skipped.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Skipped Tables:");
        for (name, report) in skipped {
            if let TableOutcome::Skipped(reason) = &report.outcome {
                let _ = writeln!(out, "- {name}: {}", reason.describe());
            }
        }
    }

    if !result.excluded_tables.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Excluded tables applied: {}",
            result
                .excluded_tables
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    for (table, cols) in &result.excluded_columns {
        let _ = writeln!(
            out,
            "Excluded columns applied on {table}: {}",
            cols.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Summary:");
    let _ = writeln!(
        out,
        "  Tables discovered: {}",
        result.totals.tables_discovered
    );
    let _ = writeln!(out, "  Tables compared:   {}", result.totals.tables_compared);
    let _ = writeln!(out, "  Tables skipped:    {}", result.totals.tables_skipped);
    let _ = writeln!(
        out,
        "  Tables with data drift: {}",
        result.totals.tables_with_data_drift
    );
    let _ = writeln!(out, "  Rows added:   {}", result.totals.rows_added);
    let _ = writeln!(out, "  Rows removed: {}", result.totals.rows_removed);

    out
}

fn render_table_section(out: &mut String, name: &str, report: &TableReport) {
    let _ = writeln!(out);
    let _ = writeln!(out, "Table: {name}");
    let _ = writeln!(out, "{}", "-".repeat(name.len() + 7));

    if let Some(schema) = &report.schema {
        let _ = writeln!(out, "Schema differences:");
        if !schema.missing_columns_right.is_empty() {
            let _ = writeln!(
                out,
                "  Columns missing in right: {}",
                schema
                    .missing_columns_right
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !schema.missing_columns_left.is_empty() {
            let _ = writeln!(
                out,
                "  Columns missing in left: {}",
                schema
                    .missing_columns_left
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !schema.type_mismatches.is_empty() {
            let _ = writeln!(out, "  Type mismatches:");
            for (col, pair) in &schema.type_mismatches {
                let _ = writeln!(out, "    {col}: left={}, right={}", pair.left, pair.right);
            }
        }
    }

    if let TableOutcome::Compared(diff) = &report.outcome {
        let _ = writeln!(out, "Data differences:");
        let _ = writeln!(
            out,
            "  Row counts: left={}, right={}",
            diff.row_count_left, diff.row_count_right
        );
        let _ = writeln!(out, "  Rows only in left:  {}", diff.removed_count);
        let _ = writeln!(out, "  Rows only in right: {}", diff.added_count);
        let _ = writeln!(out, "  Rows in common:     {}", diff.common_count);
        if !diff.sample_removed.is_empty() {
            let _ = writeln!(
                out,
                "  Sample fingerprints only in left: {}",
                join_fingerprints(&diff.sample_removed)
            );
        }
        if !diff.sample_added.is_empty() {
            let _ = writeln!(
                out,
                "  Sample fingerprints only in right: {}",
                join_fingerprints(&diff.sample_added)
            );
        }
    }
}

fn join_fingerprints(fps: &[crate::hash::RowFingerprint]) -> String {
    fps.iter()
        .map(|fp| fp.to_hex())
        .collect::<Vec<_>>()
        .join(", ")
}
