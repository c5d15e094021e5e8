//! Schema differ
//!
//! Pure comparison of two schema snapshots under a filter. Table presence is
//! a symmetric set difference; columns of common tables likewise; common
//! columns are checked for type drift through a configurable equivalence
//! rule table.

use crate::config::CompareOptions;
use crate::introspection::SchemaSnapshot;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Declared types of one column on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePair {
    pub left: String,
    pub right: String,
}

/// Column-level drift for one table present on both sides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchemaDiff {
    /// Columns present only on the right side
    pub missing_columns_left: BTreeSet<String>,
    /// Columns present only on the left side
    pub missing_columns_right: BTreeSet<String>,
    /// Common columns whose declared types are not equivalent
    pub type_mismatches: BTreeMap<String, TypePair>,
}

impl TableSchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_columns_left.is_empty()
            && self.missing_columns_right.is_empty()
            && self.type_mismatches.is_empty()
    }
}

/// Structural drift between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDiff {
    /// Tables present only on the right side
    pub missing_in_left: BTreeSet<String>,
    /// Tables present only on the left side
    pub missing_in_right: BTreeSet<String>,
    /// Common tables with column-level drift; drift-free tables are omitted
    pub tables: BTreeMap<String, TableSchemaDiff>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_in_left.is_empty() && self.missing_in_right.is_empty() && self.tables.is_empty()
    }
}

fn precision_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\([^)]*\)").expect("valid regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// Type-equivalence policy.
///
/// Spellings are normalized (lowercase, precision suffixes stripped,
/// whitespace collapsed) and then grouped into families; two types are
/// equivalent when they normalize into the same family. Strict mode compares
/// normalized spellings exactly. The family table is plain data so callers
/// and tests can supply their own.
#[derive(Debug, Clone)]
pub struct TypeRules {
    families: Vec<Vec<String>>,
    strict: bool,
}

impl TypeRules {
    pub fn new(strict: bool) -> Self {
        let families: Vec<Vec<&str>> = vec![
            vec![
                "char",
                "character",
                "bpchar",
                "varchar",
                "character varying",
                "text",
                "citext",
                "name",
            ],
            vec![
                "smallint", "int2", "integer", "int", "int4", "bigint", "int8", "smallserial",
                "serial", "bigserial",
            ],
            vec!["real", "float4", "double precision", "float8"],
            vec!["numeric", "decimal"],
            vec!["boolean", "bool"],
            vec!["bytea"],
            vec![
                "date",
                "time",
                "timetz",
                "time with time zone",
                "time without time zone",
                "timestamp",
                "timestamptz",
                "timestamp with time zone",
                "timestamp without time zone",
                "interval",
            ],
            vec!["uuid"],
            vec!["json", "jsonb"],
        ];

        Self::with_families(
            families
                .into_iter()
                .map(|f| f.into_iter().map(str::to_string).collect())
                .collect(),
            strict,
        )
    }

    pub fn with_families(families: Vec<Vec<String>>, strict: bool) -> Self {
        Self { families, strict }
    }

    /// Canonical spelling: lowercase, precision suffix stripped, single spaces
    pub fn normalize(declared: &str) -> String {
        let lower = declared.trim().to_lowercase();
        let stripped = precision_suffix().replace_all(&lower, "");
        whitespace().replace_all(stripped.trim(), " ").into_owned()
    }

    fn family_of(&self, normalized: &str) -> Option<usize> {
        self.families
            .iter()
            .position(|family| family.iter().any(|t| t == normalized))
    }

    /// Whether two declared types should not be flagged as a mismatch
    pub fn equivalent(&self, left: &str, right: &str) -> bool {
        let left = Self::normalize(left);
        let right = Self::normalize(right);
        if left == right {
            return true;
        }
        if self.strict {
            return false;
        }
        match (self.family_of(&left), self.family_of(&right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Whether a declared type carries numeric content (used by the row hasher
/// to pick the numeric text canonicalization for type-divergent columns)
pub fn is_numeric_type(declared: &str) -> bool {
    matches!(
        TypeRules::normalize(declared).as_str(),
        "smallint"
            | "int2"
            | "integer"
            | "int"
            | "int4"
            | "bigint"
            | "int8"
            | "smallserial"
            | "serial"
            | "bigserial"
            | "real"
            | "float4"
            | "double precision"
            | "float8"
            | "numeric"
            | "decimal"
    )
}

/// Compare two snapshots under the table/column filter. Pure: no side
/// effects, deterministic for identical inputs.
pub fn diff_schemas(
    left: &SchemaSnapshot,
    right: &SchemaSnapshot,
    options: &CompareOptions,
    rules: &TypeRules,
) -> SchemaDiff {
    // a table whose metadata could not be read on one side is not "missing"
    // there; it is reported as an introspection skip instead
    let unreadable: BTreeSet<&String> = left.skipped.keys().chain(right.skipped.keys()).collect();

    let left_names: BTreeSet<String> = left
        .table_names()
        .filter(|t| options.table_included(t) && !unreadable.contains(t))
        .collect();
    let right_names: BTreeSet<String> = right
        .table_names()
        .filter(|t| options.table_included(t) && !unreadable.contains(t))
        .collect();

    let mut diff = SchemaDiff {
        missing_in_right: left_names.difference(&right_names).cloned().collect(),
        missing_in_left: right_names.difference(&left_names).cloned().collect(),
        tables: BTreeMap::new(),
    };

    for name in left_names.intersection(&right_names) {
        let (Some(left_table), Some(right_table)) = (left.table(name), right.table(name)) else {
            continue;
        };

        let left_cols: BTreeSet<&str> = left_table
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| !options.column_excluded(name, c))
            .collect();
        let right_cols: BTreeSet<&str> = right_table
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| !options.column_excluded(name, c))
            .collect();

        let mut table_diff = TableSchemaDiff {
            missing_columns_right: left_cols
                .difference(&right_cols)
                .map(|c| c.to_string())
                .collect(),
            missing_columns_left: right_cols
                .difference(&left_cols)
                .map(|c| c.to_string())
                .collect(),
            type_mismatches: BTreeMap::new(),
        };

        for col in left_cols.intersection(&right_cols) {
            let (Some(lc), Some(rc)) = (left_table.column(col), right_table.column(col)) else {
                continue;
            };
            if !rules.equivalent(&lc.declared_type, &rc.declared_type) {
                table_diff.type_mismatches.insert(
                    col.to_string(),
                    TypePair {
                        left: lc.declared_type.clone(),
                        right: rc.declared_type.clone(),
                    },
                );
            }
        }

        if !table_diff.is_empty() {
            diff.tables.insert(name.clone(), table_diff);
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DbSide;
    use crate::introspection::{ColumnDef, TableSchema};
    use chrono::Utc;
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
    fn test_normalize_strips_precision() {
        assert_eq!(TypeRules::normalize("VARCHAR(255)"), "varchar");
        assert_eq!(TypeRules::normalize("numeric(10,2)"), "numeric");
        assert_eq!(
            TypeRules::normalize("TIMESTAMP  WITHOUT TIME ZONE"),
            "timestamp without time zone"
        );
    }

    #[test]
    fn test_varchar_family_equivalence() {
        let rules = TypeRules::new(false);
        assert!(rules.equivalent("VARCHAR(255)", "varchar"));
        assert!(rules.equivalent("character varying", "text"));
        assert!(!rules.equivalent("text", "integer"));
    }

    #[test]
    fn test_strict_mode_flags_family_members() {
        let rules = TypeRules::new(true);
        assert!(rules.equivalent("VARCHAR(255)", "varchar(64)"));
        assert!(!rules.equivalent("character varying", "text"));
    }

    #[test]
    fn test_custom_families() {
        let rules = TypeRules::with_families(
            vec![vec!["money".to_string(), "numeric".to_string()]],
            false,
        );
        assert!(rules.equivalent("money", "numeric(12,2)"));
        assert!(!rules.equivalent("money", "text"));
    }

    #[test]
    fn test_numeric_type_detection() {
        assert!(is_numeric_type("integer"));
        assert!(is_numeric_type("NUMERIC(10,2)"));
        assert!(is_numeric_type("double precision"));
        assert!(!is_numeric_type("text"));
        assert!(!is_numeric_type("bytea"));
    }

    #[test]
    fn test_missing_tables_both_directions() {
        let left = snapshot(
            DbSide::Left,
            vec![table("users", &[("id", "integer")]), table("orders", &[("id", "integer")])],
        );
        let right = snapshot(
            DbSide::Right,
            vec![table("users", &[("id", "integer")]), table("payments", &[("id", "integer")])],
        );

        let diff = diff_schemas(&left, &right, &CompareOptions::default(), &TypeRules::new(false));

        assert_eq!(
            diff.missing_in_right,
            ["orders".to_string()].into_iter().collect()
        );
        assert_eq!(
            diff.missing_in_left,
            ["payments".to_string()].into_iter().collect()
        );
        assert!(diff.tables.is_empty());
    }

    #[test]
    fn test_column_drift_and_type_mismatch() {
        let left = snapshot(
            DbSide::Left,
            vec![table(
                "users",
                &[("id", "integer"), ("email", "text"), ("age", "integer")],
            )],
        );
        let right = snapshot(
            DbSide::Right,
            vec![table(
                "users",
                &[("id", "integer"), ("email", "bytea"), ("nickname", "text")],
            )],
        );

        let diff = diff_schemas(&left, &right, &CompareOptions::default(), &TypeRules::new(false));
        let users = diff.tables.get("users").unwrap();

        assert_eq!(
            users.missing_columns_right,
            ["age".to_string()].into_iter().collect()
        );
        assert_eq!(
            users.missing_columns_left,
            ["nickname".to_string()].into_iter().collect()
        );
        assert_eq!(
            users.type_mismatches.get("email").unwrap(),
            &TypePair {
                left: "text".to_string(),
                right: "bytea".to_string()
            }
        );
    }

    #[test]
    fn test_excluded_table_omitted_entirely() {
        let left = snapshot(DbSide::Left, vec![table("scratch", &[("id", "integer")])]);
        let right = snapshot(DbSide::Right, vec![]);

        let mut options = CompareOptions::default();
        options.exclude_tables.insert("scratch".to_string());

        let diff = diff_schemas(&left, &right, &options, &TypeRules::new(false));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_excluded_column_not_reported() {
        let left = snapshot(DbSide::Left, vec![table("users", &[("id", "integer"), ("updated_at", "text")])]);
        let right = snapshot(DbSide::Right, vec![table("users", &[("id", "integer")])]);

        let mut options = CompareOptions::default();
        options
            .exclude_columns
            .entry("users".to_string())
            .or_default()
            .insert("updated_at".to_string());

        let diff = diff_schemas(&left, &right, &options, &TypeRules::new(false));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_unreadable_table_not_reported_missing() {
        // readable on the right, introspection failed on the left: the table
        // is not missing on the left, just unreadable there
        let mut left = snapshot(DbSide::Left, vec![]);
        left.skipped
            .insert("flaky".to_string(), "catalog corruption".to_string());
        let right = snapshot(DbSide::Right, vec![table("flaky", &[("id", "integer")])]);

        let diff = diff_schemas(&left, &right, &CompareOptions::default(), &TypeRules::new(false));
        assert!(diff.missing_in_left.is_empty());
    }

    #[test]
    fn test_identical_snapshots_empty_diff() {
        let tables = vec![table("users", &[("id", "integer"), ("email", "text")])];
        let left = snapshot(DbSide::Left, tables.clone());
        let right = snapshot(DbSide::Right, tables);

        let diff = diff_schemas(&left, &right, &CompareOptions::default(), &TypeRules::new(false));
        assert!(diff.is_empty());
    }
}
