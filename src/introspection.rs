//! Schema extraction
//!
//! Reads table/column metadata from one side into a normalized snapshot.
//! Tables are returned in deterministic (lexicographic) order; a table whose
//! metadata cannot be read is recorded as skipped rather than failing the
//! whole extraction.

use crate::connection::{DbHandle, DbSide};
use crate::error::{CompareError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Column definition within a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
}

/// Table definition: name plus ordered columns. Column names are unique
/// within a table (enforced by the catalog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// `schema.table`, with the `public` prefix elided
    pub fn qualified_name(&self) -> String {
        if self.schema == "public" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The set of table definitions read from one database at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub side: DbSide,
    pub captured_at: DateTime<Utc>,
    /// Sorted by qualified name
    pub tables: Vec<TableSchema>,
    /// Tables whose metadata could not be parsed, with the reason
    pub skipped: BTreeMap<String, String>,
    pub checksum: String,
}

impl SchemaSnapshot {
    /// Content checksum over sorted table/column definitions; two snapshots
    /// with identical structure hash identically regardless of capture time.
    pub fn compute_checksum(tables: &[TableSchema]) -> String {
        let mut hasher = Sha256::new();

        let mut entries: Vec<String> = Vec::new();
        for table in tables {
            for col in &table.columns {
                entries.push(format!(
                    "{}.{}:{}:{}",
                    table.qualified_name(),
                    col.name,
                    col.declared_type,
                    col.nullable
                ));
            }
        }
        entries.sort();

        for entry in &entries {
            hasher.update(entry.as_bytes());
        }

        let result = hasher.finalize();
        format!("{result:x}")
    }

    pub fn table(&self, qualified: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.qualified_name() == qualified)
    }

    pub fn table_names(&self) -> impl Iterator<Item = String> + '_ {
        self.tables.iter().map(|t| t.qualified_name())
    }
}

const TABLES_QUERY: &str = r#"
    SELECT t.table_schema, t.table_name
    FROM information_schema.tables t
    WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND t.table_type = 'BASE TABLE'
    ORDER BY t.table_schema, t.table_name
"#;

const COLUMNS_QUERY: &str = r#"
    SELECT c.column_name, c.data_type, c.is_nullable
    FROM information_schema.columns c
    WHERE c.table_schema = $1 AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// Whether a declared type is suppressed under `ignore_timestamps`
fn is_temporal(declared_type: &str) -> bool {
    let lower = declared_type.to_lowercase();
    lower.starts_with("timestamp") || lower == "date"
}

async fn table_columns(
    client: &deadpool_postgres::Client,
    schema: &str,
    name: &str,
    qualified: &str,
    ignore_timestamps: bool,
) -> Result<Vec<ColumnDef>> {
    let rows = client
        .query(COLUMNS_QUERY, &[&schema, &name])
        .await
        .map_err(|e| CompareError::Introspection {
            table: qualified.to_string(),
            message: e.to_string(),
        })?;

    Ok(rows
        .iter()
        .map(|r| ColumnDef {
            name: r.get("column_name"),
            declared_type: r.get("data_type"),
            nullable: r.get::<_, String>("is_nullable") == "YES",
        })
        .filter(|c| !(ignore_timestamps && is_temporal(&c.declared_type)))
        .collect())
}

/// Extract the full set of user tables from one side.
///
/// Fails with a connection error if the handle cannot produce a working
/// client; individual tables that cannot be introspected land in
/// `snapshot.skipped`.
pub async fn introspect_schema(handle: &DbHandle, ignore_timestamps: bool) -> Result<SchemaSnapshot> {
    let client = handle.client().await?;

    let table_rows = client.query(TABLES_QUERY, &[]).await.map_err(|e| {
        CompareError::Connection(format!("{} table listing failed: {e}", handle.side))
    })?;

    let mut tables = Vec::new();
    let mut skipped = BTreeMap::new();

    for row in table_rows {
        let schema: String = row.get("table_schema");
        let name: String = row.get("table_name");
        let qualified = if schema == "public" {
            name.clone()
        } else {
            format!("{schema}.{name}")
        };

        match table_columns(&client, &schema, &name, &qualified, ignore_timestamps).await {
            Ok(columns) => {
                tables.push(TableSchema {
                    schema,
                    name,
                    columns,
                });
            }
            Err(e) => {
                warn!(table = %qualified, side = %handle.side, error = %e, "failed to introspect table");
                skipped.insert(qualified, e.to_string());
            }
        }
    }

    tables.sort_by_key(|t| t.qualified_name());
    let checksum = SchemaSnapshot::compute_checksum(&tables);

    debug!(
        side = %handle.side,
        tables = tables.len(),
        skipped = skipped.len(),
        "introspected schema"
    );

    Ok(SchemaSnapshot {
        side: handle.side,
        captured_at: Utc::now(),
        tables,
        skipped,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users_table() -> TableSchema {
        TableSchema {
            schema: "public".to_string(),
            name: "users".to_string(),
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    declared_type: "integer".to_string(),
                    nullable: false,
                },
                ColumnDef {
                    name: "email".to_string(),
                    declared_type: "text".to_string(),
                    nullable: true,
                },
            ],
        }
    }

    #[test]
    fn test_checksum_consistency() {
        let tables = vec![users_table()];
        let checksum1 = SchemaSnapshot::compute_checksum(&tables);
        let checksum2 = SchemaSnapshot::compute_checksum(&tables);
        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_checksum_detects_type_change() {
        let mut changed = users_table();
        changed.columns[0].declared_type = "bigint".to_string();
        assert_ne!(
            SchemaSnapshot::compute_checksum(&[users_table()]),
            SchemaSnapshot::compute_checksum(&[changed])
        );
    }

    #[test]
    fn test_qualified_name_elides_public() {
        assert_eq!(users_table().qualified_name(), "users");

        let mut scoped = users_table();
        scoped.schema = "audit".to_string();
        assert_eq!(scoped.qualified_name(), "audit.users");
    }

    #[test]
    fn test_temporal_detection() {
        assert!(is_temporal("timestamp without time zone"));
        assert!(is_temporal("timestamp with time zone"));
        assert!(is_temporal("date"));
        assert!(!is_temporal("text"));
        assert!(!is_temporal("integer"));
    }
}
