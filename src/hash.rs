//! Row hashing
//!
//! Canonicalizes a row's column values into a deterministic byte sequence
//! and digests it with XXH3-128. Identical logical row content on both sides
//! yields identical fingerprints; that is what makes unordered, key-less row
//! comparison possible.
//!
//! Canonicalization rules:
//! - only columns common to both sides (post-filter) contribute, sorted by
//!   name, so the fingerprint ignores column ordering differences;
//! - NULL gets its own tag, distinct from every representable value;
//! - integers widen to i64, floats normalize `-0.0`/NaN before `to_bits`,
//!   numeric text strips insignificant zeros (`1.0` vs `1`);
//! - variable-width payloads are length-prefixed, so `"ab"+"c"` can never
//!   collide with `"a"+"bc"`.

use crate::config::CompareOptions;
use crate::diff::schema::{is_numeric_type, TypeRules};
use crate::introspection::TableSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_postgres::Row;
use xxhash_rust::xxh3::xxh3_128;

/// Fixed-width digest of one canonicalized row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowFingerprint(pub u128);

impl RowFingerprint {
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl std::fmt::Display for RowFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for RowFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RowFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        u128::from_str_radix(&hex, 16)
            .map(RowFingerprint)
            .map_err(serde::de::Error::custom)
    }
}

/// One column value in canonical form. One variant per supported content
/// kind so the encoding below is exhaustive.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

fn canonical_float_bits(value: f64) -> u64 {
    if value == 0.0 {
        // collapses -0.0 and 0.0
        0.0f64.to_bits()
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &ColumnValue) {
    match value {
        ColumnValue::Null => buf.push(TAG_NULL),
        ColumnValue::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        ColumnValue::Int(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        ColumnValue::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&canonical_float_bits(*f).to_le_bytes());
        }
        ColumnValue::Text(s) => {
            buf.push(TAG_TEXT);
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        ColumnValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(b.len() as u64).to_le_bytes());
            buf.extend_from_slice(b);
        }
    }
}

/// Digest an ordered sequence of canonical values
pub fn fingerprint(values: &[ColumnValue]) -> RowFingerprint {
    let mut buf = Vec::with_capacity(values.len() * 16);
    for value in values {
        encode_value(&mut buf, value);
    }
    RowFingerprint(xxh3_128(&buf))
}

/// Canonical text form for numeric content read through a text cast.
/// Strips insignificant fractional zeros so `1.0` and `1` agree.
pub fn normalize_numeric_text(raw: &str) -> String {
    let trimmed = raw.trim();
    // server-produced exponent spellings are already canonical per side
    if trimmed.contains(['e', 'E']) || !trimmed.contains('.') {
        return collapse_negative_zero(trimmed);
    }
    let mut out = trimmed.trim_end_matches('0');
    out = out.trim_end_matches('.');
    collapse_negative_zero(out)
}

fn collapse_negative_zero(s: &str) -> String {
    if s.is_empty() || s == "-" || s == "-0" || s == "0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// How one planned column is read and canonicalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    /// Any integer width, widened to i64 by an `::int8` cast
    Int,
    /// real/double, widened by a `::float8` cast
    Float,
    /// numeric/decimal or numeric-vs-numeric type divergence; text cast plus
    /// numeric normalization
    NumericText,
    Text,
    Bytes,
    /// Anything else; read through a plain `::text` cast
    OtherText,
}

fn native_kind(normalized: &str) -> ValueKind {
    match normalized {
        "boolean" | "bool" => ValueKind::Bool,
        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "smallserial"
        | "serial" | "bigserial" => ValueKind::Int,
        "real" | "float4" | "double precision" | "float8" => ValueKind::Float,
        "numeric" | "decimal" => ValueKind::NumericText,
        "char" | "character" | "bpchar" | "varchar" | "character varying" | "text" | "name" => {
            ValueKind::Text
        }
        "bytea" => ValueKind::Bytes,
        _ => ValueKind::OtherText,
    }
}

/// Pick the kind for a column given both sides' declared types. When the
/// spellings diverge, both sides are read through a text cast so the
/// canonical form agrees; numeric-vs-numeric divergence additionally gets
/// the numeric normalization.
pub fn kind_for(left_type: &str, right_type: &str) -> ValueKind {
    let left = TypeRules::normalize(left_type);
    let right = TypeRules::normalize(right_type);
    if left == right {
        native_kind(&left)
    } else if is_numeric_type(left_type) && is_numeric_type(right_type) {
        ValueKind::NumericText
    } else {
        ValueKind::OtherText
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A planned column: name plus how to read it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanColumn {
    pub name: String,
    pub kind: ValueKind,
}

impl PlanColumn {
    fn projection(&self) -> String {
        let ident = quote_ident(&self.name);
        match self.kind {
            ValueKind::Bool | ValueKind::Text | ValueKind::Bytes => ident,
            ValueKind::Int => format!("{ident}::int8"),
            ValueKind::Float => format!("{ident}::float8"),
            ValueKind::NumericText | ValueKind::OtherText => format!("{ident}::text"),
        }
    }
}

/// The agreed reading plan for one table: the common, post-filter column set
/// in canonical (name-sorted) order, and the projection that reads it
/// identically from both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPlan {
    pub schema: String,
    pub table: String,
    pub columns: Vec<PlanColumn>,
}

impl RowPlan {
    /// Build the plan from both sides' definitions of the same table
    pub fn build(left: &TableSchema, right: &TableSchema, options: &CompareOptions) -> Self {
        let qualified = left.qualified_name();
        let mut columns: Vec<PlanColumn> = left
            .columns
            .iter()
            .filter(|lc| !options.column_excluded(&qualified, &lc.name))
            .filter_map(|lc| {
                right.column(&lc.name).map(|rc| PlanColumn {
                    name: lc.name.clone(),
                    kind: kind_for(&lc.declared_type, &rc.declared_type),
                })
            })
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            schema: left.schema.clone(),
            table: left.name.clone(),
            columns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The streaming query, identical in shape for both sides
    pub fn query(&self) -> String {
        let projection: Vec<String> = self.columns.iter().map(|c| c.projection()).collect();
        format!(
            "SELECT {} FROM {}.{}",
            projection.join(", "),
            quote_ident(&self.schema),
            quote_ident(&self.table)
        )
    }

    /// Canonicalize and digest one streamed row
    pub fn fingerprint_row(&self, row: &Row) -> Result<RowFingerprint, tokio_postgres::Error> {
        let mut values = Vec::with_capacity(self.columns.len());
        for (idx, col) in self.columns.iter().enumerate() {
            values.push(value_from_row(row, idx, col.kind)?);
        }
        Ok(fingerprint(&values))
    }
}

fn value_from_row(
    row: &Row,
    idx: usize,
    kind: ValueKind,
) -> Result<ColumnValue, tokio_postgres::Error> {
    Ok(match kind {
        ValueKind::Bool => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(ColumnValue::Null, ColumnValue::Bool),
        ValueKind::Int => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(ColumnValue::Null, ColumnValue::Int),
        ValueKind::Float => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(ColumnValue::Null, ColumnValue::Float),
        ValueKind::NumericText => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(ColumnValue::Null, |s| {
                ColumnValue::Text(normalize_numeric_text(&s))
            }),
        ValueKind::Text | ValueKind::OtherText => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(ColumnValue::Null, ColumnValue::Text),
        ValueKind::Bytes => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(ColumnValue::Null, ColumnValue::Bytes),
    })
}
