//! Column type classification and cell encoding.
//!
//! # Architecture
//!
//! Encoding a driver row uses a two-phase approach:
//! 1. `FieldKind` classifies each column once, from the driver's type name
//! 2. Backend-specific encoders copy every cell into a `ResultTableBuilder`
//!
//! Fixed-width kinds are stored little-endian at their column width so the
//! `Row` accessors can check the width of what they read. Everything else is
//! stored as the exact bytes the driver returned.

use crate::config::Backend;
use crate::db::result::{self, Column, ResultTableBuilder};
use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::{Row, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical kind of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One byte, zero or one
    Boolean,
    /// Two's complement (or unsigned) integer of `width` bytes
    Integer { width: usize, unsigned: bool },
    /// IEEE 754 float of `width` bytes
    Float { width: usize },
    /// Exact numeric, stored as its text form
    Decimal,
    /// Date, time or timestamp, stored as text
    Temporal,
    Text,
    Binary,
    Json,
    /// No type information (expression columns, NULL literals)
    Null,
}

impl FieldKind {
    /// Width of every non-NULL cell of this kind, if fixed.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Boolean => Some(1),
            Self::Integer { width, .. } => Some(*width),
            Self::Float { width } => Some(*width),
            _ => None,
        }
    }
}

/// Classify a database type name into a field kind.
pub fn classify(type_name: &str, backend: Backend) -> FieldKind {
    let lower = type_name.trim().to_lowercase();
    match backend {
        Backend::MySql => classify_mysql(&lower),
        Backend::SQLite => classify_sqlite(&lower),
    }
}

fn classify_mysql(lower: &str) -> FieldKind {
    if lower == "bool" || lower == "boolean" {
        return FieldKind::Boolean;
    }

    // Decimal/Numeric - check first as it overlaps with integer names
    if lower.contains("decimal") || lower.contains("numeric") {
        return FieldKind::Decimal;
    }

    let unsigned = lower.contains("unsigned");
    let width = if lower.starts_with("tinyint") {
        Some(1)
    } else if lower.starts_with("smallint") {
        Some(2)
    } else if lower.starts_with("mediumint") || lower.starts_with("int") {
        Some(4)
    } else if lower.starts_with("bigint") {
        Some(8)
    } else {
        None
    };
    if let Some(width) = width {
        return FieldKind::Integer { width, unsigned };
    }
    if lower == "year" {
        return FieldKind::Integer {
            width: 2,
            unsigned: true,
        };
    }

    if lower.starts_with("float") {
        return FieldKind::Float { width: 4 };
    }
    if lower.starts_with("double") || lower == "real" {
        return FieldKind::Float { width: 8 };
    }

    match lower {
        "json" => FieldKind::Json,
        "datetime" | "timestamp" | "date" | "time" => FieldKind::Temporal,
        "bit" | "geometry" => FieldKind::Binary,
        "null" => FieldKind::Null,
        _ if lower.contains("blob") || lower.contains("binary") => FieldKind::Binary,
        // varchar, char, text, enum, set
        _ => FieldKind::Text,
    }
}

/// SQLite affinity rules, with BOOLEAN and date/time names kept apart.
fn classify_sqlite(lower: &str) -> FieldKind {
    if lower.is_empty() || lower == "null" {
        return FieldKind::Null;
    }
    if lower == "bool" || lower == "boolean" {
        return FieldKind::Boolean;
    }
    if lower.contains("int") {
        return FieldKind::Integer {
            width: 8,
            unsigned: false,
        };
    }
    if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        return FieldKind::Text;
    }
    if lower.contains("blob") {
        return FieldKind::Binary;
    }
    if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        return FieldKind::Float { width: 8 };
    }
    if lower.contains("date") || lower.contains("time") {
        return FieldKind::Temporal;
    }
    if lower == "json" {
        return FieldKind::Json;
    }
    if lower.contains("decimal") {
        return FieldKind::Decimal;
    }
    // SQLite's NUMERIC affinity is effectively a float
    FieldKind::Float { width: 8 }
}

/// Build column metadata from driver column descriptions.
pub(crate) fn describe_columns<C: sqlx::Column>(columns: &[C], backend: Backend) -> Vec<Column> {
    columns
        .iter()
        .map(|col| Column::new(col.name(), col.type_info().name(), backend))
        .collect()
}

fn check_width<R: Row>(row: &R, columns: &[Column]) -> DbResult<()> {
    if row.len() != columns.len() {
        return Err(DbError::corruption(format!(
            "row has {} fields, statement describes {}",
            row.len(),
            columns.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Database-Specific Encoders
// =============================================================================

pub(crate) mod mysql {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use sqlx::mysql::MySqlRow;

    /// Copy every cell of `row` into the builder and finish the row.
    pub fn encode_row(
        row: &MySqlRow,
        columns: &[Column],
        builder: &mut ResultTableBuilder,
    ) -> DbResult<()> {
        check_width(row, columns)?;
        for (idx, column) in columns.iter().enumerate() {
            if row.try_get_raw(idx)?.is_null() {
                builder.push_null();
                continue;
            }
            match column.kind {
                FieldKind::Boolean => {
                    let v: i64 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&[(v != 0) as u8]);
                }
                FieldKind::Integer {
                    width,
                    unsigned: true,
                } => {
                    let v: u64 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&v.to_le_bytes()[..width]);
                }
                FieldKind::Integer {
                    width,
                    unsigned: false,
                } => {
                    let v: i64 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&v.to_le_bytes()[..width]);
                }
                FieldKind::Float { width: 4 } => {
                    let v: f32 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&v.to_le_bytes());
                }
                FieldKind::Float { .. } => {
                    let v: f64 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&v.to_le_bytes());
                }
                FieldKind::Temporal => {
                    let text = temporal_text(row, idx, &column.type_name)?;
                    builder.push_bytes(text.as_bytes());
                }
                _ => {
                    let v: &[u8] = row.try_get_unchecked(idx)?;
                    builder.push_bytes(v);
                }
            }
        }
        builder.finish_row()
    }

    /// Render a temporal cell as `YYYY-MM-DD HH:MM:SS[.ffffff]` style text.
    fn temporal_text(row: &MySqlRow, idx: usize, type_name: &str) -> DbResult<String> {
        let decoded = match type_name.to_lowercase().as_str() {
            "date" => row
                .try_get_unchecked::<NaiveDate, _>(idx)
                .map(|d| d.format("%Y-%m-%d").to_string()),
            "time" => row
                .try_get_unchecked::<NaiveTime, _>(idx)
                .map(|t| t.format("%H:%M:%S%.f").to_string()),
            _ => row
                .try_get_unchecked::<NaiveDateTime, _>(idx)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        };

        match decoded {
            Ok(text) => Ok(text),
            // Zero dates and out-of-range TIME values arrive as text already
            Err(err) => {
                let raw: &[u8] = row.try_get_unchecked(idx)?;
                std::str::from_utf8(raw)
                    .map(str::to_string)
                    .map_err(|_| DbError::decode(idx, err.to_string()))
            }
        }
    }
}

pub(crate) mod sqlite {
    use super::*;
    use sqlx::sqlite::SqliteRow;

    enum Storage {
        Integer,
        Real,
        Bytes,
    }

    /// Copy every cell of `row` into the builder and finish the row.
    ///
    /// SQLite is dynamically typed, so the storage class of each value
    /// decides the encoding; the declared kind only narrows booleans.
    pub fn encode_row(
        row: &SqliteRow,
        columns: &[Column],
        builder: &mut ResultTableBuilder,
    ) -> DbResult<()> {
        check_width(row, columns)?;
        for (idx, column) in columns.iter().enumerate() {
            let value = row.try_get_raw(idx)?;
            if value.is_null() {
                builder.push_null();
                continue;
            }
            let type_info = value.type_info();
            let storage = match type_info.name() {
                "INTEGER" | "BOOLEAN" => Storage::Integer,
                "REAL" => Storage::Real,
                "TEXT" | "BLOB" => Storage::Bytes,
                _ => match column.kind {
                    FieldKind::Boolean | FieldKind::Integer { .. } => Storage::Integer,
                    FieldKind::Float { .. } => Storage::Real,
                    _ => Storage::Bytes,
                },
            };

            match storage {
                Storage::Integer => {
                    let v: i64 = row.try_get_unchecked(idx)?;
                    if column.kind == FieldKind::Boolean {
                        builder.push_bytes(&[(v != 0) as u8]);
                    } else {
                        builder.push_bytes(&v.to_le_bytes());
                    }
                }
                Storage::Real => {
                    let v: f64 = row.try_get_unchecked(idx)?;
                    builder.push_bytes(&v.to_le_bytes());
                }
                Storage::Bytes => {
                    let v: &[u8] = row.try_get_unchecked(idx)?;
                    builder.push_bytes(v);
                }
            }
        }
        builder.finish_row()
    }
}

// =============================================================================
// JSON Rendering
// =============================================================================

/// Render bytes as a JSON string: UTF-8 text as is, anything else base64.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    if decode_binary {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

fn integer_json(bytes: &[u8], unsigned: bool) -> Option<JsonValue> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    if unsigned {
        return Some(JsonValue::from(u64::from_le_bytes(buf)));
    }
    // Sign-extend narrower widths
    let shift = 64 - 8 * bytes.len() as u32;
    Some(JsonValue::from((i64::from_le_bytes(buf) << shift) >> shift))
}

fn float_json(bytes: &[u8]) -> Option<JsonValue> {
    let value = match bytes.len() {
        4 => f32::from_le_bytes(bytes.try_into().ok()?) as f64,
        8 => f64::from_le_bytes(bytes.try_into().ok()?),
        _ => return None,
    };
    Some(
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(value.to_string())),
    )
}

/// Render one cell as JSON according to its column kind.
pub fn cell_to_json(row: &result::Row<'_>, field: usize) -> DbResult<JsonValue> {
    let column = row.column(field)?;
    let Some(bytes) = row.raw(field)? else {
        return Ok(JsonValue::Null);
    };

    let width = column.kind.fixed_width();
    let rendered = match column.kind {
        // A cell off its column's width is shown as bytes, not guessed at
        _ if width.is_some_and(|w| w != bytes.len()) => None,
        FieldKind::Boolean => Some(JsonValue::Bool(bytes[0] != 0)),
        FieldKind::Integer { unsigned, .. } => integer_json(bytes, unsigned),
        FieldKind::Float { .. } => float_json(bytes),
        FieldKind::Json => serde_json::from_slice(bytes).ok(),
        FieldKind::Binary => Some(decode_binary_value(bytes, false)),
        _ => None,
    };
    Ok(rendered.unwrap_or_else(|| decode_binary_value(bytes, true)))
}

/// Render a row as a JSON object keyed by column name.
pub fn row_to_json(row: &result::Row<'_>) -> DbResult<serde_json::Map<String, JsonValue>> {
    (0..row.field_count())
        .map(|field| Ok((row.column(field)?.name.clone(), cell_to_json(row, field)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_mysql_integers() {
        assert_eq!(
            classify("TINYINT", Backend::MySql),
            FieldKind::Integer {
                width: 1,
                unsigned: false
            }
        );
        assert_eq!(
            classify("SMALLINT UNSIGNED", Backend::MySql),
            FieldKind::Integer {
                width: 2,
                unsigned: true
            }
        );
        assert_eq!(
            classify("MEDIUMINT", Backend::MySql),
            FieldKind::Integer {
                width: 4,
                unsigned: false
            }
        );
        assert_eq!(
            classify("INT", Backend::MySql),
            FieldKind::Integer {
                width: 4,
                unsigned: false
            }
        );
        assert_eq!(
            classify("BIGINT UNSIGNED", Backend::MySql),
            FieldKind::Integer {
                width: 8,
                unsigned: true
            }
        );
        assert_eq!(
            classify("YEAR", Backend::MySql),
            FieldKind::Integer {
                width: 2,
                unsigned: true
            }
        );
    }

    #[test]
    fn test_classify_mysql_other_kinds() {
        assert_eq!(classify("BOOLEAN", Backend::MySql), FieldKind::Boolean);
        assert_eq!(classify("FLOAT", Backend::MySql), FieldKind::Float { width: 4 });
        assert_eq!(classify("DOUBLE", Backend::MySql), FieldKind::Float { width: 8 });
        assert_eq!(classify("DECIMAL", Backend::MySql), FieldKind::Decimal);
        assert_eq!(classify("DATETIME", Backend::MySql), FieldKind::Temporal);
        assert_eq!(classify("VARBINARY", Backend::MySql), FieldKind::Binary);
        assert_eq!(classify("MEDIUMBLOB", Backend::MySql), FieldKind::Binary);
        assert_eq!(classify("JSON", Backend::MySql), FieldKind::Json);
        assert_eq!(classify("VARCHAR", Backend::MySql), FieldKind::Text);
        assert_eq!(classify("ENUM", Backend::MySql), FieldKind::Text);
    }

    #[test]
    fn test_classify_sqlite_affinity() {
        assert_eq!(
            classify("INTEGER", Backend::SQLite),
            FieldKind::Integer {
                width: 8,
                unsigned: false
            }
        );
        assert_eq!(classify("BOOLEAN", Backend::SQLite), FieldKind::Boolean);
        assert_eq!(classify("VARCHAR(255)", Backend::SQLite), FieldKind::Text);
        assert_eq!(classify("BLOB", Backend::SQLite), FieldKind::Binary);
        assert_eq!(classify("REAL", Backend::SQLite), FieldKind::Float { width: 8 });
        assert_eq!(classify("DATETIME", Backend::SQLite), FieldKind::Temporal);
        assert_eq!(classify("NULL", Backend::SQLite), FieldKind::Null);
        // SQLite NUMERIC is a float
        assert_eq!(classify("numeric", Backend::SQLite), FieldKind::Float { width: 8 });
    }

    fn one_row_table(columns: Vec<Column>, cells: &[Option<&[u8]>]) -> result::ResultTable {
        let mut builder = ResultTableBuilder::new(columns);
        for cell in cells {
            match cell {
                Some(bytes) => builder.push_bytes(bytes),
                None => builder.push_null(),
            }
        }
        builder.finish_row().unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_row_to_json() {
        let table = one_row_table(
            vec![
                Column::new("uid", "INT UNSIGNED", Backend::MySql),
                Column::new("delta", "SMALLINT", Backend::MySql),
                Column::new("seen", "BOOLEAN", Backend::MySql),
                Column::new("subject", "VARCHAR", Backend::MySql),
                Column::new("body", "BLOB", Backend::MySql),
                Column::new("flags", "JSON", Backend::MySql),
                Column::new("deleted", "DATETIME", Backend::MySql),
            ],
            &[
                Some(&7u32.to_le_bytes()[..]),
                Some(&(-2i16).to_le_bytes()[..]),
                Some(&[1u8][..]),
                Some(&b"Hello"[..]),
                Some(&b"hi"[..]),
                Some(&br#"["\\Seen"]"#[..]),
                None,
            ],
        );
        let row = table.get_row(0).unwrap();
        let json = row_to_json(&row).unwrap();
        assert_eq!(json["uid"], JsonValue::from(7u64));
        assert_eq!(json["delta"], JsonValue::from(-2i64));
        assert_eq!(json["seen"], JsonValue::Bool(true));
        assert_eq!(json["subject"], JsonValue::String("Hello".to_string()));
        assert_eq!(json["body"], JsonValue::String("aGk=".to_string()));
        assert!(json["flags"].is_array());
        assert_eq!(json["deleted"], JsonValue::Null);
    }

    #[test]
    fn test_off_width_cell_renders_as_bytes() {
        let table = one_row_table(
            vec![Column::new("uid", "INT", Backend::MySql)],
            &[Some(&[0xFFu8, 0xFE][..])],
        );
        let row = table.get_row(0).unwrap();
        assert_eq!(
            cell_to_json(&row, 0).unwrap(),
            JsonValue::String("//4=".to_string())
        );
    }

    #[test]
    fn test_non_utf8_cells_render_as_base64() {
        let bytes: &[u8] = &[0xFF, 0xFE, 0x00, 0x01];
        let result = decode_binary_value(bytes, true);
        assert_eq!(result, JsonValue::String("//4AAQ==".to_string()));
    }

    #[test]
    fn test_float_json_widths() {
        assert_eq!(float_json(&0.5f32.to_le_bytes()), Some(JsonValue::from(0.5)));
        assert_eq!(float_json(&2.25f64.to_le_bytes()), Some(JsonValue::from(2.25)));
        assert_eq!(float_json(&[0u8; 3]), None);
    }

    #[test]
    fn test_fixed_width() {
        assert_eq!(FieldKind::Boolean.fixed_width(), Some(1));
        assert_eq!(
            FieldKind::Integer {
                width: 2,
                unsigned: false
            }
            .fixed_width(),
            Some(2)
        );
        assert_eq!(FieldKind::Float { width: 4 }.fixed_width(), Some(4));
        assert_eq!(FieldKind::Text.fixed_width(), None);
        assert_eq!(FieldKind::Decimal.fixed_width(), None);
    }
}
