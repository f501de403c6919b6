//! Conversion of enriched rows into the destination table's field types
//!
//! Number-typed destination fields reject strings and text fields reject
//! numbers, so every field is pinned to one side. `PE` and `EPS` are sent as
//! text even though they are numeric so the table does not reformat them.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::models::{columns, CellValue, CoercedRecord, CuratedRow, FieldValue};

/// Worksheet column → destination field name
const RENAMES: [(&str, &str); 2] = [
    (columns::SECTOR_THEME, "Sector|Theme"),
    (columns::SOURCE_LINK, "Source | Link"),
];

const NUMERIC_FIELDS: [&str; 10] = [
    columns::CURRENT_PRICE,
    columns::MARKET_CAP_BN,
    columns::SAFE_BUY_LOW,
    columns::SAFE_BUY_HIGH,
    columns::EXTREME_SAFE,
    columns::TARGET_LOW,
    columns::TARGET_HIGH,
    columns::MID_TARGET,
    columns::POTENTIAL_UPSIDE,
    columns::STOP_LOSS,
];

const REQUIRED_FIELDS: [&str; 2] = [columns::TICKER, columns::NAME];

/// How a destination field is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    Text,
    /// Not part of the table schema, sent as text
    Unknown,
}

/// Destination field classification for one forecast year
#[derive(Debug, Clone)]
pub struct FieldSchema {
    numeric: HashSet<String>,
    text: HashSet<String>,
}

impl FieldSchema {
    pub fn for_fiscal_year(fiscal_year: i32) -> Self {
        let numeric = NUMERIC_FIELDS.iter().map(|f| f.to_string()).collect();
        let text = [
            columns::TICKER.to_string(),
            columns::NAME.to_string(),
            "Sector|Theme".to_string(),
            columns::pe_column(fiscal_year),
            columns::eps_column(fiscal_year),
            "Source | Link".to_string(),
            columns::NOTES.to_string(),
            columns::LAST_UPDATED.to_string(),
        ]
        .into_iter()
        .collect();

        Self { numeric, text }
    }

    /// Destination name of a worksheet column
    pub fn destination_name(column: &str) -> &str {
        RENAMES
            .iter()
            .find(|(from, _)| *from == column)
            .map(|(_, to)| *to)
            .unwrap_or(column)
    }

    pub fn classify(&self, field: &str) -> FieldKind {
        if self.numeric.contains(field) {
            FieldKind::Numeric
        } else if self.text.contains(field) {
            FieldKind::Text
        } else {
            FieldKind::Unknown
        }
    }

    /// Convert one row. Never fails: unusable values fall back to `0` or `""`.
    pub fn coerce(&self, row: &CuratedRow) -> CoercedRecord {
        row.cells()
            .map(|(column, value)| {
                let field = Self::destination_name(column);
                let coerced = match self.classify(field) {
                    FieldKind::Numeric => numeric_value(value),
                    FieldKind::Text => text_value(value),
                    FieldKind::Unknown => {
                        debug!("Field {} is not in the table schema, sending as text", field);
                        text_value(value)
                    }
                };
                (field.to_string(), coerced)
            })
            .collect()
    }
}

fn numeric_value(value: &CellValue) -> FieldValue {
    match value {
        CellValue::Empty => FieldValue::Integer(0),
        CellValue::Number(v) if v.is_finite() => FieldValue::Float(*v),
        CellValue::Number(_) => FieldValue::Integer(0),
        CellValue::Text(raw) => {
            let raw = raw.trim();
            if raw.contains('.') {
                match raw.parse::<f64>() {
                    Ok(v) if v.is_finite() => FieldValue::Float(v),
                    _ => FieldValue::Integer(0),
                }
            } else {
                raw.parse::<i64>().map(FieldValue::Integer).unwrap_or(FieldValue::Integer(0))
            }
        }
    }
}

fn text_value(value: &CellValue) -> FieldValue {
    match value {
        CellValue::Empty => FieldValue::Text(String::new()),
        CellValue::Number(v) if v.is_nan() => FieldValue::Text(String::new()),
        // Debug keeps the trailing `.0` on whole numbers
        CellValue::Number(v) => FieldValue::Text(format!("{:?}", v)),
        CellValue::Text(s) => FieldValue::Text(s.clone()),
    }
}

/// A coerced record lacking a field the destination needs to identify it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// 1-based position in the payload
    pub row: usize,
    pub field: &'static str,
}

/// Report records without `Ticker` or `Name`. Records are never dropped.
pub fn validate(records: &[CoercedRecord]) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    for (i, record) in records.iter().enumerate() {
        for field in REQUIRED_FIELDS {
            let present = match record.get(field) {
                Some(FieldValue::Text(s)) => !s.trim().is_empty(),
                Some(FieldValue::Integer(n)) => *n != 0,
                Some(FieldValue::Float(v)) => *v != 0.0,
                None => false,
            };
            if !present {
                warn!("⚠️ Row {} is missing required field {}", i + 1, field);
                warnings.push(ValidationWarning { row: i + 1, field });
            }
        }
    }
    warnings
}

#[derive(Serialize)]
struct PayloadEntry<'a> {
    fields: &'a CoercedRecord,
}

/// Write the payload as pretty JSON for inspection
pub fn dump_payload(path: &Path, records: &[CoercedRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let entries: Vec<PayloadEntry<'_>> = records.iter().map(|fields| PayloadEntry { fields }).collect();
    let json = serde_json::to_string_pretty(&entries)?;
    fs::write(path, json).with_context(|| format!("Failed to write payload dump {}", path.display()))?;

    info!("📝 Dumped {} coerced records to {}", records.len(), path.display());
    Ok(())
}
