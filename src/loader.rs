//! Reading and writing the worksheet and snapshot files

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::identifier::{normalize, Identifier};
use crate::models::{
    columns, CellValue, CuratedRow, CuratedSheet, EpsForecastRow, EpsIndex, PriceIndex, PriceRecord,
    PriceSnapshotRow,
};

const UTF8_BOM: char = '\u{feff}';

/// Columns a price snapshot must carry
pub const PRICE_SNAPSHOT_COLUMNS: [&str; 3] = ["代码", "最新价", "总市值"];

/// Columns an EPS snapshot must carry
pub const EPS_SNAPSHOT_COLUMNS: [&str; 3] = ["年度", "均值", "股票代码"];

/// Fail when any of `required` is absent from `headers`
fn require_columns<'a, I>(headers: I, required: &[&str], path: &Path) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: Vec<&str> = headers
        .into_iter()
        .map(|h| h.trim_start_matches(UTF8_BOM).trim())
        .collect();
    if present.iter().all(|h| h.is_empty()) {
        bail!("{} has no header row", path.display());
    }

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|column| !present.contains(column))
        .collect();
    if !missing.is_empty() {
        bail!("{} is missing required columns: {}", path.display(), missing.join(", "));
    }
    Ok(())
}

/// Load the curated worksheet
pub fn load_curated_sheet(path: &Path) -> Result<CuratedSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open curated worksheet {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = if i == 0 { h.trim_start_matches(UTF8_BOM) } else { h };
            h.trim().to_string()
        })
        .collect();
    require_columns(headers.iter().map(String::as_str), &[columns::TICKER], path)
        .context("Malformed curated worksheet")?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("Malformed row {} in {}", line + 2, path.display()))?;
        let cells = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), CellValue::from_raw(record.get(i).unwrap_or(""))))
            .collect();
        rows.push(CuratedRow::new(cells));
    }

    info!("📋 Loaded {} curated rows from {}", rows.len(), path.display());
    Ok(CuratedSheet { headers, rows })
}

/// Distinct identifiers of the curated rows, in sheet order
pub fn tracked_identifiers(sheet: &CuratedSheet) -> Vec<Identifier> {
    let mut seen = HashSet::new();
    sheet
        .rows
        .iter()
        .map(CuratedRow::ticker)
        .filter(|ticker| !ticker.trim().is_empty())
        .map(|ticker| normalize(&ticker))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Index snapshot rows by identifier, later rows win
pub fn build_price_index(rows: &[PriceSnapshotRow]) -> PriceIndex {
    rows.iter()
        .map(|row| {
            (
                normalize(&row.code),
                PriceRecord {
                    latest_price: row.latest_price.filter(|v| v.is_finite()),
                    market_cap: row.market_cap.filter(|v| v.is_finite()),
                },
            )
        })
        .collect()
}

/// Index mean EPS of `fiscal_year` by identifier, later rows win
pub fn build_eps_index(rows: &[EpsForecastRow], fiscal_year: i32) -> EpsIndex {
    rows.iter()
        .filter(|row| row.fiscal_year == Some(fiscal_year))
        .map(|row| (normalize(&row.code), row.mean_eps.filter(|v| v.is_finite())))
        .collect()
}

fn read_snapshot<T: serde::de::DeserializeOwned>(
    path: &Path,
    label: &str,
    required: &[&str],
) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {} snapshot {}", label, path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?;
    require_columns(headers.iter(), required, path)
        .with_context(|| format!("Malformed {} snapshot", label))?;

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize().enumerate() {
        let row: T = record.with_context(|| {
            format!("Malformed {} snapshot row {} in {}", label, line + 2, path.display())
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Read the price snapshot rows
pub fn read_price_snapshot(path: &Path) -> Result<Vec<PriceSnapshotRow>> {
    read_snapshot(path, "price", &PRICE_SNAPSHOT_COLUMNS)
}

/// Read the EPS snapshot rows
pub fn read_eps_snapshot(path: &Path) -> Result<Vec<EpsForecastRow>> {
    read_snapshot(path, "EPS", &EPS_SNAPSHOT_COLUMNS)
}

/// Load the price snapshot into a lookup index
pub fn load_price_index(path: &Path) -> Result<PriceIndex> {
    let rows = read_price_snapshot(path)?;
    let index = build_price_index(&rows);
    debug!("Indexed {} prices from {} rows", index.len(), rows.len());
    Ok(index)
}

/// Load the EPS snapshot into a lookup index for one fiscal year
pub fn load_eps_index(path: &Path, fiscal_year: i32) -> Result<EpsIndex> {
    let rows = read_eps_snapshot(path)?;
    let index = build_eps_index(&rows, fiscal_year);
    debug!(
        "Indexed {} {} EPS forecasts from {} rows",
        index.len(),
        fiscal_year,
        rows.len()
    );
    Ok(index)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

fn write_snapshot<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Cache the price snapshot with the headers `load_price_index` reads
pub fn write_price_snapshot(path: &Path, rows: &[PriceSnapshotRow]) -> Result<()> {
    write_snapshot(path, rows)?;
    info!("💾 Saved {} price rows to {}", rows.len(), path.display());
    Ok(())
}

/// Cache the EPS snapshot with the headers `load_eps_index` reads
pub fn write_eps_snapshot(path: &Path, rows: &[EpsForecastRow]) -> Result<()> {
    write_snapshot(path, rows)?;
    info!("💾 Saved {} EPS forecast rows to {}", rows.len(), path.display());
    Ok(())
}

/// Rewrite the worksheet with every column the rows carry
pub fn write_output_sheet(path: &Path, sheet: &CuratedSheet) -> Result<()> {
    ensure_parent_dir(path)?;
    let columns = sheet.columns();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(&columns)?;
    for row in &sheet.rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| row.get(column).map(ToString::to_string).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;

    info!("💾 Wrote {} rows to {}", sheet.rows.len(), path.display());
    Ok(())
}
