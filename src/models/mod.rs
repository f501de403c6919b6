use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use crate::identifier::Identifier;

/// Worksheet column names shared by the loader, metric engine and coercion layer
pub mod columns {
    pub const TICKER: &str = "Ticker";
    pub const NAME: &str = "Name";
    pub const SECTOR_THEME: &str = "Sector/Theme";
    pub const SOURCE_LINK: &str = "Source / Link";
    pub const NOTES: &str = "Notes";
    pub const SAFE_BUY_LOW: &str = "Safe Buy Low";
    pub const SAFE_BUY_HIGH: &str = "Safe Buy High";
    pub const EXTREME_SAFE: &str = "Extreme Safe";
    pub const STOP_LOSS: &str = "Stop Loss";
    pub const TARGET_LOW: &str = "Target Low";
    pub const TARGET_HIGH: &str = "Target High";
    pub const CURRENT_PRICE: &str = "Current Price";
    pub const MARKET_CAP_BN: &str = "Market Cap (CNY bn)";
    pub const MID_TARGET: &str = "Mid Target";
    pub const POTENTIAL_UPSIDE: &str = "Potential Upside %";
    pub const LAST_UPDATED: &str = "Last Updated";

    /// `EPS (2025E)` style column for a forecast year
    pub fn eps_column(fiscal_year: i32) -> String {
        format!("EPS ({}E)", fiscal_year)
    }

    /// `PE (2025E)` style column for a forecast year
    pub fn pe_column(fiscal_year: i32) -> String {
        format!("PE ({}E)", fiscal_year)
    }
}

// ============================================================================
// Curated worksheet
// ============================================================================

/// A single worksheet cell
///
/// Cells read from disk stay as text so codes like `002156` keep their
/// leading zeros; numeric columns are parsed when they are needed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Build a cell from raw worksheet text, blank text becomes `Empty`
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(raw.to_string())
        }
    }

    /// Build a numeric cell, missing or non-finite values become `Empty`
    pub fn from_option(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => CellValue::Number(v),
            _ => CellValue::Empty,
        }
    }

    /// True for empty cells and NaN numbers
    pub fn is_null(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Number(v) => v.is_nan(),
            CellValue::Text(_) => false,
        }
    }

    /// Numeric view of the cell, `None` when absent or unparsable
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            CellValue::Empty => return None,
            CellValue::Number(v) => *v,
            CellValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(v) if v.is_nan() => Ok(()),
            CellValue::Number(v) => write!(f, "{}", v),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// One tracked security from the curated worksheet, columns in sheet order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CuratedRow {
    cells: Vec<(String, CellValue)>,
}

impl CuratedRow {
    pub fn new(cells: Vec<(String, CellValue)>) -> Self {
        Self { cells }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Overwrite a column in place, or append it when the sheet lacks it
    pub fn set(&mut self, column: &str, value: CellValue) {
        match self.cells.iter_mut().find(|(name, _)| name == column) {
            Some((_, slot)) => *slot = value,
            None => self.cells.push((column.to_string(), value)),
        }
    }

    /// Raw ticker text, empty when the column is missing
    pub fn ticker(&self) -> String {
        self.get(columns::TICKER)
            .map(|value| value.to_string())
            .unwrap_or_default()
    }

    pub fn numeric(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(CellValue::as_f64)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// The curated worksheet: header order plus rows
#[derive(Debug, Clone, Default)]
pub struct CuratedSheet {
    pub headers: Vec<String>,
    pub rows: Vec<CuratedRow>,
}

impl CuratedSheet {
    /// Header order for writing: original headers, then columns the rows gained
    pub fn columns(&self) -> Vec<String> {
        let mut columns = self.headers.clone();
        for row in &self.rows {
            for (name, _) in row.cells() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.to_string());
                }
            }
        }
        columns
    }
}

/// Metrics attached to a curated row by the metric engine
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetrics {
    pub current_price: Option<f64>,
    pub eps_mean: Option<f64>,
    pub pe: Option<f64>,
    pub market_cap_bn: Option<f64>,
    pub mid_target: Option<f64>,
    pub potential_upside_pct: Option<f64>,
    pub last_updated: String,
}

/// Curated row with its derived metrics already written into the cells
#[derive(Debug, Clone)]
pub struct EnrichedRow {
    pub id: Identifier,
    pub row: CuratedRow,
    pub metrics: DerivedMetrics,
}

// ============================================================================
// Market data snapshots
// ============================================================================

/// One row of the spot price snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshotRow {
    #[serde(rename = "代码")]
    pub code: String,
    #[serde(rename = "名称", default)]
    pub name: String,
    #[serde(rename = "最新价", default, deserialize_with = "csv::invalid_option")]
    pub latest_price: Option<f64>,
    #[serde(rename = "总市值", default, deserialize_with = "csv::invalid_option")]
    pub market_cap: Option<f64>,
}

/// One row of the EPS forecast snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsForecastRow {
    #[serde(rename = "年度", default, deserialize_with = "csv::invalid_option")]
    pub fiscal_year: Option<i32>,
    #[serde(rename = "预测机构数", default, deserialize_with = "csv::invalid_option")]
    pub institutions: Option<u32>,
    #[serde(rename = "最小值", default, deserialize_with = "csv::invalid_option")]
    pub min_eps: Option<f64>,
    #[serde(rename = "均值", default, deserialize_with = "csv::invalid_option")]
    pub mean_eps: Option<f64>,
    #[serde(rename = "最大值", default, deserialize_with = "csv::invalid_option")]
    pub max_eps: Option<f64>,
    #[serde(rename = "行业平均数", default, deserialize_with = "csv::invalid_option")]
    pub industry_avg_eps: Option<f64>,
    #[serde(rename = "股票代码")]
    pub code: String,
}

/// Indexed spot data for one security
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceRecord {
    pub latest_price: Option<f64>,
    pub market_cap: Option<f64>,
}

pub type PriceIndex = HashMap<Identifier, PriceRecord>;

/// Mean EPS for the target fiscal year. A present key with `None` means the
/// forecast row existed but carried no usable mean.
pub type EpsIndex = HashMap<Identifier, Option<f64>>;

// ============================================================================
// Destination table
// ============================================================================

/// Value accepted by a destination field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldValue::Text(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Wire-ready field set keyed by destination field name
pub type CoercedRecord = BTreeMap<String, FieldValue>;

/// Existing row of the destination table
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRecord {
    pub record_id: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl RemoteRecord {
    /// Text of the `Ticker` field.
    ///
    /// Text fields come back either as plain strings or as rich-text segment
    /// arrays (`[{"type":"text","text":"600519"}]`); both are flattened.
    pub fn ticker_text(&self) -> Option<String> {
        let text = match self.fields.get(columns::TICKER)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Array(segments) => segments
                .iter()
                .filter_map(|segment| match segment {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(Value::as_str),
                })
                .collect(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

/// One page of destination rows
#[derive(Debug, Clone, Default)]
pub struct RemoteRecordPage {
    pub records: Vec<RemoteRecord>,
    pub has_more: bool,
    pub total: Option<u64>,
}

/// Field definition of the destination table
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteField {
    pub field_id: String,
    pub field_name: String,
    #[serde(rename = "type")]
    pub field_type: i64,
}

/// Update for an existing destination row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordUpdate {
    pub record_id: String,
    pub fields: CoercedRecord,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the sync run
#[derive(Debug, Clone)]
pub struct Config {
    pub curated_sheet_path: PathBuf,
    pub output_sheet_path: PathBuf,
    pub price_snapshot_path: PathBuf,
    pub eps_snapshot_path: PathBuf,
    pub payload_dump_path: Option<PathBuf>,
    pub target_fiscal_year: i32,
    pub eastmoney_base_url: String,
    pub ths_base_url: String,
    pub eps_requests_per_minute: u32,
    pub sync_enabled: bool,
    pub feishu: Option<FeishuConfig>,
}

/// Credentials and table coordinates for the Feishu Bitable
#[derive(Debug, Clone)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    pub user_access_token: Option<String>,
    pub app_token: String,
    pub table_id: String,
    pub api_base_url: String,
    pub page_size: u32,
    pub update_batch_size: usize,
}

fn lookup_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sync_enabled = parse_flag(lookup("FEISHU_SYNC_ENABLED"));

        // Feishu credentials are only mandatory when the sync stage will run
        let feishu = if sync_enabled {
            Some(FeishuConfig::from_lookup(&lookup)?)
        } else {
            FeishuConfig::from_lookup(&lookup).ok()
        };

        Ok(Config {
            curated_sheet_path: lookup_or(&lookup, "CURATED_SHEET_PATH", "tracked_stocks.csv").into(),
            output_sheet_path: lookup_or(&lookup, "OUTPUT_SHEET_PATH", "tracked_stocks_updated.csv").into(),
            price_snapshot_path: lookup_or(&lookup, "PRICE_SNAPSHOT_PATH", "data/all_stock_price.csv").into(),
            eps_snapshot_path: lookup_or(&lookup, "EPS_SNAPSHOT_PATH", "data/stock_eps.csv").into(),
            payload_dump_path: lookup("PAYLOAD_DUMP_PATH").map(PathBuf::from),
            target_fiscal_year: lookup_or(&lookup, "TARGET_FISCAL_YEAR", "2025")
                .parse()
                .unwrap_or(2025),
            eastmoney_base_url: lookup_or(&lookup, "EASTMONEY_BASE_URL", "https://82.push2.eastmoney.com"),
            ths_base_url: lookup_or(&lookup, "THS_BASE_URL", "https://basic.10jqka.com.cn"),
            eps_requests_per_minute: lookup_or(&lookup, "EPS_REQUESTS_PER_MINUTE", "120")
                .parse()
                .unwrap_or(120),
            sync_enabled,
            feishu,
        })
    }
}

impl FeishuConfig {
    /// Load Feishu settings from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: &F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("{} environment variable required", key))
        };

        let app_token = match lookup("FEISHU_APP_TOKEN").filter(|v| !v.trim().is_empty()) {
            Some(token) => token,
            None => app_token_from_base_url(&required("FEISHU_BASE_URL")?)?,
        };

        Ok(FeishuConfig {
            app_id: required("FEISHU_APP_ID")?,
            app_secret: required("FEISHU_APP_SECRET")?,
            user_access_token: lookup("FEISHU_USER_TOKEN").filter(|v| !v.trim().is_empty()),
            app_token,
            table_id: required("FEISHU_TABLE_ID")?,
            api_base_url: lookup_or(lookup, "FEISHU_API_BASE", "https://open.feishu.cn"),
            page_size: lookup_or(lookup, "FEISHU_PAGE_SIZE", "500").parse().unwrap_or(500),
            update_batch_size: lookup_or(lookup, "FEISHU_UPDATE_BATCH_SIZE", "1")
                .parse::<usize>()
                .unwrap_or(1)
                .max(1),
        })
    }
}

/// Extract the Bitable app token from a share URL such as
/// `https://example.feishu.cn/base/U3iYbe8cGaBrLEso6jMctMVgnVb?table=tbl...`
pub fn app_token_from_base_url(base_url: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("Invalid FEISHU_BASE_URL {}: {}", base_url, e))?;
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("FEISHU_BASE_URL has no app token segment: {}", base_url))
}
