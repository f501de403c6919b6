//! 10jqka (同花顺) consensus forecast client
//!
//! The per-security "worth" page carries several forecast tables; the annual
//! EPS forecast is the first one whose header has both `年度` and `均值`.

use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::debug;

use super::ApiError;
use crate::identifier::Identifier;
use crate::models::EpsForecastRow;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 10jqka forecast page client
pub struct ThsForecastClient {
    client: Client,
    base_url: String,
}

impl ThsForecastClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(BROWSER_USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the annual EPS forecast rows of one security
    pub async fn fetch_eps_forecast(&self, id: &Identifier) -> Result<Vec<EpsForecastRow>, ApiError> {
        let url = format!("{}/new/{}/worth.html", self.base_url, id);
        debug!("Requesting forecast page: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }

        // The site serves GBK and does not always say so
        let html = response.text_with_charset("gbk").await?;
        let rows = parse_forecast_page(&html, id)?;
        debug!("Parsed {} forecast rows for {}", rows.len(), id);
        Ok(rows)
    }
}

fn selector(css: &str) -> Result<Selector, ApiError> {
    Selector::parse(css).map_err(|e| ApiError::Parse(format!("invalid selector {}: {:?}", css, e)))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim()
        .trim_end_matches('元')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Leading digits of a year cell such as `2025` or `2025年`
fn parse_year(text: &str) -> Option<i32> {
    let digits: String = text.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Extract the annual EPS forecast table from a worth page.
///
/// A page without a forecast table yields an empty list: the security simply
/// has no analyst coverage.
pub fn parse_forecast_page(html: &str, id: &Identifier) -> Result<Vec<EpsForecastRow>, ApiError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;

    for table in document.select(&table_sel) {
        let grid: Vec<Vec<String>> = table
            .select(&row_sel)
            .map(|tr| tr.select(&cell_sel).map(cell_text).collect())
            .collect();

        let Some((header, body)) = grid.split_first() else {
            continue;
        };
        let column = |name: &str| header.iter().position(|h| h.contains(name));
        let (Some(year_col), Some(mean_col)) = (column("年度"), column("均值")) else {
            continue;
        };
        let count_col = column("预测机构数");
        let min_col = column("最小值");
        let max_col = column("最大值");
        let industry_col = column("行业平均数");

        let value_at = |cells: &[String], col: Option<usize>| {
            col.and_then(|c| cells.get(c)).and_then(|text| parse_number(text))
        };

        let rows = body
            .iter()
            .filter_map(|cells| {
                let fiscal_year = cells.get(year_col).and_then(|text| parse_year(text))?;
                Some(EpsForecastRow {
                    fiscal_year: Some(fiscal_year),
                    institutions: count_col
                        .and_then(|c| cells.get(c))
                        .and_then(|text| text.trim().parse().ok()),
                    min_eps: value_at(cells.as_slice(), min_col),
                    mean_eps: value_at(cells.as_slice(), Some(mean_col)),
                    max_eps: value_at(cells.as_slice(), max_col),
                    industry_avg_eps: value_at(cells.as_slice(), industry_col),
                    code: id.to_string(),
                })
            })
            .collect();

        return Ok(rows);
    }

    Ok(Vec::new())
}
