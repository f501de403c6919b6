use chrono::{DateTime, FixedOffset};
use tracing::{debug, info};

use crate::identifier::{normalize, Identifier};
use crate::models::{
    columns, CellValue, CuratedRow, CuratedSheet, DerivedMetrics, EnrichedRow, EpsIndex, PriceIndex,
};
use crate::utils::LAST_UPDATED_FORMAT;

/// Raw market cap units per hundred million (亿)
const HUNDRED_MILLION: f64 = 1e8;

/// Round half away from zero to one decimal place
pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Rows of a sheet that lacked an input, for the enrichment summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub rows: usize,
    pub missing_price: usize,
    pub missing_eps: usize,
    pub missing_targets: usize,
}

/// Joins curated rows with the price and EPS indices
pub struct MetricEngine<'a> {
    prices: &'a PriceIndex,
    eps: &'a EpsIndex,
    fiscal_year: i32,
    eps_column: String,
    pe_column: String,
}

impl<'a> MetricEngine<'a> {
    pub fn new(prices: &'a PriceIndex, eps: &'a EpsIndex, fiscal_year: i32) -> Self {
        Self {
            prices,
            eps,
            fiscal_year,
            eps_column: columns::eps_column(fiscal_year),
            pe_column: columns::pe_column(fiscal_year),
        }
    }

    /// Compute the metrics of one row. Missing inputs only null out the
    /// metrics that depend on them.
    pub fn compute(&self, id: &Identifier, row: &CuratedRow, stamped_at: DateTime<FixedOffset>) -> DerivedMetrics {
        let price_record = self.prices.get(id).copied().unwrap_or_default();
        let current_price = price_record.latest_price.and_then(finite);
        let eps_mean = self.eps.get(id).copied().flatten().and_then(finite);

        let pe = match (current_price, eps_mean) {
            (Some(price), Some(eps)) if eps != 0.0 => finite(price / eps),
            _ => None,
        };

        let market_cap_bn = price_record
            .market_cap
            .and_then(|cap| finite(cap / HUNDRED_MILLION));

        let mid_target = match (row.numeric(columns::TARGET_LOW), row.numeric(columns::TARGET_HIGH)) {
            (Some(low), Some(high)) => finite((low + high) / 2.0),
            _ => None,
        };

        let potential_upside_pct = match (current_price, mid_target) {
            (Some(price), Some(mid)) if price != 0.0 => {
                finite(round_one_decimal((mid / price - 1.0) * 100.0))
            }
            _ => None,
        };

        DerivedMetrics {
            current_price,
            eps_mean,
            pe,
            market_cap_bn,
            mid_target,
            potential_upside_pct,
            last_updated: stamped_at.format(LAST_UPDATED_FORMAT).to_string(),
        }
    }

    /// Attach the derived columns to a row
    pub fn enrich(&self, mut row: CuratedRow, stamped_at: DateTime<FixedOffset>) -> EnrichedRow {
        let id = normalize(&row.ticker());
        let metrics = self.compute(&id, &row, stamped_at);

        row.set(columns::CURRENT_PRICE, CellValue::from_option(metrics.current_price));
        row.set(&self.eps_column, CellValue::from_option(metrics.eps_mean));
        row.set(&self.pe_column, CellValue::from_option(metrics.pe));
        row.set(columns::MARKET_CAP_BN, CellValue::from_option(metrics.market_cap_bn));
        row.set(columns::MID_TARGET, CellValue::from_option(metrics.mid_target));
        row.set(columns::POTENTIAL_UPSIDE, CellValue::from_option(metrics.potential_upside_pct));
        row.set(columns::LAST_UPDATED, CellValue::Text(metrics.last_updated.clone()));

        debug!(
            "{}: price={:?} eps={:?} pe={:?} upside={:?}",
            id, metrics.current_price, metrics.eps_mean, metrics.pe, metrics.potential_upside_pct
        );

        EnrichedRow { id, row, metrics }
    }

    /// Enrich every row of the sheet in place, one timestamp for the whole run
    pub fn enrich_sheet(
        &self,
        sheet: &mut CuratedSheet,
        stamped_at: DateTime<FixedOffset>,
    ) -> (Vec<EnrichedRow>, EnrichmentStats) {
        let mut stats = EnrichmentStats::default();
        let mut enriched = Vec::with_capacity(sheet.rows.len());

        for row in sheet.rows.drain(..) {
            let result = self.enrich(row, stamped_at);
            stats.rows += 1;
            if result.metrics.current_price.is_none() {
                stats.missing_price += 1;
            }
            if result.metrics.eps_mean.is_none() {
                stats.missing_eps += 1;
            }
            if result.metrics.mid_target.is_none() {
                stats.missing_targets += 1;
            }
            enriched.push(result);
        }

        sheet.rows = enriched.iter().map(|e| e.row.clone()).collect();

        info!(
            "🧮 Enriched {} rows ({} without price, {} without {} EPS, {} without targets)",
            stats.rows, stats.missing_price, stats.missing_eps, self.fiscal_year, stats.missing_targets
        );
        (enriched, stats)
    }
}
