use anyhow::{anyhow, bail, Context, Result};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::api::{ApiRateLimiter, MarketDataProvider, RemoteTable};
use crate::coercion::{dump_payload, validate, FieldSchema};
use crate::identifier::Identifier;
use crate::loader;
use crate::metrics::{EnrichmentStats, MetricEngine};
use crate::models::{Config, CoercedRecord, CuratedSheet, EnrichedRow, EpsIndex, PriceIndex};
use crate::reconcile::{reconcile, submit, SyncReport};
use crate::utils::{beijing_now, retry_with_backoff, RetryPolicy};

/// Result of a snapshot stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub rows: usize,
    pub from_cache: bool,
    /// Securities whose fetch was given up on
    pub failed: usize,
}

/// Counts for the whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub curated_rows: usize,
    pub prices: SnapshotReport,
    pub eps: SnapshotReport,
    pub enrichment: EnrichmentStats,
    pub sync: Option<SyncReport>,
    pub duration: Duration,
}

/// Fetch → enrich → upload, strictly in sequence
pub struct SyncPipeline {
    config: Config,
    market_data: Box<dyn MarketDataProvider>,
    remote_table: Option<Box<dyn RemoteTable>>,
    eps_limiter: ApiRateLimiter,
    price_retry: RetryPolicy,
    eps_retry: RetryPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: Config,
        market_data: Box<dyn MarketDataProvider>,
        remote_table: Option<Box<dyn RemoteTable>>,
    ) -> Self {
        let eps_limiter = ApiRateLimiter::new(config.eps_requests_per_minute);
        Self {
            config,
            market_data,
            remote_table,
            eps_limiter,
            price_retry: RetryPolicy::price_snapshot(),
            eps_retry: RetryPolicy::eps_forecast(),
        }
    }

    pub fn with_retry_policies(mut self, price_retry: RetryPolicy, eps_retry: RetryPolicy) -> Self {
        self.price_retry = price_retry;
        self.eps_retry = eps_retry;
        self
    }

    /// Reuse the cached price snapshot or fetch a fresh one.
    /// An exhausted fetch is fatal.
    pub async fn ensure_price_snapshot(&self) -> Result<SnapshotReport> {
        let path = &self.config.price_snapshot_path;
        if path.exists() {
            match loader::read_price_snapshot(path) {
                Ok(rows) => {
                    info!("📂 Using cached price snapshot {} ({} rows)", path.display(), rows.len());
                    return Ok(SnapshotReport { rows: rows.len(), from_cache: true, failed: 0 });
                }
                Err(e) => warn!("⚠️ Cached price snapshot unreadable, refetching: {:#}", e),
            }
        }

        info!("📈 Fetching A-share spot snapshot...");
        let rows = retry_with_backoff(&self.price_retry, "price snapshot", || {
            self.market_data.fetch_price_snapshot()
        })
        .await
        .context("Price snapshot fetch failed")?;

        loader::write_price_snapshot(path, &rows)?;
        Ok(SnapshotReport { rows: rows.len(), from_cache: false, failed: 0 })
    }

    /// Reuse the cached EPS snapshot or fetch forecasts one security at a
    /// time. A security whose fetch is exhausted just has no forecast; the
    /// stage fails when every fetch failed or no forecast rows came back.
    pub async fn ensure_eps_snapshot(&self, ids: &[Identifier]) -> Result<SnapshotReport> {
        let path = &self.config.eps_snapshot_path;
        if path.exists() {
            match loader::read_eps_snapshot(path) {
                Ok(rows) if !rows.is_empty() => {
                    info!("📂 Using cached EPS snapshot {} ({} rows)", path.display(), rows.len());
                    return Ok(SnapshotReport { rows: rows.len(), from_cache: true, failed: 0 });
                }
                Ok(_) => warn!("⚠️ Cached EPS snapshot has no rows, refetching"),
                Err(e) => warn!("⚠️ Cached EPS snapshot unreadable, refetching: {:#}", e),
            }
        }

        info!("📊 Fetching EPS forecasts for {} securities...", ids.len());
        let mut rows = Vec::new();
        let mut failed = 0;

        for (i, id) in ids.iter().enumerate() {
            self.eps_limiter.wait().await;
            let label = format!("EPS forecast {}", id);
            match retry_with_backoff(&self.eps_retry, &label, || self.market_data.fetch_eps_forecast(id)).await {
                Ok(forecast) => {
                    info!("✅ {}/{}: {} - {} forecast rows", i + 1, ids.len(), id, forecast.len());
                    rows.extend(forecast);
                }
                Err(e) => {
                    error!("❌ {}/{}: {} failed - {}", i + 1, ids.len(), id, e);
                    failed += 1;
                }
            }
        }

        if !ids.is_empty() && failed == ids.len() {
            bail!("EPS forecast fetch failed for all {} securities", ids.len());
        }
        // An empty cache would be reused by every later run
        if rows.is_empty() {
            bail!("No EPS forecast rows retrieved for {} securities", ids.len());
        }

        loader::write_eps_snapshot(path, &rows)?;
        Ok(SnapshotReport { rows: rows.len(), from_cache: false, failed })
    }

    /// Attach derived metrics and write the output worksheet
    pub fn enrich(
        &self,
        sheet: &mut CuratedSheet,
        prices: &PriceIndex,
        eps: &EpsIndex,
    ) -> Result<(Vec<EnrichedRow>, EnrichmentStats)> {
        let engine = MetricEngine::new(prices, eps, self.config.target_fiscal_year);
        let (enriched, stats) = engine.enrich_sheet(sheet, beijing_now());
        loader::write_output_sheet(&self.config.output_sheet_path, sheet)?;
        Ok((enriched, stats))
    }

    /// Push enriched rows into the remote table. Returns `None` when the
    /// sync stage is disabled.
    pub async fn sync(&self, enriched: &[EnrichedRow]) -> Result<Option<SyncReport>> {
        if !self.config.sync_enabled {
            info!("⏭️ Remote sync disabled (set FEISHU_SYNC_ENABLED=1 to enable)");
            return Ok(None);
        }

        let table = self
            .remote_table
            .as_deref()
            .ok_or_else(|| anyhow!("Remote sync enabled but no remote table configured"))?;

        let schema = FieldSchema::for_fiscal_year(self.config.target_fiscal_year);
        let rows: Vec<(Identifier, CoercedRecord)> = enriched
            .iter()
            .map(|e| (e.id.clone(), schema.coerce(&e.row)))
            .collect();

        let records: Vec<CoercedRecord> = rows.iter().map(|(_, r)| r.clone()).collect();
        let warnings = validate(&records);
        if !warnings.is_empty() {
            warn!("⚠️ {} rows have missing required fields", warnings.len());
        }
        if let Some(dump_path) = &self.config.payload_dump_path {
            dump_payload(dump_path, &records)?;
        }

        info!("☁️ Reading remote table...");
        let page = table
            .list_records()
            .await
            .context("Failed to list remote records")?;
        info!("📋 Remote table has {} records", page.records.len());

        let plan = reconcile(&rows, &page.records);
        let batch_size = self
            .config
            .feishu
            .as_ref()
            .map(|f| f.update_batch_size)
            .unwrap_or(1);

        Ok(Some(submit(&plan, table, batch_size).await))
    }

    /// Run every stage, stopping at the first stage that fails
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        info!("🚀 Starting stock sync for fiscal year {}", self.config.target_fiscal_year);

        let mut sheet = loader::load_curated_sheet(&self.config.curated_sheet_path)?;
        let ids = loader::tracked_identifiers(&sheet);

        info!("📈 Step 1: price snapshot");
        let prices_report = self.ensure_price_snapshot().await?;

        info!("📊 Step 2: EPS snapshot");
        let eps_report = self.ensure_eps_snapshot(&ids).await?;

        let prices = loader::load_price_index(&self.config.price_snapshot_path)?;
        let eps = loader::load_eps_index(&self.config.eps_snapshot_path, self.config.target_fiscal_year)?;

        info!("🧮 Step 3: enrich worksheet");
        let curated_rows = sheet.rows.len();
        let (enriched, enrichment) = self.enrich(&mut sheet, &prices, &eps)?;

        info!("☁️ Step 4: remote sync");
        let sync = self.sync(&enriched).await?;

        let summary = RunSummary {
            curated_rows,
            prices: prices_report,
            eps: eps_report,
            enrichment,
            sync,
            duration: started.elapsed(),
        };
        log_summary(&summary);
        Ok(summary)
    }
}

fn log_summary(summary: &RunSummary) {
    info!("🎉 Run completed in {:.1}s", summary.duration.as_secs_f64());
    info!(
        "   Curated rows: {} ({} without price, {} without EPS)",
        summary.curated_rows, summary.enrichment.missing_price, summary.enrichment.missing_eps
    );
    info!(
        "   Price snapshot: {} rows{}",
        summary.prices.rows,
        if summary.prices.from_cache { " (cached)" } else { "" }
    );
    info!(
        "   EPS snapshot: {} rows{}, {} securities failed",
        summary.eps.rows,
        if summary.eps.from_cache { " (cached)" } else { "" },
        summary.eps.failed
    );
    match &summary.sync {
        Some(report) => info!(
            "   Sync: {} matched, {} updated, {} failed, {} skipped",
            report.matched, report.updated, report.failed, report.skipped
        ),
        None => info!("   Sync: skipped"),
    }
}
