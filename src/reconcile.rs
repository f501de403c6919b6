use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::api::RemoteTable;
use crate::identifier::Identifier;
use crate::models::{columns, CoercedRecord, FieldValue, RecordUpdate, RemoteRecord};

/// Remote `Ticker` text → record id. Later records win, empty tickers are ignored.
pub fn build_remote_index(records: &[RemoteRecord]) -> HashMap<String, String> {
    records
        .iter()
        .filter_map(|record| record.ticker_text().map(|ticker| (ticker, record.record_id.clone())))
        .collect()
}

/// Updates to send and curated rows with no remote counterpart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub updates: Vec<RecordUpdate>,
    pub skipped: Vec<Identifier>,
}

/// Outcome of the sync stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub matched: usize,
    pub skipped: usize,
    pub updated: usize,
    pub failed: usize,
}

fn ticker_key(record: &CoercedRecord) -> Option<&str> {
    record
        .get(columns::TICKER)
        .and_then(FieldValue::as_text)
        .filter(|t| !t.is_empty())
}

/// Match coerced rows to remote records by `Ticker`, in curated order.
/// Rows without a match are skipped; nothing is ever created.
pub fn reconcile(rows: &[(Identifier, CoercedRecord)], remote_records: &[RemoteRecord]) -> ReconcilePlan {
    let remote_index = build_remote_index(remote_records);
    let mut plan = ReconcilePlan::default();

    for (id, fields) in rows {
        match ticker_key(fields).and_then(|ticker| remote_index.get(ticker)) {
            Some(record_id) => {
                debug!("{} → {}", id, record_id);
                plan.updates.push(RecordUpdate {
                    record_id: record_id.clone(),
                    fields: fields.clone(),
                });
            }
            None => {
                warn!("⚠️ {} not found in remote table, skipping", id);
                plan.skipped.push(id.clone());
            }
        }
    }

    plan
}

/// Send the planned updates, `batch_size` rows per call. A rejected call
/// marks its rows failed and the remaining calls still go out.
pub async fn submit(plan: &ReconcilePlan, table: &dyn RemoteTable, batch_size: usize) -> SyncReport {
    let mut report = SyncReport {
        matched: plan.updates.len(),
        skipped: plan.skipped.len(),
        ..SyncReport::default()
    };

    for chunk in plan.updates.chunks(batch_size.max(1)) {
        match table.batch_update_records(chunk).await {
            Ok(()) => {
                report.updated += chunk.len();
                for update in chunk {
                    debug!("✅ Updated record {}", update.record_id);
                }
            }
            Err(e) => {
                report.failed += chunk.len();
                let ids: Vec<&str> = chunk.iter().map(|u| u.record_id.as_str()).collect();
                error!("❌ Update failed for {}: {}", ids.join(", "), e);
            }
        }
    }

    info!(
        "🔄 Sync finished: {} matched, {} updated, {} failed, {} skipped",
        report.matched, report.updated, report.failed, report.skipped
    );
    report
}
