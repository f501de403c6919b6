//! End-to-end pipeline runs against in-memory capabilities

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use test_log::test;

use crate::common::fixtures::{
    eps_row, price_row, quick_retry, remote_record, FakeMarketData, RecordingTable, SharedMarketData,
    SharedTable, Workspace, CURATED_CSV,
};
use crate::common::logging::{init_test_logging, log_test_data, log_test_step};
use stock_sync::loader;
use stock_sync::models::FieldValue;
use stock_sync::pipeline::SyncPipeline;
use stock_sync::reconcile::SyncReport;

fn pipeline(
    workspace: &Workspace,
    sync_enabled: bool,
    market: &Arc<FakeMarketData>,
    table: &Arc<RecordingTable>,
) -> SyncPipeline {
    SyncPipeline::new(
        workspace.config(sync_enabled),
        Box::new(SharedMarketData(Arc::clone(market))),
        Some(Box::new(SharedTable(Arc::clone(table)))),
    )
    .with_retry_policies(quick_retry(), quick_retry())
}

fn standard_table() -> RecordingTable {
    RecordingTable::with_records(vec![
        remote_record("rec1", "600519"),
        remote_record("rec2", "002156.SZ"),
        remote_record("rec3", "000001"),
    ])
}

#[test(tokio::test)]
async fn test_full_run_updates_matched_rows() {
    init_test_logging();
    log_test_step("Full run with fresh snapshots");

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData::standard());
    let table = Arc::new(standard_table());

    let summary = pipeline(&workspace, true, &market, &table).run().await.unwrap();
    log_test_data("Run summary", &summary);

    assert_eq!(summary.curated_rows, 3);
    assert!(!summary.prices.from_cache);
    assert_eq!(summary.prices.rows, 3);
    assert_eq!(summary.eps.rows, 3);
    assert_eq!(summary.eps.failed, 0);
    assert_eq!(summary.enrichment.missing_price, 1);
    assert_eq!(
        summary.sync,
        Some(SyncReport { matched: 2, skipped: 1, updated: 2, failed: 0 })
    );
    assert_eq!(market.forecast_calls.load(Ordering::SeqCst), 3);

    let updates = table.received();
    let ids: Vec<&str> = updates.iter().map(|u| u.record_id.as_str()).collect();
    assert_eq!(ids, vec!["rec1", "rec2"]);
    assert_eq!(updates[0].fields["Ticker"], FieldValue::Text("600519".to_string()));
    assert_eq!(updates[0].fields["Current Price"], FieldValue::Float(1700.0));
    assert_eq!(updates[0].fields["Potential Upside %"], FieldValue::Float(17.6));
    assert_eq!(updates[0].fields["Target Low"], FieldValue::Integer(1800));
    assert_eq!(updates[0].fields["Sector|Theme"], FieldValue::Text("白酒".to_string()));
    assert_eq!(updates[1].fields["PE (2025E)"], FieldValue::Text("20.0".to_string()));
    assert_eq!(updates[1].fields["Mid Target"], FieldValue::Float(35.0));

    let config = workspace.config(true);
    assert!(config.price_snapshot_path.exists());
    assert!(config.eps_snapshot_path.exists());

    let written = loader::load_curated_sheet(&config.output_sheet_path).unwrap();
    assert_eq!(written.rows.len(), 3);
    assert_eq!(written.rows[0].numeric("Potential Upside %"), Some(17.6));
    assert_eq!(written.rows[0].numeric("Market Cap (CNY bn)"), Some(21000.0));
    assert_eq!(written.rows[1].numeric("EPS (2025E)"), Some(1.25));
    assert_eq!(written.rows[2].numeric("Current Price"), None);
    assert!(written.rows[2].get("Last Updated").unwrap().to_string().ends_with("CST"));

    let payload: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(workspace.path("payload.json")).unwrap()).unwrap();
    assert_eq!(payload.as_array().map(Vec::len), Some(3));
}

#[test(tokio::test)]
async fn test_cached_snapshots_are_reused() {
    init_test_logging();
    log_test_step("Cached snapshots skip the market data fetch");

    let workspace = Workspace::new(CURATED_CSV);
    let config = workspace.config(false);
    loader::write_price_snapshot(
        &config.price_snapshot_path,
        &[price_row("600519", Some(1650.0), Some(2.0e12))],
    )
    .unwrap();
    loader::write_eps_snapshot(&config.eps_snapshot_path, &[eps_row("600519", 2025, Some(66.0))]).unwrap();

    let market = Arc::new(FakeMarketData { fail_prices: true, fail_forecasts: true, ..FakeMarketData::default() });
    let table = Arc::new(standard_table());

    let summary = pipeline(&workspace, false, &market, &table).run().await.unwrap();

    assert!(summary.prices.from_cache);
    assert!(summary.eps.from_cache);
    assert_eq!(summary.sync, None);
    assert_eq!(market.price_calls.load(Ordering::SeqCst), 0);
    assert_eq!(market.forecast_calls.load(Ordering::SeqCst), 0);
    assert!(table.received().is_empty());

    let written = loader::load_curated_sheet(&config.output_sheet_path).unwrap();
    assert_eq!(written.rows[0].numeric("Current Price"), Some(1650.0));
    assert_eq!(written.rows[0].numeric("PE (2025E)"), Some(25.0));
}

#[test(tokio::test)]
async fn test_corrupt_price_cache_is_refetched() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let config = workspace.config(false);
    std::fs::create_dir_all(config.price_snapshot_path.parent().unwrap()).unwrap();
    std::fs::write(&config.price_snapshot_path, "代码,最新价\n600519,1700,extra\n").unwrap();

    let market = Arc::new(FakeMarketData::standard());
    let table = Arc::new(RecordingTable::default());

    let summary = pipeline(&workspace, false, &market, &table).run().await.unwrap();

    assert!(!summary.prices.from_cache);
    assert_eq!(market.price_calls.load(Ordering::SeqCst), 1);
    assert_eq!(loader::load_price_index(&config.price_snapshot_path).unwrap().len(), 3);
}

#[test(tokio::test)]
async fn test_price_fetch_exhaustion_is_fatal() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData { fail_prices: true, ..FakeMarketData::standard() });
    let table = Arc::new(standard_table());

    let result = pipeline(&workspace, true, &market, &table).run().await;

    assert!(result.is_err());
    assert_eq!(market.price_calls.load(Ordering::SeqCst), 2);
    assert!(!workspace.config(true).output_sheet_path.exists());
    assert!(table.received().is_empty());
}

#[test(tokio::test)]
async fn test_all_forecasts_failing_is_fatal() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData { fail_forecasts: true, ..FakeMarketData::standard() });
    let table = Arc::new(standard_table());

    let error = pipeline(&workspace, true, &market, &table).run().await.unwrap_err();

    assert!(error.to_string().contains("EPS forecast fetch failed"));
    // Three securities, two attempts each
    assert_eq!(market.forecast_calls.load(Ordering::SeqCst), 6);
}

#[test(tokio::test)]
async fn test_no_forecast_rows_is_fatal_and_not_cached() {
    init_test_logging();
    log_test_step("Every security answers with an empty forecast table");

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData { forecasts: HashMap::new(), ..FakeMarketData::standard() });
    let table = Arc::new(standard_table());

    let error = pipeline(&workspace, true, &market, &table).run().await.unwrap_err();

    assert!(error.to_string().contains("No EPS forecast rows"));
    assert_eq!(market.forecast_calls.load(Ordering::SeqCst), 3);
    let config = workspace.config(true);
    assert!(!config.eps_snapshot_path.exists());
    assert!(!config.output_sheet_path.exists());
    assert!(table.received().is_empty());
}

#[test(tokio::test)]
async fn test_header_only_eps_cache_is_refetched() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let config = workspace.config(false);
    std::fs::create_dir_all(config.eps_snapshot_path.parent().unwrap()).unwrap();
    std::fs::write(
        &config.eps_snapshot_path,
        "年度,预测机构数,最小值,均值,最大值,行业平均数,股票代码\n",
    )
    .unwrap();

    let market = Arc::new(FakeMarketData::standard());
    let table = Arc::new(RecordingTable::default());

    let summary = pipeline(&workspace, false, &market, &table).run().await.unwrap();

    assert!(!summary.eps.from_cache);
    assert_eq!(summary.eps.rows, 3);
    assert_eq!(market.forecast_calls.load(Ordering::SeqCst), 3);
    assert!(!loader::read_eps_snapshot(&config.eps_snapshot_path).unwrap().is_empty());
}

#[test(tokio::test)]
async fn test_rejected_row_is_counted_and_run_succeeds() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData::standard());
    let table = Arc::new(RecordingTable {
        reject_record_ids: vec!["rec1".to_string()],
        ..standard_table()
    });

    let summary = pipeline(&workspace, true, &market, &table).run().await.unwrap();

    assert_eq!(
        summary.sync,
        Some(SyncReport { matched: 2, skipped: 1, updated: 1, failed: 1 })
    );
    let received = table.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].record_id, "rec2");
}

#[test(tokio::test)]
async fn test_sync_enabled_without_table_fails() {
    init_test_logging();

    let workspace = Workspace::new(CURATED_CSV);
    let market = Arc::new(FakeMarketData::standard());

    let result = SyncPipeline::new(workspace.config(true), Box::new(SharedMarketData(market)), None)
        .with_retry_policies(quick_retry(), quick_retry())
        .run()
        .await;

    assert!(result.is_err());
    // Enrichment already happened before the sync stage failed
    assert!(workspace.config(true).output_sheet_path.exists());
}
