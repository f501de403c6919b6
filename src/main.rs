use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stock_sync::api::{AShareMarketData, EastMoneyClient, FeishuClient, RemoteTable, ThsForecastClient};
use stock_sync::models::Config;
use stock_sync::pipeline::SyncPipeline;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stock_sync=info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging was already initialized");
    }
}

fn build_pipeline(config: Config) -> Result<SyncPipeline> {
    let spot = EastMoneyClient::new(&config.eastmoney_base_url)?;
    let forecast = ThsForecastClient::new(&config.ths_base_url)?;
    let market_data = AShareMarketData::new(spot, forecast);

    let remote_table: Option<Box<dyn RemoteTable>> = match &config.feishu {
        Some(feishu) => Some(Box::new(FeishuClient::new(feishu)?)),
        None => None,
    };

    Ok(SyncPipeline::new(config, Box::new(market_data), remote_table))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            eprintln!("❌ Configuration Error: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("📋 Configuration loaded");

    let pipeline = match build_pipeline(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to initialize clients: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = pipeline.run().await {
        error!("❌ Run failed: {:#}", e);
        std::process::exit(1);
    }
}
