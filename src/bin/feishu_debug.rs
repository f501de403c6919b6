use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stock_sync::api::{FeishuClient, RemoteTable};
use stock_sync::models::{columns, CoercedRecord, FeishuConfig, FieldValue, RecordUpdate};
use stock_sync::utils::{beijing_now, LAST_UPDATED_FORMAT};

#[derive(Parser, Debug)]
#[command(name = "feishu-debug")]
#[command(about = "Inspect the Feishu Bitable the sync writes to")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List table fields with their type codes
    Fields,

    /// Print the first records of the table
    Records {
        #[arg(short, long, default_value_t = 5)]
        limit: u32,
    },

    /// Update only the Last Updated field of one record
    Touch {
        record_id: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stock_sync=info,feishu_debug=info"));
    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_env_filter(filter).finish())?;

    let args = Args::parse();
    let config = FeishuConfig::from_env()?;
    let client = FeishuClient::new(&config)?;
    info!("🔍 Table {} in app {}", config.table_id, config.app_token);

    match args.command {
        Command::Fields => {
            let fields = client.list_fields().await?;
            println!("{} fields:", fields.len());
            for field in fields {
                println!("  {:<24} type={:<3} id={}", field.field_name, field.field_type, field.field_id);
            }
        }
        Command::Records { limit } => {
            let page = client.list_records_page(limit.max(1)).await?;
            println!(
                "Showing {} records (total {}, has_more={})",
                page.records.len(),
                page.total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string()),
                page.has_more
            );
            for record in &page.records {
                println!("{}", record.record_id);
                println!("{}", serde_json::to_string_pretty(&record.fields)?);
            }
        }
        Command::Touch { record_id } => {
            let stamp = beijing_now().format(LAST_UPDATED_FORMAT).to_string();
            let mut fields = CoercedRecord::new();
            fields.insert(columns::LAST_UPDATED.to_string(), FieldValue::Text(stamp.clone()));

            client
                .batch_update_records(&[RecordUpdate { record_id: record_id.clone(), fields }])
                .await?;
            println!("✅ {} Last Updated = {}", record_id, stamp);
        }
    }

    Ok(())
}
