mod classify;
mod config;
mod http;
mod inventory;
mod llm;
mod metrics;
mod models;
mod orders;
mod pacing;
mod pipeline;
mod respond;
mod retry;
mod sheets;

use classify::{EmailClassifier, LlmClassifier};
use eyre::{WrapErr, eyre};
use inventory::RestInventoryService;
use llm::{LlmClient, LlmConfig};
use models::OrderRequest;
use orders::OrderProcessor;
use pipeline::Pipeline;
use respond::{CompanyInfo, ResponseGenerator};
use sheets::{RestSheetsApi, SheetSchema, SheetStore};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "mailroom.run", "batch run failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let sheets_api = RestSheetsApi::from_env()
        .ok_or_else(|| eyre!("SHEETS_API_KEY and SPREADSHEET_ID must be set"))?;
    let inventory = RestInventoryService::from_env()
        .ok_or_else(|| eyre!("INVENTORY_API_URL and INVENTORY_API_KEY must be set"))?;
    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));

    let mut store = SheetStore::new(sheets_api);
    store.register_schema(SheetSchema::new(
        &config::EMAILS_SHEET,
        &["id", "subject", "message", "category", "error"],
    ));
    store.register_schema(SheetSchema::new(
        &config::ORDERS_SHEET,
        &[
            "id",
            "order_id",
            "product_id",
            "requested",
            "fulfilled",
            "status",
            "timestamp",
        ],
    ));
    store.register_schema(SheetSchema::new(
        &config::PRODUCTS_SHEET,
        &["id", "name", "price", "description"],
    ));

    let classifier = EmailClassifier::new(Arc::new(LlmClassifier::new(Arc::clone(&llm))));
    let processor = OrderProcessor::new(Arc::new(inventory));
    let responder = ResponseGenerator::new(llm, CompanyInfo::from_env());
    let mut pipeline = Pipeline::new(classifier, processor, store, responder);

    let emails = pipeline
        .pending_emails()
        .await
        .wrap_err("reading pending emails from the store")?;
    let orders = load_orders().await?;
    info!(
        target = "mailroom.run",
        emails = emails.len(),
        orders = orders.len(),
        "starting batch run"
    );

    let report = pipeline.run(&emails, &orders).await;

    info!(
        target = "mailroom.run",
        run_id = %report.run_id,
        classified = report.classifications.len(),
        orders_ok = report.orders.success_count,
        orders_failed = report.orders.failed_count,
        emails_updated = report.emails_persisted.updated,
        emails_created = report.emails_persisted.created,
        order_rows = report.orders_persisted.success,
        replies = report.replies.len(),
        store_errors = report.store_errors.len(),
        "batch run complete"
    );
    for issue in &report.store_errors {
        error!(target = "mailroom.run", "store issue: {issue}");
    }

    // products that came up short this run get a fresh stock read so the
    // operator sees current levels, not the pre-run ones
    let restock: Vec<String> = report
        .orders
        .inventory_changes
        .iter()
        .filter(|(_, delta)| **delta > 0)
        .map(|(product, _)| product.clone())
        .collect();
    if !restock.is_empty() {
        match pipeline.stock_snapshot(&restock).await {
            Ok(snapshot) => {
                for (product, stock) in snapshot {
                    info!(
                        target = "mailroom.run",
                        product = %product,
                        stock = ?stock,
                        "restock_candidate"
                    );
                }
            }
            Err(err) => error!(target = "mailroom.run", "restock snapshot failed: {err}"),
        }
    }

    if let Ok(path) = std::env::var("BACKUP_FILE") {
        let grid = pipeline
            .export_backup(&config::ORDERS_SHEET)
            .await
            .wrap_err("exporting orders sheet backup")?;
        let encoded = serde_json::to_string_pretty(&grid)?;
        tokio::fs::write(&path, encoded)
            .await
            .wrap_err_with(|| format!("writing {path}"))?;
        info!(target = "mailroom.run", path = %path, "orders backup written");
    }

    Ok(())
}

/// Structured orders for this run, pre-parsed by the upstream intake. Optional:
/// without ORDERS_FILE the run only classifies and persists emails.
async fn load_orders() -> eyre::Result<Vec<OrderRequest>> {
    let Ok(path) = std::env::var("ORDERS_FILE") else {
        return Ok(Vec::new());
    };
    let raw = tokio::fs::read_to_string(&path)
        .await
        .wrap_err_with(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("parsing {path}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
