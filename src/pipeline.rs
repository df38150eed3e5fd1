use crate::classify::EmailClassifier;
use crate::config;
use crate::inventory::InventoryError;
use crate::metrics;
use crate::models::{
    AppendReport, BulkReport, EmailClassification, EmailRecord, OrderRequest, OrderStatus,
    StageReport, UpsertReport,
};
use crate::orders::OrderProcessor;
use crate::respond::{
    ConfirmationLine, OrderConfirmation, ProductInfo, ResponseGenerator, UnavailableItem,
};
use crate::sheets::{Row, SheetStore, SheetsApi, StoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// One batch pass over the mailroom: classify inbound emails, fulfill orders,
/// persist both to the store, draft replies. Bulk failures surface in the run
/// report as data; only store construction is fatal (and happens before this).
pub struct Pipeline<A: SheetsApi> {
    classifier: EmailClassifier,
    processor: OrderProcessor,
    store: SheetStore<A>,
    responder: ResponseGenerator,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyDraft {
    /// Order id for fulfillment replies, email id for inquiry replies.
    pub regarding: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub classifications: Vec<EmailClassification>,
    pub orders: BulkReport,
    pub emails_persisted: UpsertReport,
    pub orders_persisted: AppendReport,
    pub replies: Vec<ReplyDraft>,
    pub store_errors: Vec<String>,
    pub stages: Vec<StageReport>,
}

struct CatalogEntry {
    name: String,
    price: f64,
    description: String,
}

impl<A: SheetsApi> Pipeline<A> {
    pub fn new(
        classifier: EmailClassifier,
        processor: OrderProcessor,
        store: SheetStore<A>,
        responder: ResponseGenerator,
    ) -> Self {
        Self {
            classifier,
            processor,
            store,
            responder,
        }
    }

    /// Raw grid export of one sheet, for disaster-recovery dumps.
    pub async fn export_backup(&mut self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        self.store.backup_sheet(sheet).await
    }

    /// Live stock per product, for post-run restock checks.
    pub async fn stock_snapshot(
        &self,
        product_ids: &[String],
    ) -> Result<HashMap<String, Option<i64>>, InventoryError> {
        self.processor.inventory_snapshot(product_ids).await
    }

    /// Emails in the store that have not been classified yet (blank category).
    pub async fn pending_emails(&mut self) -> Result<Vec<EmailRecord>, StoreError> {
        let mut conditions = Row::new();
        conditions.insert("category".to_string(), String::new());
        let rows = self
            .store
            .find_rows(&config::EMAILS_SHEET, &conditions)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get("id").cloned().filter(|value| !value.is_empty())?;
                Some(EmailRecord {
                    id,
                    subject: row.get("subject").cloned().unwrap_or_default(),
                    message: row.get("message").cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    pub async fn run(&mut self, emails: &[EmailRecord], orders: &[OrderRequest]) -> RunReport {
        let run_id = Uuid::new_v4();
        let mut stages = Vec::new();
        let mut store_errors = Vec::new();

        let started = Instant::now();
        let classifications = self.classifier.classify_batch(emails, None).await;
        let unclassified = classifications
            .iter()
            .filter(|entry| entry.error.is_some())
            .count();
        push_stage(
            &mut stages,
            "classify_emails",
            started,
            json!({ "emails": emails.len(), "unclassified": unclassified }),
        );

        let started = Instant::now();
        let email_rows: Vec<Row> = emails
            .iter()
            .zip(&classifications)
            .map(|(email, classification)| {
                let mut row = Row::new();
                row.insert("id".to_string(), email.id.clone());
                row.insert("subject".to_string(), email.subject.clone());
                row.insert("message".to_string(), email.message.clone());
                row.insert("category".to_string(), classification.category.clone());
                row.insert(
                    "error".to_string(),
                    classification.error.clone().unwrap_or_default(),
                );
                row
            })
            .collect();
        let emails_persisted = match self
            .store
            .update_or_create(&config::EMAILS_SHEET, &email_rows, None)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(target = "mailroom.pipeline", error = %err, "emails_upsert_failed");
                store_errors.push(format!("emails upsert: {err}"));
                UpsertReport::default()
            }
        };
        push_stage(
            &mut stages,
            "persist_classifications",
            started,
            json!({
                "updated": emails_persisted.updated,
                "created": emails_persisted.created,
                "errors": emails_persisted.errors,
            }),
        );

        let started = Instant::now();
        let bulk = self
            .processor
            .bulk_process(orders, config::bulk_batch_size())
            .await;
        push_stage(
            &mut stages,
            "fulfill_orders",
            started,
            json!({
                "orders": orders.len(),
                "success": bulk.success_count,
                "failed": bulk.failed_count,
                "ledger": self.processor.processed_orders().len(),
            }),
        );

        let started = Instant::now();
        let order_rows = order_rows(orders, &bulk);
        let orders_persisted = match self
            .store
            .append_rows(&config::ORDERS_SHEET, &order_rows, config::append_batch_size())
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(target = "mailroom.pipeline", error = %err, "orders_append_failed");
                store_errors.push(format!("orders append: {err}"));
                AppendReport::default()
            }
        };
        push_stage(
            &mut stages,
            "persist_orders",
            started,
            json!({
                "rows": order_rows.len(),
                "appended": orders_persisted.success,
                "batches": orders_persisted.batches,
            }),
        );

        let started = Instant::now();
        let catalog = match self.load_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(target = "mailroom.pipeline", error = %err, "catalog_read_failed");
                store_errors.push(format!("catalog read: {err}"));
                HashMap::new()
            }
        };
        let mut replies = self.draft_replies(orders, &bulk, &catalog).await;
        replies.extend(
            self.draft_inquiry_replies(emails, &classifications, &catalog)
                .await,
        );
        push_stage(
            &mut stages,
            "draft_replies",
            started,
            json!({ "replies": replies.len() }),
        );

        RunReport {
            run_id,
            classifications,
            orders: bulk,
            emails_persisted,
            orders_persisted,
            replies,
            store_errors,
            stages,
        }
    }

    async fn load_catalog(&mut self) -> Result<HashMap<String, CatalogEntry>, StoreError> {
        let rows = self
            .store
            .find_rows(&config::PRODUCTS_SHEET, &Row::new())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get("id").cloned().filter(|value| !value.is_empty())?;
                Some((
                    id,
                    CatalogEntry {
                        name: row.get("name").cloned().unwrap_or_default(),
                        price: row
                            .get("price")
                            .and_then(|value| value.parse::<f64>().ok())
                            .unwrap_or(0.0),
                        description: row.get("description").cloned().unwrap_or_default(),
                    },
                ))
            })
            .collect())
    }

    async fn draft_replies(
        &self,
        orders: &[OrderRequest],
        bulk: &BulkReport,
        catalog: &HashMap<String, CatalogEntry>,
    ) -> Vec<ReplyDraft> {
        let mut replies = Vec::new();

        for order in orders {
            let Some(report) = bulk.processed_orders.get(&order.order_id) else {
                continue;
            };
            let body = match report.status {
                OrderStatus::Fulfilled => {
                    let lines: Vec<ConfirmationLine> = report
                        .items
                        .iter()
                        .map(|item| {
                            let entry = catalog.get(&item.product_id);
                            ConfirmationLine {
                                name: entry
                                    .map(|e| e.name.clone())
                                    .unwrap_or_else(|| item.product_id.clone()),
                                qty: item.fulfilled,
                                price: entry.map(|e| e.price).unwrap_or(0.0),
                            }
                        })
                        .collect();
                    let total = lines.iter().map(|line| line.price * line.qty as f64).sum();
                    let delivery_date = (Utc::now() + chrono::Duration::days(5))
                        .format("%Y-%m-%d")
                        .to_string();
                    self.responder
                        .order_confirmation(&OrderConfirmation {
                            order_id: order.order_id.clone(),
                            lines,
                            delivery_date,
                            total,
                        })
                        .await
                }
                OrderStatus::Partial | OrderStatus::Failed => {
                    let unavailable: Vec<UnavailableItem> = report
                        .items
                        .iter()
                        .filter(|item| item.fulfilled < item.requested)
                        .map(|item| UnavailableItem {
                            product_id: item.product_id.clone(),
                            name: catalog
                                .get(&item.product_id)
                                .map(|e| e.name.clone())
                                .unwrap_or_else(|| item.product_id.clone()),
                            requested_qty: item.requested,
                        })
                        .collect();
                    let short_ids: Vec<&String> =
                        unavailable.iter().map(|item| &item.product_id).collect();
                    let alternatives: Vec<ProductInfo> = catalog
                        .iter()
                        .filter(|(id, _)| !short_ids.contains(id))
                        .take(2)
                        .map(|(id, entry)| ProductInfo {
                            id: id.clone(),
                            name: entry.name.clone(),
                            description: entry.description.clone(),
                        })
                        .collect();
                    self.responder.stock_notice(&unavailable, &alternatives)
                }
                // nothing sensible to tell the customer yet
                OrderStatus::ProcessingError => continue,
            };
            replies.push(ReplyDraft {
                regarding: order.order_id.clone(),
                body,
            });
        }

        replies
    }

    /// Inquiry emails whose text names a catalog product get a drafted answer.
    /// A model failure skips that email's draft; it never disturbs the run.
    async fn draft_inquiry_replies(
        &self,
        emails: &[EmailRecord],
        classifications: &[EmailClassification],
        catalog: &HashMap<String, CatalogEntry>,
    ) -> Vec<ReplyDraft> {
        let mut replies = Vec::new();

        for (email, classification) in emails.iter().zip(classifications) {
            if classification.category.as_str() != config::LABEL_INQUIRY.as_str() {
                continue;
            }
            let text = format!("{} {}", email.subject, email.message);
            let Some((id, entry)) = match_product(catalog, &text) else {
                continue;
            };
            let product = ProductInfo {
                id: id.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
            };
            match self
                .responder
                .inquiry_reply(&email.message, &product, None)
                .await
            {
                Ok(body) => replies.push(ReplyDraft {
                    regarding: email.id.clone(),
                    body,
                }),
                Err(err) => warn!(
                    target = "mailroom.pipeline",
                    email_id = %email.id,
                    error = %err,
                    "inquiry_draft_failed"
                ),
            }
        }

        replies
    }
}

/// First catalog product whose id or name appears in the email text.
fn match_product<'a>(
    catalog: &'a HashMap<String, CatalogEntry>,
    text: &str,
) -> Option<(&'a String, &'a CatalogEntry)> {
    let haystack = text.to_lowercase();
    catalog.iter().find(|(id, entry)| {
        haystack.contains(&id.to_lowercase())
            || (!entry.name.is_empty() && haystack.contains(&entry.name.to_lowercase()))
    })
}

fn order_rows(orders: &[OrderRequest], bulk: &BulkReport) -> Vec<Row> {
    let mut rows = Vec::new();
    for order in orders {
        let Some(report) = bulk.processed_orders.get(&order.order_id) else {
            continue;
        };
        let timestamp = report.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        for item in &report.items {
            let mut row = Row::new();
            row.insert(
                "id".to_string(),
                format!("{}:{}", order.order_id, item.product_id),
            );
            row.insert("order_id".to_string(), order.order_id.clone());
            row.insert("product_id".to_string(), item.product_id.clone());
            row.insert("requested".to_string(), item.requested.to_string());
            row.insert("fulfilled".to_string(), item.fulfilled.to_string());
            row.insert("status".to_string(), item.status.as_str().to_string());
            row.insert("timestamp".to_string(), timestamp.clone());
            rows.push(row);
        }
    }
    rows
}

fn push_stage(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    started: Instant,
    output: serde_json::Value,
) {
    let elapsed_ms = started.elapsed().as_millis();
    metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, output));
}
