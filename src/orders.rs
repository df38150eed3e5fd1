use crate::config;
use crate::inventory::{InventoryError, InventoryService};
use crate::models::{BulkReport, ItemReport, LineStatus, OrderReport, OrderRequest, OrderStatus};
use crate::pacing::Pacer;
use crate::retry::{RetryPolicy, with_retry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Validates and fulfills orders against the live stock collaborator. Owns the
/// processed-order ledger for the current run; stock itself is never cached.
pub struct OrderProcessor {
    inventory: Arc<dyn InventoryService>,
    retry: RetryPolicy,
    item_delay: Duration,
    throttle: Pacer,
    processed: HashMap<String, OrderReport>,
}

impl OrderProcessor {
    pub fn new(inventory: Arc<dyn InventoryService>) -> Self {
        Self::with_policies(
            inventory,
            config::stock_check_policy(),
            config::item_pacing(),
            Pacer::new(config::bulk_batch_size(), config::bulk_throttle()),
        )
    }

    pub fn with_policies(
        inventory: Arc<dyn InventoryService>,
        retry: RetryPolicy,
        item_delay: Duration,
        throttle: Pacer,
    ) -> Self {
        Self {
            inventory,
            retry,
            item_delay,
            throttle,
            processed: HashMap::new(),
        }
    }

    /// Orders already processed this run, keyed by order id. Reprocessing an
    /// id overwrites its entry.
    pub fn processed_orders(&self) -> &HashMap<String, OrderReport> {
        &self.processed
    }

    async fn current_stock(&self, product_id: &str) -> Result<Option<i64>, InventoryError> {
        let inventory = Arc::clone(&self.inventory);
        with_retry(self.retry, product_id, || inventory.stock_level(product_id)).await
    }

    /// One order line, evaluated independently. Non-positive quantities are
    /// rejected without touching the inventory service; a stock read that
    /// exhausts its retries is `CheckFailed` (transient), distinct from
    /// `InvalidProduct` (permanent).
    pub async fn validate_item(&self, product_id: &str, requested: i64) -> (LineStatus, i64) {
        if requested <= 0 {
            return (LineStatus::InvalidQuantity, 0);
        }

        match self.current_stock(product_id).await {
            Err(err) => {
                warn!(
                    target = "mailroom.orders",
                    product_id = product_id,
                    error = %err,
                    "stock_check_exhausted"
                );
                (LineStatus::CheckFailed, 0)
            }
            Ok(None) => (LineStatus::InvalidProduct, 0),
            Ok(Some(stock)) => {
                let stock = stock.max(0);
                if stock >= requested {
                    (LineStatus::Available, requested)
                } else {
                    (LineStatus::Partial, stock)
                }
            }
        }
    }

    /// Every item is evaluated (no early exit) so the report always covers the
    /// whole order. `remaining_stock` comes from a second, fresh read and may
    /// disagree with the read behind the fulfillment decision; a second read
    /// that exhausts its retries propagates, to be recorded at the bulk
    /// boundary.
    pub async fn process_order(&mut self, order: &OrderRequest) -> Result<OrderReport, InventoryError> {
        let mut status = OrderStatus::Fulfilled;
        let mut items = Vec::with_capacity(order.items.len());

        for item in &order.items {
            let (line, fulfilled) = self.validate_item(&item.product_id, item.quantity).await;
            if line != LineStatus::Available {
                status = status.escalate(OrderStatus::Partial);
            }
            if line == LineStatus::InvalidProduct {
                status = status.escalate(OrderStatus::Failed);
            }

            let remaining_stock = if line == LineStatus::InvalidQuantity {
                None
            } else {
                self.current_stock(&item.product_id)
                    .await?
                    .map(|stock| stock - fulfilled)
            };

            items.push(ItemReport {
                product_id: item.product_id.clone(),
                requested: item.quantity,
                fulfilled,
                status: line,
                remaining_stock,
            });

            if !self.item_delay.is_zero() {
                sleep(self.item_delay).await;
            }
        }

        let report = OrderReport {
            order_id: order.order_id.clone(),
            status,
            items,
            error: None,
            timestamp: Utc::now(),
        };
        info!(
            target = "mailroom.orders",
            order_id = %order.order_id,
            status = report.status.as_str(),
            items = report.items.len(),
            "order_processed"
        );
        self.processed.insert(order.order_id.clone(), report.clone());
        Ok(report)
    }

    /// Process orders in caller order, accumulating success/failure counts and
    /// the signed per-product inventory delta. A failing order becomes a
    /// `processing_error` entry; it never aborts the batch. A throttle pause
    /// lands after every `batch_size` orders regardless of their outcomes.
    pub async fn bulk_process(&mut self, orders: &[OrderRequest], batch_size: usize) -> BulkReport {
        let throttle = self.throttle.with_chunk(batch_size);
        let mut summary = BulkReport::default();

        for order in orders {
            match self.process_order(order).await {
                Ok(report) => {
                    if report.status == OrderStatus::Fulfilled {
                        summary.success_count += 1;
                    } else {
                        summary.failed_count += 1;
                    }
                    for item in &report.items {
                        *summary
                            .inventory_changes
                            .entry(item.product_id.clone())
                            .or_default() += item.requested - item.fulfilled;
                    }
                    summary
                        .processed_orders
                        .insert(order.order_id.clone(), report);
                }
                Err(err) => {
                    warn!(
                        target = "mailroom.orders",
                        order_id = %order.order_id,
                        error = %err,
                        "order_processing_error"
                    );
                    summary.failed_count += 1;
                    let report = OrderReport {
                        order_id: order.order_id.clone(),
                        status: OrderStatus::ProcessingError,
                        items: Vec::new(),
                        error: Some(err.to_string()),
                        timestamp: Utc::now(),
                    };
                    self.processed.insert(order.order_id.clone(), report.clone());
                    summary
                        .processed_orders
                        .insert(order.order_id.clone(), report);
                }
            }

            throttle.pause_after(summary.processed_orders.len()).await;
        }

        summary
    }

    /// Current stock for each product, through the retry wrapper. The first
    /// exhausted read aborts the snapshot.
    pub async fn inventory_snapshot(
        &self,
        product_ids: &[String],
    ) -> Result<HashMap<String, Option<i64>>, InventoryError> {
        let mut snapshot = HashMap::with_capacity(product_ids.len());
        for product_id in product_ids {
            let stock = self.current_stock(product_id).await?;
            snapshot.insert(product_id.clone(), stock);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderItemRequest;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockInventory {
        stock: Mutex<HashMap<String, i64>>,
        calls: AtomicUsize,
        always_fail: bool,
        failing_products: Vec<String>,
    }

    impl MockInventory {
        fn with_stock(pairs: &[(&str, i64)]) -> Self {
            Self {
                stock: Mutex::new(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                ),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                always_fail: true,
                ..Self::default()
            }
        }

        fn failing_for(mut self, product_id: &str) -> Self {
            self.failing_products.push(product_id.to_string());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InventoryService for MockInventory {
        async fn stock_level(&self, product_id: &str) -> Result<Option<i64>, InventoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail || self.failing_products.iter().any(|p| p == product_id) {
                return Err(InventoryError::Request("connection reset".into()));
            }
            Ok(self.stock.lock().unwrap().get(product_id).copied())
        }
    }

    fn processor(inventory: Arc<MockInventory>) -> OrderProcessor {
        OrderProcessor::with_policies(
            inventory,
            RetryPolicy::immediate(3),
            Duration::ZERO,
            Pacer::new(5, Duration::ZERO),
        )
    }

    fn order(order_id: &str, items: &[(&str, i64)]) -> OrderRequest {
        OrderRequest {
            order_id: order_id.to_string(),
            items: items
                .iter()
                .map(|(product_id, quantity)| OrderItemRequest {
                    product_id: product_id.to_string(),
                    quantity: *quantity,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn non_positive_quantity_never_calls_inventory() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3)]));
        let processor = processor(inventory.clone());

        assert_eq!(
            processor.validate_item("P1", 0).await,
            (LineStatus::InvalidQuantity, 0)
        );
        assert_eq!(
            processor.validate_item("P1", -4).await,
            (LineStatus::InvalidQuantity, 0)
        );
        assert_eq!(inventory.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_product_is_invalid() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3)]));
        let processor = processor(inventory);
        assert_eq!(
            processor.validate_item("GHOST", 2).await,
            (LineStatus::InvalidProduct, 0)
        );
    }

    #[tokio::test]
    async fn sufficient_stock_fulfills_in_full() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 10)]));
        let processor = processor(inventory);
        assert_eq!(
            processor.validate_item("P1", 10).await,
            (LineStatus::Available, 10)
        );
    }

    #[tokio::test]
    async fn short_stock_fulfills_partially() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3)]));
        let processor = processor(inventory);
        assert_eq!(
            processor.validate_item("P1", 5).await,
            (LineStatus::Partial, 3)
        );
    }

    #[tokio::test]
    async fn exhausted_retries_mark_check_failed() {
        let inventory = Arc::new(MockInventory::failing());
        let processor = processor(inventory.clone());
        assert_eq!(
            processor.validate_item("P1", 2).await,
            (LineStatus::CheckFailed, 0)
        );
        // three attempts, then give up
        assert_eq!(inventory.calls(), 3);
    }

    #[tokio::test]
    async fn partial_order_reports_each_line() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3)]));
        let mut processor = processor(inventory);

        let report = processor
            .process_order(&order("O1", &[("P1", 5)]))
            .await
            .expect("process");

        assert_eq!(report.status, OrderStatus::Partial);
        assert_eq!(report.items.len(), 1);
        let item = &report.items[0];
        assert_eq!(item.requested, 5);
        assert_eq!(item.fulfilled, 3);
        assert_eq!(item.status, LineStatus::Partial);
        assert_eq!(item.remaining_stock, Some(0));
    }

    #[tokio::test]
    async fn failed_order_is_never_upgraded() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 10), ("P2", 10)]));
        let mut processor = processor(inventory);

        let report = processor
            .process_order(&order("O1", &[("GHOST", 1), ("P1", 2), ("P2", 3)]))
            .await
            .expect("process");

        assert_eq!(report.status, OrderStatus::Failed);
        assert_eq!(report.items.len(), 3);
        assert_eq!(report.items[1].status, LineStatus::Available);
        assert_eq!(report.items[2].status, LineStatus::Available);
    }

    #[tokio::test]
    async fn invalid_quantity_makes_no_second_read() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 10)]));
        let mut processor = processor(inventory.clone());

        let report = processor
            .process_order(&order("O1", &[("P1", -1)]))
            .await
            .expect("process");

        assert_eq!(report.items[0].status, LineStatus::InvalidQuantity);
        assert_eq!(report.items[0].remaining_stock, None);
        assert_eq!(inventory.calls(), 0);
    }

    #[tokio::test]
    async fn bulk_converts_order_failures_to_processing_error() {
        // PBAD fails on every retry; the other orders go through untouched
        let inventory =
            Arc::new(MockInventory::with_stock(&[("P1", 10)]).failing_for("PBAD"));
        let mut processor = processor(inventory);

        let summary = processor
            .bulk_process(
                &[
                    order("O1", &[("P1", 2)]),
                    order("O2", &[("PBAD", 2)]),
                    order("O3", &[("P1", 1)]),
                ],
                5,
            )
            .await;

        // O2's stock check exhausts its retries and the follow-up read dies
        // the same way, surfacing as a processing error for that order only
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failed_count, 1);
        let second = &summary.processed_orders["O2"];
        assert_eq!(second.status, OrderStatus::ProcessingError);
        assert!(
            second
                .error
                .as_deref()
                .is_some_and(|e| e.contains("connection reset"))
        );
        assert_eq!(summary.processed_orders["O1"].status, OrderStatus::Fulfilled);
        assert_eq!(summary.processed_orders["O3"].status, OrderStatus::Fulfilled);
    }

    #[tokio::test]
    async fn bulk_accumulates_inventory_deltas() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3), ("P2", 10)]));
        let mut processor = processor(inventory);

        let summary = processor
            .bulk_process(
                &[
                    order("O1", &[("P1", 5), ("P2", 4)]),
                    order("O2", &[("P2", 1)]),
                ],
                5,
            )
            .await;

        // O1: P1 short (5 requested, 3 fulfilled), P2 in full; O2: P2 in full
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.inventory_changes["P1"], 2);
        assert_eq!(summary.inventory_changes["P2"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_throttles_after_each_chunk() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 100)]));
        let mut processor = OrderProcessor::with_policies(
            inventory,
            RetryPolicy::immediate(3),
            Duration::ZERO,
            Pacer::new(5, Duration::from_secs(1)),
        );

        let orders: Vec<OrderRequest> =
            (0..4).map(|i| order(&format!("O{i}"), &[("P1", 1)])).collect();
        let start = tokio::time::Instant::now();
        processor.bulk_process(&orders, 2).await;
        // pauses after orders 2 and 4
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn ledger_keeps_last_result_per_order() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3)]));
        let mut processor = processor(inventory.clone());

        processor
            .process_order(&order("O1", &[("P1", 5)]))
            .await
            .expect("process");
        assert_eq!(
            processor.processed_orders()["O1"].status,
            OrderStatus::Partial
        );

        inventory.stock.lock().unwrap().insert("P1".into(), 50);
        processor
            .process_order(&order("O1", &[("P1", 5)]))
            .await
            .expect("process");
        assert_eq!(
            processor.processed_orders()["O1"].status,
            OrderStatus::Fulfilled
        );
    }

    #[tokio::test]
    async fn snapshot_reads_every_product() {
        let inventory = Arc::new(MockInventory::with_stock(&[("P1", 3), ("P2", 0)]));
        let processor = processor(inventory);
        let snapshot = processor
            .inventory_snapshot(&["P1".to_string(), "P2".to_string(), "P9".to_string()])
            .await
            .expect("snapshot");
        assert_eq!(snapshot["P1"], Some(3));
        assert_eq!(snapshot["P2"], Some(0));
        assert_eq!(snapshot["P9"], None);
    }
}
