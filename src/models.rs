use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Inbound email as handed over by the mail source. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: i64,
}

/// Terminal state of a single order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Available,
    Partial,
    InvalidQuantity,
    InvalidProduct,
    CheckFailed,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Available => "available",
            LineStatus::Partial => "partial",
            LineStatus::InvalidQuantity => "invalid_quantity",
            LineStatus::InvalidProduct => "invalid_product",
            LineStatus::CheckFailed => "check_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Fulfilled,
    Partial,
    Failed,
    ProcessingError,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Partial => "partial",
            OrderStatus::Failed => "failed",
            OrderStatus::ProcessingError => "processing_error",
        }
    }

    fn severity(self) -> u8 {
        match self {
            OrderStatus::Fulfilled => 0,
            OrderStatus::Partial => 1,
            OrderStatus::Failed => 2,
            OrderStatus::ProcessingError => 3,
        }
    }

    /// Monotone non-improving aggregation: the order status only ever moves
    /// toward the more severe of the two.
    pub fn escalate(self, other: OrderStatus) -> OrderStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub product_id: String,
    pub requested: i64,
    pub fulfilled: i64,
    pub status: LineStatus,
    /// Post-check stock minus fulfilled, taken from a second fresh read. May
    /// disagree with the read that drove the fulfillment decision; `None` when
    /// no meaningful second read exists.
    pub remaining_stock: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: String,
    pub status: OrderStatus,
    pub items: Vec<ItemReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkReport {
    pub success_count: usize,
    pub failed_count: usize,
    pub processed_orders: HashMap<String, OrderReport>,
    /// Signed per-product delta (requested − fulfilled) summed over all
    /// processed orders in this run.
    pub inventory_changes: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailClassification {
    pub email_id: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AppendReport {
    pub success: usize,
    pub failed: usize,
    pub batches: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub updated_cells: usize,
    pub failed_ranges: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub updated: usize,
    pub created: usize,
    pub errors: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}
