use crate::http::build_client;
use crate::retry::Retryable;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl Retryable for InventoryError {
    fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Request(_))
    }
}

/// Stock collaborator. `Ok(None)` is the not-found signal for an unknown
/// product; errors are transport-level and worth retrying. Reads are
/// idempotent, so repeated calls for the same product are safe.
#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn stock_level(&self, product_id: &str) -> Result<Option<i64>, InventoryError>;
}

#[derive(Debug, Clone)]
pub struct RestInventoryService {
    base_url: String,
    api_key: String,
    http: Client,
}

impl RestInventoryService {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("INVENTORY_API_URL").ok()?;
        let api_key = std::env::var("INVENTORY_API_KEY").ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: build_client(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StockRow {
    stock: i64,
}

#[async_trait]
impl InventoryService for RestInventoryService {
    async fn stock_level(&self, product_id: &str) -> Result<Option<i64>, InventoryError> {
        let url = format!(
            "{}/rest/v1/products?product_id=eq.{}&select=stock&limit=1",
            self.base_url,
            urlencoding::encode(product_id)
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|err| InventoryError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(InventoryError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut payload: Vec<StockRow> = response
            .json()
            .await
            .map_err(|err| InventoryError::Deserialize(err.to_string()))?;
        Ok(payload.pop().map(|row| row.stock))
    }
}
