use crate::http::build_client;
use crate::retry::Retryable;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// One piece of a batched write: a range label (sheet-local, e.g. `A5:F5`)
/// plus the 2-D value block to place there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUpdate {
    pub range: String,
    pub values: Vec<Vec<String>>,
}

impl RangeUpdate {
    pub fn cell_count(&self) -> usize {
        self.values.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Error)]
pub enum SheetsApiError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl Retryable for SheetsApiError {
    fn is_transient(&self) -> bool {
        matches!(self, SheetsApiError::Request(_))
    }
}

/// Remote spreadsheet backend. Row 1 of every worksheet is the header row;
/// writes may not be visible to an immediately following read.
#[async_trait]
pub trait SheetsApi: Send + Sync {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetsApiError>;
    async fn add_worksheet(&self, title: &str, rows: u32, cols: u32) -> Result<(), SheetsApiError>;
    async fn read_values(&self, title: &str) -> Result<Vec<Vec<String>>, SheetsApiError>;
    async fn append_values(
        &self,
        title: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), SheetsApiError>;
    async fn update_ranges(&self, title: &str, updates: &[RangeUpdate])
    -> Result<(), SheetsApiError>;
}

#[derive(Debug, Clone)]
pub struct RestSheetsApi {
    base_url: String,
    api_key: String,
    spreadsheet_id: String,
    http: Client,
}

impl RestSheetsApi {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SHEETS_API_URL")
            .unwrap_or_else(|_| "https://sheets.googleapis.com".to_string());
        let api_key = std::env::var("SHEETS_API_KEY").ok()?;
        let spreadsheet_id = std::env::var("SPREADSHEET_ID").ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            spreadsheet_id,
            http: build_client(),
        })
    }

    fn values_url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values{}",
            self.base_url, self.spreadsheet_id, suffix
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SheetsApiError> {
        if !response.status().is_success() {
            return Err(SheetsApiError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueGrid {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn cell_to_string(cell: Value) -> String {
    match cell {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetsApi for RestSheetsApi {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetsApiError> {
        let url = format!(
            "{}/v4/spreadsheets/{}?fields=sheets.properties.title",
            self.base_url, self.spreadsheet_id
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| SheetsApiError::Request(err.to_string()))?;
        let payload: SpreadsheetMeta = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| SheetsApiError::Deserialize(err.to_string()))?;
        Ok(payload
            .sheets
            .into_iter()
            .map(|sheet| sheet.properties.title)
            .collect())
    }

    async fn add_worksheet(&self, title: &str, rows: u32, cols: u32) -> Result<(), SheetsApiError> {
        let url = format!(
            "{}/v4/spreadsheets/{}:batchUpdate",
            self.base_url, self.spreadsheet_id
        );
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": { "rowCount": rows, "columnCount": cols },
                    }
                }
            }]
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| SheetsApiError::Request(err.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn read_values(&self, title: &str) -> Result<Vec<Vec<String>>, SheetsApiError> {
        let url = self.values_url(&format!("/{}", urlencoding::encode(title)));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| SheetsApiError::Request(err.to_string()))?;
        let payload: ValueGrid = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| SheetsApiError::Deserialize(err.to_string()))?;
        Ok(payload
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn append_values(
        &self,
        title: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), SheetsApiError> {
        let url = self.values_url(&format!(
            "/{}:append?valueInputOption=USER_ENTERED",
            urlencoding::encode(title)
        ));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "values": values }))
            .send()
            .await
            .map_err(|err| SheetsApiError::Request(err.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_ranges(
        &self,
        title: &str,
        updates: &[RangeUpdate],
    ) -> Result<(), SheetsApiError> {
        let data: Vec<Value> = updates
            .iter()
            .map(|update| {
                json!({
                    "range": format!("{title}!{}", update.range),
                    "values": update.values,
                })
            })
            .collect();
        let body = json!({
            "valueInputOption": "USER_ENTERED",
            "data": data,
        });
        let url = self.values_url(":batchUpdate");
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| SheetsApiError::Request(err.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
