mod api;

pub use api::{RangeUpdate, RestSheetsApi, SheetsApi, SheetsApiError};

use crate::config;
use crate::metrics;
use crate::models::{AppendReport, UpdateReport, UpsertReport};
use crate::pacing::Pacer;
use crate::retry::{Retryable, RetryPolicy, with_retry};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{info, warn};

/// A record destined for (or read from) a worksheet, keyed by column name.
pub type Row = BTreeMap<String, String>;

/// New worksheets are created at this fixed size.
const DEFAULT_ROWS: u32 = 1000;
const DEFAULT_COLS: u32 = 26;

/// Column contract for one worksheet. `headers` fixes the column order of
/// every row written to the sheet; `id_col` names the upsert key.
#[derive(Debug, Clone)]
pub struct SheetSchema {
    pub name: String,
    pub headers: Vec<String>,
    pub id_col: String,
}

impl SheetSchema {
    pub fn new(name: &str, headers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            id_col: "id".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorksheetHandle {
    #[allow(dead_code)]
    pub title: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Api(#[from] SheetsApiError),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => false,
            StoreError::Api(err) => err.is_transient(),
        }
    }
}

/// Schema-aware adapter over a remote spreadsheet backend. Owns the
/// worksheet-handle cache and the schema registry; expected to be the single
/// store instance of the process.
pub struct SheetStore<A: SheetsApi> {
    api: A,
    retry: RetryPolicy,
    pacer: Pacer,
    worksheets: HashMap<String, WorksheetHandle>,
    schemas: HashMap<String, SheetSchema>,
}

impl<A: SheetsApi> SheetStore<A> {
    pub fn new(api: A) -> Self {
        Self::with_policies(api, config::sheet_write_policy(), config::batch_pacer())
    }

    pub fn with_policies(api: A, retry: RetryPolicy, pacer: Pacer) -> Self {
        Self {
            api,
            retry,
            pacer,
            worksheets: HashMap::new(),
            schemas: HashMap::new(),
        }
    }

    /// Register (or replace) the schema for a sheet. Replacing a schema does
    /// not rewrite an already-initialized header row and does not invalidate a
    /// cached worksheet handle; a sheet whose schema changes mid-process keeps
    /// its original header layout until restart.
    pub fn register_schema(&mut self, schema: SheetSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Cached handle for `name`; on miss the sheet is looked up remotely and,
    /// when absent, created at the default size with the registered schema's
    /// headers written as row 1.
    pub async fn resolve_worksheet(&mut self, name: &str) -> Result<WorksheetHandle, StoreError> {
        if let Some(handle) = self.worksheets.get(name) {
            metrics::cache_hit("worksheet");
            return Ok(handle.clone());
        }

        let api = &self.api;
        let titles = with_retry(self.retry, name, || api.worksheet_titles()).await?;
        if !titles.iter().any(|title| title == name) {
            info!(target = "mailroom.sheets", sheet = name, "worksheet_missing_creating");
            with_retry(self.retry, name, || {
                api.add_worksheet(name, DEFAULT_ROWS, DEFAULT_COLS)
            })
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

            if let Some(schema) = self.schemas.get(name) {
                let header = [RangeUpdate {
                    range: "A1".to_string(),
                    values: vec![schema.headers.clone()],
                }];
                with_retry(self.retry, name, || api.update_ranges(name, &header))
                    .await
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
                info!(
                    target = "mailroom.sheets",
                    sheet = name,
                    headers = schema.headers.len(),
                    "initialized_sheet_headers"
                );
            }
        }

        let handle = WorksheetHandle {
            title: name.to_string(),
        };
        self.worksheets.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Validation is opt-in per sheet: with no registered schema every row
    /// passes.
    pub fn validate_row(&self, sheet: &str, row: &Row) -> bool {
        match self.schemas.get(sheet) {
            None => true,
            Some(schema) => row_error(schema, row).is_none(),
        }
    }

    /// Append `rows` in chunks of `batch_size`. Invalid rows are dropped and
    /// counted, never raised; each chunk is one remote call under the write
    /// retry policy, with a pacing pause between chunks.
    pub async fn append_rows(
        &mut self,
        sheet: &str,
        rows: &[Row],
        batch_size: usize,
    ) -> Result<AppendReport, StoreError> {
        self.resolve_worksheet(sheet).await?;
        let order = self.header_order(sheet, rows);
        let chunk_size = batch_size.max(1);
        let mut report = AppendReport::default();

        for (chunk_idx, chunk) in rows.chunks(chunk_size).enumerate() {
            let mut validated: Vec<Vec<String>> = Vec::new();
            for (offset, row) in chunk.iter().enumerate() {
                let detail = self.schemas.get(sheet).and_then(|schema| row_error(schema, row));
                match detail {
                    None => {
                        validated.push(project(row, &order));
                        report.success += 1;
                    }
                    Some(reason) => {
                        report.failed += 1;
                        report
                            .errors
                            .push(format!("row {}: {reason}", chunk_idx * chunk_size + offset));
                    }
                }
            }

            if !validated.is_empty() {
                let api = &self.api;
                with_retry(self.retry, sheet, || {
                    api.append_values(sheet, validated.clone())
                })
                .await?;
                report.batches += 1;
                metrics::rows_flushed(sheet, validated.len());
            }
            self.pacer.pause().await;
        }

        Ok(report)
    }

    /// One remote multi-range update per invocation, treated as
    /// all-or-nothing: any failure reports zero updated cells and every range
    /// as failed.
    pub async fn batch_update(
        &mut self,
        sheet: &str,
        updates: Vec<RangeUpdate>,
    ) -> Result<UpdateReport, StoreError> {
        self.resolve_worksheet(sheet).await?;
        if updates.is_empty() {
            return Ok(UpdateReport::default());
        }

        let api = &self.api;
        match with_retry(self.retry, sheet, || api.update_ranges(sheet, &updates)).await {
            Ok(()) => Ok(UpdateReport {
                updated_cells: updates.iter().map(RangeUpdate::cell_count).sum(),
                failed_ranges: Vec::new(),
            }),
            Err(err) => {
                warn!(
                    target = "mailroom.sheets",
                    sheet = sheet,
                    error = %err,
                    "batch_update_failed"
                );
                Ok(UpdateReport {
                    updated_cells: 0,
                    failed_ranges: updates.into_iter().map(|update| update.range).collect(),
                })
            }
        }
    }

    /// Rows whose every condition column matches exactly (case-sensitive).
    pub async fn find_rows(&mut self, sheet: &str, conditions: &Row) -> Result<Vec<Row>, StoreError> {
        let records = self.all_records(sheet).await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                conditions.iter().all(|(key, expected)| {
                    record.get(key).map(String::as_str).unwrap_or("") == expected
                })
            })
            .collect())
    }

    /// Upsert: one full read builds the id index, existing ids become one
    /// batched range update, novel ids are appended. The id index is built
    /// once per invocation, not per row.
    pub async fn update_or_create(
        &mut self,
        sheet: &str,
        rows: &[Row],
        id_column: Option<&str>,
    ) -> Result<UpsertReport, StoreError> {
        let id_col = id_column
            .map(str::to_string)
            .or_else(|| self.schemas.get(sheet).map(|schema| schema.id_col.clone()))
            .unwrap_or_else(|| "id".to_string());

        let records = self.all_records(sheet).await?;
        // +2: one for the header row, one for 1-based sheet addressing
        let existing: HashMap<String, usize> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, record)| {
                record
                    .get(&id_col)
                    .filter(|value| !value.is_empty())
                    .map(|value| (value.clone(), idx + 2))
            })
            .collect();

        let order = self.header_order(sheet, rows);
        let width = order.len().max(1);
        let mut report = UpsertReport::default();
        let mut updates = Vec::new();

        for row in rows {
            if !self.validate_row(sheet, row) {
                report.errors += 1;
                continue;
            }
            let row_id = row.get(&id_col).cloned().unwrap_or_default();
            match existing.get(&row_id) {
                Some(&row_num) => {
                    updates.push(RangeUpdate {
                        range: format!("A{row_num}:{}{row_num}", column_letter(width)),
                        values: vec![project(row, &order)],
                    });
                    report.updated += 1;
                }
                None => {
                    let api = &self.api;
                    let values = vec![project(row, &order)];
                    with_retry(self.retry, sheet, || api.append_values(sheet, values.clone()))
                        .await?;
                    report.created += 1;
                }
            }
        }

        if !updates.is_empty() {
            let outcome = self.batch_update(sheet, updates).await?;
            if !outcome.failed_ranges.is_empty() {
                warn!(
                    target = "mailroom.sheets",
                    sheet = sheet,
                    failed = outcome.failed_ranges.len(),
                    "upsert_update_phase_failed"
                );
            }
        }

        Ok(report)
    }

    /// Full raw grid, headers included. Disaster-recovery export.
    pub async fn backup_sheet(&mut self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        self.resolve_worksheet(sheet).await?;
        let api = &self.api;
        Ok(with_retry(self.retry, sheet, || api.read_values(sheet)).await?)
    }

    async fn all_records(&mut self, sheet: &str) -> Result<Vec<Row>, StoreError> {
        self.resolve_worksheet(sheet).await?;
        let api = &self.api;
        let mut grid = with_retry(self.retry, sheet, || api.read_values(sheet)).await?;
        if grid.is_empty() {
            return Ok(Vec::new());
        }
        let headers = grid.remove(0);
        Ok(grid
            .into_iter()
            .map(|row| {
                headers
                    .iter()
                    .cloned()
                    .zip(row.into_iter().chain(std::iter::repeat(String::new())))
                    .collect()
            })
            .collect())
    }

    fn header_order(&self, sheet: &str, rows: &[Row]) -> Vec<String> {
        match self.schemas.get(sheet) {
            Some(schema) => schema.headers.clone(),
            // permissive fallback: no schema means the first row dictates order
            None => rows
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

fn row_error(schema: &SheetSchema, row: &Row) -> Option<String> {
    let id = row.get(&schema.id_col).map(String::as_str).unwrap_or("");
    if id.trim().is_empty() {
        return Some(format!("missing value for id column `{}`", schema.id_col));
    }
    for key in row.keys() {
        if !schema.headers.iter().any(|header| header == key) {
            return Some(format!("unknown column `{key}`"));
        }
    }
    None
}

fn project(row: &Row, order: &[String]) -> Vec<String> {
    order
        .iter()
        .map(|col| row.get(col).cloned().unwrap_or_default())
        .collect()
}

/// 1-based spreadsheet column letters: 1 → A, 26 → Z, 27 → AA.
fn column_letter(mut n: usize) -> String {
    let mut letters = String::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.insert(0, (b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct MockState {
        sheets: BTreeMap<String, Vec<Vec<String>>>,
        list_calls: usize,
        append_calls: usize,
        update_calls: usize,
        updated_ranges: Vec<String>,
        fail_creates: bool,
        fail_updates: bool,
        append_failures: u32,
    }

    #[derive(Clone, Default)]
    struct MockSheetsApi {
        state: Arc<Mutex<MockState>>,
    }

    impl MockSheetsApi {
        fn seeded(sheet: &str, grid: Vec<Vec<&str>>) -> Self {
            let api = Self::default();
            api.state.lock().unwrap().sheets.insert(
                sheet.to_string(),
                grid.into_iter()
                    .map(|row| row.into_iter().map(str::to_string).collect())
                    .collect(),
            );
            api
        }
    }

    #[async_trait]
    impl SheetsApi for MockSheetsApi {
        async fn worksheet_titles(&self) -> Result<Vec<String>, SheetsApiError> {
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            Ok(state.sheets.keys().cloned().collect())
        }

        async fn add_worksheet(
            &self,
            title: &str,
            _rows: u32,
            _cols: u32,
        ) -> Result<(), SheetsApiError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_creates {
                return Err(SheetsApiError::Request("HTTP 503".into()));
            }
            state.sheets.insert(title.to_string(), Vec::new());
            Ok(())
        }

        async fn read_values(&self, title: &str) -> Result<Vec<Vec<String>>, SheetsApiError> {
            let state = self.state.lock().unwrap();
            Ok(state.sheets.get(title).cloned().unwrap_or_default())
        }

        async fn append_values(
            &self,
            title: &str,
            values: Vec<Vec<String>>,
        ) -> Result<(), SheetsApiError> {
            let mut state = self.state.lock().unwrap();
            state.append_calls += 1;
            if state.append_failures > 0 {
                state.append_failures -= 1;
                return Err(SheetsApiError::Request("HTTP 500".into()));
            }
            state.sheets.entry(title.to_string()).or_default().extend(values);
            Ok(())
        }

        async fn update_ranges(
            &self,
            title: &str,
            updates: &[RangeUpdate],
        ) -> Result<(), SheetsApiError> {
            let mut state = self.state.lock().unwrap();
            state.update_calls += 1;
            if state.fail_updates {
                return Err(SheetsApiError::Request("HTTP 500".into()));
            }
            for update in updates {
                state.updated_ranges.push(update.range.clone());
                let row_num = parse_row_number(&update.range);
                let grid = state.sheets.entry(title.to_string()).or_default();
                while grid.len() < row_num {
                    grid.push(Vec::new());
                }
                if let Some(values) = update.values.first() {
                    grid[row_num - 1] = values.clone();
                }
            }
            Ok(())
        }
    }

    fn parse_row_number(range: &str) -> usize {
        range
            .chars()
            .skip_while(|c| c.is_ascii_alphabetic())
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .expect("range carries a row number")
    }

    fn store(api: MockSheetsApi) -> SheetStore<MockSheetsApi> {
        SheetStore::with_policies(api, RetryPolicy::immediate(2), Pacer::new(1, Duration::ZERO))
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn email_schema() -> SheetSchema {
        SheetSchema::new("emails", &["id", "subject", "category"])
    }

    #[tokio::test]
    async fn append_issues_one_call_per_chunk() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows: Vec<Row> = (0..5)
            .map(|i| row(&[("id", &format!("e{i}")), ("subject", "hi")]))
            .collect();
        let report = store.append_rows("emails", &rows, 2).await.expect("append");

        assert_eq!(report.success, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.batches, 3);
        assert_eq!(state.lock().unwrap().append_calls, 3);
    }

    #[tokio::test]
    async fn append_drops_invalid_rows_without_remote_calls() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows = vec![
            row(&[("id", "e1"), ("subject", "ok")]),
            row(&[("subject", "no id")]),
            row(&[("id", "e2"), ("color", "unknown column")]),
        ];
        let report = store.append_rows("emails", &rows, 10).await.expect("append");

        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.batches, 1);
        // the single valid row landed, projected into header order
        let sheets = &state.lock().unwrap().sheets;
        assert_eq!(sheets["emails"].len(), 2);
        assert_eq!(sheets["emails"][1], vec!["e1", "ok", ""]);
    }

    #[tokio::test]
    async fn append_without_schema_is_permissive() {
        let api = MockSheetsApi::seeded("scratch", vec![]);
        let mut store = store(api);
        let rows = vec![row(&[("anything", "goes")])];
        let report = store.append_rows("scratch", &rows, 10).await.expect("append");
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn wholly_invalid_chunk_skips_the_remote_call() {
        let api = MockSheetsApi::default();
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows = vec![row(&[("subject", "no id")])];
        let report = store.append_rows("emails", &rows, 10).await.expect("append");
        assert_eq!(report.batches, 0);
        assert_eq!(state.lock().unwrap().append_calls, 0);
    }

    #[tokio::test]
    async fn resolve_creates_missing_sheet_and_writes_headers() {
        let api = MockSheetsApi::default();
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        store.resolve_worksheet("emails").await.expect("resolve");
        {
            let state = state.lock().unwrap();
            assert_eq!(state.sheets["emails"][0], vec!["id", "subject", "category"]);
            assert_eq!(state.list_calls, 1);
        }

        // second resolve is served from the handle cache
        store.resolve_worksheet("emails").await.expect("resolve");
        assert_eq!(state.lock().unwrap().list_calls, 1);
    }

    #[tokio::test]
    async fn resolve_reports_unavailable_when_creation_fails() {
        let api = MockSheetsApi::default();
        api.state.lock().unwrap().fail_creates = true;
        let mut store = store(api);
        let err = store
            .resolve_worksheet("emails")
            .await
            .expect_err("creation fails");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn upsert_updates_existing_and_appends_new() {
        let api = MockSheetsApi::seeded(
            "emails",
            vec![
                vec!["id", "subject", "category"],
                vec!["e1", "old", ""],
                vec!["e2", "other", ""],
            ],
        );
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows = vec![
            row(&[("id", "e2"), ("subject", "updated"), ("category", "order request")]),
            row(&[("id", "e9"), ("subject", "fresh")]),
        ];
        let report = store
            .update_or_create("emails", &rows, None)
            .await
            .expect("upsert");

        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.errors, 0);

        let state = state.lock().unwrap();
        // e2 sits under the header at sheet row 3; no duplicate row appended
        assert_eq!(state.updated_ranges, vec!["A3:C3"]);
        assert_eq!(state.append_calls, 1);
        assert_eq!(state.sheets["emails"][2], vec!["e2", "updated", "order request"]);
        assert_eq!(state.sheets["emails"][3], vec!["e9", "fresh", ""]);
    }

    #[tokio::test]
    async fn upsert_honors_id_column_override() {
        let api = MockSheetsApi::seeded(
            "contacts",
            vec![
                vec!["email", "name"],
                vec!["a@example.com", "Ada"],
            ],
        );
        let state = api.state.clone();
        let mut store = store(api);

        let rows = vec![row(&[("email", "a@example.com"), ("name", "Ada L.")])];
        let report = store
            .update_or_create("contacts", &rows, Some("email"))
            .await
            .expect("upsert");
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);
        assert_eq!(state.lock().unwrap().updated_ranges, vec!["A2:B2"]);
    }

    #[tokio::test]
    async fn upsert_counts_invalid_rows_as_errors() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows = vec![row(&[("subject", "missing id")])];
        let report = store
            .update_or_create("emails", &rows, None)
            .await
            .expect("upsert");
        assert_eq!(report.errors, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn find_rows_matches_exactly() {
        let api = MockSheetsApi::seeded(
            "emails",
            vec![
                vec!["id", "subject", "category"],
                vec!["e1", "hello", "order request"],
                vec!["e2", "hello", "product inquiry"],
                vec!["e3", "Hello", "order request"],
            ],
        );
        let mut store = store(api);

        let matches = store
            .find_rows("emails", &row(&[("subject", "hello"), ("category", "order request")]))
            .await
            .expect("find");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], "e1");

        // condition on a column that is blank matches blank cells only
        let blanks = store
            .find_rows("emails", &row(&[("missing", "")]))
            .await
            .expect("find");
        assert_eq!(blanks.len(), 3);
    }

    #[tokio::test]
    async fn batch_update_failure_reports_every_range() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        api.state.lock().unwrap().fail_updates = true;
        let mut store = store(api);

        let updates = vec![
            RangeUpdate {
                range: "A2:C2".into(),
                values: vec![vec!["x".into(), "y".into(), "z".into()]],
            },
            RangeUpdate {
                range: "A3:C3".into(),
                values: vec![vec!["q".into(), "r".into(), "s".into()]],
            },
        ];
        let report = store.batch_update("emails", updates).await.expect("update");
        assert_eq!(report.updated_cells, 0);
        assert_eq!(report.failed_ranges, vec!["A2:C2", "A3:C3"]);
    }

    #[tokio::test]
    async fn batch_update_success_counts_cells() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        let mut store = store(api);
        let updates = vec![RangeUpdate {
            range: "A2:C2".into(),
            values: vec![vec!["x".into(), "y".into(), "z".into()]],
        }];
        let report = store.batch_update("emails", updates).await.expect("update");
        assert_eq!(report.updated_cells, 3);
        assert!(report.failed_ranges.is_empty());
    }

    #[tokio::test]
    async fn append_retries_transient_failures() {
        let api = MockSheetsApi::seeded("emails", vec![vec!["id", "subject", "category"]]);
        api.state.lock().unwrap().append_failures = 1;
        let state = api.state.clone();
        let mut store = store(api);
        store.register_schema(email_schema());

        let rows = vec![row(&[("id", "e1"), ("subject", "hi")])];
        let report = store.append_rows("emails", &rows, 10).await.expect("append");
        assert_eq!(report.success, 1);
        // first call failed, second succeeded
        assert_eq!(state.lock().unwrap().append_calls, 2);
    }

    #[tokio::test]
    async fn backup_returns_full_grid() {
        let api = MockSheetsApi::seeded(
            "orders",
            vec![vec!["id", "status"], vec!["o1", "fulfilled"]],
        );
        let mut store = store(api);
        let grid = store.backup_sheet("orders").await.expect("backup");
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0], vec!["id", "status"]);
    }

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(7), "G");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(52), "AZ");
    }
}
