//! Record store adapter: named cell ranges in the appraisal spreadsheet.
use async_trait::async_trait;
use reqwest::{Client, Request, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{PipelineError, ServiceError};
use crate::http;
use crate::record::{self, AppraisalRecord, Field, FIRST_DATA_ROW};
use crate::retry::RetryPolicy;

pub mod model;

use model::ValueRange;

const SERVICE: &str = "sheets";
const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Raw range reads and writes. Range strings are built by the caller and
/// passed through unvalidated; overlapping writers race, last write wins.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, ServiceError>;

    async fn update_values(&self, range: &str, values: Vec<Vec<String>>)
        -> Result<(), ServiceError>;

    /// Append rows after the last non-empty row of the table containing `range`.
    async fn append_values(&self, range: &str, values: Vec<Vec<String>>)
        -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct SheetsClient {
    http: Client,
    base_url: Url,
    spreadsheet_id: String,
    token: String,
    retry: RetryPolicy,
}

impl fmt::Debug for SheetsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetsClient")
            .field("base_url", &self.base_url)
            .field("spreadsheet_id", &self.spreadsheet_id)
            .finish_non_exhaustive()
    }
}

impl SheetsClient {
    pub fn new(spreadsheet_id: String, token: String) -> Result<Self, ServiceError> {
        let base_url = Url::parse(SHEETS_API_BASE)
            .map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))?;
        Self::with_base_url(spreadsheet_id, token, base_url)
    }

    pub fn with_base_url(
        spreadsheet_id: String,
        token: String,
        base_url: Url,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client(SERVICE, TIMEOUT)?,
            base_url,
            spreadsheet_id,
            token,
            retry: RetryPolicy::default(),
        })
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, ServiceError> {
        let mut url = self
            .base_url
            .join("v4/spreadsheets/")
            .map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::malformed(SERVICE, "base URL cannot carry a path"))?
            .pop_if_empty()
            .push(&self.spreadsheet_id)
            .push("values")
            .push(&format!("{range}{suffix}"));
        Ok(url)
    }

    pub fn build_get(&self, range: &str) -> Result<Request, ServiceError> {
        let url = self.values_url(range, "")?;
        self.http
            .get(url)
            .bearer_auth(&self.token)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }

    pub fn build_update(&self, range: &str, body: &ValueRange) -> Result<Request, ServiceError> {
        let mut url = self.values_url(range, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.http
            .put(url)
            .bearer_auth(&self.token)
            .json(body)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }

    pub fn build_append(&self, range: &str, body: &ValueRange) -> Result<Request, ServiceError> {
        let mut url = self.values_url(range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }
}

fn rows_body(range: &str, values: Vec<Vec<String>>) -> ValueRange {
    ValueRange {
        range: Some(range.to_string()),
        major_dimension: Some("ROWS".into()),
        values,
    }
}

#[async_trait]
impl RecordStore for SheetsClient {
    #[instrument(skip(self))]
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, ServiceError> {
        let body = http::send(&self.http, &self.retry, SERVICE, || self.build_get(range)).await?;
        let parsed: ValueRange = http::decode(SERVICE, &body)?;
        Ok(parsed.values)
    }

    #[instrument(skip(self, values))]
    async fn update_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), ServiceError> {
        let body = rows_body(range, values);
        http::send(&self.http, &self.retry, SERVICE, || self.build_update(range, &body)).await?;
        Ok(())
    }

    #[instrument(skip(self, values))]
    async fn append_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), ServiceError> {
        let body = rows_body(range, values);
        http::send(&self.http, &self.retry, SERVICE, || self.build_append(range, &body)).await?;
        Ok(())
    }
}

/// Appraisal-shaped view over a [`RecordStore`].
#[derive(Clone)]
pub struct AppraisalSheet {
    store: Arc<dyn RecordStore>,
    pending: String,
    completed: String,
}

impl fmt::Debug for AppraisalSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppraisalSheet")
            .field("pending", &self.pending)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl AppraisalSheet {
    pub fn new(store: Arc<dyn RecordStore>, pending: String, completed: String) -> Self {
        Self {
            store,
            pending,
            completed,
        }
    }

    /// Read one row. Header rows and blank rows are rejected.
    pub async fn load(&self, id: u32) -> Result<AppraisalRecord, PipelineError> {
        if id < FIRST_DATA_ROW {
            return Err(PipelineError::validation(format!(
                "record id {id} is not a data row"
            )));
        }
        let rows = self
            .store
            .get_values(&record::row_range(&self.pending, id))
            .await?;
        let row = rows.into_iter().next().unwrap_or_default();
        let rec = AppraisalRecord::from_row(id, &row);
        if rec.is_blank() {
            return Err(PipelineError::integrity(format!(
                "record {id} not found in {}",
                self.pending
            )));
        }
        Ok(rec)
    }

    pub async fn write(&self, id: u32, field: Field, value: &str) -> Result<(), ServiceError> {
        self.store
            .update_values(
                &record::cell_range(&self.pending, field, id),
                vec![vec![value.to_string()]],
            )
            .await
    }

    /// Write adjacent cells starting at `from`.
    pub async fn write_span(
        &self,
        id: u32,
        from: Field,
        values: Vec<String>,
    ) -> Result<(), ServiceError> {
        if values.is_empty() {
            return Ok(());
        }
        let last = Field::ALL
            .get(from.index() + values.len() - 1)
            .copied()
            .ok_or_else(|| ServiceError::InvalidInput {
                service: SERVICE,
                message: format!("{} values starting at {:?} overflow the row", values.len(), from),
            })?;
        self.store
            .update_values(&record::span_range(&self.pending, from, last, id), vec![values])
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<AppraisalRecord>, ServiceError> {
        let rows = self
            .store
            .get_values(&record::table_range(&self.pending))
            .await?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, row)| AppraisalRecord::from_row(FIRST_DATA_ROW + i as u32, row))
            .filter(|rec| !rec.is_blank())
            .collect())
    }

    pub async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<AppraisalRecord>, ServiceError> {
        let wanted = identifier.trim();
        Ok(self
            .list_pending()
            .await?
            .into_iter()
            .find(|rec| rec.identifier == wanted))
    }

    /// Copy a finished row into the completed table and blank it in the
    /// pending table. Row ids of other pending records are unaffected.
    pub async fn move_to_completed(&self, rec: &AppraisalRecord) -> Result<(), ServiceError> {
        self.store
            .append_values(&record::table_range(&self.completed), vec![rec.to_row()])
            .await?;
        let blank = vec![String::new(); Field::ALL.len()];
        self.store
            .update_values(&record::row_range(&self.pending, rec.id), vec![blank])
            .await?;
        info!(id = rec.id, completed = %self.completed, "moved record to completed sheet");
        Ok(())
    }
}
