//! Access to the Google Sheets `values` API.

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AppendConfirmation, RemoteSource};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::mapping::{CellValue, Grid};

/// The body of a `values.get` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default)]
    values: Option<Vec<Vec<serde_json::Value>>>,
}

/// The body of a `values.append` request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest<'a> {
    major_dimension: &'static str,
    values: [&'a [CellValue]; 1],
}

/// The body of a `values.append` response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    #[serde(default)]
    updates: Option<UpdateValuesResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    #[serde(default)]
    updated_range: Option<String>,
    #[serde(default)]
    updated_rows: u64,
}

/// Turns a JSON cell into the string shown in the sheet.
fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// A [`RemoteSource`] backed by one spreadsheet document.
#[derive(Clone, Debug)]
pub struct SheetsClient {
    client: Client,
    base_url: Url,
    spreadsheet_id: String,
    auth_token: Option<String>,
}

impl SheetsClient {
    /// Creates a client for the spreadsheet `spreadsheet_id`.
    pub fn new(config: &ApiConfig, spreadsheet_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(SheetsClient {
            client,
            base_url: config.base_url.clone(),
            spreadsheet_id: spreadsheet_id.into(),
            auth_token: config.auth_token.clone(),
        })
    }

    /// Returns the URL of the `values` resource for `range`, with `action` appended.
    ///
    /// The range is percent-encoded as a single path segment.
    fn values_url(&self, range: &str, action: Option<&str>) -> Result<Url> {
        let segment = match action {
            Some(action) => format!("{range}:{action}"),
            None => range.to_owned(),
        };

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Remote(format!("invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(&[
                "v4",
                "spreadsheets",
                self.spreadsheet_id.as_str(),
                "values",
                segment.as_str(),
            ]);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let details = response.text().await.unwrap_or_default();
        tracing::debug!(%status, details = %details, "sheets request failed");
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::PermissionDenied(details),
            StatusCode::NOT_FOUND => Error::NotFound,
            _ => Error::Remote(format!("{status}: {details}")),
        })
    }

    async fn fetch(&self, range: &str) -> Result<Grid> {
        let url = self.values_url(range, None)?;
        tracing::debug!(range, "fetching values");

        let response = self
            .send(self.client.get(url).query(&[("majorDimension", "ROWS")]))
            .await?;
        let body: ValueRange = response.json().await?;

        let values = body.values.filter(|rows| !rows.is_empty());
        let values = values.ok_or(Error::NoData)?;
        Ok(values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn append(&self, range: &str, row: Vec<CellValue>) -> Result<AppendConfirmation> {
        let url = self.values_url(range, Some("append"))?;
        tracing::debug!(range, cells = row.len(), "appending row");

        let request = self
            .client
            .post(url)
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&AppendRequest {
                major_dimension: "ROWS",
                values: [&row],
            });
        let body: AppendResponse = self.send(request).await?.json().await?;

        let updates = body.updates.unwrap_or_default();
        Ok(AppendConfirmation {
            updated_rows: updates.updated_rows,
            updated_range: updates.updated_range,
        })
    }
}

impl RemoteSource for SheetsClient {
    fn fetch_grid<'a>(&'a self, range: &'a str) -> BoxFuture<'a, Result<Grid>> {
        self.fetch(range).boxed()
    }

    fn append_row<'a>(
        &'a self,
        range: &'a str,
        row: Vec<CellValue>,
    ) -> BoxFuture<'a, Result<AppendConfirmation>> {
        self.append(range, row).boxed()
    }
}
