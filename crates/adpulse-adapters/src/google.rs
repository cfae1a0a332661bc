use adpulse_core::RawRow;
use adpulse_storage::{classify_status, HttpClient, HttpResponse, RetryDisposition};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{SheetError, SheetLocation, SheetSource, SourceContext, TabRef};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetsCredential {
    AccessToken(String),
    ApiKey(String),
    Anonymous,
}

impl SheetsCredential {
    /// Access token first, then API key, from the process environment.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        if let Some(token) = non_empty("GOOGLE_SHEETS_ACCESS_TOKEN") {
            Self::AccessToken(token)
        } else if let Some(key) = non_empty("GOOGLE_SHEETS_API_KEY") {
            Self::ApiKey(key)
        } else {
            Self::Anonymous
        }
    }
}

/// Read-only client for the Sheets v4 REST API.
#[derive(Debug, Clone)]
pub struct GoogleSheetsSource {
    http: HttpClient,
    credential: SheetsCredential,
    base_url: Url,
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
    #[serde(rename = "sheetId", default)]
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl GoogleSheetsSource {
    pub fn new(http: HttpClient, credential: SheetsCredential) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            credential,
            base_url: Url::parse(SHEETS_API_BASE)?,
        })
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn endpoint(&self, location: &SheetLocation, tail: &[&str]) -> Result<Url, SheetError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SheetError::InvalidSource(format!("unusable api base {}", self.base_url)))?
            .pop_if_empty()
            .push(&location.spreadsheet_id)
            .extend(tail);
        if let SheetsCredential::ApiKey(key) = &self.credential {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    fn bearer(&self) -> Option<&str> {
        match &self.credential {
            SheetsCredential::AccessToken(token) => Some(token.as_str()),
            _ => None,
        }
    }

    async fn fetch(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        url: Url,
    ) -> Result<HttpResponse, SheetError> {
        let resp = self
            .http
            .get(ctx.run_id, &location.spreadsheet_id, url, self.bearer())
            .await?;
        classify_response(location, resp)
    }
}

fn classify_response(location: &SheetLocation, resp: HttpResponse) -> Result<HttpResponse, SheetError> {
    if resp.is_success() {
        return Ok(resp);
    }
    let body = resp.text();
    let id = &location.spreadsheet_id;
    if classify_status(resp.status) == RetryDisposition::Retryable
        || body.contains("RATE_LIMIT_EXCEEDED")
    {
        return Err(SheetError::RateLimited(format!("{id}: HTTP {}", resp.status)));
    }
    match resp.status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(SheetError::PermissionDenied(
            format!("{id}: share the sheet with the configured account"),
        )),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            Err(SheetError::InvalidSource(format!("{id}: HTTP {}", resp.status)))
        }
        status => Err(SheetError::Transport(format!("{id}: HTTP {status}"))),
    }
}

/// Sheets ranges quote titles with single quotes, doubling embedded ones.
fn quoted_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsSource {
    fn source_kind(&self) -> &'static str {
        "google-sheets"
    }

    async fn list_tabs(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
    ) -> Result<Vec<TabRef>, SheetError> {
        let mut url = self.endpoint(location, &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let meta: SpreadsheetMeta = self.fetch(ctx, location, url).await?.json()?;
        debug!(spreadsheet = %location.spreadsheet_id, tabs = meta.sheets.len(), "listed tabs");
        Ok(meta
            .sheets
            .into_iter()
            .map(|sheet| TabRef {
                name: sheet.properties.title,
                id: sheet.properties.sheet_id,
            })
            .collect())
    }

    async fn read_tab(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        tab: &TabRef,
    ) -> Result<Vec<RawRow>, SheetError> {
        let range = quoted_range(&tab.name);
        let mut url = self.endpoint(location, &["values", &range])?;
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "FORMATTED_VALUE");
        let values: ValueRange = self.fetch(ctx, location, url).await?.json()?;
        Ok(values
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_storage::HttpClientConfig;

    fn source(credential: SheetsCredential) -> GoogleSheetsSource {
        let http = HttpClient::new(HttpClientConfig::default()).expect("client");
        GoogleSheetsSource::new(http, credential).expect("source")
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status: StatusCode::from_u16(status).expect("status"),
            final_url: "https://sheets.googleapis.com/v4/spreadsheets/abc".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn location() -> SheetLocation {
        SheetLocation {
            spreadsheet_id: "abc".to_string(),
        }
    }

    #[test]
    fn values_endpoint_quotes_and_encodes_tab_titles() {
        let src = source(SheetsCredential::ApiKey("k1".to_string()));
        let url = src
            .endpoint(&location(), &["values", &quoted_range("Outubro 2025")])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/'Outubro%202025'?key=k1"
        );
        assert_eq!(quoted_range("Kid's"), "'Kid''s'");
    }

    #[test]
    fn bearer_only_for_access_tokens() {
        assert_eq!(source(SheetsCredential::AccessToken("t".into())).bearer(), Some("t"));
        assert_eq!(source(SheetsCredential::ApiKey("k".into())).bearer(), None);
    }

    #[test]
    fn failures_map_to_distinct_errors() {
        let loc = location();
        assert!(classify_response(&loc, response(200, "{}")).is_ok());
        assert!(matches!(
            classify_response(&loc, response(429, "")),
            Err(SheetError::RateLimited(_))
        ));
        assert!(matches!(
            classify_response(&loc, response(403, r#"{"error":{"status":"RATE_LIMIT_EXCEEDED"}}"#)),
            Err(SheetError::RateLimited(_))
        ));
        assert!(matches!(
            classify_response(&loc, response(403, "")),
            Err(SheetError::PermissionDenied(_))
        ));
        assert!(matches!(
            classify_response(&loc, response(404, "")),
            Err(SheetError::InvalidSource(_))
        ));
        assert!(matches!(
            classify_response(&loc, response(500, "")),
            Err(SheetError::Transport(_))
        ));
    }

    #[test]
    fn formatted_cells_become_text() {
        assert_eq!(cell_text(Value::String("R$ 1,00".into())), "R$ 1,00");
        assert_eq!(cell_text(Value::Null), "");
        assert_eq!(cell_text(serde_json::json!(12)), "12");
    }
}
