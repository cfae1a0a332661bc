//! Sheet source contracts, the site registry and the period-aware source reader.

use adpulse_core::RawRow;
use adpulse_storage::HttpError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod fixture;
mod google;
mod reader;
mod registry;

pub use fixture::{FixtureFailure, FixtureSheetSource, FixtureTab, FixtureWorkbook};
pub use google::{GoogleSheetsSource, SheetsCredential, SHEETS_API_BASE};
pub use reader::{
    find_header_index, is_blank_row, read_grid, select_period_tabs, SheetGrid, SourceReader,
    HEADER_MARKER,
};
pub use registry::{ChannelConfig, RegistryError, SiteConfig, SiteEntry, SiteRegistry};

pub const CRATE_NAME: &str = "adpulse-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub run_id: Uuid,
}

impl SourceContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// Identifies one spreadsheet document at the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetLocation {
    pub spreadsheet_id: String,
}

impl SheetLocation {
    /// Accepts a full `/spreadsheets/d/<id>/...` URL or a bare id.
    pub fn parse(reference: &str) -> Result<Self, SheetError> {
        let reference = reference.trim();
        let candidate = match reference.split_once("/spreadsheets/d/") {
            Some((_, rest)) => rest
                .split(['/', '?', '#'])
                .next()
                .unwrap_or_default(),
            None if !reference.contains('/') => reference,
            None => "",
        };

        let valid = !candidate.is_empty()
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if valid {
            Ok(Self {
                spreadsheet_id: candidate.to_string(),
            })
        } else {
            Err(SheetError::InvalidSource(format!(
                "no spreadsheet id in {reference:?}"
            )))
        }
    }
}

/// A worksheet tab as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabRef {
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("invalid sheet reference: {0}")]
    InvalidSource(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("sheet transport failure: {0}")]
    Transport(String),
}

impl SheetError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

#[async_trait]
pub trait SheetSource: Send + Sync {
    fn source_kind(&self) -> &'static str;

    async fn list_tabs(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
    ) -> Result<Vec<TabRef>, SheetError>;

    async fn read_tab(
        &self,
        ctx: &SourceContext,
        location: &SheetLocation,
        tab: &TabRef,
    ) -> Result<Vec<RawRow>, SheetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spreadsheet_id_is_extracted_from_share_urls() {
        let url = "https://docs.google.com/spreadsheets/d/1AbC-dEf_123/edit#gid=0";
        assert_eq!(SheetLocation::parse(url).unwrap().spreadsheet_id, "1AbC-dEf_123");

        let url = "https://docs.google.com/spreadsheets/d/1AbC?usp=sharing";
        assert_eq!(SheetLocation::parse(url).unwrap().spreadsheet_id, "1AbC");

        assert_eq!(
            SheetLocation::parse(" 1AbC-dEf_123 ").unwrap().spreadsheet_id,
            "1AbC-dEf_123"
        );
    }

    #[test]
    fn urls_without_an_id_are_invalid_sources() {
        for reference in [
            "",
            "https://docs.google.com/document/d/xyz/edit",
            "https://docs.google.com/spreadsheets/d//edit",
            "not an id",
        ] {
            assert!(
                matches!(SheetLocation::parse(reference), Err(SheetError::InvalidSource(_))),
                "{reference:?}"
            );
        }
    }
}
