use std::path::{Path, PathBuf};

use adpulse_core::RawRow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{SheetError, SheetLocation, SheetSource, SourceContext, TabRef};

/// A whole spreadsheet captured as JSON: `<root>/<spreadsheet_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWorkbook {
    #[serde(default)]
    pub title: Option<String>,
    /// Makes every call against this workbook fail the given way.
    #[serde(default)]
    pub fail_with: Option<FixtureFailure>,
    pub tabs: Vec<FixtureTab>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureTab {
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    PermissionDenied,
    RateLimited,
}

/// Offline sheet source backed by workbook files on disk.
#[derive(Debug, Clone)]
pub struct FixtureSheetSource {
    root: PathBuf,
}

impl FixtureSheetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workbook_path(&self, location: &SheetLocation) -> PathBuf {
        self.root.join(format!("{}.json", location.spreadsheet_id))
    }

    async fn load(&self, location: &SheetLocation) -> Result<FixtureWorkbook, SheetError> {
        let path = self.workbook_path(location);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SheetError::InvalidSource(format!(
                    "no fixture workbook at {}",
                    path.display()
                )))
            }
            Err(err) => {
                return Err(SheetError::Transport(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        let workbook: FixtureWorkbook = serde_json::from_str(&text).map_err(|err| {
            SheetError::Transport(format!("parsing {}: {err}", path.display()))
        })?;

        match workbook.fail_with {
            Some(FixtureFailure::PermissionDenied) => Err(SheetError::PermissionDenied(
                location.spreadsheet_id.clone(),
            )),
            Some(FixtureFailure::RateLimited) => {
                Err(SheetError::RateLimited(location.spreadsheet_id.clone()))
            }
            None => Ok(workbook),
        }
    }
}

#[async_trait]
impl SheetSource for FixtureSheetSource {
    fn source_kind(&self) -> &'static str {
        "fixture"
    }

    async fn list_tabs(
        &self,
        _ctx: &SourceContext,
        location: &SheetLocation,
    ) -> Result<Vec<TabRef>, SheetError> {
        let workbook = self.load(location).await?;
        Ok(workbook
            .tabs
            .into_iter()
            .map(|tab| TabRef {
                name: tab.name,
                id: tab.id,
            })
            .collect())
    }

    async fn read_tab(
        &self,
        _ctx: &SourceContext,
        location: &SheetLocation,
        tab: &TabRef,
    ) -> Result<Vec<RawRow>, SheetError> {
        let workbook = self.load(location).await?;
        workbook
            .tabs
            .into_iter()
            .find(|t| t.id == tab.id || t.name == tab.name)
            .map(|t| t.rows)
            .ok_or_else(|| {
                SheetError::InvalidSource(format!(
                    "{} has no tab {:?}",
                    location.spreadsheet_id, tab.name
                ))
            })
    }
}
