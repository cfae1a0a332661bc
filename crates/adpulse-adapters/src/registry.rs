//! YAML-backed registry of sites, their sheets and their notification channels.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use adpulse_core::ColumnMapping;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{SheetError, SheetLocation};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading site registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing site registry {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("site {0:?} is listed more than once")]
    DuplicateSite(String),
    #[error("site {site:?} has no sheet url")]
    MissingSheet { site: String },
    #[error("site {site:?} has an unusable sheet url: {source}")]
    InvalidSheet {
        site: String,
        #[source]
        source: SheetError,
    },
    #[error("site {site:?} has no notification destination")]
    MissingDestination { site: String },
    #[error("no alert destination configured")]
    MissingAlertDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub webhook_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub sheet_url: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub columns: Option<ColumnMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRegistry {
    #[serde(default)]
    pub alert_destination: Option<String>,
    #[serde(default)]
    pub missing_data_destination: Option<String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

/// Everything the pipeline needs about one site, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteConfig {
    pub id: Option<u32>,
    pub name: String,
    pub display_name: String,
    pub sheet_url: Option<String>,
    pub channel: Option<String>,
    pub destination: Option<String>,
    pub columns: ColumnMapping,
}

impl SiteConfig {
    pub fn location(&self) -> Result<SheetLocation, RegistryError> {
        let url = self
            .sheet_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RegistryError::MissingSheet {
                site: self.name.clone(),
            })?;
        SheetLocation::parse(url).map_err(|source| RegistryError::InvalidSheet {
            site: self.name.clone(),
            source,
        })
    }

    pub fn destination(&self) -> Result<&str, RegistryError> {
        self.destination
            .as_deref()
            .ok_or_else(|| RegistryError::MissingDestination {
                site: self.name.clone(),
            })
    }
}

impl SiteRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&text, path)
    }

    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|source| RegistryError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let mut names = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for site in &self.sites {
            if !names.insert(site.name.as_str()) || !ids.insert(site.id) {
                return Err(RegistryError::DuplicateSite(site.name.clone()));
            }
            if let Some(channel) = &site.channel {
                if self.channel_webhook(channel).is_none() {
                    warn!(site = %site.name, channel = %channel, "site references an unknown channel");
                }
            }
        }
        Ok(())
    }

    /// Unknown names still resolve, with the default column mapping and no
    /// sheet or destination.
    pub fn get_site_config(&self, name: &str) -> SiteConfig {
        match self.sites.iter().find(|s| s.name == name) {
            Some(entry) => self.resolve(entry),
            None => SiteConfig {
                id: None,
                name: name.to_string(),
                display_name: name.to_string(),
                sheet_url: None,
                channel: None,
                destination: None,
                columns: ColumnMapping::default(),
            },
        }
    }

    pub fn get_site_by_id(&self, id: u32) -> Option<SiteConfig> {
        self.sites
            .iter()
            .find(|s| s.id == id)
            .map(|entry| self.resolve(entry))
    }

    /// Site names in configuration order.
    pub fn list_site_names(&self) -> Vec<&str> {
        self.sites.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn channel_webhook(&self, channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.name == channel)
            .map(|c| c.webhook_url.as_str())
    }

    pub fn alert_destination(&self) -> Result<&str, RegistryError> {
        self.alert_destination
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or(RegistryError::MissingAlertDestination)
    }

    /// Falls back to the alert destination.
    pub fn missing_data_destination(&self) -> Result<&str, RegistryError> {
        match self.missing_data_destination.as_deref() {
            Some(dest) if !dest.trim().is_empty() => Ok(dest),
            _ => self.alert_destination(),
        }
    }

    fn resolve(&self, entry: &SiteEntry) -> SiteConfig {
        let destination = entry
            .channel
            .as_deref()
            .and_then(|channel| self.channel_webhook(channel))
            .map(str::to_string);
        SiteConfig {
            id: Some(entry.id),
            name: entry.name.clone(),
            display_name: entry
                .display_name
                .clone()
                .unwrap_or_else(|| entry.name.clone()),
            sheet_url: entry.sheet_url.clone(),
            channel: entry.channel.clone(),
            destination,
            columns: entry.columns.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
alert_destination: https://hooks.example.test/alert
channels:
  - name: marketing
    webhook_url: https://hooks.example.test/marketing
sites:
  - id: 1
    name: Tech Pra Todos
    sheet_url: https://docs.google.com/spreadsheets/d/sheet-tpt/edit
    channel: marketing
    columns:
      investment: 2
      revenue: 3
  - id: 7
    name: Receitas da Vó
    display_name: Receitas da Vó (BR)
    channel: ghost
"#;

    fn registry() -> SiteRegistry {
        SiteRegistry::from_yaml(SAMPLE, Path::new("sites.yaml")).expect("registry")
    }

    #[test]
    fn configured_site_resolves_channel_and_partial_columns() {
        let site = registry().get_site_config("Tech Pra Todos");
        assert_eq!(site.id, Some(1));
        assert_eq!(site.destination().unwrap(), "https://hooks.example.test/marketing");
        assert_eq!(site.location().unwrap().spreadsheet_id, "sheet-tpt");
        assert_eq!(
            site.columns,
            ColumnMapping {
                investment: 2,
                revenue: 3,
                roas: 12,
                margin: 16
            }
        );
    }

    #[test]
    fn unknown_site_gets_default_mapping() {
        let site = registry().get_site_config("Nowhere");
        assert_eq!(site.id, None);
        assert_eq!(site.columns, ColumnMapping::default());
        assert!(matches!(site.location(), Err(RegistryError::MissingSheet { .. })));
        assert!(matches!(site.destination(), Err(RegistryError::MissingDestination { .. })));
    }

    #[test]
    fn lookup_by_id_and_listing_keep_order() {
        let reg = registry();
        let site = reg.get_site_by_id(7).expect("site 7");
        assert_eq!(site.display_name, "Receitas da Vó (BR)");
        assert_eq!(site.destination, None);
        assert!(reg.get_site_by_id(99).is_none());
        assert_eq!(reg.list_site_names(), vec!["Tech Pra Todos", "Receitas da Vó"]);
    }

    #[test]
    fn missing_data_destination_falls_back_to_alerts() {
        let reg = registry();
        assert_eq!(
            reg.missing_data_destination().unwrap(),
            "https://hooks.example.test/alert"
        );
        let empty = SiteRegistry::default();
        assert!(matches!(
            empty.missing_data_destination(),
            Err(RegistryError::MissingAlertDestination)
        ));
    }

    #[test]
    fn duplicate_sites_are_rejected() {
        let yaml = "sites:\n  - {id: 1, name: A}\n  - {id: 1, name: B}\n";
        let err = SiteRegistry::from_yaml(yaml, Path::new("dup.yaml")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSite(name) if name == "B"));
    }
}
