//! Append-only record of delivered groups, persisted as one JSON document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adpulse_core::{DeliveryGroupKey, DeliveryKind};
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Group used for legacy entries that carry no group title.
pub const LEGACY_GROUP_TITLE: &str = "OUTROS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    #[serde(rename = "groupTitle", alias = "titulo", default)]
    pub group_title: Option<String>,
    #[serde(
        rename = "processedAt",
        alias = "data_processamento",
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLedger {
    Grouped(BTreeMap<String, Vec<LedgerEntry>>),
    Flat(Vec<LedgerEntry>),
}

#[derive(Debug, Clone)]
pub struct DeliveryLedger {
    path: PathBuf,
    groups: BTreeMap<String, Vec<LedgerEntry>>,
}

impl DeliveryLedger {
    /// Loads the ledger at `path`. A missing, unreadable or corrupt file yields an
    /// empty ledger; the next write replaces it.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let groups = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice::<StoredLedger>(&bytes) {
                Ok(StoredLedger::Grouped(groups)) => groups,
                Ok(StoredLedger::Flat(entries)) => {
                    info!(path = %path.display(), entries = entries.len(), "migrating flat ledger");
                    migrate_flat(entries)
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "ledger is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                error!(path = %path.display(), error = %err, "ledger is unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self { path, groups }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, group: &str, id: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    pub fn entries(&self, group: &str) -> &[LedgerEntry] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn group_titles(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Appends and persists an entry. Returns `false` without touching storage
    /// when `id` is already recorded in `group`. A failed write leaves the
    /// ledger as it was.
    pub async fn mark_processed(
        &mut self,
        group: &str,
        id: &str,
        payload: Map<String, Value>,
    ) -> anyhow::Result<bool> {
        if self.is_processed(group, id) {
            debug!(group, id, "already in ledger");
            return Ok(false);
        }

        self.groups
            .entry(group.to_string())
            .or_default()
            .push(LedgerEntry {
                id: id.to_string(),
                group_title: Some(group.to_string()),
                processed_at: Some(Utc::now()),
                payload,
            });
        if let Err(err) = self.persist().await {
            if let Some(entries) = self.groups.get_mut(group) {
                entries.pop();
                if entries.is_empty() {
                    self.groups.remove(group);
                }
            }
            return Err(err);
        }
        Ok(true)
    }

    pub fn is_delivered(&self, key: &DeliveryGroupKey, kind: DeliveryKind) -> bool {
        self.is_processed(key.group_title(), &key.record_id(kind))
    }

    pub async fn mark_delivered(
        &mut self,
        key: &DeliveryGroupKey,
        kind: DeliveryKind,
        payload: Map<String, Value>,
    ) -> anyhow::Result<bool> {
        let id = key.record_id(kind);
        self.mark_processed(key.group_title(), &id, payload).await
    }

    /// Whole-document rewrite through a temp file and rename.
    async fn persist(&self) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating ledger directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&self.groups).context("serializing ledger")?;
        let temp_path = parent.join(format!(".{}.ledger.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp ledger file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp ledger file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp ledger file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp ledger {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

fn migrate_flat(entries: Vec<LedgerEntry>) -> BTreeMap<String, Vec<LedgerEntry>> {
    let mut groups: BTreeMap<String, Vec<LedgerEntry>> = BTreeMap::new();
    for mut entry in entries {
        let title = entry
            .group_title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| LEGACY_GROUP_TITLE.to_string());
        entry.group_title = Some(title.clone());
        let group = groups.entry(title).or_default();
        if !group.iter().any(|e| e.id == entry.id) {
            group.push(entry);
        }
    }
    groups
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
