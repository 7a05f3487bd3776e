//! Taxpayer registry persisted as one JSON document.
//!
//! Every operation re-reads the file, applies its change to the in-memory
//! document, and writes it back via temp file + rename under an exclusive
//! `fs2` lock, so an identifier's profile and statuses change together or not
//! at all and concurrent processes never observe a partial file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::StoreError;
use crate::core::types::{
    Credentials, DerivedReturnStatus, FailureReason, GstProfile, Gstin, ReturnType,
};
use crate::returns::EntryKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxpayer {
    pub gstin: Gstin,
    /// Per-taxpayer portal login, used when shared credentials are off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Locked taxpayers are never scheduled for refresh.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Cleared by the first successful sync.
    #[serde(default)]
    pub is_new_entry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<GstProfile>,
    #[serde(default)]
    pub statuses: Vec<DerivedReturnStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

impl Taxpayer {
    pub fn new(gstin: Gstin) -> Self {
        Self {
            gstin,
            credentials: None,
            locked: false,
            mobile: None,
            email: None,
            is_new_entry: true,
            profile: None,
            statuses: Vec::new(),
            last_error: None,
            last_synced: None,
        }
    }

    /// Not locked, and either never derived or waiting on something the portal will show.
    pub fn needs_refresh(&self) -> bool {
        if self.locked {
            return false;
        }
        self.statuses.is_empty()
            || self.statuses.iter().any(|s| match s.status {
                None => true,
                Some(state) => state.awaits_portal_confirmation(),
            })
    }

    pub fn tracked_types(&self) -> HashSet<ReturnType> {
        self.statuses
            .iter()
            .filter(|s| s.status.is_some())
            .map(|s| s.return_type)
            .collect()
    }

    pub fn entry_kind(&self) -> EntryKind {
        if self.is_new_entry {
            EntryKind::New
        } else {
            EntryKind::Existing {
                tracked: self.tracked_types(),
            }
        }
    }
}

#[async_trait]
pub trait TaxpayerStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Taxpayer>, StoreError>;

    async fn get(&self, gstin: &Gstin) -> Result<Option<Taxpayer>, StoreError>;

    /// Inserts or replaces the whole record.
    async fn upsert(&self, taxpayer: Taxpayer) -> Result<(), StoreError>;

    async fn due_for_refresh(&self) -> Result<Vec<Taxpayer>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(Taxpayer::needs_refresh)
            .collect())
    }

    /// Profile snapshot plus derived statuses, applied as one unit.
    async fn apply_scrape(
        &self,
        gstin: &Gstin,
        profile: GstProfile,
        statuses: Vec<DerivedReturnStatus>,
    ) -> Result<(), StoreError>;

    async fn record_failure(&self, gstin: &Gstin, reason: &FailureReason)
        -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    taxpayers: Vec<Taxpayer>,
}

impl Document {
    fn find_mut(&mut self, gstin: &Gstin) -> Result<&mut Taxpayer, StoreError> {
        self.taxpayers
            .iter_mut()
            .find(|t| &t.gstin == gstin)
            .ok_or_else(|| StoreError::UnknownGstin(gstin.to_string()))
    }
}

/// Replaces statuses per return type; types absent from `fresh` are kept.
fn merge_statuses(existing: &mut Vec<DerivedReturnStatus>, fresh: Vec<DerivedReturnStatus>) {
    for status in fresh {
        match existing
            .iter_mut()
            .find(|s| s.return_type == status.return_type)
        {
            Some(slot) => *slot = status,
            None => existing.push(status),
        }
    }
    existing.sort_by_key(|s| s.return_type);
}

#[derive(Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    guard: Arc<Mutex<()>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the document, runs `f`, and saves only when `f` succeeds and asks to.
    async fn transact<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Document) -> Result<(R, bool), StoreError> + Send + 'static,
    {
        let _in_process = self.guard.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire(&path)?;
            let mut doc = load(&path)?;
            let (out, dirty) = f(&mut doc)?;
            if dirty {
                save(&path, &doc)?;
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.with_extension("lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("taxpayer_store: unlock failed: {}", e);
        }
    }
}

fn load(path: &Path) -> Result<Document, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(s) if s.trim().is_empty() => Ok(Document::default()),
        Ok(s) => Ok(serde_json::from_str(&s)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
        Err(e) => Err(e.into()),
    }
}

fn save(path: &Path, doc: &Document) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    debug!("taxpayer_store: wrote {}", path.display());
    Ok(())
}

#[async_trait]
impl TaxpayerStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<Taxpayer>, StoreError> {
        self.transact(|doc| Ok((doc.taxpayers.clone(), false))).await
    }

    async fn get(&self, gstin: &Gstin) -> Result<Option<Taxpayer>, StoreError> {
        let gstin = gstin.clone();
        self.transact(move |doc| {
            let found = doc.taxpayers.iter().find(|t| t.gstin == gstin).cloned();
            Ok((found, false))
        })
        .await
    }

    async fn upsert(&self, taxpayer: Taxpayer) -> Result<(), StoreError> {
        self.transact(move |doc| {
            match doc.taxpayers.iter_mut().find(|t| t.gstin == taxpayer.gstin) {
                Some(slot) => *slot = taxpayer,
                None => doc.taxpayers.push(taxpayer),
            }
            Ok(((), true))
        })
        .await
    }

    async fn apply_scrape(
        &self,
        gstin: &Gstin,
        profile: GstProfile,
        statuses: Vec<DerivedReturnStatus>,
    ) -> Result<(), StoreError> {
        let gstin = gstin.clone();
        let count = statuses.len();
        self.transact(move |doc| {
            let t = doc.find_mut(&gstin)?;
            t.profile = Some(profile);
            merge_statuses(&mut t.statuses, statuses);
            t.is_new_entry = false;
            t.last_error = None;
            t.last_synced = Some(Utc::now());
            info!("taxpayer_store: {} updated with {} return statuses", gstin, count);
            Ok(((), true))
        })
        .await
    }

    async fn record_failure(
        &self,
        gstin: &Gstin,
        reason: &FailureReason,
    ) -> Result<(), StoreError> {
        let gstin = gstin.clone();
        let reason = reason.clone();
        self.transact(move |doc| {
            doc.find_mut(&gstin)?.last_error = Some(reason);
            Ok(((), true))
        })
        .await
    }
}
