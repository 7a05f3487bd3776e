use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::ScoutConfig;
use super::error::{ConfigError, RefreshError};
use super::progress::ProgressBroadcaster;
use super::types::{Gstin, ScrapeJob};
use crate::features::status_sync::{ReturnStatusSync, SyncReport};
use crate::features::taxpayer_store::{JsonFileStore, Taxpayer, TaxpayerStore};
use crate::returns::StatusCalculator;
use crate::scraping::browser_manager::{BrowserLauncher, ChromiumLauncher};
use crate::scraping::captcha::{AssemblyAiTranscriber, CaptchaResolver, Transcriber};
use crate::scraping::driver::PortalDriver;
use crate::scraping::orchestrator::GstScraper;

/// Body of `POST /refresh`; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshRequest {
    /// Restrict the cycle to these taxpayers; otherwise everyone due for refresh.
    #[serde(default)]
    pub gstins: Option<Vec<Gstin>>,
    #[serde(default)]
    pub use_shared_credentials: Option<bool>,
}

/// A scheduled refresh cycle.
pub struct RefreshTicket {
    pub scheduled: usize,
    pub skipped: usize,
    pub sync: JoinHandle<SyncReport>,
}

/// Composition root: every long-lived service, built once per process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ScoutConfig>,
    pub store: Arc<dyn TaxpayerStore>,
    pub scraper: Arc<GstScraper>,
    pub sync: Arc<ReturnStatusSync>,
    pub progress: ProgressBroadcaster,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("in_flight", &self.scraper.in_flight().len())
            .field("subscribers", &self.progress.subscriber_count())
            .finish()
    }
}

impl AppState {
    /// Production wiring: Chromium, AssemblyAI, JSON file store.
    pub fn new(config: ScoutConfig, http_client: reqwest::Client) -> Result<Self, ConfigError> {
        let transcriber = Arc::new(AssemblyAiTranscriber::from_config(
            http_client,
            &config.transcription,
        )?);
        let launcher = Arc::new(ChromiumLauncher::from_config(&config.browser));
        let store = Arc::new(JsonFileStore::new(config.service.resolve_store_path()));
        Ok(Self::from_parts(config, store, launcher, transcriber))
    }

    pub fn from_parts(
        config: ScoutConfig,
        store: Arc<dyn TaxpayerStore>,
        launcher: Arc<dyn BrowserLauncher>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        let progress = ProgressBroadcaster::default();
        let resolver = CaptchaResolver::new(transcriber, config.scrape.resolve_scratch_dir());
        let driver = PortalDriver::new(
            resolver,
            config.scrape.resolve_timeouts(),
            config.scrape.resolve_captcha_attempts(),
        );
        let scraper = GstScraper::new(
            launcher,
            Arc::new(driver),
            config.portal.clone(),
            config.scrape.resolve_mode(),
            progress.clone(),
        );
        let sync = ReturnStatusSync::new(
            store.clone(),
            StatusCalculator::new(config.policy.resolve()),
        );

        Self {
            config: Arc::new(config),
            store,
            scraper: Arc::new(scraper),
            sync: Arc::new(sync),
            progress,
        }
    }

    /// Picks taxpayers, starts a scrape batch, and drains it into the store in
    /// the background.
    pub async fn start_refresh(
        &self,
        request: RefreshRequest,
        today: NaiveDate,
    ) -> Result<RefreshTicket, RefreshError> {
        let use_shared = request
            .use_shared_credentials
            .unwrap_or_else(|| self.config.portal.resolve_use_shared_credentials());

        self.scraper.preflight(use_shared)?;

        let taxpayers = match request.gstins {
            Some(ids) => self.select(ids).await?,
            None => self.store.due_for_refresh().await?,
        };
        let jobs: Vec<ScrapeJob> = taxpayers
            .into_iter()
            .map(|t| ScrapeJob {
                gstin: t.gstin,
                credentials: t.credentials,
            })
            .collect();

        let batch = self.scraper.scrape_many(jobs, use_shared)?;
        let (scheduled, skipped) = (batch.scheduled.len(), batch.skipped.len());
        info!(
            "refresh cycle: {} scheduled, {} already in flight",
            scheduled, skipped
        );

        let sync = self.sync.clone();
        let handle = tokio::spawn(async move { sync.drain(batch.results, today).await });
        Ok(RefreshTicket {
            scheduled,
            skipped,
            sync: handle,
        })
    }

    /// Explicitly requested taxpayers; unknown ones are registered as new entries.
    async fn select(&self, ids: Vec<Gstin>) -> Result<Vec<Taxpayer>, RefreshError> {
        let mut out = Vec::with_capacity(ids.len());
        for gstin in ids {
            match self.store.get(&gstin).await? {
                Some(t) if t.locked => warn!("{}: locked, not refreshing", gstin),
                Some(t) => out.push(t),
                None => {
                    let t = Taxpayer::new(gstin);
                    self.store.upsert(t.clone()).await?;
                    out.push(t);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{parse_scout_config, PortalConfig};
    use crate::core::types::ReturnStatus;
    use crate::scraping::fakes::{RecordingLauncher, ScriptedTranscriber};

    fn state(dir: &std::path::Path, portal: PortalConfig) -> (AppState, Arc<RecordingLauncher>) {
        let mut config = parse_scout_config("{}").unwrap();
        config.portal = portal;
        config.scrape.scratch_dir = Some(dir.join("scratch"));
        let launcher = RecordingLauncher::new([]);
        let state = AppState::from_parts(
            config,
            Arc::new(JsonFileStore::new(dir.join("taxpayers.json"))),
            launcher.clone(),
            ScriptedTranscriber::always("1 2 3 4 5 6"),
        );
        (state, launcher)
    }

    fn portal() -> PortalConfig {
        PortalConfig {
            base_url: Some("https://portal.example/login".into()),
            username: Some("operator".into()),
            password: Some("secret".into()),
            use_shared_credentials: Some(true),
        }
    }

    #[tokio::test]
    async fn explicit_refresh_registers_scrapes_and_persists() {
        let dir = std::env::temp_dir().join(format!("gst-scout-app-{}", uuid::Uuid::new_v4()));
        let (state, launcher) = state(&dir, portal());
        let g = Gstin::parse("33AAACR5055K1Z5").unwrap();

        let ticket = state
            .start_refresh(
                RefreshRequest {
                    gstins: Some(vec![g.clone()]),
                    use_shared_credentials: None,
                },
                NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ticket.scheduled, 1);

        let report = ticket.sync.await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(launcher.ledger.launches(), 1);

        let stored = state.store.get(&g).await.unwrap().unwrap();
        assert!(!stored.is_new_entry);
        assert_eq!(stored.profile.unwrap().name, "ACME TRADERS");
        let gstr1 = stored
            .statuses
            .iter()
            .find(|s| s.return_type == crate::core::types::ReturnType::Gstr1)
            .unwrap();
        assert_eq!(gstr1.status, Some(ReturnStatus::CallForInvoice));
        assert_eq!(gstr1.pending_periods, vec!["042024"]);
    }

    #[tokio::test]
    async fn config_fault_surfaces_before_any_launch() {
        let dir = std::env::temp_dir().join(format!("gst-scout-app-{}", uuid::Uuid::new_v4()));
        let mut cfg = portal();
        cfg.base_url = Some("not a url".into());
        let (state, launcher) = state(&dir, cfg);

        let err = state
            .start_refresh(
                RefreshRequest {
                    gstins: Some(vec![Gstin::parse("33AAACR5055K1Z5").unwrap()]),
                    use_shared_credentials: None,
                },
                NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RefreshError::Config(_)));
        assert_eq!(launcher.ledger.launches(), 0);
        assert!(state.store.list().await.unwrap().is_empty());
    }
}
