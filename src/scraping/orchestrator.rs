//! Batch scraping: one browser per batch, one isolated login per taxpayer,
//! results streamed on a `SafeChannel` as they complete.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::browser_manager::{BrowserLauncher, PortalBrowser};
use super::driver::PortalDriver;
use crate::core::channel::{SafeChannel, SafeReceiver};
use crate::core::config::{PortalConfig, PortalSettings, ScrapeMode};
use crate::core::error::ConfigError;
use crate::core::progress::{ProgressBroadcaster, ProgressEvent, ProgressKind};
use crate::core::types::{FailureReason, Gstin, ScrapeJob, ScrapeResult};

type InFlight = Arc<Mutex<HashSet<Gstin>>>;

/// Handle to a batch that has been accepted.
pub struct ScrapeBatch {
    /// Correlates this batch's log lines.
    pub id: Uuid,
    pub scheduled: Vec<Gstin>,
    /// Requested but already being scraped by an earlier batch.
    pub skipped: Vec<Gstin>,
    /// Closed once every scheduled taxpayer has a result.
    pub results: SafeReceiver<ScrapeResult>,
}

/// Holds a taxpayer in the in-flight set until dropped.
struct Claim {
    gstin: Gstin,
    in_flight: InFlight,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut set = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.gstin);
    }
}

pub struct GstScraper {
    launcher: Arc<dyn BrowserLauncher>,
    driver: Arc<PortalDriver>,
    portal: PortalConfig,
    mode: ScrapeMode,
    progress: ProgressBroadcaster,
    in_flight: InFlight,
}

impl GstScraper {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        driver: Arc<PortalDriver>,
        portal: PortalConfig,
        mode: ScrapeMode,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            launcher,
            driver,
            portal,
            mode,
            progress,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight(&self) -> Vec<Gstin> {
        let set = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<Gstin> = set.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// `ScrapeMany(identifiers, useSharedCredentials)`.
    ///
    /// Fails fast, before any browser is launched, when the portal settings
    /// are incomplete. Taxpayers already in flight are skipped rather than
    /// queued; duplicates within `jobs` are collapsed.
    pub fn scrape_many(
        &self,
        jobs: Vec<ScrapeJob>,
        use_shared_credentials: bool,
    ) -> Result<ScrapeBatch, ConfigError> {
        let settings = self.settings(use_shared_credentials)?;

        let id = Uuid::new_v4();
        let (claims, skipped) = self.claim(jobs);
        let scheduled: Vec<Gstin> = claims.iter().map(|(job, _)| job.gstin.clone()).collect();

        let mut message = format!("{} GSTs scheduled for refresh", scheduled.len());
        if !skipped.is_empty() {
            message.push_str(&format!(" ({} already in progress)", skipped.len()));
        }
        info!("batch {}: {}", id, message);
        self.progress
            .publish(ProgressEvent::new(ProgressKind::Info, "GST refresh", message));

        let (tx, results) = SafeChannel::new();
        if claims.is_empty() {
            tx.close();
        } else {
            let run = BatchRun {
                id,
                launcher: self.launcher.clone(),
                driver: self.driver.clone(),
                settings,
                mode: self.mode,
                progress: self.progress.clone(),
                tx,
            };
            tokio::spawn(run.execute(claims));
        }

        Ok(ScrapeBatch {
            id,
            scheduled,
            skipped,
            results,
        })
    }

    /// Checks the portal settings a batch would need, notifying users when they are incomplete.
    pub fn preflight(&self, use_shared_credentials: bool) -> Result<(), ConfigError> {
        self.settings(use_shared_credentials).map(|_| ())
    }

    fn settings(&self, use_shared_credentials: bool) -> Result<PortalSettings, ConfigError> {
        self.portal.validate(use_shared_credentials).map_err(|e| {
            error!("refusing to start batch: {}", e);
            self.progress
                .publish(ProgressEvent::notification("GST settings incomplete", e.to_string()));
            e
        })
    }

    fn claim(&self, jobs: Vec<ScrapeJob>) -> (Vec<(ScrapeJob, Claim)>, Vec<Gstin>) {
        let mut set = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut claims = Vec::new();
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        for job in jobs {
            if !seen.insert(job.gstin.clone()) {
                continue;
            }
            if set.insert(job.gstin.clone()) {
                let claim = Claim {
                    gstin: job.gstin.clone(),
                    in_flight: self.in_flight.clone(),
                };
                claims.push((job, claim));
            } else {
                skipped.push(job.gstin);
            }
        }
        (claims, skipped)
    }
}

/// Everything a spawned batch owns.
struct BatchRun {
    id: Uuid,
    launcher: Arc<dyn BrowserLauncher>,
    driver: Arc<PortalDriver>,
    settings: PortalSettings,
    mode: ScrapeMode,
    progress: ProgressBroadcaster,
    tx: SafeChannel<ScrapeResult>,
}

/// The receiver sees end-of-stream however the run ends.
impl Drop for BatchRun {
    fn drop(&mut self) {
        self.tx.close();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl BatchRun {
    async fn execute(self, claims: Vec<(ScrapeJob, Claim)>) {
        let started = Instant::now();
        let total = claims.len();

        let browser = match AssertUnwindSafe(self.launcher.launch()).catch_unwind().await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => {
                error!("batch {}: browser launch failed, failing {} GSTs: {}", self.id, total, e);
                return self
                    .fail_all(claims, format!("Could not start the browser: {}", e))
                    .await;
            }
            Err(panic) => {
                error!(
                    "batch {}: browser launch panicked, failing {} GSTs: {}",
                    self.id,
                    total,
                    panic_message(&*panic)
                );
                return self
                    .fail_all(claims, "Could not start the browser".to_string())
                    .await;
            }
        };

        let succeeded = match self.mode {
            ScrapeMode::Sequential => {
                let mut ok = 0;
                for (job, claim) in claims {
                    if self.process(browser.as_ref(), job, claim).await {
                        ok += 1;
                    }
                }
                ok
            }
            ScrapeMode::Pooled { max_concurrent } => {
                let browser = browser.as_ref();
                stream::iter(claims)
                    .map(|(job, claim)| self.process(browser, job, claim))
                    .buffer_unordered(max_concurrent.max(1))
                    .filter(|ok| futures::future::ready(*ok))
                    .count()
                    .await
            }
        };

        if let Err(panic) = AssertUnwindSafe(browser.close()).catch_unwind().await {
            error!("batch {}: browser close panicked: {}", self.id, panic_message(&*panic));
        }
        info!(
            "batch {} finished: {}/{} succeeded in {}ms",
            self.id,
            succeeded,
            total,
            started.elapsed().as_millis()
        );
        self.finish(succeeded, total - succeeded);
    }

    async fn fail_all(&self, claims: Vec<(ScrapeJob, Claim)>, message: String) {
        let total = claims.len();
        let reason = FailureReason::log_only(message);
        for (job, claim) in claims {
            self.emit(ScrapeResult::Failure {
                gstin: job.gstin,
                reason: reason.clone(),
            })
            .await;
            drop(claim);
        }
        self.finish(0, total);
    }

    /// Scrapes one taxpayer and emits its result. The claim is released after the send.
    async fn process(&self, browser: &dyn PortalBrowser, job: ScrapeJob, claim: Claim) -> bool {
        let gstin = job.gstin.clone();
        let result = match AssertUnwindSafe(self.scrape_one(browser, job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => crashed(gstin, &*panic),
        };
        let ok = result.is_success();
        if let ScrapeResult::Failure { gstin, reason } = &result {
            warn!("{}: {}", gstin, reason.message);
            if reason.notify {
                self.progress.publish(ProgressEvent::from(reason));
            }
        }
        self.emit(result).await;
        drop(claim);
        ok
    }

    async fn scrape_one(&self, browser: &dyn PortalBrowser, job: ScrapeJob) -> ScrapeResult {
        let ScrapeJob { gstin, credentials } = job;

        let Some(credentials) = self.settings.shared_credentials.clone().or(credentials) else {
            return ScrapeResult::Failure {
                reason: FailureReason::notify(format!(
                    "GST credentials are not configured for {}",
                    gstin
                )),
                gstin,
            };
        };

        let page = match browser.open_session(&gstin).await {
            Ok(p) => p,
            Err(e) => {
                return ScrapeResult::Failure {
                    reason: FailureReason::log_only(format!(
                        "Could not open a browser session: {}",
                        e
                    )),
                    gstin,
                }
            }
        };

        let outcome = AssertUnwindSafe(self.driver.scrape(
            page.as_ref(),
            &gstin,
            &self.settings.base_url,
            &credentials,
        ))
        .catch_unwind()
        .await;
        if let Err(panic) = AssertUnwindSafe(page.close()).catch_unwind().await {
            warn!("{}: closing the session panicked: {}", gstin, panic_message(&*panic));
        }

        match outcome {
            Ok(Ok(detail)) => ScrapeResult::Success { gstin, detail },
            Ok(Err(reason)) => ScrapeResult::Failure { gstin, reason },
            Err(panic) => crashed(gstin, &*panic),
        }
    }

    async fn emit(&self, result: ScrapeResult) {
        let gstin = result.gstin().clone();
        if !self.tx.send(result).await {
            warn!("{}: result dropped, batch receiver is gone", gstin);
        }
    }

    fn finish(&self, succeeded: usize, failed: usize) {
        self.progress
            .publish(ProgressEvent::summary(succeeded, failed));
        self.tx.close();
    }
}

fn crashed(gstin: Gstin, panic: &(dyn Any + Send)) -> ScrapeResult {
    error!("{}: scrape task panicked: {}", gstin, panic_message(panic));
    ScrapeResult::Failure {
        reason: FailureReason::log_only(format!("Unexpected failure while scraping {}", gstin)),
        gstin,
    }
}
