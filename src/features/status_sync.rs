//! Consumes a batch's result stream: derive statuses, persist per taxpayer.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::taxpayer_store::TaxpayerStore;
use crate::core::channel::SafeReceiver;
use crate::core::error::StoreError;
use crate::core::types::{Gstin, ScrapeResult};
use crate::returns::StatusCalculator;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Results that could not be written back.
    pub persisted_errors: Vec<(Gstin, String)>,
}

pub struct ReturnStatusSync {
    store: Arc<dyn TaxpayerStore>,
    calculator: StatusCalculator,
}

impl ReturnStatusSync {
    pub fn new(store: Arc<dyn TaxpayerStore>, calculator: StatusCalculator) -> Self {
        Self { store, calculator }
    }

    /// Runs until the batch closes its stream. One taxpayer's store error
    /// never stops the others.
    pub async fn drain(&self, mut results: SafeReceiver<ScrapeResult>, today: NaiveDate) -> SyncReport {
        let mut report = SyncReport::default();
        while let Some(result) = results.recv().await {
            let gstin = result.gstin().clone();
            match self.apply(result, today).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!("{}: could not persist scrape result: {}", gstin, e);
                    report.failed += 1;
                    report.persisted_errors.push((gstin, e.to_string()));
                }
            }
        }
        info!(
            "sync finished: {} updated, {} failed, {} not persisted",
            report.succeeded,
            report.failed,
            report.persisted_errors.len()
        );
        report
    }

    /// `Ok(true)` when fresh statuses were stored.
    pub async fn apply(&self, result: ScrapeResult, today: NaiveDate) -> Result<bool, StoreError> {
        match result {
            ScrapeResult::Success { gstin, detail } => {
                let taxpayer = self
                    .store
                    .get(&gstin)
                    .await?
                    .ok_or_else(|| StoreError::UnknownGstin(gstin.to_string()))?;
                let statuses = self.calculator.compute(
                    &gstin,
                    &detail.filings,
                    today,
                    &taxpayer.entry_kind(),
                );
                self.store
                    .apply_scrape(&gstin, detail.profile, statuses)
                    .await?;
                Ok(true)
            }
            ScrapeResult::Failure { gstin, reason } => {
                warn!("{}: recording failure: {}", gstin, reason.tagged());
                self.store.record_failure(&gstin, &reason).await?;
                Ok(false)
            }
        }
    }
}
