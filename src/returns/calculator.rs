use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::period::TaxPeriod;
use crate::core::types::{DerivedReturnStatus, FilingRecord, Gstin, ReturnStatus, ReturnType};

/// Grace windows, in days past the close of the period following the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuePolicy {
    pub monthly_grace_days: u32,
    pub annual_grace_days: u32,
}

impl Default for DuePolicy {
    fn default() -> Self {
        Self {
            monthly_grace_days: 12,
            annual_grace_days: 21,
        }
    }
}

impl DuePolicy {
    pub fn grace_days(&self, return_type: ReturnType) -> u32 {
        if return_type.is_annual() {
            self.annual_grace_days
        } else {
            self.monthly_grace_days
        }
    }
}

/// Whether the taxpayer is being synced for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Every return type found gets a state immediately.
    New,
    /// Return types outside `tracked` are emitted with no state, for triage.
    Existing { tracked: HashSet<ReturnType> },
}

impl EntryKind {
    fn assigns_state(&self, return_type: ReturnType) -> bool {
        match self {
            EntryKind::New => true,
            EntryKind::Existing { tracked } => tracked.contains(&return_type),
        }
    }
}

/// Derives per-return-type compliance state from raw filing history. Pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCalculator {
    policy: DuePolicy,
}

impl StatusCalculator {
    pub fn new(policy: DuePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DuePolicy {
        self.policy
    }

    /// One status per return type that has at least one filed record, ordered by return type.
    ///
    /// The result does not depend on the order of `records`.
    pub fn compute(
        &self,
        gstin: &Gstin,
        records: &[FilingRecord],
        now: NaiveDate,
        entry: &EntryKind,
    ) -> Vec<DerivedReturnStatus> {
        let mut filed: BTreeMap<ReturnType, Vec<&FilingRecord>> = BTreeMap::new();
        for record in records.iter().filter(|r| r.is_filed()) {
            match record.parsed_return_type() {
                Some(rt) => filed.entry(rt).or_default().push(record),
                None => debug!(
                    "{}: ignoring filing of untracked return type {:?}",
                    gstin, record.return_type
                ),
            }
        }

        filed
            .into_iter()
            .filter_map(|(return_type, mut group)| {
                group.sort_by(|a, b| newest_first(a, b));
                let anchor = group[0];
                self.derive(gstin, return_type, anchor, now, entry)
            })
            .collect()
    }

    fn derive(
        &self,
        gstin: &Gstin,
        return_type: ReturnType,
        anchor: &FilingRecord,
        now: NaiveDate,
        entry: &EntryKind,
    ) -> Option<DerivedReturnStatus> {
        let Some(anchor_period) = TaxPeriod::parse(&anchor.tax_period) else {
            warn!(
                "{}: {} anchor has unreadable tax period {:?}; skipped",
                gstin, return_type, anchor.tax_period
            );
            return None;
        };
        let filed_date = anchor.filed_date();

        let step = |n: i64| {
            if return_type.is_annual() {
                anchor_period.add_years(n)
            } else {
                anchor_period.add_months(n)
            }
        };
        let next = step(1);
        let elapsed = if return_type.is_annual() {
            anchor_period.whole_years_until(now)
        } else {
            anchor_period.whole_months_until(now)
        };

        let deadline = next.close() + chrono::Duration::days(i64::from(self.policy.grace_days(return_type)));
        let on_time = filed_date.is_some_and(|d| d < deadline);

        let (status, tax_period, pending_periods) = if elapsed <= 0 && on_time {
            (ReturnStatus::Filed, anchor_period, Vec::new())
        } else {
            let pending = (1..=elapsed).map(|n| step(n).label()).collect();
            (return_type.default_action(), next, pending)
        };

        let status = entry.assigns_state(return_type).then_some(status);
        if status.is_none() {
            debug!("{}: {} is new for this taxpayer; left for triage", gstin, return_type);
        }

        Some(DerivedReturnStatus {
            gstin: gstin.clone(),
            return_type,
            last_filed_date: filed_date,
            last_filed_period: anchor_period.label(),
            status,
            tax_period: tax_period.label(),
            pending_periods,
            arn: anchor.arn.clone(),
            mode_of_filing: anchor.mode_of_filing.clone(),
        })
    }
}

/// Filing date descending with unparsable dates last; ties go to the later period, then ARN.
fn newest_first(a: &FilingRecord, b: &FilingRecord) -> Ordering {
    let by_date = match (a.filed_date(), b.filed_date()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date
        .then_with(|| {
            let pa = TaxPeriod::parse(&a.tax_period);
            let pb = TaxPeriod::parse(&b.tax_period);
            pb.cmp(&pa)
        })
        .then_with(|| b.arn.cmp(&a.arn))
}
