use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix marking failures that must reach an end user, not just the logs.
pub const NOTIFICATION_PREFIX: &str = "NOTIFICATION|";

/// Progress/notification code for user-facing notifications.
pub const NOTIFICATION_CODE: &str = "NOTIFICATION";

/// Date format used by the portal for filing dates (`dof`).
pub const FILING_DATE_FORMAT: &str = "%d-%m-%Y";

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid GSTIN `{0}`: expected 15 ASCII alphanumeric characters")]
pub struct InvalidGstin(pub String);

/// 15-character GST registration number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Gstin(String);

impl Gstin {
    pub fn parse(raw: &str) -> Result<Self, InvalidGstin> {
        let trimmed = raw.trim();
        if trimmed.len() == 15 && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(InvalidGstin(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Gstin {
    type Error = InvalidGstin;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Gstin::parse(&value)
    }
}

impl From<Gstin> for String {
    fn from(value: Gstin) -> Self {
        value.0
    }
}

impl fmt::Display for Gstin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Portal login pair. `Debug` never prints the password.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ── Return types & lifecycle states ──────────────────────────────────────────

/// Periodic return categories tracked by the calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReturnType {
    /// Outward supplies.
    #[serde(rename = "GSTR1")]
    Gstr1,
    /// Inward supplies.
    #[serde(rename = "GSTR2")]
    Gstr2,
    /// Monthly summary return.
    #[serde(rename = "GSTR3B")]
    Gstr3b,
    /// Annual return.
    #[serde(rename = "GSTR9")]
    Gstr9,
}

impl ReturnType {
    pub const ALL: [ReturnType; 4] = [
        ReturnType::Gstr1,
        ReturnType::Gstr2,
        ReturnType::Gstr3b,
        ReturnType::Gstr9,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReturnType::Gstr1 => "GSTR1",
            ReturnType::Gstr2 => "GSTR2",
            ReturnType::Gstr3b => "GSTR3B",
            ReturnType::Gstr9 => "GSTR9",
        }
    }

    /// Portal spellings vary (`GSTR2B`, `gstr3b`, `GSTR-9`); unknown types yield `None`.
    pub fn from_portal(raw: &str) -> Option<Self> {
        let norm: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match norm.as_str() {
            "GSTR1" => Some(ReturnType::Gstr1),
            "GSTR2" | "GSTR2A" | "GSTR2B" => Some(ReturnType::Gstr2),
            "GSTR3B" => Some(ReturnType::Gstr3b),
            "GSTR9" => Some(ReturnType::Gstr9),
            _ => None,
        }
    }

    pub fn is_annual(self) -> bool {
        matches!(self, ReturnType::Gstr9)
    }

    /// Action owed for a period that has not been filed yet.
    pub fn default_action(self) -> ReturnStatus {
        match self {
            ReturnType::Gstr1 | ReturnType::Gstr2 => ReturnStatus::CallForInvoice,
            ReturnType::Gstr3b | ReturnType::Gstr9 => ReturnStatus::TaxPayable,
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one return type for one taxpayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnStatus {
    CallForInvoice,
    InvoiceReceived,
    InvoiceEntry,
    TaxPayable,
    Filed,
}

impl ReturnStatus {
    /// States whose next transition happens on the portal, so a re-scrape can observe it.
    pub fn awaits_portal_confirmation(self) -> bool {
        matches!(self, ReturnStatus::InvoiceEntry | ReturnStatus::TaxPayable)
    }
}

// ── Portal payloads ──────────────────────────────────────────────────────────

/// One row of the portal's "Track Return Status" history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingRecord {
    #[serde(rename = "rtntype", default)]
    pub return_type: String,
    /// Filing date (`dd-mm-yyyy`), empty when unfiled.
    #[serde(rename = "dof", default)]
    pub filed_on: String,
    /// Tax period label (`MMYYYY`).
    #[serde(rename = "ret_prd", default)]
    pub tax_period: String,
    #[serde(rename = "fy", default)]
    pub financial_year: String,
    #[serde(default)]
    pub arn: String,
    #[serde(rename = "mof", default)]
    pub mode_of_filing: String,
    #[serde(default)]
    pub valid: String,
    #[serde(default)]
    pub status: String,
}

impl FilingRecord {
    pub fn is_filed(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("filed")
    }

    pub fn parsed_return_type(&self) -> Option<ReturnType> {
        ReturnType::from_portal(&self.return_type)
    }

    pub fn filed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.filed_on.trim(), FILING_DATE_FORMAT).ok()
    }
}

/// Principal place of business as reported on the taxpayer profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrincipalAddress {
    #[serde(default, alias = "bnm")]
    pub building: String,
    #[serde(default, alias = "bno")]
    pub door_no: String,
    #[serde(default, alias = "flno")]
    pub floor: String,
    #[serde(default, alias = "st")]
    pub street: String,
    #[serde(default, alias = "loc")]
    pub location: String,
    #[serde(default)]
    pub district: String,
    #[serde(default, alias = "stcd")]
    pub state: String,
    #[serde(default, alias = "pncd")]
    pub pincode: String,
}

/// Taxpayer profile snapshot from `auth/profile/detail`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GstProfile {
    #[serde(default)]
    pub gstin: String,
    #[serde(default, alias = "lgnm", alias = "legalName")]
    pub name: String,
    #[serde(default, alias = "tradeNam", alias = "tradeName")]
    pub tradename: String,
    #[serde(default, alias = "rgdt", alias = "registrationDate")]
    pub registration_date: String,
    #[serde(default, alias = "ctb")]
    pub constitution: String,
    #[serde(default, alias = "dty", alias = "type")]
    pub taxpayer_type: String,
    #[serde(default, alias = "sts")]
    pub status: String,
    #[serde(default, alias = "stj")]
    pub state_jurisdiction: String,
    #[serde(default, alias = "ctj")]
    pub center_jurisdiction: String,
    #[serde(default, alias = "nba")]
    pub nature: Vec<String>,
    #[serde(default, alias = "einvoiceStatus")]
    pub einvoice_status: String,
    #[serde(default, alias = "pradr")]
    pub principal_address: Option<PrincipalAddress>,
}

// ── Derived status & scrape results ──────────────────────────────────────────

/// Calculator output for one (GSTIN, return type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedReturnStatus {
    pub gstin: Gstin,
    pub return_type: ReturnType,
    pub last_filed_date: Option<NaiveDate>,
    pub last_filed_period: String,
    /// `None` leaves a newly discovered return type for manual triage.
    pub status: Option<ReturnStatus>,
    /// Period the status refers to: the anchor when filed, otherwise the next one.
    pub tax_period: String,
    pub pending_periods: Vec<String>,
    pub arn: String,
    pub mode_of_filing: String,
}

/// Human-readable failure, optionally flagged for end-user notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    pub notify: bool,
}

impl FailureReason {
    pub fn log_only(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            notify: false,
        }
    }

    pub fn notify(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            notify: true,
        }
    }

    /// Parses the `NOTIFICATION|<message>` wire form.
    pub fn from_tagged(raw: &str) -> Self {
        match raw.strip_prefix(NOTIFICATION_PREFIX) {
            Some(rest) => Self::notify(rest),
            None => Self::log_only(raw),
        }
    }

    pub fn tagged(&self) -> String {
        if self.notify {
            format!("{}{}", NOTIFICATION_PREFIX, self.message)
        } else {
            self.message.clone()
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Raw data harvested for one taxpayer.
#[derive(Debug, Clone, PartialEq)]
pub struct GstDetail {
    pub profile: GstProfile,
    pub filings: Vec<FilingRecord>,
}

/// One terminal outcome per identifier on a batch's result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeResult {
    Success { gstin: Gstin, detail: GstDetail },
    Failure { gstin: Gstin, reason: FailureReason },
}

impl ScrapeResult {
    pub fn gstin(&self) -> &Gstin {
        match self {
            ScrapeResult::Success { gstin, .. } | ScrapeResult::Failure { gstin, .. } => gstin,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeResult::Success { .. })
    }
}

/// A taxpayer submitted to the orchestrator.
#[derive(Debug, Clone)]
pub struct ScrapeJob {
    pub gstin: Gstin,
    pub credentials: Option<Credentials>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gstin_is_normalised_and_validated() {
        let g = Gstin::parse(" 33aaacr5055k1z5 ").unwrap();
        assert_eq!(g.as_str(), "33AAACR5055K1Z5");
        assert!(Gstin::parse("33AAACR5055K1Z").is_err());
        assert!(Gstin::parse("33AAACR5055K1Z-").is_err());
    }

    #[test]
    fn enums_serialize_as_stable_strings() {
        assert_eq!(
            serde_json::to_string(&ReturnType::Gstr3b).unwrap(),
            "\"GSTR3B\""
        );
        assert_eq!(
            serde_json::to_string(&ReturnStatus::CallForInvoice).unwrap(),
            "\"CALL_FOR_INVOICE\""
        );
        let back: ReturnStatus = serde_json::from_str("\"TAX_PAYABLE\"").unwrap();
        assert_eq!(back, ReturnStatus::TaxPayable);
    }

    #[test]
    fn portal_return_type_spellings() {
        assert_eq!(ReturnType::from_portal("GSTR-9"), Some(ReturnType::Gstr9));
        assert_eq!(ReturnType::from_portal("gstr2b"), Some(ReturnType::Gstr2));
        assert_eq!(ReturnType::from_portal("GSTR4"), None);
    }

    #[test]
    fn failure_reason_tagging() {
        let r = FailureReason::from_tagged("NOTIFICATION|password expired");
        assert!(r.notify);
        assert_eq!(r.message, "password expired");
        assert_eq!(r.tagged(), "NOTIFICATION|password expired");
        assert!(!FailureReason::from_tagged("timeout").notify);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let c = Credentials::new("operator", "hunter2");
        assert!(!format!("{:?}", c).contains("hunter2"));
    }
}
