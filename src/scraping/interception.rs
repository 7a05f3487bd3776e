//! Correlating a UI action with the network response it triggers.
//!
//! The portal fires many background requests at once, so a capture is keyed on
//! the first request whose URL contains a fragment (never an `OPTIONS`
//! preflight) and completes when that request finishes or fails.

use base64::Engine;
use serde_json::Value;
use std::collections::HashSet;

use crate::core::error::PortalError;
use crate::core::types::{FilingRecord, GstProfile};

/// The responses the driver harvests, keyed by what they mean rather than their shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseRole {
    AudioCaptcha,
    Profile,
    FilingHistory,
}

impl ResponseRole {
    pub fn url_fragment(self) -> &'static str {
        match self {
            ResponseRole::AudioCaptcha => "/audiocaptcha",
            ResponseRole::Profile => "auth/profile/detail",
            ResponseRole::FilingHistory => "/returns/auth/api/returnstatus",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseRole::AudioCaptcha => "audio captcha",
            ResponseRole::Profile => "profile",
            ResponseRole::FilingHistory => "filing history",
        }
    }
}

/// Body of a matched response plus the browser's id for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub request_id: String,
    pub body: Vec<u8>,
}

/// A captured payload, resolved once by role.
#[derive(Debug, Clone, PartialEq)]
pub enum PortalPayload {
    Audio(Vec<u8>),
    Profile(GstProfile),
    FilingHistory(Vec<FilingRecord>),
}

impl PortalPayload {
    pub fn parse(role: ResponseRole, body: &[u8]) -> Result<Self, PortalError> {
        let bad = |reason: String| PortalError::Payload {
            role: role.as_str(),
            reason,
        };
        match role {
            ResponseRole::AudioCaptcha => {
                if body.is_empty() {
                    return Err(bad("empty audio body".to_string()));
                }
                Ok(PortalPayload::Audio(body.to_vec()))
            }
            ResponseRole::Profile => {
                let v: Value = serde_json::from_slice(body).map_err(|e| bad(e.to_string()))?;
                let inner = match v.get("data") {
                    Some(d) if d.is_object() => d.clone(),
                    _ => v,
                };
                let profile: GstProfile =
                    serde_json::from_value(inner).map_err(|e| bad(e.to_string()))?;
                Ok(PortalPayload::Profile(profile))
            }
            ResponseRole::FilingHistory => {
                let v: Value = serde_json::from_slice(body).map_err(|e| bad(e.to_string()))?;
                let list = match v {
                    Value::Array(_) => v,
                    Value::Object(ref map) => map
                        .get("data")
                        .and_then(|d| d.get("EFiledlist").or(Some(d)))
                        .filter(|d| d.is_array())
                        .or_else(|| map.get("EFiledlist"))
                        .cloned()
                        .ok_or_else(|| bad("no filing list in response".to_string()))?,
                    _ => return Err(bad("expected a JSON array or object".to_string())),
                };
                let records: Vec<FilingRecord> =
                    serde_json::from_value(list).map_err(|e| bad(e.to_string()))?;
                Ok(PortalPayload::FilingHistory(records))
            }
        }
    }
}

pub fn decode_body(body: &str, base64_encoded: bool) -> Result<Vec<u8>, PortalError> {
    if base64_encoded {
        base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| PortalError::Protocol(format!("response body is not valid base64: {}", e)))
    } else {
        Ok(body.as_bytes().to_vec())
    }
}

/// Network lifecycle signals, reduced to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSignal {
    RequestSent {
        request_id: String,
        url: String,
        method: String,
    },
    LoadingFinished {
        request_id: String,
    },
    LoadingFailed {
        request_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Fetch the body of this request.
    Finished(String),
    Failed { request_id: String, reason: String },
}

/// Tracks the first matching request and reports when it completes.
///
/// Completion signals can arrive on a different stream than the request
/// signal, so finishes seen before the match are remembered.
#[derive(Debug)]
pub struct ResponseMatcher {
    url_fragment: String,
    tracked: Option<String>,
    finished_early: HashSet<String>,
}

impl ResponseMatcher {
    pub fn new(url_fragment: impl Into<String>) -> Self {
        Self {
            url_fragment: url_fragment.into(),
            tracked: None,
            finished_early: HashSet::new(),
        }
    }

    pub fn url_fragment(&self) -> &str {
        &self.url_fragment
    }

    pub fn tracked(&self) -> Option<&str> {
        self.tracked.as_deref()
    }

    pub fn observe(&mut self, signal: NetworkSignal) -> Option<MatchOutcome> {
        match signal {
            NetworkSignal::RequestSent {
                request_id,
                url,
                method,
            } => {
                if self.tracked.is_some()
                    || method.eq_ignore_ascii_case("OPTIONS")
                    || !url.contains(&self.url_fragment)
                {
                    return None;
                }
                if self.finished_early.remove(&request_id) {
                    return Some(MatchOutcome::Finished(request_id));
                }
                self.tracked = Some(request_id);
                None
            }
            NetworkSignal::LoadingFinished { request_id } => match &self.tracked {
                Some(t) if *t == request_id => Some(MatchOutcome::Finished(request_id)),
                Some(_) => None,
                None => {
                    self.finished_early.insert(request_id);
                    None
                }
            },
            NetworkSignal::LoadingFailed { request_id, reason } => match &self.tracked {
                Some(t) if *t == request_id => Some(MatchOutcome::Failed { request_id, reason }),
                _ => None,
            },
        }
    }
}
