use std::time::Duration;
use thiserror::Error;

/// Configuration problems detected before any browser is launched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("GST portal settings are incomplete: missing {}", .0.join(", "))]
    MissingPortalSettings(Vec<&'static str>),

    #[error("GST portal base URL `{url}` is not a valid URL: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("transcription API key is not configured (set ASSEMBLYAI_API_KEY)")]
    MissingTranscriptionKey,
}

/// Browser, DOM, and network faults raised while driving the portal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("element `{selector}` did not appear within {timeout:?}")]
    ElementTimeout { selector: String, timeout: Duration },

    #[error("no element `{selector}` with text matching /{pattern}/")]
    ElementNotFound { selector: String, pattern: String },

    #[error("no response for `{url_fragment}` within {timeout:?}")]
    InterceptTimeout {
        url_fragment: String,
        timeout: Duration,
    },

    #[error("request for `{url_fragment}` failed: {reason}")]
    LoadFailed { url_fragment: String, reason: String },

    #[error("unexpected {role} payload: {reason}")]
    Payload { role: &'static str, reason: String },

    #[error("browser protocol error: {0}")]
    Protocol(String),
}

impl From<chromiumoxide::error::CdpError> for PortalError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        PortalError::Protocol(err.to_string())
    }
}

/// Failures of the external speech-to-text provider.
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription request failed: {0}")]
    Http(String),

    #[error("transcription provider rejected the audio: {0}")]
    Provider(String),

    #[error("transcription did not complete after {0} polls")]
    Timeout(u32),
}

impl From<reqwest::Error> for TranscriptionError {
    fn from(err: reqwest::Error) -> Self {
        TranscriptionError::Http(err.to_string())
    }
}

/// CAPTCHA resolution failures; each one consumes an attempt of the retry budget.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error("could not stage audio artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript `{0}` contains no digits")]
    EmptyTranscript(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("GSTIN {0} does not exist in the store")]
    UnknownGstin(String),
}

/// Why a refresh cycle could not be scheduled.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
