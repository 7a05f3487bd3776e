//! Audio CAPTCHA resolution via an external speech-to-text provider.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::TranscriptionSection;
use crate::core::error::{CaptchaError, ConfigError, TranscriptionError};

/// Audio staged on disk for the duration of one transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub path: PathBuf,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError>;
}

// ── Scoped artifact ──────────────────────────────────────────────────────────

/// `<scratch>/<request id>.mp3`, removed on drop whatever the outcome.
struct AudioArtifact {
    clip: AudioClip,
}

impl AudioArtifact {
    async fn write(dir: &Path, request_id: &str, bytes: &[u8]) -> Result<Self, std::io::Error> {
        tokio::fs::create_dir_all(dir).await?;
        let name: String = request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}.mp3", name));
        tokio::fs::write(&path, bytes).await?;
        Ok(Self {
            clip: AudioClip { path },
        })
    }
}

impl Drop for AudioArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.clip.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", self.clip.path.display(), e);
            }
        }
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

fn non_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9 ]+").expect("valid transcript filter"))
}

/// Keeps ASCII digits and spaces; the portal's CAPTCHA alphabet is numeric.
pub fn sanitize_transcript(raw: &str) -> String {
    non_digits().replace_all(raw, "").trim().to_string()
}

/// Turns a captured audio payload into the text typed into the CAPTCHA field.
#[derive(Clone)]
pub struct CaptchaResolver {
    transcriber: Arc<dyn Transcriber>,
    scratch_dir: PathBuf,
}

impl CaptchaResolver {
    pub fn new(transcriber: Arc<dyn Transcriber>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            transcriber,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub async fn resolve(&self, request_id: &str, audio: &[u8]) -> Result<String, CaptchaError> {
        let artifact = AudioArtifact::write(&self.scratch_dir, request_id, audio).await?;
        let raw = self.transcriber.transcribe(&artifact.clip).await?;
        drop(artifact);

        let code = sanitize_transcript(&raw);
        debug!("captcha transcript {:?} -> {:?}", raw, code);
        if code.chars().all(|c| c == ' ') {
            return Err(CaptchaError::EmptyTranscript(raw));
        }
        Ok(code)
    }
}

// ── AssemblyAI ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    id: String,
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// AssemblyAI REST client: upload, create a transcript, poll until done.
pub struct AssemblyAiTranscriber {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl AssemblyAiTranscriber {
    pub fn from_config(
        http: reqwest::Client,
        cfg: &TranscriptionSection,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            http,
            api_key: cfg.resolve_api_key()?,
            base_url: cfg.resolve_base_url().trim_end_matches('/').to_string(),
            poll_interval: cfg.resolve_poll_interval(),
            max_polls: cfg.resolve_max_polls(),
        })
    }

    async fn upload(&self, bytes: Vec<u8>) -> Result<String, TranscriptionError> {
        let url = format!("{}/v2/upload", self.base_url);
        retry(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(200))
                .with_max_interval(Duration::from_secs(2))
                .with_max_elapsed_time(Some(Duration::from_secs(10)))
                .build(),
            || async {
                let resp = self
                    .http
                    .post(&url)
                    .header("authorization", &self.api_key)
                    .body(bytes.clone())
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(TranscriptionError::from(e)))?;
                let status = resp.status();
                if status.is_server_error() || status.as_u16() == 429 {
                    return Err(backoff::Error::transient(TranscriptionError::Http(format!(
                        "upload returned {}",
                        status
                    ))));
                }
                if !status.is_success() {
                    return Err(backoff::Error::permanent(TranscriptionError::Provider(
                        format!("upload returned {}", status),
                    )));
                }
                resp.json::<UploadResponse>()
                    .await
                    .map(|u| u.upload_url)
                    .map_err(|e| backoff::Error::permanent(TranscriptionError::from(e)))
            },
        )
        .await
    }
}

#[async_trait]
impl Transcriber for AssemblyAiTranscriber {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
        let bytes = tokio::fs::read(&clip.path)
            .await
            .map_err(|e| TranscriptionError::Http(format!("reading {}: {}", clip.path.display(), e)))?;
        let audio_url = self.upload(bytes).await?;

        let created: TranscriptResponse = self
            .http
            .post(format!("{}/v2/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(&serde_json::json!({ "audio_url": audio_url }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!("transcript {} created", created.id);

        for _ in 0..self.max_polls {
            let t: TranscriptResponse = self
                .http
                .get(format!("{}/v2/transcript/{}", self.base_url, created.id))
                .header("authorization", &self.api_key)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            match t.status.as_str() {
                "completed" => return Ok(t.text.unwrap_or_default()),
                "error" => {
                    return Err(TranscriptionError::Provider(
                        t.error.unwrap_or_else(|| "unknown error".to_string()),
                    ))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(TranscriptionError::Timeout(self.max_polls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        reply: Result<String, String>,
        seen: Mutex<Vec<(PathBuf, bool)>>,
    }

    #[async_trait]
    impl Transcriber for Recording {
        async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
            self.seen
                .lock()
                .unwrap()
                .push((clip.path.clone(), clip.path.exists()));
            self.reply.clone().map_err(TranscriptionError::Provider)
        }
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gst-scout-captcha-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn transcript_keeps_digits_and_spaces() {
        assert_eq!(sanitize_transcript("4 7 1, 9 0 2."), "4 7 1 9 0 2");
        assert_eq!(sanitize_transcript("Four seven 12."), "12");
    }

    #[tokio::test]
    async fn artifact_exists_during_transcription_and_is_removed_after() {
        let t = Arc::new(Recording {
            reply: Ok("1 2 3 4 5 6".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let dir = scratch("ok");
        let resolver = CaptchaResolver::new(t.clone(), &dir);
        let code = resolver.resolve("1000.42", b"ID3").await.unwrap();
        assert_eq!(code, "1 2 3 4 5 6");

        let seen = t.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].1, "artifact missing while transcribing");
        assert_eq!(seen[0].0, dir.join("1000.42.mp3"));
        assert!(!seen[0].0.exists());
    }

    #[tokio::test]
    async fn provider_failure_still_removes_artifact() {
        let t = Arc::new(Recording {
            reply: Err("quota".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let resolver = CaptchaResolver::new(t.clone(), scratch("err"));
        let err = resolver.resolve("7", b"ID3").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Transcription(_)));
        assert!(!t.seen.lock().unwrap()[0].0.exists());
    }

    #[tokio::test]
    async fn transcript_without_digits_is_rejected() {
        let t = Arc::new(Recording {
            reply: Ok("hello".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let resolver = CaptchaResolver::new(t, scratch("empty"));
        assert!(matches!(
            resolver.resolve("8", b"ID3").await,
            Err(CaptchaError::EmptyTranscript(_))
        ));
    }
}
