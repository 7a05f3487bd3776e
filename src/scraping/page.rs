//! Browser-page primitives the portal driver is written against.
//!
//! `PortalPage` is the seam between the login/navigation logic and a real
//! Chromium tab; tests drive the same logic through a scripted page.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, GetResponseBodyParams,
};
use chromiumoxide::{Element, Page};
use futures::StreamExt;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, warn};

use super::interception::{decode_body, CapturedResponse, MatchOutcome, NetworkSignal, ResponseMatcher};
use crate::core::error::PortalError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Short randomized pause before an input action.
async fn human_pause() {
    use rand::distr::{Distribution, Uniform};
    let ms = {
        let mut rng = rand::rng();
        Uniform::new(80u64, 320)
            .map(|d| d.sample(&mut rng))
            .unwrap_or(150)
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// An element addressed by CSS selector, optionally narrowed to the first
/// match whose text satisfies a regular expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub selector: &'static str,
    pub text: Option<&'static str>,
}

impl Target {
    pub const fn css(selector: &'static str) -> Self {
        Self {
            selector,
            text: None,
        }
    }

    pub const fn with_text(selector: &'static str, pattern: &'static str) -> Self {
        Self {
            selector,
            text: Some(pattern),
        }
    }

    pub fn matches_text(&self, text: &str) -> Result<bool, PortalError> {
        match self.text {
            None => Ok(true),
            Some(p) => Regex::new(p)
                .map(|re| re.is_match(text))
                .map_err(|e| PortalError::Protocol(format!("bad text pattern /{}/: {}", p, e))),
        }
    }

    fn not_found(&self) -> PortalError {
        PortalError::ElementNotFound {
            selector: self.selector.to_string(),
            pattern: self.text.unwrap_or(".*").to_string(),
        }
    }
}

#[async_trait]
pub trait PortalPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), PortalError>;

    /// Index of the first target present within `timeout`, `None` on timeout.
    async fn wait_any(
        &self,
        targets: &[Target],
        timeout: Duration,
    ) -> Result<Option<usize>, PortalError>;

    /// Waits until the element is rendered with a layout box.
    async fn wait_visible(&self, target: Target, timeout: Duration) -> Result<(), PortalError>;

    /// Clears the field, then types `text` into it.
    async fn fill(&self, target: Target, text: &str) -> Result<(), PortalError>;

    async fn click(&self, target: Target) -> Result<(), PortalError>;

    async fn hover(&self, target: Target) -> Result<(), PortalError>;

    /// Registers network listeners, performs `trigger`, then waits for the
    /// first non-preflight request whose URL contains `url_fragment`.
    async fn intercept(
        &self,
        url_fragment: &str,
        trigger: Target,
        timeout: Duration,
    ) -> Result<CapturedResponse, PortalError>;

    /// Releases the tab and everything scoped to it. Never fails.
    async fn close(self: Box<Self>);
}

/// Convenience over `wait_any` for a single target.
pub async fn wait_for(
    page: &dyn PortalPage,
    target: Target,
    timeout: Duration,
) -> Result<(), PortalError> {
    match page.wait_any(&[target], timeout).await? {
        Some(_) => Ok(()),
        None => Err(PortalError::ElementTimeout {
            selector: target.selector.to_string(),
            timeout,
        }),
    }
}

// ── Chromium implementation ─────────────────────────────────────────────────

/// A tab inside its own browser context.
pub struct CdpPage {
    page: Page,
    on_close: Option<Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send + Sync>>,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            on_close: None,
        }
    }

    /// Runs `f` after the tab is closed, e.g. to dispose its browser context.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }

    async fn find(&self, target: Target) -> Result<Option<Element>, PortalError> {
        let elements = match self.page.find_elements(target.selector).await {
            Ok(els) => els,
            // chromiumoxide reports "no node" as an error
            Err(_) => return Ok(None),
        };
        if target.text.is_none() {
            return Ok(elements.into_iter().next());
        }
        for el in elements {
            let text = el.inner_text().await.ok().flatten().unwrap_or_default();
            if target.matches_text(&text)? {
                return Ok(Some(el));
            }
        }
        Ok(None)
    }

    async fn require(&self, target: Target) -> Result<Element, PortalError> {
        self.find(target).await?.ok_or_else(|| target.not_found())
    }

    async fn is_visible(&self, target: Target) -> Result<bool, PortalError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return !!(el && el.offsetParent !== null); }})()",
            serde_json::to_string(target.selector).unwrap_or_default()
        );
        let v = self.page.evaluate(script).await?;
        Ok(v.into_value::<bool>().unwrap_or(false))
    }
}

#[async_trait]
impl PortalPage for CdpPage {
    async fn goto(&self, url: &str) -> Result<(), PortalError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn wait_any(
        &self,
        targets: &[Target],
        timeout: Duration,
    ) -> Result<Option<usize>, PortalError> {
        let poll = async {
            loop {
                for (i, t) in targets.iter().enumerate() {
                    if self.find(*t).await?.is_some() {
                        return Ok::<_, PortalError>(i);
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(found) => found.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn wait_visible(&self, target: Target, timeout: Duration) -> Result<(), PortalError> {
        let poll = async {
            while !self.is_visible(target).await? {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok::<_, PortalError>(())
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| PortalError::ElementTimeout {
                selector: target.selector.to_string(),
                timeout,
            })?
    }

    async fn fill(&self, target: Target, text: &str) -> Result<(), PortalError> {
        let el = self.require(target).await?;
        human_pause().await;
        el.call_js_fn("function() { this.value = ''; }", false)
            .await?;
        el.click().await?.type_str(text).await?;
        Ok(())
    }

    async fn click(&self, target: Target) -> Result<(), PortalError> {
        let el = self.require(target).await?;
        human_pause().await;
        el.click().await?;
        Ok(())
    }

    async fn hover(&self, target: Target) -> Result<(), PortalError> {
        self.require(target).await?.hover().await?;
        Ok(())
    }

    async fn intercept(
        &self,
        url_fragment: &str,
        trigger: Target,
        timeout: Duration,
    ) -> Result<CapturedResponse, PortalError> {
        self.page.execute(network::EnableParams::default()).await?;

        // Listeners must exist before the trigger fires.
        let mut sent = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;

        self.click(trigger).await?;

        let mut matcher = ResponseMatcher::new(url_fragment);
        let correlate = async {
            loop {
                let signal = tokio::select! {
                    biased;
                    Some(e) = sent.next() => {
                        debug!("request: {} {}", e.request.method, e.request.url);
                        NetworkSignal::RequestSent {
                            request_id: e.request_id.inner().clone(),
                            url: e.request.url.clone(),
                            method: e.request.method.clone(),
                        }
                    }
                    Some(e) = finished.next() => NetworkSignal::LoadingFinished {
                        request_id: e.request_id.inner().clone(),
                    },
                    Some(e) = failed.next() => NetworkSignal::LoadingFailed {
                        request_id: e.request_id.inner().clone(),
                        reason: e.error_text.clone(),
                    },
                    else => return Err(PortalError::Protocol("network event streams closed".to_string())),
                };
                if let Some(outcome) = matcher.observe(signal) {
                    return Ok(outcome);
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, correlate)
            .await
            .map_err(|_| PortalError::InterceptTimeout {
                url_fragment: url_fragment.to_string(),
                timeout,
            })??;

        match outcome {
            MatchOutcome::Finished(request_id) => {
                let resp = self
                    .page
                    .execute(GetResponseBodyParams::new(network::RequestId::new(
                        request_id.clone(),
                    )))
                    .await?;
                let body = decode_body(&resp.result.body, resp.result.base64_encoded)?;
                Ok(CapturedResponse { request_id, body })
            }
            MatchOutcome::Failed { reason, .. } => Err(PortalError::LoadFailed {
                url_fragment: url_fragment.to_string(),
                reason,
            }),
        }
    }

    async fn close(self: Box<Self>) {
        let CdpPage { page, on_close } = *self;
        if let Err(e) = page.close().await {
            warn!("tab close error (non-fatal): {}", e);
        }
        if let Some(f) = on_close {
            f().await;
        }
    }
}
