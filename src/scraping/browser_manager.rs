//! Native browser management using `chromiumoxide`.
//!
//! * Finding a usable browser executable (Chrome → Chromium → Brave, cross-platform).
//! * Building the launch config.
//! * `ChromiumLauncher` / `ChromiumBrowser`: one browser process per batch, one
//!   isolated browser context per taxpayer so cookies never leak between logins.

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::{FutureExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::page::{CdpPage, PortalPage};
use crate::core::config::BrowserSection;
use crate::core::error::PortalError;
use crate::core::types::Gstin;

// ── Seams ────────────────────────────────────────────────────────────────────

/// Starts the browser process for one batch.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn PortalBrowser>, PortalError>;
}

/// A running browser owned by exactly one batch.
#[async_trait]
pub trait PortalBrowser: Send + Sync {
    /// A fresh tab in a fresh isolated context.
    async fn open_session(&self, gstin: &Gstin) -> Result<Box<dyn PortalPage>, PortalError>;

    /// Terminates the process. Never fails.
    async fn close(self: Box<Self>);
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH lookup via `which`.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    for exe in [
        "google-chrome",
        "chromium",
        "chromium-browser",
        "chrome",
        "brave-browser",
        "brave",
    ] {
        if let Ok(found) = which::which(exe) {
            return Some(found.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Launch config ────────────────────────────────────────────────────────────

/// Launch config with container-safe flags; audio is muted.
pub fn build_browser_config(exe: &str, headless: bool) -> Result<BrowserConfig, PortalError> {
    let (width, height) = (1366, 900);
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-sync")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled");

    if !headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| PortalError::Launch(format!("failed to build browser config: {}", e)))
}

// ── Chromium implementation ──────────────────────────────────────────────────

pub struct ChromiumLauncher {
    executable: Option<String>,
    headless: bool,
}

impl ChromiumLauncher {
    pub fn new(executable: Option<String>, headless: bool) -> Self {
        Self {
            executable,
            headless,
        }
    }

    pub fn from_config(cfg: &BrowserSection) -> Self {
        Self::new(cfg.resolve_executable(), cfg.resolve_headless())
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn PortalBrowser>, PortalError> {
        let exe = self
            .executable
            .clone()
            .or_else(find_chrome_executable)
            .ok_or_else(|| {
                PortalError::Launch(
                    "no Chromium-family browser found; install Chrome/Chromium or set CHROME_EXECUTABLE"
                        .to_string(),
                )
            })?;

        info!("launching browser ({}, headless={})", exe, self.headless);
        let config = build_browser_config(&exe, self.headless)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PortalError::Launch(format!("{} ({})", e, exe)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        Ok(Box::new(ChromiumBrowser {
            inner: Arc::new(Mutex::new(Some(browser))),
            handler_task,
        }))
    }
}

pub struct ChromiumBrowser {
    inner: Arc<Mutex<Option<Browser>>>,
    handler_task: JoinHandle<()>,
}

async fn dispose_context(inner: Arc<Mutex<Option<Browser>>>, context: BrowserContextId) {
    let guard = inner.lock().await;
    if let Some(browser) = guard.as_ref() {
        if let Err(e) = browser
            .execute(DisposeBrowserContextParams::new(context))
            .await
        {
            warn!("browser context dispose error (non-fatal): {}", e);
        }
    }
}

#[async_trait]
impl PortalBrowser for ChromiumBrowser {
    async fn open_session(&self, gstin: &Gstin) -> Result<Box<dyn PortalPage>, PortalError> {
        let guard = self.inner.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| PortalError::Launch("browser already closed".to_string()))?;

        let context = browser
            .execute(CreateBrowserContextParams::default())
            .await?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context.clone())
            .build()
            .map_err(PortalError::Protocol)?;

        let page = match browser.new_page(target).await {
            Ok(p) => p,
            Err(e) => {
                drop(guard);
                dispose_context(self.inner.clone(), context).await;
                return Err(e.into());
            }
        };
        debug!("{}: isolated context {:?} opened", gstin, context);

        let inner = self.inner.clone();
        Ok(Box::new(
            CdpPage::new(page).on_close(move || dispose_context(inner, context).boxed()),
        ))
    }

    async fn close(self: Box<Self>) {
        let taken = self.inner.lock().await.take();
        if let Some(mut browser) = taken {
            if let Err(e) = browser.close().await {
                warn!("browser close error (non-fatal): {}", e);
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        info!("browser shut down");
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        // Best-effort cleanup when `close` was skipped (e.g. a panic unwound
        // past the owner). Drop cannot await.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Ok(mut guard) = self.inner.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                });
            }
        }
        self.handler_task.abort();
    }
}
