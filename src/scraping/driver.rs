//! GST portal login/CAPTCHA state machine and navigation to the two data payloads.
//!
//! Every browser fault in here ends as a `LoginOutcome` or `FailureReason`;
//! nothing propagates raw to the orchestrator.

use tracing::{debug, error, info, warn};

use super::captcha::CaptchaResolver;
use super::interception::{PortalPayload, ResponseRole};
use super::page::{wait_for, PortalPage, Target};
use crate::core::config::PortalTimeouts;
use crate::core::error::PortalError;
use crate::core::types::{Credentials, FailureReason, GstDetail, Gstin};

/// DOM landmarks of the portal.
pub mod selectors {
    use super::Target;

    pub const USERNAME: Target = Target::css("#username");
    pub const PASSWORD: Target = Target::css("#user_pass");
    pub const CAPTCHA_IMAGE: Target = Target::css("#imgCaptcha");
    pub const AUDIO_TRIGGER: Target = Target::css("i.fa.fa-volume-up");
    pub const CAPTCHA_INPUT: Target = Target::css("#captcha");
    pub const SUBMIT: Target = Target::css("[type=submit]");

    pub const DASHBOARD: Target = Target::css(".dp-widgt");
    pub const MODAL: Target = Target::css("body.modal-open");
    pub const REMIND_LATER: Target =
        Target::with_text("#adhrtableV div.modal-footer > a", "Remind me later");
    pub const FILE_AMENDMENT: Target =
        Target::with_text("#confirmDlg div.modal-footer > a", "FILE AMENDMENT");

    pub const PASSWORD_CHANGE: Target = Target::css("#submitpwd");
    pub const CAPTCHA_ERROR: Target = Target::with_text("span.err", "Enter valid Letters shown");
    pub const CREDENTIALS_ERROR: Target =
        Target::with_text("div.alert-danger", "Invalid Username or Password");

    pub const PROFILE_LINK: Target = Target::with_text(".dp-widgt > a.tp-pfl-lnk", "View Profile");
    pub const SERVICES_MENU: Target =
        Target::with_text(".nav > .menuList > a.dropdown-toggle", "Services");
    pub const RETURNS_MENU: Target = Target::with_text(".smenu > .has-sub > a", "Returns");
    pub const TRACK_RETURN_STATUS: Target =
        Target::with_text("ul.isubmenu.ret.post > li > a", "Track Return Status");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Init,
    CredentialsEntered,
    CaptchaRequested,
    CaptchaSubmitted,
    Landed,
    CaptchaRetry,
    CredentialsInvalid,
    PasswordExpired,
    UnknownBlock,
}

impl LoginState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoginState::Landed
                | LoginState::CredentialsInvalid
                | LoginState::PasswordExpired
                | LoginState::UnknownBlock
        )
    }
}

fn log_state(gstin: &Gstin, state: LoginState) {
    info!("{}: login_state={:?}", gstin, state);
}

/// Result of `PortalDriver::login`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub landed: bool,
    /// Set whenever `landed` is false.
    pub reason: Option<FailureReason>,
    pub state: LoginState,
    pub attempts: u32,
}

impl LoginOutcome {
    fn landed(attempts: u32) -> Self {
        Self {
            landed: true,
            reason: None,
            state: LoginState::Landed,
            attempts,
        }
    }

    fn failed(state: LoginState, reason: FailureReason, attempts: u32) -> Self {
        Self {
            landed: false,
            reason: Some(reason),
            state,
            attempts,
        }
    }
}

/// What one pass through the CAPTCHA form produced.
enum Attempt {
    Done(LoginOutcome),
    /// Consumes one unit of the CAPTCHA budget.
    Retry(String),
}

enum Landing {
    Dashboard,
    Dialog(LoginState, FailureReason),
    TimedOut,
}

pub const BANK_NOT_LINKED: &str = "Bank account is not linked with GSTIN";
pub const UNKNOWN_DIALOG: &str =
    "An unknown dialog on the GST portal is preventing access to the GST details";
pub const PAYLOAD_FAILURE: &str = "Not able to extract response from GST API calls";

pub struct PortalDriver {
    resolver: CaptchaResolver,
    timeouts: PortalTimeouts,
    captcha_attempts: u32,
}

impl PortalDriver {
    pub fn new(resolver: CaptchaResolver, timeouts: PortalTimeouts, captcha_attempts: u32) -> Self {
        Self {
            resolver,
            timeouts,
            captcha_attempts: captcha_attempts.max(1),
        }
    }

    pub fn timeouts(&self) -> PortalTimeouts {
        self.timeouts
    }

    /// Opens the login page, logs in, and harvests profile plus filing history.
    pub async fn scrape(
        &self,
        page: &dyn PortalPage,
        gstin: &Gstin,
        base_url: &str,
        credentials: &Credentials,
    ) -> Result<GstDetail, FailureReason> {
        page.goto(base_url).await.map_err(|e| {
            FailureReason::log_only(format!("GST portal did not load: {}", e))
        })?;

        let outcome = self.login(page, gstin, credentials).await;
        if !outcome.landed {
            return Err(outcome.reason.unwrap_or_else(|| {
                FailureReason::log_only("GST portal login failed for an unknown reason")
            }));
        }

        let detail = self.fetch_detail(page).await.map_err(|e| {
            warn!("{}: payload capture failed: {}", gstin, e);
            FailureReason::log_only(format!("{}: {}", PAYLOAD_FAILURE, e))
        })?;

        if !detail.profile.gstin.is_empty() && !detail.profile.gstin.eq_ignore_ascii_case(gstin.as_str()) {
            warn!(
                "{}: portal profile belongs to {}",
                gstin, detail.profile.gstin
            );
        }
        info!(
            "{}: harvested profile and {} filing records",
            gstin,
            detail.filings.len()
        );
        Ok(detail)
    }

    /// `Login(credentials) -> (landed, reason)`, bounded by the CAPTCHA budget.
    pub async fn login(
        &self,
        page: &dyn PortalPage,
        gstin: &Gstin,
        credentials: &Credentials,
    ) -> LoginOutcome {
        log_state(gstin, LoginState::Init);
        let mut last_retry = String::new();

        for attempt in 1..=self.captcha_attempts {
            debug!("{}: login attempt {}/{}", gstin, attempt, self.captcha_attempts);
            match self.attempt(page, gstin, credentials, attempt).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Retry(why) => {
                    log_state(gstin, LoginState::CaptchaRetry);
                    warn!("{}: attempt {} needs a retry: {}", gstin, attempt, why);
                    last_retry = why;
                }
            }
        }

        error!(
            "{}: giving up after {} CAPTCHA attempts",
            gstin, self.captcha_attempts
        );
        LoginOutcome::failed(
            LoginState::CaptchaRetry,
            FailureReason::log_only(format!(
                "CAPTCHA could not be solved after {} attempts (last: {})",
                self.captcha_attempts, last_retry
            )),
            self.captcha_attempts,
        )
    }

    async fn attempt(
        &self,
        page: &dyn PortalPage,
        gstin: &Gstin,
        credentials: &Credentials,
        attempt: u32,
    ) -> Attempt {
        if let Err(e) = self.enter_credentials(page, credentials).await {
            log_state(gstin, LoginState::UnknownBlock);
            return Attempt::Done(LoginOutcome::failed(
                LoginState::UnknownBlock,
                FailureReason::log_only(format!(
                    "Something went wrong while entering the GST credentials: {}",
                    e
                )),
                attempt,
            ));
        }
        log_state(gstin, LoginState::CredentialsEntered);

        let (request_id, audio) = match page
            .intercept(
                ResponseRole::AudioCaptcha.url_fragment(),
                selectors::AUDIO_TRIGGER,
                self.timeouts.intercept,
            )
            .await
            .and_then(|c| {
                PortalPayload::parse(ResponseRole::AudioCaptcha, &c.body).map(|p| (c.request_id, p))
            }) {
            Ok((request_id, PortalPayload::Audio(bytes))) => (request_id, bytes),
            Ok(_) => return Attempt::Retry("audio capture returned a non-audio payload".to_string()),
            Err(e) => return Attempt::Retry(format!("audio CAPTCHA not captured: {}", e)),
        };
        log_state(gstin, LoginState::CaptchaRequested);

        let code = match self.resolver.resolve(&request_id, &audio).await {
            Ok(code) => code,
            Err(e) => return Attempt::Retry(format!("CAPTCHA transcription failed: {}", e)),
        };

        if let Err(e) = self.submit(page, &code).await {
            log_state(gstin, LoginState::UnknownBlock);
            return Attempt::Done(LoginOutcome::failed(
                LoginState::UnknownBlock,
                FailureReason::log_only(format!(
                    "Something went wrong while submitting the CAPTCHA: {}",
                    e
                )),
                attempt,
            ));
        }
        log_state(gstin, LoginState::CaptchaSubmitted);

        match self.await_landing(page).await {
            Landing::Dashboard => {
                log_state(gstin, LoginState::Landed);
                Attempt::Done(LoginOutcome::landed(attempt))
            }
            Landing::Dialog(state, reason) => {
                log_state(gstin, state);
                Attempt::Done(LoginOutcome::failed(state, reason, attempt))
            }
            Landing::TimedOut => self.diagnose(page, gstin, credentials, attempt).await,
        }
    }

    async fn enter_credentials(
        &self,
        page: &dyn PortalPage,
        credentials: &Credentials,
    ) -> Result<(), PortalError> {
        let t = self.timeouts.element;
        wait_for(page, selectors::USERNAME, t).await?;
        wait_for(page, selectors::PASSWORD, t).await?;
        page.fill(selectors::USERNAME, &credentials.username).await?;
        // The password field only accepts input once the CAPTCHA image has rendered.
        page.wait_visible(selectors::CAPTCHA_IMAGE, t).await?;
        page.fill(selectors::PASSWORD, &credentials.password).await?;
        Ok(())
    }

    async fn submit(&self, page: &dyn PortalPage, code: &str) -> Result<(), PortalError> {
        wait_for(page, selectors::CAPTCHA_INPUT, self.timeouts.element).await?;
        page.fill(selectors::CAPTCHA_INPUT, code).await?;
        page.click(selectors::SUBMIT).await
    }

    /// Races the dashboard marker against a modal dialog.
    async fn await_landing(&self, page: &dyn PortalPage) -> Landing {
        let first = page
            .wait_any(&[selectors::DASHBOARD, selectors::MODAL], self.timeouts.landing)
            .await;
        match first {
            Ok(Some(0)) => Landing::Dashboard,
            Ok(Some(_)) => self.handle_dialog(page).await,
            Ok(None) => Landing::TimedOut,
            Err(e) => {
                warn!("landing detection failed: {}", e);
                Landing::TimedOut
            }
        }
    }

    async fn handle_dialog(&self, page: &dyn PortalPage) -> Landing {
        let probe = self.timeouts.probe;
        let which = page
            .wait_any(&[selectors::REMIND_LATER, selectors::FILE_AMENDMENT], probe)
            .await
            .unwrap_or(None);
        match which {
            Some(0) => {
                debug!("dismissing Aadhaar reminder dialog");
                if let Err(e) = page.click(selectors::REMIND_LATER).await {
                    return Landing::Dialog(
                        LoginState::UnknownBlock,
                        FailureReason::log_only(format!("{}: {}", UNKNOWN_DIALOG, e)),
                    );
                }
                match page.wait_any(&[selectors::DASHBOARD], self.timeouts.landing).await {
                    Ok(Some(_)) => Landing::Dashboard,
                    _ => Landing::TimedOut,
                }
            }
            Some(_) => Landing::Dialog(LoginState::UnknownBlock, FailureReason::notify(BANK_NOT_LINKED)),
            None => Landing::Dialog(
                LoginState::UnknownBlock,
                FailureReason::log_only(UNKNOWN_DIALOG),
            ),
        }
    }

    /// Narrower probes after a landing timeout, in priority order.
    async fn diagnose(
        &self,
        page: &dyn PortalPage,
        gstin: &Gstin,
        credentials: &Credentials,
        attempt: u32,
    ) -> Attempt {
        let probe = self.timeouts.probe;
        let present = |t: Target| async move {
            matches!(page.wait_any(&[t], probe).await, Ok(Some(_)))
        };

        if present(selectors::PASSWORD_CHANGE).await {
            log_state(gstin, LoginState::PasswordExpired);
            return Attempt::Done(LoginOutcome::failed(
                LoginState::PasswordExpired,
                FailureReason::notify(format!(
                    "GST credential needs to be changed for the GST user id {}",
                    credentials.username
                )),
                attempt,
            ));
        }

        if present(selectors::CAPTCHA_ERROR).await {
            return Attempt::Retry("portal rejected the CAPTCHA text".to_string());
        }

        if present(selectors::CREDENTIALS_ERROR).await {
            log_state(gstin, LoginState::CredentialsInvalid);
            return Attempt::Done(LoginOutcome::failed(
                LoginState::CredentialsInvalid,
                FailureReason::notify(
                    "GST username or password is invalid. Please update GST credential and try again.",
                ),
                attempt,
            ));
        }

        log_state(gstin, LoginState::UnknownBlock);
        let timeout = PortalError::ElementTimeout {
            selector: selectors::DASHBOARD.selector.to_string(),
            timeout: self.timeouts.landing,
        };
        Attempt::Done(LoginOutcome::failed(
            LoginState::UnknownBlock,
            FailureReason::log_only(format!(
                "Something went wrong while looking for the dashboard: {}",
                timeout
            )),
            attempt,
        ))
    }

    /// Profile via the dashboard widget, then Services → Returns → Track Return Status.
    pub async fn fetch_detail(&self, page: &dyn PortalPage) -> Result<GstDetail, PortalError> {
        let t = self.timeouts;

        wait_for(page, selectors::PROFILE_LINK, t.element).await?;
        let captured = page
            .intercept(ResponseRole::Profile.url_fragment(), selectors::PROFILE_LINK, t.intercept)
            .await?;
        let profile = match PortalPayload::parse(ResponseRole::Profile, &captured.body)? {
            PortalPayload::Profile(p) => p,
            _ => return Err(unexpected(ResponseRole::Profile)),
        };

        wait_for(page, selectors::SERVICES_MENU, t.element).await?;
        page.click(selectors::SERVICES_MENU).await?;
        wait_for(page, selectors::RETURNS_MENU, t.element).await?;
        page.hover(selectors::RETURNS_MENU).await?;
        wait_for(page, selectors::TRACK_RETURN_STATUS, t.element).await?;

        let captured = page
            .intercept(
                ResponseRole::FilingHistory.url_fragment(),
                selectors::TRACK_RETURN_STATUS,
                t.intercept,
            )
            .await?;
        let filings = match PortalPayload::parse(ResponseRole::FilingHistory, &captured.body)? {
            PortalPayload::FilingHistory(f) => f,
            _ => return Err(unexpected(ResponseRole::FilingHistory)),
        };

        Ok(GstDetail { profile, filings })
    }
}

fn unexpected(role: ResponseRole) -> PortalError {
    PortalError::Payload {
        role: role.as_str(),
        reason: "payload resolved to a different role".to_string(),
    }
}
