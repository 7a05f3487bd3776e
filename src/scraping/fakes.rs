//! Scripted portal, launcher and transcriber for driver/orchestrator tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::browser_manager::{BrowserLauncher, PortalBrowser};
use super::captcha::{AudioClip, Transcriber};
use super::driver::selectors;
use super::interception::{CapturedResponse, ResponseRole};
use super::page::{PortalPage, Target};
use crate::core::error::{PortalError, TranscriptionError};
use crate::core::types::Gstin;

/// What the portal shows after the CAPTCHA form is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Landed,
    LandedAfterReminder,
    MisreadCaptcha,
    BadCredentials,
    PasswordExpired,
    BankNotLinked,
    UnknownDialog,
    Silent,
}

#[derive(Debug, Clone)]
pub struct PortalScript {
    pub outcomes: VecDeque<SubmitOutcome>,
    pub captcha_image_renders: bool,
    pub audio_failures: usize,
    pub profile_body: Vec<u8>,
    pub history_body: Vec<u8>,
    pub panic_on_goto: bool,
    pub panic_on_open: bool,
    pub panic_on_close: bool,
}

impl PortalScript {
    pub fn landing(gstin: &str) -> Self {
        Self::with_outcomes(gstin, [SubmitOutcome::Landed])
    }

    pub fn with_outcomes(gstin: &str, outcomes: impl IntoIterator<Item = SubmitOutcome>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
            captcha_image_renders: true,
            audio_failures: 0,
            profile_body: format!(
                r#"{{"data":{{"gstin":"{}","lgnm":"ACME TRADERS","tradeNam":"ACME","sts":"Active"}}}}"#,
                gstin
            )
            .into_bytes(),
            history_body: br#"[
                {"rtntype":"GSTR1","dof":"11-04-2024","ret_prd":"032024","arn":"AA1","mof":"ONLINE","status":"Filed"},
                {"rtntype":"GSTR3B","dof":"20-04-2024","ret_prd":"032024","arn":"AB1","mof":"ONLINE","status":"Filed"}
            ]"#
            .to_vec(),
            panic_on_goto: false,
            panic_on_open: false,
            panic_on_close: false,
        }
    }
}

/// Everything a page was asked to do, for assertions.
#[derive(Debug, Default, Clone)]
pub struct PageLog {
    pub submits: usize,
    pub captcha_codes: Vec<String>,
    pub intercepts: Vec<String>,
    pub closed: bool,
}

#[derive(Debug)]
struct PageState {
    script: PortalScript,
    dom: HashMap<&'static str, Vec<String>>,
    audio_seq: usize,
}

pub struct FakePage {
    state: Mutex<PageState>,
    log: Arc<Mutex<PageLog>>,
}

impl FakePage {
    pub fn new(script: PortalScript) -> (Self, Arc<Mutex<PageLog>>) {
        let log = Arc::new(Mutex::new(PageLog::default()));
        (
            Self {
                state: Mutex::new(PageState {
                    script,
                    dom: HashMap::new(),
                    audio_seq: 0,
                }),
                log: log.clone(),
            },
            log,
        )
    }

    fn present(dom: &HashMap<&'static str, Vec<String>>, target: &Target) -> bool {
        match dom.get(target.selector) {
            None => false,
            Some(texts) => match target.text {
                None => true,
                Some(_) => texts
                    .iter()
                    .any(|t| target.matches_text(t).unwrap_or(false)),
            },
        }
    }

    fn show_dashboard(dom: &mut HashMap<&'static str, Vec<String>>) {
        dom.remove(selectors::MODAL.selector);
        dom.insert(selectors::DASHBOARD.selector, vec![String::new()]);
        dom.insert(selectors::PROFILE_LINK.selector, vec!["View Profile".into()]);
        dom.insert(selectors::SERVICES_MENU.selector, vec!["Services".into()]);
        dom.insert(selectors::RETURNS_MENU.selector, vec!["Returns".into()]);
        dom.insert(
            selectors::TRACK_RETURN_STATUS.selector,
            vec!["Track Return Status".into()],
        );
    }

    fn submit(state: &mut PageState) {
        for transient in [
            selectors::CAPTCHA_ERROR.selector,
            selectors::CREDENTIALS_ERROR.selector,
            selectors::PASSWORD_CHANGE.selector,
            selectors::MODAL.selector,
        ] {
            state.dom.remove(transient);
        }
        let outcome = state
            .script
            .outcomes
            .pop_front()
            .unwrap_or(SubmitOutcome::Silent);
        let dom = &mut state.dom;
        match outcome {
            SubmitOutcome::Landed => Self::show_dashboard(dom),
            SubmitOutcome::LandedAfterReminder => {
                dom.insert(selectors::MODAL.selector, vec![String::new()]);
                dom.insert(
                    selectors::REMIND_LATER.selector,
                    vec!["Remind me later".into()],
                );
            }
            SubmitOutcome::MisreadCaptcha => {
                dom.insert(
                    selectors::CAPTCHA_ERROR.selector,
                    vec!["Enter valid Letters shown in the image".into()],
                );
            }
            SubmitOutcome::BadCredentials => {
                dom.insert(
                    selectors::CREDENTIALS_ERROR.selector,
                    vec!["Invalid Username or Password. Please try again.".into()],
                );
            }
            SubmitOutcome::PasswordExpired => {
                dom.insert(selectors::PASSWORD_CHANGE.selector, vec![String::new()]);
            }
            SubmitOutcome::BankNotLinked => {
                dom.insert(selectors::MODAL.selector, vec![String::new()]);
                dom.insert(
                    selectors::FILE_AMENDMENT.selector,
                    vec!["FILE AMENDMENT".into()],
                );
            }
            SubmitOutcome::UnknownDialog => {
                dom.insert(selectors::MODAL.selector, vec![String::new()]);
            }
            SubmitOutcome::Silent => {}
        }
    }
}

#[async_trait]
impl PortalPage for FakePage {
    async fn goto(&self, _url: &str) -> Result<(), PortalError> {
        let mut st = self.state.lock().unwrap();
        if st.script.panic_on_goto {
            panic!("scripted portal crash");
        }
        for sel in [
            selectors::USERNAME.selector,
            selectors::PASSWORD.selector,
            selectors::AUDIO_TRIGGER.selector,
            selectors::CAPTCHA_INPUT.selector,
            selectors::SUBMIT.selector,
        ] {
            st.dom.insert(sel, vec![String::new()]);
        }
        if st.script.captcha_image_renders {
            st.dom
                .insert(selectors::CAPTCHA_IMAGE.selector, vec![String::new()]);
        }
        Ok(())
    }

    async fn wait_any(
        &self,
        targets: &[Target],
        _timeout: Duration,
    ) -> Result<Option<usize>, PortalError> {
        let st = self.state.lock().unwrap();
        Ok(targets.iter().position(|t| Self::present(&st.dom, t)))
    }

    async fn wait_visible(&self, target: Target, timeout: Duration) -> Result<(), PortalError> {
        let st = self.state.lock().unwrap();
        if Self::present(&st.dom, &target) {
            Ok(())
        } else {
            Err(PortalError::ElementTimeout {
                selector: target.selector.to_string(),
                timeout,
            })
        }
    }

    async fn fill(&self, target: Target, text: &str) -> Result<(), PortalError> {
        let st = self.state.lock().unwrap();
        if !Self::present(&st.dom, &target) {
            return Err(target_missing(target));
        }
        if target == selectors::CAPTCHA_INPUT {
            self.log.lock().unwrap().captcha_codes.push(text.to_string());
        }
        Ok(())
    }

    async fn click(&self, target: Target) -> Result<(), PortalError> {
        let mut st = self.state.lock().unwrap();
        if !Self::present(&st.dom, &target) {
            return Err(target_missing(target));
        }
        if target == selectors::SUBMIT {
            self.log.lock().unwrap().submits += 1;
            Self::submit(&mut st);
        } else if target == selectors::REMIND_LATER {
            st.dom.remove(selectors::REMIND_LATER.selector);
            Self::show_dashboard(&mut st.dom);
        }
        Ok(())
    }

    async fn hover(&self, target: Target) -> Result<(), PortalError> {
        let st = self.state.lock().unwrap();
        if Self::present(&st.dom, &target) {
            Ok(())
        } else {
            Err(target_missing(target))
        }
    }

    async fn intercept(
        &self,
        url_fragment: &str,
        trigger: Target,
        timeout: Duration,
    ) -> Result<CapturedResponse, PortalError> {
        let mut st = self.state.lock().unwrap();
        if !Self::present(&st.dom, &trigger) {
            return Err(target_missing(trigger));
        }
        self.log
            .lock()
            .unwrap()
            .intercepts
            .push(url_fragment.to_string());

        if url_fragment == ResponseRole::AudioCaptcha.url_fragment() {
            st.audio_seq += 1;
            if st.script.audio_failures > 0 {
                st.script.audio_failures -= 1;
                return Err(PortalError::InterceptTimeout {
                    url_fragment: url_fragment.to_string(),
                    timeout,
                });
            }
            return Ok(CapturedResponse {
                request_id: format!("1000.{}", st.audio_seq),
                body: b"ID3-fake-audio".to_vec(),
            });
        }
        let body = if url_fragment == ResponseRole::Profile.url_fragment() {
            st.script.profile_body.clone()
        } else if url_fragment == ResponseRole::FilingHistory.url_fragment() {
            st.script.history_body.clone()
        } else {
            return Err(PortalError::InterceptTimeout {
                url_fragment: url_fragment.to_string(),
                timeout,
            });
        };
        Ok(CapturedResponse {
            request_id: "2000.1".to_string(),
            body,
        })
    }

    async fn close(self: Box<Self>) {
        self.log.lock().unwrap().closed = true;
        let crash = self
            .state
            .lock()
            .map(|st| st.script.panic_on_close)
            .unwrap_or(false);
        if crash {
            panic!("scripted crash while closing the tab");
        }
    }
}

fn target_missing(target: Target) -> PortalError {
    PortalError::ElementNotFound {
        selector: target.selector.to_string(),
        pattern: target.text.unwrap_or(".*").to_string(),
    }
}

// ── Transcriber ──────────────────────────────────────────────────────────────

/// Replies in order, then repeats `fallback`.
pub struct ScriptedTranscriber {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: String,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn always(text: &str) -> Arc<Self> {
        Self::sequence(Vec::new(), text)
    }

    pub fn sequence(replies: Vec<Result<String, String>>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
        assert!(clip.path.exists(), "audio artifact must exist while transcribing");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(t)) => Ok(t),
            Some(Err(e)) => Err(TranscriptionError::Provider(e)),
            None => Ok(self.fallback.clone()),
        }
    }
}

// ── Launcher ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LaunchLedger {
    pub launches: AtomicUsize,
    pub browsers_closed: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub sessions: Mutex<Vec<(Gstin, Arc<Mutex<PageLog>>)>>,
}

impl LaunchLedger {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn browsers_closed(&self) -> usize {
        self.browsers_closed.load(Ordering::SeqCst)
    }

    pub fn sessions_for(&self, gstin: &Gstin) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| g == gstin)
            .count()
    }

    /// Sessions opened but never closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, log)| !log.lock().unwrap().closed)
            .count()
    }
}

/// Hands out one scripted page per taxpayer; unscripted taxpayers land normally.
pub struct RecordingLauncher {
    scripts: HashMap<Gstin, PortalScript>,
    fail_launch: bool,
    pub ledger: Arc<LaunchLedger>,
}

impl RecordingLauncher {
    pub fn new(scripts: impl IntoIterator<Item = (Gstin, PortalScript)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.into_iter().collect(),
            fail_launch: false,
            ledger: Arc::new(LaunchLedger::default()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            scripts: HashMap::new(),
            fail_launch: true,
            ledger: Arc::new(LaunchLedger::default()),
        })
    }
}

#[async_trait]
impl BrowserLauncher for RecordingLauncher {
    async fn launch(&self) -> Result<Box<dyn PortalBrowser>, PortalError> {
        if self.fail_launch {
            return Err(PortalError::Launch("scripted launch failure".to_string()));
        }
        self.ledger.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingBrowser {
            scripts: self.scripts.clone(),
            ledger: self.ledger.clone(),
        }))
    }
}

struct RecordingBrowser {
    scripts: HashMap<Gstin, PortalScript>,
    ledger: Arc<LaunchLedger>,
}

#[async_trait]
impl PortalBrowser for RecordingBrowser {
    async fn open_session(&self, gstin: &Gstin) -> Result<Box<dyn PortalPage>, PortalError> {
        self.ledger.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(gstin)
            .cloned()
            .unwrap_or_else(|| PortalScript::landing(gstin.as_str()));
        if script.panic_on_open {
            panic!("scripted crash while opening a context");
        }
        let (page, log) = FakePage::new(script);
        self.ledger
            .sessions
            .lock()
            .unwrap()
            .push((gstin.clone(), log));
        Ok(Box::new(page))
    }

    async fn close(self: Box<Self>) {
        self.ledger.browsers_closed.fetch_add(1, Ordering::SeqCst);
    }
}
