pub mod browser_manager;
pub mod captcha;
pub mod driver;
pub mod interception;
pub mod orchestrator;
pub mod page;

#[cfg(test)]
pub mod fakes;

pub use browser_manager::{BrowserLauncher, ChromiumLauncher, PortalBrowser};
pub use captcha::{AssemblyAiTranscriber, CaptchaResolver, Transcriber};
pub use driver::{LoginOutcome, LoginState, PortalDriver};
pub use orchestrator::{GstScraper, ScrapeBatch};
