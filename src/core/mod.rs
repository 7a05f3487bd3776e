pub mod app_state;
pub mod channel;
pub mod config;
pub mod error;
pub mod progress;
pub mod types;

pub use app_state::AppState;
