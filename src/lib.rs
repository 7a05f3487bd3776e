pub mod core;
pub mod features;
pub mod returns;
pub mod scraping;

pub use core::types;
pub use core::types::*;
pub use core::AppState;
pub use features::{status_sync, taxpayer_store};
