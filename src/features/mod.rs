pub mod status_sync;
pub mod taxpayer_store;

pub use status_sync::{ReturnStatusSync, SyncReport};
pub use taxpayer_store::{JsonFileStore, Taxpayer, TaxpayerStore};
