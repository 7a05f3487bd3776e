pub mod calculator;
pub mod period;

pub use calculator::{DuePolicy, EntryKind, StatusCalculator};
pub use period::TaxPeriod;
