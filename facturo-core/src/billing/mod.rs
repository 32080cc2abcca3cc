pub mod aggregator;
pub mod calculator;

pub use aggregator::{partition, select_for_invoice, summarize, PeriodSummary};
pub use calculator::{compute, round_currency};
