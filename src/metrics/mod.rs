//! Performance metrics over closed trades.

mod aggregator;

pub use aggregator::{MetricsAggregator, SessionBaseline};
