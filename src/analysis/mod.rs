//! Statistics derived from execution records.

pub mod aggregator;

pub use self::aggregator::ResultAggregator;
