//! Trailing-window regression detection over benchmark histories.

pub mod config;
pub mod evaluate;

pub use config::{Polarity, RegressionConfig};
pub use evaluate::{Evaluation, Finding, Findings};

/// Fewer baseline points than this leave a key "not yet evaluable".
pub const MIN_BASELINE_POINTS: usize = 2;
