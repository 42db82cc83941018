use benchtrail_ingest::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which direction of change counts as an improvement for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// throughput style units, e.g. `ops/s`
    BiggerIsBetter,
    /// latency style units, e.g. `ms/op`
    SmallerIsBetter,
}

impl Polarity {
    /// Guess the polarity from the unit, rates per time are throughput, anything else is a cost.
    pub fn infer(unit: &str) -> Self {
        let unit = unit.trim().to_ascii_lowercase();

        if unit.starts_with("ops/")
            || ["/s", "/sec", "/second"]
                .iter()
                .any(|suffix| unit.ends_with(suffix))
        {
            Polarity::BiggerIsBetter
        } else {
            Polarity::SmallerIsBetter
        }
    }

    /// Degradation ratio of `value` against `baseline`, above 1.0 means worse.
    ///
    /// Returns `None` when the ratio is undefined (zero or negative denominator).
    pub fn ratio(self, baseline: f64, value: f64) -> Option<f64> {
        let (numerator, denominator) = match self {
            Polarity::SmallerIsBetter => (value, baseline),
            Polarity::BiggerIsBetter => (baseline, value),
        };

        if denominator <= 0.0 {
            return None;
        }

        Some(numerator / denominator).filter(|ratio| ratio.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegressionConfig {
    // number of runs preceding the new run that form the baseline
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    // e.g. 1.10 flags anything more than 10% worse than the baseline
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    // global override, takes precedence over `units` and inference
    #[serde(default)]
    pub bigger_is_better: Option<bool>,
    #[serde(default)]
    pub units: BTreeMap<String, Polarity>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            threshold: default_threshold(),
            bigger_is_better: None,
            units: BTreeMap::new(),
        }
    }
}

impl RegressionConfig {
    /// Misconfiguration is reported as an invalid run, it only aborts the evaluation.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.window_size < crate::MIN_BASELINE_POINTS {
            return Err(IngestError::invalid(format!(
                "regression.window_size must be at least {}, got {}",
                crate::MIN_BASELINE_POINTS,
                self.window_size
            )));
        }

        if !self.threshold.is_finite() || self.threshold < 1.0 {
            return Err(IngestError::invalid(format!(
                "regression.threshold must be a finite ratio >= 1.0, got {}",
                self.threshold
            )));
        }

        Ok(())
    }

    pub fn polarity_for(&self, unit: &str) -> Polarity {
        match self.bigger_is_better {
            Some(true) => Polarity::BiggerIsBetter,
            Some(false) => Polarity::SmallerIsBetter,
            None => self
                .units
                .get(unit)
                .copied()
                .unwrap_or_else(|| Polarity::infer(unit)),
        }
    }
}

fn default_window_size() -> usize {
    5
}

fn default_threshold() -> f64 {
    1.10
}
