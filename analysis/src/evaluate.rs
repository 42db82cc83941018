use crate::{config::RegressionConfig, MIN_BASELINE_POINTS};
use benchtrail_ingest::{BenchmarkKey, History, IngestError, Merged, Run, Suite};
use itertools::Itertools;
use serde::Serialize;
use tracing::trace;

/// A benchmark key of a new run judged worse than its baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub benchmark_key: BenchmarkKey,
    pub suite_name: String,
    pub baseline_value: f64,
    pub new_value: f64,
    pub ratio: f64,
    pub commit_id: String,
    #[serde(skip)]
    pub unit: String,
}

/// Regression evaluation of exactly one run against the runs preceding it.
///
/// Findings are computed lazily; iterating the evaluation again starts over.
#[derive(Debug, Clone)]
pub struct Evaluation<'a> {
    config: &'a RegressionConfig,
    suite: &'a Suite,
    index: usize,
    keys: Vec<BenchmarkKey>,
}

impl<'a> Evaluation<'a> {
    /// Evaluate the run at `index` of `suite`.
    pub fn new(
        config: &'a RegressionConfig,
        history: &'a History,
        suite: &str,
        index: usize,
    ) -> Result<Self, IngestError> {
        config.validate()?;

        let suite = history
            .suite(suite)
            .ok_or_else(|| IngestError::invalid(format!("suite {suite} does not exist")))?;
        let run = suite.runs().get(index).ok_or_else(|| {
            IngestError::invalid(format!(
                "suite {} has no run at position {index}",
                suite.name()
            ))
        })?;

        Ok(Self {
            config,
            suite,
            index,
            keys: run.keys(),
        })
    }

    /// Evaluate the run a merge just placed into its suite.
    pub fn of_merge(config: &'a RegressionConfig, merged: &'a Merged) -> Result<Self, IngestError> {
        Self::new(config, &merged.history, &merged.suite, merged.index)
    }

    /// Evaluate the most recent run of `suite`.
    pub fn latest(
        config: &'a RegressionConfig,
        history: &'a History,
        suite: &str,
    ) -> Result<Self, IngestError> {
        let index = history
            .suite(suite)
            .and_then(|suite| suite.len().checked_sub(1))
            .ok_or_else(|| IngestError::invalid(format!("suite {suite} has no runs")))?;

        Self::new(config, history, suite, index)
    }

    pub fn suite(&self) -> &'a Suite {
        self.suite
    }

    pub fn run(&self) -> &'a Run {
        &self.suite.runs()[self.index]
    }

    /// runs forming the baseline window, oldest first
    pub fn baseline(&self) -> &'a [Run] {
        let start = self.index.saturating_sub(self.config.window_size);

        &self.suite.runs()[start..self.index]
    }

    /// distinct keys of the evaluated run, in reporting order
    pub fn keys(&self) -> &[BenchmarkKey] {
        &self.keys
    }

    pub fn findings(&self) -> Findings<'_, 'a> {
        Findings {
            evaluation: self,
            position: 0,
        }
    }

    fn assess(&self, key: &BenchmarkKey) -> Option<Finding> {
        let run = self.run();
        let new_value = run.mean_value(key)?;
        let unit = run.unit_of(key)?;

        let points = self
            .baseline()
            .iter()
            .filter_map(|previous| previous.mean_value(key))
            .collect_vec();

        if points.len() < MIN_BASELINE_POINTS {
            trace!(key = %key, points = points.len(), "Not enough history to evaluate");

            return None;
        }

        let baseline_value = points.iter().sum::<f64>() / points.len() as f64;
        let ratio = self
            .config
            .polarity_for(unit)
            .ratio(baseline_value, new_value)?;

        trace!(key = %key, baseline_value, new_value, ratio, "Evaluated benchmark");

        (ratio > self.config.threshold).then(|| Finding {
            benchmark_key: key.clone(),
            suite_name: self.suite.name().to_owned(),
            baseline_value,
            new_value,
            ratio,
            commit_id: run.commit.id.clone(),
            unit: unit.to_owned(),
        })
    }
}

impl<'e, 'a> IntoIterator for &'e Evaluation<'a> {
    type Item = Finding;
    type IntoIter = Findings<'e, 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.findings()
    }
}

/// Iterator over the findings of one evaluation, bounded by the keys of the run.
#[derive(Debug, Clone)]
pub struct Findings<'e, 'a> {
    evaluation: &'e Evaluation<'a>,
    position: usize,
}

impl Iterator for Findings<'_, '_> {
    type Item = Finding;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(key) = self.evaluation.keys.get(self.position) {
            self.position += 1;

            if let Some(finding) = self.evaluation.assess(key) {
                return Some(finding);
            }
        }

        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.evaluation.keys.len() - self.position))
    }
}
