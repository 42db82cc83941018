use crate::{error::IngestError, integrity, key::BenchmarkKey};
use itertools::Itertools;
use serde::{
    de::{MapAccess, Visitor},
    ser::{SerializeMap, SerializeStruct},
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    fmt,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Provenance of a run, as reported by the source forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub author: Identity,
    pub committer: Identity,
    pub id: String,
    pub message: String,
    pub timestamp: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    // error range some tools report next to the score, e.g. "± 1.2"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Measurement {
    pub fn new<N: Into<String>, U: Into<String>>(name: N, value: f64, unit: U) -> Self {
        Self {
            name: name.into(),
            value,
            range: None,
            unit: unit.into(),
            extra: None,
        }
    }

    pub fn key(&self) -> BenchmarkKey {
        BenchmarkKey::parse(&self.name)
    }
}

/// One execution of a benchmark tool against a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub commit: Commit,
    /// ingestion time in epoch millis
    pub date: u64,
    pub tool: String,
    pub benches: Vec<Measurement>,
}

/// A run as an adapter reports it, the date is left to the ingester when missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub commit: Commit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<u64>,
    pub tool: String,
    pub benches: Vec<Measurement>,
}

impl RunReport {
    /// Complete the report, `fallback` is only consulted for undated reports.
    pub fn dated<F: FnOnce() -> u64>(self, fallback: F) -> Run {
        Run {
            commit: self.commit,
            date: self.date.unwrap_or_else(fallback),
            tool: self.tool,
            benches: self.benches,
        }
    }
}

impl From<Run> for RunReport {
    fn from(run: Run) -> Self {
        Self {
            commit: run.commit,
            date: Some(run.date),
            tool: run.tool,
            benches: run.benches,
        }
    }
}

impl Run {
    /// A run published twice, e.g. by a retried CI step.
    pub fn is_republish_of(&self, other: &Run) -> bool {
        self.commit.id == other.commit.id && self.date == other.date
    }

    /// distinct benchmark keys in order of first appearance
    pub fn keys(&self) -> Vec<BenchmarkKey> {
        self.benches.iter().map(Measurement::key).unique().collect_vec()
    }

    /// Mean over every measurement of `key`, tools may report one key once per fork.
    pub fn mean_value(&self, key: &BenchmarkKey) -> Option<f64> {
        let (sum, count) = self
            .benches
            .iter()
            .filter(|measurement| &measurement.key() == key)
            .fold((0.0, 0usize), |(sum, count), measurement| {
                (sum + measurement.value, count + 1)
            });

        (count > 0).then(|| sum / count as f64)
    }

    pub fn unit_of(&self, key: &BenchmarkKey) -> Option<&str> {
        self.benches
            .iter()
            .find(|measurement| &measurement.key() == key)
            .map(|measurement| measurement.unit.as_str())
    }
}

/// Ordered series of runs for one group of related benchmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct Suite {
    name: String,
    runs: Vec<Run>,
}

impl Suite {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self::from_runs(name, Vec::new())
    }

    /// Build a suite from persisted runs, the invariants are checked by `History::from_suites`.
    pub fn from_runs<T: Into<String>>(name: T, runs: Vec<Run>) -> Self {
        Self {
            name: name.into(),
            runs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn latest(&self) -> Option<&Run> {
        self.runs.last()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Unit established for every benchmark key of the series.
    pub fn units(&self) -> HashMap<BenchmarkKey, &str> {
        let mut units = HashMap::new();

        for measurement in self.runs.iter().flat_map(|run| run.benches.iter()) {
            if let Entry::Vacant(entry) = units.entry(measurement.key()) {
                entry.insert(measurement.unit.as_str());
            }
        }

        units
    }

    /// position a run with `date` takes, after every run of the same date
    fn insertion_point(&self, date: u64) -> usize {
        self.runs.partition_point(|run| run.date <= date)
    }

    fn insert(&mut self, run: Run) -> usize {
        let index = self.insertion_point(run.date);

        if index < self.runs.len() {
            debug!(
                suite = %self.name,
                date = run.date,
                index,
                "Run is older than the latest run, inserting in date order"
            );
        }

        self.runs.insert(index, run);

        index
    }

    /// Index of the stored run `run` republishes, searched among the runs of its date.
    pub(crate) fn republished(&self, run: &Run) -> Option<usize> {
        let start = self.runs.partition_point(|stored| stored.date < run.date);
        let end = self.insertion_point(run.date);

        (start..end)
            .rev()
            .find(|index| self.runs[*index].is_republish_of(run))
    }

    fn replace(&mut self, index: usize, run: Run) -> usize {
        self.runs[index] = run;

        index
    }
}

/// Every suite of one repository. `lastUpdate` is always derived from the runs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct History {
    repo_url: String,
    suites: Vec<Suite>,
}

impl History {
    pub fn new<T: Into<String>>(repo_url: T) -> Self {
        Self {
            repo_url: repo_url.into(),
            suites: Vec::new(),
        }
    }

    /// Assemble a history from stored suites, failing with `CorruptStore` on any
    /// invariant violation.
    pub fn from_suites<T: Into<String>>(repo_url: T, suites: Vec<Suite>) -> Result<Self, IngestError> {
        integrity::check_suites(&suites).map_err(IngestError::CorruptStore)?;

        Ok(Self {
            repo_url: repo_url.into(),
            suites,
        })
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn set_repo_url<T: Into<String>>(&mut self, repo_url: T) {
        self.repo_url = repo_url.into();
    }

    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    pub fn suite(&self, name: &str) -> Option<&Suite> {
        self.suites.iter().find(|suite| suite.name == name)
    }

    pub fn run_count(&self) -> usize {
        self.suites.iter().map(Suite::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.iter().all(Suite::is_empty)
    }

    /// Latest run date across all suites, 0 for an empty history.
    pub fn last_update(&self) -> u64 {
        self.suites
            .iter()
            .filter_map(Suite::latest)
            .map(|run| run.date)
            .max()
            .unwrap_or(0)
    }

    /// Returns a new history with `run` placed into `suite`, creating the suite if needed.
    pub fn append_run(&self, suite: &str, run: Run) -> History {
        let mut next = self.clone();
        next.insert_run(suite, run);

        next
    }

    pub(crate) fn insert_run(&mut self, suite: &str, run: Run) -> usize {
        self.suite_mut(suite).insert(run)
    }

    pub(crate) fn replace_run(&mut self, suite: &str, index: usize, run: Run) -> usize {
        self.suite_mut(suite).replace(index, run)
    }

    fn suite_mut(&mut self, name: &str) -> &mut Suite {
        let position = match self.suites.iter().position(|suite| suite.name == name) {
            Some(position) => position,
            None => {
                debug!(suite = name, "Creating suite");
                self.suites.push(Suite::new(name));

                self.suites.len() - 1
            }
        };

        &mut self.suites[position]
    }
}

impl Serialize for History {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("History", 3)?;
        state.serialize_field("lastUpdate", &self.last_update())?;
        state.serialize_field("repoUrl", &self.repo_url)?;
        state.serialize_field("entries", &EntriesRef(&self.suites))?;

        state.end()
    }
}

struct EntriesRef<'a>(&'a [Suite]);

impl Serialize for EntriesRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;

        for suite in self.0 {
            map.serialize_entry(&suite.name, &suite.runs)?;
        }

        map.end()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHistory {
    #[serde(default)]
    last_update: Option<u64>,
    #[serde(default)]
    repo_url: String,
    #[serde(default)]
    entries: Entries,
}

/// suites in document order
#[derive(Default)]
struct Entries(Vec<Suite>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of suite names to runs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Entries, A::Error> {
                let mut seen = HashSet::new();
                let mut suites = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some((name, runs)) = access.next_entry::<String, Vec<Run>>()? {
                    if !seen.insert(name.clone()) {
                        return Err(serde::de::Error::custom(format!(
                            "suite {name} appears twice"
                        )));
                    }

                    suites.push(Suite::from_runs(name, runs));
                }

                Ok(Entries(suites))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

impl<'de> Deserialize<'de> for History {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawHistory::deserialize(deserializer)?;

        integrity::check_suites(&raw.entries.0).map_err(serde::de::Error::custom)?;

        let history = History {
            repo_url: raw.repo_url,
            suites: raw.entries.0,
        };

        if let Some(stored) = raw.last_update.filter(|stored| *stored != history.last_update()) {
            debug!(
                stored,
                derived = history.last_update(),
                "Stored lastUpdate differs from the latest run, it will be rewritten on commit"
            );
        }

        Ok(history)
    }
}
