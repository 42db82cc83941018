pub mod exec;

use crate::config::{AdapterConfig, ConfigErrors};
use benchtrail_ingest::{IngestError, Run, RunReport};
use itertools::Itertools;
use std::{collections::BTreeMap, fs, path::Path, process::ExitStatus};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn adapter")]
    SpawnAdapter(#[source] std::io::Error),
    #[error("Failed to read run file")]
    ReadInput(#[from] std::io::Error),
    #[error("Failed to wait for the adapter process")]
    ChildError(#[source] std::io::Error),
    #[error("Failed to decode normalized run")]
    DecodeJson(#[from] serde_json::Error),
    #[error("Failed to decode normalized run")]
    DecodeYaml(#[from] serde_yaml::Error),
    #[error("Adapter timeout")]
    ChildTimeout,
    #[error("Adapter exited with {status}: {stderr}")]
    ChildFailed { status: ExitStatus, stderr: String },
}

pub type AdapterMap = BTreeMap<String, Adapters>;

#[derive(Clone, Debug)]
pub enum Adapters {
    Exec(exec::ExecAdapter),
    Null,
}

impl Adapters {
    pub fn load(config: &AdapterConfig) -> Self {
        match config {
            AdapterConfig::Null => Self::Null,
            AdapterConfig::Exec {
                exec,
                params,
                timeout,
            } => Self::Exec(exec::ExecAdapter::new(exec.clone(), params.clone(), *timeout)),
        }
    }

    pub fn load_all(configs: &BTreeMap<String, AdapterConfig>) -> AdapterMap {
        configs
            .iter()
            .map(|(name, config)| (name.clone(), Self::load(config)))
            .collect()
    }

    /// Look up a configured adapter, no name selects the null adapter.
    pub fn select(adapters: &AdapterMap, name: Option<&str>) -> Result<Self, ConfigErrors> {
        match name {
            None => Ok(Self::Null),
            Some(name) => adapters
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigErrors::UnknownAdapter(name.to_owned())),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn adapt(&self, path: &Path) -> Result<RunReport, AdapterError> {
        match self {
            Self::Exec(adapter) => adapter.adapt(path),
            Self::Null => {
                let content = fs::read_to_string(path)?;

                let decoded: Result<RunReport, AdapterError> =
                    match path.extension().and_then(|extension| extension.to_str()) {
                        Some("yml" | "yaml") => {
                            serde_yaml::from_str(&content).map_err(AdapterError::from)
                        }
                        _ => serde_json::from_str(&content).map_err(AdapterError::from),
                    };

                decoded.map_err(|error| {
                    error!(error = ?error, "Failed to deserialize run for null adapter");

                    error
                })
            }
        }
    }
}

/// The suite of a run is the class segment every measurement name shares.
pub fn infer_suite(run: &Run) -> Result<String, IngestError> {
    let namespaces = run
        .benches
        .iter()
        .map(|measurement| measurement.key().namespace().map(str::to_owned))
        .unique()
        .collect_vec();

    match namespaces.as_slice() {
        [Some(suite)] => Ok(suite.clone()),
        [] => Err(IngestError::invalid(
            "run has no measurements to infer a suite from",
        )),
        [None] => Err(IngestError::invalid(
            "measurement names carry no class segment, pass the suite explicitly",
        )),
        _ => Err(IngestError::invalid(format!(
            "measurements span several suites ({}), pass the suite explicitly",
            namespaces.iter().flatten().join(", ")
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use benchtrail_ingest::{Commit, Identity, Measurement};

    pub(crate) fn run(commit: &str, date: u64, measurements: &[(&str, f64)]) -> Run {
        let identity = Identity {
            name: "Rob".to_owned(),
            username: Some("rob".to_owned()),
            email: None,
        };

        Run {
            commit: Commit {
                author: identity.clone(),
                committer: identity,
                id: commit.to_owned(),
                message: "bench".to_owned(),
                timestamp: "2025-12-05T11:19:20Z".to_owned(),
                url: format!("https://example.org/commit/{commit}"),
            },
            date,
            tool: "jmh".to_owned(),
            benches: measurements
                .iter()
                .map(|(name, value)| Measurement::new(*name, *value, "ms/op"))
                .collect(),
        }
    }

    #[test]
    fn null_adapter_reads_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let expected = run("abc", 10, &[("pkg.Labels.read", 1.5)]);

        let json = dir.path().join("run.json");
        fs::write(&json, serde_json::to_string(&expected).unwrap()).unwrap();
        let yaml = dir.path().join("run.yaml");
        fs::write(&yaml, serde_yaml::to_string(&expected).unwrap()).unwrap();

        let expected = RunReport::from(expected);
        assert_eq!(Adapters::Null.adapt(&json).unwrap(), expected);
        assert_eq!(Adapters::Null.adapt(&yaml).unwrap(), expected);
    }

    #[test]
    fn null_adapter_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Adapters::Null.adapt(&path),
            Err(AdapterError::DecodeJson(_))
        ));
    }

    #[test]
    fn unknown_adapters_are_config_errors() {
        let adapters = Adapters::load_all(&BTreeMap::from([(
            "normalized".to_owned(),
            AdapterConfig::Null,
        )]));

        assert!(Adapters::select(&adapters, Some("normalized")).is_ok());
        assert!(matches!(
            Adapters::select(&adapters, Some("jmh")),
            Err(ConfigErrors::UnknownAdapter(_))
        ));
    }

    #[test]
    fn suite_is_inferred_from_the_class_segment() {
        let single = run(
            "abc",
            1,
            &[
                ("io.telicent.LabelsBenchmark.read ( {\"n\":\"1\"} )", 1.0),
                ("io.telicent.LabelsBenchmark.write", 2.0),
            ],
        );
        let mixed = run(
            "abc",
            1,
            &[("pkg.Labels.read", 1.0), ("pkg.Parser.parse", 2.0)],
        );
        let bare = run("abc", 1, &[("read", 1.0)]);

        assert_eq!(infer_suite(&single).unwrap(), "LabelsBenchmark");
        assert!(matches!(
            infer_suite(&mixed),
            Err(IngestError::InvalidRun(_))
        ));
        assert!(matches!(infer_suite(&bare), Err(IngestError::InvalidRun(_))));
    }
}
