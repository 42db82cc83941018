use crate::{
    collector::Collector,
    config::{ConfigErrors, RunnerConfig},
    ingest::{infer_suite, AdapterError, Adapters},
    sink::AlertSink,
    store::StorageAdapters,
};
use benchtrail_analysis::{Evaluation, Finding};
use benchtrail_ingest::{merge, IngestError, MergeOutcome, Run};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("Failed to start the ingestion thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to open alert output")]
    AlertOutput(#[source] std::io::Error),
    #[error("{0} run files could not be ingested")]
    Incomplete(usize),
}

/// Per-invocation overrides of `ingest`.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub suite: Option<String>,
    /// used for runs without a date, defaults to the current time
    pub date: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub suite: String,
    pub commit: String,
    pub outcome: MergeOutcome,
    pub attempts: u32,
    pub findings: Vec<Finding>,
}

/// Drives load -> merge -> evaluate -> commit against one store.
#[derive(Debug)]
pub struct Pipeline<'a> {
    config: &'a RunnerConfig,
    store: &'a StorageAdapters,
    sink: &'a AlertSink,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a RunnerConfig, store: &'a StorageAdapters, sink: &'a AlertSink) -> Self {
        Self {
            config,
            store,
            sink,
        }
    }

    /// Merge `run` into `suite`, reloading and merging again whenever another writer won.
    #[instrument(skip(self, run), fields(commit = %run.commit.id), level = "info")]
    pub fn ingest(&self, suite: &str, run: Run) -> Result<Ingested, IngestError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.attempt(suite, &run) {
                Ok((outcome, findings)) => {
                    info!(outcome = ?outcome, attempts, findings = findings.len(), "Ingested run");
                    self.sink.emit(&findings);

                    return Ok(Ingested {
                        suite: suite.to_owned(),
                        commit: run.commit.id,
                        outcome,
                        attempts,
                        findings,
                    });
                }
                Err(error) if error.is_retryable() && attempts < self.config.retry.attempts => {
                    let backoff = self.config.retry.backoff(attempts);
                    debug!(attempts, backoff = ?backoff, "Lost a concurrent write, retrying");

                    thread::sleep(backoff);
                }
                Err(error) if error.is_retryable() => {
                    error!(attempts, "History kept changing, giving up");

                    return Err(IngestError::persist(format!(
                        "suite {suite} was modified concurrently on each of {attempts} attempts"
                    )));
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn attempt(&self, suite: &str, run: &Run) -> Result<(MergeOutcome, Vec<Finding>), IngestError> {
        let snapshot = self.store.load()?;
        let mut merged = merge(&snapshot.history, suite, run.clone())?;

        let findings = match Evaluation::of_merge(&self.config.regression, &merged) {
            Ok(evaluation) => evaluation.findings().collect(),
            Err(error) => {
                error!("Skipping regression evaluation: {error}");

                Vec::new()
            }
        };

        let configured = self.config.repo_url.as_str();
        if !configured.is_empty() && merged.history.repo_url() != configured {
            if merged.history.repo_url().is_empty() {
                merged.history.set_repo_url(configured);
            } else {
                warn!(
                    stored = merged.history.repo_url(),
                    configured, "Store belongs to a different repository, keeping the stored url"
                );
            }
        }

        self.store.commit(&snapshot, &merged.history)?;

        Ok((merged.outcome, findings))
    }

    /// Adapt, date and route a single run file.
    #[instrument(skip(self, adapter, options), level = "debug")]
    pub fn ingest_file(
        &self,
        path: &Path,
        adapter: &Adapters,
        options: &IngestOptions,
    ) -> Result<Ingested, RunnerError> {
        let run = adapter.adapt(path)?.dated(|| {
            let date = options.date.unwrap_or_else(now_millis);
            debug!(date, "Run carried no date");

            date
        });

        let suite = match &options.suite {
            Some(suite) => suite.clone(),
            None => infer_suite(&run)?,
        };

        match self.ingest(&suite, run.clone()) {
            Err(IngestError::PersistFailed(reason)) => {
                self.preserve(&suite, &run);

                Err(IngestError::PersistFailed(reason).into())
            }
            result => Ok(result?),
        }
    }

    /// Ingest every collected file on the configured thread pool.
    pub fn ingest_all(
        &self,
        collector: Collector,
        adapter: &Adapters,
        options: &IngestOptions,
    ) -> Result<Vec<(PathBuf, Result<Ingested, RunnerError>)>, RunnerError> {
        let paths: Vec<PathBuf> = collector.collect();
        let total = paths.len();
        let processed = AtomicUsize::new(0);

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.threads.unwrap_or(0))
            .build()?;

        debug!("Ingesting {total} files with {} threads", pool.current_num_threads());

        Ok(pool.install(|| {
            paths
                .into_par_iter()
                .map(|path| {
                    let result = self.ingest_file(&path, adapter, options);

                    match &result {
                        Ok(ingested) => debug!(
                            path = ?path,
                            suite = %ingested.suite,
                            commit = %ingested.commit,
                            attempts = ingested.attempts,
                            "Ingested file"
                        ),
                        Err(error) => error!(path = ?path, "Failed to ingest: {error}"),
                    }
                    info!(
                        "Done with {}/{total}",
                        processed.fetch_add(1, Ordering::SeqCst) + 1
                    );

                    (path, result)
                })
                .collect()
        }))
    }

    /// Keep a run that could not be persisted so it can be ingested again later.
    fn preserve(&self, suite: &str, run: &Run) {
        let Some(dir) = &self.config.replay_dir else {
            return;
        };

        let path = dir.join(format!("{suite}-{}-{}.json", run.commit.id, run.date));

        let written = fs::create_dir_all(dir).and_then(|_| {
            let content = serde_json::to_vec_pretty(run)?;
            fs::write(&path, content)
        });

        match written {
            Ok(()) => warn!(path = ?path, "Stored run for replay"),
            Err(error) => error!(error = ?error, "Failed to store run for replay"),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AlertConfig, StoreConfig},
        ingest::tests::run,
        store::{file::FileStore, memory::MemoryStore},
    };
    use std::time::Duration;

    const READ: &str = "io.telicent.LabelsBenchmark.read";

    fn config() -> RunnerConfig {
        let mut config = RunnerConfig::from_store(StoreConfig::Memory);
        config.repo_url = "https://github.com/example/bench".to_owned();
        config.retry.backoff_ms = 1;
        config
    }

    fn memory() -> StorageAdapters {
        StorageAdapters::Memory(MemoryStore::new(Duration::from_secs(1)))
    }

    #[test]
    fn ingest_merges_evaluates_and_commits() {
        let config = config();
        let store = memory();
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        for (position, value) in [100.0, 102.0, 98.0, 101.0, 100.0].into_iter().enumerate() {
            let candidate = run(&format!("c{position}"), position as u64 + 1, &[(READ, value)]);
            let ingested = pipeline.ingest("LabelsBenchmark", candidate).unwrap();
            assert!(ingested.findings.is_empty());
        }

        let ingested = pipeline
            .ingest("LabelsBenchmark", run("slow", 10, &[(READ, 115.0)]))
            .unwrap();

        assert_eq!(ingested.outcome, MergeOutcome::Appended);
        assert_eq!(ingested.findings.len(), 1);

        let history = store.load().unwrap().history;
        assert_eq!(history.run_count(), 6);
        assert_eq!(history.last_update(), 10);
        assert_eq!(history.repo_url(), "https://github.com/example/bench");
    }

    #[test]
    fn reingesting_a_run_is_idempotent() {
        let config = config();
        let store = memory();
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        pipeline.ingest("LabelsBenchmark", run("a", 5, &[(READ, 1.0)])).unwrap();
        let once = store.load().unwrap().history;

        let again = pipeline.ingest("LabelsBenchmark", run("a", 5, &[(READ, 1.0)])).unwrap();

        assert_eq!(again.outcome, MergeOutcome::Replaced);
        assert_eq!(store.load().unwrap().history, once);
    }

    #[test]
    fn invalid_runs_leave_the_store_untouched() {
        let config = config();
        let store = memory();
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        pipeline.ingest("LabelsBenchmark", run("a", 5, &[(READ, 1.0)])).unwrap();

        let mut conflicting = run("b", 6, &[(READ, 1.0)]);
        conflicting.benches[0].unit = "ops/s".to_owned();

        assert!(matches!(
            pipeline.ingest("LabelsBenchmark", conflicting),
            Err(IngestError::InvalidRun(_))
        ));
        assert_eq!(store.load().unwrap().history.run_count(), 1);
    }

    #[test]
    fn misconfigured_evaluation_still_commits() {
        let mut config = config();
        config.regression.window_size = 1;
        let store = memory();
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        let ingested = pipeline.ingest("LabelsBenchmark", run("a", 5, &[(READ, 1.0)])).unwrap();

        assert!(ingested.findings.is_empty());
        assert_eq!(store.load().unwrap().history.run_count(), 1);
    }

    #[test]
    fn parallel_ingestion_keeps_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.threads = Some(4);
        let store = StorageAdapters::File(FileStore::open(
            dir.path().join("data.json"),
            Duration::from_secs(5),
        ));
        config.retry.attempts = 50;
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        let inputs = dir.path().join("runs");
        fs::create_dir(&inputs).unwrap();
        for index in 0..8u64 {
            let run = run(&format!("c{index}"), 100 + index, &[(READ, 1.0)]);
            fs::write(
                inputs.join(format!("run-{index}.json")),
                serde_json::to_string(&run).unwrap(),
            )
            .unwrap();
        }

        let collector = Collector::load(&[inputs], "*.json").unwrap();
        let results = pipeline
            .ingest_all(collector, &Adapters::Null, &IngestOptions::default())
            .unwrap();

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|(_, result)| result.is_ok()));

        let history = store.load().unwrap().history;
        let dates = history
            .suite("LabelsBenchmark")
            .unwrap()
            .runs()
            .iter()
            .map(|run| run.date)
            .collect::<Vec<_>>();
        assert_eq!(dates, (100..108).collect::<Vec<_>>());
    }

    #[test]
    fn missing_dates_are_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let store = memory();
        let sink = AlertSink::default();
        let pipeline = Pipeline::new(&config, &store, &sink);

        let path = dir.path().join("run.json");
        let mut undated = serde_json::to_value(run("a", 0, &[(READ, 1.0)])).unwrap();
        undated.as_object_mut().unwrap().remove("date");
        fs::write(&path, undated.to_string()).unwrap();

        let options = IngestOptions {
            suite: Some("Labels".to_owned()),
            date: Some(1_765_181_815_106),
        };
        let ingested = pipeline.ingest_file(&path, &Adapters::Null, &options).unwrap();

        assert_eq!(ingested.suite, "Labels");
        assert_eq!(
            store.load().unwrap().history.last_update(),
            1_765_181_815_106
        );
    }

    #[test]
    fn unpersisted_runs_are_kept_for_replay() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");
        let mut config = config();
        config.replay_dir = Some(dir.path().join("replay"));
        let store = StorageAdapters::File(FileStore::open(target.clone(), Duration::from_millis(20)));
        let sink = AlertSink::open(&AlertConfig::default()).unwrap();
        let pipeline = Pipeline::new(&config, &store, &sink);

        // a lock nobody releases
        fs::write(dir.path().join("data.json.lock"), "elsewhere:1\n").unwrap();

        let path = dir.path().join("run.json");
        fs::write(&path, serde_json::to_string(&run("a", 9, &[(READ, 1.0)])).unwrap()).unwrap();

        let result = pipeline.ingest_file(&path, &Adapters::Null, &IngestOptions::default());

        assert!(matches!(
            result,
            Err(RunnerError::Ingest(IngestError::PersistFailed(_)))
        ));
        assert!(dir.path().join("replay/LabelsBenchmark-a-9.json").is_file());
        assert!(!target.exists());
    }
}
