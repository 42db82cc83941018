use crate::{
    error::IngestError,
    integrity,
    model::{History, Run, Suite},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// the run became a new entry of the series
    Appended,
    /// the run republished a stored entry and took its place
    Replaced,
}

/// Result of merging one run, `index` is the run's position inside `suite`.
#[derive(Debug, Clone)]
pub struct Merged {
    pub history: History,
    pub suite: String,
    pub index: usize,
    pub outcome: MergeOutcome,
}

/// Reject runs that would break the history invariants of `suite`.
pub fn validate_run(history: &History, suite: &str, run: &Run) -> Result<(), IngestError> {
    if suite.trim().is_empty() {
        return Err(IngestError::invalid("suite name must not be empty"));
    }

    let mut units = history.suite(suite).map(Suite::units).unwrap_or_default();

    integrity::check_run(run, &mut units)
        .map_err(|error| IngestError::invalid(format!("suite {suite}: {error}")))
}

/// Integrate `run` into `suite`, leaving `history` untouched.
///
/// A run carrying the same commit id and date as a stored run of the suite replaces
/// it, every other run is inserted in date order after runs of the same date.
pub fn merge(history: &History, suite: &str, run: Run) -> Result<Merged, IngestError> {
    validate_run(history, suite, &run)?;

    let republished = history
        .suite(suite)
        .and_then(|stored| stored.republished(&run));

    let commit = run.commit.id.clone();
    let mut updated = history.clone();

    let (index, outcome) = match republished {
        Some(index) => (updated.replace_run(suite, index, run), MergeOutcome::Replaced),
        None => (updated.insert_run(suite, run), MergeOutcome::Appended),
    };

    debug!(suite, commit = %commit, index, outcome = ?outcome, "Merged run");

    Ok(Merged {
        history: updated,
        suite: suite.to_owned(),
        index,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Commit, Identity, Measurement};

    fn run(commit: &str, date: u64, value: f64) -> Run {
        let identity = Identity {
            name: "Ada".to_owned(),
            username: Some("ada".to_owned()),
            email: None,
        };

        Run {
            commit: Commit {
                author: identity.clone(),
                committer: identity,
                id: commit.to_owned(),
                message: "bench".to_owned(),
                timestamp: "2025-12-05T11:19:20Z".to_owned(),
                url: format!("https://example.com/commit/{commit}"),
            },
            date,
            tool: "jmh".to_owned(),
            benches: vec![Measurement::new("pkg.Bench.read", value, "ms/op")],
        }
    }

    #[test]
    fn first_run_creates_the_suite() {
        let merged = merge(&History::new("repo"), "Bench", run("a", 10, 1.0)).unwrap();

        assert_eq!(merged.outcome, MergeOutcome::Appended);
        assert_eq!(merged.index, 0);
        assert_eq!(merged.history.suite("Bench").map(Suite::len), Some(1));
        assert_eq!(merged.history.last_update(), 10);
    }

    #[test]
    fn republish_replaces_latest() {
        let history = merge(&History::new("repo"), "Bench", run("a", 10, 1.0))
            .unwrap()
            .history;
        let merged = merge(&history, "Bench", run("a", 10, 2.0)).unwrap();

        assert_eq!(merged.outcome, MergeOutcome::Replaced);
        let runs = merged.history.suite("Bench").unwrap().runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].benches[0].value, 2.0);
    }

    #[test]
    fn same_commit_with_new_date_is_kept() {
        let history = merge(&History::new("repo"), "Bench", run("a", 10, 1.0))
            .unwrap()
            .history;
        let merged = merge(&history, "Bench", run("a", 20, 1.1)).unwrap();

        assert_eq!(merged.outcome, MergeOutcome::Appended);
        assert_eq!(merged.history.suite("Bench").map(Suite::len), Some(2));
    }

    #[test]
    fn late_run_is_inserted_in_date_order() {
        let history = History::new("repo")
            .append_run("Bench", run("a", 10, 1.0))
            .append_run("Bench", run("c", 30, 1.0));
        let merged = merge(&history, "Bench", run("b", 20, 1.0)).unwrap();

        assert_eq!(merged.index, 1);
        let ids = merged
            .history
            .suite("Bench")
            .unwrap()
            .runs()
            .iter()
            .map(|run| run.commit.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn republish_of_an_older_run_replaces_it_in_place() {
        let history = History::new("repo")
            .append_run("Bench", run("a", 10, 1.0))
            .append_run("Bench", run("b", 10, 1.0))
            .append_run("Bench", run("c", 30, 1.0));
        let merged = merge(&history, "Bench", run("a", 10, 4.0)).unwrap();

        assert_eq!(merged.outcome, MergeOutcome::Replaced);
        assert_eq!(merged.index, 0);
        let runs = merged.history.suite("Bench").unwrap().runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].benches[0].value, 4.0);
        assert_eq!(runs[1].commit.id, "b");
    }

    #[test]
    fn equal_dates_keep_ingestion_order() {
        let history = History::new("repo")
            .append_run("Bench", run("a", 10, 1.0))
            .append_run("Bench", run("b", 10, 1.0));
        let merged = merge(&history, "Bench", run("c", 10, 1.0)).unwrap();

        assert_eq!(merged.index, 2);
    }

    #[test]
    fn invalid_runs_are_rejected() {
        let history = History::new("repo");

        let mut empty = run("a", 10, 1.0);
        empty.benches.clear();
        let mut nan = run("a", 10, 1.0);
        nan.benches[0].value = f64::NAN;
        let mut mixed = run("a", 10, 1.0);
        mixed.benches.push(Measurement::new("pkg.Bench.read", 3.0, "us/op"));

        for candidate in [empty, nan, mixed] {
            assert!(matches!(
                merge(&history, "Bench", candidate),
                Err(IngestError::InvalidRun(_))
            ));
        }

        assert!(matches!(
            merge(&history, " ", run("a", 10, 1.0)),
            Err(IngestError::InvalidRun(_))
        ));
    }

    #[test]
    fn merge_does_not_touch_the_input() {
        let history = History::new("repo").append_run("Bench", run("a", 10, 1.0));
        let before = history.clone();

        merge(&history, "Bench", run("a", 10, 5.0)).unwrap();

        assert_eq!(history, before);
    }
}
