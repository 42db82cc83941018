use benchtrail_ingest::{
    merge, Commit, History, Identity, IngestError, Measurement, MergeOutcome, Run, Suite,
};

fn identity() -> Identity {
    Identity {
        name: "Rob".to_owned(),
        username: Some("rob".to_owned()),
        email: Some("rob@example.com".to_owned()),
    }
}

fn run(commit: &str, date: u64, measurements: &[(&str, f64, &str)]) -> Run {
    Run {
        commit: Commit {
            author: identity(),
            committer: identity(),
            id: commit.to_owned(),
            message: "Merge pull request".to_owned(),
            timestamp: "2025-12-05T11:19:20Z".to_owned(),
            url: format!("https://github.com/example/bench/commit/{commit}"),
        },
        date,
        tool: "jmh".to_owned(),
        benches: measurements
            .iter()
            .map(|(name, value, unit)| Measurement::new(*name, *value, *unit))
            .collect(),
    }
}

fn hot_hits(commit: &str, date: u64, value: f64) -> Run {
    run(
        commit,
        date,
        &[(
            "pkg.LabelsBenchmark.read_hot_hits ( {\"tripleCount\":\"100000\"} )",
            value,
            "ms/op",
        )],
    )
}

#[test]
fn ingesting_twice_equals_ingesting_once() {
    let base = History::new("https://github.com/example/bench")
        .append_run("LabelsBenchmark", hot_hits("a", 100, 135.8));

    let once = merge(&base, "LabelsBenchmark", hot_hits("b", 200, 129.1)).unwrap();
    let twice = merge(&once.history, "LabelsBenchmark", hot_hits("b", 200, 129.1)).unwrap();

    assert_eq!(twice.outcome, MergeOutcome::Replaced);
    assert_eq!(once.history, twice.history);
    assert_eq!(
        serde_json::to_string(&once.history).unwrap(),
        serde_json::to_string(&twice.history).unwrap()
    );
}

#[test]
fn late_run_ingested_twice_is_stored_once() {
    let base = History::new("https://github.com/example/bench")
        .append_run("LabelsBenchmark", hot_hits("b", 120, 129.1));

    let once = merge(&base, "LabelsBenchmark", hot_hits("a", 100, 135.8)).unwrap();
    let twice = merge(&once.history, "LabelsBenchmark", hot_hits("a", 100, 135.8)).unwrap();

    assert_eq!(once.outcome, MergeOutcome::Appended);
    assert_eq!(twice.outcome, MergeOutcome::Replaced);
    assert_eq!(twice.index, 0);
    assert_eq!(once.history, twice.history);
}

#[test]
fn dates_stay_ordered_and_runs_are_never_dropped() {
    let mut history = History::new("repo");
    // deterministic, deliberately unordered dates with repeats
    let mut state = 17u64;

    for step in 0..200u64 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let date = (state >> 33) % 50;
        let suite = if step % 3 == 0 { "Reads" } else { "Writes" };
        let candidate = run(&format!("c{step}"), date, &[("pkg.Bench.op", step as f64, "ms/op")]);

        let before = history.clone();
        let merged = merge(&history, suite, candidate).unwrap();
        assert_eq!(merged.outcome, MergeOutcome::Appended);

        for suite in before.suites() {
            let after = merged.history.suite(suite.name()).unwrap();
            for committed in suite.runs() {
                assert!(after.runs().contains(committed));
            }
        }

        history = merged.history;
    }

    for suite in history.suites() {
        assert!(suite.runs().windows(2).all(|pair| pair[0].date <= pair[1].date));
    }
    assert_eq!(history.run_count(), 200);
    assert_eq!(
        history.last_update(),
        history
            .suites()
            .iter()
            .flat_map(Suite::runs)
            .map(|run| run.date)
            .max()
            .unwrap()
    );
}

#[test]
fn unit_conflict_is_rejected_without_changes() {
    let history = History::new("repo").append_run("LabelsBenchmark", hot_hits("a", 100, 135.8));
    let snapshot = history.clone();

    let conflicting = run(
        "b",
        200,
        &[(
            "pkg.LabelsBenchmark.read_hot_hits ( {\"tripleCount\":\"100000\"} )",
            7_360.0,
            "ops/s",
        )],
    );

    match merge(&history, "LabelsBenchmark", conflicting) {
        Err(IngestError::InvalidRun(reason)) => assert!(reason.contains("ms/op")),
        other => panic!("expected a unit conflict, got {other:?}"),
    }
    assert_eq!(history, snapshot);
}

#[test]
fn new_benchmarks_may_join_an_existing_suite() {
    let history = History::new("repo").append_run("LabelsBenchmark", hot_hits("a", 100, 135.8));

    let widened = run(
        "b",
        200,
        &[
            (
                "pkg.LabelsBenchmark.read_hot_hits ( {\"tripleCount\":\"100000\"} )",
                131.0,
                "ms/op",
            ),
            ("pkg.LabelsBenchmark.write_batch", 9_000.0, "ops/s"),
        ],
    );

    let merged = merge(&history, "LabelsBenchmark", widened).unwrap();
    assert_eq!(merged.history.suite("LabelsBenchmark").map(Suite::len), Some(2));
}

#[test]
fn persisted_document_survives_a_round_trip() {
    let history = History::new("https://github.com/example/bench")
        .append_run("LabelsBenchmark", hot_hits("a", 100, 135.8))
        .append_run("AttributeBenchmark", run("a", 90, &[("pkg.AttributeBenchmark.parse", 1.5, "us/op")]));

    let encoded = serde_json::to_string_pretty(&history).unwrap();
    let decoded: History = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded, history);
    assert!(encoded.starts_with("{\n  \"lastUpdate\": 100,\n  \"repoUrl\""));
}
