use crate::{
    key::BenchmarkKey,
    model::{Run, Suite},
};
use itertools::Itertools;
use std::collections::{hash_map::Entry, HashMap, HashSet};

/// Check a single run, registering the units of its keys in `units`.
///
/// Keys already present in `units` must keep their unit, this covers both the suite
/// history and keys repeated inside the run itself.
pub(crate) fn check_run<'a>(
    run: &'a Run,
    units: &mut HashMap<BenchmarkKey, &'a str>,
) -> Result<(), String> {
    if run.commit.id.trim().is_empty() {
        return Err("run has an empty commit id".to_owned());
    }

    if run.benches.is_empty() {
        return Err(format!("run for commit {} has no measurements", run.commit.id));
    }

    for measurement in &run.benches {
        if measurement.name.trim().is_empty() {
            return Err(format!(
                "run for commit {} contains a measurement without a name",
                run.commit.id
            ));
        }

        if !measurement.value.is_finite() {
            return Err(format!(
                "{} has a non-finite value ({})",
                measurement.name, measurement.value
            ));
        }

        if measurement.unit.trim().is_empty() {
            return Err(format!("{} has no unit", measurement.name));
        }

        match units.entry(measurement.key()) {
            Entry::Occupied(entry) if *entry.get() != measurement.unit => {
                return Err(format!(
                    "{} is reported in {} but its established unit is {}",
                    measurement.name,
                    measurement.unit,
                    entry.get()
                ));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(measurement.unit.as_str());
            }
        }
    }

    Ok(())
}

pub(crate) fn check_suite(suite: &Suite) -> Result<(), String> {
    if suite.name().trim().is_empty() {
        return Err("suite with an empty name".to_owned());
    }

    if let Some((index, (before, after))) = suite
        .runs()
        .iter()
        .tuple_windows()
        .enumerate()
        .find(|(_, (before, after))| before.date > after.date)
    {
        return Err(format!(
            "suite {}: run {} is dated {}, earlier than the preceding run dated {}",
            suite.name(),
            index + 1,
            after.date,
            before.date
        ));
    }

    let mut units = HashMap::new();

    for (index, run) in suite.runs().iter().enumerate() {
        check_run(run, &mut units)
            .map_err(|error| format!("suite {}: run {index}: {error}", suite.name()))?;
    }

    Ok(())
}

pub(crate) fn check_suites(suites: &[Suite]) -> Result<(), String> {
    let mut seen = HashSet::new();

    if let Some(name) = suites.iter().map(Suite::name).find(|name| !seen.insert(*name)) {
        return Err(format!("suite {name} appears twice"));
    }

    suites.iter().try_for_each(check_suite)
}
