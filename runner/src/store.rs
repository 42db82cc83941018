pub mod file;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::config::StoreConfig;
use benchtrail_ingest::{History, IngestError, Run, Suite};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tracing::debug;

/// Identity of the persisted state a snapshot was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// nothing was persisted yet
    Missing,
    Document { checksum: u32, length: u64 },
    Generation(u64),
    /// version of every suite record
    Versions(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub history: History,
    pub revision: Revision,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            history: History::default(),
            revision: Revision::Missing,
        }
    }
}

#[derive(Debug)]
pub enum StorageAdapters {
    File(file::FileStore),
    #[cfg(feature = "sqlite")]
    SQLite(sqlite::SQLiteStore),
    Memory(memory::MemoryStore),
}

impl StorageAdapters {
    pub fn open(config: &StoreConfig, timeout: Duration) -> Result<Self, IngestError> {
        match config {
            StoreConfig::File { path } => {
                Ok(Self::File(file::FileStore::open(path.clone(), timeout)))
            }
            #[cfg(feature = "sqlite")]
            StoreConfig::SQLite { path } => {
                Ok(Self::SQLite(sqlite::SQLiteStore::open(path, timeout)?))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreConfig::SQLite { .. } => Err(IngestError::persist(
                "benchtrail was built without the sqlite feature",
            )),
            StoreConfig::Memory => Ok(Self::Memory(memory::MemoryStore::new(timeout))),
        }
    }

    /// Read the persisted history, an absent store yields an empty history.
    pub fn load(&self) -> Result<Snapshot, IngestError> {
        match self {
            Self::File(store) => store.load(),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.load(),
            Self::Memory(store) => store.load(),
        }
    }

    /// Persist `history` if the store still holds the state `snapshot` was read from.
    pub fn commit(&self, snapshot: &Snapshot, history: &History) -> Result<Revision, IngestError> {
        match self {
            Self::File(store) => store.commit(snapshot, history),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.commit(snapshot, history),
            Self::Memory(store) => store.commit(snapshot, history),
        }
    }
}

/// Position of a run inside its suite: its date and its rank among runs of that date.
pub type Slot = (u64, usize);

/// Runs of one suite that differ between two histories.
#[derive(Debug)]
pub struct SuiteChange<'a> {
    pub suite: &'a Suite,
    pub created: bool,
    pub writes: Vec<(Slot, &'a Run)>,
}

pub fn slots(runs: &[Run]) -> impl Iterator<Item = (Slot, &Run)> {
    let mut previous: Option<Slot> = None;

    runs.iter().map(move |run| {
        let slot = match previous {
            Some((date, ordinal)) if date == run.date => (date, ordinal + 1),
            _ => (run.date, 0),
        };
        previous = Some(slot);

        (slot, run)
    })
}

/// Compute what `updated` adds to `base`.
///
/// Fails when `updated` drops a suite or a committed run of `base`. A committed run may
/// only be swapped for a republish of itself.
pub fn changes<'a>(
    base: &History,
    updated: &'a History,
) -> Result<Vec<SuiteChange<'a>>, IngestError> {
    if let Some(missing) = base
        .suites()
        .iter()
        .find(|suite| updated.suite(suite.name()).is_none())
    {
        return Err(IngestError::invalid(format!(
            "history drops suite {}",
            missing.name()
        )));
    }

    let mut changes = Vec::new();

    for suite in updated.suites() {
        let Some(previous) = base.suite(suite.name()) else {
            changes.push(SuiteChange {
                suite,
                created: true,
                writes: slots(suite.runs()).collect(),
            });

            continue;
        };

        let current: HashMap<Slot, &Run> = slots(suite.runs()).collect();
        let mut writes = Vec::new();

        for (slot, committed) in slots(previous.runs()) {
            match current.get(&slot) {
                Some(run) if *run == committed => {}
                Some(run) if run.is_republish_of(committed) => {
                    writes.push((slot, *run));
                }
                _ => {
                    return Err(IngestError::invalid(format!(
                        "history drops run {} dated {} of suite {}",
                        committed.commit.id,
                        committed.date,
                        suite.name()
                    )))
                }
            }
        }

        let known: HashMap<Slot, &Run> = slots(previous.runs()).collect();
        writes.extend(slots(suite.runs()).filter(|(slot, _)| !known.contains_key(slot)));

        if !writes.is_empty() {
            changes.push(SuiteChange {
                suite,
                created: false,
                writes,
            });
        }
    }

    debug!(suites = changes.len(), "Computed history changes");

    Ok(changes)
}
