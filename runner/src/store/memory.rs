use super::{changes, Revision, Snapshot};
use benchtrail_ingest::{History, IngestError};
use parking_lot::{Mutex, MutexGuard};
use std::{sync::Arc, time::Duration};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    history: History,
    generation: u64,
}

/// Process local store, clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    timeout: Duration,
}

impl MemoryStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::default(),
            timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, IngestError> {
        self.state.try_lock_for(self.timeout).ok_or_else(|| {
            IngestError::persist(format!(
                "timed out after {:?} waiting for the memory store",
                self.timeout
            ))
        })
    }

    pub fn load(&self) -> Result<Snapshot, IngestError> {
        let state = self.lock()?;

        Ok(Snapshot {
            history: state.history.clone(),
            revision: Revision::Generation(state.generation),
        })
    }

    pub fn commit(&self, snapshot: &Snapshot, history: &History) -> Result<Revision, IngestError> {
        changes(&snapshot.history, history)?;

        let mut state = self.lock()?;

        if snapshot.revision != Revision::Generation(state.generation) {
            return Err(IngestError::StaleWrite);
        }

        state.history = history.clone();
        state.generation += 1;
        debug!(generation = state.generation, "Committed history");

        Ok(Revision::Generation(state.generation))
    }
}
