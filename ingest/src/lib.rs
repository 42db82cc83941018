//! History model and merge engine for benchmark series.
//!
//! A [`History`] maps suite names to date-ordered runs. New runs enter through
//! [`merge`], which validates them against the suite and either inserts them or
//! replaces the stored run they republish. Persistence lives in the runner.

pub mod error;
mod integrity;
pub mod key;
pub mod merge;
pub mod model;

pub use error::IngestError;
pub use key::BenchmarkKey;
pub use merge::{merge, validate_run, MergeOutcome, Merged};
pub use model::{Commit, History, Identity, Measurement, Run, RunReport, Suite};
