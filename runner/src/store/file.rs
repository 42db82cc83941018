use super::{changes, Revision, Snapshot};
use benchtrail_ingest::{History, IngestError};
use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// Global the dashboard script form assigns the document to.
pub const SCRIPT_VARIABLE: &str = "window.BENCHMARK_DATA";

pub static LOCK_SUFFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".lock");
    string
});

pub static TEMP_SUFFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".tmp");
    string
});

const MAX_LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    /// `window.BENCHMARK_DATA = {...}`
    Script,
}

impl Format {
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("js") => Self::Script,
            _ => Self::Json,
        }
    }
}

/// Single document holding the whole history, as read by the dashboard.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    timeout: Duration,
}

impl FileStore {
    pub fn open(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    pub fn load(&self) -> Result<Snapshot, IngestError> {
        let Some(content) = self.read()? else {
            debug!(path = ?self.path, "No history persisted yet");

            return Ok(Snapshot::empty());
        };

        let revision = Revision::of_document(&content);
        let history = decode(&self.path, &content)?;

        debug!(
            path = ?self.path,
            suites = history.suites().len(),
            runs = history.run_count(),
            "Loaded history"
        );

        Ok(Snapshot { history, revision })
    }

    pub fn commit(&self, snapshot: &Snapshot, history: &History) -> Result<Revision, IngestError> {
        changes(&snapshot.history, history)?;

        let _lock = LockFile::acquire(&self.path, self.timeout)?;

        let current = match self.read()? {
            Some(content) => Revision::of_document(&content),
            None => Revision::Missing,
        };

        if current != snapshot.revision {
            debug!(expected = ?snapshot.revision, found = ?current, "History changed since load");

            return Err(IngestError::StaleWrite);
        }

        let content = encode(history, Format::of(&self.path))?;
        replace(&self.path, content.as_bytes())?;

        info!(path = ?self.path, runs = history.run_count(), "Committed history");

        Ok(Revision::of_document(content.as_bytes()))
    }

    fn read(&self) -> Result<Option<Vec<u8>>, IngestError> {
        match fs::read(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(IngestError::persist(format!(
                "failed to read {}: {error}",
                self.path.to_string_lossy()
            ))),
        }
    }
}

impl Revision {
    pub fn of_document(content: &[u8]) -> Self {
        Revision::Document {
            checksum: crc32fast::hash(content),
            length: content.len() as u64,
        }
    }
}

/// Parse either document form, whatever the file is called.
pub fn decode(path: &Path, content: &[u8]) -> Result<History, IngestError> {
    let corrupt = |reason: String| {
        IngestError::corrupt(format!("{}: {reason}", path.to_string_lossy()))
    };

    let text = std::str::from_utf8(content).map_err(|error| corrupt(error.to_string()))?;
    let text = text.trim();

    let document = match text.strip_prefix(SCRIPT_VARIABLE) {
        Some(assignment) => assignment
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(|| corrupt("malformed script assignment".to_owned()))?
            .trim()
            .trim_end_matches(';'),
        None => text,
    };

    if document.is_empty() {
        return Ok(History::default());
    }

    serde_json::from_str(document).map_err(|error| corrupt(error.to_string()))
}

pub fn encode(history: &History, format: Format) -> Result<String, IngestError> {
    let document = serde_json::to_string_pretty(history)
        .map_err(|error| IngestError::persist(format!("failed to serialize history: {error}")))?;

    Ok(match format {
        Format::Json => document,
        Format::Script => format!("{SCRIPT_VARIABLE} = {document}"),
    })
}

/// Write `history` as a dashboard document, the format follows the extension of `path`.
pub fn export(path: &Path, history: &History) -> Result<(), IngestError> {
    let content = encode(history, Format::of(path))?;

    replace(path, content.as_bytes())
}

fn sibling(path: &Path, suffix: &OsString) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("benchtrail"));
    file_name.push(suffix);

    path.with_file_name(file_name)
}

/// Readers see either the old or the new content, never a partial write.
fn replace(path: &Path, content: &[u8]) -> Result<(), IngestError> {
    let failed = |step: &str, error: std::io::Error| {
        IngestError::persist(format!("failed to {step} {}: {error}", path.to_string_lossy()))
    };

    let temp = sibling(path, &TEMP_SUFFIX);

    let mut file = File::create(&temp).map_err(|error| failed("stage", error))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|error| failed("write", error))?;
    drop(file);

    if let Err(error) = fs::rename(&temp, path) {
        if let Err(cleanup) = fs::remove_file(&temp) {
            error!(error = ?cleanup, "Failed to remove staged file {}", temp.to_string_lossy());
        }

        return Err(failed("replace", error));
    }

    // persist the rename itself
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(error) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(error = ?error, "Failed to sync {}", parent.to_string_lossy());
        }
    }

    Ok(())
}

/// Exclusive lock next to the document, released on drop.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(target: &Path, timeout: Duration) -> Result<Self, IngestError> {
        let path = sibling(target, &LOCK_SUFFIX);
        let start = Instant::now();
        let mut poll = Duration::from_millis(2);

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(error) = writeln!(file, "{}", holder()) {
                        debug!(error = ?error, "Failed to record lock holder");
                    }
                    debug!(lock = ?path, "Acquired lock");

                    return Ok(Self { path });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        let holder = fs::read_to_string(&path).unwrap_or_default();

                        return Err(IngestError::persist(format!(
                            "timed out after {timeout:?} waiting for {} (held by {})",
                            path.to_string_lossy(),
                            holder.trim()
                        )));
                    }

                    thread::sleep(poll);
                    poll = (poll * 2).min(MAX_LOCK_POLL);
                }
                Err(error) => {
                    return Err(IngestError::persist(format!(
                        "failed to create {}: {error}",
                        path.to_string_lossy()
                    )))
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = ?self.path, "Released lock"),
            Err(error) => error!(error = ?error, "Failed to release lock {}", self.path.to_string_lossy()),
        }
    }
}

fn holder() -> String {
    let host = nix::unistd::gethostname()
        .map(|host| host.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());

    format!("{host}:{}", nix::unistd::getpid())
}
