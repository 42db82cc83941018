use super::AdapterError;
use benchtrail_ingest::RunReport;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Pipes a raw result file through an external normalizer.
///
/// The file becomes the adapter's stdin, the normalized run (JSON or YAML) is read
/// from its stdout.
#[derive(Debug, Clone)]
pub struct ExecAdapter {
    pub exec: PathBuf,
    pub params: Vec<String>,
    pub timeout: Duration,
}

impl ExecAdapter {
    pub fn new(exec: PathBuf, params: Vec<String>, timeout_ms: u64) -> Self {
        Self {
            exec,
            params,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(exec = ?self.exec))]
    pub fn adapt(&self, path: &Path) -> Result<RunReport, AdapterError> {
        let input = File::open(path)?;

        let mut handle = Command::new(&self.exec)
            .args(&self.params)
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(AdapterError::SpawnAdapter)?;

        // both pipes are drained while waiting, a full pipe would stall the adapter
        let stdout = handle.stdout.take().map(|pipe| thread::spawn(|| drain(pipe)));
        let stderr = handle.stderr.take().map(|pipe| thread::spawn(|| drain(pipe)));

        debug!("Adapter waiting on {}", handle.id());
        let status = match handle
            .wait_timeout(self.timeout)
            .map_err(AdapterError::ChildError)?
        {
            Some(status) => status,
            None => {
                warn!(timeout = ?self.timeout, "Adapter ran into timeout, killing it");

                if let Err(error) = handle.kill().and_then(|_| handle.wait()) {
                    error!(error = ?error, "Failed to reap timed out adapter");
                }

                return Err(AdapterError::ChildTimeout);
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        debug!("Adapter exit status: {status:?}");
        if !status.success() {
            return Err(AdapterError::ChildFailed { status, stderr });
        }

        if !stderr.is_empty() {
            debug!(stderr = stderr, "Adapter wrote to stderr");
        }

        match serde_yaml::from_str::<RunReport>(&stdout) {
            Ok(run) => Ok(run),
            Err(e) => {
                error!("Adapter output is not a normalized run: {e}");

                Err(e.into())
            }
        }
    }
}

fn drain<R: Read>(mut pipe: R) -> String {
    let mut buffer = Vec::new();

    if let Err(error) = pipe.read_to_end(&mut buffer) {
        warn!(error = ?error, "Failed to read adapter pipe");
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
