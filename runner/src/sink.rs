use crate::config::AlertConfig;
use benchtrail_analysis::Finding;
use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};
use tracing::{error, warn};

/// Receives findings once their run is committed.
///
/// Every finding is logged, a configured output file additionally gets one JSON object per line.
#[derive(Debug, Default)]
pub struct AlertSink {
    output: Option<(PathBuf, Mutex<File>)>,
}

impl AlertSink {
    pub fn open(config: &AlertConfig) -> Result<Self, io::Error> {
        let output = match &config.output {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;

                Some((path.clone(), Mutex::new(file)))
            }
            None => None,
        };

        Ok(Self { output })
    }

    /// Returns how many findings were emitted.
    pub fn emit(&self, findings: &[Finding]) -> usize {
        for finding in findings {
            warn!(
                suite = %finding.suite_name,
                commit = %finding.commit_id,
                baseline = finding.baseline_value,
                value = finding.new_value,
                unit = %finding.unit,
                "Regression in {} (ratio {:.3})",
                finding.benchmark_key,
                finding.ratio
            );
        }

        if let Some((path, file)) = &self.output {
            if !findings.is_empty() {
                if let Err(error) = write_lines(&mut file.lock(), findings) {
                    error!(error = ?error, "Failed to write findings to {}", path.to_string_lossy());
                }
            }
        }

        findings.len()
    }
}

fn write_lines(file: &mut File, findings: &[Finding]) -> Result<(), io::Error> {
    let mut buffer = Vec::new();

    for finding in findings {
        serde_json::to_writer(&mut buffer, finding)?;
        buffer.push(b'\n');
    }

    file.write_all(&buffer)?;
    file.flush()
}
