use crate::config::ConfigErrors;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
/// All possible sources of run files
/// Paths are handed out in ascending order, runs sharing a date keep that order
pub enum Collector {
    Files { paths: Vec<PathBuf> },
    Glob { paths: Vec<PathBuf> },
    Grouped { collectors: Vec<Collector> },
}

impl Collector {
    /// Build a collector over explicit files and directories, the latter filtered by `glob`.
    pub fn load(inputs: &[PathBuf], glob: &str) -> Result<Self, ConfigErrors> {
        let matcher = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()?
            .compile_matcher();

        inputs
            .iter()
            .map(|input| {
                if input.is_dir() {
                    Ok(Self::walk(input, &matcher))
                } else if input.is_file() {
                    Ok(Self::files(vec![input.clone()]))
                } else {
                    Err(ConfigErrors::FileNotFound(input.clone()))
                }
            })
            .try_fold(Self::grouped(), |grouped, collector| {
                collector.map(|collector| grouped.join(collector))
            })
    }

    pub fn files(mut paths: Vec<PathBuf>) -> Self {
        // reversed, `next` pops from the back
        paths.sort_unstable_by(|a, b| b.cmp(a));

        Self::Files { paths }
    }

    fn walk(root: &Path, matcher: &GlobMatcher) -> Self {
        debug!(root = ?root, glob = matcher.glob().glob(), "Collecting run files");

        // gitignored and hidden run files are still collected
        let paths = WalkBuilder::new(root)
            .standard_filters(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!("Failed to walk {}: {error}", root.to_string_lossy());
                    None
                }
            })
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .map(DirEntry::into_path)
            .filter(|path| {
                path.file_name()
                    .map_or(false, |name| matcher.is_match(name))
            })
            .sorted_by(|a, b| b.cmp(a))
            .collect_vec();

        Self::Glob { paths }
    }

    /// create an empty grouped collector
    pub fn grouped() -> Self {
        Self::Grouped {
            collectors: Vec::new(),
        }
    }

    /// join multiple collectors into a single grouped collector
    /// this will if possible reuse existing grouped collectors
    pub fn join(self, other: Self) -> Self {
        match self {
            Self::Grouped { mut collectors } => {
                match other {
                    Self::Grouped {
                        collectors: other_collectors,
                    } => {
                        collectors.extend(other_collectors);
                    }
                    non_grouped => {
                        collectors.push(non_grouped);
                    }
                };

                Self::Grouped { collectors }
            }
            non_grouped => match other {
                Self::Grouped { mut collectors } => {
                    collectors.insert(0, non_grouped);

                    Self::Grouped { collectors }
                }
                other_non_grouped => Self::Grouped {
                    collectors: vec![non_grouped, other_non_grouped],
                },
            },
        }
    }
}

impl Iterator for Collector {
    type Item = PathBuf;

    /// return accurate size for underlying iterator
    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Files { paths } | Self::Glob { paths } => (paths.len(), Some(paths.len())),
            Self::Grouped { collectors } => {
                let len = collectors
                    .iter()
                    .fold(0, |acc, collector| acc + collector.size_hint().0);

                (len, Some(len))
            }
        }
    }

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Files { paths } | Self::Glob { paths } => paths.pop(),
            Self::Grouped { collectors } => collectors.iter_mut().find_map(Iterator::next),
        }
    }
}
