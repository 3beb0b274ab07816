//! Local Table Registry: which named tables exist as files in the data
//! directory, and whether each must outlive the run.
//!
//! Cached tables are listed in a manifest in the data directory so a later
//! run can read them. Scratch files left behind by earlier runs are never
//! registered; reading one is a dependency error.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bulk_data::BulkData;
use crate::error::{Backend, JobError, StepRef};
use crate::executor::LocalTable;
use crate::job::StepDescriptor;

const TABLE_EXT: &str = "csv";
const MANIFEST_FILE: &str = ".sluice-cached.json";

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableEntry {
    cached: bool,
    /// Written by this run, as opposed to found on disk at start
    produced: bool,
}

#[derive(Debug)]
pub struct LocalTableRegistry {
    dir: PathBuf,
    tables: BTreeMap<String, TableEntry>,
    /// Cached table names persisted across runs
    manifest: BTreeSet<String>,
}

impl LocalTableRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tables: BTreeMap::new(),
            manifest: BTreeSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, TABLE_EXT))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Register tables available before any step runs: cached tables from
    /// earlier runs plus the named `inputs` prepared outside sluice. Returns
    /// how many were registered.
    pub fn discover(&mut self, inputs: &[String]) -> Result<usize, JobError> {
        std::fs::create_dir_all(&self.dir)?;

        let manifest_path = self.manifest_path();
        if manifest_path.is_file() {
            let text = std::fs::read_to_string(&manifest_path)?;
            self.manifest = serde_json::from_str(&text).map_err(|e| {
                JobError::Config(format!(
                    "table manifest {} is unreadable: {}",
                    manifest_path.display(),
                    e
                ))
            })?;
        }

        let candidates: BTreeSet<String> = self
            .manifest
            .iter()
            .chain(inputs.iter())
            .cloned()
            .collect();
        let mut found = 0;
        for name in candidates {
            if !self.path_for(&name).is_file() {
                if inputs.contains(&name) {
                    warn!(table = %name, path = %self.path_for(&name).display(), "Input table file is missing");
                }
                continue;
            }
            self.tables.entry(name).or_insert(TableEntry {
                cached: true,
                produced: false,
            });
            found += 1;
        }
        Ok(found)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn is_cached(&self, name: &str) -> Option<bool> {
        self.tables.get(name).map(|t| t.cached)
    }

    /// Tables for a step's imports. Every name must be registered.
    pub fn resolve(&self, names: &[String], step: &StepDescriptor) -> Result<Vec<LocalTable>, JobError> {
        names
            .iter()
            .map(|name| {
                if !self.contains(name) {
                    return Err(JobError::Dependency {
                        table: name.clone(),
                        step: StepRef::from(step),
                    });
                }
                Ok(LocalTable {
                    name: name.clone(),
                    path: self.path_for(name),
                })
            })
            .collect()
    }

    /// Write `data` as table `name` and register it.
    pub fn store(&mut self, name: &str, data: &BulkData, cached: bool) -> Result<PathBuf, JobError> {
        if data.fields().is_empty() {
            return Err(JobError::execution(
                Backend::Local,
                format!("result for table '{}' has no columns; refusing to write an unreadable table", name),
            ));
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        std::fs::write(&path, data.to_csv())?;
        debug!(table = name, path = %path.display(), rows = data.len(), cached, "Stored local table");
        self.tables.insert(
            name.to_string(),
            TableEntry {
                cached,
                produced: true,
            },
        );

        let changed = if cached {
            self.manifest.insert(name.to_string())
        } else {
            self.manifest.remove(name)
        };
        if changed {
            self.write_manifest()?;
        }
        Ok(path)
    }

    fn write_manifest(&self) -> io::Result<()> {
        let text = serde_json::to_string_pretty(&self.manifest).map_err(io::Error::other)?;
        std::fs::write(self.manifest_path(), text)
    }

    pub fn load(&self, name: &str) -> Result<BulkData, JobError> {
        let path = self.path_for(name);
        let text = std::fs::read_to_string(&path)?;
        BulkData::from_csv(&text).map_err(|e| {
            JobError::execution(
                Backend::Local,
                format!("table '{}' at {} is unreadable: {}", name, path.display(), e),
            )
        })
    }

    /// A cached table whose file is on disk, for reuse instead of
    /// recomputing.
    pub fn reusable(&self, name: &str) -> bool {
        self.is_cached(name) == Some(true) && self.path_for(name).is_file()
    }

    /// Tables written by this run, in name order.
    pub fn written(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.produced)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Delete files of scratch tables this run produced. Returns their names.
    pub fn cleanup_scratch(&mut self) -> io::Result<Vec<String>> {
        let scratch: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, t)| t.produced && !t.cached)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &scratch {
            let path = self.path_for(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            self.tables.remove(name);
        }
        Ok(scratch)
    }
}
