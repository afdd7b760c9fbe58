//! Resume checkpoints.
//!
//! The store is a set of fingerprints backed by an append-only file with one
//! JSON object `{"name": ..., "params": {...}}` per line, keys sorted.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::DistexpError;
use crate::grid::Params;

pub const DEFAULT_CHECKPOINT_FILE: &str = ".distexp-resume";

#[derive(Serialize)]
struct Fingerprint<'a> {
    name: &'a str,
    params: &'a Params,
}

/// The canonical checkpoint line for `name` run with `params`.
pub fn fingerprint(name: &str, params: &Params) -> Result<String, DistexpError> {
    Ok(serde_json::to_string(&Fingerprint { name, params })?)
}

#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    already_run: HashSet<String>,
}

impl Checkpoint {
    /// Loads the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DistexpError> {
        let path = path.into();
        let already_run = match fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Loaded {} checkpoint entries from {}",
            already_run.len(),
            path.display()
        );
        Ok(Self { path, already_run })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.already_run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.already_run.is_empty()
    }

    pub fn was_run(&self, name: &str, params: &Params) -> Result<bool, DistexpError> {
        Ok(self.already_run.contains(&fingerprint(name, params)?))
    }

    /// Records a finished run and appends it to the file.
    pub fn add_run(&mut self, name: &str, params: &Params) -> Result<(), DistexpError> {
        let line = fingerprint(name, params)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        self.already_run.insert(line);
        Ok(())
    }

    /// Forgets every entry and removes the file.
    pub fn reset(&mut self) -> Result<(), DistexpError> {
        self.already_run.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
