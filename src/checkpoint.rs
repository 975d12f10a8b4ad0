use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

/// Durable record of migration progress. The persisted state always lags
/// or matches what the destination has acknowledged, so resuming never
/// re-delivers a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Source folder currently being migrated.
    pub folder: String,
    /// Index of the last message whose transition (append or decided skip)
    /// completed. Resume starts at this index + 1.
    pub last_processed_index: u32,
    pub processed: u64,
    pub bytes: u64,
    pub skipped: u64,
    pub updated_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    /// A missing or unparseable file is "no prior progress", never fatal.
    pub fn load(&self) -> Option<Checkpoint> {
        let data = fs::read(&self.path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!(
                    "checkpoint file {} is corrupted ({}), starting from the beginning",
                    self.path.display(),
                    err
                );
                None
            }
        }
    }

    /// Write to a temporary file, then rename, so a crash mid-write never
    /// leaves a checkpoint claiming more progress than was durable.
    pub fn save(&self, checkpoint: &Checkpoint) -> io::Result<()> {
        let mut tmp: OsString = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        fs::rename(&tmp, &self.path)
    }

    /// Removes the persisted checkpoint; a missing file is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
