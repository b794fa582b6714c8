//! The state file: each tracked container's cursor, so a restart resumes
//! where the last run stopped.
//!
//! The file is a JSON object mapping container IDs to RFC 3339 timestamps
//! with nanoseconds. Numeric values (unix seconds) are accepted on load.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::container::event::format_timestamp;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to write state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Serialize(_) => "serialize",
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

fn parse_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let nanos = (secs * 1e9).round();
            if !nanos.is_finite() || nanos.abs() > i64::MAX as f64 {
                return None;
            }
            Some(DateTime::from_timestamp_nanos(nanos as i64))
        }
        _ => None,
    }
}

/// Reads the state file. A missing or unreadable file yields an empty map,
/// so the process starts over from the beginning of every container's log.
pub fn load(path: &Path) -> HashMap<String, DateTime<Utc>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("System: state file {path:?} does not exist; reading all log entries");
            return HashMap::new();
        }
        Err(e) => {
            log::error!("System: state file {path:?} could not be read ({e}); ignoring");
            return HashMap::new();
        }
    };

    let entries: serde_json::Map<String, Value> = match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("System: state file {path:?} is corrupt ({e}); ignoring");
            return HashMap::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|(id, value)| match parse_value(&value) {
            Some(time) => Some((id, time)),
            None => {
                log::warn!("System: ignoring unusable state entry {id}: {value}");
                None
            }
        })
        .collect()
}

/// Writes the state atomically: into `<path>.new` (mode 0600), synced, then
/// renamed over `path`.
pub fn write(path: &Path, state: &HashMap<String, DateTime<Utc>>) -> Result<(), CheckpointError> {
    let entries: serde_json::Map<String, Value> = state
        .iter()
        .map(|(id, time)| (id.clone(), Value::String(format_timestamp(*time))))
        .collect();
    let body = serde_json::to_vec(&entries)?;

    let temp = temp_path(path);
    let io_error = |source| CheckpointError::Io {
        path: temp.clone(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp)
        .map_err(io_error)?;
    file.write_all(&body).map_err(io_error)?;
    file.sync_data().map_err(io_error)?;
    drop(file);

    fs::rename(&temp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}
