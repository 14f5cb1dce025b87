//! Persistence of the dial offset across restarts.
//!
//! The offset is the only persisted quantity; everything else is rebuilt from
//! system time on startup.

use chrono::Local;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::dial::DialOffset;
use crate::error::ClockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistedOffset {
    pub offset: DialOffset,
    /// False until an operator has told us what the dial reads.
    pub has_offset: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait OffsetStore {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<PersistedOffset>, ClockError>;

    fn save(&mut self, state: &PersistedOffset) -> Result<(), ClockError>;
}

impl<T: OffsetStore + ?Sized> OffsetStore for Box<T> {
    fn load(&self) -> Result<Option<PersistedOffset>, ClockError> {
        (**self).load()
    }

    fn save(&mut self, state: &PersistedOffset) -> Result<(), ClockError> {
        (**self).save(state)
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    offset_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_offset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<String>,
}

/// `{ "offset_minutes": n, "has_offset": b, "saved_at": "..." }` in a JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OffsetStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedOffset>, ClockError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ClockError::PersistenceFault(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let file: StateFile = serde_json::from_str(&text).map_err(|e| {
            ClockError::PersistenceFault(format!("corrupt {}: {}", self.path.display(), e))
        })?;

        Ok(Some(PersistedOffset {
            offset: DialOffset::new(file.offset_minutes),
            // Files holding only an offset were written by someone who set the dial.
            has_offset: file.has_offset.unwrap_or(true),
        }))
    }

    fn save(&mut self, state: &PersistedOffset) -> Result<(), ClockError> {
        let fault = |what: &str, e: std::io::Error| {
            ClockError::PersistenceFault(format!("{} {}: {}", what, self.path.display(), e))
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| fault("create dir for", e))?;
        }

        let file = StateFile {
            offset_minutes: state.offset.minutes() as i64,
            has_offset: Some(state.has_offset),
            saved_at: Some(Local::now().to_rfc3339()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| ClockError::PersistenceFault(e.to_string()))?;

        // Write-then-rename so a crash mid-save never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| fault("write", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| fault("replace", e))?;

        debug!("[Store] Saved offset {} to {}", state.offset, self.path.display());
        Ok(())
    }
}
