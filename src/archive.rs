// src/archive.rs
//
// Append-only JSON Lines log of closed incidents, one line per incident with
// its full dispatch history.

use crate::error::{CrashGuardError, Result};
use crate::types::{DispatchAttempt, Incident, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ArchiveRecord<'a> {
    pub session_id: &'a SessionId,
    pub driver_id: &'a str,
    pub vehicle_id: &'a str,
    pub archived_at: DateTime<Utc>,
    pub incident: &'a Incident,
    pub attempts: &'a [DispatchAttempt],
}

pub struct IncidentArchive {
    path: PathBuf,
}

impl IncidentArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ArchiveRecord<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json_line = serde_json::to_string(record)
            .map_err(|e| CrashGuardError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json_line)?;
        file.flush()?;

        info!(
            "💾 {} ({}) archived to {}",
            record.incident.id,
            record.incident.status.as_str(),
            self.path.display()
        );
        Ok(())
    }
}
