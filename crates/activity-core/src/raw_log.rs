//! Raw log records as fetched or replayed, before normalization.

use crate::error::{ActivityError, Result};
use serde_json::Value;
use std::path::Path;

/// One record exactly as the source produced it.
pub type RawRecord = Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLog {
    pub records: Vec<RawRecord>,
    /// Lines of a replay file that were not valid JSON.
    pub unparseable: usize,
}

impl RawLog {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            unparseable: 0,
        }
    }

    /// Every record the source contained, readable or not.
    pub fn total(&self) -> usize {
        self.records.len() + self.unparseable
    }
}

/// Parse replay text: either a JSON array of records or JSON Lines.
pub fn parse_replay(text: &str) -> std::result::Result<RawLog, String> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let records: Vec<Value> =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON array: {e}"))?;
        return Ok(RawLog::new(records));
    }

    let mut log = RawLog::default();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => log.records.push(v),
            Err(e) => {
                tracing::debug!(line = n + 1, error = %e, "skipping unparseable log line");
                log.unparseable += 1;
            }
        }
    }
    Ok(log)
}

pub fn read_replay(path: &Path) -> Result<RawLog> {
    let text = std::fs::read_to_string(path).map_err(|e| ActivityError::LogUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_replay(&text).map_err(|reason| ActivityError::LogUnreadable {
        path: path.to_path_buf(),
        reason,
    })
}

/// Persist a fetched log as a JSON array so it can be replayed later.
pub fn save(path: &Path, log: &RawLog) -> Result<()> {
    let data = serde_json::to_vec(&log.records)?;
    crate::io::atomic_write(path, &data)?;
    Ok(())
}
