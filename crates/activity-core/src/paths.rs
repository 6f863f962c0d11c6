use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DATA_DIR: &str = "data";
pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "logs";

pub const CONFIG_FILE: &str = "config.yaml";
pub const ROSTER_FILE: &str = "guild_list.txt";
pub const LEVELS_FILE: &str = "sb_level_list.txt";
pub const ACTIVE_SET_FILE: &str = "active_igns.txt";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(DATA_DIR).join(CONFIG_FILE)
}

pub fn roster_path(root: &Path) -> PathBuf {
    root.join(DATA_DIR).join(ROSTER_FILE)
}

pub fn levels_path(root: &Path) -> PathBuf {
    root.join(DATA_DIR).join(LEVELS_FILE)
}

pub fn active_set_path(root: &Path) -> PathBuf {
    root.join(OUTPUT_DIR).join(ACTIVE_SET_FILE)
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join(LOGS_DIR)
}

/// Name for a freshly fetched raw log, e.g.
/// `logs/2026-10-19.123456-logs-guild1-channel2.json`.
pub fn raw_log_path(root: &Path, at: DateTime<Local>, guild_id: &str, channel_id: &str) -> PathBuf {
    let stamp = at.format("%Y-%m-%d.%6f");
    logs_dir(root).join(format!(
        "{stamp}-logs-guild{guild_id}-channel{channel_id}.json"
    ))
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
