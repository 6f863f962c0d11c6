//! The active-set artifact: one identity per line, sorted, UTF-8.

use crate::error::{ActivityError, Result};
use crate::types::{ActiveSet, Identity};
use std::path::Path;

pub fn render(set: &ActiveSet) -> String {
    let mut out = String::new();
    for identity in set {
        out.push_str(identity.as_str());
        out.push('\n');
    }
    out
}

pub fn parse(text: &str) -> Result<ActiveSet> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(Identity::new)
        .collect()
}

/// Replace the artifact at `path` with `set`.
pub fn write(path: &Path, set: &ActiveSet) -> Result<()> {
    crate::io::atomic_write(path, render(set).as_bytes()).map_err(|source| {
        ActivityError::ArtifactWrite {
            path: path.to_path_buf(),
            source,
        }
    })
}

pub fn read(path: &Path) -> Result<ActiveSet> {
    let text = std::fs::read_to_string(path).map_err(|source| ActivityError::ArtifactRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}
