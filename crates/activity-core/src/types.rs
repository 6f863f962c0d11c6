use crate::error::{ActivityError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable handle for a community member (an in-game name).
///
/// Equality is exact: `Alice` and `alice` are different identities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(handle: impl AsRef<str>) -> Result<Self> {
        let trimmed = handle.as_ref().trim();
        if trimmed.is_empty() || trimmed.contains(['\n', '\r']) {
            return Err(ActivityError::InvalidIdentity(handle.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = ActivityError;

    fn try_from(value: String) -> Result<Self> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// ActivityEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Join,
    Leave,
    /// First join to the guild itself, not just a login.
    GuildJoin,
}

/// One observed log line, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub kind: EventKind,
}

// ---------------------------------------------------------------------------
// ActiveSet
// ---------------------------------------------------------------------------

/// The identities that qualify as active for one evaluation.
///
/// Iteration is always in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveSet(BTreeSet<Identity>);

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Identity) -> bool {
        self.0.insert(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.0.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::collections::btree_set::Iter<'_, Identity> {
        self.0.iter()
    }

    pub fn retain(&mut self, keep: impl FnMut(&Identity) -> bool) {
        self.0.retain(keep);
    }

    pub fn as_set(&self) -> &BTreeSet<Identity> {
        &self.0
    }
}

impl FromIterator<Identity> for ActiveSet {
    fn from_iter<T: IntoIterator<Item = Identity>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ActiveSet {
    type Item = Identity;
    type IntoIter = std::collections::btree_set::IntoIter<Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ActiveSet {
    type Item = &'a Identity;
    type IntoIter = std::collections::btree_set::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_trims_whitespace() {
        let id = Identity::new("  alice \n").unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn identity_rejects_blank() {
        assert!(Identity::new("   ").is_err());
        assert!(Identity::new("").is_err());
    }

    #[test]
    fn identity_rejects_embedded_newline() {
        assert!(Identity::new("al\nice").is_err());
    }

    #[test]
    fn identity_equality_is_case_sensitive() {
        assert_ne!(Identity::new("Alice").unwrap(), Identity::new("alice").unwrap());
    }

    #[test]
    fn active_set_iterates_sorted() {
        let set: ActiveSet = ["carol", "alice", "bob"]
            .into_iter()
            .map(|s| Identity::new(s).unwrap())
            .collect();
        let names: Vec<&str> = set.iter().map(Identity::as_str).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn identity_deserialize_validates() {
        let err = serde_json::from_str::<Identity>("\"  \"");
        assert!(err.is_err());
        let ok: Identity = serde_json::from_str("\"dave\"").unwrap();
        assert_eq!(ok.as_str(), "dave");
    }
}
