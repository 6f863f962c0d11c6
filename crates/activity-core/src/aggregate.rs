//! Folding normalized events into the set of active identities.

use crate::types::{ActiveSet, ActivityEvent, EventKind, Identity};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

/// Time bound on which events count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Window {
    Unbounded,
    /// The `days` days before the newest event in the input.
    Trailing { days: u32 },
    /// Inclusive bounds; a missing side is open.
    Between {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

impl Window {
    /// Concrete bounds for an input whose newest event is `newest`.
    pub fn bounds(
        &self,
        newest: Option<DateTime<Utc>>,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match *self {
            Window::Unbounded => (None, None),
            // A span reaching past the earliest representable instant is unbounded.
            Window::Trailing { days } => (
                newest.and_then(|n| {
                    Duration::try_days(i64::from(days)).and_then(|d| n.checked_sub_signed(d))
                }),
                None,
            ),
            Window::Between { start, end } => (start, end),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCriteria {
    pub min_distinct_days: u32,
    pub excluded_channels: BTreeSet<String>,
    pub window: Window,
    /// Calendar days are taken in this offset.
    pub day_offset: FixedOffset,
}

impl Default for ActivityCriteria {
    fn default() -> Self {
        Self {
            min_distinct_days: 2,
            excluded_channels: BTreeSet::new(),
            window: Window::Unbounded,
            day_offset: Utc.fix(),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub days: BTreeSet<NaiveDate>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_joined: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub events_seen: usize,
    pub events_counted: usize,
    pub excluded_by_channel: usize,
    pub outside_window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub active: ActiveSet,
    /// Joined the guild inside the window but not (yet) active.
    pub grace: BTreeSet<Identity>,
    /// Every identity with at least one counted event.
    pub identities: BTreeMap<Identity, IdentitySummary>,
    pub stats: AggregateStats,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    /// Newest event outside the excluded channels; trailing spans end here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

impl ActivityReport {
    /// Drop everyone who is not on the member list.
    pub fn restrict_to(&mut self, members: &BTreeSet<Identity>) {
        self.active.retain(|i| members.contains(i));
        self.grace.retain(|i| members.contains(i));
    }

    /// Members who are neither active nor in their grace period, most
    /// recently seen first, then never-seen members alphabetically.
    pub fn inactive<'a>(&'a self, members: &'a BTreeSet<Identity>) -> Vec<&'a Identity> {
        let mut seen: Vec<&Identity> = Vec::new();
        let mut unseen: Vec<&Identity> = Vec::new();
        for m in members {
            if self.active.contains(m) || self.grace.contains(m) {
                continue;
            }
            if self.identities.contains_key(m) {
                seen.push(m);
            } else {
                unseen.push(m);
            }
        }
        seen.sort_by(|a, b| {
            let la = self.identities.get(*a).map(|s| s.last_seen);
            let lb = self.identities.get(*b).map(|s| s.last_seen);
            lb.cmp(&la).then_with(|| a.cmp(b))
        });
        seen.extend(unseen);
        seen
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Compute who is active.
///
/// An identity is active iff the number of distinct calendar days (in
/// `criteria.day_offset`) on which it has an event outside the excluded
/// channels and inside the window is at least `criteria.min_distinct_days`.
/// The result does not depend on the order of `events`.
pub fn aggregate(
    events: impl IntoIterator<Item = ActivityEvent>,
    criteria: &ActivityCriteria,
) -> ActivityReport {
    let mut stats = AggregateStats::default();
    let mut kept: Vec<ActivityEvent> = Vec::new();
    for event in events {
        stats.events_seen += 1;
        if criteria.excluded_channels.contains(&event.channel) {
            stats.excluded_by_channel += 1;
        } else {
            kept.push(event);
        }
    }
    let newest = kept.iter().map(|e| e.timestamp).max();
    let (start, end) = criteria.window.bounds(newest);

    let mut identities: BTreeMap<Identity, IdentitySummary> = BTreeMap::new();

    for event in kept {
        let before_start = start.is_some_and(|s| event.timestamp < s);
        let after_end = end.is_some_and(|e| event.timestamp > e);
        if before_start || after_end {
            stats.outside_window += 1;
            continue;
        }
        stats.events_counted += 1;

        let day = event.timestamp.with_timezone(&criteria.day_offset).date_naive();
        let summary = identities
            .entry(event.identity)
            .or_insert_with(|| IdentitySummary {
                days: BTreeSet::new(),
                last_seen: event.timestamp,
                guild_joined: None,
            });
        summary.days.insert(day);
        summary.last_seen = summary.last_seen.max(event.timestamp);
        if event.kind == EventKind::GuildJoin {
            summary.guild_joined = Some(match summary.guild_joined {
                Some(prev) => prev.max(event.timestamp),
                None => event.timestamp,
            });
        }
    }

    let threshold = criteria.min_distinct_days as usize;
    let active: ActiveSet = identities
        .iter()
        .filter(|(_, s)| s.days.len() >= threshold)
        .map(|(i, _)| i.clone())
        .collect();
    let grace = identities
        .iter()
        .filter(|(i, s)| s.guild_joined.is_some() && !active.contains(*i))
        .map(|(i, _)| i.clone())
        .collect();

    tracing::debug!(
        counted = stats.events_counted,
        identities = identities.len(),
        active = active.len(),
        "aggregated activity"
    );

    ActivityReport {
        active,
        grace,
        identities,
        stats,
        window_start: start,
        window_end: end,
        newest,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
