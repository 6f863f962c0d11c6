//! Rank promotion candidates.
//!
//! A member of `from` is a candidate for `to` when they are active, were
//! seen on enough days just before the newest event, have been in the guild
//! for at least `min_tenure_days` and, for level-gated ranks, reach
//! `min_level` on the level list.

use crate::aggregate::ActivityReport;
use crate::error::{ActivityError, Result};
use crate::roster::Roster;
use crate::types::Identity;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRule {
    pub from: String,
    pub to: String,
    /// Look-back, in days before the newest event, for recent activity.
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,
    #[serde(default = "default_min_recent_days")]
    pub min_recent_days: u32,
    /// How long ago the guild join must be, counted from the evaluation time.
    #[serde(default)]
    pub min_tenure_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<f64>,
}

fn default_recent_days() -> u32 {
    7
}

fn default_min_recent_days() -> u32 {
    1
}

/// Raw Egg → Hard Boiled Egg after a month, Hard Boiled Egg → Scrambled Egg
/// after three months at level 240.
pub fn default_rules() -> Vec<PromotionRule> {
    vec![
        PromotionRule {
            from: "Raw Egg".to_string(),
            to: "Hard Boiled Egg".to_string(),
            recent_days: default_recent_days(),
            min_recent_days: default_min_recent_days(),
            min_tenure_days: 30,
            min_level: None,
        },
        PromotionRule {
            from: "Hard Boiled Egg".to_string(),
            to: "Scrambled Egg".to_string(),
            recent_days: default_recent_days(),
            min_recent_days: default_min_recent_days(),
            min_tenure_days: 91,
            min_level: Some(240.0),
        },
    ]
}

// ---------------------------------------------------------------------------
// Level list
// ---------------------------------------------------------------------------

/// Levels pasted from the in-game leaderboard, one `#1 Name: 245.5 ...`
/// entry per line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelList {
    levels: BTreeMap<Identity, f64>,
}

impl LevelList {
    /// Lines without a `:` or without a number after it are skipped.
    pub fn parse(text: &str) -> Self {
        let levels = text
            .lines()
            .filter_map(|line| {
                let (left, right) = line.split_once(':')?;
                let name = left.split_whitespace().last()?;
                let level = right.split_whitespace().next()?.parse::<f64>().ok()?;
                Some((Identity::new(name).ok()?, level))
            })
            .collect();
        Self { levels }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ActivityError::LevelList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, identity: &Identity) -> Option<f64> {
        self.levels.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionCandidates {
    pub from: String,
    pub to: String,
    pub eligible: Vec<Identity>,
    /// Qualify on everything else, but the log holds no guild join for them.
    pub unverified_join: Vec<Identity>,
}

/// Candidates for `rule` among `report.active`. `as_of` is the moment
/// tenure is measured against; `day_offset` must match the one the report
/// was aggregated with.
pub fn candidates(
    rule: &PromotionRule,
    report: &ActivityReport,
    roster: &Roster,
    levels: &LevelList,
    day_offset: FixedOffset,
    as_of: DateTime<Utc>,
) -> PromotionCandidates {
    let mut out = PromotionCandidates {
        from: rule.from.clone(),
        to: rule.to.clone(),
        eligible: Vec::new(),
        unverified_join: Vec::new(),
    };
    if !roster.ranks.iter().any(|r| r.name == rule.from) {
        tracing::warn!(rank = %rule.from, "promotion rank not on the roster");
        return out;
    }

    let recent_from = report.newest.and_then(|n| {
        Duration::try_days(i64::from(rule.recent_days))
            .and_then(|d| n.checked_sub_signed(d))
            .map(|t| t.with_timezone(&day_offset).date_naive())
    });
    let joined_by = Duration::try_days(i64::from(rule.min_tenure_days))
        .and_then(|d| as_of.checked_sub_signed(d));

    for identity in report.active.iter() {
        if roster.rank_of(identity) != Some(rule.from.as_str()) {
            continue;
        }
        let Some(summary) = report.identities.get(identity) else {
            continue;
        };

        let recent = match recent_from {
            Some(from) => summary.days.range(from..).count(),
            None => summary.days.len(),
        };
        if recent < rule.min_recent_days as usize {
            continue;
        }
        if let Some(min) = rule.min_level {
            if !levels.get(identity).is_some_and(|l| l >= min) {
                continue;
            }
        }
        match summary.guild_joined {
            Some(joined) => {
                if joined_by.is_some_and(|limit| joined <= limit) {
                    out.eligible.push(identity.clone());
                }
            }
            None => out.unverified_join.push(identity.clone()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, ActivityCriteria};
    use crate::types::{ActivityEvent, EventKind};
    use chrono::{Offset, TimeZone};

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, day, 12, 0, 0).unwrap()
    }

    fn ev(who: &str, ts: DateTime<Utc>, kind: EventKind) -> ActivityEvent {
        ActivityEvent {
            identity: id(who),
            timestamp: ts,
            channel: "general".to_string(),
            kind,
        }
    }

    const ROSTER: &str = "\
-- Hard Boiled Egg --
Gus ●  Hank ●
-- Raw Egg --
alice ●  bob ●  carol ●  dora ●
";

    fn report(events: Vec<ActivityEvent>) -> ActivityReport {
        aggregate(events, &ActivityCriteria::default())
    }

    fn raw_rule() -> PromotionRule {
        default_rules().remove(0)
    }

    #[test]
    fn raw_members_need_recency_and_tenure() {
        let events = vec![
            // Joined long ago, seen this week.
            ev("alice", at(3, 1), EventKind::GuildJoin),
            ev("alice", at(5, 28), EventKind::Join),
            // Active, but nothing in the last week.
            ev("carol", at(3, 1), EventKind::GuildJoin),
            ev("carol", at(5, 1), EventKind::Join),
            // Joined too recently.
            ev("dora", at(5, 20), EventKind::GuildJoin),
            ev("dora", at(5, 30), EventKind::Join),
            // No guild join on record.
            ev("bob", at(5, 26), EventKind::Join),
            ev("bob", at(5, 31), EventKind::Leave),
        ];
        let roster = Roster::parse(ROSTER).unwrap();
        let got = candidates(
            &raw_rule(),
            &report(events),
            &roster,
            &LevelList::default(),
            Utc.fix(),
            at(6, 1),
        );
        assert_eq!(got.eligible, vec![id("alice")]);
        assert_eq!(got.unverified_join, vec![id("bob")]);
    }

    #[test]
    fn level_gate_uses_level_list() {
        let events = vec![
            ev("Gus", at(1, 2), EventKind::GuildJoin),
            ev("Gus", at(5, 30), EventKind::Join),
            ev("Hank", at(1, 2), EventKind::GuildJoin),
            ev("Hank", at(5, 30), EventKind::Join),
        ];
        let roster = Roster::parse(ROSTER).unwrap();
        let levels = LevelList::parse("#1 Gus: 251.3 (+2)\n#2 Hank: 199.0\nnot a level line\n");
        assert_eq!(levels.len(), 2);

        let rule = default_rules().remove(1);
        let got = candidates(&rule, &report(events), &roster, &levels, Utc.fix(), at(6, 1));
        assert_eq!(got.eligible, vec![id("Gus")]);
        assert!(got.unverified_join.is_empty());
    }

    #[test]
    fn unknown_rank_yields_nothing() {
        let events = vec![
            ev("alice", at(5, 30), EventKind::Join),
            ev("alice", at(5, 31), EventKind::Join),
        ];
        let rule = PromotionRule {
            from: "Poached Egg".to_string(),
            ..raw_rule()
        };
        let roster = Roster::parse(ROSTER).unwrap();
        let got = candidates(&rule, &report(events), &roster, &LevelList::default(), Utc.fix(), at(6, 1));
        assert!(got.eligible.is_empty() && got.unverified_join.is_empty());
    }

    #[test]
    fn missing_level_list_reports_path() {
        let err = LevelList::load(Path::new("/definitely/not/levels.txt")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/levels.txt"));
    }
}
