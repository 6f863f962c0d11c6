//! The guild member list, as pasted from the in-game `/g list` output.
//!
//! ```text
//! Guild Name: Eggs
//! -- Guild Master --
//! [MVP+] Eggbert ●
//! -- Raw Egg --
//! Shelly ●  Yolk ●  Albumen ●
//! Total Members: 4
//! ```

use crate::error::{ActivityError, Result};
use crate::types::Identity;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

const MEMBER_SEPARATOR: char = '●';

static RANK_RE: OnceLock<Regex> = OnceLock::new();
static TAG_RE: OnceLock<Regex> = OnceLock::new();

fn rank_re() -> &'static Regex {
    RANK_RE.get_or_init(|| Regex::new(r"^--\s*([^-\s].*?)\s*--$").expect("valid regex"))
}

fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| Regex::new(r"^\[[^\]]*\]\s*").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rank {
    pub name: String,
    pub members: Vec<Identity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Roster {
    pub ranks: Vec<Rank>,
}

impl Roster {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut lines = text.lines().map(str::trim);
        let mut ranks: Vec<Rank> = Vec::new();

        // Skip the preamble up to the first rank header.
        for line in lines.by_ref() {
            if let Some(c) = rank_re().captures(line) {
                ranks.push(Rank {
                    name: c[1].to_string(),
                    members: Vec::new(),
                });
                break;
            }
        }
        if ranks.is_empty() {
            return Err("no rank sections (lines like `-- Rank --`) found".to_string());
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some(c) = rank_re().captures(line) {
                ranks.push(Rank {
                    name: c[1].to_string(),
                    members: Vec::new(),
                });
            } else if line.contains(MEMBER_SEPARATOR) {
                let Some(rank) = ranks.last_mut() else {
                    break;
                };
                for raw in line.split(MEMBER_SEPARATOR) {
                    let name = tag_re().replace(raw.trim(), "");
                    if let Ok(id) = Identity::new(name.as_ref()) {
                        rank.members.push(id);
                    }
                }
            } else {
                break;
            }
        }
        Ok(Self { ranks })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let err = |reason: String| ActivityError::Roster {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        Self::parse(&text).map_err(err)
    }

    pub fn members(&self) -> BTreeSet<Identity> {
        self.ranks
            .iter()
            .flat_map(|r| r.members.iter().cloned())
            .collect()
    }

    pub fn rank_of(&self, identity: &Identity) -> Option<&str> {
        self.ranks
            .iter()
            .find(|r| r.members.contains(identity))
            .map(|r| r.name.as_str())
    }

    /// Split `identities` by rank, keeping roster order of ranks and dropping
    /// empty ranks.
    pub fn group<'r, 'i>(
        &'r self,
        identities: impl IntoIterator<Item = &'i Identity> + Clone,
    ) -> Vec<(&'r str, Vec<&'i Identity>)> {
        self.ranks
            .iter()
            .filter_map(|rank| {
                let hits: Vec<&Identity> = identities
                    .clone()
                    .into_iter()
                    .filter(|i| rank.members.contains(*i))
                    .collect();
                (!hits.is_empty()).then_some((rank.name.as_str(), hits))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
-----------------------------------------------------
              Guild Name: Eggs

              -- Guild Master --
[MVP+] Eggbert ●

              -- Raw Egg --
Shelly ●  [VIP] Yolk ●
Albumen ●

Total Members: 4
Total Online Members: 1
";

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn parses_ranks_and_strips_tags() {
        let roster = Roster::parse(SAMPLE).unwrap();
        assert_eq!(roster.ranks.len(), 2);
        assert_eq!(roster.ranks[0].name, "Guild Master");
        assert_eq!(roster.ranks[0].members, vec![id("Eggbert")]);
        assert_eq!(roster.ranks[1].name, "Raw Egg");
        assert_eq!(
            roster.ranks[1].members,
            vec![id("Shelly"), id("Yolk"), id("Albumen")]
        );
    }

    #[test]
    fn stops_at_footer() {
        let roster = Roster::parse(SAMPLE).unwrap();
        assert!(!roster.members().iter().any(|m| m.as_str().starts_with("Total")));
        assert_eq!(roster.members().len(), 4);
    }

    #[test]
    fn rank_lookup_and_grouping() {
        let roster = Roster::parse(SAMPLE).unwrap();
        assert_eq!(roster.rank_of(&id("Yolk")), Some("Raw Egg"));
        assert_eq!(roster.rank_of(&id("Nobody")), None);

        let picked = [id("Yolk"), id("Eggbert"), id("Stranger")];
        let grouped = roster.group(picked.iter());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "Guild Master");
        assert_eq!(grouped[1].1, vec![&id("Yolk")]);
    }

    #[test]
    fn grouped_identities_outlive_the_roster() {
        let picked = [id("Yolk"), id("Shelly")];
        let hits: Vec<&Identity> = {
            let roster = Roster::parse(SAMPLE).unwrap();
            roster
                .group(picked.iter())
                .into_iter()
                .flat_map(|(_, members)| members)
                .collect()
        };
        assert_eq!(hits, vec![&id("Yolk"), &id("Shelly")]);
    }

    #[test]
    fn missing_headers_is_an_error() {
        assert!(Roster::parse("just some names ● here").is_err());
    }

    #[test]
    fn load_reports_path() {
        let err = Roster::load(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.txt"));
    }
}
