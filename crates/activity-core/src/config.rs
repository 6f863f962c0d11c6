use crate::aggregate::{ActivityCriteria, Window};
use crate::error::{ActivityError, Result};
use crate::paths;
use crate::promotion::{default_rules, PromotionRule};
use crate::retry::RetryPolicy;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LogFormat
// ---------------------------------------------------------------------------

/// Shape of the raw records handed to the normalizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Discord message payloads, as returned by the channel history API.
    #[default]
    DiscordMessages,
    /// Pre-parsed `{timestamp, ign, is_join, is_guild_join}` records.
    SavedLog,
}

// ---------------------------------------------------------------------------
// MarkerConfig
// ---------------------------------------------------------------------------

/// How join/leave announcements are recognised inside message embeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default = "default_join_leave_prefix")]
    pub join_leave_prefix: String,
    #[serde(default = "default_join_color")]
    pub join_color: u32,
    #[serde(default = "default_leave_color")]
    pub leave_color: u32,
    #[serde(default = "default_guild_join_phrase")]
    pub guild_join_phrase: String,
}

fn default_join_leave_prefix() -> String {
    "<:egg_right:1178195628615028776> ".to_string()
}

fn default_join_color() -> u32 {
    4_714_569
}

fn default_leave_color() -> u32 {
    15_747_399
}

fn default_guild_join_phrase() -> String {
    "joined the guild".to_string()
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            join_leave_prefix: default_join_leave_prefix(),
            join_color: default_join_color(),
            leave_color: default_leave_color(),
            guild_join_phrase: default_guild_join_phrase(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActivityConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_min_distinct_days")]
    pub min_distinct_days: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_channels: Vec<String>,
    /// Trailing window, counted back from the newest event in the log.
    #[serde(default = "default_window_days")]
    pub window_days: Option<u32>,
    /// Explicit window bounds; when either is set they replace `window_days`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Offset of the timezone whose calendar days are counted.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_min_distinct_days() -> u32 {
    2
}

fn default_window_days() -> Option<u32> {
    Some(60)
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            min_distinct_days: default_min_distinct_days(),
            excluded_channels: Vec::new(),
            window_days: default_window_days(),
            since: None,
            until: None,
            utc_offset_minutes: 0,
        }
    }
}

impl ActivityConfig {
    pub fn window(&self) -> Window {
        if self.since.is_some() || self.until.is_some() {
            Window::Between {
                start: self.since,
                end: self.until,
            }
        } else if let Some(days) = self.window_days {
            Window::Trailing { days }
        } else {
            Window::Unbounded
        }
    }

    pub fn criteria(&self) -> Result<ActivityCriteria> {
        if self.min_distinct_days == 0 {
            return Err(ActivityError::Config(
                "activity.min_distinct_days must be at least 1".to_string(),
            ));
        }
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .ok_or_else(|| {
                ActivityError::Config(format!(
                    "activity.utc_offset_minutes out of range: {}",
                    self.utc_offset_minutes
                ))
            })?;
        Ok(ActivityCriteria {
            min_distinct_days: self.min_distinct_days,
            excluded_channels: self.excluded_channels.iter().cloned().collect::<BTreeSet<_>>(),
            window: self.window(),
            day_offset: offset,
        })
    }
}

// ---------------------------------------------------------------------------
// RetrievalConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_max_days")]
    pub max_days: u32,
}

fn default_max_messages() -> u32 {
    300_000
}

fn default_max_days() -> u32 {
    60
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_days: default_max_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// PromotionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<PromotionRule>,
    /// Level list for level-gated rules; defaults to `data/sb_level_list.txt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<PathBuf>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            levels: None,
        }
    }
}

impl PromotionConfig {
    pub fn levels_path(&self, root: &Path) -> PathBuf {
        match &self.levels {
            Some(p) => paths::resolve(root, p),
            None => paths::levels_path(root),
        }
    }

    pub fn needs_levels(&self) -> bool {
        self.rules.iter().any(|r| r.min_level.is_some())
    }
}

// ---------------------------------------------------------------------------
// DiscordConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub guild_id: String,
    /// Channel carrying the join/leave announcements.
    pub channel_id: String,
    #[serde(default = "default_role_name")]
    pub role_name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

fn default_role_name() -> String {
    "active coolio".to_string()
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl DiscordConfig {
    /// `env_token` comes from `DISCORD_BOT_TOKEN` and wins over the file.
    pub fn token(&self, env_token: Option<&str>) -> Result<String> {
        env_token
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.bot_token.clone().filter(|t| !t.trim().is_empty()))
            .ok_or(ActivityError::MissingToken)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Member list used to scope results; defaults to `data/guild_list.txt`
    /// when that file exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roster: Option<PathBuf>,
    /// Only evaluated when a roster is available.
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
}

impl Config {
    /// Load `data/config.yaml`, falling back to defaults when it is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())?;
        Ok(())
    }

    pub fn discord(&self) -> Result<&DiscordConfig> {
        self.discord.as_ref().ok_or(ActivityError::MissingDiscordConfig)
    }

    /// Roster file to use, if any: the configured path (which must exist) or
    /// the conventional location when present.
    pub fn roster_path(&self, root: &Path) -> Option<PathBuf> {
        match &self.roster {
            Some(p) => Some(paths::resolve(root, p)),
            None => {
                let default = paths::roster_path(root);
                default.exists().then_some(default)
            }
        }
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        let mut error = |message: String| {
            out.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if let Err(e) = self.activity.criteria() {
            error(match e {
                ActivityError::Config(m) => m,
                other => other.to_string(),
            });
        }
        if let (Some(since), Some(until)) = (self.activity.since, self.activity.until) {
            if since > until {
                error(format!(
                    "activity.since ({since}) is after activity.until ({until})"
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            error("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            error("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        if self.markers.join_leave_prefix.is_empty() {
            error("markers.join_leave_prefix must not be empty".to_string());
        }
        for (n, rule) in self.promotion.rules.iter().enumerate() {
            if rule.from.trim().is_empty() || rule.to.trim().is_empty() {
                error(format!("promotion.rules[{n}]: `from` and `to` are required"));
            } else if rule.from == rule.to {
                error(format!("promotion.rules[{n}]: `from` and `to` are both '{}'", rule.from));
            }
            if rule.min_level.is_some_and(|l| !l.is_finite()) {
                error(format!("promotion.rules[{n}]: min_level must be a number"));
            }
        }
        if let Some(d) = &self.discord {
            if d.role_name.trim().is_empty() {
                error("discord.role_name must not be empty".to_string());
            }
            if d.guild_id.trim().is_empty() || d.channel_id.trim().is_empty() {
                error("discord.guild_id and discord.channel_id are required".to_string());
            }
            if d.timeout_secs == 0 {
                error("discord.timeout_secs must be at least 1".to_string());
            }
        }

        if self.discord.is_none() {
            out.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no discord section: only `track --log-file` will work".to_string(),
            });
        }
        if let (Window::Trailing { days }, min) =
            (self.activity.window(), self.activity.min_distinct_days)
        {
            // A trailing window of N days spans at most N + 1 calendar days.
            if u64::from(days) + 1 < u64::from(min) {
                out.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "activity.window_days ({days}) is too short for min_distinct_days ({min}); nobody can qualify"
                    ),
                });
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.activity.min_distinct_days, 2);
        assert_eq!(cfg.activity.window(), Window::Trailing { days: 60 });
        assert_eq!(cfg.log_format, LogFormat::DiscordMessages);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
log_format: saved_log
activity:
  min_distinct_days: 3
  excluded_channels: ["off-topic"]
discord:
  guild_id: "1"
  channel_id: "2"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.log_format, LogFormat::SavedLog);
        assert_eq!(cfg.activity.min_distinct_days, 3);
        assert_eq!(cfg.activity.window_days, Some(60));
        let d = cfg.discord.unwrap();
        assert_eq!(d.role_name, "active coolio");
        assert_eq!(d.api_base, "https://discord.com/api/v10");
        assert_eq!(cfg.retry.max_attempts, 4);
    }

    #[test]
    fn explicit_bounds_replace_trailing_window() {
        let yaml = r#"
activity:
  since: 2026-01-01T00:00:00Z
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            cfg.activity.window(),
            Window::Between { start: Some(_), end: None }
        ));
    }

    #[test]
    fn null_window_days_is_unbounded() {
        let cfg: Config = serde_yaml::from_str("activity:\n  window_days: null\n").unwrap();
        assert_eq!(cfg.activity.window(), Window::Unbounded);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.activity.excluded_channels = vec!["spam".to_string()];
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_min_days_is_an_error() {
        let mut cfg = Config::default();
        cfg.activity.min_distinct_days = 0;
        assert!(cfg.activity.criteria().is_err());
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("min_distinct_days")));
    }

    #[test]
    fn short_window_warns() {
        let mut cfg = Config::default();
        cfg.activity.window_days = Some(1);
        cfg.activity.min_distinct_days = 5;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("nobody can qualify")));
    }

    #[test]
    fn env_token_wins_over_file() {
        let d = DiscordConfig {
            guild_id: "1".to_string(),
            channel_id: "2".to_string(),
            role_name: default_role_name(),
            api_base: default_api_base(),
            timeout_secs: 10,
            bot_token: Some("from-file".to_string()),
        };
        assert_eq!(d.token(Some("from-env")).unwrap(), "from-env");
        assert_eq!(d.token(None).unwrap(), "from-file");
        assert_eq!(d.token(Some("  ")).unwrap(), "from-file");

        let bare = DiscordConfig { bot_token: None, ..d };
        assert!(matches!(bare.token(None), Err(ActivityError::MissingToken)));
    }

    #[test]
    fn promotion_rules_default_and_validate() {
        let cfg = Config::default();
        assert_eq!(cfg.promotion.rules.len(), 2);
        assert!(cfg.promotion.needs_levels());
        assert_eq!(
            cfg.promotion.levels_path(Path::new("/srv")),
            PathBuf::from("/srv/data/sb_level_list.txt")
        );

        let yaml = "promotion:\n  rules:\n    - from: Raw Egg\n      to: Raw Egg\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.promotion.needs_levels());
        assert_eq!(cfg.promotion.rules[0].recent_days, 7);
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("promotion.rules[0]")));
    }

    #[test]
    fn roster_path_prefers_config() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::default();
        assert!(cfg.roster_path(dir.path()).is_none());

        std::fs::create_dir_all(dir.path().join(paths::DATA_DIR)).unwrap();
        std::fs::write(paths::roster_path(dir.path()), "").unwrap();
        assert_eq!(cfg.roster_path(dir.path()), Some(paths::roster_path(dir.path())));

        let custom = Config {
            roster: Some(PathBuf::from("members.txt")),
            ..Config::default()
        };
        assert_eq!(
            custom.roster_path(dir.path()),
            Some(dir.path().join("members.txt"))
        );
    }
}
