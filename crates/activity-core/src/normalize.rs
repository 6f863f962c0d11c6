//! Turning raw log records into [`ActivityEvent`]s.
//!
//! Two record shapes are understood, one normalizer each. Which one runs is
//! decided by [`LogFormat`] in the config, never by sniffing the records.

use crate::config::{Config, LogFormat, MarkerConfig};
use crate::error::{ActivityError, Result};
use crate::raw_log::{RawLog, RawRecord};
use crate::types::{ActivityEvent, EventKind, Identity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed record: {0}")]
pub struct MalformedRecord(pub String);

fn malformed(reason: impl Into<String>) -> MalformedRecord {
    MalformedRecord(reason.into())
}

pub trait Normalizer {
    /// `Ok(None)` means the record is well-formed but says nothing about
    /// activity (an ordinary chat message, for instance).
    fn normalize(&self, record: &RawRecord) -> std::result::Result<Option<ActivityEvent>, MalformedRecord>;
}

pub fn for_config(config: &Config) -> Box<dyn Normalizer> {
    match config.log_format {
        LogFormat::DiscordMessages => Box::new(DiscordMessageNormalizer::new(config.markers.clone())),
        LogFormat::SavedLog => {
            let channel = config
                .discord
                .as_ref()
                .map(|d| d.channel_id.clone())
                .unwrap_or_else(|| "unknown".to_string());
            Box::new(SavedLogNormalizer::new(channel))
        }
    }
}

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS[.ffffff]+HH:MM` form.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn str_field<'a>(record: &'a Value, key: &str) -> std::result::Result<&'a str, MalformedRecord> {
    record
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(format!("missing string field '{key}'")))
}

fn timestamp_field(record: &Value, key: &str) -> std::result::Result<DateTime<Utc>, MalformedRecord> {
    let raw = str_field(record, key)?;
    parse_timestamp(raw).ok_or_else(|| malformed(format!("unparseable timestamp '{raw}'")))
}

fn identity_from(word: Option<&str>) -> std::result::Result<Identity, MalformedRecord> {
    let word = word.unwrap_or_default();
    Identity::new(word).map_err(|_| malformed("announcement carries no member name"))
}

// ---------------------------------------------------------------------------
// Discord message payloads
// ---------------------------------------------------------------------------

/// Reads join/leave announcements posted as embeds by the guild bridge bot.
///
/// `"<prefix>Name has gone into a deep slumber!"` with the leave color is a
/// leave, the same with the join color is a join, and
/// `"Name joined the guild!"` is a guild join.
#[derive(Debug, Clone)]
pub struct DiscordMessageNormalizer {
    markers: MarkerConfig,
}

impl DiscordMessageNormalizer {
    pub fn new(markers: MarkerConfig) -> Self {
        Self { markers }
    }
}

impl Normalizer for DiscordMessageNormalizer {
    fn normalize(&self, record: &RawRecord) -> std::result::Result<Option<ActivityEvent>, MalformedRecord> {
        if !record.is_object() {
            return Err(malformed("record is not an object"));
        }
        let Some(embed) = record
            .get("embeds")
            .and_then(Value::as_array)
            .and_then(|e| e.first())
        else {
            return Ok(None);
        };
        // Bridge offline notices come through without a description.
        let Some(description) = embed.get("description").and_then(Value::as_str) else {
            return Ok(None);
        };

        let (identity, kind) = if let Some(rest) = description.strip_prefix(&self.markers.join_leave_prefix) {
            let identity = identity_from(rest.split(' ').next())?;
            let color = embed.get("color").and_then(Value::as_u64);
            let kind = match color {
                Some(c) if c == u64::from(self.markers.join_color) => EventKind::Join,
                Some(c) if c == u64::from(self.markers.leave_color) => EventKind::Leave,
                other => {
                    tracing::warn!(?other, description, "unknown join/leave color, skipping");
                    return Err(malformed(format!("unknown join/leave color {other:?}")));
                }
            };
            (identity, kind)
        } else if description.contains(&self.markers.guild_join_phrase) {
            (identity_from(description.split(' ').next())?, EventKind::GuildJoin)
        } else {
            return Ok(None);
        };

        let timestamp = timestamp_field(record, "timestamp")?;
        let channel = str_field(record, "channel_id")?.to_string();
        Ok(Some(ActivityEvent {
            identity,
            timestamp,
            channel,
            kind,
        }))
    }
}

// ---------------------------------------------------------------------------
// Saved logs
// ---------------------------------------------------------------------------

/// Reads `{timestamp, ign, is_join, is_guild_join, channel?}` records.
#[derive(Debug, Clone)]
pub struct SavedLogNormalizer {
    default_channel: String,
}

impl SavedLogNormalizer {
    pub fn new(default_channel: impl Into<String>) -> Self {
        Self {
            default_channel: default_channel.into(),
        }
    }
}

impl Normalizer for SavedLogNormalizer {
    fn normalize(&self, record: &RawRecord) -> std::result::Result<Option<ActivityEvent>, MalformedRecord> {
        let identity = identity_from(Some(str_field(record, "ign")?))?;
        let timestamp = timestamp_field(record, "timestamp")?;
        let is_join = record
            .get("is_join")
            .and_then(Value::as_bool)
            .ok_or_else(|| malformed("missing boolean field 'is_join'"))?;
        let is_guild_join = record
            .get("is_guild_join")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let kind = match (is_join, is_guild_join) {
            (_, true) => EventKind::GuildJoin,
            (true, false) => EventKind::Join,
            (false, false) => EventKind::Leave,
        };
        let channel = record
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_channel)
            .to_string();
        Ok(Some(ActivityEvent {
            identity,
            timestamp,
            channel,
            kind,
        }))
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub records: usize,
    pub events: usize,
    pub ignored: usize,
    pub malformed: usize,
}

/// Lazily normalizes a [`RawLog`], skipping malformed records.
pub struct Events<'a> {
    records: std::slice::Iter<'a, RawRecord>,
    normalizer: &'a dyn Normalizer,
    stats: NormalizeStats,
}

pub fn events<'a>(log: &'a RawLog, normalizer: &'a dyn Normalizer) -> Events<'a> {
    Events {
        records: log.records.iter(),
        normalizer,
        stats: NormalizeStats {
            records: log.total(),
            malformed: log.unparseable,
            ..NormalizeStats::default()
        },
    }
}

impl Events<'_> {
    /// Drain what is left and report. Fails only when the source had records
    /// and not one of them could be parsed.
    pub fn finish(mut self) -> Result<NormalizeStats> {
        for _ in self.by_ref() {}
        if self.stats.records > 0 && self.stats.malformed == self.stats.records {
            return Err(ActivityError::NoValidRecords(self.stats.records));
        }
        Ok(self.stats)
    }
}

impl Iterator for Events<'_> {
    type Item = ActivityEvent;

    fn next(&mut self) -> Option<ActivityEvent> {
        for record in self.records.by_ref() {
            match self.normalizer.normalize(record) {
                Ok(Some(event)) => {
                    self.stats.events += 1;
                    return Some(event);
                }
                Ok(None) => self.stats.ignored += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping record");
                    self.stats.malformed += 1;
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
