use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("cannot read log source {path}: {reason}")]
    LogUnreadable { path: PathBuf, reason: String },

    #[error("log retrieval failed: {0}")]
    Retrieval(String),

    #[error("every one of the {0} records in the log source is malformed")]
    NoValidRecords(usize),

    #[error("cannot write active-set artifact {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read active-set artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot load roster {path}: {reason}")]
    Roster { path: PathBuf, reason: String },

    #[error("cannot load level list {path}: {reason}")]
    LevelList { path: PathBuf, reason: String },

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("discord settings missing: add a `discord:` section to data/config.yaml")]
    MissingDiscordConfig,

    #[error("bot token not found: set DISCORD_BOT_TOKEN or discord.bot_token")]
    MissingToken,

    #[error("role '{0}' not found in guild")]
    RoleNotFound(String),

    #[error("cannot fetch role membership: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ActivityError>;
