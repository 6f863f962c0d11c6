pub mod active_set;
pub mod aggregate;
pub mod config;
pub mod discord;
pub mod error;
pub mod io;
pub mod normalize;
pub mod paths;
pub mod promotion;
pub mod raw_log;
pub mod reconcile;
pub mod retry;
pub mod roster;
pub mod types;

pub use error::{ActivityError, Result};
