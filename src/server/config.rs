use std::env;

use crate::server::messages::DEFAULT_MAX_MESSAGE_LENGTH;
use crate::server::redis_relay::DEFAULT_CHANNEL;
use crate::server::store::DEFAULT_FEED_CAPACITY;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/listing_inbox.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub database_url: String,
    /// Cross-process change relay; disabled when unset.
    pub redis_url: Option<String>,
    pub redis_channel: String,
    pub max_message_length: usize,
    pub change_feed_capacity: usize,
    pub log_level: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            redis_url: None,
            redis_channel: DEFAULT_CHANNEL.to_string(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            change_feed_capacity: DEFAULT_FEED_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            redis_channel: lookup("REDIS_CHANNEL").unwrap_or(defaults.redis_channel),
            max_message_length: lookup("MAX_MESSAGE_LENGTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_message_length),
            change_feed_capacity: lookup("CHANGE_FEED_CAPACITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.change_feed_capacity),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}
