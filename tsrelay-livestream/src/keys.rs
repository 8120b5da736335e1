//! Redis key namespace for the relay.
//!
//! Every shared key lives under a configurable prefix (default `ts_proxy`) and,
//! for per-channel state, under `{prefix}:channel:{channel_id}`. Channel ids are
//! opaque strings; they are never parsed back out except by the scan helpers at
//! the bottom of this file.

use tsrelay_core::config::RedisConfig;

/// Builds every Redis key used by the relay.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &RedisConfig) -> Self {
        Self::new(config.key_prefix.clone())
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn channel(&self, channel_id: &str) -> String {
        format!("{}:channel:{}", self.prefix, channel_id)
    }

    // ==================== Channel ====================

    /// Channel metadata
    ///
    /// Type: Hash
    /// Fields: url, `user_agent`, state, owner, `stream_id`, `total_bytes`, ...
    #[must_use]
    pub fn channel_metadata(&self, channel_id: &str) -> String {
        format!("{}:metadata", self.channel(channel_id))
    }

    /// Ownership lock
    ///
    /// Type: String + TTL
    /// Value: owning `worker_id`
    #[must_use]
    pub fn channel_owner(&self, channel_id: &str) -> String {
        format!("{}:owner", self.channel(channel_id))
    }

    /// Pending URL switch
    ///
    /// Type: String + TTL (control request TTL)
    /// Value: JSON { url, `user_agent`, requester }
    #[must_use]
    pub fn switch_request(&self, channel_id: &str) -> String {
        format!("{}:switch_request", self.channel(channel_id))
    }

    /// Teardown guard, set-if-absent by whichever worker tears the channel down first.
    #[must_use]
    pub fn stopping(&self, channel_id: &str) -> String {
        format!("{}:stopping", self.channel(channel_id))
    }

    /// Wall-clock seconds of the most recent client departure.
    #[must_use]
    pub fn last_client_disconnect(&self, channel_id: &str) -> String {
        format!("{}:last_client_disconnect_time", self.channel(channel_id))
    }

    // ==================== Buffer ====================

    /// Buffer head
    ///
    /// Type: Integer counter, incremented once per appended chunk
    #[must_use]
    pub fn buffer_index(&self, channel_id: &str) -> String {
        format!("{}:buffer:index", self.channel(channel_id))
    }

    /// Buffer chunk payload
    ///
    /// Type: String (raw bytes) + TTL (chunk TTL)
    #[must_use]
    pub fn buffer_chunk(&self, channel_id: &str, index: u64) -> String {
        format!("{}:buffer:chunk:{}", self.channel(channel_id), index)
    }

    #[must_use]
    pub fn buffer_chunk_pattern(&self, channel_id: &str) -> String {
        format!("{}:buffer:chunk:*", self.channel(channel_id))
    }

    // ==================== Clients ====================

    /// Client membership
    ///
    /// Type: Set
    /// Members: `client_id`
    #[must_use]
    pub fn client_set(&self, channel_id: &str) -> String {
        format!("{}:clients", self.channel(channel_id))
    }

    /// Client record
    ///
    /// Type: Hash + TTL (ghost threshold), refreshed by the owning worker's heartbeat
    #[must_use]
    pub fn client_record(&self, channel_id: &str, client_id: &str) -> String {
        format!("{}:clients:{}", self.channel(channel_id), client_id)
    }

    /// Stop request for a single client.
    #[must_use]
    pub fn client_stop(&self, channel_id: &str, client_id: &str) -> String {
        format!("{}:client:{}:stop", self.channel(channel_id), client_id)
    }

    // ==================== Events & workers ====================

    /// Control topic for one channel
    #[must_use]
    pub fn events(&self, channel_id: &str) -> String {
        format!("{}:events:{}", self.prefix, channel_id)
    }

    /// Pattern matching every channel's control topic
    #[must_use]
    pub fn events_pattern(&self) -> String {
        format!("{}:events:*", self.prefix)
    }

    /// Worker liveness
    ///
    /// Type: String + TTL (worker heartbeat TTL)
    #[must_use]
    pub fn worker_heartbeat(&self, worker_id: &str) -> String {
        format!("{}:worker:{}:heartbeat", self.prefix, worker_id)
    }

    // ==================== Scanning ====================

    #[must_use]
    pub fn channel_metadata_pattern(&self) -> String {
        format!("{}:channel:*:metadata", self.prefix)
    }

    /// Recover the channel id from a metadata key.
    #[must_use]
    pub fn parse_channel_metadata<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix(":channel:")?
            .strip_suffix(":metadata")
    }

    /// Recover the channel id from an event topic.
    #[must_use]
    pub fn parse_events<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(&self.prefix)?.strip_prefix(":events:")
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("ts_proxy")
    }
}
