// RelayStore trait for abstraction and testing
//
// Every piece of cross-worker state goes through this trait. `RedisStore` is the
// production backend; `MemoryStore` serves single-worker deployments and tests.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::RelayResult;
use crate::keys::KeyBuilder;
use crate::model::{ChannelMetadata, ClientRecord, Fields};

/// Messages from the control topics: (`channel_id`, payload).
pub type EventStream = Pin<Box<dyn Stream<Item = (String, String)> + Send>>;

/// Shared relay state.
///
/// Buffer indices start at 1; a head of 0 means nothing has been written.
#[async_trait]
pub trait RelayStore: Send + Sync + 'static {
    fn keys(&self) -> &KeyBuilder;

    // ==================== Buffer ====================

    /// Append one chunk and return its index (atomic INCR + SET).
    async fn append_chunk(
        &self,
        channel_id: &str,
        data: Bytes,
        chunk_ttl: Duration,
        index_ttl: Duration,
    ) -> RelayResult<u64>;

    /// Read `count` consecutive chunks starting at `start`; expired or unwritten
    /// slots come back as `None`.
    async fn read_chunks(
        &self,
        channel_id: &str,
        start: u64,
        count: usize,
    ) -> RelayResult<Vec<Option<Bytes>>>;

    async fn chunk_exists(&self, channel_id: &str, index: u64) -> RelayResult<bool>;

    /// Remaining lifetime of a chunk, `None` if it is gone.
    async fn chunk_ttl(&self, channel_id: &str, index: u64) -> RelayResult<Option<Duration>>;

    async fn buffer_head(&self, channel_id: &str) -> RelayResult<u64>;

    async fn clear_buffer(&self, channel_id: &str) -> RelayResult<()>;

    // ==================== Ownership ====================

    /// SET NX with TTL. Returns true if `worker_id` now holds the lock.
    async fn try_acquire_owner(
        &self,
        channel_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> RelayResult<bool>;

    /// Extend the lock only if `worker_id` still holds it.
    async fn renew_owner(&self, channel_id: &str, worker_id: &str, ttl: Duration)
        -> RelayResult<bool>;

    /// Delete the lock only if `worker_id` still holds it.
    async fn release_owner(&self, channel_id: &str, worker_id: &str) -> RelayResult<bool>;

    async fn owner(&self, channel_id: &str) -> RelayResult<Option<String>>;

    // ==================== Channel metadata ====================

    /// Replace the whole metadata hash.
    async fn write_channel(&self, channel_id: &str, metadata: &ChannelMetadata) -> RelayResult<()>;

    /// Set fields on an existing hash. Returns false (and writes nothing) if the
    /// channel has been torn down.
    async fn update_channel(&self, channel_id: &str, fields: Fields) -> RelayResult<bool>;

    async fn read_channel(&self, channel_id: &str) -> RelayResult<Option<ChannelMetadata>>;

    /// Bump `total_bytes` on an existing hash.
    async fn add_channel_bytes(&self, channel_id: &str, bytes: u64) -> RelayResult<()>;

    /// Remove metadata, client membership and records, and pending control keys.
    /// The buffer, owner lock and teardown guard are left alone.
    async fn delete_channel(&self, channel_id: &str) -> RelayResult<()>;

    async fn list_channels(&self) -> RelayResult<Vec<String>>;

    // ==================== Clients ====================

    async fn register_client(
        &self,
        channel_id: &str,
        record: &ClientRecord,
        ttl: Duration,
    ) -> RelayResult<()>;

    /// Refresh a client record and its TTL. Returns false if the client is no
    /// longer a member of the channel.
    async fn touch_client(
        &self,
        channel_id: &str,
        client_id: &str,
        fields: Fields,
        ttl: Duration,
    ) -> RelayResult<bool>;

    async fn read_client(&self, channel_id: &str, client_id: &str)
        -> RelayResult<Option<ClientRecord>>;

    /// Remove the client. Returns true only for the caller that removed it from
    /// the membership set, so concurrent removals are observed exactly once.
    async fn unregister_client(&self, channel_id: &str, client_id: &str) -> RelayResult<bool>;

    async fn client_ids(&self, channel_id: &str) -> RelayResult<Vec<String>>;

    async fn client_count(&self, channel_id: &str) -> RelayResult<usize>;

    // ==================== Control keys ====================

    async fn set_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()>;

    /// SET NX with TTL. Returns true if this call created the key.
    async fn set_ephemeral_nx(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool>;

    async fn get_ephemeral(&self, key: &str) -> RelayResult<Option<String>>;

    async fn delete_key(&self, key: &str) -> RelayResult<()>;

    // ==================== Pub/Sub ====================

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel_id: &str, payload: &str) -> RelayResult<usize>;

    /// Subscribe to every channel's control topic. The stream ends when the
    /// underlying connection is lost.
    async fn subscribe(&self) -> RelayResult<EventStream>;
}
