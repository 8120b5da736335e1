use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager as RedisConnectionManager;
use tracing::{debug, info};

use super::{EventStream, RelayStore};
use crate::error::{RelayError, RelayResult};
use crate::keys::KeyBuilder;
use crate::model::{field, ChannelMetadata, ClientRecord, Fields};

/// INCR the head, refresh its TTL and store the chunk under the new index.
/// Returns the new index.
const APPEND_CHUNK: &str = r"
    local index = redis.call('INCR', KEYS[1])
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
    redis.call('SET', ARGV[1] .. index, ARGV[2], 'PX', ARGV[4])
    return index
";

/// Extend the owner lock only while we still hold it.
const RENEW_OWNER: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
";

/// Delete the owner lock only while we still hold it.
const RELEASE_OWNER: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// HSET that never recreates a deleted channel hash.
const UPDATE_IF_EXISTS: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end
    redis.call('HSET', KEYS[1], unpack(ARGV))
    return 1
";

const ADD_BYTES_IF_EXISTS: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end
    return redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
";

/// Refresh a client record, but only for current members of the channel.
const TOUCH_CLIENT: &str = r"
    if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    if #ARGV > 2 then
        redis.call('HSET', KEYS[2], unpack(ARGV, 3))
    end
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return 1
";

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn flatten(fields: Fields) -> Vec<String> {
    fields.into_iter().flat_map(|(k, v)| [k, v]).collect()
}

/// Redis-backed `RelayStore`.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    redis: RedisConnectionManager,
    keys: KeyBuilder,
}

impl RedisStore {
    /// Open a managed connection; fails if Redis cannot be reached within `connect_timeout`.
    pub async fn connect(url: &str, keys: KeyBuilder, connect_timeout: Duration) -> RelayResult<Self> {
        let client = redis::Client::open(url)?;
        let redis = tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| RelayError::Unavailable(format!("timed out connecting to {url}")))??;
        info!(prefix = keys.prefix(), "Connected to Redis");
        Ok(Self { client, redis, keys })
    }

    async fn scan(&self, pattern: &str) -> RelayResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut found = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }

    async fn delete_keys(&self, keys: &[String]) -> RelayResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RelayStore for RedisStore {
    fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    async fn append_chunk(
        &self,
        channel_id: &str,
        data: Bytes,
        chunk_ttl: Duration,
        index_ttl: Duration,
    ) -> RelayResult<u64> {
        let mut conn = self.redis.clone();
        let chunk_prefix = self
            .keys
            .buffer_chunk_pattern(channel_id)
            .trim_end_matches('*')
            .to_string();

        let index: u64 = redis::Script::new(APPEND_CHUNK)
            .key(self.keys.buffer_index(channel_id))
            .arg(chunk_prefix)
            .arg(data.as_ref())
            .arg(millis(index_ttl))
            .arg(millis(chunk_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(index)
    }

    async fn read_chunks(
        &self,
        channel_id: &str,
        start: u64,
        count: usize,
    ) -> RelayResult<Vec<Option<Bytes>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = (start..start + count as u64)
            .map(|index| self.keys.buffer_chunk(channel_id, index))
            .collect();

        let mut conn = self.redis.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn chunk_exists(&self, channel_id: &str, index: u64) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.buffer_chunk(channel_id, index))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn chunk_ttl(&self, channel_id: &str, index: u64) -> RelayResult<Option<Duration>> {
        let mut conn = self.redis.clone();
        let pttl: i64 = redis::cmd("PTTL")
            .arg(self.keys.buffer_chunk(channel_id, index))
            .query_async(&mut conn)
            .await?;
        // -2: missing, -1: no expiry (never written by us)
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn buffer_head(&self, channel_id: &str) -> RelayResult<u64> {
        let mut conn = self.redis.clone();
        let head: Option<u64> = redis::cmd("GET")
            .arg(self.keys.buffer_index(channel_id))
            .query_async(&mut conn)
            .await?;
        Ok(head.unwrap_or_default())
    }

    async fn clear_buffer(&self, channel_id: &str) -> RelayResult<()> {
        let mut keys = self.scan(&self.keys.buffer_chunk_pattern(channel_id)).await?;
        keys.push(self.keys.buffer_index(channel_id));
        debug!(channel_id, keys = keys.len(), "Clearing buffer");
        for batch in keys.chunks(500) {
            self.delete_keys(batch).await?;
        }
        Ok(())
    }

    async fn try_acquire_owner(
        &self,
        channel_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> RelayResult<bool> {
        self.set_ephemeral_nx(&self.keys.channel_owner(channel_id), worker_id, ttl)
            .await
    }

    async fn renew_owner(
        &self,
        channel_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let renewed: i64 = redis::Script::new(RENEW_OWNER)
            .key(self.keys.channel_owner(channel_id))
            .arg(worker_id)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_owner(&self, channel_id: &str, worker_id: &str) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let released: i64 = redis::Script::new(RELEASE_OWNER)
            .key(self.keys.channel_owner(channel_id))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn owner(&self, channel_id: &str) -> RelayResult<Option<String>> {
        self.get_ephemeral(&self.keys.channel_owner(channel_id)).await
    }

    async fn write_channel(&self, channel_id: &str, metadata: &ChannelMetadata) -> RelayResult<()> {
        let key = self.keys.channel_metadata(channel_id);
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg(flatten(metadata.to_fields()))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_channel(&self, channel_id: &str, fields: Fields) -> RelayResult<bool> {
        if fields.is_empty() {
            return Ok(true);
        }
        let mut conn = self.redis.clone();
        let updated: i64 = redis::Script::new(UPDATE_IF_EXISTS)
            .key(self.keys.channel_metadata(channel_id))
            .arg(flatten(fields))
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn read_channel(&self, channel_id: &str) -> RelayResult<Option<ChannelMetadata>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.channel_metadata(channel_id))
            .query_async(&mut conn)
            .await?;
        Ok(ChannelMetadata::from_fields(&fields))
    }

    async fn add_channel_bytes(&self, channel_id: &str, bytes: u64) -> RelayResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::Script::new(ADD_BYTES_IF_EXISTS)
            .key(self.keys.channel_metadata(channel_id))
            .arg(field::TOTAL_BYTES)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> RelayResult<()> {
        let mut keys: Vec<String> = self
            .client_ids(channel_id)
            .await?
            .iter()
            .map(|client_id| self.keys.client_record(channel_id, client_id))
            .collect();
        keys.extend([
            self.keys.client_set(channel_id),
            self.keys.channel_metadata(channel_id),
            self.keys.switch_request(channel_id),
            self.keys.last_client_disconnect(channel_id),
        ]);
        self.delete_keys(&keys).await
    }

    async fn list_channels(&self) -> RelayResult<Vec<String>> {
        let keys = self.scan(&self.keys.channel_metadata_pattern()).await?;
        let mut channels: Vec<String> = keys
            .iter()
            .filter_map(|k| self.keys.parse_channel_metadata(k).map(str::to_string))
            .collect();
        channels.sort();
        channels.dedup();
        Ok(channels)
    }

    async fn register_client(
        &self,
        channel_id: &str,
        record: &ClientRecord,
        ttl: Duration,
    ) -> RelayResult<()> {
        let record_key = self.keys.client_record(channel_id, &record.client_id);
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.client_set(channel_id))
            .arg(&record.client_id)
            .ignore()
            .cmd("DEL")
            .arg(&record_key)
            .ignore()
            .cmd("HSET")
            .arg(&record_key)
            .arg(flatten(record.to_fields()))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&record_key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn touch_client(
        &self,
        channel_id: &str,
        client_id: &str,
        fields: Fields,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let touched: i64 = redis::Script::new(TOUCH_CLIENT)
            .key(self.keys.client_set(channel_id))
            .key(self.keys.client_record(channel_id, client_id))
            .arg(client_id)
            .arg(millis(ttl))
            .arg(flatten(fields))
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn read_client(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> RelayResult<Option<ClientRecord>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.client_record(channel_id, client_id))
            .query_async(&mut conn)
            .await?;
        Ok(ClientRecord::from_fields(client_id, &fields))
    }

    async fn unregister_client(&self, channel_id: &str, client_id: &str) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.keys.client_record(channel_id, client_id))
            .ignore()
            .cmd("SREM")
            .arg(self.keys.client_set(channel_id))
            .arg(client_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn client_ids(&self, channel_id: &str) -> RelayResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.client_set(channel_id))
            .query_async(&mut conn)
            .await?;
        ids.sort();
        Ok(ids)
    }

    async fn client_count(&self, channel_id: &str) -> RelayResult<usize> {
        let mut conn = self.redis.clone();
        let count: usize = redis::cmd("SCARD")
            .arg(self.keys.client_set(channel_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn set_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ephemeral_nx(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool> {
        let mut conn = self.redis.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn get_ephemeral(&self, key: &str) -> RelayResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete_key(&self, key: &str) -> RelayResult<()> {
        self.delete_keys(&[key.to_string()]).await
    }

    async fn publish(&self, channel_id: &str, payload: &str) -> RelayResult<usize> {
        let mut conn = self.redis.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(self.keys.events(channel_id))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self) -> RelayResult<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(self.keys.events_pattern()).await?;

        let keys = self.keys.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let topic = msg.get_channel_name().to_string();
            let item = match (keys.parse_events(&topic), msg.get_payload::<String>()) {
                (Some(channel_id), Ok(payload)) => Some((channel_id.to_string(), payload)),
                _ => {
                    debug!(topic = %topic, "Ignoring malformed pub/sub message");
                    None
                }
            };
            futures::future::ready(item)
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> RedisStore {
        RedisStore::connect(
            "redis://localhost:6379",
            KeyBuilder::new(format!("tsrelay_test_{}", nanoid::nanoid!(6))),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_flatten_fields() {
        let flat = flatten(vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(flat, vec!["a", "1", "b", "2"]);
        assert_eq!(millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_append_and_read() {
        let store = store().await;
        let ttl = Duration::from_secs(60);

        let first = store
            .append_chunk("c1", Bytes::from_static(b"one"), ttl, ttl)
            .await
            .unwrap();
        let second = store
            .append_chunk("c1", Bytes::from_static(b"two"), ttl, ttl)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let chunks = store.read_chunks("c1", 1, 3).await.unwrap();
        assert_eq!(chunks[1].as_deref(), Some(&b"two"[..]));
        assert!(chunks[2].is_none());

        store.clear_buffer("c1").await.unwrap();
        assert_eq!(store.buffer_head("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_owner_compare_and_release() {
        let store = store().await;
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_owner("c1", "w1", ttl).await.unwrap());
        assert!(!store.try_acquire_owner("c1", "w2", ttl).await.unwrap());
        assert!(!store.release_owner("c1", "w2").await.unwrap());
        assert!(store.renew_owner("c1", "w1", ttl).await.unwrap());
        assert!(store.release_owner("c1", "w1").await.unwrap());
        assert!(store.owner("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_update_channel_requires_existing_hash() {
        let store = store().await;
        let fields = vec![("state".to_string(), "active".to_string())];
        assert!(!store.update_channel("ghost", fields.clone()).await.unwrap());

        let meta = ChannelMetadata::initializing("w1", "http://u", "VLC", None, "Proxy", 0.0);
        store.write_channel("c2", &meta).await.unwrap();
        assert!(store.update_channel("c2", fields).await.unwrap());
        assert_eq!(store.list_channels().await.unwrap(), vec!["c2".to_string()]);

        store.delete_channel("c2").await.unwrap();
        assert!(store.read_channel("c2").await.unwrap().is_none());
    }
}
