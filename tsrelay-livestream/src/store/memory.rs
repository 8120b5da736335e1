// In-process RelayStore for single-worker mode and tests
//
// Mirrors the Redis semantics the relay depends on: per-key TTL (expired on
// access and by a periodic sweep on writes, measured on the tokio clock so
// paused-time tests behave), atomic counters, hashes, sets and broadcast
// pub/sub.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{EventStream, RelayStore};
use crate::error::{RelayError, RelayResult};
use crate::keys::KeyBuilder;
use crate::model::{field, ChannelMetadata, ClientRecord, Fields};

const EVENT_CAPACITY: usize = 1024;

/// Minimum time between full sweeps of expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum Value {
    Bytes(Bytes),
    Text(String),
    Int(i64),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    last_sweep: Option<Instant>,
}

impl Keyspace {
    /// Look up a key, dropping it first if its TTL has passed.
    fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get(&mut self, key: &str) -> Option<&Entry> {
        self.get_mut(key).map(|e| &*e)
    }

    fn set(&mut self, key: &str, value: Value, ttl: Option<Duration>) {
        self.sweep_expired();
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
    }

    /// Drop every expired key. Keys written once and never read again, like
    /// buffer chunks, are only reclaimed here.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn text(&mut self, key: &str) -> Option<String> {
        match self.get(key).map(|e| &e.value) {
            Some(Value::Text(s)) => Some(s.clone()),
            Some(Value::Int(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn hash_mut(&mut self, key: &str) -> Option<&mut HashMap<String, String>> {
        match self.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(h)) => Some(h),
            _ => None,
        }
    }

    fn set_members(&mut self, key: &str) -> Option<&mut HashSet<String>> {
        match self.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(s)) => Some(s),
            _ => None,
        }
    }

    fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// `RelayStore` held entirely in this process.
pub struct MemoryStore {
    keys: KeyBuilder,
    data: Mutex<Keyspace>,
    events: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(keys: KeyBuilder) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            keys,
            data: Mutex::new(Keyspace::default()),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(KeyBuilder::default())
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
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
        let index_key = self.keys.buffer_index(channel_id);
        let mut space = self.data.lock();

        let next = match space.get(&index_key).map(|e| &e.value) {
            Some(Value::Int(n)) => n + 1,
            Some(_) => {
                return Err(RelayError::Store(format!("{index_key} is not a counter")));
            }
            None => 1,
        };
        space.set(&index_key, Value::Int(next), Some(index_ttl));

        let index = u64::try_from(next).map_err(|e| RelayError::Internal(e.to_string()))?;
        space.set(
            &self.keys.buffer_chunk(channel_id, index),
            Value::Bytes(data),
            Some(chunk_ttl),
        );
        Ok(index)
    }

    async fn read_chunks(
        &self,
        channel_id: &str,
        start: u64,
        count: usize,
    ) -> RelayResult<Vec<Option<Bytes>>> {
        let mut space = self.data.lock();
        Ok((start..start + count as u64)
            .map(|index| match space.get(&self.keys.buffer_chunk(channel_id, index)) {
                Some(Entry {
                    value: Value::Bytes(b),
                    ..
                }) => Some(b.clone()),
                _ => None,
            })
            .collect())
    }

    async fn chunk_exists(&self, channel_id: &str, index: u64) -> RelayResult<bool> {
        let key = self.keys.buffer_chunk(channel_id, index);
        Ok(self.data.lock().get(&key).is_some())
    }

    async fn chunk_ttl(&self, channel_id: &str, index: u64) -> RelayResult<Option<Duration>> {
        let key = self.keys.buffer_chunk(channel_id, index);
        let mut space = self.data.lock();
        Ok(space
            .get(&key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn buffer_head(&self, channel_id: &str) -> RelayResult<u64> {
        let key = self.keys.buffer_index(channel_id);
        match self.data.lock().get(&key).map(|e| &e.value) {
            Some(Value::Int(n)) => Ok(u64::try_from(*n).unwrap_or_default()),
            _ => Ok(0),
        }
    }

    async fn clear_buffer(&self, channel_id: &str) -> RelayResult<()> {
        let chunk_prefix = self
            .keys
            .buffer_chunk_pattern(channel_id)
            .trim_end_matches('*')
            .to_string();
        let mut space = self.data.lock();
        space.remove(&self.keys.buffer_index(channel_id));
        space.entries.retain(|k, _| !k.starts_with(&chunk_prefix));
        Ok(())
    }

    async fn try_acquire_owner(
        &self,
        channel_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let key = self.keys.channel_owner(channel_id);
        let mut space = self.data.lock();
        if space.get(&key).is_some() {
            return Ok(false);
        }
        space.set(&key, Value::Text(worker_id.to_string()), Some(ttl));
        Ok(true)
    }

    async fn renew_owner(
        &self,
        channel_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let key = self.keys.channel_owner(channel_id);
        let mut space = self.data.lock();
        if space.text(&key).as_deref() != Some(worker_id) {
            return Ok(false);
        }
        space.expire(&key, ttl);
        Ok(true)
    }

    async fn release_owner(&self, channel_id: &str, worker_id: &str) -> RelayResult<bool> {
        let key = self.keys.channel_owner(channel_id);
        let mut space = self.data.lock();
        if space.text(&key).as_deref() != Some(worker_id) {
            return Ok(false);
        }
        Ok(space.remove(&key))
    }

    async fn owner(&self, channel_id: &str) -> RelayResult<Option<String>> {
        let key = self.keys.channel_owner(channel_id);
        Ok(self.data.lock().text(&key))
    }

    async fn write_channel(&self, channel_id: &str, metadata: &ChannelMetadata) -> RelayResult<()> {
        let key = self.keys.channel_metadata(channel_id);
        let hash = metadata.to_fields().into_iter().collect();
        self.data.lock().set(&key, Value::Hash(hash), None);
        Ok(())
    }

    async fn update_channel(&self, channel_id: &str, fields: Fields) -> RelayResult<bool> {
        let key = self.keys.channel_metadata(channel_id);
        let mut space = self.data.lock();
        match space.hash_mut(&key) {
            Some(hash) => {
                hash.extend(fields);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn read_channel(&self, channel_id: &str) -> RelayResult<Option<ChannelMetadata>> {
        let key = self.keys.channel_metadata(channel_id);
        let mut space = self.data.lock();
        Ok(space
            .hash_mut(&key)
            .and_then(|hash| ChannelMetadata::from_fields(hash)))
    }

    async fn add_channel_bytes(&self, channel_id: &str, bytes: u64) -> RelayResult<()> {
        let key = self.keys.channel_metadata(channel_id);
        let mut space = self.data.lock();
        if let Some(hash) = space.hash_mut(&key) {
            let total = hash
                .get(field::TOTAL_BYTES)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default();
            hash.insert(field::TOTAL_BYTES.to_string(), (total + bytes).to_string());
        }
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> RelayResult<()> {
        let set_key = self.keys.client_set(channel_id);
        let mut space = self.data.lock();
        let members: Vec<String> = space
            .set_members(&set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for client_id in members {
            space.remove(&self.keys.client_record(channel_id, &client_id));
        }
        space.remove(&set_key);
        space.remove(&self.keys.channel_metadata(channel_id));
        space.remove(&self.keys.switch_request(channel_id));
        space.remove(&self.keys.last_client_disconnect(channel_id));
        Ok(())
    }

    async fn list_channels(&self) -> RelayResult<Vec<String>> {
        let space = self.data.lock();
        let mut channels: Vec<String> = space
            .live_keys()
            .iter()
            .filter_map(|k| self.keys.parse_channel_metadata(k).map(str::to_string))
            .collect();
        channels.sort();
        Ok(channels)
    }

    async fn register_client(
        &self,
        channel_id: &str,
        record: &ClientRecord,
        ttl: Duration,
    ) -> RelayResult<()> {
        let set_key = self.keys.client_set(channel_id);
        let mut space = self.data.lock();
        match space.set_members(&set_key) {
            Some(members) => {
                members.insert(record.client_id.clone());
            }
            None => {
                let members = HashSet::from([record.client_id.clone()]);
                space.set(&set_key, Value::Set(members), None);
            }
        }
        space.set(
            &self.keys.client_record(channel_id, &record.client_id),
            Value::Hash(record.to_fields().into_iter().collect()),
            Some(ttl),
        );
        Ok(())
    }

    async fn touch_client(
        &self,
        channel_id: &str,
        client_id: &str,
        fields: Fields,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let set_key = self.keys.client_set(channel_id);
        let record_key = self.keys.client_record(channel_id, client_id);
        let mut space = self.data.lock();

        let member = space
            .set_members(&set_key)
            .is_some_and(|s| s.contains(client_id));
        if !member {
            return Ok(false);
        }
        match space.hash_mut(&record_key) {
            Some(hash) => hash.extend(fields),
            None => space.set(&record_key, Value::Hash(fields.into_iter().collect()), None),
        }
        space.expire(&record_key, ttl);
        Ok(true)
    }

    async fn read_client(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> RelayResult<Option<ClientRecord>> {
        let key = self.keys.client_record(channel_id, client_id);
        let mut space = self.data.lock();
        Ok(space
            .hash_mut(&key)
            .and_then(|hash| ClientRecord::from_fields(client_id, hash)))
    }

    async fn unregister_client(&self, channel_id: &str, client_id: &str) -> RelayResult<bool> {
        let set_key = self.keys.client_set(channel_id);
        let mut space = self.data.lock();
        space.remove(&self.keys.client_record(channel_id, client_id));

        let Some(members) = space.set_members(&set_key) else {
            return Ok(false);
        };
        let removed = members.remove(client_id);
        if members.is_empty() {
            space.remove(&set_key);
        }
        Ok(removed)
    }

    async fn client_ids(&self, channel_id: &str) -> RelayResult<Vec<String>> {
        let set_key = self.keys.client_set(channel_id);
        let mut ids: Vec<String> = self
            .data
            .lock()
            .set_members(&set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn client_count(&self, channel_id: &str) -> RelayResult<usize> {
        let set_key = self.keys.client_set(channel_id);
        Ok(self.data.lock().set_members(&set_key).map_or(0, |s| s.len()))
    }

    async fn set_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        self.data
            .lock()
            .set(key, Value::Text(value.to_string()), Some(ttl));
        Ok(())
    }

    async fn set_ephemeral_nx(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool> {
        let mut space = self.data.lock();
        if space.get(key).is_some() {
            return Ok(false);
        }
        space.set(key, Value::Text(value.to_string()), Some(ttl));
        Ok(true)
    }

    async fn get_ephemeral(&self, key: &str) -> RelayResult<Option<String>> {
        Ok(self.data.lock().text(key))
    }

    async fn delete_key(&self, key: &str) -> RelayResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn publish(&self, channel_id: &str, payload: &str) -> RelayResult<usize> {
        // No receivers is not an error, same as PUBLISH returning 0
        Ok(self
            .events
            .send((channel_id.to_string(), payload.to_string()))
            .unwrap_or(0))
    }

    async fn subscribe(&self) -> RelayResult<EventStream> {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}
