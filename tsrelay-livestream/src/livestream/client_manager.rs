//! Per-channel registry of the clients attached to this worker.
//!
//! Membership is mirrored into the shared client set so every worker can count
//! viewers, but only the worker holding a client refreshes its record. A
//! client that stops making progress stops being refreshed, and the ghost
//! sweep removes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsrelay_core::config::ProxyConfig;

use crate::error::RelayResult;
use crate::model::{field, ClientRecord, Fields};
use crate::store::RelayStore;
use crate::util::now_secs;

/// Weight of the newest sample in the smoothed rate.
const RATE_SMOOTHING: f64 = 0.3;

#[derive(Debug)]
struct ClientStats {
    bytes_sent: u64,
    chunks_sent: u64,
    last_active: Instant,
    last_active_wall: f64,
    window_bytes: u64,
    window_started: Instant,
    current_rate_kbps: f64,
    avg_rate_kbps: f64,
}

/// A client attached to this worker.
#[derive(Debug)]
pub struct LocalClient {
    pub client_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub connected_at: f64,
    cancel: CancellationToken,
    stats: Mutex<ClientStats>,
}

impl LocalClient {
    fn new(client_id: &str, ip_address: &str, user_agent: &str, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        let wall = now_secs();
        Self {
            client_id: client_id.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            connected_at: wall,
            cancel,
            stats: Mutex::new(ClientStats {
                bytes_sent: 0,
                chunks_sent: 0,
                last_active: now,
                last_active_wall: wall,
                window_bytes: 0,
                window_started: now,
                current_rate_kbps: 0.0,
                avg_rate_kbps: 0.0,
            }),
        }
    }

    /// Cancelled when the client is stopped, evicted, or its channel stops.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record bytes handed to the transport.
    pub fn record_sent(&self, bytes: usize, chunks: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_sent += bytes as u64;
        stats.window_bytes += bytes as u64;
        stats.chunks_sent += chunks;
        stats.last_active = Instant::now();
        stats.last_active_wall = now_secs();
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.stats.lock().bytes_sent
    }

    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.stats.lock().chunks_sent
    }

    fn idle_for(&self) -> std::time::Duration {
        self.stats.lock().last_active.elapsed()
    }

    /// Close the current rate window and return the fields to publish.
    pub(crate) fn roll_stats(&self) -> Fields {
        let mut stats = self.stats.lock();
        let elapsed = stats.window_started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            stats.current_rate_kbps = stats.window_bytes as f64 / 1024.0 / elapsed;
            stats.avg_rate_kbps = if stats.avg_rate_kbps == 0.0 {
                stats.current_rate_kbps
            } else {
                RATE_SMOOTHING * stats.current_rate_kbps + (1.0 - RATE_SMOOTHING) * stats.avg_rate_kbps
            };
        }
        stats.window_bytes = 0;
        stats.window_started = Instant::now();

        vec![
            (field::LAST_ACTIVE.to_string(), stats.last_active_wall.to_string()),
            (field::BYTES_SENT.to_string(), stats.bytes_sent.to_string()),
            (field::CHUNKS_SENT.to_string(), stats.chunks_sent.to_string()),
            (field::AVG_RATE.to_string(), format!("{:.2}", stats.avg_rate_kbps)),
            (field::CURRENT_RATE.to_string(), format!("{:.2}", stats.current_rate_kbps)),
            (field::STATS_UPDATED_AT.to_string(), now_secs().to_string()),
        ]
    }
}

/// What admitting a client hands to its delivery loop.
pub struct ClientSession {
    pub client: Arc<LocalClient>,
    /// Last index considered delivered; delivery starts at `cursor + 1`.
    pub cursor: u64,
}

/// Result of removing a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// This call removed the client from the shared set.
    pub removed: bool,
    /// Clients still attached locally.
    pub remaining_local: usize,
}

pub struct ClientManager {
    channel_id: String,
    worker_id: String,
    store: Arc<dyn RelayStore>,
    config: ProxyConfig,
    clients: Mutex<HashMap<String, Arc<LocalClient>>>,
    cancel: CancellationToken,
}

impl ClientManager {
    pub fn new(
        channel_id: &str,
        worker_id: &str,
        store: Arc<dyn RelayStore>,
        config: ProxyConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            worker_id: worker_id.to_string(),
            store,
            config,
            clients: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Admit a client, starting it a fixed distance behind the buffer head.
    pub async fn add_client(
        &self,
        client_id: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> RelayResult<ClientSession> {
        let head = self.store.buffer_head(&self.channel_id).await?;
        let cursor = head.saturating_sub(self.config.initial_behind());

        let client = Arc::new(LocalClient::new(
            client_id,
            ip_address,
            user_agent,
            self.cancel.child_token(),
        ));
        let record = ClientRecord::new(client_id, ip_address, user_agent, &self.worker_id, client.connected_at);
        self.store
            .register_client(&self.channel_id, &record, self.config.ghost_threshold())
            .await?;
        let local = {
            let mut clients = self.clients.lock();
            clients.insert(client_id.to_string(), client.clone());
            clients.len()
        };

        info!(
            channel_id = %self.channel_id,
            client_id,
            ip = ip_address,
            head,
            cursor,
            local_clients = local,
            "Client connected"
        );
        Ok(ClientSession { client, cursor })
    }

    /// Deregister a client. Safe to call more than once; only one call
    /// observes `removed == true`.
    pub async fn remove_client(&self, client_id: &str) -> RelayResult<Removal> {
        let (local, remaining_local) = {
            let mut clients = self.clients.lock();
            let local = clients.remove(client_id);
            (local, clients.len())
        };
        if let Some(client) = &local {
            client.cancel.cancel();
        }

        let removed = self.store.unregister_client(&self.channel_id, client_id).await?;
        if removed {
            let bytes = local.as_ref().map_or(0, |c| c.bytes_sent());
            info!(
                channel_id = %self.channel_id,
                client_id,
                bytes_sent = bytes,
                remaining_local,
                "Client disconnected"
            );
        }
        Ok(Removal {
            removed,
            remaining_local,
        })
    }

    /// Cancel a local client's delivery loop. Returns false if it is not here.
    pub fn stop_client(&self, client_id: &str) -> bool {
        match self.clients.lock().get(client_id) {
            Some(client) => {
                client.cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<LocalClient>> {
        self.clients.lock().get(client_id).cloned()
    }

    #[must_use]
    pub fn local_count(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refresh the shared record of every live local client with fresh stats.
    ///
    /// Clients idle past the ghost threshold are skipped so their records can
    /// lapse; clients whose membership vanished are cancelled.
    pub async fn refresh_heartbeats(&self) -> RelayResult<()> {
        let ghost = self.config.ghost_threshold();
        let clients: Vec<Arc<LocalClient>> = self.clients.lock().values().cloned().collect();

        for client in clients {
            if client.idle_for() > ghost {
                continue;
            }
            let alive = self
                .store
                .touch_client(&self.channel_id, &client.client_id, client.roll_stats(), ghost)
                .await?;
            if !alive {
                warn!(
                    channel_id = %self.channel_id,
                    client_id = %client.client_id,
                    "Client record vanished, disconnecting"
                );
                client.cancel.cancel();
            }
        }
        Ok(())
    }

    /// Local clients that have made no progress within the ghost threshold.
    #[must_use]
    pub fn find_ghosts(&self) -> Vec<String> {
        let ghost = self.config.ghost_threshold();
        let mut ghosts: Vec<String> = self
            .clients
            .lock()
            .values()
            .filter(|c| c.idle_for() > ghost)
            .map(|c| c.client_id.clone())
            .collect();
        ghosts.sort();
        ghosts
    }

    /// Remove shared memberships whose record expired, i.e. clients of a worker
    /// that stopped heartbeating. Returns the ids this call removed.
    pub async fn sweep_orphans(&self) -> RelayResult<Vec<String>> {
        let mut removed = Vec::new();
        for client_id in self.store.client_ids(&self.channel_id).await? {
            if self.clients.lock().contains_key(&client_id) {
                continue;
            }
            if self.store.read_client(&self.channel_id, &client_id).await?.is_some() {
                continue;
            }
            if self.store.unregister_client(&self.channel_id, &client_id).await? {
                debug!(channel_id = %self.channel_id, client_id = %client_id, "Removed orphaned client");
                removed.push(client_id);
            }
        }
        Ok(removed)
    }

    /// Cancel every local client (channel stop).
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }
}
