//! Channel coordinator
//!
//! One per worker. Decides which worker owns each channel's upstream, attaches
//! clients to channels, and carries control requests (switch, stop, client
//! stop) to whichever worker can act on them.
//!
//! Ownership is an expiring lock in the shared store. The owner renews it
//! every third of its TTL; if the owner dies, a worker that still has clients
//! for the channel takes over from the shared metadata. Teardown is guarded
//! by a `stopping` flag set with NX, so exactly one caller releases the
//! catalog allocation no matter how many workers race to stop a channel.
//! While that flag is set no worker may start the channel, and the winner
//! only clears it once the channel's shared state is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::buffer::SharedBuffer;
use crate::catalog::{DeliveryProfile, StreamSource};
use crate::error::{RelayError, RelayResult};
use crate::events::{self, ChannelEvent, EventHandler};
use crate::livestream::client_manager::ClientManager;
use crate::livestream::generator::{ClientSender, ClientStream, DeliveryExit};
use crate::livestream::stream_manager::{StreamCommand, StreamManager, StreamOutcome};
use crate::livestream::ChannelContext;
use crate::model::{field, ChannelMetadata, ChannelState, ManagerState};
use crate::util::now_secs;

/// Queue depth for commands to a running stream manager.
const COMMAND_QUEUE: usize = 8;

/// How this worker relates to a channel after `start_channel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRole {
    /// This worker runs the upstream.
    Owner,
    /// Another worker runs the upstream; this one only serves clients.
    Relay,
    /// The channel's profile redirects clients to the upstream URL.
    Redirect(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchOutcome {
    /// The switch was applied by this worker's own upstream.
    pub owner: bool,
}

/// This worker's view of a channel, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalHealth {
    pub owner: bool,
    pub upstream_state: Option<ManagerState>,
    pub local_clients: usize,
    pub client_ids: Vec<String>,
}

struct Upstream {
    commands: mpsc::Sender<StreamCommand>,
    state: watch::Receiver<ManagerState>,
    cancel: CancellationToken,
}

/// A channel this worker participates in.
struct ChannelHandle {
    channel_id: String,
    clients: ClientManager,
    cancel: CancellationToken,
    upstream: Mutex<Option<Upstream>>,
    shutdown_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    fn is_owner(&self) -> bool {
        self.upstream.lock().is_some()
    }

    fn abort_shutdown_timer(&self) {
        if let Some(timer) = self.shutdown_timer.lock().take() {
            timer.abort();
        }
    }

    fn stop_upstream(&self) -> bool {
        match self.upstream.lock().take() {
            Some(upstream) => {
                upstream.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct ChannelCoordinator {
    ctx: ChannelContext,
    channels: DashMap<String, Arc<ChannelHandle>>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shutdown: CancellationToken,
}

impl ChannelCoordinator {
    #[must_use]
    pub fn new(ctx: ChannelContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            channels: DashMap::new(),
            creation_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    #[must_use]
    pub fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    /// Cancelled when the worker shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn handle(&self, channel_id: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.get(channel_id).map(|h| h.value().clone())
    }

    fn ensure_handle(&self, channel_id: &str) -> Arc<ChannelHandle> {
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                let cancel = self.shutdown.child_token();
                Arc::new(ChannelHandle {
                    channel_id: channel_id.to_string(),
                    clients: ClientManager::new(
                        channel_id,
                        &self.ctx.worker_id,
                        self.ctx.store.clone(),
                        self.ctx.config.clone(),
                        cancel.clone(),
                    ),
                    cancel,
                    upstream: Mutex::new(None),
                    shutdown_timer: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Serializes starting and stopping a channel on this worker.
    fn creation_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }

    fn is_current(&self, handle: &Arc<ChannelHandle>) -> bool {
        self.handle(&handle.channel_id)
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    // ==================== Ownership ====================

    /// Make sure the channel is running somewhere, taking ownership if nobody
    /// holds it.
    pub async fn start_channel(self: &Arc<Self>, channel_id: &str) -> RelayResult<ChannelRole> {
        let lock = self.creation_lock(channel_id);
        let _guard = lock.lock().await;

        if self.handle(channel_id).is_some_and(|h| h.is_owner()) {
            return Ok(ChannelRole::Owner);
        }

        let store = &self.ctx.store;
        let acquired = store
            .try_acquire_owner(channel_id, &self.ctx.worker_id, self.ctx.config.owner_lock_ttl())
            .await?;
        if !acquired {
            let owner = store.owner(channel_id).await?;
            debug!(channel_id, owner = ?owner, "Channel owned elsewhere, relaying");
            self.ensure_handle(channel_id);
            return Ok(ChannelRole::Relay);
        }

        if store.get_ephemeral(&store.keys().stopping(channel_id)).await?.is_some() {
            self.release_lock(channel_id).await;
            debug!(channel_id, "Channel is stopping, refusing to start it");
            return Err(RelayError::ChannelStopping(channel_id.to_string()));
        }

        // A live channel whose owner vanished keeps its current source
        let existing = store
            .read_channel(channel_id)
            .await?
            .filter(|meta| !meta.state.is_terminal());
        let source = match existing.as_ref().and_then(|meta| self.source_from_metadata(meta)) {
            Some(source) => source,
            None => match self.ctx.catalog.resolve(channel_id).await {
                Ok(source) => source,
                Err(e) => {
                    self.release_lock(channel_id).await;
                    return Err(e);
                }
            },
        };

        if let DeliveryProfile::Redirect = source.profile {
            self.release_lock(channel_id).await;
            if let Err(e) = self.ctx.catalog.release(channel_id).await {
                warn!(channel_id, error = %e, "Failed to release redirect allocation");
            }
            return Ok(ChannelRole::Redirect(source.url));
        }

        if let Some(meta) = &existing {
            info!(channel_id, previous_owner = %meta.owner, "Taking over orphaned channel");
            store
                .update_channel(channel_id, vec![(field::OWNER.to_string(), self.ctx.worker_id.clone())])
                .await?;
        } else {
            let meta = ChannelMetadata::initializing(
                &self.ctx.worker_id,
                &source.url,
                &source.user_agent,
                source.stream_id,
                source.profile.name(),
                now_secs(),
            );
            store.write_channel(channel_id, &meta).await?;
        }

        let handle = self.ensure_handle(channel_id);
        self.spawn_upstream(&handle, source);
        info!(channel_id, worker_id = %self.ctx.worker_id, "Acquired channel ownership");
        Ok(ChannelRole::Owner)
    }

    fn source_from_metadata(&self, meta: &ChannelMetadata) -> Option<StreamSource> {
        if meta.url.is_empty() {
            return None;
        }
        let profile = self.ctx.catalog.profile_by_name(&meta.stream_profile)?;
        Some(StreamSource {
            stream_id: meta.stream_id,
            url: meta.url.clone(),
            user_agent: meta.user_agent.clone(),
            profile,
        })
    }

    fn spawn_upstream(self: &Arc<Self>, handle: &Arc<ChannelHandle>, source: StreamSource) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state) = watch::channel(ManagerState::Connecting);
        let cancel = self.shutdown.child_token();
        let manager = StreamManager::new(
            &self.ctx,
            &handle.channel_id,
            source,
            rx,
            state_tx,
            cancel.clone(),
        );
        *handle.upstream.lock() = Some(Upstream {
            commands,
            state,
            cancel,
        });

        let this = Arc::clone(self);
        let channel_id = handle.channel_id.clone();
        let span = info_span!("upstream", channel_id = %channel_id);
        tokio::spawn(
            async move {
                if manager.run().await == StreamOutcome::Exhausted {
                    this.on_exhausted(&channel_id).await;
                }
            }
            .instrument(span),
        );
    }

    /// Leave the channel in its error state for the grace period so clients
    /// and status readers can see why, then tear it down.
    async fn on_exhausted(&self, channel_id: &str) {
        tokio::select! {
            () = self.shutdown.cancelled() => return,
            () = tokio::time::sleep(self.ctx.config.failover_grace_period()) => {}
        }
        if let Err(e) = self.teardown(channel_id, "upstream exhausted").await {
            error!(channel_id, error = %e, "Failed to tear down exhausted channel");
        }
    }

    async fn release_lock(&self, channel_id: &str) {
        if let Err(e) = self.ctx.store.release_owner(channel_id, &self.ctx.worker_id).await {
            warn!(channel_id, error = %e, "Failed to release ownership");
        }
    }

    pub async fn am_i_owner(&self, channel_id: &str) -> RelayResult<bool> {
        Ok(self.ctx.store.owner(channel_id).await?.as_deref() == Some(self.ctx.worker_id.as_str()))
    }

    pub async fn channel_exists(&self, channel_id: &str) -> RelayResult<bool> {
        Ok(self.ctx.store.read_channel(channel_id).await?.is_some())
    }

    /// Wait until the channel's upstream is delivering, or `limit` elapses.
    pub async fn wait_for_connection(&self, channel_id: &str, limit: Duration) -> RelayResult<bool> {
        let local = self
            .handle(channel_id)
            .and_then(|h| h.upstream.lock().as_ref().map(|u| u.state.clone()));

        if let Some(mut state) = local {
            return Ok(matches!(
                tokio::time::timeout(limit, state.wait_for(|s| s.is_connected())).await,
                Ok(Ok(_))
            ));
        }

        let poll = self.ctx.config.client_poll_interval();
        let waited = tokio::time::timeout(limit, async {
            loop {
                match self.ctx.store.read_channel(channel_id).await? {
                    Some(meta) if meta.state.is_ready() => return Ok(true),
                    Some(meta) if meta.state.is_terminal() => return Ok(false),
                    _ => tokio::time::sleep(poll).await,
                }
            }
        })
        .await;
        waited.unwrap_or(Ok(false))
    }

    // ==================== Clients ====================

    /// Attach a client and start its delivery loop. Data arrives on the
    /// returned receiver until the client is stopped or disconnects.
    pub async fn attach_client(
        self: &Arc<Self>,
        channel_id: &str,
        client_id: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> RelayResult<mpsc::Receiver<Result<bytes::Bytes, std::io::Error>>> {
        let handle = self.ensure_handle(channel_id);
        handle.abort_shutdown_timer();

        let session = handle.clients.add_client(client_id, ip_address, user_agent).await?;
        self.announce(&ChannelEvent::ClientConnected {
            channel_id: channel_id.to_string(),
            client_id: client_id.to_string(),
            worker_id: self.ctx.worker_id.clone(),
            timestamp: now_secs(),
        })
        .await;
        self.mark_active(channel_id).await;

        let (tx, rx): (ClientSender, _) = mpsc::channel(self.ctx.config.client_send_queue.max(1));
        let stream = ClientStream::new(
            self.ctx.store.clone(),
            channel_id,
            session.client,
            session.cursor,
            self.ctx.config.clone(),
            tx,
        );
        let this = Arc::clone(self);
        let span = info_span!("client", channel_id, client_id);
        let client_id = client_id.to_string();
        tokio::spawn(
            async move {
                let exit = stream.run().await;
                this.client_left(&handle, &client_id, exit).await;
            }
            .instrument(span),
        );
        Ok(rx)
    }

    async fn mark_active(&self, channel_id: &str) {
        if let Ok(Some(meta)) = self.ctx.store.read_channel(channel_id).await {
            if meta.state == ChannelState::WaitingForClients {
                self.set_state(channel_id, ChannelState::Active).await;
            }
        }
    }

    async fn set_state(&self, channel_id: &str, state: ChannelState) {
        let fields = vec![
            (field::STATE.to_string(), state.as_str().to_string()),
            (field::STATE_CHANGED_AT.to_string(), now_secs().to_string()),
        ];
        if let Err(e) = self.ctx.store.update_channel(channel_id, fields).await {
            warn!(channel_id, error = %e, "Failed to update channel state");
        }
    }

    async fn client_left(self: &Arc<Self>, handle: &Arc<ChannelHandle>, client_id: &str, exit: DeliveryExit) {
        let channel_id = handle.channel_id.as_str();
        let removal = match handle.clients.remove_client(client_id).await {
            Ok(removal) => removal,
            Err(e) => {
                warn!(channel_id, client_id, error = %e, "Failed to deregister client");
                return;
            }
        };
        if removal.removed {
            debug!(channel_id, client_id, reason = ?exit, "Client removed");
            let store = &self.ctx.store;
            let key = store.keys().last_client_disconnect(channel_id);
            if let Err(e) = store
                .set_ephemeral(&key, &now_secs().to_string(), self.ctx.config.buffer_index_ttl())
                .await
            {
                debug!(channel_id, error = %e, "Failed to record disconnect time");
            }
            if let Err(e) = store.delete_key(&store.keys().client_stop(channel_id, client_id)).await {
                warn!(channel_id, client_id, error = %e, "Failed to clear client stop request");
            }
            self.announce(&ChannelEvent::ClientDisconnected {
                channel_id: channel_id.to_string(),
                client_id: client_id.to_string(),
                worker_id: self.ctx.worker_id.clone(),
                timestamp: now_secs(),
            })
            .await;
        }

        if removal.remaining_local == 0 && self.is_current(handle) {
            self.schedule_shutdown(handle);
        }
    }

    /// After the shutdown delay, drop the channel if it is still idle.
    fn schedule_shutdown(self: &Arc<Self>, handle: &Arc<ChannelHandle>) {
        let this = Arc::clone(self);
        let target = Arc::clone(handle);
        let delay = self.ctx.config.channel_shutdown_delay();
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = target.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            this.shutdown_if_idle(&target).await;
        });
        if let Some(previous) = handle.shutdown_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    async fn shutdown_if_idle(&self, handle: &Arc<ChannelHandle>) {
        if !handle.clients.is_empty() || !self.is_current(handle) {
            return;
        }
        let channel_id = handle.channel_id.as_str();
        let remaining = match self.ctx.store.client_count(channel_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(channel_id, error = %e, "Failed to count clients, keeping channel");
                return;
            }
        };

        if remaining == 0 {
            info!(channel_id, "No clients left, stopping channel");
            if let Err(e) = self.teardown(channel_id, "no clients").await {
                error!(channel_id, error = %e, "Failed to stop idle channel");
            }
        } else if handle.is_owner() {
            debug!(channel_id, remaining, "Clients remain on other workers");
        } else {
            debug!(channel_id, remaining, "No local clients, dropping relay");
            self.channels.remove_if(channel_id, |_, h| Arc::ptr_eq(h, handle));
        }
    }

    // ==================== Control requests ====================

    /// Point the channel at a new upstream URL without disconnecting clients.
    pub async fn request_stream_switch(
        &self,
        channel_id: &str,
        url: &str,
        user_agent: Option<&str>,
        stream_id: Option<i64>,
    ) -> RelayResult<SwitchOutcome> {
        if url.trim().is_empty() {
            return Err(RelayError::InvalidRequest("url must not be empty".to_string()));
        }
        let store = &self.ctx.store;
        if store.read_channel(channel_id).await?.is_none() {
            return Err(RelayError::ChannelNotFound(channel_id.to_string()));
        }

        let request = serde_json::json!({
            "url": url,
            "user_agent": user_agent,
            "stream_id": stream_id,
            "requester": self.ctx.worker_id,
            "timestamp": now_secs(),
        });
        store
            .set_ephemeral(
                &store.keys().switch_request(channel_id),
                &request.to_string(),
                self.ctx.config.control_request_ttl(),
            )
            .await?;

        let command = StreamCommand::UpdateUrl {
            url: url.to_string(),
            user_agent: user_agent.map(str::to_string),
            stream_id,
            reason: "url change requested".to_string(),
        };
        if self.queue_switch(channel_id, command).await {
            return Ok(SwitchOutcome { owner: true });
        }

        let mut fields = vec![(field::URL.to_string(), url.to_string())];
        if let Some(ua) = user_agent {
            fields.push((field::USER_AGENT.to_string(), ua.to_string()));
        }
        store.update_channel(channel_id, fields).await?;
        events::publish(
            store.as_ref(),
            &ChannelEvent::StreamSwitch {
                channel_id: channel_id.to_string(),
                url: url.to_string(),
                user_agent: user_agent.map(str::to_string),
                requester: self.ctx.worker_id.clone(),
                timestamp: now_secs(),
            },
        )
        .await?;
        info!(channel_id, url, "Forwarded stream switch to owner");
        Ok(SwitchOutcome { owner: false })
    }

    /// Hand a switch to the local upstream if this worker runs it.
    async fn queue_switch(&self, channel_id: &str, command: StreamCommand) -> bool {
        let Some(commands) = self
            .handle(channel_id)
            .and_then(|h| h.upstream.lock().as_ref().map(|u| u.commands.clone()))
        else {
            return false;
        };
        if commands.send(command).await.is_err() {
            return false;
        }
        let store = &self.ctx.store;
        if let Err(e) = store.delete_key(&store.keys().switch_request(channel_id)).await {
            debug!(channel_id, error = %e, "Failed to clear switch request");
        }
        true
    }

    /// Stop a channel on every worker. Returns the state it was in.
    pub async fn request_channel_stop(&self, channel_id: &str) -> RelayResult<ChannelState> {
        let meta = self
            .ctx
            .store
            .read_channel(channel_id)
            .await?
            .ok_or_else(|| RelayError::ChannelNotFound(channel_id.to_string()))?;
        self.teardown(channel_id, "stop requested").await?;
        Ok(meta.state)
    }

    /// Disconnect one client wherever it is attached. Returns true if this
    /// worker held it.
    pub async fn request_client_stop(&self, channel_id: &str, client_id: &str) -> RelayResult<bool> {
        let store = &self.ctx.store;
        let handle = self.handle(channel_id);
        let local = handle.as_ref().is_some_and(|h| h.clients.get(client_id).is_some());
        if !local && !store.client_ids(channel_id).await?.iter().any(|id| id == client_id) {
            return Err(RelayError::ClientNotFound(client_id.to_string()));
        }

        store
            .set_ephemeral(
                &store.keys().client_stop(channel_id, client_id),
                &self.ctx.worker_id,
                self.ctx.config.control_request_ttl(),
            )
            .await?;

        if let Some(handle) = handle.filter(|_| local) {
            handle.clients.stop_client(client_id);
            info!(channel_id, client_id, "Stopped local client");
            return Ok(true);
        }
        events::publish(
            store.as_ref(),
            &ChannelEvent::ClientStop {
                channel_id: channel_id.to_string(),
                client_id: client_id.to_string(),
                requester: self.ctx.worker_id.clone(),
                timestamp: now_secs(),
            },
        )
        .await?;
        Ok(false)
    }

    // ==================== Teardown ====================

    /// Stop the channel everywhere and remove its shared state. Only the
    /// caller that wins the `stopping` flag deletes state and releases the
    /// catalog allocation; everyone else just stops locally.
    async fn teardown(&self, channel_id: &str, reason: &str) -> RelayResult<()> {
        let lock = self.creation_lock(channel_id);
        let _guard = lock.lock().await;

        let store = &self.ctx.store;
        let stopping = store.keys().stopping(channel_id);
        let won = store
            .set_ephemeral_nx(&stopping, &self.ctx.worker_id, self.ctx.config.control_request_ttl())
            .await?;

        if !won {
            debug!(channel_id, "Channel already stopping");
            self.stop_local(channel_id).await;
            return Ok(());
        }

        if store.read_channel(channel_id).await?.is_none() {
            debug!(channel_id, "Channel already stopped");
            self.stop_local(channel_id).await;
            store.delete_key(&stopping).await?;
            return Ok(());
        }

        info!(channel_id, reason, "Stopping channel");
        self.set_state(channel_id, ChannelState::Stopping).await;
        self.announce(&ChannelEvent::ChannelStop {
            channel_id: channel_id.to_string(),
            requester: self.ctx.worker_id.clone(),
            timestamp: now_secs(),
        })
        .await;

        let owned = self.detach_local(channel_id);

        store.delete_channel(channel_id).await?;
        SharedBuffer::new(store.clone(), channel_id, &self.ctx.config)
            .clear()
            .await?;
        if let Err(e) = self.ctx.catalog.release(channel_id).await {
            warn!(channel_id, error = %e, "Failed to release catalog allocation");
        }

        // Lock and flag go last: until then a new start must not see leftovers
        if owned {
            self.release_lock(channel_id).await;
        }
        store.delete_key(&stopping).await?;

        self.announce(&ChannelEvent::ChannelStopped {
            channel_id: channel_id.to_string(),
            worker_id: self.ctx.worker_id.clone(),
            timestamp: now_secs(),
        })
        .await;
        info!(channel_id, "Channel stopped");
        Ok(())
    }

    /// Drop this worker's part in a channel and release its lock if held.
    /// Idempotent.
    async fn stop_local(&self, channel_id: &str) {
        if self.detach_local(channel_id) {
            self.release_lock(channel_id).await;
        }
    }

    /// Stop the local upstream and clients. Returns true if this worker owned
    /// the channel; the ownership lock is left for the caller.
    fn detach_local(&self, channel_id: &str) -> bool {
        let Some((_, handle)) = self.channels.remove(channel_id) else {
            return false;
        };
        handle.abort_shutdown_timer();
        let owned = handle.stop_upstream();
        handle.clients.cancel_all();
        debug!(channel_id, owned, "Stopped local channel");
        owned
    }

    async fn announce(&self, event: &ChannelEvent) {
        if let Err(e) = events::publish(self.ctx.store.as_ref(), event).await {
            warn!(channel_id = event.channel_id(), event = event.name(), error = %e, "Failed to publish event");
        }
    }

    // ==================== Maintenance ====================

    /// Periodic duties: client heartbeats and ghost sweeps, lock renewal,
    /// orphan takeover, pending switches, and idle cleanup.
    pub async fn run_maintenance(self: Arc<Self>) {
        let config = &self.ctx.config;
        let mut heartbeat = interval(config.client_heartbeat_interval());
        let mut renew = interval(config.owner_renew_interval());
        let mut cleanup = interval(config.cleanup_interval());
        let cancel = self.shutdown.clone();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Channel maintenance stopped");
                    return;
                }
                _ = heartbeat.tick() => self.heartbeat_clients().await,
                _ = renew.tick() => self.renew_ownership().await,
                _ = cleanup.tick() => self.cleanup().await,
            }
        }
    }

    fn handles(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels.iter().map(|h| h.value().clone()).collect()
    }

    pub(crate) async fn heartbeat_clients(&self) {
        for handle in self.handles() {
            let channel_id = handle.channel_id.as_str();
            for ghost in handle.clients.find_ghosts() {
                warn!(channel_id, client_id = %ghost, "Evicting ghost client");
                handle.clients.stop_client(&ghost);
            }
            if let Err(e) = handle.clients.refresh_heartbeats().await {
                warn!(channel_id, error = %e, "Failed to refresh client heartbeats");
            }
            match handle.clients.sweep_orphans().await {
                Ok(removed) if !removed.is_empty() => {
                    info!(channel_id, count = removed.len(), "Removed clients of departed workers");
                }
                Ok(_) => {}
                Err(e) => warn!(channel_id, error = %e, "Failed to sweep orphaned clients"),
            }
        }
    }

    pub(crate) async fn renew_ownership(&self) {
        let store = &self.ctx.store;
        let ttl = self.ctx.config.owner_lock_ttl();
        for handle in self.handles().into_iter().filter(|h| h.is_owner()) {
            let channel_id = handle.channel_id.as_str();
            match store.renew_owner(channel_id, &self.ctx.worker_id, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    error!(channel_id, "Lost channel ownership, stopping upstream");
                    handle.stop_upstream();
                }
                Err(e) => warn!(channel_id, error = %e, "Failed to renew ownership"),
            }
        }

        let key = store.keys().worker_heartbeat(&self.ctx.worker_id);
        if let Err(e) = store
            .set_ephemeral(&key, &now_secs().to_string(), self.ctx.config.worker_heartbeat_ttl())
            .await
        {
            warn!(error = %e, "Failed to write worker heartbeat");
        }
    }

    pub(crate) async fn cleanup(self: &Arc<Self>) {
        for handle in self.handles() {
            let channel_id = handle.channel_id.clone();
            let result = if handle.is_owner() {
                self.cleanup_owned(&handle).await
            } else {
                self.cleanup_relayed(&handle).await
            };
            if let Err(e) = result {
                warn!(channel_id = %channel_id, error = %e, "Channel cleanup failed");
            }
        }
    }

    async fn cleanup_owned(&self, handle: &Arc<ChannelHandle>) -> RelayResult<()> {
        let channel_id = handle.channel_id.as_str();
        let store = &self.ctx.store;

        // Switch requests whose event never arrived
        if let Some(raw) = store.get_ephemeral(&store.keys().switch_request(channel_id)).await? {
            let request: serde_json::Value = serde_json::from_str(&raw)?;
            if let Some(url) = request["url"].as_str() {
                info!(channel_id, url, "Applying pending switch request");
                self.queue_switch(
                    channel_id,
                    StreamCommand::UpdateUrl {
                        url: url.to_string(),
                        user_agent: request["user_agent"].as_str().map(str::to_string),
                        stream_id: request["stream_id"].as_i64(),
                        reason: "url change requested".to_string(),
                    },
                )
                .await;
            }
        }

        if !handle.clients.is_empty() || handle.shutdown_timer.lock().is_some() {
            return Ok(());
        }
        if store.client_count(channel_id).await? > 0 {
            return Ok(());
        }
        let Some(meta) = store.read_channel(channel_id).await? else {
            return Ok(());
        };
        let idle_since = match store
            .get_ephemeral(&store.keys().last_client_disconnect(channel_id))
            .await?
        {
            Some(t) => t.parse::<f64>().unwrap_or(meta.init_time),
            None => meta.init_time,
        };
        let limit = (self.ctx.config.channel_shutdown_delay() + self.ctx.config.connection_timeout()).as_secs_f64();
        if meta.state.is_ready() && now_secs() - idle_since > limit {
            info!(channel_id, idle_secs = now_secs() - idle_since, "Channel idle without clients");
            self.teardown(channel_id, "idle").await?;
        }
        Ok(())
    }

    async fn cleanup_relayed(self: &Arc<Self>, handle: &Arc<ChannelHandle>) -> RelayResult<()> {
        let channel_id = handle.channel_id.as_str();
        if handle.clients.is_empty() {
            return Ok(());
        }
        if self.ctx.store.owner(channel_id).await?.is_some() {
            return Ok(());
        }
        if self.ctx.store.read_channel(channel_id).await?.is_none() {
            return Ok(());
        }
        warn!(channel_id, "Channel has no owner, attempting takeover");
        self.start_channel(channel_id).await?;
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Stop every local upstream and client and release held locks.
    pub async fn shutdown(&self) {
        info!(channels = self.channels.len(), "Shutting down channel coordinator");
        self.shutdown.cancel();
        for handle in self.handles() {
            let channel_id = handle.channel_id.as_str();
            for client_id in handle.clients.client_ids() {
                if let Err(e) = handle.clients.remove_client(&client_id).await {
                    warn!(channel_id, client_id = %client_id, error = %e, "Failed to deregister client");
                }
            }
            self.stop_local(channel_id).await;
        }
    }

    /// This worker's view of a channel, if it participates in it.
    #[must_use]
    pub fn local_health(&self, channel_id: &str) -> Option<LocalHealth> {
        let handle = self.handle(channel_id)?;
        let upstream_state = handle.upstream.lock().as_ref().map(|u| *u.state.borrow());
        Some(LocalHealth {
            owner: upstream_state.is_some(),
            upstream_state,
            local_clients: handle.clients.local_count(),
            client_ids: handle.clients.client_ids(),
        })
    }
}

#[async_trait]
impl EventHandler for ChannelCoordinator {
    async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::StreamSwitch {
                channel_id,
                url,
                user_agent,
                requester,
                ..
            } => {
                let command = StreamCommand::UpdateUrl {
                    url,
                    user_agent,
                    stream_id: None,
                    reason: format!("url change requested by {requester}"),
                };
                if self.queue_switch(&channel_id, command).await {
                    info!(channel_id = %channel_id, requester = %requester, "Applied remote stream switch");
                }
            }
            ChannelEvent::ChannelStop {
                channel_id,
                requester,
                ..
            } => {
                if requester != self.ctx.worker_id {
                    let lock = self.creation_lock(&channel_id);
                    let _guard = lock.lock().await;
                    self.stop_local(&channel_id).await;
                }
            }
            ChannelEvent::ClientStop {
                channel_id,
                client_id,
                ..
            } => {
                if let Some(handle) = self.handle(&channel_id) {
                    if handle.clients.stop_client(&client_id) {
                        info!(channel_id = %channel_id, client_id = %client_id, "Stopped client on request");
                    }
                }
            }
            other => {
                debug!(channel_id = other.channel_id(), event = other.name(), "Observed channel event");
            }
        }
    }
}
