//! Upstream stream manager
//!
//! Runs on the channel owner only. Keeps one upstream connection open, feeds
//! its bytes into the shared buffer as whole-packet chunks and handles:
//! - **Retries**: each connect attempt is bounded by the connection timeout;
//!   failures are retried up to `max_retries` with `retry_wait` between them.
//! - **Reconnects**: a stream that errors, ends, or delivers nothing for
//!   `stream_timeout` is reconnected. The reconnect counter resets once a
//!   connection has stayed up for `min_stable_time`.
//! - **Failover**: when retries or reconnects are exhausted the manager walks
//!   the catalog's alternate streams, each tried at most once, within the
//!   failover grace period.
//! - **URL changes**: `StreamCommand::UpdateUrl` swaps the upstream in place;
//!   attached clients keep reading the same buffer.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tsrelay_core::config::ProxyConfig;

use crate::buffer::{ChunkWriter, SharedBuffer};
use crate::catalog::{Catalog, StreamSource};
use crate::events::{self, ChannelEvent};
use crate::livestream::ChannelContext;
use crate::model::{field, ChannelState, Fields, ManagerState};
use crate::store::RelayStore;
use crate::upstream::{ByteStream, UpstreamConnector};
use crate::util::now_secs;

/// Requests delivered to a running manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    UpdateUrl {
        url: String,
        user_agent: Option<String>,
        stream_id: Option<i64>,
        reason: String,
    },
}

/// Why a manager returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Cancelled by the coordinator.
    Stopped,
    /// Every retry, reconnect, and alternate failed.
    Exhausted,
}

enum Connect {
    Ready(ByteStream),
    Failed(String),
    Cancelled,
}

enum Wait {
    Elapsed,
    Updated,
    Cancelled,
}

enum PumpEnd {
    /// The connection failed; `last_data` is when its final bytes arrived.
    Lost { reason: String, last_data: Instant },
    Updated,
    Cancelled,
}

pub struct StreamManager {
    channel_id: String,
    worker_id: String,
    store: Arc<dyn RelayStore>,
    catalog: Arc<dyn Catalog>,
    connector: Arc<dyn UpstreamConnector>,
    config: ProxyConfig,
    buffer: SharedBuffer,
    writer: ChunkWriter,
    source: StreamSource,
    tried: HashSet<i64>,
    commands: mpsc::Receiver<StreamCommand>,
    state: watch::Sender<ManagerState>,
    cancel: CancellationToken,
    reconnect_attempts: u32,
    switch_attempts: u32,
    ever_connected: bool,
}

impl StreamManager {
    pub fn new(
        ctx: &ChannelContext,
        channel_id: &str,
        source: StreamSource,
        commands: mpsc::Receiver<StreamCommand>,
        state: watch::Sender<ManagerState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            worker_id: ctx.worker_id.clone(),
            store: ctx.store.clone(),
            catalog: ctx.catalog.clone(),
            connector: ctx.connector.clone(),
            config: ctx.config.clone(),
            buffer: SharedBuffer::new(ctx.store.clone(), channel_id, &ctx.config),
            writer: ChunkWriter::new(ctx.config.ts_packets_per_chunk),
            source,
            tried: HashSet::new(),
            commands,
            state,
            cancel,
            reconnect_attempts: 0,
            switch_attempts: 0,
            ever_connected: false,
        }
    }

    pub async fn run(mut self) -> StreamOutcome {
        info!(
            channel_id = %self.channel_id,
            url = %self.source.url,
            profile = self.source.profile.name(),
            "Starting upstream"
        );

        let mut pending: Option<ByteStream> = None;
        let outcome = loop {
            let stream = match pending.take() {
                Some(stream) => stream,
                None => match self.connect_with_retries().await {
                    Connect::Ready(stream) => stream,
                    Connect::Cancelled => break StreamOutcome::Stopped,
                    Connect::Failed(e) => {
                        warn!(channel_id = %self.channel_id, error = %e, "Upstream unreachable, trying alternates");
                        match self.switch_to_alternate(&format!("connect failed: {e}")).await {
                            Connect::Ready(stream) => stream,
                            Connect::Cancelled => break StreamOutcome::Stopped,
                            Connect::Failed(_) => break StreamOutcome::Exhausted,
                        }
                    }
                },
            };

            let connected_at = Instant::now();
            self.on_connected().await;

            let (reason, last_data) = match self.pump(stream).await {
                PumpEnd::Cancelled => break StreamOutcome::Stopped,
                PumpEnd::Updated => continue,
                PumpEnd::Lost { reason, last_data } => (reason, last_data),
            };

            self.set_upstream_state(ManagerState::Unhealthy).await;
            // Stable means data kept flowing, not merely that the socket stayed open
            if last_data.saturating_duration_since(connected_at) >= self.config.min_stable_time() {
                self.reconnect_attempts = 0;
                self.switch_attempts = 0;
                self.tried.clear();
            }
            self.reconnect_attempts += 1;

            if self.reconnect_attempts > self.config.max_reconnect_attempts {
                warn!(
                    channel_id = %self.channel_id,
                    attempts = self.reconnect_attempts - 1,
                    reason = %reason,
                    "Reconnect attempts exhausted, trying alternates"
                );
                match self.switch_to_alternate(&reason).await {
                    Connect::Ready(stream) => pending = Some(stream),
                    Connect::Cancelled => break StreamOutcome::Stopped,
                    Connect::Failed(_) => break StreamOutcome::Exhausted,
                }
                continue;
            }

            warn!(
                channel_id = %self.channel_id,
                attempt = self.reconnect_attempts,
                max = self.config.max_reconnect_attempts,
                reason = %reason,
                "Upstream lost, reconnecting"
            );
            self.set_upstream_state(ManagerState::Reconnecting).await;
            if let Wait::Cancelled = self.wait(self.config.retry_wait()).await {
                break StreamOutcome::Stopped;
            }
        };

        match outcome {
            StreamOutcome::Stopped => {
                let _ = self.state.send_replace(ManagerState::Stopped);
                info!(channel_id = %self.channel_id, "Upstream stopped");
            }
            StreamOutcome::Exhausted => {
                error!(channel_id = %self.channel_id, url = %self.source.url, "All upstream sources failed");
                let _ = self.state.send_replace(ManagerState::Stopped);
                let now = now_secs();
                self.update(vec![
                    (field::STATE.to_string(), ChannelState::Error.as_str().to_string()),
                    (field::STATE_CHANGED_AT.to_string(), now.to_string()),
                    (field::ERROR_MESSAGE.to_string(), "all upstream sources failed".to_string()),
                    (field::ERROR_TIME.to_string(), now.to_string()),
                    (field::UPSTREAM_STATE.to_string(), ManagerState::Stopped.as_str().to_string()),
                ])
                .await;
            }
        }
        outcome
    }

    // ==================== Connecting ====================

    async fn connect_once(&self, source: &StreamSource) -> Result<ByteStream, String> {
        match timeout(self.config.connection_timeout(), self.connector.connect(source)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.config.connection_timeout().as_secs()
            )),
        }
    }

    async fn connect_with_retries(&mut self) -> Connect {
        let mut retries: u32 = 0;
        loop {
            self.set_upstream_state(ManagerState::Connecting).await;
            if !self.ever_connected {
                self.set_channel_state(ChannelState::Connecting, Vec::new()).await;
            }

            let cancel = self.cancel.clone();
            let source = self.source.clone();
            let result = tokio::select! {
                () = cancel.cancelled() => return Connect::Cancelled,
                r = self.connect_once(&source) => r,
            };
            let error = match result {
                Ok(stream) => return Connect::Ready(stream),
                Err(e) => e,
            };

            retries += 1;
            warn!(
                channel_id = %self.channel_id,
                url = %self.source.url,
                attempt = retries,
                max = self.config.max_retries,
                error = %error,
                "Upstream connect failed"
            );
            if retries >= self.config.max_retries {
                return Connect::Failed(error);
            }
            match self.wait(self.config.retry_wait()).await {
                Wait::Cancelled => return Connect::Cancelled,
                Wait::Updated => retries = 0,
                Wait::Elapsed => {}
            }
        }
    }

    /// Walk the catalog's alternates in order, one attempt each, within the
    /// failover grace period. `Failed` means the channel has no source left.
    async fn switch_to_alternate(&mut self, reason: &str) -> Connect {
        self.set_upstream_state(ManagerState::Switching).await;
        if let Some(id) = self.source.stream_id {
            self.tried.insert(id);
        }

        let budget = self
            .config
            .max_switch_attempts
            .saturating_sub(self.switch_attempts) as usize;
        if budget == 0 {
            warn!(channel_id = %self.channel_id, "Stream switch attempts exhausted");
            return Connect::Failed("switch attempts exhausted".to_string());
        }

        let candidates: Vec<StreamSource> = match self
            .catalog
            .alternates(&self.channel_id, self.source.stream_id)
            .await
        {
            Ok(all) => all
                .into_iter()
                .filter(|s| s.stream_id.is_none_or(|id| !self.tried.contains(&id)))
                .take(budget)
                .collect(),
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "Failed to list alternate streams");
                Vec::new()
            }
        };
        if candidates.is_empty() {
            warn!(channel_id = %self.channel_id, "No untried alternate streams");
            return Connect::Failed("no alternates".to_string());
        }

        let cancel = self.cancel.clone();
        let grace = self.config.failover_grace_period();
        let attempt = async {
            let mut attempted = Vec::new();
            for candidate in candidates {
                attempted.push(candidate.stream_id);
                info!(
                    channel_id = %self.channel_id,
                    stream_id = ?candidate.stream_id,
                    url = %candidate.url,
                    "Trying alternate stream"
                );
                match self.connect_once(&candidate).await {
                    Ok(stream) => return (Some((candidate, stream)), attempted),
                    Err(e) => {
                        warn!(channel_id = %self.channel_id, stream_id = ?candidate.stream_id, error = %e, "Alternate failed");
                    }
                }
            }
            (None, attempted)
        };

        let result = tokio::select! {
            () = cancel.cancelled() => return Connect::Cancelled,
            r = timeout(grace, attempt) => r,
        };
        let (found, attempted) = match result {
            Ok(r) => r,
            Err(_) => {
                warn!(channel_id = %self.channel_id, grace_secs = grace.as_secs(), "Failover grace period elapsed");
                return Connect::Failed("failover grace period elapsed".to_string());
            }
        };
        self.switch_attempts += u32::try_from(attempted.len()).unwrap_or(u32::MAX);
        self.tried.extend(attempted.into_iter().flatten());

        let Some((source, stream)) = found else {
            return Connect::Failed("all alternates failed".to_string());
        };
        self.adopt_source(source, reason).await;
        self.reconnect_attempts = 0;
        Connect::Ready(stream)
    }

    /// Make `source` current and announce it.
    async fn adopt_source(&mut self, source: StreamSource, reason: &str) {
        info!(
            channel_id = %self.channel_id,
            from = %self.source.url,
            to = %source.url,
            reason,
            "Switched upstream"
        );
        self.writer.reset();
        self.source = source;

        let now = now_secs();
        let mut fields = vec![
            (field::URL.to_string(), self.source.url.clone()),
            (field::USER_AGENT.to_string(), self.source.user_agent.clone()),
            (field::STREAM_SWITCH_TIME.to_string(), now.to_string()),
            (field::STREAM_SWITCH_REASON.to_string(), reason.to_string()),
        ];
        if let Some(id) = self.source.stream_id {
            fields.push((field::STREAM_ID.to_string(), id.to_string()));
        }
        self.update(fields).await;

        let event = ChannelEvent::StreamSwitched {
            channel_id: self.channel_id.clone(),
            url: self.source.url.clone(),
            stream_id: self.source.stream_id,
            reason: reason.to_string(),
            worker_id: self.worker_id.clone(),
            timestamp: now,
        };
        if let Err(e) = events::publish(self.store.as_ref(), &event).await {
            warn!(channel_id = %self.channel_id, error = %e, "Failed to announce stream switch");
        }
    }

    async fn apply_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::UpdateUrl {
                url,
                user_agent,
                stream_id,
                reason,
            } => {
                let source = StreamSource {
                    stream_id,
                    url,
                    user_agent: user_agent.unwrap_or_else(|| self.source.user_agent.clone()),
                    profile: self.source.profile.clone(),
                };
                self.adopt_source(source, &reason).await;
                self.reconnect_attempts = 0;
                self.switch_attempts = 0;
                self.tried.clear();
            }
        }
    }

    /// Sleep, waking early for cancellation or a URL change.
    async fn wait(&mut self, duration: std::time::Duration) -> Wait {
        let cancel = self.cancel.clone();
        tokio::select! {
            () = cancel.cancelled() => Wait::Cancelled,
            command = self.commands.recv() => match command {
                Some(command) => {
                    self.apply_command(command).await;
                    Wait::Updated
                }
                None => Wait::Cancelled,
            },
            () = tokio::time::sleep(duration) => Wait::Elapsed,
        }
    }

    // ==================== Streaming ====================

    async fn on_connected(&mut self) {
        let clients = self.store.client_count(&self.channel_id).await.unwrap_or(0);
        let state = if clients > 0 {
            ChannelState::Active
        } else {
            ChannelState::WaitingForClients
        };
        let mut extra = vec![(
            field::UPSTREAM_STATE.to_string(),
            ManagerState::Connected.as_str().to_string(),
        )];
        if !self.ever_connected {
            extra.push((field::CONNECTION_READY_TIME.to_string(), now_secs().to_string()));
        }
        // Waiters on the watch must see the updated metadata
        self.set_channel_state(state, extra).await;
        let _ = self.state.send_replace(ManagerState::Connected);
        self.ever_connected = true;

        info!(
            channel_id = %self.channel_id,
            url = %self.source.url,
            state = %state,
            clients,
            "Upstream connected"
        );
    }

    async fn pump(&mut self, mut stream: ByteStream) -> PumpEnd {
        let cancel = self.cancel.clone();
        let check = self.config.health_check_interval();
        let stall = self.config.stream_timeout();
        let mut health = interval_at(Instant::now() + check, check);
        let mut last_data = Instant::now();
        let mut healthy = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return PumpEnd::Cancelled,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return PumpEnd::Cancelled;
                    };
                    self.apply_command(command).await;
                    return PumpEnd::Updated;
                }
                _ = health.tick() => {
                    let idle = last_data.elapsed();
                    if idle > stall {
                        warn!(channel_id = %self.channel_id, idle_secs = idle.as_secs(), "Upstream stalled");
                        return PumpEnd::Lost {
                            reason: format!("no data for {}s", idle.as_secs()),
                            last_data,
                        };
                    }
                    if !healthy {
                        healthy = true;
                        self.set_upstream_state(ManagerState::Healthy).await;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(data)) => {
                        last_data = Instant::now();
                        self.write(&data).await;
                    }
                    Some(Err(e)) => {
                        self.flush_pending().await;
                        return PumpEnd::Lost {
                            reason: format!("read error: {e}"),
                            last_data,
                        };
                    }
                    None => {
                        self.flush_pending().await;
                        return PumpEnd::Lost {
                            reason: "upstream closed".to_string(),
                            last_data,
                        };
                    }
                },
            }
        }
    }

    async fn write(&mut self, data: &[u8]) {
        let chunks = self.writer.push(data);
        self.store_chunks(chunks).await;
    }

    /// Store the trailing whole packets of an upstream that ended.
    async fn flush_pending(&mut self) {
        if let Some(chunk) = self.writer.flush() {
            self.store_chunks(vec![chunk]).await;
        }
    }

    async fn store_chunks(&self, chunks: Vec<bytes::Bytes>) {
        for chunk in chunks {
            let len = chunk.len() as u64;
            match self.buffer.append(chunk).await {
                Ok(index) => {
                    if let Err(e) = self.store.add_channel_bytes(&self.channel_id, len).await {
                        debug!(channel_id = %self.channel_id, error = %e, "Failed to count bytes");
                    }
                    if index % 1000 == 0 {
                        debug!(channel_id = %self.channel_id, index, resyncs = self.writer.resyncs(), "Buffer progress");
                    }
                }
                Err(e) => warn!(channel_id = %self.channel_id, error = %e, "Failed to append chunk"),
            }
        }
    }

    // ==================== Metadata ====================

    async fn update(&self, fields: Fields) {
        match self.store.update_channel(&self.channel_id, fields).await {
            Ok(true) => {}
            Ok(false) => debug!(channel_id = %self.channel_id, "Channel metadata gone, update skipped"),
            Err(e) => warn!(channel_id = %self.channel_id, error = %e, "Failed to update channel metadata"),
        }
    }

    async fn set_upstream_state(&self, state: ManagerState) {
        let _ = self.state.send_replace(state);
        self.update(vec![(field::UPSTREAM_STATE.to_string(), state.as_str().to_string())])
            .await;
    }

    async fn set_channel_state(&self, state: ChannelState, mut extra: Fields) {
        extra.push((field::STATE.to_string(), state.as_str().to_string()));
        extra.push((field::STATE_CHANGED_AT.to_string(), now_secs().to_string()));
        self.update(extra).await;
    }
}
