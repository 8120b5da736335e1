//! Per-client delivery loop.
//!
//! Each client gets its own task that reads the shared buffer from its cursor
//! and pushes chunks into a bounded queue drained by the HTTP response body.
//! A slow client blocks only its own task; when it stops draining, its
//! progress stops and the ghost sweep eventually cancels it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tsrelay_core::config::ProxyConfig;

use crate::buffer::{null_packet, Position, SharedBuffer};
use crate::livestream::client_manager::LocalClient;
use crate::model::ChannelState;
use crate::store::RelayStore;

/// Back-to-back batches a catching-up client sends between checks of the
/// stop flag and channel metadata. An idle client checks on every poll.
const CONTROL_CHECK_BATCHES: u32 = 10;

pub type ClientSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Why a delivery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryExit {
    /// The receiving side went away.
    Disconnected,
    /// Cancelled locally (client stop, ghost eviction, or channel stop).
    Cancelled,
    /// A stop flag was set for this client.
    Stopped,
    /// Channel metadata disappeared or entered a terminal state.
    ChannelGone,
    /// The channel never became ready.
    InitTimeout,
}

enum Sent {
    Ok,
    Closed,
    Cancelled,
}

pub struct ClientStream {
    channel_id: String,
    client: Arc<LocalClient>,
    buffer: SharedBuffer,
    store: Arc<dyn RelayStore>,
    config: ProxyConfig,
    cursor: u64,
    tx: ClientSender,
    keepalive: Bytes,
    last_send: Instant,
    last_stats: Instant,
}

impl ClientStream {
    pub fn new(
        store: Arc<dyn RelayStore>,
        channel_id: &str,
        client: Arc<LocalClient>,
        cursor: u64,
        config: ProxyConfig,
        tx: ClientSender,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            client,
            buffer: SharedBuffer::new(store.clone(), channel_id, &config),
            store,
            config,
            cursor,
            tx,
            keepalive: null_packet(),
            last_send: Instant::now(),
            last_stats: Instant::now(),
        }
    }

    /// How long a client waits for a starting channel before giving up.
    fn init_timeout(&self) -> Duration {
        self.config.connection_timeout() * (self.config.max_retries + 1)
    }

    pub async fn run(mut self) -> DeliveryExit {
        let exit = match self.wait_until_ready().await {
            Some(exit) => exit,
            None => self.deliver().await,
        };
        info!(
            channel_id = %self.channel_id,
            client_id = %self.client.client_id,
            reason = ?exit,
            cursor = self.cursor,
            bytes_sent = self.client.bytes_sent(),
            "Client stream ended"
        );
        exit
    }

    async fn wait_until_ready(&mut self) -> Option<DeliveryExit> {
        let deadline = Instant::now() + self.init_timeout();
        let poll = self.config.client_poll_interval();

        loop {
            match self.store.read_channel(&self.channel_id).await {
                Ok(Some(meta)) if meta.state.is_ready() => return None,
                Ok(Some(meta)) if meta.state.is_terminal() => return Some(DeliveryExit::ChannelGone),
                Ok(Some(_)) => {}
                Ok(None) => {}
                Err(e) => debug!(channel_id = %self.channel_id, error = %e, "Metadata read failed while waiting"),
            }
            if Instant::now() >= deadline {
                warn!(
                    channel_id = %self.channel_id,
                    client_id = %self.client.client_id,
                    "Channel did not become ready in time"
                );
                return Some(DeliveryExit::InitTimeout);
            }
            if let Some(exit) = self.keepalive_if_idle().await {
                return Some(exit);
            }
            if self.pause(poll).await {
                return Some(DeliveryExit::Cancelled);
            }
        }
    }

    async fn deliver(&mut self) -> DeliveryExit {
        let poll = self.config.client_poll_interval();
        let batch = self.config.chunk_batch_size.max(1);
        let mut batches: u32 = 0;

        loop {
            if self.client.cancel_token().is_cancelled() {
                return DeliveryExit::Cancelled;
            }
            if batches >= CONTROL_CHECK_BATCHES {
                batches = 0;
                if let Some(exit) = self.check_control().await {
                    return exit;
                }
            }

            let head = match self.buffer.head().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(channel_id = %self.channel_id, error = %e, "Failed to read buffer head");
                    self.cursor
                }
            };
            if self.cursor > head {
                warn!(
                    channel_id = %self.channel_id,
                    client_id = %self.client.client_id,
                    cursor = self.cursor,
                    head,
                    "Buffer reset, resuming at head"
                );
                self.cursor = head;
            }

            if self.cursor < head {
                match self.buffer.read_after(self.cursor, head, batch).await {
                    Ok(chunks) if !chunks.is_empty() => {
                        if let Some(exit) = self.send_chunks(chunks).await {
                            return exit;
                        }
                        batches += 1;
                        continue;
                    }
                    Ok(_) => {
                        if self.skip_gap(head).await {
                            continue;
                        }
                    }
                    Err(e) => warn!(channel_id = %self.channel_id, error = %e, "Failed to read chunks"),
                }
            }

            batches = 0;
            if let Some(exit) = self.check_control().await {
                return exit;
            }
            if let Some(exit) = self.keepalive_if_idle().await {
                return exit;
            }
            if self.pause(poll).await {
                return DeliveryExit::Cancelled;
            }
        }
    }

    /// The next chunk is missing. Returns true if the cursor moved to data
    /// that can be read right away.
    async fn skip_gap(&mut self, head: u64) -> bool {
        match self.buffer.position(self.cursor, head).await {
            Ok(Position::Behind { oldest }) => {
                warn!(
                    channel_id = %self.channel_id,
                    client_id = %self.client.client_id,
                    skipped = oldest - self.cursor - 1,
                    "Client fell behind retained buffer, skipping ahead"
                );
                self.cursor = oldest - 1;
                true
            }
            Ok(Position::Drained) => {
                warn!(
                    channel_id = %self.channel_id,
                    client_id = %self.client.client_id,
                    skipped = head - self.cursor,
                    "Buffer expired under client, resuming at head"
                );
                self.cursor = head;
                false
            }
            // Written between the read and the check
            Ok(Position::Ready) => true,
            Ok(Position::CaughtUp) => false,
            Err(e) => {
                warn!(channel_id = %self.channel_id, error = %e, "Failed to locate buffer position");
                false
            }
        }
    }

    async fn send_chunks(&mut self, chunks: Vec<Bytes>) -> Option<DeliveryExit> {
        for chunk in chunks {
            let len = chunk.len();
            match self.send(chunk).await {
                Sent::Ok => {
                    self.cursor += 1;
                    self.client.record_sent(len, 1);
                }
                Sent::Closed => return Some(DeliveryExit::Disconnected),
                Sent::Cancelled => return Some(DeliveryExit::Cancelled),
            }
        }
        self.flush_stats_if_due().await;
        None
    }

    /// Publish transfer statistics to the shared client record.
    async fn flush_stats_if_due(&mut self) {
        if self.last_stats.elapsed() < self.config.client_stats_interval() {
            return;
        }
        self.last_stats = Instant::now();
        let fields = self.client.roll_stats();
        match self
            .store
            .touch_client(&self.channel_id, &self.client.client_id, fields, self.config.ghost_threshold())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(channel_id = %self.channel_id, client_id = %self.client.client_id, "Client record gone"),
            Err(e) => debug!(channel_id = %self.channel_id, error = %e, "Failed to flush client stats"),
        }
    }

    async fn keepalive_if_idle(&mut self) -> Option<DeliveryExit> {
        if self.last_send.elapsed() < self.config.keepalive_interval() {
            return None;
        }
        let packet = self.keepalive.clone();
        let len = packet.len();
        match self.send(packet).await {
            Sent::Ok => {
                self.client.record_sent(len, 0);
                None
            }
            Sent::Closed => Some(DeliveryExit::Disconnected),
            Sent::Cancelled => Some(DeliveryExit::Cancelled),
        }
    }

    async fn send(&mut self, data: Bytes) -> Sent {
        let cancel = self.client.cancel_token().clone();
        let result = tokio::select! {
            () = cancel.cancelled() => return Sent::Cancelled,
            r = self.tx.send(Ok(data)) => r,
        };
        match result {
            Ok(()) => {
                self.last_send = Instant::now();
                Sent::Ok
            }
            Err(_) => Sent::Closed,
        }
    }

    /// Returns true if cancelled while sleeping.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.client.cancel_token().cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }

    async fn check_control(&self) -> Option<DeliveryExit> {
        let stop_key = self
            .store
            .keys()
            .client_stop(&self.channel_id, &self.client.client_id);
        match self.store.get_ephemeral(&stop_key).await {
            Ok(Some(_)) => {
                info!(channel_id = %self.channel_id, client_id = %self.client.client_id, "Stop flag set for client");
                return Some(DeliveryExit::Stopped);
            }
            Ok(None) => {}
            Err(e) => debug!(channel_id = %self.channel_id, error = %e, "Failed to read client stop flag"),
        }

        match self.store.read_channel(&self.channel_id).await {
            Ok(None) => Some(DeliveryExit::ChannelGone),
            Ok(Some(meta)) if matches!(meta.state, ChannelState::Stopping | ChannelState::Stopped) => {
                Some(DeliveryExit::ChannelGone)
            }
            Ok(Some(_)) => None,
            Err(e) => {
                debug!(channel_id = %self.channel_id, error = %e, "Failed to read channel metadata");
                None
            }
        }
    }
}
