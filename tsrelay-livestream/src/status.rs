//! Channel status reports.
//!
//! Everything here is read from the shared store, so any worker can answer for
//! every channel. Store failures surface as `Unavailable`.

use serde::Serialize;

use crate::buffer::{inspect_chunk, ChunkInfo};
use crate::error::{RelayError, RelayResult};
use crate::livestream::{ChannelCoordinator, LocalHealth};
use crate::model::{ChannelMetadata, ChannelState, ClientRecord, ManagerState};
use crate::store::RelayStore;
use crate::util::{bitrate_kbps, format_bytes, now_secs};

/// Clients listed per channel in the overview.
const SUMMARY_CLIENT_LIMIT: usize = 10;
/// Most recent chunks inspected by the detailed report.
const RECENT_CHUNKS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub worker_id: String,
    pub timestamp: f64,
    pub channel_count: usize,
    pub channels: Vec<ChannelSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub state: ChannelState,
    pub url: String,
    pub stream_profile: String,
    pub stream_id: Option<i64>,
    pub owner: String,
    pub owner_alive: bool,
    pub upstream_state: Option<ManagerState>,
    pub uptime_seconds: f64,
    pub client_count: usize,
    pub clients: Vec<ClientSummary>,
    pub total_bytes: u64,
    pub total_data: String,
    pub avg_bitrate_kbps: f64,
    pub buffer_index: u64,
    pub stream_switch_reason: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub client_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub worker_id: String,
    pub connected_seconds: f64,
    pub bytes_sent: u64,
    #[serde(rename = "avg_rate_KBps")]
    pub avg_rate_kbps: f64,
}

impl From<&ClientRecord> for ClientSummary {
    fn from(record: &ClientRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            ip_address: record.ip_address.clone(),
            user_agent: record.user_agent.clone(),
            worker_id: record.worker_id.clone(),
            connected_seconds: (now_secs() - record.connected_at).max(0.0),
            bytes_sent: record.bytes_sent,
            avg_rate_kbps: record.avg_rate_kbps,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDetail {
    #[serde(flatten)]
    pub summary: ChannelSummary,
    pub metadata: ChannelMetadata,
    pub buffer: BufferHealth,
    pub client_records: Vec<ClientRecord>,
    pub local: Option<LocalHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentChunk {
    pub index: u64,
    #[serde(flatten)]
    pub info: ChunkInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferHealth {
    pub head: u64,
    pub recent_chunks: Vec<RecentChunk>,
    /// Indices in the recent window that are no longer retained.
    pub missing: Vec<u64>,
    pub avg_chunk_size: f64,
    pub all_aligned: bool,
    pub latest_chunk_ttl_seconds: Option<f64>,
}

fn unavailable(err: RelayError) -> RelayError {
    match err {
        RelayError::Store(msg) => RelayError::Unavailable(msg),
        other => other,
    }
}

/// Overview of every channel in the store.
pub async fn channel_summaries(coordinator: &ChannelCoordinator) -> RelayResult<StatusReport> {
    let store = coordinator.context().store.as_ref();
    let mut channels = Vec::new();
    for channel_id in store.list_channels().await.map_err(unavailable)? {
        // Deleted between listing and reading
        let Some(meta) = store.read_channel(&channel_id).await.map_err(unavailable)? else {
            continue;
        };
        channels.push(summarize(store, &channel_id, &meta, Some(SUMMARY_CLIENT_LIMIT)).await?);
    }

    Ok(StatusReport {
        worker_id: coordinator.worker_id().to_string(),
        timestamp: now_secs(),
        channel_count: channels.len(),
        channels,
    })
}

/// Full diagnostics for one channel.
pub async fn channel_detail(coordinator: &ChannelCoordinator, channel_id: &str) -> RelayResult<ChannelDetail> {
    let store = coordinator.context().store.as_ref();
    let meta = store
        .read_channel(channel_id)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| RelayError::ChannelNotFound(channel_id.to_string()))?;

    let summary = summarize(store, channel_id, &meta, None).await?;
    let client_records = client_records(store, channel_id, None).await?;
    let buffer = buffer_health(store, channel_id, summary.buffer_index).await?;

    Ok(ChannelDetail {
        summary,
        metadata: meta,
        buffer,
        client_records,
        local: coordinator.local_health(channel_id),
    })
}

async fn summarize(
    store: &dyn RelayStore,
    channel_id: &str,
    meta: &ChannelMetadata,
    client_limit: Option<usize>,
) -> RelayResult<ChannelSummary> {
    let owner = store.owner(channel_id).await.map_err(unavailable)?;
    let owner_alive = match owner.as_deref() {
        Some(worker) => store
            .get_ephemeral(&store.keys().worker_heartbeat(worker))
            .await
            .map_err(unavailable)?
            .is_some(),
        None => false,
    };
    let client_count = store.client_count(channel_id).await.map_err(unavailable)?;
    let clients = client_records(store, channel_id, client_limit).await?;
    let buffer_index = store.buffer_head(channel_id).await.map_err(unavailable)?;

    let started = meta.connection_ready_time.unwrap_or(meta.init_time);
    let uptime = (now_secs() - started).max(0.0);

    Ok(ChannelSummary {
        channel_id: channel_id.to_string(),
        state: meta.state,
        url: meta.url.clone(),
        stream_profile: meta.stream_profile.clone(),
        stream_id: meta.stream_id,
        owner: owner.unwrap_or_else(|| meta.owner.clone()),
        owner_alive,
        upstream_state: meta.upstream_state,
        uptime_seconds: uptime,
        client_count,
        clients: clients.iter().map(ClientSummary::from).collect(),
        total_bytes: meta.total_bytes,
        total_data: format_bytes(meta.total_bytes),
        avg_bitrate_kbps: bitrate_kbps(meta.total_bytes, uptime),
        buffer_index,
        stream_switch_reason: meta.stream_switch_reason.clone(),
        error_message: meta.error_message.clone(),
    })
}

async fn client_records(
    store: &dyn RelayStore,
    channel_id: &str,
    limit: Option<usize>,
) -> RelayResult<Vec<ClientRecord>> {
    let ids = store.client_ids(channel_id).await.map_err(unavailable)?;
    let mut records = Vec::new();
    for client_id in ids.iter().take(limit.unwrap_or(usize::MAX)) {
        if let Some(record) = store.read_client(channel_id, client_id).await.map_err(unavailable)? {
            records.push(record);
        }
    }
    Ok(records)
}

async fn buffer_health(store: &dyn RelayStore, channel_id: &str, head: u64) -> RelayResult<BufferHealth> {
    if head == 0 {
        return Ok(BufferHealth {
            head,
            recent_chunks: Vec::new(),
            missing: Vec::new(),
            avg_chunk_size: 0.0,
            all_aligned: true,
            latest_chunk_ttl_seconds: None,
        });
    }

    let start = head.saturating_sub(RECENT_CHUNKS - 1).max(1);
    let count = usize::try_from(head - start + 1).unwrap_or(0);
    let chunks = store
        .read_chunks(channel_id, start, count)
        .await
        .map_err(unavailable)?;

    let mut recent_chunks = Vec::new();
    let mut missing = Vec::new();
    for (index, chunk) in (start..).zip(chunks) {
        match chunk {
            Some(data) => recent_chunks.push(RecentChunk {
                index,
                info: inspect_chunk(&data),
            }),
            None => missing.push(index),
        }
    }

    let avg_chunk_size = if recent_chunks.is_empty() {
        0.0
    } else {
        recent_chunks.iter().map(|c| c.info.size).sum::<usize>() as f64 / recent_chunks.len() as f64
    };
    let latest_chunk_ttl_seconds = store
        .chunk_ttl(channel_id, head)
        .await
        .map_err(unavailable)?
        .map(|ttl| ttl.as_secs_f64());

    Ok(BufferHealth {
        head,
        all_aligned: recent_chunks.iter().all(|c| c.info.aligned),
        recent_chunks,
        missing,
        avg_chunk_size,
        latest_chunk_ttl_seconds,
    })
}
