//! Shared chunk buffer and MPEG-TS chunking.
//!
//! The owner writes whole-packet chunks through `SharedBuffer::append`; every
//! worker reads them back by index. Retention is purely TTL based, so the set
//! of live indices is always a contiguous range `[oldest, head]`.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tsrelay_core::config::{ProxyConfig, TS_PACKET_SIZE};

use crate::error::RelayResult;
use crate::store::RelayStore;

pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_NULL_PID: u16 = 0x1FFF;

/// One MPEG-TS null packet (PID 0x1FFF, payload only, stuffed with 0xFF).
#[must_use]
pub fn null_packet() -> Bytes {
    let mut packet = vec![0xFF; TS_PACKET_SIZE];
    packet[0] = TS_SYNC_BYTE;
    packet[1] = (TS_NULL_PID >> 8) as u8;
    packet[2] = (TS_NULL_PID & 0xFF) as u8;
    packet[3] = 0x10;
    Bytes::from(packet)
}

/// Where a reader's next index stands relative to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Data is available from the next index.
    Ready,
    /// The next index has not been produced yet.
    CaughtUp,
    /// The next index has expired; resume from `oldest`.
    Behind { oldest: u64 },
    /// Nothing in `(cursor, head]` is retained any more.
    Drained,
}

/// One channel's view of the shared buffer.
#[derive(Clone)]
pub struct SharedBuffer {
    store: Arc<dyn RelayStore>,
    channel_id: String,
    chunk_ttl: Duration,
    index_ttl: Duration,
}

impl SharedBuffer {
    pub fn new(store: Arc<dyn RelayStore>, channel_id: impl Into<String>, config: &ProxyConfig) -> Self {
        Self {
            store,
            channel_id: channel_id.into(),
            chunk_ttl: config.chunk_ttl(),
            index_ttl: config.buffer_index_ttl(),
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Append a chunk. Owner only.
    pub async fn append(&self, chunk: Bytes) -> RelayResult<u64> {
        self.store
            .append_chunk(&self.channel_id, chunk, self.chunk_ttl, self.index_ttl)
            .await
    }

    pub async fn read(&self, index: u64) -> RelayResult<Option<Bytes>> {
        let mut chunks = self.store.read_chunks(&self.channel_id, index, 1).await?;
        Ok(chunks.pop().flatten())
    }

    /// Read up to `count` chunks after `cursor`, stopping at `head` and at the
    /// first missing index.
    pub async fn read_after(&self, cursor: u64, head: u64, count: usize) -> RelayResult<Vec<Bytes>> {
        let available = usize::try_from(head.saturating_sub(cursor)).unwrap_or(usize::MAX);
        let count = count.min(available);
        if count == 0 {
            return Ok(Vec::new());
        }
        let chunks = self.store.read_chunks(&self.channel_id, cursor + 1, count).await?;
        Ok(chunks.into_iter().map_while(|c| c).collect())
    }

    pub async fn head(&self) -> RelayResult<u64> {
        self.store.buffer_head(&self.channel_id).await
    }

    /// Classify the index after `cursor`.
    ///
    /// Anything at or below `head` was written, so a missing chunk there has
    /// expired; anything above `head` has not been produced yet.
    pub async fn position(&self, cursor: u64, head: u64) -> RelayResult<Position> {
        if cursor >= head {
            return Ok(Position::CaughtUp);
        }
        if self.store.chunk_exists(&self.channel_id, cursor + 1).await? {
            return Ok(Position::Ready);
        }
        match self.oldest_retained(cursor + 1, head).await? {
            Some(oldest) => Ok(Position::Behind { oldest }),
            None => Ok(Position::Drained),
        }
    }

    /// Smallest retained index in `[from, head]`.
    ///
    /// Chunks expire in index order, so presence is monotone over the range and
    /// a binary search over existence checks finds the boundary.
    pub async fn oldest_retained(&self, from: u64, head: u64) -> RelayResult<Option<u64>> {
        if from > head || !self.store.chunk_exists(&self.channel_id, head).await? {
            return Ok(None);
        }
        let (mut lo, mut hi) = (from, head);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.store.chunk_exists(&self.channel_id, mid).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(Some(lo))
    }

    pub async fn clear(&self) -> RelayResult<()> {
        self.store.clear_buffer(&self.channel_id).await
    }
}

/// Splits an upstream byte stream into chunks of whole TS packets.
///
/// Partial packets carry over between pushes. When the stream loses packet
/// sync the writer skips forward to the next sync byte that is followed by
/// another sync byte one packet later.
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_size: usize,
    pending: BytesMut,
    packets: BytesMut,
    in_sync: bool,
    resyncs: u64,
}

impl ChunkWriter {
    #[must_use]
    pub fn new(packets_per_chunk: usize) -> Self {
        let chunk_size = packets_per_chunk.max(1) * TS_PACKET_SIZE;
        Self {
            chunk_size,
            pending: BytesMut::with_capacity(chunk_size * 2),
            packets: BytesMut::with_capacity(chunk_size),
            in_sync: true,
            resyncs: 0,
        }
    }

    /// Number of times packet sync was lost and recovered.
    #[must_use]
    pub const fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Feed upstream bytes; returns every chunk completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut chunks = Vec::new();

        loop {
            if self.pending.is_empty() {
                break;
            }
            if self.pending[0] != TS_SYNC_BYTE {
                self.lose_sync();
                match self.pending.iter().position(|&b| b == TS_SYNC_BYTE) {
                    Some(pos) => self.pending.advance(pos),
                    None => {
                        self.pending.clear();
                        break;
                    }
                }
            }
            if self.pending.len() < TS_PACKET_SIZE {
                break;
            }
            if self.pending.len() > TS_PACKET_SIZE && self.pending[TS_PACKET_SIZE] != TS_SYNC_BYTE {
                // False sync byte inside payload
                self.lose_sync();
                self.pending.advance(1);
                continue;
            }

            self.in_sync = true;
            self.packets
                .extend_from_slice(&self.pending.split_to(TS_PACKET_SIZE));
            if self.packets.len() >= self.chunk_size {
                chunks.push(self.packets.split().freeze());
            }
        }

        chunks
    }

    /// Emit whatever whole packets are buffered.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.packets.is_empty() {
            None
        } else {
            Some(self.packets.split().freeze())
        }
    }

    /// Drop partial data, e.g. when switching to a different upstream.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.packets.clear();
        self.in_sync = true;
    }

    fn lose_sync(&mut self) {
        if self.in_sync {
            self.in_sync = false;
            self.resyncs += 1;
        }
    }
}

/// Summary of one stored chunk, used by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChunkInfo {
    pub size: usize,
    pub packets: usize,
    pub aligned: bool,
    pub first_byte: String,
}

#[must_use]
pub fn inspect_chunk(chunk: &[u8]) -> ChunkInfo {
    let aligned = chunk.len() % TS_PACKET_SIZE == 0
        && chunk
            .chunks(TS_PACKET_SIZE)
            .all(|packet| packet[0] == TS_SYNC_BYTE);
    ChunkInfo {
        size: chunk.len(),
        packets: chunk.len() / TS_PACKET_SIZE,
        aligned,
        first_byte: chunk
            .first()
            .map(|b| format!("0x{b:02X}"))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn packet(tag: u8) -> Vec<u8> {
        let mut p = vec![tag; TS_PACKET_SIZE];
        p[0] = TS_SYNC_BYTE;
        p
    }

    fn packets(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| packet(i as u8 + 1)).collect()
    }

    #[test]
    fn test_null_packet() {
        let p = null_packet();
        assert_eq!(p.len(), TS_PACKET_SIZE);
        assert_eq!(&p[..4], &[0x47, 0x1F, 0xFF, 0x10]);
        assert!(inspect_chunk(&p).aligned);
    }

    #[test]
    fn test_writer_carries_partial_packets() {
        let mut writer = ChunkWriter::new(2);
        let data = packets(3);

        assert!(writer.push(&data[..100]).is_empty());
        let chunks = writer.push(&data[100..]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2 * TS_PACKET_SIZE);
        assert_eq!(chunks[0][TS_PACKET_SIZE + 1], 2);

        let rest = writer.flush().unwrap();
        assert_eq!(rest.len(), TS_PACKET_SIZE);
        assert_eq!(rest[1], 3);
        assert_eq!(writer.resyncs(), 0);
    }

    #[test]
    fn test_writer_resyncs_on_garbage() {
        let mut writer = ChunkWriter::new(2);
        let mut data = vec![0x00, 0x47, 0x12, 0x13];
        data.extend(packets(2));
        data.extend(packet(9));

        let chunks = writer.push(&data);
        assert_eq!(chunks.len(), 1);
        assert!(inspect_chunk(&chunks[0]).aligned);
        assert_eq!(chunks[0][1], 1);
        assert_eq!(writer.resyncs(), 1);
    }

    #[test]
    fn test_inspect_misaligned() {
        let info = inspect_chunk(&[0x47, 0, 0]);
        assert!(!info.aligned);
        assert_eq!(info.first_byte, "0x47");
        assert_eq!(info.packets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_distinguishes_expired_from_pending() {
        let config = ProxyConfig {
            chunk_ttl_seconds: 10,
            ..ProxyConfig::default()
        };
        let buffer = SharedBuffer::new(Arc::new(MemoryStore::default()), "c1", &config);

        for _ in 0..5 {
            buffer.append(Bytes::from_static(b"x")).await.unwrap();
            tokio::time::advance(Duration::from_secs(3)).await;
        }
        // t=15: chunks written at t=0,3 have expired; 3,4,5 remain
        let head = buffer.head().await.unwrap();
        assert_eq!(head, 5);
        assert_eq!(buffer.position(0, head).await.unwrap(), Position::Behind { oldest: 3 });
        assert_eq!(buffer.position(3, head).await.unwrap(), Position::Ready);
        assert_eq!(buffer.position(5, head).await.unwrap(), Position::CaughtUp);

        let chunks = buffer.read_after(2, head, 10).await.unwrap();
        assert_eq!(chunks.len(), 3);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(buffer.position(0, head).await.unwrap(), Position::Drained);
    }
}
