// Integration tests for multi-worker relaying
//
// Two coordinators sharing one in-memory store stand in for two workers.
// Upstreams are scripted so failures and stalls are deterministic, and time
// is paused so reconnect and shutdown timers run instantly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tsrelay_core::config::{CatalogConfig, ChannelConfig, ProxyConfig, StreamConfig, TS_PACKET_SIZE};
use tsrelay_livestream::events::{ChannelEvent, EventHandler, EventListener};
use tsrelay_livestream::livestream::{ChannelContext, ChannelCoordinator, ChannelRole};
use tsrelay_livestream::model::ChannelState;
use tsrelay_livestream::store::{MemoryStore, RelayStore};
use tsrelay_livestream::upstream::{ByteStream, UpstreamConnector};
use tsrelay_livestream::{Catalog, RelayError, RelayResult, StaticCatalog, StreamSource};

const PRIMARY: &str = "http://primary/1.ts";
const BACKUP: &str = "http://backup/2.ts";

#[derive(Clone, Copy)]
enum Behavior {
    /// One chunk every 100ms, forever.
    Steady(u8),
    /// One chunk, then silence.
    Stall(u8),
    /// `n` chunks 100ms apart, then silence.
    Flap(u8, u32),
    Refuse,
}

/// Upstream that serves scripted behaviors per URL and counts connects.
struct ScriptedConnector {
    behaviors: HashMap<String, Behavior>,
    connects: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors.iter().map(|(u, b)| ((*u).to_string(), *b)).collect(),
            connects: Mutex::new(Vec::new()),
        })
    }

    fn connects_to(&self, url: &str) -> usize {
        self.connects.lock().iter().filter(|u| *u == url).count()
    }
}

/// One full chunk of TS packets; the first packet carries `tag` and `seq`.
fn chunk(tag: u8, seq: u32) -> Bytes {
    let mut data = vec![tag; TS_PACKET_SIZE * ProxyConfig::default().ts_packets_per_chunk];
    for packet in data.chunks_mut(TS_PACKET_SIZE) {
        packet[0] = 0x47;
        packet[1] = 0x01;
    }
    data[4..8].copy_from_slice(&seq.to_be_bytes());
    Bytes::from(data)
}

fn seq_of(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[4], data[5], data[6], data[7]])
}

fn is_keepalive(data: &[u8]) -> bool {
    data.len() == TS_PACKET_SIZE && data[1] == 0x1F && data[2] == 0xFF
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn connect(&self, source: &StreamSource) -> RelayResult<ByteStream> {
        self.connects.lock().push(source.url.clone());
        match self.behaviors.get(&source.url).copied().unwrap_or(Behavior::Refuse) {
            Behavior::Steady(tag) => Ok(Box::pin(futures::stream::unfold(1u32, move |seq| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Ok(chunk(tag, seq)), seq + 1))
            }))),
            Behavior::Stall(tag) => Ok(Box::pin(
                futures::stream::once(async move { Ok(chunk(tag, 1)) }).chain(futures::stream::pending()),
            )),
            Behavior::Flap(tag, n) => Ok(Box::pin(futures::stream::unfold(1u32, move |seq| async move {
                if seq > n {
                    futures::future::pending::<()>().await;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Ok(chunk(tag, seq)), seq + 1))
            }))),
            Behavior::Refuse => Err(RelayError::UpstreamConnect("connection refused".to_string())),
        }
    }
}

fn stream(id: i64, url: &str) -> StreamConfig {
    StreamConfig {
        id,
        url: url.to_string(),
        ..StreamConfig::default()
    }
}

fn catalog() -> Arc<StaticCatalog> {
    let config = CatalogConfig {
        default_profile: None,
        profiles: Vec::new(),
        channels: vec![
            ChannelConfig {
                id: "news".to_string(),
                streams: vec![stream(1, PRIMARY), stream(2, BACKUP)],
                ..ChannelConfig::default()
            },
            ChannelConfig {
                id: "direct".to_string(),
                profile: Some("Redirect".to_string()),
                streams: vec![stream(5, "http://cdn/5.ts")],
                ..ChannelConfig::default()
            },
        ],
    };
    Arc::new(StaticCatalog::new(&config, "VLC/3.0.20 LibVLC/3.0.20"))
}

struct Cluster {
    store: Arc<dyn RelayStore>,
    catalog: Arc<StaticCatalog>,
    connector: Arc<ScriptedConnector>,
}

impl Cluster {
    fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            catalog: catalog(),
            connector: ScriptedConnector::new(behaviors),
        }
    }

    fn worker(&self, worker_id: &str) -> Arc<ChannelCoordinator> {
        self.worker_with(worker_id, ProxyConfig::default())
    }

    fn worker_with(&self, worker_id: &str, config: ProxyConfig) -> Arc<ChannelCoordinator> {
        let catalog: Arc<dyn Catalog> = self.catalog.clone();
        let connector: Arc<dyn UpstreamConnector> = self.connector.clone();
        ChannelCoordinator::new(ChannelContext {
            worker_id: worker_id.to_string(),
            store: self.store.clone(),
            catalog,
            connector,
            config,
        })
    }

    async fn listen(&self, worker: &Arc<ChannelCoordinator>) {
        let handler: Arc<dyn EventHandler> = worker.clone();
        EventListener::new(self.store.clone(), handler, worker.shutdown_token()).spawn();
        // Let the listener subscribe
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Drain a client's queue in the background, keeping what it received.
fn drain(mut rx: mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Arc<Mutex<Vec<Bytes>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    tokio::spawn(async move {
        while let Some(Ok(data)) = rx.recv().await {
            sink.lock().push(data);
        }
    });
    received
}

fn data_chunks(received: &Mutex<Vec<Bytes>>) -> Vec<Bytes> {
    received.lock().iter().filter(|d| !is_keepalive(d)).cloned().collect()
}

#[tokio::test(start_paused = true)]
async fn test_owner_serves_client_from_behind_head() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");

    assert_eq!(worker.start_channel("news").await.unwrap(), ChannelRole::Owner);
    assert!(worker.wait_for_connection("news", Duration::from_secs(10)).await.unwrap());
    assert!(worker.am_i_owner("news").await.unwrap());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let head_before = cluster.store.buffer_head("news").await.unwrap();
    assert!(head_before >= 40, "head was {head_before}");

    let rx = worker.attach_client("news", "viewer", "10.0.0.1", "VLC").await.unwrap();
    let head_after = cluster.store.buffer_head("news").await.unwrap();
    let received = drain(rx);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let chunks = data_chunks(&received);
    let first = u64::from(seq_of(&chunks[0]));
    assert!(first > head_before - 30 && first <= head_after - 29, "first seq {first}");
    // Delivered strictly in order with no gaps
    for pair in chunks.windows(2) {
        assert_eq!(seq_of(&pair[1]), seq_of(&pair[0]) + 1);
    }

    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.state, ChannelState::Active);
    assert_eq!(meta.owner, "w1");
    assert_eq!(cluster.store.client_count("news").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_worker_relays_without_connecting() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let owner = cluster.worker("w1");
    let relay = cluster.worker("w2");

    assert_eq!(owner.start_channel("news").await.unwrap(), ChannelRole::Owner);
    assert_eq!(relay.start_channel("news").await.unwrap(), ChannelRole::Relay);
    assert!(relay.wait_for_connection("news", Duration::from_secs(10)).await.unwrap());
    assert!(!relay.am_i_owner("news").await.unwrap());

    let received = drain(relay.attach_client("news", "remote", "10.0.0.2", "VLC").await.unwrap());
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(cluster.connector.connects_to(PRIMARY), 1);
    assert!(!data_chunks(&received).is_empty());
    let health = relay.local_health("news").unwrap();
    assert!(!health.owner);
    assert_eq!(health.client_ids, vec!["remote".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_elects_one_owner() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let a = cluster.worker("w1");
    let b = cluster.worker("w2");

    let (ra, rb) = tokio::join!(a.start_channel("news"), b.start_channel("news"));
    let roles = [ra.unwrap(), rb.unwrap()];
    assert_eq!(roles.iter().filter(|r| **r == ChannelRole::Owner).count(), 1);
    assert_eq!(roles.iter().filter(|r| **r == ChannelRole::Relay).count(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(cluster.connector.connects_to(PRIMARY), 1);
    let owner = cluster.store.owner("news").await.unwrap().unwrap();
    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.owner, owner);
    let (owning, relaying) = if owner == "w1" { (&a, &b) } else { (&b, &a) };
    assert!(owning.local_health("news").unwrap().owner);
    assert!(!relaying.local_health("news").unwrap().owner);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_client_skips_expired_chunks() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let config = ProxyConfig {
        chunk_ttl_seconds: 3,
        initial_behind_chunks: 5,
        ..ProxyConfig::default()
    };
    let worker = cluster.worker_with("w1", config);
    worker.start_channel("news").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Not read at first: the queue fills while the chunks behind it expire
    let rx = worker.attach_client("news", "slow", "10.0.0.1", "VLC").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let received = drain(rx);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let seqs: Vec<u32> = data_chunks(&received).iter().map(|c| seq_of(c)).collect();
    assert!(seqs.len() > 20, "received {} chunks", seqs.len());
    assert!(seqs.windows(2).all(|w| w[1] > w[0]), "out of order: {seqs:?}");
    assert!(seqs.windows(2).any(|w| w[1] - w[0] > 1), "never skipped: {seqs:?}");
    let head = cluster.store.buffer_head("news").await.unwrap();
    let last = u64::from(*seqs.last().unwrap());
    assert!(last + 5 >= head, "last {last}, head {head}");
    assert_eq!(cluster.store.client_count("news").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_upstream_fails_over_keeping_clients() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Stall(1)), (BACKUP, Behavior::Steady(2))]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();
    let received = drain(worker.attach_client("news", "viewer", "10.0.0.1", "VLC").await.unwrap());

    tokio::time::sleep(Duration::from_secs(120)).await;

    // Initial connect plus every reconnect allowed before switching
    assert_eq!(cluster.connector.connects_to(PRIMARY), 4);
    assert_eq!(cluster.connector.connects_to(BACKUP), 1);

    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.url, BACKUP);
    assert_eq!(meta.stream_id, Some(2));
    assert!(meta.stream_switch_reason.is_some());
    assert_eq!(cluster.store.client_ids("news").await.unwrap(), vec!["viewer".to_string()]);
    assert!(data_chunks(&received).iter().any(|c| c[2] == 2));
}

#[tokio::test(start_paused = true)]
async fn test_flapping_upstream_fails_over() {
    // 20s of data per connection, then a stall that takes another 15s to detect
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Flap(1, 200)), (BACKUP, Behavior::Steady(2))]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();
    let received = drain(worker.attach_client("news", "viewer", "10.0.0.1", "VLC").await.unwrap());

    tokio::time::sleep(Duration::from_secs(200)).await;

    // Each connection stays open past the stable window but delivers data for less of it
    assert_eq!(cluster.connector.connects_to(PRIMARY), 4);
    assert_eq!(cluster.connector.connects_to(BACKUP), 1);
    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.url, BACKUP);
    assert!(data_chunks(&received).iter().any(|c| c[2] == 2));
}

#[tokio::test(start_paused = true)]
async fn test_switch_requested_on_relay_is_applied_by_owner() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1)), (BACKUP, Behavior::Steady(2))]);
    let owner = cluster.worker("w1");
    let relay = cluster.worker("w2");
    cluster.listen(&owner).await;
    owner.start_channel("news").await.unwrap();
    relay.start_channel("news").await.unwrap();
    let received = drain(relay.attach_client("news", "remote", "10.0.0.2", "VLC").await.unwrap());
    tokio::time::sleep(Duration::from_secs(2)).await;

    let outcome = relay.request_stream_switch("news", BACKUP, None, None).await.unwrap();
    assert!(!outcome.owner);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(cluster.connector.connects_to(BACKUP), 1);
    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.url, BACKUP);
    let key = cluster.store.keys().switch_request("news");
    assert!(cluster.store.get_ephemeral(&key).await.unwrap().is_none());
    assert!(data_chunks(&received).iter().any(|c| c[2] == 2));
    assert_eq!(cluster.store.client_count("news").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_switch_validation() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");

    assert!(matches!(
        worker.request_stream_switch("news", "  ", None, None).await,
        Err(RelayError::InvalidRequest(_))
    ));
    assert!(matches!(
        worker.request_stream_switch("news", BACKUP, None, None).await,
        Err(RelayError::ChannelNotFound(_))
    ));

    worker.start_channel("news").await.unwrap();
    let outcome = worker.request_stream_switch("news", BACKUP, None, None).await.unwrap();
    assert!(outcome.owner);
}

#[tokio::test(start_paused = true)]
async fn test_last_client_leaving_stops_channel() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();
    let mut rx = worker.attach_client("news", "viewer", "10.0.0.1", "VLC").await.unwrap();
    assert!(rx.recv().await.is_some());
    drop(rx);

    tokio::time::sleep(Duration::from_secs(2)).await;
    // Still inside the shutdown delay
    assert!(worker.channel_exists("news").await.unwrap());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!worker.channel_exists("news").await.unwrap());
    assert_eq!(cluster.store.buffer_head("news").await.unwrap(), 0);
    assert!(cluster.store.owner("news").await.unwrap().is_none());
    assert_eq!(cluster.catalog.release_count(), 1);
    assert!(worker.local_health("news").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_returning_client_cancels_shutdown() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();
    drop(worker.attach_client("news", "first", "10.0.0.1", "VLC").await.unwrap());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let _received = drain(worker.attach_client("news", "second", "10.0.0.1", "VLC").await.unwrap());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(worker.channel_exists("news").await.unwrap());
    assert_eq!(cluster.catalog.release_count(), 0);
    assert_eq!(cluster.connector.connects_to(PRIMARY), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ghost_client_removed_exactly_once() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");
    let mut events = cluster.store.subscribe().await.unwrap();
    worker.start_channel("news").await.unwrap();
    tokio::spawn(worker.clone().run_maintenance());

    tokio::time::sleep(Duration::from_secs(5)).await;
    // Never read: the queue fills and the client stops making progress
    let _stuck = worker.attach_client("news", "stuck", "10.0.0.9", "VLC").await.unwrap();

    tokio::time::sleep(Duration::from_secs(42)).await;
    assert!(cluster.store.client_ids("news").await.unwrap().is_empty());
    assert!(cluster.store.read_client("news", "stuck").await.unwrap().is_none());

    let mut disconnects = 0;
    while let Ok(Some((_, payload))) = tokio::time::timeout(Duration::from_millis(10), events.next()).await {
        if let Ok(ChannelEvent::ClientDisconnected { client_id, .. }) = serde_json::from_str(&payload) {
            assert_eq!(client_id, "stuck");
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_stop_reaches_other_worker() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let owner = cluster.worker("w1");
    let relay = cluster.worker("w2");
    cluster.listen(&relay).await;
    owner.start_channel("news").await.unwrap();
    relay.start_channel("news").await.unwrap();
    let _received = drain(relay.attach_client("news", "remote", "10.0.0.2", "VLC").await.unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!owner.request_client_stop("news", "remote").await.unwrap());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cluster.store.client_ids("news").await.unwrap().is_empty());

    assert!(matches!(
        owner.request_client_stop("news", "nobody").await,
        Err(RelayError::ClientNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_releases_once() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let a = cluster.worker("w1");
    let b = cluster.worker("w2");
    a.start_channel("news").await.unwrap();
    b.start_channel("news").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (ra, rb) = tokio::join!(a.request_channel_stop("news"), b.request_channel_stop("news"));
    assert!(ra.is_ok() || rb.is_ok());
    assert_eq!(cluster.catalog.release_count(), 1);
    assert!(!a.channel_exists("news").await.unwrap());
    assert!(a.local_health("news").is_none());

    assert!(matches!(
        a.request_channel_stop("news").await,
        Err(RelayError::ChannelNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_racing_stop_leaves_consistent_state() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let a = cluster.worker("w1");
    let b = cluster.worker("w2");
    a.start_channel("news").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (stopped, started) = tokio::join!(a.request_channel_stop("news"), b.start_channel("news"));
    assert!(stopped.is_ok());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let owner = cluster.store.owner("news").await.unwrap();
    let meta = cluster.store.read_channel("news").await.unwrap();
    match started {
        Ok(ChannelRole::Owner) => {
            assert_eq!(owner.as_deref(), Some("w2"));
            assert_eq!(meta.unwrap().owner, "w2");
            assert!(b.local_health("news").unwrap().owner);
        }
        Ok(ChannelRole::Relay) | Err(RelayError::ChannelStopping(_)) => {
            assert!(owner.is_none());
            assert!(meta.is_none());
            // Nothing left behind that blocks a fresh start
            assert_eq!(b.start_channel("news").await.unwrap(), ChannelRole::Owner);
            assert!(cluster.store.read_channel("news").await.unwrap().is_some());
        }
        other => panic!("unexpected start result: {other:?}"),
    }
    assert!(a.local_health("news").is_none());
    assert_eq!(cluster.catalog.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_refused_while_stopping() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");
    let key = cluster.store.keys().stopping("news");
    cluster
        .store
        .set_ephemeral(&key, "w9", Duration::from_secs(30))
        .await
        .unwrap();

    assert!(matches!(
        worker.start_channel("news").await,
        Err(RelayError::ChannelStopping(_))
    ));
    assert!(cluster.store.owner("news").await.unwrap().is_none());
    assert!(!worker.channel_exists("news").await.unwrap());
    assert_eq!(cluster.connector.connects_to(PRIMARY), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(worker.start_channel("news").await.unwrap(), ChannelRole::Owner);
}

#[tokio::test(start_paused = true)]
async fn test_stop_flag_seen_on_next_poll() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();
    let received = drain(worker.attach_client("news", "viewer", "10.0.0.1", "VLC").await.unwrap());
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Set directly in the store, as a worker whose event was lost would leave it
    let key = cluster.store.keys().client_stop("news", "viewer");
    cluster
        .store
        .set_ephemeral(&key, "w9", Duration::from_secs(30))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(cluster.store.client_ids("news").await.unwrap().is_empty());
    assert!(cluster.store.get_ephemeral(&key).await.unwrap().is_none());
    let delivered = data_chunks(&received).len();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(data_chunks(&received).len(), delivered);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_channel_reports_error_then_stops() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Refuse), (BACKUP, Behavior::Refuse)]);
    let worker = cluster.worker("w1");
    worker.start_channel("news").await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let meta = cluster.store.read_channel("news").await.unwrap().unwrap();
    assert_eq!(meta.state, ChannelState::Error);
    assert!(meta.error_message.is_some());
    assert!(!worker.wait_for_connection("news", Duration::from_secs(1)).await.unwrap());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!worker.channel_exists("news").await.unwrap());
    assert_eq!(cluster.catalog.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_channel_taken_over() {
    let cluster = Cluster::new(&[(PRIMARY, Behavior::Steady(1))]);
    let dead = cluster.worker("w1");
    let survivor = cluster.worker("w2");
    dead.start_channel("news").await.unwrap();
    survivor.start_channel("news").await.unwrap();
    let received = drain(survivor.attach_client("news", "remote", "10.0.0.2", "VLC").await.unwrap());
    tokio::spawn(survivor.clone().run_maintenance());
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The owner dies without releasing anything
    dead.shutdown_token().cancel();
    tokio::time::sleep(Duration::from_secs(100)).await;

    assert_eq!(cluster.store.owner("news").await.unwrap().as_deref(), Some("w2"));
    assert!(survivor.local_health("news").unwrap().owner);
    assert_eq!(cluster.connector.connects_to(PRIMARY), 2);
    let before = data_chunks(&received).len();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(data_chunks(&received).len() > before);
}

#[tokio::test(start_paused = true)]
async fn test_redirect_channel_is_not_relayed() {
    let cluster = Cluster::new(&[]);
    let worker = cluster.worker("w1");
    assert_eq!(
        worker.start_channel("direct").await.unwrap(),
        ChannelRole::Redirect("http://cdn/5.ts".to_string())
    );
    assert!(!worker.channel_exists("direct").await.unwrap());
    assert!(cluster.store.owner("direct").await.unwrap().is_none());
    assert!(matches!(worker.start_channel("missing").await, Err(RelayError::NoStream(_))));
}
