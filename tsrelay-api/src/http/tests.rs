// Router tests against an in-memory store and a scripted upstream

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;
use tsrelay_core::config::{CatalogConfig, ChannelConfig, ProxyConfig, StreamConfig, TS_PACKET_SIZE};
use tsrelay_livestream::upstream::{ByteStream, UpstreamConnector};
use tsrelay_livestream::{
    Catalog, ChannelContext, ChannelCoordinator, MemoryStore, RelayError, RelayResult, StaticCatalog,
    StreamSource,
};

use super::create_router;

/// Upstream that produces one chunk of TS packets every 100ms.
struct SteadyUpstream;

#[async_trait]
impl UpstreamConnector for SteadyUpstream {
    async fn connect(&self, _source: &StreamSource) -> RelayResult<ByteStream> {
        Ok(Box::pin(futures::stream::unfold((), |()| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut data = vec![0u8; TS_PACKET_SIZE * 44];
            for packet in data.chunks_mut(TS_PACKET_SIZE) {
                packet[0] = 0x47;
            }
            Some((Ok(Bytes::from(data)), ()))
        })))
    }
}

/// Upstream that refuses every connection.
struct RefusingUpstream;

#[async_trait]
impl UpstreamConnector for RefusingUpstream {
    async fn connect(&self, _source: &StreamSource) -> RelayResult<ByteStream> {
        Err(RelayError::UpstreamConnect("connection refused".to_string()))
    }
}

fn router() -> Router {
    router_with(Arc::new(SteadyUpstream))
}

fn router_with(connector: Arc<dyn UpstreamConnector>) -> Router {
    let stream = |id: i64, url: &str| StreamConfig {
        id,
        url: url.to_string(),
        ..StreamConfig::default()
    };
    let catalog = CatalogConfig {
        default_profile: None,
        profiles: Vec::new(),
        channels: vec![
            ChannelConfig {
                id: "news".to_string(),
                streams: vec![stream(1, "http://primary/1.ts")],
                ..ChannelConfig::default()
            },
            ChannelConfig {
                id: "direct".to_string(),
                profile: Some("Redirect".to_string()),
                streams: vec![stream(2, "http://cdn/2.ts")],
                ..ChannelConfig::default()
            },
        ],
    };
    let catalog: Arc<dyn Catalog> = Arc::new(StaticCatalog::new(&catalog, "VLC"));
    let coordinator = ChannelCoordinator::new(ChannelContext {
        worker_id: "w1".to_string(),
        store: Arc::new(MemoryStore::default()),
        catalog,
        connector,
        config: ProxyConfig::default(),
    });
    create_router(coordinator)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> axum::response::Response {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap()
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = send(&router(), Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_status_empty_and_unknown_channel() {
    let router = router();

    let response = send(&router, Method::GET, "/proxy/ts/status", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["channel_count"], 0);
    assert_eq!(body["worker_id"], "w1");

    let response = send(&router, Method::GET, "/proxy/ts/status/nope", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json(response).await;
    assert_eq!(body["status"], 404);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_stream_unknown_channel_is_not_found() {
    let response = send(&router(), Method::GET, "/proxy/ts/stream/missing", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_redirect_profile_answers_302() {
    let response = send(&router(), Method::GET, "/proxy/ts/stream/direct", None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "http://cdn/2.ts");
}

#[tokio::test(start_paused = true)]
async fn test_stream_status_and_stop() {
    let router = router();

    let response = send(&router, Method::GET, "/proxy/ts/stream/news", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    let client_id = response.headers()["x-client-id"].to_str().unwrap().to_string();

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let data = frame.into_data().unwrap();
    assert_eq!(data[0], 0x47);
    assert_eq!(data.len() % TS_PACKET_SIZE, 0);

    let status = json(send(&router, Method::GET, "/proxy/ts/status/news", None).await).await;
    assert_eq!(status["state"], "active");
    assert_eq!(status["client_count"], 1);
    assert_eq!(status["client_records"][0]["client_id"], client_id.as_str());
    assert_eq!(status["local"]["owner"], true);
    assert_eq!(status["buffer"]["all_aligned"], true);

    let overview = json(send(&router, Method::GET, "/proxy/ts/status/", None).await).await;
    assert_eq!(overview["channel_count"], 1);
    assert_eq!(overview["channels"][0]["channel_id"], "news");

    let response = send(&router, Method::DELETE, "/proxy/ts/stop/news", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["previous_state"], "active");

    let response = send(&router, Method::POST, "/proxy/ts/stop/news", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_upstream_times_out_and_stops_channel() {
    let router = router_with(Arc::new(RefusingUpstream));

    let response = send(&router, Method::GET, "/proxy/ts/stream/news", None).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    // Gone right away, not after the failover grace period
    let response = send(&router, Method::GET, "/proxy/ts/status/news", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let overview = json(send(&router, Method::GET, "/proxy/ts/status", None).await).await;
    assert_eq!(overview["channel_count"], 0);
}

#[tokio::test]
async fn test_change_stream_validation() {
    let router = router();

    let response = send(
        &router,
        Method::POST,
        "/proxy/ts/change_stream/news",
        Some(serde_json::json!({ "url": "" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &router,
        Method::POST,
        "/proxy/ts/change_stream/news",
        Some(serde_json::json!({ "url": "http://other/3.ts" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_change_stream_on_owner() {
    let router = router();
    let response = send(&router, Method::GET, "/proxy/ts/stream/news", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &router,
        Method::POST,
        "/proxy/ts/change_stream/news",
        Some(serde_json::json!({ "url": "http://other/3.ts", "user_agent": "Kodi" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["owner"], true);
    assert_eq!(body["url"], "http://other/3.ts");
}

#[tokio::test]
async fn test_stop_client_validation() {
    let router = router();

    let response = send(
        &router,
        Method::POST,
        "/proxy/ts/stop_client/news",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &router,
        Method::POST,
        "/proxy/ts/stop_client/news",
        Some(serde_json::json!({ "client_id": "ghost" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
