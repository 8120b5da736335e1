//! Upstream connectors.
//!
//! A connector turns a `StreamSource` into a byte stream. HTTP sources are
//! pulled with reqwest; command profiles spawn the configured program and
//! read its stdout. The stream manager owns retry and timeout policy, so a
//! connector makes exactly one attempt per call.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::catalog::{DeliveryProfile, StreamSource};
use crate::error::{RelayError, RelayResult};

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open the upstream. Resolves once the source has accepted the request;
    /// data arrives on the returned stream.
    async fn connect(&self, source: &StreamSource) -> RelayResult<ByteStream>;
}

/// HTTP pulls and command profiles.
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http })
    }

    async fn connect_http(&self, source: &StreamSource) -> RelayResult<ByteStream> {
        let url = url::Url::parse(&source.url)
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid url {}: {e}", source.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::UpstreamConnect(format!(
                "unsupported scheme {} for {}",
                url.scheme(),
                source.url
            )));
        }

        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, &source.user_agent)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::UpstreamConnect(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        debug!(url = %source.url, status = %response.status(), "Upstream responded");

        let stream = futures::stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(io::Error::other(e)), None)),
            }
        });
        Ok(Box::pin(stream))
    }

    fn connect_command(source: &StreamSource) -> RelayResult<ByteStream> {
        let (program, args) = source
            .profile
            .build_command(&source.url, &source.user_agent)
            .ok_or_else(|| RelayError::NoProfile(source.profile.name().to_string()))?;

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::UpstreamConnect(format!("failed to spawn {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Internal(format!("{program} has no stdout")))?;
        info!(program = %program, pid = ?child.id(), "Started upstream command");

        // The child lives as long as the stream and is killed with it
        let stream = ReaderStream::new(stdout).map(move |item| {
            let _ = &child;
            item
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl UpstreamConnector for DefaultConnector {
    async fn connect(&self, source: &StreamSource) -> RelayResult<ByteStream> {
        match &source.profile {
            DeliveryProfile::Proxy => self.connect_http(source).await,
            DeliveryProfile::Command { .. } => Self::connect_command(source),
            DeliveryProfile::Redirect => Err(RelayError::NoProfile(
                "redirect channels are not relayed".to_string(),
            )),
        }
    }
}
