//! Cross-worker control events.
//!
//! Every channel has a control topic carrying JSON objects tagged by `event`.
//! Any worker may publish; each worker's `EventListener` feeds what it hears
//! into an `EventHandler` (the channel coordinator).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::store::RelayStore;
use crate::util::backoff_delay;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Ask the owner to switch the upstream URL.
    StreamSwitch {
        channel_id: String,
        url: String,
        #[serde(default)]
        user_agent: Option<String>,
        requester: String,
        timestamp: f64,
    },
    /// The owner switched upstream.
    StreamSwitched {
        channel_id: String,
        url: String,
        #[serde(default)]
        stream_id: Option<i64>,
        reason: String,
        worker_id: String,
        timestamp: f64,
    },
    /// Tear the channel down everywhere.
    ChannelStop {
        channel_id: String,
        requester: String,
        timestamp: f64,
    },
    ChannelStopped {
        channel_id: String,
        worker_id: String,
        timestamp: f64,
    },
    /// Disconnect one client on whichever worker holds it.
    ClientStop {
        channel_id: String,
        client_id: String,
        requester: String,
        timestamp: f64,
    },
    ClientConnected {
        channel_id: String,
        client_id: String,
        worker_id: String,
        timestamp: f64,
    },
    ClientDisconnected {
        channel_id: String,
        client_id: String,
        worker_id: String,
        timestamp: f64,
    },
}

impl ChannelEvent {
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Self::StreamSwitch { channel_id, .. }
            | Self::StreamSwitched { channel_id, .. }
            | Self::ChannelStop { channel_id, .. }
            | Self::ChannelStopped { channel_id, .. }
            | Self::ClientStop { channel_id, .. }
            | Self::ClientConnected { channel_id, .. }
            | Self::ClientDisconnected { channel_id, .. } => channel_id,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StreamSwitch { .. } => "stream_switch",
            Self::StreamSwitched { .. } => "stream_switched",
            Self::ChannelStop { .. } => "channel_stop",
            Self::ChannelStopped { .. } => "channel_stopped",
            Self::ClientStop { .. } => "client_stop",
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected { .. } => "client_disconnected",
        }
    }
}

/// Publish an event on its channel's control topic.
pub async fn publish(store: &dyn RelayStore, event: &ChannelEvent) -> RelayResult<usize> {
    let payload = serde_json::to_string(event)?;
    let receivers = store.publish(event.channel_id(), &payload).await?;
    debug!(
        channel_id = event.channel_id(),
        event = event.name(),
        receivers,
        "Published control event"
    );
    Ok(receivers)
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: ChannelEvent);
}

enum SubscriberExit {
    /// Connected, then the subscription stream ended.
    Disconnected,
    ConnectFailed(RelayError),
    Cancelled,
}

/// Long-lived subscription to every channel's control topic.
///
/// Reconnects with exponential backoff (capped at 30s) whenever the
/// subscription drops, until cancelled.
pub struct EventListener {
    store: Arc<dyn RelayStore>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl EventListener {
    pub fn new(
        store: Arc<dyn RelayStore>,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            handler,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut attempt: u32 = 0;

        loop {
            match self.run_subscriber().await {
                SubscriberExit::Cancelled => {
                    info!("Event listener cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    // The server was reachable; start the backoff over
                    error!("Event subscription ended (connection lost), reconnecting");
                    attempt = 1;
                }
                SubscriberExit::ConnectFailed(e) => {
                    attempt = attempt.saturating_add(1);
                    error!(error = %e, attempt, "Event subscription failed, retrying after backoff");
                }
            }

            let delay = backoff_delay(attempt, INITIAL_BACKOFF, MAX_BACKOFF);
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Event listener cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let mut stream = match timeout(SUBSCRIBE_TIMEOUT, self.store.subscribe()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e),
            Err(_) => {
                return SubscriberExit::ConnectFailed(RelayError::Unavailable(
                    "timed out subscribing to control events".to_string(),
                ));
            }
        };
        info!(pattern = %self.store.keys().events_pattern(), "Listening for control events");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return SubscriberExit::Cancelled,
                message = stream.next() => {
                    let Some((channel_id, payload)) = message else {
                        return SubscriberExit::Disconnected;
                    };
                    match serde_json::from_str::<ChannelEvent>(&payload) {
                        Ok(event) => {
                            if event.channel_id() != channel_id {
                                warn!(
                                    topic = %channel_id,
                                    event_channel = event.channel_id(),
                                    "Event published on another channel's topic"
                                );
                            }
                            debug!(channel_id = %channel_id, event = event.name(), "Dispatching control event");
                            self.handler.handle_event(event).await;
                        }
                        Err(e) => {
                            warn!(error = %e, channel_id = %channel_id, payload = %payload, "Failed to parse control event");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChannelEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: ChannelEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_wire_format() {
        let event = ChannelEvent::StreamSwitch {
            channel_id: "c1".to_string(),
            url: "http://new/ts".to_string(),
            user_agent: None,
            requester: "w2".to_string(),
            timestamp: 1.5,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stream_switch");
        assert_eq!(json["channel_id"], "c1");
        assert_eq!(json["url"], "http://new/ts");

        let parsed: ChannelEvent = serde_json::from_str(
            r#"{"event":"client_stop","channel_id":"c1","client_id":"a","requester":"w1","timestamp":2.0}"#,
        )
        .unwrap();
        assert_eq!(parsed.name(), "client_stop");
        assert_eq!(parsed.channel_id(), "c1");
    }

    #[tokio::test]
    async fn test_listener_dispatches_and_skips_garbage() {
        let store: Arc<dyn RelayStore> = Arc::new(MemoryStore::default());
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let task = EventListener::new(store.clone(), recorder.clone(), cancel.clone()).spawn();

        // Let the listener subscribe before publishing
        while store.publish("c1", "not json").await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        let stop = ChannelEvent::ChannelStop {
            channel_id: "c1".to_string(),
            requester: "w1".to_string(),
            timestamp: 0.0,
        };
        publish(store.as_ref(), &stop).await.unwrap();

        for _ in 0..100 {
            if !recorder.events.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(recorder.events.lock().as_slice(), &[stop]);
    }
}
