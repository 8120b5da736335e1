pub mod client_manager;
pub mod coordinator;
pub mod generator;
pub mod stream_manager;

pub use client_manager::{ClientManager, ClientSession, LocalClient, Removal};
pub use coordinator::{ChannelCoordinator, ChannelRole, LocalHealth, SwitchOutcome};
pub use generator::{ClientSender, ClientStream, DeliveryExit};
pub use stream_manager::{StreamCommand, StreamManager, StreamOutcome};

use std::sync::Arc;

use tsrelay_core::config::ProxyConfig;

use crate::catalog::Catalog;
use crate::store::RelayStore;
use crate::upstream::UpstreamConnector;

/// Everything a worker's channel machinery shares.
#[derive(Clone)]
pub struct ChannelContext {
    pub worker_id: String,
    pub store: Arc<dyn RelayStore>,
    pub catalog: Arc<dyn Catalog>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub config: ProxyConfig,
}
