// tsrelay-livestream - MPEG-TS relay engine
//
// Architecture:
// - store/       - Shared state (Redis in production, in-memory for single workers and tests)
// - buffer       - Indexed chunk buffer and TS packet chunking
// - livestream/  - Upstream management, client delivery, channel coordination
// - events       - Cross-worker control events over pub/sub
// - catalog      - Channel -> stream resolution and failover alternates
// - status       - Channel diagnostics
//
// Exactly one worker per channel pulls the upstream; every worker serves
// clients from the shared buffer.

pub mod buffer;
pub mod catalog;
pub mod error;
pub mod events;
pub mod keys;
pub mod livestream;
pub mod model;
pub mod status;
pub mod store;
pub mod upstream;
pub mod util;

// Re-exports for convenience
pub use catalog::{Catalog, DeliveryProfile, StaticCatalog, StreamSource};
pub use error::{RelayError, RelayResult};
pub use events::{ChannelEvent, EventListener};
pub use keys::KeyBuilder;
pub use livestream::{ChannelContext, ChannelCoordinator, ChannelRole};
pub use store::{MemoryStore, RedisStore, RelayStore};
pub use upstream::{DefaultConnector, UpstreamConnector};
