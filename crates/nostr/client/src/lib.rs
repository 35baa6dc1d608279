//! Multiplexing Nostr relay client.
//!
//! One [`RelayPool`] supervises many relay connections and presents them as a
//! single logical relay:
//! - subscriptions fan out to every readable relay, EOSE is aggregated and
//!   filters are resumed on relays that reconnect
//! - publishes fan out to every writable relay and collect one result per relay
//! - [`Plugin`]s observe publishes, filter requests and inbound events

pub mod command;
pub mod config;
pub mod error;
pub mod message;
pub mod plugin;
pub mod pool;
pub mod relay;
pub mod relay_url;
pub mod subscription;
mod timer;
pub mod transport;

pub use command::{CommandAck, CommandTracker, PublishOptions};
pub use config::FileConfig;
pub use error::{ClientError, Result};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use plugin::Plugin;
pub use pool::{PoolConfig, RelayPool, RelayStatus};
pub use relay::{ConnectionState, RelayConfig, RelayConnection, RelayPermission};
pub use relay_url::RelayUrl;
pub use subscription::{
    BufferOptions, EventCallback, ReceivedEvent, SubscribeOptions, SubscriptionUpdate,
};
pub use transport::{
    ConnectBehavior, MemorySession, MemoryTransport, Transport, TransportChannel, TransportFrame,
    WebSocketTransport,
};
