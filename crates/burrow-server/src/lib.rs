//! Burrow tunnel server library
//!
//! Accepts public HTTP requests, forwards each one as a plain-text dump over
//! a message bus to the tunnel client named by the request's host, and
//! writes the client's raw reply back onto the caller's connection.
//!
//! The server can be embedded in other applications or driven in tests with
//! the in-process [`LocalBus`].

mod bus;
mod config;
mod correlator;
mod http_plane;
mod local_bus;
mod mqtt;
mod relay;
mod state;

// Re-export public types
pub use bus::{BusError, MessageBus};
pub use config::{BrokerAddress, Overrides, ResolvedServerConfig, ServerConfig};
pub use correlator::{CorrelateError, Correlator, Outcome, WaitPolicy};
pub use http_plane::{HttpPlane, ServeLimits};
pub use local_bus::LocalBus;
pub use mqtt::{MqttBus, MqttSettings};
pub use relay::{relay, takeover_io, RelayError, TakenConn, Takeover, TakeoverIo};
pub use state::{MessageHandler, Removal, SubscriptionId, SubscriptionRegistry};
