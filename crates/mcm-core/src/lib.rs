//! Connection graph primitives shared by every transport in the media proxy:
//! the cancellation-aware [`Context`](context::Context), a bounded blocking
//! [`Channel`](channel::Channel), the [`Connection`](connection::Connection)
//! state machine and link graph, and the [`EventBroker`](broker::EventBroker).

pub mod broker;
pub mod channel;
pub mod connection;
pub mod context;
pub mod error;
pub mod metrics;

pub use channel::Channel;
pub use connection::{wrap, Connection, ConnectionBase, Kind, State};
pub use context::Context;
pub use error::{McmError, Result};
pub use metrics::Metrics;
