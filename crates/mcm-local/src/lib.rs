//! Local (shared-memory ring) connections bridging an on-host application
//! into the media proxy's connection graph.

pub mod gateway;
pub mod local;
pub mod ring;

pub use gateway::{GatewayConfig, GatewayRx, GatewayTx};
pub use local::{LocalRx, LocalTx};
pub use ring::{Frame, RingPort};
