//! ST 2110-20/22/30 transport: connection pair built against
//! a pipeline trait standing in for the external media pipeline library.

pub mod config;
pub mod connection;
pub mod device;
pub mod pipeline;

pub use config::{AudioParams, Direction, SessionConfig, TransportKind, VideoParams};
pub use connection::{St2110Rx, St2110Tx};
pub use device::St2110DeviceHandle;
pub use pipeline::{DeviceOps, FrameData, FrameToken, Pipeline, SessionOps, SessionToken};
