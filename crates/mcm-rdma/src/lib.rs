//! RDMA (libfabric) transport: buffer pool, multi-endpoint
//! fan-out, CQ reactor and reorder reassembly.

pub mod buffer_pool;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod ops;
pub mod receive;
pub mod reorder;
pub mod transmit;

pub use buffer_pool::{Buffer, BufferPool, TRAILER_LEN};
pub use config::{EndpointAddr, Provider, RdmaConfig};
pub use device::RdmaDeviceHandle;
pub use endpoint::RdmaEndpoint;
pub use ops::{CqOps, DeviceOps, EndpointOps, Fabric, MrOps};
pub use receive::RdmaRx;
pub use reorder::ReorderRing;
pub use transmit::RdmaTx;
