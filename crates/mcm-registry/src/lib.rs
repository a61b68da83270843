//! Session registry and control-plane request types:
//! the layer that turns a control-plane request into a linked pair of
//! connections from `mcm-local`/`mcm-rdma`/`mcm-st2110`.

pub mod control;
pub mod registry;
pub mod request;

pub use control::{serve_tcp, ControlPlane, WireRequest};
pub use mcm_core::broker::{EventBroker, EventBrokerHandle, EventKind};
pub use registry::{FabricFactory, PipelineFactory, RingFactory, SessionRegistry};
pub use request::{
    AudioParams, EndpointAddr, PayloadType, RdmaParams, SessionId, SessionReply, SessionRequest,
    TransportParams, VideoParams,
};
