//! Session request/reply wire types, grounded on the
//! donor's `media_proxy.cc` control handlers: a request carries direction,
//! endpoint addresses and a payload-type-specific parameter block; a reply
//! is either the assigned session id or the literal `Failed`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `media_proxy.cc`'s two-shape reply: either the session id or the
/// literal `Failed`, with `Display` rendering exactly those two forms so a
/// thin gRPC/TCP adapter can forward it byte-for-byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionReply {
    Accepted(SessionId),
    Failed,
}

impl fmt::Display for SessionReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(id) => write!(f, "{id}"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    St20Video,
    St22Video,
    St30Audio,
    St40Ancillary,
    RdmaVideo,
    RtspVideo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointAddr {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pix_fmt: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioParams {
    pub channels: u32,
    pub sample_rate: u32,
    pub format: String,
    pub packet_time: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RdmaParams {
    pub transfer_size: usize,
    pub queue_size: usize,
    pub provider: String,
    pub num_endpoints: u8,
}

/// One of the three payload-type-specific parameter blocks carried on a
/// session request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportParams {
    Video(VideoParams),
    Audio(AudioParams),
    Rdma(RdmaParams),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRequest {
    pub local_addr: EndpointAddr,
    pub remote_addr: EndpointAddr,
    pub payload_type: PayloadType,
    pub params: TransportParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_reply_renders_id_or_failed() {
        assert_eq!(SessionReply::Accepted(SessionId(7)).to_string(), "7");
        assert_eq!(SessionReply::Failed.to_string(), "Failed");
    }

    #[test]
    fn session_request_round_trips_through_json() {
        let request = SessionRequest {
            local_addr: EndpointAddr {
                ip: "192.168.1.20".into(),
                port: 9001,
            },
            remote_addr: EndpointAddr {
                ip: "192.168.1.21".into(),
                port: 9001,
            },
            payload_type: PayloadType::RdmaVideo,
            params: TransportParams::Rdma(RdmaParams {
                transfer_size: 1200,
                queue_size: 16,
                provider: "verbs".into(),
                num_endpoints: 2,
            }),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: SessionRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.local_addr.port, 9001);
    }
}
