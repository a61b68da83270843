//! Session configuration for an ST 2110 connection, grounded
//! on the donor's `MeshConfig_ST2110`/`MeshConfig_Video`/`MeshConfig_Audio`
//! structs as populated by `st2110_20tx.cc`/`st2110_30tx.cc` and their
//! `*rx.cc` counterparts.

use mcm_core::{McmError, Result};

/// Which ST 2110 payload type a session carries. Distinct transports
/// differ only in their `SessionConfig` payload (video vs audio
/// parameters); the connection and pipeline code is shared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// ST 2110-20: uncompressed video.
    St2110_20,
    /// ST 2110-22: constant-bitrate-compressed (JPEG XS) video.
    St2110_22,
    /// ST 2110-30: PCM audio.
    St2110_30,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Clone, Debug)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: String,
}

#[derive(Clone, Debug)]
pub struct AudioParams {
    pub channels: u32,
    pub sample_rate: u32,
    pub format: String,
    pub packet_time_us: u32,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub kind: TransportKind,
    pub direction: Direction,
    pub dev_port: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
    /// Frame buffer count the pipeline holds per session (donor default: 4).
    pub framebuff_cnt: u32,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            TransportKind::St2110_20 | TransportKind::St2110_22 => {
                let Some(video) = &self.video else {
                    return Err(McmError::bad_argument("st2110.config.validate"));
                };
                if video.width == 0 || video.height == 0 || video.fps == 0 {
                    return Err(McmError::bad_argument("st2110.config.validate"));
                }
            }
            TransportKind::St2110_30 => {
                let Some(audio) = &self.audio else {
                    return Err(McmError::bad_argument("st2110.config.validate"));
                };
                if audio.channels == 0 || audio.sample_rate == 0 {
                    return Err(McmError::bad_argument("st2110.config.validate"));
                }
            }
        }
        if self.framebuff_cnt == 0 {
            return Err(McmError::bad_argument("st2110.config.validate"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_cfg(direction: Direction) -> SessionConfig {
        SessionConfig {
            kind: TransportKind::St2110_20,
            direction,
            dev_port: "0000:4b:01.0".into(),
            local_ip: "192.168.1.21".into(),
            local_port: 20000,
            remote_ip: "192.168.1.22".into(),
            remote_port: 20000,
            video: Some(VideoParams {
                width: 1920,
                height: 1080,
                fps: 60,
                pixel_format: "yuv422p10le".into(),
            }),
            audio: None,
            framebuff_cnt: 4,
        }
    }

    #[test]
    fn valid_video_config_passes() {
        assert!(video_cfg(Direction::Tx).validate().is_ok());
    }

    #[test]
    fn zero_dimension_video_is_rejected() {
        let mut cfg = video_cfg(Direction::Tx);
        cfg.video.as_mut().unwrap().width = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn audio_kind_without_audio_params_is_rejected() {
        let mut cfg = video_cfg(Direction::Rx);
        cfg.kind = TransportKind::St2110_30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_framebuff_cnt_is_rejected() {
        let mut cfg = video_cfg(Direction::Tx);
        cfg.framebuff_cnt = 0;
        assert!(cfg.validate().is_err());
    }
}
