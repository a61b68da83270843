//! Process-wide configuration assembled from CLI flags and the ST 2110
//! device config file.

use std::path::{Path, PathBuf};

use mcm_core::{McmError, Result};

const CTX_LOAD: &str = "config.load";
const DEFAULT_CFG_PATH: &str = "/usr/local/etc/imtl.json";
const CFG_PATH_ENV: &str = "KAHAWAI_CFG_PATH";

/// Everything the proxy needs to start: the parsed CLI flags plus the
/// opaque device config blob handed straight to the ST 2110 pipeline
/// library, which owns its own schema.
pub struct ProxyConfig {
    pub dev: String,
    pub ip: String,
    pub grpc_port: u16,
    pub tcp_port: u16,
    pub device_config: serde_json::Value,
}

impl ProxyConfig {
    pub fn load(cli: crate::cli::Cli) -> Result<Self> {
        let path = std::env::var(CFG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CFG_PATH));
        let device_config = load_device_config(&path)?;
        Ok(Self {
            dev: cli.dev,
            ip: cli.ip,
            grpc_port: cli.grpc,
            tcp_port: cli.tcp,
            device_config,
        })
    }
}

fn load_device_config(path: &Path) -> Result<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| McmError::InitializationFailed {
            context: CTX_LOAD,
            source: Some(Box::new(e)),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "device config file not found, proceeding with defaults");
            Ok(serde_json::Value::Object(serde_json::Map::new()))
        }
        Err(err) => Err(McmError::InitializationFailed {
            context: CTX_LOAD,
            source: Some(Box::new(err)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_config_falls_back_to_empty_object() {
        let config = load_device_config(Path::new("/nonexistent/path/does-not-exist.json")).unwrap();
        assert_eq!(config, serde_json::json!({}));
    }
}
