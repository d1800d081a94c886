//! Process configuration (§6 "Configuration (config file)"): loaded from environment
//! variables with documented defaults, the way the secondary example repo's `cli.rs`
//! builds a `Default`-with-override config rather than a file-format parser — the spec
//! documents only env-style keys, so none is added here.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub enable_server_speaker: bool,
    pub http_port: u16,
    pub web_port: u16,
    pub discovery_interval_s: u64,
    pub buffer_gate_bytes: u64,
    pub cache_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enable_server_speaker: false,
            http_port: 8088,
            web_port: 8089,
            discovery_interval_s: 30,
            buffer_gate_bytes: 102_400,
            cache_dir: PathBuf::from("cache"),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            enable_server_speaker: env_bool("ENABLE_SERVER_SPEAKER", default.enable_server_speaker),
            http_port: env_parsed("HTTP_PORT", default.http_port),
            web_port: env_parsed("WEB_PORT", default.web_port),
            discovery_interval_s: env_parsed("DISCOVERY_INTERVAL_S", default.discovery_interval_s),
            buffer_gate_bytes: env_parsed("BUFFER_GATE_BYTES", default.buffer_gate_bytes),
            cache_dir: std::env::var("CACHE_DIR").map(PathBuf::from).unwrap_or(default.cache_dir),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.http_port, 8088);
        assert_eq!(cfg.web_port, 8089);
        assert_eq!(cfg.discovery_interval_s, 30);
        assert_eq!(cfg.buffer_gate_bytes, 102_400);
        assert!(!cfg.enable_server_speaker);
    }
}
