//! `serde` + `toml`-backed configuration for the knobs the core itself owns:
//! the supernode list, resolver timing, replay-stamp tolerances, and slot
//! reactor sizing. Tap/crypto/packet-protocol configuration is out of scope —
//! that belongs to the consumer (edge or supernode process) wiring this
//! crate together.

use std::path::Path;

use serde::Deserialize;

use crate::clock::{TIME_STAMP_FRAME, TIME_STAMP_JITTER};
use crate::error::Error;
use crate::resolver::{N2N_RESOLVE_CHECK_INTERVAL, N2N_RESOLVE_INTERVAL};

#[derive(Debug, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub reactor: ReactorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ResolverConfig {
    /// `host:port` strings, one per supernode.
    #[serde(default)]
    pub supernodes: Vec<String>,

    #[serde(default = "default_resolve_interval")]
    pub resolve_interval_secs: u64,

    #[serde(default = "default_resolve_check_interval")]
    pub resolve_check_interval_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            supernodes: Vec::new(),
            resolve_interval_secs: default_resolve_interval(),
            resolve_check_interval_secs: default_resolve_check_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_time_stamp_frame")]
    pub time_stamp_frame: u64,

    #[serde(default = "default_time_stamp_jitter")]
    pub time_stamp_jitter: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            time_stamp_frame: default_time_stamp_frame(),
            time_stamp_jitter: default_time_stamp_jitter(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReactorConfig {
    #[serde(default = "default_slots")]
    pub slots: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_request_max")]
    pub request_max: usize,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Path for an additional unix local socket listener. Ignored on
    /// non-unix targets.
    pub local_socket_path: Option<String>,
    pub local_socket_mode: Option<u32>,
    pub local_socket_uid: Option<u32>,
    pub local_socket_gid: Option<u32>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            idle_timeout_secs: default_idle_timeout(),
            request_max: default_request_max(),
            listen_port: default_listen_port(),
            local_socket_path: None,
            local_socket_mode: None,
            local_socket_uid: None,
            local_socket_gid: None,
        }
    }
}

fn default_resolve_interval() -> u64 {
    N2N_RESOLVE_INTERVAL
}

fn default_resolve_check_interval() -> u64 {
    N2N_RESOLVE_CHECK_INTERVAL
}

fn default_time_stamp_frame() -> u64 {
    TIME_STAMP_FRAME
}

fn default_time_stamp_jitter() -> u64 {
    TIME_STAMP_JITTER
}

fn default_slots() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_request_max() -> usize {
    16 * 1024
}

fn default_listen_port() -> u16 {
    5645
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            replay: ReplayConfig::default(),
            reactor: ReactorConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|source| Error::ConfigParse { source })
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead { source })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_module_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.resolver.resolve_interval_secs, N2N_RESOLVE_INTERVAL);
        assert_eq!(cfg.reactor.slots, 64);
        assert!(cfg.resolver.supernodes.is_empty());
    }

    #[test]
    fn parses_partial_toml_with_defaults_filled_in() {
        let toml = r#"
            [resolver]
            supernodes = ["super1.example.org:7654", "super2.example.org:7654"]
        "#;
        let cfg = CoreConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.resolver.supernodes.len(), 2);
        assert_eq!(cfg.resolver.resolve_check_interval_secs, N2N_RESOLVE_CHECK_INTERVAL);
        assert_eq!(cfg.reactor.listen_port, 5645);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = CoreConfig::from_toml_str("not = [valid").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
        assert_eq!(err.code(), -9);
    }

    #[test]
    fn missing_file_is_a_config_read_error() {
        let err = CoreConfig::from_path(Path::new("/nonexistent/n3n-core-test.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
        assert_eq!(err.code(), -8);
    }
}
