//! Configuration for the wavepipe daemon.
//!
//! All fields are optional; a missing file means all-defaults. The socket
//! name resolution prefers the configured `core_name`, then the
//! `PIPEWIRE_CORE` environment variable, then the built-in default.
//!
//! ```rust
//! # use wavepipe_daemon::config::Config;
//! # let yaml = "
//! core_name: pw-test
//! device: hw:1,0
//! rate: 44100
//! channels: 2
//! period: 512
//! min_latency: 512
//! # ";
//! # serde_yaml::from_str::<Config>(yaml).unwrap();
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};

pub use wavepipe_core::protocol::{CORE_NAME_ENV, DEFAULT_CORE_NAME};

fn default_device() -> String {
    "hw:0,0".into()
}
fn default_rate() -> u32 {
    48000
}
fn default_channels() -> u32 {
    2
}
fn default_period() -> u32 {
    1024
}
fn default_min_latency() -> u32 {
    1024
}

/// Main configuration of the daemon
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Socket name below `$XDG_RUNTIME_DIR` (the `core.name` property)
    #[serde(default)]
    pub core_name: Option<String>,

    /// ALSA device to drive
    #[serde(default = "default_device")]
    pub device: String,

    /// Preferred sample rate
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Preferred channel count
    #[serde(default = "default_channels")]
    pub channels: u32,

    /// Target period size in frames
    #[serde(default = "default_period")]
    pub period: u32,

    /// Frames the I/O loop aims to keep in flight when no transport
    /// dictates a quantum
    #[serde(default = "default_min_latency")]
    pub min_latency: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_name: None,
            device: default_device(),
            rate: default_rate(),
            channels: default_channels(),
            period: default_period(),
            min_latency: default_min_latency(),
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file; `None` yields defaults
    pub fn load(path: Option<&Path>) -> DaemonResult<Config> {
        match path {
            Some(path) => {
                let file = std::fs::File::open(path).fault(Fault::Config)?;
                serde_yaml::from_reader(file).fault(Fault::Config)
            }
            None => Ok(Config::default()),
        }
    }

    /// The socket name the server should claim
    pub fn effective_core_name(&self) -> String {
        if let Some(name) = &self.core_name {
            return name.clone();
        }
        if let Ok(name) = std::env::var(CORE_NAME_ENV) {
            return name;
        }
        DEFAULT_CORE_NAME.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device, "hw:0,0");
        assert_eq!(config.rate, 48000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.period, 1024);
    }

    #[test]
    fn test_partial_yaml() {
        let config: Config = serde_yaml::from_str("device: hw:2,0").unwrap();
        assert_eq!(config.device, "hw:2,0");
        assert_eq!(config.rate, 48000);
        assert!(config.core_name.is_none());
    }

    #[test]
    fn test_core_name_prefers_config() {
        let mut config = Config::default();
        config.core_name = Some("pw-test".into());
        assert_eq!(config.effective_core_name(), "pw-test");
    }
}
