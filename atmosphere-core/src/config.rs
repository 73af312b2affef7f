//! Configuration surface (§6): compile-time or first-boot only. No runtime
//! knobs beyond what's listed here reach the core itself — ambient CLI
//! flags (log format, debug HTTP bind address) live in `atmosphere-cli`,
//! not here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::transport::lan::DEFAULT_BEACON_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledTransports {
    pub lan: bool,
    pub ble: bool,
    pub wifi_aware: bool,
    pub relay: bool,
}

impl Default for EnabledTransports {
    fn default() -> Self {
        Self {
            lan: true,
            ble: false,
            wifi_aware: false,
            relay: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub mesh_id: String,
    pub mesh_id_seed: String,
    pub app_id: String,
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_lan")]
    pub transport_lan: bool,
    #[serde(default)]
    pub transport_ble: bool,
    #[serde(default)]
    pub transport_wifi_aware: bool,
    #[serde(default)]
    pub transport_relay: bool,
    pub data_dir: PathBuf,
}

fn default_beacon_port() -> u16 {
    DEFAULT_BEACON_PORT
}

fn default_lan() -> bool {
    true
}

impl MeshConfig {
    pub fn enabled_transports(&self) -> EnabledTransports {
        EnabledTransports {
            lan: self.transport_lan,
            ble: self.transport_ble,
            wifi_aware: self.transport_wifi_aware,
            relay: self.transport_relay,
        }
    }
}
