//! CLI configuration surface (SPEC_FULL.md "Configuration"): exactly §6's
//! knobs (`mesh_id`, `mesh_id_seed`, `app_id`, beacon port, relay URL,
//! enabled-transports bitset) plus the ambient flags that govern only this
//! binary's own logging/debug surface, never core behavior.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use atmosphere_core::identity::default_data_dir;
use atmosphere_core::transport::lan::DEFAULT_BEACON_PORT;
use atmosphere_core::MeshConfig;

#[derive(Debug, Parser)]
#[command(name = "atmosphere-node", about = "Atmosphere mesh node host binary")]
pub struct CliArgs {
    /// Display name persisted into identity.json on first boot.
    #[arg(long, default_value = "atmosphere-node")]
    pub name: String,

    /// Mesh identifier. Persisted on first boot if not given again.
    #[arg(long, env = "ATMOSPHERE_MESH_ID")]
    pub mesh_id: Option<String>,

    /// Mesh shared-secret seed (§3: `shared_secret = SHA-256(mesh_id_seed)`).
    /// Persisted on first boot if not given again — treat as a credential.
    #[arg(long, env = "ATMOSPHERE_MESH_SEED")]
    pub mesh_id_seed: Option<String>,

    /// Application id; links whose `hello.app_id` disagrees are rejected.
    #[arg(long, env = "ATMOSPHERE_APP_ID", default_value = "atmosphere")]
    pub app_id: String,

    /// UDP beacon port for LAN peer discovery.
    #[arg(long, default_value_t = DEFAULT_BEACON_PORT)]
    pub beacon_port: u16,

    /// WebSocket relay URL, if the relay transport is enabled.
    #[arg(long, env = "ATMOSPHERE_RELAY_URL")]
    pub relay_url: Option<String>,

    #[arg(long, default_value_t = true)]
    pub lan: bool,

    #[arg(long, default_value_t = false)]
    pub ble: bool,

    #[arg(long = "wifi-aware", default_value_t = false)]
    pub wifi_aware: bool,

    #[arg(long, default_value_t = false)]
    pub relay: bool,

    /// Base directory for identity.json, the change log, and config.json.
    #[arg(long, env = "ATMOSPHERE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, env = "ATMOSPHERE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Bind the read-only debug HTTP surface (`/health`, `/peers`,
    /// `/capabilities`) here. Loopback-only is enforced by the caller;
    /// unset disables the surface entirely.
    #[arg(long, env = "ATMOSPHERE_DEBUG_HTTP_ADDR")]
    pub debug_http_addr: Option<SocketAddr>,
}

/// The subset of §6's configuration that is persisted to `config.json` on
/// first boot, mirroring `identity.json`'s "generate once, reuse after"
/// pattern so a redeployed node without CLI flags rejoins the same mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConfig {
    mesh_id: String,
    mesh_id_seed: String,
    app_id: String,
}

fn random_seed_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl CliArgs {
    /// Resolve CLI args plus `config.json` (generating one on first boot)
    /// into a core-ready `MeshConfig`.
    pub fn resolve(self) -> std::io::Result<MeshConfig> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| default_data_dir(&self.app_id));
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join("config.json");
        let persisted = match std::fs::read(&config_path) {
            Ok(bytes) => serde_json::from_slice::<PersistedConfig>(&bytes).ok(),
            Err(_) => None,
        };

        let mesh_id = self
            .mesh_id
            .or_else(|| persisted.as_ref().map(|p| p.mesh_id.clone()))
            .unwrap_or_else(|| "default".to_string());
        let mesh_id_seed = self
            .mesh_id_seed
            .or_else(|| persisted.as_ref().map(|p| p.mesh_id_seed.clone()))
            .unwrap_or_else(random_seed_hex);
        let app_id = self.app_id;

        if persisted
            .as_ref()
            .map(|p| p.mesh_id != mesh_id || p.mesh_id_seed != mesh_id_seed || p.app_id != app_id)
            .unwrap_or(true)
        {
            let to_write = PersistedConfig {
                mesh_id: mesh_id.clone(),
                mesh_id_seed: mesh_id_seed.clone(),
                app_id: app_id.clone(),
            };
            if let Ok(bytes) = serde_json::to_vec_pretty(&to_write) {
                let _ = std::fs::write(&config_path, bytes);
            }
        }

        Ok(MeshConfig {
            mesh_id,
            mesh_id_seed,
            app_id,
            beacon_port: self.beacon_port,
            relay_url: self.relay_url,
            transport_lan: self.lan,
            transport_ble: self.ble,
            transport_wifi_aware: self.wifi_aware,
            transport_relay: self.relay,
            data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(dir: &std::path::Path) -> CliArgs {
        CliArgs {
            name: "node-a".into(),
            mesh_id: None,
            mesh_id_seed: None,
            app_id: "atmosphere".into(),
            beacon_port: DEFAULT_BEACON_PORT,
            relay_url: None,
            lan: true,
            ble: false,
            wifi_aware: false,
            relay: false,
            data_dir: Some(dir.to_path_buf()),
            log_json: false,
            debug_http_addr: None,
        }
    }

    #[test]
    fn first_boot_generates_and_persists_a_seed() {
        let dir = tempfile::tempdir().unwrap();
        let first = base_args(dir.path()).resolve().unwrap();
        let second = base_args(dir.path()).resolve().unwrap();
        assert_eq!(first.mesh_id_seed, second.mesh_id_seed);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn explicit_mesh_id_overrides_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        base_args(dir.path()).resolve().unwrap();

        let mut args = base_args(dir.path());
        args.mesh_id = Some("other-mesh".to_string());
        let resolved = args.resolve().unwrap();
        assert_eq!(resolved.mesh_id, "other-mesh");
    }
}
