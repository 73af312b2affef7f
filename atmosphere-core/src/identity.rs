//! Peer identity and mesh identity (§3).
//!
//! A peer's `peer_id` is a stable 256-bit value generated once and persisted
//! to `identity.json` under the host-supplied data directory; a missing file
//! starts a fresh peer with a new id, matching §6's "files MUST be safe to
//! delete" requirement.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub peer_id: String,
    pub name: String,
}

impl Identity {
    /// Load `identity.json` from `dir`, or generate and persist a fresh one.
    pub fn load_or_create(dir: &Path, default_name: &str) -> std::io::Result<Self> {
        let path = dir.join("identity.json");
        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(identity) = serde_json::from_slice::<Identity>(&bytes) {
                return Ok(identity);
            }
            tracing::warn!(path = %path.display(), "identity.json unreadable, regenerating");
        }
        std::fs::create_dir_all(dir)?;
        let identity = Identity {
            peer_id: generate_peer_id(),
            name: default_name.to_string(),
        };
        let data = serde_json::to_vec_pretty(&identity).expect("identity serializes");
        std::fs::write(&path, data)?;
        Ok(identity)
    }
}

/// A fresh random 256-bit peer id, hex-encoded.
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mesh identity: a name plus the 32-byte secret derived from its seed (§3).
#[derive(Debug, Clone)]
pub struct MeshIdentity {
    pub mesh_id: String,
    pub shared_secret: [u8; 32],
}

impl MeshIdentity {
    /// `shared_secret = SHA-256(mesh_id_seed)`, fixed per §3.
    pub fn derive(mesh_id: impl Into<String>, mesh_id_seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(mesh_id_seed.as_bytes());
        let digest = hasher.finalize();
        let mut shared_secret = [0u8; 32];
        shared_secret.copy_from_slice(&digest);
        Self {
            mesh_id: mesh_id.into(),
            shared_secret,
        }
    }
}

/// Default data directory used when the host does not supply one.
pub fn default_data_dir(app_id: &str) -> PathBuf {
    std::env::temp_dir().join("atmosphere").join(app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = MeshIdentity::derive("m", "seed-1");
        let b = MeshIdentity::derive("m", "seed-1");
        assert_eq!(a.shared_secret, b.shared_secret);
    }

    #[test]
    fn derive_differs_per_seed() {
        let a = MeshIdentity::derive("m", "seed-1");
        let b = MeshIdentity::derive("m", "seed-2");
        assert_ne!(a.shared_secret, b.shared_secret);
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = Identity::load_or_create(dir.path(), "node").unwrap();
        let second = Identity::load_or_create(dir.path(), "node").unwrap();
        assert_eq!(first.peer_id, second.peer_id);
    }

    #[test]
    fn missing_file_starts_fresh_peer() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = Identity::load_or_create(dir_a.path(), "node").unwrap();
        let b = Identity::load_or_create(dir_b.path(), "node").unwrap();
        assert_ne!(a.peer_id, b.peer_id);
    }
}
