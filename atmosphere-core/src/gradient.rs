//! Gradient table (§4.G): a ranked, read-only projection over the reserved
//! `_capabilities` collection. Ranking itself is the host's affair; the
//! core only guarantees the three properties named in §4.G.

use serde::{Deserialize, Serialize};

use crate::mux::Multiplexer;
use crate::store::Store;

pub const CAPABILITIES_COLLECTION: &str = "_capabilities";

/// The payload shape a capability document is expected to carry. The core
/// does not interpret `payload` in general (§3), but the gradient table
/// needs a known shape to project — this is the one place the reserved
/// collection's contents are not fully opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityPayload {
    pub label: String,
    #[serde(default)]
    pub hops: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEntry {
    pub capability_id: String,
    pub peer_id: String,
    pub label: String,
    pub hops: u32,
    pub last_rtt_ms: Option<f64>,
    pub local: bool,
    pub payload: serde_json::Value,
    /// (ii): entries for peers with no `READY` link are marked stale.
    pub stale: bool,
}

/// Project `_capabilities` into a ranked list. (i) is satisfied by reading
/// the store's already-merged-atomically projection; (iii) falls out of
/// `Store::list` excluding tombstones on the same read.
pub fn project(store: &Store, mux: &Multiplexer, local_peer_id: &str) -> anyhow::Result<Vec<CapabilityEntry>> {
    let docs = store.list(CAPABILITIES_COLLECTION)?;
    let mut entries = Vec::with_capacity(docs.len());
    for doc in docs {
        let parsed: Result<CapabilityPayload, _> = serde_json::from_slice(&doc.payload);
        let (label, hops) = match &parsed {
            Ok(p) => (p.label.clone(), p.hops),
            Err(_) => (doc.doc_id.clone(), 0),
        };
        let is_local = doc.version.peer_id == local_peer_id;
        let ready = is_local || mux.has_ready_link(&doc.version.peer_id);
        let rtt: Option<f64> = if is_local {
            None
        } else {
            mux.selected_link_rtt(&doc.version.peer_id)
        };
        entries.push(CapabilityEntry {
            capability_id: doc.doc_id,
            peer_id: doc.version.peer_id.clone(),
            label,
            hops,
            last_rtt_ms: rtt,
            local: is_local,
            payload: serde_json::from_slice(&doc.payload).unwrap_or(serde_json::Value::Null),
            stale: !ready,
        });
    }
    entries.sort_by(|a, b| a.hops.cmp(&b.hops).then(a.capability_id.cmp(&b.capability_id)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_capability_is_never_stale() {
        let store = Store::open_in_memory("local").unwrap();
        let mux = Multiplexer::new("local", "atmosphere");
        let payload = serde_json::to_vec(&CapabilityPayload { label: "echo".into(), hops: 0 }).unwrap();
        store.put(CAPABILITIES_COLLECTION, "cap-1", payload).unwrap();

        let entries = project(&store, &mux, "local").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].local);
        assert!(!entries[0].stale);
    }

    #[test]
    fn remote_capability_without_ready_link_is_stale() {
        let store = Store::open_in_memory("local").unwrap();
        let mux = Multiplexer::new("local", "atmosphere");
        let payload = serde_json::to_vec(&CapabilityPayload { label: "infer".into(), hops: 1 }).unwrap();
        store
            .merge(
                CAPABILITIES_COLLECTION,
                "cap-2",
                crate::store::Version { logical_clock: 1, peer_id: "remote".into() },
                payload,
                false,
                "remote",
            )
            .unwrap();

        let entries = project(&store, &mux, "local").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].local);
        assert!(entries[0].stale, "no READY link to remote yet");
    }

    #[test]
    fn tombstoned_capability_disappears_on_same_commit() {
        let store = Store::open_in_memory("local").unwrap();
        let mux = Multiplexer::new("local", "atmosphere");
        let payload = serde_json::to_vec(&CapabilityPayload { label: "echo".into(), hops: 0 }).unwrap();
        store.put(CAPABILITIES_COLLECTION, "cap-1", payload).unwrap();
        store.tombstone(CAPABILITIES_COLLECTION, "cap-1").unwrap();

        let entries = project(&store, &mux, "local").unwrap();
        assert!(entries.is_empty());
    }
}
