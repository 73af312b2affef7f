//! CRDT document store (§4.B).
//!
//! Each document carries a `(logical_clock, peer_id)` version pair; merge
//! accepts a candidate iff it strictly dominates the stored version under
//! the total order of §3 (higher clock wins, ties broken by lexicographic
//! `peer_id`). The change log is the durable source of truth; the document
//! table is a projection rebuilt from it on start, mirroring the teacher's
//! `ClusterDoc` shape (mutex-guarded state, metrics struct) but built around
//! this explicit version-pair model instead of an op-based CRDT.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// `version` is `(logical_clock, peer_id)` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub logical_clock: i64,
    pub peer_id: String,
}

impl Version {
    /// Total order: higher `logical_clock` wins; ties broken by
    /// lexicographic `peer_id` (§3). A candidate "dominates" `self` iff it
    /// compares greater under this order.
    pub fn dominates(&self, other: &Version) -> bool {
        (self.logical_clock, &self.peer_id) > (other.logical_clock, &other.peer_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub doc_id: String,
    pub version: Version,
    pub last_writer: String,
    pub payload: Vec<u8>,
    pub tombstone: bool,
}

/// Append-only log entry (§3). `seq` is a per-peer dense sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub collection: String,
    pub doc_id: String,
    pub version: Version,
    pub payload: Vec<u8>,
    pub tombstone: bool,
    pub source: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreMetrics {
    pub puts: u64,
    pub merges_accepted: u64,
    pub merges_rejected: u64,
    pub doc_count: u64,
}

/// One per-collection writer lock, acquired only for the duration of a
/// single `put`/`merge` (§4.B concurrency).
struct CollectionLock;

pub struct Store {
    local_peer_id: String,
    conn: Mutex<Connection>,
    /// Per-peer next sequence number, monotonic and dense.
    next_seq: Mutex<HashMap<String, u64>>,
    /// Highest logical clock observed for any document, used to ensure a
    /// local write's clock is at least `max(seen)+1` even across documents.
    local_clock_floor: AtomicI64,
    /// Per-collection lock so readers of other collections never block.
    collection_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<CollectionLock>>>>,
    metrics: Mutex<StoreMetrics>,
    observers: Mutex<Vec<Box<dyn Fn(&ChangeRecord) + Send + Sync>>>,
}

impl Store {
    /// Open (or create) a durable store rooted at `path`. The log and
    /// projection live in the same SQLite file; a missing file starts a
    /// fresh, empty store (§6 "files MUST be safe to delete").
    pub fn open(path: &Path, local_peer_id: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Index(e.to_string()))?;
        Self::init_schema(&conn)?;
        let store = Self {
            local_peer_id: local_peer_id.into(),
            conn: Mutex::new(conn),
            next_seq: Mutex::new(HashMap::new()),
            local_clock_floor: AtomicI64::new(0),
            collection_locks: Mutex::new(HashMap::new()),
            metrics: Mutex::new(StoreMetrics::default()),
            observers: Mutex::new(Vec::new()),
        };
        store.rebuild_from_log()?;
        Ok(store)
    }

    /// In-memory store for tests; never persisted.
    pub fn open_in_memory(local_peer_id: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Index(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            local_peer_id: local_peer_id.into(),
            conn: Mutex::new(conn),
            next_seq: Mutex::new(HashMap::new()),
            local_clock_floor: AtomicI64::new(0),
            collection_locks: Mutex::new(HashMap::new()),
            metrics: Mutex::new(StoreMetrics::default()),
            observers: Mutex::new(Vec::new()),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS changes (
                source      TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                collection  TEXT NOT NULL,
                doc_id      TEXT NOT NULL,
                clock       INTEGER NOT NULL,
                version_peer TEXT NOT NULL,
                payload     BLOB NOT NULL,
                tombstone   INTEGER NOT NULL,
                PRIMARY KEY (source, seq)
            );
            CREATE TABLE IF NOT EXISTS documents (
                collection  TEXT NOT NULL,
                doc_id      TEXT NOT NULL,
                clock       INTEGER NOT NULL,
                version_peer TEXT NOT NULL,
                last_writer TEXT NOT NULL,
                payload     BLOB NOT NULL,
                tombstone   INTEGER NOT NULL,
                PRIMARY KEY (collection, doc_id)
            );
            ",
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Rebuild the `documents` projection from `changes`, as permitted by
    /// §4.B ("the projection is a cache that MAY be rebuilt from the log").
    fn rebuild_from_log(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT source, seq, collection, doc_id, clock, version_peer, payload, tombstone FROM changes ORDER BY source, seq")
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChangeRecord {
                    source: row.get(0)?,
                    seq: row.get::<_, i64>(1)? as u64,
                    collection: row.get(2)?,
                    doc_id: row.get(3)?,
                    version: Version {
                        logical_clock: row.get(4)?,
                        peer_id: row.get(5)?,
                    },
                    payload: row.get(6)?,
                    tombstone: row.get::<_, i64>(7)? != 0,
                })
            })
            .map_err(|e| StoreError::Index(e.to_string()))?;

        let mut next_seq = self.next_seq.lock();
        let mut max_clock = 0i64;
        for row in rows {
            let record = row.map_err(|e| StoreError::Corrupt(e.to_string()))?;
            max_clock = max_clock.max(record.version.logical_clock);
            let entry = next_seq.entry(record.source.clone()).or_insert(0);
            *entry = (*entry).max(record.seq + 1);
            Self::apply_to_projection(&conn, &record)?;
        }
        drop(next_seq);
        self.local_clock_floor.fetch_max(max_clock, Ordering::SeqCst);
        Ok(())
    }

    fn apply_to_projection(conn: &Connection, record: &ChangeRecord) -> Result<(), StoreError> {
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT clock, version_peer FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![record.collection, record.doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::Index(e.to_string()))?;

        let dominates = match &existing {
            None => true,
            Some((clock, peer)) => {
                (record.version.logical_clock, &record.version.peer_id) > (*clock, peer)
            }
        };
        if !dominates {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO documents (collection, doc_id, clock, version_peer, last_writer, payload, tombstone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(collection, doc_id) DO UPDATE SET
                clock = excluded.clock,
                version_peer = excluded.version_peer,
                last_writer = excluded.last_writer,
                payload = excluded.payload,
                tombstone = excluded.tombstone",
            params![
                record.collection,
                record.doc_id,
                record.version.logical_clock,
                record.version.peer_id,
                record.source,
                record.payload,
                record.tombstone as i64,
            ],
        )
        .map_err(|e| StoreError::Index(e.to_string()))?;
        Ok(())
    }

    fn lock_for(&self, collection: &str) -> std::sync::Arc<Mutex<CollectionLock>> {
        self.collection_locks
            .lock()
            .entry(collection.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(CollectionLock)))
            .clone()
    }

    fn append_and_project(&self, record: ChangeRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO changes (source, seq, collection, doc_id, clock, version_peer, payload, tombstone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.source,
                record.seq as i64,
                record.collection,
                record.doc_id,
                record.version.logical_clock,
                record.version.peer_id,
                record.payload,
                record.tombstone as i64,
            ],
        )
        .map_err(|e| StoreError::LogWrite(e.to_string()))?;
        Self::apply_to_projection(&conn, &record)?;
        drop(conn);
        for observer in self.observers.lock().iter() {
            observer(&record);
        }
        Ok(())
    }

    /// `put(collection, doc_id, payload) → version` (§4.B).
    pub fn put(
        &self,
        collection: &str,
        doc_id: &str,
        payload: Vec<u8>,
    ) -> Result<Version, StoreError> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock();

        let existing_clock = self
            .conn
            .lock()
            .query_row(
                "SELECT clock FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| StoreError::Index(e.to_string()))?
            .unwrap_or(0);

        let floor = self.local_clock_floor.load(Ordering::SeqCst);
        let logical_clock = existing_clock.max(floor) + 1;
        self.local_clock_floor.fetch_max(logical_clock, Ordering::SeqCst);

        let seq = {
            let mut next_seq = self.next_seq.lock();
            let entry = next_seq.entry(self.local_peer_id.clone()).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };

        let version = Version {
            logical_clock,
            peer_id: self.local_peer_id.clone(),
        };
        let record = ChangeRecord {
            seq,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            version,
            payload,
            tombstone: false,
            source: self.local_peer_id.clone(),
        };
        self.append_and_project(record)?;
        self.metrics.lock().puts += 1;
        Ok(version)
    }

    /// Tombstone a document: empty payload, `tombstone` flag set, version
    /// advanced the same way as `put` (§3).
    pub fn tombstone(&self, collection: &str, doc_id: &str) -> Result<Version, StoreError> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock();
        let existing_clock = self
            .conn
            .lock()
            .query_row(
                "SELECT clock FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| StoreError::Index(e.to_string()))?
            .unwrap_or(0);
        let floor = self.local_clock_floor.load(Ordering::SeqCst);
        let logical_clock = existing_clock.max(floor) + 1;
        self.local_clock_floor.fetch_max(logical_clock, Ordering::SeqCst);
        let seq = {
            let mut next_seq = self.next_seq.lock();
            let entry = next_seq.entry(self.local_peer_id.clone()).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };
        let version = Version {
            logical_clock,
            peer_id: self.local_peer_id.clone(),
        };
        let record = ChangeRecord {
            seq,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            version,
            payload: Vec::new(),
            tombstone: true,
            source: self.local_peer_id.clone(),
        };
        self.append_and_project(record)?;
        Ok(version)
    }

    /// `merge(collection, doc_id, version, payload, tombstone, source) →
    /// accepted` (§4.B). Accepts iff `version` strictly dominates the
    /// current stored version; otherwise drops silently — never an error.
    pub fn merge(
        &self,
        collection: &str,
        doc_id: &str,
        version: Version,
        payload: Vec<u8>,
        tombstone: bool,
        source: &str,
    ) -> Result<bool, StoreError> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock();

        let existing: Option<Version> = self
            .conn
            .lock()
            .query_row(
                "SELECT clock, version_peer FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| {
                    Ok(Version {
                        logical_clock: row.get(0)?,
                        peer_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Index(e.to_string()))?;

        let dominates = match &existing {
            None => true,
            Some(current) => version.dominates(current),
        };
        if !dominates {
            self.metrics.lock().merges_rejected += 1;
            return Ok(false);
        }

        self.local_clock_floor
            .fetch_max(version.logical_clock, Ordering::SeqCst);
        let seq = {
            let mut next_seq = self.next_seq.lock();
            let entry = next_seq.entry(source.to_string()).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };
        let record = ChangeRecord {
            seq,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            version,
            payload,
            tombstone,
            source: source.to_string(),
        };
        self.append_and_project(record)?;
        self.metrics.lock().merges_accepted += 1;
        Ok(true)
    }

    /// `get(collection, doc_id) → (version, payload)?` (§4.B). Tombstoned
    /// documents are reported as absent.
    pub fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT clock, version_peer, last_writer, payload, tombstone FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| {
                    let tombstone: i64 = row.get(4)?;
                    Ok(Document {
                        collection: collection.to_string(),
                        doc_id: doc_id.to_string(),
                        version: Version {
                            logical_clock: row.get(0)?,
                            peer_id: row.get(1)?,
                        },
                        last_writer: row.get(2)?,
                        payload: row.get(3)?,
                        tombstone: tombstone != 0,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Index(e.to_string()))
            .map(|doc| doc.filter(|d| !d.tombstone))
    }

    /// `list(collection) → iterator<(doc_id, version, payload)>` (§4.B);
    /// tombstones excluded.
    pub fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT doc_id, clock, version_peer, last_writer, payload, tombstone FROM documents WHERE collection = ?1 AND tombstone = 0",
            )
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok(Document {
                    collection: collection.to_string(),
                    doc_id: row.get(0)?,
                    version: Version {
                        logical_clock: row.get(1)?,
                        peer_id: row.get(2)?,
                    },
                    last_writer: row.get(3)?,
                    payload: row.get(4)?,
                    tombstone: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(|e| StoreError::Index(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Index(e.to_string()))
    }

    /// `changes_since(peer_id, vector) → iterator<change-record>` (§4.B).
    /// `vector` maps a source peer id to the last sequence already seen;
    /// absent entries mean "from the beginning".
    pub fn changes_since(
        &self,
        vector: &HashMap<String, u64>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT source, seq, collection, doc_id, clock, version_peer, payload, tombstone
                 FROM changes WHERE source = ?1 AND seq >= ?2 ORDER BY seq",
            )
            .map_err(|e| StoreError::Index(e.to_string()))?;

        let mut out = Vec::new();
        let mut sources_stmt = conn
            .prepare("SELECT DISTINCT source FROM changes")
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let sources: Vec<String> = sources_stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| StoreError::Index(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::Index(e.to_string()))?;
        drop(sources_stmt);

        for source in sources {
            let from_seq = vector.get(&source).copied().unwrap_or(0) as i64;
            let rows = stmt
                .query_map(params![source, from_seq], |row| {
                    Ok(ChangeRecord {
                        source: row.get(0)?,
                        seq: row.get::<_, i64>(1)? as u64,
                        collection: row.get(2)?,
                        doc_id: row.get(3)?,
                        version: Version {
                            logical_clock: row.get(4)?,
                            peer_id: row.get(5)?,
                        },
                        payload: row.get(6)?,
                        tombstone: row.get::<_, i64>(7)? != 0,
                    })
                })
                .map_err(|e| StoreError::Index(e.to_string()))?;
            for row in rows {
                out.push(row.map_err(|e| StoreError::Corrupt(e.to_string()))?);
            }
        }
        out.sort_by_key(|r| (r.source.clone(), r.seq));
        Ok(out)
    }

    pub fn register_observer(&self, observer: impl Fn(&ChangeRecord) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    pub fn metrics(&self) -> StoreMetrics {
        let mut m = self.metrics.lock().clone();
        m.doc_count = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM documents WHERE tombstone = 0", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as u64;
        m
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// All collection names that have ever had a document, used by the
    /// sync engine to interleave `sync_diff` rounds across collections
    /// (§4.F: "across collections, interleaving is allowed").
    pub fn known_collections(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT collection FROM changes")
            .map_err(|e| StoreError::Index(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| StoreError::Index(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Index(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(peer: &str) -> Store {
        Store::open_in_memory(peer).unwrap()
    }

    #[test]
    fn put_then_get_round_trip() {
        let s = store("aa");
        s.put("x", "d1", b"hello".to_vec()).unwrap();
        let doc = s.get("x", "d1").unwrap().unwrap();
        assert_eq!(doc.payload, b"hello");
    }

    #[test]
    fn merge_accepts_strictly_dominating_version() {
        let s = store("bb");
        s.put("x", "d1", b"v1".to_vec()).unwrap();
        let accepted = s
            .merge(
                "x",
                "d1",
                Version { logical_clock: 100, peer_id: "zz".into() },
                b"v2".to_vec(),
                false,
                "zz",
            )
            .unwrap();
        assert!(accepted);
        assert_eq!(s.get("x", "d1").unwrap().unwrap().payload, b"v2");
    }

    #[test]
    fn merge_rejects_non_dominating_version_silently() {
        let s = store("bb");
        s.put("x", "d1", b"v1".to_vec()).unwrap(); // clock=1, peer=bb
        let accepted = s
            .merge(
                "x",
                "d1",
                Version { logical_clock: 1, peer_id: "aa".into() }, // loses tie-break vs bb
                b"v2".to_vec(),
                false,
                "aa",
            )
            .unwrap();
        assert!(!accepted);
        assert_eq!(s.get("x", "d1").unwrap().unwrap().payload, b"v1");
    }

    #[test]
    fn last_writer_wins_tie_break_by_peer_id() {
        let s = store("node");
        s.merge(
            "x",
            "d1",
            Version { logical_clock: 5, peer_id: "aaaa".into() },
            b"from-a".to_vec(),
            false,
            "aaaa",
        )
        .unwrap();
        let accepted = s
            .merge(
                "x",
                "d1",
                Version { logical_clock: 5, peer_id: "bbbb".into() },
                b"from-b".to_vec(),
                false,
                "bbbb",
            )
            .unwrap();
        assert!(accepted, "bbbb > aaaa lexicographically, must dominate on tie");
        assert_eq!(s.get("x", "d1").unwrap().unwrap().payload, b"from-b");
    }

    #[test]
    fn merge_is_idempotent() {
        let s = store("node");
        let version = Version { logical_clock: 2, peer_id: "rr".into() };
        assert!(s.merge("x", "d1", version, b"v".to_vec(), false, "rr").unwrap());
        assert!(!s.merge("x", "d1", version, b"v".to_vec(), false, "rr").unwrap());
        assert_eq!(s.get("x", "d1").unwrap().unwrap().payload, b"v");
    }

    #[test]
    fn tombstone_removes_document_from_list_and_get() {
        let s = store("node");
        s.put("z", "d4", b"payload".to_vec()).unwrap();
        s.tombstone("z", "d4").unwrap();
        assert!(s.get("z", "d4").unwrap().is_none());
        assert!(s.list("z").unwrap().is_empty());
    }

    #[test]
    fn changes_since_is_restartable_and_in_log_order() {
        let s = store("node");
        s.put("x", "d1", b"1".to_vec()).unwrap();
        s.put("x", "d2", b"2".to_vec()).unwrap();
        s.put("x", "d3", b"3".to_vec()).unwrap();

        let mut vector = HashMap::new();
        let all = s.changes_since(&vector).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        vector.insert("node".to_string(), 2);
        let rest = s.changes_since(&vector).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].doc_id, "d3");
    }

    #[test]
    fn projection_matches_log_after_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");
        {
            let s = Store::open(&path, "node").unwrap();
            s.put("x", "d1", b"one".to_vec()).unwrap();
            s.put("x", "d1", b"two".to_vec()).unwrap();
        }
        let reopened = Store::open(&path, "node").unwrap();
        assert_eq!(reopened.get("x", "d1").unwrap().unwrap().payload, b"two");
    }

    #[test]
    fn list_excludes_tombstones_but_get_on_live_doc_works() {
        let s = store("node");
        s.put("y", "d2", b"a".to_vec()).unwrap();
        s.put("y", "d3", b"b".to_vec()).unwrap();
        let listed = s.list("y").unwrap();
        assert_eq!(listed.len(), 2);
    }
}
