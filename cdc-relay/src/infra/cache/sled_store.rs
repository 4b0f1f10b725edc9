// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Sled-Backed State Store (C7, C11, C12, C14)
//!
//! One `sled::Db` backs the producer/consumer object cache, the error
//! queue, and the trashbin, each in its own tree namespace. sled commits
//! a single key/value write durably before returning, which is what
//! makes the producer cache update in C7 atomic without a temp-file-and-
//! rename dance: either the new snapshot lands or the old one is still
//! there after a crash.
//!
//! sled's API is synchronous; every method here is a thin `async fn`
//! wrapper so the type satisfies the `Send + Sync` port traits without
//! forcing every caller through `spawn_blocking` for what are, in
//! practice, microsecond-scale B-tree operations against a local file.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::ChangeEvent;
use cdc_relay_domain::object::Object;
use cdc_relay_domain::ports::cache::{CacheStore, ErrorQueueStore, QueuedEvent, TrashbinEntry, TrashbinStore};
use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::sync::Arc;

/// Opens and owns the trees backing one relay process's durable state.
/// Cheap to clone: `sled::Db` is itself an `Arc`-backed handle.
#[derive(Clone)]
pub struct SledStateStore {
    db: sled::Db,
}

impl SledStateStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, RelayError> {
        let db = sled::open(path).map_err(|e| RelayError::internal_error(format!("failed to open sled database: {e}")))?;
        Ok(Self { db })
    }

    /// Build a state store over an already-open `sled::Db`, so a caller
    /// needing trees this type does not itself define (the producer's
    /// `_dataschema`/`_relayconfig` trees, C7) can share the one on-disk
    /// database rather than opening it twice.
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn cache_tree(&self, type_name: &str) -> sled::Result<sled::Tree> {
        self.db.open_tree(format!("cache:{type_name}"))
    }

    fn local_index_tree(&self, type_name: &str) -> sled::Result<sled::Tree> {
        self.db.open_tree(format!("cache_local_idx:{type_name}"))
    }

    fn queue_tree(&self, type_name: &str, pkey: &PrimaryKeyValue) -> sled::Result<sled::Tree> {
        self.db.open_tree(format!("errorqueue:{type_name}:{pkey}"))
    }

    fn queue_index_tree(&self) -> sled::Result<sled::Tree> {
        self.db.open_tree("errorqueue_index")
    }

    fn trashbin_tree(&self, type_name: &str) -> sled::Result<sled::Tree> {
        self.db.open_tree(format!("trashbin:{type_name}"))
    }
}

fn io_err(e: sled::Error) -> RelayError {
    RelayError::IoError(e.to_string())
}

fn ser_err(e: serde_json::Error) -> RelayError {
    RelayError::SerializationError(e.to_string())
}

#[async_trait]
impl CacheStore for SledStateStore {
    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<Object>, RelayError> {
        let tree = self.cache_tree(type_name).map_err(io_err)?;
        match tree.get(remote_pkey.as_str().as_bytes()).map_err(io_err)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(ser_err)?)),
        }
    }

    async fn put(&self, type_name: &str, object: &Object) -> Result<(), RelayError> {
        let tree = self.cache_tree(type_name).map_err(io_err)?;
        let index = self.local_index_tree(type_name).map_err(io_err)?;
        let encoded = serde_json::to_vec(object).map_err(ser_err)?;
        tree.insert(object.remote_pkey.as_str().as_bytes(), encoded).map_err(io_err)?;
        index
            .insert(object.pkey.to_string().as_bytes(), object.remote_pkey.as_str().as_bytes())
            .map_err(io_err)?;
        Ok(())
    }

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError> {
        let tree = self.cache_tree(type_name).map_err(io_err)?;
        if let Some(bytes) = tree.remove(remote_pkey.as_str().as_bytes()).map_err(io_err)? {
            let object: Object = serde_json::from_slice(&bytes).map_err(ser_err)?;
            let index = self.local_index_tree(type_name).map_err(io_err)?;
            index.remove(object.pkey.to_string().as_bytes()).map_err(io_err)?;
        }
        Ok(())
    }

    async fn snapshot(&self, type_name: &str) -> Result<Vec<Object>, RelayError> {
        let tree = self.cache_tree(type_name).map_err(io_err)?;
        let mut objects = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry.map_err(io_err)?;
            objects.push(serde_json::from_slice(&bytes).map_err(ser_err)?);
        }
        Ok(objects)
    }

    async fn clear_type(&self, type_name: &str) -> Result<(), RelayError> {
        let tree = self.cache_tree(type_name).map_err(io_err)?;
        tree.clear().map_err(io_err)?;
        let index = self.local_index_tree(type_name).map_err(io_err)?;
        index.clear().map_err(io_err)?;
        Ok(())
    }

    async fn remote_pkey_for_local(
        &self,
        type_name: &str,
        local_pkey: &PrimaryKeyValue,
    ) -> Result<Option<RemotePkeyValue>, RelayError> {
        let index = self.local_index_tree(type_name).map_err(io_err)?;
        match index.get(local_pkey.to_string().as_bytes()).map_err(io_err)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(RemotePkeyValue::new(
                String::from_utf8(bytes.to_vec()).map_err(|e| RelayError::internal_error(e.to_string()))?,
            ))),
        }
    }
}

/// Error queue entries are stored as a JSON-encoded `VecDeque` per
/// `(type, pkey)` tree rather than one key per entry: FIFO semantics
/// (pop the head, keep the rest in order) map directly onto
/// `VecDeque::pop_front`, and per-`(type, pkey)` queues are expected to
/// stay small (a handful of retried events, not a high-volume stream).
#[async_trait]
impl ErrorQueueStore for SledStateStore {
    async fn enqueue(&self, type_name: &str, pkey: &PrimaryKeyValue, entry: QueuedEvent) -> Result<(), RelayError> {
        let tree = self.queue_tree(type_name, pkey).map_err(io_err)?;
        let mut queue: VecDeque<QueuedEvent> = match tree.get(b"queue").map_err(io_err)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(ser_err)?,
            None => VecDeque::new(),
        };
        queue.push_back(entry);
        tree.insert(b"queue", serde_json::to_vec(&queue).map_err(ser_err)?).map_err(io_err)?;

        let index = self.queue_index_tree().map_err(io_err)?;
        index
            .insert(format!("{type_name}\u{1f}{pkey}").as_bytes(), b"1")
            .map_err(io_err)?;
        Ok(())
    }

    async fn heads(&self) -> Result<Vec<(String, PrimaryKeyValue, QueuedEvent)>, RelayError> {
        let index = self.queue_index_tree().map_err(io_err)?;
        let mut heads = Vec::new();
        for entry in index.iter() {
            let (key, _) = entry.map_err(io_err)?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| RelayError::internal_error(e.to_string()))?;
            let Some((type_name, pkey_str)) = key.split_once('\u{1f}') else {
                continue;
            };
            let tree = self.db.open_tree(format!("errorqueue:{type_name}:{pkey_str}")).map_err(io_err)?;
            if let Some(bytes) = tree.get(b"queue").map_err(io_err)? {
                let queue: VecDeque<QueuedEvent> = serde_json::from_slice(&bytes).map_err(ser_err)?;
                if let Some(head) = queue.front() {
                    heads.push((type_name.to_string(), head.event.pkey.clone(), head.clone()));
                }
            }
        }
        Ok(heads)
    }

    async fn pop_head(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Option<QueuedEvent>, RelayError> {
        let tree = self.queue_tree(type_name, pkey).map_err(io_err)?;
        let Some(bytes) = tree.get(b"queue").map_err(io_err)? else {
            return Ok(None);
        };
        let mut queue: VecDeque<QueuedEvent> = serde_json::from_slice(&bytes).map_err(ser_err)?;
        let popped = queue.pop_front();
        if queue.is_empty() {
            tree.remove(b"queue").map_err(io_err)?;
            let index = self.queue_index_tree().map_err(io_err)?;
            index.remove(format!("{type_name}\u{1f}{pkey}").as_bytes()).map_err(io_err)?;
        } else {
            tree.insert(b"queue", serde_json::to_vec(&queue).map_err(ser_err)?).map_err(io_err)?;
        }
        Ok(popped)
    }

    async fn queue_len(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<usize, RelayError> {
        let tree = self.queue_tree(type_name, pkey).map_err(io_err)?;
        match tree.get(b"queue").map_err(io_err)? {
            None => Ok(0),
            Some(bytes) => {
                let queue: VecDeque<QueuedEvent> = serde_json::from_slice(&bytes).map_err(ser_err)?;
                Ok(queue.len())
            }
        }
    }

    async fn queue_snapshot(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Vec<QueuedEvent>, RelayError> {
        let tree = self.queue_tree(type_name, pkey).map_err(io_err)?;
        match tree.get(b"queue").map_err(io_err)? {
            None => Ok(Vec::new()),
            Some(bytes) => {
                let queue: VecDeque<QueuedEvent> = serde_json::from_slice(&bytes).map_err(ser_err)?;
                Ok(queue.into_iter().collect())
            }
        }
    }

    async fn replace_queue(
        &self,
        type_name: &str,
        pkey: &PrimaryKeyValue,
        entries: Vec<QueuedEvent>,
    ) -> Result<(), RelayError> {
        let tree = self.queue_tree(type_name, pkey).map_err(io_err)?;
        let index = self.queue_index_tree().map_err(io_err)?;
        if entries.is_empty() {
            tree.remove(b"queue").map_err(io_err)?;
            index.remove(format!("{type_name}\u{1f}{pkey}").as_bytes()).map_err(io_err)?;
        } else {
            let queue: VecDeque<QueuedEvent> = entries.into_iter().collect();
            tree.insert(b"queue", serde_json::to_vec(&queue).map_err(ser_err)?).map_err(io_err)?;
            index
                .insert(format!("{type_name}\u{1f}{pkey}").as_bytes(), b"1")
                .map_err(io_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TrashbinStore for SledStateStore {
    async fn put(&self, type_name: &str, entry: TrashbinEntry) -> Result<(), RelayError> {
        let tree = self.trashbin_tree(type_name).map_err(io_err)?;
        tree.insert(
            entry.object.remote_pkey.as_str().as_bytes(),
            serde_json::to_vec(&entry).map_err(ser_err)?,
        )
        .map_err(io_err)?;
        Ok(())
    }

    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<TrashbinEntry>, RelayError> {
        let tree = self.trashbin_tree(type_name).map_err(io_err)?;
        match tree.get(remote_pkey.as_str().as_bytes()).map_err(io_err)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(ser_err)?)),
        }
    }

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError> {
        let tree = self.trashbin_tree(type_name).map_err(io_err)?;
        tree.remove(remote_pkey.as_str().as_bytes()).map_err(io_err)?;
        Ok(())
    }

    async fn expired(&self, type_name: &str, cutoff: NaiveDateTime) -> Result<Vec<TrashbinEntry>, RelayError> {
        let tree = self.trashbin_tree(type_name).map_err(io_err)?;
        let mut expired = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item.map_err(io_err)?;
            let entry: TrashbinEntry = serde_json::from_slice(&bytes).map_err(ser_err)?;
            if entry.deleted_at <= cutoff {
                expired.push(entry);
            }
        }
        Ok(expired)
    }
}

/// Shared handle type used by the producer/consumer composition roots.
pub type SharedStateStore = Arc<SledStateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::value::TypedValue;

    fn store() -> SledStateStore {
        SledStateStore::open(tempfile::tempdir().unwrap().keep()).unwrap()
    }

    fn obj(remote: &str, local: i64) -> Object {
        Object::new(RemotePkeyValue::new(remote), PrimaryKeyValue::Simple(TypedValue::Int(local)))
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = store();
        let o = obj("r1", 1);
        store.put("user", &o).await.unwrap();
        let back = store.get("user", &RemotePkeyValue::new("r1")).await.unwrap();
        assert_eq!(back, Some(o));
    }

    #[tokio::test]
    async fn remote_pkey_for_local_resolves_after_put() {
        let store = store();
        let o = obj("r1", 42);
        store.put("user", &o).await.unwrap();
        let resolved = store
            .remote_pkey_for_local("user", &PrimaryKeyValue::Simple(TypedValue::Int(42)))
            .await
            .unwrap();
        assert_eq!(resolved, Some(RemotePkeyValue::new("r1")));
    }

    #[tokio::test]
    async fn clear_type_empties_snapshot() {
        let store = store();
        store.put("user", &obj("r1", 1)).await.unwrap();
        store.clear_type("user").await.unwrap();
        assert!(store.snapshot("user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_queue_is_fifo() {
        let store = store();
        let pkey = PrimaryKeyValue::Simple(TypedValue::Int(1));
        let event = ChangeEvent {
            op: cdc_relay_domain::events::Operation::Modified,
            type_name: "user".into(),
            pkey: pkey.clone(),
            remote_pkey: RemotePkeyValue::new("r1"),
            step: cdc_relay_domain::events::StepCounter::initial(),
            schema_rev: cdc_relay_domain::schema::SchemaRevision::initial(),
            attrs: Default::default(),
            fkeys: Default::default(),
        };
        let now = chrono::Utc::now().naive_utc();
        for attempt in 0..3 {
            store
                .enqueue(
                    "user",
                    &pkey,
                    QueuedEvent {
                        event: event.clone(),
                        enqueued_at: now,
                        attempts: attempt,
                        is_partially_processed: false,
                        blocked_reason: None,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(store.queue_len("user", &pkey).await.unwrap(), 3);
        let head = store.pop_head("user", &pkey).await.unwrap().unwrap();
        assert_eq!(head.attempts, 0);
        assert_eq!(store.queue_len("user", &pkey).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_queue_overwrites_snapshot() {
        let store = store();
        let pkey = PrimaryKeyValue::Simple(TypedValue::Int(1));
        let event = ChangeEvent {
            op: cdc_relay_domain::events::Operation::Modified,
            type_name: "user".into(),
            pkey: pkey.clone(),
            remote_pkey: RemotePkeyValue::new("r1"),
            step: cdc_relay_domain::events::StepCounter::initial(),
            schema_rev: cdc_relay_domain::schema::SchemaRevision::initial(),
            attrs: Default::default(),
            fkeys: Default::default(),
        };
        let now = chrono::Utc::now().naive_utc();
        let entry = |attempts| QueuedEvent {
            event: event.clone(),
            enqueued_at: now,
            attempts,
            is_partially_processed: false,
            blocked_reason: None,
        };
        store.enqueue("user", &pkey, entry(0)).await.unwrap();
        store.enqueue("user", &pkey, entry(1)).await.unwrap();
        assert_eq!(store.queue_snapshot("user", &pkey).await.unwrap().len(), 2);

        store.replace_queue("user", &pkey, vec![entry(9)]).await.unwrap();
        let snapshot = store.queue_snapshot("user", &pkey).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].attempts, 9);

        store.replace_queue("user", &pkey, Vec::new()).await.unwrap();
        assert!(store.queue_snapshot("user", &pkey).await.unwrap().is_empty());
        assert!(store.heads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trashbin_expired_filters_by_cutoff() {
        let store = store();
        let old = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let recent = chrono::Utc::now().naive_utc();
        store
            .put("user", TrashbinEntry { object: obj("r1", 1), deleted_at: old })
            .await
            .unwrap();
        store
            .put("user", TrashbinEntry { object: obj("r2", 2), deleted_at: recent })
            .await
            .unwrap();
        let cutoff = chrono::NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let expired = store.expired("user", cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].object.remote_pkey, RemotePkeyValue::new("r1"));
    }
}
