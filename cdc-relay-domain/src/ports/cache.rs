// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persisted State Ports (C7, C12, C14)
//!
//! Repository-style seams over the relay's three durable, embedded
//! state stores. `cdc_relay::infra::cache::sled_store` is the one
//! implementation shipped, but keeping these behind traits lets
//! `cdc_relay`'s application-layer tests substitute an in-memory stub
//! without a sled database on disk.

use crate::error::RelayError;
use crate::events::ChangeEvent;
use crate::object::Object;
use crate::value::{PrimaryKeyValue, RemotePkeyValue};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Producer cache (C7) / consumer cache (C11): one `Object` per
/// `(type, remote_pkey)`, plus the local-pkey index needed to reconcile
/// a freshly fetched row against a previously observed object.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<Object>, RelayError>;

    async fn put(&self, type_name: &str, object: &Object) -> Result<(), RelayError>;

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError>;

    /// Every cached object of `type_name`, for diffing against a fresh
    /// snapshot (C7) or for a full-type drop during schema evolution
    /// (C10).
    async fn snapshot(&self, type_name: &str) -> Result<Vec<Object>, RelayError>;

    /// Drop every cached object of `type_name` (schema evolution: type
    /// removed).
    async fn clear_type(&self, type_name: &str) -> Result<(), RelayError>;

    /// Resolve a local pkey to the remote pkey it was last observed
    /// under, used by the producer to decide `added` vs. `modified`
    /// when a source's native identity is reused across rows.
    async fn remote_pkey_for_local(
        &self,
        type_name: &str,
        local_pkey: &PrimaryKeyValue,
    ) -> Result<Option<RemotePkeyValue>, RelayError>;
}

/// One event sitting in a `(type, pkey)` error-queue FIFO (C12).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: ChangeEvent,
    pub enqueued_at: NaiveDateTime,
    pub attempts: u32,
    /// `true` once this object has had at least one step successfully
    /// applied to the target and at least one step fail — the
    /// coalescing-safety boundary described in C12.
    pub is_partially_processed: bool,
    pub blocked_reason: Option<String>,
}

/// Error queue (C12): FIFO per `(type, pkey)`.
#[async_trait]
pub trait ErrorQueueStore: Send + Sync {
    async fn enqueue(&self, type_name: &str, pkey: &PrimaryKeyValue, entry: QueuedEvent) -> Result<(), RelayError>;

    /// FIFO head for every queued `(type, pkey)`, the set retried on each
    /// wake of the retry task.
    async fn heads(&self) -> Result<Vec<(String, PrimaryKeyValue, QueuedEvent)>, RelayError>;

    async fn pop_head(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Option<QueuedEvent>, RelayError>;

    async fn queue_len(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<usize, RelayError>;

    /// The full `(type, pkey)` queue in FIFO order, oldest first.
    /// Autoremediation (C12) needs to inspect every queued event for a
    /// blocked object to decide what a `conservative`/`maximum` coalesce
    /// collapses down to, not just the head.
    async fn queue_snapshot(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Vec<QueuedEvent>, RelayError>;

    /// Replace a `(type, pkey)` queue wholesale with `entries` (FIFO
    /// order preserved), the write side of an autoremediation coalesce.
    /// An empty `entries` removes the queue entirely.
    async fn replace_queue(
        &self,
        type_name: &str,
        pkey: &PrimaryKeyValue,
        entries: Vec<QueuedEvent>,
    ) -> Result<(), RelayError>;
}

/// One tombstoned object awaiting permanent removal (C14).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrashbinEntry {
    pub object: Object,
    pub deleted_at: NaiveDateTime,
}

/// Trashbin (C14): soft-delete staging area ahead of a physical purge.
#[async_trait]
pub trait TrashbinStore: Send + Sync {
    async fn put(&self, type_name: &str, entry: TrashbinEntry) -> Result<(), RelayError>;

    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<TrashbinEntry>, RelayError>;

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError>;

    /// Entries whose `deleted_at` is at or before `cutoff`, ready for
    /// physical purge.
    async fn expired(&self, type_name: &str, cutoff: NaiveDateTime) -> Result<Vec<TrashbinEntry>, RelayError>;
}
