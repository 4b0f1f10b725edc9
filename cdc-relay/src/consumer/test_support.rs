// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! In-memory port stubs shared by the consumer submodules' own test
//! modules, following the `StdMutex`-guarded stub pattern
//! `producer::cycle`'s tests use for `StubDriver`/`StubCache`/`StubBus`.

use async_trait::async_trait;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::ChangeEvent;
use cdc_relay_domain::object::Object;
use cdc_relay_domain::ports::bus::MessageBusConsumer;
use cdc_relay_domain::ports::cache::{CacheStore, ErrorQueueStore, QueuedEvent, TrashbinEntry, TrashbinStore};
use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryCache {
    objects: Mutex<BTreeMap<String, BTreeMap<RemotePkeyValue, Object>>>,
    local_index: Mutex<BTreeMap<String, BTreeMap<String, RemotePkeyValue>>>,
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<Object>, RelayError> {
        Ok(self.objects.lock().unwrap().get(type_name).and_then(|m| m.get(remote_pkey).cloned()))
    }

    async fn put(&self, type_name: &str, object: &Object) -> Result<(), RelayError> {
        self.local_index
            .lock()
            .unwrap()
            .entry(type_name.to_string())
            .or_default()
            .insert(object.pkey.to_string(), object.remote_pkey.clone());
        self.objects
            .lock()
            .unwrap()
            .entry(type_name.to_string())
            .or_default()
            .insert(object.remote_pkey.clone(), object.clone());
        Ok(())
    }

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError> {
        if let Some(by_pkey) = self.objects.lock().unwrap().get_mut(type_name) {
            by_pkey.remove(remote_pkey);
        }
        Ok(())
    }

    async fn snapshot(&self, type_name: &str) -> Result<Vec<Object>, RelayError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(type_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_type(&self, type_name: &str) -> Result<(), RelayError> {
        self.objects.lock().unwrap().remove(type_name);
        self.local_index.lock().unwrap().remove(type_name);
        Ok(())
    }

    async fn remote_pkey_for_local(&self, type_name: &str, local_pkey: &PrimaryKeyValue) -> Result<Option<RemotePkeyValue>, RelayError> {
        Ok(self
            .local_index
            .lock()
            .unwrap()
            .get(type_name)
            .and_then(|m| m.get(&local_pkey.to_string()).cloned()))
    }
}

#[derive(Default)]
pub struct InMemoryErrorQueue {
    queues: Mutex<BTreeMap<(String, String), VecDeque<QueuedEvent>>>,
}

#[async_trait]
impl ErrorQueueStore for InMemoryErrorQueue {
    async fn enqueue(&self, type_name: &str, pkey: &PrimaryKeyValue, entry: QueuedEvent) -> Result<(), RelayError> {
        self.queues
            .lock()
            .unwrap()
            .entry((type_name.to_string(), pkey.to_string()))
            .or_default()
            .push_back(entry);
        Ok(())
    }

    async fn heads(&self) -> Result<Vec<(String, PrimaryKeyValue, QueuedEvent)>, RelayError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .iter()
            .filter_map(|((type_name, _), q)| q.front().map(|head| (type_name.clone(), head.event.pkey.clone(), head.clone())))
            .collect())
    }

    async fn pop_head(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Option<QueuedEvent>, RelayError> {
        let mut guard = self.queues.lock().unwrap();
        let key = (type_name.to_string(), pkey.to_string());
        let Some(queue) = guard.get_mut(&key) else { return Ok(None) };
        let popped = queue.pop_front();
        if queue.is_empty() {
            guard.remove(&key);
        }
        Ok(popped)
    }

    async fn queue_len(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<usize, RelayError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&(type_name.to_string(), pkey.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn queue_snapshot(&self, type_name: &str, pkey: &PrimaryKeyValue) -> Result<Vec<QueuedEvent>, RelayError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&(type_name.to_string(), pkey.to_string()))
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    async fn replace_queue(&self, type_name: &str, pkey: &PrimaryKeyValue, entries: Vec<QueuedEvent>) -> Result<(), RelayError> {
        let key = (type_name.to_string(), pkey.to_string());
        let mut guard = self.queues.lock().unwrap();
        if entries.is_empty() {
            guard.remove(&key);
        } else {
            guard.insert(key, entries.into_iter().collect());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTrashbin {
    entries: Mutex<BTreeMap<String, BTreeMap<RemotePkeyValue, TrashbinEntry>>>,
}

#[async_trait]
impl TrashbinStore for InMemoryTrashbin {
    async fn put(&self, type_name: &str, entry: TrashbinEntry) -> Result<(), RelayError> {
        self.entries
            .lock()
            .unwrap()
            .entry(type_name.to_string())
            .or_default()
            .insert(entry.object.remote_pkey.clone(), entry);
        Ok(())
    }

    async fn get(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<Option<TrashbinEntry>, RelayError> {
        Ok(self.entries.lock().unwrap().get(type_name).and_then(|m| m.get(remote_pkey).cloned()))
    }

    async fn remove(&self, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError> {
        if let Some(m) = self.entries.lock().unwrap().get_mut(type_name) {
            m.remove(remote_pkey);
        }
        Ok(())
    }

    async fn expired(&self, type_name: &str, cutoff: NaiveDateTime) -> Result<Vec<TrashbinEntry>, RelayError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(type_name)
            .map(|m| m.values().filter(|e| e.deleted_at <= cutoff).cloned().collect())
            .unwrap_or_default())
    }
}

/// A bus backed by a plain `Vec`, one consumer group's committed offset
/// tracked per group name. Unlike `SledBus`, `poll` never blocks and
/// every event stays forever, which is exactly what `initsync`'s window
/// scan and the cycle tests need.
#[derive(Default)]
pub struct InMemoryBus {
    events: Mutex<Vec<ChangeEvent>>,
    committed: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryBus {
    pub fn push(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl MessageBusConsumer for InMemoryBus {
    async fn poll(&self, consumer_group: &str) -> Result<Option<(u64, ChangeEvent)>, RelayError> {
        let events = self.events.lock().unwrap();
        let next_offset = *self.committed.lock().unwrap().get(consumer_group).unwrap_or(&0);
        Ok(events.get(next_offset as usize).map(|e| (next_offset, e.clone())))
    }

    async fn commit(&self, consumer_group: &str, offset: u64) -> Result<(), RelayError> {
        self.committed.lock().unwrap().insert(consumer_group.to_string(), offset + 1);
        Ok(())
    }

    async fn offset_bounds(&self) -> Result<(u64, u64), RelayError> {
        let len = self.events.lock().unwrap().len() as u64;
        Ok((0, len.saturating_sub(1)))
    }
}
