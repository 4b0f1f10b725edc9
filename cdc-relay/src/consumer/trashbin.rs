// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Trashbin (C14)
//!
//! Soft-delete staging ahead of a physical purge: a `removed` event
//! stages its object here instead of calling the target plugin's delete
//! path directly, and [`purge_expired`] is the only place that ever
//! does. An `added` for a pkey already staged restores it in place — the
//! applier rewrites the operation to `modified` and still calls the
//! target, since the object was never physically removed there.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation, StepCounter};
use cdc_relay_domain::object::Object;
use cdc_relay_domain::ports::cache::{TrashbinEntry, TrashbinStore};
use cdc_relay_domain::ports::target::{ApplyContext, TargetPlugin};
use cdc_relay_domain::schema::SchemaRevision;
use cdc_relay_domain::value::RemotePkeyValue;
use chrono::{Duration, NaiveDateTime};

pub async fn is_staged(store: &dyn TrashbinStore, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<bool, RelayError> {
    Ok(store.get(type_name, remote_pkey).await?.is_some())
}

/// Stage `object` for deletion at `deleted_at`, overwriting any entry
/// already staged under the same `remote_pkey`.
pub async fn stage(store: &dyn TrashbinStore, type_name: &str, object: Object, deleted_at: NaiveDateTime) -> Result<(), RelayError> {
    store.put(type_name, TrashbinEntry { object, deleted_at }).await
}

/// Remove the staged entry for `remote_pkey` without calling any
/// target, used when an `added` event arrives for an object that was
/// staged but never purged.
pub async fn restore(store: &dyn TrashbinStore, type_name: &str, remote_pkey: &RemotePkeyValue) -> Result<(), RelayError> {
    store.remove(type_name, remote_pkey).await
}

/// Physically delete every entry of `type_name` staged at or before
/// `retention_days` ago, through `plugin`'s `apply` with a synthetic
/// `removed` event. Returns the number of entries purged.
pub async fn purge_expired(
    store: &dyn TrashbinStore,
    plugin: &dyn TargetPlugin,
    type_name: &str,
    retention_days: i64,
    now: NaiveDateTime,
) -> Result<usize, RelayError> {
    let cutoff = now - Duration::days(retention_days);
    let expired = store.expired(type_name, cutoff).await?;
    let mut purged = 0;
    for entry in expired {
        let event = removal_event_for(type_name, &entry.object);
        let mut ctx = ApplyContext::new(false);
        plugin.apply(&event, &mut ctx).await?;
        store.remove(type_name, &entry.object.remote_pkey).await?;
        purged += 1;
    }
    Ok(purged)
}

fn removal_event_for(type_name: &str, object: &Object) -> ChangeEvent {
    ChangeEvent {
        op: Operation::Removed,
        type_name: type_name.to_string(),
        pkey: object.pkey.clone(),
        remote_pkey: object.remote_pkey.clone(),
        step: StepCounter::initial(),
        schema_rev: SchemaRevision::initial(),
        attrs: object.attrs.clone(),
        fkeys: object.fkeys.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::InMemoryTrashbin;
    use async_trait::async_trait;
    use cdc_relay_domain::value::{PrimaryKeyValue, TypedValue};
    use std::sync::Mutex as StdMutex;

    struct RecordingPlugin {
        applied: StdMutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl TargetPlugin for RecordingPlugin {
        async fn apply(&self, event: &ChangeEvent, _ctx: &mut ApplyContext) -> Result<(), RelayError> {
            self.applied.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn object() -> Object {
        Object::new(RemotePkeyValue::new("r1"), PrimaryKeyValue::Simple(TypedValue::Int(1)))
    }

    #[tokio::test]
    async fn staged_entry_is_reported_staged_until_purged() {
        let store = InMemoryTrashbin::default();
        let now = chrono::NaiveDateTime::default();
        stage(&store, "user", object(), now).await.unwrap();
        assert!(is_staged(&store, "user", &RemotePkeyValue::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn restore_clears_staged_entry() {
        let store = InMemoryTrashbin::default();
        let now = chrono::NaiveDateTime::default();
        stage(&store, "user", object(), now).await.unwrap();
        restore(&store, "user", &RemotePkeyValue::new("r1")).await.unwrap();
        assert!(!is_staged(&store, "user", &RemotePkeyValue::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn purge_expired_calls_target_and_clears_entry() {
        let store = InMemoryTrashbin::default();
        let plugin = RecordingPlugin { applied: StdMutex::new(Vec::new()) };
        let base = chrono::NaiveDateTime::default();
        stage(&store, "user", object(), base).await.unwrap();

        let purged = purge_expired(&store, &plugin, "user", 30, base + Duration::days(31)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(plugin.applied.lock().unwrap().len(), 1);
        assert!(!is_staged(&store, "user", &RemotePkeyValue::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn purge_expired_leaves_entries_within_retention() {
        let store = InMemoryTrashbin::default();
        let plugin = RecordingPlugin { applied: StdMutex::new(Vec::new()) };
        let base = chrono::NaiveDateTime::default();
        stage(&store, "user", object(), base).await.unwrap();

        let purged = purge_expired(&store, &plugin, "user", 30, base + Duration::days(1)).await.unwrap();
        assert_eq!(purged, 0);
        assert!(is_staged(&store, "user", &RemotePkeyValue::new("r1")).await.unwrap());
    }
}
