// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Consumer Cache & Event Applier (C11)
//!
//! [`apply_event`] is the pipeline one `ChangeEvent` runs through on its
//! way from the bus to a downstream target: the foreign-key gate (C13),
//! an idempotency short-circuit against the consumer's own cache, the
//! trashbin's add/remove interception (C14), the target plugin call
//! itself, and finally cache/error-queue bookkeeping (C12). Target
//! plugins are resolved by `(type, operation)` from a registry built
//! once at consumer startup; reference plugins (flatfile, LDAP) live in
//! `cdc_relay::infra::target`.

use crate::consumer::{error_queue, fk_policy, trashbin};
use crate::infra::config::{AutoremediationMode, ForeignKeyPolicy};
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::object::Object;
use cdc_relay_domain::ports::cache::{CacheStore, ErrorQueueStore, TrashbinStore};
use cdc_relay_domain::ports::target::{ApplyContext, TargetPlugin};
use cdc_relay_domain::schema::Dataschema;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `TargetPlugin`s resolved by `(type, operation)`, populated once at
/// consumer startup.
pub type TargetRegistry = BTreeMap<(String, Operation), Arc<dyn TargetPlugin>>;

/// Register one plugin instance for all three object-change operations
/// of a type — the common case, since a plugin typically dispatches on
/// `event.op` itself rather than needing a distinct instance per
/// operation.
pub fn register_for_every_operation(registry: &mut TargetRegistry, type_name: &str, plugin: Arc<dyn TargetPlugin>) {
    for op in [Operation::Added, Operation::Modified, Operation::Removed] {
        registry.insert((type_name.to_string(), op), plugin.clone());
    }
}

pub struct ApplierDeps {
    pub cache: Arc<dyn CacheStore>,
    pub error_queue: Arc<dyn ErrorQueueStore>,
    pub trashbin: Arc<dyn TrashbinStore>,
    pub targets: TargetRegistry,
    pub foreignkeys_policy: ForeignKeyPolicy,
    pub autoremediation_mode: AutoremediationMode,
    pub trashbin_retention_days: i64,
}

/// What one `apply_event` call did, surfaced to the consume loop for
/// logging and to `ctl status`/`ctl inspect`.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// Incoming attributes matched the cached object; no target call
    /// was made.
    Idempotent,
    /// Staged into the trashbin rather than applied directly.
    TrashbinStaged,
    /// Restored from the trashbin and applied as a `modified` mutation.
    RestoredFromTrashbin,
    Blocked { reason: String },
    /// The apply attempt failed and was queued (or re-queued) into the
    /// error queue.
    Queued { reason: String },
}

/// Run one event through the full apply pipeline.
pub async fn apply_event(
    deps: &ApplierDeps,
    schema: &Dataschema,
    event: &ChangeEvent,
    is_error_retry: bool,
    now: NaiveDateTime,
) -> Result<ApplyOutcome, RelayError> {
    if let Some(reason) = fk_policy::should_block(deps.foreignkeys_policy, schema, deps.error_queue.as_ref(), event).await? {
        error_queue::enqueue(
            deps.error_queue.as_ref(),
            deps.autoremediation_mode,
            event,
            is_error_retry,
            false,
            Some(reason.clone()),
            now,
        )
        .await?;
        return Ok(ApplyOutcome::Blocked { reason });
    }

    if event.op == Operation::Modified && already_applied(deps, event).await? {
        return Ok(ApplyOutcome::Idempotent);
    }

    let mut ctx = ApplyContext::new(is_error_retry);
    match run_pipeline(deps, event, now, &mut ctx).await {
        Ok(outcome) => {
            if is_error_retry {
                deps.error_queue.pop_head(&event.type_name, &event.pkey).await?;
            }
            Ok(outcome)
        }
        Err(err) => {
            error_queue::enqueue(
                deps.error_queue.as_ref(),
                deps.autoremediation_mode,
                event,
                is_error_retry,
                ctx.is_partially_processed,
                None,
                now,
            )
            .await?;
            Ok(ApplyOutcome::Queued { reason: err.to_string() })
        }
    }
}

async fn run_pipeline(deps: &ApplierDeps, event: &ChangeEvent, now: NaiveDateTime, ctx: &mut ApplyContext) -> Result<ApplyOutcome, RelayError> {
    match event.op {
        Operation::Added if trashbin::is_staged(deps.trashbin.as_ref(), &event.type_name, &event.remote_pkey).await? => {
            apply_restore(deps, event, ctx).await
        }
        Operation::Removed => apply_removal(deps, event, now).await,
        Operation::Modified => {
            call_target(deps, event, ctx).await?;
            let merged = merge_into_cached(deps.cache.as_ref(), event).await?;
            deps.cache.put(&event.type_name, &merged).await?;
            Ok(ApplyOutcome::Applied)
        }
        _ => {
            call_target(deps, event, ctx).await?;
            deps.cache.put(&event.type_name, &object_from_event(event)).await?;
            Ok(ApplyOutcome::Applied)
        }
    }
}

/// Folds a `modified` event's (partial, changed-only) attrs into the
/// existing cached object key by key, per §4.9 step 4. A `modified`
/// event for an object the cache has never seen (e.g. after a cache
/// wipe) starts from an empty object rather than failing.
async fn merge_into_cached(cache: &dyn CacheStore, event: &ChangeEvent) -> Result<Object, RelayError> {
    let mut object = match cache.get(&event.type_name, &event.remote_pkey).await? {
        Some(cached) => cached,
        None => Object::new(event.remote_pkey.clone(), event.pkey.clone()),
    };
    object.pkey = event.pkey.clone();
    for (key, value) in &event.attrs {
        object.attrs.insert(key.clone(), value.clone());
    }
    object.fkeys = event.fkeys.clone();
    Ok(object)
}

async fn apply_restore(deps: &ApplierDeps, event: &ChangeEvent, ctx: &mut ApplyContext) -> Result<ApplyOutcome, RelayError> {
    trashbin::restore(deps.trashbin.as_ref(), &event.type_name, &event.remote_pkey).await?;
    let mut rewritten = event.clone();
    rewritten.op = Operation::Modified;
    call_target(deps, &rewritten, ctx).await?;
    deps.cache.put(&event.type_name, &object_from_event(event)).await?;
    Ok(ApplyOutcome::RestoredFromTrashbin)
}

async fn apply_removal(deps: &ApplierDeps, event: &ChangeEvent, now: NaiveDateTime) -> Result<ApplyOutcome, RelayError> {
    let object = match deps.cache.get(&event.type_name, &event.remote_pkey).await? {
        Some(cached) => cached,
        None => object_from_event(event),
    };
    trashbin::stage(deps.trashbin.as_ref(), &event.type_name, object, now).await?;
    deps.cache.remove(&event.type_name, &event.remote_pkey).await?;
    Ok(ApplyOutcome::TrashbinStaged)
}

async fn call_target(deps: &ApplierDeps, event: &ChangeEvent, ctx: &mut ApplyContext) -> Result<(), RelayError> {
    let plugin = deps
        .targets
        .get(&(event.type_name.clone(), event.op))
        .ok_or_else(|| RelayError::apply_fatal(format!("no target plugin registered for ({}, {})", event.type_name, event.op)))?;
    plugin.apply(event, ctx).await
}

/// `modified` events carry only the attributes that changed (§4.5), so
/// idempotency can't be a full-object `attrs_equal` check: a repeated
/// event is idempotent when every attribute it carries already matches
/// the cached object, not when the two attribute sets are identical.
async fn already_applied(deps: &ApplierDeps, event: &ChangeEvent) -> Result<bool, RelayError> {
    match deps.cache.get(&event.type_name, &event.remote_pkey).await? {
        Some(cached) => Ok(event.attrs.iter().all(|(key, value)| cached.attrs.get(key) == Some(value))),
        None => Ok(false),
    }
}

fn object_from_event(event: &ChangeEvent) -> Object {
    Object {
        remote_pkey: event.remote_pkey.clone(),
        pkey: event.pkey.clone(),
        attrs: event.attrs.clone(),
        fkeys: event.fkeys.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::{InMemoryCache, InMemoryErrorQueue, InMemoryTrashbin};
    use async_trait::async_trait;
    use cdc_relay_domain::events::StepCounter;
    use cdc_relay_domain::schema::{Constraint, EntityType, OnMergeConflict, PrimaryKeySpec, SchemaRevision};
    use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};
    use std::sync::Mutex as StdMutex;

    struct RecordingPlugin {
        applied: StdMutex<Vec<ChangeEvent>>,
        fail_next: StdMutex<bool>,
    }

    impl Default for RecordingPlugin {
        fn default() -> Self {
            Self {
                applied: StdMutex::new(Vec::new()),
                fail_next: StdMutex::new(false),
            }
        }
    }

    #[async_trait]
    impl TargetPlugin for RecordingPlugin {
        async fn apply(&self, event: &ChangeEvent, _ctx: &mut ApplyContext) -> Result<(), RelayError> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(RelayError::apply_retryable("simulated failure"));
            }
            self.applied.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn schema() -> Dataschema {
        Dataschema::new(vec![EntityType {
            name: "user".into(),
            primary_key: PrimaryKeySpec::Simple("id".into()),
            foreign_keys: Default::default(),
            stringification_template: "{{ id }}".into(),
            on_merge_conflict: OnMergeConflict::KeepFirstValue,
            integrity_constraints: Vec::<Constraint>::new(),
            merge_constraints: Vec::<Constraint>::new(),
            sources: vec![],
        }])
    }

    fn event(op: Operation) -> ChangeEvent {
        event_with_attrs(op, &[("name", "Ada")])
    }

    fn event_with_attrs(op: Operation, attrs: &[(&str, &str)]) -> ChangeEvent {
        let attrs = attrs.iter().map(|(k, v)| (k.to_string(), TypedValue::Text(v.to_string()))).collect();
        ChangeEvent {
            op,
            type_name: "user".into(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Text("u1".into())),
            remote_pkey: RemotePkeyValue::new("r1"),
            step: StepCounter::initial(),
            schema_rev: SchemaRevision::initial(),
            attrs,
            fkeys: Default::default(),
        }
    }

    fn deps(plugin: Arc<RecordingPlugin>) -> ApplierDeps {
        let mut targets = TargetRegistry::new();
        register_for_every_operation(&mut targets, "user", plugin);
        ApplierDeps {
            cache: Arc::new(InMemoryCache::default()),
            error_queue: Arc::new(InMemoryErrorQueue::default()),
            trashbin: Arc::new(InMemoryTrashbin::default()),
            targets,
            foreignkeys_policy: ForeignKeyPolicy::Disabled,
            autoremediation_mode: AutoremediationMode::Disabled,
            trashbin_retention_days: 30,
        }
    }

    #[tokio::test]
    async fn added_event_calls_target_and_populates_cache() {
        let plugin = Arc::new(RecordingPlugin::default());
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        let outcome = apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(plugin.applied.lock().unwrap().len(), 1);
        assert!(deps.cache.get("user", &RemotePkeyValue::new("r1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_modified_with_same_attrs_is_idempotent() {
        let plugin = Arc::new(RecordingPlugin::default());
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        let outcome = apply_event(&deps, &schema, &event(Operation::Modified), false, now).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Idempotent);
        assert_eq!(plugin.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removed_event_stages_trashbin_instead_of_calling_target() {
        let plugin = Arc::new(RecordingPlugin::default());
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        let outcome = apply_event(&deps, &schema, &event(Operation::Removed), false, now).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::TrashbinStaged);
        assert_eq!(plugin.applied.lock().unwrap().len(), 1);
        assert!(deps.cache.get("user", &RemotePkeyValue::new("r1")).await.unwrap().is_none());
        assert!(trashbin::is_staged(deps.trashbin.as_ref(), "user", &RemotePkeyValue::new("r1")).await.unwrap());
    }

    #[tokio::test]
    async fn added_after_removed_restores_from_trashbin_as_modified() {
        let plugin = Arc::new(RecordingPlugin::default());
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        apply_event(&deps, &schema, &event(Operation::Removed), false, now).await.unwrap();
        let outcome = apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::RestoredFromTrashbin);
        assert!(!trashbin::is_staged(deps.trashbin.as_ref(), "user", &RemotePkeyValue::new("r1")).await.unwrap());
        assert_eq!(plugin.applied.lock().unwrap().last().unwrap().op, Operation::Modified);
    }

    #[tokio::test]
    async fn modified_event_with_partial_attrs_merges_instead_of_replacing() {
        let plugin = Arc::new(RecordingPlugin::default());
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        let added = event_with_attrs(Operation::Added, &[("name", "Ada"), ("mail", "ada@example.com")]);
        apply_event(&deps, &schema, &added, false, now).await.unwrap();

        let modified = event_with_attrs(Operation::Modified, &[("name", "Ada Lovelace")]);
        let outcome = apply_event(&deps, &schema, &modified, false, now).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let cached = deps.cache.get("user", &RemotePkeyValue::new("r1")).await.unwrap().unwrap();
        assert_eq!(cached.attrs.get("name"), Some(&TypedValue::Text("Ada Lovelace".into())));
        assert_eq!(cached.attrs.get("mail"), Some(&TypedValue::Text("ada@example.com".into())), "unchanged attrs must survive a partial modified event");
    }

    #[tokio::test]
    async fn failed_apply_is_queued_into_error_queue() {
        let plugin = Arc::new(RecordingPlugin::default());
        *plugin.fail_next.lock().unwrap() = true;
        let deps = deps(plugin.clone());
        let schema = schema();
        let now = chrono::NaiveDateTime::default();

        let outcome = apply_event(&deps, &schema, &event(Operation::Added), false, now).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Queued { .. }));
        let len = deps
            .error_queue
            .queue_len("user", &PrimaryKeyValue::Simple(TypedValue::Text("u1".into())))
            .await
            .unwrap();
        assert_eq!(len, 1);
    }
}
