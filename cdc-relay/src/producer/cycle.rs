// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Producer Cycle (C3, C5-C9)
//!
//! `run_cycle` is one full pass over a dataschema: fetch every source of
//! every type, merge, check integrity, diff against the producer cache,
//! publish `added`/`modified`/`removed` events in that order, and run
//! each source's `commit_one`/`commit_all` hooks. Types are always
//! processed in dataschema declaration order, since `merge_constraints`
//! and `integrity_constraints` may reference an earlier type's already-
//! merged rows through `U("type")`.
//!
//! ## Attribute classes (§3)
//!
//! A source binding's `local_attrs` never leave this module: they are
//! dropped immediately after projection. `cacheonly_attrs` ride along
//! through merge, integrity and the cache/diff so a later cycle can
//! still compare them, but are stripped back out of the attrs carried on
//! an emitted event. `secret_attrs` are the opposite: they are excluded
//! from merge/integrity/cache/diff entirely (so they never gate a
//! decision and never grow stale in the cache) and are tracked out of
//! band for the cycle, keyed by local pkey, then spliced into an
//! `added`/`modified` event's attrs at the moment it is built. A
//! `removed` event never carries them back — there is no current value
//! to report.
//!
//! A secret-only change (every cacheonly/mergeable attribute unchanged,
//! only a secret's value different) would otherwise be invisible to
//! [`cdc_relay_domain::diff::diff_type`], since it compares only the
//! attrs that reach the cached `Object`. To keep secrets from silently
//! going stale downstream, each merged row carries a synthetic
//! `__secret_fingerprint__` attribute (a hash of that cycle's secret
//! values for the row's local pkey) alongside its real attrs for the
//! purposes of caching and diffing; it rides through exactly like a
//! `cacheonly` attribute and is stripped before an event's attrs are
//! built. A `modified` event's attrs are the delta against the cached
//! object, not the full row, so a secret-only change surfaces as a
//! `modified` event carrying just the changed secret.
//!
//! ## Synthetic `remote_pkey` (DESIGN.md Open Question)
//!
//! The dataschema gives no formula for a never-before-seen object's
//! `remote_pkey`; [`cdc_relay_domain::diff`] only documents that
//! assignment happens before it runs. This cycle asks the cache whether
//! it already knows a `remote_pkey` for the row's local pkey and, if
//! not, mints a fresh ULID. ULIDs sort lexically by creation time, which
//! keeps a cache's sled keyspace roughly insertion-ordered without a
//! separate sequence.

use crate::projection::{TeraIntegrityEvaluator, TeraMergeEvaluator};
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation, StepCounter};
use cdc_relay_domain::integrity;
use cdc_relay_domain::merge::{merge_type, MergeDiagnostic, MergedRow, ProjectedRow, SourceRows};
use cdc_relay_domain::object::Object;
use cdc_relay_domain::ports::bus::MessageBusProducer;
use cdc_relay_domain::ports::cache::CacheStore;
use cdc_relay_domain::ports::datasource::DatasourceDriver;
use cdc_relay_domain::schema::{Dataschema, EntityType, PrimaryKeySpec, SchemaRevision, SourceBinding};
use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::projection::project_attribute;

/// Synthetic attribute name carrying a hash of a row's secret attrs
/// through merge/cache/diff, so a secret-only change still produces a
/// `modified` event. Never leaves this module.
const SECRET_FINGERPRINT_ATTR: &str = "__secret_fingerprint__";

fn secret_fingerprint(secret_attrs: &BTreeMap<String, TypedValue>) -> TypedValue {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (name, value) in secret_attrs {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0]);
    }
    TypedValue::Text(format!("{:x}", hasher.finalize()))
}

/// Configured datasource driver instances, keyed by the name a source
/// binding's `driver_ref` resolves against.
pub type DatasourceRegistry = BTreeMap<String, Arc<dyn DatasourceDriver>>;

/// Everything one producer cycle needs: the dataschema to watch, the
/// configured drivers, the producer cache, and the bus to publish to.
pub struct ProducerDeps {
    pub dataschema: Dataschema,
    pub datasources: DatasourceRegistry,
    pub cache: Arc<dyn CacheStore>,
    pub bus: Arc<dyn MessageBusProducer>,
}

/// What one cycle did, surfaced through `ctl status` and the per-cycle
/// mail alert (§7).
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub published: usize,
    pub merge_diagnostics: Vec<MergeDiagnostic>,
    pub integrity_diagnostics: Vec<cdc_relay_domain::integrity::IntegrityDiagnostic>,
}

/// Run one fetch/merge/integrity/diff/publish/commit pass over every
/// type in `deps.dataschema`, in declaration order. `step_counter` is
/// shared across the producer's whole lifetime so every emitted event
/// carries a process-wide-unique step.
pub async fn run_cycle(deps: &ProducerDeps, step_counter: &AtomicU64) -> Result<CycleSummary, RelayError> {
    let mut summary = CycleSummary::default();
    let mut universe_merged: BTreeMap<String, Vec<MergedRow>> = BTreeMap::new();
    let mut merged_by_type: BTreeMap<String, Vec<Object>> = BTreeMap::new();
    let mut secrets_by_type: BTreeMap<String, BTreeMap<String, BTreeMap<String, TypedValue>>> = BTreeMap::new();
    let mut cached_by_type: BTreeMap<String, BTreeMap<RemotePkeyValue, Object>> = BTreeMap::new();

    for entity in &deps.dataschema.types {
        let cached_objects = deps.cache.snapshot(&entity.name).await?;
        let cached_by_local: BTreeMap<String, BTreeMap<String, TypedValue>> =
            cached_objects.iter().map(|o| (o.pkey.to_string(), o.attrs.clone())).collect();

        let (fetched, secrets, fetch_diagnostics) = fetch_entity(entity, &deps.datasources).await;
        summary.merge_diagnostics.extend(fetch_diagnostics);

        let outcome = merge_type(entity, &fetched, &universe_merged, &TeraMergeEvaluator, &cached_by_local)?;
        summary.merge_diagnostics.extend(outcome.diagnostics);

        universe_merged.insert(entity.name.clone(), outcome.rows.clone());

        let objects = build_objects(entity, outcome.rows, deps.cache.as_ref(), &secrets).await?;
        merged_by_type.insert(entity.name.clone(), objects);
        secrets_by_type.insert(entity.name.clone(), secrets);
        cached_by_type.insert(
            entity.name.clone(),
            cached_objects.into_iter().map(|o| (o.remote_pkey.clone(), o)).collect(),
        );
    }

    let snapshot = integrity::evaluate(&deps.dataschema, &merged_by_type, &TeraIntegrityEvaluator)?;
    summary.integrity_diagnostics = snapshot.by_type.values().flat_map(|o| o.diagnostics.clone()).collect();

    for entity in &deps.dataschema.types {
        let Some(outcome) = snapshot.by_type.get(&entity.name) else {
            continue;
        };

        let cached_map = cached_by_type.get(&entity.name).cloned().unwrap_or_default();
        let diff = cdc_relay_domain::diff::diff_type(&cached_map, &outcome.kept);
        let cacheonly = entity.cacheonly_attribute_names();
        let secrets = secrets_by_type.get(&entity.name).cloned().unwrap_or_default();

        let mut changes: Vec<(Object, Option<Object>)> = Vec::with_capacity(diff.added.len() + diff.modified.len() + diff.removed.len());

        for obj in &diff.added {
            let step = StepCounter(step_counter.fetch_add(1, Ordering::SeqCst));
            let secret = secrets.get(&obj.pkey.to_string());
            let event = build_event(Operation::Added, entity, deps.dataschema.revision, obj, None, secret, &cacheonly, step);
            deps.bus.publish(&event).await?;
            if run_commit_one(entity, &deps.datasources, obj, None).await {
                deps.cache.put(&entity.name, obj).await?;
            }
            changes.push((obj.clone(), None));
            summary.published += 1;
        }

        for pair in &diff.modified {
            let step = StepCounter(step_counter.fetch_add(1, Ordering::SeqCst));
            let secret = secrets.get(&pair.new.pkey.to_string());
            let event = build_event(Operation::Modified, entity, deps.dataschema.revision, &pair.new, Some(&pair.old), secret, &cacheonly, step);
            deps.bus.publish(&event).await?;
            if run_commit_one(entity, &deps.datasources, &pair.new, Some(&pair.old)).await {
                deps.cache.put(&entity.name, &pair.new).await?;
            }
            changes.push((pair.new.clone(), Some(pair.old.clone())));
            summary.published += 1;
        }

        for obj in &diff.removed {
            let step = StepCounter(step_counter.fetch_add(1, Ordering::SeqCst));
            let event = build_event(Operation::Removed, entity, deps.dataschema.revision, obj, None, None, &cacheonly, step);
            deps.bus.publish(&event).await?;
            if run_commit_one(entity, &deps.datasources, obj, Some(obj)).await {
                deps.cache.remove(&entity.name, &obj.remote_pkey).await?;
            }
            changes.push((obj.clone(), Some(obj.clone())));
            summary.published += 1;
        }

        run_commit_all(entity, &deps.datasources, &changes).await;
    }

    Ok(summary)
}

/// Fetch and project every source bound to `entity`, concurrently.
/// Returns the merge-ready rows per source, this cycle's secret
/// attributes keyed by local pkey, and one diagnostic per source that
/// could not be fetched at all (a missing driver, a fetch error).
async fn fetch_entity(
    entity: &EntityType,
    datasources: &DatasourceRegistry,
) -> (Vec<SourceRows>, BTreeMap<String, BTreeMap<String, TypedValue>>, Vec<MergeDiagnostic>) {
    let futures = entity.sources.iter().map(|binding| fetch_one_source(entity, binding, datasources));
    let results = futures::future::join_all(futures).await;

    let mut fetched = Vec::with_capacity(entity.sources.len());
    let mut secrets: BTreeMap<String, BTreeMap<String, TypedValue>> = BTreeMap::new();
    let mut diagnostics = Vec::new();

    for (binding, result) in entity.sources.iter().zip(results) {
        match result {
            Ok((rows, source_secrets)) => {
                for (local_pkey, attrs) in source_secrets {
                    secrets.entry(local_pkey).or_default().extend(attrs);
                }
                fetched.push(SourceRows {
                    source_name: binding.name.clone(),
                    rows,
                });
            }
            Err(reason) => diagnostics.push(MergeDiagnostic {
                local_pkey: None,
                source: Some(binding.name.clone()),
                reason,
            }),
        }
    }

    (fetched, secrets, diagnostics)
}

type ProjectedSource = (Vec<ProjectedRow>, Vec<(String, BTreeMap<String, TypedValue>)>);

async fn fetch_one_source(entity: &EntityType, binding: &SourceBinding, datasources: &DatasourceRegistry) -> Result<ProjectedSource, String> {
    let driver = datasources
        .get(&binding.driver_ref)
        .ok_or_else(|| format!("no datasource configured for driver_ref '{}'", binding.driver_ref))?;

    let rows = driver
        .fetch(&binding.fetch_query, &BTreeMap::new())
        .await
        .map_err(|e| e.to_string())?;

    let mut projected = Vec::with_capacity(rows.len());
    let mut secrets = Vec::new();

    for row in rows {
        let mut full_attrs = BTreeMap::new();
        for (name, mapping) in &binding.attribute_mappings {
            let value = project_attribute(mapping, &row).map_err(|e| e.to_string())?;
            full_attrs.insert(name.clone(), value);
        }

        let local_pkey = local_pkey_from_attrs(entity, &full_attrs).map_err(|e| e.to_string())?;
        let local_pkey_str = local_pkey.to_string();

        let mut cache_attrs = BTreeMap::new();
        let mut secret_attrs = BTreeMap::new();
        for (name, value) in full_attrs {
            if binding.local_attrs.contains(&name) {
                continue;
            }
            if binding.secret_attrs.contains(&name) {
                secret_attrs.insert(name, value);
            } else {
                cache_attrs.insert(name, value);
            }
        }

        if !secret_attrs.is_empty() {
            secrets.push((local_pkey_str, secret_attrs));
        }
        projected.push(ProjectedRow {
            local_pkey,
            attrs: cache_attrs,
        });
    }

    Ok((projected, secrets))
}

fn local_pkey_from_attrs(entity: &EntityType, attrs: &BTreeMap<String, TypedValue>) -> Result<PrimaryKeyValue, RelayError> {
    let names = entity.primary_key.attribute_names();
    let mut values = Vec::with_capacity(names.len());
    for name in &names {
        let value = attrs
            .get(*name)
            .cloned()
            .ok_or_else(|| RelayError::projection_error(format!("primary key attribute '{name}' missing from projected row")))?;
        values.push(value);
    }
    match &entity.primary_key {
        PrimaryKeySpec::Simple(_) => Ok(PrimaryKeyValue::Simple(values.into_iter().next().expect("exactly one attribute name"))),
        PrimaryKeySpec::Composite(_) => Ok(PrimaryKeyValue::Composite(values)),
    }
}

/// Assign each merged row its `remote_pkey` and foreign keys, turning it
/// into the `Object` shape the integrity evaluator, differ, and cache
/// all share.
async fn build_objects(
    entity: &EntityType,
    merged_rows: Vec<MergedRow>,
    cache: &dyn CacheStore,
    secrets: &BTreeMap<String, BTreeMap<String, TypedValue>>,
) -> Result<Vec<Object>, RelayError> {
    let mut objects = Vec::with_capacity(merged_rows.len());
    for row in merged_rows {
        let remote_pkey = match cache.remote_pkey_for_local(&entity.name, &row.local_pkey).await? {
            Some(existing) => existing,
            None => RemotePkeyValue::new(ulid::Ulid::new().to_string()),
        };

        let mut fkeys = BTreeMap::new();
        for attr_name in entity.foreign_keys.keys() {
            if let Some(value) = row.attrs.get(attr_name) {
                fkeys.insert(attr_name.clone(), PrimaryKeyValue::Simple(value.clone()));
            }
        }

        let local_pkey_str = row.local_pkey.to_string();
        let mut attrs = row.attrs;
        if let Some(secret_attrs) = secrets.get(&local_pkey_str) {
            attrs.insert(SECRET_FINGERPRINT_ATTR.to_string(), secret_fingerprint(secret_attrs));
        }

        objects.push(Object {
            remote_pkey,
            pkey: row.local_pkey,
            attrs,
            fkeys,
        });
    }
    Ok(objects)
}

/// Builds the event carried onto the bus for one changed object. `old` is
/// the previously cached object for `Modified` (used to compute the
/// attribute-level delta per §4.5) and is `None` for `Added`/`Removed`.
/// `Removed` carries no attrs at all — only `fkeys` — per §6.
fn build_event(
    op: Operation,
    entity: &EntityType,
    schema_rev: SchemaRevision,
    obj: &Object,
    old: Option<&Object>,
    secret_attrs: Option<&BTreeMap<String, TypedValue>>,
    cacheonly: &BTreeSet<String>,
    step: StepCounter,
) -> ChangeEvent {
    let mut attrs = match op {
        Operation::Removed => BTreeMap::new(),
        Operation::Modified => {
            let old_attrs = old.map(|o| &o.attrs);
            obj.attrs
                .iter()
                .filter(|(k, v)| old_attrs.and_then(|o| o.get(k.as_str())) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        }
        _ => obj.attrs.clone(),
    };
    for name in cacheonly {
        attrs.remove(name);
    }
    let fingerprint_in_delta = attrs.remove(SECRET_FINGERPRINT_ATTR).is_some();
    let secret_changed = !matches!(op, Operation::Modified) || fingerprint_in_delta;
    if let Some(secret) = secret_attrs {
        if secret_changed {
            attrs.extend(secret.clone());
        }
    }
    ChangeEvent {
        op,
        type_name: entity.name.clone(),
        pkey: obj.pkey.clone(),
        remote_pkey: obj.remote_pkey.clone(),
        step,
        schema_rev,
        attrs,
        fkeys: obj.fkeys.clone(),
    }
}

/// Run each source's `commit_one` hook for a single changed object,
/// binding `ITEM_FETCHED_VALUES`/`ITEM_CACHED_VALUES` (§4.6). Returns
/// whether every bound source's `commit_one_query` (if any) succeeded;
/// per §4.6/C8 the producer cache is only advanced for this object once
/// this returns `true`, so a commit failure leaves the cache pointed at
/// the previous value and the object will be re-diffed next cycle.
async fn run_commit_one(entity: &EntityType, datasources: &DatasourceRegistry, new_obj: &Object, old_obj: Option<&Object>) -> bool {
    let mut all_ok = true;
    for binding in &entity.sources {
        let Some(driver) = datasources.get(&binding.driver_ref) else {
            continue;
        };

        if let Some(command) = &binding.commit_one_query {
            let mut params = BTreeMap::new();
            params.insert("ITEM_FETCHED_VALUES".to_string(), TypedValue::Mapping(new_obj.attrs.clone()));
            params.insert(
                "ITEM_CACHED_VALUES".to_string(),
                TypedValue::Mapping(old_obj.map(|o| o.attrs.clone()).unwrap_or_default()),
            );
            if let Err(err) = driver.commit_one(command, &params).await {
                tracing::warn!(source = %binding.name, type_name = %entity.name, error = %err, "commit_one hook failed");
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Run each source's `commit_all` hook once per type, after every
/// `added`/`modified`/`removed` object for this cycle has been
/// processed, binding `FETCHED_VALUES`/`CACHED_VALUES` (§4.6). A
/// `commit_all` failure is logged but does not affect the cache: it is
/// bookkeeping across the whole batch, not a per-object gate.
async fn run_commit_all(entity: &EntityType, datasources: &DatasourceRegistry, changes: &[(Object, Option<Object>)]) {
    for binding in &entity.sources {
        let Some(driver) = datasources.get(&binding.driver_ref) else {
            continue;
        };

        if let Some(command) = &binding.commit_all_query {
            let fetched: Vec<TypedValue> = changes.iter().map(|(new_obj, _)| TypedValue::Mapping(new_obj.attrs.clone())).collect();
            let cached: Vec<TypedValue> = changes
                .iter()
                .filter_map(|(_, old_obj)| old_obj.as_ref().map(|o| TypedValue::Mapping(o.attrs.clone())))
                .collect();
            let mut params = BTreeMap::new();
            params.insert("FETCHED_VALUES".to_string(), TypedValue::List(fetched));
            params.insert("CACHED_VALUES".to_string(), TypedValue::List(cached));
            if let Err(err) = driver.commit_all(command, &params).await {
                tracing::warn!(source = %binding.name, type_name = %entity.name, error = %err, "commit_all hook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdc_relay_domain::ports::datasource::{MutationRequest, SourceRow};
    use cdc_relay_domain::schema::{AttributeMapping, OnMergeConflict, PkeyMergeConstraint};
    use std::sync::Mutex as StdMutex;

    struct StubDriver {
        rows: StdMutex<Vec<SourceRow>>,
        fail_commit_one: bool,
    }

    #[async_trait]
    impl DatasourceDriver for StubDriver {
        async fn fetch(&self, _query: &str, _params: &BTreeMap<String, TypedValue>) -> Result<Vec<SourceRow>, RelayError> {
            Ok(self.rows.lock().unwrap().clone())
        }
        async fn add(&self, _request: &MutationRequest) -> Result<(), RelayError> {
            Ok(())
        }
        async fn modify(&self, _request: &MutationRequest) -> Result<(), RelayError> {
            Ok(())
        }
        async fn delete(&self, _request: &MutationRequest) -> Result<(), RelayError> {
            Ok(())
        }
        async fn commit_one(&self, _command: &str, _params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
            if self.fail_commit_one {
                Err(RelayError::apply_fatal("commit_one rejected"))
            } else {
                Ok(())
            }
        }
        fn name(&self) -> &str {
            "stub"
        }
    }

    #[derive(Default)]
    struct StubCache {
        objects: StdMutex<BTreeMap<String, BTreeMap<RemotePkeyValue, Object>>>,
        local_index: StdMutex<BTreeMap<String, BTreeMap<String, RemotePkeyValue>>>,
    }

    #[async_trait]
    impl CacheStore for StubCache {
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
            Ok(self.objects.lock().unwrap().get(type_name).map(|m| m.values().cloned().collect()).unwrap_or_default())
        }

        async fn clear_type(&self, type_name: &str) -> Result<(), RelayError> {
            self.objects.lock().unwrap().remove(type_name);
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
    struct StubBus {
        published: StdMutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl MessageBusProducer for StubBus {
        async fn publish(&self, event: &ChangeEvent) -> Result<u64, RelayError> {
            let mut guard = self.published.lock().unwrap();
            guard.push(event.clone());
            Ok(guard.len() as u64 - 1)
        }
    }

    fn user_type() -> EntityType {
        EntityType {
            name: "user".into(),
            primary_key: PrimaryKeySpec::Simple("id".into()),
            foreign_keys: Default::default(),
            stringification_template: "{{ id }}".into(),
            on_merge_conflict: OnMergeConflict::KeepFirstValue,
            integrity_constraints: vec![],
            merge_constraints: vec![],
            sources: vec![SourceBinding {
                name: "primary".into(),
                driver_ref: "stub".into(),
                fetch_query: "select * from users".into(),
                attribute_mappings: BTreeMap::from([
                    ("id".to_string(), AttributeMapping::Concat(vec!["id".into()])),
                    ("name".to_string(), AttributeMapping::Concat(vec!["name".into()])),
                ]),
                pkey_merge_constraint: PkeyMergeConstraint::NoConstraint,
                cacheonly_attrs: Default::default(),
                secret_attrs: Default::default(),
                local_attrs: Default::default(),
                commit_one_query: None,
                commit_all_query: None,
            }],
        }
    }

    fn row(id: &str, name: &str) -> SourceRow {
        BTreeMap::from([
            ("id".to_string(), TypedValue::Text(id.to_string())),
            ("name".to_string(), TypedValue::Text(name.to_string())),
        ])
    }

    fn deps_with(driver: Arc<StubDriver>, cache: Arc<StubCache>, bus: Arc<StubBus>) -> ProducerDeps {
        deps_with_entity(user_type(), driver, cache, bus)
    }

    fn deps_with_entity(entity: EntityType, driver: Arc<StubDriver>, cache: Arc<StubCache>, bus: Arc<StubBus>) -> ProducerDeps {
        let mut datasources: DatasourceRegistry = BTreeMap::new();
        datasources.insert("stub".into(), driver as Arc<dyn DatasourceDriver>);
        ProducerDeps {
            dataschema: Dataschema::new(vec![entity]),
            datasources,
            cache,
            bus,
        }
    }

    /// A `user` type with a cacheonly `mail` attribute and a secret `pw`
    /// attribute, matching the pw/mail scenario used to exercise the
    /// secret-fingerprint and modified-delta behavior.
    fn user_type_with_secret() -> EntityType {
        let mut entity = user_type();
        let binding = &mut entity.sources[0];
        binding.attribute_mappings.insert("mail".to_string(), AttributeMapping::Concat(vec!["mail".into()]));
        binding.attribute_mappings.insert("pw".to_string(), AttributeMapping::Concat(vec!["pw".into()]));
        binding.secret_attrs = std::collections::BTreeSet::from(["pw".to_string()]);
        entity
    }

    fn row_with_secret(id: &str, mail: &str, pw: &str) -> SourceRow {
        BTreeMap::from([
            ("id".to_string(), TypedValue::Text(id.to_string())),
            ("name".to_string(), TypedValue::Text("Ada".to_string())),
            ("mail".to_string(), TypedValue::Text(mail.to_string())),
            ("pw".to_string(), TypedValue::Text(pw.to_string())),
        ])
    }

    #[tokio::test]
    async fn first_cycle_emits_added_events() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let deps = deps_with(driver, Arc::new(StubCache::default()), Arc::new(StubBus::default()));

        let counter = AtomicU64::new(0);
        let summary = run_cycle(&deps, &counter).await.unwrap();
        assert_eq!(summary.published, 1);
    }

    #[tokio::test]
    async fn second_cycle_reports_modified_for_changed_attribute() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();

        *driver.rows.lock().unwrap() = vec![row("1", "Ada Lovelace")];
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(bus.published.lock().unwrap().last().unwrap().op, Operation::Modified);
    }

    #[tokio::test]
    async fn unchanged_row_publishes_nothing_on_second_cycle() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver, Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 0);
        assert_eq!(bus.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn row_disappearing_from_source_emits_removed() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();

        driver.rows.lock().unwrap().clear();
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(bus.published.lock().unwrap().last().unwrap().op, Operation::Removed);
    }

    #[tokio::test]
    async fn remote_pkey_is_stable_across_cycles() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver, Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();
        run_cycle(&deps, &counter).await.unwrap();

        let events = bus.published.lock().unwrap();
        assert_eq!(events.len(), 1, "unchanged row should publish only once");
        let _ = events[0].remote_pkey.as_str();
    }

    #[tokio::test]
    async fn modified_event_carries_only_the_changed_attribute() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();

        *driver.rows.lock().unwrap() = vec![row("1", "Ada Lovelace")];
        run_cycle(&deps, &counter).await.unwrap();

        let events = bus.published.lock().unwrap();
        let modified = events.last().unwrap();
        assert_eq!(modified.attrs.len(), 1);
        assert_eq!(modified.attrs.get("name"), Some(&TypedValue::Text("Ada Lovelace".into())));
    }

    #[tokio::test]
    async fn removed_event_carries_no_attrs() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with(driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();

        driver.rows.lock().unwrap().clear();
        run_cycle(&deps, &counter).await.unwrap();

        let events = bus.published.lock().unwrap();
        assert!(events.last().unwrap().attrs.is_empty());
    }

    #[tokio::test]
    async fn secret_only_change_surfaces_as_modified_with_just_the_secret() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row_with_secret("1", "ada@example.com", "h1")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with_entity(user_type_with_secret(), driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();

        *driver.rows.lock().unwrap() = vec![row_with_secret("1", "ada@example.com", "h2")];
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 1);
        let events = bus.published.lock().unwrap();
        let modified = events.last().unwrap();
        assert_eq!(modified.op, Operation::Modified);
        assert_eq!(modified.attrs.len(), 1);
        assert_eq!(modified.attrs.get("pw"), Some(&TypedValue::Text("h2".into())));
    }

    #[tokio::test]
    async fn unchanged_secret_does_not_trigger_modified() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row_with_secret("1", "ada@example.com", "h1")]),
            fail_commit_one: false,
        });
        let bus = Arc::new(StubBus::default());
        let deps = deps_with_entity(user_type_with_secret(), driver.clone(), Arc::new(StubCache::default()), bus.clone());

        let counter = AtomicU64::new(0);
        run_cycle(&deps, &counter).await.unwrap();
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 0);
    }

    #[tokio::test]
    async fn cache_is_not_advanced_when_commit_one_fails() {
        let driver = Arc::new(StubDriver {
            rows: StdMutex::new(vec![row("1", "Ada")]),
            fail_commit_one: true,
        });
        let mut entity = user_type();
        entity.sources[0].commit_one_query = Some("mark-synced".to_string());
        let bus = Arc::new(StubBus::default());
        let cache = Arc::new(StubCache::default());
        let deps = deps_with_entity(entity, driver, cache.clone(), bus.clone());

        let counter = AtomicU64::new(0);
        let summary = run_cycle(&deps, &counter).await.unwrap();

        assert_eq!(summary.published, 1, "the event is still published even though the hook failed");
        assert!(cache.snapshot("user").await.unwrap().is_empty(), "cache must not advance on a failed commit_one");
    }
}
