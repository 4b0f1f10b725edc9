// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Per-Type Multi-Source Merge (C5)
//!
//! `merge_type` folds the already-projected rows of every source bound
//! to one `EntityType` into a single row per local pkey.
//!
//! Per §4.3, merging proceeds source by source in declaration order.
//! For source `i`, let `A_i` be the pkeys it just fetched and `B_i` the
//! pkeys already in the accumulated merge result `M`. `pkey_merge_constraint`
//! is a pure set-membership check between `A_i` and `B_i` — evaluated
//! before any attribute is merged in — and `MustExistInBoth` additionally
//! narrows `M` itself to `A_i ∩ B_i`, dropping rows from earlier sources
//! that this source did not also report.
//!
//! Attribute-level conflicts (same pkey, two sources, different value)
//! are then resolved per `on_merge_conflict`; `merge_constraints` is
//! evaluated last, once per source step, over the fully merged rows.
//! Expression evaluation for `merge_constraints` is injected through
//! [`ExpressionEvaluator`] rather than imported directly: the domain
//! crate has no Tera dependency, so the concrete evaluator
//! (`cdc_relay::projection`) is supplied by the caller. This keeps the
//! merge algorithm itself pure and unit-testable with a stub evaluator.

use crate::error::RelayError;
use crate::schema::{Constraint, EntityType, OnMergeConflict, PkeyMergeConstraint};
use crate::value::{PrimaryKeyValue, TypedValue};
use std::collections::{BTreeMap, BTreeSet};

/// One source's already-projected row, keyed by that source's view of
/// the object's local primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRow {
    pub local_pkey: PrimaryKeyValue,
    pub attrs: BTreeMap<String, TypedValue>,
}

/// All rows fetched and projected from one source binding.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRows {
    pub source_name: String,
    pub rows: Vec<ProjectedRow>,
}

/// One row after merging across every source bound to a type.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub local_pkey: PrimaryKeyValue,
    pub attrs: BTreeMap<String, TypedValue>,
}

/// A recoverable problem encountered while merging, collected rather
/// than discarded so the producer can surface it in `ctl status` and
/// the per-cycle mail alert (§7).
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDiagnostic {
    pub local_pkey: Option<PrimaryKeyValue>,
    pub source: Option<String>,
    pub reason: String,
}

/// Result of merging every source bound to one type.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub rows: Vec<MergedRow>,
    pub diagnostics: Vec<MergeDiagnostic>,
}

/// Evaluates the boolean Tera expressions a dataschema's
/// `merge_constraints` are written in. Implemented in
/// `cdc_relay::projection` over the same filter registry C3 uses for
/// attribute mapping.
pub trait ExpressionEvaluator {
    /// Evaluate a `merge_constraints` expression against a fully merged
    /// row, with read access to already-merged predecessor types.
    fn row_satisfies(
        &self,
        expression: &str,
        row: &MergedRow,
        universe: &BTreeMap<String, Vec<MergedRow>>,
    ) -> Result<bool, RelayError>;
}

/// Merge every source bound to `entity` into one row per object.
///
/// `universe` holds the already-merged rows of every type declared
/// earlier than `entity` in the dataschema, for `merge_constraints` that
/// reference a predecessor type (DESIGN.md Open Question 1).
///
/// `cached` holds the previous cycle's cached attrs for `entity`, keyed
/// by local pkey string, so `OnMergeConflict::UseCachedEntry` has
/// something to fall back to.
pub fn merge_type(
    entity: &EntityType,
    fetched: &[SourceRows],
    universe: &BTreeMap<String, Vec<MergedRow>>,
    evaluator: &dyn ExpressionEvaluator,
    cached: &BTreeMap<String, BTreeMap<String, TypedValue>>,
) -> Result<MergeOutcome, RelayError> {
    let mut diagnostics = Vec::new();
    let mut merged: BTreeMap<String, MergedRow> = BTreeMap::new();
    let mut merged_order: Vec<String> = Vec::new();

    for binding in &entity.sources {
        let Some(source_rows) = fetched.iter().find(|f| f.source_name == binding.name) else {
            diagnostics.push(MergeDiagnostic {
                local_pkey: None,
                source: Some(binding.name.clone()),
                reason: "no rows fetched for this source this cycle".to_string(),
            });
            continue;
        };

        let a: BTreeSet<String> = source_rows.rows.iter().map(|r| r.local_pkey.to_string()).collect();
        let b: BTreeSet<String> = merged_order.iter().cloned().collect();

        match binding.pkey_merge_constraint {
            PkeyMergeConstraint::NoConstraint => {}
            PkeyMergeConstraint::MustNotExist => {
                let overlap: Vec<&String> = a.intersection(&b).collect();
                if !overlap.is_empty() {
                    diagnostics.push(MergeDiagnostic {
                        local_pkey: None,
                        source: Some(binding.name.clone()),
                        reason: format!(
                            "pkey_merge_constraint mustNotExist violated: {} overlapping pkey(s) dropped from this source",
                            overlap.len()
                        ),
                    });
                }
            }
            PkeyMergeConstraint::MustAlreadyExist => {
                let missing: BTreeSet<&String> = a.difference(&b).collect();
                if !missing.is_empty() {
                    diagnostics.push(MergeDiagnostic {
                        local_pkey: None,
                        source: Some(binding.name.clone()),
                        reason: format!(
                            "pkey_merge_constraint mustAlreadyExist: dropping {} pkey(s) not already merged",
                            missing.len()
                        ),
                    });
                }
            }
            PkeyMergeConstraint::MustExistInBoth => {
                let keep: BTreeSet<&String> = a.intersection(&b).collect();
                let dropped_from_merge: Vec<&String> = merged_order.iter().filter(|k| !keep.contains(k)).collect();
                if !dropped_from_merge.is_empty() {
                    diagnostics.push(MergeDiagnostic {
                        local_pkey: None,
                        source: Some(binding.name.clone()),
                        reason: format!(
                            "pkey_merge_constraint mustExistInBoth: dropping {} previously merged pkey(s) absent from this source",
                            dropped_from_merge.len()
                        ),
                    });
                }
                merged_order.retain(|k| keep.contains(k));
                merged.retain(|k, _| keep.contains(k));
            }
        }

        let b_after_narrowing: BTreeSet<String> = merged_order.iter().cloned().collect();

        for row in &source_rows.rows {
            let key = row.local_pkey.to_string();

            match binding.pkey_merge_constraint {
                PkeyMergeConstraint::MustNotExist if b.contains(&key) => continue,
                PkeyMergeConstraint::MustAlreadyExist if !b.contains(&key) => continue,
                PkeyMergeConstraint::MustExistInBoth if !b_after_narrowing.contains(&key) && !b.contains(&key) => {
                    continue;
                }
                _ => {}
            }

            match merged.get_mut(&key) {
                Some(existing) => {
                    if let Err(reason) = merge_attrs_into(existing, row, entity.on_merge_conflict, cached.get(&key)) {
                        diagnostics.push(MergeDiagnostic {
                            local_pkey: Some(row.local_pkey.clone()),
                            source: Some(binding.name.clone()),
                            reason,
                        });
                    }
                }
                None => {
                    merged.insert(
                        key.clone(),
                        MergedRow {
                            local_pkey: row.local_pkey.clone(),
                            attrs: row.attrs.clone(),
                        },
                    );
                    merged_order.push(key);
                }
            }
        }
    }

    let mut rows: Vec<MergedRow> = merged_order
        .into_iter()
        .filter_map(|k| merged.remove(&k))
        .collect();

    for constraint in &entity.merge_constraints {
        rows = filter_by_constraint(rows, constraint, universe, evaluator, &mut diagnostics)?;
    }

    Ok(MergeOutcome { rows, diagnostics })
}

fn merge_attrs_into(
    existing: &mut MergedRow,
    incoming: &ProjectedRow,
    policy: OnMergeConflict,
    cached_attrs: Option<&BTreeMap<String, TypedValue>>,
) -> Result<(), String> {
    for (key, incoming_value) in &incoming.attrs {
        match existing.attrs.get(key) {
            None => {
                existing.attrs.insert(key.clone(), incoming_value.clone());
            }
            Some(existing_value) if existing_value == incoming_value || existing_value.is_null() => {
                if existing_value.is_null() && !incoming_value.is_null() {
                    existing.attrs.insert(key.clone(), incoming_value.clone());
                }
            }
            Some(existing_value) => {
                if incoming_value.is_null() {
                    continue;
                }
                match policy {
                    OnMergeConflict::KeepFirstValue => {}
                    OnMergeConflict::UseCachedEntry => {
                        let cached_value = cached_attrs.and_then(|c| c.get(key));
                        match cached_value {
                            Some(cached_value) if cached_value == existing_value || cached_value == incoming_value => {
                                existing.attrs.insert(key.clone(), cached_value.clone());
                            }
                            _ => {
                                return Err(format!(
                                    "attribute '{key}' conflicts between sources ({existing_value} vs {incoming_value}) \
                                     and no consistent cached value is available for use_cached_entry"
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn filter_by_constraint(
    rows: Vec<MergedRow>,
    constraint: &Constraint,
    universe: &BTreeMap<String, Vec<MergedRow>>,
    evaluator: &dyn ExpressionEvaluator,
    diagnostics: &mut Vec<MergeDiagnostic>,
) -> Result<Vec<MergedRow>, RelayError> {
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        if evaluator.row_satisfies(&constraint.expression, &row, universe)? {
            kept.push(row);
        } else {
            diagnostics.push(MergeDiagnostic {
                local_pkey: Some(row.local_pkey.clone()),
                source: None,
                reason: format!("dropped by merge constraint '{}'", constraint.name),
            });
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PrimaryKeySpec;
    use std::collections::BTreeMap as Map;

    struct AlwaysTrueEvaluator;
    impl ExpressionEvaluator for AlwaysTrueEvaluator {
        fn row_satisfies(
            &self,
            _expression: &str,
            _row: &MergedRow,
            _universe: &Map<String, Vec<MergedRow>>,
        ) -> Result<bool, RelayError> {
            Ok(true)
        }
    }

    fn binding(name: &str, constraint: PkeyMergeConstraint) -> crate::schema::SourceBinding {
        crate::schema::SourceBinding {
            name: name.to_string(),
            driver_ref: "sql".into(),
            fetch_query: "select * from t".into(),
            attribute_mappings: Map::new(),
            pkey_merge_constraint: constraint,
            cacheonly_attrs: Default::default(),
            secret_attrs: Default::default(),
            local_attrs: Default::default(),
            commit_one_query: None,
            commit_all_query: None,
        }
    }

    fn entity_with_sources(sources: Vec<crate::schema::SourceBinding>) -> EntityType {
        EntityType {
            name: "user".into(),
            primary_key: PrimaryKeySpec::Simple("id".into()),
            foreign_keys: Map::new(),
            stringification_template: "{{ id }}".into(),
            on_merge_conflict: OnMergeConflict::KeepFirstValue,
            integrity_constraints: vec![],
            merge_constraints: vec![],
            sources,
        }
    }

    fn row(pkey: &str, attrs: &[(&str, TypedValue)]) -> ProjectedRow {
        ProjectedRow {
            local_pkey: PrimaryKeyValue::Simple(TypedValue::Text(pkey.into())),
            attrs: attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn source_rows(name: &str, rows: Vec<ProjectedRow>) -> SourceRows {
        SourceRows {
            source_name: name.to_string(),
            rows,
        }
    }

    #[test]
    fn merges_non_conflicting_attributes_across_sources() {
        let entity = entity_with_sources(vec![
            binding("primary", PkeyMergeConstraint::NoConstraint),
            binding("secondary", PkeyMergeConstraint::NoConstraint),
        ]);
        let fetched = vec![
            source_rows("primary", vec![row("u1", &[("name", TypedValue::Text("Ada".into()))])]),
            source_rows("secondary", vec![row("u1", &[("email", TypedValue::Text("ada@example.com".into()))])]),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        let merged = &outcome.rows[0];
        assert_eq!(merged.attrs.get("name"), Some(&TypedValue::Text("Ada".into())));
        assert_eq!(merged.attrs.get("email"), Some(&TypedValue::Text("ada@example.com".into())));
    }

    #[test]
    fn first_source_wins_on_conflict() {
        let entity = entity_with_sources(vec![
            binding("primary", PkeyMergeConstraint::NoConstraint),
            binding("secondary", PkeyMergeConstraint::NoConstraint),
        ]);
        let fetched = vec![
            source_rows("primary", vec![row("u1", &[("name", TypedValue::Text("Ada".into()))])]),
            source_rows("secondary", vec![row("u1", &[("name", TypedValue::Text("Other".into()))])]),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert_eq!(outcome.rows[0].attrs.get("name"), Some(&TypedValue::Text("Ada".into())));
    }

    #[test]
    fn use_cached_entry_falls_back_to_cached_value_on_conflict() {
        let mut entity = entity_with_sources(vec![
            binding("primary", PkeyMergeConstraint::NoConstraint),
            binding("secondary", PkeyMergeConstraint::NoConstraint),
        ]);
        entity.on_merge_conflict = OnMergeConflict::UseCachedEntry;
        let fetched = vec![
            source_rows("primary", vec![row("u1", &[("name", TypedValue::Text("Ada".into()))])]),
            source_rows("secondary", vec![row("u1", &[("name", TypedValue::Text("Other".into()))])]),
        ];
        let mut cached = Map::new();
        cached.insert("u1".to_string(), Map::from([("name".to_string(), TypedValue::Text("Ada".into()))]));
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &cached).unwrap();
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.rows[0].attrs.get("name"), Some(&TypedValue::Text("Ada".into())));
    }

    #[test]
    fn use_cached_entry_reports_diagnostic_when_no_consistent_cached_value() {
        let mut entity = entity_with_sources(vec![
            binding("primary", PkeyMergeConstraint::NoConstraint),
            binding("secondary", PkeyMergeConstraint::NoConstraint),
        ]);
        entity.on_merge_conflict = OnMergeConflict::UseCachedEntry;
        let fetched = vec![
            source_rows("primary", vec![row("u1", &[("name", TypedValue::Text("Ada".into()))])]),
            source_rows("secondary", vec![row("u1", &[("name", TypedValue::Text("Other".into()))])]),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert_eq!(outcome.diagnostics.len(), 1);
        assert!(outcome.diagnostics[0].reason.contains("conflicts"));
    }

    #[test]
    fn missing_source_rows_produce_diagnostic_not_error() {
        let entity = entity_with_sources(vec![
            binding("primary", PkeyMergeConstraint::NoConstraint),
            binding("secondary", PkeyMergeConstraint::NoConstraint),
        ]);
        let fetched = vec![source_rows("primary", vec![row("u1", &[("name", TypedValue::Text("Ada".into()))])])];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].source.as_deref(), Some("secondary"));
    }

    /// Spec §8 end-to-end scenario 3: source A reports {1,2,3}, source B
    /// reports {2,3,4} under `mustExistInBoth`. Merged pkeys = {2,3}; 4
    /// (only in B, the later source) is dropped silently.
    #[test]
    fn must_exist_in_both_keeps_only_the_intersection() {
        let entity = entity_with_sources(vec![
            binding("a", PkeyMergeConstraint::NoConstraint),
            binding("b", PkeyMergeConstraint::MustExistInBoth),
        ]);
        let fetched = vec![
            source_rows(
                "a",
                vec![
                    row("1", &[("name", TypedValue::Text("one".into()))]),
                    row("2", &[("name", TypedValue::Text("two".into()))]),
                    row("3", &[("name", TypedValue::Text("three".into()))]),
                ],
            ),
            source_rows(
                "b",
                vec![
                    row("2", &[("extra", TypedValue::Bool(true))]),
                    row("3", &[("extra", TypedValue::Bool(true))]),
                    row("4", &[("extra", TypedValue::Bool(true))]),
                ],
            ),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        let mut pkeys: Vec<String> = outcome.rows.iter().map(|r| r.local_pkey.to_string()).collect();
        pkeys.sort();
        assert_eq!(pkeys, vec!["2".to_string(), "3".to_string()]);
    }

    /// An empty fetch under `mustAlreadyExist` drops nothing from the
    /// merge result (retains `B \ A` as-is, per §8 boundary case).
    #[test]
    fn must_already_exist_with_empty_fetch_drops_nothing() {
        let entity = entity_with_sources(vec![
            binding("a", PkeyMergeConstraint::NoConstraint),
            binding("b", PkeyMergeConstraint::MustAlreadyExist),
        ]);
        let fetched = vec![
            source_rows("a", vec![row("1", &[("name", TypedValue::Text("one".into()))])]),
            source_rows("b", vec![]),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].local_pkey.to_string(), "1");
    }

    /// An empty fetch under `mustExistInBoth` drops everything, since the
    /// intersection with an empty set is empty (§8 boundary case).
    #[test]
    fn must_exist_in_both_with_empty_fetch_drops_everything() {
        let entity = entity_with_sources(vec![
            binding("a", PkeyMergeConstraint::NoConstraint),
            binding("b", PkeyMergeConstraint::MustExistInBoth),
        ]);
        let fetched = vec![
            source_rows("a", vec![row("1", &[("name", TypedValue::Text("one".into()))])]),
            source_rows("b", vec![]),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        assert!(outcome.rows.is_empty());
    }

    #[test]
    fn must_not_exist_drops_overlapping_pkeys_from_the_new_source() {
        let entity = entity_with_sources(vec![
            binding("a", PkeyMergeConstraint::NoConstraint),
            binding("b", PkeyMergeConstraint::MustNotExist),
        ]);
        let fetched = vec![
            source_rows("a", vec![row("1", &[("name", TypedValue::Text("one".into()))])]),
            source_rows(
                "b",
                vec![
                    row("1", &[("name", TypedValue::Text("dup".into()))]),
                    row("2", &[("name", TypedValue::Text("two".into()))]),
                ],
            ),
        ];
        let outcome = merge_type(&entity, &fetched, &Map::new(), &AlwaysTrueEvaluator, &Map::new()).unwrap();
        let mut pkeys: Vec<String> = outcome.rows.iter().map(|r| r.local_pkey.to_string()).collect();
        pkeys.sort();
        // Only the overlapping pkey ("1") is dropped from this source's
        // rows; the non-overlapping new pkey ("2") still merges in.
        assert_eq!(pkeys, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.rows.iter().find(|r| r.local_pkey.to_string() == "1").unwrap().attrs.get("name"), Some(&TypedValue::Text("one".into())));
    }
}
