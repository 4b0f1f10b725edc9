// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dataschema
//!
//! The dataschema is the single declarative description of what a relay
//! watches: one [`EntityType`] per logical object kind, in an order that
//! is semantically significant — it fixes the evaluation order for
//! cross-type `merge_constraints` (C5) and integrity constraints (C6),
//! and the publish/apply order for a cycle's events (C8/C11).
//!
//! A `Dataschema` carries its own [`SchemaRevision`], bumped by the
//! operator on every change; consumers compare the revision on an
//! incoming event's envelope against their own and run
//! [`Dataschema::diff`] against the schema they last evolved from when
//! the two disagree.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monotonic dataschema revision. Compared, never arithmetically
/// combined, so it is a thin newtype rather than a bare `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaRevision(pub u64);

impl SchemaRevision {
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SchemaRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// How an `EntityType`'s primary key is formed out of its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKeySpec {
    Simple(String),
    Composite(Vec<String>),
}

impl PrimaryKeySpec {
    /// Attribute names participating in the key, in declared order.
    pub fn attribute_names(&self) -> Vec<&str> {
        match self {
            Self::Simple(name) => vec![name.as_str()],
            Self::Composite(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// A reference from one type's attribute to another type's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub parent_type: String,
    pub parent_attr: String,
}

/// Conflict policy applied when two sources of the same type disagree on
/// an attribute value after pkey-merge reconciliation (C5 §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMergeConflict {
    /// Keep the value from the previously cached object if one is
    /// available and consistent with either conflicting value;
    /// otherwise the row fails with a recoverable diagnostic.
    UseCachedEntry,
    /// Keep the value already in the merge result — i.e. the value
    /// supplied by the first source (declaration order) to report it.
    KeepFirstValue,
}

/// How one attribute's value is derived from a source row (C3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeMapping {
    /// A Tera template string evaluated against the row, the cached
    /// object's attributes, and the filter registry.
    Expression(String),
    /// A bare list of source column names concatenated in order,
    /// skipping null values; an empty list omits the attribute.
    Concat(Vec<String>),
}

/// A Tera boolean expression evaluated for every merged row of a type
/// (C5 `merge_constraints`, C6 `integrity_constraints`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub expression: String,
}

/// Per-source predicate controlling which local pkeys survive a merge
/// step (C5 §4.3). Evaluated purely over pkey set membership between
/// the source just fetched (`A`) and the accumulated merge result so
/// far (`B`) — never over attribute content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkeyMergeConstraint {
    /// No membership check; every pkey from this source is merged in.
    NoConstraint,
    /// `A ∩ B = ∅`: none of this source's pkeys may already be in the
    /// merge result. Overlapping pkeys fail the constraint.
    MustNotExist,
    /// `A ⊆ B`: every pkey from this source must already be in the
    /// merge result; pkeys in `A \ B` are dropped, `B \ A` is untouched.
    MustAlreadyExist,
    /// `M := A ∩ B`: the merge result is narrowed to the intersection;
    /// pkeys only in `B` are dropped from the merge result entirely.
    MustExistInBoth,
}

/// One datasource bound to an `EntityType`. Declaration order among a
/// type's `sources` is the tie-break order for pkey-merge conflicts and
/// the invocation order for `commit_one` after publish (C5/C8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    /// Unique name for this binding within the type (used in diagnostics
    /// and in the `_hermesconfig`-equivalent persisted state).
    pub name: String,
    /// Name of a configured datasource driver instance (resolved against
    /// the infrastructure layer's driver registry at startup).
    pub driver_ref: String,
    /// Driver-specific fetch command: a SQL query, an LDAP filter
    /// expression, or a flatfile path, bound through the driver's own
    /// parameter syntax.
    pub fetch_query: String,
    /// Per-attribute projection rules (C3).
    pub attribute_mappings: BTreeMap<String, AttributeMapping>,
    /// Constraint reconciling this source's pkeys against the merge
    /// result accumulated by prior sources, evaluated before
    /// attribute-level merge (C5 §4.3).
    pub pkey_merge_constraint: PkeyMergeConstraint,
    /// Attributes persisted to the producer cache and diffed, but never
    /// emitted on the bus (§3 Attribute Classes).
    #[serde(default)]
    pub cacheonly_attrs: std::collections::BTreeSet<String>,
    /// Attributes emitted on every add/modify event but never cached, so
    /// they carry no diff baseline and always appear as changed (§3).
    #[serde(default)]
    pub secret_attrs: std::collections::BTreeSet<String>,
    /// Attributes computed for use within this binding only (for example
    /// a watermark fed back into the next cycle's `fetch_query`) — never
    /// merged, cached, diffed, or emitted (§3).
    #[serde(default)]
    pub local_attrs: std::collections::BTreeSet<String>,
    /// Optional driver-specific command run after each event from this
    /// source is acknowledged by the bus, with `ITEM_FETCHED_VALUES`/
    /// `ITEM_CACHED_VALUES` bound in (§4.6).
    #[serde(default)]
    pub commit_one_query: Option<String>,
    /// Optional driver-specific command run once at the end of a cycle,
    /// with `FETCHED_VALUES`/`CACHED_VALUES` bound in (§4.6).
    #[serde(default)]
    pub commit_all_query: Option<String>,
}

/// The full declarative shape of one watched object kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub name: String,
    pub primary_key: PrimaryKeySpec,
    pub foreign_keys: BTreeMap<String, ForeignKeyRef>,
    pub stringification_template: String,
    pub on_merge_conflict: OnMergeConflict,
    pub integrity_constraints: Vec<Constraint>,
    pub merge_constraints: Vec<Constraint>,
    pub sources: Vec<SourceBinding>,
}

impl EntityType {
    /// Every attribute name referenced anywhere in the type's mappings,
    /// used by the schema evolver to compute added/removed attributes.
    pub fn known_attribute_names(&self) -> std::collections::BTreeSet<String> {
        self.sources
            .iter()
            .flat_map(|s| s.attribute_mappings.keys().cloned())
            .collect()
    }

    /// Attribute names any source binds as cache-only, across all sources.
    pub fn cacheonly_attribute_names(&self) -> std::collections::BTreeSet<String> {
        self.sources.iter().flat_map(|s| s.cacheonly_attrs.iter().cloned()).collect()
    }

    /// Attribute names any source binds as secret, across all sources.
    pub fn secret_attribute_names(&self) -> std::collections::BTreeSet<String> {
        self.sources.iter().flat_map(|s| s.secret_attrs.iter().cloned()).collect()
    }

    /// Attribute names any source binds as local, across all sources.
    pub fn local_attribute_names(&self) -> std::collections::BTreeSet<String> {
        self.sources.iter().flat_map(|s| s.local_attrs.iter().cloned()).collect()
    }
}

/// The ordered collection of watched object kinds plus its revision.
/// Declaration order is apply order; reverse declaration order is
/// removal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataschema {
    pub revision: SchemaRevision,
    pub types: Vec<EntityType>,
}

/// Structural equality ignores `revision`: two schemas with the same
/// types in the same order but different revision numbers are the same
/// schema for diffing purposes.
impl PartialEq for Dataschema {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
    }
}

impl Dataschema {
    pub fn new(types: Vec<EntityType>) -> Self {
        Self {
            revision: SchemaRevision::initial(),
            types,
        }
    }

    pub fn type_named(&self, name: &str) -> Option<&EntityType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Validate load-time invariants: `merge_constraints` may reference
    /// only types declared earlier in the schema (predecessor-only
    /// evaluation order, see DESIGN.md Open Question 1). Forward
    /// references are a config error, not a runtime one.
    pub fn validate(&self) -> Result<(), RelayError> {
        let predecessor_re = regex::Regex::new(r"\bU\s*\(\s*\"([A-Za-z0-9_]+)\"").unwrap();
        for (idx, t) in self.types.iter().enumerate() {
            let predecessors: std::collections::BTreeSet<&str> =
                self.types[..idx].iter().map(|p| p.name.as_str()).collect();
            for c in t.merge_constraints.iter().chain(t.integrity_constraints.iter()) {
                for cap in predecessor_re.captures_iter(&c.expression) {
                    let referenced = &cap[1];
                    if referenced != t.name && !predecessors.contains(referenced) {
                        return Err(RelayError::config_invalid(format!(
                            "constraint '{}' on type '{}' references type '{}' which is not declared earlier in the dataschema",
                            c.name, t.name, referenced
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Compute the structural difference from `previous` to `self`,
    /// consumed by the consumer schema evolver (C10).
    pub fn diff(&self, previous: &Dataschema) -> EvolutionPlan {
        let prev_names: std::collections::BTreeSet<&str> = previous.types.iter().map(|t| t.name.as_str()).collect();
        let curr_names: std::collections::BTreeSet<&str> = self.types.iter().map(|t| t.name.as_str()).collect();

        let removed_types: Vec<String> = prev_names.difference(&curr_names).map(|s| s.to_string()).collect();
        let added_types: Vec<String> = curr_names.difference(&prev_names).map(|s| s.to_string()).collect();

        let mut attributes_removed = BTreeMap::new();
        let mut attributes_added = BTreeMap::new();
        let mut renamed_primary_keys = BTreeMap::new();

        for curr in &self.types {
            let Some(prev) = previous.type_named(&curr.name) else {
                continue;
            };

            let prev_attrs = prev.known_attribute_names();
            let curr_attrs = curr.known_attribute_names();

            let removed: Vec<String> = prev_attrs.difference(&curr_attrs).cloned().collect();
            if !removed.is_empty() {
                attributes_removed.insert(curr.name.clone(), removed);
            }
            let added: Vec<String> = curr_attrs.difference(&prev_attrs).cloned().collect();
            if !added.is_empty() {
                attributes_added.insert(curr.name.clone(), added);
            }

            if prev.primary_key != curr.primary_key {
                renamed_primary_keys.insert(curr.name.clone(), (prev.primary_key.clone(), curr.primary_key.clone()));
            }
        }

        EvolutionPlan {
            removed_types,
            added_types,
            attributes_removed,
            attributes_added,
            renamed_primary_keys,
        }
    }
}

/// Output of [`Dataschema::diff`]: everything the consumer schema
/// evolver (C10) needs to bring a cache up to date with a new schema
/// without emitting any client-visible event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolutionPlan {
    pub removed_types: Vec<String>,
    pub added_types: Vec<String>,
    pub attributes_removed: BTreeMap<String, Vec<String>>,
    pub attributes_added: BTreeMap<String, Vec<String>>,
    pub renamed_primary_keys: BTreeMap<String, (PrimaryKeySpec, PrimaryKeySpec)>,
}

impl EvolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.removed_types.is_empty()
            && self.added_types.is_empty()
            && self.attributes_removed.is_empty()
            && self.attributes_added.is_empty()
            && self.renamed_primary_keys.is_empty()
    }
}
