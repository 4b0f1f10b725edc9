// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Change Events
//!
//! `ChangeEvent` is the wire event published by the producer and
//! consumed by every consumer: `op`, `type`, `pkey`, `step`,
//! `schema_rev`, `attrs`, `fkeys`. `BusEnvelope` wraps it with the
//! transport-level offset a [`crate::ports::bus`] implementation assigns
//! on publish.

use crate::schema::SchemaRevision;
use crate::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What happened to an object between two producer cycles, plus the
/// three bus control markers §4.7/§6 fold into the same stream:
/// `schema_update` announces a dataschema revision change, and
/// `initsync_begin`/`initsync_end` bracket the replay window a fresh
/// consumer bootstraps from (C15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Added,
    Modified,
    Removed,
    SchemaUpdate,
    InitsyncBegin,
    InitsyncEnd,
}

impl Operation {
    /// `true` for `added`/`modified`/`removed`: events that carry a real
    /// object change and flow through the cache/error-queue/foreign-key
    /// machinery. `false` for the three bus control markers, which the
    /// consume loop handles before C11's applier ever sees them.
    pub fn is_object_change(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Removed)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Removed => write!(f, "removed"),
            Self::SchemaUpdate => write!(f, "schema_update"),
            Self::InitsyncBegin => write!(f, "initsync_begin"),
            Self::InitsyncEnd => write!(f, "initsync_end"),
        }
    }
}

/// A monotonic per-producer counter distinguishing otherwise-identical
/// events for the same object (two `modified` events for one pkey in
/// the same cycle, say). Forms part of an event's dedupe identity on
/// redelivery (C9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepCounter(pub u64);

impl StepCounter {
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StepCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One change to one object, in the wire shape described by the
/// external interface: `op`, `type`, `pkey`, `step`, `schema_rev`,
/// `attrs`, `fkeys`. `attrs` is the full row for `added`, the changed
/// attributes only for `modified`, and empty for `removed` (which
/// carries `fkeys` instead, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: Operation,
    #[serde(rename = "type")]
    pub type_name: String,
    pub pkey: PrimaryKeyValue,
    pub remote_pkey: RemotePkeyValue,
    pub step: StepCounter,
    pub schema_rev: SchemaRevision,
    pub attrs: BTreeMap<String, TypedValue>,
    pub fkeys: BTreeMap<String, PrimaryKeyValue>,
}

/// Type name stamped on bus control markers (`schema_update`,
/// `initsync_begin`, `initsync_end`): these do not belong to any
/// `EntityType`, so `"__control__"` can never collide with a declared
/// dataschema type name, which are validated as identifiers.
pub const CONTROL_TYPE_NAME: &str = "__control__";

impl ChangeEvent {
    /// Build a bus control marker (`schema_update`, `initsync_begin`,
    /// `initsync_end`). Markers carry no object identity; `pkey` is a
    /// fixed sentinel so every marker of the same kind within one
    /// producer step still has a well-defined (if uninteresting)
    /// dedupe identity.
    pub fn marker(op: Operation, schema_rev: SchemaRevision, step: StepCounter) -> Self {
        debug_assert!(!op.is_object_change(), "marker() is only for control operations");
        Self {
            op,
            type_name: CONTROL_TYPE_NAME.to_string(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Null),
            remote_pkey: RemotePkeyValue::new(CONTROL_TYPE_NAME),
            step,
            schema_rev,
            attrs: BTreeMap::new(),
            fkeys: BTreeMap::new(),
        }
    }

    /// Identity used to recognize redelivery of an already-observed
    /// event: `(type, pkey, producer_step, operation)` (C9).
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            type_name: self.type_name.clone(),
            pkey: self.pkey.clone(),
            step: self.step,
            op: self.op,
        }
    }
}

/// Deduplication identity for a `ChangeEvent`. See [`ChangeEvent::identity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventIdentity {
    pub type_name: String,
    pub pkey: PrimaryKeyValue,
    pub step: StepCounter,
    pub op: Operation,
}

/// A `ChangeEvent` as it sits on the bus: transport offset plus payload.
/// `MessageBusProducer`/`MessageBusConsumer` implementations (C9) are
/// the only place an offset is assigned or interpreted; everything
/// upstream of publish and downstream of consume deals in bare
/// `ChangeEvent`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub offset: u64,
    pub event: ChangeEvent,
}
