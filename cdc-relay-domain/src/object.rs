// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Object
//!
//! `Object` is one merged, cached instance of an `EntityType`: the
//! result of projecting and merging every source binding for one
//! `remote_pkey` (C3/C5). It is the unit the producer diffs against its
//! cache (C7), the unit a consumer stores in its own cache (C11), and
//! the shape `attrs`/`fkeys` on a [`crate::events::ChangeEvent`] are
//! drawn from.

use crate::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One merged object of a given `EntityType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub remote_pkey: RemotePkeyValue,
    pub pkey: PrimaryKeyValue,
    pub attrs: BTreeMap<String, TypedValue>,
    pub fkeys: BTreeMap<String, PrimaryKeyValue>,
}

impl Object {
    pub fn new(remote_pkey: RemotePkeyValue, pkey: PrimaryKeyValue) -> Self {
        Self {
            remote_pkey,
            pkey,
            attrs: BTreeMap::new(),
            fkeys: BTreeMap::new(),
        }
    }

    /// `true` if every attribute the two objects have in common agrees,
    /// used by the differ (C7) to decide `modified` vs. no-op. Extra or
    /// missing keys (from schema evolution, mid-cycle) still count as a
    /// difference.
    pub fn attrs_equal(&self, other: &Object) -> bool {
        self.attrs == other.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_object_has_empty_attrs() {
        let obj = Object::new(RemotePkeyValue::new("r1"), PrimaryKeyValue::Simple(TypedValue::Int(1)));
        assert!(obj.attrs.is_empty());
        assert!(obj.fkeys.is_empty());
    }

    #[test]
    fn attrs_equal_detects_difference() {
        let mut a = Object::new(RemotePkeyValue::new("r1"), PrimaryKeyValue::Simple(TypedValue::Int(1)));
        let mut b = a.clone();
        assert!(a.attrs_equal(&b));
        a.attrs.insert("name".into(), TypedValue::Text("x".into()));
        assert!(!a.attrs_equal(&b));
        b.attrs.insert("name".into(), TypedValue::Text("x".into()));
        assert!(a.attrs_equal(&b));
    }
}
