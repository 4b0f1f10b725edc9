// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Producer Cache Diff (C7)
//!
//! `diff_type` compares a freshly merged, integrity-checked snapshot of
//! one type against the producer's cached snapshot from the previous
//! cycle. `remote_pkey` assignment (generating a synthetic identity for
//! a never-before-seen object) is the producer cache's job, done before
//! this function runs — `diff_type` only ever sees objects that already
//! carry one.

use crate::object::Object;
use crate::value::RemotePkeyValue;
use std::collections::BTreeMap;

/// The result of comparing a fresh snapshot against the cache: stable
/// `added -> modified -> removed` order within the type (§4.5).
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub added: Vec<Object>,
    pub modified: Vec<ModifiedPair>,
    pub removed: Vec<Object>,
}

/// A `(new, old)` pair for an object whose attributes changed.
#[derive(Debug, Clone)]
pub struct ModifiedPair {
    pub new: Object,
    pub old: Object,
}

/// Compare `fresh` (this cycle's merged objects, in merge order) against
/// `cached` (the producer cache from the previous cycle).
pub fn diff_type(cached: &BTreeMap<RemotePkeyValue, Object>, fresh: &[Object]) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    let mut seen: std::collections::BTreeSet<&RemotePkeyValue> = std::collections::BTreeSet::new();

    for obj in fresh {
        seen.insert(&obj.remote_pkey);
        match cached.get(&obj.remote_pkey) {
            None => outcome.added.push(obj.clone()),
            Some(cached_obj) => {
                if !obj.attrs_equal(cached_obj) || obj.fkeys != cached_obj.fkeys || obj.pkey != cached_obj.pkey {
                    outcome.modified.push(ModifiedPair {
                        new: obj.clone(),
                        old: cached_obj.clone(),
                    });
                }
            }
        }
    }

    for (remote_pkey, cached_obj) in cached {
        if !seen.contains(remote_pkey) {
            outcome.removed.push(cached_obj.clone());
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{PrimaryKeyValue, TypedValue};

    fn obj(remote: &str, local: &str, name: &str) -> Object {
        let mut o = Object::new(RemotePkeyValue::new(remote), PrimaryKeyValue::Simple(TypedValue::Text(local.into())));
        o.attrs.insert("name".into(), TypedValue::Text(name.into()));
        o
    }

    #[test]
    fn new_object_is_added() {
        let cached = BTreeMap::new();
        let fresh = vec![obj("r1", "u1", "Ada")];
        let out = diff_type(&cached, &fresh);
        assert_eq!(out.added.len(), 1);
        assert!(out.modified.is_empty());
        assert!(out.removed.is_empty());
    }

    #[test]
    fn unchanged_object_is_not_reported() {
        let cached_obj = obj("r1", "u1", "Ada");
        let mut cached = BTreeMap::new();
        cached.insert(cached_obj.remote_pkey.clone(), cached_obj.clone());
        let fresh = vec![cached_obj];
        let out = diff_type(&cached, &fresh);
        assert!(out.added.is_empty());
        assert!(out.modified.is_empty());
        assert!(out.removed.is_empty());
    }

    #[test]
    fn changed_attribute_is_modified() {
        let cached_obj = obj("r1", "u1", "Ada");
        let mut cached = BTreeMap::new();
        cached.insert(cached_obj.remote_pkey.clone(), cached_obj.clone());
        let fresh = vec![obj("r1", "u1", "Ada Lovelace")];
        let out = diff_type(&cached, &fresh);
        assert_eq!(out.modified.len(), 1);
        assert_eq!(out.modified[0].old.attrs.get("name"), Some(&TypedValue::Text("Ada".into())));
        assert_eq!(out.modified[0].new.attrs.get("name"), Some(&TypedValue::Text("Ada Lovelace".into())));
    }

    #[test]
    fn absent_cached_object_is_removed() {
        let cached_obj = obj("r1", "u1", "Ada");
        let mut cached = BTreeMap::new();
        cached.insert(cached_obj.remote_pkey.clone(), cached_obj);
        let fresh: Vec<Object> = vec![];
        let out = diff_type(&cached, &fresh);
        assert_eq!(out.removed.len(), 1);
    }
}
