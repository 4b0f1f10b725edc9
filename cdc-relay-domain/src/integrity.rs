// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Integrity Evaluation (C6)
//!
//! `evaluate` walks the dataschema's declared type order, evaluating
//! every type's `integrity_constraints` against each of its merged rows
//! with `_SELF` bound to the row itself and, for every other type, a
//! `U`/`U_pkeys` binding. Types are evaluated in declaration order so
//! that a row dropped from an earlier type is already absent from `U`
//! when a later type's constraints run.
//!
//! As with [`crate::merge`], expression evaluation is injected through
//! [`IntegrityEvaluator`] rather than imported — the concrete Tera-backed
//! evaluator lives in `cdc_relay::projection`.

use crate::error::RelayError;
use crate::object::Object;
use crate::schema::Dataschema;
use std::collections::BTreeMap;

/// Evaluates one integrity-constraint expression against a row, with
/// read access to every other type's currently-kept rows.
pub trait IntegrityEvaluator {
    fn row_satisfies(
        &self,
        expression: &str,
        row: &Object,
        universe: &BTreeMap<String, Vec<Object>>,
    ) -> Result<bool, RelayError>;
}

/// A row dropped by an integrity constraint, collected for diagnostics
/// rather than discarded.
#[derive(Debug, Clone)]
pub struct IntegrityDiagnostic {
    pub type_name: String,
    pub remote_pkey: crate::value::RemotePkeyValue,
    pub constraint_name: String,
}

/// Per-type result of integrity evaluation.
#[derive(Debug, Clone, Default)]
pub struct IntegrityOutcome {
    pub kept: Vec<Object>,
    pub diagnostics: Vec<IntegrityDiagnostic>,
}

/// Full-cycle integrity evaluation result, keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct IntegritySnapshot {
    pub by_type: BTreeMap<String, IntegrityOutcome>,
}

/// Evaluate every type's integrity constraints in dataschema declaration
/// order. `merged` holds each type's merged-but-not-yet-integrity-checked
/// rows (the output of [`crate::merge::merge_type`] across all types).
pub fn evaluate(
    dataschema: &Dataschema,
    merged: &BTreeMap<String, Vec<Object>>,
    evaluator: &dyn IntegrityEvaluator,
) -> Result<IntegritySnapshot, RelayError> {
    let mut universe: BTreeMap<String, Vec<Object>> = BTreeMap::new();
    let mut snapshot = IntegritySnapshot::default();

    for entity in &dataschema.types {
        let rows = merged.get(&entity.name).cloned().unwrap_or_default();
        let mut outcome = IntegrityOutcome::default();

        'row: for row in rows {
            for constraint in &entity.integrity_constraints {
                if !evaluator.row_satisfies(&constraint.expression, &row, &universe)? {
                    outcome.diagnostics.push(IntegrityDiagnostic {
                        type_name: entity.name.clone(),
                        remote_pkey: row.remote_pkey.clone(),
                        constraint_name: constraint.name.clone(),
                    });
                    continue 'row;
                }
            }
            outcome.kept.push(row);
        }

        universe.insert(entity.name.clone(), outcome.kept.clone());
        snapshot.by_type.insert(entity.name.clone(), outcome);
    }

    Ok(snapshot)
}
