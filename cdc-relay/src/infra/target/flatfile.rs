// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Flatfile Target Plugin (C11)
//!
//! Applies `added`/`modified`/`removed` events to a CSV file by
//! delegating to a private [`FlatfileDriver`] (C4) rather than
//! duplicating its read-modify-write-file mutation shape. The
//! configured `key_column` is stamped into the mutation's values under
//! the same column name the driver was built with, since a
//! `ChangeEvent`'s pkey travels as a field of the event, not as one
//! more entry in `attrs`.

use crate::infra::datasource::FlatfileDriver;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::ports::datasource::{DatasourceDriver, MutationRequest};
use cdc_relay_domain::ports::target::{ApplyContext, TargetPlugin};
use cdc_relay_domain::value::TypedValue;
use async_trait::async_trait;
use std::path::PathBuf;

pub struct FlatfileTarget {
    name: String,
    driver: FlatfileDriver,
    key_column: String,
}

impl FlatfileTarget {
    pub fn new(name: impl Into<String>, path: PathBuf, key_column: impl Into<String>) -> Self {
        let name = name.into();
        let key_column = key_column.into();
        Self {
            driver: FlatfileDriver::new(name.clone(), path, key_column.clone()),
            name,
            key_column,
        }
    }

    fn mutation_for(&self, event: &ChangeEvent) -> MutationRequest {
        let mut values = event.attrs.clone();
        values.insert(self.key_column.clone(), TypedValue::Text(event.pkey.to_string()));
        MutationRequest {
            target: event.type_name.clone(),
            values,
        }
    }
}

#[async_trait]
impl TargetPlugin for FlatfileTarget {
    async fn apply(&self, event: &ChangeEvent, _ctx: &mut ApplyContext) -> Result<(), RelayError> {
        let request = self.mutation_for(event);
        match event.op {
            Operation::Added => self.driver.add(&request).await,
            Operation::Modified => self.driver.modify(&request).await,
            Operation::Removed => self.driver.delete(&request).await,
            other => Err(RelayError::apply_fatal(format!("flatfile target cannot apply control operation '{other}'"))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::events::StepCounter;
    use cdc_relay_domain::schema::SchemaRevision;
    use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue};
    use std::collections::BTreeMap;

    fn event(op: Operation) -> ChangeEvent {
        let mut attrs = BTreeMap::new();
        attrs.insert("name".to_string(), TypedValue::Text("Ada".into()));
        ChangeEvent {
            op,
            type_name: "users".into(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Text("1".into())),
            remote_pkey: RemotePkeyValue::new("r1"),
            step: StepCounter::initial(),
            schema_rev: SchemaRevision::initial(),
            attrs,
            fkeys: Default::default(),
        }
    }

    #[tokio::test]
    async fn added_event_appends_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, "id,name\n").unwrap();
        let plugin = FlatfileTarget::new("flatfile-users", path.clone(), "id");
        let mut ctx = ApplyContext::new(false);

        plugin.apply(&event(Operation::Added), &mut ctx).await.unwrap();

        let rows = plugin.driver.fetch("", &BTreeMap::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&TypedValue::Text("Ada".into())));
    }

    #[tokio::test]
    async fn removed_event_deletes_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, "id,name\n1,Ada\n").unwrap();
        let plugin = FlatfileTarget::new("flatfile-users", path.clone(), "id");
        let mut ctx = ApplyContext::new(false);

        plugin.apply(&event(Operation::Removed), &mut ctx).await.unwrap();

        let rows = plugin.driver.fetch("", &BTreeMap::new()).await.unwrap();
        assert!(rows.is_empty());
    }
}
