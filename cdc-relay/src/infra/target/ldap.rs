// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # LDAP Target Plugin (C11)
//!
//! Applies `added`/`modified`/`removed` events against directory
//! entries by delegating to a private [`LdapDriver`] (C4). `dn_template`
//! carries a single `{pkey}` placeholder (e.g.
//! `"uid={pkey},ou=people,dc=example,dc=com"`); the pkey's rendered
//! `Display` form is spliced in directly since it is structural
//! (it addresses which entry to write) rather than filter syntax, so
//! none of the `ldap_escape` handling `LdapDriver::fetch` applies here.

use crate::infra::datasource::LdapDriver;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::ports::datasource::{DatasourceDriver, MutationRequest};
use cdc_relay_domain::ports::target::{ApplyContext, TargetPlugin};
use async_trait::async_trait;

pub struct LdapTarget {
    name: String,
    driver: LdapDriver,
    dn_template: String,
}

impl LdapTarget {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        bind_dn: impl Into<String>,
        bind_password: impl Into<String>,
        dn_template: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            // base_dn only matters to `LdapDriver::fetch`; target plugins
            // address entries by the DN `mutation_for` builds, not a search base.
            driver: LdapDriver::new(name.clone(), url.into(), bind_dn.into(), bind_password.into(), String::new()),
            name,
            dn_template: dn_template.into(),
        }
    }

    fn dn_for(&self, event: &ChangeEvent) -> String {
        self.dn_template.replace("{pkey}", &event.pkey.to_string())
    }

    fn mutation_for(&self, event: &ChangeEvent) -> MutationRequest {
        MutationRequest {
            target: self.dn_for(event),
            values: event.attrs.clone(),
        }
    }
}

#[async_trait]
impl TargetPlugin for LdapTarget {
    async fn apply(&self, event: &ChangeEvent, _ctx: &mut ApplyContext) -> Result<(), RelayError> {
        let request = self.mutation_for(event);
        match event.op {
            Operation::Added => self.driver.add(&request).await,
            Operation::Modified => self.driver.modify(&request).await,
            Operation::Removed => self.driver.delete(&request).await,
            other => Err(RelayError::apply_fatal(format!("LDAP target cannot apply control operation '{other}'"))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
