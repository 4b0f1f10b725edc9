// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # LDAP Datasource Driver (C4)
//!
//! `fetch_query` is an RFC 4515 filter string evaluated under the
//! driver's configured base DN; `params` are splice-escaped into the
//! filter through `ldap3::ldap_escape` rather than ever concatenated
//! raw, since a hostile attribute value reaching an LDAP filter
//! unescaped is a textbook injection vector.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::datasource::{DatasourceDriver, MutationRequest, SourceRow};
use cdc_relay_domain::value::TypedValue;
use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, Mod, Scope, SearchEntry};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

pub struct LdapDriver {
    name: String,
    url: String,
    bind_dn: String,
    bind_password: String,
    base_dn: String,
    conn: Mutex<Option<ldap3::Ldap>>,
}

impl LdapDriver {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        bind_dn: impl Into<String>,
        bind_password: impl Into<String>,
        base_dn: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bind_dn: bind_dn.into(),
            bind_password: bind_password.into(),
            base_dn: base_dn.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<ldap3::Ldap, RelayError> {
        let mut guard = self.conn.lock().await;
        if let Some(ldap) = guard.as_ref() {
            return Ok(ldap.clone());
        }
        let (connection, mut ldap) = LdapConnAsync::new(&self.url)
            .await
            .map_err(|e| RelayError::source_unavailable(format!("LDAP connect failed: {e}")))?;
        ldap3::drive!(connection);
        ldap.simple_bind(&self.bind_dn, &self.bind_password)
            .await
            .and_then(|r| r.success())
            .map_err(|e| RelayError::source_unavailable(format!("LDAP bind failed: {e}")))?;
        *guard = Some(ldap.clone());
        Ok(ldap)
    }

    /// Substitute `:name` placeholders in `filter` with the escaped
    /// string form of the matching bound parameter.
    fn render_filter(filter: &str, params: &BTreeMap<String, TypedValue>) -> String {
        let mut rendered = filter.to_string();
        for (name, value) in params {
            rendered = rendered.replace(&format!(":{name}"), &ldap_escape(value.to_string()));
        }
        rendered
    }
}

fn mutation_to_mods(values: &BTreeMap<String, TypedValue>) -> Vec<Mod<String>> {
    values
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| Mod::Replace(k.clone(), std::iter::once(v.to_string()).collect()))
        .collect()
}

#[async_trait]
impl DatasourceDriver for LdapDriver {
    async fn fetch(&self, query: &str, params: &BTreeMap<String, TypedValue>) -> Result<Vec<SourceRow>, RelayError> {
        let filter = Self::render_filter(query, params);
        let mut ldap = self.connection().await?;
        let (entries, _) = ldap
            .search(&self.base_dn, Scope::Subtree, &filter, vec!["*"])
            .await
            .and_then(|r| r.success())
            .map_err(|e| RelayError::source_unavailable(format!("LDAP search failed: {e}")))?;

        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let parsed = SearchEntry::construct(entry);
            let mut row = BTreeMap::new();
            row.insert("dn".to_string(), TypedValue::Text(parsed.dn.clone()));
            for (attr, values) in parsed.attrs {
                let value = match values.len() {
                    0 => TypedValue::Null,
                    1 => TypedValue::Text(values[0].clone()),
                    _ => TypedValue::List(values.into_iter().map(TypedValue::Text).collect()),
                };
                row.insert(attr, value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn add(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let mut ldap = self.connection().await?;
        let attrs: Vec<(String, std::collections::HashSet<String>)> = request
            .values
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), std::iter::once(v.to_string()).collect()))
            .collect();
        ldap.add(&request.target, attrs)
            .await
            .and_then(|r| r.success())
            .map_err(|e| RelayError::apply_retryable(format!("LDAP add failed: {e}")))?;
        Ok(())
    }

    async fn modify(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let mut ldap = self.connection().await?;
        ldap.modify(&request.target, mutation_to_mods(&request.values))
            .await
            .and_then(|r| r.success())
            .map_err(|e| RelayError::apply_retryable(format!("LDAP modify failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let mut ldap = self.connection().await?;
        ldap.delete(&request.target)
            .await
            .and_then(|r| r.success())
            .map_err(|e| RelayError::apply_retryable(format!("LDAP delete failed: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_filter_escapes_bound_parameter() {
        let mut params = BTreeMap::new();
        params.insert("cn".to_string(), TypedValue::Text("Ada)(uid=*".into()));
        let rendered = LdapDriver::render_filter("(cn=:cn)", &params);
        assert!(!rendered.contains(")(uid=*)"));
        assert!(rendered.starts_with("(cn=Ada"));
    }
}
