// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SQL Datasource Driver (C4)
//!
//! Backed by `sqlx`'s backend-agnostic `Any` pool (SQLite and
//! PostgreSQL compiled in), so one driver implementation serves any
//! dataschema source declared with `driver_ref` pointing at a SQL
//! connection string. Parameters are bound positionally — never
//! interpolated into the query string — after rewriting `:name`
//! placeholders (the syntax dataschema authors write) to the backend's
//! native `?`/`$n` form.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::datasource::{DatasourceDriver, MutationRequest, SourceRow};
use cdc_relay_domain::value::TypedValue;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::any::{AnyPool, AnyPoolOptions, AnyRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::BTreeMap;

static NAMED_PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^:]):([A-Za-z_][A-Za-z0-9_]*)").unwrap());

pub struct SqlDriver {
    name: String,
    pool: AnyPool,
}

impl SqlDriver {
    pub async fn connect(name: impl Into<String>, connection_string: &str, max_connections: u32) -> Result<Self, RelayError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| RelayError::source_unavailable(format!("failed to connect: {e}")))?;
        Ok(Self { name: name.into(), pool })
    }

    /// Rewrite `:name` placeholders into `?` in source order, returning
    /// the rewritten query and the ordered list of parameter names to
    /// bind.
    fn rewrite_named_params(query: &str) -> (String, Vec<String>) {
        let mut names = Vec::new();
        let rewritten = NAMED_PARAM_RE.replace_all(query, |caps: &regex::Captures| {
            names.push(caps[1].to_string());
            let prefix = &caps[0][..caps[0].len() - caps[1].len() - 1];
            format!("{prefix}?")
        });
        (rewritten.into_owned(), names)
    }

    /// Run an arbitrary bound command (commit hooks, §4.6) without
    /// expecting rows back.
    async fn exec(&self, command: &str, params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
        let (rewritten, names) = Self::rewrite_named_params(command);
        let built = sqlx::query(&rewritten);
        let bound = bind_params(built, &names, params)?;
        bound
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::apply_retryable(format!("commit hook failed: {e}")))?;
        Ok(())
    }
}

fn row_to_source_row(row: &AnyRow) -> Result<SourceRow, RelayError> {
    let mut out = BTreeMap::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), any_value_to_typed(row, idx, column.type_info().name())?);
    }
    Ok(out)
}

/// Decode one column by attempting the Rust types the relay's typed
/// value model distinguishes, in order of specificity. `sqlx::any`
/// erases the concrete backend type, so this is the pragmatic way to
/// normalize SQLite and PostgreSQL column values into one `TypedValue`
/// without a per-backend decoder.
fn any_value_to_typed(row: &AnyRow, idx: usize, type_name: &str) -> Result<TypedValue, RelayError> {
    let decode_err = |e: sqlx::Error| RelayError::source_unavailable(format!("failed to decode column: {e}"));

    if row.try_get_raw(idx).map_err(decode_err)?.is_null() {
        return Ok(TypedValue::Null);
    }

    match type_name.to_ascii_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row.try_get::<bool, _>(idx).map(TypedValue::Bool).map_err(decode_err),
        "INT2" | "INT4" | "INT8" | "INTEGER" | "BIGINT" | "SMALLINT" => {
            row.try_get::<i64, _>(idx).map(TypedValue::Int).map_err(decode_err)
        }
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "NUMERIC" | "DECIMAL" => {
            row.try_get::<f64, _>(idx).map(TypedValue::Float).map_err(decode_err)
        }
        "BYTEA" | "BLOB" => row.try_get::<Vec<u8>, _>(idx).map(TypedValue::Bytes).map_err(decode_err),
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(TypedValue::Timestamp)
            .map_err(decode_err),
        _ => row.try_get::<String, _>(idx).map(TypedValue::Text).map_err(decode_err),
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    names: &'q [String],
    params: &'q BTreeMap<String, TypedValue>,
) -> Result<sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>, RelayError> {
    for name in names {
        let value = params
            .get(name)
            .ok_or_else(|| RelayError::source_unavailable(format!("missing bound parameter ':{name}'")))?;
        query = match value {
            TypedValue::Null => query.bind(None::<String>),
            TypedValue::Bool(b) => query.bind(*b),
            TypedValue::Int(i) => query.bind(*i),
            TypedValue::Float(f) => query.bind(*f),
            TypedValue::Text(s) => query.bind(s.clone()),
            TypedValue::Bytes(b) => query.bind(b.clone()),
            TypedValue::Timestamp(t) => query.bind(*t),
            TypedValue::List(_) | TypedValue::Mapping(_) => {
                query.bind(serde_json::to_string(value).map_err(|e| RelayError::SerializationError(e.to_string()))?)
            }
        };
    }
    Ok(query)
}

#[async_trait]
impl DatasourceDriver for SqlDriver {
    async fn fetch(&self, query: &str, params: &BTreeMap<String, TypedValue>) -> Result<Vec<SourceRow>, RelayError> {
        let (rewritten, names) = Self::rewrite_named_params(query);
        let built = sqlx::query(&rewritten);
        let bound = bind_params(built, &names, params)?;
        let rows = bound
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RelayError::source_unavailable(format!("query failed: {e}")))?;
        rows.iter().map(row_to_source_row).collect()
    }

    async fn add(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let (rewritten, names) = Self::rewrite_named_params(&request.target);
        let built = sqlx::query(&rewritten);
        let bound = bind_params(built, &names, &request.values)?;
        bound
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::apply_retryable(format!("insert failed: {e}")))?;
        Ok(())
    }

    async fn modify(&self, request: &MutationRequest) -> Result<(), RelayError> {
        self.add(request).await
    }

    async fn delete(&self, request: &MutationRequest) -> Result<(), RelayError> {
        self.add(request).await
    }

    async fn commit_one(&self, command: &str, params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
        if command.is_empty() {
            return Ok(());
        }
        self.exec(command, params).await
    }

    async fn commit_all(&self, command: &str, params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
        if command.is_empty() {
            return Ok(());
        }
        self.exec(command, params).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
