// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Flatfile Datasource Driver (C4)
//!
//! Reads a CSV file from disk on every `fetch`. `fetch_query` is treated
//! as a literal file path rather than a query language: a CSV file has
//! no notion of filtering, so the entire file is returned and any
//! narrowing happens in the source binding's `attribute_mappings`/merge
//! constraints. `add`/`modify`/`delete` append, rewrite, or remove a row
//! by the configured key column — the only mutation shape a flat CSV
//! sensibly supports.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::datasource::{DatasourceDriver, MutationRequest, SourceRow};
use cdc_relay_domain::value::TypedValue;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FlatfileDriver {
    name: String,
    path: PathBuf,
    key_column: String,
    /// CSV row mutation is read-modify-write-the-whole-file; serialized
    /// through a lock so concurrent `add`/`modify`/`delete` calls from
    /// the consumer's apply loop cannot interleave and corrupt the file.
    write_lock: Mutex<()>,
}

impl FlatfileDriver {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, key_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            key_column: key_column.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_all_rows(&self) -> Result<Vec<BTreeMap<String, String>>, RelayError> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| RelayError::source_unavailable(e.to_string()))?;
        let headers = reader.headers().map_err(|e| RelayError::source_unavailable(e.to_string()))?.clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| RelayError::source_unavailable(e.to_string()))?;
            let row: BTreeMap<String, String> = headers.iter().map(String::from).zip(record.iter().map(String::from)).collect();
            rows.push(row);
        }
        Ok(rows)
    }

    fn write_all_rows(&self, rows: &[BTreeMap<String, String>]) -> Result<(), RelayError> {
        let mut headers: Vec<String> = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
        headers.sort();
        let mut writer = csv::Writer::from_path(&self.path).map_err(|e| RelayError::apply_retryable(e.to_string()))?;
        writer.write_record(&headers).map_err(|e| RelayError::apply_retryable(e.to_string()))?;
        for row in rows {
            let record: Vec<&str> = headers.iter().map(|h| row.get(h).map(String::as_str).unwrap_or("")).collect();
            writer.write_record(&record).map_err(|e| RelayError::apply_retryable(e.to_string()))?;
        }
        writer.flush().map_err(|e| RelayError::apply_retryable(e.to_string()))?;
        Ok(())
    }

    fn typed_row_to_string_row(values: &BTreeMap<String, TypedValue>) -> BTreeMap<String, String> {
        values.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
    }
}

#[async_trait]
impl DatasourceDriver for FlatfileDriver {
    async fn fetch(&self, _query: &str, _params: &BTreeMap<String, TypedValue>) -> Result<Vec<SourceRow>, RelayError> {
        let rows = self.read_all_rows()?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, v)| (k, TypedValue::Text(v))).collect())
            .collect())
    }

    async fn add(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().map_err(|_| RelayError::internal_error("flatfile write lock poisoned"))?;
        let mut rows = self.read_all_rows().unwrap_or_default();
        rows.push(Self::typed_row_to_string_row(&request.values));
        self.write_all_rows(&rows)
    }

    async fn modify(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().map_err(|_| RelayError::internal_error("flatfile write lock poisoned"))?;
        let mut rows = self.read_all_rows()?;
        let key_value = request
            .values
            .get(&self.key_column)
            .map(|v| v.to_string())
            .ok_or_else(|| RelayError::apply_fatal(format!("mutation missing key column '{}'", self.key_column)))?;
        let replacement = Self::typed_row_to_string_row(&request.values);
        let mut found = false;
        for row in rows.iter_mut() {
            if row.get(&self.key_column) == Some(&key_value) {
                *row = replacement.clone();
                found = true;
                break;
            }
        }
        if !found {
            rows.push(replacement);
        }
        self.write_all_rows(&rows)
    }

    async fn delete(&self, request: &MutationRequest) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().map_err(|_| RelayError::internal_error("flatfile write lock poisoned"))?;
        let mut rows = self.read_all_rows()?;
        let key_value = request
            .values
            .get(&self.key_column)
            .map(|v| v.to_string())
            .ok_or_else(|| RelayError::apply_fatal(format!("mutation missing key column '{}'", self.key_column)))?;
        rows.retain(|row| row.get(&self.key_column) != Some(&key_value));
        self.write_all_rows(&rows)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
