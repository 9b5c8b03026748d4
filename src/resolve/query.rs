//! Bulk identifier lookup against the remote store
//!
//! All missing keys of one collection go out as a single filtered query
//! (`key eq 'a' or key eq 'b'`), so a resolution pass costs one round trip
//! per collection instead of one per key.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::{KeyKind, LookupSpec};
use crate::auth::TokenProvider;
use crate::error::{Result, SyncError};

/// Source of truth for key to identifier mappings
#[async_trait]
pub trait RecordQuery: Send + Sync {
    /// Fetch identifiers for `keys` in one round trip.
    ///
    /// Keys without a matching record are absent from the returned map.
    async fn fetch_ids(&self, spec: &LookupSpec, keys: &[String]) -> Result<HashMap<String, String>>;
}

/// Build the `$filter` expression matching any of `keys`
pub fn build_filter(spec: &LookupSpec, keys: &[String]) -> String {
    keys.iter()
        .map(|key| match spec.key_kind {
            KeyKind::Numeric if key.parse::<i64>().is_ok() => {
                format!("{} eq {}", spec.key_field, key)
            }
            _ => format!("{} eq '{}'", spec.key_field, key.replace('\'', "''")),
        })
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Map the `value` array of a query response to `key -> id`.
///
/// Non-string values are stringified; rows missing either field are skipped.
pub fn map_rows(body: &Value, key_field: &str, id_field: &str) -> HashMap<String, String> {
    let Some(rows) = body.get("value").and_then(Value::as_array) else {
        return HashMap::new();
    };

    rows.iter()
        .filter_map(|row| {
            let key = field_text(row.get(key_field)?)?;
            let id = field_text(row.get(id_field)?)?;
            Some((key, id))
        })
        .collect()
}

fn field_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// OData Web API query client
pub struct HttpRecordQuery {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpRecordQuery {
    /// `api_base` is `{resource}/api/data/{version}`
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }
}

#[async_trait]
impl RecordQuery for HttpRecordQuery {
    async fn fetch_ids(&self, spec: &LookupSpec, keys: &[String]) -> Result<HashMap<String, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/{}", self.api_base, spec.collection);
        let select = format!("{},{}", spec.id_field, spec.key_field);
        let filter = build_filter(spec, keys);
        let token = self.tokens.access_token().await?;

        debug!(
            collection = %spec.collection,
            keys = keys.len(),
            filter = %filter,
            "Bulk identifier query"
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("$select", select.as_str()), ("$filter", filter.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!(
                collection = %spec.collection,
                status = status.as_u16(),
                "Bulk identifier query rejected"
            );
            return Err(SyncError::RemoteQuery {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| SyncError::Decode(format!("query response for {}: {e}", spec.collection)))?;
        Ok(map_rows(&json, &spec.key_field, &spec.id_field))
    }
}
