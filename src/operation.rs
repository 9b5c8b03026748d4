//! Data model for the batch execution core
//!
//! - [`Operation`]: one logical write (collection + ordered payload)
//! - [`Batch`]: ordered operations submitted as one atomic changeset
//! - [`OperationGroup`]: operations that must land in the same batch
//! - [`BatchExecutionResult`]: immutable outcome of one submission attempt
//! - [`CollectionRouting`]: per-collection addressing (alternate key vs. create)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Ordered mapping of field name to value
pub type Payload = Map<String, Value>;

// ============================================================================
// Operation
// ============================================================================

/// One logical write against the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Target resource collection (entity set name)
    pub collection: String,
    /// Field values, serialized in insertion order
    pub payload: Payload,
    /// 1-based position within its batch (assigned by [`Batch`])
    #[serde(default)]
    pub sequence: usize,
}

impl Operation {
    /// Create an operation with an empty payload
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            payload: Payload::new(),
            sequence: 0,
        }
    }

    /// Create an operation from an existing payload
    pub fn with_payload(collection: impl Into<String>, payload: Payload) -> Self {
        Self {
            collection: collection.into(),
            payload,
            sequence: 0,
        }
    }

    /// Set a field value
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Bind a navigation property to a record by internal identifier.
    ///
    /// Produces `"{nav}@odata.bind": "/{collection}({id})"`.
    pub fn bind(mut self, nav: &str, collection: &str, id: &str) -> Self {
        self.payload.insert(
            format!("{nav}@odata.bind"),
            Value::String(format!("/{collection}({id})")),
        );
        self
    }

    /// Bind a navigation property to a record by alternate key.
    ///
    /// Produces `"{nav}@odata.bind": "/{collection}({key}='{value}')"`, with
    /// the same escaping rules as batch addressing. A null key value leaves
    /// the payload untouched.
    pub fn bind_by_key(mut self, nav: &str, collection: &str, key: &str, value: &Value) -> Self {
        if let Some(predicate) = key_predicate(key, value) {
            self.payload.insert(
                format!("{nav}@odata.bind"),
                Value::String(format!("/{collection}({predicate})")),
            );
        }
        self
    }

    /// Look up a payload value, treating JSON null as absent
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.payload.get(field).filter(|v| !v.is_null())
    }
}

/// Format an alternate-key predicate for URL addressing.
///
/// Integer values are embedded unquoted so the remote store coerces them as
/// numbers. Everything else is quoted, with embedded quotes doubled and the
/// result percent-encoded for use inside a path segment. Returns `None` for
/// null values.
pub fn key_predicate(field: &str, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(format!("{field}={n}")),
        Value::String(s) => Some(format!("{field}='{}'", escape_key_text(s))),
        other => Some(format!("{field}='{}'", escape_key_text(&other.to_string()))),
    }
}

/// Double single quotes, then percent-encode for a URL path segment
pub fn escape_key_text(raw: &str) -> String {
    urlencoding::encode(&raw.replace('\'', "''")).into_owned()
}

// ============================================================================
// Batch / Groups
// ============================================================================

/// Operations that must be submitted in the same changeset
/// (e.g. a parent record and the children that reference it by key)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationGroup {
    pub operations: Vec<Operation>,
}

impl OperationGroup {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn single(operation: Operation) -> Self {
        Self {
            operations: vec![operation],
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Ordered sequence of operations executed as one atomic unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    operations: Vec<Operation>,
}

impl Batch {
    /// Build a batch, assigning contiguous 1-based sequence numbers
    pub fn new(operations: Vec<Operation>) -> Self {
        let operations = operations
            .into_iter()
            .enumerate()
            .map(|(i, mut op)| {
                op.sequence = i + 1;
                op
            })
            .collect();
        Self { operations }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// ============================================================================
// Routing
// ============================================================================

/// How sub-requests for a collection are addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// `PATCH collection(key=value)` upsert; the key field is mandatory
    AlternateKey { field: String },
    /// `POST collection` create
    Create,
}

/// Per-collection addressing rules
#[derive(Debug, Clone, Default)]
pub struct CollectionRouting {
    alternate_keys: HashMap<String, String>,
}

impl CollectionRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `collection -> key field` pairs
    pub fn from_pairs<I, C, F>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, F)>,
        C: Into<String>,
        F: Into<String>,
    {
        Self {
            alternate_keys: pairs
                .into_iter()
                .map(|(c, f)| (c.into(), f.into()))
                .collect(),
        }
    }

    /// Register an alternate key for a collection
    pub fn with_alternate_key(mut self, collection: impl Into<String>, field: impl Into<String>) -> Self {
        self.alternate_keys.insert(collection.into(), field.into());
        self
    }

    pub fn addressing(&self, collection: &str) -> Addressing {
        match self.alternate_keys.get(collection) {
            Some(field) => Addressing::AlternateKey {
                field: field.clone(),
            },
            None => Addressing::Create,
        }
    }

    pub fn alternate_key(&self, collection: &str) -> Option<&str> {
        self.alternate_keys.get(collection).map(String::as_str)
    }
}

/// Write semantics for alternate-key sub-requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or update the addressed record
    #[default]
    Upsert,
    /// Create only; an existing record answers 412, which counts as success
    CreateOnly,
}

// ============================================================================
// Execution Result
// ============================================================================

/// Outcome of one batch submission attempt.
///
/// Immutable once built: use the named constructors. `is_throttled` and
/// `is_success` are never both true.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchExecutionResult {
    is_success: bool,
    is_throttled: bool,
    success_count: usize,
    failed_indices: Vec<usize>,
    error_message: Option<String>,
    retry_after: Option<Duration>,
}

impl BatchExecutionResult {
    /// Every sub-operation succeeded
    pub fn success(success_count: usize) -> Self {
        Self {
            is_success: true,
            is_throttled: false,
            success_count,
            failed_indices: Vec::new(),
            error_message: None,
            retry_after: None,
        }
    }

    /// Remote store signalled rate limiting or overload
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            is_success: false,
            is_throttled: true,
            success_count: 0,
            failed_indices: Vec::new(),
            error_message: Some(message.into()),
            retry_after,
        }
    }

    /// Batch-level failure with no per-operation detail
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            is_throttled: false,
            success_count: 0,
            failed_indices: Vec::new(),
            error_message: Some(message.into()),
            retry_after: None,
        }
    }

    /// Per-operation outcome from a parsed response.
    ///
    /// Successful when no index failed. `failed_indices` are 0-based
    /// positions into the submitted batch.
    pub fn from_outcomes(success_count: usize, failed_indices: Vec<usize>) -> Self {
        if failed_indices.is_empty() {
            return Self::success(success_count);
        }
        let listed = failed_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            is_success: false,
            is_throttled: false,
            success_count,
            error_message: Some(format!("Some operations failed: {listed}")),
            failed_indices,
            retry_after: None,
        }
    }

    /// Returned when no attempt ever completed
    pub fn attempts_exhausted() -> Self {
        Self::failed("Max attempts reached or unknown error.")
    }

    pub fn is_success(&self) -> bool {
        self.is_success
    }

    pub fn is_throttled(&self) -> bool {
        self.is_throttled
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    pub fn failed_indices(&self) -> &[usize] {
        &self.failed_indices
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Success with nothing left to replay
    pub fn is_complete(&self) -> bool {
        self.is_success && self.failed_indices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_assigns_sequences() {
        let batch = Batch::new(vec![
            Operation::new("accounts"),
            Operation::new("accounts"),
            Operation::new("territories"),
        ]);
        let seqs: Vec<usize> = batch.operations().iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_key_predicate_quoting() {
        assert_eq!(key_predicate("dc_idpanel", &json!(42)).as_deref(), Some("dc_idpanel=42"));
        assert_eq!(
            key_predicate("dc_name", &json!("O'Brien")).as_deref(),
            Some("dc_name='O%27%27Brien'")
        );
        assert_eq!(
            key_predicate("dc_name", &json!("WO 1/2")).as_deref(),
            Some("dc_name='WO%201%2F2'")
        );
        assert_eq!(key_predicate("dc_name", &Value::Null), None);
    }

    #[test]
    fn test_bind_helpers() {
        let op = Operation::new("msdyn_workorders")
            .field("dc_name", "WO-1")
            .bind("msdyn_serviceaccount", "accounts", "00000000-0000-0000-0000-000000000001")
            .bind_by_key(
                "msdyn_parentworkorder_msdyn_workorder",
                "msdyn_workorders",
                "dc_name",
                &json!("WO-0"),
            );

        assert_eq!(
            op.payload["msdyn_serviceaccount@odata.bind"],
            json!("/accounts(00000000-0000-0000-0000-000000000001)")
        );
        assert_eq!(
            op.payload["msdyn_parentworkorder_msdyn_workorder@odata.bind"],
            json!("/msdyn_workorders(dc_name='WO-0')")
        );
        let keys: Vec<&String> = op.payload.keys().collect();
        assert_eq!(keys[0], "dc_name");
    }

    #[test]
    fn test_value_treats_null_as_absent() {
        let op = Operation::new("accounts").field("name", Value::Null);
        assert!(op.value("name").is_none());
        assert!(op.value("missing").is_none());
    }

    #[test]
    fn test_routing() {
        let routing = CollectionRouting::new().with_alternate_key("msdyn_workorders", "dc_name");
        assert_eq!(
            routing.addressing("msdyn_workorders"),
            Addressing::AlternateKey {
                field: "dc_name".into()
            }
        );
        assert_eq!(routing.addressing("notes"), Addressing::Create);
    }

    #[test]
    fn test_result_invariants() {
        let throttled = BatchExecutionResult::throttled("HTTP 429", Some(Duration::from_secs(3)));
        assert!(throttled.is_throttled());
        assert!(!throttled.is_success());

        let partial = BatchExecutionResult::from_outcomes(2, vec![1]);
        assert!(!partial.is_success());
        assert_eq!(partial.failed_indices(), &[1]);
        assert_eq!(partial.error_message(), Some("Some operations failed: 1"));

        let ok = BatchExecutionResult::from_outcomes(3, vec![]);
        assert!(ok.is_complete());
        assert_eq!(ok.error_message(), None);
    }
}
