//! Batch Request Builder
//!
//! Serializes a [`Batch`] into one `multipart/mixed` envelope holding a
//! single changeset, one HTTP sub-request per operation, in input order:
//!
//! ```text
//! --batch_{id}
//! Content-Type: multipart/mixed; boundary=changeset_{cid}
//!
//! --changeset_{cid}
//! Content-Type: application/http
//! Content-Transfer-Encoding: binary
//! Content-ID: 1
//!
//! PATCH {api}/{collection}({key}={value}) HTTP/1.1
//! Content-Type: application/json; charset=utf-8
//!
//! {json}
//!
//! --changeset_{cid}--
//! --batch_{id}--
//! ```
//!
//! Boundary ids are derived from a SHA-256 of the rendered sub-requests, so
//! the same input always yields byte-identical bodies and a replayed batch is
//! resent unchanged.

use sha2::{Digest, Sha256};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::operation::{key_predicate, Addressing, Batch, CollectionRouting, Operation, WriteMode};

const CRLF: &str = "\r\n";

/// Bodies longer than this are truncated in debug logs
const DEBUG_BODY_LIMIT: usize = 2000;

/// Wire-ready batch envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    boundary: String,
    body: String,
    operation_count: usize,
}

impl BatchRequest {
    /// Outer boundary (`batch_{id}`)
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Number of sub-requests in the changeset
    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    /// Value for the top-level `Content-Type` header
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }
}

struct SubRequest {
    method: &'static str,
    url: String,
    json: String,
    if_none_match: bool,
}

pub struct BatchRequestBuilder {
    api_base: String,
    debug: bool,
}

impl BatchRequestBuilder {
    /// `api_base` is `{resource}/api/data/{version}`
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            debug: false,
        }
    }

    /// Log every sub-request at debug level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Build the envelope.
    ///
    /// Fails with [`SyncError::MissingAlternateKey`] before anything is sent
    /// when an operation routed by alternate key lacks the key value.
    pub fn build(
        &self,
        batch: &Batch,
        routing: &CollectionRouting,
        mode: WriteMode,
    ) -> Result<BatchRequest> {
        let sub_requests = batch
            .operations()
            .iter()
            .map(|op| self.sub_request(op, routing, mode))
            .collect::<Result<Vec<_>>>()?;

        let sections: Vec<String> = sub_requests
            .iter()
            .zip(1usize..)
            .map(|(sub, content_id)| {
                if self.debug {
                    debug!(
                        content_id = content_id,
                        method = sub.method,
                        url = %sub.url,
                        create_only = sub.if_none_match,
                        body = %truncate_for_log(&sub.json),
                        "Batch sub-request"
                    );
                }
                render_section(sub, content_id)
            })
            .collect();

        let (batch_id, changeset_id) = boundary_ids(&sections);

        let mut body = String::new();
        push_line(&mut body, &format!("--batch_{batch_id}"));
        push_line(
            &mut body,
            &format!("Content-Type: multipart/mixed; boundary=changeset_{changeset_id}"),
        );
        push_line(&mut body, "");
        for section in &sections {
            push_line(&mut body, &format!("--changeset_{changeset_id}"));
            body.push_str(section);
        }
        push_line(&mut body, &format!("--changeset_{changeset_id}--"));
        push_line(&mut body, &format!("--batch_{batch_id}--"));

        Ok(BatchRequest {
            boundary: format!("batch_{batch_id}"),
            body,
            operation_count: sections.len(),
        })
    }

    fn sub_request(
        &self,
        op: &Operation,
        routing: &CollectionRouting,
        mode: WriteMode,
    ) -> Result<SubRequest> {
        let json = serde_json::to_string(&op.payload)
            .map_err(|e| SyncError::Decode(format!("payload for {}: {e}", op.collection)))?;

        match routing.addressing(&op.collection) {
            Addressing::AlternateKey { field } => {
                let predicate = op
                    .value(&field)
                    .and_then(|value| key_predicate(&field, value))
                    .ok_or_else(|| {
                        error!(
                            collection = %op.collection,
                            field = %field,
                            sequence = op.sequence,
                            payload = %json,
                            "Alternate key missing from payload"
                        );
                        SyncError::MissingAlternateKey {
                            collection: op.collection.clone(),
                            field: field.clone(),
                        }
                    })?;

                Ok(SubRequest {
                    method: "PATCH",
                    url: format!("{}/{}({})", self.api_base, op.collection, predicate),
                    json,
                    if_none_match: mode == WriteMode::CreateOnly,
                })
            }
            Addressing::Create => Ok(SubRequest {
                method: "POST",
                url: format!("{}/{}", self.api_base, op.collection),
                json,
                if_none_match: false,
            }),
        }
    }
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str(CRLF);
}

/// Everything of one changeset part after its boundary line
fn render_section(sub: &SubRequest, content_id: usize) -> String {
    let mut section = String::new();
    push_line(&mut section, "Content-Type: application/http");
    push_line(&mut section, "Content-Transfer-Encoding: binary");
    push_line(&mut section, &format!("Content-ID: {content_id}"));
    push_line(&mut section, "");
    push_line(&mut section, &format!("{} {} HTTP/1.1", sub.method, sub.url));
    push_line(&mut section, "Content-Type: application/json; charset=utf-8");
    if sub.if_none_match {
        push_line(&mut section, "If-None-Match: *");
    }
    push_line(&mut section, "");
    push_line(&mut section, &sub.json);
    push_line(&mut section, "");
    section
}

/// Batch and changeset ids from the digest of the rendered sections
fn boundary_ids(sections: &[String]) -> (Uuid, Uuid) {
    let mut hasher = Sha256::new();
    for section in sections {
        hasher.update(section.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();

    let mut batch = [0u8; 16];
    let mut changeset = [0u8; 16];
    batch.copy_from_slice(&digest[..16]);
    changeset.copy_from_slice(&digest[16..32]);
    (Uuid::from_bytes(batch), Uuid::from_bytes(changeset))
}

fn truncate_for_log(body: &str) -> String {
    if body.chars().count() <= DEBUG_BODY_LIMIT {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(DEBUG_BODY_LIMIT).collect();
    truncated.push_str(" ...");
    truncated
}
