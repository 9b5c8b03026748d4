//! Batch Response Interpreter
//!
//! Maps a raw batch response onto a [`BatchExecutionResult`]:
//!
//! - 429 / 502 / 503 / 504, or the resource-exhausted code anywhere in the
//!   body: throttled, no per-operation parsing
//! - any other non-2xx: permanent failure carrying the body
//! - 2xx: one `HTTP/1.x NNN` status line per sub-response, in submission
//!   order; 2xx and 412 count as success
//!
//! A response with fewer status lines than submitted operations is treated
//! as truncated: the unmatched trailing positions are reported as failed so
//! the whole batch is replayed.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, warn};

use super::RawBatchResponse;
use crate::operation::BatchExecutionResult;

/// Remote error code for "too many concurrent requests / resource exhausted"
const RESOURCE_EXHAUSTED_CODE: &str = "0x80072321";

/// Sub-status signalling an `If-None-Match: *` precondition on an existing record
const PRECONDITION_FAILED: u16 = 412;

fn status_line() -> Option<&'static Regex> {
    static STATUS_LINE: OnceLock<Option<Regex>> = OnceLock::new();
    STATUS_LINE
        .get_or_init(|| Regex::new(r"(?m)^HTTP/1\.[01]\s+(\d{3})").ok())
        .as_ref()
}

/// Top-level statuses treated as rate limiting or overload
pub fn is_throttle_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Classify a batch response for `operation_count` submitted operations
pub fn interpret(response: &RawBatchResponse, operation_count: usize) -> BatchExecutionResult {
    let status = response.status;

    if is_throttle_status(status) || mentions_resource_exhausted(&response.body) {
        let retry_after = response.retry_after.as_deref().and_then(parse_retry_after);
        warn!(
            status = status,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Batch throttled by remote store"
        );
        return BatchExecutionResult::throttled(
            format!("HTTP {status} throttled or remote limit reached."),
            retry_after,
        );
    }

    if !(200..300).contains(&status) {
        error!(status = status, body = %response.body, "Batch rejected");
        return BatchExecutionResult::failed(format!("HTTP {status}: {}", response.body));
    }

    let statuses = sub_statuses(&response.body);
    if statuses.len() < operation_count {
        warn!(
            found = statuses.len(),
            operations = operation_count,
            "Fewer sub-statuses than operations; response likely truncated"
        );
    }

    let mut success_count = 0usize;
    let mut failed = Vec::new();
    for index in 0..operation_count {
        match statuses.get(index) {
            Some(&code) if is_sub_success(code) => success_count += 1,
            _ => failed.push(index),
        }
    }

    BatchExecutionResult::from_outcomes(success_count, failed)
}

fn is_sub_success(code: u16) -> bool {
    (200..300).contains(&code) || code == PRECONDITION_FAILED
}

fn mentions_resource_exhausted(body: &str) -> bool {
    body.to_ascii_lowercase().contains(RESOURCE_EXHAUSTED_CODE)
}

/// Sub-response status codes in order of appearance
fn sub_statuses(body: &str) -> Vec<u16> {
    let Some(re) = status_line() else {
        return Vec::new();
    };
    re.captures_iter(body)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart(statuses: &[&str]) -> String {
        let mut body = String::from("--batchresponse_1\r\nContent-Type: multipart/mixed; boundary=changesetresponse_1\r\n\r\n");
        for (i, status) in statuses.iter().enumerate() {
            body.push_str("--changesetresponse_1\r\nContent-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n");
            body.push_str(&format!("Content-ID: {}\r\n\r\nHTTP/1.1 {}\r\nOData-Version: 4.0\r\n\r\n", i + 1, status));
        }
        body.push_str("--changesetresponse_1--\r\n--batchresponse_1--\r\n");
        body
    }

    #[test]
    fn test_all_success_with_precondition() {
        let response = RawBatchResponse::new(200, multipart(&["204 No Content", "412 Precondition Failed", "201 Created"]));
        let result = interpret(&response, 3);
        assert!(result.is_success());
        assert!(result.is_complete());
        assert!(result.failed_indices().is_empty());
        assert_eq!(result.success_count(), 3);
    }

    #[test]
    fn test_partial_failure_indices() {
        let response = RawBatchResponse::new(200, multipart(&["204 No Content", "400 Bad Request", "204 No Content"]));
        let result = interpret(&response, 3);
        assert!(!result.is_success());
        assert!(!result.is_throttled());
        assert_eq!(result.failed_indices(), &[1]);
        assert_eq!(result.success_count(), 2);
    }

    #[test]
    fn test_truncated_response_marks_trailing_failed() {
        let response = RawBatchResponse::new(200, multipart(&["204 No Content"]));
        let result = interpret(&response, 3);
        assert!(!result.is_success());
        assert_eq!(result.failed_indices(), &[1, 2]);
    }

    #[test]
    fn test_throttle_statuses() {
        for status in [429u16, 502, 503, 504] {
            let result = interpret(&RawBatchResponse::new(status, ""), 2);
            assert!(result.is_throttled(), "status {status}");
            assert!(!result.is_success());
            assert!(result.failed_indices().is_empty());
        }
    }

    #[test]
    fn test_resource_exhausted_code_in_body() {
        let body = r#"{"error":{"code":"0x80072321","message":"Combined execution time exceeded"}}"#;
        let result = interpret(&RawBatchResponse::new(400, body), 1);
        assert!(result.is_throttled());

        let upper = interpret(&RawBatchResponse::new(200, "code 0X80072321"), 1);
        assert!(upper.is_throttled());
    }

    #[test]
    fn test_permanent_failure_keeps_body() {
        let result = interpret(&RawBatchResponse::new(400, "bad envelope"), 1);
        assert!(!result.is_success());
        assert!(!result.is_throttled());
        assert!(result.failed_indices().is_empty());
        assert_eq!(result.error_message(), Some("HTTP 400: bad envelope"));
    }

    #[test]
    fn test_retry_after_from_header() {
        let throttled = RawBatchResponse::new(429, "").with_retry_after("7");
        assert_eq!(interpret(&throttled, 1).retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        let future = parse_retry_after("Fri, 01 Jan 2100 00:00:00 GMT").unwrap();
        assert!(future > Duration::from_secs(3600));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_http_1_0_status_lines() {
        let body = "HTTP/1.0 204 No Content\r\nHTTP/1.1 200 OK\r\n";
        let result = interpret(&RawBatchResponse::new(200, body), 2);
        assert!(result.is_success());
    }
}
