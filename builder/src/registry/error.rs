//! Translation of registry JSON error bodies into readable messages.
//!
//! Registries answer 4xx with `{"errors":[{"code","message","detail"}]}`.
//! Codes the registry uses for caller mistakes get their message passed
//! through; codes that indicate a server-side or protocol problem get a
//! generic message with a pointer to the issue tracker.

use lateen_core::error::{BuildError, ISSUE_TRACKER};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    code: Option<String>,
    message: Option<String>,
}

/// Build a [`BuildError::Registry`] from an error response body.
pub fn from_response_body(url: &str, status: u16, body: &[u8]) -> BuildError {
    let parsed: Option<ErrorResponse> = serde_json::from_slice(body).ok();
    let message = match parsed {
        Some(response) if !response.errors.is_empty() => response
            .errors
            .iter()
            .map(describe_entry)
            .collect::<Vec<String>>()
            .join(", "),
        _ => format!(
            "registry answered HTTP {} with an unstructured body: {}",
            status,
            String::from_utf8_lossy(body).trim()
        ),
    };
    BuildError::Registry(format!("{} (from {})", message, url))
}

fn describe_entry(entry: &ErrorEntry) -> String {
    let message = entry.message.as_deref().unwrap_or("");
    match entry.code.as_deref() {
        // The client sent something well-formed that the registry rejects;
        // the registry's own message is the most useful thing to show.
        Some("MANIFEST_UNKNOWN") | Some("TAG_INVALID") | Some("MANIFEST_UNVERIFIED")
        | Some("NAME_UNKNOWN") | Some("NAME_INVALID") | Some("UNAUTHORIZED")
        | Some("DENIED") => message.to_string(),
        // These point at a bug in the request we built.
        Some("MANIFEST_INVALID") | Some("BLOB_UNKNOWN") | Some("BLOB_UPLOAD_INVALID")
        | Some("DIGEST_INVALID") => format!(
            "something went wrong while talking to the registry ({}: {}); please file an issue at {}",
            entry.code.as_deref().unwrap_or_default(),
            message,
            ISSUE_TRACKER
        ),
        Some(other) => format!("{}: {}", other, message),
        None => format!("unknown: {}", message),
    }
}
