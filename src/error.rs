//! Error kinds and the client-safe sanitizer (§4.1).
//!
//! Every component returns a [`CoreError`] tagging one of the fixed
//! [`Kind`]s. No caller is allowed to format a raw error message into a
//! client-facing response; [`sanitize_for_client`] and
//! [`to_client_response`] are the only sanctioned exits.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// The fixed set of error categories a client response may map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    InvalidInput,
    FileNotFound,
    EncoderFailed,
    TranscriptionFailed,
    JobNotFound,
    StorageFailed,
    DownloadFailed,
    Timeout,
    Internal,
}

/// A tagged error carrying a [`Kind`], a message, and optional structured
/// detail for server-side logging.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: Kind,
    pub message: String,
    pub detail: HashMap<String, String>,
}

impl CoreError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::FileNotFound, message)
    }

    pub fn job_not_found(id: &str) -> Self {
        Self::new(Kind::JobNotFound, format!("job {id} not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout, message)
    }
}

/// Structured, client-safe response shape.
#[derive(Debug, Clone, Serialize)]
pub struct ClientResponse {
    pub error: String,
    pub code: String,
}

/// Fixed, vetted message per [`Kind`]. Never includes any part of the
/// original error's message or detail.
fn fixed_message(kind: Kind) -> &'static str {
    match kind {
        Kind::InvalidInput => "The request was invalid.",
        Kind::FileNotFound => "The requested resource was not found.",
        Kind::EncoderFailed => "Video encoding failed.",
        Kind::TranscriptionFailed => "Speech transcription failed.",
        Kind::JobNotFound => "No such job.",
        Kind::StorageFailed => "Storage operation failed.",
        Kind::DownloadFailed => "Unable to retrieve the requested media.",
        Kind::Timeout => "The operation timed out.",
        Kind::Internal => "An internal error occurred.",
    }
}

fn code_for(kind: Kind) -> &'static str {
    match kind {
        Kind::InvalidInput => "invalid_input",
        Kind::FileNotFound => "file_not_found",
        Kind::EncoderFailed => "encoder_failed",
        Kind::TranscriptionFailed => "transcription_failed",
        Kind::JobNotFound => "job_not_found",
        Kind::StorageFailed => "storage_failed",
        Kind::DownloadFailed => "download_failed",
        Kind::Timeout => "timeout",
        Kind::Internal => "internal",
    }
}

/// Maps an error to the fixed, vetted client message for its kind.
///
/// Idempotent: `sanitize_for_client` applied to the *sanitized* message
/// again would map to the same fixed string, since the mapping only
/// depends on `kind`, never on the raw message text.
pub fn sanitize_for_client(err: &CoreError) -> String {
    fixed_message(err.kind).to_string()
}

/// Structured form for external callers.
pub fn to_client_response(err: &CoreError) -> ClientResponse {
    ClientResponse {
        error: sanitize_for_client(err),
        code: code_for(err.kind).to_string(),
    }
}

/// Pattern groups checked case-insensitively against the message and every
/// detail value. Any match flags the error as security-sensitive.
const SENSITIVE_FS_ROOTS: &[&str] = &["/etc", "/root", "/home", "c:\\windows", "/proc", "/sys"];
const RISKY_URL_SCHEMES: &[&str] = &["file:", "data:", "javascript:", "ftp:"];
const INTERNAL_NETWORK_TARGETS: &[&str] = &[
    "localhost",
    "127.",
    "192.168.",
    "10.",
    "172.16.",
    "169.254.",
    "0.0.0.0",
];
const SENSITIVE_KEYWORDS: &[&str] = &[
    "credential",
    "token",
    "secret",
    "password",
    "apikey",
    "api_key",
    "private_key",
    "authorization",
];

fn contains_any_ci(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Case-insensitive substring match of the message and detail values
/// against four fixed pattern groups.
pub fn is_security_sensitive(err: &CoreError) -> bool {
    let groups: [&[&str]; 4] = [
        SENSITIVE_FS_ROOTS,
        RISKY_URL_SCHEMES,
        INTERNAL_NETWORK_TARGETS,
        SENSITIVE_KEYWORDS,
    ];

    let haystacks = std::iter::once(err.message.as_str()).chain(err.detail.values().map(|s| s.as_str()));

    for haystack in haystacks {
        for group in &groups {
            if contains_any_ci(haystack, group) {
                return true;
            }
        }
    }
    false
}

/// Structured fields for server logs. Sets `SECURITY_SENSITIVE`/
/// `alert_level` when [`is_security_sensitive`] holds.
pub fn log_context(err: &CoreError) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("kind".to_string(), format!("{:?}", err.kind));
    ctx.insert("message".to_string(), err.message.clone());
    for (k, v) in &err.detail {
        ctx.insert(format!("detail.{k}"), v.clone());
    }
    if is_security_sensitive(err) {
        ctx.insert("SECURITY_SENSITIVE".to_string(), "true".to_string());
        ctx.insert("alert_level".to_string(), "HIGH".to_string());
    }
    ctx
}

pub type CoreResult<T> = Result<T, CoreError>;
