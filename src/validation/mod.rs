//! URL & Path Validator (§4.2) — single source of truth for URL/path
//! safety. Consulted by Probe, Subtitle Authoring, the Encoder Command
//! Builder, and the Content Store; not only at the HTTP edge (§9).

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{CoreError, CoreResult};

const MAX_URL_LEN: usize = 2048;
const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}'];

const MALICIOUS_SUBSTRINGS: &[&str] = &[
    "javascript:",
    "data:",
    "file:",
    "localhost",
    "127.",
    "192.168.",
    "10.",
    "172.",
    ".onion",
    "../",
    "%2e%2e%2f",
];

const PRIVATE_NETWORK_KEYWORDS: &[&str] = &["internal", "intranet", "private", "loopback"];

const SANITIZE_DENYLIST: &[&str] = &[
    "rm", "cat", "ls", "chmod", "sudo", "bash", "sh", "cmd", "powershell", "wget", "curl", "nc",
];

static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f\x7f]").unwrap());

fn contains_traversal(s: &str) -> bool {
    s.contains("..")
}

/// Decodes up to two levels of percent-encoding, returning every
/// intermediate decode depth so callers can check each one.
fn decode_depths(s: &str) -> Vec<String> {
    let once = urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string());
    let twice = urlencoding::decode(&once)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| once.clone());
    vec![s.to_string(), once, twice]
}

/// Validates a remote media / overlay URL per §4.2, steps 1-8.
///
/// `allowed_domains`: if non-empty, the host must exactly equal one of
/// these entries. `allowlist_required`: when true, an empty
/// `allowed_domains` rejects every URL instead of passing everything
/// through.
pub fn validate_url(raw: &str, allowed_domains: &[String], allowlist_required: bool) -> CoreResult<Url> {
    // 1. Empty / length > 2048.
    if raw.is_empty() {
        return Err(CoreError::invalid_input("url is empty"));
    }
    if raw.len() > MAX_URL_LEN {
        return Err(CoreError::invalid_input("url exceeds maximum length"));
    }

    // 2. Parse failure.
    let parsed = Url::parse(raw).map_err(|_| CoreError::invalid_input("url failed to parse"))?;

    // 3. Scheme allowlist.
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(CoreError::invalid_input(format!(
            "scheme '{}' is not allowed",
            parsed.scheme()
        )));
    }

    // 4. Host empty.
    let host = parsed.host_str().unwrap_or("");
    if host.is_empty() {
        return Err(CoreError::invalid_input("url has no host"));
    }

    // 5. Shell metacharacters anywhere in the raw string.
    if raw.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return Err(CoreError::invalid_input(
            "url contains shell metacharacters",
        ));
    }

    // 6. Path traversal at any decode depth.
    for depth in decode_depths(raw) {
        if contains_traversal(&depth) {
            return Err(CoreError::invalid_input("path traversal detected"));
        }
    }

    // 7. Malicious-intent substrings (case-insensitive), plus private
    // network keywords.
    let lower = raw.to_lowercase();
    for needle in MALICIOUS_SUBSTRINGS.iter().chain(PRIVATE_NETWORK_KEYWORDS) {
        if lower.contains(needle) {
            return Err(CoreError::invalid_input(format!(
                "url contains disallowed pattern '{needle}'"
            )));
        }
    }

    // 8. Domain allowlist.
    if allowed_domains.is_empty() {
        if allowlist_required {
            return Err(CoreError::invalid_input(
                "an allowlist is required but no domains are configured",
            ));
        }
    } else if !allowed_domains.iter().any(|d| d == host) {
        return Err(CoreError::invalid_input(format!(
            "host '{host}' is not in the configured allowlist"
        )));
    }

    Ok(parsed)
}

/// Validates a local filesystem path (subtitle temp files, store
/// lookups). Rejects null bytes, ASCII control characters, absolute
/// paths, and symbolic links.
pub fn validate_local_path(path: &str) -> CoreResult<()> {
    if path.contains('\0') {
        return Err(CoreError::invalid_input("path contains a null byte"));
    }
    if CONTROL_CHARS.is_match(path) {
        return Err(CoreError::invalid_input(
            "path contains control characters",
        ));
    }
    if std::path::Path::new(path).is_absolute() {
        return Err(CoreError::invalid_input("absolute paths are not allowed"));
    }
    if contains_traversal(path) {
        return Err(CoreError::invalid_input("path traversal detected"));
    }

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(CoreError::invalid_input(
                "symbolic links are not allowed",
            ));
        }
    }

    Ok(())
}

/// Checks that `target` is within `base` after canonicalizing both —
/// used by the encoder builder's subtitle-path boundary check and the
/// content store's id-to-path resolution.
pub fn is_within_base(base: &std::path::Path, target: &std::path::Path) -> bool {
    let (Ok(base_canon), Ok(target_canon)) = (base.canonicalize(), target.canonicalize()) else {
        return false;
    };
    target_canon.starts_with(base_canon)
}

/// Strips metacharacters and traversal sequences, keeps only the first
/// whitespace-separated token, and rejects tokens on the fixed denylist.
/// Intended for encoder argument scrubbing, not as a primary defense.
pub fn sanitize_input(s: &str) -> CoreResult<String> {
    let stripped: String = s
        .chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(c))
        .collect();
    let stripped = stripped.replace("..", "");

    let token = stripped
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();

    if token.is_empty() {
        return Err(CoreError::invalid_input("sanitized input is empty"));
    }

    if SANITIZE_DENYLIST
        .iter()
        .any(|d| d.eq_ignore_ascii_case(&token))
    {
        return Err(CoreError::invalid_input(format!(
            "token '{token}' is denylisted"
        )));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_shell_metacharacter_injection() {
        let err = validate_url("http://example.com/x; rm -rf /", &[], false).unwrap_err();
        assert_eq!(err.kind, crate::error::Kind::InvalidInput);
    }

    #[test]
    fn rejects_loopback_host() {
        assert!(validate_url("http://127.0.0.1/x", &[], false).is_err());
    }

    #[test]
    fn rejects_file_scheme() {
        assert!(validate_url("file:///etc/passwd", &[], false).is_err());
    }

    #[test]
    fn rejects_disallowed_scheme() {
        assert!(validate_url("ftp://example.com/x", &[], false).is_err());
        assert!(validate_url("javascript:alert(1)", &[], false).is_err());
    }

    #[test]
    fn accepts_plain_https_url() {
        assert!(validate_url("https://cdn.test/a.mp3", &[], false).is_ok());
    }

    #[test]
    fn enforces_domain_allowlist() {
        let allowed = vec!["cdn.test".to_string()];
        assert!(validate_url("https://cdn.test/a.mp3", &allowed, false).is_ok());
        assert!(validate_url("https://evil.test/a.mp3", &allowed, false).is_err());
    }

    #[test]
    fn rejects_double_encoded_traversal() {
        assert!(validate_url("https://cdn.test/%2e%2e%2f/x", &[], false).is_err());
    }

    #[test]
    fn allowlist_required_rejects_everything_when_no_domains_configured() {
        assert!(validate_url("https://cdn.test/a.mp3", &[], true).is_err());
        assert!(validate_url("https://cdn.test/a.mp3", &[], false).is_ok());
    }

    #[test]
    fn allowlist_required_with_domains_behaves_like_plain_allowlist() {
        let allowed = vec!["cdn.test".to_string()];
        assert!(validate_url("https://cdn.test/a.mp3", &allowed, true).is_ok());
        assert!(validate_url("https://evil.test/a.mp3", &allowed, true).is_err());
    }

    #[test]
    fn sanitize_input_rejects_denylisted_tokens() {
        assert!(sanitize_input("rm").is_err());
        assert!(sanitize_input("SUDO").is_err());
        assert_eq!(sanitize_input("ffmpeg -version").unwrap(), "ffmpeg");
    }

    #[test]
    fn local_path_rejects_null_byte_and_traversal() {
        assert!(validate_local_path("a\0b").is_err());
        assert!(validate_local_path("../etc/passwd").is_err());
        assert!(validate_local_path("/abs/path").is_err());
        assert!(validate_local_path("relative/ok.srt").is_ok());
    }
}
