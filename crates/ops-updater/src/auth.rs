//! Secret file management and constant-time header comparison for the
//! update control API (C9).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ops_common::{Error, Result};
use rand::RngCore;
use std::path::Path;
use subtle::ConstantTimeEq;

/// Reads the secret from `path`, generating and persisting a fresh one
/// if the file is absent or its (trimmed) contents are blank.
pub fn get_or_create_secret(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = URL_SAFE_NO_PAD.encode(bytes);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &secret).map_err(Error::Io)?;

    Ok(secret)
}

/// Constant-time comparison of an incoming header value against the
/// configured secret. An empty `expected` opens every endpoint (test
/// configuration only); a non-empty `expected` never accepts an empty
/// `provided`.
pub fn validate_secret(expected: &str, provided: Option<&str>) -> bool {
    if expected.is_empty() {
        return true;
    }
    let provided = match provided {
        Some(p) if !p.is_empty() => p,
        _ => return false,
    };
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        let first = get_or_create_secret(&path).unwrap();
        assert!(!first.is_empty());
        let second = get_or_create_secret(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn blank_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "   \n").unwrap();
        let generated = get_or_create_secret(&path).unwrap();
        assert!(!generated.trim().is_empty());
    }

    #[test]
    fn empty_expected_opens_every_request() {
        assert!(validate_secret("", None));
        assert!(validate_secret("", Some("")));
    }

    #[test]
    fn non_empty_expected_rejects_missing_or_empty_header() {
        assert!(!validate_secret("s3cr3t", None));
        assert!(!validate_secret("s3cr3t", Some("")));
    }

    #[test]
    fn matching_secret_validates() {
        assert!(validate_secret("s3cr3t", Some("s3cr3t")));
        assert!(!validate_secret("s3cr3t", Some("wrong")));
    }
}
