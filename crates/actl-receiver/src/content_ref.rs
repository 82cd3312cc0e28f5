//! Content-reference resolution.
//!
//! Oversized payloads arrive as a [`ContentRef`] pointing at a file the
//! sender staged. The resolver verifies the reference before any bytes reach
//! the worker: reference expiry, path containment under the configured base
//! directory (symlinks resolved first), declared size, and declared SHA-256.
//! Checks run in that order and the first failure wins; the referenced file
//! is never modified.

use agent_ctl_core::control::ContentRef;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Why a reference was refused. The display string is the ack `detail`.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("expired reference")]
    Expired,
    #[error("invalid reference expiry timestamp")]
    BadExpiry,
    #[error("path escapes allowed base")]
    PathEscape,
    #[error("referenced file unreadable")]
    Unreadable(#[source] std::io::Error),
    #[error("size mismatch")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("hash mismatch")]
    HashMismatch,
}

/// Verify `content_ref` against `base_dir` and return the file bytes.
pub fn resolve(content_ref: &ContentRef, base_dir: &Path) -> Result<Vec<u8>, ResolveError> {
    if let Some(expires_at) = &content_ref.expires_at {
        let expiry = DateTime::parse_from_rfc3339(expires_at)
            .map_err(|_| ResolveError::BadExpiry)?
            .with_timezone(&Utc);
        if expiry <= Utc::now() {
            return Err(ResolveError::Expired);
        }
    }

    // Canonicalize both sides so symlinks cannot smuggle a path outside the
    // base directory.
    let base = base_dir.canonicalize().map_err(ResolveError::Unreadable)?;
    let path = Path::new(&content_ref.path)
        .canonicalize()
        .map_err(ResolveError::Unreadable)?;
    if !path.starts_with(&base) {
        return Err(ResolveError::PathEscape);
    }

    let metadata = std::fs::metadata(&path).map_err(ResolveError::Unreadable)?;
    if metadata.len() != content_ref.size_bytes {
        return Err(ResolveError::SizeMismatch {
            declared: content_ref.size_bytes,
            actual: metadata.len(),
        });
    }

    let bytes = std::fs::read(&path).map_err(ResolveError::Unreadable)?;
    let digest = Sha256::digest(&bytes);
    let actual = format!("{digest:x}");
    if !actual.eq_ignore_ascii_case(&content_ref.sha256) {
        return Err(ResolveError::HashMismatch);
    }

    debug!(
        path = %path.display(),
        size = bytes.len(),
        "content reference verified"
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stage(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, ContentRef) {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        let digest = Sha256::digest(content);
        let content_ref = ContentRef {
            path: path.to_string_lossy().into_owned(),
            size_bytes: content.len() as u64,
            sha256: format!("{digest:x}"),
            mime: "text/plain".to_string(),
            expires_at: None,
        };
        (path, content_ref)
    }

    #[test]
    fn valid_reference_yields_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (_, content_ref) = stage(dir.path(), "payload.txt", b"large payload body");
        let bytes = resolve(&content_ref, dir.path()).unwrap();
        assert_eq!(bytes, b"large payload body");
    }

    #[test]
    fn uppercase_digest_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut content_ref) = stage(dir.path(), "payload.txt", b"body");
        content_ref.sha256 = content_ref.sha256.to_uppercase();
        assert!(resolve(&content_ref, dir.path()).is_ok());
    }

    #[test]
    fn expired_reference_is_refused_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let (path, mut content_ref) = stage(dir.path(), "payload.txt", b"body");
        content_ref.expires_at = Some("2020-01-01T00:00:00Z".to_string());
        // The file being gone must not change the error: expiry wins.
        std::fs::remove_file(path).unwrap();
        assert!(matches!(
            resolve(&content_ref, dir.path()),
            Err(ResolveError::Expired)
        ));
    }

    #[test]
    fn future_expiry_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut content_ref) = stage(dir.path(), "payload.txt", b"body");
        let future = Utc::now() + chrono::Duration::hours(1);
        content_ref.expires_at = Some(future.to_rfc3339());
        assert!(resolve(&content_ref, dir.path()).is_ok());
    }

    #[test]
    fn dot_dot_traversal_is_refused() {
        let outer = tempfile::tempdir().unwrap();
        let base = outer.path().join("share");
        std::fs::create_dir_all(&base).unwrap();
        let secret = outer.path().join("secret.txt");
        std::fs::write(&secret, b"secret").unwrap();

        let digest = Sha256::digest(b"secret");
        let content_ref = ContentRef {
            path: base.join("..").join("secret.txt").to_string_lossy().into_owned(),
            size_bytes: 6,
            sha256: format!("{digest:x}"),
            mime: "text/plain".to_string(),
            expires_at: None,
        };
        assert!(matches!(
            resolve(&content_ref, &base),
            Err(ResolveError::PathEscape)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let outer = tempfile::tempdir().unwrap();
        let base = outer.path().join("share");
        std::fs::create_dir_all(&base).unwrap();
        let secret = outer.path().join("secret.txt");
        std::fs::write(&secret, b"secret").unwrap();
        let link = base.join("innocent.txt");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let digest = Sha256::digest(b"secret");
        let content_ref = ContentRef {
            path: link.to_string_lossy().into_owned(),
            size_bytes: 6,
            sha256: format!("{digest:x}"),
            mime: "text/plain".to_string(),
            expires_at: None,
        };
        assert!(matches!(
            resolve(&content_ref, &base),
            Err(ResolveError::PathEscape)
        ));
    }

    #[test]
    fn size_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut content_ref) = stage(dir.path(), "payload.txt", b"body");
        content_ref.size_bytes += 1;
        assert!(matches!(
            resolve(&content_ref, dir.path()),
            Err(ResolveError::SizeMismatch { declared: 5, actual: 4 })
        ));
    }

    #[test]
    fn hash_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut content_ref) = stage(dir.path(), "payload.txt", b"body");
        content_ref.sha256 = "0".repeat(64);
        let err = resolve(&content_ref, dir.path()).unwrap_err();
        assert!(matches!(err, ResolveError::HashMismatch));
        assert_eq!(err.to_string(), "hash mismatch");
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let content_ref = ContentRef {
            path: dir.path().join("ghost.txt").to_string_lossy().into_owned(),
            size_bytes: 1,
            sha256: "0".repeat(64),
            mime: "text/plain".to_string(),
            expires_at: None,
        };
        assert!(matches!(
            resolve(&content_ref, dir.path()),
            Err(ResolveError::Unreadable(_))
        ));
    }
}
