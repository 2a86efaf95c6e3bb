//! Binding between a checkpoint and the scope artifact it was captured against.
//!
//! The scope artifact is owned elsewhere; this module only fingerprints it.
//! A checkpoint records the artifact's digest once, at capture time, and any
//! later difference is reported as [`ScopeDrift`].

use std::io;
use std::path::{Path, PathBuf};

use crate::hash::{digest_of_file, Digest};

/// The scope artifact changed (or vanished) since the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Scope drift for {}: recorded {recorded_hash}, current {}",
    .scope_reference.display(),
    render_current(.current_hash)
)]
pub struct ScopeDrift {
    pub scope_reference: PathBuf,
    pub recorded_hash: Digest,
    /// `None` when the artifact no longer exists at its recorded location.
    pub current_hash: Option<Digest>,
}

fn render_current(current: &Option<Digest>) -> String {
    match current {
        Some(hash) => hash.to_hex(),
        None => "<missing>".to_string(),
    }
}

/// A scope artifact location plus the digest recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeBinding {
    reference: PathBuf,
    hash: Digest,
}

impl ScopeBinding {
    /// Fingerprint the artifact as it exists right now.
    pub fn capture(reference: &Path) -> io::Result<Self> {
        let hash = digest_of_file(reference)?;
        Ok(Self {
            reference: reference.to_path_buf(),
            hash,
        })
    }

    /// Rebuild a binding from a previously recorded digest.
    pub fn recorded(reference: PathBuf, hash: Digest) -> Self {
        Self { reference, hash }
    }

    pub fn reference(&self) -> &Path {
        &self.reference
    }

    pub fn hash(&self) -> Digest {
        self.hash
    }

    /// Re-hash the artifact at its current location and compare.
    ///
    /// The outer `Err` carries unexpected I/O faults; the inner result
    /// reports drift.
    pub fn check(&self) -> io::Result<Result<(), ScopeDrift>> {
        let current = match digest_of_file(&self.reference) {
            Ok(d) => Some(d),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        if current == Some(self.hash) {
            return Ok(Ok(()));
        }

        Ok(Err(ScopeDrift {
            scope_reference: self.reference.clone(),
            recorded_hash: self.hash,
            current_hash: current,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_scope_has_no_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        std::fs::write(&path, b"10.0.0.0/8").unwrap();

        let binding = ScopeBinding::capture(&path).unwrap();
        assert_eq!(binding.check().unwrap(), Ok(()));
    }

    #[test]
    fn modified_scope_drifts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        std::fs::write(&path, b"10.0.0.0/8").unwrap();
        let binding = ScopeBinding::capture(&path).unwrap();

        std::fs::write(&path, b"10.0.0.0/8\n192.168.0.0/16").unwrap();
        let drift = binding.check().unwrap().unwrap_err();
        assert_eq!(drift.recorded_hash, binding.hash());
        assert!(drift.current_hash.is_some());
        assert_ne!(drift.current_hash, Some(binding.hash()));
    }

    #[test]
    fn removed_scope_drifts_without_current_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        std::fs::write(&path, b"10.0.0.0/8").unwrap();
        let binding = ScopeBinding::capture(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        let drift = binding.check().unwrap().unwrap_err();
        assert_eq!(drift.current_hash, None);
        assert!(drift.to_string().contains("<missing>"));
    }

    #[test]
    fn capture_requires_readable_scope() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ScopeBinding::capture(&dir.path().join("absent")).is_err());
    }
}
