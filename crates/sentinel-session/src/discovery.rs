//! Startup discovery of stopped engagements.
//!
//! Each subdirectory of the checkpoint root may hold one engagement's
//! checkpoint. Verified checkpoints are registered as stopped; anything that
//! fails verification is logged and skipped, never deleted, so one damaged
//! file cannot keep the other engagements from coming back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sentinel_checkpoint::{CheckpointError, CheckpointMetadata, CHECKPOINT_FILE};
use sentinel_core::events::{AuditEvent, AuditPayload};
use sentinel_core::EngagementId;

use crate::error::Result;
use crate::manager::{DiscoveredSummary, SessionManager};
use crate::registry::CheckpointInfo;

/// A checkpoint file found under the root, keyed by its directory name.
#[derive(Debug)]
struct Candidate {
    dir_name: String,
    path: PathBuf,
}

/// What inspecting one candidate produced.
enum Inspection {
    Valid(CheckpointMetadata),
    Rejected(String),
}

impl SessionManager {
    /// Scan the store root and register every verified checkpoint as stopped.
    ///
    /// Safe to call repeatedly: engagements already in the registry are
    /// left as they are and never duplicated. Returns a summary for every
    /// valid checkpoint found, ordered by engagement id.
    pub async fn discover_on_startup(&self) -> Result<Vec<DiscoveredSummary>> {
        let root = self.store.root().to_path_buf();
        let candidates = tokio::task::spawn_blocking(move || scan_root(&root)).await??;

        let mut summaries = Vec::with_capacity(candidates.len());
        let mut skipped = 0usize;

        for candidate in candidates {
            let store = self.store.clone();
            let path = candidate.path.clone();
            let inspection = tokio::task::spawn_blocking(move || inspect(&store, &path)).await??;

            let metadata = match inspection {
                Inspection::Valid(m) if m.engagement_id.as_str() == candidate.dir_name => m,
                Inspection::Valid(m) => {
                    reject(
                        &candidate,
                        &format!("directory holds checkpoint of {}", m.engagement_id),
                    );
                    skipped += 1;
                    continue;
                }
                Inspection::Rejected(reason) => {
                    reject(&candidate, &reason);
                    skipped += 1;
                    continue;
                }
            };

            let info = CheckpointInfo::from_metadata(candidate.path.clone(), &metadata);
            if self
                .registry
                .register_discovered(&metadata, candidate.path.clone())
            {
                tracing::info!(
                    engagement_id = %metadata.engagement_id,
                    path = %candidate.path.display(),
                    created_at = %metadata.created_at,
                    "Discovered stopped engagement"
                );
                AuditEvent::new(
                    metadata.engagement_id.clone(),
                    AuditPayload::EngagementDiscovered {
                        path: candidate.path.display().to_string(),
                        scope_hash: metadata.scope_hash.to_hex(),
                    },
                )
                .emit();
            }
            summaries.push(DiscoveredSummary::new(metadata.engagement_id, info));
        }

        tracing::info!(
            discovered = summaries.len(),
            skipped,
            root = %self.store.root().display(),
            "Startup discovery complete"
        );
        Ok(summaries)
    }
}

/// Verify a candidate and read its metadata in a single pass over the file.
///
/// Integrity and schema failures become `Rejected`; unexpected I/O faults
/// propagate.
fn inspect(
    store: &sentinel_checkpoint::CheckpointStore,
    path: &Path,
) -> std::result::Result<Inspection, CheckpointError> {
    match store.read_metadata(path) {
        Ok(metadata) => Ok(Inspection::Valid(metadata)),
        Err(e @ (CheckpointError::Integrity { .. } | CheckpointError::UnsupportedSchema { .. })) => {
            Ok(Inspection::Rejected(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn reject(candidate: &Candidate, reason: &str) {
    tracing::warn!(
        path = %candidate.path.display(),
        reason,
        "Skipping corrupted checkpoint"
    );
    if let Ok(id) = EngagementId::parse(candidate.dir_name.as_str()) {
        AuditEvent::new(
            id,
            AuditPayload::CheckpointRejected {
                path: candidate.path.display().to_string(),
                reason: reason.to_string(),
            },
        )
        .emit();
    }
}

/// List `{root}/*/checkpoint.sckp`, sorted by directory name.
fn scan_root(root: &Path) -> io::Result<Vec<Candidate>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path().join(CHECKPOINT_FILE);
        if !path.exists() {
            tracing::debug!(dir = %entry.path().display(), "No checkpoint in directory");
            continue;
        }
        candidates.push(Candidate {
            dir_name: entry.file_name().to_string_lossy().into_owned(),
            path,
        });
    }

    candidates.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
    Ok(candidates)
}
