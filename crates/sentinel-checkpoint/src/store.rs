//! Checkpoint storage, one signed container file per engagement.
//!
//! Files live at `{root}/{engagement_id}/checkpoint.sckp`. A save writes the
//! whole container to a temporary file in the same directory, fsyncs it,
//! appends the signature, and atomically renames it over the previous
//! checkpoint. Readers therefore only ever observe complete files.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use sentinel_core::events::{AuditEvent, AuditPayload};
use sentinel_core::{AgentState, AuditEntry, EngagementContext, EngagementId, Finding};

use crate::error::{CheckpointError, Result};
use crate::hash::{digest_of_bytes, digest_of_file, digest_of_reader, Digest};
use crate::schema::{
    self, AgentRow, AuditRow, FindingRow, MetadataRow, Tables, HEADER_LEN, MAGIC, SCHEMA_VERSION,
    TRAILER_LEN,
};
use crate::scope::{ScopeBinding, ScopeDrift};

/// File name of the checkpoint inside each engagement directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.sckp";

/// Caller choices for [`CheckpointStore::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Accept a scope artifact whose digest differs from the recorded one.
    pub allow_scope_drift: bool,
}

/// Metadata of a verified checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    pub engagement_id: EngagementId,
    pub scope_reference: PathBuf,
    pub scope_hash: Digest,
    pub created_at: DateTime<Utc>,
    pub schema_version: u16,
    pub agent_count: u32,
    pub finding_count: u32,
    /// Digest of every byte preceding the trailer.
    pub signature: Digest,
}

impl CheckpointMetadata {
    fn from_row(row: MetadataRow, signature: Digest) -> Self {
        Self {
            engagement_id: row.engagement_id,
            scope_reference: row.scope_reference,
            scope_hash: row.scope_hash,
            created_at: row.created_at,
            schema_version: row.schema_version,
            agent_count: row.agent_count,
            finding_count: row.finding_count,
            signature,
        }
    }
}

/// Everything recovered from a checkpoint by [`CheckpointStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointData {
    pub metadata: CheckpointMetadata,
    pub agents: Vec<AgentState>,
    pub findings: Vec<Finding>,
    pub audit_log: Vec<AuditEntry>,
    /// Set when drift was detected and the caller chose to accept it.
    pub scope_drift: Option<ScopeDrift>,
}

impl CheckpointData {
    /// Rebuild the engagement context the checkpoint was taken from.
    pub fn into_context(self) -> EngagementContext {
        EngagementContext::from_parts(
            self.metadata.engagement_id,
            self.metadata.scope_reference,
            self.agents,
            self.findings,
            self.audit_log,
        )
    }
}

/// File-system backed checkpoint store.
///
/// ```text
/// {root}/
///   eng-42/
///     checkpoint.sckp
///   eng-43/
///     checkpoint.sckp
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of an engagement's checkpoint.
    pub fn checkpoint_path(&self, engagement_id: &EngagementId) -> PathBuf {
        self.engagement_dir(engagement_id).join(CHECKPOINT_FILE)
    }

    fn engagement_dir(&self, engagement_id: &EngagementId) -> PathBuf {
        self.root.join(engagement_id.as_str())
    }

    /// Durably capture the context, replacing any previous checkpoint atomically.
    ///
    /// On any error the previous checkpoint, if one exists, is left as it was.
    pub fn save(&self, context: &EngagementContext) -> Result<PathBuf> {
        let started = Instant::now();
        let engagement_id = context.engagement_id();
        let scope = ScopeBinding::capture(context.scope_reference())?;

        let tables = build_tables(context, &scope)?;
        let body = schema::encode_body(&tables)?;

        let dir = self.engagement_dir(engagement_id);
        fs::create_dir_all(&dir)?;

        // Dropped (and deleted) on every early return below.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;

        let signature = digest_of_file(tmp.path())?;
        tmp.write_all(&schema::encode_trailer(&signature))?;
        tmp.as_file().sync_all()?;

        let path = self.checkpoint_path(engagement_id);
        tmp.persist(&path).map_err(|e| CheckpointError::Io(e.error))?;
        sync_dir(&dir)?;

        let duration_ms = started.elapsed().as_millis() as u64;
        AuditEvent::new(
            engagement_id.clone(),
            AuditPayload::CheckpointSaved {
                path: path.display().to_string(),
                agent_count: tables.metadata.agent_count,
                finding_count: tables.metadata.finding_count,
                duration_ms,
            },
        )
        .emit();

        tracing::info!(
            engagement_id = %engagement_id,
            path = %path.display(),
            signature = %signature,
            duration_ms,
            "Checkpoint saved"
        );

        Ok(path)
    }

    /// Check the stored signature against the file content.
    ///
    /// Missing, unreadable, truncated, foreign, or tampered files yield
    /// `Ok(false)`. Only unexpected I/O faults are returned as errors.
    pub fn verify(&self, path: &Path) -> Result<bool> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if is_absent_or_denied(&e) => {
                tracing::debug!(path = %path.display(), error = %e, "Checkpoint not readable");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata()?;
        if !meta.is_file() || meta.len() < (HEADER_LEN + TRAILER_LEN) as u64 {
            return Ok(false);
        }
        let body_len = meta.len() - TRAILER_LEN as u64;

        let mut header = [0u8; HEADER_LEN];
        if !read_fully(&mut file, &mut header)? || &header[..MAGIC.len()] != MAGIC {
            return Ok(false);
        }

        let rest = (&mut file).take(body_len - HEADER_LEN as u64);
        let computed = digest_of_reader(Cursor::new(header).chain(rest))?;

        let mut trailer = [0u8; TRAILER_LEN];
        if !read_fully(&mut file, &mut trailer)? {
            return Ok(false);
        }

        Ok(schema::decode_trailer(&trailer) == Some(computed))
    }

    /// Load a verified checkpoint and check its scope binding.
    ///
    /// Fails with [`CheckpointError::Integrity`] when verification fails and
    /// with [`CheckpointError::ScopeDrift`] when the scope artifact changed,
    /// unless `options.allow_scope_drift` is set. Never modifies the file.
    pub fn load(&self, path: &Path, options: LoadOptions) -> Result<CheckpointData> {
        let (bytes, signature) = read_verified(path)?;
        let tables = schema::decode_tables(path, &bytes[..bytes.len() - TRAILER_LEN])?;

        let binding = ScopeBinding::recorded(
            tables.metadata.scope_reference.clone(),
            tables.metadata.scope_hash,
        );
        let scope_drift = match binding.check()? {
            Ok(()) => None,
            Err(drift) if options.allow_scope_drift => {
                tracing::warn!(
                    engagement_id = %tables.metadata.engagement_id,
                    %drift,
                    "Loading checkpoint despite scope drift"
                );
                Some(drift)
            }
            Err(drift) => return Err(drift.into()),
        };

        tracing::debug!(
            engagement_id = %tables.metadata.engagement_id,
            path = %path.display(),
            agents = tables.agents.len(),
            findings = tables.findings.len(),
            "Checkpoint loaded"
        );

        Ok(CheckpointData {
            metadata: CheckpointMetadata::from_row(tables.metadata, signature),
            agents: tables.agents.into_iter().map(|r| r.agent).collect(),
            findings: tables.findings.into_iter().map(|r| r.finding).collect(),
            audit_log: tables.audit.into_iter().map(|r| r.entry).collect(),
            scope_drift,
        })
    }

    /// Verify a checkpoint and decode only its metadata row.
    ///
    /// Reads and hashes the file once; failed verification is an
    /// [`CheckpointError::Integrity`] error rather than `Ok(false)`.
    pub fn read_metadata(&self, path: &Path) -> Result<CheckpointMetadata> {
        let (bytes, signature) = read_verified(path)?;
        let row = schema::decode_metadata(path, &bytes[..bytes.len() - TRAILER_LEN])?;
        Ok(CheckpointMetadata::from_row(row, signature))
    }
}

fn build_tables(context: &EngagementContext, scope: &ScopeBinding) -> Result<Tables> {
    let engagement_id = context.engagement_id();

    let agents: Vec<AgentRow> = context
        .agents()
        .iter()
        .enumerate()
        .map(|(i, agent)| {
            Ok(AgentRow {
                engagement_id: engagement_id.clone(),
                ordinal: row_count(i)?,
                agent: agent.clone(),
            })
        })
        .collect::<Result<_>>()?;

    let findings: Vec<FindingRow> = context
        .findings()
        .iter()
        .enumerate()
        .map(|(i, finding)| {
            Ok(FindingRow {
                engagement_id: engagement_id.clone(),
                ordinal: row_count(i)?,
                finding: finding.clone(),
            })
        })
        .collect::<Result<_>>()?;

    let audit: Vec<AuditRow> = context
        .audit_log()
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            Ok(AuditRow {
                engagement_id: engagement_id.clone(),
                ordinal: row_count(i)?,
                entry: entry.clone(),
            })
        })
        .collect::<Result<_>>()?;

    Ok(Tables {
        metadata: MetadataRow {
            engagement_id: engagement_id.clone(),
            scope_reference: scope.reference().to_path_buf(),
            scope_hash: scope.hash(),
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
            agent_count: row_count(agents.len())?,
            finding_count: row_count(findings.len())?,
        },
        agents,
        findings,
        audit,
    })
}

fn row_count(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| {
        CheckpointError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many rows for one checkpoint",
        ))
    })
}

/// Read a whole checkpoint and check its signature.
fn read_verified(path: &Path) -> Result<(Vec<u8>, Digest)> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if is_absent_or_denied(&e) => {
            return Err(CheckpointError::integrity(path, format!("unreadable: {e}")));
        }
        Err(e) => return Err(e.into()),
    };

    let (body, stored) = schema::split_signed(&bytes)
        .ok_or_else(|| CheckpointError::integrity(path, "missing signature trailer"))?;
    if digest_of_bytes(body) != stored {
        return Err(CheckpointError::integrity(path, "signature mismatch"));
    }
    Ok((bytes, stored))
}

fn is_absent_or_denied(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

/// Fill `buf`, returning `false` if the file ended first.
fn read_fully(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
