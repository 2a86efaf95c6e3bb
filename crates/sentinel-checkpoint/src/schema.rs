//! On-disk checkpoint container.
//!
//! A checkpoint is one file holding four logically separate tables followed
//! by a signature over every preceding byte:
//!
//! ```text
//! header    "SNTLCKPT" | schema_version: u16 LE
//! section   kind: u8 | len: u64 LE | JSON (len bytes)     × 4, in order:
//!             1 metadata (object)  2 agents  3 findings  4 audit (arrays)
//! trailer   "SIG1" | BLAKE3(header ‖ sections): 32 bytes
//! ```
//!
//! Every row carries the owning `engagement_id`. Rows that name a different
//! engagement than the metadata are orphans and make the file invalid.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sentinel_core::{AgentState, AuditEntry, EngagementId, Finding};

use crate::error::{CheckpointError, Result};
use crate::hash::Digest;

pub const MAGIC: &[u8; 8] = b"SNTLCKPT";
pub const SCHEMA_VERSION: u16 = 1;
pub const SIGNATURE_TAG: &[u8; 4] = b"SIG1";

pub const HEADER_LEN: usize = MAGIC.len() + 2;
pub const TRAILER_LEN: usize = SIGNATURE_TAG.len() + Digest::LEN;
const SECTION_PREFIX_LEN: usize = 1 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionKind {
    Metadata = 1,
    Agents = 2,
    Findings = 3,
    Audit = 4,
}

impl SectionKind {
    const ORDER: [SectionKind; 4] = [
        SectionKind::Metadata,
        SectionKind::Agents,
        SectionKind::Findings,
        SectionKind::Audit,
    ];
}

// ── Rows ─────────────────────────────────────────────────────────

/// The single metadata row of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRow {
    pub engagement_id: EngagementId,
    pub scope_reference: PathBuf,
    /// Digest of the scope artifact at capture time. Never rewritten.
    pub scope_hash: Digest,
    pub created_at: DateTime<Utc>,
    pub schema_version: u16,
    pub agent_count: u32,
    pub finding_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRow {
    pub engagement_id: EngagementId,
    pub ordinal: u32,
    pub agent: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindingRow {
    pub engagement_id: EngagementId,
    pub ordinal: u32,
    pub finding: Finding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRow {
    pub engagement_id: EngagementId,
    pub ordinal: u32,
    pub entry: AuditEntry,
}

/// Fully decoded checkpoint tables, rows in ordinal order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tables {
    pub metadata: MetadataRow,
    pub agents: Vec<AgentRow>,
    pub findings: Vec<FindingRow>,
    pub audit: Vec<AuditRow>,
}

// ── Encoding ─────────────────────────────────────────────────────

/// Serialize the unsigned body (header and all sections).
pub fn encode_body(tables: &Tables) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());

    write_section(&mut out, SectionKind::Metadata, &serde_json::to_vec(&tables.metadata)?);
    write_section(&mut out, SectionKind::Agents, &serde_json::to_vec(&tables.agents)?);
    write_section(&mut out, SectionKind::Findings, &serde_json::to_vec(&tables.findings)?);
    write_section(&mut out, SectionKind::Audit, &serde_json::to_vec(&tables.audit)?);

    Ok(out)
}

fn write_section(out: &mut Vec<u8>, kind: SectionKind, json: &[u8]) {
    out.push(kind as u8);
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(json);
}

/// Trailer bytes carrying the signature of a body.
pub fn encode_trailer(signature: &Digest) -> [u8; TRAILER_LEN] {
    let mut trailer = [0u8; TRAILER_LEN];
    trailer[..SIGNATURE_TAG.len()].copy_from_slice(SIGNATURE_TAG);
    trailer[SIGNATURE_TAG.len()..].copy_from_slice(signature.as_bytes());
    trailer
}

// ── Decoding ─────────────────────────────────────────────────────

/// Split a signed file into body and stored signature.
///
/// Returns `None` when the file is too short or the trailer tag is wrong.
pub fn split_signed(bytes: &[u8]) -> Option<(&[u8], Digest)> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return None;
    }
    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    decode_trailer(trailer).map(|sig| (body, sig))
}

pub fn decode_trailer(trailer: &[u8]) -> Option<Digest> {
    if trailer.len() != TRAILER_LEN || &trailer[..SIGNATURE_TAG.len()] != SIGNATURE_TAG {
        return None;
    }
    let mut sig = [0u8; Digest::LEN];
    sig.copy_from_slice(&trailer[SIGNATURE_TAG.len()..]);
    Some(Digest::from_bytes(sig))
}

/// Read and validate the header, returning the schema version.
fn read_header(path: &Path, body: &[u8]) -> Result<u16> {
    if body.len() < HEADER_LEN || &body[..MAGIC.len()] != MAGIC {
        return Err(CheckpointError::integrity(path, "bad container magic"));
    }
    let version = u16::from_le_bytes([body[MAGIC.len()], body[MAGIC.len() + 1]]);
    if version != SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedSchema {
            path: path.to_path_buf(),
            found: version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(version)
}

/// Sequential section reader over an unsigned body.
struct Sections<'a> {
    path: &'a Path,
    body: &'a [u8],
    pos: usize,
    next_kind: usize,
}

impl<'a> Sections<'a> {
    fn new(path: &'a Path, body: &'a [u8]) -> Self {
        Self {
            path,
            body,
            pos: HEADER_LEN,
            next_kind: 0,
        }
    }

    /// Return the payload of the next section, which must be `expected`.
    fn expect(&mut self, expected: SectionKind) -> Result<&'a [u8]> {
        if SectionKind::ORDER.get(self.next_kind) != Some(&expected) {
            return Err(CheckpointError::integrity(self.path, "sections out of order"));
        }
        let rest = &self.body[self.pos..];
        if rest.len() < SECTION_PREFIX_LEN {
            return Err(CheckpointError::integrity(
                self.path,
                format!("truncated before {expected:?} section"),
            ));
        }
        if rest[0] != expected as u8 {
            return Err(CheckpointError::integrity(
                self.path,
                format!("expected {expected:?} section, found kind {}", rest[0]),
            ));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&rest[1..SECTION_PREFIX_LEN]);
        let len = u64::from_le_bytes(len_bytes);
        let available = (rest.len() - SECTION_PREFIX_LEN) as u64;
        if len > available {
            return Err(CheckpointError::integrity(
                self.path,
                format!("{expected:?} section length {len} exceeds file"),
            ));
        }
        let start = self.pos + SECTION_PREFIX_LEN;
        let end = start + len as usize;
        self.pos = end;
        self.next_kind += 1;
        Ok(&self.body[start..end])
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.body.len() {
            return Err(CheckpointError::integrity(
                self.path,
                "trailing bytes after final section",
            ));
        }
        Ok(())
    }
}

fn decode_json<'a, T: Deserialize<'a>>(path: &Path, kind: SectionKind, json: &'a [u8]) -> Result<T> {
    serde_json::from_slice(json).map_err(|e| {
        CheckpointError::integrity(path, format!("malformed {kind:?} section: {e}"))
    })
}

/// Decode only the metadata row, leaving the other sections untouched.
pub fn decode_metadata(path: &Path, body: &[u8]) -> Result<MetadataRow> {
    let version = read_header(path, body)?;
    let mut sections = Sections::new(path, body);
    let metadata: MetadataRow = decode_json(
        path,
        SectionKind::Metadata,
        sections.expect(SectionKind::Metadata)?,
    )?;
    if metadata.schema_version != version {
        return Err(CheckpointError::integrity(
            path,
            "metadata schema version disagrees with header",
        ));
    }
    Ok(metadata)
}

/// Decode and cross-check every table of an unsigned body.
pub fn decode_tables(path: &Path, body: &[u8]) -> Result<Tables> {
    let metadata = decode_metadata(path, body)?;
    let mut sections = Sections::new(path, body);
    sections.expect(SectionKind::Metadata)?;

    let mut agents: Vec<AgentRow> = decode_json(
        path,
        SectionKind::Agents,
        sections.expect(SectionKind::Agents)?,
    )?;
    let mut findings: Vec<FindingRow> = decode_json(
        path,
        SectionKind::Findings,
        sections.expect(SectionKind::Findings)?,
    )?;
    let mut audit: Vec<AuditRow> = decode_json(
        path,
        SectionKind::Audit,
        sections.expect(SectionKind::Audit)?,
    )?;
    sections.finish()?;

    let owner = &metadata.engagement_id;
    let orphan = agents.iter().any(|r| &r.engagement_id != owner)
        || findings.iter().any(|r| &r.engagement_id != owner)
        || audit.iter().any(|r| &r.engagement_id != owner);
    if orphan {
        return Err(CheckpointError::integrity(
            path,
            format!("rows reference an engagement other than {owner}"),
        ));
    }

    if agents.len() != metadata.agent_count as usize
        || findings.len() != metadata.finding_count as usize
    {
        return Err(CheckpointError::integrity(
            path,
            "row counts disagree with metadata",
        ));
    }

    agents.sort_by_key(|r| r.ordinal);
    findings.sort_by_key(|r| r.ordinal);
    audit.sort_by_key(|r| r.ordinal);
    let sequential = agents.iter().enumerate().all(|(i, r)| r.ordinal as usize == i)
        && findings.iter().enumerate().all(|(i, r)| r.ordinal as usize == i)
        && audit.iter().enumerate().all(|(i, r)| r.ordinal as usize == i);
    if !sequential {
        return Err(CheckpointError::integrity(path, "row ordinals are not contiguous"));
    }

    Ok(Tables {
        metadata,
        agents,
        findings,
        audit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest_of_bytes;

    fn sample_tables() -> Tables {
        let id = EngagementId::parse("eng-1").unwrap();
        Tables {
            metadata: MetadataRow {
                engagement_id: id.clone(),
                scope_reference: PathBuf::from("/srv/scope.json"),
                scope_hash: digest_of_bytes(b"scope"),
                created_at: Utc::now(),
                schema_version: SCHEMA_VERSION,
                agent_count: 1,
                finding_count: 1,
            },
            agents: vec![AgentRow {
                engagement_id: id.clone(),
                ordinal: 0,
                agent: AgentState::new("a1", "recon", serde_json::json!({"port": 22})),
            }],
            findings: vec![FindingRow {
                engagement_id: id.clone(),
                ordinal: 0,
                finding: Finding::new("f1", "a1", serde_json::json!({"open": true})),
            }],
            audit: vec![AuditRow {
                engagement_id: id,
                ordinal: 0,
                entry: AuditEntry::new("operator", "start", serde_json::Value::Null),
            }],
        }
    }

    fn signed(body: Vec<u8>) -> Vec<u8> {
        let sig = digest_of_bytes(&body);
        let mut bytes = body;
        bytes.extend_from_slice(&encode_trailer(&sig));
        bytes
    }

    #[test]
    fn body_decodes_to_same_tables() {
        let tables = sample_tables();
        let body = encode_body(&tables).unwrap();
        let decoded = decode_tables(Path::new("t"), &body).unwrap();
        assert_eq!(decoded, tables);
    }

    #[test]
    fn signature_covers_every_body_byte() {
        let bytes = signed(encode_body(&sample_tables()).unwrap());
        let matches = |bytes: &[u8]| {
            split_signed(bytes).is_some_and(|(body, stored)| digest_of_bytes(body) == stored)
        };
        assert!(matches(&bytes));

        for idx in [0, HEADER_LEN + 3, bytes.len() / 2, bytes.len() - 1] {
            let mut tampered = bytes.clone();
            tampered[idx] ^= 0x01;
            assert!(!matches(&tampered), "flip at {idx} went unnoticed");
        }
    }

    #[test]
    fn short_or_untagged_files_are_unsigned() {
        assert!(split_signed(b"SNTLCKPT").is_none());
        let mut bytes = signed(encode_body(&sample_tables()).unwrap());
        let tag_at = bytes.len() - TRAILER_LEN;
        bytes[tag_at] = b'X';
        assert!(split_signed(&bytes).is_none());
    }

    #[test]
    fn orphan_rows_are_rejected() {
        let mut tables = sample_tables();
        tables.findings[0].engagement_id = EngagementId::parse("other").unwrap();
        let body = encode_body(&tables).unwrap();
        let err = decode_tables(Path::new("t"), &body).unwrap_err();
        assert!(matches!(err, CheckpointError::Integrity { .. }));
    }

    #[test]
    fn unknown_schema_version_is_reported() {
        let mut body = encode_body(&sample_tables()).unwrap();
        body[MAGIC.len()..HEADER_LEN].copy_from_slice(&7u16.to_le_bytes());
        let err = decode_metadata(Path::new("t"), &body).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::UnsupportedSchema { found: 7, .. }
        ));
    }

    #[test]
    fn truncated_section_is_rejected() {
        let body = encode_body(&sample_tables()).unwrap();
        let err = decode_tables(Path::new("t"), &body[..body.len() - 5]).unwrap_err();
        assert!(matches!(err, CheckpointError::Integrity { .. }));
    }

    #[test]
    fn metadata_decodes_without_touching_bodies() {
        let tables = sample_tables();
        let mut body = encode_body(&tables).unwrap();
        // Corrupt the final byte of the audit section; metadata is still readable.
        let last = body.len() - 1;
        body[last] = b'!';
        let meta = decode_metadata(Path::new("t"), &body).unwrap();
        assert_eq!(meta, tables.metadata);
        assert!(decode_tables(Path::new("t"), &body).is_err());
    }
}
