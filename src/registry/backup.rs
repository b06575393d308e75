//! Timestamped registry snapshots.
//!
//! Every destructive mutation writes the pre-change document to
//! `tool_registry_v{version}_{YYYYMMDDTHHMMSS.ffffffZ}.json` in the backup
//! directory. Each file carries a SHA-256 digest of its embedded document that
//! is checked again on restore. Only the newest `keep` snapshots survive a
//! rotation.

use crate::error::{Error, ErrorContext};
use crate::registry::model::RegistryDocument;
use crate::registry::write_atomic;
use crate::Result;
use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const FILE_PREFIX: &str = "tool_registry_v";
const FILE_SUFFIX: &str = ".json";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Default number of snapshots kept after rotation.
pub const DEFAULT_KEEP_BACKUPS: usize = 10;

/// Metadata of one snapshot, as listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub file_name: String,
    pub registry_version: u64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    taken_at: DateTime<Utc>,
    registry_version: u64,
    reason: String,
    sha256: String,
    document: RegistryDocument,
}

pub struct BackupManager {
    dir: PathBuf,
    keep: usize,
    last_taken: Mutex<Option<DateTime<Utc>>>,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
            last_taken: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `doc` as a new snapshot and rotates old ones.
    pub async fn snapshot(&self, doc: &RegistryDocument, reason: &str) -> Result<BackupInfo> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.storage_error("cannot create backup directory", e))?;

        let taken_at = {
            let mut last = self.last_taken.lock().await;
            if last.is_none() {
                *last = self.list().await?.first().map(|b| b.taken_at);
            }
            let now = Utc::now().trunc_subsecs(6);
            let taken_at = match *last {
                Some(prev) if now <= prev => prev + Duration::microseconds(1),
                _ => now,
            };
            *last = Some(taken_at);
            taken_at
        };

        let digest = digest_document(doc)?;
        let file = SnapshotFile {
            taken_at,
            registry_version: doc.version,
            reason: reason.to_string(),
            sha256: digest,
            document: doc.clone(),
        };
        let file_name = snapshot_file_name(doc.version, taken_at);
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.dir.join(&file_name), &bytes).await?;

        tracing::info!(
            file = %file_name,
            registry_version = doc.version,
            reason,
            "Registry snapshot written"
        );

        let removed = self.rotate().await?;
        if removed > 0 {
            tracing::debug!(removed, keep = self.keep, "Rotated registry snapshots");
        }

        Ok(BackupInfo {
            file_name,
            registry_version: doc.version,
            taken_at,
        })
    }

    /// Snapshots in the backup directory, newest first.
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(self.storage_error("cannot read backup directory", e)),
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(info) = parse_file_name(&name) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(out)
    }

    /// Deletes all but the newest `keep` snapshots. Returns how many were removed.
    pub async fn rotate(&self) -> Result<usize> {
        let all = self.list().await?;
        let mut removed = 0;
        for stale in all.iter().skip(self.keep) {
            match tokio::fs::remove_file(self.dir.join(&stale.file_name)).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(file = %stale.file_name, error = %e, "Failed to remove old snapshot")
                }
            }
        }
        Ok(removed)
    }

    /// Reads a snapshot and verifies its digest.
    pub async fn load(&self, file_name: &str) -> Result<RegistryDocument> {
        if parse_file_name(file_name).is_none() {
            return Err(Error::not_found(format!("backup '{}'", file_name)));
        }
        let path = self.dir.join(file_name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("backup '{}'", file_name)))
            }
            Err(e) => return Err(self.storage_error("cannot read snapshot", e)),
        };
        let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::storage_with_context(
                "snapshot is not valid JSON",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source(file_name.to_string()),
            )
        })?;
        let actual = digest_document(&file.document)?;
        if actual != file.sha256 {
            return Err(Error::storage_with_context(
                "snapshot digest mismatch",
                ErrorContext::new()
                    .with_details(format!("expected {}, computed {}", file.sha256, actual))
                    .with_source(file_name.to_string()),
            ));
        }
        Ok(file.document)
    }

    fn storage_error(&self, msg: &str, e: std::io::Error) -> Error {
        Error::storage_with_context(
            msg,
            ErrorContext::new()
                .with_details(e.to_string())
                .with_source(self.dir.display().to_string()),
        )
    }
}

fn digest_document(doc: &RegistryDocument) -> Result<String> {
    let bytes = serde_json::to_vec(doc)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn snapshot_file_name(version: u64, taken_at: DateTime<Utc>) -> String {
    format!(
        "{}{}_{}{}",
        FILE_PREFIX,
        version,
        taken_at.format(TIMESTAMP_FORMAT),
        FILE_SUFFIX
    )
}

fn parse_file_name(name: &str) -> Option<BackupInfo> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (version, ts) = stem.split_once('_')?;
    let registry_version = version.parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(ts.strip_suffix('Z')?, "%Y%m%dT%H%M%S%.f").ok()?;
    Some(BackupInfo {
        file_name: name.to_string(),
        registry_version,
        taken_at: naive.and_utc(),
    })
}
