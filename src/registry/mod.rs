//! Dynamic tool registry.
//!
//! Tool definitions live in one JSON document on disk. [`ToolStore`] owns the
//! document (validation, versioning, atomic writes, backups), [`RegistryManager`]
//! is the face the rest of the crate talks to, and [`RegistryWatcher`] reloads
//! the document when it is edited externally.

pub mod backup;
pub mod manager;
pub mod model;
pub mod schema;
pub mod store;
pub mod watcher;

pub use backup::{BackupInfo, BackupManager, DEFAULT_KEEP_BACKUPS};
pub use manager::{RegistryEvent, RegistryEventKind, RegistryManager};
pub use model::{
    ChangeOutcome, DeleteMode, FilterOperator, HttpMethod, ImportReport, ODataVersion,
    ParamBinding, ParamKind, ParameterSpec, RegistryChange, RegistryDocument, RegistryExport,
    RegistryImport, RegistryStats, ServiceConfig, ToolDefaults, ToolDefinition, ToolDraft,
    ToolPatch,
};
pub use schema::ToolSchemaValidator;
pub use store::ToolStore;
pub use watcher::RegistryWatcher;

use crate::error::{Error, ErrorContext};
use crate::Result;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Writes `bytes` to a sibling temp file, syncs it and renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let storage_err = |msg: &str, e: std::io::Error| {
        Error::storage_with_context(
            msg,
            ErrorContext::new()
                .with_details(e.to_string())
                .with_source(path.display().to_string()),
        )
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage_err("cannot create directory", e))?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| storage_err("cannot create temp file", e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| storage_err("cannot write temp file", e))?;
    file.sync_all()
        .await
        .map_err(|e| storage_err("cannot sync temp file", e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| storage_err("cannot replace registry file", e))
}
