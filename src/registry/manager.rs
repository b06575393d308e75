//! Registry facade used by the resolver, dispatcher and admin surfaces.

use crate::error::Error;
use crate::registry::backup::BackupInfo;
use crate::registry::model::{
    ChangeOutcome, DeleteMode, ImportReport, RegistryChange, RegistryExport, RegistryImport,
    RegistryStats, ToolDefinition, ToolDraft, ToolPatch,
};
use crate::registry::store::ToolStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    Created,
    Updated,
    Enabled,
    Disabled,
    Archived,
    Deleted,
    Imported,
    Restored,
    Reloaded,
}

/// Published after every committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    /// Affected tool; `None` for whole-registry events.
    pub name: Option<String>,
    pub registry_version: u64,
}

pub struct RegistryManager {
    store: Arc<ToolStore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl RegistryManager {
    pub fn new(store: Arc<ToolStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<ToolStore> {
        &self.store
    }

    /// Enabled tools as of the last commit. Owned, so callers never hold registry state.
    pub fn resolve_candidates(&self) -> Vec<ToolDefinition> {
        self.store.snapshot().enabled_tools().cloned().collect()
    }

    /// Dispatch-time lookup: the tool must exist and be enabled right now.
    pub fn lookup_enabled(&self, name: &str) -> Result<ToolDefinition> {
        let tool = self.store.get(name)?;
        if !tool.enabled {
            return Err(Error::ToolDisabled {
                name: name.to_string(),
            });
        }
        Ok(tool)
    }

    pub fn get(&self, name: &str) -> Result<ToolDefinition> {
        self.store.get(name)
    }

    pub fn list(&self, enabled_only: bool) -> Vec<ToolDefinition> {
        self.store.list(enabled_only)
    }

    pub fn parse_draft(&self, value: serde_json::Value) -> Result<ToolDraft> {
        self.store.validator().parse_draft(value)
    }

    pub fn parse_patch(&self, value: serde_json::Value) -> Result<ToolPatch> {
        self.store.validator().parse_patch(value)
    }

    /// Validates and commits one change, then notifies subscribers.
    pub async fn apply(&self, change: RegistryChange) -> Result<ChangeOutcome> {
        let name = change.tool_name().to_string();
        let (kind, version) = match change {
            RegistryChange::Create(draft) => {
                let def = self.store.create(draft).await?;
                (RegistryEventKind::Created, Some(def.version))
            }
            RegistryChange::Replace {
                draft,
                expected_version,
            } => {
                let def = self.store.replace(draft, expected_version).await?;
                (RegistryEventKind::Updated, Some(def.version))
            }
            RegistryChange::Patch {
                name,
                patch,
                expected_version,
            } => {
                let def = self.store.patch(&name, patch, expected_version).await?;
                (RegistryEventKind::Updated, Some(def.version))
            }
            RegistryChange::SetEnabled {
                name,
                enabled,
                expected_version,
            } => {
                let def = self
                    .store
                    .set_enabled(&name, enabled, expected_version)
                    .await?;
                let kind = if enabled {
                    RegistryEventKind::Enabled
                } else {
                    RegistryEventKind::Disabled
                };
                (kind, Some(def.version))
            }
            RegistryChange::Delete {
                name,
                mode,
                expected_version,
            } => {
                let def = self.store.delete(&name, mode, expected_version).await?;
                let kind = match mode {
                    DeleteMode::Soft => RegistryEventKind::Archived,
                    DeleteMode::Hard => RegistryEventKind::Deleted,
                };
                (kind, def.map(|d| d.version))
            }
        };

        let registry_version = self.store.version();
        tracing::info!(
            tool = %name,
            event = ?kind,
            version = ?version,
            registry_version,
            "Registry change applied"
        );
        self.publish(kind, Some(name.clone()), registry_version);

        Ok(ChangeOutcome {
            name,
            version,
            registry_version,
        })
    }

    /// Receiver of every event committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> RegistryStats {
        self.store.snapshot().stats()
    }

    pub fn export(&self) -> RegistryExport {
        self.store.export()
    }

    pub async fn import(&self, import: RegistryImport) -> Result<ImportReport> {
        let report = self.store.import(import).await?;
        tracing::info!(
            imported = report.imported,
            skipped = report.skipped,
            registry_version = report.registry_version,
            "Registry import applied"
        );
        self.publish(RegistryEventKind::Imported, None, report.registry_version);
        Ok(report)
    }

    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.store.backups().await
    }

    pub async fn restore(&self, file_name: &str) -> Result<u64> {
        let version = self.store.restore(file_name).await?;
        self.publish(RegistryEventKind::Restored, None, version);
        Ok(version)
    }

    /// Re-reads the registry file. Returns the registry version now in effect.
    pub async fn reload(&self) -> Result<u64> {
        let changed = self.store.reload().await?;
        let version = self.store.version();
        if changed {
            self.publish(RegistryEventKind::Reloaded, None, version);
        } else {
            tracing::debug!(registry_version = version, "Registry file unchanged; reload skipped");
        }
        Ok(version)
    }

    fn publish(&self, kind: RegistryEventKind, name: Option<String>, registry_version: u64) {
        // No receivers is fine.
        let _ = self.events.send(RegistryEvent {
            kind,
            name,
            registry_version,
        });
    }
}
