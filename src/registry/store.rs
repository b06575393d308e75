//! Durable, versioned tool storage with lock-free reads.
//!
//! Readers load the last committed [`RegistryDocument`] through an `ArcSwap`
//! pointer. Writers are serialized by an async mutex: each mutation clones the
//! current document, applies the change, snapshots the old document when the
//! change is destructive, writes the new one atomically and only then swaps it
//! in. A failed step leaves both disk and memory untouched.

use crate::error::{Error, ErrorContext};
use crate::registry::backup::{BackupInfo, BackupManager};
use crate::registry::model::{
    advance, DeleteMode, ImportReport, RegistryDocument, RegistryExport, RegistryImport,
    ToolDefinition, ToolDraft, ToolPatch,
};
use crate::registry::schema::ToolSchemaValidator;
use crate::registry::write_atomic;
use crate::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ToolStore {
    path: PathBuf,
    current: ArcSwap<RegistryDocument>,
    writer: Mutex<()>,
    validator: ToolSchemaValidator,
    backups: BackupManager,
}

impl ToolStore {
    /// Opens the registry at `path`, creating an empty document if none exists.
    ///
    /// Snapshots go to `backup_dir`, or a `backups` directory next to the
    /// registry file when not given.
    pub async fn open(
        path: impl Into<PathBuf>,
        backup_dir: Option<PathBuf>,
        keep_backups: usize,
    ) -> Result<Self> {
        let path = path.into();
        let backup_dir = backup_dir.unwrap_or_else(|| {
            path.parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups")
        });
        let validator = ToolSchemaValidator::new()?;

        let doc = match read_document(&path).await? {
            Some(doc) => {
                validate_document(&validator, &doc)?;
                doc
            }
            None => {
                let doc = RegistryDocument::empty(Utc::now());
                write_document(&path, &doc).await?;
                tracing::info!(path = %path.display(), "Created empty tool registry");
                doc
            }
        };

        tracing::info!(
            path = %path.display(),
            version = doc.version,
            tools = doc.tools.len(),
            "Tool registry loaded"
        );

        Ok(Self {
            path,
            current: ArcSwap::from_pointee(doc),
            writer: Mutex::new(()),
            validator,
            backups: BackupManager::new(backup_dir, keep_backups),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn validator(&self) -> &ToolSchemaValidator {
        &self.validator
    }

    /// The last committed document.
    pub fn snapshot(&self) -> Arc<RegistryDocument> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn get(&self, name: &str) -> Result<ToolDefinition> {
        self.current
            .load()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tool '{}'", name)))
    }

    /// Tools sorted by name.
    pub fn list(&self, enabled_only: bool) -> Vec<ToolDefinition> {
        self.current
            .load()
            .tools
            .values()
            .filter(|t| !enabled_only || t.enabled)
            .cloned()
            .collect()
    }

    /// Creates the tool, or fully replaces it when the name is taken.
    pub async fn put(&self, draft: ToolDraft, expected_version: Option<u64>) -> Result<ToolDefinition> {
        self.validator.validate_draft(&draft)?;
        let name = draft.name.clone();
        self.commit("put", move |doc, now| {
            let prior = doc.tools.get(&draft.name);
            check_expected(&draft.name, prior, expected_version)?;
            let (def, destructive) = match prior {
                Some(old) => {
                    let changed = old.service_config != draft.service_config;
                    (draft.replace_into(old, now), changed)
                }
                None => (draft.into_definition(now), false),
            };
            doc.tools.insert(def.name.clone(), def.clone());
            Ok((def, destructive))
        })
        .await
        .map(|def| {
            tracing::info!(tool = %name, version = def.version, "Tool stored");
            def
        })
    }

    /// Creates a new tool; fails if the name is taken.
    pub async fn create(&self, draft: ToolDraft) -> Result<ToolDefinition> {
        self.validator.validate_draft(&draft)?;
        self.commit("create", move |doc, now| {
            if doc.tools.contains_key(&draft.name) {
                return Err(Error::AlreadyExists { name: draft.name });
            }
            let def = draft.into_definition(now);
            doc.tools.insert(def.name.clone(), def.clone());
            Ok((def, false))
        })
        .await
    }

    /// Fully replaces an existing tool.
    pub async fn replace(
        &self,
        draft: ToolDraft,
        expected_version: Option<u64>,
    ) -> Result<ToolDefinition> {
        self.validator.validate_draft(&draft)?;
        self.commit("replace", move |doc, now| {
            let old = existing(doc, &draft.name)?;
            check_expected(&draft.name, Some(old), expected_version)?;
            let destructive = old.service_config != draft.service_config;
            let def = draft.replace_into(old, now);
            doc.tools.insert(def.name.clone(), def.clone());
            Ok((def, destructive))
        })
        .await
    }

    pub async fn patch(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_version: Option<u64>,
    ) -> Result<ToolDefinition> {
        let validator = &self.validator;
        self.commit("patch", move |doc, now| {
            let old = existing(doc, name)?;
            check_expected(name, Some(old), expected_version)?;
            let draft = patch.apply_to(old);
            validator.validate_draft(&draft)?;
            let destructive = old.service_config != draft.service_config;
            let def = draft.replace_into(old, now);
            doc.tools.insert(def.name.clone(), def.clone());
            Ok((def, destructive))
        })
        .await
    }

    pub async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_version: Option<u64>,
    ) -> Result<ToolDefinition> {
        self.commit(if enabled { "enable" } else { "disable" }, move |doc, now| {
            let tool = doc
                .tools
                .get_mut(name)
                .ok_or_else(|| Error::not_found(format!("tool '{}'", name)))?;
            check_expected(name, Some(&*tool), expected_version)?;
            tool.enabled = enabled;
            if enabled {
                tool.archived_at = None;
            }
            tool.touch(now);
            Ok((tool.clone(), false))
        })
        .await
    }

    /// Soft delete returns the archived tool; hard delete returns `None`.
    pub async fn delete(
        &self,
        name: &str,
        mode: DeleteMode,
        expected_version: Option<u64>,
    ) -> Result<Option<ToolDefinition>> {
        self.commit("delete", move |doc, now| {
            let old = existing(doc, name)?;
            check_expected(name, Some(old), expected_version)?;
            match mode {
                DeleteMode::Hard => {
                    doc.tools.remove(name);
                    Ok((None, true))
                }
                DeleteMode::Soft => {
                    let mut tool = old.clone();
                    tool.enabled = false;
                    tool.archived_at = Some(now);
                    tool.touch(now);
                    doc.tools.insert(tool.name.clone(), tool.clone());
                    Ok((Some(tool), true))
                }
            }
        })
        .await
    }

    pub fn export(&self) -> RegistryExport {
        let doc = self.current.load();
        RegistryExport {
            version: doc.version,
            exported_at: Utc::now(),
            tools: doc.tools.clone(),
        }
    }

    /// Bulk create. Existing tools are replaced only with `replace_existing`.
    pub async fn import(&self, import: RegistryImport) -> Result<ImportReport> {
        for (key, draft) in &import.tools {
            if key != &draft.name {
                return Err(Error::validation_with_context(
                    format!("import key '{}' does not match tool name '{}'", key, draft.name),
                    ErrorContext::new().with_field_path(format!("tools.{}", key)),
                ));
            }
            self.validator.validate_draft(draft)?;
        }

        let report = self
            .commit("import", move |doc, now| {
                let mut imported = 0;
                let mut skipped = 0;
                for (name, draft) in import.tools {
                    let def = match doc.tools.get(&name) {
                        Some(_) if !import.replace_existing => {
                            skipped += 1;
                            continue;
                        }
                        Some(old) => draft.replace_into(old, now),
                        None => draft.into_definition(now),
                    };
                    doc.tools.insert(name, def);
                    imported += 1;
                }
                Ok((
                    ImportReport {
                        imported,
                        skipped,
                        registry_version: 0,
                    },
                    true,
                ))
            })
            .await?;

        Ok(ImportReport {
            registry_version: self.version(),
            ..report
        })
    }

    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.backups.list().await
    }

    /// Replaces the registry with a snapshot's document. Returns the new registry version.
    pub async fn restore(&self, file_name: &str) -> Result<u64> {
        let restored = self.backups.load(file_name).await?;
        validate_document(&self.validator, &restored)?;
        self.commit("restore", move |doc, now| {
            let mut tools = restored.tools;
            for (name, tool) in tools.iter_mut() {
                if let Some(live) = doc.tools.get(name) {
                    tool.version = tool.version.max(live.version) + 1;
                    tool.updated_at = advance(live.updated_at.max(tool.updated_at), now);
                }
            }
            doc.tools = tools;
            Ok(((), true))
        })
        .await?;
        let version = self.version();
        tracing::info!(file = %file_name, registry_version = version, "Registry restored from snapshot");
        Ok(version)
    }

    /// Re-reads the document from disk. Returns `false` when it matches memory.
    ///
    /// An external edit that does not bump the version is still picked up; the
    /// registry version is moved past the in-memory one and written back.
    pub async fn reload(&self) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let current = self.current.load_full();
        let Some(mut doc) = read_document(&self.path).await? else {
            tracing::warn!(path = %self.path.display(), "Registry file missing; keeping in-memory document");
            return Ok(false);
        };
        if doc == *current {
            return Ok(false);
        }
        validate_document(&self.validator, &doc)?;

        if doc.version <= current.version {
            doc.version = current.version + 1;
            doc.updated_at = advance(current.updated_at, Utc::now());
            write_document(&self.path, &doc).await?;
        }

        tracing::info!(
            version = doc.version,
            tools = doc.tools.len(),
            "Tool registry reloaded from disk"
        );
        self.current.store(Arc::new(doc));
        Ok(true)
    }

    async fn commit<T, F>(&self, reason: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryDocument, DateTime<Utc>) -> Result<(T, bool)>,
    {
        let _guard = self.writer.lock().await;
        let current = self.current.load_full();
        let mut next = (*current).clone();
        let now = Utc::now();

        let (out, destructive) = mutate(&mut next, now)?;
        next.version = current.version + 1;
        next.updated_at = advance(current.updated_at, now);

        if destructive {
            self.backups.snapshot(&current, reason).await?;
        }
        write_document(&self.path, &next).await?;

        tracing::debug!(reason, registry_version = next.version, destructive, "Registry committed");
        self.current.store(Arc::new(next));
        Ok(out)
    }
}

fn existing<'a>(doc: &'a RegistryDocument, name: &str) -> Result<&'a ToolDefinition> {
    doc.tools
        .get(name)
        .ok_or_else(|| Error::not_found(format!("tool '{}'", name)))
}

/// `Some(0)` asserts the tool does not exist yet.
fn check_expected(name: &str, tool: Option<&ToolDefinition>, expected: Option<u64>) -> Result<()> {
    let current_version = tool.map(|t| t.version).unwrap_or(0);
    match expected {
        Some(expected) if expected != current_version => Err(Error::RegistryConflict {
            name: name.to_string(),
            expected,
            current_version,
        }),
        _ => Ok(()),
    }
}

fn validate_document(validator: &ToolSchemaValidator, doc: &RegistryDocument) -> Result<()> {
    for (key, def) in &doc.tools {
        if key != &def.name {
            return Err(Error::validation_with_context(
                format!("registry key '{}' does not match tool name '{}'", key, def.name),
                ErrorContext::new().with_field_path(format!("tools.{}", key)),
            ));
        }
        validator
            .validate_draft(&ToolDraft::from(def))
            .map_err(|e| match e {
                Error::Validation { message, context } => Error::Validation {
                    message: format!("tool '{}': {}", key, message),
                    context,
                },
                other => other,
            })?;
    }
    Ok(())
}

async fn read_document(path: &Path) -> Result<Option<RegistryDocument>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::storage_with_context(
                "cannot read registry file",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source(path.display().to_string()),
            ))
        }
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        Error::validation_with_context(
            "registry file is not a valid registry document",
            ErrorContext::new()
                .with_details(e.to_string())
                .with_source(path.display().to_string()),
        )
    })
}

async fn write_document(path: &Path, doc: &RegistryDocument) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    write_atomic(path, &bytes).await
}
