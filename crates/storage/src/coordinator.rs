//! Store lifecycle and context management
//!
//! Opening a store walks one of three paths:
//! - Opening → Healthy
//! - Opening → Migrating → Healthy, when a migration from the stored model exists
//! - Opening → Corrupted → Healthy, after the file is backed up and recreated empty
//!
//! No context exists before the store is Healthy, so nothing can read or
//! write a store that is still migrating or being rebuilt.

use crate::config::{Migration, ModelDescriptor, StoreConfig};
use crate::context::{ContextKind, ContextScope, PersistenceContext, SaveOutcome};
use crate::error::{StoreError, StoreResult};
use crate::file::{StoreContents, StoreEnvelope, StoreFile, StoreLock, StoreMetadata, FORMAT_VERSION};
use crate::store::StoreShared;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreHealth {
    Healthy,
    Migrating,
    Corrupted,
}

/// What happened while opening the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Health states passed through, ending in `Healthy`
    pub transitions: Vec<StoreHealth>,

    /// Where an incompatible store file was moved
    pub backup: Option<PathBuf>,

    /// Model fingerprint the store was migrated from
    pub migrated_from: Option<String>,

    /// An interrupted write was completed from the journal
    pub journal_replayed: bool,

    /// No store existed; an empty one was created
    pub created: bool,
}

impl OpenReport {
    pub fn was_recreated(&self) -> bool {
        self.backup.is_some()
    }
}

/// Owner of the on-disk store, its UI context and its background contexts
///
/// # Example
///
/// ```no_run
/// use raidbook_storage::{EntityRecord, PersistenceCoordinator, StoreConfig};
///
/// let store = PersistenceCoordinator::open(StoreConfig::default())?;
///
/// // Write on a fresh background context; the UI context sees the result
/// store.perform_background_task(|scope| {
///     scope.insert(EntityRecord::new("boss-1", "boss").with_property("health", 1200));
/// })?;
///
/// let health = store
///     .ui_context()
///     .perform(|scope| scope.property(&"boss-1".into(), "health"))?;
/// assert_eq!(health, Some(1200.into()));
/// # Ok::<(), raidbook_storage::StoreError>(())
/// ```
pub struct PersistenceCoordinator {
    config: StoreConfig,
    shared: Arc<StoreShared>,
    ui: PersistenceContext,
    report: OpenReport,
    next_context: AtomicU64,
}

impl PersistenceCoordinator {
    /// Open (or create) the store and start its UI context
    ///
    /// Fails with the retryable [`StoreError::Timeout`] if another owner holds
    /// the store for longer than the configured open timeout, and with the
    /// fatal [`StoreError::RecreateFailed`] if an incompatible store could not
    /// be replaced.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let file = StoreFile::new(&config.path);
        file.ensure_parent()?;
        let lock = StoreLock::acquire(file.lock_path(), config.open_timeout())?;

        let mut report = OpenReport {
            journal_replayed: file.replay_journal()?,
            ..OpenReport::default()
        };
        let envelope = Self::load(&file, &config.model, &mut report)?;
        report.transitions.push(StoreHealth::Healthy);

        tracing::info!(
            target: "raidbook.storage",
            path = %file.path().display(),
            entities = envelope.records.len(),
            transitions = ?report.transitions,
            "store opened"
        );

        let shared = Arc::new(StoreShared::new(file, envelope, lock));
        let ui = PersistenceContext::spawn(ContextKind::Ui, "ui", Arc::clone(&shared))?;
        if let Some(inbox) = ui.job_sender() {
            shared.attach_ui(inbox);
        }

        Ok(Self { config, shared, ui, report, next_context: AtomicU64::new(1) })
    }

    fn load(
        file: &StoreFile,
        model: &ModelDescriptor,
        report: &mut OpenReport,
    ) -> StoreResult<StoreEnvelope> {
        match file.read()? {
            StoreContents::Missing => {
                let envelope = StoreEnvelope::empty(model.fingerprint());
                file.write(&envelope)?;
                report.created = true;
                Ok(envelope)
            }
            StoreContents::Parsed(envelope) if Self::is_current(&envelope.metadata, model) => {
                Ok(envelope)
            }
            StoreContents::Parsed(envelope) => {
                let found = envelope.metadata.model_fingerprint.clone();
                if envelope.metadata.format_version == FORMAT_VERSION {
                    if let Some(migration) = model.migration_from(&found) {
                        return Self::migrate(file, model, envelope, migration, report);
                    }
                }
                tracing::warn!(
                    target: "raidbook.storage",
                    found = %found,
                    format_version = envelope.metadata.format_version,
                    expected = model.fingerprint(),
                    "store model is incompatible"
                );
                Self::recreate(file, model, report)
            }
            StoreContents::Unreadable(err) => {
                tracing::warn!(
                    target: "raidbook.storage",
                    error = %err,
                    "store file is unreadable"
                );
                Self::recreate(file, model, report)
            }
        }
    }

    fn is_current(metadata: &StoreMetadata, model: &ModelDescriptor) -> bool {
        metadata.format_version == FORMAT_VERSION && metadata.model_fingerprint == model.fingerprint()
    }

    fn migrate(
        file: &StoreFile,
        model: &ModelDescriptor,
        envelope: StoreEnvelope,
        migration: &Migration,
        report: &mut OpenReport,
    ) -> StoreResult<StoreEnvelope> {
        report.transitions.push(StoreHealth::Migrating);
        let from = envelope.metadata.model_fingerprint.clone();
        tracing::info!(
            target: "raidbook.storage",
            from = %from,
            to = model.fingerprint(),
            "migrating store"
        );

        let records = migration(envelope.records)
            .map_err(|reason| StoreError::MigrationFailed { from: from.clone(), reason })?;
        let migrated = StoreEnvelope {
            metadata: StoreMetadata {
                model_fingerprint: model.fingerprint().to_string(),
                ..envelope.metadata
            },
            records,
        };
        file.write(&migrated)?;

        report.migrated_from = Some(from);
        Ok(migrated)
    }

    /// Back up the incompatible file and start over with an empty store
    fn recreate(
        file: &StoreFile,
        model: &ModelDescriptor,
        report: &mut OpenReport,
    ) -> StoreResult<StoreEnvelope> {
        report.transitions.push(StoreHealth::Corrupted);
        let failed = |source: std::io::Error| {
            tracing::error!(
                target: "raidbook.storage",
                path = %file.path().display(),
                error = %source,
                "store recreation failed"
            );
            StoreError::RecreateFailed { path: file.path().to_path_buf(), source }
        };

        let backup = file.back_up().map_err(failed)?;
        let envelope = StoreEnvelope::empty(model.fingerprint());
        file.write(&envelope).map_err(failed)?;

        tracing::warn!(
            target: "raidbook.storage",
            backup = %backup.display(),
            "incompatible store backed up and recreated empty"
        );
        report.backup = Some(backup);
        Ok(envelope)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn health(&self) -> StoreHealth {
        self.shared.health()
    }

    pub fn open_report(&self) -> &OpenReport {
        &self.report
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn metadata(&self) -> &StoreMetadata {
        self.shared.metadata()
    }

    /// Committed entity count
    pub fn entity_count(&self) -> usize {
        self.shared.len()
    }

    /// The process's single UI context
    pub fn ui_context(&self) -> &PersistenceContext {
        &self.ui
    }

    /// A fresh context for one unit of background work
    ///
    /// Drop it when the work is done; contexts are not meant to be reused
    /// across unrelated operations.
    pub fn new_background_context(&self) -> StoreResult<PersistenceContext> {
        let n = self.next_context.fetch_add(1, Ordering::Relaxed);
        PersistenceContext::spawn(ContextKind::Background, &format!("bg-{n}"), Arc::clone(&self.shared))
    }

    /// Run `work` on a fresh background context, save it and discard it
    pub fn perform_background_task<R, F>(&self, work: F) -> StoreResult<(R, SaveOutcome)>
    where
        R: Send + 'static,
        F: FnOnce(&mut ContextScope) -> R + Send + 'static,
    {
        let context = self.new_background_context()?;
        let value = context.perform(work)?;
        let outcome = context.save()?;
        Ok((value, outcome))
    }

    /// Synchronously save the UI context
    ///
    /// Blocks the caller until the write is on disk. Meant for moments like
    /// the app moving to the background, not for routine saves.
    pub fn save_ui_context(&self) -> StoreResult<SaveOutcome> {
        self.ui.save()
    }
}

impl Drop for PersistenceCoordinator {
    fn drop(&mut self) {
        // Background contexts still alive must not keep the UI executor running
        self.shared.detach_ui();
    }
}
