//! Committed store state shared by every context of one coordinator

use crate::config::Records;
use crate::context::ContextJob;
use crate::coordinator::StoreHealth;
use crate::error::{StoreError, StoreResult};
use crate::file::{StoreEnvelope, StoreFile, StoreLock, StoreMetadata};
use crate::record::{ChangeSet, EntityId, EntityRecord, PendingChange};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, RwLock};

pub(crate) struct StoreShared {
    file: StoreFile,
    metadata: StoreMetadata,
    records: RwLock<Records>,
    health: Mutex<StoreHealth>,
    ui_inbox: Mutex<Option<Sender<ContextJob>>>,
    // Released when the last context goes away
    _lock: StoreLock,
}

impl StoreShared {
    pub fn new(file: StoreFile, envelope: StoreEnvelope, lock: StoreLock) -> Self {
        Self {
            file,
            metadata: envelope.metadata,
            records: RwLock::new(envelope.records),
            health: Mutex::new(StoreHealth::Healthy),
            ui_inbox: Mutex::new(None),
            _lock: lock,
        }
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn health(&self) -> StoreHealth {
        *self.health.lock().unwrap()
    }

    pub fn record(&self, id: &EntityId) -> Option<EntityRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.records.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn attach_ui(&self, inbox: Sender<ContextJob>) {
        *self.ui_inbox.lock().unwrap() = Some(inbox);
    }

    pub fn detach_ui(&self) {
        self.ui_inbox.lock().unwrap().take();
    }

    /// Queue work on the UI context; dropped once the coordinator is gone
    pub fn post_to_ui(&self, job: ContextJob) {
        let inbox = self.ui_inbox.lock().unwrap();
        let delivered = inbox.as_ref().is_some_and(|inbox| inbox.send(job).is_ok());
        if !delivered {
            tracing::debug!(
                target: "raidbook.storage",
                "UI context closed, merge dropped"
            );
        }
    }

    /// Apply staged changes to the store and persist them
    ///
    /// Commits are serialized by the records lock. Updates to records another
    /// context deleted in the meantime are skipped.
    pub fn commit(&self, pending: &BTreeMap<EntityId, PendingChange>) -> StoreResult<ChangeSet> {
        let health = self.health();
        if health != StoreHealth::Healthy {
            return Err(StoreError::Unavailable(health));
        }

        let mut records = self.records.write().unwrap();
        let mut next = records.clone();
        let mut changes = ChangeSet::default();

        for (id, change) in pending {
            match change {
                PendingChange::Delete => {
                    if next.remove(id).is_some() {
                        changes.deleted.insert(id.clone());
                    }
                }
                PendingChange::Upsert { kind, properties } => {
                    if !next.contains_key(id) {
                        match kind {
                            Some(kind) => {
                                next.insert(id.clone(), EntityRecord::new(id.clone(), kind.clone()));
                            }
                            None => continue,
                        }
                    }
                    let Some(record) = next.get_mut(id) else {
                        continue;
                    };
                    change.apply_to(record);
                    changes.touched.insert(id.clone(), properties.keys().cloned().collect());
                    changes.updated.insert(id.clone(), record.clone());
                }
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        let envelope = StoreEnvelope { metadata: self.metadata.clone(), records: next };
        self.file.write(&envelope)?;
        *records = envelope.records;
        Ok(changes)
    }
}
