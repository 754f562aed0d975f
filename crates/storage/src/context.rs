//! Thread-confined persistence contexts
//!
//! A context owns a serial executor thread. Its state (registered records and
//! pending changes) lives on that thread and is reachable only through the
//! [`ContextScope`] handed to closures submitted with
//! [`PersistenceContext::perform`]. There is no other path to it, so a context
//! can never be touched from two threads at once.

use crate::error::{StoreError, StoreResult};
use crate::record::{ChangeSet, EntityId, EntityRecord, PendingChange};
use crate::store::StoreShared;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

pub(crate) type ContextJob = Box<dyn FnOnce(&mut ContextScope) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// The single context backing UI state
    Ui,
    /// A short-lived context for one unit of background work
    Background,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Nothing was pending; the store was not touched
    NoChanges,
    /// The pending changes were committed
    Saved(ChangeSet),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}

/// Capability to read and modify one context, valid only on its executor
///
/// Records read through the scope are registered in the context and served
/// from there afterwards, so a long-lived context keeps the values it first
/// saw until a merge or [`ContextScope::refresh`] replaces them.
pub struct ContextScope {
    kind: ContextKind,
    store: Arc<StoreShared>,
    registered: HashMap<EntityId, EntityRecord>,
    pending: BTreeMap<EntityId, PendingChange>,
}

impl ContextScope {
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Current view of a record: registered copy (or store) plus pending changes
    pub fn fetch(&mut self, id: &EntityId) -> Option<EntityRecord> {
        let change = self.pending.get(id);
        if matches!(change, Some(PendingChange::Delete)) {
            return None;
        }

        let base = match self.registered.get(id) {
            Some(record) => Some(record.clone()),
            None => {
                let loaded = self.store.record(id);
                if let Some(record) = &loaded {
                    self.registered.insert(id.clone(), record.clone());
                }
                loaded
            }
        };

        let change = self.pending.get(id);
        let mut record = match (base, change) {
            (Some(record), _) => record,
            (None, Some(PendingChange::Upsert { kind: Some(kind), .. })) => {
                EntityRecord::new(id.clone(), kind.clone())
            }
            _ => return None,
        };
        if let Some(change) = change {
            change.apply_to(&mut record);
        }
        Some(record)
    }

    /// Record as last saved to the store
    ///
    /// Ignores this context's registered copy and staged changes, and does not
    /// register the result.
    pub fn committed(&self, id: &EntityId) -> Option<EntityRecord> {
        self.store.record(id)
    }

    pub fn property(&mut self, id: &EntityId, key: &str) -> Option<Value> {
        self.fetch(id)?.properties.remove(key)
    }

    pub fn contains(&mut self, id: &EntityId) -> bool {
        self.fetch(id).is_some()
    }

    /// Ids visible to this context, in order
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: BTreeSet<EntityId> = self.store.ids().into_iter().collect();
        for (id, change) in &self.pending {
            match change {
                PendingChange::Delete => {
                    ids.remove(id);
                }
                PendingChange::Upsert { kind: Some(_), .. } => {
                    ids.insert(id.clone());
                }
                PendingChange::Upsert { kind: None, .. } => {}
            }
        }
        ids.into_iter().collect()
    }

    /// Create a record, or overwrite the kind and listed properties of an existing one
    pub fn insert(&mut self, record: EntityRecord) {
        let EntityRecord { id, kind, properties } = record;
        self.pending.insert(id, PendingChange::Upsert { kind: Some(kind), properties });
    }

    /// Stage a property write; returns false if the record does not exist
    pub fn set_property(
        &mut self,
        id: &EntityId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> bool {
        if !self.contains(id) {
            return false;
        }
        let change = self
            .pending
            .entry(id.clone())
            .or_insert_with(|| PendingChange::Upsert { kind: None, properties: BTreeMap::new() });
        if let PendingChange::Upsert { properties, .. } = change {
            properties.insert(key.into(), value.into());
        }
        true
    }

    /// Stage a delete; returns false if the record does not exist
    pub fn delete(&mut self, id: &EntityId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if self.store.record(id).is_some() {
            self.pending.insert(id.clone(), PendingChange::Delete);
        } else {
            // Only ever inserted in this context
            self.pending.remove(id);
        }
        true
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Entities with staged changes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Drop every staged change
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    /// Forget the registered copy so the next fetch reads the store
    pub fn refresh(&mut self, id: &EntityId) {
        self.registered.remove(id);
    }

    /// Forget registered copies that have no staged changes
    pub fn release_unmodified(&mut self) -> usize {
        let before = self.registered.len();
        let pending = &self.pending;
        self.registered.retain(|id, _| pending.contains_key(id));
        before - self.registered.len()
    }

    pub(crate) fn save(&mut self) -> StoreResult<SaveOutcome> {
        if self.pending.is_empty() {
            return Ok(SaveOutcome::NoChanges);
        }

        let changes = self.store.commit(&self.pending)?;
        self.pending.clear();
        for id in &changes.deleted {
            self.registered.remove(id);
        }
        for (id, record) in &changes.updated {
            self.registered.insert(id.clone(), record.clone());
        }

        tracing::debug!(
            target: "raidbook.storage",
            context = ?self.kind,
            entities = changes.entity_count(),
            properties = changes.property_count(),
            "context saved"
        );

        if self.kind == ContextKind::Background && !changes.is_empty() {
            let merged = changes.clone();
            self.store.post_to_ui(Box::new(move |ui: &mut ContextScope| ui.merge(&merged)));
        }
        Ok(SaveOutcome::Saved(changes))
    }

    /// Fold a committed change-set from another context into this one
    ///
    /// Committed values replace registered copies of every touched property,
    /// and staged edits of those same properties are dropped: the store wins.
    pub(crate) fn merge(&mut self, changes: &ChangeSet) {
        for id in &changes.deleted {
            self.registered.remove(id);
            self.pending.remove(id);
        }

        let mut overridden = 0usize;
        for (id, keys) in &changes.touched {
            let Some(committed) = changes.updated.get(id) else {
                continue;
            };

            if let Some(record) = self.registered.get_mut(id) {
                record.kind = committed.kind.clone();
                for key in keys {
                    match committed.properties.get(key) {
                        Some(value) => {
                            record.properties.insert(key.clone(), value.clone());
                        }
                        None => {
                            record.properties.remove(key);
                        }
                    }
                }
            }

            let drop_entry = match self.pending.get_mut(id) {
                Some(PendingChange::Upsert { kind, properties }) => {
                    let before = properties.len();
                    properties.retain(|key, _| !keys.contains(key));
                    overridden += before - properties.len();
                    kind.is_none() && properties.is_empty()
                }
                Some(PendingChange::Delete) => {
                    overridden += 1;
                    true
                }
                None => false,
            };
            if drop_entry {
                self.pending.remove(id);
            }
        }

        tracing::trace!(
            target: "raidbook.storage",
            context = ?self.kind,
            entities = changes.entity_count(),
            overridden,
            "merged change-set"
        );
    }
}

/// Handle to a context's executor
///
/// Dropping the handle lets queued work finish, then stops the executor.
pub struct PersistenceContext {
    kind: ContextKind,
    sender: Option<Sender<ContextJob>>,
    worker: Option<JoinHandle<()>>,
}

impl PersistenceContext {
    pub(crate) fn spawn(kind: ContextKind, label: &str, store: Arc<StoreShared>) -> StoreResult<Self> {
        let (sender, receiver) = mpsc::channel::<ContextJob>();
        let mut scope = ContextScope {
            kind,
            store,
            registered: HashMap::new(),
            pending: BTreeMap::new(),
        };

        let worker = thread::Builder::new()
            .name(format!("raidbook-store-{label}"))
            .spawn(move || {
                for job in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(|| job(&mut scope))).is_err() {
                        tracing::warn!(
                            target: "raidbook.storage",
                            context = ?scope.kind,
                            "work submitted to context panicked"
                        );
                    }
                }
            })?;

        Ok(Self { kind, sender: Some(sender), worker: Some(worker) })
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn job_sender(&self) -> Option<Sender<ContextJob>> {
        self.sender.clone()
    }

    fn executor_thread(&self) -> Option<ThreadId> {
        self.worker.as_ref().map(|worker| worker.thread().id())
    }

    fn submit(&self, job: ContextJob) -> StoreResult<()> {
        let sender = self.sender.as_ref().ok_or(StoreError::ContextClosed)?;
        sender.send(job).map_err(|_| StoreError::ContextClosed)
    }

    /// Run `work` on the context's executor and wait for its result
    ///
    /// Must not be called from work already running on this same context.
    pub fn perform<R, F>(&self, work: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ContextScope) -> R + Send + 'static,
    {
        if self.executor_thread() == Some(thread::current().id()) {
            tracing::warn!(
                target: "raidbook.storage",
                context = ?self.kind,
                "nested perform on the same context refused"
            );
            return Err(StoreError::ContextClosed);
        }

        let (reply, result) = mpsc::sync_channel(1);
        self.submit(Box::new(move |scope: &mut ContextScope| {
            let _ = reply.send(work(scope));
        }))?;
        result.recv().map_err(|_| StoreError::ContextClosed)
    }

    /// Queue `work` on the context's executor without waiting
    pub fn perform_async<F>(&self, work: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ContextScope) + Send + 'static,
    {
        self.submit(Box::new(work))
    }

    /// Commit staged changes on the context's own executor
    ///
    /// Background saves also queue a merge into the UI context before
    /// returning, so UI work submitted afterwards observes the saved values.
    pub fn save(&self) -> StoreResult<SaveOutcome> {
        self.perform(|scope| scope.save())?
    }
}

impl Drop for PersistenceContext {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
