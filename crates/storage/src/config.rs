use crate::record::{EntityId, EntityRecord};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MODEL_FINGERPRINT: &str = "raidbook.model.v1";

const STORE_FILE_NAME: &str = "raidbook-store.json";

pub type Records = BTreeMap<EntityId, EntityRecord>;

/// Rewrites the records of an older model into the current one
pub type Migration = Arc<dyn Fn(Records) -> Result<Records, String> + Send + Sync>;

/// The entity model a store must match
///
/// A store written under a different fingerprint is migrated when a migration
/// from that fingerprint is registered, and treated as incompatible otherwise.
#[derive(Clone)]
pub struct ModelDescriptor {
    fingerprint: String,
    migrations: HashMap<String, Migration>,
}

impl ModelDescriptor {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self { fingerprint: fingerprint.into(), migrations: HashMap::new() }
    }

    pub fn with_migration<F>(mut self, from: impl Into<String>, migrate: F) -> Self
    where
        F: Fn(Records) -> Result<Records, String> + Send + Sync + 'static,
    {
        self.migrations.insert(from.into(), Arc::new(migrate));
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn migration_from(&self, fingerprint: &str) -> Option<&Migration> {
        self.migrations.get(fingerprint)
    }
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_FINGERPRINT)
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut from: Vec<&String> = self.migrations.keys().collect();
        from.sort();
        f.debug_struct("ModelDescriptor")
            .field("fingerprint", &self.fingerprint)
            .field("migrations_from", &from)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store file location
    pub path: PathBuf,

    /// How long `open` waits for another owner to release the store
    pub open_timeout_ms: u64,

    #[serde(skip)]
    pub model: ModelDescriptor,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            open_timeout_ms: 2_000,
            model: ModelDescriptor::default(),
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.model = model;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Store file under the platform's local data directory
///
/// Falls back to the working directory when no home directory is known.
pub fn default_store_path() -> PathBuf {
    ProjectDirs::from("dev", "Raidbook", "Raidbook")
        .map(|dirs| dirs.data_local_dir().join(STORE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(STORE_FILE_NAME))
}
