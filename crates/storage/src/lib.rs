//! Thread-confined persistence for raid content
//!
//! A [`PersistenceCoordinator`] owns one JSON store file. All access goes
//! through contexts: one long-lived UI context and any number of short-lived
//! background contexts. Each context runs its work on its own serial
//! executor, and background saves are merged into the UI context with the
//! committed values winning over stale or unsaved ones.

mod config;
mod context;
mod coordinator;
mod error;
mod file;
mod record;
mod store;

pub use config::{
    default_store_path, Migration, ModelDescriptor, Records, StoreConfig,
    DEFAULT_MODEL_FINGERPRINT,
};
pub use context::{ContextKind, ContextScope, PersistenceContext, SaveOutcome};
pub use coordinator::{OpenReport, PersistenceCoordinator, StoreHealth};
pub use error::{StoreError, StoreResult};
pub use file::{StoreMetadata, FORMAT_VERSION};
pub use record::{ChangeSet, EntityId, EntityRecord};
