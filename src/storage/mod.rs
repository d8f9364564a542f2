//! Storage collaborators for profile-unify.
//!
//! The traits define the abstract interface the core consumes. The
//! in-memory backend is the reference implementation; the `file-lock`
//! feature adds an OS-level named-lock backend.

mod memory;
mod traits;

#[cfg(feature = "file-lock")]
mod file_lock;

pub use memory::{
    InMemoryEventStore, InMemoryLockBackend, InMemoryProfileStore, InMemorySchemaStore,
    InMemoryStores,
};
pub use traits::{
    EventStore, LockBackend, LockKey, LockSession, ProfileStore, SchemaStore, StorageError,
};

#[cfg(feature = "file-lock")]
pub use file_lock::FileLockBackend;
