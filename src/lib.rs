//! # profile-unify - Profile Resolution and Hierarchy Merge
//!
//! profile-unify turns identity events into canonical customer profiles and
//! merges related identities into parent/child hierarchies, so that several
//! observed identifiers read as one unified profile.
//!
//! ## Core Concepts
//!
//! - **Profile**: A canonical identity record, either a parent (master) or a child merged into one
//! - **Lease**: The held, per-profile lock under which a profile is created or updated
//! - **Merged view**: A child read through its parent's data under the child's own id
//! - **Cascade delete**: Deletion that keeps parent and child lists consistent
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use profile_unify::{CallContext, Event, InMemoryStores, ProfileService, UnifyConfig};
//!
//! let stores = InMemoryStores::new();
//! let service = ProfileService::new(
//!     Arc::new(stores.profiles),
//!     Arc::new(stores.events),
//!     Arc::new(stores.schema),
//!     Arc::new(stores.locks),
//!     &UnifyConfig::default(),
//! );
//!
//! let profile = service.ingest_event(Event::new("user-42", "identify"), &CallContext::background())?;
//! assert_eq!(profile.profile_id, "user-42");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod filter;
pub mod profile;
pub mod schema;
pub mod update;

// Storage collaborators
pub mod storage;

// Coordination
pub mod lock;
pub mod retry;
pub mod visibility;

// Resolution and hierarchy
pub mod hierarchy;
pub mod resolver;
pub mod service;

// Ambient
pub mod config;
pub mod telemetry;

// Re-export primary types at crate root for convenience
pub use config::{LoggingConfig, UnifyConfig};
pub use error::{ExecutionError, UnifyError, UnifyResult, ValidationError};
pub use filter::{translate, FilterOperator, FilterValue, TypedPredicate};
pub use hierarchy::{CascadeDeleter, DeletionPlan, HierarchyLinker, HierarchyMerger};
pub use lock::{LockCoordinator, ProfileLease};
pub use profile::{ApplicationData, AttributeMap, ChildProfile, Event, Profile, ProfileHierarchy};
pub use resolver::ProfileResolver;
pub use retry::{CallContext, CancellationToken, RetryPolicy, MAX_RETRY_ATTEMPTS, RETRY_DELAY};
pub use schema::{EnrichmentRule, PropertyTypes, ValueKind};
pub use service::ProfileService;
pub use storage::{
    EventStore, InMemoryEventStore, InMemoryLockBackend, InMemoryProfileStore,
    InMemorySchemaStore, InMemoryStores, LockBackend, LockKey, LockSession, ProfileStore,
    SchemaStore, StorageError,
};
pub use telemetry::init_tracing;
pub use update::{ProfileUpdate, ValidatedUpdate};
pub use visibility::VisibilityWaiter;

#[cfg(feature = "file-lock")]
pub use storage::FileLockBackend;
