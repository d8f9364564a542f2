//! Abstract storage traits for profile-unify.
//!
//! These traits define the contract that collaborators must implement.
//! The core never reaches storage through global state: every component
//! receives the stores it needs at construction time.
//!
//! Read-after-write visibility is not assumed. A profile written through
//! [`ProfileStore::insert_profile`] may take some time to show up in
//! [`ProfileStore::get_profile`].

use std::fmt;

use thiserror::Error;

use crate::filter::TypedPredicate;
use crate::profile::{ApplicationData, ChildProfile, Event, Profile};
use crate::schema::EnrichmentRule;
use crate::update::ValidatedUpdate;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Profile not found where one was required.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// A filter could not be evaluated.
    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter {
        /// The predicate as rendered for storage.
        filter: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A write would leave a parent and child disagreeing about each other.
    #[error("Hierarchy conflict for profile {profile_id}: {reason}")]
    HierarchyConflict {
        /// Profile the write was refused for.
        profile_id: String,
        /// What the stored rows already say.
        reason: String,
    },

    /// Lock key is not representable by the backend.
    #[error("Invalid lock key '{key}': {reason}")]
    InvalidLockKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection or session failure.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// I/O failure in a file-backed collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name of an exclusive lock. One key per profile identifier.
///
/// The key space is the profile identifier itself, so distinct profiles can
/// never share a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(String);

impl LockKey {
    /// Key guarding `profile_id`.
    pub fn for_profile(profile_id: impl Into<String>) -> Self {
        Self(profile_id.into())
    }

    /// The profile identifier behind this key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive session with the lock backend.
///
/// Locks belong to the session that took them. Dropping the session
/// releases whatever it still holds, so a crashed owner cannot leave a lock
/// behind.
pub trait LockSession: Send {
    /// Tries to take `key` without blocking. Returns `false` if another
    /// session holds it. Re-acquiring a key this session already holds
    /// succeeds.
    fn try_acquire(&mut self, key: &LockKey) -> Result<bool, StorageError>;

    /// Releases `key`. Returns `false` if this session did not hold it.
    fn release(&mut self, key: &LockKey) -> Result<bool, StorageError>;
}

/// Source of lock sessions.
pub trait LockBackend: Send + Sync {
    /// Opens a fresh session. Each call returns an independent session.
    fn open_session(&self) -> Result<Box<dyn LockSession>, StorageError>;
}

/// Storage trait for profile rows and their hierarchy relations.
///
/// # Safety Considerations
/// - All mutations should be atomic where possible
/// - Implementations must handle concurrent access safely
pub trait ProfileStore: Send + Sync {
    /// Inserts `profile` unless a row with the same id exists. An existing
    /// row is left untouched.
    fn insert_profile(&self, profile: Profile) -> Result<(), StorageError>;

    /// Fetches a profile row.
    fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>, StorageError>;

    /// Children of `parent_id`, in attachment order.
    fn fetch_child_profiles(&self, parent_id: &str) -> Result<Vec<ChildProfile>, StorageError>;

    /// Application data owned by `profile_id`.
    fn fetch_application_data(&self, profile_id: &str) -> Result<Vec<ApplicationData>, StorageError>;

    /// Deletes a profile row. Deleting a missing row succeeds.
    fn delete_profile(&self, profile_id: &str) -> Result<(), StorageError>;

    /// Removes `child_id` from the child list of `parent_id`.
    fn detach_child_profile_from_parent(&self, parent_id: &str, child_id: &str)
        -> Result<(), StorageError>;

    /// Records `child` under `parent_id` and marks the child row as merged
    /// into that parent. Refuses with `HierarchyConflict` a child that
    /// already belongs to a different parent.
    fn attach_child_profile(&self, parent_id: &str, child: ChildProfile) -> Result<(), StorageError>;

    /// Every listed profile row.
    fn get_all_profiles(&self) -> Result<Vec<Profile>, StorageError>;

    /// Every listed profile row matching all `predicates`.
    fn get_all_profiles_with_filter(
        &self,
        predicates: &[TypedPredicate],
    ) -> Result<Vec<Profile>, StorageError>;

    /// Applies a validated update to the traits of `profile_id`.
    fn update_traits(&self, profile_id: &str, update: &ValidatedUpdate) -> Result<(), StorageError>;

    /// Applies a validated update to the identity attributes of
    /// `profile_id`.
    fn update_identity_attributes(
        &self,
        profile_id: &str,
        update: &ValidatedUpdate,
    ) -> Result<(), StorageError>;
}

/// Storage trait for events.
pub trait EventStore: Send + Sync {
    /// Stores an event.
    fn insert_event(&self, event: Event) -> Result<(), StorageError>;

    /// Events recorded for `profile_id`, oldest first.
    fn events_for_profile(&self, profile_id: &str) -> Result<Vec<Event>, StorageError>;

    /// Deletes every event of `profile_id`. Returns how many were removed.
    fn delete_events_by_profile_id(&self, profile_id: &str) -> Result<usize, StorageError>;
}

/// Read access to the profile schema.
pub trait SchemaStore: Send + Sync {
    /// Enrichment rules declaring the typed profile properties.
    fn get_profile_enrichment_rules(&self) -> Result<Vec<EnrichmentRule>, StorageError>;
}
