//! Profile creation and updates under the profile lock.
//!
//! `create_or_update` is the only path that creates profile rows. It holds
//! the lock for the event's profile id across the insert and the visibility
//! wait, so concurrent events for one id create at most one row and every
//! caller gets the row back once it is readable.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ExecutionError, UnifyError, ValidationError};
use crate::hierarchy::HierarchyMerger;
use crate::lock::{LockCoordinator, ProfileLease};
use crate::profile::{Event, Profile};
use crate::retry::{CallContext, RetryPolicy};
use crate::schema::PropertyTypes;
use crate::storage::{ProfileStore, SchemaStore};
use crate::update::{ProfileUpdate, ValidatedUpdate};
use crate::visibility::VisibilityWaiter;

/// Creates and updates profiles.
#[derive(Clone)]
pub struct ProfileResolver {
    profiles: Arc<dyn ProfileStore>,
    schema: Arc<dyn SchemaStore>,
    locks: LockCoordinator,
    visibility: VisibilityWaiter,
    merger: HierarchyMerger,
}

impl fmt::Debug for ProfileResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileResolver")
            .field("locks", &self.locks)
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}

impl ProfileResolver {
    /// Creates a resolver. `visibility_policy` bounds the wait for a freshly
    /// written row.
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        schema: Arc<dyn SchemaStore>,
        locks: LockCoordinator,
        visibility_policy: RetryPolicy,
    ) -> Self {
        let visibility = VisibilityWaiter::new(Arc::clone(&profiles), visibility_policy);
        let merger = HierarchyMerger::new(Arc::clone(&profiles), Arc::clone(&schema));
        Self {
            profiles,
            schema,
            locks,
            visibility,
            merger,
        }
    }

    /// Ensures a profile exists for the event's profile id and returns the
    /// stored row.
    ///
    /// An existing row is returned as it is; nothing about it changes.
    ///
    /// # Errors
    /// - `EmptyProfileId` for an event without a profile id
    /// - `LockAcquisition` if the lock stayed busy; storage is not touched
    /// - `VisibilityTimeout` if the row never became readable
    /// - `Storage` if the insert fails
    /// - `Interrupted` if `ctx` stops the call
    pub fn create_or_update(&self, event: &Event, ctx: &CallContext) -> Result<Profile, UnifyError> {
        let profile_id = event.profile_id.as_str();
        if profile_id.is_empty() {
            return Err(ValidationError::EmptyProfileId.into());
        }

        let lease = self.locks.acquire(profile_id, ctx)?;
        let outcome = self.insert_and_confirm(profile_id, ctx);
        release(lease);
        outcome.map_err(Into::into)
    }

    fn insert_and_confirm(&self, profile_id: &str, ctx: &CallContext) -> Result<Profile, ExecutionError> {
        self.profiles
            .insert_profile(Profile::skeleton(profile_id))
            .map_err(|e| ExecutionError::storage("insert_profile", profile_id, e))?;
        debug!(profile_id, "profile skeleton upserted");
        self.visibility.wait_for(profile_id, ctx)
    }

    /// Applies a typed update and returns the addressed profile as callers
    /// see it.
    ///
    /// Traits always land on the master: updating a child writes its
    /// parent's traits. Identity attributes stay on the addressed row. The
    /// write runs under the master's lock.
    ///
    /// # Errors
    /// - validation errors for empty ids and for properties the enrichment
    ///   rules do not declare or type differently
    /// - `ProfileNotFound` if the profile does not exist
    /// - lock, storage and interruption errors as execution errors
    pub fn update_profile(
        &self,
        profile_id: &str,
        update: ProfileUpdate,
        ctx: &CallContext,
    ) -> Result<Profile, UnifyError> {
        if profile_id.is_empty() {
            return Err(ValidationError::EmptyProfileId.into());
        }

        let rules = self
            .schema
            .get_profile_enrichment_rules()
            .map_err(|e| ExecutionError::storage("get_profile_enrichment_rules", profile_id, e))?;
        let update = update.validate(&PropertyTypes::from_rules(&rules))?;

        let row = self
            .profiles
            .get_profile(profile_id)
            .map_err(|e| ExecutionError::storage("get_profile", profile_id, e))?
            .ok_or_else(|| ExecutionError::not_found(profile_id))?;
        let master_id = row.parent_id().unwrap_or(profile_id).to_owned();

        let lease = self.locks.acquire(&master_id, ctx)?;
        let written = self.write_update(profile_id, &master_id, &update);
        release(lease);
        written?;

        debug!(profile_id, master_id = %master_id, "profile updated");
        self.merger.resolve(profile_id).map_err(Into::into)
    }

    fn write_update(
        &self,
        profile_id: &str,
        master_id: &str,
        update: &ValidatedUpdate,
    ) -> Result<(), ExecutionError> {
        if !update.traits().is_empty() {
            self.profiles
                .update_traits(master_id, update)
                .map_err(|e| ExecutionError::storage("update_traits", profile_id, e))?;
        }
        if !update.identity_attributes().is_empty() {
            self.profiles
                .update_identity_attributes(profile_id, update)
                .map_err(|e| ExecutionError::storage("update_identity_attributes", profile_id, e))?;
        }
        Ok(())
    }
}

fn release(lease: ProfileLease) {
    let key = lease.key().clone();
    if let Err(e) = lease.release() {
        warn!(key = %key, error = %e, "failed to release profile lock");
    }
}
