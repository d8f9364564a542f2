//! Attaching children to parents.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ExecutionError, UnifyError, ValidationError};
use crate::lock::LockCoordinator;
use crate::profile::{ChildProfile, Profile};
use crate::retry::CallContext;
use crate::storage::ProfileStore;

/// Links a child profile under a parent, holding both profiles' locks.
#[derive(Clone)]
pub struct HierarchyLinker {
    profiles: Arc<dyn ProfileStore>,
    locks: LockCoordinator,
}

impl fmt::Debug for HierarchyLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyLinker")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl HierarchyLinker {
    /// Creates a linker.
    pub fn new(profiles: Arc<dyn ProfileStore>, locks: LockCoordinator) -> Self {
        Self { profiles, locks }
    }

    /// Makes `child_id` a child of `parent_id`, recording `rule_name` as the
    /// unification rule that linked them.
    ///
    /// Linking a child to the parent it already has is a no-op.
    ///
    /// # Errors
    /// - `InvalidHierarchy` if the parent is itself a child, the child
    ///   belongs to another parent or has children of its own, or both ids
    ///   are equal
    /// - `ProfileNotFound` if either row is missing
    /// - lock and storage failures as execution errors
    pub fn attach_child(
        &self,
        parent_id: &str,
        child_id: &str,
        rule_name: &str,
        ctx: &CallContext,
    ) -> Result<(), UnifyError> {
        if parent_id.is_empty() || child_id.is_empty() {
            return Err(ValidationError::EmptyProfileId.into());
        }
        if parent_id == child_id {
            return Err(invalid(format!("profile {parent_id} cannot be its own child")));
        }

        // Both shapes are checked only after both locks are held.
        let leases = self.locks.acquire_all(&[parent_id, child_id], ctx)?;

        let parent = self.fetch(parent_id)?;
        if !parent.is_parent() {
            return Err(invalid(format!("profile {parent_id} is a child and cannot adopt")));
        }

        let child = self.fetch(child_id)?;
        match child.parent_id() {
            Some(existing) if existing == parent_id => {
                debug!(parent_id, child_id, "child already linked");
                return Ok(());
            }
            Some(existing) => {
                return Err(invalid(format!(
                    "profile {child_id} already belongs to {existing}"
                )));
            }
            None => {}
        }

        let grandchildren = self
            .profiles
            .fetch_child_profiles(child_id)
            .map_err(|e| ExecutionError::storage("fetch_child_profiles", child_id, e))?;
        if !grandchildren.is_empty() {
            return Err(invalid(format!(
                "profile {child_id} has {} children of its own",
                grandchildren.len()
            )));
        }

        self.profiles
            .attach_child_profile(parent_id, ChildProfile::new(child_id, rule_name))
            .map_err(|e| ExecutionError::storage("attach_child_profile", parent_id, e))?;
        info!(parent_id, child_id, rule_name, "child profile linked");

        drop(leases);
        Ok(())
    }

    fn fetch(&self, profile_id: &str) -> Result<Profile, ExecutionError> {
        self.profiles
            .get_profile(profile_id)
            .map_err(|e| ExecutionError::storage("get_profile", profile_id, e))?
            .ok_or_else(|| ExecutionError::not_found(profile_id))
    }
}

fn invalid(reason: String) -> UnifyError {
    ValidationError::InvalidHierarchy { reason }.into()
}
