//! Merged read views.
//!
//! Reads of a child profile are served from its parent: the caller gets the
//! parent's data under the id it asked for.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::filter::translate;
use crate::profile::Profile;
use crate::schema::PropertyTypes;
use crate::storage::{ProfileStore, SchemaStore, StorageError};

/// Resolves stored rows into the views callers see.
#[derive(Clone)]
pub struct HierarchyMerger {
    profiles: Arc<dyn ProfileStore>,
    schema: Arc<dyn SchemaStore>,
}

impl fmt::Debug for HierarchyMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyMerger").finish_non_exhaustive()
    }
}

impl HierarchyMerger {
    /// Creates a merger over the given stores.
    pub fn new(profiles: Arc<dyn ProfileStore>, schema: Arc<dyn SchemaStore>) -> Self {
        Self { profiles, schema }
    }

    /// Returns the profile as a caller sees it.
    ///
    /// A parent is returned unchanged. A child is replaced by its parent's
    /// traits, identity attributes, application data and hierarchy, with
    /// `profile_id` kept as requested and `parent_profile_id` naming the
    /// parent.
    ///
    /// # Errors
    /// - `ProfileNotFound` if no row exists
    /// - `Storage` if a read fails or the child's parent row is missing
    pub fn resolve(&self, profile_id: &str) -> Result<Profile, ExecutionError> {
        let row = self
            .profiles
            .get_profile(profile_id)
            .map_err(|e| ExecutionError::storage("get_profile", profile_id, e))?
            .ok_or_else(|| ExecutionError::not_found(profile_id))?;
        self.present(row)
    }

    /// Every listed profile, children presented through their parents.
    ///
    /// # Errors
    /// Returns `Storage` if the listing fails.
    pub fn resolve_all(&self) -> Result<Vec<Profile>, ExecutionError> {
        let rows = self
            .profiles
            .get_all_profiles()
            .map_err(|e| ExecutionError::storage("get_all_profiles", "*", e))?;
        Ok(self.present_all(rows))
    }

    /// Listed profiles matching every `field operator value` filter.
    ///
    /// Values are typed with the kinds declared by the enrichment rules.
    /// Malformed filter expressions are ignored.
    ///
    /// # Errors
    /// Returns `Storage` if the rules cannot be read or the store rejects a
    /// predicate.
    pub fn resolve_all_filtered<S: AsRef<str>>(
        &self,
        filters: &[S],
    ) -> Result<Vec<Profile>, ExecutionError> {
        let rules = self
            .schema
            .get_profile_enrichment_rules()
            .map_err(|e| ExecutionError::storage("get_profile_enrichment_rules", "*", e))?;
        let types = PropertyTypes::from_rules(&rules);
        let predicates = translate(filters, &types);
        debug!(predicates = predicates.len(), "filtering profiles");

        let rows = self
            .profiles
            .get_all_profiles_with_filter(&predicates)
            .map_err(|e| ExecutionError::storage("get_all_profiles_with_filter", "*", e))?;
        Ok(self.present_all(rows))
    }

    fn present_all(&self, rows: Vec<Profile>) -> Vec<Profile> {
        rows.into_iter()
            .filter_map(|row| {
                let profile_id = row.profile_id.clone();
                match self.present(row) {
                    Ok(view) => Some(view),
                    Err(e) => {
                        warn!(profile_id = %profile_id, error = %e, "skipping unresolvable profile");
                        None
                    }
                }
            })
            .collect()
    }

    fn present(&self, row: Profile) -> Result<Profile, ExecutionError> {
        let Some(parent_id) = row.parent_id().map(str::to_owned) else {
            return Ok(row);
        };
        let requested = row.profile_id;

        let mut master = self
            .profiles
            .get_profile(&parent_id)
            .map_err(|e| ExecutionError::storage("get_parent_profile", &requested, e))?
            .ok_or_else(|| {
                ExecutionError::storage(
                    "get_parent_profile",
                    &requested,
                    StorageError::ProfileNotFound(parent_id.clone()),
                )
            })?;

        master.application_data = self
            .profiles
            .fetch_application_data(&parent_id)
            .map_err(|e| ExecutionError::storage("fetch_application_data", &requested, e))?;
        master.hierarchy.child_profiles = self
            .profiles
            .fetch_child_profiles(&parent_id)
            .map_err(|e| ExecutionError::storage("fetch_child_profiles", &requested, e))?;
        master.hierarchy.parent_profile_id = parent_id;
        master.profile_id = requested;
        Ok(master)
    }
}
