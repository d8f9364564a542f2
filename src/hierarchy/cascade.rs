//! Hierarchy-aware profile deletion.
//!
//! Deleting a profile must never leave a parent without children that
//! still thinks it has them, or a child pointing at a missing parent.
//! [`DeletionPlan::classify`] decides what to remove from a snapshot of the
//! profile and its family; [`CascadeDeleter`] carries the plan out.
//!
//! | Target | Family | Plan |
//! |---|---|---|
//! | parent | no children | delete the parent |
//! | parent | children | delete every child, then the parent |
//! | child | parent has only this child | delete parent and child |
//! | child | parent has other children | detach, then delete the child |
//! | child | parent row missing | delete the child |
//!
//! Every row deletion first removes the events recorded for that id.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::ExecutionError;
use crate::lock::LockCoordinator;
use crate::profile::{ChildProfile, Profile};
use crate::retry::CallContext;
use crate::storage::{EventStore, ProfileStore};

/// What deleting one profile involves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionPlan {
    /// Nothing stored under the id.
    Absent,
    /// A parent without children.
    SoloParent {
        /// Profile to delete.
        profile_id: String,
    },
    /// A parent and all of its children.
    ParentWithChildren {
        /// Parent to delete last.
        profile_id: String,
        /// Children to delete first.
        children: Vec<String>,
    },
    /// The only child of a parent: the whole group goes.
    OnlyChild {
        /// Child to delete.
        profile_id: String,
        /// Parent to delete.
        parent_id: String,
    },
    /// One of several children: detached, the group stays.
    ChildWithSiblings {
        /// Child to detach and delete.
        profile_id: String,
        /// Parent that keeps its other children.
        parent_id: String,
    },
    /// A child whose parent row no longer exists.
    Orphan {
        /// Child to delete.
        profile_id: String,
    },
}

impl DeletionPlan {
    /// Classifies the deletion of `profile`.
    ///
    /// `family` is the child list of the group's master: the profile's own
    /// children for a parent, its parent's children for a child, and `None`
    /// when the parent row of a child is missing.
    #[must_use]
    pub fn classify(profile: Option<&Profile>, family: Option<&[ChildProfile]>) -> Self {
        let Some(profile) = profile else {
            return Self::Absent;
        };
        let profile_id = profile.profile_id.clone();

        let Some(parent_id) = profile.parent_id() else {
            let children: Vec<String> = family
                .unwrap_or_default()
                .iter()
                .map(|c| c.child_profile_id.clone())
                .collect();
            return if children.is_empty() {
                Self::SoloParent { profile_id }
            } else {
                Self::ParentWithChildren {
                    profile_id,
                    children,
                }
            };
        };

        let parent_id = parent_id.to_string();
        match family {
            None => Self::Orphan { profile_id },
            Some([only]) if only.child_profile_id == profile_id => Self::OnlyChild {
                profile_id,
                parent_id,
            },
            Some(_) => Self::ChildWithSiblings {
                profile_id,
                parent_id,
            },
        }
    }

    /// Ids whose rows the plan deletes, in deletion order.
    #[must_use]
    pub fn doomed(&self) -> Vec<&str> {
        match self {
            Self::Absent => Vec::new(),
            Self::SoloParent { profile_id }
            | Self::ChildWithSiblings { profile_id, .. }
            | Self::Orphan { profile_id } => vec![profile_id.as_str()],
            Self::ParentWithChildren {
                profile_id,
                children,
            } => children
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(profile_id.as_str()))
                .collect(),
            Self::OnlyChild {
                profile_id,
                parent_id,
            } => vec![parent_id.as_str(), profile_id.as_str()],
        }
    }
}

/// Times `delete` re-reads a profile whose group changed while its locks
/// were being taken.
const MAX_REPLANS: u32 = 3;

/// Executes [`DeletionPlan`]s against the stores.
///
/// A deletion holds the locks of the target and of its group's master, the
/// same locks linking takes, so the family cannot change between planning
/// and the last row removal.
#[derive(Clone)]
pub struct CascadeDeleter {
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn EventStore>,
    locks: LockCoordinator,
}

impl fmt::Debug for CascadeDeleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeDeleter")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl CascadeDeleter {
    /// Creates a deleter.
    pub fn new(profiles: Arc<dyn ProfileStore>, events: Arc<dyn EventStore>, locks: LockCoordinator) -> Self {
        Self {
            profiles,
            events,
            locks,
        }
    }

    /// Reads the profile and its family and classifies the deletion.
    ///
    /// No locks are taken; the result is a snapshot.
    ///
    /// # Errors
    /// Returns `Storage` if a read fails.
    pub fn plan(&self, profile_id: &str) -> Result<DeletionPlan, ExecutionError> {
        let profile = self.read(profile_id)?;
        self.plan_for(profile_id, profile.as_ref())
    }

    /// Deletes `profile_id` and whatever the hierarchy requires along with
    /// it. Deleting an unknown id succeeds without touching storage.
    ///
    /// # Errors
    /// - lock failures from [`LockCoordinator::acquire_all`]
    /// - `LockAcquisition` if the profile kept moving between groups
    /// - `Storage` on the first failed read or write. Rows already removed
    ///   stay removed; repeating the call finishes the job.
    pub fn delete(&self, profile_id: &str, ctx: &CallContext) -> Result<DeletionPlan, ExecutionError> {
        let mut snapshot = self.read(profile_id)?;
        for _ in 0..MAX_REPLANS {
            let Some(profile) = snapshot else {
                info!(profile_id, "profile requested for deletion not found");
                return Ok(DeletionPlan::Absent);
            };
            let master = group_master(&profile).to_string();
            let leases = self.locks.acquire_all(&[profile_id, master.as_str()], ctx)?;

            let current = self.read(profile_id)?;
            if let Some(moved_to) = current.as_ref().map(group_master).filter(|m| *m != master.as_str()) {
                debug!(profile_id, %master, %moved_to, "group changed before lock, replanning");
                drop(leases);
                snapshot = current;
                continue;
            }

            let plan = self.plan_for(profile_id, current.as_ref())?;
            self.execute(&plan)?;
            drop(leases);
            return Ok(plan);
        }
        Err(ExecutionError::LockAcquisition {
            profile_id: profile_id.to_string(),
            attempts: MAX_REPLANS,
        })
    }

    fn plan_for(&self, profile_id: &str, profile: Option<&Profile>) -> Result<DeletionPlan, ExecutionError> {
        let Some(profile) = profile else {
            return Ok(DeletionPlan::Absent);
        };
        let family = match profile.parent_id() {
            None => Some(self.children_of(profile_id, profile_id)?),
            Some(parent_id) => match self.read(parent_id)? {
                Some(_) => Some(self.children_of(parent_id, profile_id)?),
                None => None,
            },
        };
        Ok(DeletionPlan::classify(Some(profile), family.as_deref()))
    }

    fn execute(&self, plan: &DeletionPlan) -> Result<(), ExecutionError> {
        match plan {
            DeletionPlan::Absent => {
                info!("profile requested for deletion not found");
                return Ok(());
            }
            DeletionPlan::SoloParent { profile_id } | DeletionPlan::Orphan { profile_id } => {
                self.delete_row(profile_id)?;
            }
            DeletionPlan::ParentWithChildren {
                profile_id,
                children,
            } => {
                for child_id in children {
                    if self.read(child_id)?.is_none() {
                        debug!(parent_id = %profile_id, child_id = %child_id, "child already deleted");
                        continue;
                    }
                    self.delete_row(child_id)?;
                }
                self.delete_row(profile_id)?;
            }
            DeletionPlan::OnlyChild {
                profile_id,
                parent_id,
            } => {
                self.delete_row(parent_id)?;
                self.delete_row(profile_id)?;
            }
            DeletionPlan::ChildWithSiblings {
                profile_id,
                parent_id,
            } => {
                self.profiles
                    .detach_child_profile_from_parent(parent_id, profile_id)
                    .map_err(|e| {
                        ExecutionError::storage("detach_child_profile_from_parent", profile_id, e)
                    })?;
                self.delete_row(profile_id)?;
            }
        }
        info!(deleted = ?plan.doomed(), "profile deleted");
        Ok(())
    }

    fn read(&self, profile_id: &str) -> Result<Option<Profile>, ExecutionError> {
        self.profiles
            .get_profile(profile_id)
            .map_err(|e| ExecutionError::storage("get_profile", profile_id, e))
    }

    fn children_of(&self, parent_id: &str, requested: &str) -> Result<Vec<ChildProfile>, ExecutionError> {
        self.profiles
            .fetch_child_profiles(parent_id)
            .map_err(|e| ExecutionError::storage("fetch_child_profiles", requested, e))
    }

    fn delete_row(&self, profile_id: &str) -> Result<(), ExecutionError> {
        let removed = self
            .events
            .delete_events_by_profile_id(profile_id)
            .map_err(|e| ExecutionError::storage("delete_events_by_profile_id", profile_id, e))?;
        self.profiles
            .delete_profile(profile_id)
            .map_err(|e| ExecutionError::storage("delete_profile", profile_id, e))?;
        debug!(profile_id, events = removed, "profile row deleted");
        Ok(())
    }
}

/// Id whose lock guards the group `profile` belongs to.
fn group_master(profile: &Profile) -> &str {
    profile.parent_id().unwrap_or(&profile.profile_id)
}
