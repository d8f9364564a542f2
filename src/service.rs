//! Profile service facade.
//!
//! Bundles the resolver, the hierarchy components and the event store
//! behind the operations callers use. Collaborators are injected at
//! construction; the service keeps no other state.

use std::fmt;
use std::sync::Arc;

use tracing::{error, instrument, warn};

use crate::config::UnifyConfig;
use crate::error::{ExecutionError, UnifyError, UnifyResult, ValidationError};
use crate::hierarchy::{CascadeDeleter, DeletionPlan, HierarchyLinker, HierarchyMerger};
use crate::lock::LockCoordinator;
use crate::profile::{Event, Profile};
use crate::resolver::ProfileResolver;
use crate::retry::CallContext;
use crate::storage::{EventStore, LockBackend, ProfileStore, SchemaStore};
use crate::update::ProfileUpdate;

/// Entry points for profile ingestion, reads, updates and deletion.
#[derive(Clone)]
pub struct ProfileService {
    events: Arc<dyn EventStore>,
    resolver: ProfileResolver,
    merger: HierarchyMerger,
    linker: HierarchyLinker,
    deleter: CascadeDeleter,
}

impl fmt::Debug for ProfileService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileService")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl ProfileService {
    /// Create a new service over the given collaborators.
    #[must_use]
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventStore>,
        schema: Arc<dyn SchemaStore>,
        locks: Arc<dyn LockBackend>,
        config: &UnifyConfig,
    ) -> Self {
        let coordinator = LockCoordinator::new(locks, config.lock_retry.clone());
        Self {
            resolver: ProfileResolver::new(
                Arc::clone(&profiles),
                Arc::clone(&schema),
                coordinator.clone(),
                config.visibility_retry.clone(),
            ),
            merger: HierarchyMerger::new(Arc::clone(&profiles), schema),
            linker: HierarchyLinker::new(Arc::clone(&profiles), coordinator.clone()),
            deleter: CascadeDeleter::new(profiles, Arc::clone(&events), coordinator),
            events,
        }
    }

    /// Ensures the event's profile exists and returns it.
    ///
    /// # Errors
    /// See [`ProfileResolver::create_or_update`].
    #[instrument(skip(self, event, ctx), fields(profile_id = %event.profile_id))]
    pub fn create_or_update_profile(&self, event: &Event, ctx: &CallContext) -> UnifyResult<Profile> {
        logged("create_or_update_profile", self.resolver.create_or_update(event, ctx))
    }

    /// Ensures the event's profile exists, then records the event.
    ///
    /// # Errors
    /// Fails like [`create_or_update_profile`](Self::create_or_update_profile);
    /// the event is only stored once its profile is readable.
    #[instrument(skip(self, event, ctx), fields(profile_id = %event.profile_id, event_type = %event.event_type))]
    pub fn ingest_event(&self, event: Event, ctx: &CallContext) -> UnifyResult<Profile> {
        let profile = logged("ingest_event", self.resolver.create_or_update(&event, ctx))?;
        let profile_id = event.profile_id.clone();
        let stored = self
            .events
            .insert_event(event)
            .map_err(|e| UnifyError::from(ExecutionError::storage("insert_event", profile_id, e)));
        logged("ingest_event", stored)?;
        Ok(profile)
    }

    /// Returns the profile as callers see it.
    ///
    /// # Errors
    /// See [`HierarchyMerger::resolve`].
    #[instrument(skip(self))]
    pub fn get_profile(&self, profile_id: &str) -> UnifyResult<Profile> {
        if profile_id.is_empty() {
            return Err(ValidationError::EmptyProfileId.into());
        }
        logged("get_profile", self.merger.resolve(profile_id).map_err(Into::into))
    }

    /// Every listed profile.
    ///
    /// # Errors
    /// See [`HierarchyMerger::resolve_all`].
    #[instrument(skip(self))]
    pub fn get_all_profiles(&self) -> UnifyResult<Vec<Profile>> {
        logged("get_all_profiles", self.merger.resolve_all().map_err(Into::into))
    }

    /// Listed profiles matching every `field operator value` filter.
    ///
    /// # Errors
    /// See [`HierarchyMerger::resolve_all_filtered`].
    #[instrument(skip(self, filters), fields(filters = filters.len()))]
    pub fn get_all_profiles_with_filter<S: AsRef<str>>(&self, filters: &[S]) -> UnifyResult<Vec<Profile>> {
        logged(
            "get_all_profiles_with_filter",
            self.merger.resolve_all_filtered(filters).map_err(Into::into),
        )
    }

    /// Applies a typed update.
    ///
    /// # Errors
    /// See [`ProfileResolver::update_profile`].
    #[instrument(skip(self, update, ctx))]
    pub fn update_profile(
        &self,
        profile_id: &str,
        update: ProfileUpdate,
        ctx: &CallContext,
    ) -> UnifyResult<Profile> {
        logged("update_profile", self.resolver.update_profile(profile_id, update, ctx))
    }

    /// Makes `child_id` a child of `parent_id`.
    ///
    /// # Errors
    /// See [`HierarchyLinker::attach_child`].
    #[instrument(skip(self, ctx))]
    pub fn link_profiles(
        &self,
        parent_id: &str,
        child_id: &str,
        rule_name: &str,
        ctx: &CallContext,
    ) -> UnifyResult<()> {
        logged(
            "link_profiles",
            self.linker.attach_child(parent_id, child_id, rule_name, ctx),
        )
    }

    /// Deletes a profile and whatever its hierarchy requires. Unknown ids
    /// succeed.
    ///
    /// # Errors
    /// See [`CascadeDeleter::delete`].
    #[instrument(skip(self, ctx))]
    pub fn delete_profile(&self, profile_id: &str, ctx: &CallContext) -> UnifyResult<DeletionPlan> {
        if profile_id.is_empty() {
            return Err(ValidationError::EmptyProfileId.into());
        }
        logged("delete_profile", self.deleter.delete(profile_id, ctx).map_err(Into::into))
    }

    /// Events recorded for `profile_id`, oldest first.
    ///
    /// # Errors
    /// Returns a storage error if the event store fails.
    pub fn events_for_profile(&self, profile_id: &str) -> UnifyResult<Vec<Event>> {
        self.events
            .events_for_profile(profile_id)
            .map_err(|e| ExecutionError::storage("events_for_profile", profile_id, e).into())
    }
}

fn logged<T>(operation: &'static str, result: UnifyResult<T>) -> UnifyResult<T> {
    if let Err(e) = &result {
        if e.is_client_error() {
            warn!(operation, code = e.error_code(), error = %e, "request rejected");
        } else {
            error!(operation, code = e.error_code(), error = %e, "request failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::InMemoryStores;

    fn service() -> ProfileService {
        let stores = InMemoryStores::new();
        ProfileService::new(
            Arc::new(stores.profiles),
            Arc::new(stores.events),
            Arc::new(stores.schema),
            Arc::new(stores.locks),
            &UnifyConfig::default(),
        )
    }

    #[test]
    fn ingest_creates_profile_and_records_event() {
        let svc = service();
        let ctx = CallContext::background();
        let profile = svc.ingest_event(Event::new("p-1", "identify"), &ctx).unwrap();
        assert_eq!(profile.profile_id, "p-1");
        svc.ingest_event(Event::new("p-1", "track"), &ctx).unwrap();
        assert_eq!(svc.events_for_profile("p-1").unwrap().len(), 2);
    }

    #[test]
    fn delete_removes_events() {
        let svc = service();
        let ctx = CallContext::background();
        svc.ingest_event(Event::new("p-1", "track"), &ctx).unwrap();
        let plan = svc.delete_profile("p-1", &ctx).unwrap();
        assert_eq!(plan, DeletionPlan::SoloParent { profile_id: "p-1".into() });
        assert!(svc.events_for_profile("p-1").unwrap().is_empty());
        assert!(svc.get_profile("p-1").unwrap_err().is_not_found());
    }

    #[test]
    fn empty_ids_are_rejected() {
        let svc = service();
        assert!(svc.get_profile("").unwrap_err().is_validation());
        assert!(svc.delete_profile("", &CallContext::background()).unwrap_err().is_validation());
    }
}
