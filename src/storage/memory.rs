//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage
//! traits. It is intended for embedded usage, tests, and as a reference
//! implementation.
//!
//! The profile store can simulate a replica that lags behind writes: with a
//! visibility lag configured, a freshly inserted row only shows up in reads
//! once the lag has elapsed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::filter::{FilterOperator, TypedPredicate};
use crate::profile::{ApplicationData, ChildProfile, Event, Profile};
use crate::schema::EnrichmentRule;
use crate::storage::traits::{
    EventStore, LockBackend, LockKey, LockSession, ProfileStore, SchemaStore, StorageError,
};
use crate::update::{ValidatedUpdate, IDENTITY_ATTRIBUTES_PREFIX, TRAITS_PREFIX};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Clone)]
struct StoredProfile {
    profile: Profile,
    visible_at: Instant,
}

impl StoredProfile {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

#[derive(Debug, Default)]
struct ProfileState {
    rows: BTreeMap<String, StoredProfile>,
}

impl ProfileState {
    fn row_mut(&mut self, profile_id: &str) -> Result<&mut StoredProfile, StorageError> {
        self.rows
            .get_mut(profile_id)
            .ok_or_else(|| StorageError::ProfileNotFound(profile_id.to_string()))
    }

    /// Row whose data a listed row presents: the parent for children.
    fn master_of<'a>(&'a self, row: &'a Profile) -> Option<&'a Profile> {
        match row.parent_id() {
            None => Some(row),
            Some(parent_id) => self.rows.get(parent_id).map(|p| &p.profile),
        }
    }
}

fn lookup<'a>(profile: &'a Profile, field: &str) -> Option<&'a serde_json::Value> {
    if let Some(name) = field
        .strip_prefix(TRAITS_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        return profile.traits.get(name);
    }
    if let Some(name) = field
        .strip_prefix(IDENTITY_ATTRIBUTES_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        return profile.identity_attributes.get(name);
    }
    profile
        .traits
        .get(field)
        .or_else(|| profile.identity_attributes.get(field))
}

fn compile_predicates(
    predicates: &[TypedPredicate],
) -> Result<Vec<(FilterOperator, &TypedPredicate)>, StorageError> {
    predicates
        .iter()
        .map(|p| {
            FilterOperator::parse(&p.operator)
                .map(|op| (op, p))
                .ok_or_else(|| StorageError::InvalidFilter {
                    filter: p.to_string(),
                    reason: format!("unknown operator '{}'", p.operator),
                })
        })
        .collect()
}

/// Thread-safe in-memory profile store.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    state: RwLock<ProfileState>,
    visibility_lag: Duration,
    injected_read_failures: AtomicU32,
    inserts_applied: AtomicU64,
}

impl InMemoryProfileStore {
    /// Create a new empty store with immediate read-after-write visibility.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose inserted rows become readable only after `lag`.
    #[must_use]
    pub fn with_visibility_lag(lag: Duration) -> Self {
        Self {
            visibility_lag: lag,
            ..Self::default()
        }
    }

    /// Makes the next `count` calls to `get_profile` fail with a backend
    /// error.
    pub fn inject_read_failures(&self, count: u32) {
        self.injected_read_failures.store(count, Ordering::SeqCst);
    }

    /// Number of inserts that created a new row.
    #[must_use]
    pub fn inserts_applied(&self) -> u64 {
        self.inserts_applied.load(Ordering::SeqCst)
    }

    /// Number of stored rows, visible or not.
    pub fn row_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("profile.row_count"))?;
        Ok(state.rows.len())
    }

    /// Stores `profile` as-is and immediately visible, replacing any row
    /// with the same id. Intended for seeding fixtures.
    pub fn put_profile(&self, profile: Profile) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.put"))?;
        state.rows.insert(
            profile.profile_id.clone(),
            StoredProfile {
                profile,
                visible_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Appends application data to `profile_id`.
    pub fn add_application_data(
        &self,
        profile_id: &str,
        data: ApplicationData,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.add_app_data"))?;
        state.row_mut(profile_id)?.profile.application_data.push(data);
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn listed(&self, predicates: &[TypedPredicate]) -> Result<Vec<Profile>, StorageError> {
        let compiled = compile_predicates(predicates)?;
        let state = self.state.read().map_err(|_| lock_err("profile.list"))?;
        let now = Instant::now();

        let mut out = Vec::new();
        for row in state.rows.values() {
            if !row.is_visible(now) || !row.profile.hierarchy.list_profile {
                continue;
            }
            let matched = match state.master_of(&row.profile) {
                Some(master) => compiled.iter().all(|(op, p)| {
                    lookup(master, &p.field).is_some_and(|stored| op.matches(stored, &p.value))
                }),
                None => compiled.is_empty(),
            };
            if matched {
                out.push(row.profile.clone());
            }
        }
        Ok(out)
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn insert_profile(&self, profile: Profile) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.insert"))?;
        if state.rows.contains_key(&profile.profile_id) {
            debug!(profile_id = %profile.profile_id, "profile row exists; insert skipped");
            return Ok(());
        }
        state.rows.insert(
            profile.profile_id.clone(),
            StoredProfile {
                profile,
                visible_at: Instant::now() + self.visibility_lag,
            },
        );
        self.inserts_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>, StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::BackendError(format!(
                "injected read failure for {profile_id}"
            )));
        }
        let state = self.state.read().map_err(|_| lock_err("profile.get"))?;
        let now = Instant::now();
        Ok(state
            .rows
            .get(profile_id)
            .filter(|row| row.is_visible(now))
            .map(|row| row.profile.clone()))
    }

    fn fetch_child_profiles(&self, parent_id: &str) -> Result<Vec<ChildProfile>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("profile.children"))?;
        Ok(state
            .rows
            .get(parent_id)
            .map(|row| row.profile.hierarchy.child_profiles.clone())
            .unwrap_or_default())
    }

    fn fetch_application_data(&self, profile_id: &str) -> Result<Vec<ApplicationData>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("profile.app_data"))?;
        Ok(state
            .rows
            .get(profile_id)
            .map(|row| row.profile.application_data.clone())
            .unwrap_or_default())
    }

    fn delete_profile(&self, profile_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.delete"))?;
        state.rows.remove(profile_id);
        Ok(())
    }

    fn detach_child_profile_from_parent(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.detach"))?;
        let parent = state.row_mut(parent_id)?;
        parent
            .profile
            .hierarchy
            .child_profiles
            .retain(|c| c.child_profile_id != child_id);
        Ok(())
    }

    fn attach_child_profile(&self, parent_id: &str, child: ChildProfile) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.attach"))?;
        if !state.rows.contains_key(parent_id) {
            return Err(StorageError::ProfileNotFound(parent_id.to_string()));
        }

        let child_row = state.row_mut(&child.child_profile_id)?;
        if let Some(existing) = child_row.profile.parent_id() {
            if existing != parent_id {
                return Err(StorageError::HierarchyConflict {
                    profile_id: child.child_profile_id,
                    reason: format!("already a child of {existing}"),
                });
            }
        }
        child_row.profile.hierarchy.is_parent = false;
        child_row.profile.hierarchy.parent_profile_id = parent_id.to_string();
        child_row.profile.hierarchy.child_profiles.clear();

        let parent = state.row_mut(parent_id)?;
        if !parent.profile.hierarchy.has_child(&child.child_profile_id) {
            parent.profile.hierarchy.child_profiles.push(child);
        }
        Ok(())
    }

    fn get_all_profiles(&self) -> Result<Vec<Profile>, StorageError> {
        self.listed(&[])
    }

    fn get_all_profiles_with_filter(
        &self,
        predicates: &[TypedPredicate],
    ) -> Result<Vec<Profile>, StorageError> {
        self.listed(predicates)
    }

    fn update_traits(&self, profile_id: &str, update: &ValidatedUpdate) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("profile.update_traits"))?;
        let row = state.row_mut(profile_id)?;
        for (name, value) in update.traits() {
            row.profile.traits.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn update_identity_attributes(
        &self,
        profile_id: &str,
        update: &ValidatedUpdate,
    ) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("profile.update_identity_attributes"))?;
        let row = state.row_mut(profile_id)?;
        for (name, value) in update.identity_attributes() {
            row.profile
                .identity_attributes
                .insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

/// Thread-safe in-memory event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    by_profile: RwLock<HashMap<String, Vec<Event>>>,
}

impl InMemoryEventStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn insert_event(&self, event: Event) -> Result<(), StorageError> {
        let mut by_profile = self.by_profile.write().map_err(|_| lock_err("event.insert"))?;
        by_profile.entry(event.profile_id.clone()).or_default().push(event);
        Ok(())
    }

    fn events_for_profile(&self, profile_id: &str) -> Result<Vec<Event>, StorageError> {
        let by_profile = self.by_profile.read().map_err(|_| lock_err("event.list"))?;
        let mut events = by_profile.get(profile_id).cloned().unwrap_or_default();
        events.sort_by_key(|e| e.event_timestamp);
        Ok(events)
    }

    fn delete_events_by_profile_id(&self, profile_id: &str) -> Result<usize, StorageError> {
        let mut by_profile = self.by_profile.write().map_err(|_| lock_err("event.delete"))?;
        Ok(by_profile.remove(profile_id).map_or(0, |events| events.len()))
    }
}

/// Thread-safe in-memory schema store.
#[derive(Debug, Default)]
pub struct InMemorySchemaStore {
    rules: RwLock<Vec<EnrichmentRule>>,
}

impl InMemorySchemaStore {
    /// Create a new store without rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `rules`.
    #[must_use]
    pub fn with_rules(rules: Vec<EnrichmentRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Adds a rule.
    pub fn add_rule(&self, rule: EnrichmentRule) -> Result<(), StorageError> {
        let mut rules = self.rules.write().map_err(|_| lock_err("schema.add"))?;
        rules.push(rule);
        Ok(())
    }
}

impl SchemaStore for InMemorySchemaStore {
    fn get_profile_enrichment_rules(&self) -> Result<Vec<EnrichmentRule>, StorageError> {
        let rules = self.rules.read().map_err(|_| lock_err("schema.list"))?;
        Ok(rules.clone())
    }
}

type LockTable = Arc<Mutex<HashMap<LockKey, u64>>>;

/// In-process named locks with session ownership.
///
/// A lock is owned by the session that took it and is released when that
/// session is dropped.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    table: LockTable,
    next_session: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryLockBackend {
    /// Create a backend with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `open_session` fail while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns true if any session holds `key`.
    pub fn is_locked(&self, key: &LockKey) -> Result<bool, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("lock.is_locked"))?;
        Ok(table.contains_key(key))
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> Result<usize, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("lock.held_count"))?;
        Ok(table.len())
    }
}

impl LockBackend for InMemoryLockBackend {
    fn open_session(&self) -> Result<Box<dyn LockSession>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError(
                "lock backend unavailable".to_string(),
            ));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryLockSession {
            id,
            table: Arc::clone(&self.table),
            held: HashSet::new(),
        }))
    }
}

#[derive(Debug)]
struct InMemoryLockSession {
    id: u64,
    table: LockTable,
    held: HashSet<LockKey>,
}

impl LockSession for InMemoryLockSession {
    fn try_acquire(&mut self, key: &LockKey) -> Result<bool, StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("lock.acquire"))?;
        match table.get(key) {
            Some(owner) if *owner == self.id => Ok(true),
            Some(_) => Ok(false),
            None => {
                table.insert(key.clone(), self.id);
                self.held.insert(key.clone());
                Ok(true)
            }
        }
    }

    fn release(&mut self, key: &LockKey) -> Result<bool, StorageError> {
        if !self.held.remove(key) {
            return Ok(false);
        }
        let mut table = self.table.lock().map_err(|_| lock_err("lock.release"))?;
        Ok(table.remove(key).is_some())
    }
}

impl Drop for InMemoryLockSession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in self.held.drain() {
            if table.get(&key) == Some(&self.id) {
                table.remove(&key);
            }
        }
    }
}

/// Bundle of in-memory collaborators.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Profile store.
    pub profiles: InMemoryProfileStore,
    /// Event store.
    pub events: InMemoryEventStore,
    /// Schema store.
    pub schema: InMemorySchemaStore,
    /// Lock backend.
    pub locks: InMemoryLockBackend,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
