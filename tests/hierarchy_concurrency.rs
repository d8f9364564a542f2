use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use profile_unify::{
    ApplicationData, CallContext, CascadeDeleter, ChildProfile, HierarchyLinker, InMemoryEventStore,
    InMemoryLockBackend, InMemoryProfileStore, LockCoordinator, Profile, ProfileStore, RetryPolicy,
    StorageError, TypedPredicate, UnifyError, ValidatedUpdate,
};

/// Stretches the window between reading a family and writing it.
struct SlowFamilies {
    inner: InMemoryProfileStore,
}

impl ProfileStore for SlowFamilies {
    fn insert_profile(&self, profile: Profile) -> Result<(), StorageError> {
        self.inner.insert_profile(profile)
    }

    fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>, StorageError> {
        self.inner.get_profile(profile_id)
    }

    fn fetch_child_profiles(&self, parent_id: &str) -> Result<Vec<ChildProfile>, StorageError> {
        thread::sleep(Duration::from_millis(30));
        self.inner.fetch_child_profiles(parent_id)
    }

    fn fetch_application_data(&self, profile_id: &str) -> Result<Vec<ApplicationData>, StorageError> {
        self.inner.fetch_application_data(profile_id)
    }

    fn delete_profile(&self, profile_id: &str) -> Result<(), StorageError> {
        self.inner.delete_profile(profile_id)
    }

    fn detach_child_profile_from_parent(&self, parent_id: &str, child_id: &str) -> Result<(), StorageError> {
        self.inner.detach_child_profile_from_parent(parent_id, child_id)
    }

    fn attach_child_profile(&self, parent_id: &str, child: ChildProfile) -> Result<(), StorageError> {
        self.inner.attach_child_profile(parent_id, child)
    }

    fn get_all_profiles(&self) -> Result<Vec<Profile>, StorageError> {
        self.inner.get_all_profiles()
    }

    fn get_all_profiles_with_filter(&self, predicates: &[TypedPredicate]) -> Result<Vec<Profile>, StorageError> {
        self.inner.get_all_profiles_with_filter(predicates)
    }

    fn update_traits(&self, profile_id: &str, update: &ValidatedUpdate) -> Result<(), StorageError> {
        self.inner.update_traits(profile_id, update)
    }

    fn update_identity_attributes(&self, profile_id: &str, update: &ValidatedUpdate) -> Result<(), StorageError> {
        self.inner.update_identity_attributes(profile_id, update)
    }
}

struct Family {
    store: Arc<SlowFamilies>,
    linker: HierarchyLinker,
    deleter: CascadeDeleter,
}

fn family(ids: &[&str]) -> Arc<Family> {
    let inner = InMemoryProfileStore::new();
    for id in ids {
        inner.put_profile(Profile::skeleton(*id)).unwrap();
    }
    let store = Arc::new(SlowFamilies { inner });
    let locks = LockCoordinator::new(
        Arc::new(InMemoryLockBackend::new()),
        RetryPolicy::fixed(500, Duration::from_millis(2)),
    );
    Arc::new(Family {
        linker: HierarchyLinker::new(store.clone(), locks.clone()),
        deleter: CascadeDeleter::new(store.clone(), Arc::new(InMemoryEventStore::new()), locks),
        store,
    })
}

/// Runs both closures at once and returns their results in order.
fn race<A, B>(f: &Arc<Family>, a: A, b: B) -> (bool, bool)
where
    A: Fn(&Family) -> bool + Send + 'static,
    B: Fn(&Family) -> bool + Send + 'static,
{
    let barrier = Arc::new(Barrier::new(2));
    let spawn = |job: Box<dyn Fn(&Family) -> bool + Send>| {
        let f = Arc::clone(f);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            job(&f)
        })
    };
    let first = spawn(Box::new(a));
    let second = spawn(Box::new(b));
    (first.join().unwrap(), second.join().unwrap())
}

fn link(parent: &'static str, child: &'static str) -> impl Fn(&Family) -> bool + Send + 'static {
    move |f: &Family| {
        f.linker
            .attach_child(parent, child, "email_match", &CallContext::background())
            .is_ok()
    }
}

/// Every listed child points back at its parent, and every child's parent
/// exists and lists it.
fn assert_consistent(f: &Family, ids: &[&str]) {
    for id in ids {
        let Some(row) = f.store.get_profile(id).unwrap() else {
            continue;
        };
        match row.parent_id() {
            Some(parent_id) => {
                let parent = f.store.get_profile(parent_id).unwrap();
                assert!(parent.is_some(), "{id} points at missing parent {parent_id}");
                assert!(
                    f.store.inner.fetch_child_profiles(parent_id).unwrap().iter().any(|c| c.child_profile_id == *id),
                    "{parent_id} does not list {id}"
                );
            }
            None => {
                for child in f.store.inner.fetch_child_profiles(id).unwrap() {
                    let child_row = f.store.get_profile(&child.child_profile_id).unwrap();
                    assert_eq!(
                        child_row.as_ref().and_then(Profile::parent_id),
                        Some(*id),
                        "{id} lists {} which does not point back",
                        child.child_profile_id
                    );
                }
            }
        }
    }
}

#[test]
fn two_parents_cannot_adopt_the_same_child() {
    let f = family(&["P", "Q", "C"]);
    let (p, q) = race(&f, link("P", "C"), link("Q", "C"));

    assert!(p ^ q, "exactly one link must win: P={p} Q={q}");
    let winner = if p { "P" } else { "Q" };
    let loser = if p { "Q" } else { "P" };
    assert_eq!(f.store.get_profile("C").unwrap().unwrap().parent_id(), Some(winner));
    assert!(f.store.inner.fetch_child_profiles(loser).unwrap().is_empty());
    assert_consistent(&f, &["P", "Q", "C"]);
}

#[test]
fn linking_cannot_build_a_three_level_chain() {
    let f = family(&["P", "C", "D"]);
    let (upper, lower) = race(&f, link("P", "C"), link("C", "D"));

    assert!(upper ^ lower, "one of the links must be refused: upper={upper} lower={lower}");
    for id in ["P", "C", "D"] {
        let row = f.store.get_profile(id).unwrap().unwrap();
        if let Some(parent_id) = row.parent_id() {
            let parent = f.store.get_profile(parent_id).unwrap().unwrap();
            assert!(parent.is_parent(), "{id} hangs under child {parent_id}");
        }
    }
    assert_consistent(&f, &["P", "C", "D"]);
}

#[test]
fn deleting_a_parent_while_it_adopts_leaves_no_dangling_child() {
    let f = family(&["P", "X"]);
    let (_, linked) = race(
        &f,
        |f: &Family| f.deleter.delete("P", &CallContext::background()).is_ok(),
        link("P", "X"),
    );

    assert!(f.store.get_profile("P").unwrap().is_none());
    match f.store.get_profile("X").unwrap() {
        // The link won, so the cascade took X with P.
        None => assert!(linked),
        Some(x) => {
            assert!(!linked);
            assert!(x.parent_id().is_none(), "X points at deleted parent");
        }
    }
}

#[test]
fn deleting_a_child_while_its_parent_adopts_keeps_the_group_whole() {
    let f = family(&["P", "C", "X"]);
    f.linker
        .attach_child("P", "C", "email_match", &CallContext::background())
        .unwrap();

    let (deleted, linked) = race(
        &f,
        |f: &Family| f.deleter.delete("C", &CallContext::background()).is_ok(),
        link("P", "X"),
    );
    assert!(deleted);
    assert!(f.store.get_profile("C").unwrap().is_none());
    if linked {
        if let Some(x) = f.store.get_profile("X").unwrap() {
            assert_eq!(x.parent_id(), Some("P"));
        }
    }
    assert_consistent(&f, &["P", "C", "X"]);
}

#[test]
fn refused_link_reports_the_existing_parent() {
    let f = family(&["P", "Q", "C"]);
    let ctx = CallContext::background();
    f.linker.attach_child("P", "C", "email_match", &ctx).unwrap();

    let err = f.linker.attach_child("Q", "C", "email_match", &ctx).unwrap_err();
    assert!(matches!(err, UnifyError::Validation(_)));
    assert!(err.to_string().contains("already belongs to P"));
}
