use std::sync::Arc;

use serde_json::json;

use profile_unify::{
    ApplicationData, CallContext, ChildProfile, DeletionPlan, EnrichmentRule, Event, EventStore,
    InMemoryEventStore, InMemoryLockBackend, InMemoryProfileStore, InMemorySchemaStore, Profile,
    ProfileService, ProfileStore, ProfileUpdate, UnifyConfig, ValueKind,
};

struct World {
    profiles: Arc<InMemoryProfileStore>,
    events: Arc<InMemoryEventStore>,
    service: ProfileService,
}

fn world() -> World {
    let profiles = Arc::new(InMemoryProfileStore::new());
    let events = Arc::new(InMemoryEventStore::new());
    let schema = Arc::new(InMemorySchemaStore::with_rules(vec![
        EnrichmentRule::new("traits.age", ValueKind::Int),
        EnrichmentRule::new("traits.score", ValueKind::Float),
        EnrichmentRule::new("traits.vip", ValueKind::Boolean),
        EnrichmentRule::new("identity_attributes.email", ValueKind::String),
    ]));
    let service = ProfileService::new(
        profiles.clone(),
        events.clone(),
        schema,
        Arc::new(InMemoryLockBackend::new()),
        &UnifyConfig::default(),
    );
    World {
        profiles,
        events,
        service,
    }
}

/// Ingests one event per id and links `children` under `parent`.
fn family(w: &World, parent: &str, children: &[&str]) {
    let ctx = CallContext::background();
    w.service.ingest_event(Event::new(parent, "identify"), &ctx).unwrap();
    for child in children {
        w.service.ingest_event(Event::new(*child, "identify"), &ctx).unwrap();
        w.service.link_profiles(parent, child, "email_match", &ctx).unwrap();
    }
}

fn bg() -> CallContext {
    CallContext::background()
}

fn exists(w: &World, id: &str) -> bool {
    w.profiles.get_profile(id).unwrap().is_some()
}

#[test]
fn child_reads_are_transparent() {
    let w = world();
    family(&w, "P", &["C"]);
    w.profiles
        .add_application_data("P", ApplicationData::new("web").with_value("theme", json!("dark")))
        .unwrap();
    w.service
        .update_profile("P", ProfileUpdate::new().set_trait("age", json!(41)), &CallContext::background())
        .unwrap();

    let parent = w.service.get_profile("P").unwrap();
    let child = w.service.get_profile("C").unwrap();

    assert_eq!(child.profile_id, "C");
    assert_eq!(child.hierarchy.parent_profile_id, "P");
    assert_eq!(child.traits, parent.traits);
    assert_eq!(child.identity_attributes, parent.identity_attributes);
    assert_eq!(child.application_data, parent.application_data);
    assert_eq!(child.hierarchy.child_profiles, vec![ChildProfile::new("C", "email_match")]);

    // The stored child row keeps its own, unsurfaced data.
    let stored = w.profiles.get_profile("C").unwrap().unwrap();
    assert!(stored.traits.is_empty());
    assert!(!stored.is_parent());
}

#[test]
fn updating_a_child_updates_the_master() {
    let w = world();
    family(&w, "P", &["C"]);
    let ctx = CallContext::background();

    let view = w
        .service
        .update_profile("C", ProfileUpdate::new().set_trait("vip", json!(true)), &ctx)
        .unwrap();
    assert_eq!(view.traits["vip"], json!(true));
    assert_eq!(w.service.get_profile("P").unwrap().traits["vip"], json!(true));

    let err = w
        .service
        .update_profile("C", ProfileUpdate::new().set_trait("vip", json!("yes")), &ctx)
        .unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(err.error_code(), "CDS-10001");
}

#[test]
fn deleting_the_only_child_removes_the_group() {
    let w = world();
    family(&w, "P", &["C"]);

    let plan = w.service.delete_profile("C", &bg()).unwrap();
    assert_eq!(plan, DeletionPlan::OnlyChild { profile_id: "C".into(), parent_id: "P".into() });
    assert!(!exists(&w, "P"));
    assert!(!exists(&w, "C"));
    assert!(w.events.events_for_profile("P").unwrap().is_empty());
    assert!(w.events.events_for_profile("C").unwrap().is_empty());
}

#[test]
fn deleting_a_child_with_siblings_detaches_it() {
    let w = world();
    family(&w, "P", &["C1", "C2"]);

    let plan = w.service.delete_profile("C1", &bg()).unwrap();
    assert_eq!(plan, DeletionPlan::ChildWithSiblings { profile_id: "C1".into(), parent_id: "P".into() });
    assert!(!exists(&w, "C1"));
    assert!(exists(&w, "P"));
    assert!(exists(&w, "C2"));
    assert_eq!(
        w.profiles.fetch_child_profiles("P").unwrap(),
        vec![ChildProfile::new("C2", "email_match")]
    );
    assert_eq!(w.events.events_for_profile("C2").unwrap().len(), 1);
}

#[test]
fn deleting_a_parent_removes_its_children() {
    let w = world();
    family(&w, "P", &["C1", "C2"]);
    family(&w, "Q", &[]);

    let plan = w.service.delete_profile("P", &bg()).unwrap();
    assert_eq!(plan.doomed(), vec!["C1", "C2", "P"]);
    for id in ["P", "C1", "C2"] {
        assert!(!exists(&w, id), "{id} survived");
        assert!(w.events.events_for_profile(id).unwrap().is_empty());
    }
    assert!(exists(&w, "Q"));
}

#[test]
fn deleting_a_solo_parent_twice_is_harmless() {
    let w = world();
    family(&w, "P", &[]);

    assert_eq!(
        w.service.delete_profile("P", &bg()).unwrap(),
        DeletionPlan::SoloParent { profile_id: "P".into() }
    );
    assert_eq!(w.service.delete_profile("P", &bg()).unwrap(), DeletionPlan::Absent);
    assert_eq!(w.service.delete_profile("never-seen", &bg()).unwrap(), DeletionPlan::Absent);
    assert_eq!(w.profiles.row_count().unwrap(), 0);
}

#[test]
fn parent_cascade_skips_children_already_gone() {
    let w = world();
    family(&w, "P", &["C1", "C2"]);
    w.profiles.delete_profile("C1").unwrap();

    w.service.delete_profile("P", &bg()).unwrap();
    assert_eq!(w.profiles.row_count().unwrap(), 0);
}

#[test]
fn orphaned_child_is_deleted_alone() {
    let w = world();
    w.profiles.put_profile(Profile::skeleton("O").into_child_of("gone")).unwrap();

    assert_eq!(
        w.service.delete_profile("O", &bg()).unwrap(),
        DeletionPlan::Orphan { profile_id: "O".into() }
    );
    assert!(!exists(&w, "O"));
}

#[test]
fn filtered_listing_types_values_and_merges_children() {
    let w = world();
    let ctx = CallContext::background();
    family(&w, "P", &["C"]);
    family(&w, "Y", &[]);
    w.service
        .update_profile("P", ProfileUpdate::new().set_trait("age", json!(45)), &ctx)
        .unwrap();
    w.service
        .update_profile("Y", ProfileUpdate::new().set_trait("age", json!(19)), &ctx)
        .unwrap();

    let older: Vec<String> = w
        .service
        .get_all_profiles_with_filter(&["traits.age gt 30"])
        .unwrap()
        .into_iter()
        .map(|p| p.profile_id)
        .collect();
    assert_eq!(older, vec!["C", "P"]);

    // Unparseable integers compare as zero.
    let all = w.service.get_all_profiles_with_filter(&["traits.age gt abc"]).unwrap();
    assert_eq!(all.len(), 3);

    // Malformed expressions are dropped.
    let unfiltered = w.service.get_all_profiles_with_filter(&["traits.age"]).unwrap();
    assert_eq!(unfiltered.len(), w.service.get_all_profiles().unwrap().len());
}

#[test]
fn unknown_profile_is_a_described_not_found() {
    let w = world();
    let err = w.service.get_profile("ghost").unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.error_code(), "CDS-10404");
    assert!(err.public_message().contains("ghost"));
}
