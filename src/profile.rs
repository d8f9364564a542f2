//! Profile and event types.
//!
//! A profile is either a parent (the master record for one real-world
//! identity) or a child merged into exactly one parent. Traits and
//! application data are authoritative only on the parent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Arbitrary typed attribute values keyed by name.
pub type AttributeMap = BTreeMap<String, serde_json::Value>;

/// Reference from a parent to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProfile {
    /// Identifier of the child profile.
    pub child_profile_id: String,
    /// Unification rule that linked the child, if known.
    #[serde(default)]
    pub rule_name: String,
}

impl ChildProfile {
    /// Creates a child reference.
    pub fn new(child_profile_id: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            child_profile_id: child_profile_id.into(),
            rule_name: rule_name.into(),
        }
    }
}

/// Position of a profile inside its hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileHierarchy {
    /// True for master profiles.
    pub is_parent: bool,
    /// Parent identifier for children; empty (or self in merged views)
    /// otherwise.
    #[serde(default)]
    pub parent_profile_id: String,
    /// Whether the profile is visible in list endpoints.
    pub list_profile: bool,
    /// Children of a parent, in attachment order.
    #[serde(default)]
    pub child_profiles: Vec<ChildProfile>,
}

impl ProfileHierarchy {
    /// Hierarchy of a fresh, childless parent.
    #[must_use]
    pub const fn parent() -> Self {
        Self {
            is_parent: true,
            parent_profile_id: String::new(),
            list_profile: true,
            child_profiles: Vec::new(),
        }
    }

    /// Hierarchy of a child merged into `parent_profile_id`. Children stay
    /// listed; they present the parent's data under their own id.
    pub fn child_of(parent_profile_id: impl Into<String>) -> Self {
        Self {
            is_parent: false,
            parent_profile_id: parent_profile_id.into(),
            list_profile: true,
            child_profiles: Vec::new(),
        }
    }

    /// Returns true if `child_profile_id` is listed as a child.
    #[must_use]
    pub fn has_child(&self, child_profile_id: &str) -> bool {
        self.child_profiles
            .iter()
            .any(|c| c.child_profile_id == child_profile_id)
    }
}

impl Default for ProfileHierarchy {
    fn default() -> Self {
        Self::parent()
    }
}

/// Per-application data attached to a master profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationData {
    /// Owning application.
    pub application_id: String,
    /// Application-specific values.
    #[serde(default)]
    pub app_specific_data: AttributeMap,
}

impl ApplicationData {
    /// Creates an empty record for `application_id`.
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            app_specific_data: AttributeMap::new(),
        }
    }

    /// Adds one application-specific value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.app_specific_data.insert(key.into(), value);
        self
    }
}

/// Canonical identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique, immutable identifier.
    pub profile_id: String,
    /// Hierarchy placement.
    #[serde(rename = "profile_hierarchy")]
    pub hierarchy: ProfileHierarchy,
    /// Immutable identifiers such as external ids.
    #[serde(default)]
    pub identity_attributes: AttributeMap,
    /// Mutable behavioural and demographic attributes.
    #[serde(default)]
    pub traits: AttributeMap,
    /// Per-application records.
    #[serde(default)]
    pub application_data: Vec<ApplicationData>,
}

impl Profile {
    /// Skeleton written when a profile is first observed: a listed parent
    /// with no attributes, traits, or application data.
    pub fn skeleton(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            hierarchy: ProfileHierarchy::parent(),
            identity_attributes: AttributeMap::new(),
            traits: AttributeMap::new(),
            application_data: Vec::new(),
        }
    }

    /// Returns true if this profile is a master.
    #[must_use]
    pub const fn is_parent(&self) -> bool {
        self.hierarchy.is_parent
    }

    /// Parent identifier of a child profile.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        if self.hierarchy.is_parent || self.hierarchy.parent_profile_id.is_empty() {
            None
        } else {
            Some(&self.hierarchy.parent_profile_id)
        }
    }

    /// Builder-style trait setter.
    #[must_use]
    pub fn with_trait(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.traits.insert(key.into(), value);
        self
    }

    /// Builder-style identity attribute setter.
    #[must_use]
    pub fn with_identity_attribute(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.identity_attributes.insert(key.into(), value);
        self
    }

    /// Builder-style application data setter.
    #[must_use]
    pub fn with_application_data(mut self, data: ApplicationData) -> Self {
        self.application_data.push(data);
        self
    }

    /// Builder-style list visibility setter.
    #[must_use]
    pub fn with_list_profile(mut self, list_profile: bool) -> Self {
        self.hierarchy.list_profile = list_profile;
        self
    }

    /// Returns this profile re-parented under `parent_profile_id`.
    #[must_use]
    pub fn into_child_of(mut self, parent_profile_id: impl Into<String>) -> Self {
        self.hierarchy = ProfileHierarchy::child_of(parent_profile_id);
        self
    }
}

/// Incoming identity signal. Only `profile_id` is consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Profile the event belongs to.
    pub profile_id: String,
    /// Event category, e.g. `track` or `identify`.
    #[serde(default)]
    pub event_type: String,
    /// Event name, e.g. `page_view`.
    #[serde(default)]
    pub event_name: String,
    /// Emitting application.
    #[serde(default)]
    pub application_id: String,
    /// When the event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Free-form payload.
    #[serde(default)]
    pub properties: AttributeMap,
}

impl Event {
    /// Creates an event for `profile_id` stamped with the current time.
    pub fn new(profile_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            profile_id: profile_id.into(),
            event_type: event_type.into(),
            event_name: String::new(),
            application_id: String::new(),
            event_timestamp: Utc::now(),
            properties: AttributeMap::new(),
        }
    }

    /// Sets the event name.
    #[must_use]
    pub fn named(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }

    /// Sets the emitting application.
    #[must_use]
    pub fn from_application(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = application_id.into();
        self
    }
}
