//! Typed partial profile updates.
//!
//! A [`ProfileUpdate`] names the traits and identity attributes to set. It
//! only reaches storage as a [`ValidatedUpdate`], i.e. after every property
//! has been checked against the enrichment rules: the property must be
//! declared and the value must match the declared kind.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::profile::AttributeMap;
use crate::schema::PropertyTypes;

/// Path prefix of trait properties.
pub const TRAITS_PREFIX: &str = "traits";

/// Path prefix of identity attribute properties.
pub const IDENTITY_ATTRIBUTES_PREFIX: &str = "identity_attributes";

const PROPERTY_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

static PROPERTY_NAME: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn valid_property_name(name: &str) -> Result<bool, ValidationError> {
    match PROPERTY_NAME.get_or_init(|| Regex::new(PROPERTY_NAME_PATTERN)) {
        Ok(re) => Ok(re.is_match(name)),
        Err(e) => Err(ValidationError::InvalidPattern {
            reason: format!("invalid regex '{PROPERTY_NAME_PATTERN}': {e}"),
        }),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "float",
        serde_json::Value::Number(_) => "int",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Requested changes to a profile, keyed by bare property name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    /// Traits to set on the master profile.
    #[serde(default)]
    pub traits: AttributeMap,
    /// Identity attributes to set on the addressed profile.
    #[serde(default)]
    pub identity_attributes: AttributeMap,
}

impl ProfileUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a trait.
    #[must_use]
    pub fn set_trait(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.traits.insert(name.into(), value);
        self
    }

    /// Sets an identity attribute.
    #[must_use]
    pub fn set_identity_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.identity_attributes.insert(name.into(), value);
        self
    }

    /// Checks every field against the declared property types.
    ///
    /// # Errors
    /// - `EmptyUpdate` if nothing is set
    /// - `InvalidPropertyPath` for names that are not plain identifiers
    /// - `UndeclaredProperty` for properties without an enrichment rule
    /// - `TypeMismatch` for values the declared kind does not admit
    pub fn validate(self, types: &PropertyTypes) -> Result<ValidatedUpdate, ValidationError> {
        if self.traits.is_empty() && self.identity_attributes.is_empty() {
            return Err(ValidationError::EmptyUpdate);
        }
        check_section(TRAITS_PREFIX, &self.traits, types)?;
        check_section(IDENTITY_ATTRIBUTES_PREFIX, &self.identity_attributes, types)?;
        Ok(ValidatedUpdate {
            traits: self.traits,
            identity_attributes: self.identity_attributes,
        })
    }
}

fn check_section(
    prefix: &str,
    fields: &AttributeMap,
    types: &PropertyTypes,
) -> Result<(), ValidationError> {
    for (name, value) in fields {
        let property = format!("{prefix}.{name}");
        if !valid_property_name(name)? {
            return Err(ValidationError::InvalidPropertyPath { property });
        }
        let Some(kind) = types.declared(&property) else {
            return Err(ValidationError::UndeclaredProperty { property });
        };
        if !kind.admits(value) {
            return Err(ValidationError::TypeMismatch {
                property,
                expected: kind,
                actual: json_kind(value).to_string(),
            });
        }
    }
    Ok(())
}

/// An update whose every field is declared and correctly typed.
///
/// Only [`ProfileUpdate::validate`] can build one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUpdate {
    traits: AttributeMap,
    identity_attributes: AttributeMap,
}

impl ValidatedUpdate {
    /// Trait assignments.
    #[must_use]
    pub const fn traits(&self) -> &AttributeMap {
        &self.traits
    }

    /// Identity attribute assignments.
    #[must_use]
    pub const fn identity_attributes(&self) -> &AttributeMap {
        &self.identity_attributes
    }
}
