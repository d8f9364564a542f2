//! Profile schema: enrichment rules and their declared value kinds.
//!
//! Enrichment rules are owned by the schema collaborator. The core only
//! reads them to learn which properties exist and how their values are
//! typed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared kind of a profile property value.
///
/// Parsing is total: any type name the schema does not recognise becomes
/// [`ValueKind::Unknown`] and is treated as free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueKind {
    /// Signed integer (`int`).
    Int,
    /// Floating point number (`float` or `double`).
    Float,
    /// Boolean (`boolean`).
    Boolean,
    /// Text (`string`).
    String,
    /// Any other or missing declaration.
    #[default]
    Unknown,
}

impl ValueKind {
    /// Parses a schema type name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "int" => Self::Int,
            "float" | "double" => Self::Float,
            "boolean" => Self::Boolean,
            "string" => Self::String,
            _ => Self::Unknown,
        }
    }

    /// Canonical schema name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true if `value` is acceptable for a property of this kind.
    #[must_use]
    pub fn admits(self, value: &serde_json::Value) -> bool {
        match self {
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::String => value.is_string(),
            Self::Unknown => true,
        }
    }
}

impl From<String> for ValueKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ValueKind> for String {
    fn from(kind: ValueKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule declaring one enrichable profile property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRule {
    /// Property path, e.g. `traits.age`.
    pub property_name: String,
    /// Declared value kind.
    pub value_type: ValueKind,
}

impl EnrichmentRule {
    /// Creates a rule.
    pub fn new(property_name: impl Into<String>, value_type: ValueKind) -> Self {
        Self {
            property_name: property_name.into(),
            value_type,
        }
    }
}

/// Property name → declared kind, built from the enrichment rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTypes {
    kinds: HashMap<String, ValueKind>,
}

impl PropertyTypes {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the mapping from enrichment rules. Later rules win on
    /// duplicate property names.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a EnrichmentRule>) -> Self {
        let kinds = rules
            .into_iter()
            .map(|rule| (rule.property_name.clone(), rule.value_type))
            .collect();
        Self { kinds }
    }

    /// Declares (or redeclares) a property.
    #[must_use]
    pub fn with(mut self, property: impl Into<String>, kind: ValueKind) -> Self {
        self.kinds.insert(property.into(), kind);
        self
    }

    /// Kind declared for `property`, if any.
    #[must_use]
    pub fn declared(&self, property: &str) -> Option<ValueKind> {
        self.kinds.get(property).copied()
    }

    /// Kind for `property`, falling back to [`ValueKind::Unknown`].
    #[must_use]
    pub fn kind_of(&self, property: &str) -> ValueKind {
        self.declared(property).unwrap_or_default()
    }

    /// Number of declared properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
