//! Feature registry: the static catalogue of excludable features.
//!
//! Ids and categories are lowercase-normalised newtypes so every lookup is
//! case-insensitive and returns an explicit `Option` instead of relying on
//! string presence checks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Validated, lowercase feature identifier (e.g. `api-key`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(raw: &str) -> Result<Self, RegistryError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty()
            || normalized.contains(':')
            || normalized.chars().any(char::is_whitespace)
        {
            return Err(RegistryError::InvalidFeatureId(raw.to_string()));
        }
        Ok(FeatureId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeatureId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureId::new(s)
    }
}

impl TryFrom<String> for FeatureId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FeatureId::new(&value)
    }
}

impl From<FeatureId> for String {
    fn from(id: FeatureId) -> Self {
        id.0
    }
}

/// Lowercase category name addressable as `category:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    pub fn new(raw: &str) -> Result<Self, RegistryError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidCategory(raw.to_string()));
        }
        Ok(Category(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An optional, independently excludable unit of installable functionality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub category: Category,
    pub description: String,
}

impl Feature {
    pub fn new(id: &str, category: &str, description: &str) -> Result<Self, RegistryError> {
        Ok(Feature {
            id: FeatureId::new(id)?,
            category: Category::new(category)?,
            description: description.to_string(),
        })
    }
}

/// Read-only catalogue of known features, in registration order.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: Vec<Feature>,
}

impl FeatureRegistry {
    /// Build a registry, rejecting duplicate ids.
    pub fn new(features: Vec<Feature>) -> Result<Self, RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for feature in &features {
            if !seen.insert(feature.id.clone()) {
                return Err(RegistryError::DuplicateFeature(feature.id.to_string()));
            }
        }
        Ok(FeatureRegistry { features })
    }

    /// Convenience constructor from `(id, category, description)` triples.
    pub fn from_entries(entries: &[(&str, &str, &str)]) -> Result<Self, RegistryError> {
        let features = entries
            .iter()
            .map(|(id, category, description)| Feature::new(id, category, description))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(features)
    }

    /// The built-in MISP utilities-sector catalogue.
    pub fn builtin() -> Self {
        crate::catalog::builtin_registry()
    }

    /// All features in a stable order.
    pub fn list_features(&self) -> &[Feature] {
        &self.features
    }

    /// Case-insensitive lookup.
    pub fn find(&self, id: &str) -> Option<&Feature> {
        let needle = id.trim().to_ascii_lowercase();
        self.features.iter().find(|f| f.id.as_str() == needle)
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        self.features.iter().any(|f| &f.id == id)
    }

    /// Features in `category`; empty for an unknown category.
    pub fn features_in_category(&self, category: &str) -> Vec<&Feature> {
        let needle = category.trim().to_ascii_lowercase();
        self.features
            .iter()
            .filter(|f| f.category.as_str() == needle)
            .collect()
    }

    /// Distinct categories in first-seen order.
    pub fn categories(&self) -> Vec<&Category> {
        let mut out: Vec<&Category> = Vec::new();
        for feature in &self.features {
            if !out.contains(&&feature.category) {
                out.push(&feature.category);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
