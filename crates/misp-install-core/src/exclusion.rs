//! Exclusion resolution: user tokens -> concrete skip set.
//!
//! Tokens are either literal feature ids (`api-key`) or category wildcards
//! (`category:automation`). Unknown references never fail resolution; they
//! come back as [`ExclusionWarning`]s next to the skip set so old or
//! mistyped configs still install.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::registry::{FeatureId, FeatureRegistry};

const CATEGORY_PREFIX: &str = "category:";

/// Ordered, immutable list of raw exclusion tokens from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSpec {
    tokens: Vec<String>,
}

impl ExclusionSpec {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExclusionSpec {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One parsed exclusion token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionToken {
    Feature(String),
    Category(String),
}

impl ExclusionToken {
    /// Parse a raw token. Matching is case-insensitive and ignores
    /// surrounding whitespace.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.strip_prefix(CATEGORY_PREFIX) {
            Some(name) => ExclusionToken::Category(name.trim().to_string()),
            None => ExclusionToken::Feature(normalized),
        }
    }
}

/// Non-fatal problem found while resolving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionWarning {
    UnknownFeature { token: String },
    UnknownCategory { token: String, category: String },
}

impl ExclusionWarning {
    /// The raw token the warning refers to.
    pub fn token(&self) -> &str {
        match self {
            ExclusionWarning::UnknownFeature { token } => token,
            ExclusionWarning::UnknownCategory { token, .. } => token,
        }
    }
}

impl fmt::Display for ExclusionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionWarning::UnknownFeature { token } => {
                write!(f, "unknown feature id {token:?} in exclude_features; ignoring")
            }
            ExclusionWarning::UnknownCategory { token, category } => write!(
                f,
                "unknown category {category:?} (from {token:?}) in exclude_features; ignoring"
            ),
        }
    }
}

/// Resolved set of feature ids to leave out of this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkipSet(BTreeSet<FeatureId>);

impl SkipSet {
    pub fn contains(&self, id: &FeatureId) -> bool {
        self.0.contains(id)
    }

    /// Features of `required` that are excluded, in order.
    pub fn intersection<'a>(&self, required: &'a [FeatureId]) -> Vec<&'a FeatureId> {
        required.iter().filter(|id| self.0.contains(*id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable SHA-256 over the sorted ids, used to notice exclusions
    /// changing between runs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for id in &self.0 {
            hasher.update(id.as_str().as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

impl FromIterator<FeatureId> for SkipSet {
    fn from_iter<T: IntoIterator<Item = FeatureId>>(iter: T) -> Self {
        SkipSet(iter.into_iter().collect())
    }
}

/// Skip set plus the warnings collected while computing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub skip_set: SkipSet,
    pub warnings: Vec<ExclusionWarning>,
}

/// Expands an [`ExclusionSpec`] against a [`FeatureRegistry`].
pub struct ExclusionResolver<'a> {
    registry: &'a FeatureRegistry,
}

impl<'a> ExclusionResolver<'a> {
    pub fn new(registry: &'a FeatureRegistry) -> Self {
        ExclusionResolver { registry }
    }

    /// Resolve `spec`. Deterministic and infallible.
    pub fn resolve(&self, spec: &ExclusionSpec) -> Resolution {
        let mut skip: BTreeSet<FeatureId> = BTreeSet::new();
        let mut warnings = Vec::new();
        let mut warned: HashSet<String> = HashSet::new();

        for raw in spec.tokens() {
            let warning = match ExclusionToken::parse(raw) {
                ExclusionToken::Category(name) => {
                    let members = self.registry.features_in_category(&name);
                    if members.is_empty() {
                        Some(ExclusionWarning::UnknownCategory {
                            token: raw.trim().to_string(),
                            category: name,
                        })
                    } else {
                        skip.extend(members.into_iter().map(|f| f.id.clone()));
                        None
                    }
                }
                ExclusionToken::Feature(id) => match self.registry.find(&id) {
                    Some(feature) => {
                        skip.insert(feature.id.clone());
                        None
                    }
                    None => Some(ExclusionWarning::UnknownFeature {
                        token: raw.trim().to_string(),
                    }),
                },
            };

            if let Some(warning) = warning {
                if warned.insert(raw.trim().to_ascii_lowercase()) {
                    warnings.push(warning);
                }
            }
        }

        Resolution {
            skip_set: SkipSet(skip),
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FeatureRegistry {
        FeatureRegistry::from_entries(&[
            ("a", "x", ""),
            ("b", "x", ""),
            ("c", "y", ""),
        ])
        .unwrap()
    }

    fn ids(set: &SkipSet) -> Vec<&str> {
        set.iter().map(|id| id.as_str()).collect()
    }

    #[test]
    fn test_parse_category_prefix_case_insensitive() {
        assert_eq!(
            ExclusionToken::parse("Category:Automation"),
            ExclusionToken::Category("automation".to_string())
        );
        assert_eq!(
            ExclusionToken::parse(" API-Key "),
            ExclusionToken::Feature("api-key".to_string())
        );
    }

    #[test]
    fn test_empty_spec_excludes_nothing() {
        let registry = registry();
        let resolution = ExclusionResolver::new(&registry).resolve(&ExclusionSpec::default());
        assert!(resolution.skip_set.is_empty());
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_category_expands_to_members() {
        let registry = registry();
        let resolution =
            ExclusionResolver::new(&registry).resolve(&ExclusionSpec::new(["category:x"]));
        assert_eq!(ids(&resolution.skip_set), vec!["a", "b"]);
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_literal_and_category_union() {
        let registry = registry();
        let resolution = ExclusionResolver::new(&registry)
            .resolve(&ExclusionSpec::new(["C", "category:X", "a"]));
        assert_eq!(ids(&resolution.skip_set), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_tokens_warn_without_failing() {
        let registry = registry();
        let resolution = ExclusionResolver::new(&registry).resolve(&ExclusionSpec::new([
            "not-a-real-feature",
            "category:nope",
            "a",
        ]));
        assert_eq!(ids(&resolution.skip_set), vec!["a"]);
        assert_eq!(resolution.warnings.len(), 2);
        assert_eq!(resolution.warnings[0].token(), "not-a-real-feature");
        assert!(matches!(
            &resolution.warnings[1],
            ExclusionWarning::UnknownCategory { category, .. } if category == "nope"
        ));
    }

    #[test]
    fn test_repeated_unknown_token_warns_once() {
        let registry = registry();
        let resolution =
            ExclusionResolver::new(&registry).resolve(&ExclusionSpec::new(["zzz", "zzz"]));
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[test]
    fn test_repeats_differing_in_case_warn_once() {
        let registry = registry();
        let resolution = ExclusionResolver::new(&registry).resolve(&ExclusionSpec::new([
            "bogus",
            "BOGUS",
            "Category:Nope",
            "category:nope",
        ]));
        assert_eq!(
            resolution.warnings,
            vec![
                ExclusionWarning::UnknownFeature {
                    token: "bogus".to_string()
                },
                ExclusionWarning::UnknownCategory {
                    token: "Category:Nope".to_string(),
                    category: "nope".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_empty_category_name_is_unknown() {
        let registry = registry();
        let resolution =
            ExclusionResolver::new(&registry).resolve(&ExclusionSpec::new(["category:"]));
        assert!(resolution.skip_set.is_empty());
        assert_eq!(resolution.warnings.len(), 1);
    }

    #[test]
    fn test_digest_independent_of_token_order() {
        let registry = registry();
        let resolver = ExclusionResolver::new(&registry);
        let one = resolver.resolve(&ExclusionSpec::new(["a", "c"]));
        let two = resolver.resolve(&ExclusionSpec::new(["C", "A"]));
        assert_eq!(one.skip_set.digest(), two.skip_set.digest());
        assert_ne!(one.skip_set.digest(), SkipSet::default().digest());
    }

    #[test]
    fn test_spec_deserializes_from_plain_list() {
        let spec: ExclusionSpec =
            serde_json::from_str(r#"["api-key", "category:automation"]"#).unwrap();
        assert_eq!(spec.tokens().len(), 2);
    }
}
