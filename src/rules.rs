//! Caching rules and varies.
//!
//! A [`CachingRule`] decides whether a request's referenced types make it
//! cacheable and for how long; a [`CachingVary`] names the request headers
//! and cookies that partition the result cache. Both tables are hashed so
//! cached plans can detect configuration drift and recompute.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

/// Map of GraphQL type name to a set of field names.
///
/// Used for rule type-scopes, configured type keys, and the set of
/// `(type, field)` pairs a request references.
pub type TypeFieldMap = BTreeMap<String, BTreeSet<String>>;

/// A single caching rule.
///
/// A rule matches a request when `types` is `None` (matches everything) or
/// when at least one scoped type appears in the request with every one of
/// its listed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingRule {
    /// GraphQL types (optionally narrowed to fields) this rule applies to.
    /// `None` matches all requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<TypeFieldMap>,

    /// How long matching query results stay fresh.
    pub max_age: Duration,

    /// How long stale results may be served while a background refresh runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swr: Option<Duration>,

    /// Names of varies that partition results cached under this rule.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub varies: BTreeSet<String>,
}

impl CachingRule {
    /// Create a rule matching all requests with the given freshness lifetime.
    pub fn new(max_age: Duration) -> Self {
        Self {
            types: None,
            max_age,
            swr: None,
            varies: BTreeSet::new(),
        }
    }

    /// Scope the rule to a type, matching any selection of its fields.
    pub fn for_type(mut self, type_name: impl Into<String>) -> Self {
        self.types
            .get_or_insert_with(BTreeMap::new)
            .insert(type_name.into(), BTreeSet::new());
        self
    }

    /// Scope the rule to a type with a required set of fields.
    pub fn for_type_fields<I, S>(mut self, type_name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types.get_or_insert_with(BTreeMap::new).insert(
            type_name.into(),
            fields.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Set the stale-while-revalidate window.
    pub fn with_swr(mut self, swr: Duration) -> Self {
        self.swr = Some(swr);
        self
    }

    /// Add a vary name.
    pub fn with_vary(mut self, name: impl Into<String>) -> Self {
        self.varies.insert(name.into());
        self
    }
}

/// Named caching rules, ordered by name for deterministic hashing.
pub type CachingRules = BTreeMap<String, CachingRule>;

/// A named group of request headers and cookies contributing to result keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachingVary {
    /// Header names (matched case-insensitively against the request).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub headers: BTreeSet<String>,

    /// Cookie names.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cookies: BTreeSet<String>,
}

impl CachingVary {
    /// Add a header name.
    pub fn with_header(mut self, name: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase());
        self
    }

    /// Add a cookie name.
    pub fn with_cookie(mut self, name: impl Into<String>) -> Self {
        self.cookies.insert(name.into());
        self
    }
}

/// Named varies, ordered by name for deterministic hashing.
pub type CachingVaries = BTreeMap<String, CachingVary>;

/// 64-bit hash of the rule table. Embedded in cached plans so stale plans
/// are recomputed after a configuration change.
pub fn rules_hash(rules: &CachingRules) -> Result<u64> {
    config_hash(rules)
}

/// 64-bit hash of the vary table.
pub fn varies_hash(varies: &CachingVaries) -> Result<u64> {
    config_hash(varies)
}

fn config_hash<T: Serialize>(value: &T) -> Result<u64> {
    let encoded = serde_json::to_vec(value)?;
    Ok(xxh64(&encoded, 0))
}
