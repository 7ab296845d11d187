//! Caching plans.
//!
//! A [`CachingPlan`] is the per-request decision record: whether to cache
//! at all, for how long, under which varies, and which types the tag
//! analyzer should scope to. Plans are derived from the configured rule
//! table and cached under the plan key; cached plans embed the rule and
//! vary table hashes and are recomputed when the configuration drifts.

use crate::config::SharedCachingConfig;
use crate::error::Result;
use crate::fingerprint;
use crate::normalize::NormalizedRequest;
use crate::rules::{rules_hash, varies_hash, CachingRule, TypeFieldMap};
use crate::schema::Schema;
use crate::store::SharedCachingStore;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Decision record for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingPlan {
    /// Freshness lifetime; the minimum across matching rules.
    pub max_age: Option<Duration>,
    /// Stale-while-revalidate window; the minimum across matching rules.
    pub swr: Option<Duration>,
    /// Union of matching rules' vary names.
    pub vary_names: BTreeSet<String>,
    /// Types the tag analyzer is scoped to. `None` means unrestricted,
    /// which happens as soon as one matching rule has no type scope.
    pub types: Option<BTreeSet<String>>,
    /// Hash of the rule table the plan was computed from.
    pub rules_hash: u64,
    /// Hash of the vary table the plan was computed from.
    pub varies_hash: u64,
    /// No rule matched; the request is forwarded untouched.
    pub passthrough: bool,

    /// Result key for this request's vary inputs. Recomputed per request,
    /// never persisted with the plan.
    #[serde(skip)]
    pub result_cache_key: String,
}

impl CachingPlan {
    /// Total time an entry created under this plan may live in the store.
    pub fn expiration(&self) -> Duration {
        self.max_age.unwrap_or_default() + self.swr.unwrap_or_default()
    }
}

/// Matches requests against the rule table and produces plans.
pub struct Planner {
    store: SharedCachingStore,
    config: SharedCachingConfig,
}

impl Planner {
    pub fn new(store: SharedCachingStore, config: SharedCachingConfig) -> Self {
        Self { store, config }
    }

    /// Produce the plan for a normalized request, loading it from the plan
    /// cache when the embedded config hashes still match.
    ///
    /// The result key is always derived fresh from this request's headers
    /// and cookies, even on a plan cache hit.
    pub async fn plan(
        &self,
        request: &NormalizedRequest,
        schema: &Schema,
        headers: &HeaderMap,
    ) -> Result<CachingPlan> {
        let plan_key = fingerprint::plan_cache_key(
            request.schema_hash,
            &request.query,
            &request.variables,
        )?;

        let mut plan = match self.cached_plan(&plan_key).await {
            Some(plan) => plan,
            None => {
                let plan = self.compute_plan(request, schema)?;
                if let Err(e) = self.store.set(&plan_key, &plan, None, &[]).await {
                    tracing::warn!(cache_key = %plan_key, error = %e, "failed to save caching plan");
                }
                plan
            }
        };

        plan.result_cache_key = fingerprint::result_cache_key(
            &plan_key,
            &plan.vary_names,
            &self.config.varies,
            headers,
        )?;

        Ok(plan)
    }

    async fn cached_plan(&self, plan_key: &str) -> Option<CachingPlan> {
        let plan: CachingPlan = self.store.get(plan_key).await?;

        let rules = rules_hash(&self.config.rules).ok()?;
        let varies = varies_hash(&self.config.varies).ok()?;

        if plan.rules_hash != rules || plan.varies_hash != varies {
            tracing::debug!(cache_key = plan_key, "cached plan has stale config hashes");
            return None;
        }

        Some(plan)
    }

    fn compute_plan(&self, request: &NormalizedRequest, schema: &Schema) -> Result<CachingPlan> {
        let referenced = request.referenced_type_fields(schema);

        let mut plan = CachingPlan {
            max_age: None,
            swr: None,
            vary_names: BTreeSet::new(),
            types: Some(BTreeSet::new()),
            rules_hash: rules_hash(&self.config.rules)?,
            varies_hash: varies_hash(&self.config.varies)?,
            passthrough: true,
            result_cache_key: String::new(),
        };

        for rule in self.config.rules.values() {
            if !rule_matches(&referenced, rule) {
                continue;
            }

            plan.max_age = min_duration(plan.max_age, Some(rule.max_age));
            plan.swr = min_duration(plan.swr, rule.swr);
            plan.vary_names.extend(rule.varies.iter().cloned());

            match (&mut plan.types, &rule.types) {
                // One scope-less rule widens tagging to every type.
                (types, None) => *types = None,
                (Some(types), Some(scoped)) => types.extend(scoped.keys().cloned()),
                (None, Some(_)) => {}
            }

            plan.passthrough = false;
        }

        Ok(plan)
    }
}

/// A rule matches when it has no type scope, or when at least one scoped
/// type appears in the request with every one of the rule's listed fields.
fn rule_matches(referenced: &TypeFieldMap, rule: &CachingRule) -> bool {
    match &rule.types {
        None => true,
        Some(scoped) => scoped.iter().any(|(type_name, fields)| {
            referenced
                .get(type_name)
                .is_some_and(|present| fields.iter().all(|field| present.contains(field)))
        }),
    }
}

fn min_duration(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
