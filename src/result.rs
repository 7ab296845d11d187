//! Cached query results.
//!
//! A [`CachingResult`] is the stored envelope for one origin response:
//! body, normalized headers, freshness bookkeeping, hit counter, and the
//! tag set the entry was indexed under. The [`ResultCache`] persists
//! envelopes under the plan's result key with TTL `max_age + swr` and
//! evaluates request `Cache-Control` directives against entry freshness
//! (RFC 7234 §5.2.1).

use crate::cache_control::RequestCacheControl;
use crate::config::TypeKeys;
use crate::error::Result;
use crate::normalize::NormalizedRequest;
use crate::plan::CachingPlan;
use crate::schema::Schema;
use crate::store::SharedCachingStore;
use crate::tags::{TagAnalyzer, TagSet};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Freshness of a cached entry at observation time.
///
/// Entries past `max_age + swr` are evicted by the store TTL; an entry that
/// can still be fetched is either fresh or inside its SWR window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Valid,
    Stale,
}

/// Stored envelope for one cached query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingResult {
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub hit_count: u64,
    pub created_at: SystemTime,
    /// Total lifetime in the store: `max_age + swr`.
    pub expiration: Duration,
    pub max_age: Option<Duration>,
    pub swr: Option<Duration>,
    /// Sorted tag list the entry is indexed under.
    pub tags: Vec<String>,
}

impl CachingResult {
    /// Seconds the entry has existed.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }

    /// Whether the entry is still fresh or serving on its SWR window.
    pub fn status(&self) -> ResultStatus {
        match self.max_age {
            Some(max_age) if !self.expiration.is_zero() && max_age < self.age() => {
                ResultStatus::Stale
            }
            _ => ResultStatus::Valid,
        }
    }

    /// Store TTL left at observation time.
    pub fn remaining_ttl(&self) -> Duration {
        self.expiration.saturating_sub(self.age())
    }

    /// Evaluate the request's cache-control directives against this entry.
    ///
    /// Precedence: `no-cache` rejects stale entries, `min-fresh` demands
    /// remaining freshness, `max-age` bounds entry age unless paired with
    /// `max-stale`, and `max-stale` alone permits staleness (unbounded
    /// when no delta was given). Absent directives admit everything; the
    /// SWR path takes care of refreshing stale entries.
    pub fn valid_for(&self, cc: &RequestCacheControl) -> bool {
        let status = self.status();
        let age = self.age();

        if cc.no_cache && status == ResultStatus::Stale {
            return false;
        }

        if let Some(min_fresh) = cc.min_fresh {
            if age + min_fresh > self.max_age.unwrap_or_default() {
                return false;
            }
        }

        if let Some(req_max_age) = cc.max_age {
            if req_max_age >= age && status == ResultStatus::Valid {
                return true;
            }

            if cc.max_stale_set && status == ResultStatus::Stale {
                return match cc.max_stale {
                    // Willing to accept a stale response of any age.
                    None => true,
                    Some(max_stale) => req_max_age + max_stale >= age,
                };
            }

            return false;
        }

        if cc.max_stale_set {
            if cc.max_stale.is_none() || status == ResultStatus::Valid {
                return true;
            }
            let max_stale = cc.max_stale.unwrap_or_default();
            return self.max_age.unwrap_or_default() + max_stale >= age;
        }

        true
    }

    /// Strip headers that would be stale on replay.
    pub fn normalize_headers(&mut self) {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("date") && !name.eq_ignore_ascii_case("server"));
    }
}

/// Persists and retrieves result envelopes.
pub struct ResultCache {
    store: SharedCachingStore,
    type_keys: TypeKeys,
}

impl ResultCache {
    pub fn new(store: SharedCachingStore, type_keys: TypeKeys) -> Self {
        Self { store, type_keys }
    }

    /// Fetch the entry for the plan's result key, admitting it only when
    /// the request's cache-control directives allow.
    pub async fn lookup(
        &self,
        plan: &CachingPlan,
        cache_control: &RequestCacheControl,
    ) -> Option<CachingResult> {
        let result: CachingResult = self.store.get(&plan.result_cache_key).await?;
        result.valid_for(cache_control).then_some(result)
    }

    /// Analyze the response payload into tags and persist the envelope
    /// with TTL `max_age + swr`. Returns the tag set for debug reporting.
    pub async fn store_result(
        &self,
        schema: &Schema,
        request: &NormalizedRequest,
        plan: &CachingPlan,
        body: &str,
        headers: Vec<(String, String)>,
    ) -> Result<TagSet> {
        let mut tags = TagSet::new();
        TagAnalyzer::new(schema, &self.type_keys).analyze_result(
            request,
            body,
            plan.types.as_ref(),
            &mut tags,
        )?;

        let mut result = CachingResult {
            headers,
            body: body.to_string(),
            hit_count: 0,
            created_at: SystemTime::now(),
            expiration: plan.expiration(),
            max_age: plan.max_age,
            swr: plan.swr,
            tags: tags.to_vec(),
        };
        result.normalize_headers();

        self.store
            .set(
                &plan.result_cache_key,
                &result,
                Some(result.expiration),
                &result.tags,
            )
            .await?;

        Ok(tags)
    }

    /// Bump the hit counter and rewrite the entry with its remaining TTL.
    /// Failures are logged, never propagated.
    pub async fn increment_hits(&self, result_cache_key: &str, result: &mut CachingResult) {
        result.hit_count += 1;

        let remaining = result.remaining_ttl();
        if let Err(e) = self
            .store
            .set(result_cache_key, result, Some(remaining), &result.tags)
            .await
        {
            tracing::error!(
                cache_key = result_cache_key,
                error = %e,
                "increase query result hit times failed"
            );
        }
    }
}
