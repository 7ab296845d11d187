//! Stale-while-revalidate scheduling.
//!
//! A stale hit answers the client from cache immediately and refreshes the
//! entry in the background. The [`SwrGate`] enforces at most one in-flight
//! refresh per result key: the permit is taken before the task is spawned
//! and released on drop, whether the refresh stored, failed, or was
//! cancelled. Stale hits that lose the race simply serve the existing
//! entry; a failed refresh leaves the entry for the next stale hit to
//! retry.

use crate::error::{Error, Result};
use crate::normalize::NormalizedRequest;
use crate::origin::{OriginRequest, SharedOriginCaller};
use crate::plan::CachingPlan;
use crate::result::ResultCache;
use crate::schema::Schema;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Single-flight gate keyed by result cache key.
#[derive(Clone, Default)]
pub struct SwrGate {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SwrGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the refresh slot for a key. Returns `None` when a refresh for
    /// that key is already running.
    pub fn try_acquire(&self, key: &str) -> Option<SwrPermit> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.insert(key.to_string()) {
            Some(SwrPermit {
                key: key.to_string(),
                in_flight: Arc::clone(&self.in_flight),
            })
        } else {
            None
        }
    }

    /// Number of refreshes currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Exclusive right to refresh one result key. Released on drop.
pub struct SwrPermit {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SwrPermit {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Replay the request against the origin and replace the cached entry.
///
/// The response must be `200 OK application/json`; anything else is an
/// error and leaves the existing entry untouched.
pub(crate) async fn refresh_stale_result(
    origin: SharedOriginCaller,
    result_cache: Arc<ResultCache>,
    schema: Arc<Schema>,
    request: NormalizedRequest,
    origin_request: OriginRequest,
    plan: CachingPlan,
    permit: SwrPermit,
) -> Result<()> {
    let _permit = permit;

    let response = origin.forward(&origin_request).await?;

    if !response.is_cacheable_payload() {
        return Err(Error::Internal(format!(
            "getting invalid response from upstream, status: {}, content-type: {}",
            response.status,
            response.header("content-type").unwrap_or_default(),
        )));
    }

    let body = response
        .body_text()
        .ok_or_else(|| Error::Internal("origin response body is not valid utf-8".to_string()))?;

    result_cache
        .store_result(&schema, &request, &plan, body, response.headers.clone())
        .await?;

    Ok(())
}
