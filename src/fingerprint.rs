//! Cache key fingerprints.
//!
//! Two keys identify cached state: the plan key, derived from the schema
//! hash plus the canonical request, and the result key, derived from the
//! plan key plus the request's vary-contributing header and cookie values.
//! All iteration is in sorted name order so the same logical request always
//! produces the same key.

use crate::error::{Error, Result};
use crate::rules::CachingVaries;
use http::HeaderMap;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use xxhash_rust::xxh64::Xxh64;

/// Prefix of plan cache keys.
pub const PLAN_KEY_PREFIX: &str = "gbox_cp_";

/// Prefix of query result cache keys.
pub const RESULT_KEY_PREFIX: &str = "gbox_cqr_";

/// Key under which a request's caching plan is stored.
pub fn plan_cache_key(
    schema_hash: u64,
    canonical_query: &str,
    variables: &JsonValue,
) -> Result<String> {
    let mut hasher = Xxh64::new(0);
    hasher.update(schema_hash.to_string().as_bytes());
    hasher.update(b";");
    hasher.update(canonical_query.as_bytes());
    hasher.update(b";");
    hasher.update(serde_json::to_string(variables)?.as_bytes());

    Ok(format!("{PLAN_KEY_PREFIX}{}", hasher.digest()))
}

/// Key under which a query result is stored.
///
/// Extends the plan key with `header:<name>=<value>;` and
/// `cookie:<name>=<value>;` pairs for every name the plan's varies list,
/// in sorted vary/name order. Missing headers and cookies contribute empty
/// values, so their absence is itself part of the key.
pub fn result_cache_key(
    plan_key: &str,
    vary_names: &BTreeSet<String>,
    varies: &CachingVaries,
    headers: &HeaderMap,
) -> Result<String> {
    let mut hasher = Xxh64::new(0);
    hasher.update(plan_key.as_bytes());
    hasher.update(b";");

    for name in vary_names {
        let vary = varies.get(name).ok_or_else(|| {
            Error::Config(format!(
                "setting of vary {name} does not exist in varies list given"
            ))
        })?;

        for header in &vary.headers {
            let value = headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            hasher.update(format!("header:{header}={value};").as_bytes());
        }

        for cookie in &vary.cookies {
            let value = cookie_value(headers, cookie).unwrap_or_default();
            hasher.update(format!("cookie:{cookie}={value};").as_bytes());
        }
    }

    Ok(format!("{RESULT_KEY_PREFIX}{}", hasher.digest()))
}

/// Look up a cookie value across all `cookie` request headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(http::header::COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };
        for pair in header.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.trim() == name {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}
