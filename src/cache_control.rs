//! Request `Cache-Control` directive parsing.
//!
//! Only the request directives the cache layer honors (RFC 7234 §5.2.1) are
//! extracted: `no-store`, `no-cache`, `max-age`, `max-stale`, `min-fresh`.
//! Unknown directives and malformed values are ignored, matching the
//! tolerant behavior expected of shared caches.

use std::time::Duration;

/// Parsed request cache-control directives.
///
/// `max_stale_set` distinguishes `max-stale` (unbounded permission to accept
/// stale responses) from `max-stale=<delta>` (bounded permission); both set
/// the flag, only the latter sets the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<Duration>,
    pub max_stale_set: bool,
    pub max_stale: Option<Duration>,
    pub min_fresh: Option<Duration>,
}

impl RequestCacheControl {
    /// Parse a `Cache-Control` request header value. `None` yields the
    /// default (no directives), which admits any entry.
    pub fn parse(header: Option<&str>) -> Self {
        let mut cc = Self::default();
        let Some(header) = header else {
            return cc;
        };

        for directive in header.split(',') {
            let directive = directive.trim();
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "max-age" => cc.max_age = value.and_then(parse_seconds),
                "min-fresh" => cc.min_fresh = value.and_then(parse_seconds),
                "max-stale" => {
                    cc.max_stale_set = true;
                    cc.max_stale = value.and_then(parse_seconds);
                }
                _ => {}
            }
        }

        cc
    }

    /// Whether any directive was present at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}
