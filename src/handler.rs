//! Request handling.
//!
//! [`CachingHandler`] orchestrates the full query flow — plan, lookup,
//! hit/miss/pass resolution, response recording — and the mutation flow
//! with auto-invalidation. Clients are answered through a [`ResponseSink`];
//! the origin is reached through an [`OriginCaller`]; everything that must
//! survive the request (storage after a miss, SWR refreshes, purges) runs
//! on the process-scoped background context.
//!
//! Query state machine:
//!
//! ```text
//! INIT -> PLAN -> LOOKUP -> {HIT_FRESH | HIT_STALE | MISS | PASS}
//! HIT_FRESH -> WRITE_CLIENT -> END
//! HIT_STALE -> WRITE_CLIENT -> SCHEDULE_SWR -> END
//! MISS      -> FORWARD -> BUFFER -> WRITE_CLIENT -> SCHEDULE_STORE -> END
//! PASS      -> FORWARD_DIRECT -> END
//! ```

use crate::background::BackgroundTasks;
use crate::cache_control::RequestCacheControl;
use crate::config::{CachingConfig, SharedCachingConfig};
use crate::error::{Error, Result};
use crate::invalidate::{Purger, SharedPurger};
use crate::metrics::{CacheMetrics, RequestTimer};
use crate::normalize::{normalize, NormalizedRequest, RawRequest};
use crate::origin::{OriginRequest, ResponseSink, SharedOriginCaller};
use crate::plan::{CachingPlan, Planner};
use crate::result::{CachingResult, ResultCache, ResultStatus};
use crate::schema::{Schema, SchemaProvider};
use crate::store::{CachingStore, SharedCachingStore};
use crate::swr::{self, SwrGate};
use crate::tags::{TagAnalyzer, TagSet};
use async_graphql_parser::types::OperationType;
use http::HeaderMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// How a request was resolved against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingStatus {
    Hit,
    Miss,
    Pass,
}

impl CachingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachingStatus::Hit => "HIT",
            CachingStatus::Miss => "MISS",
            CachingStatus::Pass => "PASS",
        }
    }
}

impl fmt::Display for CachingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GraphQL HTTP request as received from the client.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// The JSON request body, forwarded verbatim to the origin.
    pub payload: String,
    pub headers: HeaderMap,
}

impl ClientRequest {
    pub fn new(payload: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            payload: payload.into(),
            headers,
        }
    }

    fn cache_control(&self) -> RequestCacheControl {
        RequestCacheControl::parse(
            self.headers
                .get(http::header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
        )
    }
}

/// The caching engine's request orchestrator.
pub struct CachingHandler {
    config: SharedCachingConfig,
    store: SharedCachingStore,
    schemas: Arc<dyn SchemaProvider>,
    origin: SharedOriginCaller,
    planner: Planner,
    result_cache: Arc<ResultCache>,
    purger: SharedPurger,
    swr_gate: SwrGate,
    background: BackgroundTasks,
}

/// Shared reference to the handler.
pub type SharedCachingHandler = Arc<CachingHandler>;

impl CachingHandler {
    /// Validate the configuration, open the store named by its DSN, and
    /// build the handler.
    pub async fn new(
        config: CachingConfig,
        schemas: Arc<dyn SchemaProvider>,
        origin: SharedOriginCaller,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CachingStore::connect(&config.store_dsn).await?);
        Ok(Self::with_store(config, store, schemas, origin))
    }

    /// Build the handler around an already opened store.
    pub fn with_store(
        config: CachingConfig,
        store: SharedCachingStore,
        schemas: Arc<dyn SchemaProvider>,
        origin: SharedOriginCaller,
    ) -> Self {
        let config = Arc::new(config);
        let planner = Planner::new(store.clone(), config.clone());
        let result_cache = Arc::new(ResultCache::new(store.clone(), config.type_keys.clone()));
        let purger = Arc::new(Purger::new(store.clone(), schemas.clone()));

        Self {
            config,
            store,
            schemas,
            origin,
            planner,
            result_cache,
            purger,
            swr_gate: SwrGate::new(),
            background: BackgroundTasks::new(),
        }
    }

    /// The purge surface exposed to the admin collaborator.
    pub fn purger(&self) -> &SharedPurger {
        &self.purger
    }

    /// The process-scoped background context.
    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Drain background work and release the store.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "store close failed");
        }
    }

    /// Handle one GraphQL request end to end.
    ///
    /// Validation failures are answered as GraphQL `errors` bodies and
    /// return `Ok`; upstream transport failures propagate to the HTTP
    /// layer as errors.
    pub async fn handle(
        &self,
        request: &ClientRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let payload = match serde_json::from_str::<serde_json::Value>(&request.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return write_graphql_error(
                    sink,
                    &Error::Parse(format!("invalid request payload: {e}")),
                );
            }
        };

        let raw = match RawRequest::from_json(&payload) {
            Ok(raw) => raw,
            Err(e) => return write_graphql_error(sink, &e),
        };

        let schema = self.schemas.current();
        let normalized = match normalize(&raw, &schema) {
            Ok(normalized) => normalized,
            Err(e) if e.is_validation() => return write_graphql_error(sink, &e),
            Err(e) => return Err(e),
        };

        match normalized.operation_type {
            OperationType::Query => self.handle_query(request, normalized, schema, sink).await,
            OperationType::Mutation => {
                self.handle_mutation(request, normalized, schema, sink).await
            }
            OperationType::Subscription => write_graphql_error(
                sink,
                &Error::UnknownOperationType("subscription".to_string()),
            ),
        }
    }

    async fn handle_query(
        &self,
        request: &ClientRequest,
        normalized: NormalizedRequest,
        schema: Arc<Schema>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let _timer = RequestTimer::new("query");
        let cache_control = request.cache_control();

        let plan = self
            .planner
            .plan(&normalized, &schema, &request.headers)
            .await?;

        if plan.passthrough {
            CacheMetrics::global().record_cache_status("pass");

            let response = self.origin.forward(&self.origin_request(request, false)).await?;
            let mut headers = response.headers.clone();
            self.add_caching_headers(&mut headers, CachingStatus::Pass, None, &plan);
            return sink.write_response(response.status, &headers, response.body());
        }

        match self.result_cache.lookup(&plan, &cache_control).await {
            Some(result) => {
                self.write_hit(request, normalized, schema, plan, result, sink)
                    .await
            }
            None => {
                self.handle_miss(request, normalized, schema, plan, &cache_control, sink)
                    .await
            }
        }
    }

    async fn write_hit(
        &self,
        request: &ClientRequest,
        normalized: NormalizedRequest,
        schema: Arc<Schema>,
        plan: CachingPlan,
        mut result: CachingResult,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        CacheMetrics::global().record_cache_status("hit");

        self.result_cache
            .increment_hits(&plan.result_cache_key, &mut result)
            .await;

        let mut headers = result.headers.clone();
        self.add_caching_headers(&mut headers, CachingStatus::Hit, Some(&result), &plan);

        if self.config.debug_headers {
            let tags: TagSet = result.tags.iter().cloned().collect();
            set_header(
                &mut headers,
                "x-debug-result-cache-key",
                plan.result_cache_key.clone(),
            );
            set_header(&mut headers, "x-debug-result-tags", result.tags.join(", "));
            set_header(
                &mut headers,
                "x-debug-result-missing-type-keys",
                tags.missing_type_keys().join(", "),
            );
        }

        sink.write_response(200, &headers, result.body.as_bytes())?;

        if result.status() != ResultStatus::Stale {
            return Ok(());
        }

        // Stale hit: refresh in the background, at most once per key.
        let Some(permit) = self.swr_gate.try_acquire(&plan.result_cache_key) else {
            CacheMetrics::global().record_swr_refresh("skipped");
            return Ok(());
        };

        let origin = self.origin.clone();
        let result_cache = self.result_cache.clone();
        let origin_request = self.origin_request(request, true);
        let cache_key = plan.result_cache_key.clone();

        self.background.spawn("swr-refresh", async move {
            let outcome = swr::refresh_stale_result(
                origin,
                result_cache,
                schema,
                normalized,
                origin_request,
                plan,
                permit,
            )
            .await;

            match &outcome {
                Ok(()) => {
                    CacheMetrics::global().record_swr_refresh("stored");
                    info!(cache_key = %cache_key, "swr query result successful");
                }
                Err(e) => {
                    CacheMetrics::global().record_swr_refresh("failed");
                    info!(cache_key = %cache_key, error = %e, "swr failed, can not update query result");
                }
            }

            outcome
        });

        Ok(())
    }

    async fn handle_miss(
        &self,
        request: &ClientRequest,
        normalized: NormalizedRequest,
        schema: Arc<Schema>,
        plan: CachingPlan,
        cache_control: &RequestCacheControl,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        CacheMetrics::global().record_cache_status("miss");

        let response = self.origin.forward(&self.origin_request(request, true)).await?;
        let should_store = response.is_cacheable_payload() && !cache_control.no_store;

        let mut headers = response.headers.clone();
        self.add_caching_headers(&mut headers, CachingStatus::Miss, None, &plan);
        if self.config.debug_headers {
            set_header(
                &mut headers,
                "x-debug-result-cache-key",
                plan.result_cache_key.clone(),
            );
        }
        sink.write_response(response.status, &headers, response.body())?;

        if !should_store {
            return Ok(());
        }
        let Some(body) = response.body_text().map(str::to_string) else {
            return Ok(());
        };

        // Persist after the client write, detached from the request so a
        // disconnect cannot cancel it.
        let result_cache = self.result_cache.clone();
        let response_headers = response.headers.clone();
        let cache_key = plan.result_cache_key.clone();

        self.background.spawn("store-query-result", async move {
            match result_cache
                .store_result(&schema, &normalized, &plan, &body, response_headers)
                .await
            {
                Ok(_) => {
                    info!(cache_key = %cache_key, "caching query result successful");
                }
                Err(e) => {
                    info!(error = %e, "fail to cache query result");
                }
            }
            Ok(())
        });

        Ok(())
    }

    async fn handle_mutation(
        &self,
        request: &ClientRequest,
        normalized: NormalizedRequest,
        schema: Arc<Schema>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let _timer = RequestTimer::new("mutation");

        let response = self
            .origin
            .forward(&self.origin_request(request, self.config.auto_invalidate))
            .await?;

        if !self.config.auto_invalidate || !response.is_cacheable_payload() {
            return sink.write_response(response.status, &response.headers, response.body());
        }
        let Some(body) = response.body_text().map(str::to_string) else {
            return sink.write_response(response.status, &response.headers, response.body());
        };

        // With debug headers on, the purge tags are computed inline so the
        // client can observe them; the purge itself still runs detached.
        let mut precomputed: Option<TagSet> = None;
        if self.config.debug_headers {
            let mut found = TagSet::new();
            match TagAnalyzer::new(&schema, &self.config.type_keys).analyze_result(
                &normalized,
                &body,
                None,
                &mut found,
            ) {
                Ok(()) => precomputed = Some(found.type_keys()),
                Err(e) => info!(error = %e, "fail to analyze mutation result"),
            }
        }

        let mut headers = response.headers.clone();
        if let Some(purging) = &precomputed {
            set_header(
                &mut headers,
                "x-debug-purging-tags",
                purging.to_vec().join("; "),
            );
        }
        sink.write_response(response.status, &headers, response.body())?;

        let purger = self.purger.clone();
        let type_keys = self.config.type_keys.clone();

        self.background.spawn("mutation-purge", async move {
            let outcome = match precomputed {
                Some(purging) => {
                    if !purging.is_empty() {
                        CacheMetrics::global().record_invalidation("mutation");
                    }
                    purger.purge_tags(&purging.to_vec()).await
                }
                None => purger
                    .purge_by_mutation_result(&schema, &type_keys, &normalized, &body)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = outcome {
                info!(error = %e, "fail to purge query result");
            }
            Ok(())
        });

        Ok(())
    }

    /// Headers for the forwarded request. Cacheable paths drop
    /// `accept-encoding` so the recorded body is identity-encoded JSON;
    /// passthrough requests go upstream untouched.
    fn origin_request(&self, request: &ClientRequest, strip_accept_encoding: bool) -> OriginRequest {
        let mut headers = request.headers.clone();
        headers.remove(http::header::HOST);
        headers.remove(http::header::CONTENT_LENGTH);
        if strip_accept_encoding {
            headers.remove(http::header::ACCEPT_ENCODING);
        }

        OriginRequest {
            payload: request.payload.clone(),
            headers,
        }
    }

    fn add_caching_headers(
        &self,
        headers: &mut Vec<(String, String)>,
        status: CachingStatus,
        result: Option<&CachingResult>,
        plan: &CachingPlan,
    ) {
        set_header(headers, "x-cache", status.to_string());

        if status == CachingStatus::Pass {
            return;
        }

        let mut unique_varies = BTreeSet::new();
        for name in &plan.vary_names {
            if let Some(vary) = self.config.varies.get(name) {
                for header in &vary.headers {
                    unique_varies.insert(header.clone());
                }
                for cookie in &vary.cookies {
                    unique_varies.insert(format!("cookie:{cookie}"));
                }
            }
        }
        for vary in unique_varies {
            headers.push(("vary".to_string(), vary));
        }

        if status == CachingStatus::Hit {
            let result = match result {
                Some(result) => result,
                None => return,
            };

            let mut cache_control = vec!["public".to_string()];
            if let Some(max_age) = result.max_age {
                cache_control.push(format!("s-maxage={}", max_age.as_secs()));
            }
            match result.swr {
                Some(swr) if !swr.is_zero() => {
                    cache_control.push(format!("stale-while-revalidate={}", swr.as_secs()));
                }
                _ => {}
            }

            set_header(headers, "age", result.age().as_secs().to_string());
            set_header(headers, "cache-control", cache_control.join(", "));
            set_header(headers, "x-cache-hits", result.hit_count.to_string());
        }
    }
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value));
}

fn write_graphql_error(sink: &mut dyn ResponseSink, error: &Error) -> Result<()> {
    let body = serde_json::to_vec(&error.to_graphql_body())?;
    sink.write_response(
        200,
        &[("content-type".to_string(), "application/json".to_string())],
        &body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{BufferPool, BufferedSink, OriginCaller, OriginResponse};
    use crate::rules::{CachingRule, CachingVary};
    use crate::schema::SchemaRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SDL: &str = "type Query { users: [User!]! }\n\
        type Mutation { updateUsers: [User!]! }\n\
        type User { id: Int! name: String! }";

    const USERS_BODY: &str =
        r#"{"data":{"users":[{"name":"A"},{"name":"B"},{"name":"C"}]}}"#;
    const USERS_WITH_IDS_BODY: &str = r#"{"data":{"users":[{"id":1,"name":"A"},{"id":2,"name":"B"},{"id":3,"name":"C"}]}}"#;
    const UPDATE_USERS_BODY: &str = r#"{"data":{"updateUsers":[{"id":1},{"id":2}]}}"#;

    struct MockOrigin {
        calls: AtomicUsize,
        query_body: String,
        mutation_body: String,
        pool: BufferPool,
    }

    impl MockOrigin {
        fn new(query_body: &str, mutation_body: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                query_body: query_body.to_string(),
                mutation_body: mutation_body.to_string(),
                pool: BufferPool::default(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginCaller for MockOrigin {
        async fn forward(&self, request: &OriginRequest) -> crate::error::Result<OriginResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = if request.payload.contains("mutation") {
                &self.mutation_body
            } else {
                &self.query_body
            };
            Ok(OriginResponse::new(
                200,
                vec![
                    ("content-type".to_string(), "application/json".to_string()),
                    ("date".to_string(), "now".to_string()),
                ],
                body.as_bytes(),
                &self.pool,
            ))
        }
    }

    fn handler(config: CachingConfig, origin: Arc<MockOrigin>) -> CachingHandler {
        let store = Arc::new(CachingStore::in_memory(1 << 20));
        let schemas: Arc<dyn SchemaProvider> =
            Arc::new(SchemaRegistry::new(Schema::parse(SDL).unwrap()));
        CachingHandler::with_store(config, store, schemas, origin)
    }

    fn request(payload: &str) -> ClientRequest {
        ClientRequest::new(payload, HeaderMap::new())
    }

    async fn roundtrip(handler: &CachingHandler, req: &ClientRequest) -> BufferedSink {
        let mut sink = BufferedSink::new();
        handler.handle(req, &mut sink).await.unwrap();
        assert!(sink.written);
        sink
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new().with_rule(
                "users",
                CachingRule::new(Duration::from_secs(300)).for_type("User"),
            ),
            origin.clone(),
        );
        let req = request(r#"{"query":"query Q { users { name } }"}"#);

        let first = roundtrip(&handler, &req).await;
        assert_eq!(first.header("x-cache"), Some("MISS"));
        assert_eq!(first.body_text(), USERS_BODY);

        // Storage runs in the background after the client write.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = roundtrip(&handler, &req).await;
        assert_eq!(second.header("x-cache"), Some("HIT"));
        assert_eq!(second.header("x-cache-hits"), Some("1"));
        assert_eq!(second.header("age"), Some("0"));
        assert_eq!(
            second.header("cache-control"),
            Some("public, s-maxage=300")
        );
        assert_eq!(second.body_text(), USERS_BODY);

        // The stored copy drops the origin's date header.
        assert!(second.header("date").is_none());
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_pass_when_no_rule_matches() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new().with_rule(
                "books",
                CachingRule::new(Duration::from_secs(300)).for_type("Book"),
            ),
            origin.clone(),
        );
        let req = request(r#"{"query":"query Q { users { name } }"}"#);

        for _ in 0..2 {
            let sink = roundtrip(&handler, &req).await;
            assert_eq!(sink.header("x-cache"), Some("PASS"));
            assert_eq!(sink.body_text(), USERS_BODY);
        }
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_debug_headers_list_stored_tags() {
        let origin = MockOrigin::new(USERS_WITH_IDS_BODY, "");
        let handler = handler(
            CachingConfig::new()
                .with_debug_headers(true)
                .with_rule(
                    "users",
                    CachingRule::new(Duration::from_secs(300)).for_type("User"),
                ),
            origin,
        );
        let req = request(r#"{"query":"query Q { users { id name } }"}"#);

        roundtrip(&handler, &req).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hit = roundtrip(&handler, &req).await;
        let schema_hash = Schema::parse(SDL).unwrap().hash();
        assert_eq!(
            hit.header("x-debug-result-tags"),
            Some(
                format!(
                    "field:Query:users, field:User:id, field:User:name, \
                     key:User:id:1, key:User:id:2, key:User:id:3, \
                     operation:Q, schema:{schema_hash}, type:Query, type:User"
                )
                .as_str()
            )
        );
        // Every tagged type produced a key tag except the query root.
        assert_eq!(hit.header("x-debug-result-missing-type-keys"), Some("Query"));
        assert!(hit
            .header("x-debug-result-cache-key")
            .unwrap()
            .starts_with("gbox_cqr_"));
    }

    #[tokio::test]
    async fn test_mutation_auto_invalidates_matching_entries() {
        let origin = MockOrigin::new(USERS_WITH_IDS_BODY, UPDATE_USERS_BODY);
        let handler = handler(
            CachingConfig::new()
                .with_debug_headers(true)
                .with_rule("all", CachingRule::new(Duration::from_secs(3600))),
            origin.clone(),
        );
        let query = request(r#"{"query":"query Q { users { id name } }"}"#);

        roundtrip(&handler, &query).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            roundtrip(&handler, &query).await.header("x-cache"),
            Some("HIT")
        );

        let mutation = request(r#"{"query":"mutation M { updateUsers { id } }"}"#);
        let response = roundtrip(&handler, &mutation).await;
        assert_eq!(response.body_text(), UPDATE_USERS_BODY);
        assert_eq!(
            response.header("x-debug-purging-tags"),
            Some("key:User:id:1; key:User:id:2")
        );
        // Mutations carry no caching status.
        assert_eq!(response.header("x-cache"), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            roundtrip(&handler, &query).await.header("x-cache"),
            Some("MISS")
        );
    }

    #[tokio::test]
    async fn test_mutation_with_auto_invalidate_disabled() {
        let origin = MockOrigin::new(USERS_WITH_IDS_BODY, UPDATE_USERS_BODY);
        let handler = handler(
            CachingConfig::new()
                .with_auto_invalidate(false)
                .with_rule("all", CachingRule::new(Duration::from_secs(3600))),
            origin.clone(),
        );
        let query = request(r#"{"query":"query Q { users { id name } }"}"#);

        roundtrip(&handler, &query).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mutation = request(r#"{"query":"mutation M { updateUsers { id } }"}"#);
        roundtrip(&handler, &mutation).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            roundtrip(&handler, &query).await.header("x-cache"),
            Some("HIT")
        );
    }

    #[tokio::test]
    async fn test_swr_refreshes_stale_entry_once() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new().with_rule(
                "users",
                CachingRule::new(Duration::from_millis(60))
                    .with_swr(Duration::from_millis(120)),
            ),
            origin.clone(),
        );
        let req = request(r#"{"query":"query Q { users { name } }"}"#);

        // t=0: MISS populates the cache.
        assert_eq!(roundtrip(&handler, &req).await.header("x-cache"), Some("MISS"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fresh HIT.
        let hit = roundtrip(&handler, &req).await;
        assert_eq!(hit.header("x-cache"), Some("HIT"));
        assert_eq!(hit.header("x-cache-hits"), Some("1"));

        // Past max-age but inside the SWR window: served stale, refresh
        // scheduled in the background.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let stale = roundtrip(&handler, &req).await;
        assert_eq!(stale.header("x-cache"), Some("HIT"));
        assert_eq!(stale.header("x-cache-hits"), Some("2"));

        // After the refresh lands the entry is fresh again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refreshed = roundtrip(&handler, &req).await;
        assert_eq!(refreshed.header("x-cache"), Some("HIT"));
        assert_eq!(refreshed.header("x-cache-hits"), Some("1"));

        // One miss plus one refresh.
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_store_prevents_persistence() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new().with_rule("all", CachingRule::new(Duration::from_secs(3600))),
            origin.clone(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        let req = ClientRequest::new(r#"{"query":"query Q { users { name } }"}"#, headers);

        for _ in 0..2 {
            let sink = roundtrip(&handler, &req).await;
            assert_eq!(sink.header("x-cache"), Some("MISS"));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_vary_partitions_entries_by_header() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new()
                .with_vary("auth", CachingVary::default().with_header("authorization"))
                .with_rule(
                    "all",
                    CachingRule::new(Duration::from_secs(3600)).with_vary("auth"),
                ),
            origin.clone(),
        );

        let with_auth = |token: &str| {
            let mut headers = HeaderMap::new();
            headers.insert(http::header::AUTHORIZATION, token.parse().unwrap());
            ClientRequest::new(r#"{"query":"query Q { users { name } }"}"#, headers)
        };

        let alice = with_auth("alice");
        let bob = with_auth("bob");

        let miss = roundtrip(&handler, &alice).await;
        assert_eq!(miss.header("x-cache"), Some("MISS"));
        assert_eq!(miss.header("vary"), Some("authorization"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            roundtrip(&handler, &alice).await.header("x-cache"),
            Some("HIT")
        );
        // A different credential is a different cache entry.
        assert_eq!(
            roundtrip(&handler, &bob).await.header("x-cache"),
            Some("MISS")
        );
    }

    #[tokio::test]
    async fn test_validation_errors_answered_as_graphql_errors() {
        let origin = MockOrigin::new(USERS_BODY, "");
        let handler = handler(
            CachingConfig::new().with_rule("all", CachingRule::new(Duration::from_secs(60))),
            origin.clone(),
        );

        let cases = [
            r#"{"query":"query {"}"#,
            r#"{"query":"query A { users { id } } query B { users { name } }"}"#,
            r#"not json"#,
            r#"{"query":"subscription S { users { id } }"}"#,
        ];

        for payload in cases {
            let sink = roundtrip(&handler, &request(payload)).await;
            assert_eq!(sink.status, 200, "payload: {payload}");
            let body: serde_json::Value = serde_json::from_slice(&sink.body).unwrap();
            assert!(body.get("errors").is_some(), "payload: {payload}");
        }

        // Nothing reached the origin.
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_json_origin_response_not_stored() {
        struct HtmlOrigin {
            pool: BufferPool,
        }

        #[async_trait]
        impl OriginCaller for HtmlOrigin {
            async fn forward(
                &self,
                _request: &OriginRequest,
            ) -> crate::error::Result<OriginResponse> {
                Ok(OriginResponse::new(
                    200,
                    vec![("content-type".to_string(), "text/html".to_string())],
                    b"<html></html>",
                    &self.pool,
                ))
            }
        }

        let store = Arc::new(CachingStore::in_memory(1 << 20));
        let schemas: Arc<dyn SchemaProvider> =
            Arc::new(SchemaRegistry::new(Schema::parse(SDL).unwrap()));
        let handler = CachingHandler::with_store(
            CachingConfig::new().with_rule("all", CachingRule::new(Duration::from_secs(60))),
            store,
            schemas,
            Arc::new(HtmlOrigin {
                pool: BufferPool::default(),
            }),
        );

        let req = request(r#"{"query":"query Q { users { name } }"}"#);
        for _ in 0..2 {
            let sink = roundtrip(&handler, &req).await;
            assert_eq!(sink.header("x-cache"), Some("MISS"));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }
}
