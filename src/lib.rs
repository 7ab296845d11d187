//! # graphql-cache-proxy
//!
//! A caching reverse proxy for GraphQL origins with precise, tag-based
//! invalidation driven by the type system.
//!
//! ## Features
//!
//! - **Request Normalization**: one canonical form per logical request —
//!   fragments inlined, literals hoisted into variables, deterministic
//!   printing — so equivalent requests share a cache entry
//! - **Rule-Based Planning**: cacheability, lifetime, varies, and tag scope
//!   decided per request from configured rules, with plan caching
//! - **Tag-Based Invalidation**: every result is indexed under schema,
//!   operation, type, field, and entity-key tags derived from its payload
//! - **Mutation Auto-Invalidation**: successful mutations purge exactly the
//!   entries whose entity keys they touched
//! - **Stale-While-Revalidate**: stale hits answer immediately while a
//!   single-flight background refresh replaces the entry
//! - **Pluggable Stores**: in-process byte-budgeted cache or Redis, chosen
//!   by DSN
//!
//! ## Main Components
//!
//! - [`CachingHandler`]: the request orchestrator (plan, lookup, record).
//! - [`CachingConfig`]: rules, varies, type keys, and behavior flags.
//! - [`SchemaRegistry`]: current schema snapshot plus change notifications.
//! - [`Purger`]: the admin purge surface and mutation invalidator.
//! - [`graphql_router`]: axum adapter exposing `/graphql` and `/metrics`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_cache_proxy::{
//!     graphql_router, CachingConfig, CachingHandler, CachingRule, HttpOrigin, Schema,
//!     SchemaRegistry,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::parse("type Query { users: [User!]! } type User { id: Int! }")?;
//!     let registry = SchemaRegistry::shared(schema);
//!
//!     let config = CachingConfig::new()
//!         .with_rule("users", CachingRule::new(Duration::from_secs(300)).for_type("User"));
//!
//!     let handler = CachingHandler::new(
//!         config,
//!         registry,
//!         Arc::new(HttpOrigin::new("http://localhost:4000/graphql")?),
//!     )
//!     .await?;
//!
//!     let app = graphql_router(Arc::new(handler));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache_control;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod invalidate;
pub mod metrics;
pub mod normalize;
pub mod origin;
pub mod plan;
pub mod result;
pub mod router;
pub mod rules;
pub mod schema;
pub mod store;
pub mod swr;
pub mod tags;

pub use background::BackgroundTasks;
pub use cache_control::RequestCacheControl;
pub use config::{CachingConfig, SharedCachingConfig, TypeKeys, DEFAULT_STORE_DSN};
pub use error::{Error, Result};
pub use handler::{CachingHandler, CachingStatus, ClientRequest, SharedCachingHandler};
pub use invalidate::{purge_on_schema_change, Purger, SharedPurger};
pub use metrics::{CacheMetrics, RequestTimer};
pub use normalize::{normalize, NormalizedRequest, RawRequest};
pub use origin::{
    BufferPool, BufferedSink, HttpOrigin, OriginCaller, OriginRequest, OriginResponse,
    PooledBuffer, ResponseSink, SharedOriginCaller,
};
pub use plan::{CachingPlan, Planner};
pub use result::{CachingResult, ResultCache, ResultStatus};
pub use router::graphql_router;
pub use rules::{CachingRule, CachingRules, CachingVaries, CachingVary, TypeFieldMap};
pub use schema::{Schema, SchemaProvider, SchemaRegistry, SharedSchemaRegistry};
pub use store::{CachingStore, MemoryStore, RedisStore, SharedCachingStore, StoreBackend};
pub use swr::{SwrGate, SwrPermit};
pub use tags::{TagAnalyzer, TagSet};
