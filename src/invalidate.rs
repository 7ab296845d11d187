//! Cache invalidation.
//!
//! Three triggers purge cached query results: mutation responses whose key
//! tags match cached entries, admin purge commands, and schema snapshot
//! changes. Invalidation is applied tag by tag; a failing tag is logged
//! and the remaining tags still run, with the failures aggregated into one
//! error at the end.

use crate::background::BackgroundTasks;
use crate::config::TypeKeys;
use crate::error::{Error, Result};
use crate::normalize::NormalizedRequest;
use crate::schema::{Schema, SchemaProvider, SchemaRegistry};
use crate::store::SharedCachingStore;
use crate::tags::{self, TagAnalyzer, TagSet};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Purges cached query results by tag.
pub struct Purger {
    store: SharedCachingStore,
    schemas: Arc<dyn SchemaProvider>,
}

/// Shared reference to the purger.
pub type SharedPurger = Arc<Purger>;

impl Purger {
    pub fn new(store: SharedCachingStore, schemas: Arc<dyn SchemaProvider>) -> Self {
        Self { store, schemas }
    }

    /// Analyze a successful mutation response and purge every cached entry
    /// carrying one of its `key:` tags. Mutations without key tags purge
    /// nothing. Returns the purge tags for debug reporting.
    pub async fn purge_by_mutation_result(
        &self,
        schema: &Schema,
        type_keys: &TypeKeys,
        request: &NormalizedRequest,
        body: &str,
    ) -> Result<TagSet> {
        let mut found = TagSet::new();
        TagAnalyzer::new(schema, type_keys).analyze_result(request, body, None, &mut found)?;

        let purge = found.type_keys();
        if !purge.is_empty() {
            crate::metrics::CacheMetrics::global().record_invalidation("mutation");
        }
        self.purge_tags(&purge.to_vec()).await?;

        Ok(purge)
    }

    /// Purge everything cached under the current schema snapshot.
    pub async fn purge_all(&self) -> Result<bool> {
        let hash = self.schemas.current().hash();
        self.dispatch(vec![tags::schema_tag(hash)]).await
    }

    /// Purge every result produced by the named operation.
    pub async fn purge_operation(&self, name: &str) -> Result<bool> {
        self.dispatch(vec![tags::operation_tag(name)]).await
    }

    /// Purge every result that touched the named type.
    pub async fn purge_type(&self, name: &str) -> Result<bool> {
        self.dispatch(vec![tags::type_tag(name)]).await
    }

    /// Purge every result that selected the named field on the query root.
    pub async fn purge_query_root_field(&self, field: &str) -> Result<bool> {
        let root = self.schemas.current().query_type_name().to_string();
        self.dispatch(vec![tags::type_field_tag(&root, field)]).await
    }

    /// Purge every result keyed by `(type, field, value)`. Only integer and
    /// string values identify entities; other kinds fail with an
    /// unsupported-value error.
    pub async fn purge_type_key(
        &self,
        type_name: &str,
        field_name: &str,
        value: &JsonValue,
    ) -> Result<bool> {
        let value = match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Number(n) if n.as_i64().is_some() || n.as_u64().is_some() => n.to_string(),
            other => {
                return Err(Error::UnsupportedTypeKeyValue(json_kind(other).to_string()));
            }
        };

        self.dispatch(vec![tags::type_key_tag(type_name, field_name, &value)])
            .await
    }

    /// Purge everything tagged with a schema hash. Runs when a snapshot is
    /// replaced.
    pub async fn purge_schema_hash(&self, hash: u64) -> Result<()> {
        crate::metrics::CacheMetrics::global().record_invalidation("schema");
        self.purge_tags(&[tags::schema_tag(hash)]).await
    }

    /// Invalidate each tag in turn, aggregating per-tag failures.
    pub async fn purge_tags(&self, tags: &[String]) -> Result<()> {
        debug!(?tags, "purging query result by tags");

        // The store stops a multi-tag invalidate on its first error, so
        // tags are invalidated one at a time.
        let mut failed = Vec::new();
        for tag in tags {
            if let Err(e) = self.store.invalidate_by_tag(tag).await {
                warn!(tag, error = %e, "tag invalidation failed");
                failed.push(tag.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalidation(failed))
        }
    }

    /// Admin dispatch: per-tag failures are logged but the command still
    /// reports success.
    async fn dispatch(&self, tags: Vec<String>) -> Result<bool> {
        crate::metrics::CacheMetrics::global().record_invalidation("admin");
        if let Err(e) = self.purge_tags(&tags).await {
            warn!(error = %e, "purge dispatched with failures");
        }
        Ok(true)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Purge entries tagged with the previous schema hash whenever the
/// registry installs a different snapshot.
pub fn purge_on_schema_change(
    registry: &SchemaRegistry,
    purger: SharedPurger,
    background: BackgroundTasks,
) {
    registry.on_schema_changed(move |old, new| {
        let purger = purger.clone();
        let old_hash = old.hash();
        debug!(old_hash, new_hash = new.hash(), "scheduling purge of outdated schema entries");
        background.spawn("schema-change-purge", async move {
            purger.purge_schema_hash(old_hash).await
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, RawRequest};
    use crate::store::{CachingStore, StoreBackend};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Marker {
        value: u32,
    }

    const SDL: &str = "type Query { users: [User!]! }\n\
        type Mutation { updateUsers: [User!]! }\n\
        type User { id: Int! name: String! }";

    fn fixture() -> (SharedCachingStore, Purger) {
        let store = Arc::new(CachingStore::in_memory(1 << 20));
        let registry: Arc<dyn SchemaProvider> =
            Arc::new(SchemaRegistry::new(Schema::parse(SDL).unwrap()));
        let purger = Purger::new(store.clone(), registry);
        (store, purger)
    }

    async fn seed(store: &CachingStore, key: &str, tag: String) {
        store
            .set(key, &Marker { value: 1 }, None, &[tag])
            .await
            .unwrap();
        assert!(store.get::<Marker>(key).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_by_operation_name() {
        let (store, purger) = fixture();
        seed(&store, "entry", tags::operation_tag("GetUsers")).await;

        assert!(purger.purge_operation("GetUsers").await.unwrap());
        assert!(store.get::<Marker>("entry").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_by_type_name() {
        let (store, purger) = fixture();
        seed(&store, "entry", tags::type_tag("User")).await;

        assert!(purger.purge_type("User").await.unwrap());
        assert!(store.get::<Marker>("entry").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_by_query_root_field() {
        let (store, purger) = fixture();
        seed(&store, "entry", tags::type_field_tag("Query", "users")).await;

        assert!(purger.purge_query_root_field("users").await.unwrap());
        assert!(store.get::<Marker>("entry").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_all_uses_current_schema_hash() {
        let (store, purger) = fixture();
        let hash = Schema::parse(SDL).unwrap().hash();
        seed(&store, "entry", tags::schema_tag(hash)).await;

        assert!(purger.purge_all().await.unwrap());
        assert!(store.get::<Marker>("entry").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_by_type_key_values() {
        let (store, purger) = fixture();
        seed(&store, "by_int", tags::type_key_tag("User", "id", "3")).await;
        seed(&store, "by_string", tags::type_key_tag("User", "id", "abc")).await;

        assert!(purger
            .purge_type_key("User", "id", &serde_json::json!(3))
            .await
            .unwrap());
        assert!(purger
            .purge_type_key("User", "id", &serde_json::json!("abc"))
            .await
            .unwrap());

        assert!(store.get::<Marker>("by_int").await.is_none());
        assert!(store.get::<Marker>("by_string").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_by_type_key_rejects_other_kinds() {
        let (_store, purger) = fixture();

        for value in [
            serde_json::json!(true),
            serde_json::json!(1.5),
            serde_json::json!([1]),
            serde_json::json!({"id": 1}),
            serde_json::json!(null),
        ] {
            let err = purger
                .purge_type_key("User", "id", &value)
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedTypeKeyValue(_)),
                "value: {value}"
            );
        }
    }

    #[tokio::test]
    async fn test_mutation_purge_removes_matching_keys_only() {
        let (store, purger) = fixture();
        let schema = Schema::parse(SDL).unwrap();

        seed(&store, "user_1", tags::type_key_tag("User", "id", "1")).await;
        seed(&store, "user_9", tags::type_key_tag("User", "id", "9")).await;

        let mutation = normalize(
            &RawRequest {
                query: "mutation M { updateUsers { id } }".to_string(),
                operation_name: None,
                variables: JsonValue::Null,
            },
            &schema,
        )
        .unwrap();

        let purged = purger
            .purge_by_mutation_result(
                &schema,
                &TypeKeys::new(),
                &mutation,
                r#"{"data":{"updateUsers":[{"id":1},{"id":2}]}}"#,
            )
            .await
            .unwrap();

        assert_eq!(
            purged.to_vec(),
            vec!["key:User:id:1".to_string(), "key:User:id:2".to_string()]
        );
        assert!(store.get::<Marker>("user_1").await.is_none());
        assert!(store.get::<Marker>("user_9").await.is_some());
    }

    #[tokio::test]
    async fn test_mutation_without_key_tags_purges_nothing() {
        let (store, purger) = fixture();
        let schema = Schema::parse(SDL).unwrap();
        seed(&store, "entry", tags::type_key_tag("User", "id", "1")).await;

        let mutation = normalize(
            &RawRequest {
                query: "mutation M { updateUsers { name } }".to_string(),
                operation_name: None,
                variables: JsonValue::Null,
            },
            &schema,
        )
        .unwrap();

        let purged = purger
            .purge_by_mutation_result(
                &schema,
                &TypeKeys::new(),
                &mutation,
                r#"{"data":{"updateUsers":[{"name":"A"}]}}"#,
            )
            .await
            .unwrap();

        assert!(purged.is_empty());
        assert!(store.get::<Marker>("entry").await.is_some());
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl StoreBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<std::time::Duration>,
            _tags: &[String],
        ) -> Result<()> {
            Ok(())
        }

        async fn invalidate_tag(&self, tag: &str) -> Result<()> {
            Err(Error::Store(format!("cannot invalidate {tag}")))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_per_tag_failures_are_aggregated() {
        let store = Arc::new(CachingStore::with_backend(Box::new(FailingBackend)));
        let registry: Arc<dyn SchemaProvider> =
            Arc::new(SchemaRegistry::new(Schema::parse(SDL).unwrap()));
        let purger = Purger::new(store, registry);

        let err = purger
            .purge_tags(&["type:User".to_string(), "type:Book".to_string()])
            .await
            .unwrap_err();

        match err {
            Error::Invalidation(failed) => {
                assert_eq!(failed, vec!["type:User".to_string(), "type:Book".to_string()]);
            }
            other => panic!("expected aggregated invalidation error, got {other}"),
        }

        // Admin dispatch still reports success over the same failure.
        assert!(purger.purge_type("User").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_on_schema_change() {
        let store = Arc::new(CachingStore::in_memory(1 << 20));
        let registry = Arc::new(SchemaRegistry::new(Schema::parse(SDL).unwrap()));
        let purger = Arc::new(Purger::new(
            store.clone(),
            registry.clone() as Arc<dyn SchemaProvider>,
        ));
        let background = BackgroundTasks::new();
        purge_on_schema_change(&registry, purger, background.clone());

        let old_hash = registry.current().hash();
        seed(&store, "old_entry", tags::schema_tag(old_hash)).await;

        let new_schema = Schema::parse("type Query { ping: String! }").unwrap();
        let new_hash = new_schema.hash();
        store
            .set(
                "new_entry",
                &Marker { value: 2 },
                None,
                &[tags::schema_tag(new_hash)],
            )
            .await
            .unwrap();

        registry.install(new_schema);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert!(store.get::<Marker>("old_entry").await.is_none());
        assert!(store.get::<Marker>("new_entry").await.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_never_reports_false_for_tag_failures() {
        let (_store, purger) = fixture();
        // Unknown tags are a no-op, not a failure.
        assert!(purger.purge_operation("ghost").await.unwrap());
    }
}
