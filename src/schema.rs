//! Immutable snapshots of the upstream GraphQL type system.
//!
//! A [`Schema`] is built once from SDL text and identified by a 64-bit
//! content hash. Cached query results carry that hash as a tag, so swapping
//! in a new snapshot logically invalidates everything issued under the old
//! one. Snapshots are immutable; everything that walks a request carries the
//! snapshot behind an `Arc` and results reference it only by hash.
//!
//! The [`SchemaRegistry`] is the seam the (external) introspection fetcher
//! plugs into: it holds the current snapshot and notifies subscribers when a
//! snapshot with a different hash is installed.

use crate::error::{Error, Result};
use async_graphql_parser::types::{BaseType, TypeKind, TypeSystemDefinition};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// Resolved information about a single object or interface field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// The field's type without list/non-null wrappers, e.g. `User`
    pub base_type: String,
    /// The field's full type as written, e.g. `[User!]!`
    pub type_repr: String,
    /// Argument name to full argument type, e.g. `id` -> `Int!`
    pub arguments: HashMap<String, String>,
}

/// An immutable snapshot of the upstream schema.
///
/// Indexes `(type, field)` pairs so request walkers can resolve the
/// enclosing type of every selection without re-reading the SDL.
#[derive(Debug)]
pub struct Schema {
    hash: u64,
    query_type: String,
    mutation_type: String,
    subscription_type: String,
    fields: HashMap<(String, String), FieldInfo>,
}

impl Schema {
    /// Parse SDL text into a snapshot.
    ///
    /// The content hash is computed over the raw SDL bytes, so any textual
    /// change to the upstream schema produces a new hash.
    pub fn parse(sdl: &str) -> Result<Self> {
        let document =
            async_graphql_parser::parse_schema(sdl).map_err(|e| Error::Parse(e.to_string()))?;

        let mut fields = HashMap::new();
        let mut query_type = None;
        let mut mutation_type = None;
        let mut subscription_type = None;

        for definition in document.definitions {
            match definition {
                TypeSystemDefinition::Schema(schema_def) => {
                    if let Some(query) = schema_def.node.query {
                        query_type = Some(query.node.to_string());
                    }
                    if let Some(mutation) = schema_def.node.mutation {
                        mutation_type = Some(mutation.node.to_string());
                    }
                    if let Some(subscription) = schema_def.node.subscription {
                        subscription_type = Some(subscription.node.to_string());
                    }
                }
                TypeSystemDefinition::Directive(_) => {}
                TypeSystemDefinition::Type(typedef) => {
                    let type_name = typedef.node.name.node.as_str();

                    let type_fields = match &typedef.node.kind {
                        TypeKind::Object(obj) => &obj.fields,
                        TypeKind::Interface(iface) => &iface.fields,
                        // Scalars, enums, unions and input objects carry no
                        // response-walkable fields.
                        _ => continue,
                    };

                    for field in type_fields {
                        let mut arguments = HashMap::new();
                        for argument in &field.node.arguments {
                            arguments.insert(
                                argument.node.name.node.to_string(),
                                argument.node.ty.node.to_string(),
                            );
                        }

                        fields.insert(
                            (type_name.to_string(), field.node.name.node.to_string()),
                            FieldInfo {
                                base_type: base_type_name(&field.node.ty.node.base),
                                type_repr: field.node.ty.node.to_string(),
                                arguments,
                            },
                        );
                    }
                }
            }
        }

        Ok(Self {
            hash: xxh64(sdl.as_bytes(), 0),
            query_type: query_type.unwrap_or_else(|| "Query".to_string()),
            mutation_type: mutation_type.unwrap_or_else(|| "Mutation".to_string()),
            subscription_type: subscription_type.unwrap_or_else(|| "Subscription".to_string()),
            fields,
        })
    }

    /// The 64-bit content hash identifying this snapshot.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Name of the query root type.
    pub fn query_type_name(&self) -> &str {
        &self.query_type
    }

    /// Name of the mutation root type.
    pub fn mutation_type_name(&self) -> &str {
        &self.mutation_type
    }

    /// Name of the subscription root type.
    pub fn subscription_type_name(&self) -> &str {
        &self.subscription_type
    }

    /// Whether the given type is the query or mutation root.
    pub fn is_root_type(&self, type_name: &str) -> bool {
        type_name == self.query_type || type_name == self.mutation_type
    }

    /// Look up a field on a type.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldInfo> {
        self.fields
            .get(&(type_name.to_string(), field_name.to_string()))
    }

    /// The unwrapped type a field resolves to, e.g. `User` for `[User!]!`.
    pub fn field_base_type(&self, type_name: &str, field_name: &str) -> Option<&str> {
        self.field(type_name, field_name)
            .map(|f| f.base_type.as_str())
    }

    /// The declared type of a field argument, e.g. `Int!`.
    pub fn argument_type(&self, type_name: &str, field_name: &str, arg: &str) -> Option<&str> {
        self.field(type_name, field_name)
            .and_then(|f| f.arguments.get(arg))
            .map(|s| s.as_str())
    }
}

fn base_type_name(ty: &BaseType) -> String {
    match ty {
        BaseType::Named(name) => name.to_string(),
        BaseType::List(inner) => base_type_name(&inner.base),
    }
}

/// Source of the current schema snapshot.
pub trait SchemaProvider: Send + Sync {
    /// The snapshot requests should be planned and tagged against.
    fn current(&self) -> Arc<Schema>;
}

type ChangeCallback = Box<dyn Fn(&Schema, &Schema) + Send + Sync>;

/// Holds the current schema snapshot and change subscriptions.
///
/// The introspection fetcher calls [`SchemaRegistry::install`] whenever it
/// observes a new upstream schema; subscribers (the invalidator) receive the
/// old and new snapshots and purge entries tagged with the old hash.
pub struct SchemaRegistry {
    current: RwLock<Arc<Schema>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

/// Shared reference to the schema registry.
pub type SharedSchemaRegistry = Arc<SchemaRegistry>;

impl SchemaRegistry {
    /// Create a registry seeded with an initial snapshot.
    pub fn new(initial: Schema) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Create a shared registry.
    pub fn shared(initial: Schema) -> SharedSchemaRegistry {
        Arc::new(Self::new(initial))
    }

    /// Atomically replace the current snapshot.
    ///
    /// Returns the previous snapshot. Change callbacks fire only when the
    /// content hash actually changed.
    pub fn install(&self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, schema.clone())
        };

        if previous.hash() != schema.hash() {
            tracing::info!(
                old_hash = previous.hash(),
                new_hash = schema.hash(),
                "schema snapshot replaced"
            );
            for callback in self.callbacks.read().iter() {
                callback(&previous, &schema);
            }
        }

        previous
    }

    /// Subscribe to schema changes. The callback receives (old, new).
    pub fn on_schema_changed<F>(&self, callback: F)
    where
        F: Fn(&Schema, &Schema) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }
}

impl SchemaProvider for SchemaRegistry {
    fn current(&self) -> Arc<Schema> {
        self.current.read().clone()
    }
}
