//! Invalidation tags and response analysis.
//!
//! Every cached query result carries a set of string tags derived from the
//! operation and its response payload: the schema hash, the operation name,
//! every visited type and `(type, field)` pair, and a `key:` tag for every
//! entity key value found in the response. Purging any one of those tags
//! deletes the entry.
//!
//! The analyzer walks the normalized operation's selection set and the
//! response `data` object in parallel: selections provide the enclosing
//! schema types, the payload provides the key values.

use crate::config::TypeKeys;
use crate::error::{Error, Result};
use crate::normalize::NormalizedRequest;
use crate::schema::Schema;
use async_graphql_parser::types::{Selection, SelectionSet};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// Prefix of schema hash tags: `schema:<hash>`.
pub const TAG_SCHEMA_PREFIX: &str = "schema:";
/// Prefix of type tags: `type:<Name>`.
pub const TAG_TYPE_PREFIX: &str = "type:";
/// Prefix of type field tags: `field:<Type>:<Field>`.
pub const TAG_TYPE_FIELD_PREFIX: &str = "field:";
/// Prefix of type key tags: `key:<Type>:<Field>:<Value>`.
pub const TAG_TYPE_KEY_PREFIX: &str = "key:";
/// Prefix of operation tags: `operation:<Name>`.
pub const TAG_OPERATION_PREFIX: &str = "operation:";

/// `schema:<hash>`
pub fn schema_tag(hash: u64) -> String {
    format!("{TAG_SCHEMA_PREFIX}{hash}")
}

/// `type:<Name>`
pub fn type_tag(name: &str) -> String {
    format!("{TAG_TYPE_PREFIX}{name}")
}

/// `field:<Type>:<Field>`
pub fn type_field_tag(type_name: &str, field_name: &str) -> String {
    format!("{TAG_TYPE_FIELD_PREFIX}{type_name}:{field_name}")
}

/// `key:<Type>:<Field>:<Value>`
pub fn type_key_tag(type_name: &str, field_name: &str, value: &str) -> String {
    format!("{TAG_TYPE_KEY_PREFIX}{type_name}:{field_name}:{value}")
}

/// `operation:<Name>`
pub fn operation_tag(name: &str) -> String {
    format!("{TAG_OPERATION_PREFIX}{name}")
}

/// An ordered set of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: String) {
        self.0.insert(tag);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    /// Tags in sorted order.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Only the `key:` tags.
    pub fn type_keys(&self) -> TagSet {
        self.filter_with_prefix(TAG_TYPE_KEY_PREFIX)
    }

    /// Only the `type:` tags.
    pub fn types(&self) -> TagSet {
        self.filter_with_prefix(TAG_TYPE_PREFIX)
    }

    /// Only the `field:` tags.
    pub fn type_fields(&self) -> TagSet {
        self.filter_with_prefix(TAG_TYPE_FIELD_PREFIX)
    }

    /// Only the `schema:` tags.
    pub fn schema_hashes(&self) -> TagSet {
        self.filter_with_prefix(TAG_SCHEMA_PREFIX)
    }

    /// Only the `operation:` tags.
    pub fn operations(&self) -> TagSet {
        self.filter_with_prefix(TAG_OPERATION_PREFIX)
    }

    /// Tagged types for which no `key:` tag was produced. Surfaced in the
    /// debug headers to make missing entity keys visible.
    pub fn missing_type_keys(&self) -> Vec<String> {
        self.types()
            .iter()
            .map(|tag| tag[TAG_TYPE_PREFIX.len()..].to_string())
            .filter(|type_name| {
                let key_prefix = format!("{TAG_TYPE_KEY_PREFIX}{type_name}:");
                !self.0.iter().any(|t| t.starts_with(&key_prefix))
            })
            .collect()
    }

    fn filter_with_prefix(&self, prefix: &str) -> TagSet {
        TagSet(
            self.0
                .iter()
                .filter(|tag| tag.starts_with(prefix))
                .cloned()
                .collect(),
        )
    }
}

impl FromIterator<String> for TagSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Derives tags from a normalized operation and its response payload.
pub struct TagAnalyzer<'a> {
    schema: &'a Schema,
    type_keys: &'a TypeKeys,
}

impl<'a> TagAnalyzer<'a> {
    pub fn new(schema: &'a Schema, type_keys: &'a TypeKeys) -> Self {
        Self { schema, type_keys }
    }

    /// Analyze a response body against the request it answered.
    ///
    /// `only_types` restricts tagging to the given types (the query root and
    /// mutation root always pass); `None` tags everything. Fields outside
    /// the restriction are still descended so nested in-scope types are
    /// found. Fails when the payload has no non-empty `data` object or a
    /// key field holds a non-scalar value.
    pub fn analyze_result(
        &self,
        request: &NormalizedRequest,
        body: &str,
        only_types: Option<&BTreeSet<String>>,
        tags: &mut TagSet,
    ) -> Result<()> {
        let payload: JsonValue = serde_json::from_str(body)?;
        let data = payload
            .get("data")
            .filter(|d| d.as_object().is_some_and(|m| !m.is_empty()))
            .ok_or(Error::MissingData)?;

        let mut path = Vec::new();
        self.walk(
            &request.selection_set,
            request.root_type_name(self.schema),
            only_types,
            data,
            &mut path,
            tags,
        )?;

        tags.insert(schema_tag(request.schema_hash));
        tags.insert(operation_tag(&request.operation_name));

        Ok(())
    }

    fn walk(
        &self,
        set: &SelectionSet,
        enclosing_type: &str,
        only_types: Option<&BTreeSet<String>>,
        data: &JsonValue,
        path: &mut Vec<String>,
        tags: &mut TagSet,
    ) -> Result<()> {
        for item in &set.items {
            match &item.node {
                Selection::Field(field) => {
                    let field_name = field.node.name.node.as_str();
                    let response_key = field
                        .node
                        .alias
                        .as_ref()
                        .map(|a| a.node.as_str())
                        .unwrap_or(field_name);

                    let in_scope = match only_types {
                        Some(scope) => {
                            self.schema.is_root_type(enclosing_type)
                                || scope.contains(enclosing_type)
                        }
                        None => true,
                    };

                    if in_scope {
                        tags.insert(type_tag(enclosing_type));
                        tags.insert(type_field_tag(enclosing_type, field_name));

                        if self.key_fields(enclosing_type).contains(field_name) {
                            path.push(response_key.to_string());
                            self.collect_type_key_tags(
                                path,
                                data,
                                enclosing_type,
                                field_name,
                                tags,
                            )?;
                            path.pop();
                        }
                    }

                    if !field.node.selection_set.node.items.is_empty() {
                        if let Some(child) =
                            self.schema.field_base_type(enclosing_type, field_name)
                        {
                            let child = child.to_string();
                            path.push(response_key.to_string());
                            self.walk(
                                &field.node.selection_set.node,
                                &child,
                                only_types,
                                data,
                                path,
                                tags,
                            )?;
                            path.pop();
                        }
                    }
                }
                Selection::InlineFragment(inline) => {
                    let inner = inline
                        .node
                        .type_condition
                        .as_ref()
                        .map(|c| c.node.on.node.as_str())
                        .unwrap_or(enclosing_type);
                    self.walk(
                        &inline.node.selection_set.node,
                        inner,
                        only_types,
                        data,
                        path,
                        tags,
                    )?;
                }
                Selection::FragmentSpread(spread) => {
                    return Err(Error::TagAnalysis(format!(
                        "unexpected fragment spread {} in normalized operation",
                        spread.node.fragment_name.node
                    )));
                }
            }
        }

        Ok(())
    }

    fn key_fields(&self, type_name: &str) -> BTreeSet<String> {
        self.type_keys
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| BTreeSet::from(["id".to_string()]))
    }

    /// Descend the response payload along the alias path and emit a key tag
    /// for every scalar occurrence. Lists recurse per element; null or
    /// missing values are tolerated.
    fn collect_type_key_tags(
        &self,
        path: &[String],
        data: &JsonValue,
        type_name: &str,
        field_name: &str,
        tags: &mut TagSet,
    ) -> Result<()> {
        let at = &path[0];

        if path.len() > 1 {
            match data {
                JsonValue::Array(items) => {
                    for item in items {
                        self.collect_type_key_tags(path, item, type_name, field_name, tags)?;
                    }
                }
                JsonValue::Object(map) => {
                    if let Some(item) = map.get(at) {
                        self.collect_type_key_tags(&path[1..], item, type_name, field_name, tags)?;
                    }
                }
                // Field value was null somewhere along the path.
                _ => {}
            }

            return Ok(());
        }

        match data {
            JsonValue::Array(items) => {
                for item in items {
                    self.collect_type_key_tags(path, item, type_name, field_name, tags)?;
                }
            }
            JsonValue::Object(map) => {
                if let Some(value) = map.get(at).filter(|v| !v.is_null()) {
                    tags.insert(type_key_tag(
                        type_name,
                        field_name,
                        &stringify_key_value(value, type_name, field_name)?,
                    ));
                }
            }
            JsonValue::Null => {}
            other => {
                return Err(Error::TagAnalysis(format!(
                    "invalid data type expected map or array map but got {}",
                    json_kind(other)
                )));
            }
        }

        Ok(())
    }
}

fn stringify_key_value(value: &JsonValue, type_name: &str, field_name: &str) -> Result<String> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Ok(u.to_string())
            } else {
                // Fractional keys are truncated toward zero.
                Ok((n.as_f64().unwrap_or_default() as i64).to_string())
            }
        }
        other => Err(Error::TagAnalysis(format!(
            "invalid type key of {type_name}.{field_name} only accept string or numeric but got: {}",
            json_kind(other)
        ))),
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
