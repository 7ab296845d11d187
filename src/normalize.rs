//! Request normalization.
//!
//! Produces the canonical form every fingerprint is derived from: exactly
//! one selected operation, fragment spreads inlined, literal argument
//! values hoisted into generated variables, unused variable definitions
//! removed, and the document re-printed by a deterministic printer.
//!
//! Two requests that normalize to the same canonical text and variables
//! are the same logical request as far as the cache is concerned.

use crate::error::{Error, Result};
use crate::rules::TypeFieldMap;
use crate::schema::Schema;
use async_graphql_parser::types::{
    DocumentOperations, FragmentDefinition, InlineFragment, OperationDefinition, OperationType,
    Selection, SelectionSet, Type, VariableDefinition,
};
use async_graphql_parser::{parse_query, Pos, Positioned};
use async_graphql_value::{Name, Value};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

/// A GraphQL request as received from the client.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: JsonValue,
}

impl RawRequest {
    /// Build a request from a parsed `{"query": ..., "operationName": ...,
    /// "variables": ...}` payload.
    pub fn from_json(payload: &JsonValue) -> Result<Self> {
        let query = payload
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| Error::Parse("request payload has no `query` field".to_string()))?
            .to_string();

        let operation_name = payload
            .get("operationName")
            .and_then(|n| n.as_str())
            .map(|n| n.to_string());

        let variables = payload.get("variables").cloned().unwrap_or(JsonValue::Null);

        Ok(Self {
            query,
            operation_name,
            variables,
        })
    }
}

/// The canonical form of a request.
///
/// `query` is the deterministically printed operation; `variables` holds
/// the client variables that survived pruning plus any extracted literals,
/// keyed in sorted order.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub operation_name: String,
    pub operation_type: OperationType,
    pub query: String,
    pub variables: JsonValue,
    pub schema_hash: u64,
    /// The selected operation's selection set with all fragments inlined.
    /// Tag analysis walks this in lockstep with response payloads.
    pub selection_set: SelectionSet,
}

impl NormalizedRequest {
    /// The schema type the operation's root selection set executes against.
    pub fn root_type_name<'a>(&self, schema: &'a Schema) -> &'a str {
        match self.operation_type {
            OperationType::Query => schema.query_type_name(),
            OperationType::Mutation => schema.mutation_type_name(),
            OperationType::Subscription => schema.subscription_type_name(),
        }
    }

    /// Every `(type, field)` pair the operation references, resolved against
    /// the schema. Rule matching runs over this map.
    pub fn referenced_type_fields(&self, schema: &Schema) -> TypeFieldMap {
        let mut out = TypeFieldMap::new();
        collect_type_fields(
            &self.selection_set,
            self.root_type_name(schema),
            schema,
            &mut out,
        );
        out
    }
}

/// Normalize a raw request against the current schema snapshot.
pub fn normalize(raw: &RawRequest, schema: &Schema) -> Result<NormalizedRequest> {
    let document = parse_query(&raw.query).map_err(|e| Error::Parse(e.to_string()))?;

    let requested_name = raw
        .operation_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    let (operation_name, mut operation) = select_operation(&document.operations, requested_name)?;

    let root_type = match operation.ty {
        OperationType::Query => schema.query_type_name().to_string(),
        OperationType::Mutation => schema.mutation_type_name().to_string(),
        OperationType::Subscription => schema.subscription_type_name().to_string(),
    };

    let mut stack = Vec::new();
    operation.selection_set.node = inline_fragments(
        &operation.selection_set.node,
        &root_type,
        schema,
        &document.fragments,
        &mut stack,
    )?;

    let mut variables = match &raw.variables {
        JsonValue::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };

    extract_literal_arguments(&mut operation, &root_type, schema, &mut variables)?;
    prune_unused_variables(&mut operation, &mut variables);

    let query = print_operation(&operation_name, &operation);

    Ok(NormalizedRequest {
        operation_name,
        operation_type: operation.ty,
        query,
        variables: JsonValue::Object(variables),
        schema_hash: schema.hash(),
        selection_set: operation.selection_set.node.clone(),
    })
}

fn select_operation(
    operations: &DocumentOperations,
    requested: Option<&str>,
) -> Result<(String, OperationDefinition)> {
    match (operations, requested) {
        (DocumentOperations::Single(op), None) => Ok((String::new(), op.node.clone())),
        (DocumentOperations::Single(_), Some(name)) => {
            Err(Error::OperationNotFound(name.to_string()))
        }
        (DocumentOperations::Multiple(ops), Some(name)) => ops
            .iter()
            .find(|(op_name, _)| op_name.as_str() == name)
            .map(|(_, op)| (name.to_string(), op.node.clone()))
            .ok_or_else(|| Error::OperationNotFound(name.to_string())),
        (DocumentOperations::Multiple(ops), None) => {
            if ops.len() == 1 {
                let (name, op) = ops.iter().next().expect("len checked");
                Ok((name.to_string(), op.node.clone()))
            } else {
                Err(Error::MissingOperationName)
            }
        }
    }
}

/// Replace every fragment spread with the fragment's selections.
///
/// When the fragment's type condition matches the enclosing type the
/// selections are spliced in directly; otherwise they stay wrapped in an
/// inline fragment carrying the condition. The visiting stack rejects
/// spread cycles.
fn inline_fragments(
    set: &SelectionSet,
    enclosing_type: &str,
    schema: &Schema,
    fragments: &HashMap<Name, Positioned<FragmentDefinition>>,
    stack: &mut Vec<String>,
) -> Result<SelectionSet> {
    let mut items = Vec::with_capacity(set.items.len());

    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                let mut field = field.clone();
                // Fields the schema does not know keep an empty child type,
                // which never matches a condition and so never flattens.
                let child_type = schema
                    .field_base_type(enclosing_type, field.node.name.node.as_str())
                    .unwrap_or_default()
                    .to_string();
                field.node.selection_set.node = inline_fragments(
                    &field.node.selection_set.node,
                    &child_type,
                    schema,
                    fragments,
                    stack,
                )?;
                items.push(Positioned::new(Selection::Field(field), item.pos));
            }
            Selection::InlineFragment(inline) => {
                let mut inline = inline.clone();
                let condition = inline
                    .node
                    .type_condition
                    .as_ref()
                    .map(|c| c.node.on.node.to_string());
                let inner_type = condition.as_deref().unwrap_or(enclosing_type);
                inline.node.selection_set.node = inline_fragments(
                    &inline.node.selection_set.node,
                    inner_type,
                    schema,
                    fragments,
                    stack,
                )?;
                items.push(Positioned::new(Selection::InlineFragment(inline), item.pos));
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.as_str();

                if stack.iter().any(|seen| seen == name) {
                    return Err(Error::Parse(format!(
                        "fragment spread cycle detected at {name}"
                    )));
                }

                let definition = fragments
                    .iter()
                    .find(|(fragment_name, _)| fragment_name.as_str() == name)
                    .map(|(_, definition)| definition)
                    .ok_or_else(|| Error::Parse(format!("fragment {name} is not defined")))?;

                stack.push(name.to_string());
                let condition = definition.node.type_condition.node.on.node.to_string();
                let inlined = inline_fragments(
                    &definition.node.selection_set.node,
                    &condition,
                    schema,
                    fragments,
                    stack,
                )?;
                stack.pop();

                if condition == enclosing_type {
                    items.extend(inlined.items);
                } else {
                    items.push(Positioned::new(
                        Selection::InlineFragment(Positioned::new(
                            InlineFragment {
                                type_condition: Some(definition.node.type_condition.clone()),
                                directives: spread.node.directives.clone(),
                                selection_set: Positioned::new(inlined, item.pos),
                            },
                            item.pos,
                        )),
                        item.pos,
                    ));
                }
            }
        }
    }

    Ok(SelectionSet { items })
}

/// Hoist literal argument values into generated variables (`v0`, `v1`, ...)
/// typed from the schema's argument index. Arguments whose type the schema
/// does not know are left untouched.
fn extract_literal_arguments(
    operation: &mut OperationDefinition,
    root_type: &str,
    schema: &Schema,
    variables: &mut serde_json::Map<String, JsonValue>,
) -> Result<()> {
    let mut taken: HashSet<String> = operation
        .variable_definitions
        .iter()
        .map(|d| d.node.name.node.to_string())
        .collect();
    let mut next_index = 0usize;
    let mut new_definitions = Vec::new();

    extract_from_selection_set(
        &mut operation.selection_set.node,
        Some(root_type.to_string()),
        schema,
        variables,
        &mut taken,
        &mut next_index,
        &mut new_definitions,
    )?;

    operation.variable_definitions.extend(new_definitions);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn extract_from_selection_set(
    set: &mut SelectionSet,
    enclosing_type: Option<String>,
    schema: &Schema,
    variables: &mut serde_json::Map<String, JsonValue>,
    taken: &mut HashSet<String>,
    next_index: &mut usize,
    definitions: &mut Vec<Positioned<VariableDefinition>>,
) -> Result<()> {
    for item in &mut set.items {
        match &mut item.node {
            Selection::Field(field) => {
                let field_name = field.node.name.node.to_string();

                if let Some(parent) = enclosing_type.as_deref() {
                    for (arg_name, arg_value) in &mut field.node.arguments {
                        if matches!(arg_value.node, Value::Variable(_)) {
                            continue;
                        }

                        let Some(type_repr) =
                            schema.argument_type(parent, &field_name, arg_name.node.as_str())
                        else {
                            continue;
                        };
                        let Some(var_type) = Type::new(type_repr) else {
                            continue;
                        };
                        let Some(literal) = arg_value.node.clone().into_const() else {
                            // Lists/objects containing variables stay as
                            // written.
                            continue;
                        };

                        let name = fresh_variable_name(taken, next_index);
                        variables.insert(name.clone(), literal.into_json()?);
                        definitions.push(Positioned::new(
                            VariableDefinition {
                                name: Positioned::new(Name::new(&name), Pos::default()),
                                var_type: Positioned::new(var_type, Pos::default()),
                                directives: Vec::new(),
                                default_value: None,
                            },
                            Pos::default(),
                        ));
                        arg_value.node = Value::Variable(Name::new(&name));
                    }
                }

                let child_type = enclosing_type
                    .as_deref()
                    .and_then(|parent| schema.field_base_type(parent, &field_name))
                    .map(|t| t.to_string());
                extract_from_selection_set(
                    &mut field.node.selection_set.node,
                    child_type,
                    schema,
                    variables,
                    taken,
                    next_index,
                    definitions,
                )?;
            }
            Selection::InlineFragment(inline) => {
                let inner = inline
                    .node
                    .type_condition
                    .as_ref()
                    .map(|c| c.node.on.node.to_string())
                    .or_else(|| enclosing_type.clone());
                extract_from_selection_set(
                    &mut inline.node.selection_set.node,
                    inner,
                    schema,
                    variables,
                    taken,
                    next_index,
                    definitions,
                )?;
            }
            Selection::FragmentSpread(spread) => {
                // Spreads were inlined before extraction runs.
                return Err(Error::Internal(format!(
                    "unexpected fragment spread {} after inlining",
                    spread.node.fragment_name.node
                )));
            }
        }
    }

    Ok(())
}

fn fresh_variable_name(taken: &mut HashSet<String>, next_index: &mut usize) -> String {
    loop {
        let candidate = format!("v{}", *next_index);
        *next_index += 1;
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
}

/// Drop variable definitions (and their values) nothing references.
fn prune_unused_variables(
    operation: &mut OperationDefinition,
    variables: &mut serde_json::Map<String, JsonValue>,
) {
    let mut used = BTreeSet::new();
    collect_used_variables(&operation.selection_set.node, &mut used);
    for directive in &operation.directives {
        for (_, value) in &directive.node.arguments {
            collect_value_variables(&value.node, &mut used);
        }
    }

    operation
        .variable_definitions
        .retain(|d| used.contains(d.node.name.node.as_str()));
    variables.retain(|name, _| used.contains(name.as_str()));
}

fn collect_used_variables(set: &SelectionSet, used: &mut BTreeSet<String>) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                for (_, value) in &field.node.arguments {
                    collect_value_variables(&value.node, used);
                }
                for directive in &field.node.directives {
                    for (_, value) in &directive.node.arguments {
                        collect_value_variables(&value.node, used);
                    }
                }
                collect_used_variables(&field.node.selection_set.node, used);
            }
            Selection::InlineFragment(inline) => {
                for directive in &inline.node.directives {
                    for (_, value) in &directive.node.arguments {
                        collect_value_variables(&value.node, used);
                    }
                }
                collect_used_variables(&inline.node.selection_set.node, used);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn collect_value_variables(value: &Value, used: &mut BTreeSet<String>) {
    match value {
        Value::Variable(name) => {
            used.insert(name.to_string());
        }
        Value::List(items) => {
            for item in items {
                collect_value_variables(item, used);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value_variables(item, used);
            }
        }
        _ => {}
    }
}

fn collect_type_fields(
    set: &SelectionSet,
    enclosing_type: &str,
    schema: &Schema,
    out: &mut TypeFieldMap,
) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                let field_name = field.node.name.node.as_str();
                out.entry(enclosing_type.to_string())
                    .or_default()
                    .insert(field_name.to_string());

                if let Some(child) = schema.field_base_type(enclosing_type, field_name) {
                    // Clone to end the borrow of `out` keys.
                    let child = child.to_string();
                    collect_type_fields(&field.node.selection_set.node, &child, schema, out);
                }
            }
            Selection::InlineFragment(inline) => {
                let inner = inline
                    .node
                    .type_condition
                    .as_ref()
                    .map(|c| c.node.on.node.as_str())
                    .unwrap_or(enclosing_type);
                collect_type_fields(&inline.node.selection_set.node, inner, schema, out);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// Deterministic printer: single spaces, source-order selections, GraphQL
/// literal syntax for values. Identical ASTs print identically.
fn print_operation(name: &str, operation: &OperationDefinition) -> String {
    let mut out = String::new();

    let keyword = match operation.ty {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    };
    out.push_str(keyword);

    if !name.is_empty() {
        let _ = write!(out, " {name}");
    }

    if !operation.variable_definitions.is_empty() {
        out.push_str(" (");
        for (i, def) in operation.variable_definitions.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "${}: {}", def.node.name.node, def.node.var_type.node);
            if let Some(default) = &def.node.default_value {
                let _ = write!(out, " = {}", default.node);
            }
        }
        out.push(')');
    }

    out.push(' ');
    print_selection_set(&operation.selection_set.node, &mut out);
    out
}

fn print_selection_set(set: &SelectionSet, out: &mut String) {
    out.push('{');
    for (i, item) in set.items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match &item.node {
            Selection::Field(field) => {
                if let Some(alias) = &field.node.alias {
                    let _ = write!(out, "{}: ", alias.node);
                }
                out.push_str(field.node.name.node.as_str());

                if !field.node.arguments.is_empty() {
                    out.push('(');
                    for (j, (arg_name, arg_value)) in field.node.arguments.iter().enumerate() {
                        if j > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{}: {}", arg_name.node, arg_value.node);
                    }
                    out.push(')');
                }

                print_directives(&field.node.directives, out);

                if !field.node.selection_set.node.items.is_empty() {
                    out.push(' ');
                    print_selection_set(&field.node.selection_set.node, out);
                }
            }
            Selection::InlineFragment(inline) => {
                out.push_str("...");
                if let Some(condition) = &inline.node.type_condition {
                    let _ = write!(out, " on {}", condition.node.on.node);
                }
                print_directives(&inline.node.directives, out);
                out.push(' ');
                print_selection_set(&inline.node.selection_set.node, out);
            }
            Selection::FragmentSpread(spread) => {
                let _ = write!(out, "...{}", spread.node.fragment_name.node);
                print_directives(&spread.node.directives, out);
            }
        }
    }
    out.push('}');
}

fn print_directives(
    directives: &[Positioned<async_graphql_parser::types::Directive>],
    out: &mut String,
) {
    for directive in directives {
        let _ = write!(out, " @{}", directive.node.name.node);
        if !directive.node.arguments.is_empty() {
            out.push('(');
            for (i, (name, value)) in directive.node.arguments.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: {}", name.node, value.node);
            }
            out.push(')');
        }
    }
}
