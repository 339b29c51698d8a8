//! Content-addressed resource identity.
//!
//! Every resource is assigned a SHA-256 digest that is stable under renames
//! but sensitive to property changes. Two resources on opposite sides of the
//! deployed/local divide with equal digests are the same resource, possibly
//! relocated.
//!
//! ## Canonical byte protocol
//!
//! Digests must be reproducible across rewrites, so the bytes fed to the
//! hash are fixed here:
//!
//! - `null` feeds the literal bytes `null`
//! - booleans feed `bool:` followed by `true` or `false`
//! - numbers feed `num:` followed by the `serde_json` display form
//! - strings feed `str:` followed by the UTF-8 bytes
//! - sequences feed `[`, then each element's canonical bytes followed by
//!   `,`, then `]`
//! - mappings feed `{`, then for each key in lexicographic order the key
//!   bytes, `:`, the value's canonical bytes and `,`, then `}`

use std::collections::{BTreeMap, HashMap};

use ring::digest::{Context, SHA256};
use serde_json::Value;

use crate::graph::{Direction, ExportIndex, ResourceGraph};
use crate::template::{
    Location, Resource, StackSet, CONSTRUCT_PATH_KEY, DEPENDS_ON, GET_ATT, IMPORT_VALUE, REF,
};
use crate::Result;

/// The key marking an erased reference in a stripped property tree.
const SENTINEL_KEY: &str = "__cloud_ref__";

/// The primary-identifier lookup service.
///
/// Implementations report, for a resource type, the ordered list of property
/// names that together form the type's primary identifier, or `None` when the
/// type has no identifier model.
pub trait ResourceModels {
    fn primary_identifier(&self, resource_type: &str) -> Option<Vec<String>>;
}

/// A provider with no identifier models; every digest is structural.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResourceModels;

impl ResourceModels for NoResourceModels {
    fn primary_identifier(&self, _resource_type: &str) -> Option<Vec<String>> {
        None
    }
}

/// A map-backed provider for callers that load a registry up front.
#[derive(Clone, Debug, Default)]
pub struct StaticResourceModels {
    identifiers: BTreeMap<String, Vec<String>>,
}

impl StaticResourceModels {
    pub fn with(
        mut self,
        resource_type: impl Into<String>,
        identifier: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.identifiers.insert(
            resource_type.into(),
            identifier.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl ResourceModels for StaticResourceModels {
    fn primary_identifier(&self, resource_type: &str) -> Option<Vec<String>> {
        self.identifiers.get(resource_type).cloned()
    }
}

/// Computes the digest of every resource in a stack set.
///
/// Resources caught in a reference cycle are skipped; well-formed templates
/// are acyclic.
pub(crate) fn digests_for<M: ResourceModels>(
    stacks: &StackSet<'_>,
    direction: Direction,
    models: &M,
) -> Result<BTreeMap<Location, String>> {
    let exports = ExportIndex::new(stacks);
    let graph = ResourceGraph::new(stacks, &exports);
    let graph = match direction {
        Direction::Direct => graph,
        Direction::Opposite => graph.opposite(),
    };

    let order = graph.sorted_nodes();
    let position: HashMap<&Location, usize> = order.iter().enumerate().map(|(i, n)| (n, i)).collect();
    let mut digests: BTreeMap<Location, String> = BTreeMap::new();

    for node in &order {
        let resource = match stacks.resource(node) {
            Some(resource) => resource,
            None => continue,
        };
        let digest = match physical_identifier(resource, models) {
            Some(identifier) => {
                log::trace!("{node} is pinned by its physical identifier");
                identifier_digest(resource.type_name(), &identifier)
            }
            None => {
                let properties_hash = canonical_hash_hex(&stripped_body(resource, &exports));
                // dependencies precede their dependents in `order`, so every
                // out-neighbor already has a digest
                let mut dependencies: Vec<&Location> =
                    graph.out_neighbors(node)?.iter().collect();
                dependencies.sort_by_key(|d| position[d]);

                let mut context = Context::new(&SHA256);
                context.update(resource.type_name().as_bytes());
                context.update(properties_hash.as_bytes());
                for dependency in dependencies {
                    context.update(digests[dependency].as_bytes());
                }
                hex(context)
            }
        };
        digests.insert(node.clone(), digest);
    }

    log::debug!(
        "computed {} digest(s) over {} node(s)",
        digests.len(),
        stacks.locations().len()
    );
    Ok(digests)
}

/// The identifier values pinning this resource, when the model reports a
/// primary identifier and every named property is present.
fn physical_identifier<'a, M: ResourceModels>(
    resource: &'a Resource,
    models: &M,
) -> Option<Vec<(String, &'a Value)>> {
    let resource_type = resource.resource_type.as_deref()?;
    let keys = models.primary_identifier(resource_type)?;
    let properties = resource.properties.as_ref()?.as_object()?;
    let mut pairs = keys
        .into_iter()
        .map(|key| {
            let value = properties.get(&key)?;
            Some((key, value))
        })
        .collect::<Option<Vec<_>>>()?;
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Some(pairs)
}

/// Digest of a physically identified resource: type plus identifier values,
/// keys in sorted order. Other properties and dependencies are ignored.
fn identifier_digest(type_name: &str, identifier: &[(String, &Value)]) -> String {
    let mut context = Context::new(&SHA256);
    context.update(type_name.as_bytes());
    for (_, value) in identifier {
        context.update(value.to_string().as_bytes());
    }
    hex(context)
}

/// The resource body with references erased and construct-path metadata
/// removed, assembled per top-level section so a resource-level `DependsOn`
/// never swallows the properties.
fn stripped_body(resource: &Resource, exports: &ExportIndex) -> Value {
    let mut body = serde_json::Map::new();
    if let Some(resource_type) = &resource.resource_type {
        body.insert("Type".to_owned(), Value::String(resource_type.clone()));
    }
    if let Some(properties) = &resource.properties {
        body.insert(
            "Properties".to_owned(),
            strip_references(properties, exports),
        );
    }
    if let Some(metadata) = &resource.metadata {
        let metadata = strip_construct_path(metadata);
        body.insert("Metadata".to_owned(), strip_references(&metadata, exports));
    }
    if resource.depends_on.is_some() {
        body.insert(DEPENDS_ON.to_owned(), sentinel(DEPENDS_ON));
    }
    for (key, value) in &resource.extra {
        body.insert(key.clone(), strip_references(value, exports));
    }
    Value::Object(body)
}

fn strip_construct_path(metadata: &Value) -> Value {
    match metadata {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(CONSTRUCT_PATH_KEY);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

fn sentinel(kind: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(SENTINEL_KEY.to_owned(), Value::String(kind.to_owned()));
    Value::Object(map)
}

/// Replaces reference expressions with sentinels so that two resources
/// pointing at equivalent targets under different names hash equally. The
/// target's identity re-enters the digest through the dependency digests.
fn strip_references(value: &Value, exports: &ExportIndex) -> Value {
    match value {
        Value::Object(map) => {
            if map.contains_key(REF) {
                return sentinel(REF);
            }
            if map.contains_key(GET_ATT) {
                return sentinel(GET_ATT);
            }
            if map.contains_key(DEPENDS_ON) {
                return sentinel(DEPENDS_ON);
            }
            if let Some(Value::String(name)) = map.get(IMPORT_VALUE) {
                match exports.get(name).map(|export| &export.value) {
                    Some(exported) if exported.get(REF).is_some() => return sentinel(REF),
                    Some(exported) if exported.get(GET_ATT).is_some() => {
                        return sentinel(GET_ATT)
                    }
                    // a complex or unknown export stays as the literal import
                    _ => return value.clone(),
                }
            }
            Value::Object(
                map.iter()
                    .map(|(key, nested)| (key.clone(), strip_references(nested, exports)))
                    .collect(),
            )
        }
        Value::Array(seq) => Value::Array(
            seq.iter()
                .map(|nested| strip_references(nested, exports))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

/// Lowercase hex SHA-256 of a value's canonical bytes.
fn canonical_hash_hex(value: &Value) -> String {
    let mut context = Context::new(&SHA256);
    update_canonical(&mut context, value);
    hex(context)
}

fn update_canonical(context: &mut Context, value: &Value) {
    match value {
        Value::Null => context.update(b"null"),
        Value::Bool(b) => {
            context.update(b"bool:");
            context.update(if *b { b"true" } else { b"false" });
        }
        Value::Number(n) => {
            context.update(b"num:");
            context.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            context.update(b"str:");
            context.update(s.as_bytes());
        }
        Value::Array(seq) => {
            context.update(b"[");
            for element in seq {
                update_canonical(context, element);
                context.update(b",");
            }
            context.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            context.update(b"{");
            for key in keys {
                context.update(key.as_bytes());
                context.update(b":");
                update_canonical(context, &map[key]);
                context.update(b",");
            }
            context.update(b"}");
        }
    }
}

fn hex(context: Context) -> String {
    data_encoding::HEXLOWER.encode(context.finish().as_ref())
}
