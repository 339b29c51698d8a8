//! The resource dependency graph.
//!
//! Nodes are every resource across a stack set; edges point from a resource
//! to the resources it depends on, derived from `Ref`, `Fn::GetAtt`,
//! `Fn::ImportValue` and `DependsOn`. Cross-stack imports resolve through an
//! export index built once up front.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::template::{Location, StackSet, DEPENDS_ON, GET_ATT, IMPORT_VALUE, REF};
use crate::{Error, Result};

/// Which way edges point when digesting.
///
/// `Direct` follows the graph as built (toward dependencies). `Opposite`
/// inverts every edge, which is only ever used to derive structural
/// overrides from a resource's dependents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Direct,
    Opposite,
}

/// One exported output value and the stack that declares it.
#[derive(Clone, Debug)]
pub struct Export {
    pub stack_name: String,
    pub value: Value,
}

/// Export name to exported value, across all stacks of a set.
///
/// Outputs without an `Export.Name` of string type are ignored.
#[derive(Debug, Default)]
pub struct ExportIndex {
    exports: HashMap<String, Export>,
}

impl ExportIndex {
    pub fn new(stacks: &StackSet<'_>) -> Self {
        let mut exports = HashMap::new();
        for stack in stacks.stacks() {
            for output in stack.template.outputs.values() {
                if let Some(name) = output.export_name() {
                    exports.insert(
                        name.to_owned(),
                        Export {
                            stack_name: stack.stack_name.clone(),
                            value: output.value.clone(),
                        },
                    );
                }
            }
        }
        ExportIndex { exports }
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// Resolves an import to the location the export points at.
    ///
    /// An export value of `{Ref: X}` or `{Fn::GetAtt: [X, ...]}` names `X` in
    /// the exporting stack. A bare string value is treated as a logical id in
    /// the exporting stack. Anything else does not name a resource.
    pub fn resolve(&self, name: &str) -> Option<Location> {
        let export = self.get(name)?;
        let logical_id = match &export.value {
            Value::String(id) => Some(id.as_str()),
            value => referenced_logical_id(value),
        }?;
        Some(Location::new(&export.stack_name, logical_id))
    }
}

/// The logical id named by a `{Ref: X}` or `{Fn::GetAtt: ...}` expression.
pub(crate) fn referenced_logical_id(value: &Value) -> Option<&str> {
    if let Some(Value::String(target)) = value.get(REF) {
        return Some(target);
    }
    match value.get(GET_ATT) {
        // "X.attr": only the first segment names the resource
        Some(Value::String(dotted)) => dotted.split('.').next(),
        Some(Value::Array(parts)) => parts.first().and_then(Value::as_str),
        _ => None,
    }
}

/// An immutable directed graph over every resource in a stack set.
#[derive(Debug, Default)]
pub struct ResourceGraph {
    nodes: Vec<Location>,
    out_edges: HashMap<Location, BTreeSet<Location>>,
    in_edges: HashMap<Location, BTreeSet<Location>>,
}

impl ResourceGraph {
    pub fn new(stacks: &StackSet<'_>, exports: &ExportIndex) -> Self {
        let nodes = stacks.locations();
        let known: HashSet<&Location> = nodes.iter().collect();
        let mut out_edges: HashMap<Location, BTreeSet<Location>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        let mut in_edges = out_edges.clone();

        for node in &nodes {
            let resource = match stacks.resource(node) {
                Some(resource) => resource,
                None => continue,
            };
            let mut targets = Vec::new();
            if let Some(properties) = &resource.properties {
                collect_targets(properties, &node.stack_name, exports, &mut targets);
            }
            if let Some(metadata) = &resource.metadata {
                collect_targets(metadata, &node.stack_name, exports, &mut targets);
            }
            for value in resource.extra.values() {
                collect_targets(value, &node.stack_name, exports, &mut targets);
            }
            for id in resource.depends_on_ids() {
                targets.push(Location::new(&node.stack_name, id));
            }

            for target in targets {
                // unknown targets and self-loops are silently dropped
                if target == *node || !known.contains(&target) {
                    continue;
                }
                out_edges.entry(node.clone()).or_default().insert(target.clone());
                in_edges.entry(target).or_default().insert(node.clone());
            }
        }

        ResourceGraph {
            nodes,
            out_edges,
            in_edges,
        }
    }

    /// The same graph with every edge inverted.
    pub fn opposite(&self) -> Self {
        ResourceGraph {
            nodes: self.nodes.clone(),
            out_edges: self.in_edges.clone(),
            in_edges: self.out_edges.clone(),
        }
    }

    pub fn contains(&self, node: &Location) -> bool {
        self.out_edges.contains_key(node)
    }

    /// The dependency targets of `node`.
    pub fn out_neighbors(&self, node: &Location) -> Result<&BTreeSet<Location>> {
        self.out_edges.get(node).ok_or_else(|| Error::GraphNodeMissing {
            node: node.to_string(),
        })
    }

    /// The dependents of `node`.
    pub fn in_neighbors(&self, node: &Location) -> Result<&BTreeSet<Location>> {
        self.in_edges.get(node).ok_or_else(|| Error::GraphNodeMissing {
            node: node.to_string(),
        })
    }

    /// Topological order, dependencies before dependents.
    ///
    /// Kahn's algorithm over out-degree with a FIFO queue seeded in node
    /// insertion order. Members of a cycle never reach out-degree zero and
    /// are absent from the result.
    pub fn sorted_nodes(&self) -> Vec<Location> {
        let mut remaining: HashMap<&Location, usize> = self
            .nodes
            .iter()
            .map(|n| (n, self.out_edges[n].len()))
            .collect();
        let mut queue: VecDeque<&Location> = self
            .nodes
            .iter()
            .filter(|n| remaining[*n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            for dependent in &self.in_edges[node] {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            log::debug!(
                "{} graph node(s) participate in a cycle and were left unsorted",
                self.nodes.len() - order.len()
            );
        }
        order
    }
}

/// Walks a property tree collecting the locations it references.
fn collect_targets(
    value: &Value,
    stack_name: &str,
    exports: &ExportIndex,
    targets: &mut Vec<Location>,
) {
    match value {
        Value::Object(map) => {
            if let Some(id) = referenced_logical_id(value) {
                targets.push(Location::new(stack_name, id));
            } else if let Some(Value::String(name)) = map.get(IMPORT_VALUE) {
                if let Some(location) = exports.resolve(name) {
                    targets.push(location);
                }
            } else if map.contains_key(DEPENDS_ON) {
                // DependsOn inside a property tree behaves like DependsOn
                // on the resource itself
                match map.get(DEPENDS_ON) {
                    Some(Value::String(id)) => targets.push(Location::new(stack_name, id)),
                    Some(Value::Array(ids)) => {
                        for id in ids.iter().filter_map(Value::as_str) {
                            targets.push(Location::new(stack_name, id));
                        }
                    }
                    _ => {}
                }
            } else {
                for nested in map.values() {
                    collect_targets(nested, stack_name, exports, targets);
                }
            }
        }
        Value::Array(seq) => {
            for nested in seq {
                collect_targets(nested, stack_name, exports, targets);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::template::{Environment, Stack, Template};
    use serde_json::json;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1", "test")
    }

    fn stack(name: &str, template: Value) -> Stack {
        Stack::new(env(), name, serde_json::from_value(template).unwrap())
    }

    #[test]
    fn edges_follow_refs_getatts_and_depends_on() {
        let foo = stack(
            "Foo",
            json!({
                "Resources": {
                    "A": { "Type": "T", "Properties": { "X": { "Ref": "B" } } },
                    "B": { "Type": "T" },
                    "C": {
                        "Type": "T",
                        "Properties": { "Arn": { "Fn::GetAtt": ["B", "Arn"] } },
                        "DependsOn": "A"
                    },
                    "D": { "Type": "T", "Properties": { "Arn": { "Fn::GetAtt": "B.Arn" } } }
                }
            }),
        );
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);

        let neighbors = |id: &str| {
            graph
                .out_neighbors(&Location::new("Foo", id))
                .unwrap()
                .iter()
                .map(|l| l.logical_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(neighbors("A"), vec!["B"]);
        assert_eq!(neighbors("C"), vec!["A", "B"]);
        assert_eq!(neighbors("D"), vec!["B"]);
        assert!(neighbors("B").is_empty());
    }

    #[test]
    fn import_value_resolves_through_the_export_index() {
        let producer = stack(
            "Producer",
            json!({
                "Resources": { "Table": { "Type": "T" } },
                "Outputs": {
                    "TableOut": {
                        "Value": { "Ref": "Table" },
                        "Export": { "Name": "shared-table" }
                    }
                }
            }),
        );
        let consumer = stack(
            "Consumer",
            json!({
                "Resources": {
                    "Fn": {
                        "Type": "T",
                        "Properties": { "TableName": { "Fn::ImportValue": "shared-table" } }
                    }
                }
            }),
        );
        let stacks = StackSet::new([&producer, &consumer]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);

        let deps = graph.out_neighbors(&Location::new("Consumer", "Fn")).unwrap();
        assert_eq!(
            deps.iter().collect::<Vec<_>>(),
            vec![&Location::new("Producer", "Table")]
        );
    }

    #[test]
    fn unknown_targets_and_self_loops_are_dropped() {
        let foo = stack(
            "Foo",
            json!({
                "Resources": {
                    "A": {
                        "Type": "T",
                        "Properties": {
                            "Me": { "Ref": "A" },
                            "Ghost": { "Ref": "DoesNotExist" }
                        }
                    }
                }
            }),
        );
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);
        assert!(graph
            .out_neighbors(&Location::new("Foo", "A"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sorted_nodes_yields_dependencies_first() {
        let foo = stack(
            "Foo",
            json!({
                "Resources": {
                    "App": { "Type": "T", "Properties": { "X": { "Ref": "Mid" } } },
                    "Mid": { "Type": "T", "Properties": { "X": { "Ref": "Leaf" } } },
                    "Leaf": { "Type": "T" }
                }
            }),
        );
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);

        let order: Vec<String> = graph
            .sorted_nodes()
            .into_iter()
            .map(|l| l.logical_id)
            .collect();
        let position = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(position("Leaf") < position("Mid"));
        assert!(position("Mid") < position("App"));
    }

    #[test]
    fn cycle_members_are_absent_from_the_sorted_order() {
        let foo = stack(
            "Foo",
            json!({
                "Resources": {
                    "A": { "Type": "T", "Properties": { "X": { "Ref": "B" } } },
                    "B": { "Type": "T", "Properties": { "X": { "Ref": "A" } } },
                    "Lone": { "Type": "T" }
                }
            }),
        );
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);
        let order = graph.sorted_nodes();
        assert_eq!(order, vec![Location::new("Foo", "Lone")]);
    }

    #[test]
    fn unknown_nodes_error() {
        let foo = stack("Foo", json!({ "Resources": { "A": { "Type": "T" } } }));
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports);
        let err = graph
            .out_neighbors(&Location::new("Foo", "Nope"))
            .unwrap_err();
        assert!(matches!(err, crate::Error::GraphNodeMissing { .. }));
    }

    #[test]
    fn opposite_swaps_edge_direction() {
        let foo = stack(
            "Foo",
            json!({
                "Resources": {
                    "A": { "Type": "T", "Properties": { "X": { "Ref": "B" } } },
                    "B": { "Type": "T" }
                }
            }),
        );
        let stacks = StackSet::new([&foo]);
        let exports = ExportIndex::new(&stacks);
        let graph = ResourceGraph::new(&stacks, &exports).opposite();
        let deps = graph.out_neighbors(&Location::new("Foo", "B")).unwrap();
        assert_eq!(
            deps.iter().collect::<Vec<_>>(),
            vec![&Location::new("Foo", "A")]
        );
    }
}
