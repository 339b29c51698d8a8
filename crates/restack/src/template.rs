//! The template data model.
//!
//! Templates are schemaless beyond their reserved top-level keys, so the
//! typed structs here keep `Resources` and `Outputs` as maps of known shapes
//! while every property body stays a raw [`serde_json::Value`] tree. Unknown
//! keys are preserved through a rewrite via flattened maps.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{InvalidLocationSnafu, Result};

/// Reserved key for an intra-stack reference.
pub const REF: &str = "Ref";
/// Reserved key for an attribute reference.
pub const GET_ATT: &str = "Fn::GetAtt";
/// Reserved key for a cross-stack import.
pub const IMPORT_VALUE: &str = "Fn::ImportValue";
/// Reserved key for explicit resource dependencies.
pub const DEPENDS_ON: &str = "DependsOn";
/// Metadata key carrying the construct path of a synthesized resource.
pub const CONSTRUCT_PATH_KEY: &str = "aws:cdk:path";

/// An isolation scope for stacks.
///
/// Mappings are computed per environment. A resource never moves between
/// environments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
    pub name: String,
}

impl Environment {
    pub fn new(
        account: impl Into<String>,
        region: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Environment {
            account: account.into(),
            region: region.into(),
            name: name.into(),
        }
    }
}

impl core::fmt::Display for Environment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "aws://{}/{}", self.account, self.region)
    }
}

/// A single resource body inside a template.
///
/// `Type`, `Properties`, `Metadata` and `DependsOn` are the reserved keys;
/// anything else (`Condition`, `DeletionPolicy`, ...) survives untouched in
/// `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(rename = "Properties", skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(rename = "Metadata", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// A single logical id or a sequence of logical ids.
    #[serde(rename = "DependsOn", skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Resource {
    /// The resource type, or `"Unknown"` when the template omits it.
    pub fn type_name(&self) -> &str {
        self.resource_type.as_deref().unwrap_or("Unknown")
    }

    /// The construct path recorded by the synthesizing toolkit, if any.
    pub fn construct_path(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(CONSTRUCT_PATH_KEY))
            .and_then(Value::as_str)
    }

    pub(crate) fn set_construct_path(&mut self, path: &str) {
        let metadata = self
            .metadata
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = metadata {
            map.insert(CONSTRUCT_PATH_KEY.to_owned(), Value::String(path.to_owned()));
        }
    }

    pub(crate) fn remove_construct_path(&mut self) {
        let emptied = match &mut self.metadata {
            Some(Value::Object(map)) => {
                map.remove(CONSTRUCT_PATH_KEY);
                map.is_empty()
            }
            _ => false,
        };
        if emptied {
            self.metadata = None;
        }
    }

    /// The logical ids named by `DependsOn`, whether scalar or sequence.
    pub fn depends_on_ids(&self) -> Vec<&str> {
        match &self.depends_on {
            Some(Value::String(id)) => vec![id.as_str()],
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        }
    }
}

/// A template output, relevant here for the exports it may declare.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "Value", skip_serializing_if = "Value::is_null", default)]
    pub value: Value,
    #[serde(rename = "Export", skip_serializing_if = "Option::is_none")]
    pub export: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Output {
    /// The export name, when `Export.Name` is present and a string.
    pub fn export_name(&self) -> Option<&str> {
        self.export
            .as_ref()
            .and_then(|e| e.get("Name"))
            .and_then(Value::as_str)
    }
}

/// A parsed stack template.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(
        rename = "Resources",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub resources: BTreeMap<String, Resource>,
    #[serde(
        rename = "Outputs",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub outputs: BTreeMap<String, Output>,
    #[serde(rename = "Parameters", skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(rename = "Rules", skip_serializing_if = "Option::is_none")]
    pub rules: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Template {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A named template deployed to (or destined for) an environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub environment: Environment,
    pub stack_name: String,
    pub template: Template,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assume_role_arn: Option<String>,
}

impl Stack {
    pub fn new(environment: Environment, stack_name: impl Into<String>, template: Template) -> Self {
        Stack {
            environment,
            stack_name: stack_name.into(),
            template,
            assume_role_arn: None,
        }
    }
}

/// The address of a resource: a stack name plus a logical id.
///
/// Resource bodies are looked up out of band through a [`StackSet`], so a
/// location can be carried around and compared without borrowing a template.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub stack_name: String,
    pub logical_id: String,
}

impl Location {
    pub fn new(stack_name: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Location {
            stack_name: stack_name.into(),
            logical_id: logical_id.into(),
        }
    }

    /// Parses a `"StackName.LogicalId"` string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((stack_name, logical_id)) if !stack_name.is_empty() && !logical_id.is_empty() => {
                Ok(Location::new(stack_name, logical_id))
            }
            _ => InvalidLocationSnafu { location: s }.fail(),
        }
    }
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.stack_name, self.logical_id)
    }
}

/// A planned relocation of one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: Location,
    pub destination: Location,
}

impl Mapping {
    pub fn new(source: Location, destination: Location) -> Self {
        Mapping {
            source,
            destination,
        }
    }

    /// The same relocation, played backwards.
    pub fn reversed(&self) -> Mapping {
        Mapping {
            source: self.destination.clone(),
            destination: self.source.clone(),
        }
    }

    /// The JSON shape the refactor endpoint accepts.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "Source": {
                "StackName": self.source.stack_name,
                "LogicalResourceId": self.source.logical_id,
            },
            "Destination": {
                "StackName": self.destination.stack_name,
                "LogicalResourceId": self.destination.logical_id,
            },
        })
    }
}

impl core::fmt::Display for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// Reverses a whole mapping set, for replaying a refactor backwards.
pub fn reverse(mappings: &[Mapping]) -> Vec<Mapping> {
    mappings.iter().map(Mapping::reversed).collect()
}

/// An ordered collection of stacks with name-keyed lookups.
///
/// All stacks in a set belong to one side (deployed or local) of one
/// environment, so stack names are unique within a set.
pub struct StackSet<'a> {
    stacks: Vec<&'a Stack>,
    by_name: HashMap<&'a str, usize>,
}

impl<'a> StackSet<'a> {
    pub fn new(stacks: impl IntoIterator<Item = &'a Stack>) -> Self {
        let stacks: Vec<&'a Stack> = stacks.into_iter().collect();
        let by_name = stacks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.stack_name.as_str(), i))
            .collect();
        StackSet { stacks, by_name }
    }

    pub fn stacks(&self) -> impl Iterator<Item = &'a Stack> + '_ {
        self.stacks.iter().copied()
    }

    pub fn stack(&self, name: &str) -> Option<&'a Stack> {
        self.by_name.get(name).map(|i| self.stacks[*i])
    }

    pub fn resource(&self, location: &Location) -> Option<&'a Resource> {
        self.stack(&location.stack_name)?
            .template
            .resources
            .get(&location.logical_id)
    }

    /// Every resource location in the set, in stack order then template order.
    pub fn locations(&self) -> Vec<Location> {
        self.stacks
            .iter()
            .flat_map(|stack| {
                stack
                    .template
                    .resources
                    .keys()
                    .map(|id| Location::new(&stack.stack_name, id))
            })
            .collect()
    }

    /// The human-facing path of a location: the construct path when the
    /// resource records one, else `"{stackName}.{logicalId}"`.
    pub fn path(&self, location: &Location) -> String {
        self.resource(location)
            .and_then(Resource::construct_path)
            .map(str::to_owned)
            .unwrap_or_else(|| location.to_string())
    }

    /// The type of the resource at `location`, or `"Unknown"`.
    pub fn resource_type(&self, location: &Location) -> &str {
        self.resource(location)
            .map(Resource::type_name)
            .unwrap_or("Unknown")
    }
}
