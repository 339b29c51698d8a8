//! Prescribed mappings.
//!
//! The explicit alternative to move inference: the caller hands over
//! `"StackName.LogicalId" -> "StackName.LogicalId"` pairs grouped by
//! environment, and the core only validates them against the deployed view.
//! No digests, no ambiguity; every mapping is intentional.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::template::{Location, Mapping, Stack, StackSet};
use crate::{Error, Result};

/// Explicit source-to-destination pairs for one environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingGroup {
    pub account: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

/// The editable mapping file: groups keyed by environment.
///
/// A dry run's computed mappings render into this shape (see
/// [`mapping_document`]); the user may adjust it and replay it through
/// [`use_prescribed_mappings`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingDocument {
    #[serde(default)]
    pub environments: Vec<MappingGroup>,
}

/// Supplies the deployed stacks of an environment.
///
/// The core performs no network I/O; callers resolve against whatever cloud
/// or cache they own and report failures as [`anyhow::Error`].
pub trait StackResolver {
    fn deployed_stacks(&self, account: &str, region: &str) -> anyhow::Result<Vec<Stack>>;
}

impl StackResolver for Vec<Stack> {
    fn deployed_stacks(&self, account: &str, region: &str) -> anyhow::Result<Vec<Stack>> {
        Ok(self
            .iter()
            .filter(|s| s.environment.account == account && s.environment.region == region)
            .cloned()
            .collect())
    }
}

/// Validates prescribed mapping groups and turns them into mappings.
///
/// Each pair must name an existing deployed source, a destination logical id
/// not already occupied in its stack's deployed view, and no two pairs may
/// share a destination.
pub fn use_prescribed_mappings<R: StackResolver>(
    groups: &[MappingGroup],
    resolver: &R,
) -> Result<Vec<Mapping>> {
    let mut mappings = Vec::new();
    for group in groups {
        let environment = format!("aws://{}/{}", group.account, group.region);
        let deployed = resolver.deployed_stacks(&group.account, &group.region)?;
        let deployed = StackSet::new(&deployed);
        let mut destinations = HashSet::new();

        for (source, destination) in &group.resources {
            let source = Location::parse(source)?;
            let destination = Location::parse(destination)?;

            if !destinations.insert(destination.clone()) {
                return Err(Error::DuplicateDestination {
                    location: destination.to_string(),
                    environment,
                });
            }
            if deployed.resource(&source).is_none() {
                return Err(Error::SourceNotFound {
                    location: source.to_string(),
                    environment,
                });
            }
            if deployed.resource(&destination).is_some() {
                return Err(Error::DestinationOccupied {
                    location: destination.to_string(),
                    environment,
                });
            }
            mappings.push(Mapping::new(source, destination));
        }
    }
    log::debug!("accepted {} prescribed mapping(s)", mappings.len());
    Ok(mappings)
}

/// Renders computed mappings into the editable mapping-file shape, grouped
/// by the source stack's environment.
pub fn mapping_document(mappings: &[Mapping], deployed: &[Stack]) -> MappingDocument {
    let stacks = StackSet::new(deployed);
    let mut groups: Vec<MappingGroup> = Vec::new();
    for mapping in mappings {
        let environment = match stacks.stack(&mapping.source.stack_name) {
            Some(stack) => &stack.environment,
            None => continue,
        };
        let group = match groups
            .iter_mut()
            .find(|g| g.account == environment.account && g.region == environment.region)
        {
            Some(group) => group,
            None => {
                groups.push(MappingGroup {
                    account: environment.account.clone(),
                    region: environment.region.clone(),
                    resources: BTreeMap::new(),
                });
                groups.last_mut().unwrap()
            }
        };
        group
            .resources
            .insert(mapping.source.to_string(), mapping.destination.to_string());
    }
    MappingDocument {
        environments: groups,
    }
}
