//! Stack-definition synthesis.
//!
//! Rewrites templates so a mapping set can be submitted to the refactor
//! endpoint. The local templates are the base (they carry the user's
//! intended post-refactor shape); only identity-preserving touch-ups are
//! applied on top, because the refactor endpoint rejects property changes.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use snafu::ResultExt;

use crate::template::{Location, Mapping, Stack, StackSet, Template};
use crate::{EmptyStackAfterRefactorSnafu, Result, TemplateSerializeSnafu};

/// One rewritten template, ready for submission.
#[derive(Clone, Debug, PartialEq)]
pub struct StackDefinition {
    pub stack_name: String,
    pub template_body: String,
}

/// Produces the minimal set of rewritten templates that applies `mappings`.
///
/// `deployed` and `local` are one environment's stacks. Only templates whose
/// stack is named by at least one mapping are emitted; bodies are canonical
/// JSON.
pub fn synthesize_stack_definitions(
    mappings: &[Mapping],
    deployed: &[Stack],
    local: &[Stack],
) -> Result<Vec<StackDefinition>> {
    let deployed_stacks = StackSet::new(deployed);
    let forward: HashMap<&Location, &Location> = mappings
        .iter()
        .map(|m| (&m.source, &m.destination))
        .collect();
    let reverse: HashMap<&Location, &Location> = mappings
        .iter()
        .map(|m| (&m.destination, &m.source))
        .collect();

    // the working set is a deep clone; callers keep their templates
    let mut working: IndexMap<String, Template> = local
        .iter()
        .map(|stack| (stack.stack_name.clone(), stack.template.clone()))
        .collect();

    // prune local resources with no deployed counterpart; they are
    // additions, which a refactor cannot carry
    for (stack_name, template) in working.iter_mut() {
        template.resources.retain(|logical_id, _| {
            let location = Location::new(stack_name, logical_id);
            let deployed_location = reverse.get(&location).copied().unwrap_or(&location);
            let exists = deployed_stacks.resource(deployed_location).is_some();
            if !exists {
                log::debug!("{location} is an addition; leaving it out of the refactor");
            }
            exists
        });
    }

    // inject deployed resources missing from their mapped local location
    for stack in deployed {
        for (logical_id, resource) in &stack.template.resources {
            let location = Location::new(&stack.stack_name, logical_id);
            let local_location = forward.get(&location).copied().unwrap_or(&location);
            let template = working
                .entry(local_location.stack_name.clone())
                .or_default();
            if !template.resources.contains_key(&local_location.logical_id) {
                log::debug!("carrying deployed {location} over to {local_location}");
                template
                    .resources
                    .insert(local_location.logical_id.clone(), resource.clone());
            }
        }
    }

    // the refactor endpoint cannot update construct paths, so the deployed
    // value wins wherever the local resource carries one
    for (stack_name, template) in working.iter_mut() {
        for (logical_id, resource) in template.resources.iter_mut() {
            if resource.construct_path().is_none() {
                continue;
            }
            let location = Location::new(stack_name, logical_id);
            let deployed_location = reverse.get(&location).copied().unwrap_or(&location);
            match deployed_stacks
                .resource(deployed_location)
                .and_then(|r| r.construct_path())
            {
                Some(path) => {
                    let path = path.to_owned();
                    resource.set_construct_path(&path);
                }
                None => resource.remove_construct_path(),
            }
        }
    }

    // new destination stacks may not declare Rules or Parameters
    for (stack_name, template) in working.iter_mut() {
        if deployed_stacks.stack(stack_name).is_none() {
            template.rules = None;
            template.parameters = None;
        }
    }

    let mapped: BTreeSet<&str> = mappings
        .iter()
        .flat_map(|m| {
            [
                m.source.stack_name.as_str(),
                m.destination.stack_name.as_str(),
            ]
        })
        .collect();

    let mut definitions = Vec::new();
    for (stack_name, template) in &working {
        if !mapped.contains(stack_name.as_str()) {
            continue;
        }
        snafu::ensure!(
            !template.is_empty(),
            EmptyStackAfterRefactorSnafu { stack_name }
        );
        definitions.push(StackDefinition {
            stack_name: stack_name.clone(),
            template_body: serde_json::to_string(template)
                .context(TemplateSerializeSnafu { stack_name })?,
        });
    }

    // a mapped stack with no template at all has been emptied out entirely
    for stack_name in mapped {
        if !working.contains_key(stack_name) {
            return EmptyStackAfterRefactorSnafu { stack_name }.fail();
        }
    }

    Ok(definitions)
}
