//! # Restack
//!
//! Restack plans CloudFormation stack refactors. Given the **deployed** view
//! of an application (the templates the cloud currently holds) and the
//! **local** view (the templates the user now intends), it works out which
//! resources were moved or renamed, produces resource mappings from old to
//! new locations, and rewrites the affected stack definitions for submission
//! to the refactor endpoint that relocates resources without replacing them.
//!
//! ## Key Features
//!
//! - **Identity by content**: every resource gets a digest that survives
//!   renames but reacts to property changes, computed over the dependency
//!   graph spanning all stacks.
//! - **Move inference**: deployed and local locations pair up by digest;
//!   unambiguous pairs become mappings, ambiguous groups are split by
//!   user-supplied overrides and by structure (the reversed dependency
//!   graph), and whatever remains is returned as data for the caller to
//!   resolve.
//! - **Definition synthesis**: local templates are rewritten so that moved
//!   resources sit at their new locations while references and deployed
//!   construct paths stay intact.
//!
//! ## Concepts
//!
//! Restack operates on two views of the same application:
//!
//! - **Deployed**: the templates fetched from the cloud, the refactor's
//!   starting point.
//! - **Local**: the templates produced by the user's current source, the
//!   refactor's goal.
//!
//! A refactor only *moves* resources. Additions, removals and property
//! changes between the two views are contract violations and surface as
//! [`Error::ModificationDetected`].
//!
//! The core is a pure library: it performs no I/O, holds no shared state,
//! and computes everything from the values passed in. Callers fetch
//! templates, resolve credentials and execute the refactor themselves.
//!
//! ## Error Handling
//!
//! Fallible operations return a `Result` with the crate-wide [`Error`]
//! enum. Ambiguity is *not* an error: unresolved moves come back inside
//! [`PlanResult`] so callers can prompt for overrides and plan again.

pub mod digest;
pub mod graph;
pub mod moves;
pub mod prescribed;
pub mod synth;
pub mod template;

pub use digest::{NoResourceModels, ResourceModels, StaticResourceModels};
pub use graph::{Direction, ExportIndex, ResourceGraph};
pub use moves::ResourceMove;
pub use prescribed::{
    mapping_document, use_prescribed_mappings, MappingDocument, MappingGroup, StackResolver,
};
pub use synth::{synthesize_stack_definitions, StackDefinition};
pub use template::{
    reverse, Environment, Location, Mapping, Output, Resource, Stack, StackSet, Template,
};

use std::collections::BTreeMap;

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "refactor cannot be planned: resources were added, removed or modified\n\
         removed from deployed stacks [{}]: [{}]\n\
         added in local stacks [{}]: [{}]",
        deployed_stacks.join(", "),
        removed.join(", "),
        local_stacks.join(", "),
        added.join(", ")
    ))]
    ModificationDetected {
        /// Paths of deployed resources with no local counterpart.
        removed: Vec<String>,
        /// Paths of local resources with no deployed counterpart.
        added: Vec<String>,
        deployed_stacks: Vec<String>,
        local_stacks: Vec<String>,
    },

    #[snafu(display(
        "stack '{stack_name}' has no resources after the refactor; \
         add a resource to keep the stack alive"
    ))]
    EmptyStackAfterRefactor { stack_name: String },

    #[snafu(display("invalid location '{location}': expected 'StackName.LogicalId'"))]
    InvalidLocation { location: String },

    #[snafu(display("mapping source '{location}' does not exist in {environment}"))]
    SourceNotFound {
        location: String,
        environment: String,
    },

    #[snafu(display("mapping destination '{location}' is already occupied in {environment}"))]
    DestinationOccupied {
        location: String,
        environment: String,
    },

    #[snafu(display("two mappings share the destination '{location}' in {environment}"))]
    DuplicateDestination {
        location: String,
        environment: String,
    },

    #[snafu(display("the resource graph has no node '{node}'"))]
    GraphNodeMissing { node: String },

    #[snafu(display("could not serialize the template of stack '{stack_name}': {source}"))]
    TemplateSerialize {
        stack_name: String,
        source: serde_json::Error,
    },

    #[snafu(display("{source}:\n{}",
                source.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Resolver { source: anyhow::Error },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Resolver { source }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Options steering [`plan`].
#[derive(Clone, Debug, Default)]
pub struct PlanOptions {
    /// Caller-supplied pairs used to split ambiguous moves. Applied before
    /// structural overrides, so an explicit instruction always wins.
    pub overrides: Vec<Mapping>,
    /// Suppress the modification check. Used when the caller only wants the
    /// mappings that *can* be inferred, differences notwithstanding.
    pub ignore_modifications: bool,
    /// When set, only mappings touching one of these stacks (as source or
    /// destination) are returned.
    pub filtered_stacks: Option<Vec<String>>,
}

/// A move the overrides could not split, surfaced as data.
#[derive(Clone, Debug, PartialEq)]
pub struct AmbiguousMove {
    pub sources: Vec<Location>,
    pub destinations: Vec<Location>,
    pub source_paths: Vec<String>,
    pub destination_paths: Vec<String>,
}

/// The outcome of [`plan`]: ready mappings plus unresolved ambiguity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanResult {
    pub mappings: Vec<Mapping>,
    pub ambiguous: Vec<AmbiguousMove>,
}

impl PlanResult {
    /// The ambiguity report as path-list pairs, sources then destinations.
    pub fn ambiguous_paths(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.ambiguous
            .iter()
            .map(|mv| (mv.source_paths.clone(), mv.destination_paths.clone()))
            .collect()
    }

    /// All mappings in the JSON shape the refactor endpoint accepts.
    pub fn wire_mappings(&self) -> serde_json::Value {
        serde_json::Value::Array(self.mappings.iter().map(Mapping::to_wire).collect())
    }
}

/// Computes the digest of every resource across `stacks`.
///
/// Node ids are `"{stackName}.{logicalId}"`; digests are lowercase hex
/// SHA-256.
pub fn compute_digests<M: ResourceModels>(
    stacks: &[Stack],
    direction: Direction,
    models: &M,
) -> Result<BTreeMap<String, String>> {
    let set = StackSet::new(stacks);
    Ok(digest::digests_for(&set, direction, models)?
        .into_iter()
        .map(|(location, digest)| (location.to_string(), digest))
        .collect())
}

/// Infers the resource mappings that turn `deployed` into `local`.
///
/// Stacks are grouped by environment and inferred per group; a resource
/// never moves between environments. Ambiguous moves that survive the
/// overrides are returned, not thrown.
pub fn plan<M: ResourceModels>(
    deployed: &[Stack],
    local: &[Stack],
    options: &PlanOptions,
    models: &M,
) -> Result<PlanResult> {
    let mut environments = Vec::new();
    for stack in deployed.iter().chain(local) {
        if !environments.contains(&stack.environment) {
            environments.push(stack.environment.clone());
        }
    }

    let mut result = PlanResult::default();
    for environment in &environments {
        log::debug!("planning refactor for {environment}");
        let deployed_set = StackSet::new(deployed.iter().filter(|s| s.environment == *environment));
        let local_set = StackSet::new(local.iter().filter(|s| s.environment == *environment));

        let deployed_digests = digest::digests_for(&deployed_set, Direction::Direct, models)?;
        let local_digests = digest::digests_for(&local_set, Direction::Direct, models)?;
        let deployed_index = moves::digest_index(&deployed_set, &deployed_digests);
        let local_index = moves::digest_index(&local_set, &local_digests);

        if !options.ignore_modifications {
            moves::ensure_isomorphic(&deployed_index, &local_index, &deployed_set, &local_set)?;
        }

        let zipped = moves::zip_indices(&deployed_index, &local_index);
        let mut overrides = options.overrides.clone();
        if zipped.iter().any(ResourceMove::is_ambiguous) {
            let structural = structural_overrides(&deployed_set, &local_set, models)?;
            log::debug!(
                "derived {} structural override(s) from the reversed graph",
                structural.len()
            );
            overrides.extend(structural);
        }

        let (unambiguous, ambiguous) = moves::resolve_moves(zipped, &overrides);
        result
            .mappings
            .extend(moves::extract_mappings(&unambiguous));
        for mv in ambiguous {
            result.ambiguous.push(AmbiguousMove {
                source_paths: mv.sources.iter().map(|l| deployed_set.path(l)).collect(),
                destination_paths: mv
                    .destinations
                    .iter()
                    .map(|l| local_set.path(l))
                    .collect(),
                sources: mv.sources,
                destinations: mv.destinations,
            });
        }
    }

    if let Some(filter) = &options.filtered_stacks {
        result.mappings.retain(|m| {
            filter.contains(&m.source.stack_name) || filter.contains(&m.destination.stack_name)
        });
    }

    log::debug!(
        "planned {} mapping(s), {} ambiguous move(s)",
        result.mappings.len(),
        result.ambiguous.len()
    );
    Ok(result)
}

/// Mappings inferred from the reversed dependency graph.
///
/// Two identical leaves can have different ancestors; reversing the edges
/// folds those ancestors into the leaves' digests, which is often enough to
/// tell the leaves apart.
fn structural_overrides<M: ResourceModels>(
    deployed_set: &StackSet<'_>,
    local_set: &StackSet<'_>,
    models: &M,
) -> Result<Vec<Mapping>> {
    let deployed_digests = digest::digests_for(deployed_set, Direction::Opposite, models)?;
    let local_digests = digest::digests_for(local_set, Direction::Opposite, models)?;
    let deployed_index = moves::digest_index(deployed_set, &deployed_digests);
    let local_index = moves::digest_index(local_set, &local_digests);
    // the reversed digests intentionally differ from the direct ones, so no
    // modification check here
    let zipped = moves::zip_indices(&deployed_index, &local_index);
    let (unambiguous, _) = moves::resolve_moves(zipped, &[]);
    Ok(moves::extract_mappings(&unambiguous))
}
