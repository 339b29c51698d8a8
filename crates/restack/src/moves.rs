//! Move inference.
//!
//! Locations on the deployed and local sides are grouped by digest, zipped
//! into moves, and classified. Ambiguity is data here, never an error: a
//! move the overrides cannot split is handed back to the caller.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::template::{Location, Mapping, StackSet};
use crate::{Error, Result};

/// Digest to the locations bearing it, in input traversal order.
pub(crate) type DigestIndex = IndexMap<String, Vec<Location>>;

/// Groups a stack set's locations by digest.
pub(crate) fn digest_index(
    stacks: &StackSet<'_>,
    digests: &BTreeMap<Location, String>,
) -> DigestIndex {
    let mut index = DigestIndex::new();
    for location in stacks.locations() {
        // resources caught in a cycle carry no digest
        if let Some(digest) = digests.get(&location) {
            index.entry(digest.clone()).or_default().push(location);
        }
    }
    index
}

/// A set of same-digest locations on each side of the divide.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceMove {
    pub sources: Vec<Location>,
    pub destinations: Vec<Location>,
}

impl ResourceMove {
    /// A move is ambiguous when both sides are populated and at least one
    /// side holds more than one location.
    pub fn is_ambiguous(&self) -> bool {
        !self.sources.is_empty()
            && !self.destinations.is_empty()
            && (self.sources.len() > 1 || self.destinations.len() > 1)
    }

    fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.destinations.is_empty()
    }

    /// Removes locations present on both sides; those resources have not
    /// moved.
    fn self_filtered(mut self) -> Self {
        let mut sources = Vec::with_capacity(self.sources.len());
        for source in self.sources.drain(..) {
            if let Some(at) = self.destinations.iter().position(|d| *d == source) {
                self.destinations.remove(at);
            } else {
                sources.push(source);
            }
        }
        self.sources = sources;
        self
    }
}

/// Zips two digest indices into moves, deployed keys first, then keys seen
/// only locally. Moves that fully cancel out are dropped.
pub(crate) fn zip_indices(deployed: &DigestIndex, local: &DigestIndex) -> Vec<ResourceMove> {
    let keys = deployed
        .keys()
        .chain(local.keys().filter(|k| !deployed.contains_key(*k)));
    keys.filter_map(|digest| {
        let mv = ResourceMove {
            sources: deployed.get(digest).cloned().unwrap_or_default(),
            destinations: local.get(digest).cloned().unwrap_or_default(),
        }
        .self_filtered();
        (!mv.is_empty()).then_some(mv)
    })
    .collect()
}

/// Enforces the "refactor only moves" contract: the two indices must share
/// their digest keys with matching per-key cardinality.
///
/// Bucket entries pair up positionally; the surplus beyond what the other
/// side matches is reported as removed (deployed surplus) or added (local
/// surplus).
pub(crate) fn ensure_isomorphic(
    deployed: &DigestIndex,
    local: &DigestIndex,
    deployed_stacks: &StackSet<'_>,
    local_stacks: &StackSet<'_>,
) -> Result<()> {
    let mut removed = Vec::new();
    let mut added = Vec::new();

    for (digest, sources) in deployed {
        let matched = local.get(digest).map(Vec::len).unwrap_or(0);
        removed.extend(sources.iter().skip(matched).map(|l| deployed_stacks.path(l)));
    }
    for (digest, destinations) in local {
        let matched = deployed.get(digest).map(Vec::len).unwrap_or(0);
        added.extend(
            destinations
                .iter()
                .skip(matched)
                .map(|l| local_stacks.path(l)),
        );
    }

    if removed.is_empty() && added.is_empty() {
        return Ok(());
    }
    Err(Error::ModificationDetected {
        removed,
        added,
        deployed_stacks: deployed_stacks
            .stacks()
            .map(|s| s.stack_name.clone())
            .collect(),
        local_stacks: local_stacks.stacks().map(|s| s.stack_name.clone()).collect(),
    })
}

/// Splits ambiguous moves with the supplied overrides, then partitions the
/// result into unambiguous and still-ambiguous moves.
pub(crate) fn resolve_moves(
    moves: Vec<ResourceMove>,
    overrides: &[Mapping],
) -> (Vec<ResourceMove>, Vec<ResourceMove>) {
    let mut unambiguous = Vec::new();
    let mut ambiguous = Vec::new();

    for mut mv in moves {
        if !mv.is_ambiguous() {
            unambiguous.push(mv);
            continue;
        }
        for override_mapping in overrides {
            let source_at = mv.sources.iter().position(|s| *s == override_mapping.source);
            let destination_at = mv
                .destinations
                .iter()
                .position(|d| *d == override_mapping.destination);
            if let (Some(source_at), Some(destination_at)) = (source_at, destination_at) {
                log::debug!("override {override_mapping} splits an ambiguous move");
                unambiguous.push(ResourceMove {
                    sources: vec![mv.sources.remove(source_at)],
                    destinations: vec![mv.destinations.remove(destination_at)],
                });
            }
        }
        if mv.is_ambiguous() {
            ambiguous.push(mv);
        } else if !mv.is_empty() {
            unambiguous.push(mv);
        }
    }

    (unambiguous, ambiguous)
}

/// Extracts mappings from unambiguous moves: one source, one destination,
/// and actually somewhere to go.
pub(crate) fn extract_mappings(moves: &[ResourceMove]) -> Vec<Mapping> {
    moves
        .iter()
        .filter_map(|mv| match (mv.sources.as_slice(), mv.destinations.as_slice()) {
            ([source], [destination]) if source != destination => {
                Some(Mapping::new(source.clone(), destination.clone()))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn loc(stack: &str, id: &str) -> Location {
        Location::new(stack, id)
    }

    fn index(entries: &[(&str, &[Location])]) -> DigestIndex {
        entries
            .iter()
            .map(|(digest, locations)| (digest.to_string(), locations.to_vec()))
            .collect()
    }

    #[test]
    fn zipping_pairs_buckets_and_drops_unmoved_locations() {
        let deployed = index(&[
            ("d1", &[loc("Foo", "A")]),
            ("d2", &[loc("Foo", "Same")]),
        ]);
        let local = index(&[
            ("d1", &[loc("Bar", "A")]),
            ("d2", &[loc("Foo", "Same")]),
        ]);
        let moves = zip_indices(&deployed, &local);
        assert_eq!(
            moves,
            vec![ResourceMove {
                sources: vec![loc("Foo", "A")],
                destinations: vec![loc("Bar", "A")],
            }]
        );
    }

    #[test]
    fn self_filtering_respects_multiplicity() {
        let deployed = index(&[("d1", &[loc("Foo", "A"), loc("Foo", "B")])]);
        let local = index(&[("d1", &[loc("Foo", "B"), loc("Foo", "C")])]);
        let moves = zip_indices(&deployed, &local);
        assert_eq!(
            moves,
            vec![ResourceMove {
                sources: vec![loc("Foo", "A")],
                destinations: vec![loc("Foo", "C")],
            }]
        );
    }

    #[test]
    fn ambiguity_requires_both_sides_and_multiplicity() {
        let one_to_one = ResourceMove {
            sources: vec![loc("Foo", "A")],
            destinations: vec![loc("Bar", "A")],
        };
        let fan_out = ResourceMove {
            sources: vec![loc("Foo", "A")],
            destinations: vec![loc("Bar", "A"), loc("Bar", "B")],
        };
        let addition = ResourceMove {
            sources: vec![],
            destinations: vec![loc("Bar", "A"), loc("Bar", "B")],
        };
        assert!(!one_to_one.is_ambiguous());
        assert!(fan_out.is_ambiguous());
        assert!(!addition.is_ambiguous());
    }

    #[test]
    fn overrides_split_ambiguous_moves() {
        let moves = vec![ResourceMove {
            sources: vec![loc("Foo", "A"), loc("Foo", "B")],
            destinations: vec![loc("Bar", "C"), loc("Bar", "D")],
        }];
        let overrides = vec![Mapping::new(loc("Foo", "A"), loc("Bar", "D"))];
        let (unambiguous, ambiguous) = resolve_moves(moves, &overrides);
        assert!(ambiguous.is_empty(), "residue is a single pair: {ambiguous:?}");
        assert_eq!(
            extract_mappings(&unambiguous),
            vec![
                Mapping::new(loc("Foo", "A"), loc("Bar", "D")),
                Mapping::new(loc("Foo", "B"), loc("Bar", "C")),
            ]
        );
    }

    #[test]
    fn unmatched_overrides_leave_the_move_ambiguous() {
        let moves = vec![ResourceMove {
            sources: vec![loc("Foo", "A"), loc("Foo", "B"), loc("Foo", "C")],
            destinations: vec![loc("Bar", "D"), loc("Bar", "E"), loc("Bar", "F")],
        }];
        let overrides = vec![Mapping::new(loc("Foo", "A"), loc("Bar", "D"))];
        let (unambiguous, ambiguous) = resolve_moves(moves, &overrides);
        assert_eq!(extract_mappings(&unambiguous).len(), 1);
        assert_eq!(
            ambiguous,
            vec![ResourceMove {
                sources: vec![loc("Foo", "B"), loc("Foo", "C")],
                destinations: vec![loc("Bar", "E"), loc("Bar", "F")],
            }]
        );
    }

    #[test]
    fn extraction_skips_additions_deletions_and_trivial_moves() {
        let moves = vec![
            ResourceMove {
                sources: vec![],
                destinations: vec![loc("Bar", "New")],
            },
            ResourceMove {
                sources: vec![loc("Foo", "Gone")],
                destinations: vec![],
            },
            ResourceMove {
                sources: vec![loc("Foo", "Same")],
                destinations: vec![loc("Foo", "Same")],
            },
        ];
        assert!(extract_mappings(&moves).is_empty());
    }
}
