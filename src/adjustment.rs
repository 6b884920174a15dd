//! Precision adjustment: the abstraction step run on every new state.
//!
//! At an abstraction point the state loses the variables the precision does
//! not want, in three stages:
//!
//! 1. untracked variables written since the last abstraction point,
//! 2. variables that took too many distinct values at this node across the
//!    reached set (they are also marked exceeded in the precision),
//! 3. variables written too often along the current path.
//!
//! Stages 2 and 3 commute; both only ever remove entries.

use std::collections::{BTreeMap, BTreeSet};

use im::OrdMap;

use crate::cfa::{CfaNode, NodeId};
use crate::location::MemoryLocation;
use crate::precision::ValuePrecision;
use crate::state::ValueState;

/// Nodes at which abstraction is materialized. With every flag off, every
/// node is an abstraction point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbstractionPoints {
    pub at_assumes: bool,
    pub at_joins: bool,
    pub at_functions: bool,
    pub at_loops: bool,
}

impl AbstractionPoints {
    pub fn is_everywhere(&self) -> bool {
        !(self.at_assumes || self.at_joins || self.at_functions || self.at_loops)
    }

    pub fn applies_to(&self, node: &CfaNode) -> bool {
        self.is_everywhere()
            || (self.at_assumes && node.entered_by_assume)
            || (self.at_joins && node.is_join())
            || (self.at_functions && node.is_function_boundary())
            || (self.at_loops && node.loop_head)
    }
}

/// Read access to the states already reached at a node.
pub trait ReachedSetView {
    fn states_at<'a>(&'a self, node: NodeId) -> Box<dyn Iterator<Item = &'a ValueState> + 'a>;
}

impl ReachedSetView for BTreeMap<NodeId, Vec<ValueState>> {
    fn states_at<'a>(&'a self, node: NodeId) -> Box<dyn Iterator<Item = &'a ValueState> + 'a> {
        match self.get(&node) {
            Some(states) => Box::new(states.iter()),
            None => Box::new(std::iter::empty()),
        }
    }
}

/// How often each variable changed its value along one path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentCounts {
    counts: OrdMap<MemoryLocation, u32>,
}

impl AssignmentCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, location: MemoryLocation) {
        let count = self.count(&location);
        self.counts.insert(location, count + 1);
    }

    pub fn count(&self, location: &MemoryLocation) -> u32 {
        self.counts.get(location).copied().unwrap_or(0)
    }

    /// Counts every location that holds a new known value in `after`.
    pub fn observe(&mut self, before: &ValueState, after: &ValueState) {
        for (location, value) in after.iter() {
            if before.value_of(location) != Some(value) {
                self.increment(location.clone());
            }
        }
    }
}

/// Outcome of [`PrecisionAdjustment::prec`].
#[derive(Debug, Clone)]
pub struct Adjusted {
    pub state: ValueState,
    pub precision: ValuePrecision,
    /// Whether `node` was an abstraction point.
    pub abstracted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PrecisionAdjustment {
    points: AbstractionPoints,
}

impl PrecisionAdjustment {
    pub fn new(points: AbstractionPoints) -> Self {
        PrecisionAdjustment { points }
    }

    pub fn points(&self) -> &AbstractionPoints {
        &self.points
    }

    pub fn prec(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        node: &CfaNode,
        reached: &dyn ReachedSetView,
        counts: Option<&AssignmentCounts>,
    ) -> Adjusted {
        if !self.points.applies_to(node) {
            return Adjusted {
                state: state.clone(),
                precision: precision.clone(),
                abstracted: false,
            };
        }

        let mut state = state.clone();
        let mut precision = precision.clone();

        if counts.is_none() {
            forget_untracked(&mut state, &precision, node.id);
        }

        if precision.reached_set_threshold().is_enabled() {
            for location in exceeding_reached_set(&state, &precision, node.id, reached) {
                log::debug!("{} took too many values at {}, forgetting it", location, node.id);
                state.forget_variable(&location);
                precision.reached_set_threshold_mut().set_exceeded(location);
            }
        }

        if let Some(counts) = counts {
            forget_untracked(&mut state, &precision, node.id);
            let soft = precision.soft_path_threshold();
            let hard = precision.hard_path_threshold();
            let over: Vec<MemoryLocation> = state
                .locations()
                .filter(|location| {
                    let count = counts.count(location) as usize;
                    hard.exceeds(count)
                        || (soft.exceeds(count) && !precision.is_explicitly_tracked(location, node.id))
                })
                .cloned()
                .collect();
            for location in &over {
                log::debug!("{} written {} times on this path, forgetting it", location, counts.count(location));
                state.forget(location);
            }
        }

        state.clear_delta();
        Adjusted {
            state,
            precision,
            abstracted: true,
        }
    }
}

fn forget_untracked(state: &mut ValueState, precision: &ValuePrecision, node: NodeId) {
    let untracked: Vec<MemoryLocation> = state
        .delta()
        .iter()
        .filter(|location| !precision.is_tracking(location, node))
        .cloned()
        .collect();
    for location in &untracked {
        state.forget(location);
    }
}

/// Known variables whose distinct values at `node` (this state included) go
/// over the reached-set threshold.
fn exceeding_reached_set(
    state: &ValueState,
    precision: &ValuePrecision,
    node: NodeId,
    reached: &dyn ReachedSetView,
) -> Vec<MemoryLocation> {
    let mut values: BTreeMap<&MemoryLocation, BTreeSet<i64>> = BTreeMap::new();
    for other in reached.states_at(node).chain(std::iter::once(state)) {
        for (location, value) in other.iter() {
            values.entry(location).or_default().insert(value);
        }
    }
    let policy = precision.reached_set_threshold();
    values
        .into_iter()
        .filter(|(location, seen)| policy.exceeds(seen.len()) && state.contains(location))
        .map(|(location, _)| location.clone())
        .collect()
}
