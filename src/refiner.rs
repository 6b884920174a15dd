//! Counterexample-guided refinement of the value precision.
//!
//! A candidate error path is first replayed without abstraction. If the
//! replay reaches the end, the path is a real counterexample. Otherwise the
//! refiner slices the path backward from the variables the failing branch
//! depends on. A variable of the slice is tracked at every node of the path
//! after the point where it joined the slice.
//!
//! Progress is only checked heuristically: a path whose hash was refined
//! before fails the round with [`AnalysisError::RefinementFailed`].

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};

use crate::cfa::{CfaEdge, Declaration, EdgeKind, Initializer, NodeId, Statement};
use crate::config::ValueAnalysisOptions;
use crate::error::{AnalysisError, Result};
use crate::location::MemoryLocation;
use crate::precision::{TrackedSets, ValuePrecision};
use crate::state::ValueState;
use crate::transfer::{TransferRelation, ValueTransferRelation, RETURN_VARIABLE};

/// A path through the CFA ending in an error location.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPath {
    edges: Vec<CfaEdge>,
}

impl ErrorPath {
    pub fn new(edges: Vec<CfaEdge>) -> Self {
        ErrorPath { edges }
    }

    pub fn edges(&self) -> &[CfaEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn first_node(&self) -> Option<NodeId> {
        self.edges.first().map(|e| e.predecessor)
    }

    /// Hash over the edge and node ids of the path.
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for edge in &self.edges {
            edge.id.hash(&mut hasher);
            edge.predecessor.hash(&mut hasher);
            edge.successor.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// A predicate analysis running next to the value analysis.
pub trait PredicateCollaborator {
    /// Variables its interpolants mention, per node, for this path.
    fn relevant_variables(&mut self, path: &ErrorPath) -> Result<TrackedSets>;

    /// Whether the collaborator wants a refinement round even for a path the
    /// value analysis considers feasible.
    fn refinement_due(&self) -> bool {
        false
    }
}

/// Replays paths with a fresh transfer relation under full precision.
#[derive(Debug, Clone)]
pub struct PathFeasibilityChecker {
    options: ValueAnalysisOptions,
}

impl PathFeasibilityChecker {
    pub fn new(options: &ValueAnalysisOptions) -> Self {
        let mut options = options.clone();
        options.reference_threshold = None;
        PathFeasibilityChecker { options }
    }

    /// Final state of the replay, `None` if some edge is infeasible.
    pub fn replay(&self, path: &ErrorPath) -> Result<Option<ValueState>> {
        let relation = ValueTransferRelation::new(&self.options);
        let precision = ValuePrecision::full();
        let mut state = ValueState::new();
        for (index, edge) in path.edges().iter().enumerate() {
            match relation.transfer(&state, &precision, edge)?.successor {
                Some(next) => state = next,
                None => {
                    log::debug!("Path is infeasible at edge {} of {}: {}", index + 1, path.len(), edge);
                    return Ok(None);
                }
            }
        }
        Ok(Some(state))
    }

    pub fn is_feasible(&self, path: &ErrorPath) -> Result<bool> {
        Ok(self.replay(path)?.is_some())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefinerMode {
    Exploring,
    Refining,
}

/// A successful refinement round.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub precision: ValuePrecision,
    /// Node from which exploration has to be redone.
    pub resume_at: Option<NodeId>,
    /// What was added to the precision.
    pub increment: TrackedSets,
}

#[derive(Debug, Clone)]
pub enum RefinementResult {
    /// The path is a real counterexample.
    Feasible,
    Spurious(Refinement),
}

pub struct ValueRefiner {
    checker: PathFeasibilityChecker,
    collaborator: Option<Box<dyn PredicateCollaborator>>,
    seen: HashSet<u64>,
    mode: RefinerMode,
    rounds: usize,
}

impl ValueRefiner {
    pub fn new(options: &ValueAnalysisOptions) -> Self {
        ValueRefiner {
            checker: PathFeasibilityChecker::new(options),
            collaborator: None,
            seen: HashSet::new(),
            mode: RefinerMode::Exploring,
            rounds: 0,
        }
    }

    pub fn with_collaborator(mut self, collaborator: Box<dyn PredicateCollaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn mode(&self) -> RefinerMode {
        self.mode
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn checker(&self) -> &PathFeasibilityChecker {
        &self.checker
    }

    /// Checks `path` and refines `precision` if the path is spurious (or the
    /// collaborator asks for a round).
    pub fn refine(
        &mut self,
        path: &ErrorPath,
        precision: &ValuePrecision,
        relation: &ValueTransferRelation,
    ) -> Result<RefinementResult> {
        let feasible = self.checker.is_feasible(path)?;
        let due = self.collaborator.as_ref().is_some_and(|c| c.refinement_due());
        if feasible && !due {
            log::info!("Error path of {} edges is feasible", path.len());
            return Ok(RefinementResult::Feasible);
        }

        self.mode = RefinerMode::Refining;
        let result = self.perform_refinement(path, precision, relation);
        self.mode = RefinerMode::Exploring;
        result.map(RefinementResult::Spurious)
    }

    /// One refinement round for `path`, without the feasibility check.
    pub fn perform_refinement(
        &mut self,
        path: &ErrorPath,
        precision: &ValuePrecision,
        relation: &ValueTransferRelation,
    ) -> Result<Refinement> {
        let path_hash = path.hash_value();
        if !self.seen.insert(path_hash) {
            log::warn!("Error path {:#x} was refined before, no progress", path_hash);
            return Err(AnalysisError::RefinementFailed { path_hash });
        }
        self.rounds += 1;

        let mut increment = match self.collaborator.as_mut() {
            Some(collaborator) => collaborator.relevant_variables(path)?,
            None => TrackedSets::new(),
        };

        let mut interest: BTreeSet<MemoryLocation> = increment.values().flatten().cloned().collect();
        if self.collaborator.is_none() {
            for edge in flatten(path.edges()) {
                if let EdgeKind::Assume { expression, .. } = &edge.kind {
                    interest.extend(relation.referenced_locations(expression, &edge.function));
                }
            }
        }

        let mut resume_at = path.first_node();
        let mut resume_found = false;
        for edge in flatten(path.edges()).into_iter().rev() {
            increment
                .entry(edge.successor)
                .or_default()
                .extend(interest.iter().cloned());
            for (defined, used) in definitions(edge, relation) {
                if !interest.iter().any(|l| l.same_variable(&defined)) {
                    continue;
                }
                interest.extend(used);
                increment.entry(edge.successor).or_default().insert(defined);
                resume_at = Some(edge.predecessor);
                resume_found = true;
            }
        }
        if !resume_found {
            log::debug!("Slice is empty, resuming at the root");
        }

        let refined = precision.refine(&increment);
        log::info!(
            "Refinement round {} tracks {} more locations, resuming at {}",
            self.rounds,
            refined.tracked_len() - precision.tracked_len(),
            resume_at.map_or_else(|| "root".to_string(), |n| n.to_string())
        );
        Ok(Refinement {
            precision: refined,
            resume_at,
            increment,
        })
    }
}

/// The path with multi-edges expanded.
fn flatten(edges: &[CfaEdge]) -> Vec<&CfaEdge> {
    let mut out = Vec::new();
    for edge in edges {
        match &edge.kind {
            EdgeKind::Multi(inner) => out.extend(flatten(inner)),
            _ => out.push(edge),
        }
    }
    out
}

/// Locations `edge` defines, each with the locations its value is computed from.
fn definitions(edge: &CfaEdge, relation: &ValueTransferRelation) -> Vec<(MemoryLocation, BTreeSet<MemoryLocation>)> {
    let function = edge.function.as_str();
    match &edge.kind {
        EdgeKind::Statement(Statement::Assignment { lhs, rhs }) => relation
            .static_location(lhs, function)
            .map(|defined| (defined, relation.referenced_locations(rhs, function)))
            .into_iter()
            .collect(),
        EdgeKind::Declaration(Declaration::Variable {
            name,
            initializer: Some(init),
            ..
        }) => {
            let mut used = BTreeSet::new();
            collect_initializer(init, function, relation, &mut used);
            vec![(relation.scoped(name, function), used)]
        }
        EdgeKind::FunctionCall { site, parameters } => parameters
            .iter()
            .zip(&site.args)
            .map(|(parameter, arg)| {
                (
                    MemoryLocation::local(&site.function, &parameter.name),
                    relation.referenced_locations(arg, function),
                )
            })
            .collect(),
        EdgeKind::Return(Some(e)) => vec![(
            MemoryLocation::local(function, RETURN_VARIABLE),
            relation.referenced_locations(e, function),
        )],
        EdgeKind::FunctionReturn { site, caller } => site
            .lhs
            .as_ref()
            .and_then(|lhs| relation.static_location(lhs, caller))
            .map(|defined| {
                let used = [MemoryLocation::local(function, RETURN_VARIABLE)].into_iter().collect();
                (defined, used)
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn collect_initializer(
    init: &Initializer,
    function: &str,
    relation: &ValueTransferRelation,
    out: &mut BTreeSet<MemoryLocation>,
) {
    match init {
        Initializer::Expression(e) => out.extend(relation.referenced_locations(e, function)),
        Initializer::List(items) => {
            for item in items {
                collect_initializer(item, function, relation, out);
            }
        }
    }
}
