#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};

use value_cpa::adjustment::AssignmentCounts;
use value_cpa::cfa::{CfaEdge, CfaNode, NodeId, NodeKind};
use value_cpa::cpa::ValueAnalysis;
use value_cpa::error::Result;
use value_cpa::precision::ValuePrecision;
use value_cpa::refiner::{ErrorPath, RefinementResult};
use value_cpa::state::ValueState;

const MAX_STEPS: usize = 10_000;

/// A hand-built CFA.
pub struct Program {
    pub entry: NodeId,
    pub error: Option<NodeId>,
    nodes: BTreeMap<NodeId, CfaNode>,
    edges: Vec<CfaEdge>,
}

impl Program {
    pub fn new(entry: u32) -> Self {
        Program {
            entry: NodeId(entry),
            error: None,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn edge(mut self, edge: CfaEdge) -> Self {
        let by_assume = matches!(edge.kind, value_cpa::cfa::EdgeKind::Assume { .. });
        self.node_mut(edge.predecessor, &edge.function);
        let successor = self.node_mut(edge.successor, &edge.function);
        successor.entering_edges += 1;
        successor.entered_by_assume |= by_assume;
        self.edges.push(edge);
        self
    }

    pub fn error_at(mut self, node: u32) -> Self {
        self.error = Some(NodeId(node));
        self
    }

    pub fn loop_head(mut self, node: u32) -> Self {
        if let Some(n) = self.nodes.get_mut(&NodeId(node)) {
            n.loop_head = true;
        }
        self
    }

    pub fn function_entry(mut self, node: u32) -> Self {
        if let Some(n) = self.nodes.get_mut(&NodeId(node)) {
            n.kind = NodeKind::FunctionEntry;
        }
        self
    }

    fn node_mut(&mut self, id: NodeId, function: &str) -> &mut CfaNode {
        self.nodes.entry(id).or_insert_with(|| {
            let mut node = CfaNode::new(id.0, function);
            node.entering_edges = 0;
            node
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&CfaNode> {
        self.nodes.get(&id)
    }

    pub fn leaving(&self, id: NodeId) -> impl Iterator<Item = &CfaEdge> {
        self.edges.iter().filter(move |e| e.predecessor == id)
    }
}

pub struct Exploration {
    pub reached: BTreeMap<NodeId, Vec<ValueState>>,
    pub precision: ValuePrecision,
    pub error_path: Option<ErrorPath>,
    pub steps: usize,
    pub complete: bool,
}

impl Exploration {
    pub fn states_at(&self, node: u32) -> &[ValueState] {
        self.reached.get(&NodeId(node)).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Item {
    node: NodeId,
    state: ValueState,
    counts: AssignmentCounts,
    path: Vec<CfaEdge>,
}

/// Worklist fixed point of `analysis` over `program`, stopping at the first
/// state that reaches the error node.
pub fn explore(analysis: &ValueAnalysis, program: &Program, precision: ValuePrecision) -> Result<Exploration> {
    let mut precision = precision;
    let path_counts = precision.soft_path_threshold().is_enabled() || precision.hard_path_threshold().is_enabled();
    let mut reached: BTreeMap<NodeId, Vec<ValueState>> = BTreeMap::new();
    let initial = analysis.initial_state();
    reached.entry(program.entry).or_default().push(initial.clone());

    let mut waitlist = VecDeque::from([Item {
        node: program.entry,
        state: initial,
        counts: AssignmentCounts::new(),
        path: Vec::new(),
    }]);
    let mut steps = 0;

    while let Some(item) = waitlist.pop_front() {
        steps += 1;
        if steps > MAX_STEPS {
            return Ok(Exploration {
                reached,
                precision,
                error_path: None,
                steps,
                complete: false,
            });
        }

        for edge in program.leaving(item.node) {
            let Some(next) = analysis.successor(&item.state, &precision, edge, &[])? else {
                continue;
            };
            let mut counts = item.counts.clone();
            counts.observe(&item.state, &next);

            let Some(node) = program.node(edge.successor) else {
                continue;
            };
            let adjusted = analysis.adjustment().prec(
                &next,
                &precision,
                node,
                &reached,
                if path_counts { Some(&counts) } else { None },
            );
            precision = adjusted.precision;
            let next = adjusted.state;

            let mut path = item.path.clone();
            path.push(edge.clone());

            if program.error == Some(edge.successor) {
                reached.entry(edge.successor).or_default().push(next);
                return Ok(Exploration {
                    reached,
                    precision,
                    error_path: Some(ErrorPath::new(path)),
                    steps,
                    complete: false,
                });
            }

            let at_node = reached.entry(edge.successor).or_default();
            for other in at_node.iter_mut() {
                let merged = analysis.merge().merge(&next, other);
                if merged != *other {
                    *other = merged.clone();
                    waitlist.push_back(Item {
                        node: edge.successor,
                        state: merged,
                        counts: counts.clone(),
                        path: path.clone(),
                    });
                }
            }
            if analysis.stop().stop(&next, at_node.iter()) {
                continue;
            }
            at_node.push(next.clone());
            waitlist.push_back(Item {
                node: edge.successor,
                state: next,
                counts,
                path,
            });
        }
    }

    Ok(Exploration {
        reached,
        precision,
        error_path: None,
        steps,
        complete: true,
    })
}

#[derive(Debug)]
pub enum Verdict {
    Safe { rounds: usize },
    Unsafe(ErrorPath),
}

/// Explores and refines until the program is proved safe or a feasible error
/// path is found.
pub fn verify(analysis: &ValueAnalysis, program: &Program, precision: ValuePrecision) -> Result<Verdict> {
    let mut refiner = analysis.refiner();
    let mut precision = precision;
    loop {
        let exploration = explore(analysis, program, precision.clone())?;
        let Some(path) = exploration.error_path else {
            return Ok(Verdict::Safe {
                rounds: refiner.rounds(),
            });
        };
        match refiner.refine(&path, &exploration.precision, analysis.transfer())? {
            RefinementResult::Feasible => return Ok(Verdict::Unsafe(path)),
            RefinementResult::Spurious(refinement) => precision = refinement.precision,
        }
    }
}
