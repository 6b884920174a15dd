//! Runs the value analysis with refinement on a small built-in program:
//!
//! ```c
//! int g = 0;
//! int step(int a) { return a + 1; }
//! int main() {
//!     int i = 0;
//!     int t = 0;
//!     while (i < BOUND) { i = step(i); t = 2 * i; }
//!     if (g != 0) ERROR;
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use clap::Parser;

use value_cpa::cfa::{CallSite, CfaEdge, CfaNode, Declaration, EdgeKind, NodeId, Parameter};
use value_cpa::config::ValueAnalysisOptions;
use value_cpa::cpa::ValueAnalysis;
use value_cpa::expr::Expression;
use value_cpa::machine::CType;
use value_cpa::precision::{parse_precision, ValuePrecision};
use value_cpa::refiner::{ErrorPath, RefinementResult};
use value_cpa::state::ValueState;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Loop bound.
    #[arg(value_name = "INT", default_value = "5")]
    bound: i64,

    /// Properties file with `cpa.value.*` options.
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Start from a precision that tracks only `main::t` at the loop head.
    #[clap(long)]
    coarse: bool,

    /// Print the final precision in precision-file format.
    #[clap(long)]
    dump_precision: bool,
}

fn program(bound: i64) -> Vec<CfaEdge> {
    let i = || Expression::var("i");
    let site = CallSite::new(Some(i()), "step", vec![i()]);
    vec![
        CfaEdge::declaration(1, 1, 2, "main", Declaration::global("g", CType::int(), Some(Expression::int(0)))),
        CfaEdge::declaration(2, 2, 3, "main", Declaration::variable("i", CType::int(), Some(Expression::int(0)))),
        CfaEdge::declaration(3, 3, 4, "main", Declaration::variable("t", CType::int(), Some(Expression::int(0)))),
        CfaEdge::assume(4, 4, 5, "main", i().lt(Expression::int(bound)), true),
        CfaEdge::new(
            5,
            5,
            20,
            "main",
            EdgeKind::FunctionCall {
                site: site.clone(),
                parameters: vec![Parameter::new("a", CType::int())],
            },
        ),
        CfaEdge::new(6, 20, 21, "step", EdgeKind::Return(Some(Expression::var("a").add(Expression::int(1))))),
        CfaEdge::new(
            7,
            21,
            6,
            "step",
            EdgeKind::FunctionReturn {
                site,
                caller: "main".into(),
            },
        ),
        CfaEdge::assign(8, 6, 4, "main", Expression::var("t"), Expression::int(2).mul(i())),
        CfaEdge::assume(9, 4, 7, "main", i().lt(Expression::int(bound)), false),
        CfaEdge::assume(10, 7, 99, "main", Expression::var("g").ne(Expression::int(0)), true),
        CfaEdge::assume(11, 7, 8, "main", Expression::var("g").ne(Expression::int(0)), false),
    ]
}

fn nodes(edges: &[CfaEdge]) -> BTreeMap<NodeId, CfaNode> {
    let mut nodes: BTreeMap<NodeId, CfaNode> = BTreeMap::new();
    for edge in edges {
        for (id, function) in [(edge.predecessor, &edge.function), (edge.successor, &edge.function)] {
            nodes
                .entry(id)
                .or_insert_with(|| CfaNode::new(id.0, function.as_str()).with_entering(0, false));
        }
        if let Some(node) = nodes.get_mut(&edge.successor) {
            node.entering_edges += 1;
            node.entered_by_assume |= matches!(edge.kind, EdgeKind::Assume { .. });
        }
    }
    if let Some(head) = nodes.get_mut(&NodeId(4)) {
        head.loop_head = true;
    }
    nodes
}

/// Explores until the waitlist is empty or the error node is reached.
fn explore(
    analysis: &ValueAnalysis,
    edges: &[CfaEdge],
    precision: &mut ValuePrecision,
) -> color_eyre::Result<(Option<ErrorPath>, usize)> {
    let nodes = nodes(edges);
    let mut reached: BTreeMap<NodeId, Vec<ValueState>> = BTreeMap::new();
    let mut waitlist = VecDeque::from([(NodeId(1), analysis.initial_state(), Vec::<CfaEdge>::new())]);
    let mut states = 0;

    while let Some((node, state, path)) = waitlist.pop_front() {
        for edge in edges.iter().filter(|e| e.predecessor == node) {
            let Some(next) = analysis.successor(&state, precision, edge, &[])? else {
                continue;
            };
            let Some(target) = nodes.get(&edge.successor) else {
                continue;
            };
            let adjusted = analysis.adjustment().prec(&next, precision, target, &reached, None);
            *precision = adjusted.precision;

            let mut path = path.clone();
            path.push(edge.clone());
            if edge.successor == NodeId(99) {
                return Ok((Some(ErrorPath::new(path)), states));
            }

            let at_node = reached.entry(edge.successor).or_default();
            if analysis.stop().stop(&adjusted.state, at_node.iter()) {
                continue;
            }
            log::debug!("{} at {}", adjusted.state, edge.successor);
            at_node.push(adjusted.state.clone());
            states += 1;
            waitlist.push_back((edge.successor, adjusted.state, path));
        }
    }
    Ok((None, states))
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let options = match &args.config {
        Some(path) => ValueAnalysisOptions::load(path)?,
        None => ValueAnalysisOptions::default(),
    };
    let analysis = ValueAnalysis::new(options)?;
    let edges = program(args.bound);

    let mut precision = analysis.initial_precision();
    if args.coarse {
        precision = precision.refine(&parse_precision("N4:\nmain::t\n")?);
    }

    let mut refiner = analysis.refiner();
    loop {
        let (error, states) = explore(&analysis, &edges, &mut precision)?;
        println!("Explored {} states", states);
        let Some(path) = error else {
            println!("Program is SAFE after {} refinements", refiner.rounds());
            break;
        };
        match refiner.refine(&path, &precision, analysis.transfer())? {
            RefinementResult::Feasible => {
                println!("Program is UNSAFE, error path of {} edges:", path.len());
                for edge in path.edges() {
                    println!("  {}", edge);
                }
                break;
            }
            RefinementResult::Spurious(refinement) => {
                println!(
                    "Spurious error path, tracking {} more locations",
                    refinement.increment.values().map(|s| s.len()).sum::<usize>()
                );
                precision = refinement.precision;
            }
        }
    }

    if args.dump_precision {
        print!("{}", precision.to_precision_file());
    }
    let diagnostics = analysis.transfer().diagnostics();
    if !diagnostics.is_empty() {
        println!("{} diagnostics reported", diagnostics.len());
    }

    println!("Total time: {:.3} s", time_total.elapsed().as_secs_f64());
    Ok(())
}
