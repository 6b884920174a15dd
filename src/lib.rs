//! # value-cpa: explicit-value analysis for C programs
//!
//! **`value-cpa`** is the explicit-value component of a configurable program
//! analysis: it tracks, for every program location, which variables hold a
//! single known integer value, and refines what it tracks from spurious error
//! paths (CEGAR).
//!
//! ## What is tracked?
//!
//! An abstract state ([`ValueState`][crate::state::ValueState]) maps memory
//! locations (`f::x`, globals `g`, struct members `f::s/4`) to 64-bit values.
//! A missing entry means "unknown". States are persistent maps, so handing a
//! copy to every successor is cheap.
//!
//! ## Key Features
//!
//! - **C integer semantics**: values are truncated to the width and signedness
//!   of their type on a configurable [`MachineModel`][crate::machine::MachineModel].
//! - **Branch learning**: `[x == 5]` on an unknown `x` yields `x = 5` on the
//!   true branch.
//! - **Cooperation**: what needs pointer or type information is handed back as
//!   [`MissingInformation`][crate::transfer::MissingInformation] and resolved by
//!   `strengthen` against sibling analyses.
//! - **Abstraction**: blacklists, per-node tracked sets, path and reached-set
//!   thresholds (see [`adjustment`]).
//! - **Refinement**: backward slicing of infeasible error paths (see [`refiner`]).
//!
//! ## Basic Usage
//!
//! ```rust
//! use value_cpa::cfa::CfaEdge;
//! use value_cpa::config::ValueAnalysisOptions;
//! use value_cpa::cpa::ValueAnalysis;
//! use value_cpa::expr::Expression;
//! use value_cpa::location::MemoryLocation;
//!
//! let analysis = ValueAnalysis::new(ValueAnalysisOptions::default()).unwrap();
//! let precision = analysis.initial_precision();
//!
//! // x = 2 * 21;
//! let edge = CfaEdge::assign(1, 1, 2, "main", Expression::var("x"), Expression::int(2).mul(Expression::int(21)));
//! let state = analysis.successor(&analysis.initial_state(), &precision, &edge, &[]).unwrap().unwrap();
//! assert_eq!(state.value_of(&MemoryLocation::local("main", "x")), Some(42));
//!
//! // [x != 42] is infeasible
//! let branch = CfaEdge::assume(2, 2, 3, "main", Expression::var("x").ne(Expression::int(42)), true);
//! assert!(analysis.successor(&state, &precision, &branch, &[]).unwrap().is_none());
//! ```
//!
//! ## Core Components
//!
//! - **[`eval`]**: expression evaluation with C casts.
//! - **[`transfer`]**: one state transformer per CFA edge kind.
//! - **[`domain`]**: join, partial order, merge and stop operators.
//! - **[`precision`]** and **[`adjustment`]**: what to track, and where to forget.
//! - **[`refiner`]**: CEGAR.

pub mod adjustment;
pub mod cfa;
pub mod config;
pub mod cpa;
pub mod domain;
pub mod error;
pub mod eval;
pub mod expr;
pub mod location;
pub mod machine;
pub mod precision;
pub mod query;
pub mod refiner;
pub mod sibling;
pub mod state;
pub mod transfer;
