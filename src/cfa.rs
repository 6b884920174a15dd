//! Control-flow automaton: nodes and the edges the transfer relation consumes.
//!
//! Building a CFA from source is someone else's job; this module only fixes the
//! shape of what arrives. Constructors are provided so that tests and demos can
//! assemble small automata by hand.

use std::fmt;

use crate::expr::Expression;
use crate::machine::CType;

/// CFA node identifier (the `N<id>` of precision files).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// CFA edge identifier, used to key per-edge diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EdgeId(pub u32);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Normal,
    FunctionEntry,
    FunctionExit,
}

/// A program location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfaNode {
    pub id: NodeId,
    pub function: String,
    pub kind: NodeKind,
    /// Number of edges entering this node.
    pub entering_edges: usize,
    /// Whether some entering edge is an assume edge.
    pub entered_by_assume: bool,
    pub loop_head: bool,
}

impl CfaNode {
    pub fn new(id: u32, function: impl Into<String>) -> Self {
        CfaNode {
            id: NodeId(id),
            function: function.into(),
            kind: NodeKind::Normal,
            entering_edges: 1,
            entered_by_assume: false,
            loop_head: false,
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_entering(mut self, count: usize, by_assume: bool) -> Self {
        self.entering_edges = count;
        self.entered_by_assume = by_assume;
        self
    }

    pub fn as_loop_head(mut self) -> Self {
        self.loop_head = true;
        self
    }

    pub fn is_join(&self) -> bool {
        self.entering_edges > 1
    }

    pub fn is_function_boundary(&self) -> bool {
        matches!(self.kind, NodeKind::FunctionEntry | NodeKind::FunctionExit)
    }
}

/// Initializer of a declared variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Expression(Expression),
    /// Brace-enclosed list, for aggregates.
    List(Vec<Initializer>),
}

/// Declarations appearing on declaration edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Variable {
        name: String,
        ty: CType,
        is_global: bool,
        initializer: Option<Initializer>,
    },
    Function {
        name: String,
    },
    Type {
        name: String,
    },
}

impl Declaration {
    pub fn variable(name: impl Into<String>, ty: CType, initializer: Option<Expression>) -> Self {
        Declaration::Variable {
            name: name.into(),
            ty,
            is_global: false,
            initializer: initializer.map(Initializer::Expression),
        }
    }

    pub fn global(name: impl Into<String>, ty: CType, initializer: Option<Expression>) -> Self {
        Declaration::Variable {
            name: name.into(),
            ty,
            is_global: true,
            initializer: initializer.map(Initializer::Expression),
        }
    }
}

/// Statements appearing on statement edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `lhs = rhs;` (the right-hand side may be a call)
    Assignment { lhs: Expression, rhs: Expression },
    /// Expression evaluated for its side effects only, e.g. `f(x);`
    Expression(Expression),
}

/// Formal parameter of a called function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: CType,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: CType) -> Self {
        Parameter { name: name.into(), ty }
    }
}

/// A call site: `lhs = function(args)` or `function(args)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub lhs: Option<Expression>,
    pub function: String,
    pub args: Vec<Expression>,
}

impl CallSite {
    pub fn new(lhs: Option<Expression>, function: impl Into<String>, args: Vec<Expression>) -> Self {
        CallSite {
            lhs,
            function: function.into(),
            args,
        }
    }
}

/// Edge payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeKind {
    Blank,
    Declaration(Declaration),
    Statement(Statement),
    Assume { expression: Expression, truth: bool },
    /// Edge from the call site into the callee's entry node.
    FunctionCall { site: CallSite, parameters: Vec<Parameter> },
    /// `return e;` inside the callee.
    Return(Option<Expression>),
    /// Edge from the callee's exit node back to the caller.
    FunctionReturn { site: CallSite, caller: String },
    /// Sequence of edges collapsed into one (e.g. a basic block).
    Multi(Vec<CfaEdge>),
}

/// A CFA edge.
#[derive(Debug, Clone, PartialEq)]
pub struct CfaEdge {
    pub id: EdgeId,
    pub predecessor: NodeId,
    pub successor: NodeId,
    /// Function the edge's predecessor belongs to.
    pub function: String,
    pub kind: EdgeKind,
}

impl CfaEdge {
    pub fn new(id: u32, predecessor: u32, successor: u32, function: impl Into<String>, kind: EdgeKind) -> Self {
        CfaEdge {
            id: EdgeId(id),
            predecessor: NodeId(predecessor),
            successor: NodeId(successor),
            function: function.into(),
            kind,
        }
    }

    pub fn blank(id: u32, predecessor: u32, successor: u32, function: impl Into<String>) -> Self {
        CfaEdge::new(id, predecessor, successor, function, EdgeKind::Blank)
    }

    pub fn declaration(id: u32, predecessor: u32, successor: u32, function: impl Into<String>, decl: Declaration) -> Self {
        CfaEdge::new(id, predecessor, successor, function, EdgeKind::Declaration(decl))
    }

    pub fn assign(
        id: u32,
        predecessor: u32,
        successor: u32,
        function: impl Into<String>,
        lhs: Expression,
        rhs: Expression,
    ) -> Self {
        CfaEdge::new(
            id,
            predecessor,
            successor,
            function,
            EdgeKind::Statement(Statement::Assignment { lhs, rhs }),
        )
    }

    pub fn assume(
        id: u32,
        predecessor: u32,
        successor: u32,
        function: impl Into<String>,
        expression: Expression,
        truth: bool,
    ) -> Self {
        CfaEdge::new(id, predecessor, successor, function, EdgeKind::Assume { expression, truth })
    }

    /// Human-readable source form, used in log lines.
    pub fn code(&self) -> String {
        match &self.kind {
            EdgeKind::Blank => String::new(),
            EdgeKind::Declaration(Declaration::Variable {
                name, ty, initializer, ..
            }) => match initializer {
                Some(Initializer::Expression(e)) => format!("{} {} = {};", ty, name, e),
                Some(Initializer::List(items)) => format!("{} {} = {{ {} items }};", ty, name, items.len()),
                None => format!("{} {};", ty, name),
            },
            EdgeKind::Declaration(Declaration::Function { name }) => format!("{}();", name),
            EdgeKind::Declaration(Declaration::Type { name }) => format!("typedef {};", name),
            EdgeKind::Statement(Statement::Assignment { lhs, rhs }) => format!("{} = {};", lhs, rhs),
            EdgeKind::Statement(Statement::Expression(e)) => format!("{};", e),
            EdgeKind::Assume { expression, truth } => {
                if *truth {
                    format!("[{}]", expression)
                } else {
                    format!("[!{}]", expression)
                }
            }
            EdgeKind::FunctionCall { site, .. } => call_code(site),
            EdgeKind::Return(Some(e)) => format!("return {};", e),
            EdgeKind::Return(None) => "return;".to_string(),
            EdgeKind::FunctionReturn { site, .. } => format!("return from {}", call_code(site)),
            EdgeKind::Multi(edges) => edges.iter().map(CfaEdge::code).collect::<Vec<_>>().join(" "),
        }
    }
}

fn call_code(site: &CallSite) -> String {
    let args = site.args.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    match &site.lhs {
        Some(lhs) => format!("{} = {}({});", lhs, site.function, args),
        None => format!("{}({});", site.function, args),
    }
}

impl fmt::Display for CfaEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{{{}}}-> {}", self.predecessor, self.code(), self.successor)
    }
}
