//! Transfer relation of the value analysis.
//!
//! Each edge kind has its own state transformer. The transformers never touch
//! the predecessor state: they clone it (cheap, the maps are persistent) and
//! modify the clone. Work that needs a sibling analysis is not stored on the
//! relation; it is returned as [`MissingInformation`] next to the successor
//! and handed back to [`ValueTransferRelation::strengthen`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::cfa::{CallSite, CfaEdge, Declaration, EdgeId, EdgeKind, Initializer, Parameter, Statement};
use crate::config::ValueAnalysisOptions;
use crate::error::{AnalysisError, Result};
use crate::eval::{Diagnostics, ValueEvaluator, ValueLookup};
use crate::expr::{BinaryOp, Expression, UnaryOp};
use crate::location::{MemoryLocation, Scoping};
use crate::machine::{cast_value, CType, IntKind, MachineModel};
use crate::precision::ValuePrecision;
use crate::sibling::SiblingState;
use crate::state::{CallFrames, ValueState};

/// Callee-scoped pseudo variable holding the value of `return e;`.
pub const RETURN_VARIABLE: &str = "__retval__";

/// Arrays longer than this are only tracked at explicitly initialized cells.
const ZERO_FILL_LIMIT: u64 = 256;

/// Abstract transfer relation: ⟦edge⟧♯(state).
pub trait TransferRelation {
    type State;
    type Precision;

    fn transfer(&self, state: &Self::State, precision: &Self::Precision, edge: &CfaEdge) -> Result<Transfer>;
}

/// Something the value analysis could not do alone on one edge.
#[derive(Debug, Clone, PartialEq)]
pub enum MissingItem {
    /// `lhs = rhs` where the target or the value needs a sibling analysis.
    Assignment {
        lhs: Expression,
        rhs: Expression,
        function: String,
        edge: EdgeId,
    },
    /// A branch condition whose value needs a sibling analysis.
    Assumption {
        expression: Expression,
        truth: bool,
        function: String,
        edge: EdgeId,
    },
}

/// Request-scoped record of [`MissingItem`]s, produced by one `transfer` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingInformation {
    items: Vec<MissingItem>,
}

impl MissingInformation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: MissingItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[MissingItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// Result of a transfer: the successor (`None` if the edge is infeasible)
/// and what is left for `strengthen`.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub successor: Option<ValueState>,
    pub missing: MissingInformation,
}

/// How one scalar cell of a declared variable is initialized.
#[derive(Clone, Copy)]
enum CellInit<'e> {
    Zero,
    Expression(&'e Expression),
}

pub struct ValueTransferRelation {
    machine: MachineModel,
    reference_threshold: Option<u32>,
    init_assumption_vars: bool,
    unsupported_functions: BTreeSet<String>,
    /// Names declared globally so far.
    globals: RefCell<BTreeSet<String>>,
    frames: CallFrames,
    diagnostics: Diagnostics,
}

impl ValueTransferRelation {
    pub fn new(options: &ValueAnalysisOptions) -> Self {
        ValueTransferRelation {
            machine: options.machine,
            reference_threshold: options.reference_threshold,
            init_assumption_vars: options.init_assumption_vars,
            unsupported_functions: options.unsupported_functions.clone(),
            globals: RefCell::new(BTreeSet::new()),
            frames: CallFrames::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn machine(&self) -> &MachineModel {
        &self.machine
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn frames(&self) -> &CallFrames {
        &self.frames
    }

    pub fn is_global(&self, name: &str) -> bool {
        self.globals.borrow().contains(name)
    }

    /// Location a plain identifier denotes inside `function`.
    pub fn scoped(&self, name: &str, function: &str) -> MemoryLocation {
        let globals = self.globals.borrow();
        Scoping::new(function, &globals).resolve(name)
    }

    /// Location of an lvalue that can be named without any state, such as
    /// `x`, `s.f` or `a[2]`.
    pub fn static_location(&self, lvalue: &Expression, function: &str) -> Option<MemoryLocation> {
        let globals = self.globals.borrow();
        let empty: BTreeMap<MemoryLocation, i64> = BTreeMap::new();
        // not an edge of the program, keep its reports out of the run
        let scratch = Diagnostics::new();
        let mut evaluator = ValueEvaluator::new(
            &self.machine,
            Scoping::new(function, &globals),
            &empty,
            &scratch,
            EdgeId(u32::MAX),
        );
        evaluator.resolve_location(lvalue)
    }

    /// Statically known locations of the variables `expression` reads.
    pub fn referenced_locations(&self, expression: &Expression, function: &str) -> BTreeSet<MemoryLocation> {
        let mut locations = BTreeSet::new();
        expression.walk(&mut |e| {
            if e.is_lvalue() {
                if let Some(location) = self.static_location(e, function) {
                    locations.insert(location);
                }
            }
        });
        locations
    }

    /// Successors of `state` along `edge`, ignoring missing information.
    pub fn successors(&self, state: &ValueState, precision: &ValuePrecision, edge: &CfaEdge) -> Result<Vec<ValueState>> {
        Ok(self.transfer(state, precision, edge)?.successor.into_iter().collect())
    }

    fn evaluator<'a>(&'a self, scoping: Scoping<'a>, lookup: &'a dyn ValueLookup, edge: EdgeId) -> ValueEvaluator<'a> {
        ValueEvaluator::new(&self.machine, scoping, lookup, &self.diagnostics, edge)
    }

    /// Stores a value, unless the variable is blacklisted.
    fn store(&self, state: &mut ValueState, location: MemoryLocation, value: i64, precision: &ValuePrecision) {
        if precision.is_blacklisted(&location) {
            state.forget(&location);
            return;
        }
        state.assign_counted(location, value, self.reference_threshold);
    }

    fn check_supported(&self, function: &str, edge: &CfaEdge) -> Result<()> {
        if self.unsupported_functions.contains(function) {
            return Err(AnalysisError::UnsupportedFunction {
                edge: edge.id,
                function: function.to_string(),
            });
        }
        Ok(())
    }

    fn check_calls(&self, expression: &Expression, edge: &CfaEdge) -> Result<()> {
        let mut called = Vec::new();
        expression.walk(&mut |e| {
            if let Expression::Call { function, .. } = e {
                called.push(function.as_str());
            }
        });
        called.into_iter().try_for_each(|f| self.check_supported(f, edge))
    }

    fn transfer_edge(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        missing: &mut MissingInformation,
    ) -> Result<Option<ValueState>> {
        match &edge.kind {
            EdgeKind::Blank => Ok(Some(state.clone())),
            EdgeKind::Declaration(declaration) => {
                self.handle_declaration(state, precision, edge, declaration, missing).map(Some)
            }
            EdgeKind::Statement(Statement::Assignment { lhs, rhs }) => {
                self.handle_assignment(state, precision, edge, lhs, rhs, missing).map(Some)
            }
            EdgeKind::Statement(Statement::Expression(expression)) => {
                self.check_calls(expression, edge)?;
                Ok(Some(state.clone()))
            }
            EdgeKind::Assume { expression, truth } => Ok(self.handle_assume(state, precision, edge, expression, *truth, missing)),
            EdgeKind::FunctionCall { site, parameters } => {
                self.handle_call(state, precision, edge, site, parameters).map(Some)
            }
            EdgeKind::Return(expression) => Ok(Some(self.handle_return_statement(state, precision, edge, expression.as_ref()))),
            EdgeKind::FunctionReturn { site, caller } => self.handle_function_return(state, precision, edge, site, caller).map(Some),
            EdgeKind::Multi(edges) => {
                let mut current = state.clone();
                for inner in edges {
                    missing.clear();
                    match self.transfer_edge(&current, precision, inner, missing)? {
                        Some(next) => current = next,
                        None => return Ok(None),
                    }
                }
                Ok(Some(current))
            }
        }
    }

    fn handle_declaration(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        declaration: &Declaration,
        missing: &mut MissingInformation,
    ) -> Result<ValueState> {
        let Declaration::Variable {
            name,
            ty,
            is_global,
            initializer,
        } = declaration
        else {
            return Ok(state.clone());
        };
        if let Some(init) = initializer {
            self.check_initializer_calls(init, edge)?;
        }
        if *is_global {
            self.globals.borrow_mut().insert(name.clone());
        }

        let globals = self.globals.borrow();
        let scoping = Scoping::new(&edge.function, &globals);
        let location = scoping.resolve(name);
        let mut evaluator = self.evaluator(scoping, state, edge.id);

        let mut cells = Vec::new();
        match initializer {
            Some(init) => self.flatten(ty, 0, init, &mut cells),
            // global aggregates stay unknown
            None if *is_global && !ty.is_aggregate() => self.zero_cells(ty, 0, &mut cells),
            None => {}
        }

        let mut next = state.clone();
        if ty.is_aggregate() {
            next.forget_variable(&location);
        } else if cells.is_empty() {
            next.forget(&location);
        }

        for (offset, cell_ty, init) in cells {
            let cell = location.with_offset(offset);
            let value = match init {
                CellInit::Zero => Some(0),
                CellInit::Expression(e) => evaluator.evaluate(e, &cell_ty),
            };
            match value {
                Some(value) => self.store(&mut next, cell, value, precision),
                None => {
                    next.forget(&cell);
                    if let CellInit::Expression(rhs) = init {
                        if evaluator.flags().any() && offset == 0 && !ty.is_aggregate() {
                            missing.push(MissingItem::Assignment {
                                lhs: Expression::id(name.clone(), ty.clone()),
                                rhs: rhs.clone(),
                                function: edge.function.clone(),
                                edge: edge.id,
                            });
                        }
                    }
                }
            }
        }
        Ok(next)
    }

    fn check_initializer_calls(&self, init: &Initializer, edge: &CfaEdge) -> Result<()> {
        match init {
            Initializer::Expression(e) => self.check_calls(e, edge),
            Initializer::List(items) => items.iter().try_for_each(|item| self.check_initializer_calls(item, edge)),
        }
    }

    /// Scalar cells of `ty` (at `offset`) paired with their initializers.
    fn flatten<'e>(&self, ty: &CType, offset: u64, init: &'e Initializer, out: &mut Vec<(u64, CType, CellInit<'e>)>) {
        match (ty, init) {
            (CType::Struct { fields, .. }, Initializer::List(items)) => {
                for (i, field) in fields.iter().enumerate() {
                    let Some(field_offset) = self.machine.field_offset(ty, &field.name) else {
                        continue;
                    };
                    let Some(field_offset) = offset.checked_add(field_offset) else {
                        continue;
                    };
                    self.flatten_or_zero(&field.ty, field_offset, items.get(i), out);
                }
            }
            (CType::Array { element, length }, Initializer::List(items)) => {
                let explicit = items.len() as u64;
                let count = match length {
                    Some(n) if *n <= ZERO_FILL_LIMIT => *n,
                    Some(n) => explicit.min(*n),
                    None => explicit,
                };
                let size = self.machine.size_of(element);
                for i in 0..count {
                    let Some(cell) = i.checked_mul(size).and_then(|o| o.checked_add(offset)) else {
                        break;
                    };
                    self.flatten_or_zero(element, cell, items.get(i as usize), out);
                }
            }
            (_, Initializer::List(items)) if !ty.is_aggregate() => self.flatten_or_zero(ty, offset, items.first(), out),
            (_, Initializer::Expression(e)) if !ty.is_aggregate() => {
                if ty.is_integral() || ty.is_pointer() {
                    out.push((offset, ty.clone(), CellInit::Expression(e)));
                }
            }
            // aggregate copied from another object: cells stay unknown
            _ => {}
        }
    }

    fn flatten_or_zero<'e>(
        &self,
        ty: &CType,
        offset: u64,
        init: Option<&'e Initializer>,
        out: &mut Vec<(u64, CType, CellInit<'e>)>,
    ) {
        match init {
            Some(init) => self.flatten(ty, offset, init, out),
            None => self.zero_cells(ty, offset, out),
        }
    }

    fn zero_cells<'e>(&self, ty: &CType, offset: u64, out: &mut Vec<(u64, CType, CellInit<'e>)>) {
        match ty {
            CType::Struct { fields, .. } => {
                for field in fields {
                    if let Some(field_offset) = self
                        .machine
                        .field_offset(ty, &field.name)
                        .and_then(|o| o.checked_add(offset))
                    {
                        self.zero_cells(&field.ty, field_offset, out);
                    }
                }
            }
            CType::Array {
                element,
                length: Some(n),
            } if *n <= ZERO_FILL_LIMIT => {
                let size = self.machine.size_of(element);
                for i in 0..*n {
                    let Some(cell) = i.checked_mul(size).and_then(|o| o.checked_add(offset)) else {
                        break;
                    };
                    self.zero_cells(element, cell, out);
                }
            }
            _ if ty.is_integral() || ty.is_pointer() => out.push((offset, ty.clone(), CellInit::Zero)),
            _ => {}
        }
    }

    fn handle_assignment(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        lhs: &Expression,
        rhs: &Expression,
        missing: &mut MissingInformation,
    ) -> Result<ValueState> {
        self.check_calls(rhs, edge)?;
        if !lhs.is_lvalue() {
            return Err(AnalysisError::unrecognized(
                edge.id,
                format!("cannot assign to '{}' in '{}'", lhs, edge.code()),
            ));
        }

        let globals = self.globals.borrow();
        let scoping = Scoping::new(&edge.function, &globals);
        let mut evaluator = self.evaluator(scoping, state, edge.id);

        let Some(target) = evaluator.resolve_location(lhs) else {
            let mut next = state.clone();
            // the write lands somewhere inside this variable
            if let Some(base) = evaluator.base_variable(lhs) {
                log::debug!("Cell written by '{}' is unknown, forgetting {}", edge.code(), base);
                next.forget_variable(&base);
            }
            if evaluator.flags().any() {
                log::debug!("Target of '{}' needs another analysis", edge.code());
                missing.push(MissingItem::Assignment {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                    function: edge.function.clone(),
                    edge: edge.id,
                });
            }
            return Ok(next);
        };

        let mut next = state.clone();
        let ty = lhs.ty();
        if ty.is_aggregate() {
            next.forget_variable(&target);
            return Ok(next);
        }
        match evaluator.evaluate(rhs, &ty) {
            Some(value) => self.store(&mut next, target, value, precision),
            None => {
                next.forget(&target);
                if evaluator.flags().any() {
                    missing.push(MissingItem::Assignment {
                        lhs: lhs.clone(),
                        rhs: rhs.clone(),
                        function: edge.function.clone(),
                        edge: edge.id,
                    });
                }
            }
        }
        Ok(next)
    }

    fn handle_assume(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        expression: &Expression,
        truth: bool,
        missing: &mut MissingInformation,
    ) -> Option<ValueState> {
        let globals = self.globals.borrow();
        let scoping = Scoping::new(&edge.function, &globals);
        let mut evaluator = self.evaluator(scoping, state, edge.id);

        if let Some(value) = evaluator.evaluate_raw(expression) {
            return if (value != 0) == truth {
                Some(state.clone())
            } else {
                log::debug!("Assumption '{}' is infeasible in {}", edge.code(), state);
                None
            };
        }

        let mut next = state.clone();
        self.learn(&mut next, &mut evaluator, precision, expression, truth);
        if evaluator.flags().any() {
            missing.push(MissingItem::Assumption {
                expression: expression.clone(),
                truth,
                function: edge.function.clone(),
                edge: edge.id,
            });
        }
        Some(next)
    }

    /// Learns values of unknown operands that the branch condition pins down.
    fn learn(
        &self,
        next: &mut ValueState,
        evaluator: &mut ValueEvaluator<'_>,
        precision: &ValuePrecision,
        expression: &Expression,
        truth: bool,
    ) {
        match expression {
            Expression::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => self.learn(next, evaluator, precision, operand, !truth),
            Expression::Binary {
                op: op @ (BinaryOp::Eq | BinaryOp::Ne),
                lhs,
                rhs,
                ..
            } => {
                let asserts_equal = (*op == BinaryOp::Eq) == truth;
                match (evaluator.evaluate_raw(lhs), evaluator.evaluate_raw(rhs)) {
                    (None, Some(known)) => self.learn_operand(next, evaluator, precision, lhs, known, asserts_equal),
                    (Some(known), None) => self.learn_operand(next, evaluator, precision, rhs, known, asserts_equal),
                    _ => {}
                }
            }
            // `[e]` means `e != 0`
            e if e.is_lvalue() => self.learn_operand(next, evaluator, precision, e, 0, !truth),
            _ => {}
        }
    }

    fn learn_operand(
        &self,
        next: &mut ValueState,
        evaluator: &mut ValueEvaluator<'_>,
        precision: &ValuePrecision,
        operand: &Expression,
        known: i64,
        asserts_equal: bool,
    ) {
        let ty = operand.ty();
        if !(ty.is_integral() || ty.is_pointer()) {
            return;
        }
        let is_bool = matches!(ty, CType::Int { kind: IntKind::Bool, .. });
        let learned = if asserts_equal {
            known
        } else if is_bool && (known == 0 || known == 1) {
            1 - known
        } else if self.init_assumption_vars && known == 0 {
            1
        } else {
            return;
        };
        if cast_value(learned, &ty, &self.machine) != learned {
            return;
        }
        let Some(location) = evaluator.resolve_location(operand) else {
            return;
        };
        log::debug!("Learned {} = {} from assumption", location, learned);
        self.store(next, location, learned, precision);
    }

    fn handle_call(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        site: &CallSite,
        parameters: &[Parameter],
    ) -> Result<ValueState> {
        self.check_supported(&site.function, edge)?;
        for arg in &site.args {
            self.check_calls(arg, edge)?;
        }

        let frame = self.frames.push(state);
        let mut next = ValueState::in_frame(frame);
        for global in state.global_locations() {
            next.copy_cell_from(state, &global);
        }

        let globals = self.globals.borrow();
        let mut evaluator = self.evaluator(Scoping::new(&edge.function, &globals), state, edge.id);
        for (parameter, arg) in parameters.iter().zip(&site.args) {
            let location = MemoryLocation::local(&site.function, &parameter.name);
            match evaluator.evaluate(arg, &parameter.ty) {
                Some(value) => self.store(&mut next, location, value, precision),
                None => log::debug!("Parameter {} of '{}' is unknown", location, edge.code()),
            }
        }
        if parameters.len() != site.args.len() {
            log::warn!(
                "Call '{}' passes {} arguments to {} parameters",
                edge.code(),
                site.args.len(),
                parameters.len()
            );
        }
        Ok(next)
    }

    fn handle_return_statement(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        expression: Option<&Expression>,
    ) -> ValueState {
        let location = MemoryLocation::local(&edge.function, RETURN_VARIABLE);
        let mut next = state.clone();
        let value = expression.and_then(|e| {
            let globals = self.globals.borrow();
            let mut evaluator = self.evaluator(Scoping::new(&edge.function, &globals), state, edge.id);
            evaluator.evaluate(e, &e.ty())
        });
        match value {
            Some(value) => {
                // a fresh value per activation, not a write to count
                next.forget(&location);
                if !precision.is_blacklisted(&location) {
                    next.assign(location, value);
                }
            }
            None => {
                next.forget(&location);
            }
        }
        next
    }

    fn handle_function_return(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        site: &CallSite,
        caller: &str,
    ) -> Result<ValueState> {
        let callee = edge.function.as_str();
        let mut next = state
            .previous()
            .and_then(|frame| self.frames.get(frame))
            .ok_or_else(|| AnalysisError::unrecognized(edge.id, format!("return from {} without a call frame", callee)))?;

        let mut globals_seen = next.global_locations();
        globals_seen.extend(state.global_locations());
        for global in &globals_seen {
            next.copy_cell_from(state, global);
        }

        if let Some(lhs) = &site.lhs {
            let globals = self.globals.borrow();
            let mut evaluator = self.evaluator(Scoping::new(caller, &globals), &next, edge.id);
            let target = evaluator.resolve_location(lhs);
            let returned = MemoryLocation::local(callee, RETURN_VARIABLE);
            let ty = lhs.ty();
            let value = state.value_of(&returned).map(|v| cast_value(v, &ty, &self.machine));
            drop(evaluator);
            match (target, value) {
                (Some(target), Some(value)) => self.store(&mut next, target, value, precision),
                (Some(target), None) => {
                    next.forget(&target);
                }
                (None, _) => log::debug!("Cannot bind the result of '{}'", edge.code()),
            }
        }

        next.drop_function(callee);
        Ok(next)
    }

    /// Resolves `missing` with the help of sibling states computed for the same
    /// edge. Returns `None` if a sibling proves the edge infeasible. Items no
    /// sibling can answer are dropped.
    pub fn strengthen(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        siblings: &[&dyn SiblingState],
        missing: &MissingInformation,
    ) -> Option<ValueState> {
        let mut next = state.clone();
        let globals = self.globals.borrow();
        for item in missing.items() {
            match item {
                MissingItem::Assignment {
                    lhs,
                    rhs,
                    function,
                    edge,
                } => {
                    let mut evaluator = self
                        .evaluator(Scoping::new(function, &globals), state, *edge)
                        .with_siblings(siblings);
                    let Some(target) = evaluator.resolve_location(lhs) else {
                        log::debug!("No sibling resolves '{}', dropping it", lhs);
                        continue;
                    };
                    match evaluator.evaluate(rhs, &lhs.ty()) {
                        Some(value) => self.store(&mut next, target, value, precision),
                        None => {
                            next.forget(&target);
                        }
                    }
                }
                MissingItem::Assumption {
                    expression,
                    truth,
                    function,
                    edge,
                } => {
                    let mut evaluator = self
                        .evaluator(Scoping::new(function, &globals), state, *edge)
                        .with_siblings(siblings);
                    match evaluator.evaluate_raw(expression) {
                        Some(value) if (value != 0) != *truth => {
                            log::debug!("Siblings refute '{}' on {}", expression, edge);
                            return None;
                        }
                        Some(_) => {}
                        None => self.learn(&mut next, &mut evaluator, precision, expression, *truth),
                    }
                }
            }
        }
        Some(next)
    }
}

impl TransferRelation for ValueTransferRelation {
    type State = ValueState;
    type Precision = ValuePrecision;

    fn transfer(&self, state: &ValueState, precision: &ValuePrecision, edge: &CfaEdge) -> Result<Transfer> {
        let mut missing = MissingInformation::new();
        let successor = self.transfer_edge(state, precision, edge, &mut missing)?;
        match &successor {
            Some(next) => log::debug!("{}: {} => {}", edge, state, next),
            None => log::debug!("{}: {} => infeasible", edge, state),
        }
        Ok(Transfer { successor, missing })
    }
}
