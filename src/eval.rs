//! Evaluation of expressions to concrete integer values.
//!
//! The evaluator fails closed: anything it cannot model precisely (floats,
//! strings, calls, pointer dereference without alias information) yields
//! `None`, the "unknown" value. Absence of a value is never an error.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::cfa::EdgeId;
use crate::expr::{BinaryOp, Expression, TypeIdOp, UnaryOp};
use crate::location::{MemoryLocation, Scoping};
use crate::machine::{cast_value, CType, IntKind, MachineModel};
use crate::sibling::{ask, SiblingState};

/// Source of known values, keyed by memory location.
pub trait ValueLookup {
    fn lookup(&self, location: &MemoryLocation) -> Option<i64>;
}

impl ValueLookup for BTreeMap<MemoryLocation, i64> {
    fn lookup(&self, location: &MemoryLocation) -> Option<i64> {
        self.get(location).copied()
    }
}

/// Reasons an evaluation came back unknown that a sibling analysis might fix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvalFlags {
    pub missing_pointer: bool,
    pub missing_field_access: bool,
    pub missing_enum_comparison: bool,
}

impl EvalFlags {
    pub fn any(&self) -> bool {
        self.missing_pointer || self.missing_field_access || self.missing_enum_comparison
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DiagnosticKind {
    DivisionByZero,
    ModuloByZero,
    Overflow,
}

/// Per-run record of diagnostics already logged, so each edge reports a
/// given problem at most once.
#[derive(Debug, Default)]
pub struct Diagnostics {
    reported: RefCell<HashSet<(EdgeId, DiagnosticKind)>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `kind` for `edge` unless it was logged before. Returns whether a
    /// line was emitted. `subject` is only built when a line is emitted.
    pub fn report<D: fmt::Display>(&self, edge: EdgeId, kind: DiagnosticKind, subject: impl FnOnce() -> D) -> bool {
        if !self.reported.borrow_mut().insert((edge, kind)) {
            return false;
        }
        let subject = subject();
        match kind {
            DiagnosticKind::DivisionByZero => {
                log::error!("Division by zero on edge {} in '{}', result is 0", edge, subject)
            }
            DiagnosticKind::ModuloByZero => {
                log::error!("Modulo by zero on edge {} in '{}', result is 0", edge, subject)
            }
            DiagnosticKind::Overflow => {
                log::info!("Value of '{}' on edge {} overflows its type and is truncated", subject, edge)
            }
        }
        true
    }

    pub fn was_reported(&self, edge: EdgeId, kind: DiagnosticKind) -> bool {
        self.reported.borrow().contains(&(edge, kind))
    }

    pub fn len(&self) -> usize {
        self.reported.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.borrow().is_empty()
    }
}

/// Evaluates expressions of one edge against one state.
pub struct ValueEvaluator<'a> {
    machine: &'a MachineModel,
    scoping: Scoping<'a>,
    lookup: &'a dyn ValueLookup,
    diagnostics: &'a Diagnostics,
    edge: EdgeId,
    siblings: &'a [&'a dyn SiblingState],
    flags: EvalFlags,
}

impl<'a> ValueEvaluator<'a> {
    pub fn new(
        machine: &'a MachineModel,
        scoping: Scoping<'a>,
        lookup: &'a dyn ValueLookup,
        diagnostics: &'a Diagnostics,
        edge: EdgeId,
    ) -> Self {
        ValueEvaluator {
            machine,
            scoping,
            lookup,
            diagnostics,
            edge,
            siblings: &[],
            flags: EvalFlags::default(),
        }
    }

    /// Lets location resolution consult sibling analyses.
    pub fn with_siblings(mut self, siblings: &'a [&'a dyn SiblingState]) -> Self {
        self.siblings = siblings;
        self
    }

    /// Flags raised by every evaluation so far.
    pub fn flags(&self) -> EvalFlags {
        self.flags
    }

    /// Value of `expr` converted to `target`.
    pub fn evaluate(&mut self, expr: &Expression, target: &CType) -> Option<i64> {
        if target.is_floating() || target.is_aggregate() {
            return None;
        }
        let value = self.evaluate_raw(expr)?;
        Some(self.cast(value, target, || expr))
    }

    /// Value of `expr` in its own type.
    pub fn evaluate_raw(&mut self, expr: &Expression) -> Option<i64> {
        match expr {
            Expression::IntegerLiteral { value, .. } => Some(*value),
            Expression::CharLiteral(c) => Some(cast_value(*c as i64, &CType::char(), self.machine)),
            Expression::BoolLiteral(b) => Some(*b as i64),
            Expression::FloatLiteral(_) | Expression::StringLiteral(_) | Expression::ImaginaryLiteral(_) => None,
            Expression::Enumerator { value, .. } => Some(*value),
            Expression::Id { name, ty } => {
                if ty.is_floating() || ty.is_aggregate() || matches!(ty, CType::Function) {
                    return None;
                }
                let location = self.scoping.resolve(name);
                self.read(&location, ty)
            }
            Expression::Unary { op, operand, ty } => self.evaluate_unary(*op, operand, ty),
            Expression::TypeId { op, operand_ty } => Some(match op {
                TypeIdOp::SizeOf => self.machine.size_of(operand_ty) as i64,
                TypeIdOp::AlignOf => self.machine.align_of(operand_ty) as i64,
            }),
            Expression::Binary {
                op,
                lhs,
                rhs,
                ty,
                calculation_ty,
            } => self.evaluate_binary(*op, lhs, rhs, ty, calculation_ty),
            Expression::Cast { operand, ty } => {
                if ty.is_floating() || operand.ty().is_floating() {
                    return None;
                }
                let value = self.evaluate_raw(operand)?;
                Some(self.cast(value, ty, || expr))
            }
            Expression::Field { ty, .. } | Expression::Subscript { ty, .. } | Expression::Deref { ty, .. } => {
                if ty.is_floating() || ty.is_aggregate() {
                    return None;
                }
                let location = self.resolve_location(expr)?;
                self.read(&location, ty)
            }
            Expression::Call { .. } => None,
        }
    }

    fn read(&self, location: &MemoryLocation, ty: &CType) -> Option<i64> {
        self.lookup.lookup(location).or_else(|| {
            if ty.is_enum() {
                ask(self.siblings, |s| s.enum_value(location))
            } else {
                None
            }
        })
    }

    fn cast<D: fmt::Display>(&self, value: i64, target: &CType, subject: impl FnOnce() -> D) -> i64 {
        let cast = cast_value(value, target, self.machine);
        let normalizes_bool = matches!(target, CType::Int { kind: IntKind::Bool, .. });
        if cast != value && !normalizes_bool {
            self.diagnostics.report(self.edge, DiagnosticKind::Overflow, subject);
        }
        cast
    }

    fn evaluate_unary(&mut self, op: UnaryOp, operand: &Expression, ty: &CType) -> Option<i64> {
        match op {
            UnaryOp::SizeOf => Some(self.machine.size_of(&operand.ty()) as i64),
            UnaryOp::AlignOf => Some(self.machine.align_of(&operand.ty()) as i64),
            UnaryOp::AddressOf => None,
            UnaryOp::Not => {
                let value = self.evaluate_raw(operand)?;
                Some((value == 0) as i64)
            }
            UnaryOp::Minus | UnaryOp::Complement => {
                if !ty.is_integral() {
                    return None;
                }
                let value = self.evaluate_raw(operand)?;
                let value = self.cast(value, ty, || operand);
                let result = if op == UnaryOp::Minus {
                    value.wrapping_neg()
                } else {
                    !value
                };
                Some(self.cast(result, ty, || operand))
            }
        }
    }

    fn evaluate_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
        ty: &CType,
        calculation_ty: &CType,
    ) -> Option<i64> {
        let l = self.evaluate_raw(lhs);
        let r = self.evaluate_raw(rhs);
        let (Some(l), Some(r)) = (l, r) else {
            if op.is_comparison() && (lhs.ty().is_enum() || rhs.ty().is_enum()) {
                self.flags.missing_enum_comparison = true;
            }
            return None;
        };
        if !(calculation_ty.is_integral() || calculation_ty.is_pointer()) {
            return None;
        }

        let l = self.cast(l, calculation_ty, || lhs);
        // shift distances are used as written
        let r = if op.is_shift() {
            r
        } else {
            self.cast(r, calculation_ty, || rhs)
        };
        let unsigned = self.machine.is_unsigned_64(calculation_ty);

        let result = match op {
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::Div | BinaryOp::Mod if r == 0 => {
                let kind = if op == BinaryOp::Div {
                    DiagnosticKind::DivisionByZero
                } else {
                    DiagnosticKind::ModuloByZero
                };
                self.diagnostics
                    .report(self.edge, kind, || Expression::binary(op, lhs.clone(), rhs.clone()));
                0
            }
            BinaryOp::Div if unsigned => ((l as u64) / (r as u64)) as i64,
            BinaryOp::Div => l.wrapping_div(r),
            BinaryOp::Mod if unsigned => ((l as u64) % (r as u64)) as i64,
            BinaryOp::Mod => l.wrapping_rem(r),
            BinaryOp::Shl => {
                if (0..64).contains(&r) {
                    l.wrapping_shl(r as u32)
                } else {
                    0
                }
            }
            BinaryOp::Shr if unsigned => (l as u64).wrapping_shr(r as u32) as i64,
            BinaryOp::Shr => l.wrapping_shr(r as u32),
            BinaryOp::BitAnd => l & r,
            BinaryOp::BitOr => l | r,
            BinaryOp::BitXor => l ^ r,
            BinaryOp::Eq => (l == r) as i64,
            BinaryOp::Ne => (l != r) as i64,
            BinaryOp::Lt if unsigned => ((l as u64) < (r as u64)) as i64,
            BinaryOp::Lt => (l < r) as i64,
            BinaryOp::Le if unsigned => ((l as u64) <= (r as u64)) as i64,
            BinaryOp::Le => (l <= r) as i64,
            BinaryOp::Gt if unsigned => ((l as u64) > (r as u64)) as i64,
            BinaryOp::Gt => (l > r) as i64,
            BinaryOp::Ge if unsigned => ((l as u64) >= (r as u64)) as i64,
            BinaryOp::Ge => (l >= r) as i64,
        };

        if op.is_comparison() {
            return Some(result);
        }
        Some(self.cast(result, ty, || Expression::binary(op, lhs.clone(), rhs.clone())))
    }

    /// Storage cell denoted by an lvalue, if it can be named statically or a
    /// sibling analysis knows it.
    pub fn resolve_location(&mut self, expr: &Expression) -> Option<MemoryLocation> {
        match expr {
            Expression::Id { name, .. } => Some(self.scoping.resolve(name)),
            Expression::Field {
                owner,
                field,
                through_pointer: false,
                ..
            } => {
                let base = self.resolve_location(owner)?;
                let offset = self.machine.field_offset(&owner.ty(), field)?;
                base.checked_offset(offset)
            }
            Expression::Field {
                through_pointer: true, ..
            } => {
                let function = self.scoping.function();
                let found = ask(self.siblings, |s| s.field_location(expr, function));
                if found.is_none() {
                    self.flags.missing_field_access = true;
                }
                found
            }
            Expression::Subscript { array, index, ty } => {
                let base = match array.ty() {
                    CType::Array { .. } => self.resolve_location(array)?,
                    CType::Pointer(_) => self.pointee(array)?,
                    _ => return None,
                };
                let index = self.evaluate_raw(index)?;
                let index = u64::try_from(index).ok()?;
                base.checked_offset(index.checked_mul(self.machine.size_of(ty))?)
            }
            Expression::Deref { pointer, .. } => self.pointee(pointer),
            _ => None,
        }
    }

    /// Variable that holds every cell an lvalue may denote, as long as the
    /// lvalue does not go through a pointer: `a` for `a[j]` and `s` for
    /// `s.arr[j]`.
    pub fn base_variable(&self, expr: &Expression) -> Option<MemoryLocation> {
        match expr {
            Expression::Id { name, .. } => Some(self.scoping.resolve(name)),
            Expression::Field {
                owner,
                through_pointer: false,
                ..
            } => self.base_variable(owner),
            Expression::Subscript { array, .. } if matches!(array.ty(), CType::Array { .. }) => {
                self.base_variable(array)
            }
            _ => None,
        }
    }

    fn pointee(&mut self, pointer: &Expression) -> Option<MemoryLocation> {
        let function = self.scoping.function();
        let found = ask(self.siblings, |s| s.points_to(pointer, function));
        if found.is_none() {
            self.flags.missing_pointer = true;
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_log::test;

    use super::*;
    use crate::machine::Field;

    struct Fixture {
        machine: MachineModel,
        globals: BTreeSet<String>,
        values: BTreeMap<MemoryLocation, i64>,
        diagnostics: Diagnostics,
    }

    impl Fixture {
        fn new(machine: MachineModel) -> Self {
            Fixture {
                machine,
                globals: BTreeSet::new(),
                values: BTreeMap::new(),
                diagnostics: Diagnostics::new(),
            }
        }

        fn set(&mut self, name: &str, value: i64) {
            self.values.insert(MemoryLocation::local("main", name), value);
        }

        fn evaluator(&self) -> ValueEvaluator<'_> {
            ValueEvaluator::new(
                &self.machine,
                Scoping::new("main", &self.globals),
                &self.values,
                &self.diagnostics,
                EdgeId(1),
            )
        }

        fn eval(&self, e: &Expression) -> Option<i64> {
            self.evaluator().evaluate(e, &e.ty())
        }
    }

    #[test]
    fn test_literals() {
        let f = Fixture::new(MachineModel::LINUX32);
        assert_eq!(f.eval(&Expression::int(42)), Some(42));
        assert_eq!(f.eval(&Expression::CharLiteral('a')), Some(97));
        assert_eq!(f.eval(&Expression::BoolLiteral(true)), Some(1));
        assert_eq!(f.eval(&Expression::FloatLiteral(1.5)), None);
        assert_eq!(f.eval(&Expression::StringLiteral("s".into())), None);
        assert_eq!(f.eval(&Expression::ImaginaryLiteral(2.0)), None);
    }

    #[test]
    fn test_arithmetic() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", 7);
        f.set("y", -2);
        let x = || Expression::var("x");
        let y = || Expression::var("y");
        assert_eq!(f.eval(&x().add(y())), Some(5));
        assert_eq!(f.eval(&x().mul(y())), Some(-14));
        assert_eq!(f.eval(&x().div(y())), Some(-3));
        assert_eq!(f.eval(&Expression::binary(BinaryOp::Mod, x(), y())), Some(1));
        assert_eq!(f.eval(&x().lt(y())), Some(0));
        assert_eq!(f.eval(&x().ne(y())), Some(1));
        assert_eq!(f.eval(&Expression::unary(UnaryOp::Minus, x())), Some(-7));
        assert_eq!(f.eval(&Expression::unary(UnaryOp::Complement, Expression::int(0))), Some(-1));
        assert_eq!(f.eval(&Expression::unary(UnaryOp::Not, x())), Some(0));
    }

    #[test]
    fn test_unknown_operand() {
        let f = Fixture::new(MachineModel::LINUX32);
        assert_eq!(f.eval(&Expression::var("x").add(Expression::int(1))), None);
        assert_eq!(f.eval(&Expression::call("f", vec![], CType::int())), None);
        assert_eq!(f.eval(&Expression::unary(UnaryOp::AddressOf, Expression::var("x"))), None);
    }

    #[test]
    fn test_int_overflow_wraps() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", i32::MAX as i64);
        let e = Expression::var("x").add(Expression::int(1));
        assert_eq!(f.eval(&e), Some(i32::MIN as i64));
        assert!(f.diagnostics.was_reported(EdgeId(1), DiagnosticKind::Overflow));
    }

    #[test]
    fn test_unsigned_wraps() {
        let f = Fixture::new(MachineModel::LINUX32);
        let e = Expression::literal(0, CType::uint()).sub(Expression::literal(1, CType::uint()));
        assert_eq!(f.eval(&e), Some(u32::MAX as i64));
    }

    #[test]
    fn test_division_by_zero_logged_once() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", 10);
        let e = Expression::var("x").div(Expression::int(0));
        for _ in 0..5 {
            assert_eq!(f.eval(&e), Some(0));
        }
        let m = Expression::binary(BinaryOp::Mod, Expression::var("x"), Expression::int(0));
        assert_eq!(f.eval(&m), Some(0));
        assert!(f.diagnostics.was_reported(EdgeId(1), DiagnosticKind::DivisionByZero));
        assert!(f.diagnostics.was_reported(EdgeId(1), DiagnosticKind::ModuloByZero));
        assert_eq!(f.diagnostics.len(), 2);
    }

    #[test]
    fn test_repeated_report_skips_subject() {
        let diagnostics = Diagnostics::new();
        let built = std::cell::Cell::new(0);
        let subject = || {
            built.set(built.get() + 1);
            "x / 0"
        };
        assert!(diagnostics.report(EdgeId(3), DiagnosticKind::DivisionByZero, subject));
        assert!(!diagnostics.report(EdgeId(3), DiagnosticKind::DivisionByZero, subject));
        assert_eq!(built.get(), 1);
    }

    #[test]
    fn test_shift_quirks() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", 1);
        let shl = |n: i64| Expression::binary(BinaryOp::Shl, Expression::literal(1, CType::long_long()), Expression::int(n));
        assert_eq!(f.eval(&shl(3)), Some(8));
        assert_eq!(f.eval(&shl(64)), Some(0));
        assert_eq!(f.eval(&shl(-1)), Some(0));
        assert_eq!(f.eval(&shl(63)), Some(i64::MIN));

        // distance is not truncated to the lhs type
        let big = Expression::binary(
            BinaryOp::Shr,
            Expression::literal(-16, CType::long_long()),
            Expression::literal(2, CType::ulong_long()),
        );
        assert_eq!(f.eval(&big), Some(-4));
    }

    #[test]
    fn test_unsigned_64_primitives() {
        let f = Fixture::new(MachineModel::LINUX64);
        let max = || Expression::literal(-1, CType::ulong());
        let e = Expression::binary(BinaryOp::Gt, max(), Expression::literal(1, CType::ulong()));
        assert_eq!(f.eval(&e), Some(1));
        let e = max().div(Expression::literal(2, CType::ulong()));
        assert_eq!(f.eval(&e), Some(i64::MAX));
        let e = Expression::binary(BinaryOp::Shr, max(), Expression::int(60));
        assert_eq!(f.eval(&e), Some(15));

        // signed long keeps signed semantics
        let e = Expression::binary(BinaryOp::Shr, Expression::literal(-1, CType::long()), Expression::int(60));
        assert_eq!(f.eval(&e), Some(-1));
    }

    #[test]
    fn test_casts() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", 300);
        assert_eq!(f.eval(&Expression::cast(Expression::var("x"), CType::uchar())), Some(44));
        assert_eq!(f.eval(&Expression::cast(Expression::var("x"), CType::schar())), Some(44));
        assert_eq!(f.eval(&Expression::cast(Expression::int(200), CType::schar())), Some(-56));
        assert_eq!(f.eval(&Expression::cast(Expression::var("x"), CType::bool())), Some(1));
        assert_eq!(f.eval(&Expression::cast(Expression::var("x"), CType::double())), None);
        // assignment target conversion
        let mut e = f.evaluator();
        assert_eq!(e.evaluate(&Expression::int(-1), &CType::ushort()), Some(65535));
    }

    #[test]
    fn test_sizeof_and_enumerators() {
        let f = Fixture::new(MachineModel::LINUX64);
        assert_eq!(f.eval(&Expression::size_of(CType::long())), Some(8));
        assert_eq!(f.eval(&Expression::unary(UnaryOp::SizeOf, Expression::var("unknown"))), Some(4));
        let e = Expression::enumerator("GREEN", 2, CType::enumeration("color"));
        assert_eq!(f.eval(&e), Some(2));
    }

    #[test]
    fn test_struct_field_location() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        let s_ty = CType::structure("pair", vec![Field::new("a", CType::char()), Field::new("b", CType::int())]);
        let s = Expression::id("s", s_ty);
        f.values.insert(MemoryLocation::local("main", "s").with_offset(4), 9);

        let b = Expression::field(s.clone(), "b");
        assert_eq!(
            f.evaluator().resolve_location(&b),
            Some(MemoryLocation::local("main", "s").with_offset(4))
        );
        assert_eq!(f.eval(&b), Some(9));
        assert_eq!(f.eval(&s), None);
    }

    #[test]
    fn test_array_subscript() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("i", 2);
        let a = Expression::id("a", CType::array_of(CType::short(), 4));
        f.values.insert(MemoryLocation::local("main", "a").with_offset(4), 11);
        let e = Expression::subscript(a.clone(), Expression::var("i"));
        assert_eq!(f.eval(&e), Some(11));

        let unknown = Expression::subscript(a, Expression::var("j"));
        let mut ev = f.evaluator();
        assert_eq!(ev.resolve_location(&unknown), None);
        assert!(!ev.flags().any());
        assert_eq!(ev.base_variable(&unknown), Some(MemoryLocation::local("main", "a")));

        let p = Expression::id("p", CType::pointer_to(CType::int()));
        assert_eq!(ev.base_variable(&Expression::subscript(p, Expression::var("j"))), None);
    }

    #[test]
    fn test_missing_information_flags() {
        let f = Fixture::new(MachineModel::LINUX32);
        let p = Expression::id("p", CType::pointer_to(CType::int()));
        let mut ev = f.evaluator();
        assert_eq!(ev.evaluate_raw(&Expression::deref(p.clone())), None);
        assert!(ev.flags().missing_pointer);

        let mut ev = f.evaluator();
        assert_eq!(ev.evaluate_raw(&Expression::arrow(p, "f", CType::int())), None);
        assert!(ev.flags().missing_field_access);
        assert!(!ev.flags().missing_pointer);

        let mut ev = f.evaluator();
        let color = CType::enumeration("color");
        let cmp = Expression::id("c", color.clone()).eq(Expression::enumerator("RED", 0, color));
        assert_eq!(ev.evaluate_raw(&cmp), None);
        assert!(ev.flags().missing_enum_comparison);
    }

    #[test]
    fn test_siblings_resolve_pointers() {
        struct PointsToX;
        impl SiblingState for PointsToX {
            fn points_to(&self, _pointer: &Expression, function: &str) -> Option<MemoryLocation> {
                Some(MemoryLocation::local(function, "x"))
            }
        }

        let mut f = Fixture::new(MachineModel::LINUX32);
        f.set("x", 3);
        let p = Expression::id("p", CType::pointer_to(CType::int()));
        let siblings: [&dyn SiblingState; 1] = [&PointsToX];
        let mut ev = f.evaluator().with_siblings(&siblings);
        assert_eq!(ev.evaluate_raw(&Expression::deref(p)), Some(3));
        assert!(!ev.flags().any());
    }

    #[test]
    fn test_globals_resolve_globally() {
        let mut f = Fixture::new(MachineModel::LINUX32);
        f.globals.insert("g".to_string());
        f.values.insert(MemoryLocation::global("g"), 4);
        assert_eq!(f.eval(&Expression::var("g")), Some(4));
    }
}
