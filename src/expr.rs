//! Expressions carried by CFA edges.
//!
//! Every node knows its own C type; binary expressions additionally carry the
//! calculation type their operands are converted to before the operation.

use std::fmt;

use crate::machine::CType;

/// Binary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

/// Unary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UnaryOp {
    Minus,
    Complement,
    Not,
    AddressOf,
    SizeOf,
    AlignOf,
}

/// Type-id operators applied to a type name.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeIdOp {
    SizeOf,
    AlignOf,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    IntegerLiteral {
        value: i64,
        ty: CType,
    },
    CharLiteral(char),
    BoolLiteral(bool),
    FloatLiteral(f64),
    StringLiteral(String),
    /// Imaginary part of a complex literal, e.g. `2.0i`.
    ImaginaryLiteral(f64),
    /// Variable reference, scoped by the transfer relation.
    Id {
        name: String,
        ty: CType,
    },
    /// Enumerator constant with its declared value.
    Enumerator {
        name: String,
        value: i64,
        ty: CType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
        ty: CType,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
        ty: CType,
        calculation_ty: CType,
    },
    Cast {
        operand: Box<Expression>,
        ty: CType,
    },
    TypeId {
        op: TypeIdOp,
        operand_ty: CType,
    },
    /// `owner.field`, or `owner->field` when `through_pointer` is set.
    Field {
        owner: Box<Expression>,
        field: String,
        through_pointer: bool,
        ty: CType,
    },
    Subscript {
        array: Box<Expression>,
        index: Box<Expression>,
        ty: CType,
    },
    Deref {
        pointer: Box<Expression>,
        ty: CType,
    },
    Call {
        function: String,
        args: Vec<Expression>,
        ty: CType,
    },
}

impl Expression {
    /// `int` literal
    pub fn int(value: i64) -> Self {
        Expression::IntegerLiteral { value, ty: CType::int() }
    }

    pub fn literal(value: i64, ty: CType) -> Self {
        Expression::IntegerLiteral { value, ty }
    }

    pub fn id(name: impl Into<String>, ty: CType) -> Self {
        Expression::Id { name: name.into(), ty }
    }

    /// `int` variable reference
    pub fn var(name: impl Into<String>) -> Self {
        Expression::id(name, CType::int())
    }

    pub fn enumerator(name: impl Into<String>, value: i64, ty: CType) -> Self {
        Expression::Enumerator {
            name: name.into(),
            value,
            ty,
        }
    }

    /// Binary expression typed by the usual arithmetic conversions.
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        let calculation_ty = if op.is_shift() {
            CType::common(&lhs.ty(), &lhs.ty())
        } else {
            CType::common(&lhs.ty(), &rhs.ty())
        };
        let ty = if op.is_comparison() {
            CType::int()
        } else {
            calculation_ty.clone()
        };
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            ty,
            calculation_ty,
        }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        let ty = match op {
            UnaryOp::Not | UnaryOp::SizeOf | UnaryOp::AlignOf => CType::int(),
            UnaryOp::AddressOf => CType::pointer_to(operand.ty()),
            UnaryOp::Minus | UnaryOp::Complement => CType::common(&operand.ty(), &operand.ty()),
        };
        Expression::Unary {
            op,
            operand: Box::new(operand),
            ty,
        }
    }

    pub fn cast(operand: Expression, ty: CType) -> Self {
        Expression::Cast {
            operand: Box::new(operand),
            ty,
        }
    }

    pub fn size_of(ty: CType) -> Self {
        Expression::TypeId {
            op: TypeIdOp::SizeOf,
            operand_ty: ty,
        }
    }

    /// `owner.field`; the field type is looked up in the owner's struct type.
    pub fn field(owner: Expression, field: impl Into<String>) -> Self {
        let field = field.into();
        let ty = match owner.ty() {
            CType::Struct { fields, .. } => fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.ty.clone())
                .unwrap_or(CType::Void),
            _ => CType::Void,
        };
        Expression::Field {
            owner: Box::new(owner),
            field,
            through_pointer: false,
            ty,
        }
    }

    /// `owner->field`
    pub fn arrow(owner: Expression, field: impl Into<String>, ty: CType) -> Self {
        Expression::Field {
            owner: Box::new(owner),
            field: field.into(),
            through_pointer: true,
            ty,
        }
    }

    pub fn subscript(array: Expression, index: Expression) -> Self {
        let ty = match array.ty() {
            CType::Array { element, .. } | CType::Pointer(element) => *element,
            _ => CType::Void,
        };
        Expression::Subscript {
            array: Box::new(array),
            index: Box::new(index),
            ty,
        }
    }

    pub fn deref(pointer: Expression) -> Self {
        let ty = match pointer.ty() {
            CType::Pointer(target) => *target,
            _ => CType::Void,
        };
        Expression::Deref {
            pointer: Box::new(pointer),
            ty,
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Expression>, ty: CType) -> Self {
        Expression::Call {
            function: function.into(),
            args,
            ty,
        }
    }

    pub fn add(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Add, self, other)
    }

    pub fn sub(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Sub, self, other)
    }

    pub fn mul(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Mul, self, other)
    }

    pub fn div(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Div, self, other)
    }

    pub fn eq(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Eq, self, other)
    }

    pub fn ne(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Ne, self, other)
    }

    pub fn lt(self, other: Expression) -> Self {
        Expression::binary(BinaryOp::Lt, self, other)
    }

    /// Type of the value this expression produces.
    pub fn ty(&self) -> CType {
        match self {
            Expression::IntegerLiteral { ty, .. }
            | Expression::Id { ty, .. }
            | Expression::Enumerator { ty, .. }
            | Expression::Unary { ty, .. }
            | Expression::Binary { ty, .. }
            | Expression::Cast { ty, .. }
            | Expression::Field { ty, .. }
            | Expression::Subscript { ty, .. }
            | Expression::Deref { ty, .. }
            | Expression::Call { ty, .. } => ty.clone(),
            Expression::CharLiteral(_) => CType::char(),
            Expression::BoolLiteral(_) => CType::bool(),
            Expression::FloatLiteral(_) | Expression::ImaginaryLiteral(_) => CType::double(),
            Expression::StringLiteral(_) => CType::pointer_to(CType::char()),
            Expression::TypeId { .. } => CType::uint(),
        }
    }

    /// Whether the expression can denote a storage cell.
    pub fn is_lvalue(&self) -> bool {
        matches!(
            self,
            Expression::Id { .. } | Expression::Field { .. } | Expression::Subscript { .. } | Expression::Deref { .. }
        )
    }

    /// Visits every sub-expression, pre-order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expression)) {
        visit(self);
        match self {
            Expression::Unary { operand, .. } | Expression::Cast { operand, .. } => operand.walk(visit),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expression::Field { owner, .. } => owner.walk(visit),
            Expression::Subscript { array, index, .. } => {
                array.walk(visit);
                index.walk(visit);
            }
            Expression::Deref { pointer, .. } => pointer.walk(visit),
            Expression::Call { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            _ => {}
        }
    }

    /// Names of all variables referenced (enumerators excluded).
    pub fn identifiers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk(&mut |e| {
            if let Expression::Id { name, .. } = e {
                names.push(name.as_str());
            }
        });
        names
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::IntegerLiteral { value, .. } => write!(f, "{}", value),
            Expression::CharLiteral(c) => write!(f, "'{}'", c.escape_default()),
            Expression::BoolLiteral(b) => write!(f, "{}", b),
            Expression::FloatLiteral(v) => write!(f, "{:?}", v),
            Expression::StringLiteral(s) => write!(f, "{:?}", s),
            Expression::ImaginaryLiteral(v) => write!(f, "{:?}i", v),
            Expression::Id { name, .. } | Expression::Enumerator { name, .. } => write!(f, "{}", name),
            Expression::Unary { op, operand, .. } => match op {
                UnaryOp::Minus => write!(f, "-{}", operand),
                UnaryOp::Complement => write!(f, "~{}", operand),
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::AddressOf => write!(f, "&{}", operand),
                UnaryOp::SizeOf => write!(f, "sizeof({})", operand),
                UnaryOp::AlignOf => write!(f, "_Alignof({})", operand),
            },
            Expression::Binary { op, lhs, rhs, .. } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expression::Cast { operand, ty } => write!(f, "({}){}", ty, operand),
            Expression::TypeId { op, operand_ty } => match op {
                TypeIdOp::SizeOf => write!(f, "sizeof({})", operand_ty),
                TypeIdOp::AlignOf => write!(f, "_Alignof({})", operand_ty),
            },
            Expression::Field {
                owner,
                field,
                through_pointer,
                ..
            } => {
                let sep = if *through_pointer { "->" } else { "." };
                write!(f, "{}{}{}", owner, sep, field)
            }
            Expression::Subscript { array, index, .. } => write!(f, "{}[{}]", array, index),
            Expression::Deref { pointer, .. } => write!(f, "*{}", pointer),
            Expression::Call { function, args, .. } => {
                write!(f, "{}(", function)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
