//! C types and the machine description they are measured against.
//!
//! The value analysis only ever holds 64-bit integers, so the machine model is
//! mostly consulted for two things: the bit width and signedness of integral
//! types (for the cast/overflow rule), and byte sizes and field offsets (for
//! `sizeof` and for naming sub-object cells).

use std::fmt;

/// Integer rank, from `_Bool` up to `long long`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum IntKind {
    Bool,
    Char,
    Short,
    Int,
    Long,
    LongLong,
}

/// Floating-point kinds. Values of these types are never tracked.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FloatKind {
    Float,
    Double,
    LongDouble,
}

/// A struct member.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: CType,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: CType) -> Self {
        Field { name: name.into(), ty }
    }
}

/// A (simplified) C type.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum CType {
    Void,
    /// Integral type. `signed: None` is the plain spelling: signed for every
    /// kind except `char`, whose signedness is machine dependent.
    Int { kind: IntKind, signed: Option<bool> },
    Float(FloatKind),
    Pointer(Box<CType>),
    Array { element: Box<CType>, length: Option<u64> },
    Struct { name: String, fields: Vec<Field> },
    Enum { name: String },
    Function,
}

impl CType {
    pub fn bool() -> Self {
        CType::Int {
            kind: IntKind::Bool,
            signed: Some(false),
        }
    }

    pub fn char() -> Self {
        CType::Int {
            kind: IntKind::Char,
            signed: None,
        }
    }

    pub fn schar() -> Self {
        CType::Int {
            kind: IntKind::Char,
            signed: Some(true),
        }
    }

    pub fn uchar() -> Self {
        CType::Int {
            kind: IntKind::Char,
            signed: Some(false),
        }
    }

    pub fn short() -> Self {
        CType::Int {
            kind: IntKind::Short,
            signed: None,
        }
    }

    pub fn ushort() -> Self {
        CType::Int {
            kind: IntKind::Short,
            signed: Some(false),
        }
    }

    pub fn int() -> Self {
        CType::Int {
            kind: IntKind::Int,
            signed: None,
        }
    }

    pub fn uint() -> Self {
        CType::Int {
            kind: IntKind::Int,
            signed: Some(false),
        }
    }

    pub fn long() -> Self {
        CType::Int {
            kind: IntKind::Long,
            signed: None,
        }
    }

    pub fn ulong() -> Self {
        CType::Int {
            kind: IntKind::Long,
            signed: Some(false),
        }
    }

    pub fn long_long() -> Self {
        CType::Int {
            kind: IntKind::LongLong,
            signed: None,
        }
    }

    pub fn ulong_long() -> Self {
        CType::Int {
            kind: IntKind::LongLong,
            signed: Some(false),
        }
    }

    pub fn double() -> Self {
        CType::Float(FloatKind::Double)
    }

    pub fn pointer_to(target: CType) -> Self {
        CType::Pointer(Box::new(target))
    }

    pub fn array_of(element: CType, length: u64) -> Self {
        CType::Array {
            element: Box::new(element),
            length: Some(length),
        }
    }

    pub fn structure(name: impl Into<String>, fields: Vec<Field>) -> Self {
        CType::Struct {
            name: name.into(),
            fields,
        }
    }

    pub fn enumeration(name: impl Into<String>) -> Self {
        CType::Enum { name: name.into() }
    }

    /// Integral or enum type: the only types whose values are tracked.
    pub fn is_integral(&self) -> bool {
        matches!(self, CType::Int { .. } | CType::Enum { .. })
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, CType::Float(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer(_))
    }

    pub fn is_enum(&self) -> bool {
        matches!(self, CType::Enum { .. })
    }

    /// Struct or array: a type made of several cells.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, CType::Struct { .. } | CType::Array { .. })
    }

    /// Rank used for the usual arithmetic conversions.
    fn rank(&self) -> Option<IntKind> {
        match self {
            CType::Int { kind, .. } => Some(*kind),
            CType::Enum { .. } => Some(IntKind::Int),
            _ => None,
        }
    }

    fn is_explicitly_unsigned(&self) -> bool {
        matches!(self, CType::Int { signed: Some(false), .. })
    }

    /// Result type of the usual arithmetic conversions applied to `a` and `b`.
    ///
    /// Operands are promoted to at least `int`; the higher rank wins, and an
    /// unsigned operand of the winning rank makes the result unsigned.
    /// Non-integral operands yield the first non-integral type (the result is
    /// then never evaluated).
    pub fn common(a: &CType, b: &CType) -> CType {
        let (ka, kb) = match (a.rank(), b.rank()) {
            (Some(ka), Some(kb)) => (ka, kb),
            (None, _) => return a.clone(),
            (_, None) => return b.clone(),
        };
        let kind = ka.max(kb).max(IntKind::Int);
        // types below `int` promote to (signed) `int`
        let unsigned_at = |ty: &CType, k: IntKind| k == kind && ty.is_explicitly_unsigned();
        let unsigned = unsigned_at(a, ka) || unsigned_at(b, kb);
        CType::Int {
            kind,
            signed: if unsigned { Some(false) } else { None },
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CType::Void => write!(f, "void"),
            CType::Int { kind, signed } => {
                match (kind, signed) {
                    (IntKind::Bool, _) => return write!(f, "_Bool"),
                    (_, Some(false)) => write!(f, "unsigned ")?,
                    (IntKind::Char, Some(true)) => write!(f, "signed ")?,
                    _ => {}
                }
                let name = match kind {
                    IntKind::Bool => unreachable!(),
                    IntKind::Char => "char",
                    IntKind::Short => "short",
                    IntKind::Int => "int",
                    IntKind::Long => "long",
                    IntKind::LongLong => "long long",
                };
                write!(f, "{}", name)
            }
            CType::Float(FloatKind::Float) => write!(f, "float"),
            CType::Float(FloatKind::Double) => write!(f, "double"),
            CType::Float(FloatKind::LongDouble) => write!(f, "long double"),
            CType::Pointer(target) => write!(f, "{}*", target),
            CType::Array { element, length: Some(n) } => write!(f, "{}[{}]", element, n),
            CType::Array { element, length: None } => write!(f, "{}[]", element),
            CType::Struct { name, .. } => write!(f, "struct {}", name),
            CType::Enum { name } => write!(f, "enum {}", name),
            CType::Function => write!(f, "<function>"),
        }
    }
}

/// Sizes (in bytes) and conventions of the target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineModel {
    pub size_of_short: u64,
    pub size_of_int: u64,
    pub size_of_long: u64,
    pub size_of_long_long: u64,
    pub size_of_pointer: u64,
    pub size_of_float: u64,
    pub size_of_double: u64,
    pub size_of_long_double: u64,
    /// Largest alignment any member is ever given inside a struct.
    pub max_alignment: u64,
    pub char_is_signed: bool,
}

impl MachineModel {
    /// 32-bit Linux (ILP32, i386 ABI).
    pub const LINUX32: MachineModel = MachineModel {
        size_of_short: 2,
        size_of_int: 4,
        size_of_long: 4,
        size_of_long_long: 8,
        size_of_pointer: 4,
        size_of_float: 4,
        size_of_double: 8,
        size_of_long_double: 12,
        max_alignment: 4,
        char_is_signed: true,
    };

    /// 64-bit Linux (LP64, x86-64 ABI).
    pub const LINUX64: MachineModel = MachineModel {
        size_of_short: 2,
        size_of_int: 4,
        size_of_long: 8,
        size_of_long_long: 8,
        size_of_pointer: 8,
        size_of_float: 4,
        size_of_double: 8,
        size_of_long_double: 16,
        max_alignment: 16,
        char_is_signed: true,
    };

    /// `sizeof(ty)` in bytes, saturating at `u64::MAX` for types too large
    /// to address.
    pub fn size_of(&self, ty: &CType) -> u64 {
        match ty {
            // GCC extension: sizeof(void) == 1
            CType::Void | CType::Function => 1,
            CType::Int { kind, .. } => match kind {
                IntKind::Bool | IntKind::Char => 1,
                IntKind::Short => self.size_of_short,
                IntKind::Int => self.size_of_int,
                IntKind::Long => self.size_of_long,
                IntKind::LongLong => self.size_of_long_long,
            },
            CType::Enum { .. } => self.size_of_int,
            CType::Float(FloatKind::Float) => self.size_of_float,
            CType::Float(FloatKind::Double) => self.size_of_double,
            CType::Float(FloatKind::LongDouble) => self.size_of_long_double,
            CType::Pointer(_) => self.size_of_pointer,
            CType::Array { element, length } => self.size_of(element).saturating_mul(length.unwrap_or(0)),
            CType::Struct { fields, .. } => {
                let (end, align) = self.layout(fields, None).1;
                round_up(end, align)
            }
        }
    }

    /// Alignment of `ty` in bytes.
    pub fn align_of(&self, ty: &CType) -> u64 {
        match ty {
            CType::Array { element, .. } => self.align_of(element),
            CType::Struct { fields, .. } => fields.iter().map(|f| self.align_of(&f.ty)).max().unwrap_or(1),
            _ => self.size_of(ty).clamp(1, self.max_alignment),
        }
    }

    /// Byte offset of `field` inside the struct type `ty`.
    pub fn field_offset(&self, ty: &CType, field: &str) -> Option<u64> {
        match ty {
            CType::Struct { fields, .. } => self.layout(fields, Some(field)).0.filter(|&offset| offset < u64::MAX),
            _ => None,
        }
    }

    /// Lays out `fields` in declaration order. Returns the offset of `target`
    /// (if requested and present), and the end offset and alignment of the
    /// whole struct.
    fn layout(&self, fields: &[Field], target: Option<&str>) -> (Option<u64>, (u64, u64)) {
        let mut offset = 0;
        let mut max_align = 1;
        let mut found = None;
        for field in fields {
            let align = self.align_of(&field.ty);
            max_align = max_align.max(align);
            offset = round_up(offset, align);
            if target == Some(field.name.as_str()) {
                found = Some(offset);
            }
            offset = offset.saturating_add(self.size_of(&field.ty));
        }
        (found, (offset, max_align))
    }

    /// Bit width of an integral type, `None` for every other type.
    pub fn bit_width(&self, ty: &CType) -> Option<u32> {
        if ty.is_integral() {
            Some((self.size_of(ty) * 8) as u32)
        } else {
            None
        }
    }

    /// Whether an integral type is signed on this machine.
    pub fn is_signed(&self, ty: &CType) -> bool {
        match ty {
            CType::Int {
                kind: IntKind::Bool, ..
            } => false,
            CType::Int { signed: Some(s), .. } => *s,
            CType::Int {
                kind: IntKind::Char,
                signed: None,
            } => self.char_is_signed,
            CType::Int { signed: None, .. } => true,
            CType::Enum { .. } => true,
            _ => false,
        }
    }

    /// Unsigned integral type at least 64 bits wide: these are computed with
    /// the unsigned 64-bit primitives.
    pub fn is_unsigned_64(&self, ty: &CType) -> bool {
        ty.is_integral() && !self.is_signed(ty) && self.bit_width(ty).is_some_and(|w| w >= 64)
    }
}

impl Default for MachineModel {
    fn default() -> Self {
        MachineModel::LINUX32
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align.max(1)).saturating_mul(align.max(1))
}

/// Casts `value` into the integral type `target`.
///
/// For widths below 64 bits the value is reduced modulo `2^width` and then
/// re-centred into the signed range when `target` is signed. `_Bool` follows
/// the same rule with width 8 only after normalizing to `0`/`1`. Non-integral
/// targets, and 64-bit targets, leave the value unchanged.
pub fn cast_value(value: i64, target: &CType, machine: &MachineModel) -> i64 {
    if let CType::Int {
        kind: IntKind::Bool, ..
    } = target
    {
        return (value != 0) as i64;
    }
    let Some(width) = machine.bit_width(target) else {
        return value;
    };
    if width >= 64 {
        return value;
    }
    let modulus = 1i128 << width;
    let mut truncated = (value as i128).rem_euclid(modulus);
    if machine.is_signed(target) && truncated >= modulus / 2 {
        truncated -= modulus;
    }
    truncated as i64
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_sizes() {
        let m32 = MachineModel::LINUX32;
        let m64 = MachineModel::LINUX64;
        assert_eq!(m32.size_of(&CType::long()), 4);
        assert_eq!(m64.size_of(&CType::long()), 8);
        assert_eq!(m32.size_of(&CType::pointer_to(CType::int())), 4);
        assert_eq!(m64.size_of(&CType::array_of(CType::short(), 10)), 20);
        assert_eq!(m64.size_of(&CType::Void), 1);
    }

    #[test]
    fn test_huge_arrays_saturate() {
        let m = MachineModel::LINUX64;
        let huge = CType::array_of(CType::int(), u64::MAX / 2);
        assert_eq!(m.size_of(&huge), u64::MAX);
        let s = CType::structure("big", vec![Field::new("arr", huge), Field::new("after", CType::int())]);
        assert_eq!(m.field_offset(&s, "arr"), Some(0));
        assert_eq!(m.field_offset(&s, "after"), None);
        assert_eq!(m.size_of(&s), u64::MAX);
    }

    #[test]
    fn test_struct_layout() {
        let m = MachineModel::LINUX64;
        let s = CType::structure(
            "s",
            vec![
                Field::new("c", CType::char()),
                Field::new("i", CType::int()),
                Field::new("l", CType::long()),
                Field::new("d", CType::char()),
            ],
        );
        assert_eq!(m.field_offset(&s, "c"), Some(0));
        assert_eq!(m.field_offset(&s, "i"), Some(4));
        assert_eq!(m.field_offset(&s, "l"), Some(8));
        assert_eq!(m.field_offset(&s, "d"), Some(16));
        assert_eq!(m.field_offset(&s, "missing"), None);
        assert_eq!(m.size_of(&s), 24);

        // long long is only 4-aligned on i386
        let s = CType::structure("t", vec![Field::new("c", CType::char()), Field::new("q", CType::long_long())]);
        assert_eq!(MachineModel::LINUX32.field_offset(&s, "q"), Some(4));
    }

    #[test]
    fn test_signedness() {
        let m = MachineModel::LINUX32;
        assert!(m.is_signed(&CType::int()));
        assert!(!m.is_signed(&CType::uint()));
        assert!(m.is_signed(&CType::char()));
        assert!(!m.is_signed(&CType::uchar()));
        assert!(!m.is_signed(&CType::bool()));

        let unsigned_char_machine = MachineModel {
            char_is_signed: false,
            ..MachineModel::LINUX32
        };
        assert!(!unsigned_char_machine.is_signed(&CType::char()));
        assert!(unsigned_char_machine.is_signed(&CType::schar()));
    }

    #[test]
    fn test_unsigned_64() {
        assert!(MachineModel::LINUX64.is_unsigned_64(&CType::ulong()));
        assert!(!MachineModel::LINUX32.is_unsigned_64(&CType::ulong()));
        assert!(MachineModel::LINUX32.is_unsigned_64(&CType::ulong_long()));
        assert!(!MachineModel::LINUX64.is_unsigned_64(&CType::long()));
    }

    #[test]
    fn test_cast_signed_char() {
        let m = MachineModel::LINUX32;
        assert_eq!(cast_value(127, &CType::schar(), &m), 127);
        assert_eq!(cast_value(128, &CType::schar(), &m), -128);
        assert_eq!(cast_value(255, &CType::schar(), &m), -1);
        assert_eq!(cast_value(256, &CType::schar(), &m), 0);
        assert_eq!(cast_value(-129, &CType::schar(), &m), 127);
    }

    #[test]
    fn test_cast_unsigned() {
        let m = MachineModel::LINUX32;
        assert_eq!(cast_value(-1, &CType::uchar(), &m), 255);
        assert_eq!(cast_value(-1, &CType::uint(), &m), 4294967295);
        assert_eq!(cast_value(1 << 32, &CType::uint(), &m), 0);
        assert_eq!(cast_value(65537, &CType::ushort(), &m), 1);
    }

    #[test]
    fn test_cast_wide_and_non_integral() {
        let m = MachineModel::LINUX64;
        assert_eq!(cast_value(i64::MIN, &CType::long(), &m), i64::MIN);
        assert_eq!(cast_value(-1, &CType::ulong(), &m), -1);
        assert_eq!(cast_value(1 << 40, &CType::double(), &m), 1 << 40);
        assert_eq!(cast_value(7, &CType::pointer_to(CType::int()), &m), 7);
    }

    #[test]
    fn test_cast_bool() {
        let m = MachineModel::LINUX32;
        assert_eq!(cast_value(256, &CType::bool(), &m), 1);
        assert_eq!(cast_value(0, &CType::bool(), &m), 0);
        assert_eq!(cast_value(-3, &CType::bool(), &m), 1);
    }

    #[test]
    fn test_cast_is_idempotent() {
        let m = MachineModel::LINUX32;
        let samples = [
            i64::MIN,
            i64::MIN + 1,
            -65536,
            -257,
            -129,
            -128,
            -1,
            0,
            1,
            127,
            128,
            255,
            256,
            1 << 31,
            i64::MAX - 1,
            i64::MAX,
        ];
        for ty in [CType::schar(), CType::uchar(), CType::short(), CType::uint()] {
            for &v in &samples {
                let once = cast_value(v, &ty, &m);
                assert_eq!(cast_value(once, &ty, &m), once, "cast to {} not idempotent for {}", ty, v);
            }
        }
    }

    #[test]
    fn test_common_type() {
        assert_eq!(CType::common(&CType::char(), &CType::short()), CType::int());
        assert_eq!(CType::common(&CType::uint(), &CType::int()), CType::uint());
        assert_eq!(CType::common(&CType::long(), &CType::uint()), CType::long());
        assert_eq!(CType::common(&CType::ulong_long(), &CType::long()), CType::ulong_long());
        assert_eq!(CType::common(&CType::uchar(), &CType::uchar()), CType::int());
    }
}
