//! The closed set of IR types (§4.1).
//!
//! `Type` is an immutable, structurally-equal tagged value. Implementations
//! may intern to share structure (see [`TypeTable`]) but two `Type`s that
//! are not the same object must still compare equal whenever they describe
//! the same shape.

use std::fmt;

/// A type in the IR system.
///
/// Equality and hashing are always structural, independent of interning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Type {
    /// No value.
    Void,
    /// A reference to a basic block.
    Label,
    /// A simulation-time value (picoseconds + delta cycles).
    Time,
    /// A two's-complement integer of `w` bits, `w >= 1`.
    Int(u32),
    /// A nine-valued logic vector of width `w`.
    Logic(u32),
    /// A driven wire carrying values of the inner type.
    Signal(Box<Type>),
    /// A pointer to a value of the inner type.
    Pointer(Box<Type>),
    /// A fixed-size array of `n` elements of the inner type.
    Array(u32, Box<Type>),
    /// An aggregate of heterogeneous fields.
    Struct(Vec<Type>),
}

impl Type {
    pub fn int(width: u32) -> Self {
        Type::Int(width)
    }

    pub fn logic(width: u32) -> Self {
        Type::Logic(width)
    }

    pub fn signal(inner: Type) -> Self {
        Type::Signal(Box::new(inner))
    }

    pub fn pointer(inner: Type) -> Self {
        Type::Pointer(Box::new(inner))
    }

    pub fn array(len: u32, inner: Type) -> Self {
        Type::Array(len, Box::new(inner))
    }

    pub fn struct_of(fields: Vec<Type>) -> Self {
        Type::Struct(fields)
    }

    /// Width of `Int`/`Logic`, recursively for `Array`. `None` for any other
    /// variant.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Int(w) | Type::Logic(w) => Some(*w),
            Type::Array(n, elem) => elem.bit_width().map(|w| w * n),
            _ => None,
        }
    }

    /// Width in the narrow sense the operand contracts in §4.3 use: the `w`
    /// of an `Int`/`Logic` value directly, not recursing through arrays.
    pub fn scalar_width(&self) -> Option<u32> {
        match self {
            Type::Int(w) | Type::Logic(w) => Some(*w),
            _ => None,
        }
    }

    /// The element type of `Signal`, `Pointer`, or `Array`.
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::Signal(t) | Type::Pointer(t) | Type::Array(_, t) => Some(t),
            _ => None,
        }
    }

    pub fn array_len(&self) -> Option<u32> {
        match self {
            Type::Array(n, _) => Some(*n),
            _ => None,
        }
    }

    pub fn struct_fields(&self) -> Option<&[Type]> {
        match self {
            Type::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, Type::Signal(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_logic(&self) -> bool {
        matches!(self, Type::Logic(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Struct(_) | Type::Array(_, _))
    }

    /// The type carried by a `Signal`, or `self` if this is not a signal.
    /// Used by operand contracts that accept either a bare value or its
    /// driven-signal counterpart nowhere in §4.3 — kept narrow: only used
    /// internally by `prb`'s contract check.
    pub fn signal_value_type(&self) -> Option<&Type> {
        match self {
            Type::Signal(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Label => write!(f, "label"),
            Type::Time => write!(f, "time"),
            Type::Int(w) => write!(f, "i{}", w),
            Type::Logic(w) => write!(f, "n{}", w),
            Type::Signal(inner) => write!(f, "{}$", inner),
            Type::Pointer(inner) => write!(f, "{}*", inner),
            Type::Array(n, inner) => write!(f, "[{} x {}]", n, inner),
            Type::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Per-module type interner (§5: "types may be interned in a table
/// read/written during construction — this table is local to the module").
///
/// Interning is purely a sharing optimization; callers must never rely on
/// pointer identity, only on `==`.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: indexmap::IndexSet<Type>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `ty`, returning a stable handle that can be resolved back via
    /// [`TypeTable::get`].
    pub fn intern(&mut self, ty: Type) -> TypeId {
        let (index, _) = self.types.insert_full(ty);
        TypeId(index as u32)
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.types
            .get_index(id.0 as usize)
            .expect("TypeId from a different TypeTable")
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A handle into a [`TypeTable`]. Only valid for the table that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_is_independent_of_construction_order() {
        let a = Type::array(4, Type::int(8));
        let b = Type::Array(4, Box::new(Type::Int(8)));
        assert_eq!(a, b);
        assert_ne!(a, Type::array(4, Type::int(16)));
    }

    #[test]
    fn width_queries() {
        assert_eq!(Type::int(32).scalar_width(), Some(32));
        assert_eq!(Type::logic(4).scalar_width(), Some(4));
        assert_eq!(Type::Void.scalar_width(), None);
        assert_eq!(Type::array(3, Type::int(8)).bit_width(), Some(24));
    }

    #[test]
    fn element_type_accessors() {
        let sig = Type::signal(Type::int(8));
        assert_eq!(sig.element_type(), Some(&Type::int(8)));
        assert!(sig.is_signal());

        let arr = Type::array(2, Type::logic(1));
        assert_eq!(arr.array_len(), Some(2));
        assert_eq!(arr.element_type(), Some(&Type::logic(1)));
    }

    #[test]
    fn display_matches_textual_grammar() {
        assert_eq!(Type::Void.to_string(), "void");
        assert_eq!(Type::int(32).to_string(), "i32");
        assert_eq!(Type::logic(9).to_string(), "n9");
        assert_eq!(Type::signal(Type::int(1)).to_string(), "i1$");
        assert_eq!(Type::pointer(Type::int(8)).to_string(), "i8*");
        assert_eq!(Type::array(4, Type::int(1)).to_string(), "[4 x i1]");
        assert_eq!(
            Type::struct_of(vec![Type::int(8), Type::int(16)]).to_string(),
            "{i8, i16}"
        );
    }

    #[test]
    fn intern_deduplicates_and_resolves() {
        let mut table = TypeTable::new();
        let a = table.intern(Type::int(32));
        let b = table.intern(Type::int(32));
        let c = table.intern(Type::int(64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.get(a), &Type::int(32));
        assert_eq!(table.len(), 2);
    }
}
