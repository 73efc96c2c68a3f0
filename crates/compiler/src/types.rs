//! The C type system.
//!
//! Types live in an index arena owned by [`TypeTable`]; a [`TypeId`] is what
//! flows through tokens, AST nodes and objects. Self-referential types
//! (`struct Node { struct Node *next; }`) are id cycles. The primitive
//! types are interned once at table construction, so identity comparison
//! against e.g. `table.ty_int` is meaningful everywhere.

use crate::ast::ObjId;
use cvm_core::arena::{Arena, Id};
use cvm_core::source::Loc;

pub type TypeId = Id<Type>;

pub fn align_to(n: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    (n + align - 1) / align * align
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub ty: TypeId,
    pub loc: Option<Loc>,
    /// Byte offset inside the aggregate (bit-holding unit for bitfields).
    pub offset: i64,
    pub align: i64,
    pub is_bitfield: bool,
    pub bit_offset: i64,
    pub bit_width: i64,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    LongDouble,
    /// Int-compatible; distinct for diagnostics only.
    Enum,
    Ptr {
        base: TypeId,
    },
    Array {
        base: TypeId,
        /// Element count; -1 marks an incomplete array type.
        len: i64,
    },
    /// Variable-length array. The slot holds a pointer to storage obtained
    /// at declaration time; the hidden local carries the byte size for
    /// `sizeof`.
    Vla {
        base: TypeId,
        size_var: Option<ObjId>,
    },
    Func {
        ret: TypeId,
        params: Vec<TypeId>,
        is_variadic: bool,
    },
    Struct {
        members: Vec<Member>,
        tag: Option<String>,
        is_union: bool,
        is_flexible: bool,
        /// False until the definition with a member list is seen.
        is_complete: bool,
    },
    /// Sentinel produced by recoverable errors; silences cascades.
    Error,
}

#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub size: i64,
    pub align: i64,
    pub is_unsigned: bool,
    pub is_const: bool,
    pub is_atomic: bool,
    /// Typedef source, unwrapped during compatibility comparison.
    pub origin: Option<TypeId>,
}

impl Type {
    fn new(kind: TypeKind, size: i64, align: i64) -> Self {
        Type {
            kind,
            size,
            align,
            is_unsigned: false,
            is_const: false,
            is_atomic: false,
            origin: None,
        }
    }
}

/// Owner of all types for one compiler instance.
pub struct TypeTable {
    arena: Arena<Type>,
    pub ty_void: TypeId,
    pub ty_bool: TypeId,
    pub ty_char: TypeId,
    pub ty_short: TypeId,
    pub ty_int: TypeId,
    pub ty_long: TypeId,
    pub ty_uchar: TypeId,
    pub ty_ushort: TypeId,
    pub ty_uint: TypeId,
    pub ty_ulong: TypeId,
    pub ty_float: TypeId,
    pub ty_double: TypeId,
    pub ty_ldouble: TypeId,
    pub ty_error: TypeId,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let mut prim = |kind: TypeKind, size: i64, align: i64, unsigned: bool| {
            let mut t = Type::new(kind, size, align);
            t.is_unsigned = unsigned;
            arena.alloc(t)
        };
        let ty_void = prim(TypeKind::Void, 1, 1, false);
        let ty_bool = prim(TypeKind::Bool, 1, 1, true);
        let ty_char = prim(TypeKind::Char, 1, 1, false);
        let ty_short = prim(TypeKind::Short, 2, 2, false);
        let ty_int = prim(TypeKind::Int, 4, 4, false);
        let ty_long = prim(TypeKind::Long, 8, 8, false);
        let ty_uchar = prim(TypeKind::Char, 1, 1, true);
        let ty_ushort = prim(TypeKind::Short, 2, 2, true);
        let ty_uint = prim(TypeKind::Int, 4, 4, true);
        let ty_ulong = prim(TypeKind::Long, 8, 8, true);
        let ty_float = prim(TypeKind::Float, 4, 4, false);
        let ty_double = prim(TypeKind::Double, 8, 8, false);
        let ty_ldouble = prim(TypeKind::LongDouble, 16, 16, false);
        let ty_error = prim(TypeKind::Error, 0, 1, false);
        TypeTable {
            arena,
            ty_void,
            ty_bool,
            ty_char,
            ty_short,
            ty_int,
            ty_long,
            ty_uchar,
            ty_ushort,
            ty_uint,
            ty_ulong,
            ty_float,
            ty_double,
            ty_ldouble,
            ty_error,
        }
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        self.arena.get_mut(id)
    }

    pub fn alloc(&mut self, ty: Type) -> TypeId {
        self.arena.alloc(ty)
    }

    pub fn copy_type(&mut self, id: TypeId) -> TypeId {
        let t = self.get(id).clone();
        self.arena.alloc(t)
    }

    pub fn pointer_to(&mut self, base: TypeId) -> TypeId {
        let mut t = Type::new(TypeKind::Ptr { base }, 8, 8);
        t.is_unsigned = true;
        self.arena.alloc(t)
    }

    pub fn array_of(&mut self, base: TypeId, len: i64) -> TypeId {
        let (bsize, balign) = {
            let b = self.get(base);
            (b.size, b.align)
        };
        let size = if len < 0 { -1 } else { bsize * len };
        self.arena.alloc(Type::new(
            TypeKind::Array { base, len },
            size,
            balign.max(1),
        ))
    }

    pub fn vla_of(&mut self, base: TypeId) -> TypeId {
        self.arena
            .alloc(Type::new(TypeKind::Vla { base, size_var: None }, 8, 8))
    }

    pub fn func_type(&mut self, ret: TypeId, params: Vec<TypeId>, is_variadic: bool) -> TypeId {
        // A function type's size is meaningless; 1 keeps pointer arithmetic
        // on function pointers from producing zero offsets.
        self.arena.alloc(Type::new(
            TypeKind::Func {
                ret,
                params,
                is_variadic,
            },
            1,
            1,
        ))
    }

    pub fn enum_type(&mut self) -> TypeId {
        self.arena.alloc(Type::new(TypeKind::Enum, 4, 4))
    }

    pub fn struct_type(&mut self, is_union: bool) -> TypeId {
        self.arena.alloc(Type::new(
            TypeKind::Struct {
                members: Vec::new(),
                tag: None,
                is_union,
                is_flexible: false,
                is_complete: false,
            },
            -1,
            1,
        ))
    }

    // --- classification -------------------------------------------------

    pub fn is_error(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Error)
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).kind,
            TypeKind::Bool
                | TypeKind::Char
                | TypeKind::Short
                | TypeKind::Int
                | TypeKind::Long
                | TypeKind::Enum
        )
    }

    pub fn is_flonum(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).kind,
            TypeKind::Float | TypeKind::Double | TypeKind::LongDouble
        )
    }

    pub fn is_numeric(&self, id: TypeId) -> bool {
        self.is_integer(id) || self.is_flonum(id)
    }

    pub fn is_scalar(&self, id: TypeId) -> bool {
        self.is_numeric(id) || self.base_of(id).is_some()
    }

    pub fn is_aggregate(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).kind,
            TypeKind::Struct { .. } | TypeKind::Array { .. }
        )
    }

    pub fn is_struct_or_union(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Struct { .. })
    }

    pub fn is_func(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Func { .. })
    }

    pub fn is_vla(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Vla { .. })
    }

    pub fn is_ptr(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Ptr { .. })
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Void)
    }

    /// For pointers, arrays and VLAs: the element type.
    pub fn base_of(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Ptr { base }
            | TypeKind::Array { base, .. }
            | TypeKind::Vla { base, .. } => Some(base),
            _ => None,
        }
    }

    pub fn return_type_of(&self, id: TypeId) -> Option<TypeId> {
        match &self.get(id).kind {
            TypeKind::Func { ret, .. } => Some(*ret),
            _ => None,
        }
    }

    pub fn members_of(&self, id: TypeId) -> &[Member] {
        match &self.get(id).kind {
            TypeKind::Struct { members, .. } => members,
            _ => &[],
        }
    }

    // --- compatibility --------------------------------------------------

    pub fn is_compatible(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        if let Some(origin) = self.get(a).origin {
            return self.is_compatible(origin, b);
        }
        if let Some(origin) = self.get(b).origin {
            return self.is_compatible(a, origin);
        }
        let (ta, tb) = (self.get(a), self.get(b));
        match (&ta.kind, &tb.kind) {
            (TypeKind::Void, TypeKind::Void) | (TypeKind::Bool, TypeKind::Bool) => true,
            (TypeKind::Char, TypeKind::Char)
            | (TypeKind::Short, TypeKind::Short)
            | (TypeKind::Int, TypeKind::Int)
            | (TypeKind::Long, TypeKind::Long) => ta.is_unsigned == tb.is_unsigned,
            (TypeKind::Enum, TypeKind::Enum) => a == b,
            (TypeKind::Float, TypeKind::Float)
            | (TypeKind::Double, TypeKind::Double)
            | (TypeKind::LongDouble, TypeKind::LongDouble) => true,
            (TypeKind::Ptr { base: ba }, TypeKind::Ptr { base: bb }) => {
                self.is_compatible(*ba, *bb)
            }
            (
                TypeKind::Func {
                    ret: ra,
                    params: pa,
                    is_variadic: va,
                },
                TypeKind::Func {
                    ret: rb,
                    params: pb,
                    is_variadic: vb,
                },
            ) => {
                self.is_compatible(*ra, *rb)
                    && va == vb
                    && pa.len() == pb.len()
                    && pa
                        .iter()
                        .zip(pb.iter())
                        .all(|(x, y)| self.is_compatible(*x, *y))
            }
            (
                TypeKind::Array { base: ba, len: la },
                TypeKind::Array { base: bb, len: lb },
            ) => self.is_compatible(*ba, *bb) && (*la < 0 || *lb < 0 || la == lb),
            _ => false,
        }
    }

    /// Usual arithmetic conversions (C11 6.3.1.8).
    pub fn common_type(&mut self, a: TypeId, b: TypeId) -> TypeId {
        if let Some(base) = self.base_of(a) {
            return self.pointer_to(base);
        }
        if self.is_func(a) {
            return self.pointer_to(a);
        }
        if self.is_func(b) {
            return self.pointer_to(b);
        }
        let kind_of = |t: &TypeTable, id: TypeId| match t.get(id).kind {
            TypeKind::LongDouble => 3,
            TypeKind::Double => 2,
            TypeKind::Float => 1,
            _ => 0,
        };
        match kind_of(self, a).max(kind_of(self, b)) {
            3 => return self.ty_ldouble,
            2 => return self.ty_double,
            1 => return self.ty_float,
            _ => {}
        }
        // Integer promotion: anything smaller than int becomes int.
        let mut a = if self.get(a).size < 4 { self.ty_int } else { a };
        let mut b = if self.get(b).size < 4 { self.ty_int } else { b };
        if matches!(self.get(a).kind, TypeKind::Enum) {
            a = self.ty_int;
        }
        if matches!(self.get(b).kind, TypeKind::Enum) {
            b = self.ty_int;
        }
        if self.get(a).size != self.get(b).size {
            return if self.get(a).size < self.get(b).size {
                b
            } else {
                a
            };
        }
        // Same rank: unsigned dominates.
        if self.get(b).is_unsigned {
            b
        } else {
            a
        }
    }

    // --- display ----------------------------------------------------------

    pub fn display(&self, id: TypeId) -> String {
        let t = self.get(id);
        match &t.kind {
            TypeKind::Void => "void".into(),
            TypeKind::Bool => "_Bool".into(),
            TypeKind::Char => self.int_name(t, "char"),
            TypeKind::Short => self.int_name(t, "short"),
            TypeKind::Int => self.int_name(t, "int"),
            TypeKind::Long => self.int_name(t, "long"),
            TypeKind::Float => "float".into(),
            TypeKind::Double => "double".into(),
            TypeKind::LongDouble => "long double".into(),
            TypeKind::Enum => "enum".into(),
            TypeKind::Ptr { base } => format!("{} *", self.display(*base)),
            TypeKind::Array { base, len } => {
                if *len < 0 {
                    format!("{} []", self.display(*base))
                } else {
                    format!("{} [{}]", self.display(*base), len)
                }
            }
            TypeKind::Vla { base, .. } => format!("{} [*]", self.display(*base)),
            TypeKind::Func { ret, .. } => format!("{} (*)()", self.display(*ret)),
            TypeKind::Struct {
                tag,
                is_union: false,
                ..
            } => format!("struct {}", tag.as_deref().unwrap_or("<anonymous>")),
            TypeKind::Struct { tag, .. } => {
                format!("union {}", tag.as_deref().unwrap_or("<anonymous>"))
            }
            TypeKind::Error => "<error>".into(),
        }
    }

    fn int_name(&self, t: &Type, name: &str) -> String {
        if t.is_unsigned {
            format!("unsigned {}", name)
        } else {
            name.to_string()
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_sizes_match_the_abi() {
        let t = TypeTable::new();
        assert_eq!(t.get(t.ty_char).size, 1);
        assert_eq!(t.get(t.ty_short).size, 2);
        assert_eq!(t.get(t.ty_int).size, 4);
        assert_eq!(t.get(t.ty_long).size, 8);
        assert_eq!(t.get(t.ty_float).size, 4);
        assert_eq!(t.get(t.ty_double).size, 8);
    }

    #[test]
    fn compatibility_is_an_equivalence() {
        let mut t = TypeTable::new();
        let p_int = t.pointer_to(t.ty_int);
        let p_int2 = t.pointer_to(t.ty_int);
        let p_uint = t.pointer_to(t.ty_uint);
        let types = [t.ty_int, t.ty_uint, t.ty_long, p_int, p_int2, p_uint];
        // Reflexive and symmetric over a small universe.
        for &a in &types {
            assert!(t.is_compatible(a, a));
            for &b in &types {
                assert_eq!(t.is_compatible(a, b), t.is_compatible(b, a));
            }
        }
        // Transitive where it holds.
        for &a in &types {
            for &b in &types {
                for &c in &types {
                    if t.is_compatible(a, b) && t.is_compatible(b, c) {
                        assert!(t.is_compatible(a, c));
                    }
                }
            }
        }
        assert!(t.is_compatible(p_int, p_int2));
        assert!(!t.is_compatible(p_int, p_uint));
    }

    #[test]
    fn typedef_origin_unwraps() {
        let mut t = TypeTable::new();
        let alias = t.copy_type(t.ty_int);
        t.get_mut(alias).origin = Some(t.ty_int);
        assert!(t.is_compatible(alias, t.ty_int));
        assert!(t.is_compatible(t.ty_int, alias));
    }

    #[test]
    fn usual_arithmetic_conversions() {
        let mut t = TypeTable::new();
        assert_eq!(t.common_type(t.ty_char, t.ty_char), t.ty_int);
        assert_eq!(t.common_type(t.ty_int, t.ty_long), t.ty_long);
        assert_eq!(t.common_type(t.ty_uint, t.ty_int), t.ty_uint);
        assert_eq!(t.common_type(t.ty_int, t.ty_double), t.ty_double);
        assert_eq!(t.common_type(t.ty_float, t.ty_long), t.ty_float);
        assert_eq!(t.common_type(t.ty_ldouble, t.ty_double), t.ty_ldouble);
        assert_eq!(t.common_type(t.ty_ulong, t.ty_long), t.ty_ulong);
    }

    #[test]
    fn array_compatibility_allows_incomplete_bounds() {
        let mut t = TypeTable::new();
        let a10 = t.array_of(t.ty_int, 10);
        let a10b = t.array_of(t.ty_int, 10);
        let a_inc = t.array_of(t.ty_int, -1);
        let a5 = t.array_of(t.ty_int, 5);
        assert!(t.is_compatible(a10, a10b));
        assert!(t.is_compatible(a10, a_inc));
        assert!(!t.is_compatible(a10, a5));
    }
}
