//! # Type Context
//!
//! The canonical, interned type universe for one compilation unit. Every
//! `Type` is interned exactly once; the rest of the middle end passes around
//! copyable `TypeHandle` tokens and compares them by equality.
//!
//! Nominal information (class hierarchy, layouts) lives here too: subtyping
//! needs the parent chains and the resolver publishes finished layout
//! descriptors through `set_layout`.

use crate::arena::{StringArena, Symbol};
use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Stable identifier of a nominal class. Registration order is id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interned type token. Two types are equal iff their handles are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeHandle(pub u32);

impl TypeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primitive kinds. `IntPtr` is a raw machine word that never converts
/// implicitly and is never scanned by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimKind {
    I1,
    I8,
    I32,
    I64,
    F32,
    F64,
    Nil,
    IntPtr,
}

impl PrimKind {
    pub fn is_integer(self) -> bool {
        matches!(self, PrimKind::I1 | PrimKind::I8 | PrimKind::I32 | PrimKind::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimKind::F32 | PrimKind::F64)
    }

    /// Size in bytes on a 64-bit target.
    pub fn size_of(self) -> u32 {
        match self {
            PrimKind::I1 | PrimKind::I8 => 1,
            PrimKind::I32 | PrimKind::F32 => 4,
            PrimKind::I64 | PrimKind::F64 => 8,
            // A nil-typed slot is a reference slot that only ever holds nil.
            PrimKind::Nil => 8,
            PrimKind::IntPtr => 8,
        }
    }
}

/// A canonical type. Composite variants refer to their components through
/// already-interned handles, so the structure is acyclic by construction;
/// recursion is only possible through nominal `Class` ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Primitive(PrimKind),
    Class(ClassId),
    GenericInstance(ClassId, Vec<TypeHandle>),
    /// A generic parameter inside a generic class body. Erased at runtime:
    /// slots of this type are pointer-sized and accessed via `load_erased`.
    TypeParam(u8),
    Function {
        params: Vec<TypeHandle>,
        ret: TypeHandle,
        throws: bool,
        is_async: bool,
    },
    Array(TypeHandle),
    Hash(TypeHandle, TypeHandle),
    Range,
    Tuple(Vec<TypeHandle>),
    Block {
        params: Vec<TypeHandle>,
        ret: TypeHandle,
    },
    Channel(TypeHandle),
    Future(TypeHandle),
}

/// Layout policy of a class, declared in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutKind {
    /// GC-managed: object header followed by naturally aligned slots.
    Object,
    /// C-struct layout, platform alignment, no header.
    Struct,
    /// 1-byte alignment, no padding.
    Packed,
    /// Every field at offset 0; size is the max field size.
    Union,
}

/// Serialization policy of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializationPolicy {
    None,
    Json,
}

/// Nominal facts about a registered class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: Symbol,
    pub parent: Option<ClassId>,
    pub layout_kind: LayoutKind,
    /// Number of generic parameters; 0 for ordinary classes.
    pub type_params: u8,
}

/// A single laid-out field slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutField {
    pub name: Symbol,
    pub ty: TypeHandle,
    pub offset: u32,
    pub is_reference: bool,
}

/// Finished byte layout of a class, computed once by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    pub kind: LayoutKind,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<LayoutField>,
    /// Byte offsets the collector must scan. `IntPtr` slots are excluded.
    pub ref_offsets: Vec<u32>,
}

/// Object header: class-descriptor pointer + GC mark/age word.
pub const OBJECT_HEADER_SIZE: u32 = 16;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("unknown class id {0:?}")]
    UnknownClass(ClassId),
    #[error("class {0:?} has no layout yet")]
    MissingLayout(ClassId),
    #[error("primitive kind {0:?} cannot be boxed")]
    NotBoxable(PrimKind),
}

/// Handles to the classes every compilation unit starts with.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub object: ClassId,
    pub string: ClassId,
    pub cell: ClassId,
    /// Cell whose slot the collector must not scan (primitive contents).
    pub raw_cell: ClassId,
    pub exception: ClassId,
    pub division_by_zero_error: ClassId,
    pub index_out_of_bounds_error: ClassId,
    pub null_reference_error: ClassId,
    pub match_error: ClassId,
    pub serialization_error: ClassId,
    pub io: ClassId,
    pub thread: ClassId,
    pub reflect: ClassId,
    pub channel: ClassId,
    boxed: [ClassId; 6],
}

impl Builtins {
    /// Box class for a primitive kind. `Nil` and `IntPtr` are not boxable.
    pub fn box_class(&self, kind: PrimKind) -> Result<ClassId, TypeError> {
        let idx = match kind {
            PrimKind::I1 => 0,
            PrimKind::I8 => 1,
            PrimKind::I32 => 2,
            PrimKind::I64 => 3,
            PrimKind::F32 => 4,
            PrimKind::F64 => 5,
            PrimKind::Nil | PrimKind::IntPtr => return Err(TypeError::NotBoxable(kind)),
        };
        Ok(self.boxed[idx])
    }
}

struct BuiltinDef {
    name: &'static str,
    parent: Option<&'static str>,
}

static BUILTIN_CLASSES: Lazy<Vec<BuiltinDef>> = Lazy::new(|| {
    vec![
        BuiltinDef { name: "Object", parent: None },
        BuiltinDef { name: "String", parent: Some("Object") },
        BuiltinDef { name: "Cell", parent: Some("Object") },
        BuiltinDef { name: "RawCell", parent: Some("Object") },
        BuiltinDef { name: "Exception", parent: Some("Object") },
        BuiltinDef { name: "DivisionByZeroError", parent: Some("Exception") },
        BuiltinDef { name: "IndexOutOfBoundsError", parent: Some("Exception") },
        BuiltinDef { name: "NullReferenceError", parent: Some("Exception") },
        BuiltinDef { name: "MatchError", parent: Some("Exception") },
        BuiltinDef { name: "SerializationError", parent: Some("Exception") },
        BuiltinDef { name: "IO", parent: Some("Object") },
        BuiltinDef { name: "Thread", parent: Some("Object") },
        BuiltinDef { name: "Reflect", parent: Some("Object") },
        BuiltinDef { name: "Channel", parent: Some("Object") },
        BuiltinDef { name: "Bool", parent: Some("Object") },
        BuiltinDef { name: "Byte", parent: Some("Object") },
        BuiltinDef { name: "Int", parent: Some("Object") },
        BuiltinDef { name: "Long", parent: Some("Object") },
        BuiltinDef { name: "Float", parent: Some("Object") },
        BuiltinDef { name: "Double", parent: Some("Object") },
    ]
});

/// The type context (Component A). Owns every `Type` value; hands out
/// copyable handles.
pub struct TypeContext {
    types: IndexSet<Type>,
    classes: IndexMap<ClassId, ClassInfo>,
    layouts: HashMap<ClassId, LayoutDescriptor>,
    builtins: Builtins,
    target: TargetLayout,
}

impl TypeContext {
    pub fn new(arena: &mut StringArena) -> Self {
        Self::with_target(arena, TargetLayout::host())
    }

    pub fn with_target(arena: &mut StringArena, target: TargetLayout) -> Self {
        let mut ctx = TypeContext {
            types: IndexSet::new(),
            classes: IndexMap::new(),
            layouts: HashMap::new(),
            // Patched below once the builtin classes are registered.
            builtins: Builtins {
                object: ClassId(0),
                string: ClassId(0),
                cell: ClassId(0),
                raw_cell: ClassId(0),
                exception: ClassId(0),
                division_by_zero_error: ClassId(0),
                index_out_of_bounds_error: ClassId(0),
                null_reference_error: ClassId(0),
                match_error: ClassId(0),
                serialization_error: ClassId(0),
                io: ClassId(0),
                thread: ClassId(0),
                reflect: ClassId(0),
                channel: ClassId(0),
                boxed: [ClassId(0); 6],
            },
            target,
        };

        let mut by_name: HashMap<&'static str, ClassId> = HashMap::new();
        for def in BUILTIN_CLASSES.iter() {
            let parent = def.parent.map(|p| by_name[p]);
            let sym = arena.intern(def.name);
            let id = ctx.register_class(sym, parent, LayoutKind::Object, 0);
            by_name.insert(def.name, id);
        }

        ctx.builtins = Builtins {
            object: by_name["Object"],
            string: by_name["String"],
            cell: by_name["Cell"],
            raw_cell: by_name["RawCell"],
            exception: by_name["Exception"],
            division_by_zero_error: by_name["DivisionByZeroError"],
            index_out_of_bounds_error: by_name["IndexOutOfBoundsError"],
            null_reference_error: by_name["NullReferenceError"],
            match_error: by_name["MatchError"],
            serialization_error: by_name["SerializationError"],
            io: by_name["IO"],
            thread: by_name["Thread"],
            reflect: by_name["Reflect"],
            channel: by_name["Channel"],
            boxed: [
                by_name["Bool"],
                by_name["Byte"],
                by_name["Int"],
                by_name["Long"],
                by_name["Float"],
                by_name["Double"],
            ],
        };
        ctx
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn target(&self) -> &TargetLayout {
        &self.target
    }

    /// Register a nominal class. Parents must be registered first, which
    /// makes hierarchy cycles unrepresentable.
    pub fn register_class(
        &mut self,
        name: Symbol,
        parent: Option<ClassId>,
        layout_kind: LayoutKind,
        type_params: u8,
    ) -> ClassId {
        if let Some(p) = parent {
            debug_assert!(self.classes.contains_key(&p), "parent registered after child");
        }
        let id = ClassId(self.classes.len() as u32);
        self.classes.insert(
            id,
            ClassInfo {
                id,
                name,
                parent,
                layout_kind,
                type_params,
            },
        );
        id
    }

    pub fn class_info(&self, id: ClassId) -> Result<&ClassInfo, TypeError> {
        self.classes.get(&id).ok_or(TypeError::UnknownClass(id))
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }

    /// Intern a type, returning its canonical handle.
    pub fn intern(&mut self, ty: Type) -> TypeHandle {
        let (index, _) = self.types.insert_full(ty);
        TypeHandle(index as u32)
    }

    pub fn type_of(&self, handle: TypeHandle) -> &Type {
        self.types
            .get_index(handle.index())
            .expect("handle from a different context")
    }

    // Shorthands for the types every pass needs.

    pub fn primitive(&mut self, kind: PrimKind) -> TypeHandle {
        self.intern(Type::Primitive(kind))
    }

    pub fn class_type(&mut self, id: ClassId) -> TypeHandle {
        self.intern(Type::Class(id))
    }

    pub fn string_type(&mut self) -> TypeHandle {
        let id = self.builtins.string;
        self.class_type(id)
    }

    pub fn nil_type(&mut self) -> TypeHandle {
        self.primitive(PrimKind::Nil)
    }

    pub fn bool_type(&mut self) -> TypeHandle {
        self.primitive(PrimKind::I1)
    }

    /// Whether values of this type are GC-managed references.
    pub fn is_reference(&self, handle: TypeHandle) -> bool {
        !matches!(self.type_of(handle), Type::Primitive(_))
    }

    /// Nominal subtyping with exact generic arguments.
    ///
    /// Primitives are subtypes only of themselves; `Nil` is a subtype of any
    /// reference-typed slot; `IntPtr` never converts. Every reference type is
    /// a subtype of `Object`.
    pub fn subtype_of(&self, a: TypeHandle, b: TypeHandle) -> bool {
        if a == b {
            return true;
        }
        let (ta, tb) = (self.type_of(a), self.type_of(b));
        match (ta, tb) {
            (Type::Primitive(PrimKind::Nil), _) => !matches!(tb, Type::Primitive(_)),
            (Type::Primitive(_), _) | (_, Type::Primitive(_)) => false,
            (Type::Class(c), Type::Class(d)) => self.class_derives(*c, *d),
            (Type::GenericInstance(c, args), Type::GenericInstance(d, brgs)) => {
                args == brgs && self.class_derives(*c, *d)
            }
            (Type::GenericInstance(c, _), Type::Class(d)) => self.class_derives(*c, *d),
            // Closure classes are nominal implementors of block types; the
            // call site dispatches by (name, arity) either way.
            (Type::Class(_) | Type::GenericInstance(_, _), Type::Block { .. }) => true,
            // Structural reference types sit directly under Object.
            (_, Type::Class(d)) => *d == self.builtins.object,
            _ => false,
        }
    }

    fn class_derives(&self, mut c: ClassId, d: ClassId) -> bool {
        loop {
            if c == d {
                return true;
            }
            match self.classes.get(&c).and_then(|i| i.parent) {
                Some(p) => c = p,
                None => return false,
            }
        }
    }

    /// Least common supertype, where one exists.
    pub fn common_super(&mut self, a: TypeHandle, b: TypeHandle) -> Option<TypeHandle> {
        if a == b {
            return Some(a);
        }
        if self.subtype_of(a, b) {
            return Some(b);
        }
        if self.subtype_of(b, a) {
            return Some(a);
        }
        let (ca, cb) = match (self.type_of(a).clone(), self.type_of(b).clone()) {
            (Type::Class(ca), Type::Class(cb)) => (ca, cb),
            (ta, tb) if !matches!(ta, Type::Primitive(_)) && !matches!(tb, Type::Primitive(_)) => {
                let object = self.builtins.object;
                return Some(self.class_type(object));
            }
            _ => return None,
        };
        // Walk a's chain; first ancestor that also covers b wins.
        let mut cur = Some(ca);
        while let Some(c) = cur {
            if self.class_derives(cb, c) {
                return Some(self.class_type(c));
            }
            cur = self.classes.get(&c).and_then(|i| i.parent);
        }
        let object = self.builtins.object;
        Some(self.class_type(object))
    }

    /// Record the layout the resolver computed for a class.
    pub fn set_layout(&mut self, id: ClassId, layout: LayoutDescriptor) {
        self.layouts.insert(id, layout);
    }

    pub fn layout_of(&self, id: ClassId) -> Result<&LayoutDescriptor, TypeError> {
        self.layouts.get(&id).ok_or(TypeError::MissingLayout(id))
    }

    /// Byte size of a value of this type when stored in a field slot.
    pub fn slot_size(&self, handle: TypeHandle) -> u32 {
        match self.type_of(handle) {
            Type::Primitive(k) => k.size_of(),
            _ => self.target.pointer_size,
        }
    }

    /// Alignment of a field slot of this type.
    pub fn slot_align(&self, handle: TypeHandle) -> u32 {
        self.slot_size(handle).max(1)
    }

    /// Lay out a flattened field list according to the class's layout kind.
    ///
    /// For `Object` the offsets include the header; the reference map is
    /// relative to the object base so the collector can use it directly.
    pub fn compute_layout(
        &self,
        kind: LayoutKind,
        fields: &[(Symbol, TypeHandle)],
    ) -> LayoutDescriptor {
        let mut out = Vec::with_capacity(fields.len());
        let mut ref_offsets = Vec::new();
        let mut offset: u32 = match kind {
            LayoutKind::Object => OBJECT_HEADER_SIZE,
            _ => 0,
        };
        let mut max_align: u32 = 1;
        let mut max_size: u32 = 0;

        for &(name, ty) in fields {
            let size = self.slot_size(ty);
            let align = match kind {
                LayoutKind::Packed => 1,
                _ => self.slot_align(ty),
            };
            max_align = max_align.max(align);
            let field_offset = match kind {
                LayoutKind::Union => 0,
                _ => {
                    offset = align_to(offset, align);
                    let o = offset;
                    offset += size;
                    o
                }
            };
            max_size = max_size.max(size);
            let is_reference = self.is_reference(ty);
            if is_reference {
                ref_offsets.push(field_offset);
            }
            out.push(LayoutField {
                name,
                ty,
                offset: field_offset,
                is_reference,
            });
        }

        let (size, align) = match kind {
            LayoutKind::Union => (max_size, max_align),
            LayoutKind::Packed => (offset, 1),
            _ => (align_to(offset, max_align), max_align),
        };
        // A union overlays reference and raw fields; it is never scanned.
        if kind == LayoutKind::Union {
            ref_offsets.clear();
        } else {
            ref_offsets.sort_unstable();
            ref_offsets.dedup();
        }
        LayoutDescriptor {
            kind,
            size,
            align,
            fields: out,
            ref_offsets,
        }
    }

    /// Human-readable type name, for the dump and for diagnostics.
    pub fn display(&self, handle: TypeHandle, arena: &StringArena) -> String {
        match self.type_of(handle) {
            Type::Primitive(PrimKind::I1) => "i1".into(),
            Type::Primitive(PrimKind::I8) => "i8".into(),
            Type::Primitive(PrimKind::I32) => "i32".into(),
            Type::Primitive(PrimKind::I64) => "i64".into(),
            Type::Primitive(PrimKind::F32) => "f32".into(),
            Type::Primitive(PrimKind::F64) => "f64".into(),
            Type::Primitive(PrimKind::Nil) => "nil".into(),
            Type::Primitive(PrimKind::IntPtr) => "intptr".into(),
            Type::Class(id) => self.class_name(*id, arena),
            Type::TypeParam(i) => format!("T{i}"),
            Type::GenericInstance(id, args) => {
                let args: Vec<String> = args.iter().map(|a| self.display(*a, arena)).collect();
                format!("{}<{}>", self.class_name(*id, arena), args.join(", "))
            }
            Type::Function { params, ret, .. } => {
                let params: Vec<String> = params.iter().map(|p| self.display(*p, arena)).collect();
                format!("fn({}) -> {}", params.join(", "), self.display(*ret, arena))
            }
            Type::Array(elem) => format!("Array<{}>", self.display(*elem, arena)),
            Type::Hash(k, v) => {
                format!("Hash<{}, {}>", self.display(*k, arena), self.display(*v, arena))
            }
            Type::Range => "Range".into(),
            Type::Tuple(elems) => {
                let elems: Vec<String> = elems.iter().map(|e| self.display(*e, arena)).collect();
                format!("({})", elems.join(", "))
            }
            Type::Block { params, ret } => {
                let params: Vec<String> = params.iter().map(|p| self.display(*p, arena)).collect();
                format!("block({}) -> {}", params.join(", "), self.display(*ret, arena))
            }
            Type::Channel(t) => format!("Channel<{}>", self.display(*t, arena)),
            Type::Future(t) => format!("Future<{}>", self.display(*t, arena)),
        }
    }

    fn class_name(&self, id: ClassId, arena: &StringArena) -> String {
        match self.classes.get(&id) {
            Some(info) => arena.resolve(info.name).to_string(),
            None => format!("class#{}", id.0),
        }
    }
}

/// Target word facts. The middle end only distinguishes pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLayout {
    pub pointer_size: u32,
    pub pointer_align: u32,
}

impl TargetLayout {
    pub fn host() -> Self {
        Self {
            pointer_size: std::mem::size_of::<*const ()>() as u32,
            pointer_align: std::mem::align_of::<*const ()>() as u32,
        }
    }
}

fn align_to(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (StringArena, TypeContext) {
        let mut arena = StringArena::new();
        let ctx = TypeContext::new(&mut arena);
        (arena, ctx)
    }

    #[test]
    fn test_interning_is_canonical() {
        let (_, mut ctx) = ctx();
        let a = ctx.primitive(PrimKind::I32);
        let b = ctx.primitive(PrimKind::I32);
        let c = ctx.primitive(PrimKind::I64);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let arr1 = ctx.intern(Type::Array(a));
        let arr2 = ctx.intern(Type::Array(b));
        assert_eq!(arr1, arr2);
    }

    #[test]
    fn test_nominal_subtyping() {
        let (mut arena, mut ctx) = ctx();
        let animal = arena.intern("Animal");
        let dog = arena.intern("Dog");
        let animal = ctx.register_class(animal, None, LayoutKind::Object, 0);
        let dog = ctx.register_class(dog, Some(animal), LayoutKind::Object, 0);

        let animal_ty = ctx.class_type(animal);
        let dog_ty = ctx.class_type(dog);
        assert!(ctx.subtype_of(dog_ty, animal_ty));
        assert!(!ctx.subtype_of(animal_ty, dog_ty));

        let object = ctx.builtins().object;
        let object_ty = ctx.class_type(object);
        assert!(ctx.subtype_of(dog_ty, object_ty));
    }

    #[test]
    fn test_primitives_are_not_subtypes() {
        let (_, mut ctx) = ctx();
        let i32_ty = ctx.primitive(PrimKind::I32);
        let i64_ty = ctx.primitive(PrimKind::I64);
        let intptr = ctx.primitive(PrimKind::IntPtr);
        let object = ctx.builtins().object;
        let object_ty = ctx.class_type(object);

        assert!(ctx.subtype_of(i32_ty, i32_ty));
        assert!(!ctx.subtype_of(i32_ty, i64_ty));
        assert!(!ctx.subtype_of(intptr, i64_ty));
        assert!(!ctx.subtype_of(intptr, object_ty));
    }

    #[test]
    fn test_nil_is_subtype_of_references() {
        let (_, mut ctx) = ctx();
        let nil = ctx.nil_type();
        let string = ctx.string_type();
        let i32_ty = ctx.primitive(PrimKind::I32);
        let arr = ctx.intern(Type::Array(i32_ty));

        assert!(ctx.subtype_of(nil, string));
        assert!(ctx.subtype_of(nil, arr));
        assert!(!ctx.subtype_of(nil, i32_ty));
    }

    #[test]
    fn test_generic_arguments_are_exact() {
        let (mut arena, mut ctx) = ctx();
        let name = arena.intern("Pair");
        let pair = ctx.register_class(name, None, LayoutKind::Object, 2);
        let i32_ty = ctx.primitive(PrimKind::I32);
        let string = ctx.string_type();

        let pair_ii = ctx.intern(Type::GenericInstance(pair, vec![i32_ty, i32_ty]));
        let pair_is = ctx.intern(Type::GenericInstance(pair, vec![i32_ty, string]));
        assert!(ctx.subtype_of(pair_ii, pair_ii));
        assert!(!ctx.subtype_of(pair_ii, pair_is));
    }

    #[test]
    fn test_common_super_walks_chains() {
        let (mut arena, mut ctx) = ctx();
        let a = arena.intern("Animal");
        let d = arena.intern("Dog");
        let c = arena.intern("Cat");
        let animal = ctx.register_class(a, None, LayoutKind::Object, 0);
        let dog = ctx.register_class(d, Some(animal), LayoutKind::Object, 0);
        let cat = ctx.register_class(c, Some(animal), LayoutKind::Object, 0);

        let dog_ty = ctx.class_type(dog);
        let cat_ty = ctx.class_type(cat);
        let animal_ty = ctx.class_type(animal);
        assert_eq!(ctx.common_super(dog_ty, cat_ty), Some(animal_ty));
    }

    #[test]
    fn test_object_layout_has_header() {
        let (mut arena, mut ctx) = ctx();
        let x = arena.intern("x");
        let s = arena.intern("s");
        let f64_ty = ctx.primitive(PrimKind::F64);
        let string = ctx.string_type();

        let layout = ctx.compute_layout(LayoutKind::Object, &[(x, f64_ty), (s, string)]);
        assert_eq!(layout.fields[0].offset, OBJECT_HEADER_SIZE);
        assert_eq!(layout.fields[1].offset, OBJECT_HEADER_SIZE + 8);
        assert_eq!(layout.ref_offsets, vec![OBJECT_HEADER_SIZE + 8]);
        assert_eq!(layout.size, OBJECT_HEADER_SIZE + 16);
    }

    #[test]
    fn test_packed_layout_is_dense() {
        let (mut arena, mut ctx) = ctx();
        let a = arena.intern("a");
        let b = arena.intern("b");
        let i8_ty = ctx.primitive(PrimKind::I8);
        let i64_ty = ctx.primitive(PrimKind::I64);

        let layout = ctx.compute_layout(LayoutKind::Packed, &[(a, i8_ty), (b, i64_ty)]);
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 1);
        assert_eq!(layout.size, 9);
        assert_eq!(layout.align, 1);
    }

    #[test]
    fn test_union_layout_overlays() {
        let (mut arena, mut ctx) = ctx();
        let a = arena.intern("a");
        let b = arena.intern("b");
        let i32_ty = ctx.primitive(PrimKind::I32);
        let f64_ty = ctx.primitive(PrimKind::F64);

        let layout = ctx.compute_layout(LayoutKind::Union, &[(a, i32_ty), (b, f64_ty)]);
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 0);
        assert_eq!(layout.size, 8);
        assert!(layout.ref_offsets.is_empty());
    }

    #[test]
    fn test_intptr_is_not_scanned() {
        let (mut arena, mut ctx) = ctx();
        let p = arena.intern("p");
        let intptr = ctx.primitive(PrimKind::IntPtr);
        let layout = ctx.compute_layout(LayoutKind::Object, &[(p, intptr)]);
        assert!(layout.ref_offsets.is_empty());
    }
}
