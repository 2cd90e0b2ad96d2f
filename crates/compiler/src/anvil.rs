//! # Anvil, the high-level object-aware IR
//!
//! Anvil sits between the typed AST and the machine-level low IR. It is high
//! level enough to keep the object model intact (classes, v-tables, erased
//! generics, try-regions, suspension points) and low level enough that the
//! second lowering is mechanical.
//!
//! A function is a list of basic blocks over typed virtual registers in
//! SSA-like form: a register's type is fixed at its single definition and
//! every use must be dominated by that definition. Every block ends in
//! exactly one terminator.

use ember_typed_ast::{
    ClassId, LayoutKind, Platform, PrimKind, SerializationPolicy, Span, Symbol, TypeHandle,
};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Id of an Anvil function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// Basic-block id, an index into the owning function's block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Typed virtual register, an index into the function's register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegId(pub u32);

/// Local slot id, an index into the function's local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u32);

/// Interned string constant, an index into the module string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringId(pub u32);

/// Try-region id, an index into the function's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TryRegionId(pub u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl RegId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl StringId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
impl TryRegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a method is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    Static,
    Virtual,
    /// Dynamic lookup by (name, arity) through the method table.
    InterfaceLike,
    Native,
    Generator,
    Async,
}

/// Resolved method facts, owned by the class descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodHandle {
    pub owner: ClassId,
    pub name: Symbol,
    pub params: Vec<TypeHandle>,
    pub ret: TypeHandle,
    /// Body function; `None` for `@native` methods (the thunk is separate).
    pub function: Option<FunctionId>,
    pub dispatch: DispatchMode,
    pub throws: Vec<TypeHandle>,
    pub vtable_slot: Option<u16>,
}

/// One laid-out field slot. The slot index is the position in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub name: Symbol,
    pub ty: TypeHandle,
    /// Byte offset; filled when the resolver publishes the layout.
    pub offset: u32,
    pub json_key: Option<Symbol>,
    pub declared_in: ClassId,
    /// Declared with a generic parameter type; accessed through
    /// `load_erased`/`store_erased`.
    pub erased: bool,
}

/// V-table entry: the implementing class and body for one virtual slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VTableEntry {
    pub name: Symbol,
    pub arity: u8,
    pub class: ClassId,
    pub function: FunctionId,
}

/// One `@native` symbol of a NativeLibrary class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeSymbol {
    pub method: Symbol,
    pub arity: u8,
    pub link_name: Symbol,
}

/// FFI binding of a NativeLibrary class: where the shared object lives per
/// platform and which symbols get bound at module load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfiBinding {
    pub paths: Vec<(Platform, Symbol)>,
    pub symbols: Vec<NativeSymbol>,
}

/// The finished descriptor of one class: identity, layout, dispatch tables,
/// serialization policy. Children prefix-share the parent's v-table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: Symbol,
    pub parent: Option<ClassId>,
    /// Flattened fields, inherited first. Slot index = position.
    pub fields: Vec<FieldSlot>,
    pub methods: IndexMap<(Symbol, u8), MethodHandle>,
    pub vtable: Vec<VTableEntry>,
    pub layout_kind: LayoutKind,
    pub serialization: SerializationPolicy,
    pub ffi: Option<FfiBinding>,
}

impl ClassDescriptor {
    pub fn field_slot(&self, name: Symbol) -> Option<u16> {
        self.fields.iter().position(|f| f.name == name).map(|i| i as u16)
    }

    pub fn method(&self, name: Symbol, arity: u8) -> Option<&MethodHandle> {
        self.methods.get(&(name, arity))
    }
}

/// Function flavour; suspension terminators are only legal in the latter two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    Plain,
    Generator,
    Async,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSlot {
    pub name: Symbol,
    pub ty: TypeHandle,
}

/// Comparison predicate shared by integer and float compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Runtime surface reachable from source programs through built-in classes.
/// The low lowering maps each intrinsic to a runtime ABI entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intrinsic {
    Print,
    Println,
    ObjectToString,
    IntToString,
    DoubleToString,
    BoolToString,
    StringEquals,
    ChannelNew,
    ChannelSend,
    ChannelReceive,
    FutureNew,
    FutureComplete,
    FutureFail,
    FutureValue,
    ThreadSpawn,
    ReflectFields,
    ReflectGet,
    JsonParse,
    JsonHas,
    JsonGetInt,
    JsonGetDouble,
    JsonGetBool,
    JsonGetString,
    JsonEscape,
}

/// The Anvil opcode set, grouped by family. Value-producing opcodes name
/// their destination register first; register types are fixed at definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // --- locals & constants ---
    LoadLocal { dst: RegId, local: LocalId },
    StoreLocal { local: LocalId, src: RegId },
    ConstInt { dst: RegId, value: i64, ty: TypeHandle },
    ConstFloat { dst: RegId, value: f32 },
    ConstDouble { dst: RegId, value: f64 },
    ConstString { dst: RegId, string: StringId },
    ConstNil { dst: RegId, ty: TypeHandle },
    ConstClass { dst: RegId, class: ClassId },
    ConstMethod { dst: RegId, class: ClassId, name: Symbol, arity: u8 },

    // --- integer arithmetic (wrapping; division traps) ---
    IAdd { dst: RegId, lhs: RegId, rhs: RegId },
    ISub { dst: RegId, lhs: RegId, rhs: RegId },
    IMul { dst: RegId, lhs: RegId, rhs: RegId },
    /// Traps into a throwable `DivisionByZeroError` on zero divisor.
    IDiv { dst: RegId, lhs: RegId, rhs: RegId },
    IMod { dst: RegId, lhs: RegId, rhs: RegId },
    INeg { dst: RegId, src: RegId },
    BitAnd { dst: RegId, lhs: RegId, rhs: RegId },
    BitOr { dst: RegId, lhs: RegId, rhs: RegId },
    BitXor { dst: RegId, lhs: RegId, rhs: RegId },
    Shl { dst: RegId, lhs: RegId, rhs: RegId },
    Shr { dst: RegId, lhs: RegId, rhs: RegId },
    ICmp { dst: RegId, pred: CmpPred, lhs: RegId, rhs: RegId },

    // --- float arithmetic ---
    FAdd { dst: RegId, lhs: RegId, rhs: RegId },
    FSub { dst: RegId, lhs: RegId, rhs: RegId },
    FMul { dst: RegId, lhs: RegId, rhs: RegId },
    FDiv { dst: RegId, lhs: RegId, rhs: RegId },
    FNeg { dst: RegId, src: RegId },
    FCmp { dst: RegId, pred: CmpPred, lhs: RegId, rhs: RegId },

    // --- conversions (always explicit) ---
    IntToFloat { dst: RegId, src: RegId },
    /// Truncating.
    FloatToInt { dst: RegId, src: RegId },
    /// Sign-extending.
    I32ToI64 { dst: RegId, src: RegId },
    F32ToF64 { dst: RegId, src: RegId },
    Box { dst: RegId, src: RegId, prim: PrimKind },
    Unbox { dst: RegId, src: RegId, class: ClassId, prim: PrimKind },

    // --- object model ---
    /// Allocate and run `initialize` with the given arguments.
    New { dst: RegId, class: ClassId, args: Vec<RegId> },
    GetField { dst: RegId, object: RegId, class: ClassId, slot: u16 },
    /// Reference stores get a write barrier in the low lowering.
    SetField { object: RegId, class: ClassId, slot: u16, value: RegId },
    /// Read of an erased generic slot; `dst` is typed per the static site.
    LoadErased { dst: RegId, object: RegId, class: ClassId, slot: u16 },
    StoreErased { object: RegId, class: ClassId, slot: u16, value: RegId },
    InstanceOf { dst: RegId, object: RegId, class: ClassId },
    /// The class id word out of the object header.
    ClassTag { dst: RegId, object: RegId },
    /// Reference identity / nil comparison.
    RefEq { dst: RegId, lhs: RegId, rhs: RegId },
    /// Reinterpret a reference at a narrower class. Must be guarded by an
    /// `instance_of` test; lowers to a no-op move.
    RefCast { dst: RegId, src: RegId, class: ClassId },
    /// First opcode of a catch handler block: the in-flight exception.
    CaughtException { dst: RegId, ty: TypeHandle },
    CallStatic { dst: Option<RegId>, function: FunctionId, args: Vec<RegId> },
    /// Receiver is `args[0]`; `class` owns the slot.
    CallVirtual { dst: Option<RegId>, class: ClassId, slot: u16, args: Vec<RegId> },
    /// Dynamic lookup by (name, arity); receiver is `args[0]`.
    CallInterface { dst: Option<RegId>, name: Symbol, arity: u8, ret: TypeHandle, args: Vec<RegId> },
    /// Through the FFI binding of a NativeLibrary class.
    CallNative { dst: Option<RegId>, class: ClassId, method: Symbol, arity: u8, args: Vec<RegId> },

    // --- capture cells ---
    NewCell { dst: RegId, ty: TypeHandle },
    CellGet { dst: RegId, cell: RegId, ty: TypeHandle },
    CellSet { cell: RegId, value: RegId },

    // --- arrays, hashes, ranges ---
    ArrayNew { dst: RegId, elem: TypeHandle, len: RegId },
    ArrayLen { dst: RegId, array: RegId },
    /// Bounds-checked; traps into `IndexOutOfBoundsError`.
    ArrayGet { dst: RegId, array: RegId, index: RegId },
    ArraySet { array: RegId, index: RegId, value: RegId },
    HashNew { dst: RegId, key: TypeHandle, value: TypeHandle },
    HashLen { dst: RegId, hash: RegId },
    HashGet { dst: RegId, hash: RegId, key: RegId },
    HashSet { hash: RegId, key: RegId, value: RegId },
    RangeNew { dst: RegId, lo: RegId, hi: RegId },
    RangeLo { dst: RegId, range: RegId },
    RangeHi { dst: RegId, range: RegId },

    // --- strings ---
    StringConcat { dst: RegId, lhs: RegId, rhs: RegId },

    // --- runtime intrinsics ---
    CallIntrinsic { dst: Option<RegId>, intrinsic: Intrinsic, args: Vec<RegId> },
}

impl Op {
    /// The register this opcode defines, if any.
    pub fn dst(&self) -> Option<RegId> {
        use Op::*;
        match self {
            LoadLocal { dst, .. }
            | ConstInt { dst, .. }
            | ConstFloat { dst, .. }
            | ConstDouble { dst, .. }
            | ConstString { dst, .. }
            | ConstNil { dst, .. }
            | ConstClass { dst, .. }
            | ConstMethod { dst, .. }
            | IAdd { dst, .. }
            | ISub { dst, .. }
            | IMul { dst, .. }
            | IDiv { dst, .. }
            | IMod { dst, .. }
            | INeg { dst, .. }
            | BitAnd { dst, .. }
            | BitOr { dst, .. }
            | BitXor { dst, .. }
            | Shl { dst, .. }
            | Shr { dst, .. }
            | ICmp { dst, .. }
            | FAdd { dst, .. }
            | FSub { dst, .. }
            | FMul { dst, .. }
            | FDiv { dst, .. }
            | FNeg { dst, .. }
            | FCmp { dst, .. }
            | IntToFloat { dst, .. }
            | FloatToInt { dst, .. }
            | I32ToI64 { dst, .. }
            | F32ToF64 { dst, .. }
            | Box { dst, .. }
            | Unbox { dst, .. }
            | New { dst, .. }
            | GetField { dst, .. }
            | LoadErased { dst, .. }
            | InstanceOf { dst, .. }
            | ClassTag { dst, .. }
            | RefEq { dst, .. }
            | RefCast { dst, .. }
            | CaughtException { dst, .. }
            | NewCell { dst, .. }
            | CellGet { dst, .. }
            | ArrayNew { dst, .. }
            | ArrayLen { dst, .. }
            | ArrayGet { dst, .. }
            | HashNew { dst, .. }
            | HashLen { dst, .. }
            | HashGet { dst, .. }
            | RangeNew { dst, .. }
            | RangeLo { dst, .. }
            | RangeHi { dst, .. }
            | StringConcat { dst, .. } => Some(*dst),
            CallStatic { dst, .. }
            | CallVirtual { dst, .. }
            | CallInterface { dst, .. }
            | CallNative { dst, .. }
            | CallIntrinsic { dst, .. } => *dst,
            StoreLocal { .. }
            | SetField { .. }
            | StoreErased { .. }
            | CellSet { .. }
            | ArraySet { .. }
            | HashSet { .. } => None,
        }
    }

    /// Visit every register this opcode reads.
    pub fn for_each_use(&self, mut f: impl FnMut(RegId)) {
        use Op::*;
        match self {
            LoadLocal { .. }
            | ConstInt { .. }
            | ConstFloat { .. }
            | ConstDouble { .. }
            | ConstString { .. }
            | ConstNil { .. }
            | ConstClass { .. }
            | ConstMethod { .. }
            | CaughtException { .. }
            | NewCell { .. } => {}
            StoreLocal { src, .. } => f(*src),
            IAdd { lhs, rhs, .. }
            | ISub { lhs, rhs, .. }
            | IMul { lhs, rhs, .. }
            | IDiv { lhs, rhs, .. }
            | IMod { lhs, rhs, .. }
            | BitAnd { lhs, rhs, .. }
            | BitOr { lhs, rhs, .. }
            | BitXor { lhs, rhs, .. }
            | Shl { lhs, rhs, .. }
            | Shr { lhs, rhs, .. }
            | ICmp { lhs, rhs, .. }
            | FAdd { lhs, rhs, .. }
            | FSub { lhs, rhs, .. }
            | FMul { lhs, rhs, .. }
            | FDiv { lhs, rhs, .. }
            | FCmp { lhs, rhs, .. }
            | StringConcat { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            INeg { src, .. }
            | FNeg { src, .. }
            | IntToFloat { src, .. }
            | FloatToInt { src, .. }
            | I32ToI64 { src, .. }
            | F32ToF64 { src, .. }
            | Box { src, .. }
            | Unbox { src, .. } => f(*src),
            New { args, .. } => args.iter().copied().for_each(f),
            GetField { object, .. } | LoadErased { object, .. } => f(*object),
            SetField { object, value, .. } | StoreErased { object, value, .. } => {
                f(*object);
                f(*value);
            }
            InstanceOf { object, .. } | ClassTag { object, .. } => f(*object),
            RefEq { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            RefCast { src, .. } => f(*src),
            CallStatic { args, .. }
            | CallVirtual { args, .. }
            | CallInterface { args, .. }
            | CallNative { args, .. }
            | CallIntrinsic { args, .. } => args.iter().copied().for_each(f),
            CellGet { cell, .. } => f(*cell),
            CellSet { cell, value } => {
                f(*cell);
                f(*value);
            }
            ArrayNew { len, .. } => f(*len),
            ArrayLen { array, .. } => f(*array),
            ArrayGet { array, index, .. } => {
                f(*array);
                f(*index);
            }
            ArraySet { array, index, value } => {
                f(*array);
                f(*index);
                f(*value);
            }
            HashNew { .. } => {}
            HashLen { hash, .. } => f(*hash),
            HashGet { hash, key, .. } => {
                f(*hash);
                f(*key);
            }
            HashSet { hash, key, value } => {
                f(*hash);
                f(*key);
                f(*value);
            }
            RangeNew { lo, hi, .. } => {
                f(*lo);
                f(*hi);
            }
            RangeLo { range, .. } | RangeHi { range, .. } => f(*range),
        }
    }
}

/// Block terminators. These are the only seven ways a block may end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Ret { value: Option<RegId> },
    Jump { target: BlockId },
    CondJump { cond: RegId, then_blk: BlockId, else_blk: BlockId },
    Switch { value: RegId, cases: Vec<(i64, BlockId)>, default: BlockId },
    Throw { value: RegId },
    /// Save state `state`, register the continuation on `future`, return.
    AwaitSuspend { future: RegId, state: u32, resume: BlockId },
    /// Save state `state`, return `value` from `next()`.
    YieldSuspend { value: RegId, state: u32, resume: BlockId },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret { .. } | Terminator::Throw { .. } => vec![],
            Terminator::Jump { target } => vec![*target],
            Terminator::CondJump { then_blk, else_blk, .. } => vec![*then_blk, *else_blk],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            // Resumption re-enters through the state dispatch, not an edge,
            // but the resume block is still reachable code.
            Terminator::AwaitSuspend { resume, .. } | Terminator::YieldSuspend { resume, .. } => {
                vec![*resume]
            }
        }
    }

    pub fn for_each_use(&self, mut f: impl FnMut(RegId)) {
        match self {
            Terminator::Ret { value: Some(v) } => f(*v),
            Terminator::Ret { value: None } => {}
            Terminator::Jump { .. } => {}
            Terminator::CondJump { cond, .. } => f(*cond),
            Terminator::Switch { value, .. } => f(*value),
            Terminator::Throw { value } => f(*value),
            Terminator::AwaitSuspend { future, .. } => f(*future),
            Terminator::YieldSuspend { value, .. } => f(*value),
        }
    }
}

/// SSA phi node; incoming edges must cover the block's predecessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phi {
    pub dst: RegId,
    pub ty: TypeHandle,
    pub incoming: Vec<(BlockId, RegId)>,
}

/// A basic block: phis first, then opcodes, then the terminator. A missing
/// terminator is a malformed function the verifier rejects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Block {
    pub phis: Vec<Phi>,
    pub ops: Vec<Op>,
    pub terminator: Option<Terminator>,
}

/// One catch clause of a try region, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchEntry {
    pub ty: TypeHandle,
    pub handler: BlockId,
}

/// A try region: the protected blocks and the ordered catch list. Regions
/// form a properly nested forest through `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryRegion {
    pub parent: Option<TryRegionId>,
    pub blocks: Vec<BlockId>,
    pub catches: Vec<CatchEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnvilFunction {
    pub id: FunctionId,
    pub name: Symbol,
    pub params: Vec<TypeHandle>,
    pub ret: TypeHandle,
    pub kind: FunctionKind,
    /// Ordered typed locals; the first `params.len()` mirror the parameters.
    pub locals: Vec<LocalSlot>,
    /// Register types, fixed at definition. `RegId` indexes this table.
    pub reg_types: Vec<TypeHandle>,
    pub blocks: Vec<Block>,
    pub try_regions: Vec<TryRegion>,
    pub span: Span,
}

impl AnvilFunction {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn reg_type(&self, reg: RegId) -> TypeHandle {
        self.reg_types[reg.index()]
    }

    /// Innermost try region containing a block, if any.
    pub fn region_of(&self, block: BlockId) -> Option<TryRegionId> {
        let mut found: Option<TryRegionId> = None;
        for (i, region) in self.try_regions.iter().enumerate() {
            if region.blocks.contains(&block) {
                // Deeper regions are appended later; the last hit is innermost.
                found = Some(TryRegionId(i as u32));
            }
        }
        found
    }
}

/// The Anvil module: functions, class descriptors, and the string pool for
/// one compilation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnvilModule {
    pub name: Symbol,
    pub functions: IndexMap<FunctionId, AnvilFunction>,
    pub classes: IndexMap<ClassId, ClassDescriptor>,
    pub strings: IndexSet<Symbol>,
    /// The program entry point, when a `main` exists.
    pub entry: Option<FunctionId>,
}

impl AnvilModule {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            functions: IndexMap::new(),
            classes: IndexMap::new(),
            strings: IndexSet::new(),
            entry: None,
        }
    }

    pub fn add_function(&mut self, func: AnvilFunction) {
        self.functions.insert(func.id, func);
    }

    pub fn function(&self, id: FunctionId) -> Option<&AnvilFunction> {
        self.functions.get(&id)
    }

    pub fn add_class(&mut self, desc: ClassDescriptor) {
        self.classes.insert(desc.id, desc);
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(&id)
    }

    /// Intern a string literal into the pool.
    pub fn intern_string(&mut self, sym: Symbol) -> StringId {
        let (index, _) = self.strings.insert_full(sym);
        StringId(index as u32)
    }

    pub fn string(&self, id: StringId) -> Symbol {
        *self.strings.get_index(id.index()).expect("string id out of pool")
    }

    /// Functions in id order, for deterministic output.
    pub fn functions_ordered(&self) -> Vec<&AnvilFunction> {
        let mut out: Vec<&AnvilFunction> = self.functions.values().collect();
        out.sort_by_key(|f| f.id);
        out
    }
}
