//! # Low IR
//!
//! The conventional machine-level SSA representation handed to the external
//! native backend as an in-memory structure. Types are machine types only;
//! the object model survives as byte offsets, runtime calls, descriptor
//! constants, and safe-point markers.
//!
//! Conventions the backend relies on:
//! - object header: word 0 = class-descriptor pointer, word 1 = GC mark/age
//!   bits (16 bytes total);
//! - class-descriptor constant layout: word 0 = class id, word 1 = parent
//!   descriptor pointer, word 2 = v-table length, words 3.. = v-table
//!   function pointers (so the v-table base is byte offset 24);
//! - array layout: header, then length (i64) at offset 16, then elements at
//!   offset 24;
//! - range layout: header, lo (i64) at 16, hi (i64) at 24;
//! - incoming parameters are registers `0..params.len()` in the entry block.

use crate::anvil::{CmpPred, FunctionId};
use crate::runtime_abi::RuntimeFn;
use ember_typed_ast::ClassId;
use serde::{Deserialize, Serialize};

/// Byte offset of the v-table inside a class-descriptor constant.
pub const VTABLE_BASE_OFFSET: i32 = 24;
/// Byte offset of an array's length word.
pub const ARRAY_LEN_OFFSET: i32 = 16;
/// Byte offset of an array's first element.
pub const ARRAY_DATA_OFFSET: i32 = 24;
/// Byte offsets of a range's bounds.
pub const RANGE_LO_OFFSET: i32 = 16;
pub const RANGE_HI_OFFSET: i32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    I1,
    I8,
    I32,
    I64,
    F32,
    F64,
    Ptr,
}

impl MachineType {
    pub fn size(self) -> u32 {
        match self {
            MachineType::I1 | MachineType::I8 => 1,
            MachineType::I32 | MachineType::F32 => 4,
            MachineType::I64 | MachineType::F64 | MachineType::Ptr => 8,
        }
    }

    /// Element-kind code used by `array_new` / `hash_new`.
    pub fn kind_code(self) -> i64 {
        match self {
            MachineType::I1 => 0,
            MachineType::I8 => 1,
            MachineType::I32 => 2,
            MachineType::I64 => 3,
            MachineType::F32 => 4,
            MachineType::F64 => 5,
            MachineType::Ptr => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LowReg(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LowBlockId(pub u32);

/// Index into the module constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstRef(pub u32);

/// Module-level constants with stable addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LowConst {
    /// Interned string object.
    String { bytes: String },
    /// Class descriptor: identity, layout, scanning map, dispatch tables.
    ClassDescriptor {
        class: ClassId,
        name: String,
        parent: Option<ClassId>,
        size: u32,
        align: u32,
        /// Offsets the collector scans.
        ref_offsets: Vec<u32>,
        vtable: Vec<FunctionId>,
        /// (name, arity, function) rows for interface-like lookup.
        methods: Vec<(String, u8, FunctionId)>,
    },
    /// Monomorphic inline-cache slot for one interface-like call site.
    InlineCache,
    /// Function-pointer slot the runtime fills when binding a NativeLibrary.
    NativeSlot { class: ClassId, link_name: String },
    /// Per-platform library paths of a NativeLibrary class.
    NativeLibrary { class: ClassId, paths: Vec<(String, String)> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowConvert {
    /// Signed int -> float.
    SiToFp,
    /// Float -> signed int, truncating.
    FpToSi,
    /// i32 -> i64, sign-extending.
    Sext,
    /// f32 -> f64.
    Fpext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafePointKind {
    Prologue,
    LoopBackEdge,
    CallSite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LowInst {
    IConst { dst: LowReg, ty: MachineType, value: i64 },
    FConst { dst: LowReg, ty: MachineType, value: f64 },
    Binary { op: LowBinOp, ty: MachineType, dst: LowReg, lhs: LowReg, rhs: LowReg },
    Cmp { pred: CmpPred, ty: MachineType, dst: LowReg, lhs: LowReg, rhs: LowReg },
    Neg { dst: LowReg, ty: MachineType, src: LowReg },
    Move { dst: LowReg, ty: MachineType, src: LowReg },
    Convert { kind: LowConvert, dst: LowReg, src: LowReg },
    /// Memory load at `addr + offset`.
    Load { dst: LowReg, ty: MachineType, addr: LowReg, offset: i32 },
    Store { ty: MachineType, addr: LowReg, offset: i32, value: LowReg },
    /// Stack-slot access (Anvil locals).
    SlotLoad { dst: LowReg, ty: MachineType, slot: u32 },
    SlotStore { ty: MachineType, slot: u32, value: LowReg },
    AddrOfConst { dst: LowReg, constant: ConstRef },
    /// Address of a function, for method-handle constants.
    FuncAddr { dst: LowReg, function: FunctionId },
    Call { dst: Option<LowReg>, function: FunctionId, args: Vec<LowReg> },
    CallRuntime { dst: Option<LowReg>, func: RuntimeFn, args: Vec<LowReg> },
    CallIndirect { dst: Option<LowReg>, ptr: LowReg, args: Vec<LowReg>, ret: Option<MachineType> },
    /// First instruction of an exception dispatcher: the in-flight object.
    LandingPad { dst: LowReg },
    SafePoint { kind: SafePointKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowPhi {
    pub dst: LowReg,
    pub ty: MachineType,
    pub incoming: Vec<(LowBlockId, LowReg)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LowTerm {
    Ret(Option<LowReg>),
    Jump(LowBlockId),
    CondJump { cond: LowReg, then_blk: LowBlockId, else_blk: LowBlockId },
    Switch { value: LowReg, cases: Vec<(i64, LowBlockId)>, default: LowBlockId },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LowBlock {
    pub phis: Vec<LowPhi>,
    pub insts: Vec<LowInst>,
    pub term: Option<LowTerm>,
}

/// One protected range and its dispatcher, for the backend's unwind tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowTryRegion {
    pub blocks: Vec<LowBlockId>,
    pub dispatcher: LowBlockId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowFunction {
    pub id: FunctionId,
    pub name: String,
    pub params: Vec<MachineType>,
    pub ret: Option<MachineType>,
    /// Stack slots (Anvil locals plus the exception spill slot).
    pub slots: Vec<MachineType>,
    pub blocks: Vec<LowBlock>,
    pub try_regions: Vec<LowTryRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LowModule {
    pub functions: Vec<LowFunction>,
    pub constants: Vec<LowConst>,
    pub entry: Option<FunctionId>,
}

impl LowModule {
    pub fn add_const(&mut self, c: LowConst) -> ConstRef {
        // Strings and descriptors are interned; cache slots are per site.
        if !matches!(c, LowConst::InlineCache) {
            if let Some(i) = self.constants.iter().position(|x| *x == c) {
                return ConstRef(i as u32);
            }
        }
        let idx = self.constants.len() as u32;
        self.constants.push(c);
        ConstRef(idx)
    }

    pub fn function(&self, id: FunctionId) -> Option<&LowFunction> {
        self.functions.iter().find(|f| f.id == id)
    }
}
