//! # Anvil → Low IR Lowering
//!
//! Mechanical, opcode-directed. Layouts become byte offsets, dispatch
//! becomes header loads and indirect calls, allocation and exceptions
//! become runtime calls, suspension points become state stores plus
//! returns. Anything that reaches this pass has been verified; an
//! unsupported combination here is a compiler bug.

use crate::anvil::{self, AnvilFunction, AnvilModule, BlockId, Op, RegId, Terminator};
use crate::lowir::*;
use crate::runtime_abi::RuntimeFn;
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{
    ClassId, LayoutKind, PrimKind, StringArena, Type, TypeContext, TypeHandle,
};
use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Lower a verified Anvil module to LowIR.
pub fn lower_module(
    anvil: &AnvilModule,
    types: &TypeContext,
    arena: &StringArena,
) -> CompilerResult<LowModule> {
    let mut low = LowModule {
        entry: anvil.entry,
        ..Default::default()
    };

    // Interned strings first: the pool order gives them stable addresses.
    let mut string_refs = Vec::with_capacity(anvil.strings.len());
    for sym in &anvil.strings {
        let r = low.add_const(LowConst::String {
            bytes: arena.resolve(*sym).to_string(),
        });
        string_refs.push(r);
    }

    // Class descriptors, v-tables included.
    let mut class_refs: HashMap<ClassId, ConstRef> = HashMap::new();
    for desc in anvil.classes.values() {
        let layout = types.layout_of(desc.id)?;
        let methods = desc
            .methods
            .iter()
            .filter_map(|((name, arity), m)| {
                m.function
                    .map(|f| (arena.resolve(*name).to_string(), *arity, f))
            })
            .collect();
        let r = low.add_const(LowConst::ClassDescriptor {
            class: desc.id,
            name: arena.resolve(desc.name).to_string(),
            parent: desc.parent,
            size: layout.size,
            align: layout.align,
            ref_offsets: layout.ref_offsets.clone(),
            vtable: desc.vtable.iter().map(|e| e.function).collect(),
            methods,
        });
        class_refs.insert(desc.id, r);
    }

    // FFI bindings: library paths plus one fillable slot per symbol.
    let mut native_slots: HashMap<(ClassId, ember_typed_ast::Symbol), ConstRef> = HashMap::new();
    for desc in anvil.classes.values() {
        if let Some(ffi) = &desc.ffi {
            low.add_const(LowConst::NativeLibrary {
                class: desc.id,
                paths: ffi
                    .paths
                    .iter()
                    .map(|(p, s)| (format!("{p:?}"), arena.resolve(*s).to_string()))
                    .collect(),
            });
            for sym in &ffi.symbols {
                let r = low.add_const(LowConst::NativeSlot {
                    class: desc.id,
                    link_name: arena.resolve(sym.link_name).to_string(),
                });
                native_slots.insert((desc.id, sym.method), r);
            }
        }
    }

    let ctx = ModuleCtx {
        anvil,
        types,
        arena,
        string_refs,
        class_refs,
        native_slots,
    };
    for func in anvil.functions_ordered() {
        log::trace!("lowering function @{} to LowIR", func.id.0);
        let lowered = FuncLowerer::new(&ctx, &mut low, func).run()?;
        low.functions.push(lowered);
    }
    log::debug!(
        "LowIR: {} functions, {} constants",
        low.functions.len(),
        low.constants.len()
    );
    Ok(low)
}

struct ModuleCtx<'a> {
    anvil: &'a AnvilModule,
    types: &'a TypeContext,
    arena: &'a StringArena,
    string_refs: Vec<ConstRef>,
    class_refs: HashMap<ClassId, ConstRef>,
    native_slots: HashMap<(ClassId, ember_typed_ast::Symbol), ConstRef>,
}

impl<'a> ModuleCtx<'a> {
    fn machine_type(&self, ty: TypeHandle) -> MachineType {
        match self.types.type_of(ty) {
            Type::Primitive(PrimKind::I1) => MachineType::I1,
            Type::Primitive(PrimKind::I8) => MachineType::I8,
            Type::Primitive(PrimKind::I32) => MachineType::I32,
            Type::Primitive(PrimKind::I64) => MachineType::I64,
            Type::Primitive(PrimKind::F32) => MachineType::F32,
            Type::Primitive(PrimKind::F64) => MachineType::F64,
            Type::Primitive(PrimKind::IntPtr) => MachineType::I64,
            // References and nil-typed slots are object pointers.
            _ => MachineType::Ptr,
        }
    }

    fn is_nil(&self, ty: TypeHandle) -> bool {
        matches!(self.types.type_of(ty), Type::Primitive(PrimKind::Nil))
    }

    fn class_ref(&self, class: ClassId) -> CompilerResult<ConstRef> {
        self.class_refs
            .get(&class)
            .copied()
            .ok_or_else(|| CompilerError::Lowering {
                message: format!("no descriptor constant for class {}", class.0),
                span: None,
            })
    }

    fn field_offset(&self, class: ClassId, slot: u16) -> CompilerResult<(u32, TypeHandle)> {
        let desc = self
            .anvil
            .class(class)
            .ok_or_else(|| CompilerError::Lowering {
                message: "field access on unknown class".into(),
                span: None,
            })?;
        let field = &desc.fields[slot as usize];
        Ok((field.offset, field.ty))
    }
}

struct FuncLowerer<'a, 'm> {
    ctx: &'a ModuleCtx<'a>,
    low: &'m mut LowModule,
    func: &'a AnvilFunction,
    out: LowFunction,
    /// LowReg of each Anvil register (offset by the incoming-param regs).
    reg_base: u32,
    next_reg: u32,
    cur: usize,
    /// Low blocks produced for each Anvil block (first is the jump target,
    /// last is where its terminator lands).
    spans: Vec<(usize, usize)>,
    /// Pending phis: (block, dst, ty, (anvil pred, reg)).
    pending_phis: Vec<(usize, LowReg, MachineType, Vec<(BlockId, LowReg)>)>,
    exc_slot: u32,
    /// Back edges of the Anvil CFG, for safe-point markers.
    back_edges: Vec<(BlockId, BlockId)>,
}

impl<'a, 'm> FuncLowerer<'a, 'm> {
    fn new(ctx: &'a ModuleCtx<'a>, low: &'m mut LowModule, func: &'a AnvilFunction) -> Self {
        let params: Vec<MachineType> = func.params.iter().map(|p| ctx.machine_type(*p)).collect();
        let ret = if ctx.is_nil(func.ret) {
            None
        } else {
            Some(ctx.machine_type(func.ret))
        };
        let mut slots: Vec<MachineType> =
            func.locals.iter().map(|l| ctx.machine_type(l.ty)).collect();
        let exc_slot = slots.len() as u32;
        slots.push(MachineType::Ptr);

        let nparams = params.len() as u32;
        let nregs = func.reg_types.len() as u32;
        let blocks = vec![LowBlock::default(); func.blocks.len()];

        FuncLowerer {
            ctx,
            low,
            func,
            out: LowFunction {
                id: func.id,
                name: String::new(),
                params,
                ret,
                slots,
                blocks,
                try_regions: Vec::new(),
            },
            reg_base: nparams,
            next_reg: nparams + nregs,
            cur: 0,
            spans: (0..func.blocks.len()).map(|i| (i, i)).collect(),
            pending_phis: Vec::new(),
            exc_slot,
            back_edges: Vec::new(),
        }
    }

    fn reg(&self, r: RegId) -> LowReg {
        LowReg(self.reg_base + r.0)
    }

    fn tmp(&mut self) -> LowReg {
        let r = LowReg(self.next_reg);
        self.next_reg += 1;
        r
    }

    fn reg_mt(&self, r: RegId) -> MachineType {
        self.ctx.machine_type(self.func.reg_type(r))
    }

    fn push(&mut self, inst: LowInst) {
        self.out.blocks[self.cur].insts.push(inst);
    }

    fn term(&mut self, t: LowTerm) {
        if self.out.blocks[self.cur].term.is_none() {
            self.out.blocks[self.cur].term = Some(t);
        }
    }

    /// Start a fresh low block and make it current (used for mid-opcode
    /// splits; the span of the Anvil block being translated grows).
    fn split(&mut self, anvil_block: BlockId) -> LowBlockId {
        let id = self.out.blocks.len();
        self.out.blocks.push(LowBlock::default());
        self.spans[anvil_block.index()].1 = id;
        LowBlockId(id as u32)
    }

    /// An appended block that does not belong to any Anvil block (traps,
    /// dispatchers).
    fn aux_block(&mut self) -> LowBlockId {
        let id = self.out.blocks.len();
        self.out.blocks.push(LowBlock::default());
        LowBlockId(id as u32)
    }

    fn switch_to(&mut self, block: LowBlockId) {
        self.cur = block.0 as usize;
    }

    fn iconst(&mut self, ty: MachineType, value: i64) -> LowReg {
        let dst = self.tmp();
        self.push(LowInst::IConst { dst, ty, value });
        dst
    }

    fn addr_of(&mut self, constant: ConstRef) -> LowReg {
        let dst = self.tmp();
        self.push(LowInst::AddrOfConst { dst, constant });
        dst
    }

    fn load(&mut self, ty: MachineType, addr: LowReg, offset: i32) -> LowReg {
        let dst = self.tmp();
        self.push(LowInst::Load { dst, ty, addr, offset });
        dst
    }

    /// Construct a runtime error object and raise it.
    fn trap_block(&mut self, class: ClassId) -> CompilerResult<LowBlockId> {
        let blk = self.aux_block();
        let saved = self.cur;
        self.switch_to(blk);
        let desc = self.ctx.class_ref(class)?;
        let d = self.addr_of(desc);
        let obj = self.tmp();
        self.push(LowInst::CallRuntime {
            dst: Some(obj),
            func: RuntimeFn::GcAlloc,
            args: vec![d],
        });
        self.push(LowInst::CallRuntime {
            dst: None,
            func: RuntimeFn::Throw,
            args: vec![obj],
        });
        self.term(LowTerm::Unreachable);
        self.cur = saved;
        Ok(blk)
    }

    fn null_check(&mut self, anvil_block: BlockId, obj: LowReg) -> CompilerResult<()> {
        let nre = self.ctx.types.builtins().null_reference_error;
        let trap = self.trap_block(nre)?;
        let zero = self.iconst(MachineType::Ptr, 0);
        let is_nil = self.tmp();
        self.push(LowInst::Cmp {
            pred: anvil::CmpPred::Eq,
            ty: MachineType::Ptr,
            dst: is_nil,
            lhs: obj,
            rhs: zero,
        });
        let cont = self.split(anvil_block);
        self.term(LowTerm::CondJump {
            cond: is_nil,
            then_blk: trap,
            else_blk: cont,
        });
        self.switch_to(cont);
        Ok(())
    }

    fn run(mut self) -> CompilerResult<LowFunction> {
        self.out.name = self.ctx.arena.resolve(self.func.name).to_string();
        self.compute_back_edges();

        for i in 0..self.func.blocks.len() {
            let bid = BlockId(i as u32);
            self.cur = self.spans[i].0;

            if i == 0 {
                // Prologue: safe point, then park incoming params in their
                // slots.
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::Prologue,
                });
                for (p, ty) in self.out.params.clone().iter().enumerate() {
                    self.push(LowInst::SlotStore {
                        ty: *ty,
                        slot: p as u32,
                        value: LowReg(p as u32),
                    });
                }
            }

            let block = &self.func.blocks[i];
            for phi in &block.phis {
                let dst = self.reg(phi.dst);
                let ty = self.ctx.machine_type(phi.ty);
                let incoming = phi
                    .incoming
                    .iter()
                    .map(|(b, r)| (*b, self.reg(*r)))
                    .collect();
                self.pending_phis.push((self.spans[i].0, dst, ty, incoming));
            }
            for op in &block.ops {
                self.lower_op(bid, op)?;
            }
            let term = block
                .terminator
                .as_ref()
                .expect("verified function has terminators");
            self.lower_terminator(bid, term)?;
        }

        self.wire_phis();
        self.lower_regions()?;
        Ok(self.out)
    }

    fn compute_back_edges(&mut self) {
        let mut graph = DiGraph::<BlockId, ()>::new();
        let nodes: Vec<NodeIndex> = (0..self.func.blocks.len())
            .map(|i| graph.add_node(BlockId(i as u32)))
            .collect();
        for (i, block) in self.func.blocks.iter().enumerate() {
            if let Some(t) = &block.terminator {
                for succ in t.successors() {
                    graph.add_edge(nodes[i], nodes[succ.index()], ());
                }
            }
        }
        let doms = dominators::simple_fast(&graph, nodes[0]);
        for (i, block) in self.func.blocks.iter().enumerate() {
            if let Some(t) = &block.terminator {
                for succ in t.successors() {
                    // An edge to a dominator is a loop back edge.
                    let mut cur = Some(nodes[i]);
                    while let Some(n) = cur {
                        if n == nodes[succ.index()] {
                            self.back_edges.push((BlockId(i as u32), succ));
                            break;
                        }
                        cur = doms.immediate_dominator(n);
                    }
                }
            }
        }
    }

    /// Phi incoming edges must name the *final* low block of each Anvil
    /// predecessor, which is only known after translation.
    fn wire_phis(&mut self) {
        let pending = std::mem::take(&mut self.pending_phis);
        for (block, dst, ty, incoming) in pending {
            let incoming = incoming
                .into_iter()
                .map(|(pred, r)| (LowBlockId(self.spans[pred.index()].1 as u32), r))
                .collect();
            self.out.blocks[block].phis.push(LowPhi { dst, ty, incoming });
        }
    }

    /// Landing-pad dispatchers: compare the thrown class against each catch
    /// type in listed order, falling through to a re-raise.
    fn lower_regions(&mut self) -> CompilerResult<()> {
        for region in &self.func.try_regions.clone() {
            let dispatcher = self.aux_block();
            self.switch_to(dispatcher);
            let exc = self.tmp();
            self.push(LowInst::LandingPad { dst: exc });
            self.push(LowInst::SlotStore {
                ty: MachineType::Ptr,
                slot: self.exc_slot,
                value: exc,
            });
            for catch in &region.catches {
                let class = match self.ctx.types.type_of(catch.ty) {
                    Type::Class(c) => *c,
                    _ => {
                        return Err(CompilerError::Lowering {
                            message: "catch type is not a class".into(),
                            span: None,
                        })
                    }
                };
                let desc = self.ctx.class_ref(class)?;
                let d = self.addr_of(desc);
                let hit = self.tmp();
                self.push(LowInst::CallRuntime {
                    dst: Some(hit),
                    func: RuntimeFn::IsInstance,
                    args: vec![exc, d],
                });
                let next = self.aux_block();
                let handler = LowBlockId(self.spans[catch.handler.index()].0 as u32);
                self.term(LowTerm::CondJump {
                    cond: hit,
                    then_blk: handler,
                    else_blk: next,
                });
                self.switch_to(next);
            }
            self.push(LowInst::CallRuntime {
                dst: None,
                func: RuntimeFn::Rethrow,
                args: vec![],
            });
            self.term(LowTerm::Unreachable);

            // Every low block derived from a protected Anvil block is
            // covered.
            let mut blocks = Vec::new();
            for b in &region.blocks {
                let (first, last) = self.spans[b.index()];
                blocks.push(LowBlockId(first as u32));
                if last != first {
                    for extra in (first + 1)..=last {
                        blocks.push(LowBlockId(extra as u32));
                    }
                }
            }
            self.out.try_regions.push(LowTryRegion {
                blocks,
                dispatcher,
            });
        }
        Ok(())
    }

    fn int_op(&mut self, op: LowBinOp, dst: RegId, lhs: RegId, rhs: RegId) {
        let ty = self.reg_mt(dst);
        let (dst, lhs, rhs) = (self.reg(dst), self.reg(lhs), self.reg(rhs));
        self.push(LowInst::Binary { op, ty, dst, lhs, rhs });
    }

    fn lower_op(&mut self, bid: BlockId, op: &Op) -> CompilerResult<()> {
        use Op::*;
        match op {
            LoadLocal { dst, local } => {
                let ty = self.reg_mt(*dst);
                let dst = self.reg(*dst);
                self.push(LowInst::SlotLoad {
                    dst,
                    ty,
                    slot: local.0,
                });
            }
            StoreLocal { local, src } => {
                let ty = self.reg_mt(*src);
                let value = self.reg(*src);
                self.push(LowInst::SlotStore {
                    ty,
                    slot: local.0,
                    value,
                });
            }
            ConstInt { dst, value, .. } => {
                let ty = self.reg_mt(*dst);
                let dst = self.reg(*dst);
                self.push(LowInst::IConst { dst, ty, value: *value });
            }
            ConstFloat { dst, value } => {
                let dst = self.reg(*dst);
                self.push(LowInst::FConst {
                    dst,
                    ty: MachineType::F32,
                    value: *value as f64,
                });
            }
            ConstDouble { dst, value } => {
                let dst = self.reg(*dst);
                self.push(LowInst::FConst {
                    dst,
                    ty: MachineType::F64,
                    value: *value,
                });
            }
            ConstString { dst, string } => {
                let constant = self.ctx.string_refs[string.index()];
                let dst = self.reg(*dst);
                self.push(LowInst::AddrOfConst { dst, constant });
            }
            ConstNil { dst, .. } => {
                let dst = self.reg(*dst);
                self.push(LowInst::IConst {
                    dst,
                    ty: MachineType::Ptr,
                    value: 0,
                });
            }
            ConstClass { dst, class } => {
                let constant = self.ctx.class_ref(*class)?;
                let dst = self.reg(*dst);
                self.push(LowInst::AddrOfConst { dst, constant });
            }
            ConstMethod { dst, class, name, arity } => {
                let desc = self
                    .ctx
                    .anvil
                    .class(*class)
                    .and_then(|d| d.methods.get(&(*name, *arity)))
                    .and_then(|m| m.function)
                    .ok_or_else(|| CompilerError::Lowering {
                        message: "const_method names a bodyless method".into(),
                        span: None,
                    })?;
                let dst = self.reg(*dst);
                self.push(LowInst::FuncAddr { dst, function: desc });
            }

            IAdd { dst, lhs, rhs } => self.int_op(LowBinOp::Add, *dst, *lhs, *rhs),
            ISub { dst, lhs, rhs } => self.int_op(LowBinOp::Sub, *dst, *lhs, *rhs),
            IMul { dst, lhs, rhs } => self.int_op(LowBinOp::Mul, *dst, *lhs, *rhs),
            IDiv { dst, lhs, rhs } | IMod { dst, lhs, rhs } => {
                // Integer division traps into DivisionByZeroError.
                let dbz = self.ctx.types.builtins().division_by_zero_error;
                let trap = self.trap_block(dbz)?;
                let ty = self.reg_mt(*dst);
                let zero = self.iconst(ty, 0);
                let is_zero = self.tmp();
                self.push(LowInst::Cmp {
                    pred: anvil::CmpPred::Eq,
                    ty,
                    dst: is_zero,
                    lhs: self.reg(*rhs),
                    rhs: zero,
                });
                let cont = self.split(bid);
                self.term(LowTerm::CondJump {
                    cond: is_zero,
                    then_blk: trap,
                    else_blk: cont,
                });
                self.switch_to(cont);
                let op = if matches!(op, IDiv { .. }) {
                    LowBinOp::Div
                } else {
                    LowBinOp::Rem
                };
                self.int_op(op, *dst, *lhs, *rhs);
            }
            INeg { dst, src } => {
                let ty = self.reg_mt(*dst);
                let (dst, src) = (self.reg(*dst), self.reg(*src));
                self.push(LowInst::Neg { dst, ty, src });
            }
            BitAnd { dst, lhs, rhs } => self.int_op(LowBinOp::And, *dst, *lhs, *rhs),
            BitOr { dst, lhs, rhs } => self.int_op(LowBinOp::Or, *dst, *lhs, *rhs),
            BitXor { dst, lhs, rhs } => self.int_op(LowBinOp::Xor, *dst, *lhs, *rhs),
            Shl { dst, lhs, rhs } => self.int_op(LowBinOp::Shl, *dst, *lhs, *rhs),
            Shr { dst, lhs, rhs } => self.int_op(LowBinOp::Shr, *dst, *lhs, *rhs),
            ICmp { dst, pred, lhs, rhs } | FCmp { dst, pred, lhs, rhs } => {
                let ty = self.reg_mt(*lhs);
                let (dst, lhs, rhs) = (self.reg(*dst), self.reg(*lhs), self.reg(*rhs));
                self.push(LowInst::Cmp {
                    pred: *pred,
                    ty,
                    dst,
                    lhs,
                    rhs,
                });
            }
            FAdd { dst, lhs, rhs } => self.int_op(LowBinOp::FAdd, *dst, *lhs, *rhs),
            FSub { dst, lhs, rhs } => self.int_op(LowBinOp::FSub, *dst, *lhs, *rhs),
            FMul { dst, lhs, rhs } => self.int_op(LowBinOp::FMul, *dst, *lhs, *rhs),
            FDiv { dst, lhs, rhs } => self.int_op(LowBinOp::FDiv, *dst, *lhs, *rhs),
            FNeg { dst, src } => {
                let ty = self.reg_mt(*dst);
                let (dst, src) = (self.reg(*dst), self.reg(*src));
                self.push(LowInst::Neg { dst, ty, src });
            }

            IntToFloat { dst, src } => self.convert(LowConvert::SiToFp, *dst, *src),
            FloatToInt { dst, src } => self.convert(LowConvert::FpToSi, *dst, *src),
            I32ToI64 { dst, src } => self.convert(LowConvert::Sext, *dst, *src),
            F32ToF64 { dst, src } => self.convert(LowConvert::Fpext, *dst, *src),

            Box { dst, src, prim } => {
                let class = self.ctx.types.builtins().box_class(*prim)?;
                let desc = self.ctx.class_ref(class)?;
                let d = self.addr_of(desc);
                let obj = self.reg(*dst);
                self.push(LowInst::CallRuntime {
                    dst: Some(obj),
                    func: RuntimeFn::GcAlloc,
                    args: vec![d],
                });
                let (offset, fty) = self.ctx.field_offset(class, 0)?;
                self.push(LowInst::Store {
                    ty: self.ctx.machine_type(fty),
                    addr: obj,
                    offset: offset as i32,
                    value: self.reg(*src),
                });
            }
            Unbox { dst, src, class, prim: _ } => {
                let obj = self.reg(*src);
                self.null_check(bid, obj)?;
                let (offset, fty) = self.ctx.field_offset(*class, 0)?;
                let ty = self.ctx.machine_type(fty);
                let dst = self.reg(*dst);
                self.push(LowInst::Load {
                    dst,
                    ty,
                    addr: obj,
                    offset: offset as i32,
                });
            }

            New { dst, class, args } => {
                let desc = self.ctx.class_ref(*class)?;
                let d = self.addr_of(desc);
                let obj = self.reg(*dst);
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst: Some(obj),
                    func: RuntimeFn::GcAlloc,
                    args: vec![d],
                });
                // Run initialize when the class declares a matching one.
                let initializer = self.ctx.arena.get("initialize").and_then(|init| {
                    self.ctx
                        .anvil
                        .class(*class)
                        .and_then(|c| c.methods.get(&(init, args.len() as u8)))
                        .and_then(|m| m.function)
                });
                if let Some(init_fn) = initializer {
                    let mut call_args = vec![obj];
                    call_args.extend(args.iter().map(|a| self.reg(*a)));
                    self.push(LowInst::SafePoint {
                        kind: SafePointKind::CallSite,
                    });
                    self.push(LowInst::Call {
                        dst: None,
                        function: init_fn,
                        args: call_args,
                    });
                }
            }
            GetField { dst, object, class, slot }
            | LoadErased { dst, object, class, slot } => {
                let obj = self.reg(*object);
                self.null_check(bid, obj)?;
                let (offset, _) = self.ctx.field_offset(*class, *slot)?;
                // Erased slots are pointer-sized; the destination register's
                // static type decides the reinterpretation.
                let ty = self.reg_mt(*dst);
                let dst = self.reg(*dst);
                self.push(LowInst::Load {
                    dst,
                    ty,
                    addr: obj,
                    offset: offset as i32,
                });
            }
            SetField { object, class, slot, value }
            | StoreErased { object, class, slot, value } => {
                let obj = self.reg(*object);
                self.null_check(bid, obj)?;
                let (offset, fty) = self.ctx.field_offset(*class, *slot)?;
                let vty = self.reg_mt(*value);
                let v = self.reg(*value);
                self.push(LowInst::Store {
                    ty: vty,
                    addr: obj,
                    offset: offset as i32,
                    value: v,
                });
                let gc_managed = self
                    .ctx
                    .anvil
                    .class(*class)
                    .map_or(false, |d| d.layout_kind == LayoutKind::Object);
                let is_ref = self.ctx.types.is_reference(fty)
                    || matches!(self.ctx.types.type_of(fty), Type::Primitive(PrimKind::Nil));
                if gc_managed && is_ref && vty == MachineType::Ptr {
                    let off = self.iconst(MachineType::I64, offset as i64);
                    self.push(LowInst::CallRuntime {
                        dst: None,
                        func: RuntimeFn::GcWriteBarrier,
                        args: vec![obj, off, v],
                    });
                }
            }
            InstanceOf { dst, object, class } => {
                let desc = self.ctx.class_ref(*class)?;
                let d = self.addr_of(desc);
                let dst = self.reg(*dst);
                let obj = self.reg(*object);
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::IsInstance,
                    args: vec![obj, d],
                });
            }
            ClassTag { dst, object } => {
                let obj = self.reg(*object);
                self.null_check(bid, obj)?;
                let d = self.load(MachineType::Ptr, obj, 0);
                let dst = self.reg(*dst);
                self.push(LowInst::Load {
                    dst,
                    ty: MachineType::I32,
                    addr: d,
                    offset: 0,
                });
            }
            RefEq { dst, lhs, rhs } => {
                let (dst, lhs, rhs) = (self.reg(*dst), self.reg(*lhs), self.reg(*rhs));
                self.push(LowInst::Cmp {
                    pred: anvil::CmpPred::Eq,
                    ty: MachineType::Ptr,
                    dst,
                    lhs,
                    rhs,
                });
            }
            RefCast { dst, src, .. } => {
                let (dst, src) = (self.reg(*dst), self.reg(*src));
                self.push(LowInst::Move {
                    dst,
                    ty: MachineType::Ptr,
                    src,
                });
            }
            CaughtException { dst, .. } => {
                let dst = self.reg(*dst);
                self.push(LowInst::SlotLoad {
                    dst,
                    ty: MachineType::Ptr,
                    slot: self.exc_slot,
                });
            }

            CallStatic { dst, function, args } => {
                let args = args.iter().map(|a| self.reg(*a)).collect();
                let dst = dst.map(|d| self.reg(d));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::Call {
                    dst,
                    function: *function,
                    args,
                });
            }
            CallVirtual { dst, slot, args, .. } => {
                let recv = self.reg(args[0]);
                self.null_check(bid, recv)?;
                let d = self.load(MachineType::Ptr, recv, 0);
                let fptr = self.load(
                    MachineType::Ptr,
                    d,
                    VTABLE_BASE_OFFSET + (*slot as i32) * 8,
                );
                let args = args.iter().map(|a| self.reg(*a)).collect();
                let ret = dst.map(|d| self.reg_mt(d));
                let dst = dst.map(|d| self.reg(d));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallIndirect {
                    dst,
                    ptr: fptr,
                    args,
                    ret,
                });
            }
            CallInterface { dst, name, arity, args, .. } => {
                // Runtime hash lookup with a per-site monomorphic cache.
                let recv = self.reg(args[0]);
                self.null_check(bid, recv)?;
                let d = self.load(MachineType::Ptr, recv, 0);
                let name_const = self.low.add_const(LowConst::String {
                    bytes: self.ctx.arena.resolve(*name).to_string(),
                });
                let name_ptr = self.addr_of(name_const);
                let arity_reg = self.iconst(MachineType::I64, *arity as i64);
                let cache = self.low.add_const(LowConst::InlineCache);
                let cache_ptr = self.addr_of(cache);
                let fptr = self.tmp();
                self.push(LowInst::CallRuntime {
                    dst: Some(fptr),
                    func: RuntimeFn::MethodLookup,
                    args: vec![d, name_ptr, arity_reg, cache_ptr],
                });
                let args = args.iter().map(|a| self.reg(*a)).collect();
                let ret = dst.map(|d| self.reg_mt(d));
                let dst = dst.map(|d| self.reg(d));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallIndirect {
                    dst,
                    ptr: fptr,
                    args,
                    ret,
                });
            }
            CallNative { dst, class, method, args, .. } => {
                let slot_ref = self
                    .ctx
                    .native_slots
                    .get(&(*class, *method))
                    .copied()
                    .ok_or_else(|| CompilerError::Lowering {
                        message: "call_native without a bound symbol slot".into(),
                        span: None,
                    })?;
                let slot_addr = self.addr_of(slot_ref);
                let fptr = self.load(MachineType::Ptr, slot_addr, 0);
                let args = args.iter().map(|a| self.reg(*a)).collect();
                let ret = dst.map(|d| self.reg_mt(d));
                let dst = dst.map(|d| self.reg(d));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallIndirect {
                    dst,
                    ptr: fptr,
                    args,
                    ret,
                });
            }

            NewCell { dst, ty } => {
                let b = self.ctx.types.builtins();
                let class = if self.ctx.types.is_reference(*ty) {
                    b.cell
                } else {
                    b.raw_cell
                };
                let desc = self.ctx.class_ref(class)?;
                let d = self.addr_of(desc);
                let dst = self.reg(*dst);
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::GcAlloc,
                    args: vec![d],
                });
            }
            CellGet { dst, cell, .. } => {
                let b = self.ctx.types.builtins();
                let (offset, _) = self.ctx.field_offset(b.cell, 0)?;
                let ty = self.reg_mt(*dst);
                let (dst, cell) = (self.reg(*dst), self.reg(*cell));
                self.push(LowInst::Load {
                    dst,
                    ty,
                    addr: cell,
                    offset: offset as i32,
                });
            }
            CellSet { cell, value } => {
                let b = self.ctx.types.builtins();
                let (offset, _) = self.ctx.field_offset(b.cell, 0)?;
                let ty = self.reg_mt(*value);
                let (cell, v) = (self.reg(*cell), self.reg(*value));
                self.push(LowInst::Store {
                    ty,
                    addr: cell,
                    offset: offset as i32,
                    value: v,
                });
                if ty == MachineType::Ptr {
                    let off = self.iconst(MachineType::I64, offset as i64);
                    self.push(LowInst::CallRuntime {
                        dst: None,
                        func: RuntimeFn::GcWriteBarrier,
                        args: vec![cell, off, v],
                    });
                }
            }

            ArrayNew { dst, elem, len } => {
                let kind = self.ctx.machine_type(*elem).kind_code();
                let kind = self.iconst(MachineType::I64, kind);
                let (dst, len) = (self.reg(*dst), self.reg(*len));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::ArrayNew,
                    args: vec![kind, len],
                });
            }
            ArrayLen { dst, array } => {
                let arr = self.reg(*array);
                self.null_check(bid, arr)?;
                let dst = self.reg(*dst);
                self.push(LowInst::Load {
                    dst,
                    ty: MachineType::I64,
                    addr: arr,
                    offset: ARRAY_LEN_OFFSET,
                });
            }
            ArrayGet { dst, array, index } => {
                let arr = self.reg(*array);
                self.null_check(bid, arr)?;
                let idx = self.bounds_checked_index(bid, arr, *index)?;
                let ty = self.reg_mt(*dst);
                let addr = self.element_address(arr, idx, ty);
                let dst = self.reg(*dst);
                self.push(LowInst::Load {
                    dst,
                    ty,
                    addr,
                    offset: ARRAY_DATA_OFFSET,
                });
            }
            ArraySet { array, index, value } => {
                let arr = self.reg(*array);
                self.null_check(bid, arr)?;
                let idx = self.bounds_checked_index(bid, arr, *index)?;
                let ty = self.reg_mt(*value);
                let addr = self.element_address(arr, idx, ty);
                let v = self.reg(*value);
                self.push(LowInst::Store {
                    ty,
                    addr,
                    offset: ARRAY_DATA_OFFSET,
                    value: v,
                });
                if ty == MachineType::Ptr {
                    // Barrier offset is relative to the array object.
                    let size = self.iconst(MachineType::I64, ty.size() as i64);
                    let scaled = self.tmp();
                    self.push(LowInst::Binary {
                        op: LowBinOp::Mul,
                        ty: MachineType::I64,
                        dst: scaled,
                        lhs: idx,
                        rhs: size,
                    });
                    let data = self.iconst(MachineType::I64, ARRAY_DATA_OFFSET as i64);
                    let rel = self.tmp();
                    self.push(LowInst::Binary {
                        op: LowBinOp::Add,
                        ty: MachineType::I64,
                        dst: rel,
                        lhs: scaled,
                        rhs: data,
                    });
                    self.push(LowInst::CallRuntime {
                        dst: None,
                        func: RuntimeFn::GcWriteBarrier,
                        args: vec![arr, rel, v],
                    });
                }
            }

            HashNew { dst, key, value } => {
                let k = self.ctx.machine_type(*key).kind_code();
                let v = self.ctx.machine_type(*value).kind_code();
                let k = self.iconst(MachineType::I64, k);
                let v = self.iconst(MachineType::I64, v);
                let dst = self.reg(*dst);
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::HashNew,
                    args: vec![k, v],
                });
            }
            HashLen { dst, hash } => {
                let (dst, hash) = (self.reg(*dst), self.reg(*hash));
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::HashLen,
                    args: vec![hash],
                });
            }
            HashGet { dst, hash, key } => {
                let (dst, hash, key) = (self.reg(*dst), self.reg(*hash), self.reg(*key));
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::HashGet,
                    args: vec![hash, key],
                });
            }
            HashSet { hash, key, value } => {
                let (hash, key, value) = (self.reg(*hash), self.reg(*key), self.reg(*value));
                self.push(LowInst::CallRuntime {
                    dst: None,
                    func: RuntimeFn::HashSet,
                    args: vec![hash, key, value],
                });
            }
            RangeNew { dst, lo, hi } => {
                let (dst, lo, hi) = (self.reg(*dst), self.reg(*lo), self.reg(*hi));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::RangeNew,
                    args: vec![lo, hi],
                });
            }
            RangeLo { dst, range } => {
                let (dst, range) = (self.reg(*dst), self.reg(*range));
                self.push(LowInst::Load {
                    dst,
                    ty: MachineType::I64,
                    addr: range,
                    offset: RANGE_LO_OFFSET,
                });
            }
            RangeHi { dst, range } => {
                let (dst, range) = (self.reg(*dst), self.reg(*range));
                self.push(LowInst::Load {
                    dst,
                    ty: MachineType::I64,
                    addr: range,
                    offset: RANGE_HI_OFFSET,
                });
            }

            StringConcat { dst, lhs, rhs } => {
                let (dst, lhs, rhs) = (self.reg(*dst), self.reg(*lhs), self.reg(*rhs));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst: Some(dst),
                    func: RuntimeFn::StringConcat,
                    args: vec![lhs, rhs],
                });
            }
            CallIntrinsic { dst, intrinsic, args } => {
                let args = args.iter().map(|a| self.reg(*a)).collect();
                let dst = dst.map(|d| self.reg(d));
                self.push(LowInst::SafePoint {
                    kind: SafePointKind::CallSite,
                });
                self.push(LowInst::CallRuntime {
                    dst,
                    func: intrinsic.runtime_fn(),
                    args,
                });
            }
        }
        Ok(())
    }

    fn convert(&mut self, kind: LowConvert, dst: RegId, src: RegId) {
        let (dst, src) = (self.reg(dst), self.reg(src));
        self.push(LowInst::Convert { kind, dst, src });
    }

    /// Bounds check against the length word; traps IndexOutOfBoundsError.
    fn bounds_checked_index(
        &mut self,
        bid: BlockId,
        arr: LowReg,
        index: RegId,
    ) -> CompilerResult<LowReg> {
        let ioob = self.ctx.types.builtins().index_out_of_bounds_error;
        let trap = self.trap_block(ioob)?;
        let idx = self.reg(index);
        let len = self.load(MachineType::I64, arr, ARRAY_LEN_OFFSET);
        let zero = self.iconst(MachineType::I64, 0);
        let neg = self.tmp();
        self.push(LowInst::Cmp {
            pred: anvil::CmpPred::Lt,
            ty: MachineType::I64,
            dst: neg,
            lhs: idx,
            rhs: zero,
        });
        let over = self.tmp();
        self.push(LowInst::Cmp {
            pred: anvil::CmpPred::Ge,
            ty: MachineType::I64,
            dst: over,
            lhs: idx,
            rhs: len,
        });
        let bad = self.tmp();
        self.push(LowInst::Binary {
            op: LowBinOp::Or,
            ty: MachineType::I1,
            dst: bad,
            lhs: neg,
            rhs: over,
        });
        let cont = self.split(bid);
        self.term(LowTerm::CondJump {
            cond: bad,
            then_blk: trap,
            else_blk: cont,
        });
        self.switch_to(cont);
        Ok(idx)
    }

    /// `base + index * elem_size`; the data offset rides on the access.
    fn element_address(&mut self, arr: LowReg, idx: LowReg, elem: MachineType) -> LowReg {
        let size = self.iconst(MachineType::I64, elem.size() as i64);
        let scaled = self.tmp();
        self.push(LowInst::Binary {
            op: LowBinOp::Mul,
            ty: MachineType::I64,
            dst: scaled,
            lhs: idx,
            rhs: size,
        });
        let addr = self.tmp();
        self.push(LowInst::Binary {
            op: LowBinOp::Add,
            ty: MachineType::Ptr,
            dst: addr,
            lhs: arr,
            rhs: scaled,
        });
        addr
    }

    fn lower_terminator(&mut self, bid: BlockId, term: &Terminator) -> CompilerResult<()> {
        // Loop back edges carry a safe point so the collector can interrupt
        // hot loops.
        if self.back_edges.iter().any(|(from, _)| *from == bid) {
            self.push(LowInst::SafePoint {
                kind: SafePointKind::LoopBackEdge,
            });
        }
        let target = |b: &BlockId, spans: &[(usize, usize)]| LowBlockId(spans[b.index()].0 as u32);
        match term {
            Terminator::Ret { value } => {
                let value = value.map(|v| self.reg(v));
                self.term(LowTerm::Ret(value));
            }
            Terminator::Jump { target: t } => {
                let t = target(t, &self.spans);
                self.term(LowTerm::Jump(t));
            }
            Terminator::CondJump { cond, then_blk, else_blk } => {
                let cond = self.reg(*cond);
                let then_blk = target(then_blk, &self.spans);
                let else_blk = target(else_blk, &self.spans);
                self.term(LowTerm::CondJump {
                    cond,
                    then_blk,
                    else_blk,
                });
            }
            Terminator::Switch { value, cases, default } => {
                let value = self.reg(*value);
                let cases = cases
                    .iter()
                    .map(|(v, b)| (*v, target(b, &self.spans)))
                    .collect();
                let default = target(default, &self.spans);
                self.term(LowTerm::Switch {
                    value,
                    cases,
                    default,
                });
            }
            Terminator::Throw { value } => {
                let value = self.reg(*value);
                self.push(LowInst::CallRuntime {
                    dst: None,
                    func: RuntimeFn::Throw,
                    args: vec![value],
                });
                self.term(LowTerm::Unreachable);
            }
            // Generator suspension: the yielded value is next()'s return.
            Terminator::YieldSuspend { value, .. } => {
                let value = self.reg(*value);
                self.term(LowTerm::Ret(Some(value)));
            }
            // Async suspension: hand the continuation to the runtime and
            // give the thread back.
            Terminator::AwaitSuspend { future, .. } => {
                let this = self.tmp();
                self.push(LowInst::SlotLoad {
                    dst: this,
                    ty: MachineType::Ptr,
                    slot: 0,
                });
                let fut = self.reg(*future);
                self.push(LowInst::CallRuntime {
                    dst: None,
                    func: RuntimeFn::FutureRegisterContinuation,
                    args: vec![fut, this],
                });
                self.term(LowTerm::Ret(None));
            }
        }
        Ok(())
    }
}
