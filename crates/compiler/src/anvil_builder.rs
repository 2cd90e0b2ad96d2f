//! # Anvil Function Builder
//!
//! Stateful builder in the style of an IR builder: it tracks a current
//! insertion block, mints typed registers, and appends opcodes. The AST
//! lowerer drives it, and the verifier tests use it to hand-craft malformed
//! functions.

use crate::anvil::*;
use ember_typed_ast::{Span, Symbol, TypeHandle};

pub struct FunctionBuilder {
    func: AnvilFunction,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a function with an empty entry block. Parameter locals are
    /// added by the caller so their binding bookkeeping stays in one place.
    pub fn new(
        id: FunctionId,
        name: Symbol,
        params: Vec<TypeHandle>,
        ret: TypeHandle,
        kind: FunctionKind,
        span: Span,
    ) -> Self {
        let func = AnvilFunction {
            id,
            name,
            params,
            ret,
            kind,
            locals: Vec::new(),
            reg_types: Vec::new(),
            blocks: vec![Block::default()],
            try_regions: Vec::new(),
            span,
        };
        Self {
            func,
            current: BlockId(0),
        }
    }

    pub fn func(&self) -> &AnvilFunction {
        &self.func
    }

    pub fn add_local(&mut self, name: Symbol, ty: TypeHandle) -> LocalId {
        let id = LocalId(self.func.locals.len() as u32);
        self.func.locals.push(LocalSlot { name, ty });
        id
    }

    pub fn local_type(&self, local: LocalId) -> TypeHandle {
        self.func.locals[local.index()].ty
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::default());
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn is_terminated(&self) -> bool {
        self.func.blocks[self.current.index()].terminator.is_some()
    }

    /// Mint a fresh register of the given type.
    pub fn fresh_reg(&mut self, ty: TypeHandle) -> RegId {
        let id = RegId(self.func.reg_types.len() as u32);
        self.func.reg_types.push(ty);
        id
    }

    pub fn reg_type(&self, reg: RegId) -> TypeHandle {
        self.func.reg_type(reg)
    }

    /// Append an opcode to the current block. Opcodes after a terminator are
    /// unreachable by construction and silently dropped; the lowerer opens a
    /// fresh block whenever control can continue.
    pub fn push(&mut self, op: Op) {
        let block = &mut self.func.blocks[self.current.index()];
        if block.terminator.is_none() {
            block.ops.push(op);
        }
    }

    /// Set the terminator of the current block if it has none yet.
    pub fn terminate(&mut self, terminator: Terminator) {
        let block = &mut self.func.blocks[self.current.index()];
        if block.terminator.is_none() {
            block.terminator = Some(terminator);
        }
    }

    /// Force a terminator, replacing any existing one. Only the verifier
    /// corpus needs this.
    pub fn terminate_replacing(&mut self, terminator: Terminator) {
        self.func.blocks[self.current.index()].terminator = Some(terminator);
    }

    pub fn add_phi(&mut self, block: BlockId, ty: TypeHandle, incoming: Vec<(BlockId, RegId)>) -> RegId {
        let dst = self.fresh_reg(ty);
        self.func.blocks[block.index()].phis.push(Phi { dst, ty, incoming });
        dst
    }

    pub fn add_region(
        &mut self,
        parent: Option<TryRegionId>,
        blocks: Vec<BlockId>,
        catches: Vec<CatchEntry>,
    ) -> TryRegionId {
        let id = TryRegionId(self.func.try_regions.len() as u32);
        self.func.try_regions.push(TryRegion {
            parent,
            blocks,
            catches,
        });
        id
    }

    pub fn region_mut(&mut self, id: TryRegionId) -> &mut TryRegion {
        &mut self.func.try_regions[id.index()]
    }

    // ------------------------------------------------------------------
    // Convenience emitters
    // ------------------------------------------------------------------

    pub fn const_int(&mut self, value: i64, ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::ConstInt { dst, value, ty });
        dst
    }

    pub fn const_double(&mut self, value: f64, ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::ConstDouble { dst, value });
        dst
    }

    pub fn const_string(&mut self, string: StringId, ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::ConstString { dst, string });
        dst
    }

    pub fn const_nil(&mut self, ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::ConstNil { dst, ty });
        dst
    }

    pub fn load_local(&mut self, local: LocalId) -> RegId {
        let ty = self.local_type(local);
        let dst = self.fresh_reg(ty);
        self.push(Op::LoadLocal { dst, local });
        dst
    }

    pub fn store_local(&mut self, local: LocalId, src: RegId) {
        self.push(Op::StoreLocal { local, src });
    }

    /// Integer binary op; result type follows the left operand.
    pub fn int_binary(
        &mut self,
        make: impl Fn(RegId, RegId, RegId) -> Op,
        lhs: RegId,
        rhs: RegId,
    ) -> RegId {
        let ty = self.reg_type(lhs);
        let dst = self.fresh_reg(ty);
        self.push(make(dst, lhs, rhs));
        dst
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: RegId, rhs: RegId, bool_ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(bool_ty);
        self.push(Op::ICmp { dst, pred, lhs, rhs });
        dst
    }

    pub fn fcmp(&mut self, pred: CmpPred, lhs: RegId, rhs: RegId, bool_ty: TypeHandle) -> RegId {
        let dst = self.fresh_reg(bool_ty);
        self.push(Op::FCmp { dst, pred, lhs, rhs });
        dst
    }

    pub fn get_field(
        &mut self,
        object: RegId,
        class: ember_typed_ast::ClassId,
        slot: u16,
        ty: TypeHandle,
    ) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::GetField { dst, object, class, slot });
        dst
    }

    pub fn set_field(
        &mut self,
        object: RegId,
        class: ember_typed_ast::ClassId,
        slot: u16,
        value: RegId,
    ) {
        self.push(Op::SetField { object, class, slot, value });
    }

    pub fn new_object(
        &mut self,
        class: ember_typed_ast::ClassId,
        args: Vec<RegId>,
        ty: TypeHandle,
    ) -> RegId {
        let dst = self.fresh_reg(ty);
        self.push(Op::New { dst, class, args });
        dst
    }

    pub fn call_virtual(
        &mut self,
        class: ember_typed_ast::ClassId,
        slot: u16,
        args: Vec<RegId>,
        ret: Option<TypeHandle>,
    ) -> Option<RegId> {
        let dst = ret.map(|ty| self.fresh_reg(ty));
        self.push(Op::CallVirtual { dst, class, slot, args });
        dst
    }

    pub fn call_static(
        &mut self,
        function: FunctionId,
        args: Vec<RegId>,
        ret: Option<TypeHandle>,
    ) -> Option<RegId> {
        let dst = ret.map(|ty| self.fresh_reg(ty));
        self.push(Op::CallStatic { dst, function, args });
        dst
    }

    pub fn call_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        args: Vec<RegId>,
        ret: Option<TypeHandle>,
    ) -> Option<RegId> {
        let dst = ret.map(|ty| self.fresh_reg(ty));
        self.push(Op::CallIntrinsic { dst, intrinsic, args });
        dst
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump { target });
    }

    pub fn cond_jump(&mut self, cond: RegId, then_blk: BlockId, else_blk: BlockId) {
        self.terminate(Terminator::CondJump { cond, then_blk, else_blk });
    }

    pub fn ret(&mut self, value: Option<RegId>) {
        self.terminate(Terminator::Ret { value });
    }

    pub fn throw(&mut self, value: RegId) {
        self.terminate(Terminator::Throw { value });
    }

    pub fn finish(self) -> AnvilFunction {
        self.func
    }
}
