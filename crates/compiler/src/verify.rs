//! # Anvil Verifier
//!
//! Mandatory gate between the AST lowering and the LowIR lowering. Anything
//! that fails here is a compiler bug, reported with the function id and
//! block label it was found in.
//!
//! Enforced rules:
//! - typed SSA discipline: one definition per register, every use dominated
//!   by its definition, operand types consistent with the register table;
//! - terminator well-formedness: exactly one per block, in-range targets;
//! - try regions form a properly nested forest and every `throw` inside a
//!   region is covered by a catch list;
//! - `await_suspend`/`yield_suspend` only in async/generator functions;
//! - virtual calls go through a class that owns the slot; FFI calls target
//!   NativeLibrary classes only.

use crate::anvil::*;
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{PrimKind, Type, TypeContext};
use petgraph::algo::dominators::{self, Dominators};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Verify every function of a module.
pub fn verify_module(module: &AnvilModule, types: &TypeContext) -> CompilerResult<()> {
    for func in module.functions.values() {
        verify_function(module, func, types)?;
    }
    Ok(())
}

/// Verify one function.
pub fn verify_function(
    module: &AnvilModule,
    func: &AnvilFunction,
    types: &TypeContext,
) -> CompilerResult<()> {
    let v = Verifier {
        module,
        func,
        types,
    };
    v.run()
}

struct Verifier<'a> {
    module: &'a AnvilModule,
    func: &'a AnvilFunction,
    types: &'a TypeContext,
}

impl<'a> Verifier<'a> {
    fn fail(&self, block: Option<BlockId>, message: impl Into<String>) -> CompilerError {
        CompilerError::Internal {
            function: self.func.id,
            block,
            message: message.into(),
        }
    }

    fn run(&self) -> CompilerResult<()> {
        if self.func.blocks.is_empty() {
            return Err(self.fail(None, "function has no blocks"));
        }
        self.check_terminators()?;
        let defs = self.check_register_discipline()?;
        self.check_dominance(&defs)?;
        self.check_op_types()?;
        self.check_regions()?;
        self.check_suspends()?;
        Ok(())
    }

    fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.func.blocks.len() as u32).map(BlockId)
    }

    fn check_terminators(&self) -> CompilerResult<()> {
        let nblocks = self.func.blocks.len() as u32;
        for bid in self.block_ids() {
            let block = self.func.block(bid);
            let term = block
                .terminator
                .as_ref()
                .ok_or_else(|| self.fail(Some(bid), "block has no terminator"))?;
            for succ in term.successors() {
                if succ.0 >= nblocks {
                    return Err(self.fail(Some(bid), format!("terminator targets missing block {}", succ.0)));
                }
            }
            if let Terminator::Switch { cases, .. } = term {
                let mut seen = HashSet::new();
                for (value, _) in cases {
                    if !seen.insert(*value) {
                        return Err(self.fail(Some(bid), format!("duplicate switch case {value}")));
                    }
                }
            }
        }
        Ok(())
    }

    /// One definition per register; every use refers to a defined register.
    /// Returns the definition site of each register.
    fn check_register_discipline(&self) -> CompilerResult<HashMap<RegId, (BlockId, usize)>> {
        let nregs = self.func.reg_types.len() as u32;
        let mut defs: HashMap<RegId, (BlockId, usize)> = HashMap::new();

        for bid in self.block_ids() {
            let block = self.func.block(bid);
            // Phis define at position 0, before every op of the block.
            for phi in &block.phis {
                if phi.dst.0 >= nregs {
                    return Err(self.fail(Some(bid), format!("phi defines unknown register r{}", phi.dst.0)));
                }
                if defs.insert(phi.dst, (bid, 0)).is_some() {
                    return Err(self.fail(Some(bid), format!("register r{} defined twice", phi.dst.0)));
                }
                if phi.ty != self.func.reg_type(phi.dst) {
                    return Err(self.fail(Some(bid), format!("phi type mismatch on r{}", phi.dst.0)));
                }
            }
            for (i, op) in block.ops.iter().enumerate() {
                if let Some(dst) = op.dst() {
                    if dst.0 >= nregs {
                        return Err(self.fail(Some(bid), format!("op defines unknown register r{}", dst.0)));
                    }
                    if defs.insert(dst, (bid, i + 1)).is_some() {
                        return Err(self.fail(Some(bid), format!("register r{} defined twice", dst.0)));
                    }
                }
            }
        }

        // Every use must name a defined register.
        let mut check_use = |bid: BlockId, reg: RegId| -> CompilerResult<()> {
            if !defs.contains_key(&reg) {
                return Err(self.fail(Some(bid), format!("use of undefined register r{}", reg.0)));
            }
            Ok(())
        };
        for bid in self.block_ids() {
            let block = self.func.block(bid);
            for phi in &block.phis {
                for (_, reg) in &phi.incoming {
                    check_use(bid, *reg)?;
                }
            }
            for op in &block.ops {
                let mut err = None;
                op.for_each_use(|reg| {
                    if err.is_none() {
                        err = check_use(bid, reg).err();
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
            if let Some(term) = &block.terminator {
                let mut err = None;
                term.for_each_use(|reg| {
                    if err.is_none() {
                        err = check_use(bid, reg).err();
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }
        Ok(defs)
    }

    fn cfg(&self) -> (DiGraph<BlockId, ()>, Vec<NodeIndex>) {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.block_ids().map(|b| graph.add_node(b)).collect();
        for bid in self.block_ids() {
            if let Some(term) = &self.func.block(bid).terminator {
                for succ in term.successors() {
                    graph.add_edge(nodes[bid.index()], nodes[succ.index()], ());
                }
            }
        }
        (graph, nodes)
    }

    /// Classical dominance: every use is dominated by its definition.
    fn check_dominance(&self, defs: &HashMap<RegId, (BlockId, usize)>) -> CompilerResult<()> {
        let (graph, nodes) = self.cfg();
        let doms: Dominators<NodeIndex> = dominators::simple_fast(&graph, nodes[0]);

        let dominates = |a: BlockId, b: BlockId| -> bool {
            // Unreachable blocks have no dominator info; treat the entry as
            // dominating nothing there so stale code is flagged.
            let mut cur = Some(nodes[b.index()]);
            while let Some(n) = cur {
                if n == nodes[a.index()] {
                    return true;
                }
                cur = doms.immediate_dominator(n);
            }
            false
        };

        let check = |bid: BlockId, position: usize, reg: RegId| -> CompilerResult<()> {
            let (def_block, def_pos) = defs[&reg];
            let ok = if def_block == bid {
                def_pos <= position
            } else {
                dominates(def_block, bid)
            };
            if ok {
                Ok(())
            } else {
                Err(self.fail(
                    Some(bid),
                    format!("use of r{} is not dominated by its definition", reg.0),
                ))
            }
        };

        for bid in self.block_ids() {
            let block = self.func.block(bid);
            // A phi's incoming value must dominate the predecessor edge, not
            // the phi block itself.
            for phi in &block.phis {
                for (pred, reg) in &phi.incoming {
                    let (def_block, _) = defs[reg];
                    if def_block != *pred && !dominates(def_block, *pred) {
                        return Err(self.fail(
                            Some(bid),
                            format!("phi operand r{} does not dominate edge from block {}", reg.0, pred.0),
                        ));
                    }
                }
            }
            for (i, op) in block.ops.iter().enumerate() {
                let mut err = None;
                op.for_each_use(|reg| {
                    if err.is_none() {
                        err = check(bid, i + 1, reg).err();
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
            if let Some(term) = &block.terminator {
                let mut err = None;
                let end = block.ops.len() + 1;
                term.for_each_use(|reg| {
                    if err.is_none() {
                        err = check(bid, end, reg).err();
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn is_prim(&self, reg: RegId, kinds: &[PrimKind]) -> bool {
        match self.types.type_of(self.func.reg_type(reg)) {
            Type::Primitive(k) => kinds.contains(k),
            _ => false,
        }
    }

    fn is_integer(&self, reg: RegId) -> bool {
        self.is_prim(reg, &[PrimKind::I1, PrimKind::I8, PrimKind::I32, PrimKind::I64, PrimKind::IntPtr])
    }

    fn is_float(&self, reg: RegId) -> bool {
        self.is_prim(reg, &[PrimKind::F32, PrimKind::F64])
    }

    fn is_bool(&self, reg: RegId) -> bool {
        self.is_prim(reg, &[PrimKind::I1])
    }

    fn receiver_class(&self, reg: RegId) -> Option<ember_typed_ast::ClassId> {
        match self.types.type_of(self.func.reg_type(reg)) {
            Type::Class(c) | Type::GenericInstance(c, _) => Some(*c),
            _ => None,
        }
    }

    fn class_derives(&self, mut c: ember_typed_ast::ClassId, d: ember_typed_ast::ClassId) -> bool {
        loop {
            if c == d {
                return true;
            }
            match self.module.classes.get(&c).and_then(|desc| desc.parent) {
                Some(p) => c = p,
                None => return false,
            }
        }
    }

    /// Per-opcode type preservation checks.
    fn check_op_types(&self) -> CompilerResult<()> {
        for bid in self.block_ids() {
            let block = self.func.block(bid);
            for op in &block.ops {
                self.check_op(bid, op)?;
            }
            if let Some(term) = &block.terminator {
                self.check_terminator_types(bid, term)?;
            }
        }
        Ok(())
    }

    fn check_op(&self, bid: BlockId, op: &Op) -> CompilerResult<()> {
        use Op::*;
        let same = |a: RegId, b: RegId| self.func.reg_type(a) == self.func.reg_type(b);
        match op {
            IAdd { dst, lhs, rhs }
            | ISub { dst, lhs, rhs }
            | IMul { dst, lhs, rhs }
            | IDiv { dst, lhs, rhs }
            | IMod { dst, lhs, rhs }
            | BitAnd { dst, lhs, rhs }
            | BitOr { dst, lhs, rhs }
            | BitXor { dst, lhs, rhs }
            | Shl { dst, lhs, rhs }
            | Shr { dst, lhs, rhs } => {
                if !self.is_integer(*lhs) || !same(*lhs, *rhs) || !same(*lhs, *dst) {
                    return Err(self.fail(Some(bid), "integer arithmetic over mismatched types"));
                }
            }
            INeg { dst, src } => {
                if !self.is_integer(*src) || !same(*src, *dst) {
                    return Err(self.fail(Some(bid), "ineg over non-integer"));
                }
            }
            ICmp { dst, lhs, rhs, .. } => {
                if !self.is_integer(*lhs) || !same(*lhs, *rhs) || !self.is_bool(*dst) {
                    return Err(self.fail(Some(bid), "icmp operands must be same integer type, result i1"));
                }
            }
            FAdd { dst, lhs, rhs }
            | FSub { dst, lhs, rhs }
            | FMul { dst, lhs, rhs }
            | FDiv { dst, lhs, rhs } => {
                if !self.is_float(*lhs) || !same(*lhs, *rhs) || !same(*lhs, *dst) {
                    return Err(self.fail(Some(bid), "float arithmetic over mismatched types"));
                }
            }
            FNeg { dst, src } => {
                if !self.is_float(*src) || !same(*src, *dst) {
                    return Err(self.fail(Some(bid), "fneg over non-float"));
                }
            }
            FCmp { dst, lhs, rhs, .. } => {
                if !self.is_float(*lhs) || !same(*lhs, *rhs) || !self.is_bool(*dst) {
                    return Err(self.fail(Some(bid), "fcmp operands must be same float type, result i1"));
                }
            }
            IntToFloat { dst, src } => {
                if !self.is_integer(*src) || !self.is_float(*dst) {
                    return Err(self.fail(Some(bid), "i_to_f expects integer source, float result"));
                }
            }
            FloatToInt { dst, src } => {
                if !self.is_float(*src) || !self.is_integer(*dst) {
                    return Err(self.fail(Some(bid), "f_to_i expects float source, integer result"));
                }
            }
            I32ToI64 { dst, src } => {
                if !self.is_prim(*src, &[PrimKind::I32]) || !self.is_prim(*dst, &[PrimKind::I64]) {
                    return Err(self.fail(Some(bid), "i32_to_i64 operand kinds"));
                }
            }
            F32ToF64 { dst, src } => {
                if !self.is_prim(*src, &[PrimKind::F32]) || !self.is_prim(*dst, &[PrimKind::F64]) {
                    return Err(self.fail(Some(bid), "f32_to_f64 operand kinds"));
                }
            }
            Box { src, prim, .. } => {
                if !self.is_prim(*src, &[*prim]) {
                    return Err(self.fail(Some(bid), "box source does not match primitive kind"));
                }
            }
            Unbox { dst, prim, .. } => {
                if !self.is_prim(*dst, &[*prim]) {
                    return Err(self.fail(Some(bid), "unbox result does not match primitive kind"));
                }
            }
            LoadLocal { dst, local } => {
                let lty = self
                    .func
                    .locals
                    .get(local.index())
                    .ok_or_else(|| self.fail(Some(bid), format!("load of missing local {}", local.0)))?
                    .ty;
                if self.func.reg_type(*dst) != lty {
                    return Err(self.fail(Some(bid), "load_local type mismatch"));
                }
            }
            StoreLocal { local, src } => {
                let lty = self
                    .func
                    .locals
                    .get(local.index())
                    .ok_or_else(|| self.fail(Some(bid), format!("store to missing local {}", local.0)))?
                    .ty;
                if !self.types.subtype_of(self.func.reg_type(*src), lty) {
                    return Err(self.fail(Some(bid), "store_local type mismatch"));
                }
            }
            GetField { dst, object, class, slot } | LoadErased { dst, object, class, slot } => {
                let desc = self
                    .module
                    .classes
                    .get(class)
                    .ok_or_else(|| self.fail(Some(bid), "field access on unknown class"))?;
                let field = desc
                    .fields
                    .get(*slot as usize)
                    .ok_or_else(|| self.fail(Some(bid), "field slot out of range"))?;
                match self.receiver_class(*object) {
                    Some(c) if self.class_derives(c, *class) => {}
                    _ => return Err(self.fail(Some(bid), "field access receiver not typed to owning class")),
                }
                if matches!(op, GetField { .. }) && !field.erased && self.func.reg_type(*dst) != field.ty {
                    return Err(self.fail(Some(bid), "get_field result type mismatch"));
                }
            }
            SetField { object, class, slot, value } | StoreErased { object, class, slot, value } => {
                let desc = self
                    .module
                    .classes
                    .get(class)
                    .ok_or_else(|| self.fail(Some(bid), "field store on unknown class"))?;
                let field = desc
                    .fields
                    .get(*slot as usize)
                    .ok_or_else(|| self.fail(Some(bid), "field slot out of range"))?;
                match self.receiver_class(*object) {
                    Some(c) if self.class_derives(c, *class) => {}
                    _ => return Err(self.fail(Some(bid), "field store receiver not typed to owning class")),
                }
                if matches!(op, SetField { .. })
                    && !field.erased
                    && !self.types.subtype_of(self.func.reg_type(*value), field.ty)
                {
                    return Err(self.fail(Some(bid), "set_field value type mismatch"));
                }
            }
            New { class, .. } => {
                if !self.module.classes.contains_key(class) {
                    return Err(self.fail(Some(bid), "new of unknown class"));
                }
            }
            CallStatic { dst, function, args } => {
                let callee = self
                    .module
                    .function(*function)
                    .ok_or_else(|| self.fail(Some(bid), "call_static to unknown function"))?;
                if callee.params.len() != args.len() {
                    return Err(self.fail(Some(bid), "call_static arity mismatch"));
                }
                for (arg, param) in args.iter().zip(&callee.params) {
                    if !self.types.subtype_of(self.func.reg_type(*arg), *param) {
                        return Err(self.fail(Some(bid), "call_static argument type mismatch"));
                    }
                }
                if let Some(dst) = dst {
                    if self.func.reg_type(*dst) != callee.ret {
                        return Err(self.fail(Some(bid), "call_static result type mismatch"));
                    }
                }
            }
            CallVirtual { class, slot, args, .. } => {
                let desc = self
                    .module
                    .classes
                    .get(class)
                    .ok_or_else(|| self.fail(Some(bid), "call_virtual through unknown class"))?;
                if *slot as usize >= desc.vtable.len() {
                    return Err(self.fail(Some(bid), "call_virtual slot out of range"));
                }
                let recv = *args
                    .first()
                    .ok_or_else(|| self.fail(Some(bid), "call_virtual without receiver"))?;
                match self.receiver_class(recv) {
                    Some(c) if self.class_derives(c, *class) => {}
                    _ => {
                        return Err(self.fail(
                            Some(bid),
                            "call_virtual receiver not typed to a class owning the slot",
                        ))
                    }
                }
            }
            CallInterface { args, .. } => {
                if args.is_empty() {
                    return Err(self.fail(Some(bid), "call_interface without receiver"));
                }
            }
            CallNative { class, method, arity, .. } => {
                let desc = self
                    .module
                    .classes
                    .get(class)
                    .ok_or_else(|| self.fail(Some(bid), "call_native through unknown class"))?;
                let ffi = desc
                    .ffi
                    .as_ref()
                    .ok_or_else(|| self.fail(Some(bid), "call_native into a class that is not a NativeLibrary"))?;
                if !ffi.symbols.iter().any(|s| s.method == *method && s.arity == *arity) {
                    return Err(self.fail(Some(bid), "call_native symbol not bound by the library"));
                }
            }
            RefEq { dst, lhs, rhs } => {
                let ok = |r: RegId| {
                    self.types.is_reference(self.func.reg_type(r))
                        || self.is_prim(r, &[PrimKind::Nil])
                };
                if !ok(*lhs) || !ok(*rhs) || !self.is_bool(*dst) {
                    return Err(self.fail(Some(bid), "ref_eq over non-reference operands"));
                }
            }
            RefCast { dst, src, class } => {
                if !self.types.is_reference(self.func.reg_type(*src)) {
                    return Err(self.fail(Some(bid), "ref_cast of a non-reference"));
                }
                match self.types.type_of(self.func.reg_type(*dst)) {
                    Type::Class(c) | Type::GenericInstance(c, _) if c == class => {}
                    _ => return Err(self.fail(Some(bid), "ref_cast result not typed to target class")),
                }
            }
            CaughtException { .. } => {
                let is_handler = self
                    .func
                    .try_regions
                    .iter()
                    .any(|r| r.catches.iter().any(|c| c.handler == bid));
                if !is_handler {
                    return Err(self.fail(Some(bid), "caught_exception outside a handler block"));
                }
            }
            ArrayGet { array, index, .. } | ArraySet { array, index, .. } => {
                if !matches!(self.types.type_of(self.func.reg_type(*array)), Type::Array(_)) {
                    return Err(self.fail(Some(bid), "array op over non-array"));
                }
                if !self.is_integer(*index) {
                    return Err(self.fail(Some(bid), "array index must be integer"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_terminator_types(&self, bid: BlockId, term: &Terminator) -> CompilerResult<()> {
        match term {
            Terminator::CondJump { cond, .. } => {
                if !self.is_bool(*cond) {
                    return Err(self.fail(Some(bid), "cond_jump condition must be i1"));
                }
            }
            Terminator::Switch { value, .. } => {
                if !self.is_integer(*value) {
                    return Err(self.fail(Some(bid), "switch value must be integer"));
                }
            }
            Terminator::Ret { value } => match value {
                Some(v) => {
                    if !self.types.subtype_of(self.func.reg_type(*v), self.func.ret) {
                        return Err(self.fail(Some(bid), "ret value type mismatch"));
                    }
                }
                None => {
                    if !matches!(
                        self.types.type_of(self.func.ret),
                        Type::Primitive(PrimKind::Nil)
                    ) {
                        return Err(self.fail(Some(bid), "bare ret from a value-returning function"));
                    }
                }
            },
            Terminator::Throw { value } => {
                let exc = self.types.builtins().exception;
                match self.receiver_class(*value) {
                    Some(c) if self.class_derives(c, exc) => {}
                    _ => return Err(self.fail(Some(bid), "throw of a non-exception value")),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Try regions must form a properly nested forest, and throws inside a
    /// region must have a catch list to land in.
    fn check_regions(&self) -> CompilerResult<()> {
        let nblocks = self.func.blocks.len() as u32;
        let regions = &self.func.try_regions;
        for (i, region) in regions.iter().enumerate() {
            if let Some(parent) = region.parent {
                if parent.index() >= regions.len() || parent.index() == i {
                    return Err(self.fail(None, format!("try region {i} has invalid parent")));
                }
                let parent_blocks: HashSet<BlockId> =
                    regions[parent.index()].blocks.iter().copied().collect();
                if !region.blocks.iter().all(|b| parent_blocks.contains(b)) {
                    return Err(self.fail(None, format!("try region {i} escapes its parent")));
                }
            }
            for block in &region.blocks {
                if block.0 >= nblocks {
                    return Err(self.fail(None, format!("try region {i} lists missing block {}", block.0)));
                }
            }
            for catch in &region.catches {
                if catch.handler.0 >= nblocks {
                    return Err(self.fail(None, format!("try region {i} handler out of range")));
                }
            }
        }

        // Sibling regions (neither an ancestor of the other) must not share
        // blocks.
        let ancestor = |mut a: usize, b: usize| -> bool {
            loop {
                match regions[a].parent {
                    Some(p) => {
                        if p.index() == b {
                            return true;
                        }
                        a = p.index();
                    }
                    None => return false,
                }
            }
        };
        for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                if ancestor(i, j) || ancestor(j, i) {
                    continue;
                }
                let a: HashSet<BlockId> = regions[i].blocks.iter().copied().collect();
                if regions[j].blocks.iter().any(|b| a.contains(b)) {
                    return Err(self.fail(None, format!("try regions {i} and {j} overlap without nesting")));
                }
            }
        }

        // Throws inside a region need somewhere to land.
        for bid in self.block_ids() {
            if let Some(Terminator::Throw { .. }) = self.func.block(bid).terminator {
                if let Some(region) = self.func.region_of(bid) {
                    if self.func.try_regions[region.index()].catches.is_empty() {
                        return Err(self.fail(
                            Some(bid),
                            "throw inside a try region with an empty catch list",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_suspends(&self) -> CompilerResult<()> {
        for bid in self.block_ids() {
            match self.func.block(bid).terminator {
                Some(Terminator::AwaitSuspend { .. }) if self.func.kind != FunctionKind::Async => {
                    return Err(self.fail(Some(bid), "await_suspend outside an async function"));
                }
                Some(Terminator::YieldSuspend { .. })
                    if self.func.kind != FunctionKind::Generator =>
                {
                    return Err(self.fail(Some(bid), "yield_suspend outside a generator function"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
