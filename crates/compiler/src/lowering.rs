//! # AST → Anvil Lowering
//!
//! Component D: produces Anvil from the typed AST, function by function.
//! Expression lowering returns a register and leaves the builder positioned
//! in the block where evaluation ended; statements thread the current block
//! through. Synthesized functions (closure bodies, state machines, FFI
//! thunks, serialization) are queued and drained until no work remains.

use crate::anvil::*;
use crate::anvil_builder::FunctionBuilder;
use crate::resolver::{FuncKey, Resolution};
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{
    AssignTarget, BinOp, BindingId, ClassId, ConvertKind, Expr, InterpPart, LogicalOp, PrimKind,
    Span, StringArena, Symbol, Type, TypeContext, TypeHandle, TypedBody, TypedExpr, TypedFunction,
    TypedParam, TypedStmt, UnOp,
};
use std::collections::{HashMap, VecDeque};

/// Names the lowerer needs repeatedly.
pub(crate) struct WellKnown {
    pub initialize: Symbol,
    pub to_string: Symbol,
    pub has_next: Symbol,
    pub next: Symbol,
    pub resume: Symbol,
    pub call: Symbol,
    pub dispose: Symbol,
    pub disposed_flag: Symbol,
    pub to_json: Symbol,
    pub from_json: Symbol,
    pub main: Symbol,
    pub value: Symbol,
    pub print: Symbol,
    pub println: Symbol,
    pub new_: Symbol,
    pub send: Symbol,
    pub receive: Symbol,
    pub fields: Symbol,
    pub get: Symbol,
    pub spawn: Symbol,
    pub self_: Symbol,
}

impl WellKnown {
    fn new(arena: &mut StringArena) -> Self {
        Self {
            initialize: arena.intern("initialize"),
            to_string: arena.intern("to_string"),
            has_next: arena.intern("has_next"),
            next: arena.intern("next"),
            resume: arena.intern("resume"),
            call: arena.intern("call"),
            dispose: arena.intern("dispose"),
            disposed_flag: arena.intern("__disposed"),
            to_json: arena.intern("to_json"),
            from_json: arena.intern("from_json"),
            main: arena.intern("main"),
            value: arena.intern("value"),
            print: arena.intern("print"),
            println: arena.intern("println"),
            new_: arena.intern("new"),
            send: arena.intern("send"),
            receive: arena.intern("receive"),
            fields: arena.intern("fields"),
            get: arena.intern("get"),
            spawn: arena.intern("spawn"),
            self_: arena.intern("self"),
        }
    }
}

/// Deferred lowering work.
pub(crate) enum Pending<'p> {
    /// A declared function or method body.
    Declared {
        fid: FunctionId,
        owner: Option<ClassId>,
        func: &'p TypedFunction,
    },
    /// Synthetic `call` method of a block-literal class.
    BlockBody {
        fid: FunctionId,
        class: ClassId,
        host: FunctionId,
        capture_index: usize,
        params: &'p [TypedParam],
        body: &'p TypedBody,
        ret: TypeHandle,
    },
    /// FFI thunk for one `@native` method.
    Thunk {
        fid: FunctionId,
        class: ClassId,
        func: &'p TypedFunction,
    },
    ToJson { fid: FunctionId, class: ClassId },
    FromJson { fid: FunctionId, class: ClassId },
}

/// State shared by every function lowering of one module.
pub(crate) struct Shared<'p> {
    pub res: &'p Resolution,
    pub types: &'p mut TypeContext,
    pub arena: &'p mut StringArena,
    pub module: AnvilModule,
    pub queue: VecDeque<Pending<'p>>,
    pub wk: WellKnown,
    next_fn: u32,
}

impl<'p> Shared<'p> {
    pub fn fresh_fn(&mut self) -> FunctionId {
        let id = FunctionId(self.next_fn);
        self.next_fn += 1;
        id
    }

    pub fn cell_type(&mut self) -> TypeHandle {
        let cell = self.types.builtins().cell;
        self.types.class_type(cell)
    }

    pub fn unsupported(&self, construct: &str) -> CompilerError {
        CompilerError::Unsupported {
            construct: construct.to_string(),
        }
    }
}

/// Lower a whole resolved program into a fresh Anvil module.
pub fn lower_program(
    program: &ember_typed_ast::TypedProgram,
    res: &Resolution,
    types: &mut TypeContext,
    arena: &mut StringArena,
    module_name: Symbol,
) -> CompilerResult<AnvilModule> {
    let wk = WellKnown::new(arena);
    let mut sh = Shared {
        res,
        types,
        arena,
        module: AnvilModule::new(module_name),
        queue: VecDeque::new(),
        wk,
        next_fn: res.next_function_id(),
    };

    // The module takes a copy of every resolved descriptor; synthesized
    // classes are appended as lowering discovers them.
    for desc in res.classes.values() {
        sh.module.add_class(desc.clone());
    }

    emit_builtin_bodies(&mut sh)?;

    for func in &program.functions {
        let fid = res
            .function_id(FuncKey::Free(func.name))
            .expect("resolver assigned every free function an id");
        if func.name == sh.wk.main {
            sh.module.entry = Some(fid);
        }
        sh.queue.push_back(Pending::Declared {
            fid,
            owner: None,
            func,
        });
    }
    for class in &program.classes {
        for method in &class.methods {
            let fid = res
                .function_id(FuncKey::Method {
                    class: class.id,
                    name: method.name,
                    arity: method.arity(),
                })
                .expect("resolver assigned every method an id");
            if method.is_native {
                sh.queue.push_back(Pending::Thunk {
                    fid,
                    class: class.id,
                    func: method,
                });
            } else {
                sh.queue.push_back(Pending::Declared {
                    fid,
                    owner: Some(class.id),
                    func: method,
                });
            }
        }
        if class.serialization == ember_typed_ast::SerializationPolicy::Json {
            let desc = res.class(class.id).expect("descriptor built");
            let to_json = desc.methods[&(sh.wk.to_json, 0)]
                .function
                .expect("synthetic to_json has a body id");
            let from_json = desc.methods[&(sh.wk.from_json, 1)]
                .function
                .expect("synthetic from_json has a body id");
            sh.queue.push_back(Pending::ToJson {
                fid: to_json,
                class: class.id,
            });
            sh.queue.push_back(Pending::FromJson {
                fid: from_json,
                class: class.id,
            });
        }
    }

    let mut drained = 0usize;
    while let Some(item) = sh.queue.pop_front() {
        lower_one(&mut sh, item)?;
        drained += 1;
    }
    log::debug!(
        "lowered {} functions ({} synthesized classes total)",
        drained,
        sh.module.classes.len()
    );
    Ok(sh.module)
}

fn lower_one<'p>(sh: &mut Shared<'p>, item: Pending<'p>) -> CompilerResult<()> {
    match item {
        Pending::Declared { fid, owner, func } => {
            if func.is_async {
                crate::state_machine::lower_async(sh, fid, owner, func)
            } else if crate::state_machine::is_generator(func) {
                crate::state_machine::lower_generator(sh, fid, owner, func)
            } else {
                lower_plain_function(sh, fid, owner, func)
            }
        }
        Pending::BlockBody {
            fid,
            class,
            host,
            capture_index,
            params,
            body,
            ret,
        } => crate::closures::lower_block_body(sh, fid, class, host, capture_index, params, body, ret),
        Pending::Thunk { fid, class, func } => crate::ffi::lower_thunk(sh, fid, class, func),
        Pending::ToJson { fid, class } => crate::serialization::lower_to_json(sh, fid, class),
        Pending::FromJson { fid, class } => crate::serialization::lower_from_json(sh, fid, class),
    }
}

/// Bodies for the builtin methods the resolver declared.
fn emit_builtin_bodies(sh: &mut Shared<'_>) -> CompilerResult<()> {
    let b = *sh.types.builtins();
    let string_ty = sh.types.string_type();
    let nil_ty = sh.types.nil_type();
    let object_ty = sh.types.class_type(b.object);
    let exception_ty = sh.types.class_type(b.exception);
    let fns = sh.res.builtin_fns;

    // Object.to_string: runtime default rendering.
    {
        let mut fb = FunctionBuilder::new(
            fns.object_to_string,
            sh.wk.to_string,
            vec![object_ty],
            string_ty,
            FunctionKind::Plain,
            Span::empty(0),
        );
        fb.add_local(sh.wk.self_, object_ty);
        let this = fb.load_local(LocalId(0));
        let s = fb
            .call_intrinsic(Intrinsic::ObjectToString, vec![this], Some(string_ty))
            .expect("intrinsic returns");
        fb.ret(Some(s));
        sh.module.add_function(fb.finish());
    }

    // String.to_string: identity.
    {
        let mut fb = FunctionBuilder::new(
            fns.string_to_string,
            sh.wk.to_string,
            vec![string_ty],
            string_ty,
            FunctionKind::Plain,
            Span::empty(0),
        );
        fb.add_local(sh.wk.self_, string_ty);
        let this = fb.load_local(LocalId(0));
        fb.ret(Some(this));
        sh.module.add_function(fb.finish());
    }

    // Exception.initialize(message): store the message slot.
    {
        let message = sh.arena.intern("message");
        let mut fb = FunctionBuilder::new(
            fns.exception_initialize,
            sh.wk.initialize,
            vec![exception_ty, string_ty],
            nil_ty,
            FunctionKind::Plain,
            Span::empty(0),
        );
        fb.add_local(sh.wk.self_, exception_ty);
        fb.add_local(message, string_ty);
        let this = fb.load_local(LocalId(0));
        let msg = fb.load_local(LocalId(1));
        fb.set_field(this, b.exception, 0, msg);
        fb.ret(None);
        sh.module.add_function(fb.finish());
    }

    // Exception.to_string: the message.
    {
        let mut fb = FunctionBuilder::new(
            fns.exception_to_string,
            sh.wk.to_string,
            vec![exception_ty],
            string_ty,
            FunctionKind::Plain,
            Span::empty(0),
        );
        fb.add_local(sh.wk.self_, exception_ty);
        let this = fb.load_local(LocalId(0));
        let msg = fb.get_field(this, b.exception, 0, string_ty);
        fb.ret(Some(msg));
        sh.module.add_function(fb.finish());
    }
    Ok(())
}

fn lower_plain_function<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    owner: Option<ClassId>,
    func: &'p TypedFunction,
) -> CompilerResult<()> {
    let self_ty = owner
        .filter(|_| !func.is_static)
        .map(|c| sh.types.class_type(c));
    let mut params: Vec<TypeHandle> = Vec::new();
    if let Some(st) = self_ty {
        params.push(st);
    }
    params.extend(func.params.iter().map(|p| p.ty));

    let mut fl = FnLower::new(
        sh,
        fid,
        FunctionBuilder::new(fid, func.name, params, func.return_type, FunctionKind::Plain, func.span),
        self_ty,
        func.return_type,
        fid,
    );
    fl.install_params(func, self_ty)?;

    // `dispose` bodies get the idempotence guard before anything else.
    if let Some(owner) = owner {
        if func.name == fl.sh.wk.dispose && func.params.is_empty() && !func.is_static {
            fl.emit_dispose_guard(owner)?;
        }
    }

    if let Some(body) = &func.body {
        fl.lower_body(body)?;
    }
    let mut fb = fl.finish();
    seal_function(&mut fb, sh)?;
    sh.module.add_function(fb.finish());
    Ok(())
}

/// Where a binding lives during one function lowering.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Place {
    Local { id: LocalId, cell: bool },
    /// A field of `self` (closure environment or state-machine object).
    Field { slot: u16, cell: bool, class: ClassId },
}

pub(crate) struct LoopCtx {
    pub continue_blk: BlockId,
    pub break_blk: BlockId,
    pub finally_depth: usize,
}

/// A pending `finally` obligation on the exit path.
#[derive(Clone, Copy)]
pub(crate) enum FinallyKind<'p> {
    Ast(&'p TypedBody),
    /// `using` scope: call `dispose()` on the bound value.
    Dispose { binding: BindingId, ty: TypeHandle },
}

/// Per-function lowering state.
pub(crate) struct FnLower<'s, 'p> {
    pub sh: &'s mut Shared<'p>,
    pub b: FunctionBuilder,
    /// Function whose capture list this body consumes.
    pub capture_host: FunctionId,
    pub capture_cursor: usize,
    pub bindings: HashMap<BindingId, Place>,
    pub self_ty: Option<TypeHandle>,
    pub ret_ty: TypeHandle,
    pub fid: FunctionId,
    pub loop_stack: Vec<LoopCtx>,
    pub finally_stack: Vec<FinallyKind<'p>>,
    pub region_stack: Vec<TryRegionId>,
    /// Set in state-machine mode; see `state_machine`.
    pub machine: Option<crate::state_machine::Machine>,
    /// Set while lowering a block literal's `call` method.
    pub in_closure: bool,
}

impl<'s, 'p> FnLower<'s, 'p> {
    pub fn new(
        sh: &'s mut Shared<'p>,
        fid: FunctionId,
        b: FunctionBuilder,
        self_ty: Option<TypeHandle>,
        ret_ty: TypeHandle,
        capture_host: FunctionId,
    ) -> Self {
        Self {
            sh,
            b,
            capture_host,
            capture_cursor: 0,
            bindings: HashMap::new(),
            self_ty,
            ret_ty,
            fid,
            loop_stack: Vec::new(),
            finally_stack: Vec::new(),
            region_stack: Vec::new(),
            machine: None,
            in_closure: false,
        }
    }

    /// Declare parameter locals (self first for instance methods) and hoist
    /// cell-captured parameters into cells.
    pub fn install_params(
        &mut self,
        func: &TypedFunction,
        self_ty: Option<TypeHandle>,
    ) -> CompilerResult<()> {
        self.install_param_list(&func.params, self_ty)
    }

    pub fn install_param_list(
        &mut self,
        params: &[TypedParam],
        self_ty: Option<TypeHandle>,
    ) -> CompilerResult<()> {
        if let Some(st) = self_ty {
            let name = self.sh.wk.self_;
            self.b.add_local(name, st);
        }
        let cells = self
            .sh
            .res
            .cell_bindings
            .get(&self.capture_host)
            .cloned()
            .unwrap_or_default();
        let mut param_locals = Vec::new();
        for p in params {
            let id = self.b.add_local(p.name, p.ty);
            param_locals.push((id, p));
        }
        for (id, p) in param_locals {
            if cells.contains(&p.binding) {
                let cell_ty = self.sh.cell_type();
                let cell_name = self.sh.arena.intern("captured");
                let cell_local = self.b.add_local(cell_name, cell_ty);
                let value = self.b.load_local(id);
                let cell = self.b.fresh_reg(cell_ty);
                self.b.push(Op::NewCell { dst: cell, ty: p.ty });
                self.b.push(Op::CellSet { cell, value });
                self.b.store_local(cell_local, cell);
                self.bindings.insert(p.binding, Place::Local { id: cell_local, cell: true });
            } else {
                self.bindings.insert(p.binding, Place::Local { id, cell: false });
            }
        }
        Ok(())
    }

    pub fn finish(self) -> FunctionBuilder {
        self.b
    }

    // ------------------------------------------------------------------
    // Binding access
    // ------------------------------------------------------------------

    fn binding_type(&mut self, binding: BindingId) -> TypeHandle {
        self.sh
            .res
            .binding_types
            .get(&binding)
            .copied()
            .unwrap_or_else(|| self.sh.types.nil_type())
    }

    /// The receiver of the function being lowered: the instance for a plain
    /// method, the closure environment or machine object for synthetics.
    fn owner_object(&mut self) -> CompilerResult<RegId> {
        if self.self_ty.is_none() {
            return Err(CompilerError::Lowering {
                message: "reference to self outside an instance method".into(),
                span: None,
            });
        }
        Ok(self.b.load_local(LocalId(0)))
    }

    /// The source-level `self`. Inside a state machine this is the captured
    /// enclosing instance, not the machine object.
    fn self_reg(&mut self) -> CompilerResult<RegId> {
        if let Some(m) = &self.machine {
            match m.outer_self {
                Some((slot, ty)) => {
                    let class = m.class;
                    let this = self.b.load_local(LocalId(0));
                    return Ok(self.b.get_field(this, class, slot, ty));
                }
                None => {
                    return Err(CompilerError::Lowering {
                        message: "reference to self in a non-method state machine".into(),
                        span: None,
                    })
                }
            }
        }
        if self.in_closure {
            // Capture analysis tracks bindings only; the frontend rewrites
            // `self` into a captured local before handoff.
            return Err(self.sh.unsupported("self referenced inside a block literal"));
        }
        self.owner_object()
    }

    pub fn read_binding(&mut self, binding: BindingId) -> CompilerResult<RegId> {
        let ty = self.binding_type(binding);
        let place = *self.bindings.get(&binding).ok_or_else(|| CompilerError::Lowering {
            message: format!("unresolved binding {:?}", binding),
            span: None,
        })?;
        Ok(match place {
            Place::Local { id, cell: false } => self.b.load_local(id),
            Place::Local { id, cell: true } => {
                let cell = self.b.load_local(id);
                let dst = self.b.fresh_reg(ty);
                self.b.push(Op::CellGet { dst, cell, ty });
                dst
            }
            Place::Field { slot, cell, class } => {
                let this = self.owner_object()?;
                if cell {
                    let cell_ty = self.sh.cell_type();
                    let cell_reg = self.b.get_field(this, class, slot, cell_ty);
                    let dst = self.b.fresh_reg(ty);
                    self.b.push(Op::CellGet { dst, cell: cell_reg, ty });
                    dst
                } else {
                    self.b.get_field(this, class, slot, ty)
                }
            }
        })
    }

    pub fn write_binding(&mut self, binding: BindingId, value: RegId) -> CompilerResult<()> {
        let place = *self.bindings.get(&binding).ok_or_else(|| CompilerError::Lowering {
            message: format!("unresolved binding {:?}", binding),
            span: None,
        })?;
        match place {
            Place::Local { id, cell: false } => self.b.store_local(id, value),
            Place::Local { id, cell: true } => {
                let cell = self.b.load_local(id);
                self.b.push(Op::CellSet { cell, value });
            }
            Place::Field { slot, cell, class } => {
                let this = self.owner_object()?;
                if cell {
                    let cell_ty = self.sh.cell_type();
                    let cell_reg = self.b.get_field(this, class, slot, cell_ty);
                    self.b.push(Op::CellSet { cell: cell_reg, value });
                } else {
                    self.b.set_field(this, class, slot, value);
                }
            }
        }
        Ok(())
    }

    /// Declare a body-local binding, hoisting into a cell when captured.
    pub fn declare_binding(&mut self, binding: BindingId, name: Symbol, ty: TypeHandle) {
        if self.machine.is_some() {
            // State-machine locals already live as fields; mapping was
            // installed by the state-machine setup.
            return;
        }
        let is_cell = self
            .sh
            .res
            .cell_bindings
            .get(&self.capture_host)
            .map_or(false, |s| s.contains(&binding));
        if is_cell {
            let cell_ty = self.sh.cell_type();
            let id = self.b.add_local(name, cell_ty);
            let cell = self.b.fresh_reg(cell_ty);
            self.b.push(Op::NewCell { dst: cell, ty });
            self.b.store_local(id, cell);
            self.bindings.insert(binding, Place::Local { id, cell: true });
        } else {
            let id = self.b.add_local(name, ty);
            self.bindings.insert(binding, Place::Local { id, cell: false });
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn lower_body(&mut self, body: &'p TypedBody) -> CompilerResult<()> {
        for stmt in &body.statements {
            if self.b.is_terminated() {
                break;
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &'p ember_typed_ast::Stmt) -> CompilerResult<()> {
        match &stmt.node {
            TypedStmt::Expr(e) => {
                self.lower_expr(e)?;
                Ok(())
            }
            TypedStmt::Let {
                name,
                binding,
                value,
                ..
            } => {
                let v = self.lower_expr(value)?;
                if self.machine.is_none() {
                    self.declare_binding(*binding, *name, value.ty);
                }
                self.write_binding(*binding, v)
            }
            TypedStmt::Assign { target, value } => self.lower_assign(target, value),
            TypedStmt::Return(value) => self.lower_return(value.as_ref()),
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body.as_ref()),
            TypedStmt::While { cond, body } => self.lower_while(cond, body),
            TypedStmt::For {
                binding,
                elem_ty,
                iterable,
                body,
                name,
            } => self.lower_for(*name, *binding, *elem_ty, iterable, body),
            TypedStmt::Match {
                scrutinee,
                arms,
                default,
            } => self.lower_match(scrutinee, arms, default.as_ref()),
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => self.lower_try(body, catches, finally.as_ref()),
            TypedStmt::Throw(value) => {
                let v = self.lower_expr(value)?;
                self.b.terminate(Terminator::Throw { value: v });
                Ok(())
            }
            TypedStmt::Using {
                name,
                binding,
                value,
                body,
            } => self.lower_using(*name, *binding, value, body),
            TypedStmt::Yield(value) => self.lower_yield(value),
            TypedStmt::Break => self.lower_break(),
            TypedStmt::Continue => self.lower_continue(),
        }
    }

    fn lower_assign(&mut self, target: &'p AssignTarget, value: &'p Expr) -> CompilerResult<()> {
        match target {
            AssignTarget::Local { binding, .. } => {
                let v = self.lower_expr(value)?;
                self.write_binding(*binding, v)
            }
            AssignTarget::Field {
                object,
                class,
                field,
            } => {
                let obj = self.lower_expr(object)?;
                let v = self.lower_expr(value)?;
                let (slot, erased) = self.field_slot(*class, *field)?;
                if erased {
                    self.b.push(Op::StoreErased {
                        object: obj,
                        class: *class,
                        slot,
                        value: v,
                    });
                } else {
                    self.b.set_field(obj, *class, slot, v);
                }
                Ok(())
            }
            AssignTarget::Index { object, index } => {
                let obj = self.lower_expr(object)?;
                let idx = self.lower_expr(index)?;
                let v = self.lower_expr(value)?;
                match self.sh.types.type_of(object.ty).clone() {
                    Type::Array(_) => {
                        self.b.push(Op::ArraySet {
                            array: obj,
                            index: idx,
                            value: v,
                        });
                        Ok(())
                    }
                    Type::Hash(_, _) => {
                        self.b.push(Op::HashSet {
                            hash: obj,
                            key: idx,
                            value: v,
                        });
                        Ok(())
                    }
                    _ => Err(self.sh.unsupported("index assignment on this receiver")),
                }
            }
        }
    }

    fn lower_return(&mut self, value: Option<&'p Expr>) -> CompilerResult<()> {
        let reg = match value {
            Some(v) => Some(self.lower_expr(v)?),
            None => None,
        };
        // `finally` runs after the returned value is materialized; it cannot
        // observe or replace it.
        self.run_finallys(0)?;
        if self.machine.is_some() {
            return crate::state_machine::lower_machine_return(self, reg);
        }
        self.b.terminate(Terminator::Ret { value: reg });
        Ok(())
    }

    pub(crate) fn run_finallys(&mut self, down_to: usize) -> CompilerResult<()> {
        for i in (down_to..self.finally_stack.len()).rev() {
            let item = self.finally_stack[i];
            match item {
                FinallyKind::Ast(body) => self.lower_body(body)?,
                FinallyKind::Dispose { binding, ty } => self.emit_dispose_call(binding, ty)?,
            }
            if self.b.is_terminated() {
                break;
            }
        }
        Ok(())
    }

    fn lower_if(
        &mut self,
        cond: &'p Expr,
        then_body: &'p TypedBody,
        else_body: Option<&'p TypedBody>,
    ) -> CompilerResult<()> {
        let c = self.lower_expr(cond)?;
        let then_blk = self.b.new_block();
        let else_blk = self.b.new_block();
        let join = self.b.new_block();
        self.b.cond_jump(c, then_blk, else_blk);

        self.enter_block(then_blk);
        self.lower_body(then_body)?;
        self.b.jump(join);

        self.enter_block(else_blk);
        if let Some(else_body) = else_body {
            self.lower_body(else_body)?;
        }
        self.b.jump(join);

        self.enter_block(join);
        Ok(())
    }

    fn lower_while(&mut self, cond: &'p Expr, body: &'p TypedBody) -> CompilerResult<()> {
        let header = self.b.new_block();
        let body_blk = self.b.new_block();
        let exit = self.b.new_block();
        self.b.jump(header);

        self.enter_block(header);
        let c = self.lower_expr(cond)?;
        self.b.cond_jump(c, body_blk, exit);

        self.enter_block(body_blk);
        self.loop_stack.push(LoopCtx {
            continue_blk: header,
            break_blk: exit,
            finally_depth: self.finally_stack.len(),
        });
        self.lower_body(body)?;
        self.loop_stack.pop();
        self.b.jump(header);

        self.enter_block(exit);
        Ok(())
    }

    fn lower_for(
        &mut self,
        name: Symbol,
        binding: BindingId,
        elem_ty: TypeHandle,
        iterable: &'p Expr,
        body: &'p TypedBody,
    ) -> CompilerResult<()> {
        match self.sh.types.type_of(iterable.ty).clone() {
            Type::Range => self.lower_for_range(name, binding, elem_ty, iterable, body),
            Type::Array(arr_elem) => {
                self.lower_for_array(name, binding, elem_ty, arr_elem, iterable, body)
            }
            _ => self.lower_for_protocol(name, binding, elem_ty, iterable, body),
        }
    }

    /// Ranges iterate with the built-in index loop.
    fn lower_for_range(
        &mut self,
        name: Symbol,
        binding: BindingId,
        elem_ty: TypeHandle,
        iterable: &'p Expr,
        body: &'p TypedBody,
    ) -> CompilerResult<()> {
        let (lo, hi) = match &iterable.node {
            // A literal range never materializes a Range object.
            TypedExpr::Range { lo, hi } => {
                let lo = self.lower_expr(lo)?;
                let hi = self.lower_expr(hi)?;
                (lo, hi)
            }
            _ => {
                let range = self.lower_expr(iterable)?;
                let lo = self.b.fresh_reg(elem_ty);
                self.b.push(Op::RangeLo { dst: lo, range });
                let hi = self.b.fresh_reg(elem_ty);
                self.b.push(Op::RangeHi { dst: hi, range });
                (lo, hi)
            }
        };
        if self.machine.is_none() {
            self.declare_binding(binding, name, elem_ty);
        }
        self.write_binding(binding, lo)?;

        // When the body suspends, the loop bound must survive the return:
        // park it in a scratch field of the machine.
        let spill = self.machine.is_some() && crate::state_machine::body_has_suspend(body);
        let hi_spill = if spill {
            let m = self.machine.as_mut().expect("machine");
            let (slot, ty) = m.next_scratch();
            let class = m.class;
            let this = self.owner_object()?;
            self.b.set_field(this, class, slot, hi);
            Some((slot, ty, class))
        } else {
            None
        };

        let header = self.b.new_block();
        let body_blk = self.b.new_block();
        let exit = self.b.new_block();
        self.b.jump(header);

        self.enter_block(header);
        let i = self.read_binding(binding)?;
        let hi_val = match hi_spill {
            Some((slot, ty, class)) => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, ty)
            }
            None => hi,
        };
        let bool_ty = self.sh.types.bool_type();
        let c = self.b.icmp(CmpPred::Lt, i, hi_val, bool_ty);
        self.b.cond_jump(c, body_blk, exit);

        self.enter_block(body_blk);
        self.loop_stack.push(LoopCtx {
            continue_blk: header,
            break_blk: exit,
            finally_depth: self.finally_stack.len(),
        });
        self.lower_body(body)?;
        self.loop_stack.pop();
        if !self.b.is_terminated() {
            let i = self.read_binding(binding)?;
            let one = self.b.const_int(1, elem_ty);
            let next = self.b.int_binary(|dst, lhs, rhs| Op::IAdd { dst, lhs, rhs }, i, one);
            self.write_binding(binding, next)?;
        }
        self.b.jump(header);

        self.enter_block(exit);
        Ok(())
    }

    /// Arrays iterate with the built-in bounds-checked index loop. When the
    /// body suspends, the array, length, and index live in machine scratch
    /// fields instead of registers and locals.
    fn lower_for_array(
        &mut self,
        name: Symbol,
        binding: BindingId,
        elem_ty: TypeHandle,
        _arr_elem: TypeHandle,
        iterable: &'p Expr,
        body: &'p TypedBody,
    ) -> CompilerResult<()> {
        let array = self.lower_expr(iterable)?;
        let i64_ty = self.sh.types.primitive(PrimKind::I64);
        let len = self.b.fresh_reg(i64_ty);
        self.b.push(Op::ArrayLen { dst: len, array });

        let spill = self.machine.is_some() && crate::state_machine::body_has_suspend(body);
        #[derive(Clone, Copy)]
        enum Counter {
            Local(LocalId),
            Field { slot: u16, class: ClassId },
        }
        let (arr_spill, len_spill, counter) = if spill {
            let m = self.machine.as_mut().expect("machine");
            let (arr_slot, arr_ty) = m.next_scratch();
            let (len_slot, _) = m.next_scratch();
            let (idx_slot, _) = m.next_scratch();
            let class = m.class;
            let this = self.owner_object()?;
            self.b.set_field(this, class, arr_slot, array);
            let this = self.owner_object()?;
            self.b.set_field(this, class, len_slot, len);
            (
                Some((arr_slot, arr_ty, class)),
                Some((len_slot, class)),
                Counter::Field {
                    slot: idx_slot,
                    class,
                },
            )
        } else {
            let idx_name = self.sh.arena.intern("__idx");
            let idx = self.b.add_local(idx_name, i64_ty);
            (None, None, Counter::Local(idx))
        };

        let zero = self.b.const_int(0, i64_ty);
        match counter {
            Counter::Local(idx) => self.b.store_local(idx, zero),
            Counter::Field { slot, class } => {
                let this = self.owner_object()?;
                self.b.set_field(this, class, slot, zero);
            }
        }
        if self.machine.is_none() {
            self.declare_binding(binding, name, elem_ty);
        }

        let header = self.b.new_block();
        let body_blk = self.b.new_block();
        let exit = self.b.new_block();
        self.b.jump(header);

        self.enter_block(header);
        let i = match counter {
            Counter::Local(idx) => self.b.load_local(idx),
            Counter::Field { slot, class } => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, i64_ty)
            }
        };
        let len_val = match len_spill {
            Some((slot, class)) => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, i64_ty)
            }
            None => len,
        };
        let bool_ty = self.sh.types.bool_type();
        let c = self.b.icmp(CmpPred::Lt, i, len_val, bool_ty);
        self.b.cond_jump(c, body_blk, exit);

        self.enter_block(body_blk);
        let i = match counter {
            Counter::Local(idx) => self.b.load_local(idx),
            Counter::Field { slot, class } => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, i64_ty)
            }
        };
        let arr_val = match arr_spill {
            Some((slot, ty, class)) => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, ty)
            }
            None => array,
        };
        let elem = self.b.fresh_reg(elem_ty);
        self.b.push(Op::ArrayGet {
            dst: elem,
            array: arr_val,
            index: i,
        });
        self.write_binding(binding, elem)?;
        self.loop_stack.push(LoopCtx {
            continue_blk: header,
            break_blk: exit,
            finally_depth: self.finally_stack.len(),
        });
        self.lower_body(body)?;
        self.loop_stack.pop();
        if !self.b.is_terminated() {
            let i = match counter {
                Counter::Local(idx) => self.b.load_local(idx),
                Counter::Field { slot, class } => {
                    let this = self.owner_object()?;
                    self.b.get_field(this, class, slot, i64_ty)
                }
            };
            let one = self.b.const_int(1, i64_ty);
            let next = self.b.int_binary(|dst, lhs, rhs| Op::IAdd { dst, lhs, rhs }, i, one);
            match counter {
                Counter::Local(idx) => self.b.store_local(idx, next),
                Counter::Field { slot, class } => {
                    let this = self.owner_object()?;
                    self.b.set_field(this, class, slot, next);
                }
            }
        }
        self.b.jump(header);

        self.enter_block(exit);
        Ok(())
    }

    /// Everything else iterates through `has_next`/`next`: the class itself
    /// when it defines them, a fresh `iterator()` otherwise.
    fn lower_for_protocol(
        &mut self,
        name: Symbol,
        binding: BindingId,
        elem_ty: TypeHandle,
        iterable: &'p Expr,
        body: &'p TypedBody,
    ) -> CompilerResult<()> {
        let source = self.lower_expr(iterable)?;
        let wk_has_next = self.sh.wk.has_next;
        let wk_next = self.sh.wk.next;

        // The receiver serves as its own iterator when it speaks the
        // protocol; otherwise ask it for one.
        let receiver_class = match self.sh.types.type_of(iterable.ty) {
            Type::Class(c) | Type::GenericInstance(c, _) => Some(*c),
            _ => None,
        };
        let (it, it_class) = match receiver_class {
            Some(c) => {
                let has_protocol = self.sh.res.method(c, wk_has_next, 0).is_some()
                    && self.sh.res.method(c, wk_next, 0).is_some();
                if has_protocol {
                    (source, Some(c))
                } else {
                    let iterator = self.sh.arena.intern("iterator");
                    match self.sh.res.method(c, iterator, 0) {
                        Some(handle) => {
                            let slot = handle.vtable_slot.ok_or_else(|| {
                                self.sh.unsupported("non-virtual iterator()")
                            })?;
                            let ret = handle.ret;
                            let it = self
                                .b
                                .call_virtual(c, slot, vec![source], Some(ret))
                                .expect("iterator() returns");
                            (it, None)
                        }
                        None => (source, None),
                    }
                }
            }
            None => (source, None),
        };

        if self.machine.is_none() {
            self.declare_binding(binding, name, elem_ty);
        }

        // A suspending body invalidates registers across iterations; the
        // iterator parks in a machine scratch field.
        let spill = self.machine.is_some() && crate::state_machine::body_has_suspend(body);
        let it_spill = if spill {
            let m = self.machine.as_mut().expect("machine");
            let (slot, ty) = m.next_scratch();
            let class = m.class;
            let this = self.owner_object()?;
            self.b.set_field(this, class, slot, it);
            Some((slot, ty, class))
        } else {
            None
        };

        let header = self.b.new_block();
        let body_blk = self.b.new_block();
        let exit = self.b.new_block();
        self.b.jump(header);

        self.enter_block(header);
        let it = match it_spill {
            Some((slot, ty, class)) => {
                let this = self.owner_object()?;
                self.b.get_field(this, class, slot, ty)
            }
            None => it,
        };
        let bool_ty = self.sh.types.bool_type();
        let more = match it_class.and_then(|c| {
            self.sh
                .res
                .method(c, wk_has_next, 0)
                .and_then(|m| m.vtable_slot.map(|s| (c, s)))
        }) {
            Some((c, slot)) => self
                .b
                .call_virtual(c, slot, vec![it], Some(bool_ty))
                .expect("has_next returns"),
            None => {
                let dst = self.b.fresh_reg(bool_ty);
                self.b.push(Op::CallInterface {
                    dst: Some(dst),
                    name: wk_has_next,
                    arity: 0,
                    ret: bool_ty,
                    args: vec![it],
                });
                dst
            }
        };
        self.b.cond_jump(more, body_blk, exit);

        self.enter_block(body_blk);
        let elem = match it_class.and_then(|c| {
            self.sh
                .res
                .method(c, wk_next, 0)
                .and_then(|m| m.vtable_slot.map(|s| (c, s)))
        }) {
            Some((c, slot)) => self
                .b
                .call_virtual(c, slot, vec![it], Some(elem_ty))
                .expect("next returns"),
            None => {
                let dst = self.b.fresh_reg(elem_ty);
                self.b.push(Op::CallInterface {
                    dst: Some(dst),
                    name: wk_next,
                    arity: 0,
                    ret: elem_ty,
                    args: vec![it],
                });
                dst
            }
        };
        self.write_binding(binding, elem)?;
        self.loop_stack.push(LoopCtx {
            continue_blk: header,
            break_blk: exit,
            finally_depth: self.finally_stack.len(),
        });
        self.lower_body(body)?;
        self.loop_stack.pop();
        self.b.jump(header);

        self.enter_block(exit);
        Ok(())
    }

    fn lower_break(&mut self) -> CompilerResult<()> {
        let ctx = self.loop_stack.last().ok_or_else(|| CompilerError::Lowering {
            message: "break outside a loop".into(),
            span: None,
        })?;
        let (target, depth) = (ctx.break_blk, ctx.finally_depth);
        self.run_finallys(depth)?;
        self.b.jump(target);
        Ok(())
    }

    fn lower_continue(&mut self) -> CompilerResult<()> {
        let ctx = self.loop_stack.last().ok_or_else(|| CompilerError::Lowering {
            message: "continue outside a loop".into(),
            span: None,
        })?;
        let (target, depth) = (ctx.continue_blk, ctx.finally_depth);
        self.run_finallys(depth)?;
        self.b.jump(target);
        Ok(())
    }

    fn lower_yield(&mut self, value: &'p Expr) -> CompilerResult<()> {
        if self.machine.is_none() {
            return Err(self.sh.unsupported("yield outside a generator body"));
        }
        let v = self.lower_expr(value)?;
        crate::state_machine::lower_yield_point(self, v)
    }

    /// Move the builder to a block, registering it with every open try
    /// region so the region tables stay complete.
    pub(crate) fn enter_block(&mut self, block: BlockId) {
        self.b.switch_to(block);
        for region in &self.region_stack {
            let r = self.b.region_mut(*region);
            if !r.blocks.contains(&block) {
                r.blocks.push(block);
            }
        }
    }

    // ------------------------------------------------------------------
    // try / using
    // ------------------------------------------------------------------

    fn lower_try(
        &mut self,
        body: &'p TypedBody,
        catches: &'p [ember_typed_ast::CatchClause],
        finally: Option<&'p TypedBody>,
    ) -> CompilerResult<()> {
        let parent = self.region_stack.last().copied();
        let region = self.b.add_region(parent, vec![], vec![]);
        let exit = self.b.new_block();

        if let Some(f) = finally {
            self.finally_stack.push(FinallyKind::Ast(f));
        }

        // Protected body in its own blocks, all registered to the region.
        let body_entry = self.b.new_block();
        self.b.jump(body_entry);
        self.region_stack.push(region);
        self.enter_block(body_entry);
        self.lower_body(body)?;
        self.b.jump(exit);
        self.region_stack.pop();

        if finally.is_some() {
            self.finally_stack.pop();
        }

        // Handlers live outside the region (their throws go to the parent).
        let exception_root = self.sh.types.builtins().exception;
        let mut catch_entries = Vec::new();
        for clause in catches {
            let handler = self.b.new_block();
            let catch_ty = self.sh.types.class_type(clause.class);
            catch_entries.push(CatchEntry {
                ty: catch_ty,
                handler,
            });
            self.enter_block(handler);
            let exc = self.b.fresh_reg(catch_ty);
            self.b.push(Op::CaughtException { dst: exc, ty: catch_ty });
            if self.machine.is_none() {
                self.declare_binding(clause.binding, clause.name, catch_ty);
            }
            self.write_binding(clause.binding, exc)?;
            if let Some(f) = finally {
                self.finally_stack.push(FinallyKind::Ast(f));
            }
            self.lower_body(&clause.body)?;
            if finally.is_some() {
                self.finally_stack.pop();
            }
            self.b.jump(exit);
        }

        // The throw edge of `finally`: a catch-all that runs the body and
        // re-raises.
        if let Some(f) = finally {
            let handler = self.b.new_block();
            let exc_ty = self.sh.types.class_type(exception_root);
            catch_entries.push(CatchEntry {
                ty: exc_ty,
                handler,
            });
            self.enter_block(handler);
            let exc = self.b.fresh_reg(exc_ty);
            self.b.push(Op::CaughtException { dst: exc, ty: exc_ty });
            self.lower_body(f)?;
            self.b.terminate(Terminator::Throw { value: exc });
        }

        self.b.region_mut(region).catches = catch_entries;

        // Normal exit runs `finally` once.
        self.enter_block(exit);
        if let Some(f) = finally {
            self.lower_body(f)?;
        }
        Ok(())
    }

    fn lower_using(
        &mut self,
        name: Symbol,
        binding: BindingId,
        value: &'p Expr,
        body: &'p TypedBody,
    ) -> CompilerResult<()> {
        let v = self.lower_expr(value)?;
        if self.machine.is_none() {
            self.declare_binding(binding, name, value.ty);
        }
        self.write_binding(binding, v)?;

        let parent = self.region_stack.last().copied();
        let region = self.b.add_region(parent, vec![], vec![]);
        let exit = self.b.new_block();

        self.finally_stack.push(FinallyKind::Dispose {
            binding,
            ty: value.ty,
        });

        let body_entry = self.b.new_block();
        self.b.jump(body_entry);
        self.region_stack.push(region);
        self.enter_block(body_entry);
        self.lower_body(body)?;
        self.b.jump(exit);
        self.region_stack.pop();
        self.finally_stack.pop();

        // Throw edge: dispose, then re-raise.
        let exception_root = self.sh.types.builtins().exception;
        let exc_ty = self.sh.types.class_type(exception_root);
        let handler = self.b.new_block();
        self.b.region_mut(region).catches = vec![CatchEntry {
            ty: exc_ty,
            handler,
        }];
        self.enter_block(handler);
        let exc = self.b.fresh_reg(exc_ty);
        self.b.push(Op::CaughtException { dst: exc, ty: exc_ty });
        self.emit_dispose_call(binding, value.ty)?;
        self.b.terminate(Terminator::Throw { value: exc });

        self.enter_block(exit);
        self.emit_dispose_call(binding, value.ty)?;
        Ok(())
    }

    pub(crate) fn emit_dispose_call(
        &mut self,
        binding: BindingId,
        ty: TypeHandle,
    ) -> CompilerResult<()> {
        let receiver = self.read_binding(binding)?;
        let dispose = self.sh.wk.dispose;
        let nil_ty = self.sh.types.nil_type();
        match self.sh.types.type_of(ty) {
            Type::Class(c) | Type::GenericInstance(c, _) => {
                let c = *c;
                match self.sh.res.method(c, dispose, 0).and_then(|m| m.vtable_slot) {
                    Some(slot) => {
                        self.b.call_virtual(c, slot, vec![receiver], None);
                    }
                    None => {
                        self.b.push(Op::CallInterface {
                            dst: None,
                            name: dispose,
                            arity: 0,
                            ret: nil_ty,
                            args: vec![receiver],
                        });
                    }
                }
            }
            _ => {
                self.b.push(Op::CallInterface {
                    dst: None,
                    name: dispose,
                    arity: 0,
                    ret: nil_ty,
                    args: vec![receiver],
                });
            }
        }
        Ok(())
    }

    /// Guard at the top of a `dispose` body: a second call is a no-op.
    fn emit_dispose_guard(&mut self, owner: ClassId) -> CompilerResult<()> {
        let flag = self.sh.wk.disposed_flag;
        let (slot, _) = self.field_slot(owner, flag)?;
        let bool_ty = self.sh.types.bool_type();
        let this = self.b.load_local(LocalId(0));
        let disposed = self.b.get_field(this, owner, slot, bool_ty);
        let done = self.b.new_block();
        let run = self.b.new_block();
        self.b.cond_jump(disposed, done, run);

        self.enter_block(done);
        self.b.ret(None);

        self.enter_block(run);
        let this = self.b.load_local(LocalId(0));
        let truth = self.b.const_int(1, bool_ty);
        self.b.set_field(this, owner, slot, truth);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(crate) fn field_slot(&mut self, class: ClassId, field: Symbol) -> CompilerResult<(u16, bool)> {
        let desc = self
            .sh
            .module
            .class(class)
            .or_else(|| self.sh.res.class(class))
            .ok_or_else(|| CompilerError::Lowering {
                message: "field access on unknown class".into(),
                span: None,
            })?;
        let slot = desc.field_slot(field).ok_or_else(|| CompilerError::Lowering {
            message: format!("no field `{}` on class", self.sh.arena.resolve(field)),
            span: None,
        })?;
        let erased = desc.fields[slot as usize].erased;
        Ok((slot, erased))
    }

    pub fn lower_expr(&mut self, expr: &'p Expr) -> CompilerResult<RegId> {
        match &expr.node {
            TypedExpr::LitInt(v) => Ok(self.b.const_int(*v, expr.ty)),
            TypedExpr::LitFloat(v) => Ok(self.b.const_double(*v, expr.ty)),
            TypedExpr::LitBool(v) => Ok(self.b.const_int(*v as i64, expr.ty)),
            TypedExpr::LitString(sym) => {
                let id = self.sh.module.intern_string(*sym);
                Ok(self.b.const_string(id, expr.ty))
            }
            TypedExpr::LitNil => Ok(self.b.const_nil(expr.ty)),
            TypedExpr::Local { binding, .. } => self.read_binding(*binding),
            TypedExpr::SelfRef => self.self_reg(),
            TypedExpr::FieldGet {
                object,
                class,
                field,
            } => {
                let obj = self.lower_expr(object)?;
                let (slot, erased) = self.field_slot(*class, *field)?;
                let dst = self.b.fresh_reg(expr.ty);
                if erased {
                    self.b.push(Op::LoadErased {
                        dst,
                        object: obj,
                        class: *class,
                        slot,
                    });
                } else {
                    self.b.push(Op::GetField {
                        dst,
                        object: obj,
                        class: *class,
                        slot,
                    });
                }
                Ok(dst)
            }
            TypedExpr::StaticCall {
                class,
                method,
                args,
            } => self.lower_static_call(*class, *method, args, expr.ty),
            TypedExpr::MethodCall {
                receiver,
                method,
                args,
            } => self.lower_method_call(receiver, *method, args, expr.ty),
            TypedExpr::FreeCall { function, args } => {
                let fid = self
                    .sh
                    .res
                    .function_id(FuncKey::Free(*function))
                    .ok_or_else(|| CompilerError::Lowering {
                        message: format!(
                            "unresolved function `{}`",
                            self.sh.arena.resolve(*function)
                        ),
                        span: Some(expr.span),
                    })?;
                let arg_regs = self.lower_args(args)?;
                let is_nil = self.is_nil_type(expr.ty);
                let ret = if is_nil { None } else { Some(expr.ty) };
                match self.b.call_static(fid, arg_regs, ret) {
                    Some(r) => Ok(r),
                    None => self.nil_result(expr.ty),
                }
            }
            TypedExpr::New { class, args, .. } => {
                let arg_regs = self.lower_args(args)?;
                Ok(self.b.new_object(*class, arg_regs, expr.ty))
            }
            TypedExpr::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, expr.ty),
            TypedExpr::Unary { op, operand } => self.lower_unary(*op, operand, expr.ty),
            TypedExpr::Logical { op, lhs, rhs } => self.lower_logical(*op, lhs, rhs),
            TypedExpr::Convert { kind, value } => self.lower_convert(*kind, value, expr.ty),
            TypedExpr::Index { object, index } => {
                let obj = self.lower_expr(object)?;
                let idx = self.lower_expr(index)?;
                let dst = self.b.fresh_reg(expr.ty);
                match self.sh.types.type_of(object.ty) {
                    Type::Array(_) => {
                        self.b.push(Op::ArrayGet {
                            dst,
                            array: obj,
                            index: idx,
                        });
                        Ok(dst)
                    }
                    Type::Hash(_, _) => {
                        self.b.push(Op::HashGet {
                            dst,
                            hash: obj,
                            key: idx,
                        });
                        Ok(dst)
                    }
                    _ => Err(self.sh.unsupported("indexing on this receiver")),
                }
            }
            TypedExpr::ArrayLit(elems) => {
                let elem_ty = match self.sh.types.type_of(expr.ty) {
                    Type::Array(e) => *e,
                    _ => {
                        return Err(CompilerError::InputContract {
                            message: "array literal not typed as an array".into(),
                            span: expr.span,
                        })
                    }
                };
                let i64_ty = self.sh.types.primitive(PrimKind::I64);
                let len = self.b.const_int(elems.len() as i64, i64_ty);
                let arr = self.b.fresh_reg(expr.ty);
                self.b.push(Op::ArrayNew {
                    dst: arr,
                    elem: elem_ty,
                    len,
                });
                for (i, elem) in elems.iter().enumerate() {
                    let v = self.lower_expr(elem)?;
                    let idx = self.b.const_int(i as i64, i64_ty);
                    self.b.push(Op::ArraySet {
                        array: arr,
                        index: idx,
                        value: v,
                    });
                }
                Ok(arr)
            }
            TypedExpr::HashLit(pairs) => {
                let (key_ty, val_ty) = match self.sh.types.type_of(expr.ty) {
                    Type::Hash(k, v) => (*k, *v),
                    _ => {
                        return Err(CompilerError::InputContract {
                            message: "hash literal not typed as a hash".into(),
                            span: expr.span,
                        })
                    }
                };
                let hash = self.b.fresh_reg(expr.ty);
                self.b.push(Op::HashNew {
                    dst: hash,
                    key: key_ty,
                    value: val_ty,
                });
                for (k, v) in pairs {
                    let kr = self.lower_expr(k)?;
                    let vr = self.lower_expr(v)?;
                    self.b.push(Op::HashSet {
                        hash,
                        key: kr,
                        value: vr,
                    });
                }
                Ok(hash)
            }
            TypedExpr::Range { lo, hi } => {
                let lo = self.lower_expr(lo)?;
                let hi = self.lower_expr(hi)?;
                let dst = self.b.fresh_reg(expr.ty);
                self.b.push(Op::RangeNew { dst, lo, hi });
                Ok(dst)
            }
            TypedExpr::TupleLit(_) => Err(self.sh.unsupported("tuple literals")),
            TypedExpr::BlockLit { params, body } => {
                crate::closures::lower_block_literal(self, params, body, expr.ty)
            }
            TypedExpr::BlockCall { callee, args } => {
                let callee_reg = self.lower_expr(callee)?;
                let mut all = vec![callee_reg];
                all.extend(self.lower_args(args)?);
                let is_nil = self.is_nil_type(expr.ty);
                let dst = if is_nil { None } else { Some(self.b.fresh_reg(expr.ty)) };
                self.b.push(Op::CallInterface {
                    dst,
                    name: self.sh.wk.call,
                    arity: args.len() as u8,
                    ret: expr.ty,
                    args: all,
                });
                match dst {
                    Some(r) => Ok(r),
                    None => self.nil_result(expr.ty),
                }
            }
            TypedExpr::Await(inner) => {
                if self.machine.is_none() {
                    return Err(self.sh.unsupported("await outside an async function"));
                }
                crate::state_machine::lower_await_point(self, inner, expr.ty)
            }
            TypedExpr::StringInterp { parts } => self.lower_interp(parts),
        }
    }

    pub(crate) fn is_nil_type(&self, ty: TypeHandle) -> bool {
        matches!(self.sh.types.type_of(ty), Type::Primitive(PrimKind::Nil))
    }

    /// Statement-position calls with no value still need a register for
    /// expression contexts; a typed nil stands in.
    fn nil_result(&mut self, ty: TypeHandle) -> CompilerResult<RegId> {
        Ok(self.b.const_nil(ty))
    }

    pub(crate) fn lower_args(&mut self, args: &'p [Expr]) -> CompilerResult<Vec<RegId>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.lower_expr(arg)?);
        }
        Ok(out)
    }

    fn lower_static_call(
        &mut self,
        class: ClassId,
        method: Symbol,
        args: &'p [Expr],
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let b = *self.sh.types.builtins();
        let wk_print = self.sh.wk.print;
        let wk_println = self.sh.wk.println;

        // Builtin namespaces lower straight to runtime intrinsics.
        if class == b.io && (method == wk_print || method == wk_println) {
            let intrinsic = if method == wk_print {
                Intrinsic::Print
            } else {
                Intrinsic::Println
            };
            let arg = args.first().ok_or_else(|| CompilerError::InputContract {
                message: "IO.print expects an argument".into(),
                span: Span::empty(0),
            })?;
            let reg = self.lower_expr(arg)?;
            let s = self.to_string_of(reg, arg.ty)?;
            self.b.call_intrinsic(intrinsic, vec![s], None);
            return self.nil_result(node_ty);
        }
        if class == b.thread && (method == self.sh.wk.new_ || method == self.sh.wk.spawn) {
            let regs = self.lower_args(args)?;
            self.b.call_intrinsic(Intrinsic::ThreadSpawn, regs, None);
            return self.nil_result(node_ty);
        }
        if class == b.channel && method == self.sh.wk.new_ {
            let regs = self.lower_args(args)?;
            let dst = self
                .b
                .call_intrinsic(Intrinsic::ChannelNew, regs, Some(node_ty))
                .expect("channel_new returns");
            return Ok(dst);
        }
        if class == b.reflect {
            let regs = self.lower_args(args)?;
            let intrinsic = if method == self.sh.wk.fields {
                Intrinsic::ReflectFields
            } else if method == self.sh.wk.get {
                Intrinsic::ReflectGet
            } else {
                return Err(self.sh.unsupported("unknown Reflect operation"));
            };
            let dst = self
                .b
                .call_intrinsic(intrinsic, regs, Some(node_ty))
                .expect("reflect intrinsics return");
            return Ok(dst);
        }

        let handle = self
            .sh
            .res
            .method(class, method, args.len() as u8)
            .cloned()
            .ok_or_else(|| CompilerError::Lowering {
                message: format!(
                    "unresolved static method `{}`",
                    self.sh.arena.resolve(method)
                ),
                span: None,
            })?;
        let fid = handle.function.ok_or_else(|| CompilerError::Lowering {
            message: "static call into a bodyless method".into(),
            span: None,
        })?;
        let arg_regs = self.lower_args(args)?;
        let ret = if self.is_nil_type(node_ty) { None } else { Some(node_ty) };
        match self.b.call_static(fid, arg_regs, ret) {
            Some(r) => Ok(r),
            None => self.nil_result(node_ty),
        }
    }

    fn lower_method_call(
        &mut self,
        receiver: &'p Expr,
        method: Symbol,
        args: &'p [Expr],
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let recv = self.lower_expr(receiver)?;
        let arity = args.len() as u8;

        match self.sh.types.type_of(receiver.ty).clone() {
            Type::Channel(elem) => {
                if method == self.sh.wk.send {
                    let mut regs = vec![recv];
                    regs.extend(self.lower_args(args)?);
                    self.b.call_intrinsic(Intrinsic::ChannelSend, regs, None);
                    return self.nil_result(node_ty);
                }
                if method == self.sh.wk.receive {
                    let dst = self
                        .b
                        .call_intrinsic(Intrinsic::ChannelReceive, vec![recv], Some(elem))
                        .expect("channel_receive returns");
                    return Ok(dst);
                }
                Err(self.sh.unsupported("unknown channel operation"))
            }
            Type::Future(_) => {
                if method == self.sh.wk.value {
                    let dst = self
                        .b
                        .call_intrinsic(Intrinsic::FutureValue, vec![recv], Some(node_ty))
                        .expect("future_value returns");
                    return Ok(dst);
                }
                Err(self.sh.unsupported("unknown future operation"))
            }
            Type::Class(c) | Type::GenericInstance(c, _) => {
                match self.sh.res.method(c, method, arity).cloned() {
                    Some(handle) => {
                        let mut regs = vec![recv];
                        regs.extend(self.lower_args(args)?);
                        let ret = if self.is_nil_type(node_ty) { None } else { Some(node_ty) };
                        match handle.dispatch {
                            DispatchMode::Virtual
                            | DispatchMode::Generator
                            | DispatchMode::Async => {
                                let slot =
                                    handle.vtable_slot.ok_or_else(|| CompilerError::Lowering {
                                        message: "virtual method without a slot".into(),
                                        span: None,
                                    })?;
                                match self.b.call_virtual(c, slot, regs, ret) {
                                    Some(r) => Ok(r),
                                    None => self.nil_result(node_ty),
                                }
                            }
                            DispatchMode::Static => {
                                let fid = handle.function.expect("static methods have bodies");
                                match self.b.call_static(fid, regs, ret) {
                                    Some(r) => Ok(r),
                                    None => self.nil_result(node_ty),
                                }
                            }
                            DispatchMode::Native => {
                                // Through the thunk, which does the
                                // marshalling in one place.
                                let fid = handle.function.expect("native methods have thunks");
                                let non_self = regs.split_off(1);
                                match self.b.call_static(fid, non_self, ret) {
                                    Some(r) => Ok(r),
                                    None => self.nil_result(node_ty),
                                }
                            }
                            DispatchMode::InterfaceLike => {
                                self.emit_interface_call(method, arity, regs, node_ty)
                            }
                        }
                    }
                    // Receiver class does not own the method statically:
                    // dynamic lookup.
                    None => {
                        let mut regs = vec![recv];
                        regs.extend(self.lower_args(args)?);
                        self.emit_interface_call(method, arity, regs, node_ty)
                    }
                }
            }
            // Erased or structural receivers always go through the table.
            _ => {
                let mut regs = vec![recv];
                regs.extend(self.lower_args(args)?);
                self.emit_interface_call(method, arity, regs, node_ty)
            }
        }
    }

    fn emit_interface_call(
        &mut self,
        method: Symbol,
        arity: u8,
        args: Vec<RegId>,
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let is_nil = self.is_nil_type(node_ty);
        let dst = if is_nil { None } else { Some(self.b.fresh_reg(node_ty)) };
        self.b.push(Op::CallInterface {
            dst,
            name: method,
            arity,
            ret: node_ty,
            args,
        });
        match dst {
            Some(r) => Ok(r),
            None => self.nil_result(node_ty),
        }
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &'p Expr,
        rhs: &'p Expr,
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let l = self.lower_expr(lhs)?;
        let r = self.lower_expr(rhs)?;
        let operand_ty = lhs.ty;
        let is_float = matches!(
            self.sh.types.type_of(operand_ty),
            Type::Primitive(PrimKind::F32 | PrimKind::F64)
        );
        let is_ref = self.sh.types.is_reference(operand_ty)
            || matches!(self.sh.types.type_of(operand_ty), Type::Primitive(PrimKind::Nil));

        if op.is_comparison() {
            let pred = match op {
                BinOp::Eq => CmpPred::Eq,
                BinOp::Ne => CmpPred::Ne,
                BinOp::Lt => CmpPred::Lt,
                BinOp::Le => CmpPred::Le,
                BinOp::Gt => CmpPred::Gt,
                BinOp::Ge => CmpPred::Ge,
                _ => unreachable!(),
            };
            let bool_ty = self.sh.types.bool_type();
            if is_ref {
                // Reference comparison is identity; only eq/ne make sense.
                let dst = self.b.fresh_reg(bool_ty);
                self.b.push(Op::RefEq { dst, lhs: l, rhs: r });
                return match op {
                    BinOp::Eq => Ok(dst),
                    BinOp::Ne => {
                        let one = self.b.const_int(1, bool_ty);
                        let inv = self.b.fresh_reg(bool_ty);
                        self.b.push(Op::BitXor { dst: inv, lhs: dst, rhs: one });
                        Ok(inv)
                    }
                    _ => Err(self.sh.unsupported("ordering comparison on references")),
                };
            }
            return Ok(if is_float {
                self.b.fcmp(pred, l, r, bool_ty)
            } else {
                self.b.icmp(pred, l, r, bool_ty)
            });
        }

        // String `+` is concatenation.
        let string_ty = self.sh.types.string_type();
        if op == BinOp::Add && operand_ty == string_ty {
            let dst = self.b.fresh_reg(node_ty);
            self.b.push(Op::StringConcat { dst, lhs: l, rhs: r });
            return Ok(dst);
        }

        let dst = self.b.fresh_reg(node_ty);
        let op = match (op, is_float) {
            (BinOp::Add, false) => Op::IAdd { dst, lhs: l, rhs: r },
            (BinOp::Sub, false) => Op::ISub { dst, lhs: l, rhs: r },
            (BinOp::Mul, false) => Op::IMul { dst, lhs: l, rhs: r },
            (BinOp::Div, false) => Op::IDiv { dst, lhs: l, rhs: r },
            (BinOp::Mod, false) => Op::IMod { dst, lhs: l, rhs: r },
            (BinOp::Add, true) => Op::FAdd { dst, lhs: l, rhs: r },
            (BinOp::Sub, true) => Op::FSub { dst, lhs: l, rhs: r },
            (BinOp::Mul, true) => Op::FMul { dst, lhs: l, rhs: r },
            (BinOp::Div, true) => Op::FDiv { dst, lhs: l, rhs: r },
            (BinOp::BitAnd, _) => Op::BitAnd { dst, lhs: l, rhs: r },
            (BinOp::BitOr, _) => Op::BitOr { dst, lhs: l, rhs: r },
            (BinOp::BitXor, _) => Op::BitXor { dst, lhs: l, rhs: r },
            (BinOp::Shl, _) => Op::Shl { dst, lhs: l, rhs: r },
            (BinOp::Shr, _) => Op::Shr { dst, lhs: l, rhs: r },
            (BinOp::Mod, true) => return Err(self.sh.unsupported("float modulo")),
            _ => return Err(self.sh.unsupported("operator for these operand types")),
        };
        self.b.push(op);
        Ok(dst)
    }

    fn lower_unary(
        &mut self,
        op: UnOp,
        operand: &'p Expr,
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let v = self.lower_expr(operand)?;
        let dst = self.b.fresh_reg(node_ty);
        let is_float = matches!(
            self.sh.types.type_of(operand.ty),
            Type::Primitive(PrimKind::F32 | PrimKind::F64)
        );
        match (op, is_float) {
            (UnOp::Neg, false) => self.b.push(Op::INeg { dst, src: v }),
            (UnOp::Neg, true) => self.b.push(Op::FNeg { dst, src: v }),
            (UnOp::Not, _) => {
                let one = self.b.const_int(1, node_ty);
                self.b.push(Op::BitXor { dst, lhs: v, rhs: one });
            }
            (UnOp::BitNot, _) => {
                let all = self.b.const_int(-1, node_ty);
                self.b.push(Op::BitXor { dst, lhs: v, rhs: all });
            }
        }
        Ok(dst)
    }

    /// Short-circuit `and`/`or` with a boolean phi at the join.
    fn lower_logical(&mut self, op: LogicalOp, lhs: &'p Expr, rhs: &'p Expr) -> CompilerResult<RegId> {
        let bool_ty = self.sh.types.bool_type();
        let l = self.lower_expr(lhs)?;
        let rhs_blk = self.b.new_block();
        let short_blk = self.b.new_block();
        let join = self.b.new_block();
        match op {
            LogicalOp::And => self.b.cond_jump(l, rhs_blk, short_blk),
            LogicalOp::Or => self.b.cond_jump(l, short_blk, rhs_blk),
        }

        self.enter_block(short_blk);
        let short_val = match op {
            LogicalOp::And => self.b.const_int(0, bool_ty),
            LogicalOp::Or => self.b.const_int(1, bool_ty),
        };
        self.b.jump(join);

        self.enter_block(rhs_blk);
        let r = self.lower_expr(rhs)?;
        let rhs_end = self.b.current_block();
        self.b.jump(join);

        self.enter_block(join);
        let phi = self
            .b
            .add_phi(join, bool_ty, vec![(short_blk, short_val), (rhs_end, r)]);
        Ok(phi)
    }

    fn lower_convert(
        &mut self,
        kind: ConvertKind,
        value: &'p Expr,
        node_ty: TypeHandle,
    ) -> CompilerResult<RegId> {
        let v = self.lower_expr(value)?;
        let dst = self.b.fresh_reg(node_ty);
        match kind {
            ConvertKind::IntToFloat => self.b.push(Op::IntToFloat { dst, src: v }),
            ConvertKind::FloatToInt => self.b.push(Op::FloatToInt { dst, src: v }),
            ConvertKind::I32ToI64 => self.b.push(Op::I32ToI64 { dst, src: v }),
            ConvertKind::F32ToF64 => self.b.push(Op::F32ToF64 { dst, src: v }),
            ConvertKind::Box => {
                let prim = match self.sh.types.type_of(value.ty) {
                    Type::Primitive(k) => *k,
                    _ => {
                        return Err(CompilerError::InputContract {
                            message: "box of a non-primitive".into(),
                            span: value.span,
                        })
                    }
                };
                self.b.push(Op::Box { dst, src: v, prim });
            }
            ConvertKind::Unbox => {
                let prim = match self.sh.types.type_of(node_ty) {
                    Type::Primitive(k) => *k,
                    _ => {
                        return Err(CompilerError::InputContract {
                            message: "unbox to a non-primitive".into(),
                            span: value.span,
                        })
                    }
                };
                let class = self.sh.types.builtins().box_class(prim)?;
                self.b.push(Op::Unbox {
                    dst,
                    src: v,
                    class,
                    prim,
                });
            }
        }
        Ok(dst)
    }

    /// Interpolation: strict left-to-right `to_string` then concatenation.
    fn lower_interp(&mut self, parts: &'p [InterpPart]) -> CompilerResult<RegId> {
        let string_ty = self.sh.types.string_type();
        let mut acc: Option<RegId> = None;
        for part in parts {
            let piece = match part {
                InterpPart::Lit(sym) => {
                    let id = self.sh.module.intern_string(*sym);
                    self.b.const_string(id, string_ty)
                }
                InterpPart::Expr(e) => {
                    let v = self.lower_expr(e)?;
                    self.to_string_of(v, e.ty)?
                }
            };
            acc = Some(match acc {
                None => piece,
                Some(prev) => {
                    let dst = self.b.fresh_reg(string_ty);
                    self.b.push(Op::StringConcat {
                        dst,
                        lhs: prev,
                        rhs: piece,
                    });
                    dst
                }
            });
        }
        match acc {
            Some(r) => Ok(r),
            None => {
                let empty = self.sh.arena.intern("");
                let id = self.sh.module.intern_string(empty);
                Ok(self.b.const_string(id, string_ty))
            }
        }
    }

    /// Render any value as a String, using the virtual `to_string` for
    /// objects and runtime intrinsics for primitives.
    pub(crate) fn to_string_of(&mut self, reg: RegId, ty: TypeHandle) -> CompilerResult<RegId> {
        let string_ty = self.sh.types.string_type();
        if ty == string_ty {
            return Ok(reg);
        }
        match self.sh.types.type_of(ty).clone() {
            Type::Primitive(PrimKind::I1) => Ok(self
                .b
                .call_intrinsic(Intrinsic::BoolToString, vec![reg], Some(string_ty))
                .expect("intrinsic returns")),
            Type::Primitive(PrimKind::I8 | PrimKind::I32 | PrimKind::I64 | PrimKind::IntPtr) => {
                Ok(self
                    .b
                    .call_intrinsic(Intrinsic::IntToString, vec![reg], Some(string_ty))
                    .expect("intrinsic returns"))
            }
            Type::Primitive(PrimKind::F64) => Ok(self
                .b
                .call_intrinsic(Intrinsic::DoubleToString, vec![reg], Some(string_ty))
                .expect("intrinsic returns")),
            Type::Primitive(PrimKind::F32) => {
                let f64_ty = self.sh.types.primitive(PrimKind::F64);
                let wide = self.b.fresh_reg(f64_ty);
                self.b.push(Op::F32ToF64 { dst: wide, src: reg });
                Ok(self
                    .b
                    .call_intrinsic(Intrinsic::DoubleToString, vec![wide], Some(string_ty))
                    .expect("intrinsic returns"))
            }
            Type::Primitive(PrimKind::Nil) => {
                let nil = self.sh.arena.intern("nil");
                let id = self.sh.module.intern_string(nil);
                Ok(self.b.const_string(id, string_ty))
            }
            Type::Class(c) | Type::GenericInstance(c, _) => {
                // to_string is v-table slot 0, inherited from Object.
                Ok(self
                    .b
                    .call_virtual(c, 0, vec![reg], Some(string_ty))
                    .expect("to_string returns"))
            }
            _ => {
                let dst = self.b.fresh_reg(string_ty);
                self.b.push(Op::CallInterface {
                    dst: Some(dst),
                    name: self.sh.wk.to_string,
                    arity: 0,
                    ret: string_ty,
                    args: vec![reg],
                });
                Ok(dst)
            }
        }
    }
}

/// Give every unterminated block a default return so the function verifies.
/// Such blocks are unreachable joins (e.g. after both arms returned).
pub(crate) fn seal_function(fb: &mut FunctionBuilder, sh: &mut Shared<'_>) -> CompilerResult<()> {
    let ret_ty = fb.func().ret;
    let nblocks = fb.func().blocks.len() as u32;
    for i in 0..nblocks {
        let bid = BlockId(i);
        if fb.func().blocks[bid.index()].terminator.is_some() {
            continue;
        }
        fb.switch_to(bid);
        match sh.types.type_of(ret_ty).clone() {
            Type::Primitive(PrimKind::Nil) => fb.ret(None),
            Type::Primitive(PrimKind::F32) => {
                let z = fb.fresh_reg(ret_ty);
                fb.push(Op::ConstFloat { dst: z, value: 0.0 });
                fb.ret(Some(z));
            }
            Type::Primitive(PrimKind::F64) => {
                let z = fb.const_double(0.0, ret_ty);
                fb.ret(Some(z));
            }
            Type::Primitive(_) => {
                let z = fb.const_int(0, ret_ty);
                fb.ret(Some(z));
            }
            _ => {
                let z = fb.const_nil(ret_ty);
                fb.ret(Some(z));
            }
        }
    }
    Ok(())
}
