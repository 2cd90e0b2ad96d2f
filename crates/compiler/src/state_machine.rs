//! # Generator and Async State Machines
//!
//! A function containing `yield` lowers to a class with a `state: i32`
//! field, one field per local that lives across suspension points, and a
//! `next()` body that dispatches on `state`. An async function lowers the
//! same way, except resumption is driven by the runtime executor and the
//! result is delivered through a `Future` created on entry; exceptions
//! inside the body fail that future.
//!
//! This pass emits the object-aware skeleton: the dispatch switch, the
//! field spills around each suspension, and the suspend terminators. The
//! low lowering maps `yield_suspend` to a plain return and `await_suspend`
//! to `future_register_continuation` plus a return.

use crate::anvil::*;
use crate::anvil_builder::FunctionBuilder;
use crate::lowering::{seal_function, FnLower, Place, Shared};
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{
    ClassId, Expr, InterpPart, LayoutKind, PrimKind, SerializationPolicy, Span, Symbol, Type,
    TypeHandle, TypedBody, TypedExpr, TypedFunction, TypedStmt,
};
use indexmap::IndexMap;

/// The distinguished "done" state.
pub const DONE_STATE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    Generator,
    Async,
}

/// Lowering context of one state-machine body.
pub struct Machine {
    pub kind: MachineKind,
    pub class: ClassId,
    pub class_ty: TypeHandle,
    pub state_slot: u16,
    pub future_slot: Option<u16>,
    /// Slot holding the enclosing instance for generator/async methods.
    pub outer_self: Option<(u16, TypeHandle)>,
    /// Generator element type, or the async `T` of `Future<T>`.
    pub result_ty: TypeHandle,
    pub suspend_counter: i64,
    pub resume_arms: Vec<(i64, BlockId)>,
    pub await_slots: Vec<(u16, TypeHandle)>,
    pub await_cursor: usize,
    pub scratch_slots: Vec<(u16, TypeHandle)>,
    pub scratch_cursor: usize,
}

impl Machine {
    pub fn next_scratch(&mut self) -> (u16, TypeHandle) {
        let entry = self.scratch_slots[self.scratch_cursor];
        self.scratch_cursor += 1;
        entry
    }
}

pub fn is_generator(func: &TypedFunction) -> bool {
    func.body.as_ref().map_or(false, body_has_yield)
}

fn body_has_yield(body: &TypedBody) -> bool {
    let mut found = false;
    visit_suspends(body, &mut |s| {
        if matches!(s, Suspend::Yield) {
            found = true;
        }
    });
    found
}

/// Does this body contain a suspension point (not entering block literals)?
pub(crate) fn body_has_suspend(body: &TypedBody) -> bool {
    let mut found = false;
    visit_suspends(body, &mut |_| found = true);
    found
}

enum Suspend {
    Yield,
    Await,
}

fn visit_suspends(body: &TypedBody, f: &mut impl FnMut(&Suspend)) {
    for stmt in &body.statements {
        match &stmt.node {
            TypedStmt::Yield(_) => f(&Suspend::Yield),
            TypedStmt::Expr(e) | TypedStmt::Throw(e) => expr_suspends(e, f),
            TypedStmt::Let { value, .. } => expr_suspends(value, f),
            TypedStmt::Assign { value, .. } => expr_suspends(value, f),
            TypedStmt::Return(Some(v)) => expr_suspends(v, f),
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                expr_suspends(cond, f);
                visit_suspends(then_body, f);
                if let Some(e) = else_body {
                    visit_suspends(e, f);
                }
            }
            TypedStmt::While { cond, body } => {
                expr_suspends(cond, f);
                visit_suspends(body, f);
            }
            TypedStmt::For { iterable, body, .. } => {
                expr_suspends(iterable, f);
                visit_suspends(body, f);
            }
            TypedStmt::Match {
                scrutinee,
                arms,
                default,
            } => {
                expr_suspends(scrutinee, f);
                for arm in arms {
                    if let Some(g) = &arm.guard {
                        expr_suspends(g, f);
                    }
                    visit_suspends(&arm.body, f);
                }
                if let Some(d) = default {
                    visit_suspends(d, f);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                visit_suspends(body, f);
                for c in catches {
                    visit_suspends(&c.body, f);
                }
                if let Some(fin) = finally {
                    visit_suspends(fin, f);
                }
            }
            TypedStmt::Using { value, body, .. } => {
                expr_suspends(value, f);
                visit_suspends(body, f);
            }
            _ => {}
        }
    }
}

fn expr_suspends(expr: &Expr, f: &mut impl FnMut(&Suspend)) {
    match &expr.node {
        TypedExpr::Await(inner) => {
            expr_suspends(inner, f);
            f(&Suspend::Await);
        }
        TypedExpr::BlockLit { .. } => {}
        TypedExpr::FieldGet { object, .. } => expr_suspends(object, f),
        TypedExpr::StaticCall { args, .. } | TypedExpr::FreeCall { args, .. } => {
            args.iter().for_each(|a| expr_suspends(a, f))
        }
        TypedExpr::MethodCall { receiver, args, .. } => {
            expr_suspends(receiver, f);
            args.iter().for_each(|a| expr_suspends(a, f));
        }
        TypedExpr::New { args, .. } => args.iter().for_each(|a| expr_suspends(a, f)),
        TypedExpr::Binary { lhs, rhs, .. } | TypedExpr::Logical { lhs, rhs, .. } => {
            expr_suspends(lhs, f);
            expr_suspends(rhs, f);
        }
        TypedExpr::Unary { operand, .. } => expr_suspends(operand, f),
        TypedExpr::Convert { value, .. } => expr_suspends(value, f),
        TypedExpr::Index { object, index } => {
            expr_suspends(object, f);
            expr_suspends(index, f);
        }
        TypedExpr::ArrayLit(elems) | TypedExpr::TupleLit(elems) => {
            elems.iter().for_each(|e| expr_suspends(e, f))
        }
        TypedExpr::HashLit(pairs) => {
            for (k, v) in pairs {
                expr_suspends(k, f);
                expr_suspends(v, f);
            }
        }
        TypedExpr::Range { lo, hi } => {
            expr_suspends(lo, f);
            expr_suspends(hi, f);
        }
        TypedExpr::BlockCall { callee, args } => {
            expr_suspends(callee, f);
            args.iter().for_each(|a| expr_suspends(a, f));
        }
        TypedExpr::StringInterp { parts } => {
            for p in parts {
                if let InterpPart::Expr(e) = p {
                    expr_suspends(e, f);
                }
            }
        }
        _ => {}
    }
}

/// Await operand types, in suspension order.
fn collect_await_types(body: &TypedBody, out: &mut Vec<TypeHandle>) {
    visit_await_exprs(body, &mut |inner_ty| out.push(inner_ty));
}

fn visit_await_exprs(body: &TypedBody, f: &mut impl FnMut(TypeHandle)) {
    visit_suspend_exprs(body, f);
}

fn visit_suspend_exprs(body: &TypedBody, f: &mut impl FnMut(TypeHandle)) {
    // Reuse the suspend traversal: the await operand type is what we spill.
    for stmt in &body.statements {
        match &stmt.node {
            TypedStmt::Expr(e) | TypedStmt::Throw(e) => expr_awaits(e, f),
            TypedStmt::Let { value, .. } | TypedStmt::Assign { value, .. } => expr_awaits(value, f),
            TypedStmt::Return(Some(v)) => expr_awaits(v, f),
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                expr_awaits(cond, f);
                visit_suspend_exprs(then_body, f);
                if let Some(e) = else_body {
                    visit_suspend_exprs(e, f);
                }
            }
            TypedStmt::While { cond, body } => {
                expr_awaits(cond, f);
                visit_suspend_exprs(body, f);
            }
            TypedStmt::For { iterable, body, .. } => {
                expr_awaits(iterable, f);
                visit_suspend_exprs(body, f);
            }
            TypedStmt::Match {
                scrutinee,
                arms,
                default,
            } => {
                expr_awaits(scrutinee, f);
                for arm in arms {
                    if let Some(g) = &arm.guard {
                        expr_awaits(g, f);
                    }
                    visit_suspend_exprs(&arm.body, f);
                }
                if let Some(d) = default {
                    visit_suspend_exprs(d, f);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                visit_suspend_exprs(body, f);
                for c in catches {
                    visit_suspend_exprs(&c.body, f);
                }
                if let Some(fin) = finally {
                    visit_suspend_exprs(fin, f);
                }
            }
            TypedStmt::Using { value, body, .. } => {
                expr_awaits(value, f);
                visit_suspend_exprs(body, f);
            }
            _ => {}
        }
    }
}

fn expr_awaits(expr: &Expr, f: &mut impl FnMut(TypeHandle)) {
    match &expr.node {
        TypedExpr::Await(inner) => {
            expr_awaits(inner, f);
            f(inner.ty);
        }
        TypedExpr::BlockLit { .. } => {}
        node => {
            crate::resolver::each_child_expr(node, &mut |child| expr_awaits(child, f));
        }
    }
}

/// Scratch slots needed by suspend-crossing loops, in lowering order.
fn collect_loop_scratch(sh: &mut Shared<'_>, body: &TypedBody, out: &mut Vec<TypeHandle>) {
    for stmt in &body.statements {
        match &stmt.node {
            TypedStmt::For { iterable, body, .. } => {
                if body_has_suspend(body) {
                    let i64_ty = sh.types.primitive(PrimKind::I64);
                    match sh.types.type_of(iterable.ty).clone() {
                        Type::Range => {
                            // Loop bound.
                            out.push(i64_ty);
                        }
                        Type::Array(_) => {
                            // Array, length, index.
                            out.push(iterable.ty);
                            out.push(i64_ty);
                            out.push(i64_ty);
                        }
                        _ => {
                            // Iterator object.
                            out.push(iterable.ty);
                        }
                    }
                }
                collect_loop_scratch(sh, body, out);
            }
            TypedStmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_loop_scratch(sh, then_body, out);
                if let Some(e) = else_body {
                    collect_loop_scratch(sh, e, out);
                }
            }
            TypedStmt::While { body, .. } => collect_loop_scratch(sh, body, out),
            TypedStmt::Match { arms, default, .. } => {
                for arm in arms {
                    collect_loop_scratch(sh, &arm.body, out);
                }
                if let Some(d) = default {
                    collect_loop_scratch(sh, d, out);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                collect_loop_scratch(sh, body, out);
                for c in catches {
                    collect_loop_scratch(sh, &c.body, out);
                }
                if let Some(fin) = finally {
                    collect_loop_scratch(sh, fin, out);
                }
            }
            TypedStmt::Using { body, .. } => collect_loop_scratch(sh, body, out),
            _ => {}
        }
    }
}

struct MachineClass {
    class: ClassId,
    class_ty: TypeHandle,
    state_slot: u16,
    outer_self: Option<(u16, TypeHandle)>,
    future_slot: Option<u16>,
    binding_slots: Vec<(ember_typed_ast::BindingId, u16, bool)>,
    await_slots: Vec<(u16, TypeHandle)>,
    scratch_slots: Vec<(u16, TypeHandle)>,
    body_fids: BodyFids,
}

struct BodyFids {
    next_or_resume: FunctionId,
    has_next: Option<FunctionId>,
}

/// Build the state-machine class: fields, layout, descriptor, method ids.
fn build_machine_class<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    owner: Option<ClassId>,
    func: &'p TypedFunction,
    kind: MachineKind,
    result_ty: TypeHandle,
) -> CompilerResult<MachineClass> {
    let object = sh.types.builtins().object;
    let base = sh.arena.resolve(func.name).to_string();
    let suffix = match kind {
        MachineKind::Generator => "generator",
        MachineKind::Async => "async",
    };
    let class_name = sh.arena.intern(format!("{base}${suffix}"));
    let class = sh
        .types
        .register_class(class_name, Some(object), LayoutKind::Object, 0);
    let class_ty = sh.types.class_type(class);

    let cells = sh.res.cell_bindings.get(&fid).cloned().unwrap_or_default();
    let i32_ty = sh.types.primitive(PrimKind::I32);
    let cell_ty = sh.cell_type();

    let mut field_tys: Vec<(Symbol, TypeHandle)> = Vec::new();
    let state_name = sh.arena.intern("state");
    field_tys.push((state_name, i32_ty));
    let state_slot = 0u16;

    let outer_self = match owner.filter(|_| !func.is_static) {
        Some(c) => {
            let ty = sh.types.class_type(c);
            let name = sh.arena.intern("__self");
            let slot = field_tys.len() as u16;
            field_tys.push((name, ty));
            Some((slot, ty))
        }
        None => None,
    };

    let future_slot = match kind {
        MachineKind::Async => {
            let fut_ty = sh.types.intern(Type::Future(result_ty));
            let name = sh.arena.intern("__future");
            let slot = field_tys.len() as u16;
            field_tys.push((name, fut_ty));
            Some(slot)
        }
        MachineKind::Generator => None,
    };

    let locals = sh.res.locals.get(&fid).cloned().unwrap_or_default();
    let mut binding_slots = Vec::new();
    for decl in &locals.slots {
        let is_cell = cells.contains(&decl.binding);
        let ty = if is_cell { cell_ty } else { decl.ty };
        let slot = field_tys.len() as u16;
        field_tys.push((decl.name, ty));
        binding_slots.push((decl.binding, slot, is_cell));
    }

    let mut await_tys = Vec::new();
    if kind == MachineKind::Async {
        if let Some(body) = &func.body {
            collect_await_types(body, &mut await_tys);
        }
    }
    let mut await_slots = Vec::new();
    for (i, ty) in await_tys.iter().enumerate() {
        let name = sh.arena.intern(format!("__await{i}"));
        let slot = field_tys.len() as u16;
        field_tys.push((name, *ty));
        await_slots.push((slot, *ty));
    }

    let mut scratch_tys = Vec::new();
    if let Some(body) = &func.body {
        collect_loop_scratch(sh, body, &mut scratch_tys);
    }
    let mut scratch_slots = Vec::new();
    for (i, ty) in scratch_tys.iter().enumerate() {
        let name = sh.arena.intern(format!("__tmp{i}"));
        let slot = field_tys.len() as u16;
        field_tys.push((name, *ty));
        scratch_slots.push((slot, *ty));
    }

    let layout = sh.types.compute_layout(LayoutKind::Object, &field_tys);
    let fields: Vec<FieldSlot> = field_tys
        .iter()
        .zip(layout.fields.iter())
        .map(|(&(name, ty), lf)| FieldSlot {
            name,
            ty,
            offset: lf.offset,
            json_key: None,
            declared_in: class,
            erased: false,
        })
        .collect();
    sh.types.set_layout(class, layout);

    // Methods: the iteration protocol for generators, `resume` for async.
    let object_desc = sh.module.class(object).expect("Object descriptor").clone();
    let mut methods: IndexMap<(Symbol, u8), MethodHandle> = object_desc.methods.clone();
    let mut vtable = object_desc.vtable.clone();
    let nil_ty = sh.types.nil_type();

    let mut add_virtual = |sh: &mut Shared<'p>,
                           methods: &mut IndexMap<(Symbol, u8), MethodHandle>,
                           vtable: &mut Vec<VTableEntry>,
                           name: Symbol,
                           ret: TypeHandle|
     -> FunctionId {
        let f = sh.fresh_fn();
        let slot = vtable.len() as u16;
        vtable.push(VTableEntry {
            name,
            arity: 0,
            class,
            function: f,
        });
        methods.insert(
            (name, 0),
            MethodHandle {
                owner: class,
                name,
                params: vec![],
                ret,
                function: Some(f),
                dispatch: DispatchMode::Virtual,
                throws: vec![],
                vtable_slot: Some(slot),
            },
        );
        f
    };

    let (next_sym, has_next_sym, resume_sym) = (sh.wk.next, sh.wk.has_next, sh.wk.resume);
    let body_fids = match kind {
        MachineKind::Generator => {
            let bool_ty = sh.types.bool_type();
            let next = add_virtual(sh, &mut methods, &mut vtable, next_sym, result_ty);
            let has_next = add_virtual(sh, &mut methods, &mut vtable, has_next_sym, bool_ty);
            BodyFids {
                next_or_resume: next,
                has_next: Some(has_next),
            }
        }
        MachineKind::Async => {
            let resume = add_virtual(sh, &mut methods, &mut vtable, resume_sym, nil_ty);
            BodyFids {
                next_or_resume: resume,
                has_next: None,
            }
        }
    };

    sh.module.add_class(ClassDescriptor {
        id: class,
        name: class_name,
        parent: Some(object),
        fields,
        methods,
        vtable,
        layout_kind: LayoutKind::Object,
        serialization: SerializationPolicy::None,
        ffi: None,
    });

    Ok(MachineClass {
        class,
        class_ty,
        state_slot,
        outer_self,
        future_slot,
        binding_slots,
        await_slots,
        scratch_slots,
        body_fids,
    })
}

/// Factory: allocate the machine, seed its fields, return it (generators)
/// or kick off `resume` and return the future (async).
fn lower_factory<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    func: &'p TypedFunction,
    mc: &MachineClass,
    kind: MachineKind,
    result_ty: TypeHandle,
) -> CompilerResult<()> {
    let self_ty = mc.outer_self.map(|(_, ty)| ty);
    let mut params: Vec<TypeHandle> = Vec::new();
    if let Some(st) = self_ty {
        params.push(st);
    }
    params.extend(func.params.iter().map(|p| p.ty));

    let mut fb = FunctionBuilder::new(
        fid,
        func.name,
        params,
        func.return_type,
        FunctionKind::Plain,
        func.span,
    );
    let mut local_idx = 0u32;
    if let Some(st) = self_ty {
        fb.add_local(sh.wk.self_, st);
        local_idx += 1;
    }
    let param_base = local_idx;
    for p in &func.params {
        fb.add_local(p.name, p.ty);
    }

    let obj = fb.new_object(mc.class, vec![], mc.class_ty);
    let i32_ty = sh.types.primitive(PrimKind::I32);
    let zero = fb.const_int(0, i32_ty);
    fb.set_field(obj, mc.class, mc.state_slot, zero);

    if let Some((slot, _)) = mc.outer_self {
        let this = fb.load_local(LocalId(0));
        fb.set_field(obj, mc.class, slot, this);
    }

    // Seed parameter fields; cell-classified parameters go in via a cell.
    for (i, p) in func.params.iter().enumerate() {
        let entry = mc
            .binding_slots
            .iter()
            .find(|(b, _, _)| *b == p.binding)
            .copied();
        if let Some((_, slot, is_cell)) = entry {
            let v = fb.load_local(LocalId(param_base + i as u32));
            if is_cell {
                let cell_ty = sh.cell_type();
                let cell = fb.fresh_reg(cell_ty);
                fb.push(Op::NewCell { dst: cell, ty: p.ty });
                fb.push(Op::CellSet { cell, value: v });
                fb.set_field(obj, mc.class, slot, cell);
            } else {
                fb.set_field(obj, mc.class, slot, v);
            }
        }
    }
    // Remaining cell bindings (body locals) get fresh cells up front.
    for &(binding, slot, is_cell) in &mc.binding_slots {
        if is_cell && !func.params.iter().any(|p| p.binding == binding) {
            let ty = sh
                .res
                .binding_types
                .get(&binding)
                .copied()
                .unwrap_or_else(|| sh.types.nil_type());
            let cell_ty = sh.cell_type();
            let cell = fb.fresh_reg(cell_ty);
            fb.push(Op::NewCell { dst: cell, ty });
            fb.set_field(obj, mc.class, slot, cell);
        }
    }

    match kind {
        MachineKind::Generator => {
            fb.ret(Some(obj));
        }
        MachineKind::Async => {
            let fut_ty = sh.types.intern(Type::Future(result_ty));
            let fut = fb
                .call_intrinsic(Intrinsic::FutureNew, vec![obj], Some(fut_ty))
                .expect("future_new returns");
            fb.set_field(obj, mc.class, mc.future_slot.expect("async future slot"), fut);
            // Run synchronously up to the first await.
            let resume_slot = sh
                .module
                .class(mc.class)
                .and_then(|d| d.methods.get(&(sh.wk.resume, 0)).and_then(|m| m.vtable_slot))
                .expect("resume slot");
            fb.call_virtual(mc.class, resume_slot, vec![obj], None);
            fb.ret(Some(fut));
        }
    }
    sh.module.add_function(fb.finish());
    Ok(())
}

pub(crate) fn lower_generator<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    owner: Option<ClassId>,
    func: &'p TypedFunction,
) -> CompilerResult<()> {
    let body = func.body.as_ref().expect("generator has a body");
    let elem_ty = first_yield_type(body).ok_or_else(|| CompilerError::Lowering {
        message: "generator without a yield".into(),
        span: Some(func.span),
    })?;

    let mc = build_machine_class(sh, fid, owner, func, MachineKind::Generator, elem_ty)?;
    lower_factory(sh, fid, func, &mc, MachineKind::Generator, elem_ty)?;
    lower_machine_body(sh, fid, func, &mc, MachineKind::Generator, elem_ty)?;
    lower_has_next(sh, &mc)?;
    Ok(())
}

pub(crate) fn lower_async<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    owner: Option<ClassId>,
    func: &'p TypedFunction,
) -> CompilerResult<()> {
    let result_ty = match sh.types.type_of(func.return_type) {
        Type::Future(t) => *t,
        _ => {
            return Err(CompilerError::InputContract {
                message: "async function not typed as returning a Future".into(),
                span: func.span,
            })
        }
    };
    if let Some(body) = &func.body {
        validate_await_positions(body)?;
    }
    let mc = build_machine_class(sh, fid, owner, func, MachineKind::Async, result_ty)?;
    lower_factory(sh, fid, func, &mc, MachineKind::Async, result_ty)?;
    lower_machine_body(sh, fid, func, &mc, MachineKind::Async, result_ty)?;
    Ok(())
}

/// The canonical lowering requires an await to be the root of a statement
/// value (`let x = await e`, `x = await e`, `return await e`, or a bare
/// statement). Anything deeper would need temporaries to survive the
/// suspension.
fn validate_await_positions(body: &TypedBody) -> CompilerResult<()> {
    fn root_ok(expr: &Expr) -> bool {
        !expr_has_nested_await(expr, true)
    }
    fn expr_has_nested_await(expr: &Expr, at_root: bool) -> bool {
        match &expr.node {
            TypedExpr::Await(inner) => {
                if at_root {
                    expr_has_nested_await(inner, false)
                } else {
                    true
                }
            }
            TypedExpr::BlockLit { .. } => false,
            node => {
                let mut nested = false;
                crate::resolver::each_child_expr(node, &mut |child| {
                    if expr_has_nested_await(child, false) {
                        nested = true;
                    }
                });
                nested
            }
        }
    }

    let mut ok = true;
    fn check_body(body: &TypedBody, ok: &mut bool) {
        for stmt in &body.statements {
            match &stmt.node {
                TypedStmt::Expr(e)
                | TypedStmt::Let { value: e, .. }
                | TypedStmt::Assign { value: e, .. }
                | TypedStmt::Throw(e)
                | TypedStmt::Using { value: e, .. } => {
                    if !root_ok(e) {
                        *ok = false;
                    }
                }
                TypedStmt::Return(Some(e)) => {
                    if !root_ok(e) {
                        *ok = false;
                    }
                }
                _ => {}
            }
            match &stmt.node {
                TypedStmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    if expr_has_nested_await(cond, false) {
                        *ok = false;
                    }
                    check_body(then_body, ok);
                    if let Some(e) = else_body {
                        check_body(e, ok);
                    }
                }
                TypedStmt::While { cond, body } => {
                    if expr_has_nested_await(cond, false) {
                        *ok = false;
                    }
                    check_body(body, ok);
                }
                TypedStmt::For { iterable, body, .. } => {
                    if expr_has_nested_await(iterable, false) {
                        *ok = false;
                    }
                    check_body(body, ok);
                }
                TypedStmt::Match { arms, default, .. } => {
                    for arm in arms {
                        check_body(&arm.body, ok);
                    }
                    if let Some(d) = default {
                        check_body(d, ok);
                    }
                }
                TypedStmt::Try {
                    body,
                    catches,
                    finally,
                } => {
                    check_body(body, ok);
                    for c in catches {
                        check_body(&c.body, ok);
                    }
                    if let Some(f) = finally {
                        check_body(f, ok);
                    }
                }
                TypedStmt::Using { body, .. } => check_body(body, ok),
                _ => {}
            }
        }
    }
    check_body(body, &mut ok);
    if ok {
        Ok(())
    } else {
        Err(CompilerError::Unsupported {
            construct: "await inside a compound expression".into(),
        })
    }
}

fn first_yield_type(body: &TypedBody) -> Option<TypeHandle> {
    let mut found = None;
    fn walk(body: &TypedBody, found: &mut Option<TypeHandle>) {
        for stmt in &body.statements {
            if found.is_some() {
                return;
            }
            match &stmt.node {
                TypedStmt::Yield(v) => {
                    *found = Some(v.ty);
                    return;
                }
                TypedStmt::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    walk(then_body, found);
                    if let Some(e) = else_body {
                        walk(e, found);
                    }
                }
                TypedStmt::While { body, .. }
                | TypedStmt::For { body, .. }
                | TypedStmt::Using { body, .. } => walk(body, found),
                TypedStmt::Match { arms, default, .. } => {
                    for arm in arms {
                        walk(&arm.body, found);
                    }
                    if let Some(d) = default {
                        walk(d, found);
                    }
                }
                TypedStmt::Try {
                    body,
                    catches,
                    finally,
                } => {
                    walk(body, found);
                    for c in catches {
                        walk(&c.body, found);
                    }
                    if let Some(f) = finally {
                        walk(f, found);
                    }
                }
                _ => {}
            }
        }
    }
    walk(body, &mut found);
    found
}

/// The `next()`/`resume()` body: dispatch switch on entry, the source body
/// split at each suspension into case arms.
fn lower_machine_body<'p>(
    sh: &mut Shared<'p>,
    declared_fid: FunctionId,
    func: &'p TypedFunction,
    mc: &MachineClass,
    kind: MachineKind,
    result_ty: TypeHandle,
) -> CompilerResult<()> {
    let body = func.body.as_ref().expect("machine function has a body");
    let (fn_kind, name, ret) = match kind {
        MachineKind::Generator => (FunctionKind::Generator, sh.wk.next, result_ty),
        MachineKind::Async => (FunctionKind::Async, sh.wk.resume, sh.types.nil_type()),
    };
    let mut fb = FunctionBuilder::new(
        mc.body_fids.next_or_resume,
        name,
        vec![mc.class_ty],
        ret,
        fn_kind,
        func.span,
    );
    fb.add_local(sh.wk.self_, mc.class_ty);
    let start = fb.new_block();
    fb.switch_to(start);

    let fid = mc.body_fids.next_or_resume;
    // Block literals inside the body consume the declared function's
    // capture list, not the synthetic body's.
    let mut fl = FnLower::new(sh, fid, fb, Some(mc.class_ty), ret, declared_fid);
    fl.machine = Some(Machine {
        kind,
        class: mc.class,
        class_ty: mc.class_ty,
        state_slot: mc.state_slot,
        future_slot: mc.future_slot,
        outer_self: mc.outer_self,
        result_ty,
        suspend_counter: 1,
        resume_arms: Vec::new(),
        await_slots: mc.await_slots.clone(),
        await_cursor: 0,
        scratch_slots: mc.scratch_slots.clone(),
        scratch_cursor: 0,
    });
    for &(binding, slot, is_cell) in &mc.binding_slots {
        fl.bindings.insert(
            binding,
            Place::Field {
                slot,
                cell: is_cell,
                class: mc.class,
            },
        );
    }

    // Async bodies are wrapped in a catch-all region so a thrown exception
    // propagates as a failed future.
    let fail_region = match kind {
        MachineKind::Async => {
            let exception = fl.sh.types.builtins().exception;
            let exc_ty = fl.sh.types.class_type(exception);
            let region = fl.b.add_region(None, vec![start], vec![]);
            fl.region_stack.push(region);
            Some((region, exc_ty))
        }
        MachineKind::Generator => None,
    };

    fl.lower_body(body)?;
    if !fl.b.is_terminated() {
        lower_machine_return(&mut fl, None)?;
    }

    if fail_region.is_some() {
        fl.region_stack.pop();
    }

    let machine = fl.machine.take().expect("machine context");
    let mut fb = fl.finish();

    // Failure handler for async: fail the future, park in the done state.
    if let Some((region, exc_ty)) = fail_region {
        let handler = fb.new_block();
        fb.region_mut(region).catches = vec![CatchEntry {
            ty: exc_ty,
            handler,
        }];
        fb.switch_to(handler);
        let exc = fb.fresh_reg(exc_ty);
        fb.push(Op::CaughtException { dst: exc, ty: exc_ty });
        let this = fb.load_local(LocalId(0));
        let fut_slot = mc.future_slot.expect("async future slot");
        let fut_ty = sh.module.class(mc.class).expect("machine class").fields
            [fut_slot as usize]
            .ty;
        let fut = fb.get_field(this, mc.class, fut_slot, fut_ty);
        fb.call_intrinsic(Intrinsic::FutureFail, vec![fut, exc], None);
        let i32_ty = sh.types.primitive(PrimKind::I32);
        let done = fb.const_int(DONE_STATE, i32_ty);
        let this = fb.load_local(LocalId(0));
        fb.set_field(this, mc.class, mc.state_slot, done);
        fb.ret(None);
    }

    // Entry dispatch: switch on the state field.
    let done_blk = fb.new_block();
    fb.switch_to(done_blk);
    emit_done_return(&mut fb, sh, kind, result_ty);

    fb.switch_to(BlockId(0));
    let this = fb.load_local(LocalId(0));
    let i32_ty = sh.types.primitive(PrimKind::I32);
    let state = fb.get_field(this, mc.class, mc.state_slot, i32_ty);
    let mut cases = vec![(0i64, start)];
    cases.extend(machine.resume_arms.iter().copied());
    fb.terminate(Terminator::Switch {
        value: state,
        cases,
        default: done_blk,
    });

    seal_function(&mut fb, sh)?;
    sh.module.add_function(fb.finish());
    Ok(())
}

fn emit_done_return(
    fb: &mut FunctionBuilder,
    sh: &mut Shared<'_>,
    kind: MachineKind,
    result_ty: TypeHandle,
) {
    match kind {
        MachineKind::Async => fb.ret(None),
        MachineKind::Generator => match sh.types.type_of(result_ty).clone() {
            Type::Primitive(PrimKind::Nil) => fb.ret(None),
            Type::Primitive(PrimKind::F32) => {
                let z = fb.fresh_reg(result_ty);
                fb.push(Op::ConstFloat { dst: z, value: 0.0 });
                fb.ret(Some(z));
            }
            Type::Primitive(PrimKind::F64) => {
                let z = fb.const_double(0.0, result_ty);
                fb.ret(Some(z));
            }
            Type::Primitive(_) => {
                let z = fb.const_int(0, result_ty);
                fb.ret(Some(z));
            }
            _ => {
                let z = fb.const_nil(result_ty);
                fb.ret(Some(z));
            }
        },
    }
}

/// `has_next()`: state ≠ done.
fn lower_has_next<'p>(sh: &mut Shared<'p>, mc: &MachineClass) -> CompilerResult<()> {
    let fid = mc.body_fids.has_next.expect("generator has_next");
    let bool_ty = sh.types.bool_type();
    let i32_ty = sh.types.primitive(PrimKind::I32);
    let mut fb = FunctionBuilder::new(
        fid,
        sh.wk.has_next,
        vec![mc.class_ty],
        bool_ty,
        FunctionKind::Plain,
        Span::empty(0),
    );
    fb.add_local(sh.wk.self_, mc.class_ty);
    let this = fb.load_local(LocalId(0));
    let state = fb.get_field(this, mc.class, mc.state_slot, i32_ty);
    let done = fb.const_int(DONE_STATE, i32_ty);
    let more = fb.icmp(CmpPred::Ne, state, done, bool_ty);
    fb.ret(Some(more));
    sh.module.add_function(fb.finish());
    Ok(())
}

/// A `yield v` inside a generator body.
pub(crate) fn lower_yield_point<'s, 'p>(
    fl: &mut FnLower<'s, 'p>,
    value: RegId,
) -> CompilerResult<()> {
    let (class, state_slot, state) = {
        let m = fl.machine.as_mut().expect("yield in machine mode");
        let state = m.suspend_counter;
        m.suspend_counter += 1;
        (m.class, m.state_slot, state)
    };
    let resume = fl.b.new_block();
    if let Some(m) = fl.machine.as_mut() {
        m.resume_arms.push((state, resume));
    }

    let i32_ty = fl.sh.types.primitive(PrimKind::I32);
    let this = fl.b.load_local(LocalId(0));
    let next_state = fl.b.const_int(state, i32_ty);
    fl.b.set_field(this, class, state_slot, next_state);
    fl.b.terminate(Terminator::YieldSuspend {
        value,
        state: state as u32,
        resume,
    });
    fl.enter_block(resume);
    Ok(())
}

/// An `await e` at a statement root inside an async body.
pub(crate) fn lower_await_point<'s, 'p>(
    fl: &mut FnLower<'s, 'p>,
    inner: &'p Expr,
    result_ty: TypeHandle,
) -> CompilerResult<RegId> {
    let fut = fl.lower_expr(inner)?;
    let (class, state_slot, state, await_slot, await_ty) = {
        let m = fl.machine.as_mut().expect("await in machine mode");
        let state = m.suspend_counter;
        m.suspend_counter += 1;
        let (slot, ty) = m.await_slots[m.await_cursor];
        m.await_cursor += 1;
        (m.class, m.state_slot, state, slot, ty)
    };
    let resume = fl.b.new_block();
    if let Some(m) = fl.machine.as_mut() {
        m.resume_arms.push((state, resume));
    }

    let i32_ty = fl.sh.types.primitive(PrimKind::I32);
    let this = fl.b.load_local(LocalId(0));
    fl.b.set_field(this, class, await_slot, fut);
    let this = fl.b.load_local(LocalId(0));
    let next_state = fl.b.const_int(state, i32_ty);
    fl.b.set_field(this, class, state_slot, next_state);
    fl.b.terminate(Terminator::AwaitSuspend {
        future: fut,
        state: state as u32,
        resume,
    });

    // Resumption: the future has completed; read its value back.
    fl.enter_block(resume);
    let this = fl.b.load_local(LocalId(0));
    let fut = fl.b.get_field(this, class, await_slot, await_ty);
    let result = fl
        .b
        .call_intrinsic(Intrinsic::FutureValue, vec![fut], Some(result_ty))
        .expect("future_value returns");
    Ok(result)
}

/// `return` inside a machine body: complete the future (async) or park the
/// generator in the done state.
pub(crate) fn lower_machine_return<'s, 'p>(
    fl: &mut FnLower<'s, 'p>,
    value: Option<RegId>,
) -> CompilerResult<()> {
    let (kind, class, state_slot, future_slot, result_ty) = {
        let m = fl.machine.as_ref().expect("machine return");
        (m.kind, m.class, m.state_slot, m.future_slot, m.result_ty)
    };
    let i32_ty = fl.sh.types.primitive(PrimKind::I32);

    match kind {
        MachineKind::Async => {
            let fut_slot = future_slot.expect("async future slot");
            let fut_ty = fl.sh.module.class(class).expect("machine class").fields
                [fut_slot as usize]
                .ty;
            let this = fl.b.load_local(LocalId(0));
            let fut = fl.b.get_field(this, class, fut_slot, fut_ty);
            let value = match value {
                Some(v) => v,
                None => fl.b.const_nil(result_ty),
            };
            fl.b.call_intrinsic(Intrinsic::FutureComplete, vec![fut, value], None);
            let this = fl.b.load_local(LocalId(0));
            let done = fl.b.const_int(DONE_STATE, i32_ty);
            fl.b.set_field(this, class, state_slot, done);
            fl.b.ret(None);
        }
        MachineKind::Generator => {
            let this = fl.b.load_local(LocalId(0));
            let done = fl.b.const_int(DONE_STATE, i32_ty);
            fl.b.set_field(this, class, state_slot, done);
            // The in-flight next() call delivers a default value; has_next
            // is already false.
            let mut fb_default = None;
            match fl.sh.types.type_of(result_ty).clone() {
                Type::Primitive(PrimKind::Nil) => {
                    fl.b.ret(None);
                }
                Type::Primitive(PrimKind::F32) => {
                    let z = fl.b.fresh_reg(result_ty);
                    fl.b.push(Op::ConstFloat { dst: z, value: 0.0 });
                    fb_default = Some(z);
                }
                Type::Primitive(PrimKind::F64) => {
                    fb_default = Some(fl.b.const_double(0.0, result_ty));
                }
                Type::Primitive(_) => {
                    fb_default = Some(fl.b.const_int(0, result_ty));
                }
                _ => {
                    fb_default = Some(fl.b.const_nil(result_ty));
                }
            }
            if let Some(z) = fb_default {
                fl.b.ret(Some(z));
            }
        }
    }
    Ok(())
}
