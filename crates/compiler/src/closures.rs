//! # Closure Conversion
//!
//! A block literal lowers to three things: a synthetic class holding each
//! captured cell (or copied primitive), a synthetic `call` method carrying
//! the block body, and an allocation at the creation site that installs the
//! captured values. Mutation of a by-cell capture stays visible through the
//! shared cell.

use crate::anvil::*;
use crate::anvil_builder::FunctionBuilder;
use crate::lowering::{seal_function, FnLower, Pending, Place, Shared};
use crate::resolver::CaptureMode;
use crate::CompilerResult;
use ember_typed_ast::{
    ClassId, LayoutKind, SerializationPolicy, Span, Type, TypeHandle, TypedBody, TypedExpr,
    TypedParam, TypedStmt,
};
use indexmap::IndexMap;

/// Lower a block literal at its creation site. Returns the closure object
/// register (typed as the synthetic class).
pub(crate) fn lower_block_literal<'s, 'p>(
    fl: &mut FnLower<'s, 'p>,
    params: &'p [TypedParam],
    body: &'p TypedBody,
    block_ty: TypeHandle,
) -> CompilerResult<RegId> {
    let capture_index = fl.capture_cursor;
    let captures = fl.sh.res.captures[&fl.capture_host][capture_index]
        .captures
        .clone();
    // This literal plus every literal nested inside it occupy a contiguous
    // pre-order run of the host's capture list.
    fl.capture_cursor += 1 + count_blocks(body);

    let ret = match fl.sh.types.type_of(block_ty) {
        Type::Block { ret, .. } => *ret,
        _ => fl.sh.types.nil_type(),
    };

    // Synthesize the capture class.
    let object = fl.sh.types.builtins().object;
    let host_name = fl.sh.arena.resolve(fl.b.func().name).to_string();
    let class_name = fl.sh.arena.intern(format!("{host_name}$block{capture_index}"));
    let class = fl
        .sh
        .types
        .register_class(class_name, Some(object), LayoutKind::Object, 0);

    let cell_ty = fl.sh.cell_type();
    let field_tys: Vec<(ember_typed_ast::Symbol, TypeHandle)> = captures
        .iter()
        .map(|c| {
            let ty = match c.mode {
                CaptureMode::ByCopy => c.ty,
                CaptureMode::ByCell => cell_ty,
            };
            (c.name, ty)
        })
        .collect();
    let layout = fl.sh.types.compute_layout(LayoutKind::Object, &field_tys);
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
    fl.sh.types.set_layout(class, layout);

    let call_fid = fl.sh.fresh_fn();
    let object_desc = fl.sh.module.class(object).expect("Object descriptor").clone();
    let mut methods: IndexMap<(ember_typed_ast::Symbol, u8), MethodHandle> =
        object_desc.methods.clone();
    let mut vtable = object_desc.vtable.clone();
    let call_slot = vtable.len() as u16;
    vtable.push(VTableEntry {
        name: fl.sh.wk.call,
        arity: params.len() as u8,
        class,
        function: call_fid,
    });
    methods.insert(
        (fl.sh.wk.call, params.len() as u8),
        MethodHandle {
            owner: class,
            name: fl.sh.wk.call,
            params: params.iter().map(|p| p.ty).collect(),
            ret,
            function: Some(call_fid),
            dispatch: DispatchMode::Virtual,
            throws: vec![],
            vtable_slot: Some(call_slot),
        },
    );
    fl.sh.module.add_class(ClassDescriptor {
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

    fl.sh.queue.push_back(Pending::BlockBody {
        fid: call_fid,
        class,
        host: fl.capture_host,
        capture_index,
        params,
        body,
        ret,
    });

    // Creation site: allocate and install the environment.
    let class_ty = fl.sh.types.class_type(class);
    let obj = fl.b.new_object(class, vec![], class_ty);
    for (slot, capture) in captures.iter().enumerate() {
        let value = match capture.mode {
            CaptureMode::ByCopy => fl.read_binding(capture.binding)?,
            CaptureMode::ByCell => read_capture_cell(fl, capture.binding)?,
        };
        fl.b.set_field(obj, class, slot as u16, value);
    }
    Ok(obj)
}

/// The cell object itself (not its contents), for installing into a closure
/// environment.
fn read_capture_cell<'s, 'p>(
    fl: &mut FnLower<'s, 'p>,
    binding: ember_typed_ast::BindingId,
) -> CompilerResult<RegId> {
    let place = *fl.bindings.get(&binding).ok_or_else(|| crate::CompilerError::Lowering {
        message: format!("unresolved captured binding {binding:?}"),
        span: None,
    })?;
    let cell_ty = fl.sh.cell_type();
    Ok(match place {
        Place::Local { id, cell: true } => fl.b.load_local(id),
        Place::Field { slot, cell: true, class } => {
            let this = fl.b.load_local(LocalId(0));
            fl.b.get_field(this, class, slot, cell_ty)
        }
        // The resolver classified this by-cell; a non-cell place here is a
        // lowering bug.
        _ => {
            return Err(crate::CompilerError::Lowering {
                message: "by-cell capture of a binding without a cell".into(),
                span: None,
            })
        }
    })
}

/// Lower the deferred `call` method of a block-literal class.
#[allow(clippy::too_many_arguments)]
pub(crate) fn lower_block_body<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    class: ClassId,
    host: FunctionId,
    capture_index: usize,
    params: &'p [TypedParam],
    body: &'p TypedBody,
    ret: TypeHandle,
) -> CompilerResult<()> {
    let class_ty = sh.types.class_type(class);
    let mut fn_params = vec![class_ty];
    fn_params.extend(params.iter().map(|p| p.ty));
    let name = sh.wk.call;
    let builder = FunctionBuilder::new(
        fid,
        name,
        fn_params,
        ret,
        FunctionKind::Plain,
        Span::empty(0),
    );

    let captures = sh.res.captures[&host][capture_index].captures.clone();
    let mut fl = FnLower::new(sh, fid, builder, Some(class_ty), ret, host);
    fl.in_closure = true;
    // The body consumes the host list right after this block's own entry.
    fl.capture_cursor = capture_index + 1;
    fl.install_param_list(params, Some(class_ty))?;

    for (slot, capture) in captures.iter().enumerate() {
        fl.bindings.insert(
            capture.binding,
            Place::Field {
                slot: slot as u16,
                cell: capture.mode == CaptureMode::ByCell,
                class,
            },
        );
    }

    fl.lower_body(body)?;
    let mut fb = fl.finish();
    seal_function(&mut fb, sh)?;
    sh.module.add_function(fb.finish());
    Ok(())
}

/// Number of block literals anywhere inside a body, including nested ones.
pub(crate) fn count_blocks(body: &TypedBody) -> usize {
    let mut count = 0;
    walk_body(body, &mut count);
    count
}

fn walk_body(body: &TypedBody, count: &mut usize) {
    for stmt in &body.statements {
        walk_stmt(&stmt.node, count);
    }
}

fn walk_stmt(stmt: &TypedStmt, count: &mut usize) {
    use ember_typed_ast::AssignTarget;
    match stmt {
        TypedStmt::Expr(e) | TypedStmt::Throw(e) | TypedStmt::Yield(e) => walk_expr(&e.node, count),
        TypedStmt::Let { value, .. } | TypedStmt::Using { value, .. } => {
            walk_expr(&value.node, count);
            if let TypedStmt::Using { body, .. } = stmt {
                walk_body(body, count);
            }
        }
        TypedStmt::Assign { target, value } => {
            match target {
                AssignTarget::Field { object, .. } => walk_expr(&object.node, count),
                AssignTarget::Index { object, index } => {
                    walk_expr(&object.node, count);
                    walk_expr(&index.node, count);
                }
                AssignTarget::Local { .. } => {}
            }
            walk_expr(&value.node, count);
        }
        TypedStmt::Return(Some(v)) => walk_expr(&v.node, count),
        TypedStmt::Return(None) | TypedStmt::Break | TypedStmt::Continue => {}
        TypedStmt::If {
            cond,
            then_body,
            else_body,
        } => {
            walk_expr(&cond.node, count);
            walk_body(then_body, count);
            if let Some(e) = else_body {
                walk_body(e, count);
            }
        }
        TypedStmt::While { cond, body } => {
            walk_expr(&cond.node, count);
            walk_body(body, count);
        }
        TypedStmt::For { iterable, body, .. } => {
            walk_expr(&iterable.node, count);
            walk_body(body, count);
        }
        TypedStmt::Match {
            scrutinee,
            arms,
            default,
        } => {
            walk_expr(&scrutinee.node, count);
            for arm in arms {
                if let Some(g) = &arm.guard {
                    walk_expr(&g.node, count);
                }
                walk_body(&arm.body, count);
            }
            if let Some(d) = default {
                walk_body(d, count);
            }
        }
        TypedStmt::Try {
            body,
            catches,
            finally,
        } => {
            walk_body(body, count);
            for c in catches {
                walk_body(&c.body, count);
            }
            if let Some(f) = finally {
                walk_body(f, count);
            }
        }
    }
}

fn walk_expr(expr: &TypedExpr, count: &mut usize) {
    if let TypedExpr::BlockLit { body, .. } = expr {
        *count += 1;
        walk_body(body, count);
        return;
    }
    use ember_typed_ast::InterpPart;
    match expr {
        TypedExpr::FieldGet { object, .. } => walk_expr(&object.node, count),
        TypedExpr::StaticCall { args, .. } | TypedExpr::FreeCall { args, .. } => {
            args.iter().for_each(|a| walk_expr(&a.node, count))
        }
        TypedExpr::MethodCall { receiver, args, .. } => {
            walk_expr(&receiver.node, count);
            args.iter().for_each(|a| walk_expr(&a.node, count));
        }
        TypedExpr::New { args, .. } => args.iter().for_each(|a| walk_expr(&a.node, count)),
        TypedExpr::Binary { lhs, rhs, .. } | TypedExpr::Logical { lhs, rhs, .. } => {
            walk_expr(&lhs.node, count);
            walk_expr(&rhs.node, count);
        }
        TypedExpr::Unary { operand, .. } => walk_expr(&operand.node, count),
        TypedExpr::Convert { value, .. } => walk_expr(&value.node, count),
        TypedExpr::Index { object, index } => {
            walk_expr(&object.node, count);
            walk_expr(&index.node, count);
        }
        TypedExpr::ArrayLit(elems) | TypedExpr::TupleLit(elems) => {
            elems.iter().for_each(|e| walk_expr(&e.node, count))
        }
        TypedExpr::HashLit(pairs) => {
            for (k, v) in pairs {
                walk_expr(&k.node, count);
                walk_expr(&v.node, count);
            }
        }
        TypedExpr::Range { lo, hi } => {
            walk_expr(&lo.node, count);
            walk_expr(&hi.node, count);
        }
        TypedExpr::BlockCall { callee, args } => {
            walk_expr(&callee.node, count);
            args.iter().for_each(|a| walk_expr(&a.node, count));
        }
        TypedExpr::Await(inner) => walk_expr(&inner.node, count),
        TypedExpr::StringInterp { parts } => {
            for p in parts {
                if let InterpPart::Expr(e) = p {
                    walk_expr(&e.node, count);
                }
            }
        }
        _ => {}
    }
}
