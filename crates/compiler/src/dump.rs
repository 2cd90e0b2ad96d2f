//! # Anvil Module Listing
//!
//! Deterministic textual dump: one header line per function with its
//! signature, one line per basic block label, indented opcode lines with
//! typed operands. Two lowerings of the same input print identically.

use crate::anvil::*;
use ember_typed_ast::{StringArena, TypeContext};
use std::fmt::Write;

/// Render the whole module.
pub fn dump_module(module: &AnvilModule, arena: &StringArena, types: &TypeContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "module {}", arena.resolve(module.name));

    for desc in module.classes.values() {
        let parent = desc
            .parent
            .and_then(|p| module.classes.get(&p))
            .map(|p| arena.resolve(p.name).to_string());
        match parent {
            Some(p) => {
                let _ = writeln!(
                    out,
                    "class {} (#{}) : {} [{} fields, {} vtable slots]",
                    arena.resolve(desc.name),
                    desc.id.0,
                    p,
                    desc.fields.len(),
                    desc.vtable.len()
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "class {} (#{}) [{} fields, {} vtable slots]",
                    arena.resolve(desc.name),
                    desc.id.0,
                    desc.fields.len(),
                    desc.vtable.len()
                );
            }
        }
    }

    for func in module.functions_ordered() {
        dump_function(&mut out, module, func, arena, types);
    }
    out
}

fn dump_function(
    out: &mut String,
    module: &AnvilModule,
    func: &AnvilFunction,
    arena: &StringArena,
    types: &TypeContext,
) {
    let params: Vec<String> = func.params.iter().map(|p| types.display(*p, arena)).collect();
    let kind = match func.kind {
        FunctionKind::Plain => "",
        FunctionKind::Generator => " generator",
        FunctionKind::Async => " async",
    };
    let _ = writeln!(
        out,
        "\nfunc @{}{} {}({}) -> {} {{",
        func.id.0,
        kind,
        arena.resolve(func.name),
        params.join(", "),
        types.display(func.ret, arena)
    );

    if !func.locals.is_empty() {
        let locals: Vec<String> = func
            .locals
            .iter()
            .map(|l| format!("{}: {}", arena.resolve(l.name), types.display(l.ty, arena)))
            .collect();
        let _ = writeln!(out, "  locals: {}", locals.join(", "));
    }
    for (i, region) in func.try_regions.iter().enumerate() {
        let blocks: Vec<String> = region.blocks.iter().map(|b| format!("bb{}", b.0)).collect();
        let catches: Vec<String> = region
            .catches
            .iter()
            .map(|c| format!("{} -> bb{}", types.display(c.ty, arena), c.handler.0))
            .collect();
        let _ = writeln!(
            out,
            "  try region {i} [{}] catches: {}",
            blocks.join(", "),
            catches.join(", ")
        );
    }

    for (i, block) in func.blocks.iter().enumerate() {
        let _ = writeln!(out, "bb{i}:");
        for phi in &block.phis {
            let inc: Vec<String> = phi
                .incoming
                .iter()
                .map(|(b, r)| format!("[bb{}: r{}]", b.0, r.0))
                .collect();
            let _ = writeln!(
                out,
                "    r{} = phi {} : {}",
                phi.dst.0,
                inc.join(", "),
                types.display(phi.ty, arena)
            );
        }
        for op in &block.ops {
            let _ = writeln!(out, "    {}", fmt_op(op, module, func, arena, types));
        }
        match &block.terminator {
            Some(t) => {
                let _ = writeln!(out, "    {}", fmt_terminator(t));
            }
            None => {
                let _ = writeln!(out, "    <missing terminator>");
            }
        }
    }
    let _ = writeln!(out, "}}");
}

fn typed(dst: RegId, body: String, func: &AnvilFunction, arena: &StringArena, types: &TypeContext) -> String {
    format!(
        "r{} = {} : {}",
        dst.0,
        body,
        types.display(func.reg_type(dst), arena)
    )
}

fn class_name(class: ember_typed_ast::ClassId, module: &AnvilModule, arena: &StringArena) -> String {
    module
        .classes
        .get(&class)
        .map(|d| arena.resolve(d.name).to_string())
        .unwrap_or_else(|| format!("class#{}", class.0))
}

fn pred_name(pred: CmpPred) -> &'static str {
    match pred {
        CmpPred::Eq => "eq",
        CmpPred::Ne => "ne",
        CmpPred::Lt => "lt",
        CmpPred::Le => "le",
        CmpPred::Gt => "gt",
        CmpPred::Ge => "ge",
    }
}

fn args_list(args: &[RegId]) -> String {
    let parts: Vec<String> = args.iter().map(|a| format!("r{}", a.0)).collect();
    parts.join(", ")
}

fn fmt_op(
    op: &Op,
    module: &AnvilModule,
    func: &AnvilFunction,
    arena: &StringArena,
    types: &TypeContext,
) -> String {
    use Op::*;
    let t = |dst: RegId, body: String| typed(dst, body, func, arena, types);
    let opt = |dst: &Option<RegId>, body: String| match dst {
        Some(dst) => t(*dst, body),
        None => body,
    };
    match op {
        LoadLocal { dst, local } => t(*dst, format!("load_local l{}", local.0)),
        StoreLocal { local, src } => format!("store_local l{}, r{}", local.0, src.0),
        ConstInt { dst, value, .. } => t(*dst, format!("const_int {value}")),
        ConstFloat { dst, value } => t(*dst, format!("const_float {value}")),
        ConstDouble { dst, value } => t(*dst, format!("const_double {value}")),
        ConstString { dst, string } => t(
            *dst,
            format!("const_string {:?}", arena.resolve(module.string(*string))),
        ),
        ConstNil { dst, .. } => t(*dst, "const_nil".into()),
        ConstClass { dst, class } => t(*dst, format!("const_class {}", class_name(*class, module, arena))),
        ConstMethod { dst, class, name, arity } => t(
            *dst,
            format!(
                "const_method {}.{}/{}",
                class_name(*class, module, arena),
                arena.resolve(*name),
                arity
            ),
        ),
        IAdd { dst, lhs, rhs } => t(*dst, format!("iadd r{}, r{}", lhs.0, rhs.0)),
        ISub { dst, lhs, rhs } => t(*dst, format!("isub r{}, r{}", lhs.0, rhs.0)),
        IMul { dst, lhs, rhs } => t(*dst, format!("imul r{}, r{}", lhs.0, rhs.0)),
        IDiv { dst, lhs, rhs } => t(*dst, format!("idiv r{}, r{}", lhs.0, rhs.0)),
        IMod { dst, lhs, rhs } => t(*dst, format!("imod r{}, r{}", lhs.0, rhs.0)),
        INeg { dst, src } => t(*dst, format!("ineg r{}", src.0)),
        BitAnd { dst, lhs, rhs } => t(*dst, format!("band r{}, r{}", lhs.0, rhs.0)),
        BitOr { dst, lhs, rhs } => t(*dst, format!("bor r{}, r{}", lhs.0, rhs.0)),
        BitXor { dst, lhs, rhs } => t(*dst, format!("bxor r{}, r{}", lhs.0, rhs.0)),
        Shl { dst, lhs, rhs } => t(*dst, format!("shl r{}, r{}", lhs.0, rhs.0)),
        Shr { dst, lhs, rhs } => t(*dst, format!("shr r{}, r{}", lhs.0, rhs.0)),
        ICmp { dst, pred, lhs, rhs } => {
            t(*dst, format!("icmp.{} r{}, r{}", pred_name(*pred), lhs.0, rhs.0))
        }
        FAdd { dst, lhs, rhs } => t(*dst, format!("fadd r{}, r{}", lhs.0, rhs.0)),
        FSub { dst, lhs, rhs } => t(*dst, format!("fsub r{}, r{}", lhs.0, rhs.0)),
        FMul { dst, lhs, rhs } => t(*dst, format!("fmul r{}, r{}", lhs.0, rhs.0)),
        FDiv { dst, lhs, rhs } => t(*dst, format!("fdiv r{}, r{}", lhs.0, rhs.0)),
        FNeg { dst, src } => t(*dst, format!("fneg r{}", src.0)),
        FCmp { dst, pred, lhs, rhs } => {
            t(*dst, format!("fcmp.{} r{}, r{}", pred_name(*pred), lhs.0, rhs.0))
        }
        IntToFloat { dst, src } => t(*dst, format!("i_to_f r{}", src.0)),
        FloatToInt { dst, src } => t(*dst, format!("f_to_i r{}", src.0)),
        I32ToI64 { dst, src } => t(*dst, format!("i32_to_i64 r{}", src.0)),
        F32ToF64 { dst, src } => t(*dst, format!("f32_to_f64 r{}", src.0)),
        Box { dst, src, prim } => t(*dst, format!("box.{:?} r{}", prim, src.0)),
        Unbox { dst, src, class, prim } => t(
            *dst,
            format!("unbox.{:?} {} r{}", prim, class_name(*class, module, arena), src.0),
        ),
        New { dst, class, args } => t(
            *dst,
            format!("new {}({})", class_name(*class, module, arena), args_list(args)),
        ),
        GetField { dst, object, class, slot } => t(
            *dst,
            format!("get_field r{}, {}[{}]", object.0, class_name(*class, module, arena), slot),
        ),
        SetField { object, class, slot, value } => format!(
            "set_field r{}, {}[{}], r{}",
            object.0,
            class_name(*class, module, arena),
            slot,
            value.0
        ),
        LoadErased { dst, object, class, slot } => t(
            *dst,
            format!("load_erased r{}, {}[{}]", object.0, class_name(*class, module, arena), slot),
        ),
        StoreErased { object, class, slot, value } => format!(
            "store_erased r{}, {}[{}], r{}",
            object.0,
            class_name(*class, module, arena),
            slot,
            value.0
        ),
        InstanceOf { dst, object, class } => t(
            *dst,
            format!("instance_of r{}, {}", object.0, class_name(*class, module, arena)),
        ),
        ClassTag { dst, object } => t(*dst, format!("class_tag r{}", object.0)),
        RefEq { dst, lhs, rhs } => t(*dst, format!("ref_eq r{}, r{}", lhs.0, rhs.0)),
        RefCast { dst, src, class } => t(
            *dst,
            format!("ref_cast r{}, {}", src.0, class_name(*class, module, arena)),
        ),
        CaughtException { dst, .. } => t(*dst, "caught_exception".into()),
        CallStatic { dst, function, args } => {
            opt(dst, format!("call_static @{}({})", function.0, args_list(args)))
        }
        CallVirtual { dst, class, slot, args } => opt(
            dst,
            format!(
                "call_virtual {}[slot {}]({})",
                class_name(*class, module, arena),
                slot,
                args_list(args)
            ),
        ),
        CallInterface { dst, name, arity, args, .. } => opt(
            dst,
            format!(
                "call_interface {}/{}({})",
                arena.resolve(*name),
                arity,
                args_list(args)
            ),
        ),
        CallNative { dst, class, method, args, .. } => opt(
            dst,
            format!(
                "call_native {}.{}({})",
                class_name(*class, module, arena),
                arena.resolve(*method),
                args_list(args)
            ),
        ),
        NewCell { dst, .. } => t(*dst, "new_cell".into()),
        CellGet { dst, cell, .. } => t(*dst, format!("cell_get r{}", cell.0)),
        CellSet { cell, value } => format!("cell_set r{}, r{}", cell.0, value.0),
        ArrayNew { dst, len, .. } => t(*dst, format!("array_new r{}", len.0)),
        ArrayLen { dst, array } => t(*dst, format!("array_len r{}", array.0)),
        ArrayGet { dst, array, index } => t(*dst, format!("array_get r{}, r{}", array.0, index.0)),
        ArraySet { array, index, value } => {
            format!("array_set r{}, r{}, r{}", array.0, index.0, value.0)
        }
        HashNew { dst, .. } => t(*dst, "hash_new".into()),
        HashLen { dst, hash } => t(*dst, format!("hash_len r{}", hash.0)),
        HashGet { dst, hash, key } => t(*dst, format!("hash_get r{}, r{}", hash.0, key.0)),
        HashSet { hash, key, value } => format!("hash_set r{}, r{}, r{}", hash.0, key.0, value.0),
        RangeNew { dst, lo, hi } => t(*dst, format!("range_new r{}, r{}", lo.0, hi.0)),
        RangeLo { dst, range } => t(*dst, format!("range_lo r{}", range.0)),
        RangeHi { dst, range } => t(*dst, format!("range_hi r{}", range.0)),
        StringConcat { dst, lhs, rhs } => t(*dst, format!("string_concat r{}, r{}", lhs.0, rhs.0)),
        CallIntrinsic { dst, intrinsic, args } => opt(
            dst,
            format!("intrinsic {:?}({})", intrinsic, args_list(args)),
        ),
    }
}

fn fmt_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Ret { value: Some(v) } => format!("ret r{}", v.0),
        Terminator::Ret { value: None } => "ret".into(),
        Terminator::Jump { target } => format!("jump bb{}", target.0),
        Terminator::CondJump { cond, then_blk, else_blk } => {
            format!("cond_jump r{}, bb{}, bb{}", cond.0, then_blk.0, else_blk.0)
        }
        Terminator::Switch { value, cases, default } => {
            let cases: Vec<String> = cases
                .iter()
                .map(|(v, b)| format!("{} -> bb{}", v, b.0))
                .collect();
            format!("switch r{} [{}] default bb{}", value.0, cases.join(", "), default.0)
        }
        Terminator::Throw { value } => format!("throw r{}", value.0),
        Terminator::AwaitSuspend { future, state, resume } => {
            format!("await_suspend r{}, state {}, resume bb{}", future.0, state, resume.0)
        }
        Terminator::YieldSuspend { value, state, resume } => {
            format!("yield_suspend r{}, state {}, resume bb{}", value.0, state, resume.0)
        }
    }
}
