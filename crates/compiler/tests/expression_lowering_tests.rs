//! Integration tests for expression lowering from the typed AST to Anvil.
//!
//! Each test builds a small well-typed program through the builder DSL,
//! runs the full resolve → lower → verify pipeline, and inspects the
//! emitted opcodes.

use ember_compiler::anvil::{AnvilFunction, AnvilModule, Intrinsic, Op, Terminator};
use ember_compiler::{compile_to_anvil, dump_module, CompileConfig};
use ember_typed_ast::{
    AstBuilder, BinOp, ConvertKind, InterpPart, LogicalOp, StringArena, TypeContext, TypedClass,
    TypedFunction,
};

fn compile(
    mut b: AstBuilder,
    classes: Vec<TypedClass>,
    functions: Vec<TypedFunction>,
) -> (AnvilModule, StringArena, TypeContext) {
    let program = b.program(classes, functions);
    let AstBuilder {
        mut arena,
        mut types,
        ..
    } = b;
    let module = compile_to_anvil(&program, &mut types, &mut arena, &CompileConfig::default())
        .expect("program compiles");
    (module, arena, types)
}

fn find_fn<'a>(module: &'a AnvilModule, arena: &StringArena, name: &str) -> &'a AnvilFunction {
    module
        .functions
        .values()
        .find(|f| arena.resolve(f.name) == name)
        .unwrap_or_else(|| panic!("no function named {name}"))
}

fn all_ops(func: &AnvilFunction) -> Vec<&Op> {
    func.blocks.iter().flat_map(|b| b.ops.iter()).collect()
}

#[test]
fn test_return_literal() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let value = b.int(42);
    let ret = b.ret(Some(value));
    let f = b.function("f", vec![], i64_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "f");
    assert!(all_ops(f)
        .iter()
        .any(|op| matches!(op, Op::ConstInt { value: 42, .. })));
    assert!(matches!(
        f.blocks[0].terminator,
        Some(Terminator::Ret { value: Some(_) })
    ));
}

#[test]
fn test_binary_addition() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let lhs = b.int(10);
    let rhs = b.int(20);
    let sum = b.binary(BinOp::Add, lhs, rhs, i64_ty);
    let ret = b.ret(Some(sum));
    let f = b.function("add", vec![], i64_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "add");
    assert!(all_ops(f).iter().any(|op| matches!(op, Op::IAdd { .. })));
}

#[test]
fn test_short_circuit_and_produces_boolean_phi() {
    let mut b = AstBuilder::new();
    let bool_ty = b.t_i1();
    let pa = b.param("a", bool_ty);
    let pb = b.param("b", bool_ty);
    let a = b.local(pa.name, pa.binding, bool_ty);
    let rhs = b.local(pb.name, pb.binding, bool_ty);
    let and = b.logical(LogicalOp::And, a, rhs);
    let ret = b.ret(Some(and));
    let f = b.function("both", vec![pa, pb], bool_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "both");
    assert!(matches!(
        f.blocks[0].terminator,
        Some(Terminator::CondJump { .. })
    ));
    assert!(
        f.blocks.iter().any(|blk| !blk.phis.is_empty()),
        "short-circuit lowering joins through a phi"
    );
}

#[test]
fn test_interpolation_is_left_to_right() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let lit = b.interp_lit("n=");
    let one = b.int(1);
    let bang = b.interp_lit("!");
    let interp = b.interp(vec![lit, InterpPart::Expr(one), bang]);
    let ret = b.ret(Some(interp));
    let f = b.function("fmt", vec![], string_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "fmt");
    let ops = all_ops(f);

    let first_lit = ops
        .iter()
        .position(|op| matches!(op, Op::ConstString { .. }))
        .expect("literal piece");
    let to_string = ops
        .iter()
        .position(|op| {
            matches!(
                op,
                Op::CallIntrinsic {
                    intrinsic: Intrinsic::IntToString,
                    ..
                }
            )
        })
        .expect("number rendered through to_string");
    let concats: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, Op::StringConcat { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(concats.len(), 2, "two joins for three pieces");
    assert!(first_lit < to_string && to_string < concats[0]);
    assert!(concats[0] < concats[1]);
}

#[test]
fn test_conversions_are_explicit_opcodes() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let narrow = b.int32(7);
    let widened = b.convert(ConvertKind::I32ToI64, narrow, i64_ty);
    let ret = b.ret(Some(widened));
    let f = b.function("widen", vec![], i64_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "widen");
    assert!(all_ops(f).iter().any(|op| matches!(op, Op::I32ToI64 { .. })));
}

#[test]
fn test_hello_world_entry() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let io = b.types.builtins().io;
    let greeting = b.string("Hello, World!");
    let call = b.static_call(io, "print", vec![greeting], nil_ty);
    let stmt = b.expr_stmt(call);
    let main = b.function("main", vec![], nil_ty, vec![stmt]);

    let (module, arena, _) = compile(b, vec![], vec![main]);
    assert!(module.entry.is_some(), "main is the entry point");
    let main = find_fn(&module, &arena, "main");
    assert!(all_ops(main).iter().any(|op| {
        matches!(
            op,
            Op::CallIntrinsic {
                intrinsic: Intrinsic::Print,
                ..
            }
        )
    }));
    assert!(module
        .strings
        .iter()
        .any(|s| arena.resolve(*s) == "Hello, World!"));
}

#[test]
fn test_recursive_fib_lowered_as_static_calls() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let bool_ty = b.t_i1();
    let n = b.param("n", i64_ty);

    // if n < 2: return n
    let n_ref = b.local(n.name, n.binding, i64_ty);
    let two = b.int(2);
    let cond = b.binary(BinOp::Lt, n_ref, two, bool_ty);
    let n_ref = b.local(n.name, n.binding, i64_ty);
    let early = b.ret(Some(n_ref));
    let then_body = b.body(vec![early]);
    let guard = b.if_stmt(cond, then_body, None);

    // return fib(n - 1) + fib(n - 2)
    let n_ref = b.local(n.name, n.binding, i64_ty);
    let one = b.int(1);
    let nm1 = b.binary(BinOp::Sub, n_ref, one, i64_ty);
    let call1 = b.free_call("fib", vec![nm1], i64_ty);
    let n_ref = b.local(n.name, n.binding, i64_ty);
    let two = b.int(2);
    let nm2 = b.binary(BinOp::Sub, n_ref, two, i64_ty);
    let call2 = b.free_call("fib", vec![nm2], i64_ty);
    let sum = b.binary(BinOp::Add, call1, call2, i64_ty);
    let tail = b.ret(Some(sum));

    let fib = b.function("fib", vec![n], i64_ty, vec![guard, tail]);
    let (module, arena, _) = compile(b, vec![], vec![fib]);
    let fib = find_fn(&module, &arena, "fib");

    let self_calls = all_ops(fib)
        .iter()
        .filter(|op| matches!(op, Op::CallStatic { function, .. } if *function == fib.id))
        .count();
    assert_eq!(self_calls, 2, "both recursive calls are direct");
}

#[test]
fn test_for_over_range_is_an_index_loop() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let i64_ty = b.t_i64();
    let io = b.types.builtins().io;

    let lo = b.int(0);
    let hi = b.int(5);
    let range = b.range(lo, hi);

    let i_sym = b.intern("i");
    let binding = b.fresh_binding();
    let i_ref = b.local(i_sym, binding, i64_ty);
    let print = b.static_call(io, "println", vec![i_ref], nil_ty);
    let print_stmt = b.expr_stmt(print);
    let body = b.body(vec![print_stmt]);
    let for_stmt = ember_typed_ast::typed_node(
        ember_typed_ast::TypedStmt::For {
            name: i_sym,
            binding,
            elem_ty: i64_ty,
            iterable: range,
            body,
        },
        nil_ty,
        ember_typed_ast::Span::empty(0),
    );
    let main = b.function("main", vec![], nil_ty, vec![for_stmt]);

    let (module, arena, _) = compile(b, vec![], vec![main]);
    let main = find_fn(&module, &arena, "main");

    // The range literal never materializes: no range_new, a compare in the
    // header, and a back edge.
    assert!(!all_ops(main).iter().any(|op| matches!(op, Op::RangeNew { .. })));
    assert!(all_ops(main).iter().any(|op| matches!(op, Op::ICmp { .. })));
    let has_back_edge = main.blocks.iter().enumerate().any(|(i, blk)| {
        blk.terminator
            .as_ref()
            .map(|t| t.successors().iter().any(|s| (s.0 as usize) < i))
            .unwrap_or(false)
    });
    assert!(has_back_edge, "loops jump backwards to their header");
}

#[test]
fn test_function_snapshot_round_trips_through_serde() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let x = b.int(5);
    let y = b.int(6);
    let prod = b.binary(BinOp::Mul, x, y, i64_ty);
    let ret = b.ret(Some(prod));
    let f = b.function("f", vec![], i64_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "f");

    let snapshot = serde_json::to_string(f).expect("function serializes");
    let restored: AnvilFunction = serde_json::from_str(&snapshot).expect("function deserializes");
    assert_eq!(*f, restored);
}

#[test]
fn test_dump_is_deterministic() {
    let build = || {
        let mut b = AstBuilder::new();
        let i64_ty = b.t_i64();
        let x = b.int(5);
        let y = b.int(6);
        let prod = b.binary(BinOp::Mul, x, y, i64_ty);
        let ret = b.ret(Some(prod));
        let f = b.function("f", vec![], i64_ty, vec![ret]);
        compile(b, vec![], vec![f])
    };
    let (m1, a1, t1) = build();
    let (m2, a2, t2) = build();
    assert_eq!(dump_module(&m1, &a1, &t1), dump_module(&m2, &a2, &t2));
}
