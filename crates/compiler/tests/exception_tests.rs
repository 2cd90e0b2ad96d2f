//! Exceptions and resource scopes: try-region shape, finally duplication
//! into every exit edge, and dispose idempotence.

use ember_compiler::anvil::{AnvilFunction, AnvilModule, Op, Terminator};
use ember_compiler::{compile_to_anvil, CompileConfig};
use ember_typed_ast::{
    AstBuilder, BinOp, StringArena, Type, TypeContext, TypedClass, TypedFunction,
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

fn count_string_consts(
    func: &AnvilFunction,
    module: &AnvilModule,
    arena: &StringArena,
    text: &str,
) -> usize {
    all_ops(func)
        .iter()
        .filter(|op| match op {
            Op::ConstString { string, .. } => arena.resolve(module.string(*string)) == text,
            _ => false,
        })
        .count()
}

#[test]
fn test_try_catch_finally_shape() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let nil_ty = b.t_nil();
    let io = b.types.builtins().io;
    let dbz = b.types.builtins().division_by_zero_error;

    // divide(a, b) = a / b; the division traps at runtime.
    let pa = b.param("a", i64_ty);
    let pb = b.param("b", i64_ty);
    let a = b.local(pa.name, pa.binding, i64_ty);
    let bb = b.local(pb.name, pb.binding, i64_ty);
    let quot = b.binary(BinOp::Div, a, bb, i64_ty);
    let ret = b.ret(Some(quot));
    let divide = b.function("divide", vec![pa, pb], i64_ty, vec![ret]);

    // try: divide(10, 0) catch e: DivisionByZeroError: print "caught"
    // finally: print "done"
    let ten = b.int(10);
    let zero = b.int(0);
    let call = b.free_call("divide", vec![ten, zero], i64_ty);
    let call_stmt = b.expr_stmt(call);
    let try_body = b.body(vec![call_stmt]);

    let caught = b.string("caught");
    let print_caught = b.static_call(io, "println", vec![caught], nil_ty);
    let print_caught = b.expr_stmt(print_caught);
    let catch_body = b.body(vec![print_caught]);
    let (catch_clause, _) = b.catch(dbz, "e", catch_body);

    let done = b.string("done");
    let print_done = b.static_call(io, "println", vec![done], nil_ty);
    let print_done = b.expr_stmt(print_done);
    let finally_body = b.body(vec![print_done]);

    let try_stmt = b.try_stmt(try_body, vec![catch_clause], Some(finally_body));
    let main = b.function("main", vec![], nil_ty, vec![try_stmt]);

    let (module, arena, types) = compile(b, vec![], vec![divide, main]);
    let main = find_fn(&module, &arena, "main");

    assert_eq!(main.try_regions.len(), 1);
    let region = &main.try_regions[0];
    // The user catch plus the finally catch-all, in listed order.
    assert_eq!(region.catches.len(), 2);
    assert!(matches!(
        types.type_of(region.catches[0].ty),
        Type::Class(c) if *c == dbz
    ));

    // Every handler begins by receiving the in-flight exception.
    for catch in &region.catches {
        let handler = &main.blocks[catch.handler.index()];
        assert!(matches!(handler.ops.first(), Some(Op::CaughtException { .. })));
    }

    // The catch-all re-raises after running the finally body.
    let rethrow_handler = &main.blocks[region.catches[1].handler.index()];
    assert!(matches!(
        rethrow_handler.terminator,
        Some(Terminator::Throw { .. })
    ));

    // finally is duplicated into the normal edge and the throw edge.
    assert!(count_string_consts(main, &module, &arena, "done") >= 2);
    assert_eq!(count_string_consts(main, &module, &arena, "caught"), 1);
}

#[test]
fn test_return_inside_try_runs_finally_first() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let nil_ty = b.t_nil();
    let io = b.types.builtins().io;

    let one = b.int(1);
    let ret = b.ret(Some(one));
    let try_body = b.body(vec![ret]);

    let marker = b.string("cleanup");
    let print = b.static_call(io, "println", vec![marker], nil_ty);
    let print = b.expr_stmt(print);
    let finally_body = b.body(vec![print]);

    let try_stmt = b.try_stmt(try_body, vec![], Some(finally_body));
    let f = b.function("f", vec![], i64_ty, vec![try_stmt]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "f");

    // Return edge, throw edge, and normal edge each get a copy.
    assert!(count_string_consts(f, &module, &arena, "cleanup") >= 2);

    // On the return path the cleanup precedes the ret in the same block.
    let has_cleanup_then_ret = f.blocks.iter().any(|blk| {
        let prints = blk
            .ops
            .iter()
            .any(|op| matches!(op, Op::ConstString { string, .. }
                if arena.resolve(module.string(*string)) == "cleanup"));
        prints && matches!(blk.terminator, Some(Terminator::Ret { value: Some(_) }))
    });
    assert!(has_cleanup_then_ret);
}

#[test]
fn test_using_disposes_on_every_exit_edge() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let io = b.types.builtins().io;

    let res = b.declare_class("Res", None);
    let dispose = b.function("dispose", vec![], nil_ty, vec![]);
    let res_decl = b.class_decl(res, vec![], vec![dispose]);

    let value = b.new_object(res, vec![]);
    let msg = b.string("body");
    let print = b.static_call(io, "println", vec![msg], nil_ty);
    let print = b.expr_stmt(print);
    let body = b.body(vec![print]);
    let (using_stmt, _) = b.using_stmt("r", value, body);
    let main = b.function("main", vec![], nil_ty, vec![using_stmt]);

    let (module, arena, _) = compile(b, vec![res_decl], vec![main]);

    // The class grew the per-instance disposed flag.
    let desc = &module.classes[&res];
    assert!(desc
        .fields
        .iter()
        .any(|f| arena.resolve(f.name) == "__disposed"));

    // dispose() starts with the idempotence guard: check, early return, set.
    let dispose_sym = arena.get("dispose").unwrap();
    let dispose_fn = module
        .function(desc.methods[&(dispose_sym, 0)].function.unwrap())
        .unwrap();
    assert!(matches!(
        dispose_fn.blocks[0].terminator,
        Some(Terminator::CondJump { .. })
    ));
    assert!(all_ops(dispose_fn)
        .iter()
        .any(|op| matches!(op, Op::SetField { .. })));

    // The using scope calls dispose on the normal edge and the throw edge.
    let main = find_fn(&module, &arena, "main");
    let slot = desc.methods[&(dispose_sym, 0)].vtable_slot.unwrap();
    let dispose_calls = all_ops(main)
        .iter()
        .filter(|op| matches!(op, Op::CallVirtual { slot: s, .. } if *s == slot))
        .count();
    assert_eq!(dispose_calls, 2);
    assert_eq!(main.try_regions.len(), 1);
}

#[test]
fn test_nested_try_regions_form_a_forest() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let exception = b.types.builtins().exception;

    let inner_body = b.body(vec![]);
    let inner_catch_body = b.body(vec![]);
    let (inner_catch, _) = b.catch(exception, "e", inner_catch_body);
    let inner_try = b.try_stmt(inner_body, vec![inner_catch], None);

    let outer_body = b.body(vec![inner_try]);
    let outer_catch_body = b.body(vec![]);
    let (outer_catch, _) = b.catch(exception, "e", outer_catch_body);
    let outer_try = b.try_stmt(outer_body, vec![outer_catch], None);

    let main = b.function("main", vec![], nil_ty, vec![outer_try]);
    let (module, arena, _) = compile(b, vec![], vec![main]);
    let main = find_fn(&module, &arena, "main");

    assert_eq!(main.try_regions.len(), 2);
    let outer = &main.try_regions[0];
    let inner = &main.try_regions[1];
    assert!(outer.parent.is_none());
    assert_eq!(inner.parent.map(|p| p.index()), Some(0));
    // Proper nesting: the inner region's blocks all belong to the outer.
    assert!(inner.blocks.iter().all(|b| outer.blocks.contains(b)));
}
