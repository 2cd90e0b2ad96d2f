//! Generator and async lowering: state-machine classes, dispatch switches,
//! suspend terminators, and future plumbing.

use ember_compiler::anvil::{
    AnvilFunction, AnvilModule, ClassDescriptor, FunctionKind, Intrinsic, Op, Terminator,
};
use ember_compiler::{compile_to_anvil, CompileConfig, CompilerError};
use ember_typed_ast::{
    AstBuilder, BinOp, StringArena, TypeContext, TypedClass, TypedFunction,
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

fn find_class<'a>(module: &'a AnvilModule, arena: &StringArena, name: &str) -> &'a ClassDescriptor {
    module
        .classes
        .values()
        .find(|c| arena.resolve(c.name) == name)
        .unwrap_or_else(|| panic!("no class named {name}"))
}

fn find_fn<'a>(module: &'a AnvilModule, id: ember_compiler::FunctionId) -> &'a AnvilFunction {
    module.function(id).expect("function exists")
}

fn all_ops(func: &AnvilFunction) -> Vec<&Op> {
    func.blocks.iter().flat_map(|b| b.ops.iter()).collect()
}

#[test]
fn test_generator_lowered_to_state_machine_class() {
    let mut b = AstBuilder::new();
    let object = b.types.builtins().object;
    let object_ty = b.t_class(object);

    let one = b.int(1);
    let y1 = b.yield_stmt(one);
    let two = b.int(2);
    let y2 = b.yield_stmt(two);
    let nums = b.function("nums", vec![], object_ty, vec![y1, y2]);

    let (module, arena, _) = compile(b, vec![], vec![nums]);

    let machine = find_class(&module, &arena, "nums$generator");
    assert_eq!(arena.resolve(machine.fields[0].name), "state");

    let next_sym = arena.get("next").unwrap();
    let has_next_sym = arena.get("has_next").unwrap();
    let next = find_fn(
        &module,
        machine.methods[&(next_sym, 0)].function.unwrap(),
    );
    let has_next = find_fn(
        &module,
        machine.methods[&(has_next_sym, 0)].function.unwrap(),
    );

    assert_eq!(next.kind, FunctionKind::Generator);

    // Entry dispatch: a switch over the state field with the start arm and
    // one resume arm per yield.
    match next.blocks[0].terminator.as_ref().unwrap() {
        Terminator::Switch { cases, .. } => {
            let mut states: Vec<i64> = cases.iter().map(|(v, _)| *v).collect();
            states.sort_unstable();
            assert_eq!(states, vec![0, 1, 2]);
        }
        other => panic!("dispatch terminator, found {other:?}"),
    }

    // Exactly the source yields suspend, with increasing state indices.
    let suspends: Vec<u32> = next
        .blocks
        .iter()
        .filter_map(|blk| match blk.terminator.as_ref() {
            Some(Terminator::YieldSuspend { state, .. }) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(suspends, vec![1, 2]);

    // has_next: state != done.
    assert!(all_ops(has_next)
        .iter()
        .any(|op| matches!(op, Op::ICmp { .. })));

    // The factory allocates the machine and hands it back.
    let factory = module
        .functions
        .values()
        .find(|f| arena.resolve(f.name) == "nums" && f.kind == FunctionKind::Plain)
        .expect("generator factory");
    assert!(all_ops(factory)
        .iter()
        .any(|op| matches!(op, Op::New { class, .. } if *class == machine.id)));
}

#[test]
fn test_async_function_wraps_result_in_future() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let fut_ty = b.t_future(i64_ty);

    let x = b.param("x", i64_ty);
    let x_ref = b.local(x.name, x.binding, i64_ty);
    let two = b.int(2);
    let doubled = b.binary(BinOp::Mul, x_ref, two, i64_ty);
    let ret = b.ret(Some(doubled));
    let mut compute = b.function("compute", vec![x], fut_ty, vec![ret]);
    compute.is_async = true;

    let (module, arena, _) = compile(b, vec![], vec![compute]);

    let machine = find_class(&module, &arena, "compute$async");
    let field_names: Vec<&str> = machine
        .fields
        .iter()
        .map(|f| arena.resolve(f.name))
        .collect();
    assert!(field_names.contains(&"state"));
    assert!(field_names.contains(&"__future"));
    assert!(field_names.contains(&"x"));

    // Factory: future_new, one synchronous resume, future returned.
    let factory = module
        .functions
        .values()
        .find(|f| arena.resolve(f.name) == "compute" && f.kind == FunctionKind::Plain)
        .expect("async factory");
    assert!(all_ops(factory).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::FutureNew,
            ..
        }
    )));
    assert!(all_ops(factory)
        .iter()
        .any(|op| matches!(op, Op::CallVirtual { .. })));

    // resume completes the future and parks in the done state; a catch-all
    // region fails it on an exception.
    let resume_sym = arena.get("resume").unwrap();
    let resume = find_fn(
        &module,
        machine.methods[&(resume_sym, 0)].function.unwrap(),
    );
    assert_eq!(resume.kind, FunctionKind::Async);
    assert!(all_ops(resume).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::FutureComplete,
            ..
        }
    )));
    assert!(all_ops(resume).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::FutureFail,
            ..
        }
    )));
    assert_eq!(resume.try_regions.len(), 1);
}

#[test]
fn test_await_suspends_and_reads_back_through_the_spill_slot() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let fut_ty = b.t_future(i64_ty);

    // async def compute(x): return x * 2
    let x = b.param("x", i64_ty);
    let x_ref = b.local(x.name, x.binding, i64_ty);
    let two = b.int(2);
    let doubled = b.binary(BinOp::Mul, x_ref, two, i64_ty);
    let ret = b.ret(Some(doubled));
    let mut compute = b.function("compute", vec![x], fut_ty, vec![ret]);
    compute.is_async = true;

    // async def pipeline(x): let a = await compute(x); return a + 10
    let px = b.param("x", i64_ty);
    let arg = b.local(px.name, px.binding, i64_ty);
    let call = b.free_call("compute", vec![arg], fut_ty);
    let awaited = b.await_expr(call, i64_ty);
    let (let_a, a) = b.let_stmt("a", false, awaited);
    let a_sym = b.arena.get("a").unwrap();
    let a_ref = b.local(a_sym, a, i64_ty);
    let ten = b.int(10);
    let sum = b.binary(BinOp::Add, a_ref, ten, i64_ty);
    let ret = b.ret(Some(sum));
    let mut pipeline = b.function("pipeline", vec![px], fut_ty, vec![let_a, ret]);
    pipeline.is_async = true;

    let (module, arena, _) = compile(b, vec![], vec![compute, pipeline]);

    let machine = find_class(&module, &arena, "pipeline$async");
    assert!(machine
        .fields
        .iter()
        .any(|f| arena.resolve(f.name) == "__await0"));

    let resume_sym = arena.get("resume").unwrap();
    let resume = find_fn(
        &module,
        machine.methods[&(resume_sym, 0)].function.unwrap(),
    );
    let has_await = resume
        .blocks
        .iter()
        .any(|blk| matches!(blk.terminator, Some(Terminator::AwaitSuspend { state: 1, .. })));
    assert!(has_await, "the await point saves state 1 and suspends");

    // Resumption reads the spilled future back and asks for its value.
    assert!(all_ops(resume).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::FutureValue,
            ..
        }
    )));

    // The dispatch switch has an arm for the resume state.
    match resume.blocks[0].terminator.as_ref().unwrap() {
        Terminator::Switch { cases, .. } => {
            assert!(cases.iter().any(|(v, _)| *v == 1));
        }
        other => panic!("dispatch terminator, found {other:?}"),
    }
}

#[test]
fn test_await_inside_compound_expression_is_rejected() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let fut_ty = b.t_future(i64_ty);

    let x = b.param("x", i64_ty);
    let x_ref = b.local(x.name, x.binding, i64_ty);
    let ret = b.ret(Some(x_ref));
    let mut compute = b.function("compute", vec![x], fut_ty, vec![ret]);
    compute.is_async = true;

    // return 1 + (await compute(2)): a temporary would cross the suspend.
    let two = b.int(2);
    let call = b.free_call("compute", vec![two], fut_ty);
    let awaited = b.await_expr(call, i64_ty);
    let one = b.int(1);
    let sum = b.binary(BinOp::Add, one, awaited, i64_ty);
    let ret = b.ret(Some(sum));
    let mut bad = b.function("bad", vec![], fut_ty, vec![ret]);
    bad.is_async = true;

    let program = b.program(vec![], vec![compute, bad]);
    let AstBuilder {
        mut arena,
        mut types,
        ..
    } = b;
    let err = compile_to_anvil(&program, &mut types, &mut arena, &CompileConfig::default());
    assert!(matches!(err, Err(CompilerError::Unsupported { .. })));
}
