//! Anvil → LowIR: layouts with headers, v-table dispatch, write barriers,
//! runtime traps, safe points, and landing-pad dispatch.

use ember_compiler::lowir::{
    LowConst, LowFunction, LowInst, LowModule, LowTerm, SafePointKind, VTABLE_BASE_OFFSET,
};
use ember_compiler::runtime_abi::RuntimeFn;
use ember_compiler::{compile_to_lowir, CompileConfig};
use ember_typed_ast::{AstBuilder, BinOp, TypedClass, TypedFunction};

fn compile_low(
    mut b: AstBuilder,
    classes: Vec<TypedClass>,
    functions: Vec<TypedFunction>,
) -> (LowModule, ember_typed_ast::StringArena) {
    let program = b.program(classes, functions);
    let AstBuilder {
        mut arena,
        mut types,
        ..
    } = b;
    let (_, low) = compile_to_lowir(&program, &mut types, &mut arena, &CompileConfig::default())
        .expect("program compiles to LowIR");
    (low, arena)
}

fn find_low<'a>(low: &'a LowModule, name: &str) -> &'a LowFunction {
    low.functions
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no low function named {name}"))
}

fn all_insts(func: &LowFunction) -> Vec<&LowInst> {
    func.blocks.iter().flat_map(|b| b.insts.iter()).collect()
}

fn runtime_calls(func: &LowFunction) -> Vec<RuntimeFn> {
    all_insts(func)
        .iter()
        .filter_map(|i| match i {
            LowInst::CallRuntime { func, .. } => Some(*func),
            _ => None,
        })
        .collect()
}

#[test]
fn test_hello_world_reaches_the_runtime() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let io = b.types.builtins().io;
    let greeting = b.string("Hello, World!");
    let call = b.static_call(io, "print", vec![greeting], nil_ty);
    let stmt = b.expr_stmt(call);
    let main = b.function("main", vec![], nil_ty, vec![stmt]);

    let (low, _) = compile_low(b, vec![], vec![main]);
    assert!(low.entry.is_some());

    let main = find_low(&low, "main");
    // Prologue safe point first, then the console call.
    assert!(matches!(
        main.blocks[0].insts.first(),
        Some(LowInst::SafePoint {
            kind: SafePointKind::Prologue
        })
    ));
    assert!(runtime_calls(main).contains(&RuntimeFn::IoPrint));
    assert!(low.constants.iter().any(|c| matches!(
        c,
        LowConst::String { bytes } if bytes == "Hello, World!"
    )));
}

#[test]
fn test_reference_store_gets_a_write_barrier() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let holder = b.declare_class("Holder", None);
    let field = b.field("s", string_ty);
    let p = b.param("s", string_ty);
    let holder_ty = b.t_class(holder);
    let this = b.self_ref(holder_ty);
    let value = b.local(p.name, p.binding, string_ty);
    let set = b.assign_field(this, holder, "s", value);
    let setter = b.function("set_s", vec![p], nil_ty, vec![set]);
    let decl = b.class_decl(holder, vec![field], vec![setter]);

    let (low, _) = compile_low(b, vec![decl], vec![]);
    let setter = find_low(&low, "set_s");
    assert!(runtime_calls(&setter).contains(&RuntimeFn::GcWriteBarrier));
}

#[test]
fn test_division_by_zero_traps_into_a_throw() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let pa = b.param("a", i64_ty);
    let pb = b.param("b", i64_ty);
    let a = b.local(pa.name, pa.binding, i64_ty);
    let d = b.local(pb.name, pb.binding, i64_ty);
    let quot = b.binary(BinOp::Div, a, d, i64_ty);
    let ret = b.ret(Some(quot));
    let divide = b.function("divide", vec![pa, pb], i64_ty, vec![ret]);

    let (low, _) = compile_low(b, vec![], vec![divide]);
    let divide = find_low(&low, "divide");

    // A guarded branch and a trap block that allocates the error and raises.
    let calls = runtime_calls(divide);
    assert!(calls.contains(&RuntimeFn::GcAlloc));
    assert!(calls.contains(&RuntimeFn::Throw));
    let has_guard = divide
        .blocks
        .iter()
        .any(|blk| matches!(blk.term, Some(LowTerm::CondJump { .. })));
    assert!(has_guard);
    let has_unreachable = divide
        .blocks
        .iter()
        .any(|blk| matches!(blk.term, Some(LowTerm::Unreachable)));
    assert!(has_unreachable);
    assert!(low.constants.iter().any(|c| matches!(
        c,
        LowConst::ClassDescriptor { name, .. } if name == "DivisionByZeroError"
    )));
}

#[test]
fn test_virtual_call_loads_header_then_vtable() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let animal = b.declare_class("Animal", None);
    let woof = b.string("Woof!");
    let ret = b.ret(Some(woof));
    let speak = b.function("speak", vec![], string_ty, vec![ret]);
    let decl = b.class_decl(animal, vec![], vec![speak]);

    let pet = b.new_object(animal, vec![]);
    let (let_p, p) = b.let_stmt("p", false, pet);
    let p_sym = b.arena.get("p").unwrap();
    let animal_ty = b.t_class(animal);
    let recv = b.local(p_sym, p, animal_ty);
    let call = b.method_call(recv, "speak", vec![], string_ty);
    let stmt = b.expr_stmt(call);
    let main = b.function("main", vec![], nil_ty, vec![let_p, stmt]);

    let (low, _) = compile_low(b, vec![decl], vec![main]);
    let main = find_low(&low, "main");

    let insts = all_insts(main);
    let header_load = insts
        .iter()
        .position(|i| matches!(i, LowInst::Load { offset: 0, .. }))
        .expect("descriptor pointer load from the header");
    let vtable_load = insts
        .iter()
        .position(|i| matches!(i, LowInst::Load { offset, .. } if *offset >= VTABLE_BASE_OFFSET))
        .expect("function pointer load from the v-table");
    let indirect = insts
        .iter()
        .position(|i| matches!(i, LowInst::CallIndirect { .. }))
        .expect("indirect call");
    assert!(header_load < vtable_load && vtable_load < indirect);
}

#[test]
fn test_loop_back_edges_are_safe_points() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let i64_ty = b.t_i64();

    let lo = b.int(0);
    let hi = b.int(10);
    let range = b.range(lo, hi);
    let body = b.body(vec![]);
    let (for_stmt, _) = b.for_stmt("i", i64_ty, range, body);
    let main = b.function("main", vec![], nil_ty, vec![for_stmt]);

    let (low, _) = compile_low(b, vec![], vec![main]);
    let main = find_low(&low, "main");
    assert!(all_insts(main).iter().any(|i| matches!(
        i,
        LowInst::SafePoint {
            kind: SafePointKind::LoopBackEdge
        }
    )));
}

#[test]
fn test_try_region_gets_a_dispatcher_with_landing_pad() {
    let mut b = AstBuilder::new();
    let nil_ty = b.t_nil();
    let exception = b.types.builtins().exception;

    let body = b.body(vec![]);
    let catch_body = b.body(vec![]);
    let (clause, _) = b.catch(exception, "e", catch_body);
    let try_stmt = b.try_stmt(body, vec![clause], None);
    let main = b.function("main", vec![], nil_ty, vec![try_stmt]);

    let (low, _) = compile_low(b, vec![], vec![main]);
    let main = find_low(&low, "main");

    assert_eq!(main.try_regions.len(), 1);
    let dispatcher = &main.blocks[main.try_regions[0].dispatcher.0 as usize];
    assert!(matches!(
        dispatcher.insts.first(),
        Some(LowInst::LandingPad { .. })
    ));
    // The dispatcher tests catch types in order and re-raises when nothing
    // matches.
    let calls = runtime_calls(main);
    assert!(calls.contains(&RuntimeFn::IsInstance));
    assert!(calls.contains(&RuntimeFn::Rethrow));
}

#[test]
fn test_await_suspend_registers_the_continuation() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let fut_ty = b.t_future(i64_ty);

    let x = b.param("x", i64_ty);
    let x_ref = b.local(x.name, x.binding, i64_ty);
    let ret = b.ret(Some(x_ref));
    let mut compute = b.function("compute", vec![x], fut_ty, vec![ret]);
    compute.is_async = true;

    let two = b.int(2);
    let call = b.free_call("compute", vec![two], fut_ty);
    let awaited = b.await_expr(call, i64_ty);
    let (let_a, a) = b.let_stmt("a", false, awaited);
    let a_sym = b.arena.get("a").unwrap();
    let a_ref = b.local(a_sym, a, i64_ty);
    let ret = b.ret(Some(a_ref));
    let mut outer = b.function("outer", vec![], fut_ty, vec![let_a, ret]);
    outer.is_async = true;

    let (low, _) = compile_low(b, vec![], vec![compute, outer]);
    let resumes: Vec<&LowFunction> = low
        .functions
        .iter()
        .filter(|f| f.name == "resume")
        .collect();
    assert!(resumes.iter().any(|f| runtime_calls(f)
        .contains(&RuntimeFn::FutureRegisterContinuation)));
}

#[test]
fn test_interface_call_sites_get_inline_caches() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();
    let object = b.types.builtins().object;
    let object_ty = b.t_class(object);

    let p = b.param("o", object_ty);
    let recv = b.local(p.name, p.binding, object_ty);
    let call = b.method_call(recv, "describe", vec![], string_ty);
    let stmt = b.expr_stmt(call);
    let poke = b.function("poke", vec![p], nil_ty, vec![stmt]);

    let (low, _) = compile_low(b, vec![], vec![poke]);
    let poke = find_low(&low, "poke");
    assert!(runtime_calls(poke).contains(&RuntimeFn::MethodLookup));
    assert!(low
        .constants
        .iter()
        .any(|c| matches!(c, LowConst::InlineCache)));
}

#[test]
fn test_generic_descriptor_is_pointer_shaped() {
    let mut b = AstBuilder::new();
    let box_class = b.declare_class_with(
        "Box",
        None,
        ember_typed_ast::LayoutKind::Object,
        1,
    );
    let t0 = b.types.intern(ember_typed_ast::Type::TypeParam(0));
    let value = b.field("value", t0);
    let decl = b.class_decl(box_class, vec![value], vec![]);

    let (low, _) = compile_low(b, vec![decl], vec![]);
    let desc = low
        .constants
        .iter()
        .find_map(|c| match c {
            LowConst::ClassDescriptor {
                name,
                size,
                ref_offsets,
                ..
            } if name == "Box" => Some((*size, ref_offsets.clone())),
            _ => None,
        })
        .expect("descriptor for Box");
    assert_eq!(desc.0, ember_typed_ast::OBJECT_HEADER_SIZE + 8);
    assert_eq!(desc.1, vec![ember_typed_ast::OBJECT_HEADER_SIZE]);
}
