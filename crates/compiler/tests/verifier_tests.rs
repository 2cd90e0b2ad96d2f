//! Verifier soundness: a corpus of hand-crafted malformed functions the
//! verifier must reject, plus well-formed controls it must accept.

use ember_compiler::anvil::{
    AnvilModule, BlockId, CatchEntry, CmpPred, FunctionId, FunctionKind, Op, RegId, Terminator,
};
use ember_compiler::anvil_builder::FunctionBuilder;
use ember_compiler::resolver::resolve;
use ember_compiler::verify::verify_function;
use ember_compiler::{lowering, CompilerError};
use ember_typed_ast::{AstBuilder, PrimKind, Span, StringArena, TypeContext};

/// Empty program: builtin descriptors only, which is exactly what the
/// crafted functions need for receivers and throwables.
fn harness() -> (AnvilModule, StringArena, TypeContext) {
    let mut b = AstBuilder::new();
    let program = b.program(vec![], vec![]);
    let AstBuilder {
        mut arena,
        mut types,
        ..
    } = b;
    let res = resolve(&program, &mut types, &mut arena).expect("empty program resolves");
    let name = arena.intern("verify_harness");
    let module = lowering::lower_program(&program, &res, &mut types, &mut arena, name)
        .expect("empty program lowers");
    (module, arena, types)
}

fn builder(
    arena: &mut StringArena,
    ret: ember_typed_ast::TypeHandle,
    kind: FunctionKind,
) -> FunctionBuilder {
    let name = arena.intern("crafted");
    FunctionBuilder::new(FunctionId(9000), name, vec![], ret, kind, Span::empty(0))
}

fn expect_reject(module: &AnvilModule, types: &TypeContext, fb: FunctionBuilder) {
    let func = fb.finish();
    let result = verify_function(module, &func, types);
    assert!(
        matches!(result, Err(CompilerError::Internal { .. })),
        "verifier must flag the malformed function"
    );
}

#[test]
fn test_accepts_well_formed_function() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let bool_ty = types.bool_type();
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);

    let a = fb.const_int(1, i64_ty);
    let b = fb.const_int(2, i64_ty);
    let c = fb.icmp(CmpPred::Lt, a, b, bool_ty);
    let then_blk = fb.new_block();
    let else_blk = fb.new_block();
    fb.cond_jump(c, then_blk, else_blk);
    fb.switch_to(then_blk);
    fb.ret(Some(a));
    fb.switch_to(else_blk);
    fb.ret(Some(b));

    let func = fb.finish();
    verify_function(&module, &func, &types).expect("well-formed function verifies");
}

#[test]
fn test_rejects_missing_terminator() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);
    fb.const_int(1, i64_ty);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_use_of_undefined_register() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);
    let dst = fb.fresh_reg(i64_ty);
    fb.push(Op::IAdd {
        dst,
        lhs: RegId(97),
        rhs: RegId(98),
    });
    fb.ret(Some(dst));
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_double_definition() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);
    let r = fb.fresh_reg(i64_ty);
    fb.push(Op::ConstInt {
        dst: r,
        value: 1,
        ty: i64_ty,
    });
    fb.push(Op::ConstInt {
        dst: r,
        value: 2,
        ty: i64_ty,
    });
    fb.ret(Some(r));
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_use_not_dominated_by_definition() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let bool_ty = types.bool_type();
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);

    let zero = fb.const_int(0, i64_ty);
    let one = fb.const_int(1, i64_ty);
    let c = fb.icmp(CmpPred::Eq, zero, one, bool_ty);
    let left = fb.new_block();
    let right = fb.new_block();
    let join = fb.new_block();
    fb.cond_jump(c, left, right);

    fb.switch_to(left);
    // Defined only on one path.
    let v = fb.const_int(7, i64_ty);
    fb.jump(join);
    fb.switch_to(right);
    fb.jump(join);

    fb.switch_to(join);
    fb.ret(Some(v));
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_terminator_with_missing_target() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    fb.jump(BlockId(9));
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_non_boolean_condition() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    let n = fb.const_int(3, i64_ty);
    let a = fb.new_block();
    let b = fb.new_block();
    fb.cond_jump(n, a, b);
    fb.switch_to(a);
    fb.ret(None);
    fb.switch_to(b);
    fb.ret(None);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_bare_ret_from_value_function() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);
    fb.ret(None);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_suspend_outside_state_machines() {
    let (module, mut arena, mut types) = harness();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, i64_ty, FunctionKind::Plain);
    let v = fb.const_int(1, i64_ty);
    let resume = fb.new_block();
    fb.terminate(Terminator::YieldSuspend {
        value: v,
        state: 1,
        resume,
    });
    fb.switch_to(resume);
    fb.ret(Some(v));
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_virtual_slot_out_of_range() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let object = types.builtins().object;
    let object_ty = types.class_type(object);
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    let recv = fb.const_nil(object_ty);
    fb.push(Op::CallVirtual {
        dst: None,
        class: object,
        slot: 99,
        args: vec![recv],
    });
    fb.ret(None);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_ffi_call_into_plain_class() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let object = types.builtins().object;
    let method = arena.intern("puts");
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    fb.push(Op::CallNative {
        dst: None,
        class: object,
        method,
        arity: 0,
        args: vec![],
    });
    fb.ret(None);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_throw_of_non_exception() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let i64_ty = types.primitive(PrimKind::I64);
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    let n = fb.const_int(5, i64_ty);
    fb.throw(n);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_throw_in_region_without_catches() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let exception = types.builtins().exception;
    let exc_ty = types.class_type(exception);
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    let exc = fb.const_nil(exc_ty);
    fb.add_region(None, vec![BlockId(0)], vec![]);
    fb.throw(exc);
    expect_reject(&module, &types, fb);
}

#[test]
fn test_rejects_overlapping_sibling_regions() {
    let (module, mut arena, mut types) = harness();
    let nil_ty = types.nil_type();
    let exception = types.builtins().exception;
    let exc_ty = types.class_type(exception);
    let mut fb = builder(&mut arena, nil_ty, FunctionKind::Plain);
    let handler = fb.new_block();
    fb.switch_to(handler);
    fb.ret(None);
    fb.switch_to(BlockId(0));
    fb.ret(None);
    let catches = vec![CatchEntry {
        ty: exc_ty,
        handler,
    }];
    fb.add_region(None, vec![BlockId(0)], catches.clone());
    fb.add_region(None, vec![BlockId(0)], catches);
    expect_reject(&module, &types, fb);
}
