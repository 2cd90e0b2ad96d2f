//! Type-erased generics: one layout per generic class, erased slot access,
//! and boxing at the generic boundary.

use ember_compiler::anvil::{AnvilFunction, AnvilModule, Op};
use ember_compiler::{compile_to_anvil, CompileConfig};
use ember_typed_ast::{
    AstBuilder, ConvertKind, LayoutKind, StringArena, Type, TypeContext, TypedClass,
    TypedFunction, OBJECT_HEADER_SIZE,
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

/// `class Box<T> { value: T }` with a getter used at two instantiations.
fn box_program(b: &mut AstBuilder) -> (TypedClass, ember_typed_ast::ClassId) {
    let box_class = b.declare_class_with("Box", None, LayoutKind::Object, 1);
    let t0 = b.types.intern(Type::TypeParam(0));
    let value = b.field("value", t0);
    let decl = b.class_decl(box_class, vec![value], vec![]);
    (decl, box_class)
}

#[test]
fn test_instantiations_share_one_layout() {
    let mut b = AstBuilder::new();
    let (decl, box_class) = box_program(&mut b);

    let string_ty = b.t_string();
    let long_box = b.types.builtins().box_class(ember_typed_ast::PrimKind::I64).unwrap();
    let long_box_ty = b.t_class(long_box);
    let nil_ty = b.t_nil();

    let a = b.new_generic(box_class, vec![long_box_ty], vec![]);
    let (let_a, _) = b.let_stmt("a", false, a);
    let s = b.new_generic(box_class, vec![string_ty], vec![]);
    let (let_b, _) = b.let_stmt("b", false, s);
    let main = b.function("main", vec![], nil_ty, vec![let_a, let_b]);

    let (module, _, types) = compile(b, vec![decl], vec![main]);

    // No monomorphization: one descriptor, one layout, pointer-sized slot.
    assert_eq!(
        module.classes.values().filter(|c| c.id == box_class).count(),
        1
    );
    let layout = types.layout_of(box_class).unwrap();
    assert_eq!(layout.fields.len(), 1);
    assert_eq!(layout.size, OBJECT_HEADER_SIZE + 8);
    assert_eq!(layout.ref_offsets, vec![OBJECT_HEADER_SIZE]);
}

#[test]
fn test_erased_reads_use_load_erased() {
    let mut b = AstBuilder::new();
    let (decl, box_class) = box_program(&mut b);
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let boxed = b.new_generic(box_class, vec![string_ty], vec![]);
    let (let_a, a) = b.let_stmt("a", false, boxed);
    let a_sym = b.arena.get("a").unwrap();
    let generic_ty = b.t_generic(box_class, vec![string_ty]);
    let obj = b.local(a_sym, a, generic_ty);
    // The site's static type is the instantiation argument.
    let read = b.field_get(obj, box_class, "value", string_ty);
    let read = b.expr_stmt(read);
    let main = b.function("main", vec![], nil_ty, vec![let_a, read]);

    let (module, arena, _) = compile(b, vec![decl], vec![main]);
    let main = find_fn(&module, &arena, "main");
    assert!(all_ops(main)
        .iter()
        .any(|op| matches!(op, Op::LoadErased { class, .. } if *class == box_class)));
    assert!(!all_ops(main)
        .iter()
        .any(|op| matches!(op, Op::GetField { class, .. } if *class == box_class)));
}

#[test]
fn test_primitive_generic_arguments_are_boxed() {
    let mut b = AstBuilder::new();
    let (decl, box_class) = box_program(&mut b);
    let long_box = b.types.builtins().box_class(ember_typed_ast::PrimKind::I64).unwrap();
    let long_box_ty = b.t_class(long_box);
    let nil_ty = b.t_nil();

    // Box<Long>.value = box(42); sema inserts the explicit boxing step.
    let boxed_obj = b.new_generic(box_class, vec![long_box_ty], vec![]);
    let (let_a, a) = b.let_stmt("a", false, boxed_obj);
    let a_sym = b.arena.get("a").unwrap();
    let generic_ty = b.t_generic(box_class, vec![long_box_ty]);
    let obj = b.local(a_sym, a, generic_ty);
    let raw = b.int(42);
    let wrapped = b.convert(ConvertKind::Box, raw, long_box_ty);
    let store = b.assign_field(obj, box_class, "value", wrapped);
    let main = b.function("main", vec![], nil_ty, vec![let_a, store]);

    let (module, arena, _) = compile(b, vec![decl], vec![main]);
    let main = find_fn(&module, &arena, "main");
    assert!(all_ops(main).iter().any(|op| matches!(
        op,
        Op::Box {
            prim: ember_typed_ast::PrimKind::I64,
            ..
        }
    )));
    assert!(all_ops(main)
        .iter()
        .any(|op| matches!(op, Op::StoreErased { class, .. } if *class == box_class)));
}
