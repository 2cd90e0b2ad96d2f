//! Serialization synthesis: declaration-order keys, `@json` overrides, and
//! missing-field failures in `from_json`.

use ember_compiler::anvil::{AnvilFunction, AnvilModule, Intrinsic, Op, Terminator};
use ember_compiler::{compile_to_anvil, CompileConfig};
use ember_typed_ast::{
    AstBuilder, SerializationPolicy, StringArena, TypeContext, TypedClass, TypedFunction,
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

fn all_ops(func: &AnvilFunction) -> Vec<&Op> {
    func.blocks.iter().flat_map(|b| b.ops.iter()).collect()
}

fn string_consts<'a>(
    func: &AnvilFunction,
    module: &'a AnvilModule,
    arena: &'a StringArena,
) -> Vec<&'a str> {
    all_ops(func)
        .iter()
        .filter_map(|op| match op {
            Op::ConstString { string, .. } => Some(arena.resolve(module.string(*string))),
            _ => None,
        })
        .collect()
}

fn point_program(b: &mut AstBuilder) -> TypedClass {
    let f64_ty = b.t_f64();
    let point = b.declare_class("Point", None);
    let x = b.field("x", f64_ty);
    let y = b.field("y", f64_ty);
    let mut decl = b.class_decl(point, vec![x, y], vec![]);
    decl.serialization = SerializationPolicy::Json;
    decl
}

#[test]
fn test_to_json_emits_keys_in_declaration_order() {
    let mut b = AstBuilder::new();
    let decl = point_program(&mut b);
    let point = decl.id;
    let (module, arena, _) = compile(b, vec![decl], vec![]);

    let to_json_sym = arena.get("to_json").unwrap();
    let desc = &module.classes[&point];
    let handle = &desc.methods[&(to_json_sym, 0)];
    assert!(handle.vtable_slot.is_some(), "to_json dispatches virtually");

    let body = module.function(handle.function.unwrap()).unwrap();
    let consts = string_consts(body, &module, &arena);
    let x_pos = consts.iter().position(|s| s.contains("\"x\":")).unwrap();
    let y_pos = consts.iter().position(|s| s.contains("\"y\":")).unwrap();
    assert!(x_pos < y_pos, "fields serialize in declaration order");

    // Doubles render through the runtime formatter; the pieces join with
    // string_concat.
    assert!(all_ops(body).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::DoubleToString,
            ..
        }
    )));
    assert!(all_ops(body)
        .iter()
        .any(|op| matches!(op, Op::StringConcat { .. })));
}

#[test]
fn test_json_key_override_wins() {
    let mut b = AstBuilder::new();
    let f64_ty = b.t_f64();
    let point = b.declare_class("P", None);
    let mut x = b.field("x", f64_ty);
    x.json_key = Some(b.intern("abscissa"));
    let mut decl = b.class_decl(point, vec![x], vec![]);
    decl.serialization = SerializationPolicy::Json;

    let (module, arena, _) = compile(b, vec![decl], vec![]);
    let to_json_sym = arena.get("to_json").unwrap();
    let body = module
        .function(
            module.classes[&point].methods[&(to_json_sym, 0)]
                .function
                .unwrap(),
        )
        .unwrap();
    let consts = string_consts(body, &module, &arena);
    assert!(consts.iter().any(|s| s.contains("\"abscissa\":")));
    assert!(!consts.iter().any(|s| s.contains("\"x\":")));
}

#[test]
fn test_from_json_throws_on_missing_field() {
    let mut b = AstBuilder::new();
    let decl = point_program(&mut b);
    let point = decl.id;
    let serialization_error = b.types.builtins().serialization_error;
    let (module, arena, _) = compile(b, vec![decl], vec![]);

    let from_json_sym = arena.get("from_json").unwrap();
    let handle = &module.classes[&point].methods[&(from_json_sym, 1)];
    assert!(handle.vtable_slot.is_none(), "from_json is static");

    let body = module.function(handle.function.unwrap()).unwrap();
    assert!(all_ops(body).iter().any(|op| matches!(
        op,
        Op::CallIntrinsic {
            intrinsic: Intrinsic::JsonParse,
            ..
        }
    )));
    // One presence check per field, and a SerializationError throw path.
    let has_checks = all_ops(body)
        .iter()
        .filter(|op| {
            matches!(
                op,
                Op::CallIntrinsic {
                    intrinsic: Intrinsic::JsonHas,
                    ..
                }
            )
        })
        .count();
    assert_eq!(has_checks, 2);
    let throws_serialization_error = body.blocks.iter().any(|blk| {
        matches!(blk.terminator, Some(Terminator::Throw { .. }))
            && blk
                .ops
                .iter()
                .any(|op| matches!(op, Op::New { class, .. } if *class == serialization_error))
    });
    assert!(throws_serialization_error);

    // Values land in the fields of a freshly allocated Point.
    assert!(all_ops(body)
        .iter()
        .any(|op| matches!(op, Op::New { class, .. } if *class == point)));
    assert!(all_ops(body)
        .iter()
        .any(|op| matches!(op, Op::SetField { .. })));
}
