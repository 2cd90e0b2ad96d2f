//! NativeLibrary lowering: binding descriptors, thunks, and the call path
//! through the resolved symbol slot.

use ember_compiler::anvil::{AnvilModule, Op};
use ember_compiler::lowir::LowConst;
use ember_compiler::runtime_abi::RuntimeFn;
use ember_compiler::{compile_to_anvil, compile_to_lowir, CompileConfig};
use ember_typed_ast::{
    AstBuilder, NativeLibrarySpec, Platform, Span, StringArena, TypeContext, TypedClass,
    TypedFunction,
};

/// `class LibM < NativeLibrary` with one `@native` method `floor(f64) -> f64`.
fn libm(b: &mut AstBuilder) -> TypedClass {
    let f64_ty = b.t_f64();
    let lib = b.declare_class("LibM", None);
    let p = b.param("x", f64_ty);
    let floor = TypedFunction {
        name: b.intern("floor"),
        params: vec![p],
        return_type: f64_ty,
        body: None,
        is_static: true,
        is_async: false,
        is_native: true,
        link_name: Some(b.intern("floor")),
        throws: vec![],
        span: Span::empty(0),
    };
    let mut decl = b.class_decl(lib, vec![], vec![floor]);
    decl.native_library = Some(NativeLibrarySpec {
        paths: vec![
            (Platform::Linux, b.intern("libm.so.6")),
            (Platform::MacOs, b.intern("libSystem.dylib")),
        ],
    });
    decl
}

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

#[test]
fn test_native_method_gets_a_thunk() {
    let mut b = AstBuilder::new();
    let decl = libm(&mut b);
    let lib = decl.id;
    let (module, arena, _) = compile(b, vec![decl], vec![]);

    let desc = &module.classes[&lib];
    let ffi = desc.ffi.as_ref().expect("NativeLibrary binding");
    assert_eq!(ffi.paths.len(), 2);
    assert_eq!(ffi.symbols.len(), 1);
    assert_eq!(arena.resolve(ffi.symbols[0].link_name), "floor");

    // The thunk body is the single place holding the call_native opcode.
    let floor_sym = arena.get("floor").unwrap();
    let thunk_id = desc.methods[&(floor_sym, 1)].function.unwrap();
    let thunk = module.function(thunk_id).unwrap();
    let natives = thunk
        .blocks
        .iter()
        .flat_map(|blk| blk.ops.iter())
        .filter(|op| matches!(op, Op::CallNative { class, .. } if *class == lib))
        .count();
    assert_eq!(natives, 1);
}

#[test]
fn test_call_sites_route_through_the_thunk() {
    let mut b = AstBuilder::new();
    let decl = libm(&mut b);
    let lib = decl.id;
    let f64_ty = b.t_f64();
    let arg = b.float(2.5);
    let call = b.static_call(lib, "floor", vec![arg], f64_ty);
    let ret = b.ret(Some(call));
    let main = b.function("main", vec![], f64_ty, vec![ret]);

    let (module, arena, _) = compile(b, vec![decl], vec![main]);
    let floor_sym = arena.get("floor").unwrap();
    let thunk_id = module.classes[&lib].methods[&(floor_sym, 1)].function.unwrap();

    let main = module
        .functions
        .values()
        .find(|f| arena.resolve(f.name) == "main")
        .unwrap();
    let routed = main
        .blocks
        .iter()
        .flat_map(|blk| blk.ops.iter())
        .any(|op| matches!(op, Op::CallStatic { function, .. } if *function == thunk_id));
    assert!(routed, "user calls go through the marshalling thunk");
}

#[test]
fn test_lowir_emits_binding_slots_and_indirect_calls() {
    let mut b = AstBuilder::new();
    let decl = libm(&mut b);
    let program = b.program(vec![decl], vec![]);
    let AstBuilder {
        mut arena,
        mut types,
        ..
    } = b;
    let (_, low) = compile_to_lowir(&program, &mut types, &mut arena, &CompileConfig::default())
        .expect("program compiles to LowIR");

    assert!(low
        .constants
        .iter()
        .any(|c| matches!(c, LowConst::NativeLibrary { .. })));
    assert!(low.constants.iter().any(|c| matches!(
        c,
        LowConst::NativeSlot { link_name, .. } if link_name == "floor"
    )));

    let thunk = low
        .functions
        .iter()
        .find(|f| f.name == "floor")
        .expect("thunk function");
    let indirect = thunk
        .blocks
        .iter()
        .flat_map(|blk| blk.insts.iter())
        .any(|i| matches!(i, ember_compiler::lowir::LowInst::CallIndirect { .. }));
    assert!(indirect, "the thunk calls through the binding slot");
    // No runtime throw machinery involved in the plain call path.
    let rethrows = thunk
        .blocks
        .iter()
        .flat_map(|blk| blk.insts.iter())
        .filter(|i| {
            matches!(
                i,
                ember_compiler::lowir::LowInst::CallRuntime {
                    func: RuntimeFn::Rethrow,
                    ..
                }
            )
        })
        .count();
    assert_eq!(rethrows, 0);
}
