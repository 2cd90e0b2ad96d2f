//! Dispatch lowering: virtual calls through stable v-table slots,
//! interface-like fallback for erased receivers, closures, and the
//! iterator protocol.

use ember_compiler::anvil::{AnvilFunction, AnvilModule, Op};
use ember_compiler::{compile_to_anvil, CompileConfig};
use ember_typed_ast::{
    AstBuilder, StringArena, TypeContext, TypedClass, TypedFunction,
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
fn test_virtual_dispatch_uses_the_declaring_slot() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let animal = b.declare_class("Animal", None);
    let dog = b.declare_class("Dog", Some(animal));

    let silence = b.string("...");
    let ret = b.ret(Some(silence));
    let animal_speak = b.function("speak", vec![], string_ty, vec![ret]);
    let woof = b.string("Woof!");
    let ret = b.ret(Some(woof));
    let dog_speak = b.function("speak", vec![], string_ty, vec![ret]);

    let animal_decl = b.class_decl(animal, vec![], vec![animal_speak]);
    let dog_decl = b.class_decl(dog, vec![], vec![dog_speak]);

    // main: let d = Dog.new(); d.speak()
    let new_dog = b.new_object(dog, vec![]);
    let (let_d, d) = b.let_stmt("d", false, new_dog);
    let d_sym = b.arena.get("d").unwrap();
    let dog_ty = b.t_class(dog);
    let recv = b.local(d_sym, d, dog_ty);
    let speak = b.method_call(recv, "speak", vec![], string_ty);
    let call_stmt = b.expr_stmt(speak);
    let main = b.function("main", vec![], nil_ty, vec![let_d, call_stmt]);

    let (module, arena, _) = compile(b, vec![animal_decl, dog_decl], vec![main]);
    let main = find_fn(&module, &arena, "main");

    let speak_sym = arena.get("speak").unwrap();
    let animal_slot = module.classes[&animal].methods[&(speak_sym, 0)]
        .vtable_slot
        .unwrap();
    let dog_slot = module.classes[&dog].methods[&(speak_sym, 0)]
        .vtable_slot
        .unwrap();
    assert_eq!(animal_slot, dog_slot, "override reuses the parent slot");

    let site_slot = all_ops(main)
        .iter()
        .find_map(|op| match op {
            Op::CallVirtual { class, slot, .. } if *class == dog => Some(*slot),
            _ => None,
        })
        .expect("speak dispatches virtually");
    assert_eq!(site_slot, dog_slot);

    // The v-table rows point at the overriding bodies.
    let dog_entry = &module.classes[&dog].vtable[dog_slot as usize];
    assert_eq!(dog_entry.class, dog);
}

#[test]
fn test_unknown_receiver_falls_back_to_interface_dispatch() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();
    let object = b.types.builtins().object;
    let object_ty = b.t_class(object);

    let p = b.param("o", object_ty);
    let recv = b.local(p.name, p.binding, object_ty);
    let call = b.method_call(recv, "speak", vec![], string_ty);
    let stmt = b.expr_stmt(call);
    let f = b.function("poke", vec![p], nil_ty, vec![stmt]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "poke");
    assert!(all_ops(f)
        .iter()
        .any(|op| matches!(op, Op::CallInterface { arity: 0, .. })));
}

#[test]
fn test_new_carries_initializer_arguments() {
    let mut b = AstBuilder::new();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let dog = b.declare_class("Dog", None);
    let name_field = b.field("name", string_ty);
    let p = b.param("name", string_ty);
    let self_ty = b.t_class(dog);
    let this = b.self_ref(self_ty);
    let arg = b.local(p.name, p.binding, string_ty);
    let set = b.assign_field(this, dog, "name", arg);
    let init = b.function("initialize", vec![p], nil_ty, vec![set]);
    let dog_decl = b.class_decl(dog, vec![name_field], vec![init]);

    let rex = b.string("Rex");
    let new_dog = b.new_object(dog, vec![rex]);
    let stmt = b.expr_stmt(new_dog);
    let main = b.function("main", vec![], nil_ty, vec![stmt]);

    let (module, arena, _) = compile(b, vec![dog_decl], vec![main]);
    let main = find_fn(&module, &arena, "main");
    assert!(all_ops(main).iter().any(
        |op| matches!(op, Op::New { class, args, .. } if *class == dog && args.len() == 1)
    ));
}

#[test]
fn test_iterator_protocol_calls_has_next_then_next() {
    let mut b = AstBuilder::new();
    let bool_ty = b.t_i1();
    let i64_ty = b.t_i64();
    let nil_ty = b.t_nil();

    let counter = b.declare_class("Counter", None);
    let t = b.boolean(false);
    let ret = b.ret(Some(t));
    let has_next = b.function("has_next", vec![], bool_ty, vec![ret]);
    let zero = b.int(0);
    let ret = b.ret(Some(zero));
    let next = b.function("next", vec![], i64_ty, vec![ret]);
    let counter_decl = b.class_decl(counter, vec![], vec![has_next, next]);

    let source = b.new_object(counter, vec![]);
    let body = b.body(vec![]);
    let (for_stmt, _) = b.for_stmt("x", i64_ty, source, body);
    let main = b.function("main", vec![], nil_ty, vec![for_stmt]);

    let (module, arena, _) = compile(b, vec![counter_decl], vec![main]);
    let main = find_fn(&module, &arena, "main");

    let has_next_sym = arena.get("has_next").unwrap();
    let next_sym = arena.get("next").unwrap();
    let has_next_slot = module.classes[&counter].methods[&(has_next_sym, 0)]
        .vtable_slot
        .unwrap();
    let next_slot = module.classes[&counter].methods[&(next_sym, 0)]
        .vtable_slot
        .unwrap();

    let mut has_next_block = None;
    let mut next_block = None;
    for (i, blk) in main.blocks.iter().enumerate() {
        for op in &blk.ops {
            if let Op::CallVirtual { slot, .. } = op {
                if *slot == has_next_slot {
                    has_next_block = Some(i);
                }
                if *slot == next_slot {
                    next_block = Some(i);
                }
            }
        }
    }
    let (header, body) = (
        has_next_block.expect("has_next is called"),
        next_block.expect("next is called"),
    );
    assert_ne!(header, body, "has_next guards the loop header, next runs in the body");

    // The body jumps back to the header: has_next runs before every next.
    let back = main.blocks[body..]
        .iter()
        .any(|blk| {
            blk.terminator
                .as_ref()
                .map(|t| t.successors().iter().any(|s| s.index() == header))
                .unwrap_or(false)
        });
    assert!(back);
}

#[test]
fn test_block_literal_becomes_a_capture_class() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let string_ty = b.t_string();
    let nil_ty = b.t_nil();

    let one = b.int(1);
    let (let_n, n) = b.let_stmt("n", false, one);
    let hello = b.string("hi");
    let (let_s, s) = b.let_stmt("s", false, hello);

    let n_sym = b.arena.get("n").unwrap();
    let s_sym = b.arena.get("s").unwrap();
    let use_n = b.local(n_sym, n, i64_ty);
    let use_s = b.local(s_sym, s, string_ty);
    let st1 = b.expr_stmt(use_n);
    let st2 = b.expr_stmt(use_s);
    let body = b.body(vec![st1, st2]);
    let block_ty = b.t_block(vec![], nil_ty);
    let blk = b.block_lit(vec![], body, block_ty);
    let use_blk = b.expr_stmt(blk);
    let host = b.function("host", vec![], nil_ty, vec![let_n, let_s, use_blk]);

    let (module, arena, types) = compile(b, vec![], vec![host]);

    let env_class = module
        .classes
        .values()
        .find(|c| arena.resolve(c.name).starts_with("host$block"))
        .expect("synthetic capture class");
    assert_eq!(env_class.fields.len(), 2);
    // The reference capture travels as a cell.
    let cell = types.builtins().cell;
    let cell_ty = env_class.fields[1].ty;
    assert!(matches!(
        types.type_of(cell_ty),
        ember_typed_ast::Type::Class(c) if *c == cell
    ));

    let call_sym = arena.get("call").unwrap();
    assert!(env_class.methods.contains_key(&(call_sym, 0)));

    let host = find_fn(&module, &arena, "host");
    let news = all_ops(host)
        .iter()
        .filter(|op| matches!(op, Op::New { class, .. } if *class == env_class.id))
        .count();
    assert_eq!(news, 1, "one allocation at the creation site");
    assert!(all_ops(host).iter().any(|op| matches!(op, Op::NewCell { .. })));
}

#[test]
fn test_block_invocation_is_interface_like() {
    let mut b = AstBuilder::new();
    let i64_ty = b.t_i64();
    let nil_ty = b.t_nil();
    let block_ty = b.t_block(vec![i64_ty], nil_ty);

    let p = b.param("f", block_ty);
    let callee = b.local(p.name, p.binding, block_ty);
    let arg = b.int(3);
    let call = b.block_call(callee, vec![arg], nil_ty);
    let stmt = b.expr_stmt(call);
    let f = b.function("apply", vec![p], nil_ty, vec![stmt]);

    let (module, arena, _) = compile(b, vec![], vec![f]);
    let f = find_fn(&module, &arena, "apply");
    let call_sym = arena.get("call").unwrap();
    assert!(all_ops(f).iter().any(|op| matches!(
        op,
        Op::CallInterface { name, arity: 1, .. } if *name == call_sym
    )));
}
