//! # JSON Serialization Synthesis
//!
//! Classes declared `serializable: json` get two synthetic methods. The
//! resolver reserves their handles; the bodies are emitted here:
//!
//! - `to_json()` walks the field list in declaration order and builds the
//!   document with runtime string concatenation, honouring per-field
//!   `@json(name: …)` key overrides;
//! - `from_json(s)` parses, then populates field by field, throwing
//!   `SerializationError` when a required key is missing. Reflection reads
//!   the same descriptor at runtime.

use crate::anvil::*;
use crate::anvil_builder::FunctionBuilder;
use crate::lowering::Shared;
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{ClassId, PrimKind, Span, Type, TypeHandle};

fn json_fields(sh: &Shared<'_>, class: ClassId) -> Vec<(u16, FieldSlot)> {
    let desc = sh.module.class(class).expect("serializable class");
    let disposed = sh.wk.disposed_flag;
    desc.fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name != disposed)
        .map(|(i, f)| (i as u16, f.clone()))
        .collect()
}

pub(crate) fn lower_to_json(sh: &mut Shared<'_>, fid: FunctionId, class: ClassId) -> CompilerResult<()> {
    let class_ty = sh.types.class_type(class);
    let string_ty = sh.types.string_type();
    let mut fb = FunctionBuilder::new(
        fid,
        sh.wk.to_json,
        vec![class_ty],
        string_ty,
        FunctionKind::Plain,
        Span::empty(0),
    );
    fb.add_local(sh.wk.self_, class_ty);

    let fields = json_fields(sh, class);
    let open = sh.arena.intern("{");
    let open = sh.module.intern_string(open);
    let mut acc = fb.const_string(open, string_ty);

    let mut concat = |fb: &mut FunctionBuilder, acc: RegId, piece: RegId| {
        let dst = fb.fresh_reg(string_ty);
        fb.push(Op::StringConcat {
            dst,
            lhs: acc,
            rhs: piece,
        });
        dst
    };

    for (i, (slot, field)) in fields.iter().enumerate() {
        let key = field.json_key.unwrap_or(field.name);
        let prefix = if i == 0 {
            format!("\"{}\":", sh.arena.resolve(key))
        } else {
            format!(",\"{}\":", sh.arena.resolve(key))
        };
        let prefix = sh.arena.intern(prefix);
        let prefix = sh.module.intern_string(prefix);
        let prefix = fb.const_string(prefix, string_ty);
        acc = concat(&mut fb, acc, prefix);

        let this = fb.load_local(LocalId(0));
        let value = fb.get_field(this, class, *slot, field.ty);
        let rendered = render_value(sh, &mut fb, value, field.ty, string_ty)?;
        acc = concat(&mut fb, acc, rendered);
    }

    let close = sh.arena.intern("}");
    let close = sh.module.intern_string(close);
    let close = fb.const_string(close, string_ty);
    acc = concat(&mut fb, acc, close);
    fb.ret(Some(acc));
    sh.module.add_function(fb.finish());
    Ok(())
}

fn render_value(
    sh: &mut Shared<'_>,
    fb: &mut FunctionBuilder,
    value: RegId,
    ty: TypeHandle,
    string_ty: TypeHandle,
) -> CompilerResult<RegId> {
    match sh.types.type_of(ty).clone() {
        Type::Primitive(PrimKind::I1) => Ok(fb
            .call_intrinsic(Intrinsic::BoolToString, vec![value], Some(string_ty))
            .expect("intrinsic returns")),
        Type::Primitive(PrimKind::I8 | PrimKind::I32 | PrimKind::I64) => Ok(fb
            .call_intrinsic(Intrinsic::IntToString, vec![value], Some(string_ty))
            .expect("intrinsic returns")),
        Type::Primitive(PrimKind::F64) => Ok(fb
            .call_intrinsic(Intrinsic::DoubleToString, vec![value], Some(string_ty))
            .expect("intrinsic returns")),
        Type::Primitive(PrimKind::F32) => {
            let f64_ty = sh.types.primitive(PrimKind::F64);
            let wide = fb.fresh_reg(f64_ty);
            fb.push(Op::F32ToF64 {
                dst: wide,
                src: value,
            });
            Ok(fb
                .call_intrinsic(Intrinsic::DoubleToString, vec![wide], Some(string_ty))
                .expect("intrinsic returns"))
        }
        Type::Class(c) if c == sh.types.builtins().string => {
            // Quote and escape.
            let quote = sh.arena.intern("\"");
            let quote = sh.module.intern_string(quote);
            let q1 = fb.const_string(quote, string_ty);
            let escaped = fb
                .call_intrinsic(Intrinsic::JsonEscape, vec![value], Some(string_ty))
                .expect("intrinsic returns");
            let dst = fb.fresh_reg(string_ty);
            fb.push(Op::StringConcat {
                dst,
                lhs: q1,
                rhs: escaped,
            });
            let q2 = fb.const_string(quote, string_ty);
            let out = fb.fresh_reg(string_ty);
            fb.push(Op::StringConcat {
                dst: out,
                lhs: dst,
                rhs: q2,
            });
            Ok(out)
        }
        Type::Class(c) => {
            // Nested serializable objects embed their own document.
            let desc = sh.module.class(c).ok_or_else(|| CompilerError::Lowering {
                message: "serializable field of unknown class".into(),
                span: None,
            })?;
            let handle = desc.methods.get(&(sh.wk.to_json, 0)).cloned();
            match handle.and_then(|m| m.vtable_slot) {
                Some(slot) => Ok(fb
                    .call_virtual(c, slot, vec![value], Some(string_ty))
                    .expect("to_json returns")),
                None => Err(CompilerError::Lowering {
                    message: "field class is not serializable".into(),
                    span: None,
                }),
            }
        }
        _ => Err(CompilerError::Lowering {
            message: "field type has no JSON rendering".into(),
            span: None,
        }),
    }
}

pub(crate) fn lower_from_json(
    sh: &mut Shared<'_>,
    fid: FunctionId,
    class: ClassId,
) -> CompilerResult<()> {
    let class_ty = sh.types.class_type(class);
    let string_ty = sh.types.string_type();
    let intptr = sh.types.primitive(PrimKind::IntPtr);
    let bool_ty = sh.types.bool_type();
    let source = sh.arena.intern("s");
    let mut fb = FunctionBuilder::new(
        fid,
        sh.wk.from_json,
        vec![string_ty],
        class_ty,
        FunctionKind::Plain,
        Span::empty(0),
    );
    fb.add_local(source, string_ty);

    let s = fb.load_local(LocalId(0));
    let doc = fb
        .call_intrinsic(Intrinsic::JsonParse, vec![s], Some(intptr))
        .expect("json_parse returns");
    let obj = fb.new_object(class, vec![], class_ty);

    let fields = json_fields(sh, class);
    let serialization_error = sh.types.builtins().serialization_error;
    for (slot, field) in fields {
        let key = field.json_key.unwrap_or(field.name);
        let key_lit = sh.module.intern_string(key);
        let key_reg = fb.const_string(key_lit, string_ty);
        let has = fb
            .call_intrinsic(Intrinsic::JsonHas, vec![doc, key_reg], Some(bool_ty))
            .expect("json_has returns");

        let ok_blk = fb.new_block();
        let missing_blk = fb.new_block();
        fb.cond_jump(has, ok_blk, missing_blk);

        fb.switch_to(missing_blk);
        let msg = sh
            .arena
            .intern(format!("missing field: {}", sh.arena.resolve(key)));
        let msg = sh.module.intern_string(msg);
        let msg = fb.const_string(msg, string_ty);
        let err_ty = sh.types.class_type(serialization_error);
        let err = fb.new_object(serialization_error, vec![msg], err_ty);
        fb.throw(err);

        fb.switch_to(ok_blk);
        let key_reg = fb.const_string(key_lit, string_ty);
        let value = read_field(sh, &mut fb, doc, key_reg, field.ty, class)?;
        fb.set_field(obj, class, slot, value);
    }

    fb.ret(Some(obj));
    sh.module.add_function(fb.finish());
    Ok(())
}

fn read_field(
    sh: &mut Shared<'_>,
    fb: &mut FunctionBuilder,
    doc: RegId,
    key: RegId,
    ty: TypeHandle,
    _owner: ClassId,
) -> CompilerResult<RegId> {
    let string_ty = sh.types.string_type();
    match sh.types.type_of(ty).clone() {
        Type::Primitive(PrimKind::I1) => Ok(fb
            .call_intrinsic(Intrinsic::JsonGetBool, vec![doc, key], Some(ty))
            .expect("json getter returns")),
        Type::Primitive(PrimKind::I8 | PrimKind::I32 | PrimKind::I64) => Ok(fb
            .call_intrinsic(Intrinsic::JsonGetInt, vec![doc, key], Some(ty))
            .expect("json getter returns")),
        Type::Primitive(PrimKind::F32 | PrimKind::F64) => Ok(fb
            .call_intrinsic(Intrinsic::JsonGetDouble, vec![doc, key], Some(ty))
            .expect("json getter returns")),
        Type::Class(c) if c == sh.types.builtins().string => Ok(fb
            .call_intrinsic(Intrinsic::JsonGetString, vec![doc, key], Some(string_ty))
            .expect("json getter returns")),
        Type::Class(c) => {
            // Nested object: take the raw sub-document and parse it through
            // the class's own from_json.
            let desc = sh.module.class(c).ok_or_else(|| CompilerError::Lowering {
                message: "deserializable field of unknown class".into(),
                span: None,
            })?;
            let from_json = desc
                .methods
                .get(&(sh.wk.from_json, 1))
                .and_then(|m| m.function)
                .ok_or_else(|| CompilerError::Lowering {
                    message: "field class is not serializable".into(),
                    span: None,
                })?;
            let sub = fb
                .call_intrinsic(Intrinsic::JsonGetString, vec![doc, key], Some(string_ty))
                .expect("json getter returns");
            Ok(fb
                .call_static(from_json, vec![sub], Some(ty))
                .expect("from_json returns"))
        }
        _ => Err(CompilerError::Lowering {
            message: "field type has no JSON parsing".into(),
            span: None,
        }),
    }
}
