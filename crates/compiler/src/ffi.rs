//! # FFI Thunks
//!
//! A NativeLibrary class lowers to a descriptor with per-platform library
//! paths plus one bound symbol per `@native` method; the runtime resolves
//! the library and fills the binding slots at module load. Every `@native`
//! method gets one thunk function here, so marshalling lives in exactly one
//! place and ordinary call sites stay `call_static`.

use crate::anvil::*;
use crate::anvil_builder::FunctionBuilder;
use crate::lowering::Shared;
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{ClassId, PrimKind, Type, TypedFunction};

/// Argument and return types a thunk can marshal: primitives pass through
/// the platform ABI unchanged, `IntPtr` is the raw-pointer escape hatch,
/// and `String` crosses as a pointer the runtime understands.
fn marshallable(sh: &Shared<'_>, ty: ember_typed_ast::TypeHandle) -> bool {
    match sh.types.type_of(ty) {
        Type::Primitive(_) => true,
        Type::Class(c) => *c == sh.types.builtins().string,
        _ => false,
    }
}

pub(crate) fn lower_thunk<'p>(
    sh: &mut Shared<'p>,
    fid: FunctionId,
    class: ClassId,
    func: &'p TypedFunction,
) -> CompilerResult<()> {
    for p in &func.params {
        if !marshallable(sh, p.ty) {
            return Err(CompilerError::Unsupported {
                construct: "non-primitive FFI parameter".into(),
            });
        }
    }
    let returns_value = !matches!(
        sh.types.type_of(func.return_type),
        Type::Primitive(PrimKind::Nil)
    );
    if returns_value && !marshallable(sh, func.return_type) {
        return Err(CompilerError::Unsupported {
            construct: "non-primitive FFI return".into(),
        });
    }

    let params: Vec<_> = func.params.iter().map(|p| p.ty).collect();
    let mut fb = FunctionBuilder::new(
        fid,
        func.name,
        params,
        func.return_type,
        FunctionKind::Plain,
        func.span,
    );
    for p in &func.params {
        fb.add_local(p.name, p.ty);
    }

    let args: Vec<RegId> = (0..func.params.len())
        .map(|i| fb.load_local(LocalId(i as u32)))
        .collect();
    let dst = if returns_value {
        Some(fb.fresh_reg(func.return_type))
    } else {
        None
    };
    fb.push(Op::CallNative {
        dst,
        class,
        method: func.name,
        arity: func.arity(),
        args,
    });
    fb.ret(dst);
    sh.module.add_function(fb.finish());
    Ok(())
}
