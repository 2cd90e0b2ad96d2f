//! # Ember Compiler Middle End
//!
//! The pipeline from a typed AST to a backend-ready low IR:
//!
//! 1. **Resolve** (`resolver`): class descriptors, v-table layout, local
//!    slot maps, closure capture sets.
//! 2. **Lower to Anvil** (`lowering` and satellites): the object-aware IR:
//!    dispatch, exceptions, erased generics, closures, state machines, FFI
//!    thunks, serialization synthesis.
//! 3. **Verify** (`verify`): typed SSA discipline, terminator and
//!    try-region well-formedness, dispatch and FFI rules. Mandatory.
//! 4. **Lower to LowIR** (`lowir_lower`): machine-level SSA with runtime
//!    calls, object layouts, GC barriers and safe points, handed to the
//!    external native backend in memory.
//!
//! The middle end is single-threaded and performs no optimization; it emits
//! canonical lowerings the backend can optimize.

pub mod anvil;
pub mod anvil_builder;
pub mod closures;
pub mod dump;
pub mod ffi;
pub mod lowering;
pub mod lowir;
pub mod lowir_lower;
pub mod pattern_matching;
pub mod resolver;
pub mod runtime_abi;
pub mod serialization;
pub mod state_machine;
pub mod verify;

pub use anvil::{AnvilFunction, AnvilModule, BlockId, FunctionId, Op, RegId, Terminator};
pub use anvil_builder::FunctionBuilder;
pub use dump::dump_module;
pub use lowir::LowModule;
pub use resolver::{resolve, Resolution};
pub use runtime_abi::RuntimeFn;
pub use verify::verify_module;

use ember_typed_ast::{Span, StringArena, TypeContext, TypeError, TypedProgram};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompilerError {
    /// The typed AST violated the input contract (ill-typed, unresolved).
    #[error("ill-typed input at {span:?}: {message}")]
    InputContract { message: String, span: Span },

    /// A valid construct the middle end cannot lower yet.
    #[error("not-yet-implemented: {construct}")]
    Unsupported { construct: String },

    /// Resolver failure (duplicate field, bad override, ambiguous method).
    #[error("resolve error at {span:?}: {message}")]
    Resolve { message: String, span: Span },

    /// Verifier failure after lowering. Always a compiler bug.
    #[error("compiler bug: function {function:?}, block {block:?}: {message}")]
    Internal {
        function: anvil::FunctionId,
        block: Option<anvil::BlockId>,
        message: String,
    },

    #[error("lowering error: {message}")]
    Lowering { message: String, span: Option<Span> },

    #[error(transparent)]
    Type(#[from] TypeError),
}

pub type CompilerResult<T> = Result<T, CompilerError>;

/// Middle-end configuration.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Print the Anvil listing after verification.
    pub dump_anvil: bool,
    /// Module display name.
    pub module_name: String,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            dump_anvil: false,
            module_name: "main".to_string(),
        }
    }
}

/// Resolve, lower, and verify: typed AST → verified Anvil module.
pub fn compile_to_anvil(
    program: &TypedProgram,
    types: &mut TypeContext,
    arena: &mut StringArena,
    config: &CompileConfig,
) -> CompilerResult<AnvilModule> {
    log::debug!("resolving {} classes, {} functions", program.classes.len(), program.functions.len());
    let resolution = resolver::resolve(program, types, arena)?;

    log::debug!("lowering to Anvil");
    let module_name = arena.intern(&config.module_name);
    let module = lowering::lower_program(program, &resolution, types, arena, module_name)?;

    log::debug!("verifying {} Anvil functions", module.functions.len());
    verify::verify_module(&module, types)?;

    if config.dump_anvil {
        println!("{}", dump::dump_module(&module, arena, types));
    }
    Ok(module)
}

/// The full middle end: typed AST → verified Anvil → LowIR.
pub fn compile_to_lowir(
    program: &TypedProgram,
    types: &mut TypeContext,
    arena: &mut StringArena,
    config: &CompileConfig,
) -> CompilerResult<(AnvilModule, lowir::LowModule)> {
    let anvil = compile_to_anvil(program, types, arena, config)?;
    log::debug!("lowering to LowIR");
    let low = lowir_lower::lower_module(&anvil, types, arena)?;
    Ok((anvil, low))
}
