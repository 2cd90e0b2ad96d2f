//! # Ember Typed AST
//!
//! The input contract of the Ember middle end, plus the canonical type
//! context (Component A of the pipeline).
//!
//! The frontend (lexer, parser, semantic analyzer) produces a
//! [`TypedProgram`] in which every expression node carries a canonical
//! [`TypeHandle`] and every identifier reference carries a resolver-assigned
//! [`BindingId`]. This crate owns:
//!
//! - the string arena ([`StringArena`] / [`Symbol`]),
//! - source spans ([`Span`]),
//! - the interned type universe ([`TypeContext`]) with nominal subtyping and
//!   the class layout rules,
//! - the typed AST node definitions,
//! - a builder DSL ([`AstBuilder`]) used by tests and embedders to construct
//!   well-typed programs without a parser.
//!
//! Nothing here mutates during lowering: the compiler crate borrows the
//! program and the context immutably and writes into its own module.

pub mod arena;
pub mod ast;
pub mod builder;
pub mod source;
pub mod types;

pub use arena::{StringArena, Symbol};
pub use ast::{
    typed_node, AssignTarget, BinOp, BindingId, CatchClause, ConvertKind, Expr, InterpPart,
    LogicalOp, MatchArm, NativeLibrarySpec, Platform, Stmt, TypedBody, TypedClass, TypedExpr,
    TypedField, TypedFunction, TypedNode, TypedParam, TypedPattern, TypedProgram, TypedStmt, UnOp,
};
pub use builder::AstBuilder;
pub use source::{Location, SourceFile, Span};
pub use types::{
    Builtins, ClassId, ClassInfo, LayoutDescriptor, LayoutField, LayoutKind, PrimKind,
    SerializationPolicy, TargetLayout, Type, TypeContext, TypeError, TypeHandle,
    OBJECT_HEADER_SIZE,
};
