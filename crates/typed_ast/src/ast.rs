//! # Typed AST
//!
//! The input contract of the middle end: the representation the semantic
//! analyzer hands over. Every expression node carries a canonical
//! `TypeHandle`; every identifier reference carries the sema-assigned
//! `BindingId`. The middle end never infers a type and never resolves a
//! name textually except through the symbol resolver's tables.

use crate::arena::Symbol;
use crate::source::Span;
use crate::types::{ClassId, LayoutKind, SerializationPolicy, TypeHandle};
use serde::{Deserialize, Serialize};

/// Unique id the semantic analyzer assigns to every local binding
/// (parameters, `let`s, `for`/`using`/pattern bindings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingId(pub u32);

/// Every typed node wraps its content with a type handle and a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedNode<T> {
    pub node: T,
    pub ty: TypeHandle,
    pub span: Span,
}

impl<T> TypedNode<T> {
    pub fn new(node: T, ty: TypeHandle, span: Span) -> Self {
        Self { node, ty, span }
    }
}

pub type Expr = TypedNode<TypedExpr>;
pub type Stmt = TypedNode<TypedStmt>;

/// The root of a compilation unit: one source file, fully elaborated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedProgram {
    pub classes: Vec<TypedClass>,
    /// Free functions, including `main` when present.
    pub functions: Vec<TypedFunction>,
    pub span: Span,
}

/// A class declaration with the hierarchy already elaborated by sema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedClass {
    /// Registered in the `TypeContext` by the frontend before handoff.
    pub id: ClassId,
    pub name: Symbol,
    pub parent: Option<ClassId>,
    pub layout: LayoutKind,
    pub serialization: SerializationPolicy,
    /// Present iff this is a NativeLibrary class.
    pub native_library: Option<NativeLibrarySpec>,
    pub type_params: Vec<Symbol>,
    pub fields: Vec<TypedField>,
    pub methods: Vec<TypedFunction>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedField {
    pub name: Symbol,
    pub ty: TypeHandle,
    pub mutable: bool,
    /// `@json(name: …)` key override for serializable classes.
    pub json_key: Option<Symbol>,
    pub span: Span,
}

/// Per-platform shared-library paths of a NativeLibrary class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeLibrarySpec {
    pub paths: Vec<(Platform, Symbol)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

/// A function or method body as sema hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedFunction {
    pub name: Symbol,
    pub params: Vec<TypedParam>,
    pub return_type: TypeHandle,
    /// `None` for `@native` methods.
    pub body: Option<TypedBody>,
    pub is_static: bool,
    pub is_async: bool,
    pub is_native: bool,
    /// Symbol name override for `@native` methods.
    pub link_name: Option<Symbol>,
    pub throws: Vec<TypeHandle>,
    pub span: Span,
}

impl TypedFunction {
    pub fn arity(&self) -> u8 {
        self.params.len() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedParam {
    pub name: Symbol,
    pub binding: BindingId,
    pub ty: TypeHandle,
    pub mutable: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedBody {
    pub statements: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedStmt {
    Expr(Expr),
    Let {
        name: Symbol,
        binding: BindingId,
        mutable: bool,
        value: Expr,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_body: TypedBody,
        else_body: Option<TypedBody>,
    },
    While {
        cond: Expr,
        body: TypedBody,
    },
    /// `for x in e:`. Arrays and ranges iterate with built-in iterators,
    /// everything else through the `has_next`/`next` protocol.
    For {
        name: Symbol,
        binding: BindingId,
        /// Type of the bound element, as sema inferred it.
        elem_ty: TypeHandle,
        iterable: Expr,
        body: TypedBody,
    },
    Match {
        scrutinee: Expr,
        arms: Vec<MatchArm>,
        /// Required for non-exhaustive matches over open types; when absent
        /// the lowerer emits a `MatchError` trap.
        default: Option<TypedBody>,
    },
    Try {
        body: TypedBody,
        catches: Vec<CatchClause>,
        finally: Option<TypedBody>,
    },
    Throw(Expr),
    /// `using v = e: body`. `v.dispose()` runs on every exit edge.
    Using {
        name: Symbol,
        binding: BindingId,
        value: Expr,
        body: TypedBody,
    },
    /// Marks the containing function as a generator.
    Yield(Expr),
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Local {
        name: Symbol,
        binding: BindingId,
    },
    Field {
        object: Expr,
        class: ClassId,
        field: Symbol,
    },
    Index {
        object: Expr,
        index: Expr,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: TypedPattern,
    pub guard: Option<Expr>,
    pub body: TypedBody,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedPattern {
    /// Integer literal arm; groups of these become one `switch`.
    LitInt(i64),
    LitBool(bool),
    LitString(Symbol),
    /// Class test, optionally binding the narrowed scrutinee.
    Class {
        class: ClassId,
        binding: Option<BindingId>,
        name: Option<Symbol>,
    },
    /// Always matches, optionally binding the scrutinee.
    Wildcard {
        binding: Option<BindingId>,
        name: Option<Symbol>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    pub class: ClassId,
    pub name: Symbol,
    pub binding: BindingId,
    pub body: TypedBody,
    pub span: Span,
}

/// Explicit conversions. Sema inserts these; the middle end never emits an
/// implicit coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvertKind {
    IntToFloat,
    /// Truncating.
    FloatToInt,
    /// Sign-extending.
    I32ToI64,
    F32ToF64,
    /// Box a primitive at a generic boundary.
    Box,
    /// Unbox back to the primitive recorded on the node type.
    Unbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterpPart {
    Lit(Symbol),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedExpr {
    LitInt(i64),
    LitFloat(f64),
    LitBool(bool),
    LitString(Symbol),
    LitNil,
    /// A resolved local or parameter.
    Local {
        name: Symbol,
        binding: BindingId,
    },
    SelfRef,
    FieldGet {
        object: Box<Expr>,
        class: ClassId,
        field: Symbol,
    },
    /// `C.m(args...)`: static dispatch.
    StaticCall {
        class: ClassId,
        method: Symbol,
        args: Vec<Expr>,
    },
    /// `recv.m(args...)`: virtual when the receiver class is known, dynamic
    /// lookup when the receiver is erased.
    MethodCall {
        receiver: Box<Expr>,
        method: Symbol,
        args: Vec<Expr>,
    },
    /// Free-function call, resolved by name against the module scope.
    FreeCall {
        function: Symbol,
        args: Vec<Expr>,
    },
    /// `C.new(args…)`, allocating and running `initialize`.
    New {
        class: ClassId,
        type_args: Vec<TypeHandle>,
        args: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Short-circuit `and`/`or`.
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Convert {
        kind: ConvertKind,
        value: Box<Expr>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    HashLit(Vec<(Expr, Expr)>),
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
    },
    TupleLit(Vec<Expr>),
    /// `do |x|: ...`, a block literal; captures are computed by the resolver.
    BlockLit {
        params: Vec<TypedParam>,
        body: TypedBody,
    },
    /// Invoking a block-typed value.
    BlockCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Await(Box<Expr>),
    /// `"...${e}..."`, evaluated strictly left to right.
    StringInterp {
        parts: Vec<InterpPart>,
    },
}

pub fn typed_node<T>(node: T, ty: TypeHandle, span: Span) -> TypedNode<T> {
    TypedNode::new(node, ty, span)
}
