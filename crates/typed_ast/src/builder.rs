//! # Typed AST Builder
//!
//! Fluent construction of well-typed programs without a parser. The
//! compiler's own tests build their inputs through this API, and embedders
//! can use it to drive the middle end directly.
//!
//! The builder owns the arena and the type context so that every literal it
//! creates carries a canonical handle.

use crate::arena::{StringArena, Symbol};
use crate::ast::*;
use crate::source::Span;
use crate::types::{
    ClassId, LayoutKind, PrimKind, SerializationPolicy, Type, TypeContext, TypeHandle,
};

/// Builder state: arena + type context + a binding-id counter standing in
/// for the semantic analyzer's.
pub struct AstBuilder {
    pub arena: StringArena,
    pub types: TypeContext,
    next_binding: u32,
}

impl AstBuilder {
    pub fn new() -> Self {
        let mut arena = StringArena::new();
        let types = TypeContext::new(&mut arena);
        Self {
            arena,
            types,
            next_binding: 0,
        }
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        self.arena.intern(s)
    }

    pub fn fresh_binding(&mut self) -> BindingId {
        let id = BindingId(self.next_binding);
        self.next_binding += 1;
        id
    }

    fn span(&self) -> Span {
        Span::empty(0)
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    pub fn t_i1(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::I1)
    }

    pub fn t_i32(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::I32)
    }

    pub fn t_i64(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::I64)
    }

    pub fn t_f32(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::F32)
    }

    pub fn t_f64(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::F64)
    }

    pub fn t_nil(&mut self) -> TypeHandle {
        self.types.primitive(PrimKind::Nil)
    }

    pub fn t_string(&mut self) -> TypeHandle {
        self.types.string_type()
    }

    pub fn t_class(&mut self, id: ClassId) -> TypeHandle {
        self.types.class_type(id)
    }

    pub fn t_array(&mut self, elem: TypeHandle) -> TypeHandle {
        self.types.intern(Type::Array(elem))
    }

    pub fn t_hash(&mut self, key: TypeHandle, value: TypeHandle) -> TypeHandle {
        self.types.intern(Type::Hash(key, value))
    }

    pub fn t_range(&mut self) -> TypeHandle {
        self.types.intern(Type::Range)
    }

    pub fn t_generic(&mut self, class: ClassId, args: Vec<TypeHandle>) -> TypeHandle {
        self.types.intern(Type::GenericInstance(class, args))
    }

    pub fn t_block(&mut self, params: Vec<TypeHandle>, ret: TypeHandle) -> TypeHandle {
        self.types.intern(Type::Block { params, ret })
    }

    pub fn t_future(&mut self, inner: TypeHandle) -> TypeHandle {
        self.types.intern(Type::Future(inner))
    }

    pub fn t_channel(&mut self, inner: TypeHandle) -> TypeHandle {
        self.types.intern(Type::Channel(inner))
    }

    /// Register a class in the type context. Fields and methods are attached
    /// afterwards with [`AstBuilder::class_decl`].
    pub fn declare_class(&mut self, name: &str, parent: Option<ClassId>) -> ClassId {
        let sym = self.intern(name);
        self.types.register_class(sym, parent, LayoutKind::Object, 0)
    }

    pub fn declare_class_with(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        layout: LayoutKind,
        type_params: u8,
    ) -> ClassId {
        let sym = self.intern(name);
        self.types.register_class(sym, parent, layout, type_params)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Integer literal typed as the language's default `Int` (i64).
    pub fn int(&mut self, v: i64) -> Expr {
        let ty = self.t_i64();
        typed_node(TypedExpr::LitInt(v), ty, self.span())
    }

    pub fn int32(&mut self, v: i32) -> Expr {
        let ty = self.t_i32();
        typed_node(TypedExpr::LitInt(v as i64), ty, self.span())
    }

    pub fn float(&mut self, v: f64) -> Expr {
        let ty = self.t_f64();
        typed_node(TypedExpr::LitFloat(v), ty, self.span())
    }

    pub fn boolean(&mut self, v: bool) -> Expr {
        let ty = self.t_i1();
        typed_node(TypedExpr::LitBool(v), ty, self.span())
    }

    pub fn string(&mut self, s: &str) -> Expr {
        let sym = self.intern(s);
        let ty = self.t_string();
        typed_node(TypedExpr::LitString(sym), ty, self.span())
    }

    pub fn nil(&mut self) -> Expr {
        let ty = self.t_nil();
        typed_node(TypedExpr::LitNil, ty, self.span())
    }

    pub fn local(&mut self, name: Symbol, binding: BindingId, ty: TypeHandle) -> Expr {
        typed_node(TypedExpr::Local { name, binding }, ty, self.span())
    }

    pub fn self_ref(&mut self, ty: TypeHandle) -> Expr {
        typed_node(TypedExpr::SelfRef, ty, self.span())
    }

    pub fn binary(&mut self, op: BinOp, lhs: Expr, rhs: Expr, ty: TypeHandle) -> Expr {
        typed_node(
            TypedExpr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            self.span(),
        )
    }

    pub fn logical(&mut self, op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
        let ty = self.t_i1();
        typed_node(
            TypedExpr::Logical {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            self.span(),
        )
    }

    pub fn unary(&mut self, op: UnOp, operand: Expr, ty: TypeHandle) -> Expr {
        typed_node(
            TypedExpr::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            self.span(),
        )
    }

    pub fn convert(&mut self, kind: ConvertKind, value: Expr, ty: TypeHandle) -> Expr {
        typed_node(
            TypedExpr::Convert {
                kind,
                value: Box::new(value),
            },
            ty,
            self.span(),
        )
    }

    pub fn field_get(&mut self, object: Expr, class: ClassId, field: &str, ty: TypeHandle) -> Expr {
        let field = self.intern(field);
        typed_node(
            TypedExpr::FieldGet {
                object: Box::new(object),
                class,
                field,
            },
            ty,
            self.span(),
        )
    }

    pub fn method_call(
        &mut self,
        receiver: Expr,
        method: &str,
        args: Vec<Expr>,
        ty: TypeHandle,
    ) -> Expr {
        let method = self.intern(method);
        typed_node(
            TypedExpr::MethodCall {
                receiver: Box::new(receiver),
                method,
                args,
            },
            ty,
            self.span(),
        )
    }

    pub fn static_call(
        &mut self,
        class: ClassId,
        method: &str,
        args: Vec<Expr>,
        ty: TypeHandle,
    ) -> Expr {
        let method = self.intern(method);
        typed_node(TypedExpr::StaticCall { class, method, args }, ty, self.span())
    }

    pub fn free_call(&mut self, function: &str, args: Vec<Expr>, ty: TypeHandle) -> Expr {
        let function = self.intern(function);
        typed_node(TypedExpr::FreeCall { function, args }, ty, self.span())
    }

    pub fn new_object(&mut self, class: ClassId, args: Vec<Expr>) -> Expr {
        let ty = self.t_class(class);
        typed_node(
            TypedExpr::New {
                class,
                type_args: vec![],
                args,
            },
            ty,
            self.span(),
        )
    }

    pub fn new_generic(
        &mut self,
        class: ClassId,
        type_args: Vec<TypeHandle>,
        args: Vec<Expr>,
    ) -> Expr {
        let ty = self.t_generic(class, type_args.clone());
        typed_node(TypedExpr::New { class, type_args, args }, ty, self.span())
    }

    pub fn array_lit(&mut self, elems: Vec<Expr>, elem_ty: TypeHandle) -> Expr {
        let ty = self.t_array(elem_ty);
        typed_node(TypedExpr::ArrayLit(elems), ty, self.span())
    }

    pub fn index(&mut self, object: Expr, index: Expr, ty: TypeHandle) -> Expr {
        typed_node(
            TypedExpr::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            ty,
            self.span(),
        )
    }

    pub fn range(&mut self, lo: Expr, hi: Expr) -> Expr {
        let ty = self.t_range();
        typed_node(
            TypedExpr::Range {
                lo: Box::new(lo),
                hi: Box::new(hi),
            },
            ty,
            self.span(),
        )
    }

    pub fn block_lit(&mut self, params: Vec<TypedParam>, body: TypedBody, ty: TypeHandle) -> Expr {
        typed_node(TypedExpr::BlockLit { params, body }, ty, self.span())
    }

    pub fn block_call(&mut self, callee: Expr, args: Vec<Expr>, ty: TypeHandle) -> Expr {
        typed_node(
            TypedExpr::BlockCall {
                callee: Box::new(callee),
                args,
            },
            ty,
            self.span(),
        )
    }

    pub fn await_expr(&mut self, future: Expr, ty: TypeHandle) -> Expr {
        typed_node(TypedExpr::Await(Box::new(future)), ty, self.span())
    }

    pub fn interp(&mut self, parts: Vec<InterpPart>) -> Expr {
        let ty = self.t_string();
        typed_node(TypedExpr::StringInterp { parts }, ty, self.span())
    }

    pub fn interp_lit(&mut self, s: &str) -> InterpPart {
        InterpPart::Lit(self.intern(s))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn expr_stmt(&mut self, e: Expr) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Expr(e), ty, self.span())
    }

    /// `let name = value`, assigning a fresh binding id.
    pub fn let_stmt(&mut self, name: &str, mutable: bool, value: Expr) -> (Stmt, BindingId) {
        let name = self.intern(name);
        let binding = self.fresh_binding();
        let ty = self.t_nil();
        let stmt = typed_node(
            TypedStmt::Let {
                name,
                binding,
                mutable,
                value,
            },
            ty,
            self.span(),
        );
        (stmt, binding)
    }

    pub fn assign_local(&mut self, name: Symbol, binding: BindingId, value: Expr) -> Stmt {
        let ty = self.t_nil();
        typed_node(
            TypedStmt::Assign {
                target: AssignTarget::Local { name, binding },
                value,
            },
            ty,
            self.span(),
        )
    }

    pub fn assign_field(&mut self, object: Expr, class: ClassId, field: &str, value: Expr) -> Stmt {
        let field = self.intern(field);
        let ty = self.t_nil();
        typed_node(
            TypedStmt::Assign {
                target: AssignTarget::Field { object, class, field },
                value,
            },
            ty,
            self.span(),
        )
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Return(value), ty, self.span())
    }

    pub fn if_stmt(&mut self, cond: Expr, then_body: TypedBody, else_body: Option<TypedBody>) -> Stmt {
        let ty = self.t_nil();
        typed_node(
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            },
            ty,
            self.span(),
        )
    }

    pub fn while_stmt(&mut self, cond: Expr, body: TypedBody) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::While { cond, body }, ty, self.span())
    }

    pub fn for_stmt(
        &mut self,
        name: &str,
        elem_ty: TypeHandle,
        iterable: Expr,
        body: TypedBody,
    ) -> (Stmt, BindingId) {
        let name = self.intern(name);
        let binding = self.fresh_binding();
        let ty = self.t_nil();
        let stmt = typed_node(
            TypedStmt::For {
                name,
                binding,
                elem_ty,
                iterable,
                body,
            },
            ty,
            self.span(),
        );
        (stmt, binding)
    }

    pub fn match_stmt(
        &mut self,
        scrutinee: Expr,
        arms: Vec<MatchArm>,
        default: Option<TypedBody>,
    ) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Match { scrutinee, arms, default }, ty, self.span())
    }

    pub fn arm(&mut self, pattern: TypedPattern, guard: Option<Expr>, body: TypedBody) -> MatchArm {
        MatchArm {
            pattern,
            guard,
            body,
            span: self.span(),
        }
    }

    pub fn try_stmt(
        &mut self,
        body: TypedBody,
        catches: Vec<CatchClause>,
        finally: Option<TypedBody>,
    ) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Try { body, catches, finally }, ty, self.span())
    }

    pub fn catch(&mut self, class: ClassId, name: &str, body: TypedBody) -> (CatchClause, BindingId) {
        let name = self.intern(name);
        let binding = self.fresh_binding();
        let clause = CatchClause {
            class,
            name,
            binding,
            body,
            span: self.span(),
        };
        (clause, binding)
    }

    pub fn throw_stmt(&mut self, value: Expr) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Throw(value), ty, self.span())
    }

    pub fn using_stmt(&mut self, name: &str, value: Expr, body: TypedBody) -> (Stmt, BindingId) {
        let name = self.intern(name);
        let binding = self.fresh_binding();
        let ty = self.t_nil();
        let stmt = typed_node(
            TypedStmt::Using {
                name,
                binding,
                value,
                body,
            },
            ty,
            self.span(),
        );
        (stmt, binding)
    }

    pub fn yield_stmt(&mut self, value: Expr) -> Stmt {
        let ty = self.t_nil();
        typed_node(TypedStmt::Yield(value), ty, self.span())
    }

    pub fn body(&mut self, statements: Vec<Stmt>) -> TypedBody {
        TypedBody {
            statements,
            span: self.span(),
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    pub fn param(&mut self, name: &str, ty: TypeHandle) -> TypedParam {
        let name = self.intern(name);
        let binding = self.fresh_binding();
        TypedParam {
            name,
            binding,
            ty,
            mutable: false,
            span: self.span(),
        }
    }

    pub fn function(
        &mut self,
        name: &str,
        params: Vec<TypedParam>,
        return_type: TypeHandle,
        body: Vec<Stmt>,
    ) -> TypedFunction {
        let body = self.body(body);
        TypedFunction {
            name: self.intern(name),
            params,
            return_type,
            body: Some(body),
            is_static: false,
            is_async: false,
            is_native: false,
            link_name: None,
            throws: vec![],
            span: self.span(),
        }
    }

    pub fn field(&mut self, name: &str, ty: TypeHandle) -> TypedField {
        TypedField {
            name: self.intern(name),
            ty,
            mutable: true,
            json_key: None,
            span: self.span(),
        }
    }

    /// Attach fields and methods to a previously declared class.
    pub fn class_decl(
        &mut self,
        id: ClassId,
        fields: Vec<TypedField>,
        methods: Vec<TypedFunction>,
    ) -> TypedClass {
        let info = self.types.class_info(id).expect("class not declared");
        let (name, parent, layout) = (info.name, info.parent, info.layout_kind);
        let type_params = (0..info.type_params)
            .map(|i| self.arena.intern(format!("T{i}")))
            .collect();
        TypedClass {
            id,
            name,
            parent,
            layout,
            serialization: SerializationPolicy::None,
            native_library: None,
            type_params,
            fields,
            methods,
            span: self.span(),
        }
    }

    pub fn program(&mut self, classes: Vec<TypedClass>, functions: Vec<TypedFunction>) -> TypedProgram {
        TypedProgram {
            classes,
            functions,
            span: self.span(),
        }
    }
}

impl Default for AstBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_fresh_bindings() {
        let mut b = AstBuilder::new();
        let i64_ty = b.t_i64();
        let p1 = b.param("a", i64_ty);
        let p2 = b.param("b", i64_ty);
        assert_ne!(p1.binding, p2.binding);
    }

    #[test]
    fn test_builder_literals_carry_canonical_types() {
        let mut b = AstBuilder::new();
        let x = b.int(1);
        let y = b.int(2);
        assert_eq!(x.ty, y.ty);
        let s = b.string("hi");
        assert_ne!(s.ty, x.ty);
    }

    #[test]
    fn test_class_decl_copies_registry_facts() {
        let mut b = AstBuilder::new();
        let animal = b.declare_class("Animal", None);
        let dog = b.declare_class("Dog", Some(animal));
        let decl = b.class_decl(dog, vec![], vec![]);
        assert_eq!(decl.parent, Some(animal));
        assert_eq!(b.arena.resolve(decl.name), "Dog");
    }
}
