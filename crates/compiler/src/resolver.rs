//! # Symbol Resolver
//!
//! Walks the typed AST top-down and produces everything the lowerer needs to
//! resolve names into handles:
//!
//! - one finished [`ClassDescriptor`] per class: flattened fields, method
//!   table, v-table layout (overrides reuse the parent slot, new virtual
//!   methods append), byte layout published into the type context;
//! - a [`FunctionId`] for every declared function and method body;
//! - per function: the ordered local-slot map from sema binding ids;
//! - per block expression: the free-variable set, each capture classified
//!   *by-copy* (immutable primitive) or *by-cell* (mutable or reference).
//!
//! Fatal conditions: duplicate field name, incompatible override signature,
//! ambiguous method resolution.

use crate::anvil::{
    ClassDescriptor, DispatchMode, FfiBinding, FieldSlot, FunctionId, MethodHandle, NativeSymbol,
    VTableEntry,
};
use crate::{CompilerError, CompilerResult};
use ember_typed_ast::{
    AssignTarget, BindingId, ClassId, Expr, InterpPart, LayoutKind, PrimKind, SerializationPolicy,
    StringArena, Symbol, Type, TypeContext, TypeHandle, TypedBody, TypedClass, TypedExpr,
    TypedFunction, TypedPattern, TypedProgram, TypedStmt,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Where a function id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKey {
    Free(Symbol),
    Method {
        class: ClassId,
        name: Symbol,
        arity: u8,
    },
}

/// One local declaration, in slot order: parameters first, then body
/// bindings in source order.
#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub binding: BindingId,
    pub name: Symbol,
    pub ty: TypeHandle,
}

#[derive(Debug, Clone, Default)]
pub struct FnLocals {
    pub slots: Vec<LocalDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    ByCopy,
    ByCell,
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub binding: BindingId,
    pub name: Symbol,
    pub ty: TypeHandle,
    pub mode: CaptureMode,
}

/// Captures of one block literal, recorded in pre-order per host function.
#[derive(Debug, Clone, Default)]
pub struct BlockCaptures {
    pub captures: Vec<Capture>,
}

/// Function ids of the synthesized builtin method bodies.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFns {
    pub object_to_string: FunctionId,
    pub string_to_string: FunctionId,
    pub exception_initialize: FunctionId,
    pub exception_to_string: FunctionId,
}

/// Resolver output, borrowed by the lowerer.
pub struct Resolution {
    pub classes: IndexMap<ClassId, ClassDescriptor>,
    pub function_ids: HashMap<FuncKey, FunctionId>,
    pub locals: HashMap<FunctionId, FnLocals>,
    /// Block-literal captures per host function, depth-first pre-order.
    pub captures: HashMap<FunctionId, Vec<BlockCaptures>>,
    /// Bindings that must live in a heap cell (captured by-cell somewhere).
    pub cell_bindings: HashMap<FunctionId, HashSet<BindingId>>,
    pub binding_types: HashMap<BindingId, TypeHandle>,
    pub builtin_fns: BuiltinFns,
    next_function: u32,
}

impl Resolution {
    pub fn function_id(&self, key: FuncKey) -> Option<FunctionId> {
        self.function_ids.get(&key).copied()
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(&id)
    }

    /// Method lookup; descriptors already hold the flattened table, so no
    /// chain walk is needed.
    pub fn method(&self, class: ClassId, name: Symbol, arity: u8) -> Option<&MethodHandle> {
        self.classes.get(&class)?.methods.get(&(name, arity))
    }

    /// First id the lowerer may hand to synthesized functions.
    pub fn next_function_id(&self) -> u32 {
        self.next_function
    }
}

/// Entry point: resolve a program against the type context.
pub fn resolve(
    program: &TypedProgram,
    types: &mut TypeContext,
    arena: &mut StringArena,
) -> CompilerResult<Resolution> {
    let mut resolver = Resolver {
        types,
        arena,
        classes: IndexMap::new(),
        function_ids: HashMap::new(),
        locals: HashMap::new(),
        captures: HashMap::new(),
        cell_bindings: HashMap::new(),
        binding_types: HashMap::new(),
        next_function: 0,
    };
    let builtin_fns = resolver.declare_builtins();
    resolver.assign_function_ids(program)?;
    resolver.build_class_descriptors(program, &builtin_fns)?;
    resolver.analyze_functions(program)?;

    Ok(Resolution {
        classes: resolver.classes,
        function_ids: resolver.function_ids,
        locals: resolver.locals,
        captures: resolver.captures,
        cell_bindings: resolver.cell_bindings,
        binding_types: resolver.binding_types,
        builtin_fns,
        next_function: resolver.next_function,
    })
}

struct Resolver<'a> {
    types: &'a mut TypeContext,
    arena: &'a mut StringArena,
    classes: IndexMap<ClassId, ClassDescriptor>,
    function_ids: HashMap<FuncKey, FunctionId>,
    locals: HashMap<FunctionId, FnLocals>,
    captures: HashMap<FunctionId, Vec<BlockCaptures>>,
    cell_bindings: HashMap<FunctionId, HashSet<BindingId>>,
    binding_types: HashMap<BindingId, TypeHandle>,
    next_function: u32,
}

impl<'a> Resolver<'a> {
    fn fresh_fn(&mut self) -> FunctionId {
        let id = FunctionId(self.next_function);
        self.next_function += 1;
        id
    }

    /// Descriptors and synthetic method ids for the builtin classes.
    fn declare_builtins(&mut self) -> BuiltinFns {
        let b = *self.types.builtins();
        let to_string = self.arena.intern("to_string");
        let initialize = self.arena.intern("initialize");
        let message = self.arena.intern("message");
        let value = self.arena.intern("value");

        let string_ty = self.types.string_type();
        let object_to_string = self.fresh_fn();
        let string_to_string = self.fresh_fn();
        let exception_initialize = self.fresh_fn();
        let exception_to_string = self.fresh_fn();

        // Object: the root. One virtual slot: to_string.
        let mut object_methods = IndexMap::new();
        object_methods.insert(
            (to_string, 0u8),
            MethodHandle {
                owner: b.object,
                name: to_string,
                params: vec![],
                ret: string_ty,
                function: Some(object_to_string),
                dispatch: DispatchMode::Virtual,
                throws: vec![],
                vtable_slot: Some(0),
            },
        );
        let object_vtable = vec![VTableEntry {
            name: to_string,
            arity: 0,
            class: b.object,
            function: object_to_string,
        }];
        self.install_builtin(b.object, None, vec![], object_methods.clone(), object_vtable.clone());

        // String overrides to_string with the identity.
        let mut string_methods = object_methods.clone();
        string_methods.insert(
            (to_string, 0),
            MethodHandle {
                owner: b.string,
                name: to_string,
                params: vec![],
                ret: string_ty,
                function: Some(string_to_string),
                dispatch: DispatchMode::Virtual,
                throws: vec![],
                vtable_slot: Some(0),
            },
        );
        let mut string_vtable = object_vtable.clone();
        string_vtable[0] = VTableEntry {
            name: to_string,
            arity: 0,
            class: b.string,
            function: string_to_string,
        };
        self.install_builtin(b.string, Some(b.object), vec![], string_methods, string_vtable);

        // Cells: one slot each, accessed through the cell opcodes. The raw
        // variant holds primitives and is excluded from GC scanning.
        let object_ty = self.types.class_type(b.object);
        self.install_builtin(
            b.cell,
            Some(b.object),
            vec![(value, object_ty)],
            object_methods.clone(),
            object_vtable.clone(),
        );
        let intptr_ty = self.types.primitive(PrimKind::IntPtr);
        self.install_builtin(
            b.raw_cell,
            Some(b.object),
            vec![(value, intptr_ty)],
            object_methods.clone(),
            object_vtable.clone(),
        );

        // Exception root: message field, initialize, to_string override.
        let mut exc_methods = object_methods.clone();
        exc_methods.insert(
            (initialize, 1),
            MethodHandle {
                owner: b.exception,
                name: initialize,
                params: vec![string_ty],
                ret: self.types.nil_type(),
                function: Some(exception_initialize),
                dispatch: DispatchMode::Static,
                throws: vec![],
                vtable_slot: None,
            },
        );
        exc_methods.insert(
            (to_string, 0),
            MethodHandle {
                owner: b.exception,
                name: to_string,
                params: vec![],
                ret: string_ty,
                function: Some(exception_to_string),
                dispatch: DispatchMode::Virtual,
                throws: vec![],
                vtable_slot: Some(0),
            },
        );
        let mut exc_vtable = object_vtable.clone();
        exc_vtable[0] = VTableEntry {
            name: to_string,
            arity: 0,
            class: b.exception,
            function: exception_to_string,
        };
        self.install_builtin(
            b.exception,
            Some(b.object),
            vec![(message, string_ty)],
            exc_methods.clone(),
            exc_vtable.clone(),
        );

        // Error subclasses prefix-share everything with Exception.
        for err in [
            b.division_by_zero_error,
            b.index_out_of_bounds_error,
            b.null_reference_error,
            b.match_error,
            b.serialization_error,
        ] {
            self.install_builtin(
                err,
                Some(b.exception),
                vec![(message, string_ty)],
                exc_methods.clone(),
                exc_vtable.clone(),
            );
        }

        // Namespace-only builtins: no instances, calls become intrinsics.
        for ns in [b.io, b.thread, b.reflect, b.channel] {
            self.install_builtin(ns, Some(b.object), vec![], object_methods.clone(), object_vtable.clone());
        }

        // Box classes: a single `value` slot of the boxed primitive.
        for kind in [
            PrimKind::I1,
            PrimKind::I8,
            PrimKind::I32,
            PrimKind::I64,
            PrimKind::F32,
            PrimKind::F64,
        ] {
            let class = b.box_class(kind).expect("boxable kind");
            let prim_ty = self.types.primitive(kind);
            self.install_builtin(
                class,
                Some(b.object),
                vec![(value, prim_ty)],
                object_methods.clone(),
                object_vtable.clone(),
            );
        }

        BuiltinFns {
            object_to_string,
            string_to_string,
            exception_initialize,
            exception_to_string,
        }
    }

    fn install_builtin(
        &mut self,
        id: ClassId,
        parent: Option<ClassId>,
        fields: Vec<(Symbol, TypeHandle)>,
        methods: IndexMap<(Symbol, u8), MethodHandle>,
        vtable: Vec<VTableEntry>,
    ) {
        let info = self.types.class_info(id).expect("builtin registered");
        let name = info.name;
        let layout = self.types.compute_layout(LayoutKind::Object, &fields);
        let field_slots: Vec<FieldSlot> = fields
            .iter()
            .zip(layout.fields.iter())
            .map(|(&(fname, fty), lf)| FieldSlot {
                name: fname,
                ty: fty,
                offset: lf.offset,
                json_key: None,
                declared_in: id,
                erased: false,
            })
            .collect();
        self.types.set_layout(id, layout);
        self.classes.insert(
            id,
            ClassDescriptor {
                id,
                name,
                parent,
                fields: field_slots,
                methods,
                vtable,
                layout_kind: LayoutKind::Object,
                serialization: SerializationPolicy::None,
                ffi: None,
            },
        );
    }

    /// Give every declared function and method a stable id, in declaration
    /// order: free functions first, then methods class by class.
    fn assign_function_ids(&mut self, program: &TypedProgram) -> CompilerResult<()> {
        for func in &program.functions {
            let key = FuncKey::Free(func.name);
            if self.function_ids.contains_key(&key) {
                return Err(CompilerError::Resolve {
                    message: format!(
                        "duplicate free function `{}`",
                        self.arena.resolve(func.name)
                    ),
                    span: func.span,
                });
            }
            let id = self.fresh_fn();
            self.function_ids.insert(key, id);
        }
        for class in &program.classes {
            for method in &class.methods {
                let key = FuncKey::Method {
                    class: class.id,
                    name: method.name,
                    arity: method.arity(),
                };
                if self.function_ids.contains_key(&key) {
                    return Err(CompilerError::Resolve {
                        message: format!(
                            "ambiguous method `{}` with arity {} in class `{}`",
                            self.arena.resolve(method.name),
                            method.arity(),
                            self.arena.resolve(class.name)
                        ),
                        span: method.span,
                    });
                }
                let id = self.fresh_fn();
                self.function_ids.insert(key, id);
            }
        }
        Ok(())
    }

    /// Build class descriptors in hierarchy order so a parent's tables exist
    /// before any child prefix-shares them.
    fn build_class_descriptors(
        &mut self,
        program: &TypedProgram,
        _builtins: &BuiltinFns,
    ) -> CompilerResult<()> {
        let by_id: HashMap<ClassId, &TypedClass> =
            program.classes.iter().map(|c| (c.id, c)).collect();

        let mut pending: Vec<&TypedClass> = program.classes.iter().collect();
        let mut progressed = true;
        while !pending.is_empty() {
            if !progressed {
                let class = pending[0];
                return Err(CompilerError::Resolve {
                    message: format!(
                        "class `{}` has an unresolved parent",
                        self.arena.resolve(class.name)
                    ),
                    span: class.span,
                });
            }
            progressed = false;
            let mut rest = Vec::new();
            for class in pending {
                let parent_ready = match class.parent {
                    Some(p) => self.classes.contains_key(&p) || !by_id.contains_key(&p),
                    None => true,
                };
                let parent_done = match class.parent {
                    Some(p) => self.classes.contains_key(&p),
                    None => true,
                };
                if parent_ready && parent_done {
                    self.build_descriptor(class)?;
                    progressed = true;
                } else {
                    rest.push(class);
                }
            }
            pending = rest;
        }
        Ok(())
    }

    fn build_descriptor(&mut self, class: &TypedClass) -> CompilerResult<()> {
        let parent_desc = class.parent.and_then(|p| self.classes.get(&p)).cloned();

        // Inherited fields first, then own fields; duplicates are fatal.
        let mut fields: Vec<FieldSlot> = parent_desc
            .as_ref()
            .map(|p| p.fields.clone())
            .unwrap_or_default();
        for field in &class.fields {
            if fields.iter().any(|f| f.name == field.name) {
                return Err(CompilerError::Resolve {
                    message: format!(
                        "duplicate field `{}` in class `{}`",
                        self.arena.resolve(field.name),
                        self.arena.resolve(class.name)
                    ),
                    span: field.span,
                });
            }
            let erased = matches!(self.types.type_of(field.ty), Type::TypeParam(_));
            fields.push(FieldSlot {
                name: field.name,
                ty: field.ty,
                offset: 0,
                json_key: field.json_key,
                declared_in: class.id,
                erased,
            });
        }

        // Classes that declare `dispose` get a per-instance disposed flag so
        // a second call is a no-op.
        let dispose = self.arena.intern("dispose");
        let disposed_flag = self.arena.intern("__disposed");
        let declares_dispose = class
            .methods
            .iter()
            .any(|m| m.name == dispose && m.arity() == 0 && !m.is_static && !m.is_native);
        if declares_dispose && !fields.iter().any(|f| f.name == disposed_flag) {
            let i1 = self.types.primitive(PrimKind::I1);
            fields.push(FieldSlot {
                name: disposed_flag,
                ty: i1,
                offset: 0,
                json_key: None,
                declared_in: class.id,
                erased: false,
            });
        }

        // Byte layout over the flattened slots.
        let flat: Vec<(Symbol, TypeHandle)> = fields.iter().map(|f| (f.name, f.ty)).collect();
        let layout = self.types.compute_layout(class.layout, &flat);
        for (slot, lf) in fields.iter_mut().zip(layout.fields.iter()) {
            slot.offset = lf.offset;
        }
        self.types.set_layout(class.id, layout);

        // Method table and v-table: start from the parent's.
        let mut methods: IndexMap<(Symbol, u8), MethodHandle> = parent_desc
            .as_ref()
            .map(|p| p.methods.clone())
            .unwrap_or_default();
        let mut vtable: Vec<VTableEntry> = parent_desc
            .as_ref()
            .map(|p| p.vtable.clone())
            .unwrap_or_default();

        let initialize = self.arena.intern("initialize");
        for method in &class.methods {
            let arity = method.arity();
            let key = (method.name, arity);
            let fid = self.function_ids[&FuncKey::Method {
                class: class.id,
                name: method.name,
                arity,
            }];
            let dispatch = if method.is_native {
                DispatchMode::Native
            } else if method.is_static || method.name == initialize {
                DispatchMode::Static
            } else if method.is_async {
                DispatchMode::Async
            } else if body_has_yield(method) {
                DispatchMode::Generator
            } else {
                DispatchMode::Virtual
            };

            let param_tys: Vec<TypeHandle> = method.params.iter().map(|p| p.ty).collect();
            let vtable_slot = match dispatch {
                DispatchMode::Virtual | DispatchMode::Generator | DispatchMode::Async => {
                    if let Some(parent_handle) = methods.get(&key) {
                        // Override: signature must stay compatible and the
                        // parent slot is reused.
                        let compatible = parent_handle.params == param_tys
                            && self.types.subtype_of(method.return_type, parent_handle.ret);
                        if !compatible && parent_handle.vtable_slot.is_some() {
                            return Err(CompilerError::Resolve {
                                message: format!(
                                    "incompatible override of `{}` in class `{}`",
                                    self.arena.resolve(method.name),
                                    self.arena.resolve(class.name)
                                ),
                                span: method.span,
                            });
                        }
                        parent_handle.vtable_slot
                    } else {
                        None
                    }
                }
                _ => None,
            };

            let slot = match dispatch {
                DispatchMode::Virtual | DispatchMode::Generator | DispatchMode::Async => {
                    match vtable_slot {
                        Some(slot) => {
                            vtable[slot as usize] = VTableEntry {
                                name: method.name,
                                arity,
                                class: class.id,
                                function: fid,
                            };
                            Some(slot)
                        }
                        None => {
                            let slot = vtable.len() as u16;
                            vtable.push(VTableEntry {
                                name: method.name,
                                arity,
                                class: class.id,
                                function: fid,
                            });
                            Some(slot)
                        }
                    }
                }
                _ => None,
            };

            methods.insert(
                key,
                MethodHandle {
                    owner: class.id,
                    name: method.name,
                    params: param_tys,
                    ret: method.return_type,
                    function: Some(fid),
                    dispatch,
                    throws: method.throws.clone(),
                    vtable_slot: slot,
                },
            );
        }

        // Serializable classes get synthetic to_json/from_json entry points
        // so call sites resolve like any other method; bodies are emitted
        // during lowering.
        if class.serialization == SerializationPolicy::Json {
            let to_json = self.arena.intern("to_json");
            let from_json = self.arena.intern("from_json");
            let string_ty = self.types.string_type();
            let self_ty = self.types.class_type(class.id);

            let to_json_fid = self.fresh_fn();
            let slot = match methods.get(&(to_json, 0)).and_then(|m| m.vtable_slot) {
                Some(slot) => {
                    vtable[slot as usize] = VTableEntry {
                        name: to_json,
                        arity: 0,
                        class: class.id,
                        function: to_json_fid,
                    };
                    slot
                }
                None => {
                    let slot = vtable.len() as u16;
                    vtable.push(VTableEntry {
                        name: to_json,
                        arity: 0,
                        class: class.id,
                        function: to_json_fid,
                    });
                    slot
                }
            };
            methods.insert(
                (to_json, 0),
                MethodHandle {
                    owner: class.id,
                    name: to_json,
                    params: vec![],
                    ret: string_ty,
                    function: Some(to_json_fid),
                    dispatch: DispatchMode::Virtual,
                    throws: vec![],
                    vtable_slot: Some(slot),
                },
            );

            let from_json_fid = self.fresh_fn();
            methods.insert(
                (from_json, 1),
                MethodHandle {
                    owner: class.id,
                    name: from_json,
                    params: vec![string_ty],
                    ret: self_ty,
                    function: Some(from_json_fid),
                    dispatch: DispatchMode::Static,
                    throws: vec![],
                    vtable_slot: None,
                },
            );
        }

        let ffi = class.native_library.as_ref().map(|spec| FfiBinding {
            paths: spec.paths.clone(),
            symbols: class
                .methods
                .iter()
                .filter(|m| m.is_native)
                .map(|m| NativeSymbol {
                    method: m.name,
                    arity: m.arity(),
                    link_name: m.link_name.unwrap_or(m.name),
                })
                .collect(),
        });

        self.classes.insert(
            class.id,
            ClassDescriptor {
                id: class.id,
                name: class.name,
                parent: class.parent,
                fields,
                methods,
                vtable,
                layout_kind: class.layout,
                serialization: class.serialization,
                ffi,
            },
        );
        Ok(())
    }

    /// Local-slot maps, binding types, capture sets.
    fn analyze_functions(&mut self, program: &TypedProgram) -> CompilerResult<()> {
        let free: Vec<(FunctionId, &TypedFunction)> = program
            .functions
            .iter()
            .map(|f| (self.function_ids[&FuncKey::Free(f.name)], f))
            .collect();
        let function_ids = &self.function_ids;
        let methods: Vec<(FunctionId, &TypedFunction)> = program
            .classes
            .iter()
            .flat_map(|c| {
                c.methods.iter().map(move |m| {
                    (
                        function_ids[&FuncKey::Method {
                            class: c.id,
                            name: m.name,
                            arity: m.arity(),
                        }],
                        m,
                    )
                })
            })
            .collect();

        for (fid, func) in free.into_iter().chain(methods) {
            self.analyze_function(fid, func);
        }
        Ok(())
    }

    fn analyze_function(&mut self, fid: FunctionId, func: &TypedFunction) {
        let mut locals = FnLocals::default();
        for param in &func.params {
            self.binding_types.insert(param.binding, param.ty);
            locals.slots.push(LocalDecl {
                binding: param.binding,
                name: param.name,
                ty: param.ty,
            });
        }

        let mut analysis = FnAnalysis {
            resolver: self,
            locals: &mut locals,
            mutated: HashSet::new(),
            blocks: Vec::new(),
            cells: HashSet::new(),
        };
        if let Some(body) = &func.body {
            analysis.collect_decls(body);
            analysis.collect_mutations(body);
            let mut function_scope: HashSet<BindingId> =
                analysis.locals.slots.iter().map(|l| l.binding).collect();
            analysis.walk_body(body, &mut function_scope);
        }

        let FnAnalysis { blocks, cells, .. } = analysis;
        self.locals.insert(fid, locals);
        self.captures.insert(fid, blocks);
        self.cell_bindings.insert(fid, cells);
    }
}

/// Per-function capture/slot analysis.
struct FnAnalysis<'r, 'a> {
    resolver: &'r mut Resolver<'a>,
    locals: &'r mut FnLocals,
    mutated: HashSet<BindingId>,
    blocks: Vec<BlockCaptures>,
    cells: HashSet<BindingId>,
}

impl<'r, 'a> FnAnalysis<'r, 'a> {
    /// Record every binding declared in the function body (not inside block
    /// literals) into the local-slot map, in source order.
    fn collect_decls(&mut self, body: &TypedBody) {
        for stmt in &body.statements {
            self.collect_decls_stmt(&stmt.node);
        }
    }

    fn push_decl(&mut self, binding: BindingId, name: Symbol, ty: TypeHandle) {
        self.resolver.binding_types.insert(binding, ty);
        self.locals.slots.push(LocalDecl { binding, name, ty });
    }

    fn collect_decls_stmt(&mut self, stmt: &TypedStmt) {
        match stmt {
            TypedStmt::Let {
                name,
                binding,
                value,
                ..
            } => {
                self.push_decl(*binding, *name, value.ty);
                self.collect_decls_expr(&value.node);
            }
            TypedStmt::Expr(e) | TypedStmt::Throw(e) | TypedStmt::Yield(e) => {
                self.collect_decls_expr(&e.node)
            }
            TypedStmt::Assign { target, value } => {
                if let AssignTarget::Field { object, .. } = target {
                    self.collect_decls_expr(&object.node);
                }
                if let AssignTarget::Index { object, index } = target {
                    self.collect_decls_expr(&object.node);
                    self.collect_decls_expr(&index.node);
                }
                self.collect_decls_expr(&value.node);
            }
            TypedStmt::Return(v) => {
                if let Some(v) = v {
                    self.collect_decls_expr(&v.node);
                }
            }
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.collect_decls_expr(&cond.node);
                self.collect_decls(then_body);
                if let Some(e) = else_body {
                    self.collect_decls(e);
                }
            }
            TypedStmt::While { cond, body } => {
                self.collect_decls_expr(&cond.node);
                self.collect_decls(body);
            }
            TypedStmt::For {
                name,
                binding,
                elem_ty,
                iterable,
                body,
            } => {
                self.push_decl(*binding, *name, *elem_ty);
                self.collect_decls_expr(&iterable.node);
                self.collect_decls(body);
            }
            TypedStmt::Match {
                scrutinee,
                arms,
                default,
            } => {
                self.collect_decls_expr(&scrutinee.node);
                for arm in arms {
                    match &arm.pattern {
                        TypedPattern::Class {
                            class,
                            binding: Some(b),
                            name,
                        } => {
                            let ty = self.resolver.types.class_type(*class);
                            let name = name.unwrap_or_else(|| self.resolver.arena.intern("_"));
                            self.push_decl(*b, name, ty);
                        }
                        TypedPattern::Wildcard {
                            binding: Some(b),
                            name,
                        } => {
                            let ty = scrutinee.ty;
                            let name = name.unwrap_or_else(|| self.resolver.arena.intern("_"));
                            self.push_decl(*b, name, ty);
                        }
                        _ => {}
                    }
                    if let Some(g) = &arm.guard {
                        self.collect_decls_expr(&g.node);
                    }
                    self.collect_decls(&arm.body);
                }
                if let Some(d) = default {
                    self.collect_decls(d);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                self.collect_decls(body);
                for catch in catches {
                    let ty = self.resolver.types.class_type(catch.class);
                    self.push_decl(catch.binding, catch.name, ty);
                    self.collect_decls(&catch.body);
                }
                if let Some(f) = finally {
                    self.collect_decls(f);
                }
            }
            TypedStmt::Using {
                name,
                binding,
                value,
                body,
            } => {
                self.push_decl(*binding, *name, value.ty);
                self.collect_decls_expr(&value.node);
                self.collect_decls(body);
            }
            TypedStmt::Break | TypedStmt::Continue => {}
        }
    }

    fn collect_decls_expr(&mut self, expr: &TypedExpr) {
        // Block literal bodies get their own scope; their declarations are
        // locals of the synthetic call method, not of this function.
        each_child_expr(expr, &mut |child| self.collect_decls_expr(&child.node));
    }

    fn collect_mutations(&mut self, body: &TypedBody) {
        walk_stmts(body, &mut |stmt| {
            if let TypedStmt::Assign {
                target: AssignTarget::Local { binding, .. },
                ..
            } = stmt
            {
                self.mutated.insert(*binding);
            }
        });
    }

    /// Depth-first walk recording block-literal captures in pre-order. The
    /// traversal follows evaluation order exactly; the lowerer consumes the
    /// list with a cursor and the two must agree.
    fn walk_body(&mut self, body: &TypedBody, scope: &mut HashSet<BindingId>) {
        visit_block_lits(body, &mut |params, block_body| {
            self.record_block(params, block_body, scope);
        });
    }

    fn record_block(
        &mut self,
        params: &[ember_typed_ast::TypedParam],
        body: &TypedBody,
        scope: &HashSet<BindingId>,
    ) {
        let mut declared: HashSet<BindingId> = params.iter().map(|p| p.binding).collect();
        for p in params {
            self.resolver.binding_types.insert(p.binding, p.ty);
        }
        collect_block_decls(body, &mut declared, &mut |b, ty| {
            self.resolver.binding_types.insert(b, ty);
        });

        let mut free: Vec<BindingId> = Vec::new();
        let mut seen = HashSet::new();
        collect_free_uses(body, &declared, &mut |b| {
            if seen.insert(b) {
                free.push(b);
            }
        });

        let index = self.blocks.len();
        self.blocks.push(BlockCaptures::default());

        // A free variable that is not in the host scope belongs to an
        // enclosing block; that block captures it and this one reads it
        // through the chain, so it is recorded here either way.
        let mut captures = Vec::new();
        for binding in free {
            let ty = self
                .resolver
                .binding_types
                .get(&binding)
                .copied()
                .unwrap_or_else(|| self.resolver.types.nil_type());
            let is_primitive = matches!(self.resolver.types.type_of(ty), Type::Primitive(_));
            let mode = if is_primitive && !self.mutated.contains(&binding) {
                CaptureMode::ByCopy
            } else {
                CaptureMode::ByCell
            };
            if mode == CaptureMode::ByCell {
                self.cells.insert(binding);
            }
            let name = self
                .locals
                .slots
                .iter()
                .find(|l| l.binding == binding)
                .map(|l| l.name)
                .unwrap_or_else(|| self.resolver.arena.intern("captured"));
            captures.push(Capture {
                binding,
                name,
                ty,
                mode,
            });
        }
        self.blocks[index].captures = captures;

        // Nested blocks are recorded after their parent: pre-order.
        let mut inner_scope: HashSet<BindingId> = scope.clone();
        inner_scope.extend(declared.iter().copied());
        visit_block_lits(body, &mut |params, block_body| {
            self.record_block(params, block_body, &inner_scope);
        });
    }
}

fn body_has_yield(func: &TypedFunction) -> bool {
    let mut found = false;
    if let Some(body) = &func.body {
        walk_stmts(body, &mut |stmt| {
            if matches!(stmt, TypedStmt::Yield(_)) {
                found = true;
            }
        });
    }
    found
}

// ----------------------------------------------------------------------
// AST walkers. Block-literal bodies are *not* entered by `walk_stmts` /
// `walk_exprs`; callers recurse explicitly where they need to.
// ----------------------------------------------------------------------

fn walk_stmts(body: &TypedBody, f: &mut impl FnMut(&TypedStmt)) {
    for stmt in &body.statements {
        f(&stmt.node);
        match &stmt.node {
            TypedStmt::If {
                then_body,
                else_body,
                ..
            } => {
                walk_stmts(then_body, f);
                if let Some(e) = else_body {
                    walk_stmts(e, f);
                }
            }
            TypedStmt::While { body, .. } | TypedStmt::For { body, .. } => walk_stmts(body, f),
            TypedStmt::Match { arms, default, .. } => {
                for arm in arms {
                    walk_stmts(&arm.body, f);
                }
                if let Some(d) = default {
                    walk_stmts(d, f);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                walk_stmts(body, f);
                for c in catches {
                    walk_stmts(&c.body, f);
                }
                if let Some(fin) = finally {
                    walk_stmts(fin, f);
                }
            }
            TypedStmt::Using { body, .. } => walk_stmts(body, f),
            _ => {}
        }
    }
}

/// Visit every block literal of a body in evaluation order, without
/// descending into the literals themselves (the caller recurses).
fn visit_block_lits<'p>(
    body: &'p TypedBody,
    f: &mut impl FnMut(&'p [ember_typed_ast::TypedParam], &'p TypedBody),
) {
    for stmt in &body.statements {
        match &stmt.node {
            TypedStmt::Expr(e) | TypedStmt::Throw(e) | TypedStmt::Yield(e) => {
                visit_expr_blocks(e, f)
            }
            TypedStmt::Let { value, .. } => visit_expr_blocks(value, f),
            TypedStmt::Using { value, body, .. } => {
                visit_expr_blocks(value, f);
                visit_block_lits(body, f);
            }
            TypedStmt::Assign { target, value } => {
                match target {
                    AssignTarget::Field { object, .. } => visit_expr_blocks(object, f),
                    AssignTarget::Index { object, index } => {
                        visit_expr_blocks(object, f);
                        visit_expr_blocks(index, f);
                    }
                    AssignTarget::Local { .. } => {}
                }
                visit_expr_blocks(value, f);
            }
            TypedStmt::Return(v) => {
                if let Some(v) = v {
                    visit_expr_blocks(v, f);
                }
            }
            TypedStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                visit_expr_blocks(cond, f);
                visit_block_lits(then_body, f);
                if let Some(e) = else_body {
                    visit_block_lits(e, f);
                }
            }
            TypedStmt::While { cond, body } => {
                visit_expr_blocks(cond, f);
                visit_block_lits(body, f);
            }
            TypedStmt::For { iterable, body, .. } => {
                visit_expr_blocks(iterable, f);
                visit_block_lits(body, f);
            }
            TypedStmt::Match {
                scrutinee,
                arms,
                default,
            } => {
                visit_expr_blocks(scrutinee, f);
                for arm in arms {
                    if let Some(g) = &arm.guard {
                        visit_expr_blocks(g, f);
                    }
                    visit_block_lits(&arm.body, f);
                }
                if let Some(d) = default {
                    visit_block_lits(d, f);
                }
            }
            TypedStmt::Try {
                body,
                catches,
                finally,
            } => {
                visit_block_lits(body, f);
                for c in catches {
                    visit_block_lits(&c.body, f);
                }
                if let Some(fin) = finally {
                    visit_block_lits(fin, f);
                }
            }
            TypedStmt::Break | TypedStmt::Continue => {}
        }
    }
}

fn visit_expr_blocks<'p>(
    expr: &'p Expr,
    f: &mut impl FnMut(&'p [ember_typed_ast::TypedParam], &'p TypedBody),
) {
    if let TypedExpr::BlockLit { params, body } = &expr.node {
        f(params, body);
        return;
    }
    each_child_expr(&expr.node, &mut |child| visit_expr_blocks(child, f));
}

/// Visit the direct child expressions of a node. Does not descend into
/// block-literal bodies.
pub(crate) fn each_child_expr<'e>(expr: &'e TypedExpr, f: &mut impl FnMut(&'e Expr)) {
    match expr {
        TypedExpr::LitInt(_)
        | TypedExpr::LitFloat(_)
        | TypedExpr::LitBool(_)
        | TypedExpr::LitString(_)
        | TypedExpr::LitNil
        | TypedExpr::Local { .. }
        | TypedExpr::SelfRef => {}
        TypedExpr::FieldGet { object, .. } => f(object),
        TypedExpr::StaticCall { args, .. } | TypedExpr::FreeCall { args, .. } => {
            args.iter().for_each(f)
        }
        TypedExpr::MethodCall { receiver, args, .. } => {
            f(receiver);
            args.iter().for_each(f);
        }
        TypedExpr::New { args, .. } => args.iter().for_each(f),
        TypedExpr::Binary { lhs, rhs, .. } | TypedExpr::Logical { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        TypedExpr::Unary { operand, .. } => f(operand),
        TypedExpr::Convert { value, .. } => f(value),
        TypedExpr::Index { object, index } => {
            f(object);
            f(index);
        }
        TypedExpr::ArrayLit(elems) | TypedExpr::TupleLit(elems) => elems.iter().for_each(f),
        TypedExpr::HashLit(pairs) => {
            for (k, v) in pairs {
                f(k);
                f(v);
            }
        }
        TypedExpr::Range { lo, hi } => {
            f(lo);
            f(hi);
        }
        TypedExpr::BlockLit { .. } => {}
        TypedExpr::BlockCall { callee, args } => {
            f(callee);
            args.iter().for_each(f);
        }
        TypedExpr::Await(inner) => f(inner),
        TypedExpr::StringInterp { parts } => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    f(e);
                }
            }
        }
    }
}

/// Bindings declared inside a block literal's own body.
fn collect_block_decls(
    body: &TypedBody,
    declared: &mut HashSet<BindingId>,
    record: &mut impl FnMut(BindingId, TypeHandle),
) {
    walk_stmts(body, &mut |stmt| match stmt {
        TypedStmt::Let { binding, value, .. } => {
            declared.insert(*binding);
            record(*binding, value.ty);
        }
        TypedStmt::For {
            binding, elem_ty, ..
        } => {
            declared.insert(*binding);
            record(*binding, *elem_ty);
        }
        TypedStmt::Using { binding, value, .. } => {
            declared.insert(*binding);
            record(*binding, value.ty);
        }
        TypedStmt::Try { catches, .. } => {
            for c in catches {
                declared.insert(c.binding);
            }
        }
        TypedStmt::Match { arms, .. } => {
            for arm in arms {
                match &arm.pattern {
                    TypedPattern::Class {
                        binding: Some(b), ..
                    }
                    | TypedPattern::Wildcard {
                        binding: Some(b), ..
                    } => {
                        declared.insert(*b);
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    });
}

/// References to bindings not declared inside the block: the free set.
/// Nested block literals contribute their own free variables.
fn collect_free_uses(
    body: &TypedBody,
    declared: &HashSet<BindingId>,
    f: &mut impl FnMut(BindingId),
) {
    walk_stmts(body, &mut |stmt| {
        match stmt {
            TypedStmt::Expr(e) | TypedStmt::Throw(e) | TypedStmt::Yield(e) => {
                free_uses_expr(e, declared, f)
            }
            TypedStmt::Let { value, .. } | TypedStmt::Using { value, .. } => {
                free_uses_expr(value, declared, f)
            }
            TypedStmt::Assign { target, value } => {
                match target {
                    AssignTarget::Local { binding, .. } => {
                        if !declared.contains(binding) {
                            f(*binding);
                        }
                    }
                    AssignTarget::Field { object, .. } => free_uses_expr(object, declared, f),
                    AssignTarget::Index { object, index } => {
                        free_uses_expr(object, declared, f);
                        free_uses_expr(index, declared, f);
                    }
                }
                free_uses_expr(value, declared, f);
            }
            TypedStmt::Return(Some(v)) => free_uses_expr(v, declared, f),
            TypedStmt::If { cond, .. } | TypedStmt::While { cond, .. } => {
                free_uses_expr(cond, declared, f)
            }
            TypedStmt::For { iterable, .. } => free_uses_expr(iterable, declared, f),
            TypedStmt::Match {
                scrutinee, arms, ..
            } => {
                free_uses_expr(scrutinee, declared, f);
                for arm in arms {
                    if let Some(g) = &arm.guard {
                        free_uses_expr(g, declared, f);
                    }
                }
            }
            _ => {}
        }
    });
}

fn free_uses_expr(expr: &Expr, declared: &HashSet<BindingId>, f: &mut impl FnMut(BindingId)) {
    match &expr.node {
        TypedExpr::Local { binding, .. } => {
            if !declared.contains(binding) {
                f(*binding);
            }
        }
        TypedExpr::BlockLit { params, body } => {
            let mut inner: HashSet<BindingId> = declared.clone();
            inner.extend(params.iter().map(|p| p.binding));
            collect_block_decls(body, &mut inner, &mut |_, _| {});
            collect_free_uses(body, &inner, f);
        }
        node => each_child_expr(node, &mut |child| free_uses_expr(child, declared, f)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_typed_ast::AstBuilder;

    #[test]
    fn test_vtable_slot_stability_across_subclassing() {
        let mut b = AstBuilder::new();
        let animal = b.declare_class("Animal", None);
        let dog = b.declare_class("Dog", Some(animal));

        let string_ty = b.t_string();
        let animal_speak = b.function("speak", vec![], string_ty, vec![]);
        let dog_speak = b.function("speak", vec![], string_ty, vec![]);
        let fetch = b.function("fetch", vec![], string_ty, vec![]);

        let animal_decl = b.class_decl(animal, vec![], vec![animal_speak]);
        let dog_decl = b.class_decl(dog, vec![], vec![dog_speak, fetch]);
        let program = b.program(vec![animal_decl, dog_decl], vec![]);

        let AstBuilder {
            mut arena,
            mut types,
            ..
        } = b;
        let resolution = resolve(&program, &mut types, &mut arena).unwrap();

        let speak = arena.get("speak").unwrap();
        let fetch_sym = arena.get("fetch").unwrap();
        let animal_desc = resolution.class(animal).unwrap();
        let dog_desc = resolution.class(dog).unwrap();

        let animal_slot = animal_desc.methods[&(speak, 0)].vtable_slot.unwrap();
        let dog_slot = dog_desc.methods[&(speak, 0)].vtable_slot.unwrap();
        assert_eq!(animal_slot, dog_slot, "override must reuse the parent slot");

        let fetch_slot = dog_desc.methods[&(fetch_sym, 0)].vtable_slot.unwrap();
        assert!(fetch_slot > dog_slot, "new virtual methods append");
        assert_eq!(dog_desc.vtable[dog_slot as usize].class, dog);
        assert_eq!(animal_desc.vtable.len() + 1, dog_desc.vtable.len());
    }

    #[test]
    fn test_duplicate_field_is_fatal() {
        let mut b = AstBuilder::new();
        let c = b.declare_class("Pt", None);
        let f64_ty = b.t_f64();
        let f1 = b.field("x", f64_ty);
        let f2 = b.field("x", f64_ty);
        let decl = b.class_decl(c, vec![f1, f2], vec![]);
        let program = b.program(vec![decl], vec![]);

        let AstBuilder {
            mut arena,
            mut types,
            ..
        } = b;
        let err = resolve(&program, &mut types, &mut arena);
        assert!(matches!(err, Err(CompilerError::Resolve { .. })));
    }

    #[test]
    fn test_incompatible_override_is_fatal() {
        let mut b = AstBuilder::new();
        let base = b.declare_class("Base", None);
        let derived = b.declare_class("Derived", Some(base));

        let string_ty = b.t_string();
        let i64_ty = b.t_i64();
        let base_m = b.function("describe", vec![], string_ty, vec![]);
        let derived_m = b.function("describe", vec![], i64_ty, vec![]);

        let base_decl = b.class_decl(base, vec![], vec![base_m]);
        let derived_decl = b.class_decl(derived, vec![], vec![derived_m]);
        let program = b.program(vec![base_decl, derived_decl], vec![]);

        let AstBuilder {
            mut arena,
            mut types,
            ..
        } = b;
        let err = resolve(&program, &mut types, &mut arena);
        assert!(matches!(err, Err(CompilerError::Resolve { .. })));
    }

    #[test]
    fn test_inherited_fields_precede_own_fields() {
        let mut b = AstBuilder::new();
        let base = b.declare_class("Base", None);
        let derived = b.declare_class("Derived", Some(base));
        let i64_ty = b.t_i64();
        let fa = b.field("a", i64_ty);
        let fb = b.field("b", i64_ty);
        let base_decl = b.class_decl(base, vec![fa], vec![]);
        let derived_decl = b.class_decl(derived, vec![fb], vec![]);
        let program = b.program(vec![base_decl, derived_decl], vec![]);

        let AstBuilder {
            mut arena,
            mut types,
            ..
        } = b;
        let resolution = resolve(&program, &mut types, &mut arena).unwrap();
        let desc = resolution.class(derived).unwrap();
        assert_eq!(arena.resolve(desc.fields[0].name), "a");
        assert_eq!(arena.resolve(desc.fields[1].name), "b");
        assert!(desc.fields[1].offset > desc.fields[0].offset);
    }

    #[test]
    fn test_capture_classification() {
        let mut b = AstBuilder::new();
        let i64_ty = b.t_i64();
        let string_ty = b.t_string();
        let nil_ty = b.t_nil();

        // let n = 1          (immutable primitive -> by copy)
        // let s = "x"        (reference -> by cell)
        // let m = 2; m = 3   (mutated primitive -> by cell)
        let one = b.int(1);
        let (let_n, n) = b.let_stmt("n", false, one);
        let x = b.string("x");
        let (let_s, s) = b.let_stmt("s", false, x);
        let two = b.int(2);
        let (let_m, m) = b.let_stmt("m", true, two);
        let three = b.int(3);
        let m_sym = b.arena.get("m").unwrap();
        let assign_m = b.assign_local(m_sym, m, three);

        let n_sym = b.arena.get("n").unwrap();
        let s_sym = b.arena.get("s").unwrap();
        let use_n = b.local(n_sym, n, i64_ty);
        let use_s = b.local(s_sym, s, string_ty);
        let use_m = b.local(m_sym, m, i64_ty);
        let st1 = b.expr_stmt(use_n);
        let st2 = b.expr_stmt(use_s);
        let st3 = b.expr_stmt(use_m);
        let block_body = b.body(vec![st1, st2, st3]);
        let block_ty = b.t_block(vec![], nil_ty);
        let blk = b.block_lit(vec![], block_body, block_ty);
        let use_blk = b.expr_stmt(blk);

        let f = b.function("host", vec![], nil_ty, vec![let_n, let_s, let_m, assign_m, use_blk]);
        let program = b.program(vec![], vec![f]);

        let AstBuilder {
            mut arena,
            mut types,
            ..
        } = b;
        let resolution = resolve(&program, &mut types, &mut arena).unwrap();
        let host = arena.get("host").unwrap();
        let fid = resolution.function_id(FuncKey::Free(host)).unwrap();
        let blocks = &resolution.captures[&fid];
        assert_eq!(blocks.len(), 1);
        let caps = &blocks[0].captures;
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[0].mode, CaptureMode::ByCopy);
        assert_eq!(caps[1].mode, CaptureMode::ByCell);
        assert_eq!(caps[2].mode, CaptureMode::ByCell);

        let cells = &resolution.cell_bindings[&fid];
        assert!(cells.contains(&s));
        assert!(cells.contains(&m));
        assert!(!cells.contains(&n));
    }
}
