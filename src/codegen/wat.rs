use std::{collections::HashMap, fmt::Write, format_args as f, mem, slice};

use crate::{
    ast::*,
    codegen::{runtime, Error, ValType},
    token::{Positioned, Primitive},
};

type Result<T, E = Positioned<Error>> = std::result::Result<T, E>;

const INDENT: &str = "  ";

pub struct Generator<'p> {
    code: String,
    indent: usize,
    with_memory_management: bool,
    /// Set when an allocation falls back to growing the memory.
    uses_memory: bool,
    functions: HashMap<&'p str, &'p Function>,
    structs: HashMap<&'p str, StructLayout<'p>>,
    next_for_id: u32,
}

impl<'p> Generator<'p> {
    pub fn new(with_memory_management: bool) -> Generator<'p> {
        Generator {
            code: String::with_capacity(4096),
            indent: 0,
            with_memory_management,
            uses_memory: false,
            functions: HashMap::new(),
            structs: HashMap::new(),
            next_for_id: 0,
        }
    }

    pub fn generate(mut self, program: &'p Program) -> Result<String> {
        self.collect_declarations(program)?;

        // Functions are generated first since the module prelude depends on
        // whether any of them touches memory.
        self.indent = 1;
        for file in &program.files {
            for stmt in &file.statements {
                self.g_top_level(stmt)?;
            }
        }
        let functions = mem::take(&mut self.code);

        self.indent = 0;
        self.out("(module");
        self.indented(|this| {
            this.out_all(runtime::IMPORTS);
            if this.with_memory_management {
                this.out_all(runtime::MEMORY_MANAGEMENT);
            } else if this.uses_memory {
                this.out_all(runtime::BARE_MEMORY);
            }
        });
        self.code.push_str(&functions);
        self.out(")");
        Ok(self.code)
    }
}

/// Declarations, resolved before any code is emitted.
impl<'p> Generator<'p> {
    fn collect_declarations(&mut self, program: &'p Program) -> Result<()> {
        let statements = || program.files.iter().flat_map(|file| &file.statements);
        for stmt in statements() {
            match &stmt.kind {
                StmtKind::Function(function) => {
                    self.functions.insert(&*function.name.name, function);
                }
                StmtKind::Struct(def) => {
                    self.structs.insert(&*def.name.name, StructLayout::default());
                }
                _ => (),
            }
        }
        // Fields may name other structs, so layouts wait until all names are known.
        for stmt in statements() {
            if let StmtKind::Struct(def) = &stmt.kind {
                let layout = self.layout(def)?;
                self.structs.insert(&*def.name.name, layout);
            }
        }
        Ok(())
    }

    fn layout(&self, def: &'p StructDef) -> Result<StructLayout<'p>> {
        let mut layout = StructLayout::default();
        for field in &def.fields {
            let (ty, shape) = self.resolve(&field.ty)?;
            layout.fields.push(Field {
                name: &field.name.name,
                ty,
                shape,
                offset: layout.size,
            });
            layout.size += ty.size();
        }
        Ok(layout)
    }

    fn resolve(&self, ty: &'p TypeName) -> Result<(ValType, Shape<'p>)> {
        let name = ty.name();
        match ty.primitive() {
            Some(Primitive::Str) => Ok((ValType::I32, Shape::Str)),
            Some(primitive) => Ok((ValType::of(primitive), Shape::Scalar)),
            None if name == "string" => Ok((ValType::I32, Shape::Str)),
            None if self.structs.contains_key(name) => Ok((ValType::I32, Shape::Struct(name))),
            None => Err(ty.pos().wrap(Error::UnknownType { name: name.into() })),
        }
    }

    fn param_types(&self, callee: &str) -> Result<Vec<ValType>> {
        let Some(function) = self.functions.get(callee).copied() else {
            return Ok(Vec::new());
        };
        function
            .params
            .iter()
            .map(|param| self.resolve(&param.ty).map(|(ty, _)| ty))
            .collect()
    }

    /// Calls to functions that are not declared in the program (such as the
    /// imported `println`) produce no values.
    fn result_types(&self, callee: &str) -> Result<Vec<(ValType, Shape<'p>)>> {
        let Some(function) = self.functions.get(callee).copied() else {
            return Ok(Vec::new());
        };
        function.return_types.iter().map(|ty| self.resolve(ty)).collect()
    }

    /// Walks a body declaring every local it introduces, nested blocks
    /// included. The first declaration of a name wins.
    fn collect_locals(&self, cx: &mut FunctionContext<'p>, stmts: &'p [Stmt]) -> Result<()> {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::VarDecl(decl) => {
                    let (ty, shape) = self.resolve(&decl.ty)?;
                    cx.declare(&decl.name.name, Local { ty, shape });
                }
                StmtKind::List(decl) => {
                    let (elem, _) = self.resolve(&decl.elem_ty)?;
                    let local = Local {
                        ty: ValType::I32,
                        shape: Shape::List(elem),
                    };
                    cx.declare(&decl.name.name, local);
                }
                StmtKind::Let { name, value, .. } => {
                    let local = Local {
                        ty: self.value_type(cx, value),
                        shape: self.shape_of(cx, value),
                    };
                    cx.declare(&name.name, local);
                }
                StmtKind::If(if_stmt) => self.collect_if_locals(cx, if_stmt)?,
                StmtKind::For(for_stmt) => {
                    self.collect_locals(cx, slice::from_ref(&*for_stmt.init))?;
                    if let Some(post) = &for_stmt.post {
                        self.collect_locals(cx, slice::from_ref(&**post))?;
                    }
                    self.collect_locals(cx, &for_stmt.body.statements)?;
                }
                StmtKind::Block(block) => self.collect_locals(cx, &block.statements)?,
                StmtKind::Defer(deferred) => self.collect_locals(cx, slice::from_ref(&**deferred))?,
                StmtKind::Expr(Expr {
                    kind: ExprKind::While(while_expr),
                    ..
                }) => self.collect_locals(cx, &while_expr.body.statements)?,
                StmtKind::Expr(_)
                | StmtKind::Return(_)
                | StmtKind::Function(_)
                | StmtKind::Struct(_) => (),
            }
        }
        Ok(())
    }

    fn collect_if_locals(&self, cx: &mut FunctionContext<'p>, if_stmt: &'p If) -> Result<()> {
        self.collect_locals(cx, &if_stmt.consequence.statements)?;
        match if_stmt.alternative.as_deref() {
            Some(Alternative::Else(block)) => self.collect_locals(cx, &block.statements),
            Some(Alternative::ElseIf(nested)) => self.collect_if_locals(cx, nested),
            None => Ok(()),
        }
    }
}

/// Statements.
impl<'p> Generator<'p> {
    fn g_top_level(&mut self, stmt: &'p Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Function(function) => self.g_function(function),
            StmtKind::Struct(_) => Ok(()),
            _ => {
                self.unsupported_stmt("top-level statement");
                Ok(())
            }
        }
    }

    fn g_function(&mut self, function: &'p Function) -> Result<()> {
        let mut cx = FunctionContext::default();
        let mut params = Vec::with_capacity(function.params.len());
        for param in &function.params {
            let (ty, shape) = self.resolve(&param.ty)?;
            cx.locals.insert(&*param.name.name, Local { ty, shape });
            params.push((&*param.name.name, ty));
        }
        for ty in &function.return_types {
            let (ty, _) = self.resolve(ty)?;
            cx.results.push(ty);
        }
        self.collect_locals(&mut cx, &function.body.statements)?;

        // The body goes first into a buffer of its own, since it decides which
        // string and scratch locals the header must declare.
        let outer = mem::take(&mut self.code);
        self.indented(|this| -> Result<()> {
            let statements = &function.body.statements;
            this.g_stmts(&mut cx, statements)?;
            if !matches!(statements.last(), Some(Stmt { kind: StmtKind::Return(_), .. })) {
                this.g_deferred(&mut cx)?;
                if !cx.results.is_empty() {
                    this.out("(unreachable)");
                }
            }
            Ok(())
        })?;
        let body = mem::replace(&mut self.code, outer);

        self.g_function_header(function, &params, &cx.results);
        self.indented(|this| {
            for (name, ty) in &cx.declared {
                this.out(f!("(local ${name} {ty})"));
            }
            for slot in 0..cx.strings.len() {
                this.out(f!("(local $.str_ptr_{slot} i32)"));
            }
            for tmp in 0..cx.max_temps {
                this.out(f!("(local $.tmp_{tmp} i32)"));
            }
            for flag in 0..cx.defer_flags {
                this.out(f!("(local $.defer_{flag} i32)"));
            }
            for (slot, ty) in cx.return_slots.iter().enumerate() {
                this.out(f!("(local $.ret_{slot} {ty})"));
            }
            for (slot, text) in cx.strings.iter().enumerate() {
                this.g_string_init(slot, text);
            }
            this.code.push_str(&body);
        });
        self.out(")");
        Ok(())
    }

    fn g_function_header(
        &mut self,
        function: &Function,
        params: &[(&str, ValType)],
        results: &[ValType],
    ) {
        let name = &function.name.name;
        self.start();
        self.emit(f!("(func ${name}"));
        if function.exported {
            self.emit(f!(" (export \"{name}\")"));
        }
        for (param, ty) in params {
            self.emit(f!(" (param ${param} {ty})"));
        }
        if !results.is_empty() {
            self.emit(" (result");
            for ty in results {
                self.emit(f!(" {ty}"));
            }
            self.emit(")");
        }
        self.end();
    }

    /// Copies a literal into freshly allocated memory, one byte at a time,
    /// followed by a null terminator.
    fn g_string_init(&mut self, slot: usize, text: &str) {
        self.start();
        self.emit(f!("(local.set $.str_ptr_{slot} "));
        self.g_alloc(text.len() + 1);
        self.emit(")");
        self.end();
        for (offset, byte) in text.bytes().enumerate() {
            self.out(f!(
                "(i32.store8 offset={offset} (local.get $.str_ptr_{slot}) (i32.const {byte})) ;; {}",
                char_comment(byte),
            ));
        }
        self.out(f!(
            "(i32.store8 offset={} (local.get $.str_ptr_{slot}) (i32.const 0))",
            text.len(),
        ));
    }

    fn g_stmts(&mut self, cx: &mut FunctionContext<'p>, stmts: &'p [Stmt]) -> Result<()> {
        for stmt in stmts {
            self.g_stmt(cx, stmt)?;
        }
        Ok(())
    }

    fn g_stmt(&mut self, cx: &mut FunctionContext<'p>, stmt: &'p Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.g_expr_stmt(cx, expr),
            StmtKind::Let { name, value, .. } => self.g_set(cx, &name.name, value),
            StmtKind::VarDecl(decl) => self.g_set(cx, &decl.name.name, &decl.value),
            StmtKind::List(decl) => self.g_set(cx, &decl.name.name, &decl.value),
            StmtKind::Return(values) => self.g_return(cx, values),
            StmtKind::If(if_stmt) => self.g_if(cx, if_stmt),
            StmtKind::For(for_stmt) => self.g_for(cx, for_stmt),
            StmtKind::Block(block) => self.g_scope(cx, &block.statements),
            StmtKind::Defer(deferred) => {
                self.g_defer(cx, deferred);
                Ok(())
            }
            StmtKind::Struct(_) => Ok(()),
            StmtKind::Function(_) => {
                self.unsupported_stmt("nested function");
                Ok(())
            }
        }
    }

    fn g_set(&mut self, cx: &mut FunctionContext<'p>, name: &str, value: &'p Expr) -> Result<()> {
        let local = cx.locals.get(name).copied();
        let ty = local.map_or_else(|| self.value_type(cx, value), |local| local.ty);
        self.start();
        self.emit(f!("(local.set ${name} "));
        match (&value.kind, local) {
            (
                ExprKind::List(elements),
                Some(Local {
                    shape: Shape::List(elem),
                    ..
                }),
            ) => self.g_list(cx, elements, elem)?,
            _ => self.g_expr(cx, value, ty)?,
        }
        self.emit(")");
        self.end();
        Ok(())
    }

    fn g_return(&mut self, cx: &mut FunctionContext<'p>, values: &'p [Expr]) -> Result<()> {
        if cx.defers.is_empty() {
            self.start();
            self.emit("(return");
            for (i, value) in values.iter().enumerate() {
                let ty = self.return_type(cx, i, value);
                self.emit(" ");
                self.g_expr(cx, value, ty)?;
            }
            self.emit(")");
            self.end();
            return Ok(());
        }

        // The values are computed before deferred statements get to change
        // what they read.
        for (i, value) in values.iter().enumerate() {
            let ty = self.return_type(cx, i, value);
            cx.reserve_return_slot(i, ty);
            self.start();
            self.emit(f!("(local.set $.ret_{i} "));
            self.g_expr(cx, value, ty)?;
            self.emit(")");
            self.end();
        }
        self.g_deferred(cx)?;
        self.start();
        self.emit("(return");
        for i in 0..values.len() {
            self.emit(f!(" (local.get $.ret_{i})"));
        }
        self.emit(")");
        self.end();
        Ok(())
    }

    fn return_type(&self, cx: &FunctionContext<'p>, i: usize, value: &'p Expr) -> ValType {
        match cx.results.get(i) {
            Some(ty) => *ty,
            None => self.value_type(cx, value),
        }
    }

    /// Registers a deferred statement. Outside the function's top level it
    /// may never be reached, so a flag records whether it was.
    fn g_defer(&mut self, cx: &mut FunctionContext<'p>, stmt: &'p Stmt) {
        let flag = (cx.depth > 0).then(|| {
            let flag = cx.defer_flags;
            cx.defer_flags += 1;
            self.out(f!("(local.set $.defer_{flag} (i32.const 1))"));
            flag
        });
        cx.defers.push(Deferred {
            stmt,
            depth: cx.depth,
            flag,
            in_scope: true,
        });
    }

    /// Emits the registered deferred statements, most recent first. Those
    /// whose block has already closed only run if their flag is set. A
    /// deferred `return` does not run the deferred statements again.
    fn g_deferred(&mut self, cx: &mut FunctionContext<'p>) -> Result<()> {
        let defers = mem::take(&mut cx.defers);
        let res = defers.iter().rev().try_for_each(|deferred| match deferred.flag {
            Some(flag) if !deferred.in_scope => {
                self.out(f!("(if (local.get $.defer_{flag})"));
                self.indented(|this| -> Result<()> {
                    this.out("(then");
                    this.indented(|this| this.g_stmt(cx, deferred.stmt))?;
                    this.out(")");
                    Ok(())
                })?;
                self.out(")");
                Ok(())
            }
            _ => self.g_stmt(cx, deferred.stmt),
        });
        cx.defers = defers;
        res
    }

    /// Emits a nested block. Deferred statements registered inside it go out
    /// of scope when it closes.
    fn g_scope(&mut self, cx: &mut FunctionContext<'p>, stmts: &'p [Stmt]) -> Result<()> {
        cx.depth += 1;
        let res = self.g_stmts(cx, stmts);
        for deferred in &mut cx.defers {
            if deferred.depth >= cx.depth {
                deferred.in_scope = false;
            }
        }
        cx.depth -= 1;
        res
    }

    fn g_if(&mut self, cx: &mut FunctionContext<'p>, if_stmt: &'p If) -> Result<()> {
        self.start();
        self.emit("(if ");
        self.g_expr(cx, &if_stmt.condition, ValType::I32)?;
        self.end();
        self.indented(|this| -> Result<()> {
            this.out("(then");
            this.indented(|this| this.g_scope(cx, &if_stmt.consequence.statements))?;
            this.out(")");
            match if_stmt.alternative.as_deref() {
                Some(Alternative::Else(block)) => {
                    this.out("(else");
                    this.indented(|this| this.g_scope(cx, &block.statements))?;
                    this.out(")");
                }
                Some(Alternative::ElseIf(nested)) => {
                    this.out("(else");
                    this.indented(|this| this.g_if(cx, nested))?;
                    this.out(")");
                }
                None => (),
            }
            Ok(())
        })?;
        self.out(")");
        Ok(())
    }

    fn g_for(&mut self, cx: &mut FunctionContext<'p>, for_stmt: &'p For) -> Result<()> {
        let label = format!("for_{}", self.next_for_id);
        self.next_for_id += 1;
        self.g_stmt(cx, &for_stmt.init)?;
        let body = &for_stmt.body.statements;
        self.g_loop(cx, &label, &for_stmt.condition, body, for_stmt.post.as_deref())
    }

    fn g_while(&mut self, cx: &mut FunctionContext<'p>, while_expr: &'p While) -> Result<()> {
        let label = format!("while_{}", while_expr.id);
        let body = &while_expr.body.statements;
        self.g_loop(cx, &label, &while_expr.condition, body, None)
    }

    /// ```text
    /// (block $label_end
    ///   (loop $label
    ///     (br_if $label_end (i32.eqz condition))
    ///     body post
    ///     (br $label)))
    /// ```
    fn g_loop(
        &mut self,
        cx: &mut FunctionContext<'p>,
        label: &str,
        condition: &'p Expr,
        body: &'p [Stmt],
        post: Option<&'p Stmt>,
    ) -> Result<()> {
        self.out(f!("(block ${label}_end"));
        self.indented(|this| -> Result<()> {
            this.out(f!("(loop ${label}"));
            this.indented(|this| -> Result<()> {
                this.start();
                this.emit(f!("(br_if ${label}_end (i32.eqz "));
                this.g_expr(cx, condition, ValType::I32)?;
                this.emit("))");
                this.end();
                this.g_scope(cx, body)?;
                if let Some(post) = post {
                    this.g_stmt(cx, post)?;
                }
                this.out(f!("(br ${label})"));
                Ok(())
            })?;
            this.out(")");
            Ok(())
        })?;
        self.out(")");
        Ok(())
    }

    fn g_expr_stmt(&mut self, cx: &mut FunctionContext<'p>, expr: &'p Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Assign { target, op, value } => {
                self.start();
                self.emit(f!("(local.set ${} ", target.name));
                self.g_assigned_value(cx, target, *op, value)?;
                self.emit(")");
                self.end();
            }
            ExprKind::Postfix { op, expr: operand } => match &operand.kind {
                ExprKind::Id(ident) => {
                    let ty = self.value_type(cx, operand);
                    self.start();
                    self.g_step(ident, *op, ty);
                    self.end();
                }
                _ => self.unsupported_stmt("postfix operator on a non-variable"),
            },
            ExprKind::FieldAssign {
                receiver,
                field,
                value,
            } => {
                let Some(slot) = self.field(cx, receiver, field) else {
                    self.unsupported_stmt("assignment to an unknown field");
                    return Ok(());
                };
                self.start();
                self.emit(f!("({}.store offset={} ", slot.ty, slot.offset));
                self.g_expr(cx, receiver, ValType::I32)?;
                self.emit(" ");
                self.g_expr(cx, value, slot.ty)?;
                self.emit(")");
                self.end();
            }
            ExprKind::While(while_expr) => self.g_while(cx, while_expr)?,
            ExprKind::Call { callee, args } => {
                let results = self.result_types(&callee.name)?;
                self.start();
                // An unused string result is released right away.
                if self.with_memory_management && matches!(results.as_slice(), [(_, Shape::Str)]) {
                    self.emit(f!("(call {} ", runtime::DEALLOCATE));
                    self.g_call(cx, callee, args)?;
                    self.emit(")");
                    self.end();
                } else {
                    self.g_call(cx, callee, args)?;
                    self.end();
                    for _ in &results {
                        self.out("(drop)");
                    }
                }
            }
            _ => {
                let ty = self.value_type(cx, expr);
                self.start();
                self.emit("(drop ");
                self.g_expr(cx, expr, ty)?;
                self.emit(")");
                self.end();
            }
        }
        Ok(())
    }
}

/// Expressions. Each one is emitted inline, as a folded instruction.
impl<'p> Generator<'p> {
    fn g_expr(&mut self, cx: &mut FunctionContext<'p>, expr: &'p Expr, hint: ValType) -> Result<()> {
        match &expr.kind {
            ExprKind::Id(ident) => self.emit(f!("(local.get ${})", ident.name)),
            ExprKind::Int(int) => self.emit(f!("({hint}.const {int})")),
            ExprKind::Float(float) => {
                let ty = if hint.is_float() { hint } else { ValType::F32 };
                self.emit(f!("({ty}.const {float:?})"));
            }
            ExprKind::Bool(value) => self.emit(f!("(i32.const {})", i32::from(*value))),
            ExprKind::String(text) => {
                let slot = cx.intern(text);
                self.emit(f!("(local.get $.str_ptr_{slot})"));
            }
            ExprKind::Binary { op, lhs, rhs } => self.g_binary(cx, *op, lhs, rhs, hint)?,
            ExprKind::Unary { op, expr: operand } => self.g_unary(cx, *op, operand, hint)?,
            ExprKind::Postfix { op, expr: operand } => match &operand.kind {
                ExprKind::Id(ident) => {
                    let ty = self.type_or(cx, operand, hint);
                    // Evaluates to the value before the step.
                    self.emit(f!("(block (result {ty}) (local.get ${}) ", ident.name));
                    self.g_step(ident, *op, ty);
                    self.emit(")");
                }
                _ => self.unsupported_expr("postfix operator on a non-variable"),
            },
            ExprKind::Assign { target, op, value } => {
                self.emit(f!("(local.tee ${} ", target.name));
                self.g_assigned_value(cx, target, *op, value)?;
                self.emit(")");
            }
            ExprKind::Call { callee, args } => self.g_call(cx, callee, args)?,
            ExprKind::Index { collection, index } => {
                let elem = match self.shape_of(cx, collection) {
                    Shape::List(elem) => elem,
                    _ => ValType::I32,
                };
                self.emit(f!("({elem}.load offset=4 (i32.add "));
                self.g_expr(cx, collection, ValType::I32)?;
                self.emit(" (i32.mul ");
                self.g_expr(cx, index, ValType::I32)?;
                self.emit(f!(" (i32.const {}))))", elem.size()));
            }
            ExprKind::List(elements) => {
                let elem = elements
                    .first()
                    .map_or(ValType::I32, |first| self.value_type(cx, first));
                self.g_list(cx, elements, elem)?;
            }
            ExprKind::StructLit(literal) => self.g_struct_literal(cx, literal)?,
            ExprKind::FieldAccess { receiver, field } => {
                let Some(slot) = self.field(cx, receiver, field) else {
                    self.unsupported_expr("access to an unknown field");
                    return Ok(());
                };
                self.emit(f!("({}.load offset={} ", slot.ty, slot.offset));
                self.g_expr(cx, receiver, ValType::I32)?;
                self.emit(")");
            }
            ExprKind::FieldAssign { .. } => self.unsupported_expr("field assignment as a value"),
            ExprKind::While(_) => self.unsupported_expr("loop as a value"),
            ExprKind::Function(_) => self.unsupported_expr("function literal"),
        }
        Ok(())
    }

    fn g_binary(
        &mut self,
        cx: &mut FunctionContext<'p>,
        op: BinaryOperator,
        lhs: &'p Expr,
        rhs: &'p Expr,
        hint: ValType,
    ) -> Result<()> {
        let ty = match op {
            BinaryOperator::And | BinaryOperator::Or => ValType::I32,
            _ => {
                let fallback = if op.is_boolean() { ValType::I32 } else { hint };
                self.type_of(cx, lhs)
                    .or_else(|| self.type_of(cx, rhs))
                    .unwrap_or_else(|| self.type_or(cx, lhs, fallback))
            }
        };
        let Some(instr) = binary_instr(op, ty) else {
            self.unsupported_expr("floating point remainder");
            return Ok(());
        };
        self.emit(f!("({ty}.{instr} "));
        self.g_expr(cx, lhs, ty)?;
        self.emit(" ");
        self.g_expr(cx, rhs, ty)?;
        self.emit(")");
        Ok(())
    }

    fn g_unary(
        &mut self,
        cx: &mut FunctionContext<'p>,
        op: UnaryOperator,
        operand: &'p Expr,
        hint: ValType,
    ) -> Result<()> {
        let fallback = match op {
            UnaryOperator::Not => ValType::I32,
            UnaryOperator::Neg => hint,
        };
        let ty = self.type_or(cx, operand, fallback);
        match (op, ty.is_float()) {
            (UnaryOperator::Not, false) => self.emit(f!("({ty}.eqz ")),
            (UnaryOperator::Not, true) => self.emit(f!("({ty}.eq ({ty}.const 0) ")),
            (UnaryOperator::Neg, false) => self.emit(f!("({ty}.sub ({ty}.const 0) ")),
            (UnaryOperator::Neg, true) => self.emit(f!("({ty}.neg ")),
        }
        self.g_expr(cx, operand, ty)?;
        self.emit(")");
        Ok(())
    }

    /// The new value of an assignment, combined with the old one for compound
    /// operators.
    fn g_assigned_value(
        &mut self,
        cx: &mut FunctionContext<'p>,
        target: &Ident,
        op: AssignOperator,
        value: &'p Expr,
    ) -> Result<()> {
        let ty = match cx.locals.get(&*target.name) {
            Some(local) => local.ty,
            None => self.value_type(cx, value),
        };
        match op.binary().and_then(|op| binary_instr(op, ty)) {
            Some(instr) => {
                self.emit(f!("({ty}.{instr} (local.get ${}) ", target.name));
                self.g_expr(cx, value, ty)?;
                self.emit(")");
            }
            None => self.g_expr(cx, value, ty)?,
        }
        Ok(())
    }

    fn g_step(&mut self, ident: &Ident, op: PostfixOperator, ty: ValType) {
        let instr = match op {
            PostfixOperator::Increment => "add",
            PostfixOperator::Decrement => "sub",
        };
        let name = &ident.name;
        self.emit(f!(
            "(local.set ${name} ({ty}.{instr} (local.get ${name}) ({ty}.const 1)))"
        ));
    }

    fn g_call(&mut self, cx: &mut FunctionContext<'p>, callee: &Ident, args: &'p [Expr]) -> Result<()> {
        let params = self.param_types(&callee.name)?;
        self.emit(f!("(call ${}", callee.name));
        for (i, arg) in args.iter().enumerate() {
            let ty = match params.get(i) {
                Some(ty) => *ty,
                None => self.value_type(cx, arg),
            };
            self.emit(" ");
            self.g_expr(cx, arg, ty)?;
        }
        self.emit(")");
        Ok(())
    }

    /// Lists are laid out as a 4 byte length followed by the elements.
    /// Indexing is not bounds checked.
    fn g_list(&mut self, cx: &mut FunctionContext<'p>, elements: &'p [Expr], elem: ValType) -> Result<()> {
        let tmp = cx.acquire_temp();
        self.uses_memory = true;
        self.emit(f!("(block (result i32) (local.set $.tmp_{tmp} {})", runtime::GROW_PAGE));
        self.emit(f!(
            " (i32.store (local.get $.tmp_{tmp}) (i32.const {}))",
            elements.len()
        ));
        for (i, element) in (0..).zip(elements) {
            let offset = 4 + i * elem.size();
            self.emit(f!(" ({elem}.store offset={offset} (local.get $.tmp_{tmp}) "));
            self.g_expr(cx, element, elem)?;
            self.emit(")");
        }
        self.emit(f!(" (local.get $.tmp_{tmp}))"));
        cx.release_temp();
        Ok(())
    }

    fn g_struct_literal(&mut self, cx: &mut FunctionContext<'p>, literal: &'p StructLiteral) -> Result<()> {
        let Some(layout) = self.structs.get(&*literal.name.name).cloned() else {
            self.unsupported_expr("literal of an unknown struct");
            return Ok(());
        };
        let tmp = cx.acquire_temp();
        self.emit(f!("(block (result i32) (local.set $.tmp_{tmp} "));
        self.g_alloc(layout.size);
        self.emit(")");
        for field in &layout.fields {
            let Some(value) = literal.fields.get(field.name) else {
                continue;
            };
            self.emit(f!(
                " ({}.store offset={} (local.get $.tmp_{tmp}) ",
                field.ty, field.offset
            ));
            self.g_expr(cx, value, field.ty)?;
            self.emit(")");
        }
        self.emit(f!(" (local.get $.tmp_{tmp}))"));
        cx.release_temp();
        Ok(())
    }

    /// Evaluates to a pointer to `size` fresh bytes.
    fn g_alloc(&mut self, size: impl std::fmt::Display) {
        if self.with_memory_management {
            self.emit(f!("(call {} (i32.const {size}))", runtime::ALLOCATE));
        } else {
            self.uses_memory = true;
            self.emit(runtime::GROW_PAGE);
        }
    }
}

/// Static typing of expressions, as far as the emitted instructions need it.
impl<'p> Generator<'p> {
    /// Returns `None` for untyped literals, which take the type of their
    /// context.
    fn type_of(&self, cx: &FunctionContext<'p>, expr: &'p Expr) -> Option<ValType> {
        match &expr.kind {
            ExprKind::Id(ident) => cx.locals.get(&*ident.name).map(|local| local.ty),
            ExprKind::Int(_) | ExprKind::Float(_) => None,
            ExprKind::Bool(_)
            | ExprKind::String(_)
            | ExprKind::List(_)
            | ExprKind::StructLit(_) => Some(ValType::I32),
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_boolean() {
                    Some(ValType::I32)
                } else {
                    self.type_of(cx, lhs).or_else(|| self.type_of(cx, rhs))
                }
            }
            ExprKind::Unary {
                op: UnaryOperator::Not,
                ..
            } => Some(ValType::I32),
            ExprKind::Unary { expr: operand, .. } | ExprKind::Postfix { expr: operand, .. } => {
                self.type_of(cx, operand)
            }
            ExprKind::Assign { target, .. } => cx.locals.get(&*target.name).map(|local| local.ty),
            ExprKind::Call { callee, .. } => {
                let results = self.result_types(&callee.name).ok()?;
                results.first().map(|(ty, _)| *ty)
            }
            ExprKind::Index { collection, .. } => match self.shape_of(cx, collection) {
                Shape::List(elem) => Some(elem),
                _ => None,
            },
            ExprKind::FieldAccess { receiver, field } => {
                self.field(cx, receiver, field).map(|slot| slot.ty)
            }
            ExprKind::FieldAssign { .. } | ExprKind::While(_) | ExprKind::Function(_) => None,
        }
    }

    fn type_or(&self, cx: &FunctionContext<'p>, expr: &'p Expr, hint: ValType) -> ValType {
        self.type_of(cx, expr).unwrap_or(match expr.kind {
            ExprKind::Float(_) if !hint.is_float() => ValType::F32,
            _ => hint,
        })
    }

    fn value_type(&self, cx: &FunctionContext<'p>, expr: &'p Expr) -> ValType {
        self.type_or(cx, expr, ValType::I32)
    }

    fn shape_of(&self, cx: &FunctionContext<'p>, expr: &'p Expr) -> Shape<'p> {
        match &expr.kind {
            ExprKind::Id(ident) => cx
                .locals
                .get(&*ident.name)
                .map_or(Shape::Scalar, |local| local.shape),
            ExprKind::Assign { target, .. } => cx
                .locals
                .get(&*target.name)
                .map_or(Shape::Scalar, |local| local.shape),
            ExprKind::String(_) => Shape::Str,
            ExprKind::StructLit(literal) => Shape::Struct(&literal.name.name),
            ExprKind::List(elements) => Shape::List(
                elements
                    .first()
                    .map_or(ValType::I32, |first| self.value_type(cx, first)),
            ),
            ExprKind::Call { callee, .. } => match self.result_types(&callee.name) {
                Ok(results) => results.first().map_or(Shape::Scalar, |(_, shape)| *shape),
                Err(_) => Shape::Scalar,
            },
            ExprKind::FieldAccess { receiver, field } => self
                .field(cx, receiver, field)
                .map_or(Shape::Scalar, |slot| slot.shape),
            _ => Shape::Scalar,
        }
    }

    fn field(&self, cx: &FunctionContext<'p>, receiver: &'p Expr, field: &Ident) -> Option<Field<'p>> {
        let Shape::Struct(name) = self.shape_of(cx, receiver) else {
            return None;
        };
        let layout = self.structs.get(name)?;
        layout
            .fields
            .iter()
            .find(|slot| slot.name == &*field.name)
            .copied()
    }
}

/// Utility functions.
impl Generator<'_> {
    /// Prints a line.
    fn out(&mut self, f: impl std::fmt::Display) {
        self.start();
        self.emit(f);
        self.end();
    }

    fn out_all(&mut self, lines: &[&str]) {
        for line in lines {
            self.out(line);
        }
    }

    /// Starts a line, to be finished with [`Generator::end`].
    fn start(&mut self) {
        for _ in 0..self.indent {
            self.code.push_str(INDENT);
        }
    }

    /// Writes inside the current line.
    fn emit(&mut self, f: impl std::fmt::Display) {
        write!(self.code, "{f}").expect("Failed to write to buffer");
    }

    fn end(&mut self) {
        self.code.push('\n');
    }

    fn indented<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.indent += 1;
        let res = f(self);
        self.indent -= 1;
        res
    }

    fn unsupported_stmt(&mut self, what: &str) {
        self.out(f!(";; unsupported: {what}"));
    }

    fn unsupported_expr(&mut self, what: &str) {
        self.emit(f!("(; unsupported: {what} ;) (unreachable)"));
    }
}

/// State of the function being generated, threaded through every call.
#[derive(Default)]
struct FunctionContext<'p> {
    locals: HashMap<&'p str, Local<'p>>,
    /// Locals other than parameters, in declaration order.
    declared: Vec<(&'p str, ValType)>,
    /// String literals in order of first use. The index is the slot.
    strings: Vec<&'p str>,
    results: Vec<ValType>,
    /// Deferred statements in registration order.
    defers: Vec<Deferred<'p>>,
    /// Block nesting below the function body.
    depth: usize,
    defer_flags: u32,
    /// Types of the `$.ret_N` locals that hold return values while the
    /// deferred statements run.
    return_slots: Vec<ValType>,
    temps: u32,
    max_temps: u32,
}

impl<'p> FunctionContext<'p> {
    fn reserve_return_slot(&mut self, slot: usize, ty: ValType) {
        if slot == self.return_slots.len() {
            self.return_slots.push(ty);
        }
    }

    fn declare(&mut self, name: &'p str, local: Local<'p>) {
        if !self.locals.contains_key(name) {
            self.locals.insert(name, local);
            self.declared.push((name, local.ty));
        }
    }

    fn intern(&mut self, text: &'p str) -> usize {
        if let Some(slot) = self.strings.iter().position(|known| *known == text) {
            return slot;
        }
        self.strings.push(text);
        self.strings.len() - 1
    }

    fn acquire_temp(&mut self) -> u32 {
        let tmp = self.temps;
        self.temps += 1;
        self.max_temps = self.max_temps.max(self.temps);
        tmp
    }

    fn release_temp(&mut self) {
        self.temps -= 1;
    }
}

struct Deferred<'p> {
    stmt: &'p Stmt,
    depth: usize,
    flag: Option<u32>,
    in_scope: bool,
}

#[derive(Copy, Clone)]
struct Local<'p> {
    ty: ValType,
    shape: Shape<'p>,
}

/// What an `i32` local points to, if anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Shape<'p> {
    Scalar,
    Str,
    Struct(&'p str),
    List(ValType),
}

#[derive(Clone, Default)]
struct StructLayout<'p> {
    size: u32,
    fields: Vec<Field<'p>>,
}

#[derive(Copy, Clone)]
struct Field<'p> {
    name: &'p str,
    ty: ValType,
    shape: Shape<'p>,
    offset: u32,
}

/// Returns `None` where the operation has no single instruction.
fn binary_instr(op: BinaryOperator, ty: ValType) -> Option<&'static str> {
    let float = ty.is_float();
    let instr = match op {
        BinaryOperator::Add => "add",
        BinaryOperator::Sub => "sub",
        BinaryOperator::Mul => "mul",
        BinaryOperator::Div if float => "div",
        BinaryOperator::Div => "div_s",
        BinaryOperator::Mod if float => return None,
        BinaryOperator::Mod => "rem_s",
        BinaryOperator::Eq => "eq",
        BinaryOperator::NotEq => "ne",
        BinaryOperator::Lt if float => "lt",
        BinaryOperator::Lt => "lt_s",
        BinaryOperator::Gt if float => "gt",
        BinaryOperator::Gt => "gt_s",
        BinaryOperator::LtEq if float => "le",
        BinaryOperator::LtEq => "le_s",
        BinaryOperator::GtEq if float => "ge",
        BinaryOperator::GtEq => "ge_s",
        BinaryOperator::And => "and",
        BinaryOperator::Or => "or",
    };
    Some(instr)
}

fn char_comment(byte: u8) -> String {
    if byte.is_ascii_graphic() || byte == b' ' {
        format!("'{}'", char::from(byte))
    } else {
        format!("'\\x{byte:02x}'")
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{
        codegen::generate,
        parser::parse_program,
        util::test_utils::{assert_errors, format_errors},
    };

    #[track_caller]
    fn generate_source(src: &str, with_memory_management: bool) -> String {
        let (program, errors) = parse_program(src, "test.pun");
        assert_errors(&errors, &[]);
        generate(&program, with_memory_management).unwrap()
    }

    #[track_caller]
    fn assert_contains(wat: &str, expected: &str) {
        assert!(wat.contains(expected), "expected\n{expected}\nin\n{wat}");
    }

    #[test]
    fn test_module() {
        let wat = generate_source("pub i32 add(i32 a, i32 b) { return a + b }", false);
        let expected = indoc! {r#"
            (module
              (import "imports" "println" (func $println (param i32)))
              (func $add (export "add") (param $a i32) (param $b i32) (result i32)
                (return (i32.add (local.get $a) (local.get $b)))
              )
            )
        "#};
        ::pretty_assertions::assert_eq!(wat, expected);
    }

    #[test]
    fn test_memory_management_block() {
        let with = generate_source("fn main() {}", true);
        assert_contains(&with, "(global $mem_alloc_ptr (mut i32) (i32.const 4))");
        assert_contains(&with, "(func $memory_allocate (param $size i32) (result i32)");
        assert_contains(&with, "(func $memory_deallocate (param $ptr i32)");

        let without = generate_source("fn main() {}", false);
        assert!(!without.contains("(memory"));
        assert!(!without.contains("$memory_allocate"));
    }

    #[test]
    fn test_string_literals_share_a_slot() {
        let src = indoc! {r#"
            pub str greet() {
                log("hi")
                log("hi")
                return "hi"
            }
            fn log(str s) {
                println(s)
            }
        "#};
        let wat = generate_source(src, true);
        let expected = indoc! {r#"
              (func $greet (export "greet") (result i32)
                (local $.str_ptr_0 i32)
                (local.set $.str_ptr_0 (call $memory_allocate (i32.const 3)))
                (i32.store8 offset=0 (local.get $.str_ptr_0) (i32.const 104)) ;; 'h'
                (i32.store8 offset=1 (local.get $.str_ptr_0) (i32.const 105)) ;; 'i'
                (i32.store8 offset=2 (local.get $.str_ptr_0) (i32.const 0))
                (call $log (local.get $.str_ptr_0))
                (call $log (local.get $.str_ptr_0))
                (return (local.get $.str_ptr_0))
              )
              (func $log (param $s i32)
                (call $println (local.get $s))
              )
        "#};
        assert_contains(&wat, expected);
        assert_eq!(wat.matches("(i32.const 3)").count(), 1);
        assert!(!wat.contains("$.str_ptr_1"));
    }

    #[test]
    fn test_type_mapping() {
        let wat = generate_source("pub u8 a(u64 x, f64 y, bool z, i16 w, f32 v) { return 1 }", false);
        assert_contains(
            &wat,
            r#"(func $a (export "a") (param $x i64) (param $y f64) (param $z i32) (param $w i32) (param $v f32) (result i32)"#,
        );
    }

    #[test]
    fn test_unknown_type() {
        let (program, errors) = parse_program("fn f(float x) {}", "test.pun");
        assert_errors(&errors, &[]);
        let error = generate(&program, false).unwrap_err();
        assert_eq!(
            format_errors(&[error]),
            ["1:6: unknown type 'float'"]
        );
    }

    #[test]
    fn test_loops() {
        let src = indoc! {"
            fn count(i32 n) {
                for n > 0 { n-- }
                for i := 0; i < 3; i++ { println(i) }
            }
        "};
        let wat = generate_source(src, false);
        let expected = indoc! {"
              (func $count (param $n i32)
                (local $i i32)
                (block $while_0_end
                  (loop $while_0
                    (br_if $while_0_end (i32.eqz (i32.gt_s (local.get $n) (i32.const 0))))
                    (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                    (br $while_0)
                  )
                )
                (local.set $i (i32.const 0))
                (block $for_0_end
                  (loop $for_0
                    (br_if $for_0_end (i32.eqz (i32.lt_s (local.get $i) (i32.const 3))))
                    (call $println (local.get $i))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $for_0)
                  )
                )
              )
        "};
        assert_contains(&wat, expected);
    }

    #[test]
    fn test_unused_results() {
        let src = indoc! {r#"
            pub (i32, i32) pair() {
                return 1, 2
            }
            str name() {
                return "x"
            }
            fn main() {
                pair()
                name()
                5
            }
        "#};
        let expected = indoc! {"
              (func $main
                (call $pair)
                (drop)
                (drop)
                (call $memory_deallocate (call $name))
                (drop (i32.const 5))
              )
        "};
        let wat = generate_source(src, true);
        assert_contains(&wat, r#"(func $pair (export "pair") (result i32 i32)"#);
        assert_contains(&wat, "(return (i32.const 1) (i32.const 2))");
        assert_contains(&wat, expected);

        let wat = generate_source(src, false);
        assert_contains(&wat, "    (call $name)\n    (drop)\n");
        assert!(!wat.contains("$memory_deallocate"));
    }

    #[test]
    fn test_deferred_statements_run_at_every_exit() {
        let src = indoc! {"
            fn work() {
                defer println(1)
                defer println(2)
                if true { return }
                println(3)
            }
        "};
        let expected = indoc! {"
              (func $work
                (if (i32.const 1)
                  (then
                    (call $println (i32.const 2))
                    (call $println (i32.const 1))
                    (return)
                  )
                )
                (call $println (i32.const 3))
                (call $println (i32.const 2))
                (call $println (i32.const 1))
              )
        "};
        assert_contains(&generate_source(src, false), expected);
    }

    #[test]
    fn test_return_values_computed_before_deferred_statements() {
        let src = indoc! {"
            i32 compute() { return 1 }
            fn cleanup() {}
            pub i32 f() {
                i32 x = 5
                defer x = 0
                defer cleanup()
                return compute() + x
            }
        "};
        let expected = indoc! {r#"
              (func $f (export "f") (result i32)
                (local $x i32)
                (local $.ret_0 i32)
                (local.set $x (i32.const 5))
                (local.set $.ret_0 (i32.add (call $compute) (local.get $x)))
                (call $cleanup)
                (local.set $x (i32.const 0))
                (return (local.get $.ret_0))
              )
        "#};
        assert_contains(&generate_source(src, false), expected);
    }

    #[test]
    fn test_deferred_statement_in_untaken_branch() {
        let src = indoc! {"
            fn work(bool c) {
                if c {
                    defer println(1)
                }
                println(2)
            }
        "};
        let expected = indoc! {"
              (func $work (param $c i32)
                (local $.defer_0 i32)
                (if (local.get $c)
                  (then
                    (local.set $.defer_0 (i32.const 1))
                  )
                )
                (call $println (i32.const 2))
                (if (local.get $.defer_0)
                  (then
                    (call $println (i32.const 1))
                  )
                )
              )
        "};
        assert_contains(&generate_source(src, false), expected);
    }

    #[test]
    fn test_synthesized_locals_do_not_clash_with_variables() {
        let src = indoc! {r#"
            fn main() {
                i32 tmp_0 = 1
                i32 str_ptr_0 = 2
                []i32 xs = [tmp_0]
                println("s")
            }
        "#};
        let wat = generate_source(src, false);
        for local in [
            "(local $tmp_0 i32)",
            "(local $.tmp_0 i32)",
            "(local $str_ptr_0 i32)",
            "(local $.str_ptr_0 i32)",
        ] {
            assert_eq!(wat.matches(local).count(), 1, "{local} in\n{wat}");
        }
    }

    #[test]
    fn test_missing_return_is_unreachable() {
        let src = "pub i32 h(bool c) { if c { return 1 } else { return 2 } }";
        let expected = indoc! {r#"
              (func $h (export "h") (param $c i32) (result i32)
                (if (local.get $c)
                  (then
                    (return (i32.const 1))
                  )
                  (else
                    (return (i32.const 2))
                  )
                )
                (unreachable)
              )
        "#};
        assert_contains(&generate_source(src, false), expected);
    }

    #[test]
    fn test_structs() {
        let src = indoc! {"
            struct Point { i32 x; i64 y }
            pub i64 f() {
                Point p = Point{y: 2, x: 1}
                p.x = 3
                return p.y
            }
        "};
        let expected = indoc! {r#"
              (func $f (export "f") (result i64)
                (local $p i32)
                (local $.tmp_0 i32)
                (local.set $p (block (result i32) (local.set $.tmp_0 (call $memory_allocate (i32.const 12))) (i32.store offset=0 (local.get $.tmp_0) (i32.const 1)) (i64.store offset=4 (local.get $.tmp_0) (i64.const 2)) (local.get $.tmp_0)))
                (i32.store offset=0 (local.get $p) (i32.const 3))
                (return (i64.load offset=4 (local.get $p)))
              )
        "#};
        assert_contains(&generate_source(src, true), expected);
    }

    #[test]
    fn test_lists() {
        let src = indoc! {"
            pub i32 g() {
                []i32 xs = [7, 8]
                return xs[1]
            }
        "};
        let expected = indoc! {r#"
            (module
              (import "imports" "println" (func $println (param i32)))
              (memory 1)
              (export "memory" (memory 0))
              (func $g (export "g") (result i32)
                (local $xs i32)
                (local $.tmp_0 i32)
                (local.set $xs (block (result i32) (local.set $.tmp_0 (i32.mul (memory.grow (i32.const 1)) (i32.const 65536))) (i32.store (local.get $.tmp_0) (i32.const 2)) (i32.store offset=4 (local.get $.tmp_0) (i32.const 7)) (i32.store offset=8 (local.get $.tmp_0) (i32.const 8)) (local.get $.tmp_0)))
                (return (i32.load offset=4 (i32.add (local.get $xs) (i32.mul (i32.const 1) (i32.const 4)))))
              )
            )
        "#};
        ::pretty_assertions::assert_eq!(generate_source(src, false), expected);
    }

    #[test]
    fn test_operators() {
        let src = indoc! {"
            pub f32 s(f32 v) { return v * 2.5 / 2 }
            fn u(i64 a) {
                a = -a
                a += 2
                let ok = !(a < 3) || a >= 4
            }
        "};
        let wat = generate_source(src, false);
        assert_contains(
            &wat,
            "(return (f32.div (f32.mul (local.get $v) (f32.const 2.5)) (f32.const 2)))",
        );
        assert_contains(&wat, "(local.set $a (i64.sub (i64.const 0) (local.get $a)))");
        assert_contains(&wat, "(local.set $a (i64.add (local.get $a) (i64.const 2)))");
        assert_contains(
            &wat,
            "(local.set $ok (i32.or (i32.eqz (i64.lt_s (local.get $a) (i64.const 3))) (i64.ge_s (local.get $a) (i64.const 4))))",
        );
    }

    #[test]
    fn test_unsupported_constructs() {
        let src = indoc! {"
            let x = 1
            fn main() {
                let f = fn() {}
            }
        "};
        let wat = generate_source(src, false);
        assert_contains(&wat, "  ;; unsupported: top-level statement\n");
        assert_contains(
            &wat,
            "(local.set $f (; unsupported: function literal ;) (unreachable))",
        );
    }

    #[test]
    fn test_generation_is_repeatable() {
        let src = "fn a() { for i := 0; i < 2; i++ {} }\nfn b() { for i := 0; i < 2; i++ {} }";
        let (program, _) = parse_program(src, "test.pun");
        let first = generate(&program, true).unwrap();
        assert_contains(&first, "$for_1");
        assert!(!first.contains("$for_2"));
        assert_eq!(first, generate(&program, true).unwrap());
    }

    #[test]
    fn test_showcase() {
        let (program, errors) = parse_program(include_str!("../../demos/showcase.pun"), "showcase.pun");
        assert_errors(&errors, &[]);
        for with_memory_management in [false, true] {
            let wat = generate(&program, with_memory_management).unwrap();
            assert!(wat.starts_with("(module\n"));
            assert!(wat.ends_with(")\n"));
            assert!(!wat.contains("unsupported"));
        }
    }
}
