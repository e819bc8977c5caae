use std::{
    collections::{BTreeMap, HashMap, HashSet},
    mem,
};

use crate::{
    ast::{
        Alternative, AssignOperator, BinaryOperator, Block, Expr, ExprKind, File, For, Function,
        FunctionLiteral, Ident, If, ListDecl, Param, PostfixOperator, Program, Stmt, StmtKind,
        StructDef, StructField, StructLiteral, TypeName, UnaryOperator, VarDecl, While,
    },
    lexer::Lexer,
    token::{Position, Positioned, Primitive, Token, TokenKind},
};

type Result<T, E = Bail> = std::result::Result<T, E>;

/// Why a construct failed to parse. The error itself was already recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Bail {
    /// Skip to the next statement and keep going.
    Recover,
    /// Give up on the current file.
    Abort,
}

pub type Errors = Vec<Positioned<Error>>;

/// Parses a whole source. Every `package` clause starts a new [`File`].
///
/// The returned program is complete only if there are no errors; otherwise it
/// holds whatever could be parsed.
pub fn parse_program(src: &str, filename: &str) -> (Program, Errors) {
    let mut p = Parser::new(src);
    let program = p.parse_program(filename);
    (program, p.errors)
}

/// Parses a single expression, which must span the whole input.
pub fn parse_expr(src: &str) -> (Option<Expr>, Errors) {
    let mut p = Parser::new(src);
    let expr = p.parse_expr().ok();
    if expr.is_some() && !p.is(TokenKind::Eof) {
        p.unexpected(TokenKind::Eof);
    }
    (expr, p.errors)
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token,
    peek: Token,
    errors: Errors,
    /// Field names of every struct defined so far, in declaration order.
    structs: HashMap<Box<str>, Vec<Box<str>>>,
    /// Identifiers that name a type.
    defined_types: HashSet<Box<str>>,
    /// Number of enclosing `if`/`for` headers. A `{` after an identifier only
    /// opens a struct literal when this is zero.
    control_depth: u32,
    /// Statements deferred in the function being parsed.
    defer_stack: Vec<Stmt>,
    next_loop_id: u32,
    /// Number of tokens consumed so far.
    consumed: usize,
}

impl Parser<'_> {
    fn parse_program(&mut self, filename: &str) -> Program {
        let mut files = Vec::new();
        loop {
            files.push(self.parse_file(filename));
            if self.is(TokenKind::Eof) {
                break Program { files };
            }
        }
    }

    fn parse_file(&mut self, filename: &str) -> File {
        let mut file = File {
            filename: filename.into(),
            package: None,
            imports: Vec::new(),
            statements: Vec::new(),
        };
        if let Err(Bail::Abort) = self.parse_file_contents(&mut file) {
            while !matches!(self.current.kind, TokenKind::Eof | TokenKind::Package) {
                self.advance();
            }
        }
        file
    }

    fn parse_file_contents(&mut self, file: &mut File) -> Result<()> {
        if self.take(TokenKind::Package) {
            file.package = self.recover(Parser::parse_ident)?;
        }
        if self.take(TokenKind::Import) {
            file.imports = self.recover(Parser::parse_imports)?.unwrap_or_default();
        }
        while !matches!(self.current.kind, TokenKind::Eof | TokenKind::Package) {
            if self.take(TokenKind::Semicolon) {
                continue;
            }
            if let Some(stmt) = self.parse_statement_or_sync()? {
                file.statements.push(stmt);
            } else if self.is(TokenKind::RBrace) {
                // Left behind by a block that failed to parse.
                self.advance();
            }
        }
        Ok(())
    }

    fn parse_imports(&mut self) -> Result<Vec<Box<str>>> {
        if !self.take(TokenKind::LParen) {
            return Ok(vec![self.parse_string()?]);
        }
        let mut imports = Vec::new();
        while !self.is(TokenKind::RParen) {
            imports.push(self.parse_string()?);
            _ = self.take(TokenKind::Comma) || self.take(TokenKind::Semicolon);
        }
        self.advance();
        Ok(imports)
    }

    /// Parses a statement, skipping to the next statement boundary if it has
    /// a recoverable error.
    fn parse_statement_or_sync(&mut self) -> Result<Option<Stmt>> {
        let start = self.consumed;
        match self.parse_statement() {
            Ok(stmt) => {
                self.take(TokenKind::Semicolon);
                Ok(Some(stmt))
            }
            Err(Bail::Recover) => {
                self.synchronize(start);
                Ok(None)
            }
            Err(Bail::Abort) => Err(Bail::Abort),
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        use TokenKind::*;
        let pos = self.current.pos;
        // Copied out, since the guards below look ahead through the lexer.
        let current = self.current.kind;
        let kind = match current {
            Pub => StmtKind::Function(self.parse_function()?),
            TokenKind::Function if self.peek.kind == Identifier => {
                StmtKind::Function(self.parse_function()?)
            }
            _ if self.is_function_declaration() => StmtKind::Function(self.parse_function()?),
            _ if self.is_variable_declaration() => StmtKind::VarDecl(self.parse_var_decl()?),
            Identifier if self.peek.kind == Infer && !self.is_type_token(&self.current) => {
                StmtKind::VarDecl(self.parse_inferred_decl()?)
            }
            Struct => StmtKind::Struct(self.parse_struct_def()?),
            Defer => self.parse_defer()?,
            Return => StmtKind::Return(self.parse_return()?),
            TokenKind::If => StmtKind::If(self.parse_if()?),
            TokenKind::For => return self.parse_for(),
            LBrace => StmtKind::Block(self.parse_block()?),
            Let | Const => self.parse_let()?,
            LBracket if self.peek.kind == RBracket => StmtKind::List(self.parse_list_decl()?),
            _ => StmtKind::Expr(self.parse_expr_statement()?),
        };
        Ok(Stmt { kind, pos })
    }

    /// `Type name (`, or `(Type, ...)` opening a multi-value signature.
    fn is_function_declaration(&mut self) -> bool {
        if self.is(TokenKind::LParen) {
            return self.is_type_token(&self.peek);
        }
        self.is_type_token(&self.current)
            && self.peek.kind == TokenKind::Identifier
            && self.peek_after() == TokenKind::LParen
    }

    /// `Type name =`
    fn is_variable_declaration(&mut self) -> bool {
        self.is_type_token(&self.current)
            && self.peek.kind == TokenKind::Identifier
            && self.peek_after() == TokenKind::Assign
    }

    fn is_type_token(&self, token: &Token) -> bool {
        match token.kind {
            TokenKind::Primitive(_) => true,
            TokenKind::Identifier => self.defined_types.contains(&token.text),
            _ => false,
        }
    }

    fn parse_function(&mut self) -> Result<Function> {
        let exported = self.take(TokenKind::Pub);
        let return_types = if self.take(TokenKind::Function) {
            Vec::new()
        } else if self.is(TokenKind::LParen) {
            self.parse_return_types()?
        } else {
            vec![self.parse_signature_type()?]
        };
        let name = Self::ident_of(self.expect_signature(TokenKind::Identifier)?);
        let params = self.parse_params()?;
        let (body, deferred) = self.parse_function_body()?;
        Ok(Function {
            exported,
            name,
            return_types,
            params,
            body,
            deferred,
        })
    }

    fn parse_return_types(&mut self) -> Result<Vec<TypeName>> {
        self.expect_signature(TokenKind::LParen)?;
        let types = self.parse_list(TokenKind::RParen, Parser::parse_signature_type)?;
        self.expect_signature(TokenKind::RParen)?;
        Ok(types)
    }

    fn parse_params(&mut self) -> Result<Vec<Param>> {
        self.expect_signature(TokenKind::LParen)?;
        let params = self.parse_list(TokenKind::RParen, |p| {
            let ty = p.parse_signature_type()?;
            let name = Self::ident_of(p.expect_signature(TokenKind::Identifier)?);
            Ok(Param { ty, name })
        })?;
        self.expect_signature(TokenKind::RParen)?;
        Ok(params)
    }

    /// Parses a function body with its own defer stack. Deferred statements
    /// are returned in execution order.
    fn parse_function_body(&mut self) -> Result<(Block, Vec<Stmt>)> {
        if !self.is(TokenKind::LBrace) {
            let actual = self.current.kind;
            return Err(self.error(Error::MalformedSignature { actual }));
        }
        let outer = mem::take(&mut self.defer_stack);
        let body = self.parse_block();
        let mut deferred = mem::replace(&mut self.defer_stack, outer);
        deferred.reverse();
        Ok((body?, deferred))
    }

    fn parse_signature_type(&mut self) -> Result<TypeName> {
        match self.current.kind {
            TokenKind::Primitive(_) | TokenKind::Identifier => {
                Ok(TypeName(Self::ident_of(self.advance())))
            }
            actual => Err(self.error(Error::MalformedSignature { actual })),
        }
    }

    fn expect_signature(&mut self, expected: TokenKind) -> Result<Token> {
        if self.is(expected) {
            Ok(self.advance())
        } else {
            let actual = self.current.kind;
            Err(self.error(Error::MalformedSignature { actual }))
        }
    }

    fn parse_var_decl(&mut self) -> Result<VarDecl> {
        let ty = TypeName(Self::ident_of(self.advance()));
        let name = self.parse_ident()?;
        self.consume(TokenKind::Assign)?;
        let value = self.parse_expr()?;
        Ok(VarDecl {
            ty,
            name,
            value,
            inferred: false,
        })
    }

    fn parse_inferred_decl(&mut self) -> Result<VarDecl> {
        let name = self.parse_ident()?;
        self.consume(TokenKind::Infer)?;
        let value = self.parse_expr()?;
        let primitive = match value.kind {
            ExprKind::Int(_) => Primitive::I32,
            ExprKind::Float(_) => Primitive::F32,
            ExprKind::String(_) => Primitive::Str,
            ExprKind::Bool(_) => Primitive::Bool,
            _ => return Err(self.error_at(value.pos, Error::CannotInferType)),
        };
        Ok(VarDecl {
            ty: TypeName(Ident::new(primitive.name(), name.pos)),
            name,
            value,
            inferred: true,
        })
    }

    fn parse_list_decl(&mut self) -> Result<ListDecl> {
        self.consume(TokenKind::LBracket)?;
        self.consume(TokenKind::RBracket)?;
        let elem_ty = self.parse_type()?;
        let name = self.parse_ident()?;
        self.consume(TokenKind::Assign)?;
        let value = self.parse_expr()?;
        Ok(ListDecl {
            elem_ty,
            name,
            value,
        })
    }

    fn parse_let(&mut self) -> Result<StmtKind> {
        let constant = self.advance().kind == TokenKind::Const;
        let name = self.parse_ident()?;
        self.consume(TokenKind::Assign)?;
        let value = self.parse_expr()?;
        Ok(StmtKind::Let {
            constant,
            name,
            value,
        })
    }

    fn parse_struct_def(&mut self) -> Result<StructDef> {
        self.consume(TokenKind::Struct)?;
        let name = self.parse_ident()?;
        self.consume(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.is(TokenKind::RBrace) {
            let ty = self.parse_type()?;
            let name = self.parse_ident()?;
            fields.push(StructField { ty, name });
            _ = self.take(TokenKind::Comma) || self.take(TokenKind::Semicolon);
        }
        self.advance();

        let field_names = fields.iter().map(|f| f.name.name.clone()).collect();
        self.structs.insert(name.name.clone(), field_names);
        self.defined_types.insert(name.name.clone());
        Ok(StructDef { name, fields })
    }

    fn parse_defer(&mut self) -> Result<StmtKind> {
        self.consume(TokenKind::Defer)?;
        let stmt = self.parse_statement()?;
        self.defer_stack.push(stmt.clone());
        Ok(StmtKind::Defer(Box::new(stmt)))
    }

    fn parse_return(&mut self) -> Result<Vec<Expr>> {
        self.consume(TokenKind::Return)?;
        if matches!(
            self.current.kind,
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        ) {
            return Ok(Vec::new());
        }

        let mut values = if self.take(TokenKind::LParen) {
            let grouped = self.parse_list(TokenKind::RParen, Parser::parse_expr)?;
            self.consume(TokenKind::RParen)?;
            match <[Expr; 1]>::try_from(grouped) {
                // A single parenthesized value may go on, as in `(a + b) * c`.
                Ok([value]) => vec![self.parse_infix_loop(value, Precedence::Lowest)?],
                Err(grouped) => grouped,
            }
        } else {
            vec![self.parse_expr()?]
        };
        while self.take(TokenKind::Comma) {
            values.push(self.parse_expr()?);
        }
        Ok(values)
    }

    fn parse_if(&mut self) -> Result<If> {
        self.consume(TokenKind::If)?;
        let condition = self.in_control(Parser::parse_expr)?;
        let consequence = self.parse_block()?;
        let alternative = if !self.take(TokenKind::Else) {
            None
        } else if self.is(TokenKind::If) {
            Some(Box::new(Alternative::ElseIf(self.parse_if()?)))
        } else {
            Some(Box::new(Alternative::Else(self.parse_block()?)))
        };
        Ok(If {
            condition,
            consequence,
            alternative,
        })
    }

    /// Parses `for init; cond; post {}`, as well as the `for cond {}` and
    /// `for {}` loops, which become while expressions.
    fn parse_for(&mut self) -> Result<Stmt> {
        let pos = self.consume(TokenKind::For)?.pos;
        if self.is(TokenKind::LBrace) {
            let forever = Expr {
                kind: ExprKind::Bool(true),
                pos,
            };
            return self.parse_while(forever, pos);
        }

        let init = self.in_control(Parser::parse_statement)?;
        if !self.take(TokenKind::Semicolon) {
            return match init.kind {
                StmtKind::Expr(condition) if self.is(TokenKind::LBrace) => {
                    self.parse_while(condition, pos)
                }
                _ => Err(self.unexpected(TokenKind::Semicolon)),
            };
        }
        let condition = self.in_control(Parser::parse_expr)?;
        self.consume(TokenKind::Semicolon)?;
        let post = if self.is(TokenKind::LBrace) {
            None
        } else {
            Some(Box::new(self.in_control(Parser::parse_statement)?))
        };
        let body = self.parse_block()?;

        let kind = StmtKind::For(For {
            init: Box::new(init),
            condition,
            post,
            body,
        });
        Ok(Stmt { kind, pos })
    }

    fn parse_while(&mut self, condition: Expr, pos: Position) -> Result<Stmt> {
        let id = self.next_loop_id;
        self.next_loop_id += 1;
        let body = self.parse_block()?;
        let expr = Expr {
            kind: ExprKind::While(While {
                condition: Box::new(condition),
                body,
                id,
            }),
            pos,
        };
        Ok(Stmt {
            kind: StmtKind::Expr(expr),
            pos,
        })
    }

    fn parse_block(&mut self) -> Result<Block> {
        let pos = self.consume(TokenKind::LBrace)?.pos;
        // Struct literals are fine again inside a block, even within a header.
        let statements = self.with_control_depth(0, |p| -> Result<Vec<Stmt>> {
            let mut statements = Vec::new();
            loop {
                match p.current.kind {
                    TokenKind::RBrace => break Ok(statements),
                    TokenKind::Eof => {
                        let expected = TokenKind::RBrace;
                        break Err(p.error(Error::UnexpectedEof { expected }));
                    }
                    TokenKind::Semicolon => {
                        p.advance();
                    }
                    _ => statements.extend(p.parse_statement_or_sync()?),
                }
            }
        })?;
        self.advance();
        Ok(Block { statements, pos })
    }

    fn parse_expr_statement(&mut self) -> Result<Expr> {
        let expr = self.parse_expr()?;
        if Self::assign_operator(self.current.kind).is_some() {
            return Err(self.error_at(expr.pos, Error::InvalidAssignmentTarget));
        }
        Ok(expr)
    }

    fn parse_type(&mut self) -> Result<TypeName> {
        match self.current.kind {
            TokenKind::Primitive(_) | TokenKind::Identifier => {
                Ok(TypeName(Self::ident_of(self.advance())))
            }
            _ => Err(self.unexpected(TokenKind::Identifier)),
        }
    }

    fn parse_ident(&mut self) -> Result<Ident> {
        let token = self.consume(TokenKind::Identifier)?;
        Ok(Self::ident_of(token))
    }

    fn parse_string(&mut self) -> Result<Box<str>> {
        Ok(self.consume(TokenKind::String)?.text)
    }
}

/// Expressions.
impl Parser<'_> {
    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_expr_prec(Precedence::Lowest)
    }

    fn parse_expr_prec(&mut self, precedence: Precedence) -> Result<Expr> {
        let lhs = self.parse_prefix(precedence)?;
        self.parse_infix_loop(lhs, precedence)
    }

    fn parse_infix_loop(&mut self, mut lhs: Expr, precedence: Precedence) -> Result<Expr> {
        loop {
            if let Some(op) = Self::postfix_operator(self.current.kind) {
                self.advance();
                let pos = lhs.pos;
                let expr = Box::new(lhs);
                lhs = Expr {
                    kind: ExprKind::Postfix { op, expr },
                    pos,
                };
                continue;
            }
            match Precedence::of(self.current.kind) {
                Some(op_precedence) if op_precedence > precedence => {
                    let op_token = self.advance();
                    lhs = self.parse_infix(&op_token, lhs, op_precedence)?;
                }
                _ => break Ok(lhs),
            }
        }
    }

    /// Parses tokens that start an expression (prefix operators, literals,
    /// grouping).
    fn parse_prefix(&mut self, precedence: Precedence) -> Result<Expr> {
        use TokenKind::*;
        let pos = self.current.pos;
        let kind = match self.current.kind {
            Int | Float | True | False => return self.parse_literal_operand(precedence),
            Identifier => return self.parse_identifier(precedence),
            String => ExprKind::String(self.advance().text),
            Bang | Minus => {
                let op = if self.advance().kind == Bang {
                    UnaryOperator::Not
                } else {
                    UnaryOperator::Neg
                };
                let expr = self.parse_expr_prec(Precedence::Prefix)?;
                ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                }
            }
            LParen => {
                self.advance();
                let expr = self.with_control_depth(0, Parser::parse_expr)?;
                self.consume(RParen)?;
                return Ok(expr);
            }
            LBracket => {
                self.advance();
                let elements = self.with_control_depth(0, |this| {
                    this.parse_list(RBracket, Parser::parse_expr)
                })?;
                self.consume(RBracket)?;
                ExprKind::List(elements)
            }
            TokenKind::Function => ExprKind::Function(self.parse_function_literal()?),
            token => return Err(self.error(Error::NoPrefixRule { token })),
        };
        Ok(Expr { kind, pos })
    }

    /// Numeric and boolean literals combine right away with a binary operator
    /// that binds tighter than `precedence`.
    fn parse_literal_operand(&mut self, precedence: Precedence) -> Result<Expr> {
        let token = self.advance();
        let kind = match token.kind {
            TokenKind::Int => match token.text.parse() {
                Ok(int) => ExprKind::Int(int),
                Err(_) => return Err(self.error_at(token.pos, Error::InvalidNumber)),
            },
            TokenKind::Float => match token.text.parse() {
                Ok(float) => ExprKind::Float(float),
                Err(_) => return Err(self.error_at(token.pos, Error::InvalidNumber)),
            },
            kind => ExprKind::Bool(kind == TokenKind::True),
        };
        let literal = Expr {
            kind,
            pos: token.pos,
        };

        let is_binary = Self::binary_operator(self.current.kind).is_some();
        match Precedence::of(self.current.kind) {
            Some(op_precedence) if is_binary && op_precedence > precedence => {
                let op_token = self.advance();
                self.parse_infix(&op_token, literal, op_precedence)
            }
            _ => Ok(literal),
        }
    }

    fn parse_identifier(&mut self, precedence: Precedence) -> Result<Expr> {
        let ident = self.parse_ident()?;
        let pos = ident.pos;

        if precedence == Precedence::Lowest {
            if let Some(op) = Self::assign_operator(self.current.kind) {
                self.advance();
                let value = self.parse_expr()?;
                let kind = ExprKind::Assign {
                    target: ident,
                    op,
                    value: Box::new(value),
                };
                return Ok(Expr { kind, pos });
            }
        }

        let kind = match self.current.kind {
            TokenKind::Infer => return Err(self.error(Error::InferenceOutsideStatement)),
            TokenKind::Dot => return self.parse_field_access(ident, precedence),
            TokenKind::LParen => {
                self.advance();
                let args = self.parse_call_args()?;
                ExprKind::Call {
                    callee: ident,
                    args,
                }
            }
            TokenKind::LBrace if self.control_depth == 0 => {
                ExprKind::StructLit(self.parse_struct_literal(ident)?)
            }
            _ => ExprKind::Id(ident),
        };
        Ok(Expr { kind, pos })
    }

    fn parse_field_access(&mut self, ident: Ident, precedence: Precedence) -> Result<Expr> {
        let pos = ident.pos;
        let mut receiver = Expr {
            kind: ExprKind::Id(ident),
            pos,
        };
        self.consume(TokenKind::Dot)?;
        let mut field = self.parse_ident()?;
        while self.take(TokenKind::Dot) {
            let kind = ExprKind::FieldAccess {
                receiver: Box::new(receiver),
                field,
            };
            receiver = Expr { kind, pos };
            field = self.parse_ident()?;
        }

        let receiver = Box::new(receiver);
        let kind = if precedence == Precedence::Lowest && self.take(TokenKind::Assign) {
            let value = Box::new(self.parse_expr()?);
            ExprKind::FieldAssign {
                receiver,
                field,
                value,
            }
        } else {
            ExprKind::FieldAccess { receiver, field }
        };
        Ok(Expr { kind, pos })
    }

    /// Parses arguments after the opening parenthesis.
    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        let args = self.with_control_depth(0, |this| {
            this.parse_list(TokenKind::RParen, Parser::parse_expr)
        })?;
        self.consume(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_struct_literal(&mut self, name: Ident) -> Result<StructLiteral> {
        self.consume(TokenKind::LBrace)?;
        let mut entries = Vec::new();
        while !self.is(TokenKind::RBrace) {
            let field = if self.is(TokenKind::Identifier) && self.peek.kind == TokenKind::Colon {
                let field = self.parse_ident()?;
                self.advance();
                Some(field)
            } else {
                None
            };
            entries.push((field, self.parse_expr()?));
            self.take(TokenKind::Comma);
        }
        self.advance();
        self.resolve_struct_literal(name, entries)
    }

    /// Matches literal entries against the struct's declared fields. Entries
    /// without a name take the next declared field.
    fn resolve_struct_literal(
        &mut self,
        name: Ident,
        entries: Vec<(Option<Ident>, Expr)>,
    ) -> Result<StructLiteral> {
        let Some(declared) = self.structs.get(&name.name) else {
            let error = Error::UndefinedStruct(name.name.clone());
            return Err(self.error_at(name.pos, error));
        };

        let mut fields = BTreeMap::new();
        let mut errors = Vec::new();
        let mut positional = declared.iter();
        for (field, value) in entries {
            let key = match field {
                Some(field) if declared.contains(&field.name) => field.name,
                Some(field) => {
                    errors.push(field.pos.wrap(Error::UnknownStructField {
                        name: name.name.clone(),
                        field: field.name,
                    }));
                    continue;
                }
                None => {
                    let Some(key) = positional.next() else {
                        let error = Error::TooManyStructValues(name.name.clone());
                        errors.push(value.pos.wrap(error));
                        break;
                    };
                    key.clone()
                }
            };
            if fields.contains_key(&key) {
                errors.push(value.pos.wrap(Error::DuplicateStructField(key)));
                continue;
            }
            fields.insert(key, value);
        }

        if errors.is_empty() {
            Ok(StructLiteral { name, fields })
        } else {
            self.errors.extend(errors);
            Err(Bail::Recover)
        }
    }

    fn parse_function_literal(&mut self) -> Result<FunctionLiteral> {
        self.consume(TokenKind::Function)?;
        let params = self.parse_params()?;
        let return_types = match self.current.kind {
            TokenKind::LBrace => Vec::new(),
            TokenKind::LParen => self.parse_return_types()?,
            _ => vec![self.parse_signature_type()?],
        };
        let (body, _) = self.parse_function_body()?;
        Ok(FunctionLiteral {
            params,
            return_types,
            body,
        })
    }

    /// Parses tokens that follow a left-hand side expression.
    fn parse_infix(&mut self, op_token: &Token, lhs: Expr, precedence: Precedence) -> Result<Expr> {
        let pos = lhs.pos;
        let kind = match op_token.kind {
            TokenKind::LBracket => {
                let index = self.with_control_depth(0, Parser::parse_expr)?;
                self.consume(TokenKind::RBracket)?;
                ExprKind::Index {
                    collection: Box::new(lhs),
                    index: Box::new(index),
                }
            }
            TokenKind::LParen => {
                let ExprKind::Id(callee) = lhs.kind else {
                    return Err(self.error_at(pos, Error::InvalidCallee));
                };
                let args = self.parse_call_args()?;
                ExprKind::Call { callee, args }
            }
            actual => {
                let Some(op) = Self::binary_operator(actual) else {
                    let error = Error::UnexpectedOperator { actual };
                    return Err(self.error_at(op_token.pos, error));
                };
                let rhs = self.parse_expr_prec(precedence)?;
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
        };
        Ok(Expr { kind, pos })
    }

    fn binary_operator(kind: TokenKind) -> Option<BinaryOperator> {
        let op = match kind {
            TokenKind::Plus => BinaryOperator::Add,
            TokenKind::Minus => BinaryOperator::Sub,
            TokenKind::Star => BinaryOperator::Mul,
            TokenKind::Slash => BinaryOperator::Div,
            TokenKind::Percent => BinaryOperator::Mod,
            TokenKind::Eq => BinaryOperator::Eq,
            TokenKind::NotEq => BinaryOperator::NotEq,
            TokenKind::Less => BinaryOperator::Lt,
            TokenKind::Greater => BinaryOperator::Gt,
            TokenKind::LessEq => BinaryOperator::LtEq,
            TokenKind::GreaterEq => BinaryOperator::GtEq,
            TokenKind::And => BinaryOperator::And,
            TokenKind::Or => BinaryOperator::Or,
            _ => return None,
        };
        Some(op)
    }

    fn assign_operator(kind: TokenKind) -> Option<AssignOperator> {
        let op = match kind {
            TokenKind::Assign => AssignOperator::Assign,
            TokenKind::PlusEq => AssignOperator::Add,
            TokenKind::MinusEq => AssignOperator::Sub,
            TokenKind::StarEq => AssignOperator::Mul,
            TokenKind::SlashEq => AssignOperator::Div,
            _ => return None,
        };
        Some(op)
    }

    fn postfix_operator(kind: TokenKind) -> Option<PostfixOperator> {
        match kind {
            TokenKind::PlusPlus => Some(PostfixOperator::Increment),
            TokenKind::MinusMinus => Some(PostfixOperator::Decrement),
            _ => None,
        }
    }
}

/// Binding power of infix operators, lowest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Equals,
    Or,
    And,
    LessGreater,
    Sum,
    Product,
    Mod,
    Prefix,
    Call,
    Index,
}

impl Precedence {
    fn of(kind: TokenKind) -> Option<Precedence> {
        let precedence = match kind {
            TokenKind::Eq | TokenKind::NotEq => Precedence::Equals,
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::Less | TokenKind::Greater | TokenKind::LessEq | TokenKind::GreaterEq => {
                Precedence::LessGreater
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::Sum,
            TokenKind::Star | TokenKind::Slash => Precedence::Product,
            TokenKind::Percent => Precedence::Mod,
            TokenKind::LParen => Precedence::Call,
            TokenKind::LBracket => Precedence::Index,
            _ => return None,
        };
        Some(precedence)
    }
}

impl<'src> Parser<'src> {
    fn new(src: &'src str) -> Parser<'src> {
        let mut lexer = Lexer::new(src);
        let current = Self::pull(&mut lexer);
        let peek = Self::pull(&mut lexer);
        Parser {
            lexer,
            current,
            peek,
            errors: Vec::with_capacity(8),
            structs: HashMap::new(),
            defined_types: HashSet::new(),
            control_depth: 0,
            defer_stack: Vec::new(),
            next_loop_id: 0,
            consumed: 0,
        }
    }

    /// Scans the next non-trivia token.
    fn pull(lexer: &mut Lexer<'_>) -> Token {
        loop {
            let token = lexer.next_token();
            if !token.kind.is_trivia() {
                break token;
            }
        }
    }

    /// Returns the current token and advances.
    fn advance(&mut self) -> Token {
        let next = Self::pull(&mut self.lexer);
        let peek = mem::replace(&mut self.peek, next);
        self.consumed += 1;
        mem::replace(&mut self.current, peek)
    }

    /// Returns the kind of the token after the peeked one, leaving the lexer
    /// untouched.
    fn peek_after(&mut self) -> TokenKind {
        let state = self.lexer.save_state();
        let token = Self::pull(&mut self.lexer);
        self.lexer.restore_state(state);
        token.kind
    }

    /// Checks whether the current token matches the given one.
    fn is(&self, expect: TokenKind) -> bool {
        self.current.kind == expect
    }

    /// Advances if the current token matches the provided one, returning true.
    /// If not, returns false and doesn't advance.
    fn take(&mut self, expect: TokenKind) -> bool {
        if self.is(expect) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Advances if the current token matches the provided one. If not,
    /// records an error.
    fn consume(&mut self, expect: TokenKind) -> Result<Token> {
        if self.is(expect) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expect))
        }
    }

    /// Parses `item (, item)*` until `end` is found. Does **NOT** consume the
    /// end delimiter.
    fn parse_list<T>(
        &mut self,
        end: TokenKind,
        mut parse_item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while !self.is(end) {
            items.push(parse_item(self)?);
            if !self.take(TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    /// Runs `f` inside an `if`/`for` header.
    fn in_control<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.with_control_depth(self.control_depth + 1, f)
    }

    /// Runs `f` with the given control depth, restoring the previous one
    /// however `f` returns.
    fn with_control_depth<T>(&mut self, depth: u32, f: impl FnOnce(&mut Self) -> T) -> T {
        let outer = mem::replace(&mut self.control_depth, depth);
        let result = f(self);
        self.control_depth = outer;
        result
    }

    /// Maps a recoverable failure to `None`.
    fn recover<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        match f(self) {
            Ok(value) => Ok(Some(value)),
            Err(Bail::Recover) => Ok(None),
            Err(Bail::Abort) => Err(Bail::Abort),
        }
    }

    /// Skips to the end of the statement that failed. Always makes progress.
    fn synchronize(&mut self, start: usize) {
        if self.consumed == start {
            self.advance();
        }
        loop {
            match self.current.kind {
                TokenKind::Eof | TokenKind::RBrace => break,
                TokenKind::Semicolon => {
                    self.advance();
                    break;
                }
                kind if kind.starts_statement() => break,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn ident_of(token: Token) -> Ident {
        Ident::new(token.text, token.pos)
    }

    /// Records that `expected` was not found at the current token.
    fn unexpected(&mut self, expected: TokenKind) -> Bail {
        let error = match self.current.kind {
            TokenKind::Eof => Error::UnexpectedEof { expected },
            actual => Error::Unexpected { actual, expected },
        };
        self.error(error)
    }

    /// Records an error at the current token.
    fn error(&mut self, error: Error) -> Bail {
        let pos = if self.current.is_eof() {
            self.lexer.position()
        } else {
            self.current.pos
        };
        self.error_at(pos, error)
    }

    fn error_at(&mut self, pos: Position, error: Error) -> Bail {
        let bail = if error.is_fatal() {
            Bail::Abort
        } else {
            Bail::Recover
        };
        self.errors.push(pos.wrap(error));
        bail
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Unexpected {
        actual: TokenKind,
        expected: TokenKind,
    },
    UnexpectedEof {
        expected: TokenKind,
    },
    UnexpectedOperator {
        actual: TokenKind,
    },
    NoPrefixRule {
        token: TokenKind,
    },
    MalformedSignature {
        actual: TokenKind,
    },
    UndefinedStruct(Box<str>),
    TooManyStructValues(Box<str>),
    UnknownStructField {
        name: Box<str>,
        field: Box<str>,
    },
    DuplicateStructField(Box<str>),
    InvalidAssignmentTarget,
    InvalidCallee,
    InferenceOutsideStatement,
    CannotInferType,
    InvalidNumber,
}

impl Error {
    /// Fatal errors abort the parse of the current file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedEof { .. } | Error::NoPrefixRule { .. } | Error::MalformedSignature { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ast::{Expr, ExprKind, StmtKind},
        parser::{parse_program, Parser},
        util::test_utils::{assert_errors, tree_tests},
    };

    tree_tests!(
        use parser;

        fn test_precedence() {
            let expr = "1 + 2 * 3";
            let tree_ok = "
                binary Add (1:1)
                  int 1 (1:1)
                  binary Mul (1:5)
                    int 2 (1:5)
                    int 3 (1:9)
            ";
        }

        fn test_grouping_has_no_node() {
            let expr = "(1 * 2 + 3) - 4";
            let tree_ok = "
                binary Sub (1:2)
                  binary Add (1:2)
                    binary Mul (1:2)
                      int 1 (1:2)
                      int 2 (1:6)
                    int 3 (1:10)
                  int 4 (1:15)
            ";
        }

        fn test_left_associativity() {
            let expr = "1 - 2 - 3";
            let tree_ok = "
                binary Sub (1:1)
                  binary Sub (1:1)
                    int 1 (1:1)
                    int 2 (1:5)
                  int 3 (1:9)
            ";
        }

        fn test_and_binds_tighter_than_or() {
            let expr = "true || false && true";
            let tree_ok = "
                binary Or (1:1)
                  bool true (1:1)
                  binary And (1:9)
                    bool false (1:9)
                    bool true (1:18)
            ";
        }

        fn test_equality_binds_loosest() {
            let expr = "a == b || c";
            let tree_ok = "
                binary Eq (1:1)
                  ident a (1:1)
                  binary Or (1:6)
                    ident b (1:6)
                    ident c (1:11)
            ";
        }

        fn test_prefix_operators() {
            let expr = "-a * !b";
            let tree_ok = "
                binary Mul (1:1)
                  unary Neg (1:1)
                    ident a (1:2)
                  unary Not (1:6)
                    ident b (1:7)
            ";
        }

        fn test_call() {
            let expr = "add(1, x * 2)";
            let tree_ok = "
                call add (1:1)
                  int 1 (1:5)
                  binary Mul (1:8)
                    ident x (1:8)
                    int 2 (1:12)
            ";
        }

        fn test_index() {
            let expr = "xs[i + 1]";
            let tree_ok = "
                index (1:1)
                  ident xs (1:1)
                  binary Add (1:4)
                    ident i (1:4)
                    int 1 (1:8)
            ";
        }

        fn test_field_access_chain() {
            let expr = "a.b.c";
            let tree_ok = "
                field access c (1:1)
                  field access b (1:1)
                    ident a (1:1)
            ";
        }

        fn test_field_assignment() {
            let expr = "a.b = 5";
            let tree_ok = "
                field assignment b (1:1)
                  ident a (1:1)
                  int 5 (1:7)
            ";
        }

        fn test_postfix() {
            let expr = "i++";
            let tree_ok = "
                postfix Increment (1:1)
                  ident i (1:1)
            ";
        }

        fn test_compound_assignment() {
            let expr = "x += 2 * y";
            let tree_ok = "
                assignment x += (1:1)
                  binary Mul (1:6)
                    int 2 (1:6)
                    ident y (1:10)
            ";
        }

        fn test_list_literal() {
            let expr = r#"[1, 2.5, "s"]"#;
            let tree_ok = r#"
                list (1:1)
                  int 1 (1:2)
                  float 2.5 (1:5)
                  string "s" (1:10)
            "#;
        }

        fn test_function_literal() {
            let expr = "fn(i32 a) i32 { return a }";
            let tree_ok = "
                function literal (1:1)
                  returns i32
                  param a: i32
                  body
                    return (1:17)
                      ident a (1:24)
            ";
        }

        fn test_missing_operand() {
            let expr = "1 +";
            let expected_errors = &["1:4: no prefix parse function for Eof found"];
        }

        fn test_only_identifiers_are_callable() {
            let expr = "f(x)(y)";
            let expected_errors = &["1:1: only named functions can be called"];
        }

        fn test_inference_inside_expression() {
            let expr = "x := 1";
            let expected_errors = &["1:3: ':=' is only allowed at the start of a statement"];
        }

        fn test_let_statement() {
            let program = "let x = 5;";
            let tree_ok = "
                file test.pun
                  let x (1:1)
                    int 5 (1:9)
            ";
        }

        fn test_typed_declaration() {
            let program = "i32 myVar = 5;";
            let tree_ok = "
                file test.pun
                  declare myVar: i32 (1:1)
                    int 5 (1:13)
            ";
        }

        fn test_inferred_declarations() {
            let program = "a := 1\nb := 2.5\nc := \"s\"\nd := true";
            let tree_ok = r#"
                file test.pun
                  declare a: i32 inferred (1:1)
                    int 1 (1:6)
                  declare b: f32 inferred (2:1)
                    float 2.5 (2:6)
                  declare c: str inferred (3:1)
                    string "s" (3:6)
                  declare d: bool inferred (4:1)
                    bool true (4:6)
            "#;
        }

        fn test_cannot_infer_from_expression() {
            let program = "x := y";
            let expected_errors = &["1:6: cannot infer type from initializer"];
        }

        fn test_struct_literal_with_named_fields() {
            let program = "struct message { i32 sender i8 recipient string body }\n\
                           message msg = message{ sender: 5, recipient: 10, body: \"hi\" }";
            let tree_ok = r#"
                file test.pun
                  struct message (1:1)
                    field sender: i32
                    field recipient: i8
                    field body: string
                  declare msg: message (2:1)
                    struct literal message (2:15)
                      field body
                        string "hi" (2:56)
                      field recipient
                        int 10 (2:46)
                      field sender
                        int 5 (2:32)
            "#;
        }

        fn test_struct_literal_with_positional_fields() {
            let program = "struct P { i32 x; i32 y }\nP p = P{1, 2}";
            let tree_ok = "
                file test.pun
                  struct P (1:1)
                    field x: i32
                    field y: i32
                  declare p: P (2:1)
                    struct literal P (2:7)
                      field x
                        int 1 (2:9)
                      field y
                        int 2 (2:12)
            ";
        }

        fn test_struct_literal_with_too_many_values() {
            let program = "struct P { i32 x }\nP p = P{1, 2}";
            let expected_errors = &["2:12: too many values in struct literal 'P'"];
        }

        fn test_undefined_struct_literal() {
            let program = "p := Q{1}";
            let expected_errors = &["1:6: undefined struct 'Q'"];
        }

        fn test_unknown_struct_field() {
            let program = "struct P { i32 x }\nP p = P{z: 1}";
            let expected_errors = &["2:9: struct 'P' has no field 'z'"];
        }

        fn test_duplicate_struct_field() {
            let program = "struct P { i32 x }\nP p = P{x: 1, x: 2}";
            let expected_errors = &["2:18: field 'x' is set more than once"];
        }

        fn test_no_struct_literal_in_control_headers() {
            let program = "struct P { i32 x }\nif a { for b { if c { p = P{1} } } }";
            let tree_ok = "
                file test.pun
                  struct P (1:1)
                    field x: i32
                  if (2:1)
                    ident a (2:4)
                    then
                      while #0 (2:8)
                        ident b (2:12)
                        body
                          if (2:16)
                            ident c (2:19)
                            then
                              assignment p = (2:23)
                                struct literal P (2:27)
                                  field x
                                    int 1 (2:29)
            ";
        }

        fn test_struct_literal_in_header_arguments() {
            let program = "struct P { i32 x }\nif f(P{x: 1}) { return }\nif [P{2}] == a { return }";
            let tree_ok = "
                file test.pun
                  struct P (1:1)
                    field x: i32
                  if (2:1)
                    call f (2:4)
                      struct literal P (2:6)
                        field x
                          int 1 (2:11)
                    then
                      return (2:17)
                  if (3:1)
                    binary Eq (3:4)
                      list (3:4)
                        struct literal P (3:5)
                          field x
                            int 2 (3:7)
                      ident a (3:14)
                    then
                      return (3:18)
            ";
        }

        fn test_exported_function() {
            let program = "pub i8 addTwo(i8 x, i8 y) { return (x + y); }";
            let tree_ok = "
                file test.pun
                  function addTwo exported (1:1)
                    returns i8
                    param x: i8
                    param y: i8
                    body
                      return (1:29)
                        binary Add (1:37)
                          ident x (1:37)
                          ident y (1:41)
            ";
        }

        fn test_multiple_return_values() {
            let program = "pub (i32, bool) pair() {\n  return 1, true\n}";
            let tree_ok = "
                file test.pun
                  function pair exported (1:1)
                    returns i32, bool
                    body
                      return (2:3)
                        int 1 (2:10)
                        bool true (2:13)
            ";
        }

        fn test_parenthesized_return_values() {
            let program = "fn f() {\n  return (1, 2)\n}\nfn g() {\n  return (a + b) * c\n}";
            let tree_ok = "
                file test.pun
                  function f (1:1)
                    body
                      return (2:3)
                        int 1 (2:11)
                        int 2 (2:14)
                  function g (4:1)
                    body
                      return (5:3)
                        binary Mul (5:11)
                          binary Add (5:11)
                            ident a (5:11)
                            ident b (5:15)
                          ident c (5:20)
            ";
        }

        fn test_declaration_lookahead() {
            let program = "i32 add(i32 a) { return a }\ni32 x = add(1)\nadd(2)";
            let tree_ok = "
                file test.pun
                  function add (1:1)
                    returns i32
                    param a: i32
                    body
                      return (1:18)
                        ident a (1:25)
                  declare x: i32 (2:1)
                    call add (2:9)
                      int 1 (2:13)
                  call add (3:1)
                    int 2 (3:5)
            ";
        }

        fn test_if_else_chain() {
            let program = "if a { x = 1 } else if b { x = 2 } else { x = 3 }";
            let tree_ok = "
                file test.pun
                  if (1:1)
                    ident a (1:4)
                    then
                      assignment x = (1:8)
                        int 1 (1:12)
                    else
                      if
                        ident b (1:24)
                        then
                          assignment x = (1:28)
                            int 2 (1:32)
                        else
                          assignment x = (1:43)
                            int 3 (1:47)
            ";
        }

        fn test_three_clause_for() {
            let program = "for i := 0; i < 10; i++ { sum += i }";
            let tree_ok = "
                file test.pun
                  for (1:1)
                    init
                      declare i: i32 inferred (1:5)
                        int 0 (1:10)
                    condition
                      binary Lt (1:13)
                        ident i (1:13)
                        int 10 (1:17)
                    post
                      postfix Increment (1:21)
                        ident i (1:21)
                    body
                      assignment sum += (1:27)
                        ident i (1:34)
            ";
        }

        fn test_while_loops() {
            let program = "for x < 3 { x++ }\nfor { x-- }";
            let tree_ok = "
                file test.pun
                  while #0 (1:1)
                    binary Lt (1:5)
                      ident x (1:5)
                      int 3 (1:9)
                    body
                      postfix Increment (1:13)
                        ident x (1:13)
                  while #1 (2:1)
                    bool true (2:1)
                    body
                      postfix Decrement (2:7)
                        ident x (2:7)
            ";
        }

        fn test_defer() {
            let program = "fn main() {\n  defer close()\n}";
            let tree_ok = "
                file test.pun
                  function main (1:1)
                    body
                      defer (2:3)
                        call close (2:9)
            ";
        }

        fn test_packages_and_imports() {
            let program = "package main\nimport (\n  \"fmt\"\n  \"os\"\n)\nx := 1\npackage other\nimport \"io\"\ny := 2";
            let tree_ok = r#"
                file test.pun
                  package main
                  import "fmt"
                  import "os"
                  declare x: i32 inferred (6:1)
                    int 1 (6:6)
                file test.pun
                  package other
                  import "io"
                  declare y: i32 inferred (9:1)
                    int 2 (9:6)
            "#;
        }

        fn test_comments_are_skipped() {
            let program = "// hi\nlet x = 1 /* c */ + 2";
            let tree_ok = "
                file test.pun
                  let x (2:1)
                    binary Add (2:9)
                      int 1 (2:9)
                      int 2 (2:21)
            ";
        }

        fn test_invalid_assignment_target() {
            let program = "5 = x";
            let expected_errors = &["1:1: left-hand side of assignment must be an identifier"];
        }

        fn test_recovers_at_next_statement() {
            let program = "let = 1\nlet y = 2\nlet = 3";
            let tree_error = "
                file test.pun
                  let y (2:1)
                    int 2 (2:9)
            ";
            let expected_errors = &[
                "1:5: expected next token to be Identifier, got Assign instead",
                "3:5: expected next token to be Identifier, got Assign instead",
            ];
        }

        fn test_recovers_after_broken_block() {
            let program = "struct P { i32 }\nlet y = 1";
            let tree_error = "
                file test.pun
                  let y (2:1)
                    int 1 (2:9)
            ";
            let expected_errors = &["1:16: expected next token to be Identifier, got RBrace instead"];
        }

        fn test_missing_prefix_rule_aborts_file() {
            let program = "let x = ;\nlet y = 1";
            let tree_error = "file test.pun";
            let expected_errors = &["1:9: no prefix parse function for Semicolon found"];
        }

        fn test_abort_resumes_at_next_package() {
            let program = "package a\nlet x = )\npackage b\nlet y = 1";
            let tree_error = "
                file test.pun
                  package a
                file test.pun
                  package b
                  let y (4:1)
                    int 1 (4:9)
            ";
            let expected_errors = &["2:9: no prefix parse function for RParen found"];
        }

        fn test_unexpected_eof_in_block() {
            let program = "fn main() {\n  x = 1\n";
            let tree_error = "file test.pun";
            let expected_errors = &["3:1: unexpected end of input, expected RBrace"];
        }

        fn test_malformed_signature() {
            let program = "pub i32 (x) {}";
            let expected_errors = &["1:9: malformed function signature near LParen"];
        }
    );

    fn deferred_callees(src: &str) -> Vec<String> {
        let (program, errors) = parse_program(src, "test.pun");
        assert_errors(&errors, &[]);
        let StmtKind::Function(function) = &program.files[0].statements[0].kind else {
            panic!("expected a function");
        };
        function
            .deferred
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::Expr(Expr {
                    kind: ExprKind::Call { callee, .. },
                    ..
                }) => callee.name.to_string(),
                other => panic!("unexpected deferred statement {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_deferred_statements_run_in_reverse() {
        let callees = deferred_callees("fn main() {\n  defer first()\n  defer second()\n}");
        assert_eq!(callees, ["second", "first"]);
    }

    #[test]
    fn test_defers_stay_in_their_function() {
        let callees = deferred_callees("fn main() {\n  defer a()\n  let f = fn() { defer b() }\n}");
        assert_eq!(callees, ["a"]);
    }

    #[test]
    fn test_control_depth_restored_after_abort() {
        let mut p = Parser::new("if a == ) { }\nlet x = 1");
        let _ = p.parse_program("test.pun");
        assert_eq!(p.control_depth, 0);
        assert_errors(&p.errors, &["1:9: no prefix parse function for RParen found"]);
    }

    #[test]
    fn test_showcase_parses() {
        let (program, errors) = parse_program(include_str!("../demos/showcase.pun"), "showcase.pun");
        assert_errors(&errors, &[]);
        assert_eq!(program.files.len(), 1);
    }
}
