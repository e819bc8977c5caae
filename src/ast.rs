// program   ::= file+
// file      ::= ['package' ID] [import] stmt*
// import    ::= 'import' STRING | 'import' '(' STRING* ')'
// stmt      ::= ['pub'] (TYPE | '(' TYPE (',' TYPE)* ')' | 'fn') ID '(' params ')' block
//             | TYPE ID '=' expr
//             | ID ':=' expr
//             | '[' ']' TYPE ID '=' expr
//             | ('let' | 'const') ID '=' expr
//             | 'struct' ID '{' (TYPE ID)* '}'
//             | 'defer' stmt
//             | 'return' [expr (',' expr)*]
//             | 'if' expr block ['else' ('if' ... | block)]
//             | 'for' stmt ';' expr ';' [stmt] block
//             | 'for' [expr] block
//             | block
//             | expr
// block     ::= '{' (stmt [';'])* '}'
// params    ::= [TYPE ID (',' TYPE ID)*]
// expr      ::= ID [('=' | '+=' | '-=' | '*=' | '/=') expr]
//             | ID ('.' ID)+ ['=' expr]
//             | ID '(' [expr (',' expr)*] ')'
//             | ID '{' [[ID ':'] expr (',' [ID ':'] expr)*] '}'
//             | expr BINOP expr
//             | ('!' | '-') expr
//             | expr ('++' | '--')
//             | expr '[' expr ']'
//             | '[' [expr (',' expr)*] ']'
//             | 'fn' '(' params ')' [TYPE | '(' TYPE (',' TYPE)* ')'] block
//             | '(' expr ')'
//             | INT | FLOAT | STRING | 'true' | 'false'

// Precedence, lowest first
//
// == !=
// ||
// &&
// < > <= >=
// + -
// * /
// %
// ! - (prefix)
// ( (call)
// [ (index)

use std::collections::BTreeMap;

use crate::token::{Position, Primitive};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub files: Vec<File>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub filename: Box<str>,
    pub package: Option<Ident>,
    pub imports: Vec<Box<str>>,
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    /// `let x = ...` or `const x = ...`.
    Let {
        constant: bool,
        name: Ident,
        value: Expr,
    },
    VarDecl(VarDecl),
    List(ListDecl),
    /// Zero or more returned values.
    Return(Vec<Expr>),
    Function(Function),
    If(If),
    For(For),
    Block(Block),
    Struct(StructDef),
    Defer(Box<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub ty: TypeName,
    pub name: Ident,
    pub value: Expr,
    /// Declared with `:=`, the type being derived from the initializer.
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListDecl {
    pub elem_ty: TypeName,
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub exported: bool,
    pub name: Ident,
    pub return_types: Vec<TypeName>,
    pub params: Vec<Param>,
    pub body: Block,
    /// Statements registered through `defer`, in execution order.
    pub deferred: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: TypeName,
    pub name: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub condition: Expr,
    pub consequence: Block,
    pub alternative: Option<Box<Alternative>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alternative {
    Else(Block),
    ElseIf(If),
}

#[derive(Debug, Clone, PartialEq)]
pub struct For {
    pub init: Box<Stmt>,
    pub condition: Expr,
    pub post: Option<Box<Stmt>>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: Ident,
    /// In declaration order.
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub ty: TypeName,
    pub name: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Id(Ident),
    Int(i64),
    Float(f64),
    String(Box<str>),
    Bool(bool),
    Binary {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    Postfix {
        op: PostfixOperator,
        expr: Box<Expr>,
    },
    Assign {
        target: Ident,
        op: AssignOperator,
        value: Box<Expr>,
    },
    Call {
        callee: Ident,
        args: Vec<Expr>,
    },
    Index {
        collection: Box<Expr>,
        index: Box<Expr>,
    },
    List(Vec<Expr>),
    StructLit(StructLiteral),
    /// `receiver.field`. For `a.b.c` the receiver of `c` is `a.b`.
    FieldAccess {
        receiver: Box<Expr>,
        field: Ident,
    },
    FieldAssign {
        receiver: Box<Expr>,
        field: Ident,
        value: Box<Expr>,
    },
    While(While),
    Function(FunctionLiteral),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructLiteral {
    pub name: Ident,
    pub fields: BTreeMap<Box<str>, Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct While {
    pub condition: Box<Expr>,
    pub body: Block,
    /// Unique per parse, used to label the lowered loop.
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionLiteral {
    pub params: Vec<Param>,
    pub return_types: Vec<TypeName>,
    pub body: Block,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Eq => "==",
            BinaryOperator::NotEq => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Gt => ">",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "&&",
            BinaryOperator::Or => "||",
        }
    }

    /// Comparison and logical operators always produce a boolean.
    pub fn is_boolean(self) -> bool {
        !matches!(
            self,
            BinaryOperator::Add
                | BinaryOperator::Sub
                | BinaryOperator::Mul
                | BinaryOperator::Div
                | BinaryOperator::Mod
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
}

impl UnaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::Not => "!",
            UnaryOperator::Neg => "-",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PostfixOperator {
    Increment,
    Decrement,
}

impl PostfixOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            PostfixOperator::Increment => "++",
            PostfixOperator::Decrement => "--",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssignOperator {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOperator::Assign => "=",
            AssignOperator::Add => "+=",
            AssignOperator::Sub => "-=",
            AssignOperator::Mul => "*=",
            AssignOperator::Div => "/=",
        }
    }

    /// The arithmetic performed before storing, if any.
    pub fn binary(self) -> Option<BinaryOperator> {
        match self {
            AssignOperator::Assign => None,
            AssignOperator::Add => Some(BinaryOperator::Add),
            AssignOperator::Sub => Some(BinaryOperator::Sub),
            AssignOperator::Mul => Some(BinaryOperator::Mul),
            AssignOperator::Div => Some(BinaryOperator::Div),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: Box<str>,
    pub pos: Position,
}

impl Ident {
    pub fn new(name: impl Into<Box<str>>, pos: Position) -> Ident {
        Ident {
            name: name.into(),
            pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName(pub Ident);

impl TypeName {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn pos(&self) -> Position {
        self.0.pos
    }

    pub fn primitive(&self) -> Option<Primitive> {
        Primitive::from_name(self.name())
    }
}
