use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// The literal text of the token. For strings, the raw contents between
    /// the quotes.
    pub text: Box<str>,
    pub pos: Position,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<Box<str>>, pos: Position) -> Token {
        Token {
            kind,
            text: text.into(),
            pos,
        }
    }

    pub fn eof() -> Token {
        Token::new(TokenKind::Eof, "", Position::EOF)
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:?}, {:?}, {})", self.kind, self.text, self.pos)
    }
}

/// A location in the source. Lines and columns start at 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub line: i32,
    pub column: i32,
    pub offset: i32,
}

impl Position {
    /// Position of the end-of-stream token.
    pub const EOF: Position = Position {
        line: -1,
        column: -1,
        offset: -1,
    };

    pub fn new(line: i32, column: i32, offset: i32) -> Position {
        Position {
            line,
            column,
            offset,
        }
    }

    pub fn wrap<T>(self, inner: T) -> Positioned<T> {
        Positioned { pos: self, inner }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Positioned<T> {
    pub pos: Position,
    pub inner: T,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Function,
    Let,
    Const,
    Return,
    If,
    Else,
    For,
    Struct,
    Package,
    Import,
    Pub,
    Defer,
    Interface,
    Enum,
    Test,

    True,
    False,

    /// `=`
    Assign,
    /// `:=`
    Infer,
    Plus,
    /// `+=`
    PlusEq,
    /// `++`
    PlusPlus,
    Minus,
    /// `-=`
    MinusEq,
    /// `--`
    MinusMinus,
    Star,
    /// `*=`
    StarEq,
    Slash,
    /// `/=`
    SlashEq,
    Percent,
    Bang,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    /// `&&`
    And,
    /// `||`
    Or,

    Comma,
    Colon,
    Semicolon,
    Dot,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    /// `// ...` up to the end of the line.
    LineComment,
    /// `/* ... */`, possibly unterminated.
    BlockComment,
    /// A `*/` outside of any block comment.
    StarSlash,

    Identifier,
    Int,
    Float,
    String,
    Primitive(Primitive),

    Illegal,
    Eof,
}

impl TokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(self, TokenKind::LineComment | TokenKind::BlockComment)
    }

    /// Whether a statement may begin with this token. Used as a
    /// synchronization point after a recoverable parse error.
    pub fn starts_statement(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Function | Let | Const | Return | If | For | Struct | Pub | Defer | Package
        )
    }
}

/// The built-in scalar types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::I64 => "i64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
            Primitive::Bool => "bool",
            Primitive::Str => "str",
        }
    }

    pub fn from_name(name: &str) -> Option<Primitive> {
        match KEYWORDS.get(name) {
            Some(TokenKind::Primitive(primitive)) => Some(*primitive),
            _ => None,
        }
    }
}

pub static KEYWORDS: phf::Map<&'static str, TokenKind> = phf::phf_map! {
    "fn" => TokenKind::Function,
    "let" => TokenKind::Let,
    "const" => TokenKind::Const,
    "return" => TokenKind::Return,
    "if" => TokenKind::If,
    "else" => TokenKind::Else,
    "for" => TokenKind::For,
    "struct" => TokenKind::Struct,
    "package" => TokenKind::Package,
    "pkg" => TokenKind::Package,
    "import" => TokenKind::Import,
    "pub" => TokenKind::Pub,
    "defer" => TokenKind::Defer,
    "interface" => TokenKind::Interface,
    "enum" => TokenKind::Enum,
    "test" => TokenKind::Test,
    "true" => TokenKind::True,
    "false" => TokenKind::False,
    "u8" => TokenKind::Primitive(Primitive::U8),
    "u16" => TokenKind::Primitive(Primitive::U16),
    "u32" => TokenKind::Primitive(Primitive::U32),
    "u64" => TokenKind::Primitive(Primitive::U64),
    "i8" => TokenKind::Primitive(Primitive::I8),
    "i16" => TokenKind::Primitive(Primitive::I16),
    "i32" => TokenKind::Primitive(Primitive::I32),
    "i64" => TokenKind::Primitive(Primitive::I64),
    "f32" => TokenKind::Primitive(Primitive::F32),
    "f64" => TokenKind::Primitive(Primitive::F64),
    "bool" => TokenKind::Primitive(Primitive::Bool),
    "str" => TokenKind::Primitive(Primitive::Str),
};
