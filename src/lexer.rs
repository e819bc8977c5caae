use crate::token::{Position, Token, TokenKind, KEYWORDS};

/// Lexes the whole input. The returned buffer always ends with a single
/// [`TokenKind::Eof`] token.
pub fn lex(src: &str) -> Vec<Token> {
    Lexer::new(src).run()
}

/// A saved scanning position. Restoring one rewinds the lexer to exactly the
/// state it had when the snapshot was taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    offset: usize,
    line: u32,
    column: u32,
}

impl Cursor {
    const START: Cursor = Cursor {
        offset: 0,
        line: 1,
        column: 1,
    };

    fn position(self) -> Position {
        let clamp = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        Position::new(
            clamp(self.line as usize),
            clamp(self.column as usize),
            clamp(self.offset),
        )
    }
}

/// The punch lexer. Tokens are produced on demand by [`Lexer::next_token`].
pub struct Lexer<'src> {
    src: &'src str,
    cursor: Cursor,
    /// Start of the token being scanned.
    mark: Cursor,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Lexer<'src> {
        Lexer {
            src,
            cursor: Cursor::START,
            mark: Cursor::START,
        }
    }

    /// Scans the next token. Once the input is exhausted, every call returns
    /// an EOF token.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let kind = self.scan_token_kind();
        match kind {
            TokenKind::Eof => Token::eof(),
            TokenKind::String => {
                // Strip the quotes.
                let raw = self.substr();
                Token::new(kind, &raw[1..raw.len() - 1], self.mark.position())
            }
            _ => Token::new(kind, self.substr(), self.mark.position()),
        }
    }

    /// Scans the source until the input is exhausted.
    pub fn run(mut self) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(self.src.len() / 4 + 1);
        loop {
            let token = self.next_token();
            let is_eof = token.is_eof();
            tokens.push(token);
            if is_eof {
                break tokens;
            }
        }
    }

    pub fn save_state(&self) -> Cursor {
        self.cursor
    }

    pub fn restore_state(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    /// The position the next token would be scanned from.
    pub fn position(&self) -> Position {
        self.cursor.position()
    }

    /// Tries to scan the current character.
    fn scan_token_kind(&mut self) -> TokenKind {
        use TokenKind::*;
        if self.at_end() {
            return Eof;
        }
        match self.mark_advance() {
            '=' => match self.peek() {
                '=' => self.advance_with(Eq),
                _ => Assign,
            },
            ':' => match self.peek() {
                '=' => self.advance_with(Infer),
                _ => Colon,
            },
            '!' => match self.peek() {
                '=' => self.advance_with(NotEq),
                _ => Bang,
            },
            '<' => match self.peek() {
                '=' => self.advance_with(LessEq),
                _ => Less,
            },
            '>' => match self.peek() {
                '=' => self.advance_with(GreaterEq),
                _ => Greater,
            },
            '&' => match self.peek() {
                '&' => self.advance_with(And),
                _ => Illegal,
            },
            '|' => match self.peek() {
                '|' => self.advance_with(Or),
                _ => Illegal,
            },
            '+' => match self.peek() {
                '=' => self.advance_with(PlusEq),
                '+' => self.advance_with(PlusPlus),
                _ => Plus,
            },
            '-' => match self.peek() {
                '=' => self.advance_with(MinusEq),
                '-' => self.advance_with(MinusMinus),
                _ => Minus,
            },
            '*' => match self.peek() {
                '=' => self.advance_with(StarEq),
                '/' => self.advance_with(StarSlash),
                _ => Star,
            },
            '/' => match self.peek() {
                '=' => self.advance_with(SlashEq),
                '/' => self.line_comment(),
                '*' => self.block_comment(),
                _ => Slash,
            },
            '%' => Percent,
            ',' => Comma,
            ';' => Semicolon,
            '.' => Dot,
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            '"' => self.string(),
            c if c.is_alphabetic() || c == '_' => self.identifier_or_keyword(),
            c if c.is_ascii_digit() => self.number(),
            _ => Illegal,
        }
    }

    /// Scans up to the closing quote. Escapes are kept as written, but an
    /// escaped quote doesn't close the string.
    fn string(&mut self) -> TokenKind {
        let mut is_escaping = false;
        loop {
            if self.at_end() {
                return TokenKind::Illegal;
            }
            match (is_escaping, self.advance()) {
                (false, '"') => return TokenKind::String,
                (false, '\\') => is_escaping = true,
                (_, _) => is_escaping = false,
            }
        }
    }

    fn identifier_or_keyword(&mut self) -> TokenKind {
        while matches!(self.peek(), c if c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        KEYWORDS
            .get(self.substr())
            .copied()
            .unwrap_or(TokenKind::Identifier)
    }

    fn number(&mut self) -> TokenKind {
        self.digits();
        if self.peek() == '.' && self.peek_second().is_ascii_digit() {
            self.advance();
            self.digits();
            TokenKind::Float
        } else {
            TokenKind::Int
        }
    }

    fn digits(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
    }

    fn line_comment(&mut self) -> TokenKind {
        while !self.at_end() && self.peek() != '\n' {
            self.advance();
        }
        TokenKind::LineComment
    }

    /// An unterminated block comment silently runs to the end of the input.
    fn block_comment(&mut self) -> TokenKind {
        self.advance(); // `*`
        while !self.at_end() {
            if self.advance() == '*' && self.peek() == '/' {
                self.advance();
                break;
            }
        }
        TokenKind::BlockComment
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_whitespace() {
            self.advance();
        }
    }
}

impl<'src> Lexer<'src> {
    /// Starts a new token "mark" and advances.
    fn mark_advance(&mut self) -> char {
        self.mark = self.cursor;
        self.advance()
    }

    /// Returns the next char and advances, keeping track of lines and columns.
    fn advance(&mut self) -> char {
        let Some(c) = self.rest().chars().next() else {
            return '\0';
        };
        self.cursor.offset += c.len_utf8();
        if c == '\n' {
            self.cursor.line += 1;
            self.cursor.column = 1;
        } else {
            self.cursor.column += 1;
        }
        c
    }

    /// Advances and returns the provided value.
    fn advance_with<T>(&mut self, value: T) -> T {
        self.advance();
        value
    }

    /// Returns the next char without advancing.
    fn peek(&self) -> char {
        self.rest().chars().next().unwrap_or('\0')
    }

    fn peek_second(&self) -> char {
        self.rest().chars().nth(1).unwrap_or('\0')
    }

    fn at_end(&self) -> bool {
        self.cursor.offset >= self.src.len()
    }

    fn rest(&self) -> &'src str {
        &self.src[self.cursor.offset..]
    }

    /// Returns the substring of the current marked bounds.
    fn substr(&self) -> &'src str {
        &self.src[self.mark.offset..self.cursor.offset]
    }
}
