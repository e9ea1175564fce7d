//! Tokenizer with support for nested string interpolation.
//!
//! Grounded on `original_source/lexer.c`: whitespace/comment skipping in one
//! loop, and the splice bookkeeping in `lexer_string` — a leading segment up
//! to `${` is a prefix, segments between splices are infixes, and the
//! segment up to the closing `"` is a suffix (or the whole thing is a plain
//! `string` token when there are no splices at all). A `}` seen while
//! `string_nesting > 0` resumes string-body lexing instead of closing a
//! block, which is what lets `"a ${ "b ${c} d" } e"` nest.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Semicolon,
    Comma,
    Colon,
    Minus,
    Plus,
    Slash,
    Star,
    StarStar,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Quote,
    Bar,
    Identifier,
    Number,
    String,
    StringPrefix,
    StringInfix,
    StringSuffix,
    Infinity,
    And,
    Or,
    Case,
    Class,
    Default,
    Else,
    For,
    Fun,
    If,
    Let,
    Print,
    Return,
    Super,
    Switch,
    This,
    True,
    False,
    Nil,
    Var,
    While,
    Fallthrough,
    Eof,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub line: u32,
}

pub struct Lexer<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
    line: u32,
    string_nesting: u32,
}

const INFINITY_BYTES: [u8; 3] = [0xe2, 0x88, 0x9e];

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            string_nesting: 0,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let b = self.source[self.current];
        self.current += 1;
        b
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source[self.current]
        }
    }

    fn peek_at(&self, offset: usize) -> u8 {
        let idx = self.current + offset;
        if idx >= self.source.len() {
            0
        } else {
            self.source[idx]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn lexeme(&self) -> &'a str {
        std::str::from_utf8(&self.source[self.start..self.current]).unwrap_or("")
    }

    fn slice(&self, from: usize, to: usize) -> &'a str {
        std::str::from_utf8(&self.source[from..to]).unwrap_or("")
    }

    fn make_token(&self, kind: TokenKind) -> Token<'a> {
        Token {
            kind,
            lexeme: self.lexeme(),
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_at(1) == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn is_digit(b: u8) -> bool {
        b.is_ascii_digit()
    }

    fn is_alpha(b: u8) -> bool {
        b.is_ascii_alphabetic() || b == b'_'
    }

    fn number(&mut self) -> Token<'a> {
        while Self::is_digit(self.peek()) {
            self.advance();
        }
        if self.peek() == b'.' && Self::is_digit(self.peek_at(1)) {
            self.advance();
            while Self::is_digit(self.peek()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier_or_keyword(&mut self) -> Token<'a> {
        while Self::is_alpha(self.peek()) || Self::is_digit(self.peek()) {
            self.advance();
        }
        let text = self.lexeme();
        let kind = match text {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "case" => TokenKind::Case,
            "class" => TokenKind::Class,
            "default" => TokenKind::Default,
            "else" => TokenKind::Else,
            "false" => TokenKind::False,
            "fallthrough" => TokenKind::Fallthrough,
            "for" => TokenKind::For,
            "fun" => TokenKind::Fun,
            "if" => TokenKind::If,
            "let" => TokenKind::Let,
            "nil" => TokenKind::Nil,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            "super" => TokenKind::Super,
            "switch" => TokenKind::Switch,
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            _ => TokenKind::Identifier,
        };
        self.make_token(kind)
    }

    /// Scans one string segment. `open` is true when this is the very start
    /// of a string literal (just past the opening `"`); false when resuming
    /// after an interpolation splice closed (just past the `}`).
    fn string_segment(&mut self, open: bool) -> Token<'a> {
        let content_start = self.current;
        loop {
            if self.is_at_end() {
                return self.error_token("unterminated string");
            }
            match self.peek() {
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'"' => {
                    let content_end = self.current;
                    self.advance();
                    let kind = if open {
                        TokenKind::String
                    } else {
                        TokenKind::StringSuffix
                    };
                    return Token {
                        kind,
                        lexeme: self.slice(content_start, content_end),
                        line: self.line,
                    };
                }
                b'$' if self.peek_at(1) == b'{' => {
                    let content_end = self.current;
                    self.advance();
                    self.advance();
                    self.string_nesting += 1;
                    let kind = if open {
                        TokenKind::StringPrefix
                    } else {
                        TokenKind::StringInfix
                    };
                    return Token {
                        kind,
                        lexeme: self.slice(content_start, content_end),
                        line: self.line,
                    };
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    pub fn next_token(&mut self) -> Token<'a> {
        self.skip_whitespace_and_comments();
        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let b = self.advance();

        if Self::is_alpha(b) {
            return self.identifier_or_keyword();
        }
        if Self::is_digit(b) {
            return self.number();
        }

        match b {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => {
                if self.string_nesting == 0 {
                    self.make_token(TokenKind::RightBrace)
                } else {
                    self.string_nesting -= 1;
                    self.string_segment(false)
                }
            }
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b':' => self.make_token(TokenKind::Colon),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'\'' => self.make_token(TokenKind::Quote),
            b'|' => self.make_token(TokenKind::Bar),
            b'*' => {
                if self.match_byte(b'*') {
                    self.make_token(TokenKind::StarStar)
                } else {
                    self.make_token(TokenKind::Star)
                }
            }
            b'!' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            b'"' => self.string_segment(true),
            0xe2 if self.peek_at(0) == INFINITY_BYTES[1] && self.peek_at(1) == INFINITY_BYTES[2] => {
                self.advance();
                self.advance();
                self.make_token(TokenKind::Infinity)
            }
            _ => self.error_token("unexpected byte"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lexer.next_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn basic_arithmetic_tokens() {
        assert_eq!(
            kinds("1 + 2 * 3;"),
            vec![
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Star,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_and_whitespace_skipped() {
        assert_eq!(
            kinds("// hello\n  1;\n"),
            vec![TokenKind::Number, TokenKind::Semicolon, TokenKind::Eof]
        );
    }

    #[test]
    fn keywords_recognized() {
        assert_eq!(kinds("var x = nil;")[0], TokenKind::Var);
        assert_eq!(kinds("let y;")[0], TokenKind::Let);
        assert_eq!(kinds("fallthrough;")[0], TokenKind::Fallthrough);
    }

    #[test]
    fn plain_string_has_no_splices() {
        let mut lexer = Lexer::new("\"hi\"");
        let t = lexer.next_token();
        assert_eq!(t.kind, TokenKind::String);
        assert_eq!(t.lexeme, "hi");
    }

    #[test]
    fn interpolated_string_splits_into_three_segments() {
        let mut lexer = Lexer::new("\"x is ${x} !\"");
        let prefix = lexer.next_token();
        assert_eq!(prefix.kind, TokenKind::StringPrefix);
        assert_eq!(prefix.lexeme, "x is ");

        let ident = lexer.next_token();
        assert_eq!(ident.kind, TokenKind::Identifier);
        assert_eq!(ident.lexeme, "x");

        let suffix = lexer.next_token();
        assert_eq!(suffix.kind, TokenKind::StringSuffix);
        assert_eq!(suffix.lexeme, " !");
    }

    #[test]
    fn nested_interpolation_reenters_string_on_brace() {
        let mut lexer = Lexer::new("\"a ${ \"b ${c} d\" } e\"");
        assert_eq!(lexer.next_token().kind, TokenKind::StringPrefix); // "a "
        assert_eq!(lexer.next_token().kind, TokenKind::StringPrefix); // "b "
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier); // c
        assert_eq!(lexer.next_token().kind, TokenKind::StringSuffix); // " d"
        assert_eq!(lexer.next_token().kind, TokenKind::StringSuffix); // " e"
    }

    #[test]
    fn unterminated_string_is_error() {
        let mut lexer = Lexer::new("\"oops");
        assert_eq!(lexer.next_token().kind, TokenKind::Error);
    }

    #[test]
    fn infinity_literal() {
        assert_eq!(kinds("∞;")[0], TokenKind::Infinity);
    }
}
