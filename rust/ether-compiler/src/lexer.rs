//! Hand-written lexer for the surface syntax.

use ether_core::number::Number;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {line}:{col}")]
    UnexpectedChar { ch: char, line: u32, col: u32 },
    #[error("unterminated string starting at line {line}:{col}")]
    UnterminatedString { line: u32, col: u32 },
    #[error("invalid escape '\\{ch}' at line {line}:{col}")]
    InvalidEscape { ch: char, line: u32, col: u32 },
    #[error("malformed number at line {line}:{col}")]
    BadNumber { line: u32, col: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Num(Number),
    Str(String),
    /// Quoted symbol, e.g. `` `foo ``.
    Quote(String),
    Ident(String),

    // keywords
    Let,
    Rec,
    And,
    In,
    Fn,
    If,
    Then,
    Else,
    Match,
    With,
    Try,
    Assert,
    True,
    False,
    Nil,
    Not,
    Lnot,
    Mod,
    LandKw,
    LorKw,
    LxorKw,
    Lsl,
    Lsr,
    Asl,
    Asr,
    IsKw,
    Pub,
    Mut,
    As,
    DefinedQ,
    Return,
    Import,

    // punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Dot,
    Arrow,     // ->
    Bar,       // |
    Pipe,      // |>
    OrOr,      // ||
    AndAnd,    // &&
    Plus,
    Minus,
    Star,
    Slash,
    Caret,     // ^
    PlusPlus,  // ++
    ColonColon,
    Assign,    // :=
    Lt,
    Le,
    Gt,
    Ge,
    EqSym,     // =
    Ne,        // <>
    EqEq,      // ==
    BangEq,    // !=
    Dollar,    // $( ... ) compile-time evaluation
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub col: u32,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'\'' || c == b'?'
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0, line: 1, col: 1 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self) -> Result<Tok, LexError> {
        let (line, col) = (self.line, self.col);
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let save = self.pos;
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
            } else {
                self.pos = save;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii digits");
        if is_float {
            text.parse::<f64>()
                .map(|x| Tok::Num(Number::Flt(x)))
                .map_err(|_| LexError::BadNumber { line, col })
        } else {
            text.parse::<i64>()
                .map(|n| Tok::Num(Number::Int(n)))
                .map_err(|_| LexError::BadNumber { line, col })
        }
    }

    fn lex_string(&mut self) -> Result<Tok, LexError> {
        let (line, col) = (self.line, self.col);
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(LexError::UnterminatedString { line, col }),
                Some(b'"') => return Ok(Tok::Str(out)),
                Some(b'\\') => {
                    let esc = self.bump().ok_or(LexError::UnterminatedString { line, col })?;
                    match esc {
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'r' => out.push('\r'),
                        b'0' => out.push('\0'),
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        other => {
                            return Err(LexError::InvalidEscape {
                                ch: other as char,
                                line: self.line,
                                col: self.col,
                            })
                        }
                    }
                }
                Some(c) => out.push(c as char),
            }
        }
    }

    fn lex_word(&mut self) -> Tok {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        let word = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii word");
        match word {
            "let" => Tok::Let,
            "rec" => Tok::Rec,
            "and" => Tok::And,
            "in" => Tok::In,
            "fn" | "fun" => Tok::Fn,
            "if" => Tok::If,
            "then" => Tok::Then,
            "else" => Tok::Else,
            "match" => Tok::Match,
            "with" => Tok::With,
            "try" => Tok::Try,
            "assert" => Tok::Assert,
            "true" => Tok::True,
            "false" => Tok::False,
            "nil" => Tok::Nil,
            "not" => Tok::Not,
            "lnot" => Tok::Lnot,
            "mod" => Tok::Mod,
            "land" => Tok::LandKw,
            "lor" => Tok::LorKw,
            "lxor" => Tok::LxorKw,
            "lsl" => Tok::Lsl,
            "lsr" => Tok::Lsr,
            "asl" => Tok::Asl,
            "asr" => Tok::Asr,
            "is" => Tok::IsKw,
            "pub" => Tok::Pub,
            "mut" => Tok::Mut,
            "as" => Tok::As,
            "defined?" => Tok::DefinedQ,
            "return" => Tok::Return,
            "import" => Tok::Import,
            _ => Tok::Ident(word.to_string()),
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let (line, col) = (self.line, self.col);
        let tok = match self.peek() {
            None => Tok::Eof,
            Some(c) if c.is_ascii_digit() => self.lex_number()?,
            Some(b'"') => self.lex_string()?,
            Some(b'`') => {
                self.bump();
                let start = self.pos;
                while self.peek().is_some_and(is_ident_char) {
                    self.bump();
                }
                let name =
                    std::str::from_utf8(&self.src[start..self.pos]).expect("ascii word");
                Tok::Quote(name.to_string())
            }
            Some(c) if is_ident_start(c) => self.lex_word(),
            Some(c) => {
                self.bump();
                match (c, self.peek()) {
                    (b'(', _) => Tok::LParen,
                    (b')', _) => Tok::RParen,
                    (b'[', _) => Tok::LBracket,
                    (b']', _) => Tok::RBracket,
                    (b'{', _) => Tok::LBrace,
                    (b'}', _) => Tok::RBrace,
                    (b',', _) => Tok::Comma,
                    (b';', _) => Tok::Semi,
                    (b'.', _) => Tok::Dot,
                    (b'$', Some(b'(')) => Tok::Dollar,
                    (b'-', Some(b'>')) => {
                        self.bump();
                        Tok::Arrow
                    }
                    (b'-', _) => Tok::Minus,
                    (b'|', Some(b'>')) => {
                        self.bump();
                        Tok::Pipe
                    }
                    (b'|', Some(b'|')) => {
                        self.bump();
                        Tok::OrOr
                    }
                    (b'|', _) => Tok::Bar,
                    (b'&', Some(b'&')) => {
                        self.bump();
                        Tok::AndAnd
                    }
                    (b'+', Some(b'+')) => {
                        self.bump();
                        Tok::PlusPlus
                    }
                    (b'+', _) => Tok::Plus,
                    (b'*', _) => Tok::Star,
                    (b'/', _) => Tok::Slash,
                    (b'^', _) => Tok::Caret,
                    (b':', Some(b':')) => {
                        self.bump();
                        Tok::ColonColon
                    }
                    (b':', Some(b'=')) => {
                        self.bump();
                        Tok::Assign
                    }
                    (b'<', Some(b'=')) => {
                        self.bump();
                        Tok::Le
                    }
                    (b'<', Some(b'>')) => {
                        self.bump();
                        Tok::Ne
                    }
                    (b'<', _) => Tok::Lt,
                    (b'>', Some(b'=')) => {
                        self.bump();
                        Tok::Ge
                    }
                    (b'>', _) => Tok::Gt,
                    (b'=', Some(b'=')) => {
                        self.bump();
                        Tok::EqEq
                    }
                    (b'=', _) => Tok::EqSym,
                    (b'!', Some(b'=')) => {
                        self.bump();
                        Tok::BangEq
                    }
                    (b'_', _) => Tok::Ident("_".to_string()),
                    _ => {
                        return Err(LexError::UnexpectedChar { ch: c as char, line, col })
                    }
                }
            }
        };
        Ok(Token { tok, line, col })
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.tok == Tok::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("1 2.5 1e3"),
            vec![
                Tok::Num(Number::Int(1)),
                Tok::Num(Number::Flt(2.5)),
                Tok::Num(Number::Flt(1e3)),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            toks("|> :: := <> == != ->"),
            vec![
                Tok::Pipe,
                Tok::ColonColon,
                Tok::Assign,
                Tok::Ne,
                Tok::EqEq,
                Tok::BangEq,
                Tok::Arrow,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            toks("let rec f' pair? in"),
            vec![
                Tok::Let,
                Tok::Rec,
                Tok::Ident("f'".into()),
                Tok::Ident("pair?".into()),
                Tok::In,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_quoted_symbol() {
        assert_eq!(toks("`foo"), vec![Tok::Quote("foo".into()), Tok::Eof]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(toks(r#""a\nb""#), vec![Tok::Str("a\nb".into()), Tok::Eof]);
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            toks("1 # comment\n2"),
            vec![Tok::Num(Number::Int(1)), Tok::Num(Number::Int(2)), Tok::Eof]
        );
    }

    #[test]
    fn test_number_dot_is_not_float() {
        // `1.foo` must lex as number, dot, ident
        assert_eq!(
            toks("1.x"),
            vec![Tok::Num(Number::Int(1)), Tok::Dot, Tok::Ident("x".into()), Tok::Eof]
        );
    }
}
