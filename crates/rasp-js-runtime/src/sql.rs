//! SQL lexer backing the `tokenize` native function.
//!
//! MySQL-flavoured. Whitespace is dropped, comments are kept as tokens
//! (detection logic frequently cares about them), and there is no trailing
//! end-of-input token. Lexical errors never abort: they are collected next to
//! the tokens and the scanner carries on.

/// Token category. Only `text` crosses into scripts today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    QuotedIdentifier,
    String,
    Number,
    Variable,
    Placeholder,
    Comment,
    Operator,
    Punctuation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    /// Byte offset of the offending input.
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Tokenized {
    pub tokens: Vec<Token>,
    pub errors: Vec<LexError>,
}

impl Tokenized {
    pub fn texts(self) -> Vec<String> {
        self.tokens.into_iter().map(|t| t.text).collect()
    }
}

/// Longest first.
const OPERATORS: &[&str] = &[
    "<=>", "->>", "<=", ">=", "<>", "!=", "||", "&&", ":=", "<<", ">>", "->", "=", "<", ">",
    "!", "|", "&", "^", "~", "+", "-", "*", "/", "%",
];

const PUNCTUATION: &[char] = &['(', ')', ',', ';', '.', '{', '}', '[', ']', ':'];

pub fn tokenize(sql: &str) -> Tokenized {
    Lexer::new(sql).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    out: Tokenized,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            out: Tokenized::default(),
        }
    }

    fn run(mut self) -> Tokenized {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                c if c.is_whitespace() => {
                    self.bump();
                }
                '#' => self.line_comment(start),
                '-' if self.rest().starts_with("--") && self.at(2).is_none_or(|c| c.is_whitespace()) => {
                    self.line_comment(start)
                }
                '/' if self.rest().starts_with("/*") => self.block_comment(start),
                '\'' | '"' => self.string(start, c),
                '`' => self.quoted_identifier(start),
                'x' | 'X' | 'b' | 'B' if self.at(1) == Some('\'') => {
                    self.bump();
                    self.string(start, '\'');
                }
                '0'..='9' => self.number(start),
                '.' if self.at(1).is_some_and(|c| c.is_ascii_digit()) => self.number(start),
                '@' => self.variable(start),
                '?' => {
                    self.bump();
                    self.push(TokenKind::Placeholder, start);
                }
                c if is_word_start(c) => self.word(start),
                _ => {
                    if let Some(op) = OPERATORS.iter().find(|op| self.rest().starts_with(**op)) {
                        self.pos += op.len();
                        self.push(TokenKind::Operator, start);
                    } else if PUNCTUATION.contains(&c) {
                        self.bump();
                        self.push(TokenKind::Punctuation, start);
                    } else {
                        self.bump();
                        self.error(start, format!("unexpected character {:?}", c));
                    }
                }
            }
        }
        self.out
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.out.tokens.push(Token {
            kind,
            text: self.src[start..self.pos].to_string(),
        });
    }

    fn error(&mut self, offset: usize, message: String) {
        self.out.errors.push(LexError { offset, message });
    }

    fn line_comment(&mut self, start: usize) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
        self.push(TokenKind::Comment, start);
    }

    fn block_comment(&mut self, start: usize) {
        self.pos += 2;
        match self.rest().find("*/") {
            Some(end) => self.pos += end + 2,
            None => {
                self.pos = self.src.len();
                self.error(start, "unterminated block comment".to_string());
            }
        }
        self.push(TokenKind::Comment, start);
    }

    fn string(&mut self, start: usize, quote: char) {
        self.scan_quoted(start, quote);
        self.push(TokenKind::String, start);
    }

    fn scan_quoted(&mut self, start: usize, quote: char) {
        self.bump();
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some(c) if c == quote => {
                    // A doubled quote is an escaped quote.
                    if self.peek() == Some(quote) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    self.error(start, "unterminated string literal".to_string());
                    break;
                }
            }
        }
    }

    fn quoted_identifier(&mut self, start: usize) {
        self.scan_backticks(start);
        self.push(TokenKind::QuotedIdentifier, start);
    }

    fn scan_backticks(&mut self, start: usize) {
        self.bump();
        loop {
            match self.bump() {
                Some('`') if self.peek() == Some('`') => {
                    self.bump();
                }
                Some('`') => break,
                Some(_) => {}
                None => {
                    self.error(start, "unterminated quoted identifier".to_string());
                    break;
                }
            }
        }
    }

    fn number(&mut self, start: usize) {
        let rest = self.rest();
        if rest.len() > 2 && (rest.starts_with("0x") || rest.starts_with("0X")) {
            self.pos += 2;
            self.eat_while(|c| c.is_ascii_hexdigit());
        } else if rest.len() > 2
            && (rest.starts_with("0b") || rest.starts_with("0B"))
            && rest[2..].starts_with(['0', '1'])
        {
            self.pos += 2;
            self.eat_while(|c| c == '0' || c == '1');
        } else {
            self.eat_while(|c| c.is_ascii_digit());
            if self.peek() == Some('.') {
                self.bump();
                self.eat_while(|c| c.is_ascii_digit());
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                let signed = matches!(self.at(1), Some('+' | '-'));
                let digit_at = if signed { 2 } else { 1 };
                if self.at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += digit_at;
                    self.eat_while(|c| c.is_ascii_digit());
                }
            }
        }
        // `1abc` is an identifier in MySQL.
        if self.peek().is_some_and(is_word_part) {
            self.eat_while(is_word_part);
            self.push(TokenKind::Word, start);
        } else {
            self.push(TokenKind::Number, start);
        }
    }

    fn variable(&mut self, start: usize) {
        self.bump();
        if self.peek() == Some('@') {
            self.bump();
        }
        // `@'quoted name'` stays one token.
        match self.peek() {
            Some(quote @ ('\'' | '"')) => self.scan_quoted(self.pos, quote),
            Some('`') => self.scan_backticks(self.pos),
            _ => self.eat_while(|c| is_word_part(c) || c == '.'),
        }
        self.push(TokenKind::Variable, start);
    }

    fn word(&mut self, start: usize) {
        self.eat_while(is_word_part);
        self.push(TokenKind::Word, start);
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_word_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
