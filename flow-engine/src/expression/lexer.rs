// Expression lexer
// Tokenizes the restricted expression language used inside ${{ }} blocks

use std::fmt;

/// Token types for flow expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    Str(String),

    // Identifiers and keywords
    Ident(String),
    Or,
    And,
    Not,

    // Operators
    Plus,       // +
    Minus,      // -
    Star,       // *
    StarStar,   // **
    Slash,      // /
    SlashSlash, // //
    Percent,    // %
    Pipe,       // |
    Eq,         // ==
    Ne,         // !=
    Lt,         // <
    Le,         // <=
    Gt,         // >
    Ge,         // >=
    Dot,        // .
    Comma,      // ,
    Colon,      // :

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Or => write!(f, "or"),
            Token::And => write!(f, "and"),
            Token::Not => write!(f, "not"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::StarStar => write!(f, "**"),
            Token::Slash => write!(f, "/"),
            Token::SlashSlash => write!(f, "//"),
            Token::Percent => write!(f, "%"),
            Token::Pipe => write!(f, "|"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// A token plus its byte position in the source expression
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub pos: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at position {}: {}", self.pos, self.message)
    }
}

impl std::error::Error for LexError {}

/// Lexer for flow expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Spanned, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                pos: self.position,
            });
        };

        self.position = pos;

        let token = match ch {
            '+' => {
                self.advance();
                Token::Plus
            }
            '-' => {
                self.advance();
                Token::Minus
            }
            '*' => {
                self.advance();
                if self.peek_char() == Some('*') {
                    self.advance();
                    Token::StarStar
                } else {
                    Token::Star
                }
            }
            '/' => {
                self.advance();
                if self.peek_char() == Some('/') {
                    self.advance();
                    Token::SlashSlash
                } else {
                    Token::Slash
                }
            }
            '%' => {
                self.advance();
                Token::Percent
            }
            '|' => {
                self.advance();
                Token::Pipe
            }
            '.' => {
                self.advance();
                Token::Dot
            }
            ',' => {
                self.advance();
                Token::Comma
            }
            ':' => {
                self.advance();
                Token::Colon
            }
            '(' => {
                self.advance();
                Token::LParen
            }
            ')' => {
                self.advance();
                Token::RParen
            }
            '[' => {
                self.advance();
                Token::LBracket
            }
            ']' => {
                self.advance();
                Token::RBracket
            }
            '=' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Token::Eq
                } else {
                    return Err(LexError {
                        message: "expected '==' operator".to_string(),
                        pos,
                    });
                }
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Token::Ne
                } else {
                    return Err(LexError {
                        message: "expected '!=' operator".to_string(),
                        pos,
                    });
                }
            }
            '<' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }

            '\'' | '"' => self.read_string(ch)?,

            '0'..='9' => self.read_number()?,

            'a'..='z' | 'A'..='Z' | '_' => self.read_identifier(),

            _ => {
                return Err(LexError {
                    message: format!("unexpected character: '{}'", ch),
                    pos,
                })
            }
        };

        Ok(Spanned { token, pos })
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // consume opening quote

        let mut value = String::new();

        loop {
            match self.chars.peek() {
                Some(&(_, ch)) if ch == quote => {
                    self.advance();
                    // Doubled quote is an escaped quote
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(&(_, ch)) => {
                    value.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        pos: start,
                    });
                }
            }
        }

        Ok(Token::Str(value))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() {
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        // Decimal part: '.' must be followed by a digit, otherwise it is a
        // member-access dot
        if self.peek_char() == Some('.') {
            let mut peek_iter = self.chars.clone();
            peek_iter.next();
            if let Some(&(_, next_ch)) = peek_iter.peek() {
                if next_ch.is_ascii_digit() {
                    num_str.push('.');
                    self.advance();

                    while let Some(&(_, ch)) = self.chars.peek() {
                        if ch.is_ascii_digit() {
                            num_str.push(ch);
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number: {}", num_str),
                pos: start,
            })
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            "or" => Token::Or,
            "and" => Token::And,
            "not" => Token::Not,
            _ => Token::Ident(ident),
        }
    }
}

/// A segment of a string containing embedded `${{ }}` expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Expression text between `${{` and `}}`
    Expr(String),
    /// Plain text
    Text(String),
}

/// Split a string into text and `${{ }}` expression segments
pub fn extract_expressions(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = 0;
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();

    while current < len {
        if current + 3 < len
            && chars[current] == '$'
            && chars[current + 1] == '{'
            && chars[current + 2] == '{'
        {
            if let Some(end) = find_closing(&chars, current + 3) {
                let expr = chars[current + 3..end]
                    .iter()
                    .collect::<String>()
                    .trim()
                    .to_string();
                segments.push(Segment::Expr(expr));
                current = end + 2;
                continue;
            }
        }

        // Plain text until the next candidate opener
        let text_start = current;
        while current < len {
            if current + 1 < len && chars[current] == '$' && chars[current + 1] == '{' {
                break;
            }
            current += 1;
        }

        if current > text_start {
            segments.push(Segment::Text(chars[text_start..current].iter().collect()));
        } else {
            // Lone '$' that never opens an expression
            segments.push(Segment::Text(chars[current].to_string()));
            current += 1;
        }
    }

    segments
}

/// True when the string contains at least one `${{ }}` expression
pub fn has_expressions(input: &str) -> bool {
    extract_expressions(input)
        .iter()
        .any(|seg| matches!(seg, Segment::Expr(_)))
}

fn find_closing(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1;
    let mut i = start;

    while i + 1 < chars.len() {
        if chars[i] == '}' && chars[i + 1] == '}' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
            i += 2;
        } else if chars[i] == '$' && i + 2 < chars.len() && chars[i + 1] == '{' && chars[i + 2] == '{'
        {
            depth += 1;
            i += 3;
        } else {
            i += 1;
        }
    }

    None
}
