// Expression parser
// Recursive-descent parser producing the expression AST

use std::fmt;

use super::lexer::{Spanned, Token};
use crate::value::Value;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier looked up in the surrounding scope
    Var { name: String, pos: usize },
    /// `base.member`
    Member {
        base: Box<Expr>,
        member: String,
        pos: usize,
    },
    /// `base[index]`
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        pos: usize,
    },
    /// `base[start:end]` with either bound optional
    Slice {
        base: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        pos: usize,
    },
    /// Filter function call: `f(args)` or `x | f(args)` (piped value prepended)
    Call {
        name: String,
        args: Vec<Expr>,
        pos: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// True when evaluation must wait until the task is ready to run.
    ///
    /// Deferred expressions are exactly those that reach into `inputs` or
    /// `memento`, neither of which exists before upstream tasks finish.
    pub fn is_deferred(&self) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Var { name, .. } => name == "inputs" || name == "memento",
            Expr::Member { base, .. } => base.is_deferred(),
            Expr::Index { base, index, .. } => base.is_deferred() || index.is_deferred(),
            Expr::Slice { base, start, end, .. } => {
                base.is_deferred()
                    || start.as_ref().is_some_and(|e| e.is_deferred())
                    || end.as_ref().is_some_and(|e| e.is_deferred())
            }
            Expr::Call { args, .. } => args.iter().any(|a| a.is_deferred()),
            Expr::Unary { operand, .. } => operand.is_deferred(),
            Expr::Binary { left, right, .. } => left.is_deferred() || right.is_deferred(),
        }
    }
}

/// Parser error with source position
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub pos: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at position {}: {}", self.pos, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Recursive-descent parser over the lexer's token stream.
///
/// Precedence, loosest first: pipe, or, and, comparison, additive,
/// multiplicative, unary, power, postfix.
pub struct ExprParser {
    tokens: Vec<Spanned>,
    current: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_pipe()?;

        if self.peek().token != Token::Eof {
            return Err(self.error_here(format!(
                "unexpected token after expression: {}",
                self.peek().token
            )));
        }

        Ok(expr)
    }

    fn parse_pipe(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_or()?;

        while self.check(&Token::Pipe) {
            self.advance();
            let pos = self.peek().pos;

            let Token::Ident(name) = self.peek().token.clone() else {
                return Err(self.error_here("expected filter name after '|'".to_string()));
            };
            self.advance();

            // Piped value becomes the first argument
            let mut args = vec![expr];
            if self.check(&Token::LParen) {
                self.advance();
                args.extend(self.parse_call_args()?);
            }

            expr = Expr::Call { name, args, pos };
        }

        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            expr = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            expr = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_additive()?;

        loop {
            let op = match self.peek().token {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_multiplicative()?;

        loop {
            let op = match self.peek().token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;

        loop {
            let op = match self.peek().token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::SlashSlash => BinaryOp::FloorDiv,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }

        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().token {
            Token::Not => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;

        // Right-associative
        if self.check(&Token::StarStar) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }

        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek().token {
                Token::Dot => {
                    self.advance();
                    let pos = self.peek().pos;
                    let Token::Ident(member) = self.peek().token.clone() else {
                        return Err(self.error_here("expected member name after '.'".to_string()));
                    };
                    self.advance();
                    expr = Expr::Member {
                        base: Box::new(expr),
                        member,
                        pos,
                    };
                }
                Token::LBracket => {
                    let pos = self.peek().pos;
                    self.advance();
                    expr = self.parse_index_or_slice(expr, pos)?;
                }
                Token::LParen => {
                    // Only bare identifiers are callable
                    let Expr::Var { name, pos } = expr else {
                        return Err(self.error_here("only named functions can be called".to_string()));
                    };
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = Expr::Call { name, args, pos };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_index_or_slice(&mut self, base: Expr, pos: usize) -> Result<Expr, ParseError> {
        // `[:end]`
        if self.check(&Token::Colon) {
            self.advance();
            let end = if self.check(&Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_pipe()?))
            };
            self.expect(&Token::RBracket)?;
            return Ok(Expr::Slice {
                base: Box::new(base),
                start: None,
                end,
                pos,
            });
        }

        let first = self.parse_pipe()?;

        if self.check(&Token::Colon) {
            self.advance();
            let end = if self.check(&Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_pipe()?))
            };
            self.expect(&Token::RBracket)?;
            return Ok(Expr::Slice {
                base: Box::new(base),
                start: Some(Box::new(first)),
                end,
                pos,
            });
        }

        self.expect(&Token::RBracket)?;
        Ok(Expr::Index {
            base: Box::new(base),
            index: Box::new(first),
            pos,
        })
    }

    /// Parse arguments after '(' has been consumed, through the closing ')'
    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            loop {
                args.push(self.parse_pipe()?);
                if self.check(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let spanned = self.peek().clone();

        let expr = match spanned.token {
            Token::Null => {
                self.advance();
                Expr::Literal(Value::Null)
            }
            Token::True => {
                self.advance();
                Expr::Literal(Value::Bool(true))
            }
            Token::False => {
                self.advance();
                Expr::Literal(Value::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Expr::Literal(Value::Number(n))
            }
            Token::Str(s) => {
                self.advance();
                Expr::Literal(Value::String(s))
            }
            Token::Ident(name) => {
                self.advance();
                Expr::Var {
                    name,
                    pos: spanned.pos,
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_pipe()?;
                self.expect(&Token::RParen)?;
                inner
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Token::RBracket) {
                    loop {
                        items.push(self.parse_pipe()?);
                        if self.check(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                // List literals of constants fold to a literal
                if let Some(values) = items
                    .iter()
                    .map(|e| match e {
                        Expr::Literal(v) => Some(v.clone()),
                        _ => None,
                    })
                    .collect::<Option<Vec<Value>>>()
                {
                    Expr::Literal(Value::List(values))
                } else {
                    Expr::Call {
                        name: "list".to_string(),
                        args: items,
                        pos: spanned.pos,
                    }
                }
            }
            ref other => {
                return Err(ParseError {
                    message: format!("unexpected token: {}", other),
                    pos: spanned.pos,
                });
            }
        };

        Ok(expr)
    }

    fn peek(&self) -> &Spanned {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(&self.peek().token) == std::mem::discriminant(token)
    }

    fn advance(&mut self) {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected '{}', found '{}'",
                token,
                self.peek().token
            )))
        }
    }

    fn error_here(&self, message: String) -> ParseError {
        ParseError {
            message,
            pos: self.peek().pos,
        }
    }
}

/// Lex and parse an expression string
pub fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    let tokens = super::lexer::Lexer::new(input)
        .tokenize()
        .map_err(|e| ParseError {
            message: e.message,
            pos: e.pos,
        })?;
    ExprParser::new(tokens).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        assert_eq!(
            parse_expression("42").unwrap(),
            Expr::Literal(Value::Number(42.0))
        );
        assert_eq!(
            parse_expression("'hi'").unwrap(),
            Expr::Literal(Value::String("hi".to_string()))
        );
    }

    #[test]
    fn test_parse_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expr = parse_expression("1 + 2 * 3").unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_power_binds_tighter_than_unary() {
        // -2 ** 2 parses as -(2 ** 2)
        let expr = parse_expression("-2 ** 2").unwrap();
        let Expr::Unary { op, operand } = expr else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Neg);
        assert!(matches!(
            *operand,
            Expr::Binary {
                op: BinaryOp::Pow,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_pipe_desugars_to_call() {
        let expr = parse_expression("name | upper").unwrap();
        let Expr::Call { name, args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "upper");
        assert_eq!(args.len(), 1);
        assert!(matches!(&args[0], Expr::Var { name, .. } if name == "name"));
    }

    #[test]
    fn test_parse_pipe_with_extra_args() {
        let expr = parse_expression("items | join(', ')").unwrap();
        let Expr::Call { name, args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "join");
        assert_eq!(args.len(), 2);
        assert_eq!(args[1], Expr::Literal(Value::String(", ".to_string())));
    }

    #[test]
    fn test_parse_member_chain() {
        let expr = parse_expression("this.top").unwrap();
        let Expr::Member { base, member, .. } = expr else {
            panic!("expected member");
        };
        assert_eq!(member, "top");
        assert!(matches!(*base, Expr::Var { ref name, .. } if name == "this"));
    }

    #[test]
    fn test_parse_slice() {
        let expr = parse_expression("items[1:3]").unwrap();
        assert!(matches!(
            expr,
            Expr::Slice {
                start: Some(_),
                end: Some(_),
                ..
            }
        ));

        let expr = parse_expression("items[:2]").unwrap();
        assert!(matches!(
            expr,
            Expr::Slice {
                start: None,
                end: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse_expression("1 +").unwrap_err();
        assert!(err.pos >= 2);
    }

    #[test]
    fn test_deferred_detection() {
        assert!(parse_expression("inputs.artifact").unwrap().is_deferred());
        assert!(parse_expression("memento.counter + 1").unwrap().is_deferred());
        assert!(!parse_expression("params.debug").unwrap().is_deferred());
        assert!(parse_expression("join(inputs.files, ' ')")
            .unwrap()
            .is_deferred());
    }

    #[test]
    fn test_parse_comparison_chain() {
        let expr = parse_expression("a == 1 and b != 2").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }
}
