//! Recursive-descent parser producing the script syntax tree

use super::lexer::{syntax, tokenize, Spanned, Token};
use crate::error::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Abs,
    Min,
    Max,
    Round,
    Floor,
    Ceil,
    Sqrt,
    Pow,
    Clamp,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let function = match name {
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "round" => Self::Round,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "sqrt" => Self::Sqrt,
            "pow" => Self::Pow,
            "clamp" => Self::Clamp,
            _ => return None,
        };
        Some(function)
    }

    /// Accepted argument count as (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Min | Self::Max => (1, usize::MAX),
            Self::Pow => (2, 2),
            Self::Clamp => (3, 3),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Literal),
    /// The value being converted
    Input,
    /// User value of another variable
    Variable {
        hw_interface: Option<String>,
        name: String,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

pub(crate) fn parse(source: &str) -> Result<Expr, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        end: source.len(),
    };
    let expr = parser.conditional()?;
    match parser.peek() {
        None => Ok(expr),
        Some(_) => Err(syntax(parser.position(), "unexpected trailing input")),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|spanned| &spanned.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .map_or(self.end, |spanned| spanned.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.index).map(|spanned| spanned.token.clone());
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ScriptError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(syntax(self.position(), format!("expected {what}")))
        }
    }

    /// `or ('?' conditional ':' conditional)?`
    fn conditional(&mut self) -> Result<Expr, ScriptError> {
        let condition = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.conditional()?;
        self.expect(Token::Colon, "':'")?;
        let otherwise = self.conditional()?;
        Ok(Expr::Conditional(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.comparison()?;
        while self.eat(&Token::AndAnd) {
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Less) => BinaryOp::Lt,
                Some(Token::LessEq) => BinaryOp::Le,
                Some(Token::Greater) => BinaryOp::Gt,
                Some(Token::GreaterEq) => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.index += 1;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.index += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.index += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.power()
    }

    /// `primary ('^' unary)?`, right associative
    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.primary()?;
        if self.eat(&Token::Caret) {
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(number)) => Ok(Expr::Literal(Literal::Number(number))),
            Some(Token::Str(text)) => Ok(Expr::Literal(Literal::Str(text))),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    return self.call(&name, position);
                }
                Ok(identifier(name))
            }
            Some(_) => Err(syntax(position, "expected a value")),
            None => Err(syntax(position, "unexpected end of script")),
        }
    }

    fn call(&mut self, name: &str, position: usize) -> Result<Expr, ScriptError> {
        let function =
            Function::lookup(name).ok_or_else(|| syntax(position, format!("unknown function {name:?}")))?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.conditional()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(syntax(
                position,
                format!("{name} does not take {} argument(s)", args.len()),
            ));
        }
        Ok(Expr::Call(function, args))
    }
}

fn identifier(name: String) -> Expr {
    match name.as_str() {
        "value" | "x" => Expr::Input,
        "true" => Expr::Literal(Literal::Bool(true)),
        "false" => Expr::Literal(Literal::Bool(false)),
        _ => match name.split_once('.') {
            Some((hw_interface, variable)) => Expr::Variable {
                hw_interface: Some(hw_interface.to_string()),
                name: variable.to_string(),
            },
            None => Expr::Variable {
                hw_interface: None,
                name,
            },
        },
    }
}
