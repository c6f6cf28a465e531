//! Script evaluation

use super::parser::{BinaryOp, Expr, Function, Literal, UnaryOp};
use super::Resolver;
use crate::error::ScriptError;
use crate::value::Value;

/// Intermediate value: all numbers are evaluated as doubles
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(*b),
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Number(other.as_f64().unwrap_or_default()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Number(n) => Value::Double(n),
            Self::Bool(b) => Value::Bool(b),
            Self::Str(s) => Value::String(s),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
        }
    }

    fn number(&self, context: &str) -> Result<f64, ScriptError> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(ScriptError::Type(format!("{context} expects a number, got {}", other.kind()))),
        }
    }

    fn truthy(&self, context: &str) -> Result<bool, ScriptError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Number(n) => Ok(*n != 0.0),
            Self::Str(_) => Err(ScriptError::Type(format!("{context} expects a bool, got string"))),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

pub(crate) struct Evaluator<'a> {
    pub input: &'a Value,
    pub hw_interface: &'a str,
    pub resolver: &'a dyn Resolver,
}

impl Evaluator<'_> {
    pub fn run(&self, expr: &Expr) -> Result<Value, ScriptError> {
        let result = self.eval(expr)?;
        if let Scalar::Number(n) = result {
            finite(n)?;
        }
        Ok(result.into_value())
    }

    fn eval(&self, expr: &Expr) -> Result<Scalar, ScriptError> {
        match expr {
            Expr::Literal(Literal::Number(n)) => Ok(Scalar::Number(*n)),
            Expr::Literal(Literal::Bool(b)) => Ok(Scalar::Bool(*b)),
            Expr::Literal(Literal::Str(s)) => Ok(Scalar::Str(s.clone())),
            Expr::Input => Ok(Scalar::from_value(self.input)),
            Expr::Variable { hw_interface, name } => {
                let hw_interface = hw_interface.as_deref().unwrap_or(self.hw_interface);
                self.resolver
                    .resolve(hw_interface, name)
                    .map(|value| Scalar::from_value(&value))
                    .ok_or_else(|| ScriptError::UnknownName(format!("{hw_interface}.{name}")))
            }
            Expr::Unary(UnaryOp::Neg, operand) => {
                Ok(Scalar::Number(-self.eval(operand)?.number("unary '-'")?))
            }
            Expr::Unary(UnaryOp::Not, operand) => Ok(Scalar::Bool(!self.eval(operand)?.truthy("'!'")?)),
            Expr::Binary(BinaryOp::And, left, right) => {
                if !self.eval(left)?.truthy("'&&'")? {
                    return Ok(Scalar::Bool(false));
                }
                Ok(Scalar::Bool(self.eval(right)?.truthy("'&&'")?))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if self.eval(left)?.truthy("'||'")? {
                    return Ok(Scalar::Bool(true));
                }
                Ok(Scalar::Bool(self.eval(right)?.truthy("'||'")?))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
            Expr::Conditional(condition, then, otherwise) => {
                if self.eval(condition)?.truthy("'?:'")? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call(function, args) => {
                let mut numbers = Vec::with_capacity(args.len());
                for arg in args {
                    numbers.push(self.eval(arg)?.number("function argument")?);
                }
                call(*function, &numbers).map(Scalar::Number)
            }
        }
    }
}

fn binary(op: BinaryOp, left: Scalar, right: Scalar) -> Result<Scalar, ScriptError> {
    match op {
        BinaryOp::Eq => return Ok(Scalar::Bool(left == right)),
        BinaryOp::Ne => return Ok(Scalar::Bool(left != right)),
        BinaryOp::Add => {
            if matches!(left, Scalar::Str(_)) || matches!(right, Scalar::Str(_)) {
                return Ok(Scalar::Str(left.render() + &right.render()));
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
                (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(ScriptError::Type(format!(
                        "cannot compare {} with {}",
                        left.kind(),
                        right.kind()
                    )))
                }
            };
            let ordering = ordering.ok_or(ScriptError::NotFinite)?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Scalar::Bool(result));
        }
        _ => {}
    }

    let a = left.number("arithmetic")?;
    let b = right.number("arithmetic")?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ScriptError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
        // comparisons and logic handled above
        _ => return Err(ScriptError::Type("unsupported operator".to_string())),
    };
    finite(result).map(Scalar::Number)
}

fn call(function: Function, args: &[f64]) -> Result<f64, ScriptError> {
    let first = args.first().copied().unwrap_or_default();
    let result = match function {
        Function::Abs => first.abs(),
        Function::Round => first.round(),
        Function::Floor => first.floor(),
        Function::Ceil => first.ceil(),
        Function::Sqrt => first.sqrt(),
        Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Pow => first.powf(args[1]),
        Function::Clamp => {
            let (low, high) = (args[1], args[2]);
            if low > high {
                return Err(ScriptError::Type(format!("clamp bounds {low} > {high}")));
            }
            first.clamp(low, high)
        }
    };
    finite(result)
}

fn finite(number: f64) -> Result<f64, ScriptError> {
    if number.is_finite() {
        Ok(number)
    } else {
        Err(ScriptError::NotFinite)
    }
}
