//! Typed values carried by state variables

use std::fmt;
use std::str::FromStr;

use qc_protocol::xml::parse_bool;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// Type of a raw or user value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Uint,
    Double,
    String,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Double => "double",
            Self::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(Self::Bool),
            "int" | "integer" => Ok(Self::Int),
            "uint" | "unsigned" => Ok(Self::Uint),
            "double" | "float" | "real" => Ok(Self::Double),
            "string" | "str" => Ok(Self::String),
            _ => Err(ValueError::UnknownType(s.to_string())),
        }
    }
}

/// A value of one of the five supported types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Uint(_) => ValueType::Uint,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    /// Parse wire text as `target`
    pub fn parse(target: ValueType, text: &str) -> Result<Self, ValueError> {
        let parse_error = || ValueError::Parse {
            target,
            text: text.to_string(),
        };
        let trimmed = text.trim();
        match target {
            ValueType::Bool => parse_bool(trimmed).map(Self::Bool).ok_or_else(parse_error),
            ValueType::Int => parse_integer(trimmed)
                .ok_or_else(parse_error)
                .map(Self::Int),
            ValueType::Uint => parse_unsigned(trimmed)
                .ok_or_else(parse_error)
                .map(Self::Uint),
            ValueType::Double => {
                let number: f64 = trimmed.parse().map_err(|_| parse_error())?;
                if number.is_finite() {
                    Ok(Self::Double(number))
                } else {
                    Err(ValueError::NotFinite)
                }
            }
            ValueType::String => Ok(Self::String(text.to_string())),
        }
    }

    /// Convert into `target`; doubles round to the nearest integer
    pub fn cast(&self, target: ValueType) -> Result<Self, ValueError> {
        if self.value_type() == target {
            return Ok(self.clone());
        }
        let out_of_range = || ValueError::OutOfRange {
            target,
            value: self.to_string(),
        };
        match (self, target) {
            (Self::String(text), _) => Self::parse(target, text),
            (_, ValueType::String) => Ok(Self::String(self.to_string())),
            (Self::Bool(b), ValueType::Int) => Ok(Self::Int(i64::from(*b))),
            (Self::Bool(b), ValueType::Uint) => Ok(Self::Uint(u64::from(*b))),
            (Self::Bool(b), ValueType::Double) => Ok(Self::Double(if *b { 1.0 } else { 0.0 })),
            (Self::Int(i), ValueType::Bool) => Ok(Self::Bool(*i != 0)),
            (Self::Uint(u), ValueType::Bool) => Ok(Self::Bool(*u != 0)),
            (Self::Double(d), ValueType::Bool) => Ok(Self::Bool(*d != 0.0)),
            (Self::Int(i), ValueType::Uint) => u64::try_from(*i).map(Self::Uint).map_err(|_| out_of_range()),
            (Self::Uint(u), ValueType::Int) => i64::try_from(*u).map(Self::Int).map_err(|_| out_of_range()),
            (Self::Int(i), ValueType::Double) => Ok(Self::Double(*i as f64)),
            (Self::Uint(u), ValueType::Double) => Ok(Self::Double(*u as f64)),
            (Self::Double(d), ValueType::Int) => {
                let rounded = finite(*d)?.round();
                if rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
                    return Err(out_of_range());
                }
                Ok(Self::Int(rounded as i64))
            }
            (Self::Double(d), ValueType::Uint) => {
                let rounded = finite(*d)?.round();
                if rounded < 0.0 || rounded >= u64::MAX as f64 {
                    return Err(out_of_range());
                }
                Ok(Self::Uint(rounded as u64))
            }
            // same-type pairs returned above
            _ => Ok(self.clone()),
        }
    }

    /// Numeric view of the value; strings and bools are not numbers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Uint(u) => Some(*u as f64),
            Self::Double(d) => Some(*d),
            Self::Bool(_) | Self::String(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

fn finite(number: f64) -> Result<f64, ValueError> {
    if number.is_finite() {
        Ok(number)
    } else {
        Err(ValueError::NotFinite)
    }
}

fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let magnitude = i64::from_str_radix(hex, 16).ok()?;
        return Some(if negative { -magnitude } else { magnitude });
    }
    text.parse().ok()
}

fn parse_unsigned(text: &str) -> Option<u64> {
    let digits = text.strip_prefix('+').unwrap_or(text);
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ValueType::Bool, "on", Value::Bool(true))]
    #[case(ValueType::Bool, "0", Value::Bool(false))]
    #[case(ValueType::Int, "-42", Value::Int(-42))]
    #[case(ValueType::Int, "0x1F", Value::Int(31))]
    #[case(ValueType::Uint, "17", Value::Uint(17))]
    #[case(ValueType::Double, "2.5", Value::Double(2.5))]
    #[case(ValueType::String, " spaced ", Value::String(" spaced ".to_string()))]
    fn test_parse(#[case] target: ValueType, #[case] text: &str, #[case] expected: Value) {
        assert_eq!(Value::parse(target, text).unwrap(), expected);
    }

    #[rstest]
    #[case(ValueType::Bool, "maybe")]
    #[case(ValueType::Int, "1.5")]
    #[case(ValueType::Uint, "-1")]
    #[case(ValueType::Double, "abc")]
    fn test_parse_failures(#[case] target: ValueType, #[case] text: &str) {
        assert!(Value::parse(target, text).is_err());
    }

    #[test]
    fn test_double_to_int_rounds() {
        assert_eq!(Value::Double(2.5).cast(ValueType::Int).unwrap(), Value::Int(3));
        assert_eq!(Value::Double(-2.4).cast(ValueType::Int).unwrap(), Value::Int(-2));
        assert_eq!(Value::Double(7.6).cast(ValueType::Uint).unwrap(), Value::Uint(8));
        assert!(Value::Double(-3.0).cast(ValueType::Uint).is_err());
    }

    #[test]
    fn test_cast_between_types() {
        assert_eq!(Value::Int(0).cast(ValueType::Bool).unwrap(), Value::Bool(false));
        assert_eq!(Value::Bool(true).cast(ValueType::Double).unwrap(), Value::Double(1.0));
        assert_eq!(Value::Uint(12).cast(ValueType::String).unwrap(), Value::from("12"));
        assert_eq!(Value::from("5").cast(ValueType::Uint).unwrap(), Value::Uint(5));
        assert!(Value::Int(-1).cast(ValueType::Uint).is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!("Integer".parse::<ValueType>().unwrap(), ValueType::Int);
        assert_eq!("float".parse::<ValueType>().unwrap(), ValueType::Double);
        assert!("complex".parse::<ValueType>().is_err());
    }
}
