//! Conversion scripts between raw and user values
//!
//! A script is a single expression compiled once when the Device API is
//! loaded and evaluated on every conversion:
//!
//! ```text
//! value * 0.1 - 40                  // scale a raw sensor reading
//! value > 0 ? "on" : "off"          // map to a label
//! clamp(round(x / gain), 0, 255)    // `gain` is another variable on the same interface
//! value + hwiTemp.offset            // or a qualified one
//! ```
//!
//! Numbers evaluate as doubles; the result is cast to the target type
//! afterwards, so a double converted to an integer type is rounded.

mod eval;
mod lexer;
mod parser;

use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::ScriptError;
use crate::value::{Value, ValueType};

use eval::Evaluator;
use parser::Expr;

/// Supplies the user values of other variables to a running script
pub trait Resolver {
    fn resolve(&self, hw_interface: &str, name: &str) -> Option<Value>;
}

/// Resolver for scripts that reference no other variables
impl Resolver for () {
    fn resolve(&self, _hw_interface: &str, _name: &str) -> Option<Value> {
        None
    }
}

/// A compiled conversion script
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    source: String,
    expr: Expr,
}

impl Script {
    /// Compile `source`, reporting syntax errors
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let source = source.trim();
        let expr = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with `input` bound to `value`/`x`
    ///
    /// Unqualified names resolve on `hw_interface`.
    pub fn eval(&self, input: &Value, hw_interface: &str, resolver: &dyn Resolver) -> Result<Value, ScriptError> {
        Evaluator {
            input,
            hw_interface,
            resolver,
        }
        .run(&self.expr)
    }

    /// Evaluate and cast the result to `target`
    pub fn convert(
        &self,
        input: &Value,
        target: ValueType,
        hw_interface: &str,
        resolver: &dyn Resolver,
    ) -> Result<Value, ScriptError> {
        let result = self.eval(input, hw_interface, resolver)?;
        Ok(result.cast(target)?)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Script {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}
