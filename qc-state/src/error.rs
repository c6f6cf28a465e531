//! Error types for the state layer

use std::time::Duration;

use thiserror::Error;

use crate::value::ValueType;
use crate::variable::{AccessMode, VariableKey};

/// Errors raised when parsing or casting a value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// Text does not parse as the requested type
    #[error("Cannot parse {text:?} as {target}")]
    Parse {
        /// Requested type
        target: ValueType,
        /// The offending text
        text: String,
    },

    /// A number does not fit the requested type
    #[error("Value {value} is out of range for {target}")]
    OutOfRange {
        /// Requested type
        target: ValueType,
        /// The offending value, as text
        value: String,
    },

    /// NaN or infinity where a finite number is required
    #[error("Value is not a finite number")]
    NotFinite,

    /// The name does not denote a value type
    #[error("Unknown value type: {0:?}")]
    UnknownType(String),

    /// The name does not denote an access mode
    #[error("Unknown access mode: {0:?}")]
    UnknownAccess(String),
}

/// Errors raised while compiling or evaluating a conversion script
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// The script text does not parse
    #[error("Syntax error at offset {position}: {message}")]
    Syntax {
        /// Byte offset into the script
        position: usize,
        /// What was expected
        message: String,
    },

    /// A referenced variable does not exist or has no user value yet
    #[error("Unknown name or unset variable: {0}")]
    UnknownName(String),

    /// An operator or function received an operand of the wrong type
    #[error("Type error: {0}")]
    Type(String),

    /// Division or remainder by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// The computation produced NaN or infinity
    #[error("Result is not a finite number")]
    NotFinite,

    /// The result cannot be cast to the target type
    #[error("Cannot convert result: {0}")]
    Value(#[from] ValueError),
}

/// Errors raised by state store operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// No variable with this key
    #[error("Unknown state variable: {0}")]
    UnknownVariable(VariableKey),

    /// The access mode forbids the operation
    #[error("Access to {key} denied: variable is {access}")]
    AccessDenied {
        /// Variable key
        key: VariableKey,
        /// Its access mode
        access: AccessMode,
    },

    /// The supplied value does not fit the variable's type
    #[error("Invalid value for {key}: {source}")]
    InvalidValue {
        /// Variable key
        key: VariableKey,
        /// Underlying parse or cast failure
        source: ValueError,
    },

    /// A conversion script failed
    #[error("Conversion failed for {key}: {source}")]
    Conversion {
        /// Variable key
        key: VariableKey,
        /// Underlying script failure
        source: ScriptError,
    },

    /// Auto-update interval below the configured minimum
    #[error("Auto-update interval {requested:?} is below the minimum {minimum:?}")]
    IntervalTooShort {
        /// Requested interval
        requested: Duration,
        /// Configured minimum
        minimum: Duration,
    },
}

/// Errors raised while loading a Device API document
#[derive(Error, Debug)]
pub enum ApiError {
    /// The file could not be read
    #[error("Failed to read Device API file: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not well-formed XML
    #[error("Malformed Device API XML: {0}")]
    Xml(String),

    /// The root element is not `deviceAPI`
    #[error("Unexpected root element <{0}>, expected <deviceAPI>")]
    UnexpectedRoot(String),

    /// A mandatory section is missing
    #[error("Device API is missing <{0}>")]
    MissingSection(&'static str),

    /// No hardware interface survived validation
    #[error("Device API declares no valid hardware interface")]
    NoInterfaces,
}

/// Result type alias for store operations
pub type StateResult<T> = Result<T, StateError>;

/// Result type alias for API loading
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let error = StateError::AccessDenied {
            key: VariableKey::new("hwiLed", "led1"),
            access: AccessMode::Read,
        };
        assert_eq!(error.to_string(), "Access to hwiLed.led1 denied: variable is read");

        let error = StateError::IntervalTooShort {
            requested: Duration::from_millis(5),
            minimum: Duration::from_millis(10),
        };
        assert_eq!(
            error.to_string(),
            "Auto-update interval 5ms is below the minimum 10ms"
        );
    }

    #[test]
    fn test_script_error_from_value_error() {
        let error: ScriptError = ValueError::NotFinite.into();
        assert_eq!(error.to_string(), "Cannot convert result: Value is not a finite number");
    }
}
