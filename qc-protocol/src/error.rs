//! Error types for protocol encoding and decoding

use thiserror::Error;

/// Errors raised while building or validating a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command has no name
    #[error("Command name is empty")]
    EmptyName,

    /// A required attribute is missing from the command element
    #[error("Missing attribute '{attribute}' on <{element}>")]
    MissingAttribute {
        /// Element name
        element: String,
        /// Attribute name
        attribute: String,
    },

    /// An attribute value could not be parsed
    #[error("Invalid value '{value}' for attribute '{attribute}' on <{element}>")]
    InvalidAttribute {
        /// Element name
        element: String,
        /// Attribute name
        attribute: String,
        /// The offending value
        value: String,
    },

    /// The command was built but breaks a command-specific rule
    #[error("Invalid {command} command: {reason}")]
    Invalid {
        /// Command name
        command: String,
        /// What rule was broken
        reason: String,
    },

    /// No constructor is registered for the element name
    #[error("No command registered for <{0}>")]
    Unregistered(String),
}

impl CommandError {
    pub(crate) fn invalid(command: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the device line codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceCodecError {
    /// Fewer than three tokens (type, interface, variable) were found
    #[error("Device line has {0} tokens, at least 3 are required")]
    TooFewTokens(usize),

    /// The first token is not get, set or call
    #[error("Unknown device command type: {0:?}")]
    UnknownType(String),

    /// The hardware interface is not part of the loaded device API
    #[error("Unknown hardware interface: {0}")]
    UnknownInterface(String),

    /// The `@` timestamp segment is not hexadecimal
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A quoted argument is missing its closing quote
    #[error("Unterminated quoted argument")]
    UnterminatedQuote,

    /// An interface or variable name contains the field separator
    #[error("Identifier {0:?} contains the field separator")]
    SeparatorInIdentifier(String),

    /// An argument needs quoting but itself contains a quote or a line break
    #[error("Argument {0:?} cannot be written on the device wire")]
    UnencodableArgument(String),

    /// The command breaks a validity rule
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandError),
}

/// Errors raised by the client packet codec
#[derive(Error, Debug)]
pub enum PacketError {
    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload bytes are not UTF-8
    #[error("Packet payload is not valid UTF-8")]
    InvalidUtf8,

    /// Payload is not well-formed XML
    #[error("Malformed packet XML: {0}")]
    Xml(String),

    /// The root element is not `<packet>`
    #[error("Unexpected root element <{0}>, expected <packet>")]
    UnexpectedRoot(String),

    /// The packet has no `id` attribute
    #[error("Packet has no id")]
    MissingId,

    /// The packet id is not `<origin>#<sequence>`
    #[error("Invalid packet id: {0}")]
    InvalidId(String),

    /// None of the packet's children decoded into a command
    #[error("Packet {0} contains no valid commands")]
    Empty(String),

    /// The encoded payload does not fit the 16-bit length prefix
    #[error("Packet payload of {0} bytes exceeds the 65535 byte frame limit")]
    TooLarge(usize),

    /// XML serialization failed
    #[error("Failed to serialize packet: {0}")]
    Serialize(String),

    /// A command in an outgoing packet is invalid
    #[error("Cannot encode invalid command: {0}")]
    InvalidCommand(#[from] CommandError),
}

/// Result type alias for command operations
pub type CommandResult<T> = Result<T, CommandError>;
