//! Device commands: get/set/call against a hardware interface

use std::fmt;
use std::str::FromStr;

use xmltree::{Element, XMLNode};

use crate::error::{CommandError, CommandResult};
use crate::xml;

/// The three verbs of the device protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommandType {
    /// Request the current value of a variable
    Get,
    /// Assign a value to a variable
    Set,
    /// Invoke a function, or deliver a notification from the device
    Call,
}

impl DeviceCommandType {
    /// All device command types
    pub const ALL: [DeviceCommandType; 3] = [Self::Get, Self::Set, Self::Call];

    /// Wire name of the command type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for DeviceCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCommandType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "call" => Ok(Self::Call),
            other => Err(CommandError::Unregistered(other.to_string())),
        }
    }
}

/// A get/set/call against `hw_interface`.`variable`
///
/// For `call` the `variable` field holds the function name. The optional
/// timestamp is whatever clock the sender uses: device ticks on the device
/// wire, milliseconds since the Unix epoch on the client wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub kind: DeviceCommandType,
    pub timestamp: Option<u64>,
    pub hw_interface: String,
    pub variable: String,
    pub args: Vec<String>,
}

impl DeviceCommand {
    /// Create a command with no arguments and no timestamp
    pub fn new(kind: DeviceCommandType, hw_interface: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: None,
            hw_interface: hw_interface.into(),
            variable: variable.into(),
            args: Vec::new(),
        }
    }

    /// `get <hw_interface> <variable>`
    pub fn get(hw_interface: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::new(DeviceCommandType::Get, hw_interface, variable)
    }

    /// `set <hw_interface> <variable> <value>`
    pub fn set(hw_interface: impl Into<String>, variable: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(DeviceCommandType::Set, hw_interface, variable).with_arg(value)
    }

    /// `call <hw_interface> <function> [args...]`
    pub fn call<I, S>(hw_interface: impl Into<String>, function: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(DeviceCommandType::Call, hw_interface, function).with_args(args)
    }

    /// Attach a timestamp
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Append one positional argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append positional arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command name as used on both wires
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// First argument, the value of a `set`
    pub fn value(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Check the device command validity rules
    pub fn validate(&self) -> CommandResult<()> {
        if self.hw_interface.is_empty() {
            return Err(CommandError::invalid(self.name(), "hardware interface is required"));
        }
        if self.variable.is_empty() {
            return Err(CommandError::invalid(self.name(), "variable or function name is required"));
        }
        if self.kind == DeviceCommandType::Set && self.args.is_empty() {
            return Err(CommandError::invalid(self.name(), "at least one argument is required"));
        }
        Ok(())
    }

    /// Whether `validate` succeeds
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Client-wire form: `<set hwInterface=".." variable=".."><arg>..</arg></set>`
    pub fn to_element(&self) -> Element {
        let mut element = Element::new(self.name());
        element
            .attributes
            .insert("hwInterface".to_string(), self.hw_interface.clone());
        element
            .attributes
            .insert("variable".to_string(), self.variable.clone());
        if let Some(timestamp) = self.timestamp {
            element
                .attributes
                .insert("timestamp".to_string(), timestamp.to_string());
        }
        for arg in &self.args {
            element
                .children
                .push(XMLNode::Element(xml::text_element("arg", arg)));
        }
        element
    }

    /// Build from the client-wire form
    pub fn from_element(element: &Element) -> CommandResult<Self> {
        let kind: DeviceCommandType = element.name.parse()?;
        let command = Self {
            kind,
            timestamp: xml::parse_attribute(element, "timestamp")?,
            hw_interface: xml::required_attribute(element, "hwInterface")?.to_string(),
            variable: xml::required_attribute(element, "variable")?.to_string(),
            args: xml::child_elements(element)
                .filter(|child| child.name == "arg")
                .map(xml::raw_text_of)
                .collect(),
        };
        command.validate()?;
        Ok(command)
    }
}
