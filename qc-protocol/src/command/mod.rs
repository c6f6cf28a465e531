//! Command model shared by the device and client wires
//!
//! Every command is one variant of [`Command`]. Built-in control and device
//! commands have typed fields; anything registered by a library user travels
//! as an [`ExtensionCommand`] holding its element.

mod control;
mod device;
mod registry;

pub use control::{
    ControlCommand, DeviceApi, DeviceInfo, HandShake, HeartBeat, Subscribe, Unsubscribe, WILDCARD,
};
pub use device::{DeviceCommand, DeviceCommandType};
pub use registry::{CommandConstructor, CommandRegistry};

use std::fmt;

use xmltree::Element;

use crate::error::{CommandError, CommandResult};

/// Family a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    Control,
    Device,
    Extension,
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Device => write!(f, "device"),
            Self::Extension => write!(f, "extension"),
        }
    }
}

/// A command outside the built-in set, kept as its element
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionCommand {
    element: Element,
}

impl ExtensionCommand {
    pub fn new(element: Element) -> CommandResult<Self> {
        if element.name.is_empty() {
            return Err(CommandError::EmptyName);
        }
        Ok(Self { element })
    }

    pub fn name(&self) -> &str {
        &self.element.name
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

/// Any command carried by either wire
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Control(ControlCommand),
    Device(DeviceCommand),
    Extension(ExtensionCommand),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Self::Control(command) => command.name(),
            Self::Device(command) => command.name(),
            Self::Extension(command) => command.name(),
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Self::Control(_) => CommandClass::Control,
            Self::Device(_) => CommandClass::Device,
            Self::Extension(_) => CommandClass::Extension,
        }
    }

    pub fn validate(&self) -> CommandResult<()> {
        if self.name().is_empty() {
            return Err(CommandError::EmptyName);
        }
        match self {
            Self::Control(command) => command.validate(),
            Self::Device(command) => command.validate(),
            Self::Extension(_) => Ok(()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Client-wire element for this command
    pub fn to_element(&self) -> Element {
        match self {
            Self::Control(command) => command.to_element(),
            Self::Device(command) => command.to_element(),
            Self::Extension(command) => command.element.clone(),
        }
    }

    pub fn as_device(&self) -> Option<&DeviceCommand> {
        match self {
            Self::Device(command) => Some(command),
            _ => None,
        }
    }

    pub fn as_control(&self) -> Option<&ControlCommand> {
        match self {
            Self::Control(command) => Some(command),
            _ => None,
        }
    }
}

impl From<ControlCommand> for Command {
    fn from(command: ControlCommand) -> Self {
        Self::Control(command)
    }
}

impl From<DeviceCommand> for Command {
    fn from(command: DeviceCommand) -> Self {
        Self::Device(command)
    }
}

impl From<ExtensionCommand> for Command {
    fn from(command: ExtensionCommand) -> Self {
        Self::Extension(command)
    }
}

impl From<HandShake> for Command {
    fn from(handshake: HandShake) -> Self {
        Self::Control(ControlCommand::HandShake(handshake))
    }
}

impl From<HeartBeat> for Command {
    fn from(heartbeat: HeartBeat) -> Self {
        Self::Control(ControlCommand::HeartBeat(heartbeat))
    }
}

impl From<Subscribe> for Command {
    fn from(subscribe: Subscribe) -> Self {
        Self::Control(ControlCommand::Subscribe(subscribe))
    }
}

impl From<Unsubscribe> for Command {
    fn from(unsubscribe: Unsubscribe) -> Self {
        Self::Control(ControlCommand::Unsubscribe(unsubscribe))
    }
}

impl From<DeviceApi> for Command {
    fn from(api: DeviceApi) -> Self {
        Self::Control(ControlCommand::DeviceApi(api))
    }
}

impl From<DeviceInfo> for Command {
    fn from(info: DeviceInfo) -> Self {
        Self::Control(ControlCommand::DeviceInfo(info))
    }
}
