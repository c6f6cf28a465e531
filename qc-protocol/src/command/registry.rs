//! Name-keyed registry of command constructors
//!
//! The registry maps an XML element name to a function that builds a
//! [`Command`] from that element. Registration is first-wins: a second
//! constructor for an existing name is ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use xmltree::Element;

use super::{Command, ControlCommand, DeviceCommand, DeviceCommandType, ExtensionCommand};
use crate::error::{CommandError, CommandResult};

/// Builds a command from its client-wire element
pub type CommandConstructor = Arc<dyn Fn(&Element) -> CommandResult<Command> + Send + Sync>;

/// Registry of element name → constructor
#[derive(Clone)]
pub struct CommandRegistry {
    constructors: HashMap<String, CommandConstructor>,
}

impl CommandRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry holding every built-in control and device command
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for name in ControlCommand::NAMES {
            registry.register(name, |element| {
                ControlCommand::from_element(element).map(Command::Control)
            });
        }
        for kind in DeviceCommandType::ALL {
            registry.register(kind.as_str(), |element| {
                DeviceCommand::from_element(element).map(Command::Device)
            });
        }
        registry
    }

    /// Register a constructor for `name`
    ///
    /// Returns `false` (and keeps the existing constructor) when the name is
    /// already registered.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> bool
    where
        F: Fn(&Element) -> CommandResult<Command> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(name) {
            debug!(command = name, "Command already registered, keeping the first constructor");
            return false;
        }
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
        true
    }

    /// Register `name` as an extension command carried verbatim
    pub fn register_extension(&mut self, name: &str) -> bool {
        self.register(name, |element| {
            ExtensionCommand::new(element.clone()).map(Command::Extension)
        })
    }

    /// Whether a constructor exists for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered element names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Build the command for `element`, reporting why it failed
    pub fn try_decode(&self, element: &Element) -> CommandResult<Command> {
        let constructor = self
            .constructors
            .get(&element.name)
            .ok_or_else(|| CommandError::Unregistered(element.name.clone()))?;
        let command = constructor(element)?;
        command.validate()?;
        Ok(command)
    }

    /// Build the command for `element`, logging and dropping failures
    pub fn decode(&self, element: &Element) -> Option<Command> {
        match self.try_decode(element) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(element = %element.name, error = %e, "Dropping undecodable command");
                None
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .finish()
    }
}
