//! State variable definitions and their current values

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::ValueError;
use crate::script::Script;
use crate::value::{Value, ValueType};

/// Identity of a state variable: `(hardwareInterface, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VariableKey {
    pub hw_interface: String,
    pub name: String,
}

impl VariableKey {
    pub fn new(hw_interface: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hw_interface: hw_interface.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.hw_interface, self.name)
    }
}

/// Direction in which a variable's value may flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// device → proxy → client only
    Read,
    /// client → proxy → device only
    Write,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::ReadWrite => write!(f, "readwrite"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "r" | "readonly" => Ok(Self::Read),
            "write" | "w" | "writeonly" => Ok(Self::Write),
            "readwrite" | "read-write" | "rw" => Ok(Self::ReadWrite),
            _ => Err(ValueError::UnknownAccess(s.to_string())),
        }
    }
}

/// Which side an `autoUpdate` interval applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSide {
    /// The proxy polls the device with `get` at this interval
    Device,
    /// Default push interval for clients subscribing to this variable
    User,
}

/// Periodic update declared in the Device API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutoUpdate {
    pub side: UpdateSide,
    #[serde(rename = "interval_ms", serialize_with = "serialize_millis")]
    pub interval: Duration,
}

fn serialize_millis<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(interval.as_millis() as u64)
}

/// Definition of a state variable as loaded from the Device API
#[derive(Debug, Clone, Serialize)]
pub struct VariableSpec {
    pub key: VariableKey,
    pub raw_type: ValueType,
    pub user_type: ValueType,
    pub access: AccessMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user: Option<Script>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_device: Option<Script>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<AutoUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VariableSpec {
    /// Read-write variable with the same raw and user type and no scripts
    pub fn new(key: VariableKey, value_type: ValueType) -> Self {
        Self {
            key,
            raw_type: value_type,
            user_type: value_type,
            access: AccessMode::default(),
            to_user: None,
            to_device: None,
            auto_update: None,
            description: None,
        }
    }

    pub fn with_types(mut self, raw_type: ValueType, user_type: ValueType) -> Self {
        self.raw_type = raw_type;
        self.user_type = user_type;
        self
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn with_conversion(mut self, to_user: Option<Script>, to_device: Option<Script>) -> Self {
        self.to_user = to_user;
        self.to_device = to_device;
        self
    }

    pub fn with_auto_update(mut self, side: UpdateSide, interval: Duration) -> Self {
        self.auto_update = Some(AutoUpdate { side, interval });
        self
    }

    /// Interval at which the proxy should poll the device, if any
    pub fn device_poll_interval(&self) -> Option<Duration> {
        self.auto_update
            .filter(|update| update.side == UpdateSide::Device)
            .map(|update| update.interval)
    }

    /// Default push interval for client subscriptions, if declared
    pub fn user_push_interval(&self) -> Option<Duration> {
        self.auto_update
            .filter(|update| update.side == UpdateSide::User)
            .map(|update| update.interval)
    }
}

/// A state variable with its current raw and user values
#[derive(Debug, Clone)]
pub struct StateVariable {
    spec: VariableSpec,
    pub(crate) raw: Option<Value>,
    pub(crate) user: Option<Value>,
    pub(crate) last_update: Option<DateTime<Utc>>,
}

impl StateVariable {
    pub fn new(spec: VariableSpec) -> Self {
        Self {
            spec,
            raw: None,
            user: None,
            last_update: None,
        }
    }

    pub fn key(&self) -> &VariableKey {
        &self.spec.key
    }

    pub fn spec(&self) -> &VariableSpec {
        &self.spec
    }

    pub fn access(&self) -> AccessMode {
        self.spec.access
    }

    pub fn raw_value(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    pub fn user_value(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    /// When the raw side last changed
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}
