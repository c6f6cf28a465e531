//! Control commands exchanged between the proxy and its clients

use std::collections::BTreeMap;

use xmltree::Element;

use crate::error::{CommandError, CommandResult};
use crate::xml;

/// Wildcard accepted by `unSubscribe` (and normalized away by `subscribe`)
pub const WILDCARD: &str = "*";

// ============================================================================
// HandShake
// ============================================================================

/// Identity exchange that moves a connection to `Ready`
///
/// An *info* handshake carries at least an `id` entry; an acknowledgment
/// carries `ack="true"` and may or may not carry info.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandShake {
    pub ack: bool,
    pub info: BTreeMap<String, String>,
}

impl HandShake {
    pub const NAME: &'static str = "handShake";

    /// Info handshake announcing `identity`
    pub fn with_info(identity: BTreeMap<String, String>) -> Self {
        Self { ack: false, info: identity }
    }

    /// Plain positive acknowledgment
    pub fn ack() -> Self {
        Self { ack: true, info: BTreeMap::new() }
    }

    /// Info handshake that also acknowledges the peer's
    pub fn info_ack(identity: BTreeMap<String, String>) -> Self {
        Self { ack: true, info: identity }
    }

    /// Whether this handshake carries peer identity
    pub fn is_info(&self) -> bool {
        self.info.contains_key("id")
    }

    /// The sender's `id` info field
    pub fn id(&self) -> Option<&str> {
        self.info.get("id").map(String::as_str)
    }

    pub fn validate(&self) -> CommandResult<()> {
        if self.is_info() || self.ack {
            Ok(())
        } else {
            Err(CommandError::invalid(Self::NAME, "needs an id info field or ack"))
        }
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new(Self::NAME);
        if self.ack {
            element.attributes.insert("ack".to_string(), "true".to_string());
        }
        xml::write_info_map(&mut element, &self.info);
        element
    }

    fn from_element(element: &Element) -> CommandResult<Self> {
        Ok(Self {
            ack: xml::bool_attribute(element, "ack")?,
            info: xml::read_info_map(element),
        })
    }
}

// ============================================================================
// HeartBeat
// ============================================================================

/// Liveness probe; a reply echoes the probe with `ack` set to its id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    pub id: u64,
    pub ack: u64,
    pub reply: bool,
}

impl HeartBeat {
    pub const NAME: &'static str = "heartBeat";

    pub fn new(id: u64) -> Self {
        Self { id, ack: 0, reply: false }
    }

    /// Clone this heartbeat into its reply
    pub fn to_reply(&self) -> Self {
        Self {
            id: self.id,
            ack: self.id,
            reply: true,
        }
    }

    pub fn validate(&self) -> CommandResult<()> {
        if self.id == 0 {
            return Err(CommandError::invalid(Self::NAME, "id must be non-zero"));
        }
        if self.reply && self.ack == 0 {
            return Err(CommandError::invalid(Self::NAME, "reply must acknowledge a non-zero id"));
        }
        Ok(())
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new(Self::NAME);
        element.attributes.insert("id".to_string(), self.id.to_string());
        if self.reply {
            element.attributes.insert("ack".to_string(), self.ack.to_string());
            element.attributes.insert("reply".to_string(), "true".to_string());
        }
        element
    }

    fn from_element(element: &Element) -> CommandResult<Self> {
        let id = xml::parse_attribute(element, "id")?.ok_or_else(|| CommandError::MissingAttribute {
            element: element.name.clone(),
            attribute: "id".to_string(),
        })?;
        Ok(Self {
            id,
            ack: xml::parse_attribute(element, "ack")?.unwrap_or(0),
            reply: xml::bool_attribute(element, "reply")?,
        })
    }
}

// ============================================================================
// Subscribe / UnSubscribe
// ============================================================================

/// Standing request for periodic pushes of one variable, one interface or everything
///
/// An empty `variable` covers the whole interface, an empty `hw_interface`
/// the whole device. `interval_ms == 0` asks for the proxy's default interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub hw_interface: String,
    pub variable: String,
    pub interval_ms: u64,
}

impl Subscribe {
    pub const NAME: &'static str = "subscribe";

    pub fn new(hw_interface: impl Into<String>, variable: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            hw_interface: normalize_target(hw_interface.into()),
            variable: normalize_target(variable.into()),
            interval_ms,
        }
    }

    pub fn validate(&self) -> CommandResult<()> {
        if self.hw_interface.is_empty() && !self.variable.is_empty() {
            return Err(CommandError::invalid(Self::NAME, "a variable needs its hardware interface"));
        }
        Ok(())
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new(Self::NAME);
        element
            .attributes
            .insert("hwInterface".to_string(), self.hw_interface.clone());
        element
            .attributes
            .insert("variable".to_string(), self.variable.clone());
        element
            .attributes
            .insert("interval".to_string(), self.interval_ms.to_string());
        element
    }

    fn from_element(element: &Element) -> CommandResult<Self> {
        Ok(Self::new(
            xml::attribute(element, "hwInterface").unwrap_or_default(),
            xml::attribute(element, "variable").unwrap_or_default(),
            xml::parse_attribute(element, "interval")?.unwrap_or(0),
        ))
    }
}

fn normalize_target(target: String) -> String {
    if target.trim() == WILDCARD {
        String::new()
    } else {
        target
    }
}

/// Cancel subscriptions; `*` in a position matches any value there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub hw_interface: String,
    pub variable: String,
}

impl Unsubscribe {
    pub const NAME: &'static str = "unSubscribe";

    pub fn new(hw_interface: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            hw_interface: hw_interface.into(),
            variable: variable.into(),
        }
    }

    /// Cancel every subscription of the sender
    pub fn all() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new(Self::NAME);
        element
            .attributes
            .insert("hwInterface".to_string(), self.hw_interface.clone());
        element
            .attributes
            .insert("variable".to_string(), self.variable.clone());
        element
    }

    fn from_element(element: &Element) -> CommandResult<Self> {
        Ok(Self::new(
            xml::attribute(element, "hwInterface").unwrap_or(WILDCARD),
            xml::attribute(element, "variable").unwrap_or(WILDCARD),
        ))
    }
}

// ============================================================================
// Device API / device info
// ============================================================================

/// The Device API document sent to clients; the element is the document root
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceApi {
    pub document: Element,
}

impl DeviceApi {
    pub const NAME: &'static str = "deviceAPI";

    /// Wrap a parsed `deviceAPI` document
    pub fn new(mut document: Element) -> Self {
        xml::strip_namespaces(&mut document);
        document.name = Self::NAME.to_string();
        Self { document }
    }

    /// Parse the API document text
    pub fn parse(text: &str) -> CommandResult<Self> {
        let document = Element::parse(text.as_bytes())
            .map_err(|e| CommandError::invalid(Self::NAME, e.to_string()))?;
        let api = Self::new(document);
        api.validate()?;
        Ok(api)
    }

    pub fn validate(&self) -> CommandResult<()> {
        if self.document.get_child("hardwareInterfaceList").is_none() {
            return Err(CommandError::invalid(Self::NAME, "missing hardwareInterfaceList"));
        }
        Ok(())
    }

    /// Serialize the document back to text
    pub fn to_xml(&self) -> CommandResult<String> {
        xml::write_compact(&self.document).map_err(|e| CommandError::invalid(Self::NAME, e))
    }
}

/// Device identity reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub info: BTreeMap<String, String>,
}

impl DeviceInfo {
    pub const NAME: &'static str = "deviceInfo";

    pub fn new(info: BTreeMap<String, String>) -> Self {
        Self { info }
    }

    fn to_element(&self) -> Element {
        let mut element = Element::new(Self::NAME);
        xml::write_info_map(&mut element, &self.info);
        element
    }
}

// ============================================================================
// ControlCommand
// ============================================================================

/// Every built-in control command
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    HandShake(HandShake),
    HeartBeat(HeartBeat),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    ReqDeviceApi,
    DeviceApi(DeviceApi),
    ReqDeviceInfo,
    DeviceInfo(DeviceInfo),
}

impl ControlCommand {
    pub const REQ_DEVICE_API: &'static str = "reqDeviceAPI";
    pub const REQ_DEVICE_INFO: &'static str = "reqDeviceInfo";

    /// Element names of all built-in control commands
    pub const NAMES: [&'static str; 8] = [
        HandShake::NAME,
        HeartBeat::NAME,
        Subscribe::NAME,
        Unsubscribe::NAME,
        Self::REQ_DEVICE_API,
        DeviceApi::NAME,
        Self::REQ_DEVICE_INFO,
        DeviceInfo::NAME,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HandShake(_) => HandShake::NAME,
            Self::HeartBeat(_) => HeartBeat::NAME,
            Self::Subscribe(_) => Subscribe::NAME,
            Self::Unsubscribe(_) => Unsubscribe::NAME,
            Self::ReqDeviceApi => Self::REQ_DEVICE_API,
            Self::DeviceApi(_) => DeviceApi::NAME,
            Self::ReqDeviceInfo => Self::REQ_DEVICE_INFO,
            Self::DeviceInfo(_) => DeviceInfo::NAME,
        }
    }

    pub fn validate(&self) -> CommandResult<()> {
        match self {
            Self::HandShake(handshake) => handshake.validate(),
            Self::HeartBeat(heartbeat) => heartbeat.validate(),
            Self::Subscribe(subscribe) => subscribe.validate(),
            Self::DeviceApi(api) => api.validate(),
            Self::Unsubscribe(_) | Self::ReqDeviceApi | Self::ReqDeviceInfo | Self::DeviceInfo(_) => Ok(()),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Self::HandShake(handshake) => handshake.to_element(),
            Self::HeartBeat(heartbeat) => heartbeat.to_element(),
            Self::Subscribe(subscribe) => subscribe.to_element(),
            Self::Unsubscribe(unsubscribe) => unsubscribe.to_element(),
            Self::ReqDeviceApi => Element::new(Self::REQ_DEVICE_API),
            Self::DeviceApi(api) => api.document.clone(),
            Self::ReqDeviceInfo => Element::new(Self::REQ_DEVICE_INFO),
            Self::DeviceInfo(info) => info.to_element(),
        }
    }

    /// Build the control command named by the element, then validate it
    pub fn from_element(element: &Element) -> CommandResult<Self> {
        let command = match element.name.as_str() {
            HandShake::NAME => Self::HandShake(HandShake::from_element(element)?),
            HeartBeat::NAME => Self::HeartBeat(HeartBeat::from_element(element)?),
            Subscribe::NAME => Self::Subscribe(Subscribe::from_element(element)?),
            Unsubscribe::NAME => Self::Unsubscribe(Unsubscribe::from_element(element)?),
            Self::REQ_DEVICE_API => Self::ReqDeviceApi,
            DeviceApi::NAME => Self::DeviceApi(DeviceApi::new(element.clone())),
            Self::REQ_DEVICE_INFO => Self::ReqDeviceInfo,
            DeviceInfo::NAME => Self::DeviceInfo(DeviceInfo::new(xml::read_info_map(element))),
            other => return Err(CommandError::Unregistered(other.to_string())),
        };
        command.validate()?;
        Ok(command)
    }
}
