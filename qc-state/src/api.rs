//! Device API document loading
//!
//! The Device API is an XML document describing everything the device
//! exposes:
//!
//! ```xml
//! <deviceAPI>
//!   <deviceInfo><name>Thermo</name><positiveAck>true</positiveAck></deviceInfo>
//!   <hardwareInterfaceList>
//!     <hardwareInterface name="hwiTemp" description="Temperature sensor"/>
//!   </hardwareInterfaceList>
//!   <stateVariableList>
//!     <stateVariable name="t0" hwInterface="hwiTemp" access="read">
//!       <type><device>uint</device><user>double</user></type>
//!       <conversion><toUser>value * 0.1 - 40</toUser></conversion>
//!       <autoUpdate side="device">500</autoUpdate>
//!     </stateVariable>
//!   </stateVariableList>
//!   <functionList>
//!     <function name="calibrate" hwInterface="hwiTemp">
//!       <argument name="offset" type="double"/>
//!     </function>
//!   </functionList>
//! </deviceAPI>
//! ```
//!
//! [`load_events`] yields one [`ApiEvent`] per entity in document order;
//! [`ApiCatalog`] collects them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use qc_protocol::xml::{attribute, child_elements, parse_bool, strip_namespaces, text_of};
use qc_protocol::DeviceApi;
use serde::Serialize;
use tracing::{debug, warn};
use xmltree::Element;

use crate::error::{ApiError, ApiResult};
use crate::script::Script;
use crate::value::ValueType;
use crate::variable::{AccessMode, UpdateSide, VariableKey, VariableSpec};

const ROOT: &str = "deviceAPI";
const INTERFACE_LIST: &str = "hardwareInterfaceList";
const VARIABLE_LIST: &str = "stateVariableList";
const FUNCTION_LIST: &str = "functionList";
const DEVICE_INFO: &str = "deviceInfo";

/// Device info key selecting positive set acknowledgment
pub const POSITIVE_ACK_KEY: &str = "positiveAck";

/// A named group of variables and functions on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareInterface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One argument of a device function
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

/// A function the device can execute via `call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSpec {
    pub hw_interface: String,
    pub name: String,
    pub arguments: Vec<FunctionArgument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Entity discovered while loading the document
#[derive(Debug, Clone)]
pub enum ApiEvent {
    DeviceInfo(BTreeMap<String, String>),
    HardwareInterface(HardwareInterface),
    Variable(VariableSpec),
    Function(FunctionSpec),
}

/// Parse the document text and check its root element
pub fn parse_document(text: &str) -> ApiResult<Element> {
    let mut root = Element::parse(text.as_bytes()).map_err(|e| ApiError::Xml(e.to_string()))?;
    strip_namespaces(&mut root);
    if root.name != ROOT {
        return Err(ApiError::UnexpectedRoot(root.name));
    }
    Ok(root)
}

/// Walk a parsed document and produce its entities in document order
///
/// Invalid entities are skipped with a warning. Fails when a mandatory list
/// is missing or no hardware interface is valid.
pub fn load_events(root: &Element) -> ApiResult<Vec<ApiEvent>> {
    if root.get_child(INTERFACE_LIST).is_none() {
        return Err(ApiError::MissingSection(INTERFACE_LIST));
    }
    if root.get_child(VARIABLE_LIST).is_none() {
        return Err(ApiError::MissingSection(VARIABLE_LIST));
    }

    // Variables and functions may only reference declared interfaces
    let interfaces: BTreeSet<String> = child_elements(root)
        .filter(|section| section.name == INTERFACE_LIST)
        .flat_map(child_elements)
        .filter_map(parse_interface)
        .map(|interface| interface.name)
        .collect();
    if interfaces.is_empty() {
        return Err(ApiError::NoInterfaces);
    }

    let mut events = Vec::new();
    for section in child_elements(root) {
        match section.name.as_str() {
            DEVICE_INFO => events.push(ApiEvent::DeviceInfo(parse_device_info(section))),
            INTERFACE_LIST => events.extend(
                child_elements(section)
                    .filter_map(parse_interface)
                    .map(ApiEvent::HardwareInterface),
            ),
            VARIABLE_LIST => events.extend(
                child_elements(section)
                    .filter_map(|element| parse_variable(element, &interfaces))
                    .map(ApiEvent::Variable),
            ),
            FUNCTION_LIST => events.extend(
                child_elements(section)
                    .filter_map(|element| parse_function(element, &interfaces))
                    .map(ApiEvent::Function),
            ),
            other => debug!(section = other, "Ignoring unknown Device API section"),
        }
    }
    Ok(events)
}

// ============================================================================
// Entity parsers
// ============================================================================

/// Attribute or child element text, attribute first
fn field(element: &Element, name: &str) -> Option<String> {
    attribute(element, name)
        .map(|value| value.trim().to_string())
        .or_else(|| element.get_child(name).map(text_of))
        .filter(|value| !value.is_empty())
}

fn parse_device_info(element: &Element) -> BTreeMap<String, String> {
    let mut info: BTreeMap<String, String> = element
        .attributes
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for child in child_elements(element) {
        match (child.name.as_str(), attribute(child, "name")) {
            ("info", Some(key)) => info.insert(key.to_string(), text_of(child)),
            (key, _) => info.insert(key.to_string(), text_of(child)),
        };
    }
    info
}

fn parse_interface(element: &Element) -> Option<HardwareInterface> {
    if element.name != "hardwareInterface" {
        return None;
    }
    let Some(name) = attribute(element, "name").map(str::trim).filter(|name| !name.is_empty()) else {
        warn!("Skipping hardware interface without a name");
        return None;
    };
    Some(HardwareInterface {
        name: name.to_string(),
        description: field(element, "description"),
    })
}

fn parse_variable(element: &Element, interfaces: &BTreeSet<String>) -> Option<VariableSpec> {
    if element.name != "stateVariable" {
        return None;
    }
    let name = field(element, "name");
    let hw_interface = field(element, "hwInterface");
    let (Some(name), Some(hw_interface)) = (name, hw_interface) else {
        warn!("Skipping state variable without name or hwInterface");
        return None;
    };
    let key = VariableKey::new(hw_interface, name);

    if !interfaces.contains(&key.hw_interface) {
        warn!(variable = %key, "Skipping state variable on unknown hardware interface");
        return None;
    }

    let (raw_type, user_type) = match parse_types(element) {
        Ok(types) => types,
        Err(reason) => {
            warn!(variable = %key, reason, "Skipping state variable with invalid type");
            return None;
        }
    };

    let access = match field(element, "access").map(|access| access.parse::<AccessMode>()) {
        None => AccessMode::default(),
        Some(Ok(access)) => access,
        Some(Err(e)) => {
            warn!(variable = %key, error = %e, "Skipping state variable with invalid access");
            return None;
        }
    };

    let conversion = element.get_child("conversion");
    let to_user = compile_script(&key, conversion, "toUser")?;
    let to_device = compile_script(&key, conversion, "toDevice")?;

    let mut spec = VariableSpec::new(key, raw_type)
        .with_types(raw_type, user_type)
        .with_access(access)
        .with_conversion(to_user, to_device);
    spec.description = field(element, "description");

    if let Some(update) = element.get_child("autoUpdate") {
        match parse_auto_update(update) {
            Ok((side, interval)) => spec = spec.with_auto_update(side, interval),
            Err(reason) => warn!(variable = %spec.key, reason, "Ignoring invalid autoUpdate"),
        }
    }

    Some(spec)
}

/// `<type>int</type>`, a `type` attribute, or `<type><device>..</device><user>..</user></type>`
fn parse_types(element: &Element) -> Result<(ValueType, ValueType), &'static str> {
    let parse = |text: &str| text.parse::<ValueType>().map_err(|_| "unknown type name");

    if let Some(single) = attribute(element, "type") {
        let value_type = parse(single)?;
        return Ok((value_type, value_type));
    }

    let type_element = element.get_child("type").ok_or("missing type")?;
    let device = type_element.get_child("device").map(text_of);
    let user = type_element.get_child("user").map(text_of);
    match (device, user) {
        (None, None) => {
            let value_type = parse(&text_of(type_element))?;
            Ok((value_type, value_type))
        }
        (Some(device), Some(user)) => Ok((parse(&device)?, parse(&user)?)),
        (Some(single), None) | (None, Some(single)) => {
            let value_type = parse(&single)?;
            Ok((value_type, value_type))
        }
    }
}

/// `Some(None)` when absent, `None` when the script does not compile
fn compile_script(key: &VariableKey, conversion: Option<&Element>, name: &str) -> Option<Option<Script>> {
    let Some(source) = conversion.and_then(|conversion| field(conversion, name)) else {
        return Some(None);
    };
    match Script::compile(&source) {
        Ok(script) => Some(Some(script)),
        Err(e) => {
            warn!(variable = %key, script = name, error = %e, "Skipping state variable with invalid script");
            None
        }
    }
}

fn parse_auto_update(element: &Element) -> Result<(UpdateSide, Duration), &'static str> {
    let side = match attribute(element, "side").map(|side| side.trim().to_ascii_lowercase()) {
        None => UpdateSide::Device,
        Some(side) if side == "device" => UpdateSide::Device,
        Some(side) if side == "user" => UpdateSide::User,
        Some(_) => return Err("side must be device or user"),
    };
    let millis = field(element, "interval")
        .unwrap_or_else(|| text_of(element))
        .parse::<u64>()
        .map_err(|_| "interval must be a whole number of milliseconds")?;
    if millis == 0 {
        return Err("interval must be positive");
    }
    Ok((side, Duration::from_millis(millis)))
}

fn parse_function(element: &Element, interfaces: &BTreeSet<String>) -> Option<FunctionSpec> {
    if element.name != "function" {
        return None;
    }
    let (Some(name), Some(hw_interface)) = (field(element, "name"), field(element, "hwInterface")) else {
        warn!("Skipping function without name or hwInterface");
        return None;
    };
    if !interfaces.contains(&hw_interface) {
        warn!(function = %name, hw_interface = %hw_interface, "Skipping function on unknown hardware interface");
        return None;
    }

    let mut arguments = Vec::new();
    for argument in child_elements(element).filter(|child| child.name == "argument") {
        let argument_name = field(argument, "name");
        let value_type = field(argument, "type").map(|text| text.parse::<ValueType>());
        match (argument_name, value_type) {
            (Some(argument_name), Some(Ok(value_type))) => arguments.push(FunctionArgument {
                name: argument_name,
                value_type,
            }),
            _ => {
                warn!(function = %name, "Skipping function with invalid argument");
                return None;
            }
        }
    }

    Some(FunctionSpec {
        hw_interface,
        name,
        arguments,
        description: field(element, "description"),
    })
}

// ============================================================================
// ApiCatalog
// ============================================================================

/// Everything the Device API declares, plus the document for clients
#[derive(Debug, Clone, Serialize)]
pub struct ApiCatalog {
    pub device_info: BTreeMap<String, String>,
    pub interfaces: Vec<HardwareInterface>,
    pub variables: Vec<VariableSpec>,
    pub functions: Vec<FunctionSpec>,
    #[serde(skip)]
    document: Element,
}

impl ApiCatalog {
    /// Load from document text
    pub fn parse(text: &str) -> ApiResult<Self> {
        let document = parse_document(text)?;
        let events = load_events(&document)?;
        Ok(Self::from_events(document, events))
    }

    /// Load from a file
    pub fn from_file(path: impl AsRef<Path>) -> ApiResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Collect loader events
    pub fn from_events(document: Element, events: Vec<ApiEvent>) -> Self {
        let mut catalog = Self {
            device_info: BTreeMap::new(),
            interfaces: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            document,
        };
        for event in events {
            match event {
                ApiEvent::DeviceInfo(info) => catalog.device_info.extend(info),
                ApiEvent::HardwareInterface(interface) => {
                    if catalog.interface(&interface.name).is_none() {
                        catalog.interfaces.push(interface);
                    }
                }
                ApiEvent::Variable(spec) => catalog.variables.push(spec),
                ApiEvent::Function(function) => catalog.functions.push(function),
            }
        }
        catalog
    }

    pub fn interface(&self, name: &str) -> Option<&HardwareInterface> {
        self.interfaces.iter().find(|interface| interface.name == name)
    }

    pub fn interface_names(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|interface| interface.name.as_str())
    }

    pub fn function(&self, hw_interface: &str, name: &str) -> Option<&FunctionSpec> {
        self.functions
            .iter()
            .find(|function| function.hw_interface == hw_interface && function.name == name)
    }

    pub fn variable(&self, key: &VariableKey) -> Option<&VariableSpec> {
        self.variables.iter().find(|spec| &spec.key == key)
    }

    /// Whether the device acknowledges sets by echoing them
    pub fn positive_ack(&self) -> Option<bool> {
        self.device_info
            .get(POSITIVE_ACK_KEY)
            .and_then(|value| parse_bool(value))
    }

    /// The document as sent to clients
    pub fn device_api(&self) -> DeviceApi {
        DeviceApi::new(self.document.clone())
    }
}
