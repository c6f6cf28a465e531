//! Small helpers over `xmltree` shared by the command model and the packet codec.

use std::collections::BTreeMap;
use std::str::FromStr;

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::CommandError;

/// Iterate the element children of `element`, skipping text and comments
pub fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(XMLNode::as_element)
}

/// Trimmed text content of an element, empty when it has none
pub fn text_of(element: &Element) -> String {
    element
        .get_text()
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

/// Text content of an element exactly as sent, empty when it has none
///
/// Whitespace-only bodies are dropped by the XML reader and come back empty.
pub fn raw_text_of(element: &Element) -> String {
    element
        .get_text()
        .map(|text| text.into_owned())
        .unwrap_or_default()
}

/// Build `<name>text</name>`
pub fn text_element(name: &str, text: &str) -> Element {
    let mut element = Element::new(name);
    if !text.is_empty() {
        element.children.push(XMLNode::Text(text.to_string()));
    }
    element
}

/// Look up an attribute by name
pub fn attribute<'a>(element: &'a Element, name: &str) -> Option<&'a str> {
    element.attributes.get(name).map(String::as_str)
}

/// Look up an attribute that must be present
pub fn required_attribute<'a>(element: &'a Element, name: &str) -> Result<&'a str, CommandError> {
    attribute(element, name).ok_or_else(|| CommandError::MissingAttribute {
        element: element.name.clone(),
        attribute: name.to_string(),
    })
}

/// Parse an optional attribute with `FromStr`
pub fn parse_attribute<T: FromStr>(element: &Element, name: &str) -> Result<Option<T>, CommandError> {
    match attribute(element, name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CommandError::InvalidAttribute {
                element: element.name.clone(),
                attribute: name.to_string(),
                value: raw.to_string(),
            }),
    }
}

/// Parse an optional boolean attribute (`true`/`false`/`1`/`0`)
pub fn bool_attribute(element: &Element, name: &str) -> Result<bool, CommandError> {
    match attribute(element, name) {
        None => Ok(false),
        Some(raw) => parse_bool(raw).ok_or_else(|| CommandError::InvalidAttribute {
            element: element.name.clone(),
            attribute: name.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Lenient boolean parsing used on both wires
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read `<info name="key">value</info>` children into a map
pub fn read_info_map(element: &Element) -> BTreeMap<String, String> {
    child_elements(element)
        .filter(|child| child.name == "info")
        .filter_map(|child| {
            let key = attribute(child, "name")?;
            Some((key.to_string(), text_of(child)))
        })
        .collect()
}

/// Append `<info name="key">value</info>` children for every map entry
pub fn write_info_map(element: &mut Element, info: &BTreeMap<String, String>) {
    for (key, value) in info {
        let mut child = text_element("info", value);
        child.attributes.insert("name".to_string(), key.clone());
        element.children.push(XMLNode::Element(child));
    }
}

/// Remove namespace bookkeeping so re-emitted elements stay prefix-free.
///
/// Parsed documents carry their namespace maps along; when an element is
/// embedded into a packet those declarations would be written again on
/// every nested element.
pub fn strip_namespaces(element: &mut Element) {
    element.prefix = None;
    element.namespace = None;
    element.namespaces = None;
    for child in element.children.iter_mut() {
        if let XMLNode::Element(inner) = child {
            strip_namespaces(inner);
        }
    }
}

/// Serialize an element without declaration or indentation
pub fn write_compact(element: &Element) -> Result<String, String> {
    let mut buffer = Vec::new();
    let config = EmitterConfig::new()
        .write_document_declaration(false)
        .perform_indent(false);
    element
        .write_with_config(&mut buffer, config)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_raw_text_keeps_edge_whitespace() {
        let element = Element::parse("<arg>  hi there </arg>".as_bytes()).unwrap();
        assert_eq!(raw_text_of(&element), "  hi there ");
        assert_eq!(text_of(&element), "hi there");
    }

    #[test]
    fn test_info_map_roundtrip() {
        let mut info = BTreeMap::new();
        info.insert("id".to_string(), "qcProxy".to_string());
        info.insert("version".to_string(), "1.0".to_string());

        let mut element = Element::new("handShake");
        write_info_map(&mut element, &info);

        assert_eq!(read_info_map(&element), info);
    }

    #[test]
    fn test_write_compact_has_no_declaration() {
        let element = text_element("arg", "on");
        let xml = write_compact(&element).unwrap();
        assert!(!xml.starts_with("<?xml"));
        assert!(xml.contains("on"));
    }

    #[test]
    fn test_parse_attribute_reports_bad_value() {
        let mut element = Element::new("heartBeat");
        element.attributes.insert("id".to_string(), "abc".to_string());

        let result = parse_attribute::<u64>(&element, "id");
        assert!(matches!(result, Err(CommandError::InvalidAttribute { .. })));
        assert_eq!(parse_attribute::<u64>(&element, "ack").unwrap(), None);
    }
}
