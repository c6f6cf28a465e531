//! Device wire: newline-terminated text commands
//!
//! ```text
//! <type> [@<hex-ticks>] <hwInterface> <variable> [args...]\n
//! ```
//!
//! [`LineCodec`] splits the byte stream into lines, [`DeviceCodec`] turns a
//! line into a [`DeviceCommand`] and back.

use std::collections::BTreeSet;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::command::{DeviceCommand, DeviceCommandType};
use crate::error::DeviceCodecError;

/// Hardware interface that addresses the proxy itself
pub const PROXY_INTERFACE: &str = "proxy";

/// Default field separator
pub const DEFAULT_SEPARATOR: char = ' ';

/// Default maximum line length in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

const QUOTE: char = '"';
const TIMESTAMP_PREFIX: char = '@';

// ============================================================================
// DeviceCodec
// ============================================================================

/// Text codec for device commands
#[derive(Debug, Clone)]
pub struct DeviceCodec {
    separator: char,
    interfaces: BTreeSet<String>,
}

impl DeviceCodec {
    /// Create a codec that only knows the reserved `proxy` interface
    pub fn new(separator: char) -> Self {
        let mut interfaces = BTreeSet::new();
        interfaces.insert(PROXY_INTERFACE.to_string());
        Self {
            separator,
            interfaces,
        }
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// Replace the set of known hardware interfaces; `proxy` is always kept
    pub fn set_interfaces<I, S>(&mut self, interfaces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.clear();
        self.interfaces.insert(PROXY_INTERFACE.to_string());
        self.interfaces
            .extend(interfaces.into_iter().map(Into::into));
    }

    pub fn knows_interface(&self, hw_interface: &str) -> bool {
        self.interfaces.contains(hw_interface)
    }

    /// Decode one line (with or without its terminator)
    pub fn decode(&self, line: &str) -> Result<DeviceCommand, DeviceCodecError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut tokens = self.tokenize(line)?.into_iter();

        let kind = match tokens.next() {
            Some(token) => token
                .parse::<DeviceCommandType>()
                .map_err(|_| DeviceCodecError::UnknownType(token))?,
            None => return Err(DeviceCodecError::TooFewTokens(0)),
        };

        let mut rest: Vec<String> = tokens.collect();
        let timestamp = match rest.first() {
            Some(token) if token.starts_with(TIMESTAMP_PREFIX) => {
                let hex = &token[TIMESTAMP_PREFIX.len_utf8()..];
                let ticks = u64::from_str_radix(hex, 16)
                    .map_err(|_| DeviceCodecError::InvalidTimestamp(token.clone()))?;
                rest.remove(0);
                Some(ticks)
            }
            _ => None,
        };

        // type + interface + variable
        let count = rest.len() + 1;
        if count < 3 {
            return Err(DeviceCodecError::TooFewTokens(count));
        }

        let mut rest = rest.into_iter();
        let hw_interface = rest.next().unwrap_or_default();
        let variable = rest.next().unwrap_or_default();
        if !self.knows_interface(&hw_interface) {
            return Err(DeviceCodecError::UnknownInterface(hw_interface));
        }

        let mut command = DeviceCommand::new(kind, hw_interface, variable).with_args(rest);
        command.timestamp = timestamp;
        command.validate()?;
        Ok(command)
    }

    /// Decode a line, logging and dropping it when it is not a valid command
    pub fn decode_line(&self, line: &str) -> Option<DeviceCommand> {
        match self.decode(line) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(line = %line.trim_end(), error = %e, "Dropping device line");
                None
            }
        }
    }

    /// Encode a command as one `\n`-terminated line
    pub fn encode(&self, command: &DeviceCommand) -> Result<String, DeviceCodecError> {
        command.validate()?;
        for identifier in [&command.hw_interface, &command.variable] {
            if identifier.contains(self.separator) || identifier.contains('\n') {
                return Err(DeviceCodecError::SeparatorInIdentifier(identifier.clone()));
            }
        }

        let separator = self.separator.to_string();
        let mut fields = vec![command.kind.as_str().to_string()];
        if let Some(ticks) = command.timestamp {
            fields.push(format!("{TIMESTAMP_PREFIX}{ticks:x}"));
        }
        fields.push(command.hw_interface.clone());
        fields.push(command.variable.clone());
        for arg in &command.args {
            fields.push(self.encode_argument(arg)?);
        }

        let mut line = fields.join(&separator);
        line.push('\n');
        Ok(line)
    }

    fn encode_argument(&self, arg: &str) -> Result<String, DeviceCodecError> {
        if arg.contains('\n') {
            return Err(DeviceCodecError::UnencodableArgument(arg.to_string()));
        }
        let needs_quotes = arg.is_empty() || arg.contains(self.separator) || arg.starts_with(QUOTE);
        if !needs_quotes {
            return Ok(arg.to_string());
        }
        if arg.contains(QUOTE) {
            return Err(DeviceCodecError::UnencodableArgument(arg.to_string()));
        }
        Ok(format!("{QUOTE}{arg}{QUOTE}"))
    }

    /// Split a line on the separator, keeping quoted spans together
    ///
    /// Runs of separators count as one. A quote only opens a span at the
    /// start of a token.
    fn tokenize(&self, line: &str) -> Result<Vec<String>, DeviceCodecError> {
        let mut tokens = Vec::new();
        let mut chars = line.chars().peekable();

        loop {
            while chars.peek() == Some(&self.separator) {
                chars.next();
            }
            let Some(&first) = chars.peek() else {
                break;
            };

            let mut token = String::new();
            if first == QUOTE {
                chars.next();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == QUOTE {
                        closed = true;
                        break;
                    }
                    token.push(c);
                }
                if !closed {
                    return Err(DeviceCodecError::UnterminatedQuote);
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == self.separator {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
            }
            tokens.push(token);
        }

        Ok(tokens)
    }
}

impl Default for DeviceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

// ============================================================================
// LineCodec
// ============================================================================

/// Splits the device byte stream into text lines
///
/// Trailing `\r` is stripped and blank lines are skipped. Lines longer than
/// `max_length` are discarded up to their terminator.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn finish_line(&self, mut line: BytesMut) -> Option<String> {
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_length {
            warn!(length = line.len(), max = self.max_length, "Discarding oversized device line");
            return None;
        }
        match String::from_utf8(line.to_vec()) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(text),
            Err(_) => {
                warn!("Discarding device line that is not valid UTF-8");
                None
            }
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset + 1;
                    self.next_index = 0;
                    if self.discarding {
                        buf.advance(end);
                        self.discarding = false;
                        continue;
                    }
                    let line = buf.split_to(end);
                    if let Some(text) = self.finish_line(line) {
                        return Ok(Some(text));
                    }
                }
                None => {
                    if self.discarding || buf.len() > self.max_length {
                        if !self.discarding {
                            warn!(max = self.max_length, "Device line exceeds maximum length, discarding");
                        }
                        self.discarding = true;
                        buf.clear();
                        self.next_index = 0;
                    } else {
                        self.next_index = buf.len();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        let rest = buf.split();
        Ok(self.finish_line(rest))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        if !line.ends_with('\n') {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> DeviceCodec {
        let mut codec = DeviceCodec::default();
        codec.set_interfaces(["hwiLed", "hwiMotor"]);
        codec
    }

    #[test]
    fn test_decode_set_line() {
        let command = codec().decode("set hwiLed led1 on\n").unwrap();
        assert_eq!(command, DeviceCommand::set("hwiLed", "led1", "on"));
    }

    #[test]
    fn test_decode_timestamp() {
        let command = codec().decode("set @1f4 hwiMotor speed 12").unwrap();
        assert_eq!(command.timestamp, Some(500));
        assert_eq!(command.args, vec!["12"]);
    }

    #[test]
    fn test_decode_rejections() {
        let codec = codec();
        assert_eq!(codec.decode("set hwiLed"), Err(DeviceCodecError::TooFewTokens(2)));
        assert_eq!(codec.decode("set @10 hwiLed"), Err(DeviceCodecError::TooFewTokens(2)));
        assert_eq!(codec.decode(""), Err(DeviceCodecError::TooFewTokens(0)));
        assert!(matches!(codec.decode("put hwiLed led1 on"), Err(DeviceCodecError::UnknownType(_))));
        assert!(matches!(codec.decode("set hwiFoo led1 on"), Err(DeviceCodecError::UnknownInterface(_))));
        assert!(matches!(codec.decode("get @zz hwiLed led1"), Err(DeviceCodecError::InvalidTimestamp(_))));
        assert!(matches!(codec.decode("set hwiLed led1"), Err(DeviceCodecError::InvalidCommand(_))));
    }

    #[test]
    fn test_proxy_interface_always_known() {
        let mut codec = DeviceCodec::default();
        codec.set_interfaces(Vec::<String>::new());
        let command = codec.decode("call proxy message hello").unwrap();
        assert_eq!(command.hw_interface, PROXY_INTERFACE);
    }

    #[test]
    fn test_quoted_arguments() {
        let codec = codec();
        let command = DeviceCommand::call("hwiLed", "label", ["hello world", "", "x"]);
        let line = codec.encode(&command).unwrap();
        assert_eq!(line, "call hwiLed label \"hello world\" \"\" x\n");
        assert_eq!(codec.decode(&line).unwrap(), command);
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            codec().decode("call hwiLed label \"open"),
            Err(DeviceCodecError::UnterminatedQuote)
        );
    }

    #[test]
    fn test_custom_separator() {
        let mut codec = DeviceCodec::new(';');
        codec.set_interfaces(["hwiLed"]);
        let command = DeviceCommand::set("hwiLed", "label", "a b").with_timestamp(255);
        let line = codec.encode(&command).unwrap();
        assert_eq!(line, "set;@ff;hwiLed;label;a b\n");
        assert_eq!(codec.decode(&line).unwrap(), command);
    }

    #[test]
    fn test_encode_rejects_invalid() {
        let codec = codec();
        let invalid = DeviceCommand::new(DeviceCommandType::Set, "hwiLed", "led1");
        assert!(matches!(codec.encode(&invalid), Err(DeviceCodecError::InvalidCommand(_))));

        let bad_name = DeviceCommand::get("hwiLed", "led 1");
        assert!(matches!(codec.encode(&bad_name), Err(DeviceCodecError::SeparatorInIdentifier(_))));

        let bad_arg = DeviceCommand::set("hwiLed", "label", "say \"hi\" now");
        assert!(matches!(codec.encode(&bad_arg), Err(DeviceCodecError::UnencodableArgument(_))));
    }

    #[test]
    fn test_line_codec_partial_input() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("get hwiLed");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b" led1\r\n\nset hwiLed led1 on\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("get hwiLed led1".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("set hwiLed led1 on".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_codec_discards_oversized() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789abc");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"def\nget a b\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("get a b".to_string()));
    }

    #[test]
    fn test_line_codec_eof_flushes_last_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("get hwiLed led1");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("get hwiLed led1".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
