//! # qc-protocol
//!
//! Wire protocols spoken by the qcproxy: the newline-terminated text protocol
//! of the embedded device and the length-prefixed XML packets exchanged with
//! network clients, plus the command model both of them carry.
//!
//! # Features
//!
//! - **Device codec**: `get|set|call [@ticks] <hwInterface> <variable> [args]`
//!   lines with quoting for arguments that contain the separator
//! - **Packet codec**: `tokio-util` codec for `[u16 length][<packet>]` frames
//! - **Command registry**: element name → constructor, open for extension
//!
//! # Quick Start
//!
//! ```rust
//! use qc_protocol::{DeviceCodec, DeviceCommand};
//!
//! let mut codec = DeviceCodec::default();
//! codec.set_interfaces(["hwiLed"]);
//!
//! let command = codec.decode("set hwiLed led1 on\n").unwrap();
//! assert_eq!(command, DeviceCommand::set("hwiLed", "led1", "on"));
//! assert_eq!(codec.encode(&command).unwrap(), "set hwiLed led1 on\n");
//! ```
//!
//! Client packets are framed with [`PacketCodec`], usually through
//! `tokio_util::codec::{FramedRead, FramedWrite}`:
//!
//! ```rust,ignore
//! let registry = Arc::new(CommandRegistry::with_builtins());
//! let mut reader = FramedRead::new(read_half, PacketCodec::new("qcProxy", registry));
//! while let Some(packet) = reader.next().await {
//!     // ...
//! }
//! ```

pub mod command;
pub mod error;
pub mod line;
pub mod packet;
pub mod xml;

pub use command::{
    Command, CommandClass, CommandConstructor, CommandRegistry, ControlCommand, DeviceApi,
    DeviceCommand, DeviceCommandType, DeviceInfo, ExtensionCommand, HandShake, HeartBeat,
    Subscribe, Unsubscribe, WILDCARD,
};
pub use error::{CommandError, CommandResult, DeviceCodecError, PacketError};
pub use line::{DeviceCodec, LineCodec, DEFAULT_MAX_LINE_LENGTH, DEFAULT_SEPARATOR, PROXY_INTERFACE};
pub use packet::{OutgoingPacket, Packet, PacketCodec, PacketId, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Re-exported so users of the registry can build elements without a direct dependency
pub use xmltree::Element;
