//! Wire-level examples for both protocols

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rstest::rstest;
use tokio_util::codec::Decoder;

use qc_protocol::{
    Command, CommandRegistry, ControlCommand, DeviceCodec, DeviceCodecError, DeviceCommand,
    DeviceCommandType, Element, ExtensionCommand, HeartBeat, PacketCodec, PacketId, Subscribe,
    Unsubscribe,
};

fn device_codec() -> DeviceCodec {
    let mut codec = DeviceCodec::default();
    codec.set_interfaces(["hwiLed", "hwiMotor"]);
    codec
}

fn framed(payload: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload.as_bytes());
    buf
}

fn decode_one(codec: &mut PacketCodec, payload: &str) -> Option<Vec<Command>> {
    let mut buf = framed(payload);
    codec.decode(&mut buf).unwrap().map(|packet| packet.commands)
}

// ============================================================================
// Device lines
// ============================================================================

#[test]
fn test_set_line_example() {
    let command = device_codec().decode("set hwiLed led1 on\n").unwrap();

    assert_eq!(command.kind, DeviceCommandType::Set);
    assert_eq!(command.hw_interface, "hwiLed");
    assert_eq!(command.variable, "led1");
    assert_eq!(command.args, vec!["on".to_string()]);
    assert_eq!(command.timestamp, None);
}

#[rstest]
#[case("get hwiLed led1", DeviceCommandType::Get, None, 0)]
#[case("get @ff hwiLed led1", DeviceCommandType::Get, Some(255), 0)]
#[case("call hwiMotor move 10 20 30", DeviceCommandType::Call, None, 3)]
#[case("set  hwiMotor   speed  5", DeviceCommandType::Set, None, 1)]
#[case("call @0 proxy greeting name=board", DeviceCommandType::Call, Some(0), 1)]
fn test_valid_device_lines(
    #[case] line: &str,
    #[case] kind: DeviceCommandType,
    #[case] timestamp: Option<u64>,
    #[case] arg_count: usize,
) {
    let command = device_codec().decode(line).unwrap();
    assert_eq!(command.kind, kind);
    assert_eq!(command.timestamp, timestamp);
    assert_eq!(command.args.len(), arg_count);
}

#[rstest]
#[case("hwiLed led1 on")]
#[case("set hwiLed")]
#[case("set hwiUnknown led1 on")]
#[case("get @xyz hwiLed led1")]
#[case("set hwiLed led1")]
#[case("")]
fn test_rejected_device_lines(#[case] line: &str) {
    let codec = device_codec();
    assert!(codec.decode(line).is_err());
    assert!(codec.decode_line(line).is_none());
}

#[test]
fn test_unknown_type_error() {
    assert_eq!(
        device_codec().decode("hwiLed led1 on"),
        Err(DeviceCodecError::UnknownType("hwiLed".to_string()))
    );
}

// ============================================================================
// Client packets
// ============================================================================

#[test]
fn test_framed_heartbeat_example() {
    let mut codec = PacketCodec::new("qcProxy", Arc::new(CommandRegistry::with_builtins()));
    let payload = "<packet id=\"qcProxy#1\"><heartBeat id=\"1\"/></packet>";
    let mut buf = framed(payload);
    assert_eq!(u16::from_be_bytes([buf[0], buf[1]]) as usize, payload.len());

    let packet = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(packet.id, PacketId::new("qcProxy", 1));
    assert_eq!(packet.commands, vec![Command::from(HeartBeat::new(1))]);
}

#[rstest]
#[case("<packet id=\"gui#1\"><subscribe hwInterface=\"hwiLed\" variable=\"*\" interval=\"250\"/></packet>",
       Command::from(Subscribe::new("hwiLed", "", 250)))]
#[case("<packet id=\"gui#1\"><unSubscribe hwInterface=\"*\" variable=\"*\"/></packet>",
       Command::from(Unsubscribe::all()))]
#[case("<packet id=\"gui#1\"><reqDeviceAPI/></packet>",
       Command::Control(ControlCommand::ReqDeviceApi))]
#[case("<packet id=\"gui#1\"><reqDeviceInfo/></packet>",
       Command::Control(ControlCommand::ReqDeviceInfo))]
#[case("<packet id=\"gui#1\"><set hwInterface=\"hwiLed\" variable=\"led1\"><arg>on</arg></set></packet>",
       Command::from(DeviceCommand::set("hwiLed", "led1", "on")))]
#[case("<packet id=\"gui#1\"><heartBeat id=\"3\" ack=\"3\" reply=\"true\"/></packet>",
       Command::from(HeartBeat::new(3).to_reply()))]
fn test_client_commands(#[case] payload: &str, #[case] expected: Command) {
    let mut codec = PacketCodec::new("qcProxy", Arc::new(CommandRegistry::with_builtins()));
    assert_eq!(decode_one(&mut codec, payload), Some(vec![expected]));
}

#[test]
fn test_extension_commands_need_registration() {
    let payload = "<packet id=\"gui#1\"><ping seq=\"4\"/></packet>";

    let mut plain = PacketCodec::new("qcProxy", Arc::new(CommandRegistry::with_builtins()));
    assert_eq!(decode_one(&mut plain, payload), None);

    let mut registry = CommandRegistry::with_builtins();
    registry.register_extension("ping");
    let mut extended = PacketCodec::new("qcProxy", Arc::new(registry));

    let commands = decode_one(&mut extended, payload).unwrap();
    let mut expected = Element::new("ping");
    expected
        .attributes
        .insert("seq".to_string(), "4".to_string());
    assert_eq!(
        commands,
        vec![Command::from(ExtensionCommand::new(expected).unwrap())]
    );
}
