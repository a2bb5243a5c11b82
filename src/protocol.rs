//! Wire protocol for the desktop stream.
//!
//! Binary frames carry a fixed 16-byte header followed by the encoded
//! payload:
//!
//! | offset | bytes | meaning                                 |
//! |--------|-------|-----------------------------------------|
//! | 0      | 4     | ASCII magic `OFRA`                      |
//! | 4      | 4     | width (little-endian i32)               |
//! | 8      | 4     | height (little-endian i32)              |
//! | 12     | 4     | format tag (little-endian i32, 1 = jpeg)|
//! | 16     | N     | payload bytes                           |
//!
//! Text messages are UTF-8 JSON dispatched by their `type` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{FrameFormat, MonitorInfo, RemoteFrame};
use crate::input::{Modifiers, SpecialCombo};
use crate::platform::PointerButton;

pub const FRAME_MAGIC: [u8; 4] = *b"OFRA";
pub const FRAME_HEADER_LEN: usize = 16;

/// Hard cap on a single accepted text message, continuation chunks
/// included.
pub const MAX_TEXT_MESSAGE_BYTES: usize = 65_536;

/// Input events accepted per stream per sliding second.
pub const INPUT_RATE_LIMIT: u32 = 1000;

/// Close codes used on the stream.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_OVERSIZE: u16 = 1009;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame shorter than the {FRAME_HEADER_LEN}-byte header")]
    ShortHeader,

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported format tag: {0}")]
    UnsupportedFormat(i32),
}

/// Decoded binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: i32,
    pub height: i32,
    pub format: FrameFormat,
}

/// Serialize a frame into one binary message, header plus payload.
pub fn encode_frame(frame: &RemoteFrame) -> Vec<u8> {
    let payload: &[u8] = &frame.data;
    let mut message = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    message.extend_from_slice(&FRAME_MAGIC);
    message.extend_from_slice(&(frame.width as i32).to_le_bytes());
    message.extend_from_slice(&(frame.height as i32).to_le_bytes());
    message.extend_from_slice(&frame.format.tag().to_le_bytes());
    message.extend_from_slice(payload);
    message
}

/// Parse a binary message back into header + payload. Frames with an
/// unknown magic or format tag are rejected rather than mis-displayed.
pub fn decode_frame(message: &[u8]) -> Result<(FrameHeader, &[u8]), ProtocolError> {
    if message.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::ShortHeader);
    }
    if message[0..4] != FRAME_MAGIC {
        return Err(ProtocolError::BadMagic);
    }

    let read_i32 = |offset: usize| -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&message[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    };

    let tag = read_i32(12);
    let format = FrameFormat::from_tag(tag).ok_or(ProtocolError::UnsupportedFormat(tag))?;

    Ok((
        FrameHeader {
            width: read_i32(4),
            height: read_i32(8),
            format,
        },
        &message[FRAME_HEADER_LEN..],
    ))
}

/// First text frame sent after the upgrade.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub agent_id: String,
    pub session_id: String,
    pub version: String,
    pub monitors: Vec<MonitorInfo>,
}

impl HelloFrame {
    pub fn new(agent_id: String, session_id: String, monitors: Vec<MonitorInfo>) -> Self {
        Self {
            kind: "hello",
            agent_id,
            session_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            monitors,
        }
    }
}

/// Pushed to the stream when the console session or desktop mode changes
/// (logon, lock, unlock), so clients can adjust their UI without polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: &'static str,
    pub console_session: Option<u32>,
}

impl StateFrame {
    pub fn new(snapshot: &crate::session_state::SessionSnapshot) -> Self {
        Self {
            kind: "state",
            state: snapshot.mode.as_str(),
            console_session: snapshot.session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Down,
    Up,
}

impl Default for KeyAction {
    fn default() -> Self {
        KeyAction::Down
    }
}

/// Text messages accepted from the remote side, dispatched by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PointerMove {
        #[serde(default)]
        dx: i32,
        #[serde(default)]
        dy: i32,
        #[serde(default)]
        absolute: bool,
        #[serde(default)]
        x: i32,
        #[serde(default)]
        y: i32,
    },
    PointerButton {
        button: PointerButton,
        action: crate::input::ButtonAction,
    },
    PointerWheel {
        #[serde(default)]
        delta_x: i32,
        #[serde(default)]
        delta_y: i32,
    },
    Key {
        key_code: u16,
        #[serde(default)]
        action: KeyAction,
        #[serde(flatten)]
        modifiers: Modifiers,
    },
    Text {
        text: String,
        #[serde(flatten)]
        modifiers: Modifiers,
    },
    SpecialKey {
        combo: SpecialCombo,
    },
    MonitorSelect {
        monitor_id: String,
    },
    /// Accepted and ignored; quality is fixed server-side.
    Quality {},
    /// Any unrecognized `type`.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Whether the message counts against the input rate limit.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ClientMessage::PointerMove { .. }
                | ClientMessage::PointerButton { .. }
                | ClientMessage::PointerWheel { .. }
                | ClientMessage::Key { .. }
                | ClientMessage::Text { .. }
                | ClientMessage::SpecialKey { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PooledBytes;
    use crate::input::ButtonAction;

    fn frame(width: u32, height: u32, payload: Vec<u8>) -> RemoteFrame {
        RemoteFrame {
            sequence: 1,
            timestamp_ms: 0,
            width,
            height,
            format: FrameFormat::Jpeg,
            data: PooledBytes::unpooled(payload),
        }
    }

    #[test]
    fn frame_header_round_trips() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = encode_frame(&frame(1920, 1080, payload.clone()));

        let (header, body) = decode_frame(&encoded).unwrap();
        assert_eq!(header.width, 1920);
        assert_eq!(header.height, 1080);
        assert_eq!(header.format, FrameFormat::Jpeg);
        assert_eq!(body, &payload[..]);
    }

    #[test]
    fn header_layout_is_fixed() {
        let encoded = encode_frame(&frame(2, 3, vec![]));
        assert_eq!(&encoded[0..4], b"OFRA");
        assert_eq!(encoded[4..8], 2i32.to_le_bytes());
        assert_eq!(encoded[8..12], 3i32.to_le_bytes());
        assert_eq!(encoded[12..16], 1i32.to_le_bytes());
        assert_eq!(encoded.len(), FRAME_HEADER_LEN);
    }

    #[test]
    fn bad_magic_and_short_frames_are_rejected() {
        assert_eq!(decode_frame(b"OFR").unwrap_err(), ProtocolError::ShortHeader);

        let mut encoded = encode_frame(&frame(1, 1, vec![0]));
        encoded[0] = b'X';
        assert_eq!(decode_frame(&encoded).unwrap_err(), ProtocolError::BadMagic);
    }

    #[test]
    fn reserved_format_tags_are_rejected() {
        let mut encoded = encode_frame(&frame(1, 1, vec![0]));
        encoded[12..16].copy_from_slice(&2i32.to_le_bytes());
        assert_eq!(
            decode_frame(&encoded).unwrap_err(),
            ProtocolError::UnsupportedFormat(2)
        );
    }

    #[test]
    fn parses_pointer_move_variants() {
        let relative: ClientMessage =
            serde_json::from_str(r#"{"type":"pointer_move","dx":5,"dy":-3}"#).unwrap();
        assert_eq!(
            relative,
            ClientMessage::PointerMove {
                dx: 5,
                dy: -3,
                absolute: false,
                x: 0,
                y: 0,
            }
        );

        let absolute: ClientMessage = serde_json::from_str(
            r#"{"type":"pointer_move","absolute":true,"x":100,"y":200}"#,
        )
        .unwrap();
        assert!(matches!(
            absolute,
            ClientMessage::PointerMove { absolute: true, x: 100, y: 200, .. }
        ));
    }

    #[test]
    fn parses_key_with_modifier_flags() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type":"key","key_code":65,"action":"up","ctrl":true,"shift":true}"#,
        )
        .unwrap();
        let ClientMessage::Key { key_code, action, modifiers } = message else {
            panic!("wrong variant");
        };
        assert_eq!(key_code, 65);
        assert_eq!(action, KeyAction::Up);
        assert!(modifiers.ctrl && modifiers.shift && !modifiers.alt && !modifiers.win);
    }

    #[test]
    fn key_action_defaults_to_down() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"key","key_code":13}"#).unwrap();
        assert!(matches!(
            message,
            ClientMessage::Key { action: KeyAction::Down, .. }
        ));
    }

    #[test]
    fn parses_button_wheel_monitor_and_special() {
        let button: ClientMessage = serde_json::from_str(
            r#"{"type":"pointer_button","button":"right","action":"down"}"#,
        )
        .unwrap();
        assert_eq!(
            button,
            ClientMessage::PointerButton {
                button: PointerButton::Right,
                action: ButtonAction::Down,
            }
        );

        let wheel: ClientMessage =
            serde_json::from_str(r#"{"type":"pointer_wheel","delta_y":-120}"#).unwrap();
        assert_eq!(wheel, ClientMessage::PointerWheel { delta_x: 0, delta_y: -120 });

        let select: ClientMessage =
            serde_json::from_str(r#"{"type":"monitor_select","monitor_id":"DISPLAY2"}"#)
                .unwrap();
        assert_eq!(
            select,
            ClientMessage::MonitorSelect { monitor_id: "DISPLAY2".to_string() }
        );

        let combo: ClientMessage =
            serde_json::from_str(r#"{"type":"special_key","combo":"ctrl_alt_del"}"#).unwrap();
        assert_eq!(combo, ClientMessage::SpecialKey { combo: SpecialCombo::CtrlAltDel });
    }

    #[test]
    fn unknown_types_parse_to_unknown() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"telemetry","x":1}"#).unwrap();
        assert_eq!(message, ClientMessage::Unknown);
        assert!(!message.is_input());
    }

    #[test]
    fn quality_is_accepted_and_not_input() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"quality","preset":"high"}"#).unwrap();
        assert_eq!(message, ClientMessage::Quality {});
        assert!(!message.is_input());
    }

    #[test]
    fn input_classification_covers_all_input_types() {
        let inputs = [
            r#"{"type":"pointer_move","dx":1,"dy":1}"#,
            r#"{"type":"pointer_button","button":"left","action":"up"}"#,
            r#"{"type":"pointer_wheel","delta_y":1}"#,
            r#"{"type":"key","key_code":65}"#,
            r#"{"type":"text","text":"hi"}"#,
            r#"{"type":"special_key","combo":"win_l"}"#,
        ];
        for raw in inputs {
            let message: ClientMessage = serde_json::from_str(raw).unwrap();
            assert!(message.is_input(), "{raw}");
        }

        let select: ClientMessage =
            serde_json::from_str(r#"{"type":"monitor_select","monitor_id":"DISPLAY1"}"#)
                .unwrap();
        assert!(!select.is_input());
    }

    #[test]
    fn hello_frame_uses_camel_case_keys() {
        let hello = HelloFrame::new("agent-1".into(), "session-1".into(), vec![]);
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["agentId"], "agent-1");
        assert_eq!(json["sessionId"], "session-1");
        assert!(json["monitors"].as_array().unwrap().is_empty());
        assert!(!json["version"].as_str().unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>("{not json").is_err());
    }

    #[test]
    fn state_frame_carries_mode_and_session() {
        use crate::session_state::{DesktopMode, SessionSnapshot};

        let frame = StateFrame::new(&SessionSnapshot {
            session_id: Some(2),
            mode: DesktopMode::Locked,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"], "locked");
        assert_eq!(json["consoleSession"], 2);
    }
}
