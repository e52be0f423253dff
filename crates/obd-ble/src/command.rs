//! OBD Command Descriptors and Responses

use crate::error::DecodeError;
use crate::frame::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{debug, info};

/// Decoding function of a command
pub type Decoder = fn(&[Message]) -> Result<ObdValue, DecodeError>;

/// A decoded reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObdValue {
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Several named quantities from one response
    Fields(BTreeMap<String, f64>),
}

impl ObdValue {
    /// Numeric value, if this is a single number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ObdValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

/// How a message's data was resized to the descriptor's expected length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthAdjustment {
    /// Zero bytes appended on the right
    Padded { from: usize, to: usize },
    /// Bytes chopped off the right
    Truncated { from: usize, to: usize },
}

/// Immutable definition of one queryable command
#[derive(Clone)]
pub struct CommandDescriptor {
    name: String,
    description: String,
    header: Vec<u8>,
    command: Vec<u8>,
    bytes: usize,
    decoder: Decoder,
    fast: bool,
}

impl CommandDescriptor {
    /// Create a descriptor
    ///
    /// # Arguments
    /// * `header` - CAN header to address, e.g. `b"7DF"`, empty for the adapter default
    /// * `command` - bytes sent to the adapter, e.g. `b"010C"`
    /// * `bytes` - expected payload length, 0 disables normalization
    pub fn new(
        name: &str,
        description: &str,
        header: &[u8],
        command: &[u8],
        bytes: usize,
        decoder: Decoder,
        fast: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            header: header.to_vec(),
            command: command.to_vec(),
            bytes,
            decoder,
            fast,
        }
    }

    /// Same command addressed to another header; the result is a distinct descriptor
    pub fn with_header(&self, header: &[u8]) -> Self {
        Self {
            header: header.to_vec(),
            ..self.clone()
        }
    }

    /// Catalog key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// CAN request header, empty for adapter commands
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Bytes written to the adapter
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// Expected payload length
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether a response frame count may be appended to make the adapter return early
    pub fn fast(&self) -> bool {
        self.fast
    }

    /// Service mode, when the command is hex
    pub fn mode(&self) -> Option<u8> {
        if self.command.len() >= 2 && self.is_hex() {
            u8::from_str_radix(std::str::from_utf8(&self.command[..2]).ok()?, 16).ok()
        } else {
            None
        }
    }

    /// Parameter ID following the mode, when the command is hex and at most
    /// 16 digits follow the mode
    pub fn pid(&self) -> Option<u64> {
        if self.command.len() > 2 && self.is_hex() {
            u64::from_str_radix(std::str::from_utf8(&self.command[2..]).ok()?, 16).ok()
        } else {
            None
        }
    }

    fn is_hex(&self) -> bool {
        self.command.iter().all(u8::is_ascii_hexdigit)
    }

    /// Normalize every message to the expected length and decode them
    pub fn apply(&self, mut messages: Vec<Message>) -> Response {
        let adjustments = messages
            .iter_mut()
            .filter_map(|m| self.constrain(m))
            .collect();

        let value = if messages.is_empty() {
            info!("{} did not receive any acceptable messages", self);
            None
        } else {
            match (self.decoder)(&messages) {
                Ok(value) => Some(value),
                Err(e) => {
                    info!("{} could not decode response: {}", self, e);
                    None
                }
            }
        };

        Response {
            command: self.clone(),
            messages,
            value,
            adjustments,
        }
    }

    fn constrain(&self, message: &mut Message) -> Option<LengthAdjustment> {
        let len = message.data.len();
        if self.bytes == 0 || len == self.bytes {
            return None;
        }

        message.data.resize(self.bytes, 0);
        let adjustment = if len > self.bytes {
            LengthAdjustment::Truncated {
                from: len,
                to: self.bytes,
            }
        } else {
            LengthAdjustment::Padded {
                from: len,
                to: self.bytes,
            }
        };
        debug!("{} message resized: {:?}", self.name, adjustment);
        Some(adjustment)
    }
}

impl PartialEq for CommandDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.command == other.command
    }
}

impl Eq for CommandDescriptor {}

impl Hash for CommandDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.header.hash(state);
        self.command.hash(state);
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}: {}",
            String::from_utf8_lossy(&self.header),
            String::from_utf8_lossy(&self.command),
            self.description
        )
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("header", &String::from_utf8_lossy(&self.header))
            .field("command", &String::from_utf8_lossy(&self.command))
            .field("bytes", &self.bytes)
            .field("fast", &self.fast)
            .finish()
    }
}

/// Outcome of one command
#[derive(Debug, Clone)]
pub struct Response {
    /// Descriptor that produced this response
    pub command: CommandDescriptor,
    /// Messages after length normalization
    pub messages: Vec<Message>,
    /// Decoded value, `None` when no usable data came back
    pub value: Option<ObdValue>,
    /// Length normalizations applied before decoding
    pub adjustments: Vec<LengthAdjustment>,
}

impl Response {
    /// Response carrying no data
    pub fn empty(command: &CommandDescriptor) -> Self {
        Self {
            command: command.clone(),
            messages: Vec::new(),
            value: None,
            adjustments: Vec::new(),
        }
    }

    /// Whether nothing could be decoded
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanProtocol;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn first_byte(messages: &[Message]) -> Result<ObdValue, DecodeError> {
        let data = &messages[0].data;
        data.get(2)
            .map(|b| ObdValue::Number(*b as f64))
            .ok_or(DecodeError::TooShort {
                needed: 3,
                actual: data.len(),
            })
    }

    fn descriptor(header: &[u8], command: &[u8], bytes: usize) -> CommandDescriptor {
        CommandDescriptor::new("speed", "Vehicle speed", header, command, bytes, first_byte, true)
    }

    fn message(data: Vec<u8>) -> Message {
        Message {
            sender: 0x7E8,
            data,
            frames: Vec::new(),
        }
    }

    fn hash_of(cmd: &CommandDescriptor) -> u64 {
        let mut hasher = DefaultHasher::new();
        cmd.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_mode_and_pid() {
        let cmd = descriptor(b"7DF", b"010D", 3);
        assert_eq!(cmd.mode(), Some(0x01));
        assert_eq!(cmd.pid(), Some(0x0D));

        let long = descriptor(b"79B", b"22010203040506", 0);
        assert_eq!(long.pid(), Some(0x0102_0304_0506));

        let at = descriptor(b"", b"ATRV", 0);
        assert_eq!(at.mode(), None);
        assert_eq!(at.pid(), None);
    }

    #[test]
    fn test_identity_is_header_and_command() {
        let a = descriptor(b"7DF", b"010D", 3);
        let b = CommandDescriptor::new("other", "other", b"7DF", b"010D", 9, first_byte, false);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        assert_ne!(a, descriptor(b"79B", b"010D", 3));
        assert_ne!(a, descriptor(b"7DF", b"010C", 3));
    }

    #[test]
    fn test_with_header_is_distinct() {
        let a = descriptor(b"7DF", b"010D", 3);
        let b = a.with_header(b"7E0");
        assert_ne!(a, b);
        assert_eq!(a.header(), b"7DF");
        assert_eq!(b.header(), b"7E0");
    }

    #[test]
    fn test_apply_decodes() {
        let cmd = descriptor(b"7DF", b"010D", 3);
        let reassembly = CanProtocol::default().parse(&["7E803410D37"]);
        let response = cmd.apply(reassembly.messages);
        assert_eq!(response.value, Some(ObdValue::Number(55.0)));
        assert!(response.adjustments.is_empty());
    }

    #[test]
    fn test_apply_empty_has_no_value() {
        let cmd = descriptor(b"7DF", b"010D", 3);
        let response = cmd.apply(Vec::new());
        assert!(response.messages.is_empty());
        assert!(response.is_null());
    }

    #[test]
    fn test_apply_records_adjustments() {
        let cmd = descriptor(b"7DF", b"010D", 3);
        let response = cmd.apply(vec![message(vec![0x41, 0x0D]), message(vec![0x41, 0x0D, 1, 2])]);
        assert_eq!(
            response.adjustments,
            vec![
                LengthAdjustment::Padded { from: 2, to: 3 },
                LengthAdjustment::Truncated { from: 4, to: 3 },
            ]
        );
        assert_eq!(response.messages[0].data, vec![0x41, 0x0D, 0x00]);
        assert_eq!(response.messages[1].data, vec![0x41, 0x0D, 0x01]);
    }

    #[test]
    fn test_decode_failure_is_absent_value() {
        let cmd = descriptor(b"7DF", b"010D", 0);
        let response = cmd.apply(vec![message(vec![0x41])]);
        assert_eq!(response.messages.len(), 1);
        assert!(response.is_null());
    }

    proptest! {
        #[test]
        fn prop_normalized_length(expected in 1usize..64, data in proptest::collection::vec(any::<u8>(), 0..96)) {
            let cmd = descriptor(b"7DF", b"010D", expected);
            let response = cmd.apply(vec![message(data.clone())]);
            let normalized = &response.messages[0].data;

            prop_assert_eq!(normalized.len(), expected);
            let kept = data.len().min(expected);
            prop_assert_eq!(&normalized[..kept], &data[..kept]);
            prop_assert!(normalized[kept..].iter().all(|b| *b == 0));
        }

        #[test]
        fn prop_identity_tracks_header_and_command(
            h1 in "[0-9A-F]{3}", h2 in "[0-9A-F]{3}",
            c1 in "[0-9A-F]{4}", c2 in "[0-9A-F]{4}",
        ) {
            let a = descriptor(h1.as_bytes(), c1.as_bytes(), 3);
            let b = descriptor(h2.as_bytes(), c2.as_bytes(), 3);
            prop_assert_eq!(a == b, h1 == h2 && c1 == c2);
            if a == b {
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
        }
    }
}
