//! ISO 15765-4 Frame Parsing and ISO-TP Reassembly
//!
//! With headers on (`ATH1`), spaces off (`ATS0`) and CAN auto-formatting off
//! (`ATCAF0`) the adapter prints one CAN frame per line as contiguous hex:
//! the identifier followed by up to eight data bytes, the first of which is
//! the ISO-TP protocol control information (PCI).
//!
//! ```text
//! 7BB 03 61 01 5C          single frame, 3 payload bytes
//! 7BB 10 0C 61 01 .. ..    first frame, 12 byte message
//! 7BB 21 .. .. .. .. ..    consecutive frame, sequence 1
//! ```

use crate::protocol::{AddressingMode, ObdProtocol};
use tracing::{debug, warn};

/// Maximum data bytes in a classic CAN frame
const MAX_FRAME_BYTES: usize = 8;
/// Largest payload a single frame carries; anything longer needs a first frame
const SINGLE_FRAME_CAPACITY: usize = MAX_FRAME_BYTES - 1;

/// ISO-TP protocol control information of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    /// Complete message of `len` bytes
    Single { len: usize },
    /// Start of a message of `len` bytes
    First { len: usize },
    /// Continuation with 4-bit sequence number
    Consecutive { seq: u8 },
    /// Flow control, carries no payload
    FlowControl,
}

/// One CAN frame as printed by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// CAN identifier of the sending ECU
    pub sender: u32,
    /// Frame type and its length or sequence field
    pub pci: Pci,
    /// Payload bytes following the PCI
    pub data: Vec<u8>,
    /// Line as received from the adapter
    pub raw: String,
}

/// A complete ISO-TP payload from one sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// CAN identifier of the sending ECU
    pub sender: u32,
    /// Payload bytes; a command descriptor may pad or truncate these once before decoding
    pub data: Vec<u8>,
    /// Frames that produced this message, in arrival order
    pub frames: Vec<Frame>,
}

impl Message {
    /// Raw adapter lines of every frame, newline separated
    pub fn raw(&self) -> String {
        self.frames
            .iter()
            .map(|f| f.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of one reassembly pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reassembly {
    /// Completed messages, ordered by first appearance of their sender
    pub messages: Vec<Message>,
    /// Lines that were not CAN frames (status strings such as `NO DATA`)
    pub unparsed: Vec<String>,
}

/// Pending multi-frame message for one sender
struct Pending {
    len: usize,
    next_seq: u8,
    data: Vec<u8>,
    frames: Vec<Frame>,
}

/// CAN line parser and ISO-TP reassembler for one protocol variant
#[derive(Debug, Clone, Copy)]
pub struct CanProtocol {
    protocol: ObdProtocol,
}

impl CanProtocol {
    /// Reassembler for the given CAN variant
    pub fn new(protocol: ObdProtocol) -> Self {
        Self { protocol }
    }

    /// CAN variant whose header width is used
    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Turn adapter lines into frames and complete messages
    ///
    /// Consecutive frames must carry the expected sequence number; a gap or
    /// reordering discards that sender's pending message.
    pub fn parse<S: AsRef<str>>(&self, lines: &[S]) -> Reassembly {
        let mut unparsed = Vec::new();
        let mut senders: Vec<(u32, Vec<Message>)> = Vec::new();
        let mut pending: Vec<(u32, Pending)> = Vec::new();

        for line in lines {
            let line = line.as_ref();
            let frame = match self.parse_frame(line) {
                Some(frame) => frame,
                None => {
                    unparsed.push(line.to_string());
                    continue;
                }
            };

            let sender = frame.sender;
            if !senders.iter().any(|(s, _)| *s == sender) {
                senders.push((sender, Vec::new()));
            }

            let pci = frame.pci;
            let completed = match pci {
                Pci::Single { len } => {
                    let mut data = frame.data.clone();
                    data.truncate(len);
                    Some(Message {
                        sender,
                        data,
                        frames: vec![frame],
                    })
                }
                Pci::First { len } => {
                    if pending.iter().any(|(s, _)| *s == sender) {
                        warn!("First frame from {:X} restarts an incomplete message", sender);
                    }
                    pending.retain(|(s, _)| *s != sender);
                    pending.push((
                        sender,
                        Pending {
                            len,
                            next_seq: 1,
                            data: frame.data.clone(),
                            frames: vec![frame],
                        },
                    ));
                    take_complete(&mut pending, sender)
                }
                Pci::Consecutive { seq } => {
                    match pending.iter_mut().find(|(s, _)| *s == sender) {
                        Some((_, p)) if p.next_seq == seq => {
                            p.data.extend_from_slice(&frame.data);
                            p.frames.push(frame);
                            p.next_seq = (p.next_seq + 1) & 0x0F;
                            take_complete(&mut pending, sender)
                        }
                        Some((_, p)) => {
                            warn!(
                                "Frame sequence gap from {:X}: expected {}, got {}; dropping message",
                                sender, p.next_seq, seq
                            );
                            pending.retain(|(s, _)| *s != sender);
                            None
                        }
                        None => {
                            debug!("Consecutive frame from {:X} without first frame", sender);
                            None
                        }
                    }
                }
                Pci::FlowControl => None,
            };

            if let Some(message) = completed {
                if let Some((_, messages)) = senders.iter_mut().find(|(s, _)| *s == sender) {
                    messages.push(message);
                }
            }
        }

        for (sender, p) in &pending {
            debug!(
                "Dropping incomplete message from {:X} ({} of {} bytes)",
                sender,
                p.data.len(),
                p.len
            );
        }

        Reassembly {
            messages: senders.into_iter().flat_map(|(_, m)| m).collect(),
            unparsed,
        }
    }

    /// Parse a single adapter line, `None` if it is not a well-formed frame
    pub fn parse_frame(&self, line: &str) -> Option<Frame> {
        let header_digits = self.protocol.addressing().header_digits();
        let line = line.trim();

        if line.len() <= header_digits || !line.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let (header, body) = line.split_at(header_digits);
        if body.len() % 2 != 0 {
            debug!("Dropping frame with odd length: {}", line);
            return None;
        }

        let sender = u32::from_str_radix(header, 16).ok()?;
        if self.protocol.addressing() == AddressingMode::Standard11Bit && sender > 0x7FF {
            return None;
        }

        let bytes = decode_hex(body)?;
        if bytes.is_empty() || bytes.len() > MAX_FRAME_BYTES {
            debug!("Dropping frame with {} data bytes: {}", bytes.len(), line);
            return None;
        }

        let pci_byte = bytes[0];
        let (pci, data) = match pci_byte >> 4 {
            0x0 => {
                let len = (pci_byte & 0x0F) as usize;
                if len == 0 || len > bytes.len() - 1 {
                    debug!("Single frame declares {} bytes: {}", len, line);
                    return None;
                }
                (Pci::Single { len }, bytes[1..].to_vec())
            }
            0x1 => {
                if bytes.len() < 2 {
                    return None;
                }
                let len = (((pci_byte & 0x0F) as usize) << 8) | bytes[1] as usize;
                if len <= SINGLE_FRAME_CAPACITY {
                    debug!("First frame declares only {} bytes: {}", len, line);
                    return None;
                }
                (Pci::First { len }, bytes[2..].to_vec())
            }
            0x2 => (
                Pci::Consecutive {
                    seq: pci_byte & 0x0F,
                },
                bytes[1..].to_vec(),
            ),
            0x3 => (Pci::FlowControl, Vec::new()),
            _ => {
                debug!("Unknown PCI {:02X}: {}", pci_byte, line);
                return None;
            }
        };

        Some(Frame {
            sender,
            pci,
            data,
            raw: line.to_string(),
        })
    }
}

impl Default for CanProtocol {
    fn default() -> Self {
        Self::new(ObdProtocol::default())
    }
}

/// Remove and return the sender's pending message once it has all its bytes
fn take_complete(pending: &mut Vec<(u32, Pending)>, sender: u32) -> Option<Message> {
    let index = pending
        .iter()
        .position(|(s, p)| *s == sender && p.data.len() >= p.len)?;
    let (_, mut p) = pending.remove(index);
    p.data.truncate(p.len);
    Some(Message {
        sender,
        data: p.data,
        frames: p.frames,
    })
}

/// Decode a string of hex digit pairs
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
