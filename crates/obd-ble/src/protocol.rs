//! CAN Protocol Selection
//!
//! The adapter is always driven with headers on and CAN auto-formatting off,
//! so only the ISO 15765-4 variants are meaningful here.

use serde::{Deserialize, Serialize};

/// CAN identifier width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    /// 11-bit identifiers, printed as 3 hex digits
    Standard11Bit,
    /// 29-bit identifiers, printed as 8 hex digits
    Extended29Bit,
}

impl AddressingMode {
    /// Number of hex digits the adapter prints for a frame header
    pub fn header_digits(&self) -> usize {
        match self {
            AddressingMode::Standard11Bit => 3,
            AddressingMode::Extended29Bit => 8,
        }
    }
}

/// Supported ISO 15765-4 protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// ELM327 protocol number
    pub fn elm_id(&self) -> &'static str {
        &self.to_elm_command()[4..]
    }

    /// Human readable protocol name as the ELM327 datasheet prints it
    pub fn elm_name(&self) -> &'static str {
        match self {
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 (CAN 11/500)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 (CAN 29/500)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 (CAN 11/250)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 (CAN 29/250)",
        }
    }

    /// Identifier width used by this variant
    pub fn addressing(&self) -> AddressingMode {
        match self {
            ObdProtocol::Iso15765_4Can11bit500 | ObdProtocol::Iso15765_4Can11bit250 => {
                AddressingMode::Standard11Bit
            }
            ObdProtocol::Iso15765_4Can29bit500 | ObdProtocol::Iso15765_4Can29bit250 => {
                AddressingMode::Extended29Bit
            }
        }
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Iso15765_4Can11bit500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_can_11bit_500k() {
        let protocol = ObdProtocol::default();
        assert_eq!(protocol.to_elm_command(), "ATSP6");
        assert_eq!(protocol.elm_id(), "6");
        assert_eq!(protocol.addressing(), AddressingMode::Standard11Bit);
    }

    #[test]
    fn test_29bit_header_width() {
        let protocol = ObdProtocol::Iso15765_4Can29bit250;
        assert_eq!(protocol.addressing().header_digits(), 8);
        assert_eq!(protocol.elm_id(), "9");
    }
}
