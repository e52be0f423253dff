//! Response Decoders
//!
//! Each decoder receives the normalized messages of one response. Mode 01
//! payloads start with the echoed service and PID bytes (`41 0C ...`), which
//! the formulas skip.

use crate::command::ObdValue;
use crate::error::DecodeError;
use crate::frame::Message;
use std::collections::BTreeMap;

/// Service + PID echo preceding mode 01 data
const PID_ECHO: usize = 2;

/// Data bytes of the first message after `skip`, at least `needed` long
fn payload(messages: &[Message], skip: usize, needed: usize) -> Result<&[u8], DecodeError> {
    let data = &messages.first().ok_or(DecodeError::Empty)?.data;
    if data.len() < skip + needed {
        return Err(DecodeError::TooShort {
            needed: skip + needed,
            actual: data.len(),
        });
    }
    Ok(&data[skip..])
}

fn be_unsigned(bytes: &[u8]) -> f64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64) as f64
}

/// The raw adapter lines
pub fn raw_string(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    Ok(ObdValue::Text(
        messages.iter().map(Message::raw).collect::<Vec<_>>().join("\n"),
    ))
}

/// The data bytes of the first message
pub fn raw_bytes(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    Ok(ObdValue::Bytes(payload(messages, 0, 0)?.to_vec()))
}

/// A * 100 / 255 (%)
pub fn percent(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 1)?;
    Ok(ObdValue::Number(d[0] as f64 * 100.0 / 255.0))
}

/// A - 40 (°C)
pub fn temperature(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 1)?;
    Ok(ObdValue::Number(d[0] as f64 - 40.0))
}

/// (A - 128) * 100 / 128 (%)
pub fn fuel_trim(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 1)?;
    Ok(ObdValue::Number((d[0] as f64 - 128.0) * 100.0 / 128.0))
}

/// A (kPa)
pub fn pressure(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 1)?;
    Ok(ObdValue::Number(d[0] as f64))
}

/// ((A * 256) + B) / 4 (rpm)
pub fn rpm(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 2)?;
    Ok(ObdValue::Number(be_unsigned(&d[..2]) / 4.0))
}

/// A (km/h)
pub fn speed(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 1)?;
    Ok(ObdValue::Number(d[0] as f64))
}

/// ((A * 256) + B) / 100 (g/s)
pub fn maf(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, PID_ECHO, 2)?;
    Ok(ObdValue::Number(be_unsigned(&d[..2]) / 100.0))
}

/// Nissan Leaf Li-ion battery controller block (`79B` / `022101`)
pub fn lbc(messages: &[Message]) -> Result<ObdValue, DecodeError> {
    let d = payload(messages, 0, 40)?;
    if d[0] != 0x61 || d[1] != 0x01 {
        return Err(DecodeError::Invalid(format!(
            "unexpected service echo {:02X} {:02X}",
            d[0], d[1]
        )));
    }

    let signed = |bytes: &[u8]| {
        i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
    };

    let mut fields = BTreeMap::new();
    fields.insert("hv_battery_current_1".to_string(), signed(&d[2..6]) / 1024.0);
    fields.insert("hv_battery_current_2".to_string(), signed(&d[8..12]) / 1024.0);
    fields.insert("hv_battery_voltage".to_string(), be_unsigned(&d[20..22]) / 100.0);
    fields.insert("hv_battery_health".to_string(), be_unsigned(&d[30..32]) / 102.4);
    fields.insert("state_of_charge".to_string(), be_unsigned(&d[33..36]) / 10000.0);
    fields.insert("hv_battery_ah".to_string(), be_unsigned(&d[37..40]) / 10000.0);
    Ok(ObdValue::Fields(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: Vec<u8>) -> Vec<Message> {
        vec![Message {
            sender: 0x7E8,
            data,
            frames: Vec::new(),
        }]
    }

    fn number(value: Result<ObdValue, DecodeError>) -> f64 {
        value.unwrap().as_f64().unwrap()
    }

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 6699 / 4 = 1674.75
        assert!((number(rpm(&msg(vec![0x41, 0x0C, 0x1A, 0x2B]))) - 1674.75).abs() < 0.01);
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        assert!((number(temperature(&msg(vec![0x41, 0x05, 0x73]))) - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        assert!(number(fuel_trim(&msg(vec![0x41, 0x06, 0x80]))).abs() < 0.01);
        assert!((number(fuel_trim(&msg(vec![0x41, 0x06, 0x90]))) - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_short_payload() {
        assert_eq!(
            rpm(&msg(vec![0x41, 0x0C, 0x1A])),
            Err(DecodeError::TooShort { needed: 4, actual: 3 })
        );
        assert_eq!(speed(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_lbc_decode() {
        let mut data = vec![0u8; 53];
        data[0] = 0x61;
        data[1] = 0x01;
        data[2..6].copy_from_slice(&(-2048i32).to_be_bytes());
        data[20..22].copy_from_slice(&36_512u16.to_be_bytes());
        data[30..32].copy_from_slice(&9_216u16.to_be_bytes());
        data[33..36].copy_from_slice(&[0x0B, 0x71, 0xB0]); // 750000

        let value = lbc(&msg(data)).unwrap();
        let ObdValue::Fields(fields) = value else {
            panic!("expected fields");
        };
        assert!((fields["hv_battery_current_1"] + 2.0).abs() < 1e-9);
        assert!((fields["hv_battery_voltage"] - 365.12).abs() < 1e-9);
        assert!((fields["hv_battery_health"] - 90.0).abs() < 1e-9);
        assert!((fields["state_of_charge"] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_lbc_rejects_wrong_service() {
        let data = vec![0x7F; 53];
        assert!(matches!(lbc(&msg(data)), Err(DecodeError::Invalid(_))));
    }
}
