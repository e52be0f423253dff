//! High-level OBD Connection
//!
//! Wraps an [`Elm327`] engine with CAN header management and the "fast"
//! optimization: once a command's response frame count is known it is
//! appended to the request so the adapter stops waiting after that many
//! frames.

use crate::command::{CommandDescriptor, Response};
use crate::elm327::{ConnectionState, Elm327, ElmConfig};
use crate::error::ObdError;
use crate::transport::{BleSerial, GattLink, GattProfile};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// OBD-II connection with its assorted commands
pub struct Obd<L: GattLink> {
    interface: Option<Elm327<L>>,
    fast: bool,
    last_header: Option<Vec<u8>>,
    frame_counts: HashMap<CommandDescriptor, usize>,
}

impl<L: GattLink> Obd<L> {
    /// Connect to the adapter behind `link` and bring it to a known state
    ///
    /// Fails if bring-up did not get past [`ConnectionState::NotConnected`].
    pub async fn connect(
        link: L,
        profile: GattProfile,
        config: ElmConfig,
        fast: bool,
    ) -> Result<Self, ObdError> {
        debug!("Connecting to OBD adapter");
        let interface = Elm327::connect(BleSerial::new(link, profile), config).await?;
        Ok(Self::from_engine(interface, fast))
    }

    /// Wrap an engine that has already been brought up
    pub fn from_engine(interface: Elm327<L>, fast: bool) -> Self {
        Self {
            interface: Some(interface),
            fast,
            last_header: None,
            frame_counts: HashMap::new(),
        }
    }

    /// Connection state of the engine, or `NotConnected` once closed
    pub fn status(&self) -> ConnectionState {
        self.interface
            .as_ref()
            .map_or(ConnectionState::NotConnected, Elm327::status)
    }

    /// Whether the vehicle, not just the adapter, is reachable
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::CarConnected
    }

    /// Name of the CAN variant in use; empty once closed
    pub fn protocol_name(&self) -> &'static str {
        self.interface.as_ref().map_or("", Elm327::protocol_name)
    }

    /// ELM327 protocol number in use; empty once closed
    pub fn protocol_id(&self) -> &'static str {
        self.interface.as_ref().map_or("", Elm327::protocol_id)
    }

    /// Put the adapter to sleep, see [`Elm327::low_power`]
    pub async fn low_power(&mut self) -> Result<Vec<String>, ObdError> {
        self.engine()?.low_power().await
    }

    /// Wake the adapter, see [`Elm327::normal_power`]
    pub async fn normal_power(&mut self) -> Result<Vec<String>, ObdError> {
        self.engine()?.normal_power().await
    }

    /// Send a command to the car and decode the answer
    ///
    /// A vehicle that does not answer yields an empty [`Response`].
    pub async fn query(&mut self, cmd: &CommandDescriptor) -> Result<Response, ObdError> {
        if self.status() == ConnectionState::NotConnected {
            warn!("Query failed, no connection available");
            return Err(ObdError::NotConnected);
        }

        self.set_header(cmd.header()).await?;

        info!("Sending command: {}", cmd);
        let wire = self.build_command(cmd);
        let engine = self.engine()?;
        let reassembly = engine.send_and_reassemble(&wire).await?;

        for line in &reassembly.unparsed {
            debug!("Adapter status: {}", line);
        }
        if reassembly.messages.is_empty() {
            info!("No valid OBD messages returned");
            return Ok(Response::empty(cmd));
        }

        for frame in reassembly.messages.iter().flat_map(|m| &m.frames) {
            debug!("Received frame: {}", frame.raw);
        }

        // remember how many frames this command returns to speed up the next query
        if !self.frame_counts.contains_key(cmd) {
            let frames = reassembly.messages.iter().map(|m| m.frames.len()).sum();
            self.frame_counts.insert(cmd.clone(), frames);
        }

        Ok(cmd.apply(reassembly.messages))
    }

    /// Frame count learned for `cmd`, if any
    pub fn frame_count(&self, cmd: &CommandDescriptor) -> Option<usize> {
        self.frame_counts.get(cmd).copied()
    }

    /// Release the adapter
    pub async fn close(&mut self) {
        if let Some(mut interface) = self.interface.take() {
            info!("Closing connection");
            interface.close().await;
        }
    }

    fn engine(&mut self) -> Result<&mut Elm327<L>, ObdError> {
        self.interface.as_mut().ok_or(ObdError::NotConnected)
    }

    fn build_command(&self, cmd: &CommandDescriptor) -> Vec<u8> {
        let mut wire = cmd.command().to_vec();
        if self.fast && cmd.fast() {
            if let Some(count) = self.frame_counts.get(cmd).filter(|c| **c > 0 && **c < 16) {
                wire.extend_from_slice(format!("{:X}", count).as_bytes());
            }
        }
        wire
    }

    /// Address following requests to `header` and route flow control back to it
    ///
    /// A step that is not acknowledged is logged and leaves the header uncached
    /// so the next query tries again.
    async fn set_header(&mut self, header: &[u8]) -> Result<(), ObdError> {
        if header.is_empty() || self.last_header.as_deref() == Some(header) {
            return Ok(());
        }

        let header_text = String::from_utf8_lossy(header).to_string();
        let steps = [
            format!("AT SH {}", header_text),
            format!("AT FC SH {}", header_text),
            "AT FC SD 30 00 00".to_string(),
            "AT FC SM 1".to_string(),
        ];

        let engine = self.engine()?;
        for step in &steps {
            let lines = engine.query(step.as_bytes()).await?;
            if lines.is_empty() {
                info!("Set header ('{}') did not return data", step);
                return Ok(());
            }
            if lines.join("\n") != "OK" {
                info!("Set header ('{}') did not return 'OK'", step);
                return Ok(());
            }
        }

        self.last_header = Some(header.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::command::ObdValue;
    use crate::decoders;
    use crate::testing::{MockHandle, MockLink};

    async fn connect(link: MockLink) -> (Obd<MockLink>, MockHandle) {
        let handle = link.handle();
        let obd = Obd::connect(link, GattProfile::GENERIC, ElmConfig::default(), true)
            .await
            .unwrap();
        (obd, handle)
    }

    /// Split `payload` into an ISO-TP first frame and consecutive frames
    fn isotp_reply(header: &str, payload: &[u8]) -> String {
        let hex = |b: &[u8]| b.iter().map(|x| format!("{:02X}", x)).collect::<String>();
        let mut lines = vec![format!("{}1{:03X}{}", header, payload.len(), hex(&payload[..6]))];
        for (i, chunk) in payload[6..].chunks(7).enumerate() {
            lines.push(format!("{}2{:X}{}", header, (i + 1) & 0x0F, hex(chunk)));
        }
        lines.join("\r") + "\r\r>"
    }

    fn lbc_payload() -> Vec<u8> {
        let mut data = vec![0u8; 53];
        data[0] = 0x61;
        data[1] = 0x01;
        data[20..22].copy_from_slice(&36_512u16.to_be_bytes());
        data[30..32].copy_from_slice(&9_216u16.to_be_bytes());
        data
    }

    fn fast_speed() -> CommandDescriptor {
        CommandDescriptor::new("speed", "Vehicle speed", b"7DF", b"02010D", 3, decoders::speed, true)
    }

    fn car() -> MockLink {
        let lbc_reply = isotp_reply("7BB", &lbc_payload());
        MockLink::elm(move |cmd| match cmd {
            "02010D" | "02010D1" => Some("7E803410D37\r\r>".to_string()),
            "022101" => Some(lbc_reply.clone()),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_sets_header_once() {
        let (mut obd, handle) = connect(car()).await;
        let speed = fast_speed();

        let first = obd.query(&speed).await.unwrap();
        assert_eq!(first.value, Some(ObdValue::Number(55.0)));
        let second = obd.query(&speed).await.unwrap();
        assert_eq!(second.value, Some(ObdValue::Number(55.0)));

        let commands = handle.commands();
        assert_eq!(commands.iter().filter(|c| c.as_str() == "AT SH 7DF").count(), 1);
        assert!(commands.contains(&"AT FC SD 30 00 00".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_mode_appends_frame_count() {
        let (mut obd, handle) = connect(car()).await;
        let speed = fast_speed();

        obd.query(&speed).await.unwrap();
        assert_eq!(obd.frame_count(&speed), Some(1));
        obd.query(&speed).await.unwrap();

        let commands = handle.commands();
        assert_eq!(commands.last().map(String::as_str), Some("02010D1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_query() {
        let (mut obd, handle) = connect(car()).await;
        let lbc = Catalog::standard().get("lbc").cloned().unwrap();

        let response = obd.query(&lbc).await.unwrap();
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].data.len(), 53);
        assert!(response.adjustments.is_empty());

        let Some(ObdValue::Fields(fields)) = response.value else {
            panic!("expected battery fields");
        };
        assert!((fields["hv_battery_voltage"] - 365.12).abs() < 1e-9);
        assert!((fields["hv_battery_health"] - 90.0).abs() < 1e-9);
        assert!(handle.commands().contains(&"AT SH 79B".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_is_empty_response() {
        let (mut obd, _) = connect(car()).await;
        let rpm = Catalog::standard().get("rpm").cloned().unwrap();

        let response = obd.query(&rpm).await.unwrap();
        assert!(response.messages.is_empty());
        assert!(response.value.is_none());
        assert_eq!(obd.frame_count(&rpm), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_header_is_retried() {
        let link = MockLink::elm(|cmd| cmd.starts_with("AT FC SH").then(|| "?\r\r>".to_string()));
        let (mut obd, handle) = connect(link).await;
        let speed = fast_speed();

        obd.query(&speed).await.unwrap();
        obd.query(&speed).await.unwrap();
        let commands = handle.commands();
        assert_eq!(commands.iter().filter(|c| c.as_str() == "AT SH 7DF").count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_rejects_queries() {
        let (mut obd, _) = connect(car()).await;
        obd.close().await;

        assert_eq!(obd.status(), ConnectionState::NotConnected);
        assert_eq!(obd.protocol_name(), "");
        let speed = fast_speed();
        assert!(matches!(obd.query(&speed).await, Err(ObdError::NotConnected)));
    }
}
