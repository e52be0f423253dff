//! ELM327 Command Engine
//!
//! Drives the adapter's AT dialect over a [`BleSerial`] transport and tracks
//! how far the connection got during bring-up.

use crate::command::{CommandDescriptor, Response};
use crate::error::ObdError;
use crate::frame::{CanProtocol, Reassembly};
use crate::protocol::ObdProtocol;
use crate::transport::{BleSerial, GattLink};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// ELM prompt character
const ELM_PROMPT: &[u8] = b">";
/// Reply confirming that low power mode is about to become active
const ELM_LP_ACTIVE: &[u8] = b"OK";
/// Pause between read attempts while the adapter is silent
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Settling time after a reset or wake-up
const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Battery voltage below which the adapter is considered unplugged
const MIN_BATTERY_VOLTAGE: f64 = 6.0;

/// How far bring-up got, ordered by capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    /// The adapter answers AT commands
    ElmConnected,
    /// The adapter sees vehicle battery voltage
    ObdConnected,
    CarConnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::NotConnected => "Not Connected",
            ConnectionState::ElmConnected => "ELM Connected",
            ConnectionState::ObdConnected => "OBD Connected",
            ConnectionState::CarConnected => "Car Connected",
        };
        f.write_str(s)
    }
}

/// Adapter and transaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElmConfig {
    /// CAN variant selected during bring-up
    pub protocol: ObdProtocol,
    /// Wait per read attempt, in milliseconds
    pub read_timeout_ms: u64,
    /// Give up on a silent adapter after this long, in milliseconds
    pub response_ceiling_ms: u64,
    /// Require `AT RV` to report vehicle battery voltage
    pub check_voltage: bool,
    /// Wake the adapter before resetting it
    pub start_low_power: bool,
}

impl Default for ElmConfig {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::default(),
            read_timeout_ms: 100,
            response_ceiling_ms: 1000,
            check_voltage: true,
            start_low_power: false,
        }
    }
}

impl ElmConfig {
    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn response_ceiling(&self) -> Duration {
        Duration::from_millis(self.response_ceiling_ms)
    }
}

/// ELM327 adapter reached over BLE
pub struct Elm327<L: GattLink> {
    port: BleSerial<L>,
    parser: CanProtocol,
    config: ElmConfig,
    state: ConnectionState,
    low_power: bool,
}

impl<L: GattLink> Elm327<L> {
    /// Wrap a transport; call [`bring_up`](Self::bring_up) before use
    pub fn new(port: BleSerial<L>, config: ElmConfig) -> Self {
        Self {
            port,
            parser: CanProtocol::new(config.protocol),
            config,
            state: ConnectionState::NotConnected,
            low_power: false,
        }
    }

    /// Build an engine and run bring-up, failing unless the adapter answered
    pub async fn connect(port: BleSerial<L>, config: ElmConfig) -> Result<Self, ObdError> {
        let mut elm = Self::new(port, config);
        elm.bring_up().await?;
        Ok(elm)
    }

    /// Open the transport and configure the adapter
    ///
    /// Any failing step closes the transport and leaves the state at
    /// [`ConnectionState::NotConnected`].
    pub async fn bring_up(&mut self) -> Result<(), ObdError> {
        info!(
            "Initializing ELM327: protocol={}",
            self.config.protocol.elm_name()
        );

        if let Err(e) = self.port.open().await {
            return Err(self.fail(e).await);
        }

        match self.configure().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn configure(&mut self) -> Result<(), ObdError> {
        if self.config.start_low_power {
            self.write(b" ").await?;
            tokio::time::sleep(SETTLE_DELAY).await;
        }

        // reset banner is adapter specific, not checked
        self.send(b"ATZ", Some(SETTLE_DELAY), ELM_PROMPT).await?;

        // echo may already be off, so the echoed command is not required
        let lines = self.send(b"ATE0", None, ELM_PROMPT).await?;
        if !lines.iter().any(|l| l.contains("OK")) {
            return Err(ObdError::Protocol("ATE0 did not return 'OK'".to_string()));
        }

        // headers on, linefeeds off, spaces off, CAN auto-formatting off
        let steps: [&[u8]; 5] = [
            self.config.protocol.to_elm_command().as_bytes(),
            b"ATH1",
            b"ATL0",
            b"ATS0",
            b"ATCAF0",
        ];
        for cmd in steps {
            let lines = self.send(cmd, None, ELM_PROMPT).await?;
            if !is_ok(&lines) {
                return Err(ObdError::Protocol(format!(
                    "{} did not return 'OK': {:?}",
                    String::from_utf8_lossy(cmd),
                    lines
                )));
            }
        }

        self.transition(ConnectionState::ElmConnected);

        if self.config.check_voltage {
            let lines = self.send(b"AT RV", None, ELM_PROMPT).await?;
            let volts = match lines.as_slice() {
                [line] if !line.is_empty() => parse_voltage(line).ok_or_else(|| {
                    ObdError::Protocol(format!("Incorrect response from 'AT RV': {}", line))
                })?,
                _ => return Err(ObdError::Protocol("No answer from 'AT RV'".to_string())),
            };

            if volts < MIN_BATTERY_VOLTAGE {
                error!("OBD2 socket disconnected ({:.1}V)", volts);
                return Ok(());
            }
            self.transition(ConnectionState::ObdConnected);
        }

        // the first real query is the true test of the vehicle bus
        self.transition(ConnectionState::CarConnected);
        Ok(())
    }

    /// Tear down after a failed step and hand the cause back
    async fn fail(&mut self, cause: ObdError) -> ObdError {
        error!("ELM327 bring-up failed: {}", cause);
        self.port.close().await;
        self.transition(ConnectionState::NotConnected);
        cause
    }

    /// The single place where the connection state changes
    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        info!("ELM327 state: {} -> {}", self.state, next);
        if next == ConnectionState::NotConnected {
            self.low_power = false;
        }
        self.state = next;
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionState {
        self.state
    }

    /// Whether the adapter was put to sleep with `ATLP`
    pub fn is_low_power(&self) -> bool {
        self.low_power
    }

    /// Human readable name of the selected CAN variant
    pub fn protocol_name(&self) -> &'static str {
        self.parser.protocol().elm_name()
    }

    /// ELM327 protocol number of the selected CAN variant
    pub fn protocol_id(&self) -> &'static str {
        self.parser.protocol().elm_id()
    }

    /// Send a command and decode the vehicle's answer
    pub async fn send_and_parse(
        &mut self,
        descriptor: &CommandDescriptor,
    ) -> Result<Response, ObdError> {
        let reassembly = self.send_and_reassemble(descriptor.command()).await?;
        Ok(descriptor.apply(reassembly.messages))
    }

    /// Send raw command bytes and reassemble the answer without decoding
    pub async fn send_and_reassemble(&mut self, cmd: &[u8]) -> Result<Reassembly, ObdError> {
        let lines = self.query(cmd).await?;
        Ok(self.parser.parse(&lines))
    }

    /// Send any command and return the adapter's response lines
    pub async fn query(&mut self, cmd: &[u8]) -> Result<Vec<String>, ObdError> {
        if self.state == ConnectionState::NotConnected {
            info!("cannot send command when unconnected");
            return Err(ObdError::NotConnected);
        }

        if self.low_power {
            self.normal_power().await?;
        }

        self.send(cmd, None, ELM_PROMPT).await
    }

    /// Put the adapter into low power mode
    ///
    /// Returns the adapter's reply; the low power flag is only set on "OK".
    pub async fn low_power(&mut self) -> Result<Vec<String>, ObdError> {
        if self.state == ConnectionState::NotConnected {
            info!("cannot enter low power when unconnected");
            return Err(ObdError::NotConnected);
        }

        let lines = self.send(b"ATLP", Some(SETTLE_DELAY), ELM_LP_ACTIVE).await?;
        if lines.iter().any(|l| l == "OK") {
            debug!("Successfully entered low power mode");
            self.low_power = true;
        } else {
            debug!("Failed to enter low power mode");
        }
        Ok(lines)
    }

    /// Wake the adapter, whether or not it is believed to be asleep
    pub async fn normal_power(&mut self) -> Result<Vec<String>, ObdError> {
        if self.state == ConnectionState::NotConnected {
            info!("cannot exit low power when unconnected");
            return Err(ObdError::NotConnected);
        }

        let lines = self.send(b" ", None, ELM_PROMPT).await?;
        debug!("Exited low power mode");
        self.low_power = false;
        Ok(lines)
    }

    /// Reset the adapter and release the BLE connection
    pub async fn close(&mut self) {
        if self.port.is_open() {
            info!("closing port");
            if let Err(e) = self.port.write(b"ATZ\r").await {
                debug!("Reset on close failed: {}", e);
            }
        }
        self.port.close().await;
        self.transition(ConnectionState::NotConnected);
    }

    /// Write `cmd`, wait for `end_marker` and split the reply into lines
    ///
    /// A silent adapter yields an empty list once the response ceiling passes.
    async fn send(
        &mut self,
        cmd: &[u8],
        delay: Option<Duration>,
        end_marker: &[u8],
    ) -> Result<Vec<String>, ObdError> {
        self.write(cmd).await?;

        let started = Instant::now();
        let ceiling = self.config.response_ceiling() + delay.unwrap_or_default();
        if let Some(delay) = delay {
            debug!("wait: {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        loop {
            let lines = self.read(end_marker).await?;
            if !lines.is_empty() {
                return Ok(lines);
            }
            if started.elapsed() >= ceiling {
                warn!(
                    "No response to {:?} within {:?}",
                    String::from_utf8_lossy(cmd),
                    ceiling
                );
                return Ok(lines);
            }
            debug!("no response; wait: {:?}", RETRY_INTERVAL);
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn write(&mut self, cmd: &[u8]) -> Result<(), ObdError> {
        let mut data = cmd.to_vec();
        data.push(b'\r');

        self.port.reset_input_buffer();
        if let Err(e) = self.port.write(&data).await {
            error!("Device disconnected while writing: {}", e);
            return Err(self.disconnected(e).await);
        }
        Ok(())
    }

    /// One read attempt; an empty list means the marker did not arrive in time
    async fn read(&mut self, end_marker: &[u8]) -> Result<Vec<String>, ObdError> {
        let raw = match self
            .port
            .read_until(end_marker, self.config.read_timeout())
            .await
        {
            Ok(raw) => raw,
            Err(ObdError::Timeout(_)) => return Ok(Vec::new()),
            Err(e) => {
                error!("Device disconnected while reading: {}", e);
                return Err(self.disconnected(e).await);
            }
        };

        debug!("read: {:?}", String::from_utf8_lossy(&raw));
        Ok(split_lines(&raw))
    }

    async fn disconnected(&mut self, cause: ObdError) -> ObdError {
        if cause.is_fatal() {
            self.port.close().await;
            self.transition(ConnectionState::NotConnected);
        }
        cause
    }
}

/// Strip the prompt and NUL padding and split into trimmed, non-empty lines
fn split_lines(raw: &[u8]) -> Vec<String> {
    let mut bytes: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
    if bytes.ends_with(ELM_PROMPT) {
        bytes.truncate(bytes.len() - ELM_PROMPT.len());
    }

    String::from_utf8_lossy(&bytes)
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_ok(lines: &[String]) -> bool {
    matches!(lines, [line] if line == "OK")
}

/// Parse `AT RV` output such as `12.6V`
fn parse_voltage(line: &str) -> Option<f64> {
    line.trim()
        .trim_end_matches(['V', 'v'])
        .trim()
        .parse::<f64>()
        .ok()
}
