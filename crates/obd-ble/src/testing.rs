//! Scripted GATT link for tests
//!
//! [`MockLink`] answers every write through a responder closure and delivers
//! the answer as notifications split into MTU-sized chunks, the way real
//! adapters do. A [`MockHandle`] observes and manipulates the link after it
//! has been moved into a transport.

use crate::error::LinkError;
use crate::transport::{GattLink, GattProfile, NotificationReceiver};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Payload bytes per notification chunk
const CHUNK_SIZE: usize = 20;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    connected: bool,
    subscribed: bool,
    fail_writes: bool,
    writes: Vec<Vec<u8>>,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Shared view of a [`MockLink`]'s state
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `data` as a single notification
    pub fn notify(&self, data: &[u8]) {
        if let Some(tx) = self.lock().tx.as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Close the notification channel as a dropped connection would
    pub fn drop_notifications(&self) {
        self.lock().tx = None;
    }

    /// Make every following write fail
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }

    /// Every payload written so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Written payloads as text with the trailing carriage return removed
    pub fn commands(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches('\r').to_string())
            .collect()
    }

    /// Whether the link is connected
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Whether notifications are enabled
    pub fn is_subscribed(&self) -> bool {
        self.lock().subscribed
    }
}

/// In-memory [`GattLink`] driven by a responder closure
pub struct MockLink {
    handle: MockHandle,
    characteristics: Vec<Uuid>,
    responder: Responder,
}

impl MockLink {
    /// Link whose responder maps each command (without `\r`) to the adapter's reply
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let profile = GattProfile::GENERIC;
        Self {
            handle: MockHandle::default(),
            characteristics: vec![profile.read, profile.write],
            responder: Box::new(responder),
        }
    }

    /// Link that never answers on its own
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    /// ELM327 stand-in acknowledging every AT command, overridden by `custom`
    pub fn elm<F>(mut custom: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        Self::new(move |cmd| {
            custom(cmd).or_else(|| match cmd.trim() {
                "" => Some(">".to_string()),
                "ATZ" => Some("\r\rELM327 v1.5\r\r>".to_string()),
                "AT RV" => Some("12.6V\r\r>".to_string()),
                c if c.starts_with("AT") => Some("OK\r\r>".to_string()),
                _ => Some("NO DATA\r\r>".to_string()),
            })
        })
    }

    /// Replace the characteristics advertised for every service
    pub fn with_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Handle for inspecting the link after it is moved into a transport
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        self.handle.lock().connected = true;
        Ok(())
    }

    async fn characteristics(&mut self, _service: Uuid) -> Result<Vec<Uuid>, LinkError> {
        Ok(self.characteristics.clone())
    }

    async fn subscribe(&mut self, _characteristic: Uuid) -> Result<NotificationReceiver, LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.handle.lock();
        state.tx = Some(tx);
        state.subscribed = true;
        Ok(rx)
    }

    async fn unsubscribe(&mut self, _characteristic: Uuid) -> Result<(), LinkError> {
        self.handle.lock().subscribed = false;
        Ok(())
    }

    async fn write(&mut self, _characteristic: Uuid, data: &[u8]) -> Result<(), LinkError> {
        {
            let mut state = self.handle.lock();
            if state.fail_writes || !state.connected {
                return Err(LinkError("write rejected".to_string()));
            }
            state.writes.push(data.to_vec());
        }

        let command = String::from_utf8_lossy(data);
        if let Some(reply) = (self.responder)(command.trim_end_matches('\r')) {
            for chunk in reply.as_bytes().chunks(CHUNK_SIZE) {
                self.handle.notify(chunk);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        let mut state = self.handle.lock();
        state.connected = false;
        state.subscribed = false;
        state.tx = None;
        Ok(())
    }
}
