//! Mock transport for testing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::traits::{DfuTransport, TransportError};

type Responder = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Mock transport for unit testing the update state machine.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    /// Bytes waiting to be returned by `read`.
    rx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Produces a reply for each written frame.
    responder: Option<Arc<Responder>>,
    /// Whether the link is "up".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: None,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Reply to every write with the bytes returned by `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::new()
        }
    }

    /// Queue bytes to be returned on the next read.
    pub fn queue_rx(&self, bytes: &[u8]) {
        self.rx_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Remove and return everything queued for reading.
    pub fn drain_rx(&self) -> Vec<Vec<u8>> {
        self.rx_queue.lock().unwrap().drain(..).collect()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate a dropped link.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate the link coming back.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("writes", &self.write_log.lock().unwrap().len())
            .field("queued", &self.rx_queue.lock().unwrap().len())
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

impl DfuTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(responder) = &self.responder
            && let Some(reply) = responder(data)
        {
            self.queue_rx(&reply);
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.rx_queue.lock().unwrap();
        let mut chunk = queue
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 0 })?;
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}
