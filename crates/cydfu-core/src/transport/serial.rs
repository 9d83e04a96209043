//! serialport-based UART transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument, warn};

use super::traits::{DfuTransport, TransportError};

/// UART link to the bootloader, 8N1 without flow control.
pub struct SerialTransport {
    port: Mutex<Box<dyn SerialPort>>,
    name: String,
    timeout_ms: u64,
    connected: AtomicBool,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`. `timeout` bounds each read.
    #[instrument(level = "info", fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(ErrorKind::NotFound) => {
                    TransportError::PortNotFound(port_name.to_string())
                }
                _ => TransportError::OpenFailed(format!("{}: {}", port_name, e)),
            })?;

        // Stale bytes from a previous session would desync the frame reader.
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            warn!(error = %e, "Could not clear port buffers");
        }

        info!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            port: Mutex::new(port),
            name: port_name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
            connected: AtomicBool::new(true),
        })
    }

    /// Name of the underlying port.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>, TransportError> {
        self.port
            .lock()
            .map_err(|_| TransportError::ReadFailed("serial port lock poisoned".into()))
    }

    fn mark_lost(&self, e: &std::io::Error) {
        if matches!(
            e.kind(),
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::NotFound
        ) {
            self.connected.store(false, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl DfuTransport for SerialTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port = self.lock()?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| {
                self.mark_lost(&e);
                TransportError::WriteFailed(e.to_string())
            })?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut port = self.lock()?;
        let mut buf = vec![0u8; max_len];

        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                return Err(TransportError::Timeout {
                    timeout_ms: self.timeout_ms,
                });
            }
            Err(e) => {
                self.mark_lost(&e);
                return Err(TransportError::ReadFailed(e.to_string()));
            }
        };

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
