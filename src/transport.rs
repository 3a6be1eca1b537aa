use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;

use crate::error::Result;

// Serial configuration
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Raw byte pipe to the servo bus.
///
/// Implementations know nothing about packets; framing, checksums and retry
/// policy all live in the protocol layer above.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Returns whatever arrived, at most `max_len` bytes.
    ///
    /// Fails with `ErrorKind::TimedOut` if nothing arrived within `timeout`.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Drop any bytes left over from a previous exchange.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying resource. Calling it twice is a no-op.
    fn close(&mut self);
}

pub struct SerialTransport {
    port_name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        debug!("Opened {} at {} baud", port_name, baud_rate);

        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;

        let mut buf = vec![0u8; max_len];
        let n = port.read(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data received"));
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            debug!("Closing {}", self.port_name);
            drop(port);
        } else {
            debug!("{} already closed", self.port_name);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            self.close();
        }
    }
}
