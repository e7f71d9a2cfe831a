//! Serial transport over an OS serial device.

use crate::error::{CommError, CommResult};
use crate::link::Link;
use crate::protocol::BAUD_RATE;
use log::{debug, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Timeout for one drain read while flushing residual bytes.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Exclusive owner of one OS serial handle.
///
/// At most one physical device is open at a time; there is no reconnection
/// without an explicit [`close`](SerialConnection::close).
pub struct SerialConnection {
    port: Option<Box<dyn SerialPort>>,
    path: Option<String>,
}

impl SerialConnection {
    /// A connection with no device bound yet.
    pub fn new() -> Self {
        Self {
            port: None,
            path: None,
        }
    }

    /// Opens `path` with the fixed link parameters: 230400 baud, 8 data
    /// bits, no parity bit, one stop bit, hardware flow control. Fails if a
    /// device is already open.
    pub fn open(&mut self, path: &str) -> CommResult<()> {
        if self.port.is_some() {
            return Err(CommError::AlreadyOpen(
                self.path.clone().unwrap_or_default(),
            ));
        }
        debug!("Opening serial device '{}' at {} baud", path, BAUD_RATE);
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(DRAIN_READ_TIMEOUT)
            .open()?;
        self.port = Some(port);
        self.path = Some(path.to_string());
        Ok(())
    }

    /// Flushes and releases the device. No-op with a warning if nothing is
    /// open.
    pub fn close(&mut self) -> CommResult<()> {
        if self.port.is_none() {
            warn!("close() on a serial connection that is not open");
            return Ok(());
        }
        self.flush()?;
        if let Some(path) = &self.path {
            debug!("Closing serial device '{}'", path);
        }
        self.port = None;
        self.path = None;
        Ok(())
    }

    /// Whether a device is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Path of the open device, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl Default for SerialConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for SerialConnection {
    fn send(&mut self, bytes: &[u8]) -> CommResult<()> {
        let port = self.port.as_mut().ok_or(CommError::NotConnected)?;
        trace!("TX {} bytes: {:02X?}", bytes.len(), bytes);
        let written = port.write(bytes)?;
        if written != bytes.len() {
            return Err(CommError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> CommResult<()> {
        let port = self.port.as_mut().ok_or(CommError::NotConnected)?;
        port.set_timeout(timeout)?;
        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(CommError::ReceiveTimeout {
                        got: filled,
                        expected: buf.len(),
                    });
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(CommError::ReceiveTimeout {
                        got: filled,
                        expected: buf.len(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        trace!("RX {} bytes: {:02X?}", buf.len(), buf);
        Ok(())
    }

    fn send_queue_len(&self) -> Option<usize> {
        let port = self.port.as_ref()?;
        port.bytes_to_write().ok().map(|count| count as usize)
    }

    fn receive_queue_len(&self) -> Option<usize> {
        let port = self.port.as_ref()?;
        port.bytes_to_read().ok().map(|count| count as usize)
    }

    fn flush(&mut self) -> CommResult<()> {
        let port = self.port.as_mut().ok_or(CommError::NotConnected)?;
        port.clear(ClearBuffer::All)?;
        // The OS-level clear is unreliable on this transport; drain whatever
        // still trickles in with short reads until the queue reports empty.
        port.set_timeout(DRAIN_READ_TIMEOUT)?;
        let mut scratch = [0u8; 64];
        loop {
            match port.bytes_to_read() {
                Ok(0) => break,
                Ok(_) => match port.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(dropped) => trace!("Flush drained {} residual bytes", dropped),
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(err) => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_operations_fail_or_report_none() {
        let mut conn = SerialConnection::new();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(&[0xEE]),
            Err(CommError::NotConnected)
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            conn.receive(&mut buf, Duration::from_millis(1)),
            Err(CommError::NotConnected)
        ));
        assert_eq!(conn.send_queue_len(), None);
        assert_eq!(conn.receive_queue_len(), None);
    }

    #[test]
    fn close_without_open_is_a_noop() {
        let mut conn = SerialConnection::new();
        assert!(conn.close().is_ok());
    }
}
