//! Real hardware transport, backed by `serial2::SerialPort`. Grounded on
//! `other_examples/a81dfed2_MazinLab-jpe__src-transport-connection.rs.rs`:
//! the same discard-input/discard-output-then-write-then-read-with-timeout
//! shape, adapted to line framing instead of terminator-delimited frames.

use super::{Transport, TransportOpener};
use crate::error::TransportError;
use serial2::SerialPort;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

pub struct SerialTransport {
    port: Option<SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = SerialPort::open(path, baud)
            .map_err(|e| TransportError::PortUnavailable(format!("{path}: {e}")))?;
        Ok(Self { port: Some(port) })
    }

    fn port_mut(&mut self) -> Result<&mut SerialPort, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::Io(std::io::Error::new(ErrorKind::NotConnected, "transport closed")))
    }
}

impl Transport for SerialTransport {
    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        use std::io::Write;
        let port = self.port_mut()?;
        let n = port.write(bytes)?;
        port.flush()?;
        Ok(n)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let port = self.port_mut()?;
        port.set_read_timeout(timeout.min(Duration::from_millis(100)))
            .map_err(TransportError::Io)?;

        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let mut byte = [0u8; 1];
            match port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    let b = byte[0];
                    if b == b'\n' {
                        strip_trailing_cr(&mut line);
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    if b == b'\r' {
                        // Could be bare CR or CRLF; peek is not available on
                        // a blocking port, so treat CR as a terminator on
                        // its own and let a following LF start an (empty)
                        // next line — the device never emits blank lines.
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    line.push(b);
                }
                Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue;
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn flush_input(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.discard_input_buffer();
        }
    }
}

fn strip_trailing_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

pub struct SerialTransportOpener;

impl TransportOpener for SerialTransportOpener {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(port, baud)?))
    }
}
