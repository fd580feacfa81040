//! # Serial Communication Module
//!
//! UART plumbing shared by the GNSS receiver and the AT-command radio modems.
//!
//! This module handles:
//! - Opening serial ports (8N1, no flow control)
//! - Line-oriented reads over a byte stream (NMEA sentences, AT responses)
//! - Writing CR/LF terminated command lines

pub mod port_trait;

use bytes::BytesMut;
use std::io;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace};

use crate::error::{CollarError, Result};
pub use port_trait::{SerialPortIO, TokioSerialPort};

/// Longest line kept before the buffer is discarded as garbage
pub const MAX_LINE_LEN: usize = 1024;

/// Open a serial port with 8N1 settings
///
/// # Arguments
///
/// * `path` - Device path (e.g., "/dev/ttyUSB0")
/// * `baud_rate` - Line speed
///
/// # Returns
///
/// * `Result<TokioSerialPort>` - Opened port
///
/// # Errors
///
/// Returns `CollarError::Serial` if the device cannot be opened
///
/// # Examples
///
/// ```no_run
/// use collar_firmware::serial::open_port;
///
/// let port = open_port("/dev/ttyUSB0", 115_200)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn open_port(path: &str, baud_rate: u32) -> Result<TokioSerialPort> {
    debug!("Opening serial port {} at {} baud", path, baud_rate);

    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| CollarError::Serial(format!("Failed to open {}: {}", path, e)))?;

    info!("Opened serial port {}", path);
    Ok(TokioSerialPort::new(port))
}

/// Line reader/writer over a serial port
///
/// Partial lines stay buffered between calls, so a `read_line` future can be
/// dropped on timeout without losing data.
pub struct LineReader<P: SerialPortIO> {
    port: P,
    buf: BytesMut,
}

impl<P: SerialPortIO> LineReader<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Next non-empty line, without its CR/LF terminator
    ///
    /// # Errors
    ///
    /// * `UnexpectedEof` - the port was closed
    /// * `InvalidData` - a line exceeded [`MAX_LINE_LEN`]
    pub async fn read_line(&mut self) -> io::Result<String> {
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    trace!("<< {}", text);
                    return Ok(text);
                }
            }

            if self.buf.len() > MAX_LINE_LEN {
                self.buf.clear();
                return Err(io::Error::new(io::ErrorKind::InvalidData, "serial line too long"));
            }

            let mut chunk = [0u8; 256];
            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write `line` followed by CR/LF and flush
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        trace!(">> {}", line);
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.port.write_all(&data).await?;
        self.port.flush().await
    }

    /// Drop any buffered, unread input
    pub fn discard_input(&mut self) {
        self.buf.clear();
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::port_trait::mocks::MockSerialPort;
    use super::*;

    #[test]
    fn test_open_port_with_invalid_path_returns_error() {
        let result = open_port("/dev/nonexistent_serial_device_12345", 9_600);

        match result {
            Err(CollarError::Serial(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            Err(other) => panic!("Expected Serial error, got: {:?}", other),
            Ok(_) => panic!("Expected Serial error, got an open port"),
        }
    }

    #[tokio::test]
    async fn test_read_lines_skips_blank() {
        let port = MockSerialPort::new();
        port.push_incoming("\r\nOK\r\n\r\n+EVT:JOINED\r\n");
        let mut reader = LineReader::new(port);

        assert_eq!(reader.read_line().await.unwrap(), "OK");
        assert_eq!(reader.read_line().await.unwrap(), "+EVT:JOINED");
    }

    #[tokio::test]
    async fn test_partial_line_kept_across_reads() {
        let port = MockSerialPort::new();
        let handle = port.clone();
        port.push_incoming("$GPGGA,1");
        let mut reader = LineReader::new(port);

        let pending = tokio::time::timeout(std::time::Duration::from_millis(10), reader.read_line()).await;
        assert!(pending.is_err());

        handle.push_incoming("23\r\n");
        assert_eq!(reader.read_line().await.unwrap(), "$GPGGA,123");
    }

    #[tokio::test]
    async fn test_write_line_appends_crlf() {
        let port = MockSerialPort::new();
        let handle = port.clone();
        let mut reader = LineReader::new(port);

        reader.write_line("AT+JOIN").await.unwrap();
        assert_eq!(handle.get_written_data(), vec![b"AT+JOIN\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_error_propagates() {
        let port = MockSerialPort::new();
        port.set_write_error(io::ErrorKind::BrokenPipe);
        let mut reader = LineReader::new(port);

        let err = reader.write_line("AT").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let port = MockSerialPort::new();
        port.push_incoming(&"x".repeat(MAX_LINE_LEN + 300));
        let mut reader = LineReader::new(port);

        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_discard_input() {
        let port = MockSerialPort::new();
        let mut reader = LineReader::new(port.clone());

        reader.buf.extend_from_slice(b"ERROR\r\nstale");
        reader.discard_input();
        port.push_incoming("fresh\r\n");

        assert_eq!(reader.read_line().await.unwrap(), "fresh");
    }
}
