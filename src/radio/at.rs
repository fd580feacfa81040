//! AT command channel shared by the LoRa and cellular modems

use std::io;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::serial::{LineReader, SerialPortIO};

/// Map a serial failure onto the link error taxonomy
pub fn io_to_link(e: io::Error) -> LinkError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => {
            LinkError::Disconnected
        }
        _ => LinkError::Modem(e.to_string()),
    }
}

/// Final result codes that mean the command failed
pub fn is_error_line(line: &str) -> bool {
    line == "ERROR"
        || line.starts_with("+CME ERROR")
        || line.starts_with("+CMS ERROR")
        || (line.starts_with("AT_") && line.ends_with("ERROR"))
        || line == "AT_NO_NETWORK_JOINED"
}

/// Uppercase hex, as both modems expect binary payloads
pub fn to_hex(data: &[u8]) -> String {
    use std::fmt::Write;
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02X}", b);
        out
    })
}

pub struct AtModem<P: SerialPortIO> {
    reader: LineReader<P>,
}

impl<P: SerialPortIO> AtModem<P> {
    pub fn new(port: P) -> Self {
        Self {
            reader: LineReader::new(port),
        }
    }

    /// Send a command and collect its information lines up to `OK`
    ///
    /// # Errors
    ///
    /// * `Timeout` - no final result code within `timeout`
    /// * `Modem` - the modem answered with an error result code
    /// * `Disconnected` - the serial port closed
    pub async fn command(&mut self, cmd: &str, timeout: Duration) -> Result<Vec<String>, LinkError> {
        debug!("AT command: {}", cmd);
        self.reader.write_line(cmd).await.map_err(io_to_link)?;

        let mut info = Vec::new();
        let result = tokio::time::timeout(timeout, async {
            loop {
                let line = match self.reader.read_line().await {
                    Ok(line) => line,
                    Err(e) => return Err(io_to_link(e)),
                };
                if line == cmd {
                    continue; // echo
                }
                if line == "OK" {
                    return Ok(());
                }
                if is_error_line(&line) {
                    return Err(LinkError::Modem(format!("{} -> {}", cmd, line)));
                }
                info.push(line);
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(info),
            Ok(Err(e)) => {
                warn!("AT command {} failed: {}", cmd, e);
                Err(e)
            }
            Err(_) => {
                warn!("AT command {} timed out after {:?}", cmd, timeout);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Send a command without waiting for any reply
    pub async fn send_raw(&mut self, cmd: &str) -> Result<(), LinkError> {
        debug!("AT command: {}", cmd);
        self.reader.write_line(cmd).await.map_err(io_to_link)
    }

    /// Read lines until `matcher` recognizes one
    ///
    /// Lines the matcher returns `None` for are skipped.
    pub async fn wait_for<T, F>(&mut self, timeout: Duration, mut matcher: F) -> Result<T, LinkError>
    where
        F: FnMut(&str) -> Option<Result<T, LinkError>> + Send,
        T: Send,
    {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let line = match self.reader.read_line().await {
                    Ok(line) => line,
                    Err(e) => return Err(io_to_link(e)),
                };
                if let Some(verdict) = matcher(&line) {
                    return verdict;
                }
            }
        })
        .await;

        result.unwrap_or(Err(LinkError::Timeout))
    }

    /// Next line with no time bound (callers wrap it in a timeout)
    pub async fn next_line(&mut self) -> Result<String, LinkError> {
        self.reader.read_line().await.map_err(io_to_link)
    }

    pub fn discard_input(&mut self) {
        self.reader.discard_input();
    }
}
