//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Read whatever is available, waiting for at least one byte
    ///
    /// Returns `Ok(0)` only when the port is closed.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Wrapper around tokio_serial::SerialStream that implements SerialPortIO
pub struct TokioSerialPort {
    port: tokio_serial::SerialStream,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self { port }
    }
}

#[async_trait]
impl SerialPortIO for TokioSerialPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        self.port.read(buf).await
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Mock serial port for testing
    ///
    /// Every `write_all` records the data and, if one is queued, makes the
    /// next scripted reply readable. `read` waits until bytes are available.
    #[derive(Clone)]
    pub struct MockSerialPort {
        pub written_data: Arc<Mutex<Vec<Vec<u8>>>>,
        pub write_error: Arc<Mutex<Option<io::ErrorKind>>>,
        pub flush_error: Arc<Mutex<Option<io::ErrorKind>>>,
        replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        incoming: Arc<Mutex<VecDeque<u8>>>,
        readable: Arc<Notify>,
    }

    impl MockSerialPort {
        pub fn new() -> Self {
            Self {
                written_data: Arc::new(Mutex::new(Vec::new())),
                write_error: Arc::new(Mutex::new(None)),
                flush_error: Arc::new(Mutex::new(None)),
                replies: Arc::new(Mutex::new(VecDeque::new())),
                incoming: Arc::new(Mutex::new(VecDeque::new())),
                readable: Arc::new(Notify::new()),
            }
        }

        pub fn get_written_data(&self) -> Vec<Vec<u8>> {
            self.written_data.lock().unwrap().clone()
        }

        /// Written data as trimmed text lines
        pub fn get_written_lines(&self) -> Vec<String> {
            self.get_written_data()
                .iter()
                .map(|d| String::from_utf8_lossy(d).trim().to_string())
                .collect()
        }

        pub fn set_write_error(&self, error: io::ErrorKind) {
            *self.write_error.lock().unwrap() = Some(error);
        }

        pub fn set_flush_error(&self, error: io::ErrorKind) {
            *self.flush_error.lock().unwrap() = Some(error);
        }

        /// Queue the reply to the next write (may be empty for "no reply")
        pub fn queue_reply(&self, reply: &str) {
            self.replies.lock().unwrap().push_back(reply.as_bytes().to_vec());
        }

        /// Make bytes readable right away (unsolicited output)
        pub fn push_incoming(&self, data: &str) {
            self.incoming.lock().unwrap().extend(data.as_bytes());
            self.readable.notify_one();
        }
    }

    #[async_trait]
    impl SerialPortIO for MockSerialPort {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            if let Some(error) = *self.write_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock write error"));
            }
            self.written_data.lock().unwrap().push(data.to_vec());

            let reply = self.replies.lock().unwrap().pop_front();
            if let Some(reply) = reply {
                self.incoming.lock().unwrap().extend(reply);
                self.readable.notify_one();
            }
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            if let Some(error) = *self.flush_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock flush error"));
            }
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                {
                    let mut incoming = self.incoming.lock().unwrap();
                    if !incoming.is_empty() {
                        let n = buf.len().min(incoming.len());
                        for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
                            *slot = byte;
                        }
                        return Ok(n);
                    }
                }
                self.readable.notified().await;
            }
        }
    }
}
