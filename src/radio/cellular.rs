//! LTE-M / NB-IoT modem (Quectel-style AT firmware) with a TCP socket to the
//! backend
//!
//! The backend answers every frame with a single `ACK` or `NAK` line, pushed
//! by the modem in direct-push mode after a `+QIURC: "recv"` URC.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::at::{is_error_line, to_hex, AtModem};
use super::{Ack, LinkQuality, RadioDriver, RadioVariant};
use crate::error::LinkError;
use crate::serial::SerialPortIO;

/// Timeout for commands answered locally by the modem
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Convert a `+CSQ: <rssi>,<ber>` line to dBm (`99` means unknown)
pub fn parse_csq(line: &str) -> Option<i16> {
    let rest = line.strip_prefix("+CSQ:")?;
    let csq: i16 = rest.split(',').next()?.trim().parse().ok()?;
    if csq > 31 {
        return None;
    }
    Some(-113 + 2 * csq)
}

fn is_socket_closed(line: &str) -> bool {
    line.starts_with("+QIURC: \"closed\"")
}

pub struct CellularModem<P: SerialPortIO> {
    at: AtModem<P>,
    host: String,
    port: u16,
    max_frame_len: usize,
    open_timeout: Duration,
    connected: bool,
    /// `AT+QIOPEN` accepted; the open result URC is still outstanding
    open_requested: bool,
    /// `AT+QISENDEX` written; `SEND OK` is still outstanding
    send_issued: bool,
    awaiting_ack: bool,
    /// A `recv` URC arrived; the next line is the backend's verdict
    reply_pending: bool,
    /// The backend sent `ACK`; signal quality is still to be read
    ack_received: bool,
}

impl<P: SerialPortIO> CellularModem<P> {
    pub fn new(port: P, host: &str, tcp_port: u16, max_frame_len: usize, open_timeout: Duration) -> Self {
        Self {
            at: AtModem::new(port),
            host: host.to_string(),
            port: tcp_port,
            max_frame_len,
            open_timeout,
            connected: false,
            open_requested: false,
            send_issued: false,
            awaiting_ack: false,
            reply_pending: false,
            ack_received: false,
        }
    }

    async fn signal_quality(&mut self) -> Option<LinkQuality> {
        match self.at.command("AT+CSQ", COMMAND_TIMEOUT).await {
            Ok(info) => info.iter().find_map(|line| parse_csq(line)).map(|rssi_dbm| LinkQuality {
                rssi_dbm,
                snr_db: None,
            }),
            Err(e) => {
                debug!("Signal quality query failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl<P: SerialPortIO> RadioDriver for CellularModem<P> {
    fn variant(&self) -> RadioVariant {
        RadioVariant::Cellular
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.connected {
            return Ok(());
        }

        if !self.open_requested {
            self.at.command("AT+CGATT=1", COMMAND_TIMEOUT).await?;
            let open = format!("AT+QIOPEN=1,0,\"TCP\",\"{}\",{},0,1", self.host, self.port);
            self.at.command(&open, COMMAND_TIMEOUT).await?;
            self.open_requested = true;
        }

        let result = self
            .at
            .wait_for(self.open_timeout, |line| {
                let code = line.strip_prefix("+QIOPEN: 0,")?;
                if code.trim() == "0" {
                    Some(Ok(()))
                } else {
                    Some(Err(LinkError::Modem(format!("socket open failed: {}", line))))
                }
            })
            .await;
        self.open_requested = false;
        result?;

        info!("TCP socket open to {}:{}", self.host, self.port);
        self.connected = true;
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::Disconnected);
        }

        if !self.send_issued {
            if frame.len() > self.max_frame_len {
                return Err(LinkError::Modem(format!(
                    "frame of {} bytes exceeds socket send limit {}",
                    frame.len(),
                    self.max_frame_len
                )));
            }
            self.at.discard_input();
            self.reply_pending = false;
            self.ack_received = false;
            self.at.send_raw(&format!("AT+QISENDEX=0,\"{}\"", to_hex(frame))).await?;
            self.send_issued = true;
        }

        let result = self
            .at
            .wait_for(COMMAND_TIMEOUT, |line| {
                if line == "SEND OK" {
                    Some(Ok(()))
                } else if is_socket_closed(line) {
                    Some(Err(LinkError::Disconnected))
                } else if line == "SEND FAIL" || is_error_line(line) {
                    Some(Err(LinkError::Modem(format!("send rejected: {}", line))))
                } else {
                    None
                }
            })
            .await;
        self.send_issued = false;

        if result == Err(LinkError::Disconnected) {
            warn!("Backend closed the socket during send");
            self.connected = false;
        }
        result?;

        debug!("Cellular frame sent ({} bytes)", frame.len());
        self.awaiting_ack = true;
        Ok(())
    }

    async fn poll_ack(&mut self) -> Result<Option<Ack>, LinkError> {
        if !self.ack_received {
            if !self.awaiting_ack {
                return Ok(None);
            }

            loop {
                let line = self.at.next_line().await?;

                if is_socket_closed(&line) {
                    self.connected = false;
                    self.awaiting_ack = false;
                    return Err(LinkError::Disconnected);
                }
                if line.starts_with("+QIURC: \"recv\"") {
                    self.reply_pending = true;
                    continue;
                }
                if !self.reply_pending {
                    continue;
                }

                match line.as_str() {
                    "ACK" => {
                        self.reply_pending = false;
                        self.awaiting_ack = false;
                        self.ack_received = true;
                        break;
                    }
                    "NAK" => {
                        self.reply_pending = false;
                        self.awaiting_ack = false;
                        return Ok(Some(Ack::Rejected));
                    }
                    other => debug!("Ignoring backend reply '{}'", other),
                }
            }
        }

        let quality = self.signal_quality().await;
        self.ack_received = false;
        Ok(Some(Ack::Accepted(quality)))
    }

    async fn disconnect(&mut self) {
        let was_connected = self.connected;
        self.connected = false;
        self.open_requested = false;
        self.send_issued = false;
        self.awaiting_ack = false;
        self.reply_pending = false;
        self.ack_received = false;
        self.at.discard_input();

        if was_connected {
            if let Err(e) = self.at.command("AT+QICLOSE=0", COMMAND_TIMEOUT).await {
                debug!("Socket close failed: {}", e);
            }
        }
    }
}
