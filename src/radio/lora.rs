//! LoRaWAN modem (RAK3172-style AT firmware) over a UART
//!
//! Frames go out as confirmed uplinks; the network server's acknowledgement
//! arrives as a `+EVT:SEND_CONFIRMED_OK` event, usually preceded by an
//! `+EVT:RX_` event carrying RSSI and SNR.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::at::{is_error_line, to_hex, AtModem};
use super::{Ack, LinkQuality, RadioDriver, RadioVariant};
use crate::error::LinkError;
use crate::serial::SerialPortIO;

/// Timeout for commands answered locally by the modem
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse `+EVT:RX_<slot>:<rssi>:<snr>:...` into a link quality
pub fn parse_rx_event(line: &str) -> Option<LinkQuality> {
    let rest = line.strip_prefix("+EVT:RX_")?;
    let mut fields = rest.split(':').skip(1);
    let rssi_dbm = fields.next()?.trim().parse().ok()?;
    let snr_db = fields.next().and_then(|s| s.trim().parse().ok());
    Some(LinkQuality { rssi_dbm, snr_db })
}

pub struct LoraModem<P: SerialPortIO> {
    at: AtModem<P>,
    fport: u8,
    max_frame_len: usize,
    join_timeout: Duration,
    joined: bool,
    /// Join command accepted; the accept event is still outstanding
    join_requested: bool,
    /// `AT+SEND` written; its result code is still outstanding
    send_issued: bool,
    awaiting_ack: bool,
    last_rx: Option<LinkQuality>,
}

impl<P: SerialPortIO> LoraModem<P> {
    /// # Arguments
    ///
    /// * `port` - UART connected to the modem
    /// * `fport` - LoRaWAN application port for uplinks
    /// * `max_frame_len` - Largest payload for the configured data rate
    /// * `join_timeout` - How long to wait for the join accept
    pub fn new(port: P, fport: u8, max_frame_len: usize, join_timeout: Duration) -> Self {
        Self {
            at: AtModem::new(port),
            fport,
            max_frame_len,
            join_timeout,
            joined: false,
            join_requested: false,
            send_issued: false,
            awaiting_ack: false,
            last_rx: None,
        }
    }
}

#[async_trait]
impl<P: SerialPortIO> RadioDriver for LoraModem<P> {
    fn variant(&self) -> RadioVariant {
        RadioVariant::Lora
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn is_connected(&self) -> bool {
        self.joined
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.joined {
            return Ok(());
        }

        // Confirmed uplinks, then OTAA join
        if !self.join_requested {
            self.at.command("AT+CFM=1", COMMAND_TIMEOUT).await?;
            self.at.command("AT+JOIN=1:0:10:8", COMMAND_TIMEOUT).await?;
            self.join_requested = true;
        }

        let result = self
            .at
            .wait_for(self.join_timeout, |line| {
                if line == "+EVT:JOINED" {
                    Some(Ok(()))
                } else if line.starts_with("+EVT:JOIN_FAILED") {
                    Some(Err(LinkError::Modem(line.to_string())))
                } else {
                    None
                }
            })
            .await;
        self.join_requested = false;
        result?;

        info!("LoRaWAN network joined");
        self.joined = true;
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.joined {
            return Err(LinkError::Disconnected);
        }

        if !self.send_issued {
            if frame.len() > self.max_frame_len {
                return Err(LinkError::Modem(format!(
                    "frame of {} bytes exceeds LoRa payload limit {}",
                    frame.len(),
                    self.max_frame_len
                )));
            }
            self.at.discard_input();
            self.last_rx = None;
            self.at.send_raw(&format!("AT+SEND={}:{}", self.fport, to_hex(frame))).await?;
            self.send_issued = true;
        }

        let result = self
            .at
            .wait_for(COMMAND_TIMEOUT, |line| {
                if line == "OK" {
                    Some(Ok(()))
                } else if line == "AT_NO_NETWORK_JOINED" {
                    Some(Err(LinkError::Disconnected))
                } else if is_error_line(line) {
                    Some(Err(LinkError::Modem(format!("send rejected: {}", line))))
                } else {
                    None
                }
            })
            .await;
        self.send_issued = false;

        if result == Err(LinkError::Disconnected) {
            warn!("Modem lost its LoRaWAN session");
            self.joined = false;
        }
        result?;

        debug!("LoRa uplink queued ({} bytes)", frame.len());
        self.awaiting_ack = true;
        Ok(())
    }

    async fn poll_ack(&mut self) -> Result<Option<Ack>, LinkError> {
        if !self.awaiting_ack {
            return Ok(None);
        }

        loop {
            let line = self.at.next_line().await?;

            if let Some(quality) = parse_rx_event(&line) {
                self.last_rx = Some(quality);
            } else if line == "+EVT:SEND_CONFIRMED_OK" {
                self.awaiting_ack = false;
                return Ok(Some(Ack::Accepted(self.last_rx.take())));
            } else if line.starts_with("+EVT:SEND_CONFIRMED_FAILED") {
                self.awaiting_ack = false;
                return Ok(Some(Ack::Rejected));
            }
        }
    }

    async fn disconnect(&mut self) {
        self.joined = false;
        self.join_requested = false;
        self.send_issued = false;
        self.awaiting_ack = false;
        self.last_rx = None;
        self.at.discard_input();
    }
}
