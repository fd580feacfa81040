//! # Radio Module
//!
//! Uplink drivers and the link manager that owns the radio session.
//!
//! This module handles:
//! - The capability set every radio variant implements ([`RadioDriver`])
//! - LoRaWAN and cellular modems driven by AT commands over a UART
//! - The link session state machine with exponential backoff ([`link`])

pub mod at;
pub mod cellular;
pub mod link;
pub mod lora;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

pub use link::{LinkEvent, LinkManager, LinkSession, LinkTimings, SendOutcome};

/// Uplink hardware selected at init time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioVariant {
    #[default]
    Simulated,
    Lora,
    Cellular,
}

impl std::fmt::Display for RadioVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RadioVariant::Simulated => "simulated",
            RadioVariant::Lora => "lora",
            RadioVariant::Cellular => "cellular",
        };
        f.write_str(name)
    }
}

/// Signal quality reported with an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub rssi_dbm: i16,
    /// `None` where the modem does not report SNR
    pub snr_db: Option<i8>,
}

/// Delivery verdict for the last transmitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted(Option<LinkQuality>),
    Rejected,
}

/// Capability set shared by every radio variant
///
/// One frame is outstanding at a time: `transmit` hands it to the radio and
/// `poll_ack` waits for that frame's verdict.
///
/// Callers bound every call with a short timeout and drop the future when it
/// expires. `connect`, `transmit` and `poll_ack` must survive that: calling
/// again resumes the request already issued (an unfinished `transmit` is
/// called again with the same frame) instead of starting a second one.
/// `disconnect` abandons anything in progress and must clear local session
/// state before its first await.
#[async_trait]
pub trait RadioDriver: Send {
    fn variant(&self) -> RadioVariant;

    /// Largest frame the link carries in one transmission
    fn max_frame_len(&self) -> usize;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), LinkError>;

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// `Ok(None)` when no verdict is available yet
    async fn poll_ack(&mut self) -> Result<Option<Ack>, LinkError>;

    /// Drop the session; the next `connect` starts fresh
    async fn disconnect(&mut self);
}
