//! Scriptable radio
//!
//! Each transmission takes the next scripted outcome, or acknowledges when
//! the script is empty. Clones share state, so a handle kept outside the
//! link manager can script outcomes and inspect the frames sent.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::LinkError;
use crate::radio::{Ack, LinkQuality, RadioDriver, RadioVariant};

/// Link quality reported with every simulated acknowledgement
pub const SIMULATED_QUALITY: LinkQuality = LinkQuality {
    rssi_dbm: -97,
    snr_db: Some(6),
};

/// What happens to the next transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ack,
    Nak,
    /// Sent, but no verdict ever arrives
    NoAck,
    /// The link drops while the frame is going out
    Disconnect,
    /// The next connect attempt is refused
    ConnectFail,
    /// Connect never completes until the attempt is abandoned with a
    /// disconnect
    ConnectStall,
}

#[derive(Debug, Default)]
struct RadioState {
    connected: bool,
    script: VecDeque<ScriptedOutcome>,
    pending: Option<ScriptedOutcome>,
    failure_every: u32,
    transmissions: u64,
    connects: u32,
    frames: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
    max_frame_len: usize,
}

impl SimulatedRadio {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState::default())),
            max_frame_len,
        }
    }

    /// NAK every Nth transmission that has no scripted outcome (0 = never)
    pub fn with_failure_every(self, failure_every: u32) -> Self {
        self.lock().failure_every = failure_every;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn script(&self, outcome: ScriptedOutcome) {
        self.lock().script.push_back(outcome);
    }

    /// Every frame handed to `transmit`, in order
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    fn variant(&self) -> RadioVariant {
        RadioVariant::Simulated
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn is_connected(&self) -> bool {
        SimulatedRadio::is_connected(self)
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        let stalled = {
            let mut state = self.lock();
            match state.script.front() {
                Some(ScriptedOutcome::ConnectFail) => {
                    state.script.pop_front();
                    return Err(LinkError::Modem("simulated join rejected".to_string()));
                }
                Some(ScriptedOutcome::ConnectStall) => true,
                _ => {
                    state.connected = true;
                    state.connects += 1;
                    false
                }
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let max = self.max_frame_len;
        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if frame.len() > max {
            return Err(LinkError::Modem(format!("frame of {} bytes exceeds {}", frame.len(), max)));
        }

        state.frames.push(frame.to_vec());
        state.transmissions += 1;

        let outcome = match state.script.pop_front() {
            Some(outcome) => outcome,
            None if state.failure_every > 0 && state.transmissions % u64::from(state.failure_every) == 0 => {
                ScriptedOutcome::Nak
            }
            None => ScriptedOutcome::Ack,
        };

        if outcome == ScriptedOutcome::Disconnect {
            state.connected = false;
            state.pending = None;
            return Err(LinkError::Disconnected);
        }
        state.pending = Some(outcome);
        Ok(())
    }

    async fn poll_ack(&mut self) -> Result<Option<Ack>, LinkError> {
        let mut state = self.lock();
        match state.pending {
            Some(ScriptedOutcome::Ack) => {
                state.pending = None;
                Ok(Some(Ack::Accepted(Some(SIMULATED_QUALITY))))
            }
            Some(ScriptedOutcome::Nak) => {
                state.pending = None;
                Ok(Some(Ack::Rejected))
            }
            _ => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        let mut state = self.lock();
        if state.script.front() == Some(&ScriptedOutcome::ConnectStall) {
            state.script.pop_front();
        }
        state.connected = false;
        state.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_acknowledges() {
        let mut radio = SimulatedRadio::new(64);
        radio.connect().await.unwrap();
        radio.transmit(&[1, 2, 3]).await.unwrap();

        assert_eq!(radio.poll_ack().await, Ok(Some(Ack::Accepted(Some(SIMULATED_QUALITY)))));
        assert_eq!(radio.poll_ack().await, Ok(None));
        assert_eq!(radio.frames(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_script_runs_in_order() {
        let mut radio = SimulatedRadio::new(64);
        radio.script(ScriptedOutcome::Nak);
        radio.script(ScriptedOutcome::Disconnect);
        radio.connect().await.unwrap();

        radio.transmit(&[1]).await.unwrap();
        assert_eq!(radio.poll_ack().await, Ok(Some(Ack::Rejected)));

        assert_eq!(radio.transmit(&[2]).await, Err(LinkError::Disconnected));
        assert!(!RadioDriver::is_connected(&radio));
        assert_eq!(radio.transmit(&[3]).await, Err(LinkError::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_fail_consumed_once() {
        let mut radio = SimulatedRadio::new(64);
        radio.script(ScriptedOutcome::ConnectFail);

        assert!(matches!(radio.connect().await, Err(LinkError::Modem(_))));
        radio.connect().await.unwrap();
        assert_eq!(radio.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stall_lasts_until_disconnect() {
        let mut radio = SimulatedRadio::new(64);
        radio.script(ScriptedOutcome::ConnectStall);

        let stalled = tokio::time::timeout(std::time::Duration::from_secs(60), radio.connect()).await;
        assert!(stalled.is_err());
        assert!(tokio::time::timeout(std::time::Duration::from_secs(60), radio.connect()).await.is_err());

        radio.disconnect().await;
        radio.connect().await.unwrap();
        assert!(RadioDriver::is_connected(&radio));
    }

    #[tokio::test]
    async fn test_periodic_failures() {
        let mut radio = SimulatedRadio::new(64).with_failure_every(2);
        radio.connect().await.unwrap();

        radio.transmit(&[1]).await.unwrap();
        assert!(matches!(radio.poll_ack().await, Ok(Some(Ack::Accepted(_)))));
        radio.transmit(&[2]).await.unwrap();
        assert_eq!(radio.poll_ack().await, Ok(Some(Ack::Rejected)));
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let mut radio = SimulatedRadio::new(4);
        radio.connect().await.unwrap();
        assert!(matches!(radio.transmit(&[0; 5]).await, Err(LinkError::Modem(_))));
        assert!(radio.frames().is_empty());
    }
}
