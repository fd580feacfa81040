//! Link session state machine
//!
//! `Idle -> Connecting -> Transmitting -> WaitingAck -> Idle | Backoff`.
//! The manager owns at most one outstanding batch. Each [`LinkManager::poll`]
//! waits on the radio for at most one step budget; an unfinished connect,
//! transmit or acknowledgement is picked up again by the next poll, and each
//! phase fails with `Timeout` once its own deadline passes. A session spans
//! ticks only through the explicit [`LinkSession`] value.

use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{Ack, LinkQuality, RadioDriver, RadioVariant};
use crate::config::RadioConfig;
use crate::error::LinkError;
use crate::power::PowerTier;
use crate::sample::Batch;
use crate::telemetry::encoder::TelemetryEncoder;

/// Radio timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    pub connect_timeout: Duration,
    pub transmit_timeout: Duration,
    pub ack_timeout: Duration,
    /// Longest a single poll waits on the radio (closing a session may take
    /// one more step)
    pub step: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self::from(&RadioConfig::default())
    }
}

impl From<&RadioConfig> for LinkTimings {
    fn from(config: &RadioConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            transmit_timeout: Duration::from_millis(config.transmit_timeout_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            step: Duration::from_millis(config.poll_budget_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/// Transient state of the radio conversation; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSession {
    Idle,
    Connecting { deadline: Instant },
    Transmitting { deadline: Instant },
    WaitingAck { deadline: Instant },
    Backoff { until: Instant },
}

impl LinkSession {
    /// A conversation with the radio is open
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LinkSession::Connecting { .. } | LinkSession::Transmitting { .. } | LinkSession::WaitingAck { .. }
        )
    }
}

/// What happened to the outstanding batch; ownership returns to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Delivered {
        batch: Batch,
        quality: Option<LinkQuality>,
    },
    Failed {
        batch: Batch,
        reason: LinkError,
        backoff: Duration,
    },
    /// A regular batch was abandoned because the tier became Critical
    Aborted { batch: Batch },
}

/// Result of a blocking [`LinkManager::send`]
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(Option<LinkQuality>),
    Failed(LinkError),
}

/// Outcome of one bounded radio call
enum Step<T> {
    Done(T),
    Failed(LinkError),
    /// Budget used up before the call finished
    Pending,
}

/// Exponential backoff: `base * 2^(failures - 1)`, capped
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use collar_firmware::radio::link::backoff_delay;
///
/// let base = Duration::from_secs(2);
/// let cap = Duration::from_secs(10);
/// assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(2));
/// assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(8));
/// assert_eq!(backoff_delay(base, cap, 4), Duration::from_secs(10));
/// ```
pub fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Run `call` until `deadline` or `budget_end`, whichever comes first
///
/// Past the phase deadline an unfinished call becomes `Timeout`; past only
/// the budget it is left for the next poll.
async fn bounded<T, F>(call: F, deadline: Instant, budget_end: Instant) -> Step<T>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match timeout_at(deadline.min(budget_end), call).await {
        Ok(Ok(value)) => Step::Done(value),
        Ok(Err(e)) => Step::Failed(e),
        Err(_) if Instant::now() >= deadline => Step::Failed(LinkError::Timeout),
        Err(_) => Step::Pending,
    }
}

pub struct LinkManager {
    radio: Box<dyn RadioDriver>,
    encoder: TelemetryEncoder,
    timings: LinkTimings,
    session: LinkSession,
    outstanding: Option<Batch>,
    consecutive_failures: u32,
    last_quality: Option<LinkQuality>,
}

impl LinkManager {
    pub fn new(radio: Box<dyn RadioDriver>, encoder: TelemetryEncoder, timings: LinkTimings) -> Self {
        info!(
            "Link manager using {} radio (max frame {} bytes)",
            radio.variant(),
            radio.max_frame_len()
        );
        Self {
            radio,
            encoder,
            timings,
            session: LinkSession::Idle,
            outstanding: None,
            consecutive_failures: 0,
            last_quality: None,
        }
    }

    pub fn session(&self) -> LinkSession {
        self.session
    }

    pub fn variant(&self) -> RadioVariant {
        self.radio.variant()
    }

    pub fn max_frame_len(&self) -> usize {
        self.radio.max_frame_len()
    }

    pub fn timings(&self) -> &LinkTimings {
        &self.timings
    }

    pub fn outstanding(&self) -> Option<&Batch> {
        self.outstanding.as_ref()
    }

    /// A batch is owned by the link and has no verdict yet
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Idle, with any backoff elapsed
    pub fn ready(&self) -> bool {
        if self.is_busy() {
            return false;
        }
        match self.session {
            LinkSession::Backoff { until } => Instant::now() >= until,
            _ => true,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Quality reported with the most recent acknowledgement
    pub fn last_quality(&self) -> Option<LinkQuality> {
        self.last_quality
    }

    /// Hand a batch to the link
    ///
    /// # Errors
    ///
    /// Returns the batch unchanged if another one is outstanding.
    pub fn submit(&mut self, batch: Batch) -> Result<(), Batch> {
        if self.is_busy() {
            return Err(batch);
        }
        debug!(
            "Batch {} submitted ({} samples, emergency: {})",
            batch.id(),
            batch.len(),
            batch.is_emergency()
        );
        self.outstanding = Some(batch);
        Ok(())
    }

    /// Advance the session by one bounded step
    ///
    /// Waits on the radio for at most [`LinkTimings::step`], plus one more
    /// step if the session has to be closed.
    ///
    /// # Returns
    ///
    /// An event once the outstanding batch has a verdict, `None` while the
    /// session is still in progress (or there is nothing to send).
    pub async fn poll(&mut self, tier: PowerTier) -> Option<LinkEvent> {
        let emergency = self.outstanding.as_ref()?.is_emergency();

        if tier == PowerTier::Critical && !emergency {
            warn!("Critical tier: aborting regular uplink");
            let batch = self.reset_session().await?;
            return Some(LinkEvent::Aborted { batch });
        }

        let budget_end = Instant::now() + self.timings.step;
        match self.session {
            LinkSession::Backoff { until } if Instant::now() < until => None,
            LinkSession::Connecting { deadline } => self.step_connect(deadline, budget_end).await,
            LinkSession::Transmitting { deadline } => self.step_transmit(deadline, budget_end).await,
            LinkSession::WaitingAck { deadline } => self.step_ack(deadline, budget_end).await,
            LinkSession::Idle | LinkSession::Backoff { .. } => self.start_attempt(budget_end).await,
        }
    }

    /// Drop the current session and hand back its batch
    ///
    /// The radio is disconnected if a conversation was in progress and any
    /// backoff is skipped, so the next batch starts on a fresh session.
    pub async fn preempt(&mut self) -> Option<Batch> {
        let batch = self.reset_session().await;
        self.session = LinkSession::Idle;
        if let Some(batch) = &batch {
            info!("Batch {} preempted", batch.id());
        }
        batch
    }

    /// Send one batch to a verdict, waiting out any backoff first
    ///
    /// Tier gating is left to the caller.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use collar_firmware::radio::{LinkManager, LinkTimings, SendOutcome};
    /// use collar_firmware::sample::Batch;
    /// use collar_firmware::sim::SimulatedRadio;
    /// use collar_firmware::telemetry::encoder::TelemetryEncoder;
    ///
    /// # async fn run() {
    /// let radio = SimulatedRadio::new(222);
    /// let mut link = LinkManager::new(Box::new(radio), TelemetryEncoder::new(1), LinkTimings::default());
    /// let outcome = link.send(&Batch::new(1, Vec::new())).await;
    /// assert!(matches!(outcome, SendOutcome::Delivered(_)));
    /// # }
    /// ```
    pub async fn send(&mut self, batch: &Batch) -> SendOutcome {
        if self.submit(batch.clone()).is_err() {
            return SendOutcome::Failed(LinkError::Modem("another batch is outstanding".to_string()));
        }

        loop {
            if let LinkSession::Backoff { until } = self.session {
                tokio::time::sleep_until(until).await;
            }
            let started = Instant::now();
            match self.poll(PowerTier::Normal).await {
                Some(LinkEvent::Delivered { quality, .. }) => return SendOutcome::Delivered(quality),
                Some(LinkEvent::Failed { reason, .. }) => return SendOutcome::Failed(reason),
                Some(LinkEvent::Aborted { .. }) => return SendOutcome::Failed(LinkError::Disconnected),
                None => tokio::time::sleep_until(started + self.timings.step).await,
            }
        }
    }

    async fn start_attempt(&mut self, budget_end: Instant) -> Option<LinkEvent> {
        if self.radio.is_connected() {
            return self.begin_transmit(budget_end).await;
        }
        let deadline = Instant::now() + self.timings.connect_timeout;
        self.session = LinkSession::Connecting { deadline };
        debug!("Connecting {} radio", self.radio.variant());
        self.step_connect(deadline, budget_end).await
    }

    async fn step_connect(&mut self, deadline: Instant, budget_end: Instant) -> Option<LinkEvent> {
        match bounded(self.radio.connect(), deadline, budget_end).await {
            Step::Done(()) => self.begin_transmit(budget_end).await,
            Step::Failed(e) => self.fail(e).await,
            Step::Pending => None,
        }
    }

    async fn begin_transmit(&mut self, budget_end: Instant) -> Option<LinkEvent> {
        let deadline = Instant::now() + self.timings.transmit_timeout;
        self.session = LinkSession::Transmitting { deadline };
        self.step_transmit(deadline, budget_end).await
    }

    async fn step_transmit(&mut self, deadline: Instant, budget_end: Instant) -> Option<LinkEvent> {
        let batch = self.outstanding.as_ref()?;
        let batch_id = batch.id();
        let frame = match self.encoder.encode(batch) {
            Ok(frame) => frame,
            Err(e) => return self.fail(LinkError::Modem(e.to_string())).await,
        };

        match bounded(self.radio.transmit(&frame), deadline, budget_end).await {
            Step::Done(()) => {
                debug!("Batch {} transmitted ({} bytes), waiting for ack", batch_id, frame.len());
                let deadline = Instant::now() + self.timings.ack_timeout;
                self.session = LinkSession::WaitingAck { deadline };
                self.step_ack(deadline, budget_end).await
            }
            Step::Failed(e) => self.fail(e).await,
            Step::Pending => None,
        }
    }

    async fn step_ack(&mut self, deadline: Instant, budget_end: Instant) -> Option<LinkEvent> {
        if Instant::now() >= deadline {
            return self.fail(LinkError::Timeout).await;
        }

        match bounded(self.radio.poll_ack(), deadline, budget_end).await {
            Step::Done(Some(Ack::Accepted(quality))) => self.deliver(quality),
            Step::Done(Some(Ack::Rejected)) => self.fail(LinkError::NakReceived).await,
            Step::Failed(e) => self.fail(e).await,
            Step::Done(None) | Step::Pending => {
                if Instant::now() >= deadline {
                    self.fail(LinkError::Timeout).await
                } else {
                    None
                }
            }
        }
    }

    fn deliver(&mut self, quality: Option<LinkQuality>) -> Option<LinkEvent> {
        let batch = self.outstanding.take()?;
        self.session = LinkSession::Idle;
        self.consecutive_failures = 0;
        if quality.is_some() {
            self.last_quality = quality;
        }
        info!("Batch {} delivered ({} samples)", batch.id(), batch.len());
        Some(LinkEvent::Delivered { batch, quality })
    }

    async fn fail(&mut self, reason: LinkError) -> Option<LinkEvent> {
        let batch = self.outstanding.take()?;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let backoff = backoff_delay(
            self.timings.backoff_base,
            self.timings.backoff_cap,
            self.consecutive_failures,
        );

        // A late verdict must not be matched to the next frame, and an
        // unfinished connect or transmit must not resume into a new session
        if matches!(reason, LinkError::Timeout | LinkError::Disconnected) {
            self.close().await;
        }

        self.session = LinkSession::Backoff {
            until: Instant::now() + backoff,
        };
        warn!(
            "Batch {} failed: {} (failure #{}, backing off {:?})",
            batch.id(),
            reason,
            self.consecutive_failures,
            backoff
        );
        Some(LinkEvent::Failed { batch, reason, backoff })
    }

    /// Disconnect the radio, waiting at most one step
    async fn close(&mut self) {
        if timeout(self.timings.step, self.radio.disconnect()).await.is_err() {
            debug!("Radio disconnect unfinished after {:?}", self.timings.step);
        }
    }

    /// Take the outstanding batch, closing any conversation in progress
    async fn reset_session(&mut self) -> Option<Batch> {
        if self.session.is_active() {
            self.close().await;
            self.session = LinkSession::Idle;
        }
        self.outstanding.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Battery, Reading, Sample};
    use crate::sim::{ScriptedOutcome, SimulatedRadio};
    use crate::telemetry::decoder;

    fn timings() -> LinkTimings {
        LinkTimings {
            connect_timeout: Duration::from_secs(5),
            transmit_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            step: Duration::from_millis(50),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
        }
    }

    fn manager(radio: &SimulatedRadio, timings: LinkTimings) -> LinkManager {
        LinkManager::new(Box::new(radio.clone()), TelemetryEncoder::new(42), timings)
    }

    fn battery_batch(id: u32, first_seq: u32) -> Batch {
        let samples = (0..3)
            .map(|i| {
                Sample::new(
                    first_seq + i,
                    u64::from(i) * 1_000,
                    Reading::Battery(Battery { percent: 70, millivolts: 3_900, charging: false, solar: false }),
                )
            })
            .collect();
        Batch::new(id, samples)
    }

    fn emergency_batch(id: u32) -> Batch {
        Batch::emergency(
            id,
            vec![Sample::new(
                100,
                5_000,
                Reading::Battery(Battery { percent: 8, millivolts: 3_500, charging: false, solar: false }),
            )],
        )
    }

    #[test]
    fn test_backoff_delay_grows_then_plateaus() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        let delays: Vec<_> = (1..=6).map(|n| backoff_delay(base, cap, n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
        assert_eq!(backoff_delay(base, cap, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, cap, u32::MAX), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_returns_to_idle() {
        let radio = SimulatedRadio::new(222);
        let mut link = manager(&radio, timings());

        let batch = battery_batch(1, 10);
        link.submit(batch.clone()).unwrap();
        let event = link.poll(PowerTier::Normal).await;

        assert!(matches!(event, Some(LinkEvent::Delivered { batch: ref b, quality: Some(_) }) if *b == batch));
        assert_eq!(link.session(), LinkSession::Idle);
        assert!(!link.is_busy());
        assert!(link.last_quality().is_some());

        let frames = radio.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder::decode(&frames[0]).unwrap(), batch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_outstanding() {
        let radio = SimulatedRadio::new(222);
        let mut link = manager(&radio, timings());
        assert_eq!(link.poll(PowerTier::Normal).await, None);
        assert!(radio.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_while_busy_is_refused() {
        let radio = SimulatedRadio::new(222);
        let mut link = manager(&radio, timings());

        link.submit(battery_batch(1, 1)).unwrap();
        let refused = link.submit(battery_batch(2, 4)).unwrap_err();
        assert_eq!(refused.id(), 2);
        assert_eq!(link.outstanding().map(Batch::id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_increase_backoff() {
        let radio = SimulatedRadio::new(222);
        for _ in 0..3 {
            radio.script(ScriptedOutcome::Nak);
        }
        let mut link = manager(&radio, timings());
        let mut batch = battery_batch(1, 1);
        let mut delays = Vec::new();

        for _ in 0..3 {
            link.submit(batch).unwrap();
            match link.poll(PowerTier::Normal).await {
                Some(LinkEvent::Failed { batch: b, reason, backoff }) => {
                    assert_eq!(reason, LinkError::NakReceived);
                    delays.push(backoff);
                    batch = b;
                }
                other => panic!("expected failure, got {:?}", other),
            }

            // Still backing off: nothing is sent
            assert!(!link.ready());
            link.submit(batch.clone()).unwrap();
            assert_eq!(link.poll(PowerTier::Normal).await, None);
            batch = link.preempt_for_test();

            tokio::time::advance(*delays.last().unwrap()).await;
            assert!(link.ready());
        }

        assert_eq!(
            delays,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
        assert_eq!(link.consecutive_failures(), 3);
        assert_eq!(radio.frames().len(), 3);

        // Success resets the failure count
        link.submit(batch).unwrap();
        assert!(matches!(link.poll(PowerTier::Normal).await, Some(LinkEvent::Delivered { .. })));
        assert_eq!(link.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_plateaus_at_cap() {
        let radio = SimulatedRadio::new(222);
        for _ in 0..5 {
            radio.script(ScriptedOutcome::Nak);
        }
        let mut link = manager(
            &radio,
            LinkTimings {
                backoff_cap: Duration::from_secs(5),
                ..timings()
            },
        );

        let mut batch = battery_batch(1, 1);
        let mut delays = Vec::new();
        for _ in 0..5 {
            link.submit(batch).unwrap();
            match link.poll(PowerTier::Normal).await {
                Some(LinkEvent::Failed { batch: b, backoff, .. }) => {
                    delays.push(backoff.as_secs());
                    batch = b;
                }
                other => panic!("expected failure, got {:?}", other),
            }
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(delays, vec![2, 4, 5, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_fails_and_reconnects() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::NoAck);
        let mut link = manager(&radio, timings());

        link.submit(battery_batch(1, 1)).unwrap();
        assert_eq!(link.poll(PowerTier::Normal).await, None);
        assert!(matches!(link.session(), LinkSession::WaitingAck { .. }));

        tokio::time::advance(Duration::from_secs(10)).await;
        let event = link.poll(PowerTier::Normal).await;
        assert!(matches!(event, Some(LinkEvent::Failed { reason: LinkError::Timeout, .. })));
        assert!(matches!(link.session(), LinkSession::Backoff { .. }));
        assert!(!radio.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_spans_polls_then_times_out() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::ConnectStall);
        let mut link = manager(&radio, timings());
        link.submit(battery_batch(1, 1)).unwrap();

        let started = Instant::now();
        assert_eq!(link.poll(PowerTier::Normal).await, None);
        assert_eq!(started.elapsed(), Duration::from_millis(50));
        let deadline = match link.session() {
            LinkSession::Connecting { deadline } => deadline,
            other => panic!("expected Connecting, got {:?}", other),
        };
        assert_eq!(deadline, started + Duration::from_secs(5));

        // Later polls each wait one step and keep the same deadline
        tokio::time::advance(Duration::from_secs(1)).await;
        let before = Instant::now();
        assert_eq!(link.poll(PowerTier::Normal).await, None);
        assert_eq!(before.elapsed(), Duration::from_millis(50));
        assert_eq!(link.session(), LinkSession::Connecting { deadline });

        tokio::time::advance(Duration::from_secs(4)).await;
        let event = link.poll(PowerTier::Normal).await;
        assert!(matches!(event, Some(LinkEvent::Failed { reason: LinkError::Timeout, .. })));
        assert!(matches!(link.session(), LinkSession::Backoff { .. }));
        assert!(radio.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_abandoned_connect_delivers() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::ConnectStall);
        let mut link = manager(&radio, timings());

        let batch = battery_batch(1, 1);
        assert_eq!(link.send(&batch).await, SendOutcome::Failed(LinkError::Timeout));
        assert!(matches!(link.send(&batch).await, SendOutcome::Delivered(Some(_))));
        assert_eq!(radio.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_aborts_while_connecting() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::ConnectStall);
        let mut link = manager(&radio, timings());

        let batch = battery_batch(1, 1);
        link.submit(batch.clone()).unwrap();
        assert_eq!(link.poll(PowerTier::Normal).await, None);
        assert!(link.session().is_active());

        assert_eq!(link.poll(PowerTier::Critical).await, Some(LinkEvent::Aborted { batch }));
        assert_eq!(link.session(), LinkSession::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_transmission_is_failure() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::Disconnect);
        let mut link = manager(&radio, timings());

        link.submit(battery_batch(1, 1)).unwrap();
        let event = link.poll(PowerTier::Normal).await;
        assert!(matches!(event, Some(LinkEvent::Failed { reason: LinkError::Disconnected, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::ConnectFail);
        let mut link = manager(&radio, timings());

        link.submit(battery_batch(1, 1)).unwrap();
        let event = link.poll(PowerTier::Normal).await;
        assert!(matches!(event, Some(LinkEvent::Failed { reason: LinkError::Modem(_), .. })));
        assert!(radio.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_tier_aborts_regular_batch() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::NoAck);
        let mut link = manager(&radio, timings());

        let batch = battery_batch(1, 1);
        link.submit(batch.clone()).unwrap();
        assert_eq!(link.poll(PowerTier::Normal).await, None);

        let event = link.poll(PowerTier::Critical).await;
        assert_eq!(event, Some(LinkEvent::Aborted { batch }));
        assert_eq!(link.session(), LinkSession::Idle);
        assert!(!radio.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_allowed_in_critical() {
        let radio = SimulatedRadio::new(222);
        let mut link = manager(&radio, timings());

        link.submit(emergency_batch(7)).unwrap();
        let event = link.poll(PowerTier::Critical).await;
        assert!(matches!(event, Some(LinkEvent::Delivered { batch, .. }) if batch.is_emergency()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_preempts_waiting_regular_batch() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::NoAck);
        let mut link = manager(&radio, timings());

        let regular = battery_batch(1, 1);
        link.submit(regular.clone()).unwrap();
        assert_eq!(link.poll(PowerTier::Normal).await, None);

        let preempted = link.preempt().await;
        assert_eq!(preempted, Some(regular));
        assert_eq!(link.session(), LinkSession::Idle);

        let emergency = emergency_batch(2);
        link.submit(emergency.clone()).unwrap();
        let event = link.poll(PowerTier::Critical).await;
        assert!(matches!(event, Some(LinkEvent::Delivered { ref batch, .. }) if *batch == emergency));

        // Fresh session: reconnected before the emergency frame
        assert_eq!(radio.connect_count(), 2);
        assert_eq!(decoder::decode(&radio.frames()[1]).unwrap(), emergency);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preempt_skips_backoff() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::Nak);
        let mut link = manager(&radio, timings());

        link.submit(battery_batch(1, 1)).unwrap();
        assert!(matches!(link.poll(PowerTier::Normal).await, Some(LinkEvent::Failed { .. })));
        assert!(!link.ready());

        assert_eq!(link.preempt().await, None);
        assert!(link.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_outcomes() {
        let radio = SimulatedRadio::new(222);
        radio.script(ScriptedOutcome::Nak);
        let mut link = manager(&radio, timings());

        let batch = battery_batch(1, 1);
        assert_eq!(link.send(&batch).await, SendOutcome::Failed(LinkError::NakReceived));
        assert!(matches!(link.send(&batch).await, SendOutcome::Delivered(Some(_))));
        assert_eq!(radio.frames().len(), 2);
    }

    impl LinkManager {
        /// Take the outstanding batch back without touching the session
        fn preempt_for_test(&mut self) -> Batch {
            self.outstanding.take().unwrap()
        }
    }
}
