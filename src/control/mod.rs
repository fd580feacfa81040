//! # Control Loop Module
//!
//! One cooperative task driving every component once per tick.
//!
//! A tick runs, in order:
//! 1. Power read and tier update
//! 2. Scheduling of due sensor kinds
//! 3. Concurrent, time-bounded acquisition (failures become gap markers)
//! 4. Sequence numbering and append to the flash buffer
//! 5. Emergency batch in the Critical tier, preempting regular traffic
//! 6. Regular uplink decision (cadence per tier, or a full batch waiting)
//! 7. One bounded link step, then acknowledge or release
//!
//! Nothing here blocks past the sensor and radio timeouts, and all state
//! that spans ticks (outstanding batch, backoff, pending emergency) lives in
//! fields rather than suspended futures. The only fatal error is sequence
//! number exhaustion.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::buffer::{AppendOutcome, LocalBuffer};
use crate::config::Config;
use crate::error::{BufferError, CollarError, Result, SensorError};
use crate::power::{PowerMonitor, PowerRail, PowerStatus, PowerTier, TierThresholds};
use crate::radio::{LinkEvent, LinkManager, LinkTimings, RadioDriver};
use crate::sample::{Batch, Battery, Reading, Sample, SampleKind, SequenceNumber};
use crate::scheduler::{SamplingPlan, Scheduler};
use crate::sensors::SensorSuite;
use crate::state::{DeviceState, StateStore};
use crate::storage::FlashDevice;
use crate::telemetry::encoder::TelemetryEncoder;
use crate::telemetry::journal::JournalEvent;

/// Counters since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub samples_created: u64,
    pub gaps: u64,
    /// Oldest Pending samples overwritten by a full buffer
    pub evicted: u64,
    /// New samples dropped because every slot was in flight
    pub dropped_full: u64,
    /// Emergency samples replaced by a newer emergency batch before delivery
    pub superseded: u64,
    pub delivered_samples: u64,
    pub delivered_batches: u64,
    pub failed_sends: u64,
    pub aborted: u64,
    pub sequence_failures: u64,
    pub storage_errors: u64,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tier: PowerTier,
    pub samples_created: usize,
    pub gaps: usize,
    /// Link and power events, for the delivery journal
    pub events: Vec<JournalEvent>,
}

/// Per-tick drop tally, journaled as one event per reason
#[derive(Debug, Default)]
struct Drops {
    evicted: u64,
    buffer_full: u64,
    storage_error: u64,
    sequence_unavailable: u64,
    superseded: u64,
}

impl Drops {
    fn into_events(self, events: &mut Vec<JournalEvent>) {
        for (reason, count) in [
            ("evicted", self.evicted),
            ("buffer_full", self.buffer_full),
            ("storage_error", self.storage_error),
            ("sequence_unavailable", self.sequence_unavailable),
            ("superseded_emergency", self.superseded),
        ] {
            if count > 0 {
                events.push(JournalEvent::Dropped {
                    reason: reason.to_string(),
                    count,
                });
            }
        }
    }
}

/// Uplink cadence and emergency interval
#[derive(Debug, Clone, Copy)]
struct UplinkPolicy {
    normal_ms: u64,
    conservation_ms: u64,
    emergency_interval_ms: u64,
}

impl UplinkPolicy {
    /// `None` in Critical, where only emergency batches go out
    fn cadence_ms(&self, status: &PowerStatus) -> Option<u64> {
        match status.tier {
            PowerTier::Normal => Some(self.normal_ms),
            PowerTier::Conservation if status.external_power => Some(self.normal_ms),
            PowerTier::Conservation => Some(self.conservation_ms),
            PowerTier::Critical => None,
        }
    }
}

pub struct ControlLoop<S: StateStore> {
    state: DeviceState<S>,
    power: PowerMonitor,
    scheduler: Scheduler,
    sensors: SensorSuite,
    buffer: LocalBuffer,
    link: LinkManager,
    policy: UplinkPolicy,
    tier: PowerTier,
    max_batch_bytes: usize,
    max_batch_samples: usize,
    last_uplink_ms: Option<u64>,
    /// Keep draining until every sample at or below this was sent
    drain_until: Option<SequenceNumber>,
    last_emergency_ms: Option<u64>,
    pending_emergency: Option<Batch>,
    stats: LoopStats,
}

impl<S: StateStore> ControlLoop<S> {
    /// Bring up the control core on the given hardware
    ///
    /// Recovers the flash buffer, counts a storage reset if the buffer was
    /// corrupted, and resumes sequence numbering above both the persisted
    /// high-water mark and anything found in the buffer.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `sensors` - Installed sensor drivers
    /// * `rail` - PMIC / fuel gauge
    /// * `radio` - Uplink driver
    /// * `buffer_flash` - Flash dedicated to the sample ring
    /// * `store` - Persistence for the sequence high-water mark and reset count
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state or the buffer flash cannot be
    /// read
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use collar_firmware::config::Config;
    /// use collar_firmware::control::ControlLoop;
    /// use collar_firmware::sim::{simulated_suite, SimulatedPowerRail, SimulatedRadio};
    /// use collar_firmware::state::FlashStateStore;
    /// use collar_firmware::storage::MemFlash;
    ///
    /// # async fn run() -> collar_firmware::error::Result<()> {
    /// let config = Config::default();
    /// let mut control = ControlLoop::boot(
    ///     &config,
    ///     simulated_suite(Duration::from_secs(2), 0),
    ///     Box::new(SimulatedPowerRail::fixed(80)),
    ///     Box::new(SimulatedRadio::new(222)),
    ///     Box::new(MemFlash::new(64, 256)),
    ///     FlashStateStore::new(MemFlash::new(64, 2))?,
    /// )?;
    /// let report = control.tick(0).await?;
    /// println!("tier {}, {} samples", report.tier, report.samples_created);
    /// # Ok(())
    /// # }
    /// ```
    pub fn boot(
        config: &Config,
        sensors: SensorSuite,
        rail: Box<dyn PowerRail>,
        radio: Box<dyn RadioDriver>,
        buffer_flash: Box<dyn FlashDevice>,
        store: S,
    ) -> Result<Self> {
        let mut state = DeviceState::boot(store, config.device.sequence_reservation)?;
        let (buffer, recovery) = LocalBuffer::open(buffer_flash, config.buffer.max_batch_samples)?;

        if recovery.corrupted {
            match state.record_storage_reset() {
                Ok(count) => warn!("Buffer reset after corruption (reset count {})", count),
                Err(e) => error!("Buffer reset after corruption, reset count not persisted: {}", e),
            }
        }
        if let Some(seq) = recovery.highest_seq {
            state.observe_sequence(seq);
        }

        let max_batch_bytes = config
            .buffer
            .max_batch_bytes
            .min(config.radio.max_frame_len)
            .min(radio.max_frame_len());
        let link = LinkManager::new(
            radio,
            TelemetryEncoder::new(config.device.device_id),
            LinkTimings::from(&config.radio),
        );

        info!(
            "Control core up: device {}, {} buffered samples, batches up to {} bytes",
            config.device.device_id, recovery.recovered, max_batch_bytes
        );

        Ok(Self {
            state,
            power: PowerMonitor::new(rail, TierThresholds::from(&config.power)),
            scheduler: Scheduler::new(SamplingPlan::from_config(&config.sampling)),
            sensors,
            buffer,
            link,
            policy: UplinkPolicy {
                normal_ms: config.radio.uplink_normal_ms,
                conservation_ms: config.radio.uplink_conservation_ms,
                emergency_interval_ms: config.radio.emergency_interval_ms,
            },
            tier: PowerTier::Normal,
            max_batch_bytes,
            max_batch_samples: config.buffer.max_batch_samples,
            last_uplink_ms: None,
            drain_until: None,
            last_emergency_ms: None,
            pending_emergency: None,
            stats: LoopStats::default(),
        })
    }

    /// Run one tick at `now_ms` (monotonic milliseconds since boot)
    ///
    /// # Errors
    ///
    /// Only `SequenceExhausted`; every other failure is logged, counted and
    /// retried on a later tick.
    pub async fn tick(&mut self, now_ms: u64) -> Result<TickReport> {
        self.stats.ticks += 1;
        let mut events = Vec::new();
        let mut drops = Drops::default();

        let status = self.power.read();
        if status.tier != self.tier {
            info!("Power tier {} -> {}", self.tier, status.tier);
            events.push(JournalEvent::TierChanged {
                from: self.tier,
                to: status.tier,
            });
            if status.tier == PowerTier::Critical {
                self.last_emergency_ms = None;
            }
            self.tier = status.tier;
        }
        if let Some(battery) = status.battery {
            self.state.set_last_battery(battery);
        }

        let (samples_created, gaps) = self.sample(now_ms, &status, &mut drops).await?;

        if self.tier == PowerTier::Critical {
            self.schedule_emergency(now_ms, status.battery, &mut events, &mut drops)
                .await?;
        }

        if self.pending_emergency.is_some() && self.link.ready() {
            if let Some(batch) = self.pending_emergency.take() {
                if let Err(batch) = self.link.submit(batch) {
                    self.pending_emergency = Some(batch);
                }
            }
        }

        if self.pending_emergency.is_none() && self.link.ready() && self.uplink_due(now_ms, &status) {
            self.start_regular_uplink();
        }

        if let Some(event) = self.link.poll(self.tier).await {
            self.handle_link_event(event, &mut events, &mut drops);
        }

        drops.into_events(&mut events);
        Ok(TickReport {
            tier: self.tier,
            samples_created,
            gaps,
            events,
        })
    }

    async fn sample(&mut self, now_ms: u64, status: &PowerStatus, drops: &mut Drops) -> Result<(usize, usize)> {
        let due = self.scheduler.tick(now_ms, self.tier);
        if due.is_empty() {
            return Ok((0, 0));
        }

        let sensed: Vec<SampleKind> = due.iter().copied().filter(|&k| k != SampleKind::Battery).collect();
        let mut results = self.sensors.acquire_due(&sensed).await;
        if due.contains(&SampleKind::Battery) {
            let battery = status.battery.map(Reading::Battery).ok_or(SensorError::NotReady);
            results.push((SampleKind::Battery, battery));
        }

        let mut created = 0;
        let mut gaps = 0;
        for (kind, result) in results {
            let Some(seq) = self.issue_sequence(drops)? else {
                continue;
            };

            let sample = match result {
                Ok(reading) => {
                    if let Reading::Position(position) = reading {
                        self.state.set_last_position(now_ms, position);
                    }
                    created += 1;
                    Sample::new(seq, now_ms, reading)
                }
                Err(e) => {
                    debug!("{} gap at seq {}: {}", kind, seq, e);
                    gaps += 1;
                    Sample::gap(seq, now_ms, kind)
                }
            };
            self.store_sample(&sample, drops);
        }

        self.stats.samples_created += created as u64;
        self.stats.gaps += gaps as u64;
        Ok((created, gaps))
    }

    /// `Ok(None)` if the high-water mark could not be persisted this time
    fn issue_sequence(&mut self, drops: &mut Drops) -> Result<Option<SequenceNumber>> {
        match self.state.next_sequence() {
            Ok(seq) => Ok(Some(seq)),
            Err(CollarError::SequenceExhausted) => {
                error!("Sequence number space exhausted");
                Err(CollarError::SequenceExhausted)
            }
            Err(e) => {
                warn!("No sequence number available: {}", e);
                self.stats.sequence_failures += 1;
                drops.sequence_unavailable += 1;
                Ok(None)
            }
        }
    }

    fn store_sample(&mut self, sample: &Sample, drops: &mut Drops) {
        match self.buffer.append(sample) {
            Ok(AppendOutcome::Stored(_)) => {}
            Ok(AppendOutcome::Full { evicted, .. }) => {
                debug!("Buffer full, evicted seq {} for seq {}", evicted, sample.seq());
                self.stats.evicted += 1;
                drops.evicted += 1;
            }
            Err(BufferError::Full { seq }) => {
                warn!("Buffer full of in-flight samples, dropped seq {}", seq);
                self.stats.dropped_full += 1;
                drops.buffer_full += 1;
            }
            Err(BufferError::Storage { source, evicted }) => {
                warn!("Could not store seq {}: {}", sample.seq(), source);
                self.stats.storage_errors += 1;
                drops.storage_error += 1;
                if let Some(evicted) = evicted {
                    debug!("Seq {} was evicted ahead of the failed write", evicted);
                    self.stats.evicted += 1;
                    drops.evicted += 1;
                }
            }
        }
    }

    async fn schedule_emergency(
        &mut self,
        now_ms: u64,
        battery: Option<Battery>,
        events: &mut Vec<JournalEvent>,
        drops: &mut Drops,
    ) -> Result<()> {
        let due = self
            .last_emergency_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.policy.emergency_interval_ms);
        if !due {
            return Ok(());
        }
        self.last_emergency_ms = Some(now_ms);

        let Some(batch) = self.build_emergency(now_ms, battery, drops)? else {
            return Ok(());
        };
        info!("Emergency batch {} ready", batch.id());

        if let Some(preempted) = self.link.preempt().await {
            if preempted.is_emergency() {
                self.supersede(preempted, drops);
            } else {
                self.abort_regular(preempted, events);
            }
        }
        if let Some(older) = self.pending_emergency.replace(batch) {
            self.supersede(older, drops);
        }
        Ok(())
    }

    /// Last known position (with its original fix time) and battery state
    fn build_emergency(&mut self, now_ms: u64, battery: Option<Battery>, drops: &mut Drops) -> Result<Option<Batch>> {
        let Some(position_seq) = self.issue_sequence(drops)? else {
            return Ok(None);
        };
        let Some(battery_seq) = self.issue_sequence(drops)? else {
            debug!("Emergency batch abandoned, position seq {} unused", position_seq);
            self.stats.sequence_failures += 1;
            drops.sequence_unavailable += 1;
            return Ok(None);
        };

        let position = match self.state.last_position() {
            Some((fix_ms, position)) => Sample::new(position_seq, fix_ms, Reading::Position(position)),
            None => Sample::gap(position_seq, now_ms, SampleKind::Position),
        };
        let battery = match battery.or_else(|| self.state.last_battery()) {
            Some(battery) => Sample::new(battery_seq, now_ms, Reading::Battery(battery)),
            None => Sample::gap(battery_seq, now_ms, SampleKind::Battery),
        };

        let id = self.buffer.allocate_batch_id();
        Ok(Some(Batch::emergency(id, vec![position, battery])))
    }

    fn supersede(&mut self, batch: Batch, drops: &mut Drops) {
        warn!("Emergency batch {} superseded before delivery", batch.id());
        self.stats.superseded += batch.len() as u64;
        drops.superseded += batch.len() as u64;
    }

    fn abort_regular(&mut self, batch: Batch, events: &mut Vec<JournalEvent>) {
        let restored = self.buffer.release(&batch);
        debug!("Batch {} aborted, {} samples back to pending", batch.id(), restored);
        self.stats.aborted += 1;
        events.push(JournalEvent::Aborted {
            batch_id: batch.id(),
            samples: batch.len(),
        });
    }

    fn uplink_due(&mut self, now_ms: u64, status: &PowerStatus) -> bool {
        let Some(cadence) = self.policy.cadence_ms(status) else {
            return false;
        };
        let Some((lowest, highest)) = self.buffer.pending_range() else {
            self.drain_until = None;
            return false;
        };

        if let Some(until) = self.drain_until {
            if lowest <= until {
                return true;
            }
            self.drain_until = None;
        }

        let elapsed = self
            .last_uplink_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= cadence);
        if elapsed {
            self.last_uplink_ms = Some(now_ms);
            self.drain_until = Some(highest);
            return true;
        }

        self.buffer.pending_len() >= self.max_batch_samples
    }

    fn start_regular_uplink(&mut self) {
        match self.buffer.drain(self.max_batch_bytes) {
            Ok(Some(batch)) => {
                if let Err(batch) = self.link.submit(batch) {
                    self.buffer.release(&batch);
                }
            }
            Ok(None) => self.drain_until = None,
            Err(e) => {
                warn!("Buffer drain failed: {}", e);
                self.stats.storage_errors += 1;
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, events: &mut Vec<JournalEvent>, drops: &mut Drops) {
        match event {
            LinkEvent::Delivered { batch, quality } => {
                if let Some(q) = quality {
                    debug!("Link quality {} dBm", q.rssi_dbm);
                }
                if !batch.is_emergency() {
                    let removed = self.buffer.acknowledge(&batch);
                    if removed != batch.len() {
                        warn!("Batch {}: {} of {} slots acknowledged", batch.id(), removed, batch.len());
                    }
                }
                self.stats.delivered_batches += 1;
                self.stats.delivered_samples += batch.len() as u64;
                events.push(JournalEvent::delivered(&batch));
            }
            LinkEvent::Failed { batch, reason, backoff } => {
                self.stats.failed_sends += 1;
                events.push(JournalEvent::Failed {
                    batch_id: batch.id(),
                    emergency: batch.is_emergency(),
                    reason: reason.to_string(),
                    backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                });
                if batch.is_emergency() {
                    if self.pending_emergency.is_some() {
                        self.supersede(batch, drops);
                    } else {
                        self.pending_emergency = Some(batch);
                    }
                } else {
                    self.buffer.release(&batch);
                }
            }
            LinkEvent::Aborted { batch } => self.abort_regular(batch, events),
        }
    }

    pub fn tier(&self) -> PowerTier {
        self.tier
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn buffer(&self) -> &LocalBuffer {
        &self.buffer
    }

    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    pub fn state(&self) -> &DeviceState<S> {
        &self.state
    }

    /// Emergency batch waiting for the link (after a failure or backoff)
    pub fn pending_emergency(&self) -> Option<&Batch> {
        self.pending_emergency.as_ref()
    }

    /// Time left until the link may send again
    pub fn backoff_remaining(&self) -> Option<Duration> {
        match self.link.session() {
            crate::radio::LinkSession::Backoff { until } => {
                Some(until.saturating_duration_since(tokio::time::Instant::now()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::LinkSession;
    use crate::sim::{simulated_suite, ScriptedOutcome, SimulatedPowerRail, SimulatedRadio};
    use crate::state::{FlashStateStore, PersistedState};
    use crate::storage::MemFlash;
    use crate::telemetry::decoder;

    struct Rig {
        rail: SimulatedPowerRail,
        radio: SimulatedRadio,
        buffer_flash: MemFlash,
        state_flash: MemFlash,
    }

    impl Rig {
        fn new(percent: u8) -> Self {
            Self::with_rail(SimulatedPowerRail::fixed(percent))
        }

        fn with_rail(rail: SimulatedPowerRail) -> Self {
            Self {
                rail,
                radio: SimulatedRadio::new(222),
                buffer_flash: MemFlash::new(64, 32),
                state_flash: MemFlash::new(64, 2),
            }
        }

        fn boot(&self, sensor_failure_every: u32) -> ControlLoop<FlashStateStore<MemFlash>> {
            self.boot_with(&Config::default(), sensor_failure_every)
        }

        fn boot_with(&self, config: &Config, sensor_failure_every: u32) -> ControlLoop<FlashStateStore<MemFlash>> {
            ControlLoop::boot(
                config,
                simulated_suite(Duration::from_millis(500), sensor_failure_every),
                Box::new(self.rail.clone()),
                Box::new(self.radio.clone()),
                Box::new(self.buffer_flash.clone()),
                FlashStateStore::new(self.state_flash.clone()).unwrap(),
            )
            .unwrap()
        }
    }

    fn seqs(batch: &Batch) -> Vec<SequenceNumber> {
        batch.samples().iter().map(Sample::seq).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_samples_and_delivers() {
        let rig = Rig::new(80);
        let mut control = rig.boot(0);

        let report = control.tick(0).await.unwrap();
        assert_eq!(report.tier, PowerTier::Normal);
        assert_eq!(report.samples_created, 4);
        assert_eq!(report.gaps, 0);
        assert!(matches!(report.events[..], [JournalEvent::Delivered { samples: 4, .. }]));

        let frames = rig.radio.frames();
        assert_eq!(frames.len(), 1);
        let batch = decoder::decode(&frames[0]).unwrap();
        assert_eq!(seqs(&batch), vec![1, 2, 3, 4]);
        assert_eq!(control.buffer().pending_len(), 0);
        assert_eq!(control.stats().delivered_samples, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_wait_for_cadence() {
        let rig = Rig::new(80);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        for second in 1..10 {
            let report = control.tick(second * 1_000).await.unwrap();
            assert_eq!(report.samples_created, 1);
        }
        assert_eq!(rig.radio.frames().len(), 1);
        assert_eq!(control.buffer().pending_len(), 9);

        // Normal cadence (5 min) elapsed: the backlog goes out, over as many
        // frames as the 222-byte limit needs
        control.tick(300_000).await.unwrap();
        control.tick(301_000).await.unwrap();
        let delivered: Vec<SequenceNumber> = rig.radio.frames()[1..]
            .iter()
            .flat_map(|frame| seqs(&decoder::decode(frame).unwrap()))
            .collect();
        assert_eq!(delivered, (5..=18).collect::<Vec<_>>());
        assert_eq!(control.buffer().pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_failures_become_gaps() {
        let rig = Rig::new(80);
        let mut control = rig.boot(1);

        let report = control.tick(0).await.unwrap();
        assert_eq!(report.samples_created, 1);
        assert_eq!(report.gaps, 3);

        let batch = decoder::decode(&rig.radio.frames()[0]).unwrap();
        let gap_kinds: Vec<_> = batch.samples().iter().filter(|s| s.is_gap()).map(Sample::kind).collect();
        assert_eq!(
            gap_kinds,
            vec![SampleKind::Motion, SampleKind::Position, SampleKind::HeartRate]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_read_failure_keeps_tier() {
        let rig = Rig::new(25);
        let mut control = rig.boot(0);
        assert_eq!(control.tick(0).await.unwrap().tier, PowerTier::Conservation);

        rig.rail.set_fault(true);
        let report = control.tick(300_000).await.unwrap();
        assert_eq!(report.tier, PowerTier::Conservation);
        assert!(report.events.iter().all(|e| !matches!(e, JournalEvent::TierChanged { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_battery_reading_is_a_gap() {
        let rig = Rig::new(80);
        rig.rail.set_fault(true);
        let mut control = rig.boot(0);

        let report = control.tick(0).await.unwrap();
        assert_eq!(report.samples_created, 3);
        assert_eq!(report.gaps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conservation_uses_longer_cadence() {
        let rig = Rig::new(25);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        control.tick(300_000).await.unwrap();
        assert_eq!(rig.radio.frames().len(), 1);

        control.tick(1_800_000).await.unwrap();
        assert_eq!(rig.radio.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_solar_input_restores_normal_cadence() {
        let rail = SimulatedPowerRail::new(25, 0.0, 1.0);
        rail.set_charging(Some(false));
        let rig = Rig::with_rail(rail);
        let mut control = rig.boot(0);

        assert_eq!(control.tick(0).await.unwrap().tier, PowerTier::Conservation);
        control.tick(300_000).await.unwrap();
        assert_eq!(rig.radio.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_preempts_regular_batch() {
        let rig = Rig::new(80);
        rig.radio.script(ScriptedOutcome::NoAck);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        assert_eq!(control.buffer().in_flight_len(), 4);

        rig.rail.set_percent(5);
        let report = control.tick(1_000).await.unwrap();
        assert_eq!(report.tier, PowerTier::Critical);
        assert_eq!(
            report.events[0],
            JournalEvent::TierChanged { from: PowerTier::Normal, to: PowerTier::Critical }
        );
        assert!(report.events.iter().any(|e| matches!(e, JournalEvent::Aborted { samples: 4, .. })));
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, JournalEvent::Delivered { emergency: true, samples: 2, .. })));

        // Regular samples are pending again, nothing lost
        assert_eq!(control.buffer().pending_seqs(), vec![1, 2, 3, 4]);
        assert_eq!(control.buffer().in_flight_len(), 0);

        let frames = rig.radio.frames();
        assert_eq!(frames.len(), 2);
        let emergency = decoder::decode(&frames[1]).unwrap();
        assert!(emergency.is_emergency());
        assert_eq!(seqs(&emergency), vec![5, 6]);

        let position = emergency.samples()[0];
        assert_eq!(position.kind(), SampleKind::Position);
        assert_eq!(position.timestamp_ms(), 0);
        assert!(matches!(
            emergency.samples()[1].reading(),
            Some(Reading::Battery(Battery { percent: 5, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_regular_uplink_in_critical() {
        let rig = Rig::new(5);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        for minute in 1..=10 {
            control.tick(minute * 60_000).await.unwrap();
        }

        // Only the emergency batch went out
        let frames = rig.radio.frames();
        assert_eq!(frames.len(), 1);
        assert!(decoder::decode(&frames[0]).unwrap().is_emergency());
        assert!(control.buffer().pending_len() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_emergency_is_retried_after_backoff() {
        let rig = Rig::new(5);
        rig.radio.script(ScriptedOutcome::Nak);
        let mut control = rig.boot(0);

        let report = control.tick(0).await.unwrap();
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, JournalEvent::Failed { emergency: true, backoff_ms: 2_000, .. })));
        assert!(control.pending_emergency().is_some());

        // Still backing off
        control.tick(1_000).await.unwrap();
        assert_eq!(rig.radio.frames().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        control.tick(3_000).await.unwrap();
        let frames = rig.radio.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
        assert!(control.pending_emergency().is_none());
        assert_eq!(control.stats().delivered_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_emergency_supersedes_unsent_one() {
        let rig = Rig::new(5);
        rig.radio.script(ScriptedOutcome::ConnectFail);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        assert!(control.pending_emergency().is_some());

        // Next emergency interval (1 h)
        let report = control.tick(3_600_000).await.unwrap();
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, JournalEvent::Dropped { reason, count: 2 } if reason == "superseded_emergency")));
        assert_eq!(control.stats().superseded, 2);
        assert_eq!(control.stats().delivered_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_resumes_numbering_and_backlog() {
        let rig = Rig::new(80);
        rig.radio.script(ScriptedOutcome::NoAck);
        {
            let mut control = rig.boot(0);
            control.tick(0).await.unwrap();
            assert_eq!(control.buffer().in_flight_len(), 4);
        }

        let mut control = rig.boot(0);
        assert_eq!(control.buffer().pending_seqs(), vec![1, 2, 3, 4]);

        control.tick(1_000).await.unwrap();
        let frames = rig.radio.frames();
        let batch = decoder::decode(frames.last().unwrap()).unwrap();
        let delivered = seqs(&batch);
        assert_eq!(&delivered[..4], &[1, 2, 3, 4]);
        assert!(delivered[4] > 4);
        assert_eq!(control.buffer().pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_buffer_resets_and_counts() {
        let rig = Rig::new(80);
        rig.radio.script(ScriptedOutcome::NoAck);
        {
            let mut control = rig.boot(0);
            control.tick(0).await.unwrap();
        }
        for block in 0..4 {
            rig.buffer_flash.corrupt(block, 6);
        }

        let control = rig.boot(0);
        assert_eq!(control.state().reset_count(), 1);
        assert_eq!(control.buffer().pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_exhaustion_is_fatal() {
        let rig = Rig::new(80);
        {
            let mut store = FlashStateStore::new(rig.state_flash.clone()).unwrap();
            store
                .store(&PersistedState { sequence_hwm: u32::MAX, reset_count: 0 })
                .unwrap();
        }
        let mut control = rig.boot(0);

        assert!(matches!(control.tick(0).await, Err(CollarError::SequenceExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_regular_batch_returns_to_pending() {
        let rig = Rig::new(80);
        rig.radio.script(ScriptedOutcome::Disconnect);
        let mut control = rig.boot(0);

        let report = control.tick(0).await.unwrap();
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, JournalEvent::Failed { emergency: false, .. })));
        assert_eq!(control.buffer().pending_seqs(), vec![1, 2, 3, 4]);
        assert!(control.backoff_remaining().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        control.tick(2_000).await.unwrap();
        assert_eq!(control.buffer().pending_len(), 0);
        assert_eq!(control.stats().failed_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_does_not_hold_up_ticks() {
        let rig = Rig::new(80);
        rig.radio.script(ScriptedOutcome::ConnectStall);
        let mut control = rig.boot(0);
        let tick = Duration::from_millis(Config::default().device.tick_ms);

        for second in 0..30 {
            let started = tokio::time::Instant::now();
            let report = control.tick(second * 1_000).await.unwrap();
            let took = started.elapsed();
            assert!(took < tick, "tick {} took {:?}", second, took);
            assert!(report.samples_created > 0);
            assert!(matches!(control.link().session(), LinkSession::Connecting { .. }));
            tokio::time::advance(tick - took).await;
        }

        // Connect timeout (30 s) reached: the attempt is abandoned
        let report = control.tick(30_000).await.unwrap();
        assert!(report.events.iter().any(
            |e| matches!(e, JournalEvent::Failed { emergency: false, reason, .. } if reason == "link timed out")
        ));
        assert_eq!(&control.buffer().pending_seqs()[..4], &[1, 2, 3, 4]);
        assert!(control.backoff_remaining().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = control.tick(32_000).await.unwrap();
        assert!(report.events.iter().any(|e| matches!(e, JournalEvent::Delivered { .. })));
        assert_eq!(rig.radio.connect_count(), 1);
        let frames = rig.radio.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&seqs(&decoder::decode(&frames[0]).unwrap())[..4], &[1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_on_full_buffer_counts_eviction() {
        let mut rig = Rig::new(80);
        rig.buffer_flash = MemFlash::new(64, 4);
        rig.radio.script(ScriptedOutcome::ConnectFail);
        let mut control = rig.boot(0);

        control.tick(0).await.unwrap();
        assert_eq!(control.buffer().pending_seqs(), vec![1, 2, 3, 4]);

        rig.buffer_flash.cut_power_after(0);
        let report = control.tick(1_000).await.unwrap();
        assert_eq!(control.buffer().pending_seqs(), vec![2, 3, 4]);
        assert_eq!(control.stats().evicted, 1);
        assert_eq!(control.stats().storage_errors, 1);
        for reason in ["evicted", "storage_error"] {
            assert!(report
                .events
                .contains(&JournalEvent::Dropped { reason: reason.to_string(), count: 1 }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_emergency_counts_both_sequence_numbers() {
        let rig = Rig::new(5);
        let mut config = Config::default();
        config.device.sequence_reservation = 1;
        let mut control = rig.boot_with(&config, 0);

        // Enough for one persisted high-water mark, then the flash dies
        rig.state_flash.cut_power_after(3);
        let mut drops = Drops::default();
        let batch = control.build_emergency(0, None, &mut drops).unwrap();

        assert!(batch.is_none());
        assert_eq!(drops.sequence_unavailable, 2);
        assert_eq!(control.stats().sequence_failures, 2);
    }
}
