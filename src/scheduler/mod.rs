//! # Sample Scheduler Module
//!
//! Decides which sensor kinds are due on a tick, per power tier.
//!
//! [`Scheduler::due`] is a pure function of the elapsed time since each
//! kind's last sample and the tier's interval table. [`Scheduler::tick`]
//! also records the tick as the last sample time for every due kind, whether
//! or not the acquisition then succeeds, so a failed read is retried on the
//! next scheduled slot rather than immediately.

use tracing::trace;

use crate::config::SamplingConfig;
use crate::power::PowerTier;
use crate::sample::SampleKind;

/// Sampling interval per tier and kind; `None` disables the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPlan {
    intervals: [[Option<u64>; 4]; 3],
}

fn enabled(ms: u64) -> Option<u64> {
    (ms > 0).then_some(ms)
}

impl SamplingPlan {
    pub fn from_config(config: &SamplingConfig) -> Self {
        let normal = [
            enabled(config.motion_ms),
            enabled(config.position_ms),
            enabled(config.heart_rate_ms),
            enabled(config.battery_ms),
        ];
        let factor = u64::from(config.conservation_factor.max(1));
        let conservation = normal.map(|ms| ms.map(|ms| ms.saturating_mul(factor)));
        let critical = [
            enabled(config.critical_motion_ms),
            enabled(config.critical_position_ms),
            enabled(config.critical_heart_rate_ms),
            enabled(config.critical_battery_ms),
        ];

        Self {
            intervals: [normal, conservation, critical],
        }
    }

    pub fn interval_ms(&self, tier: PowerTier, kind: SampleKind) -> Option<u64> {
        self.intervals[tier.index()][kind.index()]
    }
}

impl Default for SamplingPlan {
    fn default() -> Self {
        Self::from_config(&SamplingConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    plan: SamplingPlan,
    last_sampled_ms: [Option<u64>; 4],
}

impl Scheduler {
    pub fn new(plan: SamplingPlan) -> Self {
        Self {
            plan,
            last_sampled_ms: [None; 4],
        }
    }

    pub fn plan(&self) -> &SamplingPlan {
        &self.plan
    }

    /// Kinds due at `now_ms` in `tier`, in wire tag order
    ///
    /// A kind never sampled before is due immediately if enabled.
    ///
    /// # Examples
    ///
    /// ```
    /// use collar_firmware::power::PowerTier;
    /// use collar_firmware::sample::SampleKind;
    /// use collar_firmware::scheduler::{SamplingPlan, Scheduler};
    ///
    /// let scheduler = Scheduler::new(SamplingPlan::default());
    /// let due = scheduler.due(0, PowerTier::Critical);
    /// assert_eq!(due, vec![SampleKind::Position, SampleKind::HeartRate]);
    /// ```
    pub fn due(&self, now_ms: u64, tier: PowerTier) -> Vec<SampleKind> {
        SampleKind::ALL
            .into_iter()
            .filter(|&kind| {
                let Some(interval) = self.plan.interval_ms(tier, kind) else {
                    return false;
                };
                match self.last_sampled_ms[kind.index()] {
                    None => true,
                    Some(last) => now_ms.saturating_sub(last) >= interval,
                }
            })
            .collect()
    }

    /// [`Scheduler::due`], then mark every due kind as sampled at `now_ms`
    pub fn tick(&mut self, now_ms: u64, tier: PowerTier) -> Vec<SampleKind> {
        let due = self.due(now_ms, tier);
        for kind in &due {
            self.last_sampled_ms[kind.index()] = Some(now_ms);
        }
        if !due.is_empty() {
            trace!("Due at {} ms ({}): {:?}", now_ms, tier, due);
        }
        due
    }

    pub fn last_sampled_ms(&self, kind: SampleKind) -> Option<u64> {
        self.last_sampled_ms[kind.index()]
    }
}
