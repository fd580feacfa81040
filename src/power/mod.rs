//! # Power Monitor Module
//!
//! Reads the PMIC / fuel gauge and classifies the device into a power tier.
//!
//! Tier boundaries carry hysteresis (enter Critical below 10 %, leave it only
//! above 15 %, and likewise around the Conservation band) so a noisy fuel
//! gauge cannot make the tier oscillate. External power (charging) lifts the
//! effective tier by one level.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PowerConfig;
use crate::error::SensorError;
use crate::sample::Battery;

/// Operating mode governing sampling and transmission aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerTier {
    Normal,
    Conservation,
    Critical,
}

impl PowerTier {
    /// One level less restrictive
    pub fn promote(self) -> Self {
        match self {
            PowerTier::Critical => PowerTier::Conservation,
            PowerTier::Conservation | PowerTier::Normal => PowerTier::Normal,
        }
    }

    pub fn index(self) -> usize {
        match self {
            PowerTier::Normal => 0,
            PowerTier::Conservation => 1,
            PowerTier::Critical => 2,
        }
    }
}

impl std::fmt::Display for PowerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PowerTier::Normal => "normal",
            PowerTier::Conservation => "conservation",
            PowerTier::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// PMIC / fuel-gauge driver
#[cfg_attr(test, mockall::automock)]
pub trait PowerRail: Send {
    fn battery_percent(&mut self) -> Result<u8, SensorError>;

    fn battery_millivolts(&mut self) -> Result<u16, SensorError>;

    fn is_charging(&mut self) -> Result<bool, SensorError>;

    fn solar_input_present(&mut self) -> Result<bool, SensorError>;
}

/// Battery percentages bounding the tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub conservation_enter: u8,
    pub conservation_exit: u8,
    pub critical_enter: u8,
    pub critical_exit: u8,
}

impl From<&PowerConfig> for TierThresholds {
    fn from(config: &PowerConfig) -> Self {
        Self {
            conservation_enter: config.conservation_enter_percent,
            conservation_exit: config.conservation_exit_percent,
            critical_enter: config.critical_enter_percent,
            critical_exit: config.critical_exit_percent,
        }
    }
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self::from(&PowerConfig::default())
    }
}

/// Tier for a battery reading given the tier the device is currently in
///
/// # Examples
///
/// ```
/// use collar_firmware::power::{classify, PowerTier, TierThresholds};
///
/// let t = TierThresholds::default();
/// assert_eq!(classify(PowerTier::Normal, 9, &t), PowerTier::Critical);
/// assert_eq!(classify(PowerTier::Critical, 12, &t), PowerTier::Critical);
/// assert_eq!(classify(PowerTier::Critical, 16, &t), PowerTier::Conservation);
/// ```
pub fn classify(current: PowerTier, percent: u8, thresholds: &TierThresholds) -> PowerTier {
    let critical = match current {
        PowerTier::Critical => percent <= thresholds.critical_exit,
        _ => percent < thresholds.critical_enter,
    };
    if critical {
        return PowerTier::Critical;
    }

    let conservation = match current {
        PowerTier::Normal => percent < thresholds.conservation_enter,
        _ => percent <= thresholds.conservation_exit,
    };
    if conservation {
        PowerTier::Conservation
    } else {
        PowerTier::Normal
    }
}

/// One power reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStatus {
    /// Tier after the charging adjustment
    pub tier: PowerTier,
    /// Tier from battery level alone
    pub battery_tier: PowerTier,
    /// `None` if the fuel gauge could not be read this time
    pub battery: Option<Battery>,
    /// Charging or solar input present
    pub external_power: bool,
}

pub struct PowerMonitor {
    rail: Box<dyn PowerRail>,
    thresholds: TierThresholds,
    battery_tier: PowerTier,
    last: Option<PowerStatus>,
}

impl PowerMonitor {
    pub fn new(rail: Box<dyn PowerRail>, thresholds: TierThresholds) -> Self {
        Self {
            rail,
            thresholds,
            battery_tier: PowerTier::Normal,
            last: None,
        }
    }

    /// Read the rail and update the tier
    ///
    /// A failed read keeps the previous tier and reports no battery value.
    pub fn read(&mut self) -> PowerStatus {
        match self.sample_rail() {
            Ok(battery) => {
                let battery_tier = classify(self.battery_tier, battery.percent, &self.thresholds);
                let tier = if battery.charging {
                    battery_tier.promote()
                } else {
                    battery_tier
                };

                if battery_tier != self.battery_tier {
                    info!(
                        "Battery tier {} -> {} at {}% ({} mV)",
                        self.battery_tier, battery_tier, battery.percent, battery.millivolts
                    );
                }
                self.battery_tier = battery_tier;

                let status = PowerStatus {
                    tier,
                    battery_tier,
                    battery: Some(battery),
                    external_power: battery.charging || battery.solar,
                };
                self.last = Some(status);
                status
            }
            Err(e) => {
                warn!("Power rail read failed: {}", e);
                let previous = self.last.unwrap_or(PowerStatus {
                    tier: self.battery_tier,
                    battery_tier: self.battery_tier,
                    battery: None,
                    external_power: false,
                });
                PowerStatus {
                    battery: None,
                    ..previous
                }
            }
        }
    }

    /// Effective tier of the last successful read
    pub fn tier(&self) -> PowerTier {
        self.last.map_or(self.battery_tier, |s| s.tier)
    }

    fn sample_rail(&mut self) -> Result<Battery, SensorError> {
        Ok(Battery {
            percent: self.rail.battery_percent()?.min(100),
            millivolts: self.rail.battery_millivolts()?,
            charging: self.rail.is_charging()?,
            solar: self.rail.solar_input_present()?,
        })
    }
}
