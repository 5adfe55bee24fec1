use crate::frame::MacAddr;
use crate::Ts;

use super::AccessCategory;

/// Contention parameters for a single queue
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EdcaParams {
    /// Minimum contention window
    pub cw_min: u32,
    /// Maximum contention window
    pub cw_max: u32,
    /// Arbitration inter-frame space in slots
    pub aifsn: u32,
}

impl EdcaParams {
    pub const fn new(cw_min: u32, cw_max: u32, aifsn: u32) -> Self {
        Self {
            cw_min,
            cw_max,
            aifsn,
        }
    }

    /// Default parameters for an access category (OFDM, aCWmin 15, aCWmax 1023)
    pub const fn for_ac(ac: AccessCategory) -> Self {
        match ac {
            AccessCategory::Voice => Self::new(3, 7, 2),
            AccessCategory::Video => Self::new(7, 15, 2),
            AccessCategory::BestEffort => Self::new(15, 1023, 3),
            AccessCategory::Background => Self::new(15, 1023, 7),
            AccessCategory::Legacy => Self::new(15, 1023, 2),
            AccessCategory::Beacon => Self::new(0, 0, 1),
        }
    }
}

/// Configuration for the MAC
#[derive(Clone, PartialEq, Debug)]
pub struct Config {
    /// Use EDCA queues (voice, video, best effort, background) in place of
    /// the single legacy DCF queue
    pub qos_supported: bool,

    /// Register a beacon queue (lowest registration priority)
    pub beacon_queue: bool,

    /// Use CTS-to-self when non-ERP protection is required
    pub cts_to_self_supported: bool,

    /// Maximum time an MSDU may wait in a queue, in microseconds
    pub max_msdu_lifetime: Ts,

    /// BSSID written to addr3 of generated data frames
    pub bssid: MacAddr,

    pub legacy: EdcaParams,
    pub voice: EdcaParams,
    pub video: EdcaParams,
    pub best_effort: EdcaParams,
    pub background: EdcaParams,
    pub beacon: EdcaParams,
}

impl Config {
    /// Contention parameters for an access category
    pub fn edca(&self, ac: AccessCategory) -> EdcaParams {
        match ac {
            AccessCategory::Voice => self.voice,
            AccessCategory::Video => self.video,
            AccessCategory::BestEffort => self.best_effort,
            AccessCategory::Background => self.background,
            AccessCategory::Legacy => self.legacy,
            AccessCategory::Beacon => self.beacon,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qos_supported: false,
            beacon_queue: false,
            cts_to_self_supported: false,
            max_msdu_lifetime: 500_000,
            bssid: MacAddr::default(),

            legacy: EdcaParams::for_ac(AccessCategory::Legacy),
            voice: EdcaParams::for_ac(AccessCategory::Voice),
            video: EdcaParams::for_ac(AccessCategory::Video),
            best_effort: EdcaParams::for_ac(AccessCategory::BestEffort),
            background: EdcaParams::for_ac(AccessCategory::Background),
            beacon: EdcaParams::for_ac(AccessCategory::Beacon),
        }
    }
}
