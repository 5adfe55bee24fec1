//! Per-queue contention state (Txop)
//
// Copyright 2021 Ryan Kurte

use heapless::Deque;
use log::trace;
use strum::{Display, EnumIter};

use crate::Ts;

use super::config::EdcaParams;
use super::queue::FrameId;

/// Maximum number of frames held by each queue
pub const QUEUE_CAPACITY: usize = 64;

/// Access categories, declared in EDCA priority order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessCategory {
    #[strum(serialize = "AC_VO")]
    Voice,
    #[strum(serialize = "AC_VI")]
    Video,
    #[strum(serialize = "AC_BE")]
    BestEffort,
    #[strum(serialize = "AC_BK")]
    Background,
    /// Non-QoS DCF queue
    #[strum(serialize = "DCF")]
    Legacy,
    #[strum(serialize = "BEACON")]
    Beacon,
}

impl AccessCategory {
    /// EDCA categories use QoS backoff rules
    pub fn is_qos(&self) -> bool {
        !matches!(self, AccessCategory::Legacy | AccessCategory::Beacon)
    }

    /// Map a traffic identifier to its access category
    pub fn from_tid(tid: u8) -> Self {
        match tid & 0x07 {
            1 | 2 => AccessCategory::Background,
            0 | 3 => AccessCategory::BestEffort,
            4 | 5 => AccessCategory::Video,
            _ => AccessCategory::Voice,
        }
    }

    /// Default traffic identifier for frames of this category
    pub fn tid(&self) -> u8 {
        match self {
            AccessCategory::Background => 1,
            AccessCategory::Video => 5,
            AccessCategory::Voice => 6,
            _ => 0,
        }
    }
}

/// Index of a queue within the channel access manager, lower is higher priority
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxopId(pub(crate) u8);

impl TxopId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Channel access request status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessStatus {
    NotRequested,
    Requested,
    Granted,
}

/// Contending queue with its backoff state
#[derive(Debug)]
pub struct Txop {
    ac: AccessCategory,
    params: EdcaParams,

    cw: u32,
    backoff_slots: u32,
    backoff_start: Ts,
    access: AccessStatus,

    queue: Deque<FrameId, QUEUE_CAPACITY>,
}

impl Txop {
    pub fn new(ac: AccessCategory, params: EdcaParams) -> Self {
        Self {
            ac,
            params,
            cw: params.cw_min,
            backoff_slots: 0,
            backoff_start: 0,
            access: AccessStatus::NotRequested,
            queue: Deque::new(),
        }
    }

    pub fn ac(&self) -> AccessCategory {
        self.ac
    }

    pub fn is_qos(&self) -> bool {
        self.ac.is_qos()
    }

    pub fn params(&self) -> &EdcaParams {
        &self.params
    }

    pub fn aifsn(&self) -> u32 {
        self.params.aifsn
    }

    /// Current contention window
    pub fn cw(&self) -> u32 {
        self.cw
    }

    pub fn backoff_slots(&self) -> u32 {
        self.backoff_slots
    }

    pub fn backoff_start(&self) -> Ts {
        self.backoff_start
    }

    pub fn access_status(&self) -> AccessStatus {
        self.access
    }

    pub fn is_access_requested(&self) -> bool {
        self.access == AccessStatus::Requested
    }

    pub fn is_granted(&self) -> bool {
        self.access == AccessStatus::Granted
    }

    pub fn has_frames(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn reset_cw(&mut self) {
        self.cw = self.params.cw_min;
    }

    /// Grow the contention window following a failed transmission
    pub fn update_failed_cw(&mut self) {
        self.cw = (self.cw.saturating_add(1).saturating_mul(2) - 1).min(self.params.cw_max);
    }

    /// Start a new backoff of `slots` slots counting from `now`
    pub fn start_backoff_now(&mut self, slots: u32, now: Ts) {
        if self.backoff_slots != 0 {
            trace!("{} replacing backoff of {} slots", self.ac, self.backoff_slots);
        }
        trace!("{} start backoff={} slots at {} us", self.ac, slots, now);

        self.backoff_slots = slots;
        self.backoff_start = now;
    }

    /// Consume `n` backoff slots, the remaining backoff counts from `bound`
    pub fn update_backoff_slots_now(&mut self, n: u32, bound: Ts) {
        self.backoff_slots = self.backoff_slots.saturating_sub(n);
        self.backoff_start = bound;

        trace!(
            "{} update slots={} -> {} slots remaining, start at {} us",
            self.ac,
            n,
            self.backoff_slots,
            bound
        );
    }

    pub(crate) fn set_access_status(&mut self, access: AccessStatus) {
        self.access = access;
    }

    pub(crate) fn push_back(&mut self, id: FrameId) -> Result<(), FrameId> {
        self.queue.push_back(id)
    }

    pub(crate) fn peek(&self) -> Option<FrameId> {
        self.queue.front().copied()
    }

    pub(crate) fn pop(&mut self) -> Option<FrameId> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn cw_growth_is_capped() {
        let mut t = Txop::new(AccessCategory::Legacy, EdcaParams::new(15, 63, 2));

        assert_eq!(t.cw(), 15);
        t.update_failed_cw();
        assert_eq!(t.cw(), 31);
        t.update_failed_cw();
        assert_eq!(t.cw(), 63);
        t.update_failed_cw();
        assert_eq!(t.cw(), 63);

        t.reset_cw();
        assert_eq!(t.cw(), 15);
    }

    #[test]
    fn cw_growth_saturates() {
        let mut t = Txop::new(AccessCategory::Legacy, EdcaParams::new(15, u32::MAX, 2));

        for _ in 0..40 {
            t.update_failed_cw();
        }
        assert_eq!(t.cw(), u32::MAX - 1);

        t.update_failed_cw();
        assert_eq!(t.cw(), u32::MAX - 1);
    }

    #[test]
    fn backoff_slots_floor_at_zero() {
        let mut t = Txop::new(AccessCategory::BestEffort, EdcaParams::for_ac(AccessCategory::BestEffort));

        t.start_backoff_now(3, 100);
        t.update_backoff_slots_now(2, 118);
        assert_eq!(t.backoff_slots(), 1);
        assert_eq!(t.backoff_start(), 118);

        t.update_backoff_slots_now(4, 127);
        assert_eq!(t.backoff_slots(), 0);
    }

    #[test]
    fn qos_priority_order() {
        let qos: std::vec::Vec<_> = AccessCategory::iter().filter(|ac| ac.is_qos()).collect();
        assert_eq!(
            qos,
            &[
                AccessCategory::Voice,
                AccessCategory::Video,
                AccessCategory::BestEffort,
                AccessCategory::Background
            ]
        );

        assert_eq!(AccessCategory::from_tid(0), AccessCategory::BestEffort);
        assert_eq!(AccessCategory::from_tid(2), AccessCategory::Background);
        assert_eq!(AccessCategory::from_tid(AccessCategory::Voice.tid()), AccessCategory::Voice);
    }
}
