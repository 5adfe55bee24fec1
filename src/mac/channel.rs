//! Channel access manager, tracks medium state and arbitrates access between
//! contending queues.
//!
//! Each queue counts down its backoff only while the medium has been idle for
//! at least its AIFS, the highest priority queue whose backoff has expired is
//! handed to the [`AccessHandler`], and any other expired queue suffers an
//! internal collision.
//
// Copyright 2021 Ryan Kurte

use heapless::Vec;
use log::{debug, trace};
use rand_core::RngCore;

use crate::error::{Invariant, MacError};
use crate::phy::Phy;
use crate::timer::{EventId, Scheduler, Timer};
use crate::Ts;

use super::txop::{AccessCategory, AccessStatus, Txop, TxopId};
use super::MacEvent;

/// Maximum number of queues registered with a channel access manager
pub const MAX_TXOPS: usize = 6;

/// Inter-frame timing used for access decisions
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ChannelTiming {
    pub sifs: Ts,
    pub slot: Ts,
    /// EIFS minus DIFS, ie. SIFS plus ACK airtime at the lowest rate
    pub eifs_no_difs: Ts,
}

impl ChannelTiming {
    pub fn from_phy<P: Phy>(phy: &P) -> Self {
        Self {
            sifs: phy.sifs(),
            slot: phy.slot(),
            eifs_no_difs: phy.sifs() + phy.ack_tx_time(),
        }
    }
}

/// Most recent medium events, each field is last-writer-wins
#[derive(Clone, PartialEq, Debug)]
pub struct MediumState {
    pub last_rx_start: Ts,
    pub last_rx_duration: Ts,
    pub last_rx_ok: bool,
    /// A reception is in progress
    pub rxing: bool,
    pub last_tx_start: Ts,
    pub last_tx_duration: Ts,
    pub last_cca_busy_start: Ts,
    pub last_cca_busy_duration: Ts,
    pub last_nav_start: Ts,
    pub last_nav_duration: Ts,
    pub last_switching_start: Ts,
    pub last_switching_duration: Ts,
    pub last_ack_timeout_end: Ts,
    pub last_cts_timeout_end: Ts,
    pub sleeping: bool,
    pub off: bool,
}

impl Default for MediumState {
    fn default() -> Self {
        Self {
            last_rx_start: 0,
            last_rx_duration: 0,
            last_rx_ok: true,
            rxing: false,
            last_tx_start: 0,
            last_tx_duration: 0,
            last_cca_busy_start: 0,
            last_cca_busy_duration: 0,
            last_nav_start: 0,
            last_nav_duration: 0,
            last_switching_start: 0,
            last_switching_duration: 0,
            last_ack_timeout_end: 0,
            last_cts_timeout_end: 0,
            sleeping: false,
            off: false,
        }
    }
}

impl MediumState {
    pub fn rx_end(&self) -> Ts {
        self.last_rx_start + self.last_rx_duration
    }

    pub fn tx_end(&self) -> Ts {
        self.last_tx_start + self.last_tx_duration
    }

    pub fn cca_busy_end(&self) -> Ts {
        self.last_cca_busy_start + self.last_cca_busy_duration
    }

    pub fn nav_end(&self) -> Ts {
        self.last_nav_start + self.last_nav_duration
    }

    pub fn switching_end(&self) -> Ts {
        self.last_switching_start + self.last_switching_duration
    }

    /// Whether physical or virtual carrier sense indicates a busy medium
    pub fn is_busy(&self, now: Ts) -> bool {
        self.rx_end() > now || self.tx_end() > now || self.nav_end() > now || self.cca_busy_end() > now
    }

    /// Earliest time from which the medium counts as idle for access purposes
    pub fn access_grant_start(&self, timing: &ChannelTiming, now: Ts, ignore_nav: bool) -> Ts {
        let sifs = timing.sifs;

        let mut rx_access_start = self.rx_end() + sifs;
        if self.rx_end() <= now && !self.last_rx_ok {
            rx_access_start += timing.eifs_no_difs;
        }

        let mut start = rx_access_start
            .max(self.cca_busy_end() + sifs)
            .max(self.tx_end() + sifs)
            .max(self.last_ack_timeout_end + sifs)
            .max(self.last_cts_timeout_end + sifs)
            .max(self.switching_end() + sifs);

        if !ignore_nav {
            start = start.max(self.nav_end() + sifs);
        }

        start
    }

    /// Truncate all busy intervals to end at `now`
    fn truncate(&mut self, now: Ts) {
        if self.rxing {
            self.last_rx_duration = now - self.last_rx_start;
            self.last_rx_ok = true;
            self.rxing = false;
        }
        if self.rx_end() > now {
            self.last_rx_duration = now.saturating_sub(self.last_rx_start);
        }
        if self.tx_end() > now {
            self.last_tx_duration = now.saturating_sub(self.last_tx_start);
        }
        if self.nav_end() > now {
            self.last_nav_duration = now.saturating_sub(self.last_nav_start);
        }
        if self.cca_busy_end() > now {
            self.last_cca_busy_duration = now.saturating_sub(self.last_cca_busy_start);
        }
        if self.last_ack_timeout_end > now {
            self.last_ack_timeout_end = now;
        }
        if self.last_cts_timeout_end > now {
            self.last_cts_timeout_end = now;
        }
    }
}

/// Receiver of channel access grants, implemented by the frame exchange manager
pub trait AccessHandler<R, S> {
    /// Start a frame exchange for the granted queue.
    /// Returns `false` if the queue had nothing to send, in which case access
    /// is offered to the next ready queue.
    fn start_transmission(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<bool, MacError>;

    /// Notify a queue that it lost an internal collision
    fn notify_internal_collision(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<(), MacError>;
}

/// Channel access manager, owns the medium state and the ordered queue list
pub struct ChannelAccessManager<R> {
    timing: ChannelTiming,
    medium: MediumState,
    txops: Vec<Txop, MAX_TXOPS>,
    access_timeout: Option<EventId>,
    rng: R,
}

impl<R: RngCore> ChannelAccessManager<R> {
    pub fn new(timing: ChannelTiming, rng: R) -> Self {
        Self {
            timing,
            medium: MediumState::default(),
            txops: Vec::new(),
            access_timeout: None,
            rng,
        }
    }

    /// Register a queue, registration order sets priority (first is highest)
    pub fn add(&mut self, txop: Txop) -> Result<TxopId, Txop> {
        let id = TxopId(self.txops.len() as u8);
        self.txops.push(txop)?;
        Ok(id)
    }

    pub fn timing(&self) -> &ChannelTiming {
        &self.timing
    }

    pub fn medium(&self) -> &MediumState {
        &self.medium
    }

    pub fn txops(&self) -> &[Txop] {
        &self.txops
    }

    /// Fetch a queue, `None` if the id was not issued by this manager
    pub fn get(&self, id: TxopId) -> Option<&Txop> {
        self.txops.get(id.index())
    }

    pub(crate) fn txop(&self, id: TxopId) -> &Txop {
        &self.txops[id.index()]
    }

    pub(crate) fn txop_mut(&mut self, id: TxopId) -> &mut Txop {
        &mut self.txops[id.index()]
    }

    /// Find the highest priority queue for an access category
    pub fn find(&self, ac: AccessCategory) -> Option<TxopId> {
        self.txops.iter().position(|t| t.ac() == ac).map(|i| TxopId(i as u8))
    }

    /// Whether an access timeout is armed
    pub fn access_timeout_pending<S: Scheduler>(&self, timer: &Timer<MacEvent, S>) -> bool {
        match &self.access_timeout {
            Some(id) => timer.is_pending(id),
            None => false,
        }
    }

    fn backoff_start_for(&self, txop: &Txop, now: Ts) -> Ts {
        let grant = self.medium.access_grant_start(&self.timing, now, false);
        txop.backoff_start().max(grant + txop.aifsn() as Ts * self.timing.slot)
    }

    fn backoff_end_for(&self, txop: &Txop, now: Ts) -> Ts {
        self.backoff_start_for(txop, now) + txop.backoff_slots() as Ts * self.timing.slot
    }

    /// Time from which the queue's remaining backoff counts down
    pub fn backoff_start(&self, id: TxopId, now: Ts) -> Option<Ts> {
        self.get(id).map(|t| self.backoff_start_for(t, now))
    }

    /// Time at which the queue's backoff expires if the medium stays idle
    pub fn backoff_end(&self, id: TxopId, now: Ts) -> Option<Ts> {
        self.get(id).map(|t| self.backoff_end_for(t, now))
    }

    /// Consume backoff slots for every queue that has observed an idle AIFS
    pub fn update_backoff(&mut self, now: Ts) {
        let slot = self.timing.slot;
        let grant = self.medium.access_grant_start(&self.timing, now, false);

        for txop in self.txops.iter_mut() {
            let start = txop.backoff_start().max(grant + txop.aifsn() as Ts * slot);
            if start > now {
                continue;
            }

            let mut n = ((now - start) / slot) as u32;
            // EDCA counts a slot at the AIFS boundary as well as each idle slot thereafter
            if txop.is_qos() {
                n += 1;
            }

            let n = n.min(txop.backoff_slots());
            txop.update_backoff_slots_now(n, start + n as Ts * slot);
        }
    }

    /// Draw a fresh backoff for a queue, returns the drawn slot count
    pub(crate) fn generate_backoff(&mut self, id: TxopId, now: Ts) -> u32 {
        let txop = &mut self.txops[id.index()];
        let slots = self.rng.next_u32() % (txop.cw() + 1);

        debug!("{} backoff {} slots (cw {}) at {} us", txop.ac(), slots, txop.cw(), now);
        txop.start_backoff_now(slots, now);

        slots
    }

    /// Determine whether a new backoff is required before a frame is queued.
    ///
    /// A queue that is empty with no pending backoff may access the medium
    /// directly if it is idle, otherwise a backoff must be drawn.
    pub(crate) fn need_backoff_upon_access(&mut self, id: TxopId, now: Ts) -> bool {
        self.update_backoff(now);

        let busy = self.medium.is_busy(now);
        let sifs = self.timing.sifs;
        let slot = self.timing.slot;

        let txop = &mut self.txops[id.index()];
        if txop.has_frames() || txop.is_granted() || txop.backoff_slots() != 0 {
            return false;
        }

        if busy {
            return true;
        }

        // Idle medium, DCF may transmit after DIFS while EDCA aligns to the next slot
        let delay = match txop.is_qos() {
            true => 0,
            false => sifs + txop.aifsn() as Ts * slot,
        };
        txop.update_backoff_slots_now(0, now + delay);

        false
    }

    /// Request access for a queue with frames to send
    pub fn request_access<S, H>(&mut self, id: TxopId, timer: &mut Timer<MacEvent, S>, handler: &mut H) -> Result<(), MacError>
    where
        S: Scheduler,
        H: AccessHandler<R, S>,
    {
        let now = timer.now();

        if self.medium.sleeping || self.medium.off {
            debug!("{} access denied while sleeping or off at {} us", self.txop(id).ac(), now);
            return Ok(());
        }

        let slot = self.timing.slot;
        let grant = self.medium.access_grant_start(&self.timing, now, false);

        let txop = &mut self.txops[id.index()];
        let access_grant_start = grant + txop.aifsn() as Ts * slot;

        // Align EDCA backoff start to the slot grid following AIFS
        if txop.is_qos() && txop.backoff_start() > access_grant_start {
            let diff = txop.backoff_start() - access_grant_start;
            let n = diff / slot + 1;
            txop.update_backoff_slots_now(0, access_grant_start + n * slot);
        }

        debug!("{} access requested at {} us", txop.ac(), now);
        txop.set_access_status(AccessStatus::Requested);

        self.update_backoff(now);
        self.do_grant_access(timer, handler)?;
        self.restart_access_timeout_if_needed(timer);

        Ok(())
    }

    /// Request access if the queue has frames and is not already contending
    pub fn start_access_if_needed<S, H>(&mut self, id: TxopId, timer: &mut Timer<MacEvent, S>, handler: &mut H) -> Result<(), MacError>
    where
        S: Scheduler,
        H: AccessHandler<R, S>,
    {
        let txop = self.txop(id);
        if txop.access_status() != AccessStatus::NotRequested || !txop.has_frames() {
            return Ok(());
        }

        self.request_access(id, timer, handler)
    }

    /// Handle expiry of the access timeout
    pub fn access_timeout<S, H>(&mut self, timer: &mut Timer<MacEvent, S>, handler: &mut H) -> Result<(), MacError>
    where
        S: Scheduler,
        H: AccessHandler<R, S>,
    {
        self.access_timeout = None;

        self.update_backoff(timer.now());
        self.do_grant_access(timer, handler)?;
        self.restart_access_timeout_if_needed(timer);

        Ok(())
    }

    fn do_grant_access<S, H>(&mut self, timer: &mut Timer<MacEvent, S>, handler: &mut H) -> Result<(), MacError>
    where
        S: Scheduler,
        H: AccessHandler<R, S>,
    {
        let now = timer.now();

        for i in 0..self.txops.len() {
            let txop = &self.txops[i];
            if !txop.is_access_requested() || self.backoff_end_for(txop, now) > now {
                continue;
            }

            let winner = TxopId(i as u8);

            // Lower priority queues expiring at the same instant collide internally
            let mut victims: Vec<TxopId, MAX_TXOPS> = Vec::new();
            for j in (i + 1)..self.txops.len() {
                let other = &self.txops[j];
                if other.is_access_requested() && self.backoff_end_for(other, now) <= now {
                    let _ = victims.push(TxopId(j as u8));
                }
            }

            debug!("{} granted access at {} us", txop.ac(), now);

            if handler.start_transmission(self, timer, winner)? {
                for v in victims {
                    debug!("{} internal collision at {} us", self.txop(v).ac(), now);
                    handler.notify_internal_collision(self, timer, v)?;
                }
                break;
            }

            trace!("{} had nothing to send, continuing", self.txop(winner).ac());
        }

        Ok(())
    }

    /// Arm the access timeout for the earliest pending backoff expiry
    pub fn restart_access_timeout_if_needed<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();

        let expected = self
            .txops
            .iter()
            .filter(|t| t.is_access_requested())
            .map(|t| self.backoff_end_for(t, now))
            .filter(|end| *end > now)
            .min();

        let expected = match expected {
            Some(e) => e,
            None => return,
        };

        if let Some(id) = self.access_timeout {
            match timer.deadline(&id) {
                Some(d) if d > expected => {
                    trace!("Rescheduling access timeout from {} to {} us", d, expected);
                    timer.cancel_event(id);
                    self.access_timeout = None;
                }
                Some(_) => (),
                None => self.access_timeout = None,
            }
        }

        if self.access_timeout.is_none() {
            trace!("Access timeout at {} us", expected);
            self.access_timeout = Some(timer.schedule_event(expected, MacEvent::AccessTimeout));
        }
    }

    /// Mark a queue as holding the channel
    pub fn notify_channel_accessed(&mut self, id: TxopId) -> Result<(), MacError> {
        if let Some(holder) = self.txops.iter().position(|t| t.is_granted()) {
            if holder != id.index() {
                return Err(Invariant::DoubleGrant {
                    granted: id,
                    holder: TxopId(holder as u8),
                }
                .into());
            }
        }

        self.txops[id.index()].set_access_status(AccessStatus::Granted);
        Ok(())
    }

    /// Release a queue following a frame exchange or internal collision.
    ///
    /// The queue draws a fresh backoff and, if frames remain, re-requests
    /// access in a new callback at the current instant. Returns the drawn slots.
    pub fn release<S: Scheduler>(&mut self, id: TxopId, timer: &mut Timer<MacEvent, S>) -> u32 {
        let now = timer.now();

        self.txops[id.index()].set_access_status(AccessStatus::NotRequested);
        let slots = self.generate_backoff(id, now);

        if self.txop(id).has_frames() {
            timer.schedule_after(0, MacEvent::RequestAccess(id));
        }

        slots
    }

    pub fn notify_rx_start_now(&mut self, now: Ts, duration: Ts) {
        debug!("rx start at {} us for {} us", now, duration);
        self.update_backoff(now);

        self.medium.last_rx_start = now;
        self.medium.last_rx_duration = duration;
        self.medium.rxing = true;
    }

    pub fn notify_rx_end_ok_now(&mut self, now: Ts) {
        debug!("rx end ok at {} us", now);
        self.update_backoff(now);

        self.medium.last_rx_duration = now.saturating_sub(self.medium.last_rx_start);
        self.medium.last_rx_ok = true;
        self.medium.rxing = false;
    }

    pub fn notify_rx_end_error_now(&mut self, now: Ts) {
        debug!("rx end error at {} us", now);
        self.update_backoff(now);

        // Carrier remains sensed busy until the announced end of the frame
        let announced_end = self.medium.rx_end();
        if announced_end > now {
            self.medium.last_cca_busy_start = now;
            self.medium.last_cca_busy_duration = announced_end - now;
        }

        self.medium.last_rx_duration = now.saturating_sub(self.medium.last_rx_start);
        self.medium.last_rx_ok = false;
        self.medium.rxing = false;
    }

    pub fn notify_tx_start_now(&mut self, now: Ts, duration: Ts) {
        debug!("tx start at {} us for {} us", now, duration);
        self.update_backoff(now);

        if self.medium.rxing {
            trace!("tx truncates reception");
            self.medium.last_rx_duration = now - self.medium.last_rx_start;
            self.medium.last_rx_ok = true;
            self.medium.rxing = false;
        }

        self.medium.last_tx_start = now;
        self.medium.last_tx_duration = duration;
    }

    pub fn notify_cca_busy_start_now(&mut self, now: Ts, duration: Ts) {
        debug!("cca busy at {} us for {} us", now, duration);
        self.update_backoff(now);

        self.medium.last_cca_busy_start = now;
        self.medium.last_cca_busy_duration = duration;
    }

    /// Extend the NAV, a NAV ending earlier than the current one is ignored
    pub fn notify_nav_start_now(&mut self, now: Ts, duration: Ts) {
        self.update_backoff(now);

        if now + duration > self.medium.nav_end() {
            debug!("nav start at {} us for {} us", now, duration);
            self.medium.last_nav_start = now;
            self.medium.last_nav_duration = duration;
        }
    }

    pub fn notify_nav_reset_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>, duration: Ts) {
        let now = timer.now();
        debug!("nav reset at {} us for {} us", now, duration);
        self.update_backoff(now);

        self.medium.last_nav_start = now;
        self.medium.last_nav_duration = duration;

        // Medium may now be idle earlier than the armed timeout expects
        self.restart_access_timeout_if_needed(timer);
    }

    pub fn notify_ack_timeout_start_now(&mut self, now: Ts, duration: Ts) {
        self.update_backoff(now);
        self.medium.last_ack_timeout_end = now + duration;
    }

    pub fn notify_ack_timeout_reset_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        self.update_backoff(now);

        self.medium.last_ack_timeout_end = now;
        self.restart_access_timeout_if_needed(timer);
    }

    pub fn notify_cts_timeout_start_now(&mut self, now: Ts, duration: Ts) {
        self.update_backoff(now);
        self.medium.last_cts_timeout_end = now + duration;
    }

    pub fn notify_cts_timeout_reset_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        self.update_backoff(now);

        self.medium.last_cts_timeout_end = now;
        self.restart_access_timeout_if_needed(timer);
    }

    /// Cancel the access timeout and return every queue to an idle state
    fn reset_txops<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>, now: Ts) {
        if let Some(id) = self.access_timeout.take() {
            timer.cancel_event(id);
        }

        for txop in self.txops.iter_mut() {
            let remaining = txop.backoff_slots();
            if remaining > 0 {
                txop.update_backoff_slots_now(remaining, now);
            }
            txop.reset_cw();
            txop.set_access_status(AccessStatus::NotRequested);
        }
    }

    /// Re-request access for every queue holding frames
    fn restart_queues<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        for i in 0..self.txops.len() {
            if self.txops[i].has_frames() {
                timer.schedule_after(0, MacEvent::RequestAccess(TxopId(i as u8)));
            }
        }
    }

    pub fn notify_switching_start_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>, duration: Ts) {
        let now = timer.now();
        debug!("switching start at {} us for {} us", now, duration);

        self.medium.truncate(now);
        self.reset_txops(timer, now);

        self.medium.last_switching_start = now;
        self.medium.last_switching_duration = duration;

        self.restart_queues(timer);
    }

    pub fn notify_sleep_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        debug!("sleep at {} us", now);

        self.medium.sleeping = true;
        self.medium.truncate(now);
        self.reset_txops(timer, now);
    }

    pub fn notify_wakeup_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        debug!("wakeup at {} us", now);

        self.medium.sleeping = false;
        self.reset_txops(timer, now);
        self.restart_queues(timer);
    }

    pub fn notify_off_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        debug!("off at {} us", now);

        self.medium.off = true;
        self.medium.truncate(now);
        self.reset_txops(timer, now);
    }

    pub fn notify_on_now<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>) {
        let now = timer.now();
        debug!("on at {} us", now);

        self.medium.off = false;
        self.reset_txops(timer, now);
        self.restart_queues(timer);
    }
}
