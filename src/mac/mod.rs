//! 802.11 DCF / EDCA Medium Access Control (MAC)
//!
//! [`Mac`] combines a [`ChannelAccessManager`], arbitrating channel access
//! between the transmit queues, with a [`FrameExchangeManager`] running the
//! frame exchange for whichever queue holds the channel.
//!
//! The MAC performs no I/O of its own, it is driven by the caller through
//! PHY notifications, enqueued frames and fired timer events
//! (see [`Mac::handle_timeout`]).
//
// Copyright 2021 Ryan Kurte

use bytes::Bytes;
use log::{debug, info, trace};
use rand_core::RngCore;
use strum::IntoEnumIterator;

use crate::error::{Invariant, MacError};
use crate::frame::{Frame, FrameType, Header, MacAddr};
use crate::manager::StationManager;
use crate::observer::MacObserver;
use crate::phy::{Phy, TxVector};
use crate::timer::{EventId, Scheduler, Timer};
use crate::Ts;

pub mod channel;
pub mod config;
pub mod exchange;
pub mod queue;
pub mod txop;

pub use channel::{AccessHandler, ChannelAccessManager, ChannelTiming, MediumState};
pub use config::{Config, EdcaParams};
pub use exchange::{Acknowledgment, FrameExchangeManager, PendingExchange, Protection, TxParameters, WaitReason};
pub use queue::{FrameArena, FrameId, Mpdu};
pub use txop::{AccessCategory, AccessStatus, Txop, TxopId, QUEUE_CAPACITY};

/// Timer events scheduled by the MAC
#[derive(Clone, Debug, PartialEq)]
pub enum MacEvent {
    /// Earliest backoff expiry among requesting queues
    AccessTimeout,
    /// Deferred access request for a queue
    RequestAccess(TxopId),
    /// Continue a fragment burst on a queue holding the channel
    StartTransmission(TxopId),
    /// Send the protected frame following CTS or CTS-to-self
    SendMpdu,
    /// Transmission of a frame without acknowledgment has completed
    TransmissionSucceeded,
    CtsTimeout,
    NormalAckTimeout,
    /// Respond to an RTS
    SendCts { rts: Header, rts_tx: TxVector },
    /// Acknowledge a received frame
    SendNormalAck { data: Header, data_tx: TxVector },
    /// No exchange followed an overheard RTS
    NavResetTimeout,
}

/// DCF / EDCA MAC instance
pub struct Mac<P, M, S, O, R> {
    address: MacAddr,
    config: Config,

    timer: Timer<MacEvent, S>,
    cam: ChannelAccessManager<R>,
    fem: FrameExchangeManager<P, M, O>,
}

impl<P, M, S, O, R> Mac<P, M, S, O, R>
where
    P: Phy,
    M: StationManager,
    S: Scheduler,
    O: MacObserver,
    R: RngCore,
{
    /// Create a new MAC, registering one queue per access category in priority order
    pub fn new(
        address: MacAddr,
        config: Config,
        phy: P,
        manager: M,
        scheduler: S,
        observer: O,
        rng: R,
    ) -> Result<Self, MacError> {
        let mut cam = ChannelAccessManager::new(ChannelTiming::from_phy(&phy), rng);

        let queues = AccessCategory::iter().filter(|ac| match ac {
            AccessCategory::Legacy => !config.qos_supported,
            AccessCategory::Beacon => config.beacon_queue,
            _ => config.qos_supported,
        });

        for ac in queues {
            debug!("Registering {} queue: {:?}", ac, config.edca(ac));
            cam.add(Txop::new(ac, config.edca(ac)))
                .map_err(|_| MacError::TooManyQueues(ac))?;
        }

        let fem = FrameExchangeManager::new(address, &config, phy, manager, observer);

        info!("MAC {} started with {} queues", address, cam.txops().len());

        Ok(Self {
            address,
            config,
            timer: Timer::new(scheduler),
            cam,
            fem,
        })
    }

    pub fn address(&self) -> MacAddr {
        self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> Ts {
        self.timer.now()
    }

    pub fn timer(&self) -> &Timer<MacEvent, S> {
        &self.timer
    }

    pub fn channel(&self) -> &ChannelAccessManager<R> {
        &self.cam
    }

    pub fn exchange(&self) -> &FrameExchangeManager<P, M, O> {
        &self.fem
    }

    pub fn medium(&self) -> &MediumState {
        self.cam.medium()
    }

    pub fn phy(&self) -> &P {
        self.fem.phy()
    }

    pub fn manager(&self) -> &M {
        self.fem.manager()
    }

    pub fn observer(&self) -> &O {
        self.fem.observer()
    }

    fn queue(&self, ac: AccessCategory) -> Result<&Txop, MacError> {
        let id = self.cam.find(ac).ok_or(MacError::NoQueue(ac))?;
        Ok(self.cam.txop(id))
    }

    /// Number of frames waiting in a queue
    pub fn queue_len(&self, ac: AccessCategory) -> Result<usize, MacError> {
        Ok(self.queue(ac)?.queue_len())
    }

    /// Current contention window of a queue
    pub fn cw(&self, ac: AccessCategory) -> Result<u32, MacError> {
        Ok(self.queue(ac)?.cw())
    }

    /// Remaining backoff slots of a queue
    pub fn backoff_slots(&self, ac: AccessCategory) -> Result<u32, MacError> {
        Ok(self.queue(ac)?.backoff_slots())
    }

    pub fn access_status(&self, ac: AccessCategory) -> Result<AccessStatus, MacError> {
        Ok(self.queue(ac)?.access_status())
    }

    /// End of the NAV set by overheard frames
    pub fn nav_end(&self) -> Ts {
        self.fem.nav_end()
    }

    /// Queue a frame for transmission on the queue for `ac`.
    /// The frame is returned in [`MacError::QueueFull`] if the queue is full.
    pub fn enqueue(&mut self, frame: Frame, ac: AccessCategory) -> Result<(), MacError> {
        let id = self.cam.find(ac).ok_or(MacError::NoQueue(ac))?;
        let now = self.timer.now();

        if self.cam.txop(id).queue_len() >= QUEUE_CAPACITY {
            debug!("{} queue full", ac);
            return Err(MacError::QueueFull(frame));
        }

        if self.cam.need_backoff_upon_access(id, now) {
            let slots = self.cam.generate_backoff(id, now);
            self.fem.observer_mut().backoff_generated(ac, slots);
        }

        trace!("Enqueue {:?} for {} on {}", frame.header.kind, frame.header.addr1, ac);

        let fid = self.fem.frames_mut().insert(Mpdu::new(frame, now));
        if let Err(fid) = self.cam.txop_mut(id).push_back(fid) {
            return match self.fem.frames_mut().remove(fid) {
                Some(mpdu) => Err(MacError::QueueFull(mpdu.frame)),
                None => Err(Invariant::UnknownFrame.into()),
            };
        }

        self.cam.start_access_if_needed(id, &mut self.timer, &mut self.fem)
    }

    /// Build and queue a data frame for `dest`.
    /// With QoS enabled the frame is sent as QoS data on the access category
    /// for `tid`, otherwise as legacy data.
    pub fn transmit_data(&mut self, dest: MacAddr, payload: Bytes, tid: u8) -> Result<(), MacError> {
        let (kind, ac) = match self.config.qos_supported {
            true => (FrameType::QosData, AccessCategory::from_tid(tid)),
            false => (FrameType::Data, AccessCategory::Legacy),
        };

        let mut header = Header::new(kind, dest, self.address);
        header.addr3 = self.config.bssid;
        if let Some(qos) = header.qos.as_mut() {
            qos.tid = tid & 0x0f;
        }

        self.enqueue(Frame::new(header, payload), ac)
    }

    /// Handle a fired timer event
    pub fn handle_timeout(&mut self, id: EventId) -> Result<(), MacError> {
        let event = match self.timer.triggered(&id) {
            Some(e) => e,
            None => {
                trace!("Ignoring stale timer {:?}", id);
                return Ok(());
            }
        };

        trace!("Timer event {:?} at {} us", event, self.timer.now());

        match event {
            MacEvent::AccessTimeout => self.cam.access_timeout(&mut self.timer, &mut self.fem),
            MacEvent::RequestAccess(txop) => {
                self.cam
                    .start_access_if_needed(txop, &mut self.timer, &mut self.fem)
            }
            e => self.fem.handle_event(&mut self.cam, &mut self.timer, e),
        }
    }

    /// PHY has started receiving a frame lasting `duration`
    pub fn notify_rx_start(&mut self, duration: Ts) {
        let now = self.timer.now();

        self.cam.notify_rx_start_now(now, duration);
        self.fem.notify_rx_start(&mut self.timer, duration);
    }

    /// PHY has successfully received a frame
    pub fn notify_rx_end_ok(&mut self, frame: Frame, tx: TxVector) -> Result<(), MacError> {
        let now = self.timer.now();

        self.cam.notify_rx_end_ok_now(now);
        self.fem.receive(&mut self.cam, &mut self.timer, frame, tx)
    }

    /// PHY has received a frame buffer (without FCS).
    /// Buffers that fail to decode are treated as a reception error.
    pub fn notify_rx_end_ok_bytes(&mut self, data: &[u8], tx: TxVector) -> Result<(), MacError> {
        match Frame::decode(data) {
            Ok(frame) => self.notify_rx_end_ok(frame, tx),
            Err(e) => {
                debug!("Failed to decode {} byte frame: {:?}", data.len(), e);
                self.notify_rx_end_error();
                Err(e.into())
            }
        }
    }

    /// PHY reception failed
    pub fn notify_rx_end_error(&mut self) {
        let now = self.timer.now();
        self.cam.notify_rx_end_error_now(now);
    }

    /// Carrier sense reports the medium busy for `duration`
    pub fn notify_cca_busy_start(&mut self, duration: Ts) {
        let now = self.timer.now();
        self.cam.notify_cca_busy_start_now(now, duration);
    }

    /// A transmission not originating from this MAC has started on the PHY
    pub fn notify_tx_start(&mut self, duration: Ts) {
        let now = self.timer.now();
        self.cam.notify_tx_start_now(now, duration);
    }

    /// Cancel every outstanding timer and abandon the exchange in progress
    fn hard_reset(&mut self) {
        let now = self.timer.now();

        self.timer.cancel_all();
        self.fem.reset(now);
    }

    /// PHY is switching channel for `duration`
    pub fn notify_switching_start(&mut self, duration: Ts) {
        self.hard_reset();
        self.cam.notify_switching_start_now(&mut self.timer, duration);
    }

    pub fn notify_sleep(&mut self) {
        self.hard_reset();
        self.cam.notify_sleep_now(&mut self.timer);
    }

    pub fn notify_wakeup(&mut self) {
        self.cam.notify_wakeup_now(&mut self.timer);
    }

    pub fn notify_off(&mut self) {
        self.hard_reset();
        self.cam.notify_off_now(&mut self.timer);
    }

    pub fn notify_on(&mut self) {
        self.cam.notify_on_now(&mut self.timer);
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;

    use super::*;
    use crate::mock::{Bench, MockPhy, Observed};

    #[test]
    fn legacy_registers_single_queue() {
        let b = Bench::new(Config::default(), Bench::manager_config(), &[]);

        let acs: Vec<_> = b.mac.channel().txops().iter().map(|t| t.ac()).collect();
        assert_eq!(acs, &[AccessCategory::Legacy]);

        assert_eq!(b.mac.cw(AccessCategory::Legacy), Ok(15));
        assert_eq!(
            b.mac.queue_len(AccessCategory::Voice),
            Err(MacError::NoQueue(AccessCategory::Voice))
        );
    }

    #[test]
    fn qos_registers_in_priority_order() {
        let config = Config {
            qos_supported: true,
            beacon_queue: true,
            ..Default::default()
        };
        let b = Bench::new(config, Bench::manager_config(), &[]);

        let acs: Vec<_> = b.mac.channel().txops().iter().map(|t| t.ac()).collect();
        assert_eq!(
            acs,
            &[
                AccessCategory::Voice,
                AccessCategory::Video,
                AccessCategory::BestEffort,
                AccessCategory::Background,
                AccessCategory::Beacon
            ]
        );

        assert_eq!(b.mac.cw(AccessCategory::Voice), Ok(3));
        assert_eq!(b.mac.cw(AccessCategory::Background), Ok(15));
    }

    #[test]
    fn enqueue_returns_frame_when_full() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[]);

        for _ in 0..QUEUE_CAPACITY {
            let f = b.data(10);
            b.mac.enqueue(f, AccessCategory::Legacy).unwrap();
        }
        assert_eq!(b.mac.queue_len(AccessCategory::Legacy), Ok(QUEUE_CAPACITY));

        let f = b.data(11);
        assert_eq!(
            b.mac.enqueue(f.clone(), AccessCategory::Legacy),
            Err(MacError::QueueFull(f))
        );
        assert_eq!(b.mac.exchange().frames().len(), QUEUE_CAPACITY);
    }

    #[test]
    fn enqueue_without_queue() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[]);
        let f = b.data(10);

        assert_eq!(
            b.mac.enqueue(f, AccessCategory::Video),
            Err(MacError::NoQueue(AccessCategory::Video))
        );
    }

    #[test]
    fn transmit_qos_data_per_tid_sequences() {
        let config = Config {
            qos_supported: true,
            bssid: MacAddr::local(0x99),
            ..Default::default()
        };
        let mut b = Bench::new(config, Bench::manager_config(), &[]);
        let peer = b.peer;

        b.mac.transmit_data(peer, Bytes::from_static(&[0u8; 72]), 6).unwrap();
        b.mac.transmit_data(peer, Bytes::from_static(&[1u8; 72]), 6).unwrap();
        b.mac.transmit_data(peer, Bytes::from_static(&[2u8; 72]), 0).unwrap();
        b.run();

        let sent = b.phy.sent_kind(FrameType::QosData);
        assert_eq!(sent.len(), 3);

        // Voice wins the first access after AIFS (SIFS + 2 slots)
        assert_eq!(sent[0].at, 34);
        assert_eq!(sent[0].frame.header.tid(), Some(6));

        let seqs = |tid: u8| -> Vec<u16> {
            sent.iter()
                .filter(|s| s.frame.header.tid() == Some(tid))
                .map(|s| s.frame.header.sequence_number())
                .collect()
        };
        assert_eq!(seqs(6), &[0, 1]);
        assert_eq!(seqs(0), &[0]);

        for s in &sent {
            assert_eq!(s.frame.header.addr3, MacAddr::local(0x99));
            assert_eq!(s.frame.header.addr2, b.address());
        }

        assert_eq!(b.observer.acked().len(), 3);
        assert_eq!(b.mac.queue_len(AccessCategory::Voice), Ok(0));
        assert_eq!(b.mac.queue_len(AccessCategory::BestEffort), Ok(0));
    }

    #[test]
    fn switching_abandons_exchange() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[]);
        b.respond = false;

        let f = b.data(72);
        b.enqueue_at(0, f, AccessCategory::Legacy);
        b.switching_at(100, 50);
        b.run_until(250);

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].at, 34);

        // No outcome is reported for the abandoned attempt, the frame is sent
        // again after switching ends (150), SIFS and AIFS
        assert_eq!(sent[1].at, 184);
        assert!(!sent[1].frame.header.is_retry());
        assert_eq!(sent[1].frame.header.sequence_number(), sent[0].frame.header.sequence_number());

        assert!(b.observer.dropped().is_empty());
        assert!(b.observer.acked().is_empty());
        assert_eq!(b.mac.cw(AccessCategory::Legacy), Ok(15));
    }

    #[test]
    fn sleep_denies_access() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[]);

        let f = b.data(72);
        b.sleep_at(0);
        b.enqueue_at(10, f, AccessCategory::Legacy);
        b.run_until(190);

        assert!(b.phy.sent().is_empty());
        assert_eq!(b.mac.access_status(AccessCategory::Legacy), Ok(AccessStatus::NotRequested));

        b.wakeup_at(200);
        b.run();

        let sent = b.phy.sent_kind(FrameType::Data);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].at, 200);
        assert_eq!(b.observer.acked().len(), 1);
    }

    #[test]
    fn decode_failure_is_rx_error() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[]);

        b.mac.notify_rx_start(50);
        b.sched.set_now(50);

        assert!(b.mac.notify_rx_end_ok_bytes(&[0xd4, 0x00, 0x00], Bench::RATE).is_err());
        assert!(!b.mac.medium().last_rx_ok);

        // EIFS applies to the next access
        let eifs = MockPhy::SIFS + MockPhy::airtime(crate::frame::ACK_SIZE, MockPhy::BASIC_RATE_KBPS);
        assert_eq!(
            b.mac.medium().access_grant_start(b.mac.channel().timing(), 60, false),
            50 + MockPhy::SIFS + eifs
        );
    }

    #[test]
    fn observer_sees_access_and_release() {
        let mut b = Bench::new(Config::default(), Bench::manager_config(), &[5]);

        let f = b.data(72);
        b.enqueue_at(0, f, AccessCategory::Legacy);
        b.run();

        let events = b.observer.events();
        assert_eq!(
            events
                .iter()
                .filter(|e| !matches!(e, Observed::Acked(_)))
                .cloned()
                .collect::<Vec<_>>(),
            &[
                Observed::ChannelAccessed(AccessCategory::Legacy),
                Observed::ChannelReleased(AccessCategory::Legacy),
                Observed::Backoff(AccessCategory::Legacy, 5),
            ]
        );
    }
}
