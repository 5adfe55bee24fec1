//! Mock PHY, RNG and observer, plus a single station test bench
//! driving a MAC on a simulated timeline.
//
// Copyright 2021 Ryan Kurte

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use bytes::Bytes;
use rand_core::{impls, Error, RngCore};

use crate::frame::{duration_id, Frame, FrameType, Header, MacAddr, ACK_SIZE, CTS_SIZE};
use crate::mac::{AccessCategory, Config, Mac};
use crate::manager::{ConstantRateManager, ManagerConfig};
use crate::observer::{DropReason, MacObserver};
use crate::phy::{Phy, TxVector};
use crate::timer::sim::SimScheduler;
use crate::timer::{EventId, Scheduler};
use crate::Ts;

/// RNG returning scripted values in order, then zero
#[derive(Clone, Debug, Default)]
pub struct SeqRng {
    values: VecDeque<u32>,
}

impl SeqRng {
    pub fn new(values: &[u32]) -> Self {
        Self {
            values: values.iter().copied().collect(),
        }
    }

    pub fn push(&mut self, value: u32) {
        self.values.push_back(value);
    }
}

impl RngCore for SeqRng {
    fn next_u32(&mut self) -> u32 {
        self.values.pop_front().unwrap_or(0)
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Frame handed to a [`MockPhy`]
#[derive(Clone, Debug, PartialEq)]
pub struct Sent {
    pub at: Ts,
    pub frame: Frame,
    pub tx: TxVector,
}

/// PHY with simple integer timing that records transmitted frames.
/// Clones share the record.
#[derive(Clone, Debug)]
pub struct MockPhy {
    sched: SimScheduler,
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl MockPhy {
    pub const SIFS: Ts = 16;
    pub const SLOT: Ts = 9;
    pub const PREAMBLE: Ts = 20;

    /// Rate used for EIFS ACK time
    pub const BASIC_RATE_KBPS: u32 = 8_000;

    pub fn new(sched: SimScheduler) -> Self {
        Self {
            sched,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Preamble plus one microsecond per byte at 8 Mbit/s, rounded up
    pub fn airtime(size: usize, rate_kbps: u32) -> Ts {
        let bits = size as u64 * 8_000;
        let rate = rate_kbps.max(1) as u64;

        Self::PREAMBLE + (bits + rate - 1) / rate
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Frames sent with the provided frame type
    pub fn sent_kind(&self, kind: FrameType) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.frame.header.kind == kind).collect()
    }
}

impl Phy for MockPhy {
    fn sifs(&self) -> Ts {
        Self::SIFS
    }

    fn slot(&self) -> Ts {
        Self::SLOT
    }

    fn preamble_and_header_duration(&self, _tx: &TxVector) -> Ts {
        Self::PREAMBLE
    }

    fn tx_duration(&self, size: usize, tx: &TxVector) -> Ts {
        Self::airtime(size, tx.rate_kbps)
    }

    fn ack_tx_time(&self) -> Ts {
        Self::airtime(ACK_SIZE, Self::BASIC_RATE_KBPS)
    }

    fn send(&mut self, frame: &Frame, tx: &TxVector) {
        let at = self.sched.now();
        self.sent.lock().unwrap().push(Sent {
            at,
            frame: frame.clone(),
            tx: *tx,
        });
    }
}

/// Observed MAC event
#[derive(Clone, Debug, PartialEq)]
pub enum Observed {
    ChannelAccessed(AccessCategory),
    ChannelReleased(AccessCategory),
    Backoff(AccessCategory, u32),
    InternalCollision(AccessCategory),
    Acked(Frame),
    Dropped(Frame, DropReason),
    Received(Frame),
}

/// Observer recording every event, clones share the record
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Observed>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<Frame> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Acked(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn dropped(&self) -> Vec<(Frame, DropReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Dropped(f, r) => Some((f, r)),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self) -> Vec<Frame> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Received(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn push(&mut self, e: Observed) {
        self.events.lock().unwrap().push(e);
    }
}

impl MacObserver for RecordingObserver {
    fn channel_accessed(&mut self, ac: AccessCategory) {
        self.push(Observed::ChannelAccessed(ac));
    }

    fn channel_released(&mut self, ac: AccessCategory) {
        self.push(Observed::ChannelReleased(ac));
    }

    fn backoff_generated(&mut self, ac: AccessCategory, slots: u32) {
        self.push(Observed::Backoff(ac, slots));
    }

    fn internal_collision(&mut self, ac: AccessCategory) {
        self.push(Observed::InternalCollision(ac));
    }

    fn frame_acked(&mut self, frame: &Frame) {
        self.push(Observed::Acked(frame.clone()));
    }

    fn frame_dropped(&mut self, frame: &Frame, reason: DropReason) {
        self.push(Observed::Dropped(frame.clone(), reason));
    }

    fn frame_received(&mut self, frame: &Frame) {
        self.push(Observed::Received(frame.clone()));
    }
}

pub type MockMac = Mac<MockPhy, ConstantRateManager, SimScheduler, RecordingObserver, SeqRng>;

const MAC: usize = 0;
const STIM: usize = 1;

#[derive(Debug)]
enum Stim {
    Rx(Frame, TxVector),
    RxEnd(Frame, TxVector),
    Enqueue(Frame, AccessCategory),
    Switching(Ts),
    Sleep,
    Wakeup,
}

/// Single station bench.
///
/// Frames are injected as receptions at scheduled times, and a scripted
/// peer answers RTS with CTS and data with ACK after SIFS.
pub struct Bench {
    pub sched: SimScheduler,
    pub mac: MockMac,
    pub phy: MockPhy,
    pub observer: RecordingObserver,

    /// Remote station answering frames sent by the MAC
    pub peer: MacAddr,
    /// Answer RTS and data frames addressed to the peer
    pub respond: bool,
    /// Responses to withhold before answering
    pub skip_responses: usize,

    stim: SimScheduler,
    pending: BTreeMap<EventId, Stim>,
    seen: usize,
}

impl Bench {
    /// Rate used for every frame on the bench
    pub const RATE: TxVector = TxVector::new(8_000);

    /// Station manager configuration with all frames at [`Bench::RATE`]
    pub fn manager_config() -> ManagerConfig {
        ManagerConfig {
            data_rate_kbps: Self::RATE.rate_kbps,
            control_rate_kbps: Self::RATE.rate_kbps,
            ..Default::default()
        }
    }

    pub fn new(config: Config, manager: ManagerConfig, backoffs: &[u32]) -> Self {
        #[cfg(test)]
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let sched = SimScheduler::new();
        let phy = MockPhy::new(sched.clone());
        let observer = RecordingObserver::new();

        let mac = Mac::new(
            MacAddr::local(1),
            config,
            phy.clone(),
            ConstantRateManager::new(manager),
            sched.handle(MAC),
            observer.clone(),
            SeqRng::new(backoffs),
        )
        .unwrap();

        Self {
            stim: sched.handle(STIM),
            sched,
            mac,
            phy,
            observer,
            peer: MacAddr::local(2),
            respond: true,
            skip_responses: 0,
            pending: BTreeMap::new(),
            seen: 0,
        }
    }

    pub fn address(&self) -> MacAddr {
        self.mac.address()
    }

    /// Data frame from this station to the peer
    pub fn data(&self, len: usize) -> Frame {
        let mut header = Header::new(FrameType::Data, self.peer, self.address());
        header.addr3 = self.peer;

        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        Frame::new(header, Bytes::from(payload))
    }

    /// Data frame from the peer to this station
    pub fn peer_data(&self, seq: u16, duration: u16, retry: bool) -> Frame {
        let mut header = Header::new(FrameType::Data, self.address(), self.peer);
        header.addr3 = self.peer;
        header.duration = duration;
        header.set_sequence_number(seq);
        header.set_retry(retry);

        Frame::new(header, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
    }

    fn at(&mut self, t: Ts, s: Stim) {
        let id = self.stim.schedule(t);
        self.pending.insert(id, s);
    }

    pub fn enqueue_at(&mut self, t: Ts, frame: Frame, ac: AccessCategory) {
        self.at(t, Stim::Enqueue(frame, ac));
    }

    /// Start receiving `frame` at `t`, the reception ends after its airtime
    pub fn rx_at(&mut self, t: Ts, frame: Frame) {
        self.at(t, Stim::Rx(frame, Self::RATE));
    }

    pub fn switching_at(&mut self, t: Ts, duration: Ts) {
        self.at(t, Stim::Switching(duration));
    }

    pub fn sleep_at(&mut self, t: Ts) {
        self.at(t, Stim::Sleep);
    }

    pub fn wakeup_at(&mut self, t: Ts) {
        self.at(t, Stim::Wakeup);
    }

    fn apply(&mut self, s: Stim) {
        match s {
            Stim::Rx(frame, tx) => {
                let d = self.phy.tx_duration(frame.size(), &tx);
                let now = self.sched.now();

                // Schedule the end first so it precedes any timeout extended to it
                self.at(now + d, Stim::RxEnd(frame, tx));
                self.mac.notify_rx_start(d);
            }
            Stim::RxEnd(frame, tx) => self.mac.notify_rx_end_ok(frame, tx).unwrap(),
            Stim::Enqueue(frame, ac) => self.mac.enqueue(frame, ac).unwrap(),
            Stim::Switching(d) => self.mac.notify_switching_start(d),
            Stim::Sleep => self.mac.notify_sleep(),
            Stim::Wakeup => self.mac.notify_wakeup(),
        }
    }

    /// Schedule peer responses to frames sent since the last check
    fn respond_to_sent(&mut self) {
        let sent = self.phy.sent();

        for s in &sent[self.seen..] {
            let h = s.frame.header;
            if !self.respond || h.addr1 != self.peer {
                continue;
            }

            let reply = match h.kind {
                FrameType::Rts => {
                    let cts = self.phy.tx_duration(CTS_SIZE, &Self::RATE);
                    Frame::cts(h.addr2, duration_id((h.duration as Ts).saturating_sub(MockPhy::SIFS + cts)))
                }
                _ if h.expects_ack() => {
                    let ack = self.phy.tx_duration(ACK_SIZE, &Self::RATE);
                    Frame::ack(h.addr2, duration_id((h.duration as Ts).saturating_sub(MockPhy::SIFS + ack)))
                }
                _ => continue,
            };

            if self.skip_responses > 0 {
                self.skip_responses -= 1;
                continue;
            }

            let end = s.at + self.phy.tx_duration(s.frame.size(), &s.tx);
            self.at(end + MockPhy::SIFS, Stim::Rx(reply, Self::RATE));
        }

        self.seen = sent.len();
    }

    /// Run events up to and including time `t`
    pub fn run_until(&mut self, t: Ts) {
        while let Some(next) = self.sched.peek() {
            if next > t {
                break;
            }

            let (owner, id) = match self.sched.next() {
                Some(v) => v,
                None => break,
            };

            match owner {
                STIM => {
                    if let Some(s) = self.pending.remove(&id) {
                        self.apply(s);
                    }
                }
                _ => self.mac.handle_timeout(id).unwrap(),
            }

            self.respond_to_sent();
        }

        if self.sched.now() < t && t != Ts::MAX {
            self.sched.set_now(t);
        }
    }

    /// Run until no events remain
    pub fn run(&mut self) {
        self.run_until(Ts::MAX)
    }
}
