//! Frame exchange manager, runs the frame exchange sequence for a queue
//! once the channel access manager has granted it the channel.
//!
//! Each exchange is optionally protected by RTS/CTS or CTS-to-self, carries
//! Duration/ID values covering the remainder of the exchange, and completes
//! on reception of an ACK or on expiry of the response timeout.
//
// Copyright 2021 Ryan Kurte

use heapless::LinearMap;
use log::{debug, trace, warn};
use rand_core::RngCore;

use crate::error::{Invariant, MacError};
use crate::frame::{
    duration_id, Frame, FrameType, Header, MacAddr, ACK_SIZE, CTS_SIZE, FCS_LEN, MAX_DURATION, RTS_SIZE,
    SEQ_MODULO,
};
use crate::manager::StationManager;
use crate::observer::{DropReason, MacObserver};
use crate::phy::{Phy, TxVector};
use crate::timer::{EventId, Scheduler, Timer};
use crate::Ts;

use super::channel::{AccessHandler, ChannelAccessManager};
use super::config::Config;
use super::queue::{FrameArena, FrameId, Mpdu};
use super::txop::TxopId;
use super::MacEvent;

/// Number of (station, TID) pairs tracked for sequence numbering and duplicate detection
pub const SEQ_STREAMS: usize = 16;

/// Tid key used for non-QoS frames in per-TID tables
const NON_QOS_TID: u8 = 0xff;

/// Protection mechanism for a frame exchange
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Protection {
    None,
    RtsCts {
        rts_tx: TxVector,
        cts_tx: TxVector,
        protection_time: Ts,
    },
    CtsToSelf {
        cts_tx: TxVector,
        protection_time: Ts,
    },
}

/// Acknowledgment expected for a frame exchange
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Acknowledgment {
    None,
    NormalAck {
        ack_tx: TxVector,
        /// SIFS plus ACK airtime
        acknowledgment_time: Ts,
    },
}

impl Acknowledgment {
    pub fn time(&self) -> Ts {
        match self {
            Acknowledgment::None => 0,
            Acknowledgment::NormalAck { acknowledgment_time, .. } => *acknowledgment_time,
        }
    }
}

/// Transmission parameters computed when an exchange starts
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TxParameters {
    pub tx_vector: TxVector,
    pub protection: Protection,
    pub acknowledgment: Acknowledgment,
    /// Airtime of the frame being sent
    pub tx_duration: Ts,
}

/// Frame exchange in progress
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingExchange {
    pub frame: FrameId,
    pub txop: TxopId,
    pub params: TxParameters,
}

/// Response awaited while the tx timer runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitReason {
    Cts,
    NormalAck,
}

/// Frame exchange manager, owns the PHY, station manager, observer and queued frames
pub struct FrameExchangeManager<P, M, O> {
    address: MacAddr,
    cts_to_self_supported: bool,
    max_msdu_lifetime: Ts,

    phy: P,
    manager: M,
    observer: O,
    frames: FrameArena,

    sequence: u16,
    qos_sequences: LinearMap<(MacAddr, u8), u16, SEQ_STREAMS>,
    rx_cache: LinearMap<(MacAddr, u8), u16, SEQ_STREAMS>,

    exchange: Option<PendingExchange>,
    tx_timer: Option<(EventId, WaitReason)>,

    nav_end: Ts,
    nav_reset: Option<EventId>,
}

impl<P: Phy, M: StationManager, O: MacObserver> FrameExchangeManager<P, M, O> {
    pub fn new(address: MacAddr, config: &Config, phy: P, manager: M, observer: O) -> Self {
        Self {
            address,
            cts_to_self_supported: config.cts_to_self_supported,
            max_msdu_lifetime: config.max_msdu_lifetime,
            phy,
            manager,
            observer,
            frames: FrameArena::new(),
            sequence: 0,
            qos_sequences: LinearMap::new(),
            rx_cache: LinearMap::new(),
            exchange: None,
            tx_timer: None,
            nav_end: 0,
            nav_reset: None,
        }
    }

    pub fn address(&self) -> MacAddr {
        self.address
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn frames(&self) -> &FrameArena {
        &self.frames
    }

    pub(crate) fn frames_mut(&mut self) -> &mut FrameArena {
        &mut self.frames
    }

    pub fn exchange(&self) -> Option<&PendingExchange> {
        self.exchange.as_ref()
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        self.tx_timer.map(|(_, r)| r)
    }

    /// End of the NAV set by frames addressed to other stations
    pub fn nav_end(&self) -> Ts {
        self.nav_end
    }

    /// Abandon any exchange in progress without reporting an outcome.
    /// Outstanding timers must already have been cancelled.
    pub fn reset(&mut self, now: Ts) {
        if let Some(ex) = self.exchange.take() {
            debug!("Abandoning exchange for {:?} at {} us", ex.txop, now);
        }

        self.tx_timer = None;
        self.nav_reset = None;
        self.nav_end = now;
    }

    /// Dispatch a timer event owned by the frame exchange manager
    pub fn handle_event<R, S>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        event: MacEvent,
    ) -> Result<(), MacError>
    where
        R: RngCore,
        S: Scheduler,
    {
        match event {
            MacEvent::StartTransmission(txop) => self.continue_transmission(cam, timer, txop),
            MacEvent::SendMpdu => self.send_mpdu(cam, timer),
            MacEvent::TransmissionSucceeded => self.transmission_succeeded(cam, timer),
            MacEvent::CtsTimeout => self.cts_timeout(cam, timer),
            MacEvent::NormalAckTimeout => self.normal_ack_timeout(cam, timer),
            MacEvent::SendCts { rts, rts_tx } => {
                self.send_cts(cam, timer, &rts, &rts_tx);
                Ok(())
            }
            MacEvent::SendNormalAck { data, data_tx } => {
                self.send_normal_ack(cam, timer, &data, &data_tx);
                Ok(())
            }
            MacEvent::NavResetTimeout => {
                self.nav_reset_timeout(cam, timer);
                Ok(())
            }
            // Channel access events belong to the channel access manager
            MacEvent::AccessTimeout | MacEvent::RequestAccess(_) => Ok(()),
        }
    }

    /// Handle the start of a reception of `duration` microseconds
    pub fn notify_rx_start<S: Scheduler>(&mut self, timer: &mut Timer<MacEvent, S>, duration: Ts) {
        // Judge the response timeout only once the incoming frame has been received
        if let Some((id, reason)) = self.tx_timer {
            let extended = timer.now() + duration;

            // Only ever push the timeout later
            match timer.deadline(&id) {
                Some(deadline) if extended > deadline => {
                    let event = match reason {
                        WaitReason::Cts => MacEvent::CtsTimeout,
                        WaitReason::NormalAck => MacEvent::NormalAckTimeout,
                    };

                    trace!("Extending {:?} timeout from {} to {} us", reason, deadline, extended);

                    timer.cancel_event(id);
                    self.tx_timer = Some((timer.schedule_event(extended, event), reason));
                }
                _ => (),
            }
        }

        if let Some(id) = self.nav_reset.take() {
            trace!("Reception started, cancelling NAV reset");
            timer.cancel_event(id);
        }
    }

    /// Handle a successfully received frame
    pub fn receive<R, S>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        frame: Frame,
        tx: TxVector,
    ) -> Result<(), MacError>
    where
        R: RngCore,
        S: Scheduler,
    {
        let header = frame.header;
        let now = timer.now();
        let for_us = header.addr1 == self.address;

        if !for_us {
            self.update_nav(cam, timer, &header, &tx);
        }

        if !for_us && !header.addr1.is_group() {
            trace!("Ignoring {:?} frame for {}", header.kind, header.addr1);
            return Ok(());
        }

        match header.kind {
            FrameType::Rts => {
                if !for_us {
                    return Ok(());
                }

                if self.nav_end > now {
                    debug!("NAV busy until {} us, not responding to RTS from {}", self.nav_end, header.addr2);
                    return Ok(());
                }

                timer.schedule_after(
                    self.phy.sifs(),
                    MacEvent::SendCts {
                        rts: header,
                        rts_tx: tx,
                    },
                );
            }
            FrameType::Cts if for_us => self.receive_cts(cam, timer)?,
            FrameType::Ack if for_us => self.receive_ack(cam, timer)?,
            FrameType::Cts | FrameType::Ack => (),
            _ => {
                if for_us && header.expects_ack() {
                    timer.schedule_after(
                        self.phy.sifs(),
                        MacEvent::SendNormalAck {
                            data: header,
                            data_tx: tx,
                        },
                    );
                }

                if self.is_duplicate(&header) {
                    debug!(
                        "Dropping duplicate {} from {}",
                        header.sequence_number(),
                        header.addr2
                    );
                    return Ok(());
                }

                self.observer.frame_received(&frame);
            }
        }

        Ok(())
    }

    fn mpdu(&self, id: FrameId) -> Result<&Mpdu, MacError> {
        Ok(self.frames.get(id).ok_or(Invariant::UnknownFrame)?)
    }

    fn release<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) {
        let slots = cam.release(txop, timer);
        self.observer.backoff_generated(cam.txop(txop).ac(), slots);
    }

    fn end_exchange<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) {
        self.observer.channel_released(cam.txop(txop).ac());
        self.release(cam, timer, txop);
    }

    /// Remove the head frame of a queue, which must be `id`
    fn dequeue<R: RngCore>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        txop: TxopId,
        id: FrameId,
    ) -> Result<Mpdu, MacError> {
        let queue = cam.txop_mut(txop);
        if queue.peek() != Some(id) {
            return Err(Invariant::QueueHead(txop).into());
        }
        queue.pop();

        Ok(self.frames.remove(id).ok_or(Invariant::UnknownFrame)?)
    }

    /// Discard head-of-line frames that have outlived the MSDU lifetime
    fn drop_expired<R: RngCore>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        txop: TxopId,
        now: Ts,
    ) -> Result<(), MacError> {
        while let Some(id) = cam.txop(txop).peek() {
            let age = now.saturating_sub(self.mpdu(id)?.timestamp);
            if age <= self.max_msdu_lifetime {
                break;
            }

            let mpdu = self.dequeue(cam, txop, id)?;
            debug!(
                "Dropping frame for {} after {} us in {}",
                mpdu.frame.header.addr1,
                age,
                cam.txop(txop).ac()
            );
            self.observer.frame_dropped(&mpdu.into_msdu(), DropReason::Expired);
        }

        Ok(())
    }

    fn next_sequence(&mut self, header: &Header) -> u16 {
        let counter = match (header.kind, header.tid()) {
            (FrameType::QosData, Some(tid)) if !header.addr1.is_group() => {
                let key = (header.addr1, tid);

                if !self.qos_sequences.contains_key(&key) && self.qos_sequences.insert(key, 0).is_err() {
                    warn!("Sequence table full, resetting");
                    self.qos_sequences.clear();
                    let _ = self.qos_sequences.insert(key, 0);
                }

                match self.qos_sequences.get_mut(&key) {
                    Some(c) => c,
                    None => &mut self.sequence,
                }
            }
            _ => &mut self.sequence,
        };

        let seq = *counter;
        *counter = (seq + 1) % SEQ_MODULO;
        seq
    }

    /// Assign a sequence number and split the head MSDU into fragments as required
    fn prepare_mpdu(&mut self, id: FrameId) -> Result<(), MacError> {
        let (header, assigned, fragmented) = {
            let m = self.mpdu(id)?;
            (m.frame.header, m.seq_assigned, m.msdu.is_some())
        };

        if !assigned && !header.is_retry() && !header.is_fragment() {
            let seq = self.next_sequence(&header);

            let m = self.frames.get_mut(id).ok_or(Invariant::UnknownFrame)?;
            m.frame.header.set_sequence_number(seq);
            m.seq_assigned = true;

            trace!("Assigned sequence number {} for {}", seq, header.addr1);
        }

        if fragmented || header.is_fragment() || !header.expects_ack() {
            return Ok(());
        }

        let m = self.frames.get_mut(id).ok_or(Invariant::UnknownFrame)?;
        let msdu = m.frame.payload.clone();

        if !self.manager.need_fragmentation(&header, msdu.len()) {
            return Ok(());
        }

        let len = self.manager.fragment_size(&header, msdu.len(), 0);
        if len == 0 || len >= msdu.len() {
            return Ok(());
        }

        debug!("Fragmenting {} byte MSDU for {}", msdu.len(), header.addr1);

        m.frame.payload = msdu.slice(..len);
        m.frame.header.set_fragment_number(0);
        m.frame.header.set_more_fragments(true);
        m.msdu = Some(msdu);

        Ok(())
    }

    /// Replace the head fragment with the next fragment of the same MSDU
    fn next_fragment(&mut self, id: FrameId) -> Result<(), MacError> {
        let manager = &self.manager;
        let mpdu = self.frames.get_mut(id).ok_or(Invariant::UnknownFrame)?;
        let msdu = mpdu.msdu.clone().ok_or(Invariant::UnknownFrame)?;

        let header = mpdu.frame.header;
        let index = header.fragment_number() + 1;

        let offset: usize = (0..index).map(|i| manager.fragment_size(&header, msdu.len(), i)).sum();
        let len = manager.fragment_size(&header, msdu.len(), index);
        let more = manager.fragment_size(&header, msdu.len(), index + 1) > 0;

        trace!("Fragment {} of {} bytes at offset {}", index, len, offset);

        mpdu.frame.payload = msdu.slice(offset..offset + len);

        let h = &mut mpdu.frame.header;
        h.set_fragment_number(index);
        h.set_more_fragments(more);
        h.set_retry(false);

        Ok(())
    }

    /// Compute protection, acknowledgment and airtime for a frame
    pub fn tx_parameters(&self, frame: &Frame) -> TxParameters {
        let h = &frame.header;
        let sifs = self.phy.sifs();
        let size = frame.size();

        let tx_vector = self.manager.data_tx_vector(h);
        let tx_duration = self.phy.tx_duration(size, &tx_vector);

        let acknowledgment = match h.expects_ack() {
            true => {
                let ack_tx = self.manager.ack_tx_vector(h.addr1, &tx_vector);
                Acknowledgment::NormalAck {
                    ack_tx,
                    acknowledgment_time: sifs + self.phy.tx_duration(ACK_SIZE, &ack_tx),
                }
            }
            false => Acknowledgment::None,
        };

        // Follow-up fragments are covered by the NAV of the preceding fragment
        let protection = if h.addr1.is_group() || (h.fragment_number() > 0 && !h.is_retry()) {
            Protection::None
        } else if self.manager.need_rts(h, size) {
            let rts_tx = self.manager.rts_tx_vector(h.addr1);
            let cts_tx = self.manager.cts_tx_vector(h.addr1, &rts_tx);

            Protection::RtsCts {
                rts_tx,
                cts_tx,
                protection_time: self.phy.tx_duration(RTS_SIZE, &rts_tx)
                    + self.phy.tx_duration(CTS_SIZE, &cts_tx)
                    + 2 * sifs,
            }
        } else if self.manager.use_non_erp_protection() && self.cts_to_self_supported {
            let cts_tx = self.manager.cts_to_self_tx_vector();

            Protection::CtsToSelf {
                cts_tx,
                protection_time: self.phy.tx_duration(CTS_SIZE, &cts_tx) + sifs,
            }
        } else {
            Protection::None
        };

        TxParameters {
            tx_vector,
            protection,
            acknowledgment,
            tx_duration,
        }
    }

    /// Hand a frame to the PHY and report the transmission to the channel access manager
    fn forward_down<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &Timer<MacEvent, S>,
        frame: &Frame,
        tx: &TxVector,
    ) -> Ts {
        let now = timer.now();
        let airtime = self.phy.tx_duration(frame.size(), tx);

        debug!(
            "Sending {:?} to {} at {} us ({} us, duration {} us)",
            frame.header.kind, frame.header.addr1, now, airtime, frame.header.duration
        );

        self.phy.send(frame, tx);
        cam.notify_tx_start_now(now, airtime);

        airtime
    }

    /// Start an exchange for the head frame of a granted queue
    fn transmit<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<(), MacError> {
        let id = cam.txop(txop).peek().ok_or(Invariant::QueueHead(txop))?;
        let params = self.tx_parameters(&self.mpdu(id)?.frame);

        self.exchange = Some(PendingExchange {
            frame: id,
            txop,
            params,
        });

        match params.protection {
            Protection::RtsCts { rts_tx, cts_tx, .. } => self.send_rts(cam, timer, &rts_tx, &cts_tx),
            Protection::CtsToSelf { cts_tx, .. } => self.send_cts_to_self(cam, timer, &cts_tx),
            Protection::None => self.send_mpdu(cam, timer),
        }
    }

    /// Send the next fragment of a burst, the queue keeps its grant
    fn continue_transmission<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<(), MacError> {
        if self.exchange.is_some() {
            return Err(Invariant::ExchangeInProgress.into());
        }

        if !cam.txop(txop).is_granted() {
            trace!("{} no longer holds the channel", cam.txop(txop).ac());
            return Ok(());
        }

        self.transmit(cam, timer, txop)
    }

    fn send_rts<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        rts_tx: &TxVector,
        cts_tx: &TxVector,
    ) -> Result<(), MacError> {
        let ex = self.exchange.ok_or(Invariant::NoExchange)?;
        let now = timer.now();
        let sifs = self.phy.sifs();

        let to = self.mpdu(ex.frame)?.frame.header.addr1;
        let cts_time = self.phy.tx_duration(CTS_SIZE, cts_tx);
        let duration = sifs + cts_time + sifs + ex.params.tx_duration + ex.params.acknowledgment.time();

        let rts = Frame::rts(to, self.address, duration_id(duration));
        let rts_time = self.forward_down(cam, timer, &rts, rts_tx);

        let timeout = rts_time + sifs + self.phy.slot() + self.phy.preamble_and_header_duration(cts_tx);
        self.tx_timer = Some((timer.schedule_after(timeout, MacEvent::CtsTimeout), WaitReason::Cts));
        cam.notify_cts_timeout_start_now(now, timeout);

        Ok(())
    }

    fn send_cts_to_self<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        cts_tx: &TxVector,
    ) -> Result<(), MacError> {
        let ex = self.exchange.ok_or(Invariant::NoExchange)?;
        let sifs = self.phy.sifs();

        let duration = sifs + ex.params.tx_duration + ex.params.acknowledgment.time();
        let cts = Frame::cts(self.address, duration_id(duration));
        let cts_time = self.forward_down(cam, timer, &cts, cts_tx);

        timer.schedule_after(cts_time + sifs, MacEvent::SendMpdu);

        Ok(())
    }

    fn send_mpdu<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        let ex = self.exchange.ok_or(Invariant::NoExchange)?;
        let now = timer.now();
        let sifs = self.phy.sifs();
        let ack_time = ex.params.acknowledgment.time();

        let mut duration = ack_time;
        {
            let mpdu = self.mpdu(ex.frame)?;
            let h = &mpdu.frame.header;

            if h.more_fragments() {
                let next = self.manager.fragment_size(h, mpdu.msdu_len(), h.fragment_number() + 1);
                let next_time = self.phy.tx_duration(h.len() + next + FCS_LEN, &ex.params.tx_vector);

                // SIFS then the next fragment and its acknowledgment
                duration += sifs + next_time + ack_time;
            }
        }

        let mpdu = self.frames.get_mut(ex.frame).ok_or(Invariant::UnknownFrame)?;
        mpdu.frame.header.duration = duration_id(duration);
        let frame = mpdu.frame.clone();

        let tx_time = self.forward_down(cam, timer, &frame, &ex.params.tx_vector);

        match ex.params.acknowledgment {
            Acknowledgment::None => {
                self.dequeue(cam, ex.txop, ex.frame)?;
                timer.schedule_after(tx_time, MacEvent::TransmissionSucceeded);
            }
            Acknowledgment::NormalAck { ack_tx, .. } => {
                let timeout = tx_time + sifs + self.phy.slot() + self.phy.preamble_and_header_duration(&ack_tx);
                self.tx_timer = Some((
                    timer.schedule_after(timeout, MacEvent::NormalAckTimeout),
                    WaitReason::NormalAck,
                ));
                cam.notify_ack_timeout_start_now(now, timeout);
            }
        }

        Ok(())
    }

    fn transmission_succeeded<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        let ex = self.exchange.take().ok_or(Invariant::NoExchange)?;

        cam.txop_mut(ex.txop).reset_cw();
        self.end_exchange(cam, timer, ex.txop);

        Ok(())
    }

    fn receive_cts<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        let id = match self.tx_timer {
            Some((id, WaitReason::Cts)) => id,
            _ => {
                trace!("Ignoring unexpected CTS");
                return Ok(());
            }
        };

        timer.cancel_event(id);
        self.tx_timer = None;

        let ex = self.exchange.ok_or(Invariant::NoExchange)?;
        let header = self.mpdu(ex.frame)?.frame.header;

        debug!("CTS received from {}", header.addr1);
        self.manager.report_rts_ok(&header);

        cam.notify_cts_timeout_reset_now(timer);
        timer.schedule_after(self.phy.sifs(), MacEvent::SendMpdu);

        Ok(())
    }

    fn receive_ack<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        let id = match self.tx_timer {
            Some((id, WaitReason::NormalAck)) => id,
            _ => {
                trace!("Ignoring unexpected ACK");
                return Ok(());
            }
        };

        timer.cancel_event(id);
        self.tx_timer = None;

        let ex = self.exchange.take().ok_or(Invariant::NoExchange)?;
        let (header, size) = {
            let f = &self.mpdu(ex.frame)?.frame;
            (f.header, f.size())
        };

        if !header.more_fragments() {
            self.manager.report_data_ok(&header, size);
        }

        cam.notify_ack_timeout_reset_now(timer);
        cam.txop_mut(ex.txop).reset_cw();

        if header.more_fragments() {
            debug!(
                "Fragment {} of {} acknowledged by {}",
                header.fragment_number(),
                header.sequence_number(),
                header.addr1
            );

            self.next_fragment(ex.frame)?;
            timer.schedule_after(self.phy.sifs(), MacEvent::StartTransmission(ex.txop));

            return Ok(());
        }

        let mpdu = self.dequeue(cam, ex.txop, ex.frame)?;
        debug!("Frame {} acknowledged by {}", header.sequence_number(), header.addr1);

        self.observer.frame_acked(&mpdu.into_msdu());
        self.end_exchange(cam, timer, ex.txop);

        Ok(())
    }

    fn cts_timeout<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        self.tx_timer = None;

        let ex = self.exchange.take().ok_or(Invariant::NoExchange)?;
        let header = self.mpdu(ex.frame)?.frame.header;

        debug!("CTS timeout for RTS to {} at {} us", header.addr1, timer.now());
        self.manager.report_rts_failed(&header);

        // RTS failures count against the short retry limit
        if !self.manager.need_retransmission(&header, RTS_SIZE) {
            self.manager.report_final_rts_failed(&header);

            let mpdu = self.dequeue(cam, ex.txop, ex.frame)?;
            self.observer
                .frame_dropped(&mpdu.into_msdu(), DropReason::RetryLimitExceeded);

            cam.txop_mut(ex.txop).reset_cw();
        } else {
            cam.txop_mut(ex.txop).update_failed_cw();
        }

        self.end_exchange(cam, timer, ex.txop);

        Ok(())
    }

    fn normal_ack_timeout<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) -> Result<(), MacError> {
        self.tx_timer = None;

        let ex = self.exchange.take().ok_or(Invariant::NoExchange)?;
        let (header, size) = {
            let f = &self.mpdu(ex.frame)?.frame;
            (f.header, f.size())
        };

        debug!(
            "ACK timeout for {} to {} at {} us",
            header.sequence_number(),
            header.addr1,
            timer.now()
        );
        self.manager.report_data_failed(&header, size);

        if !self.manager.need_retransmission(&header, size) {
            self.manager.report_final_data_failed(&header, size);

            let mpdu = self.dequeue(cam, ex.txop, ex.frame)?;
            self.observer
                .frame_dropped(&mpdu.into_msdu(), DropReason::RetryLimitExceeded);

            cam.txop_mut(ex.txop).reset_cw();
        } else {
            let mpdu = self.frames.get_mut(ex.frame).ok_or(Invariant::UnknownFrame)?;
            mpdu.frame.header.set_retry(true);

            cam.txop_mut(ex.txop).update_failed_cw();
        }

        self.end_exchange(cam, timer, ex.txop);

        Ok(())
    }

    fn send_cts<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        rts: &Header,
        rts_tx: &TxVector,
    ) {
        let cts_tx = self.manager.cts_tx_vector(rts.addr2, rts_tx);
        let cts_time = self.phy.tx_duration(CTS_SIZE, &cts_tx);
        let duration = (rts.duration as Ts).saturating_sub(self.phy.sifs() + cts_time);

        let cts = Frame::cts(rts.addr2, duration_id(duration));
        self.forward_down(cam, timer, &cts, &cts_tx);
    }

    fn send_normal_ack<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        data: &Header,
        data_tx: &TxVector,
    ) {
        let ack_tx = self.manager.ack_tx_vector(data.addr2, data_tx);
        let ack_time = self.phy.tx_duration(ACK_SIZE, &ack_tx);
        let duration = (data.duration as Ts).saturating_sub(self.phy.sifs() + ack_time);

        let ack = Frame::ack(data.addr2, duration_id(duration));
        self.forward_down(cam, timer, &ack, &ack_tx);
    }

    /// Update the NAV from a frame addressed to another station
    fn update_nav<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        header: &Header,
        tx: &TxVector,
    ) {
        // Values with the top bit set carry an AID rather than a duration
        if header.duration > MAX_DURATION {
            return;
        }

        let now = timer.now();
        let duration = header.duration as Ts;

        if now + duration > self.nav_end {
            trace!("NAV set to {} us by {:?} from {}", now + duration, header.kind, header.addr2);
            self.nav_end = now + duration;

            // Release the NAV early if the RTS is not followed by an exchange
            if header.kind == FrameType::Rts {
                let cts_tx = self.manager.cts_tx_vector(header.addr2, tx);
                let reset = 2 * self.phy.sifs()
                    + self.phy.tx_duration(CTS_SIZE, &cts_tx)
                    + self.phy.preamble_and_header_duration(&cts_tx)
                    + 2 * self.phy.slot();

                if let Some(id) = self.nav_reset.take() {
                    timer.cancel_event(id);
                }
                self.nav_reset = Some(timer.schedule_after(reset, MacEvent::NavResetTimeout));
            }
        }

        cam.notify_nav_start_now(now, duration);
    }

    fn nav_reset_timeout<R: RngCore, S: Scheduler>(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
    ) {
        self.nav_reset = None;
        self.nav_end = timer.now();

        debug!("NAV reset at {} us", self.nav_end);
        cam.notify_nav_reset_now(timer, 0);
    }

    /// Check a received frame against the last sequence control seen from its sender
    fn is_duplicate(&mut self, header: &Header) -> bool {
        if header.addr1.is_group() {
            return false;
        }

        let key = (header.addr2, header.tid().unwrap_or(NON_QOS_TID));
        let duplicate = header.is_retry() && self.rx_cache.get(&key) == Some(&header.seq_ctrl);

        if self.rx_cache.insert(key, header.seq_ctrl).is_err() {
            self.rx_cache.clear();
            let _ = self.rx_cache.insert(key, header.seq_ctrl);
        }

        duplicate
    }
}

impl<P, M, O, R, S> AccessHandler<R, S> for FrameExchangeManager<P, M, O>
where
    P: Phy,
    M: StationManager,
    O: MacObserver,
    R: RngCore,
    S: Scheduler,
{
    fn start_transmission(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<bool, MacError> {
        if self.exchange.is_some() {
            return Err(Invariant::ExchangeInProgress.into());
        }

        self.drop_expired(cam, txop, timer.now())?;

        let id = match cam.txop(txop).peek() {
            Some(id) => id,
            None => {
                debug!("{} granted with nothing to send", cam.txop(txop).ac());
                self.release(cam, timer, txop);
                return Ok(false);
            }
        };

        cam.notify_channel_accessed(txop)?;
        self.observer.channel_accessed(cam.txop(txop).ac());

        self.prepare_mpdu(id)?;
        self.transmit(cam, timer, txop)?;

        Ok(true)
    }

    fn notify_internal_collision(
        &mut self,
        cam: &mut ChannelAccessManager<R>,
        timer: &mut Timer<MacEvent, S>,
        txop: TxopId,
    ) -> Result<(), MacError> {
        self.observer.internal_collision(cam.txop(txop).ac());
        self.release(cam, timer, txop);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;

    use bytes::Bytes;

    use super::*;
    use crate::mac::{AccessCategory, Config};
    use crate::manager::ManagerConfig;
    use crate::mock::{Bench, Observed};

    const LEGACY: AccessCategory = AccessCategory::Legacy;

    fn bench(manager: ManagerConfig, backoffs: &[u32]) -> Bench {
        Bench::new(Config::default(), manager, backoffs)
    }

    fn third() -> MacAddr {
        MacAddr::local(3)
    }

    #[test]
    fn basic_data_ack() {
        let mut b = bench(Bench::manager_config(), &[]);

        // 72 byte payload, 100 byte MPDU, 120 us on air
        let f = b.data(72);
        b.enqueue_at(0, f.clone(), LEGACY);
        b.run();

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].at, 34);
        assert_eq!(sent[0].frame.header.duration, 50);
        assert_eq!(sent[0].frame.header.sequence_number(), 0);

        let acked = b.observer.acked();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].payload, f.payload);

        assert_eq!(b.mac.queue_len(LEGACY), Ok(0));
        assert!(b.mac.exchange().exchange().is_none());
        assert_eq!(b.mac.exchange().frames().len(), 0);
    }

    #[test]
    fn ack_timeout_retries_with_retry_bit() {
        let mut b = bench(Bench::manager_config(), &[3]);
        b.skip_responses = 1;

        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);

        // Timeout at 199 doubles the contention window
        b.run_until(200);
        assert_eq!(b.mac.cw(LEGACY), Ok(31));
        assert_eq!(b.mac.manager().counters(&b.peer).ssrc, 1);

        b.run();

        let sent = b.phy.sent_kind(FrameType::Data);
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].frame.header.is_retry());

        // AIFS after the timeout (233) plus three slots
        assert_eq!(sent[1].at, 260);
        assert!(sent[1].frame.header.is_retry());
        assert_eq!(
            sent[1].frame.header.sequence_number(),
            sent[0].frame.header.sequence_number()
        );

        assert_eq!(b.observer.acked().len(), 1);
        assert_eq!(b.mac.cw(LEGACY), Ok(15));
        assert_eq!(b.mac.manager().counters(&b.peer).ssrc, 0);
    }

    #[test]
    fn retry_limit_drops_frame() {
        let mut b = bench(
            ManagerConfig {
                max_ssrc: 2,
                ..Bench::manager_config()
            },
            &[],
        );
        b.respond = false;

        let f = b.data(72);
        b.enqueue_at(0, f.clone(), LEGACY);
        b.run();

        let at: Vec<_> = b.phy.sent().iter().map(|s| s.at).collect();
        assert_eq!(at, &[34, 233]);

        let dropped = b.observer.dropped();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].1, DropReason::RetryLimitExceeded);
        assert_eq!(dropped[0].0.payload, f.payload);

        assert!(b.observer.acked().is_empty());
        assert_eq!(b.mac.cw(LEGACY), Ok(15));
        assert_eq!(b.mac.queue_len(LEGACY), Ok(0));
    }

    #[test]
    fn rts_cts_protects_long_frames() {
        let mut b = bench(
            ManagerConfig {
                rts_cts_threshold: 50,
                ..Bench::manager_config()
            },
            &[],
        );

        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);
        b.run();

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 2);

        let rts = &sent[0];
        assert_eq!(rts.frame.header.kind, FrameType::Rts);
        assert_eq!(rts.at, 34);
        assert_eq!(rts.frame.header.addr1, b.peer);
        assert_eq!(rts.frame.header.addr2, b.address());
        // SIFS + CTS + SIFS + data + SIFS + ACK
        assert_eq!(rts.frame.header.duration, 236);

        // CTS received from 90 to 124
        let data = &sent[1];
        assert_eq!(data.frame.header.kind, FrameType::Data);
        assert_eq!(data.at, 140);
        assert_eq!(data.frame.header.duration, 50);

        assert_eq!(b.observer.acked().len(), 1);
    }

    #[test]
    fn cts_timeout_counts_short_retries() {
        let mut b = bench(
            ManagerConfig {
                rts_cts_threshold: 50,
                max_ssrc: 2,
                ..Bench::manager_config()
            },
            &[],
        );
        b.respond = false;

        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);

        b.run_until(120);
        assert_eq!(b.mac.cw(LEGACY), Ok(31));
        assert_eq!(b.mac.exchange().wait_reason(), None);

        b.run();

        let sent = b.phy.sent();
        assert!(sent.iter().all(|s| s.frame.header.kind == FrameType::Rts));
        let at: Vec<_> = sent.iter().map(|s| s.at).collect();
        assert_eq!(at, &[34, 153]);

        let dropped = b.observer.dropped();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].1, DropReason::RetryLimitExceeded);
        assert_eq!(b.mac.cw(LEGACY), Ok(15));
    }

    #[test]
    fn cts_to_self_for_non_erp_protection() {
        let config = Config {
            cts_to_self_supported: true,
            ..Default::default()
        };
        let manager = ManagerConfig {
            non_erp_protection: true,
            ..Bench::manager_config()
        };
        let mut b = Bench::new(config, manager, &[]);

        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);
        b.run();

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 2);

        let cts = &sent[0];
        assert_eq!(cts.frame.header.kind, FrameType::Cts);
        assert_eq!(cts.frame.header.addr1, b.address());
        assert_eq!(cts.at, 34);
        assert_eq!(cts.frame.header.duration, 186);

        assert_eq!(sent[1].frame.header.kind, FrameType::Data);
        assert_eq!(sent[1].at, 84);
        assert_eq!(b.observer.acked().len(), 1);
    }

    #[test]
    fn fragments_long_msdu() {
        let mut b = bench(
            ManagerConfig {
                fragmentation_threshold: 128,
                ..Bench::manager_config()
            },
            &[],
        );

        let f = b.data(250);
        b.enqueue_at(0, f.clone(), LEGACY);
        b.run();

        let sent = b.phy.sent_kind(FrameType::Data);
        assert_eq!(sent.len(), 3);

        let lens: Vec<_> = sent.iter().map(|s| s.frame.payload.len()).collect();
        assert_eq!(lens, &[100, 100, 50]);

        let at: Vec<_> = sent.iter().map(|s| s.at).collect();
        assert_eq!(at, &[34, 248, 462]);

        let durations: Vec<_> = sent.iter().map(|s| s.frame.header.duration).collect();
        assert_eq!(durations, &[264, 214, 50]);

        for (i, s) in sent.iter().enumerate() {
            assert_eq!(s.frame.header.fragment_number(), i as u8);
            assert_eq!(s.frame.header.more_fragments(), i < 2);
            assert_eq!(s.frame.header.sequence_number(), 0);
        }

        // Reassembled on completion
        let acked = b.observer.acked();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].payload, f.payload);
        assert!(!acked[0].header.is_fragment());

        // The burst holds the channel until the last fragment is acknowledged
        let accessed = b
            .observer
            .events()
            .iter()
            .filter(|e| matches!(e, Observed::ChannelAccessed(_)))
            .count();
        assert_eq!(accessed, 1);
    }

    #[test]
    fn group_frames_are_not_acknowledged() {
        let mut b = bench(Bench::manager_config(), &[]);

        let mut f = b.data(72);
        f.header.addr1 = MacAddr::BROADCAST;
        b.enqueue_at(0, f, LEGACY);
        b.run();

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame.header.duration, 0);

        assert!(b.observer.acked().is_empty());
        assert!(b.observer.dropped().is_empty());
        assert!(b
            .observer
            .events()
            .contains(&Observed::ChannelReleased(LEGACY)));
        assert_eq!(b.mac.queue_len(LEGACY), Ok(0));
    }

    #[test]
    fn overheard_rts_sets_and_resets_nav() {
        let mut b = bench(Bench::manager_config(), &[]);

        // RTS from a third station to the peer, 40 us on air
        let rts = Frame::rts(b.peer, third(), 300);
        b.rx_at(100, rts);

        b.run_until(200);
        assert_eq!(b.mac.nav_end(), 440);
        assert_eq!(b.mac.medium().nav_end(), 440);

        // No exchange followed, NAV released after 2 SIFS + CTS + preamble + 2 slots
        b.run_until(300);
        assert_eq!(b.mac.nav_end(), 244);
        assert_eq!(b.mac.medium().nav_end(), 244);
    }

    #[test]
    fn nav_defers_transmission() {
        let mut b = bench(Bench::manager_config(), &[]);

        let rts = Frame::rts(b.peer, third(), 300);
        b.rx_at(100, rts);

        // CTS from the peer keeps the NAV in place
        let cts = Frame::cts(third(), 250);
        b.rx_at(156, cts);

        let f = b.data(72);
        b.enqueue_at(150, f, LEGACY);
        b.run();

        assert_eq!(b.mac.nav_end(), 440);

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].at, 474);
        assert_eq!(b.observer.acked().len(), 1);
    }

    #[test]
    fn responds_to_rts_and_data() {
        let mut b = bench(Bench::manager_config(), &[]);

        let rts = Frame::rts(b.address(), b.peer, 236);
        b.rx_at(100, rts);

        // 4 byte payload, 52 us on air
        let data = b.peer_data(1, 50, false);
        b.rx_at(206, data.clone());
        b.run();

        let sent = b.phy.sent();
        assert_eq!(sent.len(), 2);

        let cts = &sent[0];
        assert_eq!(cts.frame.header.kind, FrameType::Cts);
        assert_eq!(cts.frame.header.addr1, b.peer);
        assert_eq!(cts.at, 156);
        assert_eq!(cts.frame.header.duration, 186);

        let ack = &sent[1];
        assert_eq!(ack.frame.header.kind, FrameType::Ack);
        assert_eq!(ack.frame.header.addr1, b.peer);
        assert_eq!(ack.at, 274);
        assert_eq!(ack.frame.header.duration, 0);

        assert_eq!(b.observer.received(), &[data]);
        assert_eq!(b.mac.nav_end(), 0);
    }

    #[test]
    fn no_cts_while_nav_busy() {
        let mut b = bench(Bench::manager_config(), &[]);

        let mut header = Header::new(FrameType::Data, b.peer, third());
        header.duration = 1000;
        b.rx_at(0, Frame::new(header, Bytes::from_static(&[0u8; 4])));

        let rts = Frame::rts(b.address(), b.peer, 236);
        b.rx_at(200, rts);
        b.run();

        assert_eq!(b.mac.nav_end(), 1052);
        assert!(b.phy.sent().is_empty());
    }

    #[test]
    fn duplicates_are_acked_not_delivered() {
        let mut b = bench(Bench::manager_config(), &[]);

        b.rx_at(0, b.peer_data(5, 0, false));
        b.rx_at(200, b.peer_data(5, 0, true));
        b.rx_at(400, b.peer_data(6, 0, true));
        b.run();

        let received: Vec<_> = b
            .observer
            .received()
            .iter()
            .map(|f| f.header.sequence_number())
            .collect();
        assert_eq!(received, &[5, 6]);

        assert_eq!(b.phy.sent_kind(FrameType::Ack).len(), 3);
    }

    #[test]
    fn expired_frames_are_dropped() {
        let config = Config {
            max_msdu_lifetime: 100,
            ..Default::default()
        };
        let mut b = Bench::new(config, Bench::manager_config(), &[]);

        // Medium busy until 120, access no earlier than 154
        let header = Header::new(FrameType::Data, third(), b.peer);
        b.rx_at(0, Frame::new(header, Bytes::from_static(&[0u8; 72])));

        let f = b.data(72);
        b.enqueue_at(10, f.clone(), LEGACY);
        b.run();

        assert!(b.phy.sent().is_empty());

        let dropped = b.observer.dropped();
        assert_eq!(dropped, &[(f, DropReason::Expired)]);
        assert_eq!(b.mac.queue_len(LEGACY), Ok(0));
    }

    #[test]
    fn sequence_numbers_increment() {
        let mut b = bench(Bench::manager_config(), &[]);

        for _ in 0..3 {
            let f = b.data(16);
            b.enqueue_at(0, f, LEGACY);
        }
        b.run();

        let seqs: Vec<_> = b
            .phy
            .sent_kind(FrameType::Data)
            .iter()
            .map(|s| s.frame.header.sequence_number())
            .collect();
        assert_eq!(seqs, &[0, 1, 2]);
        assert_eq!(b.observer.acked().len(), 3);
    }

    #[test]
    fn reception_does_not_shorten_ack_timeout() {
        let mut b = bench(Bench::manager_config(), &[]);

        // Data on air 34..154, ACK timeout at 154 + 16 + 9 + 20
        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);
        b.run_until(156);

        let (id, reason) = b.mac.exchange().tx_timer.unwrap();
        assert_eq!(reason, WaitReason::NormalAck);
        assert_eq!(b.mac.timer().deadline(&id), Some(199));

        // A short unrelated reception ends before the timeout would fire
        b.mac.notify_rx_start(5);
        let (id, _) = b.mac.exchange().tx_timer.unwrap();
        assert_eq!(b.mac.timer().deadline(&id), Some(199));

        b.run();

        assert_eq!(b.phy.sent_kind(FrameType::Data).len(), 1);
        assert_eq!(b.observer.acked().len(), 1);
        assert_eq!(b.mac.cw(LEGACY), Ok(15));
    }

    #[test]
    fn reception_extends_response_timeout() {
        let mut b = bench(Bench::manager_config(), &[]);

        let f = b.data(72);
        b.enqueue_at(0, f, LEGACY);
        b.run_until(156);

        // Reception outlasting the timeout holds it until the frame ends
        b.mac.notify_rx_start(100);
        let (id, reason) = b.mac.exchange().tx_timer.unwrap();
        assert_eq!(reason, WaitReason::NormalAck);
        assert_eq!(b.mac.timer().deadline(&id), Some(256));
    }
}
