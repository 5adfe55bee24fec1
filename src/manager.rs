//! Remote station management
//
// Copyright 2021 Ryan Kurte

use heapless::LinearMap;
use log::{debug, warn};

use crate::frame::{Header, MacAddr, FCS_LEN};
use crate::phy::TxVector;

/// Remote station manager, supplies transmission parameters and retry policy
/// for frame exchanges and receives the outcome of each attempt.
pub trait StationManager {
    /// Tx vector for a data or management frame
    fn data_tx_vector(&self, header: &Header) -> TxVector;

    fn rts_tx_vector(&self, to: MacAddr) -> TxVector;

    /// Tx vector for a CTS answering an RTS sent with `rts_tx`
    fn cts_tx_vector(&self, to: MacAddr, rts_tx: &TxVector) -> TxVector;

    /// Tx vector for an ACK answering data sent with `data_tx`
    fn ack_tx_vector(&self, to: MacAddr, data_tx: &TxVector) -> TxVector;

    fn cts_to_self_tx_vector(&self) -> TxVector;

    /// Whether a frame of `size` bytes should be protected by RTS/CTS
    fn need_rts(&self, header: &Header, size: usize) -> bool;

    /// Whether non-ERP stations are present and require protection
    fn use_non_erp_protection(&self) -> bool;

    /// Whether an MSDU with `msdu_len` payload bytes must be fragmented
    fn need_fragmentation(&self, header: &Header, msdu_len: usize) -> bool;

    /// Payload size of fragment `index` of an MSDU, zero past the last fragment
    fn fragment_size(&self, header: &Header, msdu_len: usize, index: u8) -> usize;

    /// Whether a failed frame of `size` bytes may be retransmitted
    fn need_retransmission(&self, header: &Header, size: usize) -> bool;

    fn report_rts_ok(&mut self, header: &Header);

    fn report_rts_failed(&mut self, header: &Header);

    fn report_final_rts_failed(&mut self, header: &Header);

    fn report_data_ok(&mut self, header: &Header, size: usize);

    fn report_data_failed(&mut self, header: &Header, size: usize);

    fn report_final_data_failed(&mut self, header: &Header, size: usize);
}

/// Configuration for the constant rate station manager
#[derive(Clone, PartialEq, Debug)]
pub struct ManagerConfig {
    /// Rate for unicast data and management frames in kbit/s
    pub data_rate_kbps: u32,

    /// Rate for control responses and group addressed frames in kbit/s
    pub control_rate_kbps: u32,

    /// Frames larger than this (in bytes) are protected by RTS/CTS
    pub rts_cts_threshold: usize,

    /// MPDUs larger than this (in bytes) are fragmented
    pub fragmentation_threshold: usize,

    /// Short retry limit, applies to RTS and short frames
    pub max_ssrc: u32,

    /// Long retry limit, applies to frames above the RTS threshold
    pub max_slrc: u32,

    /// Protect transmissions for the benefit of non-ERP stations
    pub non_erp_protection: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_rate_kbps: 54_000,
            control_rate_kbps: 6_000,
            rts_cts_threshold: 65535,
            fragmentation_threshold: 2346,
            max_ssrc: 7,
            max_slrc: 4,
            non_erp_protection: false,
        }
    }
}

/// Per station retry counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RetryCounters {
    /// Station short retry count
    pub ssrc: u32,
    /// Station long retry count
    pub slrc: u32,
}

const MAX_STATIONS: usize = 16;

/// Station manager using fixed rates with per station retry counting
#[derive(Clone, Debug)]
pub struct ConstantRateManager {
    config: ManagerConfig,
    stations: LinearMap<MacAddr, RetryCounters, MAX_STATIONS>,
}

impl ConstantRateManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            stations: LinearMap::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Retry counters for a remote station
    pub fn counters(&self, addr: &MacAddr) -> RetryCounters {
        self.stations.get(addr).copied().unwrap_or_default()
    }

    fn is_long(&self, size: usize) -> bool {
        size > self.config.rts_cts_threshold
    }

    fn update<F: FnOnce(&mut RetryCounters)>(&mut self, addr: MacAddr, f: F) {
        if !self.stations.contains_key(&addr) && self.stations.insert(addr, RetryCounters::default()).is_err() {
            warn!("Station table full, resetting retry counters");
            self.stations.clear();
            let _ = self.stations.insert(addr, RetryCounters::default());
        }

        if let Some(c) = self.stations.get_mut(&addr) {
            f(c);
        }
    }

    fn fragment_stride(&self, header: &Header) -> usize {
        self.config
            .fragmentation_threshold
            .saturating_sub(header.len() + FCS_LEN)
            .max(1)
    }
}

impl Default for ConstantRateManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl StationManager for ConstantRateManager {
    fn data_tx_vector(&self, header: &Header) -> TxVector {
        match header.addr1.is_group() {
            true => TxVector::new(self.config.control_rate_kbps),
            false => TxVector::new(self.config.data_rate_kbps),
        }
    }

    fn rts_tx_vector(&self, _to: MacAddr) -> TxVector {
        TxVector::new(self.config.control_rate_kbps)
    }

    fn cts_tx_vector(&self, _to: MacAddr, _rts_tx: &TxVector) -> TxVector {
        TxVector::new(self.config.control_rate_kbps)
    }

    fn ack_tx_vector(&self, _to: MacAddr, _data_tx: &TxVector) -> TxVector {
        TxVector::new(self.config.control_rate_kbps)
    }

    fn cts_to_self_tx_vector(&self) -> TxVector {
        TxVector::new(self.config.control_rate_kbps)
    }

    fn need_rts(&self, header: &Header, size: usize) -> bool {
        !header.addr1.is_group() && size > self.config.rts_cts_threshold
    }

    fn use_non_erp_protection(&self) -> bool {
        self.config.non_erp_protection
    }

    fn need_fragmentation(&self, header: &Header, msdu_len: usize) -> bool {
        !header.addr1.is_group() && header.len() + msdu_len + FCS_LEN > self.config.fragmentation_threshold
    }

    fn fragment_size(&self, header: &Header, msdu_len: usize, index: u8) -> usize {
        let stride = self.fragment_stride(header);
        let offset = index as usize * stride;

        if offset >= msdu_len {
            return 0;
        }

        (msdu_len - offset).min(stride)
    }

    fn need_retransmission(&self, header: &Header, size: usize) -> bool {
        let c = self.counters(&header.addr1);

        match self.is_long(size) {
            true => c.slrc < self.config.max_slrc,
            false => c.ssrc < self.config.max_ssrc,
        }
    }

    fn report_rts_ok(&mut self, header: &Header) {
        self.update(header.addr1, |c| c.ssrc = 0);
    }

    fn report_rts_failed(&mut self, header: &Header) {
        self.update(header.addr1, |c| c.ssrc += 1);
    }

    fn report_final_rts_failed(&mut self, header: &Header) {
        debug!("Final RTS failure to {}", header.addr1);
        self.update(header.addr1, |c| c.ssrc = 0);
    }

    fn report_data_ok(&mut self, header: &Header, size: usize) {
        let long = self.is_long(size);
        self.update(header.addr1, |c| match long {
            true => c.slrc = 0,
            false => c.ssrc = 0,
        });
    }

    fn report_data_failed(&mut self, header: &Header, size: usize) {
        let long = self.is_long(size);
        self.update(header.addr1, |c| match long {
            true => c.slrc += 1,
            false => c.ssrc += 1,
        });
    }

    fn report_final_data_failed(&mut self, header: &Header, size: usize) {
        debug!("Final data failure to {}", header.addr1);
        let long = self.is_long(size);
        self.update(header.addr1, |c| match long {
            true => c.slrc = 0,
            false => c.ssrc = 0,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::FrameType;

    fn data_header() -> Header {
        Header::new(FrameType::Data, MacAddr::local(2), MacAddr::local(1))
    }

    #[test]
    fn short_retry_limit() {
        let mut m = ConstantRateManager::new(ManagerConfig {
            max_ssrc: 2,
            ..Default::default()
        });
        let h = data_header();

        assert!(m.need_retransmission(&h, 100));
        m.report_data_failed(&h, 100);
        assert!(m.need_retransmission(&h, 100));
        m.report_data_failed(&h, 100);
        assert!(!m.need_retransmission(&h, 100));

        m.report_final_data_failed(&h, 100);
        assert_eq!(m.counters(&h.addr1), RetryCounters::default());
    }

    #[test]
    fn long_frames_use_long_counter() {
        let mut m = ConstantRateManager::new(ManagerConfig {
            rts_cts_threshold: 500,
            max_slrc: 1,
            ..Default::default()
        });
        let h = data_header();

        assert!(m.need_rts(&h, 600));
        assert!(!m.need_rts(&h, 400));

        m.report_data_failed(&h, 600);
        assert_eq!(m.counters(&h.addr1), RetryCounters { ssrc: 0, slrc: 1 });
        assert!(!m.need_retransmission(&h, 600));
        assert!(m.need_retransmission(&h, 400));

        m.report_data_ok(&h, 600);
        assert_eq!(m.counters(&h.addr1).slrc, 0);
    }

    #[test]
    fn rts_counts_as_short() {
        let mut m = ConstantRateManager::default();
        let h = data_header();

        m.report_rts_failed(&h);
        m.report_rts_failed(&h);
        assert_eq!(m.counters(&h.addr1).ssrc, 2);

        m.report_rts_ok(&h);
        assert_eq!(m.counters(&h.addr1).ssrc, 0);
    }

    #[test]
    fn fragment_sizes() {
        let m = ConstantRateManager::new(ManagerConfig {
            fragmentation_threshold: 128,
            ..Default::default()
        });
        let h = data_header();

        // 24 byte header + 4 byte FCS leaves 100 bytes per fragment
        assert!(m.need_fragmentation(&h, 250));
        assert!(!m.need_fragmentation(&h, 100));
        assert_eq!(m.fragment_size(&h, 250, 0), 100);
        assert_eq!(m.fragment_size(&h, 250, 1), 100);
        assert_eq!(m.fragment_size(&h, 250, 2), 50);
        assert_eq!(m.fragment_size(&h, 250, 3), 0);

        let mut group = h;
        group.addr1 = MacAddr::BROADCAST;
        assert!(!m.need_fragmentation(&group, 250));
    }
}
