//! PHY interface consumed by the MAC
//
// Copyright 2021 Ryan Kurte

use crate::frame::{Frame, ACK_SIZE};
use crate::Ts;

/// Transmission parameters handed to the PHY alongside each frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxVector {
    /// Data rate in kbit/s
    pub rate_kbps: u32,
}

impl TxVector {
    pub const fn new(rate_kbps: u32) -> Self {
        Self { rate_kbps }
    }
}

/// Physical layer, provides timing queries and frame transmission.
///
/// Medium notifications (reception, CCA, switching, power) flow the other
/// way, from the PHY driver into [`crate::mac::Mac`].
pub trait Phy {
    /// Short inter-frame space
    fn sifs(&self) -> Ts;

    /// Slot time
    fn slot(&self) -> Ts;

    /// Duration of the PHY preamble and header for the provided tx vector
    fn preamble_and_header_duration(&self, tx: &TxVector) -> Ts;

    /// Airtime of a PSDU of `size` bytes (including preamble)
    fn tx_duration(&self, size: usize, tx: &TxVector) -> Ts;

    /// Airtime of an ACK at the lowest basic rate, used to derive EIFS
    fn ack_tx_time(&self) -> Ts;

    /// Start transmission of a frame.
    /// The frame is borrowed for the duration of the call only.
    fn send(&mut self, frame: &Frame, tx: &TxVector);
}

/// OFDM (802.11a, 20 MHz) timing model
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OfdmTiming {
    pub sifs: Ts,
    pub slot: Ts,
    /// Preamble plus SIGNAL field
    pub preamble: Ts,
    pub symbol: Ts,
    /// Lowest basic rate, used for ACK time in EIFS
    pub basic_rate_kbps: u32,
}

impl Default for OfdmTiming {
    fn default() -> Self {
        Self {
            sifs: 16,
            slot: 9,
            preamble: 20,
            symbol: 4,
            basic_rate_kbps: 6_000,
        }
    }
}

impl OfdmTiming {
    /// Airtime of a PSDU including SERVICE and tail bits, rounded up to whole symbols
    pub fn tx_duration(&self, size: usize, tx: &TxVector) -> Ts {
        let bits = 16 + 8 * size as u64 + 6;
        let bits_per_symbol = (tx.rate_kbps as u64 * self.symbol / 1000).max(1);
        let symbols = (bits + bits_per_symbol - 1) / bits_per_symbol;

        self.preamble + symbols * self.symbol
    }

    pub fn ack_tx_time(&self) -> Ts {
        self.tx_duration(ACK_SIZE, &TxVector::new(self.basic_rate_kbps))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ofdm_airtime() {
        let t = OfdmTiming::default();

        // 802.11a ACK at 6 Mbit/s
        assert_eq!(t.ack_tx_time(), 44);

        // 1500 byte PSDU at 54 Mbit/s, 12022 bits over 216 bit symbols
        assert_eq!(t.tx_duration(1500, &TxVector::new(54_000)), 20 + 56 * 4);
    }
}
