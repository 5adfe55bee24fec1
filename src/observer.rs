//! MAC event observer

use crate::frame::Frame;
use crate::mac::AccessCategory;

/// Reasons for dropping a queued frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DropReason {
    /// Retry limit reached without a CTS or ACK
    RetryLimitExceeded,
    /// MSDU lifetime expired while queued
    Expired,
}

/// Observer for MAC events.
///
/// All methods default to no-ops, `()` may be used where no events are required.
/// Acknowledged and dropped callbacks fire at most once per frame.
#[allow(unused_variables)]
pub trait MacObserver {
    /// A queue has won access to the channel
    fn channel_accessed(&mut self, ac: AccessCategory) {}

    /// A queue has released the channel following a frame exchange
    fn channel_released(&mut self, ac: AccessCategory) {}

    /// A fresh backoff was drawn for a queue
    fn backoff_generated(&mut self, ac: AccessCategory, slots: u32) {}

    /// A queue lost an internal collision to a higher priority queue
    fn internal_collision(&mut self, ac: AccessCategory) {}

    /// A frame was acknowledged by the receiver
    fn frame_acked(&mut self, frame: &Frame) {}

    /// A frame was discarded without being acknowledged
    fn frame_dropped(&mut self, frame: &Frame, reason: DropReason) {}

    /// A data or management frame addressed to this station was received
    fn frame_received(&mut self, frame: &Frame) {}
}

impl MacObserver for () {}
