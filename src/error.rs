//! MAC errors
//
// Copyright 2021 Ryan Kurte

use crate::frame::{DecodeError, Frame};
use crate::mac::{AccessCategory, TxopId};

/// MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum MacError {
    /// Transmit queue full, the frame is returned
    QueueFull(Frame),

    /// No queue registered for the access category
    NoQueue(AccessCategory),

    /// Queue limit reached while registering an access category
    TooManyQueues(AccessCategory),

    /// Decoding error
    DecodeError(DecodeError),

    /// Internal scheduling invariant violated, results are invalid past this point
    Invariant(Invariant),
}

/// Scheduling invariants
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Invariant {
    /// A queue was granted access while another queue holds the channel
    DoubleGrant { granted: TxopId, holder: TxopId },

    /// A transmission was started while a frame exchange is in progress
    ExchangeInProgress,

    /// A frame exchange continuation ran with no exchange pending
    NoExchange,

    /// The frame under exchange is not at the head of its queue
    QueueHead(TxopId),

    /// A queued frame handle has no backing frame
    UnknownFrame,
}

impl From<DecodeError> for MacError {
    fn from(e: DecodeError) -> Self {
        MacError::DecodeError(e)
    }
}

impl From<Invariant> for MacError {
    fn from(i: Invariant) -> Self {
        MacError::Invariant(i)
    }
}
