//! CSMA/CA channel access and frame exchange for 802.11 (DCF / EDCA)
//!
//! The MAC is split into a [`mac::ChannelAccessManager`], which tracks the
//! medium and arbitrates backoff between transmit queues, and a
//! [`mac::FrameExchangeManager`], which runs the RTS/CTS, data and ACK
//! sequence for the queue holding the channel. [`mac::Mac`] ties these
//! together behind PHY notification, enqueue and timer entry points.
//
// Copyright 2021 Ryan Kurte

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod timer;

pub mod frame;

pub mod phy;

pub mod manager;

pub mod observer;

pub mod mac;

pub mod error;

pub mod prelude;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;

/// Timestamps are 64-bit in microseconds
pub type Ts = u64;
