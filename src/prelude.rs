//! DCF crate prelude
//
// Copyright 2021 Ryan Kurte

pub use crate::Ts;

pub use crate::mac::{AccessCategory, Config as MacConfig, EdcaParams, Mac, MacEvent};

pub use crate::error::MacError;
pub use crate::timer::{EventId, Scheduler, Timer as MacTimer};

pub use crate::frame::{Frame, FrameType, Header, MacAddr};
pub use crate::phy::{Phy, TxVector};

pub use crate::manager::{ConstantRateManager, ManagerConfig, StationManager};
pub use crate::observer::{DropReason, MacObserver};
