//! Frame arena backing the transmit queues

use bytes::Bytes;
use slab::Slab;

use crate::frame::Frame;
use crate::Ts;

/// Handle to a queued frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) usize);

/// Queued MPDU with transmit bookkeeping
#[derive(Clone, Debug, PartialEq)]
pub struct Mpdu {
    pub frame: Frame,
    /// Time the MSDU was enqueued
    pub timestamp: Ts,
    /// A sequence number has been assigned
    pub seq_assigned: bool,
    /// Complete MSDU body when this MPDU is a fragment
    pub msdu: Option<Bytes>,
}

impl Mpdu {
    pub fn new(frame: Frame, timestamp: Ts) -> Self {
        Self {
            frame,
            timestamp,
            seq_assigned: false,
            msdu: None,
        }
    }

    /// Length of the complete MSDU body
    pub fn msdu_len(&self) -> usize {
        match &self.msdu {
            Some(m) => m.len(),
            None => self.frame.payload.len(),
        }
    }

    /// Reassemble the MSDU carried by this MPDU
    pub fn into_msdu(self) -> Frame {
        let Mpdu { mut frame, msdu, .. } = self;

        if let Some(body) = msdu {
            frame.header.set_fragment_number(0);
            frame.header.set_more_fragments(false);
            frame.payload = body;
        }

        frame
    }
}

/// Frame storage, owns queued frames until they are dequeued
#[derive(Debug, Default)]
pub struct FrameArena {
    frames: Slab<Mpdu>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self { frames: Slab::new() }
    }

    pub fn insert(&mut self, mpdu: Mpdu) -> FrameId {
        FrameId(self.frames.insert(mpdu))
    }

    pub fn get(&self, id: FrameId) -> Option<&Mpdu> {
        self.frames.get(id.0)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Mpdu> {
        self.frames.get_mut(id.0)
    }

    pub fn remove(&mut self, id: FrameId) -> Option<Mpdu> {
        self.frames.try_remove(id.0)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
