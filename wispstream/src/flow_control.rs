//! Per-stream credit accounting.
//!
//! The server grants each stream a number of DATA packets it may send before
//! waiting for the next CONTINUE. Until the first grant arrives the stream is
//! not limited at all. UDP streams are never limited.

use std::fmt;

use crate::packet::StreamType;

/// Remaining send credit for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credit {
    /// No limit has been communicated yet.
    Unbounded,
    /// This many more DATA packets may be sent.
    Limited(u32),
}

impl Credit {
    /// Initial credit for a new stream given the connection-wide default.
    pub fn from_default(max_buffer_size: Option<u32>) -> Self {
        match max_buffer_size {
            Some(n) => Credit::Limited(n),
            None => Credit::Unbounded,
        }
    }

    /// Whether credit remains for at least one more send.
    pub fn available(self) -> bool {
        match self {
            Credit::Unbounded => true,
            Credit::Limited(n) => n > 0,
        }
    }

    /// Account for one transmitted packet. Never goes below zero.
    pub fn consume(&mut self) {
        if let Credit::Limited(n) = self {
            *n = n.saturating_sub(1);
        }
    }

    /// The remaining count, or `None` when unbounded.
    pub fn remaining(self) -> Option<u32> {
        match self {
            Credit::Unbounded => None,
            Credit::Limited(n) => Some(n),
        }
    }
}

impl fmt::Display for Credit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credit::Unbounded => write!(f, "unbounded"),
            Credit::Limited(n) => write!(f, "{n}"),
        }
    }
}

/// Flow-control state for a single stream.
#[derive(Debug, Clone)]
pub struct FlowController {
    stream_type: StreamType,
    credit: Credit,
}

impl FlowController {
    pub fn new(stream_type: StreamType, credit: Credit) -> Self {
        Self {
            stream_type,
            credit,
        }
    }

    pub fn credit(&self) -> Credit {
        self.credit
    }

    /// Whether a send may go on the wire right now.
    pub fn can_send(&self) -> bool {
        self.stream_type == StreamType::Udp || self.credit.available()
    }

    /// Record one transmitted DATA packet. UDP streams are exempt.
    pub fn on_sent(&mut self) {
        if self.stream_type == StreamType::Tcp {
            self.credit.consume();
        }
    }

    /// Replace the credit with a fresh grant from the peer.
    pub fn grant(&mut self, credit: u32) {
        self.credit = Credit::Limited(credit);
    }
}
