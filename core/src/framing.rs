//! Stream framing for session bytes
//!
//! A session reads arbitrary chunks off the transport. A [`FrameDecoder`]
//! turns those chunks into application-level frames:
//!
//! - [`RawChunkFramer`]: every non-empty read is one frame.
//! - [`DelimitedLineFramer`]: bytes accumulate until a carriage return
//!   (`0x0D`); line feeds (`0x0A`) are dropped.
//!
//! Decoders follow a feed/drain cycle: call `extend` with each read, then call
//! `decode_next` until it returns `None`.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Frame terminator for [`DelimitedLineFramer`]
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Ignored by [`DelimitedLineFramer`]
pub const LINE_FEED: u8 = 0x0A;

/// Converts a byte stream into discrete frames
pub trait FrameDecoder: Send {
    /// Feed bytes from one successful read
    fn extend(&mut self, data: &[u8]);

    /// Take the next complete frame, if any
    fn decode_next(&mut self) -> Option<Bytes>;
}

/// Emits each read as exactly one frame, byte for byte
#[derive(Debug, Default)]
pub struct RawChunkFramer {
    ready: VecDeque<Bytes>,
}

impl RawChunkFramer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for RawChunkFramer {
    fn extend(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.ready.push_back(Bytes::copy_from_slice(data));
        }
    }

    fn decode_next(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }
}

/// Accumulates bytes into carriage-return terminated frames.
///
/// Without a limit the pending frame grows until a CR arrives, so a peer
/// that never sends one is buffered without bound. [`with_max_frame_len`]
/// caps it: a full buffer is emitted as its own frame when the next
/// non-terminator byte arrives.
///
/// [`with_max_frame_len`]: DelimitedLineFramer::with_max_frame_len
#[derive(Debug)]
pub struct DelimitedLineFramer {
    /// Bytes of the frame being accumulated
    buffer: BytesMut,
    ready: VecDeque<Bytes>,
    max_frame_len: Option<usize>,
}

impl DelimitedLineFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            ready: VecDeque::new(),
            max_frame_len: None,
        }
    }

    /// Emit the pending bytes once they reach `max` without a terminator
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            max_frame_len: Some(max.max(1)),
            ..Self::new()
        }
    }

    /// Bytes waiting for a terminator
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for DelimitedLineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for DelimitedLineFramer {
    fn extend(&mut self, data: &[u8]) {
        for &byte in data {
            match byte {
                LINE_FEED => {}
                // An empty run still produces a frame
                CARRIAGE_RETURN => self.ready.push_back(self.buffer.split().freeze()),
                _ => {
                    if self.max_frame_len == Some(self.buffer.len()) {
                        self.ready.push_back(self.buffer.split().freeze());
                    }
                    self.buffer.put_u8(byte);
                }
            }
        }
    }

    fn decode_next(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }
}

/// Builds a fresh decoder for each session
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

/// Framing strategy applied to every session a manager runs
#[derive(Clone, Default)]
pub enum Framing {
    #[default]
    RawChunk,
    DelimitedLine,
    Custom(DecoderFactory),
}

impl Framing {
    /// Use an application-supplied decoder
    pub fn custom<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn FrameDecoder> + Send + Sync + 'static,
    {
        Framing::Custom(Arc::new(factory))
    }

    /// Create the decoder for a new session
    pub fn decoder(&self) -> Box<dyn FrameDecoder> {
        match self {
            Framing::RawChunk => Box::new(RawChunkFramer::new()),
            Framing::DelimitedLine => Box::new(DelimitedLineFramer::new()),
            Framing::Custom(factory) => factory(),
        }
    }
}

impl fmt::Debug for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::RawChunk => write!(f, "RawChunk"),
            Framing::DelimitedLine => write!(f, "DelimitedLine"),
            Framing::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}
