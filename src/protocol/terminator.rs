// src/protocol/terminator.rs

//! A framer that delimits frames with a fixed terminator byte sequence.

use super::{FrameMapper, Framer, Request};
use crate::errors::PorticoError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Frames end at a terminator byte sequence (e.g. `\r\n`). The terminator is
/// stripped from the payload. An empty frame (terminator at the start of the
/// buffer) is a valid request with an empty payload.
///
/// The framer keeps a scan cursor so bytes inspected on a previous receive
/// are not searched again, and a terminator split across two receives is
/// still found: the cursor backs up by `terminator_len - 1` so a partial
/// match at the old tail is re-examined once the rest arrives.
pub struct TerminatorFramer {
    terminator: Bytes,
    scanned: usize,
    mapper: FrameMapper,
    successor: Option<Box<dyn Framer>>,
}

impl TerminatorFramer {
    /// Frames map to raw requests (empty key, payload as body).
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        Self::with_mapper(terminator, Box::new(|payload| Ok(Request::raw(payload))))
    }

    /// Frames map through the given payload-to-request function.
    pub fn with_mapper(terminator: impl Into<Bytes>, mapper: FrameMapper) -> Self {
        let terminator = terminator.into();
        assert!(!terminator.is_empty(), "terminator must not be empty");
        Self {
            terminator,
            scanned: 0,
            mapper,
            successor: None,
        }
    }

    /// Installs the framer that takes over after the next produced request.
    pub fn with_successor(mut self, next: Box<dyn Framer>) -> Self {
        self.successor = Some(next);
        self
    }

    fn find_terminator(&self, src: &[u8]) -> Option<usize> {
        // Resume just before the scanned tail so a terminator straddling the
        // previous receive boundary is still matched.
        let from = self.scanned.saturating_sub(self.terminator.len() - 1);
        src[from..]
            .windows(self.terminator.len())
            .position(|w| w == &self.terminator[..])
            .map(|pos| from + pos)
    }
}

impl Decoder for TerminatorFramer {
    type Item = Request;
    type Error = PorticoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, PorticoError> {
        if src.len() < self.terminator.len() {
            self.scanned = src.len();
            return Ok(None);
        }
        match self.find_terminator(src) {
            Some(at) => {
                let payload = src.split_to(at).freeze();
                src.advance(self.terminator.len());
                self.scanned = 0;
                (self.mapper)(payload).map(Some)
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Framer for TerminatorFramer {
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        self.successor.take()
    }
}
