// src/protocol/fixed_header.rs

//! A framer for header-prefixed frames: a fixed-size header announces the
//! body length that follows it.

use super::{Framer, Request};
use crate::errors::PorticoError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Extracts the body length from a complete header.
pub type BodyLengthFn = Box<dyn Fn(&[u8]) -> usize + Send + Sync>;

/// Maps a complete (header, body) pair to a request.
pub type HeaderFrameMapper = Box<dyn Fn(Bytes, Bytes) -> Result<Request, PorticoError> + Send + Sync>;

/// Frames carry a `header_len`-byte header followed by a body whose length
/// the header announces. Nothing is consumed until the whole frame arrived,
/// so the retained-byte count seen by the oversize check stays exact.
pub struct FixedHeaderFramer {
    header_len: usize,
    body_len: BodyLengthFn,
    mapper: HeaderFrameMapper,
    successor: Option<Box<dyn Framer>>,
}

impl FixedHeaderFramer {
    /// The default mapping discards the header and uses the body as a raw request.
    pub fn new(header_len: usize, body_len: BodyLengthFn) -> Self {
        Self::with_mapper(
            header_len,
            body_len,
            Box::new(|_header, body| Ok(Request::raw(body))),
        )
    }

    pub fn with_mapper(header_len: usize, body_len: BodyLengthFn, mapper: HeaderFrameMapper) -> Self {
        assert!(header_len > 0, "header length must not be zero");
        Self {
            header_len,
            body_len,
            mapper,
            successor: None,
        }
    }

    pub fn with_successor(mut self, next: Box<dyn Framer>) -> Self {
        self.successor = Some(next);
        self
    }
}

impl Decoder for FixedHeaderFramer {
    type Item = Request;
    type Error = PorticoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, PorticoError> {
        if src.len() < self.header_len {
            return Ok(None);
        }
        let body_len = (self.body_len)(&src[..self.header_len]);
        let total = self.header_len + body_len;
        if src.len() < total {
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        let header = frame.split_to(self.header_len).freeze();
        let body = frame.freeze();
        (self.mapper)(header, body).map(Some)
    }
}

impl Framer for FixedHeaderFramer {
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        self.successor.take()
    }
}
