// src/protocol/fixed_size.rs

//! A framer for frames of a single known size.

use super::{FrameMapper, Framer, Request};
use crate::errors::PorticoError;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Every frame is exactly `size` bytes.
pub struct FixedSizeFramer {
    size: usize,
    mapper: FrameMapper,
    successor: Option<Box<dyn Framer>>,
}

impl FixedSizeFramer {
    pub fn new(size: usize) -> Self {
        Self::with_mapper(size, Box::new(|payload| Ok(Request::raw(payload))))
    }

    pub fn with_mapper(size: usize, mapper: FrameMapper) -> Self {
        assert!(size > 0, "frame size must not be zero");
        Self {
            size,
            mapper,
            successor: None,
        }
    }

    pub fn with_successor(mut self, next: Box<dyn Framer>) -> Self {
        self.successor = Some(next);
        self
    }
}

impl Decoder for FixedSizeFramer {
    type Item = Request;
    type Error = PorticoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, PorticoError> {
        if src.len() < self.size {
            return Ok(None);
        }
        let payload = src.split_to(self.size).freeze();
        (self.mapper)(payload).map(Some)
    }
}

impl Framer for FixedSizeFramer {
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        self.successor.take()
    }
}
