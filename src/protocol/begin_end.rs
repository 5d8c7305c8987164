// src/protocol/begin_end.rs

//! A framer for frames wrapped in begin and end marks.

use super::{FrameMapper, Framer, Request};
use crate::errors::PorticoError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Every frame starts with `begin_mark` and ends with `end_mark`; the payload
/// is whatever sits between them. A stream that does not open with the begin
/// mark is a protocol error.
pub struct BeginEndMarkFramer {
    begin_mark: Bytes,
    end_mark: Bytes,
    scanned: usize,
    mapper: FrameMapper,
    successor: Option<Box<dyn Framer>>,
}

impl BeginEndMarkFramer {
    pub fn new(begin_mark: impl Into<Bytes>, end_mark: impl Into<Bytes>) -> Self {
        Self::with_mapper(
            begin_mark,
            end_mark,
            Box::new(|payload| Ok(Request::raw(payload))),
        )
    }

    pub fn with_mapper(
        begin_mark: impl Into<Bytes>,
        end_mark: impl Into<Bytes>,
        mapper: FrameMapper,
    ) -> Self {
        let begin_mark = begin_mark.into();
        let end_mark = end_mark.into();
        assert!(!begin_mark.is_empty(), "begin mark must not be empty");
        assert!(!end_mark.is_empty(), "end mark must not be empty");
        Self {
            begin_mark,
            end_mark,
            scanned: 0,
            mapper,
            successor: None,
        }
    }

    pub fn with_successor(mut self, next: Box<dyn Framer>) -> Self {
        self.successor = Some(next);
        self
    }
}

impl Decoder for BeginEndMarkFramer {
    type Item = Request;
    type Error = PorticoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, PorticoError> {
        if src.len() < self.begin_mark.len() {
            return Ok(None);
        }
        if !src.starts_with(&self.begin_mark) {
            return Err(PorticoError::Protocol(
                "frame does not start with the begin mark".into(),
            ));
        }

        // Search for the end mark after the begin mark, resuming past bytes
        // already inspected on earlier receives.
        let search_base = self.begin_mark.len();
        let from = self
            .scanned
            .max(search_base)
            .saturating_sub(self.end_mark.len() - 1)
            .max(search_base);
        let found = src[from..]
            .windows(self.end_mark.len())
            .position(|w| w == &self.end_mark[..])
            .map(|pos| from + pos);

        match found {
            Some(at) => {
                let frame = src.split_to(at).freeze();
                src.advance(self.end_mark.len());
                self.scanned = 0;
                let payload = frame.slice(self.begin_mark.len()..);
                (self.mapper)(payload).map(Some)
            }
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Framer for BeginEndMarkFramer {
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        self.successor.take()
    }
}
