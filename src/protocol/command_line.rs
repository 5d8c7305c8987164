// src/protocol/command_line.rs

//! The text command-line framer: `"KEY param1 param2\r\n"`.

use super::terminator::TerminatorFramer;
use super::{Framer, Request};
use crate::errors::PorticoError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Parses CRLF-terminated text lines into keyed requests. The first
/// space-separated token is the command key, the remainder of the line is the
/// body, and the body split on spaces yields the parameters.
pub struct CommandLineFramer {
    inner: TerminatorFramer,
}

impl CommandLineFramer {
    pub fn new() -> Self {
        Self {
            inner: TerminatorFramer::with_mapper(&b"\r\n"[..], Box::new(parse_command_line)),
        }
    }
}

impl Default for CommandLineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_command_line(payload: Bytes) -> Result<Request, PorticoError> {
    let line = std::str::from_utf8(&payload)?;
    let mut tokens = line.split(' ').filter(|t| !t.is_empty());
    let key = tokens.next().unwrap_or("").to_string();
    let parameters: Vec<String> = tokens.map(str::to_string).collect();

    // The body is the remainder of the line after the key, as raw bytes.
    let body = match line.find(' ') {
        Some(at) => payload.slice(at + 1..),
        None => Bytes::new(),
    };
    Ok(Request::new(key, parameters, body))
}

impl Decoder for CommandLineFramer {
    type Item = Request;
    type Error = PorticoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, PorticoError> {
        self.inner.decode(src)
    }
}

impl Framer for CommandLineFramer {
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        self.inner.take_successor()
    }
}
