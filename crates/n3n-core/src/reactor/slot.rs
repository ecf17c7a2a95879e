//! A single connection slot: request framing, reply staging, and the state
//! machine described in the reactor module docs.

use std::io::{self, IoSlice, Read, Write};

use super::Conn;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Reading,
    Ready,
    Sending,
    Closed,
    Error,
}

/// The reply body may alias the request buffer (callers that echo the
/// inbound bytes back don't need a second allocation); this enum makes that
/// aliasing explicit instead of relying on two `Vec<u8>`s that happen to
/// share contents.
#[derive(Debug)]
pub enum ReplyBody {
    Owned(Vec<u8>),
    FromRequest,
}

#[derive(Debug)]
pub struct Reply {
    pub header: Vec<u8>,
    pub body: ReplyBody,
}

enum FrameState {
    Incomplete,
    Complete(usize),
}

pub(super) struct Slot {
    conn: Option<Conn>,
    state: SlotState,
    request: Vec<u8>,
    request_complete_len: Option<usize>,
    reply_header: Option<Vec<u8>>,
    reply_body: Option<ReplyBody>,
    reply_sendpos: usize,
    last_activity: u64,
}

impl Slot {
    pub(super) fn empty() -> Self {
        Self {
            conn: None,
            state: SlotState::Empty,
            request: Vec::new(),
            request_complete_len: None,
            reply_header: None,
            reply_body: None,
            reply_sendpos: 0,
            last_activity: 0,
        }
    }

    pub(super) fn is_free(&self) -> bool {
        self.conn.is_none()
    }

    pub(super) fn state(&self) -> SlotState {
        self.state
    }

    pub(super) fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub(super) fn accept(&mut self, conn: Conn, now: u64) {
        self.conn = Some(conn);
        self.state = SlotState::Reading;
        self.request.clear();
        self.request_complete_len = None;
        self.reply_header = None;
        self.reply_body = None;
        self.reply_sendpos = 0;
        self.last_activity = now;
    }

    /// The framed request bytes. Only meaningful once `state() == Ready`.
    pub(super) fn request_bytes(&self) -> &[u8] {
        match self.request_complete_len {
            Some(len) => &self.request[..len],
            None => &self.request,
        }
    }

    pub(super) fn attach_reply(&mut self, reply: Reply) {
        self.reply_header = Some(reply.header);
        self.reply_body = Some(reply.body);
        self.reply_sendpos = 0;
        self.state = SlotState::Sending;
    }

    /// Frees the slot back to `Empty`, dropping its connection and buffers.
    /// Called whenever the reactor observes `Closed`/`Error`, or once a reply
    /// has been fully sent.
    pub(super) fn reset(&mut self, now: u64) {
        self.conn = None;
        self.state = SlotState::Empty;
        self.request.clear();
        self.request_complete_len = None;
        self.reply_header = None;
        self.reply_body = None;
        self.reply_sendpos = 0;
        self.last_activity = now;
    }

    /// Drains readable bytes until `WouldBlock`, a zero-length read, or a
    /// complete request is framed. Returns `Err` only for transport/capacity
    /// failures; the caller reads `state()` afterward either way.
    pub(super) fn on_readable(&mut self, request_max: usize, now: u64) -> Result<(), Error> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };

        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => {
                    self.state = SlotState::Closed;
                    return Ok(());
                }
                Ok(n) => {
                    self.request.extend_from_slice(&buf[..n]);
                    self.last_activity = now;
                    match scan_request(&self.request, request_max) {
                        Ok(FrameState::Complete(len)) => {
                            self.request_complete_len = Some(len);
                            self.state = SlotState::Ready;
                            return Ok(());
                        }
                        Ok(FrameState::Incomplete) => continue,
                        Err(e) => {
                            self.state = SlotState::Error;
                            return Err(e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.state = SlotState::Error;
                    return Err(Error::Transport {
                        op: "slot read",
                        source: e,
                    });
                }
            }
        }
    }

    fn reply_total_len(&self) -> usize {
        let header_len = self.reply_header.as_ref().map(Vec::len).unwrap_or(0);
        let body_len = match &self.reply_body {
            Some(ReplyBody::Owned(b)) => b.len(),
            Some(ReplyBody::FromRequest) => self.request.len(),
            None => 0,
        };
        header_len + body_len
    }

    /// Writes as much of the staged reply as the socket accepts in one call,
    /// preferring a single scatter-gather write covering both the header
    /// tail and the body. Transitions to `Empty` once `reply_sendpos`
    /// reaches the total reply length.
    pub(super) fn on_writable(&mut self, now: u64) -> Result<(), Error> {
        let total = self.reply_total_len();
        if total == 0 {
            self.reset(now);
            return Ok(());
        }

        let pos = self.reply_sendpos;
        let written = {
            let header: &[u8] = self.reply_header.as_deref().unwrap_or(&[]);
            let body: &[u8] = match &self.reply_body {
                Some(ReplyBody::Owned(b)) => b.as_slice(),
                Some(ReplyBody::FromRequest) => self.request.as_slice(),
                None => &[],
            };
            let conn = match self.conn.as_mut() {
                Some(c) => c,
                None => return Ok(()),
            };
            write_remaining(conn, header, body, pos)
        };

        match written {
            Ok(n) => {
                self.reply_sendpos += n;
                self.last_activity = now;
                if self.reply_sendpos >= total {
                    self.reset(now);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.state = SlotState::Error;
                Err(Error::Transport {
                    op: "slot write",
                    source: e,
                })
            }
        }
    }
}

fn write_remaining(conn: &mut Conn, header: &[u8], body: &[u8], pos: usize) -> io::Result<usize> {
    if pos < header.len() {
        let head_rem = &header[pos..];
        let iov = [IoSlice::new(head_rem), IoSlice::new(body)];
        conn.write_vectored(&iov)
    } else {
        let body_off = pos - header.len();
        conn.write(&body[body_off..])
    }
}

/// Scans for a complete HTTP/1.x request: header terminated by `CRLFCRLF`,
/// plus `Content-Length` bytes of body if that header is present. The parsed
/// `Content-Length` is bounds-checked against `request_max` before being
/// trusted, as is unterminated header growth — both become `Error::Capacity`
/// rather than unbounded buffering.
fn scan_request(buf: &[u8], request_max: usize) -> Result<FrameState, Error> {
    match find(buf, b"\r\n\r\n") {
        None => {
            if buf.len() > request_max {
                Err(Error::Capacity {
                    len: buf.len(),
                    max: request_max,
                })
            } else {
                Ok(FrameState::Incomplete)
            }
        }
        Some(idx) => {
            let body_pos = idx + 4;
            let header = &buf[..body_pos];
            match find_ci(header, b"content-length:") {
                None => Ok(FrameState::Complete(body_pos)),
                Some(field_pos) => {
                    let content_length = parse_decimal_after(header, field_pos + b"content-length:".len());
                    if content_length > request_max {
                        return Err(Error::Capacity {
                            len: content_length,
                            max: request_max,
                        });
                    }
                    let total = body_pos + content_length;
                    if buf.len() < total {
                        Ok(FrameState::Incomplete)
                    } else {
                        Ok(FrameState::Complete(total))
                    }
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_ci(haystack: &[u8], needle_lower: &[u8]) -> Option<usize> {
    haystack
        .windows(needle_lower.len())
        .position(|w| w.eq_ignore_ascii_case(needle_lower))
}

fn parse_decimal_after(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && buf[pos] == b' ' {
        pos += 1;
    }
    let mut value: usize = 0;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        value = value.saturating_mul(10).saturating_add((buf[pos] - b'0') as usize);
        pos += 1;
    }
    value
}
