//! Fixed-size connection pool for the management-plane HTTP/1.x-ish slot
//! protocol: up to [`MAX_LISTENERS`] listening sockets feed a pool of `N`
//! slots, multiplexed with a level-triggered readiness-polling primitive
//! (`popol`) rather than a full async runtime. One event loop, no threads.
//!
//! Built on raw unix file descriptors (`popol` itself is poll(2)-based), so
//! this module — unlike the rest of the core — only compiles on unix.

mod listener;
mod slot;

pub use listener::LISTEN_BACKLOG;
#[cfg(unix)]
pub use listener::local::LocalListenerOpts;
pub use slot::{Reply, ReplyBody, SlotState};

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::Error;
use slot::Slot;

/// Compile-time cap on simultaneous listening sockets (one dual-stack TCP
/// listener plus, optionally, one local socket per configured path).
pub const MAX_LISTENERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Token {
    Listener(usize),
    Slot(usize),
}

enum Listening {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl Listening {
    fn accept(&self) -> io::Result<Conn> {
        match self {
            Listening::Tcp(l) => {
                let (stream, _addr) = l.accept()?;
                stream.set_nonblocking(true)?;
                Ok(Conn::Tcp(stream))
            }
            #[cfg(unix)]
            Listening::Unix(l) => {
                let (stream, _addr) = l.accept()?;
                stream.set_nonblocking(true)?;
                Ok(Conn::Unix(stream))
            }
        }
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for Listening {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Listening::Tcp(l) => l.as_raw_fd(),
            Listening::Unix(l) => l.as_raw_fd(),
        }
    }
}

/// A connection accepted by either listener family. The slot state machine
/// and HTTP framing don't care which; they just read and write bytes.
enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Conn::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Conn::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write_vectored(bufs),
            #[cfg(unix)]
            Conn::Unix(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Conn::Unix(s) => s.flush(),
        }
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for Conn {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Conn::Tcp(s) => s.as_raw_fd(),
            Conn::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Callback the reactor hands a completed request to. Returning `Some(reply)`
/// stages it for sending; returning `None` leaves the slot `Ready` (the
/// caller is expected to answer on a later `poll_once` call, or never —
/// the idle reaper eventually closes it).
pub type Handler<'a> = dyn FnMut(&[u8]) -> Option<Reply> + 'a;

pub struct SlotPool {
    slots: Vec<Slot>,
    listeners: Vec<Listening>,
    sources: popol::Sources<Token>,
    request_max: usize,
    idle_timeout_secs: u64,
    nr_open: usize,
    no_free_slot_count: u64,
}

impl SlotPool {
    pub fn new(capacity: usize, request_max: usize, idle_timeout_secs: u64) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);
        Self {
            slots,
            listeners: Vec::new(),
            sources: popol::Sources::new(),
            request_max,
            idle_timeout_secs,
            nr_open: 0,
            no_free_slot_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn open_count(&self) -> usize {
        self.nr_open
    }

    /// Number of accepted connections dropped so far because every slot was
    /// occupied (the `Error::NoFreeSlot`/`-2` case `slots_accept` describes
    /// in §4.4). The reactor doesn't fail `poll_once` over this — a full
    /// pool is an expected, high-frequency condition under load, not a
    /// transport fault — but it's counted so a caller can alarm on it.
    pub fn no_free_slot_count(&self) -> u64 {
        self.no_free_slot_count
    }

    /// Binds a dual-stack (IPv6-then-IPv4-fallback) TCP listener on `port`
    /// and registers it for readiness polling.
    pub fn listen_tcp(&mut self, port: u16) -> Result<(), Error> {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(Error::NoFreeListenSlot);
        }
        let listener = listener::bind_dual_stack(port)?;
        self.register_listener(Listening::Tcp(listener));
        Ok(())
    }

    /// Binds a unix local socket at `path` and registers it for readiness
    /// polling. Only available on unix targets.
    #[cfg(unix)]
    pub fn listen_local(
        &mut self,
        path: &std::path::Path,
        opts: &LocalListenerOpts,
    ) -> Result<(), Error> {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(Error::NoFreeListenSlot);
        }
        let listener = listener::local::bind(path, opts)?;
        self.register_listener(Listening::Unix(listener));
        Ok(())
    }

    fn register_listener(&mut self, listening: Listening) {
        let idx = self.listeners.len();
        self.sources
            .register(Token::Listener(idx), &listening, popol::interest::READ);
        self.listeners.push(listening);
    }

    /// Waits once for readiness, services whatever is ready (accepting new
    /// connections, reading, invoking `handler` on newly-framed requests,
    /// and writing staged replies), then reaps idle slots. `now` is the
    /// caller-supplied wall-clock second (injected so idle-close is
    /// testable without a real clock).
    pub fn poll_once(&mut self, timeout: Duration, handler: &mut Handler, now: u64) -> Result<(), Error> {
        let mut events = popol::Events::new();
        match self.sources.wait_timeout(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                self.close_idle(now);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Transport {
                    op: "reactor poll",
                    source: e,
                })
            }
        }

        for (token, ev) in events.iter() {
            match *token {
                Token::Listener(li) => {
                    if ev.readable {
                        self.accept_all(li, now);
                    }
                }
                Token::Slot(i) => self.service_slot(i, &ev, handler, now),
            }
        }

        self.close_idle(now);
        Ok(())
    }

    /// Drains every pending connection on listener `li` into the first free
    /// slot. When the pool is full, accepted connections are simply not
    /// drained here; with a backlog of 1 the kernel sheds the excess — this
    /// is the load-shedding behavior `nr_open < capacity` guards against in
    /// the reference design.
    fn accept_all(&mut self, li: usize, now: u64) {
        if self.nr_open >= self.slots.len() {
            return;
        }
        loop {
            let accepted = match self.listeners.get(li) {
                Some(listening) => listening.accept(),
                None => return,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(listener = li, error = %e, "accept failed");
                    return;
                }
            };

            let free = self.slots.iter().position(Slot::is_free);
            let idx = match free {
                Some(idx) => idx,
                None => {
                    self.no_free_slot_count += 1;
                    tracing::debug!(error = %Error::NoFreeSlot, "dropping accepted connection");
                    return;
                }
            };

            self.sources.register(Token::Slot(idx), &conn, popol::interest::READ);
            self.slots[idx].accept(conn, now);
            self.nr_open += 1;

            if self.nr_open >= self.slots.len() {
                return;
            }
        }
    }

    fn service_slot(&mut self, i: usize, ev: &popol::Event, handler: &mut Handler, now: u64) {
        if ev.errored || ev.invalid || ev.hangup {
            self.free_slot(i, now);
            return;
        }

        if ev.readable {
            if let Err(e) = self.slots[i].on_readable(self.request_max, now) {
                tracing::warn!(slot = i, error = %e, "slot read error");
            }
            if self.slots[i].state() == SlotState::Ready {
                let reply = handler(self.slots[i].request_bytes());
                if let Some(reply) = reply {
                    self.slots[i].attach_reply(reply);
                    if let Some(src) = self.sources.get_mut(&Token::Slot(i)) {
                        src.set(popol::interest::WRITE);
                    }
                }
            }
        }

        if ev.writable {
            if let Err(e) = self.slots[i].on_writable(now) {
                tracing::warn!(slot = i, error = %e, "slot write error");
            }
        }

        match self.slots[i].state() {
            SlotState::Closed | SlotState::Error => self.free_slot(i, now),
            SlotState::Empty => {
                if let Some(src) = self.sources.get_mut(&Token::Slot(i)) {
                    src.unset(popol::interest::WRITE);
                }
            }
            _ => {}
        }
    }

    fn free_slot(&mut self, i: usize, now: u64) {
        if self.slots[i].is_free() {
            return;
        }
        self.sources.unregister(&Token::Slot(i));
        self.slots[i].reset(now);
        self.nr_open = self.nr_open.saturating_sub(1);
    }

    /// Closes every slot whose last activity is older than the configured
    /// idle timeout.
    pub fn close_idle(&mut self, now: u64) {
        for i in 0..self.slots.len() {
            if !self.slots[i].is_free() && now.saturating_sub(self.slots[i].last_activity()) > self.idle_timeout_secs {
                self.free_slot(i, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpStream;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn accepts_and_answers_a_request() {
        let port = free_port();
        let mut pool = SlotPool::new(4, 8192, 30);
        pool.listen_tcp(port).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

        let mut handler: Box<Handler> = Box::new(|req: &[u8]| {
            assert!(req.ends_with(b"\r\n\r\n"));
            Some(Reply {
                header: b"HTTP/1.0 200 OK\r\n\r\n".to_vec(),
                body: ReplyBody::Owned(Vec::new()),
            })
        });

        // Accept, read, and answer.
        for _ in 0..3 {
            pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        }

        let mut buf = [0u8; 64];
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200 OK\r\n\r\n");
    }

    #[test]
    fn idle_slot_is_reaped() {
        let port = free_port();
        let mut pool = SlotPool::new(2, 8192, 5);
        pool.listen_tcp(port).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut handler: Box<Handler> = Box::new(|_req: &[u8]| None);
        pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        assert_eq!(pool.open_count(), 1);

        pool.close_idle(100);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn full_pool_sheds_new_connections_without_panicking() {
        let port = free_port();
        let mut pool = SlotPool::new(1, 8192, 30);
        pool.listen_tcp(port).unwrap();

        let _a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut handler: Box<Handler> = Box::new(|_req: &[u8]| None);
        pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        assert_eq!(pool.open_count(), 1);

        // Pool is full; a second connection attempt must not panic the loop.
        let _b = TcpStream::connect(("127.0.0.1", port));
        pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        assert_eq!(pool.open_count(), 1);
    }
}
