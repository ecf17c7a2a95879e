//! Listening-socket setup: dual-stack TCP with IPv4 fallback, and (on unix)
//! a filesystem-pathed local socket with optional mode/uid/gid.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;

/// Deliberately low: once the slot pool is full, a short backlog sheds load
/// instead of queuing an unbounded number of pending connections.
pub const LISTEN_BACKLOG: i32 = 1;

/// Binds `0.0.0.0`/`[::]`:`port`, preferring an IPv6 dual-stack socket
/// (`IPV6_V6ONLY=0`) and falling back to IPv4-only if the dual-stack bind
/// fails (e.g. a kernel or sysctl that doesn't support it).
pub fn bind_dual_stack(port: u16) -> Result<TcpListener, Error> {
    bind_v6(port)
        .or_else(|_| bind_v4(port))
        .map_err(|source| Error::Transport {
            op: "listen",
            source,
        })
}

fn bind_v6(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_v4(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(unix)]
pub mod local {
    use std::ffi::CString;
    use std::fs;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixListener;
    use std::path::Path;

    use crate::error::Error;

    use super::LISTEN_BACKLOG;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct LocalListenerOpts {
        pub mode: Option<u32>,
        pub uid: Option<u32>,
        pub gid: Option<u32>,
    }

    /// Removes any stale socket file at `path`, binds a `SOCK_STREAM` unix
    /// socket there with an explicit `listen(1)` backlog (std's
    /// `UnixListener::bind` doesn't expose the backlog, so this goes through
    /// raw `libc` calls, matching the low backlog used by the TCP listener),
    /// and applies `mode`/`uid`/`gid` if given.
    pub fn bind(path: &Path, opts: &LocalListenerOpts) -> Result<UnixListener, Error> {
        let _ = fs::remove_file(path);

        let path_bytes = path.as_os_str().as_bytes();
        // Reserve one byte for the NUL terminator within `sun_path`.
        if path_bytes.len() >= 108 {
            return Err(Error::Transport {
                op: "unix bind",
                source: io::Error::new(io::ErrorKind::InvalidInput, "path too long for sun_path"),
            });
        }
        let cpath = CString::new(path_bytes)
            .map_err(|_| Error::Transport {
                op: "unix bind",
                source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
            })?;

        // SAFETY: a fresh AF_UNIX/SOCK_STREAM socket with no special options.
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::Transport {
                op: "unix socket",
                source: io::Error::last_os_error(),
            });
        }

        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let src = cpath.as_bytes_with_nul();
        for (dst, byte) in addr.sun_path.iter_mut().zip(src.iter()) {
            *dst = *byte as libc::c_char;
        }
        let addr_len = std::mem::size_of::<libc::sa_family_t>() + src.len();

        // SAFETY: `addr` is a fully initialized `sockaddr_un` of the computed length.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len as libc::socklen_t,
            )
        };
        if rc != 0 {
            return fail(fd, "unix bind");
        }

        if let Some(mode) = opts.mode {
            // SAFETY: `fd` is the socket just bound above, still owned here.
            if unsafe { libc::fchmod(fd, mode as libc::mode_t) } != 0 {
                return fail(fd, "fchmod");
            }
        }
        if opts.uid.is_some() || opts.gid.is_some() {
            let uid = opts.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
            let gid = opts.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
            // SAFETY: same fd; passing `u32::MAX` for either id leaves it
            // unchanged, per chown(2).
            if unsafe { libc::fchown(fd, uid, gid) } != 0 {
                return fail(fd, "fchown");
            }
        }

        // SAFETY: `fd` is bound and still open.
        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } != 0 {
            return fail(fd, "unix listen");
        }

        // SAFETY: `fd` is a bound, listening AF_UNIX/SOCK_STREAM socket we
        // own exclusively; `UnixListener` takes over the descriptor.
        let listener = unsafe { UnixListener::from_raw_fd(fd) };
        listener.set_nonblocking(true).map_err(|source| Error::Transport {
            op: "unix nonblocking",
            source,
        })?;
        Ok(listener)
    }

    fn fail<T>(fd: libc::c_int, op: &'static str) -> Result<T, Error> {
        let source = io::Error::last_os_error();
        // SAFETY: `fd` was opened just above in `bind` and not yet handed to
        // a `UnixListener`, so closing it here is the only owner's call.
        unsafe { libc::close(fd) };
        Err(Error::Transport { op, source })
    }
}
