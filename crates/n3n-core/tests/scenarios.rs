//! End-to-end scenarios against the public API, covering the literal
//! examples the core's design is checked against.

use n3n_core::clock;
use n3n_core::mac::{macaddr_str, str2mac, MacAddr};
use n3n_core::sockaddr::{intoa, sock_to_cstr, SockAddr};

#[test]
fn ip_string_prints_least_significant_octet_first() {
    assert_eq!(intoa(0x0A0B0C0D), "13.12.11.10");
}

#[test]
fn mac_round_trips_through_string() {
    let m = MacAddr::new([0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x10]);
    assert_eq!(macaddr_str(&m), "DE:AD:BE:EF:01:10");
    assert_eq!(str2mac("DE:AD:BE:EF:01:10").unwrap(), m);
}

#[test]
fn subnet_mask_examples_match() {
    use n3n_core::sockaddr::{bitlen2mask, mask2bitlen};
    assert_eq!(bitlen2mask(24), 0xFFFFFF00);
    assert_eq!(mask2bitlen(0xFFFFFF00), 24);
}

#[test]
fn socket_prints_ipv4_host_port() {
    let s = SockAddr::new_v4([192, 168, 1, 2], 5644);
    assert_eq!(sock_to_cstr(&s), "192.168.1.2:5644");
}

#[test]
fn replay_stamp_accepts_once_then_rejects_the_repeat() {
    let mut prev = 0u64;
    let stamp = clock::time_stamp();
    assert!(clock::verify_and_update(stamp, Some(&mut prev), false));
    assert!(!clock::verify_and_update(stamp, Some(&mut prev), false));
}

#[cfg(unix)]
mod reactor_framing {
    use n3n_core::reactor::{Handler, Reply, ReplyBody, SlotPool};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn header_only_request_reaches_ready_without_a_body() {
        let port = free_port();
        let mut pool = SlotPool::new(4, 8192, 30);
        pool.listen_tcp(port).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

        let mut handler: Box<Handler> = Box::new(|req: &[u8]| {
            assert_eq!(req, b"GET / HTTP/1.0\r\n\r\n");
            Some(Reply {
                header: b"HTTP/1.0 200 OK\r\n\r\n".to_vec(),
                body: ReplyBody::Owned(Vec::new()),
            })
        });

        for _ in 0..3 {
            pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        }

        let mut buf = [0u8; 64];
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200 OK\r\n\r\n");
    }

    #[test]
    fn request_with_body_waits_for_all_content_length_bytes() {
        let port = free_port();
        let mut pool = SlotPool::new(4, 8192, 30);
        pool.listen_tcp(port).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Write the header first, then the body in a second write, to
        // exercise the "stay Reading until the body arrives" transition.
        client.write_all(b"POST / HTTP/1.0\r\nContent-Length: 5\r\n\r\n").unwrap();

        let mut seen = false;
        let mut handler: Box<Handler> = Box::new(|req: &[u8]| {
            seen = true;
            assert!(req.ends_with(b"HELLO"));
            Some(Reply {
                header: b"HTTP/1.0 200 OK\r\n\r\n".to_vec(),
                body: ReplyBody::FromRequest,
            })
        });

        pool.poll_once(Duration::from_millis(100), &mut handler, 1).unwrap();
        assert!(!seen, "must not be ready before the body arrives");

        client.write_all(b"HELLO").unwrap();
        for _ in 0..3 {
            pool.poll_once(Duration::from_millis(200), &mut handler, 1).unwrap();
        }
        assert!(seen);
    }
}
