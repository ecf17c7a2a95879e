//! Demonstration harness: wires the resolver, peer registry, and slot
//! reactor together over a loopback listener, the way a supernode process
//! would. It answers every request with a trivial `200 OK` — it does not
//! implement the edge/supernode packet protocol, which lives outside this
//! crate's scope.

use std::path::PathBuf;
use std::time::Duration;

use n3n_core::clock;
use n3n_core::config::CoreConfig;
use n3n_core::mac::MacAddr;
use n3n_core::peer::PeerRegistry;
use n3n_core::reactor::{Reply, ReplyBody, SlotPool};
use n3n_core::resolver::{supernode_parse, Resolver, SupernodeSpec};

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::from_path(&PathBuf::from(path)).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            CoreConfig::default()
        }),
        None => CoreConfig::default(),
    };

    let supernodes: Vec<SupernodeSpec> = config
        .resolver
        .supernodes
        .iter()
        .filter_map(|spec| match supernode_parse(spec) {
            Ok(sn) => Some(sn),
            Err(e) => {
                tracing::warn!(spec = %spec, error = %e, "skipping malformed supernode spec");
                None
            }
        })
        .collect();

    // Placeholder peer per supernode, keyed by a synthetic locally-administered
    // MAC (real edge MACs aren't known yet); bound to its resolver entry so
    // `check()` knows which registry entry to publish resolved sockets into.
    let mut peers = PeerRegistry::new();
    let mut macs = Vec::with_capacity(supernodes.len());
    for (i, sn) in supernodes.iter().enumerate() {
        let mac = MacAddr::new([0x02, 0, 0, 0, 0, i as u8]);
        peers.insert_with_hostname(mac, Default::default(), sn.host.clone());
        macs.push(mac);
    }

    let mut resolver = if supernodes.is_empty() {
        Resolver::create_degraded(&supernodes, now())
    } else {
        Resolver::create(&supernodes, n3n_core::resolver::StdResolve, now())
    };
    for (i, mac) in macs.iter().enumerate() {
        resolver.bind_entry(i, *mac);
    }

    let mut pool = SlotPool::new(config.reactor.slots, config.reactor.request_max, config.reactor.idle_timeout_secs);
    if let Err(e) = pool.listen_tcp(config.reactor.listen_port) {
        tracing::error!(error = %e, "failed to bind listener");
        return;
    }
    tracing::info!(port = config.reactor.listen_port, "slot reactor listening");

    let mut requires_resolution = !supernodes.is_empty();
    loop {
        requires_resolution = resolver.check(&mut peers, requires_resolution, now());

        let stamp = clock::time_stamp();
        let mut handler = |_req: &[u8]| {
            tracing::trace!(stamp, "answering request");
            Some(Reply {
                header: b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
                body: ReplyBody::Owned(Vec::new()),
            })
        };
        if let Err(e) = pool.poll_once(Duration::from_millis(500), &mut handler, now()) {
            tracing::warn!(error = %e, "reactor poll failed");
        }
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
