//! Peer registry: MAC-keyed peer records with socket-identity reconciliation.

use std::collections::HashMap;

use crate::mac::MacAddr;
use crate::sockaddr::SockAddr;

/// Selection-criterion score. Opaque to the core — callers (edge/supernode
/// selection policy) assign meaning to it; the registry only resets it to
/// `Default::default()` on creation.
pub type SelectionCriterion = u32;

#[derive(Debug, Clone)]
pub struct Peer {
    mac: MacAddr,
    sock: SockAddr,
    selection: SelectionCriterion,
    /// Original hostname this peer (a supernode) was configured with, if any.
    hostname: Option<String>,
}

impl Peer {
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn sock(&self) -> SockAddr {
        self.sock
    }

    pub fn selection(&self) -> SelectionCriterion {
        self.selection
    }

    pub fn set_selection(&mut self, value: SelectionCriterion) {
        self.selection = value;
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn set_sock(&mut self, sock: SockAddr) {
        self.sock = sock;
    }
}

/// Whether `add_or_find` should allocate a new peer on a full miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    Add,
    NoAdd,
    /// Out parameter: set by `add_or_find` when it allocated a new peer.
    Added,
}

/// MAC -> Peer mapping with reconciliation between MAC identity and socket
/// identity. See `add_or_find` for the promotion rule.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<MacAddr, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn get(&self, mac: &MacAddr) -> Option<&Peer> {
        self.peers.get(mac)
    }

    pub fn get_mut(&mut self, mac: &MacAddr) -> Option<&mut Peer> {
        self.peers.get_mut(mac)
    }

    pub fn remove(&mut self, mac: &MacAddr) -> Option<Peer> {
        self.peers.remove(mac)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddr, &Peer)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Inserts a peer carrying a known hostname (used for supernode entries
    /// seeded by the resolver). Bypasses reconciliation: callers are expected
    /// to use this only at startup, before a MAC is known for the peer.
    pub fn insert_with_hostname(&mut self, mac: MacAddr, sock: SockAddr, hostname: String) {
        self.peers.insert(
            mac,
            Peer {
                mac,
                sock,
                selection: SelectionCriterion::default(),
                hostname: Some(hostname),
            },
        );
    }

    /// Finds or creates the peer that owns `sock`/`mac`, reconciling the two
    /// identities when they disagree.
    ///
    /// Rules, in order:
    /// 1. If `mac` is non-null, look up by MAC; a hit returns immediately
    ///    (the socket is *not* refreshed here — callers update it separately).
    /// 2. Otherwise (or on miss), scan for a peer whose socket equals `sock`.
    ///    If found and `mac` is non-null, promote it: remove under its old
    ///    (possibly null) MAC key, overwrite the MAC, and reinsert under the
    ///    new key — MAC is the hash key and must never be mutated in place.
    /// 3. If still not found and `mode == Add`, allocate a new peer and
    ///    report `AddMode::Added`.
    /// 4. Otherwise, no match: returns `None`.
    ///
    /// Returns the resulting peer's key rather than a `&Peer` directly: the
    /// promotion path needs a remove-then-reinsert, so any borrow taken
    /// before that point would outlive the mutation. Callers that want the
    /// peer itself follow up with `get(&key)`.
    pub fn add_or_find(&mut self, sock: SockAddr, mac: MacAddr, mode: &mut AddMode) -> Option<MacAddr> {
        let mac_known = !mac.is_null();

        if mac_known && self.peers.contains_key(&mac) {
            return Some(mac);
        }

        let found_key = self.peers.iter().find(|(_, p)| p.sock == sock).map(|(k, _)| *k);

        if let Some(found_key) = found_key {
            if mac_known && found_key != mac {
                let mut peer = self.peers.remove(&found_key).expect("key came from iter");
                peer.mac = mac;
                self.peers.insert(mac, peer);
                return Some(mac);
            }
            return Some(found_key);
        }

        if *mode == AddMode::Add {
            let key = if mac_known { mac } else { MacAddr::default() };
            self.peers.insert(
                key,
                Peer {
                    mac: key,
                    sock,
                    selection: SelectionCriterion::default(),
                    hostname: None,
                },
            );
            *mode = AddMode::Added;
            return Some(key);
        }

        None
    }
}
