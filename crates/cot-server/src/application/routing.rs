//! RoutingHub: the registry of live sessions and the fan-out of messages.
//!
//! The hub never owns a session.  It keeps [`Weak`] references keyed by
//! session name, so a session that has torn itself down simply disappears
//! from routing even before it deregisters.
//!
//! # Delivery
//!
//! [`RoutingHub::dispatch`] picks the targets:
//!
//! - When the message lists destination callsigns (`<marti><dest/>`), every
//!   session tracking one of those callsigns gets it.
//! - Otherwise every session except the one it came from gets it.
//!
//! Each target decides for itself whether the message is visible (scope
//! policy) and which encoding to use (its negotiated protocol version).  The
//! [`Outbound`] wrapper encodes lazily and caches the bytes per version, so a
//! broadcast to a hundred binary sessions encodes once.

use std::cell::OnceCell;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cot_core::{Codec, CotMessage, PROTO_VERSION};
use dashmap::DashMap;
use tracing::{debug, warn};

// ── Outbound ──────────────────────────────────────────────────────────────────

/// A message on its way out, with its encodings cached per protocol
/// version for the duration of one dispatch.
pub struct Outbound<'a> {
    msg: &'a CotMessage,
    codec: &'a Codec,
    full: [OnceCell<Option<Bytes>>; 2],
    without_coords: [OnceCell<Option<Bytes>>; 2],
}

impl<'a> Outbound<'a> {
    pub fn new(msg: &'a CotMessage, codec: &'a Codec) -> Self {
        Self {
            msg,
            codec,
            full: [OnceCell::new(), OnceCell::new()],
            without_coords: [OnceCell::new(), OnceCell::new()],
        }
    }

    pub fn message(&self) -> &CotMessage {
        self.msg
    }

    /// Wire bytes for a peer speaking `version`; `None` if encoding failed.
    pub fn encoded(&self, version: u32) -> Option<Bytes> {
        self.full[slot(version)]
            .get_or_init(|| encode(self.codec, self.msg, version))
            .clone()
    }

    /// Wire bytes of a copy with its position reset, used when chat
    /// crosses scopes.
    pub fn encoded_without_coords(&self, version: u32) -> Option<Bytes> {
        self.without_coords[slot(version)]
            .get_or_init(|| encode(self.codec, &self.msg.clone_without_coords(), version))
            .clone()
    }
}

fn slot(version: u32) -> usize {
    usize::from(version >= PROTO_VERSION)
}

fn encode(codec: &Codec, msg: &CotMessage, version: u32) -> Option<Bytes> {
    match codec.encode_for(msg, version) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            warn!("cannot encode {} ({}) for v{version}: {e}", msg.uid(), msg.event_type());
            None
        }
    }
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// What the hub needs from a session.
pub trait Peer: Send + Sync {
    fn name(&self) -> &str;

    /// Queues `out` if the peer is active and allowed to see it.  Returns
    /// true when the message was queued.
    fn deliver(&self, out: &Outbound<'_>) -> bool;

    /// True if one of the peer's contacts uses `callsign`.
    fn has_callsign(&self, callsign: &str) -> bool;

    /// Asks the peer to close its transport.
    fn close(&self);
}

// ── RoutingHub ────────────────────────────────────────────────────────────────

/// Registry of live sessions and uid ownership.
pub struct RoutingHub {
    codec: Codec,
    peers: DashMap<String, Weak<dyn Peer>>,
    /// uid → name of the session that announced it.
    owners: DashMap<String, String>,
}

impl RoutingHub {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            peers: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Adds or replaces the session called `name`.
    pub fn register(&self, name: &str, peer: Weak<dyn Peer>) {
        if self.peers.insert(name.to_string(), peer).is_some() {
            warn!("session {name} registered twice; replacing");
        }
    }

    pub fn deregister(&self, name: &str) {
        self.peers.remove(name);
    }

    /// Records `session` as the owner of `uid`.  Returns the previous owner
    /// when the uid moved from another session.
    pub fn claim_uid(&self, uid: &str, session: &str) -> Option<String> {
        self.owners
            .insert(uid.to_string(), session.to_string())
            .filter(|prev| prev != session)
    }

    /// Releases `uid` if `session` still owns it.
    pub fn release_uid(&self, uid: &str, session: &str) -> bool {
        self.owners.remove_if(uid, |_, owner| owner == session).is_some()
    }

    pub fn owner_of(&self, uid: &str) -> Option<String> {
        self.owners.get(uid).map(|owner| owner.value().clone())
    }

    /// Routes `msg` to its destinations, or to everyone but its sender.
    /// Returns the number of sessions that queued it.
    pub fn dispatch(&self, msg: &CotMessage) -> usize {
        let dests = msg.dest_callsigns();
        if dests.is_empty() {
            return self.send_to_all_except(msg, &msg.from);
        }

        let out = Outbound::new(msg, &self.codec);
        let sent = self
            .live_peers()
            .iter()
            .filter(|peer| dests.iter().any(|cs| peer.has_callsign(cs)))
            .filter(|peer| peer.deliver(&out))
            .count();
        debug!("routed {} to {dests:?}: {sent} session(s)", msg.uid());
        sent
    }

    /// Sends `msg` to every session tracking `callsign`.
    pub fn send_to_callsign(&self, callsign: &str, msg: &CotMessage) -> usize {
        let out = Outbound::new(msg, &self.codec);
        self.live_peers()
            .iter()
            .filter(|peer| peer.has_callsign(callsign))
            .filter(|peer| peer.deliver(&out))
            .count()
    }

    /// Sends `msg` to every session not called `except`.
    pub fn send_to_all_except(&self, msg: &CotMessage, except: &str) -> usize {
        let out = Outbound::new(msg, &self.codec);
        self.live_peers()
            .iter()
            .filter(|peer| peer.name() != except)
            .filter(|peer| peer.deliver(&out))
            .count()
    }

    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Asks every registered session to close.
    pub fn close_all(&self) {
        for peer in self.live_peers() {
            peer.close();
        }
    }

    /// Snapshot of the sessions still alive.  Entries whose session has been
    /// dropped are pruned.
    fn live_peers(&self) -> Vec<Arc<dyn Peer>> {
        let mut live = Vec::with_capacity(self.peers.len());
        let mut dead = Vec::new();
        for entry in self.peers.iter() {
            match entry.value().upgrade() {
                Some(peer) => live.push(peer),
                None => dead.push(entry.key().clone()),
            }
        }
        for name in dead {
            self.peers.remove_if(&name, |_, weak| weak.strong_count() == 0);
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use cot_core::domain::{CotEvent, Node};
    use cot_core::XML_VERSION;

    /// Records every delivery instead of writing to a socket.
    struct RecordingPeer {
        name: String,
        callsigns: Vec<String>,
        version: u32,
        accept: bool,
        received: Mutex<Vec<Bytes>>,
        closed: Mutex<bool>,
    }

    impl RecordingPeer {
        fn new(name: &str, callsigns: &[&str]) -> Arc<Self> {
            Self::with_accept(name, callsigns, true)
        }

        fn with_accept(name: &str, callsigns: &[&str], accept: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                callsigns: callsigns.iter().map(|c| c.to_string()).collect(),
                version: XML_VERSION,
                accept,
                received: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    impl Peer for RecordingPeer {
        fn name(&self) -> &str {
            &self.name
        }

        fn deliver(&self, out: &Outbound<'_>) -> bool {
            if !self.accept {
                return false;
            }
            match out.encoded(self.version) {
                Some(bytes) => {
                    self.received.lock().unwrap().push(bytes);
                    true
                }
                None => false,
            }
        }

        fn has_callsign(&self, callsign: &str) -> bool {
            self.callsigns.iter().any(|c| c == callsign)
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn hub_with(peers: &[&Arc<RecordingPeer>]) -> RoutingHub {
        let hub = RoutingHub::new(Codec::default());
        for peer in peers {
            let weak: Weak<dyn Peer> = Arc::downgrade(*peer) as Weak<dyn Peer>;
            hub.register(&peer.name, weak);
        }
        hub
    }

    fn message(from: &str) -> CotMessage {
        let mut msg = CotMessage::new(
            CotEvent::basic("a-f-G-U-C", "uid-1", chrono::Duration::minutes(1)),
            Node::detail(),
        );
        msg.from = from.to_string();
        msg
    }

    fn with_dest(mut msg: CotMessage, callsigns: &[&str]) -> CotMessage {
        let mut marti = Node::new("marti");
        for cs in callsigns {
            marti.push_child(Node::new("dest").with_attr("callsign", *cs));
        }
        msg.detail.push_child(marti);
        msg
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let a = RecordingPeer::new("tcp:a", &["Alpha"]);
        let b = RecordingPeer::new("tcp:b", &["Bravo"]);
        let c = RecordingPeer::new("tcp:c", &[]);
        let hub = hub_with(&[&a, &b, &c]);

        assert_eq!(hub.dispatch(&message("tcp:a")), 2);
        assert_eq!(a.count(), 0);
        assert_eq!(b.count(), 1);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn test_destination_routing_reaches_only_matching_sessions() {
        let a = RecordingPeer::new("tcp:a", &["Alpha"]);
        let b = RecordingPeer::new("tcp:b", &["Bravo"]);
        let c = RecordingPeer::new("tcp:c", &["Charlie", "Delta"]);
        let hub = hub_with(&[&a, &b, &c]);

        let msg = with_dest(message("tcp:a"), &["Charlie", "Delta"]);
        assert_eq!(hub.dispatch(&msg), 1);
        assert_eq!(c.count(), 1, "one copy even with two matching callsigns");
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn test_unknown_destination_is_dropped() {
        let a = RecordingPeer::new("tcp:a", &["Alpha"]);
        let hub = hub_with(&[&a]);
        let msg = with_dest(message("tcp:x"), &["Nobody"]);
        assert_eq!(hub.dispatch(&msg), 0);
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn test_send_to_callsign() {
        let a = RecordingPeer::new("tcp:a", &["Alpha"]);
        let b = RecordingPeer::new("tcp:b", &["Bravo"]);
        let hub = hub_with(&[&a, &b]);
        assert_eq!(hub.send_to_callsign("Bravo", &message("")), 1);
        assert_eq!(b.count(), 1);
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn test_refusing_peer_is_not_counted() {
        let a = RecordingPeer::new("tcp:a", &[]);
        let b = RecordingPeer::with_accept("tcp:b", &[], false);
        let hub = hub_with(&[&a, &b]);
        assert_eq!(hub.send_to_all_except(&message(""), ""), 1);
    }

    #[test]
    fn test_dropped_session_is_pruned() {
        let a = RecordingPeer::new("tcp:a", &[]);
        let b = RecordingPeer::new("tcp:b", &[]);
        let hub = hub_with(&[&a, &b]);
        drop(b);

        assert_eq!(hub.dispatch(&message("")), 1);
        assert_eq!(hub.session_names(), ["tcp:a"]);
    }

    #[test]
    fn test_register_and_deregister() {
        let a = RecordingPeer::new("tcp:a", &[]);
        let hub = hub_with(&[&a]);
        assert_eq!(hub.len(), 1);
        hub.deregister("tcp:a");
        assert!(hub.is_empty());
    }

    #[test]
    fn test_uid_ownership() {
        let hub = RoutingHub::new(Codec::default());
        assert_eq!(hub.claim_uid("u1", "tcp:a"), None);
        assert_eq!(hub.claim_uid("u1", "tcp:a"), None);
        assert_eq!(hub.owner_of("u1").as_deref(), Some("tcp:a"));

        assert_eq!(hub.claim_uid("u1", "tcp:b").as_deref(), Some("tcp:a"));
        assert!(!hub.release_uid("u1", "tcp:a"), "only the owner may release");
        assert!(hub.release_uid("u1", "tcp:b"));
        assert_eq!(hub.owner_of("u1"), None);
    }

    #[test]
    fn test_close_all() {
        let a = RecordingPeer::new("tcp:a", &[]);
        let hub = hub_with(&[&a]);
        hub.close_all();
        assert!(*a.closed.lock().unwrap());
    }

    #[test]
    fn test_outbound_caches_per_version() {
        let codec = Codec::default();
        let msg = message("");
        let out = Outbound::new(&msg, &codec);

        let xml = out.encoded(XML_VERSION).unwrap();
        let bin = out.encoded(PROTO_VERSION).unwrap();
        assert_eq!(xml[0], b'<');
        assert_eq!(bin[0], cot_core::protocol::MAGIC);
        // Same allocation on the second call.
        assert_eq!(out.encoded(XML_VERSION).unwrap().as_ptr(), xml.as_ptr());
    }

    #[test]
    fn test_outbound_without_coords() {
        let codec = Codec::default();
        let mut msg = message("");
        msg.event.lat = 10.5;
        let out = Outbound::new(&msg, &codec);

        let stripped = out.encoded_without_coords(XML_VERSION).unwrap();
        let decoded = codec.decode_xml("event", &stripped).unwrap();
        assert_eq!(decoded.lat_lon(), (0.0, 0.0));
        assert_eq!(out.message().event.lat, 10.5);
    }
}
