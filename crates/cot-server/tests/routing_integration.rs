//! Integration tests for routing between sessions.
//!
//! Several sessions share one [`RoutingHub`] and the production
//! [`RelayHandler`], each on its own in-memory duplex pipe.  The tests check
//! who receives what:
//!
//! - scope visibility (the blue / red / blue scenario);
//! - explicit destinations by callsign;
//! - chat crossing scopes with coordinates removed when enabled.

use std::sync::Arc;
use std::time::Duration;

use cot_core::domain::{CotEvent, Node};
use cot_core::protocol::TagReader;
use cot_core::{Codec, CotMessage};
use cot_server::application::relay::RelayHandler;
use cot_server::application::routing::RoutingHub;
use cot_server::application::scope::{Access, DefaultScopePolicy};
use cot_server::infrastructure::network::session::{
    Role, Session, SessionContext, SessionSettings,
};
use tokio::io::{duplex, split, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    codec: Codec,
    _session: Arc<Session>,
}

impl Client {
    /// Connects a markup client in `scope` and consumes the advertisement.
    async fn connect(ctx: &SessionContext, name: &str, scope: &str) -> Self {
        let (remote, local) = duplex(64 * 1024);
        let session = Session::start(local, name, Role::Server, Access::new(name, scope), ctx);
        let (reader, writer) = split(remote);
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            codec: Codec::default(),
            _session: session,
        };
        let _support = client.recv().await;
        client
    }

    async fn send(&mut self, msg: &CotMessage) {
        let bytes = self.codec.encode_xml(msg).expect("encode");
        self.writer.write_all(&bytes).await.expect("write");
    }

    async fn recv(&mut self) -> CotMessage {
        let tag = timeout(Duration::from_secs(2), TagReader::new(&mut self.reader).read_tag())
            .await
            .expect("timed out waiting for an event")
            .expect("read");
        self.codec.decode_xml(&tag.name, &tag.data).expect("decode")
    }

    async fn is_silent(&mut self) -> bool {
        timeout(Duration::from_millis(200), TagReader::new(&mut self.reader).read_tag())
            .await
            .is_err()
    }
}

fn relay_context(settings: SessionSettings) -> SessionContext {
    let hub = Arc::new(RoutingHub::new(Codec::default()));
    SessionContext {
        hub: Arc::clone(&hub),
        handler: Arc::new(RelayHandler::new(hub)),
        policy: Arc::new(DefaultScopePolicy),
        settings,
        local_uid: "relay-test".to_string(),
    }
}

fn position(uid: &str) -> CotMessage {
    let mut msg = CotMessage::new(
        CotEvent::basic("a-h-G", uid, chrono::Duration::minutes(5)),
        Node::detail(),
    );
    msg.event.lat = 45.5;
    msg.event.lon = -122.5;
    msg
}

fn contact(uid: &str, callsign: &str) -> CotMessage {
    let detail = Node::detail_from_str(&format!(
        r#"<contact endpoint="*:-1:stcp" callsign="{callsign}"/>"#
    ))
    .unwrap();
    CotMessage::new(
        CotEvent::basic("a-f-G-U-C", uid, chrono::Duration::minutes(5)),
        detail,
    )
}

fn chat_to(uid: &str, dest_callsign: Option<&str>) -> CotMessage {
    let fragment = match dest_callsign {
        Some(callsign) => format!(
            r#"<__chat chatroom="{callsign}"/><marti><dest callsign="{callsign}"/></marti>"#
        ),
        None => r#"<__chat chatroom="All Chat Rooms"/>"#.to_string(),
    };
    let mut msg = CotMessage::new(
        CotEvent::basic("b-t-f", uid, chrono::Duration::minutes(5)),
        Node::detail_from_str(&fragment).unwrap(),
    );
    msg.event.lat = 45.5;
    msg.event.lon = -122.5;
    msg
}

// ── Scope visibility ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_blue_red_blue_scope_isolation() {
    // Arrange
    let ctx = relay_context(SessionSettings::default());
    let mut blue1 = Client::connect(&ctx, "tcp:blue1", "blue").await;
    let mut red = Client::connect(&ctx, "tcp:red", "red").await;
    let mut blue2 = Client::connect(&ctx, "tcp:blue2", "blue").await;

    // Act: blue1 announces itself
    blue1.send(&contact("B1", "Blue-1")).await;

    // Assert: only the other blue session gets it, with the uid bound to blue1
    let received = blue2.recv().await;
    assert_eq!(received.uid(), "B1");
    assert_eq!(received.event_type(), "a-f-G-U-C");
    assert_eq!(ctx.hub.owner_of("B1").as_deref(), Some("tcp:blue1"));
    assert!(red.is_silent().await, "red must not see blue traffic");
    assert!(blue1.is_silent().await, "sender must not get its own event");

    // Act: red reports a position
    red.send(&position("R1")).await;

    // Assert: no blue session sees it
    assert!(blue1.is_silent().await);
    assert!(blue2.is_silent().await);
}

#[tokio::test]
async fn test_unscoped_sessions_see_each_other() {
    let ctx = relay_context(SessionSettings::default());
    let mut a = Client::connect(&ctx, "tcp:a", "").await;
    let mut b = Client::connect(&ctx, "tcp:b", "").await;

    a.send(&position("A1")).await;

    let received = b.recv().await;
    assert_eq!(received.uid(), "A1");
    assert_eq!(received.event.lat, 45.5);
}

// ── Destinations ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_with_destination_reaches_only_that_callsign() {
    // Arrange: three unscoped clients, bravo announces itself
    let ctx = relay_context(SessionSettings::default());
    let mut alpha = Client::connect(&ctx, "tcp:alpha", "").await;
    let mut bravo = Client::connect(&ctx, "tcp:bravo", "").await;
    let mut charlie = Client::connect(&ctx, "tcp:charlie", "").await;

    bravo.send(&contact("BRAVO-UID", "Bravo")).await;
    assert_eq!(alpha.recv().await.uid(), "BRAVO-UID");
    assert_eq!(charlie.recv().await.uid(), "BRAVO-UID");

    // Act: alpha writes to Bravo
    alpha.send(&chat_to("GeoChat.alpha.Bravo.1", Some("Bravo"))).await;

    // Assert
    let received = bravo.recv().await;
    assert_eq!(received.uid(), "GeoChat.alpha.Bravo.1");
    assert_eq!(received.dest_callsigns(), ["Bravo"]);
    assert!(charlie.is_silent().await, "charlie is not a recipient");
    assert!(alpha.is_silent().await);
}

#[tokio::test]
async fn test_destination_to_unknown_callsign_is_dropped() {
    let ctx = relay_context(SessionSettings::default());
    let mut alpha = Client::connect(&ctx, "tcp:alpha", "").await;
    let mut bravo = Client::connect(&ctx, "tcp:bravo", "").await;

    alpha.send(&chat_to("GeoChat.alpha.Nobody.1", Some("Nobody"))).await;

    assert!(bravo.is_silent().await);
}

// ── Interscope chat ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_interscope_chat_arrives_without_coordinates() {
    // Arrange
    let settings = SessionSettings {
        interscope_chat: true,
        ..SessionSettings::default()
    };
    let ctx = relay_context(settings);
    let mut blue = Client::connect(&ctx, "tcp:blue", "blue").await;
    let mut red = Client::connect(&ctx, "tcp:red", "red").await;

    // Act
    red.send(&chat_to("GeoChat.red.All.1", None)).await;
    red.send(&position("R1")).await;

    // Assert: chat crosses with the position cleared, the position does not
    let chat = blue.recv().await;
    assert_eq!(chat.event_type(), "b-t-f");
    assert_eq!(chat.event.lat, 0.0);
    assert_eq!(chat.event.lon, 0.0);
    assert!(blue.is_silent().await);
}
