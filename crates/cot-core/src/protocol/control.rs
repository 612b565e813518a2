//! Relay-generated control events and their recognition.
//!
//! Control events are ordinary CoT events distinguished by type:
//!
//! | Type         | Meaning                                          |
//! |--------------|--------------------------------------------------|
//! | `t-x-takp-v` | server advertises the highest protocol version   |
//! | `t-x-takp-q` | client requests a protocol version               |
//! | `t-x-takp-r` | server accepts or refuses the request            |
//! | `t-x-c-t`    | ping; uid is `<base>-ping`                       |
//! | `t-x-c-t-r`  | pong, addressed to `<base>`                      |
//! | `t-x-d-d`    | remove the item named by the message's link      |
//!
//! Every builder returns a message stamped with the local scope so it
//! bypasses scope filtering on its way out.

use chrono::Duration;
use uuid::Uuid;

use crate::domain::detail::Node;
use crate::domain::event::CotEvent;
use crate::domain::message::CotMessage;

pub const VERSION_SUPPORT_TYPE: &str = "t-x-takp-v";
pub const VERSION_REQUEST_TYPE: &str = "t-x-takp-q";
pub const VERSION_RESPONSE_TYPE: &str = "t-x-takp-r";
pub const PING_TYPE: &str = "t-x-c-t";
pub const PONG_TYPE: &str = "t-x-c-t-r";
pub const REMOVE_TYPE: &str = "t-x-d-d";

/// Uid of every negotiation event.
pub const PROTO_UID: &str = "protouid";
/// Suffix a client appends to its own uid when pinging.
pub const PING_SUFFIX: &str = "-ping";

const TAK_CONTROL: &str = "TakControl";
const HOW_GENERATED: &str = "h-g-i-g-o";

// ── Builders ──────────────────────────────────────────────────────────────────

fn negotiation(event_type: &str, child: &str, attr: (&str, &str)) -> CotMessage {
    let event = CotEvent::basic(event_type, PROTO_UID, Duration::minutes(1));
    let mut detail = Node::detail();
    detail
        .add_child(TAK_CONTROL, &[], "")
        .add_child(child, &[attr], "");
    CotMessage::local(event, detail)
}

/// Server advertisement of the highest supported protocol version.
pub fn version_support(version: u32) -> CotMessage {
    negotiation(
        VERSION_SUPPORT_TYPE,
        "TakProtocolSupport",
        ("version", &version.to_string()),
    )
}

/// Client request to switch to `version`.
pub fn version_request(version: u32) -> CotMessage {
    negotiation(
        VERSION_REQUEST_TYPE,
        "TakRequest",
        ("version", &version.to_string()),
    )
}

/// Server answer to a version request.
pub fn version_response(accepted: bool) -> CotMessage {
    negotiation(
        VERSION_RESPONSE_TYPE,
        "TakResponse",
        ("status", if accepted { "true" } else { "false" }),
    )
}

/// Keep-alive sent by a client for its own `uid`.
pub fn ping(uid: &str) -> CotMessage {
    let event = CotEvent::basic(PING_TYPE, &format!("{uid}{PING_SUFFIX}"), Duration::seconds(10));
    CotMessage::local(event, Node::detail())
}

/// Answer to a ping from `base_uid` (the ping uid without its suffix).
pub fn pong(base_uid: &str) -> CotMessage {
    let mut event = CotEvent::basic(PONG_TYPE, base_uid, Duration::seconds(20));
    event.how = HOW_GENERATED.to_string();
    CotMessage::local(event, Node::detail())
}

/// Tells peers that item `uid` of type `item_type` is gone.
pub fn offline(uid: &str, item_type: &str) -> CotMessage {
    let mut event = CotEvent::basic(
        REMOVE_TYPE,
        &Uuid::new_v4().to_string(),
        Duration::minutes(3),
    );
    event.how = HOW_GENERATED.to_string();
    let mut detail = Node::detail();
    detail.add_pp_link(uid, item_type, "");
    CotMessage::local(event, detail)
}

/// Strips the ping suffix, if any.
pub fn base_uid(uid: &str) -> &str {
    uid.strip_suffix(PING_SUFFIX).unwrap_or(uid)
}

// ── Recognition ───────────────────────────────────────────────────────────────

/// A control event recognised by [`Control::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control<'a> {
    /// Highest version the server speaks; 0 when the attribute is missing.
    VersionSupport(u32),
    /// Requested version, `None` when absent or not a number.
    VersionRequest(Option<u32>),
    VersionResponse(bool),
    /// Ping from the peer whose uid is `base_uid`.
    Ping { base_uid: &'a str },
    Pong,
    /// Uid named by the first `p-p` link, or by the first link at all.
    RemoveLink { uid: Option<&'a str> },
}

impl<'a> Control<'a> {
    /// Recognises `msg` as a control event.  Returns `None` for ordinary
    /// traffic.
    pub fn classify(msg: &'a CotMessage) -> Option<Self> {
        let tak = || msg.detail.first(TAK_CONTROL);
        let control = match msg.event_type() {
            VERSION_SUPPORT_TYPE => Control::VersionSupport(
                tak()
                    .map(|t| t.child_attr("TakProtocolSupport", "version"))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            ),
            VERSION_REQUEST_TYPE => Control::VersionRequest(
                tak()
                    .map(|t| t.child_attr("TakRequest", "version"))
                    .and_then(|v| v.parse().ok()),
            ),
            VERSION_RESPONSE_TYPE => Control::VersionResponse(
                tak().map(|t| t.child_attr("TakResponse", "status")) == Some("true"),
            ),
            PING_TYPE => Control::Ping {
                base_uid: base_uid(msg.uid()),
            },
            PONG_TYPE => Control::Pong,
            REMOVE_TYPE => Control::RemoveLink {
                uid: msg
                    .first_link("p-p")
                    .or_else(|| msg.first_link(""))
                    .and_then(|l| l.attr("uid")),
            },
            _ => return None,
        };
        Some(control)
    }

    /// True for the three version negotiation events.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Control::VersionSupport(_) | Control::VersionRequest(_) | Control::VersionResponse(_)
        )
    }
}
