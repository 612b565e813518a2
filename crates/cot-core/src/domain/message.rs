//! In-process envelope for one decoded event.
//!
//! A [`CotMessage`] pairs the fixed-schema [`CotEvent`] with the parsed
//! [`Node`] tree of every detail element the schema does not cover, plus the
//! routing metadata the relay attaches on receipt (`from`, `scope`).
//!
//! The tree is the source of truth for the non-structured detail: the
//! `xml_detail` string inside the event is regenerated from it whenever the
//! message is turned back into a [`TakMessage`].

use chrono::{DateTime, Utc};

use crate::domain::detail::{DetailError, Node};
use crate::domain::event::{CotEvent, Detail, TakControl, TakMessage, Takv};
use crate::domain::filter::match_any_pattern;

/// `from` value of messages produced by the relay itself.
pub const LOCAL_FROM: &str = "local";
/// Scope of messages produced by the relay itself; bypasses scope checks.
pub const LOCAL_SCOPE: &str = "local";
/// Scope visible to every session.
pub const BROADCAST_SCOPE: &str = "broadcast";

const CHAT_TYPE: &str = "b-t-f";
const CHAT_RECEIPT_TYPES: [&str; 5] = ["b-t-f-d", "b-t-f-p", "b-t-f-r", "b-t-f-s", "b-t-f-u"];
const FILE_TRANSFER_TYPES: [&str; 2] = ["b-f-t-r", "b-f-t-a"];
const CONTROL_PATTERNS: [&str; 8] = [
    "t-b", "t-b-a", "t-b-c", "t-b-q", "t-x-takp-q", "t-x-c-m", "t-x-c-i-e", "t-x-c-i-d",
];

/// A decoded event plus relay metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CotMessage {
    /// Name of the session the message arrived on, or [`LOCAL_FROM`].
    pub from: String,
    /// Scope assigned by the receiving session.
    pub scope: String,
    /// Negotiation header, only present on binary envelopes that carry one.
    pub control: Option<TakControl>,
    pub event: CotEvent,
    /// Non-structured detail elements under a `<detail>` root.
    pub detail: Node,
}

impl CotMessage {
    /// Wraps an event and its detail tree with empty routing metadata.
    pub fn new(event: CotEvent, detail: Node) -> Self {
        Self {
            from: String::new(),
            scope: String::new(),
            control: None,
            event,
            detail,
        }
    }

    /// A message originating from the relay itself.
    pub fn local(event: CotEvent, detail: Node) -> Self {
        Self {
            from: LOCAL_FROM.to_string(),
            scope: LOCAL_SCOPE.to_string(),
            ..Self::new(event, detail)
        }
    }

    /// Builds a message from a binary envelope, parsing its `xml_detail`.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError`] when `xml_detail` is not well-formed markup.
    pub fn from_tak_message(msg: TakMessage) -> Result<Self, DetailError> {
        let event = msg.cot_event.unwrap_or_default();
        let xml = event
            .detail
            .as_ref()
            .map(|d| d.xml_detail.as_str())
            .unwrap_or_default();
        let detail = Node::detail_from_str(xml)?;
        Ok(Self {
            control: msg.tak_control,
            ..Self::new(event, detail)
        })
    }

    /// Produces the binary envelope with `xml_detail` regenerated from the
    /// detail tree.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError`] if the tree cannot be rendered.
    pub fn to_tak_message(&self) -> Result<TakMessage, DetailError> {
        let mut event = self.event.clone();
        let xml = self.detail.inner_xml()?;
        let mut detail = event.detail.take().unwrap_or_default();
        detail.xml_detail = xml;
        event.detail = (!detail.is_empty()).then_some(detail);
        Ok(TakMessage {
            tak_control: self.control.clone(),
            cot_event: Some(event),
        })
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    pub fn uid(&self) -> &str {
        &self.event.uid
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    fn structured(&self) -> Option<&Detail> {
        self.event.detail.as_ref()
    }

    /// Structured callsign, falling back to the `contact` element.
    pub fn callsign(&self) -> &str {
        self.structured()
            .and_then(|d| d.contact.as_ref())
            .map(|c| c.callsign.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.detail.child_attr("contact", "callsign"))
    }

    /// Structured endpoint, falling back to the `contact` element.
    pub fn endpoint(&self) -> &str {
        self.structured()
            .and_then(|d| d.contact.as_ref())
            .map(|c| c.endpoint.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.detail.child_attr("contact", "endpoint"))
    }

    pub fn team(&self) -> &str {
        self.structured()
            .and_then(|d| d.group.as_ref())
            .map(|g| g.name.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.detail.child_attr("__group", "name"))
    }

    pub fn role(&self) -> &str {
        self.structured()
            .and_then(|d| d.group.as_ref())
            .map(|g| g.role.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.detail.child_attr("__group", "role"))
    }

    pub fn takv(&self) -> Option<Takv> {
        if let Some(takv) = self.structured().and_then(|d| d.takv.clone()) {
            return Some(takv);
        }
        self.detail.first("takv").map(|n| Takv {
            device: n.attr("device").unwrap_or_default().to_string(),
            platform: n.attr("platform").unwrap_or_default().to_string(),
            os: n.attr("os").unwrap_or_default().to_string(),
            version: n.attr("version").unwrap_or_default().to_string(),
        })
    }

    pub fn lat_lon(&self) -> (f64, f64) {
        (self.event.lat, self.event.lon)
    }

    pub fn stale_at(&self) -> DateTime<Utc> {
        self.event.stale_at()
    }

    // ── Classification ────────────────────────────────────────────────────────

    /// Friendly unit with an endpoint: a live, addressable peer.
    pub fn is_contact(&self) -> bool {
        self.event_type().starts_with("a-f-") && !self.endpoint().is_empty()
    }

    pub fn is_chat(&self) -> bool {
        self.event_type() == CHAT_TYPE
    }

    pub fn is_chat_receipt(&self) -> bool {
        CHAT_RECEIPT_TYPES.contains(&self.event_type())
    }

    pub fn is_file_transfer(&self) -> bool {
        FILE_TRANSFER_TYPES.contains(&self.event_type())
    }

    /// Ping or pong.
    pub fn is_ping(&self) -> bool {
        matches!(self.event_type(), "t-x-c-t" | "t-x-c-t-r")
    }

    /// Server/tasking control traffic that is not a map item.
    pub fn is_control(&self) -> bool {
        match_any_pattern(self.event_type(), &CONTROL_PATTERNS)
    }

    pub fn is_local(&self) -> bool {
        self.scope == LOCAL_SCOPE
    }

    // ── Detail helpers ────────────────────────────────────────────────────────

    /// Callsigns of explicit recipients.
    pub fn dest_callsigns(&self) -> Vec<String> {
        self.detail.dest_callsigns()
    }

    /// First `link` child with `relation`, or the first link at all when
    /// `relation` is empty.
    pub fn first_link(&self, relation: &str) -> Option<&Node> {
        self.detail
            .all("link")
            .find(|l| relation.is_empty() || l.attr("relation") == Some(relation))
    }

    /// `(uid, parent_callsign)` of the parent-point link, if any.
    pub fn parent(&self) -> Option<(&str, &str)> {
        self.first_link("p-p").map(|l| {
            (
                l.attr("uid").unwrap_or_default(),
                l.attr("parent_callsign").unwrap_or_default(),
            )
        })
    }

    /// Copy with position reset to the null island; used when chat crosses
    /// scopes.
    pub fn clone_without_coords(&self) -> Self {
        let mut copy = self.clone();
        copy.event.clear_coords();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::Contact;
    use chrono::Duration;

    fn contact_msg(endpoint: &str) -> CotMessage {
        let mut event = CotEvent::basic("a-f-G-U-C", "uid-1", Duration::minutes(1));
        event.detail = Some(Detail {
            contact: Some(Contact {
                endpoint: endpoint.to_string(),
                callsign: "Alpha".to_string(),
            }),
            ..Detail::default()
        });
        CotMessage::new(event, Node::detail())
    }

    #[test]
    fn test_is_contact_requires_endpoint() {
        assert!(contact_msg("*:-1:stcp").is_contact());
        assert!(!contact_msg("").is_contact());
    }

    #[test]
    fn test_callsign_falls_back_to_detail() {
        let mut detail = Node::detail();
        detail.add_child("contact", &[("callsign", "Bravo")], "");
        let msg = CotMessage::new(CotEvent::default(), detail);
        assert_eq!(msg.callsign(), "Bravo");
        assert_eq!(contact_msg("x").callsign(), "Alpha");
    }

    #[test]
    fn test_chat_classification() {
        let mut msg = CotMessage::new(CotEvent::default(), Node::detail());
        msg.event.event_type = "b-t-f".to_string();
        assert!(msg.is_chat());
        assert!(!msg.is_chat_receipt());
        msg.event.event_type = "b-t-f-r".to_string();
        assert!(msg.is_chat_receipt());
    }

    #[test]
    fn test_version_request_counts_as_control() {
        let mut msg = CotMessage::new(CotEvent::default(), Node::detail());
        msg.event.event_type = "t-x-takp-q".to_string();
        assert!(msg.is_control());
        msg.event.event_type = "a-f-G".to_string();
        assert!(!msg.is_control());
    }

    #[test]
    fn test_parent_uses_pp_link() {
        let mut detail = Node::detail();
        detail.add_child("link", &[("uid", "other"), ("relation", "none")], "");
        detail.add_pp_link("parent", "a-f-G", "Papa");
        let msg = CotMessage::new(CotEvent::default(), detail);
        assert_eq!(msg.parent(), Some(("parent", "Papa")));
        assert_eq!(msg.first_link("").and_then(|l| l.attr("uid")), Some("other"));
    }

    #[test]
    fn test_tak_message_carries_regenerated_xml_detail() {
        let mut msg = contact_msg("x");
        msg.detail.add_child("remarks", &[], "hi");
        let tak = msg.to_tak_message().unwrap();
        let detail = tak.cot_event.unwrap().detail.unwrap();
        assert_eq!(detail.xml_detail, "<remarks>hi</remarks>");
        assert!(detail.contact.is_some());
    }

    #[test]
    fn test_from_tak_message_parses_xml_detail() {
        let mut event = CotEvent::default();
        event.detail = Some(Detail {
            xml_detail: r#"<link uid="a" relation="p-p"/>"#.to_string(),
            ..Detail::default()
        });
        let msg = CotMessage::from_tak_message(TakMessage {
            tak_control: None,
            cot_event: Some(event),
        })
        .unwrap();
        assert_eq!(msg.parent(), Some(("a", "")));
    }

    #[test]
    fn test_clone_without_coords() {
        let mut msg = contact_msg("x");
        msg.event.lat = 55.0;
        msg.event.lon = 37.0;
        let copy = msg.clone_without_coords();
        assert_eq!(copy.lat_lon(), (0.0, 0.0));
        assert_eq!(msg.lat_lon(), (55.0, 37.0));
    }

    #[test]
    fn test_local_message_scope() {
        let msg = CotMessage::local(CotEvent::default(), Node::detail());
        assert!(msg.is_local());
        assert_eq!(msg.from, LOCAL_FROM);
    }
}
