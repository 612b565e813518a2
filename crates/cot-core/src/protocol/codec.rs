//! Conversion between wire bytes and [`CotMessage`].
//!
//! Two encodings exist for the same event:
//!
//! - **Markup** (protocol version 0): a single `<event>` element whose
//!   `<detail>` holds every extension element side by side.
//! - **Binary** (protocol version 1): a TAK protobuf message in which a few
//!   well-known detail elements are structured fields and everything else is
//!   carried verbatim in `xmlDetail`.
//!
//! When decoding markup the codec *lifts* the well-known elements out of the
//! detail tree into the structured subset; when encoding markup it renders
//! them back as siblings of the remaining detail children.  Which elements
//! are lifted is configurable through [`StructuredTag`].
//!
//! An element is only lifted when the structured form can represent it
//! exactly: it is the only child of that name, has no children or text, and
//! carries every schema attribute with a non-empty value and nothing else.
//! Anything else (a `contact` carrying a phone number, a `contact` without an
//! endpoint, a `status` whose battery is not a number) stays in the detail
//! tree, so the round trip markup → binary → markup never drops information.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::detail::{DetailError, Node};
use crate::domain::event::{
    from_millis, to_millis, Contact, CotEvent, Detail, Group, PrecisionLocation, Status, Takv,
    Track, PROTO_VERSION,
};
use crate::domain::message::CotMessage;
use crate::protocol::frame::make_frame;
use crate::protocol::proto::{decode_tak_message, encode_tak_message, ProtoError};

/// Root element name of a markup event.
pub const EVENT_TAG: &str = "event";

/// Errors that can occur while decoding or encoding an event.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The element is not an `<event>`.
    #[error("expected <event>, got <{0}>")]
    UnexpectedTag(String),

    /// The markup bytes are not UTF-8.
    #[error("event markup is not valid UTF-8")]
    NotUtf8,

    /// An attribute of the event or its point could not be parsed.
    #[error("invalid {attr} attribute: {value:?}")]
    InvalidAttribute { attr: &'static str, value: String },

    /// The detail markup is malformed.
    #[error(transparent)]
    Detail(#[from] DetailError),

    /// The binary payload is malformed.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A binary envelope carried no event.
    #[error("binary message carries no event")]
    MissingEvent,
}

/// A detail element the binary schema models as a structured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuredTag {
    #[serde(rename = "contact")]
    Contact,
    #[serde(rename = "__group")]
    Group,
    #[serde(rename = "precisionlocation")]
    PrecisionLocation,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "takv")]
    Takv,
    #[serde(rename = "track")]
    Track,
}

impl StructuredTag {
    /// Every structured element, in schema order.
    pub const ALL: [StructuredTag; 6] = [
        StructuredTag::Contact,
        StructuredTag::Group,
        StructuredTag::PrecisionLocation,
        StructuredTag::Status,
        StructuredTag::Takv,
        StructuredTag::Track,
    ];

    /// Element name in markup.
    pub fn tag_name(self) -> &'static str {
        match self {
            StructuredTag::Contact => "contact",
            StructuredTag::Group => "__group",
            StructuredTag::PrecisionLocation => "precisionlocation",
            StructuredTag::Status => "status",
            StructuredTag::Takv => "takv",
            StructuredTag::Track => "track",
        }
    }

    fn attr_names(self) -> &'static [&'static str] {
        match self {
            StructuredTag::Contact => &["endpoint", "callsign"],
            StructuredTag::Group => &["name", "role"],
            StructuredTag::PrecisionLocation => &["geopointsrc", "altsrc"],
            StructuredTag::Status => &["battery"],
            StructuredTag::Takv => &["device", "platform", "os", "version"],
            StructuredTag::Track => &["speed", "course"],
        }
    }

    /// Copies `node` into the matching field of `detail`.  Returns false,
    /// leaving `detail` untouched, when the structured form would lose data:
    /// the element must be a leaf carrying exactly the schema attributes, all
    /// non-empty, since rendering leaves empty fields out.
    fn lift(self, node: &Node, detail: &mut Detail) -> bool {
        let allowed = self.attr_names();
        if !node.is_leaf()
            || node.attr_count() != allowed.len()
            || allowed
                .iter()
                .any(|name| node.attr(name).map_or(true, str::is_empty))
        {
            return false;
        }
        let get = |name: &str| node.attr(name).unwrap_or_default().to_string();

        match self {
            StructuredTag::Contact => {
                detail.contact = Some(Contact {
                    endpoint: get("endpoint"),
                    callsign: get("callsign"),
                });
            }
            StructuredTag::Group => {
                detail.group = Some(Group {
                    name: get("name"),
                    role: get("role"),
                });
            }
            StructuredTag::PrecisionLocation => {
                detail.precision_location = Some(PrecisionLocation {
                    geopointsrc: get("geopointsrc"),
                    altsrc: get("altsrc"),
                });
            }
            StructuredTag::Status => match node.attr("battery").map(str::parse::<u32>) {
                Some(Ok(battery)) => detail.status = Some(Status { battery }),
                _ => return false,
            },
            StructuredTag::Takv => {
                detail.takv = Some(Takv {
                    device: get("device"),
                    platform: get("platform"),
                    os: get("os"),
                    version: get("version"),
                });
            }
            StructuredTag::Track => {
                match (parse_decimal(node.attr("speed")), parse_decimal(node.attr("course"))) {
                    (Some(speed), Some(course)) => detail.track = Some(Track { speed, course }),
                    _ => return false,
                }
            }
        }
        true
    }

    /// Renders the matching field of `detail`, if set, into `out`.  Empty
    /// string fields are left out of the element.
    fn render(self, detail: &Detail, out: &mut Node) {
        let name = self.tag_name();
        match self {
            StructuredTag::Contact => {
                if let Some(c) = &detail.contact {
                    put(out, name, &[("endpoint", &c.endpoint), ("callsign", &c.callsign)]);
                }
            }
            StructuredTag::Group => {
                if let Some(g) = &detail.group {
                    put(out, name, &[("name", &g.name), ("role", &g.role)]);
                }
            }
            StructuredTag::PrecisionLocation => {
                if let Some(p) = &detail.precision_location {
                    put(
                        out,
                        name,
                        &[("geopointsrc", &p.geopointsrc), ("altsrc", &p.altsrc)],
                    );
                }
            }
            StructuredTag::Status => {
                if let Some(s) = &detail.status {
                    put(out, name, &[("battery", &s.battery.to_string())]);
                }
            }
            StructuredTag::Takv => {
                if let Some(t) = &detail.takv {
                    put(
                        out,
                        name,
                        &[
                            ("device", &t.device),
                            ("platform", &t.platform),
                            ("os", &t.os),
                            ("version", &t.version),
                        ],
                    );
                }
            }
            StructuredTag::Track => {
                if let Some(t) = &detail.track {
                    put(
                        out,
                        name,
                        &[
                            ("speed", &t.speed.to_string()),
                            ("course", &t.course.to_string()),
                        ],
                    );
                }
            }
        }
    }
}

fn put(out: &mut Node, name: &str, attrs: &[(&str, &str)]) {
    let present: Vec<(&str, &str)> = attrs
        .iter()
        .copied()
        .filter(|(_, v)| !v.is_empty())
        .collect();
    out.add_or_change_child(name, &present);
}

/// Event codec with a configurable set of lifted detail elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    structured: Vec<StructuredTag>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(StructuredTag::ALL)
    }
}

impl Codec {
    /// Creates a codec lifting exactly `tags`; duplicates are ignored.
    pub fn new(tags: impl IntoIterator<Item = StructuredTag>) -> Self {
        let mut structured = Vec::new();
        for tag in tags {
            if !structured.contains(&tag) {
                structured.push(tag);
            }
        }
        Self { structured }
    }

    pub fn structured_tags(&self) -> &[StructuredTag] {
        &self.structured
    }

    // ── Markup ────────────────────────────────────────────────────────────────

    /// Decodes one markup element read by the tag reader.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the element is not a well-formed event or
    /// its timestamps / coordinates do not parse.
    pub fn decode_xml(&self, tag_name: &str, raw: &[u8]) -> Result<CotMessage, CodecError> {
        if tag_name != EVENT_TAG {
            return Err(CodecError::UnexpectedTag(tag_name.to_string()));
        }
        let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
        let root = Node::parse(text)?;
        if root.name() != EVENT_TAG {
            return Err(CodecError::UnexpectedTag(root.name().to_string()));
        }
        self.event_from_node(root)
    }

    fn event_from_node(&self, mut root: Node) -> Result<CotMessage, CodecError> {
        let text = |name: &str| root.attr(name).unwrap_or_default().to_string();
        let mut event = CotEvent {
            event_type: text("type"),
            access: text("access"),
            qos: text("qos"),
            opex: text("opex"),
            uid: text("uid"),
            how: text("how"),
            send_time: parse_time(&root, "time")?,
            start_time: parse_time(&root, "start")?,
            stale_time: parse_time(&root, "stale")?,
            ..CotEvent::default()
        };

        if let Some(point) = root.first("point") {
            event.lat = parse_f64(point, "lat")?;
            event.lon = parse_f64(point, "lon")?;
            event.hae = parse_f64(point, "hae")?;
            event.ce = parse_f64(point, "ce")?;
            event.le = parse_f64(point, "le")?;
        }

        let detail = match root.children().iter().position(|c| c.name() == "detail") {
            Some(idx) => root.take_child(idx),
            None => Node::detail(),
        };
        let (mut structured, rest) = self.split_detail(detail);
        structured.xml_detail = rest.inner_xml()?;
        event.detail = (!structured.is_empty()).then_some(structured);

        Ok(CotMessage::new(event, rest))
    }

    /// Moves liftable elements out of `detail` into a [`Detail`]; returns
    /// the structured subset and the remaining tree.  A name that occurs more
    /// than once stays in the tree, since one structured slot cannot hold it.
    fn split_detail(&self, mut detail: Node) -> (Detail, Node) {
        let mut out = Detail::default();
        for tag in &self.structured {
            let mut found = detail
                .children()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name() == tag.tag_name())
                .map(|(idx, _)| idx);
            if let (Some(idx), None) = (found.next(), found.next()) {
                if tag.lift(&detail.children()[idx], &mut out) {
                    detail.take_child(idx);
                }
            }
        }
        (out, detail)
    }

    /// The detail tree with the structured subset rendered back in.
    pub fn full_detail(&self, msg: &CotMessage) -> Node {
        let mut node = msg.detail.clone();
        if let Some(detail) = &msg.event.detail {
            for tag in StructuredTag::ALL {
                tag.render(detail, &mut node);
            }
        }
        node
    }

    /// Encodes `msg` as a markup `<event>` element.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Detail`] if rendering fails.
    pub fn encode_xml(&self, msg: &CotMessage) -> Result<Vec<u8>, CodecError> {
        let ev = &msg.event;
        let mut root = Node::new(EVENT_TAG)
            .with_attr("version", "2.0")
            .with_attr("type", ev.event_type.as_str());
        for (name, value) in [("access", &ev.access), ("qos", &ev.qos), ("opex", &ev.opex)] {
            if !value.is_empty() {
                root.set_attr(name, value.as_str());
            }
        }
        root.set_attr("uid", ev.uid.as_str());
        root.set_attr("time", format_time(ev.send_time));
        root.set_attr("start", format_time(ev.start_time));
        root.set_attr("stale", format_time(ev.stale_time));
        root.set_attr("how", ev.how.as_str());

        root.push_child(
            Node::new("point")
                .with_attr("lat", ev.lat.to_string())
                .with_attr("lon", ev.lon.to_string())
                .with_attr("hae", ev.hae.to_string())
                .with_attr("ce", ev.ce.to_string())
                .with_attr("le", ev.le.to_string()),
        );

        let detail = self.full_detail(msg);
        if !detail.children().is_empty() {
            root.push_child(detail);
        }

        Ok(root.to_xml()?.into_bytes())
    }

    // ── Binary ────────────────────────────────────────────────────────────────

    /// Decodes one protobuf payload read by the frame reader.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the payload is malformed, carries no
    /// event, or its `xmlDetail` is not well-formed markup.
    pub fn decode_binary(&self, payload: &[u8]) -> Result<CotMessage, CodecError> {
        let tak = decode_tak_message(payload)?;
        if tak.cot_event.is_none() {
            return Err(CodecError::MissingEvent);
        }
        Ok(CotMessage::from_tak_message(tak)?)
    }

    /// Encodes `msg` as a protobuf payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Detail`] if the detail tree cannot be rendered.
    pub fn encode_binary(&self, msg: &CotMessage) -> Result<Vec<u8>, CodecError> {
        Ok(encode_tak_message(&msg.to_tak_message()?))
    }

    /// Encodes `msg` ready to write for a peer speaking `version`: markup for
    /// version 0, a magic-prefixed binary frame for version 1 and above.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if encoding fails.
    pub fn encode_for(&self, msg: &CotMessage, version: u32) -> Result<Vec<u8>, CodecError> {
        if version >= PROTO_VERSION {
            Ok(make_frame(&self.encode_binary(msg)?))
        } else {
            self.encode_xml(msg)
        }
    }
}

// ── Attribute helpers ─────────────────────────────────────────────────────────

/// Parses a decimal that may use `,` as its separator.
fn parse_decimal(value: Option<&str>) -> Option<f64> {
    match value {
        None => Some(0.0),
        Some(v) => v.trim().replace(',', ".").parse().ok(),
    }
}

fn parse_f64(node: &Node, attr: &'static str) -> Result<f64, CodecError> {
    match node.attr(attr) {
        None => Ok(0.0),
        Some(v) => v.trim().parse().map_err(|_| CodecError::InvalidAttribute {
            attr,
            value: v.to_string(),
        }),
    }
}

fn parse_time(node: &Node, attr: &'static str) -> Result<u64, CodecError> {
    match node.attr(attr) {
        None => Ok(0),
        Some(v) => DateTime::parse_from_rfc3339(v.trim())
            .map(|t| to_millis(t.with_timezone(&Utc)))
            .map_err(|_| CodecError::InvalidAttribute {
                attr,
                value: v.to_string(),
            }),
    }
}

fn format_time(ms: u64) -> String {
    from_millis(ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
