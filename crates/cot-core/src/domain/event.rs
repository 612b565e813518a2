//! Fixed-schema projection of a CoT event.
//!
//! These structs mirror the TAK protobuf schema one-to-one (see
//! [`crate::protocol::proto`] for the field numbers).  Everything the schema
//! does not model lives in [`Detail::xml_detail`] as raw markup.
//!
//! Timestamps are milliseconds since the Unix epoch, which is what the binary
//! schema carries; helpers convert to and from [`chrono::DateTime`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for an unknown circular/linear error.
pub const NOT_NUM: f64 = 9_999_999.0;

/// Protocol version spoken before negotiation: markup framing.
pub const XML_VERSION: u32 = 0;
/// Protocol version after a successful upgrade: binary framing.
pub const PROTO_VERSION: u32 = 1;

/// Contact endpoint and callsign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub endpoint: String,
    pub callsign: String,
}

/// Team membership (`__group` in markup).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub role: String,
}

/// Origin of the position and altitude fixes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionLocation {
    pub geopointsrc: String,
    pub altsrc: String,
}

/// Device status; only battery level is modelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub battery: u32,
}

/// Client software identification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Takv {
    pub device: String,
    pub platform: String,
    pub os: String,
    pub version: String,
}

/// Movement vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub speed: f64,
    pub course: f64,
}

/// Structured detail subset plus the markup of everything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    pub xml_detail: String,
    pub contact: Option<Contact>,
    pub group: Option<Group>,
    pub precision_location: Option<PrecisionLocation>,
    pub status: Option<Status>,
    pub takv: Option<Takv>,
    pub track: Option<Track>,
}

impl Detail {
    /// True when no structured field is set and `xml_detail` is empty.
    pub fn is_empty(&self) -> bool {
        self.xml_detail.is_empty()
            && self.contact.is_none()
            && self.group.is_none()
            && self.precision_location.is_none()
            && self.status.is_none()
            && self.takv.is_none()
            && self.track.is_none()
    }
}

/// One tactical event: identity, timing and position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CotEvent {
    /// Dash-separated taxonomy, e.g. `a-f-G-U-C`.
    pub event_type: String,
    pub access: String,
    pub qos: String,
    pub opex: String,
    pub uid: String,
    /// Epoch milliseconds.
    pub send_time: u64,
    /// Epoch milliseconds.
    pub start_time: u64,
    /// Epoch milliseconds; the event has expired once now is past this.
    pub stale_time: u64,
    pub how: String,
    pub lat: f64,
    pub lon: f64,
    pub hae: f64,
    pub ce: f64,
    pub le: f64,
    pub detail: Option<Detail>,
}

impl CotEvent {
    /// An event at the null island with unknown error, timed from now.
    pub fn basic(event_type: &str, uid: &str, stale: Duration) -> Self {
        let now = Utc::now();
        Self {
            event_type: event_type.to_string(),
            uid: uid.to_string(),
            send_time: to_millis(now),
            start_time: to_millis(now),
            stale_time: to_millis(now + stale),
            how: "m-g".to_string(),
            ce: NOT_NUM,
            le: NOT_NUM,
            ..Self::default()
        }
    }

    pub fn send_at(&self) -> DateTime<Utc> {
        from_millis(self.send_time)
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        from_millis(self.start_time)
    }

    pub fn stale_at(&self) -> DateTime<Utc> {
        from_millis(self.stale_time)
    }

    /// True once `now` is past the stale time.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now > self.stale_at()
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Resets position to the null island with unknown error.
    pub fn clear_coords(&mut self) {
        self.lat = 0.0;
        self.lon = 0.0;
        self.hae = 0.0;
        self.ce = NOT_NUM;
        self.le = NOT_NUM;
    }
}

/// Protocol negotiation header of the binary envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TakControl {
    pub min_proto_version: u32,
    pub max_proto_version: u32,
    pub contact_uid: String,
}

/// The binary envelope: optional control header plus the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TakMessage {
    pub tak_control: Option<TakControl>,
    pub cot_event: Option<CotEvent>,
}

// ── Time helpers ──────────────────────────────────────────────────────────────

/// Converts epoch milliseconds into a UTC timestamp; out-of-range values
/// collapse to the epoch.
pub fn from_millis(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_default()
}

/// Converts a UTC timestamp into epoch milliseconds; pre-epoch times clamp to 0.
pub fn to_millis(t: DateTime<Utc>) -> u64 {
    u64::try_from(t.timestamp_millis()).unwrap_or(0)
}
