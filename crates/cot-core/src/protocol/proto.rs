//! Protobuf encoding of the TAK message schema.
//!
//! The schema is small and fixed, so it is encoded by hand instead of through
//! generated code.  Field numbers:
//!
//! ```text
//! TakMessage        1 takControl   2 cotEvent
//! TakControl        1 minProtoVersion  2 maxProtoVersion  3 contactUid
//! CotEvent          1 type  2 access  3 qos  4 opex  5 uid
//!                   6 sendTime  7 startTime  8 staleTime (uint64 ms)
//!                   9 how  10 lat  11 lon  12 hae  13 ce  14 le (double)
//!                   15 detail
//! Detail            1 xmlDetail  2 contact  3 group  4 precisionLocation
//!                   5 status  6 takv  7 track
//! Contact           1 endpoint  2 callsign
//! Group             1 name  2 role
//! PrecisionLocation 1 geopointsrc  2 altsrc
//! Status            1 battery (uint32)
//! Takv              1 device  2 platform  3 os  4 version
//! Track             1 speed  2 course (double)
//! ```
//!
//! Proto3 rules apply: scalar fields equal to their default are not written,
//! embedded messages are written whenever present, and unknown fields are
//! skipped on decode.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::domain::event::{
    Contact, CotEvent, Detail, Group, PrecisionLocation, Status, TakControl, TakMessage, Takv,
    Track,
};
use crate::protocol::varint::{decode_varint, encode_varint, VarintError};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Errors that can occur while decoding a protobuf payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// A length-delimited or fixed-width field ran past the end of the input.
    #[error("payload truncated in field {0}")]
    Truncated(u32),

    /// A key or length was not a valid varint.
    #[error("malformed varint: {0}")]
    Varint(#[from] VarintError),

    /// The wire type is unknown, or does not match the schema for the field.
    #[error("unexpected wire type {wire_type} for field {field}")]
    WireType { field: u32, wire_type: u8 },

    /// Field number zero is reserved.
    #[error("field number 0 is invalid")]
    ZeroField,

    /// A string field is not valid UTF-8.
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u32),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`TakMessage`] into a protobuf payload (without framing).
pub fn encode_tak_message(msg: &TakMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(control) = &msg.tak_control {
        put_message(&mut buf, 1, &encode_control(control));
    }
    if let Some(event) = &msg.cot_event {
        put_message(&mut buf, 2, &encode_event(event));
    }
    buf
}

/// Decodes a protobuf payload into a [`TakMessage`].
///
/// # Errors
///
/// Returns [`ProtoError`] if the payload is malformed.
pub fn decode_tak_message(payload: &[u8]) -> Result<TakMessage, ProtoError> {
    let mut msg = TakMessage::default();
    let mut fields = Fields::new(payload);
    while let Some((field, value)) = fields.next_field()? {
        match field {
            1 => msg.tak_control = Some(decode_control(value.bytes(field)?)?),
            2 => msg.cot_event = Some(decode_event(value.bytes(field)?)?),
            _ => {}
        }
    }
    Ok(msg)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn encode_control(c: &TakControl) -> Vec<u8> {
    let mut buf = Vec::new();
    put_uint(&mut buf, 1, u64::from(c.min_proto_version));
    put_uint(&mut buf, 2, u64::from(c.max_proto_version));
    put_string(&mut buf, 3, &c.contact_uid);
    buf
}

fn encode_event(e: &CotEvent) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, 1, &e.event_type);
    put_string(&mut buf, 2, &e.access);
    put_string(&mut buf, 3, &e.qos);
    put_string(&mut buf, 4, &e.opex);
    put_string(&mut buf, 5, &e.uid);
    put_uint(&mut buf, 6, e.send_time);
    put_uint(&mut buf, 7, e.start_time);
    put_uint(&mut buf, 8, e.stale_time);
    put_string(&mut buf, 9, &e.how);
    put_double(&mut buf, 10, e.lat);
    put_double(&mut buf, 11, e.lon);
    put_double(&mut buf, 12, e.hae);
    put_double(&mut buf, 13, e.ce);
    put_double(&mut buf, 14, e.le);
    if let Some(detail) = &e.detail {
        put_message(&mut buf, 15, &encode_detail(detail));
    }
    buf
}

fn encode_detail(d: &Detail) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, 1, &d.xml_detail);
    if let Some(c) = &d.contact {
        let mut m = Vec::new();
        put_string(&mut m, 1, &c.endpoint);
        put_string(&mut m, 2, &c.callsign);
        put_message(&mut buf, 2, &m);
    }
    if let Some(g) = &d.group {
        let mut m = Vec::new();
        put_string(&mut m, 1, &g.name);
        put_string(&mut m, 2, &g.role);
        put_message(&mut buf, 3, &m);
    }
    if let Some(p) = &d.precision_location {
        let mut m = Vec::new();
        put_string(&mut m, 1, &p.geopointsrc);
        put_string(&mut m, 2, &p.altsrc);
        put_message(&mut buf, 4, &m);
    }
    if let Some(s) = &d.status {
        let mut m = Vec::new();
        put_uint(&mut m, 1, u64::from(s.battery));
        put_message(&mut buf, 5, &m);
    }
    if let Some(t) = &d.takv {
        let mut m = Vec::new();
        put_string(&mut m, 1, &t.device);
        put_string(&mut m, 2, &t.platform);
        put_string(&mut m, 3, &t.os);
        put_string(&mut m, 4, &t.version);
        put_message(&mut buf, 6, &m);
    }
    if let Some(t) = &d.track {
        let mut m = Vec::new();
        put_double(&mut m, 1, t.speed);
        put_double(&mut m, 2, t.course);
        put_message(&mut buf, 7, &m);
    }
    buf
}

fn put_key(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    encode_varint((u64::from(field) << 3) | u64::from(wire_type), buf);
}

fn put_string(buf: &mut Vec<u8>, field: u32, value: &str) {
    if !value.is_empty() {
        put_message(buf, field, value.as_bytes());
    }
}

fn put_uint(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value != 0 {
        put_key(buf, field, WIRE_VARINT);
        encode_varint(value, buf);
    }
}

fn put_double(buf: &mut Vec<u8>, field: u32, value: f64) {
    // Proto3 skips +0.0 only; -0.0 has a non-zero bit pattern.
    if value.to_bits() != 0 {
        put_key(buf, field, WIRE_FIXED64);
        buf.put_f64_le(value);
    }
}

fn put_message(buf: &mut Vec<u8>, field: u32, body: &[u8]) {
    put_key(buf, field, WIRE_LEN);
    encode_varint(body.len() as u64, buf);
    buf.extend_from_slice(body);
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn decode_control(p: &[u8]) -> Result<TakControl, ProtoError> {
    let mut c = TakControl::default();
    let mut fields = Fields::new(p);
    while let Some((field, value)) = fields.next_field()? {
        match field {
            1 => c.min_proto_version = value.uint32(field)?,
            2 => c.max_proto_version = value.uint32(field)?,
            3 => c.contact_uid = value.string(field)?,
            _ => {}
        }
    }
    Ok(c)
}

fn decode_event(p: &[u8]) -> Result<CotEvent, ProtoError> {
    let mut e = CotEvent::default();
    let mut fields = Fields::new(p);
    while let Some((field, value)) = fields.next_field()? {
        match field {
            1 => e.event_type = value.string(field)?,
            2 => e.access = value.string(field)?,
            3 => e.qos = value.string(field)?,
            4 => e.opex = value.string(field)?,
            5 => e.uid = value.string(field)?,
            6 => e.send_time = value.uint64(field)?,
            7 => e.start_time = value.uint64(field)?,
            8 => e.stale_time = value.uint64(field)?,
            9 => e.how = value.string(field)?,
            10 => e.lat = value.double(field)?,
            11 => e.lon = value.double(field)?,
            12 => e.hae = value.double(field)?,
            13 => e.ce = value.double(field)?,
            14 => e.le = value.double(field)?,
            15 => e.detail = Some(decode_detail(value.bytes(field)?)?),
            _ => {}
        }
    }
    Ok(e)
}

fn decode_detail(p: &[u8]) -> Result<Detail, ProtoError> {
    let mut d = Detail::default();
    let mut fields = Fields::new(p);
    while let Some((field, value)) = fields.next_field()? {
        match field {
            1 => d.xml_detail = value.string(field)?,
            2 => {
                let mut c = Contact::default();
                decode_strings(value.bytes(field)?, &mut [&mut c.endpoint, &mut c.callsign])?;
                d.contact = Some(c);
            }
            3 => {
                let mut g = Group::default();
                decode_strings(value.bytes(field)?, &mut [&mut g.name, &mut g.role])?;
                d.group = Some(g);
            }
            4 => {
                let mut pl = PrecisionLocation::default();
                decode_strings(
                    value.bytes(field)?,
                    &mut [&mut pl.geopointsrc, &mut pl.altsrc],
                )?;
                d.precision_location = Some(pl);
            }
            5 => {
                let mut s = Status::default();
                let mut inner = Fields::new(value.bytes(field)?);
                while let Some((f, v)) = inner.next_field()? {
                    if f == 1 {
                        s.battery = v.uint32(f)?;
                    }
                }
                d.status = Some(s);
            }
            6 => {
                let mut t = Takv::default();
                decode_strings(
                    value.bytes(field)?,
                    &mut [&mut t.device, &mut t.platform, &mut t.os, &mut t.version],
                )?;
                d.takv = Some(t);
            }
            7 => {
                let mut t = Track::default();
                let mut inner = Fields::new(value.bytes(field)?);
                while let Some((f, v)) = inner.next_field()? {
                    match f {
                        1 => t.speed = v.double(f)?,
                        2 => t.course = v.double(f)?,
                        _ => {}
                    }
                }
                d.track = Some(t);
            }
            _ => {}
        }
    }
    Ok(d)
}

/// Decodes a message whose fields 1..=N are all strings into `targets`.
fn decode_strings(p: &[u8], targets: &mut [&mut String]) -> Result<(), ProtoError> {
    let mut fields = Fields::new(p);
    while let Some((field, value)) = fields.next_field()? {
        let slot = (field as usize)
            .checked_sub(1)
            .and_then(|i| targets.get_mut(i));
        if let Some(slot) = slot {
            **slot = value.string(field)?;
        }
    }
    Ok(())
}

/// One decoded field value, still untyped.
#[derive(Debug, Clone, Copy)]
enum Value<'a> {
    Varint(u64),
    Fixed64(u64),
    Fixed32,
    Len(&'a [u8]),
}

impl<'a> Value<'a> {
    fn mismatch(self, field: u32) -> ProtoError {
        let wire_type = match self {
            Value::Varint(_) => WIRE_VARINT,
            Value::Fixed64(_) => WIRE_FIXED64,
            Value::Fixed32 => WIRE_FIXED32,
            Value::Len(_) => WIRE_LEN,
        };
        ProtoError::WireType { field, wire_type }
    }

    fn bytes(self, field: u32) -> Result<&'a [u8], ProtoError> {
        match self {
            Value::Len(b) => Ok(b),
            other => Err(other.mismatch(field)),
        }
    }

    fn string(self, field: u32) -> Result<String, ProtoError> {
        let bytes = self.bytes(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::InvalidUtf8(field))
    }

    fn uint64(self, field: u32) -> Result<u64, ProtoError> {
        match self {
            Value::Varint(v) => Ok(v),
            other => Err(other.mismatch(field)),
        }
    }

    /// Proto3 truncates out-of-range uint32 values to their low 32 bits.
    fn uint32(self, field: u32) -> Result<u32, ProtoError> {
        self.uint64(field).map(|v| v as u32)
    }

    fn double(self, field: u32) -> Result<f64, ProtoError> {
        match self {
            Value::Fixed64(bits) => Ok(f64::from_bits(bits)),
            other => Err(other.mismatch(field)),
        }
    }
}

/// Cursor over the fields of one message body.
struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn next_field(&mut self) -> Result<Option<(u32, Value<'a>)>, ProtoError> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        let key = decode_varint(&mut self.buf)?;
        let field = u32::try_from(key >> 3).map_err(|_| VarintError::Overflow)?;
        let wire_type = (key & 0x07) as u8;
        if field == 0 {
            return Err(ProtoError::ZeroField);
        }

        let value = match wire_type {
            WIRE_VARINT => Value::Varint(decode_varint(&mut self.buf)?),
            WIRE_FIXED64 => {
                self.require(8, field)?;
                Value::Fixed64(self.buf.get_u64_le())
            }
            WIRE_FIXED32 => {
                self.require(4, field)?;
                self.buf.advance(4);
                Value::Fixed32
            }
            WIRE_LEN => {
                let len = decode_varint(&mut self.buf)?;
                let len = usize::try_from(len).map_err(|_| ProtoError::Truncated(field))?;
                self.require(len, field)?;
                let (body, rest) = self.buf.split_at(len);
                self.buf = rest;
                Value::Len(body)
            }
            other => {
                return Err(ProtoError::WireType {
                    field,
                    wire_type: other,
                })
            }
        };
        Ok(Some((field, value)))
    }

    fn require(&self, needed: usize, field: u32) -> Result<(), ProtoError> {
        if self.buf.remaining() < needed {
            Err(ProtoError::Truncated(field))
        } else {
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
