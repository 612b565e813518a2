//! # cot-core
//!
//! Shared library for the CoT relay containing the wire readers, the
//! markup/protobuf codec, and the domain types for Cursor-on-Target events.
//!
//! It has no knowledge of sockets or sessions; everything here works on byte
//! buffers and `AsyncBufRead` streams so it can be tested in memory.
//!
//! # Architecture overview (for beginners)
//!
//! Cursor-on-Target (CoT) is the event format used by TAK clients to share
//! positions, chat, and map items.  Each event is a small record (type, uid,
//! times, a point) plus a free-form `<detail>` subtree.  Clients speak one of
//! two encodings on a TCP stream:
//!
//! - **Markup** – one `<event>...</event>` element after another, with no
//!   delimiter other than the elements themselves.
//! - **Binary** – `0xBF`, a varint length, then a protobuf `TakMessage`.
//!
//! A connection starts on markup and may switch to binary after a short
//! version negotiation.
//!
//! This crate defines:
//!
//! - **`domain`** – The event model: [`CotEvent`], the generic detail tree
//!   [`Node`], and [`CotMessage`] which pairs them with routing metadata.
//!
//! - **`protocol`** – The stream readers ([`TagReader`], [`FrameReader`]),
//!   the hand-written protobuf encoder/decoder, the [`Codec`] that converts
//!   between bytes and messages, and the control event builders.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `cot_core::CotMessage` instead of `cot_core::domain::message::CotMessage`.
pub use domain::{
    CotEvent, CotMessage, Detail, DetailError, Node, TakControl, TakMessage, NOT_NUM,
    PROTO_VERSION, XML_VERSION,
};
pub use protocol::{
    Codec, CodecError, Control, FrameError, FrameReader, RawTag, StructuredTag, TagReader,
};
