//! Domain entities for Cursor-on-Target events.
//!
//! Nothing in here touches sockets or framing; it is the vocabulary the rest
//! of the workspace speaks:
//!
//! - [`detail::Node`] – the generic tree holding arbitrary `<detail>` content.
//! - [`event::CotEvent`] – the fixed-schema projection (type, uid, times,
//!   position, structured detail subset).
//! - [`message::CotMessage`] – an event plus its detail tree and the routing
//!   metadata attached by the relay.
//! - [`filter`] – type pattern matching over the dash-separated CoT taxonomy.

pub mod detail;
pub mod event;
pub mod filter;
pub mod message;

pub use detail::{DetailError, Node};
pub use event::{
    Contact, CotEvent, Detail, Group, PrecisionLocation, Status, TakControl, TakMessage, Takv,
    Track, NOT_NUM, PROTO_VERSION, XML_VERSION,
};
pub use message::{CotMessage, BROADCAST_SCOPE, LOCAL_FROM, LOCAL_SCOPE};
