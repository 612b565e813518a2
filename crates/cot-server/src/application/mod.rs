//! Application layer of the relay.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (the event model in `cot_core`) and the infrastructure (sockets, files).
//! Code here decides *where* a message goes; it never touches a socket.
//! Sessions are seen only through the [`routing::Peer`] trait, so the whole
//! layer can be tested with in-memory fakes.
//!
//! # Sub-modules
//!
//! - **`routing`** – The [`routing::RoutingHub`]: registry of live sessions,
//!   uid ownership, and destination/broadcast fan-out.
//!
//! - **`relay`** – The [`relay::MessageHandler`] callbacks a session makes,
//!   and the default handler that routes every event through the hub.
//!
//! - **`scope`** – Per-session [`scope::Access`] and the visibility rules
//!   between scopes.

pub mod relay;
pub mod routing;
pub mod scope;
