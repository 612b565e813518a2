//! Network infrastructure for the relay.
//!
//! # Sub-modules
//!
//! - **`session`** – One CoT connection: read and write pumps, protocol
//!   negotiation, idle watchdog and keep-alive.  Implements the hub's
//!   `Peer` trait.
//!
//! - **`tcp_server`** – Accept loop that starts a server-role session for
//!   every incoming TCP connection.
//!
//! - **`upstream`** – Optional outgoing link to another relay, redialled
//!   after every disconnect.

pub mod session;
pub mod tcp_server;
pub mod upstream;
