//! Infrastructure layer for the relay.
//!
//! Contains OS-facing adapters: TCP sockets and sessions, and the
//! file-system configuration store.
//!
//! **Dependency rule**: this layer may depend on `application` and `cot_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
