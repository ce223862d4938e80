//! Network front end.
//!
//! The gateway core is transport agnostic; this module provides the small
//! TCP line protocol used by the `device_server` binary.

pub mod line_server;

pub use line_server::{LineServer, GREETING, MARKER};
