//! Braid tunnel engine.
//!
//! Multiplexes one encrypted datagram stream over any number of concurrent
//! network paths between two peers. The engine owns a single UDP socket and
//! all path and key state; the host drives it from a readiness loop:
//!
//! * [`Tunnel::recv`] ingests one datagram — data is decrypted into the
//!   caller's buffer, control traffic feeds the path table and key epochs.
//! * [`Tunnel::send`] runs the control tick, then encrypts and transmits on
//!   the path whose virtual schedule frees up first.
//!
//! Everything is synchronous and single-threaded; see [`engine`] for the
//! concurrency contract.

pub mod config;
pub mod engine;
pub mod errors;
pub mod path;
pub mod wire;

mod sock;

pub use config::TunnelConfig;
pub use engine::{Tunnel, TunnelStats};
pub use errors::{Error, Result};
pub use path::Path;
