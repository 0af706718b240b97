#![forbid(unsafe_code)]

//! Core utilities for braid.
//!
//! This crate intentionally stays lightweight and pure Rust.
//! It exports the 48-bit microsecond clock the whole tunnel runs on and the
//! socket address helpers shared by the path table and the socket layer.

pub mod addr;
pub mod time;

pub use time::{dist, expired, now, read48, write48, U48_SIZE};
