//! Master controller for the HBUS low-voltage fieldbus
//!
//! This crate provides the protocol engine: the byte-level frame codec, the
//! reply correlation registry, bus arbitration and address assignment, the
//! device/object model with its value codec, and the supervisor that drives
//! discovery, liveness checks and enumeration. Front ends talk to a running
//! engine through [`api::MasterHandle`].

pub mod api;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;

pub use api::*;
