#![cfg_attr(not(test), no_std)]

//! Battery monitor (DS2756) side of an embedded controller: a single-wire
//! transport driven from a timer interrupt, and a session arbiter that shares
//! it between the host, the charging logic and its own telemetry readout.
//!
//! Wiring it up takes one [`transport::SharedEngine`] reachable from the timer
//! interrupt, two [`channel::RequestChannel`]s and a [`telemetry::TelemetryCell`],
//! typically all in `static`s, plus a [`session::Session`] polled from the main
//! loop with the current time in milliseconds.

pub(crate) mod fmt;

pub mod bus;
pub mod channel;
pub mod client;
pub mod config;
pub mod crc;
pub mod error;
pub mod known_chips;
pub mod registers;
pub mod session;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod sim;

pub use bus::{BusFault, BusLine, DeadlineTimer, OpenDrain};
pub use channel::{RequestChannel, Response};
pub use client::Ds2756;
pub use config::Config;
pub use error::{Error, ErrorFlags, Result};
pub use session::{Owner, Session, State};
pub use telemetry::{TelemetryCell, TelemetrySample};
pub use transport::{Engine, SharedEngine, TransferBuffer};
