//! Drive Commodore IEC bus devices through an Arduino class serial
//! transceiver.
//!
//! [`Bus`] is the host side: it owns the serial link, runs the connection
//! handshake, and exposes channel oriented operations (reset, open, read,
//! write, close).  [`protocol`] contains the transceiver side: the
//! bit-banged IEC protocol engine and the serial command dispatcher, both
//! portable over a [`protocol::LinePort`] so they can run against real GPIOs
//! or the bundled software bus simulator.  [`drive`] layers sector access
//! and `.d64` images on top.
pub mod bus;
pub mod buscmd;
pub mod constants;
pub mod drive;
pub mod error;
pub mod link;
pub mod protocol;

pub use crate::bus::{Bus, BusBuilder};
pub use crate::buscmd::DeviceChannel;
pub use crate::error::{Error, Result};
pub use crate::link::LogCallback;
