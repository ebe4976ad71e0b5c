//! TCP/IPv4 endpoint sockets for a userspace network server.
//!
//! The core sits above a raw IP layer, consumed through the [Ip4Link]
//! trait: inbound IP packets are fed to the [Tcp4] demultiplexer, which
//! routes them to bound sockets; each socket's outbound pump emits at most
//! one segment per wake-up through the same layer.
//!
//! Only the active-open path is implemented: SYN, data, ACK, and the
//! connected steady state. There is no FIN or RST handling and no
//! retransmission timer (a rewind hook is provided for one).
//!
//! [Ip4Link]: ip::Ip4Link
//! [Tcp4]: demux::Tcp4

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod log;

pub mod demux;
pub mod doorbell;
pub mod endpoint;
pub mod ip;
pub mod ring;
pub mod segment;
pub mod socket;

pub mod error;
pub use error::{Error, ParseError, Result};
