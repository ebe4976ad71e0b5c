//! Rendezvous-style IPC between the two endpoints of a bidirectional
//! stream.
//!
//! A [Stream] owns two symmetric *lanes*. Pending operations submitted on
//! one lane are matched against the head of the peer lane's queue; matched
//! pairs complete atomically, unmatched operations are parked until a
//! partner arrives. A matched offer/accept pair additionally spawns a
//! child stream that represents a nested conversation.
//!
//! [Stream]: stream::Stream

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod log;

pub mod op;
pub mod stream;
pub mod universe;

pub mod error;
pub use error::{LaneError, Result};
