//! Error codes delivered through operation completions.

use std::{error, fmt, result};

/// A convenience wrapper around `Result` for `lane_core::LaneError`.
pub type Result<T> = result::Result<T, LaneError>;

/// Ways a lane operation can fail.
///
/// Success is represented by the `Ok` arm of [Result]; these codes are
/// delivered through an operation's completion when the rendezvous cannot
/// be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LaneError {
    /// The transferred payload does not fit the receiving buffer.
    BufferTooSmall,
    /// The lane the operation belongs to has been closed on this side.
    ClosedLocally,
    /// The peer lane has been closed; no matching operation can ever
    /// arrive.
    ClosedRemotely,
    /// The observed thread exited before the operation could complete.
    ThreadExited,
}

impl error::Error for LaneError {}

impl fmt::Display for LaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LaneError::BufferTooSmall => {
                write!(f, "transferred payload does not fit the receiving buffer")
            }
            LaneError::ClosedLocally => write!(f, "lane was closed locally"),
            LaneError::ClosedRemotely => write!(f, "peer lane was closed"),
            LaneError::ThreadExited => write!(f, "observed thread exited"),
        }
    }
}
