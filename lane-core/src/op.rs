//! Pending operations on a lane.
//!
//! An [Operation] is a tagged record: one of six kinds, its payload, and a
//! one-shot completion. The engine matches kind pairs across the two lanes
//! of a stream; every operation completes at most once, with an error code
//! and a kind-specific result.

use std::fmt;
use std::sync::Weak;

use crate::error::LaneError;
use crate::universe::{Descriptor, Handle, Universe};

/// Completion for operations that carry no payload back to the submitter
/// (offer, send-buffer, push-descriptor).
pub type UnitCompletion = Box<dyn FnOnce(Result<(), LaneError>) + Send>;

/// Completion for receive-buffer operations: delivers the copied bytes.
pub type RecvCompletion = Box<dyn FnOnce(Result<Vec<u8>, LaneError>) + Send>;

/// Completion for accept and pull-descriptor operations: delivers the
/// handle the transferred capability received in the capturing universe.
pub type HandleCompletion = Box<dyn FnOnce(Result<Handle, LaneError>) + Send>;

/// A single pending action on a lane.
pub enum Operation {
    /// Offer a conversation to the peer lane.
    Offer {
        /// Runs once the offer is matched or fails.
        complete: UnitCompletion,
    },
    /// Accept a conversation offered on the peer lane. The child-stream
    /// lane handle is attached to `universe` on completion.
    Accept {
        /// Capability table capturing the conversation handle.
        universe: Weak<Universe>,
        /// Runs once the accept is matched or fails.
        complete: HandleCompletion,
    },
    /// Transfer bytes to a receive operation on the peer lane.
    SendBuffer {
        /// Bytes to hand over.
        buffer: Vec<u8>,
        /// Runs once the bytes were copied or the transfer fails.
        complete: UnitCompletion,
    },
    /// Receive bytes from a send operation on the peer lane.
    RecvBuffer {
        /// Maximum number of bytes this side is prepared to take.
        capacity: usize,
        /// Runs once bytes arrive or the transfer fails.
        complete: RecvCompletion,
    },
    /// Transfer a capability to a pull operation on the peer lane.
    PushDescriptor {
        /// Capability to hand over.
        descriptor: Descriptor,
        /// Runs once the capability was transferred or the transfer fails.
        complete: UnitCompletion,
    },
    /// Receive a capability from a push operation on the peer lane. The
    /// capability is attached to `universe` on completion.
    PullDescriptor {
        /// Capability table capturing the transferred descriptor.
        universe: Weak<Universe>,
        /// Runs once a capability arrives or the transfer fails.
        complete: HandleCompletion,
    },
}

/// Discriminant of an [Operation].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// See [Operation::Offer].
    Offer,
    /// See [Operation::Accept].
    Accept,
    /// See [Operation::SendBuffer].
    SendBuffer,
    /// See [Operation::RecvBuffer].
    RecvBuffer,
    /// See [Operation::PushDescriptor].
    PushDescriptor,
    /// See [Operation::PullDescriptor].
    PullDescriptor,
}

impl Operation {
    /// Returns the kind tag of this operation.
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Offer { .. } => OpKind::Offer,
            Operation::Accept { .. } => OpKind::Accept,
            Operation::SendBuffer { .. } => OpKind::SendBuffer,
            Operation::RecvBuffer { .. } => OpKind::RecvBuffer,
            Operation::PushDescriptor { .. } => OpKind::PushDescriptor,
            Operation::PullDescriptor { .. } => OpKind::PullDescriptor,
        }
    }

    /// Returns `true` for the two kinds that open a conversation.
    pub(crate) fn is_handshake(&self) -> bool {
        matches!(
            self,
            Operation::Offer { .. } | Operation::Accept { .. }
        )
    }

    /// Completes the operation with `error`, consuming it.
    pub(crate) fn fail(self, error: LaneError) {
        match self {
            Operation::Offer { complete } => complete(Err(error)),
            Operation::Accept { complete, .. } => complete(Err(error)),
            Operation::SendBuffer { complete, .. } => complete(Err(error)),
            Operation::RecvBuffer { complete, .. } => complete(Err(error)),
            Operation::PushDescriptor { complete, .. } => complete(Err(error)),
            Operation::PullDescriptor { complete, .. } => complete(Err(error)),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OpKind::Offer => write!(f, "offer"),
            OpKind::Accept => write!(f, "accept"),
            OpKind::SendBuffer => write!(f, "send-buffer"),
            OpKind::RecvBuffer => write!(f, "recv-buffer"),
            OpKind::PushDescriptor => write!(f, "push-descriptor"),
            OpKind::PullDescriptor => write!(f, "pull-descriptor"),
        }
    }
}
