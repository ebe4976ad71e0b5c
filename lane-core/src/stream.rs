//! Streams, lanes, and the rendezvous submit/match algorithm.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::debug;
use crate::error::LaneError;
use crate::op::{Operation, RecvCompletion, UnitCompletion};
use crate::universe::{Descriptor, Handle, Universe};

/// A bidirectional channel between two lanes.
///
/// Each lane keeps a FIFO of parked operations. Submitting on one lane
/// matches against the head of the peer lane's queue; a successful match
/// completes both operations. Matching empties the opposite queue before
/// this side's queue can grow, so at most one of the two queues is
/// non-empty at any time.
pub struct Stream {
    peer_count: [AtomicUsize; 2],
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    process_queue: [VecDeque<Operation>; 2],
    // One entry per parked offer/accept, in parking order.
    conversation_queue: VecDeque<Arc<Stream>>,
    lane_broken: [bool; 2],
}

/// A shared reference to one lane of a stream.
///
/// Cloning a handle registers another peer on its lane; dropping
/// deregisters it. When the last handle of a lane goes away the lane
/// breaks, a one-shot transition: parked operations that depended on the
/// lane are failed and later submissions that would need it observe
/// [LaneError::ClosedRemotely].
pub struct LaneHandle {
    stream: Arc<Stream>,
    lane: usize,
}

impl Stream {
    fn with_peers(lane0: usize, lane1: usize) -> Self {
        Self {
            peer_count: [AtomicUsize::new(lane0), AtomicUsize::new(lane1)],
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Creates a stream and hands out one handle per lane.
    pub fn create_pair() -> (LaneHandle, LaneHandle) {
        let stream = Arc::new(Stream::with_peers(1, 1));
        (
            LaneHandle::adopt(Arc::clone(&stream), 0),
            LaneHandle::adopt(stream, 1),
        )
    }

    /// Submits `u` on lane `p`.
    ///
    /// Phase 1 runs under the stream mutex and only moves queue entries;
    /// all copy, attach, and completion work runs in phase 2 after the
    /// lock is released. Returns a handle to the submitter's side of the
    /// conversation child for offer/accept submissions.
    fn submit(&self, p: usize, u: Operation) -> Option<LaneHandle> {
        assert!(p < 2);
        let q = 1 - p;

        let v;
        let conversation;
        {
            let mut state = self.state.lock().unwrap();
            assert!(!state.lane_broken[p], "submission on a broken lane");

            if let Some(parked) = state.process_queue[q].pop_front() {
                // Only parked handshakes have a child waiting in the
                // conversation queue; a matching submission consumes it.
                conversation = if parked.is_handshake() {
                    Some(
                        state
                            .conversation_queue
                            .pop_front()
                            .expect("parked handshake without conversation child"),
                    )
                } else {
                    None
                };
                v = parked;
            } else if state.lane_broken[q] {
                drop(state);
                u.fail(LaneError::ClosedRemotely);
                return None;
            } else if u.is_handshake() {
                state.process_queue[p].push_back(u);

                // The child is born with two handle slots per lane: one
                // adopted here for the parker, one adopted per side when
                // the handshake is matched.
                let child = Arc::new(Stream::with_peers(2, 2));
                let handle = LaneHandle::adopt(Arc::clone(&child), p);
                state.conversation_queue.push_back(child);

                return Some(handle);
            } else {
                state.process_queue[p].push_back(u);
                return None;
            }
        }

        transfer(p, u, v, conversation)
    }

    /// Marks `lane` broken and fails every operation that can no longer
    /// complete. Runs exactly once per lane, on the last handle drop.
    fn close_lane(&self, lane: usize) {
        let mut failed = Vec::new();
        let mut orphans = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            assert!(!state.lane_broken[lane]);
            state.lane_broken[lane] = true;

            debug!("closing lane {lane}");

            // Operations parked on the peer queue were waiting for
            // submissions that can now never arrive on this lane.
            // Operations parked on this lane's own queue stay: a live
            // peer can still match them.
            while let Some(op) = state.process_queue[1 - lane].pop_front() {
                if op.is_handshake() {
                    let child = state
                        .conversation_queue
                        .pop_front()
                        .expect("parked handshake without conversation child");
                    orphans.push(child);
                }
                failed.push(op);
            }
        }

        for op in failed {
            op.fail(LaneError::ClosedRemotely);
        }

        for child in orphans {
            // The parker (on lane `1 - lane`) adopted one handle slot;
            // the rest were never handed out. Retiring them breaks the
            // conversation's far side, so the parker's surviving child
            // handle observes ClosedRemotely when used.
            drop(LaneHandle::adopt(Arc::clone(&child), 1 - lane));
            drop(LaneHandle::adopt(Arc::clone(&child), lane));
            drop(LaneHandle::adopt(child, lane));
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer_count", &self.peer_count)
            .finish_non_exhaustive()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        debug!("closing stream");
    }
}

impl LaneHandle {
    /// Takes over one of the lane's preseeded handle slots without
    /// touching the peer count.
    fn adopt(stream: Arc<Stream>, lane: usize) -> Self {
        LaneHandle { stream, lane }
    }

    /// Returns the index of the lane this handle refers to.
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Submits an operation on this handle's lane.
    ///
    /// Returns a handle to this side of the conversation child for
    /// offer/accept submissions, `None` otherwise.
    pub fn submit(&self, op: Operation) -> Option<LaneHandle> {
        self.stream.submit(self.lane, op)
    }
}

impl Clone for LaneHandle {
    fn clone(&self) -> Self {
        let count = self.stream.peer_count[self.lane].fetch_add(1, Ordering::Relaxed);
        assert!(count >= 1);
        LaneHandle {
            stream: Arc::clone(&self.stream),
            lane: self.lane,
        }
    }
}

impl Drop for LaneHandle {
    fn drop(&mut self) {
        let count = self.stream.peer_count[self.lane].fetch_sub(1, Ordering::Release);
        if count > 1 {
            return;
        }

        // Writes made through other handles must be visible before the
        // lane is torn down.
        fence(Ordering::Acquire);
        self.stream.close_lane(self.lane);
    }
}

impl fmt::Debug for LaneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneHandle")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

/// Phase 2: carries out a matched operation pair outside the stream
/// mutex. `u` was submitted on lane `p`; `v` was parked on lane `1 - p`.
fn transfer(
    p: usize,
    u: Operation,
    v: Operation,
    conversation: Option<Arc<Stream>>,
) -> Option<LaneHandle> {
    let q = 1 - p;

    match (u, v) {
        (
            Operation::Offer { complete: offer },
            Operation::Accept {
                universe,
                complete: accept,
            },
        ) => {
            let child = conversation.expect("matched handshake without conversation child");
            let theirs = LaneHandle::adopt(Arc::clone(&child), q);
            let ours = LaneHandle::adopt(Arc::clone(&child), p);
            // The accept side adopted a slot when it parked; this side's
            // second slot is never handed out.
            drop(LaneHandle::adopt(child, p));

            offer(Ok(()));
            accept(attach(&universe, Descriptor::Lane(theirs)));
            Some(ours)
        }
        (
            Operation::Accept {
                universe,
                complete: accept,
            },
            Operation::Offer { complete: offer },
        ) => {
            let child = conversation.expect("matched handshake without conversation child");
            let mine = LaneHandle::adopt(Arc::clone(&child), p);
            let ours = LaneHandle::adopt(Arc::clone(&child), p);
            // The offer side adopted a slot when it parked; its second
            // slot is never handed out.
            drop(LaneHandle::adopt(child, q));

            offer(Ok(()));
            accept(attach(&universe, Descriptor::Lane(mine)));
            Some(ours)
        }
        (
            Operation::SendBuffer {
                buffer,
                complete: send,
            },
            Operation::RecvBuffer {
                capacity,
                complete: recv,
            },
        ) => {
            copy_buffer(buffer, send, capacity, recv);
            None
        }
        (
            Operation::RecvBuffer {
                capacity,
                complete: recv,
            },
            Operation::SendBuffer {
                buffer,
                complete: send,
            },
        ) => {
            copy_buffer(buffer, send, capacity, recv);
            None
        }
        (
            Operation::PushDescriptor {
                descriptor,
                complete: push,
            },
            Operation::PullDescriptor {
                universe,
                complete: pull,
            },
        ) => {
            push(Ok(()));
            pull(attach(&universe, descriptor));
            None
        }
        (
            Operation::PullDescriptor {
                universe,
                complete: pull,
            },
            Operation::PushDescriptor {
                descriptor,
                complete: push,
            },
        ) => {
            push(Ok(()));
            pull(attach(&universe, descriptor));
            None
        }
        (u, v) => {
            // Kinds were misordered by the caller; this is a protocol
            // bug, not a recoverable condition.
            panic!("operations do not match: {} vs. {}", u.kind(), v.kind());
        }
    }
}

/// Files `descriptor` in the capturing universe, or reports that the
/// universe was torn down before the transfer completed.
fn attach(universe: &Weak<Universe>, descriptor: Descriptor) -> Result<Handle, LaneError> {
    match universe.upgrade() {
        Some(universe) => Ok(universe.attach(descriptor)),
        None => Err(LaneError::ClosedRemotely),
    }
}

fn copy_buffer(
    buffer: Vec<u8>,
    send: UnitCompletion,
    capacity: usize,
    recv: RecvCompletion,
) {
    if buffer.len() > capacity {
        send(Err(LaneError::BufferTooSmall));
        recv(Err(LaneError::BufferTooSmall));
        return;
    }

    send(Ok(()));
    recv(Ok(buffer));
}
