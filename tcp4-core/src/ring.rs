//! Byte ring buffers backing a socket's send and receive queues.

use std::fmt;

/// A power-of-two sized byte ring.
///
/// The enqueue and dequeue positions are monotonically increasing 64-bit
/// counters; the invariant `deq <= enq <= deq + 2^shift` holds at every
/// observable point, and the actual storage offset is the counter masked
/// by the ring size. Monotonic counters make stale-position bugs
/// impossible to mistake for valid state.
pub struct RingBuffer {
    storage: Box<[u8]>,
    shift: u32,
    enq: u64,
    deq: u64,
}

impl RingBuffer {
    /// Creates a ring holding `2^shift` bytes.
    pub fn new(shift: u32) -> Self {
        assert!(shift < 32);
        Self {
            storage: vec![0u8; 1usize << shift].into_boxed_slice(),
            shift,
            enq: 0,
            deq: 0,
        }
    }

    /// Returns the total number of bytes the ring can hold.
    pub fn capacity(&self) -> usize {
        1usize << self.shift
    }

    /// Returns the number of bytes that can currently be enqueued.
    pub fn space_for_enqueue(&self) -> usize {
        self.capacity() - (self.enq - self.deq) as usize
    }

    /// Returns the number of bytes that can currently be dequeued.
    pub fn available_to_dequeue(&self) -> usize {
        (self.enq - self.deq) as usize
    }

    /// Appends `data` to the ring. The caller must have checked
    /// [RingBuffer::space_for_enqueue].
    pub fn enqueue(&mut self, data: &[u8]) {
        assert!(data.len() <= self.space_for_enqueue());

        let ring_size = self.capacity();
        let wrapped = (self.enq & (ring_size as u64 - 1)) as usize;
        let until_end = usize::min(data.len(), ring_size - wrapped);

        self.storage[wrapped..wrapped + until_end].copy_from_slice(&data[..until_end]);
        self.storage[..data.len() - until_end].copy_from_slice(&data[until_end..]);

        self.enq += data.len() as u64;
    }

    /// Removes `data.len()` bytes from the front of the ring.
    pub fn dequeue(&mut self, data: &mut [u8]) {
        self.dequeue_lookahead(0, data);
        self.dequeue_advance(data.len());
    }

    /// Copies `data.len()` bytes starting `offset` bytes past the front
    /// of the ring, without consuming anything. The caller must have
    /// checked [RingBuffer::available_to_dequeue].
    pub fn dequeue_lookahead(&self, offset: usize, data: &mut [u8]) {
        assert!(offset + data.len() <= self.available_to_dequeue());

        let ring_size = self.capacity();
        let wrapped = ((self.deq + offset as u64) & (ring_size as u64 - 1)) as usize;
        let until_end = usize::min(data.len(), ring_size - wrapped);

        data[..until_end].copy_from_slice(&self.storage[wrapped..wrapped + until_end]);
        let rest = data.len() - until_end;
        data[until_end..].copy_from_slice(&self.storage[..rest]);
    }

    /// Consumes `size` bytes from the front of the ring.
    pub fn dequeue_advance(&mut self, size: usize) {
        assert!(size <= self.available_to_dequeue());
        self.deq += size as u64;
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("shift", &self.shift)
            .field("enq", &self.enq)
            .field("deq", &self.deq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn ring_basic_fifo() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.space_for_enqueue(), 16);
        assert_eq!(ring.available_to_dequeue(), 0);

        ring.enqueue(b"hello");
        assert_eq!(ring.space_for_enqueue(), 11);
        assert_eq!(ring.available_to_dequeue(), 5);

        let mut out = [0u8; 5];
        ring.dequeue(&mut out);
        assert_eq!(&out, b"hello");
        assert_eq!(ring.available_to_dequeue(), 0);
        assert_eq!(ring.space_for_enqueue(), 16);
    }

    #[test]
    fn ring_wraps_across_the_boundary() {
        let mut ring = RingBuffer::new(3);

        // Move the positions close to the wrap point, then cross it.
        ring.enqueue(b"abcdef");
        let mut out = [0u8; 6];
        ring.dequeue(&mut out);

        ring.enqueue(b"wrapped!");
        let mut out = [0u8; 8];
        ring.dequeue(&mut out);
        assert_eq!(&out, b"wrapped!");
    }

    #[test]
    fn ring_lookahead_respects_offset_and_keeps_bytes() {
        let mut ring = RingBuffer::new(4);
        ring.enqueue(b"0123456789");

        let mut out = [0u8; 4];
        ring.dequeue_lookahead(3, &mut out);
        assert_eq!(&out, b"3456");

        // Nothing was consumed.
        assert_eq!(ring.available_to_dequeue(), 10);

        ring.dequeue_advance(5);
        let mut out = [0u8; 5];
        ring.dequeue_lookahead(0, &mut out);
        assert_eq!(&out, b"56789");
    }

    #[test]
    fn ring_lookahead_wraps_with_offset() {
        let mut ring = RingBuffer::new(3);

        ring.enqueue(b"abcde");
        let mut out = [0u8; 5];
        ring.dequeue(&mut out);

        // The next six bytes straddle the wrap point.
        ring.enqueue(b"012345");
        let mut out = [0u8; 3];
        ring.dequeue_lookahead(2, &mut out);
        assert_eq!(&out, b"234");
    }

    #[test]
    #[should_panic]
    fn ring_enqueue_past_capacity_panics() {
        let mut ring = RingBuffer::new(2);
        ring.enqueue(b"too many bytes");
    }

    proptest! {
        #[test]
        fn ring_matches_a_queue_model(ops in prop::collection::vec((any::<bool>(), prop::collection::vec(any::<u8>(), 0..24)), 0..64)) {
            let mut ring = RingBuffer::new(5);
            let mut model: VecDeque<u8> = VecDeque::new();

            for (is_enqueue, data) in ops {
                if is_enqueue {
                    let take = usize::min(data.len(), ring.space_for_enqueue());
                    ring.enqueue(&data[..take]);
                    model.extend(&data[..take]);
                } else {
                    let take = usize::min(data.len(), ring.available_to_dequeue());
                    let mut out = vec![0u8; take];
                    ring.dequeue(&mut out);
                    let expected: Vec<u8> = model.drain(..take).collect();
                    prop_assert_eq!(out, expected);
                }

                prop_assert_eq!(ring.available_to_dequeue(), model.len());
                prop_assert!(ring.available_to_dequeue() + ring.space_for_enqueue() == ring.capacity());
            }
        }
    }
}
