//! Per-context output chain with free/busy recycling.
//!
//! Segments live in an index-addressed arena; `free` and `busy` hold
//! indices only. A segment handed out by `allocate` is held by the caller
//! and sits in neither list until it is enqueued.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;

use crate::buffer::{pool::SegmentPool, BufferError};

/// Handle to a segment in a chain's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Held,
    Busy,
    Free,
}

#[derive(Debug)]
struct Segment {
    data: BytesMut,
    /// Bytes of `data` already flushed to the client.
    cursor: usize,
    owner: Owner,
}

impl Segment {
    fn spare(&self, capacity: usize) -> usize {
        capacity - self.data.len()
    }

    fn is_flushed(&self) -> bool {
        self.cursor == self.data.len()
    }
}

/// Output buffers of one proxied response.
#[derive(Debug)]
pub struct BufferChain {
    pool: Arc<SegmentPool>,
    slots: Vec<Option<Segment>>,
    vacant: Vec<usize>,
    free: VecDeque<SegmentId>,
    busy: VecDeque<SegmentId>,
    keep_free: usize,
}

impl BufferChain {
    /// Create an empty chain drawing from `pool`. At most `keep_free`
    /// reclaimed segments are kept for reuse; the rest go back to the pool.
    pub fn new(pool: Arc<SegmentPool>, keep_free: usize) -> Self {
        Self {
            pool,
            slots: Vec::new(),
            vacant: Vec::new(),
            free: VecDeque::new(),
            busy: VecDeque::new(),
            keep_free,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.pool.segment_size()
    }

    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    /// Take a segment able to hold `n` bytes.
    pub fn allocate(&mut self, n: usize) -> Result<SegmentId, BufferError> {
        let capacity = self.segment_size();
        if n > capacity {
            return Err(BufferError::Oversized { requested: n, capacity });
        }

        if let Some(id) = self.free.pop_front() {
            self.segment_mut(id).owner = Owner::Held;
            return Ok(id);
        }

        if !self.pool.try_reserve() {
            return Err(BufferError::Backpressure);
        }

        let segment = Segment {
            data: BytesMut::with_capacity(capacity),
            cursor: 0,
            owner: Owner::Held,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(segment);
                index
            }
            None => {
                self.slots.push(Some(segment));
                self.slots.len() - 1
            }
        };
        Ok(SegmentId(index))
    }

    /// Copy as much of `bytes` as fits into a held segment.
    pub fn write(&mut self, id: SegmentId, bytes: &[u8]) -> Result<usize, BufferError> {
        let capacity = self.segment_size();
        let segment = self.slot_mut(id)?;
        if segment.owner != Owner::Held {
            return Err(BufferError::NotHeld(id));
        }
        let n = segment.spare(capacity).min(bytes.len());
        segment.data.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    /// Append a held segment to the output queue.
    pub fn enqueue(&mut self, id: SegmentId) -> Result<(), BufferError> {
        let segment = self.slot_mut(id)?;
        if segment.owner != Owner::Held {
            return Err(BufferError::NotHeld(id));
        }
        segment.owner = Owner::Busy;
        self.busy.push_back(id);
        Ok(())
    }

    /// Queue `bytes` for output, filling the tail segment first.
    ///
    /// Returns how many bytes were accepted; fewer than `bytes.len()` means
    /// the pool is at its ceiling.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let capacity = self.segment_size();
        let mut accepted = 0;

        if let Some(&tail) = self.busy.back() {
            let segment = self.segment_mut(tail);
            let n = segment.spare(capacity).min(bytes.len());
            segment.data.extend_from_slice(&bytes[..n]);
            accepted += n;
        }

        while accepted < bytes.len() {
            let id = match self.allocate(capacity) {
                Ok(id) => id,
                Err(_) => break,
            };
            let segment = self.segment_mut(id);
            let n = capacity.min(bytes.len() - accepted);
            segment.data.extend_from_slice(&bytes[accepted..accepted + n]);
            segment.owner = Owner::Busy;
            self.busy.push_back(id);
            accepted += n;
        }

        accepted
    }

    /// Oldest unflushed bytes, if any.
    pub fn pending(&self) -> Option<&[u8]> {
        self.busy
            .iter()
            .map(|&id| self.segment(id))
            .find(|s| !s.is_flushed())
            .map(|s| &s.data[s.cursor..])
    }

    /// Mark `n` pending bytes as flushed, in output order.
    pub fn advance(&mut self, mut n: usize) {
        for i in 0..self.busy.len() {
            if n == 0 {
                break;
            }
            let id = self.busy[i];
            let segment = self.segment_mut(id);
            let step = (segment.data.len() - segment.cursor).min(n);
            segment.cursor += step;
            n -= step;
        }
        debug_assert_eq!(n, 0, "advanced past pending output");
    }

    /// Move fully flushed segments from the head of `busy` to `free`.
    /// A partially flushed head stays where it is.
    pub fn reclaim(&mut self) -> usize {
        let mut moved = 0;
        while let Some(&head) = self.busy.front() {
            if !self.segment(head).is_flushed() {
                break;
            }
            self.busy.pop_front();
            moved += 1;

            if self.free.len() < self.keep_free {
                let segment = self.segment_mut(head);
                segment.data.clear();
                segment.cursor = 0;
                segment.owner = Owner::Free;
                self.free.push_back(head);
            } else {
                self.slots[head.0] = None;
                self.vacant.push(head.0);
                self.pool.release(1);
            }
        }
        moved
    }

    /// Bytes queued but not yet flushed.
    pub fn pending_bytes(&self) -> usize {
        self.busy
            .iter()
            .map(|&id| {
                let s = self.segment(id);
                s.data.len() - s.cursor
            })
            .sum()
    }

    pub fn is_flushed(&self) -> bool {
        self.pending_bytes() == 0
    }

    pub fn busy_len(&self) -> usize {
        self.busy.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Segments this chain currently holds a reservation for.
    pub fn live_segments(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Drop every segment and return all reservations to the pool.
    pub fn release(&mut self) {
        let live = self.live_segments();
        self.slots.clear();
        self.vacant.clear();
        self.free.clear();
        self.busy.clear();
        self.pool.release(live);
    }

    fn slot_mut(&mut self, id: SegmentId) -> Result<&mut Segment, BufferError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(BufferError::UnknownSegment(id))
    }

    fn segment(&self, id: SegmentId) -> &Segment {
        self.slots[id.0].as_ref().expect("queued segment has a slot")
    }

    fn segment_mut(&mut self, id: SegmentId) -> &mut Segment {
        self.slots[id.0].as_mut().expect("queued segment has a slot")
    }

    #[cfg(test)]
    fn assert_disjoint(&self) {
        for id in &self.busy {
            assert!(!self.free.contains(id), "{:?} in both lists", id);
            assert_eq!(self.segment(*id).owner, Owner::Busy);
        }
        for id in &self.free {
            assert_eq!(self.segment(*id).owner, Owner::Free);
        }
    }
}

impl Drop for BufferChain {
    fn drop(&mut self) {
        self.release();
    }
}
