//! Segment-aware fair send queue.
//!
//! A relay node bridging cluster segments must not let one segment's bulk
//! transfer hog the link. The queue keeps a FIFO per segment and dequeues
//! across non-empty segments in round robin.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct FairSendQueue {
    current_segment: Option<i32>,
    last_pushed_segment: Option<i32>,
    queued_bytes: usize,
    queues: BTreeMap<i32, VecDeque<Bytes>>,
}

impl FairSendQueue {
    pub fn new() -> Self {
        FairSendQueue::default()
    }

    /// Append a datagram to `segment`'s sub-queue.
    pub fn push_back(&mut self, segment: i32, datagram: Bytes) {
        debug_assert!(self.current_segment.is_some() || self.is_empty());
        debug_assert!(self.queued_bytes > 0 || self.is_empty());
        let len = datagram.len();
        self.queues.entry(segment).or_default().push_back(datagram);
        if self.current_segment.is_none() {
            self.current_segment = Some(segment);
        }
        self.last_pushed_segment = Some(segment);
        self.queued_bytes += len;
    }

    /// The next datagram to send, from the segment whose turn it is.
    pub fn front(&self) -> Option<&Bytes> {
        let segment = self.current_segment?;
        self.queues.get(&segment)?.front()
    }

    /// The most recently pushed datagram.
    pub fn back(&self) -> Option<&Bytes> {
        let segment = self.last_pushed_segment?;
        self.queues.get(&segment)?.back()
    }

    /// Remove and return the front datagram, then advance the round robin
    /// to the next non-empty segment.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let segment = self.current_segment?;
        let queue = self.queues.get_mut(&segment)?;
        let datagram = queue.pop_front()?;
        debug_assert!(datagram.len() <= self.queued_bytes);
        self.queued_bytes -= datagram.len();
        self.current_segment = self.next_segment(segment);
        Some(datagram)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|queue| queue.is_empty())
    }

    /// Total number of queued datagrams across all segments.
    pub fn len(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Snapshot of `(segment, queued datagrams)` pairs. Segments stay
    /// listed after they drain.
    pub fn segments(&self) -> Vec<(i32, usize)> {
        self.queues
            .iter()
            .map(|(segment, queue)| (*segment, queue.len()))
            .collect()
    }

    /// Walk segments in ascending order starting after `current`, wrapping
    /// around, until a non-empty one is found. `current` itself is
    /// considered last; if every sub-queue is empty there is no next
    /// segment.
    fn next_segment(&self, current: i32) -> Option<i32> {
        let after = self
            .queues
            .range((Bound::Excluded(current), Bound::Unbounded));
        let wrapped = self.queues.range(..=current);
        for (segment, queue) in after.chain(wrapped) {
            if !queue.is_empty() {
                return Some(*segment);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dg(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn empty_queue_has_no_current_segment() {
        let queue = FairSendQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.front().is_none());
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let mut queue = FairSendQueue::new();
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn single_segment_is_fifo() {
        let mut queue = FairSendQueue::new();
        queue.push_back(0, dg(1, 4));
        queue.push_back(0, dg(2, 4));
        assert_eq!(queue.pop_front().unwrap(), dg(1, 4));
        assert_eq!(queue.pop_front().unwrap(), dg(2, 4));
        assert!(queue.is_empty());
    }

    #[test]
    fn two_segments_interleave() {
        let mut queue = FairSendQueue::new();
        queue.push_back(1, dg(1, 1));
        queue.push_back(2, dg(2, 1));
        queue.push_back(1, dg(3, 1));
        queue.push_back(2, dg(4, 1));

        assert_eq!(queue.pop_front().unwrap(), dg(1, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(2, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(3, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(4, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn round_robin_visits_every_nonempty_segment_once() {
        let mut queue = FairSendQueue::new();
        for segment in [0, 1, 2] {
            queue.push_back(segment, dg(segment as u8, 1));
            queue.push_back(segment, dg(segment as u8 + 10, 1));
        }

        let first_cycle: Vec<u8> = (0..3).map(|_| queue.pop_front().unwrap()[0]).collect();
        assert_eq!(first_cycle, vec![0, 1, 2]);
        let second_cycle: Vec<u8> = (0..3).map(|_| queue.pop_front().unwrap()[0]).collect();
        assert_eq!(second_cycle, vec![10, 11, 12]);
    }

    #[test]
    fn drained_segment_is_skipped() {
        let mut queue = FairSendQueue::new();
        queue.push_back(0, dg(1, 1));
        queue.push_back(1, dg(2, 1));
        queue.push_back(1, dg(3, 1));

        assert_eq!(queue.pop_front().unwrap(), dg(1, 1));
        // segment 0 is now empty; both remaining pops come from segment 1
        assert_eq!(queue.pop_front().unwrap(), dg(2, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(3, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn queued_bytes_tracks_every_push_and_pop() {
        let mut queue = FairSendQueue::new();
        queue.push_back(0, dg(1, 3));
        queue.push_back(2, dg(2, 5));
        queue.push_back(0, dg(3, 7));
        assert_eq!(queue.queued_bytes(), 15);
        assert_eq!(queue.len(), 3);

        queue.pop_front();
        assert_eq!(queue.queued_bytes(), 12);
        queue.pop_front();
        assert_eq!(queue.queued_bytes(), 7);
        queue.pop_front();
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn back_follows_last_pushed_segment() {
        let mut queue = FairSendQueue::new();
        queue.push_back(3, dg(1, 1));
        queue.push_back(1, dg(2, 1));
        assert_eq!(queue.back().unwrap(), &dg(2, 1));
        queue.push_back(3, dg(3, 1));
        assert_eq!(queue.back().unwrap(), &dg(3, 1));
    }

    #[test]
    fn segments_snapshot_keeps_drained_entries() {
        let mut queue = FairSendQueue::new();
        queue.push_back(0, dg(1, 1));
        queue.push_back(5, dg(2, 1));
        queue.pop_front();
        assert_eq!(queue.segments(), vec![(0, 0), (5, 1)]);
    }

    #[test]
    fn push_after_full_drain_restarts_round_robin() {
        let mut queue = FairSendQueue::new();
        queue.push_back(2, dg(1, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(1, 1));
        assert!(queue.is_empty());
        assert!(queue.front().is_none());

        queue.push_back(7, dg(2, 1));
        assert_eq!(queue.front().unwrap(), &dg(2, 1));
        assert_eq!(queue.pop_front().unwrap(), dg(2, 1));
    }
}
