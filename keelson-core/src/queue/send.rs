//! The write queue: ordered pending outbound payloads with per-entry
//! deadlines, cancellation tokens, and completion callbacks.
//!
//! Byte accounting invariant: `size() == sum of entry lengths` after
//! every operation. Watermark events alternate through the `*_wanted`
//! flags: a second high-watermark event cannot be delivered until a
//! low-watermark event has been.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::blob::ConstBufferArray;
use crate::chronology::Timer;
use crate::data::Data;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::options::{BatchOptions, SendToken};
use crate::watermark;

/// Completion context of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendContext {
    /// Bytes accepted from the caller's payload.
    pub bytes_sent: usize,
    /// The caller's cancellation token, if any.
    pub token: Option<SendToken>,
}

/// Send completion callback.
pub type SendCallback = Box<dyn FnOnce(Result<SendContext>) + Send + 'static>;

/// Outcome of a token-keyed cancellation attempt.
pub enum TokenCancellation {
    /// The entry was removed; its callback, when present, must be invoked
    /// with a cancellation status.
    Removed(Option<SendCallback>),
    /// Some of the entry's bytes have already been copied toward the
    /// kernel; cancellation is no longer permitted.
    InProgress,
    /// No entry carries this token.
    NotFound,
}

/// An entry on the write queue.
pub struct SendQueueEntry {
    pub id: u64,
    pub token: Option<SendToken>,
    pub endpoint: Option<Endpoint>,
    pub data: Data,
    /// Remaining bytes; shrinks as the payload drains.
    pub length: usize,
    /// Bytes originally enqueued; reported to the completion callback.
    pub total: usize,
    pub enqueue_time: Instant,
    pub deadline: Option<Instant>,
    pub timer: Option<Arc<Timer>>,
    pub callback: Option<SendCallback>,
    /// True once any byte has been copied to the socket send buffer;
    /// cancellation is permitted only while false.
    pub in_progress: bool,
    pub zero_copy: bool,
}

impl SendQueueEntry {
    #[must_use]
    pub fn new(id: u64, data: Data) -> Self {
        let length = data.size();
        Self {
            id,
            token: None,
            endpoint: None,
            data,
            length,
            total: length,
            enqueue_time: Instant::now(),
            deadline: None,
            timer: None,
            callback: None,
            in_progress: false,
            zero_copy: false,
        }
    }

    /// Close the deadline timer, if armed.
    pub fn close_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.close();
        }
    }

    /// True when this entry may join a gather-list batch.
    #[must_use]
    pub fn is_batchable(&self) -> bool {
        self.data.is_batchable()
    }

    /// The success context reported to the completion callback.
    #[must_use]
    pub fn context(&self) -> SendContext {
        SendContext {
            bytes_sent: self.total,
            token: self.token,
        }
    }
}

/// The write queue.
pub struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    size: usize,
    watermark_low: usize,
    watermark_low_wanted: bool,
    watermark_high: usize,
    watermark_high_wanted: bool,
    next_entry_id: u64,
}

impl SendQueue {
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            size: 0,
            watermark_low: 0,
            watermark_low_wanted: false,
            watermark_high: usize::MAX,
            watermark_high_wanted: true,
            next_entry_id: 0,
        };
        queue.set_low_watermark(low_watermark);
        queue.set_high_watermark(high_watermark);
        queue
    }

    /// Return the next entry identifier.
    pub fn generate_entry_id(&mut self) -> u64 {
        self.next_entry_id += 1;
        self.next_entry_id
    }

    /// Push `entry` onto the queue. Returns true if the queue becomes
    /// non-empty as a result of this operation.
    pub fn push(&mut self, entry: SendQueueEntry) -> bool {
        debug_assert_eq!(entry.length, entry.data.size());
        self.size += entry.length;
        self.entries.push_back(entry);
        self.entries.len() == 1
    }

    #[must_use]
    pub fn front(&self) -> Option<&SendQueueEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut SendQueueEntry> {
        self.entries.front_mut()
    }

    /// Pop the entry off the front of the queue and return it along with
    /// whether the queue became empty.
    pub fn pop(&mut self) -> Option<(SendQueueEntry, bool)> {
        let mut entry = self.entries.pop_front()?;
        entry.close_timer();
        debug_assert!(self.size >= entry.length);
        self.size -= entry.length;
        Some((entry, self.entries.is_empty()))
    }

    /// Pop `num_bytes` from the entry at the front of the queue, marking
    /// it in progress and releasing its deadline timer.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty or the front entry is shorter than
    /// `num_bytes`.
    pub fn pop_bytes(&mut self, num_bytes: usize) {
        let entry = self.entries.front_mut().expect("pop_bytes on empty queue");

        entry.close_timer();
        assert!(entry.length >= num_bytes);
        entry.data.pop_front(num_bytes);
        entry.in_progress = true;
        entry.length -= num_bytes;
        debug_assert_eq!(entry.length, entry.data.size());

        debug_assert!(self.size >= num_bytes);
        self.size -= num_bytes;
    }

    /// Remove the entry having `id` and return its callback, if such an
    /// entry exists with a deadline and has not begun transferring. Used
    /// by the deadline-timer path.
    pub fn remove_by_id(&mut self, id: u64) -> Option<SendCallback> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        let entry = &self.entries[position];
        if entry.deadline.is_none() || entry.in_progress {
            return None;
        }

        let mut entry = self.entries.remove(position)?;
        entry.close_timer();
        debug_assert!(self.size >= entry.length);
        self.size -= entry.length;
        entry.callback.take()
    }

    /// Remove the entry having `token`, if it has not begun transferring.
    pub fn remove_by_token(&mut self, token: SendToken) -> TokenCancellation {
        let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.token == Some(token))
        else {
            return TokenCancellation::NotFound;
        };

        if self.entries[position].in_progress {
            return TokenCancellation::InProgress;
        }

        let mut entry = self.entries.remove(position).expect("position is valid");
        entry.close_timer();
        debug_assert!(self.size >= entry.length);
        self.size -= entry.length;
        TokenCancellation::Removed(entry.callback.take())
    }

    /// Flush every pending callback and clear the queue.
    pub fn remove_all(&mut self) -> Vec<SendCallback> {
        let mut callbacks = Vec::new();
        for mut entry in self.entries.drain(..) {
            entry.close_timer();
            if let Some(callback) = entry.callback.take() {
                callbacks.push(callback);
            }
        }
        self.size = 0;
        callbacks
    }

    pub fn set_low_watermark(&mut self, low_watermark: usize) {
        self.watermark_low = low_watermark;
        watermark::sanitize_outgoing(&mut self.watermark_low, &mut self.watermark_high);
    }

    pub fn set_high_watermark(&mut self, high_watermark: usize) {
        self.watermark_high = high_watermark;
        watermark::sanitize_outgoing(&mut self.watermark_low, &mut self.watermark_high);
    }

    /// Grant a low-watermark event: the queue has drained down to the low
    /// watermark after first breaching the high watermark.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if watermark::outgoing_low_satisfied(self.size, self.watermark_low)
            && self.watermark_low_wanted
        {
            self.watermark_low_wanted = false;
            self.watermark_high_wanted = true;
            return true;
        }
        false
    }

    /// Grant a high-watermark event: the queue has breached the high
    /// watermark, either initially or again after draining down to the
    /// low watermark.
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        self.authorize_high_watermark_event_at(self.watermark_high)
    }

    /// [`SendQueue::authorize_high_watermark_event`] against a caller's
    /// effective threshold, used when one operation tightens backpressure.
    pub fn authorize_high_watermark_event_at(&mut self, effective_high: usize) -> bool {
        if watermark::outgoing_high_violated(self.size, effective_high)
            && self.watermark_high_wanted
        {
            self.watermark_high_wanted = false;
            self.watermark_low_wanted = true;
            return true;
        }
        false
    }

    /// Batch the next range of contiguous batchable entries into one
    /// gather-list, bounded by `options`. Returns `None` when fewer than
    /// two entries can join the batch.
    #[must_use]
    pub fn batch_next(&self, options: &BatchOptions) -> Option<ConstBufferArray> {
        let mut result = ConstBufferArray::new();
        let mut batched = 0;
        let mut segments = Vec::new();

        for entry in &self.entries {
            if !entry.is_batchable() || entry.length == 0 {
                break;
            }

            segments.clear();
            if entry.data.gather_segments(&mut segments).is_err() {
                break;
            }
            if result.num_buffers() + segments.len() > options.max_buffers {
                break;
            }
            if result.total() + entry.length > options.max_bytes {
                break;
            }

            for segment in segments.drain(..) {
                result.push(segment);
            }
            batched += 1;
        }

        (batched >= 2).then_some(result)
    }

    #[inline]
    #[must_use]
    pub const fn low_watermark(&self) -> usize {
        self.watermark_low
    }

    #[inline]
    #[must_use]
    pub const fn high_watermark(&self) -> usize {
        self.watermark_high
    }

    /// Number of bytes on the queue.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    #[must_use]
    pub fn is_low_watermark_satisfied(&self) -> bool {
        watermark::outgoing_low_satisfied(self.size, self.watermark_low)
    }

    #[must_use]
    pub fn is_high_watermark_violated(&self) -> bool {
        watermark::outgoing_high_violated(self.size, self.watermark_high)
    }

    /// Would enqueuing `additional` bytes fill the queue past
    /// `effective_high`?
    #[must_use]
    pub fn would_breach(&self, additional: usize, effective_high: usize) -> bool {
        self.size + additional > effective_high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(queue: &mut SendQueue, payload: &'static [u8]) -> SendQueueEntry {
        let id = queue.generate_entry_id();
        SendQueueEntry::new(id, Data::Buffer(Bytes::from_static(payload)))
    }

    fn total_entry_bytes(queue: &SendQueue) -> usize {
        let mut total = 0;
        let mut index = 0;
        while let Some(e) = queue.entries.get(index) {
            total += e.length;
            index += 1;
        }
        total
    }

    #[test]
    fn push_pop_accounting() {
        let mut queue = SendQueue::new(0, 1024);
        let first = entry(&mut queue, b"hello");
        let second = entry(&mut queue, b"world!!");

        assert!(queue.push(first));
        assert!(!queue.push(second));
        assert_eq!(queue.size(), 12);
        assert_eq!(queue.size(), total_entry_bytes(&queue));

        let (popped, became_empty) = queue.pop().unwrap();
        assert_eq!(popped.length, 5);
        assert!(!became_empty);
        assert_eq!(queue.size(), 7);
        assert_eq!(queue.size(), total_entry_bytes(&queue));

        let (_, became_empty) = queue.pop().unwrap();
        assert!(became_empty);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn pop_bytes_marks_in_progress() {
        let mut queue = SendQueue::new(0, 1024);
        let e = entry(&mut queue, b"abcdef");
        queue.push(e);

        queue.pop_bytes(4);
        let front = queue.front().unwrap();
        assert!(front.in_progress);
        assert_eq!(front.length, 2);
        assert_eq!(queue.size(), 2);
        assert_eq!(front.data.size(), 2);
    }

    #[test]
    fn remove_by_id_requires_deadline_and_not_in_progress() {
        let mut queue = SendQueue::new(0, 1024);

        let mut with_deadline = entry(&mut queue, b"abc");
        with_deadline.deadline = Some(Instant::now());
        with_deadline.callback = Some(Box::new(|_| {}));
        let id = with_deadline.id;
        queue.push(with_deadline);

        let without_deadline = entry(&mut queue, b"def");
        let id_no_deadline = without_deadline.id;
        queue.push(without_deadline);

        assert!(queue.remove_by_id(id_no_deadline).is_none());
        assert_eq!(queue.size(), 6);

        assert!(queue.remove_by_id(id).is_some());
        assert_eq!(queue.size(), 3);

        // a partially transferred entry can no longer be removed
        let mut in_flight = entry(&mut queue, b"ghi");
        in_flight.deadline = Some(Instant::now());
        let id = in_flight.id;
        queue.remove_all();
        queue.push(in_flight);
        queue.pop_bytes(1);
        assert!(queue.remove_by_id(id).is_none());
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn remove_by_token_distinguishes_outcomes() {
        let mut queue = SendQueue::new(0, 1024);
        let token = SendToken::generate();

        let mut e = entry(&mut queue, b"abcd");
        e.token = Some(token);
        e.callback = Some(Box::new(|_| {}));
        queue.push(e);

        assert!(matches!(
            queue.remove_by_token(SendToken::generate()),
            TokenCancellation::NotFound
        ));

        match queue.remove_by_token(token) {
            TokenCancellation::Removed(callback) => assert!(callback.is_some()),
            _ => panic!("expected removal"),
        }
        assert_eq!(queue.size(), 0);

        let mut e = entry(&mut queue, b"abcd");
        e.token = Some(token);
        queue.push(e);
        queue.pop_bytes(2);
        assert!(matches!(
            queue.remove_by_token(token),
            TokenCancellation::InProgress
        ));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn remove_all_flushes_callbacks_and_size() {
        let mut queue = SendQueue::new(0, 1024);
        for payload in [b"abc".as_slice(), b"defg", b"hi"] {
            let mut e = SendQueueEntry::new(
                queue.generate_entry_id(),
                Data::Buffer(Bytes::from_static(payload)),
            );
            e.callback = Some(Box::new(|_| {}));
            queue.push(e);
        }

        let callbacks = queue.remove_all();
        assert_eq!(callbacks.len(), 3);
        assert_eq!(queue.size(), 0);
        assert!(!queue.has_entry());
    }

    #[test]
    fn watermark_events_alternate() {
        let mut queue = SendQueue::new(2, 8);

        // empty queue satisfies the low watermark but no low event is
        // wanted before a high breach
        assert!(!queue.authorize_low_watermark_event());

        queue.push(SendQueueEntry::new(1, Data::from(&b"abcdefgh"[..])));
        assert!(queue.authorize_high_watermark_event());
        // not twice
        assert!(!queue.authorize_high_watermark_event());

        queue.pop_bytes(7);
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());

        // a second breach is granted again after the low event
        queue.pop_bytes(1);
        queue.pop();
        queue.push(SendQueueEntry::new(2, Data::from(&b"0123456789"[..])));
        assert!(queue.authorize_high_watermark_event());
    }

    #[test]
    fn effective_high_watermark_override() {
        let mut queue = SendQueue::new(0, 1024);
        queue.push(SendQueueEntry::new(1, Data::from(&b"abcdef"[..])));

        assert!(!queue.authorize_high_watermark_event());
        assert!(queue.authorize_high_watermark_event_at(4));
        // the grant is consumed until a low event re-arms it
        assert!(!queue.authorize_high_watermark_event_at(4));
    }

    #[test]
    fn sanitizer_keeps_low_at_most_high() {
        let mut queue = SendQueue::new(100, 10);
        assert!(queue.low_watermark() <= queue.high_watermark());

        queue.set_high_watermark(5);
        assert!(queue.low_watermark() <= queue.high_watermark());
    }

    #[test]
    fn batch_next_bounds() {
        let mut queue = SendQueue::new(0, usize::MAX);
        for payload in [b"aaaa".as_slice(), b"bbbb", b"cccc"] {
            queue.push(SendQueueEntry::new(
                queue.next_entry_id + 1,
                Data::Buffer(Bytes::from_static(payload)),
            ));
        }

        let batch = queue
            .batch_next(&BatchOptions {
                max_buffers: 16,
                max_bytes: 1024,
            })
            .unwrap();
        assert_eq!(batch.num_buffers(), 3);
        assert_eq!(batch.total(), 12);

        // byte bound stops the scan
        let batch = queue
            .batch_next(&BatchOptions {
                max_buffers: 16,
                max_bytes: 8,
            })
            .unwrap();
        assert_eq!(batch.total(), 8);

        // a single batchable entry is not worth a gather write
        let mut queue = SendQueue::new(0, usize::MAX);
        queue.push(SendQueueEntry::new(1, Data::from(&b"only"[..])));
        assert!(queue
            .batch_next(&BatchOptions::default())
            .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn batch_next_stops_at_file_regions() {
        use crate::data::FileRegion;
        use std::io::Write;
        use std::sync::Arc;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let mut queue = SendQueue::new(0, usize::MAX);
        queue.push(SendQueueEntry::new(1, Data::from(&b"aaaa"[..])));
        queue.push(SendQueueEntry::new(2, Data::from(&b"bbbb"[..])));
        queue.push(SendQueueEntry::new(
            3,
            Data::File(FileRegion::new(Arc::new(tmp.reopen().unwrap()), 0, 10)),
        ));
        queue.push(SendQueueEntry::new(4, Data::from(&b"cccc"[..])));

        let batch = queue.batch_next(&BatchOptions::default()).unwrap();
        // the scan stops at the first non-batchable entry
        assert_eq!(batch.total(), 8);
        assert_eq!(batch.num_buffers(), 2);
    }
}
