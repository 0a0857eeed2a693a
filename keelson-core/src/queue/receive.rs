//! The read queue: bytes accumulated from the socket plus the pending
//! receive completions waiting on them.
//!
//! A completion carries a minimum-byte threshold; the head completion is
//! popped exactly when the queue holds at least that many bytes. The
//! AIMD [`ReceiveFeedback`] controller advises how much to ask the
//! kernel for on each read.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::blob::Blob;
use crate::chronology::Timer;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::options::ReceiveToken;
use crate::watermark;

/// Completion context of a successful receive.
pub struct ReceiveContext {
    /// The delivered bytes.
    pub data: Blob,
    /// Sender endpoint, when the transport provides one per datagram.
    pub endpoint: Option<Endpoint>,
    /// The caller's cancellation token, if any.
    pub token: Option<ReceiveToken>,
}

/// Receive completion callback.
pub type ReceiveCallback = Box<dyn FnOnce(Result<ReceiveContext>) + Send + 'static>;

/// Accumulated data awaiting delivery.
pub struct ReceiveQueueEntry {
    pub endpoint: Option<Endpoint>,
    pub data: Bytes,
    pub length: usize,
    pub arrive_time: Instant,
}

impl ReceiveQueueEntry {
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        let length = data.len();
        Self {
            endpoint: None,
            data,
            length,
            arrive_time: Instant::now(),
        }
    }
}

/// A queued receive completion.
pub struct ReceiveCallbackEntry {
    pub id: u64,
    pub callback: ReceiveCallback,
    pub min_bytes: usize,
    pub token: Option<ReceiveToken>,
    pub timer: Option<Arc<Timer>>,
}

impl ReceiveCallbackEntry {
    /// Close the deadline timer, if armed.
    pub fn close_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.close();
        }
    }
}

/// Additive-increase/multiplicative-decrease advice for per-call read
/// sizes.
///
/// When a read fills at least the threshold share of what was asked for,
/// the sender is keeping up with us and the next ask grows additively.
/// Ten consecutive under-filled reads shrink the ask multiplicatively.
#[derive(Debug, Clone)]
pub struct ReceiveFeedback {
    minimum: usize,
    current: usize,
    maximum: usize,
    increase_factor: usize,
    decrease_factor: usize,
    streak: u32,
}

impl ReceiveFeedback {
    /// Additive increase applied on congestion.
    pub const INCREASE_FACTOR: usize = 8192;
    /// Multiplicative decrease applied after a non-congested streak.
    pub const DECREASE_FACTOR: usize = 2;
    /// Congestion threshold, in percent of the receivable amount.
    pub const THRESHOLD_PERCENT: usize = 90;
    /// Length of the non-congested streak that triggers a decrease.
    const DECREASE_STREAK: u32 = 10;

    #[must_use]
    pub fn new(minimum: usize, maximum: usize) -> Self {
        let minimum = minimum.max(1);
        Self {
            minimum,
            current: minimum,
            maximum: maximum.max(minimum),
            increase_factor: Self::INCREASE_FACTOR,
            decrease_factor: Self::DECREASE_FACTOR,
            streak: 0,
        }
    }

    /// Feed the outcome of one read: how much was receivable and how much
    /// actually arrived.
    pub fn set_feedback(&mut self, bytes_receivable: usize, bytes_received: usize) {
        if bytes_received > bytes_receivable {
            return;
        }
        let threshold = (bytes_receivable * Self::THRESHOLD_PERCENT) / 100;
        self.set_congestion(bytes_received >= threshold);
    }

    fn set_congestion(&mut self, congestion: bool) {
        if congestion {
            if self.current < self.maximum {
                self.current = (self.current + self.increase_factor).min(self.maximum);
            }
        } else {
            self.streak += 1;
            if self.streak < Self::DECREASE_STREAK {
                return;
            }
            self.streak = 0;
            if self.current > self.minimum {
                self.current = (self.current / self.decrease_factor).max(self.minimum);
            }
        }
    }

    #[inline]
    #[must_use]
    pub const fn minimum(&self) -> usize {
        self.minimum
    }

    /// The advised size of the next read.
    #[inline]
    #[must_use]
    pub const fn current(&self) -> usize {
        self.current
    }

    #[inline]
    #[must_use]
    pub const fn maximum(&self) -> usize {
        self.maximum
    }
}

/// The read queue.
pub struct ReceiveQueue {
    entries: VecDeque<ReceiveQueueEntry>,
    size: usize,
    watermark_low: usize,
    watermark_low_wanted: bool,
    watermark_high: usize,
    watermark_high_wanted: bool,
    callbacks: VecDeque<ReceiveCallbackEntry>,
    next_callback_id: u64,
}

impl ReceiveQueue {
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            size: 0,
            watermark_low: 1,
            watermark_low_wanted: true,
            watermark_high: usize::MAX,
            watermark_high_wanted: true,
            callbacks: VecDeque::new(),
            next_callback_id: 0,
        };
        queue.set_low_watermark(low_watermark);
        queue.set_high_watermark(high_watermark);
        queue
    }

    /// Return the next callback identifier.
    pub fn generate_callback_id(&mut self) -> u64 {
        self.next_callback_id += 1;
        self.next_callback_id
    }

    /// Push accumulated bytes. Returns true if the queue becomes
    /// non-empty as a result of this operation.
    pub fn push_entry(&mut self, entry: ReceiveQueueEntry) -> bool {
        debug_assert!(entry.length > 0);
        self.size += entry.length;
        self.entries.push_back(entry);
        self.entries.len() == 1
    }

    #[must_use]
    pub fn front(&self) -> Option<&ReceiveQueueEntry> {
        self.entries.front()
    }

    /// Pop the entry off the front of the queue. Dropping below the low
    /// watermark re-arms both watermark events.
    pub fn pop_entry(&mut self) -> Option<ReceiveQueueEntry> {
        let entry = self.entries.pop_front()?;
        debug_assert!(self.size >= entry.length);
        self.size -= entry.length;
        self.rearm_if_drained();
        Some(entry)
    }

    /// Pop `num_bytes` from the entry at the front of the queue.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty or the front entry is shorter than
    /// `num_bytes`.
    pub fn pop_bytes(&mut self, num_bytes: usize) {
        let entry = self.entries.front_mut().expect("pop_bytes on empty queue");
        assert!(entry.length >= num_bytes);
        entry.data = entry.data.slice(num_bytes..);
        entry.length -= num_bytes;
        debug_assert!(self.size >= num_bytes);
        self.size -= num_bytes;
        if entry.length == 0 {
            self.entries.pop_front();
        }
        self.rearm_if_drained();
    }

    fn rearm_if_drained(&mut self) {
        if self.size < self.watermark_low {
            self.watermark_low_wanted = true;
            self.watermark_high_wanted = true;
        }
    }

    /// Drain up to `max_bytes` from the front of the queue into a blob.
    pub fn drain_into_blob(&mut self, max_bytes: usize) -> (Blob, Option<Endpoint>) {
        let mut blob = Blob::new();
        let mut endpoint = None;
        while blob.len() < max_bytes {
            let Some(front) = self.entries.front() else {
                break;
            };
            if endpoint.is_none() {
                endpoint = front.endpoint.clone();
            }
            let take = front.length.min(max_bytes - blob.len());
            let bytes = self.entries.front().expect("checked above").data.slice(..take);
            blob.push(bytes);
            self.pop_bytes(take);
        }
        (blob, endpoint)
    }

    /// Queue a receive completion.
    pub fn push_callback(&mut self, entry: ReceiveCallbackEntry) {
        self.callbacks.push_back(entry);
    }

    /// Pop the head completion when its threshold is satisfied by the
    /// bytes currently queued.
    pub fn pop_callback(&mut self) -> Option<ReceiveCallbackEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let head = self.callbacks.front()?;
        if self.size < head.min_bytes {
            return None;
        }
        let mut entry = self.callbacks.pop_front()?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove the completion having `id`, if still queued. Used by the
    /// deadline-timer path.
    pub fn remove_callback_by_id(&mut self, id: u64) -> Option<ReceiveCallbackEntry> {
        let position = self.callbacks.iter().position(|entry| entry.id == id)?;
        let mut entry = self.callbacks.remove(position)?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove the completion having `token`, if still queued.
    pub fn remove_callback_by_token(&mut self, token: ReceiveToken) -> Option<ReceiveCallbackEntry> {
        let position = self
            .callbacks
            .iter()
            .position(|entry| entry.token == Some(token))?;
        let mut entry = self.callbacks.remove(position)?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove every queued completion.
    pub fn pop_all_callbacks(&mut self) -> Vec<ReceiveCallbackEntry> {
        let mut callbacks: Vec<_> = self.callbacks.drain(..).collect();
        for entry in &mut callbacks {
            entry.close_timer();
        }
        callbacks
    }

    pub fn set_low_watermark(&mut self, low_watermark: usize) {
        self.watermark_low = low_watermark.max(1);
        self.watermark_low_wanted = true;
        watermark::sanitize_incoming(&mut self.watermark_low, &mut self.watermark_high);
    }

    pub fn set_high_watermark(&mut self, high_watermark: usize) {
        self.watermark_high = high_watermark;
        watermark::sanitize_incoming(&mut self.watermark_low, &mut self.watermark_high);
    }

    /// Grant a low-watermark event: the queue has filled to at least the
    /// low watermark.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if watermark::incoming_low_satisfied(self.size, self.watermark_low)
            && self.watermark_low_wanted
        {
            self.watermark_low_wanted = false;
            return true;
        }
        false
    }

    /// Grant a high-watermark event: the queue has filled past the high
    /// watermark.
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if watermark::incoming_high_violated(self.size, self.watermark_high)
            && self.watermark_high_wanted
        {
            self.watermark_high_wanted = false;
            return true;
        }
        false
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

    #[inline]
    #[must_use]
    pub fn has_callback(&self) -> bool {
        !self.callbacks.is_empty()
    }

    #[must_use]
    pub fn is_high_watermark_violated(&self) -> bool {
        watermark::incoming_high_violated(self.size, self.watermark_high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_bytes(queue: &mut ReceiveQueue, payload: &'static [u8]) {
        queue.push_entry(ReceiveQueueEntry::new(Bytes::from_static(payload)));
    }

    fn callback_entry(queue: &mut ReceiveQueue, min_bytes: usize) -> ReceiveCallbackEntry {
        ReceiveCallbackEntry {
            id: queue.generate_callback_id(),
            callback: Box::new(|_| {}),
            min_bytes,
            token: None,
            timer: None,
        }
    }

    #[test]
    fn byte_accounting() {
        let mut queue = ReceiveQueue::new(1, 1024);
        assert!(queue.push_entry(ReceiveQueueEntry::new(Bytes::from_static(b"abc"))));
        assert!(!queue.push_entry(ReceiveQueueEntry::new(Bytes::from_static(b"defg"))));
        assert_eq!(queue.size(), 7);

        queue.pop_bytes(2);
        assert_eq!(queue.size(), 5);
        assert_eq!(queue.front().unwrap().length, 1);

        queue.pop_bytes(1);
        // the drained entry is dropped
        assert_eq!(queue.front().unwrap().length, 4);
        assert_eq!(queue.size(), 4);
    }

    #[test]
    fn callback_pops_only_when_threshold_met() {
        let mut queue = ReceiveQueue::new(1, 1024);
        let entry = callback_entry(&mut queue, 5);
        queue.push_callback(entry);

        assert!(queue.pop_callback().is_none());

        push_bytes(&mut queue, b"abc");
        assert!(queue.pop_callback().is_none());

        push_bytes(&mut queue, b"de");
        let popped = queue.pop_callback().expect("threshold met");
        assert_eq!(popped.min_bytes, 5);
        assert!(queue.pop_callback().is_none());
    }

    #[test]
    fn callbacks_complete_in_fifo_order() {
        let mut queue = ReceiveQueue::new(1, 1024);
        let first = callback_entry(&mut queue, 10);
        let second = callback_entry(&mut queue, 1);
        let first_id = first.id;
        queue.push_callback(first);
        queue.push_callback(second);

        // the head callback gates the queue even when a later one could
        // already be satisfied
        push_bytes(&mut queue, b"abc");
        assert!(queue.pop_callback().is_none());

        push_bytes(&mut queue, b"0123456");
        assert_eq!(queue.pop_callback().unwrap().id, first_id);
    }

    #[test]
    fn drain_into_blob_collects_across_entries() {
        let mut queue = ReceiveQueue::new(1, 1024);
        push_bytes(&mut queue, b"abc");
        push_bytes(&mut queue, b"def");

        let (blob, _) = queue.drain_into_blob(5);
        assert_eq!(&blob.to_bytes()[..], b"abcde");
        assert_eq!(queue.size(), 1);

        let (blob, _) = queue.drain_into_blob(usize::MAX);
        assert_eq!(&blob.to_bytes()[..], b"f");
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn remove_callback_by_token() {
        let mut queue = ReceiveQueue::new(1, 1024);
        let token = ReceiveToken::generate();
        let mut entry = callback_entry(&mut queue, 1);
        entry.token = Some(token);
        queue.push_callback(entry);

        assert!(queue.remove_callback_by_token(ReceiveToken::generate()).is_none());
        assert!(queue.remove_callback_by_token(token).is_some());
        assert!(!queue.has_callback());
    }

    #[test]
    fn watermark_rearm_on_drain() {
        let mut queue = ReceiveQueue::new(4, 8);

        push_bytes(&mut queue, b"abcdefghij");
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());
        assert!(queue.authorize_high_watermark_event());
        assert!(!queue.authorize_high_watermark_event());

        // draining below the low watermark re-arms both events
        queue.pop_bytes(9);
        // only 1 byte queued: re-armed but not yet satisfied
        assert!(!queue.authorize_low_watermark_event());
        push_bytes(&mut queue, b"wxyz");
        assert!(queue.authorize_low_watermark_event());
        push_bytes(&mut queue, b"0123456789");
        assert!(queue.authorize_high_watermark_event());
    }

    #[test]
    fn feedback_additive_increase() {
        let mut feedback = ReceiveFeedback::new(4096, 131_072);
        assert_eq!(feedback.current(), 4096);

        // full reads grow the ask additively
        feedback.set_feedback(4096, 4096);
        assert_eq!(feedback.current(), 4096 + ReceiveFeedback::INCREASE_FACTOR);

        // 90% of the ask still counts as congestion
        feedback.set_feedback(1000, 900);
        assert_eq!(
            feedback.current(),
            4096 + 2 * ReceiveFeedback::INCREASE_FACTOR
        );

        // growth is clamped at the maximum
        for _ in 0..100 {
            feedback.set_feedback(100, 100);
        }
        assert_eq!(feedback.current(), 131_072);
    }

    #[test]
    fn feedback_multiplicative_decrease_after_streak() {
        let mut feedback = ReceiveFeedback::new(4096, 131_072);
        feedback.set_feedback(4096, 4096);
        feedback.set_feedback(4096, 4096);
        let grown = feedback.current();

        // nine under-filled reads change nothing
        for _ in 0..9 {
            feedback.set_feedback(4096, 10);
        }
        assert_eq!(feedback.current(), grown);

        // the tenth halves the ask
        feedback.set_feedback(4096, 10);
        assert_eq!(
            feedback.current(),
            (grown / ReceiveFeedback::DECREASE_FACTOR).max(4096)
        );

        // shrink is clamped at the minimum
        for _ in 0..200 {
            feedback.set_feedback(4096, 10);
        }
        assert_eq!(feedback.current(), 4096);
    }

    #[test]
    fn feedback_ignores_nonsense_samples() {
        let mut feedback = ReceiveFeedback::new(4096, 131_072);
        feedback.set_feedback(100, 200);
        assert_eq!(feedback.current(), 4096);
    }
}
