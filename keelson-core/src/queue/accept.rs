//! The accept queue: already-accepted child sockets awaiting the user,
//! plus pending accept completions.
//!
//! Shaped like the read queue, but watermarks count connections rather
//! than bytes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::chronology::Timer;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::options::AcceptToken;
use crate::watermark;

/// Completion context of a successful accept.
pub struct AcceptContext<T> {
    /// The accepted child.
    pub child: T,
    /// The peer's endpoint.
    pub peer: Option<Endpoint>,
    /// The caller's cancellation token, if any.
    pub token: Option<AcceptToken>,
}

/// Accept completion callback.
pub type AcceptCallback<T> = Box<dyn FnOnce(Result<AcceptContext<T>>) + Send + 'static>;

/// An accepted child waiting to be dequeued.
pub struct AcceptQueueEntry<T> {
    pub child: T,
    pub peer: Option<Endpoint>,
    pub arrive_time: Instant,
}

/// A queued accept completion.
pub struct AcceptCallbackEntry<T> {
    pub id: u64,
    pub callback: AcceptCallback<T>,
    pub token: Option<AcceptToken>,
    pub timer: Option<Arc<Timer>>,
}

impl<T> AcceptCallbackEntry<T> {
    /// Close the deadline timer, if armed.
    pub fn close_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.close();
        }
    }
}

/// The accept queue.
pub struct AcceptQueue<T> {
    entries: VecDeque<AcceptQueueEntry<T>>,
    watermark_low: usize,
    watermark_low_wanted: bool,
    watermark_high: usize,
    watermark_high_wanted: bool,
    callbacks: VecDeque<AcceptCallbackEntry<T>>,
    next_callback_id: u64,
}

impl<T> AcceptQueue<T> {
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
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

    /// Queue an accepted child. Returns true if the queue becomes
    /// non-empty as a result of this operation.
    pub fn push_entry(&mut self, entry: AcceptQueueEntry<T>) -> bool {
        self.entries.push_back(entry);
        self.entries.len() == 1
    }

    /// Dequeue the oldest accepted child. Dropping below the low
    /// watermark re-arms both watermark events.
    pub fn pop_entry(&mut self) -> Option<AcceptQueueEntry<T>> {
        let entry = self.entries.pop_front()?;
        if self.entries.len() < self.watermark_low {
            self.watermark_low_wanted = true;
            self.watermark_high_wanted = true;
        }
        Some(entry)
    }

    /// Queue an accept completion.
    pub fn push_callback(&mut self, entry: AcceptCallbackEntry<T>) {
        self.callbacks.push_back(entry);
    }

    /// Pop the head completion when a child is available for it.
    pub fn pop_callback(&mut self) -> Option<AcceptCallbackEntry<T>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut entry = self.callbacks.pop_front()?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove the completion having `id`, if still queued. Used by the
    /// deadline-timer path; the deadline cancels the waiting callback,
    /// never the listener.
    pub fn remove_callback_by_id(&mut self, id: u64) -> Option<AcceptCallbackEntry<T>> {
        let position = self.callbacks.iter().position(|entry| entry.id == id)?;
        let mut entry = self.callbacks.remove(position)?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove the completion having `token`, if still queued.
    pub fn remove_callback_by_token(&mut self, token: AcceptToken) -> Option<AcceptCallbackEntry<T>> {
        let position = self
            .callbacks
            .iter()
            .position(|entry| entry.token == Some(token))?;
        let mut entry = self.callbacks.remove(position)?;
        entry.close_timer();
        Some(entry)
    }

    /// Remove every queued completion.
    pub fn pop_all_callbacks(&mut self) -> Vec<AcceptCallbackEntry<T>> {
        let mut callbacks: Vec<_> = self.callbacks.drain(..).collect();
        for entry in &mut callbacks {
            entry.close_timer();
        }
        callbacks
    }

    /// Drain every queued child.
    pub fn pop_all_entries(&mut self) -> Vec<AcceptQueueEntry<T>> {
        self.entries.drain(..).collect()
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
        if watermark::incoming_low_satisfied(self.entries.len(), self.watermark_low)
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
        if watermark::incoming_high_violated(self.entries.len(), self.watermark_high)
            && self.watermark_high_wanted
        {
            self.watermark_high_wanted = false;
            return true;
        }
        false
    }

    /// Number of queued children.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
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

    /// True when dequeuing from the OS backlog must pause.
    #[must_use]
    pub fn is_high_watermark_violated(&self) -> bool {
        watermark::incoming_high_violated(self.entries.len(), self.watermark_high)
    }
}
