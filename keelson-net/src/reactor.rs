//! The readiness multiplexer contract consumed by the sockets.
//!
//! A [`Reactor`] owns descriptor registrations and interest flags, and
//! delivers readable/writable/error events to each socket's
//! [`ReactorSocket`] sink, always through that socket's strand.
//! Detachment is asynchronous: the request returns immediately and the
//! completion functor runs on the socket's strand once the descriptor is
//! out of the poller.

use std::sync::Arc;
use std::time::Instant;

use keelson_core::chronology::Chronology;
use keelson_core::error::Result;
use keelson_core::strand::{ExecutorRef, Functor, Strand};

use crate::handle::HandleId;

/// An out-of-band event the transport reports about a past send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The payload of send `id` left the host at `time`.
    Timestamp { id: u64, time: Instant },
    /// The transport no longer references the user buffer of zero-copy
    /// send `id`.
    ZeroCopyComplete { id: u64 },
}

/// A batch of notifications delivered in arrival order.
#[derive(Debug, Clone, Default)]
pub struct NotificationQueue {
    notifications: Vec<Notification>,
}

impl NotificationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Notification> {
        self.notifications
    }
}

/// Event sink implemented by every socket driven by a reactor.
///
/// The reactor invokes each method through [`ReactorSocket::strand`], so
/// no two callbacks of one socket ever run concurrently.
pub trait ReactorSocket: Send + Sync {
    /// The descriptor is readable.
    fn process_socket_readable(self: Arc<Self>);

    /// The descriptor is writable.
    fn process_socket_writable(self: Arc<Self>);

    /// The descriptor failed; the socket drains `SO_ERROR` itself.
    fn process_socket_error(self: Arc<Self>);

    /// Out-of-band notifications arrived.
    fn process_notifications(self: Arc<Self>, notifications: NotificationQueue);

    /// The serialization domain events must dispatch through.
    fn strand(&self) -> Strand;
}

/// The readiness multiplexer.
pub trait Reactor: Send + Sync {
    /// Register `socket`'s descriptor for event delivery. No events are
    /// delivered until interest is shown.
    fn attach_socket(&self, id: HandleId, socket: Arc<dyn ReactorSocket>) -> Result<()>;

    /// Deregister the descriptor. Returns immediately; `on_detached`
    /// runs on the socket's strand once no further events can fire.
    fn detach_socket(&self, id: HandleId, on_detached: Functor) -> Result<()>;

    fn show_readable(&self, id: HandleId) -> Result<()>;
    fn hide_readable(&self, id: HandleId) -> Result<()>;
    fn show_writable(&self, id: HandleId) -> Result<()>;
    fn hide_writable(&self, id: HandleId) -> Result<()>;

    /// The deadline registry driven by this reactor's clock.
    fn chronology(&self) -> Chronology;

    /// The executor socket strands schedule on.
    fn executor(&self) -> ExecutorRef;

    /// The reactor's reading of the clock; rate limiters and timers key
    /// off this so a test reactor can own time.
    fn now(&self) -> Instant;
}

/// Shared handle to a reactor.
pub type ReactorRef = Arc<dyn Reactor>;
