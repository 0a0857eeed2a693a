//! The asynchronous listener socket.
//!
//! Accepted connections are wrapped as stream sockets and queued up to
//! the accept-queue high watermark. A token-bucket rate limiter may
//! throttle dequeuing from the OS backlog; when it runs dry the
//! listener hides readability and schedules a backoff timer for the
//! next refill window.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use keelson_core::chronology::Timer;
use keelson_core::endpoint::{Endpoint, Transport};
use keelson_core::error::{Error, Result};
use keelson_core::options::{AcceptOptions, AcceptToken, BindOptions, ListenerSocketOptions, SocketOption};
use keelson_core::queue::accept::{
    AcceptCallback, AcceptCallbackEntry, AcceptContext, AcceptQueue, AcceptQueueEntry,
};
use keelson_core::rate::TokenBucket;
use keelson_core::state::{
    DetachState, Direction, FlowControlState, ShutdownOrigin, ShutdownState,
};
use keelson_core::strand::{Executor, Strand};

use crate::handle::{HandleId, ListenerHandle, TcpListenerHandle};
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::reactor::{NotificationQueue, ReactorRef, ReactorSocket};
use crate::resolver::{EndpointOptions, Resolver};
use crate::stream::{CloseCallback, StreamSocket};

/// An accepted child.
pub type AcceptedStream = Arc<StreamSocket>;

enum Completion {
    Accept(
        AcceptCallback<AcceptedStream>,
        Result<AcceptContext<AcceptedStream>>,
    ),
    Close(CloseCallback),
}

struct ListenerState {
    handle: Option<Box<dyn ListenerHandle>>,
    handle_id: Option<HandleId>,
    accept_queue: AcceptQueue<AcceptedStream>,
    flow: FlowControlState,
    shutdown: ShutdownState,
    detach: DetachState,
    readable_shown: bool,
    attached: bool,
    listening: bool,
    rate: Option<TokenBucket>,
    backoff_timer: Option<Arc<Timer>>,
    close_callbacks: Vec<CloseCallback>,
    monitor: Option<SocketEventSender>,
    closed: bool,
}

impl ListenerState {
    fn announce(&self, event: SocketEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }
}

/// An asynchronous, reactor-driven listener socket.
pub struct ListenerSocket {
    options: ListenerSocketOptions,
    reactor: ReactorRef,
    resolver: Option<Arc<Resolver>>,
    strand: Strand,
    state: Mutex<ListenerState>,
}

impl ListenerSocket {
    /// Create a listener driven by `reactor`. The listener is unusable
    /// until opened and bound.
    #[must_use]
    pub fn create(
        options: ListenerSocketOptions,
        reactor: ReactorRef,
        resolver: Option<Arc<Resolver>>,
    ) -> Arc<Self> {
        let strand = Strand::new(reactor.executor());
        let rate = options
            .accept_rate_per_second
            .map(|rate| TokenBucket::new(rate, options.accept_rate_burst, reactor.now()));
        let state = ListenerState {
            handle: None,
            handle_id: None,
            accept_queue: AcceptQueue::new(
                options.accept_queue_low_watermark,
                options.accept_queue_high_watermark,
            ),
            flow: FlowControlState::new(),
            shutdown: ShutdownState::new(),
            detach: DetachState::Detached,
            readable_shown: false,
            attached: false,
            listening: false,
            rate,
            backoff_timer: None,
            close_callbacks: Vec::new(),
            monitor: None,
            closed: false,
        };
        Arc::new(Self {
            options,
            reactor,
            resolver,
            strand,
            state: Mutex::new(state),
        })
    }

    /// Subscribe to lifecycle events. Replaces any previous monitor.
    #[must_use]
    pub fn monitor(&self) -> SocketMonitor {
        let (sender, receiver) = create_monitor();
        self.state.lock().monitor = Some(sender);
        receiver
    }

    /// The listener's serialization domain.
    #[must_use]
    pub fn strand(&self) -> Strand {
        self.strand.clone()
    }

    /// Number of accepted connections waiting to be dequeued.
    #[must_use]
    pub fn accept_queue_size(&self) -> usize {
        self.state.lock().accept_queue.size()
    }

    /// The bound endpoint.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        let state = self.state.lock();
        state
            .handle
            .as_ref()
            .ok_or(Error::Invalid)?
            .source_endpoint()
    }

    /// Open the listener with a handle of the given transport family.
    pub fn open(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let handle = TcpListenerHandle::open(transport)?;
        self.open_with_handle(Box::new(handle))
    }

    /// Open the listener by importing `handle`.
    pub fn open_with_handle(self: &Arc<Self>, handle: Box<dyn ListenerHandle>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.handle.is_some() {
            return Err(Error::AlreadyOpen);
        }

        handle.set_nonblocking(true)?;
        if self.options.reuse_address {
            let _ = handle.set_option(&SocketOption::ReuseAddress(true));
        }

        let id = handle.handle_id();
        self.reactor
            .attach_socket(id, self.clone() as Arc<dyn ReactorSocket>)?;
        state.handle = Some(handle);
        state.handle_id = Some(id);
        state.attached = true;
        state.detach = DetachState::Attached;
        Ok(())
    }

    /// Bind to a local endpoint, opening the handle if necessary.
    pub fn bind(self: &Arc<Self>, endpoint: &Endpoint, options: &BindOptions) -> Result<()> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if state.handle.is_none() {
                drop(state);
                self.open(endpoint.stream_transport())?;
            }
        }

        let state = self.state.lock();
        let handle = state.handle.as_ref().ok_or(Error::Invalid)?;
        if options.reuse_address {
            let _ = handle.set_option(&SocketOption::ReuseAddress(true));
        }
        handle.bind(endpoint)?;
        state.announce(SocketEvent::Bound(handle.source_endpoint()?));
        Ok(())
    }

    /// Bind to the resolution of `name` ("host:port" grammar).
    pub fn bind_name(self: &Arc<Self>, name: &str, options: &BindOptions) -> Result<()> {
        let resolver = self.resolver.as_ref().ok_or(Error::NotFound)?;
        let endpoint = resolver.get_endpoint(name, &EndpointOptions::default())?;
        self.bind(&endpoint, options)
    }

    /// Start listening with the configured backlog.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let handle = state.handle.as_ref().ok_or(Error::Invalid)?;
        handle.listen(self.options.backlog)?;
        let endpoint = handle.source_endpoint()?;
        state.listening = true;
        state.announce(SocketEvent::Listening(endpoint));
        self.sync_readable_interest(&mut state);
        Ok(())
    }

    /// Dequeue an accepted connection synchronously: the accept queue
    /// first, then the OS backlog. `WouldBlock` only when both are
    /// empty.
    pub fn accept_now(self: &Arc<Self>) -> Result<(AcceptedStream, Endpoint)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        if let Some(entry) = state.accept_queue.pop_entry() {
            self.sync_readable_interest(&mut state);
            let peer = entry.peer.clone().ok_or(Error::Invalid)?;
            return Ok((entry.child, peer));
        }

        let handle = state.handle.as_ref().ok_or(Error::Invalid)?;
        let (child_handle, peer) = handle.accept()?;
        state.announce(SocketEvent::Accepted(peer.clone()));
        let child = StreamSocket::create_accepted(
            self.options.stream_options.clone(),
            self.reactor.clone(),
            child_handle,
        )?;
        Ok((child, peer))
    }

    /// Accept a connection asynchronously. The callback completes on
    /// the listener's strand.
    pub fn accept(
        self: &Arc<Self>,
        options: &AcceptOptions,
        callback: AcceptCallback<AcceptedStream>,
    ) -> Result<()> {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }

            if let Some(entry) = state.accept_queue.pop_entry() {
                self.sync_readable_interest(&mut state);
                vec![Completion::Accept(
                    callback,
                    Ok(AcceptContext {
                        child: entry.child,
                        peer: entry.peer,
                        token: options.token,
                    }),
                )]
            } else {
                let id = state.accept_queue.generate_callback_id();
                let timer = options.deadline.map(|deadline| {
                    let weak = Arc::downgrade(self);
                    self.reactor.chronology().schedule(
                        deadline,
                        Some(self.strand.clone()),
                        Box::new(move || {
                            if let Some(listener) = weak.upgrade() {
                                listener.process_accept_deadline(id);
                            }
                        }),
                    )
                });
                state.accept_queue.push_callback(AcceptCallbackEntry {
                    id,
                    callback,
                    token: options.token,
                    timer,
                });
                self.sync_readable_interest(&mut state);
                Vec::new()
            }
        };
        self.dispatch(completions);
        Ok(())
    }

    fn process_accept_deadline(self: Arc<Self>, id: u64) {
        let completions = {
            let mut state = self.state.lock();
            // the deadline cancels the waiting callback, not the listener
            match state.accept_queue.remove_callback_by_id(id) {
                Some(entry) => vec![Completion::Accept(entry.callback, Err(Error::TimedOut))],
                None => Vec::new(),
            }
        };
        self.dispatch(completions);
    }

    /// Cancel the pending accept carrying `token`.
    pub fn cancel_accept(self: &Arc<Self>, token: AcceptToken) -> Result<()> {
        let completion = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state
                .accept_queue
                .remove_callback_by_token(token)
                .map(|entry| Completion::Accept(entry.callback, Err(Error::Cancelled)))
        };
        match completion {
            Some(completion) => {
                self.dispatch(vec![completion]);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Close the listener. Pending accepts complete with `Closed`;
    /// queued children are closed as well.
    pub fn close(self: &Arc<Self>, callback: Option<CloseCallback>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                if let Some(callback) = callback {
                    self.dispatch(vec![Completion::Close(callback)]);
                }
                return;
            }
            if let Some(callback) = callback {
                state.close_callbacks.push(callback);
            }

            let mut completions = Vec::new();
            if state.shutdown.try_initiate(ShutdownOrigin::Source) {
                state.announce(SocketEvent::ShutdownInitiated {
                    origin: ShutdownOrigin::Source,
                });
            }
            state.shutdown.try_shutdown_send();
            if state.shutdown.try_shutdown_receive() {
                state.flow.apply(Direction::Receive);
                if let Some(timer) = state.backoff_timer.take() {
                    timer.close();
                }
                for entry in state.accept_queue.pop_all_callbacks() {
                    completions.push(Completion::Accept(entry.callback, Err(Error::Closed)));
                }
                // queued children are exclusively owned by the queue
                for entry in state.accept_queue.pop_all_entries() {
                    entry.child.close(None);
                }
                self.sync_readable_interest(&mut state);
                state.announce(SocketEvent::ShutdownReceive);
            }
            self.maybe_complete_shutdown_locked(&mut state, &mut completions);
            completions
        };
        self.dispatch(completions);
    }

    fn maybe_complete_shutdown_locked(
        self: &Arc<Self>,
        state: &mut ListenerState,
        completions: &mut Vec<Completion>,
    ) {
        if !state.shutdown.is_recv_closed() {
            return;
        }
        if state.attached && state.detach.try_begin_detach() {
            let id = state.handle_id.expect("attached listener has an id");
            let weak = Arc::downgrade(self);
            let _ = self.reactor.detach_socket(
                id,
                Box::new(move || {
                    if let Some(listener) = weak.upgrade() {
                        listener.private_shutdown_complete();
                    }
                }),
            );
        } else if !state.attached && !state.closed {
            self.finish_shutdown_locked(state, completions);
        }
    }

    fn private_shutdown_complete(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            state.detach.complete_detach();
            state.attached = false;
            let mut completions = Vec::new();
            self.finish_shutdown_locked(&mut state, &mut completions);
            completions
        };
        self.dispatch(completions);
    }

    fn finish_shutdown_locked(
        self: &Arc<Self>,
        state: &mut ListenerState,
        completions: &mut Vec<Completion>,
    ) {
        if !state.shutdown.try_complete() {
            return;
        }
        state.handle = None;
        state.handle_id = None;
        state.listening = false;
        state.readable_shown = false;
        state.closed = true;

        for entry in state.accept_queue.pop_all_callbacks() {
            completions.push(Completion::Accept(entry.callback, Err(Error::Closed)));
        }
        state.announce(SocketEvent::ShutdownComplete);
        for callback in state.close_callbacks.drain(..) {
            completions.push(Completion::Close(callback));
        }
    }

    fn sync_readable_interest(&self, state: &mut ListenerState) {
        let Some(id) = state.handle_id else {
            state.readable_shown = false;
            return;
        };
        if !state.attached || !state.detach.is_attached() {
            return;
        }

        let want = state.listening
            && state.flow.recv_relaxed()
            && state.backoff_timer.is_none()
            && !state.accept_queue.is_high_watermark_violated()
            && !state.shutdown.is_recv_closed();
        if want && !state.readable_shown {
            if self.reactor.show_readable(id).is_ok() {
                state.readable_shown = true;
            }
        } else if !want && state.readable_shown {
            if self.reactor.hide_readable(id).is_ok() {
                state.readable_shown = false;
            }
        }
    }

    fn process_accept_backoff(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            state.backoff_timer = None;
            let mut completions = Vec::new();
            if !state.closed {
                // drain whatever the backlog accumulated during the pause
                self.on_readable_locked(&mut state, &mut completions);
                self.sync_readable_interest(&mut state);
            }
            completions
        };
        self.dispatch(completions);
    }

    fn on_readable_locked(
        self: &Arc<Self>,
        state: &mut ListenerState,
        completions: &mut Vec<Completion>,
    ) {
        loop {
            if state.closed
                || !state.listening
                || !state.flow.recv_relaxed()
                || state.shutdown.is_recv_closed()
                || state.backoff_timer.is_some()
            {
                break;
            }
            if state.accept_queue.is_high_watermark_violated() {
                break;
            }

            // admission control before touching the backlog
            let now = self.reactor.now();
            if let Some(bucket) = state.rate.as_mut() {
                if let Err(earliest) = bucket.try_acquire(now) {
                    let weak = Arc::downgrade(self);
                    let timer = self.reactor.chronology().schedule(
                        earliest,
                        Some(self.strand.clone()),
                        Box::new(move || {
                            if let Some(listener) = weak.upgrade() {
                                listener.process_accept_backoff();
                            }
                        }),
                    );
                    state.backoff_timer = Some(timer);
                    break;
                }
            }

            let Some(handle) = state.handle.as_ref() else {
                break;
            };
            match handle.accept() {
                Ok((child_handle, peer)) => {
                    state.announce(SocketEvent::Accepted(peer.clone()));
                    let child = match StreamSocket::create_accepted(
                        self.options.stream_options.clone(),
                        self.reactor.clone(),
                        child_handle,
                    ) {
                        Ok(child) => child,
                        Err(error) => {
                            warn!(?error, "accepted connection could not be wrapped");
                            continue;
                        }
                    };

                    state.accept_queue.push_entry(AcceptQueueEntry {
                        child,
                        peer: Some(peer),
                        arrive_time: Instant::now(),
                    });

                    while let Some(waiting) = state.accept_queue.pop_callback() {
                        let entry = state
                            .accept_queue
                            .pop_entry()
                            .expect("pop_callback implies an entry");
                        completions.push(Completion::Accept(
                            waiting.callback,
                            Ok(AcceptContext {
                                child: entry.child,
                                peer: entry.peer,
                                token: waiting.token,
                            }),
                        ));
                    }

                    if state.accept_queue.authorize_low_watermark_event() {
                        state.announce(SocketEvent::AcceptQueueLowWatermark {
                            size: state.accept_queue.size(),
                        });
                    }
                    if state.accept_queue.authorize_high_watermark_event() {
                        state.announce(SocketEvent::AcceptQueueHighWatermark {
                            size: state.accept_queue.size(),
                        });
                        break;
                    }
                    if !self.options.accept_greedily {
                        break;
                    }
                }
                Err(Error::WouldBlock) => break,
                Err(Error::Interrupted) => {}
                Err(error) => {
                    // transient backlog errors are recovered on the next
                    // readiness event
                    debug!(?error, "listener accept failed");
                    break;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, completions: Vec<Completion>) {
        for completion in completions {
            match completion {
                Completion::Accept(callback, result) => {
                    self.strand.execute(Box::new(move || callback(result)));
                }
                Completion::Close(callback) => {
                    self.strand.execute(Box::new(move || callback()));
                }
            }
        }
    }
}

impl ReactorSocket for ListenerSocket {
    fn process_socket_readable(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut completions = Vec::new();
            self.on_readable_locked(&mut state, &mut completions);
            self.sync_readable_interest(&mut state);
            completions
        };
        self.dispatch(completions);
    }

    fn process_socket_writable(self: Arc<Self>) {
        // listeners never arm writability
    }

    fn process_socket_error(self: Arc<Self>) {
        let error = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            state
                .handle
                .as_ref()
                .and_then(|handle| handle.take_error().ok().flatten())
        };
        if let Some(error) = error {
            warn!(?error, "listener socket failed");
            self.close(None);
        }
    }

    fn process_notifications(self: Arc<Self>, _notifications: NotificationQueue) {
        // listeners produce no send-side notifications
    }

    fn strand(&self) -> Strand {
        self.strand.clone()
    }
}

impl std::fmt::Debug for ListenerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ListenerSocket")
            .field("listening", &state.listening)
            .field("accept_queue_size", &state.accept_queue.size())
            .field("closed", &state.closed)
            .finish()
    }
}
