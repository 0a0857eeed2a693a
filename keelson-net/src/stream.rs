//! The asynchronous stream socket.
//!
//! One socket owns a write queue, a read queue, a strand, and a
//! registration with a reactor. Public operations enqueue work and
//! return; completions run on the socket's strand. The socket mutex is
//! held at every public entry and every reactor entry, and is released
//! before any completion callback is invoked.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use keelson_core::blob::ConstBufferArray;
use keelson_core::chronology::Timer;
use keelson_core::data::Data;
use keelson_core::endpoint::{Endpoint, Transport};
use keelson_core::error::{Error, Result};
use keelson_core::options::{
    BatchOptions, BindOptions, ConnectOptions, ReceiveOptions, ReceiveToken, SendOptions,
    SendToken, SocketOption, StreamSocketOptions,
};
use keelson_core::queue::receive::{
    ReceiveCallback, ReceiveCallbackEntry, ReceiveContext, ReceiveFeedback, ReceiveQueue,
    ReceiveQueueEntry,
};
use keelson_core::queue::send::{
    SendCallback, SendContext, SendQueue, SendQueueEntry, TokenCancellation,
};
use keelson_core::rate::Backoff;
use keelson_core::state::{
    DetachState, Direction, FlowControlMode, FlowControlState, ShutdownOrigin, ShutdownState,
};
use keelson_core::strand::{Executor, Strand};

use crate::handle::{HandleId, StreamHandle, TcpStreamHandle};
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::reactor::{Notification, NotificationQueue, ReactorRef, ReactorSocket};
use crate::resolver::{EndpointOptions, Resolver};
use crate::session::{EncryptionSession, HandshakeCallback, HandshakeState};

/// Connect completion callback.
pub type ConnectCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Close completion callback.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Bytes read from a file-backed payload per write attempt.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

enum Completion {
    Send(SendCallback, Result<SendContext>),
    Receive(ReceiveCallback, Result<ReceiveContext>),
    Connect(ConnectCallback, Result<()>),
    Handshake(HandshakeCallback, Result<()>),
    Close(CloseCallback),
    Notifications(NotificationQueue),
}

struct ConnectState {
    callback: Option<ConnectCallback>,
    remote: Option<Endpoint>,
    options: ConnectOptions,
    attempts: u32,
    backoff: Backoff,
    deadline_timer: Option<Arc<Timer>>,
    retry_timer: Option<Arc<Timer>>,
    waiting_writable: bool,
}

struct StreamState {
    handle: Option<Box<dyn StreamHandle>>,
    handle_id: Option<HandleId>,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    feedback: ReceiveFeedback,
    flow: FlowControlState,
    shutdown: ShutdownState,
    detach: DetachState,
    readable_shown: bool,
    writable_shown: bool,
    attached: bool,
    connected: bool,
    connect: Option<ConnectState>,
    shutdown_send_pending: bool,
    close_callbacks: Vec<CloseCallback>,
    monitor: Option<SocketEventSender>,
    session: Option<Box<dyn EncryptionSession>>,
    handshake_callback: Option<HandshakeCallback>,
    zero_copy_pending: Vec<(u64, SendCallback, SendContext)>,
    pending_notifications: NotificationQueue,
    last_error: Option<Error>,
    closed: bool,
}

impl StreamState {
    fn announce(&self, event: SocketEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }

    fn connect_waiting(&self) -> bool {
        self.connect
            .as_ref()
            .is_some_and(|connect| connect.waiting_writable)
    }
}

/// An asynchronous, reactor-driven stream socket.
pub struct StreamSocket {
    options: StreamSocketOptions,
    reactor: ReactorRef,
    resolver: Option<Arc<Resolver>>,
    strand: Strand,
    state: Mutex<StreamState>,
}

impl StreamSocket {
    /// Create a socket driven by `reactor`. The socket is unusable until
    /// opened or connected.
    #[must_use]
    pub fn create(
        options: StreamSocketOptions,
        reactor: ReactorRef,
        resolver: Option<Arc<Resolver>>,
    ) -> Arc<Self> {
        let strand = Strand::new(reactor.executor());
        let state = StreamState {
            handle: None,
            handle_id: None,
            send_queue: SendQueue::new(
                options.write_queue_low_watermark,
                options.write_queue_high_watermark,
            ),
            receive_queue: ReceiveQueue::new(
                options.read_queue_low_watermark,
                options.read_queue_high_watermark,
            ),
            feedback: ReceiveFeedback::new(
                options.min_incoming_transfer_size,
                options.max_incoming_transfer_size,
            ),
            flow: FlowControlState::new(),
            shutdown: ShutdownState::new(),
            detach: DetachState::Detached,
            readable_shown: false,
            writable_shown: false,
            attached: false,
            connected: false,
            connect: None,
            shutdown_send_pending: false,
            close_callbacks: Vec::new(),
            monitor: None,
            session: None,
            handshake_callback: None,
            zero_copy_pending: Vec::new(),
            pending_notifications: NotificationQueue::new(),
            last_error: None,
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

    /// Wrap an accepted connection; the socket is open, attached, and
    /// reading.
    pub fn create_accepted(
        options: StreamSocketOptions,
        reactor: ReactorRef,
        handle: Box<dyn StreamHandle>,
    ) -> Result<Arc<Self>> {
        let socket = Self::create(options, reactor, None);
        socket.open_with_handle(handle)?;
        {
            let mut state = socket.state.lock();
            state.connected = true;
            socket.sync_readable_interest(&mut state);
        }
        Ok(socket)
    }

    /// Subscribe to lifecycle events. Replaces any previous monitor.
    #[must_use]
    pub fn monitor(&self) -> SocketMonitor {
        let (sender, receiver) = create_monitor();
        self.state.lock().monitor = Some(sender);
        receiver
    }

    /// The socket's serialization domain.
    #[must_use]
    pub fn strand(&self) -> Strand {
        self.strand.clone()
    }

    /// Bytes currently queued for transmission.
    #[must_use]
    pub fn write_queue_size(&self) -> usize {
        self.state.lock().send_queue.size()
    }

    /// Bytes currently buffered from the peer.
    #[must_use]
    pub fn read_queue_size(&self) -> usize {
        self.state.lock().receive_queue.size()
    }

    /// The local endpoint, once bound or connected.
    pub fn source_endpoint(&self) -> Result<Endpoint> {
        let state = self.state.lock();
        state
            .handle
            .as_ref()
            .ok_or(Error::Invalid)?
            .source_endpoint()
    }

    /// The peer endpoint, once connected.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        let state = self.state.lock();
        state
            .handle
            .as_ref()
            .ok_or(Error::Invalid)?
            .remote_endpoint()
    }

    /// Open the socket with a handle of the given transport family.
    pub fn open(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let handle = TcpStreamHandle::open(transport)?;
        self.open_with_handle(Box::new(handle))
    }

    /// Open the socket by importing `handle`.
    pub fn open_with_handle(self: &Arc<Self>, handle: Box<dyn StreamHandle>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.handle.is_some() {
            return Err(Error::AlreadyOpen);
        }
        self.install_handle_locked(&mut state, handle)
    }

    fn install_handle_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        handle: Box<dyn StreamHandle>,
    ) -> Result<()> {
        handle.set_nonblocking(true)?;
        for option in &self.options.socket_options {
            if let Err(error) = handle.set_option(option) {
                debug!(?option, ?error, "stream socket option not applied");
            }
        }
        if self.options.keep_alive {
            let _ = handle.set_option(&SocketOption::KeepAlive(true));
        }
        if self.options.no_delay {
            let _ = handle.set_option(&SocketOption::DelayTransmission(false));
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

    /// Connect to a remote endpoint. The callback completes on the
    /// socket's strand.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        let completions = {
            let mut state = self.state.lock();
            self.begin_connect_locked(&mut state, endpoint.clone(), options, callback)?
        };
        self.dispatch(completions);
        Ok(())
    }

    /// Connect to the resolution of `name` ("host:port" grammar).
    pub fn connect_name(
        self: &Arc<Self>,
        name: &str,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<()> {
        let Some(resolver) = self.resolver.clone() else {
            return Err(Error::NotFound);
        };

        let mut endpoint_options = EndpointOptions::new();
        endpoint_options.ip_address_type = options.ip_address_type;

        {
            let mut state = self.state.lock();
            self.validate_connect_locked(&state)?;
            let backoff = Backoff::new(options.retry_interval, options.retry_interval_max);
            let deadline_timer = self.arm_connect_deadline(&options);
            state.connect = Some(ConnectState {
                callback: Some(callback),
                remote: None,
                options,
                attempts: 0,
                backoff,
                deadline_timer,
                retry_timer: None,
                waiting_writable: false,
            });
        }

        let weak = Arc::downgrade(self);
        resolver.get_endpoint_deferred(
            name.to_owned(),
            endpoint_options,
            self.strand.clone(),
            Box::new(move |result| {
                if let Some(socket) = weak.upgrade() {
                    socket.continue_connect_resolution(result);
                }
            }),
        );
        Ok(())
    }

    fn continue_connect_resolution(self: Arc<Self>, result: Result<Endpoint>) {
        let completions = {
            let mut state = self.state.lock();
            match result {
                Ok(endpoint) => {
                    if let Some(connect) = state.connect.as_mut() {
                        connect.remote = Some(endpoint);
                        self.start_connect_attempt_locked(&mut state)
                    } else {
                        Vec::new()
                    }
                }
                // unresolvable names surface as NotFound
                Err(error) => {
                    let error = match error {
                        Error::Invalid => Error::Invalid,
                        _ => Error::NotFound,
                    };
                    self.fail_connect_locked(&mut state, error)
                }
            }
        };
        self.dispatch(completions);
    }

    fn validate_connect_locked(&self, state: &StreamState) -> Result<()> {
        if state.closed || state.shutdown.is_initiated() {
            return Err(Error::Closed);
        }
        if state.connected {
            return Err(Error::AlreadyOpen);
        }
        if state.connect.is_some() {
            return Err(Error::InProgress);
        }
        Ok(())
    }

    fn arm_connect_deadline(self: &Arc<Self>, options: &ConnectOptions) -> Option<Arc<Timer>> {
        let deadline = options.deadline?;
        let weak = Arc::downgrade(self);
        Some(self.reactor.chronology().schedule(
            deadline,
            Some(self.strand.clone()),
            Box::new(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.process_connect_deadline();
                }
            }),
        ))
    }

    fn begin_connect_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        remote: Endpoint,
        options: ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<Vec<Completion>> {
        self.validate_connect_locked(state)?;

        let backoff = Backoff::new(options.retry_interval, options.retry_interval_max);
        let deadline_timer = self.arm_connect_deadline(&options);
        state.connect = Some(ConnectState {
            callback: Some(callback),
            remote: Some(remote),
            options,
            attempts: 0,
            backoff,
            deadline_timer,
            retry_timer: None,
            waiting_writable: false,
        });
        Ok(self.start_connect_attempt_locked(state))
    }

    fn start_connect_attempt_locked(self: &Arc<Self>, state: &mut StreamState) -> Vec<Completion> {
        let Some(remote) = state.connect.as_ref().and_then(|c| c.remote.clone()) else {
            return Vec::new();
        };

        if state.handle.is_none() {
            let transport = remote.stream_transport();
            let installed = TcpStreamHandle::open(transport)
                .map(|handle| Box::new(handle) as Box<dyn StreamHandle>)
                .and_then(|handle| self.install_handle_locked(state, handle));
            if let Err(error) = installed {
                return self.fail_connect_locked(state, error);
            }
        }

        if let Some(connect) = state.connect.as_mut() {
            connect.attempts += 1;
        }

        let result = state
            .handle
            .as_ref()
            .expect("handle opened above")
            .connect(&remote);
        match result {
            Ok(()) => {
                // completion is still confirmed on the writable event
                if let Some(connect) = state.connect.as_mut() {
                    connect.waiting_writable = true;
                }
                self.sync_writable_interest(state);
                Vec::new()
            }
            Err(error) if error.is_recoverable() => {
                if let Some(connect) = state.connect.as_mut() {
                    connect.waiting_writable = true;
                }
                self.sync_writable_interest(state);
                Vec::new()
            }
            Err(error) => self.retry_or_fail_connect_locked(state, error),
        }
    }

    fn retry_or_fail_connect_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        error: Error,
    ) -> Vec<Completion> {
        let delay = {
            let Some(connect) = state.connect.as_mut() else {
                return Vec::new();
            };
            connect.waiting_writable = false;

            let attempts_allowed = connect.options.retry_count + 1;
            if !error.is_transient_connect_error() || connect.attempts >= attempts_allowed {
                None
            } else {
                Some(connect.backoff.next_delay())
            }
        };
        let Some(delay) = delay else {
            return self.fail_connect_locked(state, error);
        };
        debug!(?error, ?delay, "stream connect retrying");
        let deadline = Instant::now() + delay;

        // the failed handle must be replaced; request detachment and
        // rebuild on the strand once the reactor confirms
        let weak = Arc::downgrade(self);
        if state.attached && state.detach.try_begin_detach() {
            let id = state.handle_id.expect("attached socket has an id");
            let reactor = self.reactor.clone();
            let strand = self.strand.clone();
            let _ = self.reactor.detach_socket(
                id,
                Box::new(move || {
                    let weak_timer = weak.clone();
                    let timer = reactor.chronology().schedule(
                        deadline,
                        Some(strand),
                        Box::new(move || {
                            if let Some(socket) = weak_timer.upgrade() {
                                socket.process_connect_retry();
                            }
                        }),
                    );
                    if let Some(socket) = weak.upgrade() {
                        let mut state = socket.state.lock();
                        state.attached = false;
                        state.detach.complete_detach();
                        state.handle = None;
                        state.handle_id = None;
                        state.readable_shown = false;
                        state.writable_shown = false;
                        if let Some(connect) = state.connect.as_mut() {
                            connect.retry_timer = Some(timer);
                        }
                    }
                }),
            );
        } else {
            state.handle = None;
            state.handle_id = None;
            let weak_timer = weak.clone();
            let timer = self.reactor.chronology().schedule(
                deadline,
                Some(self.strand.clone()),
                Box::new(move || {
                    if let Some(socket) = weak_timer.upgrade() {
                        socket.process_connect_retry();
                    }
                }),
            );
            if let Some(connect) = state.connect.as_mut() {
                connect.retry_timer = Some(timer);
            }
        }
        Vec::new()
    }

    fn process_connect_retry(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed || state.connect.is_none() {
                Vec::new()
            } else {
                self.start_connect_attempt_locked(&mut state)
            }
        };
        self.dispatch(completions);
    }

    fn process_connect_deadline(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.connected || state.connect.is_none() {
                Vec::new()
            } else {
                self.fail_connect_locked(&mut state, Error::TimedOut)
            }
        };
        self.dispatch(completions);
    }

    fn fail_connect_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        error: Error,
    ) -> Vec<Completion> {
        let mut completions = Vec::new();
        if let Some(mut connect) = state.connect.take() {
            if let Some(timer) = connect.deadline_timer.take() {
                timer.close();
            }
            if let Some(timer) = connect.retry_timer.take() {
                timer.close();
            }
            state.announce(SocketEvent::ConnectFailed {
                endpoint: connect.remote.clone(),
                reason: error.to_string(),
            });
            if let Some(callback) = connect.callback.take() {
                completions.push(Completion::Connect(callback, Err(error.clone())));
            }
        }
        state.last_error = Some(error);
        self.sync_writable_interest(state);
        completions
    }

    fn complete_connect_locked(self: &Arc<Self>, state: &mut StreamState) -> Vec<Completion> {
        let mut completions = Vec::new();
        let Some(mut connect) = state.connect.take() else {
            return completions;
        };
        if let Some(timer) = connect.deadline_timer.take() {
            timer.close();
        }
        if let Some(timer) = connect.retry_timer.take() {
            timer.close();
        }

        state.connected = true;
        if let Some(handle) = state.handle.as_ref() {
            if let Ok(endpoint) = handle.remote_endpoint() {
                state.announce(SocketEvent::Connected(endpoint));
            }
        }
        if let Some(callback) = connect.callback.take() {
            completions.push(Completion::Connect(callback, Ok(())));
        }
        self.sync_readable_interest(state);
        self.sync_writable_interest(state);
        completions
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_buffers: self.options.max_batch_buffers,
            max_bytes: self.options.max_batch_bytes,
        }
    }

    /// Enqueue `data` for transmission. When the queue is empty the
    /// payload is attempted directly against the socket; the remainder,
    /// if any, waits for writability. Fails with `QueueFull` when the
    /// payload would fill the queue past the (possibly overridden) high
    /// watermark.
    pub fn send(
        self: &Arc<Self>,
        data: Data,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let completions = {
            let mut state = self.state.lock();
            if state.closed || state.shutdown.is_initiated() || state.shutdown.is_send_closed() {
                return Err(Error::Closed);
            }
            if data.is_empty() {
                return Err(Error::Invalid);
            }

            let data = self.through_session_locked(&mut state, data)?;
            let size = data.size();

            let effective_high = options
                .effective_high_watermark
                .unwrap_or_else(|| state.send_queue.high_watermark());
            if !options.ignore_high_watermark
                && state.send_queue.would_breach(size, effective_high)
            {
                if state
                    .send_queue
                    .authorize_high_watermark_event_at(effective_high)
                {
                    state.announce(SocketEvent::WriteQueueHighWatermark {
                        size: state.send_queue.size(),
                    });
                }
                return Err(Error::QueueFull);
            }

            let id = state.send_queue.generate_entry_id();
            let mut entry = SendQueueEntry::new(id, data);
            entry.token = options.token;
            entry.callback = callback;
            entry.zero_copy = options.zero_copy
                || self
                    .options
                    .zero_copy_threshold
                    .is_some_and(|threshold| size >= threshold);

            if let Some(deadline) = options.deadline {
                entry.deadline = Some(deadline);
                let weak = Arc::downgrade(self);
                entry.timer = Some(self.reactor.chronology().schedule(
                    deadline,
                    Some(self.strand.clone()),
                    Box::new(move || {
                        if let Some(socket) = weak.upgrade() {
                            socket.process_send_deadline(id);
                        }
                    }),
                ));
            }

            let was_empty = !state.send_queue.has_entry();
            state.send_queue.push(entry);

            let mut completions = Vec::new();
            if state.send_queue.authorize_high_watermark_event() {
                state.announce(SocketEvent::WriteQueueHighWatermark {
                    size: state.send_queue.size(),
                });
            }

            // direct attempt when nothing was already queued
            if was_empty && state.connected && state.flow.send_relaxed() {
                self.drain_send_queue_locked(&mut state, &mut completions);
            }
            self.sync_writable_interest(&mut state);
            if let Some(notifications) = self.take_synthesized_notifications(&mut state) {
                completions.push(notifications);
            }
            completions
        };
        self.dispatch(completions);
        Ok(())
    }

    fn process_send_deadline(self: Arc<Self>, id: u64) {
        let completions = {
            let mut state = self.state.lock();
            match state.send_queue.remove_by_id(id) {
                Some(callback) => {
                    self.sync_writable_interest(&mut state);
                    vec![Completion::Send(callback, Err(Error::TimedOut))]
                }
                None => Vec::new(),
            }
        };
        self.dispatch(completions);
    }

    /// Cancel the pending send carrying `token`. An entry whose bytes
    /// have begun transferring reports `InProgress` and completes
    /// normally.
    pub fn cancel_send(self: &Arc<Self>, token: SendToken) -> Result<()> {
        let completion = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            match state.send_queue.remove_by_token(token) {
                TokenCancellation::Removed(callback) => {
                    self.sync_writable_interest(&mut state);
                    callback.map(|callback| Completion::Send(callback, Err(Error::Cancelled)))
                }
                TokenCancellation::InProgress => return Err(Error::InProgress),
                TokenCancellation::NotFound => return Err(Error::NotFound),
            }
        };
        self.dispatch(completion.into_iter().collect());
        Ok(())
    }

    /// Receive at least `options.min_bytes` bytes. Satisfied immediately
    /// when the read queue already holds enough; otherwise the callback
    /// waits on the socket's strand.
    pub fn receive(
        self: &Arc<Self>,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<()> {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }

            if state.receive_queue.has_entry() && state.receive_queue.size() >= options.min_bytes {
                let (data, endpoint) = state.receive_queue.drain_into_blob(usize::MAX);
                // a drained queue lifts the high-watermark pause
                if !state.receive_queue.is_high_watermark_violated()
                    && !state.shutdown.is_recv_closed()
                    && state.flow.relax(Direction::Receive).receive
                {
                    self.sync_readable_interest(&mut state);
                }
                vec![Completion::Receive(
                    callback,
                    Ok(ReceiveContext {
                        data,
                        endpoint,
                        token: options.token,
                    }),
                )]
            } else if state.shutdown.is_recv_closed() {
                return Err(Error::EndOfStream);
            } else {
                let id = state.receive_queue.generate_callback_id();
                let timer = options.deadline.map(|deadline| {
                    let weak = Arc::downgrade(self);
                    self.reactor.chronology().schedule(
                        deadline,
                        Some(self.strand.clone()),
                        Box::new(move || {
                            if let Some(socket) = weak.upgrade() {
                                socket.process_receive_deadline(id);
                            }
                        }),
                    )
                });
                state.receive_queue.push_callback(ReceiveCallbackEntry {
                    id,
                    callback,
                    min_bytes: options.min_bytes,
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

    fn process_receive_deadline(self: Arc<Self>, id: u64) {
        let completions = {
            let mut state = self.state.lock();
            match state.receive_queue.remove_callback_by_id(id) {
                Some(entry) => vec![Completion::Receive(entry.callback, Err(Error::TimedOut))],
                None => Vec::new(),
            }
        };
        self.dispatch(completions);
    }

    /// Cancel the pending receive carrying `token`.
    pub fn cancel_receive(self: &Arc<Self>, token: ReceiveToken) -> Result<()> {
        let completion = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state
                .receive_queue
                .remove_callback_by_token(token)
                .map(|entry| Completion::Receive(entry.callback, Err(Error::Cancelled)))
        };
        match completion {
            Some(completion) => {
                self.dispatch(vec![completion]);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Interpose an encryption session on the connection and begin its
    /// handshake. Sends fail with `InProgress` until it completes.
    pub fn upgrade(
        self: &Arc<Self>,
        mut session: Box<dyn EncryptionSession>,
        callback: HandshakeCallback,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.shutdown.is_initiated() {
            return Err(Error::Closed);
        }
        if state.session.is_some() {
            return Err(Error::Invalid);
        }

        session.initiate()?;
        state.session = Some(session);
        state.handshake_callback = Some(callback);

        self.pump_session_outgoing_locked(&mut state);
        self.sync_writable_interest(&mut state);
        Ok(())
    }

    /// Shut down the connection in `direction`. The send direction
    /// flushes queued data first; announcements arrive on the monitor.
    pub fn shutdown(self: &Arc<Self>, direction: Direction) -> Result<()> {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            self.shutdown_locked(
                &mut state,
                direction,
                ShutdownOrigin::Source,
                FlowControlMode::Gentle,
            )
        };
        self.dispatch(completions);
        Ok(())
    }

    /// Close the socket. Pending operations complete with `Closed`; the
    /// callback runs after `ShutdownComplete` is announced.
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
            let mut completions =
                self.fail_connect_if_pending_locked(&mut state, Error::Closed);
            completions.extend(self.shutdown_locked(
                &mut state,
                Direction::Both,
                ShutdownOrigin::Source,
                FlowControlMode::Immediate,
            ));
            completions
        };
        self.dispatch(completions);
    }

    fn fail_connect_if_pending_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        error: Error,
    ) -> Vec<Completion> {
        if state.connect.is_some() && !state.connected {
            self.fail_connect_locked(state, error)
        } else {
            Vec::new()
        }
    }

    fn shutdown_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        direction: Direction,
        origin: ShutdownOrigin,
        mode: FlowControlMode,
    ) -> Vec<Completion> {
        let mut completions = Vec::new();

        if state.shutdown.try_initiate(origin) {
            state.announce(SocketEvent::ShutdownInitiated { origin });
        }

        if direction.includes_send() && !state.shutdown.is_send_closed() {
            if mode == FlowControlMode::Immediate {
                // purge in-flight work in the send direction
                for callback in state.send_queue.remove_all() {
                    completions.push(Completion::Send(callback, Err(Error::Closed)));
                }
                for (_, callback, _) in state.zero_copy_pending.drain(..) {
                    completions.push(Completion::Send(callback, Err(Error::Closed)));
                }
                state.flow.apply(Direction::Send);
                self.perform_send_shutdown_locked(state);
            } else if state.send_queue.has_entry() && state.connected {
                // flush first; the writable handler finishes the phase
                state.shutdown_send_pending = true;
                self.sync_writable_interest(state);
            } else {
                self.perform_send_shutdown_locked(state);
            }
        }

        if direction.includes_receive() && !state.shutdown.is_recv_closed() {
            if state.shutdown.try_shutdown_receive() {
                let discard_status = match (origin, mode) {
                    (ShutdownOrigin::Remote, _) => Error::EndOfStream,
                    (_, FlowControlMode::Immediate) => Error::Closed,
                    (_, FlowControlMode::Gentle) => Error::Cancelled,
                };
                for entry in state.receive_queue.pop_all_callbacks() {
                    if state.receive_queue.has_entry()
                        && state.receive_queue.size() >= entry.min_bytes
                    {
                        let (data, endpoint) = state.receive_queue.drain_into_blob(usize::MAX);
                        completions.push(Completion::Receive(
                            entry.callback,
                            Ok(ReceiveContext {
                                data,
                                endpoint,
                                token: entry.token,
                            }),
                        ));
                    } else {
                        completions.push(Completion::Receive(
                            entry.callback,
                            Err(discard_status.clone()),
                        ));
                    }
                }
                state.flow.apply(Direction::Receive);
                if origin == ShutdownOrigin::Source {
                    if let Some(handle) = state.handle.as_ref() {
                        if let Err(error) = handle.shutdown(Direction::Receive) {
                            debug!(?error, "stream shutdown(receive) failed");
                        }
                    }
                }
                self.sync_readable_interest(state);
                state.announce(SocketEvent::ShutdownReceive);
            }
        }

        self.maybe_complete_shutdown_locked(state, &mut completions);
        completions
    }

    fn perform_send_shutdown_locked(self: &Arc<Self>, state: &mut StreamState) {
        if !state.shutdown.try_shutdown_send() {
            return;
        }
        state.shutdown_send_pending = false;
        if let Some(session) = state.session.as_mut() {
            let _ = session.shutdown();
        }
        if let Some(handle) = state.handle.as_ref() {
            if let Err(error) = handle.shutdown(Direction::Send) {
                debug!(?error, "stream shutdown(send) failed");
            }
        }
        self.sync_writable_interest(state);
        state.announce(SocketEvent::ShutdownSend);
    }

    fn maybe_complete_shutdown_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        completions: &mut Vec<Completion>,
    ) {
        if !state.shutdown.is_send_closed() || !state.shutdown.is_recv_closed() {
            return;
        }

        if state.attached && state.detach.try_begin_detach() {
            let id = state.handle_id.expect("attached socket has an id");
            let weak = Arc::downgrade(self);
            let _ = self.reactor.detach_socket(
                id,
                Box::new(move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.private_shutdown_complete();
                    }
                }),
            );
        } else if !state.attached && !state.closed {
            // never attached; complete inline
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
        state: &mut StreamState,
        completions: &mut Vec<Completion>,
    ) {
        if !state.shutdown.try_complete() {
            return;
        }

        state.handle = None;
        state.handle_id = None;
        state.closed = true;
        state.readable_shown = false;
        state.writable_shown = false;

        // every pending completion fires with a terminal status
        for callback in state.send_queue.remove_all() {
            completions.push(Completion::Send(callback, Err(Error::Closed)));
        }
        for entry in state.receive_queue.pop_all_callbacks() {
            completions.push(Completion::Receive(entry.callback, Err(Error::Closed)));
        }
        for (_, callback, _) in state.zero_copy_pending.drain(..) {
            completions.push(Completion::Send(callback, Err(Error::Closed)));
        }
        if let Some(callback) = state.handshake_callback.take() {
            completions.push(Completion::Handshake(callback, Err(Error::Closed)));
        }

        state.announce(SocketEvent::ShutdownComplete);
        for callback in state.close_callbacks.drain(..) {
            completions.push(Completion::Close(callback));
        }
    }

    fn sync_writable_interest(&self, state: &mut StreamState) {
        let Some(id) = state.handle_id else {
            state.writable_shown = false;
            return;
        };
        if !state.attached || !state.detach.is_attached() {
            return;
        }

        let want = state.connect_waiting()
            || (state.send_queue.has_entry() && state.connected && state.flow.send_relaxed());
        if want && !state.writable_shown {
            if self.reactor.show_writable(id).is_ok() {
                state.writable_shown = true;
            }
        } else if !want && state.writable_shown {
            if self.reactor.hide_writable(id).is_ok() {
                state.writable_shown = false;
            }
        }
    }

    fn sync_readable_interest(&self, state: &mut StreamState) {
        let Some(id) = state.handle_id else {
            state.readable_shown = false;
            return;
        };
        if !state.attached || !state.detach.is_attached() {
            return;
        }

        let want =
            state.connected && state.flow.recv_relaxed() && !state.shutdown.is_recv_closed();
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

    /// Resume reading after a high-watermark pause, re-arming the
    /// reactor registration for readability.
    pub fn relax_receive_flow_control(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.flow.relax(Direction::Receive).receive {
            self.sync_readable_interest(&mut state);
        }
    }

    fn through_session_locked(&self, state: &mut StreamState, data: Data) -> Result<Data> {
        let Some(session) = state.session.as_mut() else {
            return Ok(data);
        };
        if !session.is_established() {
            return Err(Error::InProgress);
        }

        let mut staged = keelson_core::blob::Blob::new();
        data.copy(&mut staged)?;
        session.push_plaintext(&staged.to_bytes())?;
        match session.pop_outgoing()? {
            Some(ciphertext) => Ok(Data::Blob(ciphertext)),
            None => Err(Error::Invalid),
        }
    }

    fn pump_session_outgoing_locked(self: &Arc<Self>, state: &mut StreamState) {
        loop {
            let Some(session) = state.session.as_mut() else {
                return;
            };
            let outgoing = match session.pop_outgoing() {
                Ok(Some(outgoing)) => outgoing,
                Ok(None) => return,
                Err(error) => {
                    warn!(?error, "encryption session failed to produce output");
                    return;
                }
            };
            let id = state.send_queue.generate_entry_id();
            let entry = SendQueueEntry::new(id, Data::Blob(outgoing));
            state.send_queue.push(entry);
        }
    }

    fn drain_send_queue_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        completions: &mut Vec<Completion>,
    ) {
        let batch_options = self.batch_options();
        loop {
            if !state.flow.send_relaxed() || !state.send_queue.has_entry() {
                break;
            }
            let Some(handle) = state.handle.as_ref() else {
                break;
            };

            let written = if let Some(batch) = state.send_queue.batch_next(&batch_options) {
                handle.send_vectored(&batch)
            } else {
                let front = state.send_queue.front().expect("has_entry checked");
                match &front.data {
                    Data::File(region) => match region.read_front(FILE_CHUNK_SIZE) {
                        Ok(chunk) if chunk.is_empty() => Err(Error::EndOfStream),
                        Ok(chunk) => handle.send(&chunk),
                        Err(error) => Err(error),
                    },
                    data => {
                        let mut gather = Vec::new();
                        match data.gather_segments(&mut gather) {
                            Ok(()) => {
                                let mut array = ConstBufferArray::new();
                                for segment in gather {
                                    array.push(segment);
                                }
                                handle.send_vectored(&array)
                            }
                            Err(error) => Err(error),
                        }
                    }
                }
            };

            match written {
                Ok(0) => {
                    self.handle_fatal_error_locked(state, Error::ConnectionReset, completions);
                    break;
                }
                Ok(written) => {
                    self.consume_written_locked(state, written, completions);
                }
                Err(Error::WouldBlock) => break,
                Err(Error::Interrupted) => {}
                Err(error) => {
                    self.handle_fatal_error_locked(state, error, completions);
                    break;
                }
            }
        }

        if !state.send_queue.has_entry() {
            if state.shutdown_send_pending {
                self.perform_send_shutdown_locked(state);
                self.maybe_complete_shutdown_locked(state, completions);
            }
        }
        if state.send_queue.authorize_low_watermark_event() {
            state.announce(SocketEvent::WriteQueueLowWatermark {
                size: state.send_queue.size(),
            });
        }
    }

    fn consume_written_locked(
        &self,
        state: &mut StreamState,
        written: usize,
        completions: &mut Vec<Completion>,
    ) {
        let mut remaining = written;
        while remaining > 0 {
            let front_length = state
                .send_queue
                .front()
                .expect("written bytes imply entries")
                .length;
            if remaining >= front_length {
                state.send_queue.pop_bytes(front_length);
                remaining -= front_length;
                let (entry, _) = state.send_queue.pop().expect("front exists");
                self.complete_entry_locked(state, entry, completions);
            } else {
                state.send_queue.pop_bytes(remaining);
                remaining = 0;
            }
        }
    }

    fn complete_entry_locked(
        &self,
        state: &mut StreamState,
        mut entry: SendQueueEntry,
        completions: &mut Vec<Completion>,
    ) {
        let context = entry.context();
        if self.options.timestamp_outgoing {
            state.pending_notifications.push(Notification::Timestamp {
                id: entry.id,
                time: Instant::now(),
            });
        }
        if entry.zero_copy {
            // completion waits for the transport's acknowledgement
            state
                .pending_notifications
                .push(Notification::ZeroCopyComplete { id: entry.id });
            if let Some(callback) = entry.callback.take() {
                state.zero_copy_pending.push((entry.id, callback, context));
            }
        } else if let Some(callback) = entry.callback.take() {
            completions.push(Completion::Send(callback, Ok(context)));
        }
    }

    fn handle_fatal_error_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        error: Error,
        completions: &mut Vec<Completion>,
    ) {
        warn!(?error, "stream socket failed");
        state.last_error = Some(error.clone());
        completions.extend(self.fail_connect_if_pending_locked(state, error.clone()));
        for callback in state.send_queue.remove_all() {
            completions.push(Completion::Send(callback, Err(error.clone())));
        }
        for entry in state.receive_queue.pop_all_callbacks() {
            completions.push(Completion::Receive(entry.callback, Err(error.clone())));
        }
        completions.extend(self.shutdown_locked(
            state,
            Direction::Both,
            ShutdownOrigin::Remote,
            FlowControlMode::Immediate,
        ));
    }

    fn on_readable_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        completions: &mut Vec<Completion>,
    ) {
        loop {
            if !state.flow.recv_relaxed() || state.shutdown.is_recv_closed() {
                break;
            }
            let Some(handle) = state.handle.as_ref() else {
                break;
            };

            let capacity = state.feedback.current();
            let mut buffer = BytesMut::zeroed(capacity);
            match handle.recv(&mut buffer) {
                Ok(0) => {
                    // remote closed its sending side
                    completions.extend(self.shutdown_locked(
                        state,
                        Direction::Receive,
                        ShutdownOrigin::Remote,
                        FlowControlMode::Gentle,
                    ));
                    break;
                }
                Ok(received) => {
                    buffer.truncate(received);
                    state.feedback.set_feedback(capacity, received);
                    self.ingest_locked(state, buffer.freeze(), completions);

                    if state.receive_queue.authorize_low_watermark_event() {
                        state.announce(SocketEvent::ReadQueueLowWatermark {
                            size: state.receive_queue.size(),
                        });
                    }
                    if state.receive_queue.authorize_high_watermark_event() {
                        state.announce(SocketEvent::ReadQueueHighWatermark {
                            size: state.receive_queue.size(),
                        });
                        // pause reading until the user drains the queue
                        state.flow.apply(Direction::Receive);
                        self.sync_readable_interest(state);
                        break;
                    }
                }
                Err(Error::WouldBlock) => break,
                Err(Error::Interrupted) => {}
                Err(error) => {
                    self.handle_fatal_error_locked(state, error, completions);
                    break;
                }
            }
        }
    }

    fn ingest_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        raw: bytes::Bytes,
        completions: &mut Vec<Completion>,
    ) {
        if state.session.is_some() {
            self.ingest_through_session_locked(state, &raw, completions);
        } else {
            state.receive_queue.push_entry(ReceiveQueueEntry::new(raw));
        }
        self.satisfy_receive_callbacks_locked(state, completions);
    }

    fn ingest_through_session_locked(
        self: &Arc<Self>,
        state: &mut StreamState,
        raw: &[u8],
        completions: &mut Vec<Completion>,
    ) {
        let session = state.session.as_mut().expect("session checked");
        let was_established = session.is_established();
        match session.push_incoming(raw) {
            Ok(handshake_state) => {
                while let Ok(Some(plaintext)) = session.pop_plaintext() {
                    if !plaintext.is_empty() {
                        state
                            .receive_queue
                            .push_entry(ReceiveQueueEntry::new(plaintext.to_bytes()));
                    }
                }
                self.pump_session_outgoing_locked(state);
                self.sync_writable_interest(state);
                if !was_established && handshake_state == HandshakeState::Established {
                    if let Some(callback) = state.handshake_callback.take() {
                        completions.push(Completion::Handshake(callback, Ok(())));
                    }
                }
            }
            Err(error) => {
                // authorization failures surface to the handshake callback
                if let Some(callback) = state.handshake_callback.take() {
                    completions.push(Completion::Handshake(callback, Err(error.clone())));
                }
                self.handle_fatal_error_locked(state, error, completions);
            }
        }
    }

    fn satisfy_receive_callbacks_locked(
        &self,
        state: &mut StreamState,
        completions: &mut Vec<Completion>,
    ) {
        while let Some(entry) = state.receive_queue.pop_callback() {
            let (data, endpoint) = state.receive_queue.drain_into_blob(usize::MAX);
            completions.push(Completion::Receive(
                entry.callback,
                Ok(ReceiveContext {
                    data,
                    endpoint,
                    token: entry.token,
                }),
            ));
        }
    }

    fn dispatch(self: &Arc<Self>, completions: Vec<Completion>) {
        for completion in completions {
            match completion {
                Completion::Send(callback, result) => {
                    self.strand.execute(Box::new(move || callback(result)));
                }
                Completion::Receive(callback, result) => {
                    self.strand.execute(Box::new(move || callback(result)));
                }
                Completion::Connect(callback, result) => {
                    self.strand.execute(Box::new(move || callback(result)));
                }
                Completion::Handshake(callback, result) => {
                    self.strand.execute(Box::new(move || callback(result)));
                }
                Completion::Close(callback) => {
                    self.strand.execute(Box::new(move || callback()));
                }
                Completion::Notifications(queue) => {
                    let socket = self.clone();
                    self.strand
                        .execute(Box::new(move || socket.process_notifications(queue)));
                }
            }
        }
    }

    fn take_synthesized_notifications(&self, state: &mut StreamState) -> Option<Completion> {
        if state.pending_notifications.is_empty() {
            return None;
        }
        let queue = std::mem::take(&mut state.pending_notifications);
        Some(Completion::Notifications(queue))
    }
}

impl ReactorSocket for StreamSocket {
    fn process_socket_readable(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut completions = Vec::new();
            self.on_readable_locked(&mut state, &mut completions);
            self.sync_readable_interest(&mut state);
            if let Some(notifications) = self.take_synthesized_notifications(&mut state) {
                completions.push(notifications);
            }
            completions
        };
        self.dispatch(completions);
    }

    fn process_socket_writable(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut completions = Vec::new();

            if state.connect_waiting() {
                let verdict = state
                    .handle
                    .as_ref()
                    .map_or(Ok(None), |handle| handle.take_error());
                match verdict {
                    Ok(None) => {
                        completions.extend(self.complete_connect_locked(&mut state));
                        // queued sends may proceed immediately
                        self.drain_send_queue_locked(&mut state, &mut completions);
                        self.sync_writable_interest(&mut state);
                    }
                    Ok(Some(error)) | Err(error) => {
                        completions.extend(self.retry_or_fail_connect_locked(&mut state, error));
                    }
                }
            } else {
                self.drain_send_queue_locked(&mut state, &mut completions);
                self.sync_writable_interest(&mut state);
            }

            if let Some(notifications) = self.take_synthesized_notifications(&mut state) {
                completions.push(notifications);
            }
            completions
        };
        self.dispatch(completions);
    }

    fn process_socket_error(self: Arc<Self>) {
        let completions = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let error = state
                .handle
                .as_ref()
                .and_then(|handle| handle.take_error().ok().flatten())
                .unwrap_or(Error::ConnectionReset);

            let mut completions = Vec::new();
            if state.connect_waiting() {
                completions.extend(self.retry_or_fail_connect_locked(&mut state, error));
            } else {
                self.handle_fatal_error_locked(&mut state, error, &mut completions);
            }
            completions
        };
        self.dispatch(completions);
    }

    fn process_notifications(self: Arc<Self>, notifications: NotificationQueue) {
        let completions = {
            let mut state = self.state.lock();
            let mut completions = Vec::new();
            for notification in notifications.iter() {
                match notification {
                    Notification::ZeroCopyComplete { id } => {
                        state.announce(SocketEvent::ZeroCopyComplete { id: *id });
                        if let Some(position) = state
                            .zero_copy_pending
                            .iter()
                            .position(|(pending, _, _)| pending == id)
                        {
                            let (_, callback, context) = state.zero_copy_pending.remove(position);
                            completions.push(Completion::Send(callback, Ok(context)));
                        }
                    }
                    Notification::Timestamp { id, time } => {
                        tracing::trace!(id, ?time, "send left the host");
                    }
                }
            }
            completions
        };
        self.dispatch(completions);
    }

    fn strand(&self) -> Strand {
        self.strand.clone()
    }
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamSocket")
            .field("connected", &state.connected)
            .field("write_queue_size", &state.send_queue.size())
            .field("read_queue_size", &state.receive_queue.size())
            .field("closed", &state.closed)
            .finish()
    }
}
