//! Deterministic fixtures for the socket scenario tests: a
//! single-threaded executor pumped from the test, a reactor whose clock
//! and events the test owns, and in-memory socket handles.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use keelson_core::blob::ConstBufferArray;
use keelson_core::chronology::Chronology;
use keelson_core::endpoint::Endpoint;
use keelson_core::error::{Error, Result};
use keelson_core::options::SocketOption;
use keelson_core::state::Direction;
use keelson_core::strand::{Executor, ExecutorRef, Functor, FunctorSequence};

use keelson_net::handle::{HandleId, ListenerHandle, StreamHandle};
use keelson_net::reactor::{Reactor, ReactorSocket};

/// Queues functors; nothing runs until the test pumps.
#[derive(Default)]
pub struct DeferredExecutor {
    jobs: Mutex<VecDeque<Functor>>,
}

impl DeferredExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run queued jobs, including those they enqueue, until none remain.
    pub fn run_until_idle(&self) {
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, functor: Functor) {
        self.jobs.lock().push_back(functor);
    }

    fn move_and_execute(&self, sequence: &mut FunctorSequence, trailing: Option<Functor>) {
        let mut jobs = self.jobs.lock();
        jobs.extend(sequence.drain(..));
        jobs.extend(trailing);
    }
}

struct TestReactorState {
    sockets: HashMap<HandleId, Arc<dyn ReactorSocket>>,
    readable: HashMap<HandleId, bool>,
    writable: HashMap<HandleId, bool>,
    now: Instant,
}

/// A reactor the test drives by hand: events fire on demand, and time
/// moves only through [`TestReactor::advance`].
pub struct TestReactor {
    executor: Arc<DeferredExecutor>,
    chronology: Chronology,
    state: Mutex<TestReactorState>,
}

impl TestReactor {
    pub fn create() -> Arc<Self> {
        let executor = DeferredExecutor::new();
        let chronology = Chronology::new(executor.clone() as ExecutorRef);
        Arc::new(Self {
            executor,
            chronology,
            state: Mutex::new(TestReactorState {
                sockets: HashMap::new(),
                readable: HashMap::new(),
                writable: HashMap::new(),
                now: Instant::now(),
            }),
        })
    }

    /// Run every queued completion.
    pub fn pump(&self) {
        self.executor.run_until_idle();
    }

    /// Move the reactor clock to `now` and fire due timers.
    pub fn advance(&self, now: Instant) {
        self.state.lock().now = now;
        self.chronology.advance(now);
        self.pump();
    }

    pub fn is_readable_shown(&self, id: HandleId) -> bool {
        self.state.lock().readable.get(&id).copied().unwrap_or(false)
    }

    pub fn is_writable_shown(&self, id: HandleId) -> bool {
        self.state.lock().writable.get(&id).copied().unwrap_or(false)
    }

    pub fn is_attached(&self, id: HandleId) -> bool {
        self.state.lock().sockets.contains_key(&id)
    }

    fn socket_if_interested(
        &self,
        id: HandleId,
        interest: &HashMap<HandleId, bool>,
        sockets: &HashMap<HandleId, Arc<dyn ReactorSocket>>,
    ) -> Option<Arc<dyn ReactorSocket>> {
        if interest.get(&id).copied().unwrap_or(false) {
            sockets.get(&id).cloned()
        } else {
            None
        }
    }

    /// Deliver a readable event when readable interest is shown.
    /// Returns whether the event was delivered.
    pub fn fire_readable(&self, id: HandleId) -> bool {
        let socket = {
            let state = self.state.lock();
            self.socket_if_interested(id, &state.readable, &state.sockets)
        };
        let Some(socket) = socket else {
            return false;
        };
        socket
            .strand()
            .execute(Box::new(move || socket.clone().process_socket_readable()));
        self.pump();
        true
    }

    /// Deliver a writable event when writable interest is shown.
    pub fn fire_writable(&self, id: HandleId) -> bool {
        let socket = {
            let state = self.state.lock();
            self.socket_if_interested(id, &state.writable, &state.sockets)
        };
        let Some(socket) = socket else {
            return false;
        };
        socket
            .strand()
            .execute(Box::new(move || socket.clone().process_socket_writable()));
        self.pump();
        true
    }

    /// Deliver an error event regardless of interest.
    pub fn fire_error(&self, id: HandleId) -> bool {
        let socket = self.state.lock().sockets.get(&id).cloned();
        let Some(socket) = socket else {
            return false;
        };
        socket
            .strand()
            .execute(Box::new(move || socket.clone().process_socket_error()));
        self.pump();
        true
    }
}

impl Reactor for TestReactor {
    fn attach_socket(&self, id: HandleId, socket: Arc<dyn ReactorSocket>) -> Result<()> {
        let mut state = self.state.lock();
        state.sockets.insert(id, socket);
        state.readable.insert(id, false);
        state.writable.insert(id, false);
        Ok(())
    }

    fn detach_socket(&self, id: HandleId, on_detached: Functor) -> Result<()> {
        let socket = {
            let mut state = self.state.lock();
            state.readable.remove(&id);
            state.writable.remove(&id);
            state.sockets.remove(&id)
        };
        match socket {
            Some(socket) => {
                socket.strand().execute(on_detached);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn show_readable(&self, id: HandleId) -> Result<()> {
        self.state.lock().readable.insert(id, true);
        Ok(())
    }

    fn hide_readable(&self, id: HandleId) -> Result<()> {
        self.state.lock().readable.insert(id, false);
        Ok(())
    }

    fn show_writable(&self, id: HandleId) -> Result<()> {
        self.state.lock().writable.insert(id, true);
        Ok(())
    }

    fn hide_writable(&self, id: HandleId) -> Result<()> {
        self.state.lock().writable.insert(id, false);
        Ok(())
    }

    fn chronology(&self) -> Chronology {
        self.chronology.clone()
    }

    fn executor(&self) -> ExecutorRef {
        self.executor.clone()
    }

    fn now(&self) -> Instant {
        self.state.lock().now
    }
}

static NEXT_FAKE_ID: AtomicI32 = AtomicI32::new(1_000_000);

fn next_fake_id() -> HandleId {
    NEXT_FAKE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct FakeIo {
    write_capacity: Option<usize>,
    written: Vec<u8>,
    incoming: VecDeque<u8>,
    eof: bool,
    pending_error: Option<Error>,
    connect_attempts: usize,
    shutdowns: Vec<Direction>,
}

/// In-memory stream handle; the test scripts its kernel-side behavior.
#[derive(Clone)]
pub struct FakeStreamHandle {
    id: HandleId,
    local: Endpoint,
    remote: Endpoint,
    io: Arc<Mutex<FakeIo>>,
}

impl FakeStreamHandle {
    pub fn new() -> Self {
        Self {
            id: next_fake_id(),
            local: Endpoint::parse("127.0.0.1:40000").unwrap(),
            remote: Endpoint::parse("127.0.0.1:50000").unwrap(),
            io: Arc::new(Mutex::new(FakeIo {
                write_capacity: None,
                ..FakeIo::default()
            })),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Bytes the kernel will accept before reporting `WouldBlock`;
    /// `None` is unlimited.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.io.lock().write_capacity = capacity;
    }

    /// Stage bytes the next reads will deliver.
    pub fn push_incoming(&self, data: &[u8]) {
        self.io.lock().incoming.extend(data.iter().copied());
    }

    /// The peer closed its sending side after any staged bytes.
    pub fn set_eof(&self) {
        self.io.lock().eof = true;
    }

    /// Stage the error the next `take_error` drains.
    pub fn set_pending_error(&self, error: Error) {
        self.io.lock().pending_error = Some(error);
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.io.lock().written)
    }

    pub fn written_len(&self) -> usize {
        self.io.lock().written.len()
    }

    pub fn shutdowns(&self) -> Vec<Direction> {
        self.io.lock().shutdowns.clone()
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut io = self.io.lock();
        let available = io.write_capacity.unwrap_or(usize::MAX);
        if available == 0 {
            return Err(Error::WouldBlock);
        }
        let take = available.min(data.len());
        io.written.extend_from_slice(&data[..take]);
        if let Some(capacity) = io.write_capacity.as_mut() {
            *capacity -= take;
        }
        Ok(take)
    }
}

impl StreamHandle for FakeStreamHandle {
    fn set_nonblocking(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn bind(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
        self.io.lock().connect_attempts += 1;
        Err(Error::InProgress)
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    fn send_vectored(&self, buffers: &ConstBufferArray) -> Result<usize> {
        let mut total = 0;
        for buffer in buffers.iter() {
            match self.write(buffer) {
                Ok(written) => {
                    total += written;
                    if written < buffer.len() {
                        break;
                    }
                }
                Err(Error::WouldBlock) if total > 0 => break,
                Err(error) => return Err(error),
            }
        }
        Ok(total)
    }

    fn recv(&self, buffer: &mut [u8]) -> Result<usize> {
        let mut io = self.io.lock();
        if io.incoming.is_empty() {
            if io.eof {
                return Ok(0);
            }
            return Err(Error::WouldBlock);
        }
        let take = buffer.len().min(io.incoming.len());
        for slot in buffer.iter_mut().take(take) {
            *slot = io.incoming.pop_front().expect("length checked");
        }
        Ok(take)
    }

    fn shutdown(&self, direction: Direction) -> Result<()> {
        self.io.lock().shutdowns.push(direction);
        Ok(())
    }

    fn take_error(&self) -> Result<Option<Error>> {
        Ok(self.io.lock().pending_error.take())
    }

    fn source_endpoint(&self) -> Result<Endpoint> {
        Ok(self.local.clone())
    }

    fn remote_endpoint(&self) -> Result<Endpoint> {
        Ok(self.remote.clone())
    }

    fn set_option(&self, _option: &SocketOption) -> Result<()> {
        Ok(())
    }

    fn duplicate(&self) -> Result<Box<dyn StreamHandle>> {
        Ok(Box::new(self.clone()))
    }

    fn handle_id(&self) -> HandleId {
        self.id
    }
}

#[derive(Default)]
struct FakeBacklog {
    connections: VecDeque<(FakeStreamHandle, Endpoint)>,
    listened: bool,
}

/// In-memory listener handle with a scripted backlog.
#[derive(Clone)]
pub struct FakeListenerHandle {
    id: HandleId,
    local: Endpoint,
    backlog: Arc<Mutex<FakeBacklog>>,
}

impl FakeListenerHandle {
    pub fn new() -> Self {
        Self {
            id: next_fake_id(),
            local: Endpoint::parse("127.0.0.1:45000").unwrap(),
            backlog: Arc::new(Mutex::new(FakeBacklog::default())),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Queue a connection in the scripted OS backlog.
    pub fn push_connection(&self) -> FakeStreamHandle {
        let child = FakeStreamHandle::new();
        let peer = Endpoint::parse("10.0.0.1:12345").unwrap();
        self.backlog
            .lock()
            .connections
            .push_back((child.clone(), peer));
        child
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().connections.len()
    }
}

impl ListenerHandle for FakeListenerHandle {
    fn set_nonblocking(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn bind(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    fn listen(&self, _backlog: usize) -> Result<()> {
        self.backlog.lock().listened = true;
        Ok(())
    }

    fn accept(&self) -> Result<(Box<dyn StreamHandle>, Endpoint)> {
        let mut backlog = self.backlog.lock();
        match backlog.connections.pop_front() {
            Some((child, peer)) => Ok((Box::new(child), peer)),
            None => Err(Error::WouldBlock),
        }
    }

    fn take_error(&self) -> Result<Option<Error>> {
        Ok(None)
    }

    fn source_endpoint(&self) -> Result<Endpoint> {
        Ok(self.local.clone())
    }

    fn set_option(&self, _option: &SocketOption) -> Result<()> {
        Ok(())
    }

    fn handle_id(&self) -> HandleId {
        self.id
    }
}
