//! The default reactor: a mio poller on a dedicated thread.
//!
//! Interest changes and attach/detach requests arrive over a command
//! channel and a waker; the polling thread owns every registration, so
//! no registry state is shared across threads. The poll timeout tracks
//! the chronology's earliest deadline, and due timers fire right after
//! each poll returns.

use hashbrown::HashMap;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};

use keelson_core::chronology::Chronology;
use keelson_core::error::{Error, Result};
use keelson_core::strand::{Executor, ExecutorRef, Functor, ThreadPool};

use crate::handle::HandleId;
use crate::reactor::{Reactor, ReactorSocket};

const WAKER_TOKEN: Token = Token(usize::MAX);

enum Command {
    Attach {
        id: HandleId,
        socket: Arc<dyn ReactorSocket>,
    },
    Detach {
        id: HandleId,
        on_detached: Functor,
    },
    Interest {
        id: HandleId,
        readable: Option<bool>,
        writable: Option<bool>,
    },
    Shutdown,
}

struct Registration {
    id: HandleId,
    socket: Arc<dyn ReactorSocket>,
    readable: bool,
    writable: bool,
    registered: bool,
}

struct PollThread {
    poll: Poll,
    registrations: HashMap<Token, Registration>,
    tokens_by_id: HashMap<HandleId, Token>,
    next_token: usize,
    chronology: Chronology,
}

#[cfg(unix)]
fn with_source<R>(id: HandleId, f: impl FnOnce(&mut mio::unix::SourceFd<'_>) -> R) -> R {
    let fd = id;
    f(&mut mio::unix::SourceFd(&fd))
}

impl PollThread {
    fn apply_interest(&mut self, token: Token) {
        let Some(registration) = self.registrations.get_mut(&token) else {
            return;
        };

        let interest = match (registration.readable, registration.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let registry = self.poll.registry();
        let result = match (interest, registration.registered) {
            (Some(interest), false) => {
                registration.registered = true;
                with_source(registration.id, |source| {
                    registry.register(source, token, interest)
                })
            }
            (Some(interest), true) => with_source(registration.id, |source| {
                registry.reregister(source, token, interest)
            }),
            (None, true) => {
                registration.registered = false;
                with_source(registration.id, |source| registry.deregister(source))
            }
            (None, false) => Ok(()),
        };

        if let Err(error) = result {
            warn!(id = registration.id, ?error, "reactor: interest change failed");
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Attach { id, socket } => {
                let token = Token(self.next_token);
                self.next_token += 1;
                self.tokens_by_id.insert(id, token);
                self.registrations.insert(
                    token,
                    Registration {
                        id,
                        socket,
                        readable: false,
                        writable: false,
                        registered: false,
                    },
                );
            }
            Command::Detach { id, on_detached } => {
                let Some(token) = self.tokens_by_id.remove(&id) else {
                    debug!(id, "reactor: detach of unknown handle");
                    return true;
                };
                if let Some(registration) = self.registrations.remove(&token) {
                    if registration.registered {
                        let result =
                            with_source(id, |source| self.poll.registry().deregister(source));
                        if let Err(error) = result {
                            debug!(id, ?error, "reactor: deregister failed");
                        }
                    }
                    // confirmation is ordered after any event already
                    // dispatched through the strand
                    registration.socket.strand().execute(on_detached);
                }
            }
            Command::Interest {
                id,
                readable,
                writable,
            } => {
                if let Some(token) = self.tokens_by_id.get(&id).copied() {
                    if let Some(registration) = self.registrations.get_mut(&token) {
                        if let Some(readable) = readable {
                            registration.readable = readable;
                        }
                        if let Some(writable) = writable {
                            registration.writable = writable;
                        }
                    }
                    self.apply_interest(token);
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn dispatch(&self, event: &mio::event::Event) {
        let Some(registration) = self.registrations.get(&event.token()) else {
            return;
        };
        let strand = registration.socket.strand();

        if event.is_error() {
            let socket = registration.socket.clone();
            strand.execute(Box::new(move || socket.process_socket_error()));
        }
        if event.is_readable() || event.is_read_closed() {
            let socket = registration.socket.clone();
            strand.execute(Box::new(move || socket.process_socket_readable()));
        }
        if event.is_writable() {
            let socket = registration.socket.clone();
            strand.execute(Box::new(move || socket.process_socket_writable()));
        }
    }

    fn run(mut self, commands: flume::Receiver<Command>) {
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self
                .chronology
                .earliest()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(error) = self.poll.poll(&mut events, timeout) {
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(?error, "reactor: poll failed");
                return;
            }

            self.chronology.advance(Instant::now());

            while let Ok(command) = commands.try_recv() {
                if !self.handle_command(command) {
                    debug!("reactor: shutting down");
                    return;
                }
            }

            for event in events.iter() {
                self.dispatch(event);
            }
        }
    }
}

/// mio-backed [`Reactor`].
pub struct PollReactor {
    command_tx: flume::Sender<Command>,
    waker: Arc<Waker>,
    chronology: Chronology,
    executor: ExecutorRef,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollReactor {
    /// Create the reactor with its own executor sized to the host.
    pub fn create() -> Result<Arc<Self>> {
        Self::create_with_executor(ThreadPool::new())
    }

    /// Create the reactor over an existing executor.
    pub fn create_with_executor(executor: ExecutorRef) -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let chronology = Chronology::new(executor.clone());

        {
            let waker = waker.clone();
            chronology.set_front_observer(Box::new(move || {
                let _ = waker.wake();
            }));
        }

        let (command_tx, command_rx) = flume::unbounded();
        let thread_state = PollThread {
            poll,
            registrations: HashMap::new(),
            tokens_by_id: HashMap::new(),
            next_token: 0,
            chronology: chronology.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("keelson-reactor".to_owned())
            .spawn(move || thread_state.run(command_rx))
            .map_err(Error::from)?;

        Ok(Arc::new(Self {
            command_tx,
            waker,
            chronology,
            executor,
            thread: Mutex::new(Some(thread)),
        }))
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::Closed)?;
        self.waker.wake().map_err(Error::from)
    }
}

impl Reactor for PollReactor {
    fn attach_socket(&self, id: HandleId, socket: Arc<dyn ReactorSocket>) -> Result<()> {
        self.submit(Command::Attach { id, socket })
    }

    fn detach_socket(&self, id: HandleId, on_detached: Functor) -> Result<()> {
        self.submit(Command::Detach { id, on_detached })
    }

    fn show_readable(&self, id: HandleId) -> Result<()> {
        self.submit(Command::Interest {
            id,
            readable: Some(true),
            writable: None,
        })
    }

    fn hide_readable(&self, id: HandleId) -> Result<()> {
        self.submit(Command::Interest {
            id,
            readable: Some(false),
            writable: None,
        })
    }

    fn show_writable(&self, id: HandleId) -> Result<()> {
        self.submit(Command::Interest {
            id,
            readable: None,
            writable: Some(true),
        })
    }

    fn hide_writable(&self, id: HandleId) -> Result<()> {
        self.submit(Command::Interest {
            id,
            readable: None,
            writable: Some(false),
        })
    }

    fn chronology(&self) -> Chronology {
        self.chronology.clone()
    }

    fn executor(&self) -> ExecutorRef {
        self.executor.clone()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Drop for PollReactor {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}
