//! Keelson Net
//!
//! The orchestration layer of the toolkit:
//! - The platform socket layer (`handle`)
//! - The reactor contract and the mio-backed poller (`reactor`,
//!   `poll_reactor`)
//! - Asynchronous stream and listener sockets (`stream`, `listener`)
//! - Socket lifecycle monitoring (`monitor`)
//! - Name resolution (`resolver`)
//! - The opaque encryption-session contract (`session`)

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod handle;
pub mod listener;
pub mod monitor;
#[cfg(unix)]
pub mod poll_reactor;
pub mod reactor;
pub mod resolver;
pub mod session;
pub mod stream;

pub mod prelude {
    pub use crate::handle::{HandleId, ListenerHandle, StreamHandle, TcpListenerHandle, TcpStreamHandle};
    pub use crate::listener::{AcceptedStream, ListenerSocket};
    pub use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
    #[cfg(unix)]
    pub use crate::poll_reactor::PollReactor;
    pub use crate::reactor::{
        Notification, NotificationQueue, Reactor, ReactorRef, ReactorSocket,
    };
    pub use crate::resolver::{
        EndpointOptions, IpAddressOptions, PortOptions, Resolver, ResolverConfig,
        ResolverOverrides,
    };
    pub use crate::session::{EncryptionSession, HandshakeCallback, HandshakeState};
    pub use crate::stream::{CloseCallback, ConnectCallback, StreamSocket};
}
