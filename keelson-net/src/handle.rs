//! The platform socket layer.
//!
//! Sockets consume the operating system through the [`StreamHandle`] and
//! [`ListenerHandle`] traits; [`TcpStreamHandle`] and
//! [`TcpListenerHandle`] are the socket2-backed implementations. Tests
//! substitute in-memory fakes.
//!
//! # Safety
//!
//! `recv` passes the caller's initialized buffer to socket2's
//! `MaybeUninit` receive; the cast is sound because initialized memory
//! is a valid `MaybeUninit` source and the kernel only writes forward.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::IoSlice;
use std::mem::MaybeUninit;
use std::net::Shutdown;

use keelson_core::blob::ConstBufferArray;
use keelson_core::endpoint::{Endpoint, Transport};
use keelson_core::error::{Error, Result};
use keelson_core::options::SocketOption;
use keelson_core::state::Direction;

/// Identity of an open handle, used to key reactor registrations.
pub type HandleId = i32;

/// A connected (or connecting) stream socket as the core consumes it.
pub trait StreamHandle: Send + Sync {
    fn set_nonblocking(&self, enabled: bool) -> Result<()>;
    fn bind(&self, endpoint: &Endpoint) -> Result<()>;
    /// Begin connecting; non-blocking connects report `InProgress` and
    /// complete on the next writable event.
    fn connect(&self, endpoint: &Endpoint) -> Result<()>;
    fn send(&self, data: &[u8]) -> Result<usize>;
    /// Scatter/gather send of a whole gather-list.
    fn send_vectored(&self, buffers: &ConstBufferArray) -> Result<usize>;
    fn recv(&self, buffer: &mut [u8]) -> Result<usize>;
    fn shutdown(&self, direction: Direction) -> Result<()>;
    /// Drain the pending socket error (`SO_ERROR`).
    fn take_error(&self) -> Result<Option<Error>>;
    fn source_endpoint(&self) -> Result<Endpoint>;
    fn remote_endpoint(&self) -> Result<Endpoint>;
    fn set_option(&self, option: &SocketOption) -> Result<()>;
    fn duplicate(&self) -> Result<Box<dyn StreamHandle>>;
    /// True when the transport acknowledges sends asynchronously and the
    /// socket must defer zero-copy completions to a notification.
    fn supports_zero_copy(&self) -> bool {
        false
    }
    fn handle_id(&self) -> HandleId;
}

/// A listening socket as the core consumes it.
pub trait ListenerHandle: Send + Sync {
    fn set_nonblocking(&self, enabled: bool) -> Result<()>;
    fn bind(&self, endpoint: &Endpoint) -> Result<()>;
    fn listen(&self, backlog: usize) -> Result<()>;
    /// Dequeue one connection from the OS backlog.
    fn accept(&self) -> Result<(Box<dyn StreamHandle>, Endpoint)>;
    fn take_error(&self) -> Result<Option<Error>>;
    fn source_endpoint(&self) -> Result<Endpoint>;
    fn set_option(&self, option: &SocketOption) -> Result<()>;
    fn handle_id(&self) -> HandleId;
}

fn domain_of(transport: Transport) -> Result<Domain> {
    match transport {
        Transport::TcpIpv4Stream => Ok(Domain::IPV4),
        Transport::TcpIpv6Stream => Ok(Domain::IPV6),
        #[cfg(unix)]
        Transport::LocalStream => Ok(Domain::UNIX),
        _ => Err(Error::NotSupported),
    }
}

fn protocol_of(transport: Transport) -> Option<Protocol> {
    transport.is_tcp().then_some(Protocol::TCP)
}

fn sock_addr_of(endpoint: &Endpoint) -> Result<SockAddr> {
    match endpoint {
        Endpoint::Ip(addr) => Ok(SockAddr::from(*addr)),
        #[cfg(unix)]
        Endpoint::Local(path) => SockAddr::unix(path).map_err(Error::from),
    }
}

fn endpoint_of(addr: &SockAddr) -> Result<Endpoint> {
    if let Some(ip) = addr.as_socket() {
        return Ok(Endpoint::Ip(ip));
    }
    #[cfg(unix)]
    if let Some(path) = addr.as_pathname() {
        return Ok(Endpoint::Local(path.to_path_buf()));
    }
    Err(Error::Invalid)
}

fn apply_option(socket: &Socket, option: &SocketOption) -> Result<()> {
    match option {
        SocketOption::ReuseAddress(enabled) => socket.set_reuse_address(*enabled)?,
        SocketOption::KeepAlive(enabled) => socket.set_keepalive(*enabled)?,
        #[cfg(target_os = "linux")]
        SocketOption::Cork(enabled) => socket.set_cork(*enabled)?,
        #[cfg(not(target_os = "linux"))]
        SocketOption::Cork(_) => return Err(Error::NotSupported),
        SocketOption::DelayTransmission(enabled) => socket.set_nodelay(!*enabled)?,
        #[cfg(target_os = "linux")]
        SocketOption::DelayAcknowledgement(enabled) => socket.set_quickack(!*enabled)?,
        #[cfg(not(target_os = "linux"))]
        SocketOption::DelayAcknowledgement(_) => return Err(Error::NotSupported),
        SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(*size)?,
        SocketOption::ReceiveBufferSize(size) => socket.set_recv_buffer_size(*size)?,
        SocketOption::Linger { enabled, duration } => {
            socket.set_linger(enabled.then_some(*duration))?;
        }
        SocketOption::Broadcast(enabled) => socket.set_broadcast(*enabled)?,
        SocketOption::InlineOutOfBandData(enabled) => socket.set_out_of_band_inline(*enabled)?,
        SocketOption::SendBufferLowWatermark(_)
        | SocketOption::ReceiveBufferLowWatermark(_)
        | SocketOption::Debug(_)
        | SocketOption::BypassRouting(_)
        | SocketOption::TimestampIncoming(_)
        | SocketOption::TimestampOutgoing(_)
        | SocketOption::ZeroCopy(_) => return Err(Error::NotSupported),
    }
    Ok(())
}

#[cfg(unix)]
fn id_of(socket: &Socket) -> HandleId {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn id_of(socket: &Socket) -> HandleId {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket() as HandleId
}

/// socket2-backed stream handle.
pub struct TcpStreamHandle {
    socket: Socket,
}

impl TcpStreamHandle {
    /// Open a non-blocking stream socket of the given transport family.
    pub fn open(transport: Transport) -> Result<Self> {
        let socket = Socket::new(domain_of(transport)?, Type::STREAM, protocol_of(transport))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Import an already-open socket.
    #[must_use]
    pub fn from_socket(socket: Socket) -> Self {
        Self { socket }
    }
}

impl StreamHandle for TcpStreamHandle {
    fn set_nonblocking(&self, enabled: bool) -> Result<()> {
        self.socket.set_nonblocking(enabled).map_err(Error::from)
    }

    fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        self.socket.bind(&sock_addr_of(endpoint)?).map_err(Error::from)
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.socket
            .connect(&sock_addr_of(endpoint)?)
            .map_err(Error::from)
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        self.socket.send(data).map_err(Error::from)
    }

    fn send_vectored(&self, buffers: &ConstBufferArray) -> Result<usize> {
        let slices: Vec<IoSlice<'_>> = buffers.iter().map(|b| IoSlice::new(b)).collect();
        self.socket.send_vectored(&slices).map_err(Error::from)
    }

    #[allow(unsafe_code)]
    fn recv(&self, buffer: &mut [u8]) -> Result<usize> {
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(
                buffer.as_mut_ptr().cast::<MaybeUninit<u8>>(),
                buffer.len(),
            )
        };
        self.socket.recv(uninit).map_err(Error::from)
    }

    fn shutdown(&self, direction: Direction) -> Result<()> {
        let how = match direction {
            Direction::Send => Shutdown::Write,
            Direction::Receive => Shutdown::Read,
            Direction::Both => Shutdown::Both,
        };
        self.socket.shutdown(how).map_err(Error::from)
    }

    fn take_error(&self) -> Result<Option<Error>> {
        Ok(self.socket.take_error()?.map(Error::from))
    }

    fn source_endpoint(&self) -> Result<Endpoint> {
        endpoint_of(&self.socket.local_addr()?)
    }

    fn remote_endpoint(&self) -> Result<Endpoint> {
        endpoint_of(&self.socket.peer_addr()?)
    }

    fn set_option(&self, option: &SocketOption) -> Result<()> {
        apply_option(&self.socket, option)
    }

    fn duplicate(&self) -> Result<Box<dyn StreamHandle>> {
        let socket = self.socket.try_clone()?;
        Ok(Box::new(Self { socket }))
    }

    fn handle_id(&self) -> HandleId {
        id_of(&self.socket)
    }
}

/// socket2-backed listener handle.
pub struct TcpListenerHandle {
    socket: Socket,
}

impl TcpListenerHandle {
    /// Open a non-blocking listener socket of the given transport family.
    pub fn open(transport: Transport) -> Result<Self> {
        let socket = Socket::new(domain_of(transport)?, Type::STREAM, protocol_of(transport))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl ListenerHandle for TcpListenerHandle {
    fn set_nonblocking(&self, enabled: bool) -> Result<()> {
        self.socket.set_nonblocking(enabled).map_err(Error::from)
    }

    fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        self.socket.bind(&sock_addr_of(endpoint)?).map_err(Error::from)
    }

    fn listen(&self, backlog: usize) -> Result<()> {
        self.socket
            .listen(backlog.min(i32::MAX as usize) as i32)
            .map_err(Error::from)
    }

    fn accept(&self) -> Result<(Box<dyn StreamHandle>, Endpoint)> {
        let (child, peer) = self.socket.accept()?;
        child.set_nonblocking(true)?;
        let endpoint = endpoint_of(&peer)?;
        Ok((Box::new(TcpStreamHandle::from_socket(child)), endpoint))
    }

    fn take_error(&self) -> Result<Option<Error>> {
        Ok(self.socket.take_error()?.map(Error::from))
    }

    fn source_endpoint(&self) -> Result<Endpoint> {
        endpoint_of(&self.socket.local_addr()?)
    }

    fn set_option(&self, option: &SocketOption) -> Result<()> {
        apply_option(&self.socket, option)
    }

    fn handle_id(&self) -> HandleId {
        id_of(&self.socket)
    }
}
