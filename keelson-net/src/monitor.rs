//! Socket event monitoring.
//!
//! Provides event streams for tracking socket lifecycle events like
//! connections, shutdown phases, and watermark transitions.

use keelson_core::endpoint::Endpoint;
use keelson_core::state::ShutdownOrigin;
use std::fmt;

/// Socket lifecycle events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Socket successfully bound to an endpoint.
    Bound(Endpoint),

    /// Socket successfully connected to a peer.
    Connected(Endpoint),

    /// Connection attempt failed.
    ConnectFailed { endpoint: Option<Endpoint>, reason: String },

    /// Socket is listening for incoming connections.
    Listening(Endpoint),

    /// Listener accepted a new incoming connection.
    Accepted(Endpoint),

    /// The write queue drained down to its low watermark.
    WriteQueueLowWatermark { size: usize },

    /// The write queue breached its high watermark.
    WriteQueueHighWatermark { size: usize },

    /// The read queue filled to its low watermark.
    ReadQueueLowWatermark { size: usize },

    /// The read queue filled past its high watermark.
    ReadQueueHighWatermark { size: usize },

    /// The accept queue filled to its low watermark.
    AcceptQueueLowWatermark { size: usize },

    /// The accept queue filled past its high watermark.
    AcceptQueueHighWatermark { size: usize },

    /// The shutdown sequence started.
    ShutdownInitiated { origin: ShutdownOrigin },

    /// The send direction is shut down.
    ShutdownSend,

    /// The receive direction is shut down.
    ShutdownReceive,

    /// The shutdown sequence finished; the handle is closed.
    ShutdownComplete,

    /// A zero-copy send was acknowledged by the transport.
    ZeroCopyComplete { id: u64 },
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound(ep) => write!(f, "Bound to {ep}"),
            Self::Connected(ep) => write!(f, "Connected to {ep}"),
            Self::ConnectFailed { endpoint, reason } => match endpoint {
                Some(ep) => write!(f, "Connect failed for {ep}: {reason}"),
                None => write!(f, "Connect failed: {reason}"),
            },
            Self::Listening(ep) => write!(f, "Listening on {ep}"),
            Self::Accepted(ep) => write!(f, "Accepted connection from {ep}"),
            Self::WriteQueueLowWatermark { size } => {
                write!(f, "Write queue drained to low watermark ({size} bytes)")
            }
            Self::WriteQueueHighWatermark { size } => {
                write!(f, "Write queue breached high watermark ({size} bytes)")
            }
            Self::ReadQueueLowWatermark { size } => {
                write!(f, "Read queue filled to low watermark ({size} bytes)")
            }
            Self::ReadQueueHighWatermark { size } => {
                write!(f, "Read queue filled past high watermark ({size} bytes)")
            }
            Self::AcceptQueueLowWatermark { size } => {
                write!(f, "Accept queue filled to low watermark ({size} connections)")
            }
            Self::AcceptQueueHighWatermark { size } => {
                write!(f, "Accept queue filled past high watermark ({size} connections)")
            }
            Self::ShutdownInitiated { origin } => {
                let origin = match origin {
                    ShutdownOrigin::Source => "locally",
                    ShutdownOrigin::Remote => "by the peer",
                };
                write!(f, "Shutdown initiated {origin}")
            }
            Self::ShutdownSend => write!(f, "Shutdown of the send direction complete"),
            Self::ShutdownReceive => write!(f, "Shutdown of the receive direction complete"),
            Self::ShutdownComplete => write!(f, "Shutdown complete"),
            Self::ZeroCopyComplete { id } => write!(f, "Zero-copy send {id} acknowledged"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Internal sender for socket events.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_display() {
        let endpoint = Endpoint::parse("127.0.0.1:5555").unwrap();
        let event = SocketEvent::Connected(endpoint);
        assert_eq!(event.to_string(), "Connected to 127.0.0.1:5555");

        let event = SocketEvent::WriteQueueHighWatermark { size: 8 };
        assert_eq!(
            event.to_string(),
            "Write queue breached high watermark (8 bytes)"
        );
    }

    #[test]
    fn monitor_channel_delivers() {
        let (sender, receiver) = create_monitor();
        sender
            .send(SocketEvent::ShutdownComplete)
            .expect("receiver alive");
        assert!(matches!(
            receiver.recv().unwrap(),
            SocketEvent::ShutdownComplete
        ));
    }
}
