//! The opaque encryption-session contract.
//!
//! The stream socket drives a session through this interface when a user
//! upgrades the connection: inbound ciphertext is pushed in, outbound
//! ciphertext is popped and written to the transport, and plaintext
//! flows through the opposite pair. Trust decisions, certificate
//! handling, and the cipher itself live behind the implementation.

use keelson_core::blob::Blob;
use keelson_core::error::Result;

/// Outcome of feeding bytes through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// More handshake exchange is required.
    InProgress,
    /// The session is established; application data may flow.
    Established,
}

/// One encryption session over one stream socket.
///
/// Implementations are driven from the socket's strand, one call at a
/// time, and never re-entered.
pub trait EncryptionSession: Send {
    /// Begin the handshake. Handshake bytes to transmit become
    /// available via [`EncryptionSession::pop_outgoing`].
    fn initiate(&mut self) -> Result<()>;

    /// Feed ciphertext received from the peer. A `NotAuthorized` error
    /// indicates the peer failed authorization; it surfaces to the
    /// handshake callbacks of both peers.
    fn push_incoming(&mut self, ciphertext: &[u8]) -> Result<HandshakeState>;

    /// Drain ciphertext that must be written to the transport.
    fn pop_outgoing(&mut self) -> Result<Option<Blob>>;

    /// Feed application plaintext for encryption.
    fn push_plaintext(&mut self, plaintext: &[u8]) -> Result<()>;

    /// Drain decrypted application plaintext.
    fn pop_plaintext(&mut self) -> Result<Option<Blob>>;

    /// True once the handshake has completed.
    fn is_established(&self) -> bool;

    /// Begin the session's own shutdown exchange; remaining ciphertext
    /// is drained via [`EncryptionSession::pop_outgoing`].
    fn shutdown(&mut self) -> Result<()>;
}

/// Completion of a session handshake: the established session's peer
/// identity is implementation-defined, so the callback only carries the
/// error, if any.
pub type HandshakeCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;
