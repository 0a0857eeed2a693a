//! # Keelson
//!
//! An asynchronous socket toolkit built around an explicit readiness
//! reactor.
//!
//! ## Architecture
//!
//! Keelson is structured in two layers under this public facade:
//!
//! - **`keelson-core`**: queues, watermarks, strands, the skip-list
//!   chronology, state machines, options, errors
//! - **`keelson-net`**: the reactor, stream/listener sockets, the
//!   resolver, and the platform socket layer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keelson::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example() -> keelson::Result<()> {
//! let reactor: ReactorRef = PollReactor::create()?;
//!
//! // server
//! let listener = ListenerSocket::create(ListenerSocketOptions::default(), reactor.clone(), None);
//! listener.bind(&Endpoint::parse("127.0.0.1:0")?, &BindOptions::default())?;
//! listener.listen()?;
//! listener.accept(&AcceptOptions::default(), Box::new(|result| {
//!     if let Ok(accepted) = result {
//!         println!("accepted {:?}", accepted.peer);
//!     }
//! }))?;
//!
//! // client
//! let bound = listener.source_endpoint()?;
//! let socket = StreamSocket::create(StreamSocketOptions::default(), reactor, None);
//! socket.connect(&bound, ConnectOptions::default(), Box::new(|result| {
//!     assert!(result.is_ok());
//! }))?;
//! socket.send("Hello, world!".into(), &SendOptions::default(), None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Every socket owns a *strand*: a serialization domain guaranteeing
//! its completions run one at a time, in FIFO order, on the reactor's
//! executor. Queues carry low/high watermarks whose events alternate,
//! driving backpressure without polling.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

// Re-export core types
pub use bytes::Bytes;
pub use keelson_core::error::{Error, Result};

/// Development helpers (benches/tests)
pub mod dev_tracing;

/// The commonly used surface of the toolkit.
pub mod prelude {
    pub use keelson_core::prelude::*;
    pub use keelson_net::prelude::*;
}
