//! Keelson Core
//!
//! This crate contains the runtime-agnostic core building blocks:
//! - Error taxonomy (`error`)
//! - Endpoint and transport addressing (`endpoint`)
//! - Segmented blobs and gather-lists (`blob`)
//! - The tagged data container (`data`)
//! - Send/receive/accept queues with watermark backpressure (`queue`)
//! - Flow-control, shutdown, and detach state machines (`state`)
//! - Strands and executors (`strand`)
//! - The ordered skip list and the deadline chronology (`skiplist`,
//!   `chronology`)
//! - Token-bucket rate limiting and retry backoff (`rate`)
//! - Socket and per-operation options (`options`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod blob;
pub mod chronology;
pub mod data;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod rate;
pub mod skiplist;
pub mod state;
pub mod strand;
pub mod watermark;

pub mod queue {
    pub mod accept;
    pub mod receive;
    pub mod send;
}

// A small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::blob::{Blob, ConstBufferArray};
    pub use crate::chronology::{Chronology, Timer};
    pub use crate::data::{Data, FileRegion};
    pub use crate::endpoint::{Endpoint, IpAddressType, Transport};
    pub use crate::error::{Error, Result};
    pub use crate::options::{
        AcceptOptions, AcceptToken, BindOptions, ConnectOptions, ListenerSocketOptions,
        ReceiveOptions, ReceiveToken, SendOptions, SendToken, SocketOption, StreamSocketOptions,
    };
    pub use crate::queue::accept::{AcceptCallback, AcceptContext, AcceptQueue};
    pub use crate::queue::receive::{ReceiveCallback, ReceiveContext, ReceiveFeedback, ReceiveQueue};
    pub use crate::queue::send::{SendCallback, SendContext, SendQueue, SendQueueEntry};
    pub use crate::state::{
        Direction, FlowControlMode, FlowControlState, ShutdownOrigin, ShutdownState,
    };
    pub use crate::strand::{Executor, ExecutorRef, Functor, Strand, ThreadPool};
}
