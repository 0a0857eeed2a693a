//! Socket and per-operation configuration options.
//!
//! Option structs follow the builder convention: flat public fields with
//! documented defaults, plus `with_*` methods for chained construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::endpoint::IpAddressType;

/// Default write-queue high watermark: 64 MiB.
pub const DEFAULT_WRITE_QUEUE_HIGH_WATERMARK: usize = 1 << 26;

/// Default read-queue high watermark: 64 MiB.
pub const DEFAULT_READ_QUEUE_HIGH_WATERMARK: usize = 1 << 26;

/// Default smallest read the AIMD controller will advise.
pub const DEFAULT_MIN_INCOMING_TRANSFER_SIZE: usize = 4096;

/// Default largest read the AIMD controller will advise.
pub const DEFAULT_MAX_INCOMING_TRANSFER_SIZE: usize = 128 * 1024;

macro_rules! token_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Generate a process-unique token.
            #[must_use]
            pub fn generate() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            #[must_use]
            pub const fn value(&self) -> u64 {
                self.0
            }
        }
    };
}

token_type! {
    /// Opaque identifier attached to a send operation for selective
    /// cancellation.
    SendToken
}

token_type! {
    /// Opaque identifier attached to a receive operation for selective
    /// cancellation.
    ReceiveToken
}

token_type! {
    /// Opaque identifier attached to an accept operation for selective
    /// cancellation.
    AcceptToken
}

/// An individual socket-level option applied to the underlying handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOption {
    ReuseAddress(bool),
    KeepAlive(bool),
    /// Coalesce partial frames until the cork is removed.
    Cork(bool),
    /// Enable Nagle's algorithm (the inverse of "no delay").
    DelayTransmission(bool),
    /// Delay acknowledgements (the inverse of "quick ack").
    DelayAcknowledgement(bool),
    SendBufferSize(usize),
    SendBufferLowWatermark(usize),
    ReceiveBufferSize(usize),
    ReceiveBufferLowWatermark(usize),
    Debug(bool),
    Linger { enabled: bool, duration: Duration },
    Broadcast(bool),
    BypassRouting(bool),
    InlineOutOfBandData(bool),
    TimestampIncoming(bool),
    TimestampOutgoing(bool),
    ZeroCopy(bool),
}

/// Configuration of a stream socket.
#[derive(Debug, Clone)]
pub struct StreamSocketOptions {
    /// Write-queue low watermark: once the queue drains to this size after
    /// breaching the high watermark, a low-watermark event is announced.
    pub write_queue_low_watermark: usize,

    /// Write-queue high watermark: a send that would fill the queue past
    /// this size fails with `QueueFull`.
    pub write_queue_high_watermark: usize,

    /// Read-queue low watermark: minimum fill level announced to readers.
    pub read_queue_low_watermark: usize,

    /// Read-queue high watermark: filling past this size pauses reading
    /// from the socket until the queue drains.
    pub read_queue_high_watermark: usize,

    /// Smallest per-call read size advised by the AIMD controller.
    pub min_incoming_transfer_size: usize,

    /// Largest per-call read size advised by the AIMD controller.
    pub max_incoming_transfer_size: usize,

    /// Largest number of buffers batched into one gather write.
    pub max_batch_buffers: usize,

    /// Largest number of bytes batched into one gather write.
    pub max_batch_bytes: usize,

    /// Sends at least this large opt into the zero-copy transmission path,
    /// when the handle supports it. `None` disables zero-copy.
    pub zero_copy_threshold: Option<usize>,

    /// Record an outgoing timestamp per send and deliver it through the
    /// reactor's notifications.
    pub timestamp_outgoing: bool,

    /// Enable TCP keep-alive probes.
    pub keep_alive: bool,

    /// Disable Nagle's algorithm.
    pub no_delay: bool,

    /// Additional handle options applied when the socket opens.
    pub socket_options: Vec<SocketOption>,
}

impl Default for StreamSocketOptions {
    fn default() -> Self {
        Self {
            write_queue_low_watermark: 0,
            write_queue_high_watermark: DEFAULT_WRITE_QUEUE_HIGH_WATERMARK,
            read_queue_low_watermark: 1,
            read_queue_high_watermark: DEFAULT_READ_QUEUE_HIGH_WATERMARK,
            min_incoming_transfer_size: DEFAULT_MIN_INCOMING_TRANSFER_SIZE,
            max_incoming_transfer_size: DEFAULT_MAX_INCOMING_TRANSFER_SIZE,
            max_batch_buffers: 64,
            max_batch_bytes: 1 << 20,
            zero_copy_threshold: None,
            timestamp_outgoing: false,
            keep_alive: false,
            no_delay: true,
            socket_options: Vec::new(),
        }
    }
}

impl StreamSocketOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_write_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_queue_low_watermark = low;
        self.write_queue_high_watermark = high;
        self
    }

    #[must_use]
    pub fn with_read_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.read_queue_low_watermark = low;
        self.read_queue_high_watermark = high;
        self
    }

    #[must_use]
    pub fn with_incoming_transfer_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_incoming_transfer_size = min;
        self.max_incoming_transfer_size = max;
        self
    }

    #[must_use]
    pub fn with_zero_copy_threshold(mut self, threshold: usize) -> Self {
        self.zero_copy_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_timestamp_outgoing(mut self, enabled: bool) -> Self {
        self.timestamp_outgoing = enabled;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    #[must_use]
    pub fn with_no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    #[must_use]
    pub fn with_socket_option(mut self, option: SocketOption) -> Self {
        self.socket_options.push(option);
        self
    }
}

/// Configuration of a listener socket.
#[derive(Debug, Clone)]
pub struct ListenerSocketOptions {
    /// Backlog requested from the operating system.
    pub backlog: usize,

    /// Accept-queue low watermark, in queued connections.
    pub accept_queue_low_watermark: usize,

    /// Accept-queue high watermark: dequeuing from the OS backlog pauses
    /// once this many connections are queued.
    pub accept_queue_high_watermark: usize,

    /// Accepted connections admitted per one-second window. `None`
    /// disables throttling.
    pub accept_rate_per_second: Option<usize>,

    /// Burst size of the accept rate limiter. Defaults to the rate.
    pub accept_rate_burst: Option<usize>,

    /// Keep accepting from the backlog until it would block, instead of
    /// one connection per readiness event.
    pub accept_greedily: bool,

    /// Bind with address reuse.
    pub reuse_address: bool,

    /// Options applied to each accepted stream socket.
    pub stream_options: StreamSocketOptions,
}

impl Default for ListenerSocketOptions {
    fn default() -> Self {
        Self {
            backlog: 128,
            accept_queue_low_watermark: 1,
            accept_queue_high_watermark: 1024,
            accept_rate_per_second: None,
            accept_rate_burst: None,
            accept_greedily: true,
            reuse_address: true,
            stream_options: StreamSocketOptions::default(),
        }
    }
}

impl ListenerSocketOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    #[must_use]
    pub fn with_accept_queue_watermarks(mut self, low: usize, high: usize) -> Self {
        self.accept_queue_low_watermark = low;
        self.accept_queue_high_watermark = high;
        self
    }

    #[must_use]
    pub fn with_accept_rate(mut self, per_second: usize) -> Self {
        self.accept_rate_per_second = Some(per_second);
        self
    }

    #[must_use]
    pub fn with_accept_rate_burst(mut self, burst: usize) -> Self {
        self.accept_rate_burst = Some(burst);
        self
    }

    #[must_use]
    pub fn with_accept_greedily(mut self, greedy: bool) -> Self {
        self.accept_greedily = greedy;
        self
    }

    #[must_use]
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    #[must_use]
    pub fn with_stream_options(mut self, options: StreamSocketOptions) -> Self {
        self.stream_options = options;
        self
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Token for selective cancellation.
    pub token: Option<SendToken>,

    /// Deadline after which the pending send completes with `TimedOut`.
    pub deadline: Option<Instant>,

    /// Request the zero-copy transmission path for this send.
    pub zero_copy: bool,

    /// Enqueue even when doing so breaches the high watermark.
    pub ignore_high_watermark: bool,

    /// Tighten (or loosen) the high watermark for this one operation.
    pub effective_high_watermark: Option<usize>,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: SendToken) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_zero_copy(mut self, enabled: bool) -> Self {
        self.zero_copy = enabled;
        self
    }

    #[must_use]
    pub fn with_ignore_high_watermark(mut self, ignore: bool) -> Self {
        self.ignore_high_watermark = ignore;
        self
    }

    #[must_use]
    pub fn with_effective_high_watermark(mut self, watermark: usize) -> Self {
        self.effective_high_watermark = Some(watermark);
        self
    }
}

/// Bounds on one gather-write batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Largest number of buffers in the gather-list.
    pub max_buffers: usize,

    /// Largest number of bytes in the gather-list.
    pub max_bytes: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_buffers: 64,
            max_bytes: 1 << 20,
        }
    }
}

/// Per-receive options.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// The completion fires once at least this many bytes are queued.
    pub min_bytes: usize,

    /// Token for selective cancellation.
    pub token: Option<ReceiveToken>,

    /// Deadline after which the pending receive completes with `TimedOut`.
    pub deadline: Option<Instant>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            min_bytes: 1,
            token: None,
            deadline: None,
        }
    }
}

impl ReceiveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = min_bytes.max(1);
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: ReceiveToken) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Per-accept options.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Token for selective cancellation.
    pub token: Option<AcceptToken>,

    /// Deadline after which the pending accept completes with `TimedOut`.
    /// The deadline cancels the waiting callback, never the listener.
    pub deadline: Option<Instant>,
}

impl AcceptOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: AcceptToken) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Per-connect options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Additional attempts after the first failure. Transient errors
    /// trigger exponential backoff between attempts.
    pub retry_count: u32,

    /// Base backoff interval between attempts.
    pub retry_interval: Duration,

    /// Cap on the backoff interval.
    pub retry_interval_max: Duration,

    /// Deadline for the whole connect operation, across retries.
    pub deadline: Option<Instant>,

    /// Restrict name resolution to one address family.
    pub ip_address_type: Option<IpAddressType>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_interval: Duration::from_millis(100),
            retry_interval_max: Duration::from_secs(10),
            deadline: None,
            ip_address_type: None,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry_interval_max(mut self, max: Duration) -> Self {
        self.retry_interval_max = max;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_ip_address_type(mut self, family: IpAddressType) -> Self {
        self.ip_address_type = Some(family);
        self
    }
}

/// Per-bind options.
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    /// Bind with address reuse.
    pub reuse_address: bool,
}

impl BindOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }
}
