//! Small state machines governing flow control, shutdown, and reactor
//! detachment.
//!
//! Every transition method returns whether the transition actually
//! happened, so callers perform the associated side effect exactly once.

/// Direction selector for shutdown and flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
    Both,
}

impl Direction {
    #[inline]
    #[must_use]
    pub const fn includes_send(&self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    #[inline]
    #[must_use]
    pub const fn includes_receive(&self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

/// How aggressively flow control is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// Let in-flight work complete.
    Gentle,
    /// Purge in-flight work in the affected direction.
    Immediate,
}

/// Which directions transitioned during a flow-control operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlChange {
    pub send: bool,
    pub receive: bool,
}

/// Tracks which directions are relaxed (flowing) vs applied (paused).
///
/// Both directions start relaxed.
#[derive(Debug, Clone)]
pub struct FlowControlState {
    send_relaxed: bool,
    recv_relaxed: bool,
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControlState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            send_relaxed: true,
            recv_relaxed: true,
        }
    }

    /// Pause the given direction(s). Returns which directions actually
    /// transitioned from relaxed to applied.
    pub fn apply(&mut self, direction: Direction) -> FlowControlChange {
        let mut change = FlowControlChange::default();
        if direction.includes_send() && self.send_relaxed {
            self.send_relaxed = false;
            change.send = true;
        }
        if direction.includes_receive() && self.recv_relaxed {
            self.recv_relaxed = false;
            change.receive = true;
        }
        change
    }

    /// Resume the given direction(s). Returns which directions actually
    /// transitioned from applied to relaxed.
    pub fn relax(&mut self, direction: Direction) -> FlowControlChange {
        let mut change = FlowControlChange::default();
        if direction.includes_send() && !self.send_relaxed {
            self.send_relaxed = true;
            change.send = true;
        }
        if direction.includes_receive() && !self.recv_relaxed {
            self.recv_relaxed = true;
            change.receive = true;
        }
        change
    }

    #[inline]
    #[must_use]
    pub const fn send_relaxed(&self) -> bool {
        self.send_relaxed
    }

    #[inline]
    #[must_use]
    pub const fn recv_relaxed(&self) -> bool {
        self.recv_relaxed
    }
}

/// Who initiated the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// A local call to `shutdown` or `close`.
    Source,
    /// The peer shut down its sending side.
    Remote,
}

/// Monotonic progression through the shutdown sequence.
///
/// `Open -> Initiated -> {send closed, receive closed} -> Complete`.
/// The origin is recorded at the first transition and never changes.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    origin: Option<ShutdownOrigin>,
    send_closed: bool,
    recv_closed: bool,
    completed: bool,
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            origin: None,
            send_closed: false,
            recv_closed: false,
            completed: false,
        }
    }

    /// Record the origin and enter the initiated phase. Returns true on
    /// the first call only.
    pub fn try_initiate(&mut self, origin: ShutdownOrigin) -> bool {
        if self.origin.is_some() {
            return false;
        }
        self.origin = Some(origin);
        true
    }

    /// Grant closing the send direction. Returns true on the first call
    /// after initiation only.
    pub fn try_shutdown_send(&mut self) -> bool {
        if self.origin.is_none() || self.send_closed {
            return false;
        }
        self.send_closed = true;
        true
    }

    /// Grant closing the receive direction. Returns true on the first call
    /// after initiation only.
    pub fn try_shutdown_receive(&mut self) -> bool {
        if self.origin.is_none() || self.recv_closed {
            return false;
        }
        self.recv_closed = true;
        true
    }

    /// Grant completion once both directions have closed. Returns true
    /// exactly once.
    pub fn try_complete(&mut self) -> bool {
        if self.completed || !self.send_closed || !self.recv_closed {
            return false;
        }
        self.completed = true;
        true
    }

    #[inline]
    #[must_use]
    pub const fn origin(&self) -> Option<ShutdownOrigin> {
        self.origin
    }

    #[inline]
    #[must_use]
    pub const fn is_initiated(&self) -> bool {
        self.origin.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn is_send_closed(&self) -> bool {
        self.send_closed
    }

    #[inline]
    #[must_use]
    pub const fn is_recv_closed(&self) -> bool {
        self.recv_closed
    }

    #[inline]
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }
}

/// Progression of a socket's registration with its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    Attached,
    Detaching,
    Detached,
}

impl DetachState {
    /// Begin detaching. Returns true when the request should be sent to
    /// the reactor.
    pub fn try_begin_detach(&mut self) -> bool {
        if *self == Self::Attached {
            *self = Self::Detaching;
            true
        } else {
            false
        }
    }

    /// Record the reactor's confirmation. Returns true on the
    /// detaching-to-detached transition only.
    pub fn complete_detach(&mut self) -> bool {
        if *self == Self::Detaching {
            *self = Self::Detached;
            true
        } else {
            false
        }
    }

    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        *self == Self::Attached
    }

    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        *self == Self::Detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_transitions_once() {
        let mut state = FlowControlState::new();
        assert!(state.send_relaxed() && state.recv_relaxed());

        let change = state.apply(Direction::Send);
        assert!(change.send && !change.receive);

        // applying again is a no-op
        let change = state.apply(Direction::Both);
        assert!(!change.send && change.receive);

        let change = state.relax(Direction::Both);
        assert!(change.send && change.receive);
        assert!(state.send_relaxed() && state.recv_relaxed());
    }

    #[test]
    fn shutdown_is_monotonic() {
        let mut state = ShutdownState::new();
        assert!(!state.try_shutdown_send());
        assert!(!state.try_complete());

        assert!(state.try_initiate(ShutdownOrigin::Source));
        assert!(!state.try_initiate(ShutdownOrigin::Remote));
        assert_eq!(state.origin(), Some(ShutdownOrigin::Source));

        assert!(state.try_shutdown_send());
        assert!(!state.try_shutdown_send());
        assert!(!state.try_complete());

        assert!(state.try_shutdown_receive());
        assert!(state.try_complete());
        assert!(!state.try_complete());
        assert!(state.is_completed());
    }

    #[test]
    fn remote_origin_is_recorded() {
        let mut state = ShutdownState::new();
        assert!(state.try_initiate(ShutdownOrigin::Remote));
        assert_eq!(state.origin(), Some(ShutdownOrigin::Remote));
    }

    #[test]
    fn detach_progression() {
        let mut state = DetachState::Attached;
        assert!(!state.complete_detach());
        assert!(state.try_begin_detach());
        assert!(!state.try_begin_detach());
        assert!(state.complete_detach());
        assert!(!state.complete_detach());
        assert!(state.is_detached());
    }

    #[test]
    fn direction_selectors() {
        assert!(Direction::Both.includes_send());
        assert!(Direction::Both.includes_receive());
        assert!(Direction::Send.includes_send());
        assert!(!Direction::Send.includes_receive());
    }
}
