//! Error types for connect operations and remote calls.

use core::fmt;

/// Failure of a connect operation's negotiation phase.
///
/// A handshake failure never discards state: the manager returns to the
/// disconnected state with its queued requests intact, and a later connect
/// attempt may still succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The remote side refused or aborted the negotiation.
    Refused(String),
    /// The messenger failed before the negotiation completed.
    Messenger(String),
    /// A newer connect attempt replaced this one while it was in flight.
    Superseded,
    /// The negotiation did not complete in time.
    TimedOut,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(reason) => write!(f, "handshake refused: {reason}"),
            Self::Messenger(reason) => write!(f, "messenger error: {reason}"),
            Self::Superseded => write!(f, "superseded by a newer connect attempt"),
            Self::TimedOut => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Failure of a single remote call.
///
/// Call failures are local to the call that caused them: one failing call
/// never poisons the connection, the request queue, or other pending calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The remote handler failed, or the method is not exposed over there.
    Remote(String),
    /// The channel closed before a reply arrived.
    Closed,
    /// The reply did not arrive in time.
    TimedOut,
    /// The pending-request queue is at capacity.
    QueueFull,
    /// The manager was torn down while the request was still queued.
    TornDown,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(reason) => write!(f, "remote error: {reason}"),
            Self::Closed => write!(f, "channel closed"),
            Self::TimedOut => write!(f, "call timed out"),
            Self::QueueFull => write!(f, "request queue full"),
            Self::TornDown => write!(f, "channel manager torn down"),
        }
    }
}

impl std::error::Error for CallError {}
