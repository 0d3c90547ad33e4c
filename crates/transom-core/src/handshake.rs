//! Handshake, connection, and remote-handle collaborator traits.

use std::future::Future;

use serde_json::Value;

use crate::{CallArgs, CallError, HandshakeError, Messenger, MethodTable};

/// Which side of the negotiation this peer plays.
///
/// Connecting toward an embedded child window makes this side the initiator;
/// connecting toward the embedding parent window makes it the responder. Both
/// roles funnel into a single handshake operation so the connect logic is not
/// duplicated per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the negotiation.
    Initiator,
    /// Answers the negotiation.
    Responder,
}

/// Callable proxy for invoking methods the remote side exposed.
///
/// Handles are cheap to clone; both direct requests and queue draining go
/// through the same handle.
pub trait RemoteHandle: Clone + Send + Sync + 'static {
    /// Invoke `method` on the remote side with positional `args`.
    ///
    /// The outcome mirrors the remote call's own outcome; a failure here never
    /// affects the channel itself.
    fn call(
        &self,
        method: &str,
        args: CallArgs,
    ) -> impl Future<Output = Result<Value, CallError>> + Send;
}

/// An established channel to exactly one remote window/origin pair.
pub trait Connection: Send + Sync + 'static {
    type Handle: RemoteHandle;

    /// The callable proxy for the remote side.
    fn remote_handle(&self) -> Self::Handle;

    /// Close the channel. Idempotent, non-blocking.
    fn close(&self);

    /// Whether the channel has been closed, locally or by the peer.
    fn is_closed(&self) -> bool;
}

/// The handshake collaborator: negotiates a [`Connection`] over a messenger.
pub trait Handshake: Send + Sync + 'static {
    type Messenger: Messenger;
    type Connection: Connection;

    /// Negotiate a connection over `messenger` in the given `role`.
    ///
    /// `methods` is the live method table of the local side; the resulting
    /// connection dispatches inbound calls against it, so registrations made
    /// after establishment are immediately callable by the peer. `params`
    /// carries extra initiator-side negotiation values; responders are handed
    /// an empty list.
    fn handshake(
        &self,
        role: Role,
        messenger: Self::Messenger,
        methods: MethodTable,
        params: CallArgs,
    ) -> impl Future<Output = Result<Self::Connection, HandshakeError>> + Send;
}

/// Window type of a handshake's messenger.
pub type WindowOf<H> = <<H as Handshake>::Messenger as Messenger>::Window;
