//! transom-messenger-mem: In-process messenger and handshake for transom.
//!
//! This is the **semantic reference** implementation of the collaborator
//! traits. Any real messenger/handshake stack (postMessage, worker ports,
//! whatever) must behave like this one; if behavior differs, the other stack
//! has a bug.
//!
//! # Characteristics
//!
//! - Window contexts are simulated as origin-tagged mailboxes
//! - Envelopes are passed through async channels (no serialization)
//! - Delivery is refused when the remote window's origin does not match the
//!   origin the binding was created with, and inbound envelopes from other
//!   origins are dropped
//! - The handshake is a hello / hello-ack exchange; the initiator resends its
//!   hello until the responder binds and answers
//!
//! # Usage
//!
//! ```ignore
//! let page = MemWindow::new("page", "https://app.example");
//! let widget = MemWindow::new("widget", "https://widget.example");
//!
//! let manager = ChannelManager::new(LocalHandshake, page.clone());
//! manager.connect_to_child(widget, "https://widget.example", vec![]).await?;
//! ```

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use transom_core::{
    CallArgs, CallError, Connection, Handshake, HandshakeError, Messenger, MethodTable, Origin,
    RemoteHandle, Role,
};

/// How often the initiator resends its hello while waiting for the ack.
const HELLO_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

fn handshake_timeout() -> Duration {
    let ms = std::env::var("TRANSOM_HANDSHAKE_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
    Duration::from_millis(ms)
}

fn call_timeout() -> Duration {
    let ms = std::env::var("TRANSOM_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
    Duration::from_millis(ms)
}

// ============================================================================
// Envelopes
// ============================================================================

/// Framed message delivered between window contexts.
#[derive(Debug, Clone)]
struct Envelope {
    from_origin: Origin,
    payload: Payload,
}

#[derive(Debug, Clone)]
enum Payload {
    /// Initiator greeting; carries negotiation params.
    Hello { params: CallArgs },
    /// Responder acknowledgement.
    HelloAck,
    /// Method invocation.
    Call {
        id: u64,
        method: String,
        args: CallArgs,
    },
    /// Reply to a call; `Err` carries the remote fault message.
    Reply {
        id: u64,
        result: Result<Value, String>,
    },
    /// Peer closed the channel.
    Bye,
}

// ============================================================================
// Windows
// ============================================================================

/// A simulated window context: an origin plus a mailbox for inbound envelopes.
#[derive(Clone)]
pub struct MemWindow {
    shared: Arc<WindowShared>,
}

struct WindowShared {
    name: String,
    origin: Origin,
    inbox: Mutex<InboxSlot>,
}

struct InboxSlot {
    tx: mpsc::UnboundedSender<Envelope>,
    /// Present until a messenger claims this inbox. A later claim (rebind)
    /// installs a fresh channel, which retires the previous claimant's
    /// receiver; that is how a superseded connection notices the window
    /// moved on.
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl MemWindow {
    pub fn new(name: impl Into<String>, origin: impl Into<Origin>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(WindowShared {
                name: name.into(),
                origin: origin.into(),
                inbox: Mutex::new(InboxSlot { tx, rx: Some(rx) }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn origin(&self) -> &Origin {
        &self.shared.origin
    }

    /// Deliver an envelope to this window's current inbox.
    fn deliver(&self, envelope: Envelope) -> bool {
        self.shared.inbox.lock().tx.send(envelope).is_ok()
    }

    /// Claim the inbox for a new messenger binding.
    ///
    /// The first claim takes the receiver that has buffered every envelope
    /// since the window was created, so nothing sent before the binding is
    /// lost.
    fn claim_inbox(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let mut slot = self.shared.inbox.lock();
        if let Some(rx) = slot.rx.take() {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slot.tx = tx;
        rx
    }
}

impl fmt::Debug for MemWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemWindow")
            .field("name", &self.shared.name)
            .field("origin", &self.shared.origin)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Messenger
// ============================================================================

/// Sending half of a binding: delivery scoped to one `(window, origin)` pair.
struct Outbound {
    local: MemWindow,
    remote: MemWindow,
    remote_origin: Origin,
}

#[derive(Debug)]
enum SendError {
    OriginMismatch { expected: Origin, found: Origin },
    WindowGone,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OriginMismatch { expected, found } => {
                write!(f, "remote origin mismatch: expected {expected}, found {found}")
            }
            Self::WindowGone => write!(f, "remote window is gone"),
        }
    }
}

impl Outbound {
    fn send(&self, payload: Payload) -> Result<(), SendError> {
        if self.remote.origin() != &self.remote_origin {
            tracing::warn!(
                expected = %self.remote_origin,
                found = %self.remote.origin(),
                "refusing delivery: origin mismatch"
            );
            return Err(SendError::OriginMismatch {
                expected: self.remote_origin.clone(),
                found: self.remote.origin().clone(),
            });
        }
        let envelope = Envelope {
            from_origin: self.local.origin().clone(),
            payload,
        };
        if self.remote.deliver(envelope) {
            Ok(())
        } else {
            Err(SendError::WindowGone)
        }
    }
}

/// Messenger bound to exactly one `(remote window, remote origin)` pair.
pub struct MemMessenger {
    out: Outbound,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Messenger for MemMessenger {
    type Window = MemWindow;

    fn bind(local: &MemWindow, remote: &MemWindow, remote_origin: Origin) -> Self {
        let rx = local.claim_inbox();
        tracing::debug!(
            local = local.name(),
            remote = remote.name(),
            origin = %remote_origin,
            "messenger bound"
        );
        Self {
            out: Outbound {
                local: local.clone(),
                remote: remote.clone(),
                remote_origin,
            },
            rx,
        }
    }
}

impl MemMessenger {
    /// Receive the next envelope from the configured remote origin.
    ///
    /// Envelopes from any other origin are dropped. Returns `None` once the
    /// inbox has been retired by a newer binding.
    async fn recv(&mut self) -> Option<Envelope> {
        while let Some(envelope) = self.rx.recv().await {
            if envelope.from_origin == self.out.remote_origin {
                return Some(envelope);
            }
            tracing::warn!(origin = %envelope.from_origin, "dropping envelope from unexpected origin");
        }
        None
    }
}

impl fmt::Debug for MemMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMessenger")
            .field("local", &self.out.local.name())
            .field("remote", &self.out.remote.name())
            .field("remote_origin", &self.out.remote_origin)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Reference handshake: a hello / hello-ack exchange over a [`MemMessenger`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHandshake;

impl Handshake for LocalHandshake {
    type Messenger = MemMessenger;
    type Connection = MemConnection;

    fn handshake(
        &self,
        role: Role,
        messenger: MemMessenger,
        methods: MethodTable,
        params: CallArgs,
    ) -> impl Future<Output = Result<MemConnection, HandshakeError>> + Send {
        async move {
            match tokio::time::timeout(handshake_timeout(), negotiate(role, messenger, params))
                .await
            {
                Ok(Ok((messenger, peer_params))) => {
                    Ok(MemConnection::establish(messenger, methods, peer_params))
                }
                Ok(Err(error)) => Err(error),
                Err(_) => Err(HandshakeError::TimedOut),
            }
        }
    }
}

async fn negotiate(
    role: Role,
    mut messenger: MemMessenger,
    params: CallArgs,
) -> Result<(MemMessenger, CallArgs), HandshakeError> {
    match role {
        Role::Initiator => {
            loop {
                match messenger.out.send(Payload::Hello {
                    params: params.clone(),
                }) {
                    Ok(()) => {}
                    Err(error @ SendError::OriginMismatch { .. }) => {
                        return Err(HandshakeError::Messenger(error.to_string()));
                    }
                    Err(SendError::WindowGone) => {
                        // The peer may be between bindings; retry after a tick.
                        tokio::time::sleep(HELLO_RETRY_INTERVAL).await;
                        continue;
                    }
                }
                match tokio::time::timeout(HELLO_RETRY_INTERVAL, messenger.recv()).await {
                    Ok(Some(envelope)) => match envelope.payload {
                        Payload::HelloAck => break,
                        // Stale frames from a superseded connection may still
                        // be in flight.
                        frame => tracing::debug!(?frame, "ignoring frame while awaiting hello ack"),
                    },
                    Ok(None) => {
                        return Err(HandshakeError::Messenger(
                            "inbox retired during handshake".into(),
                        ));
                    }
                    Err(_) => {} // no ack yet; resend the hello
                }
            }
            Ok((messenger, CallArgs::new()))
        }
        Role::Responder => {
            let peer_params = loop {
                match messenger.recv().await {
                    Some(envelope) => match envelope.payload {
                        Payload::Hello { params } => break params,
                        frame => tracing::debug!(?frame, "ignoring frame while awaiting hello"),
                    },
                    None => {
                        return Err(HandshakeError::Messenger(
                            "inbox retired during handshake".into(),
                        ));
                    }
                }
            };
            messenger
                .out
                .send(Payload::HelloAck)
                .map_err(|error| HandshakeError::Messenger(error.to_string()))?;
            Ok((messenger, peer_params))
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnShared {
    out: Outbound,
    methods: MethodTable,
    peer_params: CallArgs,
    /// Pending reply waiters: call id -> oneshot sender. Registered before a
    /// call is sent; the serve loop removes the waiter when the reply lands.
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CallError>>>>,
    next_call_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnShared {
    fn send(&self, payload: Payload) -> Result<(), SendError> {
        self.out.send(payload)
    }

    /// Mark the channel closed and fail everything still waiting for a reply.
    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, reply) in waiters {
            let _ = reply.send(Err(CallError::Closed));
        }
    }
}

/// Established channel between two window contexts.
///
/// The connection owns a serve loop that routes replies to pending waiters
/// and dispatches inbound calls against the shared [`MethodTable`]. Because
/// the table is shared live-by-reference, methods registered after
/// establishment are immediately callable by the peer.
pub struct MemConnection {
    shared: Arc<ConnShared>,
    serve: JoinHandle<()>,
}

impl MemConnection {
    fn establish(messenger: MemMessenger, methods: MethodTable, peer_params: CallArgs) -> Self {
        let MemMessenger { out, rx } = messenger;
        let shared = Arc::new(ConnShared {
            out,
            methods,
            peer_params,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let serve = tokio::spawn(serve(Arc::clone(&shared), rx));
        tracing::debug!(
            remote = shared.out.remote.name(),
            origin = %shared.out.remote_origin,
            "connection established"
        );
        Self { shared, serve }
    }

    /// Negotiation params the peer supplied in its hello (empty on the
    /// initiator side).
    pub fn peer_params(&self) -> &CallArgs {
        &self.shared.peer_params
    }
}

impl Connection for MemConnection {
    type Handle = MemRemoteHandle;

    fn remote_handle(&self) -> MemRemoteHandle {
        MemRemoteHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn close(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.send(Payload::Bye).is_err() {
            tracing::debug!("bye dropped; peer window is gone");
        }
        self.shared.mark_closed();
        self.serve.abort();
        tracing::debug!(remote = self.shared.out.remote.name(), "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemConnection")
            .field("remote", &self.shared.out.remote.name())
            .field("remote_origin", &self.shared.out.remote_origin)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Serve loop: the only consumer of the binding's inbox.
///
/// Inbound calls are dispatched on their own tasks so a slow handler cannot
/// stall reply routing.
async fn serve(shared: Arc<ConnShared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        if envelope.from_origin != shared.out.remote_origin {
            tracing::warn!(origin = %envelope.from_origin, "dropping envelope from unexpected origin");
            continue;
        }
        match envelope.payload {
            Payload::Call { id, method, args } => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let result = match shared.methods.lookup(&method) {
                        Some(handler) => handler(args).await.map_err(|e| e.to_string()),
                        None => Err(format!("method not found: {method}")),
                    };
                    if shared.send(Payload::Reply { id, result }).is_err() {
                        tracing::debug!(id, "reply dropped; peer window is gone");
                    }
                });
            }
            Payload::Reply { id, result } => {
                let waiter = shared.pending.lock().remove(&id);
                match waiter {
                    Some(reply) => {
                        let _ = reply.send(result.map_err(CallError::Remote));
                    }
                    None => tracing::debug!(id, "no waiter for reply"),
                }
            }
            Payload::Bye => {
                tracing::debug!("peer closed the channel");
                shared.mark_closed();
                break;
            }
            Payload::Hello { .. } | Payload::HelloAck => {
                tracing::debug!("ignoring handshake frame on established channel");
            }
        }
    }
    // Inbox retired (window rebound) or peer said bye: nothing further can
    // arrive, so fail whatever is still waiting.
    shared.mark_closed();
}

// ============================================================================
// Remote handle
// ============================================================================

/// Callable proxy for methods the remote side exposed.
#[derive(Clone)]
pub struct MemRemoteHandle {
    shared: Arc<ConnShared>,
}

impl RemoteHandle for MemRemoteHandle {
    fn call(
        &self,
        method: &str,
        args: CallArgs,
    ) -> impl Future<Output = Result<Value, CallError>> + Send {
        let shared = Arc::clone(&self.shared);
        let method = method.to_string();
        async move {
            if shared.closed.load(Ordering::Acquire) {
                return Err(CallError::Closed);
            }
            let id = shared.next_call_id.fetch_add(1, Ordering::Relaxed);
            let (reply, settled) = oneshot::channel();
            shared.pending.lock().insert(id, reply);

            if let Err(error) = shared.send(Payload::Call {
                id,
                method: method.clone(),
                args,
            }) {
                shared.pending.lock().remove(&id);
                tracing::debug!(id, method = %method, error = %error, "call not sent");
                return Err(CallError::Closed);
            }
            tracing::debug!(id, method = %method, "call sent");

            match tokio::time::timeout(call_timeout(), settled).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CallError::Closed),
                Err(_) => {
                    shared.pending.lock().remove(&id);
                    tracing::warn!(id, method = %method, "call timed out waiting for reply");
                    Err(CallError::TimedOut)
                }
            }
        }
    }
}

impl fmt::Debug for MemRemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRemoteHandle")
            .field("remote", &self.shared.out.remote.name())
            .finish_non_exhaustive()
    }
}
