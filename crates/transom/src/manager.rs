//! ChannelManager: registry, connection lifecycle, and request queue.
//!
//! The manager owns a single mutable link (connection + remote handle) and a
//! FIFO queue of requests issued while no link exists. The three rules that
//! matter:
//!
//! - The link fields are written only by a successful connect and cleared
//!   only by disconnect.
//! - The queue is emptied under the same lock acquisition that sets the link
//!   fields, so a request can never be enqueued after the link exists and can
//!   never bypass the queue before it does.
//! - Each drained request settles its caller exactly once; a failed call
//!   settles as a failure and the drain continues.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use transom_core::{
    CallArgs, CallError, Connection, Handshake, HandshakeError, Messenger, MethodHandler,
    MethodTable, Origin, RemoteHandle, Role, WindowOf,
};

const DEFAULT_MAX_QUEUED: usize = 8192;

fn max_queued() -> usize {
    std::env::var("TRANSOM_MAX_QUEUED")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_QUEUED)
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No connection and no connect in flight.
    #[default]
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// A connection is established.
    Connected,
}

type HandleOf<H> = <<H as Handshake>::Connection as Connection>::Handle;

/// A buffered outbound call awaiting a connection.
struct PendingRequest {
    method: String,
    args: CallArgs,
    reply: oneshot::Sender<Result<Value, CallError>>,
}

struct Link<C: Connection> {
    connection: Option<Arc<C>>,
    remote: Option<C::Handle>,
    connecting: bool,
    queued: VecDeque<PendingRequest>,
}

impl<C: Connection> Default for Link<C> {
    fn default() -> Self {
        Self {
            connection: None,
            remote: None,
            connecting: false,
            queued: VecDeque::new(),
        }
    }
}

/// How a request was issued at call time.
enum Issued<R> {
    Direct { remote: R, args: CallArgs },
    Queued(oneshot::Receiver<Result<Value, CallError>>),
    Rejected(CallError),
}

struct ManagerInner<H: Handshake> {
    handshake: H,
    local_window: WindowOf<H>,
    methods: MethodTable,
    link: Mutex<Link<H::Connection>>,
    connect_epoch: AtomicU64,
    max_queued: usize,
}

/// Manages one bidirectional RPC channel to a remote window context.
///
/// At most one connection is live at a time; a new connect call supersedes
/// the prior connection. Dropping the manager tears the channel down and
/// settles any still-queued requests as [`CallError::TornDown`].
pub struct ChannelManager<H: Handshake> {
    inner: Arc<ManagerInner<H>>,
}

impl<H: Handshake> ChannelManager<H> {
    /// Create a manager for the given local window context.
    ///
    /// The pending-queue bound defaults to 8192 and can be overridden with
    /// the `TRANSOM_MAX_QUEUED` environment variable.
    pub fn new(handshake: H, local_window: WindowOf<H>) -> Self {
        Self::with_max_queued(handshake, local_window, max_queued())
    }

    /// Create a manager with an explicit pending-queue bound.
    pub fn with_max_queued(handshake: H, local_window: WindowOf<H>, max_queued: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                handshake,
                local_window,
                methods: MethodTable::new(),
                link: Mutex::new(Link::default()),
                connect_epoch: AtomicU64::new(0),
                max_queued,
            }),
        }
    }

    // ========================================================================
    // Method registry
    // ========================================================================

    /// Expose `method` to the remote side. Last write wins.
    ///
    /// The registry is shared live-by-reference with the handshake
    /// collaborator: if a connection already exists, the new handler is
    /// immediately callable by the peer; otherwise it becomes visible with
    /// the next handshake.
    pub fn register<F, Fut>(&self, method: impl Into<String>, f: F)
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.inner.methods.register(method, f);
    }

    /// Bulk-register handlers, key by key, with overwrite semantics.
    pub fn register_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, MethodHandler)>,
    {
        self.inner.methods.register_all(entries);
    }

    /// Stop exposing `method`. Idempotent; unknown names are ignored.
    pub fn unregister(&self, method: &str) {
        self.inner.methods.unregister(method);
    }

    /// The live method table shared with the handshake collaborator.
    pub fn methods(&self) -> MethodTable {
        self.inner.methods.clone()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect toward an embedded child window (initiator role).
    ///
    /// Any existing connection is closed first. `params` are forwarded to the
    /// handshake collaborator for the peer to inspect.
    pub async fn connect_to_child(
        &self,
        remote_window: WindowOf<H>,
        remote_origin: impl Into<Origin>,
        params: CallArgs,
    ) -> Result<Arc<H::Connection>, HandshakeError> {
        self.inner
            .connect(Role::Initiator, remote_window, remote_origin.into(), params)
            .await
    }

    /// Connect toward the embedding parent window (responder role).
    ///
    /// Any existing connection is closed first.
    pub async fn connect_to_parent(
        &self,
        remote_window: WindowOf<H>,
        remote_origin: impl Into<Origin>,
    ) -> Result<Arc<H::Connection>, HandshakeError> {
        self.inner
            .connect(
                Role::Responder,
                remote_window,
                remote_origin.into(),
                CallArgs::new(),
            )
            .await
    }

    /// Close the current connection, if any. Idempotent.
    ///
    /// The method registry and any queued requests are untouched; requests
    /// issued after this call queue up again until the next connect.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Teardown hook for host lifecycles; equivalent to [`disconnect`](Self::disconnect).
    pub fn shutdown(&self) {
        self.inner.disconnect();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ChannelState::Connected)
    }

    /// Number of requests waiting for a connection (diagnostics).
    pub fn queued_requests(&self) -> usize {
        self.inner.link.lock().queued.len()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Invoke `method` on the remote side.
    ///
    /// If a connection exists the call goes straight to the remote handle and
    /// the outcome mirrors the remote call's own outcome. Otherwise the
    /// request is queued **at call time** (not when the returned future is
    /// first polled) and settles once a connect succeeds and the queue
    /// drains. Dropping the returned future abandons the caller's interest
    /// but does not stop an in-flight call or the drain.
    pub fn request(
        &self,
        method: impl Into<String>,
        args: CallArgs,
    ) -> impl Future<Output = Result<Value, CallError>> + Send + 'static {
        let method = method.into();
        let issued = self.inner.issue(&method, args);
        async move {
            match issued {
                Issued::Direct { remote, args } => remote.call(&method, args).await,
                Issued::Queued(settled) => settled.await.unwrap_or(Err(CallError::TornDown)),
                Issued::Rejected(error) => Err(error),
            }
        }
    }
}

impl<H: Handshake> Drop for ChannelManager<H> {
    fn drop(&mut self) {
        self.inner.disconnect();
        let queued = std::mem::take(&mut self.inner.link.lock().queued);
        if !queued.is_empty() {
            tracing::debug!(queued = queued.len(), "torn down with queued requests");
        }
        for pending in queued {
            let _ = pending.reply.send(Err(CallError::TornDown));
        }
    }
}

impl<H: Handshake> ManagerInner<H> {
    fn state(&self) -> ChannelState {
        let link = self.link.lock();
        if link.connection.is_some() {
            ChannelState::Connected
        } else if link.connecting {
            ChannelState::Connecting
        } else {
            ChannelState::Disconnected
        }
    }

    fn disconnect(&self) {
        let connection = {
            let mut link = self.link.lock();
            link.remote = None;
            link.connection.take()
        };
        if let Some(connection) = connection {
            tracing::debug!("disconnecting");
            connection.close();
        }
    }

    async fn connect(
        &self,
        role: Role,
        remote_window: WindowOf<H>,
        remote_origin: Origin,
        params: CallArgs,
    ) -> Result<Arc<H::Connection>, HandshakeError> {
        // Supersede: at most one live connection per manager.
        self.disconnect();

        let epoch = self.connect_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.link.lock().connecting = true;

        let messenger =
            <H::Messenger as Messenger>::bind(&self.local_window, &remote_window, remote_origin.clone());
        tracing::debug!(origin = %remote_origin, ?role, "handshake started");

        let outcome = self
            .handshake
            .handshake(role, messenger, self.methods.clone(), params)
            .await;

        let connection = match outcome {
            Ok(connection) => connection,
            Err(error) => {
                {
                    let mut link = self.link.lock();
                    if self.connect_epoch.load(Ordering::Acquire) == epoch {
                        link.connecting = false;
                    }
                }
                tracing::warn!(
                    origin = %remote_origin,
                    %error,
                    "handshake failed; queued requests preserved"
                );
                return Err(error);
            }
        };

        let (connection, remote, drained) = {
            let mut link = self.link.lock();
            if self.connect_epoch.load(Ordering::Acquire) != epoch {
                // A newer connect superseded this attempt while it was in
                // flight; it must not clobber the newer link.
                drop(link);
                connection.close();
                return Err(HandshakeError::Superseded);
            }
            let connection = Arc::new(connection);
            let remote = connection.remote_handle();
            link.connection = Some(Arc::clone(&connection));
            link.remote = Some(remote.clone());
            link.connecting = false;
            let drained = std::mem::take(&mut link.queued);
            (connection, remote, drained)
        };

        tracing::debug!(origin = %remote_origin, queued = drained.len(), "connected; draining queue");
        for pending in drained {
            let result = remote.call(&pending.method, pending.args).await;
            if let Err(error) = &result {
                tracing::debug!(method = %pending.method, %error, "queued request failed during drain");
            }
            // The caller may have dropped its future; nothing left to settle then.
            let _ = pending.reply.send(result);
        }

        Ok(connection)
    }

    fn issue(&self, method: &str, args: CallArgs) -> Issued<HandleOf<H>> {
        let mut link = self.link.lock();
        if let Some(remote) = link.remote.clone() {
            return Issued::Direct { remote, args };
        }
        if link.queued.len() >= self.max_queued {
            tracing::warn!(
                method,
                queued = link.queued.len(),
                max_queued = self.max_queued,
                "request queue full; refusing call"
            );
            return Issued::Rejected(CallError::QueueFull);
        }
        let (reply, settled) = oneshot::channel();
        link.queued.push_back(PendingRequest {
            method: method.to_string(),
            args,
            reply,
        });
        tracing::debug!(method, queued = link.queued.len(), "request queued until connect");
        Issued::Queued(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct StubWindow;

    struct StubMessenger;

    impl Messenger for StubMessenger {
        type Window = StubWindow;

        fn bind(_local: &StubWindow, _remote: &StubWindow, _remote_origin: Origin) -> Self {
            Self
        }
    }

    type CallLog = Arc<Mutex<Vec<(String, CallArgs)>>>;

    #[derive(Clone, Debug)]
    struct StubHandle {
        log: CallLog,
        fail_method: Option<String>,
    }

    impl RemoteHandle for StubHandle {
        fn call(
            &self,
            method: &str,
            args: CallArgs,
        ) -> impl Future<Output = Result<Value, CallError>> + Send {
            let log = Arc::clone(&self.log);
            let fail_method = self.fail_method.clone();
            let method = method.to_string();
            async move {
                log.lock().push((method.clone(), args.clone()));
                if fail_method.as_deref() == Some(method.as_str()) {
                    Err(CallError::Remote("stub failure".into()))
                } else {
                    Ok(json!({ "echo": method, "args": args }))
                }
            }
        }
    }

    #[derive(Debug)]
    struct StubConnection {
        handle: StubHandle,
        closed: Arc<AtomicBool>,
    }

    impl Connection for StubConnection {
        type Handle = StubHandle;

        fn remote_handle(&self) -> StubHandle {
            self.handle.clone()
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    /// Handshake double: hands out stub connections, optionally failing the
    /// first `fail_next` attempts or gating completion on a notify.
    struct StubHandshake {
        log: CallLog,
        fail_method: Option<String>,
        fail_next: AtomicUsize,
        gate: Option<Arc<Notify>>,
        connections: Mutex<Vec<Arc<AtomicBool>>>,
        tables: Mutex<Vec<MethodTable>>,
    }

    impl StubHandshake {
        fn new(log: &CallLog) -> Self {
            Self {
                log: Arc::clone(log),
                fail_method: None,
                fail_next: AtomicUsize::new(0),
                gate: None,
                connections: Mutex::new(Vec::new()),
                tables: Mutex::new(Vec::new()),
            }
        }

        fn failing_first(log: &CallLog, attempts: usize) -> Self {
            let mut stub = Self::new(log);
            stub.fail_next = AtomicUsize::new(attempts);
            stub
        }

        fn failing_method(log: &CallLog, method: &str) -> Self {
            let mut stub = Self::new(log);
            stub.fail_method = Some(method.to_string());
            stub
        }

        fn gated(log: &CallLog, gate: &Arc<Notify>) -> Self {
            let mut stub = Self::new(log);
            stub.gate = Some(Arc::clone(gate));
            stub
        }
    }

    impl Handshake for StubHandshake {
        type Messenger = StubMessenger;
        type Connection = StubConnection;

        fn handshake(
            &self,
            _role: Role,
            _messenger: StubMessenger,
            methods: MethodTable,
            _params: CallArgs,
        ) -> impl Future<Output = Result<StubConnection, HandshakeError>> + Send {
            async move {
                self.tables.lock().push(methods);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.fail_next.load(Ordering::Acquire) > 0 {
                    self.fail_next.fetch_sub(1, Ordering::AcqRel);
                    return Err(HandshakeError::Refused("stub refusal".into()));
                }
                let closed = Arc::new(AtomicBool::new(false));
                self.connections.lock().push(Arc::clone(&closed));
                Ok(StubConnection {
                    handle: StubHandle {
                        log: Arc::clone(&self.log),
                        fail_method: self.fail_method.clone(),
                    },
                    closed,
                })
            }
        }
    }

    fn call_order(log: &CallLog) -> Vec<String> {
        log.lock().iter().map(|(method, _)| method.clone()).collect()
    }

    #[tokio::test]
    async fn queued_requests_drain_in_order() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        let first = manager.request("one", vec![json!(1)]);
        let second = manager.request("two", vec![json!(2)]);
        let third = manager.request("three", vec![json!(3)]);
        assert_eq!(manager.queued_requests(), 3);

        manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        let third = third.await.unwrap();
        assert_eq!(first["echo"], json!("one"));
        assert_eq!(second["echo"], json!("two"));
        assert_eq!(third["echo"], json!("three"));

        assert_eq!(call_order(&log), ["one", "two", "three"]);
        assert_eq!(manager.queued_requests(), 0);
    }

    #[tokio::test]
    async fn requests_after_connect_bypass_the_queue() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        manager
            .connect_to_child(StubWindow, "https://child.example", vec![])
            .await
            .unwrap();

        let reply = manager.request("direct", vec![json!("x")]).await.unwrap();
        assert_eq!(reply["echo"], json!("direct"));
        assert_eq!(manager.queued_requests(), 0);
    }

    #[tokio::test]
    async fn handshake_failure_preserves_queued_requests() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::failing_first(&log, 1), StubWindow);

        let early = manager.request("early", vec![]);
        assert_eq!(manager.queued_requests(), 1);

        let error = manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap_err();
        assert!(matches!(error, HandshakeError::Refused(_)));
        assert_eq!(manager.state(), ChannelState::Disconnected);
        assert_eq!(manager.queued_requests(), 1);

        // The retry drains what the failed attempt left untouched.
        manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();
        let reply = early.await.unwrap();
        assert_eq!(reply["echo"], json!("early"));
    }

    #[tokio::test]
    async fn reconnect_closes_the_prior_connection_first() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        let first = manager
            .connect_to_child(StubWindow, "https://child.example", vec![])
            .await
            .unwrap();
        assert!(!first.is_closed());

        let second = manager
            .connect_to_child(StubWindow, "https://child.example", vec![])
            .await
            .unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_resets_the_latch() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        // Never connected: a no-op.
        manager.disconnect();
        assert_eq!(manager.state(), ChannelState::Disconnected);

        let connection = manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();
        manager.disconnect();
        manager.disconnect();
        assert!(connection.is_closed());
        assert_eq!(manager.state(), ChannelState::Disconnected);

        // Back to queueing.
        let _pending = manager.request("x", vec![]);
        assert_eq!(manager.queued_requests(), 1);
    }

    #[tokio::test]
    async fn drain_continues_past_a_failing_call() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::failing_method(&log, "boom"), StubWindow);

        let first = manager.request("first", vec![json!("a")]);
        let second = manager.request("boom", vec![]);
        let third = manager.request("third", vec![json!("c")]);

        manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();

        assert_eq!(first.await.unwrap()["echo"], json!("first"));
        assert!(matches!(second.await, Err(CallError::Remote(_))));
        assert_eq!(third.await.unwrap()["echo"], json!("third"));
        assert_eq!(call_order(&log), ["first", "boom", "third"]);
    }

    #[tokio::test]
    async fn queue_bound_refuses_excess_requests() {
        let log = CallLog::default();
        let manager =
            ChannelManager::with_max_queued(StubHandshake::new(&log), StubWindow, 2);

        let _first = manager.request("one", vec![]);
        let _second = manager.request("two", vec![]);
        let refused = manager.request("three", vec![]).await;
        assert_eq!(refused, Err(CallError::QueueFull));
        assert_eq!(manager.queued_requests(), 2);
    }

    #[tokio::test]
    async fn teardown_settles_queued_requests() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        let connection = manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();
        manager.disconnect();
        let pending = manager.request("stranded", vec![]);

        drop(manager);
        assert_eq!(pending.await, Err(CallError::TornDown));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn registry_is_shared_live_with_the_handshake() {
        let log = CallLog::default();
        let manager = ChannelManager::new(StubHandshake::new(&log), StubWindow);

        manager.register("before", |_args| async { Ok(Value::Null) });
        manager
            .connect_to_parent(StubWindow, "https://parent.example")
            .await
            .unwrap();
        manager.register("after", |_args| async { Ok(Value::Null) });

        let table = manager.inner.handshake.tables.lock()[0].clone();
        assert!(table.lookup("before").is_some());
        assert!(table.lookup("after").is_some(), "late registrations must be visible");

        manager.unregister("before");
        assert!(table.lookup("before").is_none());
    }

    #[tokio::test]
    async fn state_reports_connecting_while_the_handshake_runs() {
        let log = CallLog::default();
        let gate = Arc::new(Notify::new());
        let manager = Arc::new(ChannelManager::new(
            StubHandshake::gated(&log, &gate),
            StubWindow,
        ));

        let connect = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .connect_to_parent(StubWindow, "https://parent.example")
                    .await
            }
        });

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.state(), ChannelState::Connecting);

        gate.notify_one();
        connect.await.unwrap().unwrap();
        assert_eq!(manager.state(), ChannelState::Connected);
    }
}
