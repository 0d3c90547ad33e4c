//! transom-testkit: Conformance scenarios for transom channel managers.
//!
//! Provides the [`ChannelPairFactory`] trait and shared test scenarios that
//! every messenger/handshake stack must pass.
//!
//! # Usage
//!
//! Each stack implements `ChannelPairFactory` and runs the shared scenarios:
//!
//! ```ignore
//! use transom_testkit::{ChannelPair, ChannelPairFactory, TestError};
//!
//! struct MyFactory;
//!
//! impl ChannelPairFactory for MyFactory {
//!     type Handshake = MyHandshake;
//!
//!     async fn pair() -> Result<ChannelPair<MyHandshake>, TestError> {
//!         /* create a parent/child manager pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn queued_requests_drain_in_order() {
//!     transom_testkit::run_queue_then_drain_fifo::<MyFactory>().await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::Once;

use parking_lot::Mutex;
use serde_json::{Value, json};

use transom::{ChannelManager, ChannelState};
use transom_core::{CallArgs, CallError, Connection, Handshake, HandshakeError, Origin, WindowOf};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Pair creation failed.
    Setup(String),
    /// Handshake failed where it should have succeeded.
    Handshake(HandshakeError),
    /// Remote call failed where it should have succeeded.
    Call(CallError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Handshake(e) => write!(f, "handshake error: {e}"),
            TestError::Call(e) => write!(f, "call error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<HandshakeError> for TestError {
    fn from(e: HandshakeError) -> Self {
        TestError::Handshake(e)
    }
}

impl From<CallError> for TestError {
    fn from(e: CallError) -> Self {
        TestError::Call(e)
    }
}

/// Initialize test tracing once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// A parent/child manager pair whose windows can reach each other.
pub struct ChannelPair<H: Handshake> {
    pub parent: Arc<ChannelManager<H>>,
    pub child: Arc<ChannelManager<H>>,
    pub parent_window: WindowOf<H>,
    pub child_window: WindowOf<H>,
    pub parent_origin: Origin,
    pub child_origin: Origin,
}

/// Factory for creating manager pairs; implemented per messenger/handshake
/// stack.
///
/// Contract: connecting the parent toward `child_window` under `child_origin`
/// (and the child toward `parent_window` under `parent_origin`) must succeed,
/// while connecting toward a window under any *other* origin must fail the
/// handshake.
pub trait ChannelPairFactory: Send + Sync + 'static {
    type Handshake: Handshake;

    /// Create a fresh, not-yet-connected pair.
    fn pair() -> impl Future<Output = Result<ChannelPair<Self::Handshake>, TestError>> + Send;
}

/// Connect both sides of a pair (parent as initiator, child as responder).
pub async fn connect_both<H: Handshake>(
    pair: &ChannelPair<H>,
    params: CallArgs,
) -> Result<(Arc<H::Connection>, Arc<H::Connection>), TestError> {
    let responder = tokio::spawn({
        let child = Arc::clone(&pair.child);
        let parent_window = pair.parent_window.clone();
        let parent_origin = pair.parent_origin.clone();
        async move { child.connect_to_parent(parent_window, parent_origin).await }
    });

    let parent_conn = pair
        .parent
        .connect_to_child(pair.child_window.clone(), pair.child_origin.clone(), params)
        .await?;
    let child_conn = responder
        .await
        .map_err(|e| TestError::Setup(format!("responder task failed: {e}")))??;
    Ok((parent_conn, child_conn))
}

fn expect<T: PartialEq + std::fmt::Debug>(actual: T, wanted: T, what: &str) -> Result<(), TestError> {
    if actual == wanted {
        Ok(())
    } else {
        Err(TestError::Assertion(format!(
            "{what}: expected {wanted:?}, got {actual:?}"
        )))
    }
}

// ============================================================================
// Scenario: queue, then drain in FIFO order
// ============================================================================

/// Requests issued while disconnected drain in issue order once a connect
/// succeeds, each settling with its own outcome; requests issued afterwards
/// never touch the queue.
pub async fn run_queue_then_drain_fifo<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;

    let recorded: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    pair.child.register("record", {
        let recorded = Arc::clone(&recorded);
        move |args: CallArgs| {
            let recorded = Arc::clone(&recorded);
            async move {
                let value = args.into_iter().next().unwrap_or(Value::Null);
                recorded.lock().push(value.clone());
                Ok(value)
            }
        }
    });

    let first = pair.parent.request("record", vec![json!(1)]);
    let second = pair.parent.request("record", vec![json!(2)]);
    let third = pair.parent.request("record", vec![json!(3)]);
    expect(pair.parent.queued_requests(), 3, "queued before connect")?;

    connect_both(&pair, vec![]).await?;

    expect(first.await?, json!(1), "first queued result")?;
    expect(second.await?, json!(2), "second queued result")?;
    expect(third.await?, json!(3), "third queued result")?;
    expect(
        recorded.lock().clone(),
        vec![json!(1), json!(2), json!(3)],
        "remote observation order",
    )?;
    expect(pair.parent.queued_requests(), 0, "queue after drain")?;

    // Issued after connect: goes straight out.
    expect(
        pair.parent.request("record", vec![json!(4)]).await?,
        json!(4),
        "direct result",
    )?;
    expect(pair.parent.queued_requests(), 0, "queue after direct call")?;
    Ok(())
}

// ============================================================================
// Scenario: request before connect resolves after it
// ============================================================================

/// The ping/pong shape: a request issued before connecting resolves once the
/// connect succeeds, and the same request afterwards resolves immediately.
pub async fn run_request_before_connect<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;
    pair.child.register("ping", |_args| async { Ok(json!("pong")) });

    let early = pair.parent.request("ping", vec![]);
    expect(pair.parent.queued_requests(), 1, "queued before connect")?;

    connect_both(&pair, vec![]).await?;

    expect(early.await?, json!("pong"), "queued ping")?;
    expect(
        pair.parent.request("ping", vec![]).await?,
        json!("pong"),
        "direct ping",
    )?;
    expect(pair.parent.queued_requests(), 0, "queue after direct ping")?;
    Ok(())
}

// ============================================================================
// Scenario: a failing drained call is isolated
// ============================================================================

/// With three queued requests where the second fails remotely, the first and
/// third still settle with their own values; the drain continues past the
/// failure.
pub async fn run_failure_isolation<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;
    pair.child.register("ok", |args: CallArgs| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    });
    pair.child
        .register("boom", |_args| async { Err(CallError::Remote("boom".into())) });

    let first = pair.parent.request("ok", vec![json!("a")]);
    let second = pair.parent.request("boom", vec![]);
    let third = pair.parent.request("ok", vec![json!("c")]);

    connect_both(&pair, vec![]).await?;

    expect(first.await?, json!("a"), "first queued result")?;
    match second.await {
        Err(CallError::Remote(_)) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "second queued result: expected a remote fault, got {other:?}"
            )));
        }
    }
    expect(third.await?, json!("c"), "third queued result")?;
    Ok(())
}

// ============================================================================
// Scenario: supersede closes the prior connection
// ============================================================================

/// Connecting while already connected closes the prior connection before the
/// new handshake completes.
pub async fn run_supersede_closes_prior<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;

    let (first, _child_first) = connect_both(&pair, vec![]).await?;
    expect(first.is_closed(), false, "fresh connection closed")?;

    let (second, _child_second) = connect_both(&pair, vec![]).await?;
    expect(first.is_closed(), true, "prior connection closed on supersede")?;
    expect(second.is_closed(), false, "superseding connection closed")?;
    expect(pair.parent.is_connected(), true, "parent connected")?;
    Ok(())
}

// ============================================================================
// Scenario: registry overwrite
// ============================================================================

/// Registering the same name twice leaves only the latest handler reachable.
pub async fn run_registry_overwrite<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;
    pair.child.register("greet", |_args| async { Ok(json!("old")) });
    pair.child.register("greet", |_args| async { Ok(json!("new")) });

    connect_both(&pair, vec![]).await?;

    expect(
        pair.parent.request("greet", vec![]).await?,
        json!("new"),
        "overwritten handler",
    )?;
    Ok(())
}

// ============================================================================
// Scenario: live registration after connect
// ============================================================================

/// A method registered after the connection exists is callable without a new
/// handshake (live-by-reference registry).
pub async fn run_live_registration<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;
    connect_both(&pair, vec![]).await?;

    pair.child
        .register("late", |_args| async { Ok(json!("made it")) });

    expect(
        pair.parent.request("late", vec![]).await?,
        json!("made it"),
        "late-registered method",
    )?;
    Ok(())
}

// ============================================================================
// Scenario: disconnect resets the latch
// ============================================================================

/// Disconnecting is idempotent, never an error, and sends later requests back
/// through the queue until the next connect.
pub async fn run_disconnect_then_requeue<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;

    // Never connected: a no-op.
    pair.parent.disconnect();
    expect(pair.parent.state(), ChannelState::Disconnected, "initial state")?;

    pair.child.register("ping", |_args| async { Ok(json!("pong")) });
    connect_both(&pair, vec![]).await?;
    expect(pair.parent.state(), ChannelState::Connected, "state after connect")?;

    pair.parent.disconnect();
    pair.parent.disconnect();
    expect(
        pair.parent.state(),
        ChannelState::Disconnected,
        "state after disconnect",
    )?;

    let requeued = pair.parent.request("ping", vec![]);
    expect(pair.parent.queued_requests(), 1, "requeued after disconnect")?;

    connect_both(&pair, vec![]).await?;
    expect(requeued.await?, json!("pong"), "requeued ping")?;
    Ok(())
}

// ============================================================================
// Scenario: a rejected connect preserves the queue
// ============================================================================

/// Connecting toward a window under the wrong origin fails, leaves the queue
/// untouched, and a later correct connect drains it.
pub async fn run_rejected_connect_preserves_queue<F: ChannelPairFactory>() -> Result<(), TestError>
{
    let pair = F::pair().await?;
    pair.child.register("ping", |_args| async { Ok(json!("pong")) });

    let early = pair.parent.request("ping", vec![]);
    expect(pair.parent.queued_requests(), 1, "queued before connect")?;

    let wrong_origin = Origin::from("https://nobody.example");
    if pair
        .parent
        .connect_to_child(pair.child_window.clone(), wrong_origin, vec![])
        .await
        .is_ok()
    {
        return Err(TestError::Assertion(
            "connect under a wrong origin should fail".into(),
        ));
    }
    expect(pair.parent.queued_requests(), 1, "queue after failed connect")?;
    expect(
        pair.parent.state(),
        ChannelState::Disconnected,
        "state after failed connect",
    )?;

    connect_both(&pair, vec![]).await?;
    expect(early.await?, json!("pong"), "drained after retry")?;
    Ok(())
}

// ============================================================================
// Scenario: bidirectional calls
// ============================================================================

/// Both sides can expose methods and call each other over one channel.
pub async fn run_bidirectional_calls<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;
    pair.parent
        .register("whoami", |_args| async { Ok(json!("parent")) });
    pair.child
        .register("whoami", |_args| async { Ok(json!("child")) });

    connect_both(&pair, vec![]).await?;

    expect(
        pair.parent.request("whoami", vec![]).await?,
        json!("child"),
        "parent asking child",
    )?;
    expect(
        pair.child.request("whoami", vec![]).await?,
        json!("parent"),
        "child asking parent",
    )?;
    Ok(())
}

// ============================================================================
// Scenario: nested callback
// ============================================================================

/// The child's handler calls back into the parent while serving the parent's
/// request.
pub async fn run_nested_callback<F: ChannelPairFactory>() -> Result<(), TestError> {
    let pair = F::pair().await?;

    pair.parent
        .register("get_prefix", |_args| async { Ok(json!("PREFIX:")) });
    pair.child.register("format", {
        let child = Arc::clone(&pair.child);
        move |args: CallArgs| {
            let child = Arc::clone(&child);
            async move {
                let input = args
                    .into_iter()
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let prefix = child.request("get_prefix", vec![]).await?;
                let prefix = prefix.as_str().unwrap_or_default().to_string();
                Ok(json!(format!("{prefix}{input}")))
            }
        }
    });

    connect_both(&pair, vec![]).await?;

    expect(
        pair.parent.request("format", vec![json!("data")]).await?,
        json!("PREFIX:data"),
        "nested callback result",
    )?;
    Ok(())
}
