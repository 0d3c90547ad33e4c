//! transom: bidirectional RPC between isolated window contexts.
//!
//! A [`ChannelManager`] lets an embedding page and an embedded iframe/popup,
//! two contexts that share no memory and can only exchange serialized
//! messages, call methods on each other. It owns three tightly coupled
//! pieces:
//!
//! - the **method registry**: the callable surface this side exposes,
//!   mutable at any time (even after connecting);
//! - the **connection lifecycle**: the handshake against one remote
//!   window/origin pair, supersede-on-reconnect, and teardown;
//! - the **request queue**: outbound calls issued before the channel exists
//!   are buffered and drained exactly once, in order, when it does.
//!
//! # Quick start
//!
//! ```ignore
//! use transom::ChannelManager;
//! use transom_messenger_mem::{LocalHandshake, MemWindow};
//!
//! let page = MemWindow::new("page", "https://app.example");
//! let widget = MemWindow::new("widget", "https://widget.example");
//!
//! let manager = ChannelManager::new(LocalHandshake, page.clone());
//! manager.register("ping", |_args| async { Ok(serde_json::json!("pong")) });
//!
//! // Calls issued before the connect are queued and drained in order once
//! // the handshake succeeds.
//! let early = manager.request("remote_method", vec![]);
//! manager.connect_to_child(widget, "https://widget.example", vec![]).await?;
//! let reply = early.await?;
//! ```
//!
//! The messenger and handshake are collaborator traits defined in
//! `transom-core`; `transom-messenger-mem` is the in-process reference
//! implementation used by the examples and the conformance tests.

#![forbid(unsafe_code)]

mod manager;

pub use manager::{ChannelManager, ChannelState};

// Re-export core types so downstream code needs only this crate.
pub use transom_core::{
    CallArgs, CallError, Connection, Handshake, HandshakeError, Messenger, MethodHandler,
    MethodTable, Origin, RemoteHandle, Role, WindowOf, handler,
};
