//! transom-core: Core types and collaborator traits for the transom window channel.
//!
//! This crate defines:
//! - The method registry ([`MethodTable`], [`MethodHandler`])
//! - Collaborator traits ([`Messenger`], [`Handshake`], [`Connection`], [`RemoteHandle`])
//! - Handshake roles and origins ([`Role`], [`Origin`])
//! - Error types ([`HandshakeError`], [`CallError`])
//!
//! The channel manager itself lives in the `transom` crate; an in-process
//! reference implementation of the collaborators lives in
//! `transom-messenger-mem`.

#![forbid(unsafe_code)]

mod error;
mod handshake;
mod messenger;
mod methods;

pub use error::*;
pub use handshake::*;
pub use messenger::*;
pub use methods::*;
