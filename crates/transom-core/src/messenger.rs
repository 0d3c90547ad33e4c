//! Origins and the messenger collaborator trait.

use core::fmt;

/// Origin (scheme + host + port) a messenger is scoped to.
///
/// Messages are only ever delivered to, and accepted from, the exact origin a
/// binding was created with. How that restriction is enforced is the
/// messenger implementation's business.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Origin {
    fn from(origin: &str) -> Self {
        Self(origin.to_string())
    }
}

impl From<String> for Origin {
    fn from(origin: String) -> Self {
        Self(origin)
    }
}

/// Transport binding between the local window context and exactly one
/// `(remote window, remote origin)` pair.
///
/// The channel manager constructs the binding and hands it to the handshake
/// collaborator; it never sends messages through it directly. Framing,
/// serialization, and origin validation all live behind this boundary.
pub trait Messenger: Send + Sized + 'static {
    /// Handle to a window context this messenger can bind.
    type Window: Clone + Send + Sync + 'static;

    /// Bind a framed channel from `local` to exactly `(remote, remote_origin)`.
    fn bind(local: &Self::Window, remote: &Self::Window, remote_origin: Origin) -> Self;
}
