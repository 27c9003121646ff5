//! The engine-wide error taxonomy.
//!
//! Every operation that can fail — synchronously, before any state change,
//! or asynchronously via a [`crate::CompletionEvent`] — resolves to one of
//! these variants. [`classify_os_error`] is the single place that maps a raw
//! `std::io::Error` (or `nix::Error`) onto the taxonomy; `doio_recv` /
//! `doio_send` and the synchronous `bind`/`connect`/`listen` paths both go
//! through it so the mapping never drifts out of sync between the two.

use std::io;

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, SocketError>;

/// The taxonomy of errors a socket operation can surface, grouped the way
/// §7 of the design groups them: resource exhaustion, address-level
/// failures, connection-level failures, terminal conditions, and an
/// unclassified fallback.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Allocation failed. The engine itself never allocates lazily on the
    /// hot path, so this only ever originates from a collaborator.
    #[error("out of memory")]
    NoMemory,

    /// `ENOBUFS` / `EMFILE` / `ENFILE`: the kernel or process is out of the
    /// resources needed to complete the operation right now.
    #[error("insufficient system resources")]
    NoResources,

    /// `EACCES` on bind.
    #[error("operation not permitted")]
    NoPermission,

    /// `EADDRNOTAVAIL`.
    #[error("requested address is not available")]
    AddrNotAvailable,

    /// `EADDRINUSE`.
    #[error("address already in use")]
    AddrInUse,

    /// `EINVAL` on a second bind of an already-bound socket.
    #[error("socket is already bound")]
    AlreadyBound,

    /// `ECONNREFUSED`.
    #[error("connection refused")]
    ConnectionRefused,

    /// `ENETUNREACH`.
    #[error("network unreachable")]
    NetworkUnreachable,

    /// `EHOSTUNREACH`.
    #[error("host unreachable")]
    HostUnreachable,

    /// `ETIMEDOUT`.
    #[error("connection timed out")]
    TimedOut,

    /// TCP peer performed an orderly shutdown (zero-length read). Never
    /// latched — each queued receive that observes it gets its own event.
    #[error("end of file")]
    Eof,

    /// The request was cancelled via [`crate::SocketHandle::cancel`] before
    /// it was serviced. Takes precedence over any latched directional
    /// error.
    #[error("operation canceled")]
    Canceled,

    /// The socket handle was dropped (manager shutting down, or socket
    /// explicitly closed) while the request was still queued.
    #[error("socket closed")]
    Closed,

    /// Misuse of the public API: a second concurrent connect, `sendv` with
    /// an empty buffer list, `recv` with `minimum` exceeding the supplied
    /// region, etc.
    #[error("invalid usage: {0}")]
    InvalidArgument(&'static str),

    /// Catch-all for anything else. The classifier resolves to this
    /// uniformly rather than occasionally returning an inert "success"
    /// classification for unrecognised errors (see SPEC_FULL.md §9).
    #[error("unexpected I/O error: {0}")]
    Unexpected(#[source] io::Error),
}

impl Clone for SocketError {
    fn clone(&self) -> Self {
        match self {
            SocketError::NoMemory => SocketError::NoMemory,
            SocketError::NoResources => SocketError::NoResources,
            SocketError::NoPermission => SocketError::NoPermission,
            SocketError::AddrNotAvailable => SocketError::AddrNotAvailable,
            SocketError::AddrInUse => SocketError::AddrInUse,
            SocketError::AlreadyBound => SocketError::AlreadyBound,
            SocketError::ConnectionRefused => SocketError::ConnectionRefused,
            SocketError::NetworkUnreachable => SocketError::NetworkUnreachable,
            SocketError::HostUnreachable => SocketError::HostUnreachable,
            SocketError::TimedOut => SocketError::TimedOut,
            SocketError::Eof => SocketError::Eof,
            SocketError::Canceled => SocketError::Canceled,
            SocketError::Closed => SocketError::Closed,
            SocketError::InvalidArgument(s) => SocketError::InvalidArgument(s),
            SocketError::Unexpected(e) => {
                SocketError::Unexpected(io::Error::new(e.kind(), e.to_string()))
            }
        }
    }
}

/// A coarse grouping of [`SocketError`], useful to callers that want to
/// react to a category of failure without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resource,
    Address,
    Connection,
    Terminal,
    Usage,
    Unexpected,
}

impl SocketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SocketError::NoMemory | SocketError::NoResources => ErrorKind::Resource,
            SocketError::NoPermission
            | SocketError::AddrNotAvailable
            | SocketError::AddrInUse
            | SocketError::AlreadyBound => ErrorKind::Address,
            SocketError::ConnectionRefused
            | SocketError::NetworkUnreachable
            | SocketError::HostUnreachable
            | SocketError::TimedOut => ErrorKind::Connection,
            SocketError::Eof | SocketError::Canceled | SocketError::Closed => ErrorKind::Terminal,
            SocketError::InvalidArgument(_) => ErrorKind::Usage,
            SocketError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether a syscall failure classified as this error should be
    /// retried later (soft) rather than surfaced as a terminal completion.
    ///
    /// This mirrors `doio_recv`/`doio_send`'s `SOFT` classification: it is
    /// computed directly from the originating `io::ErrorKind`, not stored
    /// on `SocketError` itself, because "soft" is a property of the
    /// syscall outcome, not of the taxonomy.
    pub fn is_soft(raw: &io::Error) -> bool {
        matches!(
            raw.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}

/// Maps a raw `std::io::Error` from a socket syscall onto the taxonomy.
///
/// `connected` indicates whether the socket this error came from has a
/// fixed peer (a TCP connection, or a UDP socket that called `connect`):
/// per §4.2, the connection-level errors below only apply to connected
/// sockets. On an unconnected UDP socket the same raw errors are treated
/// as transient and mapped to `Unexpected` so the caller's soft-retry path
/// (driven by `is_soft`) decides what happens, matching the "UDP does not
/// latch" rule in §7.
pub fn classify_os_error(raw: io::Error, connected: bool) -> SocketError {
    let Some(errno) = raw.raw_os_error() else {
        return SocketError::Unexpected(raw);
    };

    match errno {
        libc::ENOBUFS => SocketError::NoResources,
        libc::EMFILE | libc::ENFILE => SocketError::NoResources,
        libc::EACCES => SocketError::NoPermission,
        libc::EADDRNOTAVAIL => SocketError::AddrNotAvailable,
        libc::EADDRINUSE => SocketError::AddrInUse,
        libc::EINVAL => SocketError::AlreadyBound,
        libc::ECONNREFUSED if connected => SocketError::ConnectionRefused,
        libc::ENETUNREACH if connected => SocketError::NetworkUnreachable,
        libc::EHOSTUNREACH if connected => SocketError::HostUnreachable,
        libc::ETIMEDOUT if connected => SocketError::TimedOut,
        // errno == 0 is treated defensively, as a buggy-kernel signal
        // rather than a crash: it is not a recognised taxonomy member, so
        // it falls into Unexpected like any other unclassified error.
        _ => SocketError::Unexpected(raw),
    }
}

impl From<nix::Error> for SocketError {
    fn from(err: nix::Error) -> Self {
        classify_os_error(io::Error::from(err), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_err(errno: i32) -> io::Error {
        io::Error::from_raw_os_error(errno)
    }

    #[test]
    fn address_errors_classify_regardless_of_connection_state() {
        assert!(matches!(
            classify_os_error(os_err(libc::EADDRINUSE), false),
            SocketError::AddrInUse
        ));
        assert!(matches!(
            classify_os_error(os_err(libc::EADDRNOTAVAIL), true),
            SocketError::AddrNotAvailable
        ));
    }

    #[test]
    fn connection_errors_require_a_connected_socket() {
        assert!(matches!(
            classify_os_error(os_err(libc::ECONNREFUSED), true),
            SocketError::ConnectionRefused
        ));
        // On an unconnected UDP socket the same errno is not a terminal
        // connection failure; it falls through to Unexpected so the
        // soft-retry path decides what happens instead of latching.
        assert!(matches!(
            classify_os_error(os_err(libc::ECONNREFUSED), false),
            SocketError::Unexpected(_)
        ));
    }

    #[test]
    fn einval_classifies_as_already_bound() {
        assert!(matches!(
            classify_os_error(os_err(libc::EINVAL), false),
            SocketError::AlreadyBound
        ));
    }

    #[test]
    fn unclassified_errno_falls_back_to_unexpected() {
        assert!(matches!(
            classify_os_error(os_err(libc::EBADMSG), true),
            SocketError::Unexpected(_)
        ));
    }

    #[test]
    fn errno_zero_falls_back_to_unexpected() {
        let err = io::Error::new(io::ErrorKind::Other, "no errno");
        assert!(err.raw_os_error().is_none());
        assert!(matches!(
            classify_os_error(err, true),
            SocketError::Unexpected(_)
        ));
    }

    #[test]
    fn is_soft_matches_would_block_and_interrupted_only() {
        assert!(SocketError::is_soft(&io::Error::from(
            io::ErrorKind::WouldBlock
        )));
        assert!(SocketError::is_soft(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!SocketError::is_soft(&os_err(libc::ECONNREFUSED)));
    }

    #[test]
    fn error_kind_grouping_matches_taxonomy() {
        assert_eq!(SocketError::NoResources.kind(), ErrorKind::Resource);
        assert_eq!(SocketError::AddrInUse.kind(), ErrorKind::Address);
        assert_eq!(SocketError::TimedOut.kind(), ErrorKind::Connection);
        assert_eq!(SocketError::Eof.kind(), ErrorKind::Terminal);
        assert_eq!(
            SocketError::InvalidArgument("bad").kind(),
            ErrorKind::Usage
        );
    }
}
