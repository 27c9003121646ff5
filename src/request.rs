//! Queued request and completion event types.
//!
//! A request is a queued asynchronous operation carrying everything needed
//! to resume and eventually complete it: the owning task, per-operation
//! state (buffers, transferred count, minimum, address, ancillary-data
//! flags) and a completion event built when it is serviced. Ownership in
//! this crate is expressed directly through Rust values rather than the
//! original's `ATTACHED` bit: a queued request simply *holds* its
//! `Arc<TaskHandle>` and (transitively, via the queue living inside the
//! socket) its `Arc<Socket>`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::ByteSource;
use crate::error::SocketError;
use crate::socket::SocketHandle;
use crate::task::TaskHandle;

/// IPv6 packet-info ancillary data: the interface a datagram arrived on,
/// or the interface a send should originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub interface_index: u32,
    pub local_addr: std::net::Ipv6Addr,
}

/// A kernel receive timestamp, converted from `tv_sec`/`tv_usec` into
/// (seconds, nanoseconds) per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: u32,
}

/// Attribute flags carried by a completion event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionAttrs {
    bits: u8,
}

impl CompletionAttrs {
    pub const PKTINFO: CompletionAttrs = CompletionAttrs { bits: 0b0000_0001 };
    pub const TIMESTAMP: CompletionAttrs = CompletionAttrs { bits: 0b0000_0010 };
    pub const TRUNC: CompletionAttrs = CompletionAttrs { bits: 0b0000_0100 };
    pub const CTRUNC: CompletionAttrs = CompletionAttrs { bits: 0b0000_1000 };
    pub const FATAL_ERROR: CompletionAttrs = CompletionAttrs { bits: 0b0001_0000 };

    pub const NONE: CompletionAttrs = CompletionAttrs { bits: 0 };

    pub fn contains(self, other: CompletionAttrs) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn insert(&mut self, other: CompletionAttrs) {
        self.bits |= other.bits;
    }
}

impl std::ops::BitOr for CompletionAttrs {
    type Output = CompletionAttrs;
    fn bitor(self, rhs: CompletionAttrs) -> CompletionAttrs {
        CompletionAttrs {
            bits: self.bits | rhs.bits,
        }
    }
}

/// The cancellation direction bitmask from §6: `cancel` takes one of these
/// (or a combination) to select which queues to drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelMask {
    bits: u8,
}

impl CancelMask {
    pub const RECV: CancelMask = CancelMask { bits: 1 };
    pub const SEND: CancelMask = CancelMask { bits: 2 };
    pub const ACCEPT: CancelMask = CancelMask { bits: 4 };
    pub const CONNECT: CancelMask = CancelMask { bits: 8 };
    pub const ALL: CancelMask = CancelMask { bits: 1 | 2 | 4 | 8 };

    pub fn contains(self, other: CancelMask) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for CancelMask {
    type Output = CancelMask;
    fn bitor(self, rhs: CancelMask) -> CancelMask {
        CancelMask {
            bits: self.bits | rhs.bits,
        }
    }
}

/// The kind of completion being reported, mirroring §6's event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RecvDone,
    SendDone,
    NewConn,
    Connect,
    RecvMark,
    SendMark,
}

/// The event delivered to the originating task bearing an operation's
/// result.
pub struct CompletionEvent {
    pub kind: EventKind,
    pub arg: u64,
    pub result: Result<(), SocketError>,
    /// Bytes transferred (send/recv only; 0 for accept/connect/mark).
    pub n: usize,
    /// Sender address for a UDP receive, or the accepted peer's address.
    pub addr: Option<SocketAddr>,
    pub pktinfo: Option<PacketInfo>,
    pub timestamp: Option<Timestamp>,
    pub attrs: CompletionAttrs,
    /// Present only on `NewConn`: the freshly accepted socket.
    pub new_socket: Option<SocketHandle>,
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("kind", &self.kind)
            .field("arg", &self.arg)
            .field("result", &self.result)
            .field("n", &self.n)
            .field("addr", &self.addr)
            .field("attrs", &self.attrs)
            .finish()
    }
}

impl CompletionEvent {
    pub(crate) fn mark(kind: EventKind, arg: u64, result: Result<(), SocketError>) -> Self {
        CompletionEvent {
            kind,
            arg,
            result,
            n: 0,
            addr: None,
            pktinfo: None,
            timestamp: None,
            attrs: CompletionAttrs::NONE,
            new_socket: None,
        }
    }

    /// Like [`Self::mark`], but for completions delivered because a
    /// directional error is latched on the socket: carries `FATAL_ERROR` so
    /// a caller can tell "this socket's direction is dead" apart from an
    /// ordinary per-request failure.
    pub(crate) fn mark_latched(kind: EventKind, arg: u64, result: Result<(), SocketError>) -> Self {
        let mut event = Self::mark(kind, arg, result);
        if event.result.is_err() {
            event.attrs.insert(CompletionAttrs::FATAL_ERROR);
        }
        event
    }
}

/// Where a receive or send operation reads/writes its bytes: either a
/// single region or an ordered list of buffers, per §4.1.
pub(crate) enum Target {
    Single(Box<dyn ByteSource + Send>),
    List(Vec<Box<dyn ByteSource + Send>>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Single(_) => f.write_str("Target::Single"),
            Target::List(bufs) => write!(f, "Target::List[{}]", bufs.len()),
        }
    }
}

impl Target {
    /// Total bytes already used (sent so far / received so far) across the
    /// whole target.
    pub(crate) fn used_len(&self) -> usize {
        match self {
            Target::Single(b) => b.used().len(),
            Target::List(list) => list.iter().map(|b| b.used().len()).sum(),
        }
    }

    /// Total writable remainder across the whole target.
    pub(crate) fn available_len(&mut self) -> usize {
        match self {
            Target::Single(b) => b.available_mut().len(),
            Target::List(list) => list.iter_mut().map(|b| b.available_mut().len()).sum(),
        }
    }
}

/// A queued receive request.
pub(crate) struct RecvRequest {
    pub task: Arc<dyn TaskHandle>,
    pub arg: u64,
    pub target: Target,
    /// Bytes already transferred across retries; the message builder
    /// resumes from here.
    pub n: usize,
    pub minimum: usize,
    /// UDP-only: whether to capture `IPV6_PKTINFO`/`SO_TIMESTAMP` ancillary
    /// data for this receive. Ignored for TCP, which carries no per-message
    /// metadata.
    pub want_metadata: bool,
}

/// A queued send request.
pub(crate) struct SendRequest {
    pub task: Arc<dyn TaskHandle>,
    pub arg: u64,
    pub target: Target,
    pub n: usize,
    /// UDP-only: per-datagram destination override (`sendto`/`sendtov`).
    pub dest: Option<SocketAddr>,
    /// UDP-only: requested source interface for `IPV6_PKTINFO`.
    pub pktinfo: Option<PacketInfo>,
}

/// A no-op queued request used to observe the head-of-line status of a
/// direction (`recvmark`/`sendmark`).
pub(crate) struct MarkRequest {
    pub task: Arc<dyn TaskHandle>,
    pub arg: u64,
    pub kind: EventKind,
}

/// An entry in a socket's receive queue.
pub(crate) enum RecvEntry {
    Recv(RecvRequest),
    Mark(MarkRequest),
}

/// An entry in a socket's send queue.
pub(crate) enum SendEntry {
    Send(SendRequest),
    Mark(MarkRequest),
}

/// A queued accept request: the task to notify plus the pre-allocated new
/// socket (allocated eagerly so `cancel` can free it without touching the
/// kernel, per §4.3).
pub(crate) struct AcceptRequest {
    pub task: Arc<dyn TaskHandle>,
    pub arg: u64,
    pub new_socket: SocketHandle,
}

/// The single outstanding connect request a socket may have.
pub(crate) struct ConnectRequest {
    pub task: Arc<dyn TaskHandle>,
    pub arg: u64,
}
