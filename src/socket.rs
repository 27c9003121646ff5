//! The per-endpoint socket object and its public operation surface.
//!
//! A [`Socket`] is always reached through an `Arc`, aliased as
//! [`SocketHandle`]: the `Arc`'s strong count *is* the reference count from
//! §3 of the design — client handles, queued requests (each request holds
//! its own clone) and in-flight dispatch jobs (ditto) all keep it alive.
//! When the last clone drops, [`Socket`]'s `Drop` impl tears the socket
//! down exactly once, with no separate "detach" call needed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::ByteSource;
use crate::error::{Result, SocketError};
use crate::manager::ManagerInner;
use crate::request::{
    AcceptRequest, CancelMask, CompletionEvent, ConnectRequest, EventKind, MarkRequest,
    PacketInfo, RecvEntry, RecvRequest, SendEntry, SendRequest, Target,
};
use crate::task::TaskHandle;

/// The transport family of a socket. Only TCP sockets may listen; only UDP
/// sockets carry per-datagram addresses and ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Udp,
    Tcp,
}

/// A reference-counted handle to a managed socket. Every public operation
/// in §4.3 is an inherent method on [`Socket`], called through this alias.
pub type SocketHandle = Arc<Socket>;

pub(crate) struct SocketState {
    pub(crate) fd: Option<RawFd>,
    pub(crate) recv_result: Result<()>,
    pub(crate) send_result: Result<()>,
    pub(crate) recv_queue: VecDeque<RecvEntry>,
    pub(crate) send_queue: VecDeque<SendEntry>,
    pub(crate) accept_queue: VecDeque<AcceptRequest>,
    pub(crate) connect_req: Option<ConnectRequest>,
    pub(crate) pending_recv: bool,
    pub(crate) pending_send: bool,
    pub(crate) pending_accept: bool,
    pub(crate) listener: bool,
    pub(crate) connected: bool,
    pub(crate) connecting: bool,
    pub(crate) peer: Option<SocketAddr>,
}

impl SocketState {
    fn new() -> Self {
        SocketState {
            fd: None,
            recv_result: Ok(()),
            send_result: Ok(()),
            recv_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            accept_queue: VecDeque::new(),
            connect_req: None,
            pending_recv: false,
            pending_send: false,
            pending_accept: false,
            listener: false,
            connected: false,
            connecting: false,
            peer: None,
        }
    }

    /// Read-side watcher interest per §3's invariant: non-empty work,
    /// nothing already dispatched, socket still alive.
    pub(crate) fn wants_read(&self) -> bool {
        self.fd.is_some()
            && !self.pending_recv
            && !self.pending_accept
            && (!self.recv_queue.is_empty() || !self.accept_queue.is_empty())
    }

    /// Write-side watcher interest: non-empty send queue with nothing
    /// dispatched, or an in-flight connect.
    pub(crate) fn wants_write(&self) -> bool {
        self.fd.is_some()
            && ((!self.send_queue.is_empty() && !self.pending_send) || self.connecting)
    }
}

pub struct Socket {
    pub(crate) kind: SocketKind,
    pub(crate) manager: Arc<ManagerInner>,
    pub(crate) state: Mutex<SocketState>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("fd", &state.fd)
            .finish()
    }
}

impl Socket {
    pub(crate) fn new_unattached(kind: SocketKind, manager: Arc<ManagerInner>) -> SocketHandle {
        Arc::new(Socket {
            kind,
            manager,
            state: Mutex::new(SocketState::new()),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap()
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.lock().fd
    }

    /// Binds the socket's local address, setting `SO_REUSEADDR` first, per
    /// §4.3.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let fd = self.lock().fd.ok_or(SocketError::Closed)?;
        crate::io_ops::bind(fd, addr)
    }

    pub fn getsockname(&self) -> Result<SocketAddr> {
        let fd = self.lock().fd.ok_or(SocketError::Closed)?;
        crate::io_ops::getsockname(fd)
    }

    pub fn getpeername(&self) -> Result<SocketAddr> {
        self.lock().peer.ok_or(SocketError::InvalidArgument(
            "socket has no connected peer",
        ))
    }

    /// Marks this TCP socket as a listener. Backlog 0 means "system max".
    pub fn listen(&self, backlog: i32) -> Result<()> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::InvalidArgument("listen requires a TCP socket"));
        }
        let mut state = self.lock();
        if state.listener {
            return Err(SocketError::InvalidArgument("socket is already listening"));
        }
        let fd = state.fd.ok_or(SocketError::Closed)?;
        crate::io_ops::listen(fd, backlog)?;
        state.listener = true;
        Ok(())
    }

    /// Queues an accept. Always enqueues (never attempts inline) per
    /// §4.3: the new socket is allocated eagerly so a later `cancel` can
    /// discard it without ever touching the kernel.
    pub fn accept(self: &Arc<Self>, task: Arc<dyn TaskHandle>, arg: u64) -> Result<()> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::InvalidArgument("accept requires a TCP socket"));
        }
        let new_socket = Socket::new_unattached(self.kind, self.manager.clone());
        self.manager.account_created();
        let mut state = self.lock();
        if !state.listener {
            // `new_socket` drops here; its own `Drop` impl accounts for the
            // destruction since it never acquired an fd.
            return Err(SocketError::InvalidArgument("socket is not listening"));
        }
        if state.fd.is_none() {
            return Err(SocketError::Closed);
        }
        let was_empty = state.accept_queue.is_empty();
        state.accept_queue.push_back(AcceptRequest {
            task,
            arg,
            new_socket,
        });
        drop(state);
        if was_empty {
            self.manager.poke_rescan(self);
        }
        Ok(())
    }

    /// Attempts a connect inline; queues on `EINPROGRESS`/soft errors, maps
    /// and reports refusal synchronously, and reports immediate success
    /// synchronously — all per §4.3.
    pub fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.connecting || state.connected {
            return Err(SocketError::InvalidArgument(
                "socket already connecting or connected",
            ));
        }
        let fd = state.fd.ok_or(SocketError::Closed)?;
        match crate::io_ops::connect(fd, addr) {
            Ok(()) => {
                state.connected = true;
                state.peer = Some(addr);
                drop(state);
                self.manager.dispatcher.send(
                    task.as_ref(),
                    CompletionEvent::mark(EventKind::Connect, arg, Ok(())),
                );
                Ok(())
            }
            Err(SocketError::Unexpected(ref io_err)) if would_block_connect(io_err) => {
                state.connecting = true;
                state.peer = Some(addr);
                state.connect_req = Some(ConnectRequest { task, arg });
                drop(state);
                self.manager.poke_rescan(self);
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.manager.dispatcher.send(
                    task.as_ref(),
                    CompletionEvent::mark(EventKind::Connect, arg, Err(err)),
                );
                Ok(())
            }
        }
    }

    /// Queues a receive into a single buffer. `minimum` defaults (per
    /// §4.3) to the buffer's full available length for TCP, or 1 for UDP
    /// (every datagram completes its own request regardless of size).
    pub fn recv(
        self: &Arc<Self>,
        mut buf: Box<dyn ByteSource + Send>,
        minimum: Option<usize>,
        want_metadata: bool,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        let minimum = match (self.kind, minimum) {
            (SocketKind::Udp, _) => 1,
            (SocketKind::Tcp, Some(m)) => m,
            (SocketKind::Tcp, None) => buf.available_mut().len(),
        };
        self.queue_recv(RecvRequest {
            task,
            arg,
            target: Target::Single(buf),
            n: 0,
            minimum,
            want_metadata: want_metadata && self.kind == SocketKind::Udp,
        })
    }

    /// Queues a receive across an ordered list of buffers.
    pub fn recvv(
        self: &Arc<Self>,
        bufs: Vec<Box<dyn ByteSource + Send>>,
        minimum: Option<usize>,
        want_metadata: bool,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        if bufs.len() > self.manager.config.max_iov {
            return Err(SocketError::InvalidArgument(
                "recvv buffer list exceeds the configured max_iov",
            ));
        }
        let mut target = Target::List(bufs);
        let minimum = match (self.kind, minimum) {
            (SocketKind::Udp, _) => 1,
            (SocketKind::Tcp, Some(m)) => m,
            (SocketKind::Tcp, None) => target.available_len(),
        };
        self.queue_recv(RecvRequest {
            task,
            arg,
            target,
            n: 0,
            minimum,
            want_metadata: want_metadata && self.kind == SocketKind::Udp,
        })
    }

    fn queue_recv(self: &Arc<Self>, req: RecvRequest) -> Result<()> {
        let mut state = self.lock();
        if let Err(latched) = state.recv_result.clone() {
            drop(state);
            self.manager.dispatcher.send(
                req.task.as_ref(),
                CompletionEvent::mark_latched(EventKind::RecvDone, req.arg, Err(latched)),
            );
            return Ok(());
        }
        let was_empty = state.recv_queue.is_empty() && !state.pending_recv;
        state.recv_queue.push_back(RecvEntry::Recv(req));
        if was_empty {
            crate::io_ops::doio_recv(self, &mut state);
        }
        drop(state);
        if was_empty {
            self.manager.poke_rescan(self);
        }
        Ok(())
    }

    /// Queues a send of a single byte region (TCP, or UDP to the connected
    /// peer).
    pub fn send(
        self: &Arc<Self>,
        buf: Box<dyn ByteSource + Send>,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        self.queue_send(SendRequest {
            task,
            arg,
            target: Target::Single(buf),
            n: 0,
            dest: None,
            pktinfo: None,
        })
    }

    pub fn sendv(
        self: &Arc<Self>,
        bufs: Vec<Box<dyn ByteSource + Send>>,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        if bufs.is_empty() {
            return Err(SocketError::InvalidArgument("sendv requires a non-empty buffer list"));
        }
        if bufs.len() > self.manager.config.max_iov {
            return Err(SocketError::InvalidArgument(
                "sendv buffer list exceeds the configured max_iov",
            ));
        }
        self.queue_send(SendRequest {
            task,
            arg,
            target: Target::List(bufs),
            n: 0,
            dest: None,
            pktinfo: None,
        })
    }

    /// UDP-only: send to an explicit destination, optionally requesting a
    /// source interface via IPv6 packet-info.
    pub fn sendto(
        self: &Arc<Self>,
        buf: Box<dyn ByteSource + Send>,
        dest: SocketAddr,
        pktinfo: Option<PacketInfo>,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        if self.kind != SocketKind::Udp {
            return Err(SocketError::InvalidArgument("sendto requires a UDP socket"));
        }
        self.queue_send(SendRequest {
            task,
            arg,
            target: Target::Single(buf),
            n: 0,
            dest: Some(dest),
            pktinfo,
        })
    }

    pub fn sendtov(
        self: &Arc<Self>,
        bufs: Vec<Box<dyn ByteSource + Send>>,
        dest: SocketAddr,
        pktinfo: Option<PacketInfo>,
        task: Arc<dyn TaskHandle>,
        arg: u64,
    ) -> Result<()> {
        if self.kind != SocketKind::Udp {
            return Err(SocketError::InvalidArgument("sendtov requires a UDP socket"));
        }
        if bufs.is_empty() {
            return Err(SocketError::InvalidArgument(
                "sendtov requires a non-empty buffer list",
            ));
        }
        if bufs.len() > self.manager.config.max_iov {
            return Err(SocketError::InvalidArgument(
                "sendtov buffer list exceeds the configured max_iov",
            ));
        }
        self.queue_send(SendRequest {
            task,
            arg,
            target: Target::List(bufs),
            n: 0,
            dest: Some(dest),
            pktinfo,
        })
    }

    fn queue_send(self: &Arc<Self>, req: SendRequest) -> Result<()> {
        let mut state = self.lock();
        if let Err(latched) = state.send_result.clone() {
            drop(state);
            self.manager.dispatcher.send(
                req.task.as_ref(),
                CompletionEvent::mark_latched(EventKind::SendDone, req.arg, Err(latched)),
            );
            return Ok(());
        }
        let was_empty = state.send_queue.is_empty() && !state.pending_send;
        state.send_queue.push_back(SendEntry::Send(req));
        if was_empty {
            crate::io_ops::doio_send(self, &mut state);
        }
        drop(state);
        if was_empty {
            self.manager.poke_rescan(self);
        }
        Ok(())
    }

    /// Queues a no-op marker observing the head-of-line status of the
    /// receive direction.
    pub fn recvmark(self: &Arc<Self>, task: Arc<dyn TaskHandle>, arg: u64) -> Result<()> {
        let mut state = self.lock();
        let was_empty = state.recv_queue.is_empty();
        if was_empty {
            let result = state.recv_result.clone();
            drop(state);
            self.manager.dispatcher.send(
                task.as_ref(),
                CompletionEvent::mark_latched(EventKind::RecvMark, arg, result),
            );
            return Ok(());
        }
        state.recv_queue.push_back(RecvEntry::Mark(MarkRequest {
            task,
            arg,
            kind: EventKind::RecvMark,
        }));
        Ok(())
    }

    pub fn sendmark(self: &Arc<Self>, task: Arc<dyn TaskHandle>, arg: u64) -> Result<()> {
        let mut state = self.lock();
        let was_empty = state.send_queue.is_empty();
        if was_empty {
            let result = state.send_result.clone();
            drop(state);
            self.manager.dispatcher.send(
                task.as_ref(),
                CompletionEvent::mark_latched(EventKind::SendMark, arg, result),
            );
            return Ok(());
        }
        state.send_queue.push_back(SendEntry::Mark(MarkRequest {
            task,
            arg,
            kind: EventKind::SendMark,
        }));
        Ok(())
    }

    /// Cancels queued requests matching `task` (or all requests, if `task`
    /// is `None`) in the directions named by `mask`. Delivers every
    /// matching completion (with `Canceled`, superseding any latched
    /// directional error) to the dispatcher before returning, per §5.
    pub fn cancel(&self, task: Option<&dyn TaskHandle>, mask: CancelMask) {
        let mut state = self.lock();
        let matches = |candidate_id: u64| task.map_or(true, |t| t.id() == candidate_id);

        if mask.contains(CancelMask::RECV) {
            let mut remaining = VecDeque::new();
            while let Some(entry) = state.recv_queue.pop_front() {
                let (id, event) = match entry {
                    RecvEntry::Recv(r) if matches(r.task.id()) => (
                        r.task.id(),
                        Some((r.task, CompletionEvent::mark(EventKind::RecvDone, r.arg, Err(SocketError::Canceled)))),
                    ),
                    RecvEntry::Mark(m) if matches(m.task.id()) => (
                        m.task.id(),
                        Some((m.task, CompletionEvent::mark(m.kind, m.arg, Err(SocketError::Canceled)))),
                    ),
                    RecvEntry::Recv(r) => {
                        remaining.push_back(RecvEntry::Recv(r));
                        continue;
                    }
                    RecvEntry::Mark(m) => {
                        remaining.push_back(RecvEntry::Mark(m));
                        continue;
                    }
                };
                let _ = id;
                if let Some((task, event)) = event {
                    self.manager.dispatcher.send(task.as_ref(), event);
                }
            }
            state.recv_queue = remaining;
        }

        if mask.contains(CancelMask::SEND) {
            let mut remaining = VecDeque::new();
            while let Some(entry) = state.send_queue.pop_front() {
                match entry {
                    SendEntry::Send(r) if matches(r.task.id()) => {
                        let event = CompletionEvent::mark(EventKind::SendDone, r.arg, Err(SocketError::Canceled));
                        self.manager.dispatcher.send(r.task.as_ref(), event);
                    }
                    SendEntry::Mark(m) if matches(m.task.id()) => {
                        let event = CompletionEvent::mark(m.kind, m.arg, Err(SocketError::Canceled));
                        self.manager.dispatcher.send(m.task.as_ref(), event);
                    }
                    other => remaining.push_back(other),
                }
            }
            state.send_queue = remaining;
        }

        if mask.contains(CancelMask::ACCEPT) {
            let mut remaining = VecDeque::new();
            while let Some(req) = state.accept_queue.pop_front() {
                if matches(req.task.id()) {
                    // The pre-allocated new socket is simply dropped here;
                    // its own refcount accounting runs through `Drop`.
                    let event = CompletionEvent::mark(EventKind::NewConn, req.arg, Err(SocketError::Canceled));
                    self.manager.dispatcher.send(req.task.as_ref(), event);
                } else {
                    remaining.push_back(req);
                }
            }
            state.accept_queue = remaining;
        }

        if mask.contains(CancelMask::CONNECT) {
            if let Some(req) = &state.connect_req {
                if matches(req.task.id()) {
                    let req = state.connect_req.take().unwrap();
                    state.connecting = false;
                    let event = CompletionEvent::mark(EventKind::Connect, req.arg, Err(SocketError::Canceled));
                    self.manager.dispatcher.send(req.task.as_ref(), event);
                }
            }
        }
    }
}

fn would_block_connect(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EINPROGRESS || code == libc::EALREADY
    ) || err.kind() == std::io::ErrorKind::WouldBlock
}

impl Drop for Socket {
    fn drop(&mut self) {
        let fd = self.state.get_mut().unwrap().fd.take();
        match fd {
            Some(fd) => self.manager.retire_socket(fd),
            None => self.manager.account_destroyed_unregistered(),
        }
    }
}
