//! The socket manager: owns the fd-indexed socket table, the watcher
//! thread, and the internal dispatch worker pool.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::config::ManagerConfig;
use crate::dispatch::{self, DispatchJob};
use crate::error::{Result, SocketError};
use crate::selector::{Selector, Waker};
use crate::socket::{Socket, SocketHandle, SocketKind};
use crate::task::TaskDispatcher;
use crate::watcher;

/// The address family a socket is created for. Kept separate from
/// [`SocketKind`], which only distinguishes the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

impl From<Family> for nix::sys::socket::AddressFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Inet => nix::sys::socket::AddressFamily::Inet,
            Family::Inet6 => nix::sys::socket::AddressFamily::Inet6,
        }
    }
}

/// Messages sent from any thread to the watcher thread. The watcher is the
/// sole owner of the `Selector` and the only thread that ever closes a
/// socket's fd, so both kinds of request are funneled through here rather
/// than mutated directly.
pub(crate) enum ControlMsg {
    /// Recompute interest for this fd: a request was queued, a connect
    /// started, or a dispatch handler finished and the queue may still
    /// want more service.
    Rescan(RawFd),
    /// The last reference to this fd's socket was dropped; close it and
    /// forget it.
    CloseSocket(RawFd),
    Shutdown,
}

pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    pub(crate) dispatcher: Arc<dyn TaskDispatcher>,
    table: Mutex<HashMap<RawFd, Weak<Socket>>>,
    control_tx: SyncSender<ControlMsg>,
    waker: Waker,
    dispatch_tx: Sender<DispatchJob>,
    socket_count: Mutex<usize>,
    zero_sockets: Condvar,
}

impl ManagerInner {
    pub(crate) fn lookup(&self, fd: RawFd) -> Option<SocketHandle> {
        self.table.lock().unwrap().get(&fd).and_then(Weak::upgrade)
    }

    fn insert(&self, fd: RawFd, socket: &SocketHandle) {
        self.table.lock().unwrap().insert(fd, Arc::downgrade(socket));
    }

    fn remove(&self, fd: RawFd) {
        self.table.lock().unwrap().remove(&fd);
    }

    pub(crate) fn register_accepted(&self, fd: RawFd, socket: &SocketHandle) {
        self.insert(fd, socket);
    }

    /// Called whenever a new `Socket` value is allocated, whether or not
    /// it ends up with a real fd (an accept placeholder might be
    /// discarded before the kernel ever hands back a connection).
    pub(crate) fn account_created(&self) {
        *self.socket_count.lock().unwrap() += 1;
    }

    /// Drop path for a socket that never acquired an fd: decrement and
    /// notify directly, since there is nothing for the watcher to close.
    pub(crate) fn account_destroyed_unregistered(&self) {
        let mut count = self.socket_count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.zero_sockets.notify_all();
        }
    }

    /// Drop path for a socket that held a real fd: handed to the watcher
    /// thread, the only thread allowed to call `close(2)`, so a closed fd
    /// number is never reused while a stale readiness event referencing it
    /// might still be in flight.
    pub(crate) fn retire_socket(&self, fd: RawFd) {
        let _ = self.control_tx.send(ControlMsg::CloseSocket(fd));
        self.waker.wake();
    }

    pub(crate) fn poke_rescan(&self, socket: &Socket) {
        if let Some(fd) = socket.raw_fd() {
            let _ = self.control_tx.send(ControlMsg::Rescan(fd));
            self.waker.wake();
        }
    }

    pub(crate) fn dispatch(&self, job: DispatchJob) {
        let _ = self.dispatch_tx.send(job);
    }

    /// Runs on the watcher thread when a `CloseSocket` message is
    /// processed: the one place that actually calls `close(2)`.
    pub(crate) fn finish_close(&self, fd: RawFd) {
        self.remove(fd);
        unsafe {
            libc::close(fd);
        }
        let mut count = self.socket_count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.zero_sockets.notify_all();
        }
    }
}

/// The engine's public entry point: creates sockets and owns the watcher
/// and dispatch-worker threads that service them.
pub struct SocketManager {
    inner: Arc<ManagerInner>,
    watcher_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("sockets", &*self.inner.socket_count.lock().unwrap())
            .finish()
    }
}

impl SocketManager {
    pub fn new(config: ManagerConfig, dispatcher: Arc<dyn TaskDispatcher>) -> Result<Self> {
        let selector = Selector::new().map_err(SocketError::Unexpected)?;
        let waker = selector.waker();
        let (control_tx, control_rx) = mpsc::sync_channel(config.control_channel_capacity.max(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel();
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let inner = Arc::new(ManagerInner {
            table: Mutex::new(HashMap::with_capacity(config.initial_table_capacity)),
            dispatcher,
            control_tx,
            waker,
            dispatch_tx,
            socket_count: Mutex::new(0),
            zero_sockets: Condvar::new(),
            config,
        });

        let watcher_manager = inner.clone();
        let watcher_handle = thread::Builder::new()
            .name("sockio-watcher".into())
            .spawn(move || watcher::run(watcher_manager, control_rx, selector))
            .map_err(SocketError::Unexpected)?;

        let worker_count = inner.config.dispatch_workers.max(1);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = dispatch_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("sockio-dispatch-{i}"))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock().unwrap();
                        guard.recv()
                    };
                    match job {
                        Ok(job) => dispatch::run_job(job),
                        Err(_) => return,
                    }
                })
                .map_err(SocketError::Unexpected)?;
            worker_handles.push(handle);
        }

        Ok(SocketManager {
            inner,
            watcher_handle: Mutex::new(Some(watcher_handle)),
            worker_handles: Mutex::new(worker_handles),
        })
    }

    /// Creates a new, unbound, unconnected socket of the given kind and
    /// address family.
    #[tracing::instrument(skip(self), fields(?kind, ?family))]
    pub fn create(&self, kind: SocketKind, family: Family) -> Result<SocketHandle> {
        let fd = crate::io_ops::create_fd(kind, family.into())?;
        let socket = Socket::new_unattached(kind, self.inner.clone());
        self.inner.account_created();
        socket.lock().fd = Some(fd);
        self.inner.insert(fd, &socket);
        tracing::debug!(fd, "socket created");
        Ok(socket)
    }

    /// The number of sockets currently tracked (live handles plus queued
    /// requests plus in-flight dispatch jobs keeping one alive).
    pub fn socket_count(&self) -> usize {
        *self.inner.socket_count.lock().unwrap()
    }

    /// Blocks until every socket this manager ever created has been fully
    /// destroyed, then stops the watcher thread. Dispatch workers are left
    /// running until the manager itself is dropped.
    pub fn shutdown(&self) {
        let guard = self.inner.socket_count.lock().unwrap();
        let _guard = self
            .zero_sockets_wait(guard);
        let _ = self.inner.control_tx.send(ControlMsg::Shutdown);
        self.inner.waker.wake();
        if let Some(handle) = self.watcher_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn zero_sockets_wait<'a>(
        &'a self,
        mut guard: std::sync::MutexGuard<'a, usize>,
    ) -> std::sync::MutexGuard<'a, usize> {
        while *guard != 0 {
            guard = self.inner.zero_sockets.wait(guard).unwrap();
        }
        guard
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        // Dispatch workers block on a channel fed by `Arc<ManagerInner>`,
        // which may still be kept alive by live sockets after this handle
        // goes away; joining them here could deadlock. They are left to
        // exit on their own once the last socket (and the watcher's own
        // reference) drops the channel's last sender, or at process exit.
        if let Some(handle) = self.watcher_handle.lock().unwrap().take() {
            tracing::warn!(
                sockets = self.socket_count(),
                "SocketManager dropped without calling shutdown(); stopping watcher immediately"
            );
            let _ = self.inner.control_tx.send(ControlMsg::Shutdown);
            self.inner.waker.wake();
            let _ = handle.join();
        }
    }
}
