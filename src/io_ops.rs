//! Non-blocking socket primitives: creation, the synchronous API calls
//! (`bind`/`listen`/`connect`/`getsockname`), and the `doio_recv`/`doio_send`
//! classification loop that drains a socket's queues as far as the kernel
//! allows before returning.

use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};

use crate::error::{classify_os_error, Result, SocketError};
use crate::message::{self, RecvOutcome, SendOutcome};
use crate::request::{CompletionAttrs, CompletionEvent, EventKind, Target};
use crate::socket::{Socket, SocketKind, SocketState};

/// Converts a std address into the `nix` address-family-erased type the
/// socket calls below take.
pub(crate) fn sockaddr_to_storage(addr: SocketAddr) -> SockaddrStorage {
    match addr {
        SocketAddr::V4(v4) => v4.into(),
        SocketAddr::V6(v6) => v6.into(),
    }
}

/// Creates a non-blocking socket of the given kind for `addr`'s family.
pub(crate) fn create_fd(kind: SocketKind, addr_family: AddressFamily) -> Result<RawFd> {
    let ty = match kind {
        SocketKind::Udp => SockType::Datagram,
        SocketKind::Tcp => SockType::Stream,
    };
    let owned = socket::socket(addr_family, ty, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC, None)
        .map_err(SocketError::from)?;
    Ok(owned.into_raw_fd())
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let storage = sockaddr_to_storage(addr);
    socket::bind(fd, &storage).map_err(SocketError::from)
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    let backlog = if backlog <= 0 { libc::SOMAXCONN } else { backlog };
    socket::listen(&unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, backlog as usize)
        .map_err(SocketError::from)
}

pub(crate) fn connect(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let storage = sockaddr_to_storage(addr);
    match socket::connect(fd, &storage) {
        Ok(()) => Ok(()),
        Err(e) => Err(classify_os_error(std::io::Error::from(e), true)),
    }
}

/// Completes a pending non-blocking connect once the fd becomes writable,
/// by reading back `SO_ERROR`.
pub(crate) fn take_connect_error(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(classify_os_error(std::io::Error::last_os_error(), true));
    }
    if err == 0 {
        Ok(())
    } else {
        Err(classify_os_error(std::io::Error::from_raw_os_error(err), true))
    }
}

pub(crate) fn getsockname(fd: RawFd) -> Result<SocketAddr> {
    let storage: SockaddrStorage = socket::getsockname(fd).map_err(SocketError::from)?;
    if let Some(v4) = storage.as_sockaddr_in() {
        return Ok(SocketAddr::V4(std::net::SocketAddrV4::new(v4.ip().into(), v4.port())));
    }
    if let Some(v6) = storage.as_sockaddr_in6() {
        return Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        )));
    }
    Err(SocketError::Unexpected(std::io::Error::new(
        std::io::ErrorKind::Other,
        "unsupported address family",
    )))
}

fn recv_iovecs(target: &mut Target) -> Vec<IoSliceMut<'_>> {
    match target {
        Target::Single(b) => vec![IoSliceMut::new(b.available_mut())],
        Target::List(bufs) => bufs.iter_mut().map(|b| IoSliceMut::new(b.available_mut())).collect(),
    }
}

fn commit_recv(target: &mut Target, mut n: usize) {
    match target {
        Target::Single(b) => {
            let avail = b.available_mut().len();
            b.advance(n.min(avail));
        }
        Target::List(bufs) => {
            for b in bufs.iter_mut() {
                if n == 0 {
                    break;
                }
                let avail = b.available_mut().len();
                let take = n.min(avail);
                b.advance(take);
                n -= take;
            }
        }
    }
}

/// Builds the `IoSlice` vector for a send, skipping `already_sent` bytes
/// cumulative across the whole target (tracking partial TCP writes).
fn send_iovecs(target: &Target, already_sent: usize) -> Vec<IoSlice<'_>> {
    let mut skip = already_sent;
    let bufs: Vec<&[u8]> = match target {
        Target::Single(b) => vec![b.used()],
        Target::List(list) => list.iter().map(|b| b.used()).collect(),
    };
    let mut iov = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        iov.push(IoSlice::new(&buf[skip..]));
        skip = 0;
    }
    iov
}

/// Drains as much of `state.recv_queue` as the kernel will currently
/// allow, stopping at the first `EWOULDBLOCK`, end-of-file, or hard error.
/// May be called either inline (request just enqueued into an idle
/// socket) or from a dispatch worker after the watcher observed
/// readability; both paths hold `state`'s lock for the whole call.
pub(crate) fn doio_recv(socket: &Socket, state: &mut SocketState) {
    loop {
        let is_mark = matches!(state.recv_queue.front(), Some(crate::request::RecvEntry::Mark(_)));
        if is_mark {
            let entry = state.recv_queue.pop_front().unwrap();
            if let crate::request::RecvEntry::Mark(m) = entry {
                let result = state.recv_result.clone();
                socket.manager.dispatcher.send(
                    m.task.as_ref(),
                    CompletionEvent::mark_latched(m.kind, m.arg, result),
                );
            }
            continue;
        }

        if state.recv_queue.is_empty() {
            return;
        }

        let fd = match state.fd {
            Some(fd) => fd,
            None => {
                fail_all_recv(socket, state, SocketError::Closed);
                return;
            }
        };

        let udp = socket.kind == SocketKind::Udp;
        let want_metadata = matches!(
            state.recv_queue.front(),
            Some(crate::request::RecvEntry::Recv(r)) if r.want_metadata
        );

        let connected = state.connected;
        let outcome = {
            let req = match state.recv_queue.front_mut().unwrap() {
                crate::request::RecvEntry::Recv(r) => r,
                _ => unreachable!(),
            };
            let mut iov = recv_iovecs(&mut req.target);
            message::recv_once(fd, socket.kind, &mut iov, want_metadata, connected)
        };

        match outcome {
            Ok(RecvOutcome::WouldBlock) => return,
            Ok(RecvOutcome::Eof) => {
                let entry = state.recv_queue.pop_front().unwrap();
                complete_recv(socket, entry, Err(SocketError::Eof), 0, None, None, None, CompletionAttrs::NONE);
            }
            Ok(RecvOutcome::Progress { n, addr, pktinfo, timestamp, attrs }) => {
                let done = {
                    let req = match state.recv_queue.front_mut().unwrap() {
                        crate::request::RecvEntry::Recv(r) => r,
                        _ => unreachable!(),
                    };
                    commit_recv(&mut req.target, n);
                    req.n += n;
                    udp || req.n >= req.minimum
                };
                if done {
                    let entry = state.recv_queue.pop_front().unwrap();
                    let n_total = match &entry {
                        crate::request::RecvEntry::Recv(r) => r.n,
                        _ => unreachable!(),
                    };
                    complete_recv(socket, entry, Ok(()), n_total, addr, pktinfo, timestamp, attrs);
                } else {
                    // TCP short read below the requested minimum: stay at
                    // the head of the queue and wait for more data.
                    return;
                }
            }
            Err(err) => {
                if udp {
                    let entry = state.recv_queue.pop_front().unwrap();
                    complete_recv(socket, entry, Err(err), 0, None, None, None, CompletionAttrs::NONE);
                } else {
                    state.recv_result = Err(err.clone());
                    fail_all_recv(socket, state, err);
                    return;
                }
            }
        }
    }
}

fn complete_recv(
    socket: &Socket,
    entry: crate::request::RecvEntry,
    result: Result<()>,
    n: usize,
    addr: Option<SocketAddr>,
    pktinfo: Option<crate::request::PacketInfo>,
    timestamp: Option<crate::request::Timestamp>,
    attrs: CompletionAttrs,
) {
    let req = match entry {
        crate::request::RecvEntry::Recv(r) => r,
        crate::request::RecvEntry::Mark(_) => unreachable!("mark handled separately"),
    };
    let event = CompletionEvent {
        kind: EventKind::RecvDone,
        arg: req.arg,
        result,
        n,
        addr,
        pktinfo,
        timestamp,
        attrs,
        new_socket: None,
    };
    socket.manager.dispatcher.send(req.task.as_ref(), event);
}

fn fail_all_recv(socket: &Socket, state: &mut SocketState, err: SocketError) {
    while let Some(entry) = state.recv_queue.pop_front() {
        match entry {
            crate::request::RecvEntry::Recv(r) => {
                let event =
                    CompletionEvent::mark_latched(EventKind::RecvDone, r.arg, Err(err.clone()));
                socket.manager.dispatcher.send(r.task.as_ref(), event);
            }
            crate::request::RecvEntry::Mark(m) => {
                let event = CompletionEvent::mark_latched(m.kind, m.arg, Err(err.clone()));
                socket.manager.dispatcher.send(m.task.as_ref(), event);
            }
        }
    }
}

/// Drains as much of `state.send_queue` as the kernel will currently
/// accept, mirroring `doio_recv`.
pub(crate) fn doio_send(socket: &Socket, state: &mut SocketState) {
    loop {
        let is_mark = matches!(state.send_queue.front(), Some(crate::request::SendEntry::Mark(_)));
        if is_mark {
            let entry = state.send_queue.pop_front().unwrap();
            if let crate::request::SendEntry::Mark(m) = entry {
                let result = state.send_result.clone();
                socket.manager.dispatcher.send(
                    m.task.as_ref(),
                    CompletionEvent::mark_latched(m.kind, m.arg, result),
                );
            }
            continue;
        }

        if state.send_queue.is_empty() {
            return;
        }

        let fd = match state.fd {
            Some(fd) => fd,
            None => {
                fail_all_send(socket, state, SocketError::Closed);
                return;
            }
        };

        let udp = socket.kind == SocketKind::Udp;

        let connected = state.connected;
        let outcome = {
            let req = match state.send_queue.front().unwrap() {
                crate::request::SendEntry::Send(r) => r,
                _ => unreachable!(),
            };
            let iov = send_iovecs(&req.target, req.n);
            message::send_once(fd, &iov, req.dest, req.pktinfo, connected)
        };

        match outcome {
            Ok(SendOutcome::WouldBlock) => return,
            Ok(SendOutcome::Progress { n }) => {
                let done = {
                    let req = match state.send_queue.front_mut().unwrap() {
                        crate::request::SendEntry::Send(r) => r,
                        _ => unreachable!(),
                    };
                    req.n += n;
                    udp || req.n >= req.target.used_len()
                };
                if done {
                    let entry = state.send_queue.pop_front().unwrap();
                    let n_total = match &entry {
                        crate::request::SendEntry::Send(r) => r.n,
                        _ => unreachable!(),
                    };
                    complete_send(socket, entry, Ok(()), n_total);
                } else {
                    return;
                }
            }
            Err(err) => {
                if udp {
                    let entry = state.send_queue.pop_front().unwrap();
                    complete_send(socket, entry, Err(err), 0);
                } else {
                    state.send_result = Err(err.clone());
                    fail_all_send(socket, state, err);
                    return;
                }
            }
        }
    }
}

fn complete_send(socket: &Socket, entry: crate::request::SendEntry, result: Result<()>, n: usize) {
    let req = match entry {
        crate::request::SendEntry::Send(r) => r,
        crate::request::SendEntry::Mark(_) => unreachable!("mark handled separately"),
    };
    let mut event = CompletionEvent::mark(EventKind::SendDone, req.arg, result);
    event.n = n;
    socket.manager.dispatcher.send(req.task.as_ref(), event);
}

fn fail_all_send(socket: &Socket, state: &mut SocketState, err: SocketError) {
    while let Some(entry) = state.send_queue.pop_front() {
        match entry {
            crate::request::SendEntry::Send(r) => {
                let event =
                    CompletionEvent::mark_latched(EventKind::SendDone, r.arg, Err(err.clone()));
                socket.manager.dispatcher.send(r.task.as_ref(), event);
            }
            crate::request::SendEntry::Mark(m) => {
                let event = CompletionEvent::mark_latched(m.kind, m.arg, Err(err.clone()));
                socket.manager.dispatcher.send(m.task.as_ref(), event);
            }
        }
    }
}
