//! Internal dispatch handlers run by the manager's worker pool once the
//! watcher observes readiness for a socket (§4.5). Each function is handed
//! the extra `Arc<Socket>` reference the watcher took for the duration of
//! the dispatch; dropping it at the end of the call is what releases that
//! reference.

use std::sync::Arc;

use crate::io_ops;
use crate::request::{CompletionEvent, EventKind};
use crate::socket::Socket;

/// A unit of work handed from the watcher thread to a dispatch worker.
pub(crate) enum DispatchJob {
    Recv(Arc<Socket>),
    Send(Arc<Socket>),
    Accept(Arc<Socket>),
    Connect(Arc<Socket>),
}

pub(crate) fn run_job(job: DispatchJob) {
    match job {
        DispatchJob::Recv(socket) => internal_recv(&socket),
        DispatchJob::Send(socket) => internal_send(&socket),
        DispatchJob::Accept(socket) => internal_accept(&socket),
        DispatchJob::Connect(socket) => internal_connect(&socket),
    }
}

fn internal_recv(socket: &Arc<Socket>) {
    let mut state = socket.lock();
    state.pending_recv = false;
    io_ops::doio_recv(socket, &mut state);
    let rescan = state.wants_read();
    drop(state);
    if rescan {
        socket.manager.poke_rescan(socket);
    }
}

fn internal_send(socket: &Arc<Socket>) {
    let mut state = socket.lock();
    state.pending_send = false;
    io_ops::doio_send(socket, &mut state);
    let rescan = state.wants_write();
    drop(state);
    if rescan {
        socket.manager.poke_rescan(socket);
    }
}

fn internal_accept(socket: &Arc<Socket>) {
    let mut state = socket.lock();
    state.pending_accept = false;

    let fd = match state.fd {
        Some(fd) => fd,
        None => return,
    };

    loop {
        if state.accept_queue.is_empty() {
            break;
        }

        match nix::sys::socket::accept4(
            fd,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK | nix::sys::socket::SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(new_fd) => {
                let req = state.accept_queue.pop_front().unwrap();
                let peer = io_ops::getsockname(new_fd).ok();
                {
                    let mut new_state = req.new_socket.lock();
                    new_state.fd = Some(new_fd);
                    new_state.connected = true;
                    new_state.peer = peer;
                }
                socket.manager.register_accepted(new_fd, &req.new_socket);
                let event = CompletionEvent {
                    kind: EventKind::NewConn,
                    arg: req.arg,
                    result: Ok(()),
                    n: 0,
                    addr: peer,
                    pktinfo: None,
                    timestamp: None,
                    attrs: crate::request::CompletionAttrs::NONE,
                    new_socket: Some(req.new_socket),
                };
                socket.manager.dispatcher.send(req.task.as_ref(), event);
            }
            Err(nix::Error::EAGAIN) => break,
            Err(e) => {
                let req = state.accept_queue.pop_front().unwrap();
                let err = crate::error::classify_os_error(std::io::Error::from(e), false);
                let event = CompletionEvent::mark(EventKind::NewConn, req.arg, Err(err));
                socket.manager.dispatcher.send(req.task.as_ref(), event);
            }
        }
    }

    let rescan = state.wants_read();
    drop(state);
    if rescan {
        socket.manager.poke_rescan(socket);
    }
}

fn internal_connect(socket: &Arc<Socket>) {
    let mut state = socket.lock();
    let Some(req) = state.connect_req.take() else {
        return;
    };
    state.connecting = false;

    let fd = state.fd;
    let result = match fd {
        Some(fd) => io_ops::take_connect_error(fd),
        None => Err(crate::error::SocketError::Closed),
    };
    if result.is_ok() {
        state.connected = true;
    }
    drop(state);

    socket
        .manager
        .dispatcher
        .send(req.task.as_ref(), CompletionEvent::mark(EventKind::Connect, req.arg, result));
}
