//! The watcher thread: the single owner of the `Selector` and the single
//! thread allowed to close a socket's fd (§4.5, §9).

use std::os::unix::io::RawFd;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use crate::dispatch::DispatchJob;
use crate::manager::{ControlMsg, ManagerInner};
use crate::selector::{Readiness, Selector};
use crate::socket::SocketHandle;

#[tracing::instrument(skip_all, name = "watcher_loop")]
pub(crate) fn run(manager: Arc<ManagerInner>, control_rx: Receiver<ControlMsg>, mut selector: Selector) {
    tracing::debug!("watcher thread started");
    loop {
        match selector.poll(None) {
            Ok(ready) => {
                for r in ready {
                    handle_readiness(&manager, &mut selector, r);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "poll(2) failed");
            }
        }

        loop {
            match control_rx.try_recv() {
                Ok(ControlMsg::Rescan(fd)) => rescan(&manager, &mut selector, fd),
                Ok(ControlMsg::CloseSocket(fd)) => {
                    selector.remove(fd);
                    manager.finish_close(fd);
                    tracing::debug!(fd, "socket closed");
                }
                Ok(ControlMsg::Shutdown) => {
                    tracing::debug!("watcher thread stopping");
                    return;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }
}

fn rescan(manager: &Arc<ManagerInner>, selector: &mut Selector, fd: RawFd) {
    match manager.lookup(fd) {
        Some(socket) => recompute_interest(selector, fd, &socket),
        None => selector.remove(fd),
    }
}

/// Applies one readiness result: dispatches at most one job per direction
/// (the corresponding `pending_*` flag suppresses re-dispatch until the
/// worker finishes and pokes a rescan) and updates the fd's registered
/// interest to match.
fn handle_readiness(manager: &Arc<ManagerInner>, selector: &mut Selector, r: Readiness) {
    let socket = match manager.lookup(r.fd) {
        Some(s) => s,
        None => {
            selector.remove(r.fd);
            return;
        }
    };

    let mut jobs = Vec::with_capacity(2);
    {
        let mut state = socket.lock();

        if (r.readable || r.error) && state.wants_read() {
            if state.listener {
                state.pending_accept = true;
                jobs.push(DispatchJob::Accept(socket.clone()));
            } else {
                state.pending_recv = true;
                jobs.push(DispatchJob::Recv(socket.clone()));
            }
        }

        if (r.writable || r.error) && state.connecting && state.connect_req.is_some() {
            jobs.push(DispatchJob::Connect(socket.clone()));
        } else if (r.writable || r.error) && state.wants_write() {
            state.pending_send = true;
            jobs.push(DispatchJob::Send(socket.clone()));
        }
    }

    for job in jobs {
        manager.dispatch(job);
    }
    recompute_interest(selector, r.fd, &socket);
}

fn recompute_interest(selector: &mut Selector, fd: RawFd, socket: &SocketHandle) {
    let state = socket.lock();
    selector.set_interest(fd, state.wants_read(), state.wants_write());
}
