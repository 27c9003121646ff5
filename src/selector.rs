//! `poll(2)`-based readiness backend.
//!
//! Owned exclusively by the watcher thread (§4.5): nothing else touches a
//! [`Selector`], so unlike a general-purpose reactor it carries no internal
//! locking of its own. Waking the blocked `poll` call when another thread
//! needs the watcher to rescan a socket is done with a self-pipe, the same
//! trick as the notify pipe in a `poll`-backed selector.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;

/// A single fd's readiness after a `poll` call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub(crate) struct Selector {
    poll_fds: Vec<libc::pollfd>,
    /// Maps a registered fd to its index in `poll_fds`. Index 0 is always
    /// the wake-pipe's read end and is never present here.
    index: HashMap<RawFd, usize>,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        let [wake_read, wake_write] = fds;
        set_nonblocking(wake_read)?;
        set_nonblocking(wake_write)?;

        Ok(Selector {
            poll_fds: vec![libc::pollfd {
                fd: wake_read,
                events: libc::POLLIN,
                revents: 0,
            }],
            index: HashMap::new(),
            wake_read,
            wake_write,
        })
    }

    /// A thread-safe handle used by other threads to interrupt a blocked
    /// `poll` call; does not grant access to the selector itself.
    pub(crate) fn waker(&self) -> Waker {
        Waker { fd: self.wake_write }
    }

    pub(crate) fn set_interest(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let mut events = 0;
        if readable {
            events |= READ_EVENTS;
        }
        if writable {
            events |= WRITE_EVENTS;
        }

        if events == 0 {
            self.remove(fd);
            return;
        }

        if let Some(&idx) = self.index.get(&fd) {
            self.poll_fds[idx].events = events;
        } else {
            let idx = self.poll_fds.len();
            self.index.insert(fd, idx);
            self.poll_fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
    }

    pub(crate) fn remove(&mut self, fd: RawFd) {
        if let Some(idx) = self.index.remove(&fd) {
            self.poll_fds.swap_remove(idx);
            if let Some(moved) = self.poll_fds.get(idx) {
                self.index.insert(moved.fd, idx);
            }
        }
    }

    /// Blocks until at least one registered fd is ready, the wake pipe is
    /// signalled, or `timeout` elapses. Returns the readiness of every fd
    /// that had non-zero `revents`, skipping the wake pipe itself.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms = deadline
                .map(|deadline| {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX)
                })
                .unwrap_or(-1);

            let n = unsafe {
                libc::poll(
                    self.poll_fds.as_mut_ptr(),
                    self.poll_fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            if self.poll_fds[0].revents != 0 {
                drain_wake_pipe(self.wake_read);
                self.poll_fds[0].revents = 0;
            }

            let mut ready = Vec::new();
            for pfd in &self.poll_fds[1..] {
                if pfd.revents != 0 {
                    ready.push(Readiness {
                        fd: pfd.fd,
                        readable: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
                        writable: pfd.revents & libc::POLLOUT != 0,
                        error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                    });
                }
            }
            for pfd in self.poll_fds.iter_mut() {
                pfd.revents = 0;
            }
            return Ok(ready);
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// A cloneable handle that lets other threads interrupt the watcher's
/// blocked `poll` call by writing a single byte to the wake pipe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waker {
    fd: RawFd,
}

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub(crate) fn wake(&self) {
        let byte: u8 = 1;
        unsafe {
            libc::write(self.fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn drain_wake_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
