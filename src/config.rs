//! Manager tunables.
//!
//! Unlike most of this crate's sibling services, the socket engine has no
//! on-disk or environment configuration of its own — it is an embedded
//! library component, constructed in-process by whatever owns the task
//! dispatcher. `ManagerConfig` is therefore a plain, code-constructed
//! struct rather than something loaded from a file.

/// Tunables for a [`crate::SocketManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Initial reservation for the fd-indexed socket table. The table grows
    /// on demand past this and is never shrunk, mirroring the `maxfd`
    /// behaviour of a `select`-based watcher (see SPEC_FULL.md §9).
    pub initial_table_capacity: usize,

    /// Upper bound on the number of `(base, length)` vectors a single
    /// `recvv`/`sendv`/`sendtov` call may submit in one buffer list. A
    /// datagram's vectors all land in a single `recvmsg`/`sendmsg` call, so
    /// this is enforced as a synchronous usage error rather than split
    /// across multiple `doio_*` passes.
    pub max_iov: usize,

    /// Bound on the control channel used to poke the watcher thread.
    /// Pokes are coalesced by the OS-level wake primitive, so this is a
    /// backpressure knob rather than a correctness requirement.
    pub control_channel_capacity: usize,

    /// Number of internal worker threads that run `doio_recv`/`doio_send`/
    /// accept/connect handlers once the watcher marks a socket ready. Kept
    /// separate from the watcher thread itself so a slow handler (a large
    /// scatter/gather transfer, a slow `ByteSource::reserve_available`)
    /// never delays the next `poll(2)` cycle.
    pub dispatch_workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            initial_table_capacity: 256,
            max_iov: 16,
            control_channel_capacity: 256,
            dispatch_workers: 4,
        }
    }
}
