//! Scatter/gather message transfer and ancillary-data cracking.
//!
//! Wraps `nix::sys::socket::{recvmsg, sendmsg}` so `io_ops` deals only in
//! "how many bytes, what address, what metadata" rather than raw `msghdr`
//! plumbing. UDP receives opt into `IPV6_PKTINFO`/`SO_TIMESTAMP` ancillary
//! data per request; TCP never does, since a byte stream carries no
//! per-message metadata.

use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrStorage,
};
use nix::sys::time::TimeVal;

use crate::error::{classify_os_error, SocketError};
use crate::request::{CompletionAttrs, PacketInfo, Timestamp};
use crate::socket::SocketKind;

/// The result of a single `recvmsg` attempt.
pub(crate) enum RecvOutcome {
    /// `n` bytes were placed into the target; metadata is populated only
    /// when the caller asked for it and the kernel supplied it.
    Progress {
        n: usize,
        addr: Option<SocketAddr>,
        pktinfo: Option<PacketInfo>,
        timestamp: Option<Timestamp>,
        attrs: CompletionAttrs,
    },
    /// A stream socket's peer performed an orderly shutdown.
    Eof,
    WouldBlock,
}

/// Performs one `recvmsg(2)` into `iov`, which must describe the
/// currently-available (unused) remainder of the request's target.
pub(crate) fn recv_once(
    fd: RawFd,
    kind: SocketKind,
    iov: &mut [IoSliceMut<'_>],
    want_metadata: bool,
    connected: bool,
) -> std::result::Result<RecvOutcome, SocketError> {
    let mut cmsg_space = Vec::new();
    if want_metadata {
        cmsg_space.extend(nix::cmsg_space!(libc::in6_pktinfo));
        cmsg_space.extend(nix::cmsg_space!(TimeVal));
    }

    let result = recvmsg::<SockaddrStorage>(fd, iov, Some(&mut cmsg_space), MsgFlags::empty());

    let msg = match result {
        Ok(msg) => msg,
        Err(e) => {
            let io_err = std::io::Error::from(e);
            if SocketError::is_soft(&io_err) {
                return Ok(RecvOutcome::WouldBlock);
            }
            return Err(classify_os_error(io_err, connected));
        }
    };

    let n = msg.bytes;
    if n == 0 && kind == SocketKind::Tcp {
        return Ok(RecvOutcome::Eof);
    }

    let mut attrs = CompletionAttrs::NONE;
    if msg.flags.contains(MsgFlags::MSG_TRUNC) {
        attrs.insert(CompletionAttrs::TRUNC);
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        attrs.insert(CompletionAttrs::CTRUNC);
    }

    let mut pktinfo = None;
    let mut timestamp = None;
    if want_metadata {
        for cmsg in msg.cmsgs() {
            match cmsg {
                ControlMessageOwned::Ipv6PacketInfo(info) => {
                    pktinfo = Some(PacketInfo {
                        interface_index: info.ipi6_ifindex as u32,
                        local_addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
                    });
                    attrs.insert(CompletionAttrs::PKTINFO);
                }
                ControlMessageOwned::ScmTimestamp(tv) => {
                    timestamp = Some(Timestamp {
                        seconds: tv.tv_sec() as i64,
                        nanoseconds: (tv.tv_usec() as u32).saturating_mul(1000),
                    });
                    attrs.insert(CompletionAttrs::TIMESTAMP);
                }
                _ => {}
            }
        }
    }

    let addr = msg
        .address
        .as_ref()
        .and_then(sockaddr_storage_to_std);

    Ok(RecvOutcome::Progress {
        n,
        addr,
        pktinfo,
        timestamp,
        attrs,
    })
}

/// The result of a single `sendmsg` attempt.
pub(crate) enum SendOutcome {
    Progress { n: usize },
    WouldBlock,
}

/// Performs one `sendmsg(2)` of `iov`, optionally to `dest` (UDP only) and
/// optionally carrying a source-interface `IPV6_PKTINFO` hint.
pub(crate) fn send_once(
    fd: RawFd,
    iov: &[IoSlice<'_>],
    dest: Option<SocketAddr>,
    pktinfo: Option<PacketInfo>,
    connected: bool,
) -> std::result::Result<SendOutcome, SocketError> {
    let dest_storage = dest.map(crate::io_ops::sockaddr_to_storage);

    let mut cmsgs = Vec::new();
    let raw_pktinfo;
    if let Some(info) = pktinfo {
        raw_pktinfo = libc::in6_pktinfo {
            ipi6_addr: libc::in6_addr {
                s6_addr: info.local_addr.octets(),
            },
            ipi6_ifindex: info.interface_index as _,
        };
        cmsgs.push(ControlMessage::Ipv6PacketInfo(&raw_pktinfo));
    }

    let result = sendmsg(
        fd,
        iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        dest_storage.as_ref(),
    );

    match result {
        Ok(n) => Ok(SendOutcome::Progress { n }),
        Err(e) => {
            let io_err = std::io::Error::from(e);
            if SocketError::is_soft(&io_err) {
                return Ok(SendOutcome::WouldBlock);
            }
            Err(classify_os_error(io_err, connected))
        }
    }
}

fn sockaddr_storage_to_std(storage: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = storage.as_sockaddr_in() {
        return Some(SocketAddr::V4(std::net::SocketAddrV4::new(
            v4.ip().into(),
            v4.port(),
        )));
    }
    if let Some(v6) = storage.as_sockaddr_in6() {
        return Some(SocketAddr::V6(std::net::SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        )));
    }
    None
}
