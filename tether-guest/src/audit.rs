//! Kernel audit subscription for netfilter configuration changes.
//!
//! Every `iptables` rule change emits an `AUDIT_NETFILTER_CFG` record on
//! the audit multicast group. Listening to it lets the observer skip NAT
//! table scans while nothing changes.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::{debug, trace};

use crate::firewall::FirewallWatch;

/// `AUDIT_SET`: update the audit status.
const AUDIT_SET: u16 = 1001;
/// `AUDIT_NETFILTER_CFG`: netfilter table replaced.
const AUDIT_NETFILTER_CFG: u16 = 1325;
/// `AUDIT_NLGRP_READLOG`: read-only multicast group.
const AUDIT_NLGRP_READLOG: u32 = 1;
/// `AUDIT_STATUS_ENABLED` bit of `audit_status.mask`.
const AUDIT_STATUS_ENABLED: u32 = 1;

/// Size of `struct nlmsghdr`.
const NLMSG_HDRLEN: usize = 16;
/// Leading `u32` fields of `struct audit_status` we send.
const AUDIT_STATUS_WORDS: usize = 10;

/// A bound `NETLINK_AUDIT` socket.
#[derive(Debug)]
pub struct AuditSocket {
    /// Raw netlink socket.
    fd: OwnedFd,
}

impl AuditSocket {
    /// Opens a netlink audit socket subscribed to the read-log group.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_AUDIT,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = AUDIT_NLGRP_READLOG;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast(),
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Turns auditing on so netfilter changes are reported.
    pub fn enable(&self) -> io::Result<()> {
        let mut status = [0u32; AUDIT_STATUS_WORDS];
        status[0] = AUDIT_STATUS_ENABLED;
        status[1] = 1;
        let msg = request(AUDIT_SET, &status);
        let n = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks forever, signalling `watch` on every netfilter change.
    pub fn listen(&self, watch: &FirewallWatch) -> io::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = unsafe {
                libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            #[allow(clippy::cast_sign_loss)]
            let changes = netfilter_changes(&buf[..n as usize]);
            if changes > 0 {
                debug!(changes, "netfilter configuration changed");
                watch.signal();
            } else {
                trace!(bytes = n, "ignoring audit record");
            }
        }
    }
}

/// Builds an `NLM_F_REQUEST | NLM_F_ACK` message with a `u32` body.
#[allow(clippy::cast_possible_truncation)]
fn request(kind: u16, body: &[u32]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + body.len() * 4;
    let mut msg = Vec::with_capacity(len);
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&kind.to_ne_bytes());
    msg.extend_from_slice(&((libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16).to_ne_bytes());
    msg.extend_from_slice(&1u32.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    for word in body {
        msg.extend_from_slice(&word.to_ne_bytes());
    }
    msg
}

/// Counts `AUDIT_NETFILTER_CFG` messages in one netlink datagram.
pub fn netfilter_changes(buf: &[u8]) -> usize {
    let mut count = 0;
    let mut rest = buf;
    while rest.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let kind = u16::from_ne_bytes([rest[4], rest[5]]);
        if len < NLMSG_HDRLEN || len > rest.len() {
            break;
        }
        if kind == AUDIT_NETFILTER_CFG {
            count += 1;
        }
        // NLMSG_ALIGN
        let step = (len + 3) & !3;
        rest = rest.get(step..).unwrap_or_default();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u16, text: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDRLEN + text.len();
        let mut msg = Vec::new();
        msg.extend_from_slice(&u32::try_from(len).unwrap().to_ne_bytes());
        msg.extend_from_slice(&kind.to_ne_bytes());
        msg.extend_from_slice(&[0u8; 10]);
        msg.extend_from_slice(text);
        msg.resize((len + 3) & !3, 0);
        msg
    }

    #[test]
    fn counts_netfilter_records() {
        let mut dgram = record(AUDIT_NETFILTER_CFG, b"table=nat family=2 entries=12 op=xt_replace");
        dgram.extend(record(1300, b"arch=c000003e syscall=54"));
        dgram.extend(record(AUDIT_NETFILTER_CFG, b"table=filter family=2"));
        assert_eq!(netfilter_changes(&dgram), 2);
    }

    #[test]
    fn stops_at_truncated_header() {
        let mut dgram = record(AUDIT_NETFILTER_CFG, b"x");
        dgram.extend_from_slice(&[0xff; 7]);
        assert_eq!(netfilter_changes(&dgram), 1);
        assert_eq!(netfilter_changes(&[]), 0);
    }

    #[test]
    fn set_request_layout() {
        let msg = request(AUDIT_SET, &[1, 1]);
        assert_eq!(msg.len(), NLMSG_HDRLEN + 8);
        assert_eq!(u16::from_ne_bytes([msg[4], msg[5]]), AUDIT_SET);
    }
}
