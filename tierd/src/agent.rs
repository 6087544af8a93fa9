// SPDX-License-Identifier: GPL-2.0
//
// Request/response channel to the kernel-resident page classification agent.
// One fixed-size request goes out over a raw netlink socket; the reply is a
// burst of netlink frames carrying candidate records, decoded here into an
// explicit-length list.

use std::mem;
use std::os::fd::RawFd;

use anyhow::{bail, Context, Result};

use crate::tier::MigrationMode;

/// Netlink protocol number the placement module registers.
pub const NETLINK_PLACEMENT: i32 = 31;
/// Request/response payload ceiling per frame.
pub const MAX_PAYLOAD: usize = 4096;
/// Receive buffer holds this many full frames.
const MAX_PACKETS: usize = 16;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_ALIGNTO: usize = 4;

pub const OP_FIND: i32 = 0;
pub const OP_BIND: i32 = 1;
pub const OP_UNBIND: i32 = 2;

/// Wire size of one candidate record: u64 address, i32 pid, 4 bytes pad.
pub const ENTRY_LEN: usize = 16;
/// Fixed request record: op_code, pid_n, mode.
pub const REQUEST_LEN: usize = 12;

const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

const PACKET_LEN: usize = nlmsg_align(NLMSG_HDRLEN) + nlmsg_align(MAX_PAYLOAD);

/// One page nominated for migration, tagged with its owning process. For
/// bind/unbind exchanges the agent reuses the record as an outcome report
/// with `pid` holding the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateEntry {
    pub addr: u64,
    pub pid: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub op: i32,
    /// Pid for bind/unbind, requested page count for find.
    pub arg: i32,
    pub mode: i32,
}

impl Request {
    pub fn find(count: i32, mode: MigrationMode) -> Self {
        Self {
            op: OP_FIND,
            arg: count,
            mode: mode.wire(),
        }
    }

    pub fn bind(pid: i32) -> Self {
        Self {
            op: OP_BIND,
            arg: pid,
            mode: 0,
        }
    }

    pub fn unbind(pid: i32) -> Self {
        Self {
            op: OP_UNBIND,
            arg: pid,
            mode: 0,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&self.op.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.arg.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_ne_bytes());
        buf
    }
}

/// Walk the framed response in `buf`. Each frame contributes a slice of
/// candidate records; an error frame aborts the whole exchange.
pub fn decode_frames(buf: &[u8]) -> Result<Vec<CandidateEntry>> {
    let mut entries = Vec::new();
    let mut off = 0usize;

    while off + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(buf[off + 4..off + 6].try_into().unwrap());

        if len < NLMSG_HDRLEN || off + len > buf.len() {
            break;
        }
        if msg_type == NLMSG_ERROR {
            bail!("agent reported a transport error");
        }

        let payload = &buf[off + NLMSG_HDRLEN..off + len];
        for rec in payload.chunks_exact(ENTRY_LEN) {
            entries.push(CandidateEntry {
                addr: u64::from_ne_bytes(rec[0..8].try_into().unwrap()),
                pid: i32::from_ne_bytes(rec[8..12].try_into().unwrap()),
            });
        }

        off += nlmsg_align(len);
    }

    Ok(entries)
}

/// Strip the trailing terminator the agent appends to candidate lists: the
/// list ends at the first record with a non-positive owner. The agent may
/// return fewer candidates than requested.
fn take_candidates(raw: Vec<CandidateEntry>) -> Vec<CandidateEntry> {
    let n = raw.iter().take_while(|e| e.pid > 0).count();
    let mut raw = raw;
    raw.truncate(n);
    raw
}

/// Synchronous request/response channel to the agent. Implementations are
/// driven behind a mutex (the comm lock); one exchange is in flight at a
/// time and the receive buffer is only valid within it.
pub trait AgentChannel: Send {
    fn exchange(&mut self, req: Request) -> Result<Vec<CandidateEntry>>;

    fn find(&mut self, count: i32, mode: MigrationMode) -> Result<Vec<CandidateEntry>> {
        let raw = self.exchange(Request::find(count, mode))?;
        Ok(take_candidates(raw))
    }

    /// True when the agent acknowledged the bind.
    fn bind(&mut self, pid: i32) -> Result<bool> {
        let raw = self.exchange(Request::bind(pid))?;
        Ok(raw.first().map(|r| r.pid == 0).unwrap_or(false))
    }

    fn unbind(&mut self, pid: i32) -> Result<bool> {
        let raw = self.exchange(Request::unbind(pid))?;
        Ok(raw.first().map(|r| r.pid == 0).unwrap_or(false))
    }
}

/// Real transport over AF_NETLINK/SOCK_RAW.
pub struct NetlinkAgent {
    fd: RawFd,
    recv_buf: Vec<u8>,
}

impl NetlinkAgent {
    pub fn connect() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_PLACEMENT) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .context("Could not create netlink socket (is the placement module loaded?)");
        }

        let mut src: libc::sockaddr_nl = unsafe { mem::zeroed() };
        src.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        src.nl_pid = std::process::id();
        src.nl_groups = 0; // unicast

        let rc = unsafe {
            libc::bind(
                fd,
                &src as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).context("Error binding netlink socket");
        }

        Ok(Self {
            fd,
            recv_buf: vec![0u8; PACKET_LEN * MAX_PACKETS],
        })
    }

    fn send_packet(&self, req: Request) -> Result<()> {
        // Header + payload, payload zeroed beyond the request record.
        let mut packet = vec![0u8; PACKET_LEN];
        packet[0..4].copy_from_slice(&(PACKET_LEN as u32).to_ne_bytes());
        // type/flags/seq stay zero
        packet[12..16].copy_from_slice(&std::process::id().to_ne_bytes());
        packet[NLMSG_HDRLEN..NLMSG_HDRLEN + REQUEST_LEN].copy_from_slice(&req.encode());

        let mut dst: libc::sockaddr_nl = unsafe { mem::zeroed() };
        dst.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        dst.nl_pid = 0; // kernel
        dst.nl_groups = 0;

        let rc = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &dst as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error()).context("Error sending agent request");
        }
        Ok(())
    }
}

impl AgentChannel for NetlinkAgent {
    fn exchange(&mut self, req: Request) -> Result<Vec<CandidateEntry>> {
        self.send_packet(req)?;

        let rc = unsafe {
            libc::recv(
                self.fd,
                self.recv_buf.as_mut_ptr() as *mut libc::c_void,
                self.recv_buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error()).context("Error receiving agent response");
        }

        decode_frames(&self.recv_buf[..rc as usize])
    }
}

impl Drop for NetlinkAgent {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg_type: u16, entries: &[(u64, i32)]) -> Vec<u8> {
        let payload_len = entries.len() * ENTRY_LEN;
        let len = NLMSG_HDRLEN + payload_len;
        let mut buf = vec![0u8; nlmsg_align(len)];
        buf[0..4].copy_from_slice(&(len as u32).to_ne_bytes());
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        for (i, (addr, pid)) in entries.iter().enumerate() {
            let off = NLMSG_HDRLEN + i * ENTRY_LEN;
            buf[off..off + 8].copy_from_slice(&addr.to_ne_bytes());
            buf[off + 8..off + 12].copy_from_slice(&pid.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn request_encoding() {
        let req = Request::find(256, MigrationMode::BalanceNvram);
        let buf = req.encode();
        assert_eq!(i32::from_ne_bytes(buf[0..4].try_into().unwrap()), OP_FIND);
        assert_eq!(i32::from_ne_bytes(buf[4..8].try_into().unwrap()), 256);
        assert_eq!(i32::from_ne_bytes(buf[8..12].try_into().unwrap()), 4);
    }

    #[test]
    fn decodes_multi_frame_response() {
        let mut buf = frame(0, &[(0x1000, 42), (0x2000, 42)]);
        buf.extend(frame(0, &[(0x3000, 43), (0, 0)]));
        let entries = decode_frames(&buf).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2], CandidateEntry { addr: 0x3000, pid: 43 });
    }

    #[test]
    fn error_frame_aborts() {
        let mut buf = frame(0, &[(0x1000, 42)]);
        buf.extend(frame(NLMSG_ERROR, &[]));
        assert!(decode_frames(&buf).is_err());
    }

    #[test]
    fn truncated_frame_stops_walk() {
        let mut buf = frame(0, &[(0x1000, 42)]);
        let mut partial = frame(0, &[(0x2000, 43)]);
        partial.truncate(partial.len() - 4);
        buf.extend(partial);
        // Truncated trailing frame dropped, leading frame intact.
        let entries = decode_frames(&buf).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn candidate_list_ends_at_terminator() {
        let raw = vec![
            CandidateEntry { addr: 0x1000, pid: 7 },
            CandidateEntry { addr: 0x2000, pid: 7 },
            CandidateEntry { addr: 0, pid: 0 },
            CandidateEntry { addr: 0x3000, pid: 9 },
        ];
        let list = take_candidates(raw);
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|e| e.pid == 7));
    }

    struct ScriptedAgent(Vec<CandidateEntry>);

    impl AgentChannel for ScriptedAgent {
        fn exchange(&mut self, _req: Request) -> Result<Vec<CandidateEntry>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn bind_outcome_parsing() {
        let mut ok = ScriptedAgent(vec![CandidateEntry { addr: 0, pid: 0 }]);
        assert!(ok.bind(100).unwrap());
        let mut nok = ScriptedAgent(vec![CandidateEntry { addr: 0, pid: -1 }]);
        assert!(!nok.unbind(100).unwrap());
        let mut empty = ScriptedAgent(vec![]);
        assert!(!empty.bind(100).unwrap());
    }
}
