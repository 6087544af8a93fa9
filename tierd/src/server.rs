// SPDX-License-Identifier: GPL-2.0
//
// Local command socket. Clients push fixed-size bind/unbind records over a
// Unix stream connection; nothing is written back (feedback goes to the
// daemon's own console/stderr only). One connection is serviced at a time.

use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::agent::{OP_BIND, OP_UNBIND, REQUEST_LEN};
use crate::placement::PlacementEngine;

/// Accept-poll granularity; bounds how long shutdown can go unnoticed.
const ACCEPT_TICK_MS: u16 = 500;

/// Decode a raw command record: op_code, pid, mode (mode is carried for
/// wire compatibility with agent requests but unused here).
pub fn decode_request(buf: &[u8; REQUEST_LEN]) -> (i32, i32) {
    let op = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let pid = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
    (op, pid)
}

/// Bind the command socket. Called before thread spawn so a busy or
/// unwritable path is a fatal setup error, not a silently dead surface.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Error binding command socket {}", path.display()))?;
    Ok(listener)
}

fn handle_connection(stream: &mut UnixStream, engine: &PlacementEngine) {
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(ACCEPT_TICK_MS as u64))) {
        warn!("Failed to set socket read timeout: {}", e);
        return;
    }

    let mut buf = [0u8; REQUEST_LEN];
    while !engine.state.shutdown.is_set() {
        match stream.read_exact(&mut buf) {
            Ok(()) => {
                let (op, pid) = decode_request(&buf);
                match op {
                    OP_BIND => match engine.bind(pid) {
                        Ok(true) => println!("Bind request success (pid={}).", pid),
                        _ => eprintln!("Bind request failed (pid={}).", pid),
                    },
                    OP_UNBIND => match engine.unbind(pid) {
                        Ok(true) => println!("Unbind request success (pid={}).", pid),
                        _ => eprintln!("Unbind request failed (pid={}).", pid),
                    },
                    other => {
                        warn!("Unexpected request opcode {} on command socket", other);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("Error reading from command socket connection: {}", e);
                break;
            }
        }
    }
}

/// Socket thread body: poll for connections until shutdown, servicing each
/// accepted client sequentially.
pub fn run_server(listener: UnixListener, socket_path: &Path, engine: Arc<PlacementEngine>) {
    info!("Command socket listening on {}", socket_path.display());

    while !engine.state.shutdown.is_set() {
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ACCEPT_TICK_MS)) {
            Ok(0) => continue, // timeout: re-check shutdown
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("Error polling command socket: {}", e);
                break;
            }
        }

        match listener.accept() {
            Ok((mut stream, _)) => handle_connection(&mut stream, &engine),
            Err(e) => warn!("Failed accepting command socket connection: {}", e),
        }
    }

    let _ = std::fs::remove_file(socket_path);
}
