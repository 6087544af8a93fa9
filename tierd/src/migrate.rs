// SPDX-License-Identifier: GPL-2.0
//
// Migration executor: spreads a candidate list across the destination
// tier's nodes by free capacity, then moves pages with batched
// move_pages(2) calls, falling back to single-page moves when a batch
// fails so one bad page cannot sink its whole run.

use std::io;
use std::sync::Arc;

use log::{debug, warn};

use crate::agent::CandidateEntry;
use crate::stats::Metrics;
use crate::tier::MigrationMode;
use crate::topology::TierTopology;

/// Seam over move_pages(2) so the executor is testable without root or a
/// second NUMA node.
pub trait PageMover: Send + Sync {
    fn move_pages(&self, pid: i32, addrs: &[u64], nodes: &[i32]) -> io::Result<()>;
}

/// Real syscall. The kernel takes per-page destination nodes and reports
/// per-page status, but like the agent we only act on the aggregate result:
/// any failure triggers the per-page fallback path.
pub struct MovePagesSyscall;

impl PageMover for MovePagesSyscall {
    fn move_pages(&self, pid: i32, addrs: &[u64], nodes: &[i32]) -> io::Result<()> {
        let pages: Vec<*mut libc::c_void> = addrs.iter().map(|&a| a as *mut libc::c_void).collect();
        let mut status = vec![0i32; addrs.len()];

        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                pid as libc::c_long,
                addrs.len() as libc::c_ulong,
                pages.as_ptr(),
                nodes.as_ptr(),
                status.as_mut_ptr(),
                0 as libc::c_int,
            )
        };

        match rc {
            0 => Ok(()),
            r if r < 0 => Err(io::Error::last_os_error()),
            r => Err(io::Error::other(format!("{} pages not migrated", r))),
        }
    }
}

pub struct Migrator {
    topo: Arc<dyn TierTopology>,
    mover: Arc<dyn PageMover>,
    metrics: Arc<Metrics>,
}

impl Migrator {
    pub fn new(topo: Arc<dyn TierTopology>, mover: Arc<dyn PageMover>, metrics: Arc<Metrics>) -> Self {
        Self {
            topo,
            mover,
            metrics,
        }
    }

    /// Move `candidates` into `mode`'s destination tier. Returns the number
    /// of pages actually migrated; per-page failures are logged and counted,
    /// never fatal. Candidates beyond the destination tier's free capacity
    /// are dropped without an attempt.
    pub fn migrate(&self, mode: MigrationMode, candidates: &[CandidateEntry]) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let Some(dest) = mode.dest_tier() else {
            return 0;
        };

        // Greedy capacity assignment: fill destination nodes in configured
        // order, each up to its current free page count.
        let mut dest_nodes: Vec<i32> = Vec::with_capacity(candidates.len());
        for &node in self.topo.nodes(dest) {
            if dest_nodes.len() == candidates.len() {
                break;
            }
            let avail = match self.topo.node_free_pages(node) {
                Ok(n) => n as usize,
                Err(e) => {
                    warn!("Skipping node {}: {}", node, e);
                    continue;
                }
            };
            let take = avail.min(candidates.len() - dest_nodes.len());
            dest_nodes.extend(std::iter::repeat(node as i32).take(take));
        }

        let assigned = dest_nodes.len();
        if assigned < candidates.len() {
            debug!(
                "{} tier can absorb only {} of {} candidates",
                dest,
                assigned,
                candidates.len()
            );
        }

        // The agent tends to group records by owner but does not promise to;
        // re-scan for contiguous same-pid runs and batch per run.
        let mut failures = 0usize;
        let mut start = 0usize;
        while start < assigned {
            let pid = candidates[start].pid;
            let mut end = start + 1;
            while end < assigned && candidates[end].pid == pid {
                end += 1;
            }

            let addrs: Vec<u64> = candidates[start..end].iter().map(|c| c.addr).collect();
            let nodes = &dest_nodes[start..end];
            if self.mover.move_pages(pid, &addrs, nodes).is_err() {
                // Retry one page at a time to salvage the rest of the run.
                for i in start..end {
                    let addr = candidates[i].addr;
                    if let Err(e) = self.mover.move_pages(pid, &[addr], &dest_nodes[i..i + 1]) {
                        warn!("Error migrating addr {:#x}, pid {}: {}", addr, pid, e);
                        failures += 1;
                    }
                }
            }

            start = end;
        }

        if failures > 0 {
            self.metrics
                .page_failures
                .fetch_add(failures as u64, std::sync::atomic::Ordering::Relaxed);
        }
        assigned - failures
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every syscall and fails batches containing a poisoned page.
    pub struct FakeMover {
        pub calls: Mutex<Vec<(i32, Vec<u64>, Vec<i32>)>>,
        pub failing_addrs: Vec<u64>,
    }

    impl FakeMover {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing_addrs: Vec::new(),
            }
        }

        pub fn failing(addrs: &[u64]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing_addrs: addrs.to_vec(),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl PageMover for FakeMover {
        fn move_pages(&self, pid: i32, addrs: &[u64], nodes: &[i32]) -> io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((pid, addrs.to_vec(), nodes.to_vec()));
            if addrs.iter().any(|a| self.failing_addrs.contains(a)) {
                return Err(io::Error::other("page busy"));
            }
            Ok(())
        }
    }
}
