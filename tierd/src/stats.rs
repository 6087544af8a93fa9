// SPDX-License-Identifier: GPL-2.0
//
// Daemon counters, exposed through the console `stats` command.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

/// Live counters, bumped from every thread.
#[derive(Debug, Default)]
pub struct Metrics {
    pub pages_to_nvram: AtomicU64,
    pub pages_to_dram: AtomicU64,
    pub page_failures: AtomicU64,
    pub find_requests: AtomicU64,
    pub agent_errors: AtomicU64,
    pub binds: AtomicU64,
    pub unbinds: AtomicU64,
    pub thresh_cycles: AtomicU64,
    pub balance_cycles: AtomicU64,
    pub writecheck_cycles: AtomicU64,
    pub stale_skips: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pages_to_nvram: self.pages_to_nvram.load(Ordering::Relaxed),
            pages_to_dram: self.pages_to_dram.load(Ordering::Relaxed),
            page_failures: self.page_failures.load(Ordering::Relaxed),
            find_requests: self.find_requests.load(Ordering::Relaxed),
            agent_errors: self.agent_errors.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            unbinds: self.unbinds.load(Ordering::Relaxed),
            thresh_cycles: self.thresh_cycles.load(Ordering::Relaxed),
            balance_cycles: self.balance_cycles.load(Ordering::Relaxed),
            writecheck_cycles: self.writecheck_cycles.load(Ordering::Relaxed),
            stale_skips: self.stale_skips.load(Ordering::Relaxed),
        }
    }

    pub fn add_migrated(&self, to_dram: bool, pages: u64) {
        if to_dram {
            self.pages_to_dram.fetch_add(pages, Ordering::Relaxed);
        } else {
            self.pages_to_nvram.fetch_add(pages, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of the counters, serializable for the JSON dump.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub pages_to_nvram: u64,
    pub pages_to_dram: u64,
    pub page_failures: u64,
    pub find_requests: u64,
    pub agent_errors: u64,
    pub binds: u64,
    pub unbinds: u64,
    pub thresh_cycles: u64,
    pub balance_cycles: u64,
    pub writecheck_cycles: u64,
    pub stale_skips: u64,
}

impl Snapshot {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::DAEMON_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ migrated: →DRAM {:>8}  →NVRAM {:>8}  failed {:>6}",
            self.pages_to_dram, self.pages_to_nvram, self.page_failures
        )?;
        writeln!(
            w,
            "│ agent: find {:>6}  bind {:>4}  unbind {:>4}  errors {:>4}",
            self.find_requests, self.binds, self.unbinds, self.agent_errors
        )?;
        writeln!(
            w,
            "│ cycles: thresh {:>6}  bal {:>6}  wrchk {:>6}  stale skips {:>6}",
            self.thresh_cycles, self.balance_cycles, self.writecheck_cycles, self.stale_skips
        )?;
        writeln!(w, "└─")?;
        Ok(())
    }
}
