// SPDX-License-Identifier: GPL-2.0
//
// Bandwidth counter snapshots. An external collector rewrites a fixed-layout
// binary file with per-tier bandwidth in MB/s; we read it wholesale each
// poll and reject samples whose file mtime has not advanced.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

/// Six little-endian-native f32 values, in file order.
pub const SAMPLE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthSample {
    pub dram_reads: f32,
    pub dram_writes: f32,
    pub nvram_reads: f32,
    pub nvram_writes: f32,
    /// App-direct traffic only; the collector cannot isolate write traffic
    /// on mixed AD+MM configurations.
    pub nvram_app_bw: f32,
    pub nvram_mem_bw: f32,
}

impl BandwidthSample {
    /// Decode a raw record. Short reads decode as far as they go and leave
    /// the remaining fields zeroed.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut vals = [0f32; 6];
        for (i, v) in vals.iter_mut().enumerate() {
            let off = i * 4;
            if buf.len() >= off + 4 {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[off..off + 4]);
                *v = f32::from_ne_bytes(raw);
            }
        }
        Self {
            dram_reads: vals[0],
            dram_writes: vals[1],
            nvram_reads: vals[2],
            nvram_writes: vals[3],
            nvram_app_bw: vals[4],
            nvram_mem_bw: vals[5],
        }
    }

    pub fn dram_bw(&self) -> f32 {
        self.dram_reads + self.dram_writes
    }

    pub fn nvram_bw(&self) -> f32 {
        self.nvram_reads + self.nvram_writes
    }

    /// Every field must sit inside its tier's plausible range; the collector
    /// occasionally emits garbage while its own counters roll over.
    pub fn validate(&self, limits: &BwCeilings) -> bool {
        let dram_ok = |v: f32| (0.0..=limits.dram_max).contains(&v);
        let nvram_ok = |v: f32| (0.0..=limits.nvram_max).contains(&v);
        dram_ok(self.dram_reads)
            && dram_ok(self.dram_writes)
            && nvram_ok(self.nvram_reads)
            && nvram_ok(self.nvram_writes)
            && nvram_ok(self.nvram_app_bw)
            && nvram_ok(self.nvram_mem_bw)
    }
}

/// Sanity ceilings for sample validation, in MB/s.
#[derive(Debug, Clone, Copy)]
pub struct BwCeilings {
    pub dram_max: f32,
    pub nvram_max: f32,
}

#[derive(Debug, PartialEq)]
pub enum Poll {
    /// File missing, or mtime unchanged since the previous accepted poll.
    Stale,
    /// Fresh mtime but out-of-range contents.
    Invalid,
    Ready(BandwidthSample),
}

/// One per loop: each control loop tracks its own last-seen mtime, so a
/// sample consumed by one loop is still fresh for the other.
pub struct CounterFile {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl CounterFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: None,
        }
    }

    pub fn poll(&mut self, limits: &BwCeilings) -> Poll {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Poll::Stale;
        };
        let Ok(mtime) = meta.modified() else {
            return Poll::Stale;
        };
        if self.last_mtime == Some(mtime) {
            return Poll::Stale;
        }
        // A fresh mtime is consumed even when the contents turn out bad,
        // matching the collector's write cadence.
        self.last_mtime = Some(mtime);

        let sample = match fs::read(&self.path) {
            Ok(bytes) => {
                if bytes.len() < SAMPLE_LEN {
                    log::warn!(
                        "Short counter record ({} of {} bytes) in {}",
                        bytes.len(),
                        SAMPLE_LEN,
                        self.path.display()
                    );
                }
                BandwidthSample::from_bytes(&bytes)
            }
            Err(e) => {
                log::warn!("Error reading counter file {}: {}", self.path.display(), e);
                BandwidthSample::default()
            }
        };

        if sample.validate(limits) {
            Poll::Ready(sample)
        } else {
            Poll::Invalid
        }
    }
}
