// SPDX-License-Identifier: GPL-2.0
//
// Placement decisions. One engine instance is shared by the control loops
// and both command surfaces; every find-and-migrate sequence runs under the
// placement lock, every agent exchange under the comm lock (the mutex
// wrapping the channel).
//
// Loop bodies are plain functions over the engine so tests drive cycles
// directly without threads or timers; the run_* drivers only add the
// sleep/shutdown plumbing.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::agent::AgentChannel;
use crate::counters::{BwCeilings, CounterFile, Poll};
use crate::migrate::Migrator;
use crate::state::{Component, DaemonState};
use crate::stats::Metrics;
use crate::tier::{MigrationMode, Tier};
use crate::topology::{TierTopology, PAGE_SIZE};

/// Tunables for both loops; populated from the command line.
#[derive(Debug, Clone)]
pub struct PlacementParams {
    /// High-water marks triggering capacity migrations.
    pub dram_limit: f64,
    pub nvram_limit: f64,
    /// Usage levels the threshold loop steers towards.
    pub dram_target: f64,
    pub nvram_target: f64,
    /// Page cap per FIND request.
    pub max_find: i32,
    /// DRAM:NVRAM share of total traffic the balance loop aims for.
    pub bw_ratio: f32,
    /// Total-traffic noise floor below which balancing stays idle (MB/s).
    pub bw_floor: f32,
    /// Per-tier traffic ceilings the balancer must not push past (MB/s).
    pub dram_bw_limit: f32,
    pub nvram_bw_limit: f32,
    /// NVRAM write pressure that triggers writeback relief (MB/s).
    pub wr_threshold: f32,
    /// Mixed AD+MM configuration: write traffic cannot be isolated, fall
    /// back to app-direct bandwidth.
    pub pmm_mixed: bool,
    pub ceilings: BwCeilings,
    pub memcheck_interval: Duration,
    pub writecheck_interval: Duration,
    /// Settle time between the clear-dirty hint and the writeback FIND.
    pub clear_delay: Duration,
}

pub struct PlacementEngine {
    agent: Mutex<Box<dyn AgentChannel>>,
    migrator: Migrator,
    topo: Arc<dyn TierTopology>,
    pub state: Arc<DaemonState>,
    pub params: PlacementParams,
    pub metrics: Arc<Metrics>,
}

impl PlacementEngine {
    pub fn new(
        agent: Box<dyn AgentChannel>,
        topo: Arc<dyn TierTopology>,
        migrator: Migrator,
        state: Arc<DaemonState>,
        params: PlacementParams,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            agent: Mutex::new(agent),
            migrator,
            topo,
            state,
            params,
            metrics,
        }
    }

    /// FIND candidates and migrate them, as one unit under the placement
    /// lock. Returns the number of pages migrated.
    pub fn place(&self, count: i32, mode: MigrationMode) -> Result<usize> {
        let _placement = self.state.placement.lock().unwrap();
        self.place_locked(count, mode)
    }

    /// Body of `place` for callers already holding the placement lock.
    fn place_locked(&self, count: i32, mode: MigrationMode) -> Result<usize> {
        self.metrics.find_requests.fetch_add(1, Ordering::Relaxed);
        let candidates = {
            let mut agent = self.agent.lock().unwrap();
            match agent.find(count, mode) {
                Ok(c) => c,
                Err(e) => {
                    self.metrics.agent_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let migrated = self.migrator.migrate(mode, &candidates);
        if migrated > 0 {
            self.metrics
                .add_migrated(mode.dest_tier() == Some(Tier::Dram), migrated as u64);
        }
        Ok(migrated)
    }

    pub fn bind(&self, pid: i32) -> Result<bool> {
        self.metrics.binds.fetch_add(1, Ordering::Relaxed);
        self.agent.lock().unwrap().bind(pid)
    }

    pub fn unbind(&self, pid: i32) -> Result<bool> {
        self.metrics.unbinds.fetch_add(1, Ordering::Relaxed);
        self.agent.lock().unwrap().unbind(pid)
    }

    /// Zero-volume hint: ask the agent to flush dirty-page tracking before a
    /// writeback pass.
    fn clear_dirty(&self) -> Result<()> {
        let mut agent = self.agent.lock().unwrap();
        agent.find(0, MigrationMode::NvramClearDirty).map(|_| ())
    }

    /// One pass of the capacity/threshold balancer. Returns whether either
    /// tier sits above its high-water mark, plus this cycle's sleep
    /// multiplier.
    pub fn threshold_cycle(&self) -> (bool, u32) {
        self.metrics.thresh_cycles.fetch_add(1, Ordering::Relaxed);
        let p = &self.params;

        let (dram, nvram) = match (self.topo.tier_bytes(Tier::Dram), self.topo.tier_bytes(Tier::Nvram)) {
            (Ok(d), Ok(n)) if d.total > 0 && n.total > 0 => (d, n),
            (Err(e), _) | (_, Err(e)) => {
                warn!("memcheck: topology query failed: {:#}", e);
                return (false, 1);
            }
            _ => {
                warn!("memcheck: a tier reports zero capacity");
                return (false, 1);
            }
        };
        let dram_usage = dram.used_fraction();
        let nvram_usage = nvram.used_fraction();
        info!(
            "Current DRAM usage: {:.2}%  NVRAM usage: {:.2}%",
            dram_usage * 100.0,
            nvram_usage * 100.0
        );

        let mut mult = 1;
        if dram_usage > p.dram_limit && nvram_usage < p.nvram_target {
            let budget = ((dram_usage - p.dram_target) * dram.total as f64)
                .min((p.nvram_target - nvram_usage) * nvram.total as f64);
            let pages = page_budget(budget, p.max_find);
            match self.place(pages, MigrationMode::DramToNvram) {
                Ok(n) if n > 0 => {
                    mult = 3;
                    info!("DRAM->NVRAM: migrated {} out of {} pages", n, pages);
                }
                Ok(_) => {}
                Err(e) => warn!("memcheck: migration out of DRAM failed: {:#}", e),
            }
        } else if nvram_usage > p.nvram_limit && dram_usage < p.dram_target {
            let budget = ((nvram_usage - p.nvram_target) * nvram.total as f64)
                .min((p.dram_target - dram_usage) * dram.total as f64);
            let pages = page_budget(budget, p.max_find);
            match self.place(pages, MigrationMode::NvramToDram) {
                Ok(n) if n > 0 => {
                    mult = 3;
                    info!("NVRAM->DRAM: migrated {} out of {} pages", n, pages);
                }
                Ok(_) => {}
                Err(e) => warn!("memcheck: migration out of NVRAM failed: {:#}", e),
            }
        }

        let any_full = dram_usage > p.dram_limit || nvram_usage > p.nvram_limit;
        (any_full, mult)
    }

    /// One pass of the bandwidth balancer. Skips on stale or implausible
    /// counter data; otherwise drains whichever tier carries more than its
    /// optimal share. Returns the sleep multiplier.
    pub fn balance_cycle(&self, counters: &mut CounterFile) -> u32 {
        self.metrics.balance_cycles.fetch_add(1, Ordering::Relaxed);
        let p = &self.params;

        let md = match counters.poll(&p.ceilings) {
            Poll::Stale => {
                info!("memcheck: old or missing counter sample, ignoring");
                self.metrics.stale_skips.fetch_add(1, Ordering::Relaxed);
                return 1;
            }
            Poll::Invalid => {
                info!("memcheck: unexpected counter values, ignoring");
                return 1;
            }
            Poll::Ready(md) => md,
        };

        let dram_bw = md.dram_bw();
        let nvram_bw = md.nvram_bw();
        let tot_bw = dram_bw + nvram_bw;
        if tot_bw <= p.bw_floor {
            return 1;
        }

        let dram_opt_bw = tot_bw * p.bw_ratio / (1.0 + p.bw_ratio);
        let nvram_opt_bw = tot_bw / (1.0 + p.bw_ratio);
        let mut mult = 1;

        if dram_bw > dram_opt_bw && nvram_bw < p.nvram_bw_limit {
            let permill = ((dram_bw - dram_opt_bw) / dram_bw * 1000.0) as i32;
            match self.place(permill, MigrationMode::BalanceDram) {
                Ok(n) if n > 0 => {
                    mult = 3;
                    info!(
                        "DRAM->NVRAM: balanced {} pages out of {:.1}%",
                        n,
                        permill as f32 / 10.0
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("memcheck: balance out of DRAM failed: {:#}", e),
            }
        } else {
            // Draining NVRAM only helps if its "useful" traffic is real;
            // on mixed AD+MM setups only the app-direct share counts.
            let useful_bw = if p.pmm_mixed { md.nvram_app_bw } else { nvram_bw };
            if dram_bw < p.dram_bw_limit && useful_bw > 0.0 {
                let permill =
                    (((nvram_bw - nvram_opt_bw) / useful_bw * 1000.0) as i32).min(1000);
                match self.place(permill, MigrationMode::BalanceNvram) {
                    Ok(n) if n > 0 => {
                        mult = 3;
                        info!(
                            "NVRAM->DRAM: balanced {} pages out of {:.1}%",
                            n,
                            permill as f32 / 10.0
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("memcheck: balance out of NVRAM failed: {:#}", e),
                }
            }
        }

        mult
    }

    /// One pass of the write-pressure reliever. When NVRAM write traffic
    /// tops the threshold: clear-dirty hint, settle, then pull write-heavy
    /// pages into however much DRAM is free. Returns the sleep multiplier
    /// and whether the settle delay was spent (the driver deducts it).
    pub fn write_pressure_cycle(&self, counters: &mut CounterFile) -> (u32, bool) {
        self.metrics.writecheck_cycles.fetch_add(1, Ordering::Relaxed);
        let p = &self.params;

        let md = match counters.poll(&p.ceilings) {
            Poll::Stale => {
                info!("nvramwrchk: old or missing counter sample, ignoring");
                self.metrics.stale_skips.fetch_add(1, Ordering::Relaxed);
                return (1, false);
            }
            Poll::Invalid => {
                info!("nvramwrchk: unexpected counter values, ignoring");
                return (1, false);
            }
            Poll::Ready(md) => md,
        };

        let wr_bw = if p.pmm_mixed { md.nvram_app_bw } else { md.nvram_writes };
        if wr_bw <= p.wr_threshold {
            return (1, false);
        }

        let avail = self.topo.tier_free_pages(Tier::Dram).unwrap_or_else(|e| {
            warn!("nvramwrchk: topology query failed: {:#}", e);
            0
        });
        let n_find = (avail.min(p.max_find as u64)) as i32;

        let mut mult = 1;
        {
            let _placement = self.state.placement.lock().unwrap();
            if let Err(e) = self.clear_dirty() {
                warn!("nvramwrchk: clear-dirty hint failed: {:#}", e);
            }
            self.state.shutdown.sleep(p.clear_delay);
            match self.place_locked(n_find, MigrationMode::NvramWriteback) {
                Ok(n) if n > 0 => {
                    mult = 3;
                    info!("NVRAM->DRAM: sent {} out of {} write-heavy pages", n, n_find);
                }
                Ok(_) => {}
                Err(e) => warn!("nvramwrchk: writeback migration failed: {:#}", e),
            }
        }

        (mult, true)
    }
}

fn page_budget(bytes: f64, max_find: i32) -> i32 {
    ((bytes / *PAGE_SIZE as f64) as i64).clamp(0, max_find as i64) as i32
}

/// Capacity/threshold loop with the bandwidth balancer piggybacked on the
/// same thread; the balancer stands down any cycle a tier is full so the
/// two cannot fight over the same pages.
pub fn run_memcheck(engine: &PlacementEngine, counters: &mut CounterFile) {
    let state = &engine.state;
    while !state.shutdown.is_set() {
        let mut mult = 1u32;
        let mut any_full = false;

        if state.enabled(Component::Threshold) {
            let (full, m) = engine.threshold_cycle();
            any_full = full;
            mult = mult.max(m);
        }
        if state.enabled(Component::Balance) && !any_full {
            mult = mult.max(engine.balance_cycle(counters));
        }

        if !state.shutdown.sleep(engine.params.memcheck_interval * mult) {
            break;
        }
    }
}

/// Independent write-pressure relief loop.
pub fn run_writecheck(engine: &PlacementEngine, counters: &mut CounterFile) {
    let state = &engine.state;
    while !state.shutdown.is_set() {
        let mut sleep = engine.params.writecheck_interval;

        if state.enabled(Component::Writecheck) {
            let (mult, settled) = engine.write_pressure_cycle(counters);
            sleep *= mult;
            if settled {
                // The settle delay already counted against this cycle.
                sleep = sleep.saturating_sub(engine.params.clear_delay);
            }
        }

        if !state.shutdown.sleep(sleep) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CandidateEntry, Request, OP_BIND, OP_FIND, OP_UNBIND};
    use crate::migrate::testing::FakeMover;
    use crate::migrate::PageMover;
    use crate::topology::testing::FakeTopology;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    /// Scripted agent. Records every request; detects overlapping
    /// exchanges to prove the comm lock serializes them.
    struct FakeAgent {
        requests: Arc<Mutex<Vec<Request>>>,
        responses: Arc<Mutex<VecDeque<Vec<CandidateEntry>>>>,
        in_flight: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    #[derive(Clone)]
    struct AgentProbe {
        requests: Arc<Mutex<Vec<Request>>>,
        responses: Arc<Mutex<VecDeque<Vec<CandidateEntry>>>>,
        overlapped: Arc<AtomicBool>,
    }

    impl AgentProbe {
        fn ops(&self) -> Vec<(i32, i32, i32)> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| (r.op, r.arg, r.mode))
                .collect()
        }

        fn push_response(&self, entries: &[(u64, i32)]) {
            self.responses.lock().unwrap().push_back(
                entries
                    .iter()
                    .map(|&(addr, pid)| CandidateEntry { addr, pid })
                    .collect(),
            );
        }
    }

    fn fake_agent() -> (FakeAgent, AgentProbe) {
        let agent = FakeAgent {
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
        };
        let probe = AgentProbe {
            requests: agent.requests.clone(),
            responses: agent.responses.clone(),
            overlapped: agent.overlapped.clone(),
        };
        (agent, probe)
    }

    impl AgentChannel for FakeAgent {
        fn exchange(&mut self, req: Request) -> Result<Vec<CandidateEntry>> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            // Widen the race window; a second exchange slipping in here
            // would trip the overlap flag.
            std::thread::sleep(Duration::from_millis(1));
            self.requests.lock().unwrap().push(req);
            let resp = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            self.in_flight.store(false, Ordering::SeqCst);
            Ok(resp)
        }
    }

    fn test_params() -> PlacementParams {
        PlacementParams {
            dram_limit: 0.90,
            nvram_limit: 0.90,
            dram_target: 0.85,
            nvram_target: 0.70,
            max_find: 256,
            bw_ratio: 4.0,
            bw_floor: 100.0,
            dram_bw_limit: 150_000.0,
            nvram_bw_limit: 20_000.0,
            wr_threshold: 1000.0,
            pmm_mixed: false,
            ceilings: BwCeilings {
                dram_max: 200_000.0,
                nvram_max: 50_000.0,
            },
            memcheck_interval: Duration::from_millis(10),
            writecheck_interval: Duration::from_millis(10),
            clear_delay: Duration::from_millis(1),
        }
    }

    fn engine_with(topo: FakeTopology, agent: FakeAgent) -> Arc<PlacementEngine> {
        let topo: Arc<dyn TierTopology> = Arc::new(topo);
        let metrics = Arc::new(Metrics::default());
        let mover: Arc<dyn PageMover> = Arc::new(FakeMover::new());
        let migrator = Migrator::new(topo.clone(), mover, metrics.clone());
        let state = Arc::new(DaemonState::new(true, true, true));
        Arc::new(PlacementEngine::new(
            Box::new(agent),
            topo,
            migrator,
            state,
            test_params(),
            metrics,
        ))
    }

    fn write_sample(path: &std::path::Path, vals: [f32; 6]) {
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&bytes).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn threshold_drains_overfull_dram() {
        // DRAM at 95% (limit 90%), NVRAM at 50% (target 70%).
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(500, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[(0x1000, 7), (0x2000, 7)]);
        let engine = engine_with(topo, agent);

        let (any_full, mult) = engine.threshold_cycle();
        assert!(any_full);
        // Migration happened: next sleep is stretched.
        assert_eq!(mult, 3);

        let ops = probe.ops();
        assert_eq!(ops.len(), 1);
        // Positive budget: min(10% of DRAM, 20% of NVRAM) = 1000 pages,
        // capped at max_find.
        assert_eq!(ops[0], (OP_FIND, 256, MigrationMode::DramToNvram.wire()));
        assert_eq!(engine.metrics.pages_to_nvram.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn threshold_fills_underfull_dram() {
        // NVRAM at 95%, DRAM at 40%.
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(6_000, 10_000))],
            &[(1, FakeTopology::node(500, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[(0x1000, 9)]);
        let engine = engine_with(topo, agent);

        let (any_full, mult) = engine.threshold_cycle();
        assert!(any_full);
        assert_eq!(mult, 3);
        let ops = probe.ops();
        assert_eq!(ops[0].2, MigrationMode::NvramToDram.wire());
        assert_eq!(engine.metrics.pages_to_dram.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn threshold_idle_when_both_within_bounds() {
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        let engine = engine_with(topo, agent);

        let (any_full, mult) = engine.threshold_cycle();
        assert!(!any_full);
        assert_eq!(mult, 1);
        assert!(probe.ops().is_empty());
    }

    #[test]
    fn threshold_reports_full_when_both_tiers_over() {
        // Both tiers over their limits: neither branch has slack to move
        // into, but any_full must still suppress the balancer.
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(200, 10_000))],
            &[(1, FakeTopology::node(200, 10_000))],
        );
        let (agent, probe) = fake_agent();
        let engine = engine_with(topo, agent);

        let (any_full, _) = engine.threshold_cycle();
        assert!(any_full);
        assert!(probe.ops().is_empty());
    }

    #[test]
    fn balance_drains_dram_heavy_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        // 900 MB/s on DRAM, 100 on NVRAM; ratio 4 puts the optimum at 800.
        write_sample(&path, [600.0, 300.0, 60.0, 40.0, 0.0, 0.0]);
        let mut counters = CounterFile::new(path);

        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[(0x1000, 4)]);
        let engine = engine_with(topo, agent);

        let mult = engine.balance_cycle(&mut counters);
        assert_eq!(mult, 3);
        let ops = probe.ops();
        // (900 - 800) / 900 * 1000 = 111 permille.
        assert_eq!(ops[0], (OP_FIND, 111, MigrationMode::BalanceDram.wire()));
    }

    #[test]
    fn balance_drains_nvram_and_caps_permille() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        // NVRAM-heavy with a tiny app-direct share: permille caps at 1000.
        write_sample(&path, [80.0, 20.0, 700.0, 200.0, 50.0, 0.0]);
        let mut counters = CounterFile::new(path);

        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[(0x9000, 5)]);
        let mut engine = engine_with(topo, agent);
        Arc::get_mut(&mut engine).unwrap().params.pmm_mixed = true;

        let mult = engine.balance_cycle(&mut counters);
        assert_eq!(mult, 3);
        let ops = probe.ops();
        assert_eq!(ops[0], (OP_FIND, 1000, MigrationMode::BalanceNvram.wire()));
    }

    #[test]
    fn balance_skips_stale_sample_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        write_sample(&path, [600.0, 300.0, 60.0, 40.0, 0.0, 0.0]);
        let mut counters = CounterFile::new(path);

        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[(0x1000, 4)]);
        let engine = engine_with(topo, agent);

        engine.balance_cycle(&mut counters);
        let after_first = probe.ops().len();
        assert_eq!(after_first, 1);

        // Same mtime: both following cycles must skip without requests
        // while still counting as cycles.
        engine.balance_cycle(&mut counters);
        engine.balance_cycle(&mut counters);
        assert_eq!(probe.ops().len(), after_first);
        assert_eq!(engine.metrics.stale_skips.load(Ordering::Relaxed), 2);
        assert_eq!(engine.metrics.balance_cycles.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn balance_idle_below_noise_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        write_sample(&path, [20.0, 10.0, 5.0, 5.0, 0.0, 0.0]);
        let mut counters = CounterFile::new(path);

        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        let engine = engine_with(topo, agent);

        assert_eq!(engine.balance_cycle(&mut counters), 1);
        assert!(probe.ops().is_empty());
    }

    #[test]
    fn writecheck_clears_then_pulls_write_heavy_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        // NVRAM writes over the 1000 MB/s threshold.
        write_sample(&path, [100.0, 50.0, 500.0, 2_000.0, 0.0, 0.0]);
        let mut counters = CounterFile::new(path);

        // 40 free DRAM pages cap the writeback FIND.
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(40, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        probe.push_response(&[]); // clear-dirty reply
        probe.push_response(&[(0x7000, 3), (0x8000, 3)]);
        let engine = engine_with(topo, agent);

        let (mult, settled) = engine.write_pressure_cycle(&mut counters);
        assert_eq!(mult, 3);
        assert!(settled);

        let ops = probe.ops();
        assert_eq!(ops.len(), 2);
        // Hint first, zero volume; then the capped writeback FIND.
        assert_eq!(ops[0], (OP_FIND, 0, MigrationMode::NvramClearDirty.wire()));
        assert_eq!(ops[1], (OP_FIND, 40, MigrationMode::NvramWriteback.wire()));
    }

    #[test]
    fn writecheck_idle_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memdata");
        write_sample(&path, [100.0, 50.0, 500.0, 900.0, 0.0, 0.0]);
        let mut counters = CounterFile::new(path);

        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(40, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        let engine = engine_with(topo, agent);

        let (mult, settled) = engine.write_pressure_cycle(&mut counters);
        assert_eq!((mult, settled), (1, false));
        assert!(probe.ops().is_empty());
    }

    #[test]
    fn concurrent_commands_never_interleave_exchanges() {
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, probe) = fake_agent();
        let engine = engine_with(topo, agent);

        let mut handles = Vec::new();
        for t in 0..2 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    let pid = 100 + t * 50 + i;
                    if t == 0 {
                        let _ = engine.bind(pid);
                    } else {
                        let _ = engine.unbind(pid);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(!probe.overlapped.load(Ordering::SeqCst));
        let ops = probe.ops();
        assert_eq!(ops.len(), 20);
        assert!(ops.iter().all(|&(op, ..)| op == OP_BIND || op == OP_UNBIND));
    }

    #[test]
    fn memcheck_loop_exits_promptly_on_shutdown() {
        let topo = FakeTopology::new(
            &[(0, FakeTopology::node(5_000, 10_000))],
            &[(1, FakeTopology::node(5_000, 10_000))],
        );
        let (agent, _probe) = fake_agent();
        let engine = engine_with(topo, agent);
        let mut counters = CounterFile::new(std::path::PathBuf::from("/nonexistent"));

        engine.state.shutdown.trigger();
        let start = std::time::Instant::now();
        run_memcheck(&engine, &mut counters);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
