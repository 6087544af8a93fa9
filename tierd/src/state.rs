// SPDX-License-Identifier: GPL-2.0
//
// Process-wide daemon state: component activation flags, the placement lock
// and the cooperative shutdown token every thread polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Cooperative shutdown flag. Loops poll `is_set()` at the top of each cycle
/// and sleep through `sleep()`, which returns early once shutdown triggers so
/// a long interval cannot delay exit by a full period.
pub struct ShutdownToken {
    flag: AtomicBool,
    lock: Mutex<bool>,
    cvar: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            lock: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        if let Ok(mut done) = self.lock.lock() {
            *done = true;
        }
        self.cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Sleep up to `dur`. Returns false if shutdown triggered before or
    /// during the wait.
    pub fn sleep(&self, dur: Duration) -> bool {
        let Ok(mut done) = self.lock.lock() else {
            return false;
        };
        let deadline = std::time::Instant::now() + dur;
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            match self.cvar.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => done = guard,
                Err(_) => return false,
            }
        }
        false
    }
}

/// Which periodic component a toggle command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Threshold,
    Balance,
    Writecheck,
}

impl Component {
    pub fn label(self) -> &'static str {
        match self {
            Component::Threshold => "Threshold",
            Component::Balance => "Balance",
            Component::Writecheck => "Nvram write check",
        }
    }
}

pub struct DaemonState {
    pub shutdown: ShutdownToken,
    thresh_on: AtomicBool,
    balance_on: AtomicBool,
    writecheck_on: AtomicBool,
    /// Serializes every decide-and-migrate sequence: a control loop and a
    /// manual command can never race a migration.
    pub placement: Mutex<()>,
}

impl DaemonState {
    pub fn new(thresh: bool, balance: bool, writecheck: bool) -> Self {
        Self {
            shutdown: ShutdownToken::new(),
            thresh_on: AtomicBool::new(thresh),
            balance_on: AtomicBool::new(balance),
            writecheck_on: AtomicBool::new(writecheck),
            placement: Mutex::new(()),
        }
    }

    pub fn enabled(&self, comp: Component) -> bool {
        self.flag(comp).load(Ordering::Relaxed)
    }

    /// Flip one component and return its new state.
    pub fn toggle(&self, comp: Component) -> bool {
        !self.flag(comp).fetch_xor(true, Ordering::Relaxed)
    }

    fn flag(&self, comp: Component) -> &AtomicBool {
        match comp {
            Component::Threshold => &self.thresh_on,
            Component::Balance => &self.balance_on,
            Component::Writecheck => &self.writecheck_on,
        }
    }
}
