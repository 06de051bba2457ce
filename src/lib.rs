// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

pub mod cli;
pub mod cond;
pub mod conf;
pub mod control;
pub mod event;
pub mod logger;
pub mod netlink;
pub mod pidfile;
pub mod plugin;
pub mod service;
pub mod signals;
pub mod spawn;
pub mod step;
pub mod tunables;
pub mod utils;

use cond::CondStore;
use plugin::Plugin;
use service::{RUNLEVEL_S, Registry};
use signals::SigSet;
use tunables::Tunables;

/// The phase the supervisor itself is in. Shutdown is not immediate:
/// once a halt or reboot has been requested we keep driving the loop
/// until every supervised process has been stopped and reaped, and
/// only then hand the machine back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Booting,
    Running,
    /// Halting (runlevel 0) or rebooting (runlevel 6); the payload is
    /// the target runlevel.
    Shutdown(u8),
}

/// Process-wide supervisor context.
///
/// There is one init per process, so the registry and the condition
/// store are de-facto singletons; keeping them behind this struct
/// (instead of statics) is what lets the tests build isolated
/// instances.
pub struct Init {
    pub registry: Registry,
    pub conds: CondStore,
    pub plugins: Vec<Plugin>,
    pub tunables: Tunables,
    pub phase: InitPhase,
    /// Current runlevel; exactly one at any time.
    pub runlevel: u8,
    pub prev_runlevel: u8,
    /// Runlevel to settle in after single-user boot, from the config
    /// file's `runlevel` directive (or the command line).
    pub boot_runlevel: u8,
    /// Signal mask the process was started with; children are restored
    /// to it between fork and exec.
    pub orig_sigset: SigSet,
    pub conf_path: PathBuf,
    /// Root of the pidfile watch tree (`/run` on a real system).
    pub rundir: PathBuf,
    /// Well-known FIFO the control clients talk to.
    pub control_path: PathBuf,
    kicked: bool,
}

impl Init {
    pub fn new(
        conf_path: PathBuf,
        rundir: PathBuf,
        cond_dir: PathBuf,
        tunables: Tunables,
        orig_sigset: SigSet,
    ) -> Self {
        Self {
            registry: Registry::new(),
            conds: CondStore::new(cond_dir),
            plugins: Vec::new(),
            tunables,
            phase: InitPhase::Booting,
            runlevel: RUNLEVEL_S,
            prev_runlevel: RUNLEVEL_S,
            boot_runlevel: 2,
            orig_sigset,
            conf_path,
            control_path: rundir.join("primus/control"),
            rundir,
            kicked: false,
        }
    }

    /// Request a reconciliation pass. The main loop runs `step_all`
    /// once the current handler batch has drained.
    #[inline(always)]
    pub fn kick(&mut self) {
        self.kicked = true;
    }

    /// Consume the pending kick, if any. Condition store mutations
    /// count as kicks too.
    pub fn take_kick(&mut self) -> bool {
        let kicked = self.kicked || self.conds.take_kick();
        self.kicked = false;
        kicked
    }
}
