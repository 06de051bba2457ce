// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::time::Instant;

use crate::cond::CondState;
use crate::conf::{self, ConfError};
use crate::plugin::{self, HookPoint};
use crate::service::{SvcKind, SvcState};
use crate::spawn;
use crate::utils::crash_signal;
use crate::{Init, InitPhase};

/// Upper bound on state-machine states, used to bound the fixed-point
/// loop
const STATE_COUNT: usize = 8;

/// What a record's gate demands of it.
///
/// `Stop` means the record must not run here (runlevel mismatch, a
/// condition OFF or missing, operator hold, pending reconfiguration).
/// `Pause` comes from FLUX conditions: no new start, but a running
/// process is left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Go,
    Pause,
    Stop,
}

/// Evaluate the gate of record `idx`: runlevel membership and the
/// conjunction of its start conditions
pub fn gate_of(init: &Init, idx: usize) -> Gate {
    let svc = match init.registry.get(idx) {
        Some(svc) => svc,
        None => return Gate::Stop,
    };
    if svc.doomed || svc.paused || svc.dirty {
        return Gate::Stop;
    }
    if !svc.runlevels.contains(init.runlevel) {
        return Gate::Stop;
    }
    let mut paused = false;
    for cond in &svc.conditions {
        match init.conds.get(cond) {
            Some(CondState::On) => {}
            Some(CondState::Flux) => paused = true,
            // referencing a condition never creates one; missing
            // reads as off
            Some(CondState::Off) | None => return Gate::Stop,
        }
    }
    if paused { Gate::Pause } else { Gate::Go }
}

/// A `run` in its launch window serializes the startup sequence:
/// later `run`/`task` records wait until it is underway or done
#[inline(always)]
fn blocks_followers(kind: SvcKind, state: SvcState) -> bool {
    kind == SvcKind::Run
        && matches!(state, SvcState::Setup | SvcState::Starting)
}

/// Whether this record may leave halted for setup right now; the
/// kind-specific once-rules live here
fn start_allowed(init: &Init, idx: usize) -> bool {
    let svc = init.registry.get(idx).unwrap();
    match svc.identity.kind {
        SvcKind::Run => !svc.ran_levels.contains(init.runlevel),
        SvcKind::Task => !svc.task_done,
        _ => true,
    }
}

/// Advance every record until a full pass fires no edge. This is the
/// single reconciliation point: every handler funnels into it via the
/// kick flag. Termination is bounded because each edge either
/// strictly advances a record around its cycle or parks it behind a
/// deadline
pub fn step_all(init: &mut Init) {
    step_kinds(init, None)
}

/// `step_all` restricted to a subset of kinds; used during early boot
/// to give `run`/`task` records the single-user stage to themselves
pub fn step_kinds(init: &mut Init, kinds: Option<&[SvcKind]>) {
    let now = Instant::now();
    let max_edges = (init.registry.len() + 1) * STATE_COUNT * 2;
    let mut total = 0;
    loop {
        let mut fired = 0;
        let mut barrier = false;
        for idx in init.registry.indexes() {
            let svc = init.registry.get(idx).unwrap();
            let kind = svc.identity.kind;
            if kinds.is_some_and(|kinds| !kinds.contains(&kind)) {
                continue;
            }
            let launchable = matches!(
                svc.state,
                SvcState::Halted | SvcState::Conditional | SvcState::Crashed
            );
            if barrier && kind.is_oneshot() && launchable {
                continue;
            }
            if step_one(init, idx, now) {
                fired += 1;
            }
            let svc = init.registry.get(idx).unwrap();
            if blocks_followers(kind, svc.state) {
                barrier = true;
            }
        }
        total += fired;
        if fired == 0 {
            break;
        }
        if total > max_edges {
            log::error!("step_all did not quiesce, giving up this pass");
            break;
        }
    }
}

/// Advance record `idx` by at most one edge. Returns whether an edge
/// fired
fn step_one(init: &mut Init, idx: usize, now: Instant) -> bool {
    let gate = gate_of(init, idx);
    let svc = init.registry.get_mut(idx).unwrap();
    let runlevel_ok =
        !svc.doomed && !svc.paused && svc.runlevels.contains(init.runlevel);

    match svc.state {
        SvcState::Halted => {
            if svc.dirty {
                // a stopped record can take its new configuration on
                // the spot
                svc.dirty = false;
                return true;
            }
            if !runlevel_ok {
                svc.task_done = false;
                return false;
            }
            if !start_allowed(init, idx) {
                // already ran this window/level; rests here
                return false;
            }
            if gate == Gate::Go {
                enter_setup(init, idx);
                return true;
            }
            // eligible by runlevel, held by a condition
            let svc = init.registry.get_mut(idx).unwrap();
            svc.state = SvcState::Conditional;
            true
        }
        SvcState::Conditional => {
            if !runlevel_ok {
                svc.state = SvcState::Halted;
                svc.task_done = false;
                return true;
            }
            if gate == Gate::Stop {
                // the window closed; a task may run again next time
                // the gate opens
                svc.task_done = false;
            }
            if gate == Gate::Go && start_allowed(init, idx) {
                enter_setup(init, idx);
                return true;
            }
            false
        }
        SvcState::Setup => {
            if gate != Gate::Go {
                // cancelled before fork: nothing to tear down
                svc.state = SvcState::Halted;
                return true;
            }
            launch(init, idx, now);
            true
        }
        SvcState::Starting => {
            if gate == Gate::Stop {
                begin_stop(init, idx, now);
                return true;
            }
            if svc.is_forking() {
                if pidfile_ready(init, idx) {
                    adopt_pidfile_pid(init, idx);
                    return true;
                }
                let svc = init.registry.get_mut(idx).unwrap();
                if svc.deadline.is_some_and(|d| now >= d) {
                    log::error!(
                        "'{}': pidfile never appeared, giving up",
                        svc.identity
                    );
                    // the launcher is killed outright; its reap finds
                    // no registry entry and is dropped on the floor
                    if let Some(pid) = svc.pid.take() {
                        let _ = spawn::send_signal(pid, libc::SIGKILL);
                        init.registry.unregister_pid(pid);
                    }
                    park_crashed(init, idx, now);
                    return true;
                }
                return false;
            }
            enter_running(init, idx);
            true
        }
        SvcState::Running => {
            if svc.pid.is_none() && svc.identity.kind == SvcKind::Inetd {
                if gate == Gate::Stop {
                    // dropping the listener also removes it from the
                    // reactor
                    svc.listener = None;
                    svc.state = SvcState::Halted;
                    let cond = svc.identity.cond_name();
                    init.conds.clear(&cond);
                    return true;
                }
                return false;
            }
            if gate == Gate::Stop {
                begin_stop(init, idx, now);
                return true;
            }
            false
        }
        SvcState::Stopping => {
            if svc.deadline.is_some_and(|d| now >= d) {
                if let Some(pid) = svc.pid {
                    log::warn!(
                        "'{}' ignored SIGTERM, killing pid {}",
                        svc.identity,
                        pid.as_raw_nonzero()
                    );
                    let _ = spawn::send_signal(pid, libc::SIGKILL);
                }
                svc.state = SvcState::Halting;
                svc.deadline =
                    Some(now + init.tunables.kill_timeout());
                return true;
            }
            false
        }
        SvcState::Halting => {
            if svc.pid.is_none() {
                svc.state = SvcState::Halted;
                svc.deadline = None;
                return true;
            }
            false
        }
        SvcState::Crashed => {
            match gate {
                Gate::Stop => {
                    // the gate toggled; release the park and let the
                    // halted path decide fresh
                    svc.state = SvcState::Halted;
                    svc.deadline = None;
                    svc.exits_in_window = 0;
                    svc.window_start = None;
                    true
                }
                Gate::Go => {
                    if svc.deadline.is_none_or(|d| now >= d) {
                        if svc.exits_in_window > init.tunables.respawn_limit {
                            // window elapsed; counter starts over
                            svc.exits_in_window = 0;
                            svc.window_start = None;
                        }
                        enter_setup(init, idx);
                        return true;
                    }
                    false
                }
                Gate::Pause => false,
            }
        }
    }
}

/// Pre-start: run the SVC_START hook, then the next pass forks
fn enter_setup(init: &mut Init, idx: usize) {
    init.registry.get_mut(idx).unwrap().state = SvcState::Setup;
    plugin::run_hook(init, HookPoint::SvcStart, Some(idx));
}

fn launch(init: &mut Init, idx: usize, now: Instant) {
    let svc = init.registry.get(idx).unwrap();
    if svc.identity.kind == SvcKind::Inetd {
        let port = svc.port.unwrap_or(0);
        match spawn::open_listener(port) {
            Ok(listener) => {
                let svc = init.registry.get_mut(idx).unwrap();
                svc.listener = Some(listener);
                svc.state = SvcState::Running;
                let cond = svc.identity.cond_name();
                init.conds.set(&cond);
                log::info!(
                    "inetd '{}' listening on tcp/{}",
                    init.registry.get(idx).unwrap().identity,
                    port
                );
            }
            Err(e) => {
                log::error!("inetd listener tcp/{}: {}", port, e);
                park_crashed(init, idx, now);
            }
        }
        return;
    }

    let orig_sigset = init.orig_sigset.clone();
    let svc = init.registry.get(idx).unwrap();
    match spawn::start(svc, &orig_sigset) {
        Ok(pid) => {
            let forking = svc.is_forking();
            let svc = init.registry.get_mut(idx).unwrap();
            svc.pid = Some(pid);
            svc.state = SvcState::Starting;
            svc.deadline = forking
                .then(|| now + init.tunables.pidfile_timeout());
            init.registry.register_pid(pid, idx);
            log::info!(
                "started '{}' as pid {}",
                init.registry.get(idx).unwrap().identity,
                pid.as_raw_nonzero()
            );
        }
        Err(e) => {
            log::error!(
                "failed to start '{}': {}",
                svc.identity,
                e
            );
            park_crashed(init, idx, now);
        }
    }
}

fn enter_running(init: &mut Init, idx: usize) {
    let svc = init.registry.get_mut(idx).unwrap();
    svc.state = SvcState::Running;
    svc.deadline = None;
    if svc.identity.kind.is_daemon() {
        let cond = svc.identity.cond_name();
        init.conds.set(&cond);
    }
}

/// The record's `pid/*` condition as maintained by the pidfile
/// watcher
fn pidfile_ready(init: &Init, idx: usize) -> bool {
    let svc = init.registry.get(idx).unwrap();
    match svc.pid_cond() {
        Some(cond) => init.conds.get(&cond) == Some(CondState::On),
        None => false,
    }
}

/// The daemon forked away from our launch child; its pidfile now
/// carries the pid we actually supervise
fn adopt_pidfile_pid(init: &mut Init, idx: usize) {
    let svc = init.registry.get(idx).unwrap();
    let Some(pidfile) = svc.pidfile.clone() else {
        return;
    };
    let raw = std::fs::read_to_string(&pidfile)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .filter(|&raw| raw > 0);
    let Some(raw) = raw else {
        log::debug!("'{}': pidfile not parsable yet", svc.identity);
        return;
    };
    let pid = unsafe { rustix::process::Pid::from_raw_unchecked(raw) };
    if spawn::send_signal(pid, 0).is_err() {
        log::warn!(
            "'{}': pidfile names dead pid {}, still waiting",
            svc.identity,
            raw
        );
        return;
    }
    if let Some(launcher) = svc.pid {
        init.registry.unregister_pid(launcher);
    }
    let svc = init.registry.get_mut(idx).unwrap();
    svc.pid = Some(pid);
    init.registry.register_pid(pid, idx);
    log::info!(
        "'{}' daemonized, supervising pid {}",
        init.registry.get(idx).unwrap().identity,
        raw
    );
    enter_running(init, idx);
}

/// Initiate teardown: clear the provided condition, signal the
/// process and arm the kill timer. ttys skip the grace period
fn begin_stop(init: &mut Init, idx: usize, now: Instant) {
    plugin::run_hook(init, HookPoint::SvcStop, Some(idx));
    let kill_timeout = init.tunables.kill_timeout();
    let svc = init.registry.get_mut(idx).unwrap();
    let cond = svc.identity.cond_name();
    match svc.pid {
        Some(pid) => {
            let sig = spawn::stop_signal(svc);
            if let Err(e) = spawn::send_signal(pid, sig) {
                log::warn!("stopping '{}': {}", svc.identity, e);
            }
            svc.state = if sig == libc::SIGKILL {
                SvcState::Halting
            } else {
                SvcState::Stopping
            };
            svc.deadline = Some(now + kill_timeout);
        }
        None => {
            svc.state = SvcState::Halted;
            svc.deadline = None;
        }
    }
    init.conds.clear(&cond);
}

/// Park a record in crashed and account the exit against the respawn
/// window
pub(crate) fn park_crashed(init: &mut Init, idx: usize, now: Instant) {
    let window = init.tunables.respawn_window();
    let limit = init.tunables.respawn_limit;
    let cooldown = match init.registry.get(idx).unwrap().identity.kind {
        SvcKind::Tty => std::time::Duration::ZERO,
        _ => init.tunables.restart_cooldown(),
    };
    let throttle = init.tunables.tty_throttle();
    let svc = init.registry.get_mut(idx).unwrap();

    match svc.window_start {
        Some(start) if now.duration_since(start) < window => {
            svc.exits_in_window += 1;
        }
        _ => {
            svc.window_start = Some(now);
            svc.exits_in_window = 1;
        }
    }
    svc.state = SvcState::Crashed;
    svc.deadline = if svc.exits_in_window > limit {
        log::warn!(
            "'{}' is crash-looping ({} exits), holding it down",
            svc.identity,
            svc.exits_in_window
        );
        match svc.identity.kind {
            SvcKind::Tty => Some(now + throttle),
            _ => Some(svc.window_start.unwrap() + window),
        }
    } else {
        Some(now + cooldown)
    };
    let cond = svc.identity.cond_name();
    init.conds.clear(&cond);
}

/// Operator-initiated stop of an active record; RESTART leans on the
/// gate to bring it back once the reap lands
pub(crate) fn stop_record(init: &mut Init, idx: usize) {
    let svc = match init.registry.get(idx) {
        Some(svc) => svc,
        None => return,
    };
    if matches!(
        svc.state,
        SvcState::Setup
            | SvcState::Starting
            | SvcState::Running
            | SvcState::Crashed
    ) {
        if svc.identity.kind == SvcKind::Inetd && svc.pid.is_none() {
            let svc = init.registry.get_mut(idx).unwrap();
            svc.listener = None;
            svc.state = SvcState::Halted;
            let cond = svc.identity.cond_name();
            init.conds.clear(&cond);
            return;
        }
        begin_stop(init, idx, Instant::now());
    }
}

/// Drain every zombie and translate each exit into registry state.
/// Children that daemonized under us (or inetd handlers) may not map
/// to a record; those are only reaped
pub fn handle_sigchld(init: &mut Init) -> io::Result<()> {
    let now = Instant::now();
    while let Some((pid, status)) = spawn::reap_next()? {
        let Some(idx) = init.registry.lookup_pid(pid) else {
            log::debug!("reaped unmanaged pid {}", pid.as_raw_nonzero());
            continue;
        };
        init.registry.unregister_pid(pid);
        reap_record(init, idx, status, now);
    }
    init.kick();
    Ok(())
}

fn reap_record(init: &mut Init, idx: usize, status: i32, now: Instant) {
    let runlevel = init.runlevel;
    let svc = init.registry.get_mut(idx).unwrap();
    svc.pid = None;
    svc.last_exit = Some(status);

    let clean = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
    let fault = if libc::WIFSIGNALED(status) {
        crash_signal(libc::WTERMSIG(status))
    } else {
        None
    };
    match fault {
        Some(name) => {
            log::warn!("'{}' crashed with {}", svc.identity, name);
        }
        None => {
            log::debug!("'{}' exited, status {:#x}", svc.identity, status);
        }
    }

    let kind = svc.identity.kind;
    let forking = svc.is_forking();
    match svc.state {
        SvcState::Stopping | SvcState::Halting | SvcState::Setup => {
            svc.state = SvcState::Halted;
            svc.deadline = None;
            let cond = svc.identity.cond_name();
            init.conds.clear(&cond);
        }
        SvcState::Starting if forking => {
            // the launcher detaching is the expected path; a non-zero
            // exit here is a failed start
            if !clean {
                park_crashed(init, idx, now);
            }
        }
        SvcState::Starting | SvcState::Running if kind.is_oneshot() => {
            match kind {
                SvcKind::Task => svc.task_done = true,
                _ => svc.ran_levels.insert(runlevel),
            }
            svc.state = SvcState::Halted;
            let cond = svc.identity.cond_name();
            if clean {
                init.conds.set(&cond);
            } else {
                init.conds.clear(&cond);
            }
        }
        SvcState::Starting | SvcState::Running => {
            park_crashed(init, idx, now);
        }
        _ => {
            svc.state = SvcState::Halted;
            svc.deadline = None;
        }
    }
}

/// Whether any armed per-record deadline is due; the periodic tick
/// kicks a pass when one is
pub fn deadlines_due(init: &Init, now: Instant) -> bool {
    init.registry
        .iter()
        .any(|svc| svc.deadline.is_some_and(|d| now >= d))
}

/// All processes stopped and listeners closed; shutdown can finish
pub fn shutdown_complete(init: &Init) -> bool {
    matches!(init.phase, InitPhase::Shutdown(_))
        && init
            .registry
            .iter()
            .all(|svc| svc.pid.is_none() && svc.listener.is_none())
}

/// Change the current runlevel. Stopping and starting is not done
/// here; membership feeds the gates and `step_all` does the rest
pub fn set_runlevel(init: &mut Init, level: u8) {
    if level == init.runlevel {
        return;
    }
    log::info!("runlevel {} -> {}", init.runlevel, level);
    init.prev_runlevel = init.runlevel;
    init.runlevel = level;
    if matches!(level, 0 | 6) {
        init.phase = InitPhase::Shutdown(level);
    }
    // a `run` record fires once per occupancy of a level; re-entering
    // re-arms it
    for svc in init.registry.iter_mut() {
        if svc.identity.kind == SvcKind::Run {
            svc.ran_levels.remove(level);
        }
    }
    init.kick();
}

/// First configuration load at boot. Unlike reload there is nothing
/// to diff against or to reassert
pub fn load_config(init: &mut Init) -> Result<(), ConfError> {
    let parsed = conf::parse_file(&init.conf_path, &init.rundir)?;
    if let Some(level) = parsed.runlevel {
        init.boot_runlevel = level;
    }
    conf::apply(&mut init.registry, &parsed, init.conds.generation());
    init.registry.clear_changed();
    init.kick();
    Ok(())
}

/// Reload configuration and reconcile without bouncing unchanged
/// services.
///
/// A parse error rejects the whole reload; the running generation
/// stays live. Otherwise previously-on conditions go to flux via the
/// generation bump, the registry is re-applied and swept, producers
/// revalidate what still holds (the SVC_RECONF hook), and whatever
/// stays stale is dropped
pub fn reload(init: &mut Init) {
    log::info!("reloading configuration");
    let parsed = match conf::parse_file(&init.conf_path, &init.rundir) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::error!("new configuration rejected: {}", e);
            return;
        }
    };
    init.conds.begin_reload();
    init.registry.clear_changed();
    init.registry.mark_all_dirty();
    conf::apply(&mut init.registry, &parsed, init.conds.generation());
    if let Some(level) = parsed.runlevel {
        init.boot_runlevel = level;
    }
    let dropped = init.registry.sweep_dirty();
    if dropped > 0 {
        log::info!("{} record(s) left the configuration", dropped);
    }
    plugin::run_hook(init, HookPoint::SvcReconf, None);
    reassert(init);
    init.conds.sweep_stale();
    init.kick();
}

/// Re-establish the conditions provided by records that survived the
/// reload untouched, so they don't read as flux and nothing bounces.
/// The entry keeps whatever state it had; revalidation only says the
/// provider still exists
fn reassert(init: &mut Init) {
    for idx in init.registry.indexes() {
        let svc = init.registry.get(idx).unwrap();
        if svc.changed || svc.doomed {
            continue;
        }
        let cond = svc.identity.cond_name();
        init.conds.validate(&cond);
        let svc = init.registry.get(idx).unwrap();
        let running = matches!(
            svc.state,
            SvcState::Running | SvcState::Stopping | SvcState::Halting
        );
        if running {
            if let (Some(pidfile), Some(cond)) =
                (svc.pidfile.clone(), svc.pid_cond())
            {
                if pidfile.exists() {
                    init.conds.validate(&cond);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Identity, Runlevels, Service, SvcKind, SvcState};
    use crate::signals::SigSet;
    use crate::tunables::Tunables;
    use std::ffi::CString;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use std::time::Duration;

    /// Tests that fork children share the process-wide reap path;
    /// serialize them so one test cannot steal another's zombies
    fn fork_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(Mutex::default)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn test_init(dir: &tempfile::TempDir) -> Init {
        let mut tunables = Tunables::default();
        tunables.restart_cooldown_ms = 0;
        tunables.respawn_limit = 2;
        let mut init = Init::new(
            dir.path().join("primus.conf"),
            dir.path().to_path_buf(),
            dir.path().join("cond"),
            tunables,
            SigSet::current().unwrap(),
        );
        init.conds.enable_dir().unwrap();
        init.phase = InitPhase::Running;
        init.runlevel = 2;
        init
    }

    fn add_record(
        init: &mut Init,
        kind: SvcKind,
        name: &str,
        argv: &[&str],
        conditions: &[&str],
    ) -> usize {
        let mut svc = Service::new(
            Identity::new(kind, name, None),
            argv.iter()
                .map(|s| CString::new(*s).unwrap())
                .collect(),
        );
        svc.runlevels = Runlevels::parse("2").unwrap();
        svc.conditions =
            conditions.iter().map(|s| s.to_string()).collect();
        init.registry.insert(svc).map_err(|_| ()).unwrap()
    }

    /// Drive reap + step until `pred` holds or the deadline passes
    fn settle(init: &mut Init, pred: impl Fn(&Init) -> bool) -> bool {
        for _ in 0..400 {
            handle_sigchld(init).unwrap();
            step_all(init);
            if pred(init) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn gate_follows_runlevel_and_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "gated",
            &["/bin/sleep", "3600"],
            &["net/iface/lo"],
        );
        assert_eq!(gate_of(&init, idx), Gate::Stop);
        init.conds.set("net/iface/lo");
        assert_eq!(gate_of(&init, idx), Gate::Go);
        init.conds.flux("net/iface/lo");
        assert_eq!(gate_of(&init, idx), Gate::Pause);
        init.conds.set("net/iface/lo");
        init.runlevel = 3;
        assert_eq!(gate_of(&init, idx), Gate::Stop);
        init.runlevel = 2;
        init.registry.get_mut(idx).unwrap().paused = true;
        assert_eq!(gate_of(&init, idx), Gate::Stop);
    }

    #[test]
    fn gated_record_waits_in_conditional_then_starts() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "sleep",
            &["/bin/sleep", "3600"],
            &["net/iface/lo"],
        );
        step_all(&mut init);
        assert_eq!(
            init.registry.get(idx).unwrap().state,
            SvcState::Conditional
        );
        assert!(init.registry.get(idx).unwrap().pid.is_none());

        init.conds.set("net/iface/lo");
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Running);
        assert!(svc.pid.is_some());
        assert_eq!(
            init.conds.get("service/sleep"),
            Some(crate::cond::CondState::On)
        );

        // dropping the condition demands a stop
        init.conds.clear("net/iface/lo");
        step_all(&mut init);
        assert_eq!(
            init.registry.get(idx).unwrap().state,
            SvcState::Stopping
        );
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().state == SvcState::Halted
        }));
        assert_eq!(
            init.conds.get("service/sleep"),
            Some(crate::cond::CondState::Off)
        );
    }

    #[test]
    fn flux_pauses_without_teardown() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "sleep",
            &["/bin/sleep", "3600"],
            &["net/iface/lo"],
        );
        init.conds.set("net/iface/lo");
        step_all(&mut init);
        let pid = init.registry.get(idx).unwrap().pid;
        assert!(pid.is_some());

        init.conds.flux("net/iface/lo");
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Running);
        assert_eq!(svc.pid, pid);

        // cleanup
        init.conds.clear("net/iface/lo");
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().state == SvcState::Halted
        }));
    }

    #[test]
    fn task_posts_condition_on_success_only() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let ok = add_record(
            &mut init,
            SvcKind::Task,
            "works",
            &["/bin/true"],
            &[],
        );
        let bad = add_record(
            &mut init,
            SvcKind::Task,
            "fails",
            &["/bin/false"],
            &[],
        );
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(ok).unwrap().task_done
                && init.registry.get(bad).unwrap().task_done
        }));
        assert_eq!(
            init.conds.get("service/works"),
            Some(crate::cond::CondState::On)
        );
        assert_eq!(
            init.conds.get("service/fails"),
            Some(crate::cond::CondState::Off)
        );
        // once per gate window: no second run
        step_all(&mut init);
        assert!(init.registry.get(ok).unwrap().pid.is_none());
        assert_eq!(init.registry.get(ok).unwrap().state, SvcState::Halted);
    }

    #[test]
    fn crashing_service_parks_after_limit() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "flaky",
            &["/bin/false"],
            &[],
        );
        step_all(&mut init);
        // respawn_limit is 2: after 3 exits inside the window the
        // record must be parked with a window-end deadline
        assert!(settle(&mut init, |init| {
            let svc = init.registry.get(idx).unwrap();
            svc.state == SvcState::Crashed && svc.exits_in_window > 2
        }));
        let svc = init.registry.get(idx).unwrap();
        assert!(svc.pid.is_none());
        assert!(svc.deadline.is_some());
        // held down: further passes do not respawn
        step_all(&mut init);
        assert!(init.registry.get(idx).unwrap().pid.is_none());
    }

    #[test]
    fn runlevel_transition_stops_out_of_level_services() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let two = add_record(
            &mut init,
            SvcKind::Service,
            "two",
            &["/bin/sleep", "3600"],
            &[],
        );
        let three = {
            let idx = add_record(
                &mut init,
                SvcKind::Service,
                "three",
                &["/bin/sleep", "3600"],
                &[],
            );
            init.registry.get_mut(idx).unwrap().runlevels =
                Runlevels::parse("3").unwrap();
            idx
        };
        step_all(&mut init);
        assert_eq!(init.registry.get(two).unwrap().state, SvcState::Running);
        assert_eq!(init.registry.get(three).unwrap().state, SvcState::Halted);

        set_runlevel(&mut init, 3);
        step_all(&mut init);
        assert_eq!(init.registry.get(three).unwrap().state, SvcState::Running);
        assert!(matches!(
            init.registry.get(two).unwrap().state,
            SvcState::Stopping | SvcState::Halting
        ));
        assert!(settle(&mut init, |init| {
            init.registry.get(two).unwrap().state == SvcState::Halted
        }));

        // cleanup
        set_runlevel(&mut init, 4);
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(three).unwrap().state == SvcState::Halted
        }));
    }

    #[test]
    fn reload_does_not_bounce_unchanged_services() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        std::fs::write(
            &init.conf_path,
            "service [2] /bin/sleep 3600\n",
        )
        .unwrap();
        load_config(&mut init).unwrap();
        step_all(&mut init);
        let idx = init.registry.lookup_name("sleep").unwrap();
        let pid = init.registry.get(idx).unwrap().pid;
        assert!(pid.is_some());

        reload(&mut init);
        step_all(&mut init);
        handle_sigchld(&mut init).unwrap();
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Running);
        assert_eq!(svc.pid, pid, "unchanged service must keep its pid");
        assert_eq!(
            init.conds.get("service/sleep"),
            Some(crate::cond::CondState::On)
        );

        // cleanup
        set_runlevel(&mut init, 3);
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().state == SvcState::Halted
        }));
    }

    #[test]
    fn reload_restarts_changed_and_drops_removed() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        std::fs::write(
            &init.conf_path,
            "service [2] /bin/sleep 3600\nservice [2] name:extra /bin/sleep 1000\n",
        )
        .unwrap();
        load_config(&mut init).unwrap();
        step_all(&mut init);
        let sleep = init.registry.lookup_name("sleep").unwrap();
        let old_pid = init.registry.get(sleep).unwrap().pid;

        std::fs::write(
            &init.conf_path,
            "service [2] /bin/sleep 7200\n",
        )
        .unwrap();
        reload(&mut init);
        // changed record: stopped, then restarted with the new argv
        assert!(settle(&mut init, |init| {
            let svc = init.registry.get(sleep).unwrap();
            svc.state == SvcState::Running && svc.pid != old_pid
        }));
        // the removed record is doomed, stopped, and collected on the
        // next sweep
        let extra = init.registry.lookup_name("extra").unwrap();
        assert!(init.registry.get(extra).unwrap().doomed);
        assert!(settle(&mut init, |init| {
            init.registry.get(extra).unwrap().is_idle()
        }));
        assert_eq!(init.registry.sweep_dirty(), 1);
        assert!(init.registry.lookup_name("extra").is_none());

        // cleanup
        set_runlevel(&mut init, 3);
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(sleep).unwrap().state == SvcState::Halted
        }));
    }

    #[test]
    fn step_all_quiesces_with_nothing_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        for name in ["a", "b", "c"] {
            let idx = add_record(
                &mut init,
                SvcKind::Service,
                name,
                &["/bin/sleep", "1"],
                &[],
            );
            init.registry.get_mut(idx).unwrap().runlevels =
                Runlevels::parse("7").unwrap();
        }
        step_all(&mut init);
        step_all(&mut init);
        assert!(init.registry.iter().all(|svc| svc.state == SvcState::Halted));
    }

    #[test]
    fn run_blocks_followers_only_while_launching() {
        assert!(blocks_followers(SvcKind::Run, SvcState::Setup));
        assert!(blocks_followers(SvcKind::Run, SvcState::Starting));
        assert!(!blocks_followers(SvcKind::Run, SvcState::Running));
        assert!(!blocks_followers(SvcKind::Run, SvcState::Halted));
        assert!(!blocks_followers(SvcKind::Task, SvcState::Setup));
    }

    #[test]
    fn doomed_record_is_stopped_and_collected() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "goner",
            &["/bin/sleep", "3600"],
            &[],
        );
        step_all(&mut init);
        assert!(init.registry.get(idx).unwrap().pid.is_some());
        init.registry.get_mut(idx).unwrap().doomed = true;
        step_all(&mut init);
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().is_idle()
        }));
        assert_eq!(init.registry.sweep_dirty(), 1);
        assert!(init.registry.lookup_name("goner").is_none());
    }

    #[test]
    fn pidfile_timeout_parks_record() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        init.tunables.pidfile_timeout_secs = 0;
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "forker",
            &["/bin/sleep", "3600"],
            &[],
        );
        init.registry.get_mut(idx).unwrap().pidfile =
            Some(PathBuf::from("/run/forker.pid"));
        step_all(&mut init);
        // zero timeout: the very next pass gives up on the pidfile
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().state == SvcState::Crashed
        }));
        assert!(init.registry.get(idx).unwrap().pid.is_none());
    }

    #[test]
    fn forking_service_adopts_pidfile_pid() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "forker",
            &["/bin/sleep", "3600"],
            &[],
        );
        let pidfile = dir.path().join("forker.pid");
        init.registry.get_mut(idx).unwrap().pidfile = Some(pidfile.clone());
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Starting);
        let launcher = svc.pid.unwrap();

        // the "daemon" writes its pidfile and the watcher posts the
        // condition; here the launcher pid doubles as the daemon's
        std::fs::write(&pidfile, format!("{}\n", launcher.as_raw_nonzero()))
            .unwrap();
        init.conds.set("pid/forker");
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Running);
        assert_eq!(svc.pid, Some(launcher));
        assert_eq!(
            init.conds.get("service/forker"),
            Some(crate::cond::CondState::On)
        );
        assert_eq!(init.registry.lookup_pid(launcher), Some(idx));

        // killing the adopted pid externally is a crash; a long
        // cooldown keeps the record parked where we can observe it
        init.tunables.restart_cooldown_ms = 60_000;
        spawn::send_signal(launcher, libc::SIGKILL).unwrap();
        assert!(settle(&mut init, |init| {
            init.registry.get(idx).unwrap().state == SvcState::Crashed
        }));
    }

    #[test]
    fn inetd_record_opens_and_closes_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Inetd,
            "echod",
            &["/bin/cat"],
            &[],
        );
        // port 0 lets the kernel pick; the record only cares that a
        // listener exists
        init.registry.get_mut(idx).unwrap().port = Some(0);
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Running);
        assert!(svc.listener.is_some());
        assert!(svc.pid.is_none());

        set_runlevel(&mut init, 3);
        step_all(&mut init);
        let svc = init.registry.get(idx).unwrap();
        assert_eq!(svc.state, SvcState::Halted);
        assert!(svc.listener.is_none());
    }

    #[test]
    fn shutdown_converges_to_all_halted() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let idx = add_record(
            &mut init,
            SvcKind::Service,
            "daemon",
            &["/bin/sleep", "3600"],
            &[],
        );
        step_all(&mut init);
        assert!(init.registry.get(idx).unwrap().pid.is_some());

        set_runlevel(&mut init, 0);
        assert_eq!(init.phase, InitPhase::Shutdown(0));
        step_all(&mut init);
        assert!(settle(&mut init, shutdown_complete));
    }
}
