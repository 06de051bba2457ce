// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    os::fd::AsFd,
    path::{Path, PathBuf},
    time::Instant,
};

use rustix::{
    event::epoll,
    process::{Pid, set_child_subreaper},
    system::RebootCommand,
};

use primus::{
    Init, InitPhase, cli,
    event::{self, EventLoop, Source},
    logger,
    plugin::{self, HookPoint},
    service::RUNLEVEL_S,
    signals::{SigSet, SignalAction, SignalFd},
    spawn, step,
    tunables::Tunables,
};

const EVENTS_BUF_LEN: usize = 16;

fn main() -> std::io::Result<()> {
    let args = cli::parse();
    logger::init();

    let pid1 = rustix::process::getpid().as_raw_nonzero().get() == 1;

    // adopt orphans even when we are not the real init; on pid 1 the
    // kernel gives us that role anyway and this is a no-op. The
    // `Option<Pid>` is just rustix's encoding of the non-zero flag
    unsafe { set_child_subreaper(Some(Pid::from_raw_unchecked(1)))? };

    let orig_sigset = SigSet::current()?;
    let sigfd = SignalFd::install()?;
    let tick = event::create_tick_timerfd()?;

    let ev = EventLoop::new()?;
    ev.add(sigfd.as_fd(), Source::Signals, epoll::EventFlags::IN)?;
    ev.add(tick.as_fd(), Source::Tick, epoll::EventFlags::IN)?;

    let tunables = Tunables::load(Path::new(&args.tunables_path))
        .unwrap_or_else(|e| {
            log::error!("{}: {}, using defaults", args.tunables_path, e);
            Tunables::default()
        });

    let rundir = PathBuf::from(&args.rundir);
    let cond_dir = rundir.join("primus/cond");
    let mut init = Init::new(
        PathBuf::from(&args.config_path),
        rundir,
        cond_dir.clone(),
        tunables,
        orig_sigset,
    );
    if let Some(path) = &args.control_path {
        init.control_path = PathBuf::from(path);
    }
    if let Some(level) = args.runlevel {
        init.boot_runlevel = level;
    }

    log::info!("primus {} booting", env!("CARGO_PKG_VERSION"));
    plugin::run_hook(&mut init, HookPoint::Banner, None);
    plugin::run_hook(&mut init, HookPoint::RootfsUp, None);

    // bring the condition store up, reusing surviving state when we
    // were reexec'd. A store that cannot come up at all leaves the
    // operator a shell; we keep going regardless
    let reused = cond_dir.is_dir() && init.conds.load().is_ok();
    if reused {
        log::info!("reusing condition state under {}", cond_dir.display());
    } else if let Err(e) = init.conds.enable_dir() {
        log::error!("condition store {}: {}", cond_dir.display(), e);
        let _ = spawn::emergency_shell(&init.orig_sigset);
    }

    if let Err(e) = step::load_config(&mut init) {
        log::error!("configuration rejected: {}", e);
    }

    plugin::load_plugins(&mut init, plugin::builtin());
    plugin::register_io(&ev, &init)?;
    plugin::run_hook(&mut init, HookPoint::BasefsUp, None);

    // single-user stage: the S-level records get the system to
    // themselves until they have run their course
    step::step_all(&mut init);
    reconcile(&ev, &mut init);

    let mut events_buf = event::empty_event_buf::<EVENTS_BUF_LEN>();
    let mut sources = Vec::with_capacity(EVENTS_BUF_LEN);
    let mut actions = Vec::new();

    'outer: loop {
        match ev.wait(&mut events_buf, &mut sources) {
            Ok(()) => {}
            Err(e) if e == rustix::io::Errno::INTR => continue,
            Err(e) => return Err(e.into()),
        }

        for &source in &sources {
            match source {
                Source::Signals => {
                    sigfd.drain(&mut actions)?;
                    for action in actions.drain(..) {
                        handle_action(&mut init, action)?;
                    }
                }
                Source::Tick => {
                    let _ = event::drain_tick(tick.as_fd())?;
                    if step::deadlines_due(&init, Instant::now()) {
                        init.kick();
                    }
                    init.conds.retry_flush();
                }
                Source::Plugin(idx) => {
                    if let Err(e) = plugin::dispatch_io(&ev, &mut init, idx) {
                        log::warn!("plugin io: {}", e);
                    }
                }
                Source::Inetd(idx) => accept_inetd(&mut init, idx),
            }
        }

        reconcile(&ev, &mut init);

        if step::shutdown_complete(&init) {
            break 'outer;
        }
    }

    // shutdown tail. Plugin handles close with the process; there
    // are no teardown callbacks to order
    plugin::run_hook(&mut init, HookPoint::Shutdown, None);
    rustix::fs::sync();
    let target = match init.phase {
        InitPhase::Shutdown(level) => level,
        _ => 0,
    };
    if pid1 {
        let cmd = if target == 6 {
            RebootCommand::Restart
        } else {
            RebootCommand::PowerOff
        };
        rustix::system::reboot(cmd)?;
    } else {
        log::info!(
            "runlevel {} reached, exiting (not pid 1)",
            target
        );
    }
    Ok(())
}

fn handle_action(
    init: &mut Init,
    action: SignalAction,
) -> std::io::Result<()> {
    match action {
        SignalAction::Reap => step::handle_sigchld(init)?,
        SignalAction::Halt => {
            log::info!("halt requested");
            step::set_runlevel(init, 0);
        }
        SignalAction::Reboot => {
            log::info!("reboot requested");
            step::set_runlevel(init, 6);
        }
        SignalAction::Reload => step::reload(init),
        SignalAction::ToggleDebug => {
            let level = logger::toggle_debug();
            log::info!("log level now {}", level);
        }
        SignalAction::Emergency => {
            match spawn::emergency_shell(&init.orig_sigset) {
                Ok(pid) => log::warn!(
                    "emergency shell on pid {}",
                    pid.as_raw_nonzero()
                ),
                Err(e) => log::error!("emergency shell: {}", e),
            }
        }
    }
    Ok(())
}

/// Every handler funnels into the reconciliation pass: drain the
/// kicks until quiet, finish boot once the single-user stage has run
/// its course, and fix up listener registrations
fn reconcile(ev: &EventLoop, init: &mut Init) {
    loop {
        while init.take_kick() {
            step::step_all(init);
        }
        if init.phase == InitPhase::Booting && single_user_done(init) {
            init.phase = InitPhase::Running;
            let level = init.boot_runlevel;
            step::set_runlevel(init, level);
            plugin::run_hook(init, HookPoint::NetworkUp, None);
            continue;
        }
        break;
    }
    reconcile_inetd(ev, init);
}

/// The boot stage is over once no S-level oneshot is still on its
/// way through the state machine
fn single_user_done(init: &Init) -> bool {
    !init.registry.iter().any(|svc| {
        svc.identity.kind.is_oneshot()
            && svc.runlevels.contains(RUNLEVEL_S)
            && matches!(
                svc.state,
                primus::service::SvcState::Setup
                    | primus::service::SvcState::Starting
                    | primus::service::SvcState::Running
            )
    })
}

fn accept_inetd(init: &mut Init, idx: usize) {
    let orig_sigset = init.orig_sigset.clone();
    let Some(svc) = init.registry.get(idx) else {
        return;
    };
    let Some(listener) = &svc.listener else {
        return;
    };
    if let Err(e) = spawn::accept_and_spawn(listener.as_fd(), svc, &orig_sigset)
    {
        log::warn!("inetd '{}': {}", svc.identity, e);
    }
}

/// Listener registrations carry registry indices, which shift when
/// the reload sweep compacts the registry; re-register every open
/// listener after each pass. Closed ones left the interest list with
/// their descriptor
fn reconcile_inetd(ev: &EventLoop, init: &Init) {
    for idx in init.registry.indexes() {
        let svc = init.registry.get(idx).unwrap();
        if let Some(listener) = &svc.listener {
            let _ = ev.del(listener.as_fd());
            if let Err(e) = ev.add(
                listener.as_fd(),
                Source::Inetd(idx),
                epoll::EventFlags::IN,
            ) {
                log::warn!("inetd '{}' registration: {}", svc.identity, e);
            }
        }
    }
}
