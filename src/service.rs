// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Instant;

use rustix::process::Pid;

use crate::utils::basename;

/// Runlevel S (single-user), encoded past the numeric levels
pub const RUNLEVEL_S: u8 = 10;

/// What kind of entity a record describes. The kind decides the
/// lifecycle: daemons are supervised and respawned, oneshots run to
/// completion, inetd records own a listener instead of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvcKind {
    /// Supervised long-running daemon.
    Service,
    /// Runs to completion once per gate-satisfying window.
    Task,
    /// Runs exactly once per matching runlevel, ordered.
    Run,
    /// Supervisor-held listening socket; children only reaped.
    Inetd,
    /// Login terminal; stopped with SIGKILL, no TERM grace period.
    Tty,
    /// Forking start/stop script in the old style.
    Sysv,
}

impl SvcKind {
    pub fn from_directive(word: &str) -> Option<Self> {
        match word {
            "service" => Some(Self::Service),
            "task" => Some(Self::Task),
            "run" => Some(Self::Run),
            "inetd" => Some(Self::Inetd),
            "tty" => Some(Self::Tty),
            "sysv" => Some(Self::Sysv),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Task => "task",
            Self::Run => "run",
            Self::Inetd => "inetd",
            Self::Tty => "tty",
            Self::Sysv => "sysv",
        }
    }

    /// Long-running, process-backed and respawned on exit
    pub const fn is_daemon(self) -> bool {
        matches!(self, Self::Service | Self::Tty | Self::Sysv)
    }

    /// Runs to completion instead of being supervised
    pub const fn is_oneshot(self) -> bool {
        matches!(self, Self::Task | Self::Run)
    }
}

impl fmt::Display for SvcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed-runlevel set of a record: a bit per level 0-9 plus S
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Runlevels(u16);

impl Runlevels {
    pub const EMPTY: Self = Self(0);

    /// Default for records that don't spell a level set out
    pub const fn standard() -> Self {
        // levels 2-5
        Self(0b0011_1100)
    }

    /// Parse the body of a `[..]` level set, e.g. `2345` or `S12`
    pub fn parse(body: &str) -> Option<Self> {
        let mut mask = 0u16;
        for c in body.chars() {
            match c {
                '0'..='9' => mask |= 1 << (c as u8 - b'0'),
                'S' | 's' => mask |= 1 << RUNLEVEL_S,
                _ => return None,
            }
        }
        Some(Self(mask))
    }

    #[inline(always)]
    pub const fn contains(self, level: u8) -> bool {
        level <= RUNLEVEL_S && self.0 & (1 << level) != 0
    }

    #[inline(always)]
    pub fn insert(&mut self, level: u8) {
        if level <= RUNLEVEL_S {
            self.0 |= 1 << level;
        }
    }

    #[inline(always)]
    pub fn remove(&mut self, level: u8) {
        if level <= RUNLEVEL_S {
            self.0 &= !(1 << level);
        }
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Runlevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for level in 0..=9u8 {
            if self.contains(level) {
                write!(f, "{}", level)?;
            }
        }
        if self.contains(RUNLEVEL_S) {
            f.write_str("S")?;
        }
        f.write_str("]")
    }
}

/// Registry identity of a record: kind, command basename (or an
/// explicit `name:` override) and an optional instance id, so the
/// same getty binary can back several terminals
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub kind: SvcKind,
    pub name: String,
    pub instance: Option<String>,
}

impl Identity {
    pub fn new(kind: SvcKind, name: &str, instance: Option<&str>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            instance: instance.map(str::to_string),
        }
    }

    pub fn from_command(
        kind: SvcKind,
        cmd: &str,
        name_override: Option<&str>,
        instance: Option<&str>,
    ) -> Self {
        Self::new(kind, name_override.unwrap_or(basename(cmd)), instance)
    }

    /// The short name clients address the record by: `name` or
    /// `name:instance`
    pub fn short(&self) -> String {
        match &self.instance {
            Some(id) => format!("{}:{}", self.name, id),
            None => self.name.clone(),
        }
    }

    /// The synthetic condition this record provides while running
    pub fn cond_name(&self) -> String {
        format!("service/{}", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.short())
    }
}

/// All possible states in which a service
/// can be at any moment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SvcState {
    /// Not running. The initial state for all records, and where
    /// stopped records come to rest.
    #[default]
    Halted,
    /// Eligible by runlevel but gated by a condition.
    Conditional,
    /// Transient: pre-start hook runs, then the fork is issued.
    Setup,
    /// Fork issued; awaiting readiness (for forking daemons, the
    /// pidfile).
    Starting,
    /// Process alive (or, for inetd, listener open).
    Running,
    /// SIGTERM sent, kill timer armed.
    Stopping,
    /// SIGKILL sent, awaiting the reaper.
    Halting,
    /// Exited abnormally; parked under respawn cooldown.
    Crashed,
}

impl SvcState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Halted => "halted",
            Self::Conditional => "conditional",
            Self::Setup => "setup",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Halting => "halting",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for SvcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service resource limit, applied in the child between fork and
/// exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: i32,
    pub soft: libc::rlim_t,
    pub hard: libc::rlim_t,
}

/// Credentials a child drops to before exec. Resolved at parse time;
/// nothing name-service related happens between fork and exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
}

/// One managed entity: a declarative record plus its live state.
///
/// The declarative attributes come from the config file and are
/// diffed on reload (`dirty`/`changed`); everything from `pid` down
/// is runtime bookkeeping owned by the state machine
#[derive(Debug)]
pub struct Service {
    pub identity: Identity,
    pub argv: Vec<CString>,
    pub runlevels: Runlevels,
    /// Start conditions; all must be ON for the gate to open.
    pub conditions: Vec<String>,
    /// Explicit pidfile, or derived for forking daemons.
    pub pidfile: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub creds: Option<Credentials>,
    pub rlimits: Vec<Rlimit>,
    pub descr: Option<String>,
    /// TCP port for inetd records.
    pub port: Option<u16>,
    /// Config generation that last touched this record.
    pub conf_gen: u32,
    /// Declarative attributes differ from the applied generation; a
    /// transition is required.
    pub dirty: bool,
    /// Touched by the current reconf; cleared when reload completes.
    pub changed: bool,

    pub pid: Option<Pid>,
    pub state: SvcState,
    /// Armed deadline; meaning depends on state (kill timer in
    /// stopping, pidfile timeout in starting, cooldown in crashed).
    pub deadline: Option<Instant>,
    pub exits_in_window: u32,
    pub window_start: Option<Instant>,
    pub last_exit: Option<i32>,
    /// Held stopped by an operator STOP until a START arrives.
    pub paused: bool,
    /// Removed from configuration; stop, then drop at halted.
    pub doomed: bool,
    /// Runlevels a `run` record already executed in.
    pub ran_levels: Runlevels,
    /// A `task` already ran in the current gate window.
    pub task_done: bool,
    pub listener: Option<OwnedFd>,
}

impl Service {
    pub fn new(identity: Identity, argv: Vec<CString>) -> Self {
        Self {
            identity,
            argv,
            runlevels: Runlevels::standard(),
            conditions: Vec::new(),
            pidfile: None,
            env: Vec::new(),
            creds: None,
            rlimits: Vec::new(),
            descr: None,
            port: None,
            conf_gen: 0,
            dirty: false,
            changed: false,
            pid: None,
            state: SvcState::Halted,
            deadline: None,
            exits_in_window: 0,
            window_start: None,
            last_exit: None,
            paused: false,
            doomed: false,
            ran_levels: Runlevels::EMPTY,
            task_done: false,
            listener: None,
        }
    }

    /// Daemon that detaches itself: readiness comes from the pidfile,
    /// not from the fork child staying alive
    #[inline(always)]
    pub fn is_forking(&self) -> bool {
        self.pidfile.is_some() && self.identity.kind.is_daemon()
    }

    /// The `pid/*` condition this record's pidfile drives, derived
    /// from the pidfile name the same way the watcher derives it
    pub fn pid_cond(&self) -> Option<String> {
        let pidfile = self.pidfile.as_ref()?;
        crate::pidfile::cond_for_path(pidfile)
    }

    /// No process and no pending teardown; safe to drop or restart
    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.pid.is_none()
            && matches!(
                self.state,
                SvcState::Halted | SvcState::Conditional | SvcState::Crashed
            )
    }
}

/// The services registry.
///
/// Records live in a `Vec` in insertion order, which is the iteration
/// order `step_all` and the STATUS command rely on. Identity, pid and
/// pidfile lookups go through side maps onto indices; the pid map is
/// maintained by the spawn/reap paths, the other two are rebuilt when
/// the record set changes (insert and reload sweep)
#[derive(Debug, Default)]
pub struct Registry {
    services: Vec<Service>,
    by_ident: HashMap<Identity, usize>,
    by_pid: HashMap<Pid, usize>,
    by_pidfile: HashMap<PathBuf, usize>,
}

impl Registry {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Insert a new record. Identity must be unique within the
    /// registry; a duplicate is returned to the caller untouched
    pub fn insert(&mut self, svc: Service) -> Result<usize, Service> {
        if self.by_ident.contains_key(&svc.identity) {
            return Err(svc);
        }
        let idx = self.services.len();
        self.by_ident.insert(svc.identity.clone(), idx);
        if let Some(pidfile) = &svc.pidfile {
            self.by_pidfile.insert(pidfile.clone(), idx);
        }
        self.services.push(svc);
        Ok(idx)
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> Option<&Service> {
        self.services.get(idx)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Service> {
        self.services.get_mut(idx)
    }

    pub fn lookup_ident(&self, identity: &Identity) -> Option<usize> {
        self.by_ident.get(identity).copied()
    }

    /// Find a record by the short name control clients use
    /// (`name` or `name:instance`), in insertion order
    pub fn lookup_name(&self, name: &str) -> Option<usize> {
        self.services
            .iter()
            .position(|svc| svc.identity.short() == name)
    }

    pub fn lookup_pid(&self, pid: Pid) -> Option<usize> {
        self.by_pid.get(&pid).copied()
    }

    pub fn lookup_pidfile(&self, pidfile: &std::path::Path) -> Option<usize> {
        self.by_pidfile.get(pidfile).copied()
    }

    /// Record a spawned (or adopted) pid for reaper lookup. The
    /// caller must have set `svc.pid` to match
    pub fn register_pid(&mut self, pid: Pid, idx: usize) {
        self.by_pid.insert(pid, idx);
    }

    pub fn unregister_pid(&mut self, pid: Pid) {
        self.by_pid.remove(&pid);
    }

    #[inline(always)]
    pub fn indexes(&self) -> std::ops::Range<usize> {
        0..self.services.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.services.iter_mut()
    }

    /// Start of a reparse: every record is presumed gone until the
    /// new configuration touches it
    pub fn mark_all_dirty(&mut self) {
        for svc in &mut self.services {
            svc.dirty = true;
        }
    }

    pub fn clear_changed(&mut self) {
        for svc in &mut self.services {
            svc.changed = false;
        }
    }

    /// End of a reparse: records the new configuration never touched
    /// are doomed. Records that were touched but changed keep their
    /// dirty flag so the state machine restarts them; only the
    /// untouched ones go. Idle doomed records are dropped right away,
    /// the rest keep their identity until the state machine has
    /// stopped them and are collected on a later sweep. Returns the
    /// number dropped
    pub fn sweep_dirty(&mut self) -> usize {
        for svc in &mut self.services {
            if svc.dirty && !svc.changed {
                svc.doomed = true;
            }
        }
        let before = self.services.len();
        self.services.retain(|svc| !(svc.doomed && svc.is_idle()));
        let dropped = before - self.services.len();
        if dropped > 0 {
            self.rebuild_indices();
        }
        dropped
    }

    /// Re-derive identity/pid/pidfile maps after indices shifted
    pub fn rebuild_indices(&mut self) {
        self.by_ident.clear();
        self.by_pid.clear();
        self.by_pidfile.clear();
        for (idx, svc) in self.services.iter().enumerate() {
            self.by_ident.insert(svc.identity.clone(), idx);
            if let Some(pid) = svc.pid {
                self.by_pid.insert(pid, idx);
            }
            if let Some(pidfile) = &svc.pidfile {
                self.by_pidfile.insert(pidfile.clone(), idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(kind: SvcKind, name: &str) -> Service {
        Service::new(
            Identity::new(kind, name, None),
            vec![CString::new(format!("/bin/{}", name)).unwrap()],
        )
    }

    #[test]
    fn runlevel_parse_and_contains() {
        let levels = Runlevels::parse("2345").unwrap();
        assert!(levels.contains(2) && levels.contains(5));
        assert!(!levels.contains(1) && !levels.contains(RUNLEVEL_S));
        let single_user = Runlevels::parse("S").unwrap();
        assert!(single_user.contains(RUNLEVEL_S));
        assert!(Runlevels::parse("2x").is_none());
        assert_eq!(Runlevels::parse("234S").unwrap().to_string(), "[234S]");
    }

    #[test]
    fn identity_short_and_cond() {
        let ident = Identity::from_command(
            SvcKind::Tty,
            "/sbin/getty",
            None,
            Some("tty1"),
        );
        assert_eq!(ident.short(), "getty:tty1");
        assert_eq!(ident.cond_name(), "service/getty:tty1");
        assert_eq!(ident.to_string(), "tty/getty:tty1");
    }

    #[test]
    fn duplicate_identity_rejected() {
        let mut reg = Registry::new();
        reg.insert(svc(SvcKind::Service, "sshd")).unwrap();
        assert!(reg.insert(svc(SvcKind::Service, "sshd")).is_err());
        // same name under a different kind is a distinct identity
        reg.insert(svc(SvcKind::Task, "sshd")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn pid_index_follows_registration() {
        let mut reg = Registry::new();
        let idx = reg.insert(svc(SvcKind::Service, "sshd")).unwrap();
        let pid = unsafe { Pid::from_raw_unchecked(4242) };
        reg.get_mut(idx).unwrap().pid = Some(pid);
        reg.register_pid(pid, idx);
        assert_eq!(reg.lookup_pid(pid), Some(idx));
        reg.unregister_pid(pid);
        assert_eq!(reg.lookup_pid(pid), None);
    }

    #[test]
    fn pidfile_index_tracks_declared_paths() {
        let mut reg = Registry::new();
        let mut service = svc(SvcKind::Service, "sshd");
        service.pidfile = Some(PathBuf::from("/run/sshd.pid"));
        reg.insert(service).unwrap();
        assert_eq!(
            reg.lookup_pidfile(std::path::Path::new("/run/sshd.pid")),
            Some(0)
        );
        assert_eq!(
            reg.lookup_pidfile(std::path::Path::new("/run/other.pid")),
            None
        );
    }

    #[test]
    fn sweep_drops_idle_dirty_records() {
        let mut reg = Registry::new();
        reg.insert(svc(SvcKind::Service, "keep")).unwrap();
        reg.insert(svc(SvcKind::Service, "gone")).unwrap();
        reg.mark_all_dirty();
        let keep = reg.lookup_name("keep").unwrap();
        reg.get_mut(keep).unwrap().dirty = false;
        assert_eq!(reg.sweep_dirty(), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup_name("gone").is_none());
        assert_eq!(reg.lookup_name("keep"), Some(0));
    }

    #[test]
    fn sweep_keeps_live_doomed_records() {
        let mut reg = Registry::new();
        let idx = reg.insert(svc(SvcKind::Service, "busy")).unwrap();
        {
            let svc = reg.get_mut(idx).unwrap();
            svc.state = SvcState::Running;
            svc.pid = Some(unsafe { Pid::from_raw_unchecked(99) });
            svc.dirty = true;
        }
        assert_eq!(reg.sweep_dirty(), 0);
        assert!(reg.get(idx).unwrap().doomed);
    }
}
