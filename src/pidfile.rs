// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    ffi::CString,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use bitflags::bitflags;

use crate::Init;
use crate::plugin::{HookPoint, Plugin, PluginData, PluginIo};
use crate::service::SvcState;
use crate::utils::cvt;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct WatchMask: u32 {
        const CREATE = libc::IN_CREATE;
        const ATTRIB = libc::IN_ATTRIB;
        const MODIFY = libc::IN_MODIFY;
        const MOVED_TO = libc::IN_MOVED_TO;
        const DELETE = libc::IN_DELETE;
        const ISDIR = libc::IN_ISDIR;
        const IGNORED = libc::IN_IGNORED;
        const ONLYDIR = libc::IN_ONLYDIR;
    }
}

/// Everything we want to know about names appearing, changing and
/// vanishing inside a watched directory
const DIR_MASK: WatchMask = WatchMask::CREATE
    .union(WatchMask::ATTRIB)
    .union(WatchMask::MODIFY)
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::DELETE)
    .union(WatchMask::ONLYDIR);

fn inotify_init() -> io::Result<OwnedFd> {
    let fd = unsafe {
        cvt(libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))?
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn inotify_add_watch(
    fd: BorrowedFd<'_>,
    path: &Path,
    mask: WatchMask,
) -> io::Result<i32> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::other("NUL in watch path"))?;
    let wd = unsafe {
        cvt(libc::inotify_add_watch(
            fd.as_raw_fd(),
            c_path.as_ptr(),
            mask.bits(),
        ))?
    };
    Ok(wd)
}

/// Whether a directory entry name is a pidfile: `<something>.pid` or
/// the bare `pid` some daemons drop inside their own subdirectory
pub fn is_pidfile_name(name: &str) -> bool {
    name == "pid" || name.strip_suffix(".pid").is_some_and(|s| !s.is_empty())
}

/// The `pid/*` condition a pidfile path maps to: `/run/sshd.pid` and
/// `/run/sshd/pid` both become `pid/sshd`
pub fn cond_for_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = if file_name == "pid" {
        path.parent()?.file_name()?.to_str()?
    } else {
        file_name.strip_suffix(".pid").filter(|s| !s.is_empty())?
    };
    Some(format!("pid/{}", name))
}

/// A pidfile appearing or vanishing, translated to the condition it
/// drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidfileEvent {
    pub cond: String,
    pub appeared: bool,
}

/// Watches the run directory tree for pidfiles, one level deep.
///
/// The restriction is enforced here: subdirectories of the root are
/// watched and rescanned as they appear, anything deeper is refused
/// with an explicit complaint so users learn why their pidfile is
/// being ignored
#[derive(Debug)]
pub struct Watcher {
    root: PathBuf,
    watches: HashMap<i32, PathBuf>,
}

impl Watcher {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            watches: HashMap::new(),
        }
    }

    /// Watch the root and its existing first-level subdirectories,
    /// reporting pidfiles already present (pre-existing state counts
    /// as much as fresh events do)
    pub fn watch_root(
        &mut self,
        fd: BorrowedFd<'_>,
        out: &mut Vec<PidfileEvent>,
    ) -> io::Result<()> {
        let root = self.root.clone();
        let wd = inotify_add_watch(fd, &root, DIR_MASK)?;
        self.watches.insert(wd, root.clone());
        let subdirs: Vec<PathBuf> = std::fs::read_dir(&root)?
            .filter_map(|dent| dent.ok())
            .filter(|dent| {
                dent.file_type().map(|t| t.is_dir()).unwrap_or(false)
            })
            .map(|dent| dent.path())
            .collect();
        self.scan_dir(&root, out);
        for dir in subdirs {
            self.add_subdir(fd, &dir, out);
        }
        Ok(())
    }

    fn add_subdir(
        &mut self,
        fd: BorrowedFd<'_>,
        dir: &Path,
        out: &mut Vec<PidfileEvent>,
    ) {
        if dir.parent() != Some(self.root.as_path()) {
            log::error!(
                "not watching '{}': pidfile directories may sit at most \
                 one level below '{}'",
                dir.display(),
                self.root.display()
            );
            return;
        }
        match inotify_add_watch(fd, dir, DIR_MASK) {
            Ok(wd) => {
                self.watches.insert(wd, dir.to_path_buf());
                self.scan_dir(dir, out);
            }
            Err(e) => log::warn!("watch '{}': {}", dir.display(), e),
        }
    }

    fn scan_dir(&self, dir: &Path, out: &mut Vec<PidfileEvent>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for dent in entries.filter_map(|dent| dent.ok()) {
            let name = dent.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_pidfile_name(name) {
                continue;
            }
            if let Some(cond) = cond_for_path(&dent.path()) {
                out.push(PidfileEvent {
                    cond,
                    appeared: true,
                });
            }
        }
    }

    /// Read and decode all pending inotify events. New subdirectories
    /// are added to the watch set (and rescanned) as a side effect
    pub fn drain(
        &mut self,
        fd: BorrowedFd<'_>,
        out: &mut Vec<PidfileEvent>,
    ) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = match rustix::io::read(fd, &mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let mut offset = 0usize;
            while offset + std::mem::size_of::<libc::inotify_event>() <= n {
                // events are variable length; read the fixed header
                // unaligned and slice the name off the tail
                let event = unsafe {
                    std::ptr::read_unaligned(
                        buf[offset..].as_ptr() as *const libc::inotify_event
                    )
                };
                let name_off =
                    offset + std::mem::size_of::<libc::inotify_event>();
                let name_end = name_off + event.len as usize;
                if name_end > n {
                    break;
                }
                let name = std::str::from_utf8(&buf[name_off..name_end])
                    .unwrap_or("")
                    .trim_end_matches('\0');
                self.handle_event(fd, event.wd, event.mask, name, out);
                offset = name_end;
            }
        }
    }

    fn handle_event(
        &mut self,
        fd: BorrowedFd<'_>,
        wd: i32,
        mask: u32,
        name: &str,
        out: &mut Vec<PidfileEvent>,
    ) {
        let mask = WatchMask::from_bits_truncate(mask);
        if mask.contains(WatchMask::IGNORED) {
            self.watches.remove(&wd);
            return;
        }
        let Some(dir) = self.watches.get(&wd).cloned() else {
            return;
        };
        if mask.contains(WatchMask::ISDIR) {
            if mask.intersects(WatchMask::CREATE | WatchMask::MOVED_TO) {
                self.add_subdir(fd, &dir.join(name), out);
            }
            return;
        }
        if !is_pidfile_name(name) {
            return;
        }
        let Some(cond) = cond_for_path(&dir.join(name)) else {
            return;
        };
        let appeared = mask.intersects(
            WatchMask::CREATE
                | WatchMask::MOVED_TO
                | WatchMask::ATTRIB
                | WatchMask::MODIFY,
        );
        if appeared || mask.contains(WatchMask::DELETE) {
            out.push(PidfileEvent {
                cond,
                appeared,
            });
        }
    }
}

pub fn plugin() -> Plugin {
    let mut plugin = Plugin::new("pidfile");
    plugin.init = Some(pidfile_init);
    plugin.io_cb = Some(pidfile_io);
    plugin.hooks[HookPoint::SvcReconf.index()] = Some(pidfile_reconf);
    plugin
}

fn pidfile_init(init: &mut Init, idx: usize) -> io::Result<()> {
    let fd = inotify_init()?;
    let mut watcher = Watcher::new(init.rundir.clone());
    let mut found = Vec::new();
    watcher.watch_root(fd.as_fd(), &mut found)?;
    for event in found {
        init.conds.set(&event.cond);
    }
    init.plugins[idx].io = Some(PluginIo {
        fd: Some(fd),
        events: rustix::event::epoll::EventFlags::IN,
    });
    init.plugins[idx].data = PluginData::Pidfile(watcher);
    Ok(())
}

fn pidfile_io(init: &mut Init, io: &mut PluginIo, data: &mut PluginData) {
    let PluginData::Pidfile(watcher) = data else {
        return;
    };
    let Some(fd) = &io.fd else {
        return;
    };
    let mut events = Vec::new();
    if let Err(e) = watcher.drain(fd.as_fd(), &mut events) {
        log::warn!("pidfile watcher: {}", e);
        return;
    }
    for event in events {
        if event.appeared {
            init.conds.set(&event.cond);
        } else {
            init.conds.clear(&event.cond);
        }
    }
}

/// Reload reassertion: running, unchanged, non-starting services
/// whose pidfile is still on disk get their `pid/*` condition
/// re-established without a restart
fn pidfile_reconf(init: &mut Init, _arg: Option<usize>) {
    for idx in init.registry.indexes() {
        let svc = init.registry.get(idx).unwrap();
        if svc.changed || svc.doomed || svc.state != SvcState::Running {
            continue;
        }
        let Some(pidfile) = svc.pidfile.clone() else {
            continue;
        };
        let Some(cond) = svc.pid_cond() else {
            continue;
        };
        if pidfile.exists() {
            if init.conds.exists(&cond) {
                init.conds.validate(&cond);
            } else {
                init.conds.set(&cond);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pidfile_names() {
        assert!(is_pidfile_name("sshd.pid"));
        assert!(is_pidfile_name("pid"));
        assert!(!is_pidfile_name(".pid"));
        assert!(!is_pidfile_name("sshd.pid.bak"));
        assert!(!is_pidfile_name("sshd"));
    }

    #[test]
    fn cond_derivation() {
        assert_eq!(
            cond_for_path(Path::new("/run/sshd.pid")).as_deref(),
            Some("pid/sshd")
        );
        assert_eq!(
            cond_for_path(Path::new("/run/crond/pid")).as_deref(),
            Some("pid/crond")
        );
        assert_eq!(cond_for_path(Path::new("/run/.pid")), None);
    }

    fn drain_until(
        watcher: &mut Watcher,
        fd: BorrowedFd<'_>,
        pred: impl Fn(&[PidfileEvent]) -> bool,
    ) -> Vec<PidfileEvent> {
        let mut events = Vec::new();
        for _ in 0..200 {
            watcher.drain(fd, &mut events).unwrap();
            if pred(&events) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn watches_root_and_new_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let fd = inotify_init().unwrap();
        let mut watcher = Watcher::new(dir.path().to_path_buf());
        let mut initial = Vec::new();
        watcher.watch_root(fd.as_fd(), &mut initial).unwrap();
        assert!(initial.is_empty());

        std::fs::write(dir.path().join("sshd.pid"), "1234\n").unwrap();
        let events = drain_until(&mut watcher, fd.as_fd(), |ev| {
            ev.iter().any(|e| e.cond == "pid/sshd" && e.appeared)
        });
        assert!(events.iter().any(|e| e.cond == "pid/sshd" && e.appeared));

        // a new first-level subdirectory is picked up and its
        // pidfiles reported
        std::fs::create_dir(dir.path().join("crond")).unwrap();
        std::fs::write(dir.path().join("crond/pid"), "99\n").unwrap();
        let events = drain_until(&mut watcher, fd.as_fd(), |ev| {
            ev.iter().any(|e| e.cond == "pid/crond" && e.appeared)
        });
        assert!(events.iter().any(|e| e.cond == "pid/crond" && e.appeared));

        std::fs::remove_file(dir.path().join("sshd.pid")).unwrap();
        let events = drain_until(&mut watcher, fd.as_fd(), |ev| {
            ev.iter().any(|e| e.cond == "pid/sshd" && !e.appeared)
        });
        assert!(events.iter().any(|e| e.cond == "pid/sshd" && !e.appeared));
    }

    #[test]
    fn preexisting_pidfiles_reported_at_watch_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.pid"), "42\n").unwrap();
        std::fs::create_dir(dir.path().join("svc")).unwrap();
        std::fs::write(dir.path().join("svc/pid"), "43\n").unwrap();

        let fd = inotify_init().unwrap();
        let mut watcher = Watcher::new(dir.path().to_path_buf());
        let mut initial = Vec::new();
        watcher.watch_root(fd.as_fd(), &mut initial).unwrap();
        assert!(initial.iter().any(|e| e.cond == "pid/old"));
        assert!(initial.iter().any(|e| e.cond == "pid/svc"));
    }

    #[test]
    fn deeper_directories_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let fd = inotify_init().unwrap();
        let mut watcher = Watcher::new(dir.path().to_path_buf());
        let mut events = Vec::new();
        watcher.watch_root(fd.as_fd(), &mut events).unwrap();
        assert_eq!(watcher.watches.len(), 1);

        let deep = dir.path().join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        for _ in 0..200 {
            watcher.drain(fd.as_fd(), &mut events).unwrap();
            if watcher.watches.len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // the first level is watched, the second is not
        assert_eq!(watcher.watches.len(), 2);
        watcher.add_subdir(fd.as_fd(), &deep, &mut events);
        assert_eq!(watcher.watches.len(), 2);
    }
}
