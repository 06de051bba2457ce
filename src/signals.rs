// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    io, mem,
    os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd},
};

use crate::utils::cvt;

/// What a signal delivered to pid 1 asks the supervisor to do.
///
/// Nothing downstream ever sees a signal number: deliveries are
/// translated right at the descriptor and the main loop dispatches on
/// the action, so the whole policy lives in the binding table below
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Drain zombies and update the registry.
    Reap,
    /// Halt the machine (runlevel 0).
    Halt,
    /// Reboot the machine (runlevel 6).
    Reboot,
    /// Reload configuration.
    Reload,
    /// Toggle debug logging.
    ToggleDebug,
    /// Spawn the emergency shell.
    Emergency,
}

/// The pid-1 signal bindings, which double as the set the supervisor
/// blocks and watches
const BINDINGS: [(i32, SignalAction); 6] = [
    (libc::SIGCHLD, SignalAction::Reap),
    (libc::SIGTERM, SignalAction::Halt),
    (libc::SIGINT, SignalAction::Reboot),
    (libc::SIGHUP, SignalAction::Reload),
    (libc::SIGUSR1, SignalAction::ToggleDebug),
    (libc::SIGUSR2, SignalAction::Emergency),
];

impl SignalAction {
    pub fn from_signo(signo: i32) -> Option<Self> {
        BINDINGS
            .iter()
            .find(|(bound, _)| *bound == signo)
            .map(|(_, action)| *action)
    }
}

/// Snapshot of a thread signal mask.
///
/// The supervisor saves the mask it was started with and hands it
/// back to every child between fork and exec, so daemons do not
/// inherit the blocked set the loop runs under
#[derive(Clone, Copy)]
pub struct SigSet {
    raw: libc::sigset_t,
}

impl SigSet {
    pub fn current() -> io::Result<Self> {
        let mut raw = unsafe { mem::zeroed() };
        unsafe {
            cvt(libc::sigprocmask(
                libc::SIG_SETMASK,
                std::ptr::null(),
                &mut raw,
            ))?;
        }
        Ok(Self { raw })
    }

    /// Make this mask the calling thread's mask wholesale
    pub fn apply(&self) -> io::Result<()> {
        unsafe {
            cvt(libc::sigprocmask(
                libc::SIG_SETMASK,
                &self.raw,
                std::ptr::null_mut(),
            ))?;
        }
        Ok(())
    }
}

const SIGINFO_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();

/// The supervisor's signal intake.
///
/// The bound signals are blocked from normal delivery and come back
/// as fixed-size records on this descriptor instead, which turns
/// signal handling into just another readiness event on the loop
/// thread and leaves no handler-context code anywhere
pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    /// Block the bound signals and open the descriptor carrying
    /// them. Runs before the first fork so children can be handed the
    /// pre-block mask
    pub fn install() -> io::Result<Self> {
        unsafe {
            let mut set = mem::zeroed();
            cvt(libc::sigemptyset(&mut set))?;
            for (signo, _) in BINDINGS {
                cvt(libc::sigaddset(&mut set, signo))?;
            }
            cvt(libc::sigprocmask(
                libc::SIG_BLOCK,
                &set,
                std::ptr::null_mut(),
            ))?;
            let fd = cvt(libc::signalfd(
                -1,
                &set,
                libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
            ))?;
            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Read every queued delivery and append its action to `out`.
    ///
    /// The kernel hands out whole `signalfd_siginfo` records; only
    /// the leading `ssi_signo` field matters here, so each record is
    /// decoded in place and the rest of the payload skipped
    pub fn drain(&self, out: &mut Vec<SignalAction>) -> io::Result<()> {
        let mut buf = [0u8; SIGINFO_SIZE * 16];
        loop {
            let n = match rustix::io::read(self.fd.as_fd(), &mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            for record in buf[..n].chunks_exact(SIGINFO_SIZE) {
                let signo = u32::from_ne_bytes(record[..4].try_into().unwrap())
                    .cast_signed();
                match SignalAction::from_signo(signo) {
                    Some(action) => out.push(action),
                    None => log::debug!("ignoring signal {}", signo),
                }
            }
        }
    }
}

impl AsFd for SignalFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid1_signal_bindings() {
        assert_eq!(
            SignalAction::from_signo(libc::SIGTERM),
            Some(SignalAction::Halt)
        );
        assert_eq!(
            SignalAction::from_signo(libc::SIGINT),
            Some(SignalAction::Reboot)
        );
        assert_eq!(
            SignalAction::from_signo(libc::SIGHUP),
            Some(SignalAction::Reload)
        );
        assert_eq!(
            SignalAction::from_signo(libc::SIGUSR1),
            Some(SignalAction::ToggleDebug)
        );
        assert_eq!(
            SignalAction::from_signo(libc::SIGUSR2),
            Some(SignalAction::Emergency)
        );
        assert_eq!(
            SignalAction::from_signo(libc::SIGCHLD),
            Some(SignalAction::Reap)
        );
        assert_eq!(SignalAction::from_signo(libc::SIGWINCH), None);
    }

    #[test]
    fn blocked_signal_arrives_as_action() {
        let sigfd = SignalFd::install().unwrap();
        // thread-directed and blocked in this thread, so it parks in
        // the queue until the descriptor is drained
        unsafe { libc::raise(libc::SIGUSR2) };
        let mut actions = Vec::new();
        for _ in 0..200 {
            sigfd.drain(&mut actions).unwrap();
            if !actions.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(actions.contains(&SignalAction::Emergency));
    }
}
