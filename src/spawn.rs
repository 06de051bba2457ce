// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    ffi::CString,
    io,
    net::{Ipv4Addr, SocketAddrV4},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
};

use rustix::net::{
    AddressFamily, SocketFlags, SocketType, accept_with, bind, listen,
    socket_with, sockopt,
};
use rustix::process::Pid;

use crate::service::Service;
use crate::signals::SigSet;
use crate::utils::cvt;

const EXEC_FAILED: i32 = 127;
const INETD_BACKLOG: i32 = 16;

/// Send `sig` to a supervised process
pub fn send_signal(pid: Pid, sig: i32) -> io::Result<()> {
    unsafe { cvt(libc::kill(pid.as_raw_nonzero().get(), sig))? };
    Ok(())
}

/// The signal used to stop a record. ttys are killed outright, with
/// no TERM grace period
#[inline(always)]
pub fn stop_signal(svc: &Service) -> i32 {
    match svc.identity.kind {
        crate::service::SvcKind::Tty => libc::SIGKILL,
        _ => libc::SIGTERM,
    }
}

/// Environment for the child: the supervisor's own environment with
/// the record's overrides applied on top. Built before fork so the
/// child only shuffles pointers
fn build_envp(svc: &Service) -> Vec<CString> {
    let mut pairs: Vec<(String, String)> = std::env::vars().collect();
    for (key, value) in &svc.env {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }
    pairs
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect()
}

/// Everything the child does between fork and exec: restore the
/// original signal mask, detach into its own session, close non-std
/// descriptors, apply resource limits and credentials, chdir to `/`
/// and exec. Never returns
fn child_exec(svc: &Service, orig_sigset: &SigSet, envp: &[CString]) -> ! {
    let _ = orig_sigset.apply();
    unsafe {
        libc::setsid();
        libc::close_range(3, u32::MAX, 0);

        for rlimit in &svc.rlimits {
            let rl = libc::rlimit {
                rlim_cur: rlimit.soft,
                rlim_max: rlimit.hard,
            };
            libc::setrlimit(rlimit.resource as _, &rl);
        }

        if let Some(creds) = &svc.creds {
            if libc::setgroups(creds.groups.len(), creds.groups.as_ptr()) != 0
                || libc::setgid(creds.gid) != 0
                || libc::setuid(creds.uid) != 0
            {
                libc::_exit(EXEC_FAILED);
            }
        }

        libc::chdir(c"/".as_ptr());

        let argv: Vec<*const libc::c_char> = svc
            .argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(Some(std::ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(Some(std::ptr::null()))
            .collect();
        libc::execvpe(argv[0], argv.as_ptr(), envp.as_ptr());
        libc::_exit(EXEC_FAILED);
    }
}

/// Fork and exec a record's command, returning the child pid. The
/// parent never blocks on the child except through the reap path
pub fn start(svc: &Service, orig_sigset: &SigSet) -> io::Result<Pid> {
    let envp = build_envp(svc);
    match unsafe { libc::fork() } {
        0 => child_exec(svc, orig_sigset, &envp),
        raw if raw > 0 => {
            // safe as we just checked that the pid is > 0
            Ok(unsafe { Pid::from_raw_unchecked(raw) })
        }
        _ => Err(io::Error::last_os_error()),
    }
}

/// Reap one zombie, non-blocking. `Ok(None)` when there is nothing
/// left to reap; the caller loops
pub fn reap_next() -> io::Result<Option<(Pid, i32)>> {
    let mut status: libc::c_int = 0;
    let raw = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    match raw {
        0 => Ok(None),
        raw if raw > 0 => {
            let pid = unsafe { Pid::from_raw_unchecked(raw) };
            Ok(Some((pid, status)))
        }
        _ => {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::ECHILD) {
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

/// Open the non-blocking TCP listener backing an inetd record
pub fn open_listener(port: u16) -> io::Result<OwnedFd> {
    let fd = socket_with(
        AddressFamily::INET,
        SocketType::STREAM,
        SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
        None,
    )?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    bind(&fd, &SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    listen(&fd, INETD_BACKLOG)?;
    Ok(fd)
}

/// Accept one inetd connection and fork the handler with the socket
/// as its stdio. The child is reaped but otherwise unsupervised
pub fn accept_and_spawn(
    listener: BorrowedFd<'_>,
    svc: &Service,
    orig_sigset: &SigSet,
) -> io::Result<()> {
    let conn = match accept_with(listener, SocketFlags::CLOEXEC) {
        Ok(conn) => conn,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let envp = build_envp(svc);
    match unsafe { libc::fork() } {
        0 => {
            unsafe {
                let raw = conn.as_raw_fd();
                libc::dup2(raw, 0);
                libc::dup2(raw, 1);
                libc::dup2(raw, 2);
            }
            child_exec(svc, orig_sigset, &envp)
        }
        raw if raw > 0 => {
            log::debug!(
                "inetd '{}' handler pid {} spawned",
                svc.identity,
                raw
            );
            Ok(())
        }
        _ => Err(io::Error::last_os_error()),
    }
}

/// Last-resort shell on the console. Used for the EMERGENCY command
/// and for fatal boot errors; the supervisor itself keeps running
pub fn emergency_shell(orig_sigset: &SigSet) -> io::Result<Pid> {
    match unsafe { libc::fork() } {
        0 => {
            let _ = orig_sigset.apply();
            unsafe {
                libc::setsid();
                if let Ok(console) = rustix::fs::open(
                    c"/dev/console",
                    rustix::fs::OFlags::RDWR,
                    rustix::fs::Mode::empty(),
                ) {
                    let raw = console.as_fd().as_raw_fd();
                    libc::dup2(raw, 0);
                    libc::dup2(raw, 1);
                    libc::dup2(raw, 2);
                    libc::ioctl(0, libc::TIOCSCTTY as _, 0);
                }
                let argv = [c"/bin/sh".as_ptr(), std::ptr::null()];
                libc::execv(argv[0], argv.as_ptr());
                libc::_exit(EXEC_FAILED);
            }
        }
        raw if raw > 0 => Ok(unsafe { Pid::from_raw_unchecked(raw) }),
        _ => Err(io::Error::last_os_error()),
    }
}
