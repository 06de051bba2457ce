// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd},
    path::Path,
};

use rustix::fs::{Mode, OFlags, fsync, open, rename, unlink};

/// Map a C-style `-1`+errno return to a result, passing any other
/// value through. All our raw libc calls return an int
pub fn cvt(ret: i32) -> rustix::io::Result<i32> {
    if ret == -1 {
        let errno = unsafe { *libc::__errno_location() };
        return Err(rustix::io::Errno::from_raw_os_error(errno));
    }
    Ok(ret)
}

/// Name of the fault signal behind an exit, when the exit counts as
/// a crash rather than a plain termination
pub fn crash_signal(sig: i32) -> Option<&'static str> {
    match sig {
        libc::SIGSEGV => Some("SIGSEGV"),
        libc::SIGABRT => Some("SIGABRT"),
        libc::SIGFPE => Some("SIGFPE"),
        libc::SIGILL => Some("SIGILL"),
        libc::SIGBUS => Some("SIGBUS"),
        _ => None,
    }
}

/// Write the whole buffer, riding out short writes
pub fn write_all(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        done += rustix::io::write(fd, &buf[done..])?;
    }
    Ok(())
}

/// Write `content` to `path` atomically: write a sibling temp file,
/// fsync it and rename it over the final path. Concurrent readers of
/// `path` never see torn content
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let fd = open(
        &tmp_path,
        OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    write_all(fd.as_fd(), content)?;
    fsync(&fd)?;
    rename(&tmp_path, path)?;
    Ok(())
}

/// Remove a file, ignoring the case where it's already gone
pub fn unlink_quiet(path: &Path) -> io::Result<()> {
    match unlink(path) {
        Ok(()) => Ok(()),
        Err(e) if e == rustix::io::Errno::NOENT => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Last path component of a command path, used to derive service
/// identities ("/usr/sbin/sshd" -> "sshd")
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
