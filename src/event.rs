// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::event::epoll;
use rustix::time::{
    Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags, Timespec,
    timerfd_create, timerfd_settime,
};

/// Everything the loop can wake up for. Encoded into the epoll event
/// data as a u64 token so a single `wait` covers signals, the periodic
/// tick, plugin descriptors and inetd listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The signalfd carrying SIGCHLD and the pid-1 control signals.
    Signals,
    /// Periodic 1s tick used to check kill timers and other deadlines.
    Tick,
    /// A plugin's I/O descriptor, by plugin index.
    Plugin(usize),
    /// An inetd listener socket, by registry index.
    Inetd(usize),
}

const TOKEN_SIGNALS: u64 = 0;
const TOKEN_TICK: u64 = 1;
const TOKEN_PLUGIN_BASE: u64 = 1 << 16;
const TOKEN_INETD_BASE: u64 = 1 << 32;

impl Source {
    fn token(self) -> u64 {
        match self {
            Self::Signals => TOKEN_SIGNALS,
            Self::Tick => TOKEN_TICK,
            Self::Plugin(idx) => TOKEN_PLUGIN_BASE + idx as u64,
            Self::Inetd(idx) => TOKEN_INETD_BASE + idx as u64,
        }
    }

    fn from_token(token: u64) -> Option<Self> {
        match token {
            TOKEN_SIGNALS => Some(Self::Signals),
            TOKEN_TICK => Some(Self::Tick),
            t if t >= TOKEN_INETD_BASE => {
                Some(Self::Inetd((t - TOKEN_INETD_BASE) as usize))
            }
            t if t >= TOKEN_PLUGIN_BASE => {
                Some(Self::Plugin((t - TOKEN_PLUGIN_BASE) as usize))
            }
            _ => None,
        }
    }
}

/// Single-threaded, level-triggered reactor. All registry and
/// condition store mutation happens on the thread driving this loop;
/// handlers run to completion and defer long work to the tick
pub struct EventLoop {
    epfd: OwnedFd,
}

impl EventLoop {
    pub fn new() -> rustix::io::Result<Self> {
        let epfd = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(Self { epfd })
    }

    pub fn add(
        &self,
        fd: BorrowedFd<'_>,
        source: Source,
        flags: epoll::EventFlags,
    ) -> rustix::io::Result<()> {
        epoll::add(
            &self.epfd,
            fd,
            epoll::EventData::new_u64(source.token()),
            flags,
        )
    }

    /// Deregister a descriptor. Tolerates descriptors that were never
    /// added, so callers can stop watchers unconditionally
    pub fn del(&self, fd: BorrowedFd<'_>) -> rustix::io::Result<()> {
        match epoll::delete(&self.epfd, fd) {
            Ok(()) => Ok(()),
            Err(e) if e == rustix::io::Errno::NOENT => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait for readiness and decode the ready sources into `out`.
    /// Unknown tokens are skipped; they'd indicate a stale
    /// registration and there's nothing sensible to dispatch to
    pub fn wait(
        &self,
        events_buf: &mut [epoll::Event],
        out: &mut Vec<Source>,
    ) -> rustix::io::Result<()> {
        out.clear();
        let n = epoll::wait(&self.epfd, &mut *events_buf, None)?;
        for ev in &events_buf[..n as usize] {
            match Source::from_token(ev.data.u64()) {
                Some(source) => out.push(source),
                None => log::warn!("unknown epoll token {}", ev.data.u64()),
            }
        }
        Ok(())
    }
}

pub fn empty_event_buf<const N: usize>() -> [epoll::Event; N] {
    [epoll::Event {
        flags: epoll::EventFlags::empty(),
        data: epoll::EventData::new_u64(0),
    }; N]
}

/// The loop's only timer: a 1s periodic monotonic tick. Per-record
/// deadlines (kill timers, pidfile timeouts, respawn cooldowns) are
/// `Instant`s checked against it, which keeps timer bookkeeping out
/// of the kernel
pub fn create_tick_timerfd() -> rustix::io::Result<OwnedFd> {
    let fd = timerfd_create(
        TimerfdClockId::Monotonic,
        TimerfdFlags::CLOEXEC | TimerfdFlags::NONBLOCK,
    )?;
    let new_value = Itimerspec {
        it_interval: Timespec {
            tv_sec: 1,
            tv_nsec: 0,
        },
        it_value: Timespec {
            tv_sec: 1,
            tv_nsec: 0,
        },
    };
    timerfd_settime(&fd, TimerfdTimerFlags::empty(), &new_value)?;
    Ok(fd)
}

/// Drain the tick counter; the value is the number of elapsed periods
pub fn drain_tick(fd: BorrowedFd<'_>) -> rustix::io::Result<u64> {
    let mut buf = [0u8; 8];
    match rustix::io::read(fd, &mut buf) {
        Ok(8) => Ok(u64::from_ne_bytes(buf)),
        Ok(_) => Err(rustix::io::Errno::IO),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

impl AsFd for EventLoop {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epfd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        for source in [
            Source::Signals,
            Source::Tick,
            Source::Plugin(0),
            Source::Plugin(41),
            Source::Inetd(0),
            Source::Inetd(7),
        ] {
            assert_eq!(Source::from_token(source.token()), Some(source));
        }
    }

    #[test]
    fn tick_fires_and_drains() {
        let tfd = create_tick_timerfd().unwrap();
        // nothing elapsed yet: non-blocking read reports zero periods
        assert_eq!(drain_tick(tfd.as_fd()).unwrap(), 0);
    }
}
