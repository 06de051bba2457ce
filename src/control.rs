// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    fmt, io,
    os::fd::{AsFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::fs::{CWD, Mode, OFlags, mkfifoat, open};

use crate::service::RUNLEVEL_S;
use crate::utils::write_all;
use crate::{Init, logger, spawn, step};
use crate::plugin::{Plugin, PluginData, PluginIo};

const CTL_MAGIC: u32 = 0x494e_4954;
const CTL_VERSION: u16 = 1;
const HEADER_LEN: usize = 16;
const MAX_PAYLOAD: usize = 368;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// Control operations
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlCommand {
    Stop = 1,
    Start = 2,
    Restart = 3,
    Status = 4,
    Runlevel = 5,
    Reload = 6,
    Debug = 7,
    Emergency = 8,
}

impl CtlCommand {
    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Stop),
            2 => Some(Self::Start),
            3 => Some(Self::Restart),
            4 => Some(Self::Status),
            5 => Some(Self::Runlevel),
            6 => Some(Self::Reload),
            7 => Some(Self::Debug),
            8 => Some(Self::Emergency),
            _ => None,
        }
    }
}

/// Protocol level validation failures. I/O failures on the FIFO are
/// plain `io::Error`s and handled by the plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlError {
    BadMagic(u32),
    BadVersion(u16),
    BadCommand(u16),
    BadLength(u32),
    BadUtf8,
    Truncated(usize),
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad frame magic 0x{:08x}", m),
            Self::BadVersion(v) => write!(f, "unsupported version {}", v),
            Self::BadCommand(c) => write!(f, "invalid command code {}", c),
            Self::BadLength(l) => write!(f, "invalid payload length {}", l),
            Self::BadUtf8 => write!(f, "payload is not valid UTF-8"),
            Self::Truncated(n) => write!(f, "truncated frame ({} bytes)", n),
        }
    }
}

/// One decoded control frame: the command, its string argument and
/// the client's reply FIFO if it wants one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlRequest {
    pub command: CtlCommand,
    pub arg: String,
    pub reply_to: Option<PathBuf>,
}

impl CtlRequest {
    pub fn new(command: CtlCommand, arg: &str) -> Self {
        Self {
            command,
            arg: arg.to_string(),
            reply_to: None,
        }
    }
}

/// Wire format: a fixed 16-byte header
///
/// ```text
/// magic:u32 | version:u16 | command:u16 | arg_len:u32 | flags:u32
/// ```
///
/// followed by `arg_len` payload bytes: the argument string, then
/// optionally a NUL and the reply FIFO path. All integers little
/// endian, `flags` reserved as zero
pub fn encode(req: &CtlRequest) -> Result<Vec<u8>, CtlError> {
    let mut payload = req.arg.as_bytes().to_vec();
    if let Some(reply_to) = &req.reply_to {
        payload.push(0);
        payload.extend_from_slice(
            reply_to.as_os_str().as_encoded_bytes(),
        );
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(CtlError::BadLength(payload.len() as u32));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&CTL_MAGIC.to_le_bytes());
    frame.extend_from_slice(&CTL_VERSION.to_le_bytes());
    frame.extend_from_slice(&(req.command as u16).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the front of `buf`, returning the request
/// and the number of bytes consumed
pub fn decode(buf: &[u8]) -> Result<(CtlRequest, usize), CtlError> {
    if buf.len() < HEADER_LEN {
        return Err(CtlError::Truncated(buf.len()));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != CTL_MAGIC {
        return Err(CtlError::BadMagic(magic));
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if version != CTL_VERSION {
        return Err(CtlError::BadVersion(version));
    }
    let raw_command = u16::from_le_bytes(buf[6..8].try_into().unwrap());
    let command = CtlCommand::from_u16(raw_command)
        .ok_or(CtlError::BadCommand(raw_command))?;
    let arg_len = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if arg_len as usize > MAX_PAYLOAD {
        return Err(CtlError::BadLength(arg_len));
    }
    let end = HEADER_LEN + arg_len as usize;
    if buf.len() < end {
        return Err(CtlError::Truncated(buf.len()));
    }
    let payload = &buf[HEADER_LEN..end];
    let (arg, reply_to) = match payload.iter().position(|&b| b == 0) {
        Some(nul) => {
            let reply =
                std::str::from_utf8(&payload[nul + 1..])
                    .map_err(|_| CtlError::BadUtf8)?;
            (
                &payload[..nul],
                (!reply.is_empty()).then(|| PathBuf::from(reply)),
            )
        }
        None => (payload, None),
    };
    let arg = std::str::from_utf8(arg)
        .map_err(|_| CtlError::BadUtf8)?
        .to_string();
    Ok((
        CtlRequest {
            command,
            arg,
            reply_to,
        },
        end,
    ))
}

/// Outcome of a command, for the client's reply FIFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u8,
    pub text: String,
}

impl Reply {
    fn ok(text: String) -> Self {
        Self {
            status: STATUS_OK,
            text,
        }
    }

    fn err(text: String) -> Self {
        Self {
            status: STATUS_ERR,
            text,
        }
    }
}

/// Apply one decoded command to the supervisor. Every mutation is
/// followed by a kick so the next pass reconciles
pub fn apply(init: &mut Init, req: &CtlRequest) -> Reply {
    let reply = match req.command {
        CtlCommand::Stop => match init.registry.lookup_name(&req.arg) {
            Some(idx) => {
                init.registry.get_mut(idx).unwrap().paused = true;
                Reply::ok(format!("{} stopped", req.arg))
            }
            None => Reply::err(format!("no such service '{}'", req.arg)),
        },
        CtlCommand::Start => match init.registry.lookup_name(&req.arg) {
            Some(idx) => {
                let svc = init.registry.get_mut(idx).unwrap();
                svc.paused = false;
                svc.task_done = false;
                Reply::ok(format!("{} started", req.arg))
            }
            None => Reply::err(format!("no such service '{}'", req.arg)),
        },
        CtlCommand::Restart => match init.registry.lookup_name(&req.arg) {
            Some(idx) => {
                let svc = init.registry.get_mut(idx).unwrap();
                svc.paused = false;
                svc.task_done = false;
                step::stop_record(init, idx);
                Reply::ok(format!("{} restarting", req.arg))
            }
            None => Reply::err(format!("no such service '{}'", req.arg)),
        },
        CtlCommand::Status => Reply::ok(render_status(init)),
        CtlCommand::Runlevel => match parse_runlevel(&req.arg) {
            Some(level) => {
                step::set_runlevel(init, level);
                Reply::ok(format!("runlevel {}", req.arg))
            }
            None => Reply::err(format!("bad runlevel '{}'", req.arg)),
        },
        CtlCommand::Reload => {
            step::reload(init);
            Reply::ok("reloaded".into())
        }
        CtlCommand::Debug => {
            let level = logger::toggle_debug();
            Reply::ok(format!("log level {}", level))
        }
        CtlCommand::Emergency => {
            match spawn::emergency_shell(&init.orig_sigset) {
                Ok(pid) => Reply::ok(format!(
                    "emergency shell pid {}",
                    pid.as_raw_nonzero()
                )),
                Err(e) => Reply::err(format!("emergency shell: {}", e)),
            }
        }
    };
    init.kick();
    reply
}

fn parse_runlevel(arg: &str) -> Option<u8> {
    match arg.trim() {
        "S" | "s" => Some(RUNLEVEL_S),
        n => n.parse::<u8>().ok().filter(|&l| l <= 9),
    }
}

fn render_status(init: &Init) -> String {
    use std::fmt::Write;

    let mut out = format!("runlevel {}\n", init.runlevel);
    for svc in init.registry.iter() {
        let pid = svc
            .pid
            .map(|pid| pid.as_raw_nonzero().to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:>8} {:<8} {}",
            svc.identity.to_string(),
            svc.state,
            pid,
            svc.runlevels,
            svc.descr.as_deref().unwrap_or(""),
        );
    }
    out
}

/// Best-effort reply: a client that went away (or never asked) is
/// not an error worth more than a debug line
fn write_reply(path: &Path, reply: &Reply) {
    let fd = match open(
        path,
        OFlags::WRONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(e) => {
            log::debug!("reply fifo '{}': {}", path.display(), e);
            return;
        }
    };
    let mut buf = vec![reply.status];
    buf.extend_from_slice(reply.text.as_bytes());
    buf.push(b'\n');
    if let Err(e) = write_all(fd.as_fd(), &buf) {
        log::debug!("reply to '{}': {}", path.display(), e);
    }
}

/// The control plugin's state: where the FIFO lives, so EOF can
/// re-create and re-open it
#[derive(Debug)]
pub struct ControlFifo {
    path: PathBuf,
}

impl ControlFifo {
    /// Create (or reuse) the FIFO and open the read end. No write
    /// end is held open: EOF is how client disconnect shows up, and
    /// the io callback answers it by re-opening
    fn open_read_end(&self) -> io::Result<OwnedFd> {
        match mkfifoat(CWD, &self.path, Mode::from_bits_truncate(0o600)) {
            Ok(()) => {}
            Err(e) if e == rustix::io::Errno::EXIST => {}
            Err(e) => return Err(e.into()),
        }
        let fd = open(
            &self.path,
            OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
            Mode::empty(),
        )?;
        Ok(fd)
    }
}

pub fn plugin() -> Plugin {
    let mut plugin = Plugin::new("control");
    plugin.init = Some(control_init);
    plugin.io_cb = Some(control_io);
    plugin
}

fn control_init(init: &mut Init, idx: usize) -> io::Result<()> {
    let path = init.control_path.clone();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let fifo = ControlFifo { path };
    let fd = fifo.open_read_end()?;
    init.plugins[idx].io = Some(PluginIo {
        fd: Some(fd),
        events: rustix::event::epoll::EventFlags::IN,
    });
    init.plugins[idx].data = PluginData::Control(fifo);
    log::info!("control fifo at {}", init.control_path.display());
    Ok(())
}

fn control_io(init: &mut Init, io: &mut PluginIo, data: &mut PluginData) {
    let PluginData::Control(fifo) = data else {
        return;
    };
    let Some(fd) = &io.fd else {
        return;
    };
    let mut buf = [0u8; 4096];
    match rustix::io::read(fd.as_fd(), &mut buf) {
        Ok(0) => {
            // every writer closed; re-open so the next client finds
            // a listener. The dispatcher re-registers whatever fd we
            // leave here
            io.fd = fifo.open_read_end().ok();
            if io.fd.is_none() {
                log::error!("control fifo lost and could not be re-opened");
            }
        }
        Ok(n) => {
            let mut offset = 0usize;
            while offset < n {
                match decode(&buf[offset..n]) {
                    Ok((req, consumed)) => {
                        log::debug!("control: {:?} '{}'", req.command, req.arg);
                        let reply = apply(init, &req);
                        if let Some(reply_to) = &req.reply_to {
                            write_reply(reply_to, &reply);
                        }
                        offset += consumed;
                    }
                    Err(e) => {
                        log::warn!("control frame dropped: {}", e);
                        break;
                    }
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => log::warn!("control fifo read: {}", e),
    }
}
