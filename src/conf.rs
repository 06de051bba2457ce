// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    ffi::CString,
    fmt, io,
    path::{Path, PathBuf},
};

use crate::service::{
    Credentials, Identity, Registry, Rlimit, Runlevels, Service, SvcKind,
};

const MAX_INCLUDE_DEPTH: usize = 8;

/// Configuration errors. Any of these rejects the whole file: the
/// previously applied generation stays live and no record is
/// half-applied
#[derive(Debug)]
pub enum ConfError {
    Io(PathBuf, io::Error),
    Syntax {
        file: PathBuf,
        line: usize,
        msg: String,
    },
    /// Start-condition cycle among the named services.
    Cycle(Vec<String>),
    IncludeDepth(PathBuf),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "{}: {}", path.display(), e),
            Self::Syntax { file, line, msg } => {
                write!(f, "{}:{}: {}", file.display(), line, msg)
            }
            Self::Cycle(names) => {
                write!(f, "service condition cycle: {}", names.join(" -> "))
            }
            Self::IncludeDepth(path) => {
                write!(f, "{}: includes nested too deep", path.display())
            }
        }
    }
}

/// A parsed record before it's applied to the registry: the
/// declarative attribute set and nothing else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDecl {
    pub identity: Identity,
    pub argv: Vec<CString>,
    pub runlevels: Runlevels,
    pub conditions: Vec<String>,
    pub pidfile: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub creds: Option<Credentials>,
    pub descr: Option<String>,
    pub port: Option<u16>,
}

/// Result of parsing a config tree: records in file order plus the
/// file-scope directives
#[derive(Debug, Default)]
pub struct Conf {
    pub records: Vec<RecordDecl>,
    pub runlevel: Option<u8>,
    pub rlimits: Vec<Rlimit>,
}

pub fn parse_file(path: &Path, rundir: &Path) -> Result<Conf, ConfError> {
    let mut conf = Conf::default();
    parse_into(path, rundir, &mut conf, 0)?;
    check_cycles(&conf.records)?;
    Ok(conf)
}

fn parse_into(
    path: &Path,
    rundir: &Path,
    conf: &mut Conf,
    depth: usize,
) -> Result<(), ConfError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfError::IncludeDepth(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfError::Io(path.to_path_buf(), e))?;
    for (line_no, raw_line) in raw.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let syntax = |msg: String| ConfError::Syntax {
            file: path.to_path_buf(),
            line: line_no + 1,
            msg,
        };
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word {
            "include" => {
                if rest.is_empty() {
                    return Err(syntax("include needs a path".into()));
                }
                parse_into(Path::new(rest), rundir, conf, depth + 1)?;
            }
            "runlevel" => {
                let level = rest
                    .parse::<u8>()
                    .ok()
                    .filter(|l| (1..=9).contains(l))
                    .ok_or_else(|| {
                        syntax(format!("bad runlevel '{}'", rest))
                    })?;
                conf.runlevel = Some(level);
            }
            "rlimit" => {
                conf.rlimits.push(parse_rlimit(rest).map_err(syntax)?);
            }
            _ => match SvcKind::from_directive(word) {
                Some(kind) => {
                    let decl =
                        parse_record(kind, rest, rundir).map_err(syntax)?;
                    conf.records.push(decl);
                }
                None => {
                    return Err(syntax(format!("unknown directive '{}'", word)));
                }
            },
        }
    }
    Ok(())
}

/// Parse a record body: options in any order (`[levels]`, `<conds>`,
/// `pid:`, `name:`, `id:`, `env:`, `@user[:group]`), then the command
/// and its arguments, then an optional `-- description`
fn parse_record(
    kind: SvcKind,
    body: &str,
    rundir: &Path,
) -> Result<RecordDecl, String> {
    let (body, descr) = match body.split_once(" -- ") {
        Some((body, descr)) => (body.trim(), Some(descr.trim().to_string())),
        None => (body, None),
    };
    let mut tokens = body.split_whitespace().peekable();

    let mut runlevels = Runlevels::standard();
    let mut conditions = Vec::new();
    let mut pidfile = None;
    let mut name_override: Option<String> = None;
    let mut instance: Option<String> = None;
    let mut env = Vec::new();
    let mut creds = None;
    let mut port = None;

    while let Some(&token) = tokens.peek() {
        if let Some(body) = token.strip_prefix('[') {
            let body = body.strip_suffix(']').ok_or("unterminated '['")?;
            runlevels = Runlevels::parse(body)
                .ok_or_else(|| format!("bad runlevel set '[{}]'", body))?;
        } else if let Some(body) = token.strip_prefix('<') {
            let body = body.strip_suffix('>').ok_or("unterminated '<'")?;
            for cond in body.split(',').filter(|c| !c.is_empty()) {
                conditions.push(cond.to_string());
            }
        } else if let Some(path) = token.strip_prefix("pid:") {
            if !path.starts_with('/') {
                return Err(format!("pidfile '{}' is not absolute", path));
            }
            let path = PathBuf::from(path);
            check_pidfile_depth(&path, rundir)?;
            pidfile = Some(path);
        } else if let Some(name) = token.strip_prefix("name:") {
            name_override = Some(name.to_string());
        } else if let Some(id) = token.strip_prefix("id:") {
            instance = Some(id.to_string());
        } else if let Some(pair) = token.strip_prefix("env:") {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("bad env override '{}'", pair))?;
            env.push((key.to_string(), value.to_string()));
        } else if let Some(spec) = token.strip_prefix('@') {
            creds = Some(resolve_creds(spec)?);
        } else if kind == SvcKind::Inetd && port.is_none() {
            let spec = token
                .strip_prefix("tcp/")
                .ok_or_else(|| format!("bad inetd listener '{}'", token))?;
            port = Some(
                spec.parse::<u16>()
                    .map_err(|_| format!("bad inetd port '{}'", spec))?,
            );
        } else {
            break;
        }
        tokens.next();
    }

    let argv: Vec<&str> = tokens.collect();
    if argv.is_empty() {
        return Err("missing command".into());
    }
    if !argv[0].starts_with('/') {
        return Err(format!("command '{}' is not an absolute path", argv[0]));
    }
    if kind == SvcKind::Inetd && port.is_none() {
        return Err("inetd needs a tcp/PORT listener spec".into());
    }

    // ttys are keyed by their terminal device so several getty
    // records can share a binary
    if kind == SvcKind::Tty && instance.is_none() && argv.len() > 1 {
        instance = argv.last().map(|s| s.to_string());
    }

    let identity = Identity::from_command(
        kind,
        argv[0],
        name_override.as_deref(),
        instance.as_deref(),
    );

    // forking scripts always daemonize; derive the conventional
    // pidfile when none is declared
    if pidfile.is_none() && kind == SvcKind::Sysv {
        pidfile = Some(rundir.join(format!("{}.pid", identity.name)));
    }

    let argv = argv
        .into_iter()
        .map(|arg| CString::new(arg).map_err(|_| "NUL in argument".to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RecordDecl {
        identity,
        argv,
        runlevels,
        conditions,
        pidfile,
        env,
        creds,
        descr,
        port,
    })
}

/// The watcher only descends one directory level below the watch
/// root; a pidfile deeper than that would never be seen, so reject it
/// loudly instead of letting the service hang in starting
fn check_pidfile_depth(path: &Path, rundir: &Path) -> Result<(), String> {
    let depth = path
        .strip_prefix(rundir)
        .map(|rel| rel.components().count())
        .unwrap_or(usize::MAX);
    if depth > 2 {
        return Err(format!(
            "pidfile '{}' is more than one directory below '{}' and would \
             never be picked up; move it up or adjust --rundir",
            path.display(),
            rundir.display()
        ));
    }
    Ok(())
}

fn parse_rlimit(body: &str) -> Result<Rlimit, String> {
    let mut words = body.split_whitespace();
    let mut which = words.next().ok_or("rlimit needs a resource")?;
    let scope = match which {
        "soft" | "hard" => {
            let scope = which;
            which = words.next().ok_or("rlimit needs a resource")?;
            Some(scope)
        }
        _ => None,
    };
    let resource = rlimit_resource(which)
        .ok_or_else(|| format!("unknown rlimit resource '{}'", which))?;
    let value = words.next().ok_or("rlimit needs a value")?;
    if words.next().is_some() {
        return Err("trailing junk after rlimit value".into());
    }
    let value = match value {
        "unlimited" | "infinity" => libc::RLIM_INFINITY,
        n => n
            .parse::<libc::rlim_t>()
            .map_err(|_| format!("bad rlimit value '{}'", n))?,
    };
    let (soft, hard) = match scope {
        Some("soft") => (value, libc::RLIM_INFINITY),
        Some("hard") => (value, value),
        _ => (value, value),
    };
    Ok(Rlimit {
        resource,
        soft,
        hard,
    })
}

fn rlimit_resource(name: &str) -> Option<i32> {
    let resource = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource as i32)
}

/// Resolve an `@user[:group]` credential spec at parse time; nothing
/// name-service related may run between fork and exec
fn resolve_creds(spec: &str) -> Result<Credentials, String> {
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };
    let (uid, pw_gid) = match user.parse::<libc::uid_t>() {
        Ok(uid) => (uid, None),
        Err(_) => {
            let name = CString::new(user).map_err(|_| "NUL in user name")?;
            let pw = unsafe { libc::getpwnam(name.as_ptr()) };
            if pw.is_null() {
                return Err(format!("unknown user '{}'", user));
            }
            unsafe { ((*pw).pw_uid, Some((*pw).pw_gid)) }
        }
    };
    let gid = match group {
        Some(group) => match group.parse::<libc::gid_t>() {
            Ok(gid) => gid,
            Err(_) => {
                let name =
                    CString::new(group).map_err(|_| "NUL in group name")?;
                let gr = unsafe { libc::getgrnam(name.as_ptr()) };
                if gr.is_null() {
                    return Err(format!("unknown group '{}'", group));
                }
                unsafe { (*gr).gr_gid }
            }
        },
        None => pw_gid.unwrap_or(uid),
    };
    Ok(Credentials {
        uid,
        gid,
        groups: vec![gid],
    })
}

/// Reject start-condition cycles through `service/*` conditions.
/// Resolution is out of the question; a cycle is a config error
fn check_cycles(records: &[RecordDecl]) -> Result<(), ConfError> {
    use std::collections::HashMap;

    let by_cond: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(idx, decl)| (decl.identity.cond_name(), idx))
        .collect();

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut color = vec![0u8; records.len()];
    let mut stack = Vec::new();

    fn visit(
        idx: usize,
        records: &[RecordDecl],
        by_cond: &HashMap<String, usize>,
        color: &mut [u8],
        stack: &mut Vec<usize>,
    ) -> Result<(), ConfError> {
        color[idx] = 1;
        stack.push(idx);
        for cond in &records[idx].conditions {
            let Some(&dep) = by_cond.get(cond) else {
                continue;
            };
            match color[dep] {
                0 => visit(dep, records, by_cond, color, stack)?,
                1 => {
                    let start =
                        stack.iter().position(|&i| i == dep).unwrap_or(0);
                    let mut names: Vec<String> = stack[start..]
                        .iter()
                        .map(|&i| records[i].identity.short())
                        .collect();
                    names.push(records[dep].identity.short());
                    return Err(ConfError::Cycle(names));
                }
                _ => {}
            }
        }
        stack.pop();
        color[idx] = 2;
        Ok(())
    }

    for idx in 0..records.len() {
        if color[idx] == 0 {
            visit(idx, records, &by_cond, &mut color, &mut stack)?;
        }
    }
    Ok(())
}

/// Apply a parsed configuration to the registry.
///
/// Expects `mark_all_dirty` to have run. Untouched records stay dirty
/// and are doomed by the sweep; records whose declarative attributes
/// changed are updated in place and kept dirty so the state machine
/// restarts them; unchanged records come out clean and are never
/// bounced. Returns whether anything differed
pub fn apply(registry: &mut Registry, conf: &Conf, conf_gen: u32) -> bool {
    let mut any_change = false;
    for decl in &conf.records {
        match registry.lookup_ident(&decl.identity) {
            Some(idx) => {
                let svc = registry.get_mut(idx).unwrap();
                let same = svc.argv == decl.argv
                    && svc.runlevels == decl.runlevels
                    && svc.conditions == decl.conditions
                    && svc.pidfile == decl.pidfile
                    && svc.env == decl.env
                    && svc.creds == decl.creds
                    && svc.descr == decl.descr
                    && svc.port == decl.port
                    && svc.rlimits == conf.rlimits;
                svc.conf_gen = conf_gen;
                if same {
                    svc.dirty = false;
                    continue;
                }
                svc.argv = decl.argv.clone();
                svc.runlevels = decl.runlevels;
                svc.conditions = decl.conditions.clone();
                svc.pidfile = decl.pidfile.clone();
                svc.env = decl.env.clone();
                svc.creds = decl.creds.clone();
                svc.descr = decl.descr.clone();
                svc.port = decl.port;
                svc.rlimits = conf.rlimits.clone();
                svc.dirty = true;
                svc.changed = true;
                any_change = true;
            }
            None => {
                let mut svc =
                    Service::new(decl.identity.clone(), decl.argv.clone());
                svc.runlevels = decl.runlevels;
                svc.conditions = decl.conditions.clone();
                svc.pidfile = decl.pidfile.clone();
                svc.env = decl.env.clone();
                svc.creds = decl.creds.clone();
                svc.descr = decl.descr.clone();
                svc.port = decl.port;
                svc.rlimits = conf.rlimits.clone();
                svc.conf_gen = conf_gen;
                svc.changed = true;
                match registry.insert(svc) {
                    Ok(_) => any_change = true,
                    Err(svc) => {
                        log::warn!(
                            "duplicate record '{}' ignored",
                            svc.identity
                        );
                    }
                }
            }
        }
    }
    registry.rebuild_indices();
    any_change
}
