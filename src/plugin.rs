// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::os::fd::{AsFd, OwnedFd};

use rustix::event::epoll::EventFlags;

use crate::Init;
use crate::event::{EventLoop, Source};

/// Named moments in the boot/shutdown sequence. Callbacks registered
/// at a point run in plugin-load order; that ordering is a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPoint {
    Banner,
    RootfsUp,
    BasefsUp,
    NetworkUp,
    SvcPlugin,
    SvcStart,
    SvcReconf,
    SvcStop,
    Shutdown,
}

pub const HOOK_POINTS: usize = 9;

impl HookPoint {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn cond_name(self) -> &'static str {
        match self {
            Self::Banner => "hook/banner",
            Self::RootfsUp => "hook/rootfs-up",
            Self::BasefsUp => "hook/basefs-up",
            Self::NetworkUp => "hook/network-up",
            Self::SvcPlugin => "hook/svc-plugin",
            Self::SvcStart => "hook/svc-start",
            Self::SvcReconf => "hook/svc-reconf",
            Self::SvcStop => "hook/svc-stop",
            Self::Shutdown => "hook/shutdown",
        }
    }

    /// Whether firing this point also posts its oneshot `hook/*`
    /// condition. The store directory under /run only becomes
    /// writable at basefs-up; the points before that must not post,
    /// which is spelled out here rather than left to an ordering
    /// comparison
    pub const fn posts_condition(self) -> bool {
        !matches!(self, Self::Banner | Self::RootfsUp)
    }
}

/// Hook callback: the optional argument is a registry index for the
/// per-service points (SVC_START, SVC_STOP)
pub type HookFn = fn(&mut Init, Option<usize>);

/// One-time setup, invoked immediately after the dispatcher loads
/// the plugin. An error skips the plugin
pub type InitFn = fn(&mut Init, usize) -> io::Result<()>;

/// I/O callback. The watcher is stopped for the duration of the
/// call; the descriptor the plugin leaves in its record is what gets
/// re-registered, so a callback may close and replace its fd
pub type IoFn = fn(&mut Init, &mut PluginIo, &mut PluginData);

/// A plugin's single I/O registration: descriptor plus event mask
#[derive(Debug)]
pub struct PluginIo {
    pub fd: Option<OwnedFd>,
    pub events: EventFlags,
}

/// Per-plugin state, a closed set: the compiled-in collaborators
/// register through the same record shape a dynamically loaded
/// plugin would use, and their state lives here instead of behind an
/// opaque handle
#[derive(Debug, Default)]
pub enum PluginData {
    #[default]
    None,
    Pidfile(crate::pidfile::Watcher),
    Control(crate::control::ControlFifo),
}

pub struct Plugin {
    pub name: &'static str,
    /// Names of plugins that must be registered first.
    pub depends: &'static [&'static str],
    pub hooks: [Option<HookFn>; HOOK_POINTS],
    pub init: Option<InitFn>,
    pub io_cb: Option<IoFn>,
    pub io: Option<PluginIo>,
    pub data: PluginData,
}

impl Plugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            depends: &[],
            hooks: [None; HOOK_POINTS],
            init: None,
            io_cb: None,
            io: None,
            data: PluginData::None,
        }
    }
}

/// The build-time manifest of compiled-in plugins, in default load
/// order
pub fn builtin() -> Vec<Plugin> {
    vec![
        crate::pidfile::plugin(),
        crate::netlink::plugin(),
        crate::control::plugin(),
    ]
}

/// Register a manifest of plugins, resolving dependencies by loading
/// any listed-but-missing plugin first when the manifest carries it.
/// A plugin whose dependencies stay unmet is still loaded, just
/// later and with a complaint; a failed init skips the plugin and
/// the system carries on
pub fn load_plugins(init: &mut Init, manifest: Vec<Plugin>) {
    let mut pending = manifest;
    loop {
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            let ready = pending[i].depends.iter().all(|dep| {
                init.plugins.iter().any(|p| p.name == *dep)
            });
            if ready {
                register(init, pending.remove(i));
                progressed = true;
            } else {
                i += 1;
            }
        }
        if pending.is_empty() || !progressed {
            break;
        }
    }
    for plugin in pending {
        log::warn!(
            "plugin '{}' has unmet dependencies {:?}, loading anyway",
            plugin.name,
            plugin.depends
        );
        register(init, plugin);
    }
    run_hook(init, HookPoint::SvcPlugin, None);
}

fn register(init: &mut Init, plugin: Plugin) {
    // first registration wins; a later load of the same name is a
    // no-op
    if init.plugins.iter().any(|p| p.name == plugin.name) {
        log::debug!("plugin '{}' already registered", plugin.name);
        return;
    }
    let name = plugin.name;
    init.plugins.push(plugin);
    let idx = init.plugins.len() - 1;
    if let Some(init_fn) = init.plugins[idx].init {
        if let Err(e) = init_fn(init, idx) {
            log::warn!("plugin '{}' failed to load: {}, skipped", name, e);
            init.plugins.pop();
            return;
        }
    }
    log::debug!("plugin '{}' registered", name);
}

/// Invoke every callback registered at `point`, in load order, then
/// post the point's oneshot condition where applicable and request a
/// pass
pub fn run_hook(init: &mut Init, point: HookPoint, arg: Option<usize>) {
    for idx in 0..init.plugins.len() {
        if let Some(cb) = init.plugins[idx].hooks[point.index()] {
            cb(init, arg);
        }
    }
    if point.posts_condition() {
        init.conds.set_oneshot(point.cond_name());
        init.kick();
    }
}

/// Register every plugin descriptor with the reactor. Called once
/// after the manifest is loaded
pub fn register_io(ev: &EventLoop, init: &Init) -> io::Result<()> {
    for (idx, plugin) in init.plugins.iter().enumerate() {
        if let Some(io) = &plugin.io {
            if let Some(fd) = &io.fd {
                ev.add(fd.as_fd(), Source::Plugin(idx), io.events)?;
            }
        }
    }
    Ok(())
}

/// Dispatch readiness of plugin `idx`'s descriptor.
///
/// The watcher is stopped first and the plugin's I/O record and
/// state are taken out for the duration of the call, then whatever
/// descriptor the plugin left behind is re-registered. This is what
/// lets the control plugin re-open its FIFO on EOF
pub fn dispatch_io(
    ev: &EventLoop,
    init: &mut Init,
    idx: usize,
) -> io::Result<()> {
    let Some(cb) = init.plugins.get(idx).and_then(|p| p.io_cb) else {
        return Ok(());
    };
    let Some(mut io) = init.plugins[idx].io.take() else {
        return Ok(());
    };
    if let Some(fd) = &io.fd {
        ev.del(fd.as_fd())?;
    }
    let mut data = std::mem::take(&mut init.plugins[idx].data);
    cb(init, &mut io, &mut data);
    init.plugins[idx].data = data;
    if let Some(fd) = &io.fd {
        ev.add(fd.as_fd(), Source::Plugin(idx), io.events)?;
    }
    init.plugins[idx].io = Some(io);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SigSet;
    use crate::tunables::Tunables;
    use std::path::PathBuf;

    fn test_init(dir: &tempfile::TempDir) -> Init {
        let mut init = Init::new(
            PathBuf::from("/nonexistent.conf"),
            dir.path().to_path_buf(),
            dir.path().join("cond"),
            Tunables::default(),
            SigSet::current().unwrap(),
        );
        init.conds.enable_dir().unwrap();
        init
    }

    fn hook_marker(init: &mut Init, _arg: Option<usize>) {
        init.conds.set("test/marker");
    }

    #[test]
    fn duplicate_name_is_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let mut first = Plugin::new("dup");
        first.hooks[HookPoint::Banner.index()] = Some(hook_marker);
        let second = Plugin::new("dup");
        load_plugins(&mut init, vec![first, second]);
        assert_eq!(init.plugins.len(), 1);
        assert!(init.plugins[0].hooks[HookPoint::Banner.index()].is_some());
    }

    #[test]
    fn dependencies_order_loading() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let mut dependent = Plugin::new("b");
        dependent.depends = &["a"];
        let base = Plugin::new("a");
        // manifest order has the dependent first; load order must not
        load_plugins(&mut init, vec![dependent, base]);
        assert_eq!(init.plugins[0].name, "a");
        assert_eq!(init.plugins[1].name, "b");
    }

    #[test]
    fn unmet_dependency_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let mut orphan = Plugin::new("orphan");
        orphan.depends = &["missing"];
        load_plugins(&mut init, vec![orphan]);
        assert_eq!(init.plugins.len(), 1);
    }

    #[test]
    fn failed_init_skips_plugin() {
        fn broken(_init: &mut Init, _idx: usize) -> io::Result<()> {
            Err(io::Error::other("no hardware"))
        }
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let mut plugin = Plugin::new("broken");
        plugin.init = Some(broken);
        load_plugins(&mut init, vec![plugin, Plugin::new("fine")]);
        assert_eq!(init.plugins.len(), 1);
        assert_eq!(init.plugins[0].name, "fine");
    }

    #[test]
    fn hooks_run_and_post_oneshot_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let mut init = test_init(&dir);
        let mut plugin = Plugin::new("marker");
        plugin.hooks[HookPoint::BasefsUp.index()] = Some(hook_marker);
        load_plugins(&mut init, vec![plugin]);

        run_hook(&mut init, HookPoint::BasefsUp, None);
        assert_eq!(
            init.conds.get("test/marker"),
            Some(crate::cond::CondState::On)
        );
        assert_eq!(
            init.conds.get("hook/basefs-up"),
            Some(crate::cond::CondState::On)
        );
        // pre-basefs points do not post
        run_hook(&mut init, HookPoint::Banner, None);
        assert_eq!(init.conds.get("hook/banner"), None);
    }
}
