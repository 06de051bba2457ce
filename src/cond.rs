// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use crate::utils::{atomic_write, unlink_quiet};

/// Name of the store generation file, kept next to the condition
/// files themselves and rewritten on every reload
const GEN_FILE: &str = ".gen";

const CONTENT_ON: &[u8] = b"1\n";
const CONTENT_OFF: &[u8] = b"0\n";
const CONTENT_FLUX: &[u8] = b"~\n";

/// Tri-state of a condition.
///
/// `Flux` means "on its way off": it blocks new starts like `Off`
/// does, but does not demand that a running consumer be torn down.
/// Reload leans on this to avoid bouncing unchanged services while
/// their conditions are being re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    Off,
    Flux,
    On,
}

#[derive(Debug, Clone)]
struct Entry {
    state: CondState,
    /// Store generation this entry was last asserted in. An `On`
    /// entry from an older generation reads as `Flux` until a
    /// producer revalidates it.
    r#gen: u32,
    /// Hook-point conditions are set once and have no clear
    /// counterpart; they are exempt from generation staleness.
    oneshot: bool,
}

/// The condition store: a namespaced flag set gating service start.
///
/// Names are path-like (`pid/sshd`, `net/iface/eth0`, `hook/basefs-up`)
/// and mirror to one file each under the store directory, so the
/// flags survive a supervisor reexec and other processes can observe
/// them. File content encodes the state: `1` on, `0` off, `~` flux.
///
/// The in-memory map is authoritative. Until `enable_dir` is called
/// (the directory under /run is not writable in early boot) mutations
/// stay in memory and are flushed when the directory comes up
#[derive(Debug)]
pub struct CondStore {
    dir: PathBuf,
    entries: BTreeMap<String, Entry>,
    generation: u32,
    writable: bool,
    needs_flush: bool,
    kicked: bool,
}

impl CondStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            entries: BTreeMap::new(),
            generation: 0,
            writable: false,
            needs_flush: false,
            kicked: false,
        }
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Condition names are relative path-like strings. Reject
    /// anything that would escape the store directory or collide
    /// with the generation file
    pub fn valid_name(name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('/')
            && !name.ends_with('/')
            && name
                .split('/')
                .all(|seg| !seg.is_empty() && !seg.starts_with('.'))
    }

    /// Effective state of `name`. An `On` entry whose generation tag
    /// is stale reads as `Flux`: the reload marked it on-going-off
    /// and nobody has revalidated it yet
    pub fn get(&self, name: &str) -> Option<CondState> {
        let entry = self.entries.get(name)?;
        match entry.state {
            CondState::On
                if entry.r#gen != self.generation && !entry.oneshot =>
            {
                Some(CondState::Flux)
            }
            state => Some(state),
        }
    }

    #[inline(always)]
    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Assert `name`. Idempotent; an effective change requests a
    /// reconciliation pass
    pub fn set(&mut self, name: &str) {
        self.update(name, CondState::On, false);
    }

    /// Deassert `name`
    pub fn clear(&mut self, name: &str) {
        self.update(name, CondState::Off, false);
    }

    /// Mark `name` transitory: consumers pause but are not torn down
    pub fn flux(&mut self, name: &str) {
        self.update(name, CondState::Flux, false);
    }

    /// Assert `name` with no clear counterpart; used for hook-point
    /// conditions like `hook/basefs-up`
    pub fn set_oneshot(&mut self, name: &str) {
        self.update(name, CondState::On, true);
    }

    fn update(&mut self, name: &str, state: CondState, oneshot: bool) {
        if !Self::valid_name(name) {
            log::warn!("dropping invalid condition name '{}'", name);
            return;
        }
        let before = self.get(name);
        let generation = self.generation;
        let entry = self.entries.entry(name.to_string()).or_insert(Entry {
            state,
            r#gen: generation,
            oneshot,
        });
        entry.state = state;
        entry.r#gen = generation;
        entry.oneshot = entry.oneshot || oneshot;
        if before != Some(state) {
            self.kicked = true;
        }
        self.sync_entry(name);
    }

    /// Re-tag a still-valid entry to the current generation, without
    /// touching its file and without requesting a pass: an `On` entry
    /// stops reading as `Flux`, an `Off` one survives the stale
    /// sweep. This is the per-condition half of reload reassertion
    pub fn validate(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.r#gen = self.generation;
        }
    }

    /// Enter reload: bump the store generation. Every previously-`On`
    /// condition now reads as `Flux` until a producer revalidates it.
    /// No files change, so an unchanged config reloads with no
    /// externally observable flips
    pub fn begin_reload(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.sync_gen();
    }

    /// Drop entries that nobody revalidated during reload. Their
    /// producers are gone; keeping the files around would leak state
    /// into the next generation
    pub fn sweep_stale(&mut self) {
        let generation = self.generation;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.oneshot && e.r#gen != generation)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.entries.remove(&name);
            if self.writable {
                let _ = unlink_quiet(&self.dir.join(&name));
            }
            self.kicked = true;
        }
    }

    /// The condition directory has become writable (basefs is up):
    /// create it and flush everything accumulated so far
    pub fn enable_dir(&mut self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.writable = true;
        self.flush();
        Ok(())
    }

    /// Rebuild the in-memory map from the store directory. Used after
    /// a supervisor reexec, where the files are the only surviving
    /// record of condition state
    pub fn load(&mut self) -> io::Result<()> {
        self.generation = match std::fs::read_to_string(self.dir.join(GEN_FILE))
        {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        self.entries.clear();
        self.load_dir(&self.dir.clone(), "")?;
        self.writable = true;
        Ok(())
    }

    fn load_dir(&mut self, dir: &Path, prefix: &str) -> io::Result<()> {
        for dent in std::fs::read_dir(dir)? {
            let dent = dent?;
            let file_name = dent.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            let name = if prefix.is_empty() {
                file_name.to_string()
            } else {
                format!("{}/{}", prefix, file_name)
            };
            if dent.file_type()?.is_dir() {
                self.load_dir(&dent.path(), &name)?;
                continue;
            }
            let state = match std::fs::read(dent.path())?.first() {
                Some(b'1') => CondState::On,
                Some(b'~') => CondState::Flux,
                _ => CondState::Off,
            };
            self.entries.insert(
                name.clone(),
                Entry {
                    state,
                    r#gen: self.generation,
                    oneshot: name.starts_with("hook/"),
                },
            );
        }
        Ok(())
    }

    /// Names of all declared conditions under a namespace prefix,
    /// for producers that revalidate what they own on reload
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Retry any writes that failed since the last pass
    pub fn retry_flush(&mut self) {
        if self.writable && self.needs_flush {
            self.flush();
        }
    }

    #[inline(always)]
    pub fn take_kick(&mut self) -> bool {
        std::mem::replace(&mut self.kicked, false)
    }

    fn flush(&mut self) {
        self.needs_flush = false;
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            self.sync_entry(&name);
        }
        self.sync_gen();
    }

    fn sync_entry(&mut self, name: &str) {
        if !self.writable {
            return;
        }
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        let content = match entry.state {
            CondState::On => CONTENT_ON,
            CondState::Off => CONTENT_OFF,
            CondState::Flux => CONTENT_FLUX,
        };
        let path = self.dir.join(name);
        let res = match path.parent() {
            Some(parent) => std::fs::create_dir_all(parent)
                .and_then(|()| atomic_write(&path, content)),
            None => atomic_write(&path, content),
        };
        if let Err(e) = res {
            log::warn!("condition '{}' not persisted: {}", name, e);
            self.needs_flush = true;
        }
    }

    fn sync_gen(&mut self) {
        if !self.writable {
            return;
        }
        let content = format!("{}\n", self.generation);
        if let Err(e) =
            atomic_write(&self.dir.join(GEN_FILE), content.as_bytes())
        {
            log::warn!("condition generation not persisted: {}", e);
            self.needs_flush = true;
        }
    }
}
