// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{io, path::Path, time::Duration};

use serde::Deserialize;

/// Supervisor-wide timing and policy knobs, read once at boot from an
/// optional TOML file. Service records themselves come from the
/// line-oriented config; these are the numbers the state machine runs
/// on
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Grace period between SIGTERM and SIGKILL when stopping.
    pub kill_timeout_secs: u64,
    /// How long a forking daemon gets to produce its pidfile before
    /// the record is declared crashed.
    pub pidfile_timeout_secs: u64,
    /// Minimum pause before respawning an exited service.
    pub restart_cooldown_ms: u64,
    /// Exits within the window beyond this park the record in
    /// crashed until the window elapses.
    pub respawn_limit: u32,
    pub respawn_window_secs: u64,
    /// A tty exiting faster than this is throttled instead of being
    /// respawned immediately.
    pub tty_throttle_secs: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            kill_timeout_secs: 3,
            pidfile_timeout_secs: 5,
            restart_cooldown_ms: 1000,
            respawn_limit: 10,
            respawn_window_secs: 30,
            tty_throttle_secs: 10,
        }
    }
}

impl Tunables {
    /// Load from `path`; a missing file means defaults, a malformed
    /// one is an error the caller reports
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };
        toml::from_str(&raw).map_err(io::Error::other)
    }

    #[inline(always)]
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    #[inline(always)]
    pub fn pidfile_timeout(&self) -> Duration {
        Duration::from_secs(self.pidfile_timeout_secs)
    }

    #[inline(always)]
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    #[inline(always)]
    pub fn respawn_window(&self) -> Duration {
        Duration::from_secs(self.respawn_window_secs)
    }

    #[inline(always)]
    pub fn tty_throttle(&self) -> Duration {
        Duration::from_secs(self.tty_throttle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let tunables = Tunables::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(tunables.respawn_limit, Tunables::default().respawn_limit);
    }

    #[test]
    fn partial_file_overrides_some_knobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primus.toml");
        std::fs::write(&path, "kill_timeout_secs = 7\n").unwrap();
        let tunables = Tunables::load(&path).unwrap();
        assert_eq!(tunables.kill_timeout(), Duration::from_secs(7));
        assert_eq!(
            tunables.respawn_window(),
            Tunables::default().respawn_window()
        );
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primus.toml");
        std::fs::write(&path, "kill_tiemout_secs = 7\n").unwrap();
        assert!(Tunables::load(&path).is_err());
    }
}
