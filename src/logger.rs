// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Console logger for pid 1: one line per record on stderr, which is
/// the system console until something redirects it. No timestamps;
/// the kernel stamps console output and early boot has no clock
/// worth printing anyway
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        eprintln!("primus: {}: {}", tag, record.args());
    }

    fn flush(&self) {}
}

pub fn init() {
    // a second call can only happen in tests; the first wins there
    // just like everywhere else
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}

/// Flip between info and debug logging; returns the level now in
/// effect. Bound to SIGUSR1 and the DEBUG control command
pub fn toggle_debug() -> LevelFilter {
    let level = match log::max_level() {
        LevelFilter::Debug => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    log::set_max_level(level);
    level
}
