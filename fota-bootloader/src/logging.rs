// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Routes the `log` records from `fota-core` out through defmt.

use defmt::Display2Format;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct DefmtLogger;

impl Log for DefmtLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        let args = Display2Format(record.args());
        match record.level() {
            Level::Error => defmt::error!("{}", args),
            Level::Warn => defmt::warn!("{}", args),
            Level::Info => defmt::info!("{}", args),
            Level::Debug => defmt::debug!("{}", args),
            Level::Trace => defmt::trace!("{}", args),
        }
    }

    fn flush(&self) {}
}

static LOGGER: DefmtLogger = DefmtLogger;

/// Must run before any other code that logs.
pub fn init(level: LevelFilter) {
    // Single core and called first thing in main, before anything else can log.
    if unsafe { log::set_logger_racy(&LOGGER) }.is_ok() {
        unsafe { log::set_max_level_racy(level) };
    }
}
