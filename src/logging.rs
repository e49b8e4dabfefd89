/* Copyright (C) 2020-2022 by Jacob Alexander
 *
 * This file is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This file is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this file.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Logging setup.
//!
//! The default level comes from the command line (each `-v` raises it one
//! step); a `RUST_LOG`-style env spec still overrides it. Stderr is always
//! on. A rotated file log is only kept when the operator names a directory
//! for it with `--log-dir`.

use flexi_logger::Logger;
use std::path::Path;

/// Default level spec for a given -v count
fn level_spec(verbosity: u64) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Logging setup
pub fn setup_logging(verbosity: u64, log_dir: Option<&Path>) {
    let mut logger = Logger::with_env_or_str(level_spec(verbosity))
        .format(flexi_logger::colored_default_format);

    if let Some(dir) = log_dir {
        logger = logger
            .log_to_file()
            .format_for_files(flexi_logger::detailed_format)
            .directory(dir)
            .rotate(
                flexi_logger::Criterion::Size(1_000_000),
                flexi_logger::Naming::Numbers,
                flexi_logger::Cleanup::KeepLogFiles(5),
            )
            .duplicate_to_stderr(flexi_logger::Duplicate::All);
    }

    logger
        .start()
        .unwrap_or_else(|e| panic!("Logger initialization failed {}", e));
    info!("-------------------- composite-joystick starting! --------------------");
    if let Some(dir) = log_dir {
        info!("Log location -> {}", dir.display());
    }
}

// ----- Tests -----
