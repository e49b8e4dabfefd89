/* Copyright (C) 2021-2022 by Jacob Alexander
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

#[macro_use]
extern crate log;

use clap::{crate_version, App, Arg};
use composite_joystick::{ep0, gadget, logging, mapping, RUNNING};
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

const DEFAULT_DEVICE: &str = "dummy_udc.0";
const DEFAULT_DRIVER: &str = "dummy_udc";

fn main() {
    let matches = App::new("composite-joystick")
        .version(crate_version!())
        .about("Composite USB HID joystick gadget")
        .arg(
            Arg::with_name("device")
                .help("UDC device name")
                .index(1),
        )
        .arg(
            Arg::with_name("driver")
                .help("UDC driver name")
                .index(2),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (-v: debug, -vv: trace)"),
        )
        .arg(
            Arg::with_name("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .takes_value(true)
                .help("Keep a rotated log file in DIR in addition to stderr"),
        )
        .get_matches();
    let device = matches.value_of("device").unwrap_or(DEFAULT_DEVICE);
    let driver = matches.value_of("driver").unwrap_or(DEFAULT_DRIVER);

    logging::setup_logging(
        matches.occurrences_of("verbose"),
        matches.value_of("log-dir").map(Path::new),
    );

    // Setup signal handler
    let running = RUNNING.clone();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    if let Err(err) = start(device, driver) {
        error!("{}", err);
        process::exit(1);
    }
    info!("-------------------- composite-joystick exiting! --------------------");
}

fn start(device: &str, driver: &str) -> std::io::Result<()> {
    let mapping_path = mapping::default_mapping_path()?;
    info!("Mapping file: {}", mapping_path.display());

    let gadget = Arc::new(gadget::Gadget::open()?);
    gadget.init(gadget::USB_SPEED_HIGH, driver, device)?;
    gadget.run()?;

    match gadget.eps_info() {
        Ok(eps) => {
            for ep in &eps {
                debug!(
                    "udc endpoint {}: addr=0x{:02x} maxpacket={} int_in={}",
                    ep.name(),
                    ep.addr,
                    ep.limits.maxpacket_limit,
                    ep.supports_int_in()
                );
            }
        }
        Err(err) => warn!("Endpoint capability query failed: {}", err),
    }

    let (devices, global_axis_index, _global_button_index) = mapping::initialize(&mapping_path)?;
    info!("Total axes found: {}", global_axis_index);
    if devices.is_empty() {
        return Err(Error::new(
            ErrorKind::NotFound,
            "no joystick/gamepad devices found",
        ));
    }

    let devices = Arc::new(Mutex::new(devices));
    ep0::ep0_loop(gadget, devices)
}
