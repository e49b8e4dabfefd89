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

// ----- Crates -----

#[macro_use]
extern crate log;

// ----- Modules -----

pub mod descriptors;
pub mod ep0;
pub mod gadget;
pub mod logging;
pub mod mapping;
pub mod report;

// ----- Functions -----

use lazy_static::lazy_static;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

lazy_static! {
    /// Process-wide run flag
    /// Cleared by the SIGINT handler; both the EP0 loop and the HID report
    /// generator poll it on each iteration.
    pub static ref RUNNING: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
}
