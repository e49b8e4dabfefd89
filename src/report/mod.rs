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

//! HID report generation.
//!
//! Runs as a detached thread once the host has configured the device.
//! Multiplexes readiness over all physical input fds, remaps each event onto
//! the virtual joystick state, and submits a 33-byte interrupt report for
//! every joystick whose state changed in the iteration. Exits cleanly when
//! an interrupt write reports `ESHUTDOWN` (host reset / disconnect).

use crate::descriptors::{MAX_BUTTONS, REPORT_LENGTH};
use crate::gadget::{EpIo, Gadget};
use crate::mapping::{AbsInfo, InputDevice, ABS_CNT, KEY_MAX};
use crate::RUNNING;
use libc::c_void;
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Event types (linux/input-event-codes.h)
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;

/// struct input_event as read from an event device
#[repr(C)]
struct RawInputEvent {
    time: libc::timeval,
    kind: u16,
    code: u16,
    value: i32,
}

/// Wire state of one virtual joystick: eight signed axes and a 128-bit
/// button bitmap
#[derive(Clone)]
pub struct VirtualJoystickState {
    report_id: u8,
    axes: [i16; 8],
    buttons: [u8; MAX_BUTTONS / 8],
}

impl VirtualJoystickState {
    pub fn new(report_id: u8) -> VirtualJoystickState {
        VirtualJoystickState {
            report_id,
            axes: [0; 8],
            buttons: [0; MAX_BUTTONS / 8],
        }
    }

    /// Store an axis value; returns whether it changed
    pub fn set_axis(&mut self, axis: usize, value: i16) -> bool {
        if self.axes[axis] == value {
            return false;
        }
        self.axes[axis] = value;
        true
    }

    /// Set or clear one button bit; returns whether the bitmap changed
    pub fn set_button(&mut self, bit: usize, pressed: bool) -> bool {
        let byte = bit / 8;
        let mask = 1u8 << (bit % 8);
        let old = self.buttons[byte];
        if pressed {
            self.buttons[byte] |= mask;
        } else {
            self.buttons[byte] &= !mask;
        }
        self.buttons[byte] != old
    }

    /// Serialize as an interrupt report:
    /// `[report_id, axes (16-bit LE), button bytes]`
    pub fn report(&self) -> [u8; REPORT_LENGTH] {
        let mut out = [0u8; REPORT_LENGTH];
        out[0] = self.report_id;
        for (i, axis) in self.axes.iter().enumerate() {
            out[1 + i * 2..3 + i * 2].copy_from_slice(&axis.to_le_bytes());
        }
        out[17..].copy_from_slice(&self.buttons);
        out
    }
}

/// Rescale a raw absolute-axis value into the signed 16-bit report range.
///
/// The calibration endpoints map onto the rails (`minimum` to -32768,
/// `maximum` to 32767); out-of-range input is clamped first. A zero-width
/// range yields 0. Inversion saturates, so -32768 lands on 32767 rather
/// than wrapping. A non-zero dead zone forces small magnitudes to 0.
pub fn normalize_axis(value: i32, abs: &AbsInfo, invert: bool, dead_zone: i32) -> i16 {
    let min = i64::from(abs.minimum);
    let max = i64::from(abs.maximum);
    let range = max - min;
    if range == 0 {
        return 0;
    }

    let value = i64::from(value).max(min).min(max);
    let scaled = (value - min) * 65535 / range - 32768;
    let mut out = scaled.max(i64::from(i16::MIN)).min(i64::from(i16::MAX)) as i16;

    if invert {
        out = out.saturating_neg();
    }
    if dead_zone > 0 && i32::from(out).abs() < dead_zone {
        out = 0;
    }
    out
}

/// Thread entry: owns the device set for the generator's lifetime.
///
/// Holding the lock until exit also serializes a generator that is still
/// winding down after a bus reset with the one spawned for the next
/// configuration.
pub fn run(
    gadget: Arc<Gadget>,
    devices: Arc<Mutex<Vec<InputDevice>>>,
    ep_int_in0: u16,
    ep_int_in1: u16,
) {
    let mut devices = match devices.lock() {
        Ok(devices) => devices,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(err) = generate(&gadget, &mut devices, ep_int_in0, ep_int_in1) {
        error!("Report generator failed: {}", err);
        std::process::exit(1);
    }
    info!("Report generator finished");
}

fn generate(
    gadget: &Gadget,
    devices: &mut [InputDevice],
    ep_int_in0: u16,
    ep_int_in1: u16,
) -> Result<()> {
    let mut joysticks = [VirtualJoystickState::new(1), VirtualJoystickState::new(2)];
    let endpoints = [ep_int_in0, ep_int_in1];

    while RUNNING.load(Ordering::SeqCst) {
        // Level-triggered readiness over every input fd; one event record is
        // drained per ready fd per iteration
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut read_set) };
        let mut max_fd = -1;
        for dev in devices.iter() {
            if let Some(fd) = dev.fd() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
                max_fd = max_fd.max(fd);
            }
        }
        if max_fd < 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                "no input devices to multiplex",
            ));
        }

        let rv = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rv < 0 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let mut dirty = [false, false];
        for dev in devices.iter_mut() {
            let fd = match dev.fd() {
                Some(fd) => fd,
                None => continue,
            };
            if !unsafe { libc::FD_ISSET(fd, &mut read_set) } {
                continue;
            }

            let mut event: RawInputEvent = unsafe { mem::zeroed() };
            let bytes = unsafe {
                libc::read(
                    fd,
                    &mut event as *mut _ as *mut c_void,
                    mem::size_of::<RawInputEvent>(),
                )
            };
            if bytes < 0 {
                let err = Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN) {
                    warn!("Read error on {}: {}", dev.path.display(), err);
                }
                continue;
            }
            // Partial records are dropped; the kernel delivers whole events
            if bytes as usize != mem::size_of::<RawInputEvent>() {
                continue;
            }

            match event.kind {
                EV_ABS => handle_abs(dev, &event, &mut joysticks, &mut dirty),
                EV_KEY => handle_key(dev, &event, &mut joysticks, &mut dirty),
                _ => {}
            }
        }

        for joy in 0..2 {
            if !dirty[joy] {
                continue;
            }
            let mut io = EpIo::new(endpoints[joy]);
            io.length = REPORT_LENGTH as u32;
            io.data[..REPORT_LENGTH].copy_from_slice(&joysticks[joy].report());
            match gadget.ep_write_may_fail(&mut io) {
                Ok(_) => {}
                Err(err) if err.raw_os_error() == Some(libc::ESHUTDOWN) => {
                    info!("Interrupt endpoint {}: controller reset", joy + 1);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        // Cap the report rate to the endpoint's 1 ms polling interval
        std::thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}

fn handle_abs(
    dev: &InputDevice,
    event: &RawInputEvent,
    joysticks: &mut [VirtualJoystickState; 2],
    dirty: &mut [bool; 2],
) {
    if event.code as usize >= ABS_CNT {
        return;
    }
    let axis = match dev.axes.get(&event.code) {
        Some(axis) => axis,
        None => return,
    };

    let joy = axis.map.virtual_joystick as usize;
    let slot = axis.map.virtual_axis;
    if joy > 1 || !(0..8).contains(&slot) {
        return;
    }

    trace!(
        "{}: abs code={} value={} min={} max={}",
        dev.name,
        event.code,
        event.value,
        axis.abs.minimum,
        axis.abs.maximum
    );

    let value = normalize_axis(event.value, &axis.abs, axis.map.invert, axis.map.dead_zone);
    if joysticks[joy].set_axis(slot as usize, value) {
        dirty[joy] = true;
    }
}

fn handle_key(
    dev: &mut InputDevice,
    event: &RawInputEvent,
    joysticks: &mut [VirtualJoystickState; 2],
    dirty: &mut [bool; 2],
) {
    // value 2 is auto-repeat
    if event.code as usize > KEY_MAX || event.value == 2 {
        return;
    }

    let button = dev.buttons.entry(event.code).or_default();
    if !button.present {
        button.present = true;
        debug!("{}: new button code {}", dev.name, event.code);
    }
    trace!(
        "{}: button {} {}",
        dev.name,
        event.code,
        if event.value != 0 { "pressed" } else { "released" }
    );

    let mapped = button.map.mapped_button;
    if mapped < 0 || mapped as usize >= MAX_BUTTONS {
        return;
    }
    let joy = button.map.virtual_joystick as usize;
    if joy > 1 {
        return;
    }
    if joysticks[joy].set_button(mapped as usize, event.value != 0) {
        dirty[joy] = true;
    }
}

// ----- Tests -----

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(minimum: i32, maximum: i32) -> AbsInfo {
        AbsInfo {
            minimum,
            maximum,
            ..AbsInfo::default()
        }
    }

    #[test]
    fn normalization_endpoints() {
        let cal = abs(-127, 127);
        assert_eq!(normalize_axis(-127, &cal, false, 0), -32768);
        assert_eq!(normalize_axis(127, &cal, false, 0), 32767);

        // Midpoint lands within one count of center
        let mid = normalize_axis(0, &cal, false, 0);
        assert!(mid.abs() <= 1, "midpoint was {}", mid);
    }

    #[test]
    fn normalization_is_monotone() {
        let cal = abs(0, 255);
        let mut last = i16::MIN;
        for value in 0..=255 {
            let out = normalize_axis(value, &cal, false, 0);
            assert!(out >= last, "not monotone at {}", value);
            last = out;
        }
    }

    #[test]
    fn normalization_clamps_out_of_range_input() {
        let cal = abs(0, 1023);
        assert_eq!(normalize_axis(-50, &cal, false, 0), -32768);
        assert_eq!(normalize_axis(5000, &cal, false, 0), 32767);
    }

    #[test]
    fn normalization_zero_width_range() {
        let cal = abs(42, 42);
        assert_eq!(normalize_axis(42, &cal, false, 0), 0);
    }

    #[test]
    fn inversion_saturates_at_bottom_rail() {
        let cal = abs(-127, 127);
        assert_eq!(normalize_axis(-127, &cal, true, 0), 32767);
        assert_eq!(normalize_axis(127, &cal, true, 0), -32767);
    }

    #[test]
    fn dead_zone_forces_small_values_to_zero() {
        let cal = abs(-32768, 32767);
        for value in [-900i32, -1, 0, 1, 899].iter() {
            let out = normalize_axis(*value, &cal, false, 1000);
            assert_eq!(out, 0, "value {} escaped the dead zone", value);
        }
        // Above the threshold values pass through
        assert_ne!(normalize_axis(2000, &cal, false, 1000), 0);
    }

    #[test]
    fn axis_remap_scenario() {
        // Calibration [-127, 127], dead zone 1000, mapped to (joy 1, axis 3)
        let cal = abs(-127, 127);
        let dead_zone = 1000;
        let mut joy1 = VirtualJoystickState::new(2);

        let expectations = [
            (-127, -32768i16),
            (0, 0),     // normalizes to -1, inside the dead zone
            (64, 16512), // (191 * 65535) / 254 - 32768
            (127, 32767),
        ];
        for (input, expected) in expectations.iter() {
            let value = normalize_axis(*input, &cal, false, dead_zone);
            assert_eq!(value, *expected, "input {}", input);
            joy1.set_axis(3, value);
            let report = joy1.report();
            assert_eq!(report[0], 2);
            let slot = i16::from_le_bytes([report[1 + 3 * 2], report[2 + 3 * 2]]);
            assert_eq!(slot, *expected);
        }
    }

    #[test]
    fn report_layout() {
        let mut joy = VirtualJoystickState::new(1);
        joy.set_axis(0, -2);
        joy.set_axis(7, 0x1234);
        joy.set_button(0, true);
        joy.set_button(127, true);

        let report = joy.report();
        assert_eq!(report.len(), REPORT_LENGTH);
        assert_eq!(report[0], 1);
        assert_eq!(&report[1..3], &[0xfe, 0xff]); // -2 LE
        assert_eq!(&report[15..17], &[0x34, 0x12]);
        assert_eq!(report[17], 0x01); // bit 0 of byte 0
        assert_eq!(report[32], 0x80); // bit 127 = bit 7 of byte 15
    }

    #[test]
    fn button_state_tracks_most_recent_value() {
        let mut joy = VirtualJoystickState::new(1);

        // Press then release of a button mapped onto bit 7: exactly two
        // state changes, each worth one report
        assert!(joy.set_button(7, true));
        assert_eq!(joy.report()[17], 0x80);
        assert!(!joy.set_button(7, true)); // repeat press, no change
        assert!(joy.set_button(7, false));
        assert_eq!(joy.report()[17], 0x00);
        assert!(!joy.set_button(7, false));
    }

    #[test]
    fn axis_change_detection() {
        let mut joy = VirtualJoystickState::new(1);
        assert!(!joy.set_axis(2, 0)); // already zero
        assert!(joy.set_axis(2, 100));
        assert!(!joy.set_axis(2, 100));
        assert!(joy.set_axis(2, 101));
    }
}
