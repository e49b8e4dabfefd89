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

//! Physical input device discovery and the persisted axis/button mapping.
//!
//! Devices are enumerated from `/dev/input/event*`, their axis and key
//! capabilities queried over evdev ioctls, and the true button code range
//! recovered from the matching `/dev/hidraw*` report descriptor. Assignments
//! onto the two virtual joysticks are persisted as JSON and merged back onto
//! the detected device set on the next run, keyed by the
//! bustype/vendor/product/version quadruple.

// ----- Crates -----

use crate::gadget::{ioc, IOC_READ};
use glob::glob;
use libc::{c_ulong, c_void};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

// ----- Constants -----

/// Number of absolute-axis codes (linux/input-event-codes.h ABS_CNT)
pub const ABS_CNT: usize = 0x40;
/// Highest key/button code (linux/input-event-codes.h KEY_MAX)
pub const KEY_MAX: usize = 0x2ff;

/// First joystick button code (BTN_JOYSTICK); hidraw button usages are
/// translated into this range
const BTN_JOYSTICK: u16 = 0x120;

/// Input devices whose name contains this string are ignored (HDMI CEC
/// pseudo-inputs on the Raspberry Pi)
const IGNORED_NAME: &str = "vc4-hdmi";

const INPUT_GLOB: &str = "/dev/input/event*";
const HIDRAW_GLOB: &str = "/dev/hidraw*";

// ----- evdev / hidraw ioctls -----

const EVDEV_MAGIC: c_ulong = b'E' as c_ulong;
const HIDRAW_MAGIC: c_ulong = b'H' as c_ulong;

const fn eviocgname(len: usize) -> c_ulong {
    ioc(IOC_READ, EVDEV_MAGIC, 0x06, len as c_ulong)
}

const EVIOCGID: c_ulong = ioc(
    IOC_READ,
    EVDEV_MAGIC,
    0x02,
    mem::size_of::<InputId>() as c_ulong,
);

const fn eviocgbit(event_type: u16, len: usize) -> c_ulong {
    ioc(IOC_READ, EVDEV_MAGIC, 0x20 + event_type as c_ulong, len as c_ulong)
}

const fn eviocgabs(abs_code: u16) -> c_ulong {
    ioc(
        IOC_READ,
        EVDEV_MAGIC,
        0x40 + abs_code as c_ulong,
        mem::size_of::<AbsInfo>() as c_ulong,
    )
}

/// hidraw report descriptors are capped at this size by the kernel
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

/// struct hidraw_report_descriptor
#[allow(dead_code)]
#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

/// struct hidraw_devinfo
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HidrawDevInfo {
    bustype: u32,
    vendor: i16,
    product: i16,
}

const HIDIOCGRDESCSIZE: c_ulong = ioc(IOC_READ, HIDRAW_MAGIC, 0x01, 4);
const HIDIOCGRDESC: c_ulong = ioc(
    IOC_READ,
    HIDRAW_MAGIC,
    0x02,
    mem::size_of::<HidrawReportDescriptor>() as c_ulong,
);
const HIDIOCGRAWINFO: c_ulong = ioc(
    IOC_READ,
    HIDRAW_MAGIC,
    0x03,
    mem::size_of::<HidrawDevInfo>() as c_ulong,
);

const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;

// ----- Data model -----

/// struct input_id
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputId {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

/// struct input_absinfo: per-axis calibration reported by the kernel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct AbsInfo {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

/// Assignment of one physical axis onto a virtual joystick slot
#[derive(Clone, Copy, Debug)]
pub struct AxisMapping {
    /// Global axis index, for diagnostics and the mapping file
    pub mapped_axis: i32,
    /// Normalized values below this magnitude are forced to zero (0..=32767)
    pub dead_zone: i32,
    pub invert: bool,
    /// Target virtual joystick (0 or 1)
    pub virtual_joystick: u8,
    /// Target axis slot 0..=7; anything else means unassigned
    pub virtual_axis: i8,
}

impl Default for AxisMapping {
    fn default() -> AxisMapping {
        AxisMapping {
            mapped_axis: -1,
            dead_zone: 0,
            invert: false,
            virtual_joystick: 0,
            virtual_axis: -1,
        }
    }
}

/// Assignment of one physical button onto a virtual joystick bit
#[derive(Clone, Copy, Debug)]
pub struct ButtonMapping {
    /// Target bit 0..=127; -1 means unmapped
    pub mapped_button: i32,
    pub virtual_joystick: u8,
}

impl Default for ButtonMapping {
    fn default() -> ButtonMapping {
        ButtonMapping {
            mapped_button: -1,
            virtual_joystick: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Axis {
    pub abs: AbsInfo,
    pub map: AxisMapping,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ButtonState {
    /// Whether the device is known to emit this code. Buttons first seen at
    /// runtime keep any saved mapping carried here with present = false.
    pub present: bool,
    pub map: ButtonMapping,
}

/// One physical input source with its capabilities and mapping
pub struct InputDevice {
    pub path: PathBuf,
    pub name: String,
    pub id: InputId,
    /// Sparse over present absolute axes, keyed by evdev code
    pub axes: BTreeMap<u16, Axis>,
    /// Sparse over known buttons, keyed by evdev code
    pub buttons: BTreeMap<u16, ButtonState>,
    pub num_axes: u32,
    pub num_buttons: u32,
    file: Option<File>,
}

impl InputDevice {
    fn new(path: PathBuf) -> InputDevice {
        InputDevice {
            path,
            name: String::new(),
            id: InputId::default(),
            axes: BTreeMap::new(),
            buttons: BTreeMap::new(),
            num_axes: 0,
            num_buttons: 0,
            file: None,
        }
    }

    /// Event device fd; None for entries reconstructed from the mapping file
    pub fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }
}

// ----- ioctl helpers -----

fn dev_ioctl(file: &File, request: c_ulong, arg: *mut c_void) -> Result<i32> {
    let rv = unsafe { libc::ioctl(file.as_raw_fd(), request, arg) };
    if rv < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(rv)
    }
}

fn evdev_name(file: &File) -> Result<String> {
    let mut buf = [0u8; 256];
    dev_ioctl(file, eviocgname(buf.len()), buf.as_mut_ptr() as *mut c_void)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn evdev_id(file: &File) -> Result<InputId> {
    let mut id = InputId::default();
    dev_ioctl(file, EVIOCGID, &mut id as *mut _ as *mut c_void)?;
    Ok(id)
}

fn evdev_bitmap(file: &File, event_type: u16, code_count: usize) -> Result<Vec<u8>> {
    let mut bits = vec![0u8; (code_count + 7) / 8];
    dev_ioctl(
        file,
        eviocgbit(event_type, bits.len()),
        bits.as_mut_ptr() as *mut c_void,
    )?;
    Ok(bits)
}

fn evdev_absinfo(file: &File, code: u16) -> Result<AbsInfo> {
    let mut abs = AbsInfo::default();
    dev_ioctl(file, eviocgabs(code), &mut abs as *mut _ as *mut c_void)?;
    Ok(abs)
}

fn bit_set(bits: &[u8], index: usize) -> bool {
    bits.get(index / 8).map_or(false, |b| b & (1 << (index % 8)) != 0)
}

// ----- hidraw correlation -----

/// Scan a HID report descriptor for the button usage range.
///
/// Looks for a Button usage page (05 09) followed by Usage Minimum (19 xx)
/// and Usage Maximum (29 yy) items; only single-byte usage items are
/// considered, which covers every joystick encountered so far.
fn scan_button_range(desc: &[u8]) -> Option<(u8, u8)> {
    let mut page_found = false;
    let mut usage_min = None;
    let mut usage_max = None;
    let mut i = 0;
    while i + 1 < desc.len() {
        if desc[i] == 0x05 && desc[i + 1] == 0x09 {
            page_found = true;
            i += 1;
        } else if page_found && desc[i] == 0x19 {
            usage_min = Some(desc[i + 1]);
            i += 1;
        } else if page_found && desc[i] == 0x29 {
            usage_max = Some(desc[i + 1]);
            break;
        }
        i += 1;
    }
    match (usage_min, usage_max) {
        (Some(min), Some(max)) if min <= max => Some((min, max)),
        _ => None,
    }
}

/// Translate a button usage range into evdev key codes
fn button_codes_from_range(min: u8, max: u8) -> Vec<u16> {
    (min..=max)
        .map(|u| BTN_JOYSTICK + u16::from(u) - 1)
        .collect()
}

/// Read the report descriptor from a hidraw node and extract button codes
fn parse_hidraw_buttons(path: &Path) -> Result<Vec<u16>> {
    let file = File::open(path)?;

    let mut desc_size: i32 = 0;
    dev_ioctl(
        &file,
        HIDIOCGRDESCSIZE,
        &mut desc_size as *mut _ as *mut c_void,
    )?;
    if desc_size <= 0 || desc_size as usize > HID_MAX_DESCRIPTOR_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("bogus report descriptor size {}", desc_size),
        ));
    }

    let mut desc = HidrawReportDescriptor {
        size: desc_size as u32,
        value: [0; HID_MAX_DESCRIPTOR_SIZE],
    };
    dev_ioctl(&file, HIDIOCGRDESC, &mut desc as *mut _ as *mut c_void)?;

    match scan_button_range(&desc.value[..desc_size as usize]) {
        Some((min, max)) => Ok(button_codes_from_range(min, max)),
        None => Err(Error::new(
            ErrorKind::NotFound,
            "no button usage range in report descriptor",
        )),
    }
}

/// Locate the hidraw node belonging to an input device by matching
/// vendor/product/bustype
fn find_hidraw_for_device(id: &InputId) -> Option<PathBuf> {
    let paths = glob(HIDRAW_GLOB).ok()?;
    for entry in paths.flatten() {
        let file = match File::open(&entry) {
            Ok(file) => file,
            Err(_) => continue,
        };
        let mut info = HidrawDevInfo::default();
        if dev_ioctl(&file, HIDIOCGRAWINFO, &mut info as *mut _ as *mut c_void).is_err() {
            continue;
        }
        if info.vendor as u16 == id.vendor
            && info.product as u16 == id.product
            && info.bustype as u16 == id.bustype
        {
            return Some(entry);
        }
    }
    None
}

// ----- Discovery -----

/// Enumerate event devices and build their default mapping.
///
/// The first eight axes of a device land on its virtual axes 0..=7 of
/// joystick 0; devices with more than eight axes alias slots modulo 8 (this
/// aliasing is intentional, the mapping file is the place to spread such
/// devices out). `global_axis_index` keeps allocating across devices so
/// indices stay stable when new hardware appears.
pub fn detect_devices(global_axis_index: &mut i32) -> Vec<InputDevice> {
    let mut devices = vec![];

    let paths = match glob(INPUT_GLOB) {
        Ok(paths) => paths,
        Err(err) => {
            warn!("Could not enumerate {}: {}", INPUT_GLOB, err);
            return devices;
        }
    };

    for path in paths.flatten() {
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!("Skipping {}: {}", path.display(), err);
                continue;
            }
        };

        let mut dev = InputDevice::new(path);
        dev.name = match evdev_name(&file) {
            Ok(name) => name,
            Err(err) => {
                warn!("Name query failed on {}: {}", dev.path.display(), err);
                "Unknown".to_string()
            }
        };
        dev.id = match evdev_id(&file) {
            Ok(id) => id,
            Err(err) => {
                warn!("Id query failed on {}: {}", dev.path.display(), err);
                InputId::default()
            }
        };
        if dev.name.contains(IGNORED_NAME) {
            continue;
        }

        // Absolute axes and their calibration
        match evdev_bitmap(&file, EV_ABS, ABS_CNT) {
            Ok(bits) => {
                for code in 0..ABS_CNT as u16 {
                    if !bit_set(&bits, code as usize) {
                        continue;
                    }
                    let abs = match evdev_absinfo(&file, code) {
                        Ok(abs) => abs,
                        Err(_) => continue,
                    };
                    dev.num_axes += 1;
                    let map = AxisMapping {
                        mapped_axis: *global_axis_index,
                        dead_zone: 0,
                        invert: false,
                        virtual_joystick: 0,
                        virtual_axis: ((dev.num_axes - 1) % 8) as i8,
                    };
                    *global_axis_index += 1;
                    dev.axes.insert(code, Axis { abs, map });
                }
            }
            Err(err) => warn!("Axis bitmap query failed on {}: {}", dev.path.display(), err),
        }

        // Buttons
        match evdev_bitmap(&file, EV_KEY, KEY_MAX + 1) {
            Ok(bits) => {
                for code in 0..=KEY_MAX as u16 {
                    if bit_set(&bits, code as usize) {
                        dev.buttons.insert(
                            code,
                            ButtonState {
                                present: true,
                                map: ButtonMapping::default(),
                            },
                        );
                        dev.num_buttons += 1;
                    }
                }
            }
            Err(err) => warn!("Key bitmap query failed on {}: {}", dev.path.display(), err),
        }

        // The evdev key bitmap can under-report joystick buttons; the hidraw
        // report descriptor knows the full usage range
        if let Some(hidraw) = find_hidraw_for_device(&dev.id) {
            match parse_hidraw_buttons(&hidraw) {
                Ok(codes) => {
                    for code in codes {
                        if code as usize <= KEY_MAX {
                            dev.buttons.entry(code).or_default().present = true;
                        }
                    }
                }
                Err(err) => {
                    debug!("No button range from {}: {}", hidraw.display(), err);
                }
            }
        }

        info!(
            "Device {} ({}) -> {} axes, {} buttons",
            dev.path.display(),
            dev.name,
            dev.num_axes,
            dev.num_buttons
        );
        dev.file = Some(file);
        devices.push(dev);
    }

    devices
}

// ----- Persistence -----

fn unmapped() -> i32 {
    -1
}

#[derive(Serialize, Deserialize)]
struct SavedAxis {
    code: u16,
    #[serde(default = "unmapped")]
    mapped_axis: i32,
    #[serde(default)]
    dead_zone: i32,
    #[serde(default)]
    invert: bool,
    #[serde(default)]
    virtual_joystick: u8,
    #[serde(default)]
    virtual_axis: Option<i8>,
}

#[derive(Serialize, Deserialize)]
struct SavedButton {
    #[serde(default = "unmapped")]
    mapped_button: i32,
    #[serde(default)]
    virtual_joystick: u8,
}

#[derive(Serialize, Deserialize)]
struct SavedDevice {
    #[serde(default)]
    path: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    bustype: u16,
    #[serde(default)]
    vendor: u16,
    #[serde(default)]
    product: u16,
    #[serde(default)]
    version: u16,
    #[serde(default)]
    num_axes: u32,
    #[serde(default)]
    num_buttons: u32,
    #[serde(default)]
    axes: Vec<SavedAxis>,
    #[serde(default)]
    buttons: BTreeMap<String, SavedButton>,
}

/// On-disk snapshot of the device set plus the allocation counters
#[derive(Serialize, Deserialize)]
struct MappingFile {
    #[serde(default)]
    global_axis_index: i32,
    #[serde(default)]
    global_button_index: i32,
    #[serde(default)]
    devices: Vec<SavedDevice>,
}

impl SavedDevice {
    fn from_device(dev: &InputDevice) -> SavedDevice {
        SavedDevice {
            path: dev.path.display().to_string(),
            name: dev.name.clone(),
            bustype: dev.id.bustype,
            vendor: dev.id.vendor,
            product: dev.id.product,
            version: dev.id.version,
            num_axes: dev.num_axes,
            num_buttons: dev.num_buttons,
            axes: dev
                .axes
                .iter()
                .map(|(&code, axis)| SavedAxis {
                    code,
                    mapped_axis: axis.map.mapped_axis,
                    dead_zone: axis.map.dead_zone,
                    invert: axis.map.invert,
                    virtual_joystick: axis.map.virtual_joystick,
                    virtual_axis: Some(axis.map.virtual_axis),
                })
                .collect(),
            buttons: dev
                .buttons
                .iter()
                .filter(|(_, button)| button.present)
                .map(|(code, button)| {
                    (
                        code.to_string(),
                        SavedButton {
                            mapped_button: button.map.mapped_button,
                            virtual_joystick: button.map.virtual_joystick,
                        },
                    )
                })
                .collect(),
        }
    }

    fn into_device(self) -> InputDevice {
        let mut dev = InputDevice::new(PathBuf::from(self.path));
        dev.name = self.name;
        dev.id = InputId {
            bustype: self.bustype,
            vendor: self.vendor,
            product: self.product,
            version: self.version,
        };
        dev.num_axes = self.num_axes;
        dev.num_buttons = self.num_buttons;
        for axis in self.axes {
            if axis.code as usize >= ABS_CNT {
                continue;
            }
            let map = AxisMapping {
                mapped_axis: axis.mapped_axis,
                dead_zone: axis.dead_zone.max(0).min(32767),
                invert: axis.invert,
                virtual_joystick: axis.virtual_joystick,
                // Older files predate the explicit slot assignment
                virtual_axis: axis
                    .virtual_axis
                    .unwrap_or((axis.mapped_axis % 8) as i8),
            };
            dev.axes.insert(
                axis.code,
                Axis {
                    abs: AbsInfo::default(),
                    map,
                },
            );
        }
        for (code, button) in self.buttons {
            let code: u16 = match code.parse() {
                Ok(code) => code,
                Err(_) => continue,
            };
            if code as usize > KEY_MAX {
                continue;
            }
            dev.buttons.insert(
                code,
                ButtonState {
                    present: false,
                    map: ButtonMapping {
                        mapped_button: button.mapped_button,
                        virtual_joystick: button.virtual_joystick,
                    },
                },
            );
        }
        dev
    }
}

/// Load a saved mapping; returns the device set and the two allocation
/// counters
pub fn load_mapping(path: &Path) -> Result<(Vec<InputDevice>, i32, i32)> {
    let text = std::fs::read_to_string(path)?;
    let parsed: MappingFile = serde_json::from_str(&text)
        .map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
    let devices = parsed
        .devices
        .into_iter()
        .map(SavedDevice::into_device)
        .collect();
    Ok((devices, parsed.global_axis_index, parsed.global_button_index))
}

/// Persist the mapping as pretty-printed JSON
pub fn save_mapping(
    path: &Path,
    devices: &[InputDevice],
    global_axis_index: i32,
    global_button_index: i32,
) -> Result<()> {
    let file = MappingFile {
        global_axis_index,
        global_button_index,
        devices: devices.iter().map(SavedDevice::from_device).collect(),
    };
    let text = serde_json::to_string_pretty(&file)
        .map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
    std::fs::write(path, text)
}

// ----- Merge -----

/// Replace a detected device's discovery defaults with the saved
/// assignments.
///
/// Saved values win wholesale: axis codes the saved entry does not know
/// revert to unassigned rather than keeping their freshly allocated default.
/// Saved button assignments for codes not yet detected are retained
/// (non-present) so buttons first seen at runtime pick them up.
fn apply_saved(detected: &mut InputDevice, saved: &InputDevice) {
    for (code, axis) in detected.axes.iter_mut() {
        axis.map = saved
            .axes
            .get(code)
            .map(|saved_axis| saved_axis.map)
            .unwrap_or_default();
    }

    let mut buttons = BTreeMap::new();
    for (&code, button) in &detected.buttons {
        buttons.insert(
            code,
            ButtonState {
                present: button.present,
                map: saved
                    .buttons
                    .get(&code)
                    .map(|saved_button| saved_button.map)
                    .unwrap_or_default(),
            },
        );
    }
    for (&code, button) in &saved.buttons {
        buttons.entry(code).or_insert(ButtonState {
            present: false,
            map: button.map,
        });
    }
    detected.buttons = buttons;

    detected.num_axes = saved.num_axes;
    detected.num_buttons = saved.num_buttons;
}

/// Merge the saved device set onto the detected one, in place
pub(crate) fn merge_saved(detected: &mut [InputDevice], saved: &[InputDevice]) {
    for dev in detected.iter_mut() {
        match saved.iter().find(|s| s.id == dev.id) {
            Some(saved_dev) => apply_saved(dev, saved_dev),
            None => info!("New device detected: {}", dev.name),
        }
    }
    for saved_dev in saved {
        if !detected.iter().any(|d| d.id == saved_dev.id) {
            info!("Mapped device '{}' is no longer present", saved_dev.name);
        }
    }
}

// ----- Startup entry point -----

/// Mapping file next to the executable
pub fn default_mapping_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        Error::new(ErrorKind::NotFound, "executable has no parent directory")
    })?;
    Ok(dir.join("mapping.json"))
}

/// Discover devices, merge any saved mapping onto them, and rewrite the
/// mapping file. Returns the final device set and the allocation counters.
pub fn initialize(mapping_path: &Path) -> Result<(Vec<InputDevice>, i32, i32)> {
    let mut global_axis_index = 0;
    let mut global_button_index = 0;
    let mut saved_devices: Vec<InputDevice> = vec![];

    if mapping_path.exists() {
        info!("Loading mapping from {}", mapping_path.display());
        match load_mapping(mapping_path) {
            Ok((devices, axis_index, button_index)) => {
                saved_devices = devices;
                global_axis_index = axis_index;
                global_button_index = button_index;
            }
            Err(err) => {
                warn!("Could not load mapping ({}), starting fresh", err);
            }
        }
    }

    let mut devices = detect_devices(&mut global_axis_index);
    merge_saved(&mut devices, &saved_devices);

    if !devices.is_empty() {
        match save_mapping(mapping_path, &devices, global_axis_index, global_button_index) {
            Ok(()) => info!("Mapping saved to {}", mapping_path.display()),
            Err(err) => warn!("Could not save mapping: {}", err),
        }
    }

    Ok((devices, global_axis_index, global_button_index))
}

// ----- Tests -----

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device(id: InputId) -> InputDevice {
        let mut dev = InputDevice::new(PathBuf::from("/dev/input/event7"));
        dev.name = "Test Pad".to_string();
        dev.id = id;
        dev
    }

    fn pad_id() -> InputId {
        InputId {
            bustype: 0x03,
            vendor: 0x045e,
            product: 0x028e,
            version: 0x0110,
        }
    }

    #[test]
    fn button_range_scan() {
        // The gadget's own joystick descriptor declares buttons 1..=128
        assert_eq!(
            scan_button_range(&crate::descriptors::HID_REPORT_JOY0),
            Some((0x01, 0x80))
        );

        // No button page at all
        assert_eq!(scan_button_range(&[0x05, 0x01, 0x09, 0x04]), None);

        // Inverted range is rejected
        assert_eq!(
            scan_button_range(&[0x05, 0x09, 0x19, 0x08, 0x29, 0x01]),
            None
        );
    }

    #[test]
    fn button_codes_are_btn_joystick_based() {
        assert_eq!(button_codes_from_range(1, 3), vec![0x120, 0x121, 0x122]);
    }

    #[test]
    fn bitmap_indexing() {
        let bits = [0b0000_0101u8, 0b1000_0000];
        assert!(bit_set(&bits, 0));
        assert!(!bit_set(&bits, 1));
        assert!(bit_set(&bits, 2));
        assert!(bit_set(&bits, 15));
        assert!(!bit_set(&bits, 16));
    }

    #[test]
    fn evdev_ioctl_codes() {
        assert_eq!(EVIOCGID, 0x8008_4502);
        assert_eq!(eviocgabs(0), 0x8018_4540);
        assert_eq!(HIDIOCGRAWINFO, 0x8008_4803);
        assert_eq!(HIDIOCGRDESCSIZE, 0x8004_4801);
    }

    #[test]
    fn mapping_round_trip() {
        let mut dev = test_device(pad_id());
        dev.num_axes = 2;
        dev.num_buttons = 1;
        dev.axes.insert(
            0,
            Axis {
                abs: AbsInfo::default(),
                map: AxisMapping {
                    mapped_axis: 0,
                    dead_zone: 512,
                    invert: true,
                    virtual_joystick: 1,
                    virtual_axis: 3,
                },
            },
        );
        dev.axes.insert(
            5,
            Axis {
                abs: AbsInfo::default(),
                map: AxisMapping {
                    mapped_axis: 1,
                    dead_zone: 0,
                    invert: false,
                    virtual_joystick: 0,
                    virtual_axis: 1,
                },
            },
        );
        dev.buttons.insert(
            0x120,
            ButtonState {
                present: true,
                map: ButtonMapping {
                    mapped_button: 7,
                    virtual_joystick: 0,
                },
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        save_mapping(&path, &[dev], 2, 0).unwrap();

        let (devices, global_axis, global_button) = load_mapping(&path).unwrap();
        assert_eq!(global_axis, 2);
        assert_eq!(global_button, 0);
        assert_eq!(devices.len(), 1);

        let dev = &devices[0];
        assert_eq!(dev.name, "Test Pad");
        assert_eq!(dev.id, pad_id());
        assert_eq!(dev.axes.len(), 2);

        let axis = &dev.axes[&0];
        assert_eq!(axis.map.mapped_axis, 0);
        assert_eq!(axis.map.dead_zone, 512);
        assert!(axis.map.invert);
        assert_eq!(axis.map.virtual_joystick, 1);
        assert_eq!(axis.map.virtual_axis, 3);

        let button = &dev.buttons[&0x120];
        assert_eq!(button.map.mapped_button, 7);
        assert_eq!(button.map.virtual_joystick, 0);
    }

    #[test]
    fn load_applies_field_defaults() {
        let text = r#"{
            "global_axis_index": 4,
            "devices": [
                {
                    "name": "Sparse Pad",
                    "bustype": 3, "vendor": 1, "product": 2, "version": 3,
                    "axes": [
                        { "code": 0, "mapped_axis": 11, "dead_zone": 50000 },
                        { "code": 1, "mapped_axis": 3, "dead_zone": -5 }
                    ],
                    "buttons": { "288": {} }
                }
            ]
        }"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, text).unwrap();

        let (devices, global_axis, global_button) = load_mapping(&path).unwrap();
        assert_eq!(global_axis, 4);
        assert_eq!(global_button, 0);

        let dev = &devices[0];
        let axis0 = &dev.axes[&0];
        assert_eq!(axis0.map.dead_zone, 32767); // clamped
        assert_eq!(axis0.map.virtual_axis, 3); // 11 % 8
        assert_eq!(axis0.map.virtual_joystick, 0);
        assert!(!axis0.map.invert);

        let axis1 = &dev.axes[&1];
        assert_eq!(axis1.map.dead_zone, 0); // clamped from below
        assert_eq!(axis1.map.virtual_axis, 3);

        let button = &dev.buttons[&288];
        assert_eq!(button.map.mapped_button, -1);
        assert_eq!(button.map.virtual_joystick, 0);
        assert!(!button.present);
    }

    #[test]
    fn load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_mapping(&path).is_err());
    }

    #[test]
    fn merge_keeps_saved_assignments_for_known_devices() {
        // Detected: known pad (discovery defaults) plus a brand new one
        let mut detected_known = test_device(pad_id());
        detected_known.num_axes = 1;
        detected_known.axes.insert(
            0,
            Axis {
                abs: AbsInfo {
                    minimum: -127,
                    maximum: 127,
                    ..AbsInfo::default()
                },
                map: AxisMapping {
                    mapped_axis: 5,
                    dead_zone: 0,
                    invert: false,
                    virtual_joystick: 0,
                    virtual_axis: 0,
                },
            },
        );
        detected_known.buttons.insert(
            0x130,
            ButtonState {
                present: true,
                map: ButtonMapping::default(),
            },
        );

        let new_id = InputId {
            bustype: 0x03,
            vendor: 0x054c,
            product: 0x05c4,
            version: 0x0100,
        };
        let mut detected_new = test_device(new_id);
        detected_new.axes.insert(
            1,
            Axis {
                abs: AbsInfo::default(),
                map: AxisMapping {
                    mapped_axis: 6,
                    dead_zone: 0,
                    invert: false,
                    virtual_joystick: 0,
                    virtual_axis: 0,
                },
            },
        );

        // Saved: the known pad with a custom assignment, plus one that is
        // gone now
        let mut saved_known = test_device(pad_id());
        saved_known.num_axes = 1;
        saved_known.axes.insert(
            0,
            Axis {
                abs: AbsInfo::default(),
                map: AxisMapping {
                    mapped_axis: 0,
                    dead_zone: 900,
                    invert: true,
                    virtual_joystick: 1,
                    virtual_axis: 4,
                },
            },
        );
        saved_known.buttons.insert(
            0x130,
            ButtonState {
                present: false,
                map: ButtonMapping {
                    mapped_button: 12,
                    virtual_joystick: 1,
                },
            },
        );
        // A saved-only button, e.g. discovered during a previous session
        saved_known.buttons.insert(
            0x131,
            ButtonState {
                present: false,
                map: ButtonMapping {
                    mapped_button: 13,
                    virtual_joystick: 1,
                },
            },
        );
        let gone = test_device(InputId {
            bustype: 5,
            vendor: 6,
            product: 7,
            version: 8,
        });

        let mut detected = vec![detected_known, detected_new];
        merge_saved(&mut detected, &[saved_known, gone]);

        // Known device took the saved assignment
        let known = &detected[0];
        let axis = &known.axes[&0];
        assert_eq!(axis.map.dead_zone, 900);
        assert!(axis.map.invert);
        assert_eq!(axis.map.virtual_joystick, 1);
        assert_eq!(axis.map.virtual_axis, 4);
        // Calibration still comes from detection
        assert_eq!(axis.abs.minimum, -127);
        assert_eq!(axis.abs.maximum, 127);
        // Detected button picked up the saved mapping and stays present
        let button = &known.buttons[&0x130];
        assert!(button.present);
        assert_eq!(button.map.mapped_button, 12);
        // Saved-only button is retained for late discovery
        let late = &known.buttons[&0x131];
        assert!(!late.present);
        assert_eq!(late.map.mapped_button, 13);

        // New device keeps its discovery defaults
        let new = &detected[1];
        assert_eq!(new.axes[&1].map.mapped_axis, 6);
        assert_eq!(new.axes[&1].map.virtual_joystick, 0);
    }

    #[test]
    fn merge_unassigns_axes_unknown_to_saved_entry() {
        let mut detected = test_device(pad_id());
        detected.axes.insert(
            2,
            Axis {
                abs: AbsInfo::default(),
                map: AxisMapping {
                    mapped_axis: 9,
                    dead_zone: 0,
                    invert: false,
                    virtual_joystick: 0,
                    virtual_axis: 2,
                },
            },
        );

        // Saved entry for the same device knows nothing about axis 2
        let saved = test_device(pad_id());

        let mut devices = vec![detected];
        merge_saved(&mut devices, &[saved]);

        let axis = &devices[0].axes[&2];
        assert_eq!(axis.map.mapped_axis, -1);
        assert_eq!(axis.map.virtual_axis, -1);
    }
}
