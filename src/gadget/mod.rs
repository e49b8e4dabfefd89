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

//! Thin wrappers around the Linux raw-gadget character device.
//!
//! Every operation maps 1:1 onto a raw-gadget ioctl. All of them treat a
//! negative return as an error; `ep_write_may_fail` is the exception and
//! hands the raw OS error back to the caller so that `ESHUTDOWN` (controller
//! reset) can be told apart from hard failures.
//!
//! A single `Gadget` handle may be shared between threads as long as they
//! operate on disjoint endpoints. The kernel serializes access per endpoint;
//! this crate uses the handle from two threads only ever touching EP0 on one
//! side and the interrupt IN endpoints on the other.

use libc::{c_ulong, c_void};
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{Error, Result};
use std::mem;
use std::os::unix::io::AsRawFd;

/// Character device exposed by the raw_gadget kernel module
pub const RAW_GADGET_PATH: &str = "/dev/raw-gadget";

/// usb_device_speed value for high-speed enumeration
pub const USB_SPEED_HIGH: u8 = 2;

// ----- ioctl request encoding (asm-generic/ioctl.h) -----

pub(crate) const IOC_WRITE: c_ulong = 1;
pub(crate) const IOC_READ: c_ulong = 2;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = 8;
const IOC_SIZESHIFT: c_ulong = 16;
const IOC_DIRSHIFT: c_ulong = 30;

pub(crate) const fn ioc(dir: c_ulong, ty: c_ulong, nr: c_ulong, size: c_ulong) -> c_ulong {
    (dir << IOC_DIRSHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | (size << IOC_SIZESHIFT)
}

pub(crate) const fn io(ty: c_ulong, nr: c_ulong) -> c_ulong {
    ioc(0, ty, nr, 0)
}

// ----- raw-gadget ABI -----

const RAW_MAGIC: c_ulong = b'U' as c_ulong;

const UDC_NAME_LENGTH_MAX: usize = 128;

/// struct usb_raw_init
#[repr(C)]
struct UsbRawInit {
    driver_name: [u8; UDC_NAME_LENGTH_MAX],
    device_name: [u8; UDC_NAME_LENGTH_MAX],
    speed: u8,
}

/// Fixed header of struct usb_raw_event; the payload follows in memory
#[allow(dead_code)]
#[repr(C)]
struct UsbRawEventHeader {
    event_type: u32,
    length: u32,
}

/// Fixed header of struct usb_raw_ep_io; the transfer payload follows
#[allow(dead_code)]
#[repr(C)]
struct UsbRawEpIoHeader {
    ep: u16,
    flags: u16,
    length: u32,
}

const USB_RAW_IOCTL_INIT: c_ulong = ioc(
    IOC_WRITE,
    RAW_MAGIC,
    0,
    mem::size_of::<UsbRawInit>() as c_ulong,
);
const USB_RAW_IOCTL_RUN: c_ulong = io(RAW_MAGIC, 1);
const USB_RAW_IOCTL_EVENT_FETCH: c_ulong = ioc(
    IOC_READ,
    RAW_MAGIC,
    2,
    mem::size_of::<UsbRawEventHeader>() as c_ulong,
);
const USB_RAW_IOCTL_EP0_WRITE: c_ulong = ioc(
    IOC_WRITE,
    RAW_MAGIC,
    3,
    mem::size_of::<UsbRawEpIoHeader>() as c_ulong,
);
const USB_RAW_IOCTL_EP0_READ: c_ulong = ioc(
    IOC_READ | IOC_WRITE,
    RAW_MAGIC,
    4,
    mem::size_of::<UsbRawEpIoHeader>() as c_ulong,
);
// EP_ENABLE takes the 9-byte kernel usb_endpoint_descriptor (audio variant)
const USB_RAW_IOCTL_EP_ENABLE: c_ulong = ioc(IOC_WRITE, RAW_MAGIC, 5, 9);
const USB_RAW_IOCTL_EP_DISABLE: c_ulong = ioc(IOC_WRITE, RAW_MAGIC, 6, 4);
const USB_RAW_IOCTL_EP_WRITE: c_ulong = ioc(
    IOC_WRITE,
    RAW_MAGIC,
    7,
    mem::size_of::<UsbRawEpIoHeader>() as c_ulong,
);
const USB_RAW_IOCTL_EP_READ: c_ulong = ioc(
    IOC_READ | IOC_WRITE,
    RAW_MAGIC,
    8,
    mem::size_of::<UsbRawEpIoHeader>() as c_ulong,
);
const USB_RAW_IOCTL_CONFIGURE: c_ulong = io(RAW_MAGIC, 9);
const USB_RAW_IOCTL_VBUS_DRAW: c_ulong = ioc(IOC_WRITE, RAW_MAGIC, 10, 4);
const USB_RAW_IOCTL_EPS_INFO: c_ulong = ioc(
    IOC_READ,
    RAW_MAGIC,
    11,
    mem::size_of::<EpsInfo>() as c_ulong,
);
const USB_RAW_IOCTL_EP0_STALL: c_ulong = io(RAW_MAGIC, 12);

// ----- Structures -----

/// Standard 8-byte USB setup packet (struct usb_ctrlrequest)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CtrlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

/// Gadget event types reported by EVENT_FETCH
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum EventType {
    Invalid = 0,
    Connect = 1,
    Control = 2,
    Suspend = 3,
    Resume = 4,
    Reset = 5,
    Disconnect = 6,
}

/// One fetched gadget event, with room for a control setup packet
#[repr(C)]
pub struct ControlEvent {
    pub event_type: u32,
    pub length: u32,
    pub ctrl: CtrlRequest,
}

impl ControlEvent {
    pub fn new() -> ControlEvent {
        ControlEvent {
            event_type: 0,
            length: mem::size_of::<CtrlRequest>() as u32,
            ctrl: CtrlRequest::default(),
        }
    }

    pub fn kind(&self) -> EventType {
        EventType::try_from(self.event_type).unwrap_or(EventType::Invalid)
    }
}

impl Default for ControlEvent {
    fn default() -> ControlEvent {
        ControlEvent::new()
    }
}

/// Maximum transfer payload carried by one EpIo
/// Large enough for EP0 (64-byte max packet, multi-packet descriptors) and
/// the 33-byte interrupt reports.
pub const EP_IO_DATA_MAX: usize = 256;

/// Endpoint transfer buffer (struct usb_raw_ep_io plus payload)
#[repr(C)]
pub struct EpIo {
    pub ep: u16,
    pub flags: u16,
    pub length: u32,
    pub data: [u8; EP_IO_DATA_MAX],
}

impl EpIo {
    pub fn new(ep: u16) -> EpIo {
        EpIo {
            ep,
            flags: 0,
            length: 0,
            data: [0; EP_IO_DATA_MAX],
        }
    }
}

pub const USB_RAW_EPS_NUM_MAX: usize = 30;
pub const USB_RAW_EP_NAME_MAX: usize = 16;

/// struct usb_raw_ep_limits
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EpLimits {
    pub maxpacket_limit: u16,
    pub max_streams: u16,
    reserved: u32,
}

/// struct usb_raw_ep_info
/// `caps` packs the kernel bitfield: control/iso/bulk/int capability and
/// in/out direction, one bit each starting at bit 0.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EpInfo {
    pub name: [u8; USB_RAW_EP_NAME_MAX],
    pub addr: u32,
    pub caps: u32,
    pub limits: EpLimits,
}

impl EpInfo {
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn supports_int_in(&self) -> bool {
        // type_int is bit 3, dir_in is bit 4
        self.caps & (1 << 3) != 0 && self.caps & (1 << 4) != 0
    }
}

/// struct usb_raw_eps_info
#[repr(C)]
pub struct EpsInfo {
    pub eps: [EpInfo; USB_RAW_EPS_NUM_MAX],
}

// ----- Gadget handle -----

pub struct Gadget {
    file: File,
}

impl Gadget {
    /// Open the raw-gadget character device
    pub fn open() -> Result<Gadget> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(RAW_GADGET_PATH)?;
        Ok(Gadget { file })
    }

    fn ioctl(&self, request: c_ulong, arg: *mut c_void) -> Result<i32> {
        let rv = unsafe { libc::ioctl(self.file.as_raw_fd(), request, arg) };
        if rv < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rv)
        }
    }

    /// Bind to a UDC and select the enumeration speed
    pub fn init(&self, speed: u8, driver: &str, device: &str) -> Result<()> {
        let mut arg = UsbRawInit {
            driver_name: [0; UDC_NAME_LENGTH_MAX],
            device_name: [0; UDC_NAME_LENGTH_MAX],
            speed,
        };
        copy_name(&mut arg.driver_name, driver);
        copy_name(&mut arg.device_name, device);
        self.ioctl(USB_RAW_IOCTL_INIT, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    /// Start servicing the UDC; events become fetchable afterwards
    pub fn run(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_RUN, std::ptr::null_mut())?;
        Ok(())
    }

    /// Fetch one gadget event; blocks until the UDC reports one
    pub fn event_fetch(&self, event: &mut ControlEvent) -> Result<()> {
        event.event_type = 0;
        event.length = mem::size_of::<CtrlRequest>() as u32;
        self.ioctl(
            USB_RAW_IOCTL_EVENT_FETCH,
            event as *mut _ as *mut c_void,
        )?;
        Ok(())
    }

    /// Reply to the data/status phase of an IN control transfer
    pub fn ep0_write(&self, io: &mut EpIo) -> Result<usize> {
        io.ep = 0;
        let rv = self.ioctl(USB_RAW_IOCTL_EP0_WRITE, io as *mut _ as *mut c_void)?;
        Ok(rv as usize)
    }

    /// Drain the data phase of an OUT control transfer
    pub fn ep0_read(&self, io: &mut EpIo) -> Result<usize> {
        io.ep = 0;
        let rv = self.ioctl(USB_RAW_IOCTL_EP0_READ, io as *mut _ as *mut c_void)?;
        Ok(rv as usize)
    }

    /// Stall EP0 (reject the current control transfer)
    pub fn ep0_stall(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_EP0_STALL, std::ptr::null_mut())?;
        Ok(())
    }

    /// Enable an endpoint; `desc` is the 9-byte kernel usb_endpoint_descriptor
    /// in wire order. Returns the endpoint handle used for later transfers.
    pub fn ep_enable(&self, desc: &[u8; 9]) -> Result<u16> {
        let mut raw = *desc;
        let rv = self.ioctl(
            USB_RAW_IOCTL_EP_ENABLE,
            raw.as_mut_ptr() as *mut c_void,
        )?;
        Ok(rv as u16)
    }

    pub fn ep_disable(&self, ep: u16) -> Result<()> {
        let mut arg: u32 = ep.into();
        self.ioctl(USB_RAW_IOCTL_EP_DISABLE, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    /// Submit a transfer on an enabled endpoint
    /// Unlike the other operations the error is returned to the caller:
    /// `ESHUTDOWN` signals a controller reset and is an expected way for the
    /// report generator to learn the session is over.
    pub fn ep_write_may_fail(&self, io: &mut EpIo) -> Result<usize> {
        let rv = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                USB_RAW_IOCTL_EP_WRITE,
                io as *mut _ as *mut c_void,
            )
        };
        if rv < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(rv as usize)
        }
    }

    /// Read a transfer from an enabled OUT endpoint
    pub fn ep_read(&self, io: &mut EpIo) -> Result<usize> {
        let rv = self.ioctl(USB_RAW_IOCTL_EP_READ, io as *mut _ as *mut c_void)?;
        Ok(rv as usize)
    }

    /// Acknowledge SET_CONFIGURATION towards the UDC
    pub fn configure(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_CONFIGURE, std::ptr::null_mut())?;
        Ok(())
    }

    /// Report the configured bMaxPower draw (2 mA units) to the UDC
    pub fn vbus_draw(&self, power: u32) -> Result<()> {
        let mut arg = power;
        self.ioctl(USB_RAW_IOCTL_VBUS_DRAW, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    /// Query the UDC's endpoint capabilities
    pub fn eps_info(&self) -> Result<Vec<EpInfo>> {
        let mut info: EpsInfo = unsafe { mem::zeroed() };
        let count = self.ioctl(USB_RAW_IOCTL_EPS_INFO, &mut info as *mut _ as *mut c_void)?;
        let count = (count as usize).min(USB_RAW_EPS_NUM_MAX);
        Ok(info.eps[..count].to_vec())
    }
}

/// NUL-padded copy into a fixed-size UDC name field, always leaving a
/// terminating NUL
fn copy_name(dst: &mut [u8; UDC_NAME_LENGTH_MAX], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(UDC_NAME_LENGTH_MAX - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
}

// ----- Tests -----
