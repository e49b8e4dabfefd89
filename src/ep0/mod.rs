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

//! EP0 control-transfer engine.
//!
//! Services every standard and HID class request the host issues on
//! endpoint zero. SET_CONFIGURATION enables the two interrupt IN endpoints
//! and starts the HID report generator; unsupported requests stall EP0 and
//! the loop continues.

use crate::descriptors::{
    build_config, string_descriptor, DeviceDescriptor, QualifierDescriptor, CONFIG, DEVICE,
    ENDPOINT0, ENDPOINT1, HID_DT_REPORT, HID_REPORT_JOY0, HID_REPORT_JOY1, QUALIFIER,
    USB_DT_CONFIG, USB_DT_DEVICE, USB_DT_DEVICE_QUALIFIER, USB_DT_OTHER_SPEED_CONFIG,
    USB_DT_STRING,
};
use crate::gadget::{ControlEvent, CtrlRequest, EpIo, EventType, Gadget};
use crate::mapping::InputDevice;
use crate::report;
use crate::RUNNING;
use std::io::Result;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

// bmRequestType fields
const USB_DIR_IN: u8 = 0x80;
const USB_TYPE_MASK: u8 = 0x60;
const USB_TYPE_STANDARD: u8 = 0x00;
const USB_TYPE_CLASS: u8 = 0x20;

// Standard requests
const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
const USB_REQ_SET_CONFIGURATION: u8 = 0x09;
const USB_REQ_GET_INTERFACE: u8 = 0x0a;

// HID class requests
const HID_REQ_SET_REPORT: u8 = 0x09;
const HID_REQ_SET_IDLE: u8 = 0x0a;
const HID_REQ_SET_PROTOCOL: u8 = 0x0b;

/// Fill `data` with the reply to a GET_DESCRIPTOR request.
///
/// Returns the descriptor length, or None for descriptor types this device
/// does not carry (the caller stalls).
pub fn descriptor_reply(ctrl: &CtrlRequest, data: &mut [u8]) -> Option<usize> {
    let descriptor_type = (ctrl.value >> 8) as u8;
    match descriptor_type {
        USB_DT_DEVICE => {
            data[..DeviceDescriptor::SIZE].copy_from_slice(&DEVICE.to_bytes());
            Some(DeviceDescriptor::SIZE)
        }
        USB_DT_DEVICE_QUALIFIER => {
            data[..QualifierDescriptor::SIZE].copy_from_slice(&QUALIFIER.to_bytes());
            Some(QualifierDescriptor::SIZE)
        }
        USB_DT_CONFIG => Some(build_config(data, false)),
        USB_DT_OTHER_SPEED_CONFIG => Some(build_config(data, true)),
        USB_DT_STRING => {
            let string = string_descriptor(ctrl.value as u8);
            data[..string.len()].copy_from_slice(&string);
            Some(string.len())
        }
        HID_DT_REPORT => {
            // wIndex selects the interface
            let report: &[u8] = if ctrl.index == 0 {
                &HID_REPORT_JOY0
            } else {
                &HID_REPORT_JOY1
            };
            data[..report.len()].copy_from_slice(report);
            Some(report.len())
        }
        _ => {
            debug!("ep0: unknown descriptor type 0x{:02x}", descriptor_type);
            None
        }
    }
}

/// Dispatch one control request.
///
/// `Ok(Some(len))` replies with `len` bytes from `io`; `Ok(None)` stalls.
/// Errors are fatal (endpoint enable or UDC configuration failed).
fn ep0_request(
    gadget: &Arc<Gadget>,
    ctrl: &CtrlRequest,
    io: &mut EpIo,
    devices: &Arc<Mutex<Vec<InputDevice>>>,
    hid_started: &mut bool,
) -> Result<Option<usize>> {
    match ctrl.request_type & USB_TYPE_MASK {
        USB_TYPE_STANDARD => match ctrl.request {
            USB_REQ_GET_DESCRIPTOR => Ok(descriptor_reply(ctrl, &mut io.data)),
            USB_REQ_SET_CONFIGURATION => {
                let ep_int_in0 = gadget.ep_enable(&ENDPOINT0.to_gadget_bytes())?;
                let ep_int_in1 = gadget.ep_enable(&ENDPOINT1.to_gadget_bytes())?;
                info!(
                    "ep0: endpoints enabled: int_in0={} int_in1={}",
                    ep_int_in0, ep_int_in1
                );

                gadget.vbus_draw(u32::from(CONFIG.max_power))?;
                gadget.configure()?;

                // One generator per attach; reset/disconnect re-arms
                if !*hid_started {
                    *hid_started = true;
                    let gadget = gadget.clone();
                    let devices = devices.clone();
                    std::thread::spawn(move || {
                        report::run(gadget, devices, ep_int_in0, ep_int_in1);
                    });
                }

                Ok(Some(0))
            }
            USB_REQ_GET_INTERFACE => {
                io.data[0] = 0;
                Ok(Some(1))
            }
            request => {
                debug!("ep0: unsupported standard request 0x{:02x}", request);
                Ok(None)
            }
        },
        USB_TYPE_CLASS => match ctrl.request {
            HID_REQ_SET_REPORT => Ok(Some(1)),
            HID_REQ_SET_IDLE => Ok(Some(0)),
            HID_REQ_SET_PROTOCOL => Ok(Some(0)),
            request => {
                debug!("ep0: unsupported class request 0x{:02x}", request);
                Ok(None)
            }
        },
        _ => {
            debug!(
                "ep0: unknown request type 0x{:02x}",
                ctrl.request_type
            );
            Ok(None)
        }
    }
}

fn log_event(event: &ControlEvent) {
    match event.kind() {
        EventType::Control => debug!(
            "event: control bRequestType=0x{:02x} bRequest=0x{:02x} \
             wValue=0x{:04x} wIndex=0x{:04x} wLength={}",
            event.ctrl.request_type,
            event.ctrl.request,
            event.ctrl.value,
            event.ctrl.index,
            event.ctrl.length
        ),
        kind => debug!("event: {:?}", kind),
    }
}

/// Control-transfer loop; runs until shutdown is requested.
pub fn ep0_loop(gadget: Arc<Gadget>, devices: Arc<Mutex<Vec<InputDevice>>>) -> Result<()> {
    let mut hid_started = false;

    while RUNNING.load(Ordering::SeqCst) {
        let mut event = ControlEvent::new();
        gadget.event_fetch(&mut event)?;
        log_event(&event);

        match event.kind() {
            EventType::Control => {}
            EventType::Reset | EventType::Disconnect => {
                hid_started = false;
                continue;
            }
            _ => continue,
        }

        let mut io = EpIo::new(0);
        let reply = ep0_request(&gadget, &event.ctrl, &mut io, &devices, &mut hid_started)?;
        let length = match reply {
            Some(length) => length,
            None => {
                info!("ep0: stalling");
                gadget.ep0_stall()?;
                continue;
            }
        };

        // Never reply with more than the host asked for
        io.length = length.min(event.ctrl.length as usize) as u32;
        if event.ctrl.request_type & USB_DIR_IN != 0 {
            let transferred = gadget.ep0_write(&mut io)?;
            debug!("ep0: transferred {} bytes (in)", transferred);
        } else {
            let transferred = gadget.ep0_read(&mut io)?;
            debug!("ep0: transferred {} bytes (out)", transferred);
        }
    }

    info!("ep0 loop stopped");
    Ok(())
}

// ----- Tests -----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{CONFIG_TOTAL_LENGTH, HID_DT_HID};

    fn get_descriptor(value: u16, index: u16) -> CtrlRequest {
        CtrlRequest {
            request_type: USB_DIR_IN,
            request: USB_REQ_GET_DESCRIPTOR,
            value,
            index,
            length: 512,
        }
    }

    #[test]
    fn device_descriptor_request() {
        let mut data = [0u8; 256];
        let ctrl = get_descriptor((USB_DT_DEVICE as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(len, DeviceDescriptor::SIZE);
        assert_eq!(&data[..len], &DEVICE.to_bytes());
    }

    #[test]
    fn qualifier_descriptor_request() {
        let mut data = [0u8; 256];
        let ctrl = get_descriptor((USB_DT_DEVICE_QUALIFIER as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(len, QualifierDescriptor::SIZE);
    }

    #[test]
    fn config_descriptor_request() {
        let mut data = [0u8; 256];
        let ctrl = get_descriptor((USB_DT_CONFIG as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(len, CONFIG_TOTAL_LENGTH);
        assert_eq!(data[1], USB_DT_CONFIG);

        let ctrl = get_descriptor((USB_DT_OTHER_SPEED_CONFIG as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(len, CONFIG_TOTAL_LENGTH);
        assert_eq!(data[1], USB_DT_OTHER_SPEED_CONFIG);
    }

    #[test]
    fn string_descriptor_request() {
        let mut data = [0u8; 256];
        let ctrl = get_descriptor((USB_DT_STRING as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(&data[..len], &[0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn hid_report_descriptor_selected_by_interface() {
        let mut data = [0u8; 256];

        let ctrl = get_descriptor((HID_DT_REPORT as u16) << 8, 0);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(&data[..len], &HID_REPORT_JOY0);
        assert_eq!(data[7], 1); // Report ID 1

        let ctrl = get_descriptor((HID_DT_REPORT as u16) << 8, 1);
        let len = descriptor_reply(&ctrl, &mut data).unwrap();
        assert_eq!(&data[..len], &HID_REPORT_JOY1);
        assert_eq!(data[7], 2); // Report ID 2
    }

    #[test]
    fn unknown_descriptor_type_is_unhandled() {
        let mut data = [0u8; 256];
        let ctrl = get_descriptor((HID_DT_HID as u16) << 8, 0);
        assert_eq!(descriptor_reply(&ctrl, &mut data), None);
    }
}
