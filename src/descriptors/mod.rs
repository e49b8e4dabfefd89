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

//! USB descriptor tables for the composite joystick gadget.
//!
//! Descriptors are kept as typed records and serialized to wire order
//! explicitly; multi-byte fields are always emitted little-endian rather than
//! aliasing in-memory layout with the wire layout.

// ----- Descriptor type codes (USB 2.0 ch9 / HID 1.11) -----

pub const USB_DT_DEVICE: u8 = 0x01;
pub const USB_DT_CONFIG: u8 = 0x02;
pub const USB_DT_STRING: u8 = 0x03;
pub const USB_DT_INTERFACE: u8 = 0x04;
pub const USB_DT_ENDPOINT: u8 = 0x05;
pub const USB_DT_DEVICE_QUALIFIER: u8 = 0x06;
pub const USB_DT_OTHER_SPEED_CONFIG: u8 = 0x07;
pub const HID_DT_HID: u8 = 0x21;
pub const HID_DT_REPORT: u8 = 0x22;

pub const USB_CLASS_HID: u8 = 0x03;
pub const USB_DIR_IN: u8 = 0x80;
pub const USB_CONFIG_ATT_ONE: u8 = 0x80;
pub const USB_CONFIG_ATT_SELFPOWER: u8 = 0x40;
pub const USB_ENDPOINT_XFER_INT: u8 = 0x03;

// ----- Device identity -----

pub const BCD_USB: u16 = 0x0200;
pub const USB_VENDOR: u16 = 0x1d6b;
pub const USB_PRODUCT: u16 = 0x0101;
pub const BCD_DEVICE: u16 = 0x0100;
pub const EP0_MAX_PACKET: u8 = 64;

// String descriptor indices
pub const STRING_ID_LANG: u8 = 0;
pub const STRING_ID_MANUFACTURER: u8 = 1;
pub const STRING_ID_PRODUCT: u8 = 2;
pub const STRING_ID_SERIAL: u8 = 3;
pub const STRING_ID_CONFIG: u8 = 4;
pub const STRING_ID_INTERFACE0: u8 = 5;
pub const STRING_ID_INTERFACE1: u8 = 6;

pub const STRING_MANUFACTURER: &str = "MyManufacturer";
pub const STRING_PRODUCT: &str = "Composite Joystick";
pub const STRING_SERIAL: &str = "0001";
pub const STRING_INTERFACE0: &str = "Composite Joystick 0";
pub const STRING_INTERFACE1: &str = "Composite Joystick 1";

// Interrupt IN endpoint numbers for the two HID interfaces
pub const EP_NUM_INT_IN0: u8 = 1;
pub const EP_NUM_INT_IN1: u8 = 2;

/// Buttons carried per virtual joystick
pub const MAX_BUTTONS: usize = 128;

/// Interrupt report length: report id + 8 axes (16-bit LE) + 16 button bytes
pub const REPORT_LENGTH: usize = 1 + 8 * 2 + MAX_BUTTONS / 8;

// ----- HID report descriptors -----

/// Report descriptor for virtual joystick 0 (Report ID 1)
/// Joystick application collection: eight 16-bit signed absolute axes
/// (X, Y, Z, Rx, Ry, Rz, Slider, Dial) followed by 128 1-bit buttons.
pub const HID_REPORT_JOY0: [u8; 53] = [
    0x05, 0x01, //       Usage Page (Generic Desktop)
    0x09, 0x04, //       Usage (Joystick)
    0xA1, 0x01, //       Collection (Application)
    0x85, 0x01, //         Report ID (1)
    0x16, 0x00, 0x80, //   Logical Minimum (-32768)
    0x26, 0xFF, 0x7F, //   Logical Maximum (32767)
    0x75, 0x10, //         Report Size (16)
    0x95, 0x08, //         Report Count (8 axes)
    0x09, 0x30, //         Usage (X)
    0x09, 0x31, //         Usage (Y)
    0x09, 0x32, //         Usage (Z)
    0x09, 0x33, //         Usage (Rx)
    0x09, 0x34, //         Usage (Ry)
    0x09, 0x35, //         Usage (Rz)
    0x09, 0x36, //         Usage (Slider)
    0x09, 0x37, //         Usage (Dial)
    0x81, 0x02, //         Input (Data,Var,Abs) - Axes
    0x05, 0x09, //         Usage Page (Button)
    0x19, 0x01, //         Usage Minimum (Button 1)
    0x29, 0x80, //         Usage Maximum (Button 128)
    0x15, 0x00, //         Logical Minimum (0)
    0x25, 0x01, //         Logical Maximum (1)
    0x75, 0x01, //         Report Size (1)
    0x95, 0x80, //         Report Count (128 buttons)
    0x81, 0x02, //         Input (Data,Var,Abs) - Buttons
    0xC0, //             End Collection
];

/// Report descriptor for virtual joystick 1 (Report ID 2)
pub const HID_REPORT_JOY1: [u8; 53] = [
    0x05, 0x01, //       Usage Page (Generic Desktop)
    0x09, 0x04, //       Usage (Joystick)
    0xA1, 0x01, //       Collection (Application)
    0x85, 0x02, //         Report ID (2)
    0x16, 0x00, 0x80, //   Logical Minimum (-32768)
    0x26, 0xFF, 0x7F, //   Logical Maximum (32767)
    0x75, 0x10, //         Report Size (16)
    0x95, 0x08, //         Report Count (8 axes)
    0x09, 0x30, //         Usage (X)
    0x09, 0x31, //         Usage (Y)
    0x09, 0x32, //         Usage (Z)
    0x09, 0x33, //         Usage (Rx)
    0x09, 0x34, //         Usage (Ry)
    0x09, 0x35, //         Usage (Rz)
    0x09, 0x36, //         Usage (Slider)
    0x09, 0x37, //         Usage (Dial)
    0x81, 0x02, //         Input (Data,Var,Abs) - Axes
    0x05, 0x09, //         Usage Page (Button)
    0x19, 0x01, //         Usage Minimum (Button 1)
    0x29, 0x80, //         Usage Maximum (Button 128)
    0x15, 0x00, //         Logical Minimum (0)
    0x25, 0x01, //         Logical Maximum (1)
    0x75, 0x01, //         Report Size (1)
    0x95, 0x80, //         Report Count (128 buttons)
    0x81, 0x02, //         Input (Data,Var,Abs) - Buttons
    0xC0, //             End Collection
];

// ----- Typed descriptor records -----

/// Standard device descriptor
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = USB_DT_DEVICE;
        out[2..4].copy_from_slice(&self.bcd_usb.to_le_bytes());
        out[4] = self.device_class;
        out[5] = self.device_sub_class;
        out[6] = self.device_protocol;
        out[7] = self.max_packet_size0;
        out[8..10].copy_from_slice(&self.id_vendor.to_le_bytes());
        out[10..12].copy_from_slice(&self.id_product.to_le_bytes());
        out[12..14].copy_from_slice(&self.bcd_device.to_le_bytes());
        out[14] = self.manufacturer;
        out[15] = self.product;
        out[16] = self.serial_number;
        out[17] = self.num_configurations;
        out
    }
}

/// Device-qualifier descriptor (other-speed counterpart of the device
/// descriptor)
pub struct QualifierDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
}

impl QualifierDescriptor {
    pub const SIZE: usize = 10;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = USB_DT_DEVICE_QUALIFIER;
        out[2..4].copy_from_slice(&self.bcd_usb.to_le_bytes());
        out[4] = self.device_class;
        out[5] = self.device_sub_class;
        out[6] = self.device_protocol;
        out[7] = self.max_packet_size0;
        out[8] = self.num_configurations;
        // out[9] is bReserved
        out
    }
}

/// Configuration descriptor header; wTotalLength is back-patched by
/// build_config once the interface block has been emitted
pub struct ConfigDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const SIZE: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = USB_DT_CONFIG;
        // out[2..4] wTotalLength, patched later
        out[4] = self.num_interfaces;
        out[5] = self.configuration_value;
        out[6] = self.configuration;
        out[7] = self.attributes;
        out[8] = self.max_power;
        out
    }
}

/// Standard interface descriptor
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [
            Self::SIZE as u8,
            USB_DT_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_sub_class,
            self.interface_protocol,
            self.interface,
        ]
    }
}

/// HID class descriptor announcing a single report descriptor
pub struct HidDescriptor {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub report_descriptor_length: u16,
}

impl HidDescriptor {
    pub const SIZE: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = HID_DT_HID;
        out[2..4].copy_from_slice(&self.bcd_hid.to_le_bytes());
        out[4] = self.country_code;
        out[5] = 1; // bNumDescriptors
        out[6] = HID_DT_REPORT;
        out[7..9].copy_from_slice(&self.report_descriptor_length.to_le_bytes());
        out
    }
}

/// Endpoint descriptor
/// The configuration block carries the 7-byte wire form; EP_ENABLE wants the
/// kernel's 9-byte usb_endpoint_descriptor (trailing audio fields zero).
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = Self::SIZE as u8;
        out[1] = USB_DT_ENDPOINT;
        out[2] = self.endpoint_address;
        out[3] = self.attributes;
        out[4..6].copy_from_slice(&self.max_packet_size.to_le_bytes());
        out[6] = self.interval;
        out
    }

    pub fn to_gadget_bytes(&self) -> [u8; 9] {
        let wire = self.to_bytes();
        let mut out = [0u8; 9];
        out[..Self::SIZE].copy_from_slice(&wire);
        out
    }
}

// ----- Descriptor instances -----

pub const DEVICE: DeviceDescriptor = DeviceDescriptor {
    bcd_usb: BCD_USB,
    device_class: 0,
    device_sub_class: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET,
    id_vendor: USB_VENDOR,
    id_product: USB_PRODUCT,
    bcd_device: BCD_DEVICE,
    manufacturer: STRING_ID_MANUFACTURER,
    product: STRING_ID_PRODUCT,
    serial_number: STRING_ID_SERIAL,
    num_configurations: 1,
};

pub const QUALIFIER: QualifierDescriptor = QualifierDescriptor {
    bcd_usb: BCD_USB,
    device_class: 0,
    device_sub_class: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET,
    num_configurations: 1,
};

pub const CONFIG: ConfigDescriptor = ConfigDescriptor {
    num_interfaces: 2,
    configuration_value: 1,
    configuration: STRING_ID_CONFIG,
    attributes: USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_SELFPOWER,
    max_power: 0x32, // 100 mA in 2 mA units
};

pub const INTERFACE0: InterfaceDescriptor = InterfaceDescriptor {
    interface_number: 0,
    alternate_setting: 0,
    num_endpoints: 1,
    interface_class: USB_CLASS_HID,
    interface_sub_class: 0,
    interface_protocol: 0,
    interface: STRING_ID_INTERFACE0,
};

pub const INTERFACE1: InterfaceDescriptor = InterfaceDescriptor {
    interface_number: 1,
    alternate_setting: 0,
    num_endpoints: 1,
    interface_class: USB_CLASS_HID,
    interface_sub_class: 0,
    interface_protocol: 0,
    interface: STRING_ID_INTERFACE1,
};

pub const HID0: HidDescriptor = HidDescriptor {
    bcd_hid: 0x0110,
    country_code: 0,
    report_descriptor_length: HID_REPORT_JOY0.len() as u16,
};

pub const HID1: HidDescriptor = HidDescriptor {
    bcd_hid: 0x0110,
    country_code: 0,
    report_descriptor_length: HID_REPORT_JOY1.len() as u16,
};

pub const ENDPOINT0: EndpointDescriptor = EndpointDescriptor {
    endpoint_address: USB_DIR_IN | EP_NUM_INT_IN0,
    attributes: USB_ENDPOINT_XFER_INT,
    max_packet_size: REPORT_LENGTH as u16,
    interval: 1,
};

pub const ENDPOINT1: EndpointDescriptor = EndpointDescriptor {
    endpoint_address: USB_DIR_IN | EP_NUM_INT_IN1,
    attributes: USB_ENDPOINT_XFER_INT,
    max_packet_size: REPORT_LENGTH as u16,
    interval: 1,
};

// ----- Composition -----

fn emit(buf: &mut [u8], offset: usize, bytes: &[u8]) -> usize {
    assert!(
        buf.len() - offset >= bytes.len(),
        "configuration buffer too small: need {} more bytes at offset {}",
        bytes.len(),
        offset
    );
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    offset + bytes.len()
}

/// Serialize the composite configuration block into `buf`.
///
/// Emits the configuration descriptor followed by the
/// interface/HID/endpoint triple of each joystick, then back-patches
/// wTotalLength. When `other_speed` is set the leading descriptor type is
/// rewritten to OTHER_SPEED_CONFIG. Returns the emitted length.
pub fn build_config(buf: &mut [u8], other_speed: bool) -> usize {
    let mut off = 0;
    off = emit(buf, off, &CONFIG.to_bytes());

    // Interface 0 + HID + endpoint
    off = emit(buf, off, &INTERFACE0.to_bytes());
    off = emit(buf, off, &HID0.to_bytes());
    off = emit(buf, off, &ENDPOINT0.to_bytes());

    // Interface 1 + HID + endpoint
    off = emit(buf, off, &INTERFACE1.to_bytes());
    off = emit(buf, off, &HID1.to_bytes());
    off = emit(buf, off, &ENDPOINT1.to_bytes());

    buf[2..4].copy_from_slice(&(off as u16).to_le_bytes());
    if other_speed {
        buf[1] = USB_DT_OTHER_SPEED_CONFIG;
    }
    debug!("Composite config wTotalLength: {}", off);
    off
}

/// Total size of the composite configuration block
pub const CONFIG_TOTAL_LENGTH: usize = ConfigDescriptor::SIZE
    + 2 * (InterfaceDescriptor::SIZE + HidDescriptor::SIZE + EndpointDescriptor::SIZE);

// ----- String descriptors -----

/// Produce the string descriptor for `index`.
///
/// Index 0 is the language table (en-US only); unknown indices yield the
/// empty descriptor `[2, STRING]`.
pub fn string_descriptor(index: u8) -> Vec<u8> {
    match index {
        STRING_ID_LANG => vec![4, USB_DT_STRING, 0x09, 0x04],
        STRING_ID_MANUFACTURER => encode_string(STRING_MANUFACTURER),
        STRING_ID_PRODUCT => encode_string(STRING_PRODUCT),
        STRING_ID_SERIAL => encode_string(STRING_SERIAL),
        STRING_ID_INTERFACE0 => encode_string(STRING_INTERFACE0),
        STRING_ID_INTERFACE1 => encode_string(STRING_INTERFACE1),
        _ => vec![2, USB_DT_STRING],
    }
}

/// Expand ASCII to UTF-16LE with the two-byte descriptor header
fn encode_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len() * 2);
    out.push((2 + s.len() * 2) as u8);
    out.push(USB_DT_STRING);
    for b in s.bytes() {
        out.push(b);
        out.push(0);
    }
    out
}

// ----- Tests -----

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk a descriptor block, returning (type, length) pairs
    fn walk(buf: &[u8]) -> Vec<(u8, usize)> {
        let mut out = vec![];
        let mut off = 0;
        while off < buf.len() {
            let len = buf[off] as usize;
            assert!(len >= 2 && off + len <= buf.len(), "malformed descriptor");
            out.push((buf[off + 1], len));
            off += len;
        }
        out
    }

    #[test]
    fn config_block_layout() {
        let mut buf = [0u8; 256];
        let len = build_config(&mut buf, false);
        assert!(len <= buf.len());
        assert_eq!(len, CONFIG_TOTAL_LENGTH);

        // wTotalLength back-patch
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]) as usize, len);
        assert_eq!(buf[1], USB_DT_CONFIG);

        // Exactly config, (interface, hid, endpoint) x2
        assert_eq!(
            walk(&buf[..len]),
            vec![
                (USB_DT_CONFIG, 9),
                (USB_DT_INTERFACE, 9),
                (HID_DT_HID, 9),
                (USB_DT_ENDPOINT, 7),
                (USB_DT_INTERFACE, 9),
                (HID_DT_HID, 9),
                (USB_DT_ENDPOINT, 7),
            ]
        );
    }

    #[test]
    fn config_block_other_speed() {
        let mut buf = [0u8; 256];
        let len = build_config(&mut buf, true);
        assert_eq!(buf[1], USB_DT_OTHER_SPEED_CONFIG);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]) as usize, len);
    }

    #[test]
    fn config_block_exact_buffer() {
        // A buffer of exactly the required size works; wTotalLength equals
        // the full buffer
        let mut buf = [0u8; CONFIG_TOTAL_LENGTH];
        let len = build_config(&mut buf, false);
        assert_eq!(len, buf.len());
    }

    #[test]
    #[should_panic(expected = "configuration buffer too small")]
    fn config_block_short_buffer() {
        // Room for the configuration descriptor alone is not enough
        let mut buf = [0u8; ConfigDescriptor::SIZE];
        build_config(&mut buf, false);
    }

    #[test]
    fn device_descriptor_bytes() {
        let bytes = DEVICE.to_bytes();
        assert_eq!(bytes[0] as usize, DeviceDescriptor::SIZE);
        assert_eq!(bytes[1], USB_DT_DEVICE);
        assert_eq!(&bytes[2..4], &[0x00, 0x02]); // bcdUSB 2.00
        assert_eq!(&bytes[8..10], &[0x6b, 0x1d]); // idVendor
        assert_eq!(&bytes[10..12], &[0x01, 0x01]); // idProduct
        assert_eq!(bytes[7], EP0_MAX_PACKET);
        assert_eq!(bytes[17], 1);
    }

    #[test]
    fn qualifier_descriptor_bytes() {
        let bytes = QUALIFIER.to_bytes();
        assert_eq!(bytes[0] as usize, QualifierDescriptor::SIZE);
        assert_eq!(bytes[1], USB_DT_DEVICE_QUALIFIER);
        assert_eq!(bytes[9], 0); // bReserved
    }

    #[test]
    fn endpoint_descriptors() {
        let ep0 = ENDPOINT0.to_bytes();
        assert_eq!(ep0[2], 0x81);
        assert_eq!(ep0[3], USB_ENDPOINT_XFER_INT);
        assert_eq!(u16::from_le_bytes([ep0[4], ep0[5]]) as usize, REPORT_LENGTH);
        assert_eq!(ep0[6], 1);

        let ep1 = ENDPOINT1.to_bytes();
        assert_eq!(ep1[2], 0x82);

        // Gadget form is the wire form padded with the audio fields
        let gadget = ENDPOINT0.to_gadget_bytes();
        assert_eq!(&gadget[..7], &ep0);
        assert_eq!(&gadget[7..], &[0, 0]);
    }

    #[test]
    fn report_descriptors() {
        // Only the Report ID byte differs between the two joysticks
        assert_eq!(HID_REPORT_JOY0[6], 0x85);
        assert_eq!(HID_REPORT_JOY0[7], 1);
        assert_eq!(HID_REPORT_JOY1[7], 2);
        let mut patched = HID_REPORT_JOY0;
        patched[7] = 2;
        assert_eq!(patched, HID_REPORT_JOY1);
        assert_eq!(*HID_REPORT_JOY0.last().unwrap(), 0xC0);
    }

    #[test]
    fn string_descriptor_lang_table() {
        assert_eq!(string_descriptor(STRING_ID_LANG), vec![0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn string_descriptor_encoding() {
        let desc = string_descriptor(STRING_ID_SERIAL);
        assert_eq!(desc.len(), 2 + 2 * STRING_SERIAL.len());
        assert_eq!(desc[0] as usize, desc.len());
        assert_eq!(desc[1], USB_DT_STRING);
        assert_eq!(&desc[2..6], &[b'0', 0, b'0', 0]);
    }

    #[test]
    fn string_descriptor_unknown_index() {
        assert_eq!(string_descriptor(200), vec![0x02, 0x03]);
    }
}
