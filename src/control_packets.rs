// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Utility functions for building and decoding control packets.
//!
//! Control packets can be considered as "the metadata" of a USB device:
//! the eight-byte setup packets that start every control transfer, and the
//! standard descriptors a device returns in response to GET_DESCRIPTOR.

use crate::devices::EndpointDirection;

use alloc::{string::String, vec::Vec};

// Standard descriptor types.
pub const DESCRIPTOR_DEVICE: u8 = 1;
pub const DESCRIPTOR_CONFIGURATION: u8 = 2;
pub const DESCRIPTOR_STRING: u8 = 3;
pub const DESCRIPTOR_INTERFACE: u8 = 4;
pub const DESCRIPTOR_ENDPOINT: u8 = 5;

// Standard bRequest values.
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;

/// Feature selector for CLEAR_FEATURE on an endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// An eight-byte standard request, the first packet of every control
/// transfer.
#[derive(Debug, Clone)]
pub struct SetupPacket {
    pub direction: RequestDirection,
    pub ty: RequestTy,
    pub recipient: RequestRecipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Number of bytes of the data stage. 0 means no data stage.
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTy {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl SetupPacket {
    /// Builds the eight bytes of the packet as they go on the wire.
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0; 8];
        out[0] = {
            let dir = match self.direction {
                RequestDirection::HostToDevice => 0,
                RequestDirection::DeviceToHost => 1,
            };

            let ty = match self.ty {
                RequestTy::Standard => 0,
                RequestTy::Class => 1,
                RequestTy::Vendor => 2,
            };

            let recipient = match self.recipient {
                RequestRecipient::Device => 0,
                RequestRecipient::Interface => 1,
                RequestRecipient::Endpoint => 2,
                RequestRecipient::Other => 3,
            };

            (dir << 7) | (ty << 5) | recipient
        };
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// True if the data stage (if any) flows from the device to the host.
    pub fn is_device_to_host(&self) -> bool {
        self.direction == RequestDirection::DeviceToHost
    }

    /// Builds a request that queries the device for a descriptor.
    ///
    /// For string descriptors, `index` selects the string and `language`
    /// the language identifier; both are 0 for the other descriptor types.
    pub fn get_descriptor(descriptor_ty: u8, index: u8, language: u16, length: u16) -> SetupPacket {
        SetupPacket {
            direction: RequestDirection::DeviceToHost,
            ty: RequestTy::Standard,
            recipient: RequestRecipient::Device,
            request: REQUEST_GET_DESCRIPTOR,
            value: u16::from(descriptor_ty) << 8 | u16::from(index),
            index: language,
            length,
        }
    }

    /// Builds a request that asks the device to change its address.
    pub fn set_address(address: u8) -> SetupPacket {
        SetupPacket {
            direction: RequestDirection::HostToDevice,
            ty: RequestTy::Standard,
            recipient: RequestRecipient::Device,
            request: REQUEST_SET_ADDRESS,
            value: u16::from(address),
            index: 0,
            length: 0,
        }
    }

    /// Builds a request that selects a configuration.
    pub fn set_configuration(configuration_value: u8) -> SetupPacket {
        SetupPacket {
            direction: RequestDirection::HostToDevice,
            ty: RequestTy::Standard,
            recipient: RequestRecipient::Device,
            request: REQUEST_SET_CONFIGURATION,
            value: u16::from(configuration_value),
            index: 0,
            length: 0,
        }
    }

    /// Builds the CLEAR_FEATURE(ENDPOINT_HALT) request a class driver must
    /// issue after a stall, so that the device-side toggle and halt state
    /// reset along with the controller side.
    pub fn clear_endpoint_halt(endpoint_number: u8, direction: EndpointDirection) -> SetupPacket {
        let endpoint_index = u16::from(endpoint_number)
            | match direction {
                EndpointDirection::In => 0x80,
                EndpointDirection::Out => 0,
            };

        SetupPacket {
            direction: RequestDirection::HostToDevice,
            ty: RequestTy::Standard,
            recipient: RequestRecipient::Endpoint,
            request: REQUEST_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint_index,
            length: 0,
        }
    }
}

/// Standard device descriptor, as returned by GET_DESCRIPTOR(DEVICE).
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// Maximum packet size of the default control pipe.
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    pub fn parse(bytes: &[u8]) -> Option<DeviceDescriptor> {
        if bytes.len() < Self::LENGTH || bytes[1] != DESCRIPTOR_DEVICE {
            return None;
        }

        Some(DeviceDescriptor {
            usb_release: u16::from_le_bytes([bytes[2], bytes[3]]),
            class: bytes[4],
            sub_class: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            device_release: u16::from_le_bytes([bytes[12], bytes[13]]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Standard configuration descriptor header.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    /// Length of the configuration descriptor plus all the interface and
    /// endpoint descriptors that follow it.
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Option<ConfigDescriptor> {
        if bytes.len() < Self::LENGTH || bytes[1] != DESCRIPTOR_CONFIGURATION {
            return None;
        }

        Some(ConfigDescriptor {
            total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            configuration_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }
}

/// Standard interface descriptor.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_index: u8,
}

impl InterfaceDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Option<InterfaceDescriptor> {
        if bytes.len() < Self::LENGTH || bytes[1] != DESCRIPTOR_INTERFACE {
            return None;
        }

        Some(InterfaceDescriptor {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            class: bytes[5],
            sub_class: bytes[6],
            protocol: bytes[7],
            interface_index: bytes[8],
        })
    }
}

/// Transfer type an endpoint descriptor declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Standard endpoint descriptor.
#[derive(Debug, Clone)]
pub struct EndpointDescriptorInfo {
    /// Raw endpoint address: number in the low four bits, direction in the
    /// top bit.
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    /// Polling interval in frames, meaningful for interrupt endpoints.
    pub interval: u8,
}

impl EndpointDescriptorInfo {
    pub const LENGTH: usize = 7;

    pub fn parse(bytes: &[u8]) -> Option<EndpointDescriptorInfo> {
        if bytes.len() < Self::LENGTH || bytes[1] != DESCRIPTOR_ENDPOINT {
            return None;
        }

        Some(EndpointDescriptorInfo {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]) & 0x7ff,
            interval: bytes[6],
        })
    }

    pub fn number(&self) -> u8 {
        self.address & 0xf
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// A configuration descriptor together with the interface and endpoint
/// descriptors that followed it.
#[derive(Debug, Clone)]
pub struct ParsedConfiguration {
    pub config: ConfigDescriptor,
    pub interfaces: Vec<ParsedInterface>,
}

#[derive(Debug, Clone)]
pub struct ParsedInterface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptorInfo>,
}

/// Walks the buffer returned by GET_DESCRIPTOR(CONFIGURATION) with the
/// full `total_length`.
///
/// Unknown descriptor types (HID, class-specific, ...) are skipped; an
/// endpoint descriptor before any interface descriptor, or a descriptor
/// with a zero length, makes the whole buffer invalid.
pub fn parse_configuration(bytes: &[u8]) -> Option<ParsedConfiguration> {
    let config = ConfigDescriptor::parse(bytes)?;

    let mut interfaces: Vec<ParsedInterface> = Vec::new();
    let mut offset = usize::from(bytes[0]);

    while offset + 2 <= bytes.len() {
        let length = usize::from(bytes[offset]);
        let descriptor_ty = bytes[offset + 1];
        if length < 2 || offset + length > bytes.len() {
            return None;
        }

        match descriptor_ty {
            DESCRIPTOR_INTERFACE => {
                let descriptor = InterfaceDescriptor::parse(&bytes[offset..])?;
                interfaces.push(ParsedInterface {
                    descriptor,
                    endpoints: Vec::new(),
                });
            }
            DESCRIPTOR_ENDPOINT => {
                let endpoint = EndpointDescriptorInfo::parse(&bytes[offset..])?;
                interfaces.last_mut()?.endpoints.push(endpoint);
            }
            _ => {}
        }

        offset += length;
    }

    Some(ParsedConfiguration { config, interfaces })
}

/// Decodes a string descriptor's UTF-16 payload.
pub fn parse_string_descriptor(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes[1] != DESCRIPTOR_STRING {
        return None;
    }

    let length = usize::from(bytes[0]).min(bytes.len());
    let units = bytes[2..length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    let mut out = String::with_capacity(length / 2);
    for unit in core::char::decode_utf16(units) {
        out.push(unit.unwrap_or(core::char::REPLACEMENT_CHARACTER));
    }
    Some(out)
}

/// Rounds a declared polling interval down to the nearest interval the
/// periodic schedule implements.
pub fn schedule_interval(declared: u8) -> u8 {
    let clamped = declared.max(1).min(32);
    // Highest power of two that doesn't exceed the declared interval.
    let mut interval: u8 = 32;
    while interval > clamped {
        interval /= 2;
    }
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom as _;

    #[test]
    fn get_device_descriptor_bytes() {
        let setup = SetupPacket::get_descriptor(DESCRIPTOR_DEVICE, 0, 0, 18);
        assert_eq!(
            setup.encode(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn set_address_bytes() {
        let setup = SetupPacket::set_address(1);
        assert_eq!(
            setup.encode(),
            [0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn clear_endpoint_halt_targets_the_endpoint() {
        let setup = SetupPacket::clear_endpoint_halt(2, EndpointDirection::In);
        let bytes = setup.encode();
        assert_eq!(bytes[0], 0x02); // host-to-device, standard, endpoint
        assert_eq!(bytes[1], REQUEST_CLEAR_FEATURE);
        assert_eq!(bytes[4], 0x82); // IN endpoint 2
    }

    #[test]
    fn parse_device_descriptor() {
        let bytes = [
            0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01,
            0x01, 0x02, 0x00, 0x01,
        ];
        let descriptor = DeviceDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.max_packet_size0, 8);
        assert_eq!(descriptor.vendor_id, 0x1234);
        assert_eq!(descriptor.product_id, 0x5678);
        assert_eq!(descriptor.num_configurations, 1);
    }

    #[test]
    fn parse_configuration_walk() {
        let mut bytes = Vec::new();
        // Configuration header; total length filled in below.
        bytes.extend_from_slice(&[0x09, 0x02, 0, 0, 0x01, 0x01, 0x00, 0x80, 0x32]);
        // One interface with two endpoints.
        bytes.extend_from_slice(&[0x09, 0x04, 0x00, 0x00, 0x02, 0x08, 0x06, 0x50, 0x00]);
        // Bulk IN endpoint 1.
        bytes.extend_from_slice(&[0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00]);
        // Interrupt OUT endpoint 2, interval 10.
        bytes.extend_from_slice(&[0x07, 0x05, 0x02, 0x03, 0x08, 0x00, 0x0a]);
        let total = u16::try_from(bytes.len()).unwrap().to_le_bytes();
        bytes[2] = total[0];
        bytes[3] = total[1];

        let parsed = parse_configuration(&bytes).unwrap();
        assert_eq!(parsed.config.num_interfaces, 1);
        assert_eq!(parsed.interfaces.len(), 1);

        let interface = &parsed.interfaces[0];
        assert_eq!(interface.descriptor.class, 0x08);
        assert_eq!(interface.endpoints.len(), 2);
        assert_eq!(interface.endpoints[0].number(), 1);
        assert_eq!(interface.endpoints[0].direction(), EndpointDirection::In);
        assert_eq!(interface.endpoints[0].transfer_type(), TransferType::Bulk);
        assert_eq!(interface.endpoints[0].max_packet_size, 64);
        assert_eq!(interface.endpoints[1].transfer_type(), TransferType::Interrupt);
        assert_eq!(interface.endpoints[1].interval, 10);
    }

    #[test]
    fn parse_string() {
        let bytes = [0x0a, 0x03, b'M', 0x00, b'o', 0x00, b'u', 0x00, b's', 0x00];
        assert_eq!(parse_string_descriptor(&bytes).unwrap(), "Mous");
    }

    #[test]
    fn interval_rounding() {
        assert_eq!(schedule_interval(0), 1);
        assert_eq!(schedule_interval(1), 1);
        assert_eq!(schedule_interval(3), 2);
        assert_eq!(schedule_interval(10), 8);
        assert_eq!(schedule_interval(32), 32);
        assert_eq!(schedule_interval(255), 32);
    }
}
