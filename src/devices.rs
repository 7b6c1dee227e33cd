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

//! State of the USB devices connected to the controller.
//!
//! Each enumerated device owns the endpoint queues that were created from
//! its endpoint descriptors. Devices are keyed by their assigned bus
//! address; a freshly-reset device transiently occupies address 0 until
//! SET_ADDRESS completes.
//!
//! The "hardware up" flag is cleared when the device is unplugged or the
//! controller dies; a device whose flag is down rejects new requests but
//! keeps its bookkeeping until the port-idle path tears it down.

use crate::control_packets::TransferType;
use crate::ohci::ep_descriptor::Direction;
use crate::ohci::ep_queue::EndpointQueue;
use crate::ohci::schedule::Placement;
use crate::HwAccessRef;

use alloc::vec::Vec;
use fnv::FnvBuildHasher;
use futures::channel::mpsc;
use hashbrown::HashMap;

/// Direction of a data endpoint, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    In,
    Out,
}

impl EndpointDirection {
    pub(crate) fn descriptor_direction(self) -> Direction {
        match self {
            EndpointDirection::In => Direction::In,
            EndpointDirection::Out => Direction::Out,
        }
    }
}

/// Caller-visible snapshot of a device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub address: u8,
    pub root_port: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub low_speed: bool,
    pub hardware_up: bool,
}

/// One endpoint of a device, owning its hardware queue.
pub(crate) struct Endpoint<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    pub number: u8,
    /// `Direction::FromTd` for the default control pipe.
    pub direction: Direction,
    pub ty: TransferType,
    /// Rounded polling interval for interrupt endpoints, 0 otherwise.
    pub interval: u8,
    pub queue: EndpointQueue<TAcc>,
    /// Where the endpoint's descriptor is linked, once scheduled.
    pub placement: Option<Placement>,
}

impl<TAcc> Endpoint<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// True if this endpoint serves transfers for the given number and
    /// direction. `None` selects the (bidirectional) control pipe.
    pub fn matches(&self, number: u8, direction: Option<EndpointDirection>) -> bool {
        if self.number != number {
            return false;
        }
        match direction {
            None => self.direction == Direction::FromTd,
            Some(dir) => self.direction == dir.descriptor_direction(),
        }
    }
}

pub(crate) struct Device<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    pub address: u8,
    pub root_port: u8,
    /// Address of the hub the device hangs off, or `None` for a root port.
    pub hub_address: Option<u8>,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub low_speed: bool,
    pub hardware_up: bool,
    pub has_device_driver: bool,
    pub endpoints: Vec<Endpoint<TAcc>>,
}

impl<TAcc> Device<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    pub fn endpoint_mut(
        &mut self,
        number: u8,
        direction: Option<EndpointDirection>,
    ) -> Option<&mut Endpoint<TAcc>> {
        self.endpoints
            .iter_mut()
            .find(|ep| ep.matches(number, direction))
    }

    pub fn control_endpoint_mut(&mut self) -> Option<&mut Endpoint<TAcc>> {
        self.endpoint_mut(0, None)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            address: self.address,
            root_port: self.root_port,
            class: self.class,
            sub_class: self.sub_class,
            protocol: self.protocol,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            low_speed: self.low_speed,
            hardware_up: self.hardware_up,
        }
    }
}

/// All the devices known to one controller, keyed by bus address.
pub(crate) struct DeviceMap<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    devices: HashMap<u8, Device<TAcc>, FnvBuildHasher>,
}

impl<TAcc> DeviceMap<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    pub fn new() -> DeviceMap<TAcc> {
        DeviceMap {
            devices: HashMap::default(),
        }
    }

    pub fn insert(&mut self, device: Device<TAcc>) {
        debug_assert!(!self.devices.contains_key(&device.address));
        self.devices.insert(device.address, device);
    }

    pub fn get(&self, address: u8) -> Option<&Device<TAcc>> {
        self.devices.get(&address)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut Device<TAcc>> {
        self.devices.get_mut(&address)
    }

    pub fn remove(&mut self, address: u8) -> Option<Device<TAcc>> {
        self.devices.remove(&address)
    }

    /// The device plugged directly into the given root port, if any.
    pub fn address_on_root_port(&self, port: u8) -> Option<u8> {
        self.devices
            .values()
            .find(|dev| dev.hub_address.is_none() && dev.root_port == port)
            .map(|dev| dev.address)
    }

    /// Moves a device to a different bus address, typically from the
    /// default address 0 after SET_ADDRESS.
    pub fn rekey(&mut self, from: u8, to: u8) -> bool {
        if self.devices.contains_key(&to) {
            return false;
        }
        match self.devices.remove(&from) {
            Some(mut device) => {
                device.address = to;
                self.devices.insert(to, device);
                true
            }
            None => false,
        }
    }

    /// Picks the lowest unused address in 1..=127.
    pub fn next_free_address(&self) -> Option<u8> {
        (1..=127).find(|addr| !self.devices.contains_key(addr))
    }
}

/// Class drivers waiting to be bound to matching devices.
pub(crate) struct ClassBindings {
    bindings: Vec<ClassBinding>,
}

struct ClassBinding {
    class: u8,
    sub_class: u8,
    sender: mpsc::UnboundedSender<u8>,
}

impl ClassBindings {
    pub fn new() -> ClassBindings {
        ClassBindings {
            bindings: Vec::new(),
        }
    }

    /// Registers a class driver; the returned receiver yields the address
    /// of every device whose interface matches.
    pub fn register(&mut self, class: u8, sub_class: u8) -> mpsc::UnboundedReceiver<u8> {
        let (sender, receiver) = mpsc::unbounded();
        self.bindings.push(ClassBinding {
            class,
            sub_class,
            sender,
        });
        receiver
    }

    /// Offers a freshly enumerated device to the registered class drivers.
    /// Returns true if some driver claimed it.
    pub fn notify(&mut self, address: u8, class: u8, sub_class: u8) -> bool {
        // Senders whose receiving half is gone are dropped along the way.
        self.bindings
            .retain(|binding| !binding.sender.is_closed());

        let mut claimed = false;
        for binding in &self.bindings {
            if binding.class == class && binding.sub_class == sub_class {
                if binding.sender.unbounded_send(address).is_ok() {
                    claimed = true;
                }
            }
        }
        claimed
    }
}
