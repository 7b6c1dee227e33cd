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

//! Endpoint descriptor (ED) management.
//!
//! An endpoint descriptor is a 16-byte, 16-byte-aligned structure in
//! physical memory describing one USB endpoint queue. See section 4.2 of
//! the specs for the layout. The controller walks EDs through their
//! next-ED pointers, and processes the transfer descriptors between an
//! ED's head and tail pointers.
//!
//! Since an ED might be accessed by the controller at any time, mutation
//! is restricted: the only words software may freely write while the ED is
//! on a schedule list are the control word (word 0), the tail pointer
//! (word 1) and the next-ED pointer (word 3). The head pointer (word 2) is
//! owned by the controller unless the skip flag is set or the halted bit
//! is set; [`super::ep_queue`] enforces that discipline.

use crate::{Buffer32, HwAccessRef, OutOfDmaMemory};

use core::{alloc::Layout, num::NonZeroU32};

/// Head-pointer word bit set by the controller when the endpoint halts.
pub const HEAD_HALTED: u32 = 1 << 0;
/// Head-pointer word bit holding the data toggle carry.
pub const HEAD_TOGGLE_CARRY: u32 = 1 << 1;
/// Mask extracting the 16-byte-aligned pointer part of a head, tail or
/// next-ED word.
pub const PTR_MASK: u32 = !0xf;

const ENDPOINT_DESCRIPTOR_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(16, 16) };

/// A single endpoint descriptor.
///
/// This structure can be seen as a list of transfers that the USB
/// controller must perform with a specific endpoint. The endpoint
/// descriptor has to be put in an appropriate list for any work to be done.
pub struct EndpointDescriptor<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Hardware abstraction layer.
    hardware_access: TAcc,
    /// Physical memory buffer containing the endpoint descriptor.
    buffer: Buffer32<TAcc>,
    /// Shadow of the control word, so that flag updates don't need a
    /// read-modify-write on physical memory.
    control: Config,
}

/// Configuration of an [`EndpointDescriptor`]. Encoded into the control
/// word of the descriptor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of bytes that can be sent or received in a single
    /// data packet. Must be inferior or equal to 4095.
    pub maximum_packet_size: u16,
    /// Value between 0 and 127. The USB address of the function containing
    /// the endpoint.
    pub function_address: u8,
    /// Value between 0 and 15. The address of the endpoint within the
    /// function.
    pub endpoint_number: u8,
    /// If true, isochronous TD format. If false, general TD format.
    pub isochronous: bool,
    /// If false, full speed. If true, low speed.
    pub low_speed: bool,
    /// When set, the controller continues to the next ED of the list
    /// without accessing this one.
    pub skip: bool,
    /// Direction of the data flow.
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    /// The direction is taken from each transfer descriptor. This is the
    /// only correct value for control endpoints.
    FromTd,
}

impl<TAcc> EndpointDescriptor<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates a new endpoint descriptor buffer in physical memory.
    ///
    /// The head, tail and next-ED pointers are initialized to null.
    pub async fn new(
        hardware_access: TAcc,
        config: Config,
    ) -> Result<EndpointDescriptor<TAcc>, OutOfDmaMemory> {
        let buffer = Buffer32::new(hardware_access.clone(), ENDPOINT_DESCRIPTOR_LAYOUT).await?;

        unsafe {
            hardware_access
                .write_memory_u32_le(
                    u64::from(buffer.pointer().get()),
                    &[
                        config.encode(), // Control word.
                        0x0,             // Transfer descriptor tail.
                        0x0,             // Transfer descriptor head.
                        0x0,             // Next endpoint descriptor.
                    ],
                )
                .await;
        }

        Ok(EndpointDescriptor {
            hardware_access,
            buffer,
            control: config,
        })
    }

    /// Returns the physical memory address of the descriptor.
    ///
    /// This value never changes and is valid until the
    /// [`EndpointDescriptor`] is destroyed.
    pub fn pointer(&self) -> NonZeroU32 {
        self.buffer.pointer()
    }

    /// Returns the current configuration of the descriptor.
    pub fn config(&self) -> &Config {
        &self.control
    }

    /// Rewrites the control word with an updated configuration.
    pub async fn set_config(&mut self, config: Config) {
        self.control = config;
        let encoded = self.control.encode();
        unsafe {
            self.hardware_access
                .write_memory_u32_le(u64::from(self.buffer.pointer().get()), &[encoded])
                .await;
        }
    }

    /// Sets or clears the skip flag.
    ///
    /// After setting the flag, the controller may still be traversing the
    /// descriptor; wait at least one frame before assuming ownership of the
    /// head pointer.
    pub async fn set_skip(&mut self, skip: bool) {
        if self.control.skip != skip {
            let mut config = self.control.clone();
            config.skip = skip;
            self.set_config(config).await;
        }
    }

    /// Returns the value of the next endpoint descriptor in the linked
    /// list, or 0 if there is none.
    pub async fn get_next_raw(&self) -> u32 {
        unsafe {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(u64::from(self.buffer.pointer().get() + 12), &mut out)
                .await;
            out[0]
        }
    }

    /// Sets the next endpoint descriptor in the linked list.
    ///
    /// # Safety
    ///
    /// If not 0, `next` must be the physical memory address of an endpoint
    /// descriptor. It must remain valid until the next time the pointer is
    /// overwritten, or until this [`EndpointDescriptor`] is destroyed.
    pub async unsafe fn set_next_raw(&mut self, next: u32) {
        self.hardware_access
            .write_memory_u32_le(u64::from(self.buffer.pointer().get() + 12), &[next])
            .await;
    }

    /// Returns the tail pointer word.
    pub async fn tail(&self) -> u32 {
        unsafe {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(u64::from(self.buffer.pointer().get() + 4), &mut out)
                .await;
            out[0]
        }
    }

    /// Writes the tail pointer word.
    ///
    /// # Safety
    ///
    /// `tail` must be the physical memory address of a transfer descriptor
    /// that stays valid while referenced, and every descriptor between the
    /// current head and `tail` must form a well-linked chain, as the
    /// controller starts processing them as soon as this write lands.
    pub async unsafe fn set_tail_raw(&mut self, tail: u32) {
        self.hardware_access
            .write_memory_u32_le(u64::from(self.buffer.pointer().get() + 4), &[tail])
            .await;
    }

    /// Returns the raw head pointer word, including the halted and toggle
    /// carry bits.
    pub async fn head_raw(&self) -> u32 {
        unsafe {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(u64::from(self.buffer.pointer().get() + 8), &mut out)
                .await;
            out[0]
        }
    }

    /// Writes the raw head pointer word.
    ///
    /// # Safety
    ///
    /// The head word is owned by the controller while the endpoint is being
    /// serviced. This must only be called before the descriptor is linked
    /// onto a schedule list, or while the controller is known to leave the
    /// descriptor alone (skip set and one frame elapsed, or halted bit
    /// set).
    pub async unsafe fn set_head_raw(&mut self, head: u32) {
        self.hardware_access
            .write_memory_u32_le(u64::from(self.buffer.pointer().get() + 8), &[head])
            .await;
    }

    /// Returns true if the controller has halted this endpoint.
    pub async fn is_halted(&self) -> bool {
        self.head_raw().await & HEAD_HALTED != 0
    }
}

impl Config {
    pub fn encode(&self) -> u32 {
        assert!(self.maximum_packet_size < (1 << 12));
        assert!(self.endpoint_number < (1 << 4));
        assert!(self.function_address < (1 << 7));

        let direction = match self.direction {
            Direction::In => 0b10,
            Direction::Out => 0b01,
            Direction::FromTd => 0b00,
        };

        u32::from(self.maximum_packet_size) << 16
            | if self.isochronous { 1 } else { 0 } << 15
            | if self.skip { 1 } else { 0 } << 14
            | if self.low_speed { 1 } else { 0 } << 13
            | direction << 11
            | u32::from(self.endpoint_number) << 7
            | u32::from(self.function_address)
    }
}
