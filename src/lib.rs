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

//! OHCI host controller driver for USB 1.1.
//!
//! This library implements the transfer engine of an OHCI host controller
//! driver: endpoint and transfer descriptor management, the control, bulk,
//! interrupt and isochronous schedules, done-queue harvesting, error
//! recovery, timeouts, and root hub enumeration.
//!
//! The code doesn't assume that it can directly access physical memory or
//! memory-mapped registers. Instead, every access goes through the
//! [`HwAccessRef`] trait, which the embedder implements on top of its PCI
//! and DMA facilities. The PCI probe itself (finding the memory BAR and the
//! IRQ line) is the embedder's job.
//!
//! # Embedding contract
//!
//! - Build a driver with [`ohci::init_ohci_device`].
//! - Call [`ohci::OhciDriver::on_interrupt`] whenever the controller's
//!   interrupt line fires. This is the only method that is safe to call
//!   from a context that must not suspend for long; it only takes
//!   non-suspending locks.
//! - Poll [`ohci::OhciDriver::drive`], or call the individual maintenance
//!   methods (`process_errors`, `process_timeouts`,
//!   `process_root_hub_changes`) on a millisecond-order tick.
//! - Issue transfers with [`ohci::OhciDriver::control_request`] and
//!   [`ohci::OhciDriver::interrupt_bulk_io`] from as many concurrent tasks
//!   as desired.

#![no_std]

extern crate alloc;

use core::{alloc::Layout, future::Future, num::NonZeroU32, time::Duration};

pub mod control_packets;
pub mod devices;
pub mod ohci;
pub mod requests;

pub use ohci::{init_ohci_device, InitError, OhciDriver};
pub use requests::{CompletionCode, RequestError};

/// Abstraction over the hardware.
///
/// The code of this library doesn't assume that it can directly access
/// physical memory. Instead, any access to physical memory is done through
/// this trait.
///
/// # Safety
///
/// Implementations must perform the reads and writes against the actual
/// physical memory space shared with the controller, in such a way that a
/// write is visible to the controller once the returned future has
/// completed. On platforms where DMA memory can be cached, this is where
/// the necessary flushes or fences belong.
pub unsafe trait HwAccessRef<'a>: Copy + Clone {
    type Delay: Future<Output = ()> + 'a;
    type ReadMemFutureU8: Future<Output = ()> + 'a;
    type ReadMemFutureU32: Future<Output = ()> + 'a;
    type WriteMemFutureU8: Future<Output = ()> + 'a;
    type WriteMemFutureU32: Future<Output = ()> + 'a;
    type Alloc32: Future<Output = Result<NonZeroU32, OutOfDmaMemory>> + 'a;

    /// Performs a serie of atomic physical memory reads starting at the given address.
    unsafe fn read_memory_u8(self, address: u64, dest: &'a mut [u8]) -> Self::ReadMemFutureU8;

    /// Performs a serie of atomic physical memory reads starting at the given address.
    ///
    /// The data is interpreted as little endian, which is the byte order the
    /// controller uses for every shared structure.
    ///
    /// `address` must be a multiple of 4.
    unsafe fn read_memory_u32_le(self, address: u64, dest: &'a mut [u32])
        -> Self::ReadMemFutureU32;

    /// Performs a serie of atomic physical memory writes starting at the given address.
    unsafe fn write_memory_u8(self, address: u64, data: &'a [u8]) -> Self::WriteMemFutureU8;

    /// Performs a serie of atomic physical memory writes starting at the given address.
    ///
    /// The data must be written in little endian.
    ///
    /// `address` must be a multiple of 4.
    unsafe fn write_memory_u32_le(self, address: u64, data: &'a [u32]) -> Self::WriteMemFutureU32;

    /// Allocates a buffer in physical memory. Does not need to be cleared with 0s.
    ///
    /// The buffer must be physically contiguous, and must entirely fit within
    /// the first four gigabytes of physical memory, as the controller only
    /// manipulates 32-bit physical addresses.
    ///
    /// > **Note**: The value returned is a `u32` and not a pointer, as the
    /// >           buffer is not necessarily directly accessible. All
    /// >           accesses to the buffer must be performed through the
    /// >           other methods of this trait.
    fn alloc32(self, layout: Layout) -> Self::Alloc32;

    /// Deallocates a previously-allocated block of physical memory.
    ///
    /// # Safety
    ///
    /// `address` must be a value previously-returned by a call to
    /// [`HwAccessRef::alloc32`], and `layout` must match the layout that was
    /// passed to `alloc32`.
    unsafe fn dealloc32(self, address: u64, layout: Layout);

    /// Returns a future that is ready after the given duration has passed.
    fn delay(self, duration: Duration) -> Self::Delay;
}

/// The platform couldn't provide a DMA-capable buffer.
///
/// Surfaces to the caller of a request operation as
/// [`RequestError::OutOfDmaMemory`]; nothing is linked on any endpoint when
/// this happens.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "out of DMA-capable memory")]
pub struct OutOfDmaMemory;

/// RAII wrapper around a buffer allocated in the 32-bit physical memory
/// space.
///
/// All the descriptors and data packets that the controller reads or writes
/// are backed by a `Buffer32`.
pub struct Buffer32<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    buffer: NonZeroU32,
    layout: Layout,
}

impl<TAcc> Buffer32<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates a new buffer in physical memory.
    pub async fn new(hardware_access: TAcc, layout: Layout) -> Result<Buffer32<TAcc>, OutOfDmaMemory> {
        let buffer = hardware_access.alloc32(layout).await?;

        Ok(Buffer32 {
            hardware_access,
            buffer,
            layout,
        })
    }

    /// Returns the physical memory address of the buffer.
    ///
    /// This value never changes and is valid until the [`Buffer32`] is
    /// destroyed.
    pub fn pointer(&self) -> NonZeroU32 {
        self.buffer
    }
}

impl<TAcc> Drop for Buffer32<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    fn drop(&mut self) {
        unsafe {
            self.hardware_access
                .dealloc32(u64::from(self.buffer.get()), self.layout);
        }
    }
}
