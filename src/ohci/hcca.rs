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

//! Host Controller Communications Area (HCCA) management.
//!
//! See section 4.4 of the specs.
//!
//! The HCCA is a 256-byte data structure in system memory shared with the
//! host controller: the driver fills the 32 interrupt-list head pointers,
//! and the controller writes back the current frame number and the head of
//! the done queue.

use crate::{Buffer32, HwAccessRef, OutOfDmaMemory};

use core::{alloc::Layout, num::NonZeroU32};

const FRAME_NUMBER_OFFSET: u64 = 0x80;
const DONE_HEAD_OFFSET: u64 = 0x84;

pub struct Hcca<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    buffer: Buffer32<TAcc>,
}

impl<TAcc> Hcca<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates and initializes the HCCA.
    ///
    /// `req_alignment` is the alignment the controller reported through the
    /// `HcHCCA` register probe; `interrupt_heads` are the physical
    /// addresses of the 32 periodic anchor descriptors.
    pub async fn new(
        hardware_access: TAcc,
        req_alignment: usize,
        interrupt_heads: &[u32; 32],
    ) -> Result<Hcca<TAcc>, OutOfDmaMemory> {
        let buffer = Buffer32::new(
            hardware_access.clone(),
            Layout::from_size_align(256, req_alignment.max(256)).unwrap(),
        )
        .await?;

        unsafe {
            hardware_access
                .write_memory_u32_le(u64::from(buffer.pointer().get()), interrupt_heads)
                .await;

            // The rest of the HCCA is only written by the controller. We
            // initialize it with 0s, just in case.
            hardware_access
                .write_memory_u8(u64::from(buffer.pointer().get()) + 0x80, &[0; 0x80])
                .await;
        }

        Ok(Hcca {
            hardware_access,
            buffer,
        })
    }

    /// Returns the physical memory address of the HCCA, to be written to
    /// the `HcHCCA` register.
    ///
    /// This value never changes and is valid until the [`Hcca`] is
    /// destroyed.
    pub fn pointer(&self) -> NonZeroU32 {
        self.buffer.pointer()
    }

    /// Returns the low 16 bits of the frame number, as periodically written
    /// back by the controller.
    pub async fn frame_number(&self) -> u16 {
        unsafe {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(
                    u64::from(self.buffer.pointer().get()) + FRAME_NUMBER_OFFSET,
                    &mut out,
                )
                .await;
            (out[0] & 0xffff) as u16
        }
    }

    /// Takes the head of the done queue, if the controller has written one.
    ///
    /// The returned value is the physical address of the most recently
    /// retired transfer descriptor; earlier retirements are linked through
    /// the descriptors' next-TD fields. The slot is zeroed so the next
    /// write-back is distinguishable even if the controller hands back a
    /// recycled descriptor address.
    ///
    /// # Safety
    ///
    /// To avoid racing the controller's own write, this must only be called
    /// while the `WritebackDoneHead` bit of `HcInterruptStatus` is set, and
    /// that bit must only be acknowledged afterwards.
    pub async unsafe fn consume_done_head(&self) -> Option<NonZeroU32> {
        let raw = {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(
                    u64::from(self.buffer.pointer().get()) + DONE_HEAD_OFFSET,
                    &mut out,
                )
                .await;
            out[0]
        };

        // The least significant bit signals that other interrupt status
        // bits are also set; the status register is read anyway, so the
        // flag itself carries no extra information here.
        let head = raw & !0xf;
        if head == 0 {
            return None;
        }

        self.hardware_access
            .write_memory_u32_le(
                u64::from(self.buffer.pointer().get()) + DONE_HEAD_OFFSET,
                &[0],
            )
            .await;

        NonZeroU32::new(head)
    }
}
