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

//! Endpoint schedule lists.
//!
//! The controller walks several linked lists of endpoint descriptors: the
//! control list, the bulk list, and — once per frame — the periodic list
//! designated by the HCCA slot matching the low five bits of the frame
//! number. See sections 4.4 and 5.2.7 of the specs.
//!
//! Every list here starts with a dummy descriptor that has the skip flag
//! set, which gives each list a constant head pointer: the control and bulk
//! head registers and the 32 HCCA slots are written once at initialization
//! and never rewritten afterwards. The periodic lists form a tree: each
//! HCCA slot leads through one 32 ms anchor into a 16 ms anchor shared by
//! two slots, and so on down to the single 1 ms anchor, which leads into
//! the isochronous list. An interrupt endpoint at interval `n` is linked
//! behind an anchor of the matching level and is therefore reached once
//! every `n` frames.

use crate::ohci::ep_descriptor::{Config, Direction, EndpointDescriptor};
use crate::ohci::regs;
use crate::{HwAccessRef, OutOfDmaMemory};

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::num::NonZeroU32;

/// Slot-choice table: the 5-bit bit-reversal sequence. Spreading endpoints
/// over anchors in this order keeps the per-frame load of the periodic tree
/// balanced.
pub const BALANCE: [u8; 32] = [
    0, 16, 8, 24, 4, 20, 12, 28, 2, 18, 10, 26, 6, 22, 14, 30, 1, 17, 9, 25, 5, 21, 13, 29, 3, 19,
    11, 27, 7, 23, 15, 31,
];

/// The polling intervals the periodic tree implements, in frames.
pub const INTERRUPT_INTERVALS: [u8; 6] = [32, 16, 8, 4, 2, 1];

/// Where an endpoint descriptor has been linked; needed to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Control,
    Bulk,
    Interrupt { level: usize, anchor: usize },
    Isochronous,
}

/// All the endpoint lists the controller walks.
pub struct Schedule<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    regs_loc: u64,
    control: EdList<TAcc>,
    bulk: EdList<TAcc>,
    /// One entry per interval of [`INTERRUPT_INTERVALS`]; level 0 holds the
    /// 32 anchors the HCCA slots designate.
    periodic: ArrayVec<[PeriodicLevel<TAcc>; 6]>,
    isochronous: EdList<TAcc>,
}

struct PeriodicLevel<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    interval: u8,
    anchors: ArrayVec<[EdList<TAcc>; 32]>,
    /// Insertion counter driving the slot-choice table.
    inserted: u32,
}

/// A linked list of endpoint descriptors with a constant dummy head.
struct EdList<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    head: EndpointDescriptor<TAcc>,
    /// Physical addresses of the linked descriptors, in chain order. The
    /// descriptors themselves are owned by their endpoint queues.
    entries: Vec<u32>,
}

impl<TAcc> EdList<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    async fn new(hardware_access: TAcc) -> Result<EdList<TAcc>, OutOfDmaMemory> {
        let config = Config {
            maximum_packet_size: 0,
            function_address: 0,
            endpoint_number: 0,
            isochronous: false,
            low_speed: false,
            skip: true,
            direction: Direction::FromTd,
        };
        let head = EndpointDescriptor::new(hardware_access.clone(), config).await?;
        Ok(EdList {
            head,
            entries: Vec::new(),
        })
    }

    fn head_pointer(&self) -> NonZeroU32 {
        self.head.pointer()
    }

    /// Physical address of the last descriptor of the list, i.e. the one
    /// whose next pointer leads out of this list.
    fn last_pointer(&self) -> u32 {
        self.entries
            .last()
            .copied()
            .unwrap_or_else(|| self.head.pointer().get())
    }

    /// Links `ed` at the tail of the list, preserving insertion order.
    ///
    /// # Safety
    ///
    /// `ed` must be the physical address of an endpoint descriptor that
    /// remains valid until it is removed from the list.
    async unsafe fn append(&mut self, ed: u32, hardware_access: &TAcc) {
        let prev = self.last_pointer();
        // The order here is important. First make the new descriptor point
        // to whatever currently follows the tail, then only link the tail
        // to the new descriptor. This ensures that the controller doesn't
        // jump to the new descriptor before it's ready.
        let after = read_next_at(hardware_access, prev).await;
        write_next_at(hardware_access, ed, after).await;
        write_next_at(hardware_access, prev, ed).await;
        self.entries.push(ed);
    }

    /// Unlinks `ed` from the list. Returns false if it wasn't there.
    ///
    /// # Safety
    ///
    /// The descriptor must be quiesced (skip set and one frame elapsed)
    /// before it is unlinked, as the controller may otherwise be holding
    /// its next pointer.
    async unsafe fn remove(&mut self, ed: u32, hardware_access: &TAcc) -> bool {
        let idx = match self.entries.iter().position(|&e| e == ed) {
            Some(idx) => idx,
            None => return false,
        };

        let prev = if idx == 0 {
            self.head.pointer().get()
        } else {
            self.entries[idx - 1]
        };

        let after = read_next_at(hardware_access, ed).await;
        write_next_at(hardware_access, prev, after).await;
        self.entries.remove(idx);
        true
    }
}

impl<TAcc> Schedule<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates the dummy heads of every list and wires the periodic tree.
    ///
    /// The head pointers ([`Schedule::control_head_pointer`],
    /// [`Schedule::bulk_head_pointer`], [`Schedule::interrupt_slot_heads`])
    /// must afterwards be handed to the controller.
    pub async fn new(hardware_access: TAcc, regs_loc: u64) -> Result<Schedule<TAcc>, OutOfDmaMemory> {
        let control = EdList::new(hardware_access.clone()).await?;
        let bulk = EdList::new(hardware_access.clone()).await?;
        let isochronous = EdList::new(hardware_access.clone()).await?;

        let mut periodic: ArrayVec<[PeriodicLevel<TAcc>; 6]> = ArrayVec::new();
        for &interval in INTERRUPT_INTERVALS.iter() {
            let mut anchors = ArrayVec::new();
            for _ in 0..interval {
                anchors.push(EdList::new(hardware_access.clone()).await?);
            }
            periodic.push(PeriodicLevel {
                interval,
                anchors,
                inserted: 0,
            });
        }

        // Wire each anchor into the next level down, and the 1 ms anchor
        // into the isochronous list.
        for level in (0..periodic.len()).rev() {
            for anchor in 0..periodic[level].anchors.len() {
                let next = if level + 1 < periodic.len() {
                    let next_len = periodic[level + 1].anchors.len();
                    periodic[level + 1].anchors[anchor % next_len]
                        .head_pointer()
                        .get()
                } else {
                    isochronous.head_pointer().get()
                };
                let anchor_ptr = periodic[level].anchors[anchor].head_pointer().get();
                unsafe {
                    write_next_at(&hardware_access, anchor_ptr, next).await;
                }
            }
        }

        Ok(Schedule {
            hardware_access,
            regs_loc,
            control,
            bulk,
            periodic,
            isochronous,
        })
    }

    /// Physical address to program into `HcControlHeadED`.
    pub fn control_head_pointer(&self) -> NonZeroU32 {
        self.control.head_pointer()
    }

    /// Physical address to program into `HcBulkHeadED`.
    pub fn bulk_head_pointer(&self) -> NonZeroU32 {
        self.bulk.head_pointer()
    }

    /// Physical addresses to write into the 32 HCCA interrupt slots.
    pub fn interrupt_slot_heads(&self) -> [u32; 32] {
        let mut out = [0; 32];
        for (slot, out) in out.iter_mut().enumerate() {
            *out = self.periodic[0].anchors[slot].head_pointer().get();
        }
        out
    }

    /// Links an endpoint descriptor at the tail of the control list.
    ///
    /// # Safety
    ///
    /// `ed` must stay valid until removed.
    pub async unsafe fn append_control(&mut self, ed: u32) -> Placement {
        let access = self.hardware_access.clone();
        self.control.append(ed, &access).await;
        Placement::Control
    }

    /// Links an endpoint descriptor at the tail of the bulk list.
    ///
    /// # Safety
    ///
    /// `ed` must stay valid until removed.
    pub async unsafe fn append_bulk(&mut self, ed: u32) -> Placement {
        let access = self.hardware_access.clone();
        self.bulk.append(ed, &access).await;
        Placement::Bulk
    }

    /// Links an endpoint descriptor into the isochronous list, behind the
    /// whole interrupt tree.
    ///
    /// # Safety
    ///
    /// `ed` must stay valid until removed.
    pub async unsafe fn append_iso(&mut self, ed: u32) -> Placement {
        let access = self.hardware_access.clone();
        self.isochronous.append(ed, &access).await;
        Placement::Isochronous
    }

    /// Links an interrupt endpoint descriptor so that the controller
    /// reaches it once every `interval` frames.
    ///
    /// `interval` must be one of [`INTERRUPT_INTERVALS`]; callers round
    /// other polling intervals down beforehand. The anchor within the level
    /// is picked with the bit-reversal slot-choice table, which keeps the
    /// load of the 32 frame slots balanced.
    ///
    /// # Safety
    ///
    /// `ed` must stay valid until removed.
    pub async unsafe fn insert_interrupt(&mut self, ed: u32, interval: u8) -> Placement {
        let level = INTERRUPT_INTERVALS
            .iter()
            .position(|&i| i == interval)
            .expect("invalid interrupt interval");

        let access = self.hardware_access.clone();
        let this_level = &mut self.periodic[level];
        let stride = 32 / u32::from(this_level.interval);
        let anchor =
            usize::from(BALANCE[((this_level.inserted * stride) % 32) as usize]);
        this_level.inserted = this_level.inserted.wrapping_add(1);

        this_level.anchors[anchor].append(ed, &access).await;
        Placement::Interrupt { level, anchor }
    }

    /// Unlinks an endpoint descriptor from the list recorded in
    /// `placement`, and asks the controller to rescan the affected list.
    ///
    /// # Safety
    ///
    /// The descriptor must be quiesced (skip set and one frame elapsed).
    pub async unsafe fn remove(&mut self, ed: u32, placement: Placement) -> bool {
        let access = self.hardware_access.clone();
        let (removed, filled_bit) = match placement {
            Placement::Control => (self.control.remove(ed, &access).await, Some(regs::CMD_CLF)),
            Placement::Bulk => (self.bulk.remove(ed, &access).await, Some(regs::CMD_BLF)),
            Placement::Isochronous => (self.isochronous.remove(ed, &access).await, None),
            Placement::Interrupt { level, anchor } => (
                self.periodic[level].anchors[anchor].remove(ed, &access).await,
                None,
            ),
        };

        if removed {
            if let Some(bit) = filled_bit {
                // Force the controller to re-fetch the list head rather
                // than resume from a cached current-ED pointer.
                self.hardware_access
                    .write_memory_u32_le(self.regs_loc + regs::HC_COMMAND_STATUS_OFFSET, &[bit])
                    .await;
            }
        }

        removed
    }

    /// Number of interrupt endpoints the controller traverses when
    /// servicing the given frame number.
    pub fn interrupt_load(&self, frame: u32) -> usize {
        self.periodic
            .iter()
            .map(|level| {
                let anchor = (frame % u32::from(level.interval)) as usize;
                level.anchors[anchor].entries.len()
            })
            .sum()
    }

}

async unsafe fn read_next_at<TAcc>(hardware_access: &TAcc, ed: u32) -> u32
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let mut out = [0];
    hardware_access
        .read_memory_u32_le(u64::from(ed) + 12, &mut out)
        .await;
    out[0]
}

async unsafe fn write_next_at<TAcc>(hardware_access: &TAcc, ed: u32, next: u32)
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access
        .write_memory_u32_le(u64::from(ed) + 12, &[next])
        .await;
}
