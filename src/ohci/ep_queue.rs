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

//! Per-endpoint transfer queue.
//!
//! An [`EndpointQueue`] owns one endpoint descriptor and the chain of
//! transfer descriptors linked behind it. The controller owns every
//! descriptor between the ED's head and tail pointers; the driver owns the
//! rest. Two rules keep both sides consistent:
//!
//! - The tail slot is always a blank "dummy" descriptor. To append a
//!   transfer, the dummy is filled in, a fresh blank descriptor is linked
//!   behind it, and only then is the ED's tail pointer advanced
//!   ([`EndpointQueue::update_tail_pointer`]). The controller never
//!   processes the descriptor designated by the tail pointer, so the fill
//!   itself can't race with it. An empty queue therefore has
//!   head == tail == dummy.
//!
//! - To take descriptors *back* from the controller (error recovery,
//!   timeout cancellation), the queue must first be paused: set the ED's
//!   skip flag, wait at least one frame, and only then edit the head
//!   pointer. [`EndpointQueue::pause`] and the surgery methods implement
//!   that sequence.

use crate::ohci::ep_descriptor::{self, EndpointDescriptor, HEAD_TOGGLE_CARRY, PTR_MASK};
use crate::ohci::transfer_descriptor::{DataToggle, TdConfig, TransferDescriptor};
use crate::{HwAccessRef, OutOfDmaMemory};

use core::{mem, num::NonZeroU32, time::Duration};
use smallvec::SmallVec;

pub use ep_descriptor::{Config, Direction};

/// An endpoint descriptor plus the transfer descriptor chain behind it.
pub struct EndpointQueue<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Hardware abstraction layer.
    hardware_access: TAcc,
    /// The endpoint descriptor this queue feeds.
    descriptor: EndpointDescriptor<TAcc>,
    /// Transfer descriptors currently linked, oldest first. Does not
    /// include the dummy tail slot.
    transfers: SmallVec<[TransferDescriptor<TAcc>; 4]>,
    /// The blank descriptor the ED's tail pointer designates.
    dummy: TransferDescriptor<TAcc>,
    /// When set, the next transfer queued with an automatic toggle carries
    /// this value as a forced toggle instead. Cleared after one use.
    force_toggle: Option<bool>,
}

impl<TAcc> EndpointQueue<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates the endpoint descriptor and its dummy tail, and points
    /// head and tail at the dummy.
    ///
    /// The returned queue is not yet known to the controller; link it into
    /// a schedule list for any work to happen.
    pub async fn new(
        hardware_access: TAcc,
        config: Config,
    ) -> Result<EndpointQueue<TAcc>, OutOfDmaMemory> {
        let mut descriptor = EndpointDescriptor::new(hardware_access.clone(), config).await?;
        let dummy = TransferDescriptor::new(hardware_access.clone()).await?;

        unsafe {
            // The descriptor isn't on any list yet, so the head word is
            // still ours to write.
            descriptor.set_head_raw(dummy.pointer().get()).await;
            descriptor.set_tail_raw(dummy.pointer().get()).await;
        }

        Ok(EndpointQueue {
            hardware_access,
            descriptor,
            transfers: SmallVec::new(),
            dummy,
            force_toggle: None,
        })
    }

    /// Returns the physical address of the endpoint descriptor.
    pub fn pointer(&self) -> NonZeroU32 {
        self.descriptor.pointer()
    }

    /// Grants access to the underlying endpoint descriptor.
    pub fn descriptor(&mut self) -> &mut EndpointDescriptor<TAcc> {
        &mut self.descriptor
    }

    /// Number of transfer descriptors currently queued.
    pub fn num_queued(&self) -> usize {
        self.transfers.len()
    }

    /// Arms the force-toggle override for the next automatically-toggled
    /// transfer.
    pub fn set_force_toggle(&mut self, toggle: bool) {
        self.force_toggle = Some(toggle);
    }

    /// Fills the dummy tail slot with `config` and links `fresh` behind it
    /// as the new dummy.
    ///
    /// Returns the physical address the transfer ended up at, which is what
    /// the controller will report on the done queue. The ED's tail pointer
    /// is *not* advanced; call [`EndpointQueue::update_tail_pointer`] once
    /// the whole chain of a request has been queued.
    pub async fn queue(
        &mut self,
        mut config: TdConfig,
        fresh: TransferDescriptor<TAcc>,
    ) -> u32 {
        config.toggle = apply_force_toggle(&mut self.force_toggle, config.toggle);

        let next = fresh.pointer().get();
        unsafe {
            // `fresh` is fully written (blank) before the current tail slot
            // starts pointing at it, and the tail slot itself is beyond the
            // published tail, so the controller sees neither write.
            self.dummy.write(&config, next).await;
        }

        let filled = mem::replace(&mut self.dummy, fresh);
        let address = filled.pointer().get();
        self.transfers.push(filled);
        address
    }

    /// Publishes the current dummy as the ED's tail pointer, handing every
    /// descriptor queued so far over to the controller.
    pub async fn update_tail_pointer(&mut self) {
        unsafe {
            self.descriptor
                .set_tail_raw(self.dummy.pointer().get())
                .await;
        }
    }

    /// Removes a retired transfer descriptor from the driver-side list and
    /// releases its storage.
    ///
    /// The descriptor must have been retired (its address showed up on the
    /// done queue) or detached by surgery; either way the controller has
    /// already moved past it.
    pub fn dequeue(&mut self, address: u32) {
        if let Some(idx) = self
            .transfers
            .iter()
            .position(|td| td.pointer().get() == address)
        {
            self.transfers.remove(idx);
        }
    }

    /// Returns true if the controller has halted this endpoint.
    pub async fn is_halted(&self) -> bool {
        self.descriptor.is_halted().await
    }

    /// Sets the ED's skip flag and waits long enough for the controller to
    /// have left the descriptor alone (at least one frame).
    pub async fn pause(&mut self) {
        self.descriptor.set_skip(true).await;
        self.hardware_access.delay(Duration::from_millis(2)).await;
    }

    /// Clears the skip flag, letting the controller service the endpoint
    /// again.
    pub async fn resume(&mut self) {
        self.descriptor.set_skip(false).await;
    }

    /// Detaches every not-yet-retired transfer descriptor, rewinds the head
    /// pointer to the tail and clears the halted bit. The toggle carry is
    /// left as the controller last wrote it.
    ///
    /// Returns the physical addresses of the detached descriptors so the
    /// caller can settle their requests; their storage is released.
    ///
    /// # Safety
    ///
    /// The endpoint must be paused ([`EndpointQueue::pause`]) or halted, so
    /// that the controller is guaranteed not to touch the head pointer
    /// concurrently.
    pub async unsafe fn detach_all(&mut self) -> SmallVec<[u32; 4]> {
        let detached = self
            .transfers
            .iter()
            .map(|td| td.pointer().get())
            .collect();
        self.transfers.clear();

        let carry = self.descriptor.head_raw().await & HEAD_TOGGLE_CARRY;
        self.descriptor
            .set_head_raw((self.dummy.pointer().get() & PTR_MASK) | carry)
            .await;

        detached
    }
}

/// Applies the single-use force-toggle override to an automatically-toggled
/// transfer.
fn apply_force_toggle(force: &mut Option<bool>, toggle: DataToggle) -> DataToggle {
    match toggle {
        DataToggle::Auto => match force.take() {
            Some(true) => DataToggle::Data1,
            Some(false) => DataToggle::Data0,
            None => DataToggle::Auto,
        },
        other => other,
    }
}
