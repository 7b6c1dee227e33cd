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

//! Caller-visible request bookkeeping.
//!
//! A [`TransferRequest`] represents one outstanding control or bulk/
//! interrupt operation. It moves through three states: *setup* while its
//! transfer descriptors are being built, *in progress* once they are handed
//! to the controller, and *done* once a completion code has been decided.
//! Three parties race to decide that code — the done-queue harvest, the
//! timeout worker and endpoint surgery — and the state machine guarantees
//! that exactly one of them wins: once a request is done, no further
//! transition occurs and later verdicts are discarded.
//!
//! The other two structures here are the side tables the engine keeps:
//! the pending map, which resolves a physical transfer descriptor address
//! from the done queue to its owning request in O(1), and the timeout
//! list, ordered by absolute expiry frame.

use crate::devices::EndpointDirection;
use crate::OutOfDmaMemory;

pub use crate::ohci::transfer_descriptor::CompletionCode;

use alloc::{sync::Arc, vec::Vec};
use fnv::FnvBuildHasher;
use futures::channel::oneshot;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Why a request operation failed.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RequestError {
    /// The transfer was attempted and ended with the given condition code.
    #[display(fmt = "transfer failed: {}", _0)]
    Failed(CompletionCode),
    /// No device with the given address is known (or it is hardware-down).
    #[display(fmt = "no such device")]
    NoSuchDevice,
    /// The device has no endpoint matching the number and direction.
    #[display(fmt = "no such endpoint")]
    NoSuchEndpoint,
    /// A descriptor or data buffer couldn't be allocated. Nothing was
    /// queued.
    #[display(fmt = "out of DMA-capable memory")]
    OutOfDmaMemory,
    /// The controller reported an unrecoverable error earlier and the
    /// driver is refusing new work.
    #[display(fmt = "host controller is down")]
    ControllerDown,
    /// The device answered with a descriptor that doesn't parse.
    #[display(fmt = "device returned an invalid descriptor")]
    InvalidDescriptor,
}

impl From<OutOfDmaMemory> for RequestError {
    fn from(_: OutOfDmaMemory) -> RequestError {
        RequestError::OutOfDmaMemory
    }
}

/// State of one transfer descriptor belonging to a request.
#[derive(Debug, Clone)]
pub(crate) struct TdSlot {
    /// Physical address the descriptor was queued at.
    pub address: u32,
    /// Physical address of the first byte of its data buffer, or 0.
    pub buffer_start: u32,
    /// Number of bytes the descriptor covers.
    pub expected_len: u32,
    /// Offset within the caller's buffer where the slot's bytes belong.
    pub data_offset: usize,
    /// True if the slot carries data-stage bytes that count towards the
    /// caller-visible transfer size.
    pub is_data: bool,
    /// True for IN data descriptors whose bytes must be copied back to the
    /// caller.
    pub readback: bool,
    pub retired: bool,
    /// Bytes actually transferred, filled in at retirement.
    pub received: u32,
}

impl TdSlot {
    pub fn new(address: u32, buffer_start: u32, expected_len: u32) -> TdSlot {
        TdSlot {
            address,
            buffer_start,
            expected_len,
            data_offset: 0,
            is_data: false,
            readback: false,
            retired: false,
            received: 0,
        }
    }

    /// Marks the slot as carrying data-stage bytes; `readback` is set for
    /// IN transfers whose bytes must be copied to the caller's buffer.
    pub fn data_slot(mut self, data_offset: usize, readback: bool) -> TdSlot {
        self.data_offset = data_offset;
        self.is_data = true;
        self.readback = readback;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    InProgress,
    Done,
}

struct Inner {
    phase: Phase,
    tds: SmallVec<[TdSlot; 4]>,
    code: Option<CompletionCode>,
    notify: Option<oneshot::Sender<()>>,
}

/// One outstanding caller-visible operation.
pub(crate) struct TransferRequest {
    /// USB address of the target device.
    pub device: u8,
    pub endpoint_number: u8,
    /// `None` for control requests (the default control pipe is
    /// bidirectional).
    pub endpoint_direction: Option<EndpointDirection>,
    inner: spin::Mutex<Inner>,
}

/// What a retirement notification did to the owning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireOutcome {
    /// More descriptors are still outstanding.
    Pending,
    /// This retirement decided the request's completion code.
    Completed(CompletionCode),
    /// The request had already reached its final state; the verdict is
    /// discarded.
    AlreadyDone,
}

impl TransferRequest {
    pub fn new(
        device: u8,
        endpoint_number: u8,
        endpoint_direction: Option<EndpointDirection>,
        tds: SmallVec<[TdSlot; 4]>,
        notify: oneshot::Sender<()>,
    ) -> TransferRequest {
        TransferRequest {
            device,
            endpoint_number,
            endpoint_direction,
            inner: spin::Mutex::new(Inner {
                phase: Phase::Setup,
                tds,
                code: None,
                notify: Some(notify),
            }),
        }
    }

    /// Marks the request as handed over to the controller.
    pub fn submit(&self) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.phase, Phase::Setup);
        inner.phase = Phase::InProgress;
    }

    /// Records the retirement of one of the request's descriptors.
    ///
    /// `final_cbp` is the current-buffer-pointer word the controller left
    /// in the retired descriptor: 0 when the buffer was fully used,
    /// otherwise the address of the first untouched byte, which is how the
    /// per-descriptor byte count is recovered.
    ///
    /// The request completes when every descriptor has retired, or
    /// immediately with the first non-`NoError` condition code.
    pub fn mark_retired(&self, address: u32, code: CompletionCode, final_cbp: u32) -> RetireOutcome {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Done {
            return RetireOutcome::AlreadyDone;
        }

        if let Some(slot) = inner.tds.iter_mut().find(|td| td.address == address) {
            slot.retired = true;
            slot.received = if final_cbp == 0 {
                slot.expected_len
            } else {
                final_cbp
                    .saturating_sub(slot.buffer_start)
                    .min(slot.expected_len)
            };
        }

        if code.is_error() {
            complete(&mut inner, code);
            return RetireOutcome::Completed(code);
        }

        if inner.tds.iter().all(|td| td.retired) {
            complete(&mut inner, CompletionCode::NoError);
            return RetireOutcome::Completed(CompletionCode::NoError);
        }

        RetireOutcome::Pending
    }

    /// Forces a final code if the request hasn't completed yet. Used by the
    /// timeout worker (`Expired`) and by endpoint surgery (`NotAccessed`
    /// for requests queued behind a failure).
    ///
    /// Returns false if the request was already done, in which case the
    /// earlier verdict stands.
    pub fn complete_if_active(&self, code: CompletionCode) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Done {
            return false;
        }
        complete(&mut inner, code);
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().phase == Phase::Done
    }

    /// The final completion code. `None` while not done.
    pub fn completion_code(&self) -> Option<CompletionCode> {
        self.inner.lock().code
    }

    /// Physical addresses of every descriptor of the request.
    pub fn td_addresses(&self) -> SmallVec<[u32; 4]> {
        self.inner.lock().tds.iter().map(|td| td.address).collect()
    }

    /// Snapshot of the descriptor slots, for the completion epilogue.
    pub fn td_slots(&self) -> SmallVec<[TdSlot; 4]> {
        self.inner.lock().tds.clone()
    }
}

fn complete(inner: &mut Inner, code: CompletionCode) {
    inner.phase = Phase::Done;
    inner.code = Some(code);
    if let Some(notify) = inner.notify.take() {
        // The caller may have been dropped; nothing to do then.
        let _ = notify.send(());
    }
}

/// Map from the physical address of a queued transfer descriptor to its
/// owning request. Populated at submission, pruned at retirement and by
/// surgery, so that it contains exactly the descriptors of in-progress
/// requests.
pub(crate) struct PendingRequests {
    map: HashMap<u32, Arc<TransferRequest>, FnvBuildHasher>,
}

impl PendingRequests {
    pub fn new() -> PendingRequests {
        PendingRequests {
            map: HashMap::default(),
        }
    }

    pub fn insert(&mut self, address: u32, request: Arc<TransferRequest>) {
        let previous = self.map.insert(address, request);
        debug_assert!(previous.is_none());
    }

    pub fn take(&mut self, address: u32) -> Option<Arc<TransferRequest>> {
        self.map.remove(&address)
    }

    /// Empties the map, returning every tracked request. Used when the
    /// controller reports an unrecoverable error and nothing will ever
    /// retire again.
    pub fn drain_all(&mut self) -> Vec<Arc<TransferRequest>> {
        self.map.drain().map(|(_, request)| request).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Requests ordered by absolute expiry, expressed in frame numbers.
pub(crate) struct TimeoutList {
    entries: Vec<TimeoutEntry>,
}

struct TimeoutEntry {
    deadline: u64,
    request: Arc<TransferRequest>,
}

impl TimeoutList {
    pub fn new() -> TimeoutList {
        TimeoutList {
            entries: Vec::new(),
        }
    }

    /// Inserts keeping the list sorted by deadline; requests with equal
    /// deadlines keep their insertion order.
    pub fn insert(&mut self, deadline: u64, request: Arc<TransferRequest>) {
        let idx = self
            .entries
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, TimeoutEntry { deadline, request });
    }

    /// Removes and returns every request whose deadline has passed.
    pub fn pop_expired(&mut self, now: u64) -> SmallVec<[Arc<TransferRequest>; 4]> {
        let cut = self
            .entries
            .iter()
            .position(|e| e.deadline > now)
            .unwrap_or(self.entries.len());
        self.entries.drain(..cut).map(|e| e.request).collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].deadline <= w[1].deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Extends the controller's 16-bit frame number to 64 bits across wraps.
pub(crate) struct FrameClock {
    hi: u64,
    last: u16,
}

impl FrameClock {
    pub fn new() -> FrameClock {
        FrameClock { hi: 0, last: 0 }
    }

    /// Feeds a fresh 16-bit reading and returns the extended frame number.
    ///
    /// Must be called at least once per 65 seconds for wraps to be counted
    /// correctly; every maintenance tick qualifies.
    pub fn extend(&mut self, lo: u16) -> u64 {
        if lo < self.last {
            self.hi += 1;
        }
        self.last = lo;
        (self.hi << 16) | u64::from(lo)
    }
}
