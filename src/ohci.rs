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

//! OHCI device handler.
//!
//! [`OhciDriver`] ties the pieces together: it owns the schedule lists, the
//! HCCA, and the per-device endpoint queues, and exposes the two
//! caller-visible operations ([`OhciDriver::control_request`] and
//! [`OhciDriver::interrupt_bulk_io`]) plus the maintenance entry points the
//! embedder drives.
//!
//! Three kinds of context touch the driver concurrently:
//!
//! - Caller tasks submit requests. Submission is serialized by an async
//!   lock over the schedule and device state; the caller then parks on a
//!   per-request channel until a completion code is decided.
//! - [`OhciDriver::on_interrupt`] runs on every controller interrupt. It
//!   harvests the done queue and settles requests, touching only
//!   non-suspending locks so it is safe to run from a context that must
//!   not block.
//! - The workers ([`OhciDriver::process_errors`],
//!   [`OhciDriver::process_timeouts`],
//!   [`OhciDriver::process_root_hub_changes`]) perform the slow recovery
//!   work the interrupt path hands off: endpoint surgery, expiry, and
//!   enumeration. [`OhciDriver::drive`] polls them on a 1 ms tick.

use crate::control_packets::{self, SetupPacket, TransferType};
use crate::devices::{
    ClassBindings, Device, DeviceInfo, DeviceMap, Endpoint, EndpointDirection,
};
use crate::requests::{
    CompletionCode, FrameClock, PendingRequests, RequestError, RetireOutcome, TdSlot, TimeoutList,
    TransferRequest,
};
use crate::{Buffer32, HwAccessRef, OutOfDmaMemory};

use alloc::{string::String, sync::Arc, vec, vec::Vec};
use core::{
    alloc::Layout,
    convert::TryFrom as _,
    num::NonZeroU8,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use futures::channel::{mpsc, oneshot};
use futures::lock::Mutex as AsyncMutex;
use smallvec::SmallVec;

pub mod ep_descriptor;
pub mod ep_queue;
pub mod hcca;
pub mod init;
pub mod regs;
pub mod root_hub;
pub mod schedule;
pub mod transfer_descriptor;

use ep_descriptor::Direction;
use ep_queue::EndpointQueue;
use transfer_descriptor::{
    DataToggle, DirectionPid, TdConfig, TransferDescriptor, NO_INTERRUPT,
};

pub use init::{init_ohci_device, InitError};

/// Number of frames a request's descriptor chain may sit on an endpoint
/// before enumeration sub-requests give up on it.
const ENUMERATION_TIMEOUT_MS: u32 = 500;

/// State shared by submission, surgery and enumeration; everything that
/// hangs off the schedule lists lives under one async lock, which is the
/// submission critical section.
struct DriverState<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    schedule: schedule::Schedule<TAcc>,
    devices: DeviceMap<TAcc>,
}

/// Driver for one OHCI host controller.
pub struct OhciDriver<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    regs_loc: u64,
    num_ports: NonZeroU8,
    hcca: hcca::Hcca<TAcc>,
    state: AsyncMutex<DriverState<TAcc>>,
    /// Physical TD address → owning request, for the done-queue walk.
    pending: spin::Mutex<PendingRequests>,
    /// Requests that completed with an error and whose endpoint awaits
    /// surgery. Filled by the interrupt path, drained by
    /// [`OhciDriver::process_errors`].
    errors: spin::Mutex<Vec<Arc<TransferRequest>>>,
    timeouts: spin::Mutex<TimeoutList>,
    frame_clock: spin::Mutex<FrameClock>,
    class_bindings: spin::Mutex<ClassBindings>,
    /// Set on an unrecoverable error; no request is accepted afterwards.
    fatal: AtomicBool,
    /// A root-hub status change is waiting to be serviced.
    rhsc_pending: AtomicBool,
    /// Root-hub status changes are ignored while enumeration manipulates
    /// the ports itself.
    ignore_rhsc: AtomicBool,
    scheduling_overruns: AtomicU32,
    frame_number_overflows: AtomicU32,
}

/// Values needed to bring a freshly reset controller to the operational
/// state.
pub struct FromSuspendedConfig {
    /// Base of the memory-mapped registers.
    pub registers_location: u64,
    /// `HcFmInterval` value saved before the software reset, or 0 to use
    /// the nominal frame timing.
    pub fm_interval_value: u32,
}

impl<TAcc> OhciDriver<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Finishes the initialization of a controller that has just been
    /// software-reset and is sitting in the suspended state.
    ///
    /// Builds the schedule skeleton and the HCCA, programs the frame
    /// timing, and switches the controller to the operational state with
    /// all four list types enabled.
    pub async fn from_suspended(
        hardware_access: TAcc,
        config: FromSuspendedConfig,
    ) -> Result<OhciDriver<TAcc>, OutOfDmaMemory> {
        let regs_loc = config.registers_location;

        let schedule = schedule::Schedule::new(hardware_access.clone(), regs_loc).await?;

        // Determine the alignment requirement for the HCCA. See section
        // 7.2.1: we write all 1s to the HcHCCA register and read the value
        // back; the controller hardwires the bits it will never use to 0.
        let hcca_alignment = unsafe {
            hardware_access
                .write_memory_u32_le(regs_loc + regs::HC_HCCA_OFFSET, &[0xffffffff])
                .await;
            let mut out = [0];
            hardware_access
                .read_memory_u32_le(regs_loc + regs::HC_HCCA_OFFSET, &mut out)
                .await;
            1usize << out[0].trailing_zeros()
        };

        let hcca = hcca::Hcca::new(
            hardware_access.clone(),
            hcca_alignment,
            &schedule.interrupt_slot_heads(),
        )
        .await?;

        let driver = OhciDriver {
            hardware_access,
            regs_loc,
            num_ports: NonZeroU8::new(1).unwrap(),
            hcca,
            state: AsyncMutex::new(DriverState {
                schedule,
                devices: DeviceMap::new(),
            }),
            pending: spin::Mutex::new(PendingRequests::new()),
            errors: spin::Mutex::new(Vec::new()),
            timeouts: spin::Mutex::new(TimeoutList::new()),
            frame_clock: spin::Mutex::new(FrameClock::new()),
            class_bindings: spin::Mutex::new(ClassBindings::new()),
            fatal: AtomicBool::new(false),
            rhsc_pending: AtomicBool::new(false),
            ignore_rhsc: AtomicBool::new(false),
            scheduling_overruns: AtomicU32::new(0),
            frame_number_overflows: AtomicU32::new(0),
        };

        // Program the shared structures and the frame timing, then switch
        // to operational. The specs allow at most 2 ms between the reset
        // and this switch, which is why no allocation happens below this
        // point.
        {
            let state = driver.state.lock().await;

            driver
                .reg_write(regs::HC_HCCA_OFFSET, driver.hcca.pointer().get())
                .await;
            driver
                .reg_write(
                    regs::HC_CONTROL_HEAD_ED_OFFSET,
                    state.schedule.control_head_pointer().get(),
                )
                .await;
            driver
                .reg_write(
                    regs::HC_BULK_HEAD_ED_OFFSET,
                    state.schedule.bulk_head_pointer().get(),
                )
                .await;

            // Restore the frame interval the firmware had programmed, or
            // fall back to the nominal 1 ms value. The FIT bit must toggle
            // on every rewrite of this register.
            let frame_interval = {
                let saved = config.fm_interval_value & 0x3fff;
                if saved == 0 {
                    regs::FRAME_INTERVAL
                } else {
                    saved
                }
            };
            driver
                .reg_write(
                    regs::HC_FM_INTERVAL_OFFSET,
                    frame_interval
                        | regs::fs_largest_data_packet(frame_interval) << 16
                        | regs::FM_INTERVAL_FIT,
                )
                .await;

            // Start servicing the periodic lists at 90% of the frame.
            driver
                .reg_write(regs::HC_PERIODIC_START_OFFSET, frame_interval * 9 / 10)
                .await;
            driver
                .reg_write(regs::HC_LS_THRESHOLD_OFFSET, regs::LS_THRESHOLD)
                .await;

            // Clear whatever interrupt status survived the reset, then
            // unmask the interrupts the driver actually consumes.
            driver
                .reg_write(regs::HC_INTERRUPT_STATUS_OFFSET, 0xc000_007f)
                .await;
            driver
                .reg_write(
                    regs::HC_INTERRUPT_ENABLE_OFFSET,
                    regs::INT_SO
                        | regs::INT_WDH
                        | regs::INT_RD
                        | regs::INT_UE
                        | regs::INT_FNO
                        | regs::INT_RHSC
                        | regs::INT_MIE,
                )
                .await;

            driver
                .reg_write(
                    regs::HC_CONTROL_OFFSET,
                    regs::CTRL_CBSR_1_4
                        | regs::CTRL_PLE
                        | regs::CTRL_IE
                        | regs::CTRL_CLE
                        | regs::CTRL_BLE
                        | regs::CTRL_HCFS_OPERATIONAL,
                )
                .await;
        }

        let num_ports = root_hub::num_ports(&driver.hardware_access, regs_loc).await;
        root_hub::power_on_ports(&driver.hardware_access, regs_loc).await;

        log::info!(
            "OHCI controller operational, {} downstream ports",
            num_ports
        );

        Ok(OhciDriver { num_ports, ..driver })
    }

    /// Always true; lets device-class drivers probe whether the object
    /// they were handed speaks the USB host interface.
    pub fn is_usb_host(&self) -> bool {
        true
    }

    /// Number of downstream ports on the root hub.
    pub fn root_hub_num_ports(&self) -> NonZeroU8 {
        self.num_ports
    }

    /// True if the given device is known and its hardware is reachable.
    pub async fn hardware_is_up(&self, address: u8) -> bool {
        if self.fatal.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock().await;
        state
            .devices
            .get(address)
            .map_or(false, |device| device.hardware_up)
    }

    /// Snapshot of a device's identity.
    pub async fn device_info(&self, address: u8) -> Option<DeviceInfo> {
        let state = self.state.lock().await;
        state.devices.get(address).map(|device| device.info())
    }

    /// Registers a device-class driver. The returned channel yields the bus
    /// address of every device enumerated from now on whose class and
    /// sub-class match.
    pub fn register_class_driver(&self, class: u8, sub_class: u8) -> mpsc::UnboundedReceiver<u8> {
        self.class_bindings.lock().register(class, sub_class)
    }

    /// Performs a control transfer and blocks the caller until its
    /// completion code is decided.
    ///
    /// `data` is written to the device or filled in, depending on the
    /// direction encoded in the setup packet; it must be at least
    /// `setup.length` bytes. Returns the number of data-stage bytes
    /// actually transferred.
    ///
    /// # Panic
    ///
    /// Panics if `data` is shorter than the length declared in `setup`.
    pub async fn control_request(
        &self,
        address: u8,
        endpoint_number: u8,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RequestError> {
        let length = usize::from(setup.length);
        assert!(data.len() >= length);
        let device_to_host = setup.is_device_to_host();
        let setup_bytes = setup.encode();

        if self.fatal.load(Ordering::SeqCst) {
            return Err(RequestError::ControllerDown);
        }

        let mut state = self.state.lock().await;

        let max_packet_size = {
            let device = state
                .devices
                .get_mut(address)
                .filter(|device| device.hardware_up)
                .ok_or(RequestError::NoSuchDevice)?;
            let endpoint = device
                .endpoint_mut(endpoint_number, None)
                .ok_or(RequestError::NoSuchEndpoint)?;
            usize::from(endpoint.queue.descriptor().config().maximum_packet_size)
        };
        assert!(max_packet_size > 0);

        // Everything is allocated before anything is linked, so that an
        // allocation failure can't leave a partial chain behind.
        let setup_buffer = Buffer32::new(
            self.hardware_access.clone(),
            Layout::from_size_align(8, 16).unwrap(),
        )
        .await?;
        unsafe {
            self.hardware_access
                .write_memory_u8(u64::from(setup_buffer.pointer().get()), &setup_bytes)
                .await;
        }

        let data_buffer = if length > 0 {
            let buffer = Buffer32::new(
                self.hardware_access.clone(),
                Layout::from_size_align(length, 16).unwrap(),
            )
            .await?;
            if !device_to_host {
                unsafe {
                    self.hardware_access
                        .write_memory_u8(u64::from(buffer.pointer().get()), &data[..length])
                        .await;
                }
            }
            Some(buffer)
        } else {
            None
        };

        let data_chunks = (length + max_packet_size - 1) / max_packet_size;
        let mut fresh = Vec::with_capacity(data_chunks + 2);
        for _ in 0..data_chunks + 2 {
            fresh.push(TransferDescriptor::new(self.hardware_access.clone()).await?);
        }
        let mut fresh = fresh.into_iter();

        let device = state.devices.get_mut(address).unwrap();
        let endpoint = device.endpoint_mut(endpoint_number, None).unwrap();

        let mut slots: SmallVec<[TdSlot; 4]> = SmallVec::new();

        // Setup stage: always DATA0.
        let queued = endpoint
            .queue
            .queue(
                TdConfig {
                    buffer_rounding: false,
                    direction: DirectionPid::Setup,
                    delay_interrupt: NO_INTERRUPT,
                    toggle: DataToggle::Data0,
                    current_buffer: setup_buffer.pointer().get(),
                    buffer_end: setup_buffer.pointer().get() + 7,
                },
                fresh.next().unwrap(),
            )
            .await;
        slots.push(TdSlot::new(queued, setup_buffer.pointer().get(), 8));

        // Data stage: alternating toggles, starting at DATA1.
        if let Some(data_buffer) = &data_buffer {
            let base = data_buffer.pointer().get();
            let mut offset = 0;
            let mut data1 = true;
            while offset < length {
                let chunk = (length - offset).min(max_packet_size);
                let start = base + u32::try_from(offset).unwrap();
                let queued = endpoint
                    .queue
                    .queue(
                        TdConfig {
                            buffer_rounding: device_to_host,
                            direction: if device_to_host {
                                DirectionPid::In
                            } else {
                                DirectionPid::Out
                            },
                            delay_interrupt: NO_INTERRUPT,
                            toggle: if data1 {
                                DataToggle::Data1
                            } else {
                                DataToggle::Data0
                            },
                            current_buffer: start,
                            buffer_end: start + u32::try_from(chunk - 1).unwrap(),
                        },
                        fresh.next().unwrap(),
                    )
                    .await;
                slots.push(
                    TdSlot::new(queued, start, u32::try_from(chunk).unwrap())
                        .data_slot(offset, device_to_host),
                );
                data1 = !data1;
                offset += chunk;
            }
        }

        // Status stage: zero-length, opposite to the data direction (IN
        // when there is no data stage), always DATA1, and the only
        // descriptor of the chain that requests an interrupt.
        let queued = endpoint
            .queue
            .queue(
                TdConfig {
                    buffer_rounding: false,
                    direction: if device_to_host && length > 0 {
                        DirectionPid::Out
                    } else {
                        DirectionPid::In
                    },
                    delay_interrupt: 0,
                    toggle: DataToggle::Data1,
                    current_buffer: 0,
                    buffer_end: 0,
                },
                fresh.next().unwrap(),
            )
            .await;
        slots.push(TdSlot::new(queued, 0, 0));

        let (request, receiver) = self
            .arm_request(address, endpoint_number, None, slots, timeout_ms)
            .await;

        endpoint.queue.update_tail_pointer().await;
        self.reg_write(regs::HC_COMMAND_STATUS_OFFSET, regs::CMD_CLF).await;
        drop(state);

        let _ = receiver.await;

        // The DMA buffers are owned by this call frame: they stay alive
        // until the request has reached its final state and its
        // descriptors are off the endpoint chain, and only then are they
        // released.
        let result = self.finish_request(&request, data).await;
        drop(setup_buffer);
        drop(data_buffer);
        result
    }

    /// Performs a bulk or interrupt transfer and blocks the caller until
    /// its completion code is decided.
    ///
    /// The buffer is split into max-packet-size transfer descriptors; a
    /// zero-length `data` sends a single zero-length packet. Returns the
    /// number of bytes actually transferred.
    pub async fn interrupt_bulk_io(
        &self,
        address: u8,
        endpoint_number: u8,
        direction: EndpointDirection,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, RequestError> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(RequestError::ControllerDown);
        }

        let length = data.len();
        let device_to_host = direction == EndpointDirection::In;

        let mut state = self.state.lock().await;

        let (max_packet_size, is_bulk) = {
            let device = state
                .devices
                .get_mut(address)
                .filter(|device| device.hardware_up)
                .ok_or(RequestError::NoSuchDevice)?;
            let endpoint = device
                .endpoint_mut(endpoint_number, Some(direction))
                .ok_or(RequestError::NoSuchEndpoint)?;
            match endpoint.ty {
                TransferType::Bulk | TransferType::Interrupt => {}
                _ => return Err(RequestError::NoSuchEndpoint),
            }
            (
                usize::from(endpoint.queue.descriptor().config().maximum_packet_size),
                endpoint.ty == TransferType::Bulk,
            )
        };
        assert!(max_packet_size > 0);

        let data_buffer = if length > 0 {
            let buffer = Buffer32::new(
                self.hardware_access.clone(),
                Layout::from_size_align(length, 16).unwrap(),
            )
            .await?;
            if !device_to_host {
                unsafe {
                    self.hardware_access
                        .write_memory_u8(u64::from(buffer.pointer().get()), data)
                        .await;
                }
            }
            Some(buffer)
        } else {
            None
        };

        let chunks = ((length + max_packet_size - 1) / max_packet_size).max(1);
        let mut fresh = Vec::with_capacity(chunks);
        for _ in 0..chunks {
            fresh.push(TransferDescriptor::new(self.hardware_access.clone()).await?);
        }
        let mut fresh = fresh.into_iter();

        let device = state.devices.get_mut(address).unwrap();
        let endpoint = device
            .endpoint_mut(endpoint_number, Some(direction))
            .unwrap();

        let mut slots: SmallVec<[TdSlot; 4]> = SmallVec::new();
        let base = data_buffer.as_ref().map_or(0, |b| b.pointer().get());
        let mut offset = 0;
        for chunk_index in 0..chunks {
            let chunk = (length - offset).min(max_packet_size);
            let last = chunk_index + 1 == chunks;
            let start = if chunk == 0 {
                0
            } else {
                base + u32::try_from(offset).unwrap()
            };
            let queued = endpoint
                .queue
                .queue(
                    TdConfig {
                        buffer_rounding: device_to_host,
                        direction: if device_to_host {
                            DirectionPid::In
                        } else {
                            DirectionPid::Out
                        },
                        // Intermediate descriptors don't interrupt; only
                        // the completion of the whole request matters.
                        delay_interrupt: if last { 0 } else { NO_INTERRUPT },
                        toggle: DataToggle::Auto,
                        current_buffer: start,
                        buffer_end: if chunk == 0 {
                            0
                        } else {
                            start + u32::try_from(chunk - 1).unwrap()
                        },
                    },
                    fresh.next().unwrap(),
                )
                .await;
            slots.push(
                TdSlot::new(queued, start, u32::try_from(chunk).unwrap())
                    .data_slot(offset, device_to_host),
            );
            offset += chunk;
        }

        let (request, receiver) = self
            .arm_request(address, endpoint_number, Some(direction), slots, timeout_ms)
            .await;

        endpoint.queue.update_tail_pointer().await;
        if is_bulk {
            self.reg_write(regs::HC_COMMAND_STATUS_OFFSET, regs::CMD_BLF).await;
        }
        // Interrupt endpoints need no doorbell; the controller polls them
        // through the periodic schedule.

        drop(state);
        let _ = receiver.await;

        let result = self.finish_request(&request, data).await;
        drop(data_buffer);
        result
    }

    /// Reads a string descriptor and decodes its UTF-16 payload.
    pub async fn string_descriptor(
        &self,
        address: u8,
        index: u8,
    ) -> Result<String, RequestError> {
        let mut buffer = [0u8; 255];
        let setup = SetupPacket::get_descriptor(
            control_packets::DESCRIPTOR_STRING,
            index,
            0x0409,
            u16::try_from(buffer.len()).unwrap(),
        );
        let len = self.control_request(address, 0, &setup, &mut buffer, 100).await?;
        control_packets::parse_string_descriptor(&buffer[..len])
            .ok_or(RequestError::InvalidDescriptor)
    }

    /// Registers the request in the pending map and on the timeout list,
    /// and transitions it to in-progress. Must be called with the state
    /// lock held, after the descriptors have been queued but before the
    /// tail pointer is published.
    async fn arm_request(
        &self,
        address: u8,
        endpoint_number: u8,
        direction: Option<EndpointDirection>,
        slots: SmallVec<[TdSlot; 4]>,
        timeout_ms: u32,
    ) -> (Arc<TransferRequest>, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        let request = Arc::new(TransferRequest::new(
            address,
            endpoint_number,
            direction,
            slots,
            sender,
        ));

        {
            let mut pending = self.pending.lock();
            for td_address in request.td_addresses() {
                pending.insert(td_address, request.clone());
            }
        }
        request.submit();

        if timeout_ms > 0 {
            let deadline = self.current_frame().await + u64::from(timeout_ms);
            self.timeouts.lock().insert(deadline, request.clone());
        }

        (request, receiver)
    }

    /// Completion epilogue: removes the request's descriptors from the
    /// endpoint chain, copies received bytes back to the caller, and turns
    /// the completion code into the caller-visible result.
    async fn finish_request(
        &self,
        request: &Arc<TransferRequest>,
        data: &mut [u8],
    ) -> Result<usize, RequestError> {
        {
            // Surgery or harvest have usually pruned these already; this
            // sweep covers requests that never got either.
            let mut pending = self.pending.lock();
            for address in request.td_addresses() {
                let _ = pending.take(address);
            }
        }

        {
            // Release the storage of the retired descriptors. Descriptors
            // that never retired are still linked on the (halted or
            // skipped) endpoint; they belong to endpoint surgery, which
            // detaches them before the chain is rewritten.
            let mut state = self.state.lock().await;
            if let Some(device) = state.devices.get_mut(request.device) {
                if let Some(endpoint) =
                    device.endpoint_mut(request.endpoint_number, request.endpoint_direction)
                {
                    for slot in request.td_slots().iter().filter(|slot| slot.retired) {
                        endpoint.queue.dequeue(slot.address);
                    }
                }
            }
        }

        let code = request
            .completion_code()
            .unwrap_or(CompletionCode::NotAccessed);

        let mut transferred = 0;
        for slot in request.td_slots().iter().filter(|slot| slot.is_data) {
            let received = usize::try_from(slot.received).unwrap();
            transferred += received;
            if slot.readback && received > 0 {
                unsafe {
                    self.hardware_access
                        .read_memory_u8(
                            u64::from(slot.buffer_start),
                            &mut data[slot.data_offset..slot.data_offset + received],
                        )
                        .await;
                }
            }
        }

        match code {
            CompletionCode::NoError => Ok(transferred),
            other => Err(RequestError::Failed(other)),
        }
    }

    /// Reads the latest updates from the controller.
    ///
    /// Must be called as a result of the controller's interrupt. Settles
    /// completed requests and hands slow recovery work to the workers; only
    /// non-suspending locks are taken.
    pub async fn on_interrupt(&self) {
        let status = self.reg_read(regs::HC_INTERRUPT_STATUS_OFFSET).await;
        if status == 0 {
            return;
        }

        if status & regs::INT_UE != 0 {
            // Unrecoverable error: the controller has stopped all list
            // processing. Fail everything in flight and refuse new work.
            log::error!("OHCI controller reported an unrecoverable error");
            self.fatal.store(true, Ordering::SeqCst);
            let drained = self.pending.lock().drain_all();
            for request in drained {
                request.complete_if_active(CompletionCode::DeviceNotResponding);
            }
        }

        if status & regs::INT_WDH != 0 {
            // The done head must be consumed before the interrupt is
            // acknowledged, otherwise the controller could overwrite it.
            self.harvest_done_queue().await;
        }

        if status & regs::INT_RHSC != 0 && !self.ignore_rhsc.load(Ordering::SeqCst) {
            self.rhsc_pending.store(true, Ordering::SeqCst);
        }

        if status & regs::INT_SO != 0 {
            self.scheduling_overruns.fetch_add(1, Ordering::Relaxed);
        }
        if status & regs::INT_FNO != 0 {
            self.frame_number_overflows.fetch_add(1, Ordering::Relaxed);
        }

        // Acknowledge everything that was observed.
        self.reg_write(regs::HC_INTERRUPT_STATUS_OFFSET, status).await;
    }

    /// Walks the done queue, pairing every retired descriptor back to its
    /// request and waking callers whose requests reached a final state.
    async fn harvest_done_queue(&self) {
        let head = unsafe {
            match self.hcca.consume_done_head().await {
                Some(head) => head.get(),
                None => return,
            }
        };

        // The controller prepends on retirement, so the chain is in
        // reverse retirement order; collect and flip it to process
        // completions in hardware order.
        let mut retired: SmallVec<[(u32, transfer_descriptor::RetiredTd); 8]> = SmallVec::new();
        let mut address = head;
        while address != 0 && retired.len() < 1024 {
            let td = unsafe {
                transfer_descriptor::read_retired(&self.hardware_access, address).await
            };
            retired.push((address, td));
            address = td.next;
        }

        for &(address, td) in retired.iter().rev() {
            let request = self.pending.lock().take(address);
            let request = match request {
                Some(request) => request,
                None => {
                    // Can happen when surgery pruned the request between
                    // the controller's retirement and this walk.
                    log::trace!("retired TD {:#x} has no pending request", address);
                    continue;
                }
            };

            match request.mark_retired(address, td.completion_code, td.current_buffer) {
                RetireOutcome::Completed(code) if code.is_error() => {
                    log::debug!(
                        "transfer on device {} endpoint {} failed: {}",
                        request.device,
                        request.endpoint_number,
                        code
                    );
                    // The controller has halted the endpoint; queue it for
                    // surgery in worker context.
                    self.errors.lock().push(request);
                }
                _ => {}
            }
        }
    }

    /// Error worker: recovers every endpoint whose request failed, by
    /// endpoint surgery. Requests that were queued behind the failure are
    /// cancelled with [`CompletionCode::NotAccessed`].
    pub async fn process_errors(&self) {
        loop {
            let request = match self.errors.lock().pop() {
                Some(request) => request,
                None => break,
            };

            let mut state = self.state.lock().await;
            self.recover_endpoint(
                &mut state,
                request.device,
                request.endpoint_number,
                request.endpoint_direction,
                None,
            )
            .await;
        }
    }

    /// Timeout worker: expires requests whose deadline frame has passed.
    ///
    /// The expired request's descriptors are detached by endpoint surgery
    /// *before* the caller is unblocked, so the caller can release its
    /// buffers immediately. A request the done-queue harvest settled first
    /// keeps its harvest-delivered code.
    pub async fn process_timeouts(&self) {
        let now = self.current_frame().await;
        let expired = self.timeouts.lock().pop_expired(now);

        for request in expired {
            if request.is_done() {
                continue;
            }

            log::debug!(
                "request on device {} endpoint {} expired",
                request.device,
                request.endpoint_number
            );

            let mut state = self.state.lock().await;
            self.recover_endpoint(
                &mut state,
                request.device,
                request.endpoint_number,
                request.endpoint_direction,
                Some(&request),
            )
            .await;
            drop(state);

            // In case the descriptors were already off the chain.
            request.complete_if_active(CompletionCode::Expired);
        }
    }

    /// Endpoint surgery: pauses the endpoint, detaches every in-flight
    /// descriptor, settles their requests, and un-halts the endpoint.
    ///
    /// `expiring` designates a request that should be completed with
    /// `Expired` rather than `NotAccessed`.
    async fn recover_endpoint(
        &self,
        state: &mut DriverState<TAcc>,
        device_address: u8,
        endpoint_number: u8,
        direction: Option<EndpointDirection>,
        expiring: Option<&Arc<TransferRequest>>,
    ) {
        let device = match state.devices.get_mut(device_address) {
            Some(device) => device,
            None => return,
        };
        let endpoint = match device.endpoint_mut(endpoint_number, direction) {
            Some(endpoint) => endpoint,
            None => return,
        };

        endpoint.queue.pause().await;
        let detached = unsafe { endpoint.queue.detach_all().await };

        for address in detached {
            let request = self.pending.lock().take(address);
            if let Some(request) = request {
                let code = match expiring {
                    Some(expiring) if Arc::ptr_eq(&request, expiring) => CompletionCode::Expired,
                    _ => CompletionCode::NotAccessed,
                };
                request.complete_if_active(code);
            }
        }

        endpoint.queue.resume().await;
    }

    /// Installer worker: services root hub connect and disconnect changes.
    ///
    /// Also performs the initial bus enumeration when called after
    /// initialization: any port with a connected device that hasn't been
    /// enumerated yet is treated as newly connected.
    pub async fn process_root_hub_changes(&self) {
        if self.fatal.load(Ordering::SeqCst) {
            return;
        }

        self.rhsc_pending.store(false, Ordering::SeqCst);

        // Enumeration resets ports itself, which would otherwise re-enter
        // here through the status-change interrupt.
        self.ignore_rhsc.store(true, Ordering::SeqCst);

        for port in 1..=self.num_ports.get() {
            let port = NonZeroU8::new(port).unwrap();
            let status =
                root_hub::port_status(&self.hardware_access, self.regs_loc, port).await;

            let changed = status.connect_change();
            if changed {
                root_hub::write_port_status(
                    &self.hardware_access,
                    self.regs_loc,
                    port,
                    regs::PORT_CSC,
                )
                .await;
            }

            let existing = {
                let state = self.state.lock().await;
                state.devices.address_on_root_port(port.get())
            };

            if status.connected() {
                let stale = if changed { existing } else { None };
                if let Some(address) = stale {
                    // The device was replaced while we weren't looking.
                    self.idle_device(address).await;
                }
                if existing.is_none() || stale.is_some() {
                    log::info!("device connected on root hub port {}", port);
                    if let Err(err) = self.install_device_on_port(port).await {
                        log::error!("enumeration failed on port {}: {}", port, err);
                    }
                }
            } else if let Some(address) = existing {
                log::info!("device disconnected from root hub port {}", port);
                self.idle_device(address).await;
            }
        }

        self.ignore_rhsc.store(false, Ordering::SeqCst);
    }

    /// Resets the port, addresses the device, reads its descriptors,
    /// creates and schedules its endpoints, and offers it to the class
    /// drivers.
    async fn install_device_on_port(&self, port: NonZeroU8) -> Result<(), EnumerationError> {
        let status = root_hub::reset_port(&self.hardware_access, self.regs_loc, port)
            .await
            .ok_or(EnumerationError::PortResetFailed)?;
        let low_speed = status.low_speed_attached();

        // The device now listens on the default address 0 with a control
        // pipe of at most 8 bytes per packet.
        {
            let mut state = self.state.lock().await;
            if state.devices.get(0).is_some() {
                // A previous enumeration died halfway through.
                drop(state);
                self.idle_device(0).await;
                state = self.state.lock().await;
            }

            let queue = EndpointQueue::new(
                self.hardware_access.clone(),
                ep_descriptor::Config {
                    maximum_packet_size: 8,
                    function_address: 0,
                    endpoint_number: 0,
                    isochronous: false,
                    low_speed,
                    skip: false,
                    direction: Direction::FromTd,
                },
            )
            .await?;
            let placement =
                unsafe { state.schedule.append_control(queue.pointer().get()).await };

            state.devices.insert(Device {
                address: 0,
                root_port: port.get(),
                hub_address: None,
                class: 0,
                sub_class: 0,
                protocol: 0,
                vendor_id: 0,
                product_id: 0,
                low_speed,
                hardware_up: true,
                has_device_driver: false,
                endpoints: vec![Endpoint {
                    number: 0,
                    direction: Direction::FromTd,
                    ty: TransferType::Control,
                    interval: 0,
                    queue,
                    placement: Some(placement),
                }],
            });
        }

        // Reset recovery time before the first token.
        self.hardware_access.delay(Duration::from_millis(10)).await;

        // First 8 bytes of the device descriptor, to learn the real
        // max packet size of the control pipe.
        let mut short_descriptor = [0u8; 8];
        self.control_request(
            0,
            0,
            &SetupPacket::get_descriptor(control_packets::DESCRIPTOR_DEVICE, 0, 0, 8),
            &mut short_descriptor,
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;
        let max_packet_size0 = u16::from(short_descriptor[7]).max(8);

        {
            let mut state = self.state.lock().await;
            let device = state
                .devices
                .get_mut(0)
                .ok_or(EnumerationError::DeviceVanished)?;
            let endpoint = device.control_endpoint_mut().unwrap();
            let mut config = endpoint.queue.descriptor().config().clone();
            config.maximum_packet_size = max_packet_size0;
            endpoint.queue.descriptor().set_config(config).await;
        }

        // Assign the next free bus address. All new devices listen on 0;
        // the enumeration lock (one install at a time) guarantees no two
        // devices share it.
        let address = {
            let state = self.state.lock().await;
            state
                .devices
                .next_free_address()
                .ok_or(EnumerationError::NoFreeAddresses)?
        };
        self.control_request(
            0,
            0,
            &SetupPacket::set_address(address),
            &mut [],
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;

        // Give the device time to start listening on its new address.
        self.hardware_access.delay(Duration::from_millis(2)).await;

        {
            let mut state = self.state.lock().await;
            if !state.devices.rekey(0, address) {
                return Err(EnumerationError::DeviceVanished);
            }
            let device = state.devices.get_mut(address).unwrap();
            let endpoint = device.control_endpoint_mut().unwrap();
            let mut config = endpoint.queue.descriptor().config().clone();
            config.function_address = address;
            endpoint.queue.descriptor().set_config(config).await;
        }

        // Full device descriptor, on the new address.
        let mut descriptor_bytes = [0u8; control_packets::DeviceDescriptor::LENGTH];
        self.control_request(
            address,
            0,
            &SetupPacket::get_descriptor(
                control_packets::DESCRIPTOR_DEVICE,
                0,
                0,
                u16::try_from(descriptor_bytes.len()).unwrap(),
            ),
            &mut descriptor_bytes,
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;
        let descriptor = control_packets::DeviceDescriptor::parse(&descriptor_bytes)
            .ok_or(EnumerationError::BadDescriptor)?;

        // Configuration descriptor: header first for the total length,
        // then the whole bundle.
        let mut config_header = [0u8; control_packets::ConfigDescriptor::LENGTH];
        self.control_request(
            address,
            0,
            &SetupPacket::get_descriptor(
                control_packets::DESCRIPTOR_CONFIGURATION,
                0,
                0,
                u16::try_from(config_header.len()).unwrap(),
            ),
            &mut config_header,
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;
        let total_length = control_packets::ConfigDescriptor::parse(&config_header)
            .ok_or(EnumerationError::BadDescriptor)?
            .total_length;
        if usize::from(total_length) < control_packets::ConfigDescriptor::LENGTH {
            return Err(EnumerationError::BadDescriptor);
        }

        let mut config_bytes = vec![0u8; usize::from(total_length)];
        self.control_request(
            address,
            0,
            &SetupPacket::get_descriptor(
                control_packets::DESCRIPTOR_CONFIGURATION,
                0,
                0,
                total_length,
            ),
            &mut config_bytes,
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;
        let configuration = control_packets::parse_configuration(&config_bytes)
            .ok_or(EnumerationError::BadDescriptor)?;

        self.control_request(
            address,
            0,
            &SetupPacket::set_configuration(configuration.config.configuration_value),
            &mut [],
            ENUMERATION_TIMEOUT_MS,
        )
        .await?;

        // Create and schedule one endpoint queue per declared endpoint.
        let (class, sub_class) = {
            let mut state = self.state.lock().await;

            // The class is declared either on the device or, for composite
            // and class-per-interface devices, on the first interface.
            let (class, sub_class, protocol) = if descriptor.class != 0 {
                (descriptor.class, descriptor.sub_class, descriptor.protocol)
            } else if let Some(interface) = configuration.interfaces.first() {
                (
                    interface.descriptor.class,
                    interface.descriptor.sub_class,
                    interface.descriptor.protocol,
                )
            } else {
                (0, 0, 0)
            };

            let mut new_endpoints = Vec::new();
            for interface in &configuration.interfaces {
                for endpoint_descriptor in &interface.endpoints {
                    let ty = endpoint_descriptor.transfer_type();
                    let interval = match ty {
                        TransferType::Interrupt => {
                            control_packets::schedule_interval(endpoint_descriptor.interval)
                        }
                        _ => 0,
                    };

                    let queue = EndpointQueue::new(
                        self.hardware_access.clone(),
                        ep_descriptor::Config {
                            maximum_packet_size: endpoint_descriptor.max_packet_size,
                            function_address: address,
                            endpoint_number: endpoint_descriptor.number(),
                            isochronous: ty == TransferType::Isochronous,
                            low_speed,
                            skip: false,
                            direction: endpoint_descriptor
                                .direction()
                                .descriptor_direction(),
                        },
                    )
                    .await?;

                    new_endpoints.push((queue, ty, interval, endpoint_descriptor.clone()));
                }
            }

            for (queue, ty, interval, endpoint_descriptor) in new_endpoints {
                let pointer = queue.pointer().get();
                let placement = unsafe {
                    match ty {
                        TransferType::Bulk => state.schedule.append_bulk(pointer).await,
                        TransferType::Interrupt => {
                            state.schedule.insert_interrupt(pointer, interval).await
                        }
                        TransferType::Isochronous => state.schedule.append_iso(pointer).await,
                        TransferType::Control => state.schedule.append_control(pointer).await,
                    }
                };

                let device = state
                    .devices
                    .get_mut(address)
                    .ok_or(EnumerationError::DeviceVanished)?;
                device.endpoints.push(Endpoint {
                    number: endpoint_descriptor.number(),
                    direction: endpoint_descriptor.direction().descriptor_direction(),
                    ty,
                    interval,
                    queue,
                    placement: Some(placement),
                });
            }

            let device = state
                .devices
                .get_mut(address)
                .ok_or(EnumerationError::DeviceVanished)?;
            device.class = class;
            device.sub_class = sub_class;
            device.protocol = protocol;
            device.vendor_id = descriptor.vendor_id;
            device.product_id = descriptor.product_id;

            (class, sub_class)
        };

        let claimed = self.class_bindings.lock().notify(address, class, sub_class);
        {
            let mut state = self.state.lock().await;
            if let Some(device) = state.devices.get_mut(address) {
                device.has_device_driver = claimed;
            }
        }

        log::info!(
            "enumerated device {:04x}:{:04x} (class {:02x}:{:02x}) at address {}",
            descriptor.vendor_id,
            descriptor.product_id,
            class,
            sub_class,
            address
        );

        Ok(())
    }

    /// Tears a device down: fails its outstanding requests, unlinks its
    /// endpoint descriptors from the schedules, and forgets it.
    async fn idle_device(&self, address: u8) {
        let mut state = self.state.lock().await;
        let mut device = match state.devices.remove(address) {
            Some(device) => device,
            None => return,
        };
        device.hardware_up = false;

        for endpoint in &mut device.endpoints {
            endpoint.queue.pause().await;
            let detached = unsafe { endpoint.queue.detach_all().await };
            for td_address in detached {
                let request = self.pending.lock().take(td_address);
                if let Some(request) = request {
                    request.complete_if_active(CompletionCode::DeviceNotResponding);
                }
            }

            if let Some(placement) = endpoint.placement.take() {
                unsafe {
                    state
                        .schedule
                        .remove(endpoint.queue.pointer().get(), placement)
                        .await;
                }
            }
        }

        // The endpoint descriptors are unlinked from every schedule list;
        // dropping the device may now release their storage.
        drop(device);
        log::info!("device at address {} removed", address);
    }

    /// Runs the maintenance workers forever on a 1 ms tick. The embedder
    /// spawns this alongside its interrupt delivery.
    pub async fn drive(&self) {
        loop {
            self.hardware_access.delay(Duration::from_millis(1)).await;
            if self.rhsc_pending.load(Ordering::SeqCst) {
                self.process_root_hub_changes().await;
            }
            self.process_errors().await;
            self.process_timeouts().await;
        }
    }

    /// Extended (wrap-corrected) current frame number.
    async fn current_frame(&self) -> u64 {
        let lo = (self.reg_read(regs::HC_FM_NUMBER_OFFSET).await & 0xffff) as u16;
        self.frame_clock.lock().extend(lo)
    }

    /// Number of scheduling overruns the controller has reported.
    pub fn scheduling_overruns(&self) -> u32 {
        self.scheduling_overruns.load(Ordering::Relaxed)
    }

    /// Number of frame-number overflows the controller has reported.
    pub fn frame_number_overflows(&self) -> u32 {
        self.frame_number_overflows.load(Ordering::Relaxed)
    }

    /// Number of transfer descriptors currently tracked for in-progress
    /// requests.
    pub fn outstanding_transfers(&self) -> usize {
        self.pending.lock().len()
    }

    /// True while the timeout list is ordered by expiry; meant for
    /// integration tests and debug assertions.
    pub fn timeout_list_is_sorted(&self) -> bool {
        self.timeouts.lock().is_sorted()
    }

    /// Arms the endpoint's force-toggle override: the next transfer that
    /// would take its data toggle from the ED's toggle carry instead
    /// carries the given PID explicitly. Cleared after one use.
    ///
    /// Class drivers use this after CLEAR_FEATURE(ENDPOINT_HALT), which
    /// resets the device-side toggle to DATA0 while the controller-side
    /// carry keeps whatever the last transfer left.
    ///
    /// Returns false if no such endpoint exists.
    pub async fn force_endpoint_toggle(
        &self,
        address: u8,
        endpoint_number: u8,
        direction: EndpointDirection,
        data1: bool,
    ) -> bool {
        let mut state = self.state.lock().await;
        let endpoint = state
            .devices
            .get_mut(address)
            .and_then(|device| device.endpoint_mut(endpoint_number, Some(direction)));
        match endpoint {
            Some(endpoint) => {
                endpoint.queue.set_force_toggle(data1);
                true
            }
            None => false,
        }
    }

    /// Whether the controller has halted the given endpoint.
    pub async fn endpoint_is_halted(
        &self,
        address: u8,
        endpoint_number: u8,
        direction: Option<EndpointDirection>,
    ) -> Option<bool> {
        let mut state = self.state.lock().await;
        let device = state.devices.get_mut(address)?;
        let endpoint = device.endpoint_mut(endpoint_number, direction)?;
        Some(endpoint.queue.is_halted().await)
    }

    /// Number of transfer descriptors currently chained on the given
    /// endpoint.
    pub async fn endpoint_queued_transfers(
        &self,
        address: u8,
        endpoint_number: u8,
        direction: Option<EndpointDirection>,
    ) -> Option<usize> {
        let mut state = self.state.lock().await;
        let device = state.devices.get_mut(address)?;
        let endpoint = device.endpoint_mut(endpoint_number, direction)?;
        Some(endpoint.queue.num_queued())
    }

    /// Number of interrupt endpoints the controller walks in the given
    /// frame; the periodic tree's bandwidth-sharing contract.
    pub async fn periodic_frame_load(&self, frame: u32) -> usize {
        let state = self.state.lock().await;
        state.schedule.interrupt_load(frame)
    }

    async fn reg_read(&self, offset: u64) -> u32 {
        unsafe {
            let mut out = [0];
            self.hardware_access
                .read_memory_u32_le(self.regs_loc + offset, &mut out)
                .await;
            out[0]
        }
    }

    async fn reg_write(&self, offset: u64, value: u32) {
        unsafe {
            self.hardware_access
                .write_memory_u32_le(self.regs_loc + offset, &[value])
                .await;
        }
    }
}

/// Error that can happen while enumerating a freshly connected device.
#[derive(Debug, derive_more::Display)]
pub enum EnumerationError {
    /// The port never reported its reset as complete.
    #[display(fmt = "port reset did not complete")]
    PortResetFailed,
    /// The device returned a descriptor that doesn't parse.
    #[display(fmt = "device returned an invalid descriptor")]
    BadDescriptor,
    /// All 127 bus addresses are taken.
    #[display(fmt = "no free bus address")]
    NoFreeAddresses,
    /// The device was torn down (disconnected) mid-enumeration.
    #[display(fmt = "device vanished during enumeration")]
    DeviceVanished,
    /// A control request to the device failed.
    #[display(fmt = "{}", _0)]
    Request(RequestError),
    /// A descriptor or buffer allocation failed.
    #[display(fmt = "out of DMA-capable memory")]
    OutOfDmaMemory,
}

impl From<RequestError> for EnumerationError {
    fn from(err: RequestError) -> EnumerationError {
        EnumerationError::Request(err)
    }
}

impl From<OutOfDmaMemory> for EnumerationError {
    fn from(_: OutOfDmaMemory) -> EnumerationError {
        EnumerationError::OutOfDmaMemory
    }
}
