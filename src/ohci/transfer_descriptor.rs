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

//! Transfer descriptor (TD) management.
//!
//! A general transfer descriptor is a 16-byte, 16-byte-aligned structure
//! describing one transfer with an endpoint; the isochronous variant is 32
//! bytes and carries an eight-entry packet status word table. See sections
//! 4.3.1 and 4.3.2 of the specs.
//!
//! The driver writes a descriptor once, links it into an endpoint's chain,
//! and doesn't touch it again until the controller retires it onto the done
//! queue. At that point the controller has written the condition code and
//! updated the current buffer pointer, and the descriptor can be read back
//! with [`read_retired`].

use crate::{Buffer32, HwAccessRef, OutOfDmaMemory};

use core::{alloc::Layout, num::NonZeroU32};

/// Delay-interrupt value meaning "do not generate an interrupt for this
/// descriptor".
pub const NO_INTERRUPT: u8 = 7;

const TRANSFER_DESCRIPTOR_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(16, 16) };
const ISO_TRANSFER_DESCRIPTOR_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(32, 32) };

/// Completion status of a transfer, as reported by the controller in the
/// condition code field of a retired transfer descriptor.
///
/// [`CompletionCode::Expired`] is never produced by the hardware; it is the
/// driver-side code delivered when a request's timeout fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CompletionCode {
    /// The transfer completed without error.
    #[display(fmt = "no error")]
    NoError,
    /// CRC mismatch on the wire.
    #[display(fmt = "CRC error")]
    Crc,
    /// Bit stuffing violation on the wire.
    #[display(fmt = "bit stuffing error")]
    BitStuffing,
    /// The data toggle PID didn't match the expected toggle.
    #[display(fmt = "data toggle mismatch")]
    DataToggleMismatch,
    /// The endpoint returned a STALL PID. The controller-side halt is
    /// cleared by the driver's recovery, but un-stalling the device side
    /// requires the class driver to issue CLEAR_FEATURE(ENDPOINT_HALT).
    #[display(fmt = "endpoint stalled")]
    Stall,
    /// The device didn't respond to the token.
    #[display(fmt = "device not responding")]
    DeviceNotResponding,
    /// Check bits of the received PID failed.
    #[display(fmt = "PID check failure")]
    PidCheckFailure,
    /// A PID was received that wasn't valid in context.
    #[display(fmt = "unexpected PID")]
    UnexpectedPid,
    /// The endpoint returned more data than fits the descriptor's buffer.
    #[display(fmt = "data overrun")]
    DataOverrun,
    /// The endpoint returned less data than expected and buffer rounding
    /// was not allowed.
    #[display(fmt = "data underrun")]
    DataUnderrun,
    /// The controller couldn't write received data to memory fast enough.
    #[display(fmt = "buffer overrun")]
    BufferOverrun,
    /// The controller couldn't read data to transmit fast enough.
    #[display(fmt = "buffer underrun")]
    BufferUnderrun,
    /// The controller never accessed the descriptor, typically because a
    /// preceding descriptor on the same endpoint halted the queue.
    #[display(fmt = "not accessed")]
    NotAccessed,
    /// The driver-side timeout fired before the transfer completed.
    #[display(fmt = "expired")]
    Expired,
}

impl CompletionCode {
    /// Converts a condition code field read back from a retired descriptor.
    pub fn from_hw(value: u32) -> CompletionCode {
        match value & 0xf {
            0 => CompletionCode::NoError,
            1 => CompletionCode::Crc,
            2 => CompletionCode::BitStuffing,
            3 => CompletionCode::DataToggleMismatch,
            4 => CompletionCode::Stall,
            5 => CompletionCode::DeviceNotResponding,
            6 => CompletionCode::PidCheckFailure,
            7 => CompletionCode::UnexpectedPid,
            8 => CompletionCode::DataOverrun,
            9 => CompletionCode::DataUnderrun,
            12 => CompletionCode::BufferOverrun,
            13 => CompletionCode::BufferUnderrun,
            // 10 and 11 are reserved; 14 and 15 both mean "not accessed".
            _ => CompletionCode::NotAccessed,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, CompletionCode::NoError)
    }
}

/// Direction PID of a general transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionPid {
    Setup,
    Out,
    In,
}

/// Data toggle source of a general transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataToggle {
    /// Take the toggle from the endpoint descriptor's toggle carry.
    Auto,
    /// Force DATA0.
    Data0,
    /// Force DATA1.
    Data1,
}

/// Everything needed to fill in a general transfer descriptor.
#[derive(Debug, Clone)]
pub struct TdConfig {
    /// If true, a received packet smaller than the buffer is accepted and
    /// retires the descriptor without error.
    pub buffer_rounding: bool,
    pub direction: DirectionPid,
    /// Number of frames the controller may wait before signaling the
    /// completion, or [`NO_INTERRUPT`].
    pub delay_interrupt: u8,
    pub toggle: DataToggle,
    /// Physical address of the first byte of the data buffer, or 0 for a
    /// zero-length packet.
    pub current_buffer: u32,
    /// Physical address of the last byte of the data buffer (inclusive), or
    /// 0 for a zero-length packet. The buffer may cross at most one 4 kiB
    /// page boundary.
    pub buffer_end: u32,
}

impl TdConfig {
    fn encode_control(&self) -> u32 {
        assert!(self.delay_interrupt <= NO_INTERRUPT);

        let direction = match self.direction {
            DirectionPid::Setup => 0b00,
            DirectionPid::Out => 0b01,
            DirectionPid::In => 0b10,
        };

        let toggle = match self.toggle {
            DataToggle::Auto => 0b00,
            DataToggle::Data0 => 0b10,
            DataToggle::Data1 => 0b11,
        };

        // The condition code is initialized to "not accessed"; the
        // controller overwrites it on retirement.
        (if self.buffer_rounding { 1 } else { 0 }) << 18
            | direction << 19
            | u32::from(self.delay_interrupt) << 21
            | toggle << 24
            | 0xf << 28
    }
}

/// A single general transfer descriptor in physical memory.
pub struct TransferDescriptor<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Hardware abstraction layer.
    hardware_access: TAcc,
    /// Physical memory buffer containing the transfer descriptor.
    buffer: Buffer32<TAcc>,
}

impl<TAcc> TransferDescriptor<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates a new, zeroed transfer descriptor.
    ///
    /// A blank descriptor is what an endpoint queue uses as its dummy tail:
    /// the controller never processes the descriptor its tail pointer
    /// designates, so the contents don't matter until the slot is filled.
    pub async fn new(hardware_access: TAcc) -> Result<TransferDescriptor<TAcc>, OutOfDmaMemory> {
        let buffer = Buffer32::new(hardware_access.clone(), TRANSFER_DESCRIPTOR_LAYOUT).await?;

        unsafe {
            hardware_access
                .write_memory_u32_le(u64::from(buffer.pointer().get()), &[0, 0, 0, 0])
                .await;
        }

        Ok(TransferDescriptor {
            hardware_access,
            buffer,
        })
    }

    /// Returns the physical memory address of the descriptor.
    ///
    /// This value never changes and is valid until the
    /// [`TransferDescriptor`] is destroyed.
    pub fn pointer(&self) -> NonZeroU32 {
        self.buffer.pointer()
    }

    /// Fills in the descriptor.
    ///
    /// `next` is the physical address of the descriptor that follows this
    /// one in the endpoint's chain.
    ///
    /// # Safety
    ///
    /// Must not be called while the controller may process the descriptor,
    /// in other words only while the descriptor is at or beyond its
    /// endpoint's published tail.
    pub async unsafe fn write(&mut self, config: &TdConfig, next: u32) {
        self.hardware_access
            .write_memory_u32_le(
                u64::from(self.buffer.pointer().get()),
                &[
                    config.encode_control(),
                    config.current_buffer,
                    next,
                    config.buffer_end,
                ],
            )
            .await;
    }
}

/// Contents of a retired transfer descriptor, read back from the done
/// queue.
#[derive(Debug, Clone, Copy)]
pub struct RetiredTd {
    /// Completion status written by the controller.
    pub completion_code: CompletionCode,
    /// Final value of the current buffer pointer. 0 if the buffer was
    /// entirely used, otherwise the address of the next byte the controller
    /// would have accessed.
    pub current_buffer: u32,
    /// Physical address of the next descriptor on the done queue (the
    /// controller reuses the next-TD field to link retired descriptors).
    pub next: u32,
}

/// Reads back a retired transfer descriptor at the given physical address.
///
/// # Safety
///
/// `address` must be the physical address of a transfer descriptor that the
/// controller has retired onto the done queue.
pub async unsafe fn read_retired<TAcc>(hardware_access: &TAcc, address: u32) -> RetiredTd
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let mut words = [0; 3];
    hardware_access
        .read_memory_u32_le(u64::from(address), &mut words)
        .await;

    RetiredTd {
        completion_code: CompletionCode::from_hw(words[0] >> 28),
        current_buffer: words[1],
        next: words[2] & super::ep_descriptor::PTR_MASK,
    }
}

/// Everything needed to fill in an isochronous transfer descriptor.
///
/// Scheduling of isochronous endpoints reserves these descriptors, but the
/// driver doesn't harvest their per-packet status words; the layout is
/// provided for completeness.
#[derive(Debug, Clone)]
pub struct IsoTdConfig {
    /// Frame number of the first packet.
    pub starting_frame: u16,
    /// Number of packets described, between 1 and 8.
    pub frame_count: u8,
    pub delay_interrupt: u8,
    /// Physical page containing the first byte of the buffer.
    pub buffer_page0: u32,
    /// Physical address of the last byte of the buffer (inclusive).
    pub buffer_end: u32,
    /// Per-packet offsets within the buffer page.
    pub offsets: [u16; 8],
}

/// A single isochronous transfer descriptor in physical memory.
pub struct IsoTransferDescriptor<TAcc>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    hardware_access: TAcc,
    buffer: Buffer32<TAcc>,
}

impl<TAcc> IsoTransferDescriptor<TAcc>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    /// Allocates a new, zeroed isochronous transfer descriptor.
    pub async fn new(
        hardware_access: TAcc,
    ) -> Result<IsoTransferDescriptor<TAcc>, OutOfDmaMemory> {
        let buffer = Buffer32::new(hardware_access.clone(), ISO_TRANSFER_DESCRIPTOR_LAYOUT).await?;

        unsafe {
            hardware_access
                .write_memory_u32_le(u64::from(buffer.pointer().get()), &[0; 8])
                .await;
        }

        Ok(IsoTransferDescriptor {
            hardware_access,
            buffer,
        })
    }

    /// Returns the physical memory address of the descriptor.
    pub fn pointer(&self) -> NonZeroU32 {
        self.buffer.pointer()
    }

    /// Fills in the descriptor. Same contract as
    /// [`TransferDescriptor::write`].
    pub async unsafe fn write(&mut self, config: &IsoTdConfig, next: u32) {
        assert!(config.frame_count >= 1 && config.frame_count <= 8);
        assert!(config.delay_interrupt <= NO_INTERRUPT);

        let control = u32::from(config.starting_frame)
            | u32::from(config.delay_interrupt) << 21
            | u32::from(config.frame_count - 1) << 24
            | 0xf << 28;

        // Packet status words are initialized with the offset and the
        // "not accessed" condition code, as per section 4.3.2.3.
        let psw = |n: usize| u32::from(config.offsets[n]) | 0xe << 12;

        self.hardware_access
            .write_memory_u32_le(
                u64::from(self.buffer.pointer().get()),
                &[
                    control,
                    config.buffer_page0 & !0xfff,
                    next,
                    config.buffer_end,
                    psw(0) | psw(1) << 16,
                    psw(2) | psw(3) << 16,
                    psw(4) | psw(5) << 16,
                    psw(6) | psw(7) << 16,
                ],
            )
            .await;
    }
}
