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

//! Register offsets and bit definitions, as translated from the specs.
//!
//! All registers are 32 bits wide and must be accessed with aligned 32-bit
//! reads and writes. Reserved bits must be preserved with read-modify-write
//! sequences.

pub const HC_REVISION_OFFSET: u64 = 0x0;
pub const HC_CONTROL_OFFSET: u64 = 0x4;
pub const HC_COMMAND_STATUS_OFFSET: u64 = 0x8;
pub const HC_INTERRUPT_STATUS_OFFSET: u64 = 0xc;
pub const HC_INTERRUPT_ENABLE_OFFSET: u64 = 0x10;
pub const HC_INTERRUPT_DISABLE_OFFSET: u64 = 0x14;
pub const HC_HCCA_OFFSET: u64 = 0x18;
pub const HC_PERIOD_CURRENT_ED_OFFSET: u64 = 0x1c;
pub const HC_CONTROL_HEAD_ED_OFFSET: u64 = 0x20;
pub const HC_CONTROL_CURRENT_ED_OFFSET: u64 = 0x24;
pub const HC_BULK_HEAD_ED_OFFSET: u64 = 0x28;
pub const HC_BULK_CURRENT_ED_OFFSET: u64 = 0x2c;
pub const HC_DONE_HEAD_OFFSET: u64 = 0x30;
pub const HC_FM_INTERVAL_OFFSET: u64 = 0x34;
pub const HC_FM_REMAINING_OFFSET: u64 = 0x38;
pub const HC_FM_NUMBER_OFFSET: u64 = 0x3c;
pub const HC_PERIODIC_START_OFFSET: u64 = 0x40;
pub const HC_LS_THRESHOLD_OFFSET: u64 = 0x44;
pub const HC_RH_DESCRIPTOR_A_OFFSET: u64 = 0x48;
pub const HC_RH_DESCRIPTOR_B_OFFSET: u64 = 0x4c;
pub const HC_RH_STATUS_OFFSET: u64 = 0x50;
/// First of the per-port status registers, one 32-bit register per
/// downstream port: port `n` (1-based) lives at this offset plus
/// `(n - 1) * 4`.
pub const HC_RH_PORT_STATUS_1_OFFSET: u64 = 0x54;

// `HcControl` bits. See section 7.1.
pub const CTRL_CBSR_MASK: u32 = 0b11;
/// Control/bulk service ratio of one bulk ED for every four control EDs.
pub const CTRL_CBSR_1_4: u32 = 0b11;
pub const CTRL_PLE: u32 = 1 << 2;
pub const CTRL_IE: u32 = 1 << 3;
pub const CTRL_CLE: u32 = 1 << 4;
pub const CTRL_BLE: u32 = 1 << 5;
pub const CTRL_HCFS_MASK: u32 = 0b11 << 6;
pub const CTRL_HCFS_RESET: u32 = 0b00 << 6;
pub const CTRL_HCFS_RESUME: u32 = 0b01 << 6;
pub const CTRL_HCFS_OPERATIONAL: u32 = 0b10 << 6;
pub const CTRL_HCFS_SUSPEND: u32 = 0b11 << 6;
pub const CTRL_IR: u32 = 1 << 8;

// `HcCommandStatus` bits. See section 7.1.3. This register is of the
// "write to set" kind: writing 0 to a bit has no effect.
pub const CMD_HCR: u32 = 1 << 0;
pub const CMD_CLF: u32 = 1 << 1;
pub const CMD_BLF: u32 = 1 << 2;
pub const CMD_OCR: u32 = 1 << 3;

// `HcInterruptStatus`/`Enable`/`Disable` bits. See section 7.1.4.
pub const INT_SO: u32 = 1 << 0;
pub const INT_WDH: u32 = 1 << 1;
pub const INT_SF: u32 = 1 << 2;
pub const INT_RD: u32 = 1 << 3;
pub const INT_UE: u32 = 1 << 4;
pub const INT_FNO: u32 = 1 << 5;
pub const INT_RHSC: u32 = 1 << 6;
pub const INT_OC: u32 = 1 << 30;
pub const INT_MIE: u32 = 1 << 31;

// `HcRhDescriptorA` bits. See section 7.4.1.
pub const RH_A_NDP_MASK: u32 = 0xff;
pub const RH_A_PSM: u32 = 1 << 8;
pub const RH_A_NPS: u32 = 1 << 9;
pub const RH_A_POTPGT_SHIFT: u32 = 24;

// `HcRhStatus` bits. See section 7.4.3.
pub const RH_STATUS_LPSC: u32 = 1 << 16;

// `HcRhPortStatus` bits. See section 7.4.4. Several bits read as a status
// and write as a command, which is why some values appear twice.
pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PES: u32 = 1 << 1;
pub const PORT_PSS: u32 = 1 << 2;
pub const PORT_POCI: u32 = 1 << 3;
pub const PORT_PRS: u32 = 1 << 4;
pub const PORT_PPS: u32 = 1 << 8;
pub const PORT_LSDA: u32 = 1 << 9;
pub const PORT_SET_ENABLE: u32 = 1 << 1;
pub const PORT_SET_RESET: u32 = 1 << 4;
pub const PORT_SET_POWER: u32 = 1 << 8;
pub const PORT_CSC: u32 = 1 << 16;
pub const PORT_PESC: u32 = 1 << 17;
pub const PORT_PSSC: u32 = 1 << 18;
pub const PORT_OCIC: u32 = 1 << 19;
pub const PORT_PRSC: u32 = 1 << 20;

// PCI configuration space, for the embedder's probe: an OHCI function has
// this value in the programming-interface byte, its registers behind the
// memory BAR, and its IRQ in the interrupt-line register.
pub const PCI_BASE_MEMORY_OFFSET: u8 = 0x10;
pub const PCI_INTERRUPT_LINE_OFFSET: u8 = 0x3c;
pub const PCI_PROG_IF_OHCI: u8 = 0x10;

/// Frame interval in units of 12 MHz bit times, as recommended by the specs
/// for a 1 ms frame.
pub const FRAME_INTERVAL: u32 = 0x2edf;

/// Largest data packet the controller may start without overrunning the
/// frame, derived from the frame interval as per section 6.3.1.
pub const fn fs_largest_data_packet(frame_interval: u32) -> u32 {
    ((frame_interval - 210) * 6) / 7
}

/// `HcFmInterval` bit that must be toggled whenever the frame interval is
/// rewritten.
pub const FM_INTERVAL_FIT: u32 = 1 << 31;

/// Low-speed packets must not start below this number of remaining bit
/// times in the frame.
pub const LS_THRESHOLD: u32 = 0x628;
