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

//! Root hub port management.
//!
//! The root hub is exposed through the `HcRhDescriptorA/B`, `HcRhStatus`
//! and per-port `HcRhPortStatus` registers. See section 7.4 of the specs.
//! Port status registers mix read-only status bits with write-to-trigger
//! command bits at the same positions, which is why reading and commanding
//! are kept as separate operations here.

use crate::ohci::regs;
use crate::HwAccessRef;

use core::{num::NonZeroU8, time::Duration};

/// Decoded snapshot of a port's status register.
#[derive(Debug, Clone, Copy)]
pub struct PortStatus(pub u32);

impl PortStatus {
    pub fn connected(self) -> bool {
        self.0 & regs::PORT_CCS != 0
    }

    pub fn enabled(self) -> bool {
        self.0 & regs::PORT_PES != 0
    }

    pub fn suspended(self) -> bool {
        self.0 & regs::PORT_PSS != 0
    }

    pub fn powered(self) -> bool {
        self.0 & regs::PORT_PPS != 0
    }

    /// True if the attached device signaled low speed at connection.
    pub fn low_speed_attached(self) -> bool {
        self.0 & regs::PORT_LSDA != 0
    }

    pub fn connect_change(self) -> bool {
        self.0 & regs::PORT_CSC != 0
    }

    pub fn reset_change(self) -> bool {
        self.0 & regs::PORT_PRSC != 0
    }
}

fn port_status_offset(port: NonZeroU8) -> u64 {
    regs::HC_RH_PORT_STATUS_1_OFFSET + u64::from(port.get() - 1) * 4
}

/// Number of downstream ports the root hub implements.
pub async fn num_ports<TAcc>(hardware_access: &TAcc, regs_loc: u64) -> NonZeroU8
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let descriptor_a = unsafe {
        let mut out = [0];
        hardware_access
            .read_memory_u32_le(regs_loc + regs::HC_RH_DESCRIPTOR_A_OFFSET, &mut out)
            .await;
        out[0]
    };

    // The specs guarantee between 1 and 15 ports.
    NonZeroU8::new((descriptor_a & regs::RH_A_NDP_MASK) as u8)
        .unwrap_or_else(|| NonZeroU8::new(1).unwrap())
}

/// Reads the status register of the given port.
pub async fn port_status<TAcc>(hardware_access: &TAcc, regs_loc: u64, port: NonZeroU8) -> PortStatus
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    unsafe {
        let mut out = [0];
        hardware_access
            .read_memory_u32_le(regs_loc + port_status_offset(port), &mut out)
            .await;
        PortStatus(out[0])
    }
}

/// Writes command bits to the status register of the given port.
///
/// The register is of the "write to trigger" kind: bits that are 0 in
/// `value` are left untouched.
pub async fn write_port_status<TAcc>(
    hardware_access: &TAcc,
    regs_loc: u64,
    port: NonZeroU8,
    value: u32,
) where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    unsafe {
        hardware_access
            .write_memory_u32_le(regs_loc + port_status_offset(port), &[value])
            .await;
    }
}

/// Resets the given port and waits for the reset to complete.
///
/// Returns the port status read after the reset, or `None` if the
/// controller never reported the reset as finished.
pub async fn reset_port<TAcc>(
    hardware_access: &TAcc,
    regs_loc: u64,
    port: NonZeroU8,
) -> Option<PortStatus>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    write_port_status(hardware_access, regs_loc, port, regs::PORT_SET_RESET).await;

    // Port reset is specified to take on the order of 10 ms.
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if attempts >= 100 {
            return None;
        }

        let status = port_status(hardware_access, regs_loc, port).await;
        if status.reset_change() {
            // Acknowledge the change so that it doesn't read as a new
            // root hub event later.
            write_port_status(hardware_access, regs_loc, port, regs::PORT_PRSC).await;
            return Some(port_status(hardware_access, regs_loc, port).await);
        }

        hardware_access.delay(Duration::from_millis(1)).await;
    }
}

/// Powers the downstream ports, honoring the power switching mode the
/// root hub advertises, and waits for power to be good.
pub async fn power_on_ports<TAcc>(hardware_access: &TAcc, regs_loc: u64)
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let descriptor_a = unsafe {
        let mut out = [0];
        hardware_access
            .read_memory_u32_le(regs_loc + regs::HC_RH_DESCRIPTOR_A_OFFSET, &mut out)
            .await;
        out[0]
    };

    if descriptor_a & regs::RH_A_NPS != 0 {
        // Ports are always powered; nothing to switch.
        return;
    }

    if descriptor_a & regs::RH_A_PSM != 0 {
        // Per-port power switching.
        let ports = num_ports(hardware_access, regs_loc).await;
        for port in 1..=ports.get() {
            let port = NonZeroU8::new(port).unwrap();
            write_port_status(hardware_access, regs_loc, port, regs::PORT_SET_POWER).await;
        }
    } else {
        // Global power switch.
        unsafe {
            hardware_access
                .write_memory_u32_le(
                    regs_loc + regs::HC_RH_STATUS_OFFSET,
                    &[regs::RH_STATUS_LPSC],
                )
                .await;
        }
    }

    // PowerOnToPowerGoodTime is expressed in units of 2 ms.
    let potpgt = descriptor_a >> regs::RH_A_POTPGT_SHIFT;
    hardware_access
        .delay(Duration::from_millis(u64::from(potpgt) * 2))
        .await;
}
