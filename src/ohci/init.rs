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

//! OHCI initialization.
//!
//! Because of legacy compatibility, the OHCI can be in three possible
//! states when the operating system starts:
//!
//! - Used by the System Management Mode driver (SMM). The SMM driver is one
//! of the first components that starts at system initialization, and
//! redirects the legacy PS/2 I/O ports to the USB controller. If the SMM
//! driver has ownership of the OHCI controller, the `InterruptRouting` bit
//! is set in the `HcControl` register.
//!
//! - Used by the BIOS, or by a previous operating system driver. If the
//! BIOS has ownership of the OHCI controller, the `InterruptRouting` bit is
//! not set and the `HostControllerFunctionalState` is not `UsbReset`.
//!
//! - Not powered up. The `InterruptRouting` bit is not set and
//! `HostControllerFunctionalState` is `UsbReset`.
//!
//! See also section 5.1.1.3 of the specs.
//!
//! This module takes ownership of the controller, performs a software
//! reset, and hands the suspended controller over to
//! [`OhciDriver::from_suspended`](super::OhciDriver), which builds the
//! schedules and switches to the operational state.

use crate::ohci::{regs, FromSuspendedConfig, OhciDriver};
use crate::{HwAccessRef, OutOfDmaMemory};

use core::{convert::TryFrom as _, time::Duration};

/// Error that can happen during initialization.
#[derive(Debug, derive_more::Display)]
pub enum InitError {
    /// Unrecognized driver revision number.
    ///
    /// > **Note**: This probably indicates that the memory location doesn't
    /// >           correspond to an OHCI implementation, or that there is a
    /// >           bug in the physical memory access mechanism.
    #[display(fmt = "unrecognized OHCI revision: 0x{:x}", _0)]
    BadRevision(u8),
    /// A DMA allocation for the HCCA or the schedule skeleton failed.
    #[display(fmt = "out of DMA-capable memory")]
    OutOfDmaMemory,
}

impl From<OutOfDmaMemory> for InitError {
    fn from(_: OutOfDmaMemory) -> InitError {
        InitError::OutOfDmaMemory
    }
}

/// Initializes an OHCI device whose registers are memory-mapped at the
/// given location.
///
/// # Safety
///
/// `regs_loc` must be the base of the memory-mapped registers of an OHCI
/// controller that nothing else is driving.
pub async unsafe fn init_ohci_device<TAcc>(
    access: TAcc,
    regs_loc: u64,
) -> Result<OhciDriver<TAcc>, InitError>
where
    TAcc: Clone,
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    // See section 5.1.1.2. We start by checking whether the revision is one
    // we know.
    let revision = {
        let mut out = [0];
        access
            .read_memory_u32_le(regs_loc + regs::HC_REVISION_OFFSET, &mut out)
            .await;
        u8::try_from(out[0] & 0xff).unwrap()
    };
    if revision != 0x10 {
        return Err(InitError::BadRevision(revision));
    }

    // Reading the `HcControl` register to determine in which mode the
    // controller is. See section 7.1.2.
    let control = {
        let mut out = [0];
        access
            .read_memory_u32_le(regs_loc + regs::HC_CONTROL_OFFSET, &mut out)
            .await;
        out[0]
    };

    if control & regs::CTRL_IR != 0 {
        // Owned by the SMM driver. See section 5.1.1.3.3.
        // We set the `OwnershipChangeRequest` flag of the command register
        // to ask the SMM to relinquish the controller, then poll until the
        // routing bit falls.
        log::debug!("requesting OHCI ownership from the SMM driver");
        access
            .write_memory_u32_le(regs_loc + regs::HC_COMMAND_STATUS_OFFSET, &[regs::CMD_OCR])
            .await;

        loop {
            let mut out = [0];
            access
                .read_memory_u32_le(regs_loc + regs::HC_CONTROL_OFFSET, &mut out)
                .await;
            if out[0] & regs::CTRL_IR == 0 {
                break;
            }

            // Sleep a bit in order to not spinloop.
            access.delay(Duration::from_micros(500)).await;
        }
    } else {
        match control & regs::CTRL_HCFS_MASK {
            regs::CTRL_HCFS_RESET => {
                // Controller is in `UsbReset` mode and isn't initialized
                // yet. See section 5.1.1.3.5. Since we don't know for how
                // long the controller has been in this state, we wait a bit
                // in order to be sure that devices know that a reset has
                // happened.
                access.delay(Duration::from_millis(50)).await;
            }
            regs::CTRL_HCFS_OPERATIONAL => {
                // Controller was in use by the BIOS or a previous driver
                // and is running. See section 5.1.1.3.4. Nothing more to do
                // here; we directly move on to resetting the controller.
            }
            _ => {
                // Controller is suspended or resuming, and was in use by
                // the BIOS or a previous driver. We switch to `UsbResume`
                // mode, then wait to be sure that devices know about the
                // resuming.
                let value = (control & !(regs::CTRL_PLE | regs::CTRL_IE | regs::CTRL_CLE
                    | regs::CTRL_BLE | regs::CTRL_HCFS_MASK))
                    | regs::CTRL_HCFS_RESUME;
                access
                    .write_memory_u32_le(regs_loc + regs::HC_CONTROL_OFFSET, &[value])
                    .await;
                access.delay(Duration::from_millis(50)).await;
            }
        }
    }

    // See section 5.1.1.4 for the rest of the body.

    // We now save the value of the `HcFmInterval` register. It is sometimes
    // set by the firmware at system initialization. The reset we perform
    // below will erase its value, and we need to restore it afterwards.
    let fm_interval_value = {
        let mut out = [0];
        access
            .read_memory_u32_le(regs_loc + regs::HC_FM_INTERVAL_OFFSET, &mut out)
            .await;
        out[0]
    };

    // We write 1 to the `HostControllerReset` flag of the command register
    // to reset the controller. This register is a "write to set" type of
    // register, so we don't actually overwrite anything by writing just one
    // bit.
    access
        .write_memory_u32_le(regs_loc + regs::HC_COMMAND_STATUS_OFFSET, &[regs::CMD_HCR])
        .await;

    // The reset lasts for a maximum of 10µs, as described in the specs.
    // Afterwards the controller is in `UsbSuspend` and we have at most 2 ms
    // to make it operational, which `from_suspended` takes care of.
    access.delay(Duration::from_micros(10)).await;

    let config = FromSuspendedConfig {
        registers_location: regs_loc,
        fm_interval_value,
    };

    Ok(OhciDriver::from_suspended(access, config).await?)
}
