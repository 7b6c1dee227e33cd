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

//! Test harness: an in-memory implementation of [`HwAccessRef`] backing a
//! small behavioral model of an OHCI controller and of USB devices plugged
//! into its root hub ports.
//!
//! The model is frame-stepped: nothing happens until a test calls
//! [`MockHw::run_frame`], which walks the schedule lists exactly the way
//! the silicon would (skip and halt bits, head/tail ownership, toggle
//! carry, done-queue prepending, write-back of the done head) and advances
//! the frame number by one. Tests drive the controller and the driver in
//! lockstep with [`run_with`].

#![allow(dead_code)]

use usb_ohci::{HwAccessRef, OhciDriver, OutOfDmaMemory};

use futures::future::{ready, Ready};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::rc::Rc;
use std::task::Poll;

/// Where the mock maps the controller's register file.
pub const REGS_BASE: u64 = 0xfff0_0000;

const ARENA_BASE: u64 = 0x0010_0000;
const ARENA_SIZE: usize = 4 * 1024 * 1024;

const NUM_PORTS: usize = 2;

// Register offsets, mirrored from the driver's constants.
const HC_CONTROL: usize = 0x04;
const HC_COMMAND_STATUS: usize = 0x08;
const HC_INTERRUPT_STATUS: usize = 0x0c;
const HC_INTERRUPT_ENABLE: usize = 0x10;
const HC_HCCA: usize = 0x18;
const HC_CONTROL_HEAD_ED: usize = 0x20;
const HC_BULK_HEAD_ED: usize = 0x28;
const HC_FM_NUMBER: usize = 0x3c;
const HC_RH_DESCRIPTOR_A: usize = 0x48;
const HC_RH_PORT_STATUS_1: usize = 0x54;

const INT_WDH: u32 = 1 << 1;
const INT_UE: u32 = 1 << 4;
const INT_RHSC: u32 = 1 << 6;

const CC_NO_ERROR: u32 = 0;
const CC_TOGGLE_MISMATCH: u32 = 3;
const CC_STALL: u32 = 4;
const CC_DEVICE_NOT_RESPONDING: u32 = 5;
const CC_DATA_UNDERRUN: u32 = 9;

/// A record of one transfer descriptor retirement, for assertions about
/// what the driver actually queued.
#[derive(Debug, Clone, Copy)]
pub struct RetirementRecord {
    pub address: u32,
    /// Function address the owning endpoint descriptor carried.
    pub function: u8,
    pub endpoint: u8,
    /// Direction PID bits of the descriptor (0 setup, 1 out, 2 in).
    pub pid: u32,
    /// Delay-interrupt field of the descriptor.
    pub delay_interrupt: u8,
    /// Raw toggle field bits (bit 1 = forced, bit 0 = forced value).
    pub toggle_field: u32,
    /// Condition code the model retired the descriptor with.
    pub condition_code: u32,
    /// Bytes moved by the descriptor.
    pub bytes: usize,
}

/// One USB device hanging off a root hub port.
pub struct MockDevice {
    pub address: u8,
    staged_address: Option<u8>,
    pub low_speed: bool,
    pub device_descriptor: [u8; 18],
    pub config_descriptor: Vec<u8>,
    pub strings: Vec<String>,
    /// When true, the device never answers; its descriptors just sit on
    /// the endpoint forever.
    pub hang: bool,
    pub configured: Option<u8>,
    /// Setup packets received, with the address the device had when each
    /// arrived.
    pub setup_log: Vec<(u8, [u8; 8])>,
    ep0_pending_in: Vec<u8>,
    ep0_stall_next: bool,
    endpoints: Vec<((u8, bool), MockEndpoint)>,
}

/// Per-endpoint device-side state.
#[derive(Default)]
pub struct MockEndpoint {
    pub toggle: bool,
    /// Bytes the host will read from this endpoint.
    pub in_data: VecDeque<u8>,
    /// Bytes the host has written to this endpoint.
    pub out_data: Vec<u8>,
    /// Stall the next token addressed to this endpoint.
    pub stall_next: bool,
    /// Stall once the IN data runs dry instead of sending a short packet.
    pub stall_when_empty: bool,
}

impl MockDevice {
    pub fn new(class: u8, sub_class: u8, protocol: u8, max_packet_size0: u8) -> MockDevice {
        let mut descriptor = [0u8; 18];
        descriptor[0] = 18;
        descriptor[1] = 1; // DEVICE
        descriptor[2] = 0x10; // USB 1.1
        descriptor[3] = 0x01;
        descriptor[4] = class;
        descriptor[5] = sub_class;
        descriptor[6] = protocol;
        descriptor[7] = max_packet_size0;
        descriptor[8..10].copy_from_slice(&0x1234u16.to_le_bytes());
        descriptor[10..12].copy_from_slice(&0x5678u16.to_le_bytes());
        descriptor[15] = 2; // product string index
        descriptor[17] = 1; // one configuration

        MockDevice {
            address: 0,
            staged_address: None,
            low_speed: false,
            device_descriptor: descriptor,
            config_descriptor: Vec::new(),
            strings: vec![String::new(), String::from("Mock Corp"), String::from("Mock Device")],
            hang: false,
            configured: None,
            setup_log: Vec::new(),
            ep0_pending_in: Vec::new(),
            ep0_stall_next: false,
            endpoints: Vec::new(),
        }
    }

    /// Declares an endpoint in the configuration descriptor and creates
    /// the matching device-side state. `attributes` is the standard
    /// bmAttributes value (2 = bulk, 3 = interrupt).
    pub fn with_endpoint(
        mut self,
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> MockDevice {
        let is_in = address & 0x80 != 0;
        self.endpoints
            .push(((address & 0xf, is_in), MockEndpoint::default()));

        let mut endpoint_bytes = vec![7, 5, address, attributes];
        endpoint_bytes.extend_from_slice(&max_packet_size.to_le_bytes());
        endpoint_bytes.push(interval);
        self.extra_config_bytes(endpoint_bytes)
    }

    fn extra_config_bytes(mut self, bytes: Vec<u8>) -> MockDevice {
        self.config_descriptor.extend_from_slice(&bytes);
        self
    }

    /// Builds the final configuration descriptor bundle. Must be called
    /// after all `with_endpoint` calls.
    pub fn finish(mut self, interface_class: u8, interface_sub_class: u8) -> MockDevice {
        let num_endpoints = self.endpoints.len() as u8;
        let endpoint_bytes = std::mem::replace(&mut self.config_descriptor, Vec::new());

        let mut bundle = Vec::new();
        bundle.extend_from_slice(&[9, 2, 0, 0, 1, 1, 0, 0x80, 0x32]);
        bundle.extend_from_slice(&[
            9,
            4,
            0,
            0,
            num_endpoints,
            interface_class,
            interface_sub_class,
            0,
            0,
        ]);
        bundle.extend_from_slice(&endpoint_bytes);
        let total = (bundle.len() as u16).to_le_bytes();
        bundle[2] = total[0];
        bundle[3] = total[1];

        self.config_descriptor = bundle;
        self
    }

    pub fn endpoint_mut(&mut self, number: u8, is_in: bool) -> &mut MockEndpoint {
        &mut self
            .endpoints
            .iter_mut()
            .find(|(key, _)| *key == (number, is_in))
            .expect("no such mock endpoint")
            .1
    }

    fn reset(&mut self) {
        self.address = 0;
        self.staged_address = None;
        self.configured = None;
        self.ep0_pending_in.clear();
        self.ep0_stall_next = false;
        for (_, endpoint) in &mut self.endpoints {
            endpoint.toggle = false;
        }
    }

    fn string_descriptor_bytes(&self, index: usize) -> Vec<u8> {
        if index == 0 {
            return vec![4, 3, 0x09, 0x04];
        }
        let text = self.strings.get(index).cloned().unwrap_or_default();
        let mut bytes = vec![0, 3];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes[0] = bytes.len() as u8;
        bytes
    }

    fn on_setup(&mut self, packet: [u8; 8]) -> Result<(), u32> {
        self.setup_log.push((self.address, packet));
        self.ep0_pending_in.clear();

        if self.ep0_stall_next {
            self.ep0_stall_next = false;
            return Err(CC_STALL);
        }

        let request_type = packet[0];
        let request = packet[1];
        let value = u16::from_le_bytes([packet[2], packet[3]]);
        let length = u16::from_le_bytes([packet[6], packet[7]]);

        match (request_type & 0x7f, request) {
            (0x00, 0x05) => {
                // SET_ADDRESS takes effect after the status stage.
                self.staged_address = Some(value as u8);
            }
            (0x00, 0x06) => {
                let payload = match (value >> 8) as u8 {
                    1 => self.device_descriptor.to_vec(),
                    2 => self.config_descriptor.clone(),
                    3 => self.string_descriptor_bytes((value & 0xff) as usize),
                    _ => return Err(CC_STALL),
                };
                let len = payload.len().min(usize::from(length));
                self.ep0_pending_in = payload[..len].to_vec();
            }
            (0x00, 0x09) => {
                self.configured = Some(value as u8);
            }
            _ => {}
        }

        Ok(())
    }

    fn ep0_in(&mut self, capacity: usize) -> Vec<u8> {
        if capacity == 0 {
            // Status stage of a host-to-device request.
            if let Some(address) = self.staged_address.take() {
                self.address = address;
            }
            return Vec::new();
        }
        let n = capacity.min(self.ep0_pending_in.len());
        self.ep0_pending_in.drain(..n).collect()
    }

    fn data_in(&mut self, number: u8, toggle: bool, capacity: usize) -> Result<Vec<u8>, u32> {
        let endpoint = &mut self
            .endpoints
            .iter_mut()
            .find(|(key, _)| *key == (number, true))
            .ok_or(CC_STALL)?
            .1;
        if endpoint.stall_next {
            endpoint.stall_next = false;
            return Err(CC_STALL);
        }
        if endpoint.stall_when_empty && endpoint.in_data.is_empty() {
            return Err(CC_STALL);
        }
        if toggle != endpoint.toggle {
            return Err(CC_TOGGLE_MISMATCH);
        }
        endpoint.toggle = !endpoint.toggle;
        let n = capacity.min(endpoint.in_data.len());
        Ok(endpoint.in_data.drain(..n).collect())
    }

    fn data_out(&mut self, number: u8, toggle: bool, bytes: &[u8]) -> Result<(), u32> {
        if number == 0 {
            // Status stage of a device-to-host control transfer.
            return Ok(());
        }
        let endpoint = &mut self
            .endpoints
            .iter_mut()
            .find(|(key, _)| *key == (number, false))
            .ok_or(CC_STALL)?
            .1;
        if endpoint.stall_next {
            endpoint.stall_next = false;
            return Err(CC_STALL);
        }
        if toggle != endpoint.toggle {
            return Err(CC_TOGGLE_MISMATCH);
        }
        endpoint.toggle = !endpoint.toggle;
        endpoint.out_data.extend_from_slice(bytes);
        Ok(())
    }
}

struct MockPort {
    device: Option<MockDevice>,
    enabled: bool,
    connect_change: bool,
    reset_change: bool,
}

struct Mock {
    memory: Vec<u8>,
    next_alloc: usize,
    allocs: u64,
    deallocs: u64,
    fail_allocs: bool,
    registers: [u32; 64],
    ports: Vec<MockPort>,
    frame: u32,
    /// Done queue accumulated since the last write-back, most recent first.
    pending_done_head: u32,
    retirements: Vec<RetirementRecord>,
}

/// Clonable handle implementing [`HwAccessRef`].
#[derive(Clone)]
pub struct MockHw {
    inner: Rc<RefCell<Mock>>,
}

impl MockHw {
    pub fn new() -> MockHw {
        let ports = (0..NUM_PORTS)
            .map(|_| MockPort {
                device: None,
                enabled: false,
                connect_change: false,
                reset_change: false,
            })
            .collect();

        MockHw {
            inner: Rc::new(RefCell::new(Mock {
                memory: vec![0; ARENA_SIZE],
                next_alloc: 0,
                allocs: 0,
                deallocs: 0,
                fail_allocs: false,
                registers: [0; 64],
                ports,
                frame: 0,
                pending_done_head: 0,
                retirements: Vec::new(),
            })),
        }
    }

    /// Plugs a device into a port (1-based) and raises the root hub
    /// status change interrupt.
    pub fn connect_device(&self, port: usize, device: MockDevice) {
        let mut mock = self.inner.borrow_mut();
        let slot = &mut mock.ports[port - 1];
        slot.device = Some(device);
        slot.enabled = false;
        slot.connect_change = true;
        mock.registers[HC_INTERRUPT_STATUS / 4] |= INT_RHSC;
    }

    /// Unplugs whatever is in the port and raises the status change.
    pub fn disconnect_device(&self, port: usize) -> Option<MockDevice> {
        let mut mock = self.inner.borrow_mut();
        let slot = &mut mock.ports[port - 1];
        let device = slot.device.take();
        slot.enabled = false;
        slot.connect_change = true;
        mock.registers[HC_INTERRUPT_STATUS / 4] |= INT_RHSC;
        device
    }

    /// Runs a closure against the device on the given port.
    pub fn with_device<R>(&self, port: usize, f: impl FnOnce(&mut MockDevice) -> R) -> R {
        let mut mock = self.inner.borrow_mut();
        f(mock.ports[port - 1]
            .device
            .as_mut()
            .expect("no device on port"))
    }

    /// Raises the unrecoverable error interrupt.
    pub fn raise_unrecoverable_error(&self) {
        self.inner.borrow_mut().registers[HC_INTERRUPT_STATUS / 4] |= INT_UE;
    }

    /// Makes every subsequent DMA allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.inner.borrow_mut().fail_allocs = fail;
    }

    /// Wastes arena space so the next allocation lands just before a 4 kiB
    /// boundary.
    pub fn pad_allocator_to_page_end(&self, bytes_before_boundary: usize) {
        let mut mock = self.inner.borrow_mut();
        let position = (ARENA_BASE as usize + mock.next_alloc) % 4096;
        let target = 4096 - bytes_before_boundary;
        mock.next_alloc += (4096 + target - position) % 4096;
    }

    /// (allocations, deallocations) performed so far.
    pub fn alloc_balance(&self) -> (u64, u64) {
        let mock = self.inner.borrow();
        (mock.allocs, mock.deallocs)
    }

    pub fn current_frame(&self) -> u32 {
        self.inner.borrow().frame
    }

    /// Records of every transfer descriptor the model has retired.
    pub fn retirements(&self) -> Vec<RetirementRecord> {
        self.inner.borrow().retirements.clone()
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        self.inner.borrow_mut().read_u32(address)
    }

    /// Follows an endpoint descriptor chain through physical memory.
    pub fn walk_ed_list(&self, head: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut address = head;
        while address != 0 && out.len() < 64 {
            out.push(address);
            address = self.read_u32(u64::from(address) + 12) & !0xf;
        }
        out
    }

    pub fn ed_words(&self, ed: u32) -> [u32; 4] {
        let mut out = [0; 4];
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read_u32(u64::from(ed) + i as u64 * 4);
        }
        out
    }

    /// Endpoint descriptors on the control list (excluding the dummy
    /// head), as (function address, endpoint number) pairs.
    pub fn control_list_functions(&self) -> Vec<(u8, u8)> {
        let head = self.read_u32(REGS_BASE + HC_CONTROL_HEAD_ED as u64);
        self.walk_ed_list(head)
            .into_iter()
            .skip(1)
            .map(|ed| {
                let w0 = self.read_u32(u64::from(ed));
                ((w0 & 0x7f) as u8, ((w0 >> 7) & 0xf) as u8)
            })
            .collect()
    }

    /// Advances the model by one frame: walks the lists the way the
    /// controller would, then performs the frame-number and done-queue
    /// write-backs.
    pub fn run_frame(&self) {
        self.inner.borrow_mut().run_frame();
    }

    pub fn run_frames(&self, n: usize) {
        for _ in 0..n {
            self.run_frame();
        }
    }
}

impl Mock {
    fn mem_index(&self, address: u64) -> usize {
        let offset = address
            .checked_sub(ARENA_BASE)
            .expect("access below the DMA arena");
        assert!((offset as usize) < ARENA_SIZE, "access beyond the DMA arena");
        offset as usize
    }

    fn read_u32(&mut self, address: u64) -> u32 {
        if address >= REGS_BASE {
            return self.register_read(((address - REGS_BASE) / 4) as usize);
        }
        let idx = self.mem_index(address);
        u32::from_le_bytes([
            self.memory[idx],
            self.memory[idx + 1],
            self.memory[idx + 2],
            self.memory[idx + 3],
        ])
    }

    fn write_u32(&mut self, address: u64, value: u32) {
        if address >= REGS_BASE {
            self.register_write(((address - REGS_BASE) / 4) as usize, value);
            return;
        }
        let idx = self.mem_index(address);
        self.memory[idx..idx + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_bytes(&mut self, address: u64, dest: &mut [u8]) {
        let idx = self.mem_index(address);
        dest.copy_from_slice(&self.memory[idx..idx + dest.len()]);
    }

    fn write_bytes(&mut self, address: u64, data: &[u8]) {
        let idx = self.mem_index(address);
        self.memory[idx..idx + data.len()].copy_from_slice(data);
    }

    fn register_read(&mut self, index: usize) -> u32 {
        match index * 4 {
            0x00 => 0x10, // HcRevision: OHCI 1.0
            HC_FM_NUMBER => self.frame & 0xffff,
            HC_RH_DESCRIPTOR_A => {
                // Two ports, no power switching.
                NUM_PORTS as u32 | (1 << 9)
            }
            offset if offset >= HC_RH_PORT_STATUS_1
                && offset < HC_RH_PORT_STATUS_1 + 4 * NUM_PORTS =>
            {
                self.port_status((offset - HC_RH_PORT_STATUS_1) / 4)
            }
            _ => self.registers[index],
        }
    }

    fn register_write(&mut self, index: usize, value: u32) {
        match index * 4 {
            HC_COMMAND_STATUS => {
                if value & 1 != 0 {
                    // Host controller reset: back to the suspended state
                    // with default frame timing.
                    self.registers[HC_CONTROL / 4] = 0b11 << 6;
                    self.registers[0x34 / 4] = 0x2edf;
                    self.registers[HC_HCCA / 4] = 0;
                    self.registers[HC_CONTROL_HEAD_ED / 4] = 0;
                    self.registers[HC_BULK_HEAD_ED / 4] = 0;
                }
                // CLF/BLF accumulate; the model clears them when it scans.
                self.registers[index] |= value & !1;
            }
            HC_INTERRUPT_STATUS => {
                self.registers[index] &= !value;
            }
            HC_INTERRUPT_ENABLE => {
                self.registers[HC_INTERRUPT_ENABLE / 4] |= value;
            }
            0x14 => {
                self.registers[HC_INTERRUPT_ENABLE / 4] &= !value;
            }
            HC_HCCA => {
                // The low eight bits are hardwired to zero, which is what
                // the driver's alignment probe relies on.
                self.registers[index] = value & !0xff;
            }
            offset if offset >= HC_RH_PORT_STATUS_1
                && offset < HC_RH_PORT_STATUS_1 + 4 * NUM_PORTS =>
            {
                self.port_command((offset - HC_RH_PORT_STATUS_1) / 4, value);
            }
            _ => {
                self.registers[index] = value;
            }
        }
    }

    fn port_status(&mut self, port: usize) -> u32 {
        let port = &self.ports[port];
        let mut status = 1 << 8; // always powered (no switching)
        if let Some(device) = &port.device {
            status |= 1 << 0;
            if device.low_speed {
                status |= 1 << 9;
            }
        }
        if port.enabled {
            status |= 1 << 1;
        }
        if port.connect_change {
            status |= 1 << 16;
        }
        if port.reset_change {
            status |= 1 << 20;
        }
        status
    }

    fn port_command(&mut self, port: usize, value: u32) {
        let port = &mut self.ports[port];
        if value & (1 << 4) != 0 {
            // Set port reset: completes instantly in the model.
            if let Some(device) = &mut port.device {
                device.reset();
                port.enabled = true;
            }
            port.reset_change = true;
        }
        if value & (1 << 1) != 0 && port.device.is_some() {
            port.enabled = true;
        }
        if value & (1 << 0) != 0 {
            port.enabled = false;
        }
        if value & (1 << 16) != 0 {
            port.connect_change = false;
        }
        if value & (1 << 20) != 0 {
            port.reset_change = false;
        }
    }

    fn run_frame(&mut self) {
        let control = self.registers[HC_CONTROL / 4];
        let operational = control & (0b11 << 6) == 0b10 << 6;

        if operational {
            // Control list.
            if control & (1 << 4) != 0 {
                self.registers[HC_COMMAND_STATUS / 4] &= !(1 << 1);
                let head = self.registers[HC_CONTROL_HEAD_ED / 4];
                self.walk_list(head, false);
            }
            // Bulk list.
            if control & (1 << 5) != 0 {
                self.registers[HC_COMMAND_STATUS / 4] &= !(1 << 2);
                let head = self.registers[HC_BULK_HEAD_ED / 4];
                self.walk_list(head, false);
            }
            // Periodic list for this frame.
            if control & (1 << 2) != 0 {
                let hcca = self.registers[HC_HCCA / 4];
                if hcca != 0 {
                    let slot = self.frame & 31;
                    let head = self.read_u32(u64::from(hcca) + u64::from(slot) * 4);
                    self.walk_list(head, true);
                }
            }
        }

        self.frame = (self.frame + 1) & 0xffff;

        let hcca = self.registers[HC_HCCA / 4];
        if operational && hcca != 0 {
            let frame = self.frame;
            self.write_u32(u64::from(hcca) + 0x80, frame);

            // Write the done queue back once the previous one has been
            // consumed.
            if self.pending_done_head != 0 {
                let previous = self.read_u32(u64::from(hcca) + 0x84);
                if previous == 0 {
                    let head = self.pending_done_head;
                    self.write_u32(u64::from(hcca) + 0x84, head);
                    self.pending_done_head = 0;
                    self.registers[HC_INTERRUPT_STATUS / 4] |= INT_WDH;
                }
            }
        }
    }

    fn walk_list(&mut self, head: u32, periodic: bool) {
        let mut ed = head;
        let mut visited = 0;
        while ed != 0 && visited < 256 {
            self.service_ed(ed, periodic);
            ed = self.read_u32(u64::from(ed) + 12) & !0xf;
            visited += 1;
        }
    }

    fn service_ed(&mut self, ed: u32, periodic: bool) {
        loop {
            let w0 = self.read_u32(u64::from(ed));
            if w0 & (1 << 14) != 0 || w0 & (1 << 15) != 0 {
                // Skipped, or isochronous format (not modeled).
                return;
            }

            let tail = self.read_u32(u64::from(ed) + 4) & !0xf;
            let head_word = self.read_u32(u64::from(ed) + 8);
            if head_word & 1 != 0 {
                // Halted.
                return;
            }
            let head = head_word & !0xf;
            if head == tail {
                return;
            }

            if !self.process_td(ed, w0, head_word) {
                return;
            }

            if periodic {
                // One transfer per endpoint per frame on the periodic
                // schedule.
                return;
            }
        }
    }

    /// Processes the descriptor at the ED's head. Returns true if the
    /// endpoint may continue being serviced this frame.
    fn process_td(&mut self, ed: u32, ed_w0: u32, ed_head_word: u32) -> bool {
        let td = ed_head_word & !0xf;
        let control = self.read_u32(u64::from(td));
        let cbp = self.read_u32(u64::from(td) + 4);
        let next = self.read_u32(u64::from(td) + 8) & !0xf;
        let buffer_end = self.read_u32(u64::from(td) + 12);

        let function = (ed_w0 & 0x7f) as u8;
        let endpoint = ((ed_w0 >> 7) & 0xf) as u8;
        let ed_direction = (ed_w0 >> 11) & 0b11;
        let rounding = control & (1 << 18) != 0;
        let td_pid = (control >> 19) & 0b11;
        let delay_interrupt = ((control >> 21) & 0b111) as u8;
        let toggle_field = (control >> 24) & 0b11;

        // 0 = setup, 1 = out, 2 = in; the ED direction wins when it is
        // explicit.
        let pid = match ed_direction {
            0b01 => 1,
            0b10 => 2,
            _ => td_pid,
        };

        let toggle = if toggle_field & 0b10 != 0 {
            toggle_field & 1 != 0
        } else {
            ed_head_word & 0b10 != 0
        };

        let capacity = if cbp == 0 {
            0
        } else {
            (buffer_end - cbp + 1) as usize
        };

        // Find the addressed device.
        let port_index = self.ports.iter().position(|port| {
            port.device
                .as_ref()
                .map_or(false, |device| device.address == function && !device.hang)
        });

        let hanging = self.ports.iter().any(|port| {
            port.device
                .as_ref()
                .map_or(false, |device| device.address == function && device.hang)
        });
        if hanging {
            // The device exists but never answers; in the model the
            // descriptor simply stays on the endpoint.
            return false;
        }

        let port_index = match port_index {
            Some(index) => index,
            None => {
                self.retire(
                    ed,
                    td,
                    next,
                    toggle,
                    true,
                    CC_DEVICE_NOT_RESPONDING,
                    cbp,
                    RetirementRecord {
                        address: td,
                        function,
                        endpoint,
                        pid,
                        delay_interrupt,
                        toggle_field,
                        condition_code: CC_DEVICE_NOT_RESPONDING,
                        bytes: 0,
                    },
                );
                return false;
            }
        };

        let mut record = RetirementRecord {
            address: td,
            function,
            endpoint,
            pid,
            delay_interrupt,
            toggle_field,
            condition_code: CC_NO_ERROR,
            bytes: 0,
        };

        let result: Result<(usize, u32), u32> = match pid {
            0 => {
                // SETUP packet.
                let mut packet = [0u8; 8];
                self.read_bytes(u64::from(cbp), &mut packet);
                let device = self.ports[port_index].device.as_mut().unwrap();
                device.on_setup(packet).map(|()| (8, 0))
            }
            1 => {
                // OUT packet.
                let mut bytes = vec![0u8; capacity];
                if capacity > 0 {
                    self.read_bytes(u64::from(cbp), &mut bytes);
                }
                let device = self.ports[port_index].device.as_mut().unwrap();
                device
                    .data_out(endpoint, toggle, &bytes)
                    .map(|()| (bytes.len(), 0))
            }
            _ => {
                // IN packet.
                let device = self.ports[port_index].device.as_mut().unwrap();
                let bytes = if endpoint == 0 {
                    Ok(device.ep0_in(capacity))
                } else {
                    device.data_in(endpoint, toggle, capacity)
                };
                match bytes {
                    Err(code) => Err(code),
                    Ok(bytes) => {
                        if capacity > 0 {
                            let chunk = bytes.clone();
                            self.write_bytes(u64::from(cbp), &chunk);
                        }
                        if bytes.len() < capacity && !rounding {
                            Err(CC_DATA_UNDERRUN)
                        } else {
                            let final_cbp = if bytes.len() == capacity {
                                0
                            } else {
                                cbp + bytes.len() as u32
                            };
                            Ok((bytes.len(), final_cbp))
                        }
                    }
                }
            }
        };

        match result {
            Ok((bytes, final_cbp)) => {
                record.bytes = bytes;
                self.retire(ed, td, next, !toggle, false, CC_NO_ERROR, final_cbp, record);
                true
            }
            Err(code) => {
                record.condition_code = code;
                self.retire(ed, td, next, toggle, true, code, cbp, record);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn retire(
        &mut self,
        ed: u32,
        td: u32,
        next: u32,
        new_toggle: bool,
        halt: bool,
        condition_code: u32,
        final_cbp: u32,
        record: RetirementRecord,
    ) {
        // Write the condition code and the final buffer pointer back into
        // the descriptor.
        let control = self.read_u32(u64::from(td));
        self.write_u32(u64::from(td), (control & 0x0fff_ffff) | condition_code << 28);
        self.write_u32(u64::from(td) + 4, final_cbp);

        // Advance the endpoint's head, carrying toggle and halt.
        let mut head = next;
        if new_toggle {
            head |= 0b10;
        }
        if halt {
            head |= 0b1;
        }
        self.write_u32(u64::from(ed) + 8, head);

        // Prepend to the done queue through the descriptor's next field.
        let previous_done = self.pending_done_head;
        self.write_u32(u64::from(td) + 8, previous_done);
        self.pending_done_head = td;

        self.retirements.push(record);
    }

    fn alloc(&mut self, layout: std::alloc::Layout) -> Result<NonZeroU32, OutOfDmaMemory> {
        if self.fail_allocs {
            return Err(OutOfDmaMemory);
        }
        let align = layout.align().max(1);
        let base = ARENA_BASE as usize;
        let aligned = (base + self.next_alloc + align - 1) / align * align - base;
        if aligned + layout.size() > ARENA_SIZE {
            return Err(OutOfDmaMemory);
        }
        self.next_alloc = aligned + layout.size();
        self.allocs += 1;
        Ok(NonZeroU32::new((base + aligned) as u32).unwrap())
    }
}

unsafe impl<'a> HwAccessRef<'a> for &'a MockHw {
    type Delay = Ready<()>;
    type ReadMemFutureU8 = Ready<()>;
    type ReadMemFutureU32 = Ready<()>;
    type WriteMemFutureU8 = Ready<()>;
    type WriteMemFutureU32 = Ready<()>;
    type Alloc32 = Ready<Result<NonZeroU32, OutOfDmaMemory>>;

    unsafe fn read_memory_u8(self, address: u64, dest: &'a mut [u8]) -> Self::ReadMemFutureU8 {
        self.inner.borrow_mut().read_bytes(address, dest);
        ready(())
    }

    unsafe fn read_memory_u32_le(self, address: u64, dest: &'a mut [u32]) -> Self::ReadMemFutureU32 {
        debug_assert_eq!(address % 4, 0);
        let mut mock = self.inner.borrow_mut();
        for (i, word) in dest.iter_mut().enumerate() {
            *word = mock.read_u32(address + i as u64 * 4);
        }
        ready(())
    }

    unsafe fn write_memory_u8(self, address: u64, data: &'a [u8]) -> Self::WriteMemFutureU8 {
        self.inner.borrow_mut().write_bytes(address, data);
        ready(())
    }

    unsafe fn write_memory_u32_le(self, address: u64, data: &'a [u32]) -> Self::WriteMemFutureU32 {
        debug_assert_eq!(address % 4, 0);
        let mut mock = self.inner.borrow_mut();
        for (i, word) in data.iter().enumerate() {
            mock.write_u32(address + i as u64 * 4, *word);
        }
        ready(())
    }

    fn alloc32(self, layout: std::alloc::Layout) -> Self::Alloc32 {
        ready(self.inner.borrow_mut().alloc(layout))
    }

    unsafe fn dealloc32(self, _address: u64, _layout: std::alloc::Layout) {
        // The arena is never reused; only the balance is tracked.
        self.inner.borrow_mut().deallocs += 1;
    }

    fn delay(self, _duration: core::time::Duration) -> Self::Delay {
        // Delays complete immediately; the model only moves when a test
        // steps it.
        ready(())
    }
}

/// Initializes a driver against the mock controller.
pub fn init_driver(hw: &MockHw) -> OhciDriver<MockHw> {
    futures::executor::block_on(async {
        unsafe { usb_ohci::init_ohci_device(hw.clone(), REGS_BASE) }
            .await
            .expect("controller initialization failed")
    })
}

/// Polls `fut` to completion, stepping the controller model and the
/// driver's interrupt and worker paths between polls.
pub fn run_with<T>(
    hw: &MockHw,
    driver: &OhciDriver<MockHw>,
    fut: impl Future<Output = T>,
) -> T {
    run_inner(hw, driver, fut, true)
}

/// Like [`run_with`], but without the error and timeout workers, so tests
/// can observe the state between a failure and its recovery.
pub fn run_without_recovery<T>(
    hw: &MockHw,
    driver: &OhciDriver<MockHw>,
    fut: impl Future<Output = T>,
) -> T {
    run_inner(hw, driver, fut, false)
}

fn run_inner<T>(
    hw: &MockHw,
    driver: &OhciDriver<MockHw>,
    fut: impl Future<Output = T>,
    recovery: bool,
) -> T {
    futures::executor::block_on(async {
        futures::pin_mut!(fut);
        for _ in 0..200_000 {
            if let Poll::Ready(value) = futures::poll!(fut.as_mut()) {
                return value;
            }
            hw.run_frame();
            driver.on_interrupt().await;
            if recovery {
                driver.process_errors().await;
                driver.process_timeouts().await;
            }
        }
        panic!("the mock controller stopped making progress");
    })
}

/// Connects a device and runs the installer to completion.
pub fn enumerate(hw: &MockHw, driver: &OhciDriver<MockHw>, port: usize, device: MockDevice) {
    hw.connect_device(port, device);
    run_with(hw, driver, driver.process_root_hub_changes());
}
