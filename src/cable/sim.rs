//! A software cable: a chain of simulated TAPs plus an SPI NOR flash, for tests and dry runs.
//!
//! Every TAP follows the IEEE 1149.1 state machine in lockstep.  Instruction registers capture a
//! configurable pattern, IDCODE/BYPASS behave as on real parts, and any other instruction selects
//! a register whose capture value and width can be configured.  All DR scans are recorded so a
//! test can inspect exactly what reached each device.  A TAP may carry a SPI bridge that forwards
//! DR scans of one instruction to a `SimFlash`.
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::bits::{get_bit, BitWriter};
use crate::cable::Cable;
use crate::device::bridge::Framing;
use crate::error::{Error, Result};
use crate::statemachine::JtagState;

const CMD_WRSR: u8 = 0x01;
const CMD_PP: u8 = 0x02;
const CMD_READ: u8 = 0x03;
const CMD_WRDI: u8 = 0x04;
const CMD_RDSR: u8 = 0x05;
const CMD_WREN: u8 = 0x06;
const CMD_FAST_READ: u8 = 0x0b;
const CMD_SE: u8 = 0x20;
const CMD_CE_ALT: u8 = 0x60;
const CMD_RDID: u8 = 0x9f;
const CMD_CE: u8 = 0xc7;
const CMD_BE: u8 = 0xd8;
const CMD_PP4: u8 = 0x12;
const CMD_READ4: u8 = 0x13;
const CMD_SE4: u8 = 0x21;
const CMD_BE4: u8 = 0xdc;

const SR_WIP: u8 = 1 << 0;
const SR_WEL: u8 = 1 << 1;
const SR_TB: u8 = 1 << 5;

const PAGE_SIZE: usize = 256;

/// A state-changing command the flash accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlashOp {
    Erase { addr: u32, len: u32 },
    ChipErase,
    Program { addr: u32, len: u32 },
    WriteStatus(u8),
}

#[derive(Clone, Debug)]
pub struct SimFlash {
    mem: Vec<u8>,
    jedec: [u8; 3],
    status: u8,
    wel: bool,
    busy_polls: u32,
    busy_left: u32,
    cmd: Vec<u8>,
    log: Vec<FlashOp>,
}

impl SimFlash {
    /// A blank flash whose JEDEC id advertises `capacity` (a power of two)
    pub fn new(capacity: usize) -> Self {
        let size_code = capacity.trailing_zeros() as u8;
        Self {
            mem: vec![0xff; capacity],
            jedec: [0xef, 0x40, size_code],
            status: 0,
            wel: false,
            busy_polls: 2,
            busy_left: 0,
            cmd: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn with_jedec(mut self, id: [u8; 3]) -> Self {
        self.jedec = id;
        self
    }

    /// Number of status reads that report WIP after each write command
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Non-volatile status bits (block protect, TB, SRWD)
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status & !(SR_WIP | SR_WEL);
        self
    }

    pub fn with_contents(mut self, addr: usize, data: &[u8]) -> Self {
        self.mem[addr..addr + data.len()].copy_from_slice(data);
        self
    }

    /// Report WIP forever, as a dead or disconnected part would
    pub fn stuck_busy(mut self) -> Self {
        self.busy_polls = u32::MAX;
        self.busy_left = u32::MAX;
        self
    }

    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    pub fn log(&self) -> &[FlashOp] {
        &self.log
    }

    pub fn status(&self) -> u8 {
        self.status_byte()
    }

    fn status_byte(&self) -> u8 {
        let mut s = self.status;
        if self.busy_left > 0 {
            s |= SR_WIP;
        }
        if self.wel {
            s |= SR_WEL;
        }
        s
    }

    fn addr_len(op: u8) -> usize {
        match op {
            CMD_PP4 | CMD_READ4 | CMD_SE4 | CMD_BE4 => 4,
            _ => 3,
        }
    }

    fn addr(bytes: &[u8]) -> usize {
        bytes.iter().fold(0, |a, &b| a << 8 | b as usize)
    }

    fn protected(&self, addr: usize) -> bool {
        let bp = (self.status >> 2) & 7;
        if bp == 0 {
            return false;
        }
        let cap = self.mem.len();
        let size = if bp == 7 { cap } else { ((cap / 64) << (bp - 1)).min(cap) };
        if self.status & SR_TB != 0 {
            addr < size
        } else {
            addr >= cap - size
        }
    }

    pub(crate) fn begin(&mut self) {
        self.cmd.clear();
    }

    /// The byte the flash drives on MISO while the next byte comes in on MOSI
    pub(crate) fn next_out(&mut self) -> u8 {
        let n = self.cmd.len();
        match self.cmd.first().copied() {
            Some(CMD_RDSR) => {
                let s = self.status_byte();
                if self.busy_left > 0 && self.busy_left != u32::MAX {
                    self.busy_left -= 1;
                }
                s
            }
            Some(CMD_RDID) => self.jedec.get(n - 1).copied().unwrap_or(0),
            Some(op @ (CMD_READ | CMD_READ4 | CMD_FAST_READ)) if self.busy_left == 0 => {
                let alen = Self::addr_len(op);
                let header = 1 + alen + (op == CMD_FAST_READ) as usize;
                if n < header {
                    return 0xff;
                }
                let addr = Self::addr(&self.cmd[1..1 + alen]) + n - header;
                self.mem[addr % self.mem.len()]
            }
            _ => 0xff,
        }
    }

    pub(crate) fn consume(&mut self, byte: u8) {
        self.cmd.push(byte);
    }

    /// Chip select released: run the command
    pub(crate) fn end(&mut self) {
        let cmd = core::mem::take(&mut self.cmd);
        let Some((&op, rest)) = cmd.split_first() else {
            return;
        };
        if self.busy_left > 0 {
            return;
        }
        let cap = self.mem.len();
        match op {
            CMD_WREN => self.wel = true,
            CMD_WRDI => self.wel = false,
            CMD_WRSR if self.wel && !rest.is_empty() => {
                self.status = rest[0] & !(SR_WIP | SR_WEL);
                self.log.push(FlashOp::WriteStatus(rest[0]));
                self.start_write();
            }
            CMD_PP | CMD_PP4 if self.wel && rest.len() >= Self::addr_len(op) => {
                let (addr, data) = rest.split_at(Self::addr_len(op));
                let addr = Self::addr(addr) % cap;
                if !self.protected(addr) {
                    let page = addr & !(PAGE_SIZE - 1);
                    for (i, b) in data.iter().enumerate() {
                        self.mem[page + (addr + i) % PAGE_SIZE] &= b;
                    }
                    self.log.push(FlashOp::Program { addr: addr as u32, len: data.len() as u32 });
                }
                self.start_write();
            }
            CMD_SE | CMD_BE | CMD_SE4 | CMD_BE4 if self.wel && rest.len() >= Self::addr_len(op) => {
                let size = if matches!(op, CMD_SE | CMD_SE4) { 4096 } else { 65536 };
                let addr = (Self::addr(&rest[..Self::addr_len(op)]) % cap) & !(size - 1);
                if !self.protected(addr) {
                    self.mem[addr..(addr + size).min(cap)].fill(0xff);
                    self.log.push(FlashOp::Erase { addr: addr as u32, len: size as u32 });
                }
                self.start_write();
            }
            CMD_CE | CMD_CE_ALT if self.wel => {
                if (self.status >> 2) & 7 == 0 {
                    self.mem.fill(0xff);
                    self.log.push(FlashOp::ChipErase);
                }
                self.start_write();
            }
            _ => {}
        }
    }

    fn start_write(&mut self) {
        self.wel = false;
        self.busy_left = self.busy_polls;
    }

    /// One complete chip-select-framed transaction
    pub fn exchange(&mut self, write: &[u8]) -> Vec<u8> {
        self.begin();
        let read = write
            .iter()
            .map(|&b| {
                let out = self.next_out();
                self.consume(b);
                out
            })
            .collect();
        self.end();
        read
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BridgePhase {
    Idle,
    Length,
    Data,
    Tail,
    Done,
}

/// Forwards DR scans of one instruction to a flash, as the SPI bridge bitstreams do
#[derive(Clone, Debug)]
struct SimBridge {
    instruction: u32,
    framing: Framing,
    flash: SimFlash,
    phase: BridgePhase,
    header: u16,
    header_bits: u8,
    remaining: u16,
    bit: u8,
    mosi: u8,
    miso: u8,
    pending: bool,
}

impl SimBridge {
    fn start(&mut self) {
        self.bit = 0;
        self.mosi = 0;
        self.pending = false;
        match self.framing {
            Framing::Direct => {
                self.flash.begin();
                self.phase = BridgePhase::Data;
            }
            Framing::Framed => self.phase = BridgePhase::Idle,
        }
    }

    fn stop(&mut self) {
        if self.phase == BridgePhase::Data {
            self.flash.end();
        }
        self.phase = BridgePhase::Done;
    }

    fn data_bit(&mut self, tdi: bool) -> bool {
        if self.bit == 0 {
            self.miso = self.flash.next_out();
        }
        let miso = (self.miso >> (7 - self.bit)) & 1 != 0;
        self.mosi = self.mosi << 1 | tdi as u8;
        self.bit += 1;
        if self.bit == 8 {
            self.flash.consume(self.mosi);
            self.bit = 0;
            self.mosi = 0;
            if self.framing == Framing::Framed {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.flash.end();
                    self.phase = BridgePhase::Tail;
                }
            }
        }
        miso
    }

    fn clock(&mut self, tdi: bool) -> bool {
        match (self.framing, self.phase) {
            (Framing::Direct, BridgePhase::Data) => self.data_bit(tdi),
            (_, BridgePhase::Idle) => {
                if tdi {
                    self.phase = BridgePhase::Length;
                    self.header = 0;
                    self.header_bits = 0;
                }
                false
            }
            (_, BridgePhase::Length) => {
                self.header = self.header << 1 | tdi as u16;
                self.header_bits += 1;
                if self.header_bits == 16 {
                    if self.header == 0 {
                        self.phase = BridgePhase::Done;
                    } else {
                        self.remaining = self.header;
                        self.flash.begin();
                        self.phase = BridgePhase::Data;
                    }
                }
                false
            }
            (_, BridgePhase::Data) => {
                // MISO lags MOSI by one clock
                let out = self.pending;
                self.pending = self.data_bit(tdi);
                out
            }
            (_, BridgePhase::Tail) => {
                self.phase = BridgePhase::Done;
                self.pending
            }
            (_, BridgePhase::Done) => false,
        }
    }
}

/// One completed DR scan as seen by a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrScan {
    pub instruction: u32,
    /// TDI bits in arrival order
    pub bits: Vec<bool>,
}

impl DrScan {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Bits packed LSB-first, first arrival in bit 0
    pub fn bytes(&self) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(self.bits.len());
        for b in &self.bits {
            w.push(*b);
        }
        w.into_inner()
    }

    /// The last `n` bits: what an `n`-bit register holds at Update-DR
    pub fn register(&self, n: usize) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(n);
        for b in &self.bits[self.bits.len().saturating_sub(n)..] {
            w.push(*b);
        }
        w.into_inner()
    }
}

#[derive(Clone, Debug)]
pub struct SimTap {
    idcode: Option<u32>,
    ir_len: usize,
    idcode_instruction: u32,
    ir_capture: u32,
    registers: Vec<(u32, u64, usize)>,
    bridge: Option<SimBridge>,
    bridge_active: bool,
    ir: u32,
    shift: VecDeque<bool>,
    recording: Vec<bool>,
    scans: Vec<DrScan>,
    ir_history: Vec<u32>,
}

impl SimTap {
    pub fn new(idcode: u32, ir_len: usize) -> Self {
        Self::build(Some(idcode), ir_len)
    }

    /// A device without IDCODE: only a BYPASS register after reset
    pub fn bypass_only(ir_len: usize) -> Self {
        Self::build(None, ir_len)
    }

    fn build(idcode: Option<u32>, ir_len: usize) -> Self {
        let mut tap = Self {
            idcode,
            ir_len,
            idcode_instruction: 1,
            ir_capture: 0b01,
            registers: Vec::new(),
            bridge: None,
            bridge_active: false,
            ir: 0,
            shift: VecDeque::new(),
            recording: Vec::new(),
            scans: Vec::new(),
            ir_history: Vec::new(),
        };
        tap.ir = tap.reset_instruction();
        tap
    }

    /// A Xilinx 7-series TAP: 6-bit IR, IDCODE 0x09, INIT and DONE set in the IR capture
    pub fn xilinx7(idcode: u32) -> Self {
        Self::new(idcode, 6)
            .with_idcode_instruction(0x09)
            .with_ir_capture(0b11_0001)
            .with_register(0x08, 0xdead_beef, 32)
    }

    /// A Lattice ECP5 TAP: 8-bit IR, READ_ID 0xE0, a status register reporting a good load
    pub fn ecp5(idcode: u32) -> Self {
        Self::new(idcode, 8)
            .with_idcode_instruction(0xe0)
            .with_register(0x3c, 0x0000_0710, 32)
            .with_register(0xc0, 0xffff_ffff, 32)
    }

    pub fn with_idcode_instruction(mut self, instruction: u32) -> Self {
        self.idcode_instruction = instruction;
        self.ir = self.reset_instruction();
        self
    }

    pub fn with_ir_capture(mut self, capture: u32) -> Self {
        self.ir_capture = capture;
        self
    }

    /// Give `instruction` a DR of `width` bits that captures `value`
    pub fn with_register(mut self, instruction: u32, value: u64, width: usize) -> Self {
        self.registers.retain(|r| r.0 != instruction);
        self.registers.push((instruction, value, width));
        self
    }

    pub fn with_bridge(mut self, instruction: u32, framing: Framing, flash: SimFlash) -> Self {
        self.bridge = Some(SimBridge {
            instruction,
            framing,
            flash,
            phase: BridgePhase::Done,
            header: 0,
            header_bits: 0,
            remaining: 0,
            bit: 0,
            mosi: 0,
            miso: 0xff,
            pending: false,
        });
        self
    }

    pub fn instruction(&self) -> u32 {
        self.ir
    }

    pub fn ir_history(&self) -> &[u32] {
        &self.ir_history
    }

    pub fn dr_scans(&self) -> &[DrScan] {
        &self.scans
    }

    /// DR scans made while `instruction` was loaded
    pub fn scans_of(&self, instruction: u32) -> impl Iterator<Item = &DrScan> {
        self.scans.iter().filter(move |s| s.instruction == instruction)
    }

    pub fn bridge_flash(&self) -> Option<&SimFlash> {
        self.bridge.as_ref().map(|b| &b.flash)
    }

    fn bypass_instruction(&self) -> u32 {
        ((1u64 << self.ir_len) - 1) as u32
    }

    fn reset_instruction(&self) -> u32 {
        if self.idcode.is_some() {
            self.idcode_instruction
        } else {
            self.bypass_instruction()
        }
    }

    fn dr_capture(&self) -> (u64, usize) {
        if self.ir == self.bypass_instruction() {
            return (0, 1);
        }
        if let Some(id) = self.idcode {
            if self.ir == self.idcode_instruction {
                return (id as u64, 32);
            }
        }
        self.registers
            .iter()
            .find(|r| r.0 == self.ir)
            .map_or((0, 1), |r| (r.1, r.2))
    }

    fn load(&mut self, value: u64, width: usize) {
        self.shift.clear();
        for i in 0..width {
            self.shift.push_back(i < 64 && (value >> i) & 1 != 0);
        }
    }

    fn shift_bit(&mut self, state: JtagState, tdi: bool) -> bool {
        if state == JtagState::ShiftDR {
            self.recording.push(tdi);
            if self.bridge_active {
                if let Some(bridge) = self.bridge.as_mut() {
                    return bridge.clock(tdi);
                }
            }
        }
        self.shift.push_back(tdi);
        self.shift.pop_front().unwrap_or(tdi)
    }

    fn transition(&mut self, from: JtagState, to: JtagState) {
        match to {
            JtagState::Reset => self.ir = self.reset_instruction(),
            JtagState::CaptureIR => self.load(self.ir_capture as u64, self.ir_len),
            JtagState::UpdateIR => {
                self.ir = self
                    .shift
                    .iter()
                    .enumerate()
                    .fold(0, |acc, (i, b)| acc | (*b as u32) << i);
                self.ir_history.push(self.ir);
            }
            JtagState::CaptureDR => {
                self.recording.clear();
                self.bridge_active = self.bridge.as_ref().map_or(false, |b| b.instruction == self.ir);
                if self.bridge_active {
                    self.shift.clear();
                    if let Some(bridge) = self.bridge.as_mut() {
                        bridge.start();
                    }
                } else {
                    let (value, width) = self.dr_capture();
                    self.load(value, width);
                }
            }
            JtagState::Exit1DR if from == JtagState::ShiftDR && self.bridge_active => {
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.stop();
                }
            }
            JtagState::UpdateDR => {
                self.bridge_active = false;
                let bits = core::mem::take(&mut self.recording);
                if !bits.is_empty() {
                    self.scans.push(DrScan { instruction: self.ir, bits });
                }
            }
            _ => {}
        }
    }
}

/// Simulated adapter.  SPI transfers reach the flash unless an FPGA is modelled and out of reset,
/// in which case they land in its configuration port.
#[derive(Clone, Debug)]
pub struct SimCable {
    taps: Vec<SimTap>,
    state: JtagState,
    flash: Option<SimFlash>,
    outputs: u16,
    inputs: u16,
    fpga_reset: Option<u16>,
    config_port: Vec<u8>,
    clock: u32,
    elapsed_us: u64,
    shift_calls: usize,
    fail_after: Option<usize>,
}

impl Default for SimCable {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCable {
    pub fn new() -> Self {
        Self {
            taps: Vec::new(),
            state: JtagState::Reset,
            flash: None,
            outputs: 0,
            inputs: 0,
            fpga_reset: None,
            config_port: Vec::new(),
            clock: 0,
            elapsed_us: 0,
            shift_calls: 0,
            fail_after: None,
        }
    }

    pub fn with_taps(taps: Vec<SimTap>) -> Self {
        Self { taps, ..Self::new() }
    }

    pub fn with_flash(mut self, flash: SimFlash) -> Self {
        self.flash = Some(flash);
        self
    }

    /// Model an FPGA whose active-low reset is the GPIO `reset_mask`
    pub fn with_fpga(mut self, reset_mask: u16) -> Self {
        self.fpga_reset = Some(reset_mask);
        self
    }

    /// Make every cable call after the next `calls` fail with a transport error
    pub fn fail_after(&mut self, calls: usize) {
        self.fail_after = Some(calls);
    }

    pub fn set_inputs(&mut self, mask: u16) {
        self.inputs = mask;
    }

    pub fn outputs(&self) -> u16 {
        self.outputs
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    pub fn tap(&self, index: usize) -> &SimTap {
        &self.taps[index]
    }

    pub fn flash(&self) -> Option<&SimFlash> {
        self.flash.as_ref()
    }

    pub fn config_port(&self) -> &[u8] {
        &self.config_port
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }

    pub fn shift_calls(&self) -> usize {
        self.shift_calls
    }

    fn check_link(&mut self) -> Result<()> {
        match self.fail_after.as_mut() {
            Some(0) => Err(Error::Transport("simulated cable unplugged".into())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn fpga_running(&self) -> bool {
        self.fpga_reset.map_or(false, |mask| self.outputs & mask != 0)
    }

    fn clock_bit(&mut self, tms: bool, tdi: bool) -> bool {
        let state = self.state;
        let mut bit = tdi;
        let shifting = matches!(state, JtagState::ShiftDR | JtagState::ShiftIR);
        if shifting {
            for tap in self.taps.iter_mut() {
                bit = tap.shift_bit(state, bit);
            }
        }
        let next = state.next(tms);
        for tap in self.taps.iter_mut() {
            tap.transition(state, next);
        }
        self.state = next;
        shifting && bit
    }
}

impl Cable for SimCable {
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        self.check_link()?;
        self.shift_calls += 1;
        let mut tdo = BitWriter::with_capacity(bits);
        for i in 0..bits {
            let bit = self.clock_bit(get_bit(tms, i), get_bit(tdi, i));
            if capture {
                tdo.push(bit);
            }
        }
        Ok(tdo.into_inner())
    }

    fn spi_transfer(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        self.check_link()?;
        if self.fpga_running() {
            self.config_port.extend_from_slice(write);
            return Ok(vec![0xff; write.len()]);
        }
        match self.flash.as_mut() {
            Some(flash) => Ok(flash.exchange(write)),
            None => Ok(vec![0xff; write.len()]),
        }
    }

    fn spi_stream(&mut self, write: &[u8]) -> Result<()> {
        self.check_link()?;
        self.config_port.extend_from_slice(write);
        Ok(())
    }

    fn gpio_set(&mut self, mask: u16) -> Result<()> {
        self.check_link()?;
        self.outputs |= mask;
        Ok(())
    }

    fn gpio_clear(&mut self, mask: u16) -> Result<()> {
        self.check_link()?;
        self.outputs &= !mask;
        Ok(())
    }

    fn gpio_get(&mut self) -> Result<u16> {
        self.check_link()?;
        Ok(self.inputs | self.outputs)
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        self.clock = freq;
        Ok(freq)
    }

    fn delay_us(&mut self, us: u32) {
        self.elapsed_us += us as u64;
    }
}
