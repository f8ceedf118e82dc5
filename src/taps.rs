//! A convenience wrapper for JTAG scan chains with multiple TAPs present.  `Taps` allows the
//! client to interact with one selected TAP as if it were the only TAP in the chain, so that the
//! client doesn't have to deal with putting the other TAPs into bypass and shifting data through
//! the bypass registers.
//!
//! Chain positions are physical: index 0 is the device closest to TDI.  Every IR or DR access is
//! a single scan through the whole chain, padded with BYPASS instructions (IR) or one bypass bit
//! per device (DR).
use alloc::vec;
use alloc::vec::Vec;

use crate::bits::{bytes_for, extract, get_bit, to_u64, BitWriter};
use crate::cable::Cable;
use crate::error::{ChainFault, Error, Result};
use crate::parts::{self, ChainEntry, Part};
use crate::statemachine::{JtagSM, Register};

/// How many devices `detect` looks for before giving up on finding the end of the chain
pub const MAX_DEVICES: usize = 16;
const MAX_IR_BITS: usize = 256;

pub struct Taps<T> {
    pub sm: JtagSM<T>,
    chain: Vec<ChainEntry>,
    active: usize,
    bypassed: bool,
}

impl<T, U> Taps<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Scan the chain and identify every device from the built-in part table
    pub fn new(sm: JtagSM<T>) -> Result<Self> {
        Self::with_parts(sm, &[])
    }

    /// Like `new`, with `extra` parts consulted before the built-in table
    pub fn with_parts(sm: JtagSM<T>, extra: &'static [Part]) -> Result<Self> {
        let mut taps = Self::manual(sm);
        taps.detect(extra)?;
        Ok(taps)
    }

    /// An empty chain, to be described with `add_tap`
    pub fn manual(sm: JtagSM<T>) -> Self {
        Self {
            sm,
            chain: Vec::new(),
            active: 0,
            bypassed: false,
        }
    }

    /// Append a device on the TDO side of the chain built so far
    pub fn add_tap(&mut self, idcode: u32, ir_len: usize) {
        self.chain.push(ChainEntry { idcode, part: parts::lookup(idcode), ir_len });
    }

    /// Scan the chain and resolve each IDCODE.  A single unknown device (including one that only
    /// exposes BYPASS) gets whatever IR length is left over from the measured chain total.
    pub fn detect(&mut self, extra: &'static [Part]) -> Result<()> {
        let ids = self.scan_chain(MAX_DEVICES)?;
        self.resolve(&ids, extra)
    }

    /// `detect` for chains with BYPASS-only devices, whose length must be known up front
    pub fn detect_expected(&mut self, expected: usize, extra: &'static [Part]) -> Result<()> {
        let ids = self.scan_chain_expected(expected)?;
        self.resolve(&ids, extra)
    }

    fn resolve(&mut self, ids: &[u32], extra: &'static [Part]) -> Result<()> {
        let found = || ids.iter().rev().copied().collect::<Vec<_>>();
        if ids.is_empty() {
            return Err(Error::Chain { fault: ChainFault::NoDevice, found: Vec::new() });
        }

        let parts: Vec<Option<&'static Part>> = ids
            .iter()
            .map(|&id| {
                if id == 0 {
                    return None;
                }
                extra.iter().find(|p| p.matches(id)).or_else(|| parts::lookup(id))
            })
            .collect();

        let unknown = parts.iter().filter(|p| p.is_none()).count();
        let known_ir: usize = parts.iter().flatten().map(|p| p.ir_len).sum();
        let mut inferred = 0;
        if unknown > 0 {
            let total = self.measure_ir_total()?;
            if unknown > 1 || total <= known_ir {
                return Err(Error::Chain { fault: ChainFault::UnknownPart, found: found() });
            }
            inferred = total - known_ir;
        }

        self.chain = ids
            .iter()
            .zip(&parts)
            .map(|(&idcode, part)| ChainEntry {
                idcode,
                part: *part,
                ir_len: part.map_or(inferred, |p| p.ir_len),
            })
            .collect();
        for (i, e) in self.chain.iter().enumerate() {
            match e.part {
                Some(p) => log::info!("TAP {}: {:08x} {} {} (IR {} bits)", i, e.idcode, p.manufacturer, p.model, e.ir_len),
                None => log::info!("TAP {}: {:08x} unknown (IR {} bits)", i, e.idcode, e.ir_len),
            }
        }
        self.active = 0;
        self.reset()
    }

    /// Total IR length of the chain: fill every IR with zeros, then count how many ones go in
    /// before the first one comes out
    fn measure_ir_total(&mut self) -> Result<usize> {
        self.sm.mode_reset()?;
        let mut tdi = BitWriter::with_capacity(2 * MAX_IR_BITS);
        tdi.push_repeat(false, MAX_IR_BITS);
        tdi.push_repeat(true, MAX_IR_BITS);
        let tdo = self.sm.read_write_reg(Register::Instruction, tdi.as_slice(), 2 * MAX_IR_BITS)?;
        let total = (0..MAX_IR_BITS).find(|&i| get_bit(&tdo, MAX_IR_BITS + i));
        self.sm.mode_reset()?;
        self.bypassed = false;
        log::debug!("measured IR chain length {:?}", total);
        total.ok_or(Error::Chain { fault: ChainFault::UnknownPart, found: Vec::new() })
    }

    /// Reset the chain and read every device's IDCODE in one scan, TDI held high.  Returns the
    /// IDCODEs in physical order.
    pub fn scan_chain(&mut self, max_devices: usize) -> Result<Vec<u32>> {
        self.reset()?;
        let windows = max_devices + 1;
        let tdo = self.sm.read_reg(Register::Data, 32 * windows)?;

        let mut found = Vec::new();
        for w in 0..windows {
            let id = to_u64(&tdo, 32 * w, 32) as u32;
            if id == 0xffff_ffff || id == 0 {
                found.reverse();
                return Ok(found);
            }
            if id & 1 == 0 {
                log::warn!("device {} from TDO has no IDCODE", found.len());
                return Err(Error::Chain { fault: ChainFault::Ambiguous, found });
            }
            if w == max_devices {
                break;
            }
            log::debug!("scanned idcode {:08x}", id);
            found.push(id);
        }
        Err(Error::Chain { fault: ChainFault::TooLong, found })
    }

    /// Scan a chain known to hold `expected` devices.  BYPASS-only devices are reported with an
    /// IDCODE of 0.
    pub fn scan_chain_expected(&mut self, expected: usize) -> Result<Vec<u32>> {
        self.reset()?;
        let bits = 32 * (expected + 1);
        let tdo = self.sm.read_reg(Register::Data, bits)?;

        let mut found = Vec::with_capacity(expected);
        let mut pos = 0;
        for _ in 0..expected {
            if !get_bit(&tdo, pos) {
                found.push(0);
                pos += 1;
                continue;
            }
            let id = to_u64(&tdo, pos, 32) as u32;
            if id == 0xffff_ffff {
                return Err(Error::Chain { fault: ChainFault::LengthMismatch, found });
            }
            found.push(id);
            pos += 32;
        }
        if to_u64(&tdo, pos, 32) as u32 != 0xffff_ffff {
            return Err(Error::Chain { fault: ChainFault::LengthMismatch, found });
        }
        found.reverse();
        Ok(found)
    }

    /// Reset every TAP to Test-Logic-Reset and settle in Idle.  IDCODE (or BYPASS) is loaded
    /// everywhere, so a DR scan needs a fresh `select_device` afterwards.
    pub fn reset(&mut self) -> Result<()> {
        self.sm.mode_reset()?;
        self.bypassed = false;
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.chain.len() {
            return Err(Error::Range { what: "chain index", index, limit: self.chain.len() });
        }
        Ok(())
    }

    /// Make `index` the device addressed by `shift_ir`/`shift_dr`.  Every other TAP is put in
    /// BYPASS and the target is left with its IDCODE instruction, as after a reset.  A target
    /// whose part (and so its IDCODE instruction) is unknown gets BYPASS as well.
    pub fn select_device(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.active = index;
        let entry = self.chain[index];
        let instruction = match entry.part {
            Some(part) => part.idcode_instruction.to_le_bytes().to_vec(),
            None => vec![0xff; bytes_for(entry.ir_len)],
        };
        self.shift_ir(&instruction, entry.ir_len)?;
        log::debug!("selected TAP {}", index);
        Ok(())
    }

    fn check_buffer(bits: &[u8], n: usize) -> Result<()> {
        if bits.len() < bytes_for(n) {
            return Err(Error::Range { what: "shift buffer bytes", index: bits.len(), limit: bytes_for(n) });
        }
        Ok(())
    }

    /// Shift `n` bits of `bits` into the selected device's IR, BYPASS into the others.  Returns
    /// what the selected IR captured.
    pub fn shift_ir(&mut self, bits: &[u8], n: usize) -> Result<Vec<u8>> {
        self.check_index(self.active)?;
        let ir_len = self.chain[self.active].ir_len;
        if n != ir_len {
            return Err(Error::Range { what: "IR length", index: n, limit: ir_len });
        }
        Self::check_buffer(bits, n)?;
        let after: usize = self.chain[self.active + 1..].iter().map(|e| e.ir_len).sum();
        let before: usize = self.chain[..self.active].iter().map(|e| e.ir_len).sum();

        let mut tdi = BitWriter::with_capacity(after + n + before);
        tdi.push_repeat(true, after);
        tdi.push_bits(bits, n);
        tdi.push_repeat(true, before);
        log::trace!("IR {:02x?} -> TAP {}", &bits[..bytes_for(n)], self.active);

        let tdo = self.sm.read_write_reg(Register::Instruction, tdi.as_slice(), tdi.len())?;
        self.bypassed = true;
        Ok(extract(&tdo, after, n))
    }

    /// Shift `n` bits through the selected device's DR.  Returns the `n` bits it captured.
    pub fn shift_dr(&mut self, bits: &[u8], n: usize) -> Result<Vec<u8>> {
        self.check_index(self.active)?;
        if self.chain.len() > 1 && !self.bypassed {
            return Err(Error::Chain { fault: ChainFault::NotSelected, found: Vec::new() });
        }
        Self::check_buffer(bits, n)?;
        let after = self.chain.len() - 1 - self.active;
        let before = self.active;

        let mut tdi = BitWriter::with_capacity(after + n + before);
        tdi.push_repeat(false, after);
        tdi.push_bits(bits, n);
        tdi.push_repeat(false, before);

        let tdo = self.sm.read_write_reg(Register::Data, tdi.as_slice(), tdi.len())?;
        Ok(extract(&tdo, after, n))
    }

    /// Clock TCK `count` times in Run-Test/Idle
    pub fn idle_clocks(&mut self, count: usize) -> Result<()> {
        self.sm.idle_clocks(count)
    }

    /// Reset the chain and read the IDCODE of the device at `index`
    pub fn read_idcode_at(&mut self, index: usize) -> Result<u32> {
        self.check_index(index)?;
        self.reset()?;
        let width = |e: &ChainEntry| if e.idcode == 0 { 1 } else { 32 };
        let total: usize = self.chain.iter().map(width).sum();
        let offset: usize = self.chain[index + 1..].iter().map(width).sum();
        let tdo = self.sm.read_reg(Register::Data, total)?;
        Ok(to_u64(&tdo, offset, width(&self.chain[index])) as u32)
    }

    pub fn chain(&self) -> &[ChainEntry] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn release(self) -> T {
        self.sm.release()
    }
}
