//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any desired state.
//! `JtagSM` will get to that state by the most efficient path, based on the current state.
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use alloc::vec;

use crate::bits::{extract, BitWriter};
use crate::cable::Cable;
use crate::error::Result;

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Register {
    Data,
    Instruction
}

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

impl JtagState {
    const ALL: [JtagState; 16] = [
        JtagState::Reset, JtagState::Idle,
        JtagState::SelectDR, JtagState::CaptureDR, JtagState::ShiftDR, JtagState::Exit1DR,
        JtagState::PauseDR, JtagState::Exit2DR, JtagState::UpdateDR,
        JtagState::SelectIR, JtagState::CaptureIR, JtagState::ShiftIR, JtagState::Exit1IR,
        JtagState::PauseIR, JtagState::Exit2IR, JtagState::UpdateIR,
    ];

    /// The state reached from `self` after one TCK with the given TMS value
    pub fn next(self, tms: bool) -> JtagState {
        use JtagState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => SelectDR,
            (SelectDR, false) => CaptureDR,
            (SelectDR, true) => SelectIR,
            (CaptureDR, false) | (ShiftDR, false) | (Exit2DR, false) => ShiftDR,
            (CaptureDR, true) | (ShiftDR, true) => Exit1DR,
            (Exit1DR, false) | (PauseDR, false) => PauseDR,
            (Exit1DR, true) | (Exit2DR, true) => UpdateDR,
            (PauseDR, true) => Exit2DR,
            (UpdateDR, false) | (UpdateIR, false) => Idle,
            (UpdateDR, true) | (UpdateIR, true) => SelectDR,
            (SelectIR, false) => CaptureIR,
            (SelectIR, true) => Reset,
            (CaptureIR, false) | (ShiftIR, false) | (Exit2IR, false) => ShiftIR,
            (CaptureIR, true) | (ShiftIR, true) => Exit1IR,
            (Exit1IR, false) | (PauseIR, false) => PauseIR,
            (Exit1IR, true) | (Exit2IR, true) => UpdateIR,
            (PauseIR, true) => Exit2IR,
        }
    }
}

struct Node {
    edges: [usize; 2],
}

/// Tracks the TAP state of every device on the chain (they all move in lockstep) and issues the
/// TMS sequences needed to move between states.
pub struct JtagSM<T> {
    pub cable: T,
    state: JtagState,
    graph: Vec<Node>,
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Create a JTAG state machine using an existing `Cable`.  The chain is reset to Idle.
    pub fn new(cable: T) -> Result<Self> {
        let graph = JtagState::ALL
            .iter()
            .map(|s| Node { edges: [s.next(false) as usize, s.next(true) as usize] })
            .collect();

        let mut sm = Self {
            cable,
            state: JtagState::Reset,
            graph,
        };
        sm.mode_reset()?;
        Ok(sm)
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Reset the scan chain by driving TMS high for 5 clocks, then settle in Idle
    pub fn mode_reset(&mut self) -> Result<()> {
        self.cable.jtag_shift(&[0b0001_1111], &[0xff], 6, false)?;
        self.state = JtagState::Idle;
        Ok(())
    }

    /// Shortest TMS sequence from the current state to `state`; TMS=0 edges are explored first.
    pub fn path_to(&self, state: JtagState) -> Vec<bool> {
        self.path_between(self.state, state)
    }

    fn path_between(&self, from: JtagState, to: JtagState) -> Vec<bool> {
        let mut prev: [Option<(usize, bool)>; 16] = [None; 16];
        let mut seen = [false; 16];
        let mut queue = VecDeque::new();
        seen[from as usize] = true;
        queue.push_back(from as usize);

        while let Some(s) = queue.pop_front() {
            if s == to as usize {
                break;
            }
            for (tms, &next) in self.graph[s].edges.iter().enumerate() {
                if !seen[next] {
                    seen[next] = true;
                    prev[next] = Some((s, tms == 1));
                    queue.push_back(next);
                }
            }
        }

        let mut path = vec![];
        let mut s = to as usize;
        while let Some((p, tms)) = prev[s] {
            path.push(tms);
            s = p;
        }
        path.reverse();
        path
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }

        let path = self.path_to(state);
        let mut tms = BitWriter::with_capacity(path.len());
        for bit in &path {
            tms.push(*bit);
        }
        self.cable.jtag_shift(tms.as_slice(), &vec![0xff; tms.as_slice().len()], path.len(), false)?;
        self.state = state;
        Ok(())
    }

    /// Clock `count` cycles in Run-Test/Idle
    pub fn idle_clocks(&mut self, count: usize) -> Result<()> {
        self.change_mode(JtagState::Idle)?;
        if count > 0 {
            let zeros = vec![0; (count + 7) / 8];
            self.cable.jtag_shift(&zeros, &zeros, count, false)?;
        }
        Ok(())
    }

    /// Shift `bits` bits of `data` through the instruction or data register and finish in `end`,
    /// all in a single cable transaction.  Returns the captured TDO bits when `capture` is set.
    pub fn shift(&mut self, reg: Register, data: &[u8], bits: usize, capture: bool, end: JtagState) -> Result<Vec<u8>> {
        let shift_state = match reg {
            Register::Data => JtagState::ShiftDR,
            Register::Instruction => JtagState::ShiftIR,
        };
        if bits == 0 {
            self.change_mode(end)?;
            return Ok(Vec::new());
        }

        let lead = self.path_to(shift_state);
        let exit = match reg {
            Register::Data => JtagState::Exit1DR,
            Register::Instruction => JtagState::Exit1IR,
        };
        let tail = self.path_between(exit, end);
        let total = lead.len() + bits + tail.len();

        let mut tms = BitWriter::with_capacity(total);
        let mut tdi = BitWriter::with_capacity(total);
        for bit in &lead {
            tms.push(*bit);
        }
        tdi.push_repeat(true, lead.len());
        // The last data bit leaves Shift state with TMS=1
        tms.push_repeat(false, bits - 1);
        tms.push(true);
        tdi.push_bits(data, bits);
        for bit in &tail {
            tms.push(*bit);
        }
        tdi.push_repeat(true, tail.len());

        let tdo = self.cable.jtag_shift(tms.as_slice(), tdi.as_slice(), total, capture)?;
        self.state = end;
        Ok(if capture { extract(&tdo, lead.len(), bits) } else { Vec::new() })
    }

    /// Read `bits` from either the instruction or data register while shifting in ones
    pub fn read_reg(&mut self, reg: Register, bits: usize) -> Result<Vec<u8>> {
        let ones = vec![0xff; (bits + 7) / 8];
        self.shift(reg, &ones, bits, true, JtagState::Idle)
    }

    /// Write `data` into either the instruction or data register, ending in Idle
    pub fn write_reg(&mut self, reg: Register, data: &[u8], bits: usize) -> Result<()> {
        self.shift(reg, data, bits, false, JtagState::Idle).map(|_| ())
    }

    /// Similar to `write_reg` except it returns the bits that were shifted out during writing.
    pub fn read_write_reg(&mut self, reg: Register, data: &[u8], bits: usize) -> Result<Vec<u8>> {
        self.shift(reg, data, bits, true, JtagState::Idle)
    }

    pub fn release(self) -> T {
        self.cable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimCable, SimTap};

    #[test]
    fn shortest_paths() {
        let mut sim = SimCable::new();
        let sm = JtagSM::new(&mut sim).unwrap();
        assert_eq!(sm.state(), JtagState::Idle);
        assert_eq!(sm.path_to(JtagState::ShiftDR), vec![true, false, false]);
        assert_eq!(sm.path_to(JtagState::ShiftIR), vec![true, true, false, false]);
        assert_eq!(sm.path_to(JtagState::SelectDR), vec![true]);
        assert_eq!(sm.path_to(JtagState::Reset), vec![true, true, true]);
        assert!(sm.path_to(JtagState::Idle).is_empty());
        assert_eq!(sm.path_between(JtagState::Exit1DR, JtagState::Idle), vec![true, false]);
        assert_eq!(sm.path_between(JtagState::Exit1IR, JtagState::ShiftDR), vec![true, true, false, false]);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut sim = SimCable::new();
        let mut sm = JtagSM::new(&mut sim).unwrap();
        sm.mode_reset().unwrap();
        sm.mode_reset().unwrap();
        assert_eq!(sm.state(), JtagState::Idle);
        drop(sm);
        assert_eq!(sim.state(), JtagState::Idle);
    }

    #[test]
    fn every_state_reachable_with_tracking_in_sync() {
        let mut sim = SimCable::new();
        let mut sm = JtagSM::new(&mut sim).unwrap();
        for s in JtagState::ALL {
            sm.change_mode(s).unwrap();
            assert_eq!(sm.state(), s);
            assert_eq!(sm.cable.state(), s);
        }
    }

    #[test]
    fn reset_reaches_idle_from_every_state() {
        let mut sim = SimCable::new();
        let mut sm = JtagSM::new(&mut sim).unwrap();
        for s in JtagState::ALL {
            sm.change_mode(s).unwrap();
            sm.mode_reset().unwrap();
            assert_eq!(sm.state(), JtagState::Idle);
            assert_eq!(sm.cable.state(), JtagState::Idle);
        }
    }

    #[test]
    fn shift_reads_idcode_in_one_scan() {
        let mut sim = SimCable::with_taps(vec![SimTap::new(0x0362d093, 6)]);
        let mut sm = JtagSM::new(&mut sim).unwrap();
        let id = sm.read_reg(Register::Data, 32).unwrap();
        assert_eq!(id, 0x0362d093u32.to_le_bytes().to_vec());
        assert_eq!(sm.state(), JtagState::Idle);
        drop(sm);
        assert_eq!(sim.shift_calls(), 2);
    }
}
