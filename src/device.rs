//! FPGA families and the operations a user can ask of them.  `Target` wraps one concrete device
//! and dispatches by family; `run_actions` executes a batch of requests in a fixed, physically
//! safe order.
use alloc::string::String;
use alloc::vec::Vec;

use crate::bitstream::Bitstream;
use crate::cable::Cable;
use crate::error::{ChainFault, Error, Result, Step};
use crate::flash::{FlashRegion, SpiBus, SpiFlash, Status};
use crate::parts::{ChainEntry, Family};
use crate::taps::Taps;

pub mod bridge;
pub mod ecp5;
pub mod ice40;
pub mod xilinx;

use ecp5::Ecp5;
use ice40::{Ice40, Ice40Pins};
use xilinx::Xilinx7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Volatile configuration memory, lost at power off
    Sram,
    /// The configuration flash the FPGA boots from
    Flash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramRequest {
    pub payload: Vec<u8>,
    pub destination: Destination,
    pub verify: bool,
    pub unprotect_first: bool,
    /// Flash byte offset, ignored for SRAM
    pub offset: u32,
}

impl ProgramRequest {
    pub fn sram(payload: Vec<u8>) -> Self {
        Self { payload, destination: Destination::Sram, verify: false, unprotect_first: false, offset: 0 }
    }

    pub fn flash(payload: Vec<u8>, offset: u32) -> Self {
        Self { payload, destination: Destination::Flash, verify: true, unprotect_first: false, offset }
    }

    pub fn from_bitstream(bitstream: Bitstream, destination: Destination) -> Self {
        let payload = bitstream.into_payload();
        match destination {
            Destination::Sram => Self::sram(payload),
            Destination::Flash => Self::flash(payload, 0),
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_unprotect(mut self, unprotect: bool) -> Self {
        self.unprotect_first = unprotect;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// One flash operation, run by whichever path reaches the flash
#[derive(Clone, Copy, Debug)]
pub(crate) enum FlashAction<'a> {
    Program { offset: u32, data: &'a [u8], unprotect: bool, verify: bool },
    Dump { offset: u32, len: usize },
    Protect(Status),
    Unprotect,
    BulkErase,
}

/// What a successful action produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutput {
    None,
    Data(Vec<u8>),
    Register(u32),
}

impl ActionOutput {
    pub fn into_data(self) -> Vec<u8> {
        match self {
            ActionOutput::Data(data) => data,
            _ => Vec::new(),
        }
    }
}

pub(crate) fn run_flash_cmd<B: SpiBus>(flash: &mut SpiFlash<B>, action: &FlashAction) -> Result<ActionOutput> {
    match *action {
        FlashAction::Program { offset, data, unprotect, verify } => {
            if unprotect {
                flash.clear_protection(Status::PROTECTION).step("unprotect")?;
            }
            flash.erase_and_program(offset, data, verify).step("program flash")?;
        }
        FlashAction::Dump { offset, len } => {
            let region = FlashRegion::new(offset, len, flash.capacity()).step("dump flash")?;
            return flash.dump(region).step("dump flash").map(ActionOutput::Data);
        }
        FlashAction::Protect(mask) => flash.set_protection(mask).step("protect")?,
        FlashAction::Unprotect => flash.clear_protection(Status::PROTECTION).step("unprotect")?,
        FlashAction::BulkErase => flash.erase_bulk().step("bulk erase")?,
    }
    Ok(ActionOutput::None)
}

/// Pick the device to work on.  With `forced`, that chain index is used if it is a supported
/// FPGA; otherwise the chain must hold exactly one.
pub fn select_target(chain: &[ChainEntry], forced: Option<usize>) -> Result<usize> {
    let found = || chain.iter().rev().map(|e| e.idcode).collect::<Vec<_>>();
    if let Some(index) = forced {
        let entry = chain.get(index).ok_or(Error::Range { what: "chain index", index, limit: chain.len() })?;
        if !entry.family().is_fpga() {
            log::error!("TAP {} ({:08x}) is not a supported FPGA", index, entry.idcode);
            return Err(Error::Unsupported("programming a device that is not a known FPGA"));
        }
        return Ok(index);
    }
    let fpgas: Vec<usize> = chain
        .iter()
        .enumerate()
        .filter(|(_, e)| e.family().is_fpga())
        .map(|(i, _)| i)
        .collect();
    match fpgas.as_slice() {
        [] => Err(Error::Chain { fault: ChainFault::NoTarget, found: found() }),
        [index] => {
            log::debug!("Automatically selecting device at TAP {}", index);
            Ok(*index)
        }
        _ => {
            log::error!("FPGAs at TAPs {:?}, pick one", fpgas);
            Err(Error::Chain { fault: ChainFault::MultipleTargets, found: found() })
        }
    }
}

pub enum Target<T> {
    Ice40(Ice40<T>),
    Ecp5(Ecp5<T>),
    Xilinx7(Xilinx7<T>),
}

impl<T, U> Target<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// An iCE40 on an SPI cable
    pub fn ice40(cable: T, pins: Ice40Pins) -> Self {
        Target::Ice40(Ice40::new(cable, pins))
    }

    /// The FPGA on a detected JTAG chain, chosen by `select_target`
    pub fn from_taps(taps: Taps<T>, forced: Option<usize>, bridge_image: Option<Vec<u8>>) -> Result<Self> {
        let index = select_target(taps.chain(), forced)?;
        let family = taps.chain()[index].family();
        log::info!("using {:?} device at TAP {}", family, index);
        match family {
            Family::Ecp5 => Ok(Target::Ecp5(Ecp5::new(taps, index)?)),
            Family::Xilinx7 => Ok(Target::Xilinx7(Xilinx7::new(taps, index, bridge_image)?)),
            Family::Ice40 | Family::Other => Err(Error::Unsupported("this device over JTAG")),
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Target::Ice40(_) => Family::Ice40,
            Target::Ecp5(_) => Family::Ecp5,
            Target::Xilinx7(_) => Family::Xilinx7,
        }
    }

    pub fn program(&mut self, request: &ProgramRequest) -> Result<()> {
        let ProgramRequest { payload, destination, verify, unprotect_first, offset } = request;
        if *destination == Destination::Sram && *verify {
            log::warn!("SRAM loads are not read back, skipping verify");
        }
        match (self, destination) {
            (Target::Ice40(dev), Destination::Sram) => dev.program_sram(payload),
            (Target::Ice40(dev), Destination::Flash) => dev.program_flash(*offset, payload, *unprotect_first, *verify),
            (Target::Ecp5(dev), Destination::Sram) => dev.program_sram(payload),
            (Target::Ecp5(dev), Destination::Flash) => dev.program_flash(*offset, payload, *unprotect_first, *verify),
            (Target::Xilinx7(dev), Destination::Sram) => dev.program_sram(payload),
            (Target::Xilinx7(dev), Destination::Flash) => {
                dev.program_flash(*offset, payload, *unprotect_first, *verify)
            }
        }
    }

    pub fn dump_flash(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        match self {
            Target::Ice40(dev) => dev.dump_flash(offset, len),
            Target::Ecp5(dev) => dev.dump_flash(offset, len),
            Target::Xilinx7(dev) => dev.dump_flash(offset, len),
        }
    }

    pub fn protect_flash(&mut self, mask: Status) -> Result<()> {
        match self {
            Target::Ice40(dev) => dev.protect_flash(mask),
            Target::Ecp5(dev) => dev.protect_flash(mask),
            Target::Xilinx7(dev) => dev.protect_flash(mask),
        }
    }

    pub fn unprotect_flash(&mut self) -> Result<()> {
        match self {
            Target::Ice40(dev) => dev.unprotect_flash(),
            Target::Ecp5(dev) => dev.unprotect_flash(),
            Target::Xilinx7(dev) => dev.unprotect_flash(),
        }
    }

    pub fn bulk_erase_flash(&mut self) -> Result<()> {
        match self {
            Target::Ice40(dev) => dev.bulk_erase_flash(),
            Target::Ecp5(dev) => dev.bulk_erase_flash(),
            Target::Xilinx7(dev) => dev.bulk_erase_flash(),
        }
    }

    /// Make the FPGA reload its configuration from flash
    pub fn reset(&mut self) -> Result<()> {
        match self {
            Target::Ice40(dev) => dev.reset(),
            Target::Ecp5(dev) => dev.reset(),
            Target::Xilinx7(dev) => dev.reset(),
        }
    }

    pub fn read_register(&mut self, name: &str) -> Result<u32> {
        match self {
            Target::Ice40(_) => Err(Error::Unsupported("register reads on iCE40")),
            Target::Ecp5(dev) => dev.read_register(name),
            Target::Xilinx7(dev) => dev.read_register(name),
        }
    }

    /// None of the supported families carries a debug port for an on-chip MCU
    pub fn connect_embedded_bus(&mut self) -> Result<()> {
        Err(Error::Unsupported("embedded bus bridging"))
    }

    /// Keep a flash bridge loaded between calls.  iCE40 flash is reached directly.
    pub fn set_trust_loaded_bridge(&mut self, trust: bool) {
        match self {
            Target::Ice40(_) => {}
            Target::Ecp5(dev) => dev.set_trust_loaded_bridge(trust),
            Target::Xilinx7(dev) => dev.set_trust_loaded_bridge(trust),
        }
    }

    /// Don't reset or reconfigure the FPGA after flash access
    pub fn set_skip_reset(&mut self, skip: bool) {
        match self {
            Target::Ice40(dev) => dev.set_skip_reset(skip),
            Target::Ecp5(dev) => dev.set_skip_reset(skip),
            Target::Xilinx7(dev) => dev.set_skip_reset(skip),
        }
    }

    pub fn release(self) -> T {
        match self {
            Target::Ice40(dev) => dev.release(),
            Target::Ecp5(dev) => dev.release(),
            Target::Xilinx7(dev) => dev.release(),
        }
    }

    fn run_action(&mut self, action: &Action) -> Result<ActionOutput> {
        match action {
            Action::Program(request) => self.program(request).map(|_| ActionOutput::None),
            Action::ConnectEmbeddedBus => self.connect_embedded_bus().map(|_| ActionOutput::None),
            Action::ReadRegister(name) => self.read_register(name).map(ActionOutput::Register),
            Action::Unprotect => self.unprotect_flash().map(|_| ActionOutput::None),
            Action::BulkErase => self.bulk_erase_flash().map(|_| ActionOutput::None),
            Action::Protect(mask) => self.protect_flash(*mask).map(|_| ActionOutput::None),
            Action::Dump { offset, len } => self.dump_flash(*offset, *len).map(ActionOutput::Data),
            Action::Reset => self.reset().map(|_| ActionOutput::None),
        }
    }

    /// Run every action, program first and reset last, whatever order they were given in.  A
    /// failed action is reported and the rest still run.
    pub fn run_actions(&mut self, mut actions: Vec<Action>) -> Vec<ActionReport> {
        actions.sort_by_key(Action::rank);
        actions
            .iter()
            .map(|action| {
                let result = self.run_action(action);
                match &result {
                    Ok(_) => log::info!("{}: done", action.name()),
                    Err(e) => log::error!("{} failed: {}", action.name(), e),
                }
                ActionReport { action: action.name(), result }
            })
            .collect()
    }
}

/// A user request for `Target::run_actions`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Program(ProgramRequest),
    ConnectEmbeddedBus,
    ReadRegister(String),
    Unprotect,
    BulkErase,
    Protect(Status),
    Dump { offset: u32, len: usize },
    Reset,
}

impl Action {
    fn rank(&self) -> u8 {
        match self {
            Action::Program(_) => 0,
            Action::ConnectEmbeddedBus => 1,
            Action::ReadRegister(_) => 2,
            Action::Unprotect => 3,
            Action::BulkErase => 4,
            Action::Protect(_) => 5,
            Action::Dump { .. } => 6,
            Action::Reset => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Program(_) => "program",
            Action::ConnectEmbeddedBus => "connect embedded bus",
            Action::ReadRegister(_) => "read register",
            Action::Unprotect => "unprotect",
            Action::BulkErase => "bulk erase",
            Action::Protect(_) => "protect",
            Action::Dump { .. } => "dump",
            Action::Reset => "reset",
        }
    }
}

#[derive(Debug)]
pub struct ActionReport {
    pub action: &'static str,
    pub result: Result<ActionOutput>,
}

impl ActionReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
