//! Lattice ECP5 over JTAG.  SRAM is loaded with LSC_BITSTREAM_BURST; the configuration flash is
//! reached through the background SPI pass-through, which needs no bridge image.
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::bits::{reverse_bytes, to_u64};
use crate::cable::Cable;
use crate::device::bridge::{run_bridged, Bridge, BridgeHost, Framing, JtagSpiBridge};
use crate::device::{run_flash_cmd, ActionOutput, FlashAction};
use crate::error::{Error, Result, Step};
use crate::flash::{SpiFlash, Status};
use crate::taps::Taps;

pub const IR_LEN: usize = 8;

pub const READ_ID: u8 = 0xe0;
pub const USERCODE: u8 = 0xc0;
pub const LSC_READ_STATUS: u8 = 0x3c;
pub const LSC_REFRESH: u8 = 0x79;
pub const ISC_ENABLE: u8 = 0xc6;
pub const ISC_DISABLE: u8 = 0x26;
pub const ISC_ERASE: u8 = 0x0e;
pub const LSC_BITSTREAM_BURST: u8 = 0x7a;
pub const LSC_BACKGROUND_SPI: u8 = 0x3a;

/// Unlock key for LSC_BACKGROUND_SPI, 0xFE68 shifted LSB first
const BACKGROUND_SPI_KEY: [u8; 2] = [0xfe, 0x68];
/// Run-Test/Idle clocks after each configuration command
const SETTLE_CLOCKS: usize = 50;
const BUSY_POLLS: usize = 1000;
const BUSY_POLL_US: u32 = 1000;

bitflags! {
    /// Configuration status register
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ecp5Status: u32 {
        const TRANSPARENT = 1 << 0;
        const JTAG_ACTIVE = 1 << 4;
        const PWD_PROTECTION = 1 << 5;
        const DECRYPT_ENABLE = 1 << 7;
        const DONE = 1 << 8;
        const ISC_ENABLE = 1 << 9;
        const WRITE_ENABLE = 1 << 10;
        const READ_ENABLE = 1 << 11;
        const BUSY = 1 << 12;
        const FAIL = 1 << 13;
        const ENCRYPT_PREAMBLE = 1 << 20;
        const STANDARD_PREAMBLE = 1 << 21;
        const SPIM_FAIL = 1 << 22;
        const EXECUTION_ERROR = 1 << 26;
        const ID_ERROR = 1 << 27;
        const INVALID_COMMAND = 1 << 28;
        const SED_ERROR = 1 << 29;
        const BYPASS_MODE = 1 << 30;
        const FLOW_THROUGH_MODE = 1 << 31;
    }
}

impl Ecp5Status {
    /// Bitstream engine error code, zero when no error was reported
    pub fn bse_error(&self) -> u8 {
        ((self.bits() >> 23) & 7) as u8
    }

    /// Ready to accept a bitstream after ISC_ENABLE
    pub fn ready_for_burst(&self) -> bool {
        self.contains(Self::JTAG_ACTIVE | Self::ISC_ENABLE | Self::WRITE_ENABLE) && !self.contains(Self::BUSY)
    }

    /// A bitstream went in and the device woke up
    pub fn programmed(&self) -> bool {
        self.bse_error() == 0 && self.contains(Self::DONE) && !self.contains(Self::FAIL)
    }
}

pub struct Ecp5<T> {
    taps: Taps<T>,
    index: usize,
    bridge: Bridge,
}

impl<T, U> Ecp5<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// The ECP5 at chain position `index`
    pub fn new(taps: Taps<T>, index: usize) -> Result<Self> {
        if index >= taps.len() {
            return Err(Error::Range { what: "chain index", index, limit: taps.len() });
        }
        Ok(Self { taps, index, bridge: Bridge::new() })
    }

    pub fn taps(&mut self) -> &mut Taps<T> {
        &mut self.taps
    }

    pub fn release(self) -> T {
        self.taps.release()
    }

    pub fn set_trust_loaded_bridge(&mut self, trust: bool) {
        self.bridge.set_trust_loaded_bridge(trust);
    }

    /// Don't refresh the device after a flash call
    pub fn set_skip_reset(&mut self, skip: bool) {
        self.bridge.set_skip_reset(skip);
    }

    fn command(&mut self, instruction: u8) -> Result<()> {
        log::trace!("ECP5 command 0x{:02x}", instruction);
        self.taps.select_device(self.index)?;
        self.taps.shift_ir(&[instruction], IR_LEN)?;
        Ok(())
    }

    fn read_u32(&mut self, instruction: u8) -> Result<u32> {
        self.command(instruction)?;
        let dr = self.taps.shift_dr(&[0; 4], 32)?;
        Ok(to_u64(&dr, 0, 32) as u32)
    }

    pub fn read_status(&mut self) -> Result<Ecp5Status> {
        let status = Ecp5Status::from_bits_retain(self.read_u32(LSC_READ_STATUS)?);
        log::debug!("ECP5 status 0x{:08x}", status.bits());
        Ok(status)
    }

    /// One of `status`, `idcode` or `usercode`
    pub fn read_register(&mut self, name: &str) -> Result<u32> {
        match name {
            "status" => Ok(self.read_status()?.bits()),
            "idcode" => self.read_u32(READ_ID),
            "usercode" => self.read_u32(USERCODE),
            _ => Err(Error::Unsupported("register name")),
        }
    }

    fn wait_not_busy(&mut self) -> Result<Ecp5Status> {
        for _ in 0..BUSY_POLLS {
            let status = self.read_status()?;
            if !status.contains(Ecp5Status::BUSY) {
                return Ok(status);
            }
            self.taps.sm.cable.delay_us(BUSY_POLL_US);
        }
        Err(Error::Timeout("ECP5 busy"))
    }

    /// Load `payload` into configuration SRAM and check that the device woke up
    pub fn program_sram(&mut self, payload: &[u8]) -> Result<()> {
        log::info!("ECP5: loading {} bytes into SRAM", payload.len());
        self.bridge.invalidate();
        self.command(ISC_ENABLE).step("enable configuration")?;
        self.taps.idle_clocks(SETTLE_CLOCKS)?;

        let status = self.read_status().step("enable configuration")?;
        if !status.ready_for_burst() {
            log::error!("ECP5 not ready for a bitstream, status 0x{:08x}", status.bits());
            return Err(Error::BadStatus { what: "configuration not enabled", status: status.bits() })
                .step("enable configuration");
        }

        self.command(LSC_BITSTREAM_BURST).step("send bitstream")?;
        self.taps.shift_dr(&reverse_bytes(payload), payload.len() * 8).step("send bitstream")?;
        self.taps.idle_clocks(1)?;

        self.command(ISC_DISABLE).step("disable configuration")?;
        self.taps.idle_clocks(SETTLE_CLOCKS)?;

        let status = self.wait_not_busy().step("check status")?;
        if !status.programmed() {
            log::error!("ECP5 did not start, status 0x{:08x} (BSE error {})", status.bits(), status.bse_error());
            return Err(Error::BadStatus { what: "bitstream rejected", status: status.bits() })
                .step("check status");
        }
        log::info!("ECP5 configured");
        Ok(())
    }

    /// Reconfigure from flash
    pub fn reset(&mut self) -> Result<()> {
        log::info!("ECP5: refresh");
        self.bridge.invalidate();
        self.command(LSC_REFRESH)?;
        self.taps.idle_clocks(SETTLE_CLOCKS)
    }

    pub fn program_flash(&mut self, offset: u32, data: &[u8], unprotect: bool, verify: bool) -> Result<()> {
        run_bridged(self, &FlashAction::Program { offset, data, unprotect, verify }).map(|_| ())
    }

    pub fn dump_flash(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        run_bridged(self, &FlashAction::Dump { offset, len }).map(ActionOutput::into_data)
    }

    pub fn protect_flash(&mut self, mask: Status) -> Result<()> {
        run_bridged(self, &FlashAction::Protect(mask)).map(|_| ())
    }

    pub fn unprotect_flash(&mut self) -> Result<()> {
        run_bridged(self, &FlashAction::Unprotect).map(|_| ())
    }

    pub fn bulk_erase_flash(&mut self) -> Result<()> {
        run_bridged(self, &FlashAction::BulkErase).map(|_| ())
    }
}

impl<T, U> BridgeHost for Ecp5<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    fn bridge(&mut self) -> &mut Bridge {
        &mut self.bridge
    }

    /// Erase SRAM so the device releases the SPI pins, then open the pass-through
    fn load_bridge(&mut self) -> Result<()> {
        if self.taps.len() > 1 {
            return Err(Error::Unsupported("background SPI with other devices in the chain"));
        }
        self.command(ISC_ENABLE)?;
        self.taps.idle_clocks(SETTLE_CLOCKS)?;
        self.command(ISC_ERASE)?;
        self.taps.idle_clocks(SETTLE_CLOCKS)?;
        self.taps.sm.cable.delay_us(100_000);
        self.command(ISC_DISABLE)?;
        self.taps.idle_clocks(SETTLE_CLOCKS)?;

        self.command(LSC_BACKGROUND_SPI)?;
        self.taps.shift_dr(&BACKGROUND_SPI_KEY, 16)?;
        self.taps.idle_clocks(SETTLE_CLOCKS)
    }

    fn unload_bridge(&mut self) -> Result<()> {
        self.reset()
    }

    fn flash_action(&mut self, action: &FlashAction) -> Result<ActionOutput> {
        // Other commands may have been loaded since the pass-through was opened
        let bus = JtagSpiBridge::new(&mut self.taps, self.index, Some(LSC_BACKGROUND_SPI), Framing::Direct);
        let mut flash = SpiFlash::probe(bus).step("identify flash")?;
        run_flash_cmd(&mut flash, action)
    }
}
