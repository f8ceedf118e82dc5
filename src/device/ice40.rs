//! Lattice iCE40 on an SPI cable.  The configuration flash shares the SPI bus with the FPGA, so the
//! FPGA is held in reset (CRESET low) for as long as the flash is being talked to.
use alloc::vec::Vec;
use core::time::Duration;

use crate::cable::Cable;
use crate::config::{DBUS4, DBUS6, DBUS7};
use crate::device::{run_flash_cmd, ActionOutput, FlashAction};
use crate::error::{Error, Result, Step};
use crate::flash::{CableSpi, SpiFlash, Status};

/// Dummy bytes clocked after an SRAM image so the device can start up
const STARTUP_BYTES: usize = 18;
const POLL_US: u32 = 1000;

/// GPIO masks of the iCE40 control lines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ice40Pins {
    pub cs: u16,
    /// CRESET_B, active low
    pub reset: u16,
    /// CDONE
    pub done: u16,
}

impl Ice40Pins {
    /// iCEstick / iCEBreaker style FT2232H wiring
    pub const FTDI: Ice40Pins = Ice40Pins { cs: DBUS4, reset: DBUS7, done: DBUS6 };
}

impl Default for Ice40Pins {
    fn default() -> Self {
        Self::FTDI
    }
}

pub struct Ice40<T> {
    flash: SpiFlash<CableSpi<T>>,
    pins: Ice40Pins,
    timeout: Duration,
    skip_reset: bool,
}

impl<T, U> Ice40<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(cable: T, pins: Ice40Pins) -> Self {
        Self { flash: SpiFlash::new(CableSpi::new(cable)), pins, timeout: Self::DEFAULT_TIMEOUT, skip_reset: false }
    }

    /// How long to wait for CDONE after a load or reset
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Leave CRESET alone around flash access and don't wait for the FPGA to boot afterwards,
    /// for boards where the FPGA is already off the SPI bus
    pub fn set_skip_reset(&mut self, skip: bool) {
        self.skip_reset = skip;
    }

    pub fn flash(&mut self) -> &mut SpiFlash<CableSpi<T>> {
        &mut self.flash
    }

    pub fn release(self) -> T {
        self.flash.release().release()
    }

    fn cable(&mut self) -> &mut U {
        self.flash.bus().cable()
    }

    fn wait_done(&mut self) -> Result<()> {
        let done = self.pins.done;
        let polls = (self.timeout.as_micros() / POLL_US as u128).max(1);
        for _ in 0..polls {
            if self.cable().gpio_get()? & done != 0 {
                log::info!("iCE40 CDONE high");
                return Ok(());
            }
            self.cable().delay_us(POLL_US);
        }
        log::error!("iCE40 CDONE still low after {:?}", self.timeout);
        Err(Error::Timeout("CDONE"))
    }

    /// Run `action` on the flash with the FPGA off the bus.  Reset is released again even when the
    /// action fails.
    fn with_fpga_held(&mut self, action: &FlashAction) -> Result<ActionOutput> {
        if self.skip_reset {
            self.flash.identify().step("identify flash")?;
            return run_flash_cmd(&mut self.flash, action);
        }
        let reset = self.pins.reset;
        self.cable().gpio_clear(reset).step("hold reset")?;
        let result = self
            .flash
            .identify()
            .step("identify flash")
            .and_then(|_| run_flash_cmd(&mut self.flash, action));
        let release = self.cable().gpio_set(reset);
        let output = result?;
        release.step("release reset")?;
        Ok(output)
    }

    /// Write `data` to flash at `offset` and boot from it
    pub fn program_flash(&mut self, offset: u32, data: &[u8], unprotect: bool, verify: bool) -> Result<()> {
        log::info!("iCE40: writing {} bytes to flash at 0x{:06x}", data.len(), offset);
        self.with_fpga_held(&FlashAction::Program { offset, data, unprotect, verify })?;
        if self.skip_reset {
            return Ok(());
        }
        self.wait_done().step("wait for CDONE")
    }

    /// Load `payload` straight into configuration SRAM in SPI slave mode
    pub fn program_sram(&mut self, payload: &[u8]) -> Result<()> {
        log::info!("iCE40: loading {} bytes into SRAM", payload.len());
        let Ice40Pins { cs, reset, .. } = self.pins;
        // CS low while CRESET rises selects SPI slave configuration
        self.cable().gpio_clear(cs | reset).step("enter slave mode")?;
        self.cable().delay_us(100);
        self.cable().gpio_set(reset).step("enter slave mode")?;
        self.cable().delay_us(1200);

        self.cable().spi_stream(payload).step("send bitstream")?;
        self.cable().spi_stream(&[0; STARTUP_BYTES]).step("send bitstream")?;
        self.cable().gpio_set(cs).step("send bitstream")?;
        self.wait_done().step("wait for CDONE")
    }

    /// Pulse CRESET so the FPGA reloads from flash
    pub fn reset(&mut self) -> Result<()> {
        let reset = self.pins.reset;
        self.cable().gpio_clear(reset)?;
        self.cable().delay_us(100);
        self.cable().gpio_set(reset)?;
        self.wait_done().step("wait for CDONE")
    }

    pub fn dump_flash(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        self.with_fpga_held(&FlashAction::Dump { offset, len }).map(ActionOutput::into_data)
    }

    pub fn protect_flash(&mut self, mask: Status) -> Result<()> {
        self.with_fpga_held(&FlashAction::Protect(mask)).map(|_| ())
    }

    pub fn unprotect_flash(&mut self) -> Result<()> {
        self.with_fpga_held(&FlashAction::Unprotect).map(|_| ())
    }

    pub fn bulk_erase_flash(&mut self) -> Result<()> {
        self.with_fpga_held(&FlashAction::BulkErase).map(|_| ())
    }
}
