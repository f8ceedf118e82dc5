//! Implementations for different JTAG and SPI hardware adapters live here.  Hardware adapters
//! implement the `Cable` trait; `open` picks the backend described by a `CableConfig`.
use alloc::vec::Vec;

use crate::error::{Error, Result};

#[cfg(feature = "std")]
pub mod ft232r;
pub mod gpio;
#[cfg(feature = "std")]
pub mod jlink;
#[cfg(feature = "std")]
pub mod mpsse;
pub mod sim;
#[cfg(feature = "std")]
pub mod xvc;

pub trait Cable {
    /// Clock `bits` TCK cycles.  Bit `i` of `tms` and `tdi` (LSB-first packing) drive TMS and TDI
    /// during clock `i`.  When `capture` is set the TDO value of every clock is returned with the
    /// same packing, otherwise the returned buffer is empty.
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>>;

    /// Full-duplex SPI transfer with chip select asserted around it.  Returns as many bytes as
    /// were written.
    fn spi_transfer(&mut self, _write: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Unsupported("SPI transfers on this cable"))
    }

    /// Clock bytes out on MOSI without touching chip select
    fn spi_stream(&mut self, _write: &[u8]) -> Result<()> {
        Err(Error::Unsupported("SPI streaming on this cable"))
    }

    /// Drive the pins in `mask` high
    fn gpio_set(&mut self, _mask: u16) -> Result<()> {
        Err(Error::Unsupported("GPIO control on this cable"))
    }

    /// Drive the pins in `mask` low
    fn gpio_clear(&mut self, _mask: u16) -> Result<()> {
        Err(Error::Unsupported("GPIO control on this cable"))
    }

    fn gpio_get(&mut self) -> Result<u16> {
        Err(Error::Unsupported("GPIO input on this cable"))
    }

    /// Request a TCK/SCK frequency.  Returns the frequency actually configured, which is never
    /// faster than `freq`.
    fn set_clock(&mut self, freq: u32) -> Result<u32>;

    fn delay_us(&mut self, us: u32);
}

/// Largest divisor-based frequency `base / (div + 1)` that does not exceed `freq`
pub(crate) fn divided_clock(base: u32, freq: u32, max_div: u32) -> (u32, u32) {
    let freq = freq.max(1);
    let div = base.div_ceil(freq).saturating_sub(1).min(max_div);
    (div, base / (div + 1))
}

/// Open the adapter described by `config`, wired as `pins`, and set its clock
#[cfg(feature = "std")]
pub fn open(
    config: &crate::config::CableConfig,
    pins: &crate::config::PinMapping,
) -> Result<alloc::boxed::Box<dyn Cable>> {
    use crate::config::{CableMode, Transport, FT232R_PID, JLINK_VID};
    use alloc::boxed::Box;

    let mut cable: Box<dyn Cable> = match (config.transport(), config.mode()) {
        (Transport::Tcp { host, port }, _) => Box::new(xvc::Xvc::connect(host, *port)?),
        (Transport::Usb(id), CableMode::JtagNative) if id.vid == JLINK_VID => {
            Box::new(jlink::JLink::open(id)?)
        }
        (Transport::Usb(_), CableMode::JtagNative) => {
            return Err(Error::Unsupported("native JTAG on a non J-Link adapter"))
        }
        (Transport::Usb(id), CableMode::JtagBitbang) => {
            let jtag = pins.jtag().ok_or(Error::Unsupported("bitbang SPI"))?;
            Box::new(ft232r::Ft232r::open(id, *jtag)?)
        }
        (Transport::Usb(id), _) if id.pid == FT232R_PID => {
            return Err(Error::Unsupported("MPSSE on an FT232R"))
        }
        (Transport::Usb(_), _) => mpsse::open(config, pins)?,
    };
    let achieved = cable.set_clock(config.frequency())?;
    log::info!("Cable clock {} Hz (requested {} Hz)", achieved, config.frequency());
    if let Some(status) = config.status_pin() {
        cable.gpio_set(status)?;
    }
    Ok(cable)
}
