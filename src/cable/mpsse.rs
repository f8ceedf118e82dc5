//! Implement the `Cable` trait for adapters built on the FTDI MPSSE engine (FT2232H, FT4232H,
//! FT232H), in either JTAG or SPI mode.
use alloc::boxed::Box;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use libftd2xx::{DeviceType, Ft2232h, Ft232h, Ft4232h, Ftdi, FtdiCommon, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};
use ftdi_mpsse::{ClockTMS, ClockTMSOut};
use libftd2xx::{ClockBits, ClockBitsOut, ClockData, ClockDataOut};

use crate::bits::{extract, get_bit, BitWriter};
use crate::cable::{divided_clock, Cable};
use crate::config::{
    pin_mask, CableConfig, CableMode, Channel, PinMapping, Transport, UsbId, FT232H_PID,
    FT4232H_PID, FT2232H_PID,
};
use crate::error::{Error, Result};

// 60 MHz master clock with divide-by-5 disabled, two master clocks per TCK
const BASE_CLOCK: u32 = 30_000_000;
const MAX_DIVISOR: u32 = 0xffff;
// Bytes read back per USB transaction
const MAX_CHUNK: usize = 4096;

// Lower pins
const PIN_TCK: u16 = 1;
const PIN_TDI: u16 = 1 << 1;
const PIN_TMS: u16 = 1 << 3;
const PIN_SCK: u16 = PIN_TCK;
const PIN_MOSI: u16 = PIN_TDI;

/// One MPSSE shift command.  `start` indexes the first bit of the command in the caller's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    /// A single clock with a TMS value, sent through clock_tms
    Tms { start: usize, tms: bool },
    /// `len` whole bytes with TMS held low
    Bytes { start: usize, len: usize },
    /// 1..=7 bits with TMS held low
    Bits { start: usize, len: usize },
}

impl Segment {
    fn response_len(&self) -> usize {
        match *self {
            Segment::Bytes { len, .. } => len,
            _ => 1,
        }
    }
}

/// Split the clocks `[pos, bits)` into MPSSE commands whose read-back fits in `MAX_CHUNK`.
/// The TMS pin keeps the level of the last clock_tms, so a TMS=0 run right after a TMS=1 clock
/// starts with a clock_tms to pull the pin low.
fn plan(tms: &[u8], mut pos: usize, bits: usize, tms_high: &mut bool) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut response = 0;
    while pos < bits && response < MAX_CHUNK {
        let tms_bit = get_bit(tms, pos);
        if tms_bit || *tms_high {
            segments.push(Segment::Tms { start: pos, tms: tms_bit });
            *tms_high = tms_bit;
            response += 1;
            pos += 1;
            continue;
        }

        let limit = (MAX_CHUNK - response) * 8;
        let mut run = 0;
        while pos + run < bits && run < limit && !get_bit(tms, pos + run) {
            run += 1;
        }
        if run >= 8 {
            let len = run / 8;
            segments.push(Segment::Bytes { start: pos, len });
            response += len;
            pos += len * 8;
        }
        if run % 8 != 0 {
            segments.push(Segment::Bits { start: pos, len: run % 8 });
            response += 1;
            pos += run % 8;
        }
    }
    segments
}

fn build(segments: &[Segment], tdi: &[u8], capture: bool) -> MpsseCmdBuilder {
    let mut builder = MpsseCmdBuilder::new();
    for seg in segments {
        builder = match (*seg, capture) {
            (Segment::Tms { start, tms }, true) => {
                builder.clock_tms(ClockTMS::NegTMSPosTDO, tms as u8, get_bit(tdi, start), 1)
            }
            (Segment::Tms { start, tms }, false) => {
                builder.clock_tms_out(ClockTMSOut::NegEdge, tms as u8, get_bit(tdi, start), 1)
            }
            (Segment::Bytes { start, len }, true) => {
                builder.clock_data(ClockData::LsbPosIn, &extract(tdi, start, len * 8))
            }
            (Segment::Bytes { start, len }, false) => {
                builder.clock_data_out(ClockDataOut::LsbNeg, &extract(tdi, start, len * 8))
            }
            (Segment::Bits { start, len }, true) => {
                builder.clock_bits(ClockBits::LsbPosIn, extract(tdi, start, len)[0], len as u8)
            }
            (Segment::Bits { start, len }, false) => {
                builder.clock_bits_out(ClockBitsOut::LsbNeg, extract(tdi, start, len)[0], len as u8)
            }
        };
    }
    builder
}

/// Repack read-back bytes.  clock_bits and clock_tms shift TDO in from the top of the byte.
fn decode(segments: &[Segment], rx: &[u8], out: &mut BitWriter) {
    let mut idx = 0;
    for seg in segments {
        match *seg {
            Segment::Tms { .. } => out.push(rx[idx] & 0x80 != 0),
            Segment::Bytes { len, .. } => out.push_bits(&rx[idx..idx + len], len * 8),
            Segment::Bits { len, .. } => out.push_bits(&[rx[idx] >> (8 - len)], len),
        }
        idx += seg.response_len();
    }
}

pub struct Mpsse<T> {
    ft: T,
    mode: CableMode,
    // GPIO state, DBUS in the low byte and CBUS in the high byte
    value: u16,
    direction: u16,
    cs: u16,
    tms_high: bool,
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: core::fmt::Debug
{
    pub fn new(mut ft: T, mode: CableMode, pins: &PinMapping) -> Result<Self> {
        ft.initialize_mpsse_default().map_err(Error::transport)?;
        ft.set_latency_timer(Duration::from_millis(1)).map_err(Error::transport)?;

        let builder = MpsseCmdBuilder::new()
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking();
        ft.send(builder.as_slice()).map_err(Error::transport)?;

        let (value, direction, cs) = match (mode, pins) {
            (CableMode::Spi, PinMapping::Spi(p)) => {
                if (p.sck, p.mosi, p.miso) != (0, 1, 2) {
                    return Err(Error::Unsupported("MPSSE SPI outside DBUS0..2"));
                }
                let cs = pin_mask(p.cs);
                let extra = p.hold.map_or(0, pin_mask) | p.wp.map_or(0, pin_mask);
                (cs | extra, PIN_SCK | PIN_MOSI | cs | extra, cs)
            }
            (CableMode::Spi, PinMapping::Jtag(_)) => {
                return Err(Error::Unsupported("SPI mode with a JTAG pin mapping"))
            }
            _ => (PIN_TMS, PIN_TCK | PIN_TDI | PIN_TMS, 0),
        };

        let mut cable = Self { ft, mode, value, direction, cs, tms_high: true };
        cable.write_gpio()?;
        Ok(cable)
    }

    fn write_gpio(&mut self) -> Result<()> {
        let [lo, hi] = self.value.to_le_bytes();
        let [dir_lo, dir_hi] = self.direction.to_le_bytes();
        let mut builder = MpsseCmdBuilder::new().set_gpio_lower(lo, dir_lo);
        if dir_hi != 0 {
            builder = builder.set_gpio_upper(hi, dir_hi);
        }
        self.ft.send(builder.as_slice()).map_err(Error::transport)
    }

    fn require(&self, spi: bool) -> Result<()> {
        match (spi, self.mode) {
            (true, CableMode::Spi) => Ok(()),
            (true, _) => Err(Error::Unsupported("SPI on a cable opened for JTAG")),
            (false, CableMode::Spi) => Err(Error::Unsupported("JTAG on a cable opened for SPI")),
            (false, _) => Ok(()),
        }
    }

    fn chip_select(&mut self, active: bool) -> Result<()> {
        if active {
            self.value &= !self.cs;
        } else {
            self.value |= self.cs;
        }
        self.write_gpio()
    }
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Cable for Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: core::fmt::Debug
{
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        self.require(false)?;
        let mut tdo = BitWriter::with_capacity(if capture { bits } else { 0 });
        let mut pos = 0;
        while pos < bits {
            let segments = plan(tms, pos, bits, &mut self.tms_high);
            pos = segments.last().map_or(bits, |seg| match *seg {
                Segment::Tms { start, .. } => start + 1,
                Segment::Bytes { start, len } => start + len * 8,
                Segment::Bits { start, len } => start + len,
            });
            let builder = build(&segments, tdi, capture);
            if capture {
                let builder = builder.send_immediate();
                let mut rx = vec![0; segments.iter().map(Segment::response_len).sum()];
                self.ft.xfer(builder.as_slice(), &mut rx).map_err(Error::transport)?;
                decode(&segments, &rx, &mut tdo);
            } else {
                self.ft.send(builder.as_slice()).map_err(Error::transport)?;
            }
        }
        Ok(if capture { tdo.into_inner() } else { Vec::new() })
    }

    fn spi_transfer(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        self.require(true)?;
        let mut read = Vec::with_capacity(write.len());
        self.chip_select(true)?;
        for chunk in write.chunks(MAX_CHUNK) {
            let builder = MpsseCmdBuilder::new()
                .clock_data(ClockData::MsbPosIn, chunk)
                .send_immediate();
            let mut rx = vec![0; chunk.len()];
            self.ft.xfer(builder.as_slice(), &mut rx).map_err(Error::transport)?;
            read.extend_from_slice(&rx);
        }
        self.chip_select(false)?;
        Ok(read)
    }

    fn spi_stream(&mut self, write: &[u8]) -> Result<()> {
        self.require(true)?;
        for chunk in write.chunks(MAX_CHUNK) {
            let builder = MpsseCmdBuilder::new().clock_data_out(ClockDataOut::MsbNeg, chunk);
            self.ft.send(builder.as_slice()).map_err(Error::transport)?;
        }
        Ok(())
    }

    fn gpio_set(&mut self, mask: u16) -> Result<()> {
        self.value |= mask;
        self.direction |= mask;
        self.write_gpio()
    }

    fn gpio_clear(&mut self, mask: u16) -> Result<()> {
        self.value &= !mask;
        self.direction |= mask;
        self.write_gpio()
    }

    fn gpio_get(&mut self) -> Result<u16> {
        let lo = self.ft.gpio_lower().map_err(Error::transport)?;
        let hi = if T::DEVICE_TYPE == DeviceType::FT4232H {
            0
        } else {
            self.ft.gpio_upper().map_err(Error::transport)?
        };
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        let (divisor, achieved) = divided_clock(BASE_CLOCK, freq, MAX_DIVISOR);
        let builder = MpsseCmdBuilder::new().set_clock(divisor, Some(false));
        self.ft.send(builder.as_slice()).map_err(Error::transport)?;
        log::debug!("MPSSE divisor {} for {} Hz", divisor, achieved);
        Ok(achieved)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }
}

fn open_ftdi(id: &UsbId, channel: Channel) -> Result<Ftdi> {
    #[cfg(target_os = "linux")]
    if id.vid != crate::config::FTDI_VID {
        libftd2xx::set_vid_pid(id.vid, id.pid).map_err(Error::transport)?;
    }
    if id.bus.is_some() || id.address.is_some() {
        log::warn!("FTDI devices are selected by serial number, ignoring bus/address");
    }

    let multi_channel = matches!(id.pid, FT2232H_PID | FT4232H_PID);
    let devices = libftd2xx::list_devices().map_err(Error::transport)?;
    let info = devices
        .into_iter()
        .find(|d| {
            d.vendor_id == id.vid
                && d.product_id == id.pid
                && id.serial.as_ref().map_or(true, |s| d.serial_number.starts_with(s.as_str()))
                && (!multi_channel
                    || d.serial_number.ends_with(channel.letter())
                    || d.description.ends_with(channel.letter()))
        })
        .ok_or_else(|| {
            Error::Transport(format!(
                "no FTDI device {:04x}:{:04x} interface {}",
                id.vid,
                id.pid,
                channel.letter()
            ))
        })?;
    if info.port_open {
        return Err(Error::Transport(format!("{} is busy", info.description)));
    }
    log::debug!("Opening {} ({})", info.description, info.serial_number);
    Ftdi::with_serial_number(&info.serial_number).map_err(Error::transport)
}

/// Open an MPSSE adapter; the part type comes from the USB product id
pub fn open(config: &CableConfig, pins: &PinMapping) -> Result<Box<dyn Cable>> {
    let Transport::Usb(id) = config.transport() else {
        return Err(Error::Unsupported("MPSSE over TCP"));
    };
    let ft = open_ftdi(id, config.channel())?;
    let mode = config.mode();
    let cable: Box<dyn Cable> = match id.pid {
        FT232H_PID => Box::new(Mpsse::new(Ft232h::try_from(ft).map_err(Error::transport)?, mode, pins)?),
        FT4232H_PID => Box::new(Mpsse::new(Ft4232h::try_from(ft).map_err(Error::transport)?, mode, pins)?),
        _ => Box::new(Mpsse::new(Ft2232h::try_from(ft).map_err(Error::transport)?, mode, pins)?),
    };
    Ok(cable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_pulls_tms_low_after_a_high_clock() {
        // Idle -> Shift-DR (1, 0, 0) followed by 20 data bits, the last with TMS=1
        let mut tms = BitWriter::new();
        tms.push(true);
        tms.push_repeat(false, 2);
        tms.push_repeat(false, 19);
        tms.push(true);
        let mut high = false;
        let segments = plan(tms.as_slice(), 0, tms.len(), &mut high);
        assert_eq!(
            segments,
            vec![
                Segment::Tms { start: 0, tms: true },
                Segment::Tms { start: 1, tms: false },
                Segment::Bytes { start: 2, len: 2 },
                Segment::Bits { start: 18, len: 4 },
                Segment::Tms { start: 22, tms: true },
            ]
        );
        assert!(high);
    }

    #[test]
    fn decode_realigns_partial_bytes() {
        let segments = [
            Segment::Bytes { start: 0, len: 1 },
            Segment::Bits { start: 8, len: 3 },
            Segment::Tms { start: 11, tms: true },
        ];
        let mut out = BitWriter::new();
        decode(&segments, &[0xa5, 0b1010_0000, 0x80], &mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(out.as_slice(), &[0xa5, 0b1101]);
    }
}
