//! Implement the `Cable` trait for FTDI FT232R adapters driven in synchronous bitbang mode
use alloc::format;
use alloc::vec::Vec;
use core::time::Duration;

use libftd2xx::{BitMode, Ftdi, FtdiCommon};

use crate::bits::{get_bit, BitWriter};
use crate::cable::Cable;
use crate::config::{JtagPins, UsbId};
use crate::error::{Error, Result};

// Samples per write/read round trip, kept below the FT232R receive buffer
const CHUNK_SAMPLES: usize = 256;
// In bitbang mode the pins update at 16x the programmed baud rate
const BAUD_MULTIPLIER: u32 = 16;
const MAX_BAUD: u32 = 3_000_000 / BAUD_MULTIPLIER;

pub struct Ft232r {
    ft: Ftdi,
    pins: JtagPins,
    // Pin levels and directions outside the JTAG signals
    value: u8,
    direction: u8,
}

impl Ft232r {
    pub fn open(id: &UsbId, pins: JtagPins) -> Result<Self> {
        #[cfg(target_os = "linux")]
        if id.vid != crate::config::FTDI_VID {
            libftd2xx::set_vid_pid(id.vid, id.pid).map_err(Error::transport)?;
        }
        let devices = libftd2xx::list_devices().map_err(Error::transport)?;
        let info = devices
            .into_iter()
            .find(|d| {
                d.vendor_id == id.vid
                    && d.product_id == id.pid
                    && id.serial.as_ref().map_or(true, |s| &d.serial_number == s)
            })
            .ok_or_else(|| Error::Transport(format!("no FT232R {:04x}:{:04x}", id.vid, id.pid)))?;
        if info.port_open {
            return Err(Error::Transport(format!("{} is busy", info.description)));
        }
        let ft = Ftdi::with_serial_number(&info.serial_number).map_err(Error::transport)?;
        Self::new(ft, pins)
    }

    pub fn new(mut ft: Ftdi, pins: JtagPins) -> Result<Self> {
        ft.set_latency_timer(Duration::from_millis(1)).map_err(Error::transport)?;
        let mut cable = Self { ft, pins, value: 0, direction: 0 };
        cable.apply_bit_mode()?;
        cable.ft.purge_all().map_err(Error::transport)?;
        Ok(cable)
    }

    fn jtag_outputs(&self) -> u8 {
        1 << self.pins.tck | 1 << self.pins.tdi | 1 << self.pins.tms
    }

    fn apply_bit_mode(&mut self) -> Result<()> {
        let mask = self.jtag_outputs() | self.direction;
        self.ft.set_bit_mode(mask, BitMode::SyncBitbang).map_err(Error::transport)
    }

    fn sample(&self, tms: bool, tdi: bool, tck: bool) -> u8 {
        (self.value & self.direction)
            | (tms as u8) << self.pins.tms
            | (tdi as u8) << self.pins.tdi
            | (tck as u8) << self.pins.tck
    }

    fn write_pins(&mut self) -> Result<()> {
        let idle = [self.sample(true, true, false)];
        let mut echo = [0];
        self.ft.write_all(&idle).map_err(Error::transport)?;
        self.ft.read_all(&mut echo).map_err(Error::transport)
    }
}

impl Cable for Ft232r {
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        let mut tdo = BitWriter::with_capacity(bits);
        let step = CHUNK_SAMPLES / 2;
        let mut pos = 0;
        while pos < bits {
            let end = (pos + step).min(bits);
            let mut buf = Vec::with_capacity((end - pos) * 2);
            for i in pos..end {
                let (m, d) = (get_bit(tms, i), get_bit(tdi, i));
                buf.push(self.sample(m, d, false));
                buf.push(self.sample(m, d, true));
            }
            let mut recv = alloc::vec![0; buf.len()];
            self.ft.write_all(&buf).map_err(Error::transport)?;
            self.ft.read_all(&mut recv).map_err(Error::transport)?;
            // Each sample is taken before its byte is applied, so the high-clock sample holds
            // the TDO value set up during the preceding low-clock byte
            for pair in recv.chunks(2) {
                tdo.push(pair[1] & (1 << self.pins.tdo) != 0);
            }
            pos = end;
        }
        Ok(if capture { tdo.into_inner() } else { Vec::new() })
    }

    fn gpio_set(&mut self, mask: u16) -> Result<()> {
        let mask = (mask & 0xff) as u8 & !self.jtag_outputs();
        self.value |= mask;
        self.direction |= mask;
        self.apply_bit_mode()?;
        self.write_pins()
    }

    fn gpio_clear(&mut self, mask: u16) -> Result<()> {
        let mask = (mask & 0xff) as u8 & !self.jtag_outputs();
        self.value &= !mask;
        self.direction |= mask;
        self.apply_bit_mode()?;
        self.write_pins()
    }

    fn gpio_get(&mut self) -> Result<u16> {
        self.ft.bit_mode().map(u16::from).map_err(Error::transport)
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        // Two samples per TCK period
        let baud = (freq.saturating_mul(2) / BAUD_MULTIPLIER).clamp(1, MAX_BAUD);
        self.ft.set_baud_rate(baud).map_err(Error::transport)?;
        Ok(baud * BAUD_MULTIPLIER / 2)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }
}
