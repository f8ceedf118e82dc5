//! Implement the `Cable` trait for SEGGER J-Link adapters
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use rusb::constants::*;
use rusb::{DeviceHandle, Direction, GlobalContext};

use crate::bits::{extract, BitWriter};
use crate::cable::Cable;
use crate::config::UsbId;
use crate::error::{Error, Result};

/// GPIO masks for the adapter's reset lines
pub const JLINK_SRST: u16 = 1 << 0;
pub const JLINK_TRST: u16 = 1 << 1;

const CMD_SET_SPEED: u8 = 0x05;
const CMD_GET_STATUS: u8 = 0x07;
const CMD_SELECT_IF: u8 = 0xc7;
const CMD_HW_JTAG: u8 = 0xcd;
const CMD_RESET_TRST: u8 = 0xde;
const CMD_SET_TRST: u8 = 0xdf;
const CMD_RESET_SRST: u8 = 0xdc;
const CMD_SET_SRST: u8 = 0xdd;

// Bytes of TMS (and of TDI) per HW_JTAG sequence
const MAX_SEQUENCE_BYTES: usize = 384;
const MIN_VREF_MV: u16 = 1500;
const TIMEOUT: Duration = Duration::from_millis(500);

pub struct JLink {
    device: DeviceHandle<GlobalContext>,
    read_endpoint: u8,
    write_endpoint: u8,
}

impl JLink {
    /// Open the J-Link matching `id`.  `bus`/`address` pick one adapter among several.
    pub fn open(id: &UsbId) -> Result<Self> {
        let devices = rusb::devices().map_err(Error::transport)?;
        for device in devices.iter() {
            let desc = device.device_descriptor().map_err(Error::transport)?;
            if desc.vendor_id() != id.vid || desc.product_id() != id.pid {
                continue;
            }
            if id.bus.map_or(false, |b| b != device.bus_number())
                || id.address.map_or(false, |a| a != device.address())
            {
                continue;
            }

            let mut handle = device.open().map_err(Error::transport)?;
            if let Some(serial) = &id.serial {
                let found = handle.read_serial_number_string_ascii(&desc).unwrap_or_default();
                if &found != serial {
                    continue;
                }
            }

            let config = device.active_config_descriptor().map_err(Error::transport)?;
            for i in config.interfaces() {
                for d in i.descriptors() {
                    if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC
                        || d.sub_class_code() != LIBUSB_CLASS_VENDOR_SPEC
                        || d.num_endpoints() < 2
                    {
                        continue;
                    }

                    let mut read_endpoint = None;
                    let mut write_endpoint = None;
                    for e in d.endpoint_descriptors() {
                        match e.direction() {
                            Direction::In => read_endpoint = Some(e.address()),
                            Direction::Out => write_endpoint = Some(e.address()),
                        }
                    }
                    let (Some(read_endpoint), Some(write_endpoint)) = (read_endpoint, write_endpoint) else {
                        continue;
                    };

                    handle.claim_interface(d.interface_number()).map_err(|e| match e {
                        rusb::Error::Busy => Error::Transport("J-Link is busy".into()),
                        e => Error::transport(e),
                    })?;

                    // Drain anything left over from a previous session
                    let mut buf = [0; 2];
                    let _ = handle.read_bulk(read_endpoint, &mut buf, Duration::from_millis(10));

                    let mut jlink = Self { device: handle, read_endpoint, write_endpoint };
                    jlink.check_status()?;
                    jlink.select_interface(0)?;
                    jlink.command(&[CMD_SET_TRST])?;
                    jlink.command(&[CMD_SET_SRST])?;
                    return Ok(jlink);
                }
            }
        }
        Err(Error::Transport(format!("no J-Link {:04x}:{:04x} attached", id.vid, id.pid)))
    }

    fn command(&mut self, data: &[u8]) -> Result<()> {
        let written = self
            .device
            .write_bulk(self.write_endpoint, data, TIMEOUT)
            .map_err(Error::transport)?;
        if written != data.len() {
            return Err(Error::Transport(format!("short USB write ({} of {})", written, data.len())));
        }
        Ok(())
    }

    fn response(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let mut buffer = vec![0; len - data.len()];
            let got = self
                .device
                .read_bulk(self.read_endpoint, &mut buffer, TIMEOUT)
                .map_err(Error::transport)?;
            data.extend_from_slice(&buffer[..got]);
        }
        Ok(data)
    }

    /// Read the adapter status and check the target is powered
    pub fn check_status(&mut self) -> Result<u16> {
        self.command(&[CMD_GET_STATUS])?;
        let data = self.response(8)?;
        let vref = u16::from_le_bytes([data[0], data[1]]);
        if vref < MIN_VREF_MV {
            return Err(Error::Transport(format!(
                "target voltage {} mV too low, possibly unpowered or disconnected",
                vref
            )));
        }
        log::debug!("J-Link target voltage {} mV", vref);
        Ok(vref)
    }

    fn select_interface(&mut self, intf: u8) -> Result<()> {
        self.command(&[CMD_SELECT_IF, intf])?;
        self.response(4).map(|_| ())
    }

    fn tap_sequence(&mut self, tms: &[u8], tdi: &[u8], bits: usize) -> Result<Vec<u8>> {
        let mut cmd = Vec::with_capacity(3 + tms.len() * 2);
        cmd.push(CMD_HW_JTAG);
        cmd.extend_from_slice(&(bits as u16).to_le_bytes());
        cmd.extend_from_slice(tms);
        cmd.extend_from_slice(tdi);
        self.command(&cmd)?;
        self.response(tms.len())
    }
}

impl Cable for JLink {
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        let mut tdo = BitWriter::with_capacity(bits);
        let step = MAX_SEQUENCE_BYTES * 8;
        let mut pos = 0;
        while pos < bits {
            let len = step.min(bits - pos);
            let out = self.tap_sequence(&extract(tms, pos, len), &extract(tdi, pos, len), len)?;
            tdo.push_bits(&out, len);
            pos += len;
        }
        Ok(if capture { tdo.into_inner() } else { Vec::new() })
    }

    fn gpio_set(&mut self, mask: u16) -> Result<()> {
        if mask & JLINK_SRST != 0 {
            self.command(&[CMD_SET_SRST])?;
        }
        if mask & JLINK_TRST != 0 {
            self.command(&[CMD_SET_TRST])?;
        }
        Ok(())
    }

    fn gpio_clear(&mut self, mask: u16) -> Result<()> {
        if mask & JLINK_SRST != 0 {
            self.command(&[CMD_RESET_SRST])?;
        }
        if mask & JLINK_TRST != 0 {
            self.command(&[CMD_RESET_TRST])?;
        }
        Ok(())
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        let khz = (freq / 1000).clamp(1, u16::MAX as u32) as u16;
        let [lo, hi] = khz.to_le_bytes();
        self.command(&[CMD_SET_SPEED, lo, hi])?;
        Ok(khz as u32 * 1000)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }
}
