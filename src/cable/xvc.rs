//! Xilinx Virtual Cable client.  The server owns the physical adapter; we speak `getinfo:`,
//! `settck:` and `shift:` over TCP.
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;
use std::io::{Read, Write};
use std::net::TcpStream;

use crate::bits::{bytes_for, extract, BitWriter};
use crate::cable::Cable;
use crate::error::{Error, Result};

/// What the server reported in its `getinfo:` reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XvcInfo {
    pub version: (u32, u32),
    /// Largest TMS (and TDI) vector in bytes a single `shift:` may carry
    pub max_vector_len: usize,
}

impl XvcInfo {
    /// Parse `xvcServer_v1.0:2048\n`
    pub fn parse(reply: &[u8]) -> Result<Self> {
        let text = core::str::from_utf8(reply).map_err(|_| bad_reply(reply))?;
        let rest = text.trim_end().strip_prefix("xvcServer_v").ok_or_else(|| bad_reply(reply))?;
        let (version, len) = rest.split_once(':').ok_or_else(|| bad_reply(reply))?;
        let (major, minor) = version.split_once('.').ok_or_else(|| bad_reply(reply))?;
        let parse = |s: &str| s.parse::<u32>().map_err(|_| bad_reply(reply));
        let max_vector_len = parse(len)? as usize;
        if max_vector_len == 0 {
            return Err(bad_reply(reply));
        }
        Ok(Self { version: (parse(major)?, parse(minor)?), max_vector_len })
    }
}

fn bad_reply(reply: &[u8]) -> Error {
    Error::Transport(format!("unexpected XVC getinfo reply {:?}", reply))
}

/// Encode one `shift:` request: bit count (u32 LE), then TMS and TDI vectors
pub fn encode_shift(bits: usize, tms: &[u8], tdi: &[u8]) -> Vec<u8> {
    let bytes = bytes_for(bits);
    let mut msg = Vec::with_capacity(10 + 2 * bytes);
    msg.extend_from_slice(b"shift:");
    msg.extend_from_slice(&(bits as u32).to_le_bytes());
    msg.extend_from_slice(&tms[..bytes]);
    msg.extend_from_slice(&tdi[..bytes]);
    msg
}

/// TCK period in nanoseconds for a frequency, rounded up so the clock is never faster
pub fn period_ns(freq: u32) -> u32 {
    1_000_000_000u32.div_ceil(freq.max(1))
}

pub struct Xvc {
    stream: TcpStream,
    info: XvcInfo,
}

impl Xvc {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(Error::transport)?;
        stream.set_nodelay(true).map_err(Error::transport)?;
        let mut xvc = Self { stream, info: XvcInfo { version: (1, 0), max_vector_len: 0 } };
        xvc.info = xvc.get_info()?;
        log::info!(
            "XVC server {}:{} v{}.{}, vectors up to {} bytes",
            host,
            port,
            xvc.info.version.0,
            xvc.info.version.1,
            xvc.info.max_vector_len
        );
        Ok(xvc)
    }

    pub fn info(&self) -> &XvcInfo {
        &self.info
    }

    fn get_info(&mut self) -> Result<XvcInfo> {
        self.stream.write_all(b"getinfo:").map_err(Error::transport)?;
        let mut reply = Vec::new();
        let mut byte = [0];
        while byte[0] != b'\n' {
            self.stream.read_exact(&mut byte).map_err(Error::transport)?;
            reply.push(byte[0]);
            if reply.len() > 64 {
                return Err(bad_reply(&reply));
            }
        }
        XvcInfo::parse(&reply)
    }
}

impl Cable for Xvc {
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        let mut tdo = BitWriter::with_capacity(bits);
        let step = self.info.max_vector_len * 8;
        let mut pos = 0;
        while pos < bits {
            let len = step.min(bits - pos);
            let msg = encode_shift(len, &extract(tms, pos, len), &extract(tdi, pos, len));
            self.stream.write_all(&msg).map_err(Error::transport)?;
            let mut out = vec![0; bytes_for(len)];
            self.stream.read_exact(&mut out).map_err(Error::transport)?;
            tdo.push_bits(&out, len);
            pos += len;
        }
        Ok(if capture { tdo.into_inner() } else { Vec::new() })
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        let mut msg = b"settck:".to_vec();
        msg.extend_from_slice(&period_ns(freq).to_le_bytes());
        self.stream.write_all(&msg).map_err(Error::transport)?;
        let mut reply = [0; 4];
        self.stream.read_exact(&mut reply).map_err(Error::transport)?;
        let period = u32::from_le_bytes(reply).max(1);
        Ok(1_000_000_000 / period)
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }
}
