//! Configuration image containers: raw binaries, Xilinx and Lattice `.bit` files and Intel-HEX
//! `.mcs` flash images.  Parsing yields the payload exactly as it should be written, plus any
//! header fields as metadata.
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::bits::reverse_bytes;
use crate::error::{Error, Result};

const XILINX: &str = "Xilinx bit";
const LATTICE: &str = "Lattice bit";
const MCS: &str = "MCS";

/// Lattice preambles, plain and with the encrypted-bitstream flag
const LATTICE_PREAMBLE: [u8; 4] = [0xff, 0xff, 0xbd, 0xb3];
const LATTICE_PREAMBLE_ENC: [u8; 4] = [0xff, 0xff, 0xbf, 0xb3];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Raw,
    XilinxBit,
    LatticeBit,
    Mcs,
    /// Decide from the file name and contents
    Auto,
}

/// Guess the container from `name`'s extension, falling back to the first bytes of `raw`
pub fn detect_format(name: Option<&str>, raw: &[u8]) -> Format {
    let ext = name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("bit") if raw.starts_with(&[0x00, 0x09]) => Format::XilinxBit,
        Some("bit") => Format::LatticeBit,
        Some("mcs") | Some("hex") => Format::Mcs,
        Some("bin") | Some("img") | Some("raw") => Format::Raw,
        _ if raw.starts_with(&[0x00, 0x09, 0x0f, 0xf0]) => Format::XilinxBit,
        _ if raw.starts_with(&[0xff, 0x00]) => Format::LatticeBit,
        _ if raw.first() == Some(&b':') => Format::Mcs,
        _ => Format::Raw,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitstream {
    format: Format,
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl Bitstream {
    /// Decode `raw`.  With `reverse` every payload byte is bit-reversed, for targets that shift
    /// the image LSB first.
    pub fn parse(format: Format, raw: &[u8], reverse: bool) -> Result<Self> {
        let format = match format {
            Format::Auto => detect_format(None, raw),
            f => f,
        };
        let mut metadata = BTreeMap::new();
        let payload = match format {
            Format::Raw | Format::Auto => raw.to_vec(),
            Format::XilinxBit => parse_xilinx(raw, &mut metadata)?,
            Format::LatticeBit => parse_lattice(raw, &mut metadata)?,
            Format::Mcs => parse_mcs(raw, &mut metadata)?,
        };
        log::debug!("{:?} image, {} payload bytes", format, payload.len());
        let payload = if reverse { reverse_bytes(&payload) } else { payload };
        Ok(Self { format, payload, metadata })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn length_bits(&self) -> usize {
        self.payload.len() * 8
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    format: &'static str,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::format(
                self.format,
                format!("truncated at byte {} (wanted {} more)", self.pos, n),
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn field_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_xilinx(raw: &[u8], metadata: &mut BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut r = Reader { data: raw, pos: 0, format: XILINX };
    let preamble = r.u16()? as usize;
    r.take(preamble)?;
    if r.u16()? != 1 {
        return Err(Error::format(XILINX, "missing field count after preamble"));
    }
    loop {
        let key = r.u8()?;
        match key {
            b'a' | b'b' | b'c' | b'd' => {
                let len = r.u16()? as usize;
                let text = field_text(r.take(len)?);
                let name = match key {
                    b'a' => "design",
                    b'b' => "part",
                    b'c' => "date",
                    _ => "time",
                };
                if key == b'a' {
                    // "top;UserID=0XFFFFFFFF;Version=2020.2"
                    let mut parts = text.split(';');
                    if let Some(design) = parts.next() {
                        metadata.insert(name.to_string(), design.to_string());
                    }
                    for kv in parts {
                        if let Some((k, v)) = kv.split_once('=') {
                            metadata.insert(k.to_string(), v.to_string());
                        }
                    }
                } else {
                    metadata.insert(name.to_string(), text);
                }
            }
            b'e' => {
                let len = r.u32()? as usize;
                let payload = r.take(len)?;
                return Ok(payload.to_vec());
            }
            k => return Err(Error::format(XILINX, format!("unknown header field 0x{:02x}", k))),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_lattice(raw: &[u8], metadata: &mut BTreeMap<String, String>) -> Result<Vec<u8>> {
    let mut start = 0;
    if raw.starts_with(&[0xff, 0x00]) {
        let end = find(&raw[2..], &[0x00, 0xff])
            .map(|i| i + 2)
            .ok_or_else(|| Error::format(LATTICE, "comment block not terminated"))?;
        for (i, comment) in raw[2..end].split(|&b| b == 0).filter(|c| !c.is_empty()).enumerate() {
            let text = String::from_utf8_lossy(comment);
            match text.split_once(": ") {
                Some((k, v)) => metadata.insert(k.trim().to_string(), v.trim().to_string()),
                None => metadata.insert(format!("comment{}", i), text.into_owned()),
            };
        }
        // The terminator's 0xFF is the first padding byte of the bitstream
        start = end + 1;
    }
    let payload = &raw[start..];
    if find(payload, &LATTICE_PREAMBLE).is_none() {
        if find(payload, &LATTICE_PREAMBLE_ENC).is_none() {
            return Err(Error::format(LATTICE, "no preamble"));
        }
        metadata.insert("encrypted".to_string(), "yes".to_string());
    }
    Ok(payload.to_vec())
}

fn hex_bytes(line: &str, lineno: usize) -> Result<Vec<u8>> {
    let bad = || Error::format(MCS, format!("line {}: bad hex record", lineno));
    if line.len() % 2 != 0 || !line.is_ascii() {
        return Err(bad());
    }
    (0..line.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&line[i..i + 2], 16).map_err(|_| bad()))
        .collect()
}

/// Largest address span an MCS image may cover, the size of the biggest supported flash
pub const MAX_MCS_SPAN: usize = 256 << 20;

fn parse_mcs(raw: &[u8], metadata: &mut BTreeMap<String, String>) -> Result<Vec<u8>> {
    let text = core::str::from_utf8(raw).map_err(|_| Error::format(MCS, "not text"))?;
    let mut base = 0u32;
    let mut records: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut eof = false;

    for (n, line) in text.lines().enumerate() {
        let lineno = n + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| Error::format(MCS, format!("line {}: missing ':'", lineno)))?;
        let bytes = hex_bytes(body, lineno)?;
        if bytes.len() < 5 || bytes.len() != 5 + bytes[0] as usize {
            return Err(Error::format(MCS, format!("line {}: length mismatch", lineno)));
        }
        if bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) != 0 {
            return Err(Error::format(MCS, format!("line {}: bad checksum", lineno)));
        }
        let addr = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        match bytes[3] {
            0x00 => records.push((base + addr, bytes[4..bytes.len() - 1].to_vec())),
            0x01 => {
                eof = true;
                break;
            }
            0x04 if bytes[0] == 2 => base = (u16::from_be_bytes([bytes[4], bytes[5]]) as u32) << 16,
            t => return Err(Error::format(MCS, format!("line {}: unsupported record type {:02x}", lineno, t))),
        }
    }
    if !eof {
        return Err(Error::format(MCS, "no end-of-file record"));
    }

    let Some(start) = records.iter().map(|(a, _)| *a).min() else {
        return Ok(Vec::new());
    };
    let end = records.iter().map(|(a, d)| *a as usize + d.len()).max().unwrap_or(start as usize);
    if end - start as usize > MAX_MCS_SPAN {
        return Err(Error::format(MCS, format!("records span 0x{:x} bytes", end - start as usize)));
    }
    let mut image = vec![0xff; end - start as usize];
    for (addr, data) in &records {
        let off = (addr - start) as usize;
        image[off..off + data.len()].copy_from_slice(data);
    }
    metadata.insert("base_address".to_string(), format!("0x{:08x}", start));
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(out: &mut Vec<u8>, key: u8, value: &str) {
        out.push(key);
        out.extend_from_slice(&((value.len() + 1) as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }

    fn xilinx_bit(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x09, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x00, 0x00, 0x01];
        tlv(&mut out, b'a', "top;UserID=0XFFFFFFFF;Version=2020.2");
        tlv(&mut out, b'b', "7a35tcsg324");
        tlv(&mut out, b'c', "2024/01/01");
        tlv(&mut out, b'd', "12:00:00");
        out.push(b'e');
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn xilinx_header_fields() {
        let raw = xilinx_bit(&[0xaa, 0x99, 0x55, 0x66]);
        let bs = Bitstream::parse(Format::Auto, &raw, false).unwrap();
        assert_eq!(bs.format(), Format::XilinxBit);
        assert_eq!(bs.payload(), &[0xaa, 0x99, 0x55, 0x66]);
        assert_eq!(bs.length_bits(), 32);
        assert_eq!(bs.metadata()["design"], "top");
        assert_eq!(bs.metadata()["part"], "7a35tcsg324");
        assert_eq!(bs.metadata()["Version"], "2020.2");

        let reversed = Bitstream::parse(Format::XilinxBit, &raw, true).unwrap();
        assert_eq!(reversed.payload(), &[0x55, 0x99, 0xaa, 0x66]);
    }

    #[test]
    fn xilinx_truncated_payload_is_rejected() {
        let mut raw = xilinx_bit(&[0; 16]);
        raw.truncate(raw.len() - 1);
        assert!(matches!(Bitstream::parse(Format::XilinxBit, &raw, false), Err(Error::Format { .. })));
        assert!(matches!(Bitstream::parse(Format::XilinxBit, &raw[..5], false), Err(Error::Format { .. })));
    }

    #[test]
    fn lattice_comments_and_preamble() {
        let mut raw = vec![0xff, 0x00];
        raw.extend_from_slice(b"Part: LFE5U-25F-6CABGA256\0Lattice Diamond\0");
        raw.extend_from_slice(&[0xff, 0xff, 0xff, 0xbd, 0xb3, 0x01]);
        let bs = Bitstream::parse(Format::Auto, &raw, false).unwrap();
        assert_eq!(bs.format(), Format::LatticeBit);
        assert_eq!(bs.metadata()["Part"], "LFE5U-25F-6CABGA256");
        assert_eq!(bs.metadata()["comment1"], "Lattice Diamond");
        assert_eq!(bs.payload(), &[0xff, 0xff, 0xff, 0xbd, 0xb3, 0x01]);

        let bad = [0xff, 0x00, b'x', 0x00, 0xff, 0x12, 0x34];
        assert!(matches!(Bitstream::parse(Format::LatticeBit, &bad, false), Err(Error::Format { .. })));
    }

    #[test]
    fn mcs_fills_gaps_and_follows_extended_address() {
        let raw = b":020000040001F9\n\
                    :04000000DEADBEEFC4\n\
                    :020006001234B2\n\
                    :00000001FF\n";
        let bs = Bitstream::parse(Format::Mcs, raw, false).unwrap();
        assert_eq!(bs.payload(), &[0xde, 0xad, 0xbe, 0xef, 0xff, 0xff, 0x12, 0x34]);
        assert_eq!(bs.metadata()["base_address"], "0x00010000");
    }

    #[test]
    fn mcs_rejects_bad_checksum_and_missing_eof() {
        let bad_sum = b":04000000DEADBEEFC5\n:00000001FF\n";
        assert!(matches!(Bitstream::parse(Format::Mcs, bad_sum, false), Err(Error::Format { .. })));
        let no_eof = b":04000000DEADBEEFC4\n";
        assert!(matches!(Bitstream::parse(Format::Mcs, no_eof, false), Err(Error::Format { .. })));
        let not_hex = b":0400zz00DEADBEEFC4\n:00000001FF\n";
        assert!(matches!(Bitstream::parse(Format::Mcs, not_hex, false), Err(Error::Format { .. })));
    }

    #[test]
    fn mcs_span_is_bounded() {
        let sparse = b":0100000000FF\n\
                       :02000004FFFFFC\n\
                       :0100000000FF\n\
                       :00000001FF\n";
        assert!(matches!(Bitstream::parse(Format::Mcs, sparse, false), Err(Error::Format { .. })));
    }

    #[test]
    fn format_detection() {
        assert_eq!(detect_format(Some("top.bit"), &[0x00, 0x09]), Format::XilinxBit);
        assert_eq!(detect_format(Some("top.BIT"), &[0xff, 0x00]), Format::LatticeBit);
        assert_eq!(detect_format(Some("flash.mcs"), b":00"), Format::Mcs);
        assert_eq!(detect_format(Some("ice40.bin"), &[0xff, 0x00]), Format::Raw);
        assert_eq!(detect_format(None, &[0x7e, 0xaa, 0x99, 0x7e]), Format::Raw);
    }
}
