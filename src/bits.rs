//! LSB-first bit buffers.  Bit `i` of a buffer lives at `(buf[i / 8] >> (i % 8)) & 1`.
use alloc::vec;
use alloc::vec::Vec;

pub fn bytes_for(bits: usize) -> usize {
    (bits + 7) / 8
}

pub fn get_bit(buf: &[u8], i: usize) -> bool {
    buf.get(i / 8).map_or(false, |b| (b >> (i % 8)) & 1 != 0)
}

pub fn set_bit(buf: &mut [u8], i: usize, value: bool) {
    let mask = 1 << (i % 8);
    if value {
        buf[i / 8] |= mask;
    } else {
        buf[i / 8] &= !mask;
    }
}

/// Copy `len` bits starting at bit `start` into a new buffer
pub fn extract(buf: &[u8], start: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0; bytes_for(len)];
    if start % 8 == 0 {
        let first = start / 8;
        let end = (first + out.len()).min(buf.len());
        if first < end {
            out[..end - first].copy_from_slice(&buf[first..end]);
        }
        if len % 8 != 0 {
            if let Some(last) = out.last_mut() {
                *last &= (1 << (len % 8)) - 1;
            }
        }
        return out;
    }
    for i in 0..len {
        if get_bit(buf, start + i) {
            set_bit(&mut out, i, true);
        }
    }
    out
}

pub fn reverse_bytes(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b.reverse_bits()).collect()
}

/// Read `len` bits starting at `start` as an integer, first bit in the LSB
pub fn to_u64(buf: &[u8], start: usize, len: usize) -> u64 {
    let mut value = 0;
    for i in 0..len.min(64) {
        if get_bit(buf, start + i) {
            value |= 1 << i;
        }
    }
    value
}

/// Growable bit buffer, filled in shift order
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self { buf: Vec::with_capacity(bytes_for(bits)), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: bool) {
        if self.len % 8 == 0 {
            self.buf.push(0);
        }
        if value {
            let idx = self.len / 8;
            self.buf[idx] |= 1 << (self.len % 8);
        }
        self.len += 1;
    }

    pub fn push_repeat(&mut self, value: bool, count: usize) {
        if self.len % 8 == 0 {
            let bytes = count / 8;
            self.buf.resize(self.buf.len() + bytes, if value { 0xff } else { 0 });
            self.len += bytes * 8;
            for _ in 0..count % 8 {
                self.push(value);
            }
            return;
        }
        for _ in 0..count {
            self.push(value);
        }
    }

    /// Append the first `count` bits of `src`
    pub fn push_bits(&mut self, src: &[u8], count: usize) {
        if self.len % 8 == 0 {
            let bytes = count / 8;
            self.buf.extend_from_slice(&src[..bytes]);
            self.len += bytes * 8;
            for i in bytes * 8..count {
                self.push(get_bit(src, i));
            }
            return;
        }
        for i in 0..count {
            self.push(get_bit(src, i));
        }
    }

    /// Append the low `count` bits of `value`, LSB first
    pub fn push_u64(&mut self, value: u64, count: usize) {
        for i in 0..count {
            self.push((value >> i) & 1 != 0);
        }
    }

    /// Append a byte MSB first, the order SPI puts bits on the wire
    pub fn push_byte_msb(&mut self, byte: u8) {
        for i in (0..8).rev() {
            self.push((byte >> i) & 1 != 0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_mixes_aligned_and_unaligned() {
        let mut w = BitWriter::new();
        w.push(true);
        w.push_repeat(false, 3);
        w.push_bits(&[0xff], 4);
        w.push_repeat(true, 9);
        assert_eq!(w.len(), 17);
        assert_eq!(w.as_slice(), &[0xf1, 0xff, 0x01]);
    }

    #[test]
    fn extract_unaligned_window() {
        let buf = [0b1010_0000, 0b0000_0011];
        assert_eq!(extract(&buf, 5, 5), vec![0b11101]);
        assert_eq!(extract(&buf, 8, 2), vec![0b11]);
        assert_eq!(to_u64(&buf, 5, 5), 0b11101);
    }

    #[test]
    fn msb_push_matches_reversed_byte() {
        let mut w = BitWriter::new();
        w.push_byte_msb(0x9f);
        assert_eq!(w.as_slice(), &reverse_bytes(&[0x9f])[..]);
    }
}
