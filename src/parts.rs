//! Built-in table of JTAG parts, keyed by IDCODE.  Version bits are masked where the vendor
//! revises silicon without changing the device.
#[cfg(feature = "serde")]
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Family {
    Ice40,
    Ecp5,
    Xilinx7,
    /// Anything that is not a configurable FPGA: debug ports, CPLDs, MCUs
    Other,
}

impl Family {
    pub fn is_fpga(&self) -> bool {
        !matches!(self, Family::Other)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Part {
    pub idcode: u32,
    pub mask: u32,
    pub manufacturer: &'static str,
    pub family: Family,
    pub model: &'static str,
    pub ir_len: usize,
    /// The instruction selecting the IDCODE register, loaded at Test-Logic-Reset
    pub idcode_instruction: u32,
}

impl Part {
    pub fn matches(&self, idcode: u32) -> bool {
        idcode & self.mask == self.idcode & self.mask
    }
}

const fn ecp5(idcode: u32, model: &'static str) -> Part {
    Part { idcode, mask: 0xffff_ffff, manufacturer: "lattice", family: Family::Ecp5, model, ir_len: 8, idcode_instruction: 0xe0 }
}

const fn xilinx7(idcode: u32, model: &'static str) -> Part {
    Part { idcode, mask: 0x0fff_ffff, manufacturer: "xilinx", family: Family::Xilinx7, model, ir_len: 6, idcode_instruction: 0x09 }
}

pub static PARTS: &[Part] = &[
    ecp5(0x2111_1043, "LFE5U-12"),
    ecp5(0x4111_1043, "LFE5U-25"),
    ecp5(0x4111_2043, "LFE5U-45"),
    ecp5(0x4111_3043, "LFE5U-85"),
    ecp5(0x0111_1043, "LFE5UM-25"),
    ecp5(0x0111_2043, "LFE5UM-45"),
    ecp5(0x0111_3043, "LFE5UM-85"),
    ecp5(0x8111_1043, "LFE5UM5G-25"),
    ecp5(0x8111_2043, "LFE5UM5G-45"),
    ecp5(0x8111_3043, "LFE5UM5G-85"),
    xilinx7(0x0362_2093, "XC7S6"),
    xilinx7(0x0362_0093, "XC7S15"),
    xilinx7(0x037c_4093, "XC7S25"),
    xilinx7(0x0362_f093, "XC7S50"),
    xilinx7(0x037c_8093, "XC7S75"),
    xilinx7(0x037c_7093, "XC7S100"),
    xilinx7(0x0362_e093, "XC7A15T"),
    xilinx7(0x037c_2093, "XC7A25T"),
    xilinx7(0x0362_d093, "XC7A35T"),
    xilinx7(0x0362_c093, "XC7A50T"),
    xilinx7(0x0363_2093, "XC7A75T"),
    xilinx7(0x0363_1093, "XC7A100T"),
    xilinx7(0x0363_6093, "XC7A200T"),
    xilinx7(0x0364_c093, "XC7K160T"),
    xilinx7(0x0365_1093, "XC7K325T"),
    xilinx7(0x0372_2093, "XC7Z010"),
    xilinx7(0x0372_7093, "XC7Z020"),
    Part {
        idcode: 0x4ba0_0477,
        mask: 0x0fff_ffff,
        manufacturer: "arm",
        family: Family::Other,
        model: "CoreSight JTAG-DP",
        ir_len: 4,
        idcode_instruction: 0x0e,
    },
];

/// Find the built-in part for `idcode`
pub fn lookup(idcode: u32) -> Option<&'static Part> {
    PARTS.iter().find(|p| p.matches(idcode))
}

/// One position of a scanned chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ChainEntry {
    /// Zero for a device that only exposes BYPASS
    pub idcode: u32,
    pub part: Option<&'static Part>,
    pub ir_len: usize,
}

impl ChainEntry {
    pub fn family(&self) -> Family {
        self.part.map_or(Family::Other, |p| p.family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_nibble_ignored_for_xilinx() {
        let part = lookup(0x1362_d093).unwrap();
        assert_eq!(part.model, "XC7A35T");
        assert_eq!(part.ir_len, 6);
    }

    #[test]
    fn ecp5_needs_exact_match() {
        assert_eq!(lookup(0x4111_3043).map(|p| p.model), Some("LFE5U-85"));
        assert!(lookup(0x5111_3043).is_none());
        assert!(!lookup(0x4ba0_0477).unwrap().family.is_fpga());
    }
}
