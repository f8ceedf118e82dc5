//! Cable and pin configuration handed in by whoever resolved the board and cable tables.
use alloc::string::String;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const FTDI_VID: u16 = 0x0403;
pub const FT232R_PID: u16 = 0x6001;
pub const FT2232H_PID: u16 = 0x6010;
pub const FT4232H_PID: u16 = 0x6011;
pub const FT232H_PID: u16 = 0x6014;
pub const JLINK_VID: u16 = 0x1366;
pub const JLINK_PID: u16 = 0x0105;

/// DBUS0..7 then CBUS0..7 as GPIO masks
pub const DBUS0: u16 = 1 << 0;
pub const DBUS1: u16 = 1 << 1;
pub const DBUS2: u16 = 1 << 2;
pub const DBUS3: u16 = 1 << 3;
pub const DBUS4: u16 = 1 << 4;
pub const DBUS5: u16 = 1 << 5;
pub const DBUS6: u16 = 1 << 6;
pub const DBUS7: u16 = 1 << 7;
pub const CBUS0: u16 = 1 << 8;
pub const CBUS1: u16 = 1 << 9;
pub const CBUS2: u16 = 1 << 10;
pub const CBUS3: u16 = 1 << 11;
pub const CBUS4: u16 = 1 << 12;
pub const CBUS5: u16 = 1 << 13;
pub const CBUS6: u16 = 1 << 14;
pub const CBUS7: u16 = 1 << 15;

pub const fn pin_mask(pin: u8) -> u16 {
    1 << pin
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
    pub bus: Option<u8>,
    pub address: Option<u8>,
    pub serial: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Transport {
    Usb(UsbId),
    Tcp { host: String, port: u16 },
}

/// FTDI interface on multi-channel parts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Channel {
    #[default]
    A,
    B,
    C,
    D,
}

impl Channel {
    pub fn letter(&self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
            Channel::C => 'C',
            Channel::D => 'D',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CableMode {
    /// JTAG through the FTDI MPSSE engine
    JtagMpsse,
    /// JTAG by toggling pins in synchronous bitbang mode
    JtagBitbang,
    /// JTAG through the adapter's own protocol (J-Link, XVC)
    JtagNative,
    /// SPI master, chip select driven around each transfer
    Spi,
}

impl CableMode {
    pub fn is_jtag(&self) -> bool {
        !matches!(self, CableMode::Spi)
    }
}

/// How to reach the adapter.  Built once with the `with_*` methods and read through accessors.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CableConfig {
    transport: Transport,
    channel: Channel,
    mode: CableMode,
    status_pin: Option<u16>,
    frequency: u32,
}

impl CableConfig {
    pub const DEFAULT_FREQUENCY: u32 = 6_000_000;

    pub fn usb(vid: u16, pid: u16, mode: CableMode) -> Self {
        Self {
            transport: Transport::Usb(UsbId { vid, pid, bus: None, address: None, serial: None }),
            channel: Channel::A,
            mode,
            status_pin: None,
            frequency: Self::DEFAULT_FREQUENCY,
        }
    }

    /// An XVC server
    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            transport: Transport::Tcp { host: host.into(), port },
            channel: Channel::A,
            mode: CableMode::JtagNative,
            status_pin: None,
            frequency: Self::DEFAULT_FREQUENCY,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        if let Transport::Usb(id) = &mut self.transport {
            id.serial = Some(serial.into());
        }
        self
    }

    pub fn with_bus_address(mut self, bus: u8, address: u8) -> Self {
        if let Transport::Usb(id) = &mut self.transport {
            id.bus = Some(bus);
            id.address = Some(address);
        }
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_status_pin(mut self, mask: u16) -> Self {
        self.status_pin = Some(mask);
        self
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn mode(&self) -> CableMode {
        self.mode
    }

    pub fn status_pin(&self) -> Option<u16> {
        self.status_pin
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }
}

/// Pin-bit indices of the JTAG signals on the adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JtagPins {
    pub tms: u8,
    pub tck: u8,
    pub tdi: u8,
    pub tdo: u8,
}

impl JtagPins {
    /// Fixed MPSSE layout
    pub const MPSSE: JtagPins = JtagPins { tck: 0, tdi: 1, tdo: 2, tms: 3 };
    /// Common FT232R bitbang wiring: TXD=TCK, RXD=TDI, RTS=TDO, CTS=TMS
    pub const FT232R: JtagPins = JtagPins { tck: 0, tdi: 1, tdo: 2, tms: 3 };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpiPins {
    pub cs: u8,
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub hold: Option<u8>,
    pub wp: Option<u8>,
}

impl SpiPins {
    pub const MPSSE: SpiPins = SpiPins { sck: 0, mosi: 1, miso: 2, cs: 3, hold: None, wp: None };
    /// iCE40 development boards: CS on DBUS4
    pub const ICE40: SpiPins = SpiPins { sck: 0, mosi: 1, miso: 2, cs: 4, hold: None, wp: None };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PinMapping {
    Jtag(JtagPins),
    Spi(SpiPins),
}

impl PinMapping {
    pub fn jtag(&self) -> Option<&JtagPins> {
        match self {
            PinMapping::Jtag(pins) => Some(pins),
            PinMapping::Spi(_) => None,
        }
    }

    pub fn spi(&self) -> Option<&SpiPins> {
        match self {
            PinMapping::Spi(pins) => Some(pins),
            PinMapping::Jtag(_) => None,
        }
    }
}
