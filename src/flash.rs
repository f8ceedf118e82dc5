//! SPI NOR flash commands (the JEDEC "25-series" set) over any `SpiBus`.  The bus is either a
//! cable in SPI mode (`CableSpi`) or a tunnel through an FPGA (`device::bridge::JtagSpiBridge`).
use alloc::format;
use alloc::vec::Vec;
use core::time::Duration;

use bitflags::bitflags;

use crate::cable::Cable;
use crate::error::{Error, Result, Step};

pub const CMD_WRSR: u8 = 0x01;
pub const CMD_PP: u8 = 0x02;
pub const CMD_READ: u8 = 0x03;
pub const CMD_RDSR: u8 = 0x05;
pub const CMD_WREN: u8 = 0x06;
pub const CMD_SE: u8 = 0x20;
pub const CMD_RDID: u8 = 0x9f;
pub const CMD_CE: u8 = 0xc7;
pub const CMD_BE: u8 = 0xd8;
pub const CMD_PP4: u8 = 0x12;
pub const CMD_READ4: u8 = 0x13;
pub const CMD_SE4: u8 = 0x21;
pub const CMD_BE4: u8 = 0xdc;

pub const PAGE_TIMEOUT: Duration = Duration::from_millis(50);
pub const SECTOR_TIMEOUT: Duration = Duration::from_secs(1);
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(3);
pub const CHIP_TIMEOUT: Duration = Duration::from_secs(200);
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

// Bytes per READ command, small enough for one bridge transaction
const READ_CHUNK: usize = 4096;

bitflags! {
    /// Status register 1
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Write in progress
        const WIP = 1 << 0;
        /// Write enable latch
        const WEL = 1 << 1;
        const BP0 = 1 << 2;
        const BP1 = 1 << 3;
        const BP2 = 1 << 4;
        /// Block protect counts from the bottom of the array
        const TB = 1 << 5;
        /// Sector (4 KiB) instead of block protect granularity on some parts
        const SEC = 1 << 6;
        /// Status register write disable, honoured while /WP is low
        const SRWD = 1 << 7;

        const BP = Self::BP0.bits() | Self::BP1.bits() | Self::BP2.bits();
        /// Every bit `set_protection`/`clear_protection` may touch
        const PROTECTION = Self::BP.bits() | Self::TB.bits() | Self::SEC.bits() | Self::SRWD.bits();
    }
}

impl Status {
    /// The 3-bit block protect level
    pub fn bp_level(&self) -> u8 {
        (self.bits() >> 2) & 7
    }

    /// The protected `(start, len)` byte range on a part of `capacity` bytes, if any
    pub fn protected_range(&self, capacity: u32) -> Option<(u32, u32)> {
        let level = self.bp_level();
        if level == 0 {
            return None;
        }
        let len = if level == 7 { capacity } else { ((capacity / 64) << (level - 1)).min(capacity) };
        if self.contains(Status::TB) {
            Some((0, len))
        } else {
            Some((capacity - len, len))
        }
    }
}

/// Sizes of a flash part, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    pub capacity: u32,
    pub page_size: u32,
    pub sector_size: u32,
    pub block_size: u32,
}

impl Default for FlashGeometry {
    fn default() -> Self {
        Self { capacity: 16 << 20, page_size: 256, sector_size: 4096, block_size: 65536 }
    }
}

impl FlashGeometry {
    /// Standard 25-series layout sized by the JEDEC capacity byte (log2 of the size in bytes)
    pub fn from_jedec(id: [u8; 3]) -> Option<Self> {
        let code = id[2];
        if !(16..=28).contains(&code) {
            return None;
        }
        Some(Self { capacity: 1 << code, ..Self::default() })
    }

    /// Above 16 MiB a 3-byte address can't reach the whole array
    pub fn four_byte_addressing(&self) -> bool {
        self.capacity > 1 << 24
    }
}

/// A byte range known to fit inside the flash
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashRegion {
    pub offset: u32,
    pub len: usize,
}

impl FlashRegion {
    pub fn new(offset: u32, len: usize, capacity: u32) -> Result<Self> {
        let end = offset as usize + len;
        if end > capacity as usize {
            return Err(Error::Range { what: "flash address", index: end, limit: capacity as usize });
        }
        Ok(Self { offset, len })
    }

    pub fn end(&self) -> u32 {
        self.offset + self.len as u32
    }
}

/// Byte-level SPI master with chip select framing each `transfer`
pub trait SpiBus {
    /// Full duplex: returns as many bytes as were written
    fn transfer(&mut self, write: &[u8]) -> Result<Vec<u8>>;

    fn delay_us(&mut self, us: u32);
}

/// A cable used in SPI mode
pub struct CableSpi<T> {
    cable: T,
}

impl<T> CableSpi<T> {
    pub fn new(cable: T) -> Self {
        Self { cable }
    }

    pub fn release(self) -> T {
        self.cable
    }
}

impl<T, U> CableSpi<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// The underlying cable, for the GPIO lines next to the SPI pins
    pub fn cable(&mut self) -> &mut U {
        &mut self.cable
    }
}

impl<T, U> SpiBus for CableSpi<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    fn transfer(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        self.cable.spi_transfer(write)
    }

    fn delay_us(&mut self, us: u32) {
        self.cable.delay_us(us)
    }
}

fn four_byte_opcode(op: u8) -> u8 {
    match op {
        CMD_READ => CMD_READ4,
        CMD_PP => CMD_PP4,
        CMD_SE => CMD_SE4,
        CMD_BE => CMD_BE4,
        op => op,
    }
}

pub struct SpiFlash<B> {
    bus: B,
    geometry: FlashGeometry,
}

impl<B: SpiBus> SpiFlash<B> {
    /// A flash with the default geometry
    pub fn new(bus: B) -> Self {
        Self::with_geometry(bus, FlashGeometry::default())
    }

    pub fn with_geometry(bus: B, geometry: FlashGeometry) -> Self {
        Self { bus, geometry }
    }

    /// Read the JEDEC id and size the flash from it
    pub fn probe(bus: B) -> Result<Self> {
        let mut flash = Self::new(bus);
        flash.identify()?;
        Ok(flash)
    }

    /// Read the JEDEC id and update the geometry to match
    pub fn identify(&mut self) -> Result<[u8; 3]> {
        let id = self.read_jedec_id()?;
        if id == [0xff; 3] || id == [0; 3] {
            return Err(Error::Transport(format!("no SPI flash answered (JEDEC id {:02x?})", id)));
        }
        match FlashGeometry::from_jedec(id) {
            Some(geometry) => self.geometry = geometry,
            None => log::warn!("unknown capacity code in JEDEC id {:02x?}, assuming {} bytes", id, self.geometry.capacity),
        }
        log::info!("flash {:02x?}, {} KiB", id, self.geometry.capacity / 1024);
        Ok(id)
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    pub fn capacity(&self) -> u32 {
        self.geometry.capacity
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> B {
        self.bus
    }

    // Opcode and address, with the 4-byte opcode set on large parts
    fn command(&self, op: u8, addr: u32, extra: usize) -> Vec<u8> {
        let mut cmd = Vec::with_capacity(5 + extra);
        let addr = addr.to_be_bytes();
        if self.geometry.four_byte_addressing() {
            cmd.push(four_byte_opcode(op));
            cmd.extend_from_slice(&addr);
        } else {
            cmd.push(op);
            cmd.extend_from_slice(&addr[1..]);
        }
        cmd
    }

    pub fn read_jedec_id(&mut self) -> Result<[u8; 3]> {
        let rx = self.bus.transfer(&[CMD_RDID, 0, 0, 0])?;
        Ok([rx[1], rx[2], rx[3]])
    }

    pub fn read_status(&mut self) -> Result<u8> {
        let rx = self.bus.transfer(&[CMD_RDSR, 0])?;
        Ok(rx[1])
    }

    pub fn status(&mut self) -> Result<Status> {
        self.read_status().map(Status::from_bits_retain)
    }

    /// Log every status bit and return the register
    pub fn describe_status(&mut self) -> Result<Status> {
        let status = self.status()?;
        log::info!("flash status 0x{:02x}", status.bits());
        log::info!("  SRWD {}  SEC {}  TB {}", status.contains(Status::SRWD) as u8, status.contains(Status::SEC) as u8, status.contains(Status::TB) as u8);
        log::info!("  BP {}  WEL {}  WIP {}", status.bp_level(), status.contains(Status::WEL) as u8, status.contains(Status::WIP) as u8);
        if let Some((start, len)) = status.protected_range(self.capacity()) {
            log::info!("  protected 0x{:06x}..0x{:06x}", start, start + len);
        }
        Ok(status)
    }

    /// Send WREN and check the latch took
    pub fn write_enable(&mut self) -> Result<()> {
        self.bus.transfer(&[CMD_WREN])?;
        let status = self.status()?;
        if !status.contains(Status::WEL) {
            return Err(Error::Protected { status: status.bits() }).step("write enable");
        }
        Ok(())
    }

    /// Poll WIP until it clears.  The poll interval is a thousandth of `timeout`, kept between
    /// 10 us and 10 ms.
    pub fn wait_while_busy(&mut self, timeout: Duration) -> Result<()> {
        let timeout_us = timeout.as_micros().min(u32::MAX as u128) as u32;
        let interval = (timeout_us / 1000).clamp(10, 10_000);
        let polls = (timeout_us / interval).max(1);
        for _ in 0..polls {
            if !self.status()?.contains(Status::WIP) {
                return Ok(());
            }
            self.bus.delay_us(interval);
        }
        log::error!("flash still busy after {:?}", timeout);
        Err(Error::Timeout("flash write in progress"))
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<FlashRegion> {
        FlashRegion::new(addr, len, self.capacity())
    }

    fn check_unprotected(&mut self, addr: u32, len: usize) -> Result<()> {
        let status = self.status()?;
        if let Some((start, plen)) = status.protected_range(self.capacity()) {
            let end = addr as u64 + len as u64;
            if (addr as u64) < start as u64 + plen as u64 && end > start as u64 {
                return Err(Error::Protected { status: status.bits() });
            }
        }
        Ok(())
    }

    fn erase(&mut self, op: u8, addr: u32, size: u32, timeout: Duration) -> Result<()> {
        let addr = addr & !(size - 1);
        self.check_range(addr, size as usize)?;
        self.check_unprotected(addr, size as usize)?;
        log::trace!("erase {} KiB at 0x{:06x}", size / 1024, addr);
        self.write_enable()?;
        let cmd = self.command(op, addr, 0);
        self.bus.transfer(&cmd)?;
        self.wait_while_busy(timeout)
    }

    /// Erase the 4 KiB sector holding `addr`
    pub fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.erase(CMD_SE, addr, self.geometry.sector_size, SECTOR_TIMEOUT)
    }

    /// Erase the 64 KiB block holding `addr`
    pub fn erase_block(&mut self, addr: u32) -> Result<()> {
        self.erase(CMD_BE, addr, self.geometry.block_size, BLOCK_TIMEOUT)
    }

    /// Erase the whole array.  Refused while any block protect bit is set.
    pub fn erase_bulk(&mut self) -> Result<()> {
        let status = self.status()?;
        if status.intersects(Status::BP) {
            return Err(Error::Protected { status: status.bits() });
        }
        log::info!("erasing whole flash");
        self.write_enable()?;
        self.bus.transfer(&[CMD_CE])?;
        self.wait_while_busy(CHIP_TIMEOUT)
    }

    /// Program one page.  `addr` must be page aligned and `data` at most a page long.
    pub fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let page = self.geometry.page_size;
        if addr % page != 0 {
            return Err(Error::Alignment { addr, align: page });
        }
        if data.len() > page as usize {
            return Err(Error::Range { what: "page length", index: data.len(), limit: page as usize });
        }
        self.check_range(addr, data.len())?;
        self.check_unprotected(addr, data.len())?;
        self.write_page(addr, data)
    }

    // `data` must not cross a page boundary
    fn write_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        log::trace!("program {} bytes at 0x{:06x}", data.len(), addr);
        self.write_enable()?;
        let mut cmd = self.command(CMD_PP, addr, data.len());
        cmd.extend_from_slice(data);
        self.bus.transfer(&cmd)?;
        self.wait_while_busy(PAGE_TIMEOUT)
    }

    pub fn read_memory(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.check_range(addr, len)?;
        let mut data = Vec::with_capacity(len);
        let mut pos = addr;
        while data.len() < len {
            let n = READ_CHUNK.min(len - data.len());
            let mut cmd = self.command(CMD_READ, pos, n);
            let header = cmd.len();
            cmd.resize(header + n, 0);
            let rx = self.bus.transfer(&cmd)?;
            data.extend_from_slice(&rx[header..]);
            pos += n as u32;
        }
        Ok(data)
    }

    pub fn dump(&mut self, region: FlashRegion) -> Result<Vec<u8>> {
        log::info!("reading {} bytes from 0x{:06x}", region.len, region.offset);
        self.read_memory(region.offset, region.len)
    }

    /// Compare flash contents at `addr` with `expected`.  The reported offset is relative to
    /// `addr`.
    pub fn verify(&mut self, addr: u32, expected: &[u8]) -> Result<()> {
        let found = self.read_memory(addr, expected.len())?;
        match expected.iter().zip(&found).position(|(e, f)| e != f) {
            None => Ok(()),
            Some(i) => {
                log::error!("verify mismatch at 0x{:06x}", addr as usize + i);
                Err(Error::Verify { offset: i as u32, expected: expected[i], found: found[i] })
            }
        }
    }

    /// Write the status register and read it back
    pub fn write_status(&mut self, value: u8) -> Result<()> {
        self.write_enable()?;
        self.bus.transfer(&[CMD_WRSR, value])?;
        self.wait_while_busy(STATUS_TIMEOUT)?;
        let status = self.read_status()?;
        let wanted = Status::PROTECTION.bits();
        if status & wanted != value & wanted {
            return Err(Error::Protected { status }).step("write status");
        }
        Ok(())
    }

    /// Set the protection bits in `mask` (BP, TB, SEC, SRWD)
    pub fn set_protection(&mut self, mask: Status) -> Result<()> {
        let status = self.status()?;
        let value = (status & !Status::PROTECTION) | (mask & Status::PROTECTION);
        log::info!("protecting flash, status 0x{:02x}", value.bits());
        self.write_status(value.bits())
    }

    /// Clear the protection bits in `mask`
    pub fn clear_protection(&mut self, mask: Status) -> Result<()> {
        let status = self.status()?;
        let value = status & !(mask & Status::PROTECTION) & !(Status::WIP | Status::WEL);
        log::info!("unprotecting flash, status 0x{:02x}", value.bits());
        self.write_status(value.bits())
    }

    /// Erase every sector touching `[addr, addr + data.len())`, then program it page by page in
    /// ascending order.  With `verify`, each page is read back straight after it is written.
    pub fn erase_and_program(&mut self, addr: u32, data: &[u8], verify: bool) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let region = self.check_range(addr, data.len())?;
        self.check_unprotected(addr, data.len())?;

        let FlashGeometry { sector_size, block_size, page_size, .. } = self.geometry;
        let end = region.end().div_ceil(sector_size) * sector_size;
        let mut pos = addr & !(sector_size - 1);
        log::info!("erasing 0x{:06x}..0x{:06x}", pos, end);
        while pos < end {
            if pos % block_size == 0 && pos + block_size <= end {
                self.erase_block(pos)?;
                pos += block_size;
            } else {
                self.erase_sector(pos)?;
                pos += sector_size;
            }
        }

        log::info!("programming {} bytes at 0x{:06x}", data.len(), addr);
        let mut pos = addr;
        while pos < region.end() {
            let page_end = (pos / page_size + 1) * page_size;
            let chunk_end = page_end.min(region.end());
            let chunk = &data[(pos - addr) as usize..(chunk_end - addr) as usize];
            self.write_page(pos, chunk)?;
            if verify {
                self.verify(pos, chunk).map_err(|e| match e {
                    Error::Verify { offset, expected, found } => {
                        Error::Verify { offset: offset + pos - addr, expected, found }
                    }
                    e => e,
                })?;
            }
            pos = chunk_end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::cable::sim::{FlashOp, SimCable, SimFlash};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
    }

    #[test]
    fn probe_sizes_from_jedec_id() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20));
        let flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        assert_eq!(flash.capacity(), 1 << 20);
        assert_eq!(flash.geometry().page_size, 256);

        let mut empty = SimCable::new();
        assert!(matches!(SpiFlash::probe(CableSpi::new(&mut empty)), Err(Error::Transport(_))));
    }

    #[test]
    fn program_then_read_back() {
        for (addr, len) in [(0x1000u32, 256usize), (0x2000, 4096), (0x3456, 3 * 4096 + 77)] {
            let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20).with_contents(0x3000, &[0; 64]));
            let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
            let data = pattern(len);
            flash.erase_and_program(addr, &data, true).unwrap();
            assert_eq!(flash.read_memory(addr, len).unwrap(), data);
        }
    }

    #[test]
    fn erases_everything_before_programming() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        flash.erase_and_program(0xf000, &pattern(0x11001), false).unwrap();
        drop(flash);

        let log = sim.flash().unwrap().log();
        let erases: Vec<&FlashOp> = log.iter().take_while(|op| matches!(op, FlashOp::Erase { .. })).collect();
        assert_eq!(
            erases,
            vec![
                &FlashOp::Erase { addr: 0xf000, len: 4096 },
                &FlashOp::Erase { addr: 0x10000, len: 65536 },
                &FlashOp::Erase { addr: 0x20000, len: 4096 },
            ]
        );
        // Pages go out in ascending order after the last erase
        let programs: Vec<u32> = log[erases.len()..]
            .iter()
            .map(|op| match op {
                FlashOp::Program { addr, .. } => *addr,
                op => panic!("unexpected {:?}", op),
            })
            .collect();
        assert_eq!(programs.len(), 0x111);
        assert!(programs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn misaligned_page_touches_nothing() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20));
        sim.fail_after(0);
        let mut flash = SpiFlash::new(CableSpi::new(&mut sim));
        assert!(matches!(flash.program_page(0x101, &[1, 2, 3]), Err(Error::Alignment { addr: 0x101, align: 256 })));
        drop(flash);
        assert!(sim.flash().unwrap().log().is_empty());
    }

    #[test]
    fn busy_wait_succeeds_or_times_out() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20).with_busy_polls(3));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        flash.erase_sector(0).unwrap();
        drop(flash);

        let mut stuck = SimCable::new().with_flash(SimFlash::new(1 << 20).stuck_busy());
        let mut flash = SpiFlash::new(CableSpi::new(&mut stuck));
        assert!(matches!(flash.wait_while_busy(Duration::from_millis(20)), Err(Error::Timeout(_))));
        drop(flash);
        assert_eq!(stuck.elapsed_us(), 20_000);
    }

    #[test]
    fn bulk_erase_refused_until_unprotected() {
        let flash = SimFlash::new(1 << 20).with_status(Status::BP.bits()).with_contents(0x100, &[0x55; 16]);
        let mut sim = SimCable::new().with_flash(flash);
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        assert!(matches!(flash.erase_bulk(), Err(Error::Protected { status: 0x1c })));
        assert_eq!(flash.read_memory(0x100, 1).unwrap(), vec![0x55]);
        assert!(matches!(flash.erase_and_program(0, &[1], false), Err(Error::Protected { .. })));

        flash.clear_protection(Status::PROTECTION).unwrap();
        flash.erase_bulk().unwrap();
        assert!(flash.read_memory(0, 1 << 20).unwrap().iter().all(|&b| b == 0xff));
    }

    #[test]
    fn protection_round_trip() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        flash.set_protection(Status::BP0 | Status::TB).unwrap();
        let status = flash.describe_status().unwrap();
        assert_eq!(status.protected_range(1 << 20), Some((0, 16 << 10)));
        assert!(matches!(flash.erase_sector(0x1000), Err(Error::Protected { .. })));
        flash.erase_sector(0x8000).unwrap();
    }

    #[test]
    fn verify_reports_relative_offset() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20).with_contents(0x2000, &[1, 2, 3, 4]));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        flash.verify(0x2000, &[1, 2, 3, 4]).unwrap();
        match flash.verify(0x2000, &[1, 2, 9, 4]) {
            Err(Error::Verify { offset: 2, expected: 9, found: 3 }) => (),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn large_parts_use_four_byte_addresses() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(32 << 20).with_contents(0, &[0x11; 4]));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        assert!(flash.geometry().four_byte_addressing());
        flash.erase_and_program(0x100_0000, &[0xa5; 4], true).unwrap();
        assert_eq!(flash.read_memory(0x100_0000, 4).unwrap(), vec![0xa5; 4]);
        drop(flash);

        let flash = sim.flash().unwrap();
        assert_eq!(&flash.memory()[..4], &[0x11; 4]);
        assert_eq!(&flash.memory()[0x100_0000..0x100_0004], &[0xa5; 4]);
        assert_eq!(flash.log()[0], FlashOp::Erase { addr: 0x100_0000, len: 4096 });
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 16));
        let mut flash = SpiFlash::probe(CableSpi::new(&mut sim)).unwrap();
        assert!(matches!(flash.read_memory(0xff00, 0x200), Err(Error::Range { .. })));
        assert!(matches!(flash.erase_and_program(0x10000, &[0], false), Err(Error::Range { .. })));
        assert!(FlashRegion::new(0, 1 << 16, 1 << 16).is_ok());
    }
}
