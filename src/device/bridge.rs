//! SPI flash behind an FPGA.  When the flash is not wired to the cable, the FPGA is first loaded
//! with something that routes a JTAG data register to the flash pins (a bridge bitstream, or a
//! built-in pass-through mode), every flash command then becomes one DR scan, and finally the
//! FPGA is reconfigured.
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::bits::{get_bit, reverse_bytes, BitWriter};
use crate::cable::Cable;
use crate::device::{ActionOutput, FlashAction};
use crate::error::{Error, Result, Step};
use crate::flash::SpiBus;
use crate::taps::Taps;

/// How SPI bytes are laid out in a DR scan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// TDI is MOSI and TDO is MISO in the same clock, chip select follows Shift-DR.  Bytes go
    /// MSB first.  Only usable when the FPGA is the only device on the chain.
    Direct,
    /// A start bit, a 16-bit byte count and the MOSI bytes, all MSB first, then padding while
    /// MISO drains.  MISO lags MOSI by one clock.  Leading zeros are ignored, so the bridge works
    /// behind any number of bypassed devices.
    Framed,
}

/// Largest transfer a `Framed` header can describe
pub const MAX_FRAMED_LEN: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    NotBridged,
    BridgeLoading,
    Bridged,
    FlashOp,
    Unloading,
}

/// Tracks whether the bridge is loaded and refuses out-of-order steps
#[derive(Clone, Debug)]
pub struct Bridge {
    state: BridgeState,
    trust_loaded: bool,
    skip_reset: bool,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self { state: BridgeState::NotBridged, trust_loaded: false, skip_reset: false }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Leave the bridge loaded after each flash operation and reuse it for the next one
    pub fn set_trust_loaded_bridge(&mut self, trust: bool) {
        self.trust_loaded = trust;
    }

    pub fn trust_loaded_bridge(&self) -> bool {
        self.trust_loaded
    }

    /// Leave the FPGA running the bridge when a flash call ends instead of reconfiguring it
    pub fn set_skip_reset(&mut self, skip: bool) {
        self.skip_reset = skip;
    }

    pub fn skip_reset(&self) -> bool {
        self.skip_reset
    }

    /// The FPGA was reset or reconfigured outside a flash call, so a loaded bridge is gone
    pub fn invalidate(&mut self) {
        if self.state == BridgeState::Bridged {
            log::debug!("bridge invalidated");
            self.state = BridgeState::NotBridged;
        }
    }

    fn go(&mut self, from: BridgeState, to: BridgeState) -> Result<()> {
        if self.state != from {
            log::error!("bridge is {:?}, cannot go from {:?} to {:?}", self.state, from, to);
            return Err(Error::Operation {
                step: "bridge",
                source: Box::new(Error::Unsupported("this bridge state transition")),
            });
        }
        log::debug!("bridge {:?} -> {:?}", from, to);
        self.state = to;
        Ok(())
    }

    /// Start a flash call.  Returns whether the bridge has to be loaded first.
    pub fn enter(&mut self) -> Result<bool> {
        if self.state == BridgeState::Bridged {
            log::info!("reusing loaded bridge");
            return Ok(false);
        }
        self.go(BridgeState::NotBridged, BridgeState::BridgeLoading)?;
        Ok(true)
    }

    /// Record the outcome of loading
    pub fn loaded(&mut self, ok: bool) -> Result<()> {
        let to = if ok { BridgeState::Bridged } else { BridgeState::NotBridged };
        self.go(BridgeState::BridgeLoading, to)
    }

    pub fn begin_op(&mut self) -> Result<()> {
        self.go(BridgeState::Bridged, BridgeState::FlashOp)
    }

    /// Finish the flash operation.  Returns whether the bridge should now be unloaded.
    pub fn end_op(&mut self) -> Result<bool> {
        self.go(BridgeState::FlashOp, BridgeState::Bridged)?;
        Ok(!self.trust_loaded)
    }

    pub fn leave(&mut self) -> Result<()> {
        self.go(BridgeState::Bridged, BridgeState::Unloading)
    }

    /// The FPGA has been told to reconfigure, whether or not that worked
    pub fn unloaded(&mut self) -> Result<()> {
        self.go(BridgeState::Unloading, BridgeState::NotBridged)
    }
}

/// A device that reaches its configuration flash through a bridge
pub(crate) trait BridgeHost {
    fn bridge(&mut self) -> &mut Bridge;
    fn load_bridge(&mut self) -> Result<()>;
    fn unload_bridge(&mut self) -> Result<()>;
    /// Run `action` against the flash while the bridge is loaded
    fn flash_action(&mut self, action: &FlashAction) -> Result<ActionOutput>;
}

/// Walk the bridge through load, operation and unload around `action`.  The bridge is unloaded
/// even when the operation fails; the operation's error wins over an unload error.
pub(crate) fn run_bridged<H: BridgeHost>(host: &mut H, action: &FlashAction) -> Result<ActionOutput> {
    if host.bridge().enter()? {
        log::info!("loading SPI bridge");
        let load = host.load_bridge();
        host.bridge().loaded(load.is_ok())?;
        load.step("load bridge")?;
    }
    host.bridge().begin_op()?;
    let result = host.flash_action(action);
    if host.bridge().end_op()? {
        host.bridge().leave()?;
        let unload = if host.bridge().skip_reset() {
            log::info!("leaving SPI bridge in place, no reset");
            Ok(())
        } else {
            log::info!("unloading SPI bridge");
            host.unload_bridge()
        };
        host.bridge().unloaded()?;
        let output = result?;
        unload.step("unload bridge")?;
        return Ok(output);
    }
    result
}

/// `SpiBus` over a JTAG data register of one device in the chain
pub struct JtagSpiBridge<'a, T> {
    taps: &'a mut Taps<T>,
    index: usize,
    instruction: Option<u8>,
    framing: Framing,
}

impl<'a, T, U> JtagSpiBridge<'a, T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// With `instruction`, the device at `index` is selected and the instruction loaded before
    /// the first transfer.  Without, the bridge register is assumed to be selected already.
    pub fn new(taps: &'a mut Taps<T>, index: usize, instruction: Option<u8>, framing: Framing) -> Self {
        Self { taps, index, instruction, framing }
    }

    fn select(&mut self) -> Result<()> {
        if let Some(instruction) = self.instruction.take() {
            let ir_len = self
                .taps
                .chain()
                .get(self.index)
                .map(|e| e.ir_len)
                .ok_or(Error::Range { what: "chain index", index: self.index, limit: self.taps.len() })?;
            self.taps.select_device(self.index)?;
            self.taps.shift_ir(&[instruction], ir_len)?;
        }
        Ok(())
    }

    fn transfer_direct(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        let captured = self.taps.shift_dr(&reverse_bytes(write), write.len() * 8)?;
        Ok(reverse_bytes(&captured))
    }

    fn transfer_framed(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        if write.len() > MAX_FRAMED_LEN {
            return Err(Error::Range { what: "bridge transfer length", index: write.len(), limit: MAX_FRAMED_LEN });
        }
        let latency = self.taps.len() - 1;
        let mut tdi = BitWriter::with_capacity(18 + 8 * write.len() + latency);
        tdi.push(true);
        let [hi, lo] = (write.len() as u16).to_be_bytes();
        tdi.push_byte_msb(hi);
        tdi.push_byte_msb(lo);
        for b in write {
            tdi.push_byte_msb(*b);
        }
        tdi.push_repeat(false, 1 + latency);

        let captured = self.taps.shift_dr(tdi.as_slice(), tdi.len())?;
        let first = latency + 18;
        Ok((0..write.len())
            .map(|k| {
                (0..8).fold(0u8, |byte, b| byte << 1 | get_bit(&captured, first + 8 * k + b) as u8)
            })
            .collect())
    }
}

impl<'a, T, U> SpiBus for JtagSpiBridge<'a, T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    fn transfer(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        if write.is_empty() {
            return Ok(Vec::new());
        }
        self.select()?;
        match self.framing {
            Framing::Direct => self.transfer_direct(write),
            Framing::Framed => self.transfer_framed(write),
        }
    }

    fn delay_us(&mut self, us: u32) {
        self.taps.sm.cable.delay_us(us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::cable::sim::{SimCable, SimFlash, SimTap};
    use crate::flash::SpiFlash;
    use crate::statemachine::JtagSM;

    #[test]
    fn full_cycle_returns_to_not_bridged() {
        let mut b = Bridge::new();
        assert!(b.enter().unwrap());
        b.loaded(true).unwrap();
        b.begin_op().unwrap();
        assert_eq!(b.state(), BridgeState::FlashOp);
        assert!(b.end_op().unwrap());
        b.leave().unwrap();
        assert_eq!(b.state(), BridgeState::Unloading);
        b.unloaded().unwrap();
        assert_eq!(b.state(), BridgeState::NotBridged);
    }

    #[test]
    fn trusted_bridge_stays_loaded() {
        let mut b = Bridge::new();
        b.set_trust_loaded_bridge(true);
        assert!(b.enter().unwrap());
        b.loaded(true).unwrap();
        b.begin_op().unwrap();
        assert!(!b.end_op().unwrap());
        assert!(!b.enter().unwrap());
        assert_eq!(b.state(), BridgeState::Bridged);
    }

    #[test]
    fn invalidated_bridge_is_loaded_again() {
        let mut b = Bridge::new();
        b.set_trust_loaded_bridge(true);
        b.enter().unwrap();
        b.loaded(true).unwrap();
        b.invalidate();
        assert_eq!(b.state(), BridgeState::NotBridged);
        assert!(b.enter().unwrap());
        // Only a loaded, idle bridge is dropped
        b.invalidate();
        assert_eq!(b.state(), BridgeState::BridgeLoading);
    }

    #[test]
    fn out_of_order_steps_are_refused() {
        let mut b = Bridge::new();
        assert!(matches!(b.begin_op(), Err(Error::Operation { step: "bridge", .. })));
        assert!(matches!(b.leave(), Err(Error::Operation { step: "bridge", .. })));
        b.enter().unwrap();
        b.loaded(false).unwrap();
        assert_eq!(b.state(), BridgeState::NotBridged);
    }

    #[test]
    fn framed_transfer_behind_bypassed_devices() {
        let flash = SimFlash::new(1 << 20);
        let mut sim = SimCable::with_taps(vec![
            SimTap::new(0x4ba0_0477, 4),
            SimTap::xilinx7(0x0362_d093).with_bridge(0x02, Framing::Framed, flash),
            SimTap::ecp5(0x4111_1043),
        ]);
        let mut taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
        let bus = JtagSpiBridge::new(&mut taps, 1, Some(0x02), Framing::Framed);
        let mut flash = SpiFlash::probe(bus).unwrap();
        assert_eq!(flash.read_jedec_id().unwrap(), [0xef, 0x40, 20]);
        flash.erase_and_program(0x100, &[1, 2, 3], true).unwrap();
        drop(flash);
        drop(taps);
        assert_eq!(&sim.tap(1).bridge_flash().unwrap().memory()[0x100..0x103], &[1, 2, 3]);
    }

    #[test]
    fn direct_transfer_on_single_tap() {
        let flash = SimFlash::new(1 << 16).with_contents(0, &[0xa5, 0x5a]);
        let mut sim = SimCable::with_taps(vec![SimTap::ecp5(0x4111_1043).with_bridge(0x3a, Framing::Direct, flash)]);
        let mut taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
        let mut bus = JtagSpiBridge::new(&mut taps, 0, Some(0x3a), Framing::Direct);
        assert_eq!(bus.transfer(&[0x03, 0, 0, 0, 0, 0]).unwrap()[4..], [0xa5, 0x5a]);
    }

    #[test]
    fn framed_length_is_bounded() {
        let mut sim = SimCable::with_taps(vec![SimTap::xilinx7(0x0362_d093)]);
        let mut taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
        let mut bus = JtagSpiBridge::new(&mut taps, 0, Some(0x02), Framing::Framed);
        assert!(matches!(bus.transfer(&vec![0; MAX_FRAMED_LEN + 1]), Err(Error::Range { .. })));
    }
}
