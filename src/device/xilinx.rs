//! Xilinx 7-series over JTAG.  SRAM is loaded through CFG_IN; the configuration flash is reached
//! by first loading a bridge design that exposes the SPI pins on USER1.
use alloc::vec::Vec;

use crate::bits::{get_bit, reverse_bytes, to_u64};
use crate::cable::Cable;
use crate::device::bridge::{run_bridged, Bridge, BridgeHost, Framing, JtagSpiBridge};
use crate::device::{run_flash_cmd, ActionOutput, FlashAction};
use crate::error::{Error, Result, Step};
use crate::flash::{SpiFlash, Status};
use crate::taps::Taps;

pub const IR_LEN: usize = 6;

/// The 7-series JTAG instructions used here
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(u8)]
pub enum Command {
    USER1 = 0b000010,
    CFG_OUT = 0b000100,
    CFG_IN = 0b000101,
    USERCODE = 0b001000,
    IDCODE = 0b001001,
    JPROGRAM = 0b001011,
    JSTART = 0b001100,
    JSHUTDOWN = 0b001101,
    BYPASS = 0b111111,
}

// IR capture bits
const CAPTURE_INIT: usize = 4;
const CAPTURE_DONE: usize = 5;

const INIT_POLLS: usize = 1000;
const DONE_POLLS: usize = 1000;
const POLL_US: u32 = 1000;
const CLEAR_CLOCKS: usize = 10_000;
const STARTUP_CLOCKS: usize = 2000;

/// Sync, NOOP, read STAT (type 1, one word), NOOP, NOOP
const READ_STAT: [u32; 5] = [0xaa99_5566, 0x2000_0000, 0x2800_e001, 0x2000_0000, 0x2000_0000];

pub struct Xilinx7<T> {
    taps: Taps<T>,
    index: usize,
    bridge: Bridge,
    bridge_image: Option<Vec<u8>>,
}

impl<T, U> Xilinx7<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// The 7-series device at chain position `index`.  `bridge_image` is the raw payload of the
    /// SPI bridge design; without it the flash is out of reach.
    pub fn new(taps: Taps<T>, index: usize, bridge_image: Option<Vec<u8>>) -> Result<Self> {
        if index >= taps.len() {
            return Err(Error::Range { what: "chain index", index, limit: taps.len() });
        }
        Ok(Self { taps, index, bridge: Bridge::new(), bridge_image })
    }

    pub fn taps(&mut self) -> &mut Taps<T> {
        &mut self.taps
    }

    pub fn release(self) -> T {
        self.taps.release()
    }

    pub fn set_trust_loaded_bridge(&mut self, trust: bool) {
        self.bridge.set_trust_loaded_bridge(trust);
    }

    /// Keep the bridge design running after a flash call instead of JPROGRAM
    pub fn set_skip_reset(&mut self, skip: bool) {
        self.bridge.set_skip_reset(skip);
    }

    /// Load a command into the IR, returning the IR capture
    fn command(&mut self, command: Command) -> Result<u8> {
        log::trace!("Loading command {:?}", command);
        let capture = self.taps.shift_ir(&[command as u8], IR_LEN)?;
        Ok(capture.first().copied().unwrap_or(0))
    }

    fn poll_capture(&mut self, bit: usize, polls: usize, what: &'static str) -> Result<()> {
        for _ in 0..polls {
            let capture = self.command(Command::BYPASS)?;
            if get_bit(&[capture], bit) {
                return Ok(());
            }
            self.taps.sm.cable.delay_us(POLL_US);
        }
        log::error!("{} never came up", what);
        Err(Error::Timeout(what))
    }

    /// Clear configuration memory and load `payload` into it
    pub fn program_sram(&mut self, payload: &[u8]) -> Result<()> {
        log::info!("7-series: loading {} bytes into SRAM", payload.len());
        self.bridge.invalidate();
        self.taps.reset()?;
        self.taps.select_device(self.index)?;
        self.command(Command::JPROGRAM).step("clear configuration")?;
        self.poll_capture(CAPTURE_INIT, INIT_POLLS, "INIT").step("clear configuration")?;
        self.taps.idle_clocks(CLEAR_CLOCKS)?;

        self.command(Command::CFG_IN).step("send bitstream")?;
        self.taps.shift_dr(&reverse_bytes(payload), payload.len() * 8).step("send bitstream")?;

        self.command(Command::JSTART).step("start up")?;
        self.taps.idle_clocks(STARTUP_CLOCKS)?;
        self.poll_capture(CAPTURE_DONE, DONE_POLLS, "DONE").step("start up")?;
        self.taps.reset()?;
        log::info!("7-series configured");
        Ok(())
    }

    /// Reconfigure from flash
    pub fn reset(&mut self) -> Result<()> {
        log::info!("7-series: JPROGRAM");
        self.bridge.invalidate();
        self.taps.select_device(self.index)?;
        self.command(Command::JPROGRAM)?;
        self.taps.reset()
    }

    fn read_u32(&mut self, command: Command) -> Result<u32> {
        self.taps.select_device(self.index)?;
        self.command(command)?;
        let dr = self.taps.shift_dr(&[0; 4], 32)?;
        Ok(to_u64(&dr, 0, 32) as u32)
    }

    /// The configuration STAT register, read back through CFG_OUT
    pub fn read_status(&mut self) -> Result<u32> {
        self.taps.reset()?;
        self.taps.select_device(self.index)?;
        self.taps.idle_clocks(5)?;
        self.command(Command::CFG_IN)?;
        let words: Vec<u8> = READ_STAT.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.taps.shift_dr(&reverse_bytes(&words), words.len() * 8)?;
        self.command(Command::CFG_OUT)?;
        let dr = self.taps.shift_dr(&[0; 4], 32)?;
        let status = (to_u64(&dr, 0, 32) as u32).reverse_bits();
        log::debug!("7-series status 0x{:08x}", status);
        self.taps.reset()?;
        Ok(status)
    }

    /// One of `idcode`, `usercode` or `status`
    pub fn read_register(&mut self, name: &str) -> Result<u32> {
        match name {
            "idcode" => self.read_u32(Command::IDCODE),
            "usercode" => self.read_u32(Command::USERCODE),
            "status" => self.read_status(),
            _ => Err(Error::Unsupported("register name")),
        }
    }

    pub fn program_flash(&mut self, offset: u32, data: &[u8], unprotect: bool, verify: bool) -> Result<()> {
        run_bridged(self, &FlashAction::Program { offset, data, unprotect, verify }).map(|_| ())
    }

    pub fn dump_flash(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        run_bridged(self, &FlashAction::Dump { offset, len }).map(ActionOutput::into_data)
    }

    pub fn protect_flash(&mut self, mask: Status) -> Result<()> {
        run_bridged(self, &FlashAction::Protect(mask)).map(|_| ())
    }

    pub fn unprotect_flash(&mut self) -> Result<()> {
        run_bridged(self, &FlashAction::Unprotect).map(|_| ())
    }

    pub fn bulk_erase_flash(&mut self) -> Result<()> {
        run_bridged(self, &FlashAction::BulkErase).map(|_| ())
    }
}

impl<T, U> BridgeHost for Xilinx7<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    fn bridge(&mut self) -> &mut Bridge {
        &mut self.bridge
    }

    fn load_bridge(&mut self) -> Result<()> {
        let image = self.bridge_image.take().ok_or(Error::Unsupported("flash access without a bridge image"))?;
        let result = self.program_sram(&image);
        self.bridge_image = Some(image);
        result
    }

    fn unload_bridge(&mut self) -> Result<()> {
        self.reset()
    }

    fn flash_action(&mut self, action: &FlashAction) -> Result<ActionOutput> {
        let bus = JtagSpiBridge::new(&mut self.taps, self.index, Some(Command::USER1 as u8), Framing::Framed);
        let mut flash = SpiFlash::probe(bus).step("identify flash")?;
        run_flash_cmd(&mut flash, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::cable::sim::{FlashOp, SimCable, SimFlash, SimTap};
    use crate::statemachine::JtagSM;

    const A35T: u32 = 0x0362_d093;

    fn xilinx(sim: &mut SimCable, index: usize, image: Option<Vec<u8>>) -> Xilinx7<&mut SimCable> {
        let taps = Taps::new(JtagSM::new(sim).unwrap()).unwrap();
        Xilinx7::new(taps, index, image).unwrap()
    }

    #[test]
    fn sram_load_sequence() {
        let mut sim = SimCable::with_taps(vec![SimTap::xilinx7(A35T)]);
        let payload = [0xaa, 0x99, 0x55, 0x66, 0x20, 0x00];
        xilinx(&mut sim, 0, None).program_sram(&payload).unwrap();

        let tap = sim.tap(0);
        let cfg: Vec<_> = tap.scans_of(Command::CFG_IN as u32).collect();
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg[0].bytes(), reverse_bytes(&payload));
        let history = tap.ir_history();
        let pos = |c: Command| history.iter().position(|&x| x == c as u32).unwrap();
        assert!(pos(Command::JPROGRAM) < pos(Command::CFG_IN));
        assert!(pos(Command::CFG_IN) < pos(Command::JSTART));
    }

    fn bridged(sim: &mut SimCable) -> Xilinx7<&mut SimCable> {
        xilinx(sim, 0, Some(vec![0xaa, 0x99, 0x55, 0x66]))
    }

    fn bridge_board(flash: SimFlash) -> SimCable {
        SimCable::with_taps(vec![SimTap::xilinx7(A35T).with_bridge(Command::USER1 as u32, Framing::Framed, flash)])
    }

    #[test]
    fn jprogram_drops_a_trusted_bridge() {
        let mut sim = bridge_board(SimFlash::new(1 << 20).with_contents(0, &[9, 8]));
        let mut dev = bridged(&mut sim);
        dev.set_trust_loaded_bridge(true);
        assert_eq!(dev.dump_flash(0, 2).unwrap(), vec![9, 8]);
        assert_eq!(dev.dump_flash(0, 2).unwrap(), vec![9, 8]);
        dev.reset().unwrap();
        assert_eq!(dev.dump_flash(0, 2).unwrap(), vec![9, 8]);
        drop(dev);
        assert_eq!(sim.tap(0).scans_of(Command::CFG_IN as u32).count(), 2);
    }

    #[test]
    fn skip_reset_keeps_bridge_design_running() {
        let mut sim = bridge_board(SimFlash::new(1 << 20));
        let mut dev = bridged(&mut sim);
        dev.set_skip_reset(true);
        dev.dump_flash(0, 2).unwrap();
        assert_eq!(dev.bridge.state(), crate::device::bridge::BridgeState::NotBridged);
        drop(dev);
        let jprograms = sim.tap(0).ir_history().iter().filter(|&&i| i == Command::JPROGRAM as u32).count();
        assert_eq!(jprograms, 1);
    }

    #[test]
    fn missing_init_times_out() {
        let mut sim = SimCable::with_taps(vec![SimTap::xilinx7(A35T).with_ir_capture(0b00_0001)]);
        let err = xilinx(&mut sim, 0, None).program_sram(&[0; 4]).unwrap_err();
        assert!(matches!(err, Error::Operation { step: "clear configuration", .. }));
        assert!(matches!(err.root(), Error::Timeout("INIT")));
        assert_eq!(sim.tap(0).scans_of(Command::CFG_IN as u32).count(), 0);
    }

    #[test]
    fn missing_done_times_out() {
        let mut sim = SimCable::with_taps(vec![SimTap::xilinx7(A35T).with_ir_capture(0b01_0001)]);
        let err = xilinx(&mut sim, 0, None).program_sram(&[0; 4]).unwrap_err();
        assert!(matches!(err.root(), Error::Timeout("DONE")));
    }

    #[test]
    fn status_read_sends_stat_packet() {
        let tap = SimTap::xilinx7(A35T).with_register(Command::CFG_OUT as u32, 0x401f_3c00u32.reverse_bits() as u64, 32);
        let mut sim = SimCable::with_taps(vec![SimTap::new(0x4ba0_0477, 4), tap]);
        let mut dev = xilinx(&mut sim, 1, None);
        assert_eq!(dev.read_register("status").unwrap(), 0x401f_3c00);
        assert_eq!(dev.read_register("usercode").unwrap(), 0xdead_beef);
        assert_eq!(dev.read_register("idcode").unwrap(), A35T);
        drop(dev);

        let scan = sim.tap(1).scans_of(Command::CFG_IN as u32).next().unwrap().clone();
        let words: Vec<u8> = READ_STAT.iter().flat_map(|w| w.to_be_bytes()).collect();
        assert_eq!(scan.register(160), reverse_bytes(&words));
    }

    #[test]
    fn flash_needs_bridge_image() {
        let mut sim = SimCable::with_taps(vec![SimTap::xilinx7(A35T)]);
        let err = xilinx(&mut sim, 0, None).dump_flash(0, 16).unwrap_err();
        assert!(matches!(err, Error::Operation { step: "load bridge", .. }));
        assert!(matches!(err.root(), Error::Unsupported(_)));
    }

    #[test]
    fn flash_through_bridge_in_chain() {
        let flash = SimFlash::new(1 << 22).with_contents(0x20_0000, &[0x11, 0x22]);
        let mut sim = SimCable::with_taps(vec![
            SimTap::new(0x4ba0_0477, 4),
            SimTap::xilinx7(A35T).with_bridge(Command::USER1 as u32, Framing::Framed, flash),
            SimTap::ecp5(0x4111_1043),
        ]);
        let image = vec![0x55; 32];
        let mut dev = xilinx(&mut sim, 1, Some(image.clone()));
        assert_eq!(dev.dump_flash(0x20_0000, 2).unwrap(), vec![0x11, 0x22]);
        dev.bulk_erase_flash().unwrap();
        drop(dev);

        let tap = sim.tap(1);
        assert_eq!(tap.bridge_flash().unwrap().log(), &[FlashOp::ChipErase]);
        let loads: Vec<_> = tap.scans_of(Command::CFG_IN as u32).collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].register(image.len() * 8), reverse_bytes(&image));
    }
}
