use fpga_taps::bits::{reverse_bytes, to_u64};
use fpga_taps::bitstream::{Bitstream, Format};
use fpga_taps::cable::sim::{FlashOp, SimCable, SimFlash, SimTap};
use fpga_taps::device::bridge::Framing;
use fpga_taps::device::{Action, ActionOutput, Destination, ProgramRequest, Target};
use fpga_taps::error::ChainFault;
use fpga_taps::flash::Status;
use fpga_taps::parts::Family;
use fpga_taps::statemachine::JtagSM;
use fpga_taps::taps::Taps;
use fpga_taps::Error;

const DAP: u32 = 0x4ba0_0477;
const A35T: u32 = 0x0362_d093;
const LFE5U_25: u32 = 0x4111_1043;
const USER1: u32 = 0x02;
const BACKGROUND_SPI: u32 = 0x3a;

fn tlv(out: &mut Vec<u8>, key: u8, value: &str) {
    out.push(key);
    out.extend_from_slice(&((value.len() + 1) as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn xilinx_bit(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x09, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x00, 0x00, 0x01];
    tlv(&mut out, b'a', "spi_bridge;UserID=0XFFFFFFFF");
    tlv(&mut out, b'b', "7a35tcsg324");
    tlv(&mut out, b'c', "2024/01/01");
    tlv(&mut out, b'd', "12:00:00");
    out.push(b'e');
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn three_device_chain(flash: SimFlash) -> SimCable {
    SimCable::with_taps(vec![
        SimTap::new(DAP, 4),
        SimTap::xilinx7(A35T).with_bridge(USER1, Framing::Framed, flash),
        SimTap::ecp5(LFE5U_25),
    ])
}

#[test]
fn selected_device_sees_only_its_bits() {
    let mut sim = three_device_chain(SimFlash::new(1 << 20));
    let mut taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    assert_eq!(taps.chain().iter().map(|e| e.idcode).collect::<Vec<_>>(), [DAP, A35T, LFE5U_25]);
    assert_eq!(taps.chain().iter().map(|e| e.ir_len).collect::<Vec<_>>(), [4, 6, 8]);

    taps.select_device(2).unwrap();
    taps.shift_ir(&[0xc0], 8).unwrap();
    let dr = taps.shift_dr(&[0x78, 0x56, 0x34, 0x12], 32).unwrap();
    assert_eq!(to_u64(&dr, 0, 32), 0xffff_ffff);

    taps.select_device(1).unwrap();
    taps.shift_ir(&[0x08], 6).unwrap();
    let dr = taps.shift_dr(&[0; 4], 32).unwrap();
    assert_eq!(to_u64(&dr, 0, 32), 0xdead_beef);
    assert_eq!(taps.read_idcode_at(0).unwrap(), DAP);
    drop(taps);

    let scan = sim.tap(2).scans_of(0xc0).next().unwrap();
    assert_eq!(scan.register(32), vec![0x78, 0x56, 0x34, 0x12]);
}

#[test]
fn dr_scan_needs_a_selection_after_reset() {
    let mut sim = three_device_chain(SimFlash::new(1 << 20));
    let mut taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let err = taps.shift_dr(&[0], 8).unwrap_err();
    assert!(matches!(err, Error::Chain { fault: ChainFault::NotSelected, .. }));
}

#[test]
fn two_fpgas_need_an_index() {
    let mut sim = three_device_chain(SimFlash::new(1 << 20));
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    assert!(matches!(
        Target::from_taps(taps, None, None),
        Err(Error::Chain { fault: ChainFault::MultipleTargets, .. })
    ));
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let target = Target::from_taps(taps, Some(2), None).unwrap();
    assert_eq!(target.family(), Family::Ecp5);
}

#[test]
fn xilinx_flash_through_bridge_bitstream() {
    let bridge = Bitstream::parse(Format::Auto, &xilinx_bit(&[0xaa, 0x99, 0x55, 0x66, 0x30, 0xa1]), false).unwrap();
    assert_eq!(bridge.metadata()["design"], "spi_bridge");
    let bridge = bridge.into_payload();

    let flash = SimFlash::new(1 << 22).with_status(Status::BP0.bits() | Status::BP1.bits());
    let mut sim = three_device_chain(flash);
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let mut target = Target::from_taps(taps, Some(1), Some(bridge.clone())).unwrap();

    let image: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let request = ProgramRequest::flash(image.clone(), 0x3f_0000).with_unprotect(true);
    target.program(&request).unwrap();
    assert_eq!(target.dump_flash(0x3f_0000, image.len()).unwrap(), image);
    drop(target);

    let tap = sim.tap(1);
    let log = tap.bridge_flash().unwrap().log();
    assert_eq!(log[0], FlashOp::WriteStatus(0));
    assert_eq!(log[1], FlashOp::Erase { addr: 0x3f_0000, len: 4096 });
    assert_eq!(log[2], FlashOp::Erase { addr: 0x3f_1000, len: 4096 });
    assert!(matches!(log[3], FlashOp::Program { addr: 0x3f_0000, len: 256 }));
    assert_eq!(&tap.bridge_flash().unwrap().memory()[0x3f_0000..0x3f_0000 + 5000], &image[..]);

    // Loaded once per flash call, JPROGRAM afterwards each time
    let loads: Vec<_> = tap.scans_of(0x05).collect();
    assert_eq!(loads.len(), 2);
    assert!(loads.iter().all(|s| s.register(bridge.len() * 8) == reverse_bytes(&bridge)));
}

#[test]
fn protected_region_is_not_erased() {
    // BP=1 on a 4 MiB part protects the top 64 KiB
    let flash = SimFlash::new(1 << 22).with_status(Status::BP0.bits());
    let mut sim = three_device_chain(flash);
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let mut target = Target::from_taps(taps, Some(1), Some(vec![0; 8])).unwrap();
    let err = target.program(&ProgramRequest::flash(vec![1; 16], 0x3f_f000)).unwrap_err();
    assert!(matches!(err, Error::Operation { step: "program flash", .. }));
    assert!(matches!(err.root(), Error::Protected { .. }));
    target.program(&ProgramRequest::flash(vec![1; 16], 0)).unwrap();
    drop(target);
    let log = sim.tap(1).bridge_flash().unwrap().log();
    assert_eq!(log[0], FlashOp::Erase { addr: 0, len: 4096 });
}

#[test]
fn ecp5_flash_and_sram_from_lattice_bit() {
    let mut raw = vec![0xff, 0x00];
    raw.extend_from_slice(b"Part: LFE5U-25F-6CABGA256\0");
    raw.extend_from_slice(&[0x00, 0xff, 0xff, 0xff, 0xbd, 0xb3, 0x3b, 0x00, 0x00, 0x00]);
    let bitstream = Bitstream::parse(Format::LatticeBit, &raw, false).unwrap();
    let payload = bitstream.payload().to_vec();

    let flash = SimFlash::new(1 << 24);
    let mut sim = SimCable::with_taps(vec![SimTap::ecp5(LFE5U_25).with_bridge(BACKGROUND_SPI, Framing::Direct, flash)]);
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let mut target = Target::from_taps(taps, None, None).unwrap();

    let reports = target.run_actions(vec![
        Action::Reset,
        Action::Dump { offset: 0, len: payload.len() },
        Action::ReadRegister("status".into()),
        Action::Program(ProgramRequest::from_bitstream(bitstream, Destination::Flash)),
    ]);
    assert!(reports.iter().all(|r| r.is_ok()), "{:?}", reports);
    assert_eq!(reports[1].result.as_ref().unwrap(), &ActionOutput::Register(0x710));
    assert_eq!(reports[2].result.as_ref().unwrap(), &ActionOutput::Data(payload.clone()));

    target.program(&ProgramRequest::sram(payload.clone())).unwrap();
    drop(target);
    let burst: Vec<_> = sim.tap(0).scans_of(0x7a).collect();
    assert_eq!(burst.len(), 1);
    assert_eq!(burst[0].bytes(), reverse_bytes(&payload));
}

#[test]
fn unknown_register_does_not_stop_the_batch() {
    let mut sim = three_device_chain(SimFlash::new(1 << 20));
    let taps = Taps::new(JtagSM::new(&mut sim).unwrap()).unwrap();
    let mut target = Target::from_taps(taps, Some(1), None).unwrap();
    let reports = target.run_actions(vec![
        Action::Reset,
        Action::ReadRegister("bogus".into()),
        Action::ReadRegister("usercode".into()),
        Action::Dump { offset: 0, len: 16 },
    ]);
    let ok: Vec<_> = reports.iter().map(|r| (r.action, r.is_ok())).collect();
    assert_eq!(
        ok,
        [("read register", false), ("read register", true), ("dump", false), ("reset", true)]
    );
    assert_eq!(reports[1].result.as_ref().unwrap(), &ActionOutput::Register(0xdead_beef));
}

#[test]
fn corrupt_images_are_rejected() {
    let mut raw = xilinx_bit(&[0; 32]);
    raw.truncate(raw.len() - 4);
    assert!(matches!(Bitstream::parse(Format::Auto, &raw, false), Err(Error::Format { .. })));

    let mcs = ":0400000001020304F3\n:00000001FF\n";
    assert!(matches!(Bitstream::parse(Format::Mcs, mcs.as_bytes(), false), Err(Error::Format { .. })));
    let mcs = ":0400000001020304F2\n";
    assert!(matches!(Bitstream::parse(Format::Mcs, mcs.as_bytes(), false), Err(Error::Format { .. })));
}
