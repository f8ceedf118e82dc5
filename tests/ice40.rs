use fpga_taps::bitstream::{detect_format, Bitstream, Format};
use fpga_taps::cable::sim::{FlashOp, SimCable, SimFlash};
use fpga_taps::config::{DBUS6, DBUS7};
use fpga_taps::device::ice40::Ice40Pins;
use fpga_taps::device::{Action, ActionOutput, Destination, ProgramRequest, Target};
use fpga_taps::flash::{CableSpi, SpiFlash, Status};
use fpga_taps::Error;

fn board(flash: SimFlash) -> SimCable {
    let mut sim = SimCable::new().with_flash(flash).with_fpga(DBUS7);
    sim.set_inputs(DBUS6);
    sim
}

/// Intel HEX with 16-byte data records
fn mcs(data: &[u8]) -> String {
    let record = |addr: u16, kind: u8, bytes: &[u8]| {
        let mut sum = bytes.len() as u8;
        sum = sum.wrapping_add((addr >> 8) as u8).wrapping_add(addr as u8).wrapping_add(kind);
        let mut line = format!(":{:02X}{:04X}{:02X}", bytes.len(), addr, kind);
        for b in bytes {
            sum = sum.wrapping_add(*b);
            line += &format!("{:02X}", b);
        }
        line + &format!("{:02X}\n", sum.wrapping_neg())
    };
    let mut out = record(0, 0x04, &[0, 0]);
    for (i, chunk) in data.chunks(16).enumerate() {
        out += &record((i * 16) as u16, 0x00, chunk);
    }
    out + &record(0, 0x01, &[])
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i ^ (i >> 8)) as u8).collect()
}

#[test]
fn full_flash_image_from_mcs() {
    let data = image(64 * 1024);
    let text = mcs(&data);
    assert_eq!(detect_format(Some("top.mcs"), text.as_bytes()), Format::Mcs);
    let bitstream = Bitstream::parse(Format::Auto, text.as_bytes(), false).unwrap();
    assert_eq!(bitstream.payload(), &data[..]);

    let mut sim = board(SimFlash::new(64 * 1024).with_contents(0x100, &[0; 16]));
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    target.program(&ProgramRequest::from_bitstream(bitstream, Destination::Flash)).unwrap();
    drop(target);

    let flash = sim.flash().unwrap();
    assert_eq!(flash.memory(), &data[..]);
    let log = flash.log();
    assert_eq!(log[0], FlashOp::Erase { addr: 0, len: 64 * 1024 });
    let programs: Vec<u32> = log[1..]
        .iter()
        .map(|op| match op {
            FlashOp::Program { addr, len: 256 } => *addr,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(programs, (0..256u32).map(|p| p * 256).collect::<Vec<_>>());
    assert_ne!(sim.outputs() & DBUS7, 0);
}

#[test]
fn sram_load_never_touches_flash() {
    let mut sim = board(SimFlash::new(1 << 20));
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    target.program(&ProgramRequest::sram(vec![0x7e, 0xaa, 0x99, 0x7e, 0x51, 0x00])).unwrap();
    drop(target);
    assert_eq!(&sim.config_port()[..6], &[0x7e, 0xaa, 0x99, 0x7e, 0x51, 0x00]);
    assert!(sim.flash().unwrap().log().is_empty());
}

#[test]
fn protect_blocks_bulk_erase_until_unprotected() {
    let mut sim = board(SimFlash::new(1 << 20).with_contents(0, &[0x12; 4]));
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    target.protect_flash(Status::BP0 | Status::BP1 | Status::BP2).unwrap();

    let err = target.bulk_erase_flash().unwrap_err();
    assert!(matches!(err.root(), Error::Protected { status: 0x1c }));
    assert_eq!(target.dump_flash(0, 4).unwrap(), vec![0x12; 4]);

    target.unprotect_flash().unwrap();
    target.bulk_erase_flash().unwrap();
    assert_eq!(target.dump_flash(0, 4).unwrap(), vec![0xff; 4]);
    drop(target);
    assert_eq!(sim.flash().unwrap().log().last(), Some(&FlashOp::ChipErase));
}

#[test]
fn stuck_write_times_out() {
    let mut sim = board(SimFlash::new(1 << 20).with_busy_polls(100_000));
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    let err = target.program(&ProgramRequest::flash(vec![0; 16], 0)).unwrap_err();
    assert!(matches!(err, Error::Operation { step: "program flash", .. }));
    assert!(matches!(err.root(), Error::Timeout(_)));
    drop(target);
    assert!(sim.elapsed_us() >= 1_000_000);
}

#[test]
fn unaligned_page_program_sends_nothing() {
    let mut sim = SimCable::new().with_flash(SimFlash::new(1 << 20));
    sim.fail_after(0);
    let mut flash = SpiFlash::new(CableSpi::new(&mut sim));
    let err = flash.program_page(0x10, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::Alignment { addr: 0x10, align: 256 }));
}

#[test]
fn cable_loss_surfaces_as_transport_error() {
    let mut sim = board(SimFlash::new(1 << 20));
    sim.fail_after(12);
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    let err = target.program(&ProgramRequest::flash(image(4096), 0)).unwrap_err();
    assert!(err.is_transport());
    assert!(matches!(err, Error::Operation { .. }));
}

#[test]
fn batch_keeps_going_after_a_failure() {
    let mut sim = board(SimFlash::new(1 << 20));
    let mut target = Target::ice40(&mut sim, Ice40Pins::FTDI);
    let reports = target.run_actions(vec![
        Action::Dump { offset: 0x100, len: 3 },
        Action::ConnectEmbeddedBus,
        Action::Program(ProgramRequest::flash(vec![9, 8, 7], 0x100).with_unprotect(true)),
    ]);
    assert_eq!(reports.iter().map(|r| r.action).collect::<Vec<_>>(), ["program", "connect embedded bus", "dump"]);
    assert!(reports[0].is_ok());
    assert!(!reports[1].is_ok());
    assert_eq!(reports[2].result.as_ref().unwrap(), &ActionOutput::Data(vec![9, 8, 7]));
}
