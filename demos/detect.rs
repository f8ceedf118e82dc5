//! Scan a JTAG chain and list what is on it.
//!
//! ```text
//! cargo run --example detect -- --xvc localhost:2542
//! cargo run --example detect -- --vid 0403 --pid 6010 --channel b
//! ```
use clap::Parser;

use fpga_taps::cable;
use fpga_taps::config::{CableConfig, CableMode, Channel, JtagPins, PinMapping};
use fpga_taps::device::select_target;
use fpga_taps::statemachine::JtagSM;
use fpga_taps::taps::Taps;

fn parse_hex(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    match s.to_ascii_uppercase().as_str() {
        "A" => Ok(Channel::A),
        "B" => Ok(Channel::B),
        "C" => Ok(Channel::C),
        "D" => Ok(Channel::D),
        _ => Err(format!("no FTDI channel {}", s)),
    }
}

#[derive(Parser)]
#[command(about = "Scan a JTAG chain and identify its devices")]
struct Opts {
    /// USB vendor id, in hex
    #[arg(long, value_parser = parse_hex, default_value = "0403")]
    vid: u16,

    /// USB product id, in hex
    #[arg(long, value_parser = parse_hex, default_value = "6010")]
    pid: u16,

    /// Serial number of the adapter
    #[arg(long)]
    serial: Option<String>,

    /// FTDI channel (A-D)
    #[arg(long, value_parser = parse_channel, default_value = "A")]
    channel: Channel,

    /// Use an XVC server at HOST:PORT instead of a USB adapter
    #[arg(long)]
    xvc: Option<String>,

    /// TCK frequency in Hz
    #[arg(long, default_value_t = CableConfig::DEFAULT_FREQUENCY)]
    frequency: u32,

    /// Number of devices on the chain, needed when some have no IDCODE
    #[arg(long)]
    devices: Option<usize>,
}

fn main() {
    env_logger::init();

    let opts = Opts::parse();
    if let Err(e) = run(opts) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &opts.xvc {
        Some(addr) => {
            let (host, port) = addr.rsplit_once(':').ok_or("expected HOST:PORT")?;
            CableConfig::tcp(host, port.parse()?)
        }
        None => {
            let mut config = CableConfig::usb(opts.vid, opts.pid, CableMode::JtagMpsse).with_channel(opts.channel);
            if let Some(serial) = &opts.serial {
                config = config.with_serial(serial);
            }
            config
        }
    };
    let config = config.with_frequency(opts.frequency);

    let cable = cable::open(&config, &PinMapping::Jtag(JtagPins::MPSSE))?;
    let sm = JtagSM::new(cable)?;
    let mut taps = Taps::manual(sm);
    match opts.devices {
        Some(n) => taps.detect_expected(n, &[])?,
        None => taps.detect(&[])?,
    }

    println!("{} devices on the scan chain (TDI first)", taps.len());
    for (i, entry) in taps.chain().iter().enumerate() {
        match entry.part {
            Some(part) => println!(
                "  {}: {:08x}  {} {}  IR {} bits",
                i, entry.idcode, part.manufacturer, part.model, entry.ir_len
            ),
            None if entry.idcode == 0 => println!("  {}: (no IDCODE)  IR {} bits", i, entry.ir_len),
            None => println!("  {}: {:08x}  unknown  IR {} bits", i, entry.idcode, entry.ir_len),
        }
    }
    match select_target(taps.chain(), None) {
        Ok(index) => println!("target: TAP {}", index),
        Err(e) => println!("no single target: {}", e),
    }
    Ok(())
}
