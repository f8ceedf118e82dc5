//! This crate programs FPGAs and their configuration flash through JTAG and SPI cables, at a
//! variety of levels of abstraction.  At the lowest level, you can directly interact with a cable
//! (FTDI MPSSE, FT232R bitbang, J-Link, Xilinx Virtual Cable, or a software simulation).  The
//! Cable trait allows for shifting bits through the JTAG chain, SPI transfers and GPIO control.
//!
//! The next higher level of abstraction is the JtagSM, which keeps track of the mode of the TAPs.
//! You tell it which mode you want (e.g., Reset or Idle) and it gets there with the fewest number
//! of mode changes.  You can also read and write the instruction and data registers.
//!
//! If there are multiple TAPs in the JTAG chain, you probably want to use the methods associated
//! with the Taps struct.  Taps scans the chain, identifies each device from its IDCODE and lets
//! you address one of them while the others are kept in BYPASS.
//!
//! On top of that sit the SPI NOR flash driver (`flash`), the bitstream file parsers
//! (`bitstream`) and the FPGA families (`device`).  A `Target` loads SRAM, programs flash (through
//! an on-chip bridge when the flash is not on the cable) and reads configuration registers.
//!
//! # Example
//! ```
//! use fpga_taps::cable::sim::{SimCable, SimTap};
//! use fpga_taps::device::{ProgramRequest, Target};
//! use fpga_taps::statemachine::JtagSM;
//! use fpga_taps::taps::Taps;
//!
//! let mut cable = SimCable::with_taps(vec![SimTap::xilinx7(0x0362_d093)]);
//! let taps = Taps::new(JtagSM::new(&mut cable)?)?;
//! let mut target = Target::from_taps(taps, None, None)?;
//! target.program(&ProgramRequest::sram(vec![0xaa, 0x99, 0x55, 0x66]))?;
//! # Ok::<(), fpga_taps::error::Error>(())
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod bits;
pub mod bitstream;
pub mod cable;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod parts;
pub mod statemachine;
pub mod taps;

pub use error::{Error, Result};
