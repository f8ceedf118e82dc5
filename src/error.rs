//! Error type shared by every layer of the crate.  Cable backends produce `Transport` errors, the
//! JTAG and flash engines add chain, range and flash-specific variants, and the device layer wraps
//! failures in `Operation` to name the step that failed.
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Why a JTAG chain scan or target selection could not produce a trustworthy result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainFault {
    /// A device without IDCODE (a single BYPASS bit) was found; its position can't be inferred
    Ambiguous,
    /// No terminator was seen within the maximum number of devices
    TooLong,
    /// The chain does not match the caller-supplied length
    LengthMismatch,
    /// TDO stuck low or no device answered
    NoDevice,
    /// An IDCODE is not in the part table and its IR length could not be inferred
    UnknownPart,
    /// No FPGA-class device in the chain
    NoTarget,
    /// More than one FPGA-class device and no explicit index was given
    MultipleTargets,
    /// A DR scan was requested while the other devices were not in BYPASS
    NotSelected,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Ambiguous => "device without IDCODE in chain, expected chain length required",
            Self::TooLong => "no chain terminator within the device limit",
            Self::LengthMismatch => "chain does not match the expected length",
            Self::NoDevice => "no device found",
            Self::UnknownPart => "unknown part with undetectable IR length",
            Self::NoTarget => "no FPGA in chain",
            Self::MultipleTargets => "more than one FPGA in chain, an explicit index is required",
            Self::NotSelected => "no device selected since the last TAP reset",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The adapter could not be reached or a USB/TCP transaction failed
    #[error("transport error: {0}")]
    Transport(String),

    /// `found` holds the idcodes read before the fault, nearest to TDO first
    #[error("JTAG chain error: {fault} ({} idcodes read)", .found.len())]
    Chain { fault: ChainFault, found: Vec<u32> },

    #[error("{what} {index} out of range (limit {limit})")]
    Range { what: &'static str, index: usize, limit: usize },

    #[error("address 0x{addr:08X} is not aligned to {align} bytes")]
    Alignment { addr: u32, align: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("flash is write protected (status 0x{status:02X})")]
    Protected { status: u8 },

    #[error("malformed {format} image: {reason}")]
    Format { format: &'static str, reason: String },

    #[error("verify failed at 0x{offset:08X}: expected 0x{expected:02X}, read 0x{found:02X}")]
    Verify { offset: u32, expected: u8, found: u8 },

    /// A configuration status register reported something other than what the step needs
    #[error("{what} (status 0x{status:08X})")]
    BadStatus { what: &'static str, status: u32 },

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("{step} failed: {source}")]
    Operation {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn transport<E: fmt::Debug>(err: E) -> Self {
        Error::Transport(format!("{:?}", err))
    }

    pub(crate) fn format(format: &'static str, reason: impl Into<String>) -> Self {
        Error::Format { format, reason: reason.into() }
    }

    /// Walk through `Operation` wrappers to the error that started it all
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Error::Transport(_))
    }
}

/// Attach the name of a high-level step to a failure
pub(crate) trait Step<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> Step<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| Error::Operation { step, source: Box::new(source) })
    }
}
