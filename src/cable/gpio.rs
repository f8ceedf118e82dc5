//! Bit-banged JTAG on `embedded-hal` pins, for running on a microcontroller
use alloc::vec::Vec;
use embedded_hal::{delay::DelayNs, digital::{InputPin, OutputPin, PinState}};

use crate::bits::{get_bit, BitWriter};
use crate::cable::Cable;
use crate::error::{Error, Result};

pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    pub fn new(freq: u32, clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Gpio<Clk, Tdi, Tdo, Tms, Delay> {
        let mut gpio = Gpio { half_period: 0, clock, tdi, tdo, tms, delay };
        gpio.half_period = Self::half_period_for(freq);
        gpio
    }

    fn half_period_for(freq: u32) -> u32 {
        1_000_000_000u32.div_ceil(freq.max(1).saturating_mul(2))
    }

    fn clock_bit(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        // clock starts low
        self.tms.set_state(PinState::from(tms)).map_err(Error::transport)?;
        self.tdi.set_state(PinState::from(tdi)).map_err(Error::transport)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_high().map_err(Error::transport)?;

        // Sample the tdo line
        let tdo = self.tdo.is_high().map_err(Error::transport)?;

        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(Error::transport)?;
        Ok(tdo)
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Cable for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn jtag_shift(&mut self, tms: &[u8], tdi: &[u8], bits: usize, capture: bool) -> Result<Vec<u8>> {
        let mut tdo = BitWriter::with_capacity(if capture { bits } else { 0 });
        for i in 0..bits {
            let bit = self.clock_bit(get_bit(tms, i), get_bit(tdi, i))?;
            if capture {
                tdo.push(bit);
            }
        }
        Ok(tdo.into_inner())
    }

    fn set_clock(&mut self, freq: u32) -> Result<u32> {
        self.half_period = Self::half_period_for(freq);
        Ok(1_000_000_000 / (self.half_period * 2))
    }

    fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::convert::Infallible;
    use alloc::rc::Rc;
    use alloc::vec;
    use embedded_hal::digital::ErrorType;

    /// Loops TDI back to TDO, latched on the rising clock edge
    #[derive(Clone, Default)]
    struct Wire(Rc<RefCell<(bool, bool)>>);

    struct TdiPin(Wire);
    struct ClkPin(Wire);
    struct TdoPin(Wire);
    struct TmsPin;
    struct NoDelay;

    impl ErrorType for TdiPin { type Error = Infallible; }
    impl ErrorType for ClkPin { type Error = Infallible; }
    impl ErrorType for TdoPin { type Error = Infallible; }
    impl ErrorType for TmsPin { type Error = Infallible; }

    impl OutputPin for TdiPin {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> { (self.0).0.borrow_mut().0 = false; Ok(()) }
        fn set_high(&mut self) -> core::result::Result<(), Infallible> { (self.0).0.borrow_mut().0 = true; Ok(()) }
    }
    impl OutputPin for ClkPin {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> { Ok(()) }
        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            let mut w = (self.0).0.borrow_mut();
            w.1 = w.0;
            Ok(())
        }
    }
    impl InputPin for TdoPin {
        fn is_high(&mut self) -> core::result::Result<bool, Infallible> { Ok((self.0).0.borrow().1) }
        fn is_low(&mut self) -> core::result::Result<bool, Infallible> { Ok(!(self.0).0.borrow().1) }
    }
    impl OutputPin for TmsPin {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> { Ok(()) }
        fn set_high(&mut self) -> core::result::Result<(), Infallible> { Ok(()) }
    }
    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn loopback_shift() {
        let wire = Wire::default();
        let mut gpio = Gpio::new(1_000_000, ClkPin(wire.clone()), TdiPin(wire.clone()), TdoPin(wire), TmsPin, NoDelay);
        let tdo = gpio.jtag_shift(&[0, 0], &[0x5a, 0x03], 10, true).unwrap();
        assert_eq!(tdo, vec![0x5a, 0x03]);
        assert_eq!(gpio.set_clock(3_000_000).unwrap(), 2_994_011);
    }
}
