// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus-arbitration ("busy") line shared with the RP2040.
//!
//! Polarity contract (see `drv_i2c_api::wire`): pulled-up high means free,
//! driven low means claimed. We claim by observing high then driving low:
//! a peer's GPIO drive beats a pull-up charge curve by roughly two orders
//! of magnitude, so the collision window after the observation is tiny.
//! We never drive the line high except while our own transaction is on the
//! wire, and we release by reverting to input-with-pull-up.

use rppal::gpio::{Bias, Gpio, IoPin, Level, Mode};
use thiserror::Error;

/// GPIO reconfiguration failure. On rppal the mode switches themselves are
/// infallible once the pin is exported, so in production this only fires
/// at acquisition; the fakes use it to exercise the arbiter's lock path.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("busy line gpio: {0}")]
pub struct PinError(pub String);

impl From<rppal::gpio::Error> for PinError {
    fn from(e: rppal::gpio::Error) -> Self {
        Self(e.to_string())
    }
}

pub trait ArbitrationPin: Send {
    /// If the line reads free, drive it low to claim and return true.
    fn try_claim(&mut self) -> Result<bool, PinError>;

    /// Positively mark "host owns bus" while the transaction is on the
    /// wire. Only legal between a successful `try_claim` and `release`.
    fn drive_high(&mut self) -> Result<(), PinError>;

    /// Revert to input-with-pull-up, letting the line float back to free.
    fn release(&mut self) -> Result<(), PinError>;

    /// Non-claiming read, for the busy-duration diagnostic.
    fn is_free(&mut self) -> Result<bool, PinError>;
}

pub struct BusyLine {
    pin: IoPin,
}

impl BusyLine {
    pub fn acquire(pin_number: u8) -> Result<Self, PinError> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_number)?.into_io(Mode::Input);
        pin.set_bias(Bias::PullUp);
        Ok(Self { pin })
    }
}

impl ArbitrationPin for BusyLine {
    fn try_claim(&mut self) -> Result<bool, PinError> {
        if self.pin.read() == Level::High {
            self.pin.set_mode(Mode::Output);
            self.pin.set_low();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn drive_high(&mut self) -> Result<(), PinError> {
        self.pin.set_mode(Mode::Output);
        self.pin.set_high();
        Ok(())
    }

    fn release(&mut self) -> Result<(), PinError> {
        self.pin.set_mode(Mode::Input);
        self.pin.set_bias(Bias::PullUp);
        Ok(())
    }

    fn is_free(&mut self) -> Result<bool, PinError> {
        // Only meaningful while we are not claiming; the arbiter's
        // diagnostic runs strictly after a failed claim.
        Ok(self.pin.read() == Level::High)
    }
}

impl Drop for BusyLine {
    fn drop(&mut self) {
        // Last-resort release so a panicking service can't wedge the peer.
        let _ = ArbitrationPin::release(self);
    }
}
