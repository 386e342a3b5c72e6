// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the shared I²C transaction arbiter.
//!
//! The arbiter service owns the kernel I²C adapter and the bus-arbitration
//! GPIO; everything else on the device reaches the bus through its `Tx`
//! method. This crate gives those clients a typed handle (`I2cProxy`), the
//! stable error kinds, and the `Bus` trait the peripheral drivers are
//! written against so tests can swap in a scripted bus.
//!
//! # RPC protocol
//!
//! Bus name `org.cacophony.i2c`, object path `/org/cacophony/i2c`:
//!
//! ## `Tx(address: y, write: ay, readLen: i, timeoutMs: i) -> ay`
//!
//! Runs one combined write/read transaction. Returns exactly `readLen`
//! bytes (possibly zero). Failures carry one of the [`err_name`] error
//! names below.

use std::time::{Duration, Instant};

use dbus::blocking::Connection;
use thiserror::Error;

pub mod wire {
    //! Constants shared, by agreement, with the RP2040 firmware. A change
    //! on either side is a wire-protocol break, not a software bug.

    /// BCM pin number of the bus-arbitration ("busy") line.
    pub const BUSY_PIN: u8 = 13;

    // Busy-line polarity contract:
    //   high (pull-up, nobody driving)  = bus free
    //   low, driven by a peer           = bus claimed by that peer
    // A peer claims by observing high then driving low, holds the line
    // high only while its transaction is on the wire, and releases by
    // reverting to input-with-pull-up. Neither peer ever drives high
    // outside its own transaction window.

    /// 7-bit peripheral addresses on the shared bus.
    pub const ADDR_ATTINY: u8 = 0x25;
    pub const ADDR_AHT20: u8 = 0x38;
    pub const ADDR_EEPROM: u8 = 0x50;
    pub const ADDR_PCF8563: u8 = 0x51;
}

pub const I2C_BUS_NAME: &str = "org.cacophony.i2c";
pub const I2C_OBJECT_PATH: &str = "/org/cacophony/i2c";
pub const I2C_INTERFACE: &str = "org.cacophony.i2c";

/// Hard bounds on a single transaction.
pub const MAX_WRITE_LEN: usize = 64;
pub const MAX_READ_LEN: usize = 32;

/// How long a caller keeps retrying while the arbiter's name is not yet on
/// the bus (service starting), and the spacing of those retries.
pub const CONNECT_WINDOW: Duration = Duration::from_secs(10);
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Stable D-Bus error names, shared between the server's reply path and
/// the client's decoder.
pub mod err_name {
    pub const BUSY_TIMEOUT: &str = "org.cacophony.i2c.Error.BusyTimeout";
    pub const LOCK: &str = "org.cacophony.i2c.Error.Lock";
    pub const IO: &str = "org.cacophony.i2c.Error.Io";
    pub const BAD_ARG: &str = "org.cacophony.i2c.Error.BadArg";
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum I2cError {
    #[error("i2c arbiter service is not available")]
    ServiceUnavailable,
    #[error("timed out waiting to claim the bus busy line")]
    BusyTimeout,
    #[error("busy line GPIO reconfiguration failed")]
    Lock,
    #[error("i2c transaction failed after retries")]
    Io,
    #[error("response CRC mismatch")]
    CrcMismatch,
    #[error("bad transaction arguments: {0}")]
    BadArg(&'static str),
    #[error("rpc failure: {0}")]
    Rpc(String),
}

impl I2cError {
    /// Decode a server-side failure from its D-Bus error name.
    pub fn from_rpc_error(e: &dbus::Error) -> Self {
        match e.name() {
            Some(err_name::BUSY_TIMEOUT) => Self::BusyTimeout,
            Some(err_name::LOCK) => Self::Lock,
            Some(err_name::IO) => Self::Io,
            Some(err_name::BAD_ARG) => Self::BadArg("rejected by arbiter"),
            _ => Self::Rpc(e.message().unwrap_or("unknown dbus failure").to_string()),
        }
    }
}

/// Reject out-of-bounds transactions before they reach the wire.
pub fn validate(write: &[u8], read_len: usize) -> Result<(), I2cError> {
    if write.len() > MAX_WRITE_LEN {
        return Err(I2cError::BadArg("write longer than 64 bytes"));
    }
    if read_len > MAX_READ_LEN {
        return Err(I2cError::BadArg("read longer than 32 bytes"));
    }
    Ok(())
}

/// The transaction seam every peripheral driver is written against.
///
/// Production code hands drivers an [`I2cProxy`] (or, inside the arbiter
/// process itself, the arbiter's own queue handle); tests hand them a
/// scripted fake. Injection happens at construction; there is no global
/// to mutate.
pub trait Bus: Send {
    fn tx(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, I2cError>;

    /// CRC-wrapped transaction for peripherals that frame their traffic in
    /// CRC-16/AUG-CCITT (the ATtiny). Appends the CRC to `write`, asks for
    /// `read_len + 2` bytes when reading, verifies and strips the trailing
    /// CRC. Issues exactly one underlying `tx` either way.
    fn tx_with_crc(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, I2cError> {
        let framed = crc_frames::append_crc16(write);
        let wire_read_len = if read_len > 0 { read_len + 2 } else { 0 };
        let response = self.tx(addr, &framed, wire_read_len, timeout)?;
        if read_len == 0 {
            return Ok(response);
        }
        match crc_frames::split_verified_crc16(&response) {
            Ok(payload) => Ok(payload.to_vec()),
            Err(_) => Err(I2cError::CrcMismatch),
        }
    }
}

/// Link phase of a proxy, advanced on every call. The `Connecting` grace
/// window covers service start order after boot; a proxy that outlives it
/// without ever reaching the arbiter is `Failed` for good and its owner is
/// expected to exit and be restarted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LinkState {
    Connecting { since: Instant },
    Ready,
    Failed,
}

/// Blocking D-Bus client of the arbiter.
pub struct I2cProxy {
    conn: Connection,
    state: LinkState,
}

impl I2cProxy {
    pub fn new_system() -> Result<Self, I2cError> {
        let conn = Connection::new_system().map_err(|e| I2cError::Rpc(e.to_string()))?;
        Ok(Self {
            conn,
            state: LinkState::Connecting { since: Instant::now() },
        })
    }

    fn call(
        &self,
        addr: u8,
        write: &[u8],
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, dbus::Error> {
        // The method timeout must outlast the arbiter's own claim timeout
        // or we would race its BusyTimeout reply.
        let proxy = self.conn.with_proxy(
            I2C_BUS_NAME,
            I2C_OBJECT_PATH,
            timeout + Duration::from_secs(2),
        );
        let (bytes,): (Vec<u8>,) = proxy.method_call(
            I2C_INTERFACE,
            "Tx",
            (
                addr,
                write.to_vec(),
                read_len as i32,
                timeout.as_millis() as i32,
            ),
        )?;
        Ok(bytes)
    }

    fn name_not_owned(e: &dbus::Error) -> bool {
        matches!(
            e.name(),
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
                | Some("org.freedesktop.DBus.Error.NameHasNoOwner")
        )
    }
}

impl Bus for I2cProxy {
    fn tx(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, I2cError> {
        validate(write, read_len)?;
        loop {
            let since = match self.state {
                LinkState::Failed => return Err(I2cError::ServiceUnavailable),
                LinkState::Connecting { since } => since,
                // A service that vanishes after we reached it is treated
                // as restarting: reopen the connect window.
                LinkState::Ready => Instant::now(),
            };
            match self.call(addr, write, read_len, timeout) {
                Ok(bytes) => {
                    self.state = LinkState::Ready;
                    return Ok(bytes);
                }
                Err(e) if Self::name_not_owned(&e) => {
                    if since.elapsed() >= CONNECT_WINDOW {
                        self.state = LinkState::Failed;
                        return Err(I2cError::ServiceUnavailable);
                    }
                    log::debug!("{} not on the bus yet; retrying", I2C_BUS_NAME);
                    self.state = LinkState::Connecting { since };
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(I2cError::from_rpc_error(&e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted bus: pops one canned reply per tx and records the frames
    /// it was handed.
    struct ScriptedBus {
        replies: Vec<Result<Vec<u8>, I2cError>>,
        seen: Vec<(u8, Vec<u8>, usize)>,
    }

    impl ScriptedBus {
        fn new(mut replies: Vec<Result<Vec<u8>, I2cError>>) -> Self {
            replies.reverse();
            Self { replies, seen: Vec::new() }
        }
    }

    impl Bus for ScriptedBus {
        fn tx(
            &mut self,
            addr: u8,
            write: &[u8],
            read_len: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, I2cError> {
            self.seen.push((addr, write.to_vec(), read_len));
            self.replies.pop().expect("unexpected extra tx")
        }
    }

    const T: Duration = Duration::from_millis(50);

    #[test]
    fn tx_with_crc_frames_the_write_and_strips_the_read() {
        let payload = vec![0x07, 0x01];
        let reply = crc_frames::append_crc16(&payload);
        let mut bus = ScriptedBus::new(vec![Ok(reply)]);
        let got = bus.tx_with_crc(wire::ADDR_ATTINY, &[0x07], 2, T).unwrap();
        assert_eq!(got, payload);

        let (addr, wire_write, wire_read_len) = bus.seen.remove(0);
        assert_eq!(addr, wire::ADDR_ATTINY);
        // Write gained a big-endian CRC-16, read grew by the CRC width.
        assert_eq!(wire_write, crc_frames::append_crc16(&[0x07]));
        assert_eq!(wire_read_len, 4);
    }

    #[test]
    fn tx_with_crc_mismatch_after_single_underlying_tx() {
        let mut reply = crc_frames::append_crc16(&[0xaa]);
        *reply.last_mut().unwrap() ^= 0xff;
        let mut bus = ScriptedBus::new(vec![Ok(reply)]);
        let err = bus.tx_with_crc(wire::ADDR_ATTINY, &[0x01], 1, T).unwrap_err();
        assert_eq!(err, I2cError::CrcMismatch);
        // The arbiter was asked exactly once; CRC failures are not retried.
        assert_eq!(bus.seen.len(), 1);
    }

    #[test]
    fn tx_with_crc_pure_write_reads_nothing() {
        let mut bus = ScriptedBus::new(vec![Ok(vec![])]);
        bus.tx_with_crc(wire::ADDR_ATTINY, &[0x03, 0x10], 0, T).unwrap();
        let (_, wire_write, wire_read_len) = bus.seen.remove(0);
        assert_eq!(wire_read_len, 0);
        assert_eq!(wire_write.len(), 4);
    }

    #[test]
    fn bounds_are_enforced() {
        assert!(validate(&[0; 64], 32).is_ok());
        assert!(matches!(validate(&[0; 65], 0), Err(I2cError::BadArg(_))));
        assert!(matches!(validate(&[], 33), Err(I2cError::BadArg(_))));
    }
}
