// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CRC codecs and frame helpers shared by the HAT peripheral protocols.
//!
//! Two checksums are in play on this board, and they must match the
//! RP2040/ATtiny firmware bit-for-bit:
//!
//! - CRC-16/AUG-CCITT for ATtiny traffic and the EEPROM identity block.
//!   Transmitted big-endian, high byte first.
//! - CRC-8 (poly 0x31) for AHT20 measurement frames.
//!
//! The parameters are spelled out as `Algorithm` constants rather than
//! pulled from the `crc` catalog so a diff against the firmware constants
//! is a one-screen job.

use crc::{Algorithm, Crc};

/// CRC-16, init 0x1D0F, poly 0x1021, MSB-first, no reflection, no final
/// XOR. Known as AUG-CCITT; check value over b"123456789" is 0xE5CC.
pub const CRC16_AUG_CCITT: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x1d0f,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0xe5cc,
    residue: 0x0000,
};

/// CRC-8, poly 0x31, init 0xFF, no reflection, no final XOR. The AHT20
/// datasheet calls this "CRC8/MAXIM" but the parameters are NRSC-5's;
/// check value over b"123456789" is 0xF7.
pub const CRC8_AHT20: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0xff,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xf7,
    residue: 0x00,
};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC16_AUG_CCITT);
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC8_AHT20);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to carry a trailing CRC-16.
    Truncated,
    /// Trailing CRC did not match the payload. Carries (received, computed).
    Mismatch(u16, u16),
}

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Append a big-endian CRC-16 over `payload`.
pub fn append_crc16(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(payload).to_be_bytes());
    frame
}

/// Split a frame into payload and trailing big-endian CRC-16, verifying
/// the CRC over everything before it.
pub fn split_verified_crc16(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_be_bytes([tail[0], tail[1]]);
    let computed = crc16(payload);
    if received != computed {
        return Err(FrameError::Mismatch(received, computed));
    }
    Ok(payload)
}
