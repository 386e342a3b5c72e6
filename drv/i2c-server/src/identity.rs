// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The board-identity record stored on the HAT EEPROM, and its JSON
//! mirror form.
//!
//! On the wire a record is `[magic][version][body][crc16]`: magic 0xCA
//! first, a version byte selecting the body layout, and a trailing
//! big-endian CRC-16/AUG-CCITT over every byte before it. Two layouts are
//! in circulation:
//!
//! - version 1: hardware version (major, minor, patch), u64 ID, u32 Unix
//!   time; 19 bytes total;
//! - version 2: a SemVer triple each for the main, power, touch and
//!   microphone PCBs, an audio-only flag, u64 ID, u32 Unix time;
//!   29 bytes total.
//!
//! Integers are big-endian. Chips from before versioning carry a zero
//! where the version byte lives and fail the CRC; they are reported as
//! [`IdentityError::LegacyUnversioned`] so the store can rewrite them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC: u8 = 0xca;

pub const VERSION_1: u8 = 1;
pub const VERSION_2: u8 = 2;

pub const V1_LEN: usize = 19;
pub const V2_LEN: usize = 29;

/// Longest layout; what the store reads from offset 0 when probing.
pub const MAX_LEN: usize = V2_LEN;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity block is empty (all 0xFF)")]
    Empty,
    #[error("bad magic byte {0:#04x} at offset 0")]
    BadMagic(u8),
    #[error("unknown identity version {0}")]
    UnknownVersion(u8),
    #[error("identity block shorter than its layout")]
    Truncated,
    #[error("identity block CRC mismatch (version {version})")]
    CrcFail { version: u8 },
    #[error("un-versioned legacy identity block")]
    LegacyUnversioned,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SemVer {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityV1 {
    pub hardware: SemVer,
    pub id: u64,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentityV2 {
    pub main_pcb: SemVer,
    pub power_pcb: SemVer,
    pub touch_pcb: SemVer,
    pub microphone_pcb: SemVer,
    pub audio_only: bool,
    pub id: u64,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Identity {
    V1(IdentityV1),
    V2(IdentityV2),
}

/// What the service assumes when no EEPROM is fitted: the last board
/// revision shipped without one.
pub fn no_chip_default() -> Identity {
    Identity::V1(IdentityV1 {
        hardware: SemVer::new(0, 1, 4),
        id: 0,
        time: DateTime::UNIX_EPOCH,
    })
}

/// Version-to-layout table; the version byte at offset 1 selects the row.
struct Layout {
    version: u8,
    total_len: usize,
    decode_body: fn(&[u8]) -> Identity,
}

const LAYOUTS: &[Layout] = &[
    Layout {
        version: VERSION_1,
        total_len: V1_LEN,
        decode_body: decode_v1_body,
    },
    Layout {
        version: VERSION_2,
        total_len: V2_LEN,
        decode_body: decode_v2_body,
    },
];

fn wire_time(time: DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, u32::MAX as i64) as u32
}

fn time_from_wire(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn decode_v1_body(body: &[u8]) -> Identity {
    Identity::V1(IdentityV1 {
        hardware: SemVer::new(body[0], body[1], body[2]),
        id: u64::from_be_bytes(body[3..11].try_into().unwrap()),
        time: time_from_wire(u32::from_be_bytes(body[11..15].try_into().unwrap())),
    })
}

fn decode_v2_body(body: &[u8]) -> Identity {
    let pcb = |at: usize| SemVer::new(body[at], body[at + 1], body[at + 2]);
    Identity::V2(IdentityV2 {
        main_pcb: pcb(0),
        power_pcb: pcb(3),
        touch_pcb: pcb(6),
        microphone_pcb: pcb(9),
        audio_only: body[12] != 0,
        id: u64::from_be_bytes(body[13..21].try_into().unwrap()),
        time: time_from_wire(u32::from_be_bytes(body[21..25].try_into().unwrap())),
    })
}

impl Identity {
    pub fn version(&self) -> u8 {
        match self {
            Identity::V1(_) => VERSION_1,
            Identity::V2(_) => VERSION_2,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Identity::V1(r) => r.id,
            Identity::V2(r) => r.id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = vec![MAGIC, self.version()];
        match self {
            Identity::V1(r) => {
                payload.extend_from_slice(&[r.hardware.major, r.hardware.minor, r.hardware.patch]);
                payload.extend_from_slice(&r.id.to_be_bytes());
                payload.extend_from_slice(&wire_time(r.time).to_be_bytes());
            }
            Identity::V2(r) => {
                for pcb in [&r.main_pcb, &r.power_pcb, &r.touch_pcb, &r.microphone_pcb] {
                    payload.extend_from_slice(&[pcb.major, pcb.minor, pcb.patch]);
                }
                payload.push(r.audio_only as u8);
                payload.extend_from_slice(&r.id.to_be_bytes());
                payload.extend_from_slice(&wire_time(r.time).to_be_bytes());
            }
        }
        crc_frames::append_crc16(&payload)
    }

    pub fn decode(block: &[u8]) -> Result<Identity, IdentityError> {
        if block.iter().all(|&b| b == 0xff) {
            return Err(IdentityError::Empty);
        }
        if block.len() < 2 {
            return Err(IdentityError::Truncated);
        }
        if block[0] != MAGIC {
            return Err(IdentityError::BadMagic(block[0]));
        }
        let version = block[1];
        if version == 0 {
            // Pre-versioning chips: no layout to verify a CRC against.
            return Err(IdentityError::LegacyUnversioned);
        }
        let layout = LAYOUTS
            .iter()
            .find(|l| l.version == version)
            .ok_or(IdentityError::UnknownVersion(version))?;
        let record = block
            .get(..layout.total_len)
            .ok_or(IdentityError::Truncated)?;
        crc_frames::split_verified_crc16(record)
            .map_err(|_| IdentityError::CrcFail { version })?;
        // CRC covers magic and version too; the body starts past them.
        Ok((layout.decode_body)(&record[2..layout.total_len - 2]))
    }

    /// Reconciliation equality: hardware versions, ID, and the timestamp
    /// truncated to seconds (the wire only carries seconds anyway).
    pub fn equivalent(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::V1(a), Identity::V1(b)) => {
                a.hardware == b.hardware
                    && a.id == b.id
                    && a.time.timestamp() == b.time.timestamp()
            }
            (Identity::V2(a), Identity::V2(b)) => {
                a.main_pcb == b.main_pcb
                    && a.power_pcb == b.power_pcb
                    && a.touch_pcb == b.touch_pcb
                    && a.microphone_pcb == b.microphone_pcb
                    && a.audio_only == b.audio_only
                    && a.id == b.id
                    && a.time.timestamp() == b.time.timestamp()
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Identity::V1(r) => serde_json::to_string_pretty(&MirrorV1 {
                version: VERSION_1,
                major: r.hardware.major,
                minor: r.hardware.minor,
                patch: r.hardware.patch,
                id: r.id,
                time: r.time,
            }),
            Identity::V2(r) => serde_json::to_string_pretty(&MirrorV2 {
                version: VERSION_2,
                main_pcb: r.main_pcb,
                power_pcb: r.power_pcb,
                microphone_pcb: r.microphone_pcb,
                touch_pcb: r.touch_pcb,
                id: r.id,
                time: r.time,
                audio_only: r.audio_only,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Identity, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.get("version").and_then(|v| v.as_u64()) == Some(VERSION_2 as u64) {
            let m: MirrorV2 = serde_json::from_value(value)?;
            Ok(Identity::V2(IdentityV2 {
                main_pcb: m.main_pcb,
                power_pcb: m.power_pcb,
                touch_pcb: m.touch_pcb,
                microphone_pcb: m.microphone_pcb,
                audio_only: m.audio_only,
                id: m.id,
                time: m.time,
            }))
        } else {
            let m: MirrorV1 = serde_json::from_value(value)?;
            Ok(Identity::V1(IdentityV1 {
                hardware: SemVer::new(m.major, m.minor, m.patch),
                id: m.id,
                time: m.time,
            }))
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MirrorV1 {
    version: u8,
    major: u8,
    minor: u8,
    patch: u8,
    id: u64,
    time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct MirrorV2 {
    version: u8,
    #[serde(rename = "mainPCB")]
    main_pcb: SemVer,
    #[serde(rename = "powerPCB")]
    power_pcb: SemVer,
    #[serde(rename = "microphonePCB")]
    microphone_pcb: SemVer,
    #[serde(rename = "touchPCB")]
    touch_pcb: SemVer,
    id: u64,
    time: DateTime<Utc>,
    #[serde(rename = "audioOnly")]
    audio_only: bool,
}
