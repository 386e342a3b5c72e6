// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Paged access to the identity EEPROM at 0x50, and the startup
//! reconciliation between the chip and its JSON mirror on disk.
//!
//! The chip is organised in 16-byte pages and a single transaction must
//! not cross a page boundary. Every page transaction is preceded by a
//! one-byte absolute offset pointer; page writes are followed by a short
//! settle pause because the chip NACKs while its internal write cycle
//! runs.

use std::path::PathBuf;
use std::time::Duration;

use drv_i2c_api::{wire, Bus, I2cError};
use thiserror::Error;

use crate::identity::{self, Identity, IdentityError};

pub const PAGE_SIZE: usize = 16;
const WRITE_SETTLE: Duration = Duration::from_millis(5);
const TX_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity block damaged: {0}")]
    Corrupt(IdentityError),
    #[error("chip and mirror disagree: {0}")]
    Mismatch(String),
    #[error("eeprom bus access failed: {0}")]
    Bus(I2cError),
    #[error("chip write did not read back: {0}")]
    WriteVerify(String),
    #[error("identity mirror {}: {}", .0.display(), .1)]
    Mirror(PathBuf, String),
}

impl From<I2cError> for StoreError {
    fn from(e: I2cError) -> Self {
        StoreError::Bus(e)
    }
}

/// Split `(offset, len)` into page-respecting `(offset, len)` spans.
fn page_spans(offset: usize, len: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut at = offset;
    let end = offset + len;
    while at < end {
        let page_end = (at / PAGE_SIZE + 1) * PAGE_SIZE;
        let span = page_end.min(end) - at;
        spans.push((at, span));
        at += span;
    }
    spans
}

pub fn read_block<B: Bus>(bus: &mut B, offset: usize, len: usize) -> Result<Vec<u8>, I2cError> {
    let mut block = Vec::with_capacity(len);
    for (at, span) in page_spans(offset, len) {
        let bytes = bus.tx(wire::ADDR_EEPROM, &[at as u8], span, TX_TIMEOUT)?;
        block.extend_from_slice(&bytes);
    }
    Ok(block)
}

pub fn write_block<B: Bus>(bus: &mut B, offset: usize, data: &[u8]) -> Result<(), I2cError> {
    for (at, span) in page_spans(offset, data.len()) {
        let mut frame = Vec::with_capacity(1 + span);
        frame.push(at as u8);
        frame.extend_from_slice(&data[at - offset..at - offset + span]);
        bus.tx(wire::ADDR_EEPROM, &frame, 0, TX_TIMEOUT)?;
        std::thread::sleep(WRITE_SETTLE);
    }
    Ok(())
}

/// What probing the chip at startup found.
enum Chip {
    /// Nothing ACKed at 0x50.
    Absent,
    /// All 0xFF: fresh silicon.
    Empty,
    Populated(Identity),
    /// Magic present, zero version byte: written before records carried a
    /// version. Rewritten with the current default.
    Legacy,
}

pub struct IdentityStore<B> {
    bus: B,
    mirror_path: PathBuf,
}

impl<B: Bus> IdentityStore<B> {
    pub fn new(bus: B, mirror_path: PathBuf) -> Self {
        Self { bus, mirror_path }
    }

    /// Bring chip and mirror into agreement and return the board identity.
    ///
    /// | mirror | chip      | action                                    |
    /// |--------|-----------|-------------------------------------------|
    /// | no     | absent    | write default to mirror                   |
    /// | no     | empty     | write default to chip and mirror          |
    /// | no     | populated | copy chip record into mirror              |
    /// | yes    | absent    | mirror must equal the no-chip default     |
    /// | yes    | populated | chip and mirror must agree                |
    /// | any    | legacy    | overwrite chip and mirror with default    |
    /// | yes    | empty     | restore the mirror's record to the chip   |
    pub fn init(&mut self) -> Result<Identity, StoreError> {
        let chip = self.probe_chip()?;
        let mirror = self.read_mirror()?;
        match (mirror, chip) {
            (None, Chip::Absent) => {
                log::info!("no identity chip and no mirror; recording the no-chip default");
                let record = identity::no_chip_default();
                self.write_mirror(&record)?;
                Ok(record)
            }
            (None, Chip::Empty) => {
                log::info!("blank identity chip; initialising chip and mirror");
                let record = identity::no_chip_default();
                self.write_chip(&record)?;
                self.write_mirror(&record)?;
                Ok(record)
            }
            (None, Chip::Populated(record)) => {
                log::info!("mirroring identity {:#018x} from chip", record.id());
                self.write_mirror(&record)?;
                Ok(record)
            }
            (_, Chip::Legacy) => {
                log::warn!("legacy un-versioned identity chip; rewriting with default");
                let record = identity::no_chip_default();
                self.write_chip(&record)?;
                self.write_mirror(&record)?;
                Ok(record)
            }
            (Some(mirror), Chip::Absent) => {
                let default = identity::no_chip_default();
                if mirror.equivalent(&default) {
                    Ok(mirror)
                } else {
                    Err(StoreError::Mismatch(format!(
                        "no chip fitted but mirror {} is not the no-chip default",
                        self.mirror_path.display()
                    )))
                }
            }
            (Some(mirror), Chip::Populated(record)) => {
                if mirror.equivalent(&record) {
                    Ok(record)
                } else {
                    // Two populated, disagreeing sources; refusing to
                    // guess which one is lying.
                    Err(StoreError::Mismatch(format!(
                        "chip id {:#018x} vs mirror id {:#018x}",
                        record.id(),
                        mirror.id()
                    )))
                }
            }
            (Some(mirror), Chip::Empty) => {
                log::warn!("identity chip blank but mirror exists; restoring chip from mirror");
                self.write_chip(&mirror)?;
                Ok(mirror)
            }
        }
    }

    fn probe_chip(&mut self) -> Result<Chip, StoreError> {
        let block = match read_block(&mut self.bus, 0, identity::MAX_LEN) {
            Ok(block) => block,
            // A NACK at 0x50 is how an unfitted chip presents.
            Err(I2cError::Io) => return Ok(Chip::Absent),
            Err(e) => return Err(e.into()),
        };
        match Identity::decode(&block) {
            Ok(record) => Ok(Chip::Populated(record)),
            Err(IdentityError::Empty) => Ok(Chip::Empty),
            Err(IdentityError::LegacyUnversioned) => Ok(Chip::Legacy),
            Err(e) => Err(StoreError::Corrupt(e)),
        }
    }

    fn write_chip(&mut self, record: &Identity) -> Result<(), StoreError> {
        let block = record.encode();
        write_block(&mut self.bus, 0, &block)?;
        // The identity is written once per board lifetime; spend the extra
        // transaction confirming the cells took it.
        let readback = read_block(&mut self.bus, 0, block.len())?;
        if readback != block {
            return Err(StoreError::WriteVerify(format!(
                "{} bytes at offset 0",
                block.len()
            )));
        }
        Ok(())
    }

    fn read_mirror(&self) -> Result<Option<Identity>, StoreError> {
        let json = match std::fs::read_to_string(&self.mirror_path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Mirror(self.mirror_path.clone(), e.to_string()))
            }
        };
        Identity::from_json(&json)
            .map(Some)
            .map_err(|e| StoreError::Mirror(self.mirror_path.clone(), e.to_string()))
    }

    fn write_mirror(&self, record: &Identity) -> Result<(), StoreError> {
        let to_mirror_err =
            |e: String| StoreError::Mirror(self.mirror_path.clone(), e);
        if let Some(dir) = self.mirror_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| to_mirror_err(e.to_string()))?;
        }
        let json = record.to_json().map_err(|e| to_mirror_err(e.to_string()))?;
        std::fs::write(&self.mirror_path, json).map_err(|e| to_mirror_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityV1, IdentityV2, SemVer};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory 256-byte chip that enforces the page discipline: any
    /// transaction whose data crosses a 16-byte boundary panics the test.
    struct FakeChip {
        mem: [u8; 256],
        absent: bool,
        writes: Vec<Vec<u8>>,
    }

    impl FakeChip {
        fn blank() -> Self {
            Self { mem: [0xff; 256], absent: false, writes: Vec::new() }
        }

        fn absent() -> Self {
            Self { mem: [0xff; 256], absent: true, writes: Vec::new() }
        }

        fn with_record(record: &Identity) -> Self {
            let mut chip = Self::blank();
            let block = record.encode();
            chip.mem[..block.len()].copy_from_slice(&block);
            chip
        }
    }

    impl Bus for FakeChip {
        fn tx(
            &mut self,
            addr: u8,
            write: &[u8],
            read_len: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, I2cError> {
            assert_eq!(addr, wire::ADDR_EEPROM);
            if self.absent {
                return Err(I2cError::Io);
            }
            let offset = write[0] as usize;
            if read_len > 0 {
                assert!(write.len() == 1, "read must send only the pointer");
                assert_eq!(
                    offset / PAGE_SIZE,
                    (offset + read_len - 1) / PAGE_SIZE,
                    "read crossed a page boundary"
                );
                Ok(self.mem[offset..offset + read_len].to_vec())
            } else {
                let data = &write[1..];
                assert!(!data.is_empty());
                assert_eq!(
                    offset / PAGE_SIZE,
                    (offset + data.len() - 1) / PAGE_SIZE,
                    "write crossed a page boundary"
                );
                self.mem[offset..offset + data.len()].copy_from_slice(data);
                self.writes.push(write.to_vec());
                Ok(Vec::new())
            }
        }
    }

    fn mirror_path() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "eeprom-mirror-{}-{}.json",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn v2_record() -> Identity {
        Identity::V2(IdentityV2 {
            main_pcb: SemVer::new(1, 3, 0),
            power_pcb: SemVer::new(0, 2, 1),
            touch_pcb: SemVer::new(0, 1, 1),
            microphone_pcb: SemVer::new(1, 0, 0),
            audio_only: false,
            id: 0x1122_3344_5566_7788,
            time: DateTime::from_timestamp(1_720_000_000, 0).unwrap(),
        })
    }

    struct TempMirror(PathBuf);
    impl Drop for TempMirror {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn page_spans_respect_boundaries() {
        assert_eq!(page_spans(0, 29), vec![(0, 16), (16, 13)]);
        assert_eq!(page_spans(0, 16), vec![(0, 16)]);
        assert_eq!(page_spans(5, 20), vec![(5, 11), (16, 9)]);
        assert_eq!(page_spans(0, 0), Vec::<(usize, usize)>::new());
    }

    #[test]
    fn v2_write_is_paged_and_reads_back_identically() {
        let record = v2_record();
        let block = record.encode();
        let mut chip = FakeChip::blank();

        write_block(&mut chip, 0, &block).unwrap();

        // Two page writes: a full first page, the remainder in the second,
        // each carrying its absolute offset pointer up front.
        assert_eq!(chip.writes.len(), 2);
        assert_eq!(chip.writes[0][0], 0x00);
        assert_eq!(chip.writes[0].len(), 1 + 16);
        assert_eq!(chip.writes[1][0], 0x10);
        assert_eq!(chip.writes[1].len(), 1 + (block.len() - 16));

        let readback = read_block(&mut chip, 0, block.len()).unwrap();
        assert_eq!(readback, block);
        assert_eq!(Identity::decode(&readback).unwrap(), record);
    }

    #[test]
    fn blank_chip_and_no_mirror_initialises_both() {
        let mirror = TempMirror(mirror_path());
        let mut store = IdentityStore::new(FakeChip::blank(), mirror.0.clone());

        let record = store.init().unwrap();
        assert!(record.equivalent(&identity::no_chip_default()));

        // The chip write went out paged, and the mirror landed on disk.
        assert!(!store.bus.writes.is_empty());
        assert_eq!(store.bus.writes[0][0], 0x00);
        assert_eq!(&store.bus.mem[..2], &[identity::MAGIC, identity::VERSION_1]);
        let mirrored = Identity::from_json(&std::fs::read_to_string(&mirror.0).unwrap()).unwrap();
        assert!(mirrored.equivalent(&record));
    }

    #[test]
    fn absent_chip_and_no_mirror_writes_mirror_only() {
        let mirror = TempMirror(mirror_path());
        let mut store = IdentityStore::new(FakeChip::absent(), mirror.0.clone());
        let record = store.init().unwrap();
        assert!(record.equivalent(&identity::no_chip_default()));
        assert!(mirror.0.exists());
    }

    #[test]
    fn populated_chip_is_copied_into_a_missing_mirror() {
        let mirror = TempMirror(mirror_path());
        let record = v2_record();
        let mut store = IdentityStore::new(FakeChip::with_record(&record), mirror.0.clone());
        let got = store.init().unwrap();
        assert!(got.equivalent(&record));
        let mirrored = Identity::from_json(&std::fs::read_to_string(&mirror.0).unwrap()).unwrap();
        assert!(mirrored.equivalent(&record));
        // Reading never writes the chip.
        assert!(store.bus.writes.is_empty());
    }

    #[test]
    fn chip_and_matching_mirror_pass() {
        let mirror = TempMirror(mirror_path());
        let record = v2_record();
        std::fs::write(&mirror.0, record.to_json().unwrap()).unwrap();
        let mut store = IdentityStore::new(FakeChip::with_record(&record), mirror.0.clone());
        assert!(store.init().unwrap().equivalent(&record));
    }

    #[test]
    fn chip_and_disagreeing_mirror_refuse_to_guess() {
        let mirror = TempMirror(mirror_path());
        let mut other = v2_record();
        if let Identity::V2(r) = &mut other {
            r.id ^= 1;
        }
        std::fs::write(&mirror.0, other.to_json().unwrap()).unwrap();
        let mut store = IdentityStore::new(FakeChip::with_record(&v2_record()), mirror.0.clone());
        assert!(matches!(store.init(), Err(StoreError::Mismatch(_))));
    }

    #[test]
    fn mirror_without_chip_must_be_the_no_chip_default() {
        let mirror = TempMirror(mirror_path());
        std::fs::write(&mirror.0, identity::no_chip_default().to_json().unwrap()).unwrap();
        let mut store = IdentityStore::new(FakeChip::absent(), mirror.0.clone());
        assert!(store.init().is_ok());

        std::fs::write(&mirror.0, v2_record().to_json().unwrap()).unwrap();
        let mut store = IdentityStore::new(FakeChip::absent(), mirror.0.clone());
        assert!(matches!(store.init(), Err(StoreError::Mismatch(_))));
    }

    #[test]
    fn legacy_chip_is_rewritten_with_the_default() {
        let mirror = TempMirror(mirror_path());
        std::fs::write(&mirror.0, v2_record().to_json().unwrap()).unwrap();
        let mut chip = FakeChip::blank();
        chip.mem[0] = identity::MAGIC;
        chip.mem[1] = 0x00;
        chip.mem[2..10].copy_from_slice(b"oldstuff");
        let mut store = IdentityStore::new(chip, mirror.0.clone());

        let record = store.init().unwrap();
        assert!(record.equivalent(&identity::no_chip_default()));
        let on_chip = Identity::decode(&store.bus.mem[..identity::MAX_LEN]).unwrap();
        assert!(on_chip.equivalent(&record));
        let mirrored = Identity::from_json(&std::fs::read_to_string(&mirror.0).unwrap()).unwrap();
        assert!(mirrored.equivalent(&record));
    }

    #[test]
    fn blank_chip_with_mirror_is_restored_from_it() {
        let mirror = TempMirror(mirror_path());
        let record = v2_record();
        std::fs::write(&mirror.0, record.to_json().unwrap()).unwrap();
        let mut store = IdentityStore::new(FakeChip::blank(), mirror.0.clone());
        let got = store.init().unwrap();
        assert!(got.equivalent(&record));
        let on_chip = Identity::decode(&store.bus.mem[..identity::MAX_LEN]).unwrap();
        assert!(on_chip.equivalent(&record));
    }

    #[test]
    fn corrupt_versioned_chip_is_an_error_not_a_rewrite() {
        let mirror = TempMirror(mirror_path());
        let mut chip = FakeChip::blank();
        let mut block = v2_record().encode();
        block[20] ^= 0xff;
        chip.mem[..block.len()].copy_from_slice(&block);
        let mut store = IdentityStore::new(chip, mirror.0.clone());
        assert!(matches!(store.init(), Err(StoreError::Corrupt(_))));
        // Nothing was written anywhere.
        assert!(store.bus.writes.is_empty());
        assert!(!mirror.0.exists());
    }
}
