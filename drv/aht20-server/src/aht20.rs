// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the AHT20 temperature/humidity sensor at 0x38.
//!
//! A measurement is a 7-byte frame read from the status register: one
//! status byte, five data bytes packing 20-bit humidity and temperature
//! counts, and a CRC-8 over the first six bytes. Some sensor revisions in
//! the field never compute the CRC and send 0xFF instead; see
//! [`Aht20::make_reading`] for the fallback that tells those apart from
//! genuinely corrupt frames.

use std::time::Duration;

use drv_i2c_api::{wire, Bus, I2cError};
use thiserror::Error;

const REG_STATUS: u8 = 0x71;
const CMD_CALIBRATE: [u8; 3] = [0xbe, 0x08, 0x00];
const CMD_TRIGGER: [u8; 3] = [0xac, 0x33, 0x00];

const BIT_BUSY: u8 = 0x80;
const BIT_CALIBRATED: u8 = 0x08;

const TX_TIMEOUT: Duration = Duration::from_millis(1000);

/// Calibration handshake: attempts and the post-command settle.
const CALIBRATE_ATTEMPTS: u32 = 5;
const CALIBRATE_SETTLE: Duration = Duration::from_millis(100);

/// Measurement-ready polling after a trigger, and the overall retry
/// budget for one reading.
const READY_POLLS: u32 = 3;
const READY_POLL_GAP: Duration = Duration::from_millis(100);
const READING_ATTEMPTS: u32 = 5;

/// Values a working sensor can physically report; used by the no-CRC
/// fallback to reject frames that merely repeat their garbage.
const TEMP_RANGE: std::ops::RangeInclusive<f32> = -40.0..=85.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f32> = 0.0..=100.0;

/// Agreement required between two no-CRC readings before trusting them.
const FALLBACK_AGREEMENT: f32 = 1.0;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Aht20Error {
    #[error("sensor bus access failed: {0}")]
    Bus(I2cError),
    #[error("sensor would not calibrate")]
    NotCalibrated,
    #[error("sensor stayed busy after a trigger")]
    NeverReady,
    #[error("measurement failed its CRC")]
    BadCrc,
}

impl From<I2cError> for Aht20Error {
    fn from(e: I2cError) -> Self {
        Aht20Error::Bus(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Measurement {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub humidity: f32,
    /// CRC byte as received.
    pub crc: u8,
    /// Set when the reading was accepted through the no-CRC fallback.
    pub crc_invalid: bool,
}

/// Unpack the five data bytes of a measurement frame.
pub fn decode(frame: &[u8; 7]) -> Measurement {
    let humidity_raw = ((frame[1] as u32) << 12)
        | ((frame[2] as u32) << 4)
        | ((frame[3] as u32) >> 4);
    let temp_raw = (((frame[3] & 0x0f) as u32) << 16)
        | ((frame[4] as u32) << 8)
        | (frame[5] as u32);
    const FULL_SCALE: f32 = (1u32 << 20) as f32;
    Measurement {
        humidity: humidity_raw as f32 / FULL_SCALE * 100.0,
        temperature: temp_raw as f32 / FULL_SCALE * 200.0 - 50.0,
        crc: frame[6],
        crc_invalid: false,
    }
}

fn plausible(m: &Measurement) -> bool {
    TEMP_RANGE.contains(&m.temperature) && HUMIDITY_RANGE.contains(&m.humidity)
}

fn agree(a: &Measurement, b: &Measurement) -> bool {
    (a.temperature - b.temperature).abs() <= FALLBACK_AGREEMENT
        && (a.humidity - b.humidity).abs() <= FALLBACK_AGREEMENT
}

pub struct Aht20<B> {
    bus: B,
}

impl<B: Bus> Aht20<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    fn read_status(&mut self) -> Result<u8, Aht20Error> {
        let status = self.bus.tx(wire::ADDR_AHT20, &[REG_STATUS], 1, TX_TIMEOUT)?;
        Ok(status[0])
    }

    /// Run the calibration handshake until the status register reports
    /// calibrated, issuing the initialize command as needed.
    pub fn ensure_calibrated(&mut self) -> Result<(), Aht20Error> {
        for attempt in 0..CALIBRATE_ATTEMPTS {
            if self.read_status()? & BIT_CALIBRATED != 0 {
                if attempt > 0 {
                    log::info!("sensor calibrated after {} attempts", attempt);
                }
                return Ok(());
            }
            self.bus.tx(wire::ADDR_AHT20, &CMD_CALIBRATE, 0, TX_TIMEOUT)?;
            std::thread::sleep(CALIBRATE_SETTLE);
        }
        Err(Aht20Error::NotCalibrated)
    }

    /// One trigger/poll/read cycle. Returns the decoded measurement and
    /// the CRC computed over the frame.
    fn measure_once(&mut self) -> Result<(Measurement, u8), Aht20Error> {
        self.bus.tx(wire::ADDR_AHT20, &CMD_TRIGGER, 0, TX_TIMEOUT)?;

        let mut ready = false;
        for _ in 0..READY_POLLS {
            std::thread::sleep(READY_POLL_GAP);
            if self.read_status()? & BIT_BUSY == 0 {
                ready = true;
                break;
            }
        }
        if !ready {
            return Err(Aht20Error::NeverReady);
        }

        let bytes = self.bus.tx(wire::ADDR_AHT20, &[REG_STATUS], 7, TX_TIMEOUT)?;
        let frame: [u8; 7] = bytes
            .try_into()
            .map_err(|_| Aht20Error::Bus(I2cError::Rpc("short sensor read".to_string())))?;
        Ok((decode(&frame), crc_frames::crc8(&frame[..6])))
    }

    /// Take a measurement, spending up to five cycles on sensors that are
    /// slow to leave busy.
    ///
    /// A received CRC of exactly 0xFF is taken as a hint that this is a
    /// no-CRC sensor revision rather than line noise: the reading is held
    /// back, a second cycle runs, and the pair is accepted when both
    /// decode to physically possible values that agree within one unit.
    /// Anything else CRC-shaped fails as [`Aht20Error::BadCrc`].
    pub fn make_reading(&mut self) -> Result<Measurement, Aht20Error> {
        let mut held_back: Option<Measurement> = None;
        let mut last = Aht20Error::NeverReady;
        for _ in 0..READING_ATTEMPTS {
            let (m, computed) = match self.measure_once() {
                Ok(pair) => pair,
                Err(e @ Aht20Error::Bus(_)) => return Err(e),
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            if m.crc == computed {
                return Ok(m);
            }
            if m.crc != 0xff {
                return Err(Aht20Error::BadCrc);
            }
            match held_back {
                None => held_back = Some(m),
                Some(first) => {
                    if agree(&first, &m) && plausible(&first) && plausible(&m) {
                        return Ok(Measurement { crc_invalid: true, ..m });
                    }
                    return Err(Aht20Error::BadCrc);
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedBus {
        script: VecDeque<(Vec<u8>, Result<Vec<u8>, I2cError>)>,
    }

    impl ScriptedBus {
        fn new(script: Vec<(Vec<u8>, Result<Vec<u8>, I2cError>)>) -> Self {
            Self { script: script.into() }
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
            assert_eq!(addr, wire::ADDR_AHT20);
            let (expect, reply) = self.script.pop_front().expect("unexpected extra tx");
            assert_eq!(write, &expect[..]);
            let reply = reply?;
            assert_eq!(reply.len(), read_len);
            Ok(reply)
        }
    }

    const STATUS_IDLE: u8 = BIT_CALIBRATED;

    /// Build a frame for the given raw counts, with a correct CRC unless
    /// one is supplied.
    fn frame(humidity_raw: u32, temp_raw: u32, crc: Option<u8>) -> Vec<u8> {
        let mut f = vec![
            STATUS_IDLE,
            (humidity_raw >> 12) as u8,
            (humidity_raw >> 4) as u8,
            (((humidity_raw & 0x0f) << 4) as u8) | ((temp_raw >> 16) as u8 & 0x0f),
            (temp_raw >> 8) as u8,
            temp_raw as u8,
        ];
        f.push(crc.unwrap_or_else(|| crc_frames::crc8(&f)));
        f
    }

    /// Raw counts for roughly 45 %RH and 22 °C.
    const HUM_RAW: u32 = 471_859;
    const TEMP_RAW: u32 = 377_487;

    fn cycle(reply_frame: Vec<u8>) -> Vec<(Vec<u8>, Result<Vec<u8>, I2cError>)> {
        vec![
            (CMD_TRIGGER.to_vec(), Ok(vec![])),
            (vec![REG_STATUS], Ok(vec![STATUS_IDLE])),
            (vec![REG_STATUS], Ok(reply_frame)),
        ]
    }

    #[test]
    fn decode_unpacks_the_twenty_bit_fields() {
        let f: [u8; 7] = frame(1 << 19, 1 << 19, None).try_into().unwrap();
        let m = decode(&f);
        assert!((m.humidity - 50.0).abs() < 0.001);
        assert!((m.temperature - 50.0).abs() < 0.001);

        let f: [u8; 7] = frame(0, 0, None).try_into().unwrap();
        let m = decode(&f);
        assert!((m.humidity - 0.0).abs() < 0.001);
        assert!((m.temperature + 50.0).abs() < 0.001);
    }

    #[test]
    fn good_crc_reading_passes_first_time() {
        let mut sensor = Aht20::new(ScriptedBus::new(cycle(frame(HUM_RAW, TEMP_RAW, None))));
        let m = sensor.make_reading().unwrap();
        assert!((m.temperature - 22.0).abs() < 0.1);
        assert!((m.humidity - 45.0).abs() < 0.1);
        assert!(!m.crc_invalid);
    }

    #[test]
    fn no_crc_sensor_is_accepted_after_two_agreeing_readings() {
        // Two cycles with CRC byte 0xFF and temperature 0.1 degrees
        // apart; the second sample's values come back, flagged.
        let second_temp_raw = TEMP_RAW + 524; // ~0.1 degC in counts
        let mut script = cycle(frame(HUM_RAW, TEMP_RAW, Some(0xff)));
        script.extend(cycle(frame(HUM_RAW, second_temp_raw, Some(0xff))));
        let mut sensor = Aht20::new(ScriptedBus::new(script));

        let m = sensor.make_reading().unwrap();
        let expected: [u8; 7] = frame(HUM_RAW, second_temp_raw, Some(0xff)).try_into().unwrap();
        assert_eq!(
            (m.temperature, m.humidity),
            (decode(&expected).temperature, decode(&expected).humidity)
        );
        assert!(m.crc_invalid);
        assert_eq!(m.crc, 0xff);
    }

    #[test]
    fn repeated_garbage_with_ff_crc_is_still_bad() {
        // The classic stuck frame: 00 00 00 FF 00 00 FF decodes to an
        // impossible 137.5 degC, so agreement between two of them proves
        // nothing.
        let garbage = vec![0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0xff];
        let mut script = cycle(garbage.clone());
        script.extend(cycle(garbage));
        let mut sensor = Aht20::new(ScriptedBus::new(script));
        assert_eq!(sensor.make_reading(), Err(Aht20Error::BadCrc));
    }

    #[test]
    fn disagreeing_no_crc_readings_are_bad() {
        let mut script = cycle(frame(HUM_RAW, TEMP_RAW, Some(0xff)));
        // Second reading five degrees away: not a stable no-CRC sensor.
        script.extend(cycle(frame(HUM_RAW, TEMP_RAW + 26_214, Some(0xff))));
        let mut sensor = Aht20::new(ScriptedBus::new(script));
        assert_eq!(sensor.make_reading(), Err(Aht20Error::BadCrc));
    }

    #[test]
    fn wrong_crc_that_is_not_ff_fails_immediately() {
        let mut sensor =
            Aht20::new(ScriptedBus::new(cycle(frame(HUM_RAW, TEMP_RAW, Some(0x12)))));
        assert_eq!(sensor.make_reading(), Err(Aht20Error::BadCrc));
    }

    #[test]
    fn busy_sensor_exhausts_ready_polls_then_retries() {
        let busy = STATUS_IDLE | BIT_BUSY;
        let mut script = vec![
            (CMD_TRIGGER.to_vec(), Ok(vec![])),
            (vec![REG_STATUS], Ok(vec![busy])),
            (vec![REG_STATUS], Ok(vec![busy])),
            (vec![REG_STATUS], Ok(vec![busy])),
        ];
        // Second attempt succeeds.
        script.extend(cycle(frame(HUM_RAW, TEMP_RAW, None)));
        let mut sensor = Aht20::new(ScriptedBus::new(script));
        assert!(sensor.make_reading().is_ok());
    }

    #[test]
    fn calibration_handshake_issues_init_until_bit_set() {
        let mut sensor = Aht20::new(ScriptedBus::new(vec![
            (vec![REG_STATUS], Ok(vec![0x00])),
            (CMD_CALIBRATE.to_vec(), Ok(vec![])),
            (vec![REG_STATUS], Ok(vec![0x00])),
            (CMD_CALIBRATE.to_vec(), Ok(vec![])),
            (vec![REG_STATUS], Ok(vec![BIT_CALIBRATED])),
        ]));
        sensor.ensure_calibrated().unwrap();
    }

    #[test]
    fn calibration_gives_up_after_five_attempts() {
        let mut script = Vec::new();
        for _ in 0..5 {
            script.push((vec![REG_STATUS], Ok(vec![0x00])));
            script.push((CMD_CALIBRATE.to_vec(), Ok(vec![])));
        }
        let mut sensor = Aht20::new(ScriptedBus::new(script));
        assert_eq!(sensor.ensure_calibrated(), Err(Aht20Error::NotCalibrated));
    }

    #[test]
    fn bus_errors_are_not_retried_here() {
        let mut sensor = Aht20::new(ScriptedBus::new(vec![(
            CMD_TRIGGER.to_vec(),
            Err(I2cError::BusyTimeout),
        )]));
        assert_eq!(
            sensor.make_reading(),
            Err(Aht20Error::Bus(I2cError::BusyTimeout))
        );
    }
}
