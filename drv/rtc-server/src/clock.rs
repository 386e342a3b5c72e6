// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Policy around the bare chip driver: the last-write marker file, drift
//! accounting against it, and pushing RTC time into the system clock.
//!
//! The marker records the UTC timestamp of the last successful RTC write,
//! one `YYYY-MM-DD HH:MM:SS` line. It is rewritten on every write and
//! never deleted; the ticking-liveness check reads it to know whether
//! someone re-trued the clock mid-measurement.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use drv_event_api::{Event, EventKind, EventSink, Severity};
use drv_i2c_api::Bus;

use crate::pcf8563::{Pcf8563, RtcError, RtcTime};

pub const MARKER_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Years before this are taken as "the RTC was never set", not as real
/// time worth pushing into the kernel.
const PLAUSIBLE_YEAR: i32 = 2023;

const SECONDS_PER_MONTH: f64 = 30.0 * 24.0 * 3600.0;

/// Drift thresholds in projected seconds per 30-day month.
const DRIFT_WARN: f64 = 10.0;
const DRIFT_ERROR: f64 = 600.0;

/// Project a measured drift onto a 30-day month. Both the drift and the
/// measurement window carry one second of quantization, so one second is
/// taken off the drift before scaling and the scaled resolution error is
/// taken off the result.
//
// TODO: for windows short enough that the resolution error dominates the
// projection goes negative; decide whether to clamp it to zero instead of
// reporting the raw value.
pub fn project_drift(drift_seconds: f64, window_seconds: f64) -> f64 {
    let scale = SECONDS_PER_MONTH / window_seconds;
    (drift_seconds.abs() - 1.0) * scale - 1.0 * scale
}

pub struct RtcClock<B> {
    chip: Pcf8563<B>,
    marker_path: PathBuf,
    events: Arc<dyn EventSink>,
}

impl<B: Bus> RtcClock<B> {
    pub fn new(bus: B, marker_path: PathBuf, events: Arc<dyn EventSink>) -> Self {
        Self {
            chip: Pcf8563::new(bus),
            marker_path,
            events,
        }
    }

    /// The chip-level operations (alarm registers and friends) pass
    /// straight through.
    pub fn chip(&mut self) -> &mut Pcf8563<B> {
        &mut self.chip
    }

    pub fn get_time(&mut self) -> Result<RtcTime, RtcError> {
        self.chip.get_time()
    }

    /// Write `new` to the chip: pre-read for integrity and drift
    /// accounting, the 7-register write with read-back verification, then
    /// the marker update.
    pub fn write_time(&mut self, new: DateTime<Utc>) -> Result<(), RtcError> {
        match self.chip.read_time() {
            Ok(current) => {
                if !current.integrity {
                    log::warn!("rtc integrity lost; skipping drift accounting");
                    self.events.publish(Event::new(
                        EventKind::RtcIntegrityLost,
                        Severity::Warn,
                        serde_json::json!({ "rtcTime": current.time.to_rfc3339() }),
                    ));
                } else if let Some(marker) = self.read_marker() {
                    self.account_drift(new, &current, marker);
                }
            }
            // An unreadable clock just means no drift datum this round;
            // the write itself may well fix it.
            Err(RtcError::InconsistentRead) | Err(RtcError::GarbledTime) => {
                log::warn!("rtc unreadable before write; skipping drift accounting");
            }
            Err(e) => return Err(e),
        }

        self.chip.set_time(new)?;
        self.write_marker(new)
    }

    /// Push the RTC's time into the kernel clock, the reverse of the NTP
    /// sync path. Refuses when integrity is lost, skips when the chip
    /// holds an implausibly old date.
    pub fn set_system_time(&mut self) -> Result<(), RtcError> {
        let current = self.chip.get_time()?;
        if !current.integrity {
            self.events.publish(Event::new(
                EventKind::RtcIntegrityError,
                Severity::Error,
                serde_json::json!({ "rtcTime": current.time.to_rfc3339() }),
            ));
            return Err(RtcError::IntegrityLost);
        }
        if current.time.year() < PLAUSIBLE_YEAR {
            log::warn!(
                "rtc reports {}; not setting the system clock to the past",
                current.time
            );
            return Ok(());
        }

        let stamp = current.time.format(MARKER_FORMAT).to_string();
        let status = Command::new("date")
            .args(["-u", "-s", &stamp])
            .status()
            .map_err(|e| RtcError::SystemClock(e.to_string()))?;
        if !status.success() {
            return Err(RtcError::SystemClock(format!(
                "date -u -s exited with {}",
                status
            )));
        }
        log::info!("system clock set from rtc: {}", stamp);
        Ok(())
    }

    pub fn read_marker(&self) -> Option<DateTime<Utc>> {
        let line = std::fs::read_to_string(&self.marker_path).ok()?;
        match NaiveDateTime::parse_from_str(line.trim(), MARKER_FORMAT) {
            Ok(naive) => Some(naive.and_utc()),
            Err(e) => {
                log::warn!(
                    "unparseable rtc write marker {}: {}",
                    self.marker_path.display(),
                    e
                );
                None
            }
        }
    }

    fn write_marker(&self, written: DateTime<Utc>) -> Result<(), RtcError> {
        if let Some(dir) = self.marker_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| RtcError::Marker(e.to_string()))?;
        }
        std::fs::write(
            &self.marker_path,
            format!("{}\n", written.format(MARKER_FORMAT)),
        )
        .map_err(|e| RtcError::Marker(e.to_string()))
    }

    fn account_drift(&self, now: DateTime<Utc>, current: &RtcTime, marker: DateTime<Utc>) {
        let drift = now
            .signed_duration_since(current.time)
            .num_milliseconds() as f64
            / 1000.0;
        let window = now.signed_duration_since(marker).num_seconds() as f64;
        if window <= 0.0 {
            log::debug!("rtc write marker is not in the past; skipping drift check");
            return;
        }

        let per_month = project_drift(drift, window);
        log::debug!(
            "rtc drift {:.3}s over {:.0}s, projected {:.1}s/month",
            drift,
            window,
            per_month
        );

        let details = serde_json::json!({
            "driftSeconds": drift,
            "driftPerMonthSeconds": per_month,
            "windowSeconds": window,
            "integrity": current.integrity,
        });
        if per_month > DRIFT_ERROR {
            self.events.publish(Event::new(
                EventKind::RtcNtpDriftHigh,
                Severity::Error,
                details,
            ));
        } else if per_month > DRIFT_WARN {
            self.events.publish(Event::new(
                EventKind::RtcNtpDrift,
                Severity::Warn,
                details,
            ));
        }
    }
}
