// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sampling control loop: read the sensor on a fixed cadence, append
//! to the rolling CSV log, and publish events.
//!
//! `tempHumidity` is rate-limited to one per report interval; the
//! threshold events fire on every sample that crosses them; a freezer
//! that stays too cold keeps saying so.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use drv_event_api::{Event, EventKind, EventSink, Severity};
use drv_i2c_api::Bus;

use crate::aht20::{Aht20, Measurement};

const CSV_HEADER: &str = "timestamp,temp,humidity";
const CSV_KEEP_LINES: usize = 2000;
const TRIM_PERIOD: Duration = Duration::from_secs(24 * 3600);

#[derive(Copy, Clone, Debug)]
pub struct Thresholds {
    pub temp_high: f32,
    pub temp_low: f32,
    pub humidity_high: f32,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub sample_rate: Duration,
    pub report_interval: Duration,
    /// Write an info log line every N samples; 0 silences them.
    pub log_every: u64,
    pub csv_path: PathBuf,
    pub thresholds: Thresholds,
}

/// Which events a single measurement should raise.
pub fn threshold_events(m: &Measurement, th: &Thresholds) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    if m.temperature > th.temp_high {
        kinds.push(EventKind::TempTooHigh);
    }
    if m.temperature < th.temp_low {
        kinds.push(EventKind::TempTooLow);
    }
    if m.humidity > th.humidity_high {
        kinds.push(EventKind::HumidityTooHigh);
    }
    kinds
}

pub fn append_csv(path: &Path, when: DateTime<Utc>, m: &Measurement) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let fresh = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if fresh {
        writeln!(file, "{}", CSV_HEADER)?;
    }
    writeln!(
        file,
        "{},{:.2},{:.2}",
        when.to_rfc3339_opts(SecondsFormat::Secs, true),
        m.temperature,
        m.humidity
    )
}

/// Drop all but the last `keep` samples, hanging on to the header line.
pub fn trim_csv(path: &Path, keep: usize) -> std::io::Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let lines: Vec<&str> = content.lines().collect();
    let (header, samples) = match lines.split_first() {
        Some((&header, samples)) if header == CSV_HEADER => (Some(header), samples),
        _ => (None, &lines[..]),
    };
    if samples.len() <= keep {
        return Ok(());
    }
    let mut trimmed = String::new();
    if let Some(header) = header {
        trimmed.push_str(header);
        trimmed.push('\n');
    }
    for line in &samples[samples.len() - keep..] {
        trimmed.push_str(line);
        trimmed.push('\n');
    }
    std::fs::write(path, trimmed)
}

pub struct Sampler<B> {
    sensor: Aht20<B>,
    cfg: Config,
    events: Arc<dyn EventSink>,
    last_report: Option<Instant>,
    last_trim: Instant,
    samples: u64,
}

impl<B: Bus> Sampler<B> {
    pub fn new(sensor: Aht20<B>, cfg: Config, events: Arc<dyn EventSink>) -> Self {
        Self {
            sensor,
            cfg,
            events,
            last_report: None,
            last_trim: Instant::now(),
            samples: 0,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick();
            sleep_interruptibly(self.cfg.sample_rate, shutdown);
        }
    }

    fn tick(&mut self) {
        let m = match self.sensor.make_reading() {
            Ok(m) => m,
            Err(e) => {
                log::warn!("measurement failed: {}", e);
                return;
            }
        };
        let now = Utc::now();
        self.samples += 1;

        if let Err(e) = append_csv(&self.cfg.csv_path, now, &m) {
            log::warn!("could not append {}: {}", self.cfg.csv_path.display(), e);
        }
        if self.cfg.log_every != 0 && self.samples % self.cfg.log_every == 1 {
            log::info!(
                "{:.2} degC, {:.2} %RH{}",
                m.temperature,
                m.humidity,
                if m.crc_invalid { " (no-crc sensor)" } else { "" }
            );
        }

        let details = serde_json::json!({
            "temp": m.temperature,
            "humidity": m.humidity,
        });
        for kind in threshold_events(&m, &self.cfg.thresholds) {
            self.events
                .publish(Event::new(kind, Severity::Warn, details.clone()));
        }
        let report_due = self
            .last_report
            .map_or(true, |at| at.elapsed() >= self.cfg.report_interval);
        if report_due {
            self.events
                .publish(Event::new(EventKind::TempHumidity, Severity::Info, details));
            self.last_report = Some(Instant::now());
        }

        if self.last_trim.elapsed() >= TRIM_PERIOD {
            if let Err(e) = trim_csv(&self.cfg.csv_path, CSV_KEEP_LINES) {
                log::warn!("could not trim {}: {}", self.cfg.csv_path.display(), e);
            }
            self.last_trim = Instant::now();
        }
    }
}

fn sleep_interruptibly(total: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let nap = remaining.min(SLICE);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}
