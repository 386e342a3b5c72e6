// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The temperature service: samples the AHT20 on a fixed cadence, keeps
//! the rolling CSV log, and reports readings and threshold breaches as
//! events. All sensor traffic goes through the I²C arbiter service.

mod aht20;
mod sampler;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use drv_event_api::{DbusReporter, EventSink, NullSink};
use drv_i2c_api::I2cProxy;

#[derive(Parser)]
#[clap(about = "AHT20 temperature/humidity service for the tc2 HAT")]
struct Args {
    /// Seconds between samples.
    #[clap(long, default_value_t = 60)]
    sample_rate: u64,

    /// Minimum seconds between tempHumidity report events.
    #[clap(long, default_value_t = 1800)]
    report_interval: u64,

    /// Log a reading every N samples (0 to silence).
    #[clap(long, default_value_t = 10)]
    log_every: u64,

    /// Rolling sample log.
    #[clap(long, default_value = "/var/log/temperature.csv")]
    csv: PathBuf,

    #[clap(long, default_value_t = 50.0)]
    temp_high: f32,

    #[clap(long, default_value_t = -10.0)]
    temp_low: f32,

    #[clap(long, default_value_t = 90.0)]
    humidity_high: f32,

    /// Log instead of publishing events (bench setups without a reporter).
    #[clap(long)]
    no_events: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let events: Arc<dyn EventSink> = if args.no_events {
        Arc::new(NullSink)
    } else {
        DbusReporter::new()
    };

    let bus = I2cProxy::new_system().context("connecting to the i2c arbiter")?;
    let mut sensor = aht20::Aht20::new(bus);
    sensor
        .ensure_calibrated()
        .context("calibrating the AHT20")?;

    let cfg = sampler::Config {
        sample_rate: Duration::from_secs(args.sample_rate),
        report_interval: Duration::from_secs(args.report_interval),
        log_every: args.log_every,
        csv_path: args.csv,
        thresholds: sampler::Thresholds {
            temp_high: args.temp_high,
            temp_low: args.temp_low,
            humidity_high: args.humidity_high,
        },
    };
    log::info!(
        "sampling every {}s, logging to {}",
        args.sample_rate,
        cfg.csv_path.display()
    );

    // Runs until the supervisor stops the process.
    let shutdown = AtomicBool::new(false);
    sampler::Sampler::new(sensor, cfg, events).run(&shutdown);
    Ok(())
}
