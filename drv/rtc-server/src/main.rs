// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RTC service: keeps the PCF8563 and the system clock telling the
//! same story.
//!
//! At startup the RTC's time is pushed into the kernel (boards spend
//! most of their life without network). From then on an NTP-sync task
//! writes the daemon-disciplined system time back into the chip, a
//! liveness task confirms the chip actually ticks, and the D-Bus facade
//! serves time and alarm requests. All chip access goes through the I²C
//! arbiter service.

mod clock;
mod liveness;
mod pcf8563;
mod rpc;
mod sync;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use drv_event_api::{DbusReporter, EventSink, NullSink};
use drv_i2c_api::I2cProxy;

#[derive(Parser)]
#[clap(about = "PCF8563 real-time clock service for the tc2 HAT")]
struct Args {
    /// Last-RTC-write marker file.
    #[clap(long, default_value = "/etc/cacophony/last-rtc-write-time")]
    marker: PathBuf,

    /// Skip pushing RTC time into the system clock at startup.
    #[clap(long)]
    no_set_system_time: bool,

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
    let clock = Arc::new(Mutex::new(clock::RtcClock::new(
        bus,
        args.marker,
        Arc::clone(&events),
    )));

    if !args.no_set_system_time {
        let result = clock
            .lock()
            .map_err(|_| anyhow::anyhow!("clock mutex poisoned"))?
            .set_system_time();
        // Not fatal: the NTP sync loop will true up the chip once the
        // network shows up.
        if let Err(e) = result {
            log::warn!("could not set system clock from rtc: {}", e);
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    let sync_handle = {
        let clock = Arc::clone(&clock);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("ntp-sync".to_string())
            .spawn(move || sync::run(&clock, &shutdown))
            .context("spawning ntp-sync task")?
    };
    let liveness_handle = {
        let clock = Arc::clone(&clock);
        let events = Arc::clone(&events);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("rtc-liveness".to_string())
            .spawn(move || {
                liveness::run(&clock, &events, &shutdown, liveness::Config::default())
            })
            .context("spawning liveness task")?
    };

    let served = rpc::serve(clock);

    // The dispatch loop only returns on failure; wind the tasks down so
    // the supervisor sees a clean non-zero exit.
    shutdown.store(true, Ordering::Relaxed);
    let _ = sync_handle.join();
    let _ = liveness_handle.join();
    served
}
