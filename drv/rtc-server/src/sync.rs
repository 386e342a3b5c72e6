// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NTP-to-RTC synchronization loop.
//!
//! Polls the time daemon once a second until the system clock is NTP
//! synchronized, then writes it into the RTC and backs off to hourly
//! re-trues. The RTC write goes through [`RtcClock::write_time`], so every
//! sync also produces a drift datum.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use drv_i2c_api::Bus;

use crate::clock::RtcClock;

const POLL_UNSYNCED: Duration = Duration::from_secs(1);
const POLL_SYNCED: Duration = Duration::from_secs(3600);

/// `timedatectl` reports `System clock synchronized: yes` once the time
/// daemon has a trusted source.
pub fn is_synchronized(timedatectl_output: &str) -> bool {
    timedatectl_output
        .lines()
        .any(|line| line.trim_start().ends_with("synchronized: yes"))
}

fn ntp_synchronized() -> bool {
    match Command::new("timedatectl").output() {
        Ok(out) if out.status.success() => {
            is_synchronized(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            log::debug!("timedatectl exited with {}", out.status);
            false
        }
        Err(e) => {
            log::debug!("timedatectl not runnable: {}", e);
            false
        }
    }
}

pub fn run<B: Bus>(clock: &Mutex<RtcClock<B>>, shutdown: &AtomicBool) {
    let mut synced_once = false;
    while !shutdown.load(Ordering::Relaxed) {
        if ntp_synchronized() {
            let now = Utc::now();
            let result = match clock.lock() {
                Ok(mut clock) => clock.write_time(now),
                Err(_) => {
                    log::error!("rtc clock mutex poisoned; sync loop exiting");
                    return;
                }
            };
            match result {
                Ok(()) => {
                    if !synced_once {
                        log::info!("first NTP sync written to rtc: {}", now);
                    }
                    synced_once = true;
                }
                Err(e) => log::warn!("could not write NTP time to rtc: {}", e),
            }
        }
        let pause = if synced_once { POLL_SYNCED } else { POLL_UNSYNCED };
        sleep_interruptibly(pause, shutdown);
    }
}

/// Sleep in short slices so shutdown is honored promptly even inside the
/// hourly back-off.
pub(crate) fn sleep_interruptibly(total: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let nap = remaining.min(SLICE);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}
