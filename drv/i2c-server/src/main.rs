// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The I²C service: owns the kernel adapter and the bus-arbitration GPIO,
//! serializes every transaction on the HAT bus through one worker, and
//! reconciles the EEPROM identity block with its on-disk mirror at
//! startup.
//!
//! Long-running and supervised; exits non-zero on anything fatal so the
//! init system restarts it.

mod arbiter;
mod bus;
mod busy;
mod eeprom;
mod identity;
mod rpc;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use drv_event_api::{DbusReporter, EventSink, NullSink};
use std::sync::Arc;

#[derive(Parser)]
#[clap(about = "Shared I2C transaction arbiter for the tc2 HAT")]
struct Args {
    /// Kernel I2C adapter number (/dev/i2c-N).
    #[clap(long, default_value_t = 1)]
    i2c_bus: u8,

    /// BCM number of the bus-arbitration GPIO shared with the RP2040.
    #[clap(long, default_value_t = drv_i2c_api::wire::BUSY_PIN)]
    busy_pin: u8,

    /// Identity mirror file.
    #[clap(long, default_value = "/etc/cacophony/eeprom-data.json")]
    eeprom_mirror: PathBuf,

    /// Log instead of publishing events (bench setups without a reporter).
    #[clap(long)]
    no_events: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let kernel_bus = bus::KernelBus::open(args.i2c_bus)
        .with_context(|| format!("opening /dev/i2c-{}", args.i2c_bus))?;
    let busy_line = busy::BusyLine::acquire(args.busy_pin)
        .with_context(|| format!("acquiring busy line GPIO {}", args.busy_pin))?;
    let events: Arc<dyn EventSink> = if args.no_events {
        Arc::new(NullSink)
    } else {
        DbusReporter::new()
    };

    let handle = arbiter::spawn(kernel_bus, busy_line, events);

    let mut store = eeprom::IdentityStore::new(handle.clone(), args.eeprom_mirror);
    let board = store.init().context("reconciling EEPROM identity")?;
    log::info!(
        "board identity v{}: id {:#018x}",
        board.version(),
        board.id()
    );

    rpc::serve(handle)
}
