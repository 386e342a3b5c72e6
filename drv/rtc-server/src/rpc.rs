// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! D-Bus facade for the RTC service: `org.cacophony.RTC`.
//!
//! # RPC protocol
//!
//! Object path `/org/cacophony/RTC`:
//!
//! ## `GetTime() -> (s time, b integrity)`
//!
//! The RTC's current UTC time as RFC 3339 and whether the chip vouches
//! for it (VL flag clear).
//!
//! ## `SetTime(s time)`
//!
//! Write an RFC 3339 instant to the chip, with drift accounting against
//! the last-write marker.
//!
//! ## Alarm methods
//!
//! `SetAlarm(y minute, y hour, y day)`, `GetAlarm() -> (y, y, y, b
//! armed)`, `GetAlarmEnabled() -> b` / `SetAlarmEnabled(b)` for the AIE
//! interrupt gate, and `GetAlarmFlag() -> b` / `ClearAlarmFlag()` for the
//! fired-alarm latch.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dbus::blocking::Connection;
use dbus::MethodErr;
use dbus_crossroads::Crossroads;
use drv_i2c_api::{Bus, I2cError};

use crate::clock::RtcClock;
use crate::pcf8563::{Alarm, RtcError};

pub const RTC_BUS_NAME: &str = "org.cacophony.RTC";
pub const RTC_OBJECT_PATH: &str = "/org/cacophony/RTC";
pub const RTC_INTERFACE: &str = "org.cacophony.RTC";

pub mod err_name {
    pub const INTEGRITY_LOST: &str = "org.cacophony.RTC.Error.IntegrityLost";
    pub const INCONSISTENT_READ: &str = "org.cacophony.RTC.Error.InconsistentRead";
    pub const IO: &str = "org.cacophony.RTC.Error.Io";
    pub const BAD_TIME: &str = "org.cacophony.RTC.Error.BadTime";
    pub const INTERNAL: &str = "org.cacophony.RTC.Error.Internal";
}

fn to_method_err(e: RtcError) -> MethodErr {
    let name = match &e {
        RtcError::IntegrityLost => err_name::INTEGRITY_LOST,
        RtcError::InconsistentRead => err_name::INCONSISTENT_READ,
        RtcError::Bus(I2cError::ServiceUnavailable) => err_name::IO,
        RtcError::Bus(_) | RtcError::GarbledTime => err_name::IO,
        _ => err_name::INTERNAL,
    };
    (name, e.to_string()).into()
}

type SharedClock<B> = Arc<Mutex<RtcClock<B>>>;

fn locked<B: Bus, T>(
    clock: &SharedClock<B>,
    f: impl FnOnce(&mut RtcClock<B>) -> Result<T, RtcError>,
) -> Result<T, MethodErr> {
    let mut clock = clock
        .lock()
        .map_err(|_| MethodErr::from((err_name::INTERNAL, "clock mutex poisoned")))?;
    f(&mut clock).map_err(to_method_err)
}

pub fn serve<B: Bus + 'static>(clock: SharedClock<B>) -> Result<()> {
    let conn = Connection::new_system().context("connecting to the system bus")?;
    let acquired = conn
        .request_name(RTC_BUS_NAME, false, false, true)
        .context("requesting bus name")?;
    use dbus::blocking::stdintf::org_freedesktop_dbus::RequestNameReply;
    if acquired != RequestNameReply::PrimaryOwner {
        bail!("bus name {} already taken", RTC_BUS_NAME);
    }

    let mut cr = Crossroads::new();
    let iface = cr.register(RTC_INTERFACE, |b: &mut dbus_crossroads::IfaceBuilder<SharedClock<B>>| {
        b.method(
            "GetTime",
            (),
            ("time", "integrity"),
            |_, clock, (): ()| {
                let t = locked(clock, |c| c.get_time())?;
                Ok((
                    t.time.to_rfc3339_opts(SecondsFormat::Secs, true),
                    t.integrity,
                ))
            },
        );
        b.method("SetTime", ("time",), (), |_, clock, (time,): (String,)| {
            let parsed = DateTime::parse_from_rfc3339(&time)
                .map_err(|e| MethodErr::from((err_name::BAD_TIME, e.to_string().as_str())))?
                .with_timezone(&Utc);
            locked(clock, |c| c.write_time(parsed))?;
            Ok(())
        });
        b.method(
            "SetAlarm",
            ("minute", "hour", "day"),
            (),
            |_, clock, (minute, hour, day): (u8, u8, u8)| {
                if minute > 59 || hour > 23 || !(1..=31).contains(&day) {
                    return Err(MethodErr::invalid_arg("alarm field out of range"));
                }
                locked(clock, |c| c.chip().set_alarm(&Alarm { minute, hour, day }))?;
                Ok(())
            },
        );
        b.method(
            "GetAlarm",
            (),
            ("minute", "hour", "day", "armed"),
            |_, clock, (): ()| {
                let (alarm, armed) = locked(clock, |c| c.chip().read_alarm())?;
                Ok((alarm.minute, alarm.hour, alarm.day, armed))
            },
        );
        b.method("GetAlarmEnabled", (), ("enabled",), |_, clock, (): ()| {
            Ok((locked(clock, |c| c.chip().alarm_interrupt_enabled())?,))
        });
        b.method(
            "SetAlarmEnabled",
            ("enabled",),
            (),
            |_, clock, (enabled,): (bool,)| {
                locked(clock, |c| c.chip().set_alarm_interrupt(enabled))?;
                Ok(())
            },
        );
        b.method("GetAlarmFlag", (), ("flag",), |_, clock, (): ()| {
            Ok((locked(clock, |c| c.chip().alarm_flag())?,))
        });
        b.method("ClearAlarmFlag", (), (), |_, clock, (): ()| {
            locked(clock, |c| c.chip().clear_alarm_flag())?;
            Ok(())
        });
    });
    cr.insert(RTC_OBJECT_PATH, &[iface], clock);

    log::info!("serving on {}", RTC_BUS_NAME);
    cr.serve(&conn).context("dbus dispatch loop failed")?;
    Ok(())
}
