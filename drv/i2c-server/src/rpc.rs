// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! D-Bus facade for the arbiter: `org.cacophony.i2c`, method `Tx`.
//!
//! The handler validates arguments, stamps the request into the worker
//! queue, and blocks the dispatch of *this method call* on the reply slot.
//! Serialization is the worker's job, not the bus daemon's.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use dbus::blocking::Connection;
use dbus::MethodErr;
use dbus_crossroads::Crossroads;
use drv_i2c_api::{err_name, validate, I2cError, I2C_BUS_NAME, I2C_INTERFACE, I2C_OBJECT_PATH};

use crate::arbiter::ArbiterHandle;

fn to_method_err(e: I2cError) -> MethodErr {
    let name = match e {
        I2cError::BusyTimeout => err_name::BUSY_TIMEOUT,
        I2cError::Lock => err_name::LOCK,
        I2cError::Io => err_name::IO,
        I2cError::BadArg(_) => err_name::BAD_ARG,
        // Everything else is an internal fault of the service itself.
        _ => "org.cacophony.i2c.Error.Internal",
    };
    (name, e.to_string()).into()
}

/// Acquire the well-known name (do-not-queue: a second instance must die,
/// not lurk) and serve `Tx` forever.
pub fn serve(handle: ArbiterHandle) -> Result<()> {
    let conn = Connection::new_system().context("connecting to the system bus")?;
    let acquired = conn
        .request_name(I2C_BUS_NAME, false, false, true)
        .context("requesting bus name")?;
    use dbus::blocking::stdintf::org_freedesktop_dbus::RequestNameReply;
    if acquired != RequestNameReply::PrimaryOwner {
        bail!("bus name {} already taken", I2C_BUS_NAME);
    }

    let mut cr = Crossroads::new();
    let iface = cr.register(I2C_INTERFACE, |b: &mut dbus_crossroads::IfaceBuilder<ArbiterHandle>| {
        b.method(
            "Tx",
            ("address", "write", "readLen", "timeoutMs"),
            ("response",),
            |_, handle, (address, write, read_len, timeout_ms): (u8, Vec<u8>, i32, i32)| {
                let read_len = usize::try_from(read_len)
                    .map_err(|_| to_method_err(I2cError::BadArg("negative read length")))?;
                let timeout_ms = u64::try_from(timeout_ms)
                    .map_err(|_| to_method_err(I2cError::BadArg("negative timeout")))?;
                validate(&write, read_len).map_err(to_method_err)?;

                handle
                    .submit(address, write, read_len, Duration::from_millis(timeout_ms))
                    .map(|bytes| (bytes,))
                    .map_err(to_method_err)
            },
        );
    });
    cr.insert(I2C_OBJECT_PATH, &[iface], handle);

    log::info!("serving Tx on {}", I2C_BUS_NAME);
    cr.serve(&conn).context("dbus dispatch loop failed")?;
    Ok(())
}
