// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw access to the kernel I²C adapter.
//!
//! One combined write/read per call, blocking until the kernel syscall
//! returns. No retries and no ordering obligations here; that is all the
//! arbiter's job. The worker is generic over [`BusHardware`] so tests run
//! it against a scripted adapter.

use std::io;

use rppal::i2c::I2c;

pub trait BusHardware: Send {
    fn transact(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
    ) -> io::Result<Vec<u8>>;
}

/// The real adapter, `/dev/i2c-<bus>`.
pub struct KernelBus {
    i2c: I2c,
}

impl KernelBus {
    pub fn open(bus: u8) -> Result<Self, rppal::i2c::Error> {
        Ok(Self { i2c: I2c::with_bus(bus)? })
    }
}

fn to_io(e: rppal::i2c::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl BusHardware for KernelBus {
    fn transact(
        &mut self,
        addr: u8,
        write: &[u8],
        read_len: usize,
    ) -> io::Result<Vec<u8>> {
        self.i2c.set_slave_address(addr as u16).map_err(to_io)?;
        let mut read = vec![0u8; read_len];
        match (write.is_empty(), read_len) {
            (true, 0) => {
                // Zero-length probe: a bare write of no bytes still
                // addresses the peripheral and reports its ACK.
                self.i2c.write(&[]).map_err(to_io)?;
            }
            (false, 0) => {
                self.i2c.write(write).map_err(to_io)?;
            }
            (true, _) => {
                self.i2c.read(&mut read).map_err(to_io)?;
            }
            (false, _) => {
                self.i2c.write_read(write, &mut read).map_err(to_io)?;
            }
        }
        Ok(read)
    }
}
