// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The capability every USB bridge driver provides.
//!
//! A bridge driver only knows how to move one bounded transaction at a time.
//! Splitting requests, settling between transactions, retrying, and decoding
//! status all happen above this trait, in [`crate::large_access`] and
//! [`crate::ProtocolRouter`].

use crate::status::StatusTable;
use crate::Error;
use optic_messages::DeviceId;
use optic_messages::Family;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::time::Duration;

/// A failure reported by a bridge driver.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The bridge returned a vendor status code.
    ///
    /// Decode it with the adapter's [`StatusTable`].
    #[error("bridge returned status {0:#04x}")]
    Status(u32),

    #[error("host I/O error")]
    Io(#[from] std::io::Error),

    #[error("operation not supported by this bridge")]
    Unsupported,

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
}

/// Where a single transaction lands on the module bus.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BusAddress {
    /// A slave address and a one-byte offset register.
    Direct { table: u8, offset: u8 },
    /// A 16-bit register address with the table in the high byte.
    Register(u16),
}

impl BusAddress {
    /// Return the address `units` further along.
    ///
    /// The offset register of a direct-address bridge is a single byte, so
    /// the offset wraps at 256 without carrying into the table.
    pub fn advance(self, units: u16) -> Self {
        match self {
            BusAddress::Direct { table, offset } => BusAddress::Direct {
                table,
                offset: offset.wrapping_add(units as u8),
            },
            BusAddress::Register(register) => BusAddress::Register(register.wrapping_add(units)),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Direct { table, offset } => write!(f, "0x{table:02X}:0x{offset:02X}"),
            BusAddress::Register(register) => write!(f, "reg 0x{register:04X}"),
        }
    }
}

/// The per-transaction limits a bridge declares.
///
/// Chunk sizes are in transfer units: bytes for direct-address bridges, words
/// for register-embedded bridges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferLimits {
    pub max_read_chunk: u16,
    pub max_write_chunk: u16,
    /// Time the bus needs between transactions.
    pub settle_delay: Duration,
    /// The bus must be polled idle around write sequences.
    pub wait_for_idle: bool,
}

impl TransferLimits {
    pub const fn new(max_read_chunk: u16, max_write_chunk: u16) -> Self {
        Self {
            max_read_chunk,
            max_write_chunk,
            settle_delay: Duration::ZERO,
            wait_for_idle: false,
        }
    }

    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub const fn wait_for_idle(mut self, wait: bool) -> Self {
        self.wait_for_idle = wait;
        self
    }
}

/// A bridge driver.
///
/// At most one device is open at a time. Between `open` and `close` the
/// transaction methods address that device.
pub trait TransportAdapter: Send {
    /// The name devices of this adapter are listed under, e.g. `"CP2112"`.
    fn name(&self) -> &str;

    fn family(&self) -> Family;

    fn limits(&self) -> TransferLimits;

    /// The table decoding this bridge's vendor status codes.
    fn status_table(&self) -> &'static StatusTable;

    /// List the indices of attached devices matching this bridge's
    /// vendor and product identity.
    fn enumerate(&mut self) -> Result<Vec<u32>, TransportError>;

    /// Open and configure the device at `index`.
    fn open(&mut self, index: u32, bit_rate: u32) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Read `len` units starting at `address`.
    fn raw_read(&mut self, address: BusAddress, len: u16) -> Result<Vec<u8>, TransportError>;

    /// Write `data`, which is a whole number of units, starting at `address`.
    fn raw_write(&mut self, address: BusAddress, data: &[u8]) -> Result<(), TransportError>;

    /// Block until the bus reports idle.
    fn wait_idle(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Sample one GPIO line.
    fn gpio_sample(&mut self, _line: u8) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Read the raw module status field, least-significant byte first.
    fn gpio_status(&mut self) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// An open device, closed again when dropped.
pub struct Session<'a> {
    adapter: &'a mut dyn TransportAdapter,
    device: &'a DeviceId,
    log: &'a Logger,
}

impl<'a> Session<'a> {
    pub fn open(
        adapter: &'a mut dyn TransportAdapter,
        device: &'a DeviceId,
        bit_rate: u32,
        log: &'a Logger,
    ) -> Result<Self, Error> {
        adapter
            .open(device.index, bit_rate)
            .map_err(|source| Error::DeviceUnavailable {
                device: device.clone(),
                source,
            })?;
        debug!(log, "opened device"; "device" => %device, "bit_rate" => bit_rate);
        Ok(Self {
            adapter,
            device,
            log,
        })
    }

    pub fn device(&self) -> &DeviceId {
        self.device
    }
}

impl<'a> Deref for Session<'a> {
    type Target = dyn TransportAdapter + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.adapter
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.adapter
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        match self.adapter.close() {
            Ok(()) => debug!(self.log, "closed device"; "device" => %self.device),
            Err(e) => warn!(
                self.log,
                "failed to close device";
                "device" => %self.device,
                "reason" => %e
            ),
        }
    }
}
