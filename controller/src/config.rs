// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Configuration of the protocol router and its transfers.

use crate::adapter::TransferLimits;
use crate::Error;
use optic_messages::Family;
use optic_messages::TRANSFER_CEILING;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

/// Return the default bus clock handed to bridges when a device is opened.
pub const fn default_bit_rate() -> u32 {
    100_000
}

/// Return the default number of times a write chunk is re-sent after a
/// transient failure.
pub const fn default_write_retries() -> usize {
    3
}

/// Return the default address on which the HTTP interface listens.
pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 42069))
}

/// Settings applied to every transfer.
///
/// Chunk caps and the settling delay override what an adapter declares. A cap
/// can only lower an adapter's maximum, never raise it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferConfig {
    /// Largest read transaction, in transfer units.
    pub read_chunk: Option<u16>,

    /// Largest write transaction, in transfer units.
    pub write_chunk: Option<u16>,

    /// Delay after each transaction. When unset, the adapter's own settling
    /// delay is used.
    pub settle_delay: Option<Duration>,

    /// Bus clock in Hz.
    pub bit_rate: u32,

    pub write_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_chunk: None,
            write_chunk: None,
            settle_delay: None,
            bit_rate: default_bit_rate(),
            write_retries: default_write_retries(),
        }
    }
}

impl TransferConfig {
    /// Combine these settings with an adapter's limits.
    pub fn resolve(&self, limits: &TransferLimits) -> TransferParams {
        let cap = |cap: Option<u16>, max: u16| cap.map_or(max, |c| c.min(max));
        TransferParams {
            read_chunk: cap(self.read_chunk, limits.max_read_chunk),
            write_chunk: cap(self.write_chunk, limits.max_write_chunk),
            settle_delay: self.settle_delay.unwrap_or(limits.settle_delay),
            bit_rate: self.bit_rate,
            write_retries: self.write_retries,
            wait_for_idle: limits.wait_for_idle,
        }
    }
}

/// The parameters of one transfer against one adapter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferParams {
    pub read_chunk: u16,
    pub write_chunk: u16,
    pub settle_delay: Duration,
    pub bit_rate: u32,
    pub write_retries: usize,
    pub wait_for_idle: bool,
}

/// Configuration for a [`crate::ProtocolRouter`].
#[derive(Clone, Debug)]
pub struct Config {
    /// The addressing family of every device the router drives.
    pub family: Family,

    pub transfer: TransferConfig,

    /// The address of the HTTP interface.
    pub listen: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            family: Family::default(),
            transfer: TransferConfig::default(),
            listen: default_listen_addr(),
        }
    }
}

/// A builder interface for generating router configuration.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    family: Option<Family>,
    read_chunk: Option<u16>,
    write_chunk: Option<u16>,
    settle_delay: Option<Duration>,
    bit_rate: Option<u32>,
    write_retries: Option<usize>,
    listen: Option<SocketAddr>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the addressing family.
    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    /// Cap the size of each read transaction.
    pub fn read_chunk(mut self, units: u16) -> Self {
        self.read_chunk = Some(units);
        self
    }

    /// Cap the size of each write transaction.
    pub fn write_chunk(mut self, units: u16) -> Self {
        self.write_chunk = Some(units);
        self
    }

    /// Override the delay observed after each transaction.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = Some(delay);
        self
    }

    /// Set the bus clock, in Hz.
    pub fn bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    /// Set how many times a write chunk is re-sent after a transient failure.
    pub fn write_retries(mut self, retries: usize) -> Self {
        self.write_retries = Some(retries);
        self
    }

    /// Set the address of the HTTP interface.
    pub fn listen(mut self, listen: impl Into<SocketAddr>) -> Self {
        self.listen = Some(listen.into());
        self
    }

    /// Build a `Config` from `self`.
    pub fn build(self) -> Result<Config, Error> {
        for (name, cap) in [("read", self.read_chunk), ("write", self.write_chunk)] {
            if let Some(cap) = cap {
                if cap == 0 || cap > TRANSFER_CEILING {
                    return Err(Error::Config(format!(
                        "{name} chunk must be between 1 and {TRANSFER_CEILING}, found {cap}"
                    )));
                }
            }
        }
        if self.bit_rate == Some(0) {
            return Err(Error::Config(String::from("bit rate must be non-zero")));
        }
        Ok(Config {
            family: self.family.unwrap_or_default(),
            transfer: TransferConfig {
                read_chunk: self.read_chunk,
                write_chunk: self.write_chunk,
                settle_delay: self.settle_delay,
                bit_rate: self.bit_rate.unwrap_or_else(default_bit_rate),
                write_retries: self.write_retries.unwrap_or_else(default_write_retries),
            },
            listen: self.listen.unwrap_or_else(default_listen_addr),
        })
    }
}
