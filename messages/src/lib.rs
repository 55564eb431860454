// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Data types shared between the optical-module transfer engine and the
//! services that drive it.
//!
//! Nothing in this crate performs I/O. It describes how a module's memory map
//! is addressed, the outcome vocabulary reported by USB bridge adapters, and
//! the JSON shapes exchanged with HTTP clients.

pub mod api;
pub mod gpio;
pub mod ident;
pub mod page;
pub mod status;

pub use gpio::GpioStatus;
pub use ident::Identifier;
pub use ident::PartType;
pub use page::PageId;
pub use status::DeviceStatus;

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The size of a single table or page of a module's memory map.
pub const PAGE_SIZE: usize = 256;

/// The largest transaction any bridge may be asked to perform, regardless of
/// what the bridge itself advertises.
pub const TRANSFER_CEILING: u16 = 256;

/// The byte which selects the upper page on paged modules.
pub const PAGE_SELECT_OFFSET: u8 = 0x7F;

/// Errors validating addresses, identifiers, and request fields.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// An access to memory outside of the 256-byte memory map.
    #[error("access of {len} bytes at offset {offset:#04x} exceeds the 256-byte page")]
    InvalidMemoryAccess { offset: u8, len: u16 },

    #[error("invalid page identifier: {0:?}")]
    InvalidPageId(String),

    #[error("invalid device identifier: {0:?}")]
    InvalidDeviceId(String),

    #[error("invalid hex in field '{field}': {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// A start/end pair does not describe a range within the supplied data.
    #[error("byte range {start:#04x}..={end:#04x} does not fit a {len}-byte page")]
    InvalidByteRange { start: u8, end: u8, len: usize },

    #[error("unknown part type: {0:?}")]
    InvalidPartType(String),
}

/// The addressing convention a bridge uses on the module bus.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// I2C-style: a slave address and a one-byte offset, moved in bytes.
    #[default]
    DirectAddress,
    /// MDIO-style: the table is folded into the high byte of a 16-bit
    /// register address, moved in 16-bit words.
    RegisterEmbedded,
}

impl Family {
    /// The number of bytes carried by one addressable unit.
    pub const fn unit_bytes(&self) -> usize {
        match self {
            Family::DirectAddress => 1,
            Family::RegisterEmbedded => 2,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::DirectAddress => write!(f, "direct-address"),
            Family::RegisterEmbedded => write!(f, "register-embedded"),
        }
    }
}

/// A validated span of a single 256-byte table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    table: u8,
    offset: u8,
    len: u16,
}

impl MemoryRegion {
    /// Construct a new memory region.
    ///
    /// The last accessed byte must be within the 256-byte memory map.
    pub fn new(table: u8, offset: u8, len: u16) -> Result<Self, Error> {
        if u32::from(offset) + u32::from(len) > u32::from(TRANSFER_CEILING) {
            return Err(Error::InvalidMemoryAccess { offset, len });
        }
        Ok(Self { table, offset, len })
    }

    pub fn table(&self) -> u8 {
        self.table
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Names one enumerated device: the adapter that found it and its ordinal
/// among that adapter's devices.
///
/// The textual form is `"<adapter-name> <index>"`, e.g. `"CP2112 0"`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DeviceId {
    pub adapter: String,
    pub index: u32,
}

impl DeviceId {
    pub fn new(adapter: impl Into<String>, index: u32) -> Self {
        Self {
            adapter: adapter.into(),
            index,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.adapter, self.index)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidDeviceId(s.to_string());
        let (adapter, index) = s.trim().rsplit_once(' ').ok_or_else(invalid)?;
        let adapter = adapter.trim();
        if adapter.is_empty() {
            return Err(invalid());
        }
        let index = index.parse().map_err(|_| invalid())?;
        Ok(Self::new(adapter, index))
    }
}

/// Parse a hex-encoded byte string, tolerating surrounding whitespace and an
/// optional `0x` prefix.
pub fn parse_hex_bytes(field: &'static str, s: &str) -> Result<Vec<u8>, Error> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    hex::decode(s).map_err(|e| Error::InvalidHex {
        field,
        reason: e.to_string(),
    })
}

/// Parse a single hex byte such as `"A0"` or `"0x7f"`.
pub fn parse_hex_u8(field: &'static str, s: &str) -> Result<u8, Error> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(s, 16).map_err(|e| Error::InvalidHex {
        field,
        reason: e.to_string(),
    })
}
