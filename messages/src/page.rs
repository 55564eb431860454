// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Identifiers for a single page of module memory.

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// A page of module memory, written `"<addr-hex>[_<table>T]"`. The `T` may be
/// left off when parsing.
///
/// The address is the bus address of the table (e.g. `A0`). The optional table
/// number is only meaningful for paged parts, where it is written to the page
/// select byte before the page is read. For example, `"A0_3T"` is upper page 3
/// behind address `0xA0`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PageId {
    pub address: u8,
    pub table: Option<u8>,
}

impl PageId {
    pub const fn new(address: u8) -> Self {
        Self {
            address,
            table: None,
        }
    }

    pub const fn with_table(address: u8, table: u8) -> Self {
        Self {
            address,
            table: Some(table),
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table {
            Some(table) => write!(f, "{:02X}_{}T", self.address, table),
            None => write!(f, "{:02X}", self.address),
        }
    }
}

impl FromStr for PageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPageId(s.to_string());
        let s = s.trim();
        let (address, table) = match s.split_once('_') {
            Some((address, table)) => {
                let table = table
                    .strip_suffix('T')
                    .or_else(|| table.strip_suffix('t'))
                    .unwrap_or(table);
                (address, Some(table.parse::<u8>().map_err(|_| invalid())?))
            }
            None => (s, None),
        };
        if address.is_empty() || address.len() > 2 {
            return Err(invalid());
        }
        let address = u8::from_str_radix(address, 16).map_err(|_| invalid())?;
        Ok(Self { address, table })
    }
}

#[cfg(test)]
mod tests {
    use super::PageId;

    #[test]
    fn test_parse_unpaged() {
        let page: PageId = "A2".parse().unwrap();
        assert_eq!(page, PageId::new(0xA2));
        assert_eq!(page.to_string(), "A2");
    }

    #[test]
    fn test_parse_paged() {
        let page: PageId = "a0_3T".parse().unwrap();
        assert_eq!(page, PageId::with_table(0xA0, 3));
        assert_eq!(page.to_string(), "A0_3T");

        let page: PageId = "50_17T".parse().unwrap();
        assert_eq!(page.table, Some(17));

        let page: PageId = "A0_3".parse().unwrap();
        assert_eq!(page, PageId::with_table(0xA0, 3));
        assert_eq!(page.to_string(), "A0_3T");
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "_3T", "A0_", "A0_T", "A0_xT", "1A0", "G0", "A0_300T"] {
            assert!(bad.parse::<PageId>().is_err(), "{bad:?} should not parse");
        }
    }
}
