// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Identification of the kind of module plugged into a cage.

use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The SFF-8024 identifier, the first byte of every module's memory map.
///
/// Only the form factors a bridge board can host are named. Anything else is
/// carried through as its raw value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Identifier {
    Unknown,
    Gbic,
    Soldered,
    Sfp,
    Xfp,
    DwdmSfp,
    Qsfp,
    QsfpPlusSff8636,
    Qsfp28,
    QsfpDD,
    QsfpPlusCmis,
    Reserved(u8),
    VendorSpecific(u8),
    Other(u8),
}

impl Identifier {
    /// The cage family a module with this identifier sits in, if known.
    pub const fn part_type(&self) -> Option<PartType> {
        use Identifier::*;
        match self {
            Gbic | Sfp | DwdmSfp => Some(PartType::Sfp),
            Xfp => Some(PartType::Xfp),
            Qsfp | QsfpPlusSff8636 | Qsfp28 | QsfpDD | QsfpPlusCmis => Some(PartType::Qsfp),
            _ => None,
        }
    }

    /// Return true if a module has identified itself at all.
    pub const fn is_present(&self) -> bool {
        !matches!(self, Identifier::Unknown)
    }
}

impl From<u8> for Identifier {
    fn from(x: u8) -> Self {
        use Identifier::*;
        match x {
            0x00 => Unknown,
            0x01 => Gbic,
            0x02 => Soldered,
            0x03 => Sfp,
            0x06 => Xfp,
            0x0b => DwdmSfp,
            0x0c => Qsfp,
            0x0d => QsfpPlusSff8636,
            0x11 => Qsfp28,
            0x18 => QsfpDD,
            0x1e => QsfpPlusCmis,
            0x21..=0x7f => Reserved(x),
            0x80.. => VendorSpecific(x),
            _ => Other(x),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Identifier::*;
        match self {
            Unknown => write!(f, "Unknown or unspecified"),
            Gbic => write!(f, "GBIC"),
            Soldered => write!(f, "Module soldered to motherboard"),
            Sfp => write!(f, "SFP/SFP+/SFP28"),
            Xfp => write!(f, "XFP"),
            DwdmSfp => write!(f, "DWDM-SFP/SFP+"),
            Qsfp => write!(f, "QSFP"),
            QsfpPlusSff8636 => write!(f, "QSFP+ (SFF-8636)"),
            Qsfp28 => write!(f, "QSFP28"),
            QsfpDD => write!(f, "QSFP-DD"),
            QsfpPlusCmis => write!(f, "QSFP+ (CMIS)"),
            Reserved(x) => write!(f, "Reserved ({x:#04x})"),
            VendorSpecific(x) => write!(f, "Vendor-specific ({x:#04x})"),
            Other(x) => write!(f, "Other ({x:#04x})"),
        }
    }
}

/// The cage family a request targets.
///
/// Paged families expose upper pages behind a page select byte, and must have
/// it written before an upper page can be read.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum PartType {
    #[default]
    Sfp,
    Xfp,
    Qsfp,
    Cfp,
}

impl PartType {
    pub const fn is_paged(&self) -> bool {
        matches!(self, PartType::Xfp | PartType::Qsfp)
    }
}

impl FromStr for PartType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SFP" | "SFP+" | "SFP28" => Ok(PartType::Sfp),
            "XFP" => Ok(PartType::Xfp),
            "QSFP" | "QSFP+" | "QSFP28" | "QSFP-DD" => Ok(PartType::Qsfp),
            "CFP" | "CFP2" | "CFP4" => Ok(PartType::Cfp),
            _ => Err(Error::InvalidPartType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Identifier;
    use super::PartType;

    #[test]
    fn test_identifier_from_byte() {
        assert_eq!(Identifier::from(0x03), Identifier::Sfp);
        assert_eq!(Identifier::from(0x11), Identifier::Qsfp28);
        assert_eq!(Identifier::from(0x40), Identifier::Reserved(0x40));
        assert_eq!(Identifier::from(0x90), Identifier::VendorSpecific(0x90));
        assert_eq!(Identifier::from(0x04), Identifier::Other(0x04));
        assert!(!Identifier::from(0x00).is_present());
    }

    #[test]
    fn test_part_type_of_identifier() {
        assert_eq!(Identifier::Sfp.part_type(), Some(PartType::Sfp));
        assert_eq!(Identifier::Xfp.part_type(), Some(PartType::Xfp));
        assert_eq!(Identifier::QsfpDD.part_type(), Some(PartType::Qsfp));
        assert_eq!(Identifier::Soldered.part_type(), None);
    }

    #[test]
    fn test_part_type_parse() {
        assert_eq!("qsfp28".parse::<PartType>().unwrap(), PartType::Qsfp);
        assert_eq!("SFP".parse::<PartType>().unwrap(), PartType::Sfp);
        assert!("OSFP".parse::<PartType>().is_err());
        assert!(PartType::Qsfp.is_paged());
        assert!(!PartType::Sfp.is_paged());
    }
}
