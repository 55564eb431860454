// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Module presence and fault lines sampled from bridge GPIO.

use serde::Deserialize;
use serde::Serialize;

bitflags::bitflags! {
    /// The decoded GPIO status field of a bridge with module sideband lines.
    ///
    /// The field is reported as up to three raw bytes, least-significant byte
    /// first. The first two carry the SFP, XFP, and QSFP lines. The third is
    /// reserved for CFP-family cages and is only present on bridges that
    /// drive them.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct GpioStatus: u32 {
        /// The SFP cage is empty.
        const MOD_ABS_SFP = 1 << 0;
        const TX_EN_SFP = 1 << 1;
        const TX_FAULT_SFP = 1 << 2;
        /// The SFP receiver has lost signal.
        const LOS_SFP = 1 << 3;

        /// The XFP cage is empty.
        const MOD_ABS_XFP = 1 << 4;
        const TX_EN_XFP = 1 << 5;
        const INT_XFP = 1 << 6;
        const RST_XFP = 1 << 7;
        /// The XFP module is not ready.
        const MOD_NR_XFP = 1 << 8;
        const LOS_XFP = 1 << 9;

        /// A QSFP module is present.
        const MOD_PRS_QSFP = 1 << 10;
        const INT_QSFP = 1 << 11;
        const RST_QSFP = 1 << 12;
        /// The QSFP module is held in low-power mode.
        const LP_QSFP = 1 << 13;
        const MOD_SEL_QSFP = 1 << 14;

        const MOD_ABS_CFP = 1 << 16;
        const MOD_ABS_CFP2 = 1 << 17;
        const MOD_ABS_CFP4 = 1 << 18;
    }
}

impl GpioStatus {
    /// Decode a raw status field. Bytes past the third are ignored, and bits
    /// with no assigned line are dropped.
    pub fn from_raw(raw: &[u8]) -> Self {
        let bits = raw
            .iter()
            .take(3)
            .enumerate()
            .fold(0u32, |acc, (i, byte)| acc | (u32::from(*byte) << (8 * i)));
        Self::from_bits_truncate(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::GpioStatus;

    #[test]
    fn test_sfp_absent_only() {
        let status = GpioStatus::from_raw(&[0b0000_0001, 0b0000_0000]);
        assert!(status.contains(GpioStatus::MOD_ABS_SFP));
        assert_eq!(status, GpioStatus::MOD_ABS_SFP);
        for (name, flag) in GpioStatus::all().iter_names() {
            if flag != GpioStatus::MOD_ABS_SFP {
                assert!(!status.contains(flag), "{name} should be clear");
            }
        }
    }

    #[test]
    fn test_second_byte_lines() {
        let status = GpioStatus::from_raw(&[0x00, 0b0000_0101]);
        assert_eq!(status, GpioStatus::MOD_NR_XFP | GpioStatus::MOD_PRS_QSFP);
    }

    #[test]
    fn test_unassigned_bits_are_dropped() {
        let status = GpioStatus::from_raw(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(status, GpioStatus::all());
        assert!(!status.contains(GpioStatus::from_bits_retain(1 << 15)));
    }

    #[test]
    fn test_cfp_lines_in_third_byte() {
        let status = GpioStatus::from_raw(&[0, 0, 0b010]);
        assert_eq!(status, GpioStatus::MOD_ABS_CFP2);
        assert!(GpioStatus::from_raw(&[]).is_empty());
    }
}
