// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Decoding bridge status codes into [`DeviceStatus`].

use crate::adapter::TransportError;
use optic_messages::DeviceStatus;
use std::io::ErrorKind;

/// Maps one bridge family's numeric status codes onto [`DeviceStatus`].
///
/// Codes missing from the table decode as [`DeviceStatus::UnknownFailure`].
#[derive(Debug)]
pub struct StatusTable {
    name: &'static str,
    codes: &'static [(u32, DeviceStatus)],
}

impl StatusTable {
    pub const fn new(name: &'static str, codes: &'static [(u32, DeviceStatus)]) -> Self {
        Self { name, codes }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, code: u32) -> DeviceStatus {
        self.codes
            .iter()
            .find_map(|(c, status)| (*c == code).then_some(*status))
            .unwrap_or(DeviceStatus::UnknownFailure)
    }

    /// Return the first code which decodes to `status`, if any.
    pub fn code_for(&self, status: DeviceStatus) -> Option<u32> {
        self.codes
            .iter()
            .find_map(|(code, s)| (*s == status).then_some(*code))
    }

    /// Decode the status implied by a driver failure.
    pub fn status_of(&self, err: &TransportError) -> DeviceStatus {
        match err {
            TransportError::Status(code) => self.decode(*code),
            TransportError::Io(e) => match e.kind() {
                ErrorKind::NotFound => DeviceStatus::DeviceNotFound,
                ErrorKind::PermissionDenied => DeviceStatus::AccessError,
                ErrorKind::InvalidInput => DeviceStatus::InvalidParameter,
                _ => DeviceStatus::IoFailure,
            },
            TransportError::Unsupported => DeviceStatus::Unsupported,
            TransportError::ShortTransfer { .. } => DeviceStatus::InvalidLength,
        }
    }
}

/// Silicon Labs CP2112 HID-to-SMBus bridge.
pub static CP2112: StatusTable = StatusTable::new(
    "CP2112",
    &[
        (0x00, DeviceStatus::Success),
        (0x01, DeviceStatus::DeviceNotFound),
        (0x02, DeviceStatus::InvalidDevice),
        (0x03, DeviceStatus::InvalidDevice),
        (0x04, DeviceStatus::InvalidParameter),
        (0x05, DeviceStatus::InvalidLength),
        (0x10, DeviceStatus::ComponentReadError),
        (0x11, DeviceStatus::ComponentWriteError),
        (0x12, DeviceStatus::ReadTimeout),
        (0x13, DeviceStatus::WriteTimeout),
        (0x14, DeviceStatus::IoFailure),
        (0x15, DeviceStatus::AccessError),
        (0x16, DeviceStatus::Unsupported),
    ],
);

/// FTDI FT4222H, in either of its I2C master configurations.
pub static FT4222: StatusTable = StatusTable::new(
    "FT4222",
    &[
        (0x00, DeviceStatus::Success),
        (0x01, DeviceStatus::InvalidDevice),
        (0x02, DeviceStatus::DeviceNotFound),
        (0x03, DeviceStatus::AccessError),
        (0x04, DeviceStatus::IoFailure),
        (0x05, DeviceStatus::AccessError),
        (0x06, DeviceStatus::InvalidParameter),
        (0x07, DeviceStatus::InvalidParameter),
        (0x08, DeviceStatus::AccessError),
        (0x09, DeviceStatus::AccessError),
        (0x0A, DeviceStatus::ComponentWriteError),
        (0x0B, DeviceStatus::ComponentReadError),
        (0x0C, DeviceStatus::ComponentWriteError),
        (0x0D, DeviceStatus::ComponentWriteError),
        (0x0E, DeviceStatus::DeviceNotFound),
        (0x0F, DeviceStatus::ComponentReadError),
        (0x10, DeviceStatus::InvalidParameter),
        (0x11, DeviceStatus::Unsupported),
        (0x12, DeviceStatus::Unsupported),
    ],
);

/// Silicon Labs USBXpress bulk bridge.
pub static USBXPRESS: StatusTable = StatusTable::new(
    "USBXpress",
    &[
        (0x00, DeviceStatus::Success),
        (0x01, DeviceStatus::InvalidDevice),
        (0x02, DeviceStatus::ComponentReadError),
        (0x04, DeviceStatus::ComponentWriteError),
        (0x05, DeviceStatus::AccessError),
        (0x06, DeviceStatus::InvalidParameter),
        (0x07, DeviceStatus::InvalidLength),
        (0x08, DeviceStatus::IoFailure),
        (0x09, DeviceStatus::InvalidParameter),
        (0x0A, DeviceStatus::Unsupported),
        (0x0C, DeviceStatus::IoFailure),
        (0x0D, DeviceStatus::ReadTimeout),
        (0x0E, DeviceStatus::WriteTimeout),
        (0x0F, DeviceStatus::IoFailure),
        (0xFF, DeviceStatus::DeviceNotFound),
    ],
);
