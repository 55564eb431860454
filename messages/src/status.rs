// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The uniform outcome vocabulary for bridge operations.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// The decoded outcome of the most recent operation on a device.
///
/// Every bridge reports its own numeric codes; those are mapped into this set
/// so that callers can present a single family of messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Success,
    /// No device has been opened yet, or it has gone away.
    #[default]
    Disconnected,
    DeviceNotFound,
    InvalidDevice,
    InvalidParameter,
    InvalidLength,
    ComponentReadError,
    ComponentWriteError,
    ReadTimeout,
    WriteTimeout,
    IoFailure,
    AccessError,
    Unsupported,
    UnknownFailure,
}

impl DeviceStatus {
    pub const fn is_success(&self) -> bool {
        matches!(self, DeviceStatus::Success)
    }

    /// Return true if the failure may clear up on its own and the operation is
    /// worth re-sending.
    pub const fn is_transient(&self) -> bool {
        matches!(self, DeviceStatus::WriteTimeout | DeviceStatus::IoFailure)
    }

    /// Return true if the failure means the device can no longer be opened.
    pub const fn is_gone(&self) -> bool {
        matches!(
            self,
            DeviceStatus::DeviceNotFound | DeviceStatus::InvalidDevice
        )
    }

    /// The operator-facing message for this status.
    pub const fn message(&self) -> &'static str {
        match self {
            DeviceStatus::Success => "Success",
            DeviceStatus::Disconnected => "Device Disconnected",
            DeviceStatus::DeviceNotFound => "Device not Found",
            DeviceStatus::InvalidDevice => "Invalid Device",
            DeviceStatus::InvalidParameter => "Invalid Parameter",
            DeviceStatus::InvalidLength => "Invalid Request Length",
            DeviceStatus::ComponentReadError => "Component Read Error",
            DeviceStatus::ComponentWriteError => "Component Write Error",
            DeviceStatus::ReadTimeout => "Component Read Timeout",
            DeviceStatus::WriteTimeout => "Component Write Timeout",
            DeviceStatus::IoFailure => "Device IO Failure (check board connection)",
            DeviceStatus::AccessError => "Device Access Error (try re-selecting device)",
            DeviceStatus::Unsupported => "Device Not Supported",
            DeviceStatus::UnknownFailure => "Read/Write Failure",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceStatus;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_messages_are_distinct() {
        let messages: HashSet<_> = DeviceStatus::iter().map(|s| s.message()).collect();
        assert_eq!(messages.len(), DeviceStatus::iter().count());
    }

    #[test]
    fn test_only_success_is_success() {
        for status in DeviceStatus::iter() {
            assert_eq!(status.is_success(), status == DeviceStatus::Success);
        }
        assert_eq!(DeviceStatus::Success.to_string(), "Success");
    }

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(DeviceStatus::default().to_string(), "Device Disconnected");
    }

    #[test]
    fn test_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus::WriteTimeout).unwrap(),
            "\"write_timeout\""
        );
    }
}
