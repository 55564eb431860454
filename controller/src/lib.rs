// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Safe, chunked access to optical transceiver memory through USB bridges.
//!
//! A [`ProtocolRouter`] owns a set of [`TransportAdapter`]s, one per bridge
//! family attached to the host. Callers select one enumerated device and issue
//! logical reads and writes of up to a page, which the router encodes for the
//! active addressing [`Family`] and hands to the engines in [`large_access`].
//! The [`server`] module exposes the router over HTTP.

pub mod adapter;
mod config;
pub mod large_access;
mod router;
pub mod server;
pub mod sim;
pub mod status;

pub use adapter::BusAddress;
pub use adapter::TransferLimits;
pub use adapter::TransportAdapter;
pub use adapter::TransportError;
pub use config::default_bit_rate;
pub use config::default_listen_addr;
pub use config::default_write_retries;
pub use config::Config;
pub use config::ConfigBuilder;
pub use config::TransferConfig;
pub use config::TransferParams;
pub use optic_messages::DeviceId;
pub use optic_messages::DeviceStatus;
pub use optic_messages::Family;
pub use router::Device;
pub use router::ProtocolRouter;
pub use status::StatusTable;

/// An error accessing a transceiver through a bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be opened. No transaction was attempted.
    #[error("device '{device}' is unavailable")]
    DeviceUnavailable {
        device: DeviceId,
        source: TransportError,
    },

    #[error("read failed at {address}")]
    ReadFailed {
        address: BusAddress,
        source: TransportError,
    },

    #[error("write failed at {address}")]
    WriteFailed {
        address: BusAddress,
        source: TransportError,
    },

    #[error("transfer chunk size must be non-zero")]
    InvalidChunkSize,

    #[error("no data to write")]
    EmptyWrite,

    #[error("no device is selected")]
    NoDeviceSelected,

    #[error("no {family} adapter named '{name}'")]
    UnknownAdapter { name: String, family: Family },

    #[error("device '{0}' does not report GPIO status")]
    GpioUnsupported(DeviceId),

    #[error("GPIO access failed")]
    Gpio(#[source] TransportError),

    #[error(transparent)]
    Message(#[from] optic_messages::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The driver failure underlying this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::DeviceUnavailable { source, .. }
            | Error::ReadFailed { source, .. }
            | Error::WriteFailed { source, .. }
            | Error::Gpio(source) => Some(source),
            _ => None,
        }
    }

    /// The device status this error implies, decoding driver codes with
    /// `table`.
    pub fn status(&self, table: &StatusTable) -> DeviceStatus {
        if let Some(source) = self.transport() {
            return table.status_of(source);
        }
        match self {
            Error::InvalidChunkSize | Error::Message(_) | Error::Config(_) => {
                DeviceStatus::InvalidParameter
            }
            Error::EmptyWrite => DeviceStatus::InvalidLength,
            Error::UnknownAdapter { .. } => DeviceStatus::DeviceNotFound,
            Error::GpioUnsupported(_) => DeviceStatus::Unsupported,
            Error::NoDeviceSelected => DeviceStatus::Disconnected,
            _ => DeviceStatus::UnknownFailure,
        }
    }
}
