// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Dispatching logical accesses to the selected device.

use crate::adapter::BusAddress;
use crate::adapter::Session;
use crate::adapter::TransportAdapter;
use crate::adapter::TransportError;
use crate::config::Config;
use crate::config::TransferConfig;
use crate::config::TransferParams;
use crate::large_access;
use crate::Error;
use optic_messages::DeviceId;
use optic_messages::DeviceStatus;
use optic_messages::Family;
use optic_messages::GpioStatus;
use optic_messages::Identifier;
use optic_messages::MemoryRegion;
use optic_messages::PageId;
use optic_messages::PAGE_SELECT_OFFSET;
use optic_messages::PAGE_SIZE;
use optic_messages::TRANSFER_CEILING;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;

// The table holding the SFF-8024 identifier at offset 0.
const IDENTIFIER_TABLE: u8 = 0xA0;

// Cage lines sampled one at a time on bridges with no status field. Each is
// high when its cage is empty.
const SFP_ABSENT_LINE: u8 = 0;
const XFP_ABSENT_LINE: u8 = 4;
const QSFP_ABSENT_LINE: u8 = 12;

/// A selected device and the outcome of the last operation on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub family: Family,
    pub status: DeviceStatus,
}

/// Routes logical accesses to the selected device of the active family.
///
/// Every access opens the device, runs to completion, and closes it again, so
/// nothing is held between calls. The router is not internally synchronized.
/// Callers sharing it must serialize access themselves.
pub struct ProtocolRouter {
    log: Logger,
    config: Config,
    adapters: Vec<Box<dyn TransportAdapter>>,
    selected: BTreeMap<Family, Device>,
    last_status: DeviceStatus,
}

// Encode a table, offset, and byte count for the bus of `family`, returning
// the bus address and the number of whole units covering `size` bytes.
//
// Register-embedded buses carry the table in the high byte of the register
// address rather than doubling it into a device address.
fn encode(family: Family, table: u8, offset: u8, size: u16) -> (BusAddress, u16) {
    match family {
        Family::DirectAddress => (BusAddress::Direct { table, offset }, size),
        Family::RegisterEmbedded => (
            BusAddress::Register((u16::from(table) << 8) | u16::from(offset)),
            size.div_ceil(2),
        ),
    }
}

fn sample_presence(session: &mut Session<'_>) -> Result<GpioStatus, TransportError> {
    let mut status = GpioStatus::empty();
    status.set(GpioStatus::MOD_ABS_SFP, session.gpio_sample(SFP_ABSENT_LINE)?);
    status.set(GpioStatus::MOD_ABS_XFP, session.gpio_sample(XFP_ABSENT_LINE)?);
    status.set(GpioStatus::MOD_PRS_QSFP, !session.gpio_sample(QSFP_ABSENT_LINE)?);
    Ok(status)
}

impl ProtocolRouter {
    pub fn new(config: Config, log: Logger) -> Self {
        debug!(log, "creating protocol router"; "family" => %config.family);
        Self {
            log,
            config,
            adapters: Vec::new(),
            selected: BTreeMap::new(),
            last_status: DeviceStatus::Disconnected,
        }
    }

    /// Add a bridge driver.
    pub fn register(&mut self, adapter: impl TransportAdapter + 'static) {
        self.register_boxed(Box::new(adapter));
    }

    pub fn register_boxed(&mut self, adapter: Box<dyn TransportAdapter>) {
        debug!(
            self.log,
            "registered adapter";
            "name" => adapter.name(),
            "family" => %adapter.family(),
            "status_table" => adapter.status_table().name()
        );
        self.adapters.push(adapter);
    }

    pub fn family(&self) -> Family {
        self.config.family
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The names of registered adapters of the active family.
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|a| a.family() == self.config.family)
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Enumerate devices on every adapter of the active family.
    ///
    /// An adapter that fails to enumerate is logged and skipped.
    pub fn search(&mut self) -> Vec<DeviceId> {
        let family = self.config.family;
        let mut found = Vec::new();
        for adapter in self.adapters.iter_mut().filter(|a| a.family() == family) {
            match adapter.enumerate() {
                Ok(indices) => {
                    found.extend(indices.into_iter().map(|i| DeviceId::new(adapter.name(), i)))
                }
                Err(e) => warn!(
                    self.log,
                    "device enumeration failed";
                    "adapter" => adapter.name(),
                    "reason" => %e
                ),
            }
        }
        debug!(self.log, "searched for devices"; "n_found" => found.len());
        found
    }

    /// Select a device by its `"<adapter-name> <index>"` identifier.
    pub fn select(&mut self, identifier: &str) -> Result<(), Error> {
        let id = identifier.parse()?;
        self.select_device(id)
    }

    pub fn select_device(&mut self, id: DeviceId) -> Result<(), Error> {
        let family = self.config.family;
        if !self
            .adapters
            .iter()
            .any(|a| a.family() == family && a.name() == id.adapter)
        {
            return Err(Error::UnknownAdapter {
                name: id.adapter,
                family,
            });
        }
        info!(self.log, "selected device"; "device" => %id);
        self.selected.insert(
            family,
            Device {
                id,
                family,
                status: DeviceStatus::Disconnected,
            },
        );
        Ok(())
    }

    /// The selected device of the active family.
    pub fn selected(&self) -> Option<&Device> {
        self.selected.get(&self.config.family)
    }

    pub fn deselect(&mut self) -> Option<Device> {
        self.selected.remove(&self.config.family)
    }

    /// The status of the most recent operation.
    pub fn status(&self) -> DeviceStatus {
        self.selected().map_or(self.last_status, |d| d.status)
    }

    /// Run `f` with `transfer` in place of the configured transfer settings,
    /// restoring them afterwards.
    pub fn with_transfer<T>(
        &mut self,
        transfer: TransferConfig,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let previous = std::mem::replace(&mut self.config.transfer, transfer);
        let out = f(self);
        self.config.transfer = previous;
        out
    }

    /// Read `size` bytes of `table` starting at `offset`.
    ///
    /// With no device selected, the result is empty. See
    /// [`large_access::safe_read`] for how a size that is not a multiple of
    /// the read chunk is handled; [`ProtocolRouter::read_all`] never leaves a
    /// partial tail.
    pub fn read(&mut self, table: u8, size: u16, offset: u8) -> Result<Vec<u8>, Error> {
        if self.selected().is_none() {
            debug!(self.log, "read with no device selected");
            return Ok(Vec::new());
        }
        MemoryRegion::new(table, offset, size)?;
        let (address, units) = encode(self.config.family, table, offset, size);
        self.with_selected(|adapter, device, params, log| {
            let mut data = large_access::safe_read(adapter, device, params, address, units, log)?;
            // A trailing half word is read whole, and its second byte dropped.
            data.truncate(usize::from(size));
            Ok(data)
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Read `size` bytes of `table` starting at `offset`, in pieces no larger
    /// than one read transaction so that every byte is read.
    pub fn read_all(&mut self, table: u8, size: u16, offset: u8) -> Result<Vec<u8>, Error> {
        let Some(piece) = self.read_piece() else {
            return Ok(Vec::new());
        };
        if piece == 0 {
            return self.read(table, size, offset);
        }
        MemoryRegion::new(table, offset, size)?;
        // Register addresses count words, not bytes.
        let unit = self.config.family.unit_bytes() as u16;
        let mut out = Vec::with_capacity(usize::from(size));
        let mut done = 0;
        while done < size {
            let n = piece.min(size - done);
            let at = (u16::from(offset) + done / unit) as u8;
            let data = self.read(table, n, at)?;
            if data.is_empty() {
                return Ok(data);
            }
            out.extend_from_slice(&data);
            done += n;
        }
        Ok(out)
    }

    /// Write `data` to `table` starting at `offset`.
    ///
    /// Returns `Ok(false)` without touching the bus when no device is
    /// selected or there is nothing to write.
    pub fn write(&mut self, table: u8, offset: u8, data: &[u8]) -> Result<bool, Error> {
        if self.selected().is_none() {
            debug!(self.log, "write with no device selected");
            return Ok(false);
        }
        if data.is_empty() {
            debug!(self.log, "ignoring empty write");
            return Ok(false);
        }
        let (address, _) = encode(self.config.family, table, offset, 0);
        match self.with_selected(|adapter, device, params, log| {
            large_access::safe_write(adapter, device, params, address, data, log)
        }) {
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    pub fn write_byte(&mut self, table: u8, offset: u8, value: u8) -> Result<bool, Error> {
        self.write(table, offset, &[value])
    }

    /// Read a whole page, selecting its upper page first when `paged` is set
    /// and the identifier names one.
    pub fn read_page(&mut self, page: PageId, paged: bool) -> Result<Vec<u8>, Error> {
        if let (true, Some(table)) = (paged, page.table) {
            debug!(self.log, "selecting page"; "page" => %page);
            if !self.write_byte(page.address, PAGE_SELECT_OFFSET, table)? {
                return Ok(Vec::new());
            }
        }
        self.read_all(page.address, PAGE_SIZE as u16, 0)
    }

    /// Sample the module status lines of the selected device.
    ///
    /// A bridge with no status field may still sample single lines, in which
    /// case only the cage presence flags are reported.
    pub fn gpio(&mut self) -> Result<GpioStatus, Error> {
        self.with_selected(|adapter, device, params, log| {
            let mut session = Session::open(adapter, device, params.bit_rate, log)?;
            let raw = session.gpio_status();
            let status = match raw {
                Ok(raw) => Ok(GpioStatus::from_raw(&raw)),
                Err(TransportError::Unsupported) => sample_presence(&mut session),
                Err(e) => Err(e),
            };
            drop(session);
            match status {
                Ok(status) => Ok(status),
                Err(TransportError::Unsupported) => Err(Error::GpioUnsupported(device.clone())),
                Err(e) => Err(Error::Gpio(e)),
            }
        })
        .unwrap_or(Err(Error::NoDeviceSelected))
    }

    /// Read the SFF-8024 identifier of the module behind the selected device.
    pub fn identify(&mut self) -> Result<Identifier, Error> {
        let data = self.read(IDENTIFIER_TABLE, 2, 0)?;
        data.first()
            .map(|byte| Identifier::from(*byte))
            .ok_or(Error::NoDeviceSelected)
    }

    /// Select the first enumerated device with a module plugged in.
    ///
    /// If none is found, no device is left selected.
    pub fn deduce_device(&mut self) -> Result<Option<DeviceId>, Error> {
        for id in self.search() {
            self.select_device(id.clone())?;
            match self.identify() {
                Ok(ident) if ident.is_present() => {
                    info!(self.log, "found module"; "device" => %id, "identifier" => %ident);
                    return Ok(Some(id));
                }
                Ok(_) => debug!(self.log, "no module present"; "device" => %id),
                Err(e) => debug!(self.log, "failed to identify module"; "device" => %id, "reason" => %e),
            }
        }
        self.deselect();
        Ok(None)
    }

    // The largest read, in bytes, that the selected device moves in one
    // transaction.
    fn read_piece(&self) -> Option<u16> {
        let device = self.selected()?;
        let adapter = self.find_adapter(&device.id)?;
        let params = self.config.transfer.resolve(&adapter.limits());
        let unit = adapter.family().unit_bytes() as u16;
        Some(params.read_chunk.min(TRANSFER_CEILING / unit) * unit)
    }

    fn find_adapter(&self, id: &DeviceId) -> Option<&dyn TransportAdapter> {
        self.adapters
            .iter()
            .find(|a| a.family() == self.config.family && a.name() == id.adapter)
            .map(|a| a.as_ref())
    }

    // Run `op` against the adapter of the selected device and record the
    // resulting status. Returns `None` if no device is selected.
    fn with_selected<T>(
        &mut self,
        op: impl FnOnce(
            &mut dyn TransportAdapter,
            &DeviceId,
            &TransferParams,
            &Logger,
        ) -> Result<T, Error>,
    ) -> Option<Result<T, Error>> {
        let family = self.config.family;
        let device = self.selected()?.id.clone();
        let Some(adapter) = self
            .adapters
            .iter_mut()
            .find(|a| a.family() == family && a.name() == device.adapter)
        else {
            return Some(Err(Error::UnknownAdapter {
                name: device.adapter,
                family,
            }));
        };
        let params = self.config.transfer.resolve(&adapter.limits());
        let table = adapter.status_table();
        let result = op(adapter.as_mut(), &device, &params, &self.log);

        let status = match &result {
            Ok(_) => DeviceStatus::Success,
            Err(e) => e.status(table),
        };
        let gone = matches!(result, Err(Error::DeviceUnavailable { .. })) && status.is_gone();
        self.record(&device, status, gone);
        Some(result)
    }

    fn record(&mut self, device: &DeviceId, status: DeviceStatus, gone: bool) {
        self.last_status = status;
        let family = self.config.family;
        if gone {
            warn!(self.log, "device can no longer be opened, dropping selection"; "device" => %device);
            self.selected.remove(&family);
        } else if let Some(selected) = self.selected.get_mut(&family) {
            selected.status = status;
        }
        if !status.is_success() {
            debug!(self.log, "operation failed"; "device" => %device, "status" => %status);
        }
    }
}
