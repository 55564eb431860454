// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! An in-memory bridge, for exercising the router without hardware.
//!
//! A [`SimulatedBridge`] stores whatever is written to it and returns it on
//! read, enforces its declared transaction limits, and records every call it
//! receives. A [`SimHandle`] shares the bridge's state, so that memory and the
//! transaction log can be inspected, and faults injected, after the bridge has
//! been handed to a router.

use crate::adapter::BusAddress;
use crate::adapter::TransferLimits;
use crate::adapter::TransportAdapter;
use crate::adapter::TransportError;
use crate::status::StatusTable;
use crate::status::CP2112;
use optic_messages::DeviceStatus;
use optic_messages::Family;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// One call received by a simulated bridge.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transaction {
    Open { index: u32, bit_rate: u32 },
    Close,
    WaitIdle,
    Read { address: BusAddress, len: u16 },
    Write { address: BusAddress, data: Vec<u8> },
}

/// Fail the `nth` (zero-based) transaction of a kind with `status`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fault {
    pub nth: usize,
    pub status: DeviceStatus,
}

impl Fault {
    pub const fn new(nth: usize, status: DeviceStatus) -> Self {
        Self { nth, status }
    }
}

/// Failures to inject into a simulated bridge.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Faults {
    /// Fail every enumeration.
    pub enumerate: bool,
    /// Fail every open with this status.
    pub open: Option<DeviceStatus>,
    pub read: Option<Fault>,
    pub write: Option<Fault>,
    /// Fail this many upcoming write attempts with a write timeout.
    pub transient_writes: usize,
}

#[derive(Debug, Default)]
struct SimState {
    devices: u32,
    // Keyed by device index and byte address.
    memory: BTreeMap<(u32, u32), u8>,
    gpio: Option<Vec<u8>>,
    // Individually sampled lines, bit `n` being line `n`.
    gpio_lines: Option<u32>,
    open: Option<u32>,
    faults: Faults,
    n_reads: usize,
    n_writes: usize,
    opens: usize,
    closes: usize,
    transactions: Vec<Transaction>,
}

// The key of byte `i` of an access starting at `address`.
fn byte_key(address: BusAddress, i: usize) -> u32 {
    match address {
        BusAddress::Direct { table, offset } => {
            (u32::from(table) << 8) | u32::from(offset.wrapping_add(i as u8))
        }
        BusAddress::Register(register) => {
            u32::from(register.wrapping_add((i / 2) as u16)) * 2 + (i % 2) as u32
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory bridge holding one or more devices.
pub struct SimulatedBridge {
    name: String,
    family: Family,
    limits: TransferLimits,
    table: &'static StatusTable,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBridge {
    /// Create a bridge with one attached device.
    ///
    /// Direct-address bridges move 128-byte reads and 8-byte writes, and
    /// register-embedded bridges 64-word reads and 4-word writes. Vendor codes
    /// follow the CP2112 table.
    pub fn new(name: impl Into<String>, family: Family) -> Self {
        let limits = match family {
            Family::DirectAddress => TransferLimits::new(128, 8),
            Family::RegisterEmbedded => TransferLimits::new(64, 4),
        };
        Self {
            name: name.into(),
            family,
            limits,
            table: &CP2112,
            state: Arc::new(Mutex::new(SimState {
                devices: 1,
                ..Default::default()
            })),
        }
    }

    pub fn with_devices(self, devices: u32) -> Self {
        lock(&self.state).devices = devices;
        self
    }

    pub fn with_limits(mut self, limits: TransferLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_status_table(mut self, table: &'static StatusTable) -> Self {
        self.table = table;
        self
    }

    /// Report `raw` as the GPIO status field of every device.
    pub fn with_gpio(self, raw: Vec<u8>) -> Self {
        lock(&self.state).gpio = Some(raw);
        self
    }

    /// Report GPIO lines one at a time from `lines`, where bit `n` is line
    /// `n`, with no status field.
    pub fn with_gpio_lines(self, lines: u32) -> Self {
        lock(&self.state).gpio_lines = Some(lines);
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn fail(&self, status: DeviceStatus) -> TransportError {
        TransportError::Status(self.table.code_for(status).unwrap_or(u32::MAX))
    }

    // Check that a transaction of `units` at `address` is one this bridge
    // could carry out.
    fn check(&self, address: BusAddress, units: usize, max: u16) -> Result<(), TransportError> {
        let family_matches = matches!(
            (self.family, address),
            (Family::DirectAddress, BusAddress::Direct { .. })
                | (Family::RegisterEmbedded, BusAddress::Register(_))
        );
        if !family_matches {
            return Err(self.fail(DeviceStatus::InvalidParameter));
        }
        if units == 0 || units > usize::from(max) {
            return Err(self.fail(DeviceStatus::InvalidLength));
        }
        Ok(())
    }

    fn open_device(&self, state: &SimState) -> Result<u32, TransportError> {
        state
            .open
            .ok_or_else(|| self.fail(DeviceStatus::AccessError))
    }
}

impl TransportAdapter for SimulatedBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Family {
        self.family
    }

    fn limits(&self) -> TransferLimits {
        self.limits
    }

    fn status_table(&self) -> &'static StatusTable {
        self.table
    }

    fn enumerate(&mut self) -> Result<Vec<u32>, TransportError> {
        let state = lock(&self.state);
        if state.faults.enumerate {
            return Err(TransportError::Io(io::Error::other("device scan failed")));
        }
        Ok((0..state.devices).collect())
    }

    fn open(&mut self, index: u32, bit_rate: u32) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.transactions.push(Transaction::Open { index, bit_rate });
        if let Some(status) = state.faults.open {
            return Err(self.fail(status));
        }
        if index >= state.devices {
            return Err(self.fail(DeviceStatus::DeviceNotFound));
        }
        if state.open.is_some() {
            return Err(self.fail(DeviceStatus::AccessError));
        }
        state.open = Some(index);
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.transactions.push(Transaction::Close);
        match state.open.take() {
            Some(_) => {
                state.closes += 1;
                Ok(())
            }
            None => Err(self.fail(DeviceStatus::InvalidDevice)),
        }
    }

    fn raw_read(&mut self, address: BusAddress, len: u16) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        state.transactions.push(Transaction::Read { address, len });
        let device = self.open_device(&state)?;
        self.check(address, usize::from(len), self.limits.max_read_chunk)?;

        let nth = state.n_reads;
        state.n_reads += 1;
        if let Some(fault) = state.faults.read.filter(|f| f.nth == nth) {
            return Err(self.fail(fault.status));
        }

        let n_bytes = usize::from(len) * self.family.unit_bytes();
        Ok((0..n_bytes)
            .map(|i| {
                state
                    .memory
                    .get(&(device, byte_key(address, i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn raw_write(&mut self, address: BusAddress, data: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.transactions.push(Transaction::Write {
            address,
            data: data.to_vec(),
        });
        let device = self.open_device(&state)?;
        let unit = self.family.unit_bytes();
        if data.len() % unit != 0 {
            return Err(self.fail(DeviceStatus::InvalidLength));
        }
        self.check(address, data.len() / unit, self.limits.max_write_chunk)?;

        let nth = state.n_writes;
        state.n_writes += 1;
        if state.faults.transient_writes > 0 {
            state.faults.transient_writes -= 1;
            return Err(self.fail(DeviceStatus::WriteTimeout));
        }
        if let Some(fault) = state.faults.write.filter(|f| f.nth == nth) {
            return Err(self.fail(fault.status));
        }

        for (i, byte) in data.iter().enumerate() {
            state.memory.insert((device, byte_key(address, i)), *byte);
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), TransportError> {
        lock(&self.state).transactions.push(Transaction::WaitIdle);
        Ok(())
    }

    fn gpio_sample(&mut self, line: u8) -> Result<bool, TransportError> {
        let state = lock(&self.state);
        self.open_device(&state)?;
        if let Some(lines) = state.gpio_lines {
            return match lines.checked_shr(u32::from(line)) {
                Some(bits) => Ok(bits & 1 != 0),
                None => Err(self.fail(DeviceStatus::InvalidParameter)),
            };
        }
        let raw = state.gpio.as_ref().ok_or(TransportError::Unsupported)?;
        let byte = raw
            .get(usize::from(line / 8))
            .ok_or_else(|| self.fail(DeviceStatus::InvalidParameter))?;
        Ok(byte & (1 << (line % 8)) != 0)
    }

    fn gpio_status(&mut self) -> Result<Vec<u8>, TransportError> {
        let state = lock(&self.state);
        self.open_device(&state)?;
        state.gpio.clone().ok_or(TransportError::Unsupported)
    }
}

/// Shared access to a [`SimulatedBridge`]'s state.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Store `bytes` on `device` starting at `address`.
    pub fn poke(&self, device: u32, address: BusAddress, bytes: &[u8]) {
        let mut state = lock(&self.state);
        for (i, byte) in bytes.iter().enumerate() {
            state.memory.insert((device, byte_key(address, i)), *byte);
        }
    }

    /// Return `len` bytes of `device` starting at `address`.
    pub fn peek(&self, device: u32, address: BusAddress, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        (0..len)
            .map(|i| {
                state
                    .memory
                    .get(&(device, byte_key(address, i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn set_faults(&self, faults: Faults) {
        let mut state = lock(&self.state);
        state.faults = faults;
        state.n_reads = 0;
        state.n_writes = 0;
    }

    /// Detach every device.
    pub fn unplug(&self) {
        lock(&self.state).devices = 0;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        lock(&self.state).transactions.clone()
    }

    pub fn clear_transactions(&self) {
        lock(&self.state).transactions.clear();
    }

    pub fn reads(&self) -> Vec<(BusAddress, u16)> {
        self.transactions()
            .into_iter()
            .filter_map(|t| match t {
                Transaction::Read { address, len } => Some((address, len)),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(BusAddress, Vec<u8>)> {
        self.transactions()
            .into_iter()
            .filter_map(|t| match t {
                Transaction::Write { address, data } => Some((address, data)),
                _ => None,
            })
            .collect()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(table: u8, offset: u8) -> BusAddress {
        BusAddress::Direct { table, offset }
    }

    #[test]
    fn test_sim_stores_per_device() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress).with_devices(2);
        bridge.open(1, 100_000).unwrap();
        bridge.raw_write(direct(0xA0, 4), &[9, 8, 7]).unwrap();
        assert_eq!(bridge.raw_read(direct(0xA0, 3), 5).unwrap(), vec![0, 9, 8, 7, 0]);
        bridge.close().unwrap();

        let handle = bridge.handle();
        assert_eq!(handle.peek(1, direct(0xA0, 4), 3), vec![9, 8, 7]);
        assert_eq!(handle.peek(0, direct(0xA0, 4), 3), vec![0, 0, 0]);
    }

    #[test]
    fn test_sim_enforces_limits() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        assert!(bridge.raw_read(direct(0xA0, 0), 1).is_err());
        bridge.open(0, 100_000).unwrap();
        let err = bridge.raw_write(direct(0xA0, 0), &[0; 9]).unwrap_err();
        assert_eq!(CP2112.status_of(&err), DeviceStatus::InvalidLength);
        let err = bridge.raw_read(BusAddress::Register(0xA000), 1).unwrap_err();
        assert_eq!(CP2112.status_of(&err), DeviceStatus::InvalidParameter);
        let err = bridge.open(0, 100_000).unwrap_err();
        assert_eq!(CP2112.status_of(&err), DeviceStatus::AccessError);
    }

    #[test]
    fn test_sim_register_words() {
        let mut bridge = SimulatedBridge::new("SIM", Family::RegisterEmbedded);
        bridge.open(0, 100_000).unwrap();
        bridge
            .raw_write(BusAddress::Register(0xA001), &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(
            bridge.raw_read(BusAddress::Register(0xA002), 1).unwrap(),
            vec![3, 4]
        );
    }

    #[test]
    fn test_sim_gpio() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        bridge.open(0, 100_000).unwrap();
        assert!(matches!(
            bridge.gpio_status(),
            Err(TransportError::Unsupported)
        ));
        bridge.close().unwrap();

        let mut bridge = bridge.with_gpio(vec![0b0001_0001, 0x00]);
        bridge.open(0, 100_000).unwrap();
        assert!(bridge.gpio_sample(0).unwrap());
        assert!(!bridge.gpio_sample(1).unwrap());
        assert!(bridge.gpio_sample(4).unwrap());
        assert!(bridge.gpio_sample(20).is_err());
        bridge.close().unwrap();

        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress)
            .with_gpio_lines(1 << 12);
        bridge.open(0, 100_000).unwrap();
        assert!(matches!(
            bridge.gpio_status(),
            Err(TransportError::Unsupported)
        ));
        assert!(bridge.gpio_sample(12).unwrap());
        assert!(!bridge.gpio_sample(0).unwrap());
        assert!(bridge.gpio_sample(40).is_err());
    }

    #[test]
    fn test_sim_enumerate_fault() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress).with_devices(3);
        assert_eq!(bridge.enumerate().unwrap(), vec![0, 1, 2]);
        bridge.handle().set_faults(Faults {
            enumerate: true,
            ..Default::default()
        });
        assert!(bridge.enumerate().is_err());
    }
}
