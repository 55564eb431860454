// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Splitting large memory accesses into bridge-sized transactions.
//!
//! USB bridges can only move a few dozen bytes per bus transaction, and
//! modules need time to settle between them. The functions here take one
//! logical read or write of up to a page and issue it as a sequence of
//! transactions no larger than the bridge allows, opening the device once
//! beforehand and closing it once afterwards on every path.
//!
//! Sizes and chunk limits are counted in transfer units, which are bytes on
//! direct-address bridges and 16-bit words on register-embedded ones.

use crate::adapter::BusAddress;
use crate::adapter::Session;
use crate::adapter::TransportAdapter;
use crate::adapter::TransportError;
use crate::config::TransferParams;
use crate::status::StatusTable;
use crate::Error;
use optic_messages::DeviceId;
use optic_messages::PAGE_SIZE;
use optic_messages::TRANSFER_CEILING;
use slog::debug;
use slog::error;
use slog::trace;
use slog::Logger;
use std::thread;

/// Read `size` units starting at `address`.
///
/// Each transaction is `min(read_chunk, size)` units, and `size / chunk` of
/// them are issued. When `size` is not a multiple of the chunk, the trailing
/// partial chunk is not read and its bytes are left zeroed in the returned
/// buffer, which is always `size` units long.
pub fn safe_read(
    adapter: &mut dyn TransportAdapter,
    device: &DeviceId,
    params: &TransferParams,
    address: BusAddress,
    size: u16,
    log: &Logger,
) -> Result<Vec<u8>, Error> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let max_chunk = params.read_chunk.min(TRANSFER_CEILING);
    if max_chunk == 0 {
        return Err(Error::InvalidChunkSize);
    }
    let chunk = max_chunk.min(size);
    let iterations = size / chunk;
    if size % chunk != 0 {
        debug!(
            log,
            "read size is not a multiple of the chunk size, tail is not read";
            "size" => size,
            "chunk" => chunk
        );
    }

    let unit = adapter.family().unit_bytes();
    let chunk_bytes = usize::from(chunk) * unit;
    let mut out = vec![0u8; usize::from(size) * unit];
    let mut session = Session::open(adapter, device, params.bit_rate, log)?;
    for i in 0..iterations {
        let at = address.advance(chunk * i);
        trace!(log, "read"; "address" => %at, "len" => chunk);
        let data = session.raw_read(at, chunk).map_err(|source| {
            error!(log, "read aborted"; "address" => %at, "reason" => %source);
            Error::ReadFailed {
                address: at,
                source,
            }
        })?;
        if data.len() != chunk_bytes {
            return Err(Error::ReadFailed {
                address: at,
                source: TransportError::ShortTransfer {
                    expected: chunk_bytes,
                    actual: data.len(),
                },
            });
        }
        let start = usize::from(i) * chunk_bytes;
        out[start..start + chunk_bytes].copy_from_slice(&data);
        thread::sleep(params.settle_delay);
    }
    Ok(out)
}

/// Write `data` starting at `address`.
///
/// At most one page is written, and anything past [`PAGE_SIZE`] bytes is
/// dropped. On register-embedded bridges an odd trailing byte is completed to
/// a whole word with the byte the module already holds next to it, so that
/// byte is rewritten unchanged. Transactions are issued in address order and
/// the first failure stops the sequence. Bytes already written are not rolled
/// back.
pub fn safe_write(
    adapter: &mut dyn TransportAdapter,
    device: &DeviceId,
    params: &TransferParams,
    address: BusAddress,
    data: &[u8],
    log: &Logger,
) -> Result<(), Error> {
    if data.is_empty() {
        return Err(Error::EmptyWrite);
    }
    let max_chunk = params.write_chunk.min(TRANSFER_CEILING);
    if max_chunk == 0 {
        return Err(Error::InvalidChunkSize);
    }
    if data.len() > PAGE_SIZE {
        debug!(
            log,
            "truncating write to one page";
            "requested" => data.len(),
            "written" => PAGE_SIZE
        );
    }

    let unit = adapter.family().unit_bytes();
    let mut data = data[..data.len().min(PAGE_SIZE)].to_vec();

    let table = adapter.status_table();
    let idle_failed = |source: TransportError| Error::WriteFailed { address, source };
    let mut session = Session::open(adapter, device, params.bit_rate, log)?;
    if params.wait_for_idle {
        session.wait_idle().map_err(idle_failed)?;
    }
    let used = data.len() % unit;
    if used != 0 {
        let at = address.advance((data.len() / unit) as u16);
        let tail = read_unit_tail(&mut session, at, used, unit)?;
        trace!(log, "completing partial word"; "address" => %at, "kept" => tail.len());
        data.extend_from_slice(&tail);
    }
    for (i, chunk) in data.chunks(usize::from(max_chunk) * unit).enumerate() {
        let at = address.advance(i as u16 * max_chunk);
        write_chunk(&mut session, table, params, at, chunk, log)?;
        thread::sleep(params.settle_delay);
    }
    if params.wait_for_idle {
        session.wait_idle().map_err(idle_failed)?;
    }
    Ok(())
}

/// Write a single byte.
pub fn safe_write_byte(
    adapter: &mut dyn TransportAdapter,
    device: &DeviceId,
    params: &TransferParams,
    address: BusAddress,
    value: u8,
    log: &Logger,
) -> Result<(), Error> {
    safe_write(adapter, device, params, address, &[value], log)
}

// Read the unit at `at` and return its bytes past the first `used`.
fn read_unit_tail(
    session: &mut Session<'_>,
    at: BusAddress,
    used: usize,
    unit: usize,
) -> Result<Vec<u8>, Error> {
    let word = session
        .raw_read(at, 1)
        .map_err(|source| Error::ReadFailed { address: at, source })?;
    match word.get(used..unit) {
        Some(tail) if word.len() == unit => Ok(tail.to_vec()),
        _ => Err(Error::ReadFailed {
            address: at,
            source: TransportError::ShortTransfer {
                expected: unit,
                actual: word.len(),
            },
        }),
    }
}

// Issue one write transaction, re-sending it while the bridge reports a
// transient failure and retries remain.
fn write_chunk(
    session: &mut Session<'_>,
    table: &StatusTable,
    params: &TransferParams,
    at: BusAddress,
    chunk: &[u8],
    log: &Logger,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        trace!(log, "write"; "address" => %at, "len" => chunk.len(), "attempt" => attempt);
        match session.raw_write(at, chunk) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < params.write_retries && table.status_of(&e).is_transient() => {
                attempt += 1;
                debug!(
                    log,
                    "re-sending write";
                    "device" => %session.device(),
                    "address" => %at,
                    "reason" => %e,
                    "attempt" => attempt
                );
                thread::sleep(params.settle_delay);
            }
            Err(source) => {
                error!(log, "write aborted"; "address" => %at, "reason" => %source);
                return Err(Error::WriteFailed {
                    address: at,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::safe_read;
    use super::safe_write;
    use super::safe_write_byte;
    use crate::adapter::BusAddress;
    use crate::adapter::TransferLimits;
    use crate::config::TransferParams;
    use crate::sim::Fault;
    use crate::sim::Faults;
    use crate::sim::SimulatedBridge;
    use crate::sim::Transaction;
    use crate::Error;
    use optic_messages::DeviceId;
    use optic_messages::DeviceStatus;
    use optic_messages::Family;
    use slog::Logger;
    use std::time::Duration;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn params(read_chunk: u16, write_chunk: u16) -> TransferParams {
        TransferParams {
            read_chunk,
            write_chunk,
            settle_delay: Duration::ZERO,
            bit_rate: 100_000,
            write_retries: 3,
            wait_for_idle: false,
        }
    }

    fn device() -> DeviceId {
        DeviceId::new("SIM", 0)
    }

    const fn direct(table: u8, offset: u8) -> BusAddress {
        BusAddress::Direct { table, offset }
    }

    fn page() -> Vec<u8> {
        (0..=255).collect()
    }

    #[test]
    fn test_read_even_split() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.poke(0, direct(0xA0, 0), &page());

        let data = safe_read(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA0, 0),
            256,
            &log(),
        )
        .unwrap();
        assert_eq!(data, page());
        assert_eq!(
            handle.reads(),
            vec![(direct(0xA0, 0x00), 128), (direct(0xA0, 0x80), 128)]
        );
        assert_eq!(handle.opens(), 1);
        assert_eq!(handle.closes(), 1);
    }

    #[test]
    fn test_read_smaller_than_chunk() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.poke(0, direct(0xA2, 0), &page());

        let data = safe_read(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA2, 10),
            20,
            &log(),
        )
        .unwrap();
        assert_eq!(data, (10..30).collect::<Vec<u8>>());
        assert_eq!(handle.reads(), vec![(direct(0xA2, 10), 20)]);
    }

    #[test]
    fn test_read_drops_partial_tail() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.poke(0, direct(0xA0, 0), &page());

        let data = safe_read(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA0, 0),
            200,
            &log(),
        )
        .unwrap();
        assert_eq!(data.len(), 200);
        assert_eq!(&data[..128], &page()[..128]);
        assert!(data[128..].iter().all(|b| *b == 0));
        assert_eq!(handle.reads(), vec![(direct(0xA0, 0), 128)]);
    }

    #[test]
    fn test_read_zero_size_is_empty() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        let data = safe_read(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA0, 0),
            0,
            &log(),
        )
        .unwrap();
        assert!(data.is_empty());
        assert!(handle.transactions().is_empty());
    }

    #[test]
    fn test_read_zero_chunk_rejected() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        let err = safe_read(
            &mut bridge,
            &device(),
            &params(0, 8),
            direct(0xA0, 0),
            16,
            &log(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidChunkSize));
        assert!(handle.transactions().is_empty());
    }

    #[test]
    fn test_read_chunk_clamped_to_ceiling() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress)
            .with_limits(TransferLimits::new(1024, 8));
        let handle = bridge.handle();
        safe_read(
            &mut bridge,
            &device(),
            &params(1024, 8),
            direct(0xA0, 0),
            256,
            &log(),
        )
        .unwrap();
        assert_eq!(handle.reads(), vec![(direct(0xA0, 0), 256)]);
    }

    #[test]
    fn test_read_failure_still_closes() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.set_faults(Faults {
            read: Some(Fault::new(1, DeviceStatus::ReadTimeout)),
            ..Default::default()
        });

        let err = safe_read(
            &mut bridge,
            &device(),
            &params(64, 8),
            direct(0xA0, 0),
            256,
            &log(),
        )
        .unwrap_err();
        match err {
            Error::ReadFailed { address, .. } => assert_eq!(address, direct(0xA0, 64)),
            other => panic!("expected a read failure, found {other:?}"),
        }
        assert_eq!(handle.reads().len(), 2);
        assert_eq!(handle.closes(), 1);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_open_failure_issues_no_transactions() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.set_faults(Faults {
            open: Some(DeviceStatus::DeviceNotFound),
            ..Default::default()
        });

        let err = safe_write(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA0, 0),
            &[1, 2, 3],
            &log(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
        assert!(handle.writes().is_empty());
        assert_eq!(handle.closes(), 0);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        for offset in [0u16, 3, 100, 128, 250] {
            for size in [1u16, 2, 7, 8, 9, 31, 64, 100, 128, 156, 256] {
                if offset + size > 256 {
                    continue;
                }
                let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress)
                    .with_limits(TransferLimits::new(256, 8));
                let data: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_mul(7) ^ 0x5A).collect();
                let address = direct(0x50, offset as u8);
                safe_write(
                    &mut bridge,
                    &device(),
                    &params(256, 8),
                    address,
                    &data,
                    &log(),
                )
                .unwrap();
                let read = safe_read(
                    &mut bridge,
                    &device(),
                    &params(256, 8),
                    address,
                    size,
                    &log(),
                )
                .unwrap();
                assert_eq!(read, data, "offset {offset} size {size}");
            }
        }

        // Register sizes count words. An odd byte length leaves the rest of
        // the last word as it was.
        for offset in [0u16, 3, 64, 120] {
            for len in [1usize, 2, 3, 7, 8, 9, 63, 128, 255, 256] {
                let words = len.div_ceil(2) as u16;
                if offset + words > 128 {
                    continue;
                }
                let mut bridge = SimulatedBridge::new("SIM", Family::RegisterEmbedded)
                    .with_limits(TransferLimits::new(128, 4));
                let handle = bridge.handle();
                let address = BusAddress::Register(0x5000 + offset);
                handle.poke(0, address, &vec![0xC3; usize::from(words) * 2]);
                let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7) ^ 0x5A).collect();
                safe_write(
                    &mut bridge,
                    &device(),
                    &params(128, 4),
                    address,
                    &data,
                    &log(),
                )
                .unwrap();
                let read = safe_read(
                    &mut bridge,
                    &device(),
                    &params(128, 4),
                    address,
                    words,
                    &log(),
                )
                .unwrap();
                assert_eq!(read[..len], data[..], "offset {offset} len {len}");
                if len % 2 == 1 {
                    assert_eq!(read[len], 0xC3, "offset {offset} len {len}");
                }
            }
        }
    }

    #[test]
    fn test_write_never_exceeds_max_chunk() {
        for len in 0..=1000usize {
            let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
            let handle = bridge.handle();
            let data = vec![0xAB; len];
            let result = safe_write(
                &mut bridge,
                &device(),
                &params(128, 8),
                direct(0xA2, 0),
                &data,
                &log(),
            );
            if len == 0 {
                assert!(matches!(result, Err(Error::EmptyWrite)));
                assert!(handle.transactions().is_empty());
                continue;
            }
            result.unwrap();
            let writes = handle.writes();
            assert!(writes.iter().all(|(_, chunk)| chunk.len() <= 8));
            let written: usize = writes.iter().map(|(_, chunk)| chunk.len()).sum();
            assert_eq!(written, len.min(256));
            assert_eq!(writes.len(), len.min(256).div_ceil(8));
        }
    }

    #[test]
    fn test_write_stops_at_first_failure() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.set_faults(Faults {
            write: Some(Fault::new(2, DeviceStatus::ComponentWriteError)),
            ..Default::default()
        });

        let data: Vec<u8> = (0..40).collect();
        let err = safe_write(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA2, 0),
            &data,
            &log(),
        )
        .unwrap_err();
        match err {
            Error::WriteFailed { address, .. } => assert_eq!(address, direct(0xA2, 16)),
            other => panic!("expected a write failure, found {other:?}"),
        }
        let offsets: Vec<_> = handle.writes().into_iter().map(|(a, _)| a).collect();
        assert_eq!(
            offsets,
            vec![direct(0xA2, 0), direct(0xA2, 8), direct(0xA2, 16)]
        );
        assert_eq!(handle.peek(0, direct(0xA2, 0), 16), &data[..16]);
        assert_eq!(handle.peek(0, direct(0xA2, 16), 8), vec![0; 8]);
        assert_eq!(handle.closes(), 1);
    }

    #[test]
    fn test_write_offset_wraps_within_table() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        safe_write(
            &mut bridge,
            &device(),
            &params(128, 4),
            direct(0xA0, 0xFC),
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &log(),
        )
        .unwrap();
        assert_eq!(
            handle.writes(),
            vec![
                (direct(0xA0, 0xFC), vec![1, 2, 3, 4]),
                (direct(0xA0, 0x00), vec![5, 6, 7, 8]),
            ]
        );
    }

    #[test]
    fn test_write_resends_after_transient_failure() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.set_faults(Faults {
            transient_writes: 2,
            ..Default::default()
        });

        safe_write(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA2, 0),
            &[0x11; 16],
            &log(),
        )
        .unwrap();
        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes[..3].iter().all(|(a, _)| *a == direct(0xA2, 0)));
        assert_eq!(writes[3].0, direct(0xA2, 8));
        assert_eq!(handle.peek(0, direct(0xA2, 0), 16), vec![0x11; 16]);
    }

    #[test]
    fn test_write_resend_is_bounded() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress);
        let handle = bridge.handle();
        handle.set_faults(Faults {
            transient_writes: 100,
            ..Default::default()
        });

        let err = safe_write(
            &mut bridge,
            &device(),
            &params(128, 8),
            direct(0xA2, 0),
            &[0x11; 16],
            &log(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
        assert_eq!(handle.writes().len(), 4);
    }

    #[test]
    fn test_write_waits_for_idle_bus() {
        let mut bridge = SimulatedBridge::new("SIM", Family::DirectAddress)
            .with_limits(TransferLimits::new(128, 8).wait_for_idle(true));
        let handle = bridge.handle();
        let mut p = params(128, 8);
        p.wait_for_idle = true;
        safe_write_byte(&mut bridge, &device(), &p, direct(0xA2, 0x7B), 0x42, &log()).unwrap();
        assert_eq!(
            handle.transactions(),
            vec![
                Transaction::Open {
                    index: 0,
                    bit_rate: 100_000
                },
                Transaction::WaitIdle,
                Transaction::Write {
                    address: direct(0xA2, 0x7B),
                    data: vec![0x42]
                },
                Transaction::WaitIdle,
                Transaction::Close,
            ]
        );
    }

    #[test]
    fn test_register_write_keeps_neighbouring_byte() {
        let mut bridge = SimulatedBridge::new("SIM", Family::RegisterEmbedded);
        let handle = bridge.handle();
        handle.poke(0, BusAddress::Register(0xA004), &[0xEE, 0xFF]);
        safe_write(
            &mut bridge,
            &device(),
            &params(64, 4),
            BusAddress::Register(0xA000),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9],
            &log(),
        )
        .unwrap();
        assert_eq!(
            handle.writes(),
            vec![
                (BusAddress::Register(0xA000), vec![1, 2, 3, 4, 5, 6, 7, 8]),
                (BusAddress::Register(0xA004), vec![9, 0xFF]),
            ]
        );
        assert_eq!(handle.reads(), vec![(BusAddress::Register(0xA004), 1)]);
        assert_eq!(handle.peek(0, BusAddress::Register(0xA004), 2), vec![9, 0xFF]);
    }

    #[test]
    fn test_register_write_byte_keeps_neighbouring_byte() {
        let mut bridge = SimulatedBridge::new("SIM", Family::RegisterEmbedded);
        let handle = bridge.handle();
        handle.poke(0, BusAddress::Register(0xA03F), &[0x00, 0x5A]);
        safe_write_byte(
            &mut bridge,
            &device(),
            &params(64, 4),
            BusAddress::Register(0xA03F),
            0x03,
            &log(),
        )
        .unwrap();
        assert_eq!(
            handle.writes(),
            vec![(BusAddress::Register(0xA03F), vec![0x03, 0x5A])]
        );
    }
}
