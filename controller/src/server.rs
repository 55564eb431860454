// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The HTTP interface to a [`ProtocolRouter`].
//!
//! Requests are handled one at a time. The router sits behind a mutex, and
//! each request runs to completion on the blocking pool while holding it, so
//! that bus transactions from different requests never interleave.

use crate::config::TransferConfig;
use crate::Error;
use crate::ProtocolRouter;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use optic_messages::api::DeviceList;
use optic_messages::api::DeviceSelector;
use optic_messages::api::PageData;
use optic_messages::api::ReadFields;
use optic_messages::api::ReadReport;
use optic_messages::api::ReadRequest;
use optic_messages::api::StatusReport;
use optic_messages::api::WriteFields;
use optic_messages::api::WriteRequest;
use optic_messages::DeviceId;
use optic_messages::DeviceStatus;
use optic_messages::MemoryRegion;
use optic_messages::PageId;
use serde::Deserialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// List every device on the active family's adapters.
pub fn handle_devices(router: &mut ProtocolRouter) -> DeviceList {
    DeviceList::new(router.search().iter().map(ToString::to_string).collect())
}

/// Write part of a page and read it back to verify it.
pub fn handle_write(router: &mut ProtocolRouter, fields: &WriteFields) -> StatusReport {
    let start = Instant::now();
    let (success, message, extra_data) = match write_part(router, fields) {
        Ok(()) => (true, DeviceStatus::Success.to_string(), String::new()),
        Err(WriteFailure::Rejected(e)) => (false, e.to_string(), String::new()),
        Err(WriteFailure::Device) => (false, router.status().to_string(), String::new()),
        Err(WriteFailure::Mismatch {
            table,
            offset,
            found,
        }) => (
            false,
            format!("Verification failed at address 0x{table:02X}, offset 0x{offset:02X}"),
            hex::encode_upper(found),
        ),
    };
    StatusReport {
        success,
        message,
        extra_data,
        milliseconds: elapsed_ms(start),
    }
}

/// Read whole pages, stopping at the first failure.
pub fn handle_read(router: &mut ProtocolRouter, fields: &ReadFields) -> ReadReport {
    let start = Instant::now();
    let mut pages = Vec::new();
    let result = read_pages(router, fields, &mut pages);
    let device_status = match &result {
        Err(e) if is_rejection(e) => e.to_string(),
        _ => router.status().to_string(),
    };
    ReadReport {
        pages,
        success: result.is_ok(),
        device_status,
        milliseconds: elapsed_ms(start),
    }
}

// Whether `e` refused the request before any device status was recorded.
fn is_rejection(e: &Error) -> bool {
    matches!(
        e,
        Error::Message(_)
            | Error::UnknownAdapter { .. }
            | Error::NoDeviceSelected
            | Error::EmptyWrite
    )
}

/// Read one whole page of the `index`th device of the first adapter, as
/// uppercase hex.
///
/// An upper page is selected first when `page` names one.
pub fn handle_page(router: &mut ProtocolRouter, page: &str, index: u32) -> Result<String, Error> {
    let page: PageId = page.parse()?;
    select(router, &DeviceSelector { name: None, index })?;
    let data = router.read_page(page, page.table.is_some())?;
    if data.is_empty() {
        return Err(Error::NoDeviceSelected);
    }
    Ok(hex::encode_upper(data))
}

enum WriteFailure {
    // The request was malformed, named a device that does not exist, or had
    // nothing to write.
    Rejected(Error),
    // The device reported a failure; the router's status says which.
    Device,
    // The data read back differs from what was written.
    Mismatch { table: u8, offset: u8, found: Vec<u8> },
}

impl From<Error> for WriteFailure {
    fn from(e: Error) -> Self {
        if is_rejection(&e) {
            WriteFailure::Rejected(e)
        } else {
            WriteFailure::Device
        }
    }
}

fn write_part(router: &mut ProtocolRouter, fields: &WriteFields) -> Result<(), WriteFailure> {
    let request = WriteRequest::try_from(fields).map_err(Error::from)?;
    let len = u16::try_from(request.data.len()).unwrap_or(u16::MAX);
    MemoryRegion::new(request.table, request.offset, len).map_err(Error::from)?;
    select(router, &request.device)?;

    let transfer = TransferConfig {
        settle_delay: request
            .delay
            .or(router.config().transfer.settle_delay),
        ..router.config().transfer.clone()
    };
    router.with_transfer(transfer, |router| {
        if let Some(password) = &request.password {
            if !router.write(password.table, password.offset, &password.key)? {
                return Err(WriteFailure::Rejected(Error::EmptyWrite));
            }
        }
        if !router.write(request.table, request.offset, &request.data)? {
            return Err(WriteFailure::Rejected(Error::EmptyWrite));
        }

        let found = router.read_all(request.table, len, request.offset)?;
        match first_mismatch(&request.data, &found) {
            None => Ok(()),
            Some(i) => Err(WriteFailure::Mismatch {
                table: request.table,
                offset: request.offset.wrapping_add(i as u8),
                found,
            }),
        }
    })
}

fn first_mismatch(expected: &[u8], found: &[u8]) -> Option<usize> {
    expected
        .iter()
        .enumerate()
        .find(|(i, byte)| found.get(*i) != Some(*byte))
        .map(|(i, _)| i)
}

fn read_pages(
    router: &mut ProtocolRouter,
    fields: &ReadFields,
    pages: &mut Vec<PageData>,
) -> Result<(), Error> {
    let request = ReadRequest::try_from(fields)?;
    select(router, &request.device)?;

    let current = router.config().transfer.clone();
    let unit = router.family().unit_bytes() as u16;
    let transfer = TransferConfig {
        read_chunk: request
            .chunk_size
            .filter(|bytes| *bytes > 0)
            .map(|bytes| (bytes / unit).max(1))
            .or(current.read_chunk),
        settle_delay: request.delay.or(current.settle_delay),
        ..current
    };
    let paged = request.part.is_paged();
    router.with_transfer(transfer, |router| {
        for page in &request.pages {
            let data = router.read_page(*page, paged)?;
            pages.push(PageData {
                page_name: page.to_string(),
                page_hex: hex::encode_upper(data),
            });
        }
        Ok(())
    })
}

// Select the device a request names. Without an adapter name, the first
// adapter of the active family is used.
fn select(router: &mut ProtocolRouter, selector: &DeviceSelector) -> Result<(), Error> {
    let name = match &selector.name {
        Some(name) => name.clone(),
        None => router
            .adapter_names()
            .into_iter()
            .next()
            .ok_or(Error::NoDeviceSelected)?,
    };
    router.select_device(DeviceId::new(name, selector.index))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct ServerState {
    router: Mutex<ProtocolRouter>,
    log: Logger,
    shutdown: watch::Sender<bool>,
}

/// A running HTTP interface.
pub struct ServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Wait until the server has been asked to stop.
    pub async fn stopped(&self) {
        let mut stop = self.state.shutdown.subscribe();
        let _ = stop.wait_for(|stop| *stop).await;
    }

    /// Ask the server to stop, and wait for it to do so.
    pub async fn shutdown(self) {
        self.state.shutdown.send_replace(true);
        self.wait().await;
    }

    /// Wait for the server to stop, either through [`ServerHandle::shutdown`]
    /// or a request to `/shutdown`.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(self.state.log, "server task failed"; "reason" => %e);
        }
    }
}

/// Serve `router` over HTTP on `listen`.
pub async fn spawn(
    router: ProtocolRouter,
    listen: SocketAddr,
    log: &Logger,
) -> Result<ServerHandle, Error> {
    let log = log.new(o!("component" => "http"));
    let listener = TcpListener::bind(listen).await?;
    let address = listener.local_addr()?;
    info!(log, "listening"; "address" => %address);

    let (shutdown, _) = watch::channel(false);
    let state = Arc::new(ServerState {
        router: Mutex::new(router),
        log: log.clone(),
        shutdown,
    });
    let app = Router::new()
        .route("/GetDevices", get(get_devices))
        .route("/WritePart", post(write_part_handler))
        .route("/ReadPart", post(read_part_handler))
        .route("/shutdown", post(shutdown_handler))
        .route("/:page", get(page_handler))
        .with_state(Arc::clone(&state));

    let mut stop = state.shutdown.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = stop.wait_for(|stop| *stop).await;
    });
    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!(log, "server exited with error"; "reason" => %e);
        }
    });

    Ok(ServerHandle {
        address,
        task,
        state,
    })
}

// Every response may be read by a page served from anywhere.
fn with_cors(response: impl IntoResponse) -> Response {
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], response).into_response()
}

// Run `f` against the router on the blocking pool.
async fn run<T, F>(state: Arc<ServerState>, f: F) -> Response
where
    T: IntoResponse + Send + 'static,
    F: FnOnce(&mut ProtocolRouter) -> T + Send + 'static,
{
    let log = state.log.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut router = state.router.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut router)
    })
    .await;
    match result {
        Ok(body) => with_cors(body),
        Err(e) => {
            error!(log, "request handler failed"; "reason" => %e);
            with_cors(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_devices(State(state): State<Arc<ServerState>>) -> Response {
    debug!(state.log, "listing devices");
    run(state, |router| Json(handle_devices(router))).await
}

async fn write_part_handler(
    State(state): State<Arc<ServerState>>,
    Json(fields): Json<WriteFields>,
) -> Response {
    debug!(state.log, "write request"; "address" => %fields.address_fields.rw_address);
    run(state, move |router| Json(handle_write(router, &fields))).await
}

async fn read_part_handler(
    State(state): State<Arc<ServerState>>,
    Json(fields): Json<ReadFields>,
) -> Response {
    debug!(state.log, "read request"; "n_pages" => fields.pages.len());
    run(state, move |router| Json(handle_read(router, &fields))).await
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(rename = "devIndex", default)]
    dev_index: u32,
}

async fn page_handler(
    State(state): State<Arc<ServerState>>,
    Path(page): Path<String>,
    Query(query): Query<PageQuery>,
) -> Response {
    debug!(state.log, "page request"; "page" => %page, "index" => query.dev_index);
    run(state, move |router| match handle_page(router, &page, query.dev_index) {
        Ok(hex) => hex.into_response(),
        Err(e) if is_rejection(&e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, router.status().to_string()).into_response()
        }
    })
    .await
}

async fn shutdown_handler(State(state): State<Arc<ServerState>>) -> Response {
    info!(state.log, "shutdown requested");
    state.shutdown.send_replace(true);
    with_cors(StatusCode::OK)
}
