// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - HTTP server and routing.
//!
//! A small pool of identical tasks accepts on port 80.  Every handler is
//! a thin adapter: parse the request, hand the operation to the owning
//! task (target or BLE), shape the answer as JSON.  The one exception is
//! `/upload`, whose body streams through the target task chunk by chunk
//! instead of being buffered.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use embassy_executor::Spawner;
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_sync::signal::Signal;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::const_assert;
use static_cell::make_static;

use crate::http::{
    HTTPD_HEADER_BUF_SIZE, HTTPD_MAX_HEADERS, HTTPD_PORT, HTTPD_TASK_TCP_RX_BUF_SIZE,
    HTTPD_TASK_TCP_TX_BUF_SIZE, Method, Response, StatusCode, WEB_TASK_POOL_SIZE,
};
use crate::power;
use crate::target::{Command, REQUEST_CHANNEL_SIZE, Request, Response as TargetResponse};
use crate::upload::{PROGRESS, UploadKind};

#[cfg(feature = "ble")]
use crate::ble;
#[cfg(feature = "ble")]
use nightjar_ble::PeerAddr;

const_assert!(REQUEST_CHANNEL_SIZE >= WEB_TASK_POOL_SIZE);

// Streaming chunk size for upload bodies
const UPLOAD_CHUNK_SIZE: usize = 1024;

// Largest non-upload body accepted
const BODY_LIMIT: usize = 1024;

type TargetSender = Sender<'static, CriticalSectionRawMutex, Request, REQUEST_CHANNEL_SIZE>;

/// Per-task server state.
struct Server {
    target_sender: TargetSender,
    response_signal: &'static Signal<CriticalSectionRawMutex, TargetResponse>,
    header_buf: &'static mut [u8; HTTPD_HEADER_BUF_SIZE],
}

impl Server {
    async fn send_command(&self, command: Command) -> TargetResponse {
        self.target_sender
            .send(Request {
                command,
                response_signal: self.response_signal,
            })
            .await;
        self.response_signal.wait().await
    }

    /// Read and answer one request.  Returns Err when the connection is
    /// done.
    async fn handle_request(&mut self, socket: &mut TcpSocket<'_>) -> Result<(), ()> {
        // Read until the end of the header block
        let mut total_read = 0;
        let header_end = loop {
            if total_read >= HTTPD_HEADER_BUF_SIZE {
                info!("httpd: header overflow");
                let _ = Response::status(StatusCode::TooLarge).write_to(socket).await;
                return Err(());
            }
            let n = socket
                .read(&mut self.header_buf[total_read..])
                .await
                .map_err(|_| ())?;
            if n == 0 {
                return Err(());
            }
            total_read += n;

            if let Some(pos) = self.header_buf[..total_read]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            {
                break pos + 4;
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; HTTPD_MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        if req.parse(&self.header_buf[..header_end]).is_err() {
            let _ = Response::status(StatusCode::BadRequest).write_to(socket).await;
            return Err(());
        }

        let (Some(method_str), Some(path)) = (req.method, req.path) else {
            let _ = Response::status(StatusCode::BadRequest).write_to(socket).await;
            return Err(());
        };
        let Some(method) = Method::from_str(method_str) else {
            let _ = Response::status(StatusCode::MethodNotAllowed)
                .write_to(socket)
                .await;
            return Err(());
        };

        let content_length = headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| core::str::from_utf8(h.value).ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };

        trace!("httpd: {method} {path}");

        // Upload bodies stream; everything else is read whole first
        let response = if method == Method::Post && path == "/upload" {
            let preread_start = header_end;
            let preread_len = total_read - header_end;
            let preread: Vec<u8> =
                self.header_buf[preread_start..preread_start + preread_len].to_vec();
            self.handle_upload(socket, query, content_length, preread)
                .await
        } else {
            if content_length > BODY_LIMIT {
                let _ = Response::status(StatusCode::TooLarge).write_to(socket).await;
                return Err(());
            }
            let body = self
                .read_body(socket, header_end, total_read, content_length)
                .await?;
            self.route(method, path, query, &body).await
        };

        response.write_to(socket).await.map_err(|_| ())
    }

    // Collect a small body, reusing whatever arrived with the headers.
    async fn read_body(
        &mut self,
        socket: &mut TcpSocket<'_>,
        header_end: usize,
        total_read: usize,
        content_length: usize,
    ) -> Result<Vec<u8>, ()> {
        let mut body = Vec::with_capacity(content_length);
        let preread = (total_read - header_end).min(content_length);
        body.extend_from_slice(&self.header_buf[header_end..header_end + preread]);

        let mut chunk = [0u8; 256];
        while body.len() < content_length {
            let n = socket.read(&mut chunk).await.map_err(|_| ())?;
            if n == 0 {
                return Err(());
            }
            let take = n.min(content_length - body.len());
            body.extend_from_slice(&chunk[..take]);
        }
        Ok(body)
    }

    async fn route(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> Response {
        match (method, path) {
            (Method::Get, "/") => Response::html(index_page()),

            (Method::Get, "/check_swd") => {
                Response::json(&self.send_command(Command::CheckSwd).await)
            }
            (Method::Get, "/release_swd") => {
                let response = self.send_command(Command::ReleaseSwd).await;
                if response.success {
                    Response::text("released")
                } else {
                    Response::json(&response)
                }
            }
            (Method::Get, "/mass_erase") => {
                Response::json(&self.send_command(Command::MassErase).await)
            }
            (Method::Get, "/disable_protection") => {
                Response::json(&self.send_command(Command::DisableProtection).await)
            }
            (Method::Get, "/erase_all") => {
                Response::json(&self.send_command(Command::EraseAll).await)
            }
            (Method::Get, "/progress") => Response::json(&*PROGRESS.lock().await),

            (Method::Post, "/power_on") => {
                power_response(power::Request::On).await
            }
            (Method::Post, "/power_off") => {
                power_response(power::Request::Off).await
            }
            (Method::Post, "/power_reboot") => {
                power_response(power::Request::Reboot).await
            }

            #[cfg(feature = "ble")]
            (method, path) if path.starts_with("/ble/") => {
                self.route_ble(method, path, query, body).await
            }

            _ => Response::status(StatusCode::NotFound),
        }
    }

    #[cfg(feature = "ble")]
    async fn route_ble(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: &[u8],
    ) -> Response {
        match (method, path) {
            (Method::Post, "/ble/connect") => {
                // Body: addr=XX:XX:XX:XX:XX:XX
                let Some(addr) = core::str::from_utf8(body)
                    .ok()
                    .and_then(|body| query_value(body, "addr"))
                    .and_then(|addr| PeerAddr::parse(&addr))
                else {
                    return Response::status(StatusCode::BadRequest);
                };
                ble::send_command(ble::BleCommand::Connect(addr)).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": format!("connecting to {addr}"),
                }))
            }
            (Method::Post, "/ble/disconnect") => {
                ble::send_command(ble::BleCommand::Disconnect).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": "disconnecting",
                }))
            }
            (Method::Get, "/ble/conn_status") => {
                let status = ble::STATUS.lock().await;
                Response::json(&serde_json::json!({
                    "connected": status.state == nightjar_ble::central::State::Ready,
                    "state": status.state.as_str(),
                    "peer_addr": status.peer.map(|peer| format!("{peer}")),
                    "mtu": status.mtu,
                }))
            }
            (Method::Post, "/ble/passkey") => {
                // Query: pin=NNNNNN
                let Some(pin) = query
                    .and_then(|query| query_value(query, "pin"))
                    .and_then(|pin| pin.parse::<u32>().ok())
                    .filter(|&pin| pin < 1_000_000)
                else {
                    return Response::status(StatusCode::BadRequest);
                };
                ble::send_command(ble::BleCommand::Passkey(pin)).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": "passkey injected",
                }))
            }
            (Method::Post, "/ble/scan") => {
                ble::send_command(ble::BleCommand::StartScan).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": "scanning",
                }))
            }
            (Method::Post, "/ble/stop_scan") => {
                ble::send_command(ble::BleCommand::StopScan).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": "scan stopped",
                }))
            }
            (Method::Post, "/ble/devices") => {
                let devices = ble::SCAN_RESULTS.lock(|cell| cell.borrow().clone());
                Response::json(&serde_json::json!({
                    "success": true,
                    "devices": devices,
                }))
            }
            (Method::Post, "/ble/clear") => {
                ble::send_command(ble::BleCommand::ClearDevices).await;
                Response::json(&serde_json::json!({
                    "success": true,
                    "message": "device list cleared",
                }))
            }
            _ => Response::status(StatusCode::NotFound),
        }
    }

    // POST /upload?type=<kind>: open the session, pump body chunks through
    // the target task, close it.
    async fn handle_upload(
        &self,
        socket: &mut TcpSocket<'_>,
        query: Option<&str>,
        content_length: usize,
        preread: Vec<u8>,
    ) -> Response {
        let kind = match query.and_then(|query| query_value(query, "type")) {
            Some(kind_str) => match UploadKind::from_query(&kind_str) {
                Some(kind) => kind,
                None => return Response::status(StatusCode::BadRequest),
            },
            None => UploadKind::Full,
        };
        if content_length == 0 {
            return Response::status(StatusCode::BadRequest);
        }

        let response = self
            .send_command(Command::UploadBegin {
                kind,
                total: content_length,
            })
            .await;
        if !response.success {
            return Response::json(&response);
        }

        let mut remaining = content_length;

        // Body bytes that arrived with the headers
        let mut preread = preread;
        preread.truncate(remaining);
        remaining -= preread.len();
        if !preread.is_empty() {
            let response = self.send_command(Command::UploadChunk { data: preread }).await;
            if !response.success {
                self.send_command(Command::UploadAbort).await;
                return Response::json(&response);
            }
        }

        let mut chunk = [0u8; UPLOAD_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(UPLOAD_CHUNK_SIZE);
            let n = match socket.read(&mut chunk[..want]).await {
                Ok(0) | Err(_) => {
                    warn!("httpd: upload connection dropped with {remaining} bytes left");
                    self.send_command(Command::UploadAbort).await;
                    return Response::api_error("upload connection dropped", "recv");
                }
                Ok(n) => n,
            };
            remaining -= n;

            let response = self
                .send_command(Command::UploadChunk {
                    data: chunk[..n].to_vec(),
                })
                .await;
            if !response.success {
                // The target task has already torn the session down
                return Response::json(&response);
            }
        }

        Response::json(&self.send_command(Command::UploadFinish).await)
    }
}

// Executes a power-rail request under the shared handle.
async fn power_response(request: power::Request) -> Response {
    match power::execute(request).await {
        Ok(message) => Response::json(&serde_json::json!({
            "success": true,
            "message": message,
        })),
        Err(e) => Response::api_error(&format!("{e}"), e.code()),
    }
}

// Pull one key's value out of an application/x-www-form-urlencoded body
// or query string.  Values here are MAC addresses and digits - no percent
// decoding needed.
fn query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(String::from(v.trim()));
            }
        }
    }
    None
}

fn index_page() -> String {
    String::from(
        "<!DOCTYPE html><html><head><title>nightjar</title></head><body>\
         <h1>nightjar</h1>\
         <p>WiFi nRF52 programmer and BLE serial bridge.</p>\
         <p>Control surface: /check_swd /release_swd /mass_erase \
         /disable_protection /erase_all /upload /progress /ble/* /power_*</p>\
         </body></html>",
    )
}

/// Starts the HTTP server task pool.
pub(crate) async fn start(stack: Stack<'static>, target_sender: TargetSender, spawner: &Spawner) {
    // One statics set per task - make_static! cannot run in a loop
    const_assert!(WEB_TASK_POOL_SIZE == 2);
    let response_signal = make_static!(Signal::new());
    let header_buf = make_static!([0; HTTPD_HEADER_BUF_SIZE]);
    let server = make_static!(Server {
        target_sender,
        response_signal,
        header_buf,
    });
    spawner.must_spawn(task(1, stack, server));

    let response_signal = make_static!(Signal::new());
    let header_buf = make_static!([0; HTTPD_HEADER_BUF_SIZE]);
    let server = make_static!(Server {
        target_sender,
        response_signal,
        header_buf,
    });
    spawner.must_spawn(task(0, stack, server));
}

#[embassy_executor::task(pool_size = WEB_TASK_POOL_SIZE)]
async fn task(id: usize, stack: Stack<'static>, server: &'static mut Server) -> ! {
    info!("Exec:  HTTPD task {id} started on port {HTTPD_PORT}");

    let mut rx_buffer = [0; HTTPD_TASK_TCP_RX_BUF_SIZE];
    let mut tx_buffer = [0; HTTPD_TASK_TCP_TX_BUF_SIZE];

    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

        if let Err(e) = socket.accept(HTTPD_PORT).await {
            warn!("httpd: task {id} accept error: {e:?}");
            continue;
        }

        if let Some(endpoint) = socket.remote_endpoint() {
            debug!("httpd: task {id} connection from {}", endpoint.addr);
        }

        // Serve requests until the client goes away or errors
        while server.handle_request(&mut socket).await.is_ok() {}

        socket.close();
        debug!("httpd: task {id} connection closed");
    }
}
