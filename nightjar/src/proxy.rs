// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - TCP fan-out proxy.
//!
//! Tunnels the BLE serial link to TCP clients on port 4403, raw bytes in
//! both directions with no framing.  The client limit is the size of the
//! accept-task pool: each task serves one client, so at most
//! `MAX_PROXY_CLIENTS` are connected and excess connections are refused
//! by the stack until a slot frees up.
//!
//! Each client task multiplexes three things: bytes from its socket
//! (chunked to the link MTU and queued for the BLE task, with a short
//! pause between chunks of one payload), notifications fanned out from
//! the BLE task (one TCP send per notification, delivered whole), and
//! the bridge-state watch, which drops every client the moment the BLE
//! link goes away.

use alloc::vec::Vec;
use embassy_executor::Spawner;
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_futures::select::{Either3, select3};
use embassy_sync::pubsub::WaitResult;
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::const_assert;

use crate::ble::{BRIDGE_UP, MAX_PROXY_CLIENTS, NOTIFY_BUS, TX_TO_BLE, current_chunk_len};

/// Port the proxy listens on (the Meshtastic TCP convention).
pub const PROXY_PORT: u16 = 4403;

// Socket buffers - the link is slow, these need not be big
const PROXY_TCP_RX_BUF_SIZE: usize = 1024;
const PROXY_TCP_TX_BUF_SIZE: usize = 1024;

// Read buffer per select iteration
const RECV_BUF_SIZE: usize = 256;

// Pacing between chunks of one TCP payload
const INTER_CHUNK_PAUSE: Duration = Duration::from_millis(5);

const_assert!(MAX_PROXY_CLIENTS == 2);

/// Spawn the proxy task pool.
pub fn start(stack: Stack<'static>, spawner: &Spawner) {
    for id in 0..MAX_PROXY_CLIENTS {
        spawner.must_spawn(task(id, stack));
    }
}

#[embassy_executor::task(pool_size = MAX_PROXY_CLIENTS)]
async fn task(id: usize, stack: Stack<'static>) -> ! {
    info!("Exec:  Proxy task {id} started on port {PROXY_PORT}");

    let mut rx_buffer = [0; PROXY_TCP_RX_BUF_SIZE];
    let mut tx_buffer = [0; PROXY_TCP_TX_BUF_SIZE];

    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(None);

        if let Err(e) = socket.accept(PROXY_PORT).await {
            warn!("proxy: task {id} accept error: {e:?}");
            continue;
        }

        if let Some(endpoint) = socket.remote_endpoint() {
            info!("proxy: task {id} client connected from {}", endpoint.addr);
        }

        serve_client(id, &mut socket).await;

        socket.close();
        info!("proxy: task {id} client disconnected");
    }
}

// Serve one client until it drops, errors, or the bridge goes down.
async fn serve_client(id: usize, socket: &mut TcpSocket<'_>) {
    let mut subscriber = match NOTIFY_BUS.subscriber() {
        Ok(subscriber) => subscriber,
        Err(_) => {
            // Can only happen if the pool size and subscriber count drift
            error!("proxy: task {id} has no subscriber slot");
            return;
        }
    };
    let mut bridge = BRIDGE_UP.receiver().expect("bridge watch slot");

    let mut recv_buf = [0u8; RECV_BUF_SIZE];

    loop {
        match select3(
            socket.read(&mut recv_buf),
            subscriber.next_message(),
            bridge.changed_and(|up| !up),
        )
        .await
        {
            // Client → BLE, chunked to the link MTU
            Either3::First(Ok(0)) => {
                debug!("proxy: task {id} client closed");
                return;
            }
            Either3::First(Ok(n)) => {
                trace!("proxy: task {id} TCP→BLE {n} bytes");
                forward_to_ble(&recv_buf[..n]).await;
            }
            Either3::First(Err(e)) => {
                warn!("proxy: task {id} recv error: {e:?}");
                return;
            }

            // BLE → client, one send per notification
            Either3::Second(WaitResult::Message(data)) => {
                if let Err(e) = socket.write_all(&data).await {
                    warn!("proxy: task {id} send error: {e:?}");
                    return;
                }
                if let Err(e) = socket.flush().await {
                    warn!("proxy: task {id} flush error: {e:?}");
                    return;
                }
            }
            Either3::Second(WaitResult::Lagged(missed)) => {
                // Slow client: notifications were dropped rather than
                // stalling the other subscribers
                warn!("proxy: task {id} lagged, {missed} notifications lost");
            }

            Either3::Third(_) => {
                info!("proxy: task {id} bridge down, dropping client");
                return;
            }
        }
    }
}

// Chunk one TCP payload to the current link MTU and queue the chunks for
// the BLE task.  The queue send fails into a dropped payload only if the
// BLE task is gone entirely; a merely-absent connection drains and
// discards.
async fn forward_to_ble(payload: &[u8]) {
    let chunk_len = current_chunk_len().await;
    let mut chunks = payload.chunks(chunk_len).peekable();
    while let Some(chunk) = chunks.next() {
        TX_TO_BLE.send(Vec::from(chunk)).await;
        if chunks.peek().is_some() {
            Timer::after(INTER_CHUNK_PAUSE).await;
        }
    }
}
