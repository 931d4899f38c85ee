// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - BLE bridge driver.
//!
//! Drives the central state machine in `nightjar-ble` against the host
//! stack.  The stack itself sits behind the [`host`] seam; this module
//! owns the command surface, the scan cache, the stabilisation holds the
//! peer needs between phases, and the two bridge capabilities the TCP
//! proxy uses (notification fan-out in, chunked writes out).

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use embassy_futures::select::{Either3, select3};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::pubsub::PubSubChannel;
use embassy_sync::watch::Watch;
use embassy_time::{Duration, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_ble::central::{Action, Central, Event, State};
use nightjar_ble::{PeerAddr, att_chunk_len};

pub(crate) mod host;
pub(crate) mod trouble;

use host::{BleHost, BleLink, LinkEvent};

/// TCP clients the proxy serves; also the notification fan-out width.
pub const MAX_PROXY_CLIENTS: usize = 2;

// Stabilisation holds between phases (the peer's stack needs them)
const POST_MTU_HOLD: Duration = Duration::from_millis(1000);
const PRE_DISCOVERY_SETTLE: Duration = Duration::from_millis(500);

// Guard between scan cancellation and a connect attempt
const POST_SCAN_CANCEL_GUARD: Duration = Duration::from_millis(100);

// Fixed scan window; a StopScan command cuts it short
const SCAN_DURATION: Duration = Duration::from_secs(10);

const COMMAND_CHANNEL_SIZE: usize = 4;
const NOTIFY_QUEUE_SIZE: usize = 8;
const TX_QUEUE_SIZE: usize = 8;
const MAX_SCAN_RESULTS: usize = 24;

/// Commands from the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleCommand {
    Connect(PeerAddr),
    Disconnect,
    Passkey(u32),
    StartScan,
    StopScan,
    ClearDevices,
}

static COMMANDS: Channel<CriticalSectionRawMutex, BleCommand, COMMAND_CHANNEL_SIZE> =
    Channel::new();

/// Queue a command for the BLE task.
pub async fn send_command(command: BleCommand) {
    COMMANDS.send(command).await;
}

/// Connection status for `/ble/conn_status`.
pub struct BleStatus {
    pub state: State,
    pub peer: Option<PeerAddr>,
    pub mtu: u16,
    pub scanning: bool,
}

pub static STATUS: Mutex<CriticalSectionRawMutex, BleStatus> = Mutex::new(BleStatus {
    state: State::Idle,
    peer: None,
    mtu: 0,
    scanning: false,
});

/// One discovered peripheral.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanResult {
    pub addr: PeerAddr,
    pub rssi: i8,
    pub name: Option<String>,
}

/// Scan cache.  A blocking mutex because the host stack reports
/// advertisements from a synchronous event context.
pub static SCAN_RESULTS: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<ScanResult>>> =
    BlockingMutex::new(RefCell::new(Vec::new()));

pub(crate) fn record_scan_result(result: ScanResult) {
    SCAN_RESULTS.lock(|cell| {
        let mut results = cell.borrow_mut();
        if let Some(existing) = results.iter_mut().find(|r| r.addr == result.addr) {
            existing.rssi = result.rssi;
            if result.name.is_some() {
                existing.name = result.name;
            }
        } else if results.len() < MAX_SCAN_RESULTS {
            results.push(result);
        }
    });
}

/// Notifications from the peer, fanned out to every proxy client.  One
/// message per notification, delivered whole.
pub static NOTIFY_BUS: PubSubChannel<
    CriticalSectionRawMutex,
    Vec<u8>,
    NOTIFY_QUEUE_SIZE,
    MAX_PROXY_CLIENTS,
    1,
> = PubSubChannel::new();

/// Bytes for the peer, already chunked to the link MTU by the proxy.
/// Sends fail cleanly (the queue drains to nowhere) when no link is up.
pub static TX_TO_BLE: Channel<CriticalSectionRawMutex, Vec<u8>, TX_QUEUE_SIZE> = Channel::new();

/// Bridge state for the proxy: true once the link is Ready, false the
/// moment it drops.
pub static BRIDGE_UP: Watch<CriticalSectionRawMutex, bool, MAX_PROXY_CLIENTS> = Watch::new();

/// Current usable chunk length for TCP→BLE writes.
pub async fn current_chunk_len() -> usize {
    let status = STATUS.lock().await;
    att_chunk_len(if status.mtu != 0 { status.mtu } else { 23 })
}

async fn set_status(state: State, peer: Option<PeerAddr>, mtu: u16) {
    let mut status = STATUS.lock().await;
    status.state = state;
    status.peer = peer;
    status.mtu = mtu;
}

/// The BLE driver loop, generic over the host stack seam.  `task` in
/// [`trouble`] instantiates it.
pub(crate) async fn run<H: BleHost>(mut host: H, passkey: u32) -> ! {
    let mut machine = Central::new(passkey);

    loop {
        let command = COMMANDS.receive().await;
        match command {
            BleCommand::StartScan => {
                STATUS.lock().await.scanning = true;
                info!("ble: scan started");
                if let Err(e) = host.scan(SCAN_DURATION, &COMMANDS).await {
                    warn!("ble: scan failed: {e}");
                }
                STATUS.lock().await.scanning = false;
                info!("ble: scan finished");
            }
            BleCommand::StopScan | BleCommand::Disconnect => {
                // Nothing running - both are no-ops from idle
            }
            BleCommand::ClearDevices => {
                SCAN_RESULTS.lock(|cell| cell.borrow_mut().clear());
            }
            BleCommand::Passkey(pin) => {
                machine.set_passkey(pin);
            }
            BleCommand::Connect(peer) => {
                // Any scan has just been cancelled by arrival here; give
                // the controller a beat before connecting
                Timer::after(POST_SCAN_CANCEL_GUARD).await;

                if machine.start_connect(peer).is_err() {
                    continue;
                }
                set_status(State::Connecting, Some(peer), 0).await;

                let bridge_was_up = match host.connect(peer).await {
                    Ok(link) => run_link(&mut machine, link).await,
                    Err(e) => {
                        warn!("ble: {e}");
                        machine.on_event(Event::ConnectFailed);
                        false
                    }
                };

                // However the link ended, the machine is (or must become)
                // idle
                machine.on_event(Event::Disconnected);
                set_status(State::Idle, None, 0).await;
                if bridge_was_up {
                    BRIDGE_UP.sender().send(false);
                }
            }
        }
    }
}

// Serve one established link until it drops.  Returns whether the bridge
// was ever announced up, so the caller knows to take it down.
async fn run_link<L: BleLink>(machine: &mut Central, mut link: L) -> bool {
    let mut pending: VecDeque<Event> = VecDeque::new();
    pending.push_back(Event::Connected);
    let mut bridge_announced = false;

    let publisher = NOTIFY_BUS.publisher().expect("notify publisher");

    loop {
        // Drain queued machine events and their consequences first
        while let Some(event) = pending.pop_front() {
            for action in machine.on_event(event) {
                match execute_action(machine, &mut link, action).await {
                    Ok(mut events) => {
                        for event in events.drain(..) {
                            pending.push_back(event);
                        }
                    }
                    Err(e) => {
                        warn!("ble: action failed: {e}");
                        link.disconnect().await;
                        pending.push_back(Event::Disconnected);
                    }
                }
            }

            // Driver-owned holds between phases
            match machine.state() {
                State::MtuExchanged => {
                    set_status(State::MtuExchanged, Some(machine.link().peer), machine.mtu())
                        .await;
                    Timer::after(POST_MTU_HOLD).await;
                    pending.push_back(Event::HoldElapsed);
                }
                State::Encrypted => {
                    set_status(State::Encrypted, Some(machine.link().peer), machine.mtu()).await;
                    Timer::after(PRE_DISCOVERY_SETTLE).await;
                    pending.push_back(Event::HoldElapsed);
                }
                State::Ready if !bridge_announced => {
                    bridge_announced = true;
                    set_status(State::Ready, Some(machine.link().peer), machine.mtu()).await;
                    BRIDGE_UP.sender().send(true);
                    info!("ble: bridge up");
                }
                State::Idle => return bridge_announced,
                state => {
                    set_status(state, Some(machine.link().peer), machine.mtu()).await;
                }
            }
        }

        // Steady state: link events, outgoing bytes, commands
        match select3(link.next_event(), TX_TO_BLE.receive(), COMMANDS.receive()).await {
            Either3::First(event) => match event {
                LinkEvent::Notification(data) => {
                    trace!("ble: notify {} bytes", data.len());
                    publisher.publish(data).await;
                }
                LinkEvent::PasskeyRequest(action) => {
                    pending.push_back(Event::PasskeyRequest(action));
                }
                LinkEvent::EncryptionChanged { success } => {
                    pending.push_back(Event::EncryptionChanged { success });
                }
                LinkEvent::RepeatPairing => {
                    pending.push_back(Event::RepeatPairing);
                }
                LinkEvent::Disconnected => {
                    pending.push_back(Event::Disconnected);
                }
            },
            Either3::Second(data) => {
                // Chunking and pacing are the proxy's job; each message
                // here is one ATT write
                if machine.is_ready() {
                    if let Some(rx) = machine.link().rx_value_handle {
                        if let Err(e) = link.write_no_response(rx, &data).await {
                            warn!("ble: send failed: {e}");
                        }
                    }
                } else {
                    trace!("ble: dropping {} TX bytes, link not ready", data.len());
                }
            }
            Either3::Third(command) => match command {
                BleCommand::Disconnect => {
                    info!("ble: disconnect requested");
                    link.disconnect().await;
                    pending.push_back(Event::Disconnected);
                }
                BleCommand::Passkey(pin) => {
                    machine.set_passkey(pin);
                    link.inject_passkey(pin).await;
                }
                BleCommand::Connect(_) => {
                    debug!("ble: connect refused - already connected");
                }
                BleCommand::StartScan | BleCommand::StopScan => {
                    debug!("ble: scan refused - connected");
                }
                BleCommand::ClearDevices => {
                    SCAN_RESULTS.lock(|cell| cell.borrow_mut().clear());
                }
            },
        }
    }
}

// Execute one machine action against the link, translating any results
// back into machine events.
async fn execute_action<L: BleLink>(
    machine: &mut Central,
    link: &mut L,
    action: Action,
) -> Result<Vec<Event>, nightjar_ble::BleError> {
    let mut events = Vec::new();
    match action {
        Action::ExchangeMtu => {
            let mtu = link.exchange_mtu().await?;
            events.push(Event::MtuExchanged { mtu });
        }
        Action::InitiateSecurity => {
            link.initiate_security().await?;
        }
        Action::InjectPasskey(pin) => {
            link.inject_passkey(pin).await;
        }
        Action::ConfirmNumericComparison => {
            link.confirm_numeric_comparison().await;
        }
        Action::DeleteBondAndRetry => {
            link.delete_bond(machine.link().peer).await;
        }
        Action::DiscoverServices => {
            for (uuid, range) in link.discover_services().await? {
                events.push(Event::ServiceFound { uuid, range });
            }
            events.push(Event::ServiceDiscoveryComplete);
        }
        Action::DiscoverCharacteristics(range) => {
            for (properties, value_handle) in link.discover_characteristics(range).await? {
                events.push(Event::CharacteristicFound {
                    properties,
                    value_handle,
                });
            }
            events.push(Event::CharacteristicDiscoveryComplete);
        }
        Action::DiscoverDescriptors(range) => {
            for (uuid16, handle) in link.discover_descriptors(range).await? {
                events.push(Event::DescriptorFound { uuid16, handle });
            }
            events.push(Event::DescriptorDiscoveryComplete);
        }
        Action::WriteCccd { handle, value } => {
            let success = link.write_cccd(handle, value).await.is_ok();
            events.push(Event::SubscribeAcknowledged { success });
        }
        Action::Disconnect => {
            link.disconnect().await;
            events.push(Event::Disconnected);
        }
    }
    Ok(events)
}
