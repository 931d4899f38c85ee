// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - `trouble-host` binding for the host-stack seam.
//!
//! The esp-wifi BLE controller feeds an `ExternalController`; trouble
//! provides GAP and the GATT client on top.  Trouble's client is
//! UUID-addressed rather than enumeration-based, so the discovery methods
//! here look up the known characteristics of the two supported services
//! and synthesise the property view the driver expects - the UUIDs imply
//! the properties for both services.
//!
//! Security is initiated here (keyboard-only IO capabilities, matching
//! the fixed-PIN policy): `InitiateSecurity` calls the connection's
//! `request_security`, the stack's pairing events are translated into
//! link events, and passkey/numeric-comparison demands are answered
//! through the connection's pass-key calls.  Encryption is only ever
//! reported from a genuine `PairingComplete`/`PairingFailed` event.

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_futures::select::{Either, Either3, select, select3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::peripherals::BT;
use esp_wifi::EspWifiController;
use esp_wifi::ble::controller::BleConnector;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_cell::make_static;
use trouble_host::prelude::*;

use nightjar_ble::central::{
    HandleRange, MESHTASTIC_SERVICE_UUID, NUS_SERVICE_UUID, PasskeyAction,
};
use nightjar_ble::{BleError, PeerAddr};

use super::host::{BleHost, BleLink, LinkEvent};
use super::{BleCommand, ScanResult, record_scan_result};

// NUS characteristic UUIDs
const NUS_TX_UUID: [u8; 16] = uuid_bytes(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);
const NUS_RX_UUID: [u8; 16] = uuid_bytes(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

// Meshtastic characteristic UUIDs: FromNum notifies, ToRadio accepts
// writes
const MESH_FROMNUM_UUID: [u8; 16] = uuid_bytes(0xED9DA18C_A800_4F66_A670_AA7547E34453);
const MESH_TORADIO_UUID: [u8; 16] = uuid_bytes(0xF75C76D2_129E_4DAD_A1DD_7866124401E7);

const fn uuid_bytes(value: u128) -> [u8; 16] {
    value.to_be_bytes()
}

// Synthesised property bits for the UUID-addressed lookups
const PROP_NOTIFY: u8 = 0x10;
const PROP_WRITE_NO_RSP: u8 = 0x04;

const CONNECTIONS_MAX: usize = 1;
const L2CAP_CHANNELS_MAX: usize = 4;
const MAX_SERVICES: usize = 8;

// The ATT MTU the client negotiates; the controller caps payloads at
// 247 bytes either way
const NEGOTIATED_ATT_MTU: u16 = 247;

// Scan reports are recorded only while a scan window is open
static SCANNING: AtomicBool = AtomicBool::new(false);

type Controller = ExternalController<BleConnector<'static>, 20>;
type BleStack = Stack<'static, Controller, DefaultPacketPool>;
type Client = GattClient<'static, Controller, MAX_SERVICES, DefaultPacketPool>;

/// Runs the BLE host stack and the bridge driver on top of it.
#[embassy_executor::task]
pub async fn task(
    esp_wifi_ctrl: &'static EspWifiController<'static>,
    bt: BT<'static>,
    passkey: u32,
) {
    info!("Exec:  BLE task started");

    let connector = BleConnector::new(esp_wifi_ctrl, bt);
    let controller: Controller = ExternalController::new(connector);

    // Static random address for the central role
    let address = Address::random([0xC2, 0x7E, 0x2A, 0x5B, 0x11, 0xF4]);

    let resources = make_static!(HostResources::new());
    // Keyboard-only IO capabilities: we can type the peer's PIN but have
    // nothing to display
    let stack: &'static BleStack = make_static!(
        trouble_host::new(controller, resources)
            .set_random_address(address)
            .set_io_capabilities(IoCapabilities::KeyboardOnly)
    );
    let Host {
        central,
        mut runner,
        ..
    } = stack.build();

    let host = TroubleHost {
        stack,
        central: Some(central),
    };

    embassy_futures::join::join(
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&ScanSink).await {
                    error!("Error: BLE runner: {e:?}");
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        super::run(host, passkey),
    )
    .await;
}

// Collects advertising reports into the scan cache while a window is
// open.
struct ScanSink;

impl EventHandler for ScanSink {
    fn on_adv_reports(&self, mut reports: LeAdvReportsIter<'_>) {
        if !SCANNING.load(Ordering::Relaxed) {
            return;
        }
        while let Some(Ok(report)) = reports.next() {
            let mut addr = report.addr.raw();
            addr.reverse();
            record_scan_result(ScanResult {
                addr: PeerAddr(addr),
                rssi: report.rssi,
                name: adv_local_name(report.data),
            });
        }
    }
}

// Pull the (shortened or complete) local name out of advertising data.
fn adv_local_name(data: &[u8]) -> Option<alloc::string::String> {
    let mut rest = data;
    while rest.len() >= 2 {
        let len = rest[0] as usize;
        if len == 0 || len + 1 > rest.len() {
            break;
        }
        let ad_type = rest[1];
        let payload = &rest[2..len + 1];
        if ad_type == 0x08 || ad_type == 0x09 {
            return core::str::from_utf8(payload).ok().map(|s| s.to_string());
        }
        rest = &rest[len + 1..];
    }
    None
}

/// The production host: trouble central over the esp controller.
pub(crate) struct TroubleHost {
    stack: &'static BleStack,
    central: Option<Central<'static, Controller, DefaultPacketPool>>,
}

impl BleHost for TroubleHost {
    type Link = TroubleLink;

    async fn scan(
        &mut self,
        duration: Duration,
        commands: &'static Channel<CriticalSectionRawMutex, BleCommand, 4>,
    ) -> Result<(), BleError> {
        let central = self.central.take().expect("central parked");
        let mut scanner = Scanner::new(central);
        SCANNING.store(true, Ordering::Relaxed);

        let result = run_scan_window(&mut scanner, duration, commands).await;

        SCANNING.store(false, Ordering::Relaxed);
        self.central = Some(scanner.into_inner());
        result
    }

    async fn connect(&mut self, peer: PeerAddr) -> Result<TroubleLink, BleError> {
        let central = self.central.as_mut().expect("central parked");

        // Display order is MSB first; the wire wants it reversed
        let mut raw = peer.0;
        raw.reverse();
        let addr = BdAddr::new(raw);
        let target = [(AddrKind::RANDOM, &addr)];

        let config = ConnectConfig {
            connect_params: Default::default(),
            scan_config: ScanConfig {
                filter_accept_list: &target,
                ..Default::default()
            },
        };

        let conn = central
            .connect(&config)
            .await
            .map_err(|e| BleError::Connect(alloc::format!("{e:?}")))?;

        // The connection and client are heap-pinned so the client and the
        // notification listener can borrow them for the link's lifetime;
        // TroubleLink's Drop reclaims them in reverse order.
        let conn: &'static Connection<'static, DefaultPacketPool> =
            &*Box::leak(Box::new(conn));
        let conn_ptr = conn as *const Connection<'static, DefaultPacketPool>;

        let client = match GattClient::<Controller, MAX_SERVICES, DefaultPacketPool>::new(
            self.stack, conn,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                // Reclaim the connection before bailing out
                drop(unsafe { Box::from_raw(conn_ptr.cast_mut()) });
                return Err(BleError::Connect(alloc::format!("gatt client: {e:?}")));
            }
        };
        let client: &'static Client = &*Box::leak(Box::new(client));
        let client_ptr = client as *const Client;

        Ok(TroubleLink {
            listener: None,
            client,
            client_ptr,
            conn,
            conn_ptr,
            stack: self.stack,
            service: None,
            tx_char: None,
        })
    }
}

async fn run_scan_window(
    scanner: &mut Scanner<'static, Controller, DefaultPacketPool>,
    duration: Duration,
    commands: &'static Channel<CriticalSectionRawMutex, BleCommand, 4>,
) -> Result<(), BleError> {
    let config = ScanConfig {
        active: true,
        ..Default::default()
    };
    let session = scanner
        .scan(&config)
        .await
        .map_err(|e| BleError::Connect(alloc::format!("scan: {e:?}")))?;

    let deadline = Instant::now() + duration;
    loop {
        match select(Timer::at(deadline), commands.receive()).await {
            Either::First(()) => break,
            Either::Second(BleCommand::StopScan) => break,
            Either::Second(BleCommand::ClearDevices) => {
                super::SCAN_RESULTS.lock(|cell| cell.borrow_mut().clear());
            }
            Either::Second(other) => {
                // Ends the window; the main loop handles it next
                let _ = commands.try_send(other);
                break;
            }
        }
    }

    drop(session);
    Ok(())
}

/// One live connection: trouble connection + GATT client + notification
/// subscription.
pub(crate) struct TroubleLink {
    // Declared first so it drops before the client it borrows
    listener: Option<NotificationListener<'static, DefaultPacketPool>>,
    client: &'static Client,
    client_ptr: *const Client,
    conn: &'static Connection<'static, DefaultPacketPool>,
    conn_ptr: *const Connection<'static, DefaultPacketPool>,
    stack: &'static BleStack,
    service: Option<FoundService>,
    tx_char: Option<Characteristic<u8>>,
}

struct FoundService {
    handle: ServiceHandle,
    uuid: [u8; 16],
    range: HandleRange,
}

impl Drop for TroubleLink {
    fn drop(&mut self) {
        // Reverse construction order: listener, client, connection
        self.listener.take();
        unsafe {
            drop(Box::from_raw(self.client_ptr.cast_mut()));
            drop(Box::from_raw(self.conn_ptr.cast_mut()));
        }
    }
}

impl TroubleLink {
    // Find a service by 128-bit UUID, recording it if it is one of ours.
    async fn lookup_service(&mut self, uuid: [u8; 16]) -> Option<FoundService> {
        let services = self
            .client
            .services_by_uuid(&Uuid::new_long(uuid))
            .await
            .ok()?;
        let handle = services.first()?.clone();
        let range = HandleRange {
            start: handle.start,
            end: handle.end,
        };
        Some(FoundService {
            handle,
            uuid,
            range,
        })
    }

    async fn lookup_characteristic(&self, uuid: [u8; 16]) -> Option<Characteristic<u8>> {
        let service = self.service.as_ref()?;
        self.client
            .characteristic_by_uuid(&service.handle, &Uuid::new_long(uuid))
            .await
            .ok()
    }

    fn char_uuids(&self) -> Option<([u8; 16], [u8; 16])> {
        let service = self.service.as_ref()?;
        if service.uuid == NUS_SERVICE_UUID {
            Some((NUS_TX_UUID, NUS_RX_UUID))
        } else {
            Some((MESH_FROMNUM_UUID, MESH_TORADIO_UUID))
        }
    }
}

impl BleLink for TroubleLink {
    async fn exchange_mtu(&mut self) -> Result<u16, BleError> {
        // The client negotiated during setup; report the configured value
        Ok(NEGOTIATED_ATT_MTU)
    }

    async fn initiate_security(&mut self) -> Result<(), BleError> {
        // Start pairing/encryption as the initiator.  The outcome arrives
        // later, as a PairingComplete or PairingFailed connection event -
        // nothing is reported encrypted until then.
        self.conn
            .request_security()
            .await
            .map_err(|e| BleError::Pair(alloc::format!("{e:?}")))
    }

    async fn inject_passkey(&mut self, passkey: u32) {
        if let Err(e) = self.conn.pass_key_entry(passkey).await {
            warn!("ble: passkey entry rejected: {e:?}");
        }
    }

    async fn confirm_numeric_comparison(&mut self) {
        if let Err(e) = self.conn.pass_key_confirm(true).await {
            warn!("ble: numeric comparison confirm rejected: {e:?}");
        }
    }

    async fn delete_bond(&mut self, peer: PeerAddr) {
        info!("ble: dropping stored bond for {peer}");
        let mut raw = peer.0;
        raw.reverse();
        let identity = Identity {
            bd_addr: BdAddr::new(raw),
            irk: None,
        };
        if let Err(e) = self.stack.remove_bond_information(identity) {
            warn!("ble: bond removal failed: {e:?}");
        }
    }

    async fn discover_services(&mut self) -> Result<Vec<([u8; 16], HandleRange)>, BleError> {
        let mut found = Vec::new();

        // client.task() must be polled for responses to flow; it never
        // completes on its own
        let discovery = async {
            for uuid in [NUS_SERVICE_UUID, MESHTASTIC_SERVICE_UUID] {
                if let Some(service) = self.lookup_service(uuid).await {
                    found.push((service.uuid, service.range));
                    self.service = Some(service);
                    break;
                }
            }
        };
        match select(self.client.task(), discovery).await {
            Either::First(result) => {
                warn!("ble: client task ended during discovery: {result:?}");
                return Err(BleError::Discover("client task ended".to_string()));
            }
            Either::Second(()) => {}
        }

        Ok(found)
    }

    async fn discover_characteristics(
        &mut self,
        _range: HandleRange,
    ) -> Result<Vec<(u8, u16)>, BleError> {
        let Some((tx_uuid, rx_uuid)) = self.char_uuids() else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        let discovery = async {
            let tx = self.lookup_characteristic(tx_uuid).await;
            let rx = self.lookup_characteristic(rx_uuid).await;
            (tx, rx)
        };
        let (tx, rx) = match select(self.client.task(), discovery).await {
            Either::First(result) => {
                warn!("ble: client task ended during discovery: {result:?}");
                return Err(BleError::Discover("client task ended".to_string()));
            }
            Either::Second(chars) => chars,
        };

        if let Some(tx) = tx {
            found.push((PROP_NOTIFY, tx.handle));
            self.tx_char = Some(tx);
        }
        if let Some(rx) = rx {
            found.push((PROP_WRITE_NO_RSP, rx.handle));
        }
        Ok(found)
    }

    async fn discover_descriptors(
        &mut self,
        _range: HandleRange,
    ) -> Result<Vec<(u16, u16)>, BleError> {
        // The client resolved the CCCD alongside the characteristic
        let Some(tx) = self.tx_char.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(tx
            .cccd_handle
            .map(|handle| alloc::vec![(0x2902u16, handle)])
            .unwrap_or_default())
    }

    async fn write_cccd(&mut self, _handle: u16, _value: [u8; 2]) -> Result<(), BleError> {
        let Some(tx) = self.tx_char.as_ref() else {
            return Err(BleError::Subscribe("no TX characteristic".to_string()));
        };

        let subscribe = self.client.subscribe(tx, false);
        let listener = match select(self.client.task(), subscribe).await {
            Either::First(result) => {
                warn!("ble: client task ended during subscribe: {result:?}");
                return Err(BleError::Subscribe("client task ended".to_string()));
            }
            Either::Second(listener) => {
                listener.map_err(|e| BleError::Subscribe(alloc::format!("{e:?}")))?
            }
        };
        self.listener = Some(listener);
        Ok(())
    }

    async fn write_no_response(&mut self, _handle: u16, data: &[u8]) -> Result<(), BleError> {
        let Some(service) = self.service.as_ref() else {
            return Err(BleError::Send("no service".to_string()));
        };
        let rx_uuid = if service.uuid == NUS_SERVICE_UUID {
            NUS_RX_UUID
        } else {
            MESH_TORADIO_UUID
        };

        let write = async {
            let Some(rx) = self.lookup_characteristic(rx_uuid).await else {
                return Err(BleError::Send("RX characteristic gone".to_string()));
            };
            self.client
                .write_characteristic(&rx, data)
                .await
                .map_err(|e| BleError::Send(alloc::format!("{e:?}")))
        };
        match select(self.client.task(), write).await {
            Either::First(result) => {
                warn!("ble: client task ended during write: {result:?}");
                Err(BleError::Send("client task ended".to_string()))
            }
            Either::Second(result) => result,
        }
    }

    async fn next_event(&mut self) -> LinkEvent {
        let client = self.client;
        let listener = self.listener.as_mut();

        let notifications = async {
            match listener {
                Some(listener) => {
                    let notification = listener.next().await;
                    LinkEvent::Notification(notification.as_ref().to_vec())
                }
                // No subscription yet - nothing will arrive on this arm
                None => core::future::pending().await,
            }
        };

        let conn_events = async {
            let conn = self.conn;
            loop {
                match conn.next().await {
                    ConnectionEvent::Disconnected { reason } => {
                        debug!("ble: disconnected: {reason:?}");
                        return LinkEvent::Disconnected;
                    }
                    ConnectionEvent::PassKeyRequest => {
                        return LinkEvent::PasskeyRequest(PasskeyAction::Input);
                    }
                    ConnectionEvent::PassKeyConfirm(value) => {
                        return LinkEvent::PasskeyRequest(PasskeyAction::NumericComparison(
                            value,
                        ));
                    }
                    ConnectionEvent::PassKeyDisplay(value) => {
                        info!("ble: peer expects displayed passkey {value:06}");
                        return LinkEvent::PasskeyRequest(PasskeyAction::Display);
                    }
                    ConnectionEvent::PairingComplete { security_level, .. } => {
                        debug!("ble: pairing complete at {security_level:?}");
                        return LinkEvent::EncryptionChanged {
                            success: security_level != SecurityLevel::NoEncryption,
                        };
                    }
                    ConnectionEvent::PairingFailed(reason) => {
                        warn!("ble: pairing failed: {reason:?}");
                        // A peer whose side of the bond has gone stale
                        // rejects our keys; drop ours and let the machine
                        // retry from scratch
                        return match reason {
                            Reason::KeyRejected | Reason::RepeatedAttempts => {
                                LinkEvent::RepeatPairing
                            }
                            _ => LinkEvent::EncryptionChanged { success: false },
                        };
                    }
                    // GATT server traffic and the like do not concern a
                    // central serial bridge
                    _ => {}
                }
            }
        };

        match select3(client.task(), notifications, conn_events).await {
            Either3::First(result) => {
                debug!("ble: client task ended: {result:?}");
                LinkEvent::Disconnected
            }
            Either3::Second(event) => event,
            Either3::Third(event) => event,
        }
    }

    async fn disconnect(&mut self) {
        self.conn.disconnect();
    }
}
