// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! The BLE central state machine.
//!
//! Sequences one connection through MTU exchange, pairing (with passkey
//! injection), GATT discovery of the serial service, and CCCD
//! subscription.  The machine is a pure function of its inputs: the
//! driver feeds it [`Event`]s from the host stack and executes the
//! [`Action`]s it returns.  Wall-clock holds between phases belong to the
//! driver, not the machine.
//!
//! ```text
//! Idle → Connecting → Connected → MtuExchanged → Securing ⇄ Passkey
//!      → Encrypted → Discovering → Ready
//! any state → Idle on Disconnected
//! ```

use alloc::string::ToString;
use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{BleError, PeerAddr};

/// Nordic UART Service UUID
pub const NUS_SERVICE_UUID: [u8; 16] = uuid128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Meshtastic service UUID
pub const MESHTASTIC_SERVICE_UUID: [u8; 16] = uuid128(0x6BA1B218_15A8_461F_9FA8_5DCAE273EAFD);

/// Client Characteristic Configuration Descriptor, 16-bit UUID
pub const CCCD_UUID16: u16 = 0x2902;

/// CCCD value enabling notifications
pub const CCCD_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const CCCD_ENABLE_INDICATE: [u8; 2] = [0x02, 0x00];

/// Passkey used when the peer asks for input and none is configured -
/// Meshtastic's default PIN.
pub const DEFAULT_PASSKEY: u32 = 123456;

const fn uuid128(value: u128) -> [u8; 16] {
    value.to_be_bytes()
}

/// GATT characteristic property bits, as they appear in the declaration.
pub mod props {
    pub const WRITE_NO_RSP: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// Machine states.  The wire names match spec'd GAP/GATT phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Idle,
    Connecting,
    Connected,
    MtuExchanged,
    Securing,
    Passkey,
    Encrypted,
    Discovering,
    Ready,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::MtuExchanged => "mtu_exchanged",
            State::Securing => "securing",
            State::Passkey => "passkey",
            State::Encrypted => "encrypted",
            State::Discovering => "discovering",
            State::Ready => "ready",
        }
    }
}

/// What the peer's security manager wants from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyAction {
    /// Type the peer's PIN
    Input,
    /// Confirm both sides display the same number
    NumericComparison(u32),
    /// We are meant to display a PIN for the peer to type
    Display,
}

/// A handle range, as reported by service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

/// Host-stack events fed into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// GAP connection completed
    Connected,
    /// GAP connection attempt failed
    ConnectFailed,
    /// ATT MTU negotiated
    MtuExchanged { mtu: u16 },
    /// The driver's stabilisation hold expired (1 s after MTU exchange,
    /// 500 ms after encryption)
    HoldElapsed,
    /// The security manager needs passkey input
    PasskeyRequest(PasskeyAction),
    /// Link encryption completed (or failed)
    EncryptionChanged { success: bool },
    /// Peer holds a stale bond for us
    RepeatPairing,
    /// A primary service was reported during discovery
    ServiceFound { uuid: [u8; 16], range: HandleRange },
    /// Primary service discovery finished
    ServiceDiscoveryComplete,
    /// A characteristic was reported within the accepted service
    CharacteristicFound { properties: u8, value_handle: u16 },
    /// Characteristic discovery finished
    CharacteristicDiscoveryComplete,
    /// A descriptor was reported within the TX characteristic's range
    DescriptorFound { uuid16: u16, handle: u16 },
    /// Descriptor discovery finished
    DescriptorDiscoveryComplete,
    /// The CCCD write completed
    SubscribeAcknowledged { success: bool },
    /// GAP disconnection, from any state
    Disconnected,
}

/// Actions the driver must execute against the host stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ExchangeMtu,
    InitiateSecurity,
    InjectPasskey(u32),
    ConfirmNumericComparison,
    /// Drop the stored bond for this peer and let pairing retry
    DeleteBondAndRetry,
    DiscoverServices,
    DiscoverCharacteristics(HandleRange),
    DiscoverDescriptors(HandleRange),
    WriteCccd { handle: u16, value: [u8; 2] },
    Disconnect,
}

/// Everything learned about the connection so far.
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub peer: PeerAddr,
    pub mtu: u16,
    pub encrypted: bool,
    pub service_range: Option<HandleRange>,
    pub tx_props: u8,
    pub tx_value_handle: Option<u16>,
    pub rx_value_handle: Option<u16>,
    pub tx_cccd_handle: Option<u16>,
    pub notify_enabled: bool,
}

/// The central state machine.  One instance per configured bridge; it
/// serves one connection at a time.
#[derive(Debug)]
pub struct Central {
    state: State,
    passkey: u32,
    link: LinkInfo,
    last_error: Option<BleError>,
}

impl Central {
    pub fn new(passkey: u32) -> Self {
        Self {
            state: State::Idle,
            passkey,
            link: LinkInfo::default(),
            last_error: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn link(&self) -> &LinkInfo {
        &self.link
    }

    pub fn last_error(&self) -> Option<&BleError> {
        self.last_error.as_ref()
    }

    /// Negotiated MTU, or the ATT default before exchange.
    pub fn mtu(&self) -> u16 {
        if self.link.mtu != 0 { self.link.mtu } else { 23 }
    }

    /// Ready to bridge traffic.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Update the passkey used for subsequent pairing attempts.
    pub fn set_passkey(&mut self, passkey: u32) {
        self.passkey = passkey;
    }

    /// Begin connecting to `peer`.  Refused unless Idle - the caller must
    /// disconnect first.  The driver is responsible for cancelling any
    /// scan (and pausing ~100 ms) before issuing the GAP connect.
    pub fn start_connect(&mut self, peer: PeerAddr) -> Result<(), BleError> {
        if self.state != State::Idle {
            debug!("ble: connect refused in state {}", self.state.as_str());
            return Err(BleError::InvalidState);
        }
        self.link = LinkInfo {
            peer,
            ..LinkInfo::default()
        };
        self.last_error = None;
        self.state = State::Connecting;
        info!("ble: connecting to {peer}");
        Ok(())
    }

    /// Feed one host-stack event; returns the actions to execute, in
    /// order.
    pub fn on_event(&mut self, event: Event) -> Vec<Action> {
        trace!("ble: {:?} in {}", event, self.state.as_str());
        match event {
            Event::Disconnected => self.on_disconnected(),
            Event::Connected => self.on_connected(),
            Event::ConnectFailed => {
                self.fail(BleError::Connect("gap connect failed".to_string()))
            }
            Event::MtuExchanged { mtu } => self.on_mtu(mtu),
            Event::HoldElapsed => self.on_hold_elapsed(),
            Event::PasskeyRequest(action) => self.on_passkey(action),
            Event::EncryptionChanged { success } => self.on_encryption(success),
            Event::RepeatPairing => Vec::from([Action::DeleteBondAndRetry]),
            Event::ServiceFound { uuid, range } => self.on_service(uuid, range),
            Event::ServiceDiscoveryComplete => self.on_services_complete(),
            Event::CharacteristicFound {
                properties,
                value_handle,
            } => self.on_characteristic(properties, value_handle),
            Event::CharacteristicDiscoveryComplete => self.on_characteristics_complete(),
            Event::DescriptorFound { uuid16, handle } => self.on_descriptor(uuid16, handle),
            Event::DescriptorDiscoveryComplete => self.on_descriptors_complete(),
            Event::SubscribeAcknowledged { success } => self.on_subscribed(success),
        }
    }

    fn on_disconnected(&mut self) -> Vec<Action> {
        if self.state != State::Idle {
            info!("ble: disconnected (was {})", self.state.as_str());
        }
        self.state = State::Idle;
        self.link = LinkInfo {
            peer: self.link.peer,
            ..LinkInfo::default()
        };
        Vec::new()
    }

    fn on_connected(&mut self) -> Vec<Action> {
        if self.state != State::Connecting {
            return self.unexpected("connect");
        }
        self.state = State::Connected;
        Vec::from([Action::ExchangeMtu])
    }

    fn on_mtu(&mut self, mtu: u16) -> Vec<Action> {
        if self.state != State::Connected {
            return self.unexpected("mtu");
        }
        info!("ble: MTU {mtu}");
        self.link.mtu = mtu;
        // The driver holds ~1 s in this state to let the peer's stack
        // settle, then feeds HoldElapsed
        self.state = State::MtuExchanged;
        Vec::new()
    }

    fn on_hold_elapsed(&mut self) -> Vec<Action> {
        match self.state {
            State::MtuExchanged => {
                self.state = State::Securing;
                Vec::from([Action::InitiateSecurity])
            }
            State::Encrypted => {
                self.state = State::Discovering;
                Vec::from([Action::DiscoverServices])
            }
            _ => self.unexpected("hold"),
        }
    }

    fn on_passkey(&mut self, action: PasskeyAction) -> Vec<Action> {
        if !matches!(self.state, State::Securing | State::Passkey) {
            return self.unexpected("passkey");
        }
        match action {
            PasskeyAction::Input => {
                info!("ble: injecting passkey");
                self.state = State::Securing;
                Vec::from([Action::InjectPasskey(self.passkey)])
            }
            PasskeyAction::NumericComparison(value) => {
                info!("ble: accepting numeric comparison {value}");
                self.state = State::Securing;
                Vec::from([Action::ConfirmNumericComparison])
            }
            PasskeyAction::Display => {
                // Keyboard-only IO caps shouldn't get here, but some peers
                // ask anyway; offer the configured key
                info!("ble: display passkey requested, offering configured key");
                self.state = State::Passkey;
                Vec::from([Action::InjectPasskey(self.passkey)])
            }
        }
    }

    fn on_encryption(&mut self, success: bool) -> Vec<Action> {
        if !matches!(self.state, State::Securing | State::Passkey) {
            return self.unexpected("encryption");
        }
        if !success {
            return self.fail(BleError::Encrypt("encryption failed".to_string()));
        }
        info!("ble: link encrypted");
        self.link.encrypted = true;
        // The driver settles ~500 ms in this state, then feeds HoldElapsed
        self.state = State::Encrypted;
        Vec::new()
    }

    fn on_service(&mut self, uuid: [u8; 16], range: HandleRange) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("service");
        }
        if uuid == NUS_SERVICE_UUID || uuid == MESHTASTIC_SERVICE_UUID {
            let kind = if uuid == NUS_SERVICE_UUID {
                "NUS"
            } else {
                "Meshtastic"
            };
            info!("ble: serial service found ({kind}), handles {}-{}", range.start, range.end);
            self.link.service_range = Some(range);
        }
        Vec::new()
    }

    fn on_services_complete(&mut self) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("service discovery end");
        }
        match self.link.service_range {
            Some(range) => Vec::from([Action::DiscoverCharacteristics(range)]),
            None => self.fail(BleError::Discover("no serial service".to_string())),
        }
    }

    fn on_characteristic(&mut self, properties: u8, value_handle: u16) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("characteristic");
        }
        if properties & (props::NOTIFY | props::INDICATE) != 0 {
            self.link.tx_props = properties;
            self.link.tx_value_handle = Some(value_handle);
            trace!("ble: TX characteristic at {value_handle}");
        }
        if properties & (props::WRITE | props::WRITE_NO_RSP) != 0 {
            self.link.rx_value_handle = Some(value_handle);
            trace!("ble: RX characteristic at {value_handle}");
        }
        Vec::new()
    }

    fn on_characteristics_complete(&mut self) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("characteristic discovery end");
        }
        let (Some(tx), Some(_rx), Some(service)) = (
            self.link.tx_value_handle,
            self.link.rx_value_handle,
            self.link.service_range,
        ) else {
            return self.fail(BleError::Discover(
                "service missing TX or RX characteristic".to_string(),
            ));
        };
        Vec::from([Action::DiscoverDescriptors(HandleRange {
            start: tx,
            end: service.end,
        })])
    }

    fn on_descriptor(&mut self, uuid16: u16, handle: u16) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("descriptor");
        }
        if uuid16 == CCCD_UUID16 {
            trace!("ble: CCCD at {handle}");
            self.link.tx_cccd_handle = Some(handle);
        }
        Vec::new()
    }

    fn on_descriptors_complete(&mut self) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("descriptor discovery end");
        }
        let Some(handle) = self.link.tx_cccd_handle else {
            return self.fail(BleError::Subscribe("no CCCD on TX".to_string()));
        };
        // Prefer notify; fall back to indicate when that is all the peer
        // offers
        let value = if self.link.tx_props & props::NOTIFY != 0 {
            CCCD_ENABLE_NOTIFY
        } else {
            CCCD_ENABLE_INDICATE
        };
        Vec::from([Action::WriteCccd { handle, value }])
    }

    fn on_subscribed(&mut self, success: bool) -> Vec<Action> {
        if self.state != State::Discovering {
            return self.unexpected("subscribe ack");
        }
        if !success {
            return self.fail(BleError::Subscribe("CCCD write failed".to_string()));
        }
        self.link.notify_enabled = true;
        self.state = State::Ready;
        info!(
            "ble: serial bridge ready (TX={:?} RX={:?} CCCD={:?})",
            self.link.tx_value_handle, self.link.rx_value_handle, self.link.tx_cccd_handle
        );
        Vec::new()
    }

    // A failure mid-sequence: record it, ask the driver to drop the link.
    // The Disconnected event completes the cleanup to Idle.
    fn fail(&mut self, error: BleError) -> Vec<Action> {
        warn!("ble: {error}");
        self.last_error = Some(error);
        if self.state == State::Connecting {
            // Nothing to tear down - the connect never happened
            self.state = State::Idle;
            Vec::new()
        } else {
            Vec::from([Action::Disconnect])
        }
    }

    fn unexpected(&mut self, what: &str) -> Vec<Action> {
        debug!("ble: unexpected {what} event in {}", self.state.as_str());
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr([0xC0, 0xFF, 0xEE, 0x12, 0x34, 0x56])
    }

    // Walk a machine to the Discovering state, exercising every transition
    // in the state table on the way.
    fn machine_discovering() -> Central {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        sm.start_connect(peer()).unwrap();
        assert_eq!(sm.state(), State::Connecting);

        assert_eq!(sm.on_event(Event::Connected), [Action::ExchangeMtu]);
        assert_eq!(sm.state(), State::Connected);

        assert!(sm.on_event(Event::MtuExchanged { mtu: 247 }).is_empty());
        assert_eq!(sm.state(), State::MtuExchanged);

        assert_eq!(sm.on_event(Event::HoldElapsed), [Action::InitiateSecurity]);
        assert_eq!(sm.state(), State::Securing);

        assert_eq!(
            sm.on_event(Event::PasskeyRequest(PasskeyAction::Input)),
            [Action::InjectPasskey(DEFAULT_PASSKEY)]
        );
        assert!(sm.on_event(Event::EncryptionChanged { success: true }).is_empty());
        assert_eq!(sm.state(), State::Encrypted);

        assert_eq!(sm.on_event(Event::HoldElapsed), [Action::DiscoverServices]);
        assert_eq!(sm.state(), State::Discovering);
        sm
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut sm = machine_discovering();

        let range = HandleRange { start: 16, end: 24 };
        assert!(sm
            .on_event(Event::ServiceFound {
                uuid: NUS_SERVICE_UUID,
                range,
            })
            .is_empty());
        assert_eq!(
            sm.on_event(Event::ServiceDiscoveryComplete),
            [Action::DiscoverCharacteristics(range)]
        );

        // TX (notify) then RX (write without response)
        assert!(sm
            .on_event(Event::CharacteristicFound {
                properties: props::NOTIFY,
                value_handle: 18,
            })
            .is_empty());
        assert!(sm
            .on_event(Event::CharacteristicFound {
                properties: props::WRITE_NO_RSP,
                value_handle: 21,
            })
            .is_empty());
        assert_eq!(
            sm.on_event(Event::CharacteristicDiscoveryComplete),
            [Action::DiscoverDescriptors(HandleRange { start: 18, end: 24 })]
        );

        assert!(sm
            .on_event(Event::DescriptorFound {
                uuid16: CCCD_UUID16,
                handle: 19,
            })
            .is_empty());
        assert_eq!(
            sm.on_event(Event::DescriptorDiscoveryComplete),
            [Action::WriteCccd {
                handle: 19,
                value: CCCD_ENABLE_NOTIFY,
            }]
        );

        assert!(sm
            .on_event(Event::SubscribeAcknowledged { success: true })
            .is_empty());
        assert!(sm.is_ready());
        assert_eq!(sm.link().tx_value_handle, Some(18));
        assert_eq!(sm.link().rx_value_handle, Some(21));
        assert_eq!(sm.mtu(), 247);
    }

    #[test]
    fn indicate_only_tx_subscribes_with_indicate_value() {
        let mut sm = machine_discovering();
        let range = HandleRange { start: 16, end: 24 };
        sm.on_event(Event::ServiceFound {
            uuid: MESHTASTIC_SERVICE_UUID,
            range,
        });
        sm.on_event(Event::ServiceDiscoveryComplete);
        sm.on_event(Event::CharacteristicFound {
            properties: props::INDICATE,
            value_handle: 18,
        });
        sm.on_event(Event::CharacteristicFound {
            properties: props::WRITE,
            value_handle: 21,
        });
        sm.on_event(Event::CharacteristicDiscoveryComplete);
        sm.on_event(Event::DescriptorFound {
            uuid16: CCCD_UUID16,
            handle: 19,
        });
        assert_eq!(
            sm.on_event(Event::DescriptorDiscoveryComplete),
            [Action::WriteCccd {
                handle: 19,
                value: CCCD_ENABLE_INDICATE,
            }]
        );
    }

    #[test]
    fn foreign_services_are_ignored() {
        let mut sm = machine_discovering();
        sm.on_event(Event::ServiceFound {
            uuid: [0xAA; 16],
            range: HandleRange { start: 1, end: 9 },
        });
        let actions = sm.on_event(Event::ServiceDiscoveryComplete);
        assert_eq!(actions, [Action::Disconnect]);
        assert!(matches!(sm.last_error(), Some(BleError::Discover(_))));

        // The disconnect completes the cleanup
        sm.on_event(Event::Disconnected);
        assert_eq!(sm.state(), State::Idle);
    }

    #[test]
    fn connect_refused_unless_idle() {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        sm.start_connect(peer()).unwrap();
        assert_eq!(sm.start_connect(peer()), Err(BleError::InvalidState));

        sm.on_event(Event::Disconnected);
        assert!(sm.start_connect(peer()).is_ok());
    }

    #[test]
    fn disconnect_from_any_state_is_safe_and_idempotent() {
        let mut sm = machine_discovering();
        sm.on_event(Event::Disconnected);
        assert_eq!(sm.state(), State::Idle);
        // A second disconnect is a no-op
        assert!(sm.on_event(Event::Disconnected).is_empty());
        assert_eq!(sm.state(), State::Idle);
    }

    #[test]
    fn numeric_comparison_auto_accepts() {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        sm.start_connect(peer()).unwrap();
        sm.on_event(Event::Connected);
        sm.on_event(Event::MtuExchanged { mtu: 185 });
        sm.on_event(Event::HoldElapsed);
        assert_eq!(
            sm.on_event(Event::PasskeyRequest(PasskeyAction::NumericComparison(123456))),
            [Action::ConfirmNumericComparison]
        );
    }

    #[test]
    fn repeat_pairing_deletes_bond() {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        sm.start_connect(peer()).unwrap();
        sm.on_event(Event::Connected);
        sm.on_event(Event::MtuExchanged { mtu: 185 });
        sm.on_event(Event::HoldElapsed);
        assert_eq!(
            sm.on_event(Event::RepeatPairing),
            [Action::DeleteBondAndRetry]
        );
    }

    #[test]
    fn encryption_failure_surfaces_and_cleans_up() {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        sm.start_connect(peer()).unwrap();
        sm.on_event(Event::Connected);
        sm.on_event(Event::MtuExchanged { mtu: 185 });
        sm.on_event(Event::HoldElapsed);
        let actions = sm.on_event(Event::EncryptionChanged { success: false });
        assert_eq!(actions, [Action::Disconnect]);
        assert!(matches!(sm.last_error(), Some(BleError::Encrypt(_))));
    }

    #[test]
    fn configured_passkey_is_injected() {
        let mut sm = Central::new(999_999);
        sm.start_connect(peer()).unwrap();
        sm.on_event(Event::Connected);
        sm.on_event(Event::MtuExchanged { mtu: 23 });
        sm.on_event(Event::HoldElapsed);
        assert_eq!(
            sm.on_event(Event::PasskeyRequest(PasskeyAction::Input)),
            [Action::InjectPasskey(999_999)]
        );

        // Passkey can be replaced mid-securing, e.g. via the HTTP surface
        sm.set_passkey(111_111);
        assert_eq!(
            sm.on_event(Event::PasskeyRequest(PasskeyAction::Input)),
            [Action::InjectPasskey(111_111)]
        );
    }

    #[test]
    fn stale_events_in_idle_are_ignored() {
        let mut sm = Central::new(DEFAULT_PASSKEY);
        assert!(sm.on_event(Event::MtuExchanged { mtu: 100 }).is_empty());
        assert!(sm
            .on_event(Event::SubscribeAcknowledged { success: true })
            .is_empty());
        assert_eq!(sm.state(), State::Idle);
    }
}
