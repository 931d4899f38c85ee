// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - the host-stack seam.
//!
//! The BLE host stack is an external collaborator; the driver only needs
//! the operations below.  [`super::trouble`] provides the production
//! implementation over `trouble-host` and the esp-wifi controller.

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;

use nightjar_ble::BleError;
use nightjar_ble::central::{HandleRange, PasskeyAction};
use nightjar_ble::PeerAddr;

use super::BleCommand;

/// Asynchronous things a live link reports.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A notification (or indication) arrived on the subscribed TX
    /// characteristic
    Notification(Vec<u8>),
    /// The peer's security manager wants something from us
    PasskeyRequest(PasskeyAction),
    /// Link encryption completed or failed
    EncryptionChanged { success: bool },
    /// The peer holds a stale bond and wants to re-pair
    RepeatPairing,
    /// The link dropped
    Disconnected,
}

/// The radio-side operations the driver loop needs.
pub(crate) trait BleHost {
    type Link: BleLink;

    /// Scan for `duration`, feeding discovered peripherals into the scan
    /// cache.  Watches `commands` so a StopScan (or Connect) cuts the
    /// window short; any other command is requeued by the implementation.
    async fn scan(
        &mut self,
        duration: Duration,
        commands: &'static Channel<CriticalSectionRawMutex, BleCommand, 4>,
    ) -> Result<(), BleError>;

    /// Establish a GAP connection to `peer`.
    async fn connect(&mut self, peer: PeerAddr) -> Result<Self::Link, BleError>;
}

/// One established connection.
pub(crate) trait BleLink {
    /// Negotiate (or report) the ATT MTU.
    async fn exchange_mtu(&mut self) -> Result<u16, BleError>;

    /// Kick off pairing/encryption as the initiator.
    async fn initiate_security(&mut self) -> Result<(), BleError>;

    /// Answer a PIN-entry request.
    async fn inject_passkey(&mut self, passkey: u32);

    /// Answer a numeric-comparison request positively.
    async fn confirm_numeric_comparison(&mut self);

    /// Drop the stored bond for `peer` so pairing can rerun.
    async fn delete_bond(&mut self, peer: PeerAddr);

    /// All primary services: 128-bit UUID plus handle range.
    async fn discover_services(&mut self) -> Result<Vec<([u8; 16], HandleRange)>, BleError>;

    /// All characteristics in a range: declared properties plus value
    /// handle.
    async fn discover_characteristics(
        &mut self,
        range: HandleRange,
    ) -> Result<Vec<(u8, u16)>, BleError>;

    /// All descriptors in a range: 16-bit UUID plus handle.
    async fn discover_descriptors(
        &mut self,
        range: HandleRange,
    ) -> Result<Vec<(u16, u16)>, BleError>;

    /// Write a CCCD value and wait for the acknowledgement.
    async fn write_cccd(&mut self, handle: u16, value: [u8; 2]) -> Result<(), BleError>;

    /// Write without response to a value handle.
    async fn write_no_response(&mut self, handle: u16, data: &[u8]) -> Result<(), BleError>;

    /// Wait for the next asynchronous link event.
    async fn next_event(&mut self) -> LinkEvent;

    /// Terminate the connection.  Safe to call on a dead link.
    async fn disconnect(&mut self);
}
