// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar-ble - BLE central logic for the serial bridge.
//!
//! The firmware tunnels a peripheral's serial service (Nordic UART or
//! Meshtastic) to TCP clients.  This crate holds everything about that
//! role that does not need a radio:
//!
//! * [`central`] - the connect → pair → discover → subscribe state
//!   machine, as a pure event-in/action-out Mealy machine.
//! * Link arithmetic: how a TCP payload is chunked to fit ATT writes.
//!
//! The firmware's BLE driver task feeds host-stack events in and executes
//! the returned actions; tests feed events in and assert on the actions.

#![cfg_attr(not(test), no_std)]

pub mod central;

extern crate alloc;
use alloc::string::String;
use core::fmt;

/// ATT writes spend 3 bytes on the opcode and handle, and the controller
/// caps payloads at 244 bytes regardless of the negotiated MTU.
pub const ATT_HEADER_LEN: u16 = 3;
pub const MAX_ATT_PAYLOAD: usize = 244;

/// Usable payload bytes per ATT write at the given MTU.
pub fn att_chunk_len(mtu: u16) -> usize {
    (mtu.saturating_sub(ATT_HEADER_LEN) as usize)
        .min(MAX_ATT_PAYLOAD)
        .max(1)
}

/// Number of ATT writes needed to carry `len` bytes at the given MTU.
pub fn chunk_count(len: usize, mtu: u16) -> usize {
    len.div_ceil(att_chunk_len(mtu))
}

/// BLE failures, tagged by the phase that raised them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    Connect(String),
    Pair(String),
    Encrypt(String),
    Discover(String),
    Subscribe(String),
    Send(String),
    /// Operation refused in the current state (e.g. connect while busy)
    InvalidState,
}

impl BleError {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BleError::Connect(_) => "connect",
            BleError::Pair(_) => "pair",
            BleError::Encrypt(_) => "encrypt",
            BleError::Discover(_) => "discover",
            BleError::Subscribe(_) => "subscribe",
            BleError::Send(_) => "send",
            BleError::InvalidState => "invalid state",
        }
    }

    fn detail(&self) -> &str {
        match self {
            BleError::Connect(d)
            | BleError::Pair(d)
            | BleError::Encrypt(d)
            | BleError::Discover(d)
            | BleError::Subscribe(d)
            | BleError::Send(d) => d,
            BleError::InvalidState => "",
        }
    }
}

impl fmt::Display for BleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = self.detail();
        if detail.is_empty() {
            write!(f, "ble {} error", self.kind_str())
        } else {
            write!(f, "ble {} error: {detail}", self.kind_str())
        }
    }
}

impl serde::Serialize for BleError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("BleError", 2)?;
        state.serialize_field("kind", self.kind_str())?;
        state.serialize_field("detail", self.detail())?;
        state.end()
    }
}

/// A six-byte BLE device address, stored in display order
/// (`XX:XX:XX:XX:XX:XX`, most significant first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerAddr(pub [u8; 6]);

impl PeerAddr {
    /// Parse the `XX:XX:XX:XX:XX:XX` form.
    pub fn parse(text: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = text.split(':');
        for byte in bytes.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(PeerAddr(bytes))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl serde::Serialize for PeerAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&alloc::format!("{self}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_matches_ceiling_division() {
        // Default 23-byte MTU carries 20 bytes per write
        assert_eq!(att_chunk_len(23), 20);
        assert_eq!(chunk_count(0, 23), 0);
        assert_eq!(chunk_count(1, 23), 1);
        assert_eq!(chunk_count(20, 23), 1);
        assert_eq!(chunk_count(21, 23), 2);
        assert_eq!(chunk_count(100, 23), 5);

        // Large MTUs cap at 244 usable bytes
        assert_eq!(att_chunk_len(517), 244);
        assert_eq!(chunk_count(244, 517), 1);
        assert_eq!(chunk_count(245, 517), 2);

        // Degenerate MTUs never divide by zero
        assert_eq!(att_chunk_len(0), 1);
        assert_eq!(att_chunk_len(3), 1);
    }

    #[test]
    fn peer_addr_round_trip() {
        let addr = PeerAddr::parse("C0:FF:EE:12:34:56").unwrap();
        assert_eq!(addr.to_string(), "C0:FF:EE:12:34:56");
        assert!(PeerAddr::parse("C0:FF:EE:12:34").is_none());
        assert!(PeerAddr::parse("C0:FF:EE:12:34:56:78").is_none());
        assert!(PeerAddr::parse("zz:FF:EE:12:34:56").is_none());
    }
}
