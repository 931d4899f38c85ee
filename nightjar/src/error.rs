// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - firmware error type.
//!
//! One wrapper over the per-layer errors, plus the firmware's own kinds.
//! The HTTP surface maps these to `{success, message, code}` JSON bodies;
//! only malformed requests get a non-200 status.

use alloc::string::{String, ToString};
use core::fmt;

use nightjar_ble::BleError;
use nightjar_core::ihex::HexError;
use nightjar_swd::{FlashError, SwdError};

/// Firmware error type
#[derive(Debug, Clone, PartialEq)]
pub enum NightjarError {
    Swd(SwdError),
    Flash(FlashError),
    Hex(HexError),
    Ble(BleError),
    Proxy(ProxyKind),
    /// Operation called in a state that forbids it
    InvalidState(&'static str),
    /// Malformed request: bad path, body or query.  The only kind that
    /// maps to HTTP 400.
    BadRequest(&'static str),
    Internal(String),
}

/// TCP proxy failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Bind,
    Accept,
    ClientLimit,
    Send,
    Recv,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Bind => "bind",
            ProxyKind::Accept => "accept",
            ProxyKind::ClientLimit => "client limit",
            ProxyKind::Send => "send",
            ProxyKind::Recv => "recv",
        }
    }
}

impl NightjarError {
    /// Stable machine-readable code for the JSON surface.
    pub fn code(&self) -> &'static str {
        match self {
            NightjarError::Swd(e) => e.as_str(),
            NightjarError::Flash(e) => e.kind_str(),
            NightjarError::Hex(_) => "hex",
            NightjarError::Ble(e) => e.kind_str(),
            NightjarError::Proxy(kind) => kind.as_str(),
            NightjarError::InvalidState(_) => "invalid state",
            NightjarError::BadRequest(_) => "bad request",
            NightjarError::Internal(_) => "internal",
        }
    }

    /// Whether the HTTP surface should answer 400 rather than an
    /// application-level error in a 200.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, NightjarError::BadRequest(_))
    }
}

impl fmt::Display for NightjarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NightjarError::Swd(e) => write!(f, "{e}"),
            NightjarError::Flash(e) => write!(f, "{e}"),
            NightjarError::Hex(e) => write!(f, "hex parse error: {e}"),
            NightjarError::Ble(e) => write!(f, "{e}"),
            NightjarError::Proxy(kind) => write!(f, "proxy {} error", kind.as_str()),
            NightjarError::InvalidState(detail) => write!(f, "invalid state: {detail}"),
            NightjarError::BadRequest(detail) => write!(f, "bad request: {detail}"),
            NightjarError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl From<SwdError> for NightjarError {
    fn from(error: SwdError) -> Self {
        NightjarError::Swd(error)
    }
}

impl From<FlashError> for NightjarError {
    fn from(error: FlashError) -> Self {
        NightjarError::Flash(error)
    }
}

impl From<HexError> for NightjarError {
    fn from(error: HexError) -> Self {
        NightjarError::Hex(error)
    }
}

impl From<BleError> for NightjarError {
    fn from(error: BleError) -> Self {
        NightjarError::Ble(error)
    }
}

impl NightjarError {
    pub fn message(&self) -> String {
        self.to_string()
    }
}
