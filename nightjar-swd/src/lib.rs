// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar-swd - ARM Serial Wire Debug for the nRF52 family.
//!
//! Drives a target's SWD port from two ESP32 GPIOs and layers up from
//! there:
//!
//! * [`SwdProtocol`] - the bit-banged wire protocol.
//! * [`SwdInterface`] - DP/AP transactions with retry and sticky-error
//!   recovery.
//! * [`DebugInterface`] - the target session: connect, identify, memory
//!   access.
//! * [`flash`] - the NVMC flash engine (erase, program, mass erase,
//!   APPROTECT disable).
//! * [`ctrl_ap`] - CTRL-AP recovery when APPROTECT locks the MEM-AP out.
//!
//! `no_std`, built on [embassy](https://embassy.dev/) and `esp-hal`, and
//! requires an `alloc` implementation.

#![no_std]

pub mod ctrl_ap;
pub mod debug;
pub mod flash;
pub mod interface;
pub mod protocol;

#[doc(inline)]
pub use crate::debug::DebugInterface;
#[doc(inline)]
pub use crate::flash::{FlashError, FlashPhase, Nvmc};
#[doc(inline)]
pub use crate::interface::SwdInterface;
#[doc(inline)]
pub use crate::protocol::SwdProtocol;

extern crate alloc;
use alloc::format;
use alloc::string::String;
use core::fmt;

/// Errors raised by the SWD transaction layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwdError {
    /// The target answered WAIT for the whole retry budget.
    BusWait,

    /// The target answered FAULT and the sticky error could not be cleared
    /// within the retry budget.
    BusFault,

    /// No recognisable ACK.  The value received is included; 7 means SWDIO
    /// floated high for the whole acknowledge phase, i.e. nothing is
    /// driving the line.
    NoAck(u8),

    /// Read data failed its parity check twice in succession.
    Protocol,

    /// The IDCODE read back as 0 or all-ones mid-session: the target has
    /// gone away (powered off, reset into APPROTECT, wires unplugged).
    LinkLost,

    /// The debug power-up handshake never acknowledged.
    PowerUpTimeout,

    /// An operation was attempted before the session was established.
    NotReady,

    /// The transaction succeeded but the operation did not take, e.g. a
    /// register write failed its read-back.
    OperationFailed(String),

    /// The API was called with bad arguments (alignment, range).
    InvalidArgument,

    /// The requested operation is not available on this target.
    Unsupported,
}

impl SwdError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwdError::BusWait => "bus wait",
            SwdError::BusFault => "bus fault",
            SwdError::NoAck(_) => "no ack",
            SwdError::Protocol => "protocol error",
            SwdError::LinkLost => "link lost",
            SwdError::PowerUpTimeout => "power-up timeout",
            SwdError::NotReady => "not ready",
            SwdError::OperationFailed(_) => "operation failed",
            SwdError::InvalidArgument => "invalid argument",
            SwdError::Unsupported => "unsupported",
        }
    }

    /// True if a fresh connect is the only plausible recovery.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            SwdError::NoAck(_)
                | SwdError::BusFault
                | SwdError::Protocol
                | SwdError::LinkLost
                | SwdError::PowerUpTimeout
        )
    }
}

impl fmt::Display for SwdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwdError::NoAck(ack) => write!(f, "{}: {ack}", self.as_str()),
            SwdError::OperationFailed(detail) => write!(f, "{}: {detail}", self.as_str()),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl serde::Serialize for SwdError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("SwdError", 2)?;
        state.serialize_field("kind", self.as_str())?;
        let detail = match self {
            SwdError::OperationFailed(detail) => detail.clone(),
            SwdError::NoAck(ack) => format!("{ack}"),
            _ => String::new(),
        };
        state.serialize_field("detail", &detail)?;
        state.end()
    }
}
