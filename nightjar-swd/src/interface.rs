// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! SWD transaction layer.
//!
//! `SwdInterface` wraps the raw wire protocol with the DAP's policy:
//!
//! * Up to ten attempts per transaction.  WAIT yields ~1 ms and retries;
//!   FAULT writes the sticky-error clear value to DP ABORT and retries.
//! * AP reads are posted - the result of one AP read is returned by the
//!   next DP RDBUFF read.  Callers never see this; [`Self::ap_read`]
//!   chains the RDBUFF fetch internally.
//! * DP SELECT is shadowed and only written when the AP index or register
//!   bank actually changes.
//! * `read_mem`/`write_mem` drive the MEM-AP TAR/DRW pair, re-writing TAR
//!   at the 1 KiB auto-increment wrap on bulk paths.

use core::fmt;
use embassy_time::{Duration, Timer};
use esp_hal::gpio::{InputPin, OutputPin};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::arm::dp::{Abort, AbortRegister, RdBuffRegister, Select, SelectRegister};
use nightjar_core::arm::map::{CswRegister, DrwRegister, TarRegister};
use nightjar_core::arm::register::RegisterDescriptor;

use crate::SwdError;
use crate::protocol::{RawResponse, Speed, SwdProtocol, parity32};

// Attempts per DAP transaction, covering WAIT and FAULT recovery
const TRANSACTION_ATTEMPTS: u32 = 10;

// Yield between WAIT retries
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(1);

// MEM-AP auto-increment wraps at this boundary; TAR must be re-written
// when a bulk access crosses it
const TAR_WRAP: u32 = 0x400;

/// A single DAP operation: DP or AP, read or write, one of the four
/// register addresses the 2-bit request field can carry.
///
/// The request byte is
/// `{start=1, APnDP, RnW, A[2], A[3], parity, stop=0, park=1}` with parity
/// over the four middle bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdOp {
    DpRead(u8),
    DpWrite(u8),
    ApRead(u8),
    ApWrite(u8),
}

impl SwdOp {
    pub(crate) fn request_byte(&self) -> u8 {
        // start=1 (bit 0), park=1 (bit 7); APnDP bit 1, RnW bit 2
        let (base, addr) = match self {
            SwdOp::DpRead(a) => (0x85, a),
            SwdOp::DpWrite(a) => (0x81, a),
            SwdOp::ApRead(a) => (0x87, a),
            SwdOp::ApWrite(a) => (0x83, a),
        };

        // A[3:2] occupy request bits 4:3
        let request = base | ((addr & 0x0C) << 1);

        // Parity over APnDP, RnW, A[2], A[3]
        let parity = parity32(((request >> 1) & 0xF) as u32) as u8;
        request | (parity << 5)
    }

    fn is_read(&self) -> bool {
        matches!(self, SwdOp::DpRead(_) | SwdOp::ApRead(_))
    }
}

impl fmt::Display for SwdOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwdOp::DpRead(a) => write!(f, "DP read 0x{a:02X}"),
            SwdOp::DpWrite(a) => write!(f, "DP write 0x{a:02X}"),
            SwdOp::ApRead(a) => write!(f, "AP read 0x{a:02X}"),
            SwdOp::ApWrite(a) => write!(f, "AP write 0x{a:02X}"),
        }
    }
}

/// The DAP transaction layer.
///
/// Create with [`Self::new`] from an [`SwdProtocol`], or let
/// `DebugInterface` do it.  One instance owns the wire for the life of the
/// session; its operations must be serialised by the caller (in this
/// firmware, the target task is the only caller).
#[derive(Debug)]
pub struct SwdInterface<'a> {
    protocol: SwdProtocol<'a>,
    // Last value written to DP SELECT, written lazily
    dp_select: Option<Select>,
}

impl<'a> SwdInterface<'a> {
    pub fn new(protocol: SwdProtocol<'a>) -> Self {
        Self {
            protocol,
            dp_select: None,
        }
    }

    pub fn from_pins(
        swdio_pin: impl InputPin + OutputPin + 'a,
        swclk_pin: impl OutputPin + 'a,
        nreset_pin: Option<impl OutputPin + 'a>,
    ) -> Self {
        Self::new(SwdProtocol::new(swdio_pin, swclk_pin, nreset_pin))
    }

    pub fn protocol(&mut self) -> &mut SwdProtocol<'a> {
        &mut self.protocol
    }

    pub fn speed(&self) -> Speed {
        self.protocol.speed()
    }

    pub fn set_speed(&mut self, speed: Speed) {
        self.protocol.set_speed(speed);
    }

    /// Forget the shadowed DP SELECT.  Call after any line reset or wakeup
    /// sequence - the target's SELECT is back at its reset value.
    pub fn invalidate_select(&mut self) {
        self.dp_select = None;
    }

    /// One DAP transaction with the full retry policy applied.
    ///
    /// This is the only path to the wire; everything else in the crate
    /// funnels through it.
    pub async fn transfer(&mut self, op: SwdOp, data: &mut u32) -> Result<(), SwdError> {
        let request = op.request_byte();
        let read = op.is_read();

        let mut parity_failures = 0u32;
        let mut last_error = SwdError::BusWait;

        for attempt in 0..TRANSACTION_ATTEMPTS {
            // Interrupts could stretch a clock phase mid-transaction;
            // keep each frame atomic
            let response =
                critical_section::with(|_| self.protocol.transact(request, read, data));
            match response {
                RawResponse::Ok => {
                    if attempt > 0 {
                        trace!("OK:    {op} after {attempt} retries");
                    }
                    return Ok(());
                }
                RawResponse::Wait => {
                    last_error = SwdError::BusWait;
                    Timer::after(WAIT_RETRY_DELAY).await;
                }
                RawResponse::Fault => {
                    last_error = SwdError::BusFault;
                    trace!("Fault: {op}, clearing sticky errors");
                    self.clear_sticky_errors();
                }
                RawResponse::ParityError => {
                    parity_failures += 1;
                    if parity_failures >= 2 {
                        debug!("Error: {op} parity failed twice");
                        return Err(SwdError::Protocol);
                    }
                    last_error = SwdError::Protocol;
                }
                RawResponse::NoAck(bits) => {
                    // Nothing on the wire - retrying won't help
                    debug!("Error: {op} no ACK ({bits:#05b})");
                    return Err(SwdError::NoAck(bits));
                }
            }
        }

        debug!("Error: {op} retries exhausted: {last_error}");
        Err(last_error)
    }

    // Fire-and-forget ABORT write to clear sticky errors after a FAULT.
    // Raw, single-shot - a retry loop here would recurse.
    fn clear_sticky_errors(&mut self) {
        let mut value = Abort::CLEAR_STICKY.into();
        let op = SwdOp::DpWrite(AbortRegister::ADDRESS);
        let _ = critical_section::with(|_| {
            self.protocol.transact(op.request_byte(), false, &mut value)
        });
    }

    /// Read a DP register by address.
    pub async fn dp_read(&mut self, addr: u8) -> Result<u32, SwdError> {
        let mut data = 0;
        self.transfer(SwdOp::DpRead(addr), &mut data).await?;
        Ok(data)
    }

    /// Write a DP register by address.  Keeps the SELECT shadow coherent
    /// if the caller writes SELECT directly.
    pub async fn dp_write(&mut self, addr: u8, data: u32) -> Result<(), SwdError> {
        let mut data = data;
        self.transfer(SwdOp::DpWrite(addr), &mut data).await?;
        if addr == SelectRegister::ADDRESS {
            self.dp_select = Some(Select::from(data));
        }
        Ok(())
    }

    /// Explicitly write DP ABORT with the sticky-error clear value.
    pub async fn clear_errors(&mut self) -> Result<(), SwdError> {
        self.dp_write(AbortRegister::ADDRESS, Abort::CLEAR_STICKY.into())
            .await
    }

    // Write DP SELECT if the wanted value differs from the shadow.
    async fn update_select(&mut self, select: Select) -> Result<(), SwdError> {
        if self.dp_select == Some(select) {
            return Ok(());
        }
        trace!("Exec:  DP SELECT {select}");
        let mut data = select.into();
        self.transfer(SwdOp::DpWrite(SelectRegister::ADDRESS), &mut data)
            .await?;
        self.dp_select = Some(select);
        Ok(())
    }

    /// Read an AP register.  Handles SELECT and the posted-read RDBUFF
    /// chase; the returned value is the result of *this* read.
    pub async fn ap_read(&mut self, ap_index: u8, addr: u8) -> Result<u32, SwdError> {
        self.update_select(Select::for_ap(ap_index, addr)).await?;

        // Issue the read; the data phase returns stale posted data
        let mut discard = 0;
        self.transfer(SwdOp::ApRead(addr & 0x0C), &mut discard)
            .await?;

        // RDBUFF completes it
        self.dp_read(RdBuffRegister::ADDRESS).await
    }

    /// Write an AP register.  Handles SELECT.
    pub async fn ap_write(&mut self, ap_index: u8, addr: u8, data: u32) -> Result<(), SwdError> {
        self.update_select(Select::for_ap(ap_index, addr)).await?;
        let mut data = data;
        self.transfer(SwdOp::ApWrite(addr & 0x0C), &mut data).await
    }

    /// Read a 32-bit word from target memory through the MEM-AP at
    /// `ap_index` (TAR write, DRW read).
    pub async fn mem_read32(&mut self, ap_index: u8, addr: u32) -> Result<u32, SwdError> {
        self.ap_write(ap_index, TarRegister::ADDRESS, addr).await?;
        self.ap_read(ap_index, DrwRegister::ADDRESS).await
    }

    /// Write a 32-bit word to target memory through the MEM-AP.
    pub async fn mem_write32(&mut self, ap_index: u8, addr: u32, data: u32) -> Result<(), SwdError> {
        self.ap_write(ap_index, TarRegister::ADDRESS, addr).await?;
        self.ap_write(ap_index, DrwRegister::ADDRESS, data).await
    }

    /// Read a run of words using CSW auto-increment, re-writing TAR at
    /// every 1 KiB wrap.  `addr` must be word-aligned.
    pub async fn mem_read_bulk(
        &mut self,
        ap_index: u8,
        addr: u32,
        buf: &mut [u32],
    ) -> Result<(), SwdError> {
        if addr % 4 != 0 {
            return Err(SwdError::InvalidArgument);
        }

        let mut remaining = buf;
        let mut current = addr;
        while !remaining.is_empty() {
            let to_boundary = ((TAR_WRAP - (current & (TAR_WRAP - 1))) / 4) as usize;
            let count = remaining.len().min(to_boundary);

            self.ap_write(ap_index, TarRegister::ADDRESS, current).await?;

            // First DRW read posts; each subsequent read drains the
            // previous one; RDBUFF drains the last.
            let mut discard = 0;
            self.transfer(SwdOp::ApRead(DrwRegister::ADDRESS), &mut discard)
                .await?;
            let (chunk, rest) = remaining.split_at_mut(count);
            for slot in chunk[..count - 1].iter_mut() {
                let mut data = 0;
                self.transfer(SwdOp::ApRead(DrwRegister::ADDRESS), &mut data)
                    .await?;
                *slot = data;
            }
            chunk[count - 1] = self.dp_read(RdBuffRegister::ADDRESS).await?;

            remaining = rest;
            current += (count * 4) as u32;
        }

        Ok(())
    }

    /// Write a run of words using CSW auto-increment, re-writing TAR at
    /// every 1 KiB wrap.  `addr` must be word-aligned.
    pub async fn mem_write_bulk(
        &mut self,
        ap_index: u8,
        addr: u32,
        buf: &[u32],
    ) -> Result<(), SwdError> {
        if addr % 4 != 0 {
            return Err(SwdError::InvalidArgument);
        }

        let mut remaining = buf;
        let mut current = addr;
        while !remaining.is_empty() {
            let to_boundary = ((TAR_WRAP - (current & (TAR_WRAP - 1))) / 4) as usize;
            let count = remaining.len().min(to_boundary);

            self.ap_write(ap_index, TarRegister::ADDRESS, current).await?;
            let (chunk, rest) = remaining.split_at(count);
            for &word in chunk {
                let mut data = word;
                self.transfer(SwdOp::ApWrite(DrwRegister::ADDRESS), &mut data)
                    .await?;
            }

            remaining = rest;
            current += (count * 4) as u32;
        }

        Ok(())
    }

    /// Write the MEM-AP CSW and read it back, accepting implementation
    /// variance in the read-only high bits.
    pub async fn configure_csw(&mut self, ap_index: u8, csw: u32) -> Result<(), SwdError> {
        self.ap_write(ap_index, CswRegister::ADDRESS, csw).await?;
        let readback = self.ap_read(ap_index, CswRegister::ADDRESS).await?;
        if readback & 0x00FF_FFFF != csw & 0x00FF_FFFF {
            warn!("CSW read-back mismatch: wrote 0x{csw:08X}, read 0x{readback:08X}");
        }
        Ok(())
    }
}
