// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Target session management.
//!
//! `DebugInterface` owns the transaction layer and the session state: it
//! connects (wakes the target out of dormant or JTAG state, reads IDCODE,
//! powers the debug domain, configures the MEM-AP), identifies the nRF52,
//! and provides word and bulk memory access for the layers above.

use embassy_time::{Duration, Instant, Timer};
use esp_hal::gpio::{InputPin, OutputPin};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::arm::ap::IdrRegister;
use nightjar_core::arm::dp::{CtrlStat, CtrlStatRegister, IdCode, IdCodeRegister};
use nightjar_core::arm::map::Csw;
use nightjar_core::arm::register::RegisterDescriptor;
use nightjar_core::nrf;

use crate::SwdError;
use crate::interface::SwdInterface;
use crate::protocol::Speed;

// The MEM-AP sits at AP index 0 on every nRF52
pub(crate) const MEM_AP_INDEX: u8 = 0;

// Budget for the debug power-up handshake
const POWER_UP_TIMEOUT: Duration = Duration::from_millis(100);

// Pause after the wire sequences before the first IDCODE read
const POST_SEQUENCE_SETTLE: Duration = Duration::from_micros(500);

/// A debug session with an nRF52 target.
///
/// Create from the session pins, then [`Self::connect`].  All operations
/// borrow the session mutably, so the borrow checker enforces the
/// single-writer rule the wire requires.
#[derive(Debug)]
pub struct DebugInterface<'a> {
    swd: SwdInterface<'a>,
    idcode: Option<IdCode>,
    details: Option<nrf::Nrf52>,
}

impl<'a> DebugInterface<'a> {
    pub fn new(swd: SwdInterface<'a>) -> Self {
        Self {
            swd,
            idcode: None,
            details: None,
        }
    }

    pub fn from_pins(
        swdio_pin: impl InputPin + OutputPin + 'a,
        swclk_pin: impl OutputPin + 'a,
        nreset_pin: Option<impl OutputPin + 'a>,
    ) -> Self {
        Self::new(SwdInterface::from_pins(swdio_pin, swclk_pin, nreset_pin))
    }

    /// Access the transaction layer, for raw register work (the CTRL-AP
    /// path needs it).
    pub fn swd_if(&mut self) -> &mut SwdInterface<'a> {
        &mut self.swd
    }

    pub fn speed(&self) -> Speed {
        self.swd.speed()
    }

    pub fn set_speed(&mut self, speed: Speed) {
        self.swd.set_speed(speed);
    }

    /// IDCODE from the last successful connect, if any.
    pub fn idcode(&self) -> Option<IdCode> {
        self.idcode
    }

    /// Identification details from the last successful connect, if the
    /// part was readable.
    pub fn details(&self) -> Option<nrf::Nrf52> {
        self.details
    }

    /// Whether a session was established and has not been torn down.  Does
    /// not touch the wire; use [`Self::is_connected`] to verify the target
    /// is still there.
    pub fn session_active(&self) -> bool {
        self.idcode.is_some()
    }

    /// Establish a debug session.
    ///
    /// Tries the dormant wakeup first (nRF52840 DPs ship SWD v2 capable);
    /// if no valid IDCODE appears, falls back to line reset plus the
    /// JTAG-to-SWD switch.  Then clears sticky errors, runs the debug
    /// power-up handshake, and installs the 32-bit auto-incrementing CSW
    /// on MEM-AP 0.
    pub async fn connect(&mut self) -> Result<IdCode, SwdError> {
        self.idcode = None;
        self.details = None;

        info!("Exec:  SWD connect");

        let idcode = match self.try_wake_dormant().await {
            Ok(idcode) => idcode,
            Err(e) => {
                debug!("Note:  dormant wakeup failed ({e}), trying JTAG-to-SWD");
                self.try_jtag_to_swd().await?
            }
        };

        // Clear any sticky errors left from a previous session
        self.swd.clear_errors().await?;

        // Power up the debug and system domains
        self.power_up_debug_domain().await?;

        // 32-bit auto-incrementing accesses on MEM-AP 0
        self.swd
            .configure_csw(MEM_AP_INDEX, Csw::default().into())
            .await?;

        // Confirm something MEM-AP-shaped is there
        let idr = self.swd.ap_read(MEM_AP_INDEX, IdrRegister::ADDRESS).await?;
        trace!("Value: MEM-AP IDR 0x{idr:08X}");

        self.idcode = Some(idcode);

        // Identification is best-effort: a protected target fails here but
        // the session (and the CTRL-AP escape hatch) is still usable.
        match self.read_details().await {
            Ok(details) => {
                info!("OK:    Connected: IDCODE {idcode}, {details}");
                self.details = Some(details);
            }
            Err(e) => {
                info!("OK:    Connected: IDCODE {idcode} (identification failed: {e})");
            }
        }

        Ok(idcode)
    }

    async fn try_wake_dormant(&mut self) -> Result<IdCode, SwdError> {
        self.swd.protocol().dormant_wakeup();
        self.swd.invalidate_select();
        Timer::after(POST_SEQUENCE_SETTLE).await;
        self.read_idcode_checked().await
    }

    async fn try_jtag_to_swd(&mut self) -> Result<IdCode, SwdError> {
        self.swd.protocol().line_reset();
        self.swd.protocol().jtag_to_swd();
        self.swd.invalidate_select();
        Timer::after(POST_SEQUENCE_SETTLE).await;
        self.read_idcode_checked().await
    }

    async fn read_idcode_checked(&mut self) -> Result<IdCode, SwdError> {
        let idcode = IdCode::from(self.swd.dp_read(IdCodeRegister::ADDRESS).await?);
        if !idcode.indicates_target() {
            return Err(SwdError::LinkLost);
        }
        Ok(idcode)
    }

    /// Request debug and system power and poll for both acknowledge bits.
    pub async fn power_up_debug_domain(&mut self) -> Result<(), SwdError> {
        self.swd
            .dp_write(CtrlStatRegister::ADDRESS, CtrlStat::POWER_UP_REQ.into())
            .await?;

        let deadline = Instant::now() + POWER_UP_TIMEOUT;
        loop {
            let status = CtrlStat::from(self.swd.dp_read(CtrlStatRegister::ADDRESS).await?);
            if status.powered_up() {
                debug!("OK:    Debug domain powered: {}", status.power_states());
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Error: debug power-up timed out: {}", status.power_states());
                return Err(SwdError::PowerUpTimeout);
            }
            Timer::after(Duration::from_millis(1)).await;
        }
    }

    /// Drop the session.  A line reset leaves the target unable to mistake
    /// later line noise for a protocol frame.
    pub fn disconnect(&mut self) {
        self.swd.protocol().line_reset();
        self.swd.invalidate_select();
        self.idcode = None;
        self.details = None;
        info!("OK:    SWD disconnected");
    }

    /// Verify the target is still present by re-reading IDCODE.  Clears
    /// the session state if it is not.
    pub async fn is_connected(&mut self) -> bool {
        if self.idcode.is_none() {
            return false;
        }
        match self.read_idcode_checked().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Note:  keepalive failed: {e}");
                self.idcode = None;
                self.details = None;
                false
            }
        }
    }

    /// Pulse the hardware reset line, if wired, and re-establish the
    /// session.
    pub async fn hard_reset(&mut self) -> Result<IdCode, SwdError> {
        if !self.swd.protocol().pulse_nreset().await {
            return Err(SwdError::Unsupported);
        }
        self.connect().await
    }

    /// Read a 32-bit word from target memory.
    pub async fn read_mem(&mut self, addr: u32) -> Result<u32, SwdError> {
        self.check_session()?;
        self.swd.mem_read32(MEM_AP_INDEX, addr).await
    }

    /// Write a 32-bit word to target memory.
    pub async fn write_mem(&mut self, addr: u32, data: u32) -> Result<(), SwdError> {
        self.check_session()?;
        self.swd.mem_write32(MEM_AP_INDEX, addr, data).await
    }

    /// Read a block of words from target memory.
    pub async fn read_mem_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), SwdError> {
        self.check_session()?;
        self.swd.mem_read_bulk(MEM_AP_INDEX, addr, buf).await
    }

    /// Write a block of words to target memory.
    pub async fn write_mem_bulk(&mut self, addr: u32, buf: &[u32]) -> Result<(), SwdError> {
        self.check_session()?;
        self.swd.mem_write_bulk(MEM_AP_INDEX, addr, buf).await
    }

    /// Read the UICR APPROTECT word and classify it.
    pub async fn read_approtect(&mut self) -> Result<(u32, nrf::Approtect), SwdError> {
        let raw = self.read_mem(nrf::uicr::APPROTECT).await?;
        Ok((raw, nrf::Approtect::from_raw(raw)))
    }

    fn check_session(&self) -> Result<(), SwdError> {
        if self.idcode.is_none() {
            return Err(SwdError::NotReady);
        }
        Ok(())
    }

    // Read FICR identification.  Fails on an APPROTECTed part - the
    // MEM-AP can't see the bus.
    async fn read_details(&mut self) -> Result<nrf::Nrf52, SwdError> {
        let part = self.swd.mem_read32(MEM_AP_INDEX, nrf::ficr::INFO_PART).await?;
        let variant = self
            .swd
            .mem_read32(MEM_AP_INDEX, nrf::ficr::INFO_VARIANT)
            .await?;
        let id_lo = self
            .swd
            .mem_read32(MEM_AP_INDEX, nrf::ficr::DEVICE_ID_0)
            .await?;
        let id_hi = self
            .swd
            .mem_read32(MEM_AP_INDEX, nrf::ficr::DEVICE_ID_1)
            .await?;
        let flash_kb = self
            .swd
            .mem_read32(MEM_AP_INDEX, nrf::ficr::INFO_FLASH)
            .await?;

        let details = nrf::Nrf52 {
            part,
            variant,
            device_id: (id_hi as u64) << 32 | id_lo as u64,
            flash_kb,
        };

        if !details.is_known_part() {
            warn!("Note:  unfamiliar part 0x{part:X} - NVMC layout assumed nRF52");
        }

        Ok(details)
    }
}
