// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! NVMC flash engine.
//!
//! Drives the nRF52's Non-Volatile Memory Controller over the MEM-AP:
//! page erase, word and buffer program, mass erase, and the
//! APPROTECT-disable sequence.  Every operation borrows the debug session
//! for its duration and retains nothing.
//!
//! Rules the hardware imposes, all enforced here:
//!
//! * CONFIG writes are verified by read-back, and READY must be stable
//!   (equal across two consecutive reads) before the next operation.
//! * CONFIG is restored to REN on every exit path, including errors.
//! * Programming can only clear bits - the destination must be erased
//!   (0xFF) wherever new data lands.

use core::fmt;
use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::nrf;

use crate::SwdError;
use crate::debug::DebugInterface;

// Budget waiting for READY before starting an operation
const READY_BUDGET: Duration = Duration::from_millis(100);

// Typical page erase time; sleep this long before polling
const ERASE_PAGE_DELAY: Duration = Duration::from_millis(90);

// Total page erase budget and poll interval
const ERASE_PAGE_BUDGET: Duration = Duration::from_millis(400);
const ERASE_PAGE_POLL: Duration = Duration::from_millis(10);

// Word program budget
const PROGRAM_BUDGET: Duration = Duration::from_millis(50);

// NVMC mass erase budget
const ERASE_ALL_BUDGET: Duration = Duration::from_millis(500);

// Poll READY at most this often during program/mass-erase waits
const READY_POLL: Duration = Duration::from_millis(1);

// During buffer programming, poll READY once per this many bytes rather
// than per word, to amortise wire round-trips
const PROGRAM_POLL_STRIDE: usize = 256;

/// Which phase of a flash operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashPhase {
    Erase,
    Program,
    Verify,
    Unlock,
}

impl FlashPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashPhase::Erase => "erase",
            FlashPhase::Program => "program",
            FlashPhase::Verify => "verify",
            FlashPhase::Unlock => "unlock",
        }
    }
}

/// A flash operation failure, carrying the phase and the address being
/// worked on when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashError {
    pub phase: FlashPhase,
    pub addr: u32,
    pub cause: FlashCause,
}

/// What actually went wrong underneath a [`FlashError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashCause {
    /// The underlying SWD transaction failed
    Swd(SwdError),
    /// The NVMC never reported READY within the operation's budget
    NvmcTimeout,
    /// CONFIG did not read back with the mode just written
    ConfigMismatch,
    /// Verification read something other than the expected value
    Mismatch { expected: u32, read: u32 },
    /// The destination is not erased where new data must land
    NotErased { read: u32 },
    /// Address or length out of range or misaligned
    Bounds,
    /// CTRL-AP ERASEALLSTATUS never reached idle
    UnlockTimeout,
}

impl FlashError {
    pub(crate) fn new(phase: FlashPhase, addr: u32, cause: FlashCause) -> Self {
        Self { phase, addr, cause }
    }

    pub fn kind_str(&self) -> &'static str {
        match self.cause {
            FlashCause::Swd(_) => "swd",
            FlashCause::NvmcTimeout => "nvmc timeout",
            FlashCause::ConfigMismatch => "config mismatch",
            FlashCause::Mismatch { .. } => "verify mismatch",
            FlashCause::NotErased { .. } => "not erased",
            FlashCause::Bounds => "out of range",
            FlashCause::UnlockTimeout => "unlock timeout",
        }
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flash {} failed at 0x{:08X}: ",
            self.phase.as_str(),
            self.addr
        )?;
        match &self.cause {
            FlashCause::Swd(e) => write!(f, "{e}"),
            FlashCause::Mismatch { expected, read } => {
                write!(f, "expected 0x{expected:08X}, read 0x{read:08X}")
            }
            FlashCause::NotErased { read } => {
                write!(f, "destination not erased (read 0x{read:08X})")
            }
            _ => write!(f, "{}", self.kind_str()),
        }
    }
}

impl serde::Serialize for FlashError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("FlashError", 3)?;
        state.serialize_field("phase", self.phase.as_str())?;
        state.serialize_field("addr", &self.addr)?;
        state.serialize_field("kind", self.kind_str())?;
        state.end()
    }
}

/// The NVMC engine.  Construct per operation around a borrowed session.
pub struct Nvmc<'d, 'a> {
    debug: &'d mut DebugInterface<'a>,
}

impl<'d, 'a> Nvmc<'d, 'a> {
    pub fn new(debug: &'d mut DebugInterface<'a>) -> Self {
        Self { debug }
    }

    /// Erase the page containing `addr` (the address is masked down to its
    /// page base) and verify it erased.
    pub async fn erase_page(&mut self, addr: u32) -> Result<(), FlashError> {
        let page = nrf::page_base(addr);
        if !nrf::in_flash(page, nrf::PAGE_SIZE as usize) {
            return Err(FlashError::new(FlashPhase::Erase, addr, FlashCause::Bounds));
        }

        debug!("Exec:  Erase page 0x{page:08X}");

        self.wait_ready(READY_BUDGET, FlashPhase::Erase, page).await?;
        self.set_config(nrf::nvmc::CONFIG_EEN, FlashPhase::Erase, page)
            .await?;

        let result = self.erase_page_inner(page).await;

        // REN is restored no matter how the erase went
        let restore = self
            .set_config(nrf::nvmc::CONFIG_REN, FlashPhase::Erase, page)
            .await;
        result?;
        restore?;

        self.verify_erased(page).await
    }

    async fn erase_page_inner(&mut self, page: u32) -> Result<(), FlashError> {
        self.write32(nrf::nvmc::ERASEPAGE, page, FlashPhase::Erase, page)
            .await?;

        // Typical erase is ~85 ms; sleep through it, then poll
        Timer::after(ERASE_PAGE_DELAY).await;
        self.poll_ready(
            ERASE_PAGE_BUDGET - ERASE_PAGE_DELAY,
            ERASE_PAGE_POLL,
            FlashPhase::Erase,
            page,
        )
        .await
    }

    // Sample the freshly erased page at its corners.  A single stale read
    // gets one re-read grace before the erase is declared failed.
    async fn verify_erased(&mut self, page: u32) -> Result<(), FlashError> {
        let offsets = [0, 4, 8, nrf::PAGE_SIZE - 4];
        for offset in offsets {
            let addr = page + offset;
            let mut value = self.read32(addr, FlashPhase::Verify).await?;
            if value != nrf::ERASED_WORD {
                Timer::after(Duration::from_millis(1)).await;
                value = self.read32(addr, FlashPhase::Verify).await?;
            }
            if value != nrf::ERASED_WORD {
                warn!("Error: page 0x{page:08X} not erased at 0x{addr:08X}: 0x{value:08X}");
                return Err(FlashError::new(
                    FlashPhase::Verify,
                    addr,
                    FlashCause::Mismatch {
                        expected: nrf::ERASED_WORD,
                        read: value,
                    },
                ));
            }
        }
        Ok(())
    }

    /// Program one word.  The destination must be erased.  Verification is
    /// the buffer layer's job.
    pub async fn program_word(&mut self, addr: u32, data: u32) -> Result<(), FlashError> {
        if addr % 4 != 0 {
            return Err(FlashError::new(
                FlashPhase::Program,
                addr,
                FlashCause::Bounds,
            ));
        }

        self.wait_ready(READY_BUDGET, FlashPhase::Program, addr).await?;
        self.set_config(nrf::nvmc::CONFIG_WEN, FlashPhase::Program, addr)
            .await?;

        let result = self.program_word_inner(addr, data).await;

        let restore = self
            .set_config(nrf::nvmc::CONFIG_REN, FlashPhase::Program, addr)
            .await;
        result?;
        restore
    }

    async fn program_word_inner(&mut self, addr: u32, data: u32) -> Result<(), FlashError> {
        self.write32(addr, data, FlashPhase::Program, addr).await?;
        self.poll_ready(PROGRAM_BUDGET, READY_POLL, FlashPhase::Program, addr)
            .await
    }

    /// Program a byte buffer at an arbitrary address.
    ///
    /// WEN is set once for the whole buffer.  An unaligned prefix or tail
    /// is handled by reading the existing word and patching the relevant
    /// bytes - which therefore must still be erased.  The aligned body is
    /// written word-by-word with READY polled every
    /// [`PROGRAM_POLL_STRIDE`] bytes and after the final word.  On
    /// completion the whole buffer is read back and compared.
    ///
    /// An empty buffer returns without touching the NVMC.
    pub async fn program_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        if !nrf::in_flash(addr, data.len()) {
            return Err(FlashError::new(
                FlashPhase::Program,
                addr,
                FlashCause::Bounds,
            ));
        }

        debug!("Exec:  Program {} bytes at 0x{addr:08X}", data.len());

        self.wait_ready(READY_BUDGET, FlashPhase::Program, addr).await?;
        self.set_config(nrf::nvmc::CONFIG_WEN, FlashPhase::Program, addr)
            .await?;

        let result = self.program_buffer_inner(addr, data).await;

        let restore = self
            .set_config(nrf::nvmc::CONFIG_REN, FlashPhase::Program, addr)
            .await;
        result?;
        restore?;

        self.verify_buffer(addr, data).await
    }

    async fn program_buffer_inner(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let mut addr = addr;
        let mut data = data;
        let mut since_poll = 0usize;

        // Unaligned prefix: patch into the existing (erased) word
        let misalign = (addr % 4) as usize;
        if misalign != 0 {
            let word_addr = addr & !3;
            let take = (4 - misalign).min(data.len());
            self.patch_word(word_addr, misalign, &data[..take]).await?;
            addr += take as u32;
            data = &data[take..];
        }

        // Aligned body
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.write32(addr, word, FlashPhase::Program, addr).await?;

            since_poll += 4;
            if since_poll >= PROGRAM_POLL_STRIDE {
                since_poll = 0;
                self.poll_ready(PROGRAM_BUDGET, READY_POLL, FlashPhase::Program, addr)
                    .await?;
            }
            addr += 4;
        }

        // Unaligned tail, symmetric with the prefix
        let tail = chunks.remainder();
        if !tail.is_empty() {
            self.patch_word(addr, 0, tail).await?;
            addr += tail.len() as u32;
        }

        // Final settle regardless of where the stride left us
        self.poll_ready(PROGRAM_BUDGET, READY_POLL, FlashPhase::Program, addr)
            .await
    }

    // Merge `bytes` into the word at `word_addr` starting at `offset`.
    // The bytes being replaced must read as erased.
    async fn patch_word(
        &mut self,
        word_addr: u32,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), FlashError> {
        let existing = self.read32(word_addr, FlashPhase::Program).await?;
        let mut merged = existing.to_le_bytes();
        for (ii, &byte) in bytes.iter().enumerate() {
            if merged[offset + ii] != nrf::ERASED_BYTE {
                warn!("Error: partial word at 0x{word_addr:08X} not erased");
                return Err(FlashError::new(
                    FlashPhase::Program,
                    word_addr,
                    FlashCause::NotErased { read: existing },
                ));
            }
            merged[offset + ii] = byte;
        }

        self.write32(
            word_addr,
            u32::from_le_bytes(merged),
            FlashPhase::Program,
            word_addr,
        )
        .await?;
        self.poll_ready(PROGRAM_BUDGET, READY_POLL, FlashPhase::Program, word_addr)
            .await
    }

    // Read the programmed range back and compare byte-for-byte.
    async fn verify_buffer(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let word_base = addr & !3;
        let span = (addr - word_base) as usize + data.len();
        let word_count = span.div_ceil(4);

        let mut words = alloc::vec![0u32; word_count];
        self.debug
            .read_mem_bulk(word_base, &mut words)
            .await
            .map_err(|e| FlashError::new(FlashPhase::Verify, word_base, FlashCause::Swd(e)))?;

        let offset = (addr - word_base) as usize;
        for (ii, &expected) in data.iter().enumerate() {
            let pos = offset + ii;
            let read = words[pos / 4].to_le_bytes()[pos % 4];
            if read != expected {
                let fail_addr = addr + ii as u32;
                warn!(
                    "Error: verify mismatch at 0x{fail_addr:08X}: wrote 0x{expected:02X}, read 0x{read:02X}"
                );
                return Err(FlashError::new(
                    FlashPhase::Verify,
                    fail_addr,
                    FlashCause::Mismatch {
                        expected: expected as u32,
                        read: read as u32,
                    },
                ));
            }
        }
        Ok(())
    }

    /// NVMC mass erase: clears the flash array.  Does not touch UICR and
    /// does not clear APPROTECT - that needs the CTRL-AP path.
    pub async fn erase_all(&mut self) -> Result<(), FlashError> {
        info!("Exec:  NVMC mass erase");

        self.wait_ready(READY_BUDGET, FlashPhase::Erase, nrf::nvmc::ERASEALL)
            .await?;
        self.set_config(nrf::nvmc::CONFIG_EEN, FlashPhase::Erase, nrf::nvmc::ERASEALL)
            .await?;

        let result = async {
            self.write32(nrf::nvmc::ERASEALL, 1, FlashPhase::Erase, nrf::FLASH_BASE)
                .await?;
            self.poll_ready(
                ERASE_ALL_BUDGET,
                ERASE_PAGE_POLL,
                FlashPhase::Erase,
                nrf::FLASH_BASE,
            )
            .await
        }
        .await;

        let restore = self
            .set_config(nrf::nvmc::CONFIG_REN, FlashPhase::Erase, nrf::FLASH_BASE)
            .await;
        result?;
        restore
    }

    /// Disable APPROTECT the NVMC way: mass erase, program the HwDisabled
    /// sentinel into UICR.APPROTECT, reset the target and confirm the
    /// readback.
    ///
    /// Requires a working MEM-AP; a target already locked out needs the
    /// CTRL-AP unlock instead.
    pub async fn disable_approtect(&mut self) -> Result<(), FlashError> {
        let uicr = nrf::uicr::APPROTECT;

        let (current, status) = self
            .debug
            .read_approtect()
            .await
            .map_err(|e| FlashError::new(FlashPhase::Unlock, uicr, FlashCause::Swd(e)))?;
        if status == nrf::Approtect::HwDisabled {
            info!("Note:  APPROTECT already HwDisabled");
            return Ok(());
        }
        info!("Exec:  Disable APPROTECT (currently 0x{current:08X} / {status})");

        // The UICR word can only be reprogrammed from erased state
        self.erase_all().await?;

        self.wait_ready(READY_BUDGET, FlashPhase::Unlock, uicr).await?;
        self.set_config(nrf::nvmc::CONFIG_WEN, FlashPhase::Unlock, uicr)
            .await?;

        let result = async {
            self.write32(uicr, nrf::uicr::APPROTECT_HW_DISABLED, FlashPhase::Unlock, uicr)
                .await?;
            self.poll_ready(ERASE_ALL_BUDGET, READY_POLL, FlashPhase::Unlock, uicr)
                .await
        }
        .await;

        let restore = self
            .set_config(nrf::nvmc::CONFIG_REN, FlashPhase::Unlock, uicr)
            .await;
        result?;
        restore?;

        // UICR changes latch at reset
        match self.debug.hard_reset().await {
            Ok(_) => {}
            Err(SwdError::Unsupported) => {
                // No reset line wired; reconnect and hope the caller power
                // cycles before relying on the new state
                warn!("Note:  no nRESET pin - APPROTECT state latches at next power cycle");
                self.debug
                    .connect()
                    .await
                    .map_err(|e| FlashError::new(FlashPhase::Unlock, uicr, FlashCause::Swd(e)))?;
            }
            Err(e) => {
                return Err(FlashError::new(FlashPhase::Unlock, uicr, FlashCause::Swd(e)));
            }
        }

        let (readback, status) = self
            .debug
            .read_approtect()
            .await
            .map_err(|e| FlashError::new(FlashPhase::Unlock, uicr, FlashCause::Swd(e)))?;
        if status != nrf::Approtect::HwDisabled {
            warn!("Error: APPROTECT readback 0x{readback:08X} after disable");
            return Err(FlashError::new(
                FlashPhase::Unlock,
                uicr,
                FlashCause::Mismatch {
                    expected: nrf::uicr::APPROTECT_HW_DISABLED,
                    read: readback,
                },
            ));
        }

        info!("OK:    APPROTECT HwDisabled");
        Ok(())
    }

    // Set the NVMC mode, verify it took, and require READY stable across
    // two consecutive reads before the next operation.
    async fn set_config(
        &mut self,
        mode: u32,
        phase: FlashPhase,
        op_addr: u32,
    ) -> Result<(), FlashError> {
        self.write32(nrf::nvmc::CONFIG, mode, phase, op_addr).await?;

        let readback = self.read32(nrf::nvmc::CONFIG, phase).await?;
        if readback & nrf::nvmc::CONFIG_MASK != mode {
            error!("Error: NVMC CONFIG={mode} did not take (read 0x{readback:08X})");
            return Err(FlashError::new(phase, op_addr, FlashCause::ConfigMismatch));
        }

        // Two equal consecutive READY samples
        let deadline = Instant::now() + READY_BUDGET;
        let mut previous = None;
        loop {
            let ready = self.read32(nrf::nvmc::READY, phase).await? & 1;
            if previous == Some(ready) && ready == 1 {
                return Ok(());
            }
            previous = Some(ready);
            if Instant::now() >= deadline {
                return Err(FlashError::new(phase, op_addr, FlashCause::NvmcTimeout));
            }
            Timer::after(READY_POLL).await;
        }
    }

    async fn wait_ready(
        &mut self,
        budget: Duration,
        phase: FlashPhase,
        op_addr: u32,
    ) -> Result<(), FlashError> {
        self.poll_ready(budget, READY_POLL, phase, op_addr).await
    }

    async fn poll_ready(
        &mut self,
        budget: Duration,
        interval: Duration,
        phase: FlashPhase,
        op_addr: u32,
    ) -> Result<(), FlashError> {
        let deadline = Instant::now() + budget;
        loop {
            let ready = self.read32(nrf::nvmc::READY, phase).await?;
            if ready & 1 != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!("Error: NVMC READY timeout ({} phase)", phase.as_str());
                return Err(FlashError::new(phase, op_addr, FlashCause::NvmcTimeout));
            }
            Timer::after(interval).await;
        }
    }

    async fn read32(&mut self, addr: u32, phase: FlashPhase) -> Result<u32, FlashError> {
        self.debug
            .read_mem(addr)
            .await
            .map_err(|e| FlashError::new(phase, addr, FlashCause::Swd(e)))
    }

    async fn write32(
        &mut self,
        addr: u32,
        data: u32,
        phase: FlashPhase,
        op_addr: u32,
    ) -> Result<(), FlashError> {
        self.debug
            .write_mem(addr, data)
            .await
            .map_err(|e| FlashError::new(phase, op_addr, FlashCause::Swd(e)))
    }
}
