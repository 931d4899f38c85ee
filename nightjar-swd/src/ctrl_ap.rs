// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! CTRL-AP recovery.
//!
//! When APPROTECT is enabled the MEM-AP cannot see flash or UICR, so the
//! NVMC path is useless.  Nordic's CTRL-AP stays reachable and offers
//! ERASEALL, which wipes flash, UICR and the protection state together.
//! This module finds the CTRL-AP, runs the erase, and re-establishes the
//! MEM-AP session afterwards.

use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::arm::ap::{Idr, IdrRegister};
use nightjar_core::arm::ctrl_ap::{
    self, ApprotectStatus, ApprotectStatusRegister, EraseAll, EraseAllRegister,
    EraseAllStatusRegister, Reset, ResetRegister,
};
use nightjar_core::arm::register::RegisterDescriptor;
use nightjar_core::nrf;

use crate::SwdError;
use crate::debug::DebugInterface;
use crate::flash::{FlashCause, FlashError, FlashPhase};

// The erase can take over a minute on some samples
const ERASE_ALL_BUDGET: Duration = Duration::from_secs(120);
const ERASE_ALL_POLL: Duration = Duration::from_millis(100);

// Log while the status register sits unchanged this long
const STALL_LOG_INTERVAL: Duration = Duration::from_secs(5);

// Hold reset this long before starting the erase
const RESET_SETTLE: Duration = Duration::from_millis(10);

// Addresses sampled to confirm the erase really emptied the array
const VERIFY_SAMPLES: [u32; 5] = [0x0000_0000, 0x0000_1000, 0x0002_6000, 0x0008_0000, 0x000F_F000];

// AP index used when the scan finds nothing; every nRF52 wires the
// CTRL-AP at 1
const FALLBACK_AP_INDEX: u8 = 1;

/// Find the CTRL-AP by scanning AP IDRs for the Nordic pattern.
pub async fn find_ctrl_ap(debug: &mut DebugInterface<'_>) -> Result<u8, SwdError> {
    for ap_index in 0..=255u8 {
        // An unimplemented index reads zero on the nRF52; tolerate targets
        // that fault instead
        let idr = match debug.swd_if().ap_read(ap_index, IdrRegister::ADDRESS).await {
            Ok(raw) => Idr::new(raw),
            Err(e) => {
                trace!("Note:  AP {ap_index} IDR unreadable: {e}");
                continue;
            }
        };
        if !idr.is_present() {
            continue;
        }
        trace!("Value: AP {ap_index} IDR {idr}");
        if ctrl_ap::idr_matches(idr) {
            info!("OK:    CTRL-AP at index {ap_index} (IDR {idr})");
            return Ok(ap_index);
        }
    }

    warn!("Note:  no CTRL-AP IDR matched, falling back to AP {FALLBACK_AP_INDEX}");
    Ok(FALLBACK_AP_INDEX)
}

/// Full CTRL-AP mass erase and unlock.
///
/// On success the chip is blank, APPROTECT is released, and a fresh
/// MEM-AP session is up.  On [`FlashCause::UnlockTimeout`] the target is
/// in an indeterminate state and needs a power cycle before anything else
/// is attempted.
pub async fn mass_erase(debug: &mut DebugInterface<'_>) -> Result<(), FlashError> {
    let unlock_err = |e: SwdError| FlashError::new(FlashPhase::Unlock, 0, FlashCause::Swd(e));

    let ap = find_ctrl_ap(debug).await.map_err(unlock_err)?;

    // Informational only - the erase proceeds regardless
    match debug
        .swd_if()
        .ap_read(ap, ApprotectStatusRegister::ADDRESS)
        .await
    {
        Ok(status) => {
            let status = ApprotectStatus::from(status);
            info!(
                "Value: APPROTECTSTATUS 0x{:08X} ({})",
                u32::from(status),
                if status.enabled() { "protected" } else { "open" }
            );
        }
        Err(e) => debug!("Note:  APPROTECTSTATUS unreadable: {e}"),
    }

    // Hold the chip in reset and start the erase
    debug
        .swd_if()
        .ap_write(ap, ResetRegister::ADDRESS, Reset::ASSERT.into())
        .await
        .map_err(unlock_err)?;
    Timer::after(RESET_SETTLE).await;
    debug
        .swd_if()
        .ap_write(ap, EraseAllRegister::ADDRESS, EraseAll::START.into())
        .await
        .map_err(unlock_err)?;

    info!("Exec:  CTRL-AP ERASEALL started (budget {}s)", ERASE_ALL_BUDGET.as_secs());
    wait_erase_all(debug, ap).await?;

    // Release reset; the chip boots blank
    debug
        .swd_if()
        .ap_write(ap, ResetRegister::ADDRESS, Reset::RELEASE.into())
        .await
        .map_err(unlock_err)?;

    // The protection change takes effect with a fresh debug session
    debug.disconnect();
    Timer::after(Duration::from_millis(100)).await;
    debug.connect().await.map_err(unlock_err)?;

    verify_blank(debug).await?;

    info!("OK:    CTRL-AP unlock complete");
    Ok(())
}

async fn wait_erase_all(debug: &mut DebugInterface<'_>, ap: u8) -> Result<(), FlashError> {
    let deadline = Instant::now() + ERASE_ALL_BUDGET;
    let mut last_status: Option<u32> = None;
    let mut stalled_since = Instant::now();

    loop {
        let status = debug
            .swd_if()
            .ap_read(ap, EraseAllStatusRegister::ADDRESS)
            .await
            .map_err(|e| FlashError::new(FlashPhase::Unlock, 0, FlashCause::Swd(e)))?;

        if nightjar_core::arm::ctrl_ap::EraseAllStatus::from(status).idle() {
            return Ok(());
        }

        if last_status == Some(status) {
            if Instant::now() - stalled_since >= STALL_LOG_INTERVAL {
                info!("Note:  ERASEALLSTATUS unchanged at 0x{status:08X}, still waiting");
                stalled_since = Instant::now();
            }
        } else {
            last_status = Some(status);
            stalled_since = Instant::now();
        }

        if Instant::now() >= deadline {
            error!("Error: ERASEALLSTATUS never cleared - do not retry without a power cycle");
            return Err(FlashError::new(
                FlashPhase::Unlock,
                0,
                FlashCause::UnlockTimeout,
            ));
        }

        Timer::after(ERASE_ALL_POLL).await;
    }
}

// Sample flash across the array and read APPROTECT; everything must be
// erased.
async fn verify_blank(debug: &mut DebugInterface<'_>) -> Result<(), FlashError> {
    for addr in VERIFY_SAMPLES {
        let value = debug
            .read_mem(addr)
            .await
            .map_err(|e| FlashError::new(FlashPhase::Verify, addr, FlashCause::Swd(e)))?;
        if value != nrf::ERASED_WORD {
            warn!("Error: flash not blank after unlock: 0x{addr:08X} = 0x{value:08X}");
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

    let (raw, status) = debug
        .read_approtect()
        .await
        .map_err(|e| FlashError::new(FlashPhase::Verify, nrf::uicr::APPROTECT, FlashCause::Swd(e)))?;
    info!("Value: post-unlock APPROTECT 0x{raw:08X} ({status})");

    Ok(())
}
