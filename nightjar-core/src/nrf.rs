// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nRF52 target description: memory map, NVMC, UICR and FICR.
//!
//! Addresses and semantics are hard-coded to the nRF52 family; the nRF52840
//! is the primary target.

use alloc::format;
use alloc::string::String;
use core::fmt;
use core::ops::RangeInclusive;
use static_assertions::const_assert;

/// Flash base address
pub const FLASH_BASE: u32 = 0x0000_0000;

/// Flash size of the nRF52840 (1 MiB)
pub const FLASH_SIZE: u32 = 0x0010_0000;

/// Flash page size (4 KiB)
pub const PAGE_SIZE: u32 = 4096;

/// Value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Value of an erased flash word
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

const_assert!(FLASH_SIZE % PAGE_SIZE == 0);

/// NVMC peripheral registers
pub mod nvmc {
    /// NVMC peripheral base address
    pub const BASE: u32 = 0x4001_E000;

    /// READY register - bit 0 set when the NVMC will accept an operation
    pub const READY: u32 = BASE + 0x400;

    /// CONFIG register - selects read/write/erase mode
    pub const CONFIG: u32 = BASE + 0x504;

    /// ERASEPAGE register - write a page base address to erase it
    pub const ERASEPAGE: u32 = BASE + 0x508;

    /// ERASEALL register - write 1 to erase all flash (not UICR)
    pub const ERASEALL: u32 = BASE + 0x50C;

    /// CONFIG value: read-only (the resting state)
    pub const CONFIG_REN: u32 = 0;

    /// CONFIG value: write enabled
    pub const CONFIG_WEN: u32 = 1;

    /// CONFIG value: erase enabled
    pub const CONFIG_EEN: u32 = 2;

    /// Mask of the mode bits within CONFIG
    pub const CONFIG_MASK: u32 = 0x3;
}

/// UICR registers
pub mod uicr {
    /// UICR base address
    pub const BASE: u32 = 0x1000_1000;

    /// APPROTECT register
    pub const APPROTECT: u32 = 0x1000_1208;

    /// APPROTECT value meaning hardware-disabled protection
    pub const APPROTECT_HW_DISABLED: u32 = 0xFFFF_FF5A;

    /// APPROTECT value meaning protection enabled
    pub const APPROTECT_ENABLED: u32 = 0xFFFF_FF00;
}

/// FICR registers used for identification
pub mod ficr {
    /// FICR base address
    pub const BASE: u32 = 0x1000_0000;

    /// DEVICEID[0]
    pub const DEVICE_ID_0: u32 = BASE + 0x060;

    /// DEVICEID[1]
    pub const DEVICE_ID_1: u32 = BASE + 0x064;

    /// INFO.PART - reads e.g. 0x52840
    pub const INFO_PART: u32 = BASE + 0x100;

    /// INFO.VARIANT - ASCII-packed, e.g. "AAD0"
    pub const INFO_VARIANT: u32 = BASE + 0x104;

    /// INFO.FLASH - flash size in KiB
    pub const INFO_FLASH: u32 = BASE + 0x110;
}

/// Round an address down to its containing page base.
pub const fn page_base(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Iterate the page base addresses covering `[base, base + len)`.  An empty
/// range covers no pages.
pub fn pages_covering(base: u32, len: usize) -> impl Iterator<Item = u32> {
    let range = if len == 0 {
        None
    } else {
        let first = page_base(base);
        let last = page_base(base + (len as u32 - 1));
        Some((first..=last).step_by(PAGE_SIZE as usize))
    };
    range.into_iter().flatten()
}

/// Returns true if `[addr, addr + len)` lies inside the flash array.
pub fn in_flash(addr: u32, len: usize) -> bool {
    let Some(end) = addr.checked_add(len as u32) else {
        return false;
    };
    addr >= FLASH_BASE && end <= FLASH_BASE + FLASH_SIZE
}

/// Interpretation of a UICR.APPROTECT read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Approtect {
    /// 0xFFFFFF5A - protection disabled in hardware, debug access open
    HwDisabled,
    /// 0xFFFFFFFF - erased; on newer silicon revisions this still means
    /// protected until the HwDisabled value is programmed
    Erased,
    /// 0xFFFFFF00 - protection enabled
    Enabled,
    /// Anything else
    Unknown,
}

impl Approtect {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            uicr::APPROTECT_HW_DISABLED => Approtect::HwDisabled,
            ERASED_WORD => Approtect::Erased,
            uicr::APPROTECT_ENABLED => Approtect::Enabled,
            _ => Approtect::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Approtect::HwDisabled => "HwDisabled",
            Approtect::Erased => "Erased (Protected)",
            Approtect::Enabled => "Enabled",
            Approtect::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Approtect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identification details read from a connected nRF52.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Nrf52 {
    /// FICR INFO.PART, e.g. 0x52840
    pub part: u32,
    /// FICR INFO.VARIANT, ASCII packed
    pub variant: u32,
    /// FICR DEVICEID, 64 bits
    pub device_id: u64,
    /// FICR INFO.FLASH, flash size in KiB
    pub flash_kb: u32,
}

impl Nrf52 {
    /// The INFO.PART values this firmware recognises.
    pub const KNOWN_PARTS: RangeInclusive<u32> = 0x52800..=0x52840;

    pub fn is_known_part(&self) -> bool {
        Self::KNOWN_PARTS.contains(&self.part)
    }

    /// Decode INFO.VARIANT as its four ASCII characters, e.g. "AAD0".
    pub fn variant_str(&self) -> String {
        let bytes = self.variant.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            bytes.iter().map(|&b| b as char).collect()
        } else {
            format!("0x{:08X}", self.variant)
        }
    }
}

impl fmt::Display for Nrf52 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nRF{:X}-{} {}KB flash, device ID 0x{:016X}",
            self.part,
            self.variant_str(),
            self.flash_kb,
            self.device_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn page_base_masks_low_bits() {
        assert_eq!(page_base(0x26000), 0x26000);
        assert_eq!(page_base(0x26FFF), 0x26000);
        assert_eq!(page_base(0x27000), 0x27000);
        assert_eq!(page_base(0x123), 0);
    }

    #[test]
    fn pages_covering_spans_boundaries() {
        let pages: Vec<u32> = pages_covering(0x26000, 16).collect();
        assert_eq!(pages, [0x26000]);

        // 16 KiB starting mid-page covers 5 pages
        let pages: Vec<u32> = pages_covering(0x26800, 16 * 1024).collect();
        assert_eq!(pages, [0x26000, 0x27000, 0x28000, 0x29000, 0x2A000]);

        // Exactly one page, exactly aligned
        let pages: Vec<u32> = pages_covering(0x1000, 4096).collect();
        assert_eq!(pages, [0x1000]);

        // Zero length covers nothing
        assert_eq!(pages_covering(0x1000, 0).count(), 0);
    }

    #[test]
    fn flash_range_checks() {
        assert!(in_flash(0, FLASH_SIZE as usize));
        assert!(in_flash(0xFF000, 4096));
        assert!(!in_flash(0xFF000, 4097));
        assert!(!in_flash(uicr::APPROTECT, 4));
        assert!(!in_flash(0xFFFF_FFFF, 2));
    }

    #[test]
    fn approtect_classification() {
        assert_eq!(Approtect::from_raw(0xFFFF_FF5A), Approtect::HwDisabled);
        assert_eq!(Approtect::from_raw(0xFFFF_FFFF), Approtect::Erased);
        assert_eq!(Approtect::from_raw(0xFFFF_FF00), Approtect::Enabled);
        assert_eq!(Approtect::from_raw(0), Approtect::Unknown);
    }

    #[test]
    fn nrf52840_identity() {
        let nrf = Nrf52 {
            part: 0x52840,
            variant: u32::from_be_bytes(*b"AAD0"),
            device_id: 0x1234_5678_9ABC_DEF0,
            flash_kb: 1024,
        };
        assert!(nrf.is_known_part());
        assert_eq!(nrf.variant_str(), "AAD0");
    }
}
